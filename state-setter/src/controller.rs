// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The reconciliation loop
//!
//! Each cycle takes a snapshot of the inventory and of every signal source,
//! decides what state each machine should be in, writes the decisions that
//! survive the grace period, and pushes retiring machines through
//! retirement. Cycles never overlap.

use crate::config::Config;
use crate::decision::{decide, Decision, Reason};
use crate::hysteresis::UnhealthyRegistry;
use crate::inventory::{HttpInventory, Inventory, SetStateError};
use crate::machine::{Machine, MachineState};
use crate::policy::{MachineType, Policies};
use crate::retirement::{CommandSecureErase, RetirementExecutor, SecureErase};
use crate::signals::alerts::{
    self, AlertmanagerClient, ResolvedAlerts, TriggerAlert,
};
use crate::signals::membership::{
    Member, Members, MembershipError, SerfMembership,
};
use crate::signals::metrics::{HttpMetricsSource, MetricsError};
use crate::signals::{
    AlertSource, MetricFamilies, Membership, MetricsSource, SignalBundle,
};
use chrono::{DateTime, Utc};
use slog::{debug, error, info, o, warn, Logger};
use slog_error_chain::{InlineErrorChain, SlogInlineError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

/// Timeout for requests to the inventory and the alert feed.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The external services a [`Controller`] reads from and acts on.
pub struct Collaborators {
    pub inventory: Arc<dyn Inventory>,
    pub membership: Arc<dyn Membership>,
    pub metrics: Arc<dyn MetricsSource>,
    /// `None` if no alert feed is configured.
    pub alerts: Option<Arc<dyn AlertSource>>,
    pub secure_erase: Arc<dyn SecureErase>,
}

/// Controller settings, usually taken from a [`Config`].
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub interval: Duration,
    pub parallelism: usize,
    pub metrics_timeout: Duration,
    pub dry_run: bool,
    pub machine_types: Vec<MachineType>,
    pub trigger_alerts: Vec<TriggerAlert>,
}

impl From<&Config> for ControllerConfig {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.interval,
            parallelism: config.parallelism,
            metrics_timeout: config.metrics.timeout,
            dry_run: config.dry_run,
            machine_types: config.machine_types.clone(),
            trigger_alerts: config
                .alert_monitor
                .as_ref()
                .map(|a| a.trigger_alerts.clone())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum CycleError {
    /// Without membership every machine would look unreachable, so nothing
    /// is decided at all.
    #[error("failed to query cluster membership")]
    Membership(#[from] MembershipError),
}

/// What happened during one reconciliation cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    /// The inventory couldn't be listed, so nothing else was done.
    pub skipped: bool,
    pub dry_run: bool,
    pub machines: usize,
    /// Alerts firing in the feed, whether or not a trigger matched them.
    pub alerts: usize,
    pub metrics_fetched: usize,
    pub metrics_failed: usize,
    /// State changes written (or, in a dry run, that would have been).
    pub transitions_committed: usize,
    /// Unhealthy verdicts still within their grace period.
    pub transitions_pending: usize,
    /// State changes the inventory refused as invalid.
    pub transitions_rejected: usize,
    pub transitions_failed: usize,
    pub retired: usize,
    pub retirement_failures: usize,
}

impl CycleReport {
    fn new(dry_run: bool) -> Self {
        Self {
            started_at: Utc::now(),
            skipped: false,
            dry_run,
            machines: 0,
            alerts: 0,
            metrics_fetched: 0,
            metrics_failed: 0,
            transitions_committed: 0,
            transitions_pending: 0,
            transitions_rejected: 0,
            transitions_failed: 0,
            retired: 0,
            retirement_failures: 0,
        }
    }

    fn skipped(dry_run: bool) -> Self {
        Self { skipped: true, ..Self::new(dry_run) }
    }

    fn log(&self, log: &Logger) {
        if self.skipped {
            info!(log, "reconciliation cycle skipped");
            return;
        }
        info!(
            log,
            "reconciliation cycle complete";
            "dry_run" => self.dry_run,
            "machines" => self.machines,
            "alerts" => self.alerts,
            "metrics_fetched" => self.metrics_fetched,
            "metrics_failed" => self.metrics_failed,
            "transitions_committed" => self.transitions_committed,
            "transitions_pending" => self.transitions_pending,
            "transitions_rejected" => self.transitions_rejected,
            "transitions_failed" => self.transitions_failed,
            "retired" => self.retired,
            "retirement_failures" => self.retirement_failures,
        );
    }
}

pub struct Controller {
    log: Logger,
    config: ControllerConfig,
    policies: Policies,
    inventory: Arc<dyn Inventory>,
    membership: Arc<dyn Membership>,
    metrics: Arc<dyn MetricsSource>,
    alerts: Option<Arc<dyn AlertSource>>,
    retirement: RetirementExecutor,
    registry: UnhealthyRegistry,
}

impl Controller {
    pub fn new(
        log: &Logger,
        config: ControllerConfig,
        collaborators: Collaborators,
    ) -> Self {
        let log = log.new(o!("component" => "Controller"));
        let Collaborators {
            inventory,
            membership,
            metrics,
            alerts,
            secure_erase,
        } = collaborators;
        Self {
            retirement: RetirementExecutor::new(
                &log,
                Arc::clone(&inventory),
                secure_erase,
            ),
            policies: Policies::new(config.machine_types.iter().cloned()),
            log,
            config,
            inventory,
            membership,
            metrics,
            alerts,
            registry: UnhealthyRegistry::new(),
        }
    }

    /// Builds a controller talking to the services described by `config`.
    pub fn from_config(
        log: &Logger,
        config: &Config,
    ) -> Result<Self, reqwest::Error> {
        let client =
            reqwest::ClientBuilder::new().timeout(REQUEST_TIMEOUT).build()?;
        let collaborators = Collaborators {
            inventory: Arc::new(HttpInventory::new(
                log.new(o!("component" => "HttpInventory")),
                client.clone(),
                &config.inventory.endpoint,
            )),
            membership: Arc::new(SerfMembership::new(
                config.membership.command.clone(),
            )),
            metrics: Arc::new(HttpMetricsSource::new(
                config.metrics.port,
                config.metrics.path.clone(),
                config.metrics.timeout,
            )?),
            alerts: config.alert_monitor.as_ref().map(|alert_monitor| {
                Arc::new(AlertmanagerClient::new(
                    client.clone(),
                    &alert_monitor.alertmanager_endpoint,
                )) as Arc<dyn AlertSource>
            }),
            secure_erase: Arc::new(CommandSecureErase::new(
                config.retirement.secure_erase_command.clone(),
            )),
        };
        Ok(Self::new(log, ControllerConfig::from(config), collaborators))
    }

    pub fn registry(&self) -> &UnhealthyRegistry {
        &self.registry
    }

    /// Runs a reconciliation cycle every `interval` until `shutdown` changes
    /// or its sender goes away.
    ///
    /// A cycle in progress always runs to completion; shutdown is only
    /// noticed between cycles.
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), CycleError> {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            self.log,
            "starting reconciliation loop";
            "interval" => ?self.config.interval,
            "dry_run" => self.config.dry_run,
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle(Instant::now()).await?;
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }

        info!(self.log, "reconciliation loop stopped");
        Ok(())
    }

    /// Runs a single reconciliation cycle as of `now`.
    ///
    /// Only a membership failure is an error. Every other failure is logged
    /// and counted in the report.
    pub async fn run_cycle(
        &mut self,
        now: Instant,
    ) -> Result<CycleReport, CycleError> {
        let mut report = CycleReport::new(self.config.dry_run);

        let machines = match self.inventory.list_machines().await {
            Ok(machines) => machines,
            Err(err) => {
                warn!(
                    self.log,
                    "failed to list machines";
                    InlineErrorChain::new(&err),
                );
                let report = CycleReport::skipped(self.config.dry_run);
                report.log(&self.log);
                return Ok(report);
            }
        };
        report.machines = machines.len();

        let members = self.membership.list_members().await.map_err(|err| {
            error!(
                self.log,
                "failed to query cluster membership";
                InlineErrorChain::new(&err),
            );
            err
        })?;

        let alerts = self.collect_alerts(&mut report).await;

        let mut metrics =
            self.collect_metrics(&machines, &members, &mut report).await;

        for machine in &machines {
            let bundle = SignalBundle {
                membership: member(&members, machine).cloned(),
                alert: alerts.for_machine(machine).cloned(),
                metrics: metrics.remove(&machine.serial),
            };
            let decision =
                decide(&bundle, self.policies.get(&machine.machine_type));
            self.apply(machine, decision, now, &mut report).await;
        }

        self.retire(&machines, &mut report).await;

        let serials: BTreeSet<&str> =
            machines.iter().map(|m| m.serial.as_str()).collect();
        self.registry.retain(&serials);

        report.log(&self.log);
        Ok(report)
    }

    /// Fetches firing alerts and matches them to machines. If the feed is
    /// unavailable the cycle carries on as if no alerts were firing.
    async fn collect_alerts(&self, report: &mut CycleReport) -> ResolvedAlerts {
        let Some(source) = &self.alerts else {
            return ResolvedAlerts::default();
        };
        match source.list_active_alerts().await {
            Ok(active) => {
                report.alerts = active.len();
                alerts::resolve(&self.config.trigger_alerts, &active)
            }
            Err(err) => {
                warn!(
                    self.log,
                    "failed to list alerts; ignoring alerts this cycle";
                    InlineErrorChain::new(&err),
                );
                ResolvedAlerts::default()
            }
        }
    }

    /// Fetches metrics, keyed by serial, from every live machine whose type
    /// has a metrics checklist.
    async fn collect_metrics(
        &self,
        machines: &[Machine],
        members: &Members,
        report: &mut CycleReport,
    ) -> BTreeMap<String, MetricFamilies> {
        let semaphore = Arc::new(Semaphore::new(self.config.parallelism));
        let mut tasks = JoinSet::new();
        // Machines that aren't alive members are unreachable whatever their
        // metrics say.
        let wanted = machines.iter().filter_map(|m| {
            let alive = member(members, m).is_some_and(|m| m.is_alive());
            let address = m.address.as_ref()?;
            (alive && self.policies.wants_metrics(&m.machine_type))
                .then_some((m.serial.clone(), address.clone()))
        });
        for (serial, address) in wanted {
            let source = Arc::clone(&self.metrics);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.config.metrics_timeout;
            tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = semaphore.acquire_owned().await.ok();
                let result = fetch_metrics(&*source, address, timeout).await;
                (serial, result)
            });
        }

        let mut results = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((serial, Ok(families))) => {
                    report.metrics_fetched += 1;
                    results.insert(serial, families);
                }
                Ok((serial, Err(err))) => {
                    report.metrics_failed += 1;
                    warn!(
                        self.log,
                        "failed to fetch metrics";
                        "serial" => serial,
                        InlineErrorChain::new(&err),
                    );
                }
                Err(err) => {
                    report.metrics_failed += 1;
                    error!(
                        self.log,
                        "metrics fetch task failed";
                        InlineErrorChain::new(&err),
                    );
                }
            }
        }
        results
    }

    async fn apply(
        &mut self,
        machine: &Machine,
        decision: Decision,
        now: Instant,
        report: &mut CycleReport,
    ) {
        let serial = machine.serial.as_str();
        let log = self.log.new(o!(
            "serial" => machine.serial.clone(),
            "current_state" => machine.state.as_str(),
        ));

        let Decision::Transition { state, immediate, reason } = decision
        else {
            debug!(log, "not enough information to decide");
            self.registry.clear(serial);
            return;
        };

        // A streak only counts toward a change that could actually be
        // written, so updating and retiring machines never accumulate one.
        if state != MachineState::Unhealthy
            || state == machine.state
            || !machine.state.can_transition_to(state)
        {
            self.registry.clear(serial);
        }
        if state == machine.state {
            return;
        }
        if !machine.state.can_transition_to(state) {
            debug!(
                log,
                "decided state can't be reached from current state";
                "decided_state" => state.as_str(),
                "reason" => %reason,
            );
            return;
        }

        let hysteresis = state == MachineState::Unhealthy && !immediate;
        if hysteresis {
            let grace_period =
                self.policies.grace_period(&machine.machine_type);
            if !self.registry.register_unhealthy(serial, grace_period, now) {
                info!(
                    log,
                    "machine is unhealthy; waiting out grace period";
                    "reason" => %reason,
                    "grace_period" => ?grace_period,
                );
                report.transitions_pending += 1;
                return;
            }
        }

        if self.commit(&log, machine, state, &reason, report).await
            && hysteresis
        {
            self.registry.clear(serial);
        }
    }

    /// Writes `state` for `machine`, returning true if it was written.
    async fn commit(
        &self,
        log: &Logger,
        machine: &Machine,
        state: MachineState,
        reason: &Reason,
        report: &mut CycleReport,
    ) -> bool {
        if self.config.dry_run {
            info!(
                log,
                "would change machine state (dry run)";
                "new_state" => state.as_str(),
                "reason" => %reason,
            );
            report.transitions_committed += 1;
            return true;
        }

        match self.inventory.set_state(&machine.serial, state).await {
            Ok(()) => {
                info!(
                    log,
                    "changed machine state";
                    "new_state" => state.as_str(),
                    "reason" => %reason,
                );
                report.transitions_committed += 1;
                true
            }
            Err(err @ SetStateError::InvalidTransition { .. }) => {
                // The machine changed state since it was listed.
                debug!(
                    log,
                    "state change rejected";
                    InlineErrorChain::new(&err),
                );
                report.transitions_rejected += 1;
                false
            }
            Err(err @ SetStateError::Other(_)) => {
                warn!(
                    log,
                    "failed to change machine state";
                    "new_state" => state.as_str(),
                    InlineErrorChain::new(&err),
                );
                report.transitions_failed += 1;
                false
            }
        }
    }

    /// Retires every machine that was retiring when the cycle started, one at
    /// a time. Retirement only needs the serial, so machines without an
    /// address are retired too.
    async fn retire(&self, machines: &[Machine], report: &mut CycleReport) {
        let retiring =
            machines.iter().filter(|m| m.state == MachineState::Retiring);
        for machine in retiring {
            if self.config.dry_run {
                info!(
                    self.log,
                    "would retire machine (dry run)";
                    "serial" => &machine.serial,
                );
                report.retired += 1;
                continue;
            }
            match self.retirement.retire(machine).await {
                Ok(()) => report.retired += 1,
                Err(err) => {
                    warn!(
                        self.log,
                        "failed to retire machine";
                        "serial" => &machine.serial,
                        InlineErrorChain::new(&err),
                    );
                    report.retirement_failures += 1;
                }
            }
        }
    }
}

/// The membership record for `machine`. A machine without an address has
/// none.
fn member<'a>(members: &'a Members, machine: &Machine) -> Option<&'a Member> {
    machine.address.as_ref().and_then(|address| members.get(address))
}

async fn fetch_metrics(
    source: &dyn MetricsSource,
    address: String,
    timeout: Duration,
) -> Result<MetricFamilies, MetricsError> {
    let fetched = tokio::time::timeout(timeout, source.fetch(&address)).await;
    fetched.unwrap_or_else(|_| Err(MetricsError::Timeout { address }))
}
