// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Alerts that force a machine into a particular state
//!
//! The alert feed is free-form: alerts are just label sets. Operators
//! configure [`TriggerAlert`]s that say which alerts matter, which label
//! identifies the affected machine, and what state the machine should be put
//! in.

use super::membership::strip_port;
use crate::machine::{Machine, MachineState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;

/// Label carrying an alert's name.
pub const ALERT_NAME_LABEL: &str = "alertname";

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AlertMonitorConfig {
    /// Base URL of the Alertmanager API
    pub alertmanager_endpoint: String,
    #[serde(default)]
    pub trigger_alerts: Vec<TriggerAlert>,
}

/// An alert that, when firing, sets the state of the machine it names.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TriggerAlert {
    /// Value of the alert's `alertname` label.
    pub name: String,
    /// Additional labels the alert must carry with exactly these values.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Label holding the affected machine's address.
    #[serde(default)]
    pub address_label: Option<String>,
    /// Label holding the affected machine's serial.
    #[serde(default)]
    pub serial_label: Option<String>,
    pub state: AlertState,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TriggerAlertError {
    #[error(
        "trigger alert {0:?} sets both address-label and serial-label; \
         exactly one is required"
    )]
    BothTargetLabels(String),
    #[error(
        "trigger alert {0:?} sets neither address-label nor serial-label; \
         exactly one is required"
    )]
    NoTargetLabel(String),
}

/// How a trigger alert identifies the machine it's about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TargetLabel<'a> {
    Address(&'a str),
    Serial(&'a str),
}

impl TriggerAlert {
    pub fn validate(&self) -> Result<(), TriggerAlertError> {
        self.target_label().map(|_| ())
    }

    fn target_label(&self) -> Result<TargetLabel<'_>, TriggerAlertError> {
        match (&self.address_label, &self.serial_label) {
            (Some(address), None) => Ok(TargetLabel::Address(address)),
            (None, Some(serial)) => Ok(TargetLabel::Serial(serial)),
            (Some(_), Some(_)) => {
                Err(TriggerAlertError::BothTargetLabels(self.name.clone()))
            }
            (None, None) => {
                Err(TriggerAlertError::NoTargetLabel(self.name.clone()))
            }
        }
    }

    fn matches(&self, alert: &Alert) -> bool {
        alert.labels.get(ALERT_NAME_LABEL) == Some(&self.name)
            && self
                .labels
                .iter()
                .all(|(key, want)| alert.labels.get(key) == Some(want))
    }
}

/// State a trigger alert puts its machine in.
#[derive(
    Clone, Copy, Debug, Deserialize, PartialEq, Eq, PartialOrd, Ord, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    // Ordered by severity: when several alerts name one machine, the greatest
    // wins.
    Unhealthy,
    Unreachable,
}

impl From<AlertState> for MachineState {
    fn from(state: AlertState) -> Self {
        match state {
            AlertState::Unhealthy => MachineState::Unhealthy,
            AlertState::Unreachable => MachineState::Unreachable,
        }
    }
}

/// An alert as reported by the alert feed.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub labels: BTreeMap<String, String>,
}

impl Alert {
    pub fn new<K: ToString, V: ToString>(
        labels: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            labels: labels
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// A trigger alert that fired for a specific machine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineAlert {
    pub name: String,
    pub state: AlertState,
}

/// Firing trigger alerts, indexed by the machine they name.
#[derive(Clone, Debug, Default)]
pub struct ResolvedAlerts {
    by_serial: BTreeMap<String, MachineAlert>,
    by_address: BTreeMap<String, MachineAlert>,
}

impl ResolvedAlerts {
    /// Returns the most severe alert naming `machine` by serial or address.
    pub fn for_machine(&self, machine: &Machine) -> Option<&MachineAlert> {
        let by_serial = self.by_serial.get(&machine.serial);
        let by_address = machine
            .address
            .as_ref()
            .and_then(|address| self.by_address.get(address));
        match (by_serial, by_address) {
            (Some(a), Some(b)) => Some(if b.state > a.state { b } else { a }),
            (a, b) => a.or(b),
        }
    }
}

fn insert_worst(
    map: &mut BTreeMap<String, MachineAlert>,
    key: &str,
    alert: MachineAlert,
) {
    match map.get(key) {
        Some(existing) if existing.state >= alert.state => {}
        _ => {
            map.insert(key.to_string(), alert);
        }
    }
}

/// Matches `alerts` against `triggers`.
///
/// For each alert the first matching trigger (in configuration order) is
/// used. Alerts that lack the trigger's machine label are ignored. Address
/// label values may include a port, which is dropped.
pub fn resolve(triggers: &[TriggerAlert], alerts: &[Alert]) -> ResolvedAlerts {
    let mut resolved = ResolvedAlerts::default();
    for alert in alerts {
        let Some(trigger) = triggers.iter().find(|t| t.matches(alert)) else {
            continue;
        };
        // Triggers are validated when the configuration is loaded.
        let Ok(target) = trigger.target_label() else {
            continue;
        };
        let machine_alert =
            MachineAlert { name: trigger.name.clone(), state: trigger.state };
        match target {
            TargetLabel::Serial(label) => {
                if let Some(serial) = alert.labels.get(label) {
                    insert_worst(
                        &mut resolved.by_serial,
                        serial,
                        machine_alert,
                    );
                }
            }
            TargetLabel::Address(label) => {
                if let Some(address) = alert.labels.get(label) {
                    insert_worst(
                        &mut resolved.by_address,
                        strip_port(address),
                        machine_alert,
                    );
                }
            }
        }
    }
    resolved
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum AlertError {
    #[error("failed to list alerts from {url}")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("listing alerts from {url} returned {status}")]
    Status { url: String, status: reqwest::StatusCode },
}

#[async_trait]
pub trait AlertSource: Send + Sync {
    /// Lists alerts that are firing and not silenced or inhibited.
    async fn list_active_alerts(&self) -> Result<Vec<Alert>, AlertError>;
}

/// Reads alerts from the Alertmanager v2 API.
pub struct AlertmanagerClient {
    client: reqwest::Client,
    endpoint: String,
}

impl AlertmanagerClient {
    pub fn new(client: reqwest::Client, endpoint: &str) -> Self {
        Self { client, endpoint: endpoint.trim_end_matches('/').to_string() }
    }
}

#[derive(Deserialize)]
struct GettableAlert {
    labels: BTreeMap<String, String>,
    #[serde(default)]
    status: Option<GettableAlertStatus>,
}

#[derive(Deserialize)]
struct GettableAlertStatus {
    state: String,
}

#[async_trait]
impl AlertSource for AlertmanagerClient {
    async fn list_active_alerts(&self) -> Result<Vec<Alert>, AlertError> {
        let url = format!("{}/api/v2/alerts", self.endpoint);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("active", "true"),
                ("silenced", "false"),
                ("inhibited", "false"),
            ])
            .send()
            .await
            .map_err(|err| AlertError::Request { url: url.clone(), err })?;
        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Status { url, status });
        }
        let alerts: Vec<GettableAlert> = response
            .json()
            .await
            .map_err(|err| AlertError::Request { url, err })?;
        Ok(alerts
            .into_iter()
            .filter(|a| a.status.as_ref().map_or(true, |s| s.state == "active"))
            .map(|a| Alert { labels: a.labels })
            .collect())
    }
}
