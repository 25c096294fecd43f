// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Reduces the signals observed for a machine to a single state
//!
//! [`decide`] is pure: it doesn't look at the machine's current state, the
//! clock, or any history. Whether a decision is actually written to the
//! inventory is up to the controller.

use crate::machine::MachineState;
use crate::policy::{MachineType, TargetMetric};
use crate::selector;
use crate::signals::{AlertState, MemberStatus, MetricFamilies, SignalBundle};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Not enough is known yet to say anything about the machine.
    NoTransition,
    /// The machine should be in `state`.
    Transition {
        state: MachineState,
        /// If true, `state` is recorded without waiting out the grace
        /// period.
        immediate: bool,
        reason: Reason,
    },
}

impl Decision {
    fn transition(state: MachineState, reason: Reason) -> Decision {
        Decision::Transition { state, immediate: false, reason }
    }

    /// The state this decision asks for, if any.
    pub fn state(&self) -> Option<MachineState> {
        match self {
            Decision::NoTransition => None,
            Decision::Transition { state, .. } => Some(*state),
        }
    }
}

/// Why a [`Decision`] was made.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reason {
    NotAMember,
    MemberNotAlive(MemberStatus),
    Alert(String),
    SystemdUnitsFailed(String),
    UnknownMachineType,
    MetricMissing(String),
    NoMatchingSamples(String),
    TooFewHealthySamples { metric: String, healthy: usize, minimum: usize },
    ChecksPassed,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reason::NotAMember => write!(f, "not a cluster member"),
            Reason::MemberNotAlive(status) => {
                write!(f, "cluster member status is {status:?}")
            }
            Reason::Alert(name) => write!(f, "alert {name} is firing"),
            Reason::SystemdUnitsFailed(units) => {
                write!(f, "failed systemd units: {units}")
            }
            Reason::UnknownMachineType => write!(f, "unknown machine type"),
            Reason::MetricMissing(metric) => {
                write!(f, "metric {metric} is missing")
            }
            Reason::NoMatchingSamples(metric) => {
                write!(f, "no samples of {metric} match its selector")
            }
            Reason::TooFewHealthySamples { metric, healthy, minimum } => write!(
                f,
                "{healthy} healthy samples of {metric}, need at least {minimum}"
            ),
            Reason::ChecksPassed => write!(f, "all health checks passed"),
        }
    }
}

/// Decides what state a machine should be in.
///
/// `machine_type` is the policy for the machine's declared type, or `None` if
/// no such type is configured. Signals are consulted in a fixed order and the
/// first one with something to say wins:
///
/// 1. a machine that isn't an alive cluster member is unreachable
/// 2. a firing trigger alert sets the state it declares
/// 3. failed systemd units make the machine unhealthy
/// 4. a machine of unknown type is unhealthy
/// 5. the type's hardware metric checklist, if it has one
///
/// A machine that passed all of that is healthy, unless it has neither a
/// checklist nor a systemd report yet, in which case it's still starting up
/// and nothing is decided.
pub fn decide(
    bundle: &SignalBundle,
    machine_type: Option<&MachineType>,
) -> Decision {
    let member = match &bundle.membership {
        None => {
            return Decision::transition(
                MachineState::Unreachable,
                Reason::NotAMember,
            );
        }
        Some(member) if !member.is_alive() => {
            return Decision::transition(
                MachineState::Unreachable,
                Reason::MemberNotAlive(member.status),
            );
        }
        Some(member) => member,
    };

    if let Some(alert) = &bundle.alert {
        return Decision::Transition {
            state: alert.state.into(),
            immediate: alert.state == AlertState::Unhealthy,
            reason: Reason::Alert(alert.name.clone()),
        };
    }

    let systemd_units_failed = member.systemd_units_failed();
    if let Some(units) = systemd_units_failed.filter(|u| !u.is_empty()) {
        return Decision::transition(
            MachineState::Unhealthy,
            Reason::SystemdUnitsFailed(units.to_string()),
        );
    }

    let Some(machine_type) = machine_type else {
        return Decision::transition(
            MachineState::Unhealthy,
            Reason::UnknownMachineType,
        );
    };

    if machine_type.metrics.is_empty() {
        if systemd_units_failed.is_none() {
            return Decision::NoTransition;
        }
    } else {
        let empty = MetricFamilies::new();
        let families = bundle.metrics.as_ref().unwrap_or(&empty);
        for target in &machine_type.metrics {
            if let Err(reason) = check_metric(families, target) {
                return Decision::transition(MachineState::Unhealthy, reason);
            }
        }
    }

    Decision::transition(MachineState::Healthy, Reason::ChecksPassed)
}

fn check_metric(
    families: &MetricFamilies,
    target: &TargetMetric,
) -> Result<(), Reason> {
    let samples = families
        .get(&target.name)
        .ok_or_else(|| Reason::MetricMissing(target.name.clone()))?;

    let (matched, healthy) = samples
        .iter()
        .filter(|s| selector::matches(target.selector.as_ref(), &s.labels))
        .fold((0, 0), |(matched, healthy), sample| {
            (matched + 1, healthy + usize::from(sample.is_healthy()))
        });
    if matched == 0 {
        return Err(Reason::NoMatchingSamples(target.name.clone()));
    }

    let minimum = target.minimum_healthy_count.unwrap_or(matched);
    if healthy < minimum {
        return Err(Reason::TooFewHealthySamples {
            metric: target.name.clone(),
            healthy,
            minimum,
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::policy::DEFAULT_GRACE_PERIOD;
    use crate::selector::Selector;
    use crate::signals::{MachineAlert, Member, Sample};
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn member(status: MemberStatus, units_failed: Option<&str>) -> Member {
        Member {
            status,
            tags: units_failed
                .map(|u| labels(&[("systemd-units-failed", u)]))
                .unwrap_or_default(),
        }
    }

    fn alive() -> Option<Member> {
        Some(member(MemberStatus::Alive, Some("")))
    }

    fn sample(pairs: &[(&str, &str)], value: f64) -> Sample {
        Sample { labels: labels(pairs), value }
    }

    fn target(name: &str, selector: Option<Selector>) -> TargetMetric {
        TargetMetric {
            name: name.to_string(),
            selector,
            minimum_healthy_count: None,
        }
    }

    fn machine_type(metrics: Vec<TargetMetric>) -> MachineType {
        MachineType {
            name: "qemu".to_string(),
            grace_period: DEFAULT_GRACE_PERIOD,
            metrics,
        }
    }

    fn cpu_selector(socket: &str) -> Option<Selector> {
        Some(Selector {
            labels: Some(labels(&[("processor", socket)])),
            label_prefix: None,
        })
    }

    fn cpu_metrics(socket1: f64, socket2: f64) -> MetricFamilies {
        MetricFamilies::from([(
            "hw_processor_status_health".to_string(),
            vec![
                sample(&[("processor", "CPU.Socket.1")], socket1),
                sample(&[("processor", "CPU.Socket.2")], socket2),
            ],
        )])
    }

    fn qemu() -> MachineType {
        machine_type(vec![
            target("hw_processor_status_health", cpu_selector("CPU.Socket.1")),
            target("hw_processor_status_health", cpu_selector("CPU.Socket.2")),
        ])
    }

    fn assert_state(decision: Decision, state: MachineState) {
        assert_eq!(decision.state(), Some(state), "{decision:?}");
    }

    #[test]
    fn test_non_members_are_unreachable() {
        let healthy_metrics = Some(cpu_metrics(0.0, 0.0));
        for membership in [
            None,
            Some(member(MemberStatus::Failed, Some(""))),
            Some(member(MemberStatus::Left, Some(""))),
            Some(member(MemberStatus::Leaving, Some(""))),
            Some(member(MemberStatus::Unknown, None)),
        ] {
            let bundle = SignalBundle {
                membership,
                alert: Some(MachineAlert {
                    name: "DiskFailure".to_string(),
                    state: AlertState::Unhealthy,
                }),
                metrics: healthy_metrics.clone(),
            };
            assert_state(
                decide(&bundle, Some(&qemu())),
                MachineState::Unreachable,
            );
        }
    }

    #[test]
    fn test_failed_member_overrides_healthy_metrics() {
        let bundle = SignalBundle {
            membership: Some(member(MemberStatus::Failed, Some(""))),
            alert: None,
            metrics: Some(cpu_metrics(0.0, 0.0)),
        };
        assert_eq!(
            decide(&bundle, Some(&qemu())),
            Decision::Transition {
                state: MachineState::Unreachable,
                immediate: false,
                reason: Reason::MemberNotAlive(MemberStatus::Failed),
            }
        );
    }

    #[test]
    fn test_alerts() {
        let mut bundle = SignalBundle {
            membership: Some(member(MemberStatus::Alive, Some("nginx"))),
            alert: Some(MachineAlert {
                name: "DiskFailure".to_string(),
                state: AlertState::Unhealthy,
            }),
            metrics: Some(cpu_metrics(0.0, 0.0)),
        };
        assert_eq!(
            decide(&bundle, Some(&qemu())),
            Decision::Transition {
                state: MachineState::Unhealthy,
                immediate: true,
                reason: Reason::Alert("DiskFailure".to_string()),
            }
        );

        bundle.alert = Some(MachineAlert {
            name: "BMCDown".to_string(),
            state: AlertState::Unreachable,
        });
        assert_eq!(
            decide(&bundle, None),
            Decision::Transition {
                state: MachineState::Unreachable,
                immediate: false,
                reason: Reason::Alert("BMCDown".to_string()),
            }
        );
    }

    #[test]
    fn test_failed_systemd_units() {
        let bundle = SignalBundle {
            membership: Some(member(
                MemberStatus::Alive,
                Some("chrony.service"),
            )),
            alert: None,
            metrics: Some(cpu_metrics(0.0, 0.0)),
        };
        assert_eq!(
            decide(&bundle, Some(&qemu())),
            Decision::Transition {
                state: MachineState::Unhealthy,
                immediate: false,
                reason: Reason::SystemdUnitsFailed(
                    "chrony.service".to_string()
                ),
            }
        );
    }

    #[test]
    fn test_unknown_machine_type() {
        let bundle =
            SignalBundle { membership: alive(), alert: None, metrics: None };
        assert_eq!(
            decide(&bundle, None),
            Decision::transition(
                MachineState::Unhealthy,
                Reason::UnknownMachineType
            )
        );
    }

    #[test]
    fn test_one_cpu_socket_warning() {
        let bundle = SignalBundle {
            membership: alive(),
            alert: None,
            metrics: Some(cpu_metrics(0.0, 1.0)),
        };
        assert_eq!(
            decide(&bundle, Some(&qemu())),
            Decision::transition(
                MachineState::Unhealthy,
                Reason::TooFewHealthySamples {
                    metric: "hw_processor_status_health".to_string(),
                    healthy: 0,
                    minimum: 1,
                }
            )
        );

        let bundle = SignalBundle {
            metrics: Some(cpu_metrics(0.0, 0.0)),
            ..bundle
        };
        assert_eq!(
            decide(&bundle, Some(&qemu())),
            Decision::transition(MachineState::Healthy, Reason::ChecksPassed)
        );
    }

    #[test]
    fn test_minimum_healthy_count() {
        let mut disks = target(
            "hw_storage_drive_status_health",
            Some(Selector {
                labels: None,
                label_prefix: Some(labels(&[("device", "HDD")])),
            }),
        );
        disks.minimum_healthy_count = Some(1);
        let policy = machine_type(vec![disks]);

        let metrics = MetricFamilies::from([(
            "hw_storage_drive_status_health".to_string(),
            vec![
                sample(&[("device", "HDD.0")], 0.0),
                sample(&[("device", "HDD.1")], 2.0),
                sample(&[("device", "HDD.2")], 1.0),
                // Not selected, so its failure doesn't count.
                sample(&[("device", "SSD.0")], 1.0),
            ],
        )]);
        let bundle = SignalBundle {
            membership: alive(),
            alert: None,
            metrics: Some(metrics),
        };
        assert_state(decide(&bundle, Some(&policy)), MachineState::Healthy);
    }

    #[test]
    fn test_missing_metrics() {
        let policy = qemu();
        let mut bundle =
            SignalBundle { membership: alive(), alert: None, metrics: None };
        let missing = Decision::transition(
            MachineState::Unhealthy,
            Reason::MetricMissing("hw_processor_status_health".to_string()),
        );
        assert_eq!(decide(&bundle, Some(&policy)), missing);

        bundle.metrics = Some(MetricFamilies::from([(
            "up".to_string(),
            vec![sample(&[], 1.0)],
        )]));
        assert_eq!(decide(&bundle, Some(&policy)), missing);

        // The family is there but none of its samples match.
        bundle.metrics = Some(MetricFamilies::from([(
            "hw_processor_status_health".to_string(),
            vec![sample(&[], 0.0)],
        )]));
        assert_eq!(
            decide(&bundle, Some(&policy)),
            Decision::transition(
                MachineState::Unhealthy,
                Reason::NoMatchingSamples(
                    "hw_processor_status_health".to_string()
                ),
            )
        );
    }

    #[test]
    fn test_startup_grace() {
        let policy = machine_type(vec![]);
        let mut bundle = SignalBundle {
            membership: Some(member(MemberStatus::Alive, None)),
            alert: None,
            metrics: None,
        };
        assert_eq!(decide(&bundle, Some(&policy)), Decision::NoTransition);

        // Once systemd reports no failed units the machine is healthy.
        bundle.membership = alive();
        assert_state(decide(&bundle, Some(&policy)), MachineState::Healthy);
    }

    #[test]
    fn test_checklist_without_systemd_report() {
        let bundle = SignalBundle {
            membership: Some(member(MemberStatus::Alive, None)),
            alert: None,
            metrics: Some(cpu_metrics(0.0, 0.0)),
        };
        assert_state(decide(&bundle, Some(&qemu())), MachineState::Healthy);
    }
}
