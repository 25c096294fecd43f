// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests of the reconciliation loop against in-memory collaborators

use slog::{o, Logger};
use state_setter::controller::{Collaborators, ControllerConfig};
use state_setter::fakes::{
    FakeInventory, FakeMembership, FakeMetrics, FakeSecureErase,
};
use state_setter::policy::{MachineType, TargetMetric};
use state_setter::signals::{MemberStatus, MetricFamilies, Sample};
use state_setter::{Controller, CycleError, Machine, MachineState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const INTERVAL: Duration = Duration::from_secs(60);

struct Fakes {
    inventory: Arc<FakeInventory>,
    membership: Arc<FakeMembership>,
    metrics: Arc<FakeMetrics>,
}

fn controller(grace_period: Duration) -> (Controller, Fakes) {
    let log = Logger::root(slog::Discard, o!());
    let fakes = Fakes {
        inventory: Arc::new(FakeInventory::new(vec![Machine {
            serial: "S1".to_string(),
            machine_type: "cpu".to_string(),
            address: Some("10.0.0.1".to_string()),
            state: MachineState::Healthy,
        }])),
        membership: Arc::new(FakeMembership::new()),
        metrics: Arc::new(FakeMetrics::new()),
    };
    let config = ControllerConfig {
        interval: INTERVAL,
        parallelism: 1,
        metrics_timeout: Duration::from_secs(5),
        dry_run: false,
        machine_types: vec![MachineType {
            name: "cpu".to_string(),
            grace_period,
            metrics: vec![TargetMetric {
                name: "hw_processor_status_health".to_string(),
                selector: None,
                minimum_healthy_count: None,
            }],
        }],
        trigger_alerts: Vec::new(),
    };
    let controller = Controller::new(
        &log,
        config,
        Collaborators {
            inventory: fakes.inventory.clone(),
            membership: fakes.membership.clone(),
            metrics: fakes.metrics.clone(),
            alerts: None,
            secure_erase: Arc::new(FakeSecureErase::new()),
        },
    );
    (controller, fakes)
}

fn cpu_metrics(value: f64) -> MetricFamilies {
    MetricFamilies::from([(
        "hw_processor_status_health".to_string(),
        vec![Sample { labels: BTreeMap::new(), value }],
    )])
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_spans_cycles() {
    let (controller, fakes) = controller(Duration::from_secs(90));
    fakes.membership.set_member("10.0.0.1", MemberStatus::Alive, Some(""));
    fakes.metrics.set("10.0.0.1", cpu_metrics(1.0));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(controller.run(shutdown_rx));

    // Cycles have run at 0s and 60s: unhealthy, but within the grace period.
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(fakes.inventory.state_of("S1"), Some(MachineState::Healthy));
    assert!(fakes.inventory.calls().is_empty());

    // The cycle at 120s is past it.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(fakes.inventory.state_of("S1"), Some(MachineState::Unhealthy));

    // Recovery is recorded on the next cycle.
    fakes.metrics.set("10.0.0.1", cpu_metrics(0.0));
    tokio::time::sleep(INTERVAL).await;
    assert_eq!(fakes.inventory.state_of("S1"), Some(MachineState::Healthy));

    shutdown_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_when_sender_dropped() {
    let (controller, fakes) = controller(Duration::from_secs(90));
    fakes.membership.set_member("10.0.0.1", MemberStatus::Alive, Some(""));
    fakes.metrics.set("10.0.0.1", cpu_metrics(0.0));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(controller.run(shutdown_rx));
    tokio::time::sleep(INTERVAL * 3).await;
    drop(shutdown_tx);
    task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_membership_failure_stops_loop() {
    let (controller, fakes) = controller(Duration::from_secs(90));
    fakes.membership.fail(true);

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let err = controller.run(shutdown_rx).await.unwrap_err();
    assert!(matches!(err, CycleError::Membership(_)), "{err:?}");
    assert!(fakes.inventory.calls().is_empty());
}
