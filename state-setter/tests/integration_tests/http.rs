// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A full cycle against HTTP fakes of the inventory, the alert feed and a
//! machine's metrics endpoint, with membership and secure erase run as real
//! commands

#![cfg(unix)]

use httptest::matchers::request;
use httptest::responders::{json_encoded, status_code};
use httptest::{Expectation, Server};
use slog::{o, Logger};
use state_setter::{Config, Controller};
use tokio::time::Instant;

const MEMBERS: &str = r#"{"members":[
    {"name":"cs1","addr":"127.0.0.1:7946","status":"alive",
     "tags":{"systemd-units-failed":""}}
]}"#;

fn config(
    inventory: &Server,
    alertmanager: &Server,
    metrics: &Server,
) -> Config {
    let text = format!(
        r#"
        interval = "1m"

        [inventory]
        endpoint = "{inventory}"

        [membership]
        command = ["echo", '{members}']

        [metrics]
        port = {metrics_port}
        timeout = "5s"

        [retirement]
        secure-erase-command = ["sh", "-c", 'test "$0" = S2', "{{serial}}"]

        [[machine-types]]
        name = "qemu"

        [[machine-types.metrics]]
        name = "hw_processor_status_health"

        [alert-monitor]
        alertmanager-endpoint = "{alertmanager}"

        [[alert-monitor.trigger-alerts]]
        name = "DiskFailure"
        serial-label = "serial"
        state = "unhealthy"
        "#,
        inventory = inventory.url_str(""),
        alertmanager = alertmanager.url_str(""),
        members = MEMBERS.replace('\n', " "),
        metrics_port = metrics.addr().port(),
    );
    let config: Config = toml::from_str(&text).unwrap();
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn test_cycle_over_http() {
    let inventory = Server::run();
    let alertmanager = Server::run();
    let metrics = Server::run();

    inventory.expect(
        Expectation::matching(request::method_path("GET", "/api/v1/machines"))
            .respond_with(json_encoded(serde_json::json!([
                {
                    "spec": {
                        "serial": "S1",
                        "labels": {"machine-type": "qemu"},
                        "ipv4": ["127.0.0.1"]
                    },
                    "status": {"state": "uninitialized"}
                },
                {
                    "spec": {
                        "serial": "S2",
                        "labels": {"machine-type": "qemu"},
                        "ipv4": ["127.0.0.2"]
                    },
                    "status": {"state": "retiring"}
                }
            ]))),
    );
    inventory.expect(
        Expectation::matching(httptest::all_of![
            request::method_path("PUT", "/api/v1/state/S1"),
            request::body("healthy"),
        ])
        .respond_with(status_code(200)),
    );
    inventory.expect(
        Expectation::matching(request::method_path(
            "DELETE",
            "/api/v1/crypts/S2",
        ))
        .respond_with(status_code(404)),
    );
    inventory.expect(
        Expectation::matching(httptest::all_of![
            request::method_path("PUT", "/api/v1/state/S2"),
            request::body("retired"),
        ])
        .respond_with(status_code(200)),
    );
    alertmanager.expect(
        Expectation::matching(request::method_path("GET", "/api/v2/alerts"))
            .respond_with(json_encoded(serde_json::json!([
                {"labels": {"alertname": "DiskFailure", "serial": "S9"}}
            ]))),
    );
    metrics.expect(
        Expectation::matching(request::method_path("GET", "/metrics"))
            .respond_with(status_code(200).body(
                "# TYPE hw_processor_status_health gauge\n\
                 hw_processor_status_health{processor=\"CPU.Socket.1\"} 0\n",
            )),
    );

    let log = Logger::root(slog::Discard, o!());
    let config = config(&inventory, &alertmanager, &metrics);
    let mut controller = Controller::from_config(&log, &config).unwrap();
    let report = controller.run_cycle(Instant::now()).await.unwrap();

    assert!(!report.skipped);
    assert_eq!(report.machines, 2);
    assert_eq!(report.alerts, 1);
    assert_eq!(report.metrics_fetched, 1);
    assert_eq!(report.metrics_failed, 0);
    assert_eq!(report.transitions_committed, 1);
    assert_eq!(report.retired, 1);
    assert_eq!(report.retirement_failures, 0);
}
