// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client for the machine inventory

use crate::machine::{Machine, MachineState};
use async_trait::async_trait;
use serde::Deserialize;
use slog::{warn, Logger};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;

/// Inventory label naming a machine's [`crate::policy::MachineType`].
pub const MACHINE_TYPE_LABEL: &str = "machine-type";

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum InventoryError {
    #[error("inventory request to {url} failed")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("inventory request to {url} returned {status}: {body}")]
    Status { url: String, status: reqwest::StatusCode, body: String },
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum SetStateError {
    /// The inventory refused the transition as not allowed from the
    /// machine's current state. Usually this means the state changed since
    /// the machine was listed.
    #[error("invalid state transition for {serial} to {state}")]
    InvalidTransition { serial: String, state: MachineState },
    #[error(transparent)]
    Other(#[from] InventoryError),
}

#[async_trait]
pub trait Inventory: Send + Sync {
    async fn list_machines(&self) -> Result<Vec<Machine>, InventoryError>;

    async fn set_state(
        &self,
        serial: &str,
        state: MachineState,
    ) -> Result<(), SetStateError>;

    /// Deletes the disk encryption keys of the machine. Deleting keys that
    /// are already gone succeeds.
    async fn delete_encrypted_volumes(
        &self,
        serial: &str,
    ) -> Result<(), InventoryError>;
}

/// Talks to the inventory's REST API.
pub struct HttpInventory {
    log: Logger,
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Deserialize)]
struct MachineRecord {
    spec: MachineSpec,
    status: MachineStatus,
}

#[derive(Deserialize)]
struct MachineSpec {
    serial: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    ipv4: Vec<String>,
}

#[derive(Deserialize)]
struct MachineStatus {
    state: MachineState,
}

impl HttpInventory {
    pub fn new(log: Logger, client: reqwest::Client, endpoint: &str) -> Self {
        Self {
            log,
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.endpoint, path)
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<(reqwest::StatusCode, String), InventoryError> {
        let response = request.send().await.map_err(|err| {
            InventoryError::Request { url: url.to_string(), err }
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            InventoryError::Request { url: url.to_string(), err }
        })?;
        Ok((status, body))
    }
}

#[async_trait]
impl Inventory for HttpInventory {
    async fn list_machines(&self) -> Result<Vec<Machine>, InventoryError> {
        let url = self.url("machines");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| InventoryError::Request { url: url.clone(), err })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(InventoryError::Status { url, status, body });
        }
        let records: Vec<MachineRecord> = response
            .json()
            .await
            .map_err(|err| InventoryError::Request { url, err })?;

        let mut machines = Vec::with_capacity(records.len());
        for record in records {
            let MachineRecord { mut spec, status } = record;
            let address = spec.ipv4.into_iter().next();
            if address.is_none() {
                warn!(
                    self.log,
                    "machine has no address";
                    "serial" => &spec.serial,
                    "state" => status.state.as_str(),
                );
            }
            machines.push(Machine {
                machine_type: spec
                    .labels
                    .remove(MACHINE_TYPE_LABEL)
                    .unwrap_or_default(),
                serial: spec.serial,
                address,
                state: status.state,
            });
        }
        Ok(machines)
    }

    async fn set_state(
        &self,
        serial: &str,
        state: MachineState,
    ) -> Result<(), SetStateError> {
        let url = self.url(&format!("state/{serial}"));
        let (status, body) =
            self.send(&url, self.client.put(&url).body(state.as_str())).await?;
        if status.is_success() {
            return Ok(());
        }
        let invalid_transition = status == reqwest::StatusCode::CONFLICT
            || (status == reqwest::StatusCode::INTERNAL_SERVER_ERROR
                && body.contains("invalid state transition"));
        if invalid_transition {
            return Err(SetStateError::InvalidTransition {
                serial: serial.to_string(),
                state,
            });
        }
        Err(InventoryError::Status { url, status, body }.into())
    }

    async fn delete_encrypted_volumes(
        &self,
        serial: &str,
    ) -> Result<(), InventoryError> {
        let url = self.url(&format!("crypts/{serial}"));
        let (status, body) =
            self.send(&url, self.client.delete(&url)).await?;
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(InventoryError::Status { url, status, body })
        }
    }
}
