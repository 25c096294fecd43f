// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory implementations of every collaborator, for tests
//!
//! Each fake records the calls made to it and can be told to fail.

use crate::exec::ExecutionError;
use crate::inventory::{Inventory, InventoryError, SetStateError};
use crate::machine::{Machine, MachineState};
use crate::retirement::SecureErase;
use crate::signals::alerts::{Alert, AlertError, AlertSource};
use crate::signals::membership::{Member, Members, MembershipError};
use crate::signals::metrics::{MetricFamilies, MetricsError, MetricsSource};
use crate::signals::{MemberStatus, Membership};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

/// A mutating call made to a [`FakeInventory`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InventoryCall {
    SetState(String, MachineState),
    DeleteEncryptedVolumes(String),
}

#[derive(Default)]
struct FakeInventoryInner {
    machines: Vec<Machine>,
    calls: Vec<InventoryCall>,
    fail_listing: bool,
    fail_volume_deletion: bool,
    fail_set_state: BTreeSet<String>,
}

/// An inventory that enforces the lifecycle state machine the way the real
/// one does.
#[derive(Default)]
pub struct FakeInventory {
    inner: Mutex<FakeInventoryInner>,
}

impl FakeInventory {
    pub fn new(machines: Vec<Machine>) -> Self {
        Self {
            inner: Mutex::new(FakeInventoryInner {
                machines,
                ..Default::default()
            }),
        }
    }

    /// Mutating calls made so far, in order.
    pub fn calls(&self) -> Vec<InventoryCall> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().unwrap().calls.clear();
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.inner.lock().unwrap().machines.clone()
    }

    pub fn state_of(&self, serial: &str) -> Option<MachineState> {
        self.inner
            .lock()
            .unwrap()
            .machines
            .iter()
            .find(|m| m.serial == serial)
            .map(|m| m.state)
    }

    /// Changes a machine's state out from under the controller, as an
    /// operator would.
    pub fn force_state(&self, serial: &str, state: MachineState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.machines.iter_mut().find(|m| m.serial == serial)
        {
            m.state = state;
        }
    }

    pub fn remove_machine(&self, serial: &str) {
        self.inner.lock().unwrap().machines.retain(|m| m.serial != serial);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.inner.lock().unwrap().fail_listing = fail;
    }

    pub fn fail_volume_deletion(&self, fail: bool) {
        self.inner.lock().unwrap().fail_volume_deletion = fail;
    }

    /// Makes every state change of `serial` fail with a server error.
    pub fn fail_set_state_for(&self, serial: &str) {
        self.inner.lock().unwrap().fail_set_state.insert(serial.to_string());
    }
}

fn fake_status_error(what: &str) -> InventoryError {
    InventoryError::Status {
        url: format!("fake://inventory/{what}"),
        status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        body: "injected failure".to_string(),
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn list_machines(&self) -> Result<Vec<Machine>, InventoryError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_listing {
            return Err(fake_status_error("machines"));
        }
        Ok(inner.machines.clone())
    }

    async fn set_state(
        &self,
        serial: &str,
        state: MachineState,
    ) -> Result<(), SetStateError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(InventoryCall::SetState(serial.to_string(), state));
        if inner.fail_set_state.contains(serial) {
            return Err(fake_status_error("state").into());
        }
        let invalid = || SetStateError::InvalidTransition {
            serial: serial.to_string(),
            state,
        };
        let machine = inner
            .machines
            .iter_mut()
            .find(|m| m.serial == serial)
            .ok_or_else(invalid)?;
        if !machine.state.can_transition_to(state) {
            return Err(invalid());
        }
        machine.state = state;
        Ok(())
    }

    async fn delete_encrypted_volumes(
        &self,
        serial: &str,
    ) -> Result<(), InventoryError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(InventoryCall::DeleteEncryptedVolumes(serial.to_string()));
        if inner.fail_volume_deletion {
            return Err(fake_status_error("crypts"));
        }
        Ok(())
    }
}

#[derive(Default)]
struct FakeMembershipInner {
    members: Members,
    fail: bool,
}

#[derive(Default)]
pub struct FakeMembership {
    inner: Mutex<FakeMembershipInner>,
}

impl FakeMembership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the member at `address`, with `units_failed` as the value of its
    /// failed systemd units tag (`None` for no tag).
    pub fn set_member(
        &self,
        address: &str,
        status: MemberStatus,
        units_failed: Option<&str>,
    ) {
        let tags = units_failed
            .map(|units| {
                BTreeMap::from([(
                    crate::signals::membership::SYSTEMD_UNITS_FAILED_TAG
                        .to_string(),
                    units.to_string(),
                )])
            })
            .unwrap_or_default();
        self.inner
            .lock()
            .unwrap()
            .members
            .insert(address.to_string(), Member { status, tags });
    }

    pub fn remove_member(&self, address: &str) {
        self.inner.lock().unwrap().members.remove(address);
    }

    pub fn fail(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }
}

#[async_trait]
impl Membership for FakeMembership {
    async fn list_members(&self) -> Result<Members, MembershipError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(MembershipError::Exec(ExecutionError::EmptyCommand));
        }
        Ok(inner.members.clone())
    }
}

#[derive(Default)]
struct FakeMetricsInner {
    by_address: BTreeMap<String, MetricFamilies>,
    fetched: Vec<String>,
    delay: Duration,
    hanging: BTreeSet<String>,
    in_flight: usize,
    peak_in_flight: usize,
}

/// Serves fixed metrics per address. Fetching from an address with no
/// metrics set fails.
///
/// Fetches can be slowed down or made to hang, and the largest number of
/// fetches in flight at once is recorded.
#[derive(Default)]
pub struct FakeMetrics {
    inner: Mutex<FakeMetricsInner>,
}

impl FakeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: &str, families: MetricFamilies) {
        self.inner
            .lock()
            .unwrap()
            .by_address
            .insert(address.to_string(), families);
    }

    pub fn remove(&self, address: &str) {
        self.inner.lock().unwrap().by_address.remove(address);
    }

    /// Makes every fetch take `delay` before it completes.
    pub fn set_delay(&self, delay: Duration) {
        self.inner.lock().unwrap().delay = delay;
    }

    /// Makes fetches from `address` never complete.
    pub fn hang(&self, address: &str) {
        self.inner.lock().unwrap().hanging.insert(address.to_string());
    }

    pub fn peak_in_flight(&self) -> usize {
        self.inner.lock().unwrap().peak_in_flight
    }

    /// Addresses fetched so far, sorted.
    pub fn fetched(&self) -> Vec<String> {
        let mut fetched = self.inner.lock().unwrap().fetched.clone();
        fetched.sort();
        fetched
    }
}

#[async_trait]
impl MetricsSource for FakeMetrics {
    async fn fetch(
        &self,
        address: &str,
    ) -> Result<MetricFamilies, MetricsError> {
        let (delay, hang, result) = {
            let mut inner = self.inner.lock().unwrap();
            inner.fetched.push(address.to_string());
            inner.in_flight += 1;
            inner.peak_in_flight = inner.peak_in_flight.max(inner.in_flight);
            let result =
                inner.by_address.get(address).cloned().ok_or_else(|| {
                    MetricsError::Status {
                        url: format!("fake://{address}/metrics"),
                        status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    }
                });
            (inner.delay, inner.hanging.contains(address), result)
        };
        // Decrements `in_flight` however the fetch ends, including being
        // dropped by a timeout.
        let _in_flight = InFlight(&self.inner);
        if hang {
            std::future::pending::<()>().await;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

struct InFlight<'a>(&'a Mutex<FakeMetricsInner>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.0.lock() {
            inner.in_flight -= 1;
        }
    }
}

#[derive(Default)]
struct FakeAlertsInner {
    alerts: Vec<Alert>,
    fail: bool,
}

#[derive(Default)]
pub struct FakeAlerts {
    inner: Mutex<FakeAlertsInner>,
}

impl FakeAlerts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, alerts: Vec<Alert>) {
        self.inner.lock().unwrap().alerts = alerts;
    }

    pub fn fail(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }
}

#[async_trait]
impl AlertSource for FakeAlerts {
    async fn list_active_alerts(&self) -> Result<Vec<Alert>, AlertError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(AlertError::Status {
                url: "fake://alertmanager/api/v2/alerts".to_string(),
                status: reqwest::StatusCode::BAD_GATEWAY,
            });
        }
        Ok(inner.alerts.clone())
    }
}

#[derive(Default)]
struct FakeSecureEraseInner {
    erased: Vec<String>,
    fail: BTreeSet<String>,
}

#[derive(Default)]
pub struct FakeSecureErase {
    inner: Mutex<FakeSecureEraseInner>,
}

impl FakeSecureErase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serials successfully erased so far, in order.
    pub fn erased(&self) -> Vec<String> {
        self.inner.lock().unwrap().erased.clone()
    }

    pub fn fail_for(&self, serial: &str) {
        self.inner.lock().unwrap().fail.insert(serial.to_string());
    }
}

#[async_trait]
impl SecureErase for FakeSecureErase {
    async fn secure_erase(&self, serial: &str) -> Result<(), ExecutionError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail.contains(serial) {
            return Err(ExecutionError::ExecutionStart {
                command: format!("fake-erase {serial}"),
                err: std::io::Error::other("injected failure"),
            });
        }
        inner.erased.push(serial.to_string());
        Ok(())
    }
}
