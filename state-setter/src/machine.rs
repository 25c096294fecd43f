// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machines as described by the inventory, and the inventory's lifecycle
//! state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A physical machine known to the inventory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Machine {
    /// Hardware serial number; stable for the life of the machine.
    pub serial: String,
    /// Name of the [`crate::policy::MachineType`] this machine belongs to.
    pub machine_type: String,
    /// Address the machine is reachable at (membership and metrics are keyed
    /// by this). Addresses may be reassigned over time; serials are not.
    ///
    /// `None` if the inventory has no address for the machine, in which case
    /// it can't be a cluster member.
    pub address: Option<String>,
    /// State as currently recorded by the inventory.
    pub state: MachineState,
}

/// Lifecycle state of a machine.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    /// The machine has been (re)registered but has not yet been observed as
    /// healthy.
    Uninitialized,
    /// The machine is in service.
    Healthy,
    /// The machine is running but failing health checks.
    Unhealthy,
    /// The machine is not a live member of the cluster.
    Unreachable,
    /// The machine is being updated by an operator-driven process.
    Updating,
    /// The machine is queued for secure erasure and decommissioning.
    Retiring,
    /// The machine has been erased and decommissioned.
    Retired,
}

impl MachineState {
    pub const ALL: [MachineState; 7] = [
        MachineState::Uninitialized,
        MachineState::Healthy,
        MachineState::Unhealthy,
        MachineState::Unreachable,
        MachineState::Updating,
        MachineState::Retiring,
        MachineState::Retired,
    ];

    /// States the inventory accepts as the next state after `self`.
    pub fn successors(self) -> &'static [MachineState] {
        use MachineState::*;
        match self {
            Uninitialized => &[Healthy, Retiring],
            Healthy => &[Unhealthy, Unreachable, Updating, Retiring],
            Unhealthy => &[Healthy, Unreachable, Retiring],
            Unreachable => &[Healthy, Unhealthy, Retiring],
            Updating => &[Uninitialized],
            Retiring => &[Retired],
            Retired => &[Uninitialized],
        }
    }

    /// Returns true if the inventory would accept a transition from `self` to
    /// `next`.
    ///
    /// A transition to the current state is never legal: there is nothing to
    /// write.
    pub fn can_transition_to(self, next: MachineState) -> bool {
        self.successors().contains(&next)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Uninitialized => "uninitialized",
            MachineState::Healthy => "healthy",
            MachineState::Unhealthy => "unhealthy",
            MachineState::Unreachable => "unreachable",
            MachineState::Updating => "updating",
            MachineState::Retiring => "retiring",
            MachineState::Retired => "retired",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
