// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signal sources consulted when deciding a machine's state
//!
//! Each source is an independent service that may be stale, partially
//! populated, or unavailable. Every source is modeled as a trait with a
//! production implementation in its submodule and an in-memory
//! implementation in [`crate::fakes`]; the controller only sees the traits.

pub mod alerts;
pub mod membership;
pub mod metrics;

pub use alerts::AlertSource;
pub use alerts::AlertState;
pub use alerts::MachineAlert;
pub use membership::Member;
pub use membership::MemberStatus;
pub use membership::Membership;
pub use metrics::MetricFamilies;
pub use metrics::MetricsSource;
pub use metrics::Sample;

/// Everything known about one machine during one reconciliation cycle.
#[derive(Clone, Debug, Default)]
pub struct SignalBundle {
    /// The machine's cluster membership record, if it has one.
    pub membership: Option<Member>,
    /// The alert that applies to this machine, if any.
    pub alert: Option<MachineAlert>,
    /// Metrics scraped from the machine. `None` if they weren't needed or
    /// couldn't be fetched.
    pub metrics: Option<MetricFamilies>,
}

impl SignalBundle {
    /// Value of the membership tag listing failed systemd units, if the
    /// machine has published one.
    pub fn systemd_units_failed(&self) -> Option<&str> {
        self.membership.as_ref().and_then(Member::systemd_units_failed)
    }
}
