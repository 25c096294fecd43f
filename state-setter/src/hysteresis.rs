// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Grace period tracking for unhealthy verdicts
//!
//! A machine is only recorded as unhealthy once it has been judged unhealthy
//! continuously for longer than its type's grace period. Any other verdict in
//! between resets the streak.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

/// When each currently unhealthy machine was first seen unhealthy, by serial.
///
/// This is in-memory only, so a restart resets every streak.
#[derive(Debug, Default)]
pub struct UnhealthyRegistry {
    first_detected: BTreeMap<String, Instant>,
}

impl UnhealthyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `serial` was judged unhealthy at `now`.
    ///
    /// Returns true if the machine has now been unhealthy for strictly longer
    /// than `grace_period`. The first call for a serial starts its streak and
    /// always returns false.
    pub fn register_unhealthy(
        &mut self,
        serial: &str,
        grace_period: Duration,
        now: Instant,
    ) -> bool {
        match self.first_detected.get(serial) {
            Some(first) => now.saturating_duration_since(*first) > grace_period,
            None => {
                self.first_detected.insert(serial.to_string(), now);
                false
            }
        }
    }

    /// Ends the unhealthy streak of `serial`, if it has one.
    pub fn clear(&mut self, serial: &str) {
        self.first_detected.remove(serial);
    }

    /// Drops every streak whose serial is not in `serials`.
    pub fn retain(&mut self, serials: &BTreeSet<&str>) {
        self.first_detected
            .retain(|serial, _| serials.contains(serial.as_str()));
    }

    pub fn first_detected_at(&self, serial: &str) -> Option<Instant> {
        self.first_detected.get(serial).copied()
    }

    pub fn len(&self) -> usize {
        self.first_detected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_detected.is_empty()
    }
}
