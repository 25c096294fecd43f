// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per machine type health policy

use crate::selector::Selector;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Grace period used when a machine type doesn't declare one, and for
/// machines whose type has no policy at all.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// A policy bucket that decides which metrics are checked for a machine and
/// how long it may stay unhealthy before that is recorded.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MachineType {
    pub name: String,
    #[serde(
        default = "default_grace_period",
        with = "crate::config::humantime_duration"
    )]
    pub grace_period: Duration,
    #[serde(default)]
    pub metrics: Vec<TargetMetric>,
}

fn default_grace_period() -> Duration {
    DEFAULT_GRACE_PERIOD
}

/// A metric family that must look healthy for a machine to be healthy.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetMetric {
    pub name: String,
    /// Restricts which samples of the family are considered. Without a
    /// selector every sample counts.
    #[serde(default)]
    pub selector: Option<Selector>,
    /// Number of matched samples that must report healthy. Defaults to all
    /// of them.
    #[serde(default)]
    pub minimum_healthy_count: Option<usize>,
}

/// Machine types indexed by name.
#[derive(Clone, Debug, Default)]
pub struct Policies(BTreeMap<String, MachineType>);

impl Policies {
    pub fn new(types: impl IntoIterator<Item = MachineType>) -> Self {
        Self(types.into_iter().map(|t| (t.name.clone(), t)).collect())
    }

    pub fn get(&self, name: &str) -> Option<&MachineType> {
        self.0.get(name)
    }

    /// Returns true if machines of type `name` need their metrics fetched.
    pub fn wants_metrics(&self, name: &str) -> bool {
        self.get(name).is_some_and(|t| !t.metrics.is_empty())
    }

    /// Grace period for machines of type `name`.
    pub fn grace_period(&self, name: &str) -> Duration {
        self.get(name).map_or(DEFAULT_GRACE_PERIOD, |t| t.grace_period)
    }
}
