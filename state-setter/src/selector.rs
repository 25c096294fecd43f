// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Label predicates over metric samples

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Restricts the samples of a metric family that count toward a health
/// check.
///
/// A sample matches only if every entry of `labels` is present on the sample
/// with exactly that value, and every entry of `label_prefix` is present on
/// the sample with a value starting with that string. Labels on the sample
/// that the selector doesn't mention are ignored.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Selector {
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub label_prefix: Option<BTreeMap<String, String>>,
}

impl Selector {
    pub fn matches(&self, sample_labels: &BTreeMap<String, String>) -> bool {
        let exact = self.labels.iter().flatten().all(|(key, want)| {
            sample_labels.get(key).is_some_and(|have| have == want)
        });
        let prefix = self.label_prefix.iter().flatten().all(|(key, want)| {
            sample_labels.get(key).is_some_and(|have| have.starts_with(want))
        });
        exact && prefix
    }
}

/// Like [`Selector::matches`], with a missing selector matching everything.
pub fn matches(
    selector: Option<&Selector>,
    sample_labels: &BTreeMap<String, String>,
) -> bool {
    selector.map_or(true, |s| s.matches(sample_labels))
}
