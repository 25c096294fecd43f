// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration file parsing and validation

use crate::logging::ConfigLogging;
use crate::policy::MachineType;
use crate::signals::alerts::{AlertMonitorConfig, TriggerAlertError};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog_error_chain::SlogInlineError;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// How often a reconciliation cycle runs
    #[serde(default = "default_interval", with = "humantime_duration")]
    pub interval: Duration,
    /// Maximum number of concurrent metrics fetches
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Decide and log but don't change anything
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub log: ConfigLogging,
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    pub retirement: RetirementConfig,
    #[serde(default)]
    pub machine_types: Vec<MachineType>,
    #[serde(default)]
    pub alert_monitor: Option<AlertMonitorConfig>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InventoryConfig {
    /// Base URL of the inventory's REST API
    pub endpoint: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MembershipConfig {
    /// Command printing cluster membership as JSON
    #[serde(default = "default_membership_command")]
    pub command: Vec<String>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self { command: default_membership_command() }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_path")]
    pub path: String,
    #[serde(default = "default_metrics_timeout", with = "humantime_duration")]
    pub timeout: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
            path: default_metrics_path(),
            timeout: default_metrics_timeout(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetirementConfig {
    /// Command that erases a machine; `{serial}` is replaced in each argument
    pub secure_erase_command: Vec<String>,
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_parallelism() -> usize {
    16
}

fn default_membership_command() -> Vec<String> {
    ["serf", "members", "-format", "json"].map(String::from).to_vec()
}

fn default_metrics_port() -> u16 {
    9105
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_metrics_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Config {
    /// Load and validate a `Config` from the given TOML file
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        config
            .validate()
            .map_err(|err| LoadError::Invalid { path: path.into(), err })?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval.is_zero() {
            return Err(ValidationError::ZeroInterval);
        }
        if self.parallelism == 0 {
            return Err(ValidationError::ZeroParallelism);
        }
        if self.membership.command.is_empty() {
            return Err(ValidationError::EmptyMembershipCommand);
        }
        if self.retirement.secure_erase_command.is_empty() {
            return Err(ValidationError::EmptySecureEraseCommand);
        }
        let mut names = BTreeSet::new();
        for machine_type in &self.machine_types {
            if !names.insert(machine_type.name.as_str()) {
                return Err(ValidationError::DuplicateMachineType(
                    machine_type.name.clone(),
                ));
            }
        }
        if let Some(alert_monitor) = &self.alert_monitor {
            for trigger in &alert_monitor.trigger_alerts {
                trigger.validate()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error, SlogInlineError)]
pub enum LoadError {
    #[error("error reading \"{path}\"")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\"")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("invalid configuration in \"{path}\"")]
    Invalid {
        path: Utf8PathBuf,
        #[source]
        err: ValidationError,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("interval must be greater than zero")]
    ZeroInterval,
    #[error("parallelism must be at least 1")]
    ZeroParallelism,
    #[error("membership command must not be empty")]
    EmptyMembershipCommand,
    #[error("secure-erase-command must not be empty")]
    EmptySecureEraseCommand,
    #[error("machine type {0:?} is defined more than once")]
    DuplicateMachineType(String),
    #[error(transparent)]
    TriggerAlert(#[from] TriggerAlertError),
}

/// (De)serializes a [`Duration`] as a human-readable string like "1h 30m".
pub mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*duration))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
