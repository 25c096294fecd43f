// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging configuration (the `[log]` table of the configuration file)

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Level, Logger};
use slog_error_chain::SlogInlineError;
use std::fs::OpenOptions;

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ConfigLogging {
    StderrTerminal {
        level: ConfigLoggingLevel,
    },
    /// Newline-delimited JSON written to `path`.
    #[serde(rename_all = "kebab-case")]
    File {
        level: ConfigLoggingLevel,
        path: Utf8PathBuf,
        if_exists: ConfigLoggingIfExists,
    },
}

impl Default for ConfigLogging {
    fn default() -> Self {
        ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigLoggingIfExists {
    Fail,
    Truncate,
    Append,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigLoggingLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<ConfigLoggingLevel> for Level {
    fn from(level: ConfigLoggingLevel) -> Level {
        match level {
            ConfigLoggingLevel::Trace => Level::Trace,
            ConfigLoggingLevel::Debug => Level::Debug,
            ConfigLoggingLevel::Info => Level::Info,
            ConfigLoggingLevel::Warn => Level::Warning,
            ConfigLoggingLevel::Error => Level::Error,
            ConfigLoggingLevel::Critical => Level::Critical,
        }
    }
}

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum LogInitError {
    #[error("failed to create log directory \"{path}\"")]
    CreateDir {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("failed to open log file \"{path}\"")]
    Open {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
}

impl ConfigLogging {
    /// Creates the root logger described by this configuration.
    pub fn to_logger(
        &self,
        name: &'static str,
    ) -> Result<Logger, LogInitError> {
        match self {
            ConfigLogging::StderrTerminal { level } => {
                let decorator =
                    slog_term::TermDecorator::new().stderr().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(name, *level, drain))
            }
            ConfigLogging::File { level, path, if_exists } => {
                let mut open_options = OpenOptions::new();
                open_options.write(true).create(true);
                match if_exists {
                    ConfigLoggingIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    ConfigLoggingIfExists::Append => {
                        open_options.append(true);
                    }
                    ConfigLoggingIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }
                let drain = log_drain_for_file(&open_options, path)?;
                Ok(async_root_logger(name, *level, drain))
            }
        }
    }
}

// The terminal and file drains aren't Sync on their own; the async drain
// serializes them on a dedicated thread.
fn async_root_logger<T>(
    name: &'static str,
    level: ConfigLoggingLevel,
    drain: T,
) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, o!("name" => name, "pid" => std::process::id()))
}

fn log_drain_for_file(
    open_options: &OpenOptions,
    path: &Utf8Path,
) -> Result<slog::Fuse<slog_json::Json<std::fs::File>>, LogInitError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|err| {
            LogInitError::CreateDir { path: parent.to_owned(), err }
        })?;
    }
    let file = open_options
        .open(path)
        .map_err(|err| LogInitError::Open { path: path.to_owned(), err })?;

    // Tell whoever is watching stderr where the rest of the log went.
    eprintln!("note: configured to log to \"{}\"", path);
    Ok(slog_json::Json::new(file)
        .set_newlines(true)
        .add_default_keys()
        .build()
        .fuse())
}
