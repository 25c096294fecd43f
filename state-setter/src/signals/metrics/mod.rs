// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware health metrics scraped from each machine

pub mod exposition;

use async_trait::async_trait;
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;
use std::time::Duration;

/// One labeled value of a metric family.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Sample {
    /// Hardware health metrics report 0 for "OK" and anything else for a
    /// warning or failure.
    pub fn is_healthy(&self) -> bool {
        self.value == 0.0
    }
}

/// Samples keyed by metric family name.
pub type MetricFamilies = BTreeMap<String, Vec<Sample>>;

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum MetricsError {
    #[error("failed to fetch metrics from {url}")]
    Request {
        url: String,
        #[source]
        err: reqwest::Error,
    },
    #[error("metrics request to {url} returned {status}")]
    Status { url: String, status: reqwest::StatusCode },
    #[error("failed to parse metrics from {url}")]
    Parse {
        url: String,
        #[source]
        err: exposition::ParseError,
    },
    #[error("timed out fetching metrics from {address}")]
    Timeout { address: String },
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Scrapes the metrics exposed by the machine at `address`.
    async fn fetch(
        &self,
        address: &str,
    ) -> Result<MetricFamilies, MetricsError>;
}

/// Scrapes the exposition endpoint every machine serves on a fixed port and
/// path.
pub struct HttpMetricsSource {
    client: reqwest::Client,
    port: u16,
    path: String,
}

impl HttpMetricsSource {
    pub fn new(
        port: u16,
        path: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { client, port, path })
    }

    fn url(&self, address: &str) -> String {
        if address.contains(':') {
            format!("http://[{}]:{}{}", address, self.port, self.path)
        } else {
            format!("http://{}:{}{}", address, self.port, self.path)
        }
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    async fn fetch(
        &self,
        address: &str,
    ) -> Result<MetricFamilies, MetricsError> {
        let url = self.url(address);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| MetricsError::Request { url: url.clone(), err })?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::Status { url, status });
        }
        let body = response
            .text()
            .await
            .map_err(|err| MetricsError::Request { url: url.clone(), err })?;
        exposition::parse(&body).map_err(|err| MetricsError::Parse { url, err })
    }
}
