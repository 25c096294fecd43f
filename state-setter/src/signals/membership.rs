// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cluster membership (liveness) as reported by the gossip layer

use crate::exec::{command, execute_async, ExecutionError};
use async_trait::async_trait;
use serde::Deserialize;
use slog_error_chain::SlogInlineError;
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Membership tag a machine uses to publish its failed systemd units.
pub const SYSTEMD_UNITS_FAILED_TAG: &str = "systemd-units-failed";

/// Liveness of a member as classified by the gossip layer.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub status: MemberStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Member {
    pub fn is_alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }

    pub fn systemd_units_failed(&self) -> Option<&str> {
        self.tags.get(SYSTEMD_UNITS_FAILED_TAG).map(String::as_str)
    }
}

/// Members keyed by address (without port).
pub type Members = BTreeMap<String, Member>;

#[derive(Debug, thiserror::Error, SlogInlineError)]
pub enum MembershipError {
    #[error("failed to run membership query")]
    Exec(#[from] ExecutionError),
    #[error("failed to parse membership query output")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait Membership: Send + Sync {
    /// Returns a snapshot of every member of the cluster.
    async fn list_members(&self) -> Result<Members, MembershipError>;
}

/// Queries membership by running `serf members -format json` (or whatever
/// equivalent command is configured).
pub struct SerfMembership {
    argv: Vec<String>,
}

impl SerfMembership {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl Membership for SerfMembership {
    async fn list_members(&self) -> Result<Members, MembershipError> {
        let output = execute_async(&mut command(&self.argv)?).await?;
        parse_members(&output.stdout)
    }
}

#[derive(Deserialize)]
struct SerfMembers {
    members: Vec<SerfMember>,
}

#[derive(Deserialize)]
struct SerfMember {
    addr: String,
    #[serde(flatten)]
    member: Member,
}

/// Parses the JSON output of `serf members`.
pub fn parse_members(json: &[u8]) -> Result<Members, MembershipError> {
    let parsed: SerfMembers = serde_json::from_slice(json)?;
    Ok(parsed
        .members
        .into_iter()
        .map(|m| (strip_port(&m.addr).to_string(), m.member))
        .collect())
}

/// Strips a trailing `:port` from `addr` if it has one.
///
/// Handles bracketed IPv6 socket addresses; a bare IPv6 address is returned
/// unchanged.
pub fn strip_port(addr: &str) -> &str {
    if addr.parse::<SocketAddr>().is_ok() {
        let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);
        return host.trim_start_matches('[').trim_end_matches(']');
    }
    match addr.rsplit_once(':') {
        // A hostname with a port.
        Some((host, port))
            if !host.contains(':') && port.parse::<u16>().is_ok() =>
        {
            host
        }
        _ => addr,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("10.0.0.1:7946"), "10.0.0.1");
        assert_eq!(strip_port("10.0.0.1"), "10.0.0.1");
        assert_eq!(strip_port("[fd00::1]:7946"), "fd00::1");
        assert_eq!(strip_port("fd00::1"), "fd00::1");
        assert_eq!(strip_port("node-1.example:9105"), "node-1.example");
        assert_eq!(strip_port("node-1.example"), "node-1.example");
    }

    #[test]
    fn test_parse_members() {
        let json = br#"{
            "members": [
                {
                    "name": "rack0-cs1",
                    "addr": "10.69.0.4:7946",
                    "port": 7946,
                    "tags": {"systemd-units-failed": "", "serial": "ABC"},
                    "status": "alive",
                    "protocol": {"max": 5, "min": 2, "version": 4}
                },
                {
                    "name": "rack0-cs2",
                    "addr": "10.69.0.5:7946",
                    "port": 7946,
                    "tags": {"systemd-units-failed": "chrony.service"},
                    "status": "failed"
                },
                {
                    "name": "rack0-cs3",
                    "addr": "10.69.0.6:7946",
                    "status": "something-new"
                }
            ]
        }"#;
        let members = parse_members(json).unwrap();
        assert_eq!(members.len(), 3);

        let cs1 = &members["10.69.0.4"];
        assert!(cs1.is_alive());
        assert_eq!(cs1.systemd_units_failed(), Some(""));

        let cs2 = &members["10.69.0.5"];
        assert_eq!(cs2.status, MemberStatus::Failed);
        assert_eq!(cs2.systemd_units_failed(), Some("chrony.service"));

        let cs3 = &members["10.69.0.6"];
        assert_eq!(cs3.status, MemberStatus::Unknown);
        assert_eq!(cs3.systemd_units_failed(), None);
    }

    #[test]
    fn test_parse_members_garbage() {
        assert!(matches!(
            parse_members(b"serf: command not found"),
            Err(MembershipError::Parse(_))
        ));
    }
}
