//! Host model: cluster nodes, their roles and health, and endpoint templates

use crate::error::{FailoverError, FailoverResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a node within the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostRole {
    /// Node accepting writes
    Writer,
    /// Read-only replica
    Reader,
}

/// Last known health of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostState {
    Up,
    Down,
}

/// A single cluster node as reported by the metadata probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    host: String,
    port: u16,
    /// Cluster-assigned stable identifier, independent of DNS
    pub instance_id: String,
    /// Session id from the replica-status view; the writer row carries the sentinel
    pub session_id: String,
    /// Timestamp of the row this host was built from
    pub last_updated: Option<DateTime<Utc>>,
    /// Replication lag in milliseconds, readers only
    pub replica_lag_ms: Option<f64>,
    role: HostRole,
    state: HostState,
}

impl HostInfo {
    /// Create a host entry with no probe metadata
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            instance_id: String::new(),
            session_id: String::new(),
            last_updated: None,
            replica_lag_ms: None,
            role: HostRole::Reader,
            state: HostState::Up,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Endpoint rendered as `host:port`
    pub fn host_port_pair(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Two hosts are the same node when their endpoint pairs match
    pub fn is_same(&self, other: &HostInfo) -> bool {
        self.host_port_pair() == other.host_port_pair()
    }

    pub fn role(&self) -> HostRole {
        self.role
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn is_writer(&self) -> bool {
        self.role == HostRole::Writer
    }

    pub fn is_up(&self) -> bool {
        self.state == HostState::Up
    }

    pub fn is_down(&self) -> bool {
        self.state == HostState::Down
    }

    pub(crate) fn set_role(&mut self, role: HostRole) {
        self.role = role;
    }

    pub(crate) fn set_state(&mut self, state: HostState) {
        self.state = state;
    }
}

/// Template of the form `?.<suffix>` used to synthesize instance endpoints
/// from the instance ids reported by the metadata table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPattern {
    template: String,
    port: u16,
}

impl HostPattern {
    /// Build a pattern, rejecting templates without the `?` placeholder
    pub fn new(template: impl Into<String>, port: u16) -> FailoverResult<Self> {
        let template = template.into();
        if !template.contains('?') {
            return Err(FailoverError::Configuration(format!(
                "invalid host pattern '{}' - the host pattern must contain a '?' character \
                 as a placeholder for the instance identifiers of the cluster",
                template
            )));
        }
        Ok(Self { template, port })
    }

    /// A literal endpoint used verbatim as every instance's endpoint.
    /// Custom domains fronting a cluster have no per-instance DNS, so the
    /// placeholder rule does not apply.
    pub(crate) fn literal(host: impl Into<String>, port: u16) -> Self {
        Self {
            template: host.into(),
            port,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Substitute an instance id into the placeholder, yielding the endpoint
    pub fn instantiate(&self, instance_id: &str) -> String {
        self.template.replacen('?', instance_id, 1)
    }
}
