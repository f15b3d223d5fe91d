//! Failover configuration
//!
//! This module provides:
//! - The recognized cluster-failover options with their defaults
//! - Validation applied before the dispatcher initializes

use crate::error::{FailoverError, FailoverResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default MySQL port used when a server string carries none
pub const DEFAULT_PORT: u16 = 3306;

/// Cluster-failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Server endpoint as supplied by the caller (single host or comma-separated list)
    pub server: String,
    /// Server port
    pub port: u16,
    /// Skip cluster detection entirely and connect plainly
    pub disable_cluster_failover: bool,
    /// Explicit instance host template containing a `?` placeholder
    pub host_pattern: String,
    /// Explicit cluster identity for the topology cache (derived when empty)
    pub cluster_id: String,
    /// Topology refresh cadence in milliseconds
    pub topology_refresh_rate_ms: u64,
    /// Global deadline for any failover invocation in milliseconds
    pub failover_timeout_ms: u64,
    /// Per-pair connection deadline during reader failover in milliseconds
    pub failover_reader_connect_timeout_ms: u64,
    /// Sleep between topology probes in the new-writer strategy in milliseconds
    pub failover_topology_refresh_rate_ms: u64,
    /// Sleep between reconnect attempts in the reconnect-writer strategy in milliseconds
    pub failover_writer_reconnect_interval_ms: u64,
    /// Permit failover to a reader when the writer errors
    pub allow_reader_connections: bool,
    /// Enable the performance metrics sink
    pub gather_perf_metrics: bool,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_PORT,
            disable_cluster_failover: false,
            host_pattern: String::new(),
            cluster_id: String::new(),
            topology_refresh_rate_ms: 30_000,
            failover_timeout_ms: 60_000,
            failover_reader_connect_timeout_ms: 30_000,
            failover_topology_refresh_rate_ms: 5_000,
            failover_writer_reconnect_interval_ms: 5_000,
            allow_reader_connections: false,
            gather_perf_metrics: false,
        }
    }
}

impl FailoverConfig {
    /// Validate option values before first use
    pub fn validate(&self) -> FailoverResult<()> {
        if self.failover_timeout_ms == 0 {
            return Err(FailoverError::Configuration(
                "failover_timeout must be greater than zero".to_string(),
            ));
        }

        if self.failover_reader_connect_timeout_ms == 0 {
            return Err(FailoverError::Configuration(
                "failover_reader_connect_timeout must be greater than zero".to_string(),
            ));
        }

        if self.topology_refresh_rate_ms == 0 {
            return Err(FailoverError::Configuration(
                "topology_refresh_rate must be greater than zero".to_string(),
            ));
        }

        if !self.host_pattern.is_empty() && !self.host_pattern.contains('?') {
            return Err(FailoverError::Configuration(format!(
                "invalid host pattern '{}' - the host pattern must contain a '?' character \
                 as a placeholder for the instance identifiers of the cluster",
                self.host_pattern
            )));
        }

        Ok(())
    }

    /// Global failover deadline
    pub fn failover_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_timeout_ms)
    }

    /// Per-pair reader connect deadline
    pub fn reader_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.failover_reader_connect_timeout_ms)
    }

    /// Inner sleep for the new-writer strategy
    pub fn read_topology_interval(&self) -> Duration {
        Duration::from_millis(self.failover_topology_refresh_rate_ms)
    }

    /// Inner sleep for the reconnect-writer strategy
    pub fn reconnect_writer_interval(&self) -> Duration {
        Duration::from_millis(self.failover_writer_reconnect_interval_ms)
    }
}
