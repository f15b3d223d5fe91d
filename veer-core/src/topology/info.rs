//! Point-in-time cluster topology snapshot

use crate::host::{HostInfo, HostState};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Enumeration of cluster nodes with their roles and health at one instant.
///
/// Snapshots are immutable once published; the topology service replaces
/// the cached snapshot atomically instead of mutating it in place.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterTopology {
    writers: Vec<HostInfo>,
    readers: Vec<HostInfo>,
    last_updated: DateTime<Utc>,
}

impl ClusterTopology {
    pub fn new() -> Self {
        Self {
            writers: Vec::new(),
            readers: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Add a host under the role it carries
    pub fn add_host(&mut self, host: HostInfo) {
        if host.is_writer() {
            self.writers.push(host);
        } else {
            self.readers.push(host);
        }
        self.last_updated = Utc::now();
    }

    pub fn total_hosts(&self) -> usize {
        self.writers.len() + self.readers.len()
    }

    pub fn num_readers(&self) -> usize {
        self.readers.len()
    }

    /// More than one writer row was reported by the metadata view
    pub fn is_multi_writer(&self) -> bool {
        self.writers.len() > 1
    }

    /// The writer, when the cluster has exactly one or more; first in probe order
    pub fn writer(&self) -> Option<&HostInfo> {
        self.writers.first()
    }

    pub fn writers(&self) -> &[HostInfo] {
        &self.writers
    }

    pub fn readers(&self) -> &[HostInfo] {
        &self.readers
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Find a host by its `host:port` endpoint pair
    pub fn find_host(&self, host_port_pair: &str) -> Option<&HostInfo> {
        self.writers
            .iter()
            .chain(self.readers.iter())
            .find(|h| h.host_port_pair() == host_port_pair)
    }

    /// Find a reader by instance id
    pub fn find_reader_by_instance(&self, instance_id: &str) -> Option<&HostInfo> {
        self.readers.iter().find(|h| h.instance_id == instance_id)
    }

    pub(crate) fn set_host_state(&mut self, host_port_pair: &str, state: HostState) {
        for host in self.writers.iter_mut().chain(self.readers.iter_mut()) {
            if host.host_port_pair() == host_port_pair {
                host.set_state(state);
            }
        }
    }
}

impl Default for ClusterTopology {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostRole;

    fn host(name: &str, role: HostRole) -> HostInfo {
        let mut h = HostInfo::new(name, 3306);
        h.instance_id = name.to_string();
        h.set_role(role);
        h
    }

    #[test]
    fn test_host_counts() {
        let mut topology = ClusterTopology::new();
        topology.add_host(host("w0", HostRole::Writer));
        topology.add_host(host("r1", HostRole::Reader));
        topology.add_host(host("r2", HostRole::Reader));

        assert_eq!(topology.total_hosts(), 3);
        assert_eq!(topology.num_readers(), 2);
        assert_eq!(
            topology.total_hosts(),
            topology.writers().len() + topology.readers().len()
        );
        assert!(!topology.is_multi_writer());
        assert_eq!(topology.writer().unwrap().host(), "w0");
    }

    #[test]
    fn test_multi_writer_flag_tracks_writer_count() {
        let mut topology = ClusterTopology::new();
        topology.add_host(host("w0", HostRole::Writer));
        assert!(!topology.is_multi_writer());

        topology.add_host(host("w1", HostRole::Writer));
        assert!(topology.is_multi_writer());
        assert_eq!(topology.writers().len(), 2);
    }

    #[test]
    fn test_find_host() {
        let mut topology = ClusterTopology::new();
        topology.add_host(host("w0", HostRole::Writer));
        topology.add_host(host("r1", HostRole::Reader));

        assert!(topology.find_host("r1:3306").is_some());
        assert!(topology.find_host("r1:3307").is_none());
        assert!(topology.find_reader_by_instance("r1").is_some());
        assert!(topology.find_reader_by_instance("w0").is_none());
    }

    #[test]
    fn test_set_host_state() {
        let mut topology = ClusterTopology::new();
        topology.add_host(host("r1", HostRole::Reader));

        topology.set_host_state("r1:3306", HostState::Down);
        assert!(topology.find_host("r1:3306").unwrap().is_down());

        topology.set_host_state("r1:3306", HostState::Up);
        assert!(topology.find_host("r1:3306").unwrap().is_up());
    }
}
