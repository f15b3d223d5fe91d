//! Cluster topology discovery and caching
//!
//! This module provides:
//! - The metadata probe against the cluster's replica-status view
//! - A per-cluster topology cache with refresh-rate and idle-expiry semantics
//! - Per-host up/down tracking shared by the failover engines

pub mod info;

pub use info::ClusterTopology;

use crate::adapter::ConnectionAdapter;
use crate::error::{FailoverError, FailoverResult};
use crate::host::{HostInfo, HostPattern, HostRole, HostState};
use crate::metrics::FailoverMetrics;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Metadata probe issued to any cluster member; rows older than five minutes
/// are excluded by the statement itself
pub const RETRIEVE_TOPOLOGY_SQL: &str =
    "SELECT SERVER_ID, SESSION_ID, LAST_UPDATE_TIMESTAMP, REPLICA_LAG_IN_MILLISECONDS \
     FROM information_schema.replica_host_status \
     WHERE time_to_sec(timediff(now(), LAST_UPDATE_TIMESTAMP)) <= 300 \
     ORDER BY LAST_UPDATE_TIMESTAMP DESC";

/// Probe returning the instance id of the connected node
pub const GET_INSTANCE_NAME_SQL: &str = "SELECT @@aurora_server_id";

/// Sentinel session id identifying the writer row
pub const WRITER_SESSION_ID: &str = "MASTER_SESSION_ID";

/// Default topology refresh cadence
pub const DEFAULT_REFRESH_RATE_MS: u64 = 30_000;

/// Default idle lifetime of a cache entry
pub const DEFAULT_CACHE_EXPIRE_MS: u64 = 5 * 60 * 1000;

struct CacheEntry {
    topology: Arc<ClusterTopology>,
    refreshed_at: Instant,
    touched_at: Instant,
    down_hosts: HashSet<String>,
    last_used_reader: Option<String>,
}

/// Maintains a per-cluster view of live hosts under soft-freshness guarantees.
///
/// The cache and the down-host set share a single mutex; published snapshots
/// are `Arc`s replaced atomically, never mutated in place.
pub struct TopologyService {
    cluster_id: Mutex<String>,
    instance_template: Mutex<Option<HostPattern>>,
    refresh_rate: Mutex<Duration>,
    cache_expire: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    metrics: Option<Arc<FailoverMetrics>>,
}

impl TopologyService {
    pub fn new() -> Self {
        Self::with_cache_expiry(Duration::from_millis(DEFAULT_CACHE_EXPIRE_MS))
    }

    pub fn with_cache_expiry(cache_expire: Duration) -> Self {
        Self {
            cluster_id: Mutex::new(String::new()),
            instance_template: Mutex::new(None),
            refresh_rate: Mutex::new(Duration::from_millis(DEFAULT_REFRESH_RATE_MS)),
            cache_expire,
            cache: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Attach a metrics sink for cache hit/miss accounting
    pub fn with_metrics(mut self, metrics: Arc<FailoverMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the cluster identity used as the cache key; callable only before
    /// first use per cluster
    pub fn set_cluster_id(&self, cluster_id: impl Into<String>) {
        *self.cluster_id.lock() = cluster_id.into();
    }

    pub fn cluster_id(&self) -> String {
        self.cluster_id.lock().clone()
    }

    /// Set the `?.<suffix>` template used to synthesize instance endpoints
    pub fn set_cluster_instance_template(&self, template: HostPattern) {
        *self.instance_template.lock() = Some(template);
    }

    pub fn set_refresh_rate(&self, refresh_rate_ms: u64) {
        *self.refresh_rate.lock() = Duration::from_millis(refresh_rate_ms);
    }

    /// Return the cached topology when fresh, otherwise probe through the
    /// given connection and replace the cache entry.
    ///
    /// Fails with [`FailoverError::TopologyUnavailable`] when the probe
    /// returns zero rows (or errors) and no cached copy exists; a stale cache
    /// entry is retained across failed probes so a later failover attempt can
    /// still use it.
    pub fn get_topology(
        &self,
        conn: &mut dyn ConnectionAdapter,
        force_update: bool,
    ) -> FailoverResult<Arc<ClusterTopology>> {
        let cluster_id = self.cluster_id();

        if !force_update {
            let mut cache = self.cache.lock();
            if let Some(entry) = Self::live_entry(&mut cache, &cluster_id, self.cache_expire) {
                if entry.refreshed_at.elapsed() <= *self.refresh_rate.lock() {
                    entry.touched_at = Instant::now();
                    if let Some(m) = &self.metrics {
                        m.register_topology_cache_hit(&cluster_id);
                    }
                    return Ok(entry.topology.clone());
                }
            }
        }

        if let Some(m) = &self.metrics {
            m.register_topology_cache_miss(&cluster_id);
        }

        match self.query_for_topology(conn) {
            Ok(topology) if topology.total_hosts() > 0 => {
                let topology = Arc::new(topology);
                let mut cache = self.cache.lock();
                let now = Instant::now();
                let published = match cache.get_mut(&cluster_id) {
                    Some(entry) => {
                        entry.topology = Self::apply_down_hosts(&topology, &entry.down_hosts);
                        entry.refreshed_at = now;
                        entry.touched_at = now;
                        entry.topology.clone()
                    }
                    None => {
                        cache.insert(
                            cluster_id.clone(),
                            CacheEntry {
                                topology: topology.clone(),
                                refreshed_at: now,
                                touched_at: now,
                                down_hosts: HashSet::new(),
                                last_used_reader: None,
                            },
                        );
                        topology
                    }
                };
                debug!(
                    cluster = %cluster_id,
                    hosts = published.total_hosts(),
                    "topology refreshed"
                );
                Ok(published)
            }
            Ok(_) => {
                // Zero rows: keep the previous entry if one exists.
                warn!(cluster = %cluster_id, "topology probe returned no hosts");
                let mut cache = self.cache.lock();
                match Self::live_entry(&mut cache, &cluster_id, self.cache_expire) {
                    Some(entry) => {
                        entry.touched_at = Instant::now();
                        Ok(entry.topology.clone())
                    }
                    None => Err(FailoverError::TopologyUnavailable),
                }
            }
            Err(err) => {
                warn!(cluster = %cluster_id, %err, "topology probe failed");
                Err(FailoverError::TopologyUnavailable)
            }
        }
    }

    /// Return the cached topology without probing
    pub fn get_cached_topology(&self) -> Option<Arc<ClusterTopology>> {
        let cluster_id = self.cluster_id();
        let mut cache = self.cache.lock();
        Self::live_entry(&mut cache, &cluster_id, self.cache_expire).map(|entry| {
            entry.touched_at = Instant::now();
            entry.topology.clone()
        })
    }

    /// Flag a host Down in the down-host set and the cached snapshot.
    /// Idempotent; does not invalidate the cache.
    pub fn mark_host_down(&self, host: &HostInfo) {
        self.set_host_state(host, HostState::Down);
    }

    /// Flag a host Up again. Idempotent; does not invalidate the cache.
    pub fn mark_host_up(&self, host: &HostInfo) {
        self.set_host_state(host, HostState::Up);
    }

    /// Endpoints currently believed Down for the active cluster
    pub fn get_down_hosts(&self) -> HashSet<String> {
        let cluster_id = self.cluster_id();
        let cache = self.cache.lock();
        cache
            .get(&cluster_id)
            .map(|entry| entry.down_hosts.clone())
            .unwrap_or_default()
    }

    /// The reader most recently vended to a caller, resolved against the
    /// current snapshot; survives topology refreshes by instance id
    pub fn get_last_used_reader(&self) -> Option<HostInfo> {
        let cluster_id = self.cluster_id();
        let cache = self.cache.lock();
        let entry = cache.get(&cluster_id)?;
        let instance_id = entry.last_used_reader.as_deref()?;
        entry
            .topology
            .find_reader_by_instance(instance_id)
            .cloned()
    }

    pub fn set_last_used_reader(&self, reader: &HostInfo) {
        let cluster_id = self.cluster_id();
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get_mut(&cluster_id) {
            entry.last_used_reader = Some(reader.instance_id.clone());
        }
    }

    /// Drop the cache entry for the active cluster
    pub fn clear(&self) {
        let cluster_id = self.cluster_id();
        self.cache.lock().remove(&cluster_id);
    }

    /// Drop every cache entry
    pub fn clear_all(&self) {
        self.cache.lock().clear();
    }

    fn set_host_state(&self, host: &HostInfo, state: HostState) {
        let cluster_id = self.cluster_id();
        let pair = host.host_port_pair();
        let mut cache = self.cache.lock();
        let Some(entry) = cache.get_mut(&cluster_id) else {
            return;
        };

        match state {
            HostState::Down => entry.down_hosts.insert(pair.clone()),
            HostState::Up => entry.down_hosts.remove(&pair),
        };

        // Copy-on-write: published snapshots stay immutable.
        let mut topology = (*entry.topology).clone();
        topology.set_host_state(&pair, state);
        entry.topology = Arc::new(topology);
        debug!(cluster = %cluster_id, host = %pair, ?state, "host state updated");
    }

    fn live_entry<'a>(
        cache: &'a mut HashMap<String, CacheEntry>,
        cluster_id: &str,
        cache_expire: Duration,
    ) -> Option<&'a mut CacheEntry> {
        if let Some(entry) = cache.get(cluster_id) {
            if entry.touched_at.elapsed() > cache_expire {
                cache.remove(cluster_id);
                return None;
            }
        }
        cache.get_mut(cluster_id)
    }

    fn apply_down_hosts(
        topology: &Arc<ClusterTopology>,
        down_hosts: &HashSet<String>,
    ) -> Arc<ClusterTopology> {
        if down_hosts.is_empty() {
            return topology.clone();
        }
        let mut updated = (**topology).clone();
        for pair in down_hosts {
            updated.set_host_state(pair, HostState::Down);
        }
        Arc::new(updated)
    }

    fn query_for_topology(
        &self,
        conn: &mut dyn ConnectionAdapter,
    ) -> FailoverResult<ClusterTopology> {
        let rows = conn.query(RETRIEVE_TOPOLOGY_SQL)?;
        let mut topology = ClusterTopology::new();
        for row in rows {
            topology.add_host(self.create_host(&row));
        }
        Ok(topology)
    }

    fn create_host(&self, row: &[String]) -> HostInfo {
        let instance_id = row.first().cloned().unwrap_or_default();
        let session_id = row.get(1).cloned().unwrap_or_default();

        let (endpoint, port) = match self.instance_template.lock().as_ref() {
            Some(template) => (template.instantiate(&instance_id), template.port()),
            // No template configured (literal-IP connection): the bare
            // instance id is the best endpoint available.
            None => (instance_id.clone(), crate::config::DEFAULT_PORT),
        };

        let mut host = HostInfo::new(endpoint, port);
        host.instance_id = instance_id;
        host.last_updated = row
            .get(2)
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok())
            .map(|naive| naive.and_utc());
        host.replica_lag_ms = row.get(3).and_then(|s| s.parse().ok());
        if session_id == WRITER_SESSION_ID {
            host.set_role(HostRole::Writer);
        }
        host.session_id = session_id;
        host
    }
}

impl Default for TopologyService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Row;

    /// Connection stub serving a scripted set of probe rows
    struct ProbeConn {
        rows: Vec<Row>,
        fail: bool,
        queries: usize,
    }

    impl ProbeConn {
        fn new(rows: Vec<Row>) -> Self {
            Self {
                rows,
                fail: false,
                queries: 0,
            }
        }

        fn failing() -> Self {
            Self {
                rows: Vec::new(),
                fail: true,
                queries: 0,
            }
        }
    }

    impl ConnectionAdapter for ProbeConn {
        fn connect(
            &mut self,
            _host: &str,
            _user: &str,
            _password: &str,
            _database: &str,
            _port: u16,
            _socket: Option<&str>,
            _flags: u64,
        ) -> bool {
            true
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn close(&mut self) {}

        fn query(&mut self, _sql: &str) -> FailoverResult<Vec<Row>> {
            self.queries += 1;
            if self.fail {
                Err(FailoverError::Query("08S01".to_string()))
            } else {
                Ok(self.rows.clone())
            }
        }

        fn error_code(&self) -> String {
            String::new()
        }
    }

    fn row(server_id: &str, session_id: &str) -> Row {
        vec![
            server_id.to_string(),
            session_id.to_string(),
            "2026-08-02 12:00:00".to_string(),
            "13.5".to_string(),
        ]
    }

    fn service() -> TopologyService {
        let service = TopologyService::new();
        service.set_cluster_id("test-cluster");
        service.set_cluster_instance_template(
            HostPattern::new("?.XYZ.us-east-2.rds.amazonaws.com", 3306).unwrap(),
        );
        service
    }

    fn three_node_rows() -> Vec<Row> {
        vec![
            row("writer-a", WRITER_SESSION_ID),
            row("reader-b", "session-b"),
            row("reader-c", "session-c"),
        ]
    }

    #[test]
    fn test_probe_builds_topology() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());

        let topology = service.get_topology(&mut conn, false).unwrap();
        assert_eq!(topology.total_hosts(), 3);
        assert_eq!(topology.num_readers(), 2);
        assert!(!topology.is_multi_writer());

        let writer = topology.writer().unwrap();
        assert_eq!(writer.instance_id, "writer-a");
        assert_eq!(writer.host(), "writer-a.XYZ.us-east-2.rds.amazonaws.com");
        assert!(writer.last_updated.is_some());
        assert_eq!(writer.replica_lag_ms, Some(13.5));
    }

    #[test]
    fn test_multi_writer_detection() {
        let service = service();
        let mut conn = ProbeConn::new(vec![
            row("writer-a", WRITER_SESSION_ID),
            row("writer-b", WRITER_SESSION_ID),
            row("reader-c", "session-c"),
        ]);

        let topology = service.get_topology(&mut conn, false).unwrap();
        assert!(topology.is_multi_writer());
        assert_eq!(topology.writers().len(), 2);
        assert_eq!(topology.writers()[0].instance_id, "writer-a");
    }

    #[test]
    fn test_cached_topology_is_same_instance() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());

        let probed = service.get_topology(&mut conn, true).unwrap();
        let cached = service.get_cached_topology().unwrap();
        assert!(Arc::ptr_eq(&probed, &cached));
    }

    #[test]
    fn test_fresh_cache_skips_probe() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());

        service.get_topology(&mut conn, false).unwrap();
        service.get_topology(&mut conn, false).unwrap();
        assert_eq!(conn.queries, 1);

        // A forced refresh always probes.
        service.get_topology(&mut conn, true).unwrap();
        assert_eq!(conn.queries, 2);
    }

    #[test]
    fn test_zero_rows_retains_previous_entry() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());
        let first = service.get_topology(&mut conn, true).unwrap();

        let mut empty_conn = ProbeConn::new(Vec::new());
        let retained = service.get_topology(&mut empty_conn, true).unwrap();
        assert!(Arc::ptr_eq(&first, &retained));
    }

    #[test]
    fn test_zero_rows_without_cache_is_unavailable() {
        let service = service();
        let mut conn = ProbeConn::new(Vec::new());
        assert!(matches!(
            service.get_topology(&mut conn, false),
            Err(FailoverError::TopologyUnavailable)
        ));
    }

    #[test]
    fn test_probe_error_keeps_cache() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());
        service.get_topology(&mut conn, true).unwrap();

        let mut dead_conn = ProbeConn::failing();
        assert!(matches!(
            service.get_topology(&mut dead_conn, true),
            Err(FailoverError::TopologyUnavailable)
        ));
        // A stale view is still served for the next failover attempt.
        assert!(service.get_cached_topology().is_some());
    }

    #[test]
    fn test_mark_host_down_and_up() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());
        let topology = service.get_topology(&mut conn, false).unwrap();
        let reader = topology.readers()[0].clone();

        service.mark_host_down(&reader);
        service.mark_host_down(&reader);
        assert_eq!(service.get_down_hosts().len(), 1);
        let cached = service.get_cached_topology().unwrap();
        assert!(cached.find_host(&reader.host_port_pair()).unwrap().is_down());
        // The published snapshot held by the caller is untouched.
        assert!(topology.find_host(&reader.host_port_pair()).unwrap().is_up());
        // Flagged, never evicted.
        assert_eq!(cached.total_hosts(), 3);

        service.mark_host_up(&reader);
        assert!(service.get_down_hosts().is_empty());
        let cached = service.get_cached_topology().unwrap();
        assert!(cached.find_host(&reader.host_port_pair()).unwrap().is_up());
    }

    #[test]
    fn test_down_hosts_survive_refresh() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());
        let topology = service.get_topology(&mut conn, false).unwrap();
        let reader = topology.readers()[0].clone();

        service.mark_host_down(&reader);
        let refreshed = service.get_topology(&mut conn, true).unwrap();
        assert!(refreshed
            .find_host(&reader.host_port_pair())
            .unwrap()
            .is_down());
    }

    #[test]
    fn test_last_used_reader_survives_refresh() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());
        let topology = service.get_topology(&mut conn, false).unwrap();
        let reader = topology.readers()[1].clone();

        service.set_last_used_reader(&reader);
        service.get_topology(&mut conn, true).unwrap();
        assert_eq!(
            service.get_last_used_reader().unwrap().instance_id,
            reader.instance_id
        );
    }

    #[test]
    fn test_clear_and_clear_all() {
        let service = service();
        let mut conn = ProbeConn::new(three_node_rows());
        service.get_topology(&mut conn, false).unwrap();

        service.clear();
        assert!(service.get_cached_topology().is_none());

        service.get_topology(&mut conn, false).unwrap();
        service.clear_all();
        assert!(service.get_cached_topology().is_none());
    }

    #[test]
    fn test_idle_entries_expire() {
        let service = TopologyService::with_cache_expiry(Duration::from_millis(0));
        service.set_cluster_id("test-cluster");
        service.set_cluster_instance_template(
            HostPattern::new("?.XYZ.us-east-2.rds.amazonaws.com", 3306).unwrap(),
        );

        let mut conn = ProbeConn::new(three_node_rows());
        service.get_topology(&mut conn, false).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(service.get_cached_topology().is_none());
    }

    #[test]
    fn test_host_without_template_uses_instance_id() {
        let service = TopologyService::new();
        service.set_cluster_id("test-cluster");

        let mut conn = ProbeConn::new(vec![row("writer-a", WRITER_SESSION_ID)]);
        let topology = service.get_topology(&mut conn, false).unwrap();
        assert_eq!(topology.writer().unwrap().host(), "writer-a");
    }
}
