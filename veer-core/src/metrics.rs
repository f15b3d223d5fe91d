//! Cluster-aware failover metrics
//!
//! Thread-safe counters for failover behaviour, aggregated per cluster.
//! Every register call is a no-op unless the sink was created enabled
//! (`gather_perf_metrics`).

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Running sum/count/max for one timed quantity
#[derive(Debug, Default)]
struct TimingStats {
    sum_ms: AtomicU64,
    count: AtomicU64,
    max_ms: AtomicU64,
}

impl TimingStats {
    fn record(&self, elapsed_ms: u64) {
        self.sum_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.max_ms.fetch_max(elapsed_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TimingSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        let sum = self.sum_ms.load(Ordering::Relaxed);
        TimingSnapshot {
            count,
            avg_ms: if count == 0 { 0 } else { sum / count },
            max_ms: self.max_ms.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one timed quantity
#[derive(Debug, Clone, Serialize)]
pub struct TimingSnapshot {
    pub count: u64,
    pub avg_ms: u64,
    pub max_ms: u64,
}

/// Per-cluster counters
#[derive(Debug, Default)]
struct ClusterMetrics {
    failure_detection: TimingStats,
    reader_failover_procedure: TimingStats,
    writer_failover_procedure: TimingStats,
    successful_failover_connects: AtomicU64,
    failed_failover_connects: AtomicU64,
    invalid_initial_connections: AtomicU64,
    topology_cache_hits: AtomicU64,
    topology_cache_misses: AtomicU64,
}

/// Point-in-time view of one cluster's failover metrics
#[derive(Debug, Clone, Serialize)]
pub struct ClusterMetricsSnapshot {
    pub cluster_id: String,
    pub failure_detection: TimingSnapshot,
    pub reader_failover_procedure: TimingSnapshot,
    pub writer_failover_procedure: TimingSnapshot,
    pub successful_failover_connects: u64,
    pub failed_failover_connects: u64,
    pub invalid_initial_connections: u64,
    pub topology_cache_hits: u64,
    pub topology_cache_misses: u64,
}

/// Failover metrics sink, keyed by cluster id
#[derive(Debug)]
pub struct FailoverMetrics {
    enabled: bool,
    clusters: DashMap<String, ClusterMetrics>,
}

impl FailoverMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            clusters: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn with_cluster(&self, cluster_id: &str, f: impl FnOnce(&ClusterMetrics)) {
        if !self.enabled {
            return;
        }
        let entry = self
            .clusters
            .entry(cluster_id.to_string())
            .or_default();
        f(entry.value());
    }

    /// Time from statement invocation to the connection error being observed
    pub fn register_failure_detection_time(&self, cluster_id: &str, elapsed_ms: u64) {
        self.with_cluster(cluster_id, |m| m.failure_detection.record(elapsed_ms));
    }

    pub fn register_reader_failover_procedure_time(&self, cluster_id: &str, elapsed_ms: u64) {
        self.with_cluster(cluster_id, |m| {
            m.reader_failover_procedure.record(elapsed_ms)
        });
    }

    pub fn register_writer_failover_procedure_time(&self, cluster_id: &str, elapsed_ms: u64) {
        self.with_cluster(cluster_id, |m| {
            m.writer_failover_procedure.record(elapsed_ms)
        });
    }

    pub fn register_failover_connects(&self, cluster_id: &str, success: bool) {
        self.with_cluster(cluster_id, |m| {
            let counter = if success {
                &m.successful_failover_connects
            } else {
                &m.failed_failover_connects
            };
            counter.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn register_invalid_initial_connection(&self, cluster_id: &str, invalid: bool) {
        if !invalid {
            return;
        }
        self.with_cluster(cluster_id, |m| {
            m.invalid_initial_connections.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn register_topology_cache_hit(&self, cluster_id: &str) {
        self.with_cluster(cluster_id, |m| {
            m.topology_cache_hits.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn register_topology_cache_miss(&self, cluster_id: &str) {
        self.with_cluster(cluster_id, |m| {
            m.topology_cache_misses.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Snapshot one cluster's counters, if any were recorded
    pub fn snapshot(&self, cluster_id: &str) -> Option<ClusterMetricsSnapshot> {
        self.clusters.get(cluster_id).map(|m| ClusterMetricsSnapshot {
            cluster_id: cluster_id.to_string(),
            failure_detection: m.failure_detection.snapshot(),
            reader_failover_procedure: m.reader_failover_procedure.snapshot(),
            writer_failover_procedure: m.writer_failover_procedure.snapshot(),
            successful_failover_connects: m.successful_failover_connects.load(Ordering::Relaxed),
            failed_failover_connects: m.failed_failover_connects.load(Ordering::Relaxed),
            invalid_initial_connections: m.invalid_initial_connections.load(Ordering::Relaxed),
            topology_cache_hits: m.topology_cache_hits.load(Ordering::Relaxed),
            topology_cache_misses: m.topology_cache_misses.load(Ordering::Relaxed),
        })
    }

    /// Snapshot every cluster seen so far
    pub fn snapshot_all(&self) -> Vec<ClusterMetricsSnapshot> {
        self.clusters
            .iter()
            .filter_map(|entry| self.snapshot(entry.key()))
            .collect()
    }
}
