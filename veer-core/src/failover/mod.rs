//! Failover engines and their shared worker context
//!
//! Worker tasks spawned by the reader and writer engines share one
//! [`FailoverTask`] value: the connection manager to dial hosts through, the
//! topology service to record host health in, and the invocation's
//! [`FailoverSync`] checkpoints for cooperative cancellation.

pub mod reader;
pub mod writer;

pub use reader::ReaderFailoverHandler;
pub use writer::WriterFailoverHandler;

use crate::adapter::{Conn, ConnectionManager};
use crate::host::HostInfo;
use crate::sync::FailoverSync;
use crate::topology::{ClusterTopology, TopologyService};
use std::sync::Arc;
use tracing::debug;

/// Outcome of a reader failover attempt, moved from the winning worker to
/// the caller
pub struct ReaderResult {
    pub connected: bool,
    pub new_host: Option<HostInfo>,
    pub new_connection: Option<Conn>,
}

impl ReaderResult {
    pub fn not_connected() -> Self {
        Self {
            connected: false,
            new_host: None,
            new_connection: None,
        }
    }

    pub fn success(host: HostInfo, connection: Conn) -> Self {
        Self {
            connected: true,
            new_host: Some(host),
            new_connection: Some(connection),
        }
    }
}

/// Outcome of a writer failover attempt
pub struct WriterResult {
    pub connected: bool,
    /// True when a newly promoted writer was connected to, false when the
    /// original writer came back
    pub is_new_host: bool,
    pub new_topology: Option<Arc<ClusterTopology>>,
    pub new_connection: Option<Conn>,
}

impl WriterResult {
    pub fn not_connected() -> Self {
        Self {
            connected: false,
            is_new_host: false,
            new_topology: None,
            new_connection: None,
        }
    }

    pub fn reconnected(topology: Arc<ClusterTopology>, connection: Conn) -> Self {
        Self {
            connected: true,
            is_new_host: false,
            new_topology: Some(topology),
            new_connection: Some(connection),
        }
    }

    pub fn new_writer(topology: Arc<ClusterTopology>, connection: Conn) -> Self {
        Self {
            connected: true,
            is_new_host: true,
            new_topology: Some(topology),
            new_connection: Some(connection),
        }
    }
}

/// Context shared by the worker tasks of one failover invocation
#[derive(Clone)]
pub(crate) struct FailoverTask {
    pub conn_mgr: Arc<ConnectionManager>,
    pub topology_service: Arc<TopologyService>,
}

impl FailoverTask {
    /// Dial a host; a failure is reported as `None` and logged
    pub fn connect(&self, host: &HostInfo) -> Option<Conn> {
        match self.conn_mgr.connect(host) {
            Ok(conn) => Some(conn),
            Err(err) => {
                debug!(host = %host.host_port_pair(), %err, "worker connect failed");
                None
            }
        }
    }

    pub fn release(&self, conn: Conn) {
        self.conn_mgr.release_connection(conn);
    }
}

/// Decrements the invocation sync when a worker exits without claiming
/// victory, including on panic, so a crashed worker reads as a per-host
/// connect failure.
pub(crate) struct CompletionGuard {
    sync: Arc<FailoverSync>,
    armed: bool,
}

impl CompletionGuard {
    pub fn new(sync: Arc<FailoverSync>) -> Self {
        Self { sync, armed: true }
    }

    /// Call when the worker has already marked the sync itself
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.sync.mark_as_complete(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_guard_decrements_on_drop() {
        let sync = Arc::new(FailoverSync::new(1));
        {
            let _guard = CompletionGuard::new(sync.clone());
        }
        assert!(sync.is_completed());
    }

    #[test]
    fn test_disarmed_guard_leaves_sync_alone() {
        let sync = Arc::new(FailoverSync::new(1));
        {
            let mut guard = CompletionGuard::new(sync.clone());
            guard.disarm();
        }
        assert!(!sync.is_completed());
    }

    #[test]
    fn test_guard_fires_on_panic() {
        let sync = Arc::new(FailoverSync::new(1));
        let s = sync.clone();
        let handle = thread::spawn(move || {
            let _guard = CompletionGuard::new(s);
            panic!("worker crashed");
        });
        assert!(handle.join().is_err());
        assert!(sync.wait_and_complete(Duration::from_secs(1)));
    }
}
