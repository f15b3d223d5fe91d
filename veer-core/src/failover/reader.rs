//! Reader failover
//!
//! Produces a live connection to some reader (or, for dispatcher-driven
//! failover, any host) within a global deadline by racing connection
//! attempts two hosts at a time.

use crate::failover::{CompletionGuard, FailoverTask, ReaderResult};
use crate::host::HostInfo;
use crate::adapter::ConnectionManager;
use crate::sync::FailoverSync;
use crate::topology::{ClusterTopology, TopologyService};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

/// Pause between host pairs and between sweeps of the candidate list
pub const READER_CONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Races parallel connection attempts across candidate readers
pub struct ReaderFailoverHandler {
    topology_service: Arc<TopologyService>,
    conn_mgr: Arc<ConnectionManager>,
    max_failover_timeout: Duration,
    reader_connect_timeout: Duration,
}

impl ReaderFailoverHandler {
    pub fn new(
        topology_service: Arc<TopologyService>,
        conn_mgr: Arc<ConnectionManager>,
        max_failover_timeout: Duration,
        reader_connect_timeout: Duration,
    ) -> Self {
        Self {
            topology_service,
            conn_mgr,
            max_failover_timeout,
            reader_connect_timeout,
        }
    }

    fn task(&self) -> FailoverTask {
        FailoverTask {
            conn_mgr: self.conn_mgr.clone(),
            topology_service: self.topology_service.clone(),
        }
    }

    /// Dispatcher-driven reader failover.
    ///
    /// Sweeps readers that are up, then readers marked down, then writers as
    /// a last resort, racing two candidates at a time. The sweep repeats with
    /// a fresh shuffle until a connection lands or the global deadline fires.
    pub fn failover(&self, topology: Arc<ClusterTopology>) -> ReaderResult {
        if topology.total_hosts() == 0 {
            return ReaderResult::not_connected();
        }

        let global_sync = Arc::new(FailoverSync::new(1));
        let slot: Arc<Mutex<Option<ReaderResult>>> = Arc::new(Mutex::new(None));

        let task = self.task();
        let sync = global_sync.clone();
        let result_slot = slot.clone();
        let pair_timeout = self.reader_connect_timeout;
        thread::spawn(move || {
            while !sync.is_completed() {
                let hosts = build_hosts_list(&topology, true);
                let result = get_connection_from_hosts(&task, &hosts, &sync, pair_timeout);
                if result.connected {
                    if sync.is_completed() {
                        // The invocation timed out while this sweep was
                        // landing; the connection is surplus.
                        if let Some(conn) = result.new_connection {
                            task.release(conn);
                        }
                        break;
                    }
                    *result_slot.lock() = Some(result);
                    sync.mark_as_complete(true);
                    return;
                }
                sync.interruptible_sleep(READER_CONNECT_INTERVAL);
            }
            sync.mark_as_complete(true);
        });

        global_sync.wait_and_complete(self.max_failover_timeout);

        let taken = slot.lock().take();
        match taken {
            Some(result) => {
                let target = result
                    .new_host
                    .as_ref()
                    .map(|h| h.host_port_pair())
                    .unwrap_or_default();
                info!(host = %target, "reader failover connected");
                result
            }
            None => ReaderResult::not_connected(),
        }
    }

    /// Obtain a connection to a reader only, honouring the caller's sync.
    /// Used by the writer engine for topology discovery; writers are never
    /// candidates here.
    pub fn get_reader_connection(
        &self,
        topology: &Arc<ClusterTopology>,
        sync: &Arc<FailoverSync>,
    ) -> ReaderResult {
        let hosts = build_hosts_list(topology, false);
        let task = self.task();

        while !sync.is_completed() {
            let result = get_connection_from_hosts(&task, &hosts, sync, self.reader_connect_timeout);
            if result.connected {
                return result;
            }
        }
        ReaderResult::not_connected()
    }
}

/// Candidate list: shuffled up readers, then shuffled down readers, then
/// (for dispatcher-driven failover) shuffled writers
fn build_hosts_list(topology: &ClusterTopology, include_writers: bool) -> Vec<HostInfo> {
    let mut rng = rand::thread_rng();

    let (mut up, mut down): (Vec<HostInfo>, Vec<HostInfo>) = topology
        .readers()
        .iter()
        .cloned()
        .partition(|reader| !reader.is_down());
    up.shuffle(&mut rng);
    down.shuffle(&mut rng);

    let mut hosts = up;
    hosts.append(&mut down);

    if include_writers {
        let mut writers = topology.writers().to_vec();
        writers.shuffle(&mut rng);
        hosts.append(&mut writers);
    }
    hosts
}

/// One pass over the candidate list, two hosts at a time. Returns the first
/// connected result, or not-connected once the list is exhausted or the
/// caller's sync completes.
fn get_connection_from_hosts(
    task: &FailoverTask,
    hosts: &[HostInfo],
    global_sync: &Arc<FailoverSync>,
    pair_timeout: Duration,
) -> ReaderResult {
    let total = hosts.len();
    let mut i = 0;

    while !global_sync.is_completed() && i < total {
        // The last candidate of an odd-length list races alone.
        let odd_hosts_number = i + 1 == total;
        let local_sync = Arc::new(FailoverSync::new(if odd_hosts_number { 1 } else { 2 }));

        let first_slot = spawn_connect_task(task, hosts[i].clone(), &local_sync);
        let second_slot = if odd_hosts_number {
            None
        } else {
            Some(spawn_connect_task(task, hosts[i + 1].clone(), &local_sync))
        };

        local_sync.wait_and_complete(pair_timeout);

        if let Some(result) = first_slot.lock().take() {
            return result;
        }
        if let Some(slot) = second_slot {
            if let Some(result) = slot.lock().take() {
                return result;
            }
        }

        i += 2;
        global_sync.interruptible_sleep(READER_CONNECT_INTERVAL);
    }

    ReaderResult::not_connected()
}

type ResultSlot = Arc<Mutex<Option<ReaderResult>>>;

fn spawn_connect_task(
    task: &FailoverTask,
    host: HostInfo,
    sync: &Arc<FailoverSync>,
) -> ResultSlot {
    let slot: ResultSlot = Arc::new(Mutex::new(None));
    let task = task.clone();
    let sync = sync.clone();
    let result_slot = slot.clone();
    thread::spawn(move || connect_to_reader(task, host, sync, result_slot));
    slot
}

/// Single connection attempt. The winner commits with
/// `mark_as_complete(true)`; a task that connected after its peer won closes
/// the surplus connection and reads as not-connected.
fn connect_to_reader(
    task: FailoverTask,
    host: HostInfo,
    sync: Arc<FailoverSync>,
    slot: ResultSlot,
) {
    let mut guard = CompletionGuard::new(sync.clone());
    if sync.is_completed() {
        return;
    }

    match task.connect(&host) {
        Some(conn) => {
            task.topology_service.mark_host_up(&host);
            if sync.is_completed() {
                debug!(host = %host.host_port_pair(), "peer won; closing surplus connection");
                task.release(conn);
                return;
            }
            if !host.is_writer() {
                task.topology_service.set_last_used_reader(&host);
            }
            *slot.lock() = Some(ReaderResult::success(host, conn));
            guard.disarm();
            sync.mark_as_complete(true);
        }
        None => {
            task.topology_service.mark_host_down(&host);
        }
    }
}
