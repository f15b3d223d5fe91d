//! Writer failover
//!
//! Produces a live writer connection plus a refreshed topology by racing two
//! strategies: reconnecting to the original writer, and waiting for a newly
//! promoted writer discovered through a reader probe. Whichever strategy
//! completes first wins; the peer observes completion at its next checkpoint
//! and backs out.

use crate::adapter::{Conn, ConnectionManager};
use crate::failover::reader::ReaderFailoverHandler;
use crate::failover::{CompletionGuard, FailoverTask, WriterResult};
use crate::host::HostInfo;
use crate::sync::FailoverSync;
use crate::topology::{ClusterTopology, TopologyService};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

type ResultSlot = Arc<Mutex<Option<WriterResult>>>;

/// Races reconnect-to-original-writer against wait-for-new-writer
pub struct WriterFailoverHandler {
    topology_service: Arc<TopologyService>,
    reader_handler: Arc<ReaderFailoverHandler>,
    conn_mgr: Arc<ConnectionManager>,
    writer_failover_timeout: Duration,
    read_topology_interval: Duration,
    reconnect_writer_interval: Duration,
}

impl WriterFailoverHandler {
    pub fn new(
        topology_service: Arc<TopologyService>,
        reader_handler: Arc<ReaderFailoverHandler>,
        conn_mgr: Arc<ConnectionManager>,
        writer_failover_timeout: Duration,
        read_topology_interval: Duration,
        reconnect_writer_interval: Duration,
    ) -> Self {
        Self {
            topology_service,
            reader_handler,
            conn_mgr,
            writer_failover_timeout,
            read_topology_interval,
            reconnect_writer_interval,
        }
    }

    /// Run the two-strategy race. Returns not-connected when both strategies
    /// are still empty-handed at the deadline.
    pub fn failover(&self, current_topology: Arc<ClusterTopology>) -> WriterResult {
        let Some(original_writer) = current_topology.writer().cloned() else {
            return WriterResult::not_connected();
        };

        // Keep the failed writer out of preferred targets while the race runs.
        self.topology_service.mark_host_down(&original_writer);

        let sync = Arc::new(FailoverSync::new(2));
        let slot: ResultSlot = Arc::new(Mutex::new(None));

        let task = FailoverTask {
            conn_mgr: self.conn_mgr.clone(),
            topology_service: self.topology_service.clone(),
        };

        {
            let task = task.clone();
            let writer = original_writer.clone();
            let sync = sync.clone();
            let slot = slot.clone();
            let interval = self.reconnect_writer_interval;
            thread::spawn(move || reconnect_to_writer(task, writer, interval, sync, slot));
        }
        {
            let task = task.clone();
            let reader_handler = self.reader_handler.clone();
            let topology = current_topology.clone();
            let writer = original_writer.clone();
            let sync = sync.clone();
            let slot = slot.clone();
            let interval = self.read_topology_interval;
            thread::spawn(move || {
                wait_for_new_writer(task, reader_handler, topology, writer, interval, sync, slot)
            });
        }

        sync.wait_and_complete(self.writer_failover_timeout);

        let taken = slot.lock().take();
        match taken {
            Some(result) => {
                info!(
                    is_new_host = result.is_new_host,
                    "writer failover connected"
                );
                result
            }
            None => {
                info!("writer failover timed out on both strategies");
                WriterResult::not_connected()
            }
        }
    }
}

/// Strategy A: keep dialing the original writer. Succeeds only when a fresh
/// forced topology probe through the new connection still reports the
/// original instance as the writer.
fn reconnect_to_writer(
    task: FailoverTask,
    original_writer: HostInfo,
    interval: Duration,
    sync: Arc<FailoverSync>,
    slot: ResultSlot,
) {
    let mut guard = CompletionGuard::new(sync.clone());

    while !sync.is_completed() {
        if let Some(mut conn) = task.connect(&original_writer) {
            let probe = task.topology_service.get_topology(conn.as_mut(), true);
            match probe {
                Ok(latest)
                    if latest.total_hosts() > 0
                        && is_current_host_writer(&original_writer, &latest) =>
                {
                    task.topology_service.mark_host_up(&original_writer);
                    if sync.is_completed() {
                        task.release(conn);
                        break;
                    }
                    debug!(
                        writer = %original_writer.host_port_pair(),
                        "original writer is back"
                    );
                    *slot.lock() = Some(WriterResult::reconnected(latest, conn));
                    guard.disarm();
                    sync.mark_as_complete(true);
                    return;
                }
                // Either the probe failed or the cluster elected someone
                // else; this connection is useless here.
                _ => task.release(conn),
            }
        }
        sync.interruptible_sleep(interval);
    }
}

fn is_current_host_writer(original_writer: &HostInfo, latest: &ClusterTopology) -> bool {
    latest
        .writer()
        .map(|w| w.instance_id == original_writer.instance_id)
        .unwrap_or(false)
}

/// Strategy B: hold a reader connection, watch the topology through it, and
/// connect to the newly elected writer as soon as one appears.
///
/// When the elected writer turns out to be the reader currently held, that
/// connection is promoted in place rather than opening a second socket; no
/// re-authentication happens on promotion.
fn wait_for_new_writer(
    task: FailoverTask,
    reader_handler: Arc<ReaderFailoverHandler>,
    current_topology: Arc<ClusterTopology>,
    original_writer: HostInfo,
    interval: Duration,
    sync: Arc<FailoverSync>,
    slot: ResultSlot,
) {
    let mut guard = CompletionGuard::new(sync.clone());
    let mut reader_conn: Option<Conn> = None;
    let mut reader_host: Option<HostInfo> = None;

    while !sync.is_completed() {
        if reader_conn.is_none() {
            let result = reader_handler.get_reader_connection(&current_topology, &sync);
            if result.connected {
                reader_host = result.new_host;
                reader_conn = result.new_connection;
            } else {
                sync.interruptible_sleep(interval);
                continue;
            }
        }

        let probe = match reader_conn.as_mut() {
            Some(conn) => task.topology_service.get_topology(conn.as_mut(), true),
            None => {
                sync.interruptible_sleep(interval);
                continue;
            }
        };

        match probe {
            Ok(latest) => {
                if let Some(candidate) = latest.writer().cloned() {
                    if candidate.instance_id != original_writer.instance_id {
                        let promoted_in_place = reader_host
                            .as_ref()
                            .map(|h| h.is_same(&candidate))
                            .unwrap_or(false);

                        if promoted_in_place {
                            let Some(conn) = reader_conn.take() else {
                                continue;
                            };
                            task.topology_service.mark_host_up(&candidate);
                            if sync.is_completed() {
                                task.release(conn);
                                break;
                            }
                            debug!(
                                writer = %candidate.host_port_pair(),
                                "reader was promoted; reusing its connection"
                            );
                            *slot.lock() = Some(WriterResult::new_writer(latest, conn));
                            guard.disarm();
                            sync.mark_as_complete(true);
                            return;
                        }

                        match task.connect(&candidate) {
                            Some(writer_conn) => {
                                task.topology_service.mark_host_up(&candidate);
                                if sync.is_completed() {
                                    task.release(writer_conn);
                                    break;
                                }
                                debug!(
                                    writer = %candidate.host_port_pair(),
                                    "connected to newly promoted writer"
                                );
                                *slot.lock() = Some(WriterResult::new_writer(latest, writer_conn));
                                guard.disarm();
                                sync.mark_as_complete(true);
                                if let Some(conn) = reader_conn.take() {
                                    task.release(conn);
                                }
                                return;
                            }
                            None => task.topology_service.mark_host_down(&candidate),
                        }
                    }
                }
            }
            Err(_) => {
                // The reader died mid-probe; find another one.
                if let Some(conn) = reader_conn.take() {
                    task.release(conn);
                }
                reader_host = None;
            }
        }

        sync.interruptible_sleep(interval);
    }

    if let Some(conn) = reader_conn.take() {
        task.release(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{ConnectOptions, ConnectionAdapter, ConnectionFactory, Row};
    use crate::error::{FailoverError, FailoverResult};
    use crate::host::HostPattern;
    use crate::topology::{RETRIEVE_TOPOLOGY_SQL, WRITER_SESSION_ID};
    use std::collections::HashSet;
    use std::time::Instant;

    struct SimState {
        reachable: HashSet<String>,
        rows: Vec<Row>,
        opened: usize,
        closed: usize,
    }

    impl SimState {
        fn row(server_id: &str, session_id: &str) -> Row {
            vec![
                server_id.to_string(),
                session_id.to_string(),
                "2026-08-02 12:00:00".to_string(),
                "0".to_string(),
            ]
        }
    }

    #[derive(Clone)]
    struct SimFactory {
        state: Arc<Mutex<SimState>>,
    }

    impl SimFactory {
        fn new(reachable: &[&str], writer: &str, readers: &[&str]) -> Self {
            let mut rows = vec![SimState::row(writer, WRITER_SESSION_ID)];
            rows.extend(readers.iter().map(|r| SimState::row(r, "reader-session")));
            // "seed-host" stands in for the connection that existed before
            // the failure; fixtures probe the initial topology through it.
            let mut reachable: HashSet<String> =
                reachable.iter().map(|h| h.to_string()).collect();
            reachable.insert("seed-host".to_string());
            Self {
                state: Arc::new(Mutex::new(SimState {
                    reachable,
                    rows,
                    opened: 0,
                    closed: 0,
                })),
            }
        }

        /// Re-script the cluster: `new_writer` is elected, everyone else
        /// becomes a reader
        fn promote(&self, new_writer: &str, others: &[&str]) {
            let mut state = self.state.lock();
            let mut rows = vec![SimState::row(new_writer, WRITER_SESSION_ID)];
            rows.extend(others.iter().map(|r| SimState::row(r, "reader-session")));
            state.rows = rows;
        }
    }

    struct SimConn {
        state: Arc<Mutex<SimState>>,
        connected: bool,
    }

    impl ConnectionAdapter for SimConn {
        fn connect(
            &mut self,
            host: &str,
            _user: &str,
            _password: &str,
            _database: &str,
            _port: u16,
            _socket: Option<&str>,
            _flags: u64,
        ) -> bool {
            let mut state = self.state.lock();
            if state.reachable.contains(host) {
                state.opened += 1;
                self.connected = true;
                true
            } else {
                false
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn close(&mut self) {
            if self.connected {
                self.connected = false;
                self.state.lock().closed += 1;
            }
        }

        fn query(&mut self, sql: &str) -> FailoverResult<Vec<Row>> {
            if !self.connected {
                return Err(FailoverError::Query("08S01".to_string()));
            }
            if sql == RETRIEVE_TOPOLOGY_SQL {
                Ok(self.state.lock().rows.clone())
            } else {
                Ok(Vec::new())
            }
        }

        fn error_code(&self) -> String {
            "08001".to_string()
        }
    }

    impl ConnectionFactory for SimFactory {
        fn new_connection(&self) -> Conn {
            Box::new(SimConn {
                state: self.state.clone(),
                connected: false,
            })
        }
    }

    struct Fixture {
        handler: WriterFailoverHandler,
        service: Arc<TopologyService>,
        factory: SimFactory,
        topology: Arc<ClusterTopology>,
    }

    fn fixture(factory: SimFactory, timeout_ms: u64) -> Fixture {
        let service = Arc::new(TopologyService::new());
        service.set_cluster_id("test-cluster");
        service.set_cluster_instance_template(HostPattern::new("?", 3306).unwrap());

        // Seed the cache the way the dispatcher does at init.
        let mut seed_conn = factory.new_connection();
        assert!(seed_conn.connect("seed-host", "", "", "", 3306, None, 0));
        let topology = service.get_topology(seed_conn.as_mut(), true).unwrap();

        let conn_mgr = Arc::new(ConnectionManager::new(
            Arc::new(factory.clone()),
            ConnectOptions::default(),
        ));
        let reader_handler = Arc::new(ReaderFailoverHandler::new(
            service.clone(),
            conn_mgr.clone(),
            Duration::from_millis(timeout_ms),
            Duration::from_millis(200),
        ));
        let handler = WriterFailoverHandler::new(
            service.clone(),
            reader_handler,
            conn_mgr,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(50),
            Duration::from_millis(50),
        );
        Fixture {
            handler,
            service,
            factory,
            topology,
        }
    }

    #[test]
    fn test_reconnect_strategy_wins_when_writer_returns() {
        let factory = SimFactory::new(&["w0", "r1", "r2"], "w0", &["r1", "r2"]);
        let f = fixture(factory, 5_000);

        let result = f.handler.failover(f.topology.clone());
        assert!(result.connected);
        assert!(!result.is_new_host);
        assert!(result.new_connection.unwrap().is_connected());

        // Reconnecting cleared the down flag set at launch.
        assert!(!f.service.get_down_hosts().contains("w0:3306"));
    }

    #[test]
    fn test_new_writer_strategy_wins_after_election() {
        // The old writer never comes back; r1 is promoted.
        let factory = SimFactory::new(&["r1", "r2"], "w0", &["r1", "r2"]);
        let f = fixture(factory.clone(), 5_000);
        factory.promote("r1", &["w0", "r2"]);

        let result = f.handler.failover(f.topology.clone());
        assert!(result.connected);
        assert!(result.is_new_host);

        let topology = result.new_topology.unwrap();
        assert_eq!(topology.writer().unwrap().instance_id, "r1");
    }

    #[test]
    fn test_promoted_reader_connection_is_reused() {
        // Only r1 is reachable, and r1 is the newly elected writer: the
        // reader connection must be promoted without a second socket.
        let factory = SimFactory::new(&["r1"], "w0", &["r1"]);
        let f = fixture(factory.clone(), 5_000);
        factory.promote("r1", &["w0"]);

        let result = f.handler.failover(f.topology.clone());
        assert!(result.connected);
        assert!(result.is_new_host);

        thread::sleep(Duration::from_millis(300));
        let state = f.factory.state.lock();
        // Seed connection + the single promoted reader connection.
        assert_eq!(state.opened, 2);
        assert_eq!(state.opened - state.closed, 2);
    }

    #[test]
    fn test_original_writer_marked_down_at_launch() {
        let factory = SimFactory::new(&[], "w0", &["r1"]);
        let f = fixture(factory, 200);

        let result = f.handler.failover(f.topology.clone());
        assert!(!result.connected);
        assert!(f.service.get_down_hosts().contains("w0:3306"));
    }

    #[test]
    fn test_both_strategies_time_out() {
        let factory = SimFactory::new(&[], "w0", &["r1", "r2"]);
        let f = fixture(factory, 400);

        let start = Instant::now();
        let result = f.handler.failover(f.topology.clone());
        let elapsed = start.elapsed();

        assert!(!result.connected);
        assert!(result.new_connection.is_none());
        assert!(elapsed >= Duration::from_millis(400));
        assert!(elapsed < Duration::from_millis(1600));
    }

    #[test]
    fn test_topology_without_writer_is_not_connected() {
        let factory = SimFactory::new(&[], "w0", &[]);
        let f = fixture(factory, 400);
        let result = f.handler.failover(Arc::new(ClusterTopology::new()));
        assert!(!result.connected);
    }
}
