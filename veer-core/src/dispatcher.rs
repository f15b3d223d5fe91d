//! Failover dispatcher
//!
//! Owns the cluster classification performed at connect time and the
//! runtime entry point that turns a raw SQLSTATE into a failover decision:
//! reader path or writer path, and the rewritten error code surfaced to the
//! caller.

use crate::adapter::{ConnectOptions, ConnectionFactory, ConnectionManager};
use crate::auth::TokenAuthenticator;
use crate::classify;
use crate::config::FailoverConfig;
use crate::error::{
    is_connection_error, FailoverError, FailoverResult, SQLSTATE_CONNECTION_FAILURE_DURING_TRANSACTION,
    SQLSTATE_LINK_CHANGED, SQLSTATE_LINK_FAILURE,
};
use crate::failover::{ReaderFailoverHandler, WriterFailoverHandler};
use crate::host::{HostInfo, HostPattern};
use crate::metrics::FailoverMetrics;
use crate::topology::{ClusterTopology, TopologyService, GET_INSTANCE_NAME_SQL};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Classifies connection errors and re-points the session at a healthy
/// cluster member.
///
/// Created once per connection at connect time; classification of the
/// endpoint happens in the constructor and configuration errors surface
/// there synchronously.
pub struct FailoverDispatcher {
    config: FailoverConfig,
    topology_service: Arc<TopologyService>,
    conn_mgr: Arc<ConnectionManager>,
    reader_handler: Arc<ReaderFailoverHandler>,
    writer_handler: WriterFailoverHandler,
    metrics: Arc<FailoverMetrics>,

    current_host: Mutex<Option<HostInfo>>,
    current_topology: Mutex<Option<Arc<ClusterTopology>>>,

    is_rds: bool,
    is_rds_proxy: bool,
    is_rds_custom_cluster: bool,
    is_cluster_topology_available: bool,
    is_multi_writer_cluster: bool,

    // Session flags maintained by the embedding driver layer.
    autocommit: AtomicBool,
    transaction_open: AtomicBool,
    invoke_start: Mutex<Instant>,
}

impl FailoverDispatcher {
    /// Classify the endpoint, connect, and discover the initial topology
    pub fn new(
        config: FailoverConfig,
        factory: Arc<dyn ConnectionFactory>,
        opts: ConnectOptions,
    ) -> FailoverResult<Self> {
        Self::build(config, factory, opts, None)
    }

    /// Same as [`new`], routing connection attempts through a token
    /// authenticator
    ///
    /// [`new`]: FailoverDispatcher::new
    pub fn with_authenticator(
        config: FailoverConfig,
        factory: Arc<dyn ConnectionFactory>,
        opts: ConnectOptions,
        authenticator: Arc<TokenAuthenticator>,
    ) -> FailoverResult<Self> {
        Self::build(config, factory, opts, Some(authenticator))
    }

    fn build(
        config: FailoverConfig,
        factory: Arc<dyn ConnectionFactory>,
        opts: ConnectOptions,
        authenticator: Option<Arc<TokenAuthenticator>>,
    ) -> FailoverResult<Self> {
        config.validate()?;

        let metrics = Arc::new(FailoverMetrics::new(config.gather_perf_metrics));
        let topology_service = Arc::new(TopologyService::new().with_metrics(metrics.clone()));
        topology_service.set_refresh_rate(config.topology_refresh_rate_ms);

        let mut conn_mgr = ConnectionManager::new(factory, opts);
        if let Some(authenticator) = authenticator {
            conn_mgr = conn_mgr.with_authenticator(authenticator);
        }
        let conn_mgr = Arc::new(conn_mgr);

        let reader_handler = Arc::new(ReaderFailoverHandler::new(
            topology_service.clone(),
            conn_mgr.clone(),
            config.failover_timeout(),
            config.reader_connect_timeout(),
        ));
        let writer_handler = WriterFailoverHandler::new(
            topology_service.clone(),
            reader_handler.clone(),
            conn_mgr.clone(),
            config.failover_timeout(),
            config.read_topology_interval(),
            config.reconnect_writer_interval(),
        );

        let mut dispatcher = Self {
            config,
            topology_service,
            conn_mgr,
            reader_handler,
            writer_handler,
            metrics,
            current_host: Mutex::new(None),
            current_topology: Mutex::new(None),
            is_rds: false,
            is_rds_proxy: false,
            is_rds_custom_cluster: false,
            is_cluster_topology_available: false,
            is_multi_writer_cluster: false,
            autocommit: AtomicBool::new(true),
            transaction_open: AtomicBool::new(false),
            invoke_start: Mutex::new(Instant::now()),
        };
        dispatcher.init_cluster_info()?;
        Ok(dispatcher)
    }

    /// Decide whether the configured server can be failed over, derive the
    /// cluster identity and instance template, and open the initial
    /// connection
    fn init_cluster_info(&mut self) -> FailoverResult<()> {
        let hosts = classify::parse_server_list(&self.config.server, self.config.port)?;
        let (main_host, main_port) = hosts[0].clone();
        *self.current_host.lock() = Some(HostInfo::new(main_host.clone(), main_port));

        if self.config.disable_cluster_failover {
            // A standard default connection; no cluster detection.
            return self.connect_current();
        }

        if !self.config.host_pattern.is_empty() {
            self.init_with_host_pattern(main_port)
        } else if classify::is_ipv4(&main_host) || classify::is_ipv6(&main_host) {
            self.init_with_ip_address()
        } else {
            self.init_with_dns_name(&main_host, main_port)
        }
    }

    fn init_with_host_pattern(&mut self, default_port: u16) -> FailoverResult<()> {
        let patterns = classify::parse_server_list(&self.config.host_pattern, default_port)?;
        let (pattern, pattern_port) = patterns[0].clone();

        self.is_rds = classify::is_rds_dns(&pattern);
        self.is_rds_proxy = classify::is_rds_proxy_dns(&pattern);
        self.is_rds_custom_cluster = classify::is_rds_custom_cluster_dns(&pattern);

        if self.is_rds_proxy {
            return Err(FailoverError::Configuration(
                "a proxy url can't be used as an instance pattern".to_string(),
            ));
        }
        if self.is_rds_custom_cluster {
            return Err(FailoverError::Configuration(
                "a custom cluster endpoint can't be used as an instance pattern".to_string(),
            ));
        }

        let template = HostPattern::new(pattern.clone(), pattern_port)?;
        self.topology_service.set_cluster_instance_template(template);

        if !self.config.cluster_id.is_empty() {
            self.topology_service.set_cluster_id(self.config.cluster_id.clone());
        } else if self.is_rds {
            if let Some(cluster_host) = classify::rds_cluster_host_url(&pattern) {
                self.set_derived_cluster_id(&cluster_host, pattern_port);
            }
        }

        self.create_connection_and_initialize_topology()
    }

    fn init_with_ip_address(&mut self) -> FailoverResult<()> {
        if !self.config.cluster_id.is_empty() {
            self.topology_service.set_cluster_id(self.config.cluster_id.clone());
        }

        self.create_connection_and_initialize_topology()?;

        if self.is_cluster_topology_available {
            return Err(FailoverError::Configuration(
                "the host_pattern configuration setting is required when an IP address is \
                 used to connect to a cluster that provides topology information"
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn init_with_dns_name(&mut self, main_host: &str, main_port: u16) -> FailoverResult<()> {
        self.is_rds = classify::is_rds_dns(main_host);
        self.is_rds_proxy = classify::is_rds_proxy_dns(main_host);
        self.is_rds_custom_cluster = classify::is_rds_custom_cluster_dns(main_host);

        if self.is_rds_proxy || self.is_rds_custom_cluster {
            // Proxies and custom cluster endpoints manage their own routing;
            // connect plainly and never probe.
            info!(host = %main_host, "proxy or custom cluster endpoint; failover disabled");
            return self.connect_current();
        }

        if !self.is_rds {
            // Possibly a custom domain (CNAME) fronting a cluster.
            self.topology_service
                .set_cluster_instance_template(HostPattern::literal(main_host, main_port));

            if !self.config.cluster_id.is_empty() {
                self.topology_service.set_cluster_id(self.config.cluster_id.clone());
            }

            self.create_connection_and_initialize_topology()?;

            if self.is_cluster_topology_available {
                return Err(FailoverError::Configuration(
                    "the provided host appears to be a custom domain; the host_pattern \
                     configuration setting is required for custom domains"
                        .to_string(),
                ));
            }
            return Ok(());
        }

        let instance_pattern = classify::rds_instance_host_pattern(main_host).ok_or_else(|| {
            FailoverError::Configuration(
                "the provided host does not match an expected Aurora DNS pattern; set the \
                 host_pattern configuration for the cluster you are connecting to"
                    .to_string(),
            )
        })?;
        self.topology_service
            .set_cluster_instance_template(HostPattern::new(instance_pattern, main_port)?);

        if !self.config.cluster_id.is_empty() {
            self.topology_service.set_cluster_id(self.config.cluster_id.clone());
        } else if let Some(cluster_host) = classify::rds_cluster_host_url(main_host) {
            // Cluster and reader-cluster endpoints are a stable identity.
            self.set_derived_cluster_id(&cluster_host, main_port);
        } else {
            // An instance endpoint; the best identity available.
            self.set_derived_cluster_id(main_host, main_port);
        }

        self.create_connection_and_initialize_topology()
    }

    fn set_derived_cluster_id(&self, host: &str, port: u16) {
        self.topology_service.set_cluster_id(format!("{}:{}", host, port));
    }

    fn connect_current(&self) -> FailoverResult<()> {
        let Some(host) = self.current_host.lock().clone() else {
            return Err(FailoverError::Configuration(
                "empty server host".to_string(),
            ));
        };
        let conn = self.conn_mgr.connect(&host)?;
        self.conn_mgr.update_connection(conn);
        Ok(())
    }

    fn create_connection_and_initialize_topology(&mut self) -> FailoverResult<()> {
        let cluster_id = self.topology_service.cluster_id();
        if let Err(err) = self.connect_current() {
            self.metrics.register_invalid_initial_connection(&cluster_id, true);
            return Err(err);
        }
        self.metrics.register_invalid_initial_connection(&cluster_id, false);

        let probe = self
            .conn_mgr
            .with_current(|conn| self.topology_service.get_topology(conn, false));
        match probe {
            Some(Ok(topology)) => {
                self.is_multi_writer_cluster = topology.is_multi_writer();
                self.is_cluster_topology_available = topology.total_hosts() > 0;
                *self.current_topology.lock() = Some(topology);
            }
            _ => {
                // Not a cluster (or the probe failed): continue as a plain
                // connection with failover off.
                self.is_cluster_topology_available = false;
            }
        }
        info!(
            topology_available = self.is_cluster_topology_available,
            multi_writer = self.is_multi_writer_cluster,
            "cluster detection finished"
        );
        Ok(())
    }

    /// Whether runtime failover is active for this connection
    pub fn is_failover_enabled(&self) -> bool {
        !self.config.disable_cluster_failover
            && self.is_cluster_topology_available
            && !self.is_rds_proxy
            && !self.is_multi_writer_cluster
    }

    pub fn is_rds(&self) -> bool {
        self.is_rds
    }

    pub fn is_rds_proxy(&self) -> bool {
        self.is_rds_proxy
    }

    pub fn is_cluster_topology_available(&self) -> bool {
        self.is_cluster_topology_available
    }

    pub fn current_host(&self) -> Option<HostInfo> {
        self.current_host.lock().clone()
    }

    pub fn topology_service(&self) -> &Arc<TopologyService> {
        &self.topology_service
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.conn_mgr
    }

    pub fn metrics(&self) -> &Arc<FailoverMetrics> {
        &self.metrics
    }

    /// Driver layer: autocommit flag of the session
    pub fn set_autocommit(&self, autocommit: bool) {
        self.autocommit.store(autocommit, Ordering::SeqCst);
    }

    /// Driver layer: a transaction statement opened/closed a transaction
    pub fn set_transaction_open(&self, open: bool) {
        self.transaction_open.store(open, Ordering::SeqCst);
    }

    /// Driver layer: a statement is about to be dispatched; anchors the
    /// failure-detection timer
    pub fn note_statement_start(&self) {
        *self.invoke_start.lock() = Instant::now();
    }

    /// Instance id of the node the session is currently attached to
    pub fn query_instance_id(&self) -> Option<String> {
        self.conn_mgr.with_current(|conn| {
            conn.query(GET_INSTANCE_NAME_SQL)
                .ok()
                .and_then(|rows| rows.first().and_then(|row| row.first().cloned()))
        })?
    }

    /// Soft-refresh the topology through the current connection
    pub fn refresh_topology(&self) {
        let refreshed = self
            .conn_mgr
            .with_current(|conn| self.topology_service.get_topology(conn, false));
        if let Some(Ok(topology)) = refreshed {
            *self.current_topology.lock() = Some(topology);
        }
    }

    /// Entry point: decide whether the given SQLSTATE warrants failover,
    /// run it, and return `(did_failover, surfaced_error_code)`.
    pub fn trigger_failover_if_needed(&self, error_code: &str) -> (bool, String) {
        let original = error_code.to_string();

        if !self.is_failover_enabled() || error_code.is_empty() {
            return (false, original);
        }
        if !is_connection_error(error_code) {
            return (false, original);
        }

        let in_transaction =
            !self.autocommit.load(Ordering::SeqCst) || self.transaction_open.load(Ordering::SeqCst);

        let cluster_id = self.topology_service.cluster_id();
        let detection_ms = self.invoke_start.lock().elapsed().as_millis() as u64;
        self.metrics
            .register_failure_detection_time(&cluster_id, detection_ms);

        // The failed connection is no longer anybody's current host.
        *self.current_host.lock() = None;

        let Some(topology) = self
            .topology_service
            .get_cached_topology()
            .or_else(|| self.current_topology.lock().clone())
        else {
            warn!("no topology view available; surfacing connection failure");
            return (false, SQLSTATE_LINK_FAILURE.to_string());
        };

        let failover_start = Instant::now();
        let success = if topology.total_hosts() > 1 && self.config.allow_reader_connections {
            let success = self.failover_to_reader(topology);
            self.metrics.register_reader_failover_procedure_time(
                &cluster_id,
                failover_start.elapsed().as_millis() as u64,
            );
            success
        } else {
            let success = self.failover_to_writer(topology);
            self.metrics.register_writer_failover_procedure_time(
                &cluster_id,
                failover_start.elapsed().as_millis() as u64,
            );
            success
        };
        self.metrics.register_failover_connects(&cluster_id, success);

        let code = if in_transaction {
            SQLSTATE_CONNECTION_FAILURE_DURING_TRANSACTION
        } else if success {
            SQLSTATE_LINK_CHANGED
        } else {
            SQLSTATE_LINK_FAILURE
        };
        (success, code.to_string())
    }

    fn failover_to_reader(&self, topology: Arc<ClusterTopology>) -> bool {
        info!("starting reader failover procedure");
        let result = self.reader_handler.failover(topology);

        match (result.connected, result.new_connection) {
            (true, Some(conn)) => {
                *self.current_host.lock() = result.new_host;
                self.conn_mgr.update_connection(conn);
                info!(
                    "the active SQL connection has changed due to a connection failure; \
                     re-configure session state if required"
                );
                true
            }
            _ => {
                warn!("unable to establish a SQL connection to a reader node");
                false
            }
        }
    }

    fn failover_to_writer(&self, topology: Arc<ClusterTopology>) -> bool {
        info!("starting writer failover procedure");
        let result = self.writer_handler.failover(topology);

        match (result.connected, result.new_connection) {
            (true, Some(conn)) => {
                if result.is_new_host {
                    // A different instance was promoted; adopt its view.
                    if let Some(new_topology) = result.new_topology {
                        *self.current_host.lock() = new_topology.writer().cloned();
                        *self.current_topology.lock() = Some(new_topology);
                    }
                }
                self.conn_mgr.update_connection(conn);
                info!(
                    "the active SQL connection has changed due to a connection failure; \
                     re-configure session state if required"
                );
                true
            }
            _ => {
                warn!("unable to establish a SQL connection to a writer node");
                false
            }
        }
    }
}
