//! Veer Core - Cluster-aware failover for MySQL-compatible clusters
//!
//! This crate provides the failover core of a cluster-aware database client:
//! - Topology discovery and caching against the cluster's replica-status view
//! - Reader failover racing parallel connection attempts under a deadline
//! - Writer failover racing reconnect-to-writer against new-writer discovery
//! - A dispatcher that classifies SQLSTATE `08*` errors and rewrites the
//!   surfaced code after a failover attempt
//!
//! The native client library stays abstract behind [`ConnectionAdapter`];
//! token-based credential acquisition stays abstract behind
//! [`AuthProvider`].

pub mod adapter;
pub mod auth;
pub mod classify;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod failover;
pub mod host;
pub mod metrics;
pub mod sync;
pub mod topology;

pub use adapter::{Conn, ConnectOptions, ConnectionAdapter, ConnectionFactory, ConnectionManager, Row};
pub use auth::{AuthProvider, TokenAuthenticator, TokenInfo};
pub use config::FailoverConfig;
pub use dispatcher::FailoverDispatcher;
pub use error::{FailoverError, FailoverResult};
pub use failover::{ReaderFailoverHandler, ReaderResult, WriterFailoverHandler, WriterResult};
pub use host::{HostInfo, HostPattern, HostRole, HostState};
pub use metrics::FailoverMetrics;
pub use sync::FailoverSync;
pub use topology::{ClusterTopology, TopologyService};
