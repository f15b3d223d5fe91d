//! Connection seam between the failover core and the native client library
//!
//! The core never talks to a socket itself. It drives an abstract
//! [`ConnectionAdapter`] provided by the embedding driver, builds fresh
//! adapters through a [`ConnectionFactory`], and hands live connections
//! around through the [`ConnectionManager`].

use crate::auth::TokenAuthenticator;
use crate::error::{FailoverError, FailoverResult};
use crate::host::HostInfo;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// One result row from the native client, column values in probe order
pub type Row = Vec<String>;

/// Abstract handle over the native database client
pub trait ConnectionAdapter: Send {
    /// Open the connection; returns false on failure (details via [`error_code`])
    ///
    /// [`error_code`]: ConnectionAdapter::error_code
    #[allow(clippy::too_many_arguments)]
    fn connect(
        &mut self,
        host: &str,
        user: &str,
        password: &str,
        database: &str,
        port: u16,
        socket: Option<&str>,
        flags: u64,
    ) -> bool;

    fn is_connected(&self) -> bool;

    fn close(&mut self);

    /// Execute a statement and collect its rows
    fn query(&mut self, sql: &str) -> FailoverResult<Vec<Row>>;

    /// SQLSTATE of the most recent failure
    fn error_code(&self) -> String;
}

/// Boxed adapter moved between worker tasks and the dispatcher
pub type Conn = Box<dyn ConnectionAdapter>;

/// Produces unconnected adapters; implemented by the embedding driver
pub trait ConnectionFactory: Send + Sync {
    fn new_connection(&self) -> Conn;
}

/// Connection parameters applied to every host the core dials
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub user: String,
    pub password: String,
    pub database: String,
    pub socket: Option<String>,
    pub client_flags: u64,
    /// Region handed to the auth provider when token auth is configured
    pub auth_region: String,
}

/// Owns the dispatcher's current connection and opens new ones for the
/// failover engines.
///
/// The original connection settings are preserved across failovers; only the
/// target host changes per attempt.
pub struct ConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    opts: ConnectOptions,
    authenticator: Option<Arc<TokenAuthenticator>>,
    current: Mutex<Option<Conn>>,
}

impl ConnectionManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>, opts: ConnectOptions) -> Self {
        Self {
            factory,
            opts,
            authenticator: None,
            current: Mutex::new(None),
        }
    }

    /// Route connection attempts through a token authenticator
    pub fn with_authenticator(mut self, authenticator: Arc<TokenAuthenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Open a fresh connection to the given host
    pub fn connect(&self, host: &HostInfo) -> FailoverResult<Conn> {
        let mut conn = self.factory.new_connection();
        let connected = match &self.authenticator {
            Some(auth) => auth.connect(conn.as_mut(), host, &self.opts),
            None => conn.connect(
                host.host(),
                &self.opts.user,
                &self.opts.password,
                &self.opts.database,
                host.port(),
                self.opts.socket.as_deref(),
                self.opts.client_flags,
            ),
        };

        if connected {
            debug!(host = %host.host_port_pair(), "connected");
            Ok(conn)
        } else {
            warn!(
                host = %host.host_port_pair(),
                sqlstate = %conn.error_code(),
                "connection attempt failed"
            );
            Err(FailoverError::ConnectionFailed(host.host_port_pair()))
        }
    }

    /// Install a new live connection as current, closing the old one
    pub fn update_connection(&self, new_connection: Conn) {
        let mut current = self.current.lock();
        if let Some(mut old) = current.take() {
            old.close();
        }
        *current = Some(new_connection);
    }

    /// Close and drop a connection a worker no longer needs
    pub fn release_connection(&self, mut connection: Conn) {
        connection.close();
    }

    /// Run a closure against the current connection, if any
    pub fn with_current<R>(&self, f: impl FnOnce(&mut dyn ConnectionAdapter) -> R) -> Option<R> {
        let mut current = self.current.lock();
        current.as_mut().map(|conn| f(conn.as_mut()))
    }

    pub fn has_current(&self) -> bool {
        self.current.lock().is_some()
    }

    /// Close the current connection, if any
    pub fn close_current(&self) {
        if let Some(mut conn) = self.current.lock().take() {
            conn.close();
        }
    }
}
