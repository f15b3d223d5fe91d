//! Token-based authentication support
//!
//! This module implements:
//! - The abstract [`AuthProvider`] contract (IAM/federated token generation)
//! - A process-wide token cache keyed by host, region, port and user
//! - The retry rule: a connect that fails on a cached token forces one
//!   regeneration before the failure is reported

use crate::adapter::{ConnectOptions, ConnectionAdapter};
use crate::error::FailoverResult;
use crate::host::HostInfo;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Default lifetime of a generated token in seconds
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 900;

/// External collaborator that produces short-lived auth tokens.
/// Implementations perform a network call and may fail.
pub trait AuthProvider: Send + Sync {
    fn generate_auth_token(
        &self,
        host: &str,
        region: &str,
        port: u16,
        user: &str,
    ) -> FailoverResult<String>;
}

/// A cached token and its expiry
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl TokenInfo {
    pub fn new(token: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            token: token.into(),
            expires_at: Utc::now() + ChronoDuration::seconds(ttl_secs as i64),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Cache key for one (host, region, port, user) identity
pub fn build_cache_key(host: &str, region: &str, port: u16, user: &str) -> String {
    format!("{}:{}:{}:{}", host, region, port, user)
}

/// Generates tokens through an [`AuthProvider`] and caches them.
///
/// Owned by the embedding driver and created at library init; there is no
/// static cache.
pub struct TokenAuthenticator {
    provider: Arc<dyn AuthProvider>,
    cache: DashMap<String, TokenInfo>,
    token_ttl_secs: u64,
}

impl TokenAuthenticator {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self::with_ttl(provider, DEFAULT_TOKEN_TTL_SECS)
    }

    pub fn with_ttl(provider: Arc<dyn AuthProvider>, token_ttl_secs: u64) -> Self {
        Self {
            provider,
            cache: DashMap::new(),
            token_ttl_secs,
        }
    }

    /// Fetch a token for the identity, reusing an unexpired cached one unless
    /// `force` is set. Returns the token and whether it came from the cache.
    pub fn get_auth_token(
        &self,
        host: &str,
        region: &str,
        port: u16,
        user: &str,
        force: bool,
    ) -> FailoverResult<(String, bool)> {
        let key = build_cache_key(host, region, port, user);

        if !force {
            if let Some(info) = self.cache.get(&key) {
                if !info.is_expired() {
                    debug!(%key, "using cached auth token");
                    return Ok((info.token.clone(), true));
                }
            }
        }

        let token = self.provider.generate_auth_token(host, region, port, user)?;
        self.cache
            .insert(key, TokenInfo::new(token.clone(), self.token_ttl_secs));
        Ok((token, false))
    }

    /// Connect using a token as the password. A failure on a cached token
    /// forces exactly one regeneration before reporting failure.
    pub fn connect(
        &self,
        conn: &mut dyn ConnectionAdapter,
        host: &HostInfo,
        opts: &ConnectOptions,
    ) -> bool {
        let (token, from_cache) = match self.get_auth_token(
            host.host(),
            &opts.auth_region,
            host.port(),
            &opts.user,
            false,
        ) {
            Ok(t) => t,
            Err(err) => {
                warn!(host = %host.host_port_pair(), %err, "token generation failed");
                return false;
            }
        };

        if self.connect_with_token(conn, host, opts, &token) {
            return true;
        }

        if !from_cache {
            return false;
        }

        debug!(
            host = %host.host_port_pair(),
            "cached token rejected; retrying with a fresh token"
        );
        let (token, _) = match self.get_auth_token(
            host.host(),
            &opts.auth_region,
            host.port(),
            &opts.user,
            true,
        ) {
            Ok(t) => t,
            Err(err) => {
                warn!(host = %host.host_port_pair(), %err, "token regeneration failed");
                return false;
            }
        };
        self.connect_with_token(conn, host, opts, &token)
    }

    fn connect_with_token(
        &self,
        conn: &mut dyn ConnectionAdapter,
        host: &HostInfo,
        opts: &ConnectOptions,
        token: &str,
    ) -> bool {
        conn.connect(
            host.host(),
            &opts.user,
            token,
            &opts.database,
            host.port(),
            opts.socket.as_deref(),
            opts.client_flags,
        )
    }

    /// Whether an identity currently has a cached token
    pub fn contains_key(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    /// Drop every cached token
    pub fn clear(&self) {
        self.cache.clear();
    }
}
