//! Error types and SQLSTATE handling for the failover core

use thiserror::Error;

/// SQLSTATE class prefix for connection exceptions
pub const SQLSTATE_CONNECTION_CLASS: &str = "08";

/// Surfaced after a successful failover: the link changed, session state is gone
pub const SQLSTATE_LINK_CHANGED: &str = "08S02";

/// Surfaced after a failed failover: the link is gone for good
pub const SQLSTATE_LINK_FAILURE: &str = "08S01";

/// Surfaced when the connection failed while a transaction was open
pub const SQLSTATE_CONNECTION_FAILURE_DURING_TRANSACTION: &str = "08007";

/// Check whether a SQLSTATE belongs to the connection-exception class
pub fn is_connection_error(sqlstate: &str) -> bool {
    sqlstate.starts_with(SQLSTATE_CONNECTION_CLASS)
}

/// Errors raised by the failover core
#[derive(Debug, Error)]
pub enum FailoverError {
    /// Invalid configuration detected at initialization
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The metadata probe failed and no cached topology exists
    #[error("cluster topology is not available")]
    TopologyUnavailable,

    /// A connection attempt to a specific host failed
    #[error("failed to connect to host {0}")]
    ConnectionFailed(String),

    /// A query against a live connection failed with the given SQLSTATE
    #[error("query failed with SQLSTATE {0}")]
    Query(String),

    /// The auth provider could not produce a token
    #[error("auth token generation failed: {0}")]
    TokenGeneration(String),
}

/// Result type for failover operations
pub type FailoverResult<T> = Result<T, FailoverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_class() {
        assert!(is_connection_error("08S01"));
        assert!(is_connection_error("08007"));
        assert!(is_connection_error("08001"));
        assert!(!is_connection_error("42000"));
        assert!(!is_connection_error(""));
        assert!(!is_connection_error("HY000"));
    }

    #[test]
    fn test_error_display() {
        let err = FailoverError::Configuration("bad host pattern".to_string());
        assert!(err.to_string().contains("bad host pattern"));

        let err = FailoverError::ConnectionFailed("db-1:3306".to_string());
        assert!(err.to_string().contains("db-1:3306"));
    }
}
