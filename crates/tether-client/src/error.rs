//! Error types returned across the public API.
//!
//! Nothing here is raised as a panic: every fallible operation resolves to a
//! `Result` carrying one of these.

use std::time::Duration;
use tether_core::{ConnectionError, CredentialError};

/// Outcome of a guarded operation (thread switch, send, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    /// Another operation with the same key is running. Returned, not
    /// raised, so the caller can decide to force.
    #[error("{op_type} operation already in progress for {key}")]
    AlreadyInProgress { op_type: String, key: String },
    /// Superseded or explicitly cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// Gave up waiting.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
    /// Retries exhausted on a transient failure.
    #[error("operation failed: {0}")]
    Failed(String),
    /// The backend refused; retrying will not help.
    #[error("operation rejected: {0}")]
    Rejected(String),
    #[error("no active thread")]
    NoActiveResource,
    #[error("nothing to retry")]
    NothingToRetry,
}

impl OperationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, OperationError::Cancelled)
    }
}

/// Why `connect` refused to start.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The last attempt failed fatally with this credential; re-authenticate
    /// or call `reset` first.
    #[error("connection blocked by fatal error: {0}")]
    Blocked(ConnectionError),
    #[error("connection manager is shut down")]
    ShutDown,
}

/// A refresh attempt against the token service failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// The service refused the credential (e.g. revoked session).
    #[error("refresh rejected: {0}")]
    Rejected(String),
    /// Network or server trouble; the next cycle may succeed.
    #[error("refresh failed: {0}")]
    Transient(String),
    /// The service answered with a token we cannot decode.
    #[error("refresh returned an invalid token: {0}")]
    InvalidToken(String),
    #[error("not logged in")]
    NoCredential,
}

impl From<CredentialError> for RefreshError {
    fn from(err: CredentialError) -> Self {
        RefreshError::InvalidToken(err.to_string())
    }
}

/// A thread load attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("thread not found: {0}")]
    NotFound(String),
    #[error("load rejected: {0}")]
    Rejected(String),
    #[error("load failed: {0}")]
    Transient(String),
    #[error("load cancelled")]
    Cancelled,
}

impl LoadError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LoadError::Transient(_))
    }
}

/// Persisted key-value store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store contents are corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Configuration could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {field} must be greater than zero")]
    Zero { field: &'static str },
}
