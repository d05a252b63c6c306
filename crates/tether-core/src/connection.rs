//! Connection lifecycle states and error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Nothing attempted yet.
    #[default]
    Idle,
    /// Transport being opened.
    Connecting,
    /// Authenticated and live.
    Open,
    /// Shutting down at the caller's request.
    Closing,
    /// Closed; `connect` may be called again.
    Closed,
    /// Failed; see the last error for whether a retry is pending.
    Error,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting | Closed)
                | (Connecting, Open | Error | Closing | Closed)
                | (Open, Closing | Error | Closed)
                | (Closing, Closed)
                | (Closed, Connecting)
                | (Error, Connecting | Closing | Closed)
        )
    }

    /// Connecting or open.
    pub fn is_active(self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// What went wrong with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure (refused, reset, abnormal close).
    Network,
    /// Server-side failure (5xx, internal error close codes).
    Server,
    /// The server closed the connection normally.
    Closed,
    /// Unreadable frame from the server.
    Protocol,
    /// Credential rejected.
    AuthRejected,
    /// Server refused the session on policy grounds.
    PolicyViolation,
}

impl ErrorKind {
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorKind::AuthRejected | ErrorKind::PolicyViolation)
    }

    /// Classify a WebSocket close code.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            1000 | 1001 => ErrorKind::Closed,
            1006 => ErrorKind::Network,
            1008 => ErrorKind::PolicyViolation,
            1011..=1014 => ErrorKind::Server,
            4001 | 4003 => ErrorKind::AuthRejected,
            4000..=4999 => ErrorKind::PolicyViolation,
            _ => ErrorKind::Network,
        }
    }

    /// Classify an HTTP status seen during the upgrade handshake.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::AuthRejected,
            500..=599 => ErrorKind::Server,
            400..=499 => ErrorKind::PolicyViolation,
            _ => ErrorKind::Network,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Network => "network",
            ErrorKind::Server => "server",
            ErrorKind::Closed => "closed",
            ErrorKind::Protocol => "protocol",
            ErrorKind::AuthRejected => "auth rejected",
            ErrorKind::PolicyViolation => "policy violation",
        };
        f.write_str(s)
    }
}

/// A connection failure with its recoverability and when it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
    pub recoverable: bool,
    pub at: DateTime<Utc>,
}

impl ConnectionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: kind.is_recoverable(),
            at: Utc::now(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn auth_rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRejected, message)
    }

    pub fn from_close(code: u16, reason: &str) -> Self {
        let message = if reason.is_empty() {
            format!("closed with code {code}")
        } else {
            format!("closed with code {code}: {reason}")
        };
        Self::new(ErrorKind::from_close_code(code), message)
    }

    pub fn is_fatal(&self) -> bool {
        !self.recoverable
    }
}
