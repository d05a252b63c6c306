//! Protocol frames and message types.
//!
//! Only the delivery envelope is defined here; message bodies are opaque
//! text as far as the session layer is concerned.

use crate::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A conversation resource (thread) id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Server-assigned message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locally generated id for an optimistic message.
///
/// Sent along with the message so the server can echo it back on the
/// confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TempId(String);

impl TempId {
    pub fn generate() -> Self {
        Self(format!("tmp-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TempId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TempId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    Assistant,
    System,
}

/// A message the server has accepted. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedMessage {
    pub id: MessageId,
    pub resource_id: ResourceId,
    pub role: Role,
    pub content: String,
    pub sent_at: DateTime<Utc>,
    /// The sender's temp id, when the server echoes it back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<TempId>,
}

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame on every connection.
    Auth { identity: Identity, token: String },
    /// Replace the connection's credential without reconnecting.
    CredentialUpdate { token: String },
    /// Post a message to a thread.
    SendMessage {
        resource_id: ResourceId,
        client_ref: TempId,
        content: String,
    },
}

/// Frames sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Authentication accepted.
    Welcome { identity: Identity },
    /// A confirmed message (own echo or from someone else).
    Message(ConfirmedMessage),
    /// Error or rejection that does not end the connection.
    Error { code: String, message: String },
}
