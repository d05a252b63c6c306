//! Core types for tether.
//!
//! This crate provides the protocol primitives shared by the client session
//! coordinator and servers: identities, credentials, frames and the
//! connection state taxonomy.

mod connection;
mod credential;
mod identity;
mod message;

pub use connection::{ConnectionError, ConnectionState, ErrorKind};
pub use credential::{Claims, Credential, CredentialError};
pub use identity::{Identity, IdentityParseError};
pub use message::{
    ClientFrame, ConfirmedMessage, MessageId, ResourceId, Role, ServerFrame, TempId,
};
