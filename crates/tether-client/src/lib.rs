//! Client-side session coordinator for tether.
//!
//! Keeps one persistent connection correct across credential renewal,
//! navigation between threads and unreliable networks. The pieces can be
//! used on their own or through [`ChatSession`], which wires them together:
//!
//! - [`ConnectionManager`]: the connection state machine, send queue and
//!   reconnect backoff.
//! - [`CredentialScheduler`]: restores, refreshes and persists the credential.
//! - [`OperationMutex`]: at most one operation per `(type, key)`.
//! - [`Navigator`]: moves the active-thread pointer.
//! - [`Reconciler`]: merges optimistic sends with server confirmations.

pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod lock;
pub mod navigation;
pub mod reconcile;
pub mod rest;
pub mod session;
pub mod store;
pub mod transport;
pub mod ws;

pub use config::SessionConfig;
pub use connection::{ConnectionManager, ConnectionSnapshot, CredentialAction, SendOutcome};
pub use credentials::{AuthSnapshot, CredentialScheduler, TokenService};
pub use error::{ConfigError, ConnectError, LoadError, OperationError, RefreshError, StoreError};
pub use lock::{OperationMutex, StartOptions};
pub use navigation::{
    LoadStatus, NavigationEvent, NavigationSnapshot, Navigator, SwitchOptions, ThreadData,
    ThreadLoader,
};
pub use reconcile::{PendingMessage, PendingStatus, Reconciliation, Reconciler, ViewMessage};
pub use rest::RestBackend;
pub use session::{ChatSession, SessionSnapshot};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{Link, LinkEvent, Transport};
pub use ws::WsTransport;
