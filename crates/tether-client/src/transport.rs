//! Transport seam between the connection manager and the wire.
//!
//! A transport opens one authenticated link per call. The link is a pair of
//! channels: frames pushed into `outbound` are written in order, and
//! everything the server sends (or the reason the link died) arrives on
//! `inbound`. Dropping `outbound` closes the link.

use async_trait::async_trait;
use tether_core::{ClientFrame, ConnectionError, Credential, ServerFrame};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum LinkEvent {
    Frame(ServerFrame),
    /// The link is gone; no further events follow.
    Closed(ConnectionError),
}

#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<ClientFrame>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Link {
    /// Build a link plus the far ends of its channels.
    pub fn pair() -> (
        Link,
        mpsc::UnboundedReceiver<ClientFrame>,
        mpsc::UnboundedSender<LinkEvent>,
    ) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        (Link { outbound, inbound }, outbound_rx, inbound_tx)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link authenticated as the holder of `credential`.
    ///
    /// Resolves once the server has accepted the credential.
    async fn open(&self, credential: &Credential) -> Result<Link, ConnectionError>;
}
