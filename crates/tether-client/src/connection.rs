//! Connection manager.
//!
//! Owns the single persistent connection and its state machine:
//!
//! ```text
//! Idle -> Connecting -> Open -> (Closing ->) Closed
//!              \          \
//!               +-> Error <-+   (recoverable errors go back to Connecting)
//! ```
//!
//! One supervisor task per session opens the transport, replays queued
//! frames, pumps inbound frames to subscribers and reconnects with
//! exponential backoff after recoverable failures. Fatal failures end the
//! session and block `connect` for the rejected credential.
//!
//! Credential changes that keep the identity are applied in-band on an open
//! connection. Anything that needs a reconnect decision is debounced so a
//! burst of changes produces a single decision.

use crate::config::ConnectionConfig;
use crate::error::ConnectError;
use crate::transport::{Link, LinkEvent, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tether_core::{
    ClientFrame, ConnectionError, ConnectionState, Credential, Identity, ServerFrame,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

/// Published connection state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub last_error: Option<ConnectionError>,
    pub identity: Option<Identity>,
    /// Frames waiting for the connection to open.
    pub queued: usize,
    /// Consecutive failed attempts in the current session.
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
}

/// What `update_credential` did with a new credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialAction {
    /// Same identity on an open connection: sent as a credential-update frame.
    UpdatedInBand,
    /// Same token as the one in use.
    Unchanged,
    /// Reconnect decision scheduled after the debounce window.
    Deferred,
}

struct Session {
    generation: u64,
    identity: Identity,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    last_error: Option<ConnectionError>,
    attempt: u32,
    credential: Option<Credential>,
    session: Option<Session>,
    outbound: Option<mpsc::UnboundedSender<ClientFrame>>,
    queue: VecDeque<ClientFrame>,
    /// Token whose fatal rejection blocks `connect` until replaced or reset.
    blocked: Option<(String, ConnectionError)>,
    next_generation: u64,
    debounce_generation: u64,
    pending_credential: Option<Option<Credential>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    frames_tx: broadcast::Sender<ServerFrame>,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones control the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionSnapshot::default());
        let (frames_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                inner: Mutex::new(Inner::default()),
                state_tx,
                frames_tx,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a session for the credential's identity.
    ///
    /// No-op if a session for the same identity is already connecting, open
    /// or backing off (the newer credential is used on the next attempt). A
    /// session for another identity is torn down first.
    pub fn connect(&self, credential: Credential) -> Result<(), ConnectError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(ConnectError::ShutDown);
        }
        let mut inner = self.inner();
        let identity = credential.identity().clone();

        if let Some((token, error)) = &inner.blocked {
            if token == credential.token() {
                return Err(ConnectError::Blocked(error.clone()));
            }
            inner.blocked = None;
        }

        if let Some(session) = &inner.session {
            if session.identity == identity {
                tracing::debug!(component = "connection", %identity, "session already active, ignoring connect");
                inner.credential = Some(credential);
                return Ok(());
            }
            tracing::info!(component = "connection", from = %session.identity, to = %identity, "identity changed, reconnecting");
            self.teardown_locked(&mut inner);
        }

        inner.credential = Some(credential);
        self.start_session_locked(&mut inner, identity);
        Ok(())
    }

    /// Close the connection. Idempotent.
    pub fn disconnect(&self) {
        let mut inner = self.inner();
        inner.debounce_generation += 1;
        inner.pending_credential = None;
        self.teardown_locked(&mut inner);
    }

    /// Send a frame now if open, otherwise queue it for replay on open.
    pub fn send(&self, frame: ClientFrame) -> SendOutcome {
        let mut inner = self.inner();
        let mut frame = frame;
        if inner.state == ConnectionState::Open {
            if let Some(outbound) = &inner.outbound {
                match outbound.send(frame) {
                    Ok(()) => return SendOutcome::Sent,
                    Err(mpsc::error::SendError(returned)) => frame = returned,
                }
            }
        }
        inner.queue.push_back(frame);
        self.publish_locked(&inner);
        SendOutcome::Queued
    }

    /// React to a new (or removed) credential.
    pub fn update_credential(&self, credential: Option<Credential>) -> CredentialAction {
        let mut inner = self.inner();

        if let Some(new) = &credential {
            let same_identity = inner
                .session
                .as_ref()
                .is_some_and(|s| &s.identity == new.identity());

            if same_identity {
                if inner.credential.as_ref().map(Credential::token) == Some(new.token()) {
                    return CredentialAction::Unchanged;
                }
                inner.credential = Some(new.clone());
                if inner.state == ConnectionState::Open {
                    if let Some(outbound) = &inner.outbound {
                        let frame = ClientFrame::CredentialUpdate {
                            token: new.token().to_string(),
                        };
                        if outbound.send(frame).is_ok() {
                            tracing::debug!(component = "connection", identity = %new.identity(), "credential updated in-band");
                            return CredentialAction::UpdatedInBand;
                        }
                    }
                }
            }
        }

        inner.debounce_generation += 1;
        inner.pending_credential = Some(credential);
        let generation = inner.debounce_generation;
        drop(inner);

        let this = self.clone();
        let window = self.shared.config.debounce();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.shared.shutdown.cancelled() => {}
                _ = tokio::time::sleep(window) => this.apply_debounced(generation),
            }
        });
        CredentialAction::Deferred
    }

    /// Clear a fatal error so `connect` is accepted again.
    pub fn reset(&self) {
        let mut inner = self.inner();
        inner.blocked = None;
        if inner.session.is_none() {
            inner.last_error = None;
            inner.attempt = 0;
        }
        self.publish_locked(&inner);
    }

    /// Disconnect and refuse further connects.
    pub fn shutdown(&self) {
        self.disconnect();
        self.shared.shutdown.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner().state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.shared.state_tx.subscribe()
    }

    /// Inbound frames from the server.
    pub fn frames(&self) -> broadcast::Receiver<ServerFrame> {
        self.shared.frames_tx.subscribe()
    }

    /// Whether the connection is stopped on a fatal error.
    pub fn is_fatal(&self) -> bool {
        let inner = self.inner();
        inner.state == ConnectionState::Error
            && inner.session.is_none()
            && inner.last_error.as_ref().is_some_and(ConnectionError::is_fatal)
    }

    fn apply_debounced(&self, generation: u64) {
        let desired = {
            let mut inner = self.inner();
            if inner.debounce_generation != generation {
                return;
            }
            match inner.pending_credential.take() {
                Some(desired) => desired,
                None => return,
            }
        };

        match desired {
            None => {
                tracing::info!(component = "connection", "credential cleared, disconnecting");
                self.disconnect();
            }
            Some(credential) => {
                if let Err(e) = self.connect(credential) {
                    tracing::warn!(component = "connection", error = %e, "reconnect refused");
                }
            }
        }
    }

    fn start_session_locked(&self, inner: &mut Inner, identity: Identity) {
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let cancel = self.shared.shutdown.child_token();
        tracing::info!(component = "connection", %identity, generation, "starting session");

        inner.session = Some(Session {
            generation,
            identity,
            cancel: cancel.clone(),
        });
        inner.attempt = 0;
        self.set_state_locked(inner, ConnectionState::Connecting);

        tokio::spawn(self.clone().supervise(generation, cancel));
    }

    fn teardown_locked(&self, inner: &mut Inner) {
        if let Some(session) = inner.session.take() {
            session.cancel.cancel();
        }
        inner.outbound = None;
        inner.queue.clear();
        inner.attempt = 0;
        if inner.state == ConnectionState::Closed {
            self.publish_locked(inner);
            return;
        }
        if inner.state.can_transition_to(ConnectionState::Closing) {
            self.set_state_locked(inner, ConnectionState::Closing);
        }
        self.set_state_locked(inner, ConnectionState::Closed);
        tracing::info!(component = "connection", "disconnected");
    }

    fn is_current(inner: &Inner, generation: u64) -> bool {
        inner
            .session
            .as_ref()
            .is_some_and(|s| s.generation == generation)
    }

    async fn supervise(self, generation: u64, cancel: CancellationToken) {
        loop {
            let credential = {
                let inner = self.inner();
                if !Self::is_current(&inner, generation) {
                    return;
                }
                match inner.credential.clone() {
                    Some(credential) => credential,
                    None => return,
                }
            };

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                opened = self.shared.transport.open(&credential) => opened,
            };

            let failure = match opened {
                Ok(link) => {
                    let Some(inbound) = self.mark_open(generation, link, credential.token()) else {
                        return;
                    };
                    match self.pump(inbound, &cancel).await {
                        Some(error) => error,
                        None => return,
                    }
                }
                Err(error) => error,
            };

            let delay = {
                let mut inner = self.inner();
                if !Self::is_current(&inner, generation) {
                    return;
                }
                inner.outbound = None;

                if failure.is_fatal() {
                    tracing::warn!(component = "connection", error = %failure, "fatal connection error, not retrying");
                    inner.blocked = Some((credential.token().to_string(), failure.clone()));
                    inner.last_error = Some(failure);
                    inner.session = None;
                    self.set_state_locked(&mut inner, ConnectionState::Error);
                    return;
                }

                inner.attempt += 1;
                inner.last_error = Some(failure.clone());
                if inner.attempt > self.shared.config.max_attempts {
                    tracing::warn!(component = "connection", error = %failure, attempts = inner.attempt - 1, "giving up reconnecting");
                    inner.session = None;
                    self.set_state_locked(&mut inner, ConnectionState::Error);
                    return;
                }

                let delay = self.shared.config.backoff(inner.attempt);
                tracing::info!(component = "connection", error = %failure, attempt = inner.attempt, delay_ms = delay.as_millis() as u64, "connection lost, retrying");
                self.set_state_locked(&mut inner, ConnectionState::Error);
                delay
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            {
                let mut inner = self.inner();
                if !Self::is_current(&inner, generation) {
                    return;
                }
                self.set_state_locked(&mut inner, ConnectionState::Connecting);
            }
        }
    }

    /// Mark the session open and replay queued frames in order. Returns the
    /// inbound side if the session is still current.
    fn mark_open(
        &self,
        generation: u64,
        link: Link,
        opened_with: &str,
    ) -> Option<mpsc::UnboundedReceiver<LinkEvent>> {
        let Link { outbound, inbound } = link;
        let mut inner = self.inner();
        if !Self::is_current(&inner, generation) {
            return None;
        }

        // Credential replaced while we were connecting.
        if let Some(latest) = inner.credential.as_ref().filter(|c| c.token() != opened_with) {
            let _ = outbound.send(ClientFrame::CredentialUpdate {
                token: latest.token().to_string(),
            });
        }

        let replayed = inner.queue.len();
        while let Some(frame) = inner.queue.pop_front() {
            if let Err(mpsc::error::SendError(frame)) = outbound.send(frame) {
                inner.queue.push_front(frame);
                break;
            }
        }

        inner.outbound = Some(outbound);
        inner.attempt = 0;
        inner.last_error = None;
        self.set_state_locked(&mut inner, ConnectionState::Open);
        tracing::info!(component = "connection", generation, replayed, "connection open");
        Some(inbound)
    }

    async fn pump(
        &self,
        mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: &CancellationToken,
    ) -> Option<ConnectionError> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                event = inbound.recv() => match event {
                    Some(LinkEvent::Frame(frame)) => {
                        // Nobody listening is fine.
                        let _ = self.shared.frames_tx.send(frame);
                    }
                    Some(LinkEvent::Closed(error)) => return Some(error),
                    None => return Some(ConnectionError::network("transport dropped the link")),
                },
            }
        }
    }

    fn set_state_locked(&self, inner: &mut Inner, next: ConnectionState) {
        if inner.state != next {
            if !inner.state.can_transition_to(next) {
                tracing::warn!(component = "connection", from = %inner.state, to = %next, "ignoring illegal state transition");
                return;
            }
            tracing::debug!(component = "connection", from = %inner.state, to = %next, "state transition");
            inner.state = next;
        }
        self.publish_locked(inner);
    }

    fn publish_locked(&self, inner: &Inner) {
        self.shared.state_tx.send_replace(ConnectionSnapshot {
            state: inner.state,
            last_error: inner.last_error.clone(),
            identity: inner.session.as_ref().map(|s| s.identity.clone()),
            queued: inner.queue.len(),
            attempt: inner.attempt,
        });
    }
}
