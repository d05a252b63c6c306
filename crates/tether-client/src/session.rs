//! The session facade UI code talks to.
//!
//! [`ChatSession`] wires the coordinators together: credential changes flow
//! into the connection manager, inbound message frames flow into the
//! reconciler, and a sweeper times out sends that were never confirmed.

use crate::config::SessionConfig;
use crate::connection::{ConnectionManager, ConnectionSnapshot};
use crate::credentials::{AuthSnapshot, CredentialScheduler, TokenService};
use crate::error::OperationError;
use crate::lock::OperationMutex;
use crate::navigation::{
    NavigationEvent, NavigationSnapshot, Navigator, SwitchOptions, ThreadData, ThreadLoader,
};
use crate::reconcile::{PendingMessage, ReconcileStats, Reconciler, ViewMessage};
use crate::store::KeyValueStore;
use crate::transport::Transport;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_core::{ClientFrame, Credential, CredentialError, ResourceId, Role, ServerFrame, TempId};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Everything observable about a session at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub auth: AuthSnapshot,
    pub connection: ConnectionSnapshot,
    pub navigation: NavigationSnapshot,
    pub messages: ReconcileStats,
}

pub struct ChatSession {
    config: SessionConfig,
    credentials: CredentialScheduler,
    connection: ConnectionManager,
    mutex: OperationMutex,
    navigator: Navigator,
    reconciler: Reconciler,
    tasks: CancellationToken,
    started: AtomicBool,
}

impl ChatSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenService>,
        loader: Arc<dyn ThreadLoader>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let credentials = CredentialScheduler::new(store, tokens, config.credentials.clone());
        let connection = ConnectionManager::new(transport, config.connection.clone());
        let mutex = OperationMutex::new();
        let reconciler = Reconciler::new(config.reconcile.clone());
        let navigator = Navigator::new(
            loader,
            mutex.clone(),
            connection.clone(),
            reconciler.clone(),
            config.navigation.clone(),
        );
        Self {
            config,
            credentials,
            connection,
            mutex,
            navigator,
            reconciler,
            tasks: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Restore credentials, connect if logged in and start background work.
    /// Calling it again just returns the current credential state.
    pub async fn start(&self) -> AuthSnapshot {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.credentials.snapshot();
        }

        // Subscribe before connecting so no early frame is missed.
        let frames = self.connection.frames();
        tokio::spawn(pump_frames(
            frames,
            self.reconciler.clone(),
            self.tasks.clone(),
        ));

        let auth = self.credentials.initialize().await;
        match &auth.credential {
            Some(credential) => {
                if let Err(e) = self.connection.connect(credential.clone()) {
                    tracing::warn!(component = "session", error = %e, "initial connect refused");
                }
            }
            None => tracing::info!(component = "session", "starting unauthenticated"),
        }

        tokio::spawn(bridge_credentials(
            self.credentials.subscribe(),
            self.connection.clone(),
            self.tasks.clone(),
        ));
        tokio::spawn(sweep(
            self.reconciler.clone(),
            self.config.reconcile.sweep_interval(),
            self.tasks.clone(),
        ));
        auth
    }

    pub async fn login(&self, token: impl Into<String>) -> Result<Credential, CredentialError> {
        self.credentials.login(token).await
    }

    /// Forget the credential and close the connection. The active thread is
    /// left as it was.
    pub async fn logout(&self) {
        self.credentials.logout().await;
        self.connection.disconnect();
    }

    /// Send a message to the active thread.
    pub fn send_message(&self, content: impl Into<String>) -> Result<PendingMessage, OperationError> {
        let pending = self.add_optimistic_message(content, Role::User)?;
        self.transmit(&pending);
        Ok(pending)
    }

    /// Send a timed-out message again.
    pub fn retry_send(&self, temp_id: &TempId) -> Result<PendingMessage, OperationError> {
        let pending = self
            .reconciler
            .retry_timed_out(temp_id)
            .ok_or(OperationError::NothingToRetry)?;
        self.transmit(&pending);
        Ok(pending)
    }

    fn transmit(&self, pending: &PendingMessage) {
        let outcome = self.connection.send(ClientFrame::SendMessage {
            resource_id: pending.resource_id.clone(),
            client_ref: pending.temp_id.clone(),
            content: pending.content.clone(),
        });
        tracing::debug!(component = "session", temp_id = %pending.temp_id, ?outcome, "message sent");
    }

    /// Show a message in the active thread without sending it.
    pub fn add_optimistic_message(
        &self,
        content: impl Into<String>,
        role: Role,
    ) -> Result<PendingMessage, OperationError> {
        let resource_id = self
            .navigator
            .active_resource()
            .ok_or(OperationError::NoActiveResource)?;
        Ok(self.reconciler.add_optimistic_message(resource_id, content, role))
    }

    pub async fn switch_to_thread(
        &self,
        resource_id: impl Into<ResourceId>,
        options: SwitchOptions,
    ) -> Result<ThreadData, OperationError> {
        self.navigator
            .switch_to_thread(resource_id.into(), options)
            .await
    }

    pub fn cancel_loading(&self) -> bool {
        self.navigator.cancel_loading()
    }

    pub async fn retry_last_failed(&self) -> Result<ThreadData, OperationError> {
        self.navigator.retry_last_failed().await
    }

    /// Ordered view of the active thread.
    pub fn messages(&self) -> Vec<ViewMessage> {
        match self.navigator.active_resource() {
            Some(resource_id) => self.reconciler.ordered_messages(&resource_id),
            None => Vec::new(),
        }
    }

    /// Sends in the active thread that were never confirmed.
    pub fn failed_sends(&self) -> Vec<PendingMessage> {
        match self.navigator.active_resource() {
            Some(resource_id) => self.reconciler.timed_out(&resource_id),
            None => Vec::new(),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            auth: self.credentials.snapshot(),
            connection: self.connection.snapshot(),
            navigation: self.navigator.snapshot(),
            messages: self.reconciler.stats(),
        }
    }

    pub fn subscribe_auth(&self) -> watch::Receiver<AuthSnapshot> {
        self.credentials.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connection.subscribe()
    }

    pub fn subscribe_navigation(&self) -> watch::Receiver<NavigationSnapshot> {
        self.navigator.subscribe()
    }

    pub fn navigation_events(&self) -> broadcast::Receiver<NavigationEvent> {
        self.navigator.events()
    }

    /// Revision counter bumped whenever the message view changes.
    pub fn subscribe_messages(&self) -> watch::Receiver<u64> {
        self.reconciler.subscribe()
    }

    pub fn credentials(&self) -> &CredentialScheduler {
        &self.credentials
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn navigator(&self) -> &Navigator {
        &self.navigator
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Stop background work, close the connection and cancel running
    /// operations.
    pub fn shutdown(&self) {
        tracing::info!(component = "session", "shutting down");
        self.tasks.cancel();
        self.credentials.shutdown();
        self.connection.shutdown();
        self.mutex.clear_history();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}

async fn bridge_credentials(
    mut auth: watch::Receiver<AuthSnapshot>,
    connection: ConnectionManager,
    cancel: CancellationToken,
) {
    let mut last = auth
        .borrow_and_update()
        .credential
        .as_ref()
        .map(|c| c.token().to_string());

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = auth.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }

        let credential = auth.borrow_and_update().credential.clone();
        let token = credential.as_ref().map(|c| c.token().to_string());
        // Loading flags and refresh errors change too; only tokens matter here.
        if token == last {
            continue;
        }
        last = token;
        let action = connection.update_credential(credential);
        tracing::debug!(component = "session", ?action, "credential change forwarded");
    }
}

async fn pump_frames(
    mut frames: broadcast::Receiver<ServerFrame>,
    reconciler: Reconciler,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            frame = frames.recv() => frame,
        };
        match frame {
            Ok(ServerFrame::Message(message)) => {
                let outcome = reconciler.process_confirmation(message);
                tracing::debug!(component = "session", ?outcome, "inbound message");
            }
            Ok(ServerFrame::Error { code, message }) => {
                tracing::warn!(component = "session", %code, %message, "server reported an error");
            }
            Ok(ServerFrame::Welcome { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(component = "session", skipped, "inbound frames dropped");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn sweep(reconciler: Reconciler, every: std::time::Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                reconciler.cleanup();
            }
        }
    }
}
