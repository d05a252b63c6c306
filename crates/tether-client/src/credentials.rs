//! Credential store and refresh scheduler.
//!
//! Owns the current [`Credential`]: restores it at startup, keeps it fresh on
//! a cadence derived from its lifetime, and follows changes other processes
//! make to the persisted copy. Everyone else observes it through
//! [`CredentialScheduler::subscribe`].

use crate::config::CredentialConfig;
use crate::error::RefreshError;
use crate::store::{KeyValueStore, StorageEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_core::{Credential, CredentialError, Identity};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Backend that exchanges a credential for a fresh one.
#[async_trait]
pub trait TokenService: Send + Sync {
    /// Return a new token for the holder of `current`.
    async fn refresh(&self, current: &Credential) -> Result<String, RefreshError>;

    /// Whether `credential` should be refreshed now. Defaults to "within the
    /// last third of its lifetime".
    fn needs_refresh(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        credential.remaining_at(now) <= credential.lifetime() / 3
    }
}

/// Published credential state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthSnapshot {
    pub credential: Option<Credential>,
    pub loading: bool,
    pub initialized: bool,
    pub last_refresh_error: Option<RefreshError>,
}

impl AuthSnapshot {
    /// Holding a credential that has not yet expired.
    pub fn is_authenticated(&self) -> bool {
        self.credential.as_ref().is_some_and(|c| !c.is_expired())
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.credential.as_ref().map(Credential::identity)
    }
}

struct Shared {
    store: Arc<dyn KeyValueStore>,
    service: Arc<dyn TokenService>,
    config: CredentialConfig,
    state: watch::Sender<AuthSnapshot>,
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    workers_started: AtomicBool,
}

/// Cheap to clone; clones drive the same credential.
#[derive(Clone)]
pub struct CredentialScheduler {
    shared: Arc<Shared>,
}

impl CredentialScheduler {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        service: Arc<dyn TokenService>,
        config: CredentialConfig,
    ) -> Self {
        let (state, _) = watch::channel(AuthSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                store,
                service,
                config,
                state,
                refresh_lock: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                workers_started: AtomicBool::new(false),
            }),
        }
    }

    /// Restore the persisted credential, refreshing it once if it has
    /// expired, then start the check loop and storage watcher.
    ///
    /// Always ends with `initialized = true, loading = false`.
    pub async fn initialize(&self) -> AuthSnapshot {
        self.shared.state.send_modify(|s| {
            s.loading = true;
            s.initialized = false;
        });

        let credential = match self.restore().await {
            None => None,
            Some(credential) if !credential.is_expired() => {
                tracing::info!(component = "credentials", identity = %credential.identity(), "restored credential");
                Some(credential)
            }
            Some(expired) => {
                tracing::info!(component = "credentials", identity = %expired.identity(), "stored credential expired, refreshing");
                match self.exchange(&expired).await {
                    Ok(fresh) => {
                        self.persist(&fresh).await;
                        Some(fresh)
                    }
                    Err(e) => {
                        tracing::warn!(component = "credentials", error = %e, "refresh at startup failed, clearing credential");
                        self.forget().await;
                        None
                    }
                }
            }
        };

        self.shared.state.send_modify(|s| {
            s.credential = credential;
            s.loading = false;
            s.initialized = true;
        });
        self.spawn_workers();
        self.snapshot()
    }

    /// Adopt a token obtained by logging in.
    pub async fn login(&self, token: impl Into<String>) -> Result<Credential, CredentialError> {
        let credential = Credential::decode(token)?;
        if credential.is_expired() {
            return Err(CredentialError::Expired(credential.expires_at()));
        }
        tracing::info!(component = "credentials", identity = %credential.identity(), "logged in");
        self.adopt(credential.clone()).await;
        Ok(credential)
    }

    pub async fn logout(&self) {
        tracing::info!(component = "credentials", "logged out");
        self.forget().await;
        self.shared.state.send_modify(|s| {
            s.credential = None;
            s.last_refresh_error = None;
        });
    }

    /// Attempt one refresh. On failure the current credential is kept.
    pub async fn refresh_now(&self) -> Result<Credential, RefreshError> {
        let _guard = self.shared.refresh_lock.lock().await;
        let current = self.current().ok_or(RefreshError::NoCredential)?;

        match self.exchange(&current).await {
            Ok(fresh) => {
                // Logged out or replaced while the request was in flight.
                if self.current().as_ref().map(Credential::token) != Some(current.token()) {
                    tracing::debug!(component = "credentials", "discarding refresh for superseded credential");
                    return Err(RefreshError::NoCredential);
                }
                tracing::info!(component = "credentials", identity = %fresh.identity(), expires_at = %fresh.expires_at(), "credential refreshed");
                self.adopt(fresh.clone()).await;
                Ok(fresh)
            }
            Err(e) => {
                tracing::warn!(component = "credentials", error = %e, "refresh failed, keeping current credential");
                self.shared
                    .state
                    .send_modify(|s| s.last_refresh_error = Some(e.clone()));
                Err(e)
            }
        }
    }

    pub fn current(&self) -> Option<Credential> {
        self.shared.state.borrow().credential.clone()
    }

    pub fn snapshot(&self) -> AuthSnapshot {
        self.shared.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.shared.state.subscribe()
    }

    /// Stop the background check loop and storage watcher.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }

    async fn exchange(&self, current: &Credential) -> Result<Credential, RefreshError> {
        let token = self.shared.service.refresh(current).await?;
        let fresh = Credential::decode(token)?;
        if fresh.is_expired() {
            return Err(RefreshError::InvalidToken("refreshed token already expired".into()));
        }
        Ok(fresh)
    }

    async fn restore(&self) -> Option<Credential> {
        let key = &self.shared.config.storage_key;
        let raw = match self.shared.store.get(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!(component = "credentials", error = %e, "cannot read stored credential");
                return None;
            }
        };
        match Credential::decode(raw) {
            Ok(credential) => Some(credential),
            Err(e) => {
                tracing::warn!(component = "credentials", error = %e, "discarding undecodable stored credential");
                self.forget().await;
                None
            }
        }
    }

    async fn adopt(&self, credential: Credential) {
        self.persist(&credential).await;
        self.shared.state.send_modify(|s| {
            s.credential = Some(credential);
            s.last_refresh_error = None;
        });
    }

    async fn persist(&self, credential: &Credential) {
        let key = &self.shared.config.storage_key;
        if let Err(e) = self.shared.store.set(key, credential.token()).await {
            tracing::warn!(component = "credentials", error = %e, "cannot persist credential");
        }
    }

    async fn forget(&self) {
        let key = &self.shared.config.storage_key;
        if let Err(e) = self.shared.store.remove(key).await {
            tracing::warn!(component = "credentials", error = %e, "cannot remove stored credential");
        }
    }

    fn spawn_workers(&self) {
        if self.shared.workers_started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(self.clone().run_check_loop());
        // Subscribe before spawning so no change slips past.
        let events = self.shared.store.subscribe();
        tokio::spawn(self.clone().run_storage_watcher(events));
    }

    async fn run_check_loop(self) {
        let shutdown = self.shared.shutdown.clone();
        let mut rx = self.shared.state.subscribe();

        'outer: loop {
            let credential = rx.borrow_and_update().credential.clone();
            let Some(credential) = credential else {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
                continue;
            };

            let interval = self.shared.config.check_interval(credential.lifetime());
            tracing::debug!(component = "credentials", interval_ms = interval.as_millis() as u64, "next refresh check scheduled");
            let deadline = tokio::time::sleep(interval);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = &mut deadline => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let replaced = rx.borrow().credential.as_ref().map(Credential::token)
                            != Some(credential.token());
                        if replaced {
                            continue 'outer;
                        }
                    }
                }
            }

            let now = Utc::now();
            let expired = credential.is_expired_at(now);
            if self.shared.service.needs_refresh(&credential, now) || expired {
                // Failures are recorded in the snapshot; the next cycle retries.
                if self.refresh_now().await.is_err() && expired {
                    self.withdraw_expired(&credential);
                }
            }
        }
    }

    /// Stop publishing a credential that expired without a successful
    /// refresh. The stored copy stays so another process can replace it.
    fn withdraw_expired(&self, expired: &Credential) {
        let withdrawn = self.shared.state.send_if_modified(|s| {
            if s.credential.as_ref().map(Credential::token) != Some(expired.token()) {
                return false;
            }
            s.credential = None;
            true
        });
        if withdrawn {
            tracing::warn!(
                component = "credentials",
                identity = %expired.identity(),
                "credential expired and could not be refreshed"
            );
        }
    }

    async fn run_storage_watcher(self, mut events: broadcast::Receiver<StorageEvent>) {
        let shutdown = self.shared.shutdown.clone();
        let key = self.shared.config.storage_key.clone();
        let own_origin = self.shared.store.origin();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return,
                event = events.recv() => event,
            };
            match event {
                Ok(event) if event.key == key && event.origin != own_origin => {
                    self.apply_external(event.value).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(component = "credentials", skipped, "storage events lagged, re-reading");
                    match self.shared.store.get(&key).await {
                        Ok(value) => self.apply_external(value).await,
                        Err(e) => tracing::warn!(component = "credentials", error = %e, "cannot re-read stored credential"),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn apply_external(&self, value: Option<String>) {
        let current = self.current();
        match value {
            Some(token) => {
                if current.as_ref().map(Credential::token) == Some(token.as_str()) {
                    return;
                }
                match Credential::decode(token) {
                    Ok(credential) if !credential.is_expired() => {
                        tracing::info!(component = "credentials", identity = %credential.identity(), "adopting credential changed elsewhere");
                        self.shared.state.send_modify(|s| {
                            s.credential = Some(credential);
                            s.last_refresh_error = None;
                        });
                    }
                    Ok(_) => tracing::debug!(component = "credentials", "ignoring expired external credential"),
                    Err(e) => tracing::debug!(component = "credentials", error = %e, "ignoring undecodable external credential"),
                }
            }
            None => {
                if current.is_some() && self.shared.config.follow_external_logout {
                    tracing::info!(component = "credentials", "credential removed elsewhere, logging out");
                    self.shared.state.send_modify(|s| {
                        s.credential = None;
                        s.last_refresh_error = None;
                    });
                }
            }
        }
    }
}
