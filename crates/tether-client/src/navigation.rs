//! Thread navigation.
//!
//! [`Navigator`] owns the active-thread pointer and moves it with
//! `switch_to_thread`. Each switch runs under the operation mutex keyed by
//! `("switch", thread id)`: a repeat of the in-flight switch is refused, and
//! a switch to a different thread cancels the in-flight one and waits for it
//! to resolve before starting. Loads are bounded by a timeout (retried once)
//! and transient failures are retried with doubling delays.

use crate::config::NavigationConfig;
use crate::connection::ConnectionManager;
use crate::error::{LoadError, OperationError};
use crate::lock::{OperationMutex, StartOptions};
use crate::reconcile::Reconciler;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tether_core::{ConfirmedMessage, ResourceId};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

const SWITCH: &str = "switch";

/// A loaded thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadData {
    pub resource_id: ResourceId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ConfirmedMessage>,
}

/// Fetches thread contents from the backend.
#[async_trait]
pub trait ThreadLoader: Send + Sync {
    /// Load a thread. Implementations should give up promptly once `cancel`
    /// fires.
    async fn load(
        &self,
        resource_id: &ResourceId,
        cancel: CancellationToken,
    ) -> Result<ThreadData, LoadError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchOptions {
    /// Drop the current message view before loading.
    pub clear_messages: bool,
    /// Per-attempt load timeout; the configured default if unset.
    pub timeout: Option<Duration>,
    /// Restart a switch to the same thread that is already loading.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadStatus {
    #[default]
    Idle,
    Loading,
    Loaded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NavigationSnapshot {
    /// The active thread.
    pub active: Option<ResourceId>,
    pub status: LoadStatus,
    /// Thread being loaded.
    pub target: Option<ResourceId>,
    /// Failed switches since the last successful one.
    pub retry_count: u32,
    pub last_error: Option<OperationError>,
    /// Target that `retry_last_failed` would switch to.
    pub last_failed: Option<ResourceId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NavigationEvent {
    Loading { resource_id: ResourceId },
    Loaded { data: ThreadData },
    Failed {
        resource_id: ResourceId,
        error: OperationError,
    },
    Cancelled { resource_id: ResourceId },
}

struct InFlight {
    id: u64,
    target: ResourceId,
    /// Fired when the switch has resolved.
    done: CancellationToken,
}

#[derive(Default)]
struct NavState {
    snapshot: NavigationSnapshot,
    in_flight: Option<InFlight>,
    last_failed_options: SwitchOptions,
}

struct Shared {
    loader: Arc<dyn ThreadLoader>,
    mutex: OperationMutex,
    connection: ConnectionManager,
    reconciler: Reconciler,
    config: NavigationConfig,
    state: Mutex<NavState>,
    next_id: AtomicU64,
    snapshot_tx: watch::Sender<NavigationSnapshot>,
    events_tx: broadcast::Sender<NavigationEvent>,
}

/// Cheap to clone; clones share the same pointer.
#[derive(Clone)]
pub struct Navigator {
    shared: Arc<Shared>,
}

impl Navigator {
    pub fn new(
        loader: Arc<dyn ThreadLoader>,
        mutex: OperationMutex,
        connection: ConnectionManager,
        reconciler: Reconciler,
        config: NavigationConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(NavigationSnapshot::default());
        let (events_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                loader,
                mutex,
                connection,
                reconciler,
                config,
                state: Mutex::new(NavState::default()),
                next_id: AtomicU64::new(1),
                snapshot_tx,
                events_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, NavState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &NavState) {
        self.shared.snapshot_tx.send_replace(state.snapshot.clone());
    }

    fn emit(&self, event: NavigationEvent) {
        let _ = self.shared.events_tx.send(event);
    }

    pub fn active_resource(&self) -> Option<ResourceId> {
        self.state().snapshot.active.clone()
    }

    pub fn snapshot(&self) -> NavigationSnapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NavigationSnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<NavigationEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Make `resource_id` the active thread once it has loaded.
    pub async fn switch_to_thread(
        &self,
        resource_id: ResourceId,
        options: SwitchOptions,
    ) -> Result<ThreadData, OperationError> {
        let superseded = {
            let state = self.state();
            state
                .in_flight
                .as_ref()
                .filter(|f| f.target != resource_id)
                .map(|f| (f.target.clone(), f.done.clone()))
        };

        let mut start = StartOptions {
            force: options.force,
        };
        if let Some((previous, done)) = superseded {
            tracing::info!(component = "navigation", from = %previous, to = %resource_id, "superseding switch");
            self.shared.mutex.cancel(SWITCH, previous.as_str());
            done.cancelled().await;
            start = StartOptions::forced();
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let this = self.clone();
        let key = resource_id.to_string();
        self.shared
            .mutex
            .start(SWITCH, &key, start, move |cancel| {
                this.run_switch(id, resource_id, options, cancel)
            })
            .await
    }

    /// Abort the in-flight switch. The active thread is left as it was.
    pub fn cancel_loading(&self) -> bool {
        let target = {
            let mut state = self.state();
            let Some(in_flight) = state.in_flight.take() else {
                return false;
            };
            state.snapshot.status = LoadStatus::Cancelled;
            state.snapshot.target = None;
            self.publish(&state);
            in_flight.target
        };
        self.shared.mutex.cancel(SWITCH, target.as_str());
        tracing::info!(component = "navigation", resource_id = %target, "switch cancelled");
        self.emit(NavigationEvent::Cancelled {
            resource_id: target,
        });
        true
    }

    /// Repeat the most recent failed switch.
    pub async fn retry_last_failed(&self) -> Result<ThreadData, OperationError> {
        let (target, options) = {
            let state = self.state();
            match &state.snapshot.last_failed {
                Some(target) => (target.clone(), state.last_failed_options),
                None => return Err(OperationError::NothingToRetry),
            }
        };
        tracing::debug!(component = "navigation", resource_id = %target, "retrying failed switch");
        self.switch_to_thread(target, options).await
    }

    async fn run_switch(
        self,
        id: u64,
        resource_id: ResourceId,
        options: SwitchOptions,
        cancel: CancellationToken,
    ) -> Result<ThreadData, OperationError> {
        let done = CancellationToken::new();
        let mut guard = SwitchGuard {
            navigator: self.clone(),
            id,
            resource_id: resource_id.clone(),
            done: done.clone(),
            resolved: false,
        };

        let stale = {
            let mut state = self.state();
            let stale = state
                .in_flight
                .replace(InFlight {
                    id,
                    target: resource_id.clone(),
                    done,
                })
                .filter(|f| f.target != resource_id);
            state.snapshot.status = LoadStatus::Loading;
            state.snapshot.target = Some(resource_id.clone());
            state.snapshot.last_error = None;
            self.publish(&state);
            stale
        };
        // Lost a race with another switch; it must not keep loading.
        if let Some(stale) = stale {
            self.shared.mutex.cancel(SWITCH, stale.target.as_str());
        }

        if options.clear_messages {
            self.shared.reconciler.clear();
        }
        tracing::info!(component = "navigation", %resource_id, "loading thread");
        self.emit(NavigationEvent::Loading {
            resource_id: resource_id.clone(),
        });

        let timeout = options.timeout.unwrap_or_else(|| self.shared.config.load_timeout());
        let result = self.load_with_retry(&resource_id, timeout, &cancel).await;
        guard.resolved = true;
        self.finish(id, &resource_id, options, result)
    }

    async fn load_with_retry(
        &self,
        resource_id: &ResourceId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ThreadData, OperationError> {
        let config = &self.shared.config;
        let mut failures = 0u32;
        let mut timeouts = 0u32;

        loop {
            let attempt = cancel.child_token();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OperationError::Cancelled),
                outcome = tokio::time::timeout(
                    timeout,
                    self.shared.loader.load(resource_id, attempt.clone()),
                ) => outcome,
            };

            let delay = match outcome {
                Ok(Ok(data)) => return Ok(data),
                Ok(Err(LoadError::Cancelled)) => return Err(OperationError::Cancelled),
                Ok(Err(e)) if !e.is_transient() => {
                    return Err(OperationError::Rejected(e.to_string()));
                }
                Ok(Err(e)) => {
                    failures += 1;
                    if failures >= config.max_attempts {
                        return Err(OperationError::Failed(e.to_string()));
                    }
                    tracing::warn!(component = "navigation", %resource_id, error = %e, attempt = failures, "thread load failed, retrying");
                    config.retry_delay(failures)
                }
                Err(_) => {
                    attempt.cancel();
                    timeouts += 1;
                    if timeouts > config.timeout_retries {
                        return Err(OperationError::TimedOut(timeout));
                    }
                    tracing::warn!(component = "navigation", %resource_id, timeout_ms = timeout.as_millis() as u64, "thread load timed out, retrying");
                    Duration::ZERO
                }
            };

            if self.shared.connection.is_fatal() {
                return Err(OperationError::Rejected(
                    "connection rejected the credential".to_string(),
                ));
            }
            self.shared.mutex.note_retry(SWITCH, resource_id.as_str());

            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(OperationError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    fn finish(
        &self,
        id: u64,
        resource_id: &ResourceId,
        options: SwitchOptions,
        result: Result<ThreadData, OperationError>,
    ) -> Result<ThreadData, OperationError> {
        let mut state = self.state();
        if state.in_flight.as_ref().map(|f| f.id) != Some(id) {
            // Cancelled by `cancel_loading`; that path already reported it.
            tracing::debug!(component = "navigation", %resource_id, ok = result.is_ok(), "discarding result of cancelled switch");
            return Err(OperationError::Cancelled);
        }
        state.in_flight = None;
        state.snapshot.target = None;

        let event = match &result {
            Ok(data) => {
                self.shared.reconciler.seed(resource_id, data.messages.clone());
                state.snapshot.active = Some(resource_id.clone());
                state.snapshot.status = LoadStatus::Loaded;
                state.snapshot.retry_count = 0;
                state.snapshot.last_error = None;
                state.snapshot.last_failed = None;
                tracing::info!(component = "navigation", %resource_id, messages = data.messages.len(), "thread loaded");
                NavigationEvent::Loaded { data: data.clone() }
            }
            Err(OperationError::Cancelled) => {
                state.snapshot.status = LoadStatus::Cancelled;
                NavigationEvent::Cancelled {
                    resource_id: resource_id.clone(),
                }
            }
            Err(error) => {
                state.snapshot.status = LoadStatus::Failed;
                state.snapshot.retry_count += 1;
                state.snapshot.last_error = Some(error.clone());
                state.snapshot.last_failed = Some(resource_id.clone());
                state.last_failed_options = SwitchOptions {
                    force: false,
                    ..options
                };
                tracing::warn!(component = "navigation", %resource_id, %error, "thread switch failed");
                NavigationEvent::Failed {
                    resource_id: resource_id.clone(),
                    error: error.clone(),
                }
            }
        };
        self.publish(&state);
        drop(state);
        self.emit(event);
        result
    }
}

/// Reports a switch that was dropped before resolving (superseded or
/// cancelled through the mutex) and wakes whoever waits on it.
struct SwitchGuard {
    navigator: Navigator,
    id: u64,
    resource_id: ResourceId,
    done: CancellationToken,
    resolved: bool,
}

impl Drop for SwitchGuard {
    fn drop(&mut self) {
        if !self.resolved {
            let mut state = self.navigator.state();
            if state.in_flight.as_ref().map(|f| f.id) == Some(self.id) {
                state.in_flight = None;
                state.snapshot.status = LoadStatus::Cancelled;
                state.snapshot.target = None;
                self.navigator.publish(&state);
                drop(state);
                tracing::debug!(component = "navigation", resource_id = %self.resource_id, "switch dropped before resolving");
                self.navigator.emit(NavigationEvent::Cancelled {
                    resource_id: self.resource_id.clone(),
                });
            }
        }
        self.done.cancel();
    }
}
