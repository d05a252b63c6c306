//! Per-resource operation mutex.
//!
//! At most one operation runs per `(op_type, key)`. A second start on a busy
//! key is refused with [`OperationError::AlreadyInProgress`] unless forced,
//! in which case the running operation is cancelled and has resolved before
//! the new executor starts.

use crate::error::OperationError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub op_type: String,
    pub key: String,
}

impl OperationKey {
    pub fn new(op_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            op_type: op_type.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Cancel and replace an operation already running on the key.
    pub force: bool,
}

impl StartOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

/// Read-only view of a running operation.
#[derive(Debug, Clone)]
pub struct OperationInfo {
    pub key: OperationKey,
    pub started_at: Instant,
    pub retries: u32,
}

struct Entry {
    id: u64,
    cancel: CancellationToken,
    /// Fired once the owning `start` call has resolved or been dropped.
    finished: CancellationToken,
    started_at: Instant,
    retries: u32,
}

#[derive(Default)]
struct Inner {
    active: Mutex<HashMap<OperationKey, Entry>>,
    next_id: AtomicU64,
}

impl Inner {
    fn active(&self) -> MutexGuard<'_, HashMap<OperationKey, Entry>> {
        // A poisoned map is still structurally valid.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cheap to clone; clones share the same set of active operations.
#[derive(Clone, Default)]
pub struct OperationMutex {
    inner: Arc<Inner>,
}

impl OperationMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `executor` while holding `(op_type, key)`.
    ///
    /// The executor receives a cancellation token it should check at its
    /// suspension points. Cancellation also wins the race against the
    /// executor, so a cancelled operation always resolves as
    /// [`OperationError::Cancelled`] even if the executor ignores the token.
    /// The key is released when this call resolves or is dropped.
    pub async fn start<T, F, Fut>(
        &self,
        op_type: &str,
        key: &str,
        options: StartOptions,
        executor: F,
    ) -> Result<T, OperationError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let op_key = OperationKey::new(op_type, key);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let superseded = {
            let mut active = self.inner.active();
            let superseded = match active.get(&op_key) {
                Some(_) if !options.force => {
                    tracing::debug!(component = "lock", op_type, key, "operation already in progress");
                    return Err(OperationError::AlreadyInProgress {
                        op_type: op_type.to_string(),
                        key: key.to_string(),
                    });
                }
                Some(existing) => {
                    tracing::info!(component = "lock", op_type, key, "superseding running operation");
                    existing.cancel.cancel();
                    Some(existing.finished.clone())
                }
                None => None,
            };
            active.insert(
                op_key.clone(),
                Entry {
                    id,
                    cancel: cancel.clone(),
                    finished: finished.clone(),
                    started_at: Instant::now(),
                    retries: 0,
                },
            );
            superseded
        };

        let _guard = ActiveGuard {
            inner: self.inner.clone(),
            key: op_key,
            id,
            finished,
        };

        if let Some(previous) = superseded {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OperationError::Cancelled),
                _ = previous.cancelled() => {}
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OperationError::Cancelled),
            result = executor(cancel.clone()) => result,
        }
    }

    /// Cancel the operation on a key and release the key immediately.
    ///
    /// Returns false if nothing was running.
    pub fn cancel(&self, op_type: &str, key: &str) -> bool {
        let removed = self.inner.active().remove(&OperationKey::new(op_type, key));
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether an operation of `op_type` is running, on `key` if given or on
    /// any key otherwise.
    pub fn is_in_progress(&self, op_type: &str, key: Option<&str>) -> bool {
        let active = self.inner.active();
        match key {
            Some(key) => active.contains_key(&OperationKey::new(op_type, key)),
            None => active.keys().any(|k| k.op_type == op_type),
        }
    }

    pub fn info(&self, op_type: &str, key: &str) -> Option<OperationInfo> {
        let op_key = OperationKey::new(op_type, key);
        self.inner.active().get(&op_key).map(|entry| OperationInfo {
            key: op_key.clone(),
            started_at: entry.started_at,
            retries: entry.retries,
        })
    }

    /// Record a retry on a running operation; returns the new count.
    pub fn note_retry(&self, op_type: &str, key: &str) -> Option<u32> {
        let mut active = self.inner.active();
        let entry = active.get_mut(&OperationKey::new(op_type, key))?;
        entry.retries += 1;
        Some(entry.retries)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active().len()
    }

    /// Cancel everything and forget all tracked operations.
    pub fn clear_history(&self) {
        let drained: Vec<Entry> = self.inner.active().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.cancel.cancel();
        }
    }
}

struct ActiveGuard {
    inner: Arc<Inner>,
    key: OperationKey,
    id: u64,
    finished: CancellationToken,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let mut active = self.inner.active();
        // Only evict our own entry; a forced successor may own the key now.
        if active.get(&self.key).is_some_and(|e| e.id == self.id) {
            active.remove(&self.key);
        }
        drop(active);
        self.finished.cancel();
    }
}
