//! Persisted key-value storage for the credential.
//!
//! Each store handle has an origin id. Change events carry the origin of the
//! handle that made the write, so a subscriber can tell its own writes apart
//! from changes made elsewhere (another window, another process).

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

static NEXT_ORIGIN: AtomicU64 = AtomicU64::new(1);

fn next_origin() -> u64 {
    NEXT_ORIGIN.fetch_add(1, Ordering::Relaxed)
}

/// A change to one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// New value, or `None` if the key was removed.
    pub value: Option<String>,
    /// Origin id of the handle that made the change.
    pub origin: u64,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Stream of changes, including this handle's own.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;

    /// Origin id stamped on this handle's writes.
    fn origin(&self) -> u64;
}

struct MemoryShared {
    data: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

/// In-memory store. [`MemoryStore::handle`] opens another handle onto the
/// same data with its own origin, which is how tests model a second window.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<MemoryShared>,
    origin: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(MemoryShared {
                data: Mutex::new(HashMap::new()),
                events,
            }),
            origin: next_origin(),
        }
    }

    /// Another handle onto the same data.
    pub fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            origin: next_origin(),
        }
    }

    fn data(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.shared.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, key: &str, value: Option<String>) {
        // No receivers is fine.
        let _ = self.shared.events.send(StorageEvent {
            key: key.to_string(),
            value,
            origin: self.origin,
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.data().insert(key.to_string(), value.to_string());
        self.publish(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let removed = self.data().remove(key);
        if removed.is_some() {
            self.publish(key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.shared.events.subscribe()
    }

    fn origin(&self) -> u64 {
        self.origin
    }
}

/// JSON file store. Survives restarts; only reports its own writes.
pub struct FileStore {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<StorageEvent>,
    origin: u64,
}

impl FileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: tokio::sync::Mutex::new(()),
            events,
            origin: next_origin(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, data: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(data)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    fn publish(&self, key: &str, value: Option<String>) {
        let _ = self.events.send(StorageEvent {
            key: key.to_string(),
            value,
            origin: self.origin,
        });
    }
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.read_all().await?;
        data.insert(key.to_string(), value.to_string());
        self.write_all(&data).await?;
        self.publish(key, Some(value.to_string()));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.read_all().await?;
        if data.remove(key).is_some() {
            self.write_all(&data).await?;
            self.publish(key, None);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn origin(&self) -> u64 {
        self.origin
    }
}
