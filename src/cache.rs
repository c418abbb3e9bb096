//! Two-tier cache facade.
//!
//! Binds one memory tier and one disk tier to a name and a root directory.
//! Reads consult memory first and promote disk hits; writes and removals go
//! through both tiers, memory first. The facade never holds both tier locks
//! at once.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;

use crate::disk::{DiskCache, DiskConfig};
use crate::host::LifecycleHub;
use crate::memory::{MemoryCache, MemoryConfig};

struct CacheShared {
    name: String,
    path: PathBuf,
    memory: MemoryCache<String, Bytes>,
    disk: Arc<DiskCache>,
}

/// Two-tier key-value cache: a bounded in-memory LRU over a persistent
/// SQLite-backed store.
///
/// Cloning is cheap and yields a handle to the same cache.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<CacheShared>,
}

impl Cache {
    /// Open a cache named `name` under the user's caches directory.
    /// Returns `None` when the backing directory cannot be brought up.
    pub fn open(name: &str) -> Option<Cache> {
        if name.is_empty() {
            return None;
        }
        Self::open_at(default_caches_dir().join(name))
    }

    /// Open a cache rooted at `path`; the cache name is the last path
    /// component.
    pub fn open_at(path: impl Into<PathBuf>) -> Option<Cache> {
        Self::open_with(path, MemoryConfig::default(), DiskConfig::default())
    }

    /// Open a cache rooted at `path` with explicit per-tier configuration.
    pub fn open_with(
        path: impl Into<PathBuf>,
        memory_config: MemoryConfig,
        disk_config: DiskConfig,
    ) -> Option<Cache> {
        let path = path.into();
        let name = path.file_name()?.to_string_lossy().into_owned();
        let disk = DiskCache::open_with_config(&path, disk_config)?;
        let memory = MemoryCache::with_config(memory_config);
        Some(Cache {
            shared: Arc::new(CacheShared {
                name,
                path,
                memory,
                disk,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// The memory tier, for direct inspection and tuning.
    pub fn memory(&self) -> &MemoryCache<String, Bytes> {
        &self.shared.memory
    }

    /// The disk tier, for direct inspection and tuning.
    pub fn disk(&self) -> &Arc<DiskCache> {
        &self.shared.disk
    }

    /// Wire both tiers to the host's lifecycle signals.
    pub fn attach_lifecycle(&self, hub: &LifecycleHub) {
        self.shared.memory.attach_lifecycle(hub);
        self.shared.disk.attach_lifecycle(hub);
    }

    /// Whether either tier holds a value for `key`.
    pub fn contains(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        self.shared.memory.contains(key) || self.shared.disk.contains(key)
    }

    /// Read through both tiers; a disk hit is promoted into memory with
    /// cost equal to its byte length.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        if key.is_empty() {
            return None;
        }
        if let Some(value) = self.shared.memory.get(key) {
            return Some(value);
        }
        let value = self.shared.disk.get(key)?;
        self.shared
            .memory
            .update_with_cost(key.to_string(), value.clone(), value.len() as u64);
        Some(value)
    }

    /// Write through both tiers, memory first. True when the disk tier
    /// accepted the value.
    pub fn set(&self, key: &str, value: Bytes) -> bool {
        if key.is_empty() || value.is_empty() {
            return false;
        }
        self.shared
            .memory
            .update_with_cost(key.to_string(), value.clone(), value.len() as u64);
        self.shared.disk.set(key, value)
    }

    /// Remove `key` from both tiers.
    pub fn remove(&self, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }
        self.shared.memory.remove(key);
        self.shared.disk.remove(key)
    }

    /// Remove every entry from both tiers.
    pub fn remove_all(&self) -> bool {
        self.shared.memory.remove_all();
        self.shared.disk.remove_all()
    }

    // -------------------------------------------------------------------------
    // Completion-based operations, dispatched on the disk tier's workers.
    // -------------------------------------------------------------------------

    pub fn contains_with<F>(&self, key: &str, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        self.shared
            .disk
            .dispatch(move || completion(cache.contains(&key)));
    }

    pub fn get_with<F>(&self, key: &str, completion: F)
    where
        F: FnOnce(Option<Bytes>) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        self.shared
            .disk
            .dispatch(move || completion(cache.get_guarded(&key)));
    }

    pub fn set_with<F>(&self, key: &str, value: Bytes, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        self.shared
            .disk
            .dispatch(move || completion(cache.set(&key, value)));
    }

    pub fn remove_with<F>(&self, key: &str, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = self.clone();
        let key = key.to_string();
        self.shared
            .disk
            .dispatch(move || completion(cache.remove(&key)));
    }

    pub fn remove_all_with<F>(&self, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = self.clone();
        self.shared
            .disk
            .dispatch(move || completion(cache.remove_all()));
    }

    // -------------------------------------------------------------------------
    // Suspendable operations
    // -------------------------------------------------------------------------

    pub async fn get_async(&self, key: &str) -> Option<Bytes> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.get_with(key, move |value| {
            let _ = tx.send(value);
        });
        rx.await.unwrap_or(None)
    }

    pub async fn set_async(&self, key: &str, value: Bytes) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.set_with(key, value, move |stored| {
            let _ = tx.send(stored);
        });
        rx.await.unwrap_or(false)
    }

    pub async fn contains_async(&self, key: &str) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.contains_with(key, move |found| {
            let _ = tx.send(found);
        });
        rx.await.unwrap_or(false)
    }

    pub async fn remove_async(&self, key: &str) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.remove_with(key, move |removed| {
            let _ = tx.send(removed);
        });
        rx.await.unwrap_or(false)
    }

    pub async fn remove_all_async(&self) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.remove_all_with(move |cleared| {
            let _ = tx.send(cleared);
        });
        rx.await.unwrap_or(false)
    }

    /// Read path for completion-based gets: by the time the disk read
    /// finishes, a concurrent writer may have stored a fresher value in
    /// memory, so only promote into a still-vacant slot.
    fn get_guarded(&self, key: &str) -> Option<Bytes> {
        if key.is_empty() {
            return None;
        }
        if let Some(value) = self.shared.memory.get(key) {
            return Some(value);
        }
        let value = self.shared.disk.get(key)?;
        if !self.shared.memory.contains(key) {
            self.shared
                .memory
                .update_with_cost(key.to_string(), value.clone(), value.len() as u64);
        }
        Some(value)
    }
}

/// The platform's per-user caches directory, with a temp-dir fallback.
fn default_caches_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
        return PathBuf::from(dir);
    }
    if let Some(home) = std::env::var_os("HOME") {
        return PathBuf::from(home).join(".cache");
    }
    std::env::temp_dir()
}

// =============================================================================
// Tests
// =============================================================================
