//! Disk tier - persistent key-value store.
//!
//! Composes the SQLite manifest and the blob file store under a single lock.
//! Each entry is placed adaptively: small payloads inline in the manifest
//! row, large ones as an external file the row references. Eviction runs in
//! the background by cost, count, age, and free-disk-space pressure, always
//! against the least recently accessed rows.
//!
//! ```text
//! <root>/
//!   manifest.sqlite[-shm|-wal]   row per entry, WAL mode
//!   data/                        one file per external entry
//!   trash/                       retired blobs, drained asynchronously
//! ```
//!
//! Blocking operations may stall on I/O; every one of them has a completion
//! variant that runs on the tier's worker pool, and an async variant that
//! wraps the completion form in a oneshot channel.

mod blobs;
mod manifest;
mod registry;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::host::{LifecycleEvent, LifecycleHub, NoVolumeStats, VolumeStats};
use crate::workers::{Trimmer, WorkerPool};
use blobs::BlobStore;
use manifest::{unix_time, ManifestStore};

const MANIFEST_FILE: &str = "manifest.sqlite";
/// Eviction candidates are fetched in batches of this many rows.
const TRIM_BATCH: usize = 16;
const WORKER_COUNT: usize = 4;

/// Where entry payloads live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlacementMode {
    /// Inline when at most the threshold, external file above it.
    #[default]
    Mixed,
    /// Everything inline in the manifest.
    SqliteOnly,
    /// Everything in external files.
    FileOnly,
}

impl PlacementMode {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PlacementMode::SqliteOnly,
            2 => PlacementMode::FileOnly,
            _ => PlacementMode::Mixed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            PlacementMode::Mixed => 0,
            PlacementMode::SqliteOnly => 1,
            PlacementMode::FileOnly => 2,
        }
    }
}

/// Construction-time settings for the disk tier. Every field can also be
/// changed after construction through the corresponding setter.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Payloads larger than this go to an external file (Mixed placement).
    pub inline_threshold: usize,
    pub placement: PlacementMode,
    /// Maximum number of entries (soft bound, enforced by trims).
    pub count_limit: u64,
    /// Maximum total payload bytes (soft bound, enforced by trims).
    pub cost_limit: u64,
    /// Maximum time since last access before the trimmer evicts an entry.
    pub age_limit: Duration,
    /// Keep at least this many bytes free on the volume; 0 disables.
    pub free_disk_space_limit: u64,
    /// Background trim cadence.
    pub auto_trim_interval: Duration,
    /// Emit error/debug logs on failed operations.
    pub error_logs_enabled: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            inline_threshold: 20 * 1024,
            placement: PlacementMode::Mixed,
            count_limit: u64::MAX,
            cost_limit: u64::MAX,
            age_limit: Duration::MAX,
            free_disk_space_limit: 0,
            auto_trim_interval: Duration::from_secs(60),
            error_logs_enabled: true,
        }
    }
}

/// A disk entry assembled from its manifest row (and blob, if external).
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub key: String,
    pub value: Bytes,
    pub filename: Option<String>,
    pub size: u64,
    /// Seconds since epoch of the last write.
    pub modification_time: i64,
    /// Seconds since epoch of the last read or write.
    pub last_access_time: i64,
    pub extended_data: Option<Bytes>,
}

struct DiskStore {
    manifest: ManifestStore,
    blobs: BlobStore,
}

impl DiskStore {
    /// Full reset: recreate the database and retire every blob. Used when
    /// the database cannot be opened and by `remove_all`.
    fn reset(&mut self) -> Result<()> {
        self.manifest.close();
        self.manifest.destroy_files()?;
        self.blobs.move_all_to_trash()?;
        self.blobs.empty_trash_in_background();
        self.manifest.reopen()
    }
}

type FileNameHook = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Persistent key-value store with adaptive inline/external placement.
///
/// Obtained through [`DiskCache::open`]; opening the same directory twice
/// yields the same instance (the manifest is single-writer).
pub struct DiskCache {
    root: PathBuf,
    store: Mutex<DiskStore>,
    inline_threshold: AtomicUsize,
    placement: AtomicU8,
    count_limit: AtomicU64,
    cost_limit: AtomicU64,
    age_limit_ms: AtomicU64,
    free_disk_space_limit: AtomicU64,
    auto_trim_interval_ms: Arc<AtomicU64>,
    error_logs_enabled: AtomicBool,
    custom_file_name: Mutex<Option<FileNameHook>>,
    volume: Mutex<Arc<dyn VolumeStats>>,
    pool: WorkerPool,
    closed: AtomicBool,
    trimmer: Mutex<Option<Trimmer>>,
}

impl DiskCache {
    /// Open (creating if necessary) a disk tier rooted at `path` with
    /// default configuration. Returns `None` when the directory or the
    /// manifest database cannot be brought up.
    pub fn open(path: impl AsRef<Path>) -> Option<Arc<DiskCache>> {
        Self::open_with_config(path, DiskConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: DiskConfig) -> Option<Arc<DiskCache>> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return None;
        }
        if let Err(err) = fs::create_dir_all(path) {
            error!("failed to create cache directory {:?}: {}", path, err);
            return None;
        }
        let canonical = match fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(err) => {
                error!("failed to resolve cache directory {:?}: {}", path, err);
                return None;
            }
        };
        registry::open_or_construct(&canonical, || Self::construct(canonical.clone(), config))
    }

    fn construct(root: PathBuf, config: DiskConfig) -> Option<Arc<DiskCache>> {
        let blobs = match BlobStore::open(&root) {
            Ok(blobs) => blobs,
            Err(err) => {
                error!("failed to prepare blob directories under {:?}: {}", root, err);
                return None;
            }
        };

        let db_path = root.join(MANIFEST_FILE);
        let manifest = match ManifestStore::open(db_path.clone()) {
            Ok(manifest) => manifest,
            Err(open_err) => {
                // The database may be corrupt; reset to an empty store:
                // delete the database files, retire every blob they might
                // reference, and open fresh. If that fails too, refuse
                // construction.
                error!(
                    "manifest open failed ({}), resetting store at {:?}",
                    open_err, root
                );
                for suffix in ["", "-shm", "-wal"] {
                    let mut path = db_path.as_os_str().to_owned();
                    path.push(suffix);
                    let _ = fs::remove_file(PathBuf::from(path));
                }
                if let Err(err) = blobs.move_all_to_trash() {
                    error!("store reset failed at {:?}: {}", root, err);
                    return None;
                }
                blobs.empty_trash_in_background();
                match ManifestStore::open(db_path) {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        error!("manifest reopen failed after reset: {}", err);
                        return None;
                    }
                }
            }
        };

        Self::finish_construct(root, config, DiskStore { manifest, blobs })
    }

    fn finish_construct(root: PathBuf, config: DiskConfig, store: DiskStore) -> Option<Arc<DiskCache>> {
        let auto_trim_interval_ms = Arc::new(AtomicU64::new(duration_to_ms(
            config.auto_trim_interval,
        )));

        let cache = Arc::new(DiskCache {
            root,
            store: Mutex::new(store),
            inline_threshold: AtomicUsize::new(config.inline_threshold),
            placement: AtomicU8::new(config.placement.as_u8()),
            count_limit: AtomicU64::new(config.count_limit),
            cost_limit: AtomicU64::new(config.cost_limit),
            age_limit_ms: AtomicU64::new(duration_to_ms(config.age_limit)),
            free_disk_space_limit: AtomicU64::new(config.free_disk_space_limit),
            auto_trim_interval_ms: Arc::clone(&auto_trim_interval_ms),
            error_logs_enabled: AtomicBool::new(config.error_logs_enabled),
            custom_file_name: Mutex::new(None),
            volume: Mutex::new(Arc::new(NoVolumeStats)),
            pool: WorkerPool::new("disk-cache-worker", WORKER_COUNT),
            closed: AtomicBool::new(false),
            trimmer: Mutex::new(None),
        });

        let weak = Arc::downgrade(&cache);
        let trimmer = Trimmer::spawn("disk-cache-trim", auto_trim_interval_ms, move || {
            match weak.upgrade() {
                Some(cache) => {
                    cache.auto_trim();
                    true
                }
                None => false,
            }
        });
        *cache.trimmer.lock() = Some(trimmer);

        Some(cache)
    }

    /// Directory this tier is rooted at.
    pub fn path(&self) -> &Path {
        &self.root
    }

    // -------------------------------------------------------------------------
    // Blocking operations
    // -------------------------------------------------------------------------

    /// Whether a manifest row exists for `key`.
    pub fn contains(&self, key: &str) -> bool {
        if key.is_empty() || self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        match store.manifest.exists(key) {
            Ok(exists) => exists,
            Err(err) => {
                self.log_failure("contains", &err);
                false
            }
        }
    }

    /// Return the payload for `key`, refreshing its access time.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        if key.is_empty() || self.is_closed() {
            return None;
        }
        // SQLite-only stores never have blobs to resolve, so skip straight
        // to the inline column.
        if self.placement() == PlacementMode::SqliteOnly {
            let mut store = self.store.lock();
            return match store.manifest.get_value(key) {
                Ok(Some(data)) => {
                    if let Err(err) = store.manifest.touch(key) {
                        self.log_failure("get/touch", &err);
                    }
                    Some(Bytes::from(data))
                }
                Ok(None) => None,
                Err(err) => {
                    self.log_failure("get", &err);
                    None
                }
            };
        }
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Return the full entry for `key` including extended metadata.
    ///
    /// A row whose external file is missing is deleted on the spot and
    /// reported as absent.
    pub fn get_entry(&self, key: &str) -> Option<DiskEntry> {
        if key.is_empty() || self.is_closed() {
            return None;
        }
        let mut store = self.store.lock();
        let row = match store.manifest.get(key, false) {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(err) => {
                self.log_failure("get", &err);
                return None;
            }
        };

        let value = match &row.filename {
            Some(filename) => match store.blobs.read(filename) {
                Ok(Some(data)) => data,
                Ok(None) | Err(_) => {
                    // Blob lost out from under the manifest; heal the row.
                    debug!("blob {:?} missing for key {:?}, dropping row", filename, key);
                    if let Err(err) = store.manifest.delete(key) {
                        self.log_failure("get/self-heal", &err);
                    }
                    return None;
                }
            },
            None => match row.inline_data {
                Some(data) => data,
                None => {
                    if let Err(err) = store.manifest.delete(key) {
                        self.log_failure("get/self-heal", &err);
                    }
                    return None;
                }
            },
        };

        if let Err(err) = store.manifest.touch(key) {
            self.log_failure("get/touch", &err);
        }

        Some(DiskEntry {
            key: row.key,
            value: Bytes::from(value),
            filename: row.filename,
            size: row.size,
            modification_time: row.modification_time,
            last_access_time: unix_time().max(row.last_access_time),
            extended_data: row.extended_data.map(Bytes::from),
        })
    }

    /// Multi-key read; missing and self-healed keys are simply absent from
    /// the result.
    pub fn get_many(&self, keys: &[String]) -> Vec<DiskEntry> {
        if keys.is_empty() || self.is_closed() {
            return Vec::new();
        }
        let mut store = self.store.lock();
        let rows = match store.manifest.get_many(keys, false) {
            Ok(rows) => rows,
            Err(err) => {
                self.log_failure("get_many", &err);
                return Vec::new();
            }
        };

        let mut entries = Vec::with_capacity(rows.len());
        let mut touched = Vec::with_capacity(rows.len());
        for row in rows {
            let value = match &row.filename {
                Some(filename) => match store.blobs.read(filename) {
                    Ok(Some(data)) => data,
                    Ok(None) | Err(_) => {
                        if let Err(err) = store.manifest.delete(&row.key) {
                            self.log_failure("get_many/self-heal", &err);
                        }
                        continue;
                    }
                },
                None => match row.inline_data {
                    Some(data) => data,
                    None => continue,
                },
            };
            touched.push(row.key.clone());
            entries.push(DiskEntry {
                key: row.key,
                value: Bytes::from(value),
                filename: row.filename,
                size: row.size,
                modification_time: row.modification_time,
                last_access_time: unix_time().max(row.last_access_time),
                extended_data: row.extended_data.map(Bytes::from),
            });
        }

        if let Err(err) = store.manifest.touch_many(&touched) {
            self.log_failure("get_many/touch", &err);
        }
        entries
    }

    /// Store `value` under `key`. Placement (inline vs external file)
    /// follows the configured mode and threshold.
    pub fn set(&self, key: &str, value: Bytes) -> bool {
        self.set_with_extended(key, value, None)
    }

    /// Store `value` under `key` with opaque extended metadata alongside.
    pub fn set_with_extended(&self, key: &str, value: Bytes, extended: Option<Bytes>) -> bool {
        if key.is_empty() || value.is_empty() || self.is_closed() {
            return false;
        }

        let placement = self.placement();
        let external = match placement {
            PlacementMode::SqliteOnly => false,
            PlacementMode::FileOnly => true,
            PlacementMode::Mixed => value.len() > self.inline_threshold.load(Ordering::Relaxed),
        };

        let mut store = self.store.lock();
        if external {
            let filename = self.external_file_name(key);
            // File first: a manifest row must never reference a missing
            // blob. A failed save orphans the file instead, which later
            // trims collect.
            if let Err(err) = store.blobs.write(&filename, &value) {
                self.log_failure("set/blob-write", &err);
                return false;
            }
            match store
                .manifest
                .save(key, &value, Some(&filename), extended.as_deref())
            {
                Ok(()) => true,
                Err(err) => {
                    self.log_failure("set/manifest-save", &err);
                    let _ = store.blobs.delete(&filename);
                    false
                }
            }
        } else {
            if placement != PlacementMode::SqliteOnly {
                // Replacing an external entry inline: drop the old blob
                // before the row stops referencing it.
                match store.manifest.get_filename(key) {
                    Ok(Some(old)) => {
                        if let Err(err) = store.blobs.delete(&old) {
                            self.log_failure("set/old-blob-delete", &err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => self.log_failure("set/old-filename", &err),
                }
            }
            match store.manifest.save(key, &value, None, extended.as_deref()) {
                Ok(()) => true,
                Err(err) => {
                    self.log_failure("set/manifest-save", &err);
                    false
                }
            }
        }
    }

    /// Remove `key` and its blob, if any.
    pub fn remove(&self, key: &str) -> bool {
        if key.is_empty() || self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        if self.placement() != PlacementMode::SqliteOnly {
            match store.manifest.get_filename(key) {
                Ok(Some(filename)) => {
                    if let Err(err) = store.blobs.delete(&filename) {
                        self.log_failure("remove/blob-delete", &err);
                    }
                }
                Ok(None) => {}
                Err(err) => self.log_failure("remove/filename", &err),
            }
        }
        match store.manifest.delete(key) {
            Ok(()) => true,
            Err(err) => {
                self.log_failure("remove", &err);
                false
            }
        }
    }

    /// Remove several keys and their blobs.
    pub fn remove_many(&self, keys: &[String]) -> bool {
        if keys.is_empty() || self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        match store.manifest.get_filenames(keys) {
            Ok(filenames) => {
                for filename in &filenames {
                    if let Err(err) = store.blobs.delete(filename) {
                        self.log_failure("remove_many/blob-delete", &err);
                    }
                }
            }
            Err(err) => self.log_failure("remove_many/filenames", &err),
        }
        match store.manifest.delete_many(keys) {
            Ok(()) => true,
            Err(err) => {
                self.log_failure("remove_many", &err);
                false
            }
        }
    }

    /// Remove every entry: the database is recreated from scratch and all
    /// blobs move to trash, drained in the background.
    pub fn remove_all(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        match store.reset() {
            Ok(()) => true,
            Err(err) => {
                self.log_failure("remove_all", &err);
                false
            }
        }
    }

    /// Remove entries whose payload exceeds `size` bytes.
    pub fn remove_larger_than(&self, size: u64) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        match store.manifest.get_filenames_larger_than(size) {
            Ok(filenames) => {
                for filename in &filenames {
                    if let Err(err) = store.blobs.delete(filename) {
                        self.log_failure("remove_larger_than/blob-delete", &err);
                    }
                }
            }
            Err(err) => self.log_failure("remove_larger_than/filenames", &err),
        }
        let deleted = match store.manifest.delete_larger_than(size) {
            Ok(()) => true,
            Err(err) => {
                self.log_failure("remove_larger_than", &err);
                false
            }
        };
        if deleted {
            let _ = store.manifest.checkpoint();
        }
        deleted
    }

    /// Remove entries last accessed more than `age` ago.
    pub fn remove_older_than(&self, age: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        self.trim_to_age_locked(&mut store, age)
    }

    /// Number of entries. 0 when the manifest is unavailable.
    pub fn total_count(&self) -> u64 {
        if self.is_closed() {
            return 0;
        }
        let mut store = self.store.lock();
        match store.manifest.total_count() {
            Ok(count) => count,
            Err(err) => {
                self.log_failure("total_count", &err);
                0
            }
        }
    }

    /// Total payload bytes. 0 when the manifest is unavailable.
    pub fn total_size(&self) -> u64 {
        if self.is_closed() {
            return 0;
        }
        let mut store = self.store.lock();
        match store.manifest.total_size() {
            Ok(size) => size,
            Err(err) => {
                self.log_failure("total_size", &err);
                0
            }
        }
    }

    /// Evict oldest entries until the total payload size is at most `cost`.
    pub fn trim_to_cost(&self, cost: u64) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        self.trim_to_cost_locked(&mut store, cost)
    }

    /// Evict oldest entries until at most `count` remain.
    pub fn trim_to_count(&self, count: u64) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        self.trim_to_count_locked(&mut store, count)
    }

    /// Evict entries last accessed more than `age` ago. A zero age clears
    /// the store.
    pub fn trim_to_age(&self, age: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut store = self.store.lock();
        self.trim_to_age_locked(&mut store, age)
    }

    /// Close the manifest database. Every subsequent operation fails until
    /// the process ends; invoked on the host's termination signal.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.store.lock().manifest.close();
    }

    /// React to the host's termination signal delivered through `hub`.
    pub fn attach_lifecycle(self: &Arc<Self>, hub: &LifecycleHub) {
        let weak = Arc::downgrade(self);
        hub.subscribe(
            LifecycleEvent::Termination,
            Box::new(move || {
                if let Some(cache) = weak.upgrade() {
                    cache.close();
                }
            }),
        );
    }

    // -------------------------------------------------------------------------
    // Completion-based operations
    //
    // Each dispatches the blocking form onto the tier's worker pool and
    // invokes the callback from the worker.
    // -------------------------------------------------------------------------

    pub fn contains_with<F>(self: &Arc<Self>, key: &str, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = Arc::clone(self);
        let key = key.to_string();
        self.pool.execute(move || completion(cache.contains(&key)));
    }

    pub fn get_with<F>(self: &Arc<Self>, key: &str, completion: F)
    where
        F: FnOnce(Option<Bytes>) + Send + 'static,
    {
        let cache = Arc::clone(self);
        let key = key.to_string();
        self.pool.execute(move || completion(cache.get(&key)));
    }

    pub fn set_with<F>(self: &Arc<Self>, key: &str, value: Bytes, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = Arc::clone(self);
        let key = key.to_string();
        self.pool
            .execute(move || completion(cache.set(&key, value)));
    }

    pub fn remove_with<F>(self: &Arc<Self>, key: &str, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = Arc::clone(self);
        let key = key.to_string();
        self.pool.execute(move || completion(cache.remove(&key)));
    }

    pub fn remove_all_with<F>(self: &Arc<Self>, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = Arc::clone(self);
        self.pool.execute(move || completion(cache.remove_all()));
    }

    pub fn total_count_with<F>(self: &Arc<Self>, completion: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let cache = Arc::clone(self);
        self.pool.execute(move || completion(cache.total_count()));
    }

    pub fn total_size_with<F>(self: &Arc<Self>, completion: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        let cache = Arc::clone(self);
        self.pool.execute(move || completion(cache.total_size()));
    }

    pub fn trim_to_cost_with<F>(self: &Arc<Self>, cost: u64, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = Arc::clone(self);
        self.pool
            .execute(move || completion(cache.trim_to_cost(cost)));
    }

    pub fn trim_to_count_with<F>(self: &Arc<Self>, count: u64, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = Arc::clone(self);
        self.pool
            .execute(move || completion(cache.trim_to_count(count)));
    }

    pub fn trim_to_age_with<F>(self: &Arc<Self>, age: Duration, completion: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let cache = Arc::clone(self);
        self.pool
            .execute(move || completion(cache.trim_to_age(age)));
    }

    // -------------------------------------------------------------------------
    // Suspendable operations: the completion form behind a oneshot channel.
    // -------------------------------------------------------------------------

    pub async fn get_async(self: &Arc<Self>, key: &str) -> Option<Bytes> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.get_with(key, move |value| {
            let _ = tx.send(value);
        });
        rx.await.unwrap_or(None)
    }

    pub async fn set_async(self: &Arc<Self>, key: &str, value: Bytes) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.set_with(key, value, move |stored| {
            let _ = tx.send(stored);
        });
        rx.await.unwrap_or(false)
    }

    pub async fn contains_async(self: &Arc<Self>, key: &str) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.contains_with(key, move |found| {
            let _ = tx.send(found);
        });
        rx.await.unwrap_or(false)
    }

    pub async fn remove_async(self: &Arc<Self>, key: &str) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.remove_with(key, move |removed| {
            let _ = tx.send(removed);
        });
        rx.await.unwrap_or(false)
    }

    pub async fn remove_all_async(self: &Arc<Self>) -> bool {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.remove_all_with(move |cleared| {
            let _ = tx.send(cleared);
        });
        rx.await.unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    pub fn inline_threshold(&self) -> usize {
        self.inline_threshold.load(Ordering::Relaxed)
    }

    pub fn set_inline_threshold(&self, threshold: usize) {
        self.inline_threshold.store(threshold, Ordering::Relaxed);
    }

    pub fn placement(&self) -> PlacementMode {
        PlacementMode::from_u8(self.placement.load(Ordering::Relaxed))
    }

    pub fn set_placement(&self, mode: PlacementMode) {
        self.placement.store(mode.as_u8(), Ordering::Relaxed);
    }

    pub fn count_limit(&self) -> u64 {
        self.count_limit.load(Ordering::Relaxed)
    }

    pub fn set_count_limit(&self, limit: u64) {
        self.count_limit.store(limit, Ordering::Relaxed);
    }

    pub fn cost_limit(&self) -> u64 {
        self.cost_limit.load(Ordering::Relaxed)
    }

    pub fn set_cost_limit(&self, limit: u64) {
        self.cost_limit.store(limit, Ordering::Relaxed);
    }

    pub fn age_limit(&self) -> Duration {
        ms_to_duration(self.age_limit_ms.load(Ordering::Relaxed))
    }

    pub fn set_age_limit(&self, age: Duration) {
        self.age_limit_ms
            .store(duration_to_ms(age), Ordering::Relaxed);
    }

    pub fn free_disk_space_limit(&self) -> u64 {
        self.free_disk_space_limit.load(Ordering::Relaxed)
    }

    pub fn set_free_disk_space_limit(&self, limit: u64) {
        self.free_disk_space_limit.store(limit, Ordering::Relaxed);
    }

    pub fn auto_trim_interval(&self) -> Duration {
        ms_to_duration(self.auto_trim_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the background trim cadence; takes effect at the next tick.
    pub fn set_auto_trim_interval(&self, interval: Duration) {
        self.auto_trim_interval_ms
            .store(duration_to_ms(interval), Ordering::Relaxed);
    }

    pub fn set_error_logs_enabled(&self, enabled: bool) {
        self.error_logs_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Override the external-file namer. The hook may decline a key by
    /// returning `None`, falling back to the default SHA-256 name.
    pub fn set_custom_file_name<F>(&self, hook: F)
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        *self.custom_file_name.lock() = Some(Arc::new(hook));
    }

    /// Inject the host's volume capacity query for free-disk trimming.
    pub fn set_volume_stats<V>(&self, volume: V)
    where
        V: VolumeStats + 'static,
    {
        *self.volume.lock() = Arc::new(volume);
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Run a job on the tier's worker pool. The facade routes its own
    /// completion-based operations through here.
    pub(crate) fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.execute(job);
    }

    fn external_file_name(&self, key: &str) -> String {
        let hook = self.custom_file_name.lock().clone();
        if let Some(hook) = hook {
            if let Some(name) = hook(key) {
                return name;
            }
        }
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// One background pass: cost, count, age, then free-disk, all under a
    /// single lock acquisition.
    fn auto_trim(&self) {
        if self.is_closed() {
            return;
        }
        let mut store = self.store.lock();
        let cost_limit = self.cost_limit.load(Ordering::Relaxed);
        if cost_limit < u64::MAX {
            self.trim_to_cost_locked(&mut store, cost_limit);
        }
        let count_limit = self.count_limit.load(Ordering::Relaxed);
        if count_limit < u64::MAX {
            self.trim_to_count_locked(&mut store, count_limit);
        }
        let age_ms = self.age_limit_ms.load(Ordering::Relaxed);
        if age_ms < u64::MAX {
            self.trim_to_age_locked(&mut store, ms_to_duration(age_ms));
        }
        self.trim_to_free_disk_space_locked(&mut store);
    }

    fn trim_to_cost_locked(&self, store: &mut DiskStore, limit: u64) -> bool {
        let mut total = match store.manifest.total_size() {
            Ok(total) => total,
            Err(err) => {
                self.log_failure("trim_to_cost", &err);
                return false;
            }
        };
        if total <= limit {
            return true;
        }

        let mut ok = true;
        'sweep: while total > limit {
            let batch = match store.manifest.list_size_info_oldest_first(TRIM_BATCH) {
                Ok(batch) => batch,
                Err(err) => {
                    self.log_failure("trim_to_cost", &err);
                    ok = false;
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            for info in &batch {
                if total <= limit {
                    break 'sweep;
                }
                if !self.evict_row(store, info) {
                    ok = false;
                    break 'sweep;
                }
                total = total.saturating_sub(info.size);
            }
        }

        if ok {
            let _ = store.manifest.checkpoint();
        }
        ok
    }

    fn trim_to_count_locked(&self, store: &mut DiskStore, limit: u64) -> bool {
        let mut total = match store.manifest.total_count() {
            Ok(total) => total,
            Err(err) => {
                self.log_failure("trim_to_count", &err);
                return false;
            }
        };
        if total <= limit {
            return true;
        }

        let mut ok = true;
        'sweep: while total > limit {
            let batch = match store.manifest.list_size_info_oldest_first(TRIM_BATCH) {
                Ok(batch) => batch,
                Err(err) => {
                    self.log_failure("trim_to_count", &err);
                    ok = false;
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            for info in &batch {
                if total <= limit {
                    break 'sweep;
                }
                if !self.evict_row(store, info) {
                    ok = false;
                    break 'sweep;
                }
                total = total.saturating_sub(1);
            }
        }

        if ok {
            let _ = store.manifest.checkpoint();
        }
        ok
    }

    fn trim_to_age_locked(&self, store: &mut DiskStore, age: Duration) -> bool {
        if age.is_zero() {
            return match store.reset() {
                Ok(()) => true,
                Err(err) => {
                    self.log_failure("trim_to_age", &err);
                    false
                }
            };
        }
        let age_secs = i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = unix_time().saturating_sub(age_secs);
        if cutoff <= 0 {
            return true;
        }

        match store.manifest.get_filenames_older_than(cutoff) {
            Ok(filenames) => {
                for filename in &filenames {
                    if let Err(err) = store.blobs.delete(filename) {
                        self.log_failure("trim_to_age/blob-delete", &err);
                    }
                }
            }
            Err(err) => {
                self.log_failure("trim_to_age/filenames", &err);
                return false;
            }
        }
        match store.manifest.delete_older_than(cutoff) {
            Ok(()) => {
                let _ = store.manifest.checkpoint();
                true
            }
            Err(err) => {
                self.log_failure("trim_to_age", &err);
                false
            }
        }
    }

    /// When the volume runs short of the configured headroom, shrink the
    /// store by the shortfall.
    fn trim_to_free_disk_space_locked(&self, store: &mut DiskStore) -> bool {
        let limit = self.free_disk_space_limit.load(Ordering::Relaxed);
        if limit == 0 {
            return true;
        }
        let volume = self.volume.lock().clone();
        let free = match volume.available_space(&self.root) {
            Some(free) => free,
            None => return true,
        };
        if free >= limit {
            return true;
        }
        let needed = limit - free;
        let total = match store.manifest.total_size() {
            Ok(total) => total,
            Err(err) => {
                self.log_failure("trim_to_free_disk_space", &err);
                return false;
            }
        };
        self.trim_to_cost_locked(store, total.saturating_sub(needed))
    }

    /// Drop one eviction candidate: its blob first, then its row.
    fn evict_row(&self, store: &mut DiskStore, info: &manifest::SizeInfo) -> bool {
        if let Some(filename) = &info.filename {
            if let Err(err) = store.blobs.delete(filename) {
                self.log_failure("evict/blob-delete", &err);
                return false;
            }
        }
        if let Err(err) = store.manifest.delete(&info.key) {
            self.log_failure("evict", &err);
            return false;
        }
        true
    }

    fn log_failure(&self, op: &str, err: &Error) {
        if self.error_logs_enabled.load(Ordering::Relaxed) {
            debug!("disk cache {} failed: {}", op, err);
        }
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn ms_to_duration(ms: u64) -> Duration {
    if ms == u64::MAX {
        Duration::MAX
    } else {
        Duration::from_millis(ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
