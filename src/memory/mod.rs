//! Memory tier - bounded in-memory LRU cache.
//!
//! Wraps the arena LRU list with cost/count/age accounting, a background
//! trimmer, and host-lifecycle reactions. All operations serialize on the
//! tier's own mutex; the trim loops take it one victim at a time so client
//! calls interleave with eviction instead of stalling behind it.
//!
//! # Bounds
//!
//! Bounds are soft: a cost overflow dispatches a single asynchronous trim
//! to the tier's worker, a count overflow evicts the current tail
//! synchronously on the next insert, and the age limit is enforced by the
//! periodic trimmer.

mod lru;

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::host::{LifecycleEvent, LifecycleHub};
use crate::workers::{Trimmer, WorkerPool};
use lru::LruList;

/// Pause between contended iterations of a trim loop.
const TRIM_RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Construction-time settings for the memory tier. Every field can also be
/// changed after construction through the corresponding setter.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Maximum number of resident entries (soft bound).
    pub count_limit: usize,
    /// Maximum total cost of resident entries (soft bound).
    pub cost_limit: u64,
    /// Maximum time since last access before the trimmer evicts an entry.
    pub age_limit: Duration,
    /// Background trim cadence.
    pub auto_trim_interval: Duration,
    /// Empty the tier when the host reports memory pressure.
    pub evict_all_on_memory_pressure: bool,
    /// Empty the tier when the application enters the background.
    pub evict_all_on_background_entry: bool,
    /// Drop evicted values on a background worker instead of inline.
    pub release_asynchronously: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            count_limit: usize::MAX,
            cost_limit: u64::MAX,
            age_limit: Duration::MAX,
            auto_trim_interval: Duration::from_secs(5),
            evict_all_on_memory_pressure: true,
            evict_all_on_background_entry: true,
            release_asynchronously: true,
        }
    }
}

struct MemoryInner<K, V> {
    list: Mutex<LruList<K, V>>,
    count_limit: AtomicUsize,
    cost_limit: AtomicU64,
    age_limit_ms: AtomicU64,
    auto_trim_interval_ms: Arc<AtomicU64>,
    evict_all_on_memory_pressure: AtomicBool,
    evict_all_on_background_entry: AtomicBool,
    release_asynchronously: AtomicBool,
    pressure_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    /// Destructors for evicted values run here when releasing asynchronously.
    release_worker: WorkerPool,
    /// Runs the single dispatched cost trim after an over-limit insert.
    trim_worker: WorkerPool,
}

/// Fast bounded in-memory LRU cache, generic over key and value.
///
/// Values are cheap to return when `V` is a handle type (`Bytes`, `Arc<T>`);
/// `get` clones the stored value.
pub struct MemoryCache<K, V> {
    inner: Arc<MemoryInner<K, V>>,
    _trimmer: Trimmer,
}

impl<K, V> MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::with_config(MemoryConfig::default())
    }

    pub fn with_config(config: MemoryConfig) -> Self {
        let inner = Arc::new(MemoryInner {
            list: Mutex::new(LruList::new()),
            count_limit: AtomicUsize::new(config.count_limit),
            cost_limit: AtomicU64::new(config.cost_limit),
            age_limit_ms: AtomicU64::new(duration_to_ms(config.age_limit)),
            auto_trim_interval_ms: Arc::new(AtomicU64::new(duration_to_ms(
                config.auto_trim_interval,
            ))),
            evict_all_on_memory_pressure: AtomicBool::new(config.evict_all_on_memory_pressure),
            evict_all_on_background_entry: AtomicBool::new(config.evict_all_on_background_entry),
            release_asynchronously: AtomicBool::new(config.release_asynchronously),
            pressure_hook: Mutex::new(None),
            release_worker: WorkerPool::new("memory-cache-release", 1),
            trim_worker: WorkerPool::new("memory-cache-trim-queue", 1),
        });

        let weak = Arc::downgrade(&inner);
        let trimmer = Trimmer::spawn(
            "memory-cache-trim",
            Arc::clone(&inner.auto_trim_interval_ms),
            move || match weak.upgrade() {
                Some(inner) => {
                    inner.auto_trim();
                    true
                }
                None => false,
            },
        );

        Self {
            inner,
            _trimmer: trimmer,
        }
    }

    /// Whether a value is associated with `key`.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.list.lock().handle_of(key).is_some()
    }

    /// Return the value for `key`, refreshing its recency.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut list = self.inner.list.lock();
        let handle = list.handle_of(key)?;
        list.node_mut(handle).accessed_at = Instant::now();
        list.move_to_head(handle);
        Some(list.node(handle).value.clone())
    }

    /// Insert or replace `key` with cost 0.
    pub fn update(&self, key: K, value: V) {
        self.update_with_cost(key, value, 0);
    }

    /// Insert or replace `key`, accounting `cost` against the cost limit.
    pub fn update_with_cost(&self, key: K, value: V, cost: u64) {
        let mut replaced = None;
        let mut evicted = None;
        let over_cost;
        {
            let mut list = self.inner.list.lock();
            match list.handle_of(&key) {
                Some(handle) => {
                    replaced = Some(list.replace(handle, value, cost));
                    list.move_to_head(handle);
                }
                None => {
                    list.insert_at_head(key, value, cost);
                    if list.len() > self.inner.count_limit.load(Ordering::Relaxed) {
                        evicted = list.remove_tail();
                    }
                }
            }
            over_cost = list.total_cost() > self.inner.cost_limit.load(Ordering::Relaxed);
        }

        if over_cost {
            let weak = Arc::downgrade(&self.inner);
            self.inner.trim_worker.execute(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.trim_to_cost(inner.cost_limit.load(Ordering::Relaxed));
                }
            });
        }
        if let Some(value) = replaced {
            self.inner.release(value);
        }
        if let Some(node) = evicted {
            self.inner.release(node);
        }
    }

    /// Remove `key` if present.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let doomed = {
            let mut list = self.inner.list.lock();
            list.handle_of(key).map(|handle| list.remove(handle))
        };
        if let Some(node) = doomed {
            self.inner.release(node);
        }
    }

    /// Remove every entry.
    pub fn remove_all(&self) {
        self.inner.remove_all_now();
    }

    /// Number of resident entries.
    pub fn count(&self) -> usize {
        self.inner.list.lock().len()
    }

    /// Total cost of resident entries.
    pub fn cost(&self) -> u64 {
        self.inner.list.lock().total_cost()
    }

    /// Evict from the tail until at most `count` entries remain.
    pub fn trim_to_count(&self, count: usize) {
        self.inner.trim_to_count(count);
    }

    /// Evict from the tail until the total cost is at most `cost`.
    pub fn trim_to_cost(&self, cost: u64) {
        self.inner.trim_to_cost(cost);
    }

    /// Evict entries not accessed within `age`.
    pub fn trim_older_than(&self, age: Duration) {
        self.inner.trim_older_than(age);
    }

    /// React to host-lifecycle signals delivered through `hub`.
    pub fn attach_lifecycle(&self, hub: &LifecycleHub) {
        let weak = Arc::downgrade(&self.inner);
        hub.subscribe(
            LifecycleEvent::MemoryPressure,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    let hook = inner.pressure_hook.lock().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                    if inner.evict_all_on_memory_pressure.load(Ordering::Relaxed) {
                        inner.remove_all_now();
                    }
                }
            }),
        );
        let weak = Arc::downgrade(&self.inner);
        hub.subscribe(
            LifecycleEvent::BackgroundEntry,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    if inner.evict_all_on_background_entry.load(Ordering::Relaxed) {
                        inner.remove_all_now();
                    }
                }
            }),
        );
    }

    /// Hook invoked on the memory-pressure signal, before any eviction.
    pub fn set_memory_pressure_hook<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.inner.pressure_hook.lock() = Some(Arc::new(hook));
    }

    pub fn count_limit(&self) -> usize {
        self.inner.count_limit.load(Ordering::Relaxed)
    }

    pub fn set_count_limit(&self, limit: usize) {
        self.inner.count_limit.store(limit, Ordering::Relaxed);
    }

    pub fn cost_limit(&self) -> u64 {
        self.inner.cost_limit.load(Ordering::Relaxed)
    }

    pub fn set_cost_limit(&self, limit: u64) {
        self.inner.cost_limit.store(limit, Ordering::Relaxed);
    }

    pub fn age_limit(&self) -> Duration {
        ms_to_duration(self.inner.age_limit_ms.load(Ordering::Relaxed))
    }

    pub fn set_age_limit(&self, age: Duration) {
        self.inner
            .age_limit_ms
            .store(duration_to_ms(age), Ordering::Relaxed);
    }

    pub fn auto_trim_interval(&self) -> Duration {
        ms_to_duration(self.inner.auto_trim_interval_ms.load(Ordering::Relaxed))
    }

    /// Change the background trim cadence; takes effect at the next tick.
    pub fn set_auto_trim_interval(&self, interval: Duration) {
        self.inner
            .auto_trim_interval_ms
            .store(duration_to_ms(interval), Ordering::Relaxed);
    }

    pub fn set_evict_all_on_memory_pressure(&self, enabled: bool) {
        self.inner
            .evict_all_on_memory_pressure
            .store(enabled, Ordering::Relaxed);
    }

    pub fn set_evict_all_on_background_entry(&self, enabled: bool) {
        self.inner
            .evict_all_on_background_entry
            .store(enabled, Ordering::Relaxed);
    }

    pub fn set_release_asynchronously(&self, enabled: bool) {
        self.inner
            .release_asynchronously
            .store(enabled, Ordering::Relaxed);
    }
}

impl<K, V> Default for MemoryCache<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MemoryInner<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    /// One background pass: cost, then count, then age.
    fn auto_trim(&self) {
        let cost_limit = self.cost_limit.load(Ordering::Relaxed);
        if cost_limit < u64::MAX {
            self.trim_to_cost(cost_limit);
        }
        let count_limit = self.count_limit.load(Ordering::Relaxed);
        if count_limit < usize::MAX {
            self.trim_to_count(count_limit);
        }
        let age_ms = self.age_limit_ms.load(Ordering::Relaxed);
        if age_ms < u64::MAX {
            self.trim_older_than(ms_to_duration(age_ms));
        }
    }

    // The trim loops take the lock once per victim and release it between
    // iterations, so concurrent reads and writes never stall behind a long
    // eviction sweep.

    fn trim_to_cost(&self, limit: u64) {
        let mut doomed = Vec::new();
        loop {
            match self.list.try_lock() {
                Some(mut list) => {
                    if list.total_cost() <= limit {
                        break;
                    }
                    match list.remove_tail() {
                        Some(node) => doomed.push(node),
                        None => break,
                    }
                }
                None => thread::sleep(TRIM_RETRY_PAUSE),
            }
        }
        if !doomed.is_empty() {
            self.release(doomed);
        }
    }

    fn trim_to_count(&self, limit: usize) {
        let mut doomed = Vec::new();
        loop {
            match self.list.try_lock() {
                Some(mut list) => {
                    if list.len() <= limit {
                        break;
                    }
                    match list.remove_tail() {
                        Some(node) => doomed.push(node),
                        None => break,
                    }
                }
                None => thread::sleep(TRIM_RETRY_PAUSE),
            }
        }
        if !doomed.is_empty() {
            self.release(doomed);
        }
    }

    fn trim_older_than(&self, age: Duration) {
        let mut doomed = Vec::new();
        loop {
            match self.list.try_lock() {
                Some(mut list) => {
                    let expired = match list.tail_node() {
                        Some(tail) => tail.accessed_at.elapsed() > age,
                        None => false,
                    };
                    if !expired {
                        break;
                    }
                    if let Some(node) = list.remove_tail() {
                        doomed.push(node);
                    }
                }
                None => thread::sleep(TRIM_RETRY_PAUSE),
            }
        }
        if !doomed.is_empty() {
            self.release(doomed);
        }
    }

    fn remove_all_now(&self) {
        let drained = self.list.lock().remove_all();
        self.release(drained);
    }

    /// Drop `doomed` off the critical path when configured to.
    fn release<T: Send + 'static>(&self, doomed: T) {
        if self.release_asynchronously.load(Ordering::Relaxed) {
            self.release_worker.execute(move || drop(doomed));
        } else {
            drop(doomed);
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

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_update_get_roundtrip() {
        let cache: MemoryCache<String, String> = MemoryCache::new();

        cache.update("k".to_string(), "hello".to_string());
        assert_eq!(cache.get(&"k".to_string()), Some("hello".to_string()));
        assert!(cache.contains(&"k".to_string()));
        assert!(!cache.contains(&"missing".to_string()));
        assert_eq!(cache.get(&"missing".to_string()), None);
    }

    #[test]
    fn test_count_and_cost_track_live_set_exactly() {
        let cache: MemoryCache<u32, u32> = MemoryCache::new();

        for i in 0..10 {
            cache.update_with_cost(i, i, u64::from(i));
            assert_eq!(cache.count(), (i + 1) as usize);
        }
        assert_eq!(cache.cost(), (0..10).sum::<u64>());

        cache.remove(&3);
        assert_eq!(cache.count(), 9);
        assert_eq!(cache.cost(), (0..10).sum::<u64>() - 3);

        cache.remove_all();
        assert_eq!(cache.count(), 0);
        assert_eq!(cache.cost(), 0);
    }

    #[test]
    fn test_update_replaces_value_and_cost() {
        let cache: MemoryCache<&str, &str> = MemoryCache::new();

        cache.update_with_cost("k", "old", 100);
        cache.update_with_cost("k", "new", 7);

        assert_eq!(cache.count(), 1);
        assert_eq!(cache.cost(), 7);
        assert_eq!(cache.get(&"k"), Some("new"));
    }

    #[test]
    fn test_count_limit_evicts_lru_on_insert() {
        let cache: MemoryCache<String, u32> = MemoryCache::with_config(MemoryConfig {
            count_limit: 3,
            ..MemoryConfig::default()
        });

        for (i, key) in ["1", "2", "3", "4"].iter().enumerate() {
            cache.update(key.to_string(), i as u32);
        }

        assert_eq!(cache.count(), 3);
        assert!(!cache.contains(&"1".to_string()));
        for key in ["2", "3", "4"] {
            assert!(cache.contains(&key.to_string()), "{} should survive", key);
        }
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache: MemoryCache<&str, u32> = MemoryCache::with_config(MemoryConfig {
            count_limit: 3,
            ..MemoryConfig::default()
        });

        cache.update("a", 1);
        cache.update("b", 2);
        cache.update("c", 3);

        // "a" becomes most recently used, so "b" is the next victim.
        cache.get(&"a");
        cache.update("d", 4);

        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
    }

    #[test]
    fn test_cost_limit_trims_asynchronously() {
        let cache: MemoryCache<u32, u32> = MemoryCache::with_config(MemoryConfig {
            cost_limit: 100,
            ..MemoryConfig::default()
        });

        for i in 0..10 {
            cache.update_with_cost(i, i, 30);
        }

        assert!(
            wait_until(|| cache.cost() <= 100),
            "cost should converge below the limit, still {}",
            cache.cost()
        );
        // The surviving entries are the most recently inserted ones.
        assert!(cache.contains(&9));
    }

    #[test]
    fn test_explicit_trims() {
        let cache: MemoryCache<u32, u32> = MemoryCache::new();
        for i in 0..8 {
            cache.update_with_cost(i, i, 10);
        }

        cache.trim_to_count(5);
        assert_eq!(cache.count(), 5);
        assert!(!cache.contains(&0));
        assert!(cache.contains(&7));

        cache.trim_to_cost(20);
        assert_eq!(cache.count(), 2);
        assert_eq!(cache.cost(), 20);

        thread::sleep(Duration::from_millis(5));
        cache.trim_older_than(Duration::ZERO);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_trim_older_than_spares_fresh_entries() {
        let cache: MemoryCache<&str, u32> = MemoryCache::new();
        cache.update("stale", 1);
        thread::sleep(Duration::from_millis(80));
        cache.update("fresh", 2);

        cache.trim_older_than(Duration::from_millis(40));

        assert!(cache.contains(&"fresh"));
        assert!(!cache.contains(&"stale"));
    }

    #[test]
    fn test_background_trimmer_enforces_age_limit() {
        let cache: MemoryCache<&str, u32> = MemoryCache::with_config(MemoryConfig {
            age_limit: Duration::from_millis(50),
            auto_trim_interval: Duration::from_millis(20),
            ..MemoryConfig::default()
        });

        cache.update("k", 1);
        assert!(wait_until(|| cache.count() == 0));
    }

    #[test]
    fn test_synchronous_release_mode() {
        let cache: MemoryCache<&str, Vec<u8>> = MemoryCache::with_config(MemoryConfig {
            release_asynchronously: false,
            ..MemoryConfig::default()
        });

        cache.update("k", vec![0u8; 1024]);
        cache.remove(&"k");
        cache.update("k", vec![1u8; 16]);
        cache.remove_all();
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_memory_pressure_signal() {
        let hub = LifecycleHub::new();
        let cache: MemoryCache<&str, u32> = MemoryCache::new();
        cache.attach_lifecycle(&hub);

        let hook_fired = Arc::new(AtomicBool::new(false));
        {
            let hook_fired = Arc::clone(&hook_fired);
            cache.set_memory_pressure_hook(move || {
                hook_fired.store(true, Ordering::Relaxed);
            });
        }

        cache.update("k", 1);
        hub.notify(LifecycleEvent::MemoryPressure);

        assert!(hook_fired.load(Ordering::Relaxed));
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_memory_pressure_eviction_can_be_disabled() {
        let hub = LifecycleHub::new();
        let cache: MemoryCache<&str, u32> = MemoryCache::new();
        cache.attach_lifecycle(&hub);
        cache.set_evict_all_on_memory_pressure(false);

        cache.update("k", 1);
        hub.notify(LifecycleEvent::MemoryPressure);
        assert_eq!(cache.count(), 1);
    }

    #[test]
    fn test_background_entry_signal() {
        let hub = LifecycleHub::new();
        let cache: MemoryCache<&str, u32> = MemoryCache::new();
        cache.attach_lifecycle(&hub);

        cache.update("k", 1);
        hub.notify(LifecycleEvent::BackgroundEntry);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn test_runtime_tunable_updates() {
        let cache: MemoryCache<&str, u32> = MemoryCache::new();
        assert_eq!(cache.count_limit(), usize::MAX);

        cache.set_count_limit(2);
        cache.set_cost_limit(1000);
        cache.set_age_limit(Duration::from_secs(60));
        cache.set_auto_trim_interval(Duration::from_millis(250));

        assert_eq!(cache.count_limit(), 2);
        assert_eq!(cache.cost_limit(), 1000);
        assert_eq!(cache.age_limit(), Duration::from_secs(60));
        assert_eq!(cache.auto_trim_interval(), Duration::from_millis(250));

        cache.update("a", 1);
        cache.update("b", 2);
        cache.update("c", 3);
        assert_eq!(cache.count(), 2);
    }

    #[test]
    fn test_concurrent_mixed_operations() {
        let cache = Arc::new(MemoryCache::<u32, u32>::with_config(MemoryConfig {
            count_limit: 64,
            ..MemoryConfig::default()
        }));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500u32 {
                        let key = (t * 1000 + i) % 97;
                        cache.update_with_cost(key, i, 1);
                        cache.get(&key);
                        if i % 7 == 0 {
                            cache.remove(&key);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        // Count trim happens on insert, so the bound holds with no slack
        // beyond in-flight operations.
        assert!(cache.count() <= 64 + 8);
    }
}
