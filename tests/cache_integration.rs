//! End-to-end scenarios across both tiers.

use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tempfile::TempDir;

use stratacache::{Cache, DiskConfig, MemoryConfig};

fn sha256_hex(key: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_write_is_visible_in_both_tiers_and_through_facade() {
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_at(dir.path().join("T1")).unwrap();

    assert!(cache.set("a", Bytes::from_static(b"hello")));

    assert_eq!(cache.memory().get("a"), Some(Bytes::from_static(b"hello")));
    assert_eq!(cache.disk().get("a"), Some(Bytes::from_static(b"hello")));
    assert_eq!(cache.get("a"), Some(Bytes::from_static(b"hello")));
}

#[test]
fn test_read_through_after_restart_promotes_into_memory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("T2");
    let payload = Bytes::from(vec![0x5A; 10 * 1024]);

    let cache = Cache::open_at(&path).unwrap();
    assert!(cache.set("k", payload.clone()));
    drop(cache);

    // A fresh instance reads the cold entry from disk and promotes it.
    let reopened = Cache::open_at(&path).unwrap();
    assert!(!reopened.memory().contains("k"));
    assert_eq!(reopened.get("k"), Some(payload));
    assert!(reopened.memory().contains("k"));
}

#[test]
fn test_external_placement_writes_sha256_named_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("T3");
    let cache = Cache::open_with(
        &path,
        MemoryConfig::default(),
        DiskConfig {
            inline_threshold: 1024,
            ..DiskConfig::default()
        },
    )
    .unwrap();

    let payload = Bytes::from(vec![0xAB; 4096]);
    assert!(cache.set("big", payload.clone()));

    let blob = path.join("data").join(sha256_hex("big"));
    assert!(blob.exists(), "external file should carry the payload");
    assert_eq!(std::fs::read(&blob).unwrap(), payload.as_ref());

    // The manifest row references the file instead of holding the bytes.
    let entry = cache.disk().get_entry("big").unwrap();
    assert_eq!(entry.filename.as_deref(), Some(sha256_hex("big").as_str()));
    assert_eq!(entry.value, payload);
}

#[test]
fn test_memory_count_limit_evicts_least_recently_used() {
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_with(
        dir.path().join("T4"),
        MemoryConfig {
            count_limit: 3,
            ..MemoryConfig::default()
        },
        DiskConfig::default(),
    )
    .unwrap();

    for key in ["1", "2", "3", "4"] {
        assert!(cache.set(key, Bytes::from_static(b"x")));
    }

    assert_eq!(cache.memory().count(), 3);
    assert!(!cache.memory().contains("1"));
    for key in ["2", "3", "4"] {
        assert!(cache.memory().contains(key), "{} should survive", key);
    }
}

#[test]
fn test_disk_age_limit_expires_entries() {
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_with(
        dir.path().join("T5"),
        MemoryConfig::default(),
        DiskConfig {
            age_limit: Duration::from_secs(1),
            auto_trim_interval: Duration::from_millis(100),
            ..DiskConfig::default()
        },
    )
    .unwrap();

    assert!(cache.set("k", Bytes::from_static(b"v")));
    thread::sleep(Duration::from_secs(2));

    assert!(wait_until(|| cache.disk().get("k").is_none()));
}

#[test]
fn test_concurrent_soak_stays_bounded_and_deadlock_free() {
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_with(
        dir.path().join("T6"),
        MemoryConfig {
            count_limit: 64,
            ..MemoryConfig::default()
        },
        DiskConfig {
            count_limit: 64,
            auto_trim_interval: Duration::from_millis(200),
            ..DiskConfig::default()
        },
    )
    .unwrap();

    let stop_at = Instant::now() + Duration::from_secs(5);
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while Instant::now() < stop_at {
                    let key = format!("key-{}", rng.gen_range(0..1000));
                    match rng.gen_range(0..3) {
                        0 => {
                            cache.set(&key, Bytes::from_static(b"payload"));
                        }
                        1 => {
                            cache.get(&key);
                        }
                        _ => {
                            cache.remove(&key);
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // After a final background tick both tiers settle under their bounds
    // (memory enforces count on insert, so only in-flight slack remains).
    assert!(cache.memory().count() <= 64 + 8);
    assert!(wait_until(|| cache.disk().total_count() <= 64));
}

#[test]
fn test_remove_is_mirrored_across_tiers() {
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_at(dir.path().join("mirror")).unwrap();

    assert!(cache.set("k", Bytes::from_static(b"v")));
    assert!(cache.remove("k"));

    assert!(cache.get("k").is_none());
    assert!(!cache.memory().contains("k"));
    assert!(cache.disk().get("k").is_none());
}

#[test]
fn test_disk_access_time_is_monotonic_across_reads() {
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_at(dir.path().join("touch")).unwrap();

    assert!(cache.set("k", Bytes::from_static(b"v")));
    let first = cache.disk().get_entry("k").unwrap().last_access_time;
    thread::sleep(Duration::from_millis(1100));
    let second = cache.disk().get_entry("k").unwrap().last_access_time;
    assert!(second >= first);
}

#[tokio::test]
async fn test_async_round_trip_through_facade() {
    let dir = TempDir::new().unwrap();
    let cache = Cache::open_at(dir.path().join("suspend")).unwrap();

    assert!(cache.set_async("k", Bytes::from_static(b"v")).await);
    assert_eq!(cache.get_async("k").await, Some(Bytes::from_static(b"v")));
    assert!(cache.remove_async("k").await);
    assert!(!cache.contains_async("k").await);
}
