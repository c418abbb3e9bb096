//! Process-wide registry of disk tiers, one per directory.
//!
//! The manifest store is single-writer, so two live `DiskCache` instances on
//! the same directory would corrupt each other's view. Construction goes
//! through here: an existing live instance for the canonical path is handed
//! back instead of building a second one. Entries are weak, so a dropped
//! tier frees its slot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::DiskCache;

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Weak<DiskCache>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Return the live instance for `path`, or construct, register, and return a
/// new one. The registry lock is held across construction so concurrent
/// opens of the same path cannot both build.
pub(crate) fn open_or_construct<F>(path: &Path, construct: F) -> Option<Arc<DiskCache>>
where
    F: FnOnce() -> Option<Arc<DiskCache>>,
{
    let mut registry = REGISTRY.lock();
    registry.retain(|_, weak| weak.strong_count() > 0);

    if let Some(existing) = registry.get(path).and_then(Weak::upgrade) {
        return Some(existing);
    }

    let cache = construct()?;
    registry.insert(path.to_path_buf(), Arc::downgrade(&cache));
    Some(cache)
}
