//! StrataCache - Two-Tier Key-Value Cache
//!
//! A single-process cache pairing a fast bounded in-memory tier with a
//! persistent on-disk tier. Callers store opaque serialized byte values
//! against string keys; hot items come back in microseconds from memory,
//! cold items survive process restarts on disk.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Cache                              │
//! │        read-through with promotion / write-through           │
//! ├───────────────────────────┬──────────────────────────────────┤
//! │  Memory tier              │  Disk tier                       │
//! │  ┌─────────────────────┐  │  ┌────────────────────────────┐  │
//! │  │ Arena LRU list      │  │  │ SQLite manifest (WAL)      │  │
//! │  │ cost/count/age trim │  │  │ inline BLOBs ≤ threshold   │  │
//! │  └─────────────────────┘  │  │ data/ files above it       │  │
//! │   background trimmer      │  │ trash/ drained async       │  │
//! │                           │  └────────────────────────────┘  │
//! │                           │   worker pool, background trims  │
//! └───────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Each entry on disk is placed adaptively: payloads up to the inline
//! threshold (20 KiB by default) live in the manifest row itself, larger
//! ones as one file per entry referenced by the row. Eviction is LRU in
//! both tiers, driven by cost, count, age, and (on disk) free-space
//! pressure, and runs on background timers so callers never pay for it.
//!
//! Every blocking disk and facade operation has a completion-callback
//! variant running on a worker pool and an async variant awaiting a
//! oneshot channel. Nothing panics or returns an error across the public
//! API: failures collapse to `false` / `None` and are logged via
//! [`tracing`].
//!
//! # Modules
//!
//! - [`cache`] - two-tier facade
//! - [`memory`] - in-memory LRU tier
//! - [`disk`] - persistent tier (manifest + blob files)
//! - [`host`] - injected host capabilities (lifecycle signals, volume stats)
//! - [`error`] - internal error types
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use stratacache::Cache;
//!
//! let cache = Cache::open("thumbnails").unwrap();
//! cache.set("user:42", Bytes::from_static(b"...png bytes..."));
//! if let Some(thumb) = cache.get("user:42") {
//!     // served from memory on the second call
//!     drop(thumb);
//! }
//! ```

pub mod cache;
pub mod disk;
pub mod error;
pub mod host;
pub mod memory;
mod workers;

pub use cache::Cache;
pub use disk::{DiskCache, DiskConfig, DiskEntry, PlacementMode};
pub use error::{Error, Result};
pub use host::{LifecycleEvent, LifecycleHub, NoVolumeStats, VolumeStats};
pub use memory::{MemoryCache, MemoryConfig};
