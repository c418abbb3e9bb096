//! Flat-file blob store backing externally-placed entries.
//!
//! Live blobs sit in `data/` under the cache root, one file per entry.
//! Doomed blobs are not deleted in line: `data/` is renamed wholesale into a
//! uniquely-named directory under the sibling `trash/`, which a dedicated
//! serial worker drains in the background. Writes are atomic at the file
//! level (temp file + rename).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{Error, Result};
use crate::workers::WorkerPool;

const DATA_DIR: &str = "data";
const TRASH_DIR: &str = "trash";

pub(crate) struct BlobStore {
    data_dir: PathBuf,
    trash_dir: PathBuf,
    /// Drains trash; single-threaded so concurrent drains cannot race.
    trash_worker: WorkerPool,
    trash_seq: AtomicU64,
}

impl BlobStore {
    pub fn open(root: &Path) -> Result<Self> {
        let data_dir = root.join(DATA_DIR);
        let trash_dir = root.join(TRASH_DIR);
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&trash_dir)?;
        Ok(Self {
            data_dir,
            trash_dir,
            trash_worker: WorkerPool::new("blob-store-trash", 1),
            trash_seq: AtomicU64::new(0),
        })
    }

    /// Write a blob atomically: the file either has the full contents or
    /// does not exist.
    pub fn write(&self, filename: &str, data: &[u8]) -> Result<()> {
        validate_filename(filename)?;
        let path = self.data_dir.join(filename);
        let tmp = self.data_dir.join(format!(".{}.tmp", filename));
        fs::write(&tmp, data)?;
        match fs::rename(&tmp, &path) {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                Err(err.into())
            }
        }
    }

    pub fn read(&self, filename: &str) -> Result<Option<Vec<u8>>> {
        validate_filename(filename)?;
        match fs::read(self.data_dir.join(filename)) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove one blob. Missing files are not an error.
    pub fn delete(&self, filename: &str) -> Result<()> {
        validate_filename(filename)?;
        match fs::remove_file(self.data_dir.join(filename)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Atomically retire every live blob: rename `data/` under `trash/` and
    /// recreate an empty `data/`. Pair with [`empty_trash_in_background`].
    ///
    /// [`empty_trash_in_background`]: Self::empty_trash_in_background
    pub fn move_all_to_trash(&self) -> Result<()> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let seq = self.trash_seq.fetch_add(1, Ordering::Relaxed);
        let dest = self.trash_dir.join(format!("data-{}-{}", nanos, seq));
        fs::rename(&self.data_dir, &dest)?;
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    /// Delete everything under `trash/` on the trash worker, ignoring
    /// per-entry errors.
    pub fn empty_trash_in_background(&self) {
        let trash_dir = self.trash_dir.clone();
        self.trash_worker.execute(move || {
            let entries = match fs::read_dir(&trash_dir) {
                Ok(entries) => entries,
                Err(err) => {
                    debug!("failed to enumerate trash dir: {}", err);
                    return;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let removed = if path.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                if let Err(err) = removed {
                    debug!("failed to remove {:?} from trash: {}", path, err);
                }
            }
        });
    }
}

/// Blob names must stay inside `data/`; anything path-like is rejected.
fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
    {
        return Err(Error::InvalidInput("invalid blob filename"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn open_store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, store) = open_store();

        store.write("blob", b"contents").unwrap();
        assert_eq!(store.read("blob").unwrap().unwrap(), b"contents");
    }

    #[test]
    fn test_write_replaces_existing() {
        let (_dir, store) = open_store();

        store.write("blob", b"old").unwrap();
        store.write("blob", b"new contents").unwrap();
        assert_eq!(store.read("blob").unwrap().unwrap(), b"new contents");
    }

    #[test]
    fn test_read_missing_is_none() {
        let (_dir, store) = open_store();
        assert!(store.read("ghost").unwrap().is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, store) = open_store();

        store.write("blob", b"x").unwrap();
        store.delete("blob").unwrap();
        assert!(store.read("blob").unwrap().is_none());
        store.delete("blob").unwrap();
    }

    #[test]
    fn test_rejects_path_like_names() {
        let (_dir, store) = open_store();

        for bad in ["", ".", "..", "a/b", "..\\evil"] {
            assert!(store.write(bad, b"x").is_err(), "{:?} accepted", bad);
        }
    }

    #[test]
    fn test_move_all_to_trash_and_drain() {
        let (dir, store) = open_store();

        store.write("a", b"1").unwrap();
        store.write("b", b"2").unwrap();

        store.move_all_to_trash().unwrap();
        assert!(store.read("a").unwrap().is_none());
        // data/ is recreated empty and immediately writable.
        store.write("c", b"3").unwrap();

        store.empty_trash_in_background();
        let trash = dir.path().join(TRASH_DIR);
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if fs::read_dir(&trash).unwrap().next().is_none() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("trash not drained");
    }
}
