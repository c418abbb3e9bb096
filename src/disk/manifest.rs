//! SQLite-backed manifest of disk entries.
//!
//! One table (`manifest`) plus an index on `last_access_time` describe every
//! entry in the disk tier: inline payloads live in the `inline_data` BLOB,
//! external payloads are referenced through `filename`. The store is not
//! thread-safe; the disk tier serializes all access behind its own lock.
//!
//! Statements are prepared once and cached by SQL string via rusqlite's
//! statement cache. Multi-key queries build their `(?,?,…)` placeholder
//! list dynamically and bypass the cache, since the SQL varies with arity.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::{Error, Result};

/// Reopen attempts are refused once this many consecutive failures pile up,
/// until [`MIN_OPEN_RETRY_INTERVAL`] has elapsed since the last one.
const MAX_OPEN_RETRY_COUNT: u32 = 8;
const MIN_OPEN_RETRY_INTERVAL: Duration = Duration::from_secs(2);

const SCHEMA_SQL: &str = "\
    CREATE TABLE IF NOT EXISTS manifest (\
      key TEXT PRIMARY KEY,\
      filename TEXT,\
      size INTEGER,\
      inline_data BLOB,\
      modification_time INTEGER,\
      last_access_time INTEGER,\
      extended_data BLOB);\
    CREATE INDEX IF NOT EXISTS last_access_time_idx ON manifest(last_access_time);";

/// Seconds since the Unix epoch.
pub(crate) fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// One manifest row.
#[derive(Debug, Clone)]
pub(crate) struct ManifestEntry {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
    pub inline_data: Option<Vec<u8>>,
    pub modification_time: i64,
    pub last_access_time: i64,
    pub extended_data: Option<Vec<u8>>,
}

/// Eviction candidate: just enough of a row to delete it and account for it.
#[derive(Debug, Clone)]
pub(crate) struct SizeInfo {
    pub key: String,
    pub filename: Option<String>,
    pub size: u64,
}

pub(crate) struct ManifestStore {
    db_path: PathBuf,
    conn: Option<Connection>,
    open_fail_count: u32,
    last_open_attempt: Option<Instant>,
}

impl ManifestStore {
    /// Open (creating if necessary) the database at `db_path`.
    pub fn open(db_path: PathBuf) -> Result<Self> {
        let conn = Self::open_connection(&db_path)?;
        Ok(Self {
            db_path,
            conn: Some(conn),
            open_fail_count: 0,
            last_open_attempt: None,
        })
    }

    fn open_connection(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.set_prepared_statement_cache_capacity(64);
        // journal_mode returns a result row; synchronous does not.
        conn.query_row("PRAGMA journal_mode = wal;", [], |_row| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous = normal;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(conn)
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Close the connection. Subsequent operations go through the
    /// rate-limited reopen path.
    pub fn close(&mut self) {
        self.conn = None;
    }

    /// Attempt an open right now, bypassing the rate limit.
    pub fn reopen(&mut self) -> Result<()> {
        match Self::open_connection(&self.db_path) {
            Ok(conn) => {
                self.conn = Some(conn);
                self.open_fail_count = 0;
                self.last_open_attempt = None;
                Ok(())
            }
            Err(err) => {
                self.open_fail_count = self.open_fail_count.saturating_add(1);
                self.last_open_attempt = Some(Instant::now());
                Err(err)
            }
        }
    }

    /// Delete the database files (main, -shm, -wal). The store must be
    /// closed first.
    pub fn destroy_files(&self) -> Result<()> {
        for suffix in ["", "-shm", "-wal"] {
            let mut path = self.db_path.as_os_str().to_owned();
            path.push(suffix);
            match std::fs::remove_file(PathBuf::from(path)) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn conn(&mut self) -> Result<&Connection> {
        if self.conn.is_none() {
            if !self.can_attempt_open() {
                return Err(Error::DatabaseUnavailable);
            }
            self.reopen()?;
        }
        self.conn.as_ref().ok_or(Error::DatabaseUnavailable)
    }

    fn can_attempt_open(&self) -> bool {
        self.open_fail_count < MAX_OPEN_RETRY_COUNT
            || self
                .last_open_attempt
                .map_or(true, |at| at.elapsed() >= MIN_OPEN_RETRY_INTERVAL)
    }

    /// Insert or replace a row. `inline_data` is null whenever `filename`
    /// is set; both timestamps are set to now.
    pub fn save(
        &mut self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extended: Option<&[u8]>,
    ) -> Result<()> {
        let now = unix_time();
        let inline: Option<&[u8]> = if filename.is_some() { None } else { Some(value) };
        let size = value.len() as i64;
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO manifest \
             (key, filename, size, inline_data, modification_time, last_access_time, extended_data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        stmt.execute(params![key, filename, size, inline, now, now, extended])?;
        Ok(())
    }

    pub fn touch(&mut self, key: &str) -> Result<()> {
        let now = unix_time();
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("UPDATE manifest SET last_access_time = ?1 WHERE key = ?2")?;
        stmt.execute(params![now, key])?;
        Ok(())
    }

    pub fn touch_many(&mut self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let now = unix_time();
        let sql = format!(
            "UPDATE manifest SET last_access_time = {} WHERE key IN ({})",
            now,
            placeholders(keys.len())
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(params_from_iter(keys.iter()))?;
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE key = ?1")?;
        stmt.execute(params![key])?;
        Ok(())
    }

    pub fn delete_many(&mut self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "DELETE FROM manifest WHERE key IN ({})",
            placeholders(keys.len())
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        stmt.execute(params_from_iter(keys.iter()))?;
        Ok(())
    }

    pub fn delete_larger_than(&mut self, size: u64) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("DELETE FROM manifest WHERE size > ?1")?;
        stmt.execute(params![size as i64])?;
        Ok(())
    }

    pub fn delete_older_than(&mut self, cutoff: i64) -> Result<()> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("DELETE FROM manifest WHERE last_access_time < ?1")?;
        stmt.execute(params![cutoff])?;
        Ok(())
    }

    pub fn get(&mut self, key: &str, exclude_inline: bool) -> Result<Option<ManifestEntry>> {
        let conn = self.conn()?;
        if exclude_inline {
            let mut stmt = conn.prepare_cached(
                "SELECT key, filename, size, modification_time, last_access_time, extended_data \
                 FROM manifest WHERE key = ?1",
            )?;
            Ok(stmt
                .query_row(params![key], row_to_entry_excluding_inline)
                .optional()?)
        } else {
            let mut stmt = conn.prepare_cached(
                "SELECT key, filename, size, inline_data, modification_time, last_access_time, \
                 extended_data FROM manifest WHERE key = ?1",
            )?;
            Ok(stmt.query_row(params![key], row_to_entry).optional()?)
        }
    }

    pub fn get_many(&mut self, keys: &[String], exclude_inline: bool) -> Result<Vec<ManifestEntry>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let columns = if exclude_inline {
            "key, filename, size, modification_time, last_access_time, extended_data"
        } else {
            "key, filename, size, inline_data, modification_time, last_access_time, extended_data"
        };
        let sql = format!(
            "SELECT {} FROM manifest WHERE key IN ({})",
            columns,
            placeholders(keys.len())
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let mapper = if exclude_inline {
            row_to_entry_excluding_inline
        } else {
            row_to_entry
        };
        let rows = stmt.query_map(params_from_iter(keys.iter()), mapper)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Inline payload only; `None` when the row is absent or external.
    pub fn get_value(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT inline_data FROM manifest WHERE key = ?1")?;
        let value: Option<Option<Vec<u8>>> =
            stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(value.flatten())
    }

    pub fn get_filename(&mut self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT filename FROM manifest WHERE key = ?1")?;
        let filename: Option<Option<String>> =
            stmt.query_row(params![key], |row| row.get(0)).optional()?;
        Ok(filename.flatten())
    }

    /// External filenames for the given keys; inline rows contribute nothing.
    pub fn get_filenames(&mut self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT filename FROM manifest WHERE key IN ({}) AND filename IS NOT NULL",
            placeholders(keys.len())
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(keys.iter()), |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_filenames_older_than(&mut self, cutoff: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT filename FROM manifest WHERE last_access_time < ?1 AND filename IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_filenames_larger_than(&mut self, size: u64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT filename FROM manifest WHERE size > ?1 AND filename IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![size as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn exists(&mut self, key: &str) -> Result<bool> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT COUNT(key) FROM manifest WHERE key = ?1")?;
        let count: i64 = stmt.query_row(params![key], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Eviction candidates, least recently accessed first.
    pub fn list_size_info_oldest_first(&mut self, limit: usize) -> Result<Vec<SizeInfo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT key, filename, size FROM manifest ORDER BY last_access_time ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(SizeInfo {
                key: row.get(0)?,
                filename: row.get(1)?,
                size: row.get::<_, i64>(2)?.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn total_count(&mut self) -> Result<u64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM manifest")?;
        let count: i64 = stmt.query_row([], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    pub fn total_size(&mut self) -> Result<u64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT SUM(size) FROM manifest")?;
        let size: Option<i64> = stmt.query_row([], |row| row.get(0))?;
        Ok(size.unwrap_or(0).max(0) as u64)
    }

    /// Flush the write-ahead log into the main database file.
    pub fn checkpoint(&mut self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("PRAGMA wal_checkpoint(PASSIVE);", [], |_row| Ok(()))?;
        Ok(())
    }
}

fn placeholders(count: usize) -> String {
    let mut out = String::with_capacity(count * 2);
    for i in 0..count {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<ManifestEntry> {
    Ok(ManifestEntry {
        key: row.get(0)?,
        filename: row.get(1)?,
        size: row.get::<_, i64>(2)?.max(0) as u64,
        inline_data: row.get(3)?,
        modification_time: row.get(4)?,
        last_access_time: row.get(5)?,
        extended_data: row.get(6)?,
    })
}

fn row_to_entry_excluding_inline(row: &Row<'_>) -> rusqlite::Result<ManifestEntry> {
    Ok(ManifestEntry {
        key: row.get(0)?,
        filename: row.get(1)?,
        size: row.get::<_, i64>(2)?.max(0) as u64,
        inline_data: None,
        modification_time: row.get(3)?,
        last_access_time: row.get(4)?,
        extended_data: row.get(5)?,
    })
}

// =============================================================================
// Tests
// =============================================================================
