//! Error types for the cache engine.
//!
//! Errors are internal plumbing: public tier APIs collapse them into
//! `bool` / `Option` returns, logging on the way out. Nothing in this crate
//! panics or propagates an error across the public API boundary.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the storage engine
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error from the manifest store
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The manifest database could not be opened and the retry policy
    /// refuses another attempt for now
    #[error("manifest database unavailable")]
    DatabaseUnavailable,

    /// Caller input rejected before touching any state
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}
