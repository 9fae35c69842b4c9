//! # Error Handling for kvsql
//!
//! A single error enum ([`Error`]) covers every failure a caller can see. The
//! taxonomy mirrors what a consensus-store client expects:
//!
//! | Variant | When | Typical Response |
//! |---------|------|------------------|
//! | `AlreadyExists` | create on an existing key | Read, then update |
//! | `NotFound` | key absent, or delete with a stale revision | Re-list |
//! | `RevisionConflict` | update with a stale revision | Re-read and retry |
//! | `StoreUnavailable` | backend or pool failure | Retry later |
//!
//! Nothing here is retried internally. Retry policy belongs to the caller.
//!
//! ## Rust Pattern: thiserror
//!
//! `#[error(...)]` generates `Display`, `#[from]` generates `From` so that
//! `?` converts `rusqlite` and `r2d2` errors into `StoreUnavailable`.

use thiserror::Error;

// =============================================================================
// Backend Errors
// =============================================================================

/// Failures of the relational backend itself.
///
/// These are all reported to callers as [`Error::StoreUnavailable`]; the inner
/// value is kept for logs and debugging.
#[derive(Error, Debug)]
pub enum BackendError {
    /// SQLite returned an error (I/O, lock timeout, corruption).
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The connection pool could not hand out a connection.
    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    /// A blocking backend task panicked or was aborted.
    #[error("backend task failed: {0}")]
    Task(String),
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in kvsql operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Create was called for a key that already has a live record.
    ///
    /// Enforced by the unique constraint on `key_value.name`, so two racing
    /// creates of the same key can never both succeed.
    #[error("key '{key}' already exists")]
    AlreadyExists {
        /// The key that was taken.
        key: String,
    },

    /// The key has no live record, or a delete supplied a revision that does
    /// not match the stored one.
    #[error("key '{key}' not found")]
    NotFound {
        /// The key that was looked up.
        key: String,
    },

    /// Optimistic concurrency conflict on update.
    ///
    /// # Recovery
    ///
    /// 1. Re-read the key to get the current revision
    /// 2. Re-apply the change to the fresh value
    /// 3. Retry the update with the new revision
    #[error("revision conflict on key '{key}': expected revision {expected}, but found {actual}")]
    RevisionConflict {
        /// The key being updated.
        key: String,
        /// The revision the caller supplied.
        expected: u64,
        /// The revision actually stored.
        actual: u64,
    },

    /// The backend could not be reached or failed mid-operation.
    ///
    /// A mutating call that returns this error either rolled back or never
    /// started; there is no partial write.
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] BackendError),

    /// The value transformer rejected a value (e.g. failed to decode).
    #[error("value transform failed: {0}")]
    Transform(String),

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Schema version mismatch or unexpected table layout.
    #[error("schema error: {0}")]
    Schema(String),

    /// The store has been shut down.
    #[error("store is closed")]
    Closed,
}

impl Error {
    /// Returns true if the same call may succeed when retried later.
    ///
    /// Conflicts succeed after a re-read; unavailability may clear up on its
    /// own. Everything else needs the caller to change the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RevisionConflict { .. } | Error::StoreUnavailable(_))
    }

    /// Returns true for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    pub(crate) fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    pub(crate) fn already_exists(key: impl Into<String>) -> Self {
        Error::AlreadyExists { key: key.into() }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::StoreUnavailable(BackendError::Sqlite(err))
    }
}

impl From<r2d2::Error> for Error {
    fn from(err: r2d2::Error) -> Self {
        Error::StoreUnavailable(BackendError::Pool(err))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
