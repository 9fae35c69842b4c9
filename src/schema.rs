//! # SQLite Schema for kvsql
//!
//! The persisted layout is deliberately tiny: one table of live records plus a
//! metadata table for the schema version.
//!
//! ```text
//! ┌───────────────────────────────┐     ┌─────────────────────┐
//! │ key_value                     │     │ kvsql_metadata      │
//! │  name     TEXT UNIQUE         │     │  key   TEXT PK      │
//! │  value    BLOB                │     │  value TEXT         │
//! │  revision INTEGER (> 0)       │     └─────────────────────┘
//! └───────────────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why no history table?
//!
//! The store keeps only the live record per key. Deletes remove the row
//! physically, so a recreated key starts again at revision 1. Watchers get
//! change history live, never from disk.
//!
//! ### Why a UNIQUE index instead of a primary key on `name`?
//!
//! The uniqueness constraint is what turns a racing second create into
//! `AlreadyExists`. Keeping it a named index makes it easy to check for in
//! tests and keeps the rowid table layout SQLite is fastest with.

use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Increment when making breaking schema changes.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `key_value` table holds one row per live key.
///
/// - `name`: the key; unique
/// - `value`: opaque bytes (already transformed by the façade)
/// - `revision`: per-key version, 1 on insert, +1 per update
const CREATE_KEY_VALUE: &str = r#"
CREATE TABLE IF NOT EXISTS key_value (
    name     TEXT    NOT NULL,
    value    BLOB    NOT NULL,
    revision INTEGER NOT NULL CHECK (revision > 0)
)
"#;

/// Unique index enforcing one live record per key.
///
/// Also serves point lookups and the ordered prefix scan.
const CREATE_KEY_VALUE_NAME_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS key_value_name
ON key_value(name)
"#;

/// Metadata table for schema versioning.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS kvsql_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Connection Setup
// =============================================================================

/// Applies per-connection settings.
///
/// Runs on every connection the pool opens. The busy timeout is what makes a
/// second writer *wait* for the write lock instead of failing immediately
/// with `SQLITE_BUSY`.
pub fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;

    // WAL: readers never block the writer and vice versa.
    conn.execute_batch("PRAGMA journal_mode = WAL")?;

    // Sync the WAL on commit, not on every page write.
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;

    Ok(())
}

/// Creates tables and verifies the schema version.
///
/// Idempotent: safe to run against an already-initialized database.
pub fn initialize(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_METADATA)?;
    conn.execute_batch(CREATE_KEY_VALUE)?;
    conn.execute_batch(CREATE_KEY_VALUE_NAME_INDEX)?;

    verify_or_set_version(conn)
}

/// Verifies the schema version, or sets it if this is a new database.
fn verify_or_set_version(conn: &Connection) -> Result<()> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM kvsql_metadata WHERE key = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    let existing = match stored {
        Some(s) => Some(s.trim().parse::<i32>().map_err(|_| {
            Error::Schema(format!("unreadable schema version '{s}' in kvsql_metadata"))
        })?),
        None => None,
    };

    match existing {
        None => {
            conn.execute(
                "INSERT OR IGNORE INTO kvsql_metadata (key, value) VALUES ('schema_version', ?)",
                [SCHEMA_VERSION.to_string()],
            )?;
        }
        Some(v) if v == SCHEMA_VERSION => {}
        Some(v) => {
            return Err(Error::Schema(format!(
                "schema version mismatch: database has version {v}, but this kvsql version requires {SCHEMA_VERSION}"
            )));
        }
    }

    Ok(())
}

// =============================================================================
// Database Wrapper
// =============================================================================

/// A single initialized SQLite connection.
///
/// The store itself works through a connection pool; `Database` is the
/// one-off handle used to prepare a file ahead of time and to inspect it
/// directly in tests and tools.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// ```rust,no_run
    /// use kvsql::Database;
    ///
    /// let db = Database::open("store.db")?;
    /// # Ok::<(), kvsql::Error>(())
    /// ```
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Creates an initialized in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        configure_connection(&conn, Duration::from_secs(5))?;
        initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Returns the underlying connection.
    ///
    /// Writing through it bypasses revision checks and change events; use it
    /// for inspection only.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper and returns the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================
