//! # Record Store
//!
//! Durable, transactional CRUD over the `key_value` table with revision-based
//! optimistic concurrency. Every call is synchronous and runs on a connection
//! borrowed from a shared r2d2 pool.
//!
//! ## Write Path
//!
//! ```text
//!   BEGIN IMMEDIATE          ← exclusive write lock; second writer waits
//!     SELECT current row     ← read under the lock
//!     compare revision
//!     INSERT / UPDATE / DELETE
//!   ┌─ commit-order guard ─┐
//!   │ COMMIT               │
//!   │ sink.publish(event)  │ ← queue order == commit order
//!   └──────────────────────┘
//! ```
//!
//! SQLite has no row locks; `BEGIN IMMEDIATE` takes the database write lock
//! up front, which serializes writers to the same key (and, more coarsely,
//! to every key). The busy timeout on each pooled connection bounds the wait.
//!
//! ## Invariants
//!
//! - Create yields revision 1; a successful update yields `old + 1`
//! - A stale revision never overwrites: update fails with
//!   [`Error::RevisionConflict`], delete with [`Error::NotFound`]
//! - Exactly one [`ChangeEvent`] per committed write, published after the
//!   commit and never for a failed or rolled-back write

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, ErrorCode, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, trace};

use crate::config::StoreConfig;
use crate::schema;
use crate::types::{ChangeEvent, KeyValue, Revision};
use crate::{Error, Result};

// =============================================================================
// Event Sink
// =============================================================================

/// Receiver of committed changes.
///
/// Called while the commit-order guard is held, so implementations must not
/// block and must not call back into the record store.
pub trait EventSink: Send + Sync {
    /// Accepts one committed change.
    fn publish(&self, event: ChangeEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: ChangeEvent) {}
}

// =============================================================================
// Pool Diagnostics
// =============================================================================

/// Snapshot of the connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently open.
    pub connections: u32,
    /// Open connections not checked out.
    pub idle_connections: u32,
}

// =============================================================================
// SQL
// =============================================================================

const SELECT_ONE: &str = "SELECT name, value, revision FROM key_value WHERE name = ?1";

// `name >= ?1` lets the unique index bound the scan. The match is a literal
// byte prefix: no LIKE wildcards, and text `length` would stop at a NUL.
const SELECT_PREFIX: &str = "SELECT name, value, revision FROM key_value
     WHERE name >= ?1
       AND substr(CAST(name AS BLOB), 1, length(CAST(?1 AS BLOB))) = CAST(?1 AS BLOB)
     ORDER BY name";

const COUNT_PREFIX: &str = "SELECT COUNT(*) FROM key_value
     WHERE name >= ?1
       AND substr(CAST(name AS BLOB), 1, length(CAST(?1 AS BLOB))) = CAST(?1 AS BLOB)";

const INSERT: &str = "INSERT INTO key_value (name, value, revision) VALUES (?1, ?2, ?3)";

const UPDATE: &str = "UPDATE key_value SET value = ?1, revision = ?2 WHERE name = ?3";

const DELETE: &str = "DELETE FROM key_value WHERE name = ?1";

fn row_to_key_value(row: &Row<'_>) -> rusqlite::Result<KeyValue> {
    let name: String = row.get(0)?;
    let value: Vec<u8> = row.get(1)?;
    let revision: i64 = row.get(2)?;
    Ok(KeyValue::new(name, value, Revision::from_raw(revision as u64)))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation)
}

// =============================================================================
// Record Store
// =============================================================================

/// Transactional key-value records on a pooled SQLite database.
///
/// Cheap to clone; clones share the pool, the sink and the commit-order
/// guard.
#[derive(Clone)]
pub struct RecordStore {
    pool: Pool<SqliteConnectionManager>,
    sink: Arc<dyn EventSink>,
    commit_order: Arc<Mutex<()>>,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore")
            .field("pool", &self.pool_stats())
            .finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Opens the backend named by `config` and initializes the schema.
    ///
    /// `:memory:` gets a single long-lived connection, since every new SQLite
    /// connection to `:memory:` would see its own empty database.
    pub fn open(config: &StoreConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let busy_timeout = config.busy_timeout();

        let (manager, builder) = if config.is_in_memory() {
            let builder = Pool::<SqliteConnectionManager>::builder()
                .max_size(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (SqliteConnectionManager::memory(), builder)
        } else {
            let builder = Pool::<SqliteConnectionManager>::builder().max_size(config.pool_size);
            (SqliteConnectionManager::file(&config.dsn), builder)
        };

        // A checkout may wait behind a writer that is itself waiting for the
        // database lock.
        let checkout_timeout = busy_timeout.max(Duration::from_secs(1)) * 2;

        let manager =
            manager.with_init(move |conn| schema::configure_connection(conn, busy_timeout));
        let pool = builder.connection_timeout(checkout_timeout).build(manager)?;

        {
            let conn = pool.get()?;
            schema::initialize(&conn)?;
        }

        debug!(
            dsn = %config.dsn,
            pool_size = pool.max_size(),
            "record store opened"
        );

        Ok(Self {
            pool,
            sink,
            commit_order: Arc::new(Mutex::new(())),
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the live record for `key`, if any.
    pub fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let conn = self.pool.get()?;
        let record = conn.query_row(SELECT_ONE, [key], row_to_key_value).optional()?;
        trace!(key, found = record.is_some(), "get");
        Ok(record)
    }

    /// Returns every record whose key starts with `prefix`, ordered by key.
    pub fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare_cached(SELECT_PREFIX)?;
        let records = stmt
            .query_map([prefix], row_to_key_value)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        trace!(prefix, count = records.len(), "list");
        Ok(records)
    }

    /// Returns how many records have a key starting with `prefix`.
    pub fn count(&self, prefix: &str) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(COUNT_PREFIX, [prefix], |row| row.get(0))?;
        Ok(count as u64)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Inserts a new record at revision 1.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the key has a live record.
    pub fn create(&self, key: &str, value: &[u8]) -> Result<KeyValue> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = KeyValue::new(key, value, Revision::FIRST);
        match tx.execute(INSERT, params![key, value, Revision::FIRST.as_raw() as i64]) {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                debug!(key, "create rejected: key exists");
                return Err(Error::already_exists(key));
            }
            Err(err) => return Err(err.into()),
        }

        self.commit_and_publish(tx, ChangeEvent::created(current.clone()))?;
        debug!(key, revision = %current.revision, "created");
        Ok(current)
    }

    /// Replaces the value of `key` if its revision is still `expected`.
    ///
    /// Returns the snapshots before and after the write.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the key has no live record
    /// - [`Error::RevisionConflict`] if the stored revision differs; the
    ///   transaction commits as a no-op
    pub fn update(
        &self,
        key: &str,
        value: &[u8],
        expected: Revision,
    ) -> Result<(KeyValue, KeyValue)> {
        self.update_with(key, value, expected, |previous| Ok(previous.clone()))
    }

    /// Like [`update`](Self::update), but passes the stored record to
    /// `inspect` before writing and returns its output in place of the
    /// previous snapshot.
    ///
    /// An error from `inspect` rolls the transaction back: nothing is
    /// written and no event is published.
    pub fn update_with<P>(
        &self,
        key: &str,
        value: &[u8],
        expected: Revision,
        inspect: impl FnOnce(&KeyValue) -> Result<P>,
    ) -> Result<(P, KeyValue)> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = match tx.query_row(SELECT_ONE, [key], row_to_key_value).optional()? {
            Some(record) => record,
            None => {
                tx.commit()?;
                return Err(Error::not_found(key));
            }
        };

        if previous.revision != expected {
            tx.commit()?;
            debug!(
                key,
                expected = %expected,
                actual = %previous.revision,
                "update rejected: revision conflict"
            );
            return Err(Error::RevisionConflict {
                key: key.to_string(),
                expected: expected.as_raw(),
                actual: previous.revision.as_raw(),
            });
        }

        let inspected = inspect(&previous)?;

        let current = previous.updated(value.to_vec());
        tx.execute(
            UPDATE,
            params![current.value, current.revision.as_raw() as i64, key],
        )?;

        self.commit_and_publish(tx, ChangeEvent::updated(previous, current.clone()))?;
        debug!(key, revision = %current.revision, "updated");
        Ok((inspected, current))
    }

    /// Removes `key`, optionally only if its revision is still `expected`.
    ///
    /// Returns the removed snapshot.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if the key has no live record or `expected` does
    /// not match.
    pub fn delete(&self, key: &str, expected: Option<Revision>) -> Result<KeyValue> {
        self.delete_with(key, expected, |previous| Ok(previous.clone()))
    }

    /// Like [`delete`](Self::delete), with the same `inspect` contract as
    /// [`update_with`](Self::update_with).
    pub fn delete_with<P>(
        &self,
        key: &str,
        expected: Option<Revision>,
        inspect: impl FnOnce(&KeyValue) -> Result<P>,
    ) -> Result<P> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = tx.query_row(SELECT_ONE, [key], row_to_key_value).optional()?;
        let previous = match (previous, expected) {
            (Some(record), Some(rev)) if record.revision != rev => {
                tx.commit()?;
                debug!(
                    key,
                    expected = %rev,
                    actual = %record.revision,
                    "delete rejected: revision mismatch"
                );
                return Err(Error::not_found(key));
            }
            (Some(record), _) => record,
            (None, _) => {
                tx.commit()?;
                return Err(Error::not_found(key));
            }
        };

        let inspected = inspect(&previous)?;

        tx.execute(DELETE, [key])?;

        let revision = previous.revision;
        self.commit_and_publish(tx, ChangeEvent::deleted(previous))?;
        debug!(key, revision = %revision, "deleted");
        Ok(inspected)
    }

    /// Commits `tx` and hands `event` to the sink under one guard.
    ///
    /// Only the holder of the database write lock gets here, so the guard is
    /// never contended by a writer that is itself waiting for the lock.
    fn commit_and_publish(&self, tx: Transaction<'_>, event: ChangeEvent) -> Result<()> {
        let _order = self.commit_order.lock();
        tx.commit()?;
        self.sink.publish(event);
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Current pool occupancy.
    pub fn pool_stats(&self) -> PoolStats {
        let state = self.pool.state();
        PoolStats {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
