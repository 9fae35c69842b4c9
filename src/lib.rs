//! # kvsql - Watchable Key-Value Store on SQL
//!
//! kvsql embeds a versioned, transactional key-value store in a relational
//! database and exposes the semantics a consensus-store client expects:
//!
//! - **Point lookups and prefix listing**, ordered by key
//! - **Optimistic concurrency**: every record carries a revision, and a write
//!   with a stale revision is rejected
//! - **Live change notification**: prefix-scoped watches fed in commit order
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Store (async façade)                      │
//! │        key prefix · value transform · get/list/create/...       │
//! └───────────────┬──────────────────────────────────┬──────────────┘
//!                 │ spawn_blocking                   │ watch(prefix)
//!                 ▼                                  ▼
//! ┌───────────────────────────────┐   publish   ┌────────────────────┐
//! │         RecordStore           │────────────▶│     WatchHub       │
//! │  BEGIN IMMEDIATE · revisions  │ (commit     │ bounded queue →    │
//! │  r2d2 pool of connections     │  order)     │ dispatch task →    │
//! └───────────────┬───────────────┘             │ per-watch buffers  │
//!                 │                             └────────────────────┘
//!                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    SQLite (key_value table)                      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One live record per key**: enforced by a unique index
//! 2. **Revisions**: 1 on create, +1 per update, reset by delete + create
//! 3. **Stale writes fail**: never silently overwrite
//! 4. **One event per commit**: none for failed writes, delivered in commit
//!    order to every matching watch
//!
//! ## Module Organization
//!
//! - [`error`]: Error taxonomy
//! - [`types`]: Records, revisions, change events
//! - [`schema`]: SQLite DDL and connection setup
//! - [`config`]: Layered configuration
//! - [`record`]: Transactional CRUD (the record store)
//! - [`watch`]: Event fan-out (the watch hub)
//! - [`transform`]: Value transformers (identity, tagging, encryption)
//! - [`api`]: Async store façade (main entry point)

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for kvsql operations.
pub mod error;

/// Domain types: [`KeyValue`], [`Revision`], [`ChangeEvent`].
pub mod types;

/// SQLite schema definitions and connection setup.
pub mod schema;

/// Store configuration loaded from defaults, a TOML file and the environment.
pub mod config;

/// Transactional record storage with revision checks.
///
/// Synchronous; every mutating call runs in one `BEGIN IMMEDIATE`
/// transaction and publishes its change event after commit.
pub mod record;

/// In-process watch hub.
///
/// Key features:
/// - Bounded event queue, never blocks the writer
/// - Single dispatch task, so delivery order is commit order
/// - Slow watchers are evicted instead of stalling the rest
pub mod watch;

/// Reversible value transforms applied at the façade.
pub mod transform;

/// Async API for kvsql.
///
/// The main entry point is [`Store`](api::Store).
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{Store, Watch, WatchStats};
pub use config::{Backend, StoreConfig};
pub use error::{BackendError, Error, Result};
pub use record::{EventSink, NullSink, PoolStats, RecordStore};
pub use schema::Database;
pub use transform::{
    EncryptingTransformer, EnvKeyProvider, IdentityTransformer, KeyProvider, PrefixTransformer,
    ValueTransformer,
};
pub use types::{ChangeEvent, EventKind, KeyValue, Revision};
pub use watch::{Subscription, WatchHub};
