//! # Domain Types for kvsql
//!
//! The store's vocabulary: records ([`KeyValue`]), their concurrency token
//! ([`Revision`]), and the change notifications ([`ChangeEvent`]) produced
//! by every committed write.
//!
//! ## Invariants
//!
//! - [`Revision`]: starts at 1 on create, +1 per update, never zero for a
//!   live record
//! - At most one live [`KeyValue`] per key
//! - Exactly one [`ChangeEvent`] per committed write, none for failed writes

use std::fmt;

// =============================================================================
// Revision
// =============================================================================

/// Per-key version number and the only optimistic-concurrency token.
///
/// # Rust Pattern: Newtype
///
/// Wrapping `u64` keeps revisions from being mixed up with sizes, counts or
/// sequence numbers in function signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(u64);

impl Revision {
    /// Revision assigned by a successful create.
    pub const FIRST: Revision = Revision(1);

    /// Creates a revision from a raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the revision a successful update produces.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

// =============================================================================
// KeyValue
// =============================================================================

/// A live record: key, opaque value bytes and current revision.
///
/// The value is stored and returned as-is. Any encoding (serialization,
/// encryption) is applied above the record store by a
/// [`ValueTransformer`](crate::transform::ValueTransformer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// Unique key; also the prefix-match key for list and watch.
    pub key: String,

    /// Opaque value bytes.
    pub value: Vec<u8>,

    /// Current revision.
    pub revision: Revision,
}

impl KeyValue {
    /// Creates a record snapshot.
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>, revision: Revision) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            revision,
        }
    }

    /// Returns the snapshot a successful update of this record produces.
    pub(crate) fn updated(&self, value: Vec<u8>) -> Self {
        Self {
            key: self.key.clone(),
            value,
            revision: self.revision.next(),
        }
    }
}

// =============================================================================
// Change Events
// =============================================================================

/// What kind of write produced a [`ChangeEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A new key was created (revision 1).
    Created,
    /// An existing key got a new value and revision.
    Updated,
    /// A key was removed.
    Deleted,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::Created => "created",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// A notification emitted once per committed write.
///
/// | kind | previous | current |
/// |------|----------|---------|
/// | Created | `None` | `Some` |
/// | Updated | `Some` | `Some` |
/// | Deleted | `Some` | `None` |
///
/// The constructors are the only way to build one, so the table above always
/// holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    kind: EventKind,
    previous: Option<KeyValue>,
    current: Option<KeyValue>,
}

impl ChangeEvent {
    /// Event for a freshly created record.
    pub fn created(current: KeyValue) -> Self {
        Self {
            kind: EventKind::Created,
            previous: None,
            current: Some(current),
        }
    }

    /// Event for an update, carrying both snapshots.
    pub fn updated(previous: KeyValue, current: KeyValue) -> Self {
        Self {
            kind: EventKind::Updated,
            previous: Some(previous),
            current: Some(current),
        }
    }

    /// Event for a delete, carrying the removed snapshot.
    pub fn deleted(previous: KeyValue) -> Self {
        Self {
            kind: EventKind::Deleted,
            previous: Some(previous),
            current: None,
        }
    }

    /// The kind of write.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Snapshot before the write (absent for `Created`).
    pub fn previous(&self) -> Option<&KeyValue> {
        self.previous.as_ref()
    }

    /// Snapshot after the write (absent for `Deleted`).
    pub fn current(&self) -> Option<&KeyValue> {
        self.current.as_ref()
    }

    /// The key this event is about.
    pub fn key(&self) -> &str {
        match (&self.current, &self.previous) {
            (Some(kv), _) | (None, Some(kv)) => &kv.key,
            (None, None) => unreachable!("change event without snapshots"),
        }
    }

    /// Splits the event into its snapshots.
    pub fn into_parts(self) -> (EventKind, Option<KeyValue>, Option<KeyValue>) {
        (self.kind, self.previous, self.current)
    }

    /// Rebuilds an event from parts, applying `f` to each snapshot.
    ///
    /// Used by the façade to run the inverse value transform and strip the
    /// key prefix while keeping the kind/snapshot shape intact.
    pub(crate) fn try_map<E>(
        self,
        mut f: impl FnMut(KeyValue) -> std::result::Result<KeyValue, E>,
    ) -> std::result::Result<Self, E> {
        Ok(Self {
            kind: self.kind,
            previous: self.previous.map(&mut f).transpose()?,
            current: self.current.map(&mut f).transpose()?,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
