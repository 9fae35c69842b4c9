//! # Async API for kvsql
//!
//! [`Store`] is the only type a collaborator needs. It composes the
//! synchronous [`RecordStore`] and the [`WatchHub`] behind an async contract:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Async Tasks                            │
//! └───────────────┬───────────────────────────────┬───────────────┘
//!                 │ get/list/create/update/delete │ watch(prefix)
//!                 ▼                               ▼
//!     ┌───────────────────────┐        ┌─────────────────────┐
//!     │ key prefix + value    │        │ Watch               │
//!     │ transform (to_storage)│        │ (from_storage on    │
//!     └──────────┬────────────┘        │  every snapshot)    │
//!                │ spawn_blocking      └──────────▲──────────┘
//!                ▼                                │
//!     ┌───────────────────────┐  publish  ┌───────┴─────────┐
//!     │ RecordStore (r2d2)    │──────────▶│ WatchHub        │
//!     └───────────────────────┘           └─────────────────┘
//! ```
//!
//! ## Why spawn_blocking?
//!
//! rusqlite is synchronous and a write may wait up to the busy timeout for
//! the database lock. Running each call on tokio's blocking pool keeps that
//! wait off the async workers.
//!
//! ## Cancellation
//!
//! Dropping the future of a mutating call stops the caller from waiting, but
//! the blocking transaction runs to its end: it either commits (and emits its
//! event) or rolls back. There is never a partial write.
//!
//! ## Rust Concepts
//!
//! - **`Arc<dyn Trait>`**: the transformer is chosen at runtime and shared
//!   between the store and every watch
//! - **`futures::Stream`**: [`Watch`] can be driven with `StreamExt`

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, trace};

use crate::config::StoreConfig;
use crate::error::{BackendError, Error, Result};
use crate::record::{EventSink, PoolStats, RecordStore};
use crate::transform::{IdentityTransformer, ValueTransformer};
use crate::types::{ChangeEvent, KeyValue, Revision};
use crate::watch::{Subscription, WatchHub};

// =============================================================================
// Codec
// =============================================================================

/// Key prefixing plus the value transform, shared by the store and watches.
#[derive(Clone)]
struct Codec {
    transformer: Arc<dyn ValueTransformer>,
    key_prefix: Arc<str>,
}

impl Codec {
    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn encode(&self, key: &str, value: &[u8]) -> Result<Vec<u8>> {
        self.transformer.to_storage(key, value)
    }

    fn decode(&self, mut kv: KeyValue) -> Result<KeyValue> {
        if let Some(stripped) = kv.key.strip_prefix(&*self.key_prefix) {
            kv.key = stripped.to_string();
        }
        kv.value = self.transformer.from_storage(&kv.key, &kv.value)?;
        Ok(kv)
    }

    /// Turns a stored snapshot into the caller's view without decoding,
    /// for snapshots whose plain value the caller just supplied.
    fn with_plain_value(&self, mut kv: KeyValue, key: &str, value: Vec<u8>) -> KeyValue {
        kv.key = key.to_string();
        kv.value = value;
        kv
    }

    fn decode_event(&self, event: ChangeEvent) -> Result<ChangeEvent> {
        event.try_map(|kv| self.decode(kv))
    }
}

// =============================================================================
// Diagnostics
// =============================================================================

/// Watch hub counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchStats {
    /// Registered watches.
    pub subscribers: usize,
    /// Times the event queue overflowed and every watch was closed.
    pub overflows: u64,
    /// Watches evicted for falling behind.
    pub evictions: u64,
}

// =============================================================================
// Store
// =============================================================================

struct StoreInner {
    /// `None` after shutdown; dropping it releases the pool once in-flight
    /// calls finish.
    records: RwLock<Option<RecordStore>>,
    hub: Arc<WatchHub>,
    codec: Codec,
    closed: AtomicBool,
}

/// Versioned, watchable key-value store.
///
/// # Thread Safety
///
/// `Store` is `Clone`, `Send`, and `Sync`. All clones share the same pool
/// and watch hub.
///
/// # Example
///
/// ```rust,no_run
/// use kvsql::{Revision, Store, StoreConfig};
///
/// # async fn example() -> kvsql::Result<()> {
/// let store = Store::open(StoreConfig::sqlite("kv.db")).await?;
///
/// let kv = store.create("a/1", b"x").await?;
/// let (_, kv) = store.update("a/1", b"y", kv.revision).await?;
/// assert_eq!(kv.revision, Revision::from_raw(2));
///
/// let mut watch = store.watch("a/")?;
/// store.delete("a/1", Some(kv.revision)).await?;
/// let event = watch.next().await.unwrap()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("key_prefix", &&*self.inner.codec.key_prefix)
            .field("hub", &self.inner.hub)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Store {
    /// Opens a store with values stored as-is.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_transformer(config, Arc::new(IdentityTransformer)).await
    }

    /// Opens a private in-memory store.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory()).await
    }

    /// Opens a store that passes every value through `transformer`.
    ///
    /// Must be called from within a tokio runtime; the watch hub's dispatch
    /// task is spawned on it.
    pub async fn open_with_transformer(
        config: StoreConfig,
        transformer: Arc<dyn ValueTransformer>,
    ) -> Result<Self> {
        config.validate()?;

        let hub = Arc::new(WatchHub::start(
            config.event_queue_size,
            config.watcher_buffer_size,
        )?);
        let sink: Arc<dyn EventSink> = hub.clone();

        let key_prefix: Arc<str> = Arc::from(config.key_prefix.as_str());
        let dsn = config.dsn.clone();

        let opened = tokio::task::spawn_blocking(move || RecordStore::open(&config, sink))
            .await
            .map_err(task_failed)
            .and_then(|r| r);

        let records = match opened {
            Ok(records) => records,
            Err(e) => {
                hub.shutdown().await;
                return Err(e);
            }
        };

        info!(dsn = %dsn, key_prefix = %key_prefix, "store opened");

        Ok(Self {
            inner: Arc::new(StoreInner {
                records: RwLock::new(Some(records)),
                hub,
                codec: Codec {
                    transformer,
                    key_prefix,
                },
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Runs `f` against the record store on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&RecordStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let records = self.inner.records.read().clone().ok_or(Error::Closed)?;
        tokio::task::spawn_blocking(move || f(&records))
            .await
            .map_err(task_failed)?
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Returns the record for `key`, or `None` if there is none.
    pub async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        let storage_key = self.inner.codec.storage_key(key);
        let record = self.blocking(move |records| records.get(&storage_key)).await?;
        record.map(|kv| self.inner.codec.decode(kv)).transpose()
    }

    /// Returns every record under `prefix`, ordered by key.
    pub async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let storage_prefix = self.inner.codec.storage_key(prefix);
        let records = self.blocking(move |records| records.list(&storage_prefix)).await?;
        records
            .into_iter()
            .map(|kv| self.inner.codec.decode(kv))
            .collect()
    }

    /// Returns how many records live under `prefix`.
    pub async fn count(&self, prefix: &str) -> Result<u64> {
        let storage_prefix = self.inner.codec.storage_key(prefix);
        self.blocking(move |records| records.count(&storage_prefix)).await
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Creates `key` at revision 1.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the key already has a record.
    pub async fn create(&self, key: &str, value: impl AsRef<[u8]>) -> Result<KeyValue> {
        let value = value.as_ref().to_vec();
        let stored = self.inner.codec.encode(key, &value)?;
        let storage_key = self.inner.codec.storage_key(key);

        let kv = self
            .blocking(move |records| records.create(&storage_key, &stored))
            .await?;
        Ok(self.inner.codec.with_plain_value(kv, key, value))
    }

    /// Like [`create`](Self::create); the TTL is accepted but not enforced.
    pub async fn create_with_ttl(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        ttl: Duration,
    ) -> Result<KeyValue> {
        trace!(key, ttl_ms = ttl.as_millis() as u64, "ttl ignored on create");
        self.create(key, value).await
    }

    /// Replaces the value of `key` if its revision is still `expected`.
    ///
    /// Returns the record before and after the write.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the key has no record
    /// - [`Error::RevisionConflict`] if `expected` is stale
    /// - [`Error::Transform`] if the stored value cannot be decoded; nothing
    ///   is written
    pub async fn update(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        expected: Revision,
    ) -> Result<(KeyValue, KeyValue)> {
        let value = value.as_ref().to_vec();
        let stored = self.inner.codec.encode(key, &value)?;
        let storage_key = self.inner.codec.storage_key(key);

        let codec = self.inner.codec.clone();
        let (previous, current) = self
            .blocking(move |records| {
                records.update_with(&storage_key, &stored, expected, |previous| {
                    codec.decode(previous.clone())
                })
            })
            .await?;

        let current = self.inner.codec.with_plain_value(current, key, value);
        Ok((previous, current))
    }

    /// Like [`update`](Self::update); the TTL is accepted but not enforced.
    pub async fn update_with_ttl(
        &self,
        key: &str,
        value: impl AsRef<[u8]>,
        expected: Revision,
        ttl: Duration,
    ) -> Result<(KeyValue, KeyValue)> {
        trace!(key, ttl_ms = ttl.as_millis() as u64, "ttl ignored on update");
        self.update(key, value, expected).await
    }

    /// Deletes `key`, optionally only at revision `expected`.
    ///
    /// Returns the deleted record.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the key has no record or `expected` is stale
    /// - [`Error::Transform`] if the stored value cannot be decoded; nothing
    ///   is deleted
    pub async fn delete(&self, key: &str, expected: Option<Revision>) -> Result<KeyValue> {
        let storage_key = self.inner.codec.storage_key(key);
        let codec = self.inner.codec.clone();
        self.blocking(move |records| {
            records.delete_with(&storage_key, expected, |previous| codec.decode(previous.clone()))
        })
        .await
    }

    // =========================================================================
    // Watch
    // =========================================================================

    /// Streams changes to keys under `prefix`, starting now.
    ///
    /// There is no replay: to get a consistent view, watch first, then list.
    /// When the watch ends (`None`), re-list and watch again.
    pub fn watch(&self, prefix: &str) -> Result<Watch> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let subscription = self.inner.hub.subscribe(self.inner.codec.storage_key(prefix))?;
        debug!(prefix, subscriber_id = subscription.id(), "watch opened");

        Ok(Watch {
            prefix: prefix.to_string(),
            subscription,
            codec: self.inner.codec.clone(),
        })
    }

    // =========================================================================
    // Lifecycle & Diagnostics
    // =========================================================================

    /// Closes every watch and releases the connection pool.
    ///
    /// Later calls on any clone fail with [`Error::Closed`]. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // In-flight calls hold their own clone; the pool goes when they finish.
        let records = self.inner.records.write().take();
        self.inner.hub.shutdown().await;
        drop(records);

        info!("store shut down");
    }

    /// True after [`shutdown`](Self::shutdown).
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Watch hub counters.
    pub fn watch_stats(&self) -> WatchStats {
        let hub = &self.inner.hub;
        WatchStats {
            subscribers: hub.subscriber_count(),
            overflows: hub.overflow_count(),
            evictions: hub.evicted_count(),
        }
    }

    /// Connection pool occupancy.
    pub fn pool_stats(&self) -> Result<PoolStats> {
        let records = self.inner.records.read();
        records.as_ref().map(RecordStore::pool_stats).ok_or(Error::Closed)
    }
}

fn task_failed(err: tokio::task::JoinError) -> Error {
    Error::StoreUnavailable(BackendError::Task(err.to_string()))
}

// =============================================================================
// Watch
// =============================================================================

/// Live, non-restartable feed of changes under a prefix.
///
/// Yields `Some(Ok(event))` per change, `Some(Err(_))` if a value cannot be
/// decoded, and `None` once the watch is closed: by [`close`](Self::close),
/// by falling too far behind, or by store shutdown. The cause is not
/// reported; after `None`, re-list and watch again.
pub struct Watch {
    prefix: String,
    subscription: Subscription,
    codec: Codec,
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("prefix", &self.prefix)
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl Watch {
    /// The watched prefix, as given to [`Store::watch`].
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Waits for the next change.
    pub async fn next(&mut self) -> Option<Result<ChangeEvent>> {
        let event = self.subscription.recv().await?;
        Some(self.codec.decode_event(event))
    }

    /// Returns a buffered change without waiting.
    ///
    /// `Ok(None)` if nothing is buffered, `Err(Error::Closed)` once the
    /// watch has ended.
    pub fn try_next(&mut self) -> Result<Option<ChangeEvent>> {
        match self.subscription.try_recv() {
            Ok(event) => self.codec.decode_event(event).map(Some),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Closed),
        }
    }

    /// Stops the watch. Nothing is delivered afterwards.
    pub fn close(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl Stream for Watch {
    type Item = Result<ChangeEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.subscription.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(this.codec.decode_event(event))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::PrefixTransformer;
    use crate::types::EventKind;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_basic_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();

        let kv = store.create("a/1", b"x").await.unwrap();
        assert_eq!(kv.key, "a/1");
        assert_eq!(kv.value, b"x");
        assert_eq!(kv.revision, Revision::FIRST);

        let got = store.get("a/1").await.unwrap().unwrap();
        assert_eq!(got, kv);
        assert!(store.get("a/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_key_prefix_is_hidden() {
        let config = StoreConfig::in_memory().with_key_prefix("/registry/");
        let store = Store::open(config).await.unwrap();

        store.create("pods/a", b"1").await.unwrap();
        store.create("pods/b", b"2").await.unwrap();

        let keys: Vec<_> = store
            .list("pods/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["pods/a", "pods/b"]);
        assert_eq!(store.count("").await.unwrap(), 2);

        let records = store.inner.records.read().clone().unwrap();
        let raw = records.get("/registry/pods/a").unwrap().unwrap();
        assert_eq!(raw.value, b"1");
    }

    #[tokio::test]
    async fn test_transformer_applied_both_ways() {
        let store = Store::open_with_transformer(
            StoreConfig::in_memory(),
            Arc::new(PrefixTransformer::tag_only(b"t:".to_vec())),
        )
        .await
        .unwrap();

        let created = store.create("k", b"plain").await.unwrap();
        assert_eq!(created.value, b"plain");

        let records = store.inner.records.read().clone().unwrap();
        assert_eq!(records.get("k").unwrap().unwrap().value, b"t:plain");

        let (prev, cur) = store.update("k", b"next", created.revision).await.unwrap();
        assert_eq!(prev.value, b"plain");
        assert_eq!(cur.value, b"next");
        assert_eq!(store.get("k").await.unwrap().unwrap().value, b"next");
    }

    #[tokio::test]
    async fn test_watch_decodes_events() {
        let config = StoreConfig::in_memory().with_key_prefix("p/");
        let store = Store::open_with_transformer(
            config,
            Arc::new(PrefixTransformer::tag_only(b"t:".to_vec())),
        )
        .await
        .unwrap();

        let mut watch = store.watch("a/").unwrap();
        store.create("a/1", b"x").await.unwrap();

        let event = watch.next().await.unwrap().unwrap();
        assert_eq!(event.kind(), EventKind::Created);
        assert_eq!(event.key(), "a/1");
        assert_eq!(event.current().unwrap().value, b"x");
    }

    #[tokio::test]
    async fn test_watch_as_stream_and_close() {
        let store = Store::open_in_memory().await.unwrap();
        let mut watch = store.watch("").unwrap();

        let kv = store.create("k", b"1").await.unwrap();
        store.delete("k", Some(kv.revision)).await.unwrap();

        let first = watch.next().await.unwrap().unwrap();
        let second = StreamExt::next(&mut watch).await.unwrap().unwrap();
        assert_eq!(first.kind(), EventKind::Created);
        assert_eq!(second.kind(), EventKind::Deleted);
        assert_eq!(second.previous().unwrap().value, b"1");

        assert!(watch.try_next().unwrap().is_none());
        watch.close();
        assert!(matches!(watch.try_next(), Err(Error::Closed)));
        assert_eq!(store.watch_stats().subscribers, 0);
    }

    #[tokio::test]
    async fn test_ttl_variants_do_not_expire() {
        let store = Store::open_in_memory().await.unwrap();
        let kv = store
            .create_with_ttl("lease", b"1", Duration::from_millis(1))
            .await
            .unwrap();
        store
            .update_with_ttl("lease", b"2", kv.revision, Duration::from_millis(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("lease").await.unwrap().unwrap().value, b"2");
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let store = Store::open_in_memory().await.unwrap();
        let mut watch = store.watch("").unwrap();
        let clone = store.clone();

        store.shutdown().await;

        assert!(store.is_closed());
        assert!(watch.next().await.is_none());
        assert!(matches!(clone.get("k").await, Err(Error::Closed)));
        assert!(matches!(clone.create("k", b"v").await, Err(Error::Closed)));
        assert!(matches!(store.watch(""), Err(Error::Closed)));
        assert!(matches!(store.pool_stats(), Err(Error::Closed)));

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_rejects_bad_config() {
        let err = Store::open(StoreConfig::new("mysql", "dsn")).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
