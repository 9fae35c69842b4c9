//! # Watch Hub
//!
//! In-process fan-out of committed changes to prefix-scoped subscribers.
//!
//! ```text
//! Write path (under the commit-order guard):
//!   RecordStore::commit_and_publish() -> publish() -> try_send(event queue)
//!                                                          ↓
//! Dispatch task:
//!   queue.recv() -> walk registry -> try_send(per-subscriber channel)
//!                                                          ↓
//! Subscriber:
//!   Subscription::recv().await
//! ```
//!
//! ## Ordering
//!
//! `publish` runs while the record store holds its commit-order guard, so the
//! queue holds events in commit order. A single dispatch task drains it, so
//! every subscriber sees that same order.
//!
//! ## No Replay
//!
//! Every published event gets a sequence number. A subscription remembers the
//! next sequence number at registration and ignores anything older, so events
//! published before `subscribe` returns are never delivered to it, even if
//! they were still queued.
//!
//! ## Backpressure
//!
//! - Subscriber buffer full: that subscriber is evicted (channel closed,
//!   registration removed). Others keep receiving.
//! - Event queue full: a committed event cannot be dropped silently, so every
//!   current subscriber is closed and must re-list. The write itself still
//!   succeeds.
//!
//! Subscribers see both cases, and an orderly unsubscribe, only as the
//! channel closing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::record::EventSink;
use crate::types::ChangeEvent;
use crate::{Error, Result};

/// Default capacity of the queue between commits and dispatch.
pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1000;

/// Default per-subscriber buffer.
pub const DEFAULT_WATCHER_BUFFER_SIZE: usize = 100;

// =============================================================================
// Internal State
// =============================================================================

struct Sequenced {
    seq: u64,
    event: ChangeEvent,
}

#[derive(Debug)]
struct Subscriber {
    id: u64,
    /// Events with a lower sequence number predate this subscriber.
    start_seq: u64,
    sender: mpsc::Sender<ChangeEvent>,
}

struct HubInner {
    /// prefix -> subscribers registered under it
    registry: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    closed: AtomicBool,
    overflow_count: AtomicU64,
    evicted_count: AtomicU64,
    watcher_buffer_size: usize,
}

impl HubInner {
    fn remove(&self, prefix: &str, id: u64) -> bool {
        let mut registry = self.registry.lock();
        let Some(subscribers) = registry.get_mut(prefix) else {
            return false;
        };

        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            registry.remove(prefix);
        }
        removed
    }

    fn dispatch(&self, item: Sequenced) {
        let key = item.event.key();
        let mut evicted = 0u64;
        let mut delivered = 0usize;

        let mut registry = self.registry.lock();
        registry.retain(|prefix, subscribers| {
            if !key.starts_with(prefix.as_str()) {
                return true;
            }

            subscribers.retain(|sub| {
                if item.seq < sub.start_seq {
                    return true;
                }
                match sub.sender.try_send(item.event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(TrySendError::Full(_)) => {
                        warn!(
                            subscriber_id = sub.id,
                            prefix = %prefix,
                            "subscriber buffer full, evicting"
                        );
                        evicted += 1;
                        false
                    }
                    // Receiver dropped without unsubscribing yet.
                    Err(TrySendError::Closed(_)) => false,
                }
            });

            !subscribers.is_empty()
        });
        drop(registry);

        if evicted > 0 {
            self.evicted_count.fetch_add(evicted, Ordering::Relaxed);
        }

        trace!(
            seq = item.seq,
            key,
            kind = %item.event.kind(),
            delivered,
            "event dispatched"
        );
    }
}

// =============================================================================
// Watch Hub
// =============================================================================

/// Event bus between the record store and watchers.
///
/// Implements [`EventSink`], so the record store publishes into it without
/// knowing anything else about it.
pub struct WatchHub {
    inner: Arc<HubInner>,
    queue: mpsc::Sender<Sequenced>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl std::fmt::Debug for WatchHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHub")
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl WatchHub {
    /// Creates the hub and spawns its dispatch task on the current runtime.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if called outside a tokio runtime or with a zero
    /// capacity.
    pub fn start(event_queue_size: usize, watcher_buffer_size: usize) -> Result<Self> {
        if event_queue_size == 0 || watcher_buffer_size == 0 {
            return Err(Error::Config("watch hub capacities must be at least 1".into()));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("watch hub requires a tokio runtime: {e}")))?;

        let inner = Arc::new(HubInner {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            overflow_count: AtomicU64::new(0),
            evicted_count: AtomicU64::new(0),
            watcher_buffer_size,
        });

        let (queue, mut events) = mpsc::channel::<Sequenced>(event_queue_size);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let dispatch_inner = inner.clone();
        let handle = runtime.spawn(async move {
            debug!("watch dispatcher started");

            loop {
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => {
                        // Deliver what was committed before shutdown.
                        while let Ok(item) = events.try_recv() {
                            dispatch_inner.dispatch(item);
                        }
                        break;
                    }
                    item = events.recv() => match item {
                        Some(item) => dispatch_inner.dispatch(item),
                        None => break,
                    },
                }
            }

            debug!("watch dispatcher stopped");
        });

        Ok(Self {
            inner,
            queue,
            dispatcher: Mutex::new(Some(handle)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Registers a watcher for every key starting with `prefix`.
    ///
    /// Only events published after this call returns are delivered.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] after [`shutdown`](Self::shutdown).
    pub fn subscribe(&self, prefix: impl Into<String>) -> Result<Subscription> {
        let prefix = prefix.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.inner.watcher_buffer_size);

        {
            let mut registry = self.inner.registry.lock();
            // Checked under the lock so shutdown's clear cannot miss us.
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::Closed);
            }
            let start_seq = self.inner.next_seq.load(Ordering::SeqCst);
            registry.entry(prefix.clone()).or_default().push(Subscriber {
                id,
                start_seq,
                sender,
            });
        }

        trace!(subscriber_id = id, prefix = %prefix, "subscribed");

        Ok(Subscription {
            id,
            prefix,
            receiver,
            hub: self.inner.clone(),
            closed: false,
        })
    }

    /// Removes a subscription. Equivalent to dropping it.
    pub fn unsubscribe(&self, mut subscription: Subscription) {
        subscription.unsubscribe();
    }

    /// Stops dispatch and closes every subscription.
    ///
    /// Events already queued are delivered first. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }

        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "watch dispatcher task failed");
            }
        }

        let closed = {
            let mut registry = self.inner.registry.lock();
            let n: usize = registry.values().map(Vec::len).sum();
            registry.clear();
            n
        };

        debug!(closed_subscribers = closed, "watch hub shut down");
    }

    /// True once [`shutdown`](Self::shutdown) has started.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().values().map(Vec::len).sum()
    }

    /// How many times the event queue overflowed.
    pub fn overflow_count(&self) -> u64 {
        self.inner.overflow_count.load(Ordering::Relaxed)
    }

    /// How many subscribers were evicted for a full buffer.
    pub fn evicted_count(&self) -> u64 {
        self.inner.evicted_count.load(Ordering::Relaxed)
    }

    fn close_all_subscribers(&self) -> usize {
        let mut registry = self.inner.registry.lock();
        let n = registry.values().map(Vec::len).sum();
        registry.clear();
        n
    }
}

impl EventSink for WatchHub {
    fn publish(&self, event: ChangeEvent) {
        if self.is_closed() {
            trace!(key = event.key(), "hub closed, event not queued");
            return;
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        match self.queue.try_send(Sequenced { seq, event }) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                let closed = self.close_all_subscribers();
                self.inner.overflow_count.fetch_add(1, Ordering::Relaxed);
                error!(
                    seq,
                    key = item.event.key(),
                    closed_subscribers = closed,
                    "watch event queue full, closed all subscribers"
                );
            }
            Err(TrySendError::Closed(item)) => {
                debug!(seq, key = item.event.key(), "dispatcher gone, event not queued");
            }
        }
    }
}

impl Drop for WatchHub {
    // Without a prior shutdown: stop dispatch at once and close every
    // subscription. Queued events are discarded.
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            let closed = self.close_all_subscribers();
            debug!(closed_subscribers = closed, "watch hub dropped");
        }
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// A live feed of changes under one prefix.
///
/// Unsubscribes when dropped. After [`unsubscribe`](Self::unsubscribe),
/// `recv` returns `None` even if events were still buffered.
pub struct Subscription {
    id: u64,
    prefix: String,
    receiver: mpsc::Receiver<ChangeEvent>,
    hub: Arc<HubInner>,
    closed: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("prefix", &self.prefix)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Subscription {
    /// Unique id within the hub.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The watched prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Waits for the next event. `None` once the subscription is closed and
    /// drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        if self.closed {
            return None;
        }
        self.receiver.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> std::result::Result<ChangeEvent, TryRecvError> {
        if self.closed {
            return Err(TryRecvError::Disconnected);
        }
        self.receiver.try_recv()
    }

    /// Poll-based receive, for `Stream` adapters.
    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<ChangeEvent>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }

    /// Removes the registration. Nothing is delivered after this returns.
    pub fn unsubscribe(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.receiver.close();
        if self.hub.remove(&self.prefix, self.id) {
            trace!(subscriber_id = self.id, prefix = %self.prefix, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

// =============================================================================
// Tests
// =============================================================================
