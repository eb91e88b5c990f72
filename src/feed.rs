//! # Change Feed
//!
//! A hot multicast stream of store mutations. Every genuinely new insert and
//! every effective removal is published once, in the order the store applied
//! them:
//!
//! ```text
//!   EventStore (write lock held)
//!        │ apply to backend
//!        │ publish(Inserted | Removed)  ──► seq = head + 1
//!        ▼
//!   broadcast::Sender<StoreChange>
//!        ├──► FeedSubscription (view A)
//!        ├──► FeedSubscription (view B)
//!        └──► FeedSubscription (bench reader)
//! ```
//!
//! ## No Replay
//!
//! A subscriber only sees changes published after it subscribed. To build
//! state it must query first and then subscribe, with no mutation in between.
//! `EventStore::snapshot_and_subscribe` does both under the store lock and
//! returns the feed head, so the first change the subscriber receives is
//! always `head + 1`.
//!
//! ## Backpressure
//!
//! The channel is bounded. A receiver that falls more than `capacity` changes
//! behind gets `Error::SubscriptionLagged(n)`; the reactive views answer this
//! by re-seeding from a fresh snapshot.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::error::{Error, Result};
use crate::filter::{self, Filter};
use crate::types::Event;

/// Default capacity for the broadcast channel.
///
/// Notifications carry an `Arc<Event>`, so a full buffer costs one pointer
/// and a sequence number per slot.
pub const DEFAULT_FEED_CAPACITY: usize = 10_000;

// =============================================================================
// Sequence Numbers
// =============================================================================

/// Position of a change in the store's single global order.
///
/// The first published change has sequence 1; `ChangeSeq::ZERO` means "nothing
/// published yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ChangeSeq(u64);

impl ChangeSeq {
    /// Before the first change.
    pub const ZERO: ChangeSeq = ChangeSeq(0);

    /// Creates a sequence number from its raw value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// The following sequence number.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ChangeSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Notifications
// =============================================================================

/// What happened to the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The event was stored for the first time.
    Inserted,
    /// The event left the store.
    Removed,
}

/// One notification on the change feed.
///
/// Cheap to clone: the event is shared with the store.
#[derive(Debug, Clone)]
pub struct StoreChange {
    /// Position in the global order.
    pub seq: ChangeSeq,
    /// Insert or remove.
    pub kind: ChangeKind,
    /// The stored instance (same `Arc` the store hands out from queries).
    pub event: Arc<Event>,
}

impl StoreChange {
    /// True for `Inserted`.
    pub fn is_insert(&self) -> bool {
        self.kind == ChangeKind::Inserted
    }

    /// True for `Removed`.
    pub fn is_remove(&self) -> bool {
        self.kind == ChangeKind::Removed
    }
}

// =============================================================================
// Change Feed
// =============================================================================

/// Publisher side of the feed. Owned by the store and only touched while the
/// store's write lock is held.
#[derive(Debug)]
pub struct ChangeFeed {
    sender: broadcast::Sender<StoreChange>,
    head: ChangeSeq,
}

impl ChangeFeed {
    /// Creates a feed buffering up to `capacity` changes per slow subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            head: ChangeSeq::ZERO,
        }
    }

    /// Sequence number of the last published change.
    pub fn head(&self) -> ChangeSeq {
        self.head
    }

    /// Returns a subscription that sees every change published from now on.
    pub fn subscribe(&self) -> FeedSubscription {
        FeedSubscription::new(self.sender.subscribe())
    }

    /// Publishes one change and returns its sequence number.
    ///
    /// Publishing with no subscribers still advances the head.
    pub fn publish(&mut self, kind: ChangeKind, event: Arc<Event>) -> ChangeSeq {
        self.head = self.head.next();
        let seq = self.head;
        trace!(%seq, ?kind, id = %event.id, "publishing change");
        // No receivers is not an error for a hot feed.
        let _ = self.sender.send(StoreChange { seq, kind, event });
        seq
    }

    /// Returns the number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Receiver side of the feed, optionally narrowed by a filter list.
///
/// Dropping the subscription unsubscribes synchronously: nothing is buffered
/// for it afterwards.
///
/// # Usage
///
/// ```rust,ignore
/// let mut sub = store.subscribe().with_filters(vec![Filter::new().kinds([1u16])]);
/// while let Some(change) = sub.next().await {
///     match change {
///         Ok(change) if change.is_insert() => println!("new note {}", change.event.id),
///         Ok(_) => {}
///         Err(Error::SubscriptionLagged(n)) => eprintln!("missed {n} changes"),
///         Err(e) => return Err(e),
///     }
/// }
/// ```
#[derive(Debug)]
pub struct FeedSubscription {
    receiver: broadcast::Receiver<StoreChange>,
    filters: Option<Vec<Filter>>,
}

impl FeedSubscription {
    /// Wraps a raw broadcast receiver.
    pub fn new(receiver: broadcast::Receiver<StoreChange>) -> Self {
        Self {
            receiver,
            filters: None,
        }
    }

    /// Only deliver changes whose event matches any of `filters`.
    ///
    /// Sequence numbers of skipped changes are simply not observed.
    pub fn with_filters(mut self, filters: Vec<Filter>) -> Self {
        self.filters = Some(filters);
        self
    }

    fn wanted(&self, change: &StoreChange) -> bool {
        match &self.filters {
            Some(filters) => filter::matches_any(filters, &change.event),
            None => true,
        }
    }

    /// Receives the next change.
    ///
    /// # Returns
    ///
    /// - `Some(Ok(change))` - next change
    /// - `Some(Err(Error::SubscriptionLagged(n)))` - `n` changes were dropped;
    ///   the subscription stays usable and continues with the oldest change
    ///   still buffered
    /// - `None` - the store was dropped
    pub async fn next(&mut self) -> Option<Result<StoreChange>> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => {
                    if self.wanted(&change) {
                        return Some(Ok(change));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next buffered change without waiting.
    ///
    /// `None` means nothing is buffered right now (or the store is gone).
    pub fn try_next(&mut self) -> Option<Result<StoreChange>> {
        loop {
            match self.receiver.try_recv() {
                Ok(change) => {
                    if self.wanted(&change) {
                        return Some(Ok(change));
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(Error::SubscriptionLagged(n)));
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
            }
        }
    }

    /// Number of changes buffered for this subscription, before filtering.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
