//! # Storage Backends
//!
//! [`EventBackend`] is the seam between the composed [`crate::store::EventStore`]
//! (locking, change feed, claims, policy) and whatever actually holds events:
//!
//! ```text
//!                  EventStore
//!                      │  &mut dyn EventBackend (under the write lock)
//!        ┌─────────────┼──────────────────┐
//!        ▼             ▼                  ▼
//!   MemoryIndex   SqliteBackend     HybridBackend
//!   (index.rs)    (sqlite.rs)       (memory in front of SQL)
//! ```
//!
//! Backends never publish notifications and never consult claims. They only
//! have to be internally consistent: a failed `add` or `remove` leaves the
//! backend exactly as it was.
//!
//! Reads take `&self` and writes take `&mut self`, so the store can serve many
//! readers at once behind a `RwLock` while writes are exclusive.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::filter::{effective_limit, Filter};
use crate::types::{Event, EventId, ReplaceableKey};

// =============================================================================
// Backend Trait
// =============================================================================

/// Storage for events plus the indexes the store queries through.
pub trait EventBackend: Send + Sync {
    /// Stores `event` unless an event with the same id exists.
    ///
    /// Returns the stored instance and `true` if it was new; for a duplicate,
    /// the previously stored instance and `false`. Replaceable events that are
    /// older than the current version are still stored as history.
    fn add(&mut self, event: Event) -> Result<(Arc<Event>, bool)>;

    /// Removes the event with `id` from every index, returning it if present.
    ///
    /// Removing the current version of a replaceable identity makes the next
    /// most recent retained version current.
    fn remove(&mut self, id: &EventId) -> Result<Option<Arc<Event>>>;

    /// Looks up an event by id.
    fn get(&self, id: &EventId) -> Result<Option<Arc<Event>>>;

    /// True if an event with `id` is stored.
    fn has(&self, id: &EventId) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    /// The current version of a replaceable identity.
    fn get_replaceable(&self, key: &ReplaceableKey) -> Result<Option<Arc<Event>>>;

    /// Every retained version, most recent first.
    fn get_replaceable_history(&self, key: &ReplaceableKey) -> Result<Vec<Arc<Event>>>;

    /// All events matching any filter, capped by the list's effective limit
    /// (most recent kept).
    ///
    /// Callers must treat the result as a set; implementations happen to
    /// return it most recent first.
    fn query(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>>;

    /// Like [`query`](Self::query), sorted by descending `(created_at, id)`.
    ///
    /// Unless `include_old_versions` is set, only the most recent matching
    /// version of each replaceable identity is kept.
    fn query_timeline(
        &self,
        filters: &[Filter],
        include_old_versions: bool,
    ) -> Result<Vec<Arc<Event>>>;

    /// Number of stored events.
    fn len(&self) -> Result<usize>;

    /// True if nothing is stored.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every stored event, in no particular order.
    fn all(&self) -> Result<Vec<Arc<Event>>>;

    /// Releases external resources. Further calls may fail with
    /// `Error::Closed`.
    fn close(&mut self) -> Result<()>;
}

// =============================================================================
// Shared Result Shaping
// =============================================================================
// Every backend produces raw matches and shapes them the same way so that
// ordering and limits can't drift between implementations.

/// Sorts events by descending `(created_at, id)`.
pub fn sort_timeline(events: &mut [Arc<Event>]) {
    events.sort_by(|a, b| b.recency_cmp(a));
}

/// Keeps only the first (most recent) event per replaceable identity.
///
/// Expects `events` sorted by [`sort_timeline`].
pub fn collapse_replaceable(events: Vec<Arc<Event>>) -> Vec<Arc<Event>> {
    let mut seen: HashSet<ReplaceableKey> = HashSet::new();
    events
        .into_iter()
        .filter(|event| match event.replaceable_key() {
            Some(key) => seen.insert(key),
            None => true,
        })
        .collect()
}

/// Turns raw matches into a `query` result.
pub fn shape_query(mut events: Vec<Arc<Event>>, filters: &[Filter]) -> Vec<Arc<Event>> {
    sort_timeline(&mut events);
    if let Some(limit) = effective_limit(filters) {
        events.truncate(limit);
    }
    events
}

/// Turns raw matches into a `query_timeline` result.
pub fn shape_timeline(
    mut events: Vec<Arc<Event>>,
    filters: &[Filter],
    include_old_versions: bool,
) -> Vec<Arc<Event>> {
    sort_timeline(&mut events);
    let mut events = if include_old_versions {
        events
    } else {
        collapse_replaceable(events)
    };
    if let Some(limit) = effective_limit(filters) {
        events.truncate(limit);
    }
    events
}

// =============================================================================
// Tests
// =============================================================================
