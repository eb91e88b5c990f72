//! Live timeline: every event matching a filter list, most recent first.
//!
//! Inserts are placed by binary search on the recency order. For replaceable
//! kinds the model remembers which version of each identity it shows, so a
//! newer version replaces the older entry instead of adding a second one
//! (unless old versions were requested). Removing a shown current version
//! triggers a re-seed, since the next most recent version can only come from
//! the store. With a `limit`, removing from a full timeline re-seeds too, to
//! pull in the next older match.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

use crate::backend::EventBackend;
use crate::error::Result;
use crate::feed::{ChangeKind, StoreChange};
use crate::filter::{self, Filter};
use crate::types::{Event, EventId, ReplaceableKey};

use super::{Model, Reaction};

// =============================================================================
// Output
// =============================================================================

/// An immutable timeline snapshot. Equality compares the id sequence.
#[derive(Debug, Clone, Default)]
pub struct TimelineSnapshot(Arc<Vec<Arc<Event>>>);

impl TimelineSnapshot {
    /// Ids in display order.
    pub fn ids(&self) -> Vec<EventId> {
        self.0.iter().map(|e| e.id.clone()).collect()
    }

    /// Timestamps in display order.
    pub fn timestamps(&self) -> Vec<u64> {
        self.0.iter().map(|e| e.created_at).collect()
    }
}

impl Deref for TimelineSnapshot {
    type Target = [Arc<Event>];

    fn deref(&self) -> &[Arc<Event>] {
        &self.0
    }
}

impl PartialEq for TimelineSnapshot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.len() == other.0.len()
                && self.0.iter().zip(other.0.iter()).all(|(a, b)| a.id == b.id))
    }
}

impl Eq for TimelineSnapshot {}

// =============================================================================
// Model
// =============================================================================

/// Maintains the sorted result of a timeline query.
#[derive(Debug)]
pub struct TimelineModel {
    filters: Vec<Filter>,
    include_old_versions: bool,
    limit: Option<usize>,
    events: Vec<Arc<Event>>,
    /// Shown version per replaceable identity (unused with old versions).
    latest: HashMap<ReplaceableKey, EventId>,
}

impl TimelineModel {
    /// A timeline of `filters`.
    pub fn new(filters: Vec<Filter>, include_old_versions: bool) -> Self {
        let limit = filter::effective_limit(&filters);
        Self {
            filters,
            include_old_versions,
            limit,
            events: Vec::new(),
            latest: HashMap::new(),
        }
    }

    /// The filters this timeline follows.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    fn position(&self, id: &EventId) -> Option<usize> {
        self.events.iter().position(|e| &e.id == id)
    }

    fn insert_sorted(&mut self, event: Arc<Event>) {
        let pos = self
            .events
            .binary_search_by(|probe| event.recency_cmp(probe))
            .unwrap_or_else(|pos| pos);
        self.events.insert(pos, event);
    }

    fn on_insert(&mut self, event: &Arc<Event>) -> Reaction {
        if !filter::matches_any(&self.filters, event) || self.position(&event.id).is_some() {
            return Reaction::Ignored;
        }

        let mut replaces = None;
        if !self.include_old_versions {
            if let Some(key) = event.replaceable_key() {
                if let Some(shown) = self.latest.get(&key).cloned() {
                    let Some(pos) = self.position(&shown) else {
                        // Map and list disagree; rebuild both.
                        return Reaction::Reseed;
                    };
                    if !event.is_newer_than(&self.events[pos]) {
                        return Reaction::Ignored;
                    }
                    self.events.remove(pos);
                }
                replaces = Some(key);
            }
        }

        if let Some(limit) = self.limit {
            let full = self.events.len() >= limit;
            let older_than_all = self
                .events
                .last()
                .is_some_and(|last| !event.is_newer_than(last));
            if full && older_than_all {
                return Reaction::Ignored;
            }
        }

        if let Some(key) = replaces {
            self.latest.insert(key, event.id.clone());
        }
        self.insert_sorted(event.clone());

        if let Some(limit) = self.limit {
            while self.events.len() > limit {
                if let Some(dropped) = self.events.pop() {
                    if let Some(key) = dropped.replaceable_key() {
                        if self.latest.get(&key) == Some(&dropped.id) {
                            self.latest.remove(&key);
                        }
                    }
                }
            }
        }
        Reaction::Updated
    }

    fn on_remove(&mut self, event: &Arc<Event>) -> Reaction {
        let Some(pos) = self.position(&event.id) else {
            return Reaction::Ignored;
        };
        let was_full = self.limit.is_some_and(|limit| self.events.len() >= limit);
        self.events.remove(pos);

        let mut reseed = was_full;
        if !self.include_old_versions {
            if let Some(key) = event.replaceable_key() {
                if self.latest.get(&key) == Some(&event.id) {
                    self.latest.remove(&key);
                    // An older version may now be the one to show.
                    reseed = true;
                }
            }
        }

        if reseed {
            Reaction::Reseed
        } else {
            Reaction::Updated
        }
    }
}

impl Model for TimelineModel {
    type Output = TimelineSnapshot;

    fn seed(&mut self, backend: &dyn EventBackend) -> Result<()> {
        self.events = backend.query_timeline(&self.filters, self.include_old_versions)?;
        self.latest.clear();
        if !self.include_old_versions {
            for event in &self.events {
                if let Some(key) = event.replaceable_key() {
                    self.latest.insert(key, event.id.clone());
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, change: &StoreChange) -> Reaction {
        match change.kind {
            ChangeKind::Inserted => self.on_insert(&change.event),
            ChangeKind::Removed => self.on_remove(&change.event),
        }
    }

    fn output(&self) -> TimelineSnapshot {
        TimelineSnapshot(Arc::new(self.events.clone()))
    }

    fn held(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id.clone()).collect()
    }

    fn reset(&mut self) {
        self.events.clear();
        self.latest.clear();
    }
}
