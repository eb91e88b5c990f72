//! # In-Memory Event Index
//!
//! [`MemoryIndex`] is the multi-key table behind the default store:
//!
//! ```text
//! events       HashMap<EventId, Arc<Event>>           primary, owns the Arc
//! replaceable  HashMap<ReplaceableKey, Vec<Arc<Event>>>  history, newest first
//! tags         HashMap<(char, String), HashSet<EventId>>  inverted tag index
//! kinds        HashMap<Kind, HashSet<EventId>>
//! authors      HashMap<PubKey, HashSet<EventId>>
//! timeline     BTreeSet<(created_at, EventId)>          time-range scans
//! ```
//!
//! ## Query Planning
//!
//! For each filter the narrowest available index supplies candidates, and
//! every candidate is then checked with [`Filter::matches`]:
//!
//! 1. `ids` - direct lookups
//! 2. tag constraint - union of the posting sets for its values
//! 3. `authors` / `kinds` - whichever posting union is smaller
//! 4. otherwise a range scan of `timeline` between `since` and `until`
//!
//! ## Failure Model
//!
//! Nothing here can fail. A secondary index entry without a matching primary
//! entry is a bug, and hitting one panics.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::ops::Bound;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{self, EventBackend};
use crate::error::Result;
use crate::filter::Filter;
use crate::types::{Event, EventId, Kind, PubKey, ReplaceableKey, Timestamp};

/// The in-memory backend.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    events: HashMap<EventId, Arc<Event>>,
    replaceable: HashMap<ReplaceableKey, Vec<Arc<Event>>>,
    tags: HashMap<(char, String), HashSet<EventId>>,
    kinds: HashMap<Kind, HashSet<EventId>>,
    authors: HashMap<PubKey, HashSet<EventId>>,
    timeline: BTreeSet<(Timestamp, EventId)>,
}

impl MemoryIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an already shared instance.
    ///
    /// Used by the hybrid backend so that the instance it returns is the one
    /// the index holds.
    pub fn insert_arc(&mut self, event: Arc<Event>) -> (Arc<Event>, bool) {
        if let Some(existing) = self.events.get(&event.id) {
            return (existing.clone(), false);
        }

        for (name, value) in event.indexable_tags() {
            self.tags
                .entry((name, value.to_string()))
                .or_default()
                .insert(event.id.clone());
        }
        self.kinds
            .entry(event.kind)
            .or_default()
            .insert(event.id.clone());
        self.authors
            .entry(event.pubkey.clone())
            .or_default()
            .insert(event.id.clone());
        self.timeline.insert((event.created_at, event.id.clone()));

        if let Some(key) = event.replaceable_key() {
            let history = self.replaceable.entry(key).or_default();
            // Newest first; binary search on the reversed recency order.
            let pos = history
                .binary_search_by(|probe| event.recency_cmp(probe))
                .unwrap_or_else(|pos| pos);
            history.insert(pos, event.clone());
            if pos == 0 {
                debug!(id = %event.id, kind = %event.kind, "replaceable event is now current");
            } else {
                debug!(id = %event.id, kind = %event.kind, "older replaceable version kept as history");
            }
        }

        self.events.insert(event.id.clone(), event.clone());
        (event, true)
    }

    fn remove_from_posting<K: Eq + Hash>(
        index: &mut HashMap<K, HashSet<EventId>>,
        key: &K,
        id: &EventId,
        index_name: &str,
    ) {
        let Some(set) = index.get_mut(key) else {
            panic!("{index_name} index has no entry for stored event {id}");
        };
        set.remove(id);
        if set.is_empty() {
            index.remove(key);
        }
    }

    /// Candidate ids for one filter, before exact matching.
    fn candidates(&self, filter: &Filter) -> Vec<Arc<Event>> {
        if let Some(ids) = &filter.ids {
            return ids.iter().filter_map(|id| self.events.get(id).cloned()).collect();
        }

        fn consider<'a>(best: &mut Option<HashSet<&'a EventId>>, set: HashSet<&'a EventId>) {
            if best.as_ref().map_or(true, |b| set.len() < b.len()) {
                *best = Some(set);
            }
        }

        let mut best: Option<HashSet<&EventId>> = None;

        if let Some((name, values)) = filter.tags.iter().next() {
            consider(
                &mut best,
                values
                    .iter()
                    .filter_map(|v| self.tags.get(&(*name, v.clone())))
                    .flatten()
                    .collect(),
            );
        }
        if let Some(authors) = &filter.authors {
            consider(
                &mut best,
                authors
                    .iter()
                    .filter_map(|a| self.authors.get(a))
                    .flatten()
                    .collect(),
            );
        }
        if let Some(kinds) = &filter.kinds {
            consider(
                &mut best,
                kinds
                    .iter()
                    .filter_map(|k| self.kinds.get(k))
                    .flatten()
                    .collect(),
            );
        }

        match best {
            Some(ids) => ids
                .into_iter()
                .map(|id| self.lookup_indexed(id))
                .collect(),
            None => self
                .time_range(filter.since, filter.until)
                .map(|(_, id)| self.lookup_indexed(id))
                .collect(),
        }
    }

    fn lookup_indexed(&self, id: &EventId) -> Arc<Event> {
        match self.events.get(id) {
            Some(event) => event.clone(),
            None => panic!("secondary index references unknown event {id}"),
        }
    }

    fn time_range(
        &self,
        since: Option<Timestamp>,
        until: Option<Timestamp>,
    ) -> impl Iterator<Item = &(Timestamp, EventId)> {
        let lower = match since {
            Some(since) => Bound::Included((since, EventId::new(String::new()))),
            None => Bound::Unbounded,
        };
        let upper = match until.and_then(|u| u.checked_add(1)) {
            Some(next) => Bound::Excluded((next, EventId::new(String::new()))),
            None => Bound::Unbounded,
        };
        self.timeline.range((lower, upper))
    }

    fn matches(&self, filters: &[Filter]) -> Vec<Arc<Event>> {
        let mut found: HashMap<EventId, Arc<Event>> = HashMap::new();
        for filter in filters {
            if filter.matches_nothing() {
                continue;
            }
            for event in self.candidates(filter) {
                if !found.contains_key(&event.id) && filter.matches(&event) {
                    found.insert(event.id.clone(), event);
                }
            }
        }
        found.into_values().collect()
    }
}

impl EventBackend for MemoryIndex {
    fn add(&mut self, event: Event) -> Result<(Arc<Event>, bool)> {
        Ok(self.insert_arc(Arc::new(event)))
    }

    fn remove(&mut self, id: &EventId) -> Result<Option<Arc<Event>>> {
        let Some(event) = self.events.remove(id) else {
            return Ok(None);
        };

        let tag_keys: HashSet<(char, String)> = event
            .indexable_tags()
            .map(|(name, value)| (name, value.to_string()))
            .collect();
        for key in &tag_keys {
            Self::remove_from_posting(&mut self.tags, key, id, "tag");
        }
        Self::remove_from_posting(&mut self.kinds, &event.kind, id, "kind");
        Self::remove_from_posting(&mut self.authors, &event.pubkey, id, "author");
        self.timeline.remove(&(event.created_at, id.clone()));

        if let Some(key) = event.replaceable_key() {
            if let Some(history) = self.replaceable.get_mut(&key) {
                let was_current = history.first().is_some_and(|e| &e.id == id);
                history.retain(|e| &e.id != id);
                if history.is_empty() {
                    self.replaceable.remove(&key);
                    debug!(%id, %key, "last replaceable version removed");
                } else if was_current {
                    debug!(%id, %key, current = %history[0].id, "current replaceable version removed, falling back");
                }
            }
        }

        Ok(Some(event))
    }

    fn get(&self, id: &EventId) -> Result<Option<Arc<Event>>> {
        Ok(self.events.get(id).cloned())
    }

    fn has(&self, id: &EventId) -> Result<bool> {
        Ok(self.events.contains_key(id))
    }

    fn get_replaceable(&self, key: &ReplaceableKey) -> Result<Option<Arc<Event>>> {
        Ok(self
            .replaceable
            .get(key)
            .and_then(|history| history.first().cloned()))
    }

    fn get_replaceable_history(&self, key: &ReplaceableKey) -> Result<Vec<Arc<Event>>> {
        Ok(self.replaceable.get(key).cloned().unwrap_or_default())
    }

    fn query(&self, filters: &[Filter]) -> Result<Vec<Arc<Event>>> {
        Ok(backend::shape_query(self.matches(filters), filters))
    }

    fn query_timeline(
        &self,
        filters: &[Filter],
        include_old_versions: bool,
    ) -> Result<Vec<Arc<Event>>> {
        Ok(backend::shape_timeline(
            self.matches(filters),
            filters,
            include_old_versions,
        ))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.events.len())
    }

    fn all(&self) -> Result<Vec<Arc<Event>>> {
        Ok(self.events.values().cloned().collect())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
