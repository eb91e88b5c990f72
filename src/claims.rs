//! # Claim Tracker
//!
//! Claims pin events in memory while something is using them. The tracker is a
//! side table next to the index, never a field on the event:
//!
//! ```text
//! claims   HashMap<EventId, HashSet<ClaimId>>   many-to-many pins
//! recency  LruCache<EventId, ()>                every tracked event, by last touch
//! ```
//!
//! An eviction sweep asks for [`ClaimTracker::unclaimed`] and gets a snapshot
//! of tracked ids with no live claim, least recently touched first. Claims
//! added after the snapshot was taken don't change it, so the sweep has to
//! re-check `is_claimed` before it actually evicts (the store's `prune` does).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;

use crate::types::EventId;

// =============================================================================
// Claim Ids
// =============================================================================

/// Opaque handle identifying one consumer (a view, a query holder).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimId(u64);

static NEXT_CLAIM_ID: AtomicU64 = AtomicU64::new(1);

impl ClaimId {
    /// Allocates a process-unique claim id.
    pub fn next() -> Self {
        Self(NEXT_CLAIM_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Creates a claim id from a caller-chosen value.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "claim-{}", self.0)
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Reference counting for stored events.
///
/// Not synchronized itself; the store keeps it behind its own mutex so claim
/// traffic from views never waits on index writes.
pub struct ClaimTracker {
    claims: HashMap<EventId, HashSet<ClaimId>>,
    recency: LruCache<EventId, ()>,
}

impl fmt::Debug for ClaimTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimTracker")
            .field("claimed", &self.claims.len())
            .field("tracked", &self.recency.len())
            .finish()
    }
}

impl Default for ClaimTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaimTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            claims: HashMap::new(),
            recency: LruCache::unbounded(),
        }
    }

    /// Starts tracking a stored event (as most recently used).
    pub fn track(&mut self, id: &EventId) {
        self.recency.put(id.clone(), ());
    }

    /// Stops tracking an event that left the store. Its claims go with it.
    pub fn forget(&mut self, id: &EventId) {
        self.recency.pop(id);
        self.claims.remove(id);
    }

    /// Adds `claim` to `id`. Adding the same claim twice is a no-op.
    ///
    /// Ids that aren't tracked (never stored, or already forgotten) can't be
    /// pinned; returns false for them.
    pub fn claim(&mut self, id: &EventId, claim: ClaimId) -> bool {
        if !self.recency.contains(id) {
            return false;
        }
        self.claims.entry(id.clone()).or_default().insert(claim);
        true
    }

    /// Removes `claim` from `id`. Removing an absent claim is a no-op.
    pub fn remove_claim(&mut self, id: &EventId, claim: ClaimId) {
        if let Some(set) = self.claims.get_mut(id) {
            set.remove(&claim);
            if set.is_empty() {
                self.claims.remove(id);
            }
        }
    }

    /// Removes `claim` from every event it pins. Returns how many it pinned.
    pub fn clear_claims(&mut self, claim: ClaimId) -> usize {
        let mut released = 0;
        self.claims.retain(|_, set| {
            if set.remove(&claim) {
                released += 1;
            }
            !set.is_empty()
        });
        released
    }

    /// True if at least one claim pins `id`.
    pub fn is_claimed(&self, id: &EventId) -> bool {
        self.claims.contains_key(id)
    }

    /// Number of distinct claims on `id`.
    pub fn claim_count(&self, id: &EventId) -> usize {
        self.claims.get(id).map_or(0, HashSet::len)
    }

    /// Marks `id` as recently used. Unknown ids are ignored.
    pub fn touch(&mut self, id: &EventId) {
        self.recency.promote(id);
    }

    /// Snapshot of tracked events with no claims, least recently used first.
    pub fn unclaimed(&self) -> Vec<EventId> {
        self.recency
            .iter()
            .rev()
            .filter(|(id, _)| !self.claims.contains_key(*id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of tracked events.
    pub fn tracked(&self) -> usize {
        self.recency.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EventId {
        EventId::new(s)
    }

    fn tracker_with(ids: &[&str]) -> ClaimTracker {
        let mut tracker = ClaimTracker::new();
        for i in ids {
            tracker.track(&id(i));
        }
        tracker
    }

    #[test]
    fn test_claim_pins_event() {
        let mut tracker = tracker_with(&["a", "b"]);
        let view = ClaimId::next();

        tracker.claim(&id("a"), view);
        assert!(tracker.is_claimed(&id("a")));
        assert_eq!(tracker.unclaimed(), vec![id("b")]);

        tracker.remove_claim(&id("a"), view);
        assert!(!tracker.is_claimed(&id("a")));
        assert_eq!(tracker.unclaimed().len(), 2);
    }

    #[test]
    fn test_claims_are_idempotent() {
        let mut tracker = tracker_with(&["a"]);
        let view = ClaimId::next();

        tracker.claim(&id("a"), view);
        tracker.claim(&id("a"), view);
        assert_eq!(tracker.claim_count(&id("a")), 1);

        tracker.remove_claim(&id("a"), view);
        tracker.remove_claim(&id("a"), view);
        tracker.remove_claim(&id("missing"), view);
        assert_eq!(tracker.claim_count(&id("a")), 0);
    }

    #[test]
    fn test_other_claims_keep_pin() {
        let mut tracker = tracker_with(&["a"]);
        let first = ClaimId::next();
        let second = ClaimId::next();

        tracker.claim(&id("a"), first);
        tracker.claim(&id("a"), second);
        tracker.remove_claim(&id("a"), first);

        assert!(tracker.is_claimed(&id("a")));
        assert!(tracker.unclaimed().is_empty());
    }

    #[test]
    fn test_unclaimed_is_lru_ordered_snapshot() {
        let mut tracker = tracker_with(&["a", "b", "c"]);
        tracker.touch(&id("a"));

        let snapshot = tracker.unclaimed();
        assert_eq!(snapshot, vec![id("b"), id("c"), id("a")]);

        // Later claims don't alter a taken snapshot
        tracker.claim(&id("b"), ClaimId::next());
        assert_eq!(snapshot.len(), 3);
        assert_eq!(tracker.unclaimed(), vec![id("c"), id("a")]);
    }

    #[test]
    fn test_clear_claims_and_forget() {
        let mut tracker = tracker_with(&["a", "b"]);
        let view = ClaimId::next();
        tracker.claim(&id("a"), view);
        tracker.claim(&id("b"), view);

        assert_eq!(tracker.clear_claims(view), 2);
        assert!(!tracker.is_claimed(&id("a")));

        tracker.forget(&id("a"));
        assert_eq!(tracker.tracked(), 1);
        assert_eq!(tracker.unclaimed(), vec![id("b")]);
    }

    #[test]
    fn test_untracked_ids_cannot_be_claimed() {
        let mut tracker = tracker_with(&["a"]);
        let view = ClaimId::next();

        assert!(!tracker.claim(&id("never-stored"), view));
        assert!(!tracker.is_claimed(&id("never-stored")));

        assert!(tracker.claim(&id("a"), view));
        tracker.forget(&id("a"));
        assert!(!tracker.claim(&id("a"), view));
        assert_eq!(tracker.clear_claims(view), 0);
    }
}
