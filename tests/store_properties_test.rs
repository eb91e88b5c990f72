mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::{note, profile, profile_key, ALICE, BOB};
use nestdb::{
    ChangeKind, ClaimId, Error, Event, EventBackend, EventBuilder, EventId, EventStore, Filter,
    Kind, MemoryIndex, ReplaceableKey, StoreConfig,
};

#[test]
fn duplicate_insert_returns_stored_instance_and_notifies_once() {
    let store = EventStore::in_memory();
    let mut sub = store.subscribe();
    let event = note(ALICE, 100, "hello");

    let (first, first_new) = store.add(event.clone()).unwrap();
    let (second, second_new) = store.add(event).unwrap();

    assert!(first_new);
    assert!(!second_new);
    assert!(Arc::ptr_eq(&first, &second));

    let change = sub.try_next().unwrap().unwrap();
    assert_eq!(change.kind, ChangeKind::Inserted);
    assert_eq!(change.event.id, first.id);
    assert!(sub.try_next().is_none());
}

#[test]
fn latest_version_wins_in_every_insertion_order() {
    let orders: [[u64; 3]; 6] = [
        [1000, 2000, 3000],
        [1000, 3000, 2000],
        [2000, 1000, 3000],
        [2000, 3000, 1000],
        [3000, 1000, 2000],
        [3000, 2000, 1000],
    ];
    for order in orders {
        let store = EventStore::in_memory();
        for created_at in order {
            store.add(profile(ALICE, created_at, "x")).unwrap();
        }
        let current = store.get_replaceable(&profile_key(ALICE)).unwrap().unwrap();
        assert_eq!(current.created_at, 3000, "order {order:?}");

        let history = store.get_replaceable_history(&profile_key(ALICE)).unwrap();
        let stamps: Vec<u64> = history.iter().map(|e| e.created_at).collect();
        assert_eq!(stamps, vec![3000, 2000, 1000], "order {order:?}");
    }
}

#[test]
fn older_version_does_not_regress_current() {
    let store = EventStore::in_memory();
    let newer = store.add(profile(ALICE, 2000, "new")).unwrap().0;
    store.add(profile(ALICE, 1000, "old")).unwrap();
    assert_eq!(
        store.get_replaceable(&profile_key(ALICE)).unwrap().unwrap().id,
        newer.id
    );
}

#[test]
fn removal_falls_back_to_next_latest() {
    let store = EventStore::in_memory();
    let a = store.add(profile(ALICE, 1000, "a")).unwrap().0;
    let b = store.add(profile(ALICE, 2000, "b")).unwrap().0;

    assert!(store.remove(&a.id).unwrap());
    assert_eq!(store.get_replaceable(&profile_key(ALICE)).unwrap().unwrap().id, b.id);

    let store = EventStore::in_memory();
    let a = store.add(profile(ALICE, 1000, "a")).unwrap().0;
    let b = store.add(profile(ALICE, 2000, "b")).unwrap().0;

    assert!(store.remove(&b.id).unwrap());
    assert_eq!(store.get_replaceable(&profile_key(ALICE)).unwrap().unwrap().id, a.id);
    assert!(store.remove(&a.id).unwrap());
    assert!(store.get_replaceable(&profile_key(ALICE)).unwrap().is_none());
}

#[test]
fn filters_or_across_list_and_within_one_filter() {
    let store = EventStore::in_memory();
    let alice_profile = store.add(profile(ALICE, 1, "a")).unwrap().0;
    let bob_profile = store.add(profile(BOB, 1, "b")).unwrap().0;
    let alice_note = store.add(note(ALICE, 2, "n")).unwrap().0;
    store
        .add(EventBuilder::new(Kind::CONTACTS, ALICE).created_at(3).build())
        .unwrap();

    let mut either = store
        .query(&[Filter::new().kinds([0u16]), Filter::new().kinds([1u16])])
        .unwrap()
        .iter()
        .map(|e| e.id.clone())
        .collect::<Vec<_>>();
    either.sort();
    let mut expected = vec![
        alice_profile.id.clone(),
        bob_profile.id.clone(),
        alice_note.id.clone(),
    ];
    expected.sort();
    assert_eq!(either, expected);

    let both = store
        .query(&[Filter::new().kinds([0u16]).authors([ALICE])])
        .unwrap();
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].id, alice_profile.id);
}

#[test]
fn empty_kind_list_matches_nothing() {
    let store = EventStore::in_memory();
    store.add(note(ALICE, 1, "n")).unwrap();
    store.add(profile(ALICE, 1, "p")).unwrap();

    let empty: [u16; 0] = [];
    assert!(store.query(&[Filter::new().kinds(empty)]).unwrap().is_empty());
    assert_eq!(store.query(&[Filter::new()]).unwrap().len(), 2);
    assert!(store.query(&[]).unwrap().is_empty());
}

#[test]
fn timeline_is_most_recent_first() {
    let store = EventStore::in_memory();
    for created_at in [1000, 3000, 2000] {
        store.add(note(ALICE, created_at, "n")).unwrap();
    }
    let timeline = store
        .query_timeline(&[Filter::new().kinds([1u16])], false)
        .unwrap();
    let stamps: Vec<u64> = timeline.iter().map(|e| e.created_at).collect();
    assert_eq!(stamps, vec![3000, 2000, 1000]);
}

#[test]
fn claimed_events_are_not_unclaimed() {
    let store = EventStore::in_memory();
    let event = store.add(note(ALICE, 1, "n")).unwrap().0;
    let c1 = ClaimId::next();
    let c2 = ClaimId::next();

    store.claim(&event.id, c1);
    store.claim(&event.id, c2);
    assert!(!store.unclaimed().unwrap().iter().any(|e| e.id == event.id));

    store.remove_claim(&event.id, c1);
    assert!(!store.unclaimed().unwrap().iter().any(|e| e.id == event.id));

    store.remove_claim(&event.id, c2);
    assert!(store.unclaimed().unwrap().iter().any(|e| e.id == event.id));
}

#[test]
fn subscribers_see_inserts_in_order_from_attach_point() {
    let store = EventStore::in_memory();
    let mut early = store.subscribe();

    let ids: Vec<_> = (1..=3)
        .map(|i| store.add(note(ALICE, i, "n")).unwrap().0.id.clone())
        .collect();
    let mut late = store.subscribe();

    let mut seen = Vec::new();
    let mut last_seq = None;
    while let Some(change) = early.try_next() {
        let change = change.unwrap();
        assert_eq!(change.kind, ChangeKind::Inserted);
        if let Some(prev) = last_seq {
            assert!(change.seq > prev);
        }
        last_seq = Some(change.seq);
        seen.push(change.event.id.clone());
    }
    assert_eq!(seen, ids);
    assert!(late.try_next().is_none());
}

#[test]
fn profile_update_scenario() {
    let store = EventStore::in_memory();
    store.add(profile(ALICE, 1000, "a")).unwrap();
    store.add(profile(ALICE, 2000, "b")).unwrap();

    let current = store.get_replaceable(&profile_key(ALICE)).unwrap().unwrap();
    assert_eq!(current.content, r#"{"name":"b"}"#);
}

#[test]
fn prune_evicts_least_recently_used_unclaimed_first() {
    let store = EventStore::in_memory();
    let old = store.add(note(ALICE, 1, "old")).unwrap().0;
    let used = store.add(note(ALICE, 2, "used")).unwrap().0;
    let pinned = store.add(note(ALICE, 3, "pinned")).unwrap().0;
    store.claim(&pinned.id, ClaimId::next());

    // Reading promotes
    store.get(&old.id).unwrap();

    assert_eq!(store.prune(1).unwrap(), 1);
    assert!(!store.has(&used.id).unwrap());
    assert!(store.has(&old.id).unwrap());

    assert_eq!(store.prune(10).unwrap(), 1);
    assert!(store.has(&pinned.id).unwrap());
    assert_eq!(store.len().unwrap(), 1);
}

#[test]
fn malformed_filters_fail_before_reading() {
    let store = EventStore::in_memory();
    let bad = Filter::new().tag('1', ["x"]);
    assert!(matches!(
        store.query(&[bad.clone()]),
        Err(Error::MalformedFilter(_))
    ));
    assert!(matches!(
        store.timeline_view(vec![bad]),
        Err(Error::MalformedFilter(_))
    ));
}

// =============================================================================
// Backend Failures
// =============================================================================

/// Memory backend whose removals fail while `failing` is set.
struct FlakyRemovals {
    inner: MemoryIndex,
    failing: Arc<AtomicBool>,
}

impl EventBackend for FlakyRemovals {
    fn add(&mut self, event: Event) -> nestdb::Result<(Arc<Event>, bool)> {
        self.inner.add(event)
    }

    fn remove(&mut self, id: &EventId) -> nestdb::Result<Option<Arc<Event>>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Backend("disk full".to_string()));
        }
        self.inner.remove(id)
    }

    fn get(&self, id: &EventId) -> nestdb::Result<Option<Arc<Event>>> {
        self.inner.get(id)
    }

    fn get_replaceable(&self, key: &ReplaceableKey) -> nestdb::Result<Option<Arc<Event>>> {
        self.inner.get_replaceable(key)
    }

    fn get_replaceable_history(&self, key: &ReplaceableKey) -> nestdb::Result<Vec<Arc<Event>>> {
        self.inner.get_replaceable_history(key)
    }

    fn query(&self, filters: &[Filter]) -> nestdb::Result<Vec<Arc<Event>>> {
        self.inner.query(filters)
    }

    fn query_timeline(
        &self,
        filters: &[Filter],
        include_old_versions: bool,
    ) -> nestdb::Result<Vec<Arc<Event>>> {
        self.inner.query_timeline(filters, include_old_versions)
    }

    fn len(&self) -> nestdb::Result<usize> {
        self.inner.len()
    }

    fn all(&self) -> nestdb::Result<Vec<Arc<Event>>> {
        self.inner.all()
    }

    fn close(&mut self) -> nestdb::Result<()> {
        self.inner.close()
    }
}

fn flaky_store() -> (EventStore, Arc<AtomicBool>) {
    let failing = Arc::new(AtomicBool::new(false));
    let backend = FlakyRemovals {
        inner: MemoryIndex::new(),
        failing: failing.clone(),
    };
    (EventStore::new(backend, StoreConfig::default()).unwrap(), failing)
}

#[test]
fn failed_removal_surfaces_and_publishes_nothing() {
    let (store, failing) = flaky_store();
    let event = store.add(note(ALICE, 1, "n")).unwrap().0;
    let mut sub = store.subscribe();

    failing.store(true, Ordering::SeqCst);
    assert!(matches!(store.remove(&event.id), Err(Error::Backend(_))));
    assert!(store.has(&event.id).unwrap());
    assert!(sub.try_next().is_none());

    failing.store(false, Ordering::SeqCst);
    assert!(store.remove(&event.id).unwrap());
    assert_eq!(sub.try_next().unwrap().unwrap().kind, ChangeKind::Removed);
}

#[test]
fn failed_deletion_is_reported_to_the_caller() {
    let (store, failing) = flaky_store();
    let target = store.add(note(ALICE, 1, "regret")).unwrap().0;
    let deletion = EventBuilder::new(Kind::DELETION, ALICE)
        .created_at(2)
        .tag(["e", target.id.as_str()])
        .build();

    failing.store(true, Ordering::SeqCst);
    assert!(matches!(store.add(deletion.clone()), Err(Error::Backend(_))));

    // The deletion itself went in; its target is still there to retry on
    assert!(store.has(&deletion.id).unwrap());
    assert!(store.has(&target.id).unwrap());

    failing.store(false, Ordering::SeqCst);
    assert!(store.remove(&target.id).unwrap());
    assert!(matches!(
        store.add((*target).clone()),
        Err(Error::Rejected { .. })
    ));
}
