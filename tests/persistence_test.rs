mod common;

use common::{note, profile, profile_key, temp_db_path, ALICE};
use nestdb::{Error, EventBuilder, EventStore, Filter, Kind, StoreConfig, ViewState};

#[test]
fn hybrid_store_survives_reopen() {
    let (_dir, path) = temp_db_path("hybrid.db");

    let (n1, current) = {
        let store = EventStore::open(&path, StoreConfig::default()).unwrap();
        let n1 = store.add(note(ALICE, 100, "n1")).unwrap().0;
        store.add(profile(ALICE, 1000, "a")).unwrap();
        let current = store.add(profile(ALICE, 2000, "b")).unwrap().0;
        store.close().unwrap();
        (n1, current)
    };

    let store = EventStore::open(&path, StoreConfig::default()).unwrap();
    assert_eq!(store.len().unwrap(), 3);
    assert_eq!(store.get(&n1.id).unwrap().unwrap().content, "n1");
    assert_eq!(
        store.get_replaceable(&profile_key(ALICE)).unwrap().unwrap().id,
        current.id
    );
    assert_eq!(
        store.get_replaceable_history(&profile_key(ALICE)).unwrap().len(),
        2
    );

    // Reopened events start unclaimed
    assert_eq!(store.unclaimed().unwrap().len(), 3);
}

#[test]
fn sqlite_store_answers_queries_like_memory() {
    let (_dir, path) = temp_db_path("direct.db");
    let sqlite = EventStore::open_sqlite(&path, StoreConfig::default()).unwrap();
    let memory = EventStore::in_memory();

    let events = vec![
        note(ALICE, 3000, "late"),
        note(ALICE, 1000, "early"),
        note(ALICE, 2000, "middle"),
        EventBuilder::new(Kind::TEXT_NOTE, ALICE)
            .created_at(1500)
            .tag(["t", "rust"])
            .build(),
        profile(ALICE, 10, "p1"),
        profile(ALICE, 20, "p2"),
    ];
    for event in events {
        sqlite.add(event.clone()).unwrap();
        memory.add(event).unwrap();
    }

    let filter_sets = vec![
        vec![Filter::new().kinds([1u16])],
        vec![Filter::new().kinds([1u16]).limit(2)],
        vec![Filter::new().tag('t', ["rust"])],
        vec![Filter::new().since(1500).until(2000)],
        vec![Filter::new().kinds([0u16]), Filter::new().authors([ALICE]).kinds([1u16])],
    ];
    for filters in &filter_sets {
        for include_old in [false, true] {
            let from_sql: Vec<_> = sqlite
                .query_timeline(filters, include_old)
                .unwrap()
                .iter()
                .map(|e| e.id.clone())
                .collect();
            let from_memory: Vec<_> = memory
                .query_timeline(filters, include_old)
                .unwrap()
                .iter()
                .map(|e| e.id.clone())
                .collect();
            assert_eq!(from_sql, from_memory, "{filters:?} include_old={include_old}");
        }
    }
}

#[test]
fn views_work_over_durable_backends() {
    let (_dir, path) = temp_db_path("views.db");
    let store = EventStore::open(&path, StoreConfig::default()).unwrap();
    let a = store.add(profile(ALICE, 1000, "a")).unwrap().0;
    let b = store.add(profile(ALICE, 2000, "b")).unwrap().0;

    let mut view = store.replaceable_view(profile_key(ALICE)).unwrap();
    assert_eq!(view.current(), ViewState::Current(b.clone()));

    store.remove(&b.id).unwrap();
    view.sync().unwrap();
    assert_eq!(view.current(), ViewState::Current(a));
}

#[test]
fn deletions_are_remembered_across_reopen() {
    let (_dir, path) = temp_db_path("deletions.db");
    let target = note(ALICE, 10, "regret");

    {
        let store = EventStore::open(&path, StoreConfig::default()).unwrap();
        store.add(target.clone()).unwrap();
        store
            .add(
                EventBuilder::new(Kind::DELETION, ALICE)
                    .created_at(20)
                    .tag(["e", target.id.as_str()])
                    .build(),
            )
            .unwrap();
        assert!(!store.has(&target.id).unwrap());
    }

    let store = EventStore::open(&path, StoreConfig::default()).unwrap();
    assert!(matches!(store.add(target), Err(Error::Rejected { .. })));
}

#[test]
fn closed_store_rejects_everything() {
    let (_dir, path) = temp_db_path("closed.db");
    let store = EventStore::open_sqlite(&path, StoreConfig::default()).unwrap();
    store.close().unwrap();
    store.close().unwrap();

    assert!(matches!(store.add(note(ALICE, 1, "n")), Err(Error::Closed)));
    assert!(matches!(store.query(&[Filter::new()]), Err(Error::Closed)));
    assert!(matches!(store.event_view("x"), Err(Error::Closed)));
}
