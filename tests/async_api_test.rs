mod common;

use std::time::Duration;

use common::{note, profile, profile_key, temp_db_path, ALICE, BOB};
use nestdb::{
    ErasedView, Error, EventStore, Filter, ModelOutput, ModelRegistry, Pointer, StoreConfig,
    StoreHandle, ViewState,
};
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_keep_replaceable_and_timeline_consistent() {
    let (_dir, path) = temp_db_path("concurrent.db");
    let store = EventStore::open(&path, StoreConfig::default()).unwrap();
    let handle = StoreHandle::spawn(store.clone()).unwrap();
    let mut timeline = store
        .timeline_view(vec![Filter::new().kinds([1u16])])
        .unwrap();

    let mut tasks = Vec::new();
    for worker in 0..4u64 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25u64 {
                let t = worker * 100 + i;
                handle.add(note(ALICE, t, &format!("n{t}"))).await.unwrap();
                handle.add(profile(BOB, t, &format!("p{t}"))).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let current = handle
        .get_replaceable(profile_key(BOB))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.created_at, 324);

    let by_pointer = handle
        .get_by_pointer(Pointer::from(profile_key(BOB)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_pointer.id, current.id);

    timeline.sync().unwrap();
    let queried: Vec<_> = handle
        .query_timeline(vec![Filter::new().kinds([1u16])], false)
        .await
        .unwrap()
        .iter()
        .map(|e| e.id.clone())
        .collect();
    assert_eq!(queried.len(), 100);
    assert_eq!(timeline.current().ids(), queried);

    handle.close().await.unwrap();
}

#[tokio::test]
async fn handle_prunes_and_reports_closed() {
    let handle = StoreHandle::spawn(EventStore::in_memory()).unwrap();
    for t in 0..5 {
        handle.add(note(ALICE, t, "n")).await.unwrap();
    }
    let view = handle
        .store()
        .timeline_view(vec![Filter::new().kinds([1u16]).limit(2)])
        .unwrap();

    assert_eq!(handle.prune(100).await.unwrap(), 3);
    assert_eq!(handle.query(vec![Filter::new()]).await.unwrap().len(), 2);
    drop(view);
    assert_eq!(handle.prune(100).await.unwrap(), 2);
    assert_eq!(handle.prune_expired().await.unwrap(), 0);

    handle.close().await.unwrap();
    assert!(matches!(
        handle.add(note(ALICE, 9, "late")).await,
        Err(Error::Closed)
    ));
}

#[tokio::test]
async fn registry_views_follow_the_store() {
    let store = EventStore::in_memory();
    let registry = ModelRegistry::with_defaults();

    let mut profile_view = registry
        .open(
            &store,
            "replaceable",
            &json!({ "address": format!("0:{ALICE}:") }),
        )
        .unwrap();
    let mut timeline_view = registry
        .open(
            &store,
            "timeline",
            &json!({ "filters": [{ "kinds": [1], "authors": [ALICE] }] }),
        )
        .unwrap();
    assert_eq!(
        profile_view.current(),
        ModelOutput::State(ViewState::Missing)
    );

    let p = store.add(profile(ALICE, 1, "a")).unwrap().0;
    let n = store.add(note(ALICE, 2, "n")).unwrap().0;
    store.add(note(BOB, 3, "other")).unwrap();

    assert!(profile_view.sync().unwrap());
    assert!(timeline_view.sync().unwrap());
    assert_eq!(
        profile_view.current(),
        ModelOutput::State(ViewState::Current(p))
    );
    match timeline_view.current() {
        ModelOutput::Timeline(snapshot) => assert_eq!(snapshot.ids(), vec![n.id.clone()]),
        other => panic!("unexpected output {other:?}"),
    }
    assert_eq!(timeline_view.version(), 1);
}

#[tokio::test]
async fn feed_subscription_waits_for_changes() {
    let store = EventStore::in_memory();
    let mut sub = store.subscribe().with_filters(vec![Filter::new().kinds([1u16])]);

    let writer = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.add(profile(ALICE, 1, "skipped")).unwrap();
        writer.add(note(ALICE, 2, "wanted")).unwrap();
    });

    let change = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(change.event.content, "wanted");
    assert_eq!(change.seq.as_raw(), 2);
}
