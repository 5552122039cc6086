//! Integration tests for ordered views observing a database.

use parking_lot::Mutex;
use realtree_collection::{
    CollectionElement, CollectionError, CollectionEvent, CollectionItem, Explorer,
    OrderedRemoteCollection, SortedCollectionView,
};
use realtree_core::{CoreError, InMemoryDatabase, Node, TransactionState};
use realtree_testkit::prelude::*;
use std::sync::Arc;

fn list() -> Node {
    Node::root().child("list")
}

fn item(key: &str, priority: i64) -> CollectionItem {
    CollectionItem::new(key).with_priority(priority)
}

fn seeded(priorities: &[i64]) -> Arc<InMemoryDatabase> {
    let db = Arc::new(InMemoryDatabase::new());
    let values: Vec<(String, realtree_core::DatabaseValue)> = priorities
        .iter()
        .map(|p| (format!("list/k{p}"), item(&format!("k{p}"), *p).encode()))
        .collect();
    let values: Vec<(&str, realtree_core::DatabaseValue)> =
        values.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    seed(db.as_ref(), &values);
    db
}

fn priorities(view: &SortedCollectionView<CollectionItem>) -> Vec<i64> {
    view.elements().iter().map(CollectionItem::priority).collect()
}

#[test]
fn added_child_reports_its_sorted_index() {
    init_test_logging();
    let db = seeded(&[1, 3, 5, 7]);
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::new(db.clone(), list(), Explorer::view(true));
    let changes = view.subscribe();

    view.run_observing().unwrap();
    assert_eq!(changes.try_recv().unwrap(), Ok(CollectionEvent::Initial));
    assert!(view.is_synced());
    assert_eq!(priorities(&view), vec![1, 3, 5, 7]);

    let txn = transaction_for(&db);
    txn.add_value(&list().child("k4"), item("k4", 4).encode())
        .unwrap();
    assert!(commit_and_wait(&txn).is_success());

    assert_eq!(
        changes.try_recv().unwrap(),
        Ok(CollectionEvent::inserted(vec![2]))
    );
    assert!(changes.try_recv().is_err());
    assert_eq!(priorities(&view), vec![1, 3, 4, 5, 7]);
}

#[test]
fn removals_and_changes_follow_the_database() {
    let db = seeded(&[1, 3, 5, 7]);
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::new(db.clone(), list(), Explorer::view(true));
    view.run_observing().unwrap();
    let changes = view.subscribe();

    let txn = transaction_for(&db);
    txn.remove_value(&list().child("k3")).unwrap();
    assert!(commit_and_wait(&txn).is_success());
    assert_eq!(
        changes.try_recv().unwrap(),
        Ok(CollectionEvent::deleted(vec![1]))
    );

    let txn = transaction_for(&db);
    txn.add_value(&list().child("k1"), item("k1", 6).encode())
        .unwrap();
    assert!(commit_and_wait(&txn).is_success());
    assert_eq!(
        changes.try_recv().unwrap(),
        Ok(CollectionEvent::moved(vec![(0, 1)]))
    );
    assert_eq!(priorities(&view), vec![5, 6, 7]);
}

#[test]
fn stop_observing_detaches_listeners() {
    let db = seeded(&[1, 2]);
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::new(db.clone(), list(), Explorer::default());
    view.run_observing().unwrap();
    assert_eq!(db.observer_count(&list()), 3);
    assert!(view.is_observed());

    view.stop_observing();
    assert_eq!(db.observer_count(&list()), 0);
    assert!(!view.is_observed());
    assert!(!view.is_synced());
}

#[test]
fn keep_synced_survives_stop_observing() {
    let db = seeded(&[1]);
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::new(db.clone(), list(), Explorer::default());
    view.keep_synced(true).unwrap();
    view.stop_observing();
    assert!(view.is_observed());

    view.keep_synced(false).unwrap();
    assert!(!view.is_observed());
}

#[test]
fn dropping_the_view_removes_its_observers() {
    let db = seeded(&[1]);
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::new(db.clone(), list(), Explorer::default());
    view.run_observing().unwrap();
    drop(view);
    assert_eq!(db.observer_count(&list()), 0);
}

#[test]
fn lookups_ask_the_database() {
    let db = seeded(&[1, 2]);
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::new(db.clone(), list(), Explorer::default());

    let found = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&found);
    view.contains_key("k2", move |result| sink.lock().push(result));
    let sink = Arc::clone(&found);
    view.contains_key("k9", move |result| sink.lock().push(result));
    assert_eq!(*found.lock(), vec![Ok(true), Ok(false)]);

    let loaded = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&loaded);
    view.item("k1", move |result| *sink.lock() = Some(result));
    let element = loaded.lock().take().unwrap().unwrap().unwrap();
    assert_eq!(element.key(), "k1");
    assert_eq!(element.priority(), 1);
}

#[test]
fn lookups_time_out_on_a_silent_database() {
    let db = Arc::new(MockDatabase::new());
    db.set_silent(true);
    let view: Arc<SortedCollectionView<CollectionItem>> = SortedCollectionView::with_config(
        db.clone(),
        Some(list()),
        Explorer::default(),
        realtree_core::RealtimeConfig::new().load_timeout(std::time::Duration::from_millis(10)),
    );
    let (sender, receiver) = std::sync::mpsc::channel();
    view.contains_key("k1", move |result| {
        let _ = sender.send(result);
    });
    let result = receiver
        .recv_timeout(std::time::Duration::from_secs(5))
        .unwrap();
    assert_eq!(result, Err(CollectionError::Core(CoreError::Timeout)));
}

#[test]
fn pending_lookup_is_answered_by_a_later_write() {
    let db = Arc::new(MockDatabase::new());
    db.defer_loads(true);
    let view: Arc<SortedCollectionView<CollectionItem>> = SortedCollectionView::with_config(
        db.clone(),
        Some(list()),
        Explorer::default(),
        realtree_core::RealtimeConfig::new().load_timeout(std::time::Duration::from_secs(5)),
    );
    let (sender, receiver) = std::sync::mpsc::channel();
    view.item("k3", move |result| {
        let _ = sender.send(result);
    });
    assert_eq!(db.cache().observer_count(&list().child("k3")), 1);

    seed(db.as_ref(), &[("list/k3", item("k3", 3).encode())]);

    let element = receiver
        .recv_timeout(std::time::Duration::from_secs(1))
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(element.key(), "k3");
    assert_eq!(db.cache().observer_count(&list().child("k3")), 0);
}

#[test]
fn detached_view_is_written_through_a_transaction() {
    let db = Arc::new(MockDatabase::new());
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::detached(db.clone(), Explorer::default());
    view.insert(item("b", 2)).unwrap();
    view.insert(item("a", 1)).unwrap();

    let txn = transaction_for(&db);
    txn.set(Arc::clone(&view), &list()).unwrap();
    assert!(view.is_empty());
    assert!(commit_and_wait(&txn).is_success());

    assert_eq!(OrderedRemoteCollection::node(view.as_ref()), Some(list()));
    assert!(db.snapshot(&list().child("a")).exists());
    view.run_observing().unwrap();
    assert_eq!(view.keys(), vec!["a", "b"]);
}

#[test]
fn failed_write_restores_local_elements() {
    let db = Arc::new(MockDatabase::new());
    db.fail_values(CoreError::commit("denied"));
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::detached(db.clone(), Explorer::default());
    view.insert(item("a", 1)).unwrap();
    let changes = view.subscribe();

    let txn = transaction_for(&db);
    txn.set(Arc::clone(&view), &list()).unwrap();
    let outcome = commit_and_wait(&txn);
    assert_eq!(outcome.state, TransactionState::Failed);

    assert_eq!(view.keys(), vec!["a"]);
    assert_eq!(view.node(), None);
    assert_eq!(
        changes.try_iter().collect::<Vec<_>>(),
        vec![
            Ok(CollectionEvent::deleted(vec![0])),
            Ok(CollectionEvent::Initial)
        ]
    );
}

#[test]
fn collections_share_one_interface() {
    let db = seeded(&[1, 2, 3]);
    let view: Arc<SortedCollectionView<CollectionItem>> =
        SortedCollectionView::new(db, list(), Explorer::view(false));
    let collection: Arc<dyn OrderedRemoteCollection<Element = CollectionItem>> = view;
    collection.run_observing().unwrap();
    assert_eq!(collection.len(), 3);
    assert!(!collection.is_empty());
    assert_eq!(collection.element(0).map(|e| e.priority()), Some(3));
}
