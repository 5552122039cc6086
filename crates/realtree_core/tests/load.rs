//! Integration tests for one-shot loads with timeout.

use realtree_core::{load_with_timeout, CoreError, Node, RealtimeDatabase, Snapshot};
use realtree_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

enum LoadResult {
    Data(Snapshot),
    Cancelled(CoreError),
}

fn start_load(db: &Arc<MockDatabase>, node: &Node, timeout: Duration) -> oneshot::Receiver<LoadResult> {
    let (sender, receiver) = oneshot::channel();
    let sender = Arc::new(parking_lot::Mutex::new(Some(sender)));
    let on_data = Arc::clone(&sender);
    let database: Arc<dyn RealtimeDatabase> = db.clone();
    load_with_timeout(
        &database,
        node,
        timeout,
        Box::new(move |snapshot| {
            if let Some(sender) = on_data.lock().take() {
                let _ = sender.send(LoadResult::Data(snapshot));
            }
        }),
        Some(Box::new(move |error| {
            if let Some(sender) = sender.lock().take() {
                let _ = sender.send(LoadResult::Cancelled(error));
            }
        })),
    );
    receiver
}

#[tokio::test]
async fn load_returns_data_stored_before_the_call() {
    let db = Arc::new(MockDatabase::new());
    let node = Node::root().child("config/theme");
    seed(db.as_ref(), &[("config/theme", "light".into())]);

    let receiver = start_load(&db, &node, Duration::from_millis(50));
    match receiver.await.unwrap() {
        LoadResult::Data(snapshot) => assert_eq!(snapshot.value, Some("light".into())),
        LoadResult::Cancelled(error) => panic!("unexpected cancel: {error}"),
    }
    assert_eq!(db.cache().observer_count(&node), 0);
}

#[tokio::test]
async fn load_of_a_missing_location_answers_without_waiting() {
    let db = Arc::new(MockDatabase::new());
    let node = Node::root().child("missing");
    let receiver = start_load(&db, &node, Duration::from_secs(5));
    match receiver.await.unwrap() {
        LoadResult::Data(snapshot) => assert!(!snapshot.exists()),
        LoadResult::Cancelled(error) => panic!("unexpected cancel: {error}"),
    }
    assert_eq!(db.cache().observer_count(&node), 0);
}

#[tokio::test]
async fn load_completes_with_first_delivery_and_detaches() {
    let db = Arc::new(MockDatabase::new());
    db.defer_loads(true);
    let node = Node::root().child("config/theme");
    let receiver = start_load(&db, &node, Duration::from_secs(5));
    assert_eq!(db.cache().observer_count(&node), 1);

    seed(db.as_ref(), &[("config/theme", "dark".into())]);

    match receiver.await.unwrap() {
        LoadResult::Data(snapshot) => assert_eq!(snapshot.value, Some("dark".into())),
        LoadResult::Cancelled(error) => panic!("unexpected cancel: {error}"),
    }
    assert_eq!(db.cache().observer_count(&node), 0);
}

#[tokio::test]
async fn load_times_out_once() {
    let db = Arc::new(MockDatabase::new());
    db.defer_loads(true);
    let node = Node::root().child("never");
    let receiver = start_load(&db, &node, Duration::from_millis(20));

    match receiver.await.unwrap() {
        LoadResult::Cancelled(error) => assert_eq!(error, CoreError::Timeout),
        LoadResult::Data(_) => panic!("no data was written"),
    }
    assert_eq!(db.cache().observer_count(&node), 0);

    seed(db.as_ref(), &[("never", 1i64.into())]);
}

#[test]
fn load_without_runtime_uses_helper_thread() {
    let db = Arc::new(MockDatabase::new());
    db.set_silent(true);
    let receiver = start_load(&db, &Node::root().child("slow"), Duration::from_millis(10));
    match receiver.blocking_recv().unwrap() {
        LoadResult::Cancelled(error) => assert_eq!(error, CoreError::Timeout),
        LoadResult::Data(_) => panic!("silent database delivered data"),
    }
}
