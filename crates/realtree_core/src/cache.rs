//! In-memory implementation of the database and storage contracts.
//!
//! [`InMemoryDatabase`] keeps one staging tree rooted at the database root.
//! Commits merge into it with the incoming value always winning, and every
//! touched location is turned into notifications for registered observers.
//! Observers below a deleted subtree receive its removal as well.
//! Everything completes synchronously, so it doubles as an offline cache and
//! as a test backend.

use crate::config::CachePolicy;
use crate::database::{
    CancelCallback, CancelListener, ChildChange, CommitCompletion, DataEvent, DataListener,
    DataOrdering, FileCompletion, FileLoadCompletion, FilesCompletion, LoadCompletion, PageQuery,
    ObserverToken, RealtimeDatabase, RealtimeStorage, Subscription,
};
use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::snapshot::Snapshot;
use crate::staging::{MergeStrategy, ObjectNode, StagingNode, StagingRef};
use crate::value::DatabaseValue;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

struct Observer {
    token: ObserverToken,
    event: DataEvent,
    on_update: DataListener,
    active: Arc<AtomicBool>,
}

#[derive(Default)]
struct Registry {
    observers: HashMap<Node, Vec<Observer>>,
}

impl Registry {
    fn insert(&mut self, node: Node, observer: Observer) {
        self.observers.entry(node).or_default().push(observer);
    }

    fn remove(&mut self, node: &Node, token: ObserverToken) {
        if let Some(list) = self.observers.get_mut(node) {
            list.retain(|o| {
                let keep = o.token != token;
                if !keep {
                    o.active.store(false, Ordering::Release);
                }
                keep
            });
            if list.is_empty() {
                self.observers.remove(node);
            }
        }
    }

    fn remove_all(&mut self, node: &Node) {
        if let Some(list) = self.observers.remove(node) {
            for o in list {
                o.active.store(false, Ordering::Release);
            }
        }
    }

    fn matching(&self, node: &Node, event: DataEvent) -> Vec<(DataListener, Arc<AtomicBool>)> {
        self.observers
            .get(node)
            .map(|list| {
                list.iter()
                    .filter(|o| o.event == event)
                    .map(|o| (Arc::clone(&o.on_update), Arc::clone(&o.active)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

/// A location touched by a commit, with its value before the commit.
struct Touched {
    node: Node,
    old: Option<DatabaseValue>,
}

#[derive(Default)]
struct ChangeCollector {
    touched: Vec<Touched>,
    appended: HashSet<Node>,
}

impl ChangeCollector {
    fn collect_appended(&mut self, node: &StagingNode) {
        self.appended.insert(node.location().clone());
        match node {
            StagingNode::Object(o) => o.children().iter().for_each(|c| self.collect_appended(c)),
            leaf if !leaf.is_empty() => self.touched.push(Touched {
                node: leaf.location().clone(),
                old: None,
            }),
            _ => {}
        }
    }
}

struct Notification {
    node: Node,
    event: DataEvent,
    snapshot: Snapshot,
}

fn value_at(tree: &ObjectNode, node: &Node) -> Option<DatabaseValue> {
    tree.child_by_node(node).and_then(|n| n.to_wire())
}

/// In-memory realtime database and blob storage.
pub struct InMemoryDatabase {
    tree: RwLock<ObjectNode>,
    registry: Arc<Mutex<Registry>>,
    next_token: AtomicU64,
    connection: watch::Sender<bool>,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    /// Creates an empty database.
    pub fn new() -> Self {
        let (connection, _) = watch::channel(true);
        Self {
            tree: RwLock::new(ObjectNode::new(Node::root())),
            registry: Arc::new(Mutex::new(Registry::default())),
            next_token: AtomicU64::new(1),
            connection,
        }
    }

    /// Removes all data. Observers are kept and not notified.
    pub fn clear(&self) {
        self.tree.write().clear();
    }

    /// Reads a location synchronously.
    pub fn snapshot(&self, node: &Node) -> Snapshot {
        Snapshot::new(node.clone(), value_at(&self.tree.read(), node))
    }

    /// Number of observers registered on a location.
    pub fn observer_count(&self, node: &Node) -> usize {
        self.registry
            .lock()
            .observers
            .get(node)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn register(&self, node: &Node, event: DataEvent, on_update: DataListener) -> ObserverToken {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().insert(
            node.clone(),
            Observer {
                token,
                event,
                on_update,
                active: Arc::new(AtomicBool::new(true)),
            },
        );
        token
    }

    /// Merges `update` and returns the notifications to deliver.
    fn apply(&self, update: &ObjectNode) -> CoreResult<Vec<(Notification, Vec<(DataListener, Arc<AtomicBool>)>)>> {
        let observed = !self.registry.lock().is_empty();
        let collector = RefCell::new(ChangeCollector::default());

        let mut tree = self.tree.write();
        let mut next = tree.clone();
        next.merge(
            StagingNode::Object(update.clone()),
            &mut |old, new| {
                if observed && old != new {
                    collector.borrow_mut().touched.push(Touched {
                        node: new.location().clone(),
                        old: old.to_wire(),
                    });
                }
                MergeStrategy::New
            },
            &mut |_, child| {
                if observed {
                    collector.borrow_mut().collect_appended(child);
                }
            },
        )?;
        next.prune();
        *tree = next;

        let collector = collector.into_inner();
        let registry = self.registry.lock();
        let mut seen = HashSet::new();
        let mut deliveries = Vec::new();
        let mut push = |node: &Node, event: DataEvent, child: Option<&Node>, snapshot: &dyn Fn() -> Snapshot| {
            if !seen.insert((node.clone(), event, child.cloned())) {
                return;
            }
            let listeners = registry.matching(node, event);
            if !listeners.is_empty() {
                let notification = Notification {
                    node: node.clone(),
                    event,
                    snapshot: snapshot(),
                };
                deliveries.push((notification, listeners));
            }
        };

        for touched in &collector.touched {
            push(&touched.node, DataEvent::Value, None, &|| {
                Snapshot::new(touched.node.clone(), value_at(&tree, &touched.node))
            });
            let mut child = touched.node.clone();
            while let Some(parent) = child.parent().cloned() {
                let current = value_at(&tree, &child);
                let change = if tree.child_by_node(&child).is_none() {
                    ChildChange::Removed
                } else if collector.appended.contains(&child) {
                    ChildChange::Added
                } else {
                    ChildChange::Changed
                };
                let old = if child == touched.node {
                    touched.old.clone()
                } else {
                    None
                };
                push(&parent, DataEvent::Child(change), Some(&child), &|| match change {
                    ChildChange::Removed => Snapshot::new(child.clone(), old.clone()),
                    _ => Snapshot::new(child.clone(), current.clone()),
                });
                push(&parent, DataEvent::Value, None, &|| {
                    Snapshot::new(parent.clone(), value_at(&tree, &parent))
                });
                child = parent;
            }
        }

        // observers below a deleted subtree see their location vanish
        let watched: Vec<Node> = registry.observers.keys().cloned().collect();
        for touched in &collector.touched {
            let Some(old) = &touched.old else {
                continue;
            };
            if tree.child_by_node(&touched.node).is_some() {
                continue;
            }
            for node in watched.iter().filter(|n| n.has_ancestor(&touched.node)) {
                let Some(old) = node
                    .after(&touched.node)
                    .iter()
                    .try_fold(old, |value, step| value.get(step.key()))
                else {
                    continue;
                };
                push(node, DataEvent::Value, None, &|| Snapshot::new(node.clone(), None));
                for (key, value) in old.as_map().into_iter().flatten() {
                    let child = node.child(key);
                    push(node, DataEvent::Child(ChildChange::Removed), Some(&child), &|| {
                        Snapshot::new(child.clone(), Some(value.clone()))
                    });
                }
            }
        }
        debug!(
            touched = collector.touched.len(),
            deliveries = deliveries.len(),
            "in-memory commit merged"
        );
        Ok(deliveries)
    }
}

impl RealtimeDatabase for InMemoryDatabase {
    fn generate_auto_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::InMemory
    }

    fn commit(&self, update: &ObjectNode, completion: CommitCompletion) {
        match self.apply(update) {
            Ok(deliveries) => {
                completion(Ok(()));
                for (notification, listeners) in deliveries {
                    for (listener, active) in listeners {
                        if active.load(Ordering::Acquire) {
                            trace!(
                                node = %notification.node,
                                event = %notification.event,
                                "delivering notification"
                            );
                            listener(notification.snapshot.clone(), notification.event);
                        }
                    }
                }
            }
            Err(error) => completion(Err(error)),
        }
    }

    fn load(
        &self,
        node: &Node,
        _timeout: Duration,
        completion: LoadCompletion,
        _on_cancel: Option<CancelCallback>,
    ) {
        let snapshot = self.snapshot(node);
        completion(snapshot);
    }

    fn observe(
        &self,
        event: DataEvent,
        node: &Node,
        on_update: DataListener,
        _on_cancel: Option<CancelListener>,
    ) -> ObserverToken {
        self.register(node, event, on_update)
    }

    fn observe_page(
        &self,
        query: PageQuery,
        on_update: DataListener,
        on_cancel: Option<CancelListener>,
    ) -> Subscription {
        if query.ordering != DataOrdering::Key {
            if let Some(on_cancel) = on_cancel {
                on_cancel(CoreError::unsupported(
                    "in-memory paged queries support key ordering only",
                ));
            }
            return Subscription::empty();
        }

        let limit = query.limit + usize::from(query.is_bounded());
        let children: Vec<(String, DatabaseValue)> = match self.snapshot(&query.node).value {
            Some(DatabaseValue::Map(map)) => map
                .into_iter()
                .filter(|(key, _)| query.contains_key(key))
                .collect(),
            _ => Vec::new(),
        };
        let page: BTreeMap<String, DatabaseValue> = if query.ascending {
            children.into_iter().take(limit).collect()
        } else {
            let skip = children.len().saturating_sub(limit);
            children.into_iter().skip(skip).collect()
        };

        let mut tokens = Vec::new();
        for change in &query.changes {
            let forward = Arc::clone(&on_update);
            let bounds = query.clone();
            let listener: DataListener = Arc::new(move |snapshot: Snapshot, event| {
                if bounds.contains_key(snapshot.key()) {
                    forward(snapshot, event);
                }
            });
            tokens.push(self.register(&query.node, DataEvent::Child(*change), listener));
        }

        let snapshot = if page.is_empty() {
            Snapshot::missing(query.node.clone())
        } else {
            Snapshot::new(query.node.clone(), Some(DatabaseValue::Map(page)))
        };
        on_update(snapshot, DataEvent::Value);

        if tokens.is_empty() {
            return Subscription::empty();
        }
        let registry = Arc::clone(&self.registry);
        let node = query.node;
        Subscription::new(move || {
            let mut registry = registry.lock();
            for token in tokens {
                registry.remove(&node, token);
            }
        })
    }

    fn remove_observer(&self, node: &Node, token: ObserverToken) {
        self.registry.lock().remove(node, token);
    }

    fn remove_all_observers(&self, node: &Node) {
        self.registry.lock().remove_all(node);
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connection.subscribe()
    }

    fn supports_multi_level_writes(&self) -> bool {
        true
    }
}

impl RealtimeStorage for InMemoryDatabase {
    fn load_file(
        &self,
        node: &Node,
        _timeout: Duration,
        completion: FileLoadCompletion,
        on_cancel: Option<CancelCallback>,
    ) -> Subscription {
        if node.is_root() {
            if let Some(on_cancel) = on_cancel {
                on_cancel(CoreError::invalid_operation("cannot load file from root"));
            }
            return Subscription::empty();
        }
        let data = match self.tree.read().child_by_node(node) {
            Some(StagingRef::File(file)) => file.data.clone(),
            _ => None,
        };
        completion(data);
        Subscription::empty()
    }

    fn commit_files(&self, update: &ObjectNode, completion: FilesCompletion) {
        let results = {
            let mut tree = self.tree.write();
            update
                .files()
                .into_iter()
                .map(|file| match tree.graft_file(file.clone()) {
                    Ok(()) => FileCompletion::Meta(file.metadata.clone()),
                    Err(error) => FileCompletion::Error(file.location.clone(), error),
                })
                .collect()
        };
        completion(results);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::FileMetadata;

    fn update(values: &[(&str, Option<DatabaseValue>)]) -> ObjectNode {
        let mut root = ObjectNode::new(Node::root());
        for (path, value) in values {
            root.add_value_as_in_single_transaction(StagingNode::value(
                Node::root().child(path),
                value.clone(),
            ))
            .unwrap();
        }
        root
    }

    fn commit(db: &InMemoryDatabase, values: &[(&str, Option<DatabaseValue>)]) {
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);
        db.commit(
            &update(values),
            Box::new(move |r| *slot.lock() = Some(r)),
        );
        assert_eq!(result.lock().take(), Some(Ok(())));
    }

    fn record(db: &InMemoryDatabase, event: DataEvent, path: &str) -> Arc<Mutex<Vec<Snapshot>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        db.observe(
            event,
            &Node::root().child(path),
            Arc::new(move |s, _| sink.lock().push(s)),
            None,
        );
        log
    }

    #[test]
    fn commit_and_load() {
        let db = InMemoryDatabase::new();
        commit(&db, &[("users/alice/name", Some("Alice".into()))]);

        let loaded = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&loaded);
        db.load(
            &Node::root().child("users/alice"),
            Duration::from_secs(1),
            Box::new(move |s| *slot.lock() = Some(s)),
            None,
        );
        let snapshot = loaded.lock().take().unwrap();
        assert!(snapshot.has_child("name"));
        assert!(!db.snapshot(&Node::root().child("users/bob")).exists());
    }

    #[test]
    fn child_events_reach_parent_observers() {
        let db = InMemoryDatabase::new();
        let added = record(&db, DataEvent::Child(ChildChange::Added), "list");
        let changed = record(&db, DataEvent::Child(ChildChange::Changed), "list");
        let removed = record(&db, DataEvent::Child(ChildChange::Removed), "list");

        commit(&db, &[("list/a", Some(1i64.into()))]);
        commit(&db, &[("list/a", Some(2i64.into()))]);
        commit(&db, &[("list/a", None)]);

        assert_eq!(added.lock().len(), 1);
        assert_eq!(changed.lock()[0].value, Some(2i64.into()));
        let removed = removed.lock();
        assert_eq!(removed[0].key(), "a");
        assert_eq!(removed[0].value, Some(2i64.into()));
        assert!(!db.snapshot(&Node::root().child("list")).exists());
    }

    #[test]
    fn deleting_a_subtree_reaches_observers_below_it() {
        let db = InMemoryDatabase::new();
        commit(
            &db,
            &[
                ("users/alice/list/a", Some(1i64.into())),
                ("users/alice/list/b", Some(2i64.into())),
            ],
        );
        let removed = record(&db, DataEvent::Child(ChildChange::Removed), "users/alice/list");
        let values = record(&db, DataEvent::Value, "users/alice/list/a");

        commit(&db, &[("users/alice", None)]);

        let removed = removed.lock();
        let keys: Vec<&str> = removed.iter().map(|s| s.key()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(removed[1].value, Some(2i64.into()));
        let values = values.lock();
        assert_eq!(values.len(), 1);
        assert!(!values[0].exists());
    }

    #[test]
    fn ancestors_receive_value_events() {
        let db = InMemoryDatabase::new();
        let root_values = record(&db, DataEvent::Value, "users");
        commit(&db, &[("users/alice/name", Some("Alice".into()))]);
        let values = root_values.lock();
        assert_eq!(values.len(), 1);
        assert!(values[0].has_child("alice/name"));
    }

    #[test]
    fn identical_commit_produces_no_notifications() {
        let db = InMemoryDatabase::new();
        commit(&db, &[("a/b", Some(1i64.into()))]);
        let values = record(&db, DataEvent::Value, "a/b");
        commit(&db, &[("a/b", Some(1i64.into()))]);
        assert!(values.lock().is_empty());
    }

    #[test]
    fn observers_can_be_removed() {
        let db = InMemoryDatabase::new();
        let node = Node::root().child("x");
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let token = db.observe(
            DataEvent::Value,
            &node,
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            None,
        );
        commit(&db, &[("x", Some(1i64.into()))]);
        db.remove_observer(&node, token);
        commit(&db, &[("x", Some(2i64.into()))]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(db.observer_count(&node), 0);
    }

    #[test]
    fn key_paged_query() {
        let db = InMemoryDatabase::new();
        commit(
            &db,
            &[
                ("list/a", Some(1i64.into())),
                ("list/b", Some(2i64.into())),
                ("list/c", Some(3i64.into())),
                ("list/d", Some(4i64.into())),
            ],
        );
        let pages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&pages);
        let _subscription = db.observe_page(
            PageQuery::new(Node::root().child("list"), 2).after(Some("b".into())),
            Arc::new(move |s, e| sink.lock().push((s, e))),
            None,
        );
        let pages = pages.lock();
        let (page, event) = &pages[0];
        assert_eq!(*event, DataEvent::Value);
        let keys: Vec<String> = page.children().iter().map(|c| c.key().to_string()).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
    }

    #[test]
    fn paged_query_live_tail_respects_bounds() {
        let db = InMemoryDatabase::new();
        commit(&db, &[("list/b", Some(1i64.into()))]);
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&added);
        let subscription = db.observe_page(
            PageQuery::new(Node::root().child("list"), 5)
                .after(Some("b".into()))
                .observe(ChildChange::Added),
            Arc::new(move |s: Snapshot, e| {
                if e != DataEvent::Value {
                    sink.lock().push(s.key().to_string());
                }
            }),
            None,
        );
        commit(&db, &[("list/a", Some(1i64.into()))]);
        commit(&db, &[("list/c", Some(1i64.into()))]);
        subscription.dispose();
        commit(&db, &[("list/d", Some(1i64.into()))]);
        assert_eq!(*added.lock(), vec!["c"]);
    }

    #[test]
    fn value_ordered_page_is_unsupported() {
        let db = InMemoryDatabase::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let _subscription = db.observe_page(
            PageQuery::new(Node::root().child("list"), 2).ordering(DataOrdering::Value),
            Arc::new(|_, _| {}),
            Some(Arc::new(move |e| {
                assert!(matches!(e, CoreError::Unsupported { .. }));
                flag.store(true, Ordering::SeqCst);
            })),
        );
        assert!(cancelled.load(Ordering::SeqCst));
    }

    #[test]
    fn file_commit_and_load() {
        let db = InMemoryDatabase::new();
        commit(&db, &[("users/alice", Some("placeholder".into()))]);

        let mut files = ObjectNode::new(Node::root());
        files
            .add_value_as_in_single_transaction(StagingNode::file(
                Node::root().child("users/alice/avatar"),
                Some(vec![1, 2, 3]),
                FileMetadata::new(),
            ))
            .unwrap();
        let results = Arc::new(Mutex::new(Vec::new()));
        let slot = Arc::clone(&results);
        db.commit_files(&files, Box::new(move |r| *slot.lock() = r));
        assert!(matches!(results.lock()[0], FileCompletion::Meta(_)));

        let data = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&data);
        let _task = db.load_file(
            &Node::root().child("users/alice/avatar"),
            Duration::from_secs(1),
            Box::new(move |d| *slot.lock() = d),
            None,
        );
        assert_eq!(*data.lock(), Some(vec![1, 2, 3]));
    }
}
