//! Test fixtures and database helpers.
//!
//! Provides a scriptable remote database, ordered side-effect logs and
//! synchronous commit helpers.

use parking_lot::Mutex;
use realtree_core::{
    CancelCallback, CancelListener, CommitCompletion, CommitOptions, CommitOutcome, CoreError,
    DataEvent, DataListener, FileCompletion, FileLoadCompletion, FilesCompletion,
    InMemoryDatabase, LoadCompletion, Node, ObjectNode, ObserverToken, PageQuery,
    RealtimeDatabase, RealtimeStorage, Snapshot, Subscription, Transaction,
};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Ordered log of side effects, shared between closures.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Returns a closure appending `entry` each time it runs.
    pub fn recorder(&self, entry: impl Into<String>) -> impl Fn() + Send + Sync + 'static {
        let log = self.clone();
        let entry = entry.into();
        move || log.record(entry.clone())
    }

    /// Copy of the entries in recording order.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Records every snapshot delivered to a data listener.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<(Snapshot, DataEvent)>>>,
}

impl RecordingListener {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener appending to this recorder.
    pub fn listener(&self) -> DataListener {
        let events = Arc::clone(&self.events);
        Arc::new(move |snapshot, event| events.lock().push((snapshot, event)))
    }

    /// Copy of the recorded deliveries.
    pub fn events(&self) -> Vec<(Snapshot, DataEvent)> {
        self.events.lock().clone()
    }

    /// Number of deliveries.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// True if nothing was delivered.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Most recent delivery.
    pub fn last(&self) -> Option<(Snapshot, DataEvent)> {
        self.events.lock().last().cloned()
    }
}

/// Remote database stand-in backed by an [`InMemoryDatabase`].
///
/// Unlike the in-memory database it rejects multi-level writes, counts
/// every call that would reach the network, and can be scripted to fail
/// value or file commits or to never answer observations. Silent loads
/// are cancelled with [`CoreError::Timeout`] once their timeout elapses.
pub struct MockDatabase {
    cache: InMemoryDatabase,
    connection: watch::Sender<bool>,
    value_failure: Mutex<Option<CoreError>>,
    file_failure: Mutex<Option<CoreError>>,
    silent: AtomicBool,
    deferred_loads: AtomicBool,
    commits: AtomicUsize,
    file_commits: AtomicUsize,
    next_silent_token: AtomicU64,
}

impl Default for MockDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDatabase {
    /// Creates a connected mock database.
    pub fn new() -> Self {
        let (connection, _) = watch::channel(true);
        Self {
            cache: InMemoryDatabase::new(),
            connection,
            value_failure: Mutex::new(None),
            file_failure: Mutex::new(None),
            silent: AtomicBool::new(false),
            deferred_loads: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
            file_commits: AtomicUsize::new(0),
            next_silent_token: AtomicU64::new(u64::MAX / 2),
        }
    }

    /// Makes value commits fail with `error`.
    pub fn fail_values(&self, error: CoreError) {
        *self.value_failure.lock() = Some(error);
    }

    /// Makes every file commit fail with `error`.
    pub fn fail_files(&self, error: CoreError) {
        *self.file_failure.lock() = Some(error);
    }

    /// Makes observations never deliver anything.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    /// Makes loads never answer while observations keep delivering.
    pub fn defer_loads(&self, deferred: bool) {
        self.deferred_loads.store(deferred, Ordering::SeqCst);
    }

    /// Publishes a connectivity change.
    pub fn set_connected(&self, connected: bool) {
        self.connection.send_replace(connected);
    }

    /// Number of value commits received.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of file commits received.
    pub fn file_commit_count(&self) -> usize {
        self.file_commits.load(Ordering::SeqCst)
    }

    /// Backing store.
    pub fn cache(&self) -> &InMemoryDatabase {
        &self.cache
    }

    /// Current data at `node`.
    pub fn snapshot(&self, node: &Node) -> Snapshot {
        self.cache.snapshot(node)
    }
}

impl RealtimeDatabase for MockDatabase {
    fn generate_auto_id(&self) -> String {
        self.cache.generate_auto_id()
    }

    fn commit(&self, update: &ObjectNode, completion: CommitCompletion) {
        self.commits.fetch_add(1, Ordering::SeqCst);
        let failure = self.value_failure.lock().clone();
        match failure {
            Some(error) => completion(Err(error)),
            None => self.cache.commit(update, completion),
        }
    }

    fn load(
        &self,
        node: &Node,
        timeout: Duration,
        completion: LoadCompletion,
        on_cancel: Option<CancelCallback>,
    ) {
        if self.deferred_loads.load(Ordering::SeqCst) {
            return;
        }
        if !self.silent.load(Ordering::SeqCst) {
            self.cache.load(node, timeout, completion, on_cancel);
            return;
        }
        if let Some(on_cancel) = on_cancel {
            std::thread::spawn(move || {
                std::thread::sleep(timeout);
                on_cancel(CoreError::Timeout);
            });
        }
    }

    fn observe(
        &self,
        event: DataEvent,
        node: &Node,
        on_update: DataListener,
        on_cancel: Option<CancelListener>,
    ) -> ObserverToken {
        if self.silent.load(Ordering::SeqCst) {
            return self.next_silent_token.fetch_add(1, Ordering::SeqCst);
        }
        self.cache.observe(event, node, on_update, on_cancel)
    }

    fn observe_page(
        &self,
        query: PageQuery,
        on_update: DataListener,
        on_cancel: Option<CancelListener>,
    ) -> Subscription {
        if self.silent.load(Ordering::SeqCst) {
            return Subscription::empty();
        }
        self.cache.observe_page(query, on_update, on_cancel)
    }

    fn remove_observer(&self, node: &Node, token: ObserverToken) {
        self.cache.remove_observer(node, token);
    }

    fn remove_all_observers(&self, node: &Node) {
        self.cache.remove_all_observers(node);
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.connection.subscribe()
    }
}

impl RealtimeStorage for MockDatabase {
    fn load_file(
        &self,
        node: &Node,
        timeout: Duration,
        completion: FileLoadCompletion,
        on_cancel: Option<CancelCallback>,
    ) -> Subscription {
        self.cache.load_file(node, timeout, completion, on_cancel)
    }

    fn commit_files(&self, update: &ObjectNode, completion: FilesCompletion) {
        self.file_commits.fetch_add(1, Ordering::SeqCst);
        let failure = self.file_failure.lock().clone();
        match failure {
            Some(error) => completion(
                update
                    .files()
                    .into_iter()
                    .map(|file| FileCompletion::Error(file.location.clone(), error.clone()))
                    .collect(),
            ),
            None => self.cache.commit_files(update, completion),
        }
    }
}

/// Creates a transaction over `db` for both values and files.
pub fn transaction_for<D>(db: &Arc<D>) -> Transaction
where
    D: RealtimeDatabase + RealtimeStorage + 'static,
{
    Transaction::new(db.clone(), db.clone())
}

/// Runs a test with a fresh in-memory database and a transaction over it.
pub fn with_cache<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<InMemoryDatabase>, Transaction) -> R,
{
    let db = Arc::new(InMemoryDatabase::new());
    let txn = transaction_for(&db);
    f(&db, txn)
}

/// Commits with default options against a backend answering synchronously.
///
/// # Panics
///
/// Panics if the commit did not complete before returning.
pub fn commit_and_wait(txn: &Transaction) -> CommitOutcome {
    commit_with_options(txn, CommitOptions::default())
}

/// Commits with `options` against a backend answering synchronously.
///
/// # Panics
///
/// Panics if the commit did not complete before returning.
pub fn commit_with_options(txn: &Transaction, options: CommitOptions) -> CommitOutcome {
    let slot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    txn.commit(options, move |outcome| *sink.lock() = Some(outcome));
    let outcome = slot.lock().take();
    outcome.expect("commit should complete synchronously")
}

/// Commits `values` straight into `db` without a transaction.
///
/// # Panics
///
/// Panics if the database rejects the update.
pub fn seed<D: RealtimeDatabase + ?Sized>(db: &D, values: &[(&str, realtree_core::DatabaseValue)]) {
    let mut update = ObjectNode::new(Node::root());
    for (path, value) in values {
        update
            .add_value_as_in_single_transaction(realtree_core::StagingNode::value(
                Node::root().child(path),
                Some(value.clone()),
            ))
            .expect("seed paths should not overlap");
    }
    let slot = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&slot);
    db.commit(&update, Box::new(move |result| *sink.lock() = Some(result)));
    let result = slot.lock().take();
    result
        .expect("seed commit should complete synchronously")
        .expect("seed commit should succeed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_records_in_order() {
        let log = EventLog::new();
        let first = log.recorder("first");
        let second = log.recorder("second");
        second();
        first();
        assert_eq!(log.entries(), vec!["second", "first"]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn mock_rejects_multi_level_and_counts_commits() {
        let db = Arc::new(MockDatabase::new());
        assert!(!db.supports_multi_level_writes());
        let txn = transaction_for(&db);
        txn.add_value(&Node::root().child("a"), 1i64).unwrap();
        assert!(commit_and_wait(&txn).is_success());
        assert_eq!(db.commit_count(), 1);
        assert_eq!(db.file_commit_count(), 0);
    }

    #[test]
    fn mock_value_failure() {
        let db = Arc::new(MockDatabase::new());
        db.fail_values(CoreError::commit("permission denied"));
        let txn = transaction_for(&db);
        txn.add_value(&Node::root().child("a"), 1i64).unwrap();
        let outcome = commit_and_wait(&txn);
        assert!(!outcome.is_success());
        assert!(!db.snapshot(&Node::root().child("a")).exists());
    }

    #[test]
    fn recording_listener_collects_deliveries() {
        let db = InMemoryDatabase::new();
        let recorder = RecordingListener::new();
        let node = Node::root().child("x");
        db.observe(DataEvent::Value, &node, recorder.listener(), None);
        seed(&db, &[("x", 5i64.into())]);
        assert_eq!(recorder.len(), 1);
        assert_eq!(recorder.last().unwrap().0.value, Some(5i64.into()));
    }
}
