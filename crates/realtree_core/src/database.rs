//! Contracts of the remote database and blob storage clients.

use crate::config::CachePolicy;
use crate::error::CoreError;
use crate::node::Node;
use crate::snapshot::Snapshot;
use crate::staging::{FileMetadata, ObjectNode};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Token identifying a registered observer.
pub type ObserverToken = u64;

/// Receives data for an observed location.
pub type DataListener = Arc<dyn Fn(Snapshot, DataEvent) + Send + Sync>;

/// Receives the error that cancelled an observation.
pub type CancelListener = Arc<dyn Fn(CoreError) + Send + Sync>;

/// Receives the result of a value commit.
pub type CommitCompletion = Box<dyn FnOnce(Result<(), CoreError>) + Send>;

/// Receives a single loaded snapshot.
pub type LoadCompletion = Box<dyn FnOnce(Snapshot) + Send>;

/// Receives loaded file contents.
pub type FileLoadCompletion = Box<dyn FnOnce(Option<Vec<u8>>) + Send>;

/// Receives the error that cancelled a load.
pub type CancelCallback = Box<dyn FnOnce(CoreError) + Send>;

/// Receives per-file results of a file commit.
pub type FilesCompletion = Box<dyn FnOnce(Vec<FileCompletion>) + Send>;

/// Kind of child change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildChange {
    /// A child was added.
    Added,
    /// A child was removed.
    Removed,
    /// A child changed.
    Changed,
    /// A child moved relative to its siblings.
    Moved,
}

/// Kind of data change delivered to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataEvent {
    /// Any change at the location or below it.
    Value,
    /// A change of one direct child.
    Child(ChildChange),
}

impl fmt::Display for DataEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataEvent::Value => write!(f, "value"),
            DataEvent::Child(ChildChange::Added) => write!(f, "child(added)"),
            DataEvent::Child(ChildChange::Removed) => write!(f, "child(removed)"),
            DataEvent::Child(ChildChange::Changed) => write!(f, "child(changed)"),
            DataEvent::Child(ChildChange::Moved) => write!(f, "child(moved)"),
        }
    }
}

/// Ordering of a paged query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataOrdering {
    /// By child key.
    Key,
    /// By child value.
    Value,
    /// By the value of a grandchild with the given key.
    Child(String),
}

/// A bounded query over the children of a location.
#[derive(Debug, Clone, PartialEq)]
pub struct PageQuery {
    /// Child changes to keep observing after the first page.
    pub changes: Vec<ChildChange>,
    /// Location whose children are queried.
    pub node: Node,
    /// Maximum number of children.
    pub limit: usize,
    /// Inclusive upper bound.
    pub before: Option<String>,
    /// Inclusive lower bound.
    pub after: Option<String>,
    /// Take the first children (`true`) or the last ones.
    pub ascending: bool,
    /// Ordering of the children.
    pub ordering: DataOrdering,
}

impl PageQuery {
    /// Creates a key ordered query without bounds.
    pub fn new(node: Node, limit: usize) -> Self {
        Self {
            changes: Vec::new(),
            node,
            limit,
            before: None,
            after: None,
            ascending: true,
            ordering: DataOrdering::Key,
        }
    }

    /// Keeps observing a child change after the first page.
    #[must_use]
    pub fn observe(mut self, change: ChildChange) -> Self {
        if !self.changes.contains(&change) {
            self.changes.push(change);
        }
        self
    }

    /// True if at least one bound is set.
    pub fn is_bounded(&self) -> bool {
        self.before.is_some() || self.after.is_some()
    }

    /// True if `key` lies within the inclusive bounds.
    pub fn contains_key(&self, key: &str) -> bool {
        self.after.as_deref().map_or(true, |after| key >= after)
            && self.before.as_deref().map_or(true, |before| key <= before)
    }

    /// Sets the lower bound.
    #[must_use]
    pub fn after(mut self, key: Option<String>) -> Self {
        self.after = key;
        self
    }

    /// Sets the upper bound.
    #[must_use]
    pub fn before(mut self, key: Option<String>) -> Self {
        self.before = key;
        self
    }

    /// Sets the direction.
    #[must_use]
    pub fn ascending(mut self, ascending: bool) -> Self {
        self.ascending = ascending;
        self
    }

    /// Sets the ordering.
    #[must_use]
    pub fn ordering(mut self, ordering: DataOrdering) -> Self {
        self.ordering = ordering;
        self
    }
}

/// Handle of a running query. Disposing (or dropping) it stops the query.
#[must_use = "dropping a subscription stops the observation"]
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Creates a subscription that runs `dispose` once.
    pub fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    /// Creates a subscription with nothing to stop.
    pub fn empty() -> Self {
        Self { dispose: None }
    }

    /// Stops the query.
    pub fn dispose(mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(dispose) = self.dispose.take() {
            dispose();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

/// Result of writing one file.
#[derive(Debug, Clone, PartialEq)]
pub enum FileCompletion {
    /// File stored; metadata reported by the storage.
    Meta(FileMetadata),
    /// File write failed.
    Error(Node, CoreError),
}

/// A remote hierarchical database.
///
/// Implementations deliver callbacks on any thread; the in-memory database
/// delivers them synchronously.
pub trait RealtimeDatabase: Send + Sync {
    /// Generates a new unique child key.
    fn generate_auto_id(&self) -> String;

    /// Cache policy of the database.
    fn cache_policy(&self) -> CachePolicy {
        CachePolicy::Default
    }

    /// Writes the values of a staged tree.
    fn commit(&self, update: &ObjectNode, completion: CommitCompletion);

    /// Loads the data at a location once.
    fn load(
        &self,
        node: &Node,
        timeout: Duration,
        completion: LoadCompletion,
        on_cancel: Option<CancelCallback>,
    );

    /// Starts observing a location. The token must be passed to
    /// [`RealtimeDatabase::remove_observer`] to stop.
    fn observe(
        &self,
        event: DataEvent,
        node: &Node,
        on_update: DataListener,
        on_cancel: Option<CancelListener>,
    ) -> ObserverToken;

    /// Runs a bounded query over the children of a location.
    ///
    /// The page is delivered as a [`DataEvent::Value`] snapshot of
    /// `query.node`. When a bound is set one extra child is fetched so the
    /// caller can drop the bound key itself.
    fn observe_page(
        &self,
        query: PageQuery,
        on_update: DataListener,
        on_cancel: Option<CancelListener>,
    ) -> Subscription;

    /// Removes one observer.
    fn remove_observer(&self, node: &Node, token: ObserverToken);

    /// Removes all observers of a location.
    fn remove_all_observers(&self, node: &Node);

    /// Stream of connectivity changes.
    fn connection_state(&self) -> watch::Receiver<bool>;

    /// True if writes may use keys spanning several levels.
    fn supports_multi_level_writes(&self) -> bool {
        false
    }
}

/// A remote blob storage.
pub trait RealtimeStorage: Send + Sync {
    /// Loads file contents. The returned subscription cancels the download.
    fn load_file(
        &self,
        node: &Node,
        timeout: Duration,
        completion: FileLoadCompletion,
        on_cancel: Option<CancelCallback>,
    ) -> Subscription;

    /// Writes the file leaves of a staged tree.
    fn commit_files(&self, update: &ObjectNode, completion: FilesCompletion);
}

struct PendingLoad {
    fired: AtomicBool,
    token: Mutex<Option<ObserverToken>>,
    completion: Mutex<Option<LoadCompletion>>,
    on_cancel: Mutex<Option<CancelCallback>>,
    database: Weak<dyn RealtimeDatabase>,
    node: Node,
}

impl PendingLoad {
    fn try_fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn detach(&self) {
        let token = self.token.lock().take();
        if let (Some(token), Some(database)) = (token, self.database.upgrade()) {
            database.remove_observer(&self.node, token);
        }
    }

    fn succeed(&self, snapshot: Snapshot) {
        if self.try_fire() {
            self.detach();
            let completion = self.completion.lock().take();
            if let Some(completion) = completion {
                completion(snapshot);
            }
        }
    }

    fn cancel(&self, error: CoreError) {
        if self.try_fire() {
            debug!(node = %self.node, %error, "load cancelled");
            self.detach();
            let on_cancel = self.on_cancel.lock().take();
            if let Some(on_cancel) = on_cancel {
                on_cancel(error);
            }
        }
    }
}

/// Loads a location once, giving up after `timeout`.
///
/// The location is observed for value changes and the database is asked
/// for its current value at the same time. Exactly one of `completion` and
/// `on_cancel` runs, whichever of data, cancellation or timeout comes
/// first, and the observer is removed in every case. The timer runs on the
/// current tokio runtime if there is one, otherwise on a helper thread.
pub fn load_with_timeout(
    database: &Arc<dyn RealtimeDatabase>,
    node: &Node,
    timeout: Duration,
    completion: LoadCompletion,
    on_cancel: Option<CancelCallback>,
) {
    let pending = Arc::new(PendingLoad {
        fired: AtomicBool::new(false),
        token: Mutex::new(None),
        completion: Mutex::new(Some(completion)),
        on_cancel: Mutex::new(on_cancel),
        database: Arc::downgrade(database),
        node: node.clone(),
    });

    let on_update = {
        let pending = Arc::clone(&pending);
        Arc::new(move |snapshot: Snapshot, _event: DataEvent| pending.succeed(snapshot))
    };
    let on_cancel = {
        let pending = Arc::clone(&pending);
        Arc::new(move |error: CoreError| pending.cancel(error))
    };
    let token = database.observe(DataEvent::Value, node, on_update, Some(on_cancel));
    *pending.token.lock() = Some(token);
    if pending.fired.load(Ordering::Acquire) {
        // fired before the token was known
        pending.detach();
        return;
    }

    let loaded = Arc::clone(&pending);
    let load_cancelled = Arc::clone(&pending);
    database.load(
        node,
        timeout,
        Box::new(move |snapshot: Snapshot| loaded.succeed(snapshot)),
        Some(Box::new(move |error: CoreError| load_cancelled.cancel(error))),
    );
    if pending.fired.load(Ordering::Acquire) {
        return;
    }

    let timer = Arc::clone(&pending);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(timeout).await;
                timer.cancel(CoreError::Timeout);
            });
        }
        Err(_) => {
            std::thread::spawn(move || {
                std::thread::sleep(timeout);
                timer.cancel(CoreError::Timeout);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_disposes_once() {
        let count = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&count);
        let subscription = Subscription::new(move || {
            assert!(!flag.swap(true, Ordering::SeqCst));
        });
        subscription.dispose();
        assert!(count.load(Ordering::SeqCst));
    }

    #[test]
    fn page_query_builder() {
        let query = PageQuery::new(Node::root().child("list"), 3)
            .after(Some("b".into()))
            .ascending(false)
            .observe(ChildChange::Added);
        assert_eq!(query.limit, 3);
        assert_eq!(query.changes, vec![ChildChange::Added]);
        assert!(query.is_bounded());
        assert!(query.contains_key("b"));
        assert!(!query.contains_key("a"));
        assert_eq!(query.after.as_deref(), Some("b"));
        assert!(!query.ascending);
        assert_eq!(query.ordering, DataOrdering::Key);
    }

    #[test]
    fn event_display() {
        assert_eq!(DataEvent::Value.to_string(), "value");
        assert_eq!(
            DataEvent::Child(ChildChange::Removed).to_string(),
            "child(removed)"
        );
    }
}
