//! Transactions: batched, revertible writes gated by asynchronous
//! preconditions.
//!
//! A [`Transaction`] collects value and file writes into one staging tree
//! together with completion callbacks and reversions. On commit it drains
//! its preconditions, sends values and files, and either completes or fails
//! and runs its reversions in reverse registration order.
//!
//! Once merged into another transaction, every registration made on it is
//! forwarded to the receiving transaction.

mod commit;
mod lifecycle;
mod precondition;
mod state;

pub use commit::OutcomeCompletion;
pub use lifecycle::{RealtimeValueEvents, WritableValue};
pub use precondition::{Precondition, PreconditionPromise};
pub use state::{CommitOptions, CommitOutcome, TransactionState, TransactionSubstate};

use crate::config::RealtimeConfig;
use crate::database::{RealtimeDatabase, RealtimeStorage};
use crate::error::{CoreError, CoreResult};
use crate::node::Node;
use crate::staging::{FileMetadata, MergeStrategy, ObjectNode, StagingNode};
use crate::value::DatabaseValue;
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Undoes the local effect of one staged operation.
pub type Reversion = Arc<dyn Fn() + Send + Sync>;

/// Receives `true` after a successful commit and `false` otherwise.
pub type Completion = Box<dyn FnOnce(bool) + Send>;

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    staged: ObjectNode,
    preconditions: Vec<Precondition>,
    completions: Vec<Completion>,
    reversions: Vec<Reversion>,
    file_reversions: HashMap<Node, Reversion>,
    scheduled_merges: Vec<(Transaction, MergeStrategy)>,
    merged_into: Option<Transaction>,
    state: TransactionState,
    substate: TransactionSubstate,
    committing: bool,
}

/// Callbacks left over by an invalidated transaction.
struct Spent {
    completions: Vec<Completion>,
    scheduled: Vec<(Transaction, MergeStrategy)>,
}

impl Spent {
    fn finish(self, success: bool) {
        for (other, _) in self.scheduled {
            other.abandon();
        }
        for completion in self.completions {
            completion(success);
        }
    }
}

impl Inner {
    fn new() -> Self {
        Self {
            staged: ObjectNode::new(Node::root()),
            preconditions: Vec::new(),
            completions: Vec::new(),
            reversions: Vec::new(),
            file_reversions: HashMap::new(),
            scheduled_merges: Vec::new(),
            merged_into: None,
            state: TransactionState::Waiting,
            substate: TransactionSubstate::None,
            committing: false,
        }
    }

    fn is_invalidated(&self) -> bool {
        self.state.is_terminal() || self.substate == TransactionSubstate::Reverted
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_invalidated() {
            return Err(CoreError::invalid_operation(
                "transaction is invalidated, create a new one",
            ));
        }
        Ok(())
    }

    fn has_operations(&self) -> bool {
        !self.staged.is_empty() || !self.preconditions.is_empty()
    }

    fn invalidate(&mut self) -> Spent {
        self.staged.clear();
        self.preconditions.clear();
        self.reversions.clear();
        self.file_reversions.clear();
        Spent {
            completions: std::mem::take(&mut self.completions),
            scheduled: std::mem::take(&mut self.scheduled_merges),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let abandoned = self.state == TransactionState::Waiting
            && self.substate == TransactionSubstate::None
            && self.merged_into.is_none()
            && self.has_operations();
        if abandoned && !std::thread::panicking() {
            error!("transaction dropped without commit, reversion or merge");
            if cfg!(debug_assertions) {
                panic!("transaction requires performing, reversion or merging");
            }
        }
    }
}

/// A batched, revertible unit of staged writes.
///
/// Cloning returns another handle to the same transaction. The database and
/// storage are injected at construction.
#[derive(Clone)]
pub struct Transaction {
    id: u64,
    inner: Arc<Mutex<Inner>>,
    database: Arc<dyn RealtimeDatabase>,
    storage: Arc<dyn RealtimeStorage>,
    config: Arc<RealtimeConfig>,
}

impl Transaction {
    /// Creates a transaction with the default configuration.
    pub fn new(database: Arc<dyn RealtimeDatabase>, storage: Arc<dyn RealtimeStorage>) -> Self {
        Self::with_config(database, storage, RealtimeConfig::default())
    }

    /// Creates a transaction validating locations against `config`.
    pub fn with_config(
        database: Arc<dyn RealtimeDatabase>,
        storage: Arc<dyn RealtimeStorage>,
        config: RealtimeConfig,
    ) -> Self {
        Self {
            id: NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(Inner::new())),
            database,
            storage,
            config: Arc::new(config),
        }
    }

    /// Process-unique identifier, used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Database values are committed to.
    pub fn database(&self) -> &Arc<dyn RealtimeDatabase> {
        &self.database
    }

    /// Storage files are committed to.
    pub fn storage(&self) -> &Arc<dyn RealtimeStorage> {
        &self.storage
    }

    /// Configuration locations are validated against.
    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    /// Current substate.
    pub fn substate(&self) -> TransactionSubstate {
        self.inner.lock().substate
    }

    /// Returns true once the commit succeeded.
    pub fn is_completed(&self) -> bool {
        self.state() == TransactionState::Completed
    }

    /// Returns true once the commit failed.
    pub fn is_failed(&self) -> bool {
        self.state() == TransactionState::Failed
    }

    /// Returns true while writes are in flight.
    pub fn is_performing(&self) -> bool {
        self.state() == TransactionState::Performing
    }

    /// Returns true if the transaction was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state() == TransactionState::Cancelled
    }

    /// Returns true if the transaction was merged into another one.
    pub fn is_merged(&self) -> bool {
        self.state() == TransactionState::Merged
    }

    /// Returns true if reversions ran.
    pub fn is_reverted(&self) -> bool {
        self.substate() == TransactionSubstate::Reverted
    }

    /// Returns true if the transaction accepts no more operations.
    pub fn is_invalidated(&self) -> bool {
        self.inner.lock().is_invalidated()
    }

    /// Returns true if anything is staged or a precondition is pending.
    pub fn has_operations(&self) -> bool {
        self.inner.lock().has_operations()
    }

    /// Copy of the staged tree.
    pub fn staged(&self) -> ObjectNode {
        self.inner.lock().staged.clone()
    }

    /// Locks this transaction, or returns the one it was merged into.
    fn local(&self) -> Result<MutexGuard<'_, Inner>, Transaction> {
        let inner = self.inner.lock();
        match inner.merged_into.clone() {
            Some(target) => Err(target),
            None => Ok(inner),
        }
    }

    fn check_location(&self, location: &Node) -> CoreResult<()> {
        if !location.is_rooted() {
            return Err(CoreError::structural(
                location.absolute_path(),
                "node should be rooted",
            ));
        }
        self.config.validate(location)?;
        if location.has_multi_level_key() && !self.database.supports_multi_level_writes() {
            error!(txn = self.id, node = %location, "multi-level write rejected");
            return Err(CoreError::MultiLevelWrite {
                location: location.absolute_path(),
            });
        }
        Ok(())
    }

    fn stage(&self, leaf: StagingNode) -> CoreResult<()> {
        let mut inner = match self.local() {
            Ok(inner) => inner,
            Err(target) => return target.stage(leaf),
        };
        inner.ensure_open()?;
        self.check_location(leaf.location())?;
        inner.staged.add_value_as_in_single_transaction(leaf)
    }

    /// Stages `value` at `node`.
    ///
    /// # Errors
    ///
    /// Fails with a structural error if `node` is not rooted, breaks the
    /// configured limits, spans several levels on a backend without
    /// multi-level writes, or collides with an earlier write.
    pub fn add_value(&self, node: &Node, value: impl Into<DatabaseValue>) -> CoreResult<()> {
        self.stage(StagingNode::value(node.clone(), Some(value.into())))
    }

    /// Stages removal of the value at `node`.
    pub fn remove_value(&self, node: &Node) -> CoreResult<()> {
        self.stage(StagingNode::value(node.clone(), None))
    }

    /// Stages a file upload at `node`.
    pub fn add_file(&self, node: &Node, data: Vec<u8>, metadata: FileMetadata) -> CoreResult<()> {
        self.stage(StagingNode::file(node.clone(), Some(data), metadata))
    }

    /// Stages removal of the file at `node`.
    pub fn remove_file(&self, node: &Node) -> CoreResult<()> {
        self.stage(StagingNode::file(node.clone(), None, FileMetadata::new()))
    }

    /// Registers a reversion of a local change.
    pub fn add_reversion(&self, reversion: impl Fn() + Send + Sync + 'static) -> CoreResult<()> {
        self.push_reversion(Arc::new(reversion))
    }

    pub(crate) fn push_reversion(&self, reversion: Reversion) -> CoreResult<()> {
        let mut inner = match self.local() {
            Ok(inner) => inner,
            Err(target) => return target.push_reversion(reversion),
        };
        inner.ensure_open()?;
        inner.reversions.push(reversion);
        Ok(())
    }

    /// Registers a reversion run when the file at `node` fails to commit.
    ///
    /// A later registration for the same node replaces the earlier one.
    pub fn add_file_reversion(
        &self,
        node: &Node,
        reversion: impl Fn() + Send + Sync + 'static,
    ) -> CoreResult<()> {
        self.push_file_reversion(node, Arc::new(reversion))
    }

    fn push_file_reversion(&self, node: &Node, reversion: Reversion) -> CoreResult<()> {
        let mut inner = match self.local() {
            Ok(inner) => inner,
            Err(target) => return target.push_file_reversion(node, reversion),
        };
        inner.ensure_open()?;
        inner.file_reversions.insert(node.clone(), reversion);
        Ok(())
    }

    /// Registers a callback receiving the commit result.
    pub fn add_completion(&self, completion: impl FnOnce(bool) + Send + 'static) -> CoreResult<()> {
        self.push_completion(Box::new(completion))
    }

    fn push_completion(&self, completion: Completion) -> CoreResult<()> {
        let mut inner = match self.local() {
            Ok(inner) => inner,
            Err(target) => return target.push_completion(completion),
        };
        inner.ensure_open()?;
        inner.completions.push(completion);
        Ok(())
    }

    /// Registers a precondition run before commit.
    ///
    /// The precondition receives a promise it must settle. Preconditions
    /// added while others run are drained in a later round.
    pub fn add_precondition(
        &self,
        precondition: impl FnOnce(PreconditionPromise) + Send + 'static,
    ) -> CoreResult<()> {
        self.push_precondition(Box::new(precondition))
    }

    fn push_precondition(&self, precondition: Precondition) -> CoreResult<()> {
        let mut inner = match self.local() {
            Ok(inner) => inner,
            Err(target) => return target.push_precondition(precondition),
        };
        inner.ensure_open()?;
        inner.preconditions.push(precondition);
        Ok(())
    }

    /// Returns a closure running the current reversions, newest first.
    pub fn current_reversion(&self) -> CoreResult<Reversion> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        let reversions = inner.reversions.clone();
        Ok(Arc::new(move || {
            reversions.iter().rev().for_each(|reversion| reversion())
        }))
    }

    fn reversion_guard(inner: &Inner) -> CoreResult<()> {
        if !inner.state.allows_reversion() {
            return Err(CoreError::invalid_operation(format!(
                "reversion cannot be made in {:?} state",
                inner.state
            )));
        }
        Ok(())
    }

    /// Runs value and file reversions.
    pub fn revert(&self) -> CoreResult<()> {
        self.revert_values()?;
        self.revert_files()
    }

    /// Runs value reversions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] unless the transaction is
    /// waiting or failed.
    pub fn revert_values(&self) -> CoreResult<()> {
        let reversions = {
            let mut inner = self.inner.lock();
            Self::reversion_guard(&inner)?;
            inner.substate = TransactionSubstate::Reverted;
            inner.reversions.clone()
        };
        debug!(txn = self.id, count = reversions.len(), "reverting values");
        reversions.iter().rev().for_each(|reversion| reversion());
        Ok(())
    }

    /// Runs every file reversion.
    pub fn revert_files(&self) -> CoreResult<()> {
        let reversions: Vec<Reversion> = {
            let inner = self.inner.lock();
            Self::reversion_guard(&inner)?;
            inner.file_reversions.values().cloned().collect()
        };
        debug!(txn = self.id, count = reversions.len(), "reverting files");
        reversions.iter().for_each(|reversion| reversion());
        Ok(())
    }

    /// Runs the file reversion registered for `node`, if any.
    pub fn revert_file(&self, node: &Node) -> CoreResult<()> {
        let reversion = {
            let inner = self.inner.lock();
            Self::reversion_guard(&inner)?;
            inner.file_reversions.get(node).cloned()
        };
        if let Some(reversion) = reversion {
            reversion();
        }
        Ok(())
    }

    /// Cancels the transaction without running reversions.
    ///
    /// Completions receive `false`.
    pub fn cancel(&self) -> CoreResult<()> {
        let spent = {
            let mut inner = self.inner.lock();
            if inner.merged_into.is_some() {
                return Err(CoreError::invalid_operation(
                    "transaction already merged to other transaction",
                ));
            }
            if inner.state != TransactionState::Waiting || inner.committing {
                return Err(CoreError::invalid_operation(
                    "only a waiting transaction can be cancelled",
                ));
            }
            inner.state = TransactionState::Cancelled;
            inner.invalidate()
        };
        debug!(txn = self.id, "transaction cancelled");
        spent.finish(false);
        Ok(())
    }

    /// Cancels a transaction whose deferred merge will never happen.
    fn abandon(&self) {
        let spent = {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Cancelled;
            inner.merged_into = None;
            inner.invalidate()
        };
        spent.finish(false);
    }

    /// Folds the operations of `other` into this transaction.
    ///
    /// If `other` still has preconditions they are adopted now and the tree
    /// merge happens right before this transaction commits. Registrations
    /// made on `other` afterwards are forwarded here.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] when merging a transaction
    /// into itself or merging one that is already merged, and structural
    /// errors when the staged trees cannot be combined.
    pub fn merge(&self, other: &Transaction, strategy: MergeStrategy) -> CoreResult<()> {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return Err(CoreError::invalid_operation(
                "transaction cannot be merged into itself",
            ));
        }
        if other.inner.lock().merged_into.is_some() {
            return Err(CoreError::invalid_operation(
                "transaction already merged to other transaction",
            ));
        }
        self.merge_now_or_defer(other, strategy)
    }

    fn merge_now_or_defer(&self, other: &Transaction, strategy: MergeStrategy) -> CoreResult<()> {
        if let Err(target) = self.local() {
            return target.merge_now_or_defer(other, strategy);
        }

        let staged = {
            let mut theirs = other.inner.lock();
            theirs.ensure_open()?;
            if !theirs.preconditions.is_empty() {
                let preconditions = std::mem::take(&mut theirs.preconditions);
                theirs.merged_into = Some(self.clone());
                drop(theirs);

                let mut ours = self.inner.lock();
                ours.preconditions.extend(preconditions);
                ours.scheduled_merges.push((other.clone(), strategy));
                debug!(txn = self.id, other = other.id, "merge deferred until preconditions settle");
                return Ok(());
            }
            theirs.staged.clone()
        };

        {
            let mut ours = self.inner.lock();
            ours.ensure_open()?;
            let mut merged = ours.staged.clone();
            merged.merge_with_strategy(StagingNode::Object(staged), strategy)?;
            ours.staged = merged;
        }

        let (completions, reversions, file_reversions) = {
            let mut theirs = other.inner.lock();
            theirs.state = TransactionState::Merged;
            theirs.merged_into = Some(self.clone());
            theirs.staged.clear();
            (
                std::mem::take(&mut theirs.completions),
                std::mem::take(&mut theirs.reversions),
                std::mem::take(&mut theirs.file_reversions),
            )
        };

        let mut ours = self.inner.lock();
        ours.completions.extend(completions);
        if !reversions.is_empty() {
            ours.reversions.push(Arc::new(move || {
                reversions.iter().rev().for_each(|reversion| reversion())
            }));
        }
        ours.file_reversions.extend(file_reversions);
        debug!(txn = self.id, other = other.id, ?strategy, "transaction merged");
        Ok(())
    }

    fn apply_scheduled_merges(&self) -> CoreResult<()> {
        let scheduled = std::mem::take(&mut self.inner.lock().scheduled_merges);
        for (other, strategy) in scheduled {
            other.apply_scheduled_merges()?;
            self.merge_now_or_defer(&other, strategy)?;
        }
        Ok(())
    }

    /// Stages `value` at `node` and calls its save hooks.
    pub fn set<V: WritableValue + 'static>(&self, value: Arc<V>, node: &Node) -> CoreResult<()> {
        if !node.is_rooted() {
            return Err(CoreError::structural(
                node.absolute_path(),
                "node to set must be rooted",
            ));
        }
        value.will_save(self, node);
        value.write(self, node)?;
        let node = node.clone();
        self.add_completion(move |saved| {
            if saved {
                value.did_save(&node);
            }
        })
    }

    /// Stages removal of a bound value and calls its remove hooks.
    pub fn delete<V: WritableValue + 'static>(&self, value: Arc<V>) -> CoreResult<()> {
        let node = bound_node(value.as_ref())?;
        value.will_remove(self);
        self.remove_value(&node)?;
        self.add_completion(move |removed| {
            if removed {
                value.did_remove();
            }
        })
    }

    /// Stages the local changes of a bound value.
    ///
    /// Registers the value's reversion and calls its update hooks. Values
    /// without changes are skipped.
    pub fn update<V: WritableValue + 'static>(&self, value: Arc<V>) -> CoreResult<()> {
        let node = bound_node(value.as_ref())?;
        if !value.has_changes() {
            debug!(txn = self.id, node = %node, "value has no changes");
            return Ok(());
        }
        value.will_update(self, &node);
        value.write_changes(self, &node)?;
        self.push_reversion(value.current_reversion())?;
        self.add_completion(move |updated| {
            if updated {
                value.did_update(&node);
            }
        })
    }
}

fn bound_node<V: WritableValue + ?Sized>(value: &V) -> CoreResult<Node> {
    value
        .node()
        .filter(Node::is_rooted)
        .ok_or_else(|| CoreError::invalid_operation("value must be rooted"))
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("substate", &inner.substate)
            .field("staged", &inner.staged.children_count())
            .field("preconditions", &inner.preconditions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDatabase;
    use crate::database::DataEvent;
    use crate::snapshot::Snapshot;

    fn setup() -> (Arc<InMemoryDatabase>, Transaction) {
        let db = Arc::new(InMemoryDatabase::new());
        let txn = Transaction::new(db.clone(), db.clone());
        (db, txn)
    }

    fn commit_now(txn: &Transaction) -> CommitOutcome {
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        txn.commit(CommitOptions::default(), move |outcome| {
            *sink.lock() = Some(outcome)
        });
        let outcome = result.lock().take();
        outcome.unwrap()
    }

    fn node(path: &str) -> Node {
        Node::root().child(path)
    }

    #[test]
    fn commit_writes_values_and_runs_completions() {
        let (db, txn) = setup();
        let saved = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&saved);
        txn.add_value(&node("users/alice/name"), "Alice").unwrap();
        txn.add_completion(move |ok| *sink.lock() = Some(ok)).unwrap();

        let outcome = commit_now(&txn);
        assert!(outcome.is_success());
        assert!(txn.is_completed());
        assert!(!txn.has_operations());
        assert_eq!(*saved.lock(), Some(true));
        assert_eq!(
            db.snapshot(&node("users/alice/name")).value,
            Some("Alice".into())
        );
    }

    #[test]
    fn reversions_run_in_reverse_order_when_precondition_rejects() {
        let (_db, txn) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let log = Arc::clone(&log);
            txn.add_reversion(move || log.lock().push(name)).unwrap();
        }
        txn.add_value(&node("a"), 1i64).unwrap();
        txn.add_precondition(|promise| promise.reject(CoreError::precondition("taken")))
            .unwrap();

        let outcome = commit_now(&txn);
        assert_eq!(outcome.state, TransactionState::Failed);
        assert!(outcome.is_reverted());
        assert_eq!(outcome.errors, vec![CoreError::precondition("taken")]);
        assert_eq!(*log.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn preconditions_added_by_preconditions_are_awaited() {
        let (db, txn) = setup();
        let counter = Arc::new(AtomicU64::new(0));
        let seen_at_commit = Arc::new(Mutex::new(None));

        let target = node("counter");
        let seen = Arc::clone(&seen_at_commit);
        let observed = Arc::clone(&counter);
        let token = db.observe(
            DataEvent::Value,
            &target,
            Arc::new(move |_: Snapshot, _: DataEvent| {
                *seen.lock() = Some(observed.load(Ordering::SeqCst));
            }),
            None,
        );

        let first = Arc::clone(&counter);
        let handle = txn.clone();
        txn.add_precondition(move |promise| {
            first.fetch_add(1, Ordering::SeqCst);
            let second = Arc::clone(&first);
            handle
                .add_precondition(move |promise| {
                    second.fetch_add(1, Ordering::SeqCst);
                    promise.fulfill();
                })
                .unwrap();
            promise.fulfill();
        })
        .unwrap();
        txn.add_value(&target, 1i64).unwrap();

        assert!(commit_now(&txn).is_success());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(*seen_at_commit.lock(), Some(2));
        db.remove_observer(&target, token);
    }

    #[test]
    fn cache_accepts_multi_level_writes() {
        let (db, txn) = setup();
        let multi = Node::new("a/b", Some(Node::root()));
        txn.add_value(&multi, true).unwrap();
        assert!(commit_now(&txn).is_success());
        assert!(db.snapshot(&Node::root()).exists());
    }

    #[test]
    fn rejects_unrooted_and_invalid_locations() {
        let (_db, txn) = setup();
        let err = txn.add_value(&Node::standalone("free"), 1i64).unwrap_err();
        assert!(err.is_structural());
        let err = txn.add_value(&node("bad.key"), 1i64).unwrap_err();
        assert!(matches!(err, CoreError::InvalidKey { .. }));
        assert!(!txn.has_operations());
    }

    #[test]
    fn merge_moves_operations_and_forwards_registrations() {
        let (db, txn) = setup();
        let other = Transaction::new(db.clone(), db.clone());
        let completed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&completed);

        txn.add_value(&node("a"), 1i64).unwrap();
        other.add_value(&node("b"), 2i64).unwrap();
        other.add_completion(move |ok| *sink.lock() = Some(ok)).unwrap();

        txn.merge(&other, MergeStrategy::New).unwrap();
        assert!(other.is_merged());
        other.add_value(&node("c"), 3i64).unwrap();
        assert!(txn.staged().child_by_node(&node("c")).is_some());

        assert!(commit_now(&txn).is_success());
        assert_eq!(*completed.lock(), Some(true));
        for (key, value) in [("a", 1i64), ("b", 2), ("c", 3)] {
            assert_eq!(db.snapshot(&node(key)).value, Some(value.into()));
        }
        assert!(txn.merge(&txn.clone(), MergeStrategy::New).is_err());
    }

    #[test]
    fn merge_strategy_decides_conflicts() {
        let (db, txn) = setup();
        let other = Transaction::new(db.clone(), db.clone());
        txn.add_value(&node("x"), "old").unwrap();
        other.add_value(&node("x"), "new").unwrap();
        txn.merge(&other, MergeStrategy::Old).unwrap();
        assert!(commit_now(&txn).is_success());
        assert_eq!(db.snapshot(&node("x")).value, Some("old".into()));
    }

    #[test]
    fn merge_with_pending_preconditions_is_deferred() {
        let (db, txn) = setup();
        let other = Transaction::new(db.clone(), db.clone());
        other.add_value(&node("later"), true).unwrap();
        other
            .add_precondition(|promise| promise.fulfill())
            .unwrap();

        txn.add_value(&node("now"), true).unwrap();
        txn.merge(&other, MergeStrategy::New).unwrap();
        assert_eq!(other.state(), TransactionState::Waiting);
        assert!(txn.staged().child_by_node(&node("later")).is_none());

        assert!(commit_now(&txn).is_success());
        assert!(other.is_merged());
        assert!(db.snapshot(&node("later")).exists());
        assert!(db.snapshot(&node("now")).exists());
    }

    #[test]
    fn cancel_skips_reversions() {
        let (_db, txn) = setup();
        let reverted = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reverted);
        let completed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&completed);
        txn.add_value(&node("a"), 1i64).unwrap();
        txn.add_reversion(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        txn.add_completion(move |ok| *sink.lock() = Some(ok)).unwrap();

        txn.cancel().unwrap();
        assert!(txn.is_cancelled());
        assert!(txn.is_invalidated());
        assert_eq!(reverted.load(Ordering::SeqCst), 0);
        assert_eq!(*completed.lock(), Some(false));
        assert!(txn.add_value(&node("b"), 2i64).is_err());
        assert!(txn.revert().is_err());
    }

    #[test]
    fn empty_transaction_fails() {
        let (_db, txn) = setup();
        let outcome = commit_now(&txn);
        assert_eq!(outcome.state, TransactionState::Failed);
        assert_eq!(outcome.errors, vec![CoreError::EmptyTransaction]);
    }

    #[test]
    fn second_commit_is_refused() {
        let (_db, txn) = setup();
        txn.add_value(&node("a"), 1i64).unwrap();
        assert!(commit_now(&txn).is_success());
        let outcome = commit_now(&txn);
        assert_eq!(outcome.state, TransactionState::Completed);
        assert!(matches!(
            outcome.errors[0],
            CoreError::InvalidOperation { .. }
        ));
    }

    #[test]
    fn current_reversion_runs_snapshot() {
        let (_db, txn) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            txn.add_reversion(move || log.lock().push(i)).unwrap();
        }
        let reversion = txn.current_reversion().unwrap();
        reversion();
        assert_eq!(*log.lock(), vec![2, 1, 0]);
        txn.cancel().unwrap();
    }
}
