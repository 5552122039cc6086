//! Commit flow: preconditions, value and file writes, reversion on error.

use super::precondition::{PreconditionPromise, Round};
use super::{CommitOptions, CommitOutcome, Transaction, TransactionState};
use crate::database::{FileCompletion, FilesCompletion};
use crate::error::CoreError;
use crate::staging::ObjectNode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Receives the result of a commit.
pub type OutcomeCompletion = Box<dyn FnOnce(CommitOutcome) + Send>;

type ErrorsCompletion = Box<dyn FnOnce(Vec<CoreError>) + Send>;

/// Waits for the value and the file writes of one commit.
struct CommitJoin {
    transaction: Transaction,
    options: CommitOptions,
    remaining: AtomicUsize,
    errors: Mutex<Vec<CoreError>>,
    completion: Mutex<Option<OutcomeCompletion>>,
}

impl CommitJoin {
    fn leave(&self, errors: Vec<CoreError>) {
        self.errors.lock().extend(errors);
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let errors = std::mem::take(&mut *self.errors.lock());
            if let Some(completion) = self.completion.lock().take() {
                self.transaction.complete(self.options, errors, completion);
            }
        }
    }
}

impl Transaction {
    /// Commits staged values and files.
    ///
    /// `completion` receives the reached state and every error met. Errors
    /// never surface synchronously: a refused commit (already committed,
    /// merged or in progress) is reported through `completion` too.
    pub fn commit(
        &self,
        options: CommitOptions,
        completion: impl FnOnce(CommitOutcome) + Send + 'static,
    ) {
        self.commit_with_files(options, completion, |_| {});
    }

    /// Commits like [`commit`](Self::commit) and reports per-file results
    /// to `files_completion`.
    pub fn commit_with_files(
        &self,
        options: CommitOptions,
        completion: impl FnOnce(CommitOutcome) + Send + 'static,
        files_completion: impl FnOnce(Vec<FileCompletion>) + Send + 'static,
    ) {
        let completion: OutcomeCompletion = Box::new(completion);
        let files_completion: FilesCompletion = Box::new(files_completion);
        {
            let mut inner = self.inner.lock();
            let refusal = if inner.merged_into.is_some() {
                Some("transaction already merged to other transaction")
            } else if inner.committing {
                Some("commit already in progress")
            } else if inner.state != TransactionState::Waiting {
                Some("transaction is invalidated, create a new one")
            } else {
                None
            };
            if let Some(message) = refusal {
                let outcome = CommitOutcome::new(
                    inner.state,
                    inner.substate,
                    vec![CoreError::invalid_operation(message)],
                );
                drop(inner);
                warn!(txn = self.id, message, "commit refused");
                completion(outcome);
                return;
            }
            inner.committing = true;
        }

        debug!(txn = self.id, "running preconditions");
        let transaction = self.clone();
        self.run_preconditions(Box::new(move |errors| {
            if errors.is_empty() {
                transaction.perform(options, completion, files_completion);
            } else {
                transaction.fail_preconditions(options, errors, completion);
            }
        }));
    }

    /// Commits and waits for the outcome.
    pub async fn commit_async(&self, options: CommitOptions) -> CommitOutcome {
        let (sender, receiver) = oneshot::channel();
        self.commit(options, move |outcome| {
            let _ = sender.send(outcome);
        });
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => CommitOutcome::new(
                self.state(),
                self.substate(),
                vec![CoreError::cancelled("commit completion dropped")],
            ),
        }
    }

    /// Runs preconditions in rounds until none are left.
    fn run_preconditions(&self, completion: ErrorsCompletion) {
        let preconditions = std::mem::take(&mut self.inner.lock().preconditions);
        if preconditions.is_empty() {
            completion(Vec::new());
            return;
        }

        debug!(txn = self.id, count = preconditions.len(), "precondition round");
        let transaction = self.clone();
        let round = Round::new(
            preconditions.len(),
            Box::new(move |mut errors| {
                transaction.run_preconditions(Box::new(move |more| {
                    errors.extend(more);
                    completion(errors);
                }));
            }),
        );
        for precondition in preconditions {
            precondition(PreconditionPromise::new(Arc::clone(&round)));
        }
    }

    fn fail_preconditions(
        &self,
        options: CommitOptions,
        errors: Vec<CoreError>,
        completion: OutcomeCompletion,
    ) {
        for error in &errors {
            warn!(txn = self.id, %error, "precondition failed");
        }
        if options.revert_on_error {
            if let Err(error) = self.revert() {
                error!(txn = self.id, %error, "reversion failed");
            }
        }
        self.finish(TransactionState::Failed, errors, completion);
    }

    fn perform(
        &self,
        options: CommitOptions,
        completion: OutcomeCompletion,
        files_completion: FilesCompletion,
    ) {
        if let Err(error) = self.apply_scheduled_merges() {
            error!(txn = self.id, %error, "scheduled merge failed");
            self.finish(TransactionState::Failed, vec![error], completion);
            return;
        }

        let update = {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Performing;
            Arc::new(inner.staged.clone())
        };
        if update.is_empty() {
            error!(txn = self.id, "tried to commit empty transaction");
            self.finish(
                TransactionState::Failed,
                vec![CoreError::EmptyTransaction],
                completion,
            );
            return;
        }

        debug!(
            txn = self.id,
            concurrently = options.files_concurrently,
            "committing"
        );
        let join = Arc::new(CommitJoin {
            transaction: self.clone(),
            options,
            remaining: AtomicUsize::new(2),
            errors: Mutex::new(Vec::new()),
            completion: Mutex::new(Some(completion)),
        });

        let run_files = {
            let transaction = self.clone();
            let update = Arc::clone(&update);
            let join = Arc::clone(&join);
            move || transaction.perform_files(&update, join, files_completion)
        };

        let values_join = Arc::clone(&join);
        if options.files_concurrently {
            self.database.commit(
                &update,
                Box::new(move |result| values_join.leave(result.err().into_iter().collect())),
            );
            run_files();
        } else {
            self.database.commit(
                &update,
                Box::new(move |result| {
                    values_join.leave(result.err().into_iter().collect());
                    run_files();
                }),
            );
        }
    }

    fn perform_files(
        &self,
        update: &ObjectNode,
        join: Arc<CommitJoin>,
        files_completion: FilesCompletion,
    ) {
        if update.files().is_empty() {
            files_completion(Vec::new());
            join.leave(Vec::new());
            return;
        }
        let id = self.id;
        self.storage.commit_files(
            update,
            Box::new(move |results| {
                let errors: Vec<CoreError> = results
                    .iter()
                    .filter_map(|result| match result {
                        FileCompletion::Error(node, error) => {
                            warn!(txn = id, node = %node, %error, "file commit failed");
                            Some(error.clone())
                        }
                        FileCompletion::Meta(_) => None,
                    })
                    .collect();
                files_completion(results);
                join.leave(errors);
            }),
        );
    }

    fn complete(&self, options: CommitOptions, errors: Vec<CoreError>, completion: OutcomeCompletion) {
        if errors.is_empty() {
            self.finish(TransactionState::Completed, errors, completion);
            return;
        }
        for error in &errors {
            error!(txn = self.id, %error, "commit failed");
        }
        self.inner.lock().state = TransactionState::Failed;
        if options.revert_on_error {
            if let Err(error) = self.revert() {
                error!(txn = self.id, %error, "reversion failed");
            }
        }
        self.finish(TransactionState::Failed, errors, completion);
    }

    fn finish(&self, state: TransactionState, errors: Vec<CoreError>, completion: OutcomeCompletion) {
        let (spent, outcome) = {
            let mut inner = self.inner.lock();
            inner.state = state;
            inner.committing = false;
            let spent = inner.invalidate();
            (spent, CommitOutcome::new(inner.state, inner.substate, errors))
        };
        debug!(txn = self.id, ?state, errors = outcome.errors.len(), "transaction finished");
        spent.finish(state == TransactionState::Completed);
        completion(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryDatabase;
    use crate::node::Node;
    use crate::staging::FileMetadata;
    use crate::database::RealtimeStorage;

    #[tokio::test]
    async fn commit_async_resolves_outcome() {
        let db = Arc::new(InMemoryDatabase::new());
        let txn = Transaction::new(db.clone(), db.clone());
        txn.add_value(&Node::root().child("async/value"), 42i64)
            .unwrap();
        let outcome = txn.commit_async(CommitOptions::default()).await;
        assert!(outcome.is_success());
        assert_eq!(
            db.snapshot(&Node::root().child("async/value")).value,
            Some(42i64.into())
        );
    }

    #[test]
    fn files_are_reported_and_stored() {
        let db = Arc::new(InMemoryDatabase::new());
        let txn = Transaction::new(db.clone(), db.clone());
        let avatar = Node::root().child("users/alice/avatar");
        let mut metadata = FileMetadata::new();
        metadata.insert("contentType".to_string(), "image/png".into());
        txn.add_file(&avatar, vec![1, 2, 3], metadata).unwrap();

        let files = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&files);
        let outcome = Arc::new(Mutex::new(None));
        let result = Arc::clone(&outcome);
        txn.commit_with_files(
            CommitOptions::new().files_concurrently(true),
            move |o| *result.lock() = Some(o),
            move |f| *sink.lock() = f,
        );

        assert!(outcome.lock().as_ref().unwrap().is_success());
        assert_eq!(files.lock().len(), 1);
        assert!(matches!(files.lock()[0], FileCompletion::Meta(_)));

        let data = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&data);
        let _task = db.load_file(
            &avatar,
            std::time::Duration::from_secs(1),
            Box::new(move |bytes| *sink.lock() = bytes),
            None,
        );
        assert_eq!(*data.lock(), Some(vec![1, 2, 3]));
    }
}
