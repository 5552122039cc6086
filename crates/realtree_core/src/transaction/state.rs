//! Transaction state machine and commit results.

use crate::error::CoreError;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Collecting operations.
    Waiting,
    /// Commit sent to the database.
    Performing,
    /// All writes accepted.
    Completed,
    /// A precondition or a write failed.
    Failed,
    /// Cancelled before commit.
    Cancelled,
    /// Operations moved into another transaction.
    Merged,
}

impl TransactionState {
    /// Returns true if the transaction cannot be committed anymore.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Completed
                | TransactionState::Failed
                | TransactionState::Cancelled
                | TransactionState::Merged
        )
    }

    /// Returns true if reversions may run in this state.
    pub fn allows_reversion(&self) -> bool {
        matches!(self, TransactionState::Waiting | TransactionState::Failed)
    }
}

/// Secondary state recording that local changes were reverted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionSubstate {
    /// Nothing was reverted.
    #[default]
    None,
    /// Reversions ran.
    Reverted,
}

/// Options for [`Transaction::commit`](super::Transaction::commit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOptions {
    /// Run reversions when a precondition or a write fails.
    pub revert_on_error: bool,
    /// Send files together with values instead of after them.
    pub files_concurrently: bool,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            revert_on_error: true,
            files_concurrently: false,
        }
    }
}

impl CommitOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether reversions run on error.
    #[must_use]
    pub fn revert_on_error(mut self, revert: bool) -> Self {
        self.revert_on_error = revert;
        self
    }

    /// Sets whether files are sent concurrently with values.
    #[must_use]
    pub fn files_concurrently(mut self, concurrently: bool) -> Self {
        self.files_concurrently = concurrently;
        self
    }
}

/// Result of a commit attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitOutcome {
    /// State reached by the transaction.
    pub state: TransactionState,
    /// Whether reversions ran.
    pub substate: TransactionSubstate,
    /// Errors met on the way, in the order they were reported.
    pub errors: Vec<CoreError>,
}

impl CommitOutcome {
    pub(crate) fn new(
        state: TransactionState,
        substate: TransactionSubstate,
        errors: Vec<CoreError>,
    ) -> Self {
        Self {
            state,
            substate,
            errors,
        }
    }

    /// Returns true if the transaction completed without errors.
    pub fn is_success(&self) -> bool {
        self.state == TransactionState::Completed && self.errors.is_empty()
    }

    /// Returns true if reversions ran.
    pub fn is_reverted(&self) -> bool {
        self.substate == TransactionSubstate::Reverted
    }
}
