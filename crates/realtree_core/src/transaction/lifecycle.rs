//! Hooks for values written through a transaction.

use super::{Reversion, Transaction};
use crate::error::CoreResult;
use crate::node::Node;

/// Lifecycle callbacks of a value saved, removed or updated by a
/// transaction.
///
/// `will_*` hooks run while the operation is staged, `did_*` hooks run after
/// a successful commit.
pub trait RealtimeValueEvents: Send + Sync {
    /// Called before the value is staged at `node`.
    fn will_save(&self, _transaction: &Transaction, _node: &Node) {}

    /// Called after the value was saved at `node`.
    fn did_save(&self, _node: &Node) {}

    /// Called before the value's removal is staged.
    fn will_remove(&self, _transaction: &Transaction) {}

    /// Called after the value was removed.
    fn did_remove(&self) {}

    /// Called before the value's changes are staged at `node`.
    fn will_update(&self, _transaction: &Transaction, _node: &Node) {}

    /// Called after the value's changes were saved at `node`.
    fn did_update(&self, _node: &Node) {}
}

/// A value that knows how to stage itself.
pub trait WritableValue: RealtimeValueEvents {
    /// Location the value is bound to, if any.
    fn node(&self) -> Option<Node>;

    /// Stages the whole value at `node`.
    fn write(&self, transaction: &Transaction, node: &Node) -> CoreResult<()>;

    /// Returns true if the value holds local changes not saved yet.
    fn has_changes(&self) -> bool {
        false
    }

    /// Stages only the local changes. Defaults to a full write.
    fn write_changes(&self, transaction: &Transaction, node: &Node) -> CoreResult<()> {
        self.write(transaction, node)
    }

    /// Returns a closure restoring the value's local state.
    fn current_reversion(&self) -> Reversion;
}
