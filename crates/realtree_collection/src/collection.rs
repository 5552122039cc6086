//! Common interface of ordered remote collections.

use crate::element::CollectionElement;
use crate::error::CollectionResult;
use crate::event::CollectionChange;
use realtree_core::Node;
use std::sync::mpsc::Receiver;

/// An ordered, locally mirrored remote collection.
///
/// Lets code hold different collection implementations behind one trait
/// object, e.g. `Arc<dyn OrderedRemoteCollection<Element = CollectionItem>>`.
pub trait OrderedRemoteCollection: Send + Sync {
    /// Element type.
    type Element: CollectionElement;

    /// Location of the collection, if bound.
    fn node(&self) -> Option<Node>;

    /// Number of mirrored elements.
    fn len(&self) -> usize;

    /// True if no element is mirrored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`.
    fn element(&self, index: usize) -> Option<Self::Element>;

    /// Copy of the mirrored elements in order.
    fn elements(&self) -> Vec<Self::Element>;

    /// True once the mirror reflects a full load.
    fn is_synced(&self) -> bool;

    /// True while remote changes are observed.
    fn is_observed(&self) -> bool;

    /// Receives every change applied from now on.
    fn subscribe(&self) -> Receiver<CollectionChange>;

    /// Starts mirroring remote changes.
    fn run_observing(&self) -> CollectionResult<()>;

    /// Stops mirroring remote changes.
    fn stop_observing(&self);
}
