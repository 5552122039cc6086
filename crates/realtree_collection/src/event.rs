//! Change events emitted by ordered views.

use crate::error::CollectionResult;
use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// A change of an ordered view, expressed in element indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionEvent {
    /// The whole view was rebuilt.
    Initial,
    /// Individual elements changed.
    Updated {
        /// Indexes removed, relative to the view before the change.
        deleted: Vec<usize>,
        /// Indexes inserted, relative to the view after the change.
        inserted: Vec<usize>,
        /// Indexes whose element changed in place.
        modified: Vec<usize>,
        /// Elements moved from one index to another.
        moved: Vec<(usize, usize)>,
    },
}

impl CollectionEvent {
    /// Creates an insertion event.
    pub fn inserted(indexes: Vec<usize>) -> Self {
        Self::Updated {
            deleted: Vec::new(),
            inserted: indexes,
            modified: Vec::new(),
            moved: Vec::new(),
        }
    }

    /// Creates a deletion event.
    pub fn deleted(indexes: Vec<usize>) -> Self {
        Self::Updated {
            deleted: indexes,
            inserted: Vec::new(),
            modified: Vec::new(),
            moved: Vec::new(),
        }
    }

    /// Creates an in-place modification event.
    pub fn modified(indexes: Vec<usize>) -> Self {
        Self::Updated {
            deleted: Vec::new(),
            inserted: Vec::new(),
            modified: indexes,
            moved: Vec::new(),
        }
    }

    /// Creates a move event.
    pub fn moved(moves: Vec<(usize, usize)>) -> Self {
        Self::Updated {
            deleted: Vec::new(),
            inserted: Vec::new(),
            modified: Vec::new(),
            moved: moves,
        }
    }

    /// True for [`CollectionEvent::Initial`].
    pub fn is_initial(&self) -> bool {
        matches!(self, CollectionEvent::Initial)
    }
}

/// Item delivered to view subscribers: an event or the error that broke
/// the mirror.
pub type CollectionChange = CollectionResult<CollectionEvent>;

/// Distributes view changes to subscribers.
#[derive(Default)]
pub(crate) struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<CollectionChange>>>,
}

impl ChangeFeed {
    pub(crate) fn subscribe(&self) -> Receiver<CollectionChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends to every live subscriber, dropping disconnected ones.
    pub(crate) fn emit(&self, change: CollectionChange) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollectionError;

    #[test]
    fn emit_and_receive() {
        let feed = ChangeFeed::default();
        let rx1 = feed.subscribe();
        let rx2 = feed.subscribe();

        feed.emit(Ok(CollectionEvent::inserted(vec![2])));
        assert_eq!(rx1.recv().unwrap(), Ok(CollectionEvent::inserted(vec![2])));
        assert_eq!(rx2.recv().unwrap(), Ok(CollectionEvent::inserted(vec![2])));
    }

    #[test]
    fn errors_are_delivered() {
        let feed = ChangeFeed::default();
        let rx = feed.subscribe();
        feed.emit(Err(CollectionError::item_not_found("k")));
        assert!(rx.recv().unwrap().is_err());
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = ChangeFeed::default();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);
        drop(rx);
        feed.emit(Ok(CollectionEvent::Initial));
        assert_eq!(feed.subscriber_count(), 0);
    }
}
