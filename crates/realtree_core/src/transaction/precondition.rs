//! Asynchronous commit preconditions.

use crate::error::CoreError;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A check that must settle its promise before the commit proceeds.
pub type Precondition = Box<dyn FnOnce(PreconditionPromise) + Send>;

type Settled = Box<dyn FnOnce(Vec<CoreError>) + Send>;

/// One batch of preconditions run together.
pub(crate) struct Round {
    remaining: AtomicUsize,
    errors: Mutex<Vec<CoreError>>,
    on_settled: Mutex<Option<Settled>>,
}

impl Round {
    pub(crate) fn new(count: usize, on_settled: Settled) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            errors: Mutex::new(Vec::new()),
            on_settled: Mutex::new(Some(on_settled)),
        })
    }

    fn settle(&self, error: Option<CoreError>) {
        if let Some(error) = error {
            self.errors.lock().push(error);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            let errors = std::mem::take(&mut *self.errors.lock());
            let on_settled = self.on_settled.lock().take();
            if let Some(on_settled) = on_settled {
                on_settled(errors);
            }
        }
    }
}

/// Handle a precondition settles exactly once.
///
/// Dropping an unsettled promise rejects it.
pub struct PreconditionPromise {
    round: Option<Arc<Round>>,
}

impl PreconditionPromise {
    pub(crate) fn new(round: Arc<Round>) -> Self {
        Self { round: Some(round) }
    }

    /// Lets the commit proceed.
    pub fn fulfill(mut self) {
        if let Some(round) = self.round.take() {
            round.settle(None);
        }
    }

    /// Fails the commit with `error`.
    pub fn reject(mut self, error: CoreError) {
        if let Some(round) = self.round.take() {
            round.settle(Some(error));
        }
    }

    /// Settles with the result of a check.
    pub fn resolve(self, result: Result<(), CoreError>) {
        match result {
            Ok(()) => self.fulfill(),
            Err(error) => self.reject(error),
        }
    }
}

impl Drop for PreconditionPromise {
    fn drop(&mut self) {
        if let Some(round) = self.round.take() {
            round.settle(Some(CoreError::precondition(
                "promise dropped without result",
            )));
        }
    }
}

impl fmt::Debug for PreconditionPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreconditionPromise")
            .field("settled", &self.round.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(count: usize) -> (Arc<Round>, Arc<Mutex<Option<Vec<CoreError>>>>) {
        let result = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&result);
        let round = Round::new(count, Box::new(move |errors| *sink.lock() = Some(errors)));
        (round, result)
    }

    #[test]
    fn settles_after_all_promises() {
        let (round, result) = round(2);
        PreconditionPromise::new(Arc::clone(&round)).fulfill();
        assert!(result.lock().is_none());
        PreconditionPromise::new(round).reject(CoreError::precondition("taken"));
        let errors = result.lock().take().unwrap();
        assert_eq!(errors, vec![CoreError::precondition("taken")]);
    }

    #[test]
    fn dropped_promise_rejects() {
        let (round, result) = round(1);
        drop(PreconditionPromise::new(round));
        let errors = result.lock().take().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], CoreError::Precondition { .. }));
    }

    #[test]
    fn resolve_maps_results() {
        let (round, result) = round(2);
        PreconditionPromise::new(Arc::clone(&round)).resolve(Ok(()));
        PreconditionPromise::new(round).resolve(Err(CoreError::Timeout));
        assert_eq!(result.lock().take().unwrap(), vec![CoreError::Timeout]);
    }
}
