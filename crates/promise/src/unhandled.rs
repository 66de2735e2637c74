//! Coalesces unhandled rejections observed within the same turn.
//!
//! A promise reports itself here only after the deferred one-microtask
//! "is anyone listening yet?" check in [`crate::Promise`] still finds no
//! handler. `control_flow` owns one instance per flow and flushes it once
//! per turn; more than one rejection observed in a turn collapses into a
//! single [`MultipleUnhandledRejectionError`].

use std::cell::RefCell;

use crate::error::{FlowError, MultipleUnhandledRejectionError};

#[derive(Default)]
pub struct UnhandledRejectionTracker {
    pending: RefCell<Vec<FlowError>>,
}

impl UnhandledRejectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one rejection that was still unhandled after its deferred
    /// check fired.
    pub fn record(&self, reason: FlowError) {
        self.pending.borrow_mut().push(reason);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    /// Drains everything recorded so far. Returns `None` if nothing was
    /// pending, the lone error if exactly one was, or a
    /// [`FlowError::Multiple`] wrapping all of them otherwise.
    pub fn flush(&self) -> Option<FlowError> {
        let mut pending = self.pending.borrow_mut();
        match pending.len() {
            0 => None,
            1 => pending.pop(),
            _ => {
                let errors = std::mem::take(&mut *pending);
                Some(FlowError::Multiple(MultipleUnhandledRejectionError::new(
                    errors,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_flush_is_none() {
        let t = UnhandledRejectionTracker::new();
        assert!(t.flush().is_none());
    }

    #[test]
    fn single_rejection_passes_through() {
        let t = UnhandledRejectionTracker::new();
        t.record(FlowError::Discarded);
        assert!(matches!(t.flush(), Some(FlowError::Discarded)));
        assert!(t.flush().is_none());
    }

    #[test]
    fn multiple_rejections_coalesce() {
        let t = UnhandledRejectionTracker::new();
        t.record(FlowError::Discarded);
        t.record(FlowError::Cycle);
        match t.flush() {
            Some(FlowError::Multiple(m)) => assert_eq!(m.errors().len(), 2),
            other => panic!("expected Multiple, got {other:?}"),
        }
    }
}
