//! Polling-wait helper layered on top of [`ControlFlow::execute`].
//!
//! Each poll of the condition runs as its own task, so it gets its own
//! sub-frame the way any other scheduled work does; re-polling is driven by
//! a timer rather than literal recursion so the call stack never grows with
//! the number of polls.

use std::cell::RefCell;
use std::rc::Rc;

use promise::{FlowError, Promise};

use crate::control_flow::ControlFlow;
use crate::frame::FrameHandle;

/// What a `wait` condition reports on each poll.
pub enum WaitOutcome<T> {
    /// The condition is satisfied; stop polling and fulfill with this value.
    Done(T),
    /// Not yet; poll again after the configured interval.
    NotYet,
    /// The condition itself failed; stop polling and reject.
    Failed(FlowError),
}

impl ControlFlow {
    /// Repeatedly evaluates `condition` (on its own task each time) until it
    /// reports [`WaitOutcome::Done`], `timeout_ms` elapses, or the condition
    /// reports [`WaitOutcome::Failed`].
    ///
    /// `timeout_ms` of `None` falls back to
    /// [`crate::config::ControlFlowConfig::default_wait_timeout_ms`]; if that
    /// is also `None`, the wait has no timeout and polls forever.
    pub fn wait<T, F>(
        &self,
        description: &'static str,
        timeout_ms: Option<u64>,
        condition: F,
    ) -> Promise<T>
    where
        T: Clone + 'static,
        F: FnMut() -> WaitOutcome<T> + 'static,
    {
        let timeout_ms = timeout_ms.or(self.config().default_wait_timeout_ms);
        let poll_interval_ms = self.config().wait_poll_interval_ms;
        let deadline = timeout_ms.map(|ms| self.now() + std::time::Duration::from_millis(ms));

        let deferred = {
            let _guard = self.as_active();
            Promise::<T>::deferred(description)
        };
        let result = deferred.promise();
        let flow = self.clone();
        let condition: Rc<RefCell<Box<dyn FnMut() -> WaitOutcome<T>>>> =
            Rc::new(RefCell::new(Box::new(condition)));
        let parent = self.current_append_frame();
        poll_wait(flow, parent, description, deferred, condition, deadline, timeout_ms, poll_interval_ms);
        result
    }

    /// Races `promise`'s settlement against an optional timeout. A
    /// `timeout_ms` of `0` or `None` waits forever.
    pub fn wait_for_promise<T>(
        &self,
        description: &'static str,
        promise: Promise<T>,
        timeout_ms: Option<u64>,
    ) -> Promise<T>
    where
        T: Clone + 'static,
    {
        let timeout_ms = match timeout_ms.or(self.config().default_wait_timeout_ms) {
            Some(0) | None => None,
            Some(ms) => Some(ms),
        };

        let deferred = {
            let _guard = self.as_active();
            Promise::<T>::deferred(description)
        };
        let result = deferred.promise();

        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        promise.then_catch(
            description,
            move |v: T| deferred_ok.fulfill(v),
            move |e: FlowError| deferred_err.reject(e),
        );

        if let Some(ms) = timeout_ms {
            let deferred_timeout = deferred.clone();
            self.schedule_timer(ms, move || {
                deferred_timeout.reject(FlowError::WaitTimeout {
                    timeout_ms: ms,
                    description: description.to_string(),
                });
            });
        }

        result
    }
}

#[derive(Clone)]
enum PollStep<T> {
    Done(T),
    NotYet,
}

#[allow(clippy::too_many_arguments)]
fn poll_wait<T: Clone + 'static>(
    flow: ControlFlow,
    parent: FrameHandle,
    description: &'static str,
    deferred: promise::Deferred<T>,
    condition: Rc<RefCell<Box<dyn FnMut() -> WaitOutcome<T>>>>,
    deadline: Option<std::time::Instant>,
    timeout_ms: Option<u64>,
    poll_interval_ms: u64,
) {
    if !deferred.promise().is_pending() {
        return;
    }

    let condition_for_body = condition.clone();
    let (outcome, child) = flow.execute_in_frame(parent, description, move || {
        match (condition_for_body.borrow_mut())() {
            WaitOutcome::Done(v) => Ok(PollStep::Done(v)),
            WaitOutcome::NotYet => Ok(PollStep::NotYet),
            WaitOutcome::Failed(e) => Err(e),
        }
    });

    let deferred_for_then = deferred.clone();
    let flow_for_then = flow.clone();
    outcome.then(description, move |step| match step {
        PollStep::Done(v) => deferred_for_then.fulfill(v),
        PollStep::NotYet => {
            if let Some(deadline) = deadline {
                if flow_for_then.now() >= deadline {
                    deferred_for_then.reject(FlowError::WaitTimeout {
                        timeout_ms: timeout_ms.unwrap_or_default(),
                        description: description.to_string(),
                    });
                    return;
                }
            }
            let flow_for_timer = flow_for_then.clone();
            let deferred_for_timer = deferred_for_then.clone();
            // Fired from a bare timer callback with nothing on the active
            // stack, so the next poll must be pinned to this poll's own
            // freshly-allocated frame explicitly rather than rediscovered
            // ambiently — otherwise it would land on whatever queue happens
            // to be last once this one is merely blocked, not finished.
            flow_for_then.schedule_timer(poll_interval_ms, move || {
                poll_wait(
                    flow_for_timer,
                    child,
                    description,
                    deferred_for_timer,
                    condition,
                    deadline,
                    timeout_ms,
                    poll_interval_ms,
                );
            });
        }
    });
}
