//! The abstract host a promise schedules its continuations on.
//!
//! `promise` has no dependency on `control_flow`. `control_flow`'s
//! `ControlFlow` implements [`HandlerHost`] and pushes itself onto the
//! thread-local active-host stack for the duration of a task, so promise
//! factories (`fulfilled`, `rejected`, `defer`) capture the right owner
//! without a static dependency edge between the two crates.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::FlowError;

/// Something a promise can schedule its handler callbacks on.
pub trait HandlerHost {
    /// Schedule `job` to run as a new microtask-equivalent unit of work.
    /// `description` is carried through for logging only.
    fn enqueue(&self, description: &'static str, job: Box<dyn FnOnce()>);

    /// Record a rejection that had no handler attached after one turn.
    fn report_unhandled(&self, reason: FlowError);
}

thread_local! {
    static ACTIVE_HOST: RefCell<Vec<Rc<dyn HandlerHost>>> = RefCell::new(Vec::new());
}

/// The currently active host, if any has been pushed via
/// [`push_active_host`]. Promises created with no active host behave as
/// plain, un-scheduled promises: their handlers run synchronously at attach
/// or settle time instead of being deferred to a task.
pub fn active_host() -> Option<Rc<dyn HandlerHost>> {
    ACTIVE_HOST.with(|stack| stack.borrow().last().cloned())
}

/// Restores the previous active host when dropped.
pub struct ActiveHostGuard(());

impl Drop for ActiveHostGuard {
    fn drop(&mut self) {
        ACTIVE_HOST.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Pushes `host` as the active host until the returned guard drops.
pub fn push_active_host(host: Rc<dyn HandlerHost>) -> ActiveHostGuard {
    ACTIVE_HOST.with(|stack| stack.borrow_mut().push(host));
    ActiveHostGuard(())
}
