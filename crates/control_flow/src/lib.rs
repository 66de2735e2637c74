//! # Control Flow
//!
//! A deterministic cooperative task scheduler layered on [`promise`]. Tasks
//! scheduled with [`ControlFlow::execute`] run one at a time, depth-first:
//! a task can schedule sub-commands that run to completion before its own
//! later siblings, matching the ordering a sequential script would produce
//! if each `execute` call blocked until settled.
//!
//! ```
//! use control_flow::ControlFlow;
//!
//! let flow = ControlFlow::new();
//! flow.execute("say hi", || {
//!     println!("hi");
//!     Ok(())
//! });
//! flow.run_until_idle();
//! ```

#![forbid(unsafe_code)]

mod config;
mod control_flow;
mod events;
mod frame;
mod queue;
mod task;
mod time;
mod wait;

pub use config::{ControlFlowConfig, ControlFlowConfigBuilder};
pub use control_flow::{control_flow, create_flow, ActiveFlowGuard, ControlFlow};
pub use events::{Event, EventKind, ListenerId};
pub use frame::{FrameHandle, TaskHandle};
pub use promise::FlowError;
pub use queue::QueueState;
pub use time::{Clock, ManualClock, SystemClock};
pub use wait::WaitOutcome;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn tasks_run_in_schedule_order() {
        let flow = ControlFlow::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log1 = log.clone();
        flow.execute("first", move || {
            log1.borrow_mut().push(1);
            Ok::<_, FlowError>(())
        });
        let log2 = log.clone();
        flow.execute("second", move || {
            log2.borrow_mut().push(2);
            Ok::<_, FlowError>(())
        });

        flow.run_until_idle();
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn sub_tasks_run_before_later_siblings() {
        let flow = ControlFlow::new();
        let log = Rc::new(RefCell::new(Vec::new()));

        let log1 = log.clone();
        let flow1 = flow.clone();
        flow.execute("outer", move || {
            log1.borrow_mut().push("outer-start");
            let log_inner = log1.clone();
            flow1.execute("inner", move || {
                log_inner.borrow_mut().push("inner");
                Ok::<_, FlowError>(())
            });
            Ok::<_, FlowError>(())
        });
        let log2 = log.clone();
        flow.execute("sibling", move || {
            log2.borrow_mut().push("sibling");
            Ok::<_, FlowError>(())
        });

        flow.run_until_idle();
        assert_eq!(*log.borrow(), vec!["outer-start", "inner", "sibling"]);
    }

    #[test]
    fn failed_task_discards_later_siblings_in_same_frame() {
        let flow = ControlFlow::new();
        let ran = Rc::new(RefCell::new(false));

        let failed = flow.execute("fails", || Err::<(), _>(FlowError::Cycle));
        failed.catch("observe-fails", |_| {});
        let ran2 = ran.clone();
        let discarded = flow.execute("never runs", move || {
            *ran2.borrow_mut() = true;
            Ok::<_, FlowError>(())
        });

        // A `.catch` attached before the discard fires must never see it:
        // a discarded sibling is absorbed by the scheduler entirely, not
        // delivered as an ordinary rejection.
        let catch_fired = Rc::new(RefCell::new(false));
        let catch_fired2 = catch_fired.clone();
        discarded.catch("observe", move |_| {
            *catch_fired2.borrow_mut() = true;
        });

        let uncaught = Rc::new(RefCell::new(false));
        let uncaught2 = uncaught.clone();
        flow.on(EventKind::UncaughtException, move |_| *uncaught2.borrow_mut() = true);

        flow.run_until_idle();
        assert!(!*ran.borrow());
        assert!(!*catch_fired.borrow());
        assert!(!*uncaught.borrow());
    }

    #[test]
    fn idle_fires_once_flow_drains() {
        let flow = ControlFlow::new();
        let idle_count = Rc::new(RefCell::new(0));
        let count = idle_count.clone();
        flow.on(EventKind::Idle, move |_| *count.borrow_mut() += 1);

        flow.execute("noop", || Ok::<_, FlowError>(()));
        flow.run_until_idle();

        assert_eq!(*idle_count.borrow(), 1);
    }

    #[test]
    fn reset_clears_pending_work_and_emits_reset_then_idle() {
        let flow = ControlFlow::new();
        let events_seen = Rc::new(RefCell::new(Vec::new()));
        let seen1 = events_seen.clone();
        flow.on(EventKind::Reset, move |_| seen1.borrow_mut().push("reset"));
        let seen2 = events_seen.clone();
        flow.on(EventKind::Idle, move |_| seen2.borrow_mut().push("idle"));

        flow.execute("never runs", || Ok::<_, FlowError>(()));
        flow.reset();

        assert_eq!(*events_seen.borrow(), vec!["reset", "idle"]);
    }
}
