//! A scheduled unit of work.

use crate::frame::FrameHandle;
use crate::FlowError;

/// What running a task's body told the scheduler, for the purpose of
/// deciding whether to keep draining a frame or discard its remaining
/// siblings.
pub(crate) enum TaskOutcome {
    Ok,
    Err(FlowError),
}

pub(crate) struct Task {
    pub description: &'static str,
    pub parent: FrameHandle,
    /// Pre-allocated at scheduling time, not run time, so the task's own
    /// result promise can be bound to it immediately (see
    /// `control_flow::FrameBoundHost`) and a `.then()` attached before the
    /// task even runs still schedules its sub-commands here.
    pub frame: FrameHandle,
    pub body: Option<Box<dyn FnOnce() -> TaskOutcome>>,
    /// Rejects the task's own promise with the given reason without
    /// running `body`. Used when a sibling in the same frame already
    /// failed and this task is discarded instead of run.
    pub discard: Option<Box<dyn FnOnce(FlowError)>>,
}
