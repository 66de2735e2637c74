//! A top-level sibling lane of frames.

use crate::frame::FrameHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueState {
    New,
    Started,
    Finished,
}

pub(crate) struct TaskQueue {
    pub root: FrameHandle,
    pub state: QueueState,
}
