//! The scheduler itself: owns the frame tree, drives task execution, and
//! emits `idle` / `uncaughtException` / `reset` events.
//!
//! The drain loop (`pump_once`) is a direct generalization of the teacher's
//! `EventLoop::tick`: fire due timers, drain pending microtask-equivalent
//! continuations, then run exactly one task. The frame tree replaces the
//! teacher's flat macro-task queue so that a task can schedule sub-commands
//! that run before its own later siblings.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::Duration;

use arena::Arena;
use promise::{FlowError, HandlerHost, Promise, UnhandledRejectionTracker};

use crate::config::ControlFlowConfig;
use crate::events::{Event, EventKind, EventTable, ListenerId};
use crate::frame::{Frame, FrameHandle, Node, TaskHandle};
use crate::task::{Task, TaskOutcome};
use crate::time::{Clock, SystemClock, Timers};

pub(crate) struct ControlFlowState {
    self_weak: RefCell<Weak<ControlFlowState>>,
    frames: RefCell<Arena<Frame>>,
    tasks: RefCell<Arena<Task>>,
    queues: RefCell<Vec<crate::queue::TaskQueue>>,
    active_stack: RefCell<Vec<FrameHandle>>,
    microtasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
    timers: RefCell<Timers>,
    clock: Box<dyn Clock>,
    events: RefCell<EventTable>,
    unhandled: UnhandledRejectionTracker,
    unhandled_flush_scheduled: Cell<bool>,
    config: ControlFlowConfig,
}

impl HandlerHost for ControlFlowState {
    fn enqueue(&self, description: &'static str, job: Box<dyn FnOnce()>) {
        tracing::debug!(description, "enqueue continuation");
        self.microtasks.borrow_mut().push_back(job);
    }

    fn report_unhandled(&self, reason: FlowError) {
        tracing::warn!(reason = %reason, "unhandled rejection");
        self.unhandled.record(reason);
        if !self.unhandled_flush_scheduled.replace(true) {
            let this = self
                .self_weak
                .borrow()
                .upgrade()
                .expect("control flow still alive while it owns the rejection");
            self.microtasks
                .borrow_mut()
                .push_back(Box::new(move || this.flush_unhandled_and_emit()));
        }
    }
}

impl ControlFlowState {
    fn flush_unhandled_and_emit(&self) {
        self.unhandled_flush_scheduled.set(false);
        if let Some(reason) = self.unhandled.flush() {
            self.events.borrow_mut().emit(&Event::UncaughtException(reason));
        }
    }
}

/// What a task body reported to [`ControlFlow::schedule_task_body`]: either
/// a plain value, an inner promise to assimilate the task's own result into,
/// or a failure to annotate and reject with.
enum TaskBody<T> {
    Value(T),
    Assimilate(Promise<T>),
    Failed(FlowError),
}

/// A [`HandlerHost`] bound to one task's own frame.
///
/// A promise created while this host is active (a task's own result
/// promise) keeps rescheduling continuations into `frame`, however long
/// after the task's synchronous body returned they fire — this is what lets
/// `promise.then(|| flow.execute(...))` attached to a task's result still
/// land its sub-command in that task's frame instead of wherever happens to
/// be active when the continuation runs.
struct FrameBoundHost {
    state: Rc<ControlFlowState>,
    frame: FrameHandle,
}

impl HandlerHost for FrameBoundHost {
    fn enqueue(&self, description: &'static str, job: Box<dyn FnOnce()>) {
        let state = self.state.clone();
        let frame = self.frame;
        let wrapped: Box<dyn FnOnce()> = Box::new(move || {
            state.active_stack.borrow_mut().push(frame);
            struct PopOnDrop<'a>(&'a Rc<ControlFlowState>);
            impl Drop for PopOnDrop<'_> {
                fn drop(&mut self) {
                    self.0.active_stack.borrow_mut().pop();
                }
            }
            let _guard = PopOnDrop(&state);
            job();
        });
        self.state.enqueue(description, wrapped);
    }

    fn report_unhandled(&self, reason: FlowError) {
        self.state.report_unhandled(reason);
    }
}

/// A deterministic cooperative scheduler: owns a tree of task queues and
/// runs exactly one task body at a time.
///
/// Cloning a `ControlFlow` shares the same underlying scheduler (it's a
/// reference-counted handle), matching the single-threaded cooperative
/// model the whole crate targets.
pub struct ControlFlow(Rc<ControlFlowState>);

impl Clone for ControlFlow {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl Default for ControlFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlFlow {
    pub fn new() -> Self {
        Self::with_clock_and_config(Box::new(SystemClock), ControlFlowConfig::default())
    }

    pub fn with_config(config: ControlFlowConfig) -> Self {
        Self::with_clock_and_config(Box::new(SystemClock), config)
    }

    pub fn with_clock_and_config(clock: Box<dyn Clock>, config: ControlFlowConfig) -> Self {
        let state = Rc::new(ControlFlowState {
            self_weak: RefCell::new(Weak::new()),
            frames: RefCell::new(Arena::new()),
            tasks: RefCell::new(Arena::new()),
            queues: RefCell::new(Vec::new()),
            active_stack: RefCell::new(Vec::new()),
            microtasks: RefCell::new(VecDeque::new()),
            timers: RefCell::new(Timers::new()),
            clock,
            events: RefCell::new(EventTable::new()),
            unhandled: UnhandledRejectionTracker::new(),
            unhandled_flush_scheduled: Cell::new(false),
            config,
        });
        *state.self_weak.borrow_mut() = Rc::downgrade(&state);
        Self(state)
    }

    pub fn config(&self) -> ControlFlowConfig {
        self.0.config
    }

    pub fn now(&self) -> std::time::Instant {
        self.0.clock.now()
    }

    /// Pushes this flow as the active promise host for as long as the
    /// returned guard lives, so promises created in that window capture it.
    pub(crate) fn as_active(&self) -> promise::ActiveHostGuard {
        promise::push_active_host(self.0.clone())
    }

    pub(crate) fn schedule_timer(&self, delay_ms: u64, callback: impl FnOnce() + 'static) {
        let fire_at = self.0.clock.now() + Duration::from_millis(delay_ms);
        self.0
            .timers
            .borrow_mut()
            .schedule_at(fire_at, Box::new(callback));
    }

    /// Schedules `value` to fulfill a promise after `delay_ms`.
    pub fn delayed<T: Clone + 'static>(&self, delay_ms: u64, value: T) -> Promise<T> {
        let deferred = {
            let _guard = self.as_active();
            Promise::<T>::deferred("delayed")
        };
        let promise = deferred.promise();
        self.schedule_timer(delay_ms, move || deferred.fulfill(value));
        promise
    }

    /// An already-fulfilled promise bound to this flow.
    pub fn fulfilled<T: Clone + 'static>(&self, value: T) -> Promise<T> {
        let _guard = self.as_active();
        promise::fulfilled(value)
    }

    /// An already-rejected promise bound to this flow.
    pub fn rejected<T: Clone + 'static>(&self, reason: FlowError) -> Promise<T> {
        let _guard = self.as_active();
        promise::rejected(reason)
    }

    /// Resolves a collection of promises down to one promise of their
    /// results, bound to this flow.
    pub fn fully_resolved<T: Clone + 'static>(&self, values: Vec<Promise<T>>) -> Promise<Vec<T>> {
        let _guard = self.as_active();
        promise::fully_resolved(values)
    }

    /// Schedules `f` to run once the task ahead of it (if any) in the
    /// currently active frame settles, returning a promise for its result.
    ///
    /// The returned promise stays bound to this task's own sub-frame for
    /// its whole lifetime: any `.then()`/`.catch()`/`.and_then()` chained
    /// onto it, whenever it fires, schedules further `execute()` calls into
    /// that same frame rather than wherever happens to be active at the
    /// time — so the later siblings of this task wait not just for its body
    /// to return but for its whole promise chain to settle.
    pub fn execute<T, F>(&self, description: &'static str, f: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: FnOnce() -> Result<T, FlowError> + 'static,
    {
        let parent = self.current_append_frame();
        self.execute_in_frame(parent, description, f).0
    }

    /// Like [`Self::execute`], but the body itself returns a promise that
    /// the task's own result is assimilated into, instead of a plain value.
    /// The task's frame stays open, blocking its later siblings, until that
    /// inner promise itself settles rather than the instant the body
    /// returns — the thenable-assimilation path `execute` can't express.
    pub fn execute_async<T, F>(&self, description: &'static str, f: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: FnOnce() -> Result<Promise<T>, FlowError> + 'static,
    {
        let parent = self.current_append_frame();
        self.schedule_task_body(parent, description, move || match f() {
            Ok(inner) => TaskBody::Assimilate(inner),
            Err(e) => TaskBody::Failed(e),
        })
        .0
    }

    /// Like [`Self::execute`], but appends the task directly under `parent`
    /// instead of consulting the active frame stack, and also returns the
    /// fresh sub-frame allocated for this task's own continuations.
    /// `wait` uses this to thread a re-poll scheduled from a bare timer
    /// callback back into the previous poll's own frame, since a timer
    /// callback runs with nothing on the active stack for
    /// `current_append_frame` to find.
    pub(crate) fn execute_in_frame<T, F>(
        &self,
        parent: FrameHandle,
        description: &'static str,
        f: F,
    ) -> (Promise<T>, FrameHandle)
    where
        T: Clone + 'static,
        F: FnOnce() -> Result<T, FlowError> + 'static,
    {
        self.schedule_task_body(parent, description, move || match f() {
            Ok(v) => TaskBody::Value(v),
            Err(e) => TaskBody::Failed(e),
        })
    }

    /// Shared machinery behind `execute`/`execute_async`: allocates the
    /// task's sub-frame, binds its result promise to a [`FrameBoundHost`]
    /// so continuations land back in that frame, settles or assimilates the
    /// task's own deferred from whatever `run_body` reports, and schedules
    /// the task. A rejection is wrapped in [`FlowError::Annotated`] with the
    /// task's scheduling chain before the deferred is settled, so every
    /// handler and the unhandled-rejection tracker alike see the annotated
    /// reason.
    fn schedule_task_body<T, B>(
        &self,
        parent: FrameHandle,
        description: &'static str,
        run_body: B,
    ) -> (Promise<T>, FrameHandle)
    where
        T: Clone + 'static,
        B: FnOnce() -> TaskBody<T> + 'static,
    {
        let child = FrameHandle(
            self.0
                .frames
                .borrow_mut()
                .allocate(Frame::new_child(parent, description)),
        );

        let deferred = {
            let host: Rc<dyn HandlerHost> = Rc::new(FrameBoundHost {
                state: self.0.clone(),
                frame: child,
            });
            let _guard = promise::push_active_host(host);
            Promise::<T>::deferred(description)
        };
        let result_promise = deferred.promise();

        let state_for_settle = self.0.clone();
        result_promise.observe(move || {
            if let Some(frame) = state_for_settle.frames.borrow_mut().get_mut(child.0) {
                frame.task_settled.set(true);
            }
        });

        let chain = self.task_chain(parent, description);
        let long_stack_traces = self.0.config.long_stack_traces;
        let deferred_for_body = deferred.clone();
        let body: Box<dyn FnOnce() -> TaskOutcome> = Box::new(move || {
            // A promise cancelled before its task ran (e.g. via
            // `promise.cancel(...)` while still queued) is already settled
            // by the time the scheduler gets to it; the body never runs,
            // and this does not poison the frame the way a real failure
            // does — later siblings still run normally.
            if !deferred_for_body.promise().is_pending() {
                return TaskOutcome::Ok;
            }
            match run_body() {
                TaskBody::Value(v) => {
                    deferred_for_body.fulfill(v);
                    TaskOutcome::Ok
                }
                TaskBody::Assimilate(inner) => {
                    deferred_for_body.resolve_with(inner);
                    TaskOutcome::Ok
                }
                TaskBody::Failed(e) => {
                    let reason = if long_stack_traces {
                        FlowError::Annotated {
                            reason: Box::new(e.clone()),
                            chain: chain.join(" > "),
                        }
                    } else {
                        FlowError::Annotated {
                            reason: Box::new(e.clone()),
                            chain: description.to_string(),
                        }
                    };
                    deferred_for_body.reject(reason);
                    TaskOutcome::Err(e)
                }
            }
        });
        let discard: Box<dyn FnOnce(FlowError)> =
            Box::new(move |reason| deferred.discard_silently(reason));
        self.schedule_task(parent, child, description, body, discard);
        (result_promise, child)
    }

    /// A new task scheduled with no frame on the active stack (top-level
    /// code, or a bare timer callback) joins the last queue only while that
    /// queue is still `New` — i.e. nothing has been dequeued from it yet.
    /// Once a queue has `Started`, ambient scheduling with no active frame
    /// opens a fresh sibling queue instead of reusing it, even if the
    /// existing queue is merely blocked deep in its tree rather than
    /// finished: reusing it there would let unrelated work cut in front of
    /// whatever that queue is still waiting on.
    pub(crate) fn current_append_frame(&self) -> FrameHandle {
        if let Some(&top) = self.0.active_stack.borrow().last() {
            return top;
        }
        let mut queues = self.0.queues.borrow_mut();
        if let Some(q) = queues.last() {
            if q.state == crate::queue::QueueState::New {
                return q.root;
            }
        }
        let root = FrameHandle(self.0.frames.borrow_mut().allocate(Frame::new_root()));
        queues.push(crate::queue::TaskQueue {
            root,
            state: crate::queue::QueueState::New,
        });
        root
    }

    /// Builds the description chain leading to a task about to be scheduled
    /// under `parent`: every ancestor task-owned frame's description,
    /// root-to-leaf, followed by this task's own. Captured at scheduling
    /// time (not at rejection time) so it reflects how the task came to be
    /// scheduled, not whatever happens to be on the active stack when it
    /// eventually fails.
    fn task_chain(&self, parent: FrameHandle, description: &'static str) -> Vec<&'static str> {
        let frames = self.0.frames.borrow();
        let mut chain = Vec::new();
        let mut cursor = Some(parent);
        while let Some(h) = cursor {
            let frame = match frames.get(h.0) {
                Some(f) => f,
                None => break,
            };
            if let Some(d) = frame.description {
                chain.push(d);
            }
            cursor = frame.parent;
        }
        chain.reverse();
        chain.push(description);
        chain
    }

    fn schedule_task(
        &self,
        parent: FrameHandle,
        child: FrameHandle,
        description: &'static str,
        body: Box<dyn FnOnce() -> TaskOutcome>,
        discard: Box<dyn FnOnce(FlowError)>,
    ) {
        let handle = TaskHandle(self.0.tasks.borrow_mut().allocate(Task {
            description,
            parent,
            frame: child,
            body: Some(body),
            discard: Some(discard),
        }));
        self.0
            .frames
            .borrow_mut()
            .get_mut(parent.0)
            .expect("frame handle valid")
            .queue
            .push_back(Node::Task(handle));
        tracing::debug!(description, "scheduled task");
    }

    /// Finds the next runnable task in `frame`, descending into child
    /// frames depth-first and cleaning up markers for frames that have
    /// fully drained (empty queue *and* their owning task has settled).
    /// A child frame that is empty but not yet settled blocks the walk at
    /// this level entirely: it may still receive more sub-commands from a
    /// `.then()` chained onto its task's promise.
    fn find_next_in_frame(&self, frame: FrameHandle) -> Option<TaskHandle> {
        loop {
            let front = self.0.frames.borrow().get(frame.0)?.queue.front().copied();
            let node = front?;
            match node {
                Node::Task(h) => return Some(h),
                Node::Frame(child) => {
                    let drained = self
                        .0
                        .frames
                        .borrow()
                        .get(child.0)
                        .map(Frame::is_drained)
                        .unwrap_or(true);
                    if drained {
                        self.0
                            .frames
                            .borrow_mut()
                            .get_mut(frame.0)?
                            .queue
                            .pop_front();
                        self.0.frames.borrow_mut().deallocate(child.0);
                        continue;
                    }
                    return self.find_next_in_frame(child);
                }
            }
        }
    }

    fn next_runnable(&self) -> Option<(TaskHandle, FrameHandle)> {
        let roots: Vec<FrameHandle> = self
            .0
            .queues
            .borrow()
            .iter()
            .filter(|q| q.state != crate::queue::QueueState::Finished)
            .map(|q| q.root)
            .collect();
        for root in roots {
            if let Some(task) = self.find_next_in_frame(root) {
                let parent = self.0.tasks.borrow().get(task.0).expect("task valid").parent;
                return Some((task, parent));
            }
        }
        None
    }

    fn run_task(&self, task_handle: TaskHandle, parent: FrameHandle) {
        let poisoned = self
            .0
            .frames
            .borrow()
            .get(parent.0)
            .and_then(|f| f.poisoned.clone());

        {
            let mut frames = self.0.frames.borrow_mut();
            let frame = frames.get_mut(parent.0).expect("frame valid");
            let front = frame.queue.pop_front();
            debug_assert!(matches!(front, Some(Node::Task(h)) if h == task_handle));
        }

        let mut task = self
            .0
            .tasks
            .borrow_mut()
            .deallocate(task_handle.0)
            .expect("task handle valid");

        if let Some(reason) = poisoned {
            if let Some(discard) = task.discard.take() {
                tracing::debug!(
                    description = task.description,
                    "discarding task after sibling failure"
                );
                // `discard_silently` settles the promise without running any
                // waiter, including the `observe()` callback that would
                // otherwise flip this below — so it's set directly here.
                discard(FlowError::Discarded);
            }
            if let Some(frame) = self.0.frames.borrow_mut().get_mut(task.frame.0) {
                frame.task_settled.set(true);
            }
            let _ = reason;
            self.0.frames.borrow_mut().deallocate(task.frame.0);
            return;
        }

        let body = task.body.take().expect("task body not yet run");
        let description = task.description;
        let child = task.frame;

        self.0
            .frames
            .borrow_mut()
            .get_mut(parent.0)
            .expect("frame valid")
            .queue
            .push_front(Node::Frame(child));

        self.0.active_stack.borrow_mut().push(child);
        let _flow_guard = set_as_active(self);
        let _host_guard = self.as_active();
        tracing::debug!(description, "running task");
        let outcome = body();
        drop(_host_guard);
        drop(_flow_guard);
        self.0.active_stack.borrow_mut().pop();

        if let TaskOutcome::Err(reason) = outcome {
            tracing::warn!(description, error = %reason, "task failed, poisoning frame");
            self.0.frames.borrow_mut().get_mut(parent.0).expect("frame valid").poisoned = Some(reason);
        }
    }

    fn drain_microtasks(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.0.microtasks.borrow_mut().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Advances the flow by one step: fires due timers, drains pending
    /// continuations, and runs at most one task. Returns whether any work
    /// happened.
    pub fn pump_once(&self) -> bool {
        let now = self.0.clock.now();
        for cb in self.0.timers.borrow_mut().fire_due(now) {
            cb();
        }
        let drained = self.drain_microtasks();

        if let Some((task, parent)) = self.next_runnable() {
            self.run_task(task, parent);
            self.drain_microtasks();
            return true;
        }

        drained > 0
    }

    fn finish_queues_if_drained(&self) {
        let mut queues = self.0.queues.borrow_mut();
        let frames = self.0.frames.borrow();
        for q in queues.iter_mut() {
            if q.state != crate::queue::QueueState::Finished {
                q.state = if frames.get(q.root.0).map(Frame::is_empty).unwrap_or(true) {
                    crate::queue::QueueState::Finished
                } else {
                    crate::queue::QueueState::Started
                };
            }
        }
    }

    fn is_fully_idle(&self) -> bool {
        self.0.microtasks.borrow().is_empty()
            && self.0.timers.borrow().is_empty()
            && self
                .0
                .queues
                .borrow()
                .iter()
                .all(|q| q.state == crate::queue::QueueState::Finished)
    }

    /// Runs tasks and drains continuations until nothing is immediately
    /// runnable, then emits `idle` if the flow is truly empty. If pending
    /// timers remain, returns without emitting `idle`; the host (the real
    /// clock, or a test advancing a [`crate::time::ManualClock`]) must move
    /// time forward and call this again.
    pub fn run_until_idle(&self) {
        while self.pump_once() {}
        self.finish_queues_if_drained();
        if self.is_fully_idle() {
            self.0.events.borrow_mut().emit(&Event::Idle);
        }
    }

    /// Like [`Self::run_until_idle`], but for a real clock: sleeps past
    /// pending timer deadlines instead of returning control to the host.
    pub fn drive_to_completion(&self) {
        loop {
            self.run_until_idle();
            if self.is_fully_idle() {
                break;
            }
            match self.0.timers.borrow().next_deadline() {
                Some(deadline) => {
                    let now = self.0.clock.now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                }
                None => break,
            }
        }
    }

    /// Discards all pending work and emits `reset` followed by `idle`.
    pub fn reset(&self) {
        self.0.queues.borrow_mut().clear();
        self.0.frames.borrow_mut().clear();
        self.0.tasks.borrow_mut().clear();
        self.0.microtasks.borrow_mut().clear();
        self.0.active_stack.borrow_mut().clear();
        tracing::info!("control flow reset");
        self.0.events.borrow_mut().emit(&Event::Reset);
        self.0.events.borrow_mut().emit(&Event::Idle);
    }

    pub fn on(&self, kind: EventKind, callback: impl FnMut(&Event) + 'static) -> ListenerId {
        self.0.events.borrow_mut().on(kind, Box::new(callback))
    }

    pub fn once(&self, kind: EventKind, callback: impl FnMut(&Event) + 'static) -> ListenerId {
        self.0.events.borrow_mut().once(kind, Box::new(callback))
    }

    pub fn off(&self, id: ListenerId) {
        self.0.events.borrow_mut().off(id);
    }
}

thread_local! {
    static ACTIVE_FLOW: RefCell<Vec<ControlFlow>> = RefCell::new(Vec::new());
}

/// Restores the previous active flow when dropped.
pub struct ActiveFlowGuard(());

impl Drop for ActiveFlowGuard {
    fn drop(&mut self) {
        ACTIVE_FLOW.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

fn set_as_active(flow: &ControlFlow) -> ActiveFlowGuard {
    ACTIVE_FLOW.with(|s| s.borrow_mut().push(flow.clone()));
    ActiveFlowGuard(())
}

/// The flow currently running a task, if any.
///
/// Panics if called outside of a running task body; see [`create_flow`] or
/// run one explicitly with [`ControlFlow::execute`].
pub fn control_flow() -> ControlFlow {
    ACTIVE_FLOW.with(|s| {
        s.borrow()
            .last()
            .cloned()
            .expect("no active control flow; call create_flow or execute a task first")
    })
}

/// Creates a fresh flow and schedules `f` as its first task, returning a
/// promise for the result. The caller still has to drive the flow (via
/// [`ControlFlow::run_until_idle`] or [`ControlFlow::drive_to_completion`])
/// for `f`, and anything it schedules, to actually run.
pub fn create_flow<T, F>(f: F) -> Promise<T>
where
    T: Clone + 'static,
    F: FnOnce(&ControlFlow) -> Result<T, FlowError> + 'static,
{
    let flow = ControlFlow::new();
    let body_flow = flow.clone();
    flow.execute("createFlow", move || f(&body_flow))
}
