//! The promise state machine.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::FlowError;
use crate::host::{active_host, HandlerHost};

#[derive(Clone)]
enum State<T> {
    Pending,
    /// Resolving against another promise; settlement is on hold until that
    /// promise itself settles. Distinct from `Pending` so a stray
    /// `fulfill`/`reject` racing the assimilation is still a no-op.
    Blocked,
    Fulfilled(T),
    Rejected(FlowError),
}

impl<T> State<T> {
    fn is_settled(&self) -> bool {
        matches!(self, State::Fulfilled(_) | State::Rejected(_))
    }
}

type Waiter<T> = Box<dyn FnOnce(&State<T>)>;

struct Inner<T> {
    state: State<T>,
    waiters: Vec<Waiter<T>>,
    handled: bool,
    host: Option<Rc<dyn HandlerHost>>,
    description: &'static str,
}

/// A value that will become available, or fail, at some future point.
///
/// Cloning a `Promise` is cheap and shares the same underlying state (it is
/// reference-counted, matching the single-threaded cooperative model this
/// crate targets).
pub struct Promise<T: Clone + 'static> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T: Clone + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.inner.borrow();
        let state = match &b.state {
            State::Pending => "Pending",
            State::Blocked => "Blocked",
            State::Fulfilled(_) => "Fulfilled",
            State::Rejected(_) => "Rejected",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

/// The paired resolver half of a pending [`Promise`].
///
/// `fulfill`/`reject` are one-shot: the first call wins, later calls are
/// silent no-ops, matching promise settlement idempotency. Cloning a
/// `Deferred` just hands out another resolver for the same promise; nothing
/// stops two clones racing to settle it; the first one wins.
pub struct Deferred<T: Clone + 'static> {
    promise: Promise<T>,
}

impl<T: Clone + 'static> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            promise: self.promise.clone(),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub fn promise(&self) -> Promise<T> {
        self.promise.clone()
    }

    pub fn fulfill(&self, value: T) {
        self.promise.settle(State::Fulfilled(value));
    }

    pub fn reject(&self, reason: FlowError) {
        self.promise.settle(State::Rejected(reason));
    }

    /// Rejects without notifying any attached handler or flagging the
    /// rejection as unhandled: used when the scheduler discards a task
    /// after a sibling failure, which is absorbed entirely rather than
    /// delivered anywhere, even to a `.catch` attached before the discard.
    pub fn discard_silently(&self, reason: FlowError) {
        self.promise.discard_silently(reason);
    }

    /// Resolve against another promise instead of a plain value: this
    /// deferred settles however and whenever `source` does (thenable /
    /// task assimilation).
    pub fn resolve_with(&self, source: Promise<T>) {
        if Rc::ptr_eq(&self.promise.inner, &source.inner) {
            self.promise.settle(State::Rejected(FlowError::Cycle));
            return;
        }
        {
            let mut b = self.promise.inner.borrow_mut();
            if b.state.is_settled() {
                return;
            }
            b.state = State::Blocked;
        }
        let target = self.promise.clone();
        source.attach(Box::new(move |state| match state {
            State::Fulfilled(v) => target.settle(State::Fulfilled(v.clone())),
            State::Rejected(e) => target.settle(State::Rejected(e.clone())),
            State::Pending | State::Blocked => unreachable!("waiters fire only once settled"),
        }));
    }
}

impl<T: Clone + 'static> Promise<T> {
    fn new(state: State<T>, host: Option<Rc<dyn HandlerHost>>, description: &'static str) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state,
                waiters: Vec::new(),
                handled: false,
                host,
                description,
            })),
        }
    }

    /// Creates a pending promise and its resolver, bound to the active host
    /// if one is set.
    pub fn deferred(description: &'static str) -> Deferred<T> {
        Deferred {
            promise: Self::new(State::Pending, active_host(), description),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending | State::Blocked)
    }

    /// Cancellation is idempotent and terminal: cancelling an already
    /// settled promise has no effect, and a cancelled promise can never be
    /// un-cancelled.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.settle(State::Rejected(FlowError::cancelled(reason.into())));
    }

    fn settle(&self, new_state: State<T>) {
        debug_assert!(new_state.is_settled());
        let (waiters, host, rejected_unobserved) = {
            let mut b = self.inner.borrow_mut();
            if b.state.is_settled() {
                return;
            }
            b.state = new_state;
            let waiters = std::mem::take(&mut b.waiters);
            // Judged on `handled` alone, not on whether waiters is empty:
            // `observe` below registers a waiter without marking the
            // promise handled, so a present-but-silent waiter must not
            // suppress this check.
            let rejected_unobserved = !b.handled && matches!(b.state, State::Rejected(_));
            (waiters, b.host.clone(), rejected_unobserved)
        };

        for waiter in waiters {
            self.fire(&host, waiter);
        }

        if rejected_unobserved {
            if let Some(host) = host {
                let inner = self.inner.clone();
                host.enqueue(
                    "unhandled-rejection-check",
                    Box::new(move || {
                        let (handled, reason) = {
                            let b = inner.borrow();
                            let reason = match &b.state {
                                State::Rejected(e) => Some(e.clone()),
                                _ => None,
                            };
                            (b.handled, reason)
                        };
                        if !handled {
                            if let (Some(reason), Some(host)) = (reason, active_host()) {
                                host.report_unhandled(reason);
                            }
                        }
                    }),
                );
            }
        }
    }

    /// Settles into `Rejected` without running any waiter (past or future)
    /// and without the usual unhandled-rejection check. See
    /// [`Deferred::discard_silently`].
    fn discard_silently(&self, reason: FlowError) {
        let mut b = self.inner.borrow_mut();
        if b.state.is_settled() {
            return;
        }
        b.state = State::Rejected(reason);
        b.waiters.clear();
    }

    fn fire(&self, host: &Option<Rc<dyn HandlerHost>>, waiter: Waiter<T>) {
        let (state, description) = {
            let b = self.inner.borrow();
            (b.state.clone(), b.description)
        };
        match host {
            Some(h) => h.enqueue(description, Box::new(move || waiter(&state))),
            None => waiter(&state),
        }
    }

    /// Registers `waiter` to run once this promise settles. Marks the
    /// promise as handled immediately: in this model, forwarding a
    /// rejection to any attached continuation counts as handling it here,
    /// and it is the *downstream* promise's job to stay unhandled if no one
    /// ever looks at it.
    fn attach(&self, waiter: Waiter<T>) {
        let mut waiter = Some(waiter);
        let host = {
            let mut b = self.inner.borrow_mut();
            b.handled = true;
            if b.state.is_settled() {
                b.host.clone()
            } else {
                b.waiters.push(waiter.take().unwrap());
                return;
            }
        };
        self.fire(&host, waiter.take().unwrap());
    }

    /// Registers a side effect to run once this promise settles, without
    /// affecting unhandled-rejection tracking the way `then`/`catch`/
    /// `finally` do. Used internally for bookkeeping that needs to observe
    /// settlement without counting as "someone is watching this promise".
    pub fn observe<F>(&self, f: F)
    where
        F: FnOnce() + 'static,
    {
        let mut f = Some(f);
        let waiter: Waiter<T> = Box::new(move |_state| {
            if let Some(f) = f.take() {
                f();
            }
        });
        let mut waiter = Some(waiter);
        let host = {
            let mut b = self.inner.borrow_mut();
            if b.state.is_settled() {
                b.host.clone()
            } else {
                b.waiters.push(waiter.take().unwrap());
                return;
            }
        };
        self.fire(&host, waiter.take().unwrap());
    }

    /// Runs `on_fulfilled`; a rejection passes through unchanged.
    pub fn then<U, F>(&self, description: &'static str, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let deferred = Promise::<U>::deferred(description);
        let settle = deferred.promise.clone();
        let on_fulfilled = RefCell::new(Some(on_fulfilled));
        self.attach(Box::new(move |state| match state {
            State::Fulfilled(v) => {
                if let Some(f) = on_fulfilled.borrow_mut().take() {
                    settle.settle(State::Fulfilled(f(v.clone())));
                }
            }
            State::Rejected(e) => settle.settle(State::Rejected(e.clone())),
            State::Pending | State::Blocked => unreachable!(),
        }));
        deferred.promise
    }

    /// Runs `on_fulfilled` or `on_rejected` depending on how `self` settles;
    /// both branches produce the same output type.
    pub fn then_catch<U, F, R>(
        &self,
        description: &'static str,
        on_fulfilled: F,
        on_rejected: R,
    ) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
        R: FnOnce(FlowError) -> U + 'static,
    {
        let deferred = Promise::<U>::deferred(description);
        let settle_ok = deferred.promise.clone();
        let settle_err = deferred.promise.clone();
        let on_fulfilled = RefCell::new(Some(on_fulfilled));
        let on_rejected = RefCell::new(Some(on_rejected));
        self.attach(Box::new(move |state| match state {
            State::Fulfilled(v) => {
                if let Some(f) = on_fulfilled.borrow_mut().take() {
                    settle_ok.settle(State::Fulfilled(f(v.clone())));
                }
            }
            State::Rejected(e) => {
                if let Some(r) = on_rejected.borrow_mut().take() {
                    settle_err.settle(State::Fulfilled(r(e.clone())));
                }
            }
            State::Pending | State::Blocked => unreachable!(),
        }));
        deferred.promise
    }

    /// Like [`Self::then`] but `f` itself returns a promise, which is
    /// assimilated into the result instead of producing `Promise<Promise<U>>`.
    /// This is the thenable/task-assimilation path: anything that hands back
    /// a `Promise<U>` (including a task's own promise) flattens correctly.
    pub fn and_then<U, F>(&self, description: &'static str, f: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Promise<U> + 'static,
    {
        let deferred = Promise::<U>::deferred(description);
        let resolver = deferred.promise.clone();
        self.attach(Box::new(move |state| match state {
            State::Fulfilled(v) => {
                let next = f(v.clone());
                Deferred {
                    promise: resolver.clone(),
                }
                .resolve_with(next);
            }
            State::Rejected(e) => resolver.settle(State::Rejected(e.clone())),
            State::Pending | State::Blocked => unreachable!(),
        }));
        deferred.promise
    }

    /// Runs `on_rejected` only on rejection; a fulfillment passes through
    /// unchanged.
    pub fn catch<F>(&self, description: &'static str, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(FlowError) -> T + 'static,
    {
        let deferred = Promise::<T>::deferred(description);
        let settle_ok = deferred.promise.clone();
        let settle_err = deferred.promise.clone();
        let on_rejected = RefCell::new(Some(on_rejected));
        self.attach(Box::new(move |state| match state {
            State::Fulfilled(v) => settle_ok.settle(State::Fulfilled(v.clone())),
            State::Rejected(e) => {
                if let Some(r) = on_rejected.borrow_mut().take() {
                    settle_err.settle(State::Fulfilled(r(e.clone())));
                }
            }
            State::Pending | State::Blocked => unreachable!(),
        }));
        deferred.promise
    }

    /// Runs `f` regardless of outcome, then passes the original
    /// fulfillment/rejection through unchanged.
    pub fn finally<F>(&self, description: &'static str, f: F) -> Promise<T>
    where
        F: FnOnce() + 'static,
    {
        let deferred = Promise::<T>::deferred(description);
        let settle = deferred.promise.clone();
        let f = RefCell::new(Some(f));
        self.attach(Box::new(move |state| {
            if let Some(f) = f.borrow_mut().take() {
                f();
            }
            settle.settle(state.clone());
        }));
        deferred.promise
    }
}

/// Creates an already-fulfilled promise bound to the active host.
pub fn fulfilled<T: Clone + 'static>(value: T) -> Promise<T> {
    Promise::new(State::Fulfilled(value), active_host(), "fulfilled")
}

/// Creates an already-rejected promise bound to the active host.
pub fn rejected<T: Clone + 'static>(reason: FlowError) -> Promise<T> {
    Promise::new(State::Rejected(reason), active_host(), "rejected")
}

/// Resolves a whole collection of promises down to a single promise of their
/// results, short-circuiting to the first rejection.
///
/// A dynamically-typed value tree (arrays and objects nested arbitrarily)
/// doesn't translate into a typed `Promise<T>`; a homogeneous collection is
/// the shape that shows up in practice, so this narrows to `Vec<Promise<T>>`
/// rather than trying to walk an arbitrary tree.
pub fn fully_resolved<T: Clone + 'static>(values: Vec<Promise<T>>) -> Promise<Vec<T>> {
    let deferred = Promise::<Vec<T>>::deferred("fullyResolved");
    if values.is_empty() {
        deferred.fulfill(Vec::new());
        return deferred.promise();
    }

    let total = values.len();
    let results: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; total]));
    let remaining = Rc::new(Cell::new(total));

    for (i, value) in values.into_iter().enumerate() {
        let deferred_ok = deferred.clone();
        let deferred_err = deferred.clone();
        let results = results.clone();
        let remaining = remaining.clone();
        value.then_catch(
            "fullyResolved-item",
            move |v| {
                results.borrow_mut()[i] = Some(v);
                remaining.set(remaining.get() - 1);
                if remaining.get() == 0 {
                    let collected = results
                        .borrow_mut()
                        .iter_mut()
                        .map(|slot| slot.take().expect("every slot filled once remaining hits zero"))
                        .collect();
                    deferred_ok.fulfill(collected);
                }
            },
            move |e| deferred_err.reject(e),
        );
    }

    deferred.promise()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fulfilled_is_settled_immediately() {
        let p = fulfilled(42);
        assert!(!p.is_pending());
    }

    #[test]
    fn deferred_starts_pending() {
        let d: Deferred<i32> = Promise::deferred("test");
        assert!(d.promise().is_pending());
        d.fulfill(1);
        assert!(!d.promise().is_pending());
    }

    #[test]
    fn fulfill_is_idempotent() {
        let d: Deferred<i32> = Promise::deferred("test");
        d.fulfill(1);
        d.fulfill(2); // no-op
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        d.promise().then("observe", move |v| {
            *seen2.borrow_mut() = Some(v);
        });
        assert_eq!(*seen.borrow(), Some(1));
    }

    #[test]
    fn cancel_is_terminal() {
        let d: Deferred<i32> = Promise::deferred("test");
        d.promise().cancel("stopping");
        d.fulfill(5); // must not override the cancellation
        let seen = Rc::new(RefCell::new(false));
        let seen2 = seen.clone();
        d.promise().catch("observe", move |e| {
            *seen2.borrow_mut() = e.is_cancellation();
            0
        });
        assert!(*seen.borrow());
    }

    #[test]
    fn then_chains_fulfillment() {
        let p = fulfilled(2).then("double", |v| v * 2);
        let seen = Rc::new(RefCell::new(0));
        let seen2 = seen.clone();
        p.then("observe", move |v| *seen2.borrow_mut() = v);
        assert_eq!(*seen.borrow(), 4);
    }

    #[test]
    fn fully_resolved_collects_all_results_in_order() {
        let values = vec![fulfilled(1), fulfilled(2), fulfilled(3)];
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        fully_resolved(values).then("observe", move |vs| *seen2.borrow_mut() = Some(vs));
        assert_eq!(*seen.borrow(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn fully_resolved_short_circuits_on_first_rejection() {
        let values: Vec<Promise<i32>> = vec![fulfilled(1), rejected(FlowError::Cycle), fulfilled(3)];
        let seen = Rc::new(RefCell::new(false));
        let seen2 = seen.clone();
        fully_resolved(values).catch("observe", move |e| {
            *seen2.borrow_mut() = matches!(e, FlowError::Cycle);
            Vec::new()
        });
        assert!(*seen.borrow());
    }

    #[test]
    fn fully_resolved_of_empty_collection_fulfills_immediately() {
        let seen = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        let empty: Vec<Promise<i32>> = Vec::new();
        fully_resolved(empty).then("observe", move |vs| *seen2.borrow_mut() = Some(vs));
        assert_eq!(*seen.borrow(), Some(Vec::new()));
    }

    #[test]
    fn self_resolution_is_a_cycle() {
        let d: Deferred<i32> = Promise::deferred("cycle");
        let p = d.promise();
        d.resolve_with(p);
        let seen = Rc::new(RefCell::new(false));
        let seen2 = seen.clone();
        d.promise().catch("observe", move |e| {
            *seen2.borrow_mut() = matches!(e, FlowError::Cycle);
            0
        });
        assert!(*seen.borrow());
    }
}
