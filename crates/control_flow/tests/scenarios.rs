//! End-to-end ordering scenarios for the scheduler.

use std::cell::RefCell;
use std::rc::Rc;

use control_flow::{ControlFlow, ControlFlowConfig, FlowError};

fn logger() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
    let log = Rc::new(RefCell::new(Vec::new()));
    let log2 = log.clone();
    (log, move |label: &'static str| log2.borrow_mut().push(label))
}

#[test]
fn three_sequential_tasks_run_in_order_then_idle() {
    let flow = ControlFlow::new();
    let (log, push) = logger();
    let idle = Rc::new(RefCell::new(false));
    let idle2 = idle.clone();
    flow.on(control_flow::EventKind::Idle, move |_| *idle2.borrow_mut() = true);

    for label in ["a", "b", "c"] {
        let push = push.clone();
        flow.execute(label, move || {
            push(label);
            Ok::<_, FlowError>(())
        });
    }

    flow.run_until_idle();
    assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    assert!(*idle.borrow());
}

#[test]
fn then_chained_execute_runs_before_later_sibling() {
    // execute(a).then(() => execute(c)); execute(b)  =>  [a, c, b]
    let flow = ControlFlow::new();
    let (log, push) = logger();

    let flow_a = flow.clone();
    let push_c = push.clone();
    let a = flow.execute("a", move || {
        push("a");
        Ok::<_, FlowError>(())
    });
    a.and_then("a-then", move |_| {
        let push_c = push_c.clone();
        flow_a.execute("c", move || {
            push_c("c");
            Ok::<_, FlowError>(())
        })
    });

    let push_b = push.clone();
    flow.execute("b", move || {
        push_b("b");
        Ok::<_, FlowError>(())
    });

    flow.run_until_idle();
    assert_eq!(*log.borrow(), vec!["a", "c", "b"]);
}

#[test]
fn two_thens_on_the_same_promise_both_run_before_the_next_sibling() {
    // x = execute(a); x.then(() => execute(b)); execute(c);
    // x.then(() => execute(d)); execute(e)  =>  [a, b, c, d, e]
    let flow = ControlFlow::new();
    let (log, push) = logger();

    let x = {
        let push = push.clone();
        flow.execute("a", move || {
            push("a");
            Ok::<_, FlowError>(())
        })
    };
    {
        let flow = flow.clone();
        let push = push.clone();
        x.and_then("x-then-b", move |_| {
            let push = push.clone();
            flow.execute("b", move || {
                push("b");
                Ok::<_, FlowError>(())
            })
        });
    }
    {
        let push = push.clone();
        flow.execute("c", move || {
            push("c");
            Ok::<_, FlowError>(())
        });
    }
    {
        let flow = flow.clone();
        let push = push.clone();
        x.and_then("x-then-d", move |_| {
            let push = push.clone();
            flow.execute("d", move || {
                push("d");
                Ok::<_, FlowError>(())
            })
        });
    }
    {
        let push = push.clone();
        flow.execute("e", move || {
            push("e");
            Ok::<_, FlowError>(())
        });
    }

    flow.run_until_idle();
    assert_eq!(*log.borrow(), vec!["a", "b", "c", "d", "e"]);
}

#[test]
fn nested_sub_command_runs_before_the_outer_tasks_later_sibling() {
    // A task can itself schedule a sub-command from within its own
    // `.and_then` continuation; that sub-command still has to finish before
    // the outer task's later sibling runs, even though the continuation
    // fires as a deferred microtask rather than synchronously inside the
    // task body.
    let flow = ControlFlow::new();
    let (log, push) = logger();

    let flow_a = flow.clone();
    let push_a = push.clone();
    let push_c = push.clone();
    let a = flow.execute("a", move || {
        push_a("a");
        Ok::<_, FlowError>(())
    });
    a.and_then("a-then", move |_| {
        let push_c = push_c.clone();
        flow_a.execute("c", move || {
            push_c("c");
            Ok::<_, FlowError>(())
        })
    });

    let push_b = push.clone();
    flow.execute("b", move || {
        push_b("b");
        Ok::<_, FlowError>(())
    });

    flow.drive_to_completion();
    assert_eq!(*log.borrow(), vec!["a", "c", "b"]);
}

#[test]
fn wait_polls_until_condition_is_true_then_fulfills() {
    // A zero-delay poll interval collapses every re-poll into the same
    // drive_to_completion() call, so this stays deterministic without
    // needing a manual clock.
    let config = ControlFlowConfig::builder().wait_poll_interval_ms(0).build();
    let flow = ControlFlow::with_config(config);
    let calls = Rc::new(RefCell::new(0));
    let calls2 = calls.clone();

    let result = flow.wait("to3", Some(1000), move || {
        let mut n = calls2.borrow_mut();
        *n += 1;
        if *n >= 3 {
            control_flow::WaitOutcome::Done(*n)
        } else {
            control_flow::WaitOutcome::NotYet
        }
    });

    let seen = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    result.then("observe", move |v| *seen2.borrow_mut() = Some(v));

    flow.drive_to_completion();
    assert_eq!(*calls.borrow(), 3);
    assert_eq!(*seen.borrow(), Some(3));
}

#[test]
fn cancelling_a_queued_task_skips_its_body_without_discarding_its_siblings() {
    // execute(a); a_task.cancel("nope"); execute(b)  =>  a never runs, [b]
    let flow = ControlFlow::new();
    let (log, push) = logger();

    let push_a = push.clone();
    let a = flow.execute("a", move || {
        push_a("a");
        Ok::<_, FlowError>(())
    });
    a.cancel("nope");

    let push_b = push.clone();
    flow.execute("b", move || {
        push_b("b");
        Ok::<_, FlowError>(())
    });

    let cancelled = Rc::new(RefCell::new(false));
    let cancelled2 = cancelled.clone();
    a.catch("observe", move |e| {
        *cancelled2.borrow_mut() = e.is_cancellation();
    });

    flow.run_until_idle();
    assert_eq!(*log.borrow(), vec!["b"]);
    assert!(*cancelled.borrow());
}

#[test]
fn wait_for_promise_times_out_when_the_promise_never_settles() {
    // An orphan deferred that nobody ever fulfills or rejects: no timer of
    // its own, so it can't interfere with driving the flow to idle once the
    // timeout below fires.
    let flow = ControlFlow::new();
    let pending: promise::Promise<()> = promise::Promise::deferred("stuck").promise();

    let waited = flow.wait_for_promise("wait-for-it", pending, Some(10));
    let timed_out = Rc::new(RefCell::new(false));
    let timed_out2 = timed_out.clone();
    waited.catch("observe", move |e| {
        *timed_out2.borrow_mut() = matches!(e, FlowError::WaitTimeout { .. });
    });

    flow.drive_to_completion();
    assert!(*timed_out.borrow());
}

#[test]
fn unhandled_rejection_surfaces_as_uncaught_exception_event() {
    let flow = ControlFlow::new();
    let seen = Rc::new(RefCell::new(false));
    let seen2 = seen.clone();
    flow.on(control_flow::EventKind::UncaughtException, move |_| {
        *seen2.borrow_mut() = true;
    });

    flow.execute("will fail", || Err::<(), _>(FlowError::Cycle));

    flow.run_until_idle();
    assert!(*seen.borrow());
}

#[test]
fn task_body_assimilates_a_returned_deferred_promise() {
    // execute(a, returns defer().promise); execute(b); resolve the defer
    // and push "c" from outside  =>  [a, c, b]
    let flow = ControlFlow::new();
    let (log, push) = logger();

    let deferred = promise::Promise::<()>::deferred("late");
    let deferred_outer = deferred.clone();
    let push_a = push.clone();
    flow.execute_async("a", move || {
        push_a("a");
        Ok::<_, FlowError>(deferred.promise())
    });

    let push_b = push.clone();
    flow.execute("b", move || {
        push_b("b");
        Ok::<_, FlowError>(())
    });

    // Nothing settles "a" until the inner promise does, so "b" can't have
    // run yet even after a drain pass finds no other runnable work.
    flow.run_until_idle();
    assert_eq!(*log.borrow(), vec!["a"]);

    push("c");
    deferred_outer.fulfill(());
    flow.run_until_idle();
    assert_eq!(*log.borrow(), vec!["a", "c", "b"]);
}

#[test]
fn task_body_returning_a_delayed_promise_blocks_its_sibling_until_it_settles() {
    // execute(a, returns delayed(10)); execute(b); setTimeout(0, execute(c))
    //  =>  [a, c, b], with c on its own sibling queue
    let config = ControlFlowConfig::builder().build();
    let flow = ControlFlow::with_config(config);
    let (log, push) = logger();

    let flow_a = flow.clone();
    let push_a = push.clone();
    flow.execute_async("a", move || {
        push_a("a");
        Ok::<_, FlowError>(flow_a.delayed(10, ()))
    });

    let push_b = push.clone();
    flow.execute("b", move || {
        push_b("b");
        Ok::<_, FlowError>(())
    });

    let flow_timer = flow.clone();
    let push_c = push.clone();
    flow.delayed(0, ()).then("fire-c", move |_| {
        flow_timer.execute("c", move || {
            push_c("c");
            Ok::<_, FlowError>(())
        });
    });

    flow.drive_to_completion();
    assert_eq!(*log.borrow(), vec!["a", "c", "b"]);
}

#[test]
fn sibling_scheduled_after_a_wait_only_runs_once_every_poll_completes() {
    // wait("to3", cond); execute("post")  =>  post only runs after all 3
    // polls, even though each re-poll is driven by a bare timer callback
    // with nothing on the active frame stack.
    let config = ControlFlowConfig::builder().wait_poll_interval_ms(0).build();
    let flow = ControlFlow::with_config(config);
    let calls = Rc::new(RefCell::new(0));
    let calls2 = calls.clone();
    let (log, push) = logger();

    flow.wait("to3", Some(1000), move || {
        let mut n = calls2.borrow_mut();
        *n += 1;
        if *n >= 3 {
            control_flow::WaitOutcome::Done(*n)
        } else {
            control_flow::WaitOutcome::NotYet
        }
    });

    flow.execute("post", move || {
        push("post");
        Ok::<_, FlowError>(())
    });

    flow.drive_to_completion();
    assert_eq!(*calls.borrow(), 3);
    assert_eq!(*log.borrow(), vec!["post"]);
}

#[test]
fn reset_discards_pending_work() {
    let flow = ControlFlow::new();
    let ran = Rc::new(RefCell::new(false));
    let ran2 = ran.clone();
    flow.execute("never runs", move || {
        *ran2.borrow_mut() = true;
        Ok::<_, FlowError>(())
    });

    flow.reset();
    flow.run_until_idle();
    assert!(!*ran.borrow());
}
