//! Demo binary exercising `control_flow` and `promise` directly.
//!
//! Schedules a handful of interdependent tasks, lets a sub-command jump
//! ahead of its own later siblings, and deliberately leaves one rejection
//! unhandled so the `uncaughtException` event fires.

use control_flow::{ControlFlow, Event, EventKind, FlowError};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let flow = ControlFlow::new();

    flow.on(EventKind::UncaughtException, |event| {
        if let Event::UncaughtException(reason) = event {
            eprintln!("uncaught: {reason}");
        }
    });
    flow.on(EventKind::Idle, |_| println!("flow idle"));

    flow.execute("load page", || {
        println!("loading page");
        Ok::<_, FlowError>(())
    });

    let inner_flow = flow.clone();
    flow.execute("click button", move || {
        println!("clicking button");
        inner_flow.execute("log click", || {
            println!("  (sub-command) logged click");
            Ok::<_, FlowError>(())
        });
        Ok::<_, FlowError>(())
    });

    flow.execute("navigate away", || {
        println!("navigating away");
        Ok::<_, FlowError>(())
    });

    // Fulfills after a short delay; run_until_idle returns control once
    // nothing is immediately runnable, so we drive to completion.
    let delayed = flow.delayed(10, "timer fired".to_string());
    delayed.then("report", |msg| println!("{msg}"));

    let pages = vec![flow.fulfilled("home"), flow.fulfilled("about"), flow.fulfilled("contact")];
    flow.fully_resolved(pages)
        .then("report-all-loaded", |loaded| println!("loaded: {loaded:?}"));

    // Deliberately unhandled: nobody attaches a handler to this promise.
    flow.execute("will fail", || {
        Err::<(), _>(FlowError::custom(std::io::Error::other("boom")))
    });

    flow.drive_to_completion();
}
