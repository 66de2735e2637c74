//! # Promise
//!
//! A promise implementation for the deterministic cooperative scheduler in
//! `control_flow`. Promises here are single-threaded (`Rc`-backed, not
//! `Arc`), settle at most once, and schedule their continuations on
//! whatever [`HandlerHost`] was active when they were created rather than
//! running them inline — that indirection is what lets `control_flow` slot
//! itself in as the thing actually driving execution.

mod error;
mod host;
mod promise;
mod unhandled;

pub use error::{CancellationError, CustomError, FlowError, MultipleUnhandledRejectionError};
pub use host::{active_host, push_active_host, ActiveHostGuard, HandlerHost};
pub use promise::{fulfilled, fully_resolved, rejected, Deferred, Promise};
pub use unhandled::UnhandledRejectionTracker;
