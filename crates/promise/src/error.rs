//! Unified rejection-reason / error type.
//!
//! JS promises can reject with any value; a typed `Promise<T>` needs a typed
//! reason channel instead. [`FlowError`] covers every rejection cause this
//! crate and `control_flow` produce, with [`FlowError::Custom`] as the escape
//! hatch for arbitrary user errors.

use std::fmt;
use std::rc::Rc;

/// A cloneable, type-erased `std::error::Error`.
///
/// Wrapped in `Rc` rather than `Box` so a rejection reason can be handed to
/// every handler attached to a promise without requiring the underlying
/// error to implement `Clone` itself.
#[derive(Clone)]
pub struct CustomError(Rc<dyn std::error::Error>);

impl CustomError {
    pub fn new<E: std::error::Error + 'static>(err: E) -> Self {
        Self(Rc::new(err))
    }
}

impl fmt::Debug for CustomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for CustomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for CustomError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Raised when a pending promise or task is cancelled.
///
/// Terminal: once observed, the promise stays rejected with this reason.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cancelled: {0}")]
pub struct CancellationError(pub String);

/// The reason a promise was rejected, or a task aborted.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Cancelled(#[from] CancellationError),

    #[error("task discarded because a sibling task in its frame failed")]
    Discarded,

    #[error(transparent)]
    Custom(#[from] CustomError),

    #[error("promise resolution cycle detected")]
    Cycle,

    #[error("wait timed out after {timeout_ms}ms: {description}")]
    WaitTimeout { timeout_ms: u64, description: String },

    #[error(transparent)]
    Multiple(#[from] MultipleUnhandledRejectionError),

    /// A task-body rejection, annotated with the description chain of the
    /// task(s) that scheduled it. Only rejections belonging to a flow get
    /// wrapped this way; a promise with no owning flow passes its reason
    /// through unchanged.
    #[error("{reason} (task chain: {chain})")]
    Annotated { reason: Box<FlowError>, chain: String },
}

impl FlowError {
    pub fn custom<E: std::error::Error + 'static>(err: E) -> Self {
        FlowError::Custom(CustomError::new(err))
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        FlowError::Cancelled(CancellationError(reason.into()))
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, FlowError::Cancelled(_))
    }
}

/// Raised when more than one promise rejects without a handler surfacing in
/// the same flush of an unhandled-rejection check.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{} unhandled rejections", .errors.len())]
pub struct MultipleUnhandledRejectionError {
    errors: Vec<FlowError>,
}

impl MultipleUnhandledRejectionError {
    pub fn new(errors: Vec<FlowError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[FlowError] {
        &self.errors
    }
}

impl IntoIterator for MultipleUnhandledRejectionError {
    type Item = FlowError;
    type IntoIter = std::vec::IntoIter<FlowError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}
