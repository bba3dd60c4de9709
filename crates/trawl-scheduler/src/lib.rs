//! Cancellation, deadlines and bounded fan-out for trawl's search path.
//!
//! - [`RequestContext`] carries the cancellation scope and deadline of one query.
//! - [`ConcurrencyLimiter`] bounds in-flight backend requests and can be resized at runtime.
//! - [`TaskGroup`] runs sibling tasks where the first failure cancels the rest.

mod context;
mod group;
mod limiter;

pub use context::RequestContext;
pub use group::TaskGroup;
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use tokio_util::sync::CancellationToken;

use trawl_core::Error;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task panicked")]
    Panicked,
    #[error(transparent)]
    Failed(#[from] Error),
}

impl From<TaskError> for Error {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled => Error::cancelled(),
            TaskError::Panicked => Error::permanent("search task panicked"),
            TaskError::Failed(err) => err,
        }
    }
}
