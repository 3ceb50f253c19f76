//! Retry policies: given a failed attempt, decide whether to retry, where,
//! and at which consistency.

mod default;
mod fallthrough;

pub use default::{DefaultRetryPolicy, DefaultRetrySession};
pub use fallthrough::{FallthroughRetryPolicy, FallthroughRetrySession};

use crate::errors::RequestAttemptError;
use corvus_cql::Consistency;

/// Information about a failed request attempt.
pub struct RequestInfo<'a> {
    /// The error the attempt failed with.
    pub error: &'a RequestAttemptError,
    /// Whether the statement can be applied twice without changing the
    /// outcome. `false` means "unknown", which is treated as "no".
    pub is_idempotent: bool,
    /// The consistency the attempt was made with.
    pub consistency: Consistency,
}

/// What to do after a failed attempt. `None` consistencies mean "keep the
/// current one".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetrySameTarget(Option<Consistency>),
    RetryNextTarget(Option<Consistency>),
    DontRetry,
    IgnoreWriteError,
}

/// Creates one [RetrySession] per request.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Per-request retry state; dropped when the request completes.
pub trait RetrySession: Send + Sync {
    /// Called after each failed attempt.
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Resets the session for reuse by a new request.
    fn reset(&mut self);
}
