//! Typed failure conditions raised by the scheduler client and the cache.
//!
//! Mirrors the shape of the teacher engine's `BackendError`: an enum callers
//! can `match`/`downcast_ref` on to decide whether a failure is fatal or
//! should change behavior (fall back to polling, treat a 404 as success).

use thiserror::Error;

/// Conditions the scheduler client and event cache distinguish explicitly.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The scheduler rejected the request as unauthorized for the configured token.
    #[error("scheduler denied permission for this request")]
    PermissionDenied,

    /// The job, evaluation, or allocation named does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The evaluation reached a terminal non-complete status.
    #[error("evaluation {id} did not complete: {status_description}")]
    EvaluationNotComplete {
        /// Evaluation identifier.
        id: String,
        /// The scheduler's elaboration of why it failed.
        status_description: String,
    },

    /// A log-stream or event-stream chunk could not be parsed as JSON.
    #[error("malformed stream chunk: {0}")]
    MalformedChunk(String),

    /// Transport-level failure talking to the scheduler.
    #[error("scheduler request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl WatchError {
    /// Whether this error should be treated as "job is gone", which a
    /// purge-mode watcher tolerates rather than treating as fatal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, WatchError::NotFound(_))
    }
}
