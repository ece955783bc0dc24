use thiserror::Error;

/// Errors produced by lifecycle transitions and input validation.
///
/// Every variant is returned synchronously to the caller of the triggering
/// operation; none of them crash the coordinating process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    /// Malformed or missing input, rejected before any mutation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The transition is not permitted from the record's current state
    /// (e.g. double-accept, completing an expired request).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The transition was attempted after the request's `expires_at`.
    #[error("Request has expired")]
    Expired,

    /// The acting participant lacks permission for the transition.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown request id.
    #[error("Request not found")]
    NotFound,
}
