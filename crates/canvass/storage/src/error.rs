use thiserror::Error;

/// Result alias used across the canvass storage traits.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failure taxonomy for the canvass storage contract.
///
/// `Conflict` reports a lost uniqueness race (tracking id, chat id,
/// idempotency token, pending request pair); the losing writer re-fetches
/// the winning row instead of crashing. `InvariantViolation` reports a
/// guarded write whose precondition no longer held, such as finalizing a
/// request that is no longer pending.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The referenced volunteer, activity, request, team, or link is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint lost a concurrent race.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A guarded write's precondition no longer holds.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The backing store itself failed (poisoned lock, driver error).
    #[error("storage backend: {0}")]
    Backend(String),
}
