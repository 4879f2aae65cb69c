//! Error taxonomy for the relay core.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the outbox ports and the components above them.
///
/// Lease loss is deliberately not an error: the gated repository updates
/// return `false` and the caller abandons the event.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// `tracking_id` collided with an existing row. The caller decides:
    /// retry with a new id, or report the conflict.
    #[error("tracking id {0} already exists in the outbox")]
    DuplicateTrackingId(Uuid),

    /// Ingress rejected by the backlog limiter under the `Reject` action.
    #[error("outbox backlog exceeded: {pending} pending >= limit {max}")]
    BacklogExceeded { pending: i64, max: i64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other database failure. Propagates to the caller; the relay
    /// loop logs it and retries on the next iteration.
    #[error("database error: {0}")]
    Database(#[from] anyhow::Error),
}

impl OutboxError {
    /// Wrap a driver error into the opaque database variant.
    pub fn database<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        OutboxError::Database(anyhow::Error::new(err))
    }
}

/// Outcome of a publish attempt, as reported by the publisher port.
///
/// `Transient` failures consume one retry; `Permanent` failures
/// dead-letter the event immediately.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("transient publish failure: {0}")]
    Transient(String),

    #[error("permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    /// The failure reason recorded as the event's `last_error`.
    pub fn reason(&self) -> &str {
        match self {
            PublishError::Transient(reason) | PublishError::Permanent(reason) => reason,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, PublishError::Permanent(_))
    }
}
