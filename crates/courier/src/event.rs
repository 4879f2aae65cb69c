//! The outbox event row and its status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Longest `last_error` string persisted with an event. Longer publisher
/// errors are truncated at a char boundary before they reach the store.
pub const MAX_ERROR_LEN: usize = 512;

/// Lifecycle of an outbox event.
///
/// Legal transitions:
///
/// ```text
///                   insert
///                     │
///                     ▼
///   ┌───────────── Pending ◄──────── Failed (retry_count < max_retries)
///   │                 │                ▲
///   │      claim_batch│                │
///   │                 ▼                │ transient publish failure
///   │            Processing ───────────┘
///   │           /          \
///   │   success/            \ retries exhausted, or permanent failure
///   │         ▼              ▼
///   └─► Completed         DeadLetter
///        (terminal)    (terminal; redrive re-enters Pending)
/// ```
///
/// The reaper additionally moves expired `Processing` rows back to
/// `Pending` without touching `retry_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl EventStatus {
    /// The literal stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::DeadLetter => "DEAD_LETTER",
        }
    }

    /// Parse the stored literal. Returns `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EventStatus::Pending),
            "PROCESSING" => Some(EventStatus::Processing),
            "COMPLETED" => Some(EventStatus::Completed),
            "FAILED" => Some(EventStatus::Failed),
            "DEAD_LETTER" => Some(EventStatus::DeadLetter),
            _ => None,
        }
    }

    /// Terminal statuses never change again (short of redrive or
    /// retention-driven deletion).
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::DeadLetter)
    }

    /// Statuses eligible for `claim_batch`.
    pub fn is_claimable(&self) -> bool {
        matches!(self, EventStatus::Pending | EventStatus::Failed)
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persisted outbox row.
///
/// `payload` and `metadata` are opaque to the relay and round-trip
/// semantically byte-for-byte. Lease fields (`locked_until`, `lock_token`)
/// are non-null exactly while the event is `Processing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Server-assigned, monotonic. Gaps permitted.
    pub id: i64,

    /// Idempotency key across producer, relay and consumer. Unique,
    /// immutable.
    pub tracking_id: Uuid,

    /// Business correlation; not interpreted by the relay.
    pub aggregate_id: String,

    /// Short tag describing the aggregate kind.
    pub aggregate_type: String,

    /// Short tag used for dead-letter stats, redrive scoping and routing.
    pub event_type: String,

    /// Event body.
    pub payload: serde_json::Value,

    /// Schema version, trace context, correlation/causation ids.
    pub metadata: serde_json::Value,

    pub status: EventStatus,

    /// Attempts so far. Non-decreasing until a redrive resets it.
    pub retry_count: i32,

    /// Threshold for the dead-letter transition. Immutable after insert.
    pub max_retries: i32,

    pub created_at: DateTime<Utc>,

    /// Set on transition to a terminal status.
    pub processed_at: Option<DateTime<Utc>>,

    /// Earliest instant the row is claimable again after a failed attempt.
    pub visible_at: Option<DateTime<Utc>>,

    /// Current lease deadline.
    pub locked_until: Option<DateTime<Utc>>,

    /// Fencing token identifying the leaseholder.
    pub lock_token: Option<i64>,

    /// Most recent failure reason, truncated to [`MAX_ERROR_LEN`].
    pub last_error: Option<String>,
}

impl OutboxEvent {
    /// Whether the remaining retry budget allows another failed attempt
    /// before dead-lettering.
    pub fn has_retries_left(&self) -> bool {
        self.retry_count + 1 < self.max_retries
    }
}

/// Input for [`crate::OutboxRepository::insert`]: every caller-supplied
/// field of an event. `id`, `created_at` and `processed_at` are
/// server-assigned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub tracking_id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub max_retries: i32,
}

impl NewEvent {
    /// Default retry budget when the caller does not override it.
    pub const DEFAULT_MAX_RETRIES: i32 = 5;

    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            tracking_id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            event_type: event_type.into(),
            payload,
            metadata: serde_json::Value::Object(serde_json::Map::new()),
            max_retries: Self::DEFAULT_MAX_RETRIES,
        }
    }

    /// Supply the tracking id instead of generating one. Useful when the
    /// producer already owns an idempotency key.
    pub fn with_tracking_id(mut self, tracking_id: Uuid) -> Self {
        self.tracking_id = tracking_id;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Per-event-type aggregate over the dead-letter population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterStats {
    pub event_type: String,
    pub count: i64,
    /// Age of the oldest dead-lettered event of this type, in seconds.
    pub oldest_age_seconds: i64,
    /// Age of the newest dead-lettered event of this type, in seconds.
    pub newest_age_seconds: i64,
    /// Up to a few distinct truncated error samples.
    pub sample_errors: Vec<String>,
}

/// Truncate an error string to [`MAX_ERROR_LEN`] at a char boundary.
pub fn truncate_error(error: &str) -> String {
    if error.len() <= MAX_ERROR_LEN {
        return error.to_string();
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    error[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_literals_round_trip() {
        for status in [
            EventStatus::Pending,
            EventStatus::Processing,
            EventStatus::Completed,
            EventStatus::Failed,
            EventStatus::DeadLetter,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventStatus::parse("pending"), None);
        assert_eq!(EventStatus::parse(""), None);
    }

    #[test]
    fn status_serde_uses_wire_literals() {
        let json = serde_json::to_string(&EventStatus::DeadLetter).unwrap();
        assert_eq!(json, "\"DEAD_LETTER\"");
        let back: EventStatus = serde_json::from_str("\"PROCESSING\"").unwrap();
        assert_eq!(back, EventStatus::Processing);
    }

    #[test]
    fn terminal_and_claimable_partitions() {
        assert!(EventStatus::Completed.is_terminal());
        assert!(EventStatus::DeadLetter.is_terminal());
        assert!(!EventStatus::Processing.is_terminal());

        assert!(EventStatus::Pending.is_claimable());
        assert!(EventStatus::Failed.is_claimable());
        assert!(!EventStatus::Processing.is_claimable());
        assert!(!EventStatus::Completed.is_claimable());
    }

    #[test]
    fn new_event_defaults() {
        let event = NewEvent::new("order", "order-42", "OrderCreated", serde_json::json!({"id": 42}));
        assert_eq!(event.max_retries, NewEvent::DEFAULT_MAX_RETRIES);
        assert!(event.metadata.as_object().unwrap().is_empty());

        let pinned = Uuid::new_v4();
        let event = event.with_tracking_id(pinned).with_max_retries(2);
        assert_eq!(event.tracking_id, pinned);
        assert_eq!(event.max_retries, 2);
    }

    #[test]
    fn error_truncation_respects_char_boundaries() {
        let short = truncate_error("timeout");
        assert_eq!(short, "timeout");

        let long = "é".repeat(MAX_ERROR_LEN);
        let truncated = truncate_error(&long);
        assert!(truncated.len() <= MAX_ERROR_LEN);
        assert!(truncated.chars().all(|c| c == 'é'));
    }
}
