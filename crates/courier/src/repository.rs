//! The repository port: the narrow set of atomic operations the relay
//! core issues against the event store.
//!
//! Concurrency correctness rests here. Every operation is atomic at the
//! database; the lease plus fencing token provides mutual exclusion
//! between claim and finalize, never a long-held transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::error::OutboxError;
use crate::event::{DeadLetterStats, EventStatus, NewEvent, OutboxEvent};

/// Cursor query over recent events, keyed by `id`.
///
/// `after` pages toward newer rows, `before` toward older. At most one of
/// the two is meaningful per call; when both are set, `after` wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecentQuery {
    pub limit: usize,
    pub after: Option<i64>,
    pub before: Option<i64>,
}

impl RecentQuery {
    pub fn latest(limit: usize) -> Self {
        Self { limit, after: None, before: None }
    }

    pub fn after(limit: usize, id: i64) -> Self {
        Self { limit, after: Some(id), before: None }
    }

    pub fn before(limit: usize, id: i64) -> Self {
        Self { limit, after: None, before: Some(id) }
    }
}

/// One page of [`RecentQuery`] results, in descending `id` order.
///
/// `has_more` is true iff a further row existed at query time, which keeps
/// clients stable under concurrent inserts.
#[derive(Debug, Clone)]
pub struct RecentPage {
    pub events: Vec<OutboxEvent>,
    pub has_more: bool,
}

/// Atomic operations over the outbox table.
///
/// The event store exclusively owns all event rows and implementations of
/// this trait are the only writers. Database errors other than the unique
/// violation propagate as [`OutboxError::Database`]; the core never
/// retries repository calls internally.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Persist a new event and return it with the server-assigned `id`
    /// and `created_at`.
    ///
    /// Fails with [`OutboxError::DuplicateTrackingId`] on a `tracking_id`
    /// collision. Driver crates additionally expose a variant that
    /// enlists in the producer's open transaction so the event and the
    /// business write commit atomically.
    async fn insert(&self, event: NewEvent) -> Result<OutboxEvent, OutboxError>;

    /// Atomically claim up to `batch_size` eligible rows for this worker.
    ///
    /// Eligible means `status ∈ {Pending, Failed}`, `visible_at` is null
    /// or due, and `locked_until` is null or expired. Claimed rows move
    /// to `Processing`, stamped with `lock_token` and
    /// `locked_until = now() + lease`. Rows locked by a concurrent
    /// claimer are skipped, not waited on, so N workers make progress
    /// without serializing.
    ///
    /// The returned batch is ordered by `created_at` ascending. Across
    /// calls and across workers no order is promised.
    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
        lock_token: i64,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Extend the lease iff this worker still holds it.
    ///
    /// A `false` return means the lease was lost (reaped or re-claimed);
    /// the worker must stop heartbeating and treat the in-flight
    /// side-effect outcome as unknown.
    async fn renew_lease(
        &self,
        id: i64,
        lock_token: i64,
        lease: Duration,
    ) -> Result<bool, OutboxError>;

    /// Transition to `Completed`, set `processed_at`, clear the lease.
    /// Gated on `id AND lock_token`; `true` iff exactly one row changed.
    async fn mark_completed(&self, id: i64, lock_token: i64) -> Result<bool, OutboxError>;

    /// Transition to `Failed`, increment `retry_count`, record the error
    /// and the earliest next attempt (`visible_at`), clear the lease.
    /// Gated on `id AND lock_token`.
    async fn mark_failed(
        &self,
        id: i64,
        lock_token: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, OutboxError>;

    /// Transition to `DeadLetter`, increment `retry_count` (the final
    /// attempt counts), record the error, set `processed_at`, clear the
    /// lease. Gated on `id AND lock_token`.
    async fn mark_dead_letter(
        &self,
        id: i64,
        lock_token: i64,
        error: &str,
    ) -> Result<bool, OutboxError>;

    /// Return expired `Processing` rows to `Pending`, clearing lease
    /// fields and preserving `retry_count`. Returns the number recovered.
    async fn recover_stale(&self) -> Result<u64, OutboxError>;

    /// Reset dead-lettered rows of one event type to `Pending` with
    /// `retry_count = 0` and `last_error = NULL`. Returns the count.
    ///
    /// There is intentionally no unfiltered mass redrive.
    async fn redrive_by_event_type(&self, event_type: &str) -> Result<u64, OutboxError>;

    /// Reset one dead-lettered row to `Pending`. `true` iff it changed.
    async fn redrive_by_id(&self, id: i64) -> Result<bool, OutboxError>;

    async fn pending_count(&self) -> Result<i64, OutboxError>;

    async fn processing_count(&self) -> Result<i64, OutboxError>;

    async fn completed_count(&self) -> Result<i64, OutboxError>;

    async fn dead_letter_count(&self) -> Result<i64, OutboxError>;

    /// Age in seconds of the oldest pending event; 0 when none pending.
    async fn oldest_pending_age_seconds(&self) -> Result<i64, OutboxError>;

    async fn find_by_id(&self, id: i64) -> Result<Option<OutboxEvent>, OutboxError>;

    async fn find_by_tracking_id(
        &self,
        tracking_id: Uuid,
    ) -> Result<Option<OutboxEvent>, OutboxError>;

    async fn find_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Keyset pagination over `id`, newest first. See [`RecentQuery`].
    async fn find_recent(&self, query: RecentQuery) -> Result<RecentPage, OutboxError>;

    /// Per-event-type aggregates over the dead-letter population.
    async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStats>, OutboxError>;
}
