//! Consumer-side deduplication: the inbox port and the idempotent
//! executor built on top of it.
//!
//! The relay guarantees at-least-once delivery, so every consumer sees
//! duplicates eventually. The inbox records `(tracking_id, consumer_id)`
//! pairs with race-safe insert semantics: when two consumer instances mark
//! the same event simultaneously, exactly one wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::OutboxError;

/// One processed-event record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxRecord {
    pub tracking_id: Uuid,
    pub consumer_id: String,
    pub processed_at: DateTime<Utc>,
}

/// Storage for processed tracking ids, keyed by
/// `(tracking_id, consumer_id)`.
///
/// Retention is the embedding application's concern; it should be at
/// least as long as the outbox retention so a redriven event still
/// deduplicates.
#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Whether any consumer has recorded this tracking id.
    async fn is_processed(&self, tracking_id: Uuid) -> Result<bool, OutboxError>;

    /// Record the pair. Returns `true` if this call inserted it, `false`
    /// if it already existed. Exactly one concurrent caller gets `true`.
    async fn mark_processed(
        &self,
        tracking_id: Uuid,
        consumer_id: &str,
    ) -> Result<bool, OutboxError>;

    /// The record for this tracking id, if any.
    async fn record(&self, tracking_id: Uuid) -> Result<Option<InboxRecord>, OutboxError>;
}

/// Outcome of an [`IdempotentExecutor::execute`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled<T> {
    /// This caller won the mark and ran the operation.
    Executed(T),
    /// Another caller (or an earlier delivery) already marked the event;
    /// the operation was skipped.
    Skipped,
}

impl<T> Handled<T> {
    pub fn was_executed(&self) -> bool {
        matches!(self, Handled::Executed(_))
    }
}

/// Wraps consumer work in the check → mark → execute protocol.
///
/// The mark happens before the user function runs and is not rolled back
/// if the function fails: at-least-once delivery is preserved across
/// crashes by the relay, so the operation itself must be idempotent.
/// Consumers are expected to forward `tracking_id` as an idempotency key
/// to downstream APIs.
pub struct IdempotentExecutor {
    store: Arc<dyn InboxStore>,
    consumer_id: String,
}

impl IdempotentExecutor {
    pub fn new(store: Arc<dyn InboxStore>, consumer_id: impl Into<String>) -> Self {
        Self { store, consumer_id: consumer_id.into() }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// Run `operation` iff this event has not been handled yet.
    ///
    /// A lost mark race returns [`Handled::Skipped`] and the caller
    /// proceeds on the assumption the peer does (or did) the work.
    pub async fn execute<F, Fut, T>(
        &self,
        tracking_id: Uuid,
        operation: F,
    ) -> Result<Handled<T>, OutboxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if self.store.is_processed(tracking_id).await? {
            return Ok(Handled::Skipped);
        }
        if !self.store.mark_processed(tracking_id, &self.consumer_id).await? {
            return Ok(Handled::Skipped);
        }
        Ok(Handled::Executed(operation().await))
    }
}
