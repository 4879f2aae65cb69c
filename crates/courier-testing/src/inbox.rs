//! In-memory inbox store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{InboxRecord, InboxStore, OutboxError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Concurrent map with insert-if-absent semantics matching the unique
/// `(tracking_id, consumer_id)` constraint: when N callers race on the
/// same pair, exactly one `mark_processed` returns `true`.
#[derive(Default)]
pub struct InMemoryInboxStore {
    records: DashMap<(Uuid, String), DateTime<Utc>>,
}

impl InMemoryInboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl InboxStore for InMemoryInboxStore {
    async fn is_processed(&self, tracking_id: Uuid) -> Result<bool, OutboxError> {
        Ok(self.records.iter().any(|entry| entry.key().0 == tracking_id))
    }

    async fn mark_processed(
        &self,
        tracking_id: Uuid,
        consumer_id: &str,
    ) -> Result<bool, OutboxError> {
        match self.records.entry((tracking_id, consumer_id.to_string())) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(vacant) => {
                vacant.insert(Utc::now());
                Ok(true)
            }
        }
    }

    async fn record(&self, tracking_id: Uuid) -> Result<Option<InboxRecord>, OutboxError> {
        Ok(self
            .records
            .iter()
            .find(|entry| entry.key().0 == tracking_id)
            .map(|entry| InboxRecord {
                tracking_id,
                consumer_id: entry.key().1.clone(),
                processed_at: *entry.value(),
            }))
    }
}
