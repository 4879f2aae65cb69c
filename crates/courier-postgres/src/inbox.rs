//! The inbox store over `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{InboxRecord, InboxStore, OutboxError};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// PostgreSQL inbox store.
///
/// `mark_processed` leans on the unique `(tracking_id, consumer_id)`
/// constraint with `ON CONFLICT DO NOTHING`, so when several consumer
/// instances race on the same delivery exactly one insert lands.
#[derive(Clone)]
pub struct PgInboxStore {
    pool: PgPool,
}

impl PgInboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete records processed before `older_than`.
    ///
    /// Run this on a schedule at least as lenient as the outbox
    /// retention, so a redriven event still deduplicates.
    pub async fn cleanup_older_than(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, OutboxError> {
        let result = sqlx::query("DELETE FROM inbox WHERE processed_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await
            .map_err(OutboxError::database)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl InboxStore for PgInboxStore {
    async fn is_processed(&self, tracking_id: Uuid) -> Result<bool, OutboxError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM inbox WHERE tracking_id = $1) AS processed",
        )
        .bind(tracking_id)
        .fetch_one(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        row.try_get("processed").map_err(OutboxError::database)
    }

    async fn mark_processed(
        &self,
        tracking_id: Uuid,
        consumer_id: &str,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbox (tracking_id, consumer_id)
            VALUES ($1, $2)
            ON CONFLICT (tracking_id, consumer_id) DO NOTHING
            "#,
        )
        .bind(tracking_id)
        .bind(consumer_id)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record(&self, tracking_id: Uuid) -> Result<Option<InboxRecord>, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT tracking_id, consumer_id, processed_at
            FROM inbox
            WHERE tracking_id = $1
            ORDER BY processed_at ASC
            LIMIT 1
            "#,
        )
        .bind(tracking_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        row.map(|row| {
            Ok(InboxRecord {
                tracking_id: row.try_get("tracking_id").map_err(OutboxError::database)?,
                consumer_id: row.try_get("consumer_id").map_err(OutboxError::database)?,
                processed_at: row.try_get("processed_at").map_err(OutboxError::database)?,
            })
        })
        .transpose()
    }
}
