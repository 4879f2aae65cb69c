//! The outbox repository over `sqlx`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    truncate_error, DeadLetterStats, EventStatus, NewEvent, OutboxError, OutboxEvent,
    OutboxRepository, RecentPage, RecentQuery,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::NOTIFY_CHANNEL;

const EVENT_COLUMNS: &str = "id, tracking_id, aggregate_id, aggregate_type, event_type, \
     payload, metadata, status, retry_count, max_retries, created_at, processed_at, \
     visible_at, locked_until, lock_token, last_error";

/// PostgreSQL outbox repository.
///
/// Every port operation is one statement (or one short transaction); the
/// lease and fencing token carry the mutual exclusion, so no transaction
/// is ever held across a publisher call.
#[derive(Clone)]
pub struct PgOutboxRepository {
    pool: PgPool,
}

impl PgOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert inside the caller's open transaction so the event becomes
    /// durable iff the business write commits.
    ///
    /// This is the producer-side entry point; the pool-based
    /// [`OutboxRepository::insert`] is the standalone flavor.
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: NewEvent,
    ) -> Result<OutboxEvent, OutboxError> {
        let tracking_id = event.tracking_id;
        let row = insert_query(&event)
            .fetch_one(&mut **tx)
            .await
            .map_err(|err| map_insert_error(err, tracking_id))?;
        // Fires on commit, so the relay never wakes for an aborted insert.
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(NOTIFY_CHANNEL)
            .execute(&mut **tx)
            .await
            .map_err(OutboxError::database)?;
        event_from_row(&row)
    }

    /// Delete completed events older than `older_than`. Retention is the
    /// embedding application's schedule; this is the mechanism.
    pub async fn cleanup_completed(
        &self,
        older_than: DateTime<Utc>,
    ) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox
            WHERE status = 'COMPLETED'
              AND processed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected())
    }

    async fn count_with_status(&self, status: EventStatus) -> Result<i64, OutboxError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM outbox WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(OutboxError::database)?;
        row.try_get("count").map_err(OutboxError::database)
    }
}

fn insert_query(event: &NewEvent) -> sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(
        r#"
        INSERT INTO outbox (
            tracking_id,
            aggregate_id,
            aggregate_type,
            event_type,
            payload,
            metadata,
            max_retries
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, tracking_id, aggregate_id, aggregate_type, event_type,
                  payload, metadata, status, retry_count, max_retries, created_at,
                  processed_at, visible_at, locked_until, lock_token, last_error
        "#,
    )
    .bind(event.tracking_id)
    .bind(&event.aggregate_id)
    .bind(&event.aggregate_type)
    .bind(&event.event_type)
    .bind(&event.payload)
    .bind(&event.metadata)
    .bind(event.max_retries)
}

fn map_insert_error(err: sqlx::Error, tracking_id: Uuid) -> OutboxError {
    if let sqlx::Error::Database(db_err) = &err {
        // 23505: unique_violation. The only unique constraint hit by an
        // insert is the tracking id.
        if db_err.code().as_deref() == Some("23505") {
            return OutboxError::DuplicateTrackingId(tracking_id);
        }
    }
    OutboxError::database(err)
}

fn event_from_row(row: &PgRow) -> Result<OutboxEvent, OutboxError> {
    let status: String = row.try_get("status").map_err(OutboxError::database)?;
    let status = EventStatus::parse(&status)
        .ok_or_else(|| OutboxError::Database(anyhow::anyhow!("unknown event status {status:?}")))?;
    Ok(OutboxEvent {
        id: row.try_get("id").map_err(OutboxError::database)?,
        tracking_id: row.try_get("tracking_id").map_err(OutboxError::database)?,
        aggregate_id: row.try_get("aggregate_id").map_err(OutboxError::database)?,
        aggregate_type: row.try_get("aggregate_type").map_err(OutboxError::database)?,
        event_type: row.try_get("event_type").map_err(OutboxError::database)?,
        payload: row.try_get("payload").map_err(OutboxError::database)?,
        metadata: row.try_get("metadata").map_err(OutboxError::database)?,
        status,
        retry_count: row.try_get("retry_count").map_err(OutboxError::database)?,
        max_retries: row.try_get("max_retries").map_err(OutboxError::database)?,
        created_at: row.try_get("created_at").map_err(OutboxError::database)?,
        processed_at: row.try_get("processed_at").map_err(OutboxError::database)?,
        visible_at: row.try_get("visible_at").map_err(OutboxError::database)?,
        locked_until: row.try_get("locked_until").map_err(OutboxError::database)?,
        lock_token: row.try_get("lock_token").map_err(OutboxError::database)?,
        last_error: row.try_get("last_error").map_err(OutboxError::database)?,
    })
}

fn events_from_rows(rows: Vec<PgRow>) -> Result<Vec<OutboxEvent>, OutboxError> {
    rows.iter().map(event_from_row).collect()
}

fn lease_deadline(lease: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

#[async_trait]
impl OutboxRepository for PgOutboxRepository {
    async fn insert(&self, event: NewEvent) -> Result<OutboxEvent, OutboxError> {
        let mut tx = self.pool.begin().await.map_err(OutboxError::database)?;
        let inserted = self.insert_in_tx(&mut tx, event).await?;
        tx.commit().await.map_err(OutboxError::database)?;
        Ok(inserted)
    }

    /// Claim ready events for this worker.
    ///
    /// `FOR UPDATE SKIP LOCKED` makes concurrent claimers skip each
    /// other's candidate rows instead of queueing on them. The outer
    /// select re-orders because `UPDATE .. RETURNING` promises no order.
    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
        lock_token: i64,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM outbox
                WHERE status IN ('PENDING', 'FAILED')
                  AND (visible_at IS NULL OR visible_at <= NOW())
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ),
            claimed AS (
                UPDATE outbox
                SET status = 'PROCESSING',
                    lock_token = $2,
                    locked_until = $3
                WHERE id IN (SELECT id FROM claimable)
                RETURNING id, tracking_id, aggregate_id, aggregate_type, event_type,
                          payload, metadata, status, retry_count, max_retries, created_at,
                          processed_at, visible_at, locked_until, lock_token, last_error
            )
            SELECT * FROM claimed ORDER BY created_at ASC
            "#,
        )
        .bind(batch_size as i64)
        .bind(lock_token)
        .bind(lease_deadline(lease))
        .fetch_all(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        events_from_rows(rows)
    }

    async fn renew_lease(
        &self,
        id: i64,
        lock_token: i64,
        lease: Duration,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET locked_until = $3
            WHERE id = $1
              AND lock_token = $2
              AND status = 'PROCESSING'
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .bind(lease_deadline(lease))
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(&self, id: i64, lock_token: i64) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'COMPLETED',
                processed_at = NOW(),
                locked_until = NULL,
                lock_token = NULL,
                visible_at = NULL
            WHERE id = $1
              AND lock_token = $2
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: i64,
        lock_token: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'FAILED',
                retry_count = retry_count + 1,
                last_error = $3,
                visible_at = $4,
                locked_until = NULL,
                lock_token = NULL
            WHERE id = $1
              AND lock_token = $2
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .bind(truncate_error(error))
        .bind(retry_at)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_dead_letter(
        &self,
        id: i64,
        lock_token: i64,
        error: &str,
    ) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'DEAD_LETTER',
                retry_count = retry_count + 1,
                last_error = $3,
                processed_at = NOW(),
                locked_until = NULL,
                lock_token = NULL,
                visible_at = NULL
            WHERE id = $1
              AND lock_token = $2
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn recover_stale(&self) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PENDING',
                locked_until = NULL,
                lock_token = NULL
            WHERE status = 'PROCESSING'
              AND locked_until < NOW()
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected())
    }

    async fn redrive_by_event_type(&self, event_type: &str) -> Result<u64, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PENDING',
                retry_count = 0,
                last_error = NULL,
                processed_at = NULL,
                visible_at = NULL
            WHERE status = 'DEAD_LETTER'
              AND event_type = $1
            "#,
        )
        .bind(event_type)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected())
    }

    async fn redrive_by_id(&self, id: i64) -> Result<bool, OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'PENDING',
                retry_count = 0,
                last_error = NULL,
                processed_at = NULL,
                visible_at = NULL
            WHERE status = 'DEAD_LETTER'
              AND id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        Ok(result.rows_affected() == 1)
    }

    async fn pending_count(&self) -> Result<i64, OutboxError> {
        self.count_with_status(EventStatus::Pending).await
    }

    async fn processing_count(&self) -> Result<i64, OutboxError> {
        self.count_with_status(EventStatus::Processing).await
    }

    async fn completed_count(&self) -> Result<i64, OutboxError> {
        self.count_with_status(EventStatus::Completed).await
    }

    async fn dead_letter_count(&self) -> Result<i64, OutboxError> {
        self.count_with_status(EventStatus::DeadLetter).await
    }

    async fn oldest_pending_age_seconds(&self) -> Result<i64, OutboxError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox
            WHERE status = 'PENDING'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        row.try_get("age_seconds").map_err(OutboxError::database)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<OutboxEvent>, OutboxError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM outbox WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(OutboxError::database)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_by_tracking_id(
        &self,
        tracking_id: Uuid,
    ) -> Result<Option<OutboxEvent>, OutboxError> {
        let row =
            sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM outbox WHERE tracking_id = $1"))
                .bind(tracking_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(OutboxError::database)?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM outbox WHERE status = $1 \
             ORDER BY created_at ASC, id ASC LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        events_from_rows(rows)
    }

    async fn find_recent(&self, query: RecentQuery) -> Result<RecentPage, OutboxError> {
        // Fetch one row past the limit to learn whether more exist, then
        // drop the row furthest from the cursor so pages stay adjacent.
        let fetch = query.limit as i64 + 1;

        if let Some(after) = query.after {
            let rows = sqlx::query(&format!(
                "SELECT {EVENT_COLUMNS} FROM outbox WHERE id > $1 ORDER BY id ASC LIMIT $2"
            ))
            .bind(after)
            .bind(fetch)
            .fetch_all(&self.pool)
            .await
            .map_err(OutboxError::database)?;

            let mut events = events_from_rows(rows)?;
            let has_more = events.len() > query.limit;
            events.truncate(query.limit);
            events.reverse();
            return Ok(RecentPage { events, has_more });
        }

        let rows = match query.before {
            Some(before) => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM outbox WHERE id < $1 ORDER BY id DESC LIMIT $2"
                ))
                .bind(before)
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {EVENT_COLUMNS} FROM outbox ORDER BY id DESC LIMIT $1"
                ))
                .bind(fetch)
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(OutboxError::database)?;

        let mut events = events_from_rows(rows)?;
        let has_more = events.len() > query.limit;
        events.truncate(query.limit);
        Ok(RecentPage { events, has_more })
    }

    async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStats>, OutboxError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_type,
                COUNT(*) AS count,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS oldest_age_seconds,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MAX(created_at)))::BIGINT, 0) AS newest_age_seconds,
                (ARRAY_AGG(DISTINCT LEFT(last_error, 512)) FILTER (WHERE last_error IS NOT NULL))[1:3]
                    AS sample_errors
            FROM outbox
            WHERE status = 'DEAD_LETTER'
            GROUP BY event_type
            ORDER BY count DESC, event_type ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(OutboxError::database)?;

        rows.into_iter()
            .map(|row| {
                Ok(DeadLetterStats {
                    event_type: row.try_get("event_type").map_err(OutboxError::database)?,
                    count: row.try_get("count").map_err(OutboxError::database)?,
                    oldest_age_seconds: row
                        .try_get("oldest_age_seconds")
                        .map_err(OutboxError::database)?,
                    newest_age_seconds: row
                        .try_get("newest_age_seconds")
                        .map_err(OutboxError::database)?,
                    sample_errors: row
                        .try_get::<Option<Vec<String>>, _>("sample_errors")
                        .map_err(OutboxError::database)?
                        .unwrap_or_default(),
                })
            })
            .collect()
    }
}
