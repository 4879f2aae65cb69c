//! PostgreSQL implementation of the courier outbox and inbox ports.
//!
//! # Features
//!
//! - Claiming with `FOR UPDATE SKIP LOCKED` so concurrent workers never
//!   serialize on the same rows
//! - Fencing-token-gated finalize and lease renewal
//! - Reaper sweep for abandoned leases
//! - Backoff-aware re-admission via `visible_at`
//! - Dead-letter redrive scoped by event type or id
//! - `LISTEN/NOTIFY` wake fast-path for the relay poll loop
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE outbox (
//!     id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
//!     tracking_id UUID NOT NULL,
//!     aggregate_id TEXT NOT NULL,
//!     aggregate_type TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!     metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
//!
//!     -- Lifecycle
//!     status TEXT NOT NULL DEFAULT 'PENDING',
//!     retry_count INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 5,
//!
//!     -- Lease
//!     locked_until TIMESTAMPTZ,
//!     lock_token BIGINT,
//!
//!     -- Scheduling
//!     visible_at TIMESTAMPTZ,
//!
//!     -- Error tracking
//!     last_error TEXT,
//!
//!     -- Timestamps
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     processed_at TIMESTAMPTZ,
//!
//!     CONSTRAINT outbox_tracking_id_key UNIQUE (tracking_id),
//!     CONSTRAINT outbox_status_check CHECK
//!         (status IN ('PENDING', 'PROCESSING', 'COMPLETED', 'FAILED', 'DEAD_LETTER'))
//! );
//!
//! CREATE INDEX idx_outbox_ready ON outbox (created_at)
//!     WHERE status IN ('PENDING', 'FAILED');
//! CREATE INDEX idx_outbox_lease ON outbox (locked_until)
//!     WHERE status = 'PROCESSING';
//! CREATE INDEX idx_outbox_aggregate ON outbox (aggregate_id, created_at);
//!
//! CREATE TABLE inbox (
//!     id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
//!     tracking_id UUID NOT NULL,
//!     consumer_id TEXT NOT NULL,
//!     processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     CONSTRAINT inbox_dedupe_key UNIQUE (tracking_id, consumer_id)
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use courier_postgres::{OutboxListener, PgOutboxRepository};
//! use courier_core::{NewEvent, RelayConfig, RelayWorker};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! let repository = Arc::new(PgOutboxRepository::new(pool.clone()));
//!
//! // Producer: event and business write commit together.
//! let mut tx = pool.begin().await?;
//! sqlx::query("UPDATE orders SET status = 'placed' WHERE id = $1")
//!     .bind(order_id)
//!     .execute(&mut *tx)
//!     .await?;
//! repository.insert_in_tx(&mut tx, NewEvent::new("order", order_id, "OrderPlaced", payload)).await?;
//! tx.commit().await?;
//!
//! // Relay: claim under lease, publish, finalize.
//! let worker = RelayWorker::new(repository, publisher, RelayConfig::default())?;
//! let listener = OutboxListener::connect(&pool).await?;
//! tokio::spawn(listener.forward(worker.wake_handle()));
//! let handle = worker.spawn();
//! ```

mod inbox;
mod listener;
mod repository;

pub use inbox::PgInboxStore;
pub use listener::OutboxListener;
pub use repository::PgOutboxRepository;

/// Channel used by the insert notify fast-path. Payload is ignored; a
/// notification only means "something may be ready".
pub const NOTIFY_CHANNEL: &str = "courier_outbox_wake";
