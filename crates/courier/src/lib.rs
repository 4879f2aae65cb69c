//! # Courier
//!
//! A transactional outbox relay core: events become durable in the same
//! database transaction as the business state change, and are relayed
//! at-least-once to an external destination by leased, fencing-token
//! protected workers.
//!
//! ## Core Concepts
//!
//! Courier separates **durability** from **delivery**:
//! - The producer writes the event row inside its own transaction — either
//!   both the business change and the event are visible, or neither.
//! - The relay worker later claims pending rows under a time-bounded lease
//!   and dispatches them to a [`Publisher`].
//!
//! The key principle: **the lease plus the fencing token is the mutual
//! exclusion**, never a long-held database transaction.
//!
//! ## Architecture
//!
//! ```text
//! Producer tx ──insert()──► outbox table ◄──────────────┐
//!                               │                       │
//!                    claim_batch│ (SKIP LOCKED,         │ recover_stale()
//!                               │  lease + token)       │
//!                               ▼                       │
//!                         RelayWorker ────────────── Reaper
//!                          │   │   │
//!                heartbeat │   │   │ finalize (gated on token)
//!           renew_lease()  │   │   │ mark_completed / mark_failed /
//!                          │   │   │ mark_dead_letter
//!                          │   ▼   │
//!                      Publisher::publish()
//!                               │
//!                               ▼
//!              consumer ── InboxStore (dedupe on tracking_id)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Insert is transactional** — the event shares the producer's commit
//! 2. **At most one leaseholder** — a row is `PROCESSING` iff it carries a
//!    lease deadline and a fencing token
//! 3. **Fenced finalize** — a worker that lost its lease cannot mutate the
//!    row; the gated updates affect zero rows and return `false`
//! 4. **Reaping is neutral** — recovered rows keep their `retry_count`
//! 5. **Terminal is terminal** — `COMPLETED` and `DEAD_LETTER` rows only
//!    change via operator redrive or retention deletion
//!
//! ## Guarantees
//!
//! - **At-least-once delivery**: duplicates are possible and consumers
//!   deduplicate via the [`InboxStore`]
//! - **No global ordering**: a claimed batch arrives in `created_at` order,
//!   but across claims, retries and workers no order is promised
//! - **Bounded retry**: transient failures back off exponentially until the
//!   retry budget is spent, then the row dead-letters for operator redrive
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use courier_core::{NewEvent, RelayConfig, RelayWorker};
//! use courier_postgres::PgOutboxRepository;
//!
//! let repository = Arc::new(PgOutboxRepository::new(pool.clone()));
//!
//! // Producer side: enlist the event in the business transaction.
//! let mut tx = pool.begin().await?;
//! sqlx::query("INSERT INTO orders (id) VALUES ($1)").bind(42).execute(&mut *tx).await?;
//! repository
//!     .insert_in_tx(&mut tx, NewEvent::new("order", "42", "OrderCreated", payload))
//!     .await?;
//! tx.commit().await?;
//!
//! // Relay side: one worker, one fencing token, leased claims.
//! let worker = RelayWorker::new(repository, publisher, RelayConfig::default())?;
//! let handle = worker.spawn();
//! // ...
//! handle.shutdown().await;
//! ```
//!
//! ## What This Is Not
//!
//! Courier is **not**:
//! - A message broker (no fan-out, topics or subscriptions)
//! - Exactly-once delivery
//! - A global ordering guarantee
//! - An in-memory queue beyond the in-flight batch
//!
//! Courier **is**:
//! > A relay core that makes an event durable with the business write and
//! > delivers it at-least-once, surviving worker crashes via leases,
//! > fencing tokens and the reaper.

// Core modules
mod backoff;
mod config;
mod error;
mod event;
mod health;
mod idempotency;
mod limiter;
mod publisher;
mod reaper;
mod repository;
mod token;
mod worker;

// Re-export the event model
pub use event::{
    truncate_error, DeadLetterStats, EventStatus, NewEvent, OutboxEvent, MAX_ERROR_LEN,
};

// Re-export error types
pub use error::{OutboxError, PublishError};

// Re-export ports
pub use idempotency::{Handled, IdempotentExecutor, InboxRecord, InboxStore};
pub use publisher::Publisher;
pub use repository::{OutboxRepository, RecentPage, RecentQuery};

// Re-export relay machinery
pub use backoff::RetryPolicy;
pub use config::{BacklogPolicy, HealthThresholds, OverflowAction, RelayConfig};
pub use health::{HealthCheck, HealthMonitor, HealthReport, HealthStatus, OutboxGauges};
pub use limiter::{utilization_pct, Admission, BacklogLimiter};
pub use reaper::Reaper;
pub use token::next_lock_token;
pub use worker::{RelayHandle, RelayWorker};

// Re-export commonly used external types
pub use async_trait::async_trait;
