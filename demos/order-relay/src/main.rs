//! # Order Relay Demo
//!
//! End-to-end wiring of the courier relay against a real PostgreSQL
//! database: a producer writes an order and its event in one transaction,
//! the relay worker claims and "publishes" it (here: a logging publisher),
//! and the health monitor reports the aggregate state.
//!
//! Requires `DATABASE_URL` and the schema from the `courier-postgres`
//! crate docs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use courier_core::{
    HealthMonitor, HealthThresholds, NewEvent, OutboxEvent, PublishError, Publisher, RelayConfig,
    RelayWorker,
};
use courier_postgres::{OutboxListener, PgOutboxRepository};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

// ============================================================================
// Publisher (the external destination; here it just logs)
// ============================================================================

struct LoggingPublisher;

#[async_trait]
impl Publisher for LoggingPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        tracing::info!(
            tracking_id = %event.tracking_id,
            event_type = %event.event_type,
            payload = %event.payload,
            "delivering event"
        );
        Ok(())
    }
}

// ============================================================================
// Producer (business write + event insert in one transaction)
// ============================================================================

async fn place_order(pool: &PgPool, repository: &PgOutboxRepository) -> Result<Uuid> {
    let order_id = Uuid::new_v4();
    let mut tx = pool.begin().await?;

    // The business write and the event share one commit; a crash between
    // the two statements leaves neither behind.
    sqlx::query("INSERT INTO orders (id, status) VALUES ($1, 'placed')")
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

    let event = repository
        .insert_in_tx(
            &mut tx,
            NewEvent::new(
                "order",
                order_id.to_string(),
                "OrderPlaced",
                json!({ "order_id": order_id, "total_cents": 4200 }),
            ),
        )
        .await?;

    tx.commit().await?;
    println!("placed order {order_id}, event {} enqueued", event.tracking_id);
    Ok(event.tracking_id)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/courier_demo".into());
    let pool = PgPool::connect(&database_url).await?;
    sqlx::query("CREATE TABLE IF NOT EXISTS orders (id UUID PRIMARY KEY, status TEXT NOT NULL)")
        .execute(&pool)
        .await?;

    let repository = Arc::new(PgOutboxRepository::new(pool.clone()));

    let worker = RelayWorker::new(
        repository.clone(),
        Arc::new(LoggingPublisher),
        RelayConfig {
            poll_interval: Duration::from_secs(2),
            ..RelayConfig::default()
        },
    )?;

    // Optional fast path: wake the worker as soon as an insert commits.
    let listener = OutboxListener::connect(&pool).await?;
    tokio::spawn(listener.forward(worker.wake_handle()));

    let handle = worker.spawn();

    for _ in 0..3 {
        place_order(&pool, &repository).await?;
    }

    // Give the relay a moment, then look at the aggregate state.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let monitor = HealthMonitor::new(repository.clone(), HealthThresholds::default(), 10_000);
    let report = monitor.check().await;
    println!("health: {:?}", report.status);
    if let Some(gauges) = report.gauges {
        println!(
            "pending={} processing={} completed={} dead_letter={}",
            gauges.pending, gauges.processing, gauges.completed, gauges.dead_letter
        );
    }

    handle.shutdown().await;
    println!("relay stopped");
    Ok(())
}
