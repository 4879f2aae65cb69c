//! `LISTEN/NOTIFY` wake fast-path.
//!
//! Inserts fire `pg_notify` on the courier channel when they commit; a
//! forwarding task turns each notification into a worker wake so the
//! relay picks fresh events up without waiting out the poll interval.
//! The path is opportunistic: a missed notification only costs one poll
//! interval of latency.

use std::sync::Arc;
use std::time::Duration;

use courier_core::OutboxError;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::warn;

use crate::NOTIFY_CHANNEL;

pub struct OutboxListener {
    listener: PgListener,
}

impl OutboxListener {
    /// Connect a dedicated listener session on the pool's database and
    /// subscribe to the courier channel.
    pub async fn connect(pool: &PgPool) -> Result<Self, OutboxError> {
        let mut listener = PgListener::connect_with(pool)
            .await
            .map_err(OutboxError::database)?;
        listener.listen(NOTIFY_CHANNEL).await.map_err(OutboxError::database)?;
        Ok(Self { listener })
    }

    /// Forward every notification into `wake`, typically the worker's
    /// [`courier_core::RelayWorker::wake_handle`]. Payloads are ignored.
    ///
    /// Runs until the task is dropped. Connection errors are logged and
    /// followed by a short pause; `PgListener` reconnects internally on
    /// the next receive.
    pub async fn forward(mut self, wake: Arc<Notify>) {
        loop {
            match self.listener.recv().await {
                Ok(_) => wake.notify_one(),
                Err(err) => {
                    warn!(error = %err, "outbox listener connection lost, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
