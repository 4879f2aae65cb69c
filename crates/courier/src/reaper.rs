//! Recovery of abandoned leases.
//!
//! A worker that dies mid-flight leaves its claimed rows in `Processing`
//! with an expiring lease. The reaper returns them to `Pending` once the
//! lease deadline elapses. Reaping is neither a success nor a failure of
//! the event, so `retry_count` is untouched.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, warn};

use crate::error::OutboxError;
use crate::repository::OutboxRepository;

pub struct Reaper {
    repository: Arc<dyn OutboxRepository>,
    interval: Duration,
}

impl Reaper {
    pub fn new(repository: Arc<dyn OutboxRepository>, interval: Duration) -> Self {
        Self { repository, interval }
    }

    /// One sweep: a single atomic recovery transaction.
    pub async fn sweep(&self) -> Result<u64, OutboxError> {
        let recovered = self.repository.recover_stale().await?;
        if recovered > 0 {
            warn!(recovered, "reaper returned expired leases to pending");
        }
        Ok(recovered)
    }

    /// Sweep every `interval` until `shutdown` flips to true (or its
    /// sender is gone).
    ///
    /// Sweep errors are logged and the loop continues; a flaky database
    /// must not kill recovery.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = crate::worker::shutdown_signalled(&mut shutdown) => return,
            }
            if let Err(err) = self.sweep().await {
                error!(error = %err, "reaper sweep failed");
            }
        }
    }
}
