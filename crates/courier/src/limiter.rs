//! Ingress backpressure against unbounded pending growth.
//!
//! Producers consult the limiter before inserting. The check is advisory
//! by nature — the count can move between check and insert — which is why
//! the actions are policy (reject, warn, shed) rather than a hard gate.

use std::sync::Arc;

use tracing::warn;

use crate::config::{BacklogPolicy, OverflowAction};
use crate::error::OutboxError;
use crate::repository::OutboxRepository;

/// Admission verdict for one insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with the insert.
    Admitted,
    /// Backlog full under the `Drop` action: do not insert; the event was
    /// not enqueued.
    Shed,
}

pub struct BacklogLimiter {
    repository: Arc<dyn OutboxRepository>,
    policy: BacklogPolicy,
}

impl BacklogLimiter {
    pub fn new(repository: Arc<dyn OutboxRepository>, policy: BacklogPolicy) -> Self {
        Self { repository, policy }
    }

    /// Decide whether one more event may be inserted right now.
    pub async fn admit(&self) -> Result<Admission, OutboxError> {
        let pending = self.repository.pending_count().await?;
        if pending < self.policy.max_backlog_size {
            return Ok(Admission::Admitted);
        }
        match self.policy.action {
            OverflowAction::Reject => Err(OutboxError::BacklogExceeded {
                pending,
                max: self.policy.max_backlog_size,
            }),
            OverflowAction::Warn => {
                warn!(
                    pending,
                    max = self.policy.max_backlog_size,
                    "outbox backlog over limit, admitting anyway"
                );
                Ok(Admission::Admitted)
            }
            OverflowAction::Drop => {
                warn!(
                    pending,
                    max = self.policy.max_backlog_size,
                    "outbox backlog over limit, shedding event"
                );
                Ok(Admission::Shed)
            }
        }
    }

    /// Backlog utilization as a percentage of the configured limit.
    pub async fn utilization_pct(&self) -> Result<f64, OutboxError> {
        let pending = self.repository.pending_count().await?;
        Ok(utilization_pct(pending, self.policy.max_backlog_size))
    }

    pub fn policy(&self) -> &BacklogPolicy {
        &self.policy
    }
}

/// `100 * pending / max`, with a zero/negative limit reading as 0%.
pub fn utilization_pct(pending: i64, max: i64) -> f64 {
    if max <= 0 {
        return 0.0;
    }
    100.0 * pending as f64 / max as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utilization_math() {
        assert_eq!(utilization_pct(0, 100), 0.0);
        assert_eq!(utilization_pct(80, 100), 80.0);
        assert_eq!(utilization_pct(250, 100), 250.0);
        assert_eq!(utilization_pct(10, 0), 0.0);
    }
}
