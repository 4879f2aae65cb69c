//! Read-only health and metrics surface over the event store.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::HealthThresholds;
use crate::limiter::utilization_pct;
use crate::repository::OutboxRepository;

/// Gauge snapshot over the outbox table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OutboxGauges {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead_letter: i64,
    pub oldest_pending_age_seconds: i64,
    pub backlog_utilization_pct: f64,
}

/// Coarse health verdict, combined worst-of across sub-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

/// One named sub-check and its verdict.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: &'static str,
    pub status: HealthStatus,
    pub detail: String,
}

/// Full health report: overall worst-of status, the individual checks,
/// and the gauge snapshot they were derived from (absent when the
/// database itself was unreachable).
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub gauges: Option<OutboxGauges>,
}

/// Aggregates outbox gauges and derives a coarse health status.
///
/// All reads go through the repository port; the monitor itself holds no
/// state and is safe to call from a probe endpoint at any frequency the
/// database tolerates.
pub struct HealthMonitor {
    repository: Arc<dyn OutboxRepository>,
    thresholds: HealthThresholds,
    max_backlog_size: i64,
}

impl HealthMonitor {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        thresholds: HealthThresholds,
        max_backlog_size: i64,
    ) -> Self {
        Self { repository, thresholds, max_backlog_size }
    }

    /// Snapshot the gauges. Errors propagate so probes can distinguish an
    /// unreachable database from an unhealthy backlog.
    pub async fn gauges(&self) -> Result<OutboxGauges, crate::OutboxError> {
        let pending = self.repository.pending_count().await?;
        let processing = self.repository.processing_count().await?;
        let completed = self.repository.completed_count().await?;
        let dead_letter = self.repository.dead_letter_count().await?;
        let oldest_pending_age_seconds = self.repository.oldest_pending_age_seconds().await?;
        Ok(OutboxGauges {
            pending,
            processing,
            completed,
            dead_letter,
            oldest_pending_age_seconds,
            backlog_utilization_pct: utilization_pct(pending, self.max_backlog_size),
        })
    }

    /// Run every sub-check and combine worst-of.
    pub async fn check(&self) -> HealthReport {
        let gauges = match self.gauges().await {
            Ok(gauges) => gauges,
            Err(err) => {
                // Nothing else is observable without the database.
                return HealthReport {
                    status: HealthStatus::Unhealthy,
                    checks: vec![HealthCheck {
                        name: "database",
                        status: HealthStatus::Unhealthy,
                        detail: format!("unreachable: {err}"),
                    }],
                    gauges: None,
                };
            }
        };

        let mut checks = vec![HealthCheck {
            name: "database",
            status: HealthStatus::Healthy,
            detail: "reachable".into(),
        }];

        let backlog = grade(
            gauges.backlog_utilization_pct,
            self.thresholds.backlog_degraded_pct,
            self.thresholds.backlog_unhealthy_pct,
        );
        checks.push(HealthCheck {
            name: "backlog",
            status: backlog,
            detail: format!(
                "{} pending, {:.1}% of limit {}",
                gauges.pending, gauges.backlog_utilization_pct, self.max_backlog_size
            ),
        });

        let dead_letter = grade(
            gauges.dead_letter as f64,
            self.thresholds.dead_letter_degraded as f64,
            self.thresholds.dead_letter_unhealthy as f64,
        );
        checks.push(HealthCheck {
            name: "dead_letter",
            status: dead_letter,
            detail: format!("{} dead-lettered", gauges.dead_letter),
        });

        let age = grade(
            gauges.oldest_pending_age_seconds as f64,
            self.thresholds.oldest_pending_degraded.as_secs() as f64,
            self.thresholds.oldest_pending_unhealthy.as_secs() as f64,
        );
        checks.push(HealthCheck {
            name: "oldest_pending",
            status: age,
            detail: format!("oldest pending is {}s old", gauges.oldest_pending_age_seconds),
        });

        let status = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.worst(check.status));
        HealthReport { status, checks, gauges: Some(gauges) }
    }
}

fn grade(value: f64, degraded_at: f64, unhealthy_at: f64) -> HealthStatus {
    if value >= unhealthy_at {
        HealthStatus::Unhealthy
    } else if value >= degraded_at {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}
