//! Relay configuration.

use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::error::OutboxError;

/// Options for one relay worker process.
///
/// Cadence constraints are enforced by [`RelayConfig::validate`] at worker
/// construction: a heartbeat slower than a third of the lease risks losing
/// the lease between renewals, and a reaper slower than half the lease
/// cannot recover abandoned events within one lease duration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Max rows claimed per iteration.
    pub batch_size: usize,

    /// Sleep between empty polls. A notify wake shortens it.
    pub poll_interval: Duration,

    /// Max events processed in parallel within a claimed batch. Values
    /// above 1 trade ordering for throughput; the worker logs a startup
    /// warning.
    pub concurrency: usize,

    /// Initial and renewal lease duration.
    pub lease: Duration,

    /// Lease renewal cadence. Must satisfy `heartbeat_interval <= lease / 3`.
    pub heartbeat_interval: Duration,

    /// Default retry cap for events inserted without an explicit one.
    pub max_retries: i32,

    pub retry_policy: RetryPolicy,

    /// Run the reaper inside this worker process.
    pub reaper_enabled: bool,

    /// Must satisfy `reaper_interval <= lease / 2`.
    pub reaper_interval: Duration,

    /// How long shutdown waits for in-flight events before abandoning
    /// them to the reaper. Must not exceed the lease.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            poll_interval: Duration::from_secs(1),
            concurrency: 1,
            lease: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
            max_retries: 5,
            retry_policy: RetryPolicy::default(),
            reaper_enabled: true,
            reaper_interval: Duration::from_secs(15),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), OutboxError> {
        if self.batch_size == 0 {
            return Err(OutboxError::InvalidConfig("batch_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(OutboxError::InvalidConfig("concurrency must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(OutboxError::InvalidConfig("poll_interval must be positive".into()));
        }
        if self.lease.is_zero() {
            return Err(OutboxError::InvalidConfig("lease must be positive".into()));
        }
        if self.max_retries < 0 {
            return Err(OutboxError::InvalidConfig("max_retries must be non-negative".into()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval * 3 > self.lease {
            return Err(OutboxError::InvalidConfig(format!(
                "heartbeat_interval {:?} must be positive and at most a third of lease {:?}",
                self.heartbeat_interval, self.lease
            )));
        }
        if self.reaper_enabled && (self.reaper_interval.is_zero() || self.reaper_interval * 2 > self.lease)
        {
            return Err(OutboxError::InvalidConfig(format!(
                "reaper_interval {:?} must be positive and at most half of lease {:?}",
                self.reaper_interval, self.lease
            )));
        }
        if self.shutdown_grace > self.lease {
            return Err(OutboxError::InvalidConfig(format!(
                "shutdown_grace {:?} must not exceed lease {:?}",
                self.shutdown_grace, self.lease
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_policy.jitter_factor) {
            return Err(OutboxError::InvalidConfig(format!(
                "jitter_factor {} must be within [0, 1]",
                self.retry_policy.jitter_factor
            )));
        }
        Ok(())
    }
}

/// What to do when a producer would push the pending backlog past the
/// configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowAction {
    /// Reject the insert with [`OutboxError::BacklogExceeded`].
    Reject,
    /// Log and admit anyway.
    Warn,
    /// Log and shed: the caller gets a not-enqueued signal and must skip
    /// the insert.
    Drop,
}

/// Ingress backpressure policy consumed by the backlog limiter.
#[derive(Debug, Clone, Copy)]
pub struct BacklogPolicy {
    pub max_backlog_size: i64,
    pub action: OverflowAction,
}

impl Default for BacklogPolicy {
    fn default() -> Self {
        Self { max_backlog_size: 100_000, action: OverflowAction::Warn }
    }
}

/// Thresholds for the health surface. Each pair is (degraded, unhealthy).
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    /// Backlog utilization percent at which the backlog check degrades.
    pub backlog_degraded_pct: f64,
    /// Backlog utilization percent at which it becomes unhealthy.
    pub backlog_unhealthy_pct: f64,
    pub dead_letter_degraded: i64,
    pub dead_letter_unhealthy: i64,
    pub oldest_pending_degraded: Duration,
    pub oldest_pending_unhealthy: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            backlog_degraded_pct: 80.0,
            backlog_unhealthy_pct: 100.0,
            dead_letter_degraded: 1,
            dead_letter_unhealthy: 100,
            oldest_pending_degraded: Duration::from_secs(60),
            oldest_pending_unhealthy: Duration::from_secs(600),
        }
    }
}
