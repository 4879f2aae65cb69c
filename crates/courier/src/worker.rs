//! The relay worker: claim → process (with heartbeat) → finalize.
//!
//! One worker owns one fencing token for its whole lifetime. Correctness
//! across workers and processes rests on the database's row locking and
//! that token, never on in-process synchronization; within the process the
//! semaphore only bounds parallelism.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::OutboxError;
use crate::event::{truncate_error, OutboxEvent};
use crate::publisher::Publisher;
use crate::reaper::Reaper;
use crate::repository::OutboxRepository;
use crate::token::next_lock_token;

/// Shared, immutable state of one worker; cloned into per-event tasks.
struct WorkerContext {
    repository: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn Publisher>,
    config: RelayConfig,
    lock_token: i64,
}

/// What happened to one in-flight event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventOutcome {
    Completed,
    Retried,
    DeadLettered,
    /// Lease lost, finalize rejected, or a repository error: the row is
    /// left for the reaper or a later claim. Not a success, not a failure.
    Abandoned,
}

#[derive(Debug, Default)]
struct BatchSummary {
    completed: u64,
    retried: u64,
    dead_lettered: u64,
    abandoned: u64,
}

impl BatchSummary {
    fn tally(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Completed => self.completed += 1,
            EventOutcome::Retried => self.retried += 1,
            EventOutcome::DeadLettered => self.dead_lettered += 1,
            EventOutcome::Abandoned => self.abandoned += 1,
        }
    }
}

/// Drives the relay loop for a single process.
pub struct RelayWorker {
    ctx: Arc<WorkerContext>,
    semaphore: Arc<Semaphore>,
    wake: Arc<Notify>,
}

impl RelayWorker {
    /// Validate the configuration and draw a fresh fencing token.
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn Publisher>,
        config: RelayConfig,
    ) -> Result<Self, OutboxError> {
        config.validate()?;
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Ok(Self {
            ctx: Arc::new(WorkerContext {
                repository,
                publisher,
                lock_token: next_lock_token(),
                config,
            }),
            semaphore,
            wake: Arc::new(Notify::new()),
        })
    }

    /// This worker's fencing token.
    pub fn lock_token(&self) -> i64 {
        self.ctx.lock_token
    }

    /// A handle that shortens the idle poll when notified. Wire it to a
    /// change-notification listener for the opportunistic fast path; the
    /// notification payload is ignored.
    pub fn wake_handle(&self) -> Arc<Notify> {
        self.wake.clone()
    }

    /// Spawn the relay loop (and the in-process reaper when enabled) and
    /// return a shutdown handle.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = self.ctx.config.reaper_enabled.then(|| {
            let reaper = Reaper::new(
                self.ctx.repository.clone(),
                self.ctx.config.reaper_interval,
            );
            tokio::spawn(reaper.run(shutdown_rx.clone()))
        });
        let worker = tokio::spawn(self.run(shutdown_rx));
        RelayHandle { shutdown: shutdown_tx, worker, reaper }
    }

    /// Run the claim loop until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.ctx.config;
        info!(
            lock_token = self.ctx.lock_token,
            batch_size = config.batch_size,
            concurrency = config.concurrency,
            lease_secs = config.lease.as_secs(),
            "relay worker starting"
        );
        if config.concurrency > 1 {
            warn!(
                concurrency = config.concurrency,
                "concurrency above 1: global event ordering is not preserved"
            );
        }

        loop {
            // A dropped sender counts as shutdown: the handle owning it
            // is gone, nobody can stop us otherwise.
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break;
            }
            let claim = self
                .ctx
                .repository
                .claim_batch(config.batch_size, config.lease, self.ctx.lock_token)
                .await;
            match claim {
                Ok(events) if events.is_empty() => self.idle_wait(&mut shutdown).await,
                Ok(events) => {
                    let full = events.len() == config.batch_size;
                    self.process_batch(events, &mut shutdown).await;
                    // A full batch means the table likely has more ready
                    // rows; re-enter without sleeping.
                    if !full {
                        self.idle_wait(&mut shutdown).await;
                    }
                }
                Err(err) => {
                    error!(error = %err, "claim failed, backing off one poll interval");
                    self.idle_wait(&mut shutdown).await;
                }
            }
        }
        info!(lock_token = self.ctx.lock_token, "relay worker stopped");
    }

    async fn idle_wait(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            _ = self.wake.notified() => {}
            _ = shutdown_signalled(shutdown) => {}
        }
    }

    /// Dispatch one claimed batch under the concurrency semaphore and
    /// wait for it, bounded by `shutdown_grace` once shutdown fires.
    async fn process_batch(&self, events: Vec<OutboxEvent>, shutdown: &mut watch::Receiver<bool>) {
        let claimed = events.len();
        let mut tasks: JoinSet<EventOutcome> = JoinSet::new();
        for event in events {
            if event.lock_token != Some(self.ctx.lock_token) {
                // Defensive: claim stamped our token, anything else means
                // the row is no longer ours.
                debug!(event_id = event.id, "claimed row carries a foreign lock token, dropping");
                continue;
            }
            let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                break;
            };
            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                ctx.process_event(event).await
            });
        }

        let summary = drain(tasks, shutdown, self.ctx.config.shutdown_grace).await;
        info!(
            claimed,
            completed = summary.completed,
            retried = summary.retried,
            dead_lettered = summary.dead_lettered,
            abandoned = summary.abandoned,
            "relay batch processed"
        );
    }
}

/// Await every in-flight task; once shutdown fires, keep waiting only up
/// to `grace`, then abort the rest and let the reaper recover their rows.
async fn drain(
    mut tasks: JoinSet<EventOutcome>,
    shutdown: &mut watch::Receiver<bool>,
    grace: Duration,
) -> BatchSummary {
    let mut summary = BatchSummary::default();
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok(outcome)) => summary.tally(outcome),
                Some(Err(_)) => summary.tally(EventOutcome::Abandoned),
                None => return summary,
            },
            _ = shutdown_signalled(shutdown) => break,
        }
    }

    // Shutdown in progress: bounded grace for the stragglers.
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            joined = tasks.join_next() => match joined {
                Some(Ok(outcome)) => summary.tally(outcome),
                Some(Err(_)) => summary.tally(EventOutcome::Abandoned),
                None => return summary,
            },
            _ = &mut deadline => {
                let abandoned = tasks.len() as u64;
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                summary.abandoned += abandoned;
                warn!(abandoned, "shutdown grace elapsed, abandoning in-flight events");
                return summary;
            }
        }
    }
}

impl WorkerContext {
    /// Heartbeat + publish + finalize for one event.
    async fn process_event(self: Arc<Self>, event: OutboxEvent) -> EventOutcome {
        let heartbeat = Heartbeat::start(
            self.repository.clone(),
            event.id,
            self.lock_token,
            self.config.heartbeat_interval,
            self.config.lease,
        );

        let published = self.publisher.publish(&event).await;

        // Immediate cancellation, not next-tick.
        let lease_lost = heartbeat.stop();
        if lease_lost {
            // The side effect may or may not have happened; the contract
            // is at-least-once and the consumer deduplicates.
            debug!(
                event_id = event.id,
                tracking_id = %event.tracking_id,
                "lease lost mid-flight, abandoning event"
            );
            return EventOutcome::Abandoned;
        }

        match published {
            Ok(()) => self.finalize_completed(&event).await,
            Err(err) => {
                let reason = truncate_error(err.reason());
                if err.is_permanent() || !event.has_retries_left() {
                    self.finalize_dead_letter(&event, &reason).await
                } else {
                    self.finalize_retry(&event, &reason).await
                }
            }
        }
    }

    async fn finalize_completed(&self, event: &OutboxEvent) -> EventOutcome {
        match self.repository.mark_completed(event.id, self.lock_token).await {
            Ok(true) => EventOutcome::Completed,
            Ok(false) => {
                debug!(event_id = event.id, "lease lost before completion mark, abandoning");
                EventOutcome::Abandoned
            }
            Err(err) => {
                error!(event_id = event.id, error = %err, "failed to mark event completed");
                EventOutcome::Abandoned
            }
        }
    }

    async fn finalize_retry(&self, event: &OutboxEvent, reason: &str) -> EventOutcome {
        let delay = self.config.retry_policy.delay(event.retry_count.max(0) as u32);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(30));
        match self
            .repository
            .mark_failed(event.id, self.lock_token, reason, Some(retry_at))
            .await
        {
            Ok(true) => EventOutcome::Retried,
            Ok(false) => {
                debug!(event_id = event.id, "lease lost before failure mark, abandoning");
                EventOutcome::Abandoned
            }
            Err(err) => {
                error!(event_id = event.id, error = %err, "failed to mark event failed");
                EventOutcome::Abandoned
            }
        }
    }

    async fn finalize_dead_letter(&self, event: &OutboxEvent, reason: &str) -> EventOutcome {
        match self
            .repository
            .mark_dead_letter(event.id, self.lock_token, reason)
            .await
        {
            Ok(true) => {
                error!(
                    event_id = event.id,
                    tracking_id = %event.tracking_id,
                    event_type = %event.event_type,
                    last_error = reason,
                    "event dead-lettered"
                );
                EventOutcome::DeadLettered
            }
            Ok(false) => {
                debug!(event_id = event.id, "lease lost before dead-letter mark, abandoning");
                EventOutcome::Abandoned
            }
            Err(err) => {
                error!(event_id = event.id, error = %err, "failed to mark event dead-lettered");
                EventOutcome::Abandoned
            }
        }
    }
}

/// Resolves once shutdown flips true, or once the sender is gone.
pub(crate) async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Per-event lease renewal task.
///
/// Ticks at the heartbeat interval while the publisher call is
/// outstanding; a rejected renewal flips the lost flag and ends the task.
/// Renewal errors are logged and skipped — the lease outlives a couple of
/// missed beats by construction (`heartbeat_interval <= lease / 3`).
struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    fn start(
        repository: Arc<dyn OutboxRepository>,
        event_id: i64,
        lock_token: i64,
        interval: Duration,
        lease: Duration,
    ) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let flag = lost.clone();
        let handle = tokio::spawn(async move {
            let first = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match repository.renew_lease(event_id, lock_token, lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Err(err) => {
                        warn!(event_id, error = %err, "heartbeat renewal errored, will retry");
                    }
                }
            }
        });
        Self { handle, lost }
    }

    /// Abort the renewal task immediately and report whether the lease
    /// was observed lost.
    fn stop(self) -> bool {
        self.handle.abort();
        self.lost.load(Ordering::SeqCst)
    }
}

/// Handle over a spawned worker (and its in-process reaper).
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    worker: tokio::task::JoinHandle<()>,
    reaper: Option<tokio::task::JoinHandle<()>>,
}

impl RelayHandle {
    /// Signal shutdown and wait for the loop (and reaper) to stop.
    ///
    /// In-flight events get the configured grace; anything slower is
    /// abandoned for the reaper.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.worker.await;
        if let Some(reaper) = self.reaper {
            let _ = reaper.await;
        }
    }
}
