//! In-memory outbox repository.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courier_core::{
    truncate_error, DeadLetterStats, EventStatus, NewEvent, OutboxError, OutboxEvent,
    OutboxRepository, RecentPage, RecentQuery,
};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    next_id: i64,
    rows: Vec<OutboxEvent>,
}

/// Mutex-guarded table of events implementing the whole repository port.
///
/// Every operation takes the lock once and mutates synchronously, which
/// makes each call atomic exactly the way a single SQL statement is.
#[derive(Default)]
pub struct InMemoryOutboxRepository {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a database outage: every port call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Force an event's lease deadline into the past, as if the holder
    /// died and real time elapsed. Test hook; no SQL counterpart.
    pub fn expire_lease(&self, id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.rows.iter_mut().find(|r| r.id == id) {
            row.locked_until = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    /// Clear an event's backoff delay so it is claimable immediately.
    /// Test hook; no SQL counterpart.
    pub fn clear_visibility(&self, id: i64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(row) = inner.rows.iter_mut().find(|r| r.id == id) {
            row.visible_at = None;
        }
    }

    /// Synchronous row snapshot for assertions.
    pub fn get(&self, id: i64) -> Option<OutboxEvent> {
        self.inner.lock().unwrap().rows.iter().find(|r| r.id == id).cloned()
    }

    fn guard(&self) -> Result<(), OutboxError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OutboxError::Database(anyhow::anyhow!("simulated database outage")));
        }
        Ok(())
    }
}

fn count_status(inner: &Inner, status: EventStatus) -> i64 {
    inner.rows.iter().filter(|r| r.status == status).count() as i64
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn insert(&self, event: NewEvent) -> Result<OutboxEvent, OutboxError> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap();
        if inner.rows.iter().any(|r| r.tracking_id == event.tracking_id) {
            return Err(OutboxError::DuplicateTrackingId(event.tracking_id));
        }
        inner.next_id += 1;
        let row = OutboxEvent {
            id: inner.next_id,
            tracking_id: event.tracking_id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            event_type: event.event_type,
            payload: event.payload,
            metadata: event.metadata,
            status: EventStatus::Pending,
            retry_count: 0,
            max_retries: event.max_retries,
            created_at: Utc::now(),
            processed_at: None,
            visible_at: None,
            locked_until: None,
            lock_token: None,
            last_error: None,
        };
        inner.rows.push(row.clone());
        Ok(row)
    }

    async fn claim_batch(
        &self,
        batch_size: usize,
        lease: Duration,
        lock_token: i64,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        self.guard()?;
        let now = Utc::now();
        let deadline = now + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let mut inner = self.inner.lock().unwrap();

        let mut eligible: Vec<usize> = inner
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.status.is_claimable()
                    && r.visible_at.map_or(true, |v| v <= now)
                    && r.locked_until.map_or(true, |l| l < now)
            })
            .map(|(i, _)| i)
            .collect();
        eligible.sort_by_key(|&i| (inner.rows[i].created_at, inner.rows[i].id));
        eligible.truncate(batch_size);

        let mut claimed = Vec::with_capacity(eligible.len());
        for i in eligible {
            let row = &mut inner.rows[i];
            row.status = EventStatus::Processing;
            row.lock_token = Some(lock_token);
            row.locked_until = Some(deadline);
            claimed.push(row.clone());
        }
        Ok(claimed)
    }

    async fn renew_lease(
        &self,
        id: i64,
        lock_token: i64,
        lease: Duration,
    ) -> Result<bool, OutboxError> {
        self.guard()?;
        let deadline =
            Utc::now() + chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::zero());
        let mut inner = self.inner.lock().unwrap();
        match inner.rows.iter_mut().find(|r| {
            r.id == id && r.lock_token == Some(lock_token) && r.status == EventStatus::Processing
        }) {
            Some(row) => {
                row.locked_until = Some(deadline);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_completed(&self, id: i64, lock_token: i64) -> Result<bool, OutboxError> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap();
        match inner
            .rows
            .iter_mut()
            .find(|r| r.id == id && r.lock_token == Some(lock_token))
        {
            Some(row) => {
                row.status = EventStatus::Completed;
                row.processed_at = Some(Utc::now());
                row.locked_until = None;
                row.lock_token = None;
                row.visible_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_failed(
        &self,
        id: i64,
        lock_token: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<bool, OutboxError> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap();
        match inner
            .rows
            .iter_mut()
            .find(|r| r.id == id && r.lock_token == Some(lock_token))
        {
            Some(row) => {
                row.status = EventStatus::Failed;
                row.retry_count += 1;
                row.last_error = Some(truncate_error(error));
                row.visible_at = retry_at;
                row.locked_until = None;
                row.lock_token = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_dead_letter(
        &self,
        id: i64,
        lock_token: i64,
        error: &str,
    ) -> Result<bool, OutboxError> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap();
        match inner
            .rows
            .iter_mut()
            .find(|r| r.id == id && r.lock_token == Some(lock_token))
        {
            Some(row) => {
                row.status = EventStatus::DeadLetter;
                row.retry_count += 1;
                row.last_error = Some(truncate_error(error));
                row.processed_at = Some(Utc::now());
                row.locked_until = None;
                row.lock_token = None;
                row.visible_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recover_stale(&self) -> Result<u64, OutboxError> {
        self.guard()?;
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();
        let mut recovered = 0;
        for row in inner.rows.iter_mut() {
            if row.status == EventStatus::Processing
                && row.locked_until.map_or(false, |l| l < now)
            {
                row.status = EventStatus::Pending;
                row.locked_until = None;
                row.lock_token = None;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn redrive_by_event_type(&self, event_type: &str) -> Result<u64, OutboxError> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap();
        let mut redriven = 0;
        for row in inner.rows.iter_mut() {
            if row.status == EventStatus::DeadLetter && row.event_type == event_type {
                redrive(row);
                redriven += 1;
            }
        }
        Ok(redriven)
    }

    async fn redrive_by_id(&self, id: i64) -> Result<bool, OutboxError> {
        self.guard()?;
        let mut inner = self.inner.lock().unwrap();
        match inner
            .rows
            .iter_mut()
            .find(|r| r.id == id && r.status == EventStatus::DeadLetter)
        {
            Some(row) => {
                redrive(row);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn pending_count(&self) -> Result<i64, OutboxError> {
        self.guard()?;
        Ok(count_status(&self.inner.lock().unwrap(), EventStatus::Pending))
    }

    async fn processing_count(&self) -> Result<i64, OutboxError> {
        self.guard()?;
        Ok(count_status(&self.inner.lock().unwrap(), EventStatus::Processing))
    }

    async fn completed_count(&self) -> Result<i64, OutboxError> {
        self.guard()?;
        Ok(count_status(&self.inner.lock().unwrap(), EventStatus::Completed))
    }

    async fn dead_letter_count(&self) -> Result<i64, OutboxError> {
        self.guard()?;
        Ok(count_status(&self.inner.lock().unwrap(), EventStatus::DeadLetter))
    }

    async fn oldest_pending_age_seconds(&self) -> Result<i64, OutboxError> {
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        let oldest = inner
            .rows
            .iter()
            .filter(|r| r.status == EventStatus::Pending)
            .map(|r| r.created_at)
            .min();
        Ok(oldest.map_or(0, |t| (Utc::now() - t).num_seconds().max(0)))
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<OutboxEvent>, OutboxError> {
        self.guard()?;
        Ok(self.inner.lock().unwrap().rows.iter().find(|r| r.id == id).cloned())
    }

    async fn find_by_tracking_id(
        &self,
        tracking_id: Uuid,
    ) -> Result<Option<OutboxEvent>, OutboxError> {
        self.guard()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .rows
            .iter()
            .find(|r| r.tracking_id == tracking_id)
            .cloned())
    }

    async fn find_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, OutboxError> {
        self.guard()?;
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<OutboxEvent> =
            inner.rows.iter().filter(|r| r.status == status).cloned().collect();
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows.truncate(limit);
        Ok(rows)
    }

    async fn find_recent(&self, query: RecentQuery) -> Result<RecentPage, OutboxError> {
        self.guard()?;
        let inner = self.inner.lock().unwrap();

        if let Some(after) = query.after {
            // Ascending from the cursor, one extra row to detect more,
            // reversed into the descending output order.
            let mut rows: Vec<OutboxEvent> =
                inner.rows.iter().filter(|r| r.id > after).cloned().collect();
            rows.sort_by_key(|r| r.id);
            let has_more = rows.len() > query.limit;
            rows.truncate(query.limit);
            rows.reverse();
            return Ok(RecentPage { events: rows, has_more });
        }

        let mut rows: Vec<OutboxEvent> = inner
            .rows
            .iter()
            .filter(|r| query.before.map_or(true, |before| r.id < before))
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.id));
        let has_more = rows.len() > query.limit;
        rows.truncate(query.limit);
        Ok(RecentPage { events: rows, has_more })
    }

    async fn dead_letter_stats(&self) -> Result<Vec<DeadLetterStats>, OutboxError> {
        self.guard()?;
        let now = Utc::now();
        let inner = self.inner.lock().unwrap();

        let mut by_type: Vec<(&str, Vec<&OutboxEvent>)> = Vec::new();
        for row in inner.rows.iter().filter(|r| r.status == EventStatus::DeadLetter) {
            match by_type.iter_mut().find(|(t, _)| *t == row.event_type) {
                Some((_, rows)) => rows.push(row),
                None => by_type.push((row.event_type.as_str(), vec![row])),
            }
        }

        let mut stats: Vec<DeadLetterStats> = by_type
            .into_iter()
            .map(|(event_type, rows)| {
                let oldest = rows.iter().map(|r| r.created_at).min().unwrap_or(now);
                let newest = rows.iter().map(|r| r.created_at).max().unwrap_or(now);
                let mut sample_errors: Vec<String> = Vec::new();
                for row in &rows {
                    if let Some(error) = &row.last_error {
                        let sample = truncate_error(error);
                        if !sample_errors.contains(&sample) {
                            sample_errors.push(sample);
                            if sample_errors.len() == 3 {
                                break;
                            }
                        }
                    }
                }
                DeadLetterStats {
                    event_type: event_type.to_string(),
                    count: rows.len() as i64,
                    oldest_age_seconds: (now - oldest).num_seconds().max(0),
                    newest_age_seconds: (now - newest).num_seconds().max(0),
                    sample_errors,
                }
            })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.event_type.cmp(&b.event_type)));
        Ok(stats)
    }
}

fn redrive(row: &mut OutboxEvent) {
    row.status = EventStatus::Pending;
    row.retry_count = 0;
    row.last_error = None;
    row.processed_at = None;
    row.visible_at = None;
    row.locked_until = None;
    row.lock_token = None;
}
