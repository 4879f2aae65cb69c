//! Scripted publisher for relay tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::{OutboxEvent, PublishError, Publisher};
use uuid::Uuid;

/// Publisher that replays a queue of scripted outcomes and records every
/// call. Once the script runs dry the fallback outcome applies (success
/// unless overridden), so "fail twice then succeed" is a two-entry script
/// and "always fail" is an empty script with a failing fallback.
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<Result<(), PublishError>>>,
    fallback: Mutex<Result<(), PublishError>>,
    published: Mutex<Vec<Uuid>>,
    delay: Mutex<Option<Duration>>,
    healthy: AtomicBool,
}

impl Default for ScriptedPublisher {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(Ok(())),
            published: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            healthy: AtomicBool::new(true),
        }
    }
}

impl ScriptedPublisher {
    /// A publisher that always succeeds.
    pub fn always_ok() -> Self {
        Self::default()
    }

    /// A publisher that fails every call the same way.
    pub fn always_failing(error: PublishError) -> Self {
        let publisher = Self::default();
        *publisher.fallback.lock().unwrap() = Err(error);
        publisher
    }

    pub fn with_script(outcomes: Vec<Result<(), PublishError>>) -> Self {
        let publisher = Self::default();
        *publisher.script.lock().unwrap() = outcomes.into();
        publisher
    }

    /// Append one outcome to the script.
    pub fn push(&self, outcome: Result<(), PublishError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Make every publish take this long. Lets tests hold an event
    /// in-flight across heartbeat ticks or a lease expiry. The call is
    /// recorded before the delay, so `publish_count` reflects calls that
    /// have started, not just finished.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Tracking ids of every publish attempt, in call order.
    pub fn published(&self) -> Vec<Uuid> {
        self.published.lock().unwrap().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError> {
        self.published.lock().unwrap().push(event.tracking_id);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => self.fallback.lock().unwrap().clone(),
        }
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
