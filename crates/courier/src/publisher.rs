//! The publisher port: the opaque capability the relay dispatches to.

use async_trait::async_trait;

use crate::error::PublishError;
use crate::event::OutboxEvent;

/// External destination for relayed events (broker, webhook, third-party
/// API). The relay treats it as `publish → success | transient | permanent`
/// and nothing more.
///
/// The contract is at-least-once: a publisher may see the same event twice
/// (worker crash after publish, lease loss mid-flight) and downstream
/// consumers deduplicate on `tracking_id`. Implementations should forward
/// `tracking_id` as an idempotency key where the destination supports one.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Deliver one event.
    ///
    /// `Transient` errors consume a retry; `Permanent` errors dead-letter
    /// the event immediately. Implementations that can't tell should
    /// return `Transient` and let the retry budget decide.
    async fn publish(&self, event: &OutboxEvent) -> Result<(), PublishError>;

    /// Cheap reachability probe for the health surface.
    async fn is_healthy(&self) -> bool {
        true
    }
}
