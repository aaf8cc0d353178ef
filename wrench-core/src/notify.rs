use async_trait::async_trait;
use serde_json::Value;

use crate::repository::StoreResult;

/// Outbound customer notifications. Delivery failures are reported as
/// `false` and never propagate.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, template: &str, data: &Value) -> bool;
}

/// Fire-and-forget domain event publishing.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> StoreResult<()>;
}

/// Notifier that only logs, for local runs without a mail pipeline.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient: &str, template: &str, _data: &Value) -> bool {
        tracing::info!(
            "Notification '{}' for {} (log only)",
            template,
            wrench_shared::pii::masked(recipient)
        );
        true
    }
}
