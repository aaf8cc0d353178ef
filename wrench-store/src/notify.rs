use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use wrench_core::notify::{EventPublisher, Notifier};
use wrench_shared::models::events::NotificationRequested;
use wrench_shared::pii::masked;

/// Hands notifications to the email worker over the event bus. The worker
/// owns templates and delivery; a publish failure is reported as `false`.
pub struct EventNotifier {
    publisher: Arc<dyn EventPublisher>,
    topic: String,
}

impl EventNotifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, topic: impl Into<String>) -> Self {
        Self { publisher, topic: topic.into() }
    }
}

#[async_trait]
impl Notifier for EventNotifier {
    async fn send(&self, recipient: &str, template: &str, data: &Value) -> bool {
        let request = NotificationRequested {
            recipient: recipient.to_string(),
            template: template.to_string(),
            data: data.clone(),
            requested_at: chrono::Utc::now().timestamp(),
        };

        let payload = match serde_json::to_string(&request) {
            Ok(p) => p,
            Err(e) => {
                warn!("Could not encode notification '{}': {}", template, e);
                return false;
            }
        };

        match self.publisher.publish(&self.topic, recipient, &payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Notification '{}' to {} not queued: {}", template, masked(recipient), e);
                false
            }
        }
    }
}
