use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error};
use wrench_core::notify::EventPublisher;
use wrench_core::repository::StoreResult;
use wrench_core::StoreError;
use wrench_shared::pii::masked;

use crate::app_config::KafkaConfig;

/// Kafka producer behind booking confirmations and notification requests.
///
/// Notification records are keyed by recipient email, so keys only reach
/// the log masked. Delivery failures surface as `Unavailable`; callers treat
/// a lost event as a warning, never as a failed booking.
#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
    queue_wait: Duration,
}

impl EventProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = producer_config(config).create()?;
        Ok(Self {
            producer,
            queue_wait: Duration::from_millis(config.queue_wait_ms),
        })
    }
}

/// A retried send must not write a second confirmation, hence idempotence.
pub(crate) fn producer_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.brokers)
        .set("client.id", &config.client_id)
        .set("message.timeout.ms", config.delivery_timeout_ms.to_string())
        .set("enable.idempotence", "true")
        .set("acks", "all");
    client
}

#[async_trait]
impl EventPublisher for EventProducer {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> StoreResult<()> {
        let record = FutureRecord::to(topic).key(key).payload(payload);

        match self.producer.send(record, Timeout::After(self.queue_wait)).await {
            Ok(delivery) => {
                debug!(
                    "Delivered {} record for {}: partition {} offset {}",
                    topic,
                    masked(key),
                    delivery.partition,
                    delivery.offset
                );
                Ok(())
            }
            Err((e, _record)) => {
                error!("Failed to deliver {} record for {}: {}", topic, masked(key), e);
                Err(StoreError::Unavailable(format!("{} delivery failed: {}", topic, e)))
            }
        }
    }
}
