use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::timeout;

use crate::broker::{AckHandle, BrokerError, Producer, TopicSpec};
use crate::config::Config;
use crate::error::Result;
use crate::model::ProbeResult;

/// Publishes site check results to the status topic, keyed by site URL.
pub struct Publisher<P> {
    producer: P,
    topic: TopicSpec,
    delivery_timeout: Duration,
}

impl<P: Producer> Publisher<P> {
    pub fn new(producer: P, config: &Config) -> Self {
        Self::with_topic(
            producer,
            TopicSpec {
                name: config.kafka_topic.clone(),
                partitions: config.kafka_partitions,
                replication: config.kafka_replication,
            },
            config.delivery_timeout(),
        )
    }

    pub fn with_topic(producer: P, topic: TopicSpec, delivery_timeout: Duration) -> Self {
        Self {
            producer,
            topic,
            delivery_timeout,
        }
    }

    pub fn topic(&self) -> &TopicSpec {
        &self.topic
    }

    /// Creates the topic unless it already exists. Any other failure is
    /// returned; the caller cannot go on without its topic.
    pub async fn ensure_topic(&self) -> Result<()> {
        match self.producer.create_topic(&self.topic).await {
            Ok(()) => {
                info!(
                    "Created topic {} ({} partitions, replication {})",
                    self.topic.name, self.topic.partitions, self.topic.replication
                );
                Ok(())
            }
            Err(BrokerError::TopicAlreadyExists(name)) => {
                debug!("Topic {name} already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Hands the encoded result to the producer without waiting for delivery.
    pub fn publish(&self, result: &ProbeResult) -> Result<AckHandle> {
        let value = result.to_json()?;
        debug!("Sending status {value} to {}", self.topic.name);
        Ok(self.producer.send(&self.topic.name, result.url(), &value)?)
    }

    /// Publishes `result` and waits for the broker's acknowledgment.
    ///
    /// Returns `true` only if delivery was positively confirmed within the
    /// delivery timeout.
    pub async fn send_status(&self, result: &ProbeResult) -> bool {
        match self.publish(result) {
            Ok(ack) => await_delivery(ack, self.delivery_timeout).await,
            Err(err) => {
                error!("Failed to send status for {}: {err}", result.url());
                false
            }
        }
    }

    /// Flushes queued messages; called on every exit path of a producer run.
    pub async fn flush(&self) {
        if let Err(err) = self.producer.flush(self.delivery_timeout).await {
            warn!("Failed to flush producer: {err}");
        }
    }
}

/// Waits up to `grace` for an acknowledgment. No answer by the deadline
/// counts as a failed delivery.
pub async fn await_delivery(ack: AckHandle, grace: Duration) -> bool {
    match timeout(grace, ack).await {
        Ok(Ok(delivery)) => {
            debug!(
                "Message delivered to partition {} at offset {}",
                delivery.partition, delivery.offset
            );
            true
        }
        Ok(Err(err)) => {
            error!("Failed to deliver status: {err}");
            false
        }
        Err(_) => {
            error!("No delivery confirmation within {grace:?}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{AckMode, MemoryBroker, MemoryProducer};
    use crate::error::Error;

    fn publisher(broker: &MemoryBroker, grace: Duration) -> Publisher<MemoryProducer> {
        Publisher::with_topic(
            broker.producer(),
            TopicSpec {
                name: "checksite".to_string(),
                partitions: 3,
                replication: 1,
            },
            grace,
        )
    }

    fn result() -> ProbeResult {
        ProbeResult::network_error("http://example.test/", 42, "connection refused")
    }

    #[tokio::test]
    async fn test_ensure_topic_is_idempotent() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, Duration::from_secs(1));

        publisher.ensure_topic().await.unwrap();
        publisher.ensure_topic().await.unwrap();
        assert_eq!(broker.partition_count("checksite"), Some(3));
    }

    #[tokio::test]
    async fn test_ensure_topic_propagates_other_errors() {
        let broker = MemoryBroker::new();
        broker.fail_topic_creation(BrokerError::Client("broker down".to_string()));
        let publisher = publisher(&broker, Duration::from_secs(1));

        assert!(matches!(
            publisher.ensure_topic().await,
            Err(Error::Broker(BrokerError::Client(_)))
        ));
    }

    #[tokio::test]
    async fn test_send_status_confirmed() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, Duration::from_secs(1));
        publisher.ensure_topic().await.unwrap();

        assert!(publisher.send_status(&result()).await);

        let messages = broker.messages("checksite");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key.as_deref(), Some(&b"http://example.test/"[..]));
        let decoded = ProbeResult::from_json(messages[0].payload.as_deref().unwrap()).unwrap();
        assert_eq!(decoded, result());
    }

    #[tokio::test]
    async fn test_send_status_rejected() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, Duration::from_secs(1));
        publisher.ensure_topic().await.unwrap();
        broker.set_ack_mode(AckMode::Fail("message too large".to_string()));

        assert!(!publisher.send_status(&result()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_status_without_ack_fails_after_grace_period() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, Duration::from_secs(15));
        publisher.ensure_topic().await.unwrap();
        broker.set_ack_mode(AckMode::Withhold);

        let started = tokio::time::Instant::now();
        assert!(!publisher.send_status(&result()).await);
        assert!(started.elapsed() >= Duration::from_secs(15));
        // the message itself was queued, only the confirmation is missing
        assert_eq!(broker.messages("checksite").len(), 1);
    }

    #[tokio::test]
    async fn test_send_status_to_missing_topic_fails() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker, Duration::from_secs(1));

        assert!(!publisher.send_status(&result()).await);
    }
}
