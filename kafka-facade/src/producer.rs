use std::time::Duration;

use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::error::{Error, ProduceError};
use crate::types::AckLevel;

const METADATA_TIMEOUT: Duration = Duration::from_secs(15);

/// Sends one record at a time and waits for the broker acknowledgement configured at
/// construction.
pub struct SyncProducer {
    producer: FutureProducer,
    topic: Option<String>,
    message_timeout: Duration,
}

impl SyncProducer {
    pub async fn new(
        mut client_config: ClientConfig,
        topic: Option<String>,
        ack: AckLevel,
        message_timeout: Duration,
    ) -> Result<Self, Error> {
        client_config
            .set("acks", ack.as_config_value())
            .set("message.timeout.ms", message_timeout.as_millis().to_string());

        debug!("rdkafka producer configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        let ping = producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            ping.client()
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|metadata| metadata.topics().len())
        })
        .await?;
        match metadata {
            Ok(topics) => {
                info!("Successfully connected to Kafka brokers. Found {} topics.", topics);
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error.into());
            }
        }

        Ok(Self {
            producer,
            topic: topic.filter(|topic| !topic.is_empty()),
            message_timeout,
        })
    }

    /// Send to the default topic.
    pub async fn send(&self, key: &str, value: &[u8]) -> Result<(), ProduceError> {
        let Some(topic) = &self.topic else {
            return Err(ProduceError::TopicNotSet);
        };
        self.send_topic(topic, key, value).await
    }

    pub async fn send_topic(&self, topic: &str, key: &str, value: &[u8]) -> Result<(), ProduceError> {
        let record = FutureRecord::to(topic).key(key).payload(value);

        match self.producer.send(record, self.message_timeout).await {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                debug!(topic, error = %e, "Failed to produce record");
                Err(ProduceError::Kafka(e))
            }
        }
    }

    /// Flush anything still queued and release the client.
    pub fn stop(self) {
        if let Err(e) = self.producer.flush(self.message_timeout) {
            error!(error = %e, "Failed to flush producer on stop");
        }
    }
}

#[cfg(test)]
mod tests {
    use rdkafka::mocking::MockCluster;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};

    use super::*;
    use crate::config::KafkaConfig;
    use crate::security::client_config;

    async fn start_on_mocked_producer(
        topic: Option<&str>,
    ) -> (MockCluster<'static, rdkafka::producer::DefaultProducerContext>, SyncProducer) {
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig::with_hosts(cluster.bootstrap_servers());
        let producer = SyncProducer::new(
            client_config(&config, "producer-test").unwrap(),
            topic.map(str::to_string),
            AckLevel::WaitForAll,
            Duration::from_millis(500),
        )
        .await
        .expect("failed to create producer");
        (cluster, producer)
    }

    #[tokio::test]
    async fn send_without_default_topic_fails() {
        let (_cluster, producer) = start_on_mocked_producer(None).await;

        match producer.send("key", b"value").await {
            Err(ProduceError::TopicNotSet) => {}
            other => panic!("expected TopicNotSet, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_and_send_topic() {
        let (cluster, producer) = start_on_mocked_producer(Some("events")).await;

        // Wait for producer to be healthy, to keep the message timeout short and tests faster
        for _ in 0..20 {
            if producer.send("key", b"warmup").await.is_ok() {
                break;
            }
        }

        producer
            .send("key", b"value")
            .await
            .expect("failed to send to default topic");
        producer
            .send_topic("other", "key", b"value")
            .await
            .expect("failed to send to explicit topic");

        // Broker errors come back as-is
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match producer.send("key", b"value").await {
            Err(ProduceError::Kafka(_)) => {}
            other => panic!("expected kafka error, got {:?}", other),
        }

        producer.stop();
    }
}
