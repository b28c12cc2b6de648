use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::KafkaConfig;
use crate::consumer_group::ConsumerGroup;
use crate::error::{ConfigError, Error};
use crate::handler::{DeferredCommit, MessageHandler};
use crate::kafka_client::KafkaGroupClient;
use crate::producer::SyncProducer;
use crate::security::client_config;
use crate::types::AckLevel;
use crate::waiter::Waiter;

/// Entry point: opens consumer groups and producers against one set of brokers.
pub struct KafkaFacade {
    config: KafkaConfig,
    waiter: Waiter,
    shutdown: CancellationToken,
}

impl KafkaFacade {
    /// Returns the facade together with the [`Waiter`] that tracks every consumer group it
    /// starts.
    pub fn new(config: KafkaConfig) -> (Self, Waiter) {
        info!(config = ?config, "Kafka facade configured");

        let waiter = Waiter::new();
        let facade = Self {
            config,
            waiter: waiter.clone(),
            shutdown: CancellationToken::new(),
        };
        (facade, waiter)
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Join `group` and start consuming `topics` in the background.
    ///
    /// With `skip_unread`, partitions without a committed offset start at the newest
    /// record instead of the oldest.
    pub async fn new_consumer_group<H>(
        &self,
        client_id: &str,
        group: &str,
        topics: &[&str],
        handler: H,
        deferred: Option<DeferredCommit>,
        skip_unread: bool,
    ) -> Result<ConsumerGroup, Error>
    where
        H: MessageHandler + 'static,
    {
        if topics.is_empty() {
            return Err(ConfigError::NoTopics {
                group: group.to_string(),
            }
            .into());
        }

        let client_config = client_config(&self.config, client_id)?;
        let client = KafkaGroupClient::connect(client_config, group, topics, skip_unread).await?;

        Ok(ConsumerGroup::start(
            group,
            client,
            Arc::new(handler),
            deferred,
            self.config.consume_retry_interval(),
            &self.waiter,
            &self.shutdown,
        ))
    }

    /// `topic` is the default for [`SyncProducer::send`]; without it only
    /// [`SyncProducer::send_topic`] works.
    pub async fn new_sync_producer(
        &self,
        client_id: &str,
        topic: Option<&str>,
        ack: AckLevel,
    ) -> Result<SyncProducer, Error> {
        let client_config = client_config(&self.config, client_id)?;
        let producer = SyncProducer::new(
            client_config,
            topic.map(str::to_string),
            ack,
            self.config.message_timeout(),
        )
        .await?;
        Ok(producer)
    }

    /// Stop every consumer group started by this facade.
    pub fn shutdown(&self) {
        info!("Shutting down all consumer groups");
        self.shutdown.cancel();
    }

    /// Resolves once every consumer group started by this facade has stopped.
    pub async fn wait(&self) {
        self.waiter.wait().await;
    }
}
