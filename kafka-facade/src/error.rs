use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failures while turning a [`KafkaConfig`](crate::config::KafkaConfig) into client settings.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read TLS root CA file {path}: {source}")]
    CaFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no topics given for consumer group {group}")]
    NoTopics { group: String },
}

/// Terminal outcome of a single partition claim.
#[derive(Error, Debug)]
pub enum ClaimError {
    /// The message handler rejected a record and no deferred commit is configured.
    #[error("fail_to_handle_message: {topic}/{partition} at offset {offset}")]
    FailToHandleMessage {
        topic: String,
        partition: i32,
        offset: i64,
    },
    #[error("claim session error: {0}")]
    Session(#[from] ConsumeError),
}

/// Errors surfaced by one `consume` call. These are transient: the lifecycle loop logs them
/// and re-enters `consume`.
#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("session error: {0}")]
    Session(String),
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("topic_has_not_set")]
    TopicNotSet,
    #[error(transparent)]
    Kafka(#[from] KafkaError),
}

/// Errors returned from the facade constructors and consumer group handle.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to kafka: {0}")]
    Connection(#[from] KafkaError),
    #[error("consumer group has stopped")]
    GroupStopped,
    #[error("kafka client task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
