pub mod claim;
pub mod config;
pub mod consumer_group;
pub mod error;
pub mod facade;
pub mod handler;
pub mod kafka_client;
pub mod producer;
pub mod security;
pub mod session;
pub mod types;
pub mod waiter;

// Used in "mod tests" and the tests/ directory (integration tests)
pub mod test_utils;

pub use claim::{ClaimEnd, ClaimProcessor};
pub use config::KafkaConfig;
pub use consumer_group::{ConsumerGroup, GroupClient};
pub use error::{ClaimError, ConfigError, ConsumeError, Error, ProduceError};
pub use facade::KafkaFacade;
pub use handler::{CommitHandler, DeferredCommit, MessageHandler};
pub use producer::SyncProducer;
pub use types::{AckLevel, Outcome, Partition, Record};
pub use waiter::Waiter;
