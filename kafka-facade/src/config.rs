use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Comma-separated broker list

    pub kafka_sasl_username: Option<String>,
    pub kafka_sasl_password: Option<String>,

    pub kafka_scram_mechanism: Option<String>, // SHA256 | SHA512, unset for PLAIN

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    pub kafka_tls_root_ca_path: Option<String>,

    // Only for brokers with self-signed certificates and no CA bundle to hand
    #[envconfig(default = "false")]
    pub kafka_tls_skip_verify: bool,

    #[envconfig(default = "1000")]
    pub kafka_consume_retry_interval_ms: u64, // Pause between consume sessions

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds
}

impl KafkaConfig {
    /// Plaintext config pointing at the given brokers, everything else defaulted.
    pub fn with_hosts(kafka_hosts: impl Into<String>) -> Self {
        Self {
            kafka_hosts: kafka_hosts.into(),
            kafka_sasl_username: None,
            kafka_sasl_password: None,
            kafka_scram_mechanism: None,
            kafka_tls: false,
            kafka_tls_root_ca_path: None,
            kafka_tls_skip_verify: false,
            kafka_consume_retry_interval_ms: 1000,
            kafka_message_timeout_ms: 20000,
        }
    }

    pub fn sasl_username(&self) -> Option<&str> {
        self.kafka_sasl_username
            .as_deref()
            .filter(|username| !username.is_empty())
    }

    pub fn consume_retry_interval(&self) -> Duration {
        Duration::from_millis(self.kafka_consume_retry_interval_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.kafka_message_timeout_ms))
    }
}

impl std::fmt::Debug for KafkaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaConfig")
            .field("kafka_hosts", &self.kafka_hosts)
            .field("kafka_sasl_username", &self.kafka_sasl_username)
            .field(
                "kafka_sasl_password",
                &self.kafka_sasl_password.as_ref().map(|_| "<redacted>"),
            )
            .field("kafka_scram_mechanism", &self.kafka_scram_mechanism)
            .field("kafka_tls", &self.kafka_tls)
            .field("kafka_tls_root_ca_path", &self.kafka_tls_root_ca_path)
            .field("kafka_tls_skip_verify", &self.kafka_tls_skip_verify)
            .field(
                "kafka_consume_retry_interval_ms",
                &self.kafka_consume_retry_interval_ms,
            )
            .field("kafka_message_timeout_ms", &self.kafka_message_timeout_ms)
            .finish()
    }
}

/// Settings for the `kafka-facade` consumer binary.
#[derive(Envconfig, Clone, Debug)]
pub struct RunnerConfig {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "kafka-facade")]
    pub kafka_client_id: String,

    #[envconfig(default = "kafka-facade")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "events")]
    pub kafka_consumer_topic: String, // Comma-separated topic list

    // Start from the newest offset when the group has nothing committed yet
    #[envconfig(default = "false")]
    pub kafka_skip_unread: bool,

    #[envconfig(default = "0")]
    pub kafka_commit_interval_ms: u64, // 0 disables deferred commits
}

impl RunnerConfig {
    pub fn topics(&self) -> Vec<&str> {
        self.kafka_consumer_topic
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .collect()
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.kafka_commit_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_from_empty_environment() {
        let config = KafkaConfig::init_from_hashmap(&HashMap::new()).unwrap();
        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert!(!config.kafka_tls);
        assert!(!config.kafka_tls_skip_verify);
        assert_eq!(config.sasl_username(), None);
        assert_eq!(config.consume_retry_interval(), Duration::from_secs(1));
        assert_eq!(config.message_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn debug_redacts_password() {
        let mut config = KafkaConfig::with_hosts("broker:9092");
        config.kafka_sasl_username = Some("user".to_string());
        config.kafka_sasl_password = Some("hunter2".to_string());

        let rendered = format!("{:?}", config);
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn empty_username_disables_sasl() {
        let mut config = KafkaConfig::with_hosts("broker:9092");
        config.kafka_sasl_username = Some(String::new());
        assert_eq!(config.sasl_username(), None);
    }

    #[test]
    fn runner_topics_are_split() {
        let env = HashMap::from([(
            "KAFKA_CONSUMER_TOPIC".to_string(),
            "events, clicks,,".to_string(),
        )]);
        let config = RunnerConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(config.topics(), vec!["events", "clicks"]);
        assert_eq!(config.commit_interval(), Duration::ZERO);
        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
    }
}
