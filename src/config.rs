use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub schema_registry: SchemaRegistryConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_groups")]
    pub groups: Vec<GroupConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchemaRegistryConfig {
    #[serde(default = "default_registry_url")]
    pub url: String,
    #[serde(default = "default_registry_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct CodecConfig {
    #[serde(default)]
    pub format: CodecFormat,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CodecFormat {
    #[default]
    Avro,
    Json,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublisherConfig {
    #[serde(default = "default_transactional_id")]
    pub transactional_id: String,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SubscriberConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub dead_letter_topic: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct GroupConfig {
    pub id: String,
    #[serde(default)]
    pub start: StartPolicy,
    #[serde(default)]
    pub isolation: IsolationLevel,
}

/// Where a group starts reading a partition it has no committed offset for.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StartPolicy {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    ReadUncommitted,
}

impl StartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartPolicy::Earliest => "earliest",
            StartPolicy::Latest => "latest",
        }
    }
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::ReadUncommitted => "read_uncommitted",
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("TXN_PUBSUB")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("broker.brokers"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), config::ConfigError> {
        if self.broker.brokers.is_empty() {
            return Err(config::ConfigError::Message(
                "broker.brokers must list at least one broker".to_string(),
            ));
        }
        if self.broker.topic.trim().is_empty() {
            return Err(config::ConfigError::Message(
                "broker.topic must not be empty".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(config::ConfigError::Message(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.groups.is_empty() {
            return Err(config::ConfigError::Message(
                "at least one consumer group is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for group in &self.groups {
            if group.id.trim().is_empty() {
                return Err(config::ConfigError::Message(
                    "group id must not be empty".to_string(),
                ));
            }
            if !seen.insert(group.id.as_str()) {
                return Err(config::ConfigError::Message(format!(
                    "duplicate consumer group '{}'",
                    group.id
                )));
            }
        }

        Ok(())
    }

    pub fn bootstrap_servers(&self) -> String {
        self.broker.brokers.join(",")
    }

    pub fn dead_letter_topic(&self) -> String {
        self.retry
            .dead_letter_topic
            .clone()
            .unwrap_or_else(|| format!("{}.dlq", self.broker.topic))
    }
}

impl PublisherConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl SubscriberConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl GroupConfig {
    pub fn new(id: impl Into<String>, start: StartPolicy) -> Self {
        Self {
            id: id.into(),
            start,
            isolation: IsolationLevel::ReadCommitted,
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            schema_registry: SchemaRegistryConfig::default(),
            codec: CodecConfig::default(),
            publisher: PublisherConfig::default(),
            subscriber: SubscriberConfig::default(),
            retry: RetryConfig::default(),
            groups: default_groups(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            topic: default_topic(),
        }
    }
}

impl Default for SchemaRegistryConfig {
    fn default() -> Self {
        Self {
            url: default_registry_url(),
            request_timeout_ms: default_registry_timeout_ms(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            transactional_id: default_transactional_id(),
            init_timeout_ms: default_init_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            acks: default_acks(),
            max_in_flight: default_max_in_flight(),
        }
    }
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
            error_backoff_ms: default_error_backoff_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            dead_letter_topic: None,
        }
    }
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_topic() -> String {
    "KafkaEstudo".to_string()
}

fn default_registry_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_registry_timeout_ms() -> u64 {
    10_000
}

fn default_transactional_id() -> String {
    "transacao-kafka-estudo".to_string()
}

fn default_init_timeout_ms() -> u64 {
    5_000
}

fn default_transaction_timeout_ms() -> u64 {
    30_000
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_max_in_flight() -> u32 {
    5
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_session_timeout_ms() -> u64 {
    6_000
}

fn default_max_consecutive_errors() -> u32 {
    3
}

fn default_error_backoff_ms() -> u64 {
    1_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_groups() -> Vec<GroupConfig> {
    vec![
        GroupConfig::new("grupo1", StartPolicy::Earliest),
        GroupConfig::new("grupo2", StartPolicy::Latest),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults_match_reference_setup() {
        let config = Config::default();
        assert_eq!(config.bootstrap_servers(), "localhost:9092");
        assert_eq!(config.broker.topic, "KafkaEstudo");
        assert_eq!(config.publisher.acks, "all");
        assert_eq!(config.publisher.max_in_flight, 5);
        assert_eq!(config.publisher.init_timeout(), Duration::from_secs(5));
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.groups[1].start, StartPolicy::Latest);
        assert_eq!(config.dead_letter_topic(), "KafkaEstudo.dlq");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[broker]
brokers = ["kafka-1:9092", "kafka-2:9092"]
topic = "courses"

[retry]
max_attempts = 5
dead_letter_topic = "courses-failed"

[[groups]]
id = "audit"
start = "earliest"
isolation = "read_uncommitted"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.bootstrap_servers(), "kafka-1:9092,kafka-2:9092");
        assert_eq!(config.broker.topic, "courses");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.dead_letter_topic(), "courses-failed");
        assert_eq!(
            config.groups,
            vec![GroupConfig::new("audit", StartPolicy::Earliest)
                .with_isolation(IsolationLevel::ReadUncommitted)]
        );
        // Untouched sections keep their defaults
        assert_eq!(config.schema_registry.url, "http://localhost:8081");
        assert_eq!(config.subscriber.max_consecutive_errors, 3);
    }

    #[test]
    fn test_validation_rejects_duplicate_groups() {
        let mut config = Config::default();
        config.groups.push(GroupConfig::new("grupo1", StartPolicy::Latest));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_file_is_a_config_error() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 0").unwrap();

        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, crate::Error::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
