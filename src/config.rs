use crate::classifier::Region;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

const ENV_PREFIX: &str = "ORDER_ROUTER";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default)]
    pub create_missing_topics: bool,
    #[serde(default = "default_topic_partitions")]
    pub topic_partitions: i32,
    #[serde(default = "default_topic_replication_factor")]
    pub topic_replication_factor: i32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    #[serde(default = "default_input_topic")]
    pub input_topic: String,
    #[serde(default)]
    pub output_topics: OutputTopics,
}

/// Destination topic per region. Fixed for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OutputTopics {
    #[serde(default = "default_us_topic")]
    pub us: String,
    #[serde(default = "default_eu_topic")]
    pub eu: String,
    #[serde(default = "default_other_topic")]
    pub other: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_forward_retry_attempts")]
    pub forward_retry_attempts: u32,
    #[serde(default = "default_forward_retry_backoff_ms")]
    pub forward_retry_backoff_ms: u64,
    #[serde(default = "default_forward_retry_max_backoff_ms")]
    pub forward_retry_max_backoff_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Config {
    /// Load configuration from a file, overlaid with `ORDER_ROUTER__*`
    /// environment variables (e.g. `ORDER_ROUTER__KAFKA__GROUP_ID`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let builder = config::Config::builder().add_source(config::File::from(path.as_ref()));
        Self::build(builder)
    }

    /// Load configuration from defaults and environment variables only.
    pub fn from_env() -> Result<Self> {
        Self::build(config::Config::builder())
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.kafka.group_id.is_empty() {
            return Err(Error::Config("kafka.group_id must not be empty".to_string()));
        }
        if !matches!(self.kafka.acks.as_str(), "all" | "-1") {
            return Err(Error::Config(format!(
                "kafka.acks must be 'all' for durable forwarding, got '{}'",
                self.kafka.acks
            )));
        }
        if !matches!(self.kafka.auto_offset_reset.as_str(), "earliest" | "latest") {
            return Err(Error::Config(format!(
                "kafka.auto_offset_reset must be 'earliest' or 'latest', got '{}'",
                self.kafka.auto_offset_reset
            )));
        }
        if self.kafka.create_missing_topics
            && (self.kafka.topic_partitions < 1 || self.kafka.topic_replication_factor < 1)
        {
            return Err(Error::Config(
                "kafka.topic_partitions and kafka.topic_replication_factor must be positive"
                    .to_string(),
            ));
        }

        let input = &self.routing.input_topic;
        if input.is_empty() {
            return Err(Error::Config("routing.input_topic must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for region in Region::ALL {
            let topic = self.routing.output_topics.topic_for(region);
            if topic.is_empty() {
                return Err(Error::Config(format!(
                    "routing.output_topics.{} must not be empty",
                    region
                )));
            }
            if topic == input {
                return Err(Error::Config(format!(
                    "routing.output_topics.{} must differ from the input topic '{}'",
                    region, input
                )));
            }
            if !seen.insert(topic) {
                return Err(Error::Config(format!(
                    "routing.output_topics.{} reuses topic '{}'",
                    region, topic
                )));
            }
        }

        if self.pipeline.poll_timeout_ms == 0 {
            return Err(Error::Config("pipeline.poll_timeout_ms must be positive".to_string()));
        }
        if self.pipeline.drain_timeout_ms == 0 {
            return Err(Error::Config("pipeline.drain_timeout_ms must be positive".to_string()));
        }
        if self.pipeline.max_batch_size == 0 {
            return Err(Error::Config("pipeline.max_batch_size must be positive".to_string()));
        }
        if self.pipeline.forward_retry_attempts == 0 {
            return Err(Error::Config(
                "pipeline.forward_retry_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    pub fn brokers(&self) -> String {
        self.kafka.brokers.join(",")
    }
}

impl OutputTopics {
    pub fn topic_for(&self, region: Region) -> &str {
        match region {
            Region::Us => &self.us,
            Region::Eu => &self.eu,
            Region::Other => &self.other,
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.us, &self.eu, &self.other]
    }
}

impl KafkaConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

impl PipelineConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            routing: RoutingConfig::default(),
            pipeline: PipelineConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            acks: default_acks(),
            compression: default_compression(),
            message_timeout_ms: default_message_timeout_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            auto_offset_reset: default_auto_offset_reset(),
            startup_timeout_ms: default_startup_timeout_ms(),
            create_missing_topics: false,
            topic_partitions: default_topic_partitions(),
            topic_replication_factor: default_topic_replication_factor(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            input_topic: default_input_topic(),
            output_topics: OutputTopics::default(),
        }
    }
}

impl Default for OutputTopics {
    fn default() -> Self {
        Self {
            us: default_us_topic(),
            eu: default_eu_topic(),
            other: default_other_topic(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            max_batch_size: default_max_batch_size(),
            forward_retry_attempts: default_forward_retry_attempts(),
            forward_retry_backoff_ms: default_forward_retry_backoff_ms(),
            forward_retry_max_backoff_ms: default_forward_retry_max_backoff_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_group_id() -> String {
    "order-processor".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_startup_timeout_ms() -> u64 {
    10_000
}

fn default_topic_partitions() -> i32 {
    3
}

fn default_topic_replication_factor() -> i32 {
    1
}

fn default_input_topic() -> String {
    "orders".to_string()
}

fn default_us_topic() -> String {
    "orders.us".to_string()
}

fn default_eu_topic() -> String {
    "orders.eu".to_string()
}

fn default_other_topic() -> String {
    "orders.other".to_string()
}

fn default_poll_timeout_ms() -> u64 {
    500
}

fn default_max_batch_size() -> usize {
    500
}

fn default_forward_retry_attempts() -> u32 {
    5
}

fn default_forward_retry_backoff_ms() -> u64 {
    100
}

fn default_forward_retry_max_backoff_ms() -> u64 {
    10_000
}

fn default_drain_timeout_ms() -> u64 {
    30_000 // 30s
}
