use crate::config::Config;
use crate::{Error, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::metadata::Metadata;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Whether `metadata` describes `topic` as existing with at least one partition.
pub fn topic_is_available(metadata: &Metadata, topic: &str) -> bool {
    metadata
        .topics()
        .iter()
        .any(|t| t.name() == topic && t.error().is_none() && !t.partitions().is_empty())
}

/// Verifies (and optionally creates) the destination topics before routing starts.
pub struct TopicManager {
    admin_client: AdminClient<DefaultClientContext>,
    create_missing: bool,
    default_partitions: i32,
    default_replication_factor: i32,
    metadata_timeout: Duration,
}

impl TopicManager {
    pub fn new(config: &Config) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers())
            .create()
            .map_err(|e| Error::Config(format!("Failed to create admin client: {}", e)))?;

        Ok(Self {
            admin_client,
            create_missing: config.kafka.create_missing_topics,
            default_partitions: config.kafka.topic_partitions,
            default_replication_factor: config.kafka.topic_replication_factor,
            metadata_timeout: config.kafka.startup_timeout(),
        })
    }

    /// Make sure every output topic exists. Missing topics are created when
    /// `create_missing_topics` is set and reported as configuration errors
    /// otherwise.
    pub async fn ensure_output_topics(&self, config: &Config) -> Result<()> {
        for topic in config.routing.output_topics.all() {
            self.ensure_topic_exists(topic).await?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(topic = %topic_name))]
    pub async fn ensure_topic_exists(&self, topic_name: &str) -> Result<()> {
        if self.topic_exists(topic_name)? {
            debug!("Topic '{}' exists", topic_name);
            return Ok(());
        }

        if !self.create_missing {
            return Err(Error::Config(format!(
                "Output topic '{}' does not exist",
                topic_name
            )));
        }

        info!("Creating topic '{}'", topic_name);
        self.create_topic(topic_name).await
    }

    fn topic_exists(&self, topic_name: &str) -> Result<bool> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(Some(topic_name), self.metadata_timeout)
            .map_err(|e| {
                warn!("Failed to fetch metadata for '{}': {}", topic_name, e);
                Error::Config(format!("Brokers unreachable: {}", e))
            })?;

        Ok(topic_is_available(&metadata, topic_name))
    }

    async fn create_topic(&self, topic_name: &str) -> Result<()> {
        let new_topic = NewTopic::new(
            topic_name,
            self.default_partitions,
            TopicReplication::Fixed(self.default_replication_factor),
        );

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self
            .admin_client
            .create_topics(&[new_topic], &opts)
            .await
            .map_err(|e| Error::Config(format!("Failed to create '{}': {}", topic_name, e)))?;

        for result in results {
            match result {
                Ok(topic) => {
                    info!("Successfully created topic: {}", topic);
                }
                Err((topic, rdkafka::types::RDKafkaErrorCode::TopicAlreadyExists)) => {
                    debug!("Topic '{}' was created concurrently", topic);
                }
                Err((_topic, error)) => {
                    return Err(Error::Config(format!(
                        "Failed to create '{}': {}",
                        topic_name, error
                    )));
                }
            }
        }

        Ok(())
    }

    pub async fn delete_topic(&self, topic_name: &str) -> Result<()> {
        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self
            .admin_client
            .delete_topics(&[topic_name], &opts)
            .await?;

        for result in results {
            match result {
                Ok(topic) => {
                    info!("Successfully deleted topic: {}", topic);
                }
                Err((_topic, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }
}
