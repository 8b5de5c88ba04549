use crate::config::{Config, PipelineConfig};
use crate::kafka::run_blocking;
use crate::record::Record;
use crate::{Error, Result};
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{error, warn};

/// Broker acknowledgement that a forwarded record was durably accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Sink side of the routing pipeline. A single `send` is one attempt;
/// retrying is the [`Forwarder`]'s job.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Publish `record` to `topic`, resolving once the broker acknowledged it.
    async fn send(&self, record: &Record, topic: &str) -> Result<Delivery>;

    /// Wait for everything still queued locally to be delivered.
    async fn flush(&self, timeout: Duration) -> Result<()>;
}

/// [`RecordSink`] backed by an idempotent rdkafka `FutureProducer`.
pub struct KafkaSink {
    producer: FutureProducer,
}

impl KafkaSink {
    pub fn new(config: &Config) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers())
            .set("acks", &config.kafka.acks)
            .set("enable.idempotence", "true")
            .set("compression.type", &config.kafka.compression)
            .set("message.timeout.ms", config.kafka.message_timeout_ms.to_string())
            .create()
            .map_err(|e| Error::Config(format!("Failed to create producer: {}", e)))?;

        Ok(Self { producer })
    }
}

fn to_owned_headers(record: &Record) -> OwnedHeaders {
    record
        .headers
        .iter()
        .fold(OwnedHeaders::new_with_capacity(record.headers.len()), |headers, header| {
            headers.insert(Header {
                key: header.key.as_str(),
                value: header.value.as_deref(),
            })
        })
}

#[async_trait]
impl RecordSink for KafkaSink {
    async fn send(&self, record: &Record, topic: &str) -> Result<Delivery> {
        let mut future_record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(topic).headers(to_owned_headers(record));
        // A null value (tombstone) stays null.
        if let Some(value) = &record.value {
            future_record = future_record.payload(&value[..]);
        }
        // Keyless records are left to the client's partitioner.
        if let Some(key) = &record.key {
            future_record = future_record.key(&key[..]);
        }

        let (partition, offset) = self
            .producer
            .send(future_record, Timeout::Never)
            .await
            .map_err(|(e, _)| Error::Kafka(e))?;

        Ok(Delivery {
            topic: topic.to_string(),
            partition,
            offset,
        })
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        let producer = self.producer.clone();
        run_blocking(move || producer.flush(timeout)).await??;
        Ok(())
    }
}

/// Exponential backoff schedule for transient forwarding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            attempts: config.forward_retry_attempts.max(1),
            base_backoff: Duration::from_millis(config.forward_retry_backoff_ms),
            max_backoff: Duration::from_millis(config.forward_retry_max_backoff_ms),
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Forwards records through a [`RecordSink`], absorbing transient failures.
pub struct Forwarder<S> {
    sink: S,
    policy: RetryPolicy,
}

impl<S: RecordSink> Forwarder<S> {
    pub fn new(sink: S, policy: RetryPolicy) -> Self {
        Self { sink, policy }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Forward `record` to `topic`.
    ///
    /// Transient errors are retried with backoff; once the attempt budget is
    /// spent the failure surfaces as [`Error::RetriesExhausted`]. Fatal
    /// errors surface immediately.
    pub async fn forward(&self, record: &Record, topic: &str) -> Result<Delivery> {
        let mut attempt = 1;
        loop {
            match self.sink.send(record, topic).await {
                Ok(delivery) => return Ok(delivery),
                Err(e) if e.is_transient() && attempt < self.policy.attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        retry_in = ?delay,
                        error = %e,
                        "Transient forwarding failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    error!(
                        topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempts = attempt,
                        error = %e,
                        "Forwarding retries exhausted"
                    );
                    return Err(Error::RetriesExhausted {
                        topic: topic.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    error!(
                        topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Fatal forwarding failure"
                    );
                    return Err(e);
                }
            }
        }
    }

    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        self.sink.flush(timeout).await
    }
}
