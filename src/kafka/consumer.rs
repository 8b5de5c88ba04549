use crate::config::Config;
use crate::cursor::CommitCursor;
use crate::kafka::run_blocking;
use crate::kafka::topic_manager::topic_is_available;
use crate::record::Record;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Source side of the routing pipeline.
///
/// Offsets passed to [`RecordSource::commit`] are the highest input offsets
/// whose forwarded copies were acknowledged; implementations translate them
/// into whatever their broker stores.
#[async_trait]
pub trait RecordSource: Send {
    /// Bind the subscription. Fails with [`Error::Config`] when the input
    /// cannot be reached within the startup window.
    async fn start(&mut self) -> Result<()>;

    /// Next batch of records in partition order. An empty batch means no
    /// data arrived within the poll timeout.
    async fn next_batch(&mut self) -> Result<Vec<Record>>;

    /// Record that all offsets up to and including the given offset per
    /// partition have been forwarded. Offsets at or below the current cursor
    /// are ignored.
    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<()>;

    /// Whether `partition` is still owned by this consumer.
    fn is_assigned(&self, partition: i32) -> bool;

    /// Close the subscription.
    async fn stop(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
struct Assignment {
    partitions: HashSet<i32>,
    generations: HashMap<i32, u64>,
    /// Revoked since the owner last called `take_revoked`.
    revoked: HashSet<i32>,
}

/// Consumer context tracking partition ownership across rebalances.
///
/// Every revocation bumps the partition's generation so records fetched
/// under an older generation can be recognised and dropped.
pub struct RoutingContext {
    topic: String,
    assignment: Mutex<Assignment>,
}

impl RoutingContext {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            assignment: Mutex::new(Assignment::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Assignment> {
        self.assignment
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn partitions_of(&self, tpl: &TopicPartitionList) -> Vec<i32> {
        tpl.elements()
            .iter()
            .filter(|elem| elem.topic() == self.topic)
            .map(|elem| elem.partition())
            .collect()
    }

    pub fn is_assigned(&self, partition: i32) -> bool {
        self.lock().partitions.contains(&partition)
    }

    pub fn generation(&self, partition: i32) -> u64 {
        self.lock().generations.get(&partition).copied().unwrap_or(0)
    }

    /// Whether a record fetched under `generation` may still be forwarded.
    pub fn is_current(&self, partition: i32, generation: u64) -> bool {
        let assignment = self.lock();
        assignment.partitions.contains(&partition)
            && assignment.generations.get(&partition).copied().unwrap_or(0) == generation
    }

    fn assign(&self, partitions: &[i32]) {
        let mut assignment = self.lock();
        assignment.partitions.extend(partitions.iter().copied());
    }

    fn revoke(&self, partitions: &[i32]) {
        let mut assignment = self.lock();
        for partition in partitions {
            assignment.partitions.remove(partition);
            assignment.revoked.insert(*partition);
            *assignment.generations.entry(*partition).or_default() += 1;
        }
    }

    /// Partitions revoked since the previous call.
    pub fn take_revoked(&self) -> Vec<i32> {
        let mut revoked: Vec<i32> = self.lock().revoked.drain().collect();
        revoked.sort_unstable();
        revoked
    }
}

impl ClientContext for RoutingContext {}

impl ConsumerContext for RoutingContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                let partitions = self.partitions_of(tpl);
                info!(
                    topic = %self.topic,
                    partitions = ?partitions,
                    "Partitions revoked, uncommitted records will be dropped"
                );
                self.revoke(&partitions);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(topic = %self.topic, error = ?e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            let partitions = self.partitions_of(tpl);
            info!(topic = %self.topic, partitions = ?partitions, "Partitions assigned");
            self.assign(&partitions);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(count = offsets.count(), "Offsets committed"),
            Err(e) => warn!(error = %e, "Offset commit reported failure"),
        }
    }
}

/// [`RecordSource`] backed by an rdkafka `StreamConsumer` in a consumer group.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer<RoutingContext>>,
    topic: String,
    group_id: String,
    poll_timeout: Duration,
    max_batch_size: usize,
    startup_timeout: Duration,
    cursor: CommitCursor,
}

impl KafkaSource {
    pub fn new(config: &Config) -> Result<Self> {
        let topic = config.routing.input_topic.clone();
        let consumer: StreamConsumer<RoutingContext> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers())
            .set("group.id", &config.kafka.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("auto.offset.reset", &config.kafka.auto_offset_reset)
            .set("session.timeout.ms", config.kafka.session_timeout_ms.to_string())
            .create_with_context(RoutingContext::new(topic.clone()))
            .map_err(|e| Error::Config(format!("Failed to create consumer: {}", e)))?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic,
            group_id: config.kafka.group_id.clone(),
            poll_timeout: config.pipeline.poll_timeout(),
            max_batch_size: config.pipeline.max_batch_size,
            startup_timeout: config.kafka.startup_timeout(),
            cursor: CommitCursor::new(),
        })
    }

    /// Wait for the input topic to show up in cluster metadata, retrying
    /// with backoff until the startup window closes.
    async fn wait_for_topic(&self) -> Result<()> {
        let deadline = Instant::now() + self.startup_timeout;
        let mut delay = Duration::from_millis(100);

        loop {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(100));
            let consumer = Arc::clone(&self.consumer);
            let topic = self.topic.clone();
            let fetched = run_blocking(move || {
                consumer
                    .fetch_metadata(Some(topic.as_str()), remaining)
                    .map(|metadata| topic_is_available(&metadata, &topic))
            })
            .await?;
            let visible = match fetched {
                Ok(visible) => visible,
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "Failed to fetch metadata");
                    false
                }
            };

            if visible {
                return Ok(());
            }
            if Instant::now() + delay >= deadline {
                return Err(Error::Config(format!(
                    "Input topic '{}' not reachable within {:?}",
                    self.topic, self.startup_timeout
                )));
            }
            debug!(topic = %self.topic, retry_in = ?delay, "Input topic not visible yet");
            sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(2));
        }
    }

    /// Drop cursor positions of partitions revoked since the last call, so a
    /// reassigned partition commits from wherever the group offset now is.
    fn forget_revoked(&mut self) {
        forget_revoked(&mut self.cursor, self.consumer.context());
    }

    fn consumer_error(&self, error: KafkaError) -> Result<Vec<Record>> {
        let error = Error::Kafka(error);
        if error.is_transient() {
            warn!(topic = %self.topic, error = %error, "Transient consumer error");
            Ok(Vec::new())
        } else {
            error!(topic = %self.topic, error = %error, "Consumer error");
            Err(error)
        }
    }
}

#[async_trait]
impl RecordSource for KafkaSource {
    #[instrument(skip(self), fields(topic = %self.topic, group_id = %self.group_id))]
    async fn start(&mut self) -> Result<()> {
        self.wait_for_topic().await?;
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| Error::Config(format!("Failed to subscribe to '{}': {}", self.topic, e)))?;
        info!("Subscribed to input topic");
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<Record>> {
        let first = match timeout(self.poll_timeout, self.consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(result) => result.map(|message| Record::from_message(&message)),
        };

        let context = self.consumer.context();
        let mut fetched = match first {
            Ok(record) => {
                let generation = context.generation(record.partition);
                vec![(record, generation)]
            }
            Err(e) => return self.consumer_error(e),
        };

        while fetched.len() < self.max_batch_size {
            let next = match self.consumer.recv().now_or_never() {
                None => break,
                Some(result) => result.map(|message| Record::from_message(&message)),
            };
            match next {
                Ok(record) => {
                    let generation = context.generation(record.partition);
                    fetched.push((record, generation));
                }
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, "Consumer error while filling batch");
                    break;
                }
            }
        }

        let fetched_count = fetched.len();
        let batch: Vec<Record> = fetched
            .into_iter()
            .filter(|(record, generation)| context.is_current(record.partition, *generation))
            .map(|(record, _)| record)
            .collect();

        if batch.len() < fetched_count {
            debug!(
                dropped = fetched_count - batch.len(),
                "Dropped records fetched before a rebalance"
            );
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<()> {
        self.forget_revoked();
        let mut tpl = TopicPartitionList::new();
        let mut staged = Vec::new();

        for (partition, offset) in self.cursor.pending(offsets) {
            if !self.is_assigned(partition) {
                debug!(partition, offset, "Skipping commit for revoked partition");
                self.cursor.forget(partition);
                continue;
            }
            // The broker stores the next offset to read.
            tpl.add_partition_offset(&self.topic, partition, Offset::Offset(offset + 1))?;
            staged.push((partition, offset));
        }

        if staged.is_empty() {
            return Ok(());
        }

        let consumer = Arc::clone(&self.consumer);
        let committed = run_blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await?;
        match committed {
            Ok(()) => {
                for (partition, offset) in &staged {
                    self.cursor.advance(*partition, *offset);
                }
                debug!(offsets = ?staged, "Committed offsets");
                Ok(())
            }
            Err(e) => {
                let error = Error::Kafka(e);
                if error.is_transient() || is_rebalance_conflict(&error) {
                    warn!(
                        offsets = ?staged,
                        error = %error,
                        "Offset commit failed, records may be redelivered"
                    );
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    fn is_assigned(&self, partition: i32) -> bool {
        self.consumer.context().is_assigned(partition)
    }

    async fn stop(&mut self) -> Result<()> {
        self.consumer.unsubscribe();
        info!(
            topic = %self.topic,
            committed = ?self.cursor.positions(),
            "Unsubscribed from input topic"
        );
        Ok(())
    }
}

fn forget_revoked(cursor: &mut CommitCursor, context: &RoutingContext) {
    for partition in context.take_revoked() {
        if let Some(offset) = cursor.get(partition) {
            debug!(partition, offset, "Forgetting commit position of revoked partition");
        }
        cursor.forget(partition);
    }
}

fn is_rebalance_conflict(error: &Error) -> bool {
    match error {
        Error::Kafka(e) => matches!(
            e.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::RebalanceInProgress
                    | RDKafkaErrorCode::IllegalGeneration
                    | RDKafkaErrorCode::UnknownMemberId
            )
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_generations() {
        let context = RoutingContext::new("orders");
        assert!(!context.is_assigned(0));

        context.assign(&[0, 1]);
        assert!(context.is_assigned(0));
        assert!(context.is_current(1, 0));

        context.revoke(&[1]);
        assert!(!context.is_assigned(1));
        assert_eq!(context.generation(1), 1);
        assert!(!context.is_current(1, 0));

        // Reassignment does not revive records fetched under the old generation.
        context.assign(&[1]);
        assert!(!context.is_current(1, 0));
        assert!(context.is_current(1, 1));
        assert!(context.is_current(0, 0));
    }

    #[test]
    fn test_rebalance_hooks_track_assignment() {
        let context = RoutingContext::new("orders");
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("orders", 3);
        tpl.add_partition("payments", 4);

        context.pre_rebalance(&Rebalance::Assign(&tpl));
        assert!(!context.is_assigned(3));
        context.post_rebalance(&Rebalance::Assign(&tpl));
        assert!(context.is_assigned(3));
        assert!(!context.is_assigned(4));

        context.pre_rebalance(&Rebalance::Revoke(&tpl));
        context.post_rebalance(&Rebalance::Revoke(&tpl));
        assert!(!context.is_assigned(3));
        assert_eq!(context.generation(3), 1);
        assert_eq!(context.take_revoked(), vec![3]);
    }

    #[test]
    fn test_revocation_clears_commit_cursor() {
        let context = RoutingContext::new("orders");
        let mut cursor = CommitCursor::new();
        context.assign(&[0, 1]);
        cursor.advance(0, 100);
        cursor.advance(1, 50);

        // Revoked and handed back before the next commit.
        context.revoke(&[0]);
        context.assign(&[0]);
        forget_revoked(&mut cursor, &context);

        assert_eq!(cursor.get(0), None);
        assert_eq!(cursor.get(1), Some(50));
        // A lower group offset after reassignment is committed again.
        let offsets = BTreeMap::from([(0, 10)]);
        assert_eq!(cursor.pending(&offsets), offsets);

        // Revocations are reported once.
        assert!(context.take_revoked().is_empty());
    }

    #[test]
    fn test_partitions_of_filters_topic() {
        let context = RoutingContext::new("orders");
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("orders", 0);
        tpl.add_partition("payments", 1);
        tpl.add_partition("orders", 2);
        assert_eq!(context.partitions_of(&tpl), vec![0, 2]);
    }

    #[test]
    fn test_rebalance_conflicts() {
        let conflict = Error::Kafka(KafkaError::ConsumerCommit(
            RDKafkaErrorCode::RebalanceInProgress,
        ));
        assert!(is_rebalance_conflict(&conflict));

        let denied = Error::Kafka(KafkaError::ConsumerCommit(
            RDKafkaErrorCode::GroupAuthorizationFailed,
        ));
        assert!(!is_rebalance_conflict(&denied));
        assert!(!denied.is_transient());
    }
}
