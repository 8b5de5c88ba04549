//! The routing pipeline: fetch, classify, forward, commit.
//!
//! Each batch is split by input partition and every partition is worked by
//! its own future. A worker forwards its records one at a time and waits for
//! the broker acknowledgement before moving on, so records from one input
//! partition reach a given destination in offset order. Once all workers are
//! done, the highest acknowledged offset of every partition is committed.
//! Offsets that were never acknowledged are never committed.
//!
//! Shutdown runs against a single drain deadline taken when draining starts:
//! in-flight forwards and the final producer flush share it.

use crate::classifier::{classify, Region};
use crate::config::{Config, OutputTopics};
use crate::kafka::{Forwarder, RecordSink, RecordSource, RetryPolicy};
use crate::record::Record;
use crate::Result;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported when the router stops.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RouterStats {
    pub consumed: u64,
    pub routed_us: u64,
    pub routed_eu: u64,
    pub routed_other: u64,
    /// Records dropped unforwarded because their partition was revoked.
    pub dropped: u64,
    pub commits: u64,
}

impl RouterStats {
    pub fn routed(&self, region: Region) -> u64 {
        match region {
            Region::Us => self.routed_us,
            Region::Eu => self.routed_eu,
            Region::Other => self.routed_other,
        }
    }

    pub fn total_routed(&self) -> u64 {
        self.routed_us + self.routed_eu + self.routed_other
    }

    fn add_routed(&mut self, region: Region) {
        match region {
            Region::Us => self.routed_us += 1,
            Region::Eu => self.routed_eu += 1,
            Region::Other => self.routed_other += 1,
        }
    }
}

/// Result of working one partition's share of a batch.
struct PartitionOutcome {
    partition: i32,
    /// Highest offset whose forward was acknowledged.
    acked: Option<i64>,
    routed: Vec<Region>,
    dropped: u64,
    error: Option<crate::Error>,
}

struct PartitionWorker<'a, Src, Snk> {
    source: &'a Src,
    forwarder: &'a Forwarder<Snk>,
    topics: &'a OutputTopics,
    drain_timeout: Duration,
    drain_deadline: &'a OnceLock<Instant>,
    halt: &'a CancellationToken,
}

impl<Src: RecordSource, Snk: RecordSink> PartitionWorker<'_, Src, Snk> {
    async fn run(self, partition: i32, records: Vec<Record>) -> PartitionOutcome {
        let mut outcome = PartitionOutcome {
            partition,
            acked: None,
            routed: Vec::with_capacity(records.len()),
            dropped: 0,
            error: None,
        };
        let total = records.len();

        for (index, record) in records.into_iter().enumerate() {
            if self.halt.is_cancelled() {
                debug!(partition, offset = record.offset, "Stopping partition before forward");
                break;
            }
            if !self.source.is_assigned(partition) {
                outcome.dropped = (total - index) as u64;
                info!(
                    partition,
                    from_offset = record.offset,
                    dropped = outcome.dropped,
                    "Partition revoked, dropping uncommitted records"
                );
                break;
            }

            let region = classify(record.payload());
            let topic = self.topics.topic_for(region);
            info!(
                partition,
                offset = record.offset,
                region = %region,
                topic,
                "Routing record"
            );

            let forward = self.forwarder.forward(&record, topic);
            tokio::pin!(forward);

            let result = tokio::select! {
                biased;
                result = &mut forward => result,
                _ = self.halt.cancelled() => {
                    debug!(partition, offset = record.offset, "Draining in-flight forward");
                    let deadline = *self
                        .drain_deadline
                        .get_or_init(|| Instant::now() + self.drain_timeout);
                    match timeout_at(deadline, &mut forward).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(
                                partition,
                                offset = record.offset,
                                drain_timeout = ?self.drain_timeout,
                                "Drain deadline elapsed, offset left uncommitted"
                            );
                            break;
                        }
                    }
                }
            };

            match result {
                Ok(delivery) => {
                    debug!(
                        partition,
                        offset = record.offset,
                        topic,
                        destination_partition = delivery.partition,
                        destination_offset = delivery.offset,
                        "Forward acknowledged"
                    );
                    outcome.acked = Some(record.offset);
                    outcome.routed.push(region);
                }
                Err(e) => {
                    error!(
                        partition,
                        offset = record.offset,
                        topic,
                        error = %e,
                        "Forwarding failed, halting pipeline"
                    );
                    self.halt.cancel();
                    outcome.error = Some(e);
                    break;
                }
            }
        }

        outcome
    }
}

/// Routes every record of the input topic to exactly one regional topic.
pub struct Router<Src, Snk> {
    source: Src,
    forwarder: Forwarder<Snk>,
    topics: OutputTopics,
    drain_timeout: Duration,
    drain_deadline: OnceLock<Instant>,
    stats: RouterStats,
}

impl<Src: RecordSource, Snk: RecordSink> Router<Src, Snk> {
    pub fn new(config: &Config, source: Src, sink: Snk) -> Self {
        Self {
            source,
            forwarder: Forwarder::new(sink, RetryPolicy::from_config(&config.pipeline)),
            topics: config.routing.output_topics.clone(),
            drain_timeout: config.pipeline.drain_timeout(),
            drain_deadline: OnceLock::new(),
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// On cancellation in-flight forwards are drained, acknowledged offsets
    /// committed and the source stopped. A fatal error cancels `shutdown`
    /// so other tasks observing the token stop as well.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<RouterStats> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before the router started");
                return Ok(self.stats);
            }
            started = self.source.start() => started?,
        }

        info!(
            us = %self.topics.us,
            eu = %self.topics.eu,
            other = %self.topics.other,
            retry_attempts = self.forwarder.policy().attempts,
            "Router started"
        );

        let routed = self.route_until_cancelled(&shutdown).await;
        if routed.is_err() {
            shutdown.cancel();
        }

        let deadline = *self
            .drain_deadline
            .get_or_init(|| Instant::now() + self.drain_timeout);
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!("Drain deadline elapsed, skipping producer flush");
        } else if let Err(e) = self.forwarder.flush(remaining).await {
            warn!(error = %e, "Failed to flush producer");
        }
        let stopped = self.source.stop().await;

        info!(
            consumed = self.stats.consumed,
            routed_us = self.stats.routed_us,
            routed_eu = self.stats.routed_eu,
            routed_other = self.stats.routed_other,
            dropped = self.stats.dropped,
            commits = self.stats.commits,
            "Router stopped"
        );

        routed?;
        stopped?;
        Ok(self.stats)
    }

    async fn route_until_cancelled(&mut self, shutdown: &CancellationToken) -> Result<()> {
        loop {
            let batch = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                batch = self.source.next_batch() => batch?,
            };

            if !batch.is_empty() {
                self.route_batch(batch, shutdown).await?;
            }
        }
    }

    async fn route_batch(&mut self, batch: Vec<Record>, shutdown: &CancellationToken) -> Result<()> {
        let mut partitions: BTreeMap<i32, Vec<Record>> = BTreeMap::new();
        for record in batch {
            debug!(
                partition = record.partition,
                offset = record.offset,
                value = %record.value_preview(),
                "Consumed record"
            );
            self.stats.consumed += 1;
            partitions.entry(record.partition).or_default().push(record);
        }

        let halt = shutdown.child_token();
        let workers = partitions.into_iter().map(|(partition, mut records)| {
            records.sort_by_key(|record| record.offset);
            let worker = PartitionWorker {
                source: &self.source,
                forwarder: &self.forwarder,
                topics: &self.topics,
                drain_timeout: self.drain_timeout,
                drain_deadline: &self.drain_deadline,
                halt: &halt,
            };
            worker.run(partition, records)
        });
        let outcomes = join_all(workers).await;

        let mut offsets = BTreeMap::new();
        let mut failure = None;
        for outcome in outcomes {
            for region in &outcome.routed {
                self.stats.add_routed(*region);
            }
            self.stats.dropped += outcome.dropped;
            if let Some(offset) = outcome.acked {
                offsets.insert(outcome.partition, offset);
            }
            if let Some(e) = outcome.error {
                failure.get_or_insert(e);
            }
        }

        if !offsets.is_empty() {
            match self.source.commit(&offsets).await {
                Ok(()) => self.stats.commits += 1,
                Err(e) if failure.is_some() => {
                    error!(error = %e, "Offset commit failed while halting");
                }
                Err(e) => failure = Some(e),
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
