//! In-memory broker, source and sink for exercising the pipeline in unit tests.

use crate::cursor::CommitCursor;
use crate::kafka::{Delivery, RecordSink, RecordSource};
use crate::record::Record;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const INPUT_TOPIC: &str = "orders";

#[derive(Default)]
struct BrokerState {
    input: BTreeMap<i32, Vec<Record>>,
    committed: BTreeMap<i32, i64>,
    commit_log: Vec<(i32, i64)>,
    published: Vec<(String, Record)>,
    revoked: HashSet<i32>,
}

/// Shared broker state that outlives individual source/sink instances, so a
/// "restarted" router sees the offsets committed by its predecessor.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut BrokerState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Append a value to an input partition, returning its offset.
    pub fn produce(&self, partition: i32, value: &[u8]) -> i64 {
        self.produce_with(partition, |record| {
            record.with_value(Bytes::copy_from_slice(value))
        })
    }

    /// Append a record built by `build` to an input partition.
    pub fn produce_with(&self, partition: i32, build: impl FnOnce(Record) -> Record) -> i64 {
        self.with(|state| {
            let log = state.input.entry(partition).or_default();
            let offset = log.len() as i64;
            log.push(build(Record::new(INPUT_TOPIC, partition, offset, Bytes::new())));
            offset
        })
    }

    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.with(|state| state.committed.get(&partition).copied())
    }

    pub fn commit_log(&self) -> Vec<(i32, i64)> {
        self.with(|state| state.commit_log.clone())
    }

    /// Records published to `topic`, in acknowledgement order.
    pub fn published(&self, topic: &str) -> Vec<Record> {
        self.with(|state| {
            state
                .published
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, record)| record.clone())
                .collect()
        })
    }

    pub fn published_count(&self) -> usize {
        self.with(|state| state.published.len())
    }

    pub fn revoke(&self, partition: i32) {
        self.with(|state| {
            state.revoked.insert(partition);
        })
    }

    fn publish(&self, topic: &str, record: &Record) -> Delivery {
        self.with(|state| {
            state.published.push((topic.to_string(), record.clone()));
            let offset = state.published.iter().filter(|(t, _)| t == topic).count() as i64 - 1;
            Delivery {
                topic: topic.to_string(),
                partition: 0,
                offset,
            }
        })
    }
}

pub struct MemorySource {
    broker: MemoryBroker,
    positions: BTreeMap<i32, i64>,
    cursor: CommitCursor,
    max_batch_size: usize,
    stop_when_drained: Option<CancellationToken>,
    fail_commits: bool,
}

impl MemorySource {
    pub fn new(broker: &MemoryBroker) -> Self {
        Self {
            broker: broker.clone(),
            positions: BTreeMap::new(),
            cursor: CommitCursor::new(),
            max_batch_size: 100,
            stop_when_drained: None,
            fail_commits: false,
        }
    }

    pub fn with_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Reject every commit with a non-retriable error.
    pub fn fail_commits(mut self) -> Self {
        self.fail_commits = true;
        self
    }

    /// Cancel `token` the first time the source finds nothing left to read.
    pub fn stop_when_drained(mut self, token: &CancellationToken) -> Self {
        self.stop_when_drained = Some(token.clone());
        self
    }
}

#[async_trait]
impl RecordSource for MemorySource {
    async fn start(&mut self) -> Result<()> {
        // Resume after the last committed offset, like a consumer group would.
        self.positions = self.broker.with(|state| {
            state
                .input
                .keys()
                .map(|partition| {
                    let next = state.committed.get(partition).map_or(0, |offset| offset + 1);
                    (*partition, next)
                })
                .collect()
        });
        Ok(())
    }

    async fn next_batch(&mut self) -> Result<Vec<Record>> {
        let mut batch = Vec::new();
        let positions = &mut self.positions;
        let max = self.max_batch_size;
        self.broker.with(|state| {
            for (partition, log) in &state.input {
                if state.revoked.contains(partition) {
                    continue;
                }
                let position = positions.entry(*partition).or_insert(0);
                while batch.len() < max {
                    match log.get(*position as usize) {
                        Some(record) => {
                            batch.push(record.clone());
                            *position += 1;
                        }
                        None => break,
                    }
                }
            }
        });

        if batch.is_empty() {
            if let Some(token) = &self.stop_when_drained {
                token.cancel();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<i32, i64>) -> Result<()> {
        if self.fail_commits {
            return Err(Error::Fatal {
                message: "group authorization failed".to_string(),
            });
        }
        for (partition, offset) in self.cursor.pending(offsets) {
            if !self.is_assigned(partition) {
                self.cursor.forget(partition);
                continue;
            }
            self.broker.with(|state| {
                state.committed.insert(partition, offset);
                state.commit_log.push((partition, offset));
            });
            self.cursor.advance(partition, offset);
        }
        Ok(())
    }

    fn is_assigned(&self, partition: i32) -> bool {
        self.broker.with(|state| !state.revoked.contains(&partition))
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Scripted misbehaviour for a single send attempt.
pub enum Fault {
    Transient,
    Fatal,
    /// Cancel the token, then never acknowledge.
    Hang(CancellationToken),
    /// Cancel the token, then acknowledge after the delay.
    SlowAck(CancellationToken, Duration),
    /// Revoke the partition, then acknowledge.
    Revoke(i32),
    /// Publish, then report a fatal error as if the process died before
    /// it could commit.
    PublishThenFail,
}

pub struct MemorySink {
    broker: MemoryBroker,
    faults: Mutex<HashMap<(i32, i64), VecDeque<Fault>>>,
    attempts: AtomicUsize,
    slow_flush: bool,
}

impl MemorySink {
    pub fn new(broker: &MemoryBroker) -> Self {
        Self {
            broker: broker.clone(),
            faults: Mutex::new(HashMap::new()),
            attempts: AtomicUsize::new(0),
            slow_flush: false,
        }
    }

    /// Queue a fault for the next send of the record at `partition`/`offset`.
    pub fn fail(self, partition: i32, offset: i64, fault: Fault) -> Self {
        self.faults
            .lock()
            .unwrap()
            .entry((partition, offset))
            .or_default()
            .push_back(fault);
        self
    }

    /// Make `flush` take its whole timeout, like a producer stuck on
    /// undeliverable messages.
    pub fn slow_flush(mut self) -> Self {
        self.slow_flush = true;
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn send(&self, record: &Record, topic: &str) -> Result<Delivery> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let fault = self
            .faults
            .lock()
            .unwrap()
            .get_mut(&(record.partition, record.offset))
            .and_then(|queue| queue.pop_front());

        match fault {
            None => {}
            Some(Fault::Transient) => {
                return Err(Error::Transient {
                    message: "broker not available".to_string(),
                })
            }
            Some(Fault::Fatal) => {
                return Err(Error::Fatal {
                    message: "topic authorization failed".to_string(),
                })
            }
            Some(Fault::Hang(token)) => {
                token.cancel();
                std::future::pending::<()>().await;
            }
            Some(Fault::SlowAck(token, delay)) => {
                token.cancel();
                tokio::time::sleep(delay).await;
            }
            Some(Fault::Revoke(partition)) => self.broker.revoke(partition),
            Some(Fault::PublishThenFail) => {
                self.broker.publish(topic, record);
                return Err(Error::Fatal {
                    message: "process crashed after publish".to_string(),
                });
            }
        }

        Ok(self.broker.publish(topic, record))
    }

    async fn flush(&self, timeout: Duration) -> Result<()> {
        if self.slow_flush {
            tokio::time::sleep(timeout).await;
        }
        Ok(())
    }
}
