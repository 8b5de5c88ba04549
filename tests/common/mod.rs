#![allow(dead_code)]

use order_router::kafka::TopicManager;
use order_router::Config;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message;
use std::env;
use std::time::Duration;
use tokio::time::timeout;

/// Get test configuration from environment variables.
///
/// Topic names and the consumer group are unique per test and process so
/// runs do not see each other's records or offsets.
pub fn get_test_config(tag: &str) -> Config {
    let mut config = Config::default();
    let run = format!("{}_{}", tag, std::process::id());

    config.kafka.brokers = env::var("TEST_KAFKA_BROKERS")
        .unwrap_or_else(|_| "localhost:9092".to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .collect();
    config.kafka.group_id = format!("order-router-test-{}", run);
    config.kafka.create_missing_topics = true;
    config.kafka.topic_partitions = 2;
    config.kafka.topic_replication_factor = 1;
    config.kafka.startup_timeout_ms = 10_000;

    config.routing.input_topic = format!("test_{}.orders", run);
    config.routing.output_topics.us = format!("test_{}.orders.us", run);
    config.routing.output_topics.eu = format!("test_{}.orders.eu", run);
    config.routing.output_topics.other = format!("test_{}.orders.other", run);

    config.pipeline.poll_timeout_ms = 200; // Snappy shutdown in tests
    config.pipeline.forward_retry_backoff_ms = 10;
    config.pipeline.drain_timeout_ms = 5_000;

    config
}

/// Create the input and output topics for a test run.
pub async fn setup_topics(config: &Config) {
    let manager = TopicManager::new(config).expect("Failed to create topic manager");
    manager
        .ensure_topic_exists(&config.routing.input_topic)
        .await
        .expect("Failed to create input topic");
    manager
        .ensure_output_topics(config)
        .await
        .expect("Failed to create output topics");
}

pub async fn cleanup_topics(config: &Config) {
    let manager = TopicManager::new(config).expect("Failed to create topic manager");
    let _ = manager.delete_topic(&config.routing.input_topic).await;
    for topic in config.routing.output_topics.all() {
        let _ = manager.delete_topic(topic).await;
    }
}

pub fn create_test_producer(config: &Config) -> FutureProducer {
    ClientConfig::new()
        .set("bootstrap.servers", config.brokers())
        .set("acks", "all")
        .create()
        .expect("Failed to create producer")
}

/// Produce an order onto the input topic with a `source` header.
pub async fn produce_order(producer: &FutureProducer, config: &Config, key: &str, value: &str) {
    let headers = OwnedHeaders::new().insert(Header {
        key: "source",
        value: Some("integration-test".as_bytes()),
    });
    let record = FutureRecord::to(&config.routing.input_topic)
        .key(key)
        .payload(value)
        .headers(headers);

    producer
        .send(record, Timeout::After(Duration::from_secs(10)))
        .await
        .expect("Failed to produce test order");
}

pub fn create_test_consumer(config: &Config, topics: &[&str]) -> StreamConsumer {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", config.brokers())
        .set("group.id", format!("{}-verifier", config.kafka.group_id))
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .create()
        .expect("Failed to create consumer");

    consumer
        .subscribe(topics)
        .expect("Failed to subscribe to topics");

    consumer
}

/// Receive until `expected` messages arrived or `deadline` elapsed.
pub async fn collect_messages(
    consumer: &StreamConsumer,
    expected: usize,
    deadline: Duration,
) -> Vec<OwnedMessage> {
    let mut received = Vec::new();
    let start = tokio::time::Instant::now();

    while received.len() < expected && start.elapsed() < deadline {
        if let Ok(Ok(message)) = timeout(Duration::from_secs(1), consumer.recv()).await {
            received.push(message.detach());
        }
    }

    received
}

pub fn payload_str(message: &OwnedMessage) -> String {
    String::from_utf8_lossy(message.payload().unwrap_or_default()).into_owned()
}
