pub mod consumer;
pub mod producer;
pub mod topic_manager;


pub use consumer::{KafkaSource, RecordSource, RoutingContext};
pub use producer::{Delivery, Forwarder, KafkaSink, RecordSink, RetryPolicy};
pub use topic_manager::TopicManager;

use crate::{Error, Result};

/// Run a blocking librdkafka call (metadata, sync commit, flush) off the
/// async worker threads.
pub(crate) async fn run_blocking<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| Error::Fatal {
            message: format!("Blocking Kafka call failed: {}", e),
        })
}
