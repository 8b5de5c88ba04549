//! Error types and result handling for order-router.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate. Errors fall into the
//! router's failure taxonomy:
//!
//! - configuration problems found at startup ([`Error::Config`]),
//! - recoverable broker I/O ([`Error::is_transient`] returns `true`),
//! - everything else, which halts the pipeline.
//!
//! # Example
//!
//! ```rust
//! use order_router::{Error, Result};
//!
//! fn load() -> Result<()> {
//!     Err(Error::Config("brokers must not be empty".to_string()))
//! }
//!
//! let err = load().unwrap_err();
//! assert_eq!(err.exit_code(), 1);
//! assert!(!err.is_transient());
//! ```

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use thiserror::Error;

/// The main error type for order-router operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or unreachable configuration detected at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Kafka client, consumer or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// Recoverable broker I/O failure not carrying a librdkafka code.
    #[error("Transient error: {message}")]
    Transient {
        /// Description of the failure
        message: String,
    },

    /// Unrecoverable failure not carrying a librdkafka code.
    #[error("Fatal error: {message}")]
    Fatal {
        /// Description of the failure
        message: String,
    },

    /// A transient failure kept recurring until the retry budget ran out.
    #[error("Forwarding to '{topic}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Destination topic of the failed forward
        topic: String,
        /// Number of attempts made, including the first
        attempts: u32,
        /// The last transient error observed
        #[source]
        source: Box<Error>,
    },

    /// I/O error, typically while installing signal handlers.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Graceful shutdown was requested.
    ///
    /// Not really an error; used to unwind out of startup when a signal
    /// arrives before the pipeline is running.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether retrying the failed operation may succeed.
    ///
    /// Broker-side timeouts, full local queues, transport failures and
    /// leadership changes are transient. Authorization failures, unknown
    /// topics, oversized messages and serialization errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient { .. } => true,
            Error::Kafka(e) => e.rdkafka_error_code().is_some_and(is_transient_code),
            _ => false,
        }
    }

    /// Process exit code for this error: `1` for configuration errors
    /// detected at startup, `2` for fatal runtime errors.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Config(_) => 1,
            _ => 2,
        }
    }
}

fn is_transient_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::QueueFull
            | RDKafkaErrorCode::BrokerTransportFailure
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::RequestTimedOut
            | RDKafkaErrorCode::NetworkException
            | RDKafkaErrorCode::LeaderNotAvailable
            | RDKafkaErrorCode::NotLeaderForPartition
            | RDKafkaErrorCode::NotEnoughReplicas
            | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
            | RDKafkaErrorCode::NotCoordinator
            | RDKafkaErrorCode::CoordinatorLoadInProgress
            | RDKafkaErrorCode::CoordinatorNotAvailable
    )
}

/// A convenient Result type alias for order-router operations.
///
/// This is equivalent to `std::result::Result<T, order_router::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
