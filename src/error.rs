//! Error types and result handling for txn-pubsub.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use txn_pubsub::{Error, Result};
//!
//! fn connect_to_broker() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_broker() {
//!     Ok(()) => println!("Connected"),
//!     Err(Error::Connection(msg)) => eprintln!("Connection error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for txn-pubsub operations.
///
/// Publish failures that the publisher recovers from locally (by aborting the
/// transaction) are not errors; they are reported through
/// [`PublishOutcome::Failed`](crate::publisher::PublishOutcome). Everything
/// that reaches the caller as an `Error` needs a decision from the caller.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file or environment overrides.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Kafka client, producer or consumer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Avro encoding, decoding or schema resolution error.
    #[error("Avro error: {0}")]
    Avro(#[from] apache_avro::Error),

    /// HTTP error talking to the schema registry.
    #[error("Schema registry error: {0}")]
    Registry(#[from] reqwest::Error),

    /// Generic connection error not covered by specific types.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The payload does not match the schema known to the registry.
    #[error("Codec error: {message}")]
    Codec {
        /// Description of the mismatch
        message: String,
    },

    /// Producer transaction could not be begun, committed or aborted.
    #[error("Transaction error: {message}")]
    Transaction {
        /// Description of the transaction failure
        message: String,
    },

    /// Another producer initialized the same transactional id.
    #[error("Producer fenced: {message}")]
    Fenced {
        /// Description of the fencing event
        message: String,
    },

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// An operation was called in a state that does not allow it.
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the violated state
        message: String,
    },

    /// A record handler rejected a record.
    #[error("Processing error: {message}")]
    Processing {
        /// Description of the processing failure
        message: String,
    },

    /// A record could not be routed to the dead-letter destination.
    #[error("Dead-letter error: {message}")]
    DeadLetter {
        /// Description of the routing failure
        message: String,
    },
}

impl Error {
    /// Builds a [`Error::Processing`] from anything displayable.
    pub fn processing(message: impl Into<String>) -> Self {
        Error::Processing {
            message: message.into(),
        }
    }

    /// Builds a [`Error::Codec`] from anything displayable.
    pub fn codec(message: impl Into<String>) -> Self {
        Error::Codec {
            message: message.into(),
        }
    }

    /// Whether the error leaves the component unusable.
    ///
    /// Fatal errors end the publisher or subscriber; everything else may be
    /// retried by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::Fenced { .. }
                | Error::Timeout { .. }
                | Error::InvalidState { .. }
        )
    }
}

/// A convenient Result type alias for txn-pubsub operations.
///
/// This is equivalent to `std::result::Result<T, txn_pubsub::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Fenced {
            message: "epoch bumped".to_string()
        }
        .is_fatal());
        assert!(Error::Timeout {
            message: "init".to_string()
        }
        .is_fatal());
        assert!(Error::from(config::ConfigError::NotFound("broker.topic".to_string())).is_fatal());
        assert!(!Error::Connection("broker down".to_string()).is_fatal());
        assert!(!Error::processing("bad record").is_fatal());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::DeadLetter {
            message: "KafkaEstudo.dlq unreachable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Dead-letter error: KafkaEstudo.dlq unreachable"
        );
    }
}
