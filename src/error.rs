//! Error types for audit-stream

use thiserror::Error;

/// Errors that can occur in the stream processor
#[derive(Debug, Error)]
pub enum StreamError {
    /// Bus connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Single publish attempt failed
    #[error("Failed to publish to topic '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    /// Subscribe failure
    #[error("Failed to subscribe to topic '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    /// Sink retry budget exhausted
    #[error("Delivery to topic '{topic}' failed after {attempts} attempts: {reason}")]
    DeliveryExhausted {
        topic: String,
        attempts: u32,
        reason: String,
    },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event does not have the shape a stage expects
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// Partition state violates an invariant
    #[error("State corruption in partition {partition}: {reason}")]
    StateCorruption { partition: usize, reason: String },

    /// Detector checkpoint could not be read or written
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stream/topic creation or management error
    #[error("Stream error: {0}")]
    Stream(String),

    /// Consumer/subscription creation or management error
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Acknowledgement failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal channel between pipeline stages closed unexpectedly
    #[error("Pipeline stage '{0}' is no longer running")]
    StageClosed(String),
}

impl StreamError {
    /// Whether a sink should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StreamError::Connection(_)
                | StreamError::Publish { .. }
                | StreamError::Timeout(_)
        )
    }
}

/// Result type alias for stream operations
pub type Result<T> = std::result::Result<T, StreamError>;
