//! Error types for messaging operations

use thiserror::Error;

/// Result alias for messaging operations.
pub type MessagingResult<T> = Result<T, MessagingError>;

/// Errors that can occur during messaging operations
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Failed to publish a message
    #[error("Publish failed: {0}")]
    Publish(String),

    /// Failed to subscribe to a topic
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Failed to mark a message as processed
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Invalid configuration, including unreadable or malformed TLS material
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The consumer group was closed
    #[error("Consumer group closed")]
    GroupClosed,

    /// Operation not allowed in the current consumer state
    #[error("Invalid consumer state: {0}")]
    InvalidState(String),

    /// Internal broker error
    #[error("Broker error: {0}")]
    BrokerError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl MessagingError {
    /// Whether this error only signals that the group was closed.
    pub fn is_group_closed(&self) -> bool {
        matches!(self, MessagingError::GroupClosed)
    }

    /// Check if this error indicates a connection issue
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_) | MessagingError::BrokerError(_)
        )
    }
}

#[cfg(feature = "kafka")]
impl From<rdkafka::error::KafkaError> for MessagingError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::KafkaError;

        match &err {
            KafkaError::MessageProduction(_) => MessagingError::Publish(err.to_string()),
            KafkaError::MessageConsumption(_) | KafkaError::Subscription(_) => {
                MessagingError::Subscribe(err.to_string())
            }
            KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => {
                MessagingError::Connection(err.to_string())
            }
            KafkaError::StoreOffset(_) | KafkaError::ConsumerCommit(_) => {
                MessagingError::Commit(err.to_string())
            }
            _ => MessagingError::BrokerError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_closed() {
        assert!(MessagingError::GroupClosed.is_group_closed());
        assert!(!MessagingError::Other("x".into()).is_group_closed());
    }

    #[test]
    fn test_connection_errors() {
        assert!(MessagingError::Connection("refused".into()).is_connection_error());
        assert!(!MessagingError::Configuration("bad".into()).is_connection_error());
    }
}
