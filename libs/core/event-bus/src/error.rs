//! Event bus error types and error categorization
//!
//! Handler failures are categorized to determine how a delivery is rejected:
//! - **Transient**: temporary failure, nacked with the consumer's requeue flag
//! - **Permanent**: unrecoverable, nacked without requeue so broker dead-lettering applies

use std::time::Duration;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Category of a per-delivery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure - the broker may redeliver
    Transient,
    /// Unrecoverable failure - never requeued
    Permanent,
}

impl ErrorCategory {
    /// Whether a nack for this category may ask the broker to requeue
    pub fn allows_requeue(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

/// Failure reported by an event handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    category: ErrorCategory,
}

impl HandlerError {
    /// Create a transient handler error
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Transient,
        }
    }

    /// Create a permanent handler error
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: ErrorCategory::Permanent,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A payload that does not match the handler's expected shape is not going to
/// parse on redelivery either.
impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::permanent(format!("Invalid payload: {}", err))
    }
}

/// Errors raised by a broker transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connection could not be opened or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel-level failure (declare, bind, publish, consume)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Operation attempted on a closed session
    #[error("Connection closed")]
    Closed,

    /// Ack/nack for a delivery the broker no longer knows about
    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),
}

/// Event bus errors
#[derive(Error, Debug)]
pub enum EventBusError {
    /// Connection or channel cannot be established
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(#[source] TransportError),

    /// Exchange/queue declaration, binding or consumer registration failed
    #[error("Topology setup failed: {0}")]
    Topology(#[source] TransportError),

    /// Payload could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel or connection closed during publish, or publisher not connected
    #[error("Publish error: {0}")]
    Publish(String),

    /// Handler failed, panicked, or the delivery body could not be parsed
    #[error("Handler failed for queue '{queue}': {source}")]
    Handler {
        queue: String,
        #[source]
        source: HandlerError,
    },

    /// Handler did not finish within the configured timeout
    #[error("Handler for queue '{queue}' timed out after {timeout:?}")]
    HandlerTimeout { queue: String, timeout: Duration },

    /// Registry lookup miss
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// Registry built with the same queue name twice
    #[error("Queue '{0}' is registered more than once")]
    DuplicateQueue(String),

    /// Bounded retry policy gave up
    #[error("Connection attempts exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_error: Box<EventBusError>,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl EventBusError {
    /// Create a handler failure for a queue
    pub fn handler(queue: impl Into<String>, source: HandlerError) -> Self {
        EventBusError::Handler {
            queue: queue.into(),
            source,
        }
    }

    /// Get the category used when rejecting a delivery
    pub fn category(&self) -> ErrorCategory {
        match self {
            EventBusError::Handler { source, .. } => source.category(),
            EventBusError::HandlerTimeout { .. } => ErrorCategory::Transient,
            EventBusError::UnknownQueue(_) => ErrorCategory::Permanent,
            EventBusError::Serialization(_) => ErrorCategory::Permanent,
            EventBusError::DuplicateQueue(_) => ErrorCategory::Permanent,
            EventBusError::Config(_) => ErrorCategory::Permanent,
            EventBusError::RetryExhausted { .. } => ErrorCategory::Permanent,
            EventBusError::Shutdown => ErrorCategory::Permanent,
            EventBusError::BrokerUnavailable(_)
            | EventBusError::Topology(_)
            | EventBusError::Publish(_) => ErrorCategory::Transient,
        }
    }

    /// Whether the error comes from establishing a broker session
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EventBusError::BrokerUnavailable(_) | EventBusError::Topology(_)
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            EventBusError::BrokerUnavailable(_) => "broker_unavailable",
            EventBusError::Topology(_) => "topology",
            EventBusError::Serialization(_) => "serialization",
            EventBusError::Publish(_) => "publish",
            EventBusError::Handler { .. } => "handler",
            EventBusError::HandlerTimeout { .. } => "timeout",
            EventBusError::UnknownQueue(_) => "unknown_queue",
            EventBusError::DuplicateQueue(_) => "duplicate_queue",
            EventBusError::RetryExhausted { .. } => "retry_exhausted",
            EventBusError::Config(_) => "config",
            EventBusError::Shutdown => "shutdown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_categories() {
        assert_eq!(
            HandlerError::transient("smtp down").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            HandlerError::permanent("bad address").category(),
            ErrorCategory::Permanent
        );
        assert!(ErrorCategory::Transient.allows_requeue());
        assert!(!ErrorCategory::Permanent.allows_requeue());
    }

    #[test]
    fn test_payload_errors_are_permanent() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let handler_err = HandlerError::from(err);
        assert_eq!(handler_err.category(), ErrorCategory::Permanent);
        assert!(handler_err.message().starts_with("Invalid payload"));
    }

    #[test]
    fn test_event_bus_error_category() {
        let timeout = EventBusError::HandlerTimeout {
            queue: "task-created".to_string(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(timeout.category(), ErrorCategory::Transient);

        let unknown = EventBusError::UnknownQueue("nope".to_string());
        assert_eq!(unknown.category(), ErrorCategory::Permanent);

        let handler = EventBusError::handler("user-signuped", HandlerError::transient("retry me"));
        assert_eq!(handler.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_connection_errors() {
        let err = EventBusError::BrokerUnavailable(TransportError::Connection("refused".into()));
        assert!(err.is_connection_error());
        assert_eq!(err.kind(), "broker_unavailable");
        assert!(err.to_string().contains("refused"));

        assert!(!EventBusError::Publish("closed".into()).is_connection_error());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
        assert_eq!(ErrorCategory::Permanent.as_ref(), "permanent");
    }
}
