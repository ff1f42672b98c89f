//! Error types for the notifications domain.

use event_bus::HandlerError;
use thiserror::Error;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The delivery channel (mail relay, push service) refused or timed out.
    #[error("Delivery failed: {0}")]
    Delivery(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded. Please try again later")]
    RateLimitExceeded,

    /// Recipient address rejected by the sender.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Template rendering error.
    #[error("Template rendering error: {0}")]
    Template(String),
}

impl NotificationError {
    /// Whether trying the same notification again can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NotificationError::Delivery(_) | NotificationError::RateLimitExceeded
        )
    }
}

impl From<handlebars::RenderError> for NotificationError {
    fn from(err: handlebars::RenderError) -> Self {
        NotificationError::Template(err.to_string())
    }
}

/// Retryable failures are requeued by the consumer, the rest are dead-lettered.
impl From<NotificationError> for HandlerError {
    fn from(err: NotificationError) -> Self {
        if err.is_retryable() {
            HandlerError::transient(err.to_string())
        } else {
            HandlerError::permanent(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use event_bus::ErrorCategory;

    #[test]
    fn test_handler_error_category() {
        let transient: HandlerError = NotificationError::Delivery("relay down".into()).into();
        assert_eq!(transient.category(), ErrorCategory::Transient);

        let limited: HandlerError = NotificationError::RateLimitExceeded.into();
        assert_eq!(limited.category(), ErrorCategory::Transient);

        let permanent: HandlerError = NotificationError::InvalidRecipient("x".into()).into();
        assert_eq!(permanent.category(), ErrorCategory::Permanent);
        assert_eq!(permanent.message(), "Invalid recipient: x");
    }
}
