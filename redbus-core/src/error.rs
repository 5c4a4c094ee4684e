use thiserror::Error;

/// Error taxonomy for the messaging runtime.
///
/// Everything below the domain-service layer propagates these upward;
/// services translate them into structured results for callers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Rate limit exceeded. Try again in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Message of {size} bytes exceeds maximum of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Circuit breaker is open")]
    BreakerOpen,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Shutdown in progress")]
    Shutdown,
}

impl Error {
    /// Whether the retry manager may re-attempt the failed operation.
    ///
    /// Validation, size, and rate-limit failures are deterministic and
    /// never retried. Breaker-open fails fast by definition.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Publish(_) | Self::Subscribe(_) | Self::Timeout(_) => true,
            Self::Redis(e) => {
                e.is_timeout()
                    || e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::Connect("refused".into()).is_retryable());
        assert!(Error::Publish("reset".into()).is_retryable());
        assert!(Error::Timeout("publish".into()).is_retryable());

        assert!(!Error::Validation("missing field".into()).is_retryable());
        assert!(!Error::RateLimited { retry_after_secs: 30 }.is_retryable());
        assert!(!Error::TooLarge { size: 2048, max: 1024 }.is_retryable());
        assert!(!Error::BreakerOpen.is_retryable());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::TooLarge { size: 2048, max: 1024 };
        assert_eq!(err.to_string(), "Message of 2048 bytes exceeds maximum of 1024");

        let err = Error::RateLimited { retry_after_secs: 12 };
        assert!(err.to_string().contains("12s"));
    }
}
