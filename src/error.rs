use thiserror::Error;

/// Result type for rate limit operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur while building a limiter or deciding a request
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Store protocol error: {0}")]
    StoreProtocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateLimitError {
    /// Whether the error came from the shared store rather than configuration
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            RateLimitError::StoreUnavailable(_) | RateLimitError::StoreProtocol(_)
        )
    }
}

impl From<redis::RedisError> for RateLimitError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            RateLimitError::StoreUnavailable(e.to_string())
        } else {
            RateLimitError::StoreProtocol(e.to_string())
        }
    }
}

impl From<config::ConfigError> for RateLimitError {
    fn from(e: config::ConfigError) -> Self {
        RateLimitError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_type_error_is_protocol_error() {
        let err: RateLimitError =
            redis::RedisError::from((redis::ErrorKind::TypeError, "Expected integer")).into();
        assert!(matches!(err, RateLimitError::StoreProtocol(_)));
        assert!(err.is_store_error());
    }

    #[test]
    fn test_redis_io_error_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: RateLimitError = redis::RedisError::from(io).into();
        assert!(matches!(err, RateLimitError::StoreUnavailable(_)));
    }

    #[test]
    fn test_config_errors_are_not_store_errors() {
        assert!(!RateLimitError::UnsupportedAlgorithm("gcra".into()).is_store_error());
        assert!(!RateLimitError::Config("limit must be positive".into()).is_store_error());
    }
}
