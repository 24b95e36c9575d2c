//! Store error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store configuration error: {0}")]
    Config(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unexpected reply from store: {0}")]
    BadReply(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("redis error: {0}")]
    Redis(#[from] deadpool_redis::redis::RedisError),

    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
}

impl StoreError {
    /// Whether this failure is safe to treat as a transient/retryable fault.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Timeout(_) | Self::Pool(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = StoreError::StoreUnavailable("connection refused".into());
        assert_eq!(err.to_string(), "store unavailable: connection refused");
    }

    #[test]
    fn test_is_transient() {
        assert!(StoreError::StoreUnavailable("x".into()).is_transient());
        assert!(StoreError::Timeout(std::time::Duration::from_secs(1)).is_transient());
        assert!(!StoreError::Config("x".into()).is_transient());
        assert!(!StoreError::BadReply("x".into()).is_transient());
    }
}
