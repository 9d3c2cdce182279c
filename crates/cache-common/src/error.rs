//! Error types for the block cache stack.

use thiserror::Error;

/// Result type alias using CacheError.
pub type CacheResult<T> = Result<T, CacheError>;

/// Primary error type for cached file access.
///
/// Errors are `Clone` because a single failed backend fetch is delivered to
/// every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    // === Resolution Errors ===
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Remote content changed: {0}")]
    StaleContent(String),

    // === Transport Errors ===
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    // === Data Errors ===
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Range {offset}+{len} is outside file of {file_len} bytes")]
    InvalidRange { offset: u64, len: u64, file_len: u64 },

    // === Infrastructure Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn stale(msg: impl Into<String>) -> Self {
        Self::StaleContent(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if the backend that produced this error is obsolete and the file
    /// must be resolved again before retrying.
    pub fn is_stale(&self) -> bool {
        matches!(self, CacheError::StaleContent(_))
    }

    /// Whether a caller may reasonably retry the same request later.
    ///
    /// This layer never retries these itself; it only recovers from
    /// [`CacheError::StaleContent`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::Timeout(_) | CacheError::Network(_) | CacheError::StaleContent(_)
        )
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => CacheError::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => CacheError::Timeout(err.to_string()),
            _ => CacheError::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: CacheError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, CacheError::NotFound(_)));

        let err: CacheError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope").into();
        assert!(matches!(err, CacheError::Io(_)));
    }

    #[test]
    fn test_retry_classification() {
        assert!(CacheError::stale("etag changed").is_stale());
        assert!(CacheError::stale("etag changed").is_retryable());
        assert!(CacheError::Timeout("get".into()).is_retryable());
        assert!(!CacheError::not_found("x").is_retryable());
        assert!(!CacheError::InvalidFormat("bad header".into()).is_stale());
    }

    #[test]
    fn test_invalid_range_message() {
        let err = CacheError::InvalidRange {
            offset: 10,
            len: 20,
            file_len: 15,
        };
        assert_eq!(err.to_string(), "Range 10+20 is outside file of 15 bytes");
    }
}
