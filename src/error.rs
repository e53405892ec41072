//! Error types for convstore
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for convstore operations
///
/// This enum encompasses all possible errors that can occur while
/// loading configuration, opening a backend, and persisting or querying
/// conversation records.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A conversation with the given ID does not exist
    ///
    /// Distinct from I/O and serialization failures so callers can
    /// check for it with [`is_not_found`].
    #[error("conversation not found: {0}")]
    NotFound(String),

    /// Storage engine errors (database open, transaction, lock timeout)
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for convstore operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Returns true if the error chain contains [`StoreError::NotFound`]
///
/// # Examples
///
/// ```
/// use convstore::error::{is_not_found, StoreError};
///
/// let err = anyhow::Error::new(StoreError::NotFound("abc".to_string()));
/// assert!(is_not_found(&err));
/// ```
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<StoreError>(),
            Some(StoreError::NotFound(_))
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_display() {
        let error = StoreError::Config("invalid format".to_string());
        assert_eq!(error.to_string(), "Configuration error: invalid format");
    }

    #[test]
    fn test_not_found_error_display() {
        let error = StoreError::NotFound("20240708T150405-abc123".to_string());
        assert_eq!(
            error.to_string(),
            "conversation not found: 20240708T150405-abc123"
        );
    }

    #[test]
    fn test_storage_error_display() {
        let error = StoreError::Storage("database connection failed".to_string());
        assert_eq!(
            error.to_string(),
            "Storage error: database connection failed"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: StoreError = io_error.into();
        assert!(matches!(error, StoreError::Io(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_str = "{invalid json}";
        let json_error = serde_json::from_str::<serde_json::Value>(json_str).unwrap_err();
        let error: StoreError = json_error.into();
        assert!(matches!(error, StoreError::Serialization(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_str = "invalid: : yaml";
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>(yaml_str).unwrap_err();
        let error: StoreError = yaml_error.into();
        assert!(matches!(error, StoreError::Yaml(_)));
    }

    #[test]
    fn test_is_not_found_matches_wrapped_error() {
        let err = anyhow::Error::new(StoreError::NotFound("x".to_string()))
            .context("failed to load conversation");
        assert!(is_not_found(&err));
    }

    #[test]
    fn test_is_not_found_rejects_other_errors() {
        let err = anyhow::Error::new(StoreError::Storage("locked".to_string()));
        assert!(!is_not_found(&err));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<StoreError>();
    }
}
