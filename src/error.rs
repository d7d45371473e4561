//! Error types for metaraid operations.
//!
//! Defines the error types shared across subsystems:
//! - Job store and record sink access (Redis or in-process)
//! - Catalog API fetches
//! - Configuration loading
//! - Parquet export

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the job store and the record sink.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unexpected reply from store: {0}")]
    UnexpectedReply(String),

    #[error("In-process store lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Whether the failed operation can simply be attempted again later.
    ///
    /// Only I/O against the store qualifies; serialization problems and
    /// malformed script replies will not fix themselves.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Redis(_) | Self::ConnectionFailed(_))
    }
}

/// Errors returned by a catalog client.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The credential's rate-limit retry budget is spent.
    #[error("Credential exhausted, retry after {retry_after:?}")]
    Exhausted { retry_after: Duration },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode API response: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::RequestFailed(err.to_string())
        }
    }
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors that can occur during export operations.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Malformed record '{key}': {source}")]
    MalformedRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_classification() {
        let io = redis::RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        assert!(StoreError::Redis(io).is_transient());
        assert!(StoreError::ConnectionFailed("refused".to_string()).is_transient());
        assert!(!StoreError::UnexpectedReply("nil".to_string()).is_transient());
        assert!(!StoreError::Poisoned.is_transient());

        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        assert!(!StoreError::Serialization(json_err).is_transient());
    }

    #[test]
    fn test_fetch_error_display() {
        let err = FetchError::Exhausted {
            retry_after: Duration::from_secs(120),
        };
        assert!(err.is_exhausted());
        assert!(err.to_string().contains("120"));

        let err = FetchError::Api {
            status: 404,
            message: "non existing id".to_string(),
        };
        assert!(!err.is_exhausted());
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "METARAID_REDIS_PORT".to_string(),
            message: "not a number".to_string(),
        };
        assert!(err.to_string().contains("METARAID_REDIS_PORT"));
    }
}
