// ⚠️ Error Types - one enum for every ETL stage
// Connectors, loader and scheduler share it so retry decisions can be made
// on the error itself instead of on strings.

use crate::source::Source;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for warehouse operations
pub type Result<T> = std::result::Result<T, EtlError>;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },

    #[error("Could not decode {origin} payload: {reason}")]
    Decode { origin: Source, reason: String },

    #[error("Ambiguous mapping for {key}: claimed by items {first} and {second}")]
    AmbiguousMapping {
        key: String,
        first: i64,
        second: i64,
    },

    #[error("Invalid schedule '{expression}': {reason}")]
    Schedule { expression: String, reason: String },

    #[error("Reconciliation failed for {origin}: {summary}")]
    Reconciliation { origin: Source, summary: String },

    #[error("{origin} pagination exceeded {max_pages} pages")]
    PageLimit { origin: Source, max_pages: usize },

    #[error("Warehouse connection lock poisoned by a panicked task")]
    LockPoisoned,

    /// A transient failure that already used up its retries
    #[error("{last} (gave up after {attempts} attempts)")]
    RetriesExhausted { attempts: u32, last: Box<EtlError> },
}

impl EtlError {
    pub fn decode(origin: Source, reason: impl Into<String>) -> Self {
        EtlError::Decode {
            origin,
            reason: reason.into(),
        }
    }

    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            EtlError::Network(_) | EtlError::RateLimited { .. } => true,
            EtlError::HttpStatus { status, .. } => *status == 408 || *status >= 500,
            EtlError::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Server-requested delay before the next attempt, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EtlError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for EtlError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => EtlError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => EtlError::Network(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for EtlError {
    fn from(err: config::ConfigError) -> Self {
        EtlError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(EtlError::Network("connection reset".to_string()).is_retryable());
        assert!(EtlError::HttpStatus { status: 503, url: String::new() }.is_retryable());
        assert!(EtlError::HttpStatus { status: 408, url: String::new() }.is_retryable());
        assert!(!EtlError::HttpStatus { status: 401, url: String::new() }.is_retryable());
        assert!(!EtlError::HttpStatus { status: 404, url: String::new() }.is_retryable());
        assert!(!EtlError::decode(Source::Square, "missing id").is_retryable());
    }

    #[test]
    fn test_exhausted_retries_are_final() {
        let err = EtlError::RetriesExhausted {
            attempts: 4,
            last: Box::new(EtlError::HttpStatus { status: 503, url: "https://example.test".to_string() }),
        };

        assert!(!err.is_retryable());
        assert!(err.to_string().contains("HTTP 503"));
        assert!(err.to_string().contains("after 4 attempts"));
    }

    #[test]
    fn test_rate_limited_carries_delay() {
        let err = EtlError::RateLimited {
            url: "https://example.test".to_string(),
            retry_after: Some(Duration::from_secs(3)),
        };

        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(EtlError::Config("x".to_string()).retry_after(), None);
    }
}
