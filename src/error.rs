// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the relay.
//!
//! Errors are categorized by how the capture loop must react to them, not
//! only by where they came from.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Connection` | Yes | Store unreachable (fatal while starting, retried for applies/saves) |
//! | `Redis` | Depends | Redis command error; connection-class failures are retryable |
//! | `ResumeUnavailable` | No | Checkpoint older than the feed's retention window |
//! | `DuplicateKey` | No | Key already present; benign, treated as a skip |
//! | `Apply` | No | Document could not be applied (event stays unacknowledged) |
//! | `CheckpointStore` | No | Local SQLite errors (needs operator attention) |
//! | `FeedParse` | No | Malformed change event |
//! | `Decompression` | No | Corrupt compressed payload |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Store handle already released |
//! | `Internal` | No | Unexpected internal error |

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors that can occur while relaying changes.
#[derive(Error, Debug)]
pub enum RelayError {
    /// A store could not be reached.
    ///
    /// Fatal while the capture loop is starting; retried with backoff for
    /// applies and checkpoint saves.
    #[error("Connection error ({store}): {message}")]
    Connection { store: String, message: String },

    /// Redis command error.
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// The change feed can no longer resume from the requested position.
    ///
    /// Restarting from "now" would silently skip data, so this always
    /// requires operator intervention (resync).
    #[error("Cannot resume change feed from {position}: {message}")]
    ResumeUnavailable { position: String, message: String },

    /// A document with this key already exists at the destination.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Any other failure applying a document to the destination.
    #[error("Apply failed for key {key}: {message}")]
    Apply { key: String, message: String },

    /// SQLite error during checkpoint persistence.
    #[error("Checkpoint store error: {0}")]
    CheckpointStore(#[from] sqlx::Error),

    /// A change event had an unexpected shape.
    #[error("Feed parse error: {0}")]
    FeedParse(String),

    /// Compressed payload could not be decoded.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The store handle was released; retrying on it can't succeed.
    #[error("Store {0} has been shut down")]
    Shutdown(String),

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a connection error for a named store.
    pub fn connection(store: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Create a Redis error from a redis::RedisError
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without source
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create an apply error for a document key.
    pub fn apply(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Apply {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Redis { source, .. } => match source {
                Some(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
                // Without a source we can't tell, and Redis blips are usually transient
                None => true,
            },
            Self::ResumeUnavailable { .. } => false,
            Self::DuplicateKey(_) => false,
            Self::Apply { .. } => false,
            Self::CheckpointStore(_) => false, // Local DB issues need attention
            Self::FeedParse(_) => false,
            Self::Decompression(_) => false,
            Self::Config(_) => false,
            Self::Shutdown(_) => false,
            Self::Internal(_) => false,
        }
    }

    /// Check if this error is a benign "already there" outcome.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::DuplicateKey(_))
    }

    /// Check if this error, raised by a change feed, means the feed itself
    /// is unusable and the capture loop must stop.
    pub fn is_fatal_for_feed(&self) -> bool {
        !matches!(self, Self::FeedParse(_) | Self::Decompression(_))
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_connection() {
        let err = RelayError::connection("destination", "connection refused");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("destination"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_is_retryable_redis_without_source() {
        let err = RelayError::redis_msg("XREAD", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XREAD"));
    }

    #[test]
    fn test_redis_type_error_not_retryable() {
        let source = redis::RedisError::from((redis::ErrorKind::TypeError, "bad reply"));
        let err = RelayError::redis("GET", source);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_resume_unavailable() {
        let err = RelayError::ResumeUnavailable {
            position: "100-0".to_string(),
            message: "oldest retained is 200-0".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_fatal_for_feed());
        assert!(err.to_string().contains("100-0"));
    }

    #[test]
    fn test_duplicate_key_is_benign() {
        let err = RelayError::DuplicateKey("a1".to_string());
        assert!(err.is_benign());
        assert!(!err.is_retryable());
        assert!(!RelayError::apply("a1", "boom").is_benign());
    }

    #[test]
    fn test_apply_error_formatting() {
        let err = RelayError::apply("a1", "document has no _id");
        let msg = err.to_string();
        assert!(msg.contains("a1"));
        assert!(msg.contains("no _id"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_parse_errors_not_fatal_for_feed() {
        assert!(!RelayError::FeedParse("missing op".into()).is_fatal_for_feed());
        assert!(!RelayError::Decompression("bad frame".into()).is_fatal_for_feed());
        assert!(RelayError::connection("source", "down").is_fatal_for_feed());
    }

    #[test]
    fn test_not_retryable_misc() {
        assert!(!RelayError::Config("empty marker".into()).is_retryable());
        assert!(!RelayError::Shutdown("atlas".into()).is_retryable());
        assert!(!RelayError::Internal("bug".into()).is_retryable());
    }

    #[test]
    fn test_shutdown_formatting() {
        let err = RelayError::Shutdown("atlas".to_string());
        assert_eq!(err.to_string(), "Store atlas has been shut down");
        assert!(err.is_fatal_for_feed());
    }

    #[test]
    fn test_sqlx_error_converts() {
        let err: RelayError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, RelayError::CheckpointStore(_)));
        assert!(!err.is_retryable());
    }
}
