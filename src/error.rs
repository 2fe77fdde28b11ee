//! Error and Result types for Giles operations.

use std::io;
use thiserror::Error;

/// Result type alias for Giles operations
pub type Result<T> = std::result::Result<T, GilesError>;

/// Main error type for Giles
#[derive(Debug, Error)]
pub enum GilesError {
    /// The query string is malformed. Carries the byte offset and the offending token.
    #[error("Parse error at position {position} near {token:?}: {message}")]
    Parse { position: usize, token: String, message: String },

    /// A WHERE clause could not be evaluated against the metadata store.
    #[error("Resolve error: {0}")]
    Resolve(String),

    /// An ingested message is malformed.
    #[error("Ingest error: {0}")]
    Ingest(String),

    /// The time-series engine failed during a request.
    #[error("Time-series engine error: {0}")]
    TransientEngine(String),

    /// The connection factory keeps failing past the back-off ceiling.
    #[error("Connection pool exhausted: {0}")]
    PoolExhaustion(String),

    /// The process cannot start.
    #[error("Startup error: {0}")]
    FatalStartup(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation is not provided by this backend.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// The subscriber went away before the broker could deliver to it.
    #[error("Subscriber closed")]
    SubscriberClosed,

    /// Wire or snapshot encoding failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GilesError {
    /// Builds a parse error for the token found at `position`.
    pub fn parse(position: usize, token: impl Into<String>, message: impl Into<String>) -> Self {
        GilesError::Parse { position, token: token.into(), message: message.into() }
    }

    /// True for errors caused by the caller's input rather than by a backend.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GilesError::Parse { .. } | GilesError::Ingest(_) | GilesError::Unsupported(_)
        )
    }
}

impl From<bincode::Error> for GilesError {
    fn from(err: bincode::Error) -> Self {
        GilesError::Codec(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GilesError::parse(7, "wher", "expected WHERE");
        assert_eq!(err.to_string(), "Parse error at position 7 near \"wher\": expected WHERE");
    }

    #[test]
    fn test_client_errors() {
        assert!(GilesError::Ingest("missing uuid".into()).is_client_error());
        assert!(!GilesError::TransientEngine("reset".into()).is_client_error());
    }
}
