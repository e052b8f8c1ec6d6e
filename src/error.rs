//! Error types for CoucheCache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur inside the cache layers.
///
/// None of these cross the public read/write surface of
/// [`CacheService`](crate::cache::CacheService): they are recorded in
/// analytics and logged. They surface from configuration loading and from
/// the store, codec and fetcher layers when those are used directly.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Durable store error
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Durable tier could not be initialized
    #[error("Durable store unavailable: {0}")]
    DurableStoreUnavailable(String),

    /// A single durable tier operation failed
    #[error("Durable {operation} failed: {reason}")]
    DurableOperationFailed { operation: String, reason: String },

    // =========================================================================
    // Encoding Errors
    // =========================================================================
    /// Payload compaction failed
    #[error("Encoding with {codec} failed: {reason}")]
    EncodingFailed { codec: String, reason: String },

    /// Payload expansion failed
    #[error("Decoding with {codec} failed: {reason}")]
    DecodingFailed { codec: String, reason: String },

    /// Serialization error (JSON rows, bincode records)
    #[error("Serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    /// Fetch capability failed
    #[error("Fetch failed for {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for a failed durable operation
    pub fn durable(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::DurableOperationFailed {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_durable_error_display() {
        let err = Error::durable("put", "disk full");
        assert_eq!(err.to_string(), "Durable put failed: disk full");
    }

    #[test]
    fn test_json_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{oops");
        let err: Error = parse.unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
