//! Error types for the query cache.
//!
//! Failures of the caller's fetch function are *not* represented here: they are
//! the caller's own typed error and are captured into
//! [`QueryState::error`](crate::state::QueryState::error).

use std::fmt;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the query cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Lookup of a key with no registered entity.
    ///
    /// This is a local programming error: callers that want find-or-create
    /// semantics use [`QueryCache::build`](crate::cache::QueryCache::build).
    NotFound(String),

    /// An entity is registered under the key, but with different data/error types.
    TypeMismatch {
        /// Canonical form of the offending key
        key: String,
    },

    /// Storage adapter failure.
    ///
    /// Always caught inside the cache: a failed read behaves as a miss, a
    /// failed write behaves as if persistence were disabled for that entry.
    StorageError(String),

    /// Encoding a value for storage failed.
    SerializationError(String),

    /// Decoding a stored payload failed.
    ///
    /// **Recovery:** the record is ignored and the query fetches live.
    DeserializationError(String),

    /// Stored record carries a bad magic header or a corrupted envelope.
    InvalidStoredEntry(String),

    /// Stored record was written with a different schema version.
    VersionMismatch {
        /// Expected schema version (from compiled code)
        expected: u32,
        /// Found schema version (from the stored record)
        found: u32,
    },

    /// Setup defect, e.g. a storage adapter used before `initialize()`.
    ///
    /// Never swallowed: it is raised to whoever assembled the client.
    ConfigError(String),

    /// Generic error with custom message.
    Other(String),
}

impl Error {
    /// Whether this error indicates a setup defect rather than a runtime condition.
    pub fn is_config(&self) -> bool {
        matches!(self, Error::ConfigError(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "Query not found: {}", key),
            Error::TypeMismatch { key } => {
                write!(f, "Query {} is registered with different types", key)
            }
            Error::StorageError(msg) => write!(f, "Storage error: {}", msg),
            Error::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Error::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Error::InvalidStoredEntry(msg) => write!(f, "Invalid stored entry: {}", msg),
            Error::VersionMismatch { expected, found } => {
                write!(
                    f,
                    "Stored record version mismatch: expected {}, found {}",
                    expected, found
                )
            }
            Error::ConfigError(msg) => write!(f, "Config error: {}", msg),
            Error::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_io() {
            Error::StorageError(e.to_string())
        } else if e.is_syntax() || e.is_eof() || e.is_data() {
            Error::DeserializationError(e.to_string())
        } else {
            Error::SerializationError(e.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StorageError(e.to_string())
    }
}

impl From<String> for Error {
    fn from(e: String) -> Self {
        Error::Other(e)
    }
}

impl From<&str> for Error {
    fn from(e: &str) -> Self {
        Error::Other(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::NotFound("[\"todos\"]".to_string());
        assert_eq!(err.to_string(), "Query not found: [\"todos\"]");

        let err = Error::VersionMismatch {
            expected: 1,
            found: 7,
        };
        assert_eq!(
            err.to_string(),
            "Stored record version mismatch: expected 1, found 7"
        );
    }

    #[test]
    fn test_error_from_string() {
        let err: Error = "test error".into();
        assert!(matches!(err, Error::Other(_)));
    }

    #[test]
    fn test_json_syntax_error_maps_to_deserialization() {
        let err = serde_json::from_str::<u32>("{not json").unwrap_err();
        assert!(matches!(Error::from(err), Error::DeserializationError(_)));
    }

    #[test]
    fn test_is_config() {
        assert!(Error::ConfigError("x".into()).is_config());
        assert!(!Error::StorageError("x".into()).is_config());
    }
}
