//! Store error types

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for every backend behind the store facade
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Opening or closing the backend failed; the instance must not be reused
    #[error("Connection error: {0}")]
    Connection(String),

    /// The backend rejected an operation; the payload is the backend's own message
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Unsupported pattern: {0}")]
    UnsupportedPattern(String),

    /// A non-atomic bulk call stopped part way through. Operations before
    /// `applied` are committed and are not rolled back.
    #[error("Bulk failed after {applied} of {total} operations: {source}")]
    PartialBulk {
        applied: usize,
        total: usize,
        #[source]
        source: Box<StoreError>,
    },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Database not initialized")]
    NotInitialized,

    #[error("Database already initialized")]
    AlreadyInitialized,

    #[error("Database is closed")]
    Closed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Number of bulk operations known to be committed when this error was raised
    pub fn applied(&self) -> Option<usize> {
        match self {
            StoreError::PartialBulk { applied, .. } => Some(*applied),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
