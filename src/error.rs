//! Application-wide error types.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Metadata for id {id} is corrupt: {reason}")]
    CorruptMetadata { id: String, reason: String },

    #[error("Content-Type '{0}' not supported")]
    UnsupportedType(String),

    #[error("Image is larger than {0}MB")]
    TooLarge(u64),

    #[error("Quality probe timed out")]
    ProbeTimeout,

    #[error("Quality probe failed: {0}")]
    ProbeFailed(String),

    #[error("Transformation timeout")]
    TransformTimeout,

    #[error("Transformation failed: {0}")]
    TransformFailed(i32),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn corrupt_metadata(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptMetadata {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
