//! Error types for the Convoscope pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors that can occur while ingesting, processing or serving transcripts.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Missing or malformed request field. Surfaced to the caller, never fatal.
    #[error("{0}")]
    Validation(String),

    /// Extraction engine or relevance gate failed for a user.
    #[error("{stage} failed for user {user_id}: {message}")]
    Upstream {
        stage: &'static str,
        user_id: String,
        message: String,
    },

    /// Transient: the store is not initialised or cannot be reached right now.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Resource missing: {0}")]
    ResourceMissing(String),

    #[error("Store error: {0}")]
    Store(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Uploaded custom data does not match the CSV schema.
    #[error("{0}")]
    Csv(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl PipelineError {
    /// Validation error naming the missing request field, e.g. `no userId in request`.
    pub fn missing_field(field: &str) -> Self {
        PipelineError::Validation(format!("no {} in request", field))
    }

    pub fn upstream(stage: &'static str, user_id: &str, err: impl std::fmt::Display) -> Self {
        PipelineError::Upstream {
            stage,
            user_id: user_id.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, PipelineError::Validation(_) | PipelineError::Csv(_))
    }

    /// Transient errors are retried on the next cycle and are not logged as failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::StoreUnavailable(_))
    }
}
