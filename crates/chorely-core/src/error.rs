//! Error types shared across Chorely crates.

use thiserror::Error;

/// All errors that can surface from Chorely.
#[derive(Debug, Error)]
pub enum ChorelyError {
    /// Configuration could not be read or parsed.
    #[error("Config error: {0}")]
    Config(String),

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A recurrence expression that can't produce a next trigger time.
    #[error("Invalid recurrence '{expression}': {reason}")]
    InvalidRecurrence { expression: String, reason: String },

    /// Caller supplied a value outside the accepted range.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Delivery transport failure.
    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChorelyError {
    pub fn invalid_recurrence(expression: &str, reason: impl Into<String>) -> Self {
        Self::InvalidRecurrence {
            expression: expression.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for Chorely operations.
pub type Result<T> = std::result::Result<T, ChorelyError>;
