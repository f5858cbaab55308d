//! Error types for the detector pipeline.

use thiserror::Error;

/// A record that cannot enter the pipeline.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InputError {
    #[error("no numeric features present in event")]
    Empty,

    #[error("expected a JSON object of feature values")]
    NotAnObject,

    #[error("row has {values} values but {columns} column names were given")]
    UnknownFeatureShape { columns: usize, values: usize },
}

/// Everything that can go wrong while building, running or restoring a pipeline.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error("snapshot does not match configuration: {field} expected {expected}, found {found}")]
    StateMismatch {
        field: &'static str,
        expected: String,
        found: String,
    },

    #[error("insufficient data: required {required}, got {got}")]
    InsufficientData { required: usize, got: usize },

    #[error("invalid configuration: {name} - {reason}")]
    InvalidConfig { name: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("pipeline lock poisoned by a panicked writer")]
    LockPoisoned,
}

impl DetectorError {
    pub(crate) fn mismatch(
        field: &'static str,
        expected: impl ToString,
        found: impl ToString,
    ) -> Self {
        DetectorError::StateMismatch {
            field,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        DetectorError::InvalidConfig {
            name,
            reason: reason.into(),
        }
    }
}

/// Result type for detector operations.
pub type Result<T> = std::result::Result<T, DetectorError>;
