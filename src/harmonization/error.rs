//! Error types for harmonization operations.

use crate::combat::ComBatError;
use thiserror::Error;

/// Error type for the harmonization controller and its stages.
#[derive(Debug, Error)]
pub enum HarmonizationError {
    /// `transform` was called before `fit`.
    #[error("Not fitted: call fit before transform")]
    NotFitted,
    /// Requested mode exists in the interface but is not supported.
    #[error("Not implemented: {0}")]
    NotImplemented(String),
    /// Malformed feature matrix or covariate table.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// A required field or column is absent.
    #[error("Missing field: {0}")]
    MissingField(String),
    /// Invalid harmonization configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// No stored estimate for a feature group or covariate.
    #[error("No fitted estimate for {0}")]
    MissingEstimate(String),
    /// Feature dimension differs from the one seen during fit.
    #[error("Feature mismatch: expected {expected_features} features, got {got_features}")]
    FeatureMismatch {
        expected_features: usize,
        got_features: usize,
    },
    /// Failure inside ComBat estimation or application.
    #[error(transparent)]
    ComBat(#[from] ComBatError),
    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// CSV parsing error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<bincode::Error> for HarmonizationError {
    fn from(err: bincode::Error) -> Self {
        HarmonizationError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for HarmonizationError {
    fn from(err: serde_json::Error) -> Self {
        HarmonizationError::Serialization(err.to_string())
    }
}
