//! Error types for ComBat estimation and application.

use thiserror::Error;

/// Error type for ComBat operations.
#[derive(Debug, Error)]
pub enum ComBatError {
    /// Shape mismatch between data and covariates.
    #[error("Invalid shape: expected {expected}, got {got}")]
    InvalidShape { expected: String, got: String },
    /// Feature count differs from the one the estimates were fitted on.
    #[error("Feature mismatch: expected {expected_features} features, got {got_features}")]
    FeatureMismatch {
        expected_features: usize,
        got_features: usize,
    },
    /// Empty data provided where non-empty was required.
    #[error("Empty data: {0}")]
    EmptyData(String),
    /// Covariate column not present (or of the wrong kind).
    #[error("Missing covariate column: {0}")]
    MissingColumn(String),
    /// Batch label not seen during estimation.
    #[error("Unknown batch '{0}' (not present when parameters were estimated)")]
    UnknownBatch(String),
    /// Categorical level not seen during estimation.
    #[error("Unknown level '{level}' in categorical covariate '{column}'")]
    UnknownCategory { column: String, level: String },
    /// Columns passed to `apply` differ from the ones used for estimation.
    #[error("Design mismatch: {0}")]
    LayoutMismatch(String),
    /// ComBat needs at least two batches.
    #[error("At least two batches are required, got {0}")]
    TooFewBatches(usize),
    /// A batch has too few samples for a variance estimate.
    #[error("Batch '{batch}' has {n_samples} sample(s), at least 2 are required")]
    TooFewSamples { batch: String, n_samples: usize },
    /// Data contains NaN or infinite values.
    #[error("Non-finite values: {0}")]
    NonFinite(String),
    /// Numerical failure (singular design, zero variance...).
    #[error("Numerical error: {0}")]
    Numerical(String),
    /// Empirical Bayes iteration did not converge.
    #[error("Empirical Bayes did not converge for batch '{batch}' after {iterations} iterations")]
    Convergence { batch: String, iterations: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_unknown_category() {
        let err = ComBatError::UnknownCategory {
            column: "sex".to_string(),
            level: "X".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown level 'X' in categorical covariate 'sex'");
    }

    #[test]
    fn test_error_display_too_few_samples() {
        let err = ComBatError::TooFewSamples {
            batch: "site3".to_string(),
            n_samples: 1,
        };
        assert!(err.to_string().contains("site3"));
    }
}
