//! Input extraction and validation.
//!
//! Normalizes what callers hand to `fit`/`transform` into a
//! `(feature matrix, covariate table)` pair. The feature matrix is always
//! copied, so harmonization never writes through the caller's array.

use crate::harmonization::covariates::CovariateTable;
use crate::harmonization::error::HarmonizationError;
use ndarray::Array2;
use serde_json::Value;

/// Data handed to the harmonization controller.
#[derive(Clone, Debug, PartialEq)]
pub enum HarmonizationInput {
    /// Feature matrix (`samples × features`) with its row-aligned covariates.
    Bundle {
        data: Array2<f64>,
        covariates: CovariateTable,
    },
    /// Bare feature rows identified by their position in an external
    /// covariate table (cross-validation mode, not supported).
    Indexed {
        data: Array2<f64>,
        sample_ids: Vec<usize>,
    },
}

impl HarmonizationInput {
    /// Bundle a feature matrix with its covariates.
    pub fn new(data: Array2<f64>, covariates: CovariateTable) -> Self {
        HarmonizationInput::Bundle { data, covariates }
    }

    /// Parse `{"data": [[...], ...], "covariates": {"batch": [...], ...}}`.
    pub fn from_json_str(json: &str) -> Result<Self, HarmonizationError> {
        let value: Value = serde_json::from_str(json)?;
        let object = value.as_object().ok_or_else(|| {
            HarmonizationError::InvalidInput("expected an object with data and covariates".into())
        })?;

        let data = object
            .get("data")
            .ok_or_else(|| HarmonizationError::MissingField("data".to_string()))?;
        let covariates = object
            .get("covariates")
            .ok_or_else(|| HarmonizationError::MissingField("covariates".to_string()))?;

        let rows: Vec<Vec<f64>> = serde_json::from_value(data.clone())?;
        let covariates: CovariateTable = serde_json::from_value(covariates.clone())?;
        Ok(Self::new(rows_to_array(rows)?, covariates))
    }

    /// The feature matrix.
    pub fn data(&self) -> &Array2<f64> {
        match self {
            HarmonizationInput::Bundle { data, .. } => data,
            HarmonizationInput::Indexed { data, .. } => data,
        }
    }

    /// The covariate table, if this input carries one.
    pub fn covariates(&self) -> Option<&CovariateTable> {
        match self {
            HarmonizationInput::Bundle { covariates, .. } => Some(covariates),
            HarmonizationInput::Indexed { .. } => None,
        }
    }
}

fn rows_to_array(rows: Vec<Vec<f64>>) -> Result<Array2<f64>, HarmonizationError> {
    let n_rows = rows.len();
    let n_cols = rows.first().map_or(0, Vec::len);
    if let Some(i) = rows.iter().position(|r| r.len() != n_cols) {
        return Err(HarmonizationError::InvalidInput(format!(
            "row {} has {} values, expected {}",
            i,
            rows[i].len(),
            n_cols
        )));
    }
    let flat: Vec<f64> = rows.into_iter().flatten().collect();
    Array2::from_shape_vec((n_rows, n_cols), flat)
        .map_err(|e| HarmonizationError::InvalidInput(e.to_string()))
}

fn unsupported() -> HarmonizationError {
    HarmonizationError::NotImplemented(
        "cross-validation input mode (bare feature rows without covariates)".to_string(),
    )
}

/// Copy the feature matrix and borrow the covariates.
pub(crate) fn extract(
    input: &HarmonizationInput,
) -> Result<(Array2<f64>, &CovariateTable), HarmonizationError> {
    match input {
        HarmonizationInput::Bundle { data, covariates } => Ok((data.clone(), covariates)),
        HarmonizationInput::Indexed { .. } => Err(unsupported()),
    }
}

/// Copy the feature matrix and borrow the covariates mutably.
pub(crate) fn extract_mut(
    input: &mut HarmonizationInput,
) -> Result<(Array2<f64>, &mut CovariateTable), HarmonizationError> {
    match input {
        HarmonizationInput::Bundle { data, covariates } => Ok((data.clone(), covariates)),
        HarmonizationInput::Indexed { .. } => Err(unsupported()),
    }
}

/// Reject empty or non-finite feature matrices and misaligned covariates.
pub(crate) fn check_array(
    data: &Array2<f64>,
    covariates: &CovariateTable,
) -> Result<(), HarmonizationError> {
    let (n_samples, n_features) = data.dim();
    if n_samples == 0 || n_features == 0 {
        return Err(HarmonizationError::InvalidInput(format!(
            "feature matrix has shape ({}, {}), need at least one sample and one feature",
            n_samples, n_features
        )));
    }
    if let Some(((row, col), v)) = data.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(HarmonizationError::InvalidInput(format!(
            "non-finite value {} at sample {}, feature {}",
            v, row, col
        )));
    }
    if covariates.n_samples() != n_samples {
        return Err(HarmonizationError::InvalidInput(format!(
            "{} samples in data but {} rows in covariates",
            n_samples,
            covariates.n_samples()
        )));
    }
    Ok(())
}
