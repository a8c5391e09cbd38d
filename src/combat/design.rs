//! Design matrix construction.
//!
//! The ComBat design is `[batch one-hot | categorical dummies | continuous]`.
//! Batch columns cover every level (they absorb the intercept); each
//! categorical covariate drops its first sorted level as the baseline.
//! Level lists are learned once at estimation time and reused verbatim when
//! applying, so new data is encoded exactly like the training cohort.

use crate::combat::error::ComBatError;
use crate::harmonization::CovariateTable;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Sorted levels of one categorical covariate. `levels[0]` is the baseline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoricalLevels {
    /// Covariate column name.
    pub column: String,
    /// Unique levels, sorted.
    pub levels: Vec<String>,
}

impl CategoricalLevels {
    fn index_of(&self, level: &str) -> Result<usize, ComBatError> {
        self.levels
            .binary_search_by(|l| l.as_str().cmp(level))
            .map_err(|_| ComBatError::UnknownCategory {
                column: self.column.clone(),
                level: level.to_string(),
            })
    }
}

/// Column layout of a ComBat design matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DesignLayout {
    /// Name of the batch column in the covariate table.
    pub batch_column: String,
    /// Unique batch labels, sorted.
    pub batch_levels: Vec<String>,
    /// Index into `batch_levels` of the reference batch (M-ComBat).
    pub ref_batch: Option<usize>,
    /// Categorical covariates with their learned levels.
    pub categorical: Vec<CategoricalLevels>,
    /// Continuous covariate names.
    pub continuous: Vec<String>,
}

fn sorted_unique(values: &[String]) -> Vec<String> {
    values
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn column_labels(covariates: &CovariateTable, name: &str) -> Result<Vec<String>, ComBatError> {
    covariates
        .labels(name)
        .ok_or_else(|| ComBatError::MissingColumn(name.to_string()))
}

impl DesignLayout {
    /// Learn batch and categorical levels from the estimation cohort.
    pub fn learn(
        covariates: &CovariateTable,
        batch_column: &str,
        categorical: &[String],
        continuous: &[String],
        ref_batch: Option<&str>,
    ) -> Result<Self, ComBatError> {
        let batch_levels = sorted_unique(&column_labels(covariates, batch_column)?);

        let ref_batch = match ref_batch {
            Some(label) => Some(
                batch_levels
                    .iter()
                    .position(|l| l == label)
                    .ok_or_else(|| ComBatError::UnknownBatch(label.to_string()))?,
            ),
            None => None,
        };

        let categorical = categorical
            .iter()
            .map(|column| {
                Ok(CategoricalLevels {
                    column: column.clone(),
                    levels: sorted_unique(&column_labels(covariates, column)?),
                })
            })
            .collect::<Result<Vec<_>, ComBatError>>()?;

        for column in continuous {
            if covariates.continuous(column).is_none() {
                return Err(ComBatError::MissingColumn(column.clone()));
            }
        }

        Ok(Self {
            batch_column: batch_column.to_string(),
            batch_levels,
            ref_batch,
            categorical,
            continuous: continuous.to_vec(),
        })
    }

    /// Number of batches.
    pub fn n_batches(&self) -> usize {
        self.batch_levels.len()
    }

    /// Number of covariate columns (dummies plus continuous).
    pub fn n_covariate_terms(&self) -> usize {
        let dummies: usize = self
            .categorical
            .iter()
            .map(|c| c.levels.len().saturating_sub(1))
            .sum();
        dummies + self.continuous.len()
    }

    /// Label of the reference batch, if any.
    pub fn ref_batch_label(&self) -> Option<&str> {
        self.ref_batch.map(|i| self.batch_levels[i].as_str())
    }

    /// Map each sample to its batch index.
    pub fn batch_indices(&self, covariates: &CovariateTable) -> Result<Vec<usize>, ComBatError> {
        column_labels(covariates, &self.batch_column)?
            .iter()
            .map(|label| {
                self.batch_levels
                    .binary_search(label)
                    .map_err(|_| ComBatError::UnknownBatch(label.clone()))
            })
            .collect()
    }

    /// Covariate part of the design, `n_samples × n_covariate_terms`.
    pub fn covariate_design(&self, covariates: &CovariateTable) -> Result<Array2<f64>, ComBatError> {
        let n = covariates.n_samples();
        let mut design = Array2::<f64>::zeros((n, self.n_covariate_terms()));
        let mut offset = 0;

        for cat in &self.categorical {
            let labels = column_labels(covariates, &cat.column)?;
            for (row, label) in labels.iter().enumerate() {
                let level = cat.index_of(label)?;
                if level > 0 {
                    design[[row, offset + level - 1]] = 1.0;
                }
            }
            offset += cat.levels.len().saturating_sub(1);
        }

        for name in &self.continuous {
            let values = covariates
                .continuous(name)
                .ok_or_else(|| ComBatError::MissingColumn(name.clone()))?;
            if let Some(row) = values.iter().position(|v| !v.is_finite()) {
                return Err(ComBatError::NonFinite(format!(
                    "covariate '{}' at row {}",
                    name, row
                )));
            }
            for (row, &v) in values.iter().enumerate() {
                design[[row, offset]] = v;
            }
            offset += 1;
        }

        Ok(design)
    }

    /// Full design `[batch one-hot | covariates]` plus per-sample batch indices.
    pub fn full_design(
        &self,
        covariates: &CovariateTable,
    ) -> Result<(Array2<f64>, Vec<usize>), ComBatError> {
        let batch_idx = self.batch_indices(covariates)?;
        let cov = self.covariate_design(covariates)?;
        let n_batches = self.n_batches();
        let n = batch_idx.len();

        let mut design = Array2::<f64>::zeros((n, n_batches + cov.ncols()));
        for (row, &b) in batch_idx.iter().enumerate() {
            design[[row, b]] = 1.0;
        }
        design
            .slice_mut(ndarray::s![.., n_batches..])
            .assign(&cov);

        Ok((design, batch_idx))
    }

    /// Check that `apply` is called with the columns used for estimation.
    pub fn check_columns(
        &self,
        batch_column: &str,
        categorical: &[String],
        continuous: &[String],
    ) -> Result<(), ComBatError> {
        if batch_column != self.batch_column {
            return Err(ComBatError::LayoutMismatch(format!(
                "batch column '{}' differs from fitted '{}'",
                batch_column, self.batch_column
            )));
        }
        let fitted_cat: Vec<&str> = self.categorical.iter().map(|c| c.column.as_str()).collect();
        let given_cat: Vec<&str> = categorical.iter().map(String::as_str).collect();
        if fitted_cat != given_cat {
            return Err(ComBatError::LayoutMismatch(format!(
                "categorical covariates {:?} differ from fitted {:?}",
                given_cat, fitted_cat
            )));
        }
        if continuous != self.continuous.as_slice() {
            return Err(ComBatError::LayoutMismatch(format!(
                "continuous covariates {:?} differ from fitted {:?}",
                continuous, self.continuous
            )));
        }
        Ok(())
    }
}
