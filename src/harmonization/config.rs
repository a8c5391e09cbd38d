//! Harmonization configuration.
//!
//! Feature groups are kept in declaration order: that order drives both the
//! estimation sequence and the column layout of the harmonized output.
//!
//! ```
//! use combat_harmonize::harmonization::{FeatureGroup, HarmonizationConfig};
//!
//! let config = HarmonizationConfig::new()
//!     .with_ref_batch("site_1")
//!     .with_feature_group(
//!         FeatureGroup::new("thickness", vec![0, 1, 2])
//!             .with_categorical(["sex"])
//!             .with_continuous(["age"]),
//!     )
//!     .with_feature_group(
//!         FeatureGroup::new("volumes", vec![3, 4])
//!             .with_categorical(["sex"])
//!             .with_continuous(["age", "tiv"]),
//!     );
//! assert!(config.validate(Some(5)).is_ok());
//! ```

use crate::combat::ComBatOptions;
use crate::harmonization::covariates::CovariateTable;
use crate::harmonization::error::HarmonizationError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

fn owned<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Vec<String> {
    names.into_iter().map(Into::into).collect()
}

/// A named set of feature columns harmonized together.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureGroup {
    /// Group name, also the key of its fitted estimate.
    pub name: String,
    /// Column indices into the feature matrix.
    pub columns: Vec<usize>,
    /// Categorical biological covariates to preserve.
    #[serde(default)]
    pub categorical: Vec<String>,
    /// Continuous biological covariates to preserve.
    #[serde(default)]
    pub continuous: Vec<String>,
}

impl FeatureGroup {
    /// Create a group without covariates.
    pub fn new(name: impl Into<String>, columns: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            columns,
            categorical: Vec::new(),
            continuous: Vec::new(),
        }
    }

    /// Set the categorical covariates.
    pub fn with_categorical<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.categorical = owned(names);
        self
    }

    /// Set the continuous covariates.
    pub fn with_continuous<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.continuous = owned(names);
        self
    }
}

/// A derived covariate (a "global" such as total intracranial volume) that
/// is harmonized before the feature groups that use it as a covariate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoInterestSpec {
    /// Continuous covariate column to harmonize.
    pub column: String,
    /// Feature columns estimated jointly with the covariate.
    #[serde(default)]
    pub feature_columns: Vec<usize>,
    #[serde(default)]
    pub categorical: Vec<String>,
    #[serde(default)]
    pub continuous: Vec<String>,
}

impl NoInterestSpec {
    /// Harmonize `column` jointly with the given feature columns.
    pub fn new(column: impl Into<String>, feature_columns: Vec<usize>) -> Self {
        Self {
            column: column.into(),
            feature_columns,
            categorical: Vec::new(),
            continuous: Vec::new(),
        }
    }

    /// Set the categorical covariates.
    pub fn with_categorical<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.categorical = owned(names);
        self
    }

    /// Set the continuous covariates.
    pub fn with_continuous<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.continuous = owned(names);
        self
    }
}

/// Cross-validation input mode: bare feature rows matched to an external
/// covariate table. Accepted by the configuration but not supported.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CvMethod {
    pub covariates: CovariateTable,
}

/// Configuration of a [`ComBatHarmonization`](crate::harmonization::ComBatHarmonization).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonizationConfig {
    /// Batch/site column in the covariate table.
    pub batch_column: String,
    /// Reference batch for M-ComBat, `None` for standard ComBat.
    pub ref_batch: Option<String>,
    /// Return `{data, covariates}` from `transform` instead of data alone.
    pub regression_fit: bool,
    /// Features of interest, harmonized group by group.
    pub feature_groups: Vec<FeatureGroup>,
    /// Optional covariate harmonized before the feature groups.
    pub no_interest: Option<NoInterestSpec>,
    /// ComBat adjustment options shared by every estimation.
    pub combat: ComBatOptions,
    /// Cross-validation mode (not supported).
    pub cv_method: Option<CvMethod>,
}

impl Default for HarmonizationConfig {
    fn default() -> Self {
        Self {
            batch_column: "batch".to_string(),
            ref_batch: None,
            regression_fit: false,
            feature_groups: Vec::new(),
            no_interest: None,
            combat: ComBatOptions::default(),
            cv_method: None,
        }
    }
}

impl HarmonizationConfig {
    /// Create a configuration with default settings and no groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the batch column name.
    pub fn with_batch_column(mut self, column: impl Into<String>) -> Self {
        self.batch_column = column.into();
        self
    }

    /// Align every batch to this reference batch (M-ComBat).
    pub fn with_ref_batch(mut self, batch: impl Into<String>) -> Self {
        self.ref_batch = Some(batch.into());
        self
    }

    /// Return harmonized data together with the covariate table.
    pub fn with_regression_fit(mut self, regression_fit: bool) -> Self {
        self.regression_fit = regression_fit;
        self
    }

    /// Append a feature group.
    pub fn with_feature_group(mut self, group: FeatureGroup) -> Self {
        self.feature_groups.push(group);
        self
    }

    /// Harmonize a derived covariate first.
    pub fn with_no_interest(mut self, spec: NoInterestSpec) -> Self {
        self.no_interest = Some(spec);
        self
    }

    /// Set the ComBat options.
    pub fn with_combat_options(mut self, options: ComBatOptions) -> Self {
        self.combat = options;
        self
    }

    /// Set a cross-validation mode.
    pub fn with_cv_method(mut self, cv_method: CvMethod) -> Self {
        self.cv_method = Some(cv_method);
        self
    }

    /// Parse a configuration from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, HarmonizationError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the configuration to pretty JSON.
    pub fn to_json_string(&self) -> Result<String, HarmonizationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration.
    ///
    /// Column bounds are only checked when `n_features` is known.
    pub fn validate(&self, n_features: Option<usize>) -> Result<(), HarmonizationError> {
        if self.cv_method.is_some() {
            return Err(HarmonizationError::NotImplemented(
                "cross-validation input mode".to_string(),
            ));
        }
        if self.batch_column.is_empty() {
            return Err(HarmonizationError::InvalidConfig(
                "batch column name is empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut claimed = HashSet::new();
        for group in &self.feature_groups {
            if group.name.is_empty() {
                return Err(HarmonizationError::InvalidConfig(
                    "feature group name is empty".to_string(),
                ));
            }
            if !names.insert(group.name.as_str()) {
                return Err(HarmonizationError::InvalidConfig(format!(
                    "duplicate feature group '{}'",
                    group.name
                )));
            }
            if group.columns.is_empty() {
                return Err(HarmonizationError::InvalidConfig(format!(
                    "feature group '{}' has no columns",
                    group.name
                )));
            }
            for &col in &group.columns {
                check_bounds(col, n_features, &group.name)?;
                if !claimed.insert(col) {
                    return Err(HarmonizationError::InvalidConfig(format!(
                        "column {} is claimed twice (last by group '{}')",
                        col, group.name
                    )));
                }
            }
        }

        if let Some(spec) = &self.no_interest {
            if spec.column.is_empty() {
                return Err(HarmonizationError::InvalidConfig(
                    "covariate of no interest has an empty name".to_string(),
                ));
            }
            if spec.column == self.batch_column
                || spec.categorical.contains(&spec.column)
                || spec.continuous.contains(&spec.column)
            {
                return Err(HarmonizationError::InvalidConfig(format!(
                    "covariate '{}' cannot be harmonized while also used as its own covariate",
                    spec.column
                )));
            }
            let mut seen = HashSet::new();
            for &col in &spec.feature_columns {
                check_bounds(col, n_features, &spec.column)?;
                if !seen.insert(col) {
                    return Err(HarmonizationError::InvalidConfig(format!(
                        "column {} listed twice for covariate '{}'",
                        col, spec.column
                    )));
                }
            }
        }

        Ok(())
    }
}

fn check_bounds(col: usize, n_features: Option<usize>, owner: &str) -> Result<(), HarmonizationError> {
    match n_features {
        Some(n) if col >= n => Err(HarmonizationError::InvalidConfig(format!(
            "column index {} of '{}' out of bounds for {} features",
            col, owner, n
        ))),
        _ => Ok(()),
    }
}
