//! Harmonization of a covariate of no interest.
//!
//! Globals such as total intracranial volume are measured from the same
//! images as the features, so they carry the same site effects. They are
//! harmonized jointly with a few feature columns (the covariate is appended
//! as one extra feature) before being used as a covariate downstream.
//!
//! Estimation never writes back: only the apply phase overwrites the
//! covariate column, so `fit` followed by `transform` on the same data
//! harmonizes the global exactly once.

use crate::combat::{self, ComBatOptions};
use crate::harmonization::config::NoInterestSpec;
use crate::harmonization::covariates::CovariateTable;
use crate::harmonization::error::HarmonizationError;
use crate::harmonization::store::{ParameterStore, StoreKey};
use ndarray::{concatenate, Array2, Axis};
use tracing::debug;

pub(crate) struct NoInterestHarmonizer<'a> {
    pub spec: &'a NoInterestSpec,
    pub batch_column: &'a str,
    pub ref_batch: Option<&'a str>,
    pub options: &'a ComBatOptions,
}

impl<'a> NoInterestHarmonizer<'a> {
    pub fn key(&self) -> StoreKey {
        StoreKey::covariate(&self.spec.column)
    }

    /// `samples × (feature_columns + 1)`, the covariate in the last column.
    fn joint_matrix(
        &self,
        x: &Array2<f64>,
        covariates: &CovariateTable,
    ) -> Result<Array2<f64>, HarmonizationError> {
        let values = match covariates.column(&self.spec.column) {
            None => return Err(HarmonizationError::MissingField(self.spec.column.clone())),
            Some(_) => covariates.continuous(&self.spec.column).ok_or_else(|| {
                HarmonizationError::InvalidInput(format!(
                    "covariate of no interest '{}' must be continuous",
                    self.spec.column
                ))
            })?,
        };

        let features = x.select(Axis(1), &self.spec.feature_columns);
        let covariate = Array2::from_shape_vec((values.len(), 1), values.to_vec())
            .map_err(|e| HarmonizationError::InvalidInput(e.to_string()))?;
        concatenate(Axis(1), &[features.view(), covariate.view()])
            .map_err(|e| HarmonizationError::InvalidInput(e.to_string()))
    }

    /// Estimate parameters for the joint matrix and store them.
    pub fn estimate(
        &self,
        x: &Array2<f64>,
        covariates: &CovariateTable,
        store: &mut ParameterStore,
    ) -> Result<(), HarmonizationError> {
        let joint = self.joint_matrix(x, covariates)?;
        debug!(
            covariate = %self.spec.column,
            n_joint_features = joint.ncols(),
            "estimating covariate of no interest"
        );
        let estimation = combat::estimate(
            &joint.t(),
            covariates,
            self.batch_column,
            &self.spec.categorical,
            &self.spec.continuous,
            self.ref_batch,
            self.options,
        )?;
        store.insert(self.key(), estimation.estimates);
        Ok(())
    }

    /// Harmonize the covariate with stored parameters and write it back.
    pub fn apply(
        &self,
        x: &Array2<f64>,
        covariates: &mut CovariateTable,
        store: &ParameterStore,
    ) -> Result<(), HarmonizationError> {
        let estimates = store.get(&self.key())?;
        let joint = self.joint_matrix(x, covariates)?;
        debug!(covariate = %self.spec.column, "applying covariate of no interest");

        let harmonized = combat::apply(
            &joint.t(),
            covariates,
            self.batch_column,
            &self.spec.categorical,
            &self.spec.continuous,
            estimates,
        )?;
        let last = harmonized.nrows() - 1;
        let values = harmonized.row(last).to_vec();
        covariates.set_continuous(&self.spec.column, values)
    }
}
