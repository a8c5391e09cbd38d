//! Per-group harmonization of feature columns.
//!
//! Each configured group selects a subset of columns of the feature matrix
//! and is harmonized independently with its own covariate lists. Outputs
//! are concatenated in group order, so the output column order follows the
//! configuration rather than the input.

use crate::combat::{self, ComBatOptions};
use crate::harmonization::config::FeatureGroup;
use crate::harmonization::covariates::CovariateTable;
use crate::harmonization::error::HarmonizationError;
use crate::harmonization::store::{ParameterStore, StoreKey};
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use tracing::debug;

pub(crate) struct FeatureGroupHarmonizer<'a> {
    pub groups: &'a [FeatureGroup],
    pub batch_column: &'a str,
    pub ref_batch: Option<&'a str>,
    pub options: &'a ComBatOptions,
}

/// Copy the group's columns out as `features × samples`.
fn group_columns(x: &Array2<f64>, group: &FeatureGroup) -> Array2<f64> {
    x.select(Axis(1), &group.columns).reversed_axes()
}

impl<'a> FeatureGroupHarmonizer<'a> {
    /// Estimate every group and store its parameters under its name.
    pub fn estimate(
        &self,
        x: &Array2<f64>,
        covariates: &CovariateTable,
        store: &mut ParameterStore,
    ) -> Result<(), HarmonizationError> {
        for group in self.groups {
            debug!(group = %group.name, n_columns = group.columns.len(), "estimating feature group");
            let dat = group_columns(x, group);
            let estimation = combat::estimate(
                &dat.view(),
                covariates,
                self.batch_column,
                &group.categorical,
                &group.continuous,
                self.ref_batch,
                self.options,
            )?;
            store.insert(StoreKey::group(&group.name), estimation.estimates);
        }
        Ok(())
    }

    /// Harmonize every group with stored parameters and concatenate.
    pub fn apply(
        &self,
        x: &Array2<f64>,
        covariates: &CovariateTable,
        store: &ParameterStore,
    ) -> Result<Array2<f64>, HarmonizationError> {
        let mut blocks = Vec::with_capacity(self.groups.len());
        for group in self.groups {
            let estimates = store.get(&StoreKey::group(&group.name))?;
            debug!(group = %group.name, "applying feature group");
            let dat = group_columns(x, group);
            let harmonized = combat::apply(
                &dat.view(),
                covariates,
                self.batch_column,
                &group.categorical,
                &group.continuous,
                estimates,
            )?;
            blocks.push(harmonized.reversed_axes());
        }

        if blocks.is_empty() {
            return Ok(Array2::zeros((x.nrows(), 0)));
        }
        let views: Vec<ArrayView2<f64>> = blocks.iter().map(|b| b.view()).collect();
        concatenate(Axis(1), &views).map_err(|e| HarmonizationError::InvalidInput(e.to_string()))
    }
}
