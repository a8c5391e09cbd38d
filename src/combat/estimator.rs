//! ComBat estimation and application.
//!
//! Data passed to [`estimate`] and [`apply`] is oriented `features × samples`
//! (one row per feature), matching the covariate table's rows to columns.

use crate::combat::design::DesignLayout;
use crate::combat::error::ComBatError;
use crate::combat::priors::{batch_members, find_adjustments, find_priors, fit_ls};
use crate::combat::standardize::{stand_mean, standardize_across_features};
use crate::harmonization::CovariateTable;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Tuning of the batch-effect adjustment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComBatOptions {
    /// Shrink batch effects with empirical Bayes priors.
    pub eb: bool,
    /// Parametric priors; `false` uses the non-parametric estimator.
    pub parametric: bool,
    /// Only correct the batch mean, keep the scale.
    pub mean_only: bool,
    /// Convergence threshold of the parametric iteration.
    pub conv: f64,
    /// Iteration cap of the parametric iteration.
    pub max_iter: usize,
}

impl Default for ComBatOptions {
    fn default() -> Self {
        Self {
            eb: true,
            parametric: true,
            mean_only: false,
            conv: 1e-4,
            max_iter: 1000,
        }
    }
}

impl ComBatOptions {
    /// Enable or disable empirical Bayes shrinkage.
    pub fn with_eb(mut self, eb: bool) -> Self {
        self.eb = eb;
        self
    }

    /// Choose parametric or non-parametric priors.
    pub fn with_parametric(mut self, parametric: bool) -> Self {
        self.parametric = parametric;
        self
    }

    /// Only adjust batch means.
    pub fn with_mean_only(mut self, mean_only: bool) -> Self {
        self.mean_only = mean_only;
        self
    }
}

/// Fitted ComBat parameters.
///
/// Everything needed to harmonize new samples from the batches seen at
/// estimation time, without touching the training cohort again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComBatEstimates {
    pub layout: DesignLayout,
    pub n_features: usize,
    pub grand_mean: Array1<f64>,
    pub var_pooled: Array1<f64>,
    /// `n_covariate_terms × features`
    pub covariate_coefficients: Array2<f64>,
    /// `batches × features`
    pub gamma_star: Array2<f64>,
    /// `batches × features`
    pub delta_star: Array2<f64>,
    pub gamma_bar: Array1<f64>,
    pub t2: Array1<f64>,
    pub a_prior: Array1<f64>,
    pub b_prior: Array1<f64>,
    pub options: ComBatOptions,
}

/// Result of [`estimate`]: parameters plus the harmonized training data.
#[derive(Clone, Debug)]
pub struct Estimation {
    pub estimates: ComBatEstimates,
    /// Harmonized data, `features × samples`.
    pub data: Array2<f64>,
}

fn check_data(dat: &ArrayView2<f64>, covariates: &CovariateTable) -> Result<(), ComBatError> {
    let (n_features, n_samples) = dat.dim();
    if n_features == 0 || n_samples == 0 {
        return Err(ComBatError::EmptyData(format!(
            "data has shape ({}, {})",
            n_features, n_samples
        )));
    }
    if covariates.n_samples() != n_samples {
        return Err(ComBatError::InvalidShape {
            expected: format!("{} covariate rows (one per sample)", n_samples),
            got: format!("{} covariate rows", covariates.n_samples()),
        });
    }
    if let Some(((feature, sample), _)) = dat.indexed_iter().find(|(_, v)| !v.is_finite()) {
        return Err(ComBatError::NonFinite(format!(
            "feature {} sample {}",
            feature, sample
        )));
    }
    Ok(())
}

/// Remove batch effects from standardized data and map back to the data scale.
fn adjust_data(
    dat: &ArrayView2<f64>,
    stand_mean: &Array2<f64>,
    var_pooled: &ArrayView1<f64>,
    batch_idx: &[usize],
    gamma_star: &Array2<f64>,
    delta_star: &Array2<f64>,
    ref_batch: Option<usize>,
) -> Array2<f64> {
    let sd = var_pooled.mapv(f64::sqrt);
    let mut out = dat.to_owned();

    for (sample, &b) in batch_idx.iter().enumerate() {
        if ref_batch == Some(b) {
            continue;
        }
        let mut column = out.column_mut(sample);
        for g in 0..column.len() {
            let s = (dat[[g, sample]] - stand_mean[[g, sample]]) / sd[g];
            let adjusted = (s - gamma_star[[b, g]]) / delta_star[[b, g]].sqrt();
            column[g] = adjusted * sd[g] + stand_mean[[g, sample]];
        }
    }
    out
}

/// Estimate ComBat parameters on `dat` (`features × samples`) and harmonize it.
///
/// With `ref_batch`, every batch is aligned to the reference batch's
/// distribution (M-ComBat) and the reference samples are returned unchanged.
pub fn estimate(
    dat: &ArrayView2<f64>,
    covariates: &CovariateTable,
    batch_column: &str,
    categorical: &[String],
    continuous: &[String],
    ref_batch: Option<&str>,
    options: &ComBatOptions,
) -> Result<Estimation, ComBatError> {
    check_data(dat, covariates)?;

    let layout = DesignLayout::learn(covariates, batch_column, categorical, continuous, ref_batch)?;
    if layout.n_batches() < 2 {
        return Err(ComBatError::TooFewBatches(layout.n_batches()));
    }

    let (design, batch_idx) = layout.full_design(covariates)?;
    let members = batch_members(&batch_idx, layout.n_batches());
    for (level, cols) in layout.batch_levels.iter().zip(&members) {
        if cols.len() < 2 {
            return Err(ComBatError::TooFewSamples {
                batch: level.clone(),
                n_samples: cols.len(),
            });
        }
    }

    let n_features = dat.nrows();
    debug!(
        n_features,
        n_samples = dat.ncols(),
        n_batches = layout.n_batches(),
        ref_batch = ?layout.ref_batch_label(),
        "estimating ComBat parameters"
    );

    let st = standardize_across_features(dat, &design.view(), &batch_idx, &layout)?;
    let effects = fit_ls(&st.s_data.view(), &members, options.mean_only);
    let priors = find_priors(&effects);

    let use_eb = options.eb && n_features >= 2;
    if options.eb && !use_eb {
        warn!("empirical Bayes priors need at least two features, using L/S estimates");
    }

    let (mut gamma_star, mut delta_star) = if use_eb {
        find_adjustments(
            &st.s_data.view(),
            &members,
            &layout.batch_levels,
            &effects,
            &priors,
            options.parametric,
            options.mean_only,
            options.conv,
            options.max_iter,
        )?
    } else {
        (effects.gamma_hat.clone(), effects.delta_hat.clone())
    };

    if let Some(r) = layout.ref_batch {
        gamma_star.row_mut(r).fill(0.0);
        delta_star.row_mut(r).fill(1.0);
    }

    let data = adjust_data(
        dat,
        &st.stand_mean,
        &st.var_pooled.view(),
        &batch_idx,
        &gamma_star,
        &delta_star,
        layout.ref_batch,
    );

    Ok(Estimation {
        estimates: ComBatEstimates {
            layout,
            n_features,
            grand_mean: st.grand_mean,
            var_pooled: st.var_pooled,
            covariate_coefficients: st.covariate_coefficients,
            gamma_star,
            delta_star,
            gamma_bar: priors.gamma_bar,
            t2: priors.t2,
            a_prior: priors.a_prior,
            b_prior: priors.b_prior,
            options: options.clone(),
        },
        data,
    })
}

/// Harmonize `dat` (`features × samples`) with previously estimated parameters.
///
/// The column names must be the ones used for estimation. Every batch in
/// `covariates` must have been seen during estimation.
pub fn apply(
    dat: &ArrayView2<f64>,
    covariates: &CovariateTable,
    batch_column: &str,
    categorical: &[String],
    continuous: &[String],
    estimates: &ComBatEstimates,
) -> Result<Array2<f64>, ComBatError> {
    estimates
        .layout
        .check_columns(batch_column, categorical, continuous)?;
    estimates.apply(dat, covariates)
}

impl ComBatEstimates {
    /// Number of batches the parameters cover.
    pub fn n_batches(&self) -> usize {
        self.layout.n_batches()
    }

    /// Harmonize new data using the stored layout.
    pub fn apply(
        &self,
        dat: &ArrayView2<f64>,
        covariates: &CovariateTable,
    ) -> Result<Array2<f64>, ComBatError> {
        check_data(dat, covariates)?;
        if dat.nrows() != self.n_features {
            return Err(ComBatError::FeatureMismatch {
                expected_features: self.n_features,
                got_features: dat.nrows(),
            });
        }

        let batch_idx = self.layout.batch_indices(covariates)?;
        let covariate_design = self.layout.covariate_design(covariates)?;
        let mean = stand_mean(
            &self.grand_mean.view(),
            &self.covariate_coefficients.view(),
            &covariate_design.view(),
        );

        debug!(
            n_features = self.n_features,
            n_samples = dat.ncols(),
            "applying ComBat parameters"
        );

        Ok(adjust_data(
            dat,
            &mean,
            &self.var_pooled.view(),
            &batch_idx,
            &self.gamma_star,
            &self.delta_star,
            self.layout.ref_batch,
        ))
    }

    /// Per-batch additive shift on the standardized scale.
    pub fn batch_shift(&self, batch: &str) -> Option<ArrayView1<'_, f64>> {
        let i = self.layout.batch_levels.iter().position(|l| l == batch)?;
        Some(self.gamma_star.index_axis(Axis(0), i))
    }
}
