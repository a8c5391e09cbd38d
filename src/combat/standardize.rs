//! Feature standardization before the batch-effect fit.
//!
//! Regress every feature on the design, take the batch part of the fit as
//! the grand mean (reference batch row for M-ComBat, batch-size weighted
//! average otherwise), and scale residual-free data to unit pooled variance:
//!
//! ```text
//! stand_mean = grand_mean + X_cov · B_cov
//! s          = (Y - stand_mean) / sqrt(var_pooled)
//! ```

use crate::combat::design::DesignLayout;
use crate::combat::error::ComBatError;
use crate::combat::linalg::least_squares;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Output of the standardization step. Matrices are `features × samples`.
#[derive(Clone, Debug)]
pub(crate) struct Standardized {
    pub grand_mean: Array1<f64>,
    pub var_pooled: Array1<f64>,
    /// `n_covariate_terms × features`
    pub covariate_coefficients: Array2<f64>,
    pub stand_mean: Array2<f64>,
    pub s_data: Array2<f64>,
}

/// Expected value of every sample before batch effects: `features × samples`.
pub(crate) fn stand_mean(
    grand_mean: &ArrayView1<f64>,
    covariate_coefficients: &ArrayView2<f64>,
    covariate_design: &ArrayView2<f64>,
) -> Array2<f64> {
    let n_samples = covariate_design.nrows();
    let mut mean = Array2::<f64>::zeros((grand_mean.len(), n_samples));
    for mut column in mean.columns_mut() {
        column.assign(grand_mean);
    }
    if covariate_design.ncols() > 0 {
        mean += &covariate_design.dot(covariate_coefficients).t();
    }
    mean
}

pub(crate) fn standardize_across_features(
    dat: &ArrayView2<f64>,
    design: &ArrayView2<f64>,
    batch_idx: &[usize],
    layout: &DesignLayout,
) -> Result<Standardized, ComBatError> {
    let n_batches = layout.n_batches();
    let n_samples = dat.ncols() as f64;

    // p × G
    let b_hat = least_squares(design, &dat.t())?;

    let grand_mean = match layout.ref_batch {
        Some(r) => b_hat.row(r).to_owned(),
        None => {
            let mut counts = vec![0usize; n_batches];
            for &b in batch_idx {
                counts[b] += 1;
            }
            let weights = Array1::from_iter(counts.iter().map(|&c| c as f64 / n_samples));
            weights.dot(&b_hat.slice(ndarray::s![..n_batches, ..]))
        }
    };

    let fitted = design.dot(&b_hat);
    let residuals = dat - &fitted.t();
    let var_pooled = match layout.ref_batch {
        Some(r) => {
            let ref_cols: Vec<usize> = batch_idx
                .iter()
                .enumerate()
                .filter(|&(_, &b)| b == r)
                .map(|(i, _)| i)
                .collect();
            let ref_resid = residuals.select(Axis(1), &ref_cols);
            ref_resid.mapv(|v| v * v).sum_axis(Axis(1)) / ref_cols.len() as f64
        }
        None => residuals.mapv(|v| v * v).sum_axis(Axis(1)) / n_samples,
    };

    // Residuals of an exact fit are round-off, not variance.
    let magnitude = dat.mapv(|v| v * v).mean_axis(Axis(1)).unwrap_or_else(|| Array1::zeros(0));
    let degenerate = var_pooled
        .iter()
        .zip(magnitude.iter())
        .position(|(&v, &m)| !(v.is_finite() && v > 1e-20 * (1.0 + m)));
    if let Some(feature) = degenerate {
        return Err(ComBatError::Numerical(format!(
            "feature {} has zero pooled variance after regressing out the design",
            feature
        )));
    }

    let covariate_coefficients = b_hat.slice(ndarray::s![n_batches.., ..]).to_owned();
    let covariate_design = design.slice(ndarray::s![.., n_batches..]);
    let stand_mean = stand_mean(
        &grand_mean.view(),
        &covariate_coefficients.view(),
        &covariate_design,
    );

    let sd = var_pooled.mapv(f64::sqrt).insert_axis(Axis(1));
    let s_data = (dat - &stand_mean) / &sd;

    Ok(Standardized {
        grand_mean,
        var_pooled,
        covariate_coefficients,
        stand_mean,
        s_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harmonization::CovariateTable;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn setup(ref_batch: Option<&str>) -> (Array2<f64>, Array2<f64>, Vec<usize>, DesignLayout) {
        let covariates = CovariateTable::new()
            .with_categorical("batch", ["a", "a", "a", "b", "b", "b"])
            .unwrap();
        let layout = DesignLayout::learn(&covariates, "batch", &[], &[], ref_batch).unwrap();
        let (design, batch_idx) = layout.full_design(&covariates).unwrap();
        // 2 features × 6 samples
        let dat = array![
            [1.0, 2.0, 3.0, 11.0, 12.0, 13.0],
            [5.0, 7.0, 6.0, 4.0, 6.0, 5.0]
        ];
        (dat, design, batch_idx, layout)
    }

    #[test]
    fn test_grand_mean_is_weighted_batch_mean() {
        let (dat, design, batch_idx, layout) = setup(None);
        let st = standardize_across_features(&dat.view(), &design.view(), &batch_idx, &layout)
            .unwrap();
        // equal batch sizes: mean of batch means
        assert_abs_diff_eq!(st.grand_mean[0], 7.0, epsilon = 1e-10);
        assert_abs_diff_eq!(st.grand_mean[1], 5.5, epsilon = 1e-10);
        // residual variance: deviations of ±1 and 0 in each batch -> 4/6
        assert_abs_diff_eq!(st.var_pooled[0], 4.0 / 6.0, epsilon = 1e-10);
        assert_eq!(st.s_data.dim(), (2, 6));
    }

    #[test]
    fn test_reference_batch_mean_and_variance() {
        let (dat, design, batch_idx, layout) = setup(Some("b"));
        let st = standardize_across_features(&dat.view(), &design.view(), &batch_idx, &layout)
            .unwrap();
        assert_abs_diff_eq!(st.grand_mean[0], 12.0, epsilon = 1e-10);
        assert_abs_diff_eq!(st.grand_mean[1], 5.0, epsilon = 1e-10);
        assert_abs_diff_eq!(st.var_pooled[0], 2.0 / 3.0, epsilon = 1e-10);
    }

    #[test]
    fn test_constant_feature_rejected() {
        let (_, design, batch_idx, layout) = setup(None);
        let dat = array![[1.0, 1.0, 1.0, 2.0, 2.0, 2.0]];
        let result =
            standardize_across_features(&dat.view(), &design.view(), &batch_idx, &layout);
        assert!(matches!(result, Err(ComBatError::Numerical(_))));
    }

    #[test]
    fn test_stand_mean_adds_covariate_effect() {
        let grand_mean = array![1.0, 2.0];
        let coefficients = array![[0.5, -1.0]];
        let design = array![[0.0], [2.0]];
        let mean = stand_mean(&grand_mean.view(), &coefficients.view(), &design.view());
        assert_eq!(mean, array![[1.0, 2.0], [2.0, 0.0]]);
    }
}
