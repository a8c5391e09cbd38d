//! Least-squares solve for the ComBat regression.
//!
//! Matrices live in `ndarray`; the normal equations are solved with
//! `nalgebra`'s Cholesky decomposition.

use crate::combat::error::ComBatError;
use nalgebra::DMatrix;
use ndarray::{Array2, ArrayView2};
use tracing::warn;

const RIDGE: f64 = 1e-8;

fn to_dmatrix(a: &ArrayView2<f64>) -> DMatrix<f64> {
    let (rows, cols) = a.dim();
    DMatrix::from_fn(rows, cols, |i, j| a[[i, j]])
}

fn to_array2(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(i, j)| m[(i, j)])
}

/// Solve `min ||X B - Y||` for `B` via `(XᵀX) B = XᵀY`.
///
/// `x` is `n × p`, `y` is `n × k`; returns `p × k`. A singular `XᵀX`
/// (collinear covariates) gets a small ridge before giving up.
pub fn least_squares(x: &ArrayView2<f64>, y: &ArrayView2<f64>) -> Result<Array2<f64>, ComBatError> {
    if x.nrows() != y.nrows() {
        return Err(ComBatError::InvalidShape {
            expected: format!("{} rows", x.nrows()),
            got: format!("{} rows", y.nrows()),
        });
    }

    let xm = to_dmatrix(x);
    let ym = to_dmatrix(y);
    let xtx = xm.transpose() * &xm;
    let xty = xm.transpose() * &ym;
    let p = xtx.nrows();

    let solution = match xtx.clone().cholesky() {
        Some(chol) => chol.solve(&xty),
        None => {
            let scale = (xtx.trace() / p.max(1) as f64).max(1.0);
            warn!(p, "design matrix is rank deficient, adding ridge");
            let ridged = &xtx + DMatrix::identity(p, p) * (RIDGE * scale);
            ridged
                .cholesky()
                .ok_or_else(|| {
                    ComBatError::Numerical("design matrix is singular".to_string())
                })?
                .solve(&xty)
        }
    };

    if solution.iter().any(|v| !v.is_finite()) {
        return Err(ComBatError::Numerical(
            "least-squares solution is not finite".to_string(),
        ));
    }

    Ok(to_array2(&solution))
}
