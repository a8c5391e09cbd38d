//! Location/scale batch effects and their empirical Bayes shrinkage.
//!
//! Per batch `i` and feature `g` on standardized data:
//!
//! ```text
//! gamma_hat[i, g] = mean of s over batch i
//! delta_hat[i, g] = sample variance (ddof = 1) of s over batch i
//! ```
//!
//! Priors are normal for gamma (`gamma_bar`, `t2`) and inverse gamma for
//! delta (`a_prior`, `b_prior`), moment-matched across features.

use crate::combat::error::ComBatError;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// L/S estimates, `batches × features`.
#[derive(Clone, Debug)]
pub(crate) struct BatchEffects {
    pub gamma_hat: Array2<f64>,
    pub delta_hat: Array2<f64>,
}

/// Hyper-parameters, one per batch.
#[derive(Clone, Debug)]
pub(crate) struct Priors {
    pub gamma_bar: Array1<f64>,
    pub t2: Array1<f64>,
    pub a_prior: Array1<f64>,
    pub b_prior: Array1<f64>,
}

/// Column indices of the samples belonging to each batch.
pub(crate) fn batch_members(batch_idx: &[usize], n_batches: usize) -> Vec<Vec<usize>> {
    let mut members = vec![Vec::new(); n_batches];
    for (sample, &b) in batch_idx.iter().enumerate() {
        members[b].push(sample);
    }
    members
}

fn sample_variance(values: &ArrayView1<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean = values.sum() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}

pub(crate) fn fit_ls(
    s_data: &ArrayView2<f64>,
    members: &[Vec<usize>],
    mean_only: bool,
) -> BatchEffects {
    let n_features = s_data.nrows();
    let mut gamma_hat = Array2::<f64>::zeros((members.len(), n_features));
    let mut delta_hat = Array2::<f64>::ones((members.len(), n_features));

    for (i, cols) in members.iter().enumerate() {
        let batch = s_data.select(Axis(1), cols);
        for g in 0..n_features {
            let row = batch.row(g);
            gamma_hat[[i, g]] = row.sum() / cols.len() as f64;
            if !mean_only {
                delta_hat[[i, g]] = sample_variance(&row);
            }
        }
    }

    BatchEffects {
        gamma_hat,
        delta_hat,
    }
}

fn aprior(delta: &ArrayView1<f64>) -> f64 {
    let m = delta.mean().unwrap_or(f64::NAN);
    let s2 = sample_variance(delta);
    (2.0 * s2 + m * m) / s2
}

fn bprior(delta: &ArrayView1<f64>) -> f64 {
    let m = delta.mean().unwrap_or(f64::NAN);
    let s2 = sample_variance(delta);
    (m * s2 + m * m * m) / s2
}

pub(crate) fn find_priors(effects: &BatchEffects) -> Priors {
    let n_batches = effects.gamma_hat.nrows();
    let mut priors = Priors {
        gamma_bar: Array1::zeros(n_batches),
        t2: Array1::zeros(n_batches),
        a_prior: Array1::zeros(n_batches),
        b_prior: Array1::zeros(n_batches),
    };
    for i in 0..n_batches {
        let gamma = effects.gamma_hat.row(i);
        let delta = effects.delta_hat.row(i);
        priors.gamma_bar[i] = gamma.mean().unwrap_or(f64::NAN);
        priors.t2[i] = sample_variance(&gamma);
        priors.a_prior[i] = aprior(&delta);
        priors.b_prior[i] = bprior(&delta);
    }
    priors
}

pub(crate) fn postmean(g_hat: f64, g_bar: f64, n: f64, d_star: f64, t2: f64) -> f64 {
    (t2 * n * g_hat + d_star * g_bar) / (t2 * n + d_star)
}

fn postvar(sum2: f64, n: f64, a: f64, b: f64) -> f64 {
    (0.5 * sum2 + b) / (n / 2.0 + a - 1.0)
}

fn relative_change(new: &Array1<f64>, old: &Array1<f64>) -> f64 {
    new.iter()
        .zip(old.iter())
        .map(|(n, o)| (n - o).abs() / o.abs().max(f64::EPSILON))
        .fold(0.0, f64::max)
}

/// Parametric empirical Bayes: alternate posterior mean and variance until
/// the largest relative change falls below `conv`.
///
/// `sdat` holds one batch, `features × samples`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn it_sol(
    sdat: &ArrayView2<f64>,
    g_hat: &ArrayView1<f64>,
    d_hat: &ArrayView1<f64>,
    g_bar: f64,
    t2: f64,
    a: f64,
    b: f64,
    conv: f64,
    max_iter: usize,
) -> Option<(Array1<f64>, Array1<f64>)> {
    let n = sdat.ncols() as f64;
    // Identical delta_hat across features leaves the inverse-gamma prior
    // degenerate; its limit is delta_hat itself.
    let fixed_delta = !(a.is_finite() && b.is_finite());

    let mut g_old = g_hat.to_owned();
    let mut d_old = d_hat.to_owned();

    for _ in 0..max_iter {
        let g_new = Array1::from_iter(
            g_hat
                .iter()
                .zip(d_old.iter())
                .map(|(&g, &d)| postmean(g, g_bar, n, d, t2)),
        );
        let d_new = if fixed_delta {
            d_hat.to_owned()
        } else {
            Array1::from_iter(sdat.rows().into_iter().zip(g_new.iter()).map(|(row, &g)| {
                let sum2: f64 = row.iter().map(|v| (v - g).powi(2)).sum();
                postvar(sum2, n, a, b)
            }))
        };

        let change = relative_change(&g_new, &g_old).max(relative_change(&d_new, &d_old));
        g_old = g_new;
        d_old = d_new;
        if change <= conv {
            return Some((g_old, d_old));
        }
    }
    None
}

/// Non-parametric empirical Bayes: each feature's adjustment is the
/// likelihood-weighted average of every other feature's L/S estimates.
pub(crate) fn int_eprior(
    sdat: &ArrayView2<f64>,
    g_hat: &ArrayView1<f64>,
    d_hat: &ArrayView1<f64>,
) -> (Array1<f64>, Array1<f64>) {
    let n_features = sdat.nrows();
    let n = sdat.ncols() as f64;
    let mut gamma_star = Array1::<f64>::zeros(n_features);
    let mut delta_star = Array1::<f64>::zeros(n_features);

    for (i, x) in sdat.rows().into_iter().enumerate() {
        let log_lh: Vec<(usize, f64)> = (0..n_features)
            .filter(|&k| k != i)
            .map(|k| {
                let g = g_hat[k];
                let d = d_hat[k];
                let sum2: f64 = x.iter().map(|v| (v - g).powi(2)).sum();
                let ll = -(n / 2.0) * (2.0 * std::f64::consts::PI * d).ln() - sum2 / (2.0 * d);
                (k, ll)
            })
            .filter(|(_, ll)| ll.is_finite())
            .collect();

        let max_ll = log_lh.iter().map(|&(_, ll)| ll).fold(f64::NEG_INFINITY, f64::max);
        if !max_ll.is_finite() {
            gamma_star[i] = g_hat[i];
            delta_star[i] = d_hat[i];
            continue;
        }

        let (mut weight_sum, mut g_sum, mut d_sum) = (0.0, 0.0, 0.0);
        for &(k, ll) in &log_lh {
            let w = (ll - max_ll).exp();
            weight_sum += w;
            g_sum += w * g_hat[k];
            d_sum += w * d_hat[k];
        }
        gamma_star[i] = g_sum / weight_sum;
        delta_star[i] = d_sum / weight_sum;
    }

    (gamma_star, delta_star)
}

/// Run the configured adjustment for every batch.
#[allow(clippy::too_many_arguments)]
pub(crate) fn find_adjustments(
    s_data: &ArrayView2<f64>,
    members: &[Vec<usize>],
    batch_levels: &[String],
    effects: &BatchEffects,
    priors: &Priors,
    parametric: bool,
    mean_only: bool,
    conv: f64,
    max_iter: usize,
) -> Result<(Array2<f64>, Array2<f64>), ComBatError> {
    let mut gamma_star = effects.gamma_hat.clone();
    let mut delta_star = effects.delta_hat.clone();

    for (i, cols) in members.iter().enumerate() {
        let g_hat = effects.gamma_hat.row(i);
        let d_hat = effects.delta_hat.row(i);

        let (g, d) = if mean_only {
            let g = g_hat.mapv(|g| postmean(g, priors.gamma_bar[i], 1.0, 1.0, priors.t2[i]));
            (g, Array1::ones(g_hat.len()))
        } else if parametric {
            let sdat = s_data.select(Axis(1), cols);
            it_sol(
                &sdat.view(),
                &g_hat,
                &d_hat,
                priors.gamma_bar[i],
                priors.t2[i],
                priors.a_prior[i],
                priors.b_prior[i],
                conv,
                max_iter,
            )
            .ok_or_else(|| ComBatError::Convergence {
                batch: batch_levels[i].clone(),
                iterations: max_iter,
            })?
        } else {
            let sdat = s_data.select(Axis(1), cols);
            int_eprior(&sdat.view(), &g_hat, &d_hat)
        };

        gamma_star.row_mut(i).assign(&g);
        delta_star.row_mut(i).assign(&d);
    }

    Ok((gamma_star, delta_star))
}
