//! ComBat batch-effect estimation and application.
//!
//! ComBat models every feature as
//!
//! ```text
//! y = alpha + X_cov · beta + gamma_batch + delta_batch · eps
//! ```
//!
//! and removes the additive (`gamma`) and multiplicative (`delta`) batch
//! effects while keeping the covariate effects (`beta`). Batch effects are
//! shrunk towards a common prior with empirical Bayes, which stabilises
//! sites with few samples.
//!
//! The two entry points mirror a fit/apply split:
//! - [`estimate`] learns [`ComBatEstimates`] from a training cohort and
//!   returns its harmonized data.
//! - [`apply`] harmonizes new samples from known batches with stored
//!   estimates, without re-estimating anything.
//!
//! Both work on `features × samples` matrices.

mod design;
mod error;
mod estimator;
mod linalg;
mod priors;
mod standardize;

pub use design::{CategoricalLevels, DesignLayout};
pub use error::ComBatError;
pub use estimator::{apply, estimate, ComBatEstimates, ComBatOptions, Estimation};
pub use linalg::least_squares;
