//! Fit/transform harmonization of multi-site feature matrices.
//!
//! This module wraps the ComBat estimator in a controller that can be
//! dropped into an estimate-then-apply workflow: parameters are learned
//! once from a training cohort and applied to unseen samples from the
//! same sites.
//!
//! # Stages
//!
//! - **Covariate of no interest** (optional): a global such as total
//!   intracranial volume, harmonized jointly with a few feature columns and
//!   written back into the covariate table by `transform`.
//! - **Feature groups**: named column subsets, each harmonized with its own
//!   categorical and continuous covariates. Outputs are concatenated in
//!   group order.
//!
//! # Example
//!
//! ```
//! use combat_harmonize::harmonization::{
//!     ComBatHarmonization, CovariateTable, FeatureGroup, HarmonizationConfig,
//!     HarmonizationInput,
//! };
//! use ndarray::Array2;
//!
//! let n = 24;
//! let data = Array2::from_shape_fn((n, 2), |(i, j)| {
//!     2.0 + j as f64 + 0.3 * ((i * 5 + j) as f64).sin() + (i % 3) as f64 * 0.4
//! });
//! let covariates = CovariateTable::new()
//!     .with_categorical("batch", (0..n).map(|i| format!("site{}", i % 3)))?
//!     .with_continuous("age", (0..n).map(|i| 30.0 + (i % 7) as f64))?;
//! let mut input = HarmonizationInput::new(data, covariates);
//!
//! let config = HarmonizationConfig::new()
//!     .with_feature_group(FeatureGroup::new("thickness", vec![0, 1]).with_continuous(["age"]));
//! let mut harmonizer = ComBatHarmonization::new(config)?;
//! let harmonized = harmonizer.fit_transform(&mut input)?.into_data();
//! assert_eq!(harmonized.dim(), (n, 2));
//! # Ok::<(), combat_harmonize::harmonization::HarmonizationError>(())
//! ```

pub mod config;
pub mod controller;
pub mod covariates;
pub mod error;
mod feature_groups;
pub mod input;
mod no_interest;
pub mod store;

pub use config::{CvMethod, FeatureGroup, HarmonizationConfig, NoInterestSpec};
pub use controller::{ComBatHarmonization, FitState, HarmonizationOutput, HarmonizationParams};
pub use covariates::{CovariateColumn, CovariateTable};
pub use error::HarmonizationError;
pub use input::HarmonizationInput;
pub use store::{ParameterStore, StoreKey};
