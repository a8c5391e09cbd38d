//! # combat-harmonize
//!
//! Multi-site batch-effect correction (ComBat) for tabular feature data,
//! with a fit/transform contract for estimate-then-apply workflows.
//!
//! ## Layout
//!
//! - [`combat`]: the estimator. Design matrices, pooled standardization,
//!   empirical Bayes batch effects and their application to new samples.
//! - [`harmonization`]: the controller that sequences the covariate of no
//!   interest and the feature groups, plus configuration, input handling
//!   and the fitted parameter store.
//! - [`serialization`]: byte-level persistence of fitted parameters.
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events (`info` for fit/transform, `debug`
//! per stage, `warn` on numerical fallbacks) and installs no subscriber.

pub mod combat;
pub mod harmonization;
pub mod serialization;

pub use combat::{ComBatError, ComBatEstimates, ComBatOptions};
pub use harmonization::{
    ComBatHarmonization, CovariateTable, FeatureGroup, HarmonizationConfig, HarmonizationError,
    HarmonizationInput, HarmonizationOutput, NoInterestSpec,
};
pub use serialization::SerializableParams;
