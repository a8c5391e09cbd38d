//! The harmonization controller and its fit/transform contract.
//!
//! [`ComBatHarmonization`] sequences the two stages: the covariate of no
//! interest first, then the feature groups, which read the covariate table
//! the first stage may have rewritten.
//!
//! Mutation is visible in the signatures. `fit` borrows its input
//! immutably and never touches the covariates; `transform` borrows it
//! mutably and overwrites the covariate of no interest. Calling `fit`
//! then `transform` on the same input therefore harmonizes that covariate
//! exactly once.

use crate::harmonization::config::HarmonizationConfig;
use crate::harmonization::covariates::CovariateTable;
use crate::harmonization::error::HarmonizationError;
use crate::harmonization::feature_groups::FeatureGroupHarmonizer;
use crate::harmonization::input::{check_array, extract, extract_mut, HarmonizationInput};
use crate::harmonization::no_interest::NoInterestHarmonizer;
use crate::harmonization::store::{ParameterStore, StoreKey};
use crate::serialization::SerializableParams;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Whether the controller holds fitted parameters.
#[derive(Clone, Debug, PartialEq)]
pub enum FitState {
    Unfitted,
    Fitted {
        /// Feature count of the matrix seen by `fit`.
        n_features: usize,
        store: ParameterStore,
    },
}

/// Result of [`ComBatHarmonization::transform`].
#[derive(Clone, Debug, PartialEq)]
pub enum HarmonizationOutput {
    /// Harmonized feature matrix alone.
    Data(Array2<f64>),
    /// Harmonized feature matrix with the updated covariates
    /// (`regression_fit` mode).
    Regression {
        data: Array2<f64>,
        covariates: CovariateTable,
    },
}

impl HarmonizationOutput {
    /// The harmonized feature matrix.
    pub fn data(&self) -> &Array2<f64> {
        match self {
            HarmonizationOutput::Data(data) => data,
            HarmonizationOutput::Regression { data, .. } => data,
        }
    }

    /// The covariates, in `regression_fit` mode.
    pub fn covariates(&self) -> Option<&CovariateTable> {
        match self {
            HarmonizationOutput::Data(_) => None,
            HarmonizationOutput::Regression { covariates, .. } => Some(covariates),
        }
    }

    pub fn into_data(self) -> Array2<f64> {
        match self {
            HarmonizationOutput::Data(data) => data,
            HarmonizationOutput::Regression { data, .. } => data,
        }
    }
}

/// Serializable parameters of a fitted controller.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HarmonizationParams {
    pub config: HarmonizationConfig,
    pub n_features: usize,
    pub store: ParameterStore,
}

/// Multi-site ComBat harmonization with a fit/transform contract.
///
/// ```no_run
/// use combat_harmonize::harmonization::{
///     ComBatHarmonization, FeatureGroup, HarmonizationConfig, HarmonizationInput,
/// };
/// # fn run(train: HarmonizationInput, mut test: HarmonizationInput)
/// # -> Result<(), combat_harmonize::harmonization::HarmonizationError> {
/// let config = HarmonizationConfig::new().with_feature_group(
///     FeatureGroup::new("thickness", vec![0, 1])
///         .with_categorical(["sex"])
///         .with_continuous(["age"]),
/// );
/// let mut harmonizer = ComBatHarmonization::new(config)?;
/// harmonizer.fit(&train)?;
/// let harmonized = harmonizer.transform(&mut test)?.into_data();
/// assert_eq!(harmonized.ncols(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ComBatHarmonization {
    config: HarmonizationConfig,
    state: FitState,
}

impl ComBatHarmonization {
    /// Create an unfitted controller. Fails on an invalid configuration.
    pub fn new(config: HarmonizationConfig) -> Result<Self, HarmonizationError> {
        config.validate(None)?;
        Ok(Self {
            config,
            state: FitState::Unfitted,
        })
    }

    pub fn config(&self) -> &HarmonizationConfig {
        &self.config
    }

    pub fn state(&self) -> &FitState {
        &self.state
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, FitState::Fitted { .. })
    }

    /// Feature count seen by `fit`.
    pub fn n_features(&self) -> Option<usize> {
        match &self.state {
            FitState::Fitted { n_features, .. } => Some(*n_features),
            FitState::Unfitted => None,
        }
    }

    /// Fitted parameter store.
    pub fn store(&self) -> Option<&ParameterStore> {
        match &self.state {
            FitState::Fitted { store, .. } => Some(store),
            FitState::Unfitted => None,
        }
    }

    fn no_interest(&self) -> Option<NoInterestHarmonizer<'_>> {
        self.config.no_interest.as_ref().map(|spec| NoInterestHarmonizer {
            spec,
            batch_column: &self.config.batch_column,
            ref_batch: self.config.ref_batch.as_deref(),
            options: &self.config.combat,
        })
    }

    fn feature_groups(&self) -> FeatureGroupHarmonizer<'_> {
        FeatureGroupHarmonizer {
            groups: &self.config.feature_groups,
            batch_column: &self.config.batch_column,
            ref_batch: self.config.ref_batch.as_deref(),
            options: &self.config.combat,
        }
    }

    /// Estimate parameters from a training cohort.
    ///
    /// Re-fitting replaces the previous parameters. On failure the
    /// controller keeps whatever state it had before the call.
    pub fn fit(&mut self, input: &HarmonizationInput) -> Result<&mut Self, HarmonizationError> {
        let (x, covariates) = extract(input)?;
        check_array(&x, covariates)?;
        self.config.validate(Some(x.ncols()))?;

        info!(
            n_samples = x.nrows(),
            n_features = x.ncols(),
            n_groups = self.config.feature_groups.len(),
            "fitting ComBat harmonization"
        );

        let mut store = ParameterStore::new();
        if let Some(stage) = self.no_interest() {
            stage.estimate(&x, covariates, &mut store)?;
        }
        self.feature_groups().estimate(&x, covariates, &mut store)?;

        self.state = FitState::Fitted {
            n_features: x.ncols(),
            store,
        };
        Ok(self)
    }

    /// Harmonize data with the fitted parameters.
    ///
    /// Overwrites the covariate of no interest in `input`, if one is
    /// configured. The covariates are only written once every stage has
    /// succeeded.
    pub fn transform(
        &self,
        input: &mut HarmonizationInput,
    ) -> Result<HarmonizationOutput, HarmonizationError> {
        let (n_features, store) = match &self.state {
            FitState::Fitted { n_features, store } => (*n_features, store),
            FitState::Unfitted => return Err(HarmonizationError::NotFitted),
        };

        let (x, covariates) = extract_mut(input)?;
        check_array(&x, covariates)?;
        if x.ncols() != n_features {
            return Err(HarmonizationError::FeatureMismatch {
                expected_features: n_features,
                got_features: x.ncols(),
            });
        }

        info!(n_samples = x.nrows(), "applying ComBat estimations");

        let mut updated = covariates.clone();
        if let Some(stage) = self.no_interest() {
            stage.apply(&x, &mut updated, store)?;
        }
        // Without feature groups only the covariate is harmonized and the
        // feature matrix passes through.
        let data = if self.config.feature_groups.is_empty() {
            x
        } else {
            self.feature_groups().apply(&x, &updated, store)?
        };
        *covariates = updated;

        if self.config.regression_fit {
            Ok(HarmonizationOutput::Regression {
                data,
                covariates: covariates.clone(),
            })
        } else {
            Ok(HarmonizationOutput::Data(data))
        }
    }

    /// `fit` then `transform` on the same input.
    pub fn fit_transform(
        &mut self,
        input: &mut HarmonizationInput,
    ) -> Result<HarmonizationOutput, HarmonizationError> {
        self.fit(input)?;
        self.transform(input)
    }

    /// Extract the fitted parameters.
    pub fn extract_params(&self) -> Result<HarmonizationParams, HarmonizationError> {
        match &self.state {
            FitState::Fitted { n_features, store } => Ok(HarmonizationParams {
                config: self.config.clone(),
                n_features: *n_features,
                store: store.clone(),
            }),
            FitState::Unfitted => Err(HarmonizationError::NotFitted),
        }
    }

    /// Rebuild a fitted controller from extracted parameters.
    pub fn from_params(params: HarmonizationParams) -> Result<Self, HarmonizationError> {
        params.config.validate(Some(params.n_features))?;
        for group in &params.config.feature_groups {
            params.store.get(&StoreKey::group(&group.name))?;
        }
        if let Some(spec) = &params.config.no_interest {
            params.store.get(&StoreKey::covariate(&spec.column))?;
        }
        Ok(Self {
            config: params.config,
            state: FitState::Fitted {
                n_features: params.n_features,
                store: params.store,
            },
        })
    }

    /// Save the fitted controller to a file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), HarmonizationError> {
        let params = self.extract_params()?;
        let bytes = params.to_bytes()?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a fitted controller from a file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, HarmonizationError> {
        let bytes = std::fs::read(path)?;
        let params = HarmonizationParams::from_bytes(&bytes)?;
        Self::from_params(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combat::ComBatError;
    use crate::harmonization::config::{FeatureGroup, NoInterestSpec};

    fn cohort(n: usize) -> HarmonizationInput {
        let sites = ["a", "b", "c"];
        let data = Array2::from_shape_fn((n, 4), |(i, j)| {
            3.0 + j as f64 + 0.4 * ((i * 5 + j * 7) as f64).sin() + [0.0, 0.5, -0.3][i % 3]
        });
        let covariates = CovariateTable::new()
            .with_categorical("batch", (0..n).map(|i| sites[i % 3]))
            .unwrap()
            .with_categorical("sex", (0..n).map(|i| if (i / 3) % 2 == 0 { "F" } else { "M" }))
            .unwrap()
            .with_continuous("age", (0..n).map(|i| 25.0 + ((i * 17) % 45) as f64))
            .unwrap()
            .with_continuous(
                "tiv",
                (0..n).map(|i| 1450.0 + 30.0 * ((i * 3) as f64).cos() + [0.0, 90.0, -60.0][i % 3]),
            )
            .unwrap();
        HarmonizationInput::new(data, covariates)
    }

    fn config() -> HarmonizationConfig {
        HarmonizationConfig::new()
            .with_no_interest(NoInterestSpec::new("tiv", vec![0, 1]).with_continuous(["age"]))
            .with_feature_group(
                FeatureGroup::new("thickness", vec![0, 1])
                    .with_categorical(["sex"])
                    .with_continuous(["age", "tiv"]),
            )
            .with_feature_group(FeatureGroup::new("volumes", vec![3]).with_continuous(["age"]))
    }

    #[test]
    fn test_transform_before_fit() {
        let harmonizer = ComBatHarmonization::new(config()).unwrap();
        let mut input = cohort(12);
        assert!(!harmonizer.is_fitted());
        assert!(matches!(
            harmonizer.transform(&mut input),
            Err(HarmonizationError::NotFitted)
        ));
        assert!(matches!(
            harmonizer.extract_params(),
            Err(HarmonizationError::NotFitted)
        ));
    }

    #[test]
    fn test_fit_populates_store() {
        let mut harmonizer = ComBatHarmonization::new(config()).unwrap();
        harmonizer.fit(&cohort(30)).unwrap();

        let store = harmonizer.store().unwrap();
        let keys: Vec<_> = store.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![
                StoreKey::covariate("tiv"),
                StoreKey::group("thickness"),
                StoreKey::group("volumes"),
            ]
        );
        assert_eq!(harmonizer.n_features(), Some(4));
    }

    #[test]
    fn test_fit_then_transform_writes_covariate_once() {
        let mut harmonizer = ComBatHarmonization::new(config()).unwrap();
        let mut input = cohort(30);
        let before = input.clone();

        harmonizer.fit(&input).unwrap();
        assert_eq!(input, before);

        let out = harmonizer.transform(&mut input).unwrap();
        assert_eq!(out.data().dim(), (30, 3));
        assert!(out.covariates().is_none());

        let cov = input.covariates().unwrap();
        let raw = before.covariates().unwrap();
        assert_ne!(cov.continuous("tiv"), raw.continuous("tiv"));
        assert_eq!(cov.column("age"), raw.column("age"));
        assert_eq!(cov.column("sex"), raw.column("sex"));
        assert_eq!(cov.column("batch"), raw.column("batch"));
        assert_eq!(input.data(), before.data());
    }

    #[test]
    fn test_fit_transform_matches_fit_then_transform() {
        let mut first = ComBatHarmonization::new(config()).unwrap();
        let mut a = cohort(30);
        let out_a = first.fit_transform(&mut a).unwrap();

        let mut second = ComBatHarmonization::new(config()).unwrap();
        let mut b = cohort(30);
        second.fit(&b).unwrap();
        let out_b = second.transform(&mut b).unwrap();

        assert_eq!(out_a, out_b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_regression_fit_returns_covariates() {
        let mut harmonizer =
            ComBatHarmonization::new(config().with_regression_fit(true)).unwrap();
        let mut input = cohort(30);
        let out = harmonizer.fit_transform(&mut input).unwrap();
        assert_eq!(out.covariates(), input.covariates());
    }

    #[test]
    fn test_transform_feature_mismatch() {
        let mut harmonizer = ComBatHarmonization::new(config()).unwrap();
        harmonizer.fit(&cohort(30)).unwrap();

        let mut narrow = HarmonizationInput::new(
            Array2::from_shape_fn((30, 3), |(i, j)| (i + j) as f64),
            cohort(30).covariates().unwrap().clone(),
        );
        assert!(matches!(
            harmonizer.transform(&mut narrow),
            Err(HarmonizationError::FeatureMismatch {
                expected_features: 4,
                got_features: 3
            })
        ));
    }

    #[test]
    fn test_unseen_batch_leaves_covariates_untouched() {
        let mut harmonizer = ComBatHarmonization::new(config()).unwrap();
        harmonizer.fit(&cohort(30)).unwrap();

        let mut input = cohort(6);
        if let HarmonizationInput::Bundle { covariates, .. } = &mut input {
            *covariates = covariates
                .clone()
                .with_categorical("batch", ["a", "b", "c", "a", "b", "z"])
                .unwrap();
        }
        let before = input.clone();
        let result = harmonizer.transform(&mut input);
        assert!(matches!(
            result,
            Err(HarmonizationError::ComBat(ComBatError::UnknownBatch(b))) if b == "z"
        ));
        assert_eq!(input, before);
    }

    #[test]
    fn test_failed_refit_keeps_previous_state() {
        let mut harmonizer = ComBatHarmonization::new(config()).unwrap();
        harmonizer.fit(&cohort(30)).unwrap();
        let fitted = harmonizer.state().clone();

        let mut input = cohort(30);
        if let HarmonizationInput::Bundle { covariates, .. } = &mut input {
            *covariates = covariates
                .clone()
                .with_categorical("batch", (0..30).map(|_| "a"))
                .unwrap();
        }
        assert!(harmonizer.fit(&input).is_err());
        assert_eq!(harmonizer.state(), &fitted);
    }

    #[test]
    fn test_config_out_of_bounds_at_fit() {
        let config = HarmonizationConfig::new()
            .with_feature_group(FeatureGroup::new("thickness", vec![0, 9]));
        let mut harmonizer = ComBatHarmonization::new(config).unwrap();
        assert!(matches!(
            harmonizer.fit(&cohort(30)),
            Err(HarmonizationError::InvalidConfig(_))
        ));
        assert!(!harmonizer.is_fitted());
    }

    #[test]
    fn test_save_load_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        let mut harmonizer = ComBatHarmonization::new(config())?;
        harmonizer.fit(&cohort(30))?;

        let tmp = tempfile::tempdir()?;
        let path = tmp.path().join("harmonizer.bin");
        harmonizer.save_to_file(&path)?;
        let loaded = ComBatHarmonization::load_from_file(&path)?;

        assert_eq!(loaded.extract_params()?, harmonizer.extract_params()?);

        let mut a = cohort(12);
        let mut b = cohort(12);
        assert_eq!(harmonizer.transform(&mut a)?, loaded.transform(&mut b)?);
        Ok(())
    }

    #[test]
    fn test_no_interest_only_passes_features_through() {
        let spec = NoInterestSpec::new("tiv", vec![0, 1]).with_continuous(["age"]);

        let mut plain =
            ComBatHarmonization::new(HarmonizationConfig::new().with_no_interest(spec.clone()))
                .unwrap();
        let mut input = cohort(30);
        let raw = input.clone();
        let out = plain.fit_transform(&mut input).unwrap();
        assert_eq!(out.data(), raw.data());
        assert!(out.covariates().is_none());
        assert_ne!(
            input.covariates().unwrap().continuous("tiv"),
            raw.covariates().unwrap().continuous("tiv")
        );

        let mut regression = ComBatHarmonization::new(
            HarmonizationConfig::new()
                .with_no_interest(spec)
                .with_regression_fit(true),
        )
        .unwrap();
        let mut input = cohort(30);
        let out = regression.fit_transform(&mut input).unwrap();
        assert_eq!(out.data().dim(), (30, 4));
        assert_eq!(out.data(), raw.data());
        assert_eq!(out.covariates(), input.covariates());
        assert_ne!(
            out.covariates().unwrap().continuous("tiv"),
            raw.covariates().unwrap().continuous("tiv")
        );
    }

    #[test]
    fn test_from_params_requires_every_estimate() {
        let mut harmonizer = ComBatHarmonization::new(config()).unwrap();
        harmonizer.fit(&cohort(30)).unwrap();
        let mut params = harmonizer.extract_params().unwrap();
        params.config = params
            .config
            .with_feature_group(FeatureGroup::new("area", vec![2]));
        assert!(matches!(
            ComBatHarmonization::from_params(params),
            Err(HarmonizationError::MissingEstimate(k)) if k == "group 'area'"
        ));
    }
}
