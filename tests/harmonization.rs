use approx::assert_abs_diff_eq;
use combat_harmonize::harmonization::{
    ComBatHarmonization, CovariateTable, FeatureGroup, HarmonizationConfig, HarmonizationError,
    HarmonizationInput, NoInterestSpec, StoreKey,
};
use ndarray::{s, Array2};
use tracing_subscriber::EnvFilter;

const SITES: [&str; 3] = ["siteA", "siteB", "siteC"];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic multi-site cohort. `offset` shifts the sample index so
/// held-out cohorts differ from the training one.
fn cohort(n: usize, n_features: usize, offset: usize) -> HarmonizationInput {
    let site_shift = [0.0, 0.8, -0.5];
    let site_scale = [1.0, 1.6, 0.7];
    let data = Array2::from_shape_fn((n, n_features), |(i, j)| {
        let k = i + offset;
        let site = k % 3;
        let age = 20.0 + ((k * 13) % 50) as f64;
        2.0 + 0.5 * j as f64
            + 0.01 * age
            + site_shift[site]
            + site_scale[site] * 0.3 * ((k * 7 + j * 11) as f64).sin()
    });
    let covariates = CovariateTable::new()
        .with_categorical("batch", (0..n).map(|i| SITES[(i + offset) % 3]))
        .unwrap()
        .with_categorical(
            "sex",
            (0..n).map(|i| if ((i + offset) / 3) % 2 == 0 { "F" } else { "M" }),
        )
        .unwrap()
        .with_continuous("age", (0..n).map(|i| 20.0 + (((i + offset) * 13) % 50) as f64))
        .unwrap()
        .with_continuous(
            "tiv",
            (0..n).map(|i| {
                let k = i + offset;
                1500.0 + 35.0 * ((k * 5) as f64).cos() + [0.0, 110.0, -70.0][k % 3]
            }),
        )
        .unwrap();
    HarmonizationInput::new(data, covariates)
}

fn thickness() -> FeatureGroup {
    FeatureGroup::new("thickness", vec![0, 1])
        .with_categorical(["sex"])
        .with_continuous(["age"])
}

#[test]
fn test_thickness_scenario() {
    init_tracing();
    let mut harmonizer =
        ComBatHarmonization::new(HarmonizationConfig::new().with_feature_group(thickness()))
            .unwrap();
    harmonizer.fit(&cohort(50, 2, 0)).unwrap();

    let store = harmonizer.store().unwrap();
    assert_eq!(store.len(), 1);
    assert!(store.contains(&StoreKey::group("thickness")));

    let mut held_out = cohort(10, 2, 50);
    let raw = held_out.data().clone();
    let out = harmonizer.transform(&mut held_out).unwrap().into_data();
    assert_eq!(out.dim(), (10, 2));
    assert!(out.iter().all(|v| v.is_finite()));
    assert!(out
        .iter()
        .zip(raw.iter())
        .any(|(a, b)| (a - b).abs() > 1e-6));
}

#[test]
fn test_refit_is_deterministic() {
    let config = HarmonizationConfig::new()
        .with_no_interest(NoInterestSpec::new("tiv", vec![2]).with_continuous(["age"]))
        .with_feature_group(thickness());

    let mut first = ComBatHarmonization::new(config.clone()).unwrap();
    first.fit(&cohort(45, 3, 0)).unwrap();
    let mut second = ComBatHarmonization::new(config).unwrap();
    second.fit(&cohort(45, 3, 0)).unwrap();
    assert_eq!(first.store(), second.store());

    // Re-fitting replaces the store rather than accumulating.
    let before = first.store().cloned();
    first.fit(&cohort(45, 3, 0)).unwrap();
    assert_eq!(first.store().cloned(), before);
}

#[test]
fn test_group_slices_match_single_group_runs() {
    let a = FeatureGroup::new("a", vec![0, 2]).with_continuous(["age"]);
    let b = FeatureGroup::new("b", vec![3, 1])
        .with_categorical(["sex"])
        .with_continuous(["age"]);

    let mut both = ComBatHarmonization::new(
        HarmonizationConfig::new()
            .with_feature_group(a.clone())
            .with_feature_group(b.clone()),
    )
    .unwrap();
    let mut only_a =
        ComBatHarmonization::new(HarmonizationConfig::new().with_feature_group(a)).unwrap();
    let mut only_b =
        ComBatHarmonization::new(HarmonizationConfig::new().with_feature_group(b)).unwrap();

    let train = cohort(48, 4, 0);
    both.fit(&train).unwrap();
    only_a.fit(&train).unwrap();
    only_b.fit(&train).unwrap();

    let joint = both.transform(&mut cohort(12, 4, 48)).unwrap().into_data();
    let left = only_a.transform(&mut cohort(12, 4, 48)).unwrap().into_data();
    let right = only_b.transform(&mut cohort(12, 4, 48)).unwrap().into_data();

    assert_eq!(joint.dim(), (12, 4));
    assert_eq!(joint.slice(s![.., 0..2]), left);
    assert_eq!(joint.slice(s![.., 2..4]), right);
}

#[test]
fn test_fit_leaves_covariates_and_transform_touches_one_column() {
    let config = HarmonizationConfig::new()
        .with_no_interest(NoInterestSpec::new("tiv", vec![0, 1]).with_continuous(["age"]))
        .with_feature_group(
            FeatureGroup::new("thickness", vec![0, 1])
                .with_categorical(["sex"])
                .with_continuous(["age", "tiv"]),
        );
    let mut harmonizer = ComBatHarmonization::new(config).unwrap();

    let mut input = cohort(40, 2, 0);
    let pristine = input.clone();
    harmonizer.fit(&input).unwrap();
    assert_eq!(input, pristine);

    harmonizer.transform(&mut input).unwrap();
    let after = input.covariates().unwrap();
    let before = pristine.covariates().unwrap();
    for name in before.column_names() {
        if name == "tiv" {
            assert_ne!(after.column(name), before.column(name));
        } else {
            assert_eq!(after.column(name), before.column(name), "column {}", name);
        }
    }
    assert_eq!(input.data(), pristine.data());
}

#[test]
fn test_transform_requires_fit() {
    let harmonizer =
        ComBatHarmonization::new(HarmonizationConfig::new().with_feature_group(thickness()))
            .unwrap();
    let result = harmonizer.transform(&mut cohort(5, 2, 0));
    assert!(matches!(result, Err(HarmonizationError::NotFitted)));
}

#[test]
fn test_reference_batch_is_identity() {
    let config = HarmonizationConfig::new()
        .with_ref_batch("siteB")
        .with_feature_group(thickness());
    let mut harmonizer = ComBatHarmonization::new(config).unwrap();
    harmonizer.fit(&cohort(45, 2, 0)).unwrap();

    let mut held_out = cohort(12, 2, 45);
    let raw = held_out.data().clone();
    let out = harmonizer.transform(&mut held_out).unwrap().into_data();

    let batch = held_out.covariates().unwrap().labels("batch").unwrap();
    let mut reference_rows = 0;
    for (i, label) in batch.iter().enumerate() {
        if label == "siteB" {
            reference_rows += 1;
            for j in 0..2 {
                assert_abs_diff_eq!(out[[i, j]], raw[[i, j]], epsilon = 1e-12);
            }
        }
    }
    assert_eq!(reference_rows, 4);
}

#[test]
fn test_indexed_input_not_implemented() {
    let mut harmonizer =
        ComBatHarmonization::new(HarmonizationConfig::new().with_feature_group(thickness()))
            .unwrap();
    let input = HarmonizationInput::Indexed {
        data: Array2::zeros((3, 2)),
        sample_ids: vec![0, 1, 2],
    };
    assert!(matches!(
        harmonizer.fit(&input),
        Err(HarmonizationError::NotImplemented(_))
    ));
}

#[test]
fn test_config_and_input_from_json() {
    let config = HarmonizationConfig::from_json_str(
        r#"{
            "ref_batch": "a",
            "feature_groups": [
                {"name": "thickness", "columns": [0, 1], "continuous": ["age"]}
            ]
        }"#,
    )
    .unwrap();
    let mut harmonizer = ComBatHarmonization::new(config).unwrap();

    let mut input = HarmonizationInput::from_json_str(
        r#"{
            "data": [[1.0, 2.0], [1.4, 2.3], [0.8, 1.7], [1.1, 2.2],
                     [2.0, 3.1], [2.5, 3.6], [2.2, 3.0], [2.9, 3.9]],
            "covariates": {
                "batch": ["a", "a", "a", "a", "b", "b", "b", "b"],
                "age": [30, 41, 52, 47, 33, 45, 50, 38]
            }
        }"#,
    )
    .unwrap();
    let raw = input.data().clone();
    let out = harmonizer.fit_transform(&mut input).unwrap().into_data();
    assert_eq!(out.slice(s![0..4, ..]), raw.slice(s![0..4, ..]));
}

#[test]
fn test_save_and_reload() -> Result<(), Box<dyn std::error::Error>> {
    let mut harmonizer =
        ComBatHarmonization::new(HarmonizationConfig::new().with_feature_group(thickness()))?;
    harmonizer.fit(&cohort(45, 2, 0))?;

    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("thickness.bin");
    harmonizer.save_to_file(&path)?;
    let loaded = ComBatHarmonization::load_from_file(&path)?;

    let expected = harmonizer.transform(&mut cohort(9, 2, 45))?;
    let got = loaded.transform(&mut cohort(9, 2, 45))?;
    assert_eq!(expected, got);
    Ok(())
}
