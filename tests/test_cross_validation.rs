//! Integration test: splitters feeding out-of-fold prediction

use ndarray::{Array1, Array2};
use stacking::ensemble::{check_coverage, predict_out_of_fold, ResponseMethod};
use stacking::prelude::*;

fn imbalanced_labels(n: usize) -> Array1<f64> {
    // One positive for every four negatives
    Array1::from_shape_fn(n, |i| if i % 5 == 0 { 1.0 } else { 0.0 })
}

#[test]
fn test_partitioning_splitters_pass_coverage() {
    let n = 30;
    let y = imbalanced_labels(n);
    let groups = Array1::from_shape_fn(n, |i| (i / 3) as i64);

    let splitters = vec![
        CrossValidator::new(CVStrategy::KFold { n_splits: 4, shuffle: false }),
        CrossValidator::new(CVStrategy::KFold { n_splits: 4, shuffle: true }).with_random_state(1),
        CrossValidator::new(CVStrategy::StratifiedKFold { n_splits: 3, shuffle: true }).with_random_state(2),
        CrossValidator::new(CVStrategy::LeaveOneOut),
        CrossValidator::new(CVStrategy::GroupKFold { n_splits: 5 }),
    ];

    for cv in splitters {
        let splits = cv.split(n, Some(&y), Some(&groups)).unwrap();
        assert!(check_coverage(&splits, n).is_ok(), "{:?} should partition the rows", cv.strategy());
    }
}

#[test]
fn test_non_partitioning_split_lists_fail_coverage() {
    let n = 30;
    let kfold = CrossValidator::new(CVStrategy::KFold { n_splits: 3, shuffle: false })
        .split(n, None, None)
        .unwrap();

    // Only the last fold is ever tested
    let forward = vec![kfold[2].clone()];
    let err = check_coverage(&forward, n).unwrap_err();
    assert!(err.is_config_error());
    assert!(err.to_string().contains("never tested"), "{}", err);

    // The same partition twice tests every row twice
    let repeated: Vec<CVSplit> = kfold.iter().chain(kfold.iter()).cloned().collect();
    let err = check_coverage(&repeated, n).unwrap_err();
    assert!(err.to_string().contains("tested 2 times"), "{}", err);
}

#[test]
fn test_stratified_folds_keep_class_ratio() {
    let y = imbalanced_labels(50);
    let splits = CrossValidator::new(CVStrategy::StratifiedKFold { n_splits: 5, shuffle: false })
        .split(50, Some(&y), None)
        .unwrap();
    for split in &splits {
        let positives = split.test_indices.iter().filter(|&&i| y[i] == 1.0).count();
        assert_eq!(split.test_indices.len(), 10);
        assert_eq!(positives, 2);
    }
}

#[test]
fn test_out_of_fold_with_leave_one_out() {
    // A mean predictor left out of row i predicts the mean of the others
    let n = 5;
    let x = Array2::zeros((n, 1));
    let y = Array1::from_vec(vec![1.0, 2.0, 3.0, 4.0, 10.0]);
    let splits = CrossValidator::new(CVStrategy::LeaveOneOut).split(n, None, None).unwrap();

    let out = predict_out_of_fold(
        "mean",
        &DummyRegressor::default(),
        &x,
        &y,
        &splits,
        ResponseMethod::Predict,
        None,
        &ParallelBackend::default(),
    )
    .unwrap();

    let total: f64 = y.sum();
    let expected = y.mapv(|v| (total - v) / (n - 1) as f64);
    match out {
        Prediction::Column(values) => {
            for (got, want) in values.iter().zip(expected.iter()) {
                assert!((got - want).abs() < 1e-12, "{} != {}", got, want);
            }
        }
        other => panic!("expected a single column, got {:?}", other),
    }
}

#[test]
fn test_split_lists_serialize() {
    let splits = CrossValidator::new(CVStrategy::KFold { n_splits: 2, shuffle: false })
        .split(4, None, None)
        .unwrap();
    let json = serde_json::to_string(&splits).unwrap();
    let restored: Vec<CVSplit> = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, splits);
    assert_eq!(restored[1].test_indices, vec![2, 3]);
}
