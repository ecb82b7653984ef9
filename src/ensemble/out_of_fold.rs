//! Out-of-fold predictions
//!
//! Every training row receives a prediction from a copy of the estimator
//! that was fit on folds excluding that row.

use super::response::ResponseMethod;
use crate::error::{Result, StackingError};
use crate::training::{CVSplit, Estimator, Prediction};
use crate::utils::ParallelBackend;
use ndarray::{Array1, Array2, Axis};
use tracing::debug;

/// Check that the test sets partition `0..n_samples`
///
/// Each row must appear in exactly one test set, no index may be out of
/// range and no split may train on its own test rows.
pub fn check_coverage(splits: &[CVSplit], n_samples: usize) -> Result<()> {
    if splits.is_empty() {
        return Err(StackingError::ConfigError(
            "cross-validation produced no splits".to_string(),
        ));
    }

    let mut seen = vec![0usize; n_samples];
    for split in splits {
        let mut in_test = vec![false; n_samples];
        for &idx in &split.test_indices {
            if idx >= n_samples {
                return Err(StackingError::ConfigError(format!(
                    "split {} has test index {} but there are only {} samples",
                    split.fold_idx, idx, n_samples
                )));
            }
            seen[idx] += 1;
            in_test[idx] = true;
        }
        for &idx in &split.train_indices {
            if idx >= n_samples {
                return Err(StackingError::ConfigError(format!(
                    "split {} has train index {} but there are only {} samples",
                    split.fold_idx, idx, n_samples
                )));
            }
            if in_test[idx] {
                return Err(StackingError::ConfigError(format!(
                    "split {} uses row {} for both training and testing",
                    split.fold_idx, idx
                )));
            }
        }
    }

    let uncovered = seen.iter().filter(|&&count| count == 0).count();
    if uncovered > 0 {
        return Err(StackingError::ConfigError(format!(
            "cross-validation test folds must cover every row exactly once; {} of {} rows are never tested",
            uncovered, n_samples
        )));
    }
    if let Some(row) = seen.iter().position(|&count| count > 1) {
        return Err(StackingError::ConfigError(format!(
            "cross-validation test folds must cover every row exactly once; row {} is tested {} times",
            row, seen[row]
        )));
    }
    Ok(())
}

/// Fit a fresh copy per split and scatter the held-out predictions back
/// into original row order
#[allow(clippy::too_many_arguments)]
pub fn predict_out_of_fold(
    name: &str,
    estimator: &dyn Estimator,
    x: &Array2<f64>,
    y: &Array1<f64>,
    splits: &[CVSplit],
    method: ResponseMethod,
    sample_weight: Option<&Array1<f64>>,
    backend: &ParallelBackend,
) -> Result<Prediction> {
    let n_samples = x.nrows();
    let fold_ids: Vec<usize> = (0..splits.len()).collect();
    let fold_outputs = backend.map(name, fold_ids, |fold| {
        let split = &splits[fold];
        let mut model = estimator.fresh_copy();
        let x_train = x.select(Axis(0), &split.train_indices);
        let y_train = y.select(Axis(0), &split.train_indices);
        let w_train = sample_weight.map(|w| w.select(Axis(0), &split.train_indices));
        model.fit(&x_train, &y_train, w_train.as_ref())?;

        let x_test = x.select(Axis(0), &split.test_indices);
        let prediction = method.call(model.as_ref(), &x_test)?;
        debug!(
            estimator = name,
            fold = split.fold_idx,
            n_train = split.train_indices.len(),
            n_test = split.test_indices.len(),
            "out-of-fold predictions computed"
        );
        Ok((fold, prediction))
    })?;

    let width_error = |fold: usize, expected: usize, actual: usize| StackingError::ShapeError {
        expected: format!("{} output columns from '{}' on every fold", expected, name),
        actual: format!("{} columns on fold {}", actual, fold),
    };

    let (single_column, width) = match fold_outputs.first() {
        Some((_, prediction)) => (matches!(prediction, Prediction::Column(_)), prediction.ncols()),
        None => {
            return Err(StackingError::ConfigError(
                "cross-validation produced no splits".to_string(),
            ))
        }
    };

    if single_column {
        let mut out = Array1::zeros(n_samples);
        for (fold, prediction) in fold_outputs {
            let split = &splits[fold];
            match prediction {
                Prediction::Column(values) => {
                    for (&row, &value) in split.test_indices.iter().zip(values.iter()) {
                        out[row] = value;
                    }
                }
                Prediction::Columns(block) => return Err(width_error(split.fold_idx, 1, block.ncols())),
            }
        }
        return Ok(Prediction::Column(out));
    }

    let mut out = Array2::zeros((n_samples, width));
    for (fold, prediction) in fold_outputs {
        let split = &splits[fold];
        let block = match prediction {
            Prediction::Columns(block) if block.ncols() == width => block,
            other => return Err(width_error(split.fold_idx, width, other.ncols())),
        };
        for (&row, values) in split.test_indices.iter().zip(block.rows()) {
            out.row_mut(row).assign(&values);
        }
    }
    Ok(Prediction::Columns(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::{
        check_fit_input, CVStrategy, CrossValidator, DummyClassifier, EstimatorKind,
    };
    use ndarray::array;

    /// Predicts 1.0 for rows whose id (column 0) it was trained on, 0.0 otherwise
    #[derive(Debug, Clone, Default)]
    struct MemorizingSpy {
        seen: Vec<f64>,
    }

    impl Estimator for MemorizingSpy {
        fn name(&self) -> &str {
            "MemorizingSpy"
        }

        fn kind(&self) -> EstimatorKind {
            EstimatorKind::Regressor
        }

        fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
            check_fit_input(x, y, sample_weight)?;
            self.seen = x.column(0).to_vec();
            Ok(())
        }

        fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
            Ok(x.column(0).mapv(|id| if self.seen.contains(&id) { 1.0 } else { 0.0 }))
        }

        fn fresh_copy(&self) -> Box<dyn Estimator> {
            Box::new(Self::default())
        }

        fn boxed_clone(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }
    }

    fn ids(n: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, 1), |(i, _)| i as f64)
    }

    #[test]
    fn test_no_row_is_predicted_by_a_model_that_saw_it() {
        let n = 20;
        let x = ids(n);
        let y = Array1::zeros(n);
        let splits = CrossValidator::new(CVStrategy::KFold { n_splits: 4, shuffle: true })
            .with_random_state(0)
            .split(n, None, None)
            .unwrap();

        let out = predict_out_of_fold(
            "spy",
            &MemorizingSpy::default(),
            &x,
            &y,
            &splits,
            ResponseMethod::Predict,
            None,
            &ParallelBackend::default(),
        )
        .unwrap();

        match out {
            Prediction::Column(values) => assert!(values.iter().all(|&v| v == 0.0)),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_probability_blocks_keep_row_order() {
        let x = ids(6);
        let y = array![0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
        let splits = CrossValidator::new(CVStrategy::KFold { n_splits: 3, shuffle: false })
            .split(6, None, None)
            .unwrap();

        let out = predict_out_of_fold(
            "dummy",
            &DummyClassifier::default(),
            &x,
            &y,
            &splits,
            ResponseMethod::PredictProba,
            None,
            &ParallelBackend::sequential(),
        )
        .unwrap();
        assert_eq!(out.nrows(), 6);
        assert_eq!(out.ncols(), 2);
    }

    #[test]
    fn test_missing_class_in_fold_is_shape_error() {
        // The first fold trains on a single class, so its probability block is one column wide
        let x = ids(4);
        let y = array![1.0, 1.0, 0.0, 0.0];
        let splits = vec![
            CVSplit::new(vec![0, 1], vec![2, 3], 0),
            CVSplit::new(vec![1, 2, 3], vec![0, 1], 1),
        ];
        let err = predict_out_of_fold(
            "dummy",
            &DummyClassifier::default(),
            &x,
            &y,
            &splits,
            ResponseMethod::PredictProba,
            None,
            &ParallelBackend::sequential(),
        )
        .unwrap_err();
        assert!(matches!(err, StackingError::ShapeError { .. }));
    }

    #[test]
    fn test_coverage_checks() {
        let full = vec![
            CVSplit::new(vec![2, 3], vec![0, 1], 0),
            CVSplit::new(vec![0, 1], vec![2, 3], 1),
        ];
        assert!(check_coverage(&full, 4).is_ok());

        let gap = vec![CVSplit::new(vec![2, 3], vec![0, 1], 0)];
        assert!(check_coverage(&gap, 4).unwrap_err().is_config_error());

        let twice = vec![
            CVSplit::new(vec![2, 3], vec![0, 1], 0),
            CVSplit::new(vec![0], vec![1, 2, 3], 1),
        ];
        assert!(check_coverage(&twice, 4).is_err());

        let leaky = vec![
            CVSplit::new(vec![0, 2, 3], vec![0, 1], 0),
            CVSplit::new(vec![0, 1], vec![2, 3], 1),
        ];
        assert!(check_coverage(&leaky, 4).is_err());

        let out_of_range = vec![CVSplit::new(vec![0], vec![1, 7], 0)];
        assert!(check_coverage(&out_of_range, 4).is_err());
    }
}
