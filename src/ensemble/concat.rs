//! Second-level feature assembly

use crate::error::{Result, StackingError};
use crate::training::Prediction;
use ndarray::{concatenate as hstack_views, Array2, ArrayView2, Axis};

/// Stack per-estimator outputs column-wise, in order
///
/// A single-column prediction contributes one column, a block contributes
/// all of its columns in their original order. With `passthrough` the
/// original features lead the result.
pub fn concatenate(x: &Array2<f64>, predictions: Vec<Prediction>, passthrough: bool) -> Result<Array2<f64>> {
    let n_samples = x.nrows();
    for (idx, pred) in predictions.iter().enumerate() {
        if pred.nrows() != n_samples {
            return Err(StackingError::ShapeError {
                expected: format!("{} rows from estimator output {}", n_samples, idx),
                actual: format!("{} rows", pred.nrows()),
            });
        }
    }

    let blocks: Vec<Array2<f64>> = predictions.into_iter().map(Prediction::into_matrix).collect();
    let mut views: Vec<ArrayView2<f64>> = Vec::with_capacity(blocks.len() + 1);
    if passthrough {
        views.push(x.view());
    }
    views.extend(blocks.iter().map(|block| block.view()));

    if views.is_empty() {
        return Ok(Array2::zeros((n_samples, 0)));
    }
    Ok(hstack_views(Axis(1), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array1};

    #[test]
    fn test_column_vector_and_block() {
        let x = Array2::zeros((3, 4));
        let preds = vec![
            Prediction::Column(array![1.0, 2.0, 3.0]),
            Prediction::Columns(array![[0.1, 0.9], [0.2, 0.8], [0.3, 0.7]]),
        ];
        let out = concatenate(&x, preds, false).unwrap();
        assert_eq!(out.dim(), (3, 3));
        assert_eq!(out.column(0), array![1.0, 2.0, 3.0]);
        assert_eq!(out[[2, 2]], 0.7);
    }

    #[test]
    fn test_passthrough_leads() {
        let x = array![[10.0, 20.0], [30.0, 40.0]];
        let preds = vec![Prediction::Column(array![1.0, 2.0])];
        let out = concatenate(&x, preds, true).unwrap();
        assert_eq!(out, array![[10.0, 20.0, 1.0], [30.0, 40.0, 2.0]]);
    }

    #[test]
    fn test_row_mismatch() {
        let x = Array2::zeros((3, 1));
        let preds = vec![Prediction::Column(Array1::zeros(2))];
        let err = concatenate(&x, preds, false).unwrap_err();
        assert!(matches!(err, StackingError::ShapeError { .. }));
    }
}
