//! Linear model implementations

use super::models::{
    check_fit_input, check_n_features, class_index, invalid_param, normalized_weights,
    unique_classes, unknown_param, Capabilities, Estimator, EstimatorKind, ParamValue, Params,
    Prediction,
};
use crate::error::{Result, StackingError};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Solve symmetric positive-definite system Ax = b using Cholesky decomposition.
/// Retries once with a small ridge if the matrix is not positive definite.
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>, allow_retry: bool) -> Option<Array1<f64>> {
    let n = a.nrows();
    if n != a.ncols() || n != b.len() {
        return None;
    }

    // Cholesky decomposition: A = L * L^T
    let mut l = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = 0.0;
            for k in 0..j {
                sum += l[[i, k]] * l[[j, k]];
            }

            if i == j {
                let diag = a[[i, i]] - sum;
                if diag <= 0.0 {
                    if !allow_retry {
                        return None;
                    }
                    let mut a_reg = a.clone();
                    let ridge = 1e-8 * a.diag().iter().map(|v| v.abs()).sum::<f64>() / n as f64;
                    for k in 0..n {
                        a_reg[[k, k]] += ridge.max(1e-12);
                    }
                    return cholesky_solve(&a_reg, b, false);
                }
                l[[i, j]] = diag.sqrt();
            } else {
                l[[i, j]] = (a[[i, j]] - sum) / l[[j, j]];
            }
        }
    }

    // Forward substitution: L * y = b
    let mut y = Array1::zeros(n);
    for i in 0..n {
        let mut sum = 0.0;
        for j in 0..i {
            sum += l[[i, j]] * y[j];
        }
        y[i] = (b[i] - sum) / l[[i, i]];
    }

    // Backward substitution: L^T * x = y
    let mut x = Array1::zeros(n);
    for i in (0..n).rev() {
        let mut sum = 0.0;
        for j in (i + 1)..n {
            sum += l[[j, i]] * x[j];
        }
        x[i] = (y[i] - sum) / l[[i, i]];
    }

    Some(x)
}

/// Gauss-Jordan inverse with partial pivoting (fallback for near-singular systems)
fn matrix_inverse(m: &Array2<f64>) -> Option<Array2<f64>> {
    let n = m.nrows();
    if n != m.ncols() {
        return None;
    }

    let mut aug = Array2::zeros((n, 2 * n));
    for i in 0..n {
        for j in 0..n {
            aug[[i, j]] = m[[i, j]];
        }
        aug[[i, n + i]] = 1.0;
    }

    for col in 0..n {
        let mut max_row = col;
        for row in col + 1..n {
            if aug[[row, col]].abs() > aug[[max_row, col]].abs() {
                max_row = row;
            }
        }
        if max_row != col {
            for j in 0..2 * n {
                aug.swap([col, j], [max_row, j]);
            }
        }
        if aug[[col, col]].abs() < 1e-10 {
            return None;
        }

        let pivot = aug[[col, col]];
        for j in 0..2 * n {
            aug[[col, j]] /= pivot;
        }
        for row in 0..n {
            if row != col {
                let factor = aug[[row, col]];
                for j in 0..2 * n {
                    aug[[row, j]] -= factor * aug[[col, j]];
                }
            }
        }
    }

    Some(aug.slice(ndarray::s![.., n..]).to_owned())
}

/// Per-feature centering and scaling learned at fit time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Standardizer {
    mean: Array1<f64>,
    scale: Array1<f64>,
}

impl Standardizer {
    pub(crate) fn fit(x: &Array2<f64>, weights: &Array1<f64>) -> Self {
        let mean = x.t().dot(weights);
        let centered = x - &mean.view().insert_axis(Axis(0));
        let var = centered.mapv(|v| v * v).t().dot(weights);
        // Constant columns keep unit scale
        let scale = var.mapv(|v| if v > 1e-12 { v.sqrt() } else { 1.0 });
        Self { mean, scale }
    }

    pub(crate) fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        (x - &self.mean.view().insert_axis(Axis(0))) / &self.scale.view().insert_axis(Axis(0))
    }

    pub(crate) fn n_features(&self) -> usize {
        self.mean.len()
    }
}

/// Weighted mean of squared row norms (bias column included)
pub(crate) fn mean_sq_norm(x: &Array2<f64>, weights: &Array1<f64>) -> f64 {
    x.rows()
        .into_iter()
        .zip(weights.iter())
        .map(|(row, &w)| w * (row.dot(&row) + 1.0))
        .sum()
}

/// Linear regression model (ordinary or ridge least squares)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearRegression {
    /// Fitted coefficients (weights)
    pub coefficients: Option<Array1<f64>>,
    /// Fitted intercept (bias)
    pub intercept: Option<f64>,
    /// Whether to fit intercept
    pub fit_intercept: bool,
    /// Regularization strength (L2)
    pub alpha: f64,
}

impl Default for LinearRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearRegression {
    /// Create a new linear regression model
    pub fn new() -> Self {
        Self {
            coefficients: None,
            intercept: None,
            fit_intercept: true,
            alpha: 0.0,
        }
    }

    /// Enable/disable fitting intercept
    pub fn with_fit_intercept(mut self, fit_intercept: bool) -> Self {
        self.fit_intercept = fit_intercept;
        self
    }

    /// Set regularization strength (Ridge regression)
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn is_fitted(&self) -> bool {
        self.coefficients.is_some()
    }
}

impl Estimator for LinearRegression {
    fn name(&self) -> &str {
        "LinearRegression"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Regressor
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::predict_only().with_sample_weight()
    }

    /// Weighted least squares: rows are scaled by sqrt(w) around the weighted mean
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        let n_features = x.ncols();
        let weights = normalized_weights(x.nrows(), sample_weight)?;

        let (x_mean, y_mean) = if self.fit_intercept {
            (x.t().dot(&weights), y.dot(&weights))
        } else {
            (Array1::zeros(n_features), 0.0)
        };

        let sqrt_w = weights.mapv(f64::sqrt);
        let x_w = (x - &x_mean.view().insert_axis(Axis(0))) * &sqrt_w.view().insert_axis(Axis(1));
        let y_w = (y - y_mean) * &sqrt_w;

        // Solve normal equations: (X^T X + alpha*I) * w = X^T y
        let mut xtx = x_w.t().dot(&x_w);
        for i in 0..n_features {
            xtx[[i, i]] += self.alpha;
        }
        let xty = x_w.t().dot(&y_w);

        let coefficients = match cholesky_solve(&xtx, &xty, true) {
            Some(coef) => coef,
            None => match matrix_inverse(&xtx) {
                Some(inv) => inv.dot(&xty),
                None => {
                    return Err(StackingError::ComputationError(
                        "Matrix is singular, cannot solve least squares".to_string(),
                    ))
                }
            },
        };

        self.intercept = Some(y_mean - coefficients.dot(&x_mean));
        self.coefficients = Some(coefficients);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let coefficients = self.coefficients.as_ref().ok_or(StackingError::ModelNotFitted)?;
        check_n_features(coefficients.len(), x)?;
        Ok(x.dot(coefficients) + self.intercept.unwrap_or(0.0))
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        Box::new(Self::new().with_fit_intercept(self.fit_intercept).with_alpha(self.alpha))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("alpha".to_string(), ParamValue::Float(self.alpha));
        params.insert("fit_intercept".to_string(), ParamValue::Bool(self.fit_intercept));
        params
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        match key {
            "alpha" => {
                self.alpha = value
                    .as_f64()
                    .filter(|a| *a >= 0.0)
                    .ok_or_else(|| invalid_param(key, value, "must be a non-negative number"))?;
            }
            "fit_intercept" => {
                self.fit_intercept = value
                    .as_bool()
                    .ok_or_else(|| invalid_param(key, value, "must be a boolean"))?;
            }
            _ => return Err(unknown_param(self.name(), key, value)),
        }
        Ok(())
    }
}

/// Ridge regression: least squares with an L2 penalty (default `alpha = 1.0`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RidgeRegression {
    inner: LinearRegression,
}

impl Default for RidgeRegression {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl RidgeRegression {
    pub fn new(alpha: f64) -> Self {
        Self {
            inner: LinearRegression::new().with_alpha(alpha),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.inner.alpha
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.inner.coefficients.as_ref()
    }
}

impl Estimator for RidgeRegression {
    fn name(&self) -> &str {
        "RidgeRegression"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Regressor
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.inner.fit(x, y, sample_weight)
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.inner.predict(x)
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        Box::new(Self::new(self.inner.alpha))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        self.inner.params()
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        match key {
            "alpha" | "fit_intercept" => self.inner.set_param(key, value),
            _ => Err(unknown_param(self.name(), key, value)),
        }
    }
}

/// Logistic regression; binary, or one-vs-rest for more than two classes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogisticRegression {
    /// Regularization strength (L2)
    pub alpha: f64,
    /// Maximum iterations
    pub max_iter: usize,
    /// Convergence tolerance on the gradient norm
    pub tol: f64,
    /// One row of coefficients per binary sub-problem, in standardized space
    coefficients: Option<Array2<f64>>,
    intercepts: Option<Array1<f64>>,
    scaler: Option<Standardizer>,
    classes: Vec<f64>,
}

impl Default for LogisticRegression {
    fn default() -> Self {
        Self::new()
    }
}

impl LogisticRegression {
    /// Create a new logistic regression model
    pub fn new() -> Self {
        Self {
            alpha: 0.01,
            max_iter: 1000,
            tol: 1e-6,
            coefficients: None,
            intercepts: None,
            scaler: None,
            classes: Vec::new(),
        }
    }

    /// Set regularization strength
    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set maximum iterations
    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    fn sigmoid(z: f64) -> f64 {
        1.0 / (1.0 + (-z).exp())
    }

    /// Gradient descent on the weighted, L2-penalized log loss for one 0/1 target
    fn fit_binary(&self, xs: &Array2<f64>, target: &Array1<f64>, weights: &Array1<f64>) -> (Array1<f64>, f64) {
        let n_features = xs.ncols();
        let mut w = Array1::zeros(n_features);
        let mut b = 0.0;

        // 1/L step for the logistic loss (curvature bounded by 1/4)
        let step = 1.0 / (0.25 * mean_sq_norm(xs, weights) + self.alpha);

        for _iter in 0..self.max_iter {
            let z = xs.dot(&w) + b;
            let residual = (z.mapv(Self::sigmoid) - target) * weights;
            let grad_w = xs.t().dot(&residual) + self.alpha * &w;
            let grad_b = residual.sum();

            let grad_norm = (grad_w.mapv(|v| v * v).sum() + grad_b * grad_b).sqrt();
            if grad_norm < self.tol {
                break;
            }
            w = w - step * grad_w;
            b -= step * grad_b;
        }
        (w, b)
    }

    fn raw_scores(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (coef, intercepts, scaler) = match (&self.coefficients, &self.intercepts, &self.scaler) {
            (Some(c), Some(i), Some(s)) => (c, i, s),
            _ => return Err(StackingError::ModelNotFitted),
        };
        check_n_features(scaler.n_features(), x)?;
        let xs = scaler.transform(x);
        Ok(xs.dot(&coef.t()) + &intercepts.view().insert_axis(Axis(0)))
    }
}

impl Estimator for LogisticRegression {
    fn name(&self) -> &str {
        "LogisticRegression"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Classifier
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::predict_only()
            .with_predict_proba()
            .with_decision_function()
            .with_sample_weight()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        let classes = unique_classes(y);
        if classes.len() < 2 {
            return Err(StackingError::ValidationError(format!(
                "LogisticRegression needs at least 2 classes, got {}",
                classes.len()
            )));
        }

        let weights = normalized_weights(x.nrows(), sample_weight)?;
        let scaler = Standardizer::fit(x, &weights);
        let xs = scaler.transform(x);

        // Binary problems train a single "positive = classes[1]" model
        let positives: Vec<f64> = if classes.len() == 2 {
            vec![classes[1]]
        } else {
            classes.clone()
        };

        let mut coefficients = Array2::zeros((positives.len(), x.ncols()));
        let mut intercepts = Array1::zeros(positives.len());
        for (k, &positive) in positives.iter().enumerate() {
            let target = y.mapv(|v| if (v - positive).abs() < 1e-9 { 1.0 } else { 0.0 });
            let (w, b) = self.fit_binary(&xs, &target, &weights);
            coefficients.row_mut(k).assign(&w);
            intercepts[k] = b;
        }

        self.coefficients = Some(coefficients);
        self.intercepts = Some(intercepts);
        self.scaler = Some(scaler);
        self.classes = classes;
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let scores = self.raw_scores(x)?;
        let labels = if self.classes.len() == 2 {
            scores.column(0).mapv(|s| if s >= 0.0 { self.classes[1] } else { self.classes[0] })
        } else {
            scores
                .rows()
                .into_iter()
                .map(|row| self.classes[argmax(row.iter().copied())])
                .collect()
        };
        Ok(labels)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let scores = self.raw_scores(x)?;
        let n_samples = scores.nrows();
        let n_classes = self.classes.len();
        let mut proba = Array2::zeros((n_samples, n_classes));

        if n_classes == 2 {
            for i in 0..n_samples {
                let p = Self::sigmoid(scores[[i, 0]]);
                proba[[i, 0]] = 1.0 - p;
                proba[[i, 1]] = p;
            }
        } else {
            // One-vs-rest: normalize the independent sigmoids
            for i in 0..n_samples {
                let mut row_sum = 0.0;
                for k in 0..n_classes {
                    let p = Self::sigmoid(scores[[i, k]]);
                    proba[[i, k]] = p;
                    row_sum += p;
                }
                if row_sum > 0.0 {
                    proba.row_mut(i).mapv_inplace(|p| p / row_sum);
                }
            }
        }
        Ok(proba)
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Prediction> {
        let scores = self.raw_scores(x)?;
        if self.classes.len() == 2 {
            Ok(Prediction::Column(scores.column(0).to_owned()))
        } else {
            Ok(Prediction::Columns(scores))
        }
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        let mut copy = Self::new().with_alpha(self.alpha).with_max_iter(self.max_iter);
        copy.tol = self.tol;
        Box::new(copy)
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("alpha".to_string(), ParamValue::Float(self.alpha));
        params.insert("max_iter".to_string(), ParamValue::Int(self.max_iter as i64));
        params.insert("tol".to_string(), ParamValue::Float(self.tol));
        params
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        match key {
            "alpha" => {
                self.alpha = value
                    .as_f64()
                    .filter(|a| *a >= 0.0)
                    .ok_or_else(|| invalid_param(key, value, "must be a non-negative number"))?;
            }
            "max_iter" => {
                self.max_iter = value
                    .as_usize()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| invalid_param(key, value, "must be a positive integer"))?;
            }
            "tol" => {
                self.tol = value
                    .as_f64()
                    .filter(|t| *t > 0.0)
                    .ok_or_else(|| invalid_param(key, value, "must be positive"))?;
            }
            _ => return Err(unknown_param(self.name(), key, value)),
        }
        Ok(())
    }
}

/// Index of the largest value; first wins on ties
pub(crate) fn argmax(values: impl Iterator<Item = f64>) -> usize {
    let mut best_idx = 0;
    let mut best = f64::NEG_INFINITY;
    for (idx, v) in values.enumerate() {
        if v > best {
            best = v;
            best_idx = idx;
        }
    }
    best_idx
}

/// Map labels to `0/1` targets for a binary sub-problem; used by the SVM as well
pub(crate) fn binary_targets(y: &Array1<f64>, classes: &[f64], positive: f64) -> Result<Array1<f64>> {
    y.iter()
        .map(|&v| match class_index(classes, v) {
            Some(_) if (v - positive).abs() < 1e-9 => Ok(1.0),
            Some(_) => Ok(0.0),
            None => Err(StackingError::ValidationError(format!("unknown label {}", v))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_linear_regression_exact_fit() {
        let x = array![[1.0, 0.0], [2.0, 1.0], [3.0, 0.0], [4.0, 1.0], [5.0, 0.0]];
        let y = x.column(0).mapv(|v| 2.0 * v + 1.0) + x.column(1).mapv(|v| -3.0 * v);

        let mut model = LinearRegression::new();
        model.fit(&x, &y, None).unwrap();

        let coef = model.coefficients.as_ref().unwrap();
        assert!((coef[0] - 2.0).abs() < 1e-6);
        assert!((coef[1] + 3.0).abs() < 1e-6);
        assert!((model.intercept.unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_linear_regression_sample_weight_ignores_zero_weight_rows() {
        let x = array![[0.0], [1.0], [2.0], [3.0]];
        let y = array![0.0, 1.0, 2.0, 100.0];
        let w = array![1.0, 1.0, 1.0, 0.0];

        let mut model = LinearRegression::new();
        model.fit(&x, &y, Some(&w)).unwrap();
        let pred = model.predict(&array![[3.0]]).unwrap();
        assert!((pred[0] - 3.0).abs() < 1e-6, "prediction {}", pred[0]);
    }

    #[test]
    fn test_linear_regression_not_fitted() {
        let model = LinearRegression::new();
        let err = model.predict(&array![[1.0]]).unwrap_err();
        assert!(matches!(err, StackingError::ModelNotFitted));
    }

    #[test]
    fn test_ridge_shrinks_coefficients() {
        let x = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
        let y = array![0.0, 2.0, 4.0, 6.0, 8.0];

        let mut ols = LinearRegression::new();
        ols.fit(&x, &y, None).unwrap();
        let mut ridge = RidgeRegression::new(10.0);
        ridge.fit(&x, &y, None).unwrap();

        let ols_slope = ols.coefficients.as_ref().unwrap()[0];
        let ridge_slope = ridge.coefficients().unwrap()[0];
        assert!((ols_slope - 2.0).abs() < 1e-9);
        assert!(ridge_slope < ols_slope && ridge_slope > 0.0);
    }

    #[test]
    fn test_logistic_binary() {
        let x = array![[0.0, 0.1], [0.2, 0.0], [0.1, 0.3], [2.0, 2.1], [2.2, 1.9], [1.9, 2.3]];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];

        let mut model = LogisticRegression::new();
        model.fit(&x, &y, None).unwrap();

        assert_eq!(model.predict(&x).unwrap(), y);
        let proba = model.predict_proba(&x).unwrap();
        assert_eq!(proba.dim(), (6, 2));
        for row in proba.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
        match model.decision_function(&x).unwrap() {
            Prediction::Column(scores) => assert_eq!(scores.len(), 6),
            other => panic!("expected a single column, got {:?}", other),
        }
    }

    #[test]
    fn test_logistic_multiclass() {
        let x = array![
            [0.0, 0.0], [0.1, 0.2], [0.2, 0.1],
            [5.0, 0.0], [5.1, 0.2], [4.9, 0.1],
            [0.0, 5.0], [0.2, 5.1], [0.1, 4.9],
        ];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0];

        let mut model = LogisticRegression::new();
        model.fit(&x, &y, None).unwrap();

        assert_eq!(model.predict(&x).unwrap(), y);
        assert_eq!(model.predict_proba(&x).unwrap().dim(), (9, 3));
        assert_eq!(model.decision_function(&x).unwrap().ncols(), 3);
    }

    #[test]
    fn test_logistic_single_class_rejected() {
        let mut model = LogisticRegression::new();
        let result = model.fit(&array![[0.0], [1.0]], &array![1.0, 1.0], None);
        assert!(result.is_err());
    }

    #[test]
    fn test_fresh_copy_keeps_hyperparameters_only() {
        let x = array![[0.0], [1.0], [2.0]];
        let y = array![1.0, 3.0, 5.0];
        let mut model = LinearRegression::new().with_alpha(0.5);
        model.fit(&x, &y, None).unwrap();

        let copy = model.fresh_copy();
        assert_eq!(copy.params()["alpha"], ParamValue::Float(0.5));
        assert!(matches!(copy.predict(&x), Err(StackingError::ModelNotFitted)));
    }

    #[test]
    fn test_set_param() {
        let mut model = LogisticRegression::new();
        model.set_param("alpha", &ParamValue::Float(0.1)).unwrap();
        assert_eq!(model.alpha, 0.1);
        assert!(model.set_param("alpha", &ParamValue::Str("x".into())).is_err());
        assert!(model.set_param("gamma", &ParamValue::Float(1.0)).is_err());
    }
}
