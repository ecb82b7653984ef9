//! Linear Support Vector Machine implementations
//!
//! Primal solvers for the squared-hinge classifier (one-vs-rest for more
//! than two classes) and the squared epsilon-insensitive regressor. The
//! classifier exposes `decision_function` but no probabilities.

use super::linear_models::{argmax, binary_targets, mean_sq_norm, Standardizer};
use super::models::{
    check_fit_input, invalid_param, normalized_weights, unique_classes, unknown_param,
    Capabilities, Estimator, EstimatorKind, ParamValue, Params, Prediction,
};
use crate::error::{Result, StackingError};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// SVM configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SVMConfig {
    /// Regularization parameter (C)
    pub c: f64,
    /// Tolerance for stopping criterion
    pub tol: f64,
    /// Maximum number of iterations
    pub max_iter: usize,
    /// Epsilon for regression (SVR tube width)
    pub epsilon: f64,
}

impl Default for SVMConfig {
    fn default() -> Self {
        Self {
            c: 1.0,
            tol: 1e-4,
            max_iter: 1000,
            epsilon: 0.0,
        }
    }
}

impl SVMConfig {
    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("c".to_string(), ParamValue::Float(self.c));
        params.insert("tol".to_string(), ParamValue::Float(self.tol));
        params.insert("max_iter".to_string(), ParamValue::Int(self.max_iter as i64));
        params
    }

    fn set_param(&mut self, estimator: &str, key: &str, value: &ParamValue) -> Result<()> {
        match key {
            "c" => {
                self.c = value
                    .as_f64()
                    .filter(|c| *c > 0.0)
                    .ok_or_else(|| invalid_param(key, value, "must be positive"))?;
            }
            "tol" => {
                self.tol = value
                    .as_f64()
                    .filter(|t| *t > 0.0)
                    .ok_or_else(|| invalid_param(key, value, "must be positive"))?;
            }
            "max_iter" => {
                self.max_iter = value
                    .as_usize()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| invalid_param(key, value, "must be a positive integer"))?;
            }
            "epsilon" if estimator == "LinearSvr" => {
                self.epsilon = value
                    .as_f64()
                    .filter(|e| *e >= 0.0)
                    .ok_or_else(|| invalid_param(key, value, "must be non-negative"))?;
            }
            _ => return Err(unknown_param(estimator, key, value)),
        }
        Ok(())
    }
}

/// Loss-specific residual term; returns d(loss)/dz for one sample
type LossGrad = fn(z: f64, target: f64, epsilon: f64) -> f64;

fn squared_hinge_grad(z: f64, target: f64, _epsilon: f64) -> f64 {
    // target is +1 / -1
    let margin = 1.0 - target * z;
    if margin > 0.0 {
        -2.0 * target * margin
    } else {
        0.0
    }
}

fn squared_epsilon_insensitive_grad(z: f64, target: f64, epsilon: f64) -> f64 {
    let r = z - target;
    let excess = r.abs() - epsilon;
    if excess > 0.0 {
        2.0 * r.signum() * excess
    } else {
        0.0
    }
}

/// Full-batch gradient descent with a 1/L step on standardized features
fn fit_primal(
    config: &SVMConfig,
    xs: &Array2<f64>,
    target: &Array1<f64>,
    weights: &Array1<f64>,
    loss_grad: LossGrad,
    intercept_init: f64,
) -> (Array1<f64>, f64) {
    let n_samples = xs.nrows();
    let reg = 1.0 / (config.c * n_samples as f64);
    let step = 1.0 / (2.0 * mean_sq_norm(xs, weights) + reg);

    let mut w = Array1::zeros(xs.ncols());
    let mut b = intercept_init;

    for _iter in 0..config.max_iter {
        let z = xs.dot(&w) + b;
        let residual: Array1<f64> = z
            .iter()
            .zip(target.iter())
            .zip(weights.iter())
            .map(|((&zi, &ti), &wi)| wi * loss_grad(zi, ti, config.epsilon))
            .collect();
        let grad_w = xs.t().dot(&residual) + reg * &w;
        let grad_b = residual.sum();

        let grad_norm = (grad_w.mapv(|v| v * v).sum() + grad_b * grad_b).sqrt();
        if grad_norm < config.tol {
            break;
        }
        w = w - step * grad_w;
        b -= step * grad_b;
    }
    (w, b)
}

/// Linear support vector classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSvc {
    config: SVMConfig,
    coefficients: Option<Array2<f64>>,
    intercepts: Option<Array1<f64>>,
    scaler: Option<Standardizer>,
    /// Unique class labels
    classes: Vec<f64>,
}

impl Default for LinearSvc {
    fn default() -> Self {
        Self::new(SVMConfig::default())
    }
}

impl LinearSvc {
    /// Create a new linear SVM classifier
    pub fn new(config: SVMConfig) -> Self {
        Self {
            config,
            coefficients: None,
            intercepts: None,
            scaler: None,
            classes: Vec::new(),
        }
    }

    pub fn with_c(mut self, c: f64) -> Self {
        self.config.c = c;
        self
    }

    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    fn raw_scores(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let (coef, intercepts, scaler) = match (&self.coefficients, &self.intercepts, &self.scaler) {
            (Some(c), Some(i), Some(s)) => (c, i, s),
            _ => return Err(StackingError::ModelNotFitted),
        };
        super::models::check_n_features(scaler.n_features(), x)?;
        Ok(scaler.transform(x).dot(&coef.t()) + &intercepts.view().insert_axis(Axis(0)))
    }
}

impl Estimator for LinearSvc {
    fn name(&self) -> &str {
        "LinearSvc"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Classifier
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::predict_only()
            .with_decision_function()
            .with_sample_weight()
    }

    /// Fit the classifier (supports binary and multi-class via One-vs-Rest)
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        let classes = unique_classes(y);
        if classes.len() < 2 {
            return Err(StackingError::ValidationError(format!(
                "LinearSvc needs at least 2 classes, got {}",
                classes.len()
            )));
        }

        let weights = normalized_weights(x.nrows(), sample_weight)?;
        let scaler = Standardizer::fit(x, &weights);
        let xs = scaler.transform(x);

        let positives: Vec<f64> = if classes.len() == 2 {
            vec![classes[1]]
        } else {
            classes.clone()
        };

        let mut coefficients = Array2::zeros((positives.len(), x.ncols()));
        let mut intercepts = Array1::zeros(positives.len());
        for (k, &positive) in positives.iter().enumerate() {
            let target = binary_targets(y, &classes, positive)?.mapv(|t| 2.0 * t - 1.0);
            let (w, b) = fit_primal(&self.config, &xs, &target, &weights, squared_hinge_grad, 0.0);
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
        if self.classes.len() == 2 {
            return Ok(scores
                .column(0)
                .mapv(|s| if s > 0.0 { self.classes[1] } else { self.classes[0] }));
        }
        Ok(scores
            .rows()
            .into_iter()
            .map(|row| self.classes[argmax(row.iter().copied())])
            .collect())
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
        Box::new(Self::new(self.config.clone()))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        self.config.params()
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        self.config.set_param("LinearSvc", key, value)
    }
}

/// Linear support vector regressor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearSvr {
    config: SVMConfig,
    coefficients: Option<Array1<f64>>,
    intercept: f64,
    scaler: Option<Standardizer>,
}

impl Default for LinearSvr {
    fn default() -> Self {
        Self::new(SVMConfig::default())
    }
}

impl LinearSvr {
    /// Create a new linear SVM regressor
    pub fn new(config: SVMConfig) -> Self {
        Self {
            config,
            coefficients: None,
            intercept: 0.0,
            scaler: None,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.config.epsilon = epsilon;
        self
    }
}

impl Estimator for LinearSvr {
    fn name(&self) -> &str {
        "LinearSvr"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Regressor
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::predict_only().with_sample_weight()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        let weights = normalized_weights(x.nrows(), sample_weight)?;
        let scaler = Standardizer::fit(x, &weights);
        let xs = scaler.transform(x);

        let (w, b) = fit_primal(
            &self.config,
            &xs,
            y,
            &weights,
            squared_epsilon_insensitive_grad,
            y.dot(&weights),
        );

        self.coefficients = Some(w);
        self.intercept = b;
        self.scaler = Some(scaler);
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let (coef, scaler) = match (&self.coefficients, &self.scaler) {
            (Some(c), Some(s)) => (c, s),
            _ => return Err(StackingError::ModelNotFitted),
        };
        super::models::check_n_features(scaler.n_features(), x)?;
        Ok(scaler.transform(x).dot(coef) + self.intercept)
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        Box::new(Self::new(self.config.clone()))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        let mut params = self.config.params();
        params.insert("epsilon".to_string(), ParamValue::Float(self.config.epsilon));
        params
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        self.config.set_param("LinearSvr", key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn create_linear_separable_data() -> (Array2<f64>, Array1<f64>) {
        let x = array![
            [0.0, 0.0], [0.5, 0.3], [0.2, 0.8], [0.9, 0.1],
            [3.0, 3.0], [3.5, 2.8], [2.8, 3.6], [3.2, 3.1],
        ];
        let y = array![0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        (x, y)
    }

    #[test]
    fn test_linear_svc_binary() {
        let (x, y) = create_linear_separable_data();
        let mut svc = LinearSvc::default();
        svc.fit(&x, &y, None).unwrap();

        assert_eq!(svc.predict(&x).unwrap(), y);
        let scores = svc.decision_function(&x).unwrap();
        assert_eq!(scores.ncols(), 1);
        assert!(!svc.capabilities().predict_proba);
        assert!(matches!(
            svc.predict_proba(&x),
            Err(StackingError::CapabilityError { .. })
        ));
    }

    #[test]
    fn test_linear_svc_multiclass() {
        let x = array![
            [0.0, 0.0], [0.3, 0.2], [0.1, 0.4],
            [6.0, 0.0], [6.2, 0.3], [5.9, 0.1],
            [0.0, 6.0], [0.2, 6.1], [0.4, 5.8],
        ];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0];
        let mut svc = LinearSvc::default();
        svc.fit(&x, &y, None).unwrap();

        assert_eq!(svc.predict(&x).unwrap(), y);
        assert_eq!(svc.decision_function(&x).unwrap().ncols(), 3);
    }

    #[test]
    fn test_linear_svr() {
        let x = Array2::from_shape_fn((20, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| 0.5 * v + 2.0);
        let mut svr = LinearSvr::default();
        svr.fit(&x, &y, None).unwrap();

        let pred = svr.predict(&array![[10.0]]).unwrap();
        assert!((pred[0] - 7.0).abs() < 0.1, "prediction {}", pred[0]);
    }

    #[test]
    fn test_epsilon_only_on_regressor() {
        let mut svc = LinearSvc::default();
        assert!(svc.set_param("epsilon", &ParamValue::Float(0.1)).is_err());
        let mut svr = LinearSvr::default();
        svr.set_param("epsilon", &ParamValue::Float(0.1)).unwrap();
        assert_eq!(svr.params()["epsilon"], ParamValue::Float(0.1));
    }
}
