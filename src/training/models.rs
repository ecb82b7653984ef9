//! Estimator traits and shared model plumbing
//!
//! Every pluggable learner implements [`Estimator`]. Optional prediction
//! methods are advertised through a [`Capabilities`] record instead of being
//! probed at runtime, so meta-estimators can decide which method to call
//! before any data is touched.

use crate::error::{Result, StackingError};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Learning task an estimator declares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorKind {
    Classifier,
    Regressor,
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimatorKind::Classifier => write!(f, "classifier"),
            EstimatorKind::Regressor => write!(f, "regressor"),
        }
    }
}

/// Optional surface an estimator exposes beyond `fit`/`predict`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// `predict_proba` returns per-class probabilities
    pub predict_proba: bool,
    /// `decision_function` returns confidence scores
    pub decision_function: bool,
    /// `fit` honours per-sample weights
    pub sample_weight: bool,
}

impl Capabilities {
    /// Capability record of an estimator that only predicts
    pub fn predict_only() -> Self {
        Self::default()
    }

    pub fn with_predict_proba(mut self) -> Self {
        self.predict_proba = true;
        self
    }

    pub fn with_decision_function(mut self) -> Self {
        self.decision_function = true;
        self
    }

    pub fn with_sample_weight(mut self) -> Self {
        self.sample_weight = true;
        self
    }
}

/// Output of a response method: a single column or a block of columns
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// One value per sample, e.g. regression targets or binary scores
    Column(Array1<f64>),
    /// Several values per sample, e.g. per-class probabilities
    Columns(Array2<f64>),
}

impl Prediction {
    pub fn nrows(&self) -> usize {
        match self {
            Prediction::Column(col) => col.len(),
            Prediction::Columns(block) => block.nrows(),
        }
    }

    /// Number of columns this prediction contributes once stacked
    pub fn ncols(&self) -> usize {
        match self {
            Prediction::Column(_) => 1,
            Prediction::Columns(block) => block.ncols(),
        }
    }

    /// Reshape into a 2-D block; a single column becomes `(n, 1)`
    pub fn into_matrix(self) -> Array2<f64> {
        match self {
            Prediction::Column(col) => col.insert_axis(Axis(1)),
            Prediction::Columns(block) => block,
        }
    }
}

/// Hyperparameter value exchanged through `params`/`set_param`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Unset / null
    None,
    /// Marker that removes a named estimator from a meta-estimator
    Drop,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<String>),
    /// A nested estimator, reported by its type name
    Estimator(String),
}

impl ParamValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_usize(&self) -> Option<usize> {
        match self {
            ParamValue::Int(v) if *v >= 0 => Some(*v as usize),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// `None` and `Drop` both mean "no estimator here"
    pub fn is_omitted(&self) -> bool {
        matches!(self, ParamValue::None | ParamValue::Drop)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::None => write!(f, "None"),
            ParamValue::Drop => write!(f, "drop"),
            ParamValue::Bool(v) => write!(f, "{}", v),
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{}", v),
            ParamValue::Str(s) => write!(f, "'{}'", s),
            ParamValue::List(items) => write!(f, "{:?}", items),
            ParamValue::Estimator(name) => write!(f, "{}()", name),
        }
    }
}

/// Flat parameter map, nested keys use `outer__inner`
pub type Params = BTreeMap<String, ParamValue>;

/// Extra keyword options forwarded to an estimator's `predict`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictParams {
    values: BTreeMap<String, ParamValue>,
}

impl PredictParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: ParamValue) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Reject every key not in `accepted`
    pub fn ensure_only(&self, estimator: &str, accepted: &[&str]) -> Result<()> {
        match self.keys().find(|key| !accepted.contains(key)) {
            Some(key) => Err(StackingError::InvalidParameter {
                name: key.to_string(),
                value: self.values[key].to_string(),
                reason: format!("{} does not accept this predict parameter", estimator),
            }),
            None => Ok(()),
        }
    }
}

/// Result of `predict_with`
#[derive(Debug, Clone, PartialEq)]
pub struct PredictOutput {
    pub predictions: Array1<f64>,
    /// Per-sample standard deviation, when requested with `return_std`
    pub std: Option<Array1<f64>>,
}

impl From<Array1<f64>> for PredictOutput {
    fn from(predictions: Array1<f64>) -> Self {
        Self {
            predictions,
            std: None,
        }
    }
}

/// Trait for ML estimators
///
/// `predict` is mandatory. `predict_proba` and `decision_function` default
/// to a [`StackingError::CapabilityError`] and must be paired with the
/// matching flag in [`Estimator::capabilities`].
pub trait Estimator: Send + Sync + fmt::Debug {
    /// Type name used in parameter listings and error messages
    fn name(&self) -> &str;

    fn kind(&self) -> EstimatorKind;

    fn capabilities(&self) -> Capabilities {
        Capabilities::predict_only()
    }

    /// Fit the estimator, optionally weighting each sample
    fn fit(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        sample_weight: Option<&Array1<f64>>,
    ) -> Result<()>;

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>>;

    fn predict_proba(&self, _x: &Array2<f64>) -> Result<Array2<f64>> {
        Err(StackingError::capability(self.name(), "predict_proba"))
    }

    fn decision_function(&self, _x: &Array2<f64>) -> Result<Prediction> {
        Err(StackingError::capability(self.name(), "decision_function"))
    }

    /// `predict` with estimator-specific options; unknown options are rejected
    fn predict_with(&self, x: &Array2<f64>, params: &PredictParams) -> Result<PredictOutput> {
        params.ensure_only(self.name(), &[])?;
        self.predict(x).map(PredictOutput::from)
    }

    /// Unfitted copy carrying the same hyperparameters
    fn fresh_copy(&self) -> Box<dyn Estimator>;

    /// Full copy, fitted state included
    fn boxed_clone(&self) -> Box<dyn Estimator>;

    fn params(&self) -> Params {
        Params::new()
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        Err(unknown_param(self.name(), key, value))
    }
}

impl Clone for Box<dyn Estimator> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Error for a hyperparameter key an estimator does not know
pub fn unknown_param(estimator: &str, key: &str, value: &ParamValue) -> StackingError {
    StackingError::InvalidParameter {
        name: key.to_string(),
        value: value.to_string(),
        reason: format!("not a parameter of {}", estimator),
    }
}

/// Error for a known key given a value of the wrong type or range
pub fn invalid_param(key: &str, value: &ParamValue, reason: &str) -> StackingError {
    StackingError::InvalidParameter {
        name: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Check the shapes handed to `fit`
pub fn check_fit_input(
    x: &Array2<f64>,
    y: &Array1<f64>,
    sample_weight: Option<&Array1<f64>>,
) -> Result<()> {
    let n_samples = x.nrows();
    if n_samples == 0 {
        return Err(StackingError::ValidationError(
            "Cannot fit on an empty dataset".to_string(),
        ));
    }
    if n_samples != y.len() {
        return Err(StackingError::ShapeError {
            expected: format!("y length = {}", n_samples),
            actual: format!("y length = {}", y.len()),
        });
    }
    if let Some(w) = sample_weight {
        if w.len() != n_samples {
            return Err(StackingError::ShapeError {
                expected: format!("sample_weight length = {}", n_samples),
                actual: format!("sample_weight length = {}", w.len()),
            });
        }
        if w.iter().any(|&v| !v.is_finite() || v < 0.0) {
            return Err(StackingError::ValidationError(
                "sample_weight must be finite and non-negative".to_string(),
            ));
        }
    }
    Ok(())
}

/// Guard for estimators without weighted fitting
pub fn reject_sample_weight(estimator: &str, sample_weight: Option<&Array1<f64>>) -> Result<()> {
    match sample_weight {
        Some(_) => Err(StackingError::capability(estimator, "sample_weight in fit")),
        None => Ok(()),
    }
}

/// Check the column count handed to a fitted estimator
pub fn check_n_features(expected: usize, x: &Array2<f64>) -> Result<()> {
    if x.ncols() != expected {
        return Err(StackingError::ShapeError {
            expected: format!("{} features", expected),
            actual: format!("{} features", x.ncols()),
        });
    }
    Ok(())
}

/// Sorted distinct labels
pub fn unique_classes(y: &Array1<f64>) -> Vec<f64> {
    let mut classes: Vec<f64> = y.iter().copied().collect();
    classes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    classes.dedup();
    classes
}

/// Position of `label` among `classes`
pub fn class_index(classes: &[f64], label: f64) -> Option<usize> {
    classes.iter().position(|&c| (c - label).abs() < 1e-9)
}

/// Whether every target is an integral label, i.e. usable for stratification
pub fn is_discrete_target(y: &Array1<f64>) -> bool {
    y.iter().all(|v| v.is_finite() && (v - v.round()).abs() < 1e-9)
}

/// Weights normalized to sum to one; uniform when absent
pub fn normalized_weights(n_samples: usize, sample_weight: Option<&Array1<f64>>) -> Result<Array1<f64>> {
    let weights = match sample_weight {
        Some(w) => w.clone(),
        None => Array1::ones(n_samples),
    };
    let total = weights.sum();
    if total <= 0.0 {
        return Err(StackingError::ValidationError(
            "sample_weight must not sum to zero".to_string(),
        ));
    }
    Ok(weights / total)
}

/// Fraction of matching labels
pub fn accuracy_score(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    if y_true.is_empty() {
        return 0.0;
    }
    let correct = y_true
        .iter()
        .zip(y_pred.iter())
        .filter(|(t, p)| (*t - *p).abs() < 0.5)
        .count();
    correct as f64 / y_true.len() as f64
}

/// Coefficient of determination
pub fn r2_score(y_true: &Array1<f64>, y_pred: &Array1<f64>) -> f64 {
    let y_mean = y_true.mean().unwrap_or(0.0);
    let ss_res: f64 = y_true
        .iter()
        .zip(y_pred.iter())
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = y_true.iter().map(|t| (t - y_mean).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}
