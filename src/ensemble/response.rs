//! Response method resolution
//!
//! Decides, per base estimator, which prediction method feeds the
//! second-level features. Resolution only reads the estimator's
//! [`Capabilities`](crate::training::Capabilities) record.

use super::slot::EstimatorSlot;
use crate::error::{Result, StackingError};
use crate::training::{Estimator, Prediction};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Prediction method whose output becomes second-level features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseMethod {
    PredictProba,
    DecisionFunction,
    Predict,
}

impl ResponseMethod {
    /// Order probed by [`MethodRequest::Auto`]
    pub const AUTO_PRIORITY: [ResponseMethod; 3] = [
        ResponseMethod::PredictProba,
        ResponseMethod::DecisionFunction,
        ResponseMethod::Predict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMethod::PredictProba => "predict_proba",
            ResponseMethod::DecisionFunction => "decision_function",
            ResponseMethod::Predict => "predict",
        }
    }

    /// Whether `estimator` advertises this method
    pub fn is_supported_by(&self, estimator: &dyn Estimator) -> bool {
        let caps = estimator.capabilities();
        match self {
            ResponseMethod::PredictProba => caps.predict_proba,
            ResponseMethod::DecisionFunction => caps.decision_function,
            ResponseMethod::Predict => true,
        }
    }

    /// Invoke the method on a fitted estimator
    pub fn call(&self, estimator: &dyn Estimator, x: &Array2<f64>) -> Result<Prediction> {
        match self {
            ResponseMethod::PredictProba => estimator.predict_proba(x).map(Prediction::Columns),
            ResponseMethod::DecisionFunction => estimator.decision_function(x),
            ResponseMethod::Predict => estimator.predict(x).map(Prediction::Column),
        }
    }
}

impl fmt::Display for ResponseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseMethod {
    type Err = StackingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "predict_proba" => Ok(ResponseMethod::PredictProba),
            "decision_function" => Ok(ResponseMethod::DecisionFunction),
            "predict" => Ok(ResponseMethod::Predict),
            other => Err(StackingError::ConfigError(format!(
                "'{}' is not a response method; expected 'auto', 'predict_proba', \
                 'decision_function' or 'predict'",
                other
            ))),
        }
    }
}

/// What a caller asks for, per estimator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodRequest {
    /// First available of `predict_proba`, `decision_function`, `predict`
    Auto,
    Method(ResponseMethod),
}

impl fmt::Display for MethodRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodRequest::Auto => f.write_str("auto"),
            MethodRequest::Method(method) => method.fmt(f),
        }
    }
}

impl FromStr for MethodRequest {
    type Err = StackingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(MethodRequest::Auto),
            other => other.parse().map(MethodRequest::Method),
        }
    }
}

/// Response-method policy of a stacking estimator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredictMethod {
    /// Same request for every entry
    Uniform(MethodRequest),
    /// One request per entry, in entry order
    PerEstimator(Vec<MethodRequest>),
}

impl Default for PredictMethod {
    fn default() -> Self {
        PredictMethod::Uniform(MethodRequest::Auto)
    }
}

impl PredictMethod {
    /// Check the per-entry list against the number of entries
    pub fn check_len(&self, n_entries: usize) -> Result<()> {
        match self {
            PredictMethod::PerEstimator(requests) if requests.len() != n_entries => {
                Err(StackingError::ConfigError(format!(
                    "When 'predict_method' is a list, it should have the same length as \
                     'estimators': expected {} entries, got {}",
                    n_entries,
                    requests.len()
                )))
            }
            _ => Ok(()),
        }
    }

    pub fn request_for(&self, idx: usize) -> MethodRequest {
        match self {
            PredictMethod::Uniform(request) => *request,
            PredictMethod::PerEstimator(requests) => {
                requests.get(idx).copied().unwrap_or(MethodRequest::Auto)
            }
        }
    }

    /// Parse the string form used by `set_param`
    pub fn parse_str(s: &str) -> Result<Self> {
        s.parse().map(PredictMethod::Uniform).map_err(|_| {
            StackingError::ConfigError(format!(
                "When 'predict_method' is a string, it should be one of 'auto', \
                 'predict_proba', 'decision_function' or 'predict'; got '{}'",
                s
            ))
        })
    }

    /// Parse the list form used by `set_param`
    pub fn parse_list(items: &[String]) -> Result<Self> {
        items
            .iter()
            .map(|s| s.parse::<MethodRequest>())
            .collect::<Result<Vec<_>>>()
            .map(PredictMethod::PerEstimator)
    }

    pub fn to_strings(&self) -> Vec<String> {
        match self {
            PredictMethod::Uniform(request) => vec![request.to_string()],
            PredictMethod::PerEstimator(requests) => requests.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Resolve the method for one entry; dropped entries resolve to `None`
pub fn resolve(name: &str, slot: &EstimatorSlot, request: MethodRequest) -> Result<Option<ResponseMethod>> {
    let estimator = match slot.estimator() {
        Some(est) => est,
        None => return Ok(None),
    };

    match request {
        MethodRequest::Auto => ResponseMethod::AUTO_PRIORITY
            .iter()
            .copied()
            .find(|method| method.is_supported_by(estimator))
            .map(Some)
            .ok_or_else(|| StackingError::capability(name, "any of predict_proba, decision_function, predict")),
        MethodRequest::Method(method) if method.is_supported_by(estimator) => Ok(Some(method)),
        MethodRequest::Method(method) => Err(StackingError::CapabilityError {
            estimator: name.to_string(),
            capability: format!("{} (underlying estimator {} does not implement the method)", method, estimator.name()),
        }),
    }
}

/// Resolve every entry, in order
pub fn resolve_all(
    entries: &[(String, EstimatorSlot)],
    policy: &PredictMethod,
) -> Result<Vec<Option<ResponseMethod>>> {
    policy.check_len(entries.len())?;
    entries
        .iter()
        .enumerate()
        .map(|(idx, (name, slot))| resolve(name, slot, policy.request_for(idx)))
        .collect()
}
