//! Stacking ensemble method
//!
//! A stacking estimator fits a list of named base estimators, turns their
//! out-of-fold predictions into second-level features, and trains a final
//! estimator on those features. At prediction time the base estimators,
//! refit on the whole training set, produce the features instead.
//!
//! [`StackingClassifier`] and [`StackingRegressor`] share all of their
//! machinery through [`StackingCore`]; they differ in the default final
//! estimator, the default splitter and the score they report.

use super::concat::concatenate;
use super::out_of_fold::{check_coverage, predict_out_of_fold};
use super::response::{resolve_all, PredictMethod, ResponseMethod};
use super::slot::EstimatorSlot;
use crate::error::{Result, StackingError};
use crate::training::{
    accuracy_score, check_fit_input, invalid_param, is_discrete_target, r2_score, unknown_param,
    CVSplit, CVStrategy, Capabilities, CrossValidator, Estimator, EstimatorKind,
    LinearRegression, LogisticRegression, ParamValue, Params, PredictOutput, PredictParams,
    Prediction,
};
use crate::utils::{ParallelBackend, ParallelConfig};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Parameter names owned by the stacking estimator itself
const OWN_PARAMS: [&str; 8] = [
    "cv",
    "estimators",
    "final_estimator",
    "n_jobs",
    "passthrough",
    "predict_method",
    "random_state",
    "verbose",
];

/// How out-of-fold predictions are produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CvPolicy {
    /// K folds; stratified for classifiers with discrete targets
    Folds(usize),
    /// A configured splitter
    Splitter(CrossValidator),
    /// Explicit train/test index lists
    Precomputed(Vec<CVSplit>),
    /// Base estimators are already fitted and used as supplied
    Prefit,
}

impl Default for CvPolicy {
    fn default() -> Self {
        CvPolicy::Folds(3)
    }
}

impl CvPolicy {
    pub fn is_prefit(&self) -> bool {
        matches!(self, CvPolicy::Prefit)
    }

    fn describe(&self) -> String {
        match self {
            CvPolicy::Folds(k) => format!("{}-fold", k),
            CvPolicy::Splitter(cv) => format!("{:?}", cv.strategy()),
            CvPolicy::Precomputed(splits) => format!("{} precomputed splits", splits.len()),
            CvPolicy::Prefit => "prefit".to_string(),
        }
    }

    /// Materialize the split list for one fit; `None` for [`CvPolicy::Prefit`]
    fn materialize(
        &self,
        kind: EstimatorKind,
        y: &Array1<f64>,
        groups: Option<&Array1<i64>>,
        random_state: Option<u64>,
    ) -> Result<Option<Vec<CVSplit>>> {
        let splitter = match self {
            CvPolicy::Prefit => return Ok(None),
            CvPolicy::Precomputed(splits) => return Ok(Some(splits.clone())),
            CvPolicy::Folds(k) => {
                if *k < 2 {
                    return Err(StackingError::ConfigError(format!(
                        "cv must use at least 2 folds, got {}",
                        k
                    )));
                }
                let strategy = if kind == EstimatorKind::Classifier && is_discrete_target(y) {
                    CVStrategy::StratifiedKFold { n_splits: *k, shuffle: false }
                } else {
                    CVStrategy::KFold { n_splits: *k, shuffle: false }
                };
                CrossValidator::new(strategy)
            }
            CvPolicy::Splitter(cv) => {
                if cv.needs_groups() && groups.is_none() {
                    return Err(StackingError::ConfigError(format!(
                        "{:?} needs one group label per sample; pass them with fit_grouped",
                        cv.strategy()
                    )));
                }
                let mut cv = cv.clone();
                if cv.is_randomized() {
                    // Drawn once so every estimator sees the same partition
                    let seed = random_state
                        .or_else(|| cv.random_state())
                        .unwrap_or_else(rand::random);
                    cv = cv.with_random_state(seed);
                }
                cv
            }
        };
        splitter.split(y.len(), Some(y), groups).map(Some)
    }
}

/// Configuration for stacking ensembles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackingConfig {
    /// Split policy for out-of-fold predictions
    pub cv: CvPolicy,
    /// Whether to prepend the original features to the final estimator input
    pub passthrough: bool,
    /// Which base-estimator method feeds the final estimator
    pub predict_method: PredictMethod,
    /// Worker threads for fitting (None = rayon's global pool)
    pub n_jobs: Option<usize>,
    /// Seed for randomized splitters
    pub random_state: Option<u64>,
    /// Logging level for the parallel backend (0 = quiet)
    pub verbose: u8,
}

impl Default for StackingConfig {
    fn default() -> Self {
        Self {
            cv: CvPolicy::default(),
            passthrough: false,
            predict_method: PredictMethod::default(),
            n_jobs: None,
            random_state: None,
            verbose: 0,
        }
    }
}

impl StackingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cv(mut self, cv: CvPolicy) -> Self {
        self.cv = cv;
        self
    }

    pub fn with_passthrough(mut self, passthrough: bool) -> Self {
        self.passthrough = passthrough;
        self
    }

    pub fn with_predict_method(mut self, predict_method: PredictMethod) -> Self {
        self.predict_method = predict_method;
        self
    }

    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = Some(n_jobs);
        self
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn backend(&self) -> ParallelBackend {
        ParallelBackend::new(ParallelConfig {
            n_jobs: self.n_jobs,
            verbose: self.verbose,
        })
    }
}

/// State produced by a successful `fit`
#[derive(Debug, Clone)]
struct FittedStack {
    /// Names of the present entries, in entry order
    names: Vec<String>,
    /// One fitted model per present entry
    estimators: Vec<Box<dyn Estimator>>,
    /// Method used per present entry
    methods: Vec<ResponseMethod>,
    /// Method per entry, `None` for dropped ones
    resolution: Vec<Option<ResponseMethod>>,
    final_estimator: Box<dyn Estimator>,
    n_features_in: usize,
    passthrough: bool,
}

/// Machinery shared by [`StackingClassifier`] and [`StackingRegressor`]
#[derive(Debug, Clone)]
pub struct StackingCore {
    kind: EstimatorKind,
    estimators: Vec<(String, EstimatorSlot)>,
    final_estimator: Option<Box<dyn Estimator>>,
    config: StackingConfig,
    fitted: Option<FittedStack>,
}

impl StackingCore {
    pub fn new(kind: EstimatorKind, config: StackingConfig) -> Self {
        Self {
            kind,
            estimators: Vec::new(),
            final_estimator: None,
            config,
            fitted: None,
        }
    }

    pub fn kind(&self) -> EstimatorKind {
        self.kind
    }

    pub fn config(&self) -> &StackingConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// All entries in order, dropped ones included
    pub fn named_estimators(&self) -> Vec<(&str, &EstimatorSlot)> {
        self.estimators
            .iter()
            .map(|(name, slot)| (name.as_str(), slot))
            .collect()
    }

    /// Configured final estimator, `None` when the default is in use
    pub fn final_estimator(&self) -> Option<&dyn Estimator> {
        self.final_estimator.as_deref()
    }

    /// Append an entry; duplicate names are rejected by `fit`
    pub fn push_estimator(&mut self, name: impl Into<String>, slot: EstimatorSlot) {
        self.estimators.push((name.into(), slot));
        self.fitted = None;
    }

    /// Replace the entry called `name`, or append it when absent
    pub fn set_estimator(&mut self, name: impl Into<String>, slot: EstimatorSlot) {
        let name = name.into();
        match self.estimators.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = slot,
            None => self.estimators.push((name, slot)),
        }
        self.fitted = None;
    }

    /// `None` restores the default final estimator
    pub fn set_final_estimator(&mut self, estimator: Option<Box<dyn Estimator>>) {
        self.final_estimator = estimator;
        self.fitted = None;
    }

    pub fn set_config(&mut self, config: StackingConfig) {
        self.config = config;
        self.fitted = None;
    }

    fn default_final_estimator(&self) -> Box<dyn Estimator> {
        match self.kind {
            EstimatorKind::Classifier => Box::new(LogisticRegression::new()),
            EstimatorKind::Regressor => Box::new(LinearRegression::new()),
        }
    }

    /// Final estimator to fit, checked against this estimator's kind
    fn final_template(&self) -> Result<Box<dyn Estimator>> {
        let template = match &self.final_estimator {
            Some(est) => est.fresh_copy(),
            None => self.default_final_estimator(),
        };
        if template.kind() != self.kind {
            return Err(StackingError::ConfigError(format!(
                "'final_estimator' attribute should be a {}; {} is a {}",
                self.kind,
                template.name(),
                template.kind()
            )));
        }
        Ok(template)
    }

    fn validate_entries(&self) -> Result<()> {
        if self.estimators.is_empty() {
            return Err(StackingError::ConfigError(
                "Invalid 'estimators' attribute, 'estimators' should be a non-empty list of \
                 (name, estimator) entries"
                    .to_string(),
            ));
        }

        let names: Vec<&str> = self.estimators.iter().map(|(name, _)| name.as_str()).collect();
        if names.iter().any(|name| name.is_empty()) {
            return Err(StackingError::ConfigError(
                "Estimator names must not be empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        let duplicates: BTreeSet<&str> = names.iter().copied().filter(|name| !seen.insert(*name)).collect();
        if !duplicates.is_empty() {
            return Err(StackingError::ConfigError(format!(
                "Names provided are not unique: {:?}",
                duplicates
            )));
        }

        let clashing: Vec<&str> = names.iter().copied().filter(|name| OWN_PARAMS.contains(name)).collect();
        if !clashing.is_empty() {
            return Err(StackingError::ConfigError(format!(
                "Estimator names conflict with constructor arguments: {:?}",
                clashing
            )));
        }

        let nested: Vec<&str> = names.iter().copied().filter(|name| name.contains("__")).collect();
        if !nested.is_empty() {
            return Err(StackingError::ConfigError(format!(
                "Estimator names must not contain __: got {:?}",
                nested
            )));
        }

        if self.estimators.iter().all(|(_, slot)| slot.is_dropped()) {
            return Err(StackingError::ConfigError(
                "All estimators are dropped. At least one is required to be an estimator."
                    .to_string(),
            ));
        }
        Ok(())
    }

    fn check_sample_weight_support(&self) -> Result<()> {
        for (name, slot) in &self.estimators {
            if let Some(est) = slot.estimator() {
                if !est.capabilities().sample_weight {
                    return Err(StackingError::capability(
                        name.as_str(),
                        format!("sample weights ({} has no weighted fit)", est.name()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Fit every base estimator, collect out-of-fold predictions and fit
    /// the final estimator on them
    ///
    /// All checks run before any estimator is fitted. On error the
    /// previously fitted state, if any, is left untouched.
    pub fn fit(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        sample_weight: Option<&Array1<f64>>,
    ) -> Result<()> {
        self.fit_grouped(x, y, sample_weight, None)
    }

    /// `fit` with one group label per sample, handed to a group-aware splitter
    pub fn fit_grouped(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        sample_weight: Option<&Array1<f64>>,
        groups: Option<&Array1<i64>>,
    ) -> Result<()> {
        let mut final_estimator = self.final_template()?;
        self.validate_entries()?;
        self.config.predict_method.check_len(self.estimators.len())?;
        check_fit_input(x, y, sample_weight)?;
        if let Some(groups) = groups {
            if groups.len() != x.nrows() {
                return Err(StackingError::ShapeError {
                    expected: format!("groups length = {}", x.nrows()),
                    actual: format!("groups length = {}", groups.len()),
                });
            }
        }
        if sample_weight.is_some() {
            self.check_sample_weight_support()?;
        }

        let resolution = resolve_all(&self.estimators, &self.config.predict_method)?;
        let splits = self
            .config
            .cv
            .materialize(self.kind, y, groups, self.config.random_state)?;
        if let Some(splits) = &splits {
            check_coverage(splits, x.nrows())?;
        }

        let present: Vec<(&str, &dyn Estimator, ResponseMethod)> = self
            .estimators
            .iter()
            .zip(&resolution)
            .filter_map(|((name, slot), method)| Some((name.as_str(), slot.estimator()?, (*method)?)))
            .collect();

        info!(
            kind = %self.kind,
            n_estimators = present.len(),
            n_dropped = self.estimators.len() - present.len(),
            n_samples = x.nrows(),
            n_features = x.ncols(),
            cv = %self.config.cv.describe(),
            "fitting stacking ensemble"
        );

        let backend = self.config.backend();
        let estimators: Vec<Box<dyn Estimator>> = match &splits {
            None => present.iter().map(|(_, est, _)| est.boxed_clone()).collect(),
            Some(_) => backend.map("fit_full", present.clone(), |(name, est, _)| {
                let mut model = est.fresh_copy();
                model.fit(x, y, sample_weight)?;
                debug!(estimator = name, "fitted on the full training set");
                Ok(model)
            })?,
        };

        let predictions: Vec<Prediction> = match &splits {
            None => estimators
                .iter()
                .zip(&present)
                .map(|(model, (_, _, method))| method.call(model.as_ref(), x))
                .collect::<Result<_>>()?,
            Some(splits) => {
                let nested = backend.nested();
                backend.map("out_of_fold", present.clone(), |(name, est, method)| {
                    predict_out_of_fold(name, est, x, y, splits, method, sample_weight, &nested)
                })?
            }
        };

        let meta_features = concatenate(x, predictions, self.config.passthrough)?;
        debug!(
            n_meta_features = meta_features.ncols(),
            passthrough = self.config.passthrough,
            "second-level features assembled"
        );

        let final_weight = match sample_weight {
            Some(w) if final_estimator.capabilities().sample_weight => Some(w),
            Some(_) => {
                warn!(
                    final_estimator = final_estimator.name(),
                    "final estimator has no weighted fit, sample_weight not forwarded"
                );
                None
            }
            None => None,
        };
        final_estimator.fit(&meta_features, y, final_weight)?;

        let staged = FittedStack {
            names: present.iter().map(|(name, _, _)| name.to_string()).collect(),
            methods: present.iter().map(|(_, _, method)| *method).collect(),
            estimators,
            resolution,
            final_estimator,
            n_features_in: x.ncols(),
            passthrough: self.config.passthrough,
        };
        info!(
            n_estimators = staged.estimators.len(),
            n_meta_features = meta_features.ncols(),
            "stacking ensemble fitted"
        );
        self.fitted = Some(staged);
        Ok(())
    }

    fn fitted(&self) -> Result<&FittedStack> {
        self.fitted.as_ref().ok_or(StackingError::ModelNotFitted)
    }

    /// Second-level features for `x`, from the full-data fitted estimators
    pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let fitted = self.fitted()?;
        if x.ncols() != fitted.n_features_in {
            return Err(StackingError::ShapeError {
                expected: format!("{} features, as seen during fit", fitted.n_features_in),
                actual: format!("{} features", x.ncols()),
            });
        }
        let predictions = fitted
            .estimators
            .iter()
            .zip(&fitted.methods)
            .map(|(model, method)| method.call(model.as_ref(), x))
            .collect::<Result<Vec<_>>>()?;
        concatenate(x, predictions, fitted.passthrough)
    }

    pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let features = self.transform(x)?;
        self.fitted()?.final_estimator.predict(&features)
    }

    /// `predict` with options forwarded to the final estimator
    pub fn predict_with(&self, x: &Array2<f64>, params: &PredictParams) -> Result<PredictOutput> {
        let features = self.transform(x)?;
        self.fitted()?.final_estimator.predict_with(&features, params)
    }

    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let fitted = self.fitted()?;
        if !fitted.final_estimator.capabilities().predict_proba {
            return Err(StackingError::capability("final_estimator", "predict_proba"));
        }
        fitted.final_estimator.predict_proba(&self.transform(x)?)
    }

    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Prediction> {
        let fitted = self.fitted()?;
        if !fitted.final_estimator.capabilities().decision_function {
            return Err(StackingError::capability("final_estimator", "decision_function"));
        }
        fitted.final_estimator.decision_function(&self.transform(x)?)
    }

    /// Accuracy for classifiers, R² for regressors
    pub fn score(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<f64> {
        let predictions = self.predict(x)?;
        if predictions.len() != y.len() {
            return Err(StackingError::ShapeError {
                expected: format!("y length = {}", predictions.len()),
                actual: format!("y length = {}", y.len()),
            });
        }
        Ok(match self.kind {
            EstimatorKind::Classifier => accuracy_score(y, &predictions),
            EstimatorKind::Regressor => r2_score(y, &predictions),
        })
    }

    /// Fitted base estimators with their entry names; dropped entries are skipped
    pub fn fitted_estimators(&self) -> Result<Vec<(&str, &dyn Estimator)>> {
        let fitted = self.fitted()?;
        Ok(fitted
            .names
            .iter()
            .zip(&fitted.estimators)
            .map(|(name, model)| (name.as_str(), model.as_ref()))
            .collect())
    }

    /// Response method per entry, `None` for dropped entries
    pub fn resolved_methods(&self) -> Result<&[Option<ResponseMethod>]> {
        Ok(&self.fitted()?.resolution)
    }

    pub fn fitted_final_estimator(&self) -> Result<&dyn Estimator> {
        Ok(self.fitted()?.final_estimator.as_ref())
    }

    /// Whether the (configured or default) final estimator advertises a method
    fn final_capabilities(&self) -> Capabilities {
        match (&self.fitted, &self.final_estimator) {
            (Some(fitted), _) => fitted.final_estimator.capabilities(),
            (None, Some(est)) => est.capabilities(),
            (None, None) => self.default_final_estimator().capabilities(),
        }
    }

    /// Capabilities of the stacking estimator seen as a single estimator
    pub fn capabilities(&self) -> Capabilities {
        let final_caps = self.final_capabilities();
        let weighted = self
            .estimators
            .iter()
            .filter_map(|(_, slot)| slot.estimator())
            .all(|est| est.capabilities().sample_weight);
        Capabilities {
            predict_proba: self.kind == EstimatorKind::Classifier && final_caps.predict_proba,
            decision_function: self.kind == EstimatorKind::Classifier && final_caps.decision_function,
            sample_weight: weighted,
        }
    }

    /// Current configuration as a flat parameter map
    ///
    /// With `deep`, every present entry's hyperparameters are listed under
    /// `name__param` and a configured final estimator's under
    /// `final_estimator__param`.
    pub fn get_params(&self, deep: bool) -> Params {
        let mut params = Params::new();
        let cv = match &self.config.cv {
            CvPolicy::Folds(k) => ParamValue::Int(*k as i64),
            CvPolicy::Splitter(_) => ParamValue::Str("splitter".to_string()),
            CvPolicy::Precomputed(_) => ParamValue::Str("precomputed".to_string()),
            CvPolicy::Prefit => ParamValue::Str("prefit".to_string()),
        };
        params.insert("cv".to_string(), cv);
        params.insert(
            "estimators".to_string(),
            ParamValue::List(self.estimators.iter().map(|(name, _)| name.clone()).collect()),
        );
        params.insert(
            "final_estimator".to_string(),
            match &self.final_estimator {
                Some(est) => ParamValue::Estimator(est.name().to_string()),
                None => ParamValue::None,
            },
        );
        params.insert(
            "n_jobs".to_string(),
            self.config.n_jobs.map_or(ParamValue::None, |n| ParamValue::Int(n as i64)),
        );
        params.insert("passthrough".to_string(), ParamValue::Bool(self.config.passthrough));
        params.insert(
            "predict_method".to_string(),
            match &self.config.predict_method {
                PredictMethod::Uniform(request) => ParamValue::Str(request.to_string()),
                per_estimator => ParamValue::List(per_estimator.to_strings()),
            },
        );
        params.insert(
            "random_state".to_string(),
            self.config.random_state.map_or(ParamValue::None, |s| ParamValue::Int(s as i64)),
        );
        params.insert("verbose".to_string(), ParamValue::Int(self.config.verbose as i64));

        for (name, slot) in &self.estimators {
            match slot.estimator() {
                Some(est) => {
                    params.insert(name.clone(), ParamValue::Estimator(est.name().to_string()));
                    if deep {
                        for (key, value) in est.params() {
                            params.insert(format!("{}__{}", name, key), value);
                        }
                    }
                }
                None => {
                    params.insert(name.clone(), ParamValue::Drop);
                }
            }
        }
        if deep {
            if let Some(est) = &self.final_estimator {
                for (key, value) in est.params() {
                    params.insert(format!("final_estimator__{}", key), value);
                }
            }
        }
        params
    }

    /// Set one parameter; a successful change discards the fitted state
    pub fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        if let Some((head, rest)) = key.split_once("__") {
            self.set_nested_param(head, rest, value)?;
        } else {
            self.set_own_param(key, value)?;
        }
        self.fitted = None;
        Ok(())
    }

    fn set_nested_param(&mut self, head: &str, rest: &str, value: &ParamValue) -> Result<()> {
        if head == "final_estimator" {
            // Tuning the default final estimator makes it explicit
            let was_default = self.final_estimator.is_none();
            let mut est = self
                .final_estimator
                .take()
                .unwrap_or_else(|| self.default_final_estimator());
            let result = est.set_param(rest, value);
            if result.is_ok() || !was_default {
                self.final_estimator = Some(est);
            }
            return result;
        }

        let key = format!("{}__{}", head, rest);
        let (_, slot) = self
            .estimators
            .iter_mut()
            .find(|(name, _)| name == head)
            .ok_or_else(|| unknown_param("stacking estimator", &key, value))?;
        match slot.estimator_mut() {
            Some(est) => est.set_param(rest, value),
            None => Err(StackingError::ConfigError(format!(
                "Cannot set '{}': estimator '{}' is dropped",
                key, head
            ))),
        }
    }

    fn set_own_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        match key {
            "passthrough" => {
                self.config.passthrough = value.as_bool().ok_or_else(|| {
                    StackingError::ConfigError(format!(
                        "Invalid 'passthrough' attribute, 'passthrough' should be a boolean; got {}",
                        value
                    ))
                })?;
            }
            "predict_method" => {
                self.config.predict_method = match value {
                    ParamValue::Str(s) => PredictMethod::parse_str(s)?,
                    ParamValue::List(items) => PredictMethod::parse_list(items)?,
                    other => {
                        return Err(invalid_param(key, other, "must be a method name or a list of them"))
                    }
                };
            }
            "cv" => {
                self.config.cv = match value {
                    ParamValue::Int(k) if *k >= 2 => CvPolicy::Folds(*k as usize),
                    ParamValue::Str(s) if s == "prefit" => CvPolicy::Prefit,
                    other => {
                        return Err(invalid_param(key, other, "must be a fold count >= 2 or 'prefit'"))
                    }
                };
            }
            "n_jobs" => {
                self.config.n_jobs = match value {
                    ParamValue::None | ParamValue::Int(-1) => None,
                    ParamValue::Int(n) if *n >= 1 => Some(*n as usize),
                    other => return Err(invalid_param(key, other, "must be None, -1 or a positive integer")),
                };
            }
            "random_state" => {
                self.config.random_state = match value {
                    ParamValue::None => None,
                    other => Some(
                        other
                            .as_usize()
                            .ok_or_else(|| invalid_param(key, other, "must be None or a non-negative integer"))?
                            as u64,
                    ),
                };
            }
            "verbose" => {
                self.config.verbose = value
                    .as_usize()
                    .filter(|v| *v <= u8::MAX as usize)
                    .ok_or_else(|| invalid_param(key, value, "must be an integer in 0..=255"))?
                    as u8;
            }
            "final_estimator" => match value {
                ParamValue::None => self.final_estimator = None,
                other => {
                    return Err(invalid_param(
                        key,
                        other,
                        "only None is accepted here; use set_final_estimator to supply an estimator",
                    ))
                }
            },
            "estimators" => {
                return Err(invalid_param(
                    key,
                    value,
                    "entries are replaced one by one with set_estimator",
                ))
            }
            name => {
                let slot = self
                    .estimators
                    .iter_mut()
                    .find(|(entry, _)| entry == name)
                    .map(|(_, slot)| slot)
                    .ok_or_else(|| unknown_param("stacking estimator", key, value))?;
                if !value.is_omitted() {
                    return Err(invalid_param(
                        key,
                        value,
                        "an entry can only be dropped here; use set_estimator to replace it",
                    ));
                }
                *slot = EstimatorSlot::Dropped;
            }
        }
        Ok(())
    }
}

/// Builder and inspection surface shared by both stacking types
macro_rules! stacking_surface {
    ($ty:ident) => {
        impl $ty {
            /// Build from a prepared entry list
            pub fn from_slots(estimators: Vec<(String, EstimatorSlot)>, config: StackingConfig) -> Self {
                let mut stack = Self::new(config);
                for (name, slot) in estimators {
                    stack.core.push_estimator(name, slot);
                }
                stack
            }

            /// Append a named base estimator
            pub fn add_estimator<E: Estimator + 'static>(mut self, name: impl Into<String>, estimator: E) -> Self {
                self.core.push_estimator(name, EstimatorSlot::present(estimator));
                self
            }

            /// Append a named entry that is explicitly dropped
            pub fn add_dropped(mut self, name: impl Into<String>) -> Self {
                self.core.push_estimator(name, EstimatorSlot::Dropped);
                self
            }

            pub fn with_final_estimator<E: Estimator + 'static>(mut self, estimator: E) -> Self {
                self.core.set_final_estimator(Some(Box::new(estimator)));
                self
            }

            pub fn config(&self) -> &StackingConfig {
                self.core.config()
            }

            pub fn set_config(&mut self, config: StackingConfig) {
                self.core.set_config(config);
            }

            pub fn is_fitted(&self) -> bool {
                self.core.is_fitted()
            }

            pub fn fit(
                &mut self,
                x: &Array2<f64>,
                y: &Array1<f64>,
                sample_weight: Option<&Array1<f64>>,
            ) -> Result<()> {
                self.core.fit(x, y, sample_weight)
            }

            pub fn fit_grouped(
                &mut self,
                x: &Array2<f64>,
                y: &Array1<f64>,
                sample_weight: Option<&Array1<f64>>,
                groups: Option<&Array1<i64>>,
            ) -> Result<()> {
                self.core.fit_grouped(x, y, sample_weight, groups)
            }

            pub fn transform(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
                self.core.transform(x)
            }

            pub fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
                self.core.predict(x)
            }

            pub fn predict_with(&self, x: &Array2<f64>, params: &PredictParams) -> Result<PredictOutput> {
                self.core.predict_with(x, params)
            }

            pub fn score(&self, x: &Array2<f64>, y: &Array1<f64>) -> Result<f64> {
                self.core.score(x, y)
            }

            pub fn named_estimators(&self) -> Vec<(&str, &EstimatorSlot)> {
                self.core.named_estimators()
            }

            pub fn get_params(&self, deep: bool) -> Params {
                self.core.get_params(deep)
            }

            pub fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
                self.core.set_param(key, value)
            }

            pub fn set_estimator(&mut self, name: impl Into<String>, slot: EstimatorSlot) {
                self.core.set_estimator(name, slot);
            }

            pub fn set_final_estimator(&mut self, estimator: Option<Box<dyn Estimator>>) {
                self.core.set_final_estimator(estimator);
            }

            pub fn fitted_estimators(&self) -> Result<Vec<(&str, &dyn Estimator)>> {
                self.core.fitted_estimators()
            }

            pub fn resolved_methods(&self) -> Result<&[Option<ResponseMethod>]> {
                self.core.resolved_methods()
            }

            pub fn fitted_final_estimator(&self) -> Result<&dyn Estimator> {
                self.core.fitted_final_estimator()
            }
        }
    };
}

/// Stacked generalization for classification
///
/// Defaults to a [`LogisticRegression`] final estimator and stratified
/// folds when the targets are discrete labels.
#[derive(Debug, Clone)]
pub struct StackingClassifier {
    core: StackingCore,
}

impl StackingClassifier {
    pub fn new(config: StackingConfig) -> Self {
        Self {
            core: StackingCore::new(EstimatorKind::Classifier, config),
        }
    }

    /// Class probabilities from the final estimator
    pub fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.core.predict_proba(x)
    }

    pub fn decision_function(&self, x: &Array2<f64>) -> Result<Prediction> {
        self.core.decision_function(x)
    }
}

impl Default for StackingClassifier {
    fn default() -> Self {
        Self::new(StackingConfig::default())
    }
}

stacking_surface!(StackingClassifier);

impl Estimator for StackingClassifier {
    fn name(&self) -> &str {
        "StackingClassifier"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Classifier
    }

    fn capabilities(&self) -> Capabilities {
        self.core.capabilities()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.core.fit(x, y, sample_weight)
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.core.predict(x)
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        self.core.predict_proba(x)
    }

    fn decision_function(&self, x: &Array2<f64>) -> Result<Prediction> {
        self.core.decision_function(x)
    }

    fn predict_with(&self, x: &Array2<f64>, params: &PredictParams) -> Result<PredictOutput> {
        self.core.predict_with(x, params)
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        let mut copy = self.clone();
        copy.core.fitted = None;
        Box::new(copy)
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        self.core.get_params(true)
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        self.core.set_param(key, value)
    }
}

/// Stacked generalization for regression
///
/// Defaults to a [`LinearRegression`] final estimator and plain K-fold.
#[derive(Debug, Clone)]
pub struct StackingRegressor {
    core: StackingCore,
}

impl StackingRegressor {
    pub fn new(config: StackingConfig) -> Self {
        Self {
            core: StackingCore::new(EstimatorKind::Regressor, config),
        }
    }
}

impl Default for StackingRegressor {
    fn default() -> Self {
        Self::new(StackingConfig::default())
    }
}

stacking_surface!(StackingRegressor);

impl Estimator for StackingRegressor {
    fn name(&self) -> &str {
        "StackingRegressor"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Regressor
    }

    fn capabilities(&self) -> Capabilities {
        self.core.capabilities()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        self.core.fit(x, y, sample_weight)
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        self.core.predict(x)
    }

    fn predict_with(&self, x: &Array2<f64>, params: &PredictParams) -> Result<PredictOutput> {
        self.core.predict_with(x, params)
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        let mut copy = self.clone();
        copy.core.fitted = None;
        Box::new(copy)
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        self.core.get_params(true)
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        self.core.set_param(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::response::MethodRequest;
    use crate::training::{
        DecisionTree, DummyClassifier, DummyRegressor, LinearSvc, LinearSvr, RandomForest,
        RidgeRegression,
    };
    use ndarray::array;

    fn blobs() -> (Array2<f64>, Array1<f64>) {
        let x = array![
            [0.0, 0.1], [0.2, 0.0], [0.1, 0.3], [0.3, 0.2], [0.0, 0.4], [0.4, 0.1],
            [3.0, 3.1], [3.2, 3.0], [3.1, 3.3], [3.3, 3.2], [3.0, 3.4], [3.4, 3.1]
        ];
        let y = array![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        (x, y)
    }

    fn line() -> (Array2<f64>, Array1<f64>) {
        let x = Array2::from_shape_fn((12, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| 2.0 * v + 1.0);
        (x, y)
    }

    #[test]
    fn test_default_config() {
        let config = StackingConfig::default();
        assert_eq!(config.cv, CvPolicy::Folds(3));
        assert!(!config.passthrough);
        assert_eq!(config.predict_method, PredictMethod::Uniform(MethodRequest::Auto));
        assert_eq!(config.n_jobs, None);
        assert_eq!(config.verbose, 0);
        assert_eq!(config.with_verbose(2).backend().config().verbose, 2);
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = StackingConfig::new()
            .with_cv(CvPolicy::Folds(4))
            .with_passthrough(true)
            .with_random_state(7);
        let json = config.to_json().unwrap();
        assert_eq!(StackingConfig::from_json(&json).unwrap(), config);
        assert!(matches!(
            StackingConfig::from_json("{ not json"),
            Err(StackingError::SerializationError(_))
        ));
    }

    #[test]
    fn test_classifier_fit_predict() {
        let (x, y) = blobs();
        let mut clf = StackingClassifier::new(StackingConfig::new().with_n_jobs(1))
            .add_estimator("lr", LogisticRegression::new())
            .add_estimator("svc", LinearSvc::default());
        clf.fit(&x, &y, None).unwrap();

        // 2 probability columns + 1 decision column
        assert_eq!(clf.transform(&x).unwrap().ncols(), 3);
        assert_eq!(clf.predict(&x).unwrap(), y);
        assert_eq!(clf.predict_proba(&x).unwrap().dim(), (12, 2));
        assert_eq!(
            clf.resolved_methods().unwrap(),
            &[Some(ResponseMethod::PredictProba), Some(ResponseMethod::DecisionFunction)]
        );
    }

    #[test]
    fn test_regressor_fit_predict() {
        let (x, y) = line();
        let mut reg = StackingRegressor::default()
            .add_estimator("ridge", RidgeRegression::new(0.01))
            .add_estimator("svr", LinearSvr::default());
        reg.fit(&x, &y, None).unwrap();
        assert_eq!(reg.transform(&x).unwrap().dim(), (12, 2));
        assert!(reg.score(&x, &y).unwrap() > 0.95);
        assert_eq!(reg.fitted_final_estimator().unwrap().name(), "LinearRegression");
    }

    #[test]
    fn test_unfitted_access() {
        let clf = StackingClassifier::default().add_estimator("lr", LogisticRegression::new());
        let x = Array2::zeros((2, 2));
        assert!(matches!(clf.predict(&x), Err(StackingError::ModelNotFitted)));
        assert!(matches!(clf.transform(&x), Err(StackingError::ModelNotFitted)));
        assert!(matches!(clf.fitted_estimators(), Err(StackingError::ModelNotFitted)));
        assert!(matches!(clf.resolved_methods(), Err(StackingError::ModelNotFitted)));
    }

    #[test]
    fn test_final_estimator_kind_checked() {
        let (x, y) = blobs();
        let mut clf = StackingClassifier::default()
            .add_estimator("lr", LogisticRegression::new())
            .with_final_estimator(LinearRegression::new());
        let err = clf.fit(&x, &y, None).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("should be a classifier"), "{}", err);
    }

    #[test]
    fn test_name_validation() {
        let (x, y) = blobs();

        let mut empty = StackingClassifier::default();
        assert!(empty.fit(&x, &y, None).unwrap_err().is_config_error());

        let mut dunder = StackingClassifier::default().add_estimator("a__b", LogisticRegression::new());
        assert!(dunder.fit(&x, &y, None).unwrap_err().to_string().contains("__"));

        let mut clash = StackingClassifier::default().add_estimator("cv", LogisticRegression::new());
        let err = clash.fit(&x, &y, None).unwrap_err();
        assert!(err.to_string().contains("conflict"), "{}", err);

    }

    #[test]
    fn test_duplicate_names_rejected() {
        let (x, y) = blobs();

        let mut chained = StackingClassifier::default()
            .add_estimator("lr", LogisticRegression::new())
            .add_estimator("lr", LinearSvc::default());
        assert_eq!(chained.named_estimators().len(), 2);
        let err = chained.fit(&x, &y, None).unwrap_err();
        assert!(err.is_config_error(), "{:?}", err);
        assert!(err.to_string().contains("not unique"), "{}", err);
        assert!(!chained.is_fitted());

        let slots = vec![
            ("a".to_string(), EstimatorSlot::present(LogisticRegression::new())),
            ("a".to_string(), EstimatorSlot::Dropped),
        ];
        let mut from_slots = StackingClassifier::from_slots(slots, StackingConfig::default());
        assert_eq!(from_slots.named_estimators().len(), 2);
        let err = from_slots.fit(&x, &y, None).unwrap_err();
        assert!(err.to_string().contains("not unique"), "{}", err);

        // set_estimator still replaces by name
        let mut replaced = StackingClassifier::default().add_estimator("lr", LogisticRegression::new());
        replaced.set_estimator("lr", EstimatorSlot::present(LinearSvc::default()));
        assert_eq!(replaced.named_estimators().len(), 1);
        replaced.fit(&x, &y, None).unwrap();
        assert_eq!(replaced.resolved_methods().unwrap(), &[Some(ResponseMethod::DecisionFunction)]);
    }

    /// Logistic regression that refuses weighted fits
    #[derive(Debug, Clone, Default)]
    struct UnweightedLogistic(LogisticRegression);

    impl Estimator for UnweightedLogistic {
        fn name(&self) -> &str {
            "UnweightedLogistic"
        }

        fn kind(&self) -> EstimatorKind {
            EstimatorKind::Classifier
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::predict_only().with_predict_proba()
        }

        fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
            crate::training::reject_sample_weight(self.name(), sample_weight)?;
            self.0.fit(x, y, None)
        }

        fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
            self.0.predict(x)
        }

        fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
            self.0.predict_proba(x)
        }

        fn fresh_copy(&self) -> Box<dyn Estimator> {
            Box::new(Self::default())
        }

        fn boxed_clone(&self) -> Box<dyn Estimator> {
            Box::new(self.clone())
        }
    }

    #[test]
    fn test_sample_weight_capability_names_entry() {
        let (x, y) = blobs();
        let w = Array1::ones(12);
        let mut clf = StackingClassifier::default()
            .add_estimator("lr", LogisticRegression::new())
            .add_estimator("plain", UnweightedLogistic::default());
        let err = clf.fit(&x, &y, Some(&w)).unwrap_err();
        match err {
            StackingError::CapabilityError { estimator, .. } => assert_eq!(estimator, "plain"),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!Estimator::capabilities(&clf).sample_weight);

        // Unweighted fits still work
        clf.fit(&x, &y, None).unwrap();
        assert_eq!(clf.predict(&x).unwrap(), y);
    }

    #[test]
    fn test_weighted_fit_forwards_weights() {
        let (x, y) = blobs();
        let w = Array1::from_elem(12, 2.0);
        let mut clf = StackingClassifier::default()
            .add_estimator("lr", LogisticRegression::new())
            .add_estimator("dummy", DummyClassifier::default());
        clf.fit(&x, &y, Some(&w)).unwrap();
        assert!(clf.score(&x, &y).unwrap() > 0.99);
    }

    #[test]
    fn test_failed_fit_keeps_previous_state() {
        let (x, y) = blobs();
        let mut clf = StackingClassifier::default().add_estimator("lr", LogisticRegression::new());
        clf.fit(&x, &y, None).unwrap();
        let before = clf.predict(&x).unwrap();

        let bad_y = Array1::zeros(5);
        assert!(clf.fit(&x, &bad_y, None).is_err());
        assert_eq!(clf.predict(&x).unwrap(), before);
    }

    #[test]
    fn test_transform_checks_feature_count() {
        let (x, y) = blobs();
        let mut clf = StackingClassifier::default().add_estimator("lr", LogisticRegression::new());
        clf.fit(&x, &y, None).unwrap();
        let err = clf.transform(&Array2::zeros((2, 3))).unwrap_err();
        assert!(matches!(err, StackingError::ShapeError { .. }));
    }

    #[test]
    fn test_predict_proba_needs_final_capability() {
        let (x, y) = blobs();
        let mut clf = StackingClassifier::default()
            .add_estimator("lr", LogisticRegression::new())
            .with_final_estimator(LinearSvc::default());
        clf.fit(&x, &y, None).unwrap();
        let err = clf.predict_proba(&x).unwrap_err();
        assert!(matches!(err, StackingError::CapabilityError { .. }));
        assert!(clf.decision_function(&x).is_ok());
        assert!(!Estimator::capabilities(&clf).predict_proba);
    }

    #[test]
    fn test_get_params_deep() {
        let clf = StackingClassifier::default()
            .add_estimator("lr", LogisticRegression::new().with_alpha(0.5))
            .add_dropped("gone");
        let shallow = clf.get_params(false);
        assert_eq!(shallow["cv"], ParamValue::Int(3));
        assert_eq!(shallow["lr"], ParamValue::Estimator("LogisticRegression".to_string()));
        assert_eq!(shallow["gone"], ParamValue::Drop);
        assert!(!shallow.contains_key("lr__alpha"));

        let deep = clf.get_params(true);
        assert_eq!(deep["lr__alpha"], ParamValue::Float(0.5));
        assert_eq!(
            deep["estimators"],
            ParamValue::List(vec!["lr".to_string(), "gone".to_string()])
        );
    }

    #[test]
    fn test_set_param_invalidates_fit() {
        let (x, y) = blobs();
        let mut clf = StackingClassifier::default()
            .add_estimator("lr", LogisticRegression::new())
            .add_estimator("svc", LinearSvc::default());
        clf.fit(&x, &y, None).unwrap();

        clf.set_param("lr__alpha", &ParamValue::Float(0.1)).unwrap();
        assert!(!clf.is_fitted());
        assert_eq!(clf.get_params(true)["lr__alpha"], ParamValue::Float(0.1));

        clf.set_param("svc", &ParamValue::Drop).unwrap();
        assert!(clf.named_estimators()[1].1.is_dropped());
        clf.fit(&x, &y, None).unwrap();
        assert_eq!(clf.transform(&x).unwrap().ncols(), 2);
        assert_eq!(clf.resolved_methods().unwrap()[1], None);
    }

    #[test]
    fn test_set_param_rejects_bad_values() {
        let mut clf = StackingClassifier::default().add_estimator("lr", LogisticRegression::new());
        assert!(clf.set_param("passthrough", &ParamValue::Str("yes".into())).unwrap_err().is_config_error());
        assert!(clf.set_param("cv", &ParamValue::Int(1)).is_err());
        assert!(clf.set_param("predict_method", &ParamValue::Str("predict_log_proba".into())).is_err());
        assert!(clf.set_param("unknown", &ParamValue::Int(1)).is_err());
        assert!(clf.set_param("lr", &ParamValue::Estimator("X".into())).is_err());
        assert!(clf.set_param("nope__alpha", &ParamValue::Float(1.0)).is_err());

        clf.set_param("cv", &ParamValue::Str("prefit".into())).unwrap();
        assert!(clf.config().cv.is_prefit());
        clf.set_param("n_jobs", &ParamValue::Int(-1)).unwrap();
        assert_eq!(clf.config().n_jobs, None);
    }

    #[test]
    fn test_final_estimator_param_materializes_default() {
        let mut reg = StackingRegressor::default().add_estimator("dummy", DummyRegressor::default());
        reg.set_param("final_estimator__alpha", &ParamValue::Float(0.3)).unwrap();
        let params = reg.get_params(true);
        assert_eq!(params["final_estimator"], ParamValue::Estimator("LinearRegression".to_string()));
        assert_eq!(params["final_estimator__alpha"], ParamValue::Float(0.3));

        reg.set_param("final_estimator", &ParamValue::None).unwrap();
        assert_eq!(reg.get_params(false)["final_estimator"], ParamValue::None);
    }

    #[test]
    fn test_stacking_nests_as_final_estimator() {
        let (x, y) = blobs();
        let inner = StackingClassifier::default()
            .add_estimator("tree", DecisionTree::new_classifier().with_max_depth(2));
        let mut outer = StackingClassifier::default()
            .add_estimator("forest", RandomForest::new_classifier(5).with_random_state(0))
            .add_estimator("lr", LogisticRegression::new())
            .with_final_estimator(inner);
        outer.fit(&x, &y, None).unwrap();
        assert!(outer.score(&x, &y).unwrap() > 0.9);
    }

    #[test]
    fn test_prefit_uses_estimators_as_supplied() {
        let (x, y) = blobs();
        let mut lr = LogisticRegression::new();
        lr.fit(&x, &y, None).unwrap();

        let mut clf = StackingClassifier::new(StackingConfig::new().with_cv(CvPolicy::Prefit))
            .add_estimator("lr", lr.clone());
        clf.fit(&x, &y, None).unwrap();
        assert_eq!(clf.transform(&x).unwrap(), lr.predict_proba(&x).unwrap());
    }

    #[test]
    fn test_prefit_with_unfitted_estimator_fails() {
        let (x, y) = blobs();
        let mut clf = StackingClassifier::new(StackingConfig::new().with_cv(CvPolicy::Prefit))
            .add_estimator("lr", LogisticRegression::new());
        assert!(clf.fit(&x, &y, None).is_err());
        assert!(!clf.is_fitted());
    }
}
