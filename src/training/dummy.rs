//! Baseline estimators that ignore the features

use super::models::{
    check_fit_input, check_n_features, invalid_param, normalized_weights, unique_classes,
    unknown_param, Capabilities, Estimator, EstimatorKind, ParamValue, Params, PredictOutput,
    PredictParams,
};
use crate::error::{Result, StackingError};
use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

/// Strategy of [`DummyClassifier`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierStrategy {
    /// Predict the most frequent class, probabilities are the class priors
    Prior,
    /// Predict the most frequent class with probability one
    MostFrequent,
}

/// Classifier predicting from the (weighted) class distribution alone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyClassifier {
    pub strategy: ClassifierStrategy,
    classes: Vec<f64>,
    priors: Option<Array1<f64>>,
    n_features: usize,
}

impl Default for DummyClassifier {
    fn default() -> Self {
        Self::new(ClassifierStrategy::Prior)
    }
}

impl DummyClassifier {
    pub fn new(strategy: ClassifierStrategy) -> Self {
        Self {
            strategy,
            classes: Vec::new(),
            priors: None,
            n_features: 0,
        }
    }

    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    fn fitted_priors(&self, x: &Array2<f64>) -> Result<&Array1<f64>> {
        let priors = self.priors.as_ref().ok_or(StackingError::ModelNotFitted)?;
        check_n_features(self.n_features, x)?;
        Ok(priors)
    }

    fn majority(priors: &Array1<f64>) -> usize {
        let mut best = 0;
        for (k, &p) in priors.iter().enumerate() {
            if p > priors[best] {
                best = k;
            }
        }
        best
    }
}

impl Estimator for DummyClassifier {
    fn name(&self) -> &str {
        "DummyClassifier"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Classifier
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::predict_only()
            .with_predict_proba()
            .with_sample_weight()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        let weights = normalized_weights(x.nrows(), sample_weight)?;
        let classes = unique_classes(y);

        let mut priors = Array1::zeros(classes.len());
        for (&label, &w) in y.iter().zip(weights.iter()) {
            if let Some(k) = super::models::class_index(&classes, label) {
                priors[k] += w;
            }
        }

        self.classes = classes;
        self.priors = Some(priors);
        self.n_features = x.ncols();
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let priors = self.fitted_priors(x)?;
        let label = self.classes[Self::majority(priors)];
        Ok(Array1::from_elem(x.nrows(), label))
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        let priors = self.fitted_priors(x)?;
        let mut proba = Array2::zeros((x.nrows(), self.classes.len()));
        match self.strategy {
            ClassifierStrategy::Prior => {
                for mut row in proba.rows_mut() {
                    row.assign(priors);
                }
            }
            ClassifierStrategy::MostFrequent => {
                let k = Self::majority(priors);
                proba.column_mut(k).fill(1.0);
            }
        }
        Ok(proba)
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        Box::new(Self::new(self.strategy))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        let strategy = match self.strategy {
            ClassifierStrategy::Prior => "prior",
            ClassifierStrategy::MostFrequent => "most_frequent",
        };
        let mut params = Params::new();
        params.insert("strategy".to_string(), ParamValue::Str(strategy.to_string()));
        params
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        match (key, value.as_str()) {
            ("strategy", Some("prior")) => self.strategy = ClassifierStrategy::Prior,
            ("strategy", Some("most_frequent")) => self.strategy = ClassifierStrategy::MostFrequent,
            ("strategy", _) => {
                return Err(invalid_param(key, value, "expected 'prior' or 'most_frequent'"))
            }
            _ => return Err(unknown_param(self.name(), key, value)),
        }
        Ok(())
    }
}

/// Strategy of [`DummyRegressor`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RegressorStrategy {
    /// Weighted mean of the training targets
    Mean,
    /// Median of the training targets
    Median,
    /// A fixed value
    Constant(f64),
}

/// Regressor predicting a single constant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DummyRegressor {
    pub strategy: RegressorStrategy,
    constant: Option<f64>,
    n_features: usize,
}

impl Default for DummyRegressor {
    fn default() -> Self {
        Self::new(RegressorStrategy::Mean)
    }
}

impl DummyRegressor {
    pub fn new(strategy: RegressorStrategy) -> Self {
        Self {
            strategy,
            constant: None,
            n_features: 0,
        }
    }

    /// The fitted constant
    pub fn constant(&self) -> Option<f64> {
        self.constant
    }
}

impl Estimator for DummyRegressor {
    fn name(&self) -> &str {
        "DummyRegressor"
    }

    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Regressor
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::predict_only().with_sample_weight()
    }

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        let constant = match self.strategy {
            RegressorStrategy::Mean => y.dot(&normalized_weights(x.nrows(), sample_weight)?),
            RegressorStrategy::Median => {
                let mut sorted: Vec<f64> = y.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
            RegressorStrategy::Constant(value) => value,
        };
        self.constant = Some(constant);
        self.n_features = x.ncols();
        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let constant = self.constant.ok_or(StackingError::ModelNotFitted)?;
        check_n_features(self.n_features, x)?;
        Ok(Array1::from_elem(x.nrows(), constant))
    }

    /// Accepts `return_std`; the standard deviation of a constant is zero
    fn predict_with(&self, x: &Array2<f64>, params: &PredictParams) -> Result<PredictOutput> {
        params.ensure_only(self.name(), &["return_std"])?;
        let predictions = self.predict(x)?;
        let return_std = match params.get("return_std") {
            None => false,
            Some(value) => value
                .as_bool()
                .ok_or_else(|| invalid_param("return_std", value, "must be a boolean"))?,
        };
        let std = return_std.then(|| Array1::zeros(x.nrows()));
        Ok(PredictOutput { predictions, std })
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        Box::new(Self::new(self.strategy))
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        let (strategy, constant) = match self.strategy {
            RegressorStrategy::Mean => ("mean", ParamValue::None),
            RegressorStrategy::Median => ("median", ParamValue::None),
            RegressorStrategy::Constant(v) => ("constant", ParamValue::Float(v)),
        };
        params.insert("strategy".to_string(), ParamValue::Str(strategy.to_string()));
        params.insert("constant".to_string(), constant);
        params
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        match (key, value) {
            ("strategy", ParamValue::Str(s)) if s == "mean" => self.strategy = RegressorStrategy::Mean,
            ("strategy", ParamValue::Str(s)) if s == "median" => self.strategy = RegressorStrategy::Median,
            ("strategy", _) => return Err(invalid_param(key, value, "expected 'mean' or 'median'")),
            ("constant", v) => {
                let c = v
                    .as_f64()
                    .ok_or_else(|| invalid_param(key, value, "must be a number"))?;
                self.strategy = RegressorStrategy::Constant(c);
            }
            _ => return Err(unknown_param(self.name(), key, value)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_dummy_classifier_priors() {
        let x = Array2::zeros((4, 2));
        let y = array![0.0, 1.0, 1.0, 1.0];
        let mut clf = DummyClassifier::default();
        clf.fit(&x, &y, None).unwrap();

        assert_eq!(clf.predict(&x).unwrap(), array![1.0, 1.0, 1.0, 1.0]);
        let proba = clf.predict_proba(&x).unwrap();
        assert!((proba[[0, 0]] - 0.25).abs() < 1e-12);
        assert!((proba[[3, 1]] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_dummy_classifier_weighted() {
        let x = Array2::zeros((3, 1));
        let y = array![0.0, 1.0, 1.0];
        let mut clf = DummyClassifier::default();
        clf.fit(&x, &y, Some(&array![4.0, 1.0, 1.0])).unwrap();
        assert_eq!(clf.predict(&x).unwrap()[0], 0.0);
    }

    #[test]
    fn test_dummy_regressor_mean_and_std() {
        let x = Array2::zeros((3, 2));
        let y = array![1.0, 2.0, 6.0];
        let mut reg = DummyRegressor::default();
        reg.fit(&x, &y, None).unwrap();

        assert_eq!(reg.constant(), Some(3.0));
        let params = PredictParams::new().with("return_std", ParamValue::Bool(true));
        let output = reg.predict_with(&x, &params).unwrap();
        assert_eq!(output.predictions, array![3.0, 3.0, 3.0]);
        assert_eq!(output.std, Some(array![0.0, 0.0, 0.0]));

        let without = reg.predict_with(&x, &PredictParams::new()).unwrap();
        assert!(without.std.is_none());
    }

    #[test]
    fn test_dummy_regressor_rejects_unknown_predict_param() {
        let x = Array2::zeros((2, 1));
        let mut reg = DummyRegressor::default();
        reg.fit(&x, &array![1.0, 2.0], None).unwrap();
        let params = PredictParams::new().with("return_cov", ParamValue::Bool(true));
        assert!(reg.predict_with(&x, &params).is_err());
    }

    #[test]
    fn test_dummy_regressor_median() {
        let x = Array2::zeros((4, 1));
        let mut reg = DummyRegressor::new(RegressorStrategy::Median);
        reg.fit(&x, &array![1.0, 9.0, 2.0, 4.0], None).unwrap();
        assert_eq!(reg.constant(), Some(3.0));
    }
}
