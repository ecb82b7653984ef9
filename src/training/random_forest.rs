//! Random Forest implementation

use super::decision_tree::{Criterion, DecisionTree};
use super::linear_models::argmax;
use super::models::{
    check_fit_input, invalid_param, unique_classes, unknown_param, Capabilities, Estimator,
    EstimatorKind, ParamValue, Params,
};
use crate::error::{Result, StackingError};
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Random Forest model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    /// Individual trees
    trees: Vec<DecisionTree>,
    /// Number of trees
    pub n_estimators: usize,
    /// Maximum depth per tree
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    /// Features drawn per split (sqrt by default)
    pub max_features: MaxFeatures,
    /// Bootstrap sampling
    pub bootstrap: bool,
    /// Impurity criterion
    pub criterion: Criterion,
    /// Random state (42 when unset)
    pub random_state: Option<u64>,
    /// Is classification task
    is_classification: bool,
    /// Feature importances
    feature_importances: Option<Array1<f64>>,
    /// Number of features
    n_features: usize,
    /// Classes (for classification)
    classes: Vec<f64>,
}

/// Strategy for max features
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MaxFeatures {
    /// Square root of n_features
    Sqrt,
    /// Log2 of n_features
    Log2,
    /// Fraction of n_features
    Fraction(f64),
    /// Fixed number
    Fixed(usize),
    /// All features
    All,
}

impl Default for RandomForest {
    fn default() -> Self {
        Self::new_classifier(100)
    }
}

impl RandomForest {
    /// Create a new classifier forest
    pub fn new_classifier(n_estimators: usize) -> Self {
        Self {
            trees: Vec::new(),
            n_estimators,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
            criterion: Criterion::Gini,
            random_state: None,
            is_classification: true,
            feature_importances: None,
            n_features: 0,
            classes: Vec::new(),
        }
    }

    /// Create a new regressor forest
    pub fn new_regressor(n_estimators: usize) -> Self {
        Self {
            criterion: Criterion::MSE,
            max_features: MaxFeatures::All,
            is_classification: false,
            ..Self::new_classifier(n_estimators)
        }
    }

    /// Set maximum depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Set minimum samples in leaf
    pub fn with_min_samples_leaf(mut self, min_samples: usize) -> Self {
        self.min_samples_leaf = min_samples;
        self
    }

    /// Set max features strategy
    pub fn with_max_features(mut self, max_features: MaxFeatures) -> Self {
        self.max_features = max_features;
        self
    }

    /// Set random state
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    fn compute_max_features(&self, n_features: usize) -> usize {
        match self.max_features {
            MaxFeatures::Sqrt => (n_features as f64).sqrt().ceil() as usize,
            MaxFeatures::Log2 => (n_features as f64).log2().ceil() as usize,
            MaxFeatures::Fraction(f) => (n_features as f64 * f).ceil() as usize,
            MaxFeatures::Fixed(n) => n.min(n_features),
            MaxFeatures::All => n_features,
        }
        .clamp(1, n_features.max(1))
    }

    fn compute_feature_importances(&mut self) {
        if self.trees.is_empty() {
            return;
        }

        let mut total_importances = Array1::zeros(self.n_features);
        for tree in &self.trees {
            if let Some(imp) = tree.feature_importances() {
                total_importances += imp;
            }
        }

        // Normalize
        let total: f64 = total_importances.sum();
        if total > 0.0 {
            total_importances /= total;
        }

        self.feature_importances = Some(total_importances);
    }

    /// Get feature importances
    pub fn feature_importances(&self) -> Option<&Array1<f64>> {
        self.feature_importances.as_ref()
    }

    /// Get number of trees
    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Unfitted forest with the same hyperparameters
    fn hyperparameters(&self) -> Self {
        Self {
            trees: Vec::new(),
            n_estimators: self.n_estimators,
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            min_samples_leaf: self.min_samples_leaf,
            max_features: self.max_features,
            bootstrap: self.bootstrap,
            criterion: self.criterion,
            random_state: self.random_state,
            is_classification: self.is_classification,
            feature_importances: None,
            n_features: 0,
            classes: Vec::new(),
        }
    }
}

impl Estimator for RandomForest {
    fn name(&self) -> &str {
        if self.is_classification {
            "RandomForestClassifier"
        } else {
            "RandomForestRegressor"
        }
    }

    fn kind(&self) -> EstimatorKind {
        if self.is_classification {
            EstimatorKind::Classifier
        } else {
            EstimatorKind::Regressor
        }
    }

    fn capabilities(&self) -> Capabilities {
        let caps = Capabilities::predict_only().with_sample_weight();
        if self.is_classification {
            caps.with_predict_proba()
        } else {
            caps
        }
    }

    /// Trees are grown in parallel, tree `i` seeded with `random_state + i`
    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        if self.n_estimators == 0 {
            return Err(StackingError::ConfigError(
                "n_estimators must be at least 1".to_string(),
            ));
        }
        let n_samples = x.nrows();
        let n_features = x.ncols();
        let max_features = self.compute_max_features(n_features);
        let classes = if self.is_classification { unique_classes(y) } else { Vec::new() };
        let base_seed = self.random_state.unwrap_or(42);

        let trees: Vec<DecisionTree> = (0..self.n_estimators)
            .into_par_iter()
            .map(|tree_idx| {
                let seed = base_seed.wrapping_add(tree_idx as u64);
                let mut rng = ChaCha8Rng::seed_from_u64(seed);

                // Bootstrap sample
                let sample_indices: Vec<usize> = if self.bootstrap {
                    (0..n_samples).map(|_| rng.gen_range(0..n_samples)).collect()
                } else {
                    (0..n_samples).collect()
                };

                let x_boot = x.select(Axis(0), &sample_indices);
                let y_boot = y.select(Axis(0), &sample_indices);
                let w_boot = sample_weight.map(|w| w.select(Axis(0), &sample_indices));

                let mut tree = if self.is_classification {
                    DecisionTree::new_classifier()
                } else {
                    DecisionTree::new_regressor()
                };
                if let Some(d) = self.max_depth {
                    tree = tree.with_max_depth(d);
                }
                let mut tree = tree
                    .with_min_samples_split(self.min_samples_split)
                    .with_min_samples_leaf(self.min_samples_leaf)
                    .with_criterion(self.criterion)
                    .with_max_features(max_features)
                    .with_random_state(rng.gen());

                tree.fit_with_classes(&x_boot, &y_boot, w_boot.as_ref(), classes.clone())?;
                Ok(tree)
            })
            .collect::<Result<Vec<_>>>()?;

        self.trees = trees;
        self.n_features = n_features;
        self.classes = classes;
        self.compute_feature_importances();

        Ok(())
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        if self.trees.is_empty() {
            return Err(StackingError::ModelNotFitted);
        }

        if self.is_classification {
            let proba = self.predict_proba(x)?;
            return Ok(proba
                .rows()
                .into_iter()
                .map(|row| self.classes[argmax(row.iter().copied())])
                .collect());
        }

        // Mean prediction
        let all_predictions: Vec<Array1<f64>> = self
            .trees
            .par_iter()
            .map(|tree| tree.predict(x))
            .collect::<Result<Vec<_>>>()?;
        let mut mean = Array1::zeros(x.nrows());
        for preds in &all_predictions {
            mean += preds;
        }
        Ok(mean / all_predictions.len() as f64)
    }

    /// Mean of the trees' leaf class distributions
    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if !self.is_classification {
            return Err(StackingError::capability(self.name(), "predict_proba"));
        }
        if self.trees.is_empty() {
            return Err(StackingError::ModelNotFitted);
        }

        let all_proba: Vec<Array2<f64>> = self
            .trees
            .par_iter()
            .map(|tree| tree.predict_proba(x))
            .collect::<Result<Vec<_>>>()?;

        let mut proba = Array2::zeros((x.nrows(), self.classes.len()));
        for p in &all_proba {
            proba += p;
        }
        Ok(proba / all_proba.len() as f64)
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        Box::new(self.hyperparameters())
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        let mut params = Params::new();
        params.insert("n_estimators".to_string(), ParamValue::Int(self.n_estimators as i64));
        params.insert(
            "max_depth".to_string(),
            self.max_depth.map_or(ParamValue::None, |d| ParamValue::Int(d as i64)),
        );
        params.insert("min_samples_leaf".to_string(), ParamValue::Int(self.min_samples_leaf as i64));
        params.insert("bootstrap".to_string(), ParamValue::Bool(self.bootstrap));
        params.insert(
            "random_state".to_string(),
            self.random_state.map_or(ParamValue::None, |s| ParamValue::Int(s as i64)),
        );
        params
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        match key {
            "n_estimators" => {
                self.n_estimators = value
                    .as_usize()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| invalid_param(key, value, "must be a positive integer"))?;
            }
            "max_depth" => {
                self.max_depth = match value {
                    ParamValue::None => None,
                    other => Some(
                        other
                            .as_usize()
                            .filter(|d| *d > 0)
                            .ok_or_else(|| invalid_param(key, value, "must be a positive integer or None"))?,
                    ),
                };
            }
            "min_samples_leaf" => {
                self.min_samples_leaf = value
                    .as_usize()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| invalid_param(key, value, "must be an integer >= 1"))?;
            }
            "bootstrap" => {
                self.bootstrap = value
                    .as_bool()
                    .ok_or_else(|| invalid_param(key, value, "must be a boolean"))?;
            }
            "random_state" => {
                self.random_state = match value {
                    ParamValue::None => None,
                    other => Some(
                        other
                            .as_usize()
                            .ok_or_else(|| invalid_param(key, value, "must be a non-negative integer or None"))?
                            as u64,
                    ),
                };
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
    fn test_classifier() {
        let x = array![
            [0.0, 0.0],
            [0.1, 0.1],
            [0.2, 0.2],
            [1.0, 1.0],
            [1.1, 1.1],
            [1.2, 1.2],
        ];
        let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];

        let mut rf = RandomForest::new_classifier(10)
            .with_random_state(42);
        rf.fit(&x, &y, None).unwrap();

        assert_eq!(rf.n_trees(), 10);
        let predictions = rf.predict(&x).unwrap();
        let correct = predictions.iter().zip(y.iter())
            .filter(|(p, a)| (*p - *a).abs() < 0.5)
            .count();
        assert!(correct >= 5);

        let proba = rf.predict_proba(&x).unwrap();
        assert_eq!(proba.dim(), (6, 2));
        for row in proba.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_regressor() {
        let x = Array2::from_shape_fn((40, 1), |(i, _)| i as f64);
        let y = x.column(0).mapv(|v| v * 0.5);

        let mut rf = RandomForest::new_regressor(20).with_random_state(1);
        rf.fit(&x, &y, None).unwrap();

        let pred = rf.predict(&array![[20.0]]).unwrap();
        assert!((pred[0] - 10.0).abs() < 2.0, "prediction {}", pred[0]);
        assert!(rf.predict_proba(&x).is_err());
    }

    #[test]
    fn test_seeded_forest_is_deterministic() {
        let x = Array2::from_shape_fn((50, 4), |(i, j)| ((i * 13 + j * 5) % 17) as f64);
        let y = Array1::from_shape_fn(50, |i| (i % 3) as f64);

        let mut a = RandomForest::new_classifier(8).with_random_state(9);
        let mut b = RandomForest::new_classifier(8).with_random_state(9);
        a.fit(&x, &y, None).unwrap();
        b.fit(&x, &y, None).unwrap();
        assert_eq!(a.predict_proba(&x).unwrap(), b.predict_proba(&x).unwrap());
    }

    #[test]
    fn test_feature_importances_sum_to_one() {
        let x = Array2::from_shape_fn((30, 3), |(i, j)| if j == 0 { i as f64 } else { ((i * 7) % 5) as f64 });
        let y = Array1::from_shape_fn(30, |i| if i < 15 { 0.0 } else { 1.0 });

        let mut rf = RandomForest::new_classifier(5).with_random_state(0);
        rf.fit(&x, &y, None).unwrap();
        let importances = rf.feature_importances().unwrap();
        assert!((importances.sum() - 1.0).abs() < 1e-9);
    }
}
