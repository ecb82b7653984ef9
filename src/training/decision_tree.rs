//! Decision tree implementation

use super::models::{
    check_fit_input, check_n_features, class_index, invalid_param, unique_classes, unknown_param,
    Capabilities, Estimator, EstimatorKind, ParamValue, Params,
};
use crate::error::{Result, StackingError};
use ndarray::{Array1, Array2};
use rand::seq::index::sample;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Decision tree node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TreeNode {
    /// Leaf node with prediction value
    Leaf {
        value: f64,
        /// Weighted class proportions, aligned with the tree's classes (empty for regression)
        distribution: Vec<f64>,
        n_samples: usize,
    },
    /// Internal node with split
    Split {
        feature_idx: usize,
        threshold: f64,
        left: Box<TreeNode>,
        right: Box<TreeNode>,
        n_samples: usize,
        impurity: f64,
    },
}

/// Impurity criterion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum Criterion {
    /// Gini impurity (classification)
    Gini,
    /// Entropy (classification)
    Entropy,
    /// Mean squared error (regression)
    MSE,
}

impl Criterion {
    fn as_str(&self) -> &'static str {
        match self {
            Criterion::Gini => "gini",
            Criterion::Entropy => "entropy",
            Criterion::MSE => "mse",
        }
    }
}

/// Weighted sufficient statistics of a set of targets
#[derive(Debug, Clone)]
struct NodeStats {
    count: usize,
    weight: f64,
    sum: f64,
    sq_sum: f64,
    class_weights: Vec<f64>,
}

impl NodeStats {
    fn new(n_classes: usize) -> Self {
        Self {
            count: 0,
            weight: 0.0,
            sum: 0.0,
            sq_sum: 0.0,
            class_weights: vec![0.0; n_classes],
        }
    }

    fn add(&mut self, y: f64, w: f64, class: Option<usize>) {
        self.count += 1;
        self.weight += w;
        self.sum += w * y;
        self.sq_sum += w * y * y;
        if let Some(c) = class {
            self.class_weights[c] += w;
        }
    }

    fn remove(&mut self, y: f64, w: f64, class: Option<usize>) {
        self.count -= 1;
        self.weight -= w;
        self.sum -= w * y;
        self.sq_sum -= w * y * y;
        if let Some(c) = class {
            self.class_weights[c] -= w;
        }
    }

    fn impurity(&self, criterion: Criterion) -> f64 {
        if self.weight <= 0.0 {
            return 0.0;
        }
        match criterion {
            Criterion::Gini => {
                1.0 - self
                    .class_weights
                    .iter()
                    .map(|&c| (c / self.weight).powi(2))
                    .sum::<f64>()
            }
            Criterion::Entropy => -self
                .class_weights
                .iter()
                .filter(|&&c| c > 0.0)
                .map(|&c| {
                    let p = c / self.weight;
                    p * p.ln()
                })
                .sum::<f64>(),
            // Var = E[X²] - E[X]²
            Criterion::MSE => (self.sq_sum / self.weight - (self.sum / self.weight).powi(2)).max(0.0),
        }
    }
}

/// Decision tree model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTree {
    /// Tree root
    root: Option<TreeNode>,
    /// Maximum depth
    pub max_depth: Option<usize>,
    /// Minimum samples to split
    pub min_samples_split: usize,
    /// Minimum samples in leaf
    pub min_samples_leaf: usize,
    /// Number of features drawn at random for each split (None = all)
    pub max_features: Option<usize>,
    /// Seed for the per-split feature draw
    pub random_state: Option<u64>,
    /// Impurity criterion
    pub criterion: Criterion,
    /// Number of features
    n_features: usize,
    /// Feature importances
    feature_importances: Option<Array1<f64>>,
    /// Is classification task
    is_classification: bool,
    /// Classes (for classification)
    classes: Vec<f64>,
}

impl Default for DecisionTree {
    fn default() -> Self {
        Self::new_classifier()
    }
}

impl DecisionTree {
    /// Create a new classifier tree
    pub fn new_classifier() -> Self {
        Self {
            root: None,
            max_depth: None,
            min_samples_split: 2,
            min_samples_leaf: 1,
            max_features: None,
            random_state: None,
            criterion: Criterion::Gini,
            n_features: 0,
            feature_importances: None,
            is_classification: true,
            classes: Vec::new(),
        }
    }

    /// Create a new regressor tree
    pub fn new_regressor() -> Self {
        Self {
            criterion: Criterion::MSE,
            is_classification: false,
            ..Self::new_classifier()
        }
    }

    /// Set maximum depth
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Set minimum samples to split
    pub fn with_min_samples_split(mut self, min_samples: usize) -> Self {
        self.min_samples_split = min_samples;
        self
    }

    /// Set minimum samples in leaf
    pub fn with_min_samples_leaf(mut self, min_samples: usize) -> Self {
        self.min_samples_leaf = min_samples;
        self
    }

    pub fn with_max_features(mut self, max_features: usize) -> Self {
        self.max_features = Some(max_features);
        self
    }

    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    /// Set criterion
    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criterion = criterion;
        self
    }

    pub fn classes(&self) -> &[f64] {
        &self.classes
    }

    /// Fit with an explicit class list; a forest passes the classes of the
    /// full dataset so every tree's distributions share one column layout.
    pub(crate) fn fit_with_classes(
        &mut self,
        x: &Array2<f64>,
        y: &Array1<f64>,
        sample_weight: Option<&Array1<f64>>,
        classes: Vec<f64>,
    ) -> Result<()> {
        check_fit_input(x, y, sample_weight)?;
        let n_samples = x.nrows();
        let n_features = x.ncols();

        let weights = match sample_weight {
            Some(w) => w.clone(),
            None => Array1::ones(n_samples),
        };
        let labels: Vec<Option<usize>> = if self.is_classification {
            y.iter().map(|&v| class_index(&classes, v)).collect()
        } else {
            vec![None; n_samples]
        };
        if self.is_classification && labels.iter().any(Option::is_none) {
            return Err(StackingError::ValidationError(
                "training labels are not part of the declared classes".to_string(),
            ));
        }

        self.n_features = n_features;
        self.classes = classes;

        let ctx = BuildContext {
            x,
            y,
            weights: &weights,
            labels: &labels,
            n_classes: self.classes.len(),
        };
        let mut rng = match self.random_state {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        let mut importances = vec![0.0; n_features];

        let indices: Vec<usize> = (0..n_samples).collect();
        self.root = Some(self.build_tree(&ctx, &indices, 0, &mut importances, &mut rng));

        // Normalize feature importances
        let total: f64 = importances.iter().sum();
        if total > 0.0 {
            for imp in &mut importances {
                *imp /= total;
            }
        }
        self.feature_importances = Some(Array1::from_vec(importances));

        Ok(())
    }

    fn node_stats(&self, ctx: &BuildContext<'_>, indices: &[usize]) -> NodeStats {
        let mut stats = NodeStats::new(ctx.n_classes);
        for &i in indices {
            stats.add(ctx.y[i], ctx.weights[i], ctx.labels[i]);
        }
        stats
    }

    fn make_leaf(&self, stats: &NodeStats) -> TreeNode {
        if self.is_classification {
            let n_classes = stats.class_weights.len().max(1);
            let distribution: Vec<f64> = if stats.weight > 0.0 {
                stats.class_weights.iter().map(|&c| c / stats.weight).collect()
            } else {
                vec![1.0 / n_classes as f64; n_classes]
            };
            let mut best = 0;
            for (k, &p) in distribution.iter().enumerate() {
                if p > distribution[best] {
                    best = k;
                }
            }
            TreeNode::Leaf {
                value: self.classes.get(best).copied().unwrap_or(0.0),
                distribution,
                n_samples: stats.count,
            }
        } else {
            let value = if stats.weight > 0.0 { stats.sum / stats.weight } else { 0.0 };
            TreeNode::Leaf {
                value,
                distribution: Vec::new(),
                n_samples: stats.count,
            }
        }
    }

    fn build_tree(
        &self,
        ctx: &BuildContext<'_>,
        indices: &[usize],
        depth: usize,
        importances: &mut [f64],
        rng: &mut ChaCha8Rng,
    ) -> TreeNode {
        let n_samples = indices.len();
        let stats = self.node_stats(ctx, indices);
        let parent_impurity = stats.impurity(self.criterion);

        // Check stopping conditions
        let should_stop = n_samples < self.min_samples_split
            || n_samples < 2 * self.min_samples_leaf
            || self.max_depth.map_or(false, |d| depth >= d)
            || parent_impurity <= 1e-12;

        if should_stop {
            return self.make_leaf(&stats);
        }

        let features = self.draw_features(rng);
        let best = self.find_best_split(ctx, indices, &stats, &features);

        match best {
            Some((best_feature, best_threshold, best_gain)) => {
                let (left_indices, right_indices): (Vec<usize>, Vec<usize>) = indices
                    .iter()
                    .partition(|&&i| ctx.x[[i, best_feature]] <= best_threshold);

                importances[best_feature] += stats.weight * best_gain;

                let left = Box::new(self.build_tree(ctx, &left_indices, depth + 1, importances, rng));
                let right = Box::new(self.build_tree(ctx, &right_indices, depth + 1, importances, rng));

                TreeNode::Split {
                    feature_idx: best_feature,
                    threshold: best_threshold,
                    left,
                    right,
                    n_samples,
                    impurity: parent_impurity,
                }
            }
            None => self.make_leaf(&stats),
        }
    }

    /// Random feature subset for one split, in ascending order
    fn draw_features(&self, rng: &mut ChaCha8Rng) -> Vec<usize> {
        let k = self.max_features.unwrap_or(self.n_features).clamp(1, self.n_features.max(1));
        if k >= self.n_features {
            return (0..self.n_features).collect();
        }
        let mut features = sample(rng, self.n_features, k).into_vec();
        features.sort_unstable();
        features
    }

    /// Sorted sweep per feature; features are scanned in parallel
    fn find_best_split(
        &self,
        ctx: &BuildContext<'_>,
        indices: &[usize],
        parent: &NodeStats,
        features: &[usize],
    ) -> Option<(usize, f64, f64)> {
        if indices.len() < 2 {
            return None;
        }
        let parent_impurity = parent.impurity(self.criterion);

        let feature_results: Vec<Option<(usize, f64, f64)>> = features
            .par_iter()
            .map(|&feature_idx| {
                let mut order: Vec<usize> = indices.to_vec();
                order.sort_by(|&a, &b| {
                    ctx.x[[a, feature_idx]]
                        .partial_cmp(&ctx.x[[b, feature_idx]])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });

                let mut left = NodeStats::new(ctx.n_classes);
                let mut right = parent.clone();
                let mut best_gain = 0.0f64;
                let mut best_threshold = 0.0f64;

                for pos in 0..order.len() - 1 {
                    let i = order[pos];
                    left.add(ctx.y[i], ctx.weights[i], ctx.labels[i]);
                    right.remove(ctx.y[i], ctx.weights[i], ctx.labels[i]);

                    let current = ctx.x[[i, feature_idx]];
                    let next = ctx.x[[order[pos + 1], feature_idx]];
                    if next - current <= 1e-12 {
                        continue;
                    }
                    if left.count < self.min_samples_leaf || right.count < self.min_samples_leaf {
                        continue;
                    }

                    let weighted_impurity = (left.weight * left.impurity(self.criterion)
                        + right.weight * right.impurity(self.criterion))
                        / parent.weight;
                    let gain = parent_impurity - weighted_impurity;
                    if gain > best_gain + 1e-15 {
                        best_gain = gain;
                        best_threshold = (current + next) / 2.0;
                    }
                }

                if best_gain > 0.0 {
                    Some((feature_idx, best_threshold, best_gain))
                } else {
                    None
                }
            })
            .collect();

        // First feature wins on ties, keeping fits reproducible
        feature_results
            .into_iter()
            .flatten()
            .fold(None, |best: Option<(usize, f64, f64)>, candidate| match best {
                Some(b) if b.2 >= candidate.2 => Some(b),
                _ => Some(candidate),
            })
    }

    fn leaf_for<'a>(&self, node: &'a TreeNode, sample: ndarray::ArrayView1<f64>) -> &'a TreeNode {
        match node {
            TreeNode::Leaf { .. } => node,
            TreeNode::Split { feature_idx, threshold, left, right, .. } => {
                if sample[*feature_idx] <= *threshold {
                    self.leaf_for(left, sample)
                } else {
                    self.leaf_for(right, sample)
                }
            }
        }
    }

    fn fitted_root(&self, x: &Array2<f64>) -> Result<&TreeNode> {
        let root = self.root.as_ref().ok_or(StackingError::ModelNotFitted)?;
        check_n_features(self.n_features, x)?;
        Ok(root)
    }

    /// Get feature importances
    pub fn feature_importances(&self) -> Option<&Array1<f64>> {
        self.feature_importances.as_ref()
    }

    /// Get tree depth
    pub fn get_depth(&self) -> usize {
        match &self.root {
            None => 0,
            Some(node) => Self::node_depth(node),
        }
    }

    fn node_depth(node: &TreeNode) -> usize {
        match node {
            TreeNode::Leaf { .. } => 1,
            TreeNode::Split { left, right, .. } => {
                1 + Self::node_depth(left).max(Self::node_depth(right))
            }
        }
    }

    /// Get number of leaves
    pub fn get_n_leaves(&self) -> usize {
        match &self.root {
            None => 0,
            Some(node) => Self::count_leaves(node),
        }
    }

    fn count_leaves(node: &TreeNode) -> usize {
        match node {
            TreeNode::Leaf { .. } => 1,
            TreeNode::Split { left, right, .. } => Self::count_leaves(left) + Self::count_leaves(right),
        }
    }

    /// Unfitted tree with the same hyperparameters
    fn hyperparameters(&self) -> Self {
        Self {
            root: None,
            max_depth: self.max_depth,
            min_samples_split: self.min_samples_split,
            min_samples_leaf: self.min_samples_leaf,
            max_features: self.max_features,
            random_state: self.random_state,
            criterion: self.criterion,
            n_features: 0,
            feature_importances: None,
            is_classification: self.is_classification,
            classes: Vec::new(),
        }
    }
}

/// Borrowed training data shared by the recursive builder
struct BuildContext<'a> {
    x: &'a Array2<f64>,
    y: &'a Array1<f64>,
    weights: &'a Array1<f64>,
    labels: &'a [Option<usize>],
    n_classes: usize,
}

impl Estimator for DecisionTree {
    fn name(&self) -> &str {
        if self.is_classification {
            "DecisionTreeClassifier"
        } else {
            "DecisionTreeRegressor"
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

    fn fit(&mut self, x: &Array2<f64>, y: &Array1<f64>, sample_weight: Option<&Array1<f64>>) -> Result<()> {
        let classes = if self.is_classification { unique_classes(y) } else { Vec::new() };
        self.fit_with_classes(x, y, sample_weight, classes)
    }

    fn predict(&self, x: &Array2<f64>) -> Result<Array1<f64>> {
        let root = self.fitted_root(x)?;
        Ok(x.rows()
            .into_iter()
            .map(|row| match self.leaf_for(root, row) {
                TreeNode::Leaf { value, .. } => *value,
                TreeNode::Split { .. } => 0.0,
            })
            .collect())
    }

    fn predict_proba(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if !self.is_classification {
            return Err(StackingError::capability(self.name(), "predict_proba"));
        }
        let root = self.fitted_root(x)?;
        let mut proba = Array2::zeros((x.nrows(), self.classes.len()));
        for (i, row) in x.rows().into_iter().enumerate() {
            if let TreeNode::Leaf { distribution, .. } = self.leaf_for(root, row) {
                for (k, &p) in distribution.iter().enumerate() {
                    proba[[i, k]] = p;
                }
            }
        }
        Ok(proba)
    }

    fn fresh_copy(&self) -> Box<dyn Estimator> {
        Box::new(self.hyperparameters())
    }

    fn boxed_clone(&self) -> Box<dyn Estimator> {
        Box::new(self.clone())
    }

    fn params(&self) -> Params {
        let optional = |v: Option<usize>| v.map_or(ParamValue::None, |n| ParamValue::Int(n as i64));
        let mut params = Params::new();
        params.insert("criterion".to_string(), ParamValue::Str(self.criterion.as_str().to_string()));
        params.insert("max_depth".to_string(), optional(self.max_depth));
        params.insert("max_features".to_string(), optional(self.max_features));
        params.insert("min_samples_leaf".to_string(), ParamValue::Int(self.min_samples_leaf as i64));
        params.insert("min_samples_split".to_string(), ParamValue::Int(self.min_samples_split as i64));
        params.insert(
            "random_state".to_string(),
            self.random_state.map_or(ParamValue::None, |s| ParamValue::Int(s as i64)),
        );
        params
    }

    fn set_param(&mut self, key: &str, value: &ParamValue) -> Result<()> {
        let optional_usize = |value: &ParamValue| -> Result<Option<usize>> {
            match value {
                ParamValue::None => Ok(None),
                other => other
                    .as_usize()
                    .filter(|n| *n > 0)
                    .map(Some)
                    .ok_or_else(|| invalid_param(key, value, "must be a positive integer or None")),
            }
        };
        match key {
            "max_depth" => self.max_depth = optional_usize(value)?,
            "max_features" => self.max_features = optional_usize(value)?,
            "random_state" => self.random_state = optional_usize(value)?.map(|s| s as u64),
            "min_samples_split" => {
                self.min_samples_split = value
                    .as_usize()
                    .filter(|n| *n >= 2)
                    .ok_or_else(|| invalid_param(key, value, "must be an integer >= 2"))?;
            }
            "min_samples_leaf" => {
                self.min_samples_leaf = value
                    .as_usize()
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| invalid_param(key, value, "must be an integer >= 1"))?;
            }
            "criterion" => {
                self.criterion = match (value.as_str(), self.is_classification) {
                    (Some("gini"), true) => Criterion::Gini,
                    (Some("entropy"), true) => Criterion::Entropy,
                    (Some("mse"), false) => Criterion::MSE,
                    _ => return Err(invalid_param(key, value, "unsupported criterion for this task")),
                };
            }
            _ => return Err(unknown_param(self.name(), key, value)),
        }
        Ok(())
    }
}
