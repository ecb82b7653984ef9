//! Model training module
//!
//! Provides the [`Estimator`] protocol and the learners that implement it:
//! - Linear models (OLS, Ridge, Logistic)
//! - Linear Support Vector Machines
//! - Decision trees and Random Forests
//! - Dummy baselines
//!
//! plus the cross-validation splitters used to build out-of-fold predictions.

mod models;
pub mod cross_validation;
pub mod decision_tree;
pub mod dummy;
pub mod linear_models;
pub mod random_forest;
pub mod svm;

pub use models::{
    accuracy_score, check_fit_input, check_n_features, class_index, invalid_param,
    is_discrete_target, normalized_weights, r2_score, reject_sample_weight, unique_classes,
    unknown_param, Capabilities, Estimator, EstimatorKind, ParamValue, Params, PredictOutput,
    PredictParams, Prediction,
};
pub use cross_validation::{CrossValidator, CVStrategy, CVSplit};
pub use decision_tree::{Criterion, DecisionTree, TreeNode};
pub use dummy::{ClassifierStrategy, DummyClassifier, DummyRegressor, RegressorStrategy};
pub use linear_models::{LinearRegression, LogisticRegression, RidgeRegression};
pub use random_forest::{MaxFeatures, RandomForest};
pub use svm::{LinearSvc, LinearSvr, SVMConfig};
