//! Stacking ensembles for ndarray-based estimators
//!
//! This crate provides stacked generalization: several base estimators are
//! fitted, their out-of-fold predictions become the input of a final
//! estimator, and at prediction time the full-data fitted base estimators
//! feed that final estimator.
//!
//! # Modules
//!
//! - [`training`] - The [`Estimator`](training::Estimator) protocol, reference learners and
//!   cross-validation splitters
//! - [`ensemble`] - Stacking classifier and regressor
//! - [`utils`] - Parallel execution backend
//! - [`error`] - Error type shared by every module
//!
//! # Example
//!
//! ```no_run
//! use stacking::prelude::*;
//! use ndarray::array;
//!
//! let x = array![[0.0, 0.1], [0.2, 0.0], [0.1, 0.3], [3.0, 3.1], [3.2, 3.0], [3.1, 3.3]];
//! let y = array![0.0, 0.0, 0.0, 1.0, 1.0, 1.0];
//!
//! let mut clf = StackingClassifier::new(StackingConfig::default())
//!     .add_estimator("svc", LinearSvc::default())
//!     .add_estimator("forest", RandomForest::new_classifier(10))
//!     .with_final_estimator(LogisticRegression::new());
//! clf.fit(&x, &y, None)?;
//! let labels = clf.predict(&x)?;
//! # Ok::<(), StackingError>(())
//! ```

pub mod error;
pub mod ensemble;
pub mod training;
pub mod utils;

pub use error::{Result, StackingError};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::ensemble::{
        CvPolicy, EstimatorSlot, MethodRequest, PredictMethod, ResponseMethod,
        StackingClassifier, StackingConfig, StackingRegressor,
    };
    pub use crate::error::{Result, StackingError};
    pub use crate::training::{
        Capabilities, CrossValidator, CVSplit, CVStrategy, DecisionTree, DummyClassifier,
        DummyRegressor, Estimator, EstimatorKind, LinearRegression, LinearSvc, LinearSvr,
        LogisticRegression, ParamValue, Params, PredictOutput, PredictParams, Prediction,
        RandomForest, RidgeRegression,
    };
    pub use crate::utils::{ParallelBackend, ParallelConfig};
}
