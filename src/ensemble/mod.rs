//! Ensemble methods module
//!
//! Provides stacked generalization:
//! - Response method resolution per base estimator
//! - Out-of-fold prediction over cross-validation splits
//! - Second-level feature assembly
//! - [`StackingClassifier`] and [`StackingRegressor`]

mod concat;
mod out_of_fold;
mod response;
mod slot;
mod stacking;

pub use concat::concatenate;
pub use out_of_fold::{check_coverage, predict_out_of_fold};
pub use response::{resolve, resolve_all, MethodRequest, PredictMethod, ResponseMethod};
pub use slot::EstimatorSlot;
pub use stacking::{CvPolicy, StackingClassifier, StackingConfig, StackingCore, StackingRegressor};
