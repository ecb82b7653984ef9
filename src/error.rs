//! Error types for the stacking toolkit

use thiserror::Error;

/// Result type alias for stacking operations
pub type Result<T> = std::result::Result<T, StackingError>;

/// Main error type for estimators and meta-estimators
#[derive(Error, Debug)]
pub enum StackingError {
    /// Misconfiguration detected before any fitting work starts
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}, {reason}")]
    InvalidParameter {
        name: String,
        value: String,
        reason: String,
    },

    /// An estimator lacks a method or fit option that was asked of it
    #[error("Estimator '{estimator}' does not support {capability}")]
    CapabilityError {
        estimator: String,
        capability: String,
    },

    #[error("Model not fitted")]
    ModelNotFitted,

    #[error("Invalid shape: expected {expected}, got {actual}")]
    ShapeError { expected: String, actual: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Training error: {0}")]
    TrainingError(String),

    #[error("Computation error: {0}")]
    ComputationError(String),

    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl StackingError {
    /// Shorthand for a capability failure on a named estimator
    pub fn capability(estimator: impl Into<String>, capability: impl Into<String>) -> Self {
        StackingError::CapabilityError {
            estimator: estimator.into(),
            capability: capability.into(),
        }
    }

    /// Whether the error was raised by eager validation rather than by an estimator
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            StackingError::ConfigError(_) | StackingError::InvalidParameter { .. }
        )
    }
}

impl From<serde_json::Error> for StackingError {
    fn from(err: serde_json::Error) -> Self {
        StackingError::SerializationError(err.to_string())
    }
}

impl From<ndarray::ShapeError> for StackingError {
    fn from(err: ndarray::ShapeError) -> Self {
        StackingError::ShapeError {
            expected: "valid shape".to_string(),
            actual: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StackingError::ConfigError("no estimators".to_string());
        assert_eq!(err.to_string(), "Configuration error: no estimators");

        let err = StackingError::capability("svc", "predict_proba");
        assert_eq!(err.to_string(), "Estimator 'svc' does not support predict_proba");
    }

    #[test]
    fn test_error_from_shape() {
        let shape_err = ndarray::Array2::<f64>::from_shape_vec((2, 2), vec![1.0]).unwrap_err();
        let err: StackingError = shape_err.into();
        assert!(matches!(err, StackingError::ShapeError { .. }));
        assert!(!err.is_config_error());
    }
}
