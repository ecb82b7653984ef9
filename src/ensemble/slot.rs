//! Named entries of a meta-estimator's estimator list

use crate::training::Estimator;

/// An estimator position that is either filled or explicitly dropped
#[derive(Debug, Clone)]
pub enum EstimatorSlot {
    Present(Box<dyn Estimator>),
    /// Omitted from fitting; contributes no columns
    Dropped,
}

impl EstimatorSlot {
    pub fn present<E: Estimator + 'static>(estimator: E) -> Self {
        EstimatorSlot::Present(Box::new(estimator))
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, EstimatorSlot::Dropped)
    }

    pub fn estimator(&self) -> Option<&dyn Estimator> {
        match self {
            EstimatorSlot::Present(est) => Some(est.as_ref()),
            EstimatorSlot::Dropped => None,
        }
    }

    pub fn estimator_mut(&mut self) -> Option<&mut (dyn Estimator + 'static)> {
        match self {
            EstimatorSlot::Present(est) => Some(est.as_mut()),
            EstimatorSlot::Dropped => None,
        }
    }
}

impl From<Box<dyn Estimator>> for EstimatorSlot {
    fn from(estimator: Box<dyn Estimator>) -> Self {
        EstimatorSlot::Present(estimator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::DummyRegressor;

    #[test]
    fn test_slot_accessors() {
        let slot = EstimatorSlot::present(DummyRegressor::default());
        assert!(!slot.is_dropped());
        assert_eq!(slot.estimator().map(|e| e.name()), Some("DummyRegressor"));

        let dropped = EstimatorSlot::Dropped;
        assert!(dropped.is_dropped());
        assert!(dropped.estimator().is_none());
    }
}
