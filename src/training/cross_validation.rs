//! Cross-validation implementations

use crate::error::{Result, StackingError};
use ndarray::Array1;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Cross-validation strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CVStrategy {
    /// K-Fold cross-validation
    KFold { n_splits: usize, shuffle: bool },
    /// Stratified K-Fold (maintains class distribution)
    StratifiedKFold { n_splits: usize, shuffle: bool },
    /// Leave-one-out cross-validation
    LeaveOneOut,
    /// Group K-Fold (keeps groups together)
    GroupKFold { n_splits: usize },
}

impl Default for CVStrategy {
    fn default() -> Self {
        CVStrategy::KFold { n_splits: 5, shuffle: true }
    }
}

/// A single train/test split
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CVSplit {
    pub train_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
    pub fold_idx: usize,
}

impl CVSplit {
    pub fn new(train_indices: Vec<usize>, test_indices: Vec<usize>, fold_idx: usize) -> Self {
        Self {
            train_indices,
            test_indices,
            fold_idx,
        }
    }
}

/// Cross-validation splitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossValidator {
    strategy: CVStrategy,
    random_state: Option<u64>,
}

impl CrossValidator {
    /// Create a new cross-validator
    pub fn new(strategy: CVStrategy) -> Self {
        Self {
            strategy,
            random_state: None,
        }
    }

    /// Set random state for reproducibility
    pub fn with_random_state(mut self, seed: u64) -> Self {
        self.random_state = Some(seed);
        self
    }

    pub fn strategy(&self) -> &CVStrategy {
        &self.strategy
    }

    pub fn random_state(&self) -> Option<u64> {
        self.random_state
    }

    /// Whether the strategy draws random numbers at all
    pub fn is_randomized(&self) -> bool {
        matches!(
            self.strategy,
            CVStrategy::KFold { shuffle: true, .. }
                | CVStrategy::StratifiedKFold { shuffle: true, .. }
        )
    }

    /// Whether the split needs a group label per sample
    pub fn needs_groups(&self) -> bool {
        matches!(self.strategy, CVStrategy::GroupKFold { .. })
    }

    /// Generate train/test splits
    pub fn split(&self, n_samples: usize, y: Option<&Array1<f64>>, groups: Option<&Array1<i64>>) -> Result<Vec<CVSplit>> {
        match &self.strategy {
            CVStrategy::KFold { n_splits, shuffle } => {
                self.k_fold_split(n_samples, *n_splits, *shuffle)
            }
            CVStrategy::StratifiedKFold { n_splits, shuffle } => {
                let y = y.ok_or_else(|| StackingError::ConfigError(
                    "StratifiedKFold requires target array".to_string()
                ))?;
                self.stratified_k_fold_split(n_samples, y, *n_splits, *shuffle)
            }
            CVStrategy::LeaveOneOut => {
                self.leave_one_out_split(n_samples)
            }
            CVStrategy::GroupKFold { n_splits } => {
                let groups = groups.ok_or_else(|| StackingError::ConfigError(
                    "GroupKFold requires groups array".to_string()
                ))?;
                self.group_k_fold_split(n_samples, groups, *n_splits)
            }
        }
    }

    fn rng(&self) -> ChaCha8Rng {
        match self.random_state {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        }
    }

    fn check_n_splits(n_samples: usize, n_splits: usize) -> Result<()> {
        if n_splits < 2 {
            return Err(StackingError::ConfigError(
                "n_splits must be at least 2".to_string()
            ));
        }
        if n_samples < n_splits {
            return Err(StackingError::ConfigError(
                format!("n_samples ({}) must be >= n_splits ({})", n_samples, n_splits)
            ));
        }
        Ok(())
    }

    fn k_fold_split(&self, n_samples: usize, n_splits: usize, shuffle: bool) -> Result<Vec<CVSplit>> {
        Self::check_n_splits(n_samples, n_splits)?;

        let mut indices: Vec<usize> = (0..n_samples).collect();

        if shuffle {
            indices.shuffle(&mut self.rng());
        }

        let fold_sizes: Vec<usize> = (0..n_splits)
            .map(|i| {
                let base = n_samples / n_splits;
                let remainder = n_samples % n_splits;
                if i < remainder { base + 1 } else { base }
            })
            .collect();

        let mut splits = Vec::with_capacity(n_splits);
        let mut current = 0;

        for (fold_idx, &fold_size) in fold_sizes.iter().enumerate() {
            let test_indices: Vec<usize> = indices[current..current + fold_size].to_vec();
            let train_indices: Vec<usize> = indices[..current]
                .iter()
                .chain(indices[current + fold_size..].iter())
                .copied()
                .collect();

            splits.push(CVSplit::new(train_indices, test_indices, fold_idx));
            current += fold_size;
        }

        Ok(splits)
    }

    /// Classes are visited in sorted order and dealt round-robin, each class
    /// starting where the previous one stopped so fold sizes stay balanced.
    fn stratified_k_fold_split(
        &self,
        n_samples: usize,
        y: &Array1<f64>,
        n_splits: usize,
        shuffle: bool,
    ) -> Result<Vec<CVSplit>> {
        Self::check_n_splits(n_samples, n_splits)?;
        if y.len() != n_samples {
            return Err(StackingError::ShapeError {
                expected: format!("y length = {}", n_samples),
                actual: format!("y length = {}", y.len()),
            });
        }

        // Group samples by class
        let mut class_indices: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
        for (idx, &val) in y.iter().enumerate() {
            let class = val.round() as i64;
            class_indices.entry(class).or_default().push(idx);
        }

        if let Some(smallest) = class_indices.values().map(Vec::len).min() {
            if smallest < n_splits {
                warn!(
                    smallest_class = smallest,
                    n_splits,
                    "least populated class has fewer members than n_splits"
                );
            }
        }

        // Shuffle within each class if needed
        if shuffle {
            let mut rng = self.rng();
            for indices in class_indices.values_mut() {
                indices.shuffle(&mut rng);
            }
        }

        let mut folds: Vec<Vec<usize>> = vec![Vec::new(); n_splits];
        let mut offset = 0;
        for indices in class_indices.values() {
            for (i, &idx) in indices.iter().enumerate() {
                folds[(offset + i) % n_splits].push(idx);
            }
            offset = (offset + indices.len()) % n_splits;
        }

        let mut splits = Vec::with_capacity(n_splits);
        for (fold_idx, fold) in folds.iter().enumerate() {
            let mut test_indices = fold.clone();
            test_indices.sort_unstable();
            let mut train_indices: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != fold_idx)
                .flat_map(|(_, f)| f.iter().copied())
                .collect();
            train_indices.sort_unstable();

            splits.push(CVSplit::new(train_indices, test_indices, fold_idx));
        }

        Ok(splits)
    }

    fn leave_one_out_split(&self, n_samples: usize) -> Result<Vec<CVSplit>> {
        Self::check_n_splits(n_samples, 2)?;
        let splits: Vec<CVSplit> = (0..n_samples)
            .map(|i| {
                let train_indices: Vec<usize> = (0..n_samples).filter(|&j| j != i).collect();
                CVSplit::new(train_indices, vec![i], i)
            })
            .collect();

        Ok(splits)
    }

    fn group_k_fold_split(
        &self,
        n_samples: usize,
        groups: &Array1<i64>,
        n_splits: usize,
    ) -> Result<Vec<CVSplit>> {
        if groups.len() != n_samples {
            return Err(StackingError::ShapeError {
                expected: format!("groups length = {}", n_samples),
                actual: format!("groups length = {}", groups.len()),
            });
        }

        let mut unique_groups: Vec<i64> = groups.iter().copied().collect();
        unique_groups.sort_unstable();
        unique_groups.dedup();

        if unique_groups.len() < n_splits {
            return Err(StackingError::ConfigError(
                format!("Number of groups ({}) must be >= n_splits ({})", unique_groups.len(), n_splits)
            ));
        }

        let group_to_fold: BTreeMap<i64, usize> = unique_groups
            .iter()
            .enumerate()
            .map(|(i, &group)| (group, i % n_splits))
            .collect();

        let mut splits = Vec::with_capacity(n_splits);
        for fold_idx in 0..n_splits {
            let (test_indices, train_indices): (Vec<usize>, Vec<usize>) = (0..n_samples)
                .partition(|&i| group_to_fold.get(&groups[i]) == Some(&fold_idx));

            splits.push(CVSplit::new(train_indices, test_indices, fold_idx));
        }

        Ok(splits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_k_fold() {
        let cv = CrossValidator::new(CVStrategy::KFold { n_splits: 5, shuffle: false });
        let splits = cv.split(100, None, None).unwrap();

        assert_eq!(splits.len(), 5);

        // Each test set should have 20 samples
        for split in &splits {
            assert_eq!(split.test_indices.len(), 20);
            assert_eq!(split.train_indices.len(), 80);
        }

        // All indices should be covered exactly once in test sets
        let mut all_test: Vec<usize> = splits.iter().flat_map(|s| s.test_indices.clone()).collect();
        all_test.sort();
        assert_eq!(all_test, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_k_fold_uneven() {
        let cv = CrossValidator::new(CVStrategy::KFold { n_splits: 3, shuffle: false });
        let splits = cv.split(10, None, None).unwrap();
        let sizes: Vec<usize> = splits.iter().map(|s| s.test_indices.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(splits[0].test_indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_k_fold_rejects_bad_n_splits() {
        let cv = CrossValidator::new(CVStrategy::KFold { n_splits: 1, shuffle: false });
        assert!(cv.split(10, None, None).unwrap_err().is_config_error());

        let cv = CrossValidator::new(CVStrategy::KFold { n_splits: 5, shuffle: false });
        assert!(cv.split(3, None, None).is_err());
    }

    #[test]
    fn test_shuffled_k_fold_is_seeded() {
        let cv = CrossValidator::new(CVStrategy::KFold { n_splits: 4, shuffle: true })
            .with_random_state(7);
        assert_eq!(cv.split(40, None, None).unwrap(), cv.split(40, None, None).unwrap());
        assert!(cv.is_randomized());
        assert_eq!(cv.random_state(), Some(7));
    }

    #[test]
    fn test_stratified_k_fold() {
        let y = Array1::from_vec(vec![
            0.0, 0.0, 0.0, 0.0, 0.0,  // 5 samples of class 0
            1.0, 1.0, 1.0, 1.0, 1.0,  // 5 samples of class 1
        ]);

        let cv = CrossValidator::new(CVStrategy::StratifiedKFold { n_splits: 5, shuffle: false });
        let splits = cv.split(10, Some(&y), None).unwrap();

        assert_eq!(splits.len(), 5);

        // Each fold should have 1 sample from each class
        for split in &splits {
            assert_eq!(split.test_indices.len(), 2);
            let ones = split.test_indices.iter().filter(|&&i| y[i] == 1.0).count();
            assert_eq!(ones, 1);
        }
    }

    #[test]
    fn test_stratified_k_fold_balances_odd_classes() {
        // 3 + 3 samples over 2 folds; naive dealing would give sizes 4/2
        let y = Array1::from_vec(vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let cv = CrossValidator::new(CVStrategy::StratifiedKFold { n_splits: 2, shuffle: false });
        let splits = cv.split(6, Some(&y), None).unwrap();
        assert_eq!(splits[0].test_indices.len(), 3);
        assert_eq!(splits[1].test_indices.len(), 3);
    }

    #[test]
    fn test_stratified_requires_target() {
        let cv = CrossValidator::new(CVStrategy::StratifiedKFold { n_splits: 2, shuffle: false });
        assert!(cv.split(10, None, None).is_err());
    }

    #[test]
    fn test_leave_one_out() {
        let cv = CrossValidator::new(CVStrategy::LeaveOneOut);
        let splits = cv.split(10, None, None).unwrap();

        assert_eq!(splits.len(), 10);

        for split in &splits {
            assert_eq!(split.test_indices.len(), 1);
            assert_eq!(split.train_indices.len(), 9);
        }
    }

    #[test]
    fn test_group_k_fold() {
        let groups = Array1::from_vec(vec![1, 1, 2, 2, 3, 3]);
        let cv = CrossValidator::new(CVStrategy::GroupKFold { n_splits: 3 });
        let splits = cv.split(6, None, Some(&groups)).unwrap();

        assert_eq!(splits.len(), 3);
        for split in &splits {
            assert_eq!(split.test_indices.len(), 2);
            assert_eq!(groups[split.test_indices[0]], groups[split.test_indices[1]]);
        }
    }
}
