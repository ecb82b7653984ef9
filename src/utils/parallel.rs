//! Parallel processing utilities

use crate::error::{Result, StackingError};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration for parallel processing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Number of worker threads (None = rayon's global pool)
    pub n_jobs: Option<usize>,
    /// Verbosity; anything above zero logs dispatched batches
    pub verbose: u8,
}

impl ParallelConfig {
    /// Create a new parallel configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set number of worker threads
    pub fn with_n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = Some(n_jobs);
        self
    }

    pub fn with_verbose(mut self, verbose: u8) -> Self {
        self.verbose = verbose;
        self
    }

    /// Get the number of threads to use
    pub fn num_threads(&self) -> usize {
        self.n_jobs.unwrap_or_else(rayon::current_num_threads)
    }
}

/// Ordered, fallible parallel map over independent tasks
///
/// Results come back in submission order. The first error observed is
/// returned and the remaining results are discarded.
#[derive(Debug, Clone, Default)]
pub struct ParallelBackend {
    config: ParallelConfig,
}

impl ParallelBackend {
    pub fn new(config: ParallelConfig) -> Self {
        Self { config }
    }

    /// Backend that runs everything on the calling thread
    pub fn sequential() -> Self {
        Self::new(ParallelConfig::new().with_n_jobs(1))
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Backend for work dispatched from inside this backend's tasks.
    /// It runs on whatever pool the calling task already occupies.
    pub fn nested(&self) -> Self {
        let n_jobs = match self.config.n_jobs {
            Some(1) => Some(1),
            _ => None,
        };
        Self::new(ParallelConfig {
            n_jobs,
            verbose: self.config.verbose,
        })
    }

    pub fn map<T, U, F>(&self, label: &str, items: Vec<T>, f: F) -> Result<Vec<U>>
    where
        T: Send,
        U: Send,
        F: Fn(T) -> Result<U> + Send + Sync,
    {
        let n_tasks = items.len();
        if self.config.verbose > 0 {
            debug!(
                phase = label,
                n_tasks,
                n_jobs = self.config.num_threads(),
                "dispatching parallel batch"
            );
        }

        if self.config.n_jobs == Some(1) || n_tasks <= 1 {
            return items.into_iter().map(f).collect();
        }

        match self.config.n_jobs {
            None => items.into_par_iter().map(f).collect(),
            Some(n_threads) => {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n_threads)
                    .build()
                    .map_err(|e| StackingError::ThreadPoolError(e.to_string()))?;
                pool.install(|| items.into_par_iter().map(f).collect())
            }
        }
    }
}
