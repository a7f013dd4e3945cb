/*!
# Parallel evaluation pool

A fixed-size pool of worker threads that evaluates batches of proposals. Objectives
are not assumed to be reentrant, so every worker owns a private clone of the
objective. The clones are made once when the pool is built and reused for every
batch.

[`ParallelEvaluationPool::evaluate_batch`] is a barrier: it returns once every
proposal of the batch has been evaluated, with one result per proposal in input order.
*/

use parking_lot::Mutex;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::core::ObjectiveEvaluator;
use crate::error::{EnsembleError, ObjectiveError};
use crate::moves::ProposalRecord;

/// A successful evaluation of one position.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub cost: f64,
    pub extra: Vec<f64>,
}

/// Number of workers used when the caller does not choose one.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub struct ParallelEvaluationPool<O> {
    pool: ThreadPool,
    /// One objective per worker, indexed by the worker's rayon thread index.
    contexts: Vec<Mutex<O>>,
}

impl<O: ObjectiveEvaluator> ParallelEvaluationPool<O> {
    /**
    Builds a pool of `pool_size` workers, each with its own clone of `objective`.
    A `pool_size` of zero selects [`default_pool_size`].

    ```rust
    use esmcmc::distributions::Quadratic;
    use esmcmc::pool::ParallelEvaluationPool;

    let pool = ParallelEvaluationPool::new(Quadratic::new(1.0), 2).unwrap();
    let costs = pool.evaluate_points(&[vec![1.0, 1.0], vec![0.0, 3.0]]);
    assert_eq!(costs[0].as_ref().unwrap().cost, 2.0);
    assert_eq!(costs[1].as_ref().unwrap().cost, 9.0);
    ```
    */
    pub fn new(objective: O, pool_size: usize) -> Result<Self, EnsembleError> {
        let pool_size = if pool_size == 0 {
            default_pool_size()
        } else {
            pool_size
        };
        let pool = ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("esmcmc-worker-{i}"))
            .build()?;
        let contexts = (0..pool_size)
            .map(|_| Mutex::new(objective.clone()))
            .collect();
        log::debug!("evaluation pool started with {pool_size} workers");
        Ok(Self { pool, contexts })
    }

    pub fn pool_size(&self) -> usize {
        self.contexts.len()
    }

    /// Diagnostic names reported by the objective.
    pub fn diagnostic_names(&self) -> Vec<String> {
        self.contexts[0].lock().diagnostic_names()
    }

    /// Evaluates the candidates of `proposals` in parallel, preserving order.
    pub fn evaluate_batch(
        &self,
        proposals: &[ProposalRecord],
    ) -> Vec<Result<Evaluation, ObjectiveError>> {
        self.pool.install(|| {
            proposals
                .par_iter()
                .map(|p| self.evaluate_on_worker(&p.candidate))
                .collect()
        })
    }

    /// Evaluates arbitrary positions in parallel, preserving order.
    pub fn evaluate_points<T>(&self, points: &[T]) -> Vec<Result<Evaluation, ObjectiveError>>
    where
        T: AsRef<[f64]> + Sync,
    {
        self.pool.install(|| {
            points
                .par_iter()
                .map(|p| self.evaluate_on_worker(p.as_ref()))
                .collect()
        })
    }

    fn evaluate_on_worker(&self, theta: &[f64]) -> Result<Evaluation, ObjectiveError> {
        // Inside `install` every task runs on one of our own workers, so the slot is
        // private to the current thread and the lock is never contended.
        let slot = rayon::current_thread_index().unwrap_or(0) % self.contexts.len();
        let mut objective = self.contexts[slot].lock();

        let cost = objective.evaluate(theta)?;
        if cost.is_nan() {
            return Err(ObjectiveError::Domain);
        }
        let extra = objective.diagnostics(theta)?;
        Ok(Evaluation { cost, extra })
    }
}
