//! Convergence statistics computed from the sample catalog.
//!
//! The *largest relative error* (LRE) estimates how large the Monte-Carlo error of the
//! posterior means is compared to the posterior widths. Every walker's own trajectory
//! is one chain. The lag-1 autocorrelation of each chain is averaged over the walkers
//! into `ρ`, which gives an effective sample size `ESS = n (1 - ρ) / (1 + ρ)` for the
//! `n` stored samples, and the relative error of the mean is
//! `(σ / √ESS) / σ = 1 / √ESS`. The LRE is the maximum over parameters.

use std::collections::VecDeque;

use ndarray::prelude::*;
use ndarray_stats::CorrelationExt;

use crate::catalog::CatalogReadHandle;

/// Lag-1 autocorrelation of `chain`, clamped to `[0, 1)`.
///
/// `None` for fewer than two samples or a constant chain.
pub fn lag_one_autocorrelation(chain: ArrayView1<f64>) -> Option<f64> {
    let n = chain.len();
    if n < 2 {
        return None;
    }
    let mean = chain.mean()?;
    let centered = chain.mapv(|x| x - mean);
    let var = centered.dot(&centered);
    if var.is_nan() || var <= 0.0 {
        return None;
    }
    let lagged = centered.slice(s![..n - 1]).dot(&centered.slice(s![1..]));
    let rho = lagged / var;
    Some(rho.clamp(0.0, 1.0 - f64::EPSILON))
}

/// Effective sample size of a single chain from its lag-1 autocorrelation.
pub fn effective_sample_size(chain: ArrayView1<f64>) -> Option<f64> {
    let rho = lag_one_autocorrelation(chain)?;
    Some(chain.len() as f64 * (1.0 - rho) / (1.0 + rho))
}

/**
Effective sample size of one parameter sampled by a whole ensemble.

`chains` has one column per walker and one row per generation. Walkers whose chain
never moved count as fully correlated. `None` for fewer than two generations or when
no walker moved at all.
*/
pub fn ensemble_effective_sample_size(chains: ArrayView2<f64>) -> Option<f64> {
    let (generations, n_walkers) = chains.dim();
    if generations < 2 || n_walkers == 0 {
        return None;
    }
    let rhos: Vec<Option<f64>> = chains
        .axis_iter(Axis(1))
        .map(lag_one_autocorrelation)
        .collect();
    if rhos.iter().all(Option::is_none) {
        return None;
    }
    let rho = rhos.iter().map(|r| r.unwrap_or(1.0)).sum::<f64>() / n_walkers as f64;
    let rho = rho.clamp(0.0, 1.0 - f64::EPSILON);
    let n = (generations * n_walkers) as f64;
    Some(n * (1.0 - rho) / (1.0 + rho))
}

/// Catalog positions after the first `burn_in` generations, one row per sample.
pub fn samples(view: &CatalogReadHandle, burn_in: u64) -> Array2<f64> {
    let from = burn_in.saturating_mul(view.n_walkers() as u64);
    let range = view.read_range(from, u64::MAX);
    let n_params = view.n_params();
    let mut data = Array2::zeros((range.len(), n_params));
    let mut k = 0;
    range.for_each_ref(|row| {
        data.row_mut(k)
            .assign(&ArrayView1::from(row.theta.as_slice()));
        k += 1;
    });
    data
}

/// Catalog positions after `burn_in` generations, indexed by
/// `(generation, walker, parameter)`. A trailing partial generation is dropped.
pub fn walker_chains(view: &CatalogReadHandle, burn_in: u64) -> Array3<f64> {
    let n_walkers = view.n_walkers();
    let n_params = view.n_params();
    let mut data = samples(view, burn_in);
    let generations = data.nrows() / n_walkers.max(1);
    data = data.slice_move(s![..generations * n_walkers, ..]);
    data.into_shape_with_order((generations, n_walkers, n_params))
        .unwrap_or_else(|_| Array3::zeros((0, n_walkers, n_params)))
}

/**
The largest relative error of the posterior means, ignoring the first `burn_in`
generations.

Returns `+inf` when fewer than two generations remain or some parameter never moved.
*/
pub fn lre(view: &CatalogReadHandle, burn_in: u64) -> f64 {
    lre_of(walker_chains(view, burn_in).view())
}

/// [`lre`] for chains laid out as `(generation, walker, parameter)`.
pub fn lre_of(chains: ArrayView3<f64>) -> f64 {
    if chains.len_of(Axis(2)) == 0 {
        return f64::INFINITY;
    }
    chains
        .axis_iter(Axis(2))
        .map(|parameter| match ensemble_effective_sample_size(parameter) {
            Some(ess) if ess > 0.0 => 1.0 / ess.sqrt(),
            _ => f64::INFINITY,
        })
        .fold(0.0, f64::max)
}

/// Sample mean and covariance of the catalog after `burn_in` generations.
#[derive(Debug, Clone, PartialEq)]
pub struct MeanCovar {
    pub mean: Array1<f64>,
    pub covar: Array2<f64>,
    /// Number of samples the estimate is based on.
    pub n: usize,
}

/// `None` when fewer than two samples remain after burn-in.
pub fn mean_covar(view: &CatalogReadHandle, burn_in: u64) -> Option<MeanCovar> {
    let samples = samples(view, burn_in);
    let n = samples.nrows();
    if n < 2 {
        return None;
    }
    let mean = samples.mean_axis(Axis(0))?;
    // `cov` treats rows as variables and columns as observations.
    let covar = samples.t().cov(1.0).ok()?;
    Some(MeanCovar { mean, covar, n })
}

/**
Rough number of generations needed to bring the LRE from `current` down to `target`.

The Monte-Carlo error shrinks like `1/√n`, so after `generations` generations
about `generations · (current / target)²` are needed in total. `None` when `current`
is not finite.
*/
pub fn lre_required_generations(current: f64, target: f64, generations: u64) -> Option<u64> {
    if !current.is_finite() || target.is_nan() || target <= 0.0 {
        return None;
    }
    if current <= target {
        return Some(generations);
    }
    let needed = generations as f64 * (current / target).powi(2);
    Some(needed.ceil() as u64)
}

/// Acceptance rate over the last `capacity` generations.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceWindow {
    capacity: usize,
    queue: VecDeque<(u64, u64)>,
    accepted: u64,
    proposed: u64,
}

impl AcceptanceWindow {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queue: VecDeque::new(),
            accepted: 0,
            proposed: 0,
        }
    }

    pub fn push(&mut self, accepted: u64, proposed: u64) {
        self.queue.push_back((accepted, proposed));
        self.accepted += accepted;
        self.proposed += proposed;
        if self.queue.len() > self.capacity {
            if let Some((a, p)) = self.queue.pop_front() {
                self.accepted -= a;
                self.proposed -= p;
            }
        }
    }

    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}
