/*!
# Collaborator traits

The sampler consumes three capabilities from the outside world:

- [`ObjectiveEvaluator`]: the cost (`-2 ln L`) of a parameter vector,
- [`RandomSource`]: a random stream that can derive independent sub-streams,
- [`InitialEnsembleSampler`]: the starting positions of the walkers.

This module also provides the stock implementations [`SeededStream`],
[`GaussianBall`], [`UniformBox`] and [`FixedPositions`].
*/

use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, Normal, Uniform};

use crate::ensemble::WalkerEnsembleState;
use crate::error::{EnsembleError, ObjectiveError};

/**
An objective function returning `-2 ln L` for a vector of free parameters.

Evaluation takes `&mut self`: an objective may keep scratch buffers that are not safe
to share. The evaluation pool therefore gives every worker thread its own clone, which
is why implementors must be `Clone + Send`.

# Examples

```rust
use esmcmc::core::ObjectiveEvaluator;
use esmcmc::error::ObjectiveError;

#[derive(Clone)]
struct UnitBall;

impl ObjectiveEvaluator for UnitBall {
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
        let r2: f64 = theta.iter().map(|x| x * x).sum();
        if r2 > 1.0 {
            return Err(ObjectiveError::Domain);
        }
        Ok(r2)
    }
}

let mut objective = UnitBall;
assert_eq!(objective.evaluate(&[0.5, 0.0]), Ok(0.25));
assert_eq!(objective.evaluate(&[2.0, 0.0]), Err(ObjectiveError::Domain));
```
*/
pub trait ObjectiveEvaluator: Clone + Send {
    /// Returns the cost at `theta`, or why it could not be computed.
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError>;

    /// Names of the extra values stored next to every catalog row.
    fn diagnostic_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Extra values at `theta`, one per entry of [`diagnostic_names`](Self::diagnostic_names).
    /// Only called for positions whose cost evaluated successfully.
    fn diagnostics(&mut self, _theta: &[f64]) -> Result<Vec<f64>, ObjectiveError> {
        Ok(Vec::new())
    }
}

/// A random number stream that can derive deterministic, independent sub-streams.
pub trait RandomSource: RngCore + Send + Sized {
    /// Derives the sub-stream with the given index. The same index always yields the
    /// same stream; different indices yield independent streams.
    fn sub_stream(&self, index: u64) -> Self;
}

/// Seeds the starting positions of the walkers, e.g. by drawing from a prior.
pub trait InitialEnsembleSampler: Send {
    fn sample(
        &mut self,
        n_walkers: usize,
        n_params: usize,
    ) -> Result<WalkerEnsembleState, EnsembleError>;
}

/// SplitMix64 finalizer, used to spread `(seed, index)` pairs over the seed space.
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/**
A [`SmallRng`] that remembers its seed so that sub-streams can be derived from it.

```rust
use esmcmc::core::{RandomSource, SeededStream};
use rand::Rng;

let root = SeededStream::new(42);
let mut a = root.sub_stream(3);
let mut b = root.sub_stream(3);
assert_eq!(a.gen::<u64>(), b.gen::<u64>());
```
*/
#[derive(Debug, Clone)]
pub struct SeededStream {
    seed: u64,
    rng: SmallRng,
}

impl SeededStream {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// A stream seeded from the operating system's entropy source.
    pub fn from_entropy() -> Self {
        Self::new(rand::thread_rng().next_u64())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RngCore for SeededStream {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.rng.try_fill_bytes(dest)
    }
}

impl RandomSource for SeededStream {
    fn sub_stream(&self, index: u64) -> Self {
        Self::new(mix64(mix64(self.seed) ^ index))
    }
}

fn check_len(what: &str, len: usize, n_params: usize) -> Result<(), EnsembleError> {
    if len != n_params {
        return Err(EnsembleError::InvariantViolation(format!(
            "{what} has {len} entries but the ensemble has {n_params} parameters"
        )));
    }
    Ok(())
}

/**
Draws every walker from an axis-aligned Gaussian around `center`.

```rust
use esmcmc::core::{GaussianBall, InitialEnsembleSampler};

let mut ball = GaussianBall::new(vec![1.0, -1.0], vec![0.1, 0.1]).set_seed(7);
let state = ball.sample(8, 2).unwrap();
assert_eq!(state.n_walkers(), 8);
```
*/
#[derive(Debug, Clone)]
pub struct GaussianBall {
    pub center: Vec<f64>,
    pub sigma: Vec<f64>,
    rng: SmallRng,
}

impl GaussianBall {
    pub fn new(center: Vec<f64>, sigma: Vec<f64>) -> Self {
        Self {
            center,
            sigma,
            rng: SmallRng::from_entropy(),
        }
    }

    /// A ball with the same width along every axis.
    pub fn isotropic(center: Vec<f64>, sigma: f64) -> Self {
        let sigma = vec![sigma; center.len()];
        Self::new(center, sigma)
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

impl InitialEnsembleSampler for GaussianBall {
    fn sample(
        &mut self,
        n_walkers: usize,
        n_params: usize,
    ) -> Result<WalkerEnsembleState, EnsembleError> {
        check_len("the ball center", self.center.len(), n_params)?;
        check_len("the ball width", self.sigma.len(), n_params)?;
        let normals = self
            .center
            .iter()
            .zip(&self.sigma)
            .map(|(&mu, &sigma)| {
                Normal::new(mu, sigma).map_err(|e| {
                    EnsembleError::InvariantViolation(format!("bad ball width {sigma}: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let positions = (0..n_walkers)
            .map(|_| normals.iter().map(|n| n.sample(&mut self.rng)).collect())
            .collect();
        WalkerEnsembleState::from_positions(positions)
    }
}

/// Draws every walker uniformly from the box `[lower, upper)`.
#[derive(Debug, Clone)]
pub struct UniformBox {
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    rng: SmallRng,
}

impl UniformBox {
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Self {
        Self {
            lower,
            upper,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

impl InitialEnsembleSampler for UniformBox {
    fn sample(
        &mut self,
        n_walkers: usize,
        n_params: usize,
    ) -> Result<WalkerEnsembleState, EnsembleError> {
        check_len("the lower bound", self.lower.len(), n_params)?;
        check_len("the upper bound", self.upper.len(), n_params)?;
        let uniforms = self
            .lower
            .iter()
            .zip(&self.upper)
            .map(|(&lo, &hi)| {
                // Uniform::new panics on an empty or non-finite range.
                if lo.is_finite() && hi.is_finite() && lo < hi {
                    Ok(Uniform::new(lo, hi))
                } else {
                    Err(EnsembleError::InvariantViolation(format!(
                        "empty sampling box [{lo}, {hi})"
                    )))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        let positions = (0..n_walkers)
            .map(|_| uniforms.iter().map(|u| u.sample(&mut self.rng)).collect())
            .collect();
        WalkerEnsembleState::from_positions(positions)
    }
}

/// Uses a fixed list of starting positions, one per walker.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedPositions(pub Vec<Vec<f64>>);

impl InitialEnsembleSampler for FixedPositions {
    fn sample(
        &mut self,
        n_walkers: usize,
        n_params: usize,
    ) -> Result<WalkerEnsembleState, EnsembleError> {
        if self.0.len() != n_walkers {
            return Err(EnsembleError::InvariantViolation(format!(
                "{} fixed positions given for {n_walkers} walkers",
                self.0.len()
            )));
        }
        for position in &self.0 {
            check_len("a fixed position", position.len(), n_params)?;
        }
        WalkerEnsembleState::from_positions(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn sub_streams_are_deterministic_and_distinct() {
        let root = SeededStream::new(42);
        let draw = |mut s: SeededStream| (0..4).map(|_| s.gen::<u64>()).collect::<Vec<_>>();
        assert_eq!(draw(root.sub_stream(0)), draw(root.sub_stream(0)));
        assert_ne!(draw(root.sub_stream(0)), draw(root.sub_stream(1)));
        assert_ne!(
            draw(root.sub_stream(5)),
            draw(SeededStream::new(43).sub_stream(5))
        );
    }

    #[test]
    fn sub_stream_does_not_depend_on_parent_position() {
        let mut root = SeededStream::new(1);
        let before = root.sub_stream(9).gen::<u64>();
        let _ = root.gen::<u64>();
        assert_eq!(root.sub_stream(9).gen::<u64>(), before);
    }

    #[test]
    fn gaussian_ball_is_reproducible() {
        let a = GaussianBall::isotropic(vec![0.0; 3], 1.0)
            .set_seed(3)
            .sample(6, 3)
            .unwrap();
        let b = GaussianBall::isotropic(vec![0.0; 3], 1.0)
            .set_seed(3)
            .sample(6, 3)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gaussian_ball_checks_dimensions() {
        let mut ball = GaussianBall::isotropic(vec![0.0; 2], 1.0);
        assert!(ball.sample(4, 3).is_err());
        let mut bad = GaussianBall::new(vec![0.0], vec![-1.0]);
        assert!(bad.sample(4, 1).is_err());
    }

    #[test]
    fn uniform_box_stays_inside_bounds() {
        let mut sampler = UniformBox::new(vec![-1.0, 2.0], vec![1.0, 3.0]).set_seed(11);
        let state = sampler.sample(10, 2).unwrap();
        for walker in state.walkers() {
            assert!((-1.0..1.0).contains(&walker.theta[0]));
            assert!((2.0..3.0).contains(&walker.theta[1]));
        }
    }

    #[test]
    fn uniform_box_rejects_empty_box() {
        let mut sampler = UniformBox::new(vec![1.0], vec![1.0]);
        assert!(matches!(
            sampler.sample(2, 1),
            Err(EnsembleError::InvariantViolation(_))
        ));
    }

    #[test]
    fn fixed_positions_must_match_the_ensemble() {
        let mut fixed = FixedPositions(vec![vec![0.0], vec![1.0]]);
        assert!(fixed.sample(2, 1).is_ok());
        assert!(fixed.sample(4, 1).is_err());
        assert!(fixed.sample(2, 2).is_err());
    }
}
