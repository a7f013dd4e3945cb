/*!
# Walker ensemble state

The ensemble is a set of `N` walkers, each holding a position `theta` with `M` free
parameters, the cost (`-2 ln L`) last evaluated at that position, and the extra
diagnostics the objective reported there.

The ensemble is split into two halves, [`Half::Lower`] (`0..N/2`) and
[`Half::Upper`] (`N/2..N`). A walker is always moved using a partner drawn from the
*other* half, which is why `N` must be even.

```rust
use esmcmc::ensemble::{Half, WalkerEnsembleState};

let state = WalkerEnsembleState::from_positions(vec![
    vec![0.0, 1.0],
    vec![1.0, 0.0],
    vec![0.5, 0.5],
    vec![-1.0, 0.0],
])
.unwrap();
assert_eq!(state.n_walkers(), 4);
assert_eq!(Half::of(3, state.n_walkers()), Half::Upper);
assert!(state.walkers()[0].cost.is_none());
```
*/

use std::ops::Range;

use crate::error::EnsembleError;

/// One member of the ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct Walker {
    /// Current position in the space of free parameters.
    pub theta: Vec<f64>,
    /// Cost at `theta`, `None` until the walker's first accepted move.
    pub cost: Option<f64>,
    /// Diagnostics reported by the objective at `theta`.
    pub extra: Vec<f64>,
}

impl Walker {
    pub fn new(theta: Vec<f64>) -> Self {
        Self {
            theta,
            cost: None,
            extra: Vec::new(),
        }
    }

    /// The cost used by the acceptance rule: a walker that was never evaluated
    /// counts as infinitely bad.
    pub fn effective_cost(&self) -> f64 {
        self.cost.unwrap_or(f64::INFINITY)
    }
}

/// The two halves the ensemble is partitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Half {
    Lower,
    Upper,
}

impl Half {
    /// Both halves in update order.
    pub const BOTH: [Half; 2] = [Half::Lower, Half::Upper];

    /// Walker indices that belong to this half.
    pub fn range(self, n_walkers: usize) -> Range<usize> {
        let mid = n_walkers / 2;
        match self {
            Half::Lower => 0..mid,
            Half::Upper => mid..n_walkers,
        }
    }

    pub fn other(self) -> Half {
        match self {
            Half::Lower => Half::Upper,
            Half::Upper => Half::Lower,
        }
    }

    /// The half walker `index` belongs to.
    pub fn of(index: usize, n_walkers: usize) -> Half {
        if index < n_walkers / 2 {
            Half::Lower
        } else {
            Half::Upper
        }
    }
}

/// Positions, costs and diagnostics of all walkers.
#[derive(Debug, Clone, PartialEq)]
pub struct WalkerEnsembleState {
    walkers: Vec<Walker>,
    n_params: usize,
}

impl WalkerEnsembleState {
    /**
    Builds an ensemble from walkers, checking the structural invariants.

    # Errors

    Returns [`EnsembleError::InvariantViolation`] when there are fewer than two walkers,
    an odd number of walkers, zero free parameters, walkers of differing length, or
    non-finite coordinates.
    */
    pub fn new(walkers: Vec<Walker>) -> Result<Self, EnsembleError> {
        let n_walkers = walkers.len();
        if n_walkers < 2 {
            return Err(EnsembleError::InvariantViolation(format!(
                "need at least 2 walkers, got {n_walkers}"
            )));
        }
        if n_walkers % 2 != 0 {
            return Err(EnsembleError::InvariantViolation(format!(
                "the number of walkers must be even, got {n_walkers}"
            )));
        }
        let n_params = walkers[0].theta.len();
        if n_params == 0 {
            return Err(EnsembleError::InvariantViolation(
                "the ensemble has no free parameters".into(),
            ));
        }
        for (i, walker) in walkers.iter().enumerate() {
            if walker.theta.len() != n_params {
                return Err(EnsembleError::InvariantViolation(format!(
                    "walker {i} has {} parameters, expected {n_params}",
                    walker.theta.len()
                )));
            }
            if walker.theta.iter().any(|x| !x.is_finite()) {
                return Err(EnsembleError::InvariantViolation(format!(
                    "walker {i} has a non-finite coordinate: {:?}",
                    walker.theta
                )));
            }
        }
        if n_walkers < 2 * n_params + 2 {
            log::warn!(
                "{n_walkers} walkers for {n_params} parameters; at least {} are recommended",
                2 * n_params + 2
            );
        }
        Ok(Self { walkers, n_params })
    }

    /// Builds an ensemble of unevaluated walkers.
    pub fn from_positions(positions: Vec<Vec<f64>>) -> Result<Self, EnsembleError> {
        Self::new(positions.into_iter().map(Walker::new).collect())
    }

    pub fn n_walkers(&self) -> usize {
        self.walkers.len()
    }

    pub fn n_params(&self) -> usize {
        self.n_params
    }

    pub fn walkers(&self) -> &[Walker] {
        &self.walkers
    }

    pub fn walker(&self, index: usize) -> &Walker {
        &self.walkers[index]
    }

    pub(crate) fn walker_mut(&mut self, index: usize) -> &mut Walker {
        &mut self.walkers[index]
    }

    /// The walkers of one half together with the global index of its first walker.
    pub fn half(&self, half: Half) -> (usize, &[Walker]) {
        let range = half.range(self.n_walkers());
        (range.start, &self.walkers[range])
    }

    /// Number of walkers that still have no evaluated cost.
    pub fn n_unevaluated(&self) -> usize {
        self.walkers.iter().filter(|w| w.cost.is_none()).count()
    }
}
