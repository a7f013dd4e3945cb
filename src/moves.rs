/*!
# Walker moves

A [`MoveProposer`] turns the current position of one walker, together with the
walkers of the complementary half, into a candidate position. The default is the
affine-invariant *stretch move* of Goodman & Weare (2010), [`StretchMove`]:

\[
Y = X_j + z\,(X_i - X_j), \qquad g(z) \propto \frac{1}{\sqrt z}, \quad z \in [1/a, a],
\]

where `X_j` is drawn uniformly from the complementary half.

Proposers are pure functions of their inputs and the random stream they are handed,
so they can run anywhere without synchronization.

```rust
use esmcmc::ensemble::{Half, WalkerEnsembleState};
use esmcmc::moves::{ComplementaryHalf, MoveProposer, StretchMove};
use esmcmc::core::SeededStream;

let state = WalkerEnsembleState::from_positions(vec![
    vec![0.0], vec![1.0], vec![2.0], vec![3.0],
]).unwrap();
let (offset, walkers) = state.half(Half::Upper);
let complementary = ComplementaryHalf::new(offset, walkers);

let stretch = StretchMove::default();
let mut rng = SeededStream::new(1);
let proposal = stretch.propose(0, &state.walker(0).theta, &complementary, &mut rng);
assert!(proposal.partner_index >= 2);
assert!(proposal.z >= 0.5 && proposal.z <= 2.0);
```
*/

use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::ensemble::Walker;
use crate::error::EnsembleError;

/// A candidate position for one walker. Lives only until its evaluation is decided.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRecord {
    pub walker_index: usize,
    /// Global index of the complementary walker the move was built from.
    pub partner_index: usize,
    pub candidate: Vec<f64>,
    /// Stretch factor used to build the candidate.
    pub z: f64,
}

/// Read-only view of the half of the ensemble that is *not* being updated.
#[derive(Debug, Clone, Copy)]
pub struct ComplementaryHalf<'a> {
    offset: usize,
    walkers: &'a [Walker],
}

impl<'a> ComplementaryHalf<'a> {
    /// `offset` is the global index of `walkers[0]`.
    pub fn new(offset: usize, walkers: &'a [Walker]) -> Self {
        Self { offset, walkers }
    }

    pub fn len(&self) -> usize {
        self.walkers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.walkers.is_empty()
    }

    /// Global walker indices covered by this half.
    pub fn indices(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.walkers.len()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices().contains(&index)
    }

    /// Position of the walker with the given *global* index.
    pub fn theta(&self, index: usize) -> &'a [f64] {
        &self.walkers[index - self.offset].theta
    }
}

/// Builds candidate positions for walkers.
pub trait MoveProposer: Send + Sync {
    /// Proposes a new position for walker `walker_index`, currently at `current`,
    /// using partners from `complementary` only.
    fn propose<R: Rng + ?Sized>(
        &self,
        walker_index: usize,
        current: &[f64],
        complementary: &ComplementaryHalf<'_>,
        rng: &mut R,
    ) -> ProposalRecord;
}

/// The affine-invariant stretch move with scale parameter `a`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchMove {
    a: f64,
}

impl Default for StretchMove {
    fn default() -> Self {
        Self { a: 2.0 }
    }
}

impl StretchMove {
    /// Creates a stretch move with scale `a`, which must be finite and greater than 1.
    pub fn new(a: f64) -> Result<Self, EnsembleError> {
        if !a.is_finite() || a <= 1.0 {
            return Err(EnsembleError::InvariantViolation(format!(
                "stretch scale must be finite and greater than 1, got {a}"
            )));
        }
        Ok(Self { a })
    }

    pub fn scale(&self) -> f64 {
        self.a
    }

    /**
    Draws a stretch factor from `g(z) ∝ 1/√z` on `[1/a, a]`.

    `√z` is uniform on `[1/√a, √a]`, so with `u ~ U(0, 1)` the inverse CDF is
    `z = ((a − 1) u + 1)² / a`.
    */
    pub fn sample_z<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        ((self.a - 1.0) * u + 1.0).powi(2) / self.a
    }
}

impl MoveProposer for StretchMove {
    fn propose<R: Rng + ?Sized>(
        &self,
        walker_index: usize,
        current: &[f64],
        complementary: &ComplementaryHalf<'_>,
        rng: &mut R,
    ) -> ProposalRecord {
        debug_assert!(!complementary.is_empty());
        debug_assert!(!complementary.contains(walker_index));

        let z = self.sample_z(rng);
        let partner_index = Uniform::from(complementary.indices()).sample(rng);
        let partner = complementary.theta(partner_index);

        let candidate = partner
            .iter()
            .zip(current)
            .map(|(&xj, &xi)| xj + z * (xi - xj))
            .collect();

        ProposalRecord {
            walker_index,
            partner_index,
            candidate,
            z,
        }
    }
}
