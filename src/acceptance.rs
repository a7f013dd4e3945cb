//! Metropolis acceptance for stretch moves.
//!
//! Costs follow the `-2 ln L` convention, so the log-likelihood ratio between a
//! candidate and the current position is `(cost_current - cost_candidate) / 2`. A
//! stretch move with factor `z` in `M` dimensions is accepted with probability
//! `min(1, z^(M-1) L(candidate) / L(current))`.

use rand::Rng;

/// What happened to one walker during a half-step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptanceOutcome {
    pub walker_index: usize,
    pub accepted: bool,
    /// The candidate fell outside the objective's domain and was discarded.
    pub offboard: bool,
    /// Cost of the candidate, when it could be evaluated.
    pub new_cost: Option<f64>,
}

/// Logarithm of the stretch-move acceptance ratio.
///
/// `current_cost` is `None` for a walker that was never evaluated, which counts as
/// an infinite cost.
pub fn log_acceptance_ratio(
    current_cost: Option<f64>,
    proposed_cost: f64,
    z: f64,
    n_params: usize,
) -> f64 {
    let current_cost = current_cost.unwrap_or(f64::INFINITY);
    (n_params as f64 - 1.0) * z.ln() + (current_cost - proposed_cost) / 2.0
}

/**
Accepts or rejects a proposal.

Draws `u ~ U(0, 1)` from `rng` and accepts when `ln u <= log_acceptance_ratio`. NaN
ratios (e.g. infinite proposed and current cost) are rejected.

```rust
use esmcmc::acceptance::decide;
use rand::rngs::SmallRng;
use rand::SeedableRng;

let mut rng = SmallRng::seed_from_u64(0);
// An unevaluated walker always moves to a finite candidate.
assert!(decide(None, 1e6, 1.0, 2, &mut rng));
// An infinitely bad candidate is never accepted.
assert!(!decide(Some(0.0), f64::INFINITY, 1.0, 2, &mut rng));
```
*/
pub fn decide<R: Rng + ?Sized>(
    current_cost: Option<f64>,
    proposed_cost: f64,
    z: f64,
    n_params: usize,
    rng: &mut R,
) -> bool {
    let log_ratio = log_acceptance_ratio(current_cost, proposed_cost, z, n_params);
    let u: f64 = rng.gen();
    u.ln() <= log_ratio
}
