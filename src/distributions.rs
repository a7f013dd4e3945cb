/*!
Ready-made objectives for testing and demonstrating the sampler.

Every objective returns a cost `-2 ln L` up to an additive constant, so the sampled
density is `exp(-cost / 2)`.

# Examples

```rust
use esmcmc::core::ObjectiveEvaluator;
use esmcmc::distributions::{Gaussian2D, Quadratic};
use ndarray::{arr1, arr2};

// N(0, 2) in every coordinate.
let mut quad = Quadratic::new(0.5);
assert_eq!(quad.evaluate(&[2.0, 0.0]), Ok(2.0));

let mut gauss = Gaussian2D::new(arr1(&[1.0, 0.0]), arr2(&[[1.0, 0.0], [0.0, 4.0]])).unwrap();
assert_eq!(gauss.evaluate(&[1.0, 2.0]), Ok(1.0));
```
*/

use ndarray::{arr1, Array1, Array2};

use crate::core::ObjectiveEvaluator;
use crate::error::{EnsembleError, ObjectiveError};

/// `weight * |theta|^2`. With `weight = 1/2` every coordinate is `N(0, 2)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quadratic {
    pub weight: f64,
}

impl Quadratic {
    pub fn new(weight: f64) -> Self {
        Self { weight }
    }
}

impl ObjectiveEvaluator for Quadratic {
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
        Ok(self.weight * theta.iter().map(|x| x * x).sum::<f64>())
    }
}

/// A [`Quadratic`] defined only on the box `[-bound, bound]^M`.
///
/// Positions outside the box are reported as [`ObjectiveError::Domain`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoxedQuadratic {
    pub weight: f64,
    pub bound: f64,
}

impl BoxedQuadratic {
    pub fn new(weight: f64, bound: f64) -> Self {
        Self { weight, bound }
    }
}

impl ObjectiveEvaluator for BoxedQuadratic {
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
        if theta.iter().any(|x| x.abs() > self.bound) {
            return Err(ObjectiveError::Domain);
        }
        Quadratic::new(self.weight).evaluate(theta)
    }
}

/// Independent Gaussians with a common standard deviation around `mean`.
#[derive(Debug, Clone, PartialEq)]
pub struct IsotropicGaussian {
    pub mean: Vec<f64>,
    pub std: f64,
}

impl IsotropicGaussian {
    pub fn new(mean: Vec<f64>, std: f64) -> Self {
        Self { mean, std }
    }
}

impl ObjectiveEvaluator for IsotropicGaussian {
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
        if theta.len() != self.mean.len() {
            return Err(ObjectiveError::Fatal(format!(
                "expected {} parameters, got {}",
                self.mean.len(),
                theta.len()
            )));
        }
        Ok(theta
            .iter()
            .zip(&self.mean)
            .map(|(x, mu)| ((x - mu) / self.std).powi(2))
            .sum())
    }
}

/**
A correlated 2D Gaussian given by its mean and covariance.

```rust
use esmcmc::distributions::Gaussian2D;
use ndarray::{arr1, arr2};

// A singular covariance is rejected up front.
assert!(Gaussian2D::new(arr1(&[0.0, 0.0]), arr2(&[[1.0, 1.0], [1.0, 1.0]])).is_err());
```
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian2D {
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
    precision: Array2<f64>,
}

impl Gaussian2D {
    pub fn new(mean: Array1<f64>, cov: Array2<f64>) -> Result<Self, EnsembleError> {
        if mean.len() != 2 || cov.dim() != (2, 2) {
            return Err(EnsembleError::InvariantViolation(format!(
                "Gaussian2D needs a 2-vector and a 2x2 matrix, got {} and {:?}",
                mean.len(),
                cov.dim()
            )));
        }
        let (a, b, c, d) = (cov[(0, 0)], cov[(0, 1)], cov[(1, 0)], cov[(1, 1)]);
        let det = a * d - b * c;
        if !(det > 0.0 && a > 0.0) {
            return Err(EnsembleError::InvariantViolation(format!(
                "covariance {cov:?} is not positive definite"
            )));
        }
        let precision = ndarray::arr2(&[[d, -b], [-c, a]]) / det;
        Ok(Self {
            mean,
            cov,
            precision,
        })
    }
}

impl ObjectiveEvaluator for Gaussian2D {
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
        if theta.len() != 2 {
            return Err(ObjectiveError::Fatal(format!(
                "Gaussian2D takes 2 parameters, got {}",
                theta.len()
            )));
        }
        let diff = arr1(theta) - &self.mean;
        Ok(diff.dot(&self.precision.dot(&diff)))
    }
}

/// The Rosenbrock "banana" `(a - x)^2 + b (y - x^2)^2`, summed over consecutive pairs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rosenbrock {
    pub a: f64,
    pub b: f64,
}

impl Default for Rosenbrock {
    fn default() -> Self {
        Self { a: 1.0, b: 100.0 }
    }
}

impl ObjectiveEvaluator for Rosenbrock {
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
        Ok(theta
            .windows(2)
            .map(|w| (self.a - w[0]).powi(2) + self.b * (w[1] - w[0] * w[0]).powi(2))
            .sum())
    }
}

/// Wraps an objective and reports the Euclidean norm of `theta` as a diagnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct WithRadius<O> {
    pub inner: O,
}

impl<O> WithRadius<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

impl<O: ObjectiveEvaluator> ObjectiveEvaluator for WithRadius<O> {
    fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
        self.inner.evaluate(theta)
    }

    fn diagnostic_names(&self) -> Vec<String> {
        let mut names = self.inner.diagnostic_names();
        names.push("radius".to_string());
        names
    }

    fn diagnostics(&mut self, theta: &[f64]) -> Result<Vec<f64>, ObjectiveError> {
        let mut values = self.inner.diagnostics(theta)?;
        values.push(theta.iter().map(|x| x * x).sum::<f64>().sqrt());
        Ok(values)
    }
}
