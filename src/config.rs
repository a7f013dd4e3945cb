//! Tuning knobs of a [`RunController`](crate::controller::RunController).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::pool::default_pool_size;

/**
Sampler settings. Built with consuming setters:

```rust
use esmcmc::config::SamplerConfig;
use std::time::Duration;

let config = SamplerConfig::default()
    .set_pool_size(4)
    .set_sync_interval(Duration::from_millis(500))
    .set_lre_burn_in(50);
assert_eq!(config.scale, 2.0);
assert_eq!(config.pool_size, 4);
```
*/
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Stretch-move scale `a`.
    pub scale: f64,
    /// Number of evaluation workers.
    pub pool_size: usize,
    /// Minimum time between catalog flushes and convergence checks.
    pub sync_interval: Duration,
    /// Generations ignored by the convergence check.
    pub lre_burn_in: u64,
    /// Generations the catalog must hold before the convergence check runs.
    pub lre_min_generations: u64,
    pub show_progress: bool,
    /// Relative tolerance used by `validate` when comparing stored and recomputed costs.
    pub validate_rel_tol: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            scale: 2.0,
            pool_size: default_pool_size(),
            sync_interval: Duration::from_secs(10),
            lre_burn_in: 0,
            lre_min_generations: 100,
            show_progress: false,
            validate_rel_tol: 1e-8,
        }
    }
}

impl SamplerConfig {
    pub fn set_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    pub fn set_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn set_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    pub fn set_lre_burn_in(mut self, generations: u64) -> Self {
        self.lre_burn_in = generations;
        self
    }

    pub fn set_lre_min_generations(mut self, generations: u64) -> Self {
        self.lre_min_generations = generations;
        self
    }

    pub fn set_show_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn set_validate_rel_tol(mut self, rel_tol: f64) -> Self {
        self.validate_rel_tol = rel_tol;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SamplerConfig::default();
        assert_eq!(config.scale, 2.0);
        assert_eq!(config.sync_interval, Duration::from_secs(10));
        assert_eq!(config.lre_min_generations, 100);
        assert!(config.pool_size >= 1);
        assert!(!config.show_progress);
    }

    #[test]
    fn setters_chain() {
        let config = SamplerConfig::default()
            .set_scale(3.0)
            .set_lre_min_generations(5)
            .set_show_progress(true)
            .set_validate_rel_tol(1e-6);
        assert_eq!(config.scale, 3.0);
        assert_eq!(config.lre_min_generations, 5);
        assert!(config.show_progress);
        assert_eq!(config.validate_rel_tol, 1e-6);
    }
}
