//! Parallel affine-invariant ensemble MCMC.
//!
//! An ensemble of walkers explores a parameter space by Goodman-Weare stretch moves.
//! Each generation moves the two halves of the ensemble in turn, evaluating the
//! objective for all proposals of a half in parallel. Every walker state is appended
//! to a [`SampleCatalog`](catalog::SampleCatalog), which can be persisted to CSV and
//! resumed later.
//!
//! ```rust
//! use esmcmc::catalog::MemorySink;
//! use esmcmc::controller::{RunController, StopCondition};
//! use esmcmc::core::{GaussianBall, SeededStream};
//! use esmcmc::distributions::Quadratic;
//!
//! let mut sampler = RunController::new(
//!     8,
//!     2,
//!     Quadratic::new(0.5),
//!     GaussianBall::isotropic(vec![0.0, 0.0], 1.0).set_seed(7),
//!     SeededStream::new(7),
//!     MemorySink::new(),
//!     0,
//! )?;
//! sampler.start_run(StopCondition::MaxGenerations(200))?;
//! let summary = sampler.mean_covar(50).expect("enough samples");
//! assert_eq!(summary.mean.len(), 2);
//! # Ok::<(), esmcmc::error::EnsembleError>(())
//! ```

pub mod acceptance;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod core;
pub mod distributions;
pub mod ensemble;
pub mod error;
pub mod io;
pub mod moves;
pub mod orchestrator;
pub mod pool;
pub mod stats;
