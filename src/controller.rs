/*!
# Run controller

[`RunController`] owns the ensemble, the evaluation pool and the sample catalog, and
repeats generations until a [`StopCondition`] is met:

```text
Idle ──start_run──▶ Running ──▶ Converged | SampleLimitReached | Aborted
  ▲                                        │
  └──────────────────end_run───────────────┘
```

Catalog flushes and convergence checks happen at most once per
[`SamplerConfig::sync_interval`], not every generation.

# Examples

```rust
use esmcmc::catalog::MemorySink;
use esmcmc::controller::{RunController, RunOutcome, StopCondition};
use esmcmc::core::{GaussianBall, SeededStream};
use esmcmc::distributions::Quadratic;

let mut controller = RunController::new(
    8,
    2,
    Quadratic::new(0.5),
    GaussianBall::isotropic(vec![0.0, 0.0], 1.0).set_seed(1),
    SeededStream::new(42),
    MemorySink::new(),
    2,
)?;
let outcome = controller.start_run(StopCondition::MaxGenerations(50))?;
assert_eq!(outcome, RunOutcome::SampleLimitReached);
assert_eq!(controller.catalog_view().current_length(), 400);
assert_eq!(controller.stats().total_proposed, 400);
# Ok::<(), esmcmc::error::EnsembleError>(())
```
*/

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};

use crate::catalog::{CatalogReadHandle, CatalogRow, CatalogSink, RunStatistics, SampleCatalog};
use crate::config::SamplerConfig;
use crate::core::{InitialEnsembleSampler, ObjectiveEvaluator, RandomSource, SeededStream};
use crate::ensemble::{Walker, WalkerEnsembleState};
use crate::error::{CatalogError, EnsembleError, ObjectiveError};
use crate::moves::{MoveProposer, StretchMove};
use crate::orchestrator::{EnsembleOrchestrator, GenerationReport};
use crate::pool::ParallelEvaluationPool;
use crate::stats::{self, AcceptanceWindow, MeanCovar};

/// Lifecycle state of a [`RunController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Converged,
    SampleLimitReached,
    Aborted,
}

/// When [`RunController::start_run`] should stop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopCondition {
    /// Run this many generations in this call.
    MaxGenerations(u64),
    /// Run until the catalog's LRE drops below this value.
    TargetLre(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The cancellation flag was raised.
    Cancelled,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunOutcome {
    Converged { lre: f64 },
    SampleLimitReached,
    Aborted(AbortReason),
}

/// Generations over which the progress bar averages the acceptance rate.
const ACCEPT_WINDOW: usize = 100;

pub struct RunController<O, R = SeededStream, P = StretchMove> {
    config: SamplerConfig,
    initial: Box<dyn InitialEnsembleSampler>,
    orchestrator: EnsembleOrchestrator<O, R, P>,
    catalog: SampleCatalog,
    stats: RunStatistics,
    state: RunState,
    cancel: Arc<AtomicBool>,
    failed_flushes: u32,
    n_diagnostics: usize,
}

impl<O, R> RunController<O, R, StretchMove>
where
    O: ObjectiveEvaluator,
    R: RandomSource,
{
    /**
    Creates a controller with the default [`SamplerConfig`] and `pool_size` evaluation
    workers (0 for the available parallelism).

    If `sink` already holds whole generations, the ensemble continues from the last
    one and `initial_sampler` is only used by [`reset`](Self::reset).

    # Errors

    [`EnsembleError::InvariantViolation`] for an odd number of walkers, fewer than two
    walkers or zero parameters; catalog errors if `sink` cannot be read.
    */
    pub fn new<I, S>(
        n_walkers: usize,
        n_params: usize,
        objective: O,
        initial_sampler: I,
        rng: R,
        sink: S,
        pool_size: usize,
    ) -> Result<Self, EnsembleError>
    where
        I: InitialEnsembleSampler + 'static,
        S: CatalogSink + 'static,
    {
        let config = SamplerConfig::default().set_pool_size(pool_size);
        Self::with_config(n_walkers, n_params, objective, initial_sampler, rng, sink, config)
    }

    /// Like [`new`](Self::new), with every setting taken from `config`.
    pub fn with_config<I, S>(
        n_walkers: usize,
        n_params: usize,
        objective: O,
        initial_sampler: I,
        rng: R,
        sink: S,
        config: SamplerConfig,
    ) -> Result<Self, EnsembleError>
    where
        I: InitialEnsembleSampler + 'static,
        S: CatalogSink + 'static,
    {
        if n_walkers < 2 || n_walkers % 2 != 0 {
            return Err(EnsembleError::InvariantViolation(format!(
                "the number of walkers must be even and at least 2, got {n_walkers}"
            )));
        }
        if n_params == 0 {
            return Err(EnsembleError::InvariantViolation(
                "the ensemble has no free parameters".into(),
            ));
        }
        let proposer = StretchMove::new(config.scale)?;
        let pool = ParallelEvaluationPool::new(objective, config.pool_size)?;
        let diagnostic_names = pool.diagnostic_names();
        let n_diagnostics = diagnostic_names.len();
        let catalog = SampleCatalog::open(Box::new(sink), n_walkers, n_params, diagnostic_names)?;

        let mut initial: Box<dyn InitialEnsembleSampler> = Box::new(initial_sampler);
        let view = catalog.view();
        let len = view.current_length();
        if len % n_walkers as u64 != 0 {
            return Err(CatalogError::Corrupt(format!(
                "catalog holds {len} rows, which is not a whole number of generations of {n_walkers} walkers"
            ))
            .into());
        }
        let generation = len / n_walkers as u64;
        let state = if generation > 0 {
            log::info!("resuming from generation {generation} ({len} rows)");
            restore_ensemble(&view, n_walkers)?
        } else {
            draw_ensemble(initial.as_mut(), n_walkers, n_params)?
        };

        let orchestrator = EnsembleOrchestrator::new(state, proposer, pool, rng, generation);
        let stats = catalog.stats();
        Ok(Self {
            config,
            initial,
            orchestrator,
            catalog,
            stats,
            state: RunState::Idle,
            cancel: Arc::new(AtomicBool::new(false)),
            failed_flushes: 0,
            n_diagnostics,
        })
    }
}

impl<O, R, P> RunController<O, R, P>
where
    O: ObjectiveEvaluator,
    R: RandomSource,
    P: MoveProposer,
{
    /// Replaces the stretch move with another proposer.
    pub fn with_proposer<Q: MoveProposer>(self, proposer: Q) -> RunController<O, R, Q> {
        RunController {
            config: self.config,
            initial: self.initial,
            orchestrator: self.orchestrator.with_proposer(proposer),
            catalog: self.catalog,
            stats: self.stats,
            state: self.state,
            cancel: self.cancel,
            failed_flushes: self.failed_flushes,
            n_diagnostics: self.n_diagnostics,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn stats(&self) -> RunStatistics {
        self.stats
    }

    pub fn accept_ratio(&self) -> f64 {
        self.stats.accept_ratio()
    }

    pub fn offboard_ratio(&self) -> f64 {
        self.stats.offboard_ratio()
    }

    /// The current walker positions.
    pub fn ensemble(&self) -> &WalkerEnsembleState {
        self.orchestrator.state()
    }

    /// Generations in the catalog, including those of earlier runs.
    pub fn generations(&self) -> u64 {
        self.orchestrator.generation()
    }

    pub fn catalog_view(&self) -> CatalogReadHandle {
        self.catalog.view()
    }

    /// Setting the returned flag stops the current run before its next generation.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// LRE of the catalog, skipping [`SamplerConfig::lre_burn_in`] generations.
    pub fn lre(&self) -> f64 {
        stats::lre(&self.catalog.view(), self.config.lre_burn_in)
    }

    pub fn mean_covar(&self, burn_in: u64) -> Option<MeanCovar> {
        stats::mean_covar(&self.catalog.view(), burn_in)
    }

    /**
    Runs generations until `stop` is met or the run is cancelled.

    Fatal objective and catalog errors are returned as `Err` and leave the controller
    in [`RunState::Aborted`]. Rows appended before the failure stay in the catalog, and
    the ensemble is the one after the last complete generation, so calling `start_run`
    again continues where the run stopped.
    */
    pub fn start_run(&mut self, stop: StopCondition) -> Result<RunOutcome, EnsembleError> {
        if self.state == RunState::Running {
            return Err(EnsembleError::InvalidState(self.state));
        }
        if let StopCondition::TargetLre(target) = stop {
            if target.is_nan() || target <= 0.0 {
                return Err(EnsembleError::InvariantViolation(format!(
                    "target LRE must be positive, got {target}"
                )));
            }
        }
        self.state = RunState::Running;
        log::info!(
            "starting run ({stop:?}) at generation {} with {} walkers",
            self.generations(),
            self.ensemble().n_walkers()
        );

        match self.run_loop(stop) {
            Ok(outcome) => {
                self.state = match outcome {
                    RunOutcome::Converged { .. } => RunState::Converged,
                    RunOutcome::SampleLimitReached => RunState::SampleLimitReached,
                    RunOutcome::Aborted(_) => RunState::Aborted,
                };
                log::info!(
                    "run finished: {outcome:?} after {} generations, p(accept)={:.3}",
                    self.generations(),
                    self.accept_ratio()
                );
                Ok(outcome)
            }
            Err(e) => {
                self.state = RunState::Aborted;
                log::error!("run aborted: {e}");
                if let Err(flush) = self.catalog.flush() {
                    log::warn!("could not flush the catalog after the abort: {flush}");
                }
                Err(e)
            }
        }
    }

    fn run_loop(&mut self, stop: StopCondition) -> Result<RunOutcome, EnsembleError> {
        let pb = self.progress_bar(stop);
        let mut window = AcceptanceWindow::new(ACCEPT_WINDOW);
        let mut last_sync = Instant::now();
        let mut last_lre = f64::NAN;
        let mut done = 0u64;

        let outcome = loop {
            if let StopCondition::MaxGenerations(n) = stop {
                if done >= n {
                    break RunOutcome::SampleLimitReached;
                }
            }
            if self.cancel.swap(false, Ordering::SeqCst) {
                log::info!("run cancelled at generation {}", self.generations());
                break RunOutcome::Aborted(AbortReason::Cancelled);
            }

            let report = self.orchestrator.step()?;
            self.record(&report)?;
            window.push(report.accepted, report.proposed());
            done += 1;

            if last_sync.elapsed() >= self.config.sync_interval {
                last_sync = Instant::now();
                self.sync()?;
                if let StopCondition::TargetLre(target) = stop {
                    if let Some(lre) = self.check_convergence(target) {
                        last_lre = lre;
                        if lre < target {
                            break RunOutcome::Converged { lre };
                        }
                    }
                }
            }

            pb.inc(1);
            pb.set_message(format!(
                "p(accept)≈{:.2} offboard≈{:.2} lre≈{:.3}",
                window.rate(),
                self.offboard_ratio(),
                last_lre
            ));
        };

        self.sync()?;
        pb.finish_with_message("Done!");
        Ok(outcome)
    }

    fn progress_bar(&self, stop: StopCondition) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let (pb, template) = match stop {
            StopCondition::MaxGenerations(n) => (
                ProgressBar::new(n),
                "{prefix:8} {bar:40.white} ETA {eta:3} | {msg}",
            ),
            StopCondition::TargetLre(_) => (
                ProgressBar::new_spinner(),
                "{prefix:8} {spinner} {pos} generations | {msg}",
            ),
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        pb.set_style(style);
        pb.set_prefix("ESMCMC");
        pb
    }

    /// Appends the generation's rows and counts.
    fn record(&mut self, report: &GenerationReport) -> Result<(), EnsembleError> {
        let mut stats = self.stats;
        stats.record(report.proposed(), report.accepted, report.offboard);
        let rows = generation_rows(self.orchestrator.state(), report, self.n_diagnostics);
        self.catalog.append(rows, stats)?;
        self.stats = stats;
        Ok(())
    }

    /// Flushes the catalog, tolerating as many consecutive failures as the sink allows.
    fn sync(&mut self) -> Result<(), EnsembleError> {
        match self.catalog.flush() {
            Ok(written) => {
                self.failed_flushes = 0;
                log::debug!(
                    "flushed {written} rows; catalog holds {} rows",
                    self.catalog.current_length()
                );
                Ok(())
            }
            Err(e) => {
                self.failed_flushes += 1;
                let max = self.catalog.max_flush_retries();
                if self.failed_flushes > max {
                    return Err(e.into());
                }
                log::warn!(
                    "catalog flush failed ({}/{max}), {} rows kept in memory: {e}",
                    self.failed_flushes,
                    self.catalog.pending()
                );
                Ok(())
            }
        }
    }

    /// The current LRE, once enough generations are in the catalog.
    fn check_convergence(&self, target: f64) -> Option<f64> {
        let generations = self.generations();
        if generations < self.config.lre_min_generations {
            return None;
        }
        let lre = self.lre();
        match stats::lre_required_generations(lre, target, generations) {
            Some(needed) if lre >= target => log::debug!(
                "lre {lre:.4} at generation {generations}; about {} more generations to reach {target}",
                needed.saturating_sub(generations)
            ),
            _ => log::debug!("lre {lre:.4} at generation {generations}"),
        }
        Some(lre)
    }

    /// Flushes the catalog and returns to [`RunState::Idle`].
    pub fn end_run(&mut self) -> Result<(), EnsembleError> {
        if self.state == RunState::Running {
            return Err(EnsembleError::InvalidState(self.state));
        }
        self.catalog.flush()?;
        self.failed_flushes = 0;
        self.state = RunState::Idle;
        Ok(())
    }

    /**
    Empties the catalog, zeroes the statistics and draws a fresh ensemble from the
    initial sampler. Only allowed in [`RunState::Idle`].
    */
    pub fn reset(&mut self) -> Result<(), EnsembleError> {
        if self.state != RunState::Idle {
            return Err(EnsembleError::InvalidState(self.state));
        }
        let state = self.ensemble();
        let (n_walkers, n_params) = (state.n_walkers(), state.n_params());
        let fresh = draw_ensemble(self.initial.as_mut(), n_walkers, n_params)?;
        self.catalog.truncate()?;
        self.stats = RunStatistics::default();
        self.failed_flushes = 0;
        self.orchestrator.reposition(fresh, 0);
        log::info!("controller reset");
        Ok(())
    }

    /**
    Re-evaluates the stored rows with ids in `ids` and returns the ids whose stored
    cost differs from the recomputed one by more than
    [`SamplerConfig::validate_rel_tol`] (relative). Rows of walkers that were never
    evaluated are skipped.
    */
    pub fn validate(&self, ids: Range<u64>) -> Result<Vec<u64>, EnsembleError> {
        let rows: Vec<CatalogRow> = self
            .catalog
            .view()
            .read_range(ids.start, ids.end)
            .filter(|row| row.cost.is_finite())
            .collect();
        let points: Vec<&[f64]> = rows.iter().map(|row| row.theta.as_slice()).collect();
        let results = self.orchestrator.pool().evaluate_points(&points);

        let tol = self.config.validate_rel_tol;
        let mut mismatches = Vec::new();
        for (row, result) in rows.iter().zip(results) {
            match result {
                Ok(evaluation) => {
                    let scale = evaluation.cost.abs().max(row.cost.abs());
                    if (evaluation.cost - row.cost).abs() > tol * scale {
                        mismatches.push(row.sample_id);
                    }
                }
                Err(ObjectiveError::Domain) => mismatches.push(row.sample_id),
                Err(ObjectiveError::Fatal(reason)) => {
                    return Err(EnsembleError::FatalEvaluation {
                        walker: row.walker_index,
                        reason,
                    })
                }
            }
        }
        if !mismatches.is_empty() {
            log::warn!(
                "{} of {} rows failed validation",
                mismatches.len(),
                rows.len()
            );
        }
        Ok(mismatches)
    }
}

fn draw_ensemble(
    sampler: &mut dyn InitialEnsembleSampler,
    n_walkers: usize,
    n_params: usize,
) -> Result<WalkerEnsembleState, EnsembleError> {
    let state = sampler.sample(n_walkers, n_params)?;
    if state.n_walkers() != n_walkers || state.n_params() != n_params {
        return Err(EnsembleError::InvariantViolation(format!(
            "initial sampler produced {} walkers with {} parameters, expected {n_walkers} with {n_params}",
            state.n_walkers(),
            state.n_params()
        )));
    }
    Ok(state)
}

/// Rebuilds the ensemble from the last generation in the catalog.
fn restore_ensemble(
    view: &CatalogReadHandle,
    n_walkers: usize,
) -> Result<WalkerEnsembleState, EnsembleError> {
    let len = view.current_length();
    let last = view.read_range(len - n_walkers as u64, len);
    let mut walkers = Vec::with_capacity(n_walkers);
    for (k, row) in last.enumerate() {
        if row.walker_index != k {
            return Err(CatalogError::Corrupt(format!(
                "row {} belongs to walker {}, expected walker {k}",
                row.sample_id, row.walker_index
            ))
            .into());
        }
        let evaluated = row.cost.is_finite();
        walkers.push(Walker {
            theta: row.theta,
            cost: evaluated.then_some(row.cost),
            extra: if evaluated { row.extra } else { Vec::new() },
        });
    }
    WalkerEnsembleState::new(walkers)
}

/// One catalog row per walker holding its state after the generation.
fn generation_rows(
    state: &WalkerEnsembleState,
    report: &GenerationReport,
    n_diagnostics: usize,
) -> Vec<CatalogRow> {
    state
        .walkers()
        .iter()
        .zip(&report.outcomes)
        .enumerate()
        .map(|(i, (walker, outcome))| CatalogRow {
            sample_id: 0,
            walker_index: i,
            accepted: outcome.accepted,
            offboard: outcome.offboard,
            cost: walker.effective_cost(),
            theta: walker.theta.clone(),
            extra: if walker.extra.len() == n_diagnostics {
                walker.extra.clone()
            } else {
                vec![f64::NAN; n_diagnostics]
            },
        })
        .collect()
}
