/*!
# Generation driver

[`EnsembleOrchestrator`] advances the ensemble one generation at a time. A generation
is two half-steps. In each half-step:

1. every walker of the half draws a proposal from the frozen complementary half,
2. the proposals are evaluated by the [`ParallelEvaluationPool`] (a barrier),
3. accept/reject decisions are applied, in walker order, once the whole batch is back.

All random draws happen on the calling thread, from one stream per walker, so the
results do not depend on the number of evaluation workers or their scheduling.

A generation is transactional: the ensemble is only replaced once both half-steps
finished without a fatal objective failure.
*/

use crate::acceptance::{decide, AcceptanceOutcome};
use crate::core::{ObjectiveEvaluator, RandomSource};
use crate::ensemble::{Half, WalkerEnsembleState};
use crate::error::{EnsembleError, ObjectiveError};
use crate::moves::{ComplementaryHalf, MoveProposer, ProposalRecord, StretchMove};
use crate::pool::{Evaluation, ParallelEvaluationPool};

/// What happened during one generation.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationReport {
    /// Zero-based index of the generation that was completed.
    pub generation: u64,
    /// One outcome per walker, in walker order.
    pub outcomes: Vec<AcceptanceOutcome>,
    pub accepted: u64,
    pub offboard: u64,
}

impl GenerationReport {
    pub fn proposed(&self) -> u64 {
        self.outcomes.len() as u64
    }
}

pub struct EnsembleOrchestrator<O, R, P = StretchMove> {
    state: WalkerEnsembleState,
    proposer: P,
    pool: ParallelEvaluationPool<O>,
    root: R,
    generation: u64,
    n_diagnostics: usize,
}

impl<O, R, P> EnsembleOrchestrator<O, R, P>
where
    O: ObjectiveEvaluator,
    R: RandomSource,
    P: MoveProposer,
{
    /**
    Creates an orchestrator that continues from `state` as generation `generation`.

    Walker `i` of generation `g` draws from `root.sub_stream(g * N + i)`, so a run
    resumed at generation `g` uses the same streams as an uninterrupted one.
    */
    pub fn new(
        state: WalkerEnsembleState,
        proposer: P,
        pool: ParallelEvaluationPool<O>,
        root: R,
        generation: u64,
    ) -> Self {
        let n_diagnostics = pool.diagnostic_names().len();
        Self {
            state,
            proposer,
            pool,
            root,
            generation,
            n_diagnostics,
        }
    }

    pub fn state(&self) -> &WalkerEnsembleState {
        &self.state
    }

    /// Number of generations completed, including those before a resume.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pool(&self) -> &ParallelEvaluationPool<O> {
        &self.pool
    }

    /// Replaces the ensemble and restarts the random streams at `generation`.
    pub fn reposition(&mut self, state: WalkerEnsembleState, generation: u64) {
        self.state = state;
        self.generation = generation;
    }

    /// Swaps the move proposer, keeping everything else.
    pub fn with_proposer<Q: MoveProposer>(self, proposer: Q) -> EnsembleOrchestrator<O, R, Q> {
        EnsembleOrchestrator {
            state: self.state,
            proposer,
            pool: self.pool,
            root: self.root,
            generation: self.generation,
            n_diagnostics: self.n_diagnostics,
        }
    }

    /// Runs one generation. On error the ensemble is left exactly as it was.
    pub fn step(&mut self) -> Result<GenerationReport, EnsembleError> {
        let n_walkers = self.state.n_walkers();
        let n_params = self.state.n_params();
        let mut streams = derive_streams(&self.root, n_walkers, self.generation);
        let mut next = self.state.clone();
        let mut outcomes = Vec::with_capacity(n_walkers);

        for half in Half::BOTH {
            let proposals: Vec<ProposalRecord> = {
                let (offset, walkers) = next.half(half.other());
                let complementary = ComplementaryHalf::new(offset, walkers);
                half.range(n_walkers)
                    .map(|i| {
                        self.proposer.propose(
                            i,
                            &next.walker(i).theta,
                            &complementary,
                            &mut streams[i],
                        )
                    })
                    .collect()
            };

            let results = self.pool.evaluate_batch(&proposals);
            for (proposal, result) in proposals.iter().zip(&results) {
                self.check_evaluation(proposal.walker_index, result)?;
            }

            for (proposal, result) in proposals.into_iter().zip(results) {
                let i = proposal.walker_index;
                let outcome = match result {
                    Ok(Evaluation { cost, extra }) => {
                        let walker = next.walker_mut(i);
                        let accepted =
                            decide(walker.cost, cost, proposal.z, n_params, &mut streams[i]);
                        if accepted {
                            walker.theta = proposal.candidate;
                            walker.cost = Some(cost);
                            walker.extra = extra;
                        }
                        AcceptanceOutcome {
                            walker_index: i,
                            accepted,
                            offboard: false,
                            new_cost: Some(cost),
                        }
                    }
                    Err(_) => AcceptanceOutcome {
                        walker_index: i,
                        accepted: false,
                        offboard: true,
                        new_cost: None,
                    },
                };
                outcomes.push(outcome);
            }
        }

        let accepted = outcomes.iter().filter(|o| o.accepted).count() as u64;
        let offboard = outcomes.iter().filter(|o| o.offboard).count() as u64;
        let report = GenerationReport {
            generation: self.generation,
            outcomes,
            accepted,
            offboard,
        };

        self.state = next;
        self.generation += 1;
        log::trace!(
            "generation {} done: {accepted}/{n_walkers} accepted, {offboard} offboard",
            report.generation
        );
        Ok(report)
    }

    /// Turns fatal failures and malformed diagnostics into errors.
    fn check_evaluation(
        &self,
        walker: usize,
        result: &Result<Evaluation, ObjectiveError>,
    ) -> Result<(), EnsembleError> {
        match result {
            Err(ObjectiveError::Fatal(reason)) => Err(EnsembleError::FatalEvaluation {
                walker,
                reason: reason.clone(),
            }),
            Ok(evaluation) if evaluation.extra.len() != self.n_diagnostics => {
                Err(EnsembleError::FatalEvaluation {
                    walker,
                    reason: format!(
                        "objective returned {} diagnostics, expected {}",
                        evaluation.extra.len(),
                        self.n_diagnostics
                    ),
                })
            }
            _ => Ok(()),
        }
    }
}

fn derive_streams<R: RandomSource>(root: &R, n_walkers: usize, generation: u64) -> Vec<R> {
    let base = generation * n_walkers as u64;
    (0..n_walkers as u64)
        .map(|i| root.sub_stream(base + i))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SeededStream;
    use crate::distributions::{BoxedQuadratic, Quadratic};
    use rand::Rng;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn start(n: usize, m: usize) -> WalkerEnsembleState {
        let positions = (0..n)
            .map(|i| (0..m).map(|j| 0.1 * (i as f64 - j as f64)).collect())
            .collect();
        WalkerEnsembleState::from_positions(positions).unwrap()
    }

    fn orchestrator<O: ObjectiveEvaluator>(
        objective: O,
        n: usize,
        m: usize,
        pool_size: usize,
        seed: u64,
    ) -> EnsembleOrchestrator<O, SeededStream> {
        let pool = ParallelEvaluationPool::new(objective, pool_size).unwrap();
        EnsembleOrchestrator::new(
            start(n, m),
            StretchMove::default(),
            pool,
            SeededStream::new(seed),
            0,
        )
    }

    #[test]
    fn generation_reports_every_walker_in_order() {
        let mut orch = orchestrator(Quadratic::new(0.5), 8, 2, 2, 1);
        let report = orch.step().unwrap();
        assert_eq!(report.generation, 0);
        assert_eq!(report.proposed(), 8);
        let indices: Vec<usize> = report.outcomes.iter().map(|o| o.walker_index).collect();
        assert_eq!(indices, (0..8).collect::<Vec<_>>());
        assert_eq!(orch.generation(), 1);
        assert_eq!(
            report.accepted,
            report.outcomes.iter().filter(|o| o.accepted).count() as u64
        );
    }

    #[test]
    fn accepted_walkers_move_and_rejected_walkers_stay() {
        let mut orch = orchestrator(Quadratic::new(0.5), 8, 2, 1, 2);
        let before = orch.state().clone();
        let report = orch.step().unwrap();
        for outcome in &report.outcomes {
            let i = outcome.walker_index;
            let (old, new) = (before.walker(i), orch.state().walker(i));
            if outcome.accepted {
                assert_eq!(new.cost, outcome.new_cost);
                assert_ne!(old.theta, new.theta);
            } else {
                assert_eq!(old, new);
            }
        }
    }

    #[test]
    fn results_do_not_depend_on_pool_size() {
        let run = |pool_size| {
            let mut orch = orchestrator(Quadratic::new(0.5), 8, 3, pool_size, 99);
                for _ in 0..20 {
                orch.step().unwrap();
            }
            orch.state().clone()
        };
        assert_eq!(run(1), run(4));
    }

    #[test]
    fn resuming_at_a_generation_reproduces_the_trajectory() {
        let mut straight = orchestrator(Quadratic::new(0.5), 6, 2, 1, 5);
        for _ in 0..3 {
            straight.step().unwrap();
        }
        let checkpoint = straight.state().clone();
        for _ in 0..3 {
            straight.step().unwrap();
        }

        let mut resumed = orchestrator(Quadratic::new(0.5), 6, 2, 1, 5);
        resumed.reposition(checkpoint, 3);
        for _ in 0..3 {
            resumed.step().unwrap();
        }
        assert_eq!(resumed.state(), straight.state());
        assert_eq!(resumed.generation(), 6);
    }

    #[test]
    fn out_of_domain_proposals_are_offboard() {
        // Narrow box: many stretch moves leave it.
        let mut orch = orchestrator(BoxedQuadratic::new(0.5, 0.8), 8, 2, 2, 3);
        let mut offboard = 0;
        for _ in 0..50 {
            let report = orch.step().unwrap();
            for outcome in &report.outcomes {
                if outcome.offboard {
                    assert!(!outcome.accepted);
                    assert_eq!(outcome.new_cost, None);
                }
            }
            offboard += report.offboard;
        }
        assert!(offboard > 0);
        for walker in orch.state().walkers() {
            assert!(walker.theta.iter().all(|x| x.abs() <= 0.8));
        }
    }

    /// Fails fatally on the `fail_at`-th call, counted across all clones.
    #[derive(Clone)]
    struct FailsOnce {
        calls: Arc<AtomicUsize>,
        fail_at: usize,
    }

    impl ObjectiveEvaluator for FailsOnce {
        fn evaluate(&mut self, theta: &[f64]) -> Result<f64, ObjectiveError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(ObjectiveError::Fatal("integrator diverged".into()));
            }
            Ok(theta.iter().map(|x| x * x).sum())
        }
    }

    #[test]
    fn fatal_failure_in_second_half_leaves_state_untouched() {
        let objective = FailsOnce {
            calls: Arc::new(AtomicUsize::new(0)),
            // 2 lower-half proposals, then the upper half.
            fail_at: 3,
        };
        let mut orch = orchestrator(objective, 4, 1, 1, 8);
        let before = orch.state().clone();

        let err = orch.step().unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::FatalEvaluation { walker: 3, .. }
        ));
        assert_eq!(orch.state(), &before);
        assert_eq!(orch.generation(), 0);
    }

    #[test]
    fn retried_generation_uses_the_same_draws() {
        let objective = FailsOnce {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_at: 1,
        };
        let mut flaky = orchestrator(objective, 4, 2, 1, 21);
        assert!(flaky.step().is_err());
        flaky.step().unwrap();

        let mut clean = orchestrator(Quadratic::new(1.0), 4, 2, 1, 21);
        clean.step().unwrap();
        assert_eq!(flaky.state(), clean.state());
    }

    #[derive(Clone)]
    struct WrongDiagnostics;

    impl ObjectiveEvaluator for WrongDiagnostics {
        fn evaluate(&mut self, _theta: &[f64]) -> Result<f64, ObjectiveError> {
            Ok(0.0)
        }

        fn diagnostic_names(&self) -> Vec<String> {
            vec!["a".into()]
        }
    }

    #[test]
    fn missing_diagnostics_are_fatal() {
        let mut orch = orchestrator(WrongDiagnostics, 4, 1, 1, 0);
        assert!(matches!(
            orch.step(),
            Err(EnsembleError::FatalEvaluation { .. })
        ));
        assert_eq!(orch.generation(), 0);
    }

    /// Records which partners each walker was offered.
    struct Recording {
        seen: Arc<parking_lot::Mutex<Vec<(usize, std::ops::Range<usize>)>>>,
    }

    impl MoveProposer for Recording {
        fn propose<G: Rng + ?Sized>(
            &self,
            walker_index: usize,
            current: &[f64],
            complementary: &ComplementaryHalf<'_>,
            rng: &mut G,
        ) -> ProposalRecord {
            self.seen
                .lock()
                .push((walker_index, complementary.indices()));
            StretchMove::default().propose(walker_index, current, complementary, rng)
        }
    }

    #[test]
    fn partners_always_come_from_the_other_half() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let pool = ParallelEvaluationPool::new(Quadratic::new(1.0), 2).unwrap();
        let mut orch = EnsembleOrchestrator::new(
            start(6, 2),
            Recording {
                seen: Arc::clone(&seen),
            },
            pool,
            SeededStream::new(4),
            0,
        );
        orch.step().unwrap();
        orch.step().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 12);
        for (walker, partners) in seen.iter() {
            assert!(!partners.contains(walker));
            assert_eq!(partners.len(), 3);
        }
        // Lower half is always proposed first.
        assert!(seen[..3].iter().all(|(w, _)| *w < 3));
        assert!(seen[3..6].iter().all(|(w, _)| *w >= 3));
    }
}
