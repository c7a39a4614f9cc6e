//! The sequential branch-and-prune engine.

use thiserror::Error;
use tracing::debug;

use d5_interval::{BitSet, EvalError, IntervalBox};

use d5_contractor::{BranchingStrategy, Config, Contractor, ContractorStatus};

use crate::branch::{error_functions, find_gradient_descent, find_max_diam, DiffCache};
use crate::evaluator::{FormulaEvaluationResult, FormulaEvaluator};
use crate::interrupt;

/// Errors surfaced by a satisfiability check.
#[derive(Debug, Clone, Error)]
pub enum IcpError {
    /// The process-wide interrupt flag was observed.
    #[error("check was interrupted")]
    Cancelled,

    /// Interval evaluation failed underneath.
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Result alias for satisfiability checks.
pub type IcpResult<T> = Result<T, IcpError>;

/// Branch/prune counters, reported at the end of a check.
#[derive(Debug, Clone, Copy, Default)]
pub struct IcpStats {
    /// Number of pruning operations.
    pub num_prune: u64,
    /// Number of branching operations.
    pub num_branch: u64,
}

/// Evaluates every constraint over the current box and collects the
/// branching candidates.
///
/// `None` means some constraint is unsatisfiable on the box (the box is
/// emptied and the constraint recorded). An empty bitset means every
/// constraint is either valid or δ-satisfied here: the box is a δ-SAT
/// witness.
pub(crate) fn evaluate_box(
    evaluators: &[FormulaEvaluator],
    precision: f64,
    cs: &mut ContractorStatus,
) -> Option<BitSet> {
    let mut candidates = BitSet::new(cs.current().size());
    for ev in evaluators {
        match ev.evaluate(cs.current(), cs.worker_id()) {
            FormulaEvaluationResult::Unsat => {
                debug!(constraint = %ev.formula(), "box has no solution");
                cs.current_mut().set_empty();
                cs.add_used_constraint(ev.formula().clone());
                return None;
            }
            FormulaEvaluationResult::Valid => {}
            FormulaEvaluationResult::Unknown { width } => {
                if width > precision {
                    for v in ev.variables().iter() {
                        if let Some(i) = cs.current().index_of(v) {
                            if cs.current()[i].is_bisectable() {
                                candidates.add(i);
                            }
                        }
                    }
                }
            }
        }
    }
    Some(candidates)
}

/// The sequential ICP engine: a depth-first branch-and-prune loop over a
/// LIFO stack of boxes.
#[derive(Debug)]
pub struct Icp {
    config: Config,
    stats: IcpStats,
}

impl Icp {
    /// New engine with the given options.
    pub fn new(config: Config) -> Icp {
        Icp {
            config,
            stats: IcpStats::default(),
        }
    }

    /// The engine options.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Counters accumulated across checks.
    pub fn stats(&self) -> IcpStats {
        self.stats
    }

    /// Decide δ-satisfiability of the constraints on the box in `cs`.
    ///
    /// Returns `Ok(true)` with a δ-satisfying box installed in `cs`, or
    /// `Ok(false)` when the constraints are unsatisfiable on the initial
    /// box.
    pub fn check_sat(
        &mut self,
        contractor: &Contractor,
        evaluators: &[FormulaEvaluator],
        cs: &mut ContractorStatus,
    ) -> IcpResult<bool> {
        debug!("sequential check_sat");
        let mut stack_left_box_first = self.config.stack_left_box_first;
        // Stack of (box, branching dimension); -1 marks the initial box.
        let mut stack: Vec<(IntervalBox, i32)> = vec![(cs.current().clone(), -1)];

        let errors = match self.config.branching_strategy {
            BranchingStrategy::GradientDescent => Some(error_functions(evaluators)),
            BranchingStrategy::MaxDiam => None,
        };
        // Derivatives are memoized for the lifetime of this check.
        let mut diff_cache = DiffCache::new();

        while let Some((b, bp)) = stack.pop() {
            if interrupt::is_interrupted() {
                return Err(IcpError::Cancelled);
            }
            *cs.current_mut() = b;
            cs.set_branching_point(bp);

            contractor.prune(cs);
            self.stats.num_prune += 1;
            if cs.current().is_empty() {
                continue;
            }

            let Some(candidates) = evaluate_box(evaluators, self.config.precision, cs) else {
                continue;
            };
            if candidates.is_empty() {
                debug!(num_prune = self.stats.num_prune, "found a delta-box");
                return Ok(true);
            }

            self.stats.num_branch += 1;
            let dim = match &errors {
                Some(errs) => find_gradient_descent(
                    errs,
                    cs.current(),
                    &candidates,
                    &self.config,
                    &mut diff_cache,
                )
                .or_else(|| find_max_diam(cs.current(), &candidates)),
                None => find_max_diam(cs.current(), &candidates),
            };
            let Some(dim) = dim else {
                // Undecided but nothing left to bisect: a degenerate
                // δ-SAT box.
                debug!("non-bisectable undecided box, reporting delta-sat");
                return Ok(true);
            };
            let Some((left, right)) = cs.current().bisect(dim) else {
                return Ok(true);
            };
            // Alternate the exploration order to break depth-first bias.
            if stack_left_box_first {
                stack.push((left, dim as i32));
                stack.push((right, dim as i32));
            } else {
                stack.push((right, dim as i32));
                stack.push((left, dim as i32));
            }
            stack_left_box_first = !stack_left_box_first;
        }

        debug!(
            num_prune = self.stats.num_prune,
            num_branch = self.stats.num_branch,
            "no delta-box found"
        );
        Ok(false)
    }
}
