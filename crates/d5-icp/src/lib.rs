//! d5-icp - branch-and-prune engines for the d5 solver
//!
//! Decides δ-satisfiability of a conjunction of real constraints over a
//! bounded box:
//! - [`FormulaEvaluator`]: classifies a constraint over a box as
//!   unsat / valid / unknown-with-width
//! - [`Icp`]: the sequential engine (LIFO stack, pop → prune → evaluate →
//!   bisect, with max-diameter or gradient-descent branching)
//! - [`IcpParallel`]: the parallel engine (worker pool over a shared box
//!   stack, racing to the first δ-SAT box)
//! - [`IcpEngine`]: picks an engine from the configured job count
//!
//! Cancellation is cooperative through the process-wide flag in
//! [`interrupt`]; both engines poll it at every loop head and report
//! [`IcpError::Cancelled`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod branch;
pub mod evaluator;
pub mod icp;
pub mod interrupt;
pub mod parallel;

pub use evaluator::{FormulaEvaluationResult, FormulaEvaluator};
pub use icp::{Icp, IcpError, IcpResult, IcpStats};
pub use parallel::IcpParallel;

use d5_contractor::{Config, Contractor, ContractorStatus};

/// A sequential or parallel engine, selected by `number_of_jobs`.
#[derive(Debug)]
pub enum IcpEngine {
    /// Depth-first single-threaded search.
    Sequential(Icp),
    /// Worker pool racing over a shared stack.
    Parallel(IcpParallel),
}

impl IcpEngine {
    /// Pick the engine matching the configuration.
    pub fn new(config: Config) -> IcpEngine {
        if config.number_of_jobs <= 1 {
            IcpEngine::Sequential(Icp::new(config))
        } else {
            IcpEngine::Parallel(IcpParallel::new(config))
        }
    }

    /// Decide δ-satisfiability of the constraints on the box in `cs`.
    pub fn check_sat(
        &mut self,
        contractor: &Contractor,
        evaluators: &[FormulaEvaluator],
        cs: &mut ContractorStatus,
    ) -> IcpResult<bool> {
        match self {
            IcpEngine::Sequential(icp) => icp.check_sat(contractor, evaluators, cs),
            IcpEngine::Parallel(icp) => icp.check_sat(contractor, evaluators, cs),
        }
    }

    /// Branch/prune counters accumulated so far.
    pub fn stats(&self) -> IcpStats {
        match self {
            IcpEngine::Sequential(icp) => icp.stats(),
            IcpEngine::Parallel(icp) => icp.stats(),
        }
    }
}
