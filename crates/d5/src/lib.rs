//! d5 - a δ-complete decision procedure for nonlinear real arithmetic
//!
//! This is the main library crate that re-exports all components and
//! offers a one-call entry point for deciding a conjunction of real
//! constraints over a bounded box.
//!
//! ```
//! use d5::{check_sat, Config, Expression, Interval, IntervalBox, Variable};
//! use d5::{leq, geq, powi};
//!
//! let xv = Variable::new("x");
//! let yv = Variable::new("y");
//! let x = Expression::variable(&xv);
//! let y = Expression::variable(&yv);
//! let formulas = [
//!     leq(powi(x.clone(), 2) + powi(y.clone(), 2), Expression::constant(1.0)),
//!     geq(x + y, Expression::constant(0.5)),
//! ];
//! let initial = IntervalBox::new([
//!     (xv, Interval::new(-2.0, 2.0)),
//!     (yv, Interval::new(-2.0, 2.0)),
//! ]);
//! let config = Config { precision: 0.01, ..Config::default() };
//! let witness = check_sat(&formulas, &initial, &config).unwrap();
//! assert!(witness.is_some());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use d5_contractor as contractor;
pub use d5_core as core;
pub use d5_icp as icp;
pub use d5_interval as interval;

pub use d5_contractor::{
    make_contractor, BranchingStrategy, Config, Contractor, ContractorStatus,
};
pub use d5_core::expr::powi;
pub use d5_core::{
    and, eq, forall, geq, gt, leq, lt, neq, not, or, Environment, Expression, Formula, Variable,
    VariableType, Variables,
};
pub use d5_icp::{
    interrupt, FormulaEvaluator, Icp, IcpEngine, IcpError, IcpParallel, IcpResult,
};
pub use d5_interval::{Interval, IntervalBox};

/// Decide δ-satisfiability of a conjunction of constraints over a box.
///
/// Builds the composed contractor and one formula evaluator per
/// constraint, runs the engine selected by `config.number_of_jobs`, and
/// returns the δ-satisfying box, or `None` on unsat.
pub fn check_sat(
    formulas: &[Formula],
    initial: &IntervalBox,
    config: &Config,
) -> IcpResult<Option<IntervalBox>> {
    let contractor = make_contractor(formulas, initial, config);
    let evaluators: Vec<FormulaEvaluator> = formulas
        .iter()
        .map(|f| FormulaEvaluator::new(f.clone(), initial, config))
        .collect();
    let mut cs = ContractorStatus::new(initial.clone(), 0);
    let mut engine = IcpEngine::new(config.clone());
    let sat = engine.check_sat(&contractor, &evaluators, &mut cs)?;
    Ok(if sat { Some(cs.current().clone()) } else { None })
}
