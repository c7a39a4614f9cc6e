//! Classifies a constraint over a box as UNSAT, VALID or UNKNOWN.

use std::fmt;

use d5_core::formula::FormulaNode;
use d5_core::{sub, Formula, RelOp, Variables};
use d5_interval::eval::eval;
use d5_interval::{Interval, IntervalBox};

use d5_contractor::{formula_holds, Config, ForwardEvaluator};

/// Outcome of evaluating one constraint over a box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FormulaEvaluationResult {
    /// No assignment in the box satisfies the constraint.
    Unsat,
    /// Every assignment in the box satisfies the constraint.
    Valid,
    /// Undecided; `width` is the diameter of the ambiguous interval
    /// evaluation.
    Unknown {
        /// Diameter of the residual enclosure.
        width: f64,
    },
}

enum EvaluatorKind {
    Constant(bool),
    // lhs − rhs ⋈ 0 with a prebuilt forward plan for the residual.
    Relational { op: RelOp, residual: ForwardEvaluator },
    // Hull evaluation of the body over box × quantified domains.
    Forall { domains: IntervalBox, body: Formula },
    // Three-valued fallback for other shapes (Boolean structure the
    // engine was handed unsplit).
    Generic,
}

/// Interval-based evaluator for one formula, reused across boxes.
pub struct FormulaEvaluator {
    formula: Formula,
    free: Variables,
    kind: EvaluatorKind,
}

impl FormulaEvaluator {
    /// Build an evaluator for `f` over the dimensions of `b`.
    pub fn new(f: Formula, b: &IntervalBox, config: &Config) -> FormulaEvaluator {
        let free = f.free_variables();
        let kind = match f.node() {
            FormulaNode::True => EvaluatorKind::Constant(true),
            FormulaNode::False => EvaluatorKind::Constant(false),
            FormulaNode::Relational { op, lhs, rhs } => {
                let residual =
                    ForwardEvaluator::new(&sub(lhs.clone(), rhs.clone()), b, config.number_of_jobs);
                EvaluatorKind::Relational { op: *op, residual }
            }
            _ => EvaluatorKind::Generic,
        };
        FormulaEvaluator {
            formula: f,
            free,
            kind,
        }
    }

    /// Build an evaluator for a ∀-literal, with explicit domains for the
    /// quantified variables. The body is hull-evaluated over the product
    /// of the outer box and the domains: valid there means valid for
    /// every instantiation.
    pub fn forall(f: Formula, quantified_domains: IntervalBox) -> FormulaEvaluator {
        let free = f.free_variables();
        let body = match f.node() {
            FormulaNode::Forall(_, body) => body.clone(),
            _ => f.clone(),
        };
        FormulaEvaluator {
            formula: f,
            free,
            kind: EvaluatorKind::Forall {
                domains: quantified_domains,
                body,
            },
        }
    }

    /// The evaluated constraint.
    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Free variables of the constraint, for branching-candidate
    /// collection.
    pub fn variables(&self) -> &Variables {
        &self.free
    }

    /// Classify the constraint over `b`.
    pub fn evaluate(&self, b: &IntervalBox, worker_id: usize) -> FormulaEvaluationResult {
        match &self.kind {
            EvaluatorKind::Constant(true) => FormulaEvaluationResult::Valid,
            EvaluatorKind::Constant(false) => FormulaEvaluationResult::Unsat,
            EvaluatorKind::Relational { op, residual } => {
                let d = residual.evaluate(b, worker_id);
                classify_residual(*op, d)
            }
            EvaluatorKind::Forall { domains, body } => {
                let combined = combine(b, domains);
                match formula_holds(body, &combined) {
                    Some(true) => FormulaEvaluationResult::Valid,
                    Some(false) => FormulaEvaluationResult::Unsat,
                    None => FormulaEvaluationResult::Unknown {
                        width: residual_width(body, &combined),
                    },
                }
            }
            EvaluatorKind::Generic => match formula_holds(&self.formula, b) {
                Some(true) => FormulaEvaluationResult::Valid,
                Some(false) => FormulaEvaluationResult::Unsat,
                None => FormulaEvaluationResult::Unknown {
                    width: residual_width(&self.formula, b),
                },
            },
        }
    }
}

// Classify e ⋈ 0 given the enclosure of e. Strict relations are
// δ-weakened to their non-strict counterparts.
fn classify_residual(op: RelOp, d: Interval) -> FormulaEvaluationResult {
    if d.is_empty() {
        // The constraint's terms have no value anywhere in the box.
        return FormulaEvaluationResult::Unsat;
    }
    let width = d.diam();
    match op {
        RelOp::Leq | RelOp::Lt => {
            if d.ub <= 0.0 {
                FormulaEvaluationResult::Valid
            } else if d.lb > 0.0 {
                FormulaEvaluationResult::Unsat
            } else {
                FormulaEvaluationResult::Unknown { width }
            }
        }
        RelOp::Geq | RelOp::Gt => {
            if d.lb >= 0.0 {
                FormulaEvaluationResult::Valid
            } else if d.ub < 0.0 {
                FormulaEvaluationResult::Unsat
            } else {
                FormulaEvaluationResult::Unknown { width }
            }
        }
        RelOp::Eq => {
            if d.is_degenerate() && d.lb == 0.0 {
                FormulaEvaluationResult::Valid
            } else if !d.contains(0.0) {
                FormulaEvaluationResult::Unsat
            } else {
                FormulaEvaluationResult::Unknown { width }
            }
        }
        RelOp::Neq => {
            if !d.contains(0.0) {
                FormulaEvaluationResult::Valid
            } else if d.is_degenerate() {
                FormulaEvaluationResult::Unsat
            } else {
                FormulaEvaluationResult::Unknown { width }
            }
        }
    }
}

// Width of the relational residual when the formula is relational, else
// unbounded (undecidable shapes keep branching until decided).
fn residual_width(f: &Formula, b: &IntervalBox) -> f64 {
    if let FormulaNode::Relational { lhs, rhs, .. } = f.node() {
        if let Ok(d) = eval(&sub(lhs.clone(), rhs.clone()), b) {
            return d.diam();
        }
    }
    f64::INFINITY
}

// The outer box extended with the quantified domains.
fn combine(outer: &IntervalBox, domains: &IntervalBox) -> IntervalBox {
    let mut dims: Vec<_> = outer
        .variables()
        .iter()
        .map(|v| (v.clone(), outer.interval_of(v).copied().unwrap()))
        .collect();
    for v in domains.variables() {
        dims.push((v.clone(), domains.interval_of(v).copied().unwrap()));
    }
    IntervalBox::new(dims)
}

impl fmt::Display for FormulaEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FormulaEvaluator({})", self.formula)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use d5_core::expr::powi;
    use d5_core::{forall, geq, gt, if_then_else, leq, Expression, Variable};

    fn unit_box() -> (Variable, Variable, IntervalBox) {
        let x = Variable::new("x");
        let y = Variable::new("y");
        let b = IntervalBox::new([
            (x.clone(), Interval::new(-2.0, 2.0)),
            (y.clone(), Interval::new(-2.0, 2.0)),
        ]);
        (x, y, b)
    }

    #[test]
    fn test_valid_unsat_unknown() {
        let (xv, yv, b) = unit_box();
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let config = Config::default();

        // x² + y² <= 9 holds everywhere on [-2, 2]².
        let valid = FormulaEvaluator::new(
            leq(powi(x.clone(), 2) + powi(y.clone(), 2), Expression::constant(9.0)),
            &b,
            &config,
        );
        assert_eq!(valid.evaluate(&b, 0), FormulaEvaluationResult::Valid);

        // x + y >= 5 holds nowhere.
        let unsat = FormulaEvaluator::new(
            geq(x.clone() + y.clone(), Expression::constant(5.0)),
            &b,
            &config,
        );
        assert_eq!(unsat.evaluate(&b, 0), FormulaEvaluationResult::Unsat);

        // x + y >= 0.5 is undecided, with the residual width 8.
        let unknown = FormulaEvaluator::new(
            geq(x + y, Expression::constant(0.5)),
            &b,
            &config,
        );
        match unknown.evaluate(&b, 0) {
            FormulaEvaluationResult::Unknown { width } => {
                assert!((width - 8.0).abs() < 1e-9);
            }
            r => panic!("expected unknown, got {r:?}"),
        }
    }

    #[test]
    fn test_ite_constraint_is_evaluated_by_hull() {
        let (xv, yv, b) = unit_box();
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let config = Config::default();
        // ite(x > 0, y, -y) = 2 over y ∈ [-2, 2]: undecided, not an error.
        let ite = if_then_else(gt(x, Expression::zero()), y.clone(), -y);
        let f = d5_core::eq(ite, Expression::constant(2.0));
        let ev = FormulaEvaluator::new(f, &b, &config);
        assert!(matches!(
            ev.evaluate(&b, 0),
            FormulaEvaluationResult::Unknown { .. }
        ));

        // On a box where the condition is decided and y pinned, the
        // residual collapses to the rounding slack.
        let decided = IntervalBox::new([
            (xv, Interval::new(1.0, 2.0)),
            (yv, Interval::new(2.0, 2.0)),
        ]);
        match ev.evaluate(&decided, 0) {
            FormulaEvaluationResult::Valid => {}
            FormulaEvaluationResult::Unknown { width } => assert!(width < 1e-9),
            FormulaEvaluationResult::Unsat => panic!("decided box must not be unsat"),
        }
    }

    #[test]
    fn test_forall_hull_evaluation() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        // forall y in [0, 1]. x + y >= 0
        let body = geq(x + y, Expression::zero());
        let f = forall([yv.clone()].into_iter().collect(), body);
        let domains = IntervalBox::new([(yv, Interval::new(0.0, 1.0))]);
        let ev = FormulaEvaluator::forall(f, domains);

        let valid_box = IntervalBox::new([(xv.clone(), Interval::new(1.0, 2.0))]);
        assert_eq!(ev.evaluate(&valid_box, 0), FormulaEvaluationResult::Valid);

        let unsat_box = IntervalBox::new([(xv.clone(), Interval::new(-10.0, -5.0))]);
        assert_eq!(ev.evaluate(&unsat_box, 0), FormulaEvaluationResult::Unsat);

        let unknown_box = IntervalBox::new([(xv, Interval::new(-0.5, 0.5))]);
        assert!(matches!(
            ev.evaluate(&unknown_box, 0),
            FormulaEvaluationResult::Unknown { .. }
        ));
    }
}
