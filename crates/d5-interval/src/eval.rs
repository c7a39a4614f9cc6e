//! Interval extension of symbolic expressions.
//!
//! Maps an expression and a box to a conservative interval enclosure of
//! the expression's range over the box. Degenerate integer exponents use
//! the integer-power specialization, which is tighter than the general
//! real-exponent operator.

use std::fmt;

use thiserror::Error;

use d5_core::expr::ExprNode;
use d5_core::{Expression, SymbolicError, Variable};

use crate::ibox::IntervalBox;
use crate::interval::Interval;

/// Errors raised by interval evaluation.
#[derive(Debug, Clone, Error)]
pub enum EvalError {
    /// The construct has no interval extension at this layer.
    #[error("{0} is not supported by interval evaluation")]
    Unsupported(&'static str),

    /// The box does not cover a variable of the expression.
    #[error("box has no dimension for variable {0}")]
    UnknownVariable(Variable),

    /// A symbolic operation failed underneath (NaN cell, differentiation).
    #[error(transparent)]
    Symbolic(#[from] SymbolicError),
}

/// Result alias for interval evaluation.
pub type EvalResult<T> = Result<T, EvalError>;

/// Interval evaluator for one expression.
#[derive(Debug, Clone)]
pub struct ExpressionEvaluator {
    e: Expression,
}

impl ExpressionEvaluator {
    /// Wrap an expression.
    pub fn new(e: Expression) -> ExpressionEvaluator {
        ExpressionEvaluator { e }
    }

    /// The wrapped expression.
    pub fn expression(&self) -> &Expression {
        &self.e
    }

    /// Evaluate over `b`.
    pub fn evaluate(&self, b: &IntervalBox) -> EvalResult<Interval> {
        eval(&self.e, b)
    }
}

impl fmt::Display for ExpressionEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExpressionEvaluator({})", self.e)
    }
}

/// Interval-evaluate `e` over `b`.
pub fn eval(e: &Expression, b: &IntervalBox) -> EvalResult<Interval> {
    match e.node() {
        ExprNode::Constant(v) => Ok(Interval::point(*v)),
        ExprNode::RealConstant { lb, ub, .. } => Ok(Interval::new(*lb, *ub)),
        ExprNode::Var(v) => b
            .interval_of(v)
            .copied()
            .ok_or_else(|| EvalError::UnknownVariable(v.clone())),
        ExprNode::Add { constant, terms } => {
            let mut acc = Interval::point(*constant);
            for (t, c) in terms {
                acc = acc + eval(t, b)? * *c;
            }
            Ok(acc)
        }
        ExprNode::Mul { constant, factors } => {
            let mut acc = Interval::point(*constant);
            for (base, exponent) in factors {
                acc = acc * eval_pow(base, exponent, b)?;
            }
            Ok(acc)
        }
        ExprNode::Div(a, c) => Ok(eval(a, b)? / eval(c, b)?),
        ExprNode::Log(a) => Ok(eval(a, b)?.ln()),
        ExprNode::Abs(a) => Ok(eval(a, b)?.abs()),
        ExprNode::Exp(a) => Ok(eval(a, b)?.exp()),
        ExprNode::Sqrt(a) => Ok(eval(a, b)?.sqrt()),
        ExprNode::Pow(base, exponent) => eval_pow(base, exponent, b),
        ExprNode::Sin(a) => Ok(eval(a, b)?.sin()),
        ExprNode::Cos(a) => Ok(eval(a, b)?.cos()),
        ExprNode::Tan(a) => Ok(eval(a, b)?.tan()),
        ExprNode::Asin(a) => Ok(eval(a, b)?.asin()),
        ExprNode::Acos(a) => Ok(eval(a, b)?.acos()),
        ExprNode::Atan(a) => Ok(eval(a, b)?.atan()),
        ExprNode::Atan2(y, x) => Ok(eval(y, b)?.atan2(eval(x, b)?)),
        ExprNode::Sinh(a) => Ok(eval(a, b)?.sinh()),
        ExprNode::Cosh(a) => Ok(eval(a, b)?.cosh()),
        ExprNode::Tanh(a) => Ok(eval(a, b)?.tanh()),
        ExprNode::Min(x, y) => Ok(eval(x, b)?.min_i(eval(y, b)?)),
        ExprNode::Max(x, y) => Ok(eval(x, b)?.max_i(eval(y, b)?)),
        ExprNode::IfThenElse(..) => Err(EvalError::Unsupported("if-then-else expression")),
        ExprNode::UninterpretedFunction { .. } => {
            Err(EvalError::Unsupported("uninterpreted function"))
        }
        ExprNode::NaN => Err(SymbolicError::NaN("interval evaluation").into()),
    }
}

// pow with the integer specialization on degenerate exponents.
fn eval_pow(base: &Expression, exponent: &Expression, b: &IntervalBox) -> EvalResult<Interval> {
    let first = eval(base, b)?;
    let second = eval(exponent, b)?;
    if second.is_degenerate() {
        let point = second.lb;
        if point.fract() == 0.0 && point.abs() <= i32::MAX as f64 {
            return Ok(if point == 2.0 {
                first.sqr()
            } else {
                first.powi(point as i32)
            });
        }
        return Ok(first.powf(point));
    }
    Ok(first.pow(second))
}

/// First-order Taylor refinement about the box midpoint:
/// `f(mid) + Σᵢ (∂f/∂xᵢ)([x]) · ([xᵢ] − midᵢ)`.
pub fn taylor1_eval(f: &Expression, x: &IntervalBox) -> EvalResult<Interval> {
    let x0 = x.mid();
    let mut ret = eval(f, &x0)?;
    for i in 0..x.size() {
        let di = f.differentiate(x.variable(i))?;
        ret = ret + eval(&di, x)? * (x[i] - x0[i]);
    }
    Ok(ret)
}

/// Second-order Taylor refinement about the box midpoint. First-order
/// derivatives are evaluated at the midpoint; the quadratic remainder uses
/// interval second derivatives with the diagonal terms halved.
pub fn taylor2_eval(f: &Expression, x: &IntervalBox) -> EvalResult<Interval> {
    let x0 = x.mid();
    let mut ret = eval(f, &x0)?;
    for i in 0..x.size() {
        let di = f.differentiate(x.variable(i))?;
        ret = ret + eval(&di, &x0)? * (x[i] - x0[i]);
    }
    for i in 0..x.size() {
        let di = f.differentiate(x.variable(i))?;
        for j in i..x.size() {
            let dij = di.differentiate(x.variable(j))?;
            let term = eval(&dij, x)? * (x[i] - x0[i]) * (x[j] - x0[j]);
            if i == j {
                ret = ret + term * 0.5;
            } else {
                ret = ret + term;
            }
        }
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use d5_core::expr::{powi, sin, sqrt};
    use d5_core::{if_then_else, gt, Environment};

    fn sample_box() -> (Variable, Variable, IntervalBox) {
        let x = Variable::new("x");
        let y = Variable::new("y");
        let b = IntervalBox::new([
            (x.clone(), Interval::new(-1.0, 2.0)),
            (y.clone(), Interval::new(0.5, 1.5)),
        ]);
        (x, y, b)
    }

    #[test]
    fn test_eval_polynomial() {
        let (xv, yv, b) = sample_box();
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let e = powi(x, 2) + y;
        let r = eval(&e, &b).unwrap();
        // x² ∈ [0, 4], y ∈ [0.5, 1.5]
        assert!(r.lb <= 0.5 && r.ub >= 5.5);
        assert!(r.lb >= 0.4 && r.ub <= 5.6);
    }

    #[test]
    fn test_eval_contains_point_evaluations() {
        let (xv, yv, b) = sample_box();
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let e = sin(x.clone()) * y.clone() + sqrt(y) / (x + 3.0);
        let r = eval(&e, &b).unwrap();
        // Conservativeness at the midpoint.
        let env: Environment = [(xv, 0.5), (yv, 1.0)].into_iter().collect();
        let v = e.evaluate(&env).unwrap();
        assert!(r.contains(v), "{r} should contain {v}");
    }

    #[test]
    fn test_integer_pow_specialization_is_tight() {
        let (xv, _, b) = sample_box();
        let x = Expression::variable(&xv);
        let r = eval(&powi(x, 2), &b).unwrap();
        // [-1, 2]² = [0, 4], not [-2, 4].
        assert!(r.lb >= -1e-300);
        assert!(r.ub <= 4.0 + 1e-12);
    }

    #[test]
    fn test_unsupported_constructs() {
        let (xv, yv, b) = sample_box();
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let ite = if_then_else(gt(x.clone(), Expression::zero()), y.clone(), -y);
        assert!(matches!(
            eval(&ite, &b),
            Err(EvalError::Unsupported(_))
        ));
    }

    #[test]
    fn test_unknown_variable() {
        let (_, _, b) = sample_box();
        let z = Expression::variable(&Variable::new("z"));
        assert!(matches!(
            eval(&z, &b),
            Err(EvalError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_taylor_forms_contain_truth() {
        let (xv, yv, b) = sample_box();
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let e = powi(x.clone(), 2) * y.clone() + x * y;
        // The true value at an interior point is inside both refinements.
        let env: Environment = [(xv, 1.0), (yv, 1.25)].into_iter().collect();
        let v = e.evaluate(&env).unwrap();
        let t1 = taylor1_eval(&e, &b).unwrap();
        let t2 = taylor2_eval(&e, &b).unwrap();
        assert!(t1.contains(v), "{t1} should contain {v}");
        assert!(t2.contains(v), "{t2} should contain {v}");
    }
}
