//! Linear-relaxation hull contraction over a constraint set.
//!
//! Each constraint `f ⋈ 0` is linearized around the box midpoint with
//! interval gradient coefficients (first-order Taylor with interval
//! remainder): `f(x) ∈ f(m) + Σᵢ ∂f/∂xᵢ([x])·(xᵢ − mᵢ)`. The resulting
//! interval-linear inequalities are swept Gauss–Seidel style: each
//! variable is tightened against the relaxation of every row, twice per
//! prune. Constraints whose gradient does not exist (non-differentiable
//! operators over their free variables) are left to the forward/backward
//! contractor; when every constraint is skipped the contractor is a
//! well-formed no-op.

use std::fmt;

use d5_core::formula::FormulaNode;
use d5_core::{sub, Expression, Formula, RelOp};
use d5_interval::eval::eval;
use d5_interval::{BitSet, Interval, IntervalBox};

use crate::config::Config;
use crate::status::ContractorStatus;

#[derive(Debug, Clone, Copy)]
enum RowRelation {
    Le0,
    Ge0,
    Eq0,
}

#[derive(Debug)]
struct Row {
    formula: Formula,
    relation: RowRelation,
    expr: Expression,
    // (box dimension, symbolic partial derivative)
    grads: Vec<(usize, Expression)>,
}

/// Polytope-style contractor: interval linearization plus hull sweeps.
#[derive(Debug)]
pub struct PolytopeContractor {
    rows: Vec<Row>,
    input: BitSet,
}

// Sweeps per prune; the second pass propagates first-pass tightenings.
const SWEEPS: usize = 2;

impl PolytopeContractor {
    /// Linearize the relational members of `formulas` over the dimensions
    /// of `b`. Non-differentiable or non-relational members are skipped.
    pub fn new(formulas: Vec<Formula>, b: &IntervalBox, _config: &Config) -> PolytopeContractor {
        let mut rows = Vec::new();
        let mut input = BitSet::new(b.size());
        'formulas: for f in formulas {
            let FormulaNode::Relational { op, lhs, rhs } = f.node() else {
                continue;
            };
            let relation = match op {
                RelOp::Leq | RelOp::Lt => RowRelation::Le0,
                RelOp::Geq | RelOp::Gt => RowRelation::Ge0,
                RelOp::Eq => RowRelation::Eq0,
                RelOp::Neq => continue,
            };
            let expr = sub(lhs.clone(), rhs.clone());
            let mut grads = Vec::new();
            for v in expr.variables().iter() {
                let Some(dim) = b.index_of(v) else {
                    continue;
                };
                match expr.differentiate(v) {
                    Ok(d) => grads.push((dim, d)),
                    // No linearization for this constraint.
                    Err(_) => continue 'formulas,
                }
            }
            if grads.is_empty() {
                continue;
            }
            for (dim, _) in &grads {
                input.add(*dim);
            }
            rows.push(Row {
                formula: f,
                relation,
                expr,
                grads,
            });
        }
        PolytopeContractor { rows, input }
    }

    /// True iff no constraint could be linearized.
    pub fn is_dummy(&self) -> bool {
        self.rows.is_empty()
    }

    /// Dimensions this contractor may narrow.
    pub fn input(&self) -> &BitSet {
        &self.input
    }

    /// Tighten every dimension against the linear relaxation of every
    /// row.
    pub fn prune(&self, cs: &mut ContractorStatus) {
        if self.rows.is_empty() || cs.current().is_empty() {
            return;
        }
        for _ in 0..SWEEPS {
            for row in &self.rows {
                if !self.tighten_row(row, cs) {
                    return;
                }
            }
        }
    }

    // One Gauss–Seidel pass over a row. Returns false when the box became
    // empty.
    fn tighten_row(&self, row: &Row, cs: &mut ContractorStatus) -> bool {
        let mid_box = cs.current().mid();
        let Ok(f_mid) = eval(&row.expr, &mid_box) else {
            return true;
        };
        if f_mid.is_empty() {
            return true;
        }
        let mut coeffs = Vec::with_capacity(row.grads.len());
        for (dim, grad) in &row.grads {
            match eval(grad, cs.current()) {
                Ok(g) if !g.is_empty() => coeffs.push((*dim, g)),
                _ => return true,
            }
        }
        match row.relation {
            RowRelation::Le0 => self.tighten_leq(row, &coeffs, -f_mid, &mid_box, cs),
            RowRelation::Ge0 => {
                let negated: Vec<(usize, Interval)> =
                    coeffs.iter().map(|(d, g)| (*d, -*g)).collect();
                self.tighten_leq(row, &negated, f_mid, &mid_box, cs)
            }
            RowRelation::Eq0 => {
                if !self.tighten_leq(row, &coeffs, -f_mid, &mid_box, cs) {
                    return false;
                }
                let negated: Vec<(usize, Interval)> =
                    coeffs.iter().map(|(d, g)| (*d, -*g)).collect();
                self.tighten_leq(row, &negated, f_mid, &mid_box, cs)
            }
        }
    }

    // Tightens every dimension against Σᵢ aᵢ·(xᵢ − mᵢ) ≤ rhs.ub.
    fn tighten_leq(
        &self,
        row: &Row,
        coeffs: &[(usize, Interval)],
        rhs: Interval,
        mid_box: &IntervalBox,
        cs: &mut ContractorStatus,
    ) -> bool {
        for (k, (j, aj)) in coeffs.iter().enumerate() {
            if aj.contains(0.0) {
                continue;
            }
            let mut rest = rhs;
            for (i, (dim, ai)) in coeffs.iter().enumerate() {
                if i == k {
                    continue;
                }
                let y = cs.current()[*dim] - mid_box[*dim].lb;
                rest = rest - *ai * y;
            }
            if !rest.ub.is_finite() {
                continue;
            }
            let half = Interval::new(f64::NEG_INFINITY, rest.ub);
            let proj_y = half / *aj;
            let cand = proj_y + mid_box[*j].lb;
            let old = cs.current()[*j];
            let new = old.intersect(&cand);
            if new.is_empty() {
                cs.current_mut().set_empty();
                cs.output_mut().fill();
                cs.add_used_constraint(row.formula.clone());
                return false;
            }
            if new != old {
                cs.current_mut()[*j] = new;
                cs.output_mut().add(*j);
                cs.add_used_constraint(row.formula.clone());
            }
        }
        true
    }
}

impl fmt::Display for PolytopeContractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Polytope(")?;
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", row.formula)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use d5_core::expr::{abs as eabs, powi};
    use d5_core::{geq, leq, Variable};

    #[test]
    fn test_linear_constraint_tightens() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        // x + y <= 1 on [0, 10]^2: both variables drop to [0, 1].
        let f = leq(x + y, Expression::constant(1.0));
        let b = IntervalBox::new([
            (xv, Interval::new(0.0, 10.0)),
            (yv, Interval::new(0.0, 10.0)),
        ]);
        let p = PolytopeContractor::new(vec![f], &b, &Config::default());
        assert!(!p.is_dummy());
        let mut cs = ContractorStatus::new(b, 0);
        p.prune(&mut cs);
        assert!(cs.current()[0].ub <= 1.0 + 1e-6, "{}", cs.current()[0]);
        assert!(cs.current()[1].ub <= 1.0 + 1e-6, "{}", cs.current()[1]);
        assert!(!cs.used_constraints().is_empty());
    }

    #[test]
    fn test_infeasible_linear_system() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let fs = vec![
            leq(x.clone(), Expression::constant(-1.0)),
            geq(x, Expression::constant(1.0)),
        ];
        let b = IntervalBox::new([(xv, Interval::new(-10.0, 10.0))]);
        let p = PolytopeContractor::new(fs, &b, &Config::default());
        let mut cs = ContractorStatus::new(b, 0);
        p.prune(&mut cs);
        assert!(cs.current().is_empty());
    }

    #[test]
    fn test_nonlinear_constraint_linearizes() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        // x² <= 4 on [1, 10]: the gradient 2x is strictly positive there,
        // so the relaxation around the midpoint cuts the upper bound.
        let f = leq(powi(x, 2), Expression::constant(4.0));
        let b = IntervalBox::new([(xv, Interval::new(1.0, 10.0))]);
        let p = PolytopeContractor::new(vec![f], &b, &Config::default());
        let mut cs = ContractorStatus::new(b, 0);
        p.prune(&mut cs);
        assert!(cs.current()[0].ub < 10.0);
        assert!(cs.current()[0].contains(2.0));
    }

    #[test]
    fn test_all_dummy_is_noop() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        // abs is not differentiable over its free variable: skipped.
        let f = leq(eabs(x), Expression::constant(1.0));
        let b = IntervalBox::new([(xv, Interval::new(-5.0, 5.0))]);
        let p = PolytopeContractor::new(vec![f], &b, &Config::default());
        assert!(p.is_dummy());
        let mut cs = ContractorStatus::new(b.clone(), 0);
        p.prune(&mut cs);
        assert_eq!(cs.current(), &b);
    }
}
