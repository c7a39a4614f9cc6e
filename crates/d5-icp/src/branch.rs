//! Branching-dimension selection.
//!
//! `MaxDiam` bisects the widest candidate dimension. `GradientDescent`
//! scores candidates by how much a bisection step is expected to reduce
//! the residual of the undecided constraints, using interval gradients of
//! the residual error functions; when no gradient information is
//! available (non-differentiable residuals, evaluation failure, all-zero
//! scores) it falls back to `MaxDiam`. With local optimization enabled,
//! the scores are refined by a bounded damped descent from the box
//! midpoint.

use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use d5_core::formula::FormulaNode;
use d5_core::{sub, Environment, Expression, Variable};
use d5_interval::eval::{eval, taylor1_eval};
use d5_interval::{BitSet, IntervalBox};

use d5_contractor::Config;

use crate::evaluator::FormulaEvaluator;

/// Memoizes symbolic partial derivatives per (expression, variable), so
/// the gradient heuristic differentiates each residual once per check.
/// `None` records a non-differentiable pair. Released at engine teardown.
#[derive(Default)]
pub struct DiffCache {
    map: FxHashMap<(u64, u64), Option<Expression>>,
}

impl DiffCache {
    /// An empty cache.
    pub fn new() -> DiffCache {
        DiffCache::default()
    }

    /// The derivative of `e` with respect to `v`, or `None` when `e` is
    /// not differentiable in it.
    pub fn derivative(&mut self, e: &Expression, v: &Variable) -> Option<Expression> {
        self.map
            .entry((e.id(), v.id()))
            .or_insert_with(|| e.differentiate(v).ok())
            .clone()
    }
}

/// The candidate dimension with the largest diameter; ties break toward
/// the smallest index. `None` when no candidate is bisectable.
pub fn find_max_diam(b: &IntervalBox, candidates: &BitSet) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for i in candidates.iter() {
        let iv = b[i];
        if !iv.is_bisectable() {
            continue;
        }
        let d = iv.diam();
        if best.map_or(true, |(_, bd)| d > bd) {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i)
}

/// The residual error functions of the undecided constraints, used by the
/// gradient heuristic. Non-relational constraints contribute nothing.
pub fn error_functions(evaluators: &[FormulaEvaluator]) -> Vec<Expression> {
    evaluators
        .iter()
        .filter_map(|ev| match ev.formula().node() {
            FormulaNode::Relational { lhs, rhs, .. } => Some(sub(lhs.clone(), rhs.clone())),
            _ => None,
        })
        .collect()
}

/// Pick a branching dimension by gradient scoring. `None` means the
/// gradient is uninformative and the caller should use [`find_max_diam`].
pub fn find_gradient_descent(
    errors: &[Expression],
    b: &IntervalBox,
    candidates: &BitSet,
    config: &Config,
    cache: &mut DiffCache,
) -> Option<usize> {
    // Residuals whose first-order Taylor enclosure is already within δ
    // cannot drive the branching decision.
    let active: Vec<&Expression> = errors
        .iter()
        .filter(|e| match taylor1_eval(e, b) {
            Ok(t) => t.diam() > config.precision,
            Err(_) => true,
        })
        .collect();

    let moves = if config.use_local_optimization {
        local_descent_moves(errors, b, config)
    } else {
        None
    };

    let mut best: Option<(usize, f64)> = None;
    for i in candidates.iter() {
        let iv = b[i];
        if !iv.is_bisectable() {
            continue;
        }
        let mut score = 0.0;
        for e in &active {
            let Some(grad) = cache.derivative(e, b.variable(i)) else {
                continue;
            };
            let Ok(g) = eval(&grad, b) else {
                continue;
            };
            // The i-th term of the first-order Taylor enclosure: the
            // residual reduction a bisection of this dimension buys.
            score += g.mag() * iv.diam() * 0.5;
        }
        if let Some(m) = &moves {
            // Dimensions the local descent moved far from the midpoint
            // matter more.
            score += (m[i] - iv.mid()).abs();
        }
        if score > 0.0 && best.map_or(true, |(_, bs)| score > bs) {
            best = Some((i, score));
        }
    }
    best.map(|(i, _)| i)
}

// A few damped gradient steps from the box midpoint minimizing the sum of
// squared residuals, bounded by the configured tolerances and time
// budget. Returns the reached point, one value per dimension.
fn local_descent_moves(
    errors: &[Expression],
    b: &IntervalBox,
    config: &Config,
) -> Option<Vec<f64>> {
    const MAX_STEPS: usize = 20;
    let deadline = Instant::now() + Duration::from_secs_f64(config.nlopt_maxtime.max(1e-4));

    let mut point: Vec<f64> = (0..b.size()).map(|i| b[i].mid()).collect();
    let env_of = |p: &[f64]| -> Environment {
        (0..b.size())
            .map(|i| (b.variable(i).clone(), p[i]))
            .collect()
    };
    let objective = |p: &[f64]| -> Option<f64> {
        let env = env_of(p);
        let mut total = 0.0;
        for e in errors {
            let v = e.evaluate(&env).ok()?;
            total += v * v;
        }
        Some(total)
    };

    let mut current = objective(&point)?;
    for _ in 0..MAX_STEPS {
        if Instant::now() >= deadline {
            break;
        }
        // Finite-difference gradient of the squared-residual objective.
        let mut grad = vec![0.0; point.len()];
        for i in 0..point.len() {
            let h = (b[i].diam() * 1e-6).max(1e-9);
            let mut up = point.clone();
            up[i] = (point[i] + h).min(b[i].ub);
            let mut dn = point.clone();
            dn[i] = (point[i] - h).max(b[i].lb);
            grad[i] = if up[i] > dn[i] {
                (objective(&up)? - objective(&dn)?) / (up[i] - dn[i])
            } else {
                0.0
            };
        }
        let norm = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if norm == 0.0 {
            break;
        }
        // Damped step, clamped to the box.
        let step = 0.1;
        let next: Vec<f64> = (0..point.len())
            .map(|i| (point[i] - step * b[i].diam() * grad[i] / norm).clamp(b[i].lb, b[i].ub))
            .collect();
        let next_val = objective(&next)?;
        let improvement = current - next_val;
        if improvement < config.nlopt_ftol_abs
            || improvement < config.nlopt_ftol_rel * current.abs()
        {
            break;
        }
        point = next;
        current = next_val;
    }
    Some(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use d5_core::expr::{abs as eabs, powi};
    use d5_core::{geq, leq, Expression, Variable};
    use d5_interval::Interval;

    fn full(n: usize) -> BitSet {
        let mut s = BitSet::new(n);
        s.fill();
        s
    }

    #[test]
    fn test_find_max_diam_picks_widest() {
        let b = IntervalBox::new([
            (Variable::new("x"), Interval::new(0.0, 1.0)),
            (Variable::new("y"), Interval::new(0.0, 8.0)),
            (Variable::new("z"), Interval::new(0.0, 2.0)),
        ]);
        assert_eq!(find_max_diam(&b, &full(3)), Some(1));
    }

    #[test]
    fn test_find_max_diam_ties_break_low() {
        let b = IntervalBox::new([
            (Variable::new("x"), Interval::new(0.0, 4.0)),
            (Variable::new("y"), Interval::new(0.0, 4.0)),
        ]);
        assert_eq!(find_max_diam(&b, &full(2)), Some(0));
    }

    #[test]
    fn test_find_max_diam_skips_points() {
        let b = IntervalBox::new([
            (Variable::new("x"), Interval::point(1.0)),
            (Variable::new("y"), Interval::new(0.0, 1.0)),
        ]);
        assert_eq!(find_max_diam(&b, &full(2)), Some(1));
        let pinned = IntervalBox::new([(Variable::new("z"), Interval::point(0.0))]);
        assert_eq!(find_max_diam(&pinned, &full(1)), None);
    }

    #[test]
    fn test_gradient_prefers_steep_dimension() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        // The residual 100x + y is far steeper in x.
        let errors = vec![100.0 * x + y];
        let b = IntervalBox::new([
            (xv, Interval::new(0.0, 1.0)),
            (yv, Interval::new(0.0, 1.0)),
        ]);
        let config = Config::default();
        let mut cache = DiffCache::new();
        assert_eq!(
            find_gradient_descent(&errors, &b, &full(2), &config, &mut cache),
            Some(0)
        );
        // A second query hits the memoized derivatives.
        assert_eq!(
            find_gradient_descent(&errors, &b, &full(2), &config, &mut cache),
            Some(0)
        );
    }

    #[test]
    fn test_gradient_falls_back_on_nondifferentiable() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        // |x - 3| has no derivative over its free variable: the score is
        // empty and the caller falls back to max-diam.
        let errors = vec![eabs(x - 3.0)];
        let b = IntervalBox::new([(xv, Interval::new(0.0, 10.0))]);
        let config = Config::default();
        let mut cache = DiffCache::new();
        assert_eq!(
            find_gradient_descent(&errors, &b, &full(1), &config, &mut cache),
            None
        );
    }

    #[test]
    fn test_local_descent_moves_toward_minimum() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        // Residual (x - 2): descending from the midpoint 5 moves toward 2.
        let errors = vec![x - 2.0];
        let b = IntervalBox::new([(xv.clone(), Interval::new(0.0, 10.0))]);
        let mut config = Config::default();
        config.use_local_optimization = true;
        config.nlopt_maxtime = 0.05;
        let moved = local_descent_moves(&errors, &b, &config).unwrap();
        assert!(moved[0] < 5.0);
    }

    #[test]
    fn test_error_functions_only_relational() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let b = IntervalBox::new([(xv, Interval::new(0.0, 1.0))]);
        let config = Config::default();
        let evs = vec![
            FormulaEvaluator::new(leq(x.clone(), Expression::constant(1.0)), &b, &config),
            FormulaEvaluator::new(
                geq(powi(x, 2), Expression::constant(0.5)),
                &b,
                &config,
            ),
        ];
        assert_eq!(error_functions(&evs).len(), 2);
    }
}
