//! End-to-end δ-decision scenarios.

use d5::{
    check_sat, eq, geq, gt, leq, powi, BranchingStrategy, Config, Expression, Interval,
    IntervalBox, Variable,
};
use d5_core::{abs, if_then_else};

fn two_var_box(lo: f64, hi: f64) -> (Variable, Variable, IntervalBox) {
    let xv = Variable::new("x");
    let yv = Variable::new("y");
    let b = IntervalBox::new([
        (xv.clone(), Interval::new(lo, hi)),
        (yv.clone(), Interval::new(lo, hi)),
    ]);
    (xv, yv, b)
}

#[test]
fn test_simple_delta_sat() {
    // x² + y² <= 1  ∧  x + y >= 0.5  on [-2, 2]².
    let (xv, yv, b) = two_var_box(-2.0, 2.0);
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let formulas = [
        leq(
            powi(x.clone(), 2) + powi(y.clone(), 2),
            Expression::constant(1.0),
        ),
        geq(x + y, Expression::constant(0.5)),
    ];
    let config = Config {
        precision: 0.01,
        ..Config::default()
    };
    let witness = check_sat(&formulas, &b, &config).unwrap().expect("delta-sat");
    let mx = witness[0].mid();
    let my = witness[1].mid();
    assert!(mx * mx + my * my <= 1.0 + 0.02, "({mx}, {my})");
    assert!(mx + my >= 0.5 - 0.02, "({mx}, {my})");
}

#[test]
fn test_unsat() {
    // x² + y² <= 1  ∧  x + y >= 3  has no solution on [-2, 2]².
    let (xv, yv, b) = two_var_box(-2.0, 2.0);
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let formulas = [
        leq(
            powi(x.clone(), 2) + powi(y.clone(), 2),
            Expression::constant(1.0),
        ),
        geq(x + y, Expression::constant(3.0)),
    ];
    let config = Config {
        precision: 0.01,
        ..Config::default()
    };
    assert!(check_sat(&formulas, &b, &config).unwrap().is_none());
}

#[test]
fn test_conditional_branching() {
    // ite(x > 0, y, -y) = 2 on [-10, 10]²: the witness has y ≈ 2 with
    // x > 0, or y ≈ -2 with x <= 0.
    let (xv, yv, b) = two_var_box(-10.0, 10.0);
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let ite = if_then_else(gt(x, Expression::zero()), y.clone(), -y);
    let formulas = [eq(ite, Expression::constant(2.0))];
    let config = Config {
        precision: 0.001,
        ..Config::default()
    };
    let witness = check_sat(&formulas, &b, &config).unwrap().expect("delta-sat");
    let mx = witness[0].mid();
    let my = witness[1].mid();
    if mx > 0.0 {
        assert!((my - 2.0).abs() <= 0.01, "x = {mx}, y = {my}");
    } else {
        assert!((my + 2.0).abs() <= 0.01, "x = {mx}, y = {my}");
    }
}

#[test]
fn test_nondifferentiable_residual_is_safe() {
    // |x - 3| <= 0.01 under the gradient-descent strategy: the heuristic
    // quietly degrades to max-diam instead of failing.
    let xv = Variable::new("x");
    let x = Expression::variable(&xv);
    let formulas = [leq(abs(x - 3.0), Expression::constant(0.01))];
    let b = IntervalBox::new([(xv, Interval::new(0.0, 10.0))]);
    let config = Config {
        precision: 0.001,
        branching_strategy: BranchingStrategy::GradientDescent,
        ..Config::default()
    };
    let witness = check_sat(&formulas, &b, &config).unwrap().expect("delta-sat");
    let mx = witness[0].mid();
    assert!((mx - 3.0).abs() <= 0.02, "x = {mx}");
}

#[test]
fn test_parallel_race_agrees_with_sequential() {
    let (xv, yv, b) = two_var_box(-2.0, 2.0);
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let sat_formulas = [
        leq(
            powi(x.clone(), 2) + powi(y.clone(), 2),
            Expression::constant(1.0),
        ),
        geq(x.clone() + y.clone(), Expression::constant(0.5)),
    ];
    let unsat_formulas = [
        leq(powi(x, 2) + powi(y.clone(), 2), Expression::constant(1.0)),
        geq(Expression::variable(&xv) + y, Expression::constant(3.0)),
    ];
    for jobs in [1usize, 2, 4, 8] {
        let config = Config {
            precision: 0.01,
            number_of_jobs: jobs,
            ..Config::default()
        };
        let sat = check_sat(&sat_formulas, &b, &config).unwrap();
        assert!(sat.is_some(), "jobs = {jobs}");
        let unsat = check_sat(&unsat_formulas, &b, &config).unwrap();
        assert!(unsat.is_none(), "jobs = {jobs}");
    }
}

#[test]
fn test_expand_round_trip() {
    // (x + y)³ expands to x³ + 3x²y + 3xy² + y³ and evaluates unchanged.
    let xv = Variable::new("x");
    let yv = Variable::new("y");
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let e = powi(x.clone() + y.clone(), 3);
    let expanded = e.expand().unwrap();
    let expected = powi(x.clone(), 3)
        + 3.0 * powi(x.clone(), 2) * y.clone()
        + 3.0 * x * powi(y.clone(), 2)
        + powi(y, 3);
    assert_eq!(expanded, expected);

    let env: d5::Environment = [(xv, 2.0), (yv, 3.0)].into_iter().collect();
    assert_eq!(e.evaluate(&env).unwrap(), 125.0);
    assert_eq!(expanded.evaluate(&env).unwrap(), 125.0);
}
