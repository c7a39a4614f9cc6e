//! Engine-level integration tests: explicitly wired contractor,
//! evaluators and engines.

use d5_contractor::{make_contractor, BranchingStrategy, Config, ContractorStatus};
use d5_core::expr::powi;
use d5_core::{geq, leq, Expression, Formula, Variable};
use d5_icp::{FormulaEvaluator, Icp, IcpEngine, IcpParallel};
use d5_interval::{Interval, IntervalBox};

fn circle_instance() -> (IntervalBox, Vec<Formula>) {
    let xv = Variable::new("x");
    let yv = Variable::new("y");
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let formulas = vec![
        leq(
            powi(x.clone(), 2) + powi(y.clone(), 2),
            Expression::constant(1.0),
        ),
        geq(x + y, Expression::constant(0.5)),
    ];
    let b = IntervalBox::new([
        (xv, Interval::new(-2.0, 2.0)),
        (yv, Interval::new(-2.0, 2.0)),
    ]);
    (b, formulas)
}

fn evaluators(formulas: &[Formula], b: &IntervalBox, config: &Config) -> Vec<FormulaEvaluator> {
    formulas
        .iter()
        .map(|f| FormulaEvaluator::new(f.clone(), b, config))
        .collect()
}

fn run(config: Config, b: &IntervalBox, formulas: &[Formula]) -> (bool, ContractorStatus) {
    let contractor = make_contractor(formulas, b, &config);
    let evs = evaluators(formulas, b, &config);
    let mut cs = ContractorStatus::new(b.clone(), 0);
    let mut engine = IcpEngine::new(config);
    let sat = engine.check_sat(&contractor, &evs, &mut cs).unwrap();
    (sat, cs)
}

#[test]
fn test_sequential_sat() {
    let (b, formulas) = circle_instance();
    let config = Config {
        precision: 0.01,
        ..Config::default()
    };
    let (sat, cs) = run(config, &b, &formulas);
    assert!(sat);
    assert!(!cs.current().is_empty());
    // The witness midpoint satisfies both constraints within delta.
    let mx = cs.current()[0].mid();
    let my = cs.current()[1].mid();
    assert!(mx * mx + my * my <= 1.0 + 0.02, "({mx}, {my})");
    assert!(mx + my >= 0.5 - 0.02, "({mx}, {my})");
}

#[test]
fn test_sequential_unsat() {
    let xv = Variable::new("x");
    let yv = Variable::new("y");
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let formulas = vec![
        leq(
            powi(x.clone(), 2) + powi(y.clone(), 2),
            Expression::constant(1.0),
        ),
        geq(x + y, Expression::constant(3.0)),
    ];
    let b = IntervalBox::new([
        (xv, Interval::new(-2.0, 2.0)),
        (yv, Interval::new(-2.0, 2.0)),
    ]);
    let config = Config {
        precision: 0.01,
        ..Config::default()
    };
    let (sat, cs) = run(config, &b, &formulas);
    assert!(!sat);
    // The contradiction names at least one constraint.
    assert!(!cs.used_constraints().is_empty());
}

#[test]
fn test_gradient_descent_strategy_sat() {
    let (b, formulas) = circle_instance();
    let config = Config {
        precision: 0.01,
        branching_strategy: BranchingStrategy::GradientDescent,
        ..Config::default()
    };
    let (sat, _) = run(config, &b, &formulas);
    assert!(sat);
}

#[test]
fn test_gradient_descent_with_local_optimization() {
    let (b, formulas) = circle_instance();
    let config = Config {
        precision: 0.01,
        branching_strategy: BranchingStrategy::GradientDescent,
        use_local_optimization: true,
        nlopt_maxtime: 0.01,
        ..Config::default()
    };
    let (sat, _) = run(config, &b, &formulas);
    assert!(sat);
}

#[test]
fn test_polytope_enabled_sat() {
    let (b, formulas) = circle_instance();
    let config = Config {
        precision: 0.01,
        use_polytope: true,
        ..Config::default()
    };
    let (sat, _) = run(config, &b, &formulas);
    assert!(sat);
}

#[test]
fn test_parallel_matches_sequential() {
    let (b, sat_formulas) = circle_instance();

    let xv = Variable::new("x");
    let yv = Variable::new("y");
    let x = Expression::variable(&xv);
    let y = Expression::variable(&yv);
    let unsat_formulas = vec![
        leq(
            powi(x.clone(), 2) + powi(y.clone(), 2),
            Expression::constant(1.0),
        ),
        geq(x + y, Expression::constant(3.0)),
    ];
    let unsat_box = IntervalBox::new([
        (xv, Interval::new(-2.0, 2.0)),
        (yv, Interval::new(-2.0, 2.0)),
    ]);

    for jobs in [1usize, 2, 4] {
        let config = Config {
            precision: 0.01,
            number_of_jobs: jobs,
            ..Config::default()
        };
        let (sat, cs) = run(config.clone(), &b, &sat_formulas);
        assert!(sat, "jobs = {jobs}");
        let mx = cs.current()[0].mid();
        let my = cs.current()[1].mid();
        assert!(mx * mx + my * my <= 1.0 + 0.02);
        assert!(mx + my >= 0.5 - 0.02);

        let (unsat, cs) = run(config, &unsat_box, &unsat_formulas);
        assert!(!unsat, "jobs = {jobs}");
        assert!(cs.current().is_empty());
    }
}

#[test]
fn test_parallel_engine_direct() {
    let (b, formulas) = circle_instance();
    let config = Config {
        precision: 0.01,
        number_of_jobs: 4,
        ..Config::default()
    };
    let contractor = make_contractor(&formulas, &b, &config);
    let evs = evaluators(&formulas, &b, &config);
    let mut cs = ContractorStatus::new(b.clone(), 0);
    let mut engine = IcpParallel::new(config);
    let sat = engine.check_sat(&contractor, &evs, &mut cs).unwrap();
    assert!(sat);
    let stats = engine.stats();
    assert!(stats.num_prune >= 1);
}

#[test]
fn test_stats_accumulate() {
    let (b, formulas) = circle_instance();
    let config = Config {
        precision: 0.01,
        ..Config::default()
    };
    let contractor = make_contractor(&formulas, &b, &config);
    let evs = evaluators(&formulas, &b, &config);
    let mut cs = ContractorStatus::new(b.clone(), 0);
    let mut engine = Icp::new(config);
    assert!(engine.check_sat(&contractor, &evs, &mut cs).unwrap());
    assert!(engine.stats().num_prune >= 1);
}

#[test]
fn test_engine_selection_by_jobs() {
    let seq = IcpEngine::new(Config::default());
    assert!(matches!(seq, IcpEngine::Sequential(_)));
    let par = IcpEngine::new(Config {
        number_of_jobs: 4,
        ..Config::default()
    });
    assert!(matches!(par, IcpEngine::Parallel(_)));
}
