//! Property tests for the symbolic DAG: hash-consing identity, expansion
//! idempotence and value preservation, identity substitution.

use std::sync::OnceLock;

use proptest::prelude::*;

use d5_core::expr::powi;
use d5_core::{Environment, Expression, ExpressionSubstitution, FormulaSubstitution, Variable};

fn var_x() -> &'static Variable {
    static X: OnceLock<Variable> = OnceLock::new();
    X.get_or_init(|| Variable::new("x"))
}

fn var_y() -> &'static Variable {
    static Y: OnceLock<Variable> = OnceLock::new();
    Y.get_or_init(|| Variable::new("y"))
}

// Small polynomial-ish expressions: constants, two variables, sums,
// products, differences, small powers and division by a non-tiny
// constant.
fn arb_expr() -> impl Strategy<Value = Expression> {
    let leaf = prop_oneof![
        (-3.0..3.0f64).prop_map(Expression::constant),
        Just(Expression::variable(var_x())),
        Just(Expression::variable(var_y())),
    ];
    leaf.prop_recursive(3, 24, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a + b),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a - b),
            (inner.clone(), inner.clone()).prop_map(|(a, b)| a * b),
            (inner.clone(), 0u32..4u32).prop_map(|(a, n)| powi(a, n as i32)),
            (inner, 0.5..3.0f64).prop_map(|(a, k)| a / k),
        ]
    })
}

fn sample_env() -> Environment {
    [(var_x().clone(), 0.7), (var_y().clone(), -1.3)]
        .into_iter()
        .collect()
}

proptest! {
    #[test]
    fn prop_expand_is_idempotent(e in arb_expr()) {
        let once = e.expand().unwrap();
        let twice = once.expand().unwrap();
        prop_assert!(once.same(&twice));
    }

    #[test]
    fn prop_expand_preserves_value(e in arb_expr()) {
        let env = sample_env();
        let v1 = e.evaluate(&env).unwrap();
        let v2 = e.expand().unwrap().evaluate(&env).unwrap();
        let scale = v1.abs().max(v2.abs()).max(1.0);
        prop_assert!(
            (v1 - v2).abs() <= 1e-6 * scale,
            "direct {} vs expanded {}",
            v1,
            v2
        );
    }

    #[test]
    fn prop_identity_substitution(e in arb_expr()) {
        let mut es = ExpressionSubstitution::default();
        es.insert(var_x().clone(), Expression::variable(var_x()));
        es.insert(var_y().clone(), Expression::variable(var_y()));
        let fs = FormulaSubstitution::default();
        let s = e.substitute(&es, &fs).unwrap();
        prop_assert!(s.same(&e));
    }

    #[test]
    fn prop_differentiation_of_polynomials_matches_finite_difference(
        e in arb_expr()
    ) {
        prop_assume!(e.is_polynomial());
        let d = e.differentiate(var_x()).unwrap();
        let env = sample_env();
        let exact = d.evaluate(&env).unwrap();

        let h = 1e-5;
        let at = |xv: f64| -> f64 {
            let env: Environment =
                [(var_x().clone(), xv), (var_y().clone(), -1.3)].into_iter().collect();
            e.evaluate(&env).unwrap()
        };
        let approx = (at(0.7 + h) - at(0.7 - h)) / (2.0 * h);
        let scale = exact.abs().max(approx.abs()).max(1.0);
        prop_assert!(
            (exact - approx).abs() <= 1e-3 * scale,
            "exact {} vs approx {}",
            exact,
            approx
        );
    }
}
