//! Hash-consed first-order formulas over real arithmetic.
//!
//! [`Formula`] mirrors [`Expression`](crate::expr::Expression): a shared
//! handle onto an interned cell, so structural equality is pointer
//! identity. The decision core consumes formulas through
//! [`free_variables`](Formula::free_variables),
//! [`evaluate`](Formula::evaluate) and [`substitute`](Formula::substitute).

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::environment::Environment;
use crate::error::{SymbolicError, SymbolicResult};
use crate::expr::{Expression, ExpressionSubstitution, FormulaSubstitution};
use crate::intern::Interner;
use crate::variable::{Variable, VariableType, Variables};

/// A relational operator between two real expressions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelOp {
    /// `lhs = rhs`
    Eq,
    /// `lhs ≠ rhs`
    Neq,
    /// `lhs > rhs`
    Gt,
    /// `lhs ≥ rhs`
    Geq,
    /// `lhs < rhs`
    Lt,
    /// `lhs ≤ rhs`
    Leq,
}

impl RelOp {
    /// The operator satisfied exactly when `self` is not.
    pub fn negated(self) -> RelOp {
        match self {
            RelOp::Eq => RelOp::Neq,
            RelOp::Neq => RelOp::Eq,
            RelOp::Gt => RelOp::Leq,
            RelOp::Geq => RelOp::Lt,
            RelOp::Lt => RelOp::Geq,
            RelOp::Leq => RelOp::Gt,
        }
    }

    /// Apply the relation to a pair of doubles.
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            RelOp::Eq => lhs == rhs,
            RelOp::Neq => lhs != rhs,
            RelOp::Gt => lhs > rhs,
            RelOp::Geq => lhs >= rhs,
            RelOp::Lt => lhs < rhs,
            RelOp::Leq => lhs <= rhs,
        }
    }
}

impl fmt::Display for RelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelOp::Eq => "=",
            RelOp::Neq => "!=",
            RelOp::Gt => ">",
            RelOp::Geq => ">=",
            RelOp::Lt => "<",
            RelOp::Leq => "<=",
        };
        write!(f, "{s}")
    }
}

/// The payload of a formula cell.
#[derive(Debug)]
pub enum FormulaNode {
    /// The true constant.
    True,
    /// The false constant.
    False,
    /// A Boolean variable.
    Var(Variable),
    /// A relation between two real expressions.
    Relational {
        /// The relational operator.
        op: RelOp,
        /// Left operand.
        lhs: Expression,
        /// Right operand.
        rhs: Expression,
    },
    /// N-ary conjunction. Flattened, at least two operands.
    And(Vec<Formula>),
    /// N-ary disjunction. Flattened, at least two operands.
    Or(Vec<Formula>),
    /// Negation.
    Not(Formula),
    /// Universal quantification over `vars`.
    Forall(Variables, Formula),
}

/// An interned formula cell.
#[derive(Debug)]
pub struct FormulaCell {
    id: u64,
    hash: u64,
    node: FormulaNode,
}

/// A first-order formula: a shared handle onto an interned cell.
#[derive(Debug, Clone)]
pub struct Formula(Arc<FormulaCell>);

static FORMULA_INTERNER: OnceLock<Mutex<Interner<FormulaCell>>> = OnceLock::new();

fn interner() -> &'static Mutex<Interner<FormulaCell>> {
    FORMULA_INTERNER.get_or_init(|| Mutex::new(Interner::new()))
}

fn kind_rank(node: &FormulaNode) -> u8 {
    match node {
        FormulaNode::True => 0,
        FormulaNode::False => 1,
        FormulaNode::Var(_) => 2,
        FormulaNode::Relational { .. } => 3,
        FormulaNode::And(_) => 4,
        FormulaNode::Or(_) => 5,
        FormulaNode::Not(_) => 6,
        FormulaNode::Forall(..) => 7,
    }
}

fn content_hash(node: &FormulaNode) -> u64 {
    let mut h = FxHasher::default();
    kind_rank(node).hash(&mut h);
    match node {
        FormulaNode::True | FormulaNode::False => {}
        FormulaNode::Var(v) => v.id().hash(&mut h),
        FormulaNode::Relational { op, lhs, rhs } => {
            op.hash(&mut h);
            lhs.hash_value().hash(&mut h);
            rhs.hash_value().hash(&mut h);
        }
        FormulaNode::And(fs) | FormulaNode::Or(fs) => {
            for f in fs {
                f.hash_value().hash(&mut h);
            }
        }
        FormulaNode::Not(f) => f.hash_value().hash(&mut h),
        FormulaNode::Forall(vars, f) => {
            for v in vars.iter() {
                v.id().hash(&mut h);
            }
            f.hash_value().hash(&mut h);
        }
    }
    h.finish()
}

fn shallow_eq(a: &FormulaNode, b: &FormulaNode) -> bool {
    use FormulaNode::*;
    match (a, b) {
        (True, True) | (False, False) => true,
        (Var(x), Var(y)) => x == y,
        (
            Relational { op: o1, lhs: l1, rhs: r1 },
            Relational { op: o2, lhs: l2, rhs: r2 },
        ) => o1 == o2 && l1.same(l2) && r1.same(r2),
        (And(x), And(y)) | (Or(x), Or(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(f, g)| f.same(g))
        }
        (Not(x), Not(y)) => x.same(y),
        (Forall(v1, f1), Forall(v2, f2)) => v1 == v2 && f1.same(f2),
        _ => false,
    }
}

fn intern(node: FormulaNode) -> Formula {
    let hash = content_hash(&node);
    let cell = interner().lock().intern(
        hash,
        node,
        |c, node| shallow_eq(&c.node, node),
        |id, node| FormulaCell { id, hash, node },
    );
    Formula(cell)
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

/// Build a relational formula, folding constant operands.
fn relational(op: RelOp, lhs: Expression, rhs: Expression) -> Formula {
    if let (Some(a), Some(b)) = (lhs.constant_value(), rhs.constant_value()) {
        return if op.holds(a, b) {
            Formula::tt()
        } else {
            Formula::ff()
        };
    }
    intern(FormulaNode::Relational { op, lhs, rhs })
}

/// `lhs = rhs`.
pub fn eq(lhs: Expression, rhs: Expression) -> Formula {
    relational(RelOp::Eq, lhs, rhs)
}

/// `lhs ≠ rhs`.
pub fn neq(lhs: Expression, rhs: Expression) -> Formula {
    relational(RelOp::Neq, lhs, rhs)
}

/// `lhs > rhs`.
pub fn gt(lhs: Expression, rhs: Expression) -> Formula {
    relational(RelOp::Gt, lhs, rhs)
}

/// `lhs ≥ rhs`.
pub fn geq(lhs: Expression, rhs: Expression) -> Formula {
    relational(RelOp::Geq, lhs, rhs)
}

/// `lhs < rhs`.
pub fn lt(lhs: Expression, rhs: Expression) -> Formula {
    relational(RelOp::Lt, lhs, rhs)
}

/// `lhs ≤ rhs`.
pub fn leq(lhs: Expression, rhs: Expression) -> Formula {
    relational(RelOp::Leq, lhs, rhs)
}

/// N-ary conjunction with flattening and `true`/`false` absorption.
pub fn and(operands: impl IntoIterator<Item = Formula>) -> Formula {
    let mut flat: Vec<Formula> = Vec::new();
    for f in operands {
        if f.is_true() {
            continue;
        }
        if f.is_false() {
            return Formula::ff();
        }
        if let FormulaNode::And(fs) = f.node() {
            flat.extend(fs.iter().cloned());
        } else {
            flat.push(f);
        }
    }
    flat.sort();
    flat.dedup();
    match flat.len() {
        0 => Formula::tt(),
        1 => flat.pop().unwrap(),
        _ => intern(FormulaNode::And(flat)),
    }
}

/// N-ary disjunction with flattening and `true`/`false` absorption.
pub fn or(operands: impl IntoIterator<Item = Formula>) -> Formula {
    let mut flat: Vec<Formula> = Vec::new();
    for f in operands {
        if f.is_false() {
            continue;
        }
        if f.is_true() {
            return Formula::tt();
        }
        if let FormulaNode::Or(fs) = f.node() {
            flat.extend(fs.iter().cloned());
        } else {
            flat.push(f);
        }
    }
    flat.sort();
    flat.dedup();
    match flat.len() {
        0 => Formula::ff(),
        1 => flat.pop().unwrap(),
        _ => intern(FormulaNode::Or(flat)),
    }
}

/// Negation. Double negations cancel and negated relations fold to their
/// dual operator.
pub fn not(f: Formula) -> Formula {
    if f.is_true() {
        return Formula::ff();
    }
    if f.is_false() {
        return Formula::tt();
    }
    match f.node() {
        FormulaNode::Not(inner) => return inner.clone(),
        FormulaNode::Relational { op, lhs, rhs } => {
            return relational(op.negated(), lhs.clone(), rhs.clone());
        }
        _ => {}
    }
    intern(FormulaNode::Not(f))
}

/// Universal quantification. An empty variable set is the identity.
pub fn forall(vars: Variables, body: Formula) -> Formula {
    if vars.is_empty() {
        return body;
    }
    intern(FormulaNode::Forall(vars, body))
}

impl Formula {
    /// The true constant.
    pub fn tt() -> Formula {
        intern(FormulaNode::True)
    }

    /// The false constant.
    pub fn ff() -> Formula {
        intern(FormulaNode::False)
    }

    /// A Boolean variable as a formula.
    pub fn var(v: &Variable) -> Formula {
        debug_assert!(
            v.var_type() == VariableType::Boolean,
            "formula variable must be Boolean-typed"
        );
        intern(FormulaNode::Var(v.clone()))
    }

    /// The cell payload, for traversal.
    #[inline]
    pub fn node(&self) -> &FormulaNode {
        &self.0.node
    }

    /// Interner-assigned id, unique per distinct formula.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Precomputed content hash.
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.0.hash
    }

    /// Pointer identity. Equivalent to `==` thanks to hash-consing.
    #[inline]
    pub fn same(&self, other: &Formula) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True iff this is the `true` constant.
    pub fn is_true(&self) -> bool {
        matches!(self.node(), FormulaNode::True)
    }

    /// True iff this is the `false` constant.
    pub fn is_false(&self) -> bool {
        matches!(self.node(), FormulaNode::False)
    }

    /// True iff this is a relation between two expressions.
    pub fn is_relational(&self) -> bool {
        matches!(self.node(), FormulaNode::Relational { .. })
    }

    /// True iff this is a universally quantified formula.
    pub fn is_forall(&self) -> bool {
        matches!(self.node(), FormulaNode::Forall(..))
    }

    /// The free variables. Quantified variables are excluded.
    pub fn free_variables(&self) -> Variables {
        match self.node() {
            FormulaNode::True | FormulaNode::False => Variables::new(),
            FormulaNode::Var(v) => [v.clone()].into_iter().collect(),
            FormulaNode::Relational { lhs, rhs, .. } => {
                let mut vars = lhs.variables();
                vars.extend(rhs.variables());
                vars
            }
            FormulaNode::And(fs) | FormulaNode::Or(fs) => {
                let mut vars = Variables::new();
                for f in fs {
                    vars.extend(f.free_variables());
                }
                vars
            }
            FormulaNode::Not(f) => f.free_variables(),
            FormulaNode::Forall(bound, body) => {
                let mut vars = body.free_variables();
                vars.remove_all(bound);
                vars
            }
        }
    }

    /// Evaluate at the point assignment `env`. A Boolean variable is true
    /// iff its binding is non-zero. Quantified formulas have no point
    /// semantics.
    pub fn evaluate(&self, env: &Environment) -> SymbolicResult<bool> {
        match self.node() {
            FormulaNode::True => Ok(true),
            FormulaNode::False => Ok(false),
            FormulaNode::Var(v) => env
                .get(v)
                .map(|x| x != 0.0)
                .ok_or_else(|| SymbolicError::UnknownVariable(v.clone())),
            FormulaNode::Relational { op, lhs, rhs } => {
                Ok(op.holds(lhs.evaluate(env)?, rhs.evaluate(env)?))
            }
            FormulaNode::And(fs) => {
                for f in fs {
                    if !f.evaluate(env)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            FormulaNode::Or(fs) => {
                for f in fs {
                    if f.evaluate(env)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            FormulaNode::Not(f) => Ok(!f.evaluate(env)?),
            FormulaNode::Forall(..) => Err(SymbolicError::Unevaluable("quantified formula")),
        }
    }

    /// Apply the substitutions to every free variable occurrence.
    pub fn substitute(
        &self,
        expr_subst: &ExpressionSubstitution,
        formula_subst: &FormulaSubstitution,
    ) -> SymbolicResult<Formula> {
        match self.node() {
            FormulaNode::True | FormulaNode::False => Ok(self.clone()),
            FormulaNode::Var(v) => Ok(formula_subst
                .get(v)
                .cloned()
                .unwrap_or_else(|| self.clone())),
            FormulaNode::Relational { op, lhs, rhs } => Ok(relational(
                *op,
                lhs.substitute(expr_subst, formula_subst)?,
                rhs.substitute(expr_subst, formula_subst)?,
            )),
            FormulaNode::And(fs) => {
                let subs: SymbolicResult<Vec<_>> = fs
                    .iter()
                    .map(|f| f.substitute(expr_subst, formula_subst))
                    .collect();
                Ok(and(subs?))
            }
            FormulaNode::Or(fs) => {
                let subs: SymbolicResult<Vec<_>> = fs
                    .iter()
                    .map(|f| f.substitute(expr_subst, formula_subst))
                    .collect();
                Ok(or(subs?))
            }
            FormulaNode::Not(f) => Ok(not(f.substitute(expr_subst, formula_subst)?)),
            FormulaNode::Forall(bound, body) => {
                // Quantified variables are bound; shadow them out of the
                // substitutions before descending.
                let filtered_e: ExpressionSubstitution = expr_subst
                    .iter()
                    .filter(|(v, _)| !bound.contains(v))
                    .map(|(v, e)| (v.clone(), e.clone()))
                    .collect();
                let filtered_f: FormulaSubstitution = formula_subst
                    .iter()
                    .filter(|(v, _)| !bound.contains(v))
                    .map(|(v, f)| (v.clone(), f.clone()))
                    .collect();
                Ok(forall(
                    bound.clone(),
                    body.substitute(&filtered_e, &filtered_f)?,
                ))
            }
        }
    }
}

impl PartialEq for Formula {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Formula {}

impl Hash for Formula {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl PartialOrd for Formula {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Formula {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        if self.same(other) {
            return CmpOrdering::Equal;
        }
        let (lhs, rhs) = (self.node(), other.node());
        match kind_rank(lhs).cmp(&kind_rank(rhs)) {
            CmpOrdering::Equal => {}
            ord => return ord,
        }
        use FormulaNode::*;
        match (lhs, rhs) {
            (True, True) | (False, False) => CmpOrdering::Equal,
            (Var(x), Var(y)) => x.cmp(y),
            (
                Relational { op: o1, lhs: l1, rhs: r1 },
                Relational { op: o2, lhs: l2, rhs: r2 },
            ) => o1.cmp(o2).then_with(|| l1.cmp(l2)).then_with(|| r1.cmp(r2)),
            (And(x), And(y)) | (Or(x), Or(y)) => x.iter().cmp(y.iter()),
            (Not(x), Not(y)) => x.cmp(y),
            (Forall(v1, f1), Forall(v2, f2)) => {
                v1.iter().cmp(v2.iter()).then_with(|| f1.cmp(f2))
            }
            _ => unreachable!("kind ranks already compared"),
        }
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            FormulaNode::True => write!(f, "True"),
            FormulaNode::False => write!(f, "False"),
            FormulaNode::Var(v) => write!(f, "{v}"),
            FormulaNode::Relational { op, lhs, rhs } => write!(f, "({lhs} {op} {rhs})"),
            FormulaNode::And(fs) => {
                write!(f, "(")?;
                for (i, g) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " and ")?;
                    }
                    write!(f, "{g}")?;
                }
                write!(f, ")")
            }
            FormulaNode::Or(fs) => {
                write!(f, "(")?;
                for (i, g) in fs.iter().enumerate() {
                    if i > 0 {
                        write!(f, " or ")?;
                    }
                    write!(f, "{g}")?;
                }
                write!(f, ")")
            }
            FormulaNode::Not(g) => write!(f, "!({g})"),
            FormulaNode::Forall(vars, body) => write!(f, "forall({vars}. {body})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::powi;

    #[test]
    fn test_relational_constant_folding() {
        let three = Expression::constant(3.0);
        let five = Expression::constant(5.0);
        assert!(lt(three.clone(), five.clone()).is_true());
        assert!(gt(three, five).is_false());
    }

    #[test]
    fn test_not_folds_relations() {
        let x = Expression::variable(&Variable::new("x"));
        let f = gt(x.clone(), Expression::constant(0.0));
        let negated = not(f);
        match negated.node() {
            FormulaNode::Relational { op, .. } => assert_eq!(*op, RelOp::Leq),
            _ => panic!("expected relational"),
        }
    }

    #[test]
    fn test_double_negation() {
        let x = Variable::with_type("b", VariableType::Boolean);
        let f = Formula::var(&x);
        assert_eq!(not(not(f.clone())), f);
    }

    #[test]
    fn test_and_absorption() {
        let x = Expression::variable(&Variable::new("x"));
        let f = gt(x.clone(), Expression::constant(0.0));
        assert_eq!(and([Formula::tt(), f.clone()]), f);
        assert!(and([Formula::ff(), f.clone()]).is_false());
        assert!(or([Formula::tt(), f.clone()]).is_true());
        assert_eq!(or([Formula::ff(), f.clone()]), f);
    }

    #[test]
    fn test_hash_consing() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let f1 = leq(powi(x.clone(), 2), Expression::constant(1.0));
        let f2 = leq(powi(x, 2), Expression::constant(1.0));
        assert!(f1.same(&f2));
    }

    #[test]
    fn test_free_variables_of_forall() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let body = leq(x, y);
        let f = forall([yv.clone()].into_iter().collect(), body);
        let free = f.free_variables();
        assert!(free.contains(&xv));
        assert!(!free.contains(&yv));
    }

    #[test]
    fn test_evaluate() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let f = and([
            leq(powi(x.clone(), 2), Expression::constant(4.0)),
            gt(x + y, Expression::constant(0.0)),
        ]);
        let env: Environment = [(xv, 1.0), (yv, 0.5)].into_iter().collect();
        assert!(f.evaluate(&env).unwrap());
    }

    #[test]
    fn test_forall_has_no_point_semantics() {
        let xv = Variable::new("x");
        let body = leq(Expression::variable(&xv), Expression::constant(1.0));
        let f = forall([xv].into_iter().collect(), body);
        assert!(matches!(
            f.evaluate(&Environment::new()),
            Err(SymbolicError::Unevaluable(_))
        ));
    }

    #[test]
    fn test_substitute_relational() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let f = lt(Expression::variable(&xv), Expression::constant(1.0));
        let mut es = ExpressionSubstitution::default();
        es.insert(xv, Expression::variable(&yv));
        let fs = FormulaSubstitution::default();
        let g = f.substitute(&es, &fs).unwrap();
        assert_eq!(
            g,
            lt(Expression::variable(&yv), Expression::constant(1.0))
        );
    }

    #[test]
    fn test_substitute_respects_binders() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let body = lt(Expression::variable(&xv), Expression::constant(1.0));
        let f = forall([xv.clone()].into_iter().collect(), body);
        let mut es = ExpressionSubstitution::default();
        es.insert(xv, Expression::variable(&yv));
        let fs = FormulaSubstitution::default();
        // x is bound, so the substitution must not reach it.
        let g = f.substitute(&es, &fs).unwrap();
        assert!(g.same(&f));
    }
}
