//! Hash-consed symbolic expressions over the reals.
//!
//! An [`Expression`] is a cheap-clone handle onto an immutable, interned
//! DAG cell. Structural equality coincides with pointer identity: the
//! smart constructors normalize their operands (n-ary additions and
//! multiplications with canonically ordered operand maps, eager identity
//! and constant folding) and intern the result, so two equal expressions
//! are always the same allocation.
//!
//! Associative operators are kept in normalized n-ary form:
//! an addition is `c + Σᵢ aᵢ·tᵢ` (constant plus term→coefficient map) and
//! a multiplication is `c · Πᵢ bᵢ^eᵢ` (constant times base→exponent map),
//! with operands ordered by the structural total order on expressions.
//! `x + x` builds `2·x` and `x · x` builds `x²`.

// These constructors build DAG nodes, not perform operations.
// Implementing std::ops traits would be semantically incorrect.
#![allow(clippy::should_implement_trait)]

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHasher};

use crate::environment::Environment;
use crate::error::{SymbolicError, SymbolicResult};
use crate::formula::Formula;
use crate::intern::Interner;
use crate::variable::{Variable, VariableType, Variables};

/// A substitution from variables to expressions.
pub type ExpressionSubstitution = FxHashMap<Variable, Expression>;
/// A substitution from Boolean variables to formulas.
pub type FormulaSubstitution = FxHashMap<Variable, Formula>;

/// The payload of an expression cell.
///
/// Nodes are only ever built by the smart constructors on [`Expression`];
/// pattern matching on `ExprNode` is the supported way to traverse a DAG.
#[derive(Debug)]
pub enum ExprNode {
    /// A floating-point constant. Never NaN.
    Constant(f64),
    /// A real constant the front end could not represent exactly, kept as
    /// the pair of adjacent doubles `[lb, ub]` with `ub = nextafter(lb, +∞)`.
    /// One side is flagged as the representative used for point evaluation
    /// and display.
    RealConstant {
        /// Lower witness.
        lb: f64,
        /// Upper witness, exactly one ulp above `lb`.
        ub: f64,
        /// Whether `lb` is the representative side.
        use_lb: bool,
    },
    /// A variable reference. Never dummy, never Boolean.
    Var(Variable),
    /// Normalized n-ary addition: `constant + Σ coeff·term`.
    Add {
        /// The absorbed constant part.
        constant: f64,
        /// Term to coefficient, canonically ordered. Coefficients are
        /// non-zero and terms are never `Add` cells themselves.
        terms: BTreeMap<Expression, f64>,
    },
    /// Normalized n-ary multiplication: `constant · Π base^exponent`.
    Mul {
        /// The absorbed constant factor. Never zero.
        constant: f64,
        /// Base to exponent, canonically ordered. Exponents are never the
        /// constant zero and bases are never `Mul` cells themselves.
        factors: BTreeMap<Expression, Expression>,
    },
    /// Division.
    Div(Expression, Expression),
    /// Natural logarithm.
    Log(Expression),
    /// Absolute value.
    Abs(Expression),
    /// Exponential.
    Exp(Expression),
    /// Square root.
    Sqrt(Expression),
    /// Power.
    Pow(Expression, Expression),
    /// Sine.
    Sin(Expression),
    /// Cosine.
    Cos(Expression),
    /// Tangent.
    Tan(Expression),
    /// Arcsine.
    Asin(Expression),
    /// Arccosine.
    Acos(Expression),
    /// Arctangent.
    Atan(Expression),
    /// Two-argument arctangent `atan2(y, x)`.
    Atan2(Expression, Expression),
    /// Hyperbolic sine.
    Sinh(Expression),
    /// Hyperbolic cosine.
    Cosh(Expression),
    /// Hyperbolic tangent.
    Tanh(Expression),
    /// Binary minimum.
    Min(Expression, Expression),
    /// Binary maximum.
    Max(Expression, Expression),
    /// Conditional expression.
    IfThenElse(Formula, Expression, Expression),
    /// An uninterpreted function symbol applied to a set of variables.
    UninterpretedFunction {
        /// Function name.
        name: Arc<str>,
        /// The argument variables it captures.
        variables: Variables,
    },
    /// The overflow sentinel. Evaluating, expanding, substituting or
    /// differentiating it fails.
    NaN,
}

/// An interned expression cell.
#[derive(Debug)]
pub struct ExprCell {
    id: u64,
    hash: u64,
    is_polynomial: bool,
    node: ExprNode,
}

/// A symbolic expression: a shared handle onto an interned cell.
#[derive(Debug, Clone)]
pub struct Expression(Arc<ExprCell>);

// ---------------------------------------------------------------------------
// Interning
// ---------------------------------------------------------------------------

static EXPR_INTERNER: OnceLock<Mutex<Interner<ExprCell>>> = OnceLock::new();

fn interner() -> &'static Mutex<Interner<ExprCell>> {
    EXPR_INTERNER.get_or_init(|| Mutex::new(Interner::new()))
}

fn kind_rank(node: &ExprNode) -> u8 {
    match node {
        ExprNode::Constant(_) => 0,
        ExprNode::RealConstant { .. } => 1,
        ExprNode::Var(_) => 2,
        ExprNode::Add { .. } => 3,
        ExprNode::Mul { .. } => 4,
        ExprNode::Div(..) => 5,
        ExprNode::Log(_) => 6,
        ExprNode::Abs(_) => 7,
        ExprNode::Exp(_) => 8,
        ExprNode::Sqrt(_) => 9,
        ExprNode::Pow(..) => 10,
        ExprNode::Sin(_) => 11,
        ExprNode::Cos(_) => 12,
        ExprNode::Tan(_) => 13,
        ExprNode::Asin(_) => 14,
        ExprNode::Acos(_) => 15,
        ExprNode::Atan(_) => 16,
        ExprNode::Atan2(..) => 17,
        ExprNode::Sinh(_) => 18,
        ExprNode::Cosh(_) => 19,
        ExprNode::Tanh(_) => 20,
        ExprNode::Min(..) => 21,
        ExprNode::Max(..) => 22,
        ExprNode::IfThenElse(..) => 23,
        ExprNode::UninterpretedFunction { .. } => 24,
        ExprNode::NaN => 25,
    }
}

fn content_hash(node: &ExprNode) -> u64 {
    let mut h = FxHasher::default();
    kind_rank(node).hash(&mut h);
    match node {
        ExprNode::Constant(v) => v.to_bits().hash(&mut h),
        ExprNode::RealConstant { lb, ub, use_lb } => {
            lb.to_bits().hash(&mut h);
            ub.to_bits().hash(&mut h);
            use_lb.hash(&mut h);
        }
        ExprNode::Var(v) => v.id().hash(&mut h),
        ExprNode::Add { constant, terms } => {
            constant.to_bits().hash(&mut h);
            for (t, c) in terms {
                t.hash_value().hash(&mut h);
                c.to_bits().hash(&mut h);
            }
        }
        ExprNode::Mul { constant, factors } => {
            constant.to_bits().hash(&mut h);
            for (b, e) in factors {
                b.hash_value().hash(&mut h);
                e.hash_value().hash(&mut h);
            }
        }
        ExprNode::Div(a, b)
        | ExprNode::Pow(a, b)
        | ExprNode::Atan2(a, b)
        | ExprNode::Min(a, b)
        | ExprNode::Max(a, b) => {
            a.hash_value().hash(&mut h);
            b.hash_value().hash(&mut h);
        }
        ExprNode::Log(e)
        | ExprNode::Abs(e)
        | ExprNode::Exp(e)
        | ExprNode::Sqrt(e)
        | ExprNode::Sin(e)
        | ExprNode::Cos(e)
        | ExprNode::Tan(e)
        | ExprNode::Asin(e)
        | ExprNode::Acos(e)
        | ExprNode::Atan(e)
        | ExprNode::Sinh(e)
        | ExprNode::Cosh(e)
        | ExprNode::Tanh(e) => e.hash_value().hash(&mut h),
        ExprNode::IfThenElse(c, a, b) => {
            c.hash_value().hash(&mut h);
            a.hash_value().hash(&mut h);
            b.hash_value().hash(&mut h);
        }
        ExprNode::UninterpretedFunction { name, variables } => {
            name.hash(&mut h);
            for v in variables.iter() {
                v.id().hash(&mut h);
            }
        }
        ExprNode::NaN => 41u64.hash(&mut h),
    }
    h.finish()
}

fn determine_polynomial(node: &ExprNode) -> bool {
    match node {
        ExprNode::Constant(_) | ExprNode::RealConstant { .. } | ExprNode::Var(_) => true,
        ExprNode::Add { terms, .. } => terms.keys().all(Expression::is_polynomial),
        ExprNode::Mul { factors, .. } => factors
            .iter()
            .all(|(b, e)| pow_is_polynomial(b, e)),
        ExprNode::Div(a, b) => a.is_polynomial() && matches!(b.node(), ExprNode::Constant(_)),
        ExprNode::Pow(b, e) => pow_is_polynomial(b, e),
        _ => false,
    }
}

// base^exponent is polynomial iff base is polynomial and the exponent is a
// constant non-negative integer.
fn pow_is_polynomial(base: &Expression, exponent: &Expression) -> bool {
    if !base.is_polynomial() {
        return false;
    }
    match exponent.node() {
        ExprNode::Constant(v) => is_non_negative_integer(*v),
        _ => false,
    }
}

fn is_integer(v: f64) -> bool {
    v >= i32::MIN as f64 && v <= i32::MAX as f64 && v.fract() == 0.0
}

fn is_non_negative_integer(v: f64) -> bool {
    v >= 0.0 && is_integer(v)
}

// Shallow structural equality: payloads by value, children by identity.
fn shallow_eq(a: &ExprNode, b: &ExprNode) -> bool {
    use ExprNode::*;
    match (a, b) {
        (Constant(x), Constant(y)) => x.to_bits() == y.to_bits(),
        (
            RealConstant { lb: l1, ub: u1, use_lb: r1 },
            RealConstant { lb: l2, ub: u2, use_lb: r2 },
        ) => l1 == l2 && u1 == u2 && r1 == r2,
        (Var(x), Var(y)) => x == y,
        (Add { constant: c1, terms: t1 }, Add { constant: c2, terms: t2 }) => {
            c1.to_bits() == c2.to_bits()
                && t1.len() == t2.len()
                && t1
                    .iter()
                    .zip(t2.iter())
                    .all(|((e1, a1), (e2, a2))| e1.same(e2) && a1.to_bits() == a2.to_bits())
        }
        (Mul { constant: c1, factors: f1 }, Mul { constant: c2, factors: f2 }) => {
            c1.to_bits() == c2.to_bits()
                && f1.len() == f2.len()
                && f1
                    .iter()
                    .zip(f2.iter())
                    .all(|((b1, e1), (b2, e2))| b1.same(b2) && e1.same(e2))
        }
        (Div(a1, b1), Div(a2, b2))
        | (Pow(a1, b1), Pow(a2, b2))
        | (Atan2(a1, b1), Atan2(a2, b2))
        | (Min(a1, b1), Min(a2, b2))
        | (Max(a1, b1), Max(a2, b2)) => a1.same(a2) && b1.same(b2),
        (Log(x), Log(y))
        | (Abs(x), Abs(y))
        | (Exp(x), Exp(y))
        | (Sqrt(x), Sqrt(y))
        | (Sin(x), Sin(y))
        | (Cos(x), Cos(y))
        | (Tan(x), Tan(y))
        | (Asin(x), Asin(y))
        | (Acos(x), Acos(y))
        | (Atan(x), Atan(y))
        | (Sinh(x), Sinh(y))
        | (Cosh(x), Cosh(y))
        | (Tanh(x), Tanh(y)) => x.same(y),
        (IfThenElse(c1, a1, b1), IfThenElse(c2, a2, b2)) => {
            c1.same(c2) && a1.same(a2) && b1.same(b2)
        }
        (
            UninterpretedFunction { name: n1, variables: v1 },
            UninterpretedFunction { name: n2, variables: v2 },
        ) => n1 == n2 && v1 == v2,
        (NaN, NaN) => true,
        _ => false,
    }
}

fn intern(node: ExprNode) -> Expression {
    let hash = content_hash(&node);
    let is_polynomial = determine_polynomial(&node);
    let cell = interner().lock().intern(
        hash,
        node,
        |c, node| shallow_eq(&c.node, node),
        |id, node| ExprCell {
            id,
            hash,
            is_polynomial,
            node,
        },
    );
    Expression(cell)
}

// ---------------------------------------------------------------------------
// Handle basics
// ---------------------------------------------------------------------------

impl Expression {
    /// The constant zero.
    pub fn zero() -> Expression {
        Expression::constant(0.0)
    }

    /// The constant one.
    pub fn one() -> Expression {
        Expression::constant(1.0)
    }

    /// Build a floating-point constant. `v` must not be NaN.
    pub fn constant(v: f64) -> Expression {
        debug_assert!(!v.is_nan(), "NaN passed to Expression::constant");
        intern(ExprNode::Constant(v))
    }

    /// Build a real constant represented by the adjacent pair `[lb, ub]`.
    pub fn real_constant(lb: f64, ub: f64, use_lb: bool) -> Expression {
        debug_assert!(!lb.is_nan() && !ub.is_nan());
        debug_assert!(lb < ub && next_up(lb) == ub, "[lb, ub] must be adjacent doubles");
        intern(ExprNode::RealConstant { lb, ub, use_lb })
    }

    /// Build a variable reference. The variable must be neither the dummy
    /// sentinel nor Boolean-typed.
    pub fn variable(v: &Variable) -> Expression {
        debug_assert!(!v.is_dummy(), "dummy variable in an expression");
        debug_assert!(
            v.var_type() != VariableType::Boolean,
            "Boolean variable in an expression"
        );
        intern(ExprNode::Var(v.clone()))
    }

    /// The NaN sentinel cell.
    pub fn nan() -> Expression {
        intern(ExprNode::NaN)
    }

    /// The cell payload, for traversal.
    #[inline]
    pub fn node(&self) -> &ExprNode {
        &self.0.node
    }

    /// Interner-assigned id, unique per distinct expression.
    #[inline]
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Precomputed content hash.
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.0.hash
    }

    /// Whether the expression is convertible to polynomial form.
    #[inline]
    pub fn is_polynomial(&self) -> bool {
        self.0.is_polynomial
    }

    /// Pointer identity. Equivalent to `==` thanks to hash-consing.
    #[inline]
    pub fn same(&self, other: &Expression) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// True iff this is a `Constant` cell.
    pub fn is_constant(&self) -> bool {
        matches!(self.node(), ExprNode::Constant(_))
    }

    /// The value of a `Constant` cell, if it is one.
    pub fn constant_value(&self) -> Option<f64> {
        match self.node() {
            ExprNode::Constant(v) => Some(*v),
            _ => None,
        }
    }

    /// The set of variables occurring in this expression.
    pub fn variables(&self) -> Variables {
        let mut vars = Variables::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, out: &mut Variables) {
        match self.node() {
            ExprNode::Constant(_) | ExprNode::RealConstant { .. } | ExprNode::NaN => {}
            ExprNode::Var(v) => out.insert(v.clone()),
            ExprNode::Add { terms, .. } => {
                for t in terms.keys() {
                    t.collect_variables(out);
                }
            }
            ExprNode::Mul { factors, .. } => {
                for (b, e) in factors {
                    b.collect_variables(out);
                    e.collect_variables(out);
                }
            }
            ExprNode::Div(a, b)
            | ExprNode::Pow(a, b)
            | ExprNode::Atan2(a, b)
            | ExprNode::Min(a, b)
            | ExprNode::Max(a, b) => {
                a.collect_variables(out);
                b.collect_variables(out);
            }
            ExprNode::Log(e)
            | ExprNode::Abs(e)
            | ExprNode::Exp(e)
            | ExprNode::Sqrt(e)
            | ExprNode::Sin(e)
            | ExprNode::Cos(e)
            | ExprNode::Tan(e)
            | ExprNode::Asin(e)
            | ExprNode::Acos(e)
            | ExprNode::Atan(e)
            | ExprNode::Sinh(e)
            | ExprNode::Cosh(e)
            | ExprNode::Tanh(e) => e.collect_variables(out),
            ExprNode::IfThenElse(c, a, b) => {
                out.extend(c.free_variables());
                a.collect_variables(out);
                b.collect_variables(out);
            }
            ExprNode::UninterpretedFunction { variables, .. } => out.extend(variables.clone()),
        }
    }
}

impl PartialEq for Expression {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Expression {}

impl Hash for Expression {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl PartialOrd for Expression {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Expression {
    /// The structural total order: lexicographic on (kind, payload,
    /// children). Used to canonicalize n-ary operands.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        if self.same(other) {
            return CmpOrdering::Equal;
        }
        let (lhs, rhs) = (self.node(), other.node());
        match kind_rank(lhs).cmp(&kind_rank(rhs)) {
            CmpOrdering::Equal => {}
            ord => return ord,
        }
        use ExprNode::*;
        match (lhs, rhs) {
            (Constant(x), Constant(y)) => x.total_cmp(y),
            (
                RealConstant { lb: l1, ub: u1, use_lb: r1 },
                RealConstant { lb: l2, ub: u2, use_lb: r2 },
            ) => l1
                .total_cmp(l2)
                .then(u1.total_cmp(u2))
                .then(r1.cmp(r2)),
            (Var(x), Var(y)) => x.cmp(y),
            (Add { constant: c1, terms: t1 }, Add { constant: c2, terms: t2 }) => c1
                .total_cmp(c2)
                .then_with(|| cmp_term_maps(t1, t2)),
            (Mul { constant: c1, factors: f1 }, Mul { constant: c2, factors: f2 }) => c1
                .total_cmp(c2)
                .then_with(|| f1.iter().cmp(f2.iter())),
            (Div(a1, b1), Div(a2, b2))
            | (Pow(a1, b1), Pow(a2, b2))
            | (Atan2(a1, b1), Atan2(a2, b2))
            | (Min(a1, b1), Min(a2, b2))
            | (Max(a1, b1), Max(a2, b2)) => a1.cmp(a2).then_with(|| b1.cmp(b2)),
            (Log(x), Log(y))
            | (Abs(x), Abs(y))
            | (Exp(x), Exp(y))
            | (Sqrt(x), Sqrt(y))
            | (Sin(x), Sin(y))
            | (Cos(x), Cos(y))
            | (Tan(x), Tan(y))
            | (Asin(x), Asin(y))
            | (Acos(x), Acos(y))
            | (Atan(x), Atan(y))
            | (Sinh(x), Sinh(y))
            | (Cosh(x), Cosh(y))
            | (Tanh(x), Tanh(y)) => x.cmp(y),
            (IfThenElse(c1, a1, b1), IfThenElse(c2, a2, b2)) => c1
                .cmp(c2)
                .then_with(|| a1.cmp(a2))
                .then_with(|| b1.cmp(b2)),
            (
                UninterpretedFunction { name: n1, variables: v1 },
                UninterpretedFunction { name: n2, variables: v2 },
            ) => n1.cmp(n2).then_with(|| {
                v1.iter().cmp(v2.iter())
            }),
            (NaN, NaN) => CmpOrdering::Equal,
            _ => unreachable!("kind ranks already compared"),
        }
    }
}

fn cmp_term_maps(a: &BTreeMap<Expression, f64>, b: &BTreeMap<Expression, f64>) -> CmpOrdering {
    let mut ia = a.iter();
    let mut ib = b.iter();
    loop {
        match (ia.next(), ib.next()) {
            (None, None) => return CmpOrdering::Equal,
            (None, Some(_)) => return CmpOrdering::Less,
            (Some(_), None) => return CmpOrdering::Greater,
            (Some((e1, c1)), Some((e2, c2))) => match e1.cmp(e2).then(c1.total_cmp(c2)) {
                CmpOrdering::Equal => {}
                ord => return ord,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Factories for the normalized n-ary cells
// ---------------------------------------------------------------------------

/// Accumulates operands of an addition into normalized form.
#[derive(Default)]
pub(crate) struct AddFactory {
    constant: f64,
    terms: BTreeMap<Expression, f64>,
}

impl AddFactory {
    pub(crate) fn new() -> Self {
        AddFactory::default()
    }

    /// Fold `e` into the running sum.
    pub(crate) fn add_expression(&mut self, e: &Expression) {
        match e.node() {
            ExprNode::Constant(v) => self.constant += v,
            ExprNode::Add { constant, terms } => {
                self.constant += constant;
                for (t, c) in terms {
                    self.add_term(t.clone(), *c);
                }
            }
            ExprNode::Mul { constant, factors } if *constant != 1.0 => {
                // Strip the constant coefficient: k·m is a term m with
                // coefficient k.
                let stripped = mul_from_parts(1.0, factors.clone());
                self.add_term(stripped, *constant);
            }
            _ => self.add_term(e.clone(), 1.0),
        }
    }

    /// Fold `coeff · e` into the running sum.
    pub(crate) fn add_scaled(&mut self, coeff: f64, e: &Expression) {
        if coeff == 0.0 {
            return;
        }
        match e.node() {
            ExprNode::Constant(v) => self.constant += coeff * v,
            ExprNode::Add { constant, terms } => {
                self.constant += coeff * constant;
                for (t, c) in terms {
                    self.add_term(t.clone(), coeff * c);
                }
            }
            ExprNode::Mul { constant, factors } if *constant != 1.0 => {
                let stripped = mul_from_parts(1.0, factors.clone());
                self.add_term(stripped, coeff * constant);
            }
            _ => self.add_term(e.clone(), coeff),
        }
    }

    fn add_term(&mut self, term: Expression, coeff: f64) {
        let entry = self.terms.entry(term).or_insert(0.0);
        *entry += coeff;
    }

    pub(crate) fn build(mut self) -> Expression {
        self.terms.retain(|_, c| *c != 0.0);
        if self.terms.is_empty() {
            return Expression::constant(self.constant);
        }
        if self.constant == 0.0 && self.terms.len() == 1 {
            let (term, coeff) = self.terms.iter().next().unwrap();
            if *coeff == 1.0 {
                return term.clone();
            }
            // A single scaled term is a multiplication, not an addition.
            let (term, coeff) = (term.clone(), *coeff);
            return mul(Expression::constant(coeff), term);
        }
        intern(ExprNode::Add {
            constant: self.constant,
            terms: self.terms,
        })
    }
}

/// Accumulates operands of a multiplication into normalized form.
pub(crate) struct MulFactory {
    constant: f64,
    factors: BTreeMap<Expression, Expression>,
}

impl MulFactory {
    pub(crate) fn new() -> Self {
        MulFactory {
            constant: 1.0,
            factors: BTreeMap::new(),
        }
    }

    /// Fold `e` into the running product.
    pub(crate) fn mul_expression(&mut self, e: &Expression) {
        match e.node() {
            ExprNode::Constant(v) => self.constant *= v,
            ExprNode::Mul { constant, factors } => {
                self.constant *= constant;
                for (b, ex) in factors {
                    self.mul_factor(b.clone(), ex.clone());
                }
            }
            ExprNode::Pow(b, ex) => self.mul_factor(b.clone(), ex.clone()),
            _ => self.mul_factor(e.clone(), Expression::one()),
        }
    }

    pub(crate) fn mul_factor(&mut self, base: Expression, exponent: Expression) {
        match self.factors.remove(&base) {
            Some(existing) => {
                // Merge exponents: b^m · b^n = b^(m+n).
                let merged = add(existing, exponent);
                if merged.constant_value() != Some(0.0) {
                    self.factors.insert(base, merged);
                }
            }
            None => {
                if exponent.constant_value() != Some(0.0) {
                    self.factors.insert(base, exponent);
                }
            }
        }
    }

    pub(crate) fn build(self) -> Expression {
        if self.constant == 0.0 {
            return Expression::zero();
        }
        if self.factors.is_empty() {
            return Expression::constant(self.constant);
        }
        if self.constant == 1.0 && self.factors.len() == 1 {
            let (base, exponent) = self.factors.into_iter().next().unwrap();
            return pow_cell(base, exponent);
        }
        intern(ExprNode::Mul {
            constant: self.constant,
            factors: self.factors,
        })
    }
}

fn mul_from_parts(constant: f64, factors: BTreeMap<Expression, Expression>) -> Expression {
    if factors.is_empty() || constant == 0.0 {
        return Expression::constant(constant);
    }
    if constant == 1.0 && factors.len() == 1 {
        let (base, exponent) = factors.into_iter().next().unwrap();
        return pow_cell(base, exponent);
    }
    intern(ExprNode::Mul { constant, factors })
}

// pow without re-entering the MulFactory; applies e^0 and e^1 only.
fn pow_cell(base: Expression, exponent: Expression) -> Expression {
    match exponent.constant_value() {
        Some(v) if v == 0.0 => Expression::one(),
        Some(v) if v == 1.0 => base,
        _ => intern(ExprNode::Pow(base, exponent)),
    }
}

// ---------------------------------------------------------------------------
// Smart constructors
// ---------------------------------------------------------------------------

/// `e1 + e2` in normalized form.
pub fn add(e1: Expression, e2: Expression) -> Expression {
    let mut fac = AddFactory::new();
    fac.add_expression(&e1);
    fac.add_expression(&e2);
    fac.build()
}

/// `-e`, represented as `(-1)·e`.
pub fn neg(e: Expression) -> Expression {
    mul(Expression::constant(-1.0), e)
}

/// `e1 - e2`, represented as `e1 + (-1)·e2`.
pub fn sub(e1: Expression, e2: Expression) -> Expression {
    add(e1, neg(e2))
}

/// `e1 · e2` in normalized form.
pub fn mul(e1: Expression, e2: Expression) -> Expression {
    let mut fac = MulFactory::new();
    fac.mul_expression(&e1);
    fac.mul_expression(&e2);
    fac.build()
}

/// `e1 / e2`, with the eager identities `e/1 = e` and `0/e = 0`.
pub fn div(e1: Expression, e2: Expression) -> Expression {
    if e2.constant_value() == Some(1.0) {
        return e1;
    }
    if e1.constant_value() == Some(0.0) {
        return Expression::zero();
    }
    if let (Some(a), Some(b)) = (e1.constant_value(), e2.constant_value()) {
        if b != 0.0 {
            return Expression::constant(a / b);
        }
    }
    intern(ExprNode::Div(e1, e2))
}

/// `pow(base, exponent)`, with `e^0 = 1`, `e^1 = e` and constant folding.
pub fn pow(base: Expression, exponent: Expression) -> Expression {
    if let (Some(b), Some(e)) = (base.constant_value(), exponent.constant_value()) {
        // Fold only when the result is a well-defined real.
        let v = b.powf(e);
        if !v.is_nan() {
            return Expression::constant(v);
        }
    }
    pow_cell(base, exponent)
}

/// `pow(base, n)` for a constant exponent.
pub fn powi(base: Expression, n: i32) -> Expression {
    pow(base, Expression::constant(n as f64))
}

macro_rules! unary_ctor {
    ($(#[$doc:meta])* $name:ident, $node:ident, $fold:expr) => {
        $(#[$doc])*
        pub fn $name(e: Expression) -> Expression {
            if let Some(v) = e.constant_value() {
                #[allow(clippy::redundant_closure_call)]
                let folded: f64 = ($fold)(v);
                if !folded.is_nan() {
                    return Expression::constant(folded);
                }
            }
            intern(ExprNode::$node(e))
        }
    };
}

unary_ctor!(
    /// Natural logarithm.
    log, Log, |v: f64| v.ln()
);
unary_ctor!(
    /// Absolute value.
    abs, Abs, |v: f64| v.abs()
);
unary_ctor!(
    /// Exponential.
    exp, Exp, |v: f64| v.exp()
);
unary_ctor!(
    /// Square root.
    sqrt, Sqrt, |v: f64| v.sqrt()
);
unary_ctor!(
    /// Sine.
    sin, Sin, |v: f64| v.sin()
);
unary_ctor!(
    /// Cosine.
    cos, Cos, |v: f64| v.cos()
);
unary_ctor!(
    /// Tangent.
    tan, Tan, |v: f64| v.tan()
);
unary_ctor!(
    /// Arcsine.
    asin, Asin, |v: f64| v.asin()
);
unary_ctor!(
    /// Arccosine.
    acos, Acos, |v: f64| v.acos()
);
unary_ctor!(
    /// Arctangent.
    atan, Atan, |v: f64| v.atan()
);
unary_ctor!(
    /// Hyperbolic sine.
    sinh, Sinh, |v: f64| v.sinh()
);
unary_ctor!(
    /// Hyperbolic cosine.
    cosh, Cosh, |v: f64| v.cosh()
);
unary_ctor!(
    /// Hyperbolic tangent.
    tanh, Tanh, |v: f64| v.tanh()
);

/// `atan2(y, x)`.
pub fn atan2(y: Expression, x: Expression) -> Expression {
    if let (Some(a), Some(b)) = (y.constant_value(), x.constant_value()) {
        return Expression::constant(a.atan2(b));
    }
    intern(ExprNode::Atan2(y, x))
}

/// Binary minimum.
pub fn min(e1: Expression, e2: Expression) -> Expression {
    if e1.same(&e2) {
        return e1;
    }
    if let (Some(a), Some(b)) = (e1.constant_value(), e2.constant_value()) {
        return Expression::constant(a.min(b));
    }
    intern(ExprNode::Min(e1, e2))
}

/// Binary maximum.
pub fn max(e1: Expression, e2: Expression) -> Expression {
    if e1.same(&e2) {
        return e1;
    }
    if let (Some(a), Some(b)) = (e1.constant_value(), e2.constant_value()) {
        return Expression::constant(a.max(b));
    }
    intern(ExprNode::Max(e1, e2))
}

/// Conditional expression. A decided condition selects its branch eagerly.
pub fn if_then_else(cond: Formula, then_e: Expression, else_e: Expression) -> Expression {
    if cond.is_true() {
        return then_e;
    }
    if cond.is_false() {
        return else_e;
    }
    intern(ExprNode::IfThenElse(cond, then_e, else_e))
}

/// An uninterpreted function symbol over the given argument variables.
pub fn uninterpreted_function(name: impl Into<Arc<str>>, variables: Variables) -> Expression {
    intern(ExprNode::UninterpretedFunction {
        name: name.into(),
        variables,
    })
}

// ---------------------------------------------------------------------------
// Operator overloads
// ---------------------------------------------------------------------------

impl std::ops::Add for Expression {
    type Output = Expression;
    fn add(self, rhs: Expression) -> Expression {
        add(self, rhs)
    }
}

impl std::ops::Sub for Expression {
    type Output = Expression;
    fn sub(self, rhs: Expression) -> Expression {
        sub(self, rhs)
    }
}

impl std::ops::Mul for Expression {
    type Output = Expression;
    fn mul(self, rhs: Expression) -> Expression {
        mul(self, rhs)
    }
}

impl std::ops::Div for Expression {
    type Output = Expression;
    fn div(self, rhs: Expression) -> Expression {
        div(self, rhs)
    }
}

impl std::ops::Neg for Expression {
    type Output = Expression;
    fn neg(self) -> Expression {
        neg(self)
    }
}

impl std::ops::Add<f64> for Expression {
    type Output = Expression;
    fn add(self, rhs: f64) -> Expression {
        add(self, Expression::constant(rhs))
    }
}

impl std::ops::Add<Expression> for f64 {
    type Output = Expression;
    fn add(self, rhs: Expression) -> Expression {
        add(Expression::constant(self), rhs)
    }
}

impl std::ops::Sub<f64> for Expression {
    type Output = Expression;
    fn sub(self, rhs: f64) -> Expression {
        sub(self, Expression::constant(rhs))
    }
}

impl std::ops::Sub<Expression> for f64 {
    type Output = Expression;
    fn sub(self, rhs: Expression) -> Expression {
        sub(Expression::constant(self), rhs)
    }
}

impl std::ops::Mul<f64> for Expression {
    type Output = Expression;
    fn mul(self, rhs: f64) -> Expression {
        mul(self, Expression::constant(rhs))
    }
}

impl std::ops::Mul<Expression> for f64 {
    type Output = Expression;
    fn mul(self, rhs: Expression) -> Expression {
        mul(Expression::constant(self), rhs)
    }
}

impl std::ops::Div<f64> for Expression {
    type Output = Expression;
    fn div(self, rhs: f64) -> Expression {
        div(self, Expression::constant(rhs))
    }
}

impl std::ops::Div<Expression> for f64 {
    type Output = Expression;
    fn div(self, rhs: Expression) -> Expression {
        div(Expression::constant(self), rhs)
    }
}

impl From<f64> for Expression {
    fn from(v: f64) -> Expression {
        Expression::constant(v)
    }
}

impl From<&Variable> for Expression {
    fn from(v: &Variable) -> Expression {
        Expression::variable(v)
    }
}

// ---------------------------------------------------------------------------
// Point evaluation
// ---------------------------------------------------------------------------

fn eval_pow(v1: f64, v2: f64) -> SymbolicResult<f64> {
    if v1.is_finite() && v1 < 0.0 && v2.is_finite() && !is_integer(v2) {
        return Err(SymbolicError::Domain {
            function: "pow",
            argument: v1,
        });
    }
    Ok(v1.powf(v2))
}

impl Expression {
    /// Evaluate at the point assignment `env`.
    pub fn evaluate(&self, env: &Environment) -> SymbolicResult<f64> {
        match self.node() {
            ExprNode::Constant(v) => Ok(*v),
            ExprNode::RealConstant { lb, ub, use_lb } => Ok(if *use_lb { *lb } else { *ub }),
            ExprNode::Var(v) => env
                .get(v)
                .ok_or_else(|| SymbolicError::UnknownVariable(v.clone())),
            ExprNode::Add { constant, terms } => {
                let mut acc = *constant;
                for (t, c) in terms {
                    acc += c * t.evaluate(env)?;
                }
                Ok(acc)
            }
            ExprNode::Mul { constant, factors } => {
                let mut acc = *constant;
                for (b, e) in factors {
                    acc *= eval_pow(b.evaluate(env)?, e.evaluate(env)?)?;
                }
                Ok(acc)
            }
            ExprNode::Div(a, b) => {
                let v1 = a.evaluate(env)?;
                let v2 = b.evaluate(env)?;
                if v2 == 0.0 {
                    return Err(SymbolicError::DivisionByZero { numerator: v1 });
                }
                Ok(v1 / v2)
            }
            ExprNode::Log(e) => {
                let v = e.evaluate(env)?;
                if v < 0.0 {
                    return Err(SymbolicError::Domain {
                        function: "log",
                        argument: v,
                    });
                }
                Ok(v.ln())
            }
            ExprNode::Abs(e) => Ok(e.evaluate(env)?.abs()),
            ExprNode::Exp(e) => Ok(e.evaluate(env)?.exp()),
            ExprNode::Sqrt(e) => {
                let v = e.evaluate(env)?;
                if v < 0.0 {
                    return Err(SymbolicError::Domain {
                        function: "sqrt",
                        argument: v,
                    });
                }
                Ok(v.sqrt())
            }
            ExprNode::Pow(b, e) => eval_pow(b.evaluate(env)?, e.evaluate(env)?),
            ExprNode::Sin(e) => Ok(e.evaluate(env)?.sin()),
            ExprNode::Cos(e) => Ok(e.evaluate(env)?.cos()),
            ExprNode::Tan(e) => Ok(e.evaluate(env)?.tan()),
            ExprNode::Asin(e) => {
                let v = e.evaluate(env)?;
                if !(-1.0..=1.0).contains(&v) {
                    return Err(SymbolicError::Domain {
                        function: "asin",
                        argument: v,
                    });
                }
                Ok(v.asin())
            }
            ExprNode::Acos(e) => {
                let v = e.evaluate(env)?;
                if !(-1.0..=1.0).contains(&v) {
                    return Err(SymbolicError::Domain {
                        function: "acos",
                        argument: v,
                    });
                }
                Ok(v.acos())
            }
            ExprNode::Atan(e) => Ok(e.evaluate(env)?.atan()),
            ExprNode::Atan2(a, b) => Ok(a.evaluate(env)?.atan2(b.evaluate(env)?)),
            ExprNode::Sinh(e) => Ok(e.evaluate(env)?.sinh()),
            ExprNode::Cosh(e) => Ok(e.evaluate(env)?.cosh()),
            ExprNode::Tanh(e) => Ok(e.evaluate(env)?.tanh()),
            ExprNode::Min(a, b) => Ok(a.evaluate(env)?.min(b.evaluate(env)?)),
            ExprNode::Max(a, b) => Ok(a.evaluate(env)?.max(b.evaluate(env)?)),
            ExprNode::IfThenElse(c, a, b) => {
                if c.evaluate(env)? {
                    a.evaluate(env)
                } else {
                    b.evaluate(env)
                }
            }
            ExprNode::UninterpretedFunction { .. } => {
                Err(SymbolicError::Unevaluable("uninterpreted function"))
            }
            ExprNode::NaN => Err(SymbolicError::NaN("evaluation")),
        }
    }
}

// ---------------------------------------------------------------------------
// Expansion
// ---------------------------------------------------------------------------

// (e1 · e2) with multiplication distributed over addition. Both arguments
// must already be expanded.
fn expand_multiplication(e1: &Expression, e2: &Expression) -> Expression {
    if let ExprNode::Add { constant, terms } = e1.node() {
        let mut fac = AddFactory::new();
        if *constant != 0.0 {
            fac.add_expression(&expand_multiplication(&Expression::constant(*constant), e2));
        }
        for (t, c) in terms {
            let part = mul(Expression::constant(*c), t.clone());
            fac.add_expression(&expand_multiplication(&part, e2));
        }
        return fac.build();
    }
    if matches!(e2.node(), ExprNode::Add { .. }) {
        return expand_multiplication(e2, e1);
    }
    mul(e1.clone(), e2.clone())
}

// pow(base, n) for integer n ≥ 1 via repeated squaring, distributing as it
// goes. `base` must already be expanded.
fn expand_pow_int(base: &Expression, n: i32) -> Expression {
    debug_assert!(n >= 1);
    if n == 1 {
        return base.clone();
    }
    let half = expand_pow_int(base, n / 2);
    let sq = expand_multiplication(&half, &half);
    if n % 2 == 1 {
        expand_multiplication(base, &sq)
    } else {
        sq
    }
}

// pow(base, exponent) with (a + b)^n resolved for constant positive
// integer n. Both arguments must already be expanded.
fn expand_pow(base: &Expression, exponent: &Expression) -> Expression {
    if matches!(base.node(), ExprNode::Add { .. }) {
        if let Some(v) = exponent.constant_value() {
            if v > 0.0 && is_integer(v) {
                return expand_pow_int(base, v as i32);
            }
        }
    }
    pow(base.clone(), exponent.clone())
}

// Pushes a division by the constant `n` inside additions, multiplications
// and nested divisions; other cells keep the division outside.
fn div_by_constant(e: &Expression, n: f64) -> Expression {
    match e.node() {
        ExprNode::Add { constant, terms } => {
            let mut fac = AddFactory::new();
            fac.add_expression(&Expression::constant(constant / n));
            for (t, c) in terms {
                fac.add_scaled(c / n, t);
            }
            fac.build()
        }
        ExprNode::Mul { constant, factors } => mul_from_parts(constant / n, factors.clone()),
        ExprNode::Div(a, b) => match b.constant_value() {
            // (a / m) / n = a / (m·n)
            Some(m) => div_by_constant(a, m * n),
            // (a / b) / n = (a / n) / b
            None => div(div_by_constant(a, n), b.clone()),
        },
        _ => div(e.clone(), Expression::constant(n)),
    }
}

impl Expression {
    /// Distribute multiplications over additions, resolve `(a+b)^n` for
    /// constant non-negative integer `n`, and push divisions by constants
    /// inward. Idempotent; returns a physically identical handle when no
    /// change occurs.
    pub fn expand(&self) -> SymbolicResult<Expression> {
        match self.node() {
            ExprNode::Constant(_)
            | ExprNode::RealConstant { .. }
            | ExprNode::Var(_)
            | ExprNode::UninterpretedFunction { .. } => Ok(self.clone()),
            ExprNode::Add { constant, terms } => {
                let mut fac = AddFactory::new();
                fac.add_expression(&Expression::constant(*constant));
                for (t, c) in terms {
                    let expanded = t.expand()?;
                    fac.add_expression(&expand_multiplication(
                        &Expression::constant(*c),
                        &expanded,
                    ));
                }
                Ok(fac.build())
            }
            ExprNode::Mul { constant, factors } => {
                let mut ret = Expression::constant(*constant);
                for (b, e) in factors {
                    let factor = expand_pow(&b.expand()?, &e.expand()?);
                    ret = expand_multiplication(&ret, &factor);
                }
                Ok(ret)
            }
            ExprNode::Div(a, b) => {
                let a = a.expand()?;
                let b = b.expand()?;
                match b.constant_value() {
                    Some(n) => Ok(div_by_constant(&a, n)),
                    None => Ok(div(a, b)),
                }
            }
            ExprNode::Log(e) => Ok(log(e.expand()?)),
            ExprNode::Abs(e) => Ok(abs(e.expand()?)),
            ExprNode::Exp(e) => Ok(exp(e.expand()?)),
            ExprNode::Sqrt(e) => Ok(sqrt(e.expand()?)),
            ExprNode::Pow(b, e) => Ok(expand_pow(&b.expand()?, &e.expand()?)),
            ExprNode::Sin(e) => Ok(sin(e.expand()?)),
            ExprNode::Cos(e) => Ok(cos(e.expand()?)),
            ExprNode::Tan(e) => Ok(tan(e.expand()?)),
            ExprNode::Asin(e) => Ok(asin(e.expand()?)),
            ExprNode::Acos(e) => Ok(acos(e.expand()?)),
            ExprNode::Atan(e) => Ok(atan(e.expand()?)),
            ExprNode::Atan2(a, b) => Ok(atan2(a.expand()?, b.expand()?)),
            ExprNode::Sinh(e) => Ok(sinh(e.expand()?)),
            ExprNode::Cosh(e) => Ok(cosh(e.expand()?)),
            ExprNode::Tanh(e) => Ok(tanh(e.expand()?)),
            ExprNode::Min(a, b) => Ok(min(a.expand()?, b.expand()?)),
            ExprNode::Max(a, b) => Ok(max(a.expand()?, b.expand()?)),
            // Conditionals are opaque to expansion.
            ExprNode::IfThenElse(..) => Ok(self.clone()),
            ExprNode::NaN => Err(SymbolicError::NaN("expansion")),
        }
    }
}

// ---------------------------------------------------------------------------
// Differentiation
// ---------------------------------------------------------------------------

// ∂/∂x pow(f, g), split on which parts are constant.
fn differentiate_pow(f: &Expression, g: &Expression, x: &Variable) -> SymbolicResult<Expression> {
    if g.is_constant() {
        // ∂/∂x f^n = n · f^(n-1) · f'
        let n = g.constant_value().unwrap();
        return Ok(mul(
            mul(g.clone(), pow(f.clone(), Expression::constant(n - 1.0))),
            f.differentiate(x)?,
        ));
    }
    if f.is_constant() {
        // ∂/∂x n^g = log(n) · n^g · g'
        return Ok(mul(
            mul(log(f.clone()), pow(f.clone(), g.clone())),
            g.differentiate(x)?,
        ));
    }
    // General case:
    //   ∂/∂x f^g = f^(g-1) · (g·f' + log(f)·f·g')
    Ok(mul(
        pow(f.clone(), sub(g.clone(), Expression::one())),
        add(
            mul(g.clone(), f.differentiate(x)?),
            mul(mul(log(f.clone()), f.clone()), g.differentiate(x)?),
        ),
    ))
}

impl Expression {
    /// Symbolic partial derivative with respect to `x`.
    ///
    /// `abs`, `min`, `max`, conditionals and uninterpreted functions are
    /// only differentiable when `x` does not occur free in them; otherwise
    /// this fails with [`SymbolicError::NotDifferentiable`].
    pub fn differentiate(&self, x: &Variable) -> SymbolicResult<Expression> {
        match self.node() {
            ExprNode::Var(v) => {
                if v == x {
                    Ok(Expression::one())
                } else {
                    Ok(Expression::zero())
                }
            }
            ExprNode::Constant(_) | ExprNode::RealConstant { .. } => Ok(Expression::zero()),
            ExprNode::Add { terms, .. } => {
                // ∂/∂x (c + Σ aᵢtᵢ) = Σ aᵢ·tᵢ'
                let mut fac = AddFactory::new();
                for (t, c) in terms {
                    fac.add_scaled(*c, &t.differentiate(x)?);
                }
                Ok(fac.build())
            }
            ExprNode::Mul { constant, factors } => {
                // Product rule over the n-ary form: for each factor bᵢ^eᵢ,
                // differentiate it and multiply by the remaining factors.
                let mut fac = AddFactory::new();
                for (b, e) in factors {
                    let d = differentiate_pow(b, e, x)?;
                    let mut rest = MulFactory::new();
                    rest.mul_expression(&Expression::constant(*constant));
                    for (b2, e2) in factors {
                        if !b2.same(b) {
                            rest.mul_factor(b2.clone(), e2.clone());
                        }
                    }
                    fac.add_expression(&mul(rest.build(), d));
                }
                Ok(fac.build())
            }
            ExprNode::Div(f, g) => {
                // ∂/∂x (f/g) = (f'·g - f·g') / g²
                let num = sub(
                    mul(f.differentiate(x)?, g.clone()),
                    mul(f.clone(), g.differentiate(x)?),
                );
                Ok(div(num, powi(g.clone(), 2)))
            }
            ExprNode::Log(f) => Ok(div(f.differentiate(x)?, f.clone())),
            ExprNode::Abs(_) => self.differentiate_opaque(x),
            ExprNode::Exp(f) => Ok(mul(exp(f.clone()), f.differentiate(x)?)),
            ExprNode::Sqrt(f) => {
                // 1 / (2·sqrt(f)) · f'
                Ok(mul(
                    div(Expression::one(), mul(Expression::constant(2.0), sqrt(f.clone()))),
                    f.differentiate(x)?,
                ))
            }
            ExprNode::Pow(f, g) => differentiate_pow(f, g, x),
            ExprNode::Sin(f) => Ok(mul(cos(f.clone()), f.differentiate(x)?)),
            ExprNode::Cos(f) => Ok(mul(neg(sin(f.clone())), f.differentiate(x)?)),
            ExprNode::Tan(f) => Ok(mul(
                div(Expression::one(), powi(cos(f.clone()), 2)),
                f.differentiate(x)?,
            )),
            ExprNode::Asin(f) => Ok(mul(
                div(
                    Expression::one(),
                    sqrt(sub(Expression::one(), powi(f.clone(), 2))),
                ),
                f.differentiate(x)?,
            )),
            ExprNode::Acos(f) => Ok(mul(
                neg(div(
                    Expression::one(),
                    sqrt(sub(Expression::one(), powi(f.clone(), 2))),
                )),
                f.differentiate(x)?,
            )),
            ExprNode::Atan(f) => Ok(mul(
                div(Expression::one(), add(Expression::one(), powi(f.clone(), 2))),
                f.differentiate(x)?,
            )),
            ExprNode::Atan2(f, g) => {
                // (g·f' - f·g') / (f² + g²)
                let num = sub(
                    mul(g.clone(), f.differentiate(x)?),
                    mul(f.clone(), g.differentiate(x)?),
                );
                Ok(div(num, add(powi(f.clone(), 2), powi(g.clone(), 2))))
            }
            ExprNode::Sinh(f) => Ok(mul(cosh(f.clone()), f.differentiate(x)?)),
            ExprNode::Cosh(f) => Ok(mul(sinh(f.clone()), f.differentiate(x)?)),
            ExprNode::Tanh(f) => Ok(mul(
                div(Expression::one(), powi(cosh(f.clone()), 2)),
                f.differentiate(x)?,
            )),
            ExprNode::Min(..) | ExprNode::Max(..) | ExprNode::IfThenElse(..) => {
                self.differentiate_opaque(x)
            }
            ExprNode::UninterpretedFunction { variables, .. } => {
                if variables.contains(x) {
                    Err(self.not_differentiable(x))
                } else {
                    Ok(Expression::zero())
                }
            }
            ExprNode::NaN => Err(SymbolicError::NaN("differentiation")),
        }
    }

    // Derivative of a cell with no continuous derivative: zero when x does
    // not occur free, an error otherwise.
    fn differentiate_opaque(&self, x: &Variable) -> SymbolicResult<Expression> {
        if self.variables().contains(x) {
            Err(self.not_differentiable(x))
        } else {
            Ok(Expression::zero())
        }
    }

    fn not_differentiable(&self, x: &Variable) -> SymbolicError {
        SymbolicError::NotDifferentiable {
            expression: self.to_string(),
            variable: x.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Substitution
// ---------------------------------------------------------------------------

impl Expression {
    /// Apply the substitutions to every variable occurrence. Untouched
    /// sub-DAGs are returned as-is (pointer identity through interning).
    pub fn substitute(
        &self,
        expr_subst: &ExpressionSubstitution,
        formula_subst: &FormulaSubstitution,
    ) -> SymbolicResult<Expression> {
        match self.node() {
            ExprNode::Constant(_) | ExprNode::RealConstant { .. } => Ok(self.clone()),
            ExprNode::Var(v) => Ok(expr_subst.get(v).cloned().unwrap_or_else(|| self.clone())),
            ExprNode::Add { constant, terms } => {
                let mut fac = AddFactory::new();
                fac.add_expression(&Expression::constant(*constant));
                for (t, c) in terms {
                    fac.add_scaled(*c, &t.substitute(expr_subst, formula_subst)?);
                }
                Ok(fac.build())
            }
            ExprNode::Mul { constant, factors } => {
                let mut fac = MulFactory::new();
                fac.mul_expression(&Expression::constant(*constant));
                for (b, e) in factors {
                    fac.mul_expression(&pow(
                        b.substitute(expr_subst, formula_subst)?,
                        e.substitute(expr_subst, formula_subst)?,
                    ));
                }
                Ok(fac.build())
            }
            ExprNode::Div(a, b) => Ok(div(
                a.substitute(expr_subst, formula_subst)?,
                b.substitute(expr_subst, formula_subst)?,
            )),
            ExprNode::Log(e) => Ok(log(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Abs(e) => Ok(abs(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Exp(e) => Ok(exp(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Sqrt(e) => Ok(sqrt(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Pow(a, b) => Ok(pow(
                a.substitute(expr_subst, formula_subst)?,
                b.substitute(expr_subst, formula_subst)?,
            )),
            ExprNode::Sin(e) => Ok(sin(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Cos(e) => Ok(cos(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Tan(e) => Ok(tan(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Asin(e) => Ok(asin(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Acos(e) => Ok(acos(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Atan(e) => Ok(atan(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Atan2(a, b) => Ok(atan2(
                a.substitute(expr_subst, formula_subst)?,
                b.substitute(expr_subst, formula_subst)?,
            )),
            ExprNode::Sinh(e) => Ok(sinh(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Cosh(e) => Ok(cosh(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Tanh(e) => Ok(tanh(e.substitute(expr_subst, formula_subst)?)),
            ExprNode::Min(a, b) => Ok(min(
                a.substitute(expr_subst, formula_subst)?,
                b.substitute(expr_subst, formula_subst)?,
            )),
            ExprNode::Max(a, b) => Ok(max(
                a.substitute(expr_subst, formula_subst)?,
                b.substitute(expr_subst, formula_subst)?,
            )),
            ExprNode::IfThenElse(c, a, b) => Ok(if_then_else(
                c.substitute(expr_subst, formula_subst)?,
                a.substitute(expr_subst, formula_subst)?,
                b.substitute(expr_subst, formula_subst)?,
            )),
            ExprNode::UninterpretedFunction { name, variables } => {
                // The fresh symbol captures the union of the free variables
                // of whatever was substituted for each captured argument.
                let mut new_vars = Variables::new();
                for v in variables.iter() {
                    if v.var_type() == VariableType::Boolean {
                        match formula_subst.get(v) {
                            Some(f) => new_vars.extend(f.free_variables()),
                            None => new_vars.insert(v.clone()),
                        }
                    } else {
                        match expr_subst.get(v) {
                            Some(e) => new_vars.extend(e.variables()),
                            None => new_vars.insert(v.clone()),
                        }
                    }
                }
                Ok(uninterpreted_function(name.clone(), new_vars))
            }
            ExprNode::NaN => Err(SymbolicError::NaN("substitution")),
        }
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.node() {
            ExprNode::Constant(v) => write!(f, "{v}"),
            ExprNode::RealConstant { lb, ub, .. } => write!(f, "[{lb}, {ub}]"),
            ExprNode::Var(v) => write!(f, "{v}"),
            ExprNode::Add { constant, terms } => {
                write!(f, "(")?;
                let mut first = true;
                if *constant != 0.0 {
                    write!(f, "{constant}")?;
                    first = false;
                }
                for (t, c) in terms {
                    if first {
                        if *c == 1.0 {
                            write!(f, "{t}")?;
                        } else if *c == -1.0 {
                            write!(f, "-{t}")?;
                        } else {
                            write!(f, "{c} * {t}")?;
                        }
                        first = false;
                    } else if *c == 1.0 {
                        write!(f, " + {t}")?;
                    } else if *c == -1.0 {
                        write!(f, " - {t}")?;
                    } else if *c < 0.0 {
                        write!(f, " - {} * {t}", -c)?;
                    } else {
                        write!(f, " + {c} * {t}")?;
                    }
                }
                write!(f, ")")
            }
            ExprNode::Mul { constant, factors } => {
                write!(f, "(")?;
                let mut first = true;
                if *constant == -1.0 {
                    write!(f, "-")?;
                } else if *constant != 1.0 {
                    write!(f, "{constant}")?;
                    first = false;
                }
                for (b, e) in factors {
                    if !first {
                        write!(f, " * ")?;
                    }
                    first = false;
                    if e.constant_value() == Some(1.0) {
                        write!(f, "{b}")?;
                    } else {
                        write!(f, "pow({b}, {e})")?;
                    }
                }
                write!(f, ")")
            }
            ExprNode::Div(a, b) => write!(f, "({a} / {b})"),
            ExprNode::Log(e) => write!(f, "log({e})"),
            ExprNode::Abs(e) => write!(f, "abs({e})"),
            ExprNode::Exp(e) => write!(f, "exp({e})"),
            ExprNode::Sqrt(e) => write!(f, "sqrt({e})"),
            ExprNode::Pow(a, b) => write!(f, "pow({a}, {b})"),
            ExprNode::Sin(e) => write!(f, "sin({e})"),
            ExprNode::Cos(e) => write!(f, "cos({e})"),
            ExprNode::Tan(e) => write!(f, "tan({e})"),
            ExprNode::Asin(e) => write!(f, "asin({e})"),
            ExprNode::Acos(e) => write!(f, "acos({e})"),
            ExprNode::Atan(e) => write!(f, "atan({e})"),
            ExprNode::Atan2(a, b) => write!(f, "atan2({a}, {b})"),
            ExprNode::Sinh(e) => write!(f, "sinh({e})"),
            ExprNode::Cosh(e) => write!(f, "cosh({e})"),
            ExprNode::Tanh(e) => write!(f, "tanh({e})"),
            ExprNode::Min(a, b) => write!(f, "min({a}, {b})"),
            ExprNode::Max(a, b) => write!(f, "max({a}, {b})"),
            ExprNode::IfThenElse(c, a, b) => write!(f, "(if {c} then {a} else {b})"),
            ExprNode::UninterpretedFunction { name, variables } => {
                write!(f, "{name}({variables})")
            }
            ExprNode::NaN => write!(f, "NaN"),
        }
    }
}

// The next representable double above `v`, for the adjacency check on
// real-constant cells.
fn next_up(v: f64) -> f64 {
    if v.is_nan() || v == f64::INFINITY {
        return v;
    }
    let bits = if v == 0.0 {
        1
    } else if v > 0.0 {
        v.to_bits() + 1
    } else {
        v.to_bits() - 1
    };
    f64::from_bits(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x_var() -> Variable {
        Variable::new("x")
    }

    #[test]
    fn test_hash_consing_identity() {
        let x = x_var();
        let e1 = Expression::variable(&x) + Expression::constant(1.0);
        let e2 = Expression::constant(1.0) + Expression::variable(&x);
        // Commuted operands intern to the same cell.
        assert!(e1.same(&e2));
        assert_eq!(e1, e2);
    }

    #[test]
    fn test_x_plus_x_is_two_x() {
        let x = Expression::variable(&x_var());
        let sum = x.clone() + x.clone();
        let two_x = 2.0 * x;
        assert_eq!(sum, two_x);
    }

    #[test]
    fn test_x_times_x_is_x_squared() {
        let x = Expression::variable(&x_var());
        let prod = x.clone() * x.clone();
        assert_eq!(prod, powi(x, 2));
    }

    #[test]
    fn test_eager_identities() {
        let x = Expression::variable(&x_var());
        assert_eq!(Expression::zero() + x.clone(), x);
        assert_eq!(Expression::one() * x.clone(), x);
        assert_eq!(x.clone() / 1.0, x);
        assert_eq!(powi(x.clone(), 0), Expression::one());
        assert_eq!(powi(x.clone(), 1), x);
        assert_eq!(0.0 * x.clone(), Expression::zero());
        assert_eq!(0.0 / x, Expression::zero());
    }

    #[test]
    fn test_polynomial_flags() {
        let x = Expression::variable(&x_var());
        assert!(x.is_polynomial());
        assert!(powi(x.clone(), 3).is_polynomial());
        assert!(!pow(x.clone(), Expression::constant(0.5)).is_polynomial());
        assert!((x.clone() / 2.0).is_polynomial());
        assert!(!(2.0 / x.clone()).is_polynomial());
        assert!(!sin(x).is_polynomial());
    }

    #[test]
    fn test_point_evaluation() {
        let xv = x_var();
        let x = Expression::variable(&xv);
        let e = powi(x.clone(), 2) + 3.0 * x.clone() + 1.0;
        let env: Environment = [(xv, 2.0)].into_iter().collect();
        assert_eq!(e.evaluate(&env).unwrap(), 11.0);
    }

    #[test]
    fn test_evaluate_unknown_variable() {
        let x = Expression::variable(&x_var());
        let env = Environment::new();
        assert!(matches!(
            x.evaluate(&env),
            Err(SymbolicError::UnknownVariable(_))
        ));
    }

    #[test]
    fn test_evaluate_domain_errors() {
        let xv = x_var();
        let x = Expression::variable(&xv);
        let env: Environment = [(xv, -4.0)].into_iter().collect();
        assert!(matches!(
            sqrt(x.clone()).evaluate(&env),
            Err(SymbolicError::Domain { function: "sqrt", .. })
        ));
        assert!(matches!(
            log(x.clone()).evaluate(&env),
            Err(SymbolicError::Domain { function: "log", .. })
        ));
        assert!(matches!(
            (Expression::one() / x).evaluate(&env),
            Ok(v) if v == -0.25
        ));
    }

    #[test]
    fn test_evaluate_division_by_zero() {
        let xv = x_var();
        let x = Expression::variable(&xv);
        let env: Environment = [(xv, 0.0)].into_iter().collect();
        assert!(matches!(
            (Expression::one() / x).evaluate(&env),
            Err(SymbolicError::DivisionByZero { .. })
        ));
    }

    #[test]
    fn test_nan_cell_fails_everywhere() {
        let n = Expression::nan();
        let env = Environment::new();
        assert!(matches!(n.evaluate(&env), Err(SymbolicError::NaN(_))));
        assert!(matches!(n.expand(), Err(SymbolicError::NaN(_))));
        assert!(matches!(
            n.differentiate(&x_var()),
            Err(SymbolicError::NaN(_))
        ));
        let es = ExpressionSubstitution::default();
        let fs = FormulaSubstitution::default();
        assert!(matches!(n.substitute(&es, &fs), Err(SymbolicError::NaN(_))));
    }

    #[test]
    fn test_expand_cube() {
        // (x + y)^3 = x^3 + 3x^2y + 3xy^2 + y^3
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let e = powi(x.clone() + y.clone(), 3);
        let expanded = e.expand().unwrap();
        let expected = powi(x.clone(), 3)
            + 3.0 * powi(x.clone(), 2) * y.clone()
            + 3.0 * x.clone() * powi(y.clone(), 2)
            + powi(y.clone(), 3);
        assert_eq!(expanded, expected);

        let env: Environment = [(xv, 2.0), (yv, 3.0)].into_iter().collect();
        assert_eq!(e.evaluate(&env).unwrap(), 125.0);
        assert_eq!(expanded.evaluate(&env).unwrap(), 125.0);
    }

    #[test]
    fn test_expand_idempotent() {
        let x = Expression::variable(&Variable::new("x"));
        let y = Expression::variable(&Variable::new("y"));
        let e = (x.clone() + y.clone()) * (x.clone() - y.clone()) + powi(x + 1.0, 2) / 2.0;
        let once = e.expand().unwrap();
        let twice = once.expand().unwrap();
        assert!(once.same(&twice));
    }

    #[test]
    fn test_expand_division_pushdown() {
        // (x + y) / 2 = x/2 + y/2
        let x = Expression::variable(&Variable::new("x"));
        let y = Expression::variable(&Variable::new("y"));
        let e = (x.clone() + y.clone()) / 2.0;
        let expanded = e.expand().unwrap();
        assert_eq!(expanded, 0.5 * x + 0.5 * y);
    }

    #[test]
    fn test_differentiate_polynomial() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        // d/dx (x^3 + 2x) = 3x^2 + 2
        let e = powi(x.clone(), 3) + 2.0 * x.clone();
        let d = e.differentiate(&xv).unwrap();
        assert_eq!(d, 3.0 * powi(x, 2) + 2.0);
    }

    #[test]
    fn test_differentiate_finite_difference() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let e = powi(x.clone(), 2) * y.clone() + x.clone() * powi(y, 3);
        let d = e.differentiate(&xv).unwrap();

        let h = 1e-6;
        let at = |xval: f64| -> f64 {
            let env: Environment = [(xv.clone(), xval), (yv.clone(), 1.5)].into_iter().collect();
            e.evaluate(&env).unwrap()
        };
        let env: Environment = [(xv.clone(), 0.7), (yv.clone(), 1.5)].into_iter().collect();
        let exact = d.evaluate(&env).unwrap();
        let approx = (at(0.7 + h) - at(0.7 - h)) / (2.0 * h);
        assert!((exact - approx).abs() < 1e-5, "{exact} vs {approx}");
    }

    #[test]
    fn test_differentiate_abs_fails_on_free_variable() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let e = abs(x);
        assert!(matches!(
            e.differentiate(&xv),
            Err(SymbolicError::NotDifferentiable { .. })
        ));
        // But differentiating w.r.t. an unrelated variable is zero.
        let other = Variable::new("y");
        assert_eq!(e.differentiate(&other).unwrap(), Expression::zero());
    }

    #[test]
    fn test_differentiate_trig() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let d = sin(x.clone()).differentiate(&xv).unwrap();
        assert_eq!(d, cos(x));
    }

    #[test]
    fn test_identity_substitution() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let e = sin(x.clone()) + powi(x.clone(), 2);
        let mut es = ExpressionSubstitution::default();
        es.insert(xv, x);
        let fs = FormulaSubstitution::default();
        let s = e.substitute(&es, &fs).unwrap();
        assert!(s.same(&e));
    }

    #[test]
    fn test_substitution_rewrites() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let e = powi(x.clone(), 2) + x.clone();
        let mut es = ExpressionSubstitution::default();
        es.insert(xv, y.clone());
        let fs = FormulaSubstitution::default();
        let s = e.substitute(&es, &fs).unwrap();
        assert_eq!(s, powi(y.clone(), 2) + y);
    }

    #[test]
    fn test_uninterpreted_function_substitution_unions_variables() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let zv = Variable::new("z");
        let uf = uninterpreted_function("f", [xv.clone(), yv.clone()].into_iter().collect());
        let mut es = ExpressionSubstitution::default();
        es.insert(
            xv,
            Expression::variable(&zv) + Expression::variable(&yv),
        );
        let fs = FormulaSubstitution::default();
        let s = uf.substitute(&es, &fs).unwrap();
        match s.node() {
            ExprNode::UninterpretedFunction { variables, .. } => {
                assert!(variables.contains(&yv));
                assert!(variables.contains(&zv));
                assert_eq!(variables.len(), 2);
            }
            _ => panic!("expected uninterpreted function"),
        }
    }

    #[test]
    fn test_real_constant() {
        let lb = 0.1;
        let ub = next_up(lb);
        let rc = Expression::real_constant(lb, ub, true);
        let env = Environment::new();
        assert_eq!(rc.evaluate(&env).unwrap(), lb);
        assert!(rc.is_polynomial());
    }

    #[test]
    fn test_total_order_canonicalizes() {
        let x = Expression::variable(&Variable::new("x"));
        let y = Expression::variable(&Variable::new("y"));
        // Same operands in either order produce the identical cell.
        assert!((x.clone() * y.clone()).same(&(y.clone() * x.clone())));
        assert!((x.clone() + y.clone()).same(&(y + x)));
    }

    #[test]
    fn test_min_max_constant_folding() {
        let a = Expression::constant(2.0);
        let b = Expression::constant(5.0);
        assert_eq!(min(a.clone(), b.clone()), Expression::constant(2.0));
        assert_eq!(max(a, b), Expression::constant(5.0));
    }
}
