//! HC4-style forward/backward contraction for a single relational
//! constraint.
//!
//! At construction the constraint `lhs ⋈ rhs` is normalized to `e ⋈ 0`
//! and `e` is flattened into a topologically ordered node plan (shared
//! sub-DAGs appear once). A prune is one forward interval sweep, an
//! intersection of the root with the relation's half-line, and one
//! backward sweep projecting every node's interval onto its children.
//!
//! Projections are exact inverses for monotone operations, sign-split
//! hulls for even powers and `abs`, and principal-branch period scans for
//! the circular functions. Projections that cannot tighten soundly (a
//! non-degenerate exponent, an undecided conditional) leave the child
//! untouched. Strict inequalities contract as their non-strict
//! counterparts and disequalities yield no contraction.

use std::fmt;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use d5_core::expr::ExprNode;
use d5_core::formula::FormulaNode;
use d5_core::{sub, Expression, Formula, RelOp};
use d5_interval::eval::eval;
use d5_interval::{BitSet, Interval, IntervalBox};

use crate::config::Config;
use crate::status::ContractorStatus;

const PI: f64 = std::f64::consts::PI;
const TWO_PI: f64 = 2.0 * std::f64::consts::PI;
// Outward slack on period-scanned projection branches.
const BRANCH_MARGIN: f64 = 1e-9;

/// Three-valued truth of a formula over a box: `Some(true)` when every
/// point satisfies it, `Some(false)` when no point does, `None` otherwise
/// (including evaluation failures, which are treated as unknown).
pub fn formula_holds(f: &Formula, b: &IntervalBox) -> Option<bool> {
    match f.node() {
        FormulaNode::True => Some(true),
        FormulaNode::False => Some(false),
        FormulaNode::Relational { op, lhs, rhs } => {
            let l = eval(lhs, b).ok()?;
            let r = eval(rhs, b).ok()?;
            if l.is_empty() || r.is_empty() {
                return Some(false);
            }
            match op {
                RelOp::Eq => {
                    if l.is_degenerate() && r.is_degenerate() && l.lb == r.lb {
                        Some(true)
                    } else if l.ub < r.lb || l.lb > r.ub {
                        Some(false)
                    } else {
                        None
                    }
                }
                RelOp::Neq => {
                    if l.ub < r.lb || l.lb > r.ub {
                        Some(true)
                    } else if l.is_degenerate() && r.is_degenerate() && l.lb == r.lb {
                        Some(false)
                    } else {
                        None
                    }
                }
                RelOp::Gt => {
                    if l.lb > r.ub {
                        Some(true)
                    } else if l.ub <= r.lb {
                        Some(false)
                    } else {
                        None
                    }
                }
                RelOp::Geq => {
                    if l.lb >= r.ub {
                        Some(true)
                    } else if l.ub < r.lb {
                        Some(false)
                    } else {
                        None
                    }
                }
                RelOp::Lt => {
                    if l.ub < r.lb {
                        Some(true)
                    } else if l.lb >= r.ub {
                        Some(false)
                    } else {
                        None
                    }
                }
                RelOp::Leq => {
                    if l.ub <= r.lb {
                        Some(true)
                    } else if l.lb > r.ub {
                        Some(false)
                    } else {
                        None
                    }
                }
            }
        }
        FormulaNode::And(fs) => {
            let mut all_true = true;
            for g in fs {
                match formula_holds(g, b) {
                    Some(false) => return Some(false),
                    Some(true) => {}
                    None => all_true = false,
                }
            }
            if all_true {
                Some(true)
            } else {
                None
            }
        }
        FormulaNode::Or(fs) => {
            let mut all_false = true;
            for g in fs {
                match formula_holds(g, b) {
                    Some(true) => return Some(true),
                    Some(false) => {}
                    None => all_false = false,
                }
            }
            if all_false {
                Some(false)
            } else {
                None
            }
        }
        FormulaNode::Not(g) => formula_holds(g, b).map(|v| !v),
        FormulaNode::Var(_) | FormulaNode::Forall(..) => None,
    }
}

// The half-line the constraint's root must stay inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootRelation {
    Eq0,
    Le0,
    Ge0,
}

impl RootRelation {
    fn project(self, r: Interval) -> Interval {
        match self {
            RootRelation::Eq0 => r.intersect(&Interval::point(0.0)),
            RootRelation::Le0 => r.intersect(&Interval::new(f64::NEG_INFINITY, 0.0)),
            RootRelation::Ge0 => r.intersect(&Interval::new(0.0, f64::INFINITY)),
        }
    }
}

#[derive(Debug)]
enum PlanOp {
    Constant(Interval),
    Var(usize),
    Add { constant: f64, terms: Vec<(usize, f64)> },
    Mul { constant: f64, factors: Vec<usize> },
    Div(usize, usize),
    Pow(usize, usize),
    Log(usize),
    Abs(usize),
    Exp(usize),
    Sqrt(usize),
    Sin(usize),
    Cos(usize),
    Tan(usize),
    Asin(usize),
    Acos(usize),
    Atan(usize),
    Atan2(usize, usize),
    Sinh(usize),
    Cosh(usize),
    Tanh(usize),
    Min(usize, usize),
    Max(usize, usize),
    Ite { cond: Formula, then_n: usize, else_n: usize },
    // Unsupported leaf: forward is the whole line, backward is a no-op.
    Opaque,
}

/// Forward/backward contractor for one constraint.
pub struct FwdBwdContractor {
    formula: Formula,
    relation: Option<RootRelation>,
    nodes: Vec<PlanOp>,
    var_dims: Vec<(usize, usize)>, // (node index, box dimension)
    root: usize,
    input: BitSet,
    // Per-worker interval buffers; each worker locks only its own slot.
    slots: Vec<Mutex<Vec<Interval>>>,
}

impl fmt::Debug for FwdBwdContractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FwdBwdContractor")
            .field("formula", &self.formula.to_string())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl FwdBwdContractor {
    /// Build the contraction plan for `f` over the dimensions of `b`.
    pub fn new(f: Formula, b: &IntervalBox, config: &Config) -> FwdBwdContractor {
        let mut input = BitSet::new(b.size());
        for v in f.free_variables().iter() {
            if let Some(i) = b.index_of(v) {
                input.add(i);
            }
        }

        let (relation, expr) = match f.node() {
            FormulaNode::Relational { op, lhs, rhs } => {
                let rel = match op {
                    RelOp::Eq => Some(RootRelation::Eq0),
                    RelOp::Leq | RelOp::Lt => Some(RootRelation::Le0),
                    RelOp::Geq | RelOp::Gt => Some(RootRelation::Ge0),
                    // Disequalities prune nothing.
                    RelOp::Neq => None,
                };
                (rel, Some(sub(lhs.clone(), rhs.clone())))
            }
            _ => (None, None),
        };

        let mut nodes = Vec::new();
        let mut var_dims = Vec::new();
        let root = match (&relation, &expr) {
            (Some(_), Some(e)) => {
                let mut memo = FxHashMap::default();
                flatten(e, b, &mut nodes, &mut var_dims, &mut memo)
            }
            _ => 0,
        };

        let n_jobs = config.number_of_jobs.max(1);
        let slots = (0..n_jobs).map(|_| Mutex::new(Vec::new())).collect();

        FwdBwdContractor {
            formula: f,
            relation,
            nodes,
            var_dims,
            root,
            input,
            slots,
        }
    }

    /// The constraint this contractor enforces.
    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Dimensions this contractor may narrow.
    pub fn input(&self) -> &BitSet {
        &self.input
    }

    /// True iff pruning can never do anything.
    pub fn is_dummy(&self) -> bool {
        self.relation.is_none() || self.input.is_empty()
    }

    /// One forward/backward sweep over the current box.
    pub fn prune(&self, cs: &mut ContractorStatus) {
        let Some(relation) = self.relation else {
            return;
        };
        if self.input.is_empty() || cs.current().is_empty() {
            return;
        }

        let wid = cs.worker_id().min(self.slots.len() - 1);
        let mut guard = self.slots[wid].lock();
        if guard.len() != self.nodes.len() {
            guard.resize(self.nodes.len(), Interval::empty());
        }
        let buf: &mut [Interval] = &mut guard;

        self.forward(buf, cs.current());
        let root_iv = buf[self.root];
        let projected = relation.project(root_iv);
        if projected.is_empty() {
            // The relation cannot hold anywhere in the box.
            self.report_empty(cs);
            return;
        }
        buf[self.root] = projected;

        if !self.backward(buf, cs.current()) {
            self.report_empty(cs);
            return;
        }

        // Write the narrowed variable nodes back into the box.
        let mut changed = false;
        for &(node, dim) in &self.var_dims {
            let old = cs.current()[dim];
            let new = buf[node].intersect(&old);
            if new.is_empty() {
                self.report_empty(cs);
                return;
            }
            if new != old {
                cs.current_mut()[dim] = new;
                cs.output_mut().add(dim);
                changed = true;
            }
        }
        if changed {
            tracing::trace!(constraint = %self.formula, "fwdbwd narrowed box");
            cs.add_used_constraint(self.formula.clone());
        }
    }

    fn report_empty(&self, cs: &mut ContractorStatus) {
        tracing::trace!(constraint = %self.formula, "fwdbwd proved box empty");
        cs.current_mut().set_empty();
        cs.output_mut().fill();
        cs.add_used_constraint(self.formula.clone());
    }

    fn forward(&self, buf: &mut [Interval], b: &IntervalBox) {
        forward_pass(&self.nodes, buf, b);
    }
}

// One forward interval sweep over a flattened plan.
fn forward_pass(nodes: &[PlanOp], buf: &mut [Interval], b: &IntervalBox) {
    for i in 0..nodes.len() {
        buf[i] = match &nodes[i] {
            PlanOp::Constant(iv) => *iv,
            PlanOp::Var(dim) => b[*dim],
            PlanOp::Add { constant, terms } => {
                let mut acc = Interval::point(*constant);
                for (t, k) in terms {
                    acc = acc + buf[*t] * *k;
                }
                acc
            }
            PlanOp::Mul { constant, factors } => {
                let mut acc = Interval::point(*constant);
                for f in factors {
                    acc = acc * buf[*f];
                }
                acc
            }
            PlanOp::Div(a, d) => buf[*a] / buf[*d],
            PlanOp::Pow(base, exp) => pow_forward(buf[*base], buf[*exp]),
            PlanOp::Log(a) => buf[*a].ln(),
            PlanOp::Abs(a) => buf[*a].abs(),
            PlanOp::Exp(a) => buf[*a].exp(),
            PlanOp::Sqrt(a) => buf[*a].sqrt(),
            PlanOp::Sin(a) => buf[*a].sin(),
            PlanOp::Cos(a) => buf[*a].cos(),
            PlanOp::Tan(a) => buf[*a].tan(),
            PlanOp::Asin(a) => buf[*a].asin(),
            PlanOp::Acos(a) => buf[*a].acos(),
            PlanOp::Atan(a) => buf[*a].atan(),
            PlanOp::Atan2(y, x) => buf[*y].atan2(buf[*x]),
            PlanOp::Sinh(a) => buf[*a].sinh(),
            PlanOp::Cosh(a) => buf[*a].cosh(),
            PlanOp::Tanh(a) => buf[*a].tanh(),
            PlanOp::Min(a, c) => buf[*a].min_i(buf[*c]),
            PlanOp::Max(a, c) => buf[*a].max_i(buf[*c]),
            PlanOp::Ite { cond, then_n, else_n } => match formula_holds(cond, b) {
                Some(true) => buf[*then_n],
                Some(false) => buf[*else_n],
                None => buf[*then_n].hull(&buf[*else_n]),
            },
            PlanOp::Opaque => Interval::entire(),
        };
    }
}

impl FwdBwdContractor {
    // Projects every node's interval onto its children, in reverse
    // topological order. Returns false when some node becomes empty.
    fn backward(&self, buf: &mut [Interval], b: &IntervalBox) -> bool {
        for i in (0..self.nodes.len()).rev() {
            let out = buf[i];
            match &self.nodes[i] {
                PlanOp::Constant(_) | PlanOp::Var(_) | PlanOp::Opaque => {}
                PlanOp::Add { constant, terms } => {
                    for (k, (t, coeff)) in terms.iter().enumerate() {
                        let mut rest = Interval::point(*constant);
                        for (j, (t2, c2)) in terms.iter().enumerate() {
                            if j != k {
                                rest = rest + buf[*t2] * *c2;
                            }
                        }
                        let cand = (out - rest) / *coeff;
                        if !narrow(buf, *t, cand) {
                            return false;
                        }
                    }
                }
                PlanOp::Mul { constant, factors } => {
                    for (k, f) in factors.iter().enumerate() {
                        let mut rest = Interval::point(*constant);
                        for (j, f2) in factors.iter().enumerate() {
                            if j != k {
                                rest = rest * buf[*f2];
                            }
                        }
                        let cand = out / rest;
                        if !narrow(buf, *f, cand) {
                            return false;
                        }
                    }
                }
                PlanOp::Div(a, d) => {
                    let (na, nd) = (buf[*a], buf[*d]);
                    if !narrow(buf, *a, out * nd) {
                        return false;
                    }
                    if !narrow(buf, *d, na / out) {
                        return false;
                    }
                }
                PlanOp::Pow(base, exp) => {
                    let e = buf[*exp];
                    if e.is_degenerate() {
                        let cand = pow_backward(buf[*base], out, e.lb);
                        if !narrow(buf, *base, cand) {
                            return false;
                        }
                    }
                }
                PlanOp::Log(a) => {
                    if !narrow(buf, *a, out.exp()) {
                        return false;
                    }
                }
                PlanOp::Abs(a) => {
                    let r = out.intersect(&Interval::new(0.0, f64::INFINITY));
                    let cand = signed_even_inverse(buf[*a], r);
                    if !narrow_to(buf, *a, cand) {
                        return false;
                    }
                }
                PlanOp::Exp(a) => {
                    let cand = out.intersect(&Interval::new(0.0, f64::INFINITY)).ln();
                    if !narrow(buf, *a, cand) {
                        return false;
                    }
                }
                PlanOp::Sqrt(a) => {
                    let r = out.intersect(&Interval::new(0.0, f64::INFINITY));
                    if !narrow(buf, *a, r.sqr()) {
                        return false;
                    }
                }
                PlanOp::Sin(a) => {
                    if !narrow_to(buf, *a, backward_sin(buf[*a], out)) {
                        return false;
                    }
                }
                PlanOp::Cos(a) => {
                    if !narrow_to(buf, *a, backward_cos(buf[*a], out)) {
                        return false;
                    }
                }
                PlanOp::Tan(a) => {
                    if !narrow_to(buf, *a, backward_tan(buf[*a], out)) {
                        return false;
                    }
                }
                PlanOp::Asin(a) => {
                    let r = out.intersect(&Interval::new(
                        -std::f64::consts::FRAC_PI_2,
                        std::f64::consts::FRAC_PI_2,
                    ));
                    if !narrow(buf, *a, r.sin()) {
                        return false;
                    }
                }
                PlanOp::Acos(a) => {
                    let r = out.intersect(&Interval::new(0.0, PI));
                    if !narrow(buf, *a, r.cos()) {
                        return false;
                    }
                }
                PlanOp::Atan(a) => {
                    let r = out.intersect(&Interval::new(
                        -std::f64::consts::FRAC_PI_2,
                        std::f64::consts::FRAC_PI_2,
                    ));
                    if !narrow(buf, *a, r.tan()) {
                        return false;
                    }
                }
                PlanOp::Atan2(..) => {}
                PlanOp::Sinh(a) => {
                    if !narrow(buf, *a, out.asinh()) {
                        return false;
                    }
                }
                PlanOp::Cosh(a) => {
                    let r = out.intersect(&Interval::new(1.0, f64::INFINITY)).acosh();
                    let cand = signed_even_inverse(buf[*a], r);
                    if !narrow_to(buf, *a, cand) {
                        return false;
                    }
                }
                PlanOp::Tanh(a) => {
                    if !narrow(buf, *a, out.atanh()) {
                        return false;
                    }
                }
                PlanOp::Min(a, c) => {
                    let (ia, ic) = (buf[*a], buf[*c]);
                    let floor = Interval::new(out.lb, f64::INFINITY);
                    let mut ca = ia.intersect(&floor);
                    let mut cc = ic.intersect(&floor);
                    // When one side cannot achieve the minimum, the other
                    // must.
                    if ic.lb > out.ub {
                        ca = ca.intersect(&Interval::new(f64::NEG_INFINITY, out.ub));
                    }
                    if ia.lb > out.ub {
                        cc = cc.intersect(&Interval::new(f64::NEG_INFINITY, out.ub));
                    }
                    if !narrow_to(buf, *a, ca) || !narrow_to(buf, *c, cc) {
                        return false;
                    }
                }
                PlanOp::Max(a, c) => {
                    let (ia, ic) = (buf[*a], buf[*c]);
                    let ceil = Interval::new(f64::NEG_INFINITY, out.ub);
                    let mut ca = ia.intersect(&ceil);
                    let mut cc = ic.intersect(&ceil);
                    if ic.ub < out.lb {
                        ca = ca.intersect(&Interval::new(out.lb, f64::INFINITY));
                    }
                    if ia.ub < out.lb {
                        cc = cc.intersect(&Interval::new(out.lb, f64::INFINITY));
                    }
                    if !narrow_to(buf, *a, ca) || !narrow_to(buf, *c, cc) {
                        return false;
                    }
                }
                PlanOp::Ite { cond, then_n, else_n } => match formula_holds(cond, b) {
                    Some(true) => {
                        if !narrow(buf, *then_n, out) {
                            return false;
                        }
                    }
                    Some(false) => {
                        if !narrow(buf, *else_n, out) {
                            return false;
                        }
                    }
                    None => {}
                },
            }
        }
        true
    }
}

// buf[idx] ∩= cand; false when the node becomes empty.
fn narrow(buf: &mut [Interval], idx: usize, cand: Interval) -> bool {
    let new = buf[idx].intersect(&cand);
    buf[idx] = new;
    !new.is_empty()
}

// As `narrow`, but `cand` is already intersected with the child.
fn narrow_to(buf: &mut [Interval], idx: usize, cand: Interval) -> bool {
    buf[idx] = cand;
    !cand.is_empty()
}

fn pow_forward(base: Interval, exp: Interval) -> Interval {
    if exp.is_degenerate() {
        let p = exp.lb;
        if p.fract() == 0.0 && p.abs() <= i32::MAX as f64 {
            return base.powi(p as i32);
        }
        return base.powf(p);
    }
    base.pow(exp)
}

// Candidate for the base of pow(base, p) = out, for a degenerate real
// exponent. Returns the base untouched when no sound inversion applies.
fn pow_backward(base: Interval, out: Interval, p: f64) -> Interval {
    if p.fract() == 0.0 && p.abs() <= i32::MAX as f64 {
        let n = p as i32;
        if n <= 0 {
            return Interval::entire();
        }
        if n % 2 == 1 {
            return out.nth_root(n);
        }
        let r = out.intersect(&Interval::new(0.0, f64::INFINITY)).nth_root(n);
        return signed_even_inverse_hull(base, r);
    }
    if p > 0.0 {
        // Non-integer exponent: the base is confined to [0, ∞).
        return out
            .intersect(&Interval::new(0.0, f64::INFINITY))
            .powf(1.0 / p);
    }
    Interval::entire()
}

// The part of `child` whose absolute value lies in `r` (r ⊆ [0, ∞)).
fn signed_even_inverse(child: Interval, r: Interval) -> Interval {
    child.intersect(&signed_even_inverse_hull(child, r))
}

fn signed_even_inverse_hull(child: Interval, r: Interval) -> Interval {
    if r.is_empty() {
        return Interval::empty();
    }
    if child.lb >= 0.0 {
        r
    } else if child.ub <= 0.0 {
        -r
    } else {
        (-r).hull(&r)
    }
}

// x with sin(x) ∈ out, intersected with `child`; principal branches
// α + 2πk and (π − α) + 2πk scanned over the periods covering `child`.
fn backward_sin(child: Interval, out: Interval) -> Interval {
    let out = out.intersect(&Interval::new(-1.0, 1.0));
    if out.is_empty() {
        return Interval::empty();
    }
    if child.diam() > 4.0 * TWO_PI || !child.lb.is_finite() || !child.ub.is_finite() {
        return child;
    }
    let alpha = out.asin();
    periodic_scan(child, TWO_PI, &[
        (alpha.lb, alpha.ub),
        (PI - alpha.ub, PI - alpha.lb),
    ])
}

// x with cos(x) ∈ out: branches ±α + 2πk with α = acos(out) ⊆ [0, π].
fn backward_cos(child: Interval, out: Interval) -> Interval {
    let out = out.intersect(&Interval::new(-1.0, 1.0));
    if out.is_empty() {
        return Interval::empty();
    }
    if child.diam() > 4.0 * TWO_PI || !child.lb.is_finite() || !child.ub.is_finite() {
        return child;
    }
    let alpha = out.acos();
    periodic_scan(child, TWO_PI, &[
        (alpha.lb, alpha.ub),
        (-alpha.ub, -alpha.lb),
    ])
}

// x with tan(x) ∈ out: branches α + πk with α = atan(out) ⊂ (−π/2, π/2).
fn backward_tan(child: Interval, out: Interval) -> Interval {
    if out.is_empty() {
        return Interval::empty();
    }
    if child.diam() > 8.0 * PI || !child.lb.is_finite() || !child.ub.is_finite() {
        return child;
    }
    let alpha = out.atan();
    periodic_scan(child, PI, &[(alpha.lb, alpha.ub)])
}

// Hull of (branch + period·k) ∩ child over every period window touching
// `child`, widened by a small reduction margin.
fn periodic_scan(child: Interval, period: f64, branches: &[(f64, f64)]) -> Interval {
    let k_lo = ((child.lb - period) / period).floor() as i64 - 1;
    let k_hi = ((child.ub + period) / period).ceil() as i64 + 1;
    let mut acc = Interval::empty();
    for k in k_lo..=k_hi {
        let shift = period * k as f64;
        for &(lo, hi) in branches {
            let seg = Interval::new(lo + shift - BRANCH_MARGIN, hi + shift + BRANCH_MARGIN);
            acc = acc.hull(&seg.intersect(&child));
        }
    }
    acc
}

// Flattens the expression DAG into a topologically ordered plan, sharing
// nodes by interned identity.
fn flatten(
    e: &Expression,
    b: &IntervalBox,
    nodes: &mut Vec<PlanOp>,
    var_dims: &mut Vec<(usize, usize)>,
    memo: &mut FxHashMap<u64, usize>,
) -> usize {
    if let Some(&idx) = memo.get(&e.id()) {
        return idx;
    }
    let op = match e.node() {
        ExprNode::Constant(v) => PlanOp::Constant(Interval::point(*v)),
        ExprNode::RealConstant { lb, ub, .. } => PlanOp::Constant(Interval::new(*lb, *ub)),
        ExprNode::Var(v) => match b.index_of(v) {
            Some(dim) => PlanOp::Var(dim),
            None => PlanOp::Opaque,
        },
        ExprNode::Add { constant, terms } => {
            let flat: Vec<(usize, f64)> = terms
                .iter()
                .map(|(t, c)| (flatten(t, b, nodes, var_dims, memo), *c))
                .collect();
            PlanOp::Add {
                constant: *constant,
                terms: flat,
            }
        }
        ExprNode::Mul { constant, factors } => {
            let flat: Vec<usize> = factors
                .iter()
                .map(|(base, exp)| {
                    if exp.constant_value() == Some(1.0) {
                        flatten(base, b, nodes, var_dims, memo)
                    } else {
                        let bn = flatten(base, b, nodes, var_dims, memo);
                        let en = flatten(exp, b, nodes, var_dims, memo);
                        push_node(PlanOp::Pow(bn, en), nodes)
                    }
                })
                .collect();
            PlanOp::Mul {
                constant: *constant,
                factors: flat,
            }
        }
        ExprNode::Div(a, d) => {
            let an = flatten(a, b, nodes, var_dims, memo);
            let dn = flatten(d, b, nodes, var_dims, memo);
            PlanOp::Div(an, dn)
        }
        ExprNode::Pow(base, exp) => {
            let bn = flatten(base, b, nodes, var_dims, memo);
            let en = flatten(exp, b, nodes, var_dims, memo);
            PlanOp::Pow(bn, en)
        }
        ExprNode::Log(a) => PlanOp::Log(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Abs(a) => PlanOp::Abs(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Exp(a) => PlanOp::Exp(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Sqrt(a) => PlanOp::Sqrt(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Sin(a) => PlanOp::Sin(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Cos(a) => PlanOp::Cos(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Tan(a) => PlanOp::Tan(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Asin(a) => PlanOp::Asin(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Acos(a) => PlanOp::Acos(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Atan(a) => PlanOp::Atan(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Atan2(y, x) => {
            let yn = flatten(y, b, nodes, var_dims, memo);
            let xn = flatten(x, b, nodes, var_dims, memo);
            PlanOp::Atan2(yn, xn)
        }
        ExprNode::Sinh(a) => PlanOp::Sinh(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Cosh(a) => PlanOp::Cosh(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Tanh(a) => PlanOp::Tanh(flatten(a, b, nodes, var_dims, memo)),
        ExprNode::Min(x, y) => {
            let xn = flatten(x, b, nodes, var_dims, memo);
            let yn = flatten(y, b, nodes, var_dims, memo);
            PlanOp::Min(xn, yn)
        }
        ExprNode::Max(x, y) => {
            let xn = flatten(x, b, nodes, var_dims, memo);
            let yn = flatten(y, b, nodes, var_dims, memo);
            PlanOp::Max(xn, yn)
        }
        ExprNode::IfThenElse(cond, t, el) => {
            let tn = flatten(t, b, nodes, var_dims, memo);
            let en = flatten(el, b, nodes, var_dims, memo);
            PlanOp::Ite {
                cond: cond.clone(),
                then_n: tn,
                else_n: en,
            }
        }
        ExprNode::UninterpretedFunction { .. } | ExprNode::NaN => PlanOp::Opaque,
    };
    let idx = push_node(op, nodes);
    if let PlanOp::Var(dim) = &nodes[idx] {
        var_dims.push((idx, *dim));
    }
    memo.insert(e.id(), idx);
    idx
}

fn push_node(op: PlanOp, nodes: &mut Vec<PlanOp>) -> usize {
    nodes.push(op);
    nodes.len() - 1
}

impl fmt::Display for FwdBwdContractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FwdBwd({})", self.formula)
    }
}

/// Forward-only interval evaluation over a flattened plan.
///
/// Unlike the plain expression evaluator this supports conditionals, by
/// three-valued evaluation of the condition and the hull of both branches
/// when it is undecided, and treats other unsupported leaves as the whole
/// line. Used by the formula evaluator, which needs an enclosure rather
/// than an error for such constraints.
pub struct ForwardEvaluator {
    nodes: Vec<PlanOp>,
    root: usize,
    slots: Vec<Mutex<Vec<Interval>>>,
}

impl ForwardEvaluator {
    /// Flatten `e` over the dimensions of `b`, with one scratch slot per
    /// worker.
    pub fn new(e: &Expression, b: &IntervalBox, number_of_jobs: usize) -> ForwardEvaluator {
        let mut nodes = Vec::new();
        let mut var_dims = Vec::new();
        let mut memo = FxHashMap::default();
        let root = flatten(e, b, &mut nodes, &mut var_dims, &mut memo);
        let slots = (0..number_of_jobs.max(1))
            .map(|_| Mutex::new(Vec::new()))
            .collect();
        ForwardEvaluator { nodes, root, slots }
    }

    /// Enclose the expression's range over `b`.
    pub fn evaluate(&self, b: &IntervalBox, worker_id: usize) -> Interval {
        let wid = worker_id.min(self.slots.len() - 1);
        let mut guard = self.slots[wid].lock();
        if guard.len() != self.nodes.len() {
            guard.resize(self.nodes.len(), Interval::empty());
        }
        forward_pass(&self.nodes, &mut guard[..], b);
        guard[self.root]
    }
}

impl fmt::Debug for ForwardEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardEvaluator")
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use d5_core::expr::{abs as eabs, powi};
    use d5_core::{eq, geq, leq, Expression, Variable};

    fn contract(f: Formula, b: IntervalBox) -> ContractorStatus {
        let config = Config::default();
        let ctc = FwdBwdContractor::new(f, &b, &config);
        let mut cs = ContractorStatus::new(b, 0);
        ctc.prune(&mut cs);
        cs
    }

    #[test]
    fn test_linear_equality_pins_variable() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let b = IntervalBox::new([(xv, Interval::new(0.0, 10.0))]);
        let cs = contract(eq(x, Expression::constant(3.0)), b);
        let iv = cs.current()[0];
        assert!(iv.contains(3.0));
        assert!(iv.diam() < 1e-9);
        assert!(cs.output().contains(0));
        assert_eq!(cs.used_constraints().len(), 1);
    }

    #[test]
    fn test_circle_constraint_narrows_to_unit_square() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let f = leq(powi(x, 2) + powi(y, 2), Expression::constant(1.0));
        let b = IntervalBox::new([
            (xv, Interval::new(-2.0, 2.0)),
            (yv, Interval::new(-2.0, 2.0)),
        ]);
        let cs = contract(f, b);
        for dim in 0..2 {
            let iv = cs.current()[dim];
            assert!(iv.lb >= -1.0 - 1e-9 && iv.ub <= 1.0 + 1e-9, "{iv}");
        }
    }

    #[test]
    fn test_infeasible_constraint_empties_box() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let f = geq(powi(x, 2), Expression::constant(10.0));
        let b = IntervalBox::new([(xv, Interval::new(-1.0, 1.0))]);
        let cs = contract(f, b);
        assert!(cs.current().is_empty());
        assert_eq!(cs.used_constraints().len(), 1);
    }

    #[test]
    fn test_abs_projection() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        // |x - 3| <= 0.01
        let f = leq(eabs(x - 3.0), Expression::constant(0.01));
        let b = IntervalBox::new([(xv, Interval::new(0.0, 10.0))]);
        let cs = contract(f, b);
        let iv = cs.current()[0];
        assert!(iv.lb >= 2.98 && iv.ub <= 3.02, "{iv}");
    }

    #[test]
    fn test_sin_projection() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        // sin(x) >= 0.9 on [0, π]
        let f = geq(d5_core::sin(x), Expression::constant(0.9));
        let b = IntervalBox::new([(xv, Interval::new(0.0, PI))]);
        let cs = contract(f, b);
        let iv = cs.current()[0];
        // asin(0.9) ≈ 1.1198
        assert!(iv.lb > 1.0 && iv.ub < 2.2, "{iv}");
    }

    #[test]
    fn test_monotonicity_of_contraction() {
        let xv = Variable::new("x");
        let yv = Variable::new("y");
        let x = Expression::variable(&xv);
        let y = Expression::variable(&yv);
        let f = leq(powi(x, 2) + powi(y, 2), Expression::constant(1.0));

        let outer = IntervalBox::new([
            (xv.clone(), Interval::new(-2.0, 2.0)),
            (yv.clone(), Interval::new(-2.0, 2.0)),
        ]);
        let mut inner = outer.clone();
        inner[0] = Interval::new(0.0, 1.5);

        let config = Config::default();
        let ctc = FwdBwdContractor::new(f, &outer, &config);

        let mut cs_outer = ContractorStatus::new(outer.clone(), 0);
        ctc.prune(&mut cs_outer);
        let mut cs_inner = ContractorStatus::new(inner.clone(), 0);
        ctc.prune(&mut cs_inner);

        // c(B) ⊆ B and c(B₁) ⊆ c(B₂) for B₁ ⊆ B₂.
        assert!(cs_outer.current().is_subset(&outer));
        assert!(cs_inner.current().is_subset(&inner));
        assert!(cs_inner.current().is_subset(cs_outer.current()));
    }

    #[test]
    fn test_neq_is_dummy() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let f = d5_core::neq(x, Expression::constant(0.0));
        let b = IntervalBox::new([(xv, Interval::new(-1.0, 1.0))]);
        let config = Config::default();
        let ctc = FwdBwdContractor::new(f, &b, &config);
        assert!(ctc.is_dummy());
    }

    #[test]
    fn test_formula_holds_trivalent() {
        let xv = Variable::new("x");
        let x = Expression::variable(&xv);
        let b = IntervalBox::new([(xv.clone(), Interval::new(1.0, 2.0))]);
        assert_eq!(
            formula_holds(&d5_core::gt(x.clone(), Expression::zero()), &b),
            Some(true)
        );
        assert_eq!(
            formula_holds(&d5_core::lt(x.clone(), Expression::zero()), &b),
            Some(false)
        );
        assert_eq!(
            formula_holds(&d5_core::gt(x, Expression::constant(1.5)), &b),
            None
        );
    }
}
