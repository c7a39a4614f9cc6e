//! The contractor algebra.
//!
//! A contractor is a box-narrowing operator: it may only shrink the
//! current box, reports the dimensions it changed in the status output
//! set, records the constraints that contributed, and empties the box
//! exactly when it proves the constraints infeasible on it. Primitive
//! contractors ([`FwdBwdContractor`], [`PolytopeContractor`],
//! [`ForallContractor`], [`IntegerContractor`]) compose under sequence,
//! fixpoint, hull-join and worklist gating.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use d5_interval::{BitSet, IntervalBox};

use crate::config::Config;
use crate::forall::ForallContractor;
use crate::fwdbwd::FwdBwdContractor;
use crate::polytope::PolytopeContractor;
use crate::integer::IntegerContractor;
use crate::status::ContractorStatus;

use d5_core::Formula;

/// Decides when a fixpoint iteration stops, given the box before and
/// after one application of the inner contractor.
pub type TerminationCondition = Arc<dyn Fn(&IntervalBox, &IntervalBox) -> bool + Send + Sync>;

/// Stop when no dimension shrank by at least 1% of its previous diameter.
pub fn default_termination(old: &IntervalBox, new: &IntervalBox) -> bool {
    for i in 0..old.size() {
        let shrink = old[i].diam() - new[i].diam();
        if shrink > 0.01 * old[i].diam() && shrink > 1e-12 {
            return false;
        }
    }
    true
}

/// A polymorphic box-narrowing operator.
///
/// Immutable once built; safely shared by all workers (stateful
/// primitives keep per-worker scratch slots internally).
#[derive(Clone)]
pub enum Contractor {
    /// No change.
    Id {
        /// Empty input set sized to the box.
        input: BitSet,
    },
    /// Forward/backward contraction for one constraint.
    FwdBwd(Arc<FwdBwdContractor>),
    /// Linear-relaxation hull contraction over a constraint set.
    Polytope(Arc<PolytopeContractor>),
    /// Instantiation-based contraction for a universally quantified
    /// constraint.
    Forall(Arc<ForallContractor>),
    /// Inward rounding of integer dimensions.
    Integer(Arc<IntegerContractor>),
    /// Applies each contractor in order, short-circuiting on an empty box.
    Seq {
        /// The sub-contractors, in application order.
        contractors: Vec<Contractor>,
        /// Union of the sub-contractors' inputs.
        input: BitSet,
    },
    /// Repeats the inner contractor until the termination condition holds
    /// or the box empties.
    Fixpoint {
        /// The repeated contractor.
        inner: Box<Contractor>,
        /// Stop criterion over (box before, box after).
        term: TerminationCondition,
    },
    /// Runs every branch on a copy of the input and joins the results by
    /// component-wise hull. Empty branches are dropped; when all branches
    /// are empty the join is empty. Branches started after the deadline
    /// are skipped (the first branch always runs).
    Join {
        /// The joined branches.
        branches: Vec<Contractor>,
        /// Optional wall-clock budget.
        timeout: Option<Duration>,
        /// Union of the branches' inputs.
        input: BitSet,
    },
    /// Runs the inner contractor only when its input intersects the
    /// dimensions changed so far (an untouched status runs it
    /// unconditionally).
    Worklist {
        /// The gated contractor.
        inner: Box<Contractor>,
    },
}

impl Contractor {
    /// The identity contractor over a box of `size` dimensions.
    pub fn id(size: usize) -> Contractor {
        Contractor::Id {
            input: BitSet::new(size),
        }
    }

    /// Wrap a forward/backward contractor.
    pub fn fwdbwd(c: FwdBwdContractor) -> Contractor {
        Contractor::FwdBwd(Arc::new(c))
    }

    /// Wrap a polytope contractor.
    pub fn polytope(c: PolytopeContractor) -> Contractor {
        Contractor::Polytope(Arc::new(c))
    }

    /// Wrap a forall contractor.
    pub fn forall(c: ForallContractor) -> Contractor {
        Contractor::Forall(Arc::new(c))
    }

    /// Wrap an integer contractor.
    pub fn integer(c: IntegerContractor) -> Contractor {
        Contractor::Integer(Arc::new(c))
    }

    /// Sequence of contractors over a box of `size` dimensions.
    pub fn seq(contractors: Vec<Contractor>, size: usize) -> Contractor {
        let mut input = BitSet::new(size);
        for c in &contractors {
            input.union_with(c.input());
        }
        Contractor::Seq { contractors, input }
    }

    /// Fixpoint of `inner` under `term`.
    pub fn fixpoint(inner: Contractor, term: TerminationCondition) -> Contractor {
        Contractor::Fixpoint {
            inner: Box::new(inner),
            term,
        }
    }

    /// Fixpoint of `inner` under [`default_termination`].
    pub fn fixpoint_default(inner: Contractor) -> Contractor {
        Contractor::fixpoint(inner, Arc::new(default_termination))
    }

    /// Hull-join of `branches` over a box of `size` dimensions.
    pub fn join(branches: Vec<Contractor>, timeout: Option<Duration>, size: usize) -> Contractor {
        let mut input = BitSet::new(size);
        for c in &branches {
            input.union_with(c.input());
        }
        Contractor::Join {
            branches,
            timeout,
            input,
        }
    }

    /// Gate `inner` behind the changed-dimension set.
    pub fn worklist(inner: Contractor) -> Contractor {
        Contractor::Worklist {
            inner: Box::new(inner),
        }
    }

    /// The set of dimensions this contractor may narrow.
    pub fn input(&self) -> &BitSet {
        match self {
            Contractor::Id { input } => input,
            Contractor::FwdBwd(c) => c.input(),
            Contractor::Polytope(c) => c.input(),
            Contractor::Forall(c) => c.input(),
            Contractor::Integer(c) => c.input(),
            Contractor::Seq { input, .. } => input,
            Contractor::Fixpoint { inner, .. } => inner.input(),
            Contractor::Join { input, .. } => input,
            Contractor::Worklist { inner } => inner.input(),
        }
    }

    /// Narrow the current box of `cs`.
    pub fn prune(&self, cs: &mut ContractorStatus) {
        match self {
            Contractor::Id { .. } => {}
            Contractor::FwdBwd(c) => c.prune(cs),
            Contractor::Polytope(c) => c.prune(cs),
            Contractor::Forall(c) => c.prune(cs),
            Contractor::Integer(c) => c.prune(cs),
            Contractor::Seq { contractors, .. } => {
                for c in contractors {
                    c.prune(cs);
                    if cs.current().is_empty() {
                        return;
                    }
                }
            }
            Contractor::Fixpoint { inner, term } => loop {
                let before = cs.current().clone();
                inner.prune(cs);
                if cs.current().is_empty() || term(&before, cs.current()) {
                    return;
                }
            },
            Contractor::Join {
                branches, timeout, ..
            } => {
                let deadline = timeout.map(|t| Instant::now() + t);
                let base = cs.clone();
                let mut hull: Option<IntervalBox> = None;
                for (i, c) in branches.iter().enumerate() {
                    if i > 0 {
                        if let Some(d) = deadline {
                            if Instant::now() >= d {
                                // Skipped branches must still be covered:
                                // fall back to the input box.
                                hull = Some(base.current().clone());
                                break;
                            }
                        }
                    }
                    let mut branch_cs = base.clone();
                    c.prune(&mut branch_cs);
                    cs.add_used_constraints(branch_cs.used_constraints().iter().cloned());
                    if !branch_cs.current().is_empty() {
                        hull = Some(match hull {
                            None => branch_cs.current().clone(),
                            Some(mut h) => {
                                h.hull_assign(branch_cs.current());
                                h
                            }
                        });
                    }
                }
                match hull {
                    Some(h) => {
                        for i in 0..h.size() {
                            if h[i] != base.current()[i] {
                                cs.output_mut().add(i);
                            }
                        }
                        *cs.current_mut() = h;
                    }
                    None => {
                        cs.current_mut().set_empty();
                        cs.output_mut().fill();
                    }
                }
            }
            Contractor::Worklist { inner } => {
                if cs.output().is_empty() || cs.output().intersects(inner.input()) {
                    inner.prune(cs);
                }
            }
        }
    }
}

impl fmt::Display for Contractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Contractor::Id { .. } => write!(f, "Id()"),
            Contractor::FwdBwd(c) => write!(f, "{c}"),
            Contractor::Polytope(c) => write!(f, "{c}"),
            Contractor::Forall(c) => write!(f, "{c}"),
            Contractor::Integer(_) => write!(f, "Integer()"),
            Contractor::Seq { contractors, .. } => {
                write!(f, "Seq(")?;
                for (i, c) in contractors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{c}")?;
                }
                write!(f, ")")
            }
            Contractor::Fixpoint { inner, .. } => write!(f, "Fixpoint({inner})"),
            Contractor::Join { branches, .. } => {
                write!(f, "Join(")?;
                for (i, c) in branches.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{c}")?;
                }
                write!(f, ")")
            }
            Contractor::Worklist { inner } => write!(f, "Worklist({inner})"),
        }
    }
}

impl fmt::Debug for Contractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

/// Compose the pruning operator for a conjunction of constraints: one
/// forward/backward contractor per relational literal, the polytope
/// contractor over the whole set when enabled, and integer rounding when
/// the box has integer dimensions, iterated to a fixpoint.
///
/// Universally quantified literals are skipped here (contracting them
/// needs the quantified domains, which only the caller knows; see
/// [`ForallContractor`]); the formula evaluator still accounts for them.
pub fn make_contractor(formulas: &[Formula], b: &IntervalBox, config: &Config) -> Contractor {
    let mut stages = Vec::new();
    for f in formulas {
        if f.is_forall() {
            continue;
        }
        let c = FwdBwdContractor::new(f.clone(), b, config);
        if !c.is_dummy() {
            stages.push(Contractor::fwdbwd(c));
        }
    }
    if config.use_polytope {
        let plain: Vec<Formula> = formulas
            .iter()
            .filter(|f| !f.is_forall())
            .cloned()
            .collect();
        let p = PolytopeContractor::new(plain, b, config);
        if !p.is_dummy() {
            stages.push(Contractor::polytope(p));
        }
    }
    let integer = IntegerContractor::new(b);
    if !integer.is_dummy() {
        stages.push(Contractor::integer(integer));
    }
    if stages.is_empty() {
        return Contractor::id(b.size());
    }
    Contractor::fixpoint_default(Contractor::seq(stages, b.size()))
}
