//! d5-contractor - box-narrowing operators for the d5 solver
//!
//! The pruning half of branch-and-prune:
//! - [`ContractorStatus`]: the per-worker scratch state (current box,
//!   changed dimensions, contributing constraints)
//! - [`FwdBwdContractor`]: HC4-style forward/backward contraction of a
//!   single relational constraint
//! - [`PolytopeContractor`]: interval linearization + Gauss–Seidel hull
//!   sweeps over a constraint set
//! - [`ForallContractor`]: sound instantiation pruning for ∀-literals
//! - [`IntegerContractor`]: inward rounding of integer dimensions
//! - [`Contractor`]: the combinator algebra (sequence, fixpoint,
//!   hull-join with deadline, worklist gating) over all of the above
//!
//! Contractors are immutable after construction and shared by every
//! worker; the stateful ones keep one scratch slot per worker, indexed by
//! the worker id carried in the status.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod contractor;
pub mod forall;
pub mod fwdbwd;
pub mod integer;
pub mod polytope;
pub mod status;

pub use config::{BranchingStrategy, Config};
pub use contractor::{default_termination, make_contractor, Contractor, TerminationCondition};
pub use forall::ForallContractor;
pub use fwdbwd::{formula_holds, ForwardEvaluator, FwdBwdContractor};
pub use integer::IntegerContractor;
pub use polytope::PolytopeContractor;
pub use status::ContractorStatus;
