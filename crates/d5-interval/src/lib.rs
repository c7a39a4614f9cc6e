//! d5-interval - interval arithmetic and boxes for the d5 solver
//!
//! A self-contained interval kernel:
//! - [`Interval`]: closed f64 intervals with outward rounding, the
//!   elementary functions, extended division and bisection
//! - [`IntervalVector`] and [`IntervalBox`]: the search state of the
//!   branch-and-prune loop, with cheap per-branch cloning
//! - [`BitSet`]: dimension sets used by contractor input/output tracking
//! - [`ExpressionEvaluator`]: the interval extension of symbolic
//!   expressions, plus first- and second-order Taylor refinements
//!
//! Soundness convention: endpoints are computed in round-to-nearest and
//! nudged outward, so every operation encloses its real counterpart
//! without switching the FPU rounding mode.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod bitset;
pub mod eval;
mod ibox;
mod interval;
mod ivec;
pub mod round;

pub use bitset::BitSet;
pub use eval::{taylor1_eval, taylor2_eval, EvalError, EvalResult, ExpressionEvaluator};
pub use ibox::IntervalBox;
pub use interval::Interval;
pub use ivec::IntervalVector;
