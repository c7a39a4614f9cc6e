//! The mutable scratch state threaded through pruning.

use rustc_hash::FxHashSet;

use d5_core::Formula;
use d5_interval::{BitSet, IntervalBox};

/// Per-worker pruning state: the current box, the last branching
/// dimension, the dimensions narrowed so far and the constraints that
/// contributed to the narrowing.
#[derive(Debug, Clone)]
pub struct ContractorStatus {
    current: IntervalBox,
    branching_point: i32,
    output: BitSet,
    used_constraints: FxHashSet<Formula>,
    worker_id: usize,
}

impl ContractorStatus {
    /// Fresh status over `b`, owned by worker `worker_id` (0 for the
    /// sequential engine and the calling thread).
    pub fn new(b: IntervalBox, worker_id: usize) -> ContractorStatus {
        let size = b.size();
        ContractorStatus {
            current: b,
            branching_point: -1,
            output: BitSet::new(size),
            used_constraints: FxHashSet::default(),
            worker_id,
        }
    }

    /// The current box.
    #[inline]
    pub fn current(&self) -> &IntervalBox {
        &self.current
    }

    /// The current box, mutably.
    #[inline]
    pub fn current_mut(&mut self) -> &mut IntervalBox {
        &mut self.current
    }

    /// The dimension bisected to produce the current box, `-1` for the
    /// initial box.
    #[inline]
    pub fn branching_point(&self) -> i32 {
        self.branching_point
    }

    /// Record the branching dimension of the current box.
    #[inline]
    pub fn set_branching_point(&mut self, bp: i32) {
        self.branching_point = bp;
    }

    /// Dimensions changed by pruning so far.
    #[inline]
    pub fn output(&self) -> &BitSet {
        &self.output
    }

    /// Dimensions changed by pruning so far, mutably.
    #[inline]
    pub fn output_mut(&mut self) -> &mut BitSet {
        &mut self.output
    }

    /// Constraints that contributed to the narrowing, for lemma learning.
    #[inline]
    pub fn used_constraints(&self) -> &FxHashSet<Formula> {
        &self.used_constraints
    }

    /// Record one contributing constraint.
    pub fn add_used_constraint(&mut self, f: Formula) {
        self.used_constraints.insert(f);
    }

    /// Record several contributing constraints.
    pub fn add_used_constraints(&mut self, fs: impl IntoIterator<Item = Formula>) {
        self.used_constraints.extend(fs);
    }

    /// Owner worker id; indexes per-worker contractor slots.
    #[inline]
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// A copy of this status owned by another worker.
    pub fn clone_for_worker(&self, worker_id: usize) -> ContractorStatus {
        let mut c = self.clone();
        c.worker_id = worker_id;
        c
    }

    /// Merge another worker's bookkeeping into this status: union of used
    /// constraints and of changed dimensions. The box is left untouched;
    /// the engine installs the winning box explicitly.
    pub fn inplace_join(&mut self, other: &ContractorStatus) {
        self.output.union_with(other.output());
        self.used_constraints
            .extend(other.used_constraints.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use d5_core::{geq, Expression, Variable};
    use d5_interval::Interval;

    fn status() -> ContractorStatus {
        let x = Variable::new("x");
        let b = IntervalBox::new([(x, Interval::new(0.0, 1.0))]);
        ContractorStatus::new(b, 0)
    }

    #[test]
    fn test_initial_state() {
        let cs = status();
        assert_eq!(cs.branching_point(), -1);
        assert!(cs.output().is_empty());
        assert!(cs.used_constraints().is_empty());
        assert_eq!(cs.worker_id(), 0);
    }

    #[test]
    fn test_inplace_join() {
        let mut a = status();
        let mut b = status();
        b.output_mut().add(0);
        let f = geq(
            Expression::variable(&Variable::new("x")),
            Expression::constant(0.5),
        );
        b.add_used_constraint(f.clone());
        a.inplace_join(&b);
        assert!(a.output().contains(0));
        assert!(a.used_constraints().contains(&f));
    }
}
