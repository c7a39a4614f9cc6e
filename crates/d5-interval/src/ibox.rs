//! Boxes: interval-valued assignments to a fixed variable vector.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use d5_core::Variable;

use crate::interval::Interval;
use crate::ivec::IntervalVector;

/// A Cartesian product of intervals, one per variable.
///
/// The variable table is shared between clones, so the per-branch copies
/// taken by the search are cheap: only the interval vector is duplicated.
#[derive(Debug, Clone)]
pub struct IntervalBox {
    variables: Arc<Vec<Variable>>,
    indices: Arc<FxHashMap<Variable, usize>>,
    values: IntervalVector,
}

impl IntervalBox {
    /// Build a box over the given variables and initial domains.
    pub fn new(domains: impl IntoIterator<Item = (Variable, Interval)>) -> IntervalBox {
        let mut variables = Vec::new();
        let mut indices = FxHashMap::default();
        let mut values = Vec::new();
        for (v, iv) in domains {
            indices.insert(v.clone(), variables.len());
            variables.push(v);
            values.push(iv);
        }
        IntervalBox {
            variables: Arc::new(variables),
            indices: Arc::new(indices),
            values: IntervalVector::from_vec(values),
        }
    }

    /// Number of dimensions.
    #[inline]
    pub fn size(&self) -> usize {
        self.variables.len()
    }

    /// The variable of dimension `i`.
    #[inline]
    pub fn variable(&self, i: usize) -> &Variable {
        &self.variables[i]
    }

    /// The variables, in dimension order.
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// The dimension of `v`, if the box covers it.
    #[inline]
    pub fn index_of(&self, v: &Variable) -> Option<usize> {
        self.indices.get(v).copied()
    }

    /// The interval of `v`, if the box covers it.
    #[inline]
    pub fn interval_of(&self, v: &Variable) -> Option<&Interval> {
        self.index_of(v).map(|i| &self.values[i])
    }

    /// The underlying interval vector.
    #[inline]
    pub fn interval_vector(&self) -> &IntervalVector {
        &self.values
    }

    /// The underlying interval vector, mutably.
    #[inline]
    pub fn interval_vector_mut(&mut self) -> &mut IntervalVector {
        &mut self.values
    }

    /// True iff some dimension is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Empty every dimension.
    pub fn set_empty(&mut self) {
        self.values.set_empty();
    }

    /// Split dimension `i` at its midpoint. `None` when the dimension is
    /// not bisectable.
    pub fn bisect(&self, i: usize) -> Option<(IntervalBox, IntervalBox)> {
        let iv = self.values[i];
        if !iv.is_bisectable() {
            return None;
        }
        let (lo, hi) = iv.bisect();
        let mut left = self.clone();
        let mut right = self.clone();
        left.values[i] = lo;
        right.values[i] = hi;
        Some((left, right))
    }

    /// Componentwise convex hull with another box over the same variables.
    pub fn hull_assign(&mut self, other: &IntervalBox) {
        debug_assert_eq!(self.size(), other.size());
        self.values.hull_assign(&other.values);
    }

    /// True iff every dimension of `self` is contained in `other`.
    pub fn is_subset(&self, other: &IntervalBox) -> bool {
        self.values.is_subset(&other.values)
    }

    /// The midpoint box: every dimension collapsed to its midpoint.
    pub fn mid(&self) -> IntervalBox {
        let mut ret = self.clone();
        for i in 0..ret.size() {
            let m = ret.values[i].mid();
            ret.values[i] = Interval::point(m);
        }
        ret
    }

    /// The dimension with the largest diameter among bisectable ones,
    /// with its diameter. `None` when nothing is bisectable.
    pub fn max_diam_dimension(&self) -> Option<(usize, f64)> {
        let mut best: Option<(usize, f64)> = None;
        for i in 0..self.size() {
            let iv = self.values[i];
            if !iv.is_bisectable() {
                continue;
            }
            let d = iv.diam();
            if best.map_or(true, |(_, bd)| d > bd) {
                best = Some((i, d));
            }
        }
        best
    }
}

impl PartialEq for IntervalBox {
    fn eq(&self, other: &Self) -> bool {
        self.variables == other.variables && self.values == other.values
    }
}

impl Index<usize> for IntervalBox {
    type Output = Interval;
    #[inline]
    fn index(&self, i: usize) -> &Interval {
        &self.values[i]
    }
}

impl IndexMut<usize> for IntervalBox {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut Interval {
        &mut self.values[i]
    }
}

impl fmt::Display for IntervalBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, v) in self.variables.iter().enumerate() {
            writeln!(f, "{v} : {}", self.values[i])?;
        }
        Ok(())
    }
}
