//! Inward rounding for integer-typed dimensions.

use d5_core::VariableType;
use d5_interval::{BitSet, Interval, IntervalBox};

use crate::status::ContractorStatus;

/// Rounds the bounds of Integer and Binary dimensions inward to integer
/// endpoints; empties the box when an integer dimension contains no
/// integer.
#[derive(Debug, Clone)]
pub struct IntegerContractor {
    dims: Vec<usize>,
    input: BitSet,
}

impl IntegerContractor {
    /// Collect the integer-typed dimensions of `b`.
    pub fn new(b: &IntervalBox) -> IntegerContractor {
        let mut dims = Vec::new();
        let mut input = BitSet::new(b.size());
        for i in 0..b.size() {
            match b.variable(i).var_type() {
                VariableType::Integer | VariableType::Binary => {
                    dims.push(i);
                    input.add(i);
                }
                _ => {}
            }
        }
        IntegerContractor { dims, input }
    }

    /// True iff the box has no integer dimension.
    pub fn is_dummy(&self) -> bool {
        self.dims.is_empty()
    }

    /// Dimensions this contractor may narrow.
    pub fn input(&self) -> &BitSet {
        &self.input
    }

    /// Round every integer dimension inward.
    pub fn prune(&self, cs: &mut ContractorStatus) {
        for &i in &self.dims {
            let iv = cs.current()[i];
            if iv.is_empty() {
                continue;
            }
            let rounded = Interval::new(iv.lb.ceil(), iv.ub.floor());
            if rounded.is_empty() {
                cs.current_mut().set_empty();
                cs.output_mut().fill();
                return;
            }
            if rounded != iv {
                cs.current_mut()[i] = rounded;
                cs.output_mut().add(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use d5_core::Variable;

    #[test]
    fn test_rounds_inward() {
        let n = Variable::with_type("n", VariableType::Integer);
        let x = Variable::new("x");
        let b = IntervalBox::new([
            (n, Interval::new(0.3, 2.7)),
            (x, Interval::new(0.3, 2.7)),
        ]);
        let c = IntegerContractor::new(&b);
        assert!(!c.is_dummy());
        let mut cs = ContractorStatus::new(b, 0);
        c.prune(&mut cs);
        assert_eq!(cs.current()[0], Interval::new(1.0, 2.0));
        // The continuous dimension is untouched.
        assert_eq!(cs.current()[1], Interval::new(0.3, 2.7));
        assert!(cs.output().contains(0));
        assert!(!cs.output().contains(1));
    }

    #[test]
    fn test_no_integer_in_range_is_unsat() {
        let n = Variable::with_type("n", VariableType::Integer);
        let b = IntervalBox::new([(n, Interval::new(0.2, 0.8))]);
        let c = IntegerContractor::new(&b);
        let mut cs = ContractorStatus::new(b, 0);
        c.prune(&mut cs);
        assert!(cs.current().is_empty());
    }
}
