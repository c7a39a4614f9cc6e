//! Point assignments from variables to doubles.

use std::fmt;

use rustc_hash::FxHashMap;

use crate::variable::Variable;

/// A mapping from [`Variable`] to `f64`, used for point evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Environment {
    map: FxHashMap<Variable, f64>,
}

impl Environment {
    /// An empty environment.
    pub fn new() -> Self {
        Environment::default()
    }

    /// Bind `var` to `value`, replacing any previous binding.
    pub fn insert(&mut self, var: Variable, value: f64) {
        self.map.insert(var, value);
    }

    /// Look up the value bound to `var`.
    #[inline]
    pub fn get(&self, var: &Variable) -> Option<f64> {
        self.map.get(var).copied()
    }

    /// Number of bindings.
    #[inline]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True iff no variable is bound.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Iterate over the bindings in an unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = (&Variable, f64)> {
        self.map.iter().map(|(v, x)| (v, *x))
    }
}

impl FromIterator<(Variable, f64)> for Environment {
    fn from_iter<T: IntoIterator<Item = (Variable, f64)>>(iter: T) -> Self {
        Environment {
            map: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Sort for a deterministic display.
        let mut entries: Vec<_> = self.map.iter().collect();
        entries.sort_by_key(|(v, _)| v.id());
        write!(f, "{{")?;
        for (i, (v, x)) in entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v} -> {x}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let x = Variable::new("x");
        let mut env = Environment::new();
        assert!(env.get(&x).is_none());
        env.insert(x.clone(), 2.5);
        assert_eq!(env.get(&x), Some(2.5));
        env.insert(x.clone(), -1.0);
        assert_eq!(env.get(&x), Some(-1.0));
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn test_from_iterator() {
        let x = Variable::new("x");
        let y = Variable::new("y");
        let env: Environment = [(x.clone(), 1.0), (y.clone(), 2.0)].into_iter().collect();
        assert_eq!(env.get(&x), Some(1.0));
        assert_eq!(env.get(&y), Some(2.0));
    }
}
