//! Real-valued and Boolean decision variables.
//!
//! A [`Variable`] is a value type with a stable process-wide id. Two
//! variables are equal exactly when their ids match; the name is only used
//! for display. Id 0 is reserved for the dummy sentinel and never appears
//! inside an expression.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide id generator. Ids are never reused within a process.
static NEXT_VARIABLE_ID: AtomicU64 = AtomicU64::new(1);

/// The type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VariableType {
    /// A real-valued variable.
    #[default]
    Continuous,
    /// An integer-valued variable.
    Integer,
    /// An integer variable restricted to {0, 1}.
    Binary,
    /// A Boolean variable. Only appears in formulas, never in expressions.
    Boolean,
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableType::Continuous => write!(f, "Continuous"),
            VariableType::Integer => write!(f, "Integer"),
            VariableType::Binary => write!(f, "Binary"),
            VariableType::Boolean => write!(f, "Boolean"),
        }
    }
}

/// A decision variable with a stable integer identity.
#[derive(Debug, Clone)]
pub struct Variable {
    id: u64,
    var_type: VariableType,
    name: Arc<str>,
}

impl Variable {
    /// Create a fresh continuous variable with the given display name.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_type(name, VariableType::Continuous)
    }

    /// Create a fresh variable of the given type.
    pub fn with_type(name: impl Into<Arc<str>>, var_type: VariableType) -> Self {
        Variable {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            var_type,
            name: name.into(),
        }
    }

    /// The reserved dummy variable (id 0). It compares equal only to itself
    /// and must not participate in expressions.
    pub fn dummy() -> Self {
        Variable {
            id: 0,
            var_type: VariableType::Continuous,
            name: Arc::from(""),
        }
    }

    /// Stable id of this variable.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The variable's type tag.
    #[inline]
    pub fn var_type(&self) -> VariableType {
        self.var_type
    }

    /// Display name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True iff this is the reserved dummy sentinel.
    #[inline]
    pub fn is_dummy(&self) -> bool {
        self.id == 0
    }
}

impl PartialEq for Variable {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Variable {}

impl PartialOrd for Variable {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Variable {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::hash::Hash for Variable {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// An ordered set of variables.
///
/// Iteration order is the id order, which makes displays and canonical
/// operand orderings deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variables(std::collections::BTreeSet<Variable>);

impl Variables {
    /// The empty set.
    pub fn new() -> Self {
        Variables::default()
    }

    /// Number of variables in the set.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True iff the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True iff `v` is a member.
    #[inline]
    pub fn contains(&self, v: &Variable) -> bool {
        self.0.contains(v)
    }

    /// Insert a single variable.
    pub fn insert(&mut self, v: Variable) {
        self.0.insert(v);
    }

    /// Union `other` into this set.
    pub fn extend(&mut self, other: Variables) {
        self.0.extend(other.0);
    }

    /// Remove every variable in `other`.
    pub fn remove_all(&mut self, other: &Variables) {
        for v in other.iter() {
            self.0.remove(v);
        }
    }

    /// True iff the two sets share no variable.
    pub fn is_disjoint(&self, other: &Variables) -> bool {
        self.0.is_disjoint(&other.0)
    }

    /// Iterate in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.0.iter()
    }
}

impl FromIterator<Variable> for Variables {
    fn from_iter<T: IntoIterator<Item = Variable>>(iter: T) -> Self {
        Variables(iter.into_iter().collect())
    }
}

impl IntoIterator for Variables {
    type Item = Variable;
    type IntoIter = std::collections::btree_set::IntoIter<Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl fmt::Display for Variables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_ids_are_distinct() {
        let x = Variable::new("x");
        let y = Variable::new("x");
        assert_ne!(x, y);
        assert_ne!(x.id(), y.id());
        assert_eq!(x.name(), y.name());
    }

    #[test]
    fn test_equality_is_by_id() {
        let x = Variable::new("x");
        let x2 = x.clone();
        assert_eq!(x, x2);
        assert!(!x.is_dummy());
    }

    #[test]
    fn test_dummy() {
        let d = Variable::dummy();
        assert!(d.is_dummy());
        assert_eq!(d, Variable::dummy());
    }

    #[test]
    fn test_variables_set_ordering() {
        let x = Variable::new("x");
        let y = Variable::new("y");
        let mut s = Variables::new();
        s.insert(y.clone());
        s.insert(x.clone());
        let ids: Vec<u64> = s.iter().map(|v| v.id()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(s.contains(&x) && s.contains(&y));
    }

    #[test]
    fn test_variables_remove_all() {
        let x = Variable::new("x");
        let y = Variable::new("y");
        let mut s: Variables = [x.clone(), y.clone()].into_iter().collect();
        let q: Variables = [x].into_iter().collect();
        s.remove_all(&q);
        assert_eq!(s.len(), 1);
        assert!(s.contains(&y));
    }
}
