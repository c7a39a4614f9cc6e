//! Error types for symbolic computation.

use thiserror::Error;

use crate::variable::Variable;

/// Errors raised by the symbolic layer (point evaluation, expansion,
/// substitution, differentiation).
#[derive(Debug, Clone, Error)]
pub enum SymbolicError {
    /// A NaN cell was reached during a symbolic operation.
    #[error("NaN is detected during symbolic computation ({0})")]
    NaN(&'static str),

    /// A numeric argument fell outside a function's domain during point
    /// evaluation, e.g. `log(-1)` or `asin(2)`.
    #[error("{function}({argument}): numerical argument out of domain")]
    Domain {
        /// Function name.
        function: &'static str,
        /// The offending argument value.
        argument: f64,
    },

    /// Point evaluation divided by zero.
    #[error("division by zero: {numerator} / 0")]
    DivisionByZero {
        /// The numerator value at the point of failure.
        numerator: f64,
    },

    /// The expression is not differentiable with respect to the variable.
    #[error("{expression} is not differentiable with respect to {variable}")]
    NotDifferentiable {
        /// Display form of the offending expression.
        expression: String,
        /// The differentiation variable.
        variable: Variable,
    },

    /// An environment lookup missed during point evaluation.
    #[error("environment has no entry for variable {0}")]
    UnknownVariable(Variable),

    /// The construct has no point semantics, e.g. an uninterpreted
    /// function or a quantified formula.
    #[error("{0} cannot be evaluated")]
    Unevaluable(&'static str),
}

/// Result alias for symbolic operations.
pub type SymbolicResult<T> = Result<T, SymbolicError>;
