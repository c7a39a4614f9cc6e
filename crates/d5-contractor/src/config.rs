//! The options bundle consumed by the decision core.

/// How the ICP loop picks the dimension to bisect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchingStrategy {
    /// Bisect the candidate dimension with the largest diameter.
    #[default]
    MaxDiam,
    /// Score candidates by the gradient of the residual error functions;
    /// falls back to `MaxDiam` when the gradient is not informative.
    GradientDescent,
}

/// Typed options for one `check_sat` query.
#[derive(Debug, Clone)]
pub struct Config {
    /// δ in δ-SAT: constraints whose interval evaluation is narrower than
    /// this are accepted as satisfied.
    pub precision: f64,
    /// Worker-pool size. `1` selects the sequential engine.
    pub number_of_jobs: usize,
    /// Initial branch-ordering policy; alternated after every branching
    /// step.
    pub stack_left_box_first: bool,
    /// Branching heuristic.
    pub branching_strategy: BranchingStrategy,
    /// Include the polytope contractor in the composed contractor.
    pub use_polytope: bool,
    /// Refine the branching decision with a bounded local descent.
    pub use_local_optimization: bool,
    /// Relative function tolerance for the local descent.
    pub nlopt_ftol_rel: f64,
    /// Absolute function tolerance for the local descent.
    pub nlopt_ftol_abs: f64,
    /// Time budget for the local descent, in seconds.
    pub nlopt_maxtime: f64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            precision: 0.001,
            number_of_jobs: 1,
            stack_left_box_first: false,
            branching_strategy: BranchingStrategy::MaxDiam,
            use_polytope: false,
            use_local_optimization: false,
            nlopt_ftol_rel: 1e-6,
            nlopt_ftol_abs: 1e-6,
            nlopt_maxtime: 0.01,
        }
    }
}
