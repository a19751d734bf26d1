//! Solver settings.

use crate::error::{DdpError, DdpResult};
use crate::util::numerics::almost_ge;

/// Settings for the DDP outer loop.
///
/// Defaults follow the conventions of iterative LQ solvers for model
/// predictive control; a handful can be overridden through environment
/// variables for quick experiments without recompiling.
#[derive(Debug, Clone)]
pub struct DdpSettings {
    /// Number of worker threads for the parallel sections.
    pub n_threads: usize,

    /// Advisory scheduling priority for worker threads (not applied on
    /// platforms without a portable priority API; kept for configuration
    /// compatibility).
    pub thread_priority: i32,

    /// Maximum number of outer iterations.
    pub max_num_iterations: usize,

    /// Convergence threshold on the merit change between iterations.
    pub min_rel_cost: f64,

    /// Absolute threshold on the state-input equality constraint ISE.
    pub min_abs_constraint1_ise: f64,

    /// Threshold on the change of the state-input equality constraint ISE.
    pub min_rel_constraint1_ise: f64,

    /// Largest line-search step.
    pub max_learning_rate: f64,

    /// Smallest line-search step to try.
    pub min_learning_rate: f64,

    /// Geometric contraction rate of the line-search candidates, in (0, 1).
    pub line_search_contraction_rate: f64,

    /// Base of the per-iteration growth of the state-constraint penalty:
    /// `penalty = coeff · base^iteration`.
    pub state_constraint_penalty_base: f64,

    /// Coefficient of the state-constraint penalty.
    pub state_constraint_penalty_coeff: f64,

    /// Barrier scale μ of the relaxed inequality-constraint penalty.
    pub inequality_constraint_mu: f64,

    /// Relaxation threshold δ of the inequality-constraint penalty.
    pub inequality_constraint_delta: f64,

    /// Project cost Hessians onto the PSD cone; when false, a fixed diagonal
    /// shift is added instead.
    pub use_make_psd: bool,

    /// Diagonal shift applied to cost Hessians when `use_make_psd` is false.
    pub added_riccati_diagonal: f64,

    /// The Riccati backward sweep is the only supported backend; kept as a
    /// switch for configuration compatibility.
    pub use_riccati_solver: bool,

    /// Store Riccati results on the nominal rollout grid; when false the
    /// backward-pass sub-step times are stored as well.
    pub use_nominal_time_for_backward_pass: bool,

    /// Return the affine feedback stock from `primal_solution`; when false a
    /// feed-forward controller is synthesized from the nominal trajectory.
    pub use_feedback_policy: bool,

    /// Verify finiteness of LQ and Riccati outputs at every node.
    pub check_numerical_stability: bool,

    /// Print rollout segmentation details.
    pub debug_print_rollout: bool,

    /// Verify the cache splice against the nominal trajectory.
    pub debug_caching: bool,

    /// Print per-iteration diagnostics.
    pub display_info: bool,

    /// Print the termination summary and stage benchmarks.
    pub display_short_summary: bool,
}

impl Default for DdpSettings {
    fn default() -> Self {
        // Allow overriding the worker count without recompiling.
        let n_threads = std::env::var("DDP_NTHREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n >= 1)
            .unwrap_or(1);

        Self {
            n_threads,
            thread_priority: 0,
            max_num_iterations: 15,
            min_rel_cost: 1e-3,
            min_abs_constraint1_ise: 1e-3,
            min_rel_constraint1_ise: 1e-3,
            max_learning_rate: 1.0,
            min_learning_rate: 0.05,
            line_search_contraction_rate: 0.5,
            state_constraint_penalty_base: 2.0,
            state_constraint_penalty_coeff: 0.0,
            inequality_constraint_mu: 0.0,
            inequality_constraint_delta: 1e-6,
            use_make_psd: true,
            added_riccati_diagonal: 1e-5,
            use_riccati_solver: true,
            use_nominal_time_for_backward_pass: true,
            use_feedback_policy: false,
            check_numerical_stability: true,
            debug_print_rollout: false,
            debug_caching: false,
            display_info: false,
            display_short_summary: false,
        }
    }
}

impl DdpSettings {
    /// Validates settings that would otherwise fail deep inside a solve.
    pub fn validate(&self) -> DdpResult<()> {
        if self.n_threads == 0 {
            return Err(DdpError::BadInput("n_threads must be at least 1".into()));
        }
        if !almost_ge(self.max_learning_rate, self.min_learning_rate) {
            return Err(DdpError::BadInput(format!(
                "max_learning_rate ({}) is smaller than min_learning_rate ({})",
                self.max_learning_rate, self.min_learning_rate
            )));
        }
        if !(self.line_search_contraction_rate > 0.0 && self.line_search_contraction_rate < 1.0) {
            return Err(DdpError::BadInput(format!(
                "line_search_contraction_rate must be in (0, 1), got {}",
                self.line_search_contraction_rate
            )));
        }
        if !self.use_riccati_solver {
            return Err(DdpError::BadInput(
                "use_riccati_solver = false is not supported".into(),
            ));
        }
        Ok(())
    }
}
