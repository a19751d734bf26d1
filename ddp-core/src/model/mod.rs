//! Problem-definition traits: dynamics, cost, constraints and operating
//! trajectories.
//!
//! Implementations may carry mutable scratch (the solver never shares one
//! instance between workers; it clones each collaborator once per worker at
//! construction, so methods take `&mut self` and no locking is needed during
//! the parallel sections).

pub mod data;
pub mod penalty;

use nalgebra::{DMatrix, DVector};

pub use data::{EventModelData, ModelData};
pub use penalty::RelaxedBarrierPenalty;

/// Controlled hybrid dynamics `ẋ = f(t, x, u)` with an optional state jump
/// at mode-switch events.
pub trait SystemDynamics: Send {
    fn state_dim(&self) -> usize;
    fn input_dim(&self) -> usize;

    fn flow_map(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64>;

    /// Maps the pre-event state to the post-event state. Identity by default.
    fn jump_map(&mut self, _t: f64, x: &DVector<f64>) -> DVector<f64> {
        x.clone()
    }

    /// ∂f/∂x (n × n).
    fn flow_map_state_derivative(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>)
        -> DMatrix<f64>;

    /// ∂f/∂u (n × m).
    fn flow_map_input_derivative(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>)
        -> DMatrix<f64>;

    fn clone_boxed(&self) -> Box<dyn SystemDynamics>;
}

impl Clone for Box<dyn SystemDynamics> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Quadratic expansion of a stage cost around a node.
#[derive(Debug, Clone, Default)]
pub struct StageCostQuadratic {
    pub value: f64,
    pub state_derivative: DVector<f64>,
    pub state_second_derivative: DMatrix<f64>,
    pub input_derivative: DVector<f64>,
    pub input_second_derivative: DMatrix<f64>,
    /// ∂²ℓ/∂u∂x (m × n).
    pub input_state_derivative: DMatrix<f64>,
}

/// Quadratic expansion of a terminal or event cost.
#[derive(Debug, Clone, Default)]
pub struct TerminalCostQuadratic {
    pub value: f64,
    pub state_derivative: DVector<f64>,
    pub state_second_derivative: DMatrix<f64>,
}

/// Running, event and terminal cost of the optimal-control problem.
pub trait CostFunction: Send {
    fn stage_cost(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>) -> f64;

    fn stage_quadratic(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>)
        -> StageCostQuadratic;

    /// Cost charged at a mode-switch event and at the end of the horizon.
    fn terminal_cost(&mut self, t: f64, x: &DVector<f64>) -> f64;

    fn terminal_quadratic(&mut self, t: f64, x: &DVector<f64>) -> TerminalCostQuadratic;

    fn clone_boxed(&self) -> Box<dyn CostFunction>;
}

impl Clone for Box<dyn CostFunction> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Equality and inequality constraints along the trajectory.
///
/// Each method returns the currently *active* rows; the active count is the
/// returned length. Inequality rows follow the convention `h(t, x, u) ≥ 0`.
pub trait ConstraintCollection: Send {
    /// State-input equality constraint values `e(t, x, u) = 0`.
    fn state_input_equality(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>)
        -> DVector<f64> {
        DVector::zeros(0)
    }

    /// State-only equality constraint values `g(t, x) = 0`.
    fn state_equality(&mut self, _t: f64, _x: &DVector<f64>) -> DVector<f64> {
        DVector::zeros(0)
    }

    /// Inequality constraint values `h(t, x, u) ≥ 0`.
    fn inequality(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>) -> Vec<f64> {
        Vec::new()
    }

    /// State gradients of the inequality rows, one vector per active row.
    fn inequality_state_derivative(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>)
        -> Vec<DVector<f64>> {
        Vec::new()
    }

    /// Input gradients of the inequality rows.
    fn inequality_input_derivative(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>)
        -> Vec<DVector<f64>> {
        Vec::new()
    }

    /// State Hessians of the inequality rows. Empty means zero.
    fn inequality_state_second_derivative(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>)
        -> Vec<DMatrix<f64>> {
        Vec::new()
    }

    /// Input Hessians of the inequality rows. Empty means zero.
    fn inequality_input_second_derivative(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>)
        -> Vec<DMatrix<f64>> {
        Vec::new()
    }

    /// Cross derivatives ∂²h/∂u∂x of the inequality rows. Empty means zero.
    fn inequality_input_state_derivative(&mut self, _t: f64, _x: &DVector<f64>, _u: &DVector<f64>)
        -> Vec<DMatrix<f64>> {
        Vec::new()
    }

    /// State-only equality constraint tied to a mode-switch event.
    fn final_state_equality(&mut self, _t: f64, _x: &DVector<f64>) -> DVector<f64> {
        DVector::zeros(0)
    }

    /// State Jacobian of the event constraint (rows × n).
    fn final_state_equality_state_derivative(&mut self, _t: f64, x: &DVector<f64>)
        -> DMatrix<f64> {
        DMatrix::zeros(0, x.len())
    }

    fn clone_boxed(&self) -> Box<dyn ConstraintCollection>;
}

impl Clone for Box<dyn ConstraintCollection> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Constraint collection with no active rows.
#[derive(Debug, Clone, Default)]
pub struct NoConstraints;

impl ConstraintCollection for NoConstraints {
    fn clone_boxed(&self) -> Box<dyn ConstraintCollection> {
        Box::new(self.clone())
    }
}

/// Source of state/input samples used when no controller is available yet.
pub trait OperatingTrajectories: Send {
    /// Samples over the event-free interval `[t0, t1]`, starting from `x0`.
    /// The returned arrays are parallel and non-empty, with the first stamp at
    /// `t0` and the last at `t1`.
    fn trajectory(
        &mut self,
        x0: &DVector<f64>,
        t0: f64,
        t1: f64,
    ) -> (Vec<f64>, Vec<DVector<f64>>, Vec<DVector<f64>>);

    fn clone_boxed(&self) -> Box<dyn OperatingTrajectories>;
}

impl Clone for Box<dyn OperatingTrajectories> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Constant operating point: the interval endpoints sampled at a fixed
/// state/input pair.
#[derive(Debug, Clone)]
pub struct FixedOperatingPoint {
    pub state: DVector<f64>,
    pub input: DVector<f64>,
}

impl FixedOperatingPoint {
    pub fn new(state: DVector<f64>, input: DVector<f64>) -> Self {
        Self { state, input }
    }
}

impl OperatingTrajectories for FixedOperatingPoint {
    fn trajectory(
        &mut self,
        _x0: &DVector<f64>,
        t0: f64,
        t1: f64,
    ) -> (Vec<f64>, Vec<DVector<f64>>, Vec<DVector<f64>>) {
        (
            vec![t0, t1],
            vec![self.state.clone(), self.state.clone()],
            vec![self.input.clone(), self.input.clone()],
        )
    }

    fn clone_boxed(&self) -> Box<dyn OperatingTrajectories> {
        Box::new(self.clone())
    }
}
