//! Linear-quadratic model data stored per trajectory node.

use nalgebra::{DMatrix, DVector};

use crate::error::{DdpError, DdpResult};
use crate::util::numerics::{matrix_is_finite, vector_is_finite};

/// First/second-order model of dynamics, cost and constraints at one node.
#[derive(Debug, Clone, Default)]
pub struct ModelData {
    pub time: f64,

    /// State Jacobian of the flow map (n × n).
    pub dynamics_state_derivative: DMatrix<f64>,
    /// Input Jacobian of the flow map (n × m).
    pub dynamics_input_derivative: DMatrix<f64>,

    pub cost: f64,
    pub cost_state_derivative: DVector<f64>,
    pub cost_state_second_derivative: DMatrix<f64>,
    pub cost_input_derivative: DVector<f64>,
    pub cost_input_second_derivative: DMatrix<f64>,
    /// Cross derivative ∂²ℓ/∂u∂x (m × n).
    pub cost_input_state_derivative: DMatrix<f64>,

    pub num_state_input_constraints: usize,
    pub state_input_constraint: DVector<f64>,
    pub num_state_constraints: usize,
    pub state_constraint: DVector<f64>,
    pub num_inequality_constraints: usize,
    pub inequality_constraint: Vec<f64>,
}

impl ModelData {
    pub fn check_finite(&self) -> DdpResult<()> {
        let ok = self.cost.is_finite()
            && matrix_is_finite(&self.dynamics_state_derivative)
            && matrix_is_finite(&self.dynamics_input_derivative)
            && vector_is_finite(&self.cost_state_derivative)
            && matrix_is_finite(&self.cost_state_second_derivative)
            && vector_is_finite(&self.cost_input_derivative)
            && matrix_is_finite(&self.cost_input_second_derivative)
            && matrix_is_finite(&self.cost_input_state_derivative);
        if ok {
            Ok(())
        } else {
            Err(DdpError::NumericalInstability(format!(
                "non-finite model data at t = {}",
                self.time
            )))
        }
    }
}

/// Event-time model data: the jump cost quadratic and the state-only
/// constraint active at the switch.
#[derive(Debug, Clone, Default)]
pub struct EventModelData {
    pub time: f64,

    pub num_final_state_constraints: usize,
    pub final_state_constraint: DVector<f64>,
    /// State Jacobian of the event constraint (rows × n).
    pub final_state_constraint_derivative: DMatrix<f64>,

    pub cost: f64,
    pub cost_state_derivative: DVector<f64>,
    pub cost_state_second_derivative: DMatrix<f64>,
}

impl EventModelData {
    pub fn check_finite(&self) -> DdpResult<()> {
        let ok = self.cost.is_finite()
            && vector_is_finite(&self.final_state_constraint)
            && matrix_is_finite(&self.final_state_constraint_derivative)
            && vector_is_finite(&self.cost_state_derivative)
            && matrix_is_finite(&self.cost_state_second_derivative);
        if ok {
            Ok(())
        } else {
            Err(DdpError::NumericalInstability(format!(
                "non-finite event model data at t = {}",
                self.time
            )))
        }
    }
}
