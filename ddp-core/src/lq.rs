//! Per-node linear-quadratic approximation of the constrained problem.

use nalgebra::DVector;

use crate::error::{DdpError, DdpResult};
use crate::model::{
    ConstraintCollection, CostFunction, EventModelData, ModelData, RelaxedBarrierPenalty,
    SystemDynamics,
};
use crate::util::numerics::make_psd;

/// Positive-semidefiniteness policy applied to cost Hessians.
#[derive(Debug, Clone, Copy)]
pub struct PsdPolicy {
    pub use_make_psd: bool,
    pub added_diagonal: f64,
}

impl PsdPolicy {
    pub(crate) fn apply(&self, m: &mut nalgebra::DMatrix<f64>) {
        if self.use_make_psd {
            make_psd(m);
        } else {
            for i in 0..m.nrows() {
                m[(i, i)] += self.added_diagonal;
            }
        }
    }
}

/// Worker-owned evaluator building the LQ data at a trajectory node. Each
/// worker holds its own clone, so the collaborators' scratch state is never
/// shared.
pub struct LqApproximator {
    dynamics: Box<dyn SystemDynamics>,
    cost: Box<dyn CostFunction>,
    constraints: Box<dyn ConstraintCollection>,
    penalty: RelaxedBarrierPenalty,
    check_numerical_stability: bool,
    input_dim: usize,
}

impl LqApproximator {
    pub fn new(
        dynamics: Box<dyn SystemDynamics>,
        cost: Box<dyn CostFunction>,
        constraints: Box<dyn ConstraintCollection>,
        penalty: RelaxedBarrierPenalty,
        check_numerical_stability: bool,
    ) -> Self {
        let input_dim = dynamics.input_dim();
        Self { dynamics, cost, constraints, penalty, check_numerical_stability, input_dim }
    }

    pub fn cost_mut(&mut self) -> &mut dyn CostFunction {
        self.cost.as_mut()
    }

    pub fn constraints_mut(&mut self) -> &mut dyn ConstraintCollection {
        self.constraints.as_mut()
    }

    pub fn penalty(&self) -> &RelaxedBarrierPenalty {
        &self.penalty
    }

    /// LQ data of dynamics, cost and constraints at `(t, x, u)`, with the
    /// inequality barrier folded into the cost quadratics and the PSD policy
    /// applied to the state Hessian.
    pub fn approximate_node(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
        psd: PsdPolicy,
    ) -> DdpResult<ModelData> {
        let quadratic = self.cost.stage_quadratic(t, x, u);

        let mut data = ModelData {
            time: t,
            dynamics_state_derivative: self.dynamics.flow_map_state_derivative(t, x, u),
            dynamics_input_derivative: self.dynamics.flow_map_input_derivative(t, x, u),
            cost: quadratic.value,
            cost_state_derivative: quadratic.state_derivative,
            cost_state_second_derivative: quadratic.state_second_derivative,
            cost_input_derivative: quadratic.input_derivative,
            cost_input_second_derivative: quadratic.input_second_derivative,
            cost_input_state_derivative: quadratic.input_state_derivative,
            ..Default::default()
        };

        let ev = self.constraints.state_input_equality(t, x, u);
        if ev.len() > self.input_dim {
            return Err(DdpError::ConstraintDimOverflow(format!(
                "{} active state-input equality constraints for input dimension {}",
                ev.len(),
                self.input_dim
            )));
        }
        data.num_state_input_constraints = ev.len();
        data.state_input_constraint = ev;

        let hv = self.constraints.state_equality(t, x);
        if hv.len() > self.input_dim {
            return Err(DdpError::ConstraintDimOverflow(format!(
                "{} active state equality constraints for input dimension {}",
                hv.len(),
                self.input_dim
            )));
        }
        data.num_state_constraints = hv.len();
        data.state_constraint = hv;

        let h = self.constraints.inequality(t, x, u);
        data.num_inequality_constraints = h.len();
        if !h.is_empty() {
            self.fold_barrier_into_cost(t, x, u, &h, &mut data);
        }
        data.inequality_constraint = h;

        psd.apply(&mut data.cost_state_second_derivative);

        if self.check_numerical_stability {
            data.check_finite()?;
        }
        Ok(data)
    }

    /// Adds the relaxed-barrier expansion of the active inequality rows to
    /// the cost quadratics.
    fn fold_barrier_into_cost(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
        h: &[f64],
        data: &mut ModelData,
    ) {
        let dhdx = self.constraints.inequality_state_derivative(t, x, u);
        let dhdu = self.constraints.inequality_input_derivative(t, x, u);
        let dhdxx = self.constraints.inequality_state_second_derivative(t, x, u);
        let dhduu = self.constraints.inequality_input_second_derivative(t, x, u);
        let dhdux = self.constraints.inequality_input_state_derivative(t, x, u);

        for (row, &hi) in h.iter().enumerate() {
            let p = self.penalty.value(hi);
            let dp = self.penalty.derivative(hi);
            let ddp = self.penalty.second_derivative(hi);

            data.cost += p;
            if let Some(gx) = dhdx.get(row) {
                data.cost_state_derivative += gx * dp;
                data.cost_state_second_derivative += gx * gx.transpose() * ddp;
                if let Some(gxx) = dhdxx.get(row) {
                    data.cost_state_second_derivative += gxx * dp;
                }
            }
            if let Some(gu) = dhdu.get(row) {
                data.cost_input_derivative += gu * dp;
                data.cost_input_second_derivative += gu * gu.transpose() * ddp;
                if let Some(guu) = dhduu.get(row) {
                    data.cost_input_second_derivative += guu * dp;
                }
            }
            if let (Some(gu), Some(gx)) = (dhdu.get(row), dhdx.get(row)) {
                data.cost_input_state_derivative += gu * gx.transpose() * ddp;
                if let Some(gux) = dhdux.get(row) {
                    data.cost_input_state_derivative += gux * dp;
                }
            }
        }
    }

    /// Event-time LQ data at the node before a switch, with the state-only
    /// constraint folded in as a quadratic penalty of weight
    /// `state_constraint_penalty`.
    pub fn approximate_event(
        &mut self,
        t: f64,
        x: &DVector<f64>,
        state_constraint_penalty: f64,
        psd: PsdPolicy,
    ) -> DdpResult<EventModelData> {
        let quadratic = self.cost.terminal_quadratic(t, x);
        let hv_final = self.constraints.final_state_equality(t, x);
        if hv_final.len() > self.input_dim {
            return Err(DdpError::ConstraintDimOverflow(format!(
                "{} active event constraints for input dimension {}",
                hv_final.len(),
                self.input_dim
            )));
        }
        let fm_final = self.constraints.final_state_equality_state_derivative(t, x);

        let mut data = EventModelData {
            time: t,
            num_final_state_constraints: hv_final.len(),
            cost: quadratic.value,
            cost_state_derivative: quadratic.state_derivative,
            cost_state_second_derivative: quadratic.state_second_derivative,
            final_state_constraint: hv_final,
            final_state_constraint_derivative: fm_final,
        };

        if data.num_final_state_constraints > 0 {
            let hv = &data.final_state_constraint;
            let fm = &data.final_state_constraint_derivative;
            data.cost += 0.5 * state_constraint_penalty * hv.dot(hv);
            data.cost_state_derivative += fm.transpose() * hv * state_constraint_penalty;
            data.cost_state_second_derivative += fm.transpose() * fm * state_constraint_penalty;
        }

        psd.apply(&mut data.cost_state_second_derivative);

        if self.check_numerical_stability {
            data.check_finite()?;
        }
        Ok(data)
    }
}
