//! Trapezoidal integration of cost and constraint violations along a
//! rollout, and the merit function monotonized by the line search.

use crate::error::{DdpError, DdpResult};
use crate::lq::LqApproximator;
use crate::model::CostFunction;
use crate::trajectory::Trajectory;

/// Integrated performance of one rollout.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceMetrics {
    /// Cost augmented by the state-constraint penalties and the inequality
    /// barrier; the quantity compared by the line search.
    pub merit: f64,
    /// Raw cost: running cost, event costs and the terminal heuristic.
    pub cost: f64,
    pub state_input_eq_ise: f64,
    pub state_eq_ise: f64,
    pub state_eq_final_ise: f64,
    pub inequality_ise: f64,
    pub inequality_penalty: f64,
}

/// Evaluates cost, constraint ISEs and merit along the whole stock.
///
/// All integrals use the trapezoidal rule per partition; at every node whose
/// successor is a post-event index the event cost and the event-time
/// state-only constraint are charged.
pub(crate) fn evaluate_rollout_performance(
    lq: &mut LqApproximator,
    heuristics: &mut dyn CostFunction,
    stock: &[Trajectory],
    final_active_partition: usize,
    state_constraint_penalty: f64,
    input_dim: usize,
) -> DdpResult<PerformanceMetrics> {
    let mut metrics = PerformanceMetrics::default();

    for trajectory in stock {
        let n = trajectory.len();
        if n == 0 {
            continue;
        }

        let mut events = trajectory.post_event_indices.iter().peekable();

        let mut prev_cost = 0.0;
        let mut prev_e1 = 0.0;
        let mut prev_e2 = 0.0;
        let mut prev_violation = 0.0;
        let mut prev_penalty = 0.0;

        for k in 0..n {
            let t = trajectory.time[k];
            let x = &trajectory.state[k];
            let u = &trajectory.input[k];

            let ev = lq.constraints_mut().state_input_equality(t, x, u);
            if ev.len() > input_dim {
                return Err(DdpError::ConstraintDimOverflow(format!(
                    "{} active state-input equality constraints for input dimension {}",
                    ev.len(),
                    input_dim
                )));
            }
            let hv = lq.constraints_mut().state_equality(t, x);
            if hv.len() > input_dim {
                return Err(DdpError::ConstraintDimOverflow(format!(
                    "{} active state equality constraints for input dimension {}",
                    hv.len(),
                    input_dim
                )));
            }
            let h = lq.constraints_mut().inequality(t, x, u);

            let curr_e1 = ev.norm_squared();
            let curr_e2 = hv.norm_squared();
            let (curr_violation, curr_penalty) = if h.is_empty() {
                (0.0, 0.0)
            } else {
                (lq.penalty().violation_squared_norm(&h), lq.penalty().penalty_cost(&h))
            };
            let curr_cost = lq.cost_mut().stage_cost(t, x, u);

            if k > 0 {
                let dt = t - trajectory.time[k - 1];
                metrics.cost += 0.5 * (prev_cost + curr_cost) * dt;
                metrics.state_input_eq_ise += 0.5 * (prev_e1 + curr_e1) * dt;
                metrics.state_eq_ise += 0.5 * (prev_e2 + curr_e2) * dt;
                metrics.inequality_ise += 0.5 * (prev_violation + curr_violation) * dt;
                metrics.inequality_penalty += 0.5 * (prev_penalty + curr_penalty) * dt;
            }

            // switching-time charges at the last node before an event
            if events.peek() == Some(&&(k + 1)) {
                metrics.cost += lq.cost_mut().terminal_cost(t, x);
                let hv_final = lq.constraints_mut().final_state_equality(t, x);
                if hv_final.len() > input_dim {
                    return Err(DdpError::ConstraintDimOverflow(format!(
                        "{} active event constraints for input dimension {}",
                        hv_final.len(),
                        input_dim
                    )));
                }
                metrics.state_eq_final_ise += hv_final.norm_squared();
                events.next();
            }

            prev_cost = curr_cost;
            prev_e1 = curr_e1;
            prev_e2 = curr_e2;
            prev_violation = curr_violation;
            prev_penalty = curr_penalty;
        }
    }

    // terminal heuristic at the end of the horizon
    let final_trajectory = &stock[final_active_partition];
    if let (Some(&t), Some(x)) = (final_trajectory.time.last(), final_trajectory.state.last()) {
        metrics.cost += heuristics.terminal_cost(t, x);
    }

    metrics.merit = merit(
        metrics.cost,
        metrics.state_eq_ise,
        metrics.state_eq_final_ise,
        metrics.inequality_penalty,
        state_constraint_penalty,
    );
    Ok(metrics)
}

/// `M = cost + ½·λ·(ISE₂ + ISE₂,final) + penalty_ineq`.
pub(crate) fn merit(
    cost: f64,
    state_eq_ise: f64,
    state_eq_final_ise: f64,
    inequality_penalty: f64,
    state_constraint_penalty: f64,
) -> f64 {
    cost + 0.5 * state_constraint_penalty * (state_eq_ise + state_eq_final_ise) + inequality_penalty
}
