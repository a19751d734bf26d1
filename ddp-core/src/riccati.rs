//! Riccati backward sweep along the nominal trajectory and controller
//! synthesis from its results.

use nalgebra::{DMatrix, DVector};

use crate::error::{DdpError, DdpResult};
use crate::model::{EventModelData, ModelData};
use crate::trajectory::Trajectory;
use crate::util::interp::time_segment;
use crate::util::numerics::{matrix_is_finite, vector_is_finite};

/// Terminal boundary condition of one partition's backward sweep, together
/// with the nominal state it was linearized around.
#[derive(Debug, Clone)]
pub struct TerminalSeed {
    pub sm: DMatrix<f64>,
    pub sv: DVector<f64>,
    pub sve: DVector<f64>,
    pub s: f64,
    pub x_final: DVector<f64>,
}

impl TerminalSeed {
    pub fn zeros(state_dim: usize) -> Self {
        Self {
            sm: DMatrix::zeros(state_dim, state_dim),
            sv: DVector::zeros(state_dim),
            sve: DVector::zeros(state_dim),
            s: 0.0,
            x_final: DVector::zeros(state_dim),
        }
    }
}

/// Quadratic value-function data along one partition:
/// `V(t, x) = s(t) + Δx·(Sv + Sve) + ½·Δx·Sm·Δx`.
#[derive(Debug, Clone, Default)]
pub struct RiccatiData {
    pub time: Vec<f64>,
    pub sm: Vec<DMatrix<f64>>,
    pub sv: Vec<DVector<f64>>,
    pub sve: Vec<DVector<f64>>,
    pub s: Vec<f64>,
}

impl RiccatiData {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn clear(&mut self) {
        self.time.clear();
        self.sm.clear();
        self.sv.clear();
        self.sve.clear();
        self.s.clear();
    }
}

/// Backward-pass collaborator: populates the value function of one partition
/// from its node-wise LQ data and a terminal seed.
pub trait RiccatiSolver: Send {
    #[allow(clippy::too_many_arguments)]
    fn solve_partition(
        &mut self,
        time: &[f64],
        post_event_indices: &[usize],
        model_data: &[ModelData],
        event_data: &[EventModelData],
        seed: &TerminalSeed,
        max_substep: f64,
        store_substeps: bool,
    ) -> DdpResult<RiccatiData>;

    fn clone_boxed(&self) -> Box<dyn RiccatiSolver>;
}

impl Clone for Box<dyn RiccatiSolver> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// LQ coefficients at one backward-pass evaluation point.
struct LqPoint {
    am: DMatrix<f64>,
    bm: DMatrix<f64>,
    q: f64,
    qv: DVector<f64>,
    qm: DMatrix<f64>,
    rv: DVector<f64>,
    rm: DMatrix<f64>,
    pm: DMatrix<f64>,
}

impl LqPoint {
    fn blend(a: &ModelData, b: &ModelData, alpha: f64) -> Self {
        let w = 1.0 - alpha;
        Self {
            am: &a.dynamics_state_derivative * w + &b.dynamics_state_derivative * alpha,
            bm: &a.dynamics_input_derivative * w + &b.dynamics_input_derivative * alpha,
            q: a.cost * w + b.cost * alpha,
            qv: &a.cost_state_derivative * w + &b.cost_state_derivative * alpha,
            qm: &a.cost_state_second_derivative * w + &b.cost_state_second_derivative * alpha,
            rv: &a.cost_input_derivative * w + &b.cost_input_derivative * alpha,
            rm: &a.cost_input_second_derivative * w + &b.cost_input_second_derivative * alpha,
            pm: &a.cost_input_state_derivative * w + &b.cost_input_state_derivative * alpha,
        }
    }

    /// Backward derivative of `(Sm, Sv, s)`: the rate of change of the value
    /// function as time runs from the partition end toward its start.
    fn backward_derivative(
        &self,
        sm: &DMatrix<f64>,
        sv: &DVector<f64>,
    ) -> DdpResult<(DMatrix<f64>, DVector<f64>, f64)> {
        let chol = self.rm.clone().cholesky().ok_or_else(|| {
            DdpError::NumericalInstability("input cost Hessian is not positive definite".into())
        })?;

        // G = Pm + Bm'·Sm, g = Rv + Bm'·Sv
        let g_m = &self.pm + self.bm.transpose() * sm;
        let g_v = &self.rv + self.bm.transpose() * sv;
        let rm_inv_gm = chol.solve(&g_m);
        let rm_inv_gv = chol.solve(&g_v);

        let d_sm = &self.qm + self.am.transpose() * sm + sm * &self.am
            - g_m.transpose() * &rm_inv_gm;
        let d_sv = &self.qv + self.am.transpose() * sv - g_m.transpose() * &rm_inv_gv;
        let d_s = self.q - 0.5 * g_v.dot(&rm_inv_gv);
        Ok((d_sm, d_sv, d_s))
    }
}

/// Heun integration of the continuous-time Riccati equations over the
/// nominal time grid, with LQ data interpolated linearly between nodes and
/// event quadratics added across duplicated stamps.
#[derive(Debug, Clone)]
pub struct SequentialRiccatiSolver {
    pub check_numerical_stability: bool,
}

impl SequentialRiccatiSolver {
    pub fn new(check_numerical_stability: bool) -> Self {
        Self { check_numerical_stability }
    }

    fn check_node(&self, t: f64, sm: &DMatrix<f64>, sv: &DVector<f64>, s: f64) -> DdpResult<()> {
        if self.check_numerical_stability
            && !(s.is_finite() && vector_is_finite(sv) && matrix_is_finite(sm))
        {
            return Err(DdpError::NumericalInstability(format!(
                "non-finite Riccati data at t = {}",
                t
            )));
        }
        Ok(())
    }
}

fn apply_event(
    event: &EventModelData,
    sm: &mut DMatrix<f64>,
    sv: &mut DVector<f64>,
    s: &mut f64,
) {
    *sm += &event.cost_state_second_derivative;
    *sv += &event.cost_state_derivative;
    *s += event.cost;
}

impl RiccatiSolver for SequentialRiccatiSolver {
    fn solve_partition(
        &mut self,
        time: &[f64],
        post_event_indices: &[usize],
        model_data: &[ModelData],
        event_data: &[EventModelData],
        seed: &TerminalSeed,
        max_substep: f64,
        store_substeps: bool,
    ) -> DdpResult<RiccatiData> {
        let n = time.len();
        let mut out = RiccatiData::default();
        if n == 0 {
            return Ok(out);
        }
        debug_assert_eq!(model_data.len(), n);
        debug_assert_eq!(event_data.len(), post_event_indices.len());

        let state_dim = seed.sv.len();
        let mut sm = seed.sm.clone();
        let mut sv = seed.sv.clone();
        let mut s = seed.s;

        // an event whose post sample lies past the end acts on the last node
        if let Some(ke) = post_event_indices.iter().position(|&idx| idx == n) {
            apply_event(&event_data[ke], &mut sm, &mut sv, &mut s);
        }

        // collected back-to-front, reversed at the end
        let record = |t: f64,
                          sm: &DMatrix<f64>,
                          sv: &DVector<f64>,
                          s: f64,
                          out: &mut RiccatiData| {
            out.time.push(t);
            out.sm.push(sm.clone());
            out.sv.push(sv.clone());
            out.sve.push(DVector::zeros(state_dim));
            out.s.push(s);
        };
        record(time[n - 1], &sm, &sv, s, &mut out);
        self.check_node(time[n - 1], &sm, &sv, s)?;

        let max_substep = max_substep.max(1e-12);
        for k in (0..n - 1).rev() {
            if let Some(ke) = post_event_indices.iter().position(|&idx| idx == k + 1) {
                // duplicated stamp: add the event quadratics, no time step
                apply_event(&event_data[ke], &mut sm, &mut sv, &mut s);
            } else {
                let dt = time[k + 1] - time[k];
                if dt > 0.0 {
                    let substeps = (dt / max_substep).ceil().max(1.0) as usize;
                    let h = dt / substeps as f64;
                    for j in 0..substeps {
                        let tau = time[k + 1] - j as f64 * h;
                        let alpha_hi = (tau - time[k]) / dt;
                        let alpha_lo = (tau - h - time[k]) / dt;

                        let point = LqPoint::blend(&model_data[k], &model_data[k + 1], alpha_hi);
                        let (k1_sm, k1_sv, k1_s) = point.backward_derivative(&sm, &sv)?;

                        let sm_pred = &sm + &k1_sm * h;
                        let sv_pred = &sv + &k1_sv * h;
                        let point_lo =
                            LqPoint::blend(&model_data[k], &model_data[k + 1], alpha_lo.max(0.0));
                        let (k2_sm, k2_sv, k2_s) =
                            point_lo.backward_derivative(&sm_pred, &sv_pred)?;

                        sm += (k1_sm + k2_sm) * (0.5 * h);
                        sv += (k1_sv + k2_sv) * (0.5 * h);
                        s += (k1_s + k2_s) * 0.5 * h;

                        // keep the Hessian symmetric under accumulated drift
                        sm = (&sm + sm.transpose()) * 0.5;

                        if store_substeps && j + 1 < substeps {
                            record(tau - h, &sm, &sv, s, &mut out);
                            self.check_node(tau - h, &sm, &sv, s)?;
                        }
                    }
                }
            }
            record(time[k], &sm, &sv, s, &mut out);
            self.check_node(time[k], &sm, &sv, s)?;
        }

        out.time.reverse();
        out.sm.reverse();
        out.sv.reverse();
        out.sve.reverse();
        out.s.reverse();
        Ok(out)
    }

    fn clone_boxed(&self) -> Box<dyn RiccatiSolver> {
        Box::new(self.clone())
    }
}

/// One synthesized controller node: `(τ, K, b, Δb)`.
pub(crate) type ControllerNode = (f64, DMatrix<f64>, DVector<f64>, DVector<f64>);

/// Builds the affine feedback at Riccati node `k` of a partition:
/// `K = −Rm⁻¹·(Pm + Bm'·Sm)`, `b = u_nom − K·x_nom`,
/// `Δb = −Rm⁻¹·(Rv + Bm'·Sv)`.
pub(crate) fn compute_controller_node(
    trajectory: &Trajectory,
    riccati: &RiccatiData,
    k: usize,
    check_numerical_stability: bool,
) -> DdpResult<ControllerNode> {
    let tau = riccati.time[k];
    let aligned = riccati.len() == trajectory.len();

    let (bm, rm, rv, pm, x_nom, u_nom) = if aligned {
        let md = &trajectory.model_data[k];
        (
            md.dynamics_input_derivative.clone(),
            md.cost_input_second_derivative.clone(),
            md.cost_input_derivative.clone(),
            md.cost_input_state_derivative.clone(),
            trajectory.state[k].clone(),
            trajectory.input[k].clone(),
        )
    } else {
        let seg = time_segment(tau, &trajectory.time);
        let hi = (seg.index + 1).min(trajectory.len() - 1);
        let point = LqPoint::blend(
            &trajectory.model_data[seg.index],
            &trajectory.model_data[hi],
            seg.alpha,
        );
        let x = crate::util::interp::interpolate(seg, &trajectory.state);
        let u = crate::util::interp::interpolate(seg, &trajectory.input);
        (point.bm, point.rm, point.rv, point.pm, x, u)
    };

    let chol = rm.cholesky().ok_or_else(|| {
        DdpError::NumericalInstability("input cost Hessian is not positive definite".into())
    })?;
    let gain = -chol.solve(&(&pm + bm.transpose() * &riccati.sm[k]));
    let delta_bias = -chol.solve(&(&rv + bm.transpose() * &riccati.sv[k]));
    let bias = u_nom - &gain * x_nom;

    if check_numerical_stability
        && !(matrix_is_finite(&gain) && vector_is_finite(&bias) && vector_is_finite(&delta_bias))
    {
        return Err(DdpError::NumericalInstability(format!(
            "non-finite controller gains at t = {}",
            tau
        )));
    }
    Ok((tau, gain, bias, delta_bias))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    fn scalar_lqr_model(t: f64) -> ModelData {
        // ẋ = u, ℓ = ½(x² + u²)
        ModelData {
            time: t,
            dynamics_state_derivative: dmatrix![0.0],
            dynamics_input_derivative: dmatrix![1.0],
            cost: 0.0,
            cost_state_derivative: dvector![0.0],
            cost_state_second_derivative: dmatrix![1.0],
            cost_input_derivative: dvector![0.0],
            cost_input_second_derivative: dmatrix![1.0],
            cost_input_state_derivative: dmatrix![0.0],
            ..Default::default()
        }
    }

    #[test]
    fn scalar_riccati_matches_tanh_solution() {
        // -Ṗ = 1 − P², P(1) = 0 ⇒ P(t) = tanh(1 − t)
        let n = 101;
        let time: Vec<f64> = (0..n).map(|k| k as f64 / (n - 1) as f64).collect();
        let model: Vec<ModelData> = time.iter().map(|&t| scalar_lqr_model(t)).collect();
        let mut solver = SequentialRiccatiSolver::new(true);
        let data = solver
            .solve_partition(&time, &[], &model, &[], &TerminalSeed::zeros(1), 1e-3, false)
            .unwrap();
        assert_eq!(data.len(), n);
        for (k, &t) in time.iter().enumerate() {
            let expected = (1.0 - t).tanh();
            assert!(
                (data.sm[k][(0, 0)] - expected).abs() < 1e-5,
                "P({}) = {}, expected {}",
                t,
                data.sm[k][(0, 0)],
                expected
            );
        }
    }

    #[test]
    fn event_quadratics_jump_across_duplicated_stamps() {
        let time = vec![0.0, 0.5, 0.5, 1.0];
        let model: Vec<ModelData> = time.iter().map(|&t| scalar_lqr_model(t)).collect();
        let event = EventModelData {
            time: 0.5,
            cost: 2.0,
            cost_state_derivative: dvector![0.0],
            cost_state_second_derivative: dmatrix![3.0],
            ..Default::default()
        };
        let mut solver = SequentialRiccatiSolver::new(true);
        let data = solver
            .solve_partition(
                &time,
                &[2],
                &model,
                std::slice::from_ref(&event),
                &TerminalSeed::zeros(1),
                1e-3,
                false,
            )
            .unwrap();
        // node 1 (pre-event) = node 2 (post-event) + event quadratics
        assert!((data.s[1] - data.s[2] - 2.0).abs() < 1e-12);
        assert!((data.sm[1][(0, 0)] - data.sm[2][(0, 0)] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn controller_gain_is_riccati_feedback() {
        let mut trajectory = Trajectory::default();
        trajectory.append_segment(
            vec![0.0, 1.0],
            Vec::new(),
            vec![dvector![1.0], dvector![0.5]],
            vec![dvector![0.0], dvector![0.0]],
        );
        for (k, md) in trajectory.model_data.iter_mut().enumerate() {
            *md = scalar_lqr_model(trajectory.time[k]);
        }
        let riccati = RiccatiData {
            time: vec![0.0, 1.0],
            sm: vec![dmatrix![0.5], dmatrix![0.0]],
            sv: vec![dvector![0.2], dvector![0.0]],
            sve: vec![dvector![0.0], dvector![0.0]],
            s: vec![0.0, 0.0],
        };
        let (tau, gain, bias, delta_bias) =
            compute_controller_node(&trajectory, &riccati, 0, true).unwrap();
        assert_eq!(tau, 0.0);
        // K = −(Pm + Bm'Sm)/Rm = −0.5, Δb = −(Rv + Bm'Sv)/Rm = −0.2
        assert!((gain[(0, 0)] + 0.5).abs() < 1e-12);
        assert!((delta_bias[0] + 0.2).abs() < 1e-12);
        // b reproduces the nominal input at the nominal state
        assert!((bias[0] - (0.0 - (-0.5) * 1.0)).abs() < 1e-12);
    }
}
