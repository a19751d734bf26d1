//! Fixed-step RK4 rollout that honors mode-switch events.

use nalgebra::DVector;

use crate::controller::LinearController;
use crate::error::{DdpError, DdpResult};
use crate::model::SystemDynamics;
use crate::threading::CancellationToken;

use super::{RolloutEngine, RolloutSegment};

/// Integration settings of [`TimeTriggeredRollout`].
#[derive(Debug, Clone)]
pub struct RolloutSettings {
    /// Nominal integration step; the last step of each event-free interval
    /// shrinks to land exactly on the boundary.
    pub time_step: f64,
    /// Hard cap on steps per run, guarding against degenerate horizons.
    pub max_num_steps: usize,
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self { time_step: 1e-2, max_num_steps: 10_000_000 }
    }
}

/// Classical fourth-order Runge-Kutta integration of the controlled
/// dynamics. Events split the interval; at each one the pre-event sample is
/// recorded, the jump map applied, and the post-event sample recorded under
/// the same stamp.
pub struct TimeTriggeredRollout {
    dynamics: Box<dyn SystemDynamics>,
    settings: RolloutSettings,
}

impl TimeTriggeredRollout {
    pub fn new(dynamics: Box<dyn SystemDynamics>, settings: RolloutSettings) -> Self {
        Self { dynamics, settings }
    }

    pub fn settings(&self) -> &RolloutSettings {
        &self.settings
    }

    fn input_at(
        &self,
        controller: Option<&LinearController>,
        t: f64,
        x: &DVector<f64>,
    ) -> DVector<f64> {
        match controller {
            Some(c) if !c.is_empty() => c.compute_input(t, x),
            _ => DVector::zeros(self.dynamics.input_dim()),
        }
    }

    /// One RK4 step; the input is re-evaluated at every stage.
    fn step(
        &mut self,
        controller: Option<&LinearController>,
        t: f64,
        x: &DVector<f64>,
        dt: f64,
    ) -> DVector<f64> {
        let u1 = self.input_at(controller, t, x);
        let k1 = self.dynamics.flow_map(t, x, &u1);

        let x2 = x + &k1 * (dt / 2.0);
        let u2 = self.input_at(controller, t + dt / 2.0, &x2);
        let k2 = self.dynamics.flow_map(t + dt / 2.0, &x2, &u2);

        let x3 = x + &k2 * (dt / 2.0);
        let u3 = self.input_at(controller, t + dt / 2.0, &x3);
        let k3 = self.dynamics.flow_map(t + dt / 2.0, &x3, &u3);

        let x4 = x + &k3 * dt;
        let u4 = self.input_at(controller, t + dt, &x4);
        let k4 = self.dynamics.flow_map(t + dt, &x4, &u4);

        x + (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (dt / 6.0)
    }
}

impl RolloutEngine for TimeTriggeredRollout {
    fn run(
        &mut self,
        t0: f64,
        x0: &DVector<f64>,
        t1: f64,
        controller: Option<&LinearController>,
        event_times: &[f64],
        cancel: &CancellationToken,
    ) -> DdpResult<RolloutSegment> {
        let mut segment = RolloutSegment::default();
        if !(t1 > t0) {
            return Ok(segment);
        }

        // boundaries: events strictly inside (t0, t1), then the final time
        let mut boundaries: Vec<(f64, bool)> = event_times
            .iter()
            .copied()
            .filter(|&e| e > t0 && e < t1)
            .map(|e| (e, true))
            .collect();
        boundaries.push((t1, false));

        let mut t_current = t0;
        let mut x_current = x0.clone();
        let mut total_steps = 0usize;

        let u0 = self.input_at(controller, t_current, &x_current);
        segment.time.push(t_current);
        segment.state.push(x_current.clone());
        segment.input.push(u0);

        for (boundary, is_event) in boundaries {
            let span = boundary - t_current;
            if span > 0.0 {
                let steps = (span / self.settings.time_step).ceil().max(1.0) as usize;
                let dt = span / steps as f64;
                for _ in 0..steps {
                    if cancel.is_cancelled() {
                        return Err(DdpError::RolloutDiverged("integration cancelled".into()));
                    }
                    total_steps += 1;
                    if total_steps > self.settings.max_num_steps {
                        return Err(DdpError::RolloutDiverged(
                            "maximum number of integration steps exceeded".into(),
                        ));
                    }
                    x_current = self.step(controller, t_current, &x_current, dt);
                    t_current += dt;
                    if !x_current.iter().all(|v| v.is_finite()) {
                        return Err(DdpError::RolloutDiverged(format!(
                            "state became non-finite at t = {}",
                            t_current
                        )));
                    }
                    let u = self.input_at(controller, t_current, &x_current);
                    segment.time.push(t_current);
                    segment.state.push(x_current.clone());
                    segment.input.push(u);
                }
                t_current = boundary;
                *segment.time.last_mut().unwrap() = boundary;
            }

            if is_event {
                x_current = self.dynamics.jump_map(boundary, &x_current);
                let u = self.input_at(controller, boundary, &x_current);
                segment.post_event_indices.push(segment.time.len());
                segment.time.push(boundary);
                segment.state.push(x_current.clone());
                segment.input.push(u);
            }
        }

        Ok(segment)
    }

    fn clone_boxed(&self) -> Box<dyn RolloutEngine> {
        Box::new(Self { dynamics: self.dynamics.clone_boxed(), settings: self.settings.clone() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DMatrix, dvector};

    /// ẋ = u with a unit jump at events.
    #[derive(Clone)]
    struct Integrator;

    impl SystemDynamics for Integrator {
        fn state_dim(&self) -> usize {
            1
        }
        fn input_dim(&self) -> usize {
            1
        }
        fn flow_map(&mut self, _t: f64, _x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
            u.clone()
        }
        fn jump_map(&mut self, _t: f64, x: &DVector<f64>) -> DVector<f64> {
            x.add_scalar(1.0)
        }
        fn flow_map_state_derivative(
            &mut self,
            _t: f64,
            _x: &DVector<f64>,
            _u: &DVector<f64>,
        ) -> DMatrix<f64> {
            DMatrix::zeros(1, 1)
        }
        fn flow_map_input_derivative(
            &mut self,
            _t: f64,
            _x: &DVector<f64>,
            _u: &DVector<f64>,
        ) -> DMatrix<f64> {
            DMatrix::identity(1, 1)
        }
        fn clone_boxed(&self) -> Box<dyn SystemDynamics> {
            Box::new(self.clone())
        }
    }

    fn constant_input_controller(u: f64) -> LinearController {
        LinearController {
            time_stamp: vec![0.0, 10.0],
            gains: vec![DMatrix::zeros(1, 1), DMatrix::zeros(1, 1)],
            biases: vec![dvector![u], dvector![u]],
            delta_biases: vec![dvector![0.0], dvector![0.0]],
        }
    }

    #[test]
    fn integrates_constant_input_exactly() {
        let mut rollout = TimeTriggeredRollout::new(
            Box::new(Integrator),
            RolloutSettings { time_step: 0.1, ..Default::default() },
        );
        let controller = constant_input_controller(2.0);
        let cancel = CancellationToken::new();
        let segment = rollout
            .run(0.0, &dvector![1.0], 1.0, Some(&controller), &[], &cancel)
            .unwrap();
        assert_eq!(segment.time.first(), Some(&0.0));
        assert_eq!(segment.time.last(), Some(&1.0));
        let x_final = segment.state.last().unwrap();
        assert!((x_final[0] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn events_duplicate_the_stamp_and_apply_the_jump() {
        let mut rollout = TimeTriggeredRollout::new(
            Box::new(Integrator),
            RolloutSettings { time_step: 0.25, ..Default::default() },
        );
        let controller = constant_input_controller(0.0);
        let cancel = CancellationToken::new();
        let segment = rollout
            .run(0.0, &dvector![0.0], 1.0, Some(&controller), &[0.5], &cancel)
            .unwrap();
        assert_eq!(segment.post_event_indices.len(), 1);
        let j = segment.post_event_indices[0];
        assert_eq!(segment.time[j - 1], segment.time[j]);
        assert!((segment.state[j][0] - segment.state[j - 1][0] - 1.0).abs() < 1e-12);
        // the jump persists to the end
        assert!((segment.state.last().unwrap()[0] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn boundary_events_are_ignored() {
        let mut rollout =
            TimeTriggeredRollout::new(Box::new(Integrator), RolloutSettings::default());
        let controller = constant_input_controller(0.0);
        let cancel = CancellationToken::new();
        let segment = rollout
            .run(0.0, &dvector![0.0], 1.0, Some(&controller), &[0.0, 1.0], &cancel)
            .unwrap();
        assert!(segment.post_event_indices.is_empty());
    }

    #[test]
    fn cancelled_run_fails() {
        let mut rollout =
            TimeTriggeredRollout::new(Box::new(Integrator), RolloutSettings::default());
        let controller = constant_input_controller(0.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = rollout.run(0.0, &dvector![0.0], 1.0, Some(&controller), &[], &cancel);
        assert!(matches!(result, Err(DdpError::RolloutDiverged(_))));
    }
}
