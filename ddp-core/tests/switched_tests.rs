//! End-to-end tests on a three-mode switched linear system with events at
//! t = 1 and t = 2 on the horizon [0, 3], plus rollout-failure recovery and
//! warm-start caching scenarios.

use nalgebra::{dmatrix, dvector, DMatrix, DVector};

use ddp_core::model::{
    CostFunction, FixedOperatingPoint, NoConstraints, StageCostQuadratic, SystemDynamics,
    TerminalCostQuadratic,
};
use ddp_core::rollout::{RolloutSettings, TimeTriggeredRollout};
use ddp_core::util::interp::interpolate_at;
use ddp_core::{ControlProblem, DdpSettings, DdpSolver, ModeSchedule};

/// ẋ = A_σ(t)·x + B·u with σ switching at the stored event times.
#[derive(Clone)]
struct SwitchedLinearSystem {
    event_times: Vec<f64>,
}

impl SwitchedLinearSystem {
    fn system_matrix(&self, t: f64) -> DMatrix<f64> {
        let mode = self.event_times.partition_point(|&e| e <= t);
        match mode {
            0 => dmatrix![-0.5, 1.0; -1.0, -0.5],
            1 => dmatrix![-1.0, 0.5; -0.5, -1.0],
            _ => dmatrix![-0.3, -0.6; 0.6, -0.3],
        }
    }
}

impl SystemDynamics for SwitchedLinearSystem {
    fn state_dim(&self) -> usize {
        2
    }
    fn input_dim(&self) -> usize {
        1
    }
    fn flow_map(&mut self, t: f64, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        self.system_matrix(t) * x + dvector![0.0, u[0]]
    }
    fn flow_map_state_derivative(
        &mut self,
        t: f64,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
    ) -> DMatrix<f64> {
        self.system_matrix(t)
    }
    fn flow_map_input_derivative(
        &mut self,
        _t: f64,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
    ) -> DMatrix<f64> {
        dmatrix![0.0; 1.0]
    }
    fn clone_boxed(&self) -> Box<dyn SystemDynamics> {
        Box::new(self.clone())
    }
}

/// ℓ = ½(‖x‖² + u²), event and terminal cost ½‖x‖².
#[derive(Clone)]
struct RegulatorCost;

impl CostFunction for RegulatorCost {
    fn stage_cost(&mut self, _t: f64, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
        0.5 * (x.norm_squared() + u.norm_squared())
    }
    fn stage_quadratic(
        &mut self,
        _t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> StageCostQuadratic {
        StageCostQuadratic {
            value: 0.5 * (x.norm_squared() + u.norm_squared()),
            state_derivative: x.clone(),
            state_second_derivative: DMatrix::identity(2, 2),
            input_derivative: u.clone(),
            input_second_derivative: DMatrix::identity(1, 1),
            input_state_derivative: DMatrix::zeros(1, 2),
        }
    }
    fn terminal_cost(&mut self, _t: f64, x: &DVector<f64>) -> f64 {
        0.5 * x.norm_squared()
    }
    fn terminal_quadratic(&mut self, _t: f64, x: &DVector<f64>) -> TerminalCostQuadratic {
        TerminalCostQuadratic {
            value: 0.5 * x.norm_squared(),
            state_derivative: x.clone(),
            state_second_derivative: DMatrix::identity(2, 2),
        }
    }
    fn clone_boxed(&self) -> Box<dyn CostFunction> {
        Box::new(self.clone())
    }
}

fn switched_solver(n_threads: usize, event_times: Vec<f64>) -> DdpSolver {
    let dynamics = SwitchedLinearSystem { event_times: event_times.clone() };
    let rollout = TimeTriggeredRollout::new(
        Box::new(dynamics.clone()),
        RolloutSettings { time_step: 5e-3, ..Default::default() },
    );
    let problem = ControlProblem {
        dynamics: Box::new(dynamics),
        cost: Box::new(RegulatorCost),
        constraints: Box::new(NoConstraints),
        operating_trajectories: Box::new(FixedOperatingPoint::new(
            dvector![0.0, 0.0],
            dvector![0.0],
        )),
        heuristics: None,
    };
    let settings = DdpSettings {
        n_threads,
        max_num_iterations: 20,
        min_rel_cost: 1e-8,
        ..Default::default()
    };
    let mut solver =
        DdpSolver::new(Box::new(rollout), problem, settings).expect("solver construction failed");
    let mode_sequence = (0..=event_times.len()).collect();
    solver.set_mode_schedule(ModeSchedule::new(event_times, mode_sequence)).unwrap();
    solver
}

#[test]
fn converges_on_the_switched_system_with_interior_events() {
    let mut solver = switched_solver(2, vec![1.0, 2.0]);
    solver
        .solve(0.0, dvector![2.0, 3.0], 3.0, &[0.0, 1.5, 3.0])
        .expect("solve failed");

    let indices = solver.performance_indices();
    assert!(indices.merit.is_finite());
    assert!(indices.merit > 0.0);
    assert_eq!(indices.state_input_eq_ise, 0.0);

    // the log starts at the operating-point iteration and improves afterwards
    let log = solver.iterations_log();
    assert!(log.len() >= 3);
    assert!(log.last().unwrap().merit <= log[1].merit + 1e-6);
}

#[test]
fn events_inside_partitions_duplicate_their_stamps() {
    let mut solver = switched_solver(2, vec![1.0, 2.0]);
    solver
        .solve(0.0, dvector![2.0, 3.0], 3.0, &[0.0, 1.5, 3.0])
        .expect("solve failed");

    let solution = solver.primal_solution(3.0);
    for &event in &[1.0, 2.0] {
        let count = solution.time.iter().filter(|&&t| t == event).count();
        assert_eq!(count, 2, "event at t = {} should appear as a duplicated stamp", event);
    }
    assert_eq!(solution.mode_schedule.event_times, vec![1.0, 2.0]);
}

#[test]
fn converged_cost_is_invariant_to_the_thread_count() {
    let mut merits = Vec::new();
    for &n_threads in &[1usize, 2, 4] {
        let mut solver = switched_solver(n_threads, vec![1.0, 2.0]);
        solver
            .solve(0.0, dvector![2.0, 3.0], 3.0, &[0.0, 1.5, 3.0])
            .expect("solve failed");
        merits.push(solver.performance_indices().merit);
    }
    for pair in merits.windows(2) {
        assert!(
            (pair[0] - pair[1]).abs() < 1e-6,
            "thread counts disagree: {:?}",
            merits
        );
    }
}

#[test]
fn rewind_shifts_controllers_and_zeroes_the_tail() {
    let mut solver = switched_solver(1, vec![1.0, 2.0]);
    solver
        .solve(0.0, dvector![2.0, 3.0], 3.0, &[0.0, 1.0, 2.0, 3.0])
        .expect("solve failed");

    let shifted_stamps = solver.controllers()[1].time_stamp.clone();
    let last_stamps = solver.controllers()[2].time_stamp.clone();
    assert!(!shifted_stamps.is_empty());

    solver.rewind(1).expect("rewind failed");
    assert_eq!(solver.controllers()[0].time_stamp, shifted_stamps);
    assert_eq!(solver.controllers()[1].time_stamp, last_stamps);
    assert!(solver.controllers()[2].is_empty());
    assert_eq!(solver.rewind_counter(), 1);

    assert!(solver.rewind(99).is_err());
}

#[test]
fn adjust_controller_spreads_stamps_onto_moved_events() {
    let mut solver = switched_solver(1, vec![1.0, 2.0]);
    solver
        .solve(0.0, dvector![2.0, 3.0], 3.0, &[0.0, 1.5, 3.0])
        .expect("solve failed");

    solver.adjust_controller(&[1.1, 2.1], &[1.0, 2.0]);
    let mut saw_moved_event = false;
    for controller in solver.controllers() {
        assert!(controller.time_stamp.windows(2).all(|w| w[0] <= w[1]));
        saw_moved_event |= controller.time_stamp.iter().any(|&t| (t - 1.1).abs() < 1e-9);
    }
    assert!(saw_moved_event, "no controller stamp landed on the moved event time");
}

#[test]
fn warm_started_horizon_shift_passes_the_cache_debug_checks() {
    let dynamics = SwitchedLinearSystem { event_times: vec![1.0, 2.0] };
    let rollout = TimeTriggeredRollout::new(
        Box::new(dynamics.clone()),
        RolloutSettings { time_step: 5e-3, ..Default::default() },
    );
    let problem = ControlProblem {
        dynamics: Box::new(dynamics),
        cost: Box::new(RegulatorCost),
        constraints: Box::new(NoConstraints),
        operating_trajectories: Box::new(FixedOperatingPoint::new(
            dvector![0.0, 0.0],
            dvector![0.0],
        )),
        heuristics: None,
    };
    let settings = DdpSettings {
        n_threads: 2,
        max_num_iterations: 10,
        debug_caching: true,
        ..Default::default()
    };
    let mut solver =
        DdpSolver::new(Box::new(rollout), problem, settings).expect("solver construction failed");
    solver.set_mode_schedule(ModeSchedule::new(vec![1.0, 2.0], vec![0, 1, 2])).unwrap();

    let partitions = [0.0, 1.0, 2.0, 3.0];
    solver
        .solve(0.0, dvector![2.0, 3.0], 2.5, &partitions)
        .expect("first solve failed");

    // shift the receding horizon and warm start from the internal controllers
    let solution = solver.primal_solution(2.5);
    let shifted_state = interpolate_at(0.3, &solution.time, &solution.state);
    solver
        .solve(0.3, shifted_state, 2.8, &partitions)
        .expect("warm-started solve failed the cache consistency checks");
}

/// ẋ = −x + u, failing with a non-finite state once `|u|` exceeds the bound.
#[derive(Clone)]
struct FragileSystem {
    input_bound: f64,
}

impl SystemDynamics for FragileSystem {
    fn state_dim(&self) -> usize {
        1
    }
    fn input_dim(&self) -> usize {
        1
    }
    fn flow_map(&mut self, _t: f64, x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        if u[0].abs() > self.input_bound {
            dvector![f64::NAN]
        } else {
            dvector![-x[0] + u[0]]
        }
    }
    fn flow_map_state_derivative(
        &mut self,
        _t: f64,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
    ) -> DMatrix<f64> {
        dmatrix![-1.0]
    }
    fn flow_map_input_derivative(
        &mut self,
        _t: f64,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
    ) -> DMatrix<f64> {
        dmatrix![1.0]
    }
    fn clone_boxed(&self) -> Box<dyn SystemDynamics> {
        Box::new(self.clone())
    }
}

/// ℓ = ½((x − 5)² + u²): the tracking target needs inputs far above the
/// fragile system's bound, so every line-search candidate diverges.
#[derive(Clone)]
struct UnreachableTargetCost;

impl CostFunction for UnreachableTargetCost {
    fn stage_cost(&mut self, _t: f64, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
        0.5 * ((x[0] - 5.0).powi(2) + u[0] * u[0])
    }
    fn stage_quadratic(
        &mut self,
        _t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> StageCostQuadratic {
        StageCostQuadratic {
            value: 0.5 * ((x[0] - 5.0).powi(2) + u[0] * u[0]),
            state_derivative: dvector![x[0] - 5.0],
            state_second_derivative: dmatrix![1.0],
            input_derivative: u.clone(),
            input_second_derivative: dmatrix![1.0],
            input_state_derivative: dmatrix![0.0],
        }
    }
    fn terminal_cost(&mut self, _t: f64, _x: &DVector<f64>) -> f64 {
        0.0
    }
    fn terminal_quadratic(&mut self, _t: f64, _x: &DVector<f64>) -> TerminalCostQuadratic {
        TerminalCostQuadratic {
            value: 0.0,
            state_derivative: dvector![0.0],
            state_second_derivative: dmatrix![0.0],
        }
    }
    fn clone_boxed(&self) -> Box<dyn CostFunction> {
        Box::new(self.clone())
    }
}

#[test]
fn diverging_candidates_keep_the_baseline_and_finish() {
    let rollout = TimeTriggeredRollout::new(
        Box::new(FragileSystem { input_bound: 0.01 }),
        RolloutSettings { time_step: 1e-2, ..Default::default() },
    );
    let problem = ControlProblem {
        dynamics: Box::new(FragileSystem { input_bound: 0.01 }),
        cost: Box::new(UnreachableTargetCost),
        constraints: Box::new(NoConstraints),
        operating_trajectories: Box::new(FixedOperatingPoint::new(dvector![0.0], dvector![0.0])),
        heuristics: None,
    };
    let settings = DdpSettings { n_threads: 2, max_num_iterations: 4, ..Default::default() };
    let mut solver =
        DdpSolver::new(Box::new(rollout), problem, settings).expect("solver construction failed");

    solver
        .solve(0.0, dvector![0.0], 1.0, &[0.0, 1.0])
        .expect("outer loop must survive diverging candidates");

    // every candidate overdrives the input, so the baseline rollout remains:
    // x ≡ 0, u ≡ 0, merit = ∫ ½·25 dt = 12.5
    let merit = solver.performance_indices().merit;
    assert!((merit - 12.5).abs() < 1e-9, "baseline merit not retained: {}", merit);
    assert!(solver.iterations_log().iter().all(|entry| entry.merit.is_finite()));
}
