//! Scalar LQR example demonstrating the DDP solver.
//!
//! Solves:
//!   minimize    ∫₀¹ ½(x² + u²) dt
//!   subject to  ẋ = u,  x(0) = 1
//!
//! The analytic optimum is ½·tanh(1)·x₀² ≈ 0.3808 with the feedback law
//! u = −tanh(1 − t)·x.

use nalgebra::{dmatrix, dvector, DMatrix, DVector};

use ddp_core::model::{
    CostFunction, FixedOperatingPoint, NoConstraints, StageCostQuadratic, SystemDynamics,
    TerminalCostQuadratic,
};
use ddp_core::rollout::{RolloutSettings, TimeTriggeredRollout};
use ddp_core::{ControlProblem, DdpSettings, DdpSolver};

#[derive(Clone)]
struct ScalarIntegrator;

impl SystemDynamics for ScalarIntegrator {
    fn state_dim(&self) -> usize {
        1
    }
    fn input_dim(&self) -> usize {
        1
    }
    fn flow_map(&mut self, _t: f64, _x: &DVector<f64>, u: &DVector<f64>) -> DVector<f64> {
        u.clone()
    }
    fn flow_map_state_derivative(
        &mut self,
        _t: f64,
        _x: &DVector<f64>,
        _u: &DVector<f64>,
    ) -> DMatrix<f64> {
        dmatrix![0.0]
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

#[derive(Clone)]
struct QuadraticCost;

impl CostFunction for QuadraticCost {
    fn stage_cost(&mut self, _t: f64, x: &DVector<f64>, u: &DVector<f64>) -> f64 {
        0.5 * (x[0] * x[0] + u[0] * u[0])
    }
    fn stage_quadratic(
        &mut self,
        _t: f64,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> StageCostQuadratic {
        StageCostQuadratic {
            value: 0.5 * (x[0] * x[0] + u[0] * u[0]),
            state_derivative: x.clone(),
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

fn main() {
    println!("DDP Solver - Scalar LQR Example");
    println!("================================");

    let rollout = TimeTriggeredRollout::new(
        Box::new(ScalarIntegrator),
        RolloutSettings { time_step: 1e-3, ..Default::default() },
    );
    let problem = ControlProblem {
        dynamics: Box::new(ScalarIntegrator),
        cost: Box::new(QuadraticCost),
        constraints: Box::new(NoConstraints),
        operating_trajectories: Box::new(FixedOperatingPoint::new(dvector![0.0], dvector![0.0])),
        heuristics: None,
    };
    let settings = DdpSettings {
        n_threads: 2,
        max_num_iterations: 8,
        min_rel_cost: 1e-9,
        display_short_summary: true,
        ..Default::default()
    };

    let mut solver =
        DdpSolver::new(Box::new(rollout), problem, settings).expect("solver construction failed");

    match solver.solve(0.0, dvector![1.0], 1.0, &[0.0, 1.0]) {
        Ok(()) => {
            let indices = solver.performance_indices();
            println!("\n=== Solution ===");
            println!("merit:            {:.6}", indices.merit);
            println!("analytic optimum: {:.6}", 0.5 * 1.0_f64.tanh());
            println!("V(0, x0):         {:.6}", solver.value_function(0.0, &dvector![1.0]));
            println!("iterations:       {}", solver.iterations() + 1);
        }
        Err(error) => eprintln!("solve failed: {}", error),
    }
}
