//! ddp-core: differential dynamic programming for hybrid optimal control.
//!
//! This library implements a continuous-time DDP (iterative LQ) trajectory
//! optimizer for switched systems with state-input equality constraints,
//! state-only equality constraints (including constraints tied to switching
//! events), and inequality constraints handled by a relaxed log-barrier
//! penalty. Given an initial state, a partitioned time horizon, a mode
//! schedule and first/second-order models of dynamics, cost and constraints,
//! it produces a locally optimal affine time-varying feedback law
//! `u(t, x) = K(t)·x + b(t)` together with the nominal trajectories it
//! induces.
//!
//! # Algorithm
//!
//! Each outer iteration performs:
//!
//! 1. a **forward rollout** across the horizon partitions, stitching
//!    controller-driven and operating-point intervals around mode switches,
//! 2. a parallel **LQ approximation** of dynamics, cost and constraints at
//!    every trajectory node,
//! 3. a **Riccati backward sweep** producing the quadratic value-function
//!    model along the nominal trajectory,
//! 4. **controller synthesis** from the Riccati data, and
//! 5. a greedy parallel **line search** over the feed-forward update.
//!
//! The loop stops when the merit change and the state-input constraint ISE
//! fall below their thresholds, or after the configured iteration count.
//!
//! # Example
//!
//! ```ignore
//! use ddp_core::{ControlProblem, DdpSettings, DdpSolver};
//! use ddp_core::rollout::{RolloutSettings, TimeTriggeredRollout};
//!
//! let rollout = TimeTriggeredRollout::new(dynamics.clone_boxed(), RolloutSettings::default());
//! let problem = ControlProblem {
//!     dynamics,
//!     cost,
//!     constraints: Box::new(ddp_core::model::NoConstraints),
//!     operating_trajectories,
//!     heuristics: None,
//! };
//! let mut solver = DdpSolver::new(Box::new(rollout), problem, DdpSettings::default())?;
//! solver.solve(0.0, x0, 1.0, &[0.0, 1.0])?;
//! let solution = solver.primal_solution(1.0);
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)] // sweep drivers carry the full LQ node context

pub mod controller;
pub mod error;
pub mod lq;
pub mod model;
pub mod perf;
pub mod riccati;
pub mod rollout;
pub mod settings;
pub mod solver;
pub mod threading;
pub mod trajectory;
pub mod util;

mod line_search;
mod merit;

pub use controller::{FeedforwardController, LinearController, SolutionController};
pub use error::{DdpError, DdpResult};
pub use model::{
    ConstraintCollection, CostFunction, FixedOperatingPoint, NoConstraints,
    OperatingTrajectories, RelaxedBarrierPenalty, StageCostQuadratic, SystemDynamics,
    TerminalCostQuadratic,
};
pub use settings::DdpSettings;
pub use solver::{
    ControlProblem, DdpSolver, IterationLogEntry, ModeSchedule, PerformanceIndices,
    PrimalSolution,
};
