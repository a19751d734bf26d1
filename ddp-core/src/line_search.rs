//! Greedy parallel line search over the feed-forward update.
//!
//! Workers claim step-size candidates `α_j = α_max · r^j` through an atomic
//! counter, roll each one out on private scratch, and commit improvements
//! under a single mutex. The largest `α` satisfying the descent condition
//! wins regardless of discovery order, because every commit is compared
//! against the running best; the early-termination flag only short-circuits
//! work that can no longer win.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use nalgebra::DVector;

use crate::controller::LinearController;
use crate::error::{DdpError, DdpResult};
use crate::merit::{evaluate_rollout_performance, PerformanceMetrics};
use crate::rollout::{rollout_trajectory, RolloutSpan};
use crate::solver::WorkerLocal;
use crate::threading::{CancellationToken, ThreadPool};
use crate::trajectory::Trajectory;
use crate::util::numerics::{almost_ge, LIMIT_EPSILON};

pub(crate) struct LineSearchInputs<'a> {
    pub span: RolloutSpan<'a>,
    pub workers: &'a [Mutex<WorkerLocal>],
    pub init_controllers: &'a [LinearController],
    pub init_state: &'a DVector<f64>,
    pub cancel: &'a CancellationToken,
    pub baseline_merit: f64,
    pub max_learning_rate: f64,
    pub min_learning_rate: f64,
    pub contraction_rate: f64,
    pub state_constraint_penalty: f64,
    pub input_dim: usize,
    pub final_active_partition: usize,
    pub num_partitions: usize,
    pub display_info: bool,
}

pub(crate) struct LineSearchOutcome {
    pub learning_rate_star: f64,
    pub metrics: PerformanceMetrics,
    pub stock: Vec<Trajectory>,
    pub controllers: Vec<LinearController>,
    pub committed: bool,
}

struct SharedState {
    learning_rate_star: f64,
    metrics: PerformanceMetrics,
    stock: Vec<Trajectory>,
    controllers: Vec<LinearController>,
    committed: bool,
    processed: Vec<bool>,
    error: Option<DdpError>,
}

/// Runs the candidate sweep. The baseline (α = 0) rollout has already been
/// performed by the caller; on return the best candidate, if any, is in the
/// outcome and the cancellation token is cleared.
pub(crate) fn search(pool: &ThreadPool, inputs: &LineSearchInputs<'_>) -> DdpResult<LineSearchOutcome> {
    // candidate count: j up to the first α below the minimum
    let floor_rate = inputs.min_learning_rate.max(LIMIT_EPSILON);
    let num_candidates = ((floor_rate / inputs.max_learning_rate).ln()
        / inputs.contraction_rate.ln())
    .floor() as usize
        + 1;

    let shared = Mutex::new(SharedState {
        learning_rate_star: 0.0,
        metrics: PerformanceMetrics::default(),
        stock: Vec::new(),
        controllers: Vec::new(),
        committed: false,
        processed: vec![false; num_candidates],
        error: None,
    });
    let next_candidate = AtomicUsize::new(0);

    pool.run_parallel(pool.n_threads(), |worker_id| {
        search_task(worker_id, inputs, num_candidates, &shared, &next_candidate);
    });

    inputs.cancel.clear();

    let state = shared.into_inner().unwrap();
    if let Some(error) = state.error {
        return Err(error);
    }
    Ok(LineSearchOutcome {
        learning_rate_star: state.learning_rate_star,
        metrics: state.metrics,
        stock: state.stock,
        controllers: state.controllers,
        committed: state.committed,
    })
}

fn search_task(
    worker_id: usize,
    inputs: &LineSearchInputs<'_>,
    num_candidates: usize,
    shared: &Mutex<SharedState>,
    next_candidate: &AtomicUsize,
) {
    let mut worker = inputs.workers[worker_id].lock().unwrap();
    let worker = &mut *worker;

    loop {
        let candidate = next_candidate.fetch_add(1, Ordering::Relaxed);
        if candidate >= num_candidates {
            break;
        }
        let learning_rate =
            inputs.max_learning_rate * inputs.contraction_rate.powi(candidate as i32);
        if !almost_ge(learning_rate, inputs.min_learning_rate) {
            break;
        }

        // advisory: a larger accepted step makes this candidate pointless
        {
            let state = shared.lock().unwrap();
            if state.error.is_some() || learning_rate < state.learning_rate_star {
                break;
            }
        }

        // apply the scaled feed-forward increment on a private copy
        let mut controllers = inputs.init_controllers.to_vec();
        for controller in controllers.iter_mut() {
            for (bias, delta) in controller.biases.iter_mut().zip(&controller.delta_biases) {
                *bias += delta * learning_rate;
            }
        }

        let mut stock = vec![Trajectory::default(); inputs.num_partitions];
        let evaluation = rollout_trajectory(
            &inputs.span,
            worker.rollout.as_mut(),
            worker.operating.as_mut(),
            &controllers,
            inputs.init_state,
            inputs.cancel,
            &mut stock,
        )
        .and_then(|_| {
            evaluate_rollout_performance(
                &mut worker.lq,
                worker.heuristics.as_mut(),
                &stock,
                inputs.final_active_partition,
                inputs.state_constraint_penalty,
                inputs.input_dim,
            )
        });

        let metrics = match evaluation {
            Ok(metrics) => metrics,
            Err(DdpError::RolloutDiverged(reason)) => {
                if inputs.display_info {
                    eprintln!(
                        "\t[worker {}] rollout with learning rate {:.4} terminated: {}",
                        worker_id, learning_rate, reason
                    );
                }
                PerformanceMetrics { merit: f64::INFINITY, ..Default::default() }
            }
            Err(error) => {
                let mut state = shared.lock().unwrap();
                if state.error.is_none() {
                    state.error = Some(error);
                }
                break;
            }
        };

        if inputs.display_info && metrics.merit.is_finite() {
            eprintln!(
                "\t[worker {}] learning rate {:.4} \t merit: {:.6} \t state-input eq ISE: {:.3e}",
                worker_id, learning_rate, metrics.merit, metrics.state_input_eq_ise
            );
        }

        let mut terminate = false;
        {
            let mut state = shared.lock().unwrap();

            // greedy selection: descent w.r.t. the baseline, largest step wins
            if metrics.merit < inputs.baseline_merit * (1.0 - 1e-3 * learning_rate)
                && learning_rate > state.learning_rate_star
            {
                state.learning_rate_star = learning_rate;
                state.metrics = metrics;
                state.stock = stock;
                state.controllers = controllers;
                state.committed = true;

                // if every larger candidate is done, nothing can beat this one
                terminate = state.processed[..candidate].iter().all(|&done| done);
            }
            state.processed[candidate] = true;
        }

        if terminate {
            inputs.cancel.cancel();
            if inputs.display_info {
                eprintln!("\t[worker {}] interrupting the remaining rollouts", worker_id);
            }
            break;
        }
    }
}
