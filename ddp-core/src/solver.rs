//! The DDP outer loop: forward rollout, LQ approximation, Riccati sweep,
//! controller synthesis, line search and convergence control.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Instant;

use nalgebra::{DMatrix, DVector};

use crate::controller::{FeedforwardController, LinearController, SolutionController};
use crate::error::{DdpError, DdpResult};
use crate::line_search::{self, LineSearchInputs};
use crate::lq::{LqApproximator, PsdPolicy};
use crate::merit::{evaluate_rollout_performance, PerformanceMetrics};
use crate::model::{
    ConstraintCollection, CostFunction, EventModelData, OperatingTrajectories,
    RelaxedBarrierPenalty, SystemDynamics, TerminalCostQuadratic,
};
use crate::perf::{BenchmarkSection, BenchmarkTimers};
use crate::riccati::{
    compute_controller_node, RiccatiData, RiccatiSolver, SequentialRiccatiSolver, TerminalSeed,
};
use crate::rollout::{
    rollout_trajectory, OperatingTrajectoriesRollout, RolloutEngine, RolloutSpan,
};
use crate::settings::DdpSettings;
use crate::threading::{CancellationToken, ThreadPool};
use crate::trajectory::{correct_init_cache, swap_stocks, Trajectory};
use crate::util::interp::{find_partition, interpolate, interpolate_at, time_segment};
use crate::util::numerics::{vector_is_finite, LIMIT_EPSILON};

/// Ordered event times and the subsystem id active between them.
#[derive(Debug, Clone)]
pub struct ModeSchedule {
    pub event_times: Vec<f64>,
    pub mode_sequence: Vec<usize>,
}

impl Default for ModeSchedule {
    fn default() -> Self {
        Self { event_times: Vec::new(), mode_sequence: vec![0] }
    }
}

impl ModeSchedule {
    pub fn new(event_times: Vec<f64>, mode_sequence: Vec<usize>) -> Self {
        Self { event_times, mode_sequence }
    }

    /// Subsystem id active at `t`.
    pub fn mode_at(&self, t: f64) -> usize {
        let i = self.event_times.partition_point(|&e| e <= t);
        self.mode_sequence.get(i).copied().unwrap_or(0)
    }
}

/// The collaborators defining one optimal-control problem. Each is cloned
/// once per worker at solver construction.
pub struct ControlProblem {
    pub dynamics: Box<dyn SystemDynamics>,
    pub cost: Box<dyn CostFunction>,
    pub constraints: Box<dyn ConstraintCollection>,
    pub operating_trajectories: Box<dyn OperatingTrajectories>,
    /// Terminal cost at the end of the horizon; the stage cost's terminal
    /// model is used when absent.
    pub heuristics: Option<Box<dyn CostFunction>>,
}

/// Optimized trajectories and controller over a query horizon.
#[derive(Debug, Clone)]
pub struct PrimalSolution {
    pub time: Vec<f64>,
    pub state: Vec<DVector<f64>>,
    pub input: Vec<DVector<f64>>,
    pub controller: SolutionController,
    pub mode_schedule: ModeSchedule,
}

/// Merit and equality-constraint ISEs of the current nominal trajectory.
#[derive(Debug, Clone, Copy, Default)]
pub struct PerformanceIndices {
    pub merit: f64,
    pub state_input_eq_ise: f64,
    pub state_eq_ise: f64,
}

/// One outer-iteration record.
#[derive(Debug, Clone, Copy)]
pub struct IterationLogEntry {
    pub merit: f64,
    pub state_input_eq_ise: f64,
    pub state_eq_ise: f64,
}

/// Collaborator clones owned by one worker; indexing by worker id removes
/// all sharing during the parallel sections.
pub(crate) struct WorkerLocal {
    pub rollout: Box<dyn RolloutEngine>,
    pub operating: Box<dyn RolloutEngine>,
    pub lq: LqApproximator,
    pub heuristics: Box<dyn CostFunction>,
    pub riccati: Box<dyn RiccatiSolver>,
}

/// DDP trajectory optimizer for hybrid (switched) systems.
pub struct DdpSolver {
    settings: DdpSettings,
    pool: ThreadPool,
    workers: Vec<Mutex<WorkerLocal>>,
    cancel: CancellationToken,

    state_dim: usize,
    input_dim: usize,
    mode_schedule: ModeSchedule,

    init_time: f64,
    final_time: f64,
    init_state: DVector<f64>,
    partitioning_times: Vec<f64>,
    num_partitions: usize,
    init_active_partition: usize,
    final_active_partition: usize,

    nominal_controllers: Vec<LinearController>,
    nominal: Vec<Trajectory>,
    cached: Vec<Trajectory>,
    event_data: Vec<Vec<EventModelData>>,
    riccati: Vec<RiccatiData>,
    seeds: Vec<TerminalSeed>,
    heuristics_value: TerminalCostQuadratic,

    metrics: PerformanceMetrics,
    learning_rate_star: f64,
    max_learning_rate: f64,
    iteration: usize,
    rewind_counter: u64,
    iteration_log: Vec<IterationLogEntry>,
    timers: BenchmarkTimers,

    riccati_worker_ranges: Vec<(i64, i64)>,
    avg_time_step_fp: f64,
    avg_time_step_bp: f64,
}

impl DdpSolver {
    pub fn new(
        rollout: Box<dyn RolloutEngine>,
        problem: ControlProblem,
        settings: DdpSettings,
    ) -> DdpResult<Self> {
        settings.validate()?;

        let state_dim = problem.dynamics.state_dim();
        let input_dim = problem.dynamics.input_dim();
        let heuristics = problem.heuristics.unwrap_or_else(|| problem.cost.clone_boxed());
        let penalty = RelaxedBarrierPenalty::new(
            settings.inequality_constraint_mu,
            settings.inequality_constraint_delta,
        );

        let workers = (0..settings.n_threads)
            .map(|_| {
                Mutex::new(WorkerLocal {
                    rollout: rollout.clone_boxed(),
                    operating: Box::new(OperatingTrajectoriesRollout::new(
                        problem.operating_trajectories.clone_boxed(),
                    )) as Box<dyn RolloutEngine>,
                    lq: LqApproximator::new(
                        problem.dynamics.clone_boxed(),
                        problem.cost.clone_boxed(),
                        problem.constraints.clone_boxed(),
                        penalty.clone(),
                        settings.check_numerical_stability,
                    ),
                    heuristics: heuristics.clone_boxed(),
                    riccati: Box::new(SequentialRiccatiSolver::new(
                        settings.check_numerical_stability,
                    )) as Box<dyn RiccatiSolver>,
                })
            })
            .collect();

        let pool = ThreadPool::new(settings.n_threads);

        Ok(Self {
            settings,
            pool,
            workers,
            cancel: CancellationToken::new(),
            state_dim,
            input_dim,
            mode_schedule: ModeSchedule::default(),
            init_time: 0.0,
            final_time: 0.0,
            init_state: DVector::zeros(state_dim),
            partitioning_times: Vec::new(),
            num_partitions: 0,
            init_active_partition: 0,
            final_active_partition: 0,
            nominal_controllers: Vec::new(),
            nominal: Vec::new(),
            cached: Vec::new(),
            event_data: Vec::new(),
            riccati: Vec::new(),
            seeds: Vec::new(),
            heuristics_value: TerminalCostQuadratic::default(),
            metrics: PerformanceMetrics::default(),
            learning_rate_star: 1.0,
            max_learning_rate: 1.0,
            iteration: 0,
            rewind_counter: 0,
            iteration_log: Vec::new(),
            timers: BenchmarkTimers::default(),
            riccati_worker_ranges: Vec::new(),
            avg_time_step_fp: 0.0,
            avg_time_step_bp: 0.0,
        })
    }

    pub fn set_mode_schedule(&mut self, mode_schedule: ModeSchedule) -> DdpResult<()> {
        if mode_schedule.mode_sequence.len() != mode_schedule.event_times.len() + 1 {
            return Err(DdpError::BadInput(format!(
                "mode sequence of length {} does not match {} event times",
                mode_schedule.mode_sequence.len(),
                mode_schedule.event_times.len()
            )));
        }
        self.mode_schedule = mode_schedule;
        Ok(())
    }

    pub fn mode_schedule(&self) -> &ModeSchedule {
        &self.mode_schedule
    }

    /// Optimizes over `[init_time, final_time]` starting from the internal
    /// controller stock (empty on a fresh solver, warm on repeated calls).
    pub fn solve(
        &mut self,
        init_time: f64,
        init_state: DVector<f64>,
        final_time: f64,
        partitioning_times: &[f64],
    ) -> DdpResult<()> {
        self.solve_impl(init_time, init_state, final_time, partitioning_times, None)
    }

    /// Same as [`Self::solve`] but replaces the internal controller stock
    /// with caller-supplied initializers (one per partition).
    pub fn solve_with_controllers(
        &mut self,
        init_time: f64,
        init_state: DVector<f64>,
        final_time: f64,
        partitioning_times: &[f64],
        controllers: Vec<LinearController>,
    ) -> DdpResult<()> {
        self.solve_impl(init_time, init_state, final_time, partitioning_times, Some(controllers))
    }

    fn solve_impl(
        &mut self,
        init_time: f64,
        init_state: DVector<f64>,
        final_time: f64,
        partitioning_times: &[f64],
        controllers: Option<Vec<LinearController>>,
    ) -> DdpResult<()> {
        self.settings.validate()?;

        if partitioning_times.len() < 2 {
            return Err(DdpError::BadInput("there should be at least one time partition".into()));
        }
        if partitioning_times.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DdpError::BadInput(
                "partitioning times must be strictly increasing".into(),
            ));
        }
        if !(init_time < final_time) {
            return Err(DdpError::BadInput(format!(
                "initial time {} is not before final time {}",
                init_time, final_time
            )));
        }
        if init_state.len() != self.state_dim {
            return Err(DdpError::BadInput(format!(
                "initial state has dimension {}, expected {}",
                init_state.len(),
                self.state_dim
            )));
        }
        if !vector_is_finite(&init_state) {
            return Err(DdpError::BadInput(format!(
                "initial state is not finite (time: {})",
                init_time
            )));
        }

        let num_partitions = partitioning_times.len() - 1;
        if self.num_partitions != num_partitions {
            self.setup_optimizer(num_partitions)?;
        }
        self.partitioning_times = partitioning_times.to_vec();
        self.init_active_partition = find_partition(partitioning_times, init_time);
        self.final_active_partition = find_partition(partitioning_times, final_time);

        if let Some(controllers) = controllers {
            if controllers.len() != num_partitions {
                return Err(DdpError::BadController(format!(
                    "{} initial controllers for {} partitions",
                    controllers.len(),
                    num_partitions
                )));
            }
            for (i, controller) in controllers.iter().enumerate() {
                if !controller.is_consistent(self.state_dim, self.input_dim) {
                    return Err(DdpError::BadController(format!(
                        "initial controller {} is not an affine time-varying law of \
                         matching dimensions",
                        i
                    )));
                }
            }
            self.nominal_controllers = controllers;
        }

        if self.settings.display_info {
            eprintln!("\n+++++++++++++ DDP solver is initialized +++++++++++++");
            eprintln!("rewind counter: {}", self.rewind_counter);
            eprintln!("solving from t = {} to t = {}", init_time, final_time);
        }

        self.iteration = 0;
        self.init_time = init_time;
        self.final_time = final_time;
        self.init_state = init_state;
        self.iteration_log.clear();

        let mut is_init_controller_empty =
            self.nominal_controllers.iter().any(|c| c.is_empty());

        self.distribute_work();

        if self.settings.display_info {
            eprintln!("\n#### Iteration 0 (dynamics might have been violated)");
        }
        self.run_init()?;
        self.push_iteration_log();

        let mut converged = false;
        let mut rel_cost = 0.0;
        let mut rel_constraint1_ise = 0.0;
        let mut learning_rate_star_zero = false;

        while self.iteration + 1 < self.settings.max_num_iterations && !converged {
            self.iteration += 1;

            if self.settings.display_info {
                eprintln!("\n#### Iteration {}", self.iteration);
                let (max_uff, max_uee) = self.controller_update_max_norms();
                eprintln!("max feedforward update norm:  {:.3e}", max_uff);
                eprintln!("max controller mismatch norm: {:.3e}", max_uee);
            }

            let cached_merit = self.metrics.merit;
            let cached_constraint1_ise = self.metrics.state_input_eq_ise;

            swap_stocks(&mut self.nominal, &mut self.cached);
            self.run_iteration()?;
            self.push_iteration_log();

            rel_cost = (self.metrics.merit - cached_merit).abs();
            rel_constraint1_ise =
                (self.metrics.state_input_eq_ise - cached_constraint1_ise).abs();
            let constraint1_satisfied = self.metrics.state_input_eq_ise
                <= self.settings.min_abs_constraint1_ise
                || rel_constraint1_ise <= self.settings.min_rel_constraint1_ise;
            learning_rate_star_zero =
                self.learning_rate_star == 0.0 && !is_init_controller_empty;
            let cost_converged =
                rel_cost <= self.settings.min_rel_cost || learning_rate_star_zero;
            converged = cost_converged && constraint1_satisfied;
            is_init_controller_empty = false;
        }

        // the final pass applies the last computed update and leaves the
        // optimized trajectories in the nominal stock
        swap_stocks(&mut self.nominal, &mut self.cached);
        self.max_learning_rate = self.settings.max_learning_rate;
        let start = Instant::now();
        self.run_line_search()?;
        self.timers.add(BenchmarkSection::LineSearch, start.elapsed());

        if self.settings.display_info || self.settings.display_short_summary {
            eprintln!("\n+++++++++++++ DDP solver has terminated +++++++++++++");
            eprintln!("time period:          [{}, {}]", self.init_time, self.final_time);
            eprintln!(
                "number of iterations: {} out of {}",
                self.iteration + 1,
                self.settings.max_num_iterations
            );
            self.print_rollout_info();
            if converged {
                if learning_rate_star_zero {
                    eprintln!("terminated: the learning rate was reduced to zero");
                } else {
                    eprintln!("terminated: merit change {:.3e} reached the threshold", rel_cost);
                }
                if self.metrics.state_input_eq_ise <= self.settings.min_abs_constraint1_ise {
                    eprintln!(
                        "state-input constraint absolute ISE {:.3e} reached the threshold",
                        self.metrics.state_input_eq_ise
                    );
                } else {
                    eprintln!(
                        "state-input constraint ISE change {:.3e} reached the threshold",
                        rel_constraint1_ise
                    );
                }
            } else {
                eprintln!("terminated: maximum number of iterations reached");
            }
            self.timers.print_summary();
        }
        Ok(())
    }

    fn run_init(&mut self) -> DdpResult<()> {
        swap_stocks(&mut self.nominal, &mut self.cached);

        let start = Instant::now();
        self.forward_pass()?;
        self.timers.add(BenchmarkSection::ForwardPass, start.elapsed());

        // needed by moving-horizon warm starts and by the very first solve
        correct_init_cache(
            &self.nominal,
            &mut self.cached,
            self.init_active_partition,
            self.final_active_partition,
            self.settings.debug_caching,
        )?;

        let start = Instant::now();
        self.approximate_problem()?;
        self.evaluate_nominal()?;
        self.timers.add(BenchmarkSection::LqApproximation, start.elapsed());

        let start = Instant::now();
        self.solve_riccati()?;
        self.timers.add(BenchmarkSection::BackwardPass, start.elapsed());

        let start = Instant::now();
        self.compute_controllers()?;
        self.timers.add(BenchmarkSection::ComputeController, start.elapsed());

        if self.settings.display_info {
            self.print_rollout_info();
        }
        Ok(())
    }

    fn run_iteration(&mut self) -> DdpResult<()> {
        self.max_learning_rate = self.settings.max_learning_rate;
        let start = Instant::now();
        self.run_line_search()?;
        self.timers.add(BenchmarkSection::LineSearch, start.elapsed());

        let start = Instant::now();
        self.approximate_problem()?;
        self.timers.add(BenchmarkSection::LqApproximation, start.elapsed());

        let start = Instant::now();
        self.solve_riccati()?;
        self.timers.add(BenchmarkSection::BackwardPass, start.elapsed());

        let start = Instant::now();
        self.compute_controllers()?;
        self.timers.add(BenchmarkSection::ComputeController, start.elapsed());

        if self.settings.display_info {
            self.print_rollout_info();
        }
        Ok(())
    }

    /// Rollout of the current controller stock into the nominal store.
    fn forward_pass(&mut self) -> DdpResult<()> {
        let mut nominal = std::mem::take(&mut self.nominal);
        let result = {
            let span = self.span();
            let mut worker = self.workers[0].lock().unwrap();
            let worker = &mut *worker;
            rollout_trajectory(
                &span,
                worker.rollout.as_mut(),
                worker.operating.as_mut(),
                &self.nominal_controllers,
                &self.init_state,
                &self.cancel,
                &mut nominal,
            )
        };
        self.nominal = nominal;
        self.avg_time_step_fp = result?;
        Ok(())
    }

    /// Cost/constraint metrics of the nominal trajectory (worker 0).
    fn evaluate_nominal(&mut self) -> DdpResult<()> {
        let penalty = self.state_constraint_penalty();
        let mut worker = self.workers[0].lock().unwrap();
        let worker = &mut *worker;
        self.metrics = evaluate_rollout_performance(
            &mut worker.lq,
            worker.heuristics.as_mut(),
            &self.nominal,
            self.final_active_partition,
            penalty,
            self.input_dim,
        )?;
        Ok(())
    }

    /// Baseline rollout followed by the greedy parallel candidate sweep.
    fn run_line_search(&mut self) -> DdpResult<()> {
        self.forward_pass()?;
        self.evaluate_nominal()?;
        self.learning_rate_star = 0.0;

        if self.settings.display_info {
            eprintln!(
                "\t[baseline] learning rate 0.0 \t merit: {:.6} \t state-input eq ISE: {:.3e}",
                self.metrics.merit, self.metrics.state_input_eq_ise
            );
        }

        if self.max_learning_rate < LIMIT_EPSILON {
            for controller in &mut self.nominal_controllers {
                controller.delta_biases.clear();
            }
            if self.settings.display_info {
                eprintln!("the chosen learning rate is: 0");
            }
            return Ok(());
        }

        let outcome = {
            let inputs = LineSearchInputs {
                span: self.span(),
                workers: &self.workers,
                init_controllers: &self.nominal_controllers,
                init_state: &self.init_state,
                cancel: &self.cancel,
                baseline_merit: self.metrics.merit,
                max_learning_rate: self.max_learning_rate,
                min_learning_rate: self.settings.min_learning_rate,
                contraction_rate: self.settings.line_search_contraction_rate,
                state_constraint_penalty: self.state_constraint_penalty(),
                input_dim: self.input_dim,
                final_active_partition: self.final_active_partition,
                num_partitions: self.num_partitions,
                display_info: self.settings.display_info,
            };
            line_search::search(&self.pool, &inputs)?
        };

        if outcome.committed {
            self.nominal = outcome.stock;
            self.nominal_controllers = outcome.controllers;
            self.metrics = outcome.metrics;
            self.learning_rate_star = outcome.learning_rate_star;
        }
        for controller in &mut self.nominal_controllers {
            controller.delta_biases.clear();
        }

        if self.settings.display_info {
            eprintln!("the chosen learning rate is: {}", self.learning_rate_star);
        }
        Ok(())
    }

    /// Schedules the per-node LQ approximation across the pool; nodes are
    /// claimed through an atomic counter and each destination slot is written
    /// exactly once.
    fn approximate_problem(&mut self) -> DdpResult<()> {
        let penalty = self.state_constraint_penalty();
        let psd = PsdPolicy {
            use_make_psd: self.settings.use_make_psd,
            added_diagonal: self.settings.added_riccati_diagonal,
        };

        type NodeResult = (usize, crate::model::ModelData, Option<(usize, EventModelData)>);

        for i in 0..self.num_partitions {
            let num_nodes = self.nominal[i].len();
            let num_events = self.nominal[i].post_event_indices.len();
            self.event_data[i] = vec![EventModelData::default(); num_events];
            if num_nodes == 0 {
                continue;
            }

            let results: Vec<Mutex<Vec<NodeResult>>> =
                (0..self.pool.n_threads()).map(|_| Mutex::new(Vec::new())).collect();
            let error: Mutex<Option<DdpError>> = Mutex::new(None);
            let next_node = AtomicUsize::new(0);
            {
                let trajectory = &self.nominal[i];
                let workers = &self.workers;
                self.pool.run_parallel(self.pool.n_threads(), |worker_id| {
                    let mut worker = workers[worker_id].lock().unwrap();
                    let mut local: Vec<NodeResult> = Vec::new();
                    loop {
                        if error.lock().unwrap().is_some() {
                            break;
                        }
                        let k = next_node.fetch_add(1, Ordering::Relaxed);
                        if k >= num_nodes {
                            break;
                        }
                        let t = trajectory.time[k];
                        let x = &trajectory.state[k];
                        let u = &trajectory.input[k];

                        let node = worker.lq.approximate_node(t, x, u, psd).and_then(|md| {
                            let event_ordinal = trajectory
                                .post_event_indices
                                .iter()
                                .position(|&idx| idx == k + 1);
                            match event_ordinal {
                                None => Ok((k, md, None)),
                                Some(ke) => worker
                                    .lq
                                    .approximate_event(t, x, penalty, psd)
                                    .map(|ed| (k, md, Some((ke, ed)))),
                            }
                        });
                        match node {
                            Ok(result) => local.push(result),
                            Err(e) => {
                                let mut guard = error.lock().unwrap();
                                if guard.is_none() {
                                    *guard = Some(e);
                                }
                                break;
                            }
                        }
                    }
                    *results[worker_id].lock().unwrap() = local;
                });
            }
            if let Some(e) = error.into_inner().unwrap() {
                return Err(e);
            }
            for bucket in results {
                for (k, model_data, event) in bucket.into_inner().unwrap() {
                    self.nominal[i].model_data[k] = model_data;
                    if let Some((ke, event_data)) = event {
                        self.event_data[i][ke] = event_data;
                    }
                }
            }
        }

        // terminal heuristic at the end of the horizon
        let final_trajectory = &self.nominal[self.final_active_partition];
        let (Some(&t), Some(x)) = (final_trajectory.time.last(), final_trajectory.state.last())
        else {
            return Err(DdpError::RolloutDiverged(
                "final active partition has no samples".into(),
            ));
        };
        let mut worker = self.workers[0].lock().unwrap();
        let mut quadratic = worker.heuristics.terminal_quadratic(t, x);
        drop(worker);
        psd.apply(&mut quadratic.state_second_derivative);
        if self.settings.check_numerical_stability
            && !(quadratic.value.is_finite()
                && vector_is_finite(&quadratic.state_derivative)
                && crate::util::numerics::matrix_is_finite(&quadratic.state_second_derivative))
        {
            return Err(DdpError::NumericalInstability(
                "non-finite terminal heuristic quadratic".into(),
            ));
        }
        self.heuristics_value = quadratic;
        Ok(())
    }

    /// Backward sweep. The first iteration runs sequentially right-to-left;
    /// afterwards partitions are distributed over the pool, each worker
    /// waiting until its boundary seed has been materialized, so results are
    /// identical for every thread count.
    fn solve_riccati(&mut self) -> DdpResult<()> {
        let init_active = self.init_active_partition;
        let final_active = self.final_active_partition;
        let state_dim = self.state_dim;

        let x_final = self.nominal[final_active]
            .last_state()
            .cloned()
            .unwrap_or_else(|| DVector::zeros(state_dim));
        self.seeds[final_active] = TerminalSeed {
            sm: self.heuristics_value.state_second_derivative.clone(),
            sv: self.heuristics_value.state_derivative.clone(),
            sve: DVector::zeros(state_dim),
            s: self.heuristics_value.value,
            x_final,
        };

        let max_substep = if self.avg_time_step_fp > 0.0 { self.avg_time_step_fp } else { 1e-2 };
        let store_substeps = !self.settings.use_nominal_time_for_backward_pass;

        for i in 0..self.num_partitions {
            if i < init_active || i > final_active {
                self.riccati[i].clear();
            }
        }

        if self.iteration == 0 {
            let mut worker = self.workers[0].lock().unwrap();
            for i in (init_active..=final_active).rev() {
                let trajectory = &self.nominal[i];
                let seed = self.seeds[i].clone();
                let data = worker.riccati.solve_partition(
                    &trajectory.time,
                    &trajectory.post_event_indices,
                    &trajectory.model_data,
                    &self.event_data[i],
                    &seed,
                    max_substep,
                    store_substeps,
                )?;
                if i > 0 {
                    self.seeds[i - 1] = partition_start_seed(&data, trajectory, &seed);
                }
                self.riccati[i] = data;
            }
        } else {
            type PartitionResult = (usize, RiccatiData, TerminalSeed);
            let board = Mutex::new(vec![None::<TerminalSeed>; self.num_partitions]);
            board.lock().unwrap()[final_active] = Some(self.seeds[final_active].clone());
            let seed_ready = Condvar::new();
            let results: Vec<Mutex<Vec<PartitionResult>>> =
                (0..self.pool.n_threads()).map(|_| Mutex::new(Vec::new())).collect();
            let error: Mutex<Option<DdpError>> = Mutex::new(None);
            {
                let ranges = &self.riccati_worker_ranges;
                let workers = &self.workers;
                let nominal = &self.nominal;
                let event_data = &self.event_data;
                self.pool.run_parallel(self.pool.n_threads(), |worker_id| {
                    let (start, end) = ranges[worker_id];
                    if start > end {
                        return;
                    }
                    let mut worker = workers[worker_id].lock().unwrap();
                    let mut local: Vec<PartitionResult> = Vec::new();
                    for i in (start..=end).rev() {
                        if i < init_active as i64 || i > final_active as i64 {
                            continue;
                        }
                        let i = i as usize;
                        if error.lock().unwrap().is_some() {
                            break;
                        }

                        let seed = {
                            let mut guard = board.lock().unwrap();
                            loop {
                                if let Some(seed) = guard[i].as_ref() {
                                    break seed.clone();
                                }
                                guard = seed_ready.wait(guard).unwrap();
                            }
                        };

                        let trajectory = &nominal[i];
                        match worker.riccati.solve_partition(
                            &trajectory.time,
                            &trajectory.post_event_indices,
                            &trajectory.model_data,
                            &event_data[i],
                            &seed,
                            max_substep,
                            store_substeps,
                        ) {
                            Ok(data) => {
                                let next_seed = partition_start_seed(&data, trajectory, &seed);
                                if i > 0 {
                                    let mut guard = board.lock().unwrap();
                                    guard[i - 1] = Some(next_seed.clone());
                                    seed_ready.notify_all();
                                }
                                local.push((i, data, next_seed));
                            }
                            Err(e) => {
                                // record and unblock every waiter
                                let mut guard = error.lock().unwrap();
                                if guard.is_none() {
                                    *guard = Some(e);
                                }
                                drop(guard);
                                let mut guard = board.lock().unwrap();
                                for slot in guard.iter_mut() {
                                    if slot.is_none() {
                                        *slot = Some(TerminalSeed::zeros(state_dim));
                                    }
                                }
                                seed_ready.notify_all();
                                break;
                            }
                        }
                    }
                    *results[worker_id].lock().unwrap() = local;
                });
            }
            if let Some(e) = error.into_inner().unwrap() {
                return Err(e);
            }
            for bucket in results {
                for (i, data, next_seed) in bucket.into_inner().unwrap() {
                    self.riccati[i] = data;
                    if i > 0 {
                        self.seeds[i - 1] = next_seed;
                    }
                }
            }
        }

        let num_steps: usize = self.riccati.iter().map(|d| d.len()).sum();
        self.avg_time_step_bp =
            if num_steps > 0 { (self.final_time - self.init_time) / num_steps as f64 } else { 0.0 };
        Ok(())
    }

    /// Synthesizes the affine controller of every active partition; nodes
    /// are claimed through an atomic counter.
    fn compute_controllers(&mut self) -> DdpResult<()> {
        let check = self.settings.check_numerical_stability;
        type NodeResult = (usize, crate::riccati::ControllerNode);

        for i in 0..self.num_partitions {
            if i < self.init_active_partition || i > self.final_active_partition {
                self.nominal_controllers[i].clear();
                continue;
            }
            let num_nodes = self.riccati[i].len();
            if num_nodes == 0 {
                self.nominal_controllers[i].clear();
                continue;
            }

            let results: Vec<Mutex<Vec<NodeResult>>> =
                (0..self.pool.n_threads()).map(|_| Mutex::new(Vec::new())).collect();
            let error: Mutex<Option<DdpError>> = Mutex::new(None);
            let next_node = AtomicUsize::new(0);
            {
                let trajectory = &self.nominal[i];
                let riccati = &self.riccati[i];
                self.pool.run_parallel(self.pool.n_threads(), |worker_id| {
                    let mut local: Vec<NodeResult> = Vec::new();
                    loop {
                        if error.lock().unwrap().is_some() {
                            break;
                        }
                        let k = next_node.fetch_add(1, Ordering::Relaxed);
                        if k >= num_nodes {
                            break;
                        }
                        match compute_controller_node(trajectory, riccati, k, check) {
                            Ok(node) => local.push((k, node)),
                            Err(e) => {
                                let mut guard = error.lock().unwrap();
                                if guard.is_none() {
                                    *guard = Some(e);
                                }
                                break;
                            }
                        }
                    }
                    *results[worker_id].lock().unwrap() = local;
                });
            }
            if let Some(e) = error.into_inner().unwrap() {
                return Err(e);
            }

            let mut controller = LinearController {
                time_stamp: vec![0.0; num_nodes],
                gains: vec![DMatrix::zeros(self.input_dim, self.state_dim); num_nodes],
                biases: vec![DVector::zeros(self.input_dim); num_nodes],
                delta_biases: vec![DVector::zeros(self.input_dim); num_nodes],
            };
            for bucket in results {
                for (k, (tau, gain, bias, delta_bias)) in bucket.into_inner().unwrap() {
                    controller.time_stamp[k] = tau;
                    controller.gains[k] = gain;
                    controller.biases[k] = bias;
                    controller.delta_biases[k] = delta_bias;
                }
            }
            self.nominal_controllers[i] = controller;
        }
        Ok(())
    }

    /// Clears per-partition data without freeing the stores.
    pub fn reset(&mut self) {
        self.iteration = 0;
        self.rewind_counter = 0;
        self.learning_rate_star = 1.0;
        self.max_learning_rate = 1.0;
        for i in 0..self.num_partitions {
            self.nominal_controllers[i].clear();
            self.nominal[i].clear();
            self.cached[i].clear();
            self.riccati[i].clear();
            self.event_data[i].clear();
            self.seeds[i] = TerminalSeed::zeros(self.state_dim);
        }
        self.metrics = PerformanceMetrics::default();
        self.iteration_log.clear();
        self.timers.reset();
    }

    /// Shifts the last `K − first_index` partitions leftward and zeroes the
    /// tail; used when the receding horizon moves past a partition boundary.
    pub fn rewind(&mut self, first_index: usize) -> DdpResult<()> {
        if first_index == 0 {
            return Ok(());
        }
        if first_index > self.num_partitions {
            return Err(DdpError::BadInput(format!(
                "rewind index {} exceeds the {} partitions",
                first_index, self.num_partitions
            )));
        }
        self.rewind_counter += first_index as u64;

        let preserved = self.num_partitions - first_index;
        for i in 0..self.num_partitions {
            if i < preserved {
                self.nominal_controllers.swap(i, first_index + i);
                self.seeds[i] = self.seeds[first_index + i].clone();
            } else {
                self.nominal_controllers[i].clear();
                self.seeds[i] = TerminalSeed::zeros(self.state_dim);
            }
        }
        Ok(())
    }

    pub fn rewind_counter(&self) -> u64 {
        self.rewind_counter
    }

    /// Remaps the controller time stamps after event times have moved,
    /// spreading each controller piece from the old event locations onto the
    /// new ones (identity shift beyond the first/last pair).
    pub fn adjust_controller(&mut self, new_event_times: &[f64], controller_event_times: &[f64]) {
        let pairs = new_event_times.len().min(controller_event_times.len());
        if pairs == 0 {
            return;
        }
        let old = &controller_event_times[..pairs];
        let new = &new_event_times[..pairs];

        let remap = |t: f64| -> f64 {
            if t <= old[0] {
                return t + (new[0] - old[0]);
            }
            if t >= old[pairs - 1] {
                return t + (new[pairs - 1] - old[pairs - 1]);
            }
            let seg = time_segment(t, old);
            let dt = old[seg.index + 1] - old[seg.index];
            let alpha = if dt > 0.0 { (t - old[seg.index]) / dt } else { 0.0 };
            new[seg.index] + alpha * (new[seg.index + 1] - new[seg.index])
        };

        for controller in &mut self.nominal_controllers {
            for stamp in &mut controller.time_stamp {
                *stamp = remap(*stamp);
            }
        }
    }

    /// Concatenated optimized trajectories and controller up to `final_time`.
    pub fn primal_solution(&self, final_time: f64) -> PrimalSolution {
        let mut time = Vec::new();
        let mut state = Vec::new();
        let mut input = Vec::new();
        for i in self.init_active_partition..=self.final_active_partition {
            let trajectory = &self.nominal[i];
            if trajectory.is_empty() {
                continue;
            }
            if trajectory.time[0] > final_time {
                break;
            }
            let length = trajectory.time.partition_point(|&v| v <= final_time);
            time.extend_from_slice(&trajectory.time[..length]);
            state.extend_from_slice(&trajectory.state[..length]);
            input.extend_from_slice(&trajectory.input[..length]);
        }

        let controller = if self.settings.use_feedback_policy {
            let mut stock = LinearController::default();
            for i in self.init_active_partition..=self.final_active_partition {
                let source = &self.nominal_controllers[i];
                if source.is_empty() {
                    continue;
                }
                if source.time_stamp[0] > final_time {
                    break;
                }
                let length = source.time_stamp.partition_point(|&v| v <= final_time);
                stock.concatenate(source, length);
            }
            SolutionController::Feedback(stock)
        } else {
            SolutionController::Feedforward(FeedforwardController::new(
                time.clone(),
                input.clone(),
            ))
        };

        PrimalSolution {
            time,
            state,
            input,
            controller,
            mode_schedule: self.mode_schedule.clone(),
        }
    }

    /// Quadratic value-function model around the nominal trajectory:
    /// `V(t, x) = s + Δx·(Sv + Sve) + ½·Δx·Sm·Δx`.
    pub fn value_function(&self, t: f64, x: &DVector<f64>) -> f64 {
        let partition = find_partition(&self.partitioning_times, t);
        let data = &self.riccati[partition];
        if data.is_empty() {
            return 0.0;
        }
        let segment = time_segment(t, &data.time);
        let sm = interpolate(segment, &data.sm);
        let sv = interpolate(segment, &data.sv);
        let sve = interpolate(segment, &data.sve);
        let s = interpolate(segment, &data.s);

        let trajectory = &self.nominal[partition];
        let x_nominal = interpolate_at(t, &trajectory.time, &trajectory.state);
        let dx = x - x_nominal;
        s + dx.dot(&(sv + sve)) + 0.5 * dx.dot(&(&sm * &dx))
    }

    /// Gradient of [`Self::value_function`] in the state:
    /// `Sm·Δx + Sv + Sve`.
    pub fn value_function_state_derivative(&self, t: f64, x: &DVector<f64>) -> DVector<f64> {
        let partition = find_partition(&self.partitioning_times, t);
        let data = &self.riccati[partition];
        if data.is_empty() {
            return DVector::zeros(self.state_dim);
        }
        let segment = time_segment(t, &data.time);
        let sm = interpolate(segment, &data.sm);
        let sv = interpolate(segment, &data.sv);
        let sve = interpolate(segment, &data.sve);

        let trajectory = &self.nominal[partition];
        let x_nominal = interpolate_at(t, &trajectory.time, &trajectory.state);
        let dx = x - x_nominal;
        sm * dx + sv + sve
    }

    pub fn performance_indices(&self) -> PerformanceIndices {
        PerformanceIndices {
            merit: self.metrics.merit,
            state_input_eq_ise: self.metrics.state_input_eq_ise,
            state_eq_ise: self.metrics.state_eq_ise,
        }
    }

    pub fn iterations_log(&self) -> &[IterationLogEntry] {
        &self.iteration_log
    }

    pub fn iterations(&self) -> usize {
        self.iteration
    }

    pub fn final_time(&self) -> f64 {
        self.final_time
    }

    pub fn partitioning_times(&self) -> &[f64] {
        &self.partitioning_times
    }

    pub fn controllers(&self) -> &[LinearController] {
        &self.nominal_controllers
    }

    /// Largest feed-forward increment norm and largest mismatch between the
    /// controller and the nominal input along the stock.
    pub fn controller_update_max_norms(&self) -> (f64, f64) {
        let mut max_delta_uff: f64 = 0.0;
        let mut max_delta_uee: f64 = 0.0;
        for i in self.init_active_partition..=self.final_active_partition {
            let controller = &self.nominal_controllers[i];
            let trajectory = &self.nominal[i];
            for k in 0..controller.len() {
                if let Some(delta) = controller.delta_biases.get(k) {
                    max_delta_uff = max_delta_uff.max(delta.norm());
                }
                if trajectory.is_empty() {
                    continue;
                }
                let segment = time_segment(controller.time_stamp[k], &trajectory.time);
                let x_nominal = interpolate(segment, &trajectory.state);
                let u_nominal = interpolate(segment, &trajectory.input);
                let mismatch = u_nominal - &controller.gains[k] * x_nominal - &controller.biases[k];
                max_delta_uee = max_delta_uee.max(mismatch.norm());
            }
        }
        (max_delta_uff, max_delta_uee)
    }

    fn setup_optimizer(&mut self, num_partitions: usize) -> DdpResult<()> {
        if num_partitions == 0 {
            return Err(DdpError::BadInput("number of partitions cannot be zero".into()));
        }
        self.num_partitions = num_partitions;
        self.nominal_controllers = vec![LinearController::default(); num_partitions];
        self.nominal = vec![Trajectory::default(); num_partitions];
        self.cached = vec![Trajectory::default(); num_partitions];
        self.event_data = vec![Vec::new(); num_partitions];
        self.riccati = vec![RiccatiData::default(); num_partitions];
        self.seeds = vec![TerminalSeed::zeros(self.state_dim); num_partitions];
        Ok(())
    }

    /// Contiguous descending partition ranges for the parallel backward
    /// sweep; worker 0 owns the rightmost range.
    fn distribute_work(&mut self) {
        let n = self.pool.n_threads() as i64;
        let total = (self.final_active_partition - self.init_active_partition + 1) as i64;
        let per_worker = total / n;
        let mut remaining = total % n;

        let mut ranges = vec![(0i64, -1i64); n as usize];
        let mut ending = self.final_active_partition as i64;
        for range in ranges.iter_mut() {
            range.1 = ending;
            let starting = if remaining > 0 {
                remaining -= 1;
                ending - per_worker
            } else {
                ending - per_worker + 1
            };
            range.0 = starting;
            ending = starting - 1;
        }
        // inactive partitions attach to the outermost workers
        ranges.first_mut().unwrap().1 = self.num_partitions as i64 - 1;
        ranges.last_mut().unwrap().0 = 0;
        self.riccati_worker_ranges = ranges;

        if self.settings.display_info {
            eprintln!("initial active partition: {}", self.init_active_partition);
            eprintln!("final active partition:   {}", self.final_active_partition);
            for (w, (start, end)) in self.riccati_worker_ranges.iter().enumerate() {
                eprintln!("backward-pass worker {}: partitions [{}, {}]", w, start, end);
            }
        }
    }

    fn state_constraint_penalty(&self) -> f64 {
        self.settings.state_constraint_penalty_coeff
            * self.settings.state_constraint_penalty_base.powi(self.iteration as i32)
    }

    fn push_iteration_log(&mut self) {
        self.iteration_log.push(IterationLogEntry {
            merit: self.metrics.merit,
            state_input_eq_ise: self.metrics.state_input_eq_ise,
            state_eq_ise: self.metrics.state_eq_ise,
        });
    }

    fn span(&self) -> RolloutSpan<'_> {
        RolloutSpan {
            init_time: self.init_time,
            final_time: self.final_time,
            partitioning_times: &self.partitioning_times,
            init_active_partition: self.init_active_partition,
            final_active_partition: self.final_active_partition,
            event_times: &self.mode_schedule.event_times,
            debug_print: self.settings.debug_print_rollout,
        }
    }

    fn print_rollout_info(&self) {
        eprintln!("optimization merit:         {:.6}", self.metrics.merit);
        eprintln!("optimization cost:          {:.6}", self.metrics.cost);
        eprintln!("state-input constraint ISE: {:.3e}", self.metrics.state_input_eq_ise);
        eprintln!("state constraint ISE:       {:.3e}", self.metrics.state_eq_ise);
        eprintln!("state final constraint ISE: {:.3e}", self.metrics.state_eq_final_ise);
        eprintln!("inequality penalty:         {:.3e}", self.metrics.inequality_penalty);
        eprintln!("inequality ISE:             {:.3e}", self.metrics.inequality_ise);
        eprintln!("forward pass average dt:    {:.3e}", self.avg_time_step_fp);
        eprintln!("backward pass average dt:   {:.3e}", self.avg_time_step_bp);
    }
}

/// Seed for the next partition to the left: the value function at this
/// partition's first node. An empty partition passes its own seed through.
fn partition_start_seed(
    data: &RiccatiData,
    trajectory: &Trajectory,
    seed: &TerminalSeed,
) -> TerminalSeed {
    if data.is_empty() {
        return seed.clone();
    }
    TerminalSeed {
        sm: data.sm[0].clone(),
        sv: data.sv[0].clone(),
        sve: data.sve[0].clone(),
        s: data.s[0],
        x_final: trajectory
            .state
            .first()
            .cloned()
            .unwrap_or_else(|| DVector::zeros(seed.sv.len())),
    }
}
