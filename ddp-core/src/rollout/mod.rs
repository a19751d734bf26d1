//! Forward rollouts: the integrator contract and the per-partition driver
//! that stitches controller and operating-point intervals around events.

pub mod operating;
pub mod time_triggered;

use nalgebra::DVector;

use crate::controller::LinearController;
use crate::error::{DdpError, DdpResult};
use crate::threading::CancellationToken;
use crate::trajectory::Trajectory;
use crate::util::numerics::vector_is_finite;

pub use operating::OperatingTrajectoriesRollout;
pub use time_triggered::{RolloutSettings, TimeTriggeredRollout};

/// Output of one integrator run over a single interval.
#[derive(Debug, Clone, Default)]
pub struct RolloutSegment {
    pub time: Vec<f64>,
    /// Positions of the first sample after each event; the sample before
    /// shares the same stamp.
    pub post_event_indices: Vec<usize>,
    pub state: Vec<DVector<f64>>,
    pub input: Vec<DVector<f64>>,
}

impl RolloutSegment {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// Integrator contract: produce a sampled trajectory over `[t0, t1]`.
///
/// Event times strictly inside `(t0, t1)` yield two samples with identical
/// stamps straddling the event, with the post-event position recorded. The
/// cancellation token is polled during integration; a cancelled run fails
/// like a diverged one.
pub trait RolloutEngine: Send {
    fn run(
        &mut self,
        t0: f64,
        x0: &DVector<f64>,
        t1: f64,
        controller: Option<&LinearController>,
        event_times: &[f64],
        cancel: &CancellationToken,
    ) -> DdpResult<RolloutSegment>;

    fn clone_boxed(&self) -> Box<dyn RolloutEngine>;
}

impl Clone for Box<dyn RolloutEngine> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Horizon geometry shared by every rollout of one solve.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RolloutSpan<'a> {
    pub init_time: f64,
    pub final_time: f64,
    pub partitioning_times: &'a [f64],
    pub init_active_partition: usize,
    pub final_active_partition: usize,
    pub event_times: &'a [f64],
    pub debug_print: bool,
}

/// Runs the forward pass across the active partitions, stitching a
/// controller interval and an operating-point interval per partition.
///
/// Returns the average time step `(final_time − init_time) / Σ steps`.
pub(crate) fn rollout_trajectory(
    span: &RolloutSpan<'_>,
    controller_engine: &mut dyn RolloutEngine,
    operating_engine: &mut dyn RolloutEngine,
    controllers: &[LinearController],
    init_state: &DVector<f64>,
    cancel: &CancellationToken,
    stock: &mut [Trajectory],
) -> DdpResult<f64> {
    let num_partitions = stock.len();
    if controllers.len() != num_partitions {
        return Err(DdpError::BadController(format!(
            "controller stock has {} entries for {} partitions",
            controllers.len(),
            num_partitions
        )));
    }
    for trajectory in stock.iter_mut() {
        trajectory.clear();
    }

    // Find until where a controller is available; the first empty controller
    // ends the scan, gaps are not permitted.
    let mut controller_available_till = span.init_time;
    let mut partition_of_last_controller = span.init_active_partition;
    for i in span.init_active_partition..=span.final_active_partition {
        if !controllers[i].is_empty() {
            controller_available_till = *controllers[i].time_stamp.last().unwrap();
            partition_of_last_controller = i;
        } else {
            break;
        }
    }

    // Use the controller until the final time, truncated to the first event
    // at or past its end. An empty first controller disables it entirely.
    let mut use_controller_till = span.init_time;
    if !controllers[span.init_active_partition].is_empty() {
        use_controller_till = span.final_time;
        for &event_time in span.event_times {
            if event_time >= controller_available_till {
                use_controller_till = event_time.min(span.final_time);
                break;
            }
        }
    }

    if span.debug_print {
        eprintln!(
            "[rollout] t = [{}, {}]\n\tcontroller available till t = {}\n\twill use controller until t = {}",
            span.init_time, span.final_time, controller_available_till, use_controller_till
        );
    }

    let mut num_steps = 0usize;
    let mut x_current = init_state.clone();
    for i in span.init_active_partition..=span.final_active_partition {
        let t0 = if i == span.init_active_partition {
            span.init_time
        } else {
            span.partitioning_times[i]
        };
        let tf = if i == span.final_active_partition {
            span.final_time
        } else {
            span.partitioning_times[i + 1]
        };

        // split into a controller interval and an operating-points interval
        let controller_end = t0.max(use_controller_till.min(tf));
        let mut operating_start = controller_end;

        if span.debug_print {
            eprintln!("[rollout] partition {} for t = [{}, {}]", i, t0, tf);
            if t0 < controller_end {
                eprintln!("\twill use controller for t = [{}, {}]", t0, controller_end);
            }
            if operating_start < tf {
                eprintln!("\twill use operating points for t = [{}, {}]", operating_start, tf);
            }
        }

        if t0 < controller_end {
            let controller = &controllers[i.min(partition_of_last_controller)];
            let segment = controller_engine.run(
                t0,
                &x_current,
                controller_end,
                Some(controller),
                span.event_times,
                cancel,
            )?;
            if let Some(x) = segment.state.last() {
                x_current = x.clone();
            }
            stock[i].append_segment(
                segment.time,
                segment.post_event_indices,
                segment.state,
                segment.input,
            );
        }

        if operating_start < tf {
            // If the controller interval ended directly past an event, drop
            // the duplicated sample and restart the operating rollout at the
            // post-event stamp; the jump stays applied and the retained event
            // index marks the next sample as post-event.
            if !stock[i].is_empty()
                && stock[i].post_event_indices.last() == Some(&(stock[i].len() - 1))
            {
                operating_start = stock[i].pop_last().unwrap();
            }

            let segment = operating_engine.run(
                operating_start,
                &x_current,
                tf,
                None,
                span.event_times,
                cancel,
            )?;
            if let Some(x) = segment.state.last() {
                x_current = x.clone();
            }
            stock[i].append_segment(
                segment.time,
                segment.post_event_indices,
                segment.state,
                segment.input,
            );
        }

        num_steps += stock[i].len();
    }

    if !vector_is_finite(&x_current) {
        return Err(DdpError::RolloutDiverged(format!(
            "final state is not finite at t = {}",
            span.final_time
        )));
    }

    debug_assert!(stock
        .iter()
        .all(|trajectory| trajectory.model_data.len() == trajectory.time.len()));

    if num_steps == 0 {
        return Err(DdpError::RolloutDiverged("rollout produced no samples".into()));
    }
    Ok((span.final_time - span.init_time) / num_steps as f64)
}
