//! Time-varying controllers produced and consumed by the solver.

use nalgebra::{DMatrix, DVector};

use crate::util::interp::{interpolate, time_segment};

/// Affine time-varying feedback law `u(t, x) = K(t)·x + b(t)`.
///
/// `delta_biases` holds the feed-forward increment produced by the backward
/// sweep; the line search scales it into `biases` and clears it afterwards.
/// Within a partition the stamps are non-decreasing; at an event two samples
/// may share a stamp to represent a jump in the gains.
#[derive(Debug, Clone, Default)]
pub struct LinearController {
    pub time_stamp: Vec<f64>,
    pub gains: Vec<DMatrix<f64>>,
    pub biases: Vec<DVector<f64>>,
    pub delta_biases: Vec<DVector<f64>>,
}

impl LinearController {
    pub fn is_empty(&self) -> bool {
        self.time_stamp.is_empty()
    }

    pub fn len(&self) -> usize {
        self.time_stamp.len()
    }

    pub fn clear(&mut self) {
        self.time_stamp.clear();
        self.gains.clear();
        self.biases.clear();
        self.delta_biases.clear();
    }

    /// Evaluates the feedback law with gains and biases interpolated in time.
    pub fn compute_input(&self, t: f64, x: &DVector<f64>) -> DVector<f64> {
        debug_assert!(!self.is_empty());
        let segment = time_segment(t, &self.time_stamp);
        let gain = interpolate(segment, &self.gains);
        let bias = interpolate(segment, &self.biases);
        gain * x + bias
    }

    /// Appends the first `length` samples of `other`.
    pub fn concatenate(&mut self, other: &LinearController, length: usize) {
        let length = length.min(other.len());
        self.time_stamp.extend_from_slice(&other.time_stamp[..length]);
        self.gains.extend_from_slice(&other.gains[..length]);
        self.biases.extend_from_slice(&other.biases[..length]);
        if other.delta_biases.len() >= length {
            self.delta_biases.extend_from_slice(&other.delta_biases[..length]);
        }
    }

    /// True when the gain dimensions of every sample match `(m, n)` and the
    /// parallel arrays are consistent.
    pub fn is_consistent(&self, state_dim: usize, input_dim: usize) -> bool {
        if self.gains.len() != self.time_stamp.len() || self.biases.len() != self.time_stamp.len() {
            return false;
        }
        self.gains.iter().all(|k| k.nrows() == input_dim && k.ncols() == state_dim)
            && self.biases.iter().all(|b| b.len() == input_dim)
    }
}

/// Feed-forward controller replaying a stored input trajectory.
#[derive(Debug, Clone, Default)]
pub struct FeedforwardController {
    pub time_stamp: Vec<f64>,
    pub inputs: Vec<DVector<f64>>,
}

impl FeedforwardController {
    pub fn new(time_stamp: Vec<f64>, inputs: Vec<DVector<f64>>) -> Self {
        Self { time_stamp, inputs }
    }

    pub fn is_empty(&self) -> bool {
        self.time_stamp.is_empty()
    }

    pub fn compute_input(&self, t: f64) -> DVector<f64> {
        debug_assert!(!self.is_empty());
        interpolate(time_segment(t, &self.time_stamp), &self.inputs)
    }
}

/// Controller returned inside a [`crate::solver::PrimalSolution`].
#[derive(Debug, Clone)]
pub enum SolutionController {
    Feedback(LinearController),
    Feedforward(FeedforwardController),
}

impl SolutionController {
    pub fn compute_input(&self, t: f64, x: &DVector<f64>) -> DVector<f64> {
        match self {
            SolutionController::Feedback(c) => c.compute_input(t, x),
            SolutionController::Feedforward(c) => c.compute_input(t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{dmatrix, dvector};

    fn ramp_controller() -> LinearController {
        LinearController {
            time_stamp: vec![0.0, 1.0],
            gains: vec![dmatrix![1.0, 0.0], dmatrix![3.0, 0.0]],
            biases: vec![dvector![0.0], dvector![1.0]],
            delta_biases: vec![dvector![0.0], dvector![0.0]],
        }
    }

    #[test]
    fn feedback_interpolates_gain_and_bias() {
        let c = ramp_controller();
        let x = dvector![2.0, -1.0];
        let u = c.compute_input(0.5, &x);
        // K(0.5) = [2, 0], b(0.5) = 0.5
        assert!((u[0] - 4.5).abs() < 1e-12);
    }

    #[test]
    fn concatenate_truncates() {
        let mut c = ramp_controller();
        let other = ramp_controller();
        c.concatenate(&other, 1);
        assert_eq!(c.len(), 3);
        assert_eq!(c.time_stamp[2], 0.0);
    }

    #[test]
    fn consistency_checks_dimensions() {
        let c = ramp_controller();
        assert!(c.is_consistent(2, 1));
        assert!(!c.is_consistent(1, 1));
    }
}
