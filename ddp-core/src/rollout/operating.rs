//! Rollout over operating trajectories, used while no controller exists.

use nalgebra::DVector;

use crate::controller::LinearController;
use crate::error::{DdpError, DdpResult};
use crate::model::OperatingTrajectories;
use crate::threading::CancellationToken;

use super::{RolloutEngine, RolloutSegment};

/// Samples the operating-trajectories provider across `[t0, t1]`, splitting
/// at events. The provider defines the state sequence; no dynamics are
/// integrated, and at an event the next sub-interval simply restarts from the
/// provider under a duplicated stamp.
pub struct OperatingTrajectoriesRollout {
    operating: Box<dyn OperatingTrajectories>,
}

impl OperatingTrajectoriesRollout {
    pub fn new(operating: Box<dyn OperatingTrajectories>) -> Self {
        Self { operating }
    }
}

impl RolloutEngine for OperatingTrajectoriesRollout {
    fn run(
        &mut self,
        t0: f64,
        x0: &DVector<f64>,
        t1: f64,
        _controller: Option<&LinearController>,
        event_times: &[f64],
        cancel: &CancellationToken,
    ) -> DdpResult<RolloutSegment> {
        let mut segment = RolloutSegment::default();
        if !(t1 > t0) {
            return Ok(segment);
        }

        let mut boundaries: Vec<f64> =
            event_times.iter().copied().filter(|&e| e > t0 && e < t1).collect();
        boundaries.push(t1);

        let mut t_start = t0;
        let mut x_current = x0.clone();
        for (interval, &boundary) in boundaries.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(DdpError::RolloutDiverged("integration cancelled".into()));
            }
            let (time, state, input) = self.operating.trajectory(&x_current, t_start, boundary);
            if time.is_empty() || time.len() != state.len() || time.len() != input.len() {
                return Err(DdpError::RolloutDiverged(format!(
                    "operating trajectories returned inconsistent samples over [{}, {}]",
                    t_start, boundary
                )));
            }

            if interval > 0 {
                segment.post_event_indices.push(segment.time.len());
            }
            segment.time.extend(time);
            segment.state.extend(state);
            segment.input.extend(input);

            x_current = segment.state.last().unwrap().clone();
            t_start = boundary;
        }

        Ok(segment)
    }

    fn clone_boxed(&self) -> Box<dyn RolloutEngine> {
        Box::new(Self { operating: self.operating.clone_boxed() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FixedOperatingPoint;
    use nalgebra::dvector;

    #[test]
    fn events_split_into_duplicated_stamps() {
        let mut rollout = OperatingTrajectoriesRollout::new(Box::new(FixedOperatingPoint::new(
            dvector![0.5],
            dvector![0.0],
        )));
        let cancel = CancellationToken::new();
        let segment =
            rollout.run(0.0, &dvector![1.0], 3.0, None, &[1.0, 2.0], &cancel).unwrap();
        assert_eq!(segment.post_event_indices, vec![2, 4]);
        assert_eq!(segment.time, vec![0.0, 1.0, 1.0, 2.0, 2.0, 3.0]);
        assert!(segment.state.iter().all(|x| (x[0] - 0.5).abs() < 1e-12));
    }

    #[test]
    fn event_free_interval_has_endpoint_samples() {
        let mut rollout = OperatingTrajectoriesRollout::new(Box::new(FixedOperatingPoint::new(
            dvector![0.0],
            dvector![0.0],
        )));
        let cancel = CancellationToken::new();
        let segment = rollout.run(0.5, &dvector![0.0], 1.5, None, &[], &cancel).unwrap();
        assert_eq!(segment.time, vec![0.5, 1.5]);
        assert!(segment.post_event_indices.is_empty());
    }
}
