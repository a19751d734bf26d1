//! Time-segment lookup and linear interpolation over sampled trajectories.

use nalgebra::{DMatrix, DVector};

/// Index/fraction pair locating `t` inside a non-decreasing time array:
/// `t ≈ (1 − alpha)·times[index] + alpha·times[index + 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSegment {
    pub index: usize,
    pub alpha: f64,
}

/// Locates the segment of `times` bracketing `t`, clamped at both ends.
///
/// For arrays with repeated stamps (event nodes) the first bracketing segment
/// is returned, so interpolation at an event time evaluates the pre-event
/// side.
pub fn time_segment(t: f64, times: &[f64]) -> TimeSegment {
    if times.len() < 2 {
        return TimeSegment { index: 0, alpha: 0.0 };
    }
    if t <= times[0] {
        return TimeSegment { index: 0, alpha: 0.0 };
    }
    let last = times.len() - 1;
    if t >= times[last] {
        return TimeSegment { index: last - 1, alpha: 1.0 };
    }
    // first index with times[index + 1] >= t
    let index = match times.binary_search_by(|v| v.partial_cmp(&t).unwrap()) {
        Ok(i) => i.saturating_sub(1),
        Err(i) => i - 1,
    };
    let dt = times[index + 1] - times[index];
    let alpha = if dt > 0.0 { (t - times[index]) / dt } else { 0.0 };
    TimeSegment { index, alpha: alpha.clamp(0.0, 1.0) }
}

/// Values that can be linearly blended.
pub trait Lerp: Clone {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self;
}

impl Lerp for f64 {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        (1.0 - alpha) * a + alpha * b
    }
}

impl Lerp for DVector<f64> {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

impl Lerp for DMatrix<f64> {
    fn lerp(a: &Self, b: &Self, alpha: f64) -> Self {
        a * (1.0 - alpha) + b * alpha
    }
}

/// Interpolates `data` at a segment previously located with [`time_segment`].
pub fn interpolate<T: Lerp>(segment: TimeSegment, data: &[T]) -> T {
    if data.is_empty() {
        panic!("interpolate called with empty data");
    }
    if data.len() == 1 || segment.index + 1 >= data.len() {
        return data[data.len() - 1].clone();
    }
    T::lerp(&data[segment.index], &data[segment.index + 1], segment.alpha)
}

/// Convenience: locate and interpolate in one call.
pub fn interpolate_at<T: Lerp>(t: f64, times: &[f64], data: &[T]) -> T {
    interpolate(time_segment(t, times), data)
}

/// Index of the partition `(partitions[i], partitions[i+1]]` containing `t`,
/// clamped to the valid range. A boundary time belongs to the partition
/// ending there, so a horizon ending on a boundary stays in the left
/// partition.
pub fn find_partition(partitions: &[f64], t: f64) -> usize {
    debug_assert!(partitions.len() >= 2);
    let num = partitions.len() - 1;
    let j = partitions.partition_point(|&v| v < t);
    if j == 0 {
        0
    } else {
        (j - 1).min(num - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    #[test]
    fn segment_lookup_brackets_and_clamps() {
        let times = [0.0, 1.0, 2.0, 4.0];
        let seg = time_segment(1.5, &times);
        assert_eq!(seg.index, 1);
        assert!((seg.alpha - 0.5).abs() < 1e-12);

        assert_eq!(time_segment(-1.0, &times), TimeSegment { index: 0, alpha: 0.0 });
        assert_eq!(time_segment(9.0, &times), TimeSegment { index: 2, alpha: 1.0 });
    }

    #[test]
    fn interpolation_is_linear() {
        let times = [0.0, 2.0];
        let data = [dvector![0.0, 4.0], dvector![2.0, 0.0]];
        let v = interpolate_at(0.5, &times, &data);
        assert!((v[0] - 0.5).abs() < 1e-12);
        assert!((v[1] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn repeated_stamps_pick_pre_event_segment() {
        let times = [0.0, 1.0, 1.0, 2.0];
        let data = [0.0, 10.0, 20.0, 30.0];
        // exactly at the duplicated stamp: the segment ending there wins
        let seg = time_segment(1.0, &times);
        assert!((interpolate(seg, &data) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn partition_lookup_clamps() {
        let p = [0.0, 1.0, 2.0, 3.0];
        assert_eq!(find_partition(&p, -0.5), 0);
        assert_eq!(find_partition(&p, 0.5), 0);
        assert_eq!(find_partition(&p, 1.0), 0);
        assert_eq!(find_partition(&p, 1.5), 1);
        assert_eq!(find_partition(&p, 2.7), 2);
        assert_eq!(find_partition(&p, 3.0), 2);
        assert_eq!(find_partition(&p, 99.0), 2);
    }
}
