//! Per-partition trajectory storage and the MPC warm-start cache.

use nalgebra::DVector;

use crate::error::{DdpError, DdpResult};
use crate::model::ModelData;
use crate::util::interp::{interpolate, time_segment};
use crate::util::numerics::WEAK_EPSILON;

/// Parallel (time, state, input, model-data) sequences of one partition,
/// plus the positions of the first sample after each mode-switch event.
///
/// An entry of `post_event_indices` may equal `len()`: the trajectory then
/// ends on the last sample *before* an event whose post-event sample lives in
/// the following segment. Consumers test `k + 1 == index` so the final node
/// is treated as pre-event.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    pub time: Vec<f64>,
    pub post_event_indices: Vec<usize>,
    pub state: Vec<DVector<f64>>,
    pub input: Vec<DVector<f64>>,
    pub model_data: Vec<ModelData>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn clear(&mut self) {
        self.time.clear();
        self.post_event_indices.clear();
        self.state.clear();
        self.input.clear();
        self.model_data.clear();
    }

    /// Bulk-appends a tail produced by an independent rollout, shifting its
    /// event indices by the current size.
    pub fn append_segment(
        &mut self,
        time: Vec<f64>,
        post_event_indices: Vec<usize>,
        state: Vec<DVector<f64>>,
        input: Vec<DVector<f64>>,
    ) {
        let offset = self.len();
        self.post_event_indices.extend(post_event_indices.into_iter().map(|i| i + offset));
        self.model_data.extend(time.iter().map(|&t| ModelData { time: t, ..Default::default() }));
        self.time.extend(time);
        self.state.extend(state);
        self.input.extend(input);
    }

    /// Drops the last node. An event index pointing past the new end is kept
    /// on purpose: it marks the next appended sample as post-event.
    pub fn pop_last(&mut self) -> Option<f64> {
        let t = self.time.pop();
        self.state.pop();
        self.input.pop();
        self.model_data.pop();
        t
    }

    pub fn last_time(&self) -> Option<f64> {
        self.time.last().copied()
    }

    pub fn last_state(&self) -> Option<&DVector<f64>> {
        self.state.last()
    }
}

/// Swaps the nominal and cached stocks in O(1).
pub fn swap_stocks(a: &mut Vec<Trajectory>, b: &mut Vec<Trajectory>) {
    std::mem::swap(a, b);
}

/// Reconciles the cache after a rollout shorter than the previous one (the
/// usual situation when a receding horizon moves forward).
///
/// Empty cached partitions are filled from the nominal; otherwise the nominal
/// tail past the cached end is spliced on, starting with one interpolated
/// sample so the cached time axis stays strictly increasing.
pub fn correct_init_cache(
    nominal: &[Trajectory],
    cached: &mut [Trajectory],
    init_active: usize,
    final_active: usize,
    debug_caching: bool,
) -> DdpResult<()> {
    for i in init_active..=final_active {
        let nom = &nominal[i];
        let cache = &mut cached[i];
        if nom.is_empty() {
            continue;
        }

        if cache.is_empty() {
            cache.time = nom.time.clone();
            cache.post_event_indices = nom.post_event_indices.clone();
            cache.state = nom.state.clone();
            cache.input = nom.input.clone();
            cache.model_data =
                nom.time.iter().map(|&t| ModelData { time: t, ..Default::default() }).collect();
        } else if cache.last_time().unwrap() < nom.last_time().unwrap() {
            let seek = cache.last_time().unwrap() + WEAK_EPSILON;
            let segment = time_segment(seek, &nom.time);
            let old_size = cache.len();

            // event indices of the spliced tail, moved into cache coordinates
            for &ind in &nom.post_event_indices {
                if ind > segment.index {
                    cache.post_event_indices.push(ind - segment.index + old_size);
                }
            }

            cache.time.push(interpolate(segment, &nom.time));
            cache.state.push(interpolate(segment, &nom.state));
            cache.input.push(interpolate(segment, &nom.input));
            cache.model_data.push(ModelData { time: seek, ..Default::default() });

            for k in (segment.index + 1)..nom.len() {
                cache.time.push(nom.time[k]);
                cache.state.push(nom.state[k].clone());
                cache.input.push(nom.input[k].clone());
                cache.model_data.push(ModelData { time: nom.time[k], ..Default::default() });
            }

            if debug_caching {
                for k in (segment.index + 1)..nom.len() {
                    let seg = time_segment(nom.time[k], &cache.time);
                    let state = interpolate(seg, &cache.state);
                    if (state - &nom.state[k]).norm() > 1e-9 {
                        return Err(DdpError::CacheInconsistent(format!(
                            "spliced state tail disagrees at t = {}",
                            nom.time[k]
                        )));
                    }
                    let input = interpolate(seg, &cache.input);
                    if (input - &nom.input[k]).norm() > 1e-9 {
                        return Err(DdpError::CacheInconsistent(format!(
                            "spliced input tail disagrees at t = {}",
                            nom.time[k]
                        )));
                    }
                }
            }
        }

        if debug_caching {
            // every nominal event must also appear in the cache, with the
            // duplicated pre-event stamp one slot earlier
            let mut cached_events = cache.post_event_indices.iter().rev();
            for &ind in nom.post_event_indices.iter().rev() {
                if ind >= nom.len() {
                    continue;
                }
                let Some(&cind) = cached_events.next() else {
                    return Err(DdpError::CacheInconsistent(
                        "cached post-event indices are missing".into(),
                    ));
                };
                if cind >= cache.len() || nom.time[ind] != cache.time[cind] {
                    return Err(DdpError::CacheInconsistent(
                        "cached post-event indices are misaligned".into(),
                    ));
                }
                if ind > 0 && cind > 0 && nom.time[ind - 1] != cache.time[cind - 1] {
                    return Err(DdpError::CacheInconsistent(
                        "cached post-event indices are biased by one".into(),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dvector;

    fn line_trajectory(times: &[f64]) -> Trajectory {
        let mut t = Trajectory::default();
        t.append_segment(
            times.to_vec(),
            Vec::new(),
            times.iter().map(|&x| dvector![x]).collect(),
            times.iter().map(|&x| dvector![2.0 * x]).collect(),
        );
        t
    }

    #[test]
    fn append_segment_shifts_event_indices() {
        let mut t = line_trajectory(&[0.0, 0.5]);
        t.append_segment(
            vec![0.5, 0.5, 1.0],
            vec![1],
            vec![dvector![0.5], dvector![0.6], dvector![1.0]],
            vec![dvector![0.0], dvector![0.0], dvector![0.0]],
        );
        assert_eq!(t.post_event_indices, vec![3]);
        assert_eq!(t.len(), 5);
        assert_eq!(t.model_data.len(), t.len());
    }

    #[test]
    fn pop_last_keeps_event_index() {
        let mut t = Trajectory::default();
        t.append_segment(
            vec![0.0, 0.5, 0.5],
            vec![2],
            vec![dvector![0.0], dvector![1.0], dvector![2.0]],
            vec![dvector![0.0], dvector![0.0], dvector![0.0]],
        );
        let popped = t.pop_last();
        assert_eq!(popped, Some(0.5));
        assert_eq!(t.len(), 2);
        assert_eq!(t.post_event_indices, vec![2]); // now past the end
    }

    #[test]
    fn double_swap_is_identity() {
        let mut a = vec![line_trajectory(&[0.0, 1.0])];
        let mut b = vec![Trajectory::default()];
        let a_time = a[0].time.clone();
        swap_stocks(&mut a, &mut b);
        swap_stocks(&mut a, &mut b);
        assert_eq!(a[0].time, a_time);
        assert!(b[0].is_empty());
    }

    #[test]
    fn cache_fills_empty_partition() {
        let nominal = vec![line_trajectory(&[0.0, 0.5, 1.0])];
        let mut cached = vec![Trajectory::default()];
        correct_init_cache(&nominal, &mut cached, 0, 0, true).unwrap();
        assert_eq!(cached[0].time, nominal[0].time);
        assert_eq!(cached[0].model_data.len(), cached[0].len());
    }

    #[test]
    fn cache_splices_longer_nominal_tail() {
        let nominal = vec![line_trajectory(&[0.0, 0.25, 0.5, 0.75, 1.0])];
        let mut cached = vec![line_trajectory(&[0.0, 0.2, 0.4])];
        correct_init_cache(&nominal, &mut cached, 0, 0, true).unwrap();
        // the cache now reaches the nominal end
        assert_eq!(cached[0].last_time(), Some(1.0));
        // and interpolates onto the nominal tail exactly (both are lines)
        let seg = time_segment(0.75, &cached[0].time);
        let s = interpolate(seg, &cached[0].state);
        assert!((s[0] - 0.75).abs() < 1e-9);
    }
}
