//! Worker fan-out and cooperative cancellation.
//!
//! Every parallel section of the solver starts with [`ThreadPool::run_parallel`]
//! and ends at its completion barrier. Workers coordinate work among
//! themselves through shared atomic counters; the pool only fans out and
//! joins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Fixed-width fan-out of a task onto worker threads.
#[derive(Debug, Clone)]
pub struct ThreadPool {
    n_threads: usize,
}

impl ThreadPool {
    pub fn new(n_threads: usize) -> Self {
        Self { n_threads: n_threads.max(1) }
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Runs `task(worker_id)` on `n` workers (capped at the pool width) and
    /// returns once all of them have finished. Worker ids are `0..n` and
    /// worker 0 runs on the calling thread, so a one-wide pool degenerates to
    /// a plain call.
    pub fn run_parallel<F>(&self, n: usize, task: F)
    where
        F: Fn(usize) + Sync,
    {
        let n = n.clamp(1, self.n_threads);
        if n == 1 {
            task(0);
            return;
        }
        std::thread::scope(|scope| {
            for worker in 1..n {
                let task = &task;
                scope.spawn(move || task(worker));
            }
            task(0);
        });
    }
}

/// Cooperative cancellation flag handed to long-running integrations.
///
/// The line-search coordinator arms the token once a winning step is
/// established; integrators poll it at every step and bail out with a rollout
/// failure, which the coordinator maps to an infinite merit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_parallel_visits_all_claimed_work() {
        let pool = ThreadPool::new(4);
        let next = AtomicUsize::new(0);
        let sum = AtomicUsize::new(0);
        pool.run_parallel(4, |_worker| loop {
            let i = next.fetch_add(1, Ordering::Relaxed);
            if i >= 1000 {
                break;
            }
            sum.fetch_add(i, Ordering::Relaxed);
        });
        assert_eq!(sum.load(Ordering::Relaxed), 999 * 1000 / 2);
    }

    #[test]
    fn worker_ids_are_distinct() {
        let pool = ThreadPool::new(3);
        let seen = std::sync::Mutex::new(Vec::new());
        pool.run_parallel(3, |worker| seen.lock().unwrap().push(worker));
        let mut ids = seen.into_inner().unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn cancellation_token_round_trip() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        token.clear();
        assert!(!token.is_cancelled());
    }
}
