//! Per-stage wall-time accumulators for the end-of-run report.

use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone)]
pub enum BenchmarkSection {
    ForwardPass,
    LqApproximation,
    BackwardPass,
    ComputeController,
    LineSearch,
}

const NUM_SECTIONS: usize = 5;

const SECTION_LABELS: [&str; NUM_SECTIONS] = [
    "Forward Pass      ",
    "LQ Approximation  ",
    "Backward Pass     ",
    "Compute Controller",
    "Line Search       ",
];

/// Accumulated time and call count per solver stage.
#[derive(Debug, Default, Clone)]
pub struct BenchmarkTimers {
    accumulated: [Duration; NUM_SECTIONS],
    calls: [u64; NUM_SECTIONS],
}

impl BenchmarkTimers {
    /// Starts a scoped timer; the elapsed time is added on drop.
    pub fn scoped(&mut self, section: BenchmarkSection) -> BenchmarkGuard<'_> {
        BenchmarkGuard { section, start: Instant::now(), timers: self }
    }

    pub fn add(&mut self, section: BenchmarkSection, dt: Duration) {
        let i = section as usize;
        self.accumulated[i] += dt;
        self.calls[i] += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn total_ms(&self, section: BenchmarkSection) -> f64 {
        self.accumulated[section as usize].as_secs_f64() * 1e3
    }

    pub fn average_ms(&self, section: BenchmarkSection) -> f64 {
        let calls = self.calls[section as usize];
        if calls == 0 {
            0.0
        } else {
            self.total_ms(section) / calls as f64
        }
    }

    /// Prints the benchmark block to stderr.
    pub fn print_summary(&self) {
        let total: f64 = self.accumulated.iter().map(|d| d.as_secs_f64() * 1e3).sum();
        if total <= 0.0 {
            return;
        }
        eprintln!("\n########################################################################");
        eprintln!("Benchmarking            :  Average time [ms]   (% of total runtime)");
        for (i, label) in SECTION_LABELS.iter().enumerate() {
            let section_total = self.accumulated[i].as_secs_f64() * 1e3;
            let avg = if self.calls[i] == 0 { 0.0 } else { section_total / self.calls[i] as f64 };
            eprintln!("\t{} :\t{:.3} [ms] \t\t({:.1}%)", label, avg, section_total / total * 100.0);
        }
    }
}

pub struct BenchmarkGuard<'a> {
    section: BenchmarkSection,
    start: Instant,
    timers: &'a mut BenchmarkTimers,
}

impl Drop for BenchmarkGuard<'_> {
    fn drop(&mut self) {
        self.timers.add(self.section, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_guard_accumulates() {
        let mut timers = BenchmarkTimers::default();
        {
            let _guard = timers.scoped(BenchmarkSection::ForwardPass);
            std::hint::black_box(0u64);
        }
        {
            let _guard = timers.scoped(BenchmarkSection::ForwardPass);
        }
        assert_eq!(timers.calls[BenchmarkSection::ForwardPass as usize], 2);
        assert_eq!(timers.calls[BenchmarkSection::LineSearch as usize], 0);
    }
}
