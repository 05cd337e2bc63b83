//! Telemetry loop metrics.
//!
//! Tracks how long each cooperative loop cycle took relative to its
//! drain budget, without heap allocations after construction.

use std::time::Duration;

/// Per-cycle timing and failure counters for the telemetry loop.
#[derive(Debug, Clone)]
pub struct LoopMetrics {
    /// Ring buffer of recent cycle durations in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples held (saturates at buffer size).
    sample_count: usize,
    /// Total cycles recorded.
    total_cycles: u64,
    /// Minimum observed cycle time in nanoseconds.
    min_ns: u64,
    /// Maximum observed cycle time in nanoseconds.
    max_ns: u64,
    /// Sum of all cycle times for mean calculation.
    sum_ns: u64,
    /// Cycles that exceeded the budget.
    overrun_count: u64,
    /// Drain calls that returned an error.
    drain_failures: u64,
    /// Configured budget in nanoseconds.
    budget_ns: u64,
}

impl LoopMetrics {
    /// Create a collector retaining `history` samples against `budget`.
    #[must_use]
    pub fn new(history: usize, budget: Duration) -> Self {
        let size = history.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_cycles: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            overrun_count: 0,
            drain_failures: 0,
            budget_ns: u64::try_from(budget.as_nanos()).unwrap_or(u64::MAX),
        }
    }

    /// Record one cycle duration.
    pub fn record(&mut self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = (self.sample_count + 1).min(self.samples.len());

        self.total_cycles += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);

        if ns > self.budget_ns {
            self.overrun_count += 1;
        }
    }

    /// Count a drain call that returned an error.
    pub fn record_drain_failure(&mut self) {
        self.drain_failures += 1;
    }

    /// Total cycles recorded.
    #[must_use]
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// Cycles that exceeded the budget.
    #[must_use]
    pub fn overrun_count(&self) -> u64 {
        self.overrun_count
    }

    /// Drain calls that returned an error.
    #[must_use]
    pub fn drain_failures(&self) -> u64 {
        self.drain_failures
    }

    /// Minimum observed cycle time.
    #[must_use]
    pub fn min(&self) -> Option<Duration> {
        (self.total_cycles > 0).then(|| Duration::from_nanos(self.min_ns))
    }

    /// Maximum observed cycle time.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total_cycles > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Mean cycle time over all recorded cycles.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.total_cycles > 0).then(|| Duration::from_nanos(self.sum_ns / self.total_cycles))
    }

    /// Most recent cycle durations, oldest first.
    #[must_use]
    pub fn recent(&self) -> Vec<Duration> {
        let len = self.samples.len();
        let start = (self.write_pos + len - self.sample_count) % len;
        (0..self.sample_count)
            .map(|i| Duration::from_nanos(self.samples[(start + i) % len]))
            .collect()
    }
}
