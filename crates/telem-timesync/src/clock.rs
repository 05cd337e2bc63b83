//! Extended monotonic clock.
//!
//! The platform timer is a free-running 32-bit tick counter that wraps at
//! 2^32. [`ExtendedClock`] detects backward steps, accumulates a high epoch,
//! and converts the unwrapped count to milliseconds.
//!
//! Monotonicity holds as long as the clock is read at least once per wrap
//! period. No internal synchronization is provided; a clock belongs to the
//! single loop context that reads it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One full wrap of the 32-bit hardware counter, in ticks.
pub const WRAP_SPAN: u64 = 1 << 32;

/// Source of raw hardware ticks.
pub trait TickSource {
    /// Current value of the wrapping 32-bit counter.
    fn ticks(&self) -> u32;

    /// Fixed rate at which the counter advances.
    fn ticks_per_second(&self) -> u32;
}

/// Manually driven tick counter for tests and simulation.
///
/// Clones share the same counter, so a test can hand one clone to a node
/// and advance time through another.
#[derive(Debug, Clone)]
pub struct SimulatedTicks {
    ticks: Arc<AtomicU32>,
    rate: u32,
}

impl SimulatedTicks {
    /// Create a counter at zero advancing at `ticks_per_second`.
    #[must_use]
    pub fn new(ticks_per_second: u32) -> Self {
        Self {
            ticks: Arc::new(AtomicU32::new(0)),
            rate: ticks_per_second.max(1),
        }
    }

    /// Set the raw counter value.
    pub fn set(&self, ticks: u32) {
        self.ticks.store(ticks, Ordering::Relaxed);
    }

    /// Advance the counter, wrapping at 2^32.
    pub fn advance(&self, ticks: u32) {
        // fetch_add on atomics wraps on overflow
        self.ticks.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Advance the counter by a number of milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        let ticks = u128::from(ms) * u128::from(self.rate) / 1000;
        #[allow(clippy::cast_possible_truncation)]
        self.advance(ticks as u32);
    }
}

impl TickSource for SimulatedTicks {
    fn ticks(&self) -> u32 {
        self.ticks.load(Ordering::Relaxed)
    }

    fn ticks_per_second(&self) -> u32 {
        self.rate
    }
}

/// Tick counter derived from the host monotonic clock.
///
/// Emulates a hardware timer: the count is truncated to 32 bits, so it wraps
/// exactly like the real peripheral.
#[derive(Debug, Clone)]
pub struct SystemTicks {
    origin: Instant,
    rate: u32,
    preload: u32,
}

impl SystemTicks {
    /// Create a counter starting at zero.
    #[must_use]
    pub fn new(ticks_per_second: u32) -> Self {
        Self::with_preload(ticks_per_second, 0)
    }

    /// Create a counter starting at `preload` ticks (useful to exercise wraps).
    #[must_use]
    pub fn with_preload(ticks_per_second: u32, preload: u32) -> Self {
        Self {
            origin: Instant::now(),
            rate: ticks_per_second.max(1),
            preload,
        }
    }
}

impl TickSource for SystemTicks {
    fn ticks(&self) -> u32 {
        let elapsed = self.origin.elapsed().as_nanos();
        let ticks = elapsed * u128::from(self.rate) / 1_000_000_000;
        #[allow(clippy::cast_possible_truncation)]
        (ticks as u32).wrapping_add(self.preload)
    }

    fn ticks_per_second(&self) -> u32 {
        self.rate
    }
}

/// Unbounded millisecond clock built on a wrapping tick counter.
#[derive(Debug, Clone)]
pub struct ExtendedClock<S> {
    source: S,
    last_ticks: u32,
    high: u64,
}

impl<S: TickSource> ExtendedClock<S> {
    /// Wrap a tick source.
    pub fn new(source: S) -> Self {
        Self {
            source,
            last_ticks: 0,
            high: 0,
        }
    }

    /// Read the extended clock in milliseconds.
    ///
    /// A reading lower than the previous one is taken as exactly one wrap.
    pub fn raw_now_ms(&mut self) -> u64 {
        let current = self.source.ticks();
        if current < self.last_ticks {
            self.high = self.high.wrapping_add(WRAP_SPAN);
        }
        self.last_ticks = current;

        let ticks = self.high | u64::from(current);
        let ms = u128::from(ticks) * 1000 / u128::from(self.source.ticks_per_second().max(1));
        u64::try_from(ms).unwrap_or(u64::MAX)
    }

    /// Number of wraps observed so far.
    #[must_use]
    pub fn epochs(&self) -> u64 {
        self.high >> 32
    }

    /// Access the underlying tick source.
    pub fn source(&self) -> &S {
        &self.source
    }
}
