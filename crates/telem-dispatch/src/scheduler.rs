//! Cooperative telemetry loop.
//!
//! Each cycle:
//! 1. Pump bus datagrams from the inbox into the router (twice)
//! 2. Drain both router queues within the drain budget
//! 3. Pump once more to catch frames that arrived during the drain
//! 4. Fire periodic time-sync triggers (client request / master announce)
//! 5. Record cycle metrics and yield for the configured slice

use crate::bus::BusDriver;
use crate::facade::Dispatcher;
use crate::router::{Delivery, RouterFactory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use telem_common::config::{NodeConfig, Role};
use telem_common::metrics::LoopMetrics;
use telem_timesync::TickSource;
use tracing::{debug, info, trace, warn};

/// Default number of cycle durations retained for statistics.
pub const DEFAULT_METRICS_HISTORY: usize = 1024;

/// Result of a single loop cycle.
#[derive(Debug, Clone)]
pub struct CycleResult {
    /// Current cycle number.
    pub cycle_count: u64,
    /// Wall time spent in the cycle, excluding the yield.
    pub execution_time: Duration,
    /// Whether the cycle exceeded the drain budget.
    pub overrun: bool,
    /// Datagrams moved from the bus inbox into the router.
    pub datagrams_pumped: usize,
    /// Whether the drain returned an error.
    pub drain_failed: bool,
    /// Whether a time-sync request was sent.
    pub requested_sync: bool,
    /// Whether a time-sync announcement was sent.
    pub announced: bool,
}

/// Periodic trigger measured on the node's raw clock.
#[derive(Debug, Clone, Copy)]
struct Periodic {
    interval_ms: u64,
    last_ms: Option<u64>,
}

impl Periodic {
    fn new(interval: Duration) -> Self {
        Self {
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            last_ms: None,
        }
    }

    fn due(&self, now_ms: u64) -> bool {
        self.last_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= self.interval_ms)
    }

    fn mark(&mut self, now_ms: u64) {
        self.last_ms = Some(now_ms);
    }
}

/// Cooperative telemetry loop owning a node's dispatcher.
pub struct TelemetryLoop<F: RouterFactory, B, S> {
    dispatcher: Dispatcher<F, B, S>,
    drain_budget: Duration,
    yield_slice: Duration,
    request: Periodic,
    announce: Periodic,
    announce_priority: u64,
    cycle_count: u64,
    metrics: LoopMetrics,
    started: bool,
    failure_streak: u64,
}

impl<F, B, S> TelemetryLoop<F, B, S>
where
    F: RouterFactory,
    B: BusDriver + Clone + 'static,
    S: TickSource,
{
    /// Create a loop using the timing in `config`.
    pub fn new(dispatcher: Dispatcher<F, B, S>, config: &NodeConfig) -> Self {
        TelemetryLoopBuilder::new(dispatcher).config(config).build()
    }

    /// The dispatcher driven by this loop.
    pub fn dispatcher(&self) -> &Dispatcher<F, B, S> {
        &self.dispatcher
    }

    /// Mutable access to the dispatcher (for logging from the same context).
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher<F, B, S> {
        &mut self.dispatcher
    }

    /// Cycle metrics.
    pub fn metrics(&self) -> &LoopMetrics {
        &self.metrics
    }

    /// Total cycles executed.
    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Execute one loop cycle.
    pub fn run_cycle(&mut self) -> CycleResult {
        if !self.started {
            self.started = true;
            info!(
                role = %self.dispatcher.role(),
                drain_budget_ms = self.drain_budget.as_millis(),
                "Telemetry thread starting"
            );
            if let Err(e) = self
                .dispatcher
                .log_message("telemetry thread starting", Delivery::Immediate)
            {
                debug!(error = %e, "Startup record not sent");
            }
        }

        let start = Instant::now();

        let mut datagrams_pumped = self.pump() + self.pump();
        let drain_failed = self.drain();
        datagrams_pumped += self.pump();

        let now_ms = self.dispatcher.raw_now_ms();
        let (requested_sync, announced) = match self.dispatcher.role() {
            Role::Client => (self.maybe_request(now_ms), false),
            Role::Master => (false, self.maybe_announce(now_ms)),
        };

        let execution_time = start.elapsed();
        self.metrics.record(execution_time);
        self.cycle_count += 1;
        let overrun = execution_time > self.drain_budget;

        trace!(
            cycle = self.cycle_count,
            execution_us = execution_time.as_micros(),
            datagrams_pumped,
            "Telemetry cycle complete"
        );

        if !self.yield_slice.is_zero() {
            std::thread::sleep(self.yield_slice);
        }

        CycleResult {
            cycle_count: self.cycle_count,
            execution_time,
            overrun,
            datagrams_pumped,
            drain_failed,
            requested_sync,
            announced,
        }
    }

    /// Run `cycles` cycles.
    pub fn run_cycles(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.run_cycle();
        }
    }

    /// Run until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.run_cycle();
        }

        info!(
            total_cycles = self.metrics.total_cycles(),
            overruns = self.metrics.overrun_count(),
            drain_failures = self.metrics.drain_failures(),
            sink_records = self.dispatcher.sink_records(),
            "Telemetry loop stopped"
        );
    }

    fn pump(&mut self) -> usize {
        match self.dispatcher.pump_bus_rx() {
            Ok(count) => count,
            Err(e) => {
                debug!(error = %e, "Bus receive pump failed");
                0
            }
        }
    }

    // Only the first failure of a streak is logged at warn level.
    fn drain(&mut self) -> bool {
        let budget_ms = u32::try_from(self.drain_budget.as_millis()).unwrap_or(u32::MAX);
        match self.dispatcher.drain_all(budget_ms) {
            Ok(()) => {
                if self.failure_streak > 0 {
                    info!(failed_cycles = self.failure_streak, "Telemetry drain recovered");
                }
                self.failure_streak = 0;
                false
            }
            Err(e) => {
                self.metrics.record_drain_failure();
                if self.failure_streak == 0 {
                    warn!(error = %e, "Telemetry drain failed");
                } else {
                    debug!(error = %e, streak = self.failure_streak, "Telemetry drain failed");
                }
                self.failure_streak += 1;
                true
            }
        }
    }

    fn maybe_request(&mut self, now_ms: u64) -> bool {
        if !self.request.due(now_ms) {
            return false;
        }
        self.request.mark(now_ms);
        match self.dispatcher.request_sync() {
            Ok(sent) => sent,
            Err(e) => {
                debug!(error = %e, "Time-sync request failed");
                false
            }
        }
    }

    fn maybe_announce(&mut self, now_ms: u64) -> bool {
        if !self.dispatcher.unix_is_valid() || !self.announce.due(now_ms) {
            return false;
        }
        self.announce.mark(now_ms);
        match self.dispatcher.announce_now(self.announce_priority) {
            Ok(sent) => sent,
            Err(e) => {
                debug!(error = %e, "Time-sync announce failed");
                false
            }
        }
    }
}

/// Builder for [`TelemetryLoop`].
pub struct TelemetryLoopBuilder<F: RouterFactory, B, S> {
    dispatcher: Dispatcher<F, B, S>,
    config: NodeConfig,
    metrics_history: usize,
}

impl<F, B, S> TelemetryLoopBuilder<F, B, S>
where
    F: RouterFactory,
    B: BusDriver + Clone + 'static,
    S: TickSource,
{
    /// Create a builder with default timing.
    pub fn new(dispatcher: Dispatcher<F, B, S>) -> Self {
        Self {
            dispatcher,
            config: NodeConfig::default(),
            metrics_history: DEFAULT_METRICS_HISTORY,
        }
    }

    /// Take timing from a node configuration.
    #[must_use]
    pub fn config(mut self, config: &NodeConfig) -> Self {
        self.config = config.clone();
        self
    }

    /// Set the per-cycle drain budget.
    #[must_use]
    pub fn drain_budget(mut self, budget: Duration) -> Self {
        self.config.dispatch.drain_budget = budget;
        self
    }

    /// Set the yield slice between cycles.
    #[must_use]
    pub fn yield_slice(mut self, slice: Duration) -> Self {
        self.config.dispatch.yield_slice = slice;
        self
    }

    /// Set the client request period.
    #[must_use]
    pub fn request_interval(mut self, interval: Duration) -> Self {
        self.config.timesync.request_interval = interval;
        self
    }

    /// Set the master announce period.
    #[must_use]
    pub fn announce_interval(mut self, interval: Duration) -> Self {
        self.config.timesync.announce_interval = interval;
        self
    }

    /// Set the number of cycle durations retained.
    #[must_use]
    pub fn metrics_history(mut self, history: usize) -> Self {
        self.metrics_history = history;
        self
    }

    /// Build the loop.
    pub fn build(self) -> TelemetryLoop<F, B, S> {
        let dispatch = &self.config.dispatch;
        let timesync = &self.config.timesync;
        TelemetryLoop {
            drain_budget: dispatch.drain_budget,
            yield_slice: dispatch.yield_slice,
            request: Periodic::new(timesync.request_interval),
            announce: Periodic::new(timesync.announce_interval),
            announce_priority: timesync.announce_priority,
            cycle_count: 0,
            metrics: LoopMetrics::new(self.metrics_history, dispatch.drain_budget),
            started: false,
            failure_streak: 0,
            dispatcher: self.dispatcher,
        }
    }
}
