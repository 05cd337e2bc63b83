//! Per-node diagnostics reported at shutdown.

use serde::Serialize;
use telem_common::config::Role;
use telem_common::state::LinkState;
use telem_dispatch::{BusDriver, RouterFactory, TelemetryLoop};
use telem_timesync::{SyncStats, TickSource};

/// Health of a telemetry node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Link up, drains succeeding, time known.
    Healthy,
    /// Link up but drains have failed or unix time is unknown.
    Degraded,
    /// Link never came up.
    Offline,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Snapshot of one node's telemetry loop.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Node name.
    pub node: String,
    /// Time-sync role.
    pub role: Role,
    /// Overall health.
    pub health: HealthStatus,
    /// Link lifecycle state.
    pub link_state: LinkState,
    /// Loop cycles executed.
    pub cycles: u64,
    /// Cycles that exceeded the drain budget.
    pub overruns: u64,
    /// Drains that returned an error.
    pub drain_failures: u64,
    /// Mean cycle time in microseconds.
    pub mean_cycle_us: Option<u128>,
    /// Worst cycle time in microseconds.
    pub max_cycle_us: Option<u128>,
    /// Records stored by the local sink.
    pub sink_records: u64,
    /// Received datagrams dropped because the router was full.
    pub inbox_overflows: u64,
    /// Applied time-sync offset.
    pub offset_ms: i64,
    /// Last measured delay.
    pub last_delay_ms: u64,
    /// Unix time at the moment of the report, 0 if unknown.
    pub unix_ms: u64,
    /// Time-sync counters.
    pub sync: SyncStats,
}

impl NodeReport {
    /// Capture a report from a loop.
    pub fn capture<F, B, S>(node: &str, telemetry: &mut TelemetryLoop<F, B, S>) -> Self
    where
        F: RouterFactory,
        B: BusDriver + Clone + 'static,
        S: TickSource,
    {
        let metrics = telemetry.metrics();
        let cycles = metrics.total_cycles();
        let overruns = metrics.overrun_count();
        let drain_failures = metrics.drain_failures();
        let mean_cycle_us = metrics.mean().map(|d| d.as_micros());
        let max_cycle_us = metrics.max().map(|d| d.as_micros());

        let dispatcher = telemetry.dispatcher_mut();
        let link_state = dispatcher.link_state();
        let unix_valid = dispatcher.unix_is_valid();
        let state = dispatcher.engine().clock().state();
        let (offset_ms, last_delay_ms) = (state.offset_ms(), state.last_delay_ms());

        Self {
            node: node.to_string(),
            role: dispatcher.role(),
            health: health(link_state, drain_failures, unix_valid),
            link_state,
            cycles,
            overruns,
            drain_failures,
            mean_cycle_us,
            max_cycle_us,
            sink_records: dispatcher.sink_records(),
            inbox_overflows: dispatcher.inbox_overflows(),
            offset_ms,
            last_delay_ms,
            unix_ms: dispatcher.unix_now_ms(),
            sync: dispatcher.sync_stats().clone(),
        }
    }

    /// Render as pretty JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Derive health from link state, drain failures, and unix validity.
pub fn health(link_state: LinkState, drain_failures: u64, unix_valid: bool) -> HealthStatus {
    if !link_state.is_ready() {
        HealthStatus::Offline
    } else if drain_failures > 0 || !unix_valid {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use telem_common::config::NodeConfig;
    use telem_dispatch::{Dispatcher, QueueRouterFactory, SimBus, TelemetryLoopBuilder};
    use telem_timesync::SimulatedTicks;

    #[test]
    fn test_health_rules() {
        assert_eq!(health(LinkState::Failed, 0, true), HealthStatus::Offline);
        assert_eq!(health(LinkState::Uninitialized, 0, true), HealthStatus::Offline);
        assert_eq!(health(LinkState::Ready, 3, true), HealthStatus::Degraded);
        assert_eq!(health(LinkState::Ready, 0, false), HealthStatus::Degraded);
        assert_eq!(health(LinkState::Ready, 0, true), HealthStatus::Healthy);
    }

    #[test]
    fn test_health_display() {
        assert_eq!(HealthStatus::Healthy.to_string(), "healthy");
        assert_eq!(HealthStatus::Offline.to_string(), "offline");
    }

    #[test]
    fn test_capture_master_report() {
        let config = NodeConfig {
            role: Role::Master,
            ..NodeConfig::default()
        };
        let bus = SimBus::new();
        let ticks = SimulatedTicks::new(1000);
        let dispatcher = Dispatcher::new(
            &config,
            QueueRouterFactory::with_system_clock(16),
            bus.port(),
            ticks,
        );
        let mut telemetry = TelemetryLoopBuilder::new(dispatcher)
            .config(&config)
            .yield_slice(Duration::ZERO)
            .build();

        telemetry.dispatcher_mut().set_absolute_time(1_700_000_000_000);
        telemetry.run_cycles(3);

        let report = NodeReport::capture("master", &mut telemetry);
        assert_eq!(report.cycles, 3);
        assert_eq!(report.link_state, LinkState::Ready);
        assert_eq!(report.health, HealthStatus::Healthy);
        assert_eq!(report.unix_ms, 1_700_000_000_000);

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["role"], "master");
        assert_eq!(json["health"], "healthy");
        assert_eq!(json["link_state"], "READY");
        assert_eq!(json["sync"]["requests_answered"], 0);
        assert_eq!(json["inbox_overflows"], 0);
    }
}
