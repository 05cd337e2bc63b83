//! Telemetry node entry point.
//!
//! Runs one master and a configurable number of clients on a simulated bus,
//! each in its own telemetry thread with an unrelated local clock. The
//! master takes absolute time from the host clock, standing in for a GPS
//! fix; clients converge on it through the time-sync exchange.

mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use telem_common::config::{NodeConfig, Role};
use telem_dispatch::{
    DataType, Delivery, Dispatcher, ElemKind, QueueRouterFactory, SimBus, SimBusPort,
    TelemetryLoop,
};
use telem_timesync::SystemTicks;
use tracing::{error, info, warn};

use crate::diagnostics::NodeReport;
use crate::signals::{wait_for_shutdown, ShutdownState, SignalHandler};

/// Cycles between synthetic sensor samples on client nodes.
const SAMPLE_EVERY_CYCLES: u64 = 250;

/// Spacing of the simulated clients' clock origins.
const CLOCK_SPREAD_MS: u32 = 7_919;

/// Telemetry node command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "telem-node",
    about = "Bus telemetry node - time sync and telemetry dispatch over a simulated bus",
    version,
    long_about = None
)]
struct Args {
    /// Path to a node configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of simulated client nodes.
    #[arg(long, default_value = "2")]
    clients: u32,

    /// Maximum cycles per node (0 = until shutdown).
    #[arg(long, default_value = "0")]
    max_cycles: u64,

    /// Stop after this long (e.g. "30s", "5m").
    #[arg(long, value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,

    /// Disable telemetry (entry points become no-ops).
    #[arg(long)]
    no_telemetry: bool,

    /// Print per-node reports as JSON on shutdown.
    #[arg(long)]
    json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

type SimLoop = TelemetryLoop<QueueRouterFactory, SimBusPort, SystemTicks>;

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting telemetry node");

    let mut config = load_config(&args)?;
    if args.no_telemetry {
        config.telemetry_enabled = false;
    }

    info!(
        node = %config.node_name,
        clients = args.clients,
        telemetry_enabled = config.telemetry_enabled,
        drain_budget = ?config.dispatch.drain_budget,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().unwrap_or_else(|e| {
        warn!(error = %e, "Signal handlers unavailable, stop with --run-for or --max-cycles");
        SignalHandler::manual()
    });

    run_node(&config, &args, &signal_handler)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "telem_node={level},telem_dispatch={level},telem_timesync={level},telem_common={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TELEM_CONFIG_PATH` environment variable
/// 3. `/etc/telem/node.toml` (system path)
/// 4. `config/node.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<NodeConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return NodeConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("TELEM_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from TELEM_CONFIG_PATH");
            return NodeConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from TELEM_CONFIG_PATH={env_path}")
            });
        }
        warn!(
            path = %env_path,
            "TELEM_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/telem/node.toml", "config/node.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config from file");
            return NodeConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {path}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(NodeConfig::default())
}

/// Derive per-node configurations: one master followed by the clients.
fn node_configs(base: &NodeConfig, clients: u32) -> Vec<NodeConfig> {
    let master = NodeConfig {
        node_name: format!("{}-master", base.node_name),
        role: Role::Master,
        ..base.clone()
    };
    std::iter::once(master)
        .chain((1..=clients).map(|i| NodeConfig {
            node_name: format!("{}-client{i}", base.node_name),
            role: Role::Client,
            ..base.clone()
        }))
        .collect()
}

fn host_unix_ms() -> Option<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
}

fn build_loop(config: &NodeConfig, bus: &SimBus, preload: u32) -> SimLoop {
    let ticks = SystemTicks::with_preload(config.clock.ticks_per_second, preload);
    let factory = QueueRouterFactory::with_system_clock(config.dispatch.queue_capacity);
    let dispatcher = Dispatcher::new(config, factory, bus.port(), ticks);
    TelemetryLoop::new(dispatcher, config)
}

/// Body of one telemetry thread.
fn run_telemetry(
    config: &NodeConfig,
    bus: &SimBus,
    preload: u32,
    max_cycles: u64,
    shutdown: &ShutdownState,
) -> NodeReport {
    let mut telemetry = build_loop(config, bus, preload);

    if config.role == Role::Master {
        match host_unix_ms() {
            Some(unix_ms) => {
                telemetry.dispatcher_mut().set_absolute_time(unix_ms);
            }
            None => warn!("Host clock before unix epoch, master has no absolute time"),
        }
    }

    // Only clients log samples, so an unbounded master can run the plain loop
    if config.role == Role::Master && max_cycles == 0 {
        telemetry.run(shutdown.flag());
        return NodeReport::capture(&config.node_name, &mut telemetry);
    }

    while !shutdown.shutdown_requested() {
        let result = telemetry.run_cycle();

        if config.role == Role::Client && result.cycle_count % SAMPLE_EVERY_CYCLES == 0 {
            log_heartbeat(&mut telemetry, result.cycle_count);
        }
        if max_cycles > 0 && result.cycle_count >= max_cycles {
            info!(cycles = result.cycle_count, "Maximum cycle count reached");
            break;
        }
    }

    NodeReport::capture(&config.node_name, &mut telemetry)
}

/// Log a heartbeat sample: cycle count and unix seconds as unsigned words.
fn log_heartbeat(telemetry: &mut SimLoop, cycle: u64) {
    let dispatcher = telemetry.dispatcher_mut();
    let unix_s = dispatcher.unix_now_s();
    let data: Vec<u8> = [cycle, unix_s].iter().flat_map(|w| w.to_le_bytes()).collect();

    let logged = dispatcher.log_sample_as(
        DataType::MESSAGE_DATA,
        &data,
        2,
        8,
        ElemKind::Unsigned,
        Delivery::Queued,
    );
    if let Err(e) = logged {
        if let Err(report_err) = dispatcher.report_error(&e) {
            warn!(error = %report_err, "Failed to report heartbeat error");
        }
    }
}

fn spawn_node(
    config: NodeConfig,
    bus: SimBus,
    preload: u32,
    max_cycles: u64,
    shutdown: Arc<ShutdownState>,
) -> Result<JoinHandle<NodeReport>> {
    let name = config.node_name.clone();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || run_telemetry(&config, &bus, preload, max_cycles, &shutdown))
        .map_err(|e| {
            error!(node = %name, error = %e, "Failed to spawn telemetry thread");
            anyhow::anyhow!("failed to spawn telemetry thread {name}: {e}")
        })
}

/// Supervise the telemetry threads until shutdown, deadline, or completion.
fn run_node(config: &NodeConfig, args: &Args, signal_handler: &SignalHandler) -> Result<()> {
    let bus = SimBus::new();
    let started = Instant::now();

    let mut handles = Vec::new();
    for (i, node_config) in node_configs(config, args.clients).into_iter().enumerate() {
        let preload = u32::try_from(i)
            .unwrap_or(u32::MAX)
            .wrapping_mul(CLOCK_SPREAD_MS);
        match spawn_node(
            node_config,
            bus.clone(),
            preload,
            args.max_cycles,
            Arc::clone(signal_handler.state()),
        ) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                // Stop whatever already started before failing
                signal_handler.request_shutdown();
                for handle in handles {
                    let _ = handle.join();
                }
                return Err(e);
            }
        }
    }

    info!(nodes = handles.len(), "Telemetry threads running");

    loop {
        if wait_for_shutdown(signal_handler, Duration::from_millis(100)) {
            break;
        }
        if args.run_for.is_some_and(|limit| started.elapsed() >= limit) {
            info!("Run duration reached");
            signal_handler.request_shutdown();
            break;
        }
        if handles.iter().all(JoinHandle::is_finished) {
            break;
        }
    }

    info!("Shutting down...");
    signal_handler.request_shutdown();

    let mut reports = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(report) => reports.push(report),
            Err(_) => error!("Telemetry thread panicked"),
        }
    }

    for report in &reports {
        info!(
            node = %report.node,
            role = %report.role,
            health = %report.health,
            cycles = report.cycles,
            offset_ms = report.offset_ms,
            delay_ms = report.last_delay_ms,
            unix_ms = report.unix_ms,
            sink_records = report.sink_records,
            inbox_overflows = report.inbox_overflows,
            "Node summary"
        );
        if args.json {
            println!("{}", report.to_json().context("Failed to render report")?);
        }
    }

    info!(
        datagrams = bus.datagrams(),
        signals = signal_handler.state().signal_count(),
        uptime_secs = started.elapsed().as_secs(),
        "Node shutdown complete"
    );

    Ok(())
}
