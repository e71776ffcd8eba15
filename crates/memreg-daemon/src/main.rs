//! Memory-bandwidth regulator daemon entry point.
//!
//! Loads the configuration, starts the regulation engine on a simulated
//! platform (optionally fed by external GPU profilers) and runs until a
//! signal or the requested duration ends it.

mod diagnostics;
mod gpu_socket;
mod signals;
mod simulated;

use anyhow::{Context, Result};
use clap::Parser;
use memreg_common::config::{CoreId, RegulatorConfig};
use memreg_engine::{Platform, Regulator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::diagnostics::{format_report, format_status, health};
use crate::signals::SignalHandler;
use crate::simulated::{GpuSource, SimulatedPlatform};

/// Daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "memreg-daemon",
    about = "Cluster-level memory bandwidth regulator",
    version,
    long_about = None
)]
struct Args {
    /// Path to a regulator configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Regulation period, e.g. "5300us" (overrides config file).
    #[arg(long, value_parser = humantime::parse_duration)]
    regulation_period: Option<Duration>,

    /// Aggregation period, e.g. "100us" (overrides config file).
    #[arg(long, value_parser = humantime::parse_duration)]
    aggregation_period: Option<Duration>,

    /// Write per-tick bandwidth records.
    #[arg(long)]
    log_records: bool,

    /// Directory for bandwidth record files.
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Bus events per millisecond generated by each simulated core.
    #[arg(long, default_value = "1000")]
    event_rate: u64,

    /// Treat the counter of this core as unavailable (repeatable).
    #[arg(long, value_name = "CORE")]
    exclude_core: Vec<CoreId>,

    /// Run an in-process GPU profiler answering with READ,WRITE beats.
    #[arg(long, value_name = "READ,WRITE", value_parser = parse_beats, conflicts_with = "gpu_socket")]
    gpu_beats: Option<(i32, i32)>,

    /// Connect to GPU profilers at this socket path; `{cluster}` expands to the cluster id.
    #[arg(long, value_name = "PATH")]
    gpu_socket: Option<String>,

    /// Stop after this long instead of waiting for a signal.
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Interval between periodic status log lines.
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    status_interval: Duration,

    /// Print the final report as JSON.
    #[arg(long)]
    json: bool,

    /// Print the resolved configuration and exit.
    #[arg(long)]
    print_config: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn parse_beats(value: &str) -> Result<(i32, i32), String> {
    let (read, write) = value
        .split_once(',')
        .ok_or_else(|| format!("expected READ,WRITE, got {value:?}"))?;
    let read = read.trim().parse().map_err(|e| format!("read beats: {e}"))?;
    let write = write.trim().parse().map_err(|e| format!("write beats: {e}"))?;
    Ok((read, write))
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting memreg daemon");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    if args.print_config {
        print!("{}", config.to_toml().context("Failed to serialize configuration")?);
        return Ok(());
    }

    info!(
        regulation_period = ?config.regulation_period,
        aggregation_period = ?config.aggregation_period,
        clusters = config.clusters.len(),
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::install().context("Failed to set up signal handlers")?;

    run_daemon(config, &args, &signal_handler)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("memreg_daemon={level},memreg_engine={level},memreg_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `MEMREG_CONFIG_PATH` environment variable
/// 3. `/etc/memreg/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<RegulatorConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return RegulatorConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()));
    }

    if let Ok(env_path) = std::env::var("MEMREG_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from MEMREG_CONFIG_PATH");
            return RegulatorConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from MEMREG_CONFIG_PATH={env_path}")
            });
        }
        warn!(
            path = %env_path,
            "MEMREG_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/memreg/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return RegulatorConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {path}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(RegulatorConfig::default())
}

fn apply_overrides(config: &mut RegulatorConfig, args: &Args) {
    if let Some(period) = args.regulation_period {
        config.regulation_period = period;
    }
    if let Some(period) = args.aggregation_period {
        config.aggregation_period = period;
    }
    if args.log_records {
        config.logging.enabled = true;
    }
    if let Some(dir) = &args.log_dir {
        config.logging.directory.clone_from(dir);
    }
}

fn gpu_source(args: &Args) -> GpuSource {
    match (&args.gpu_socket, args.gpu_beats) {
        (Some(template), _) => GpuSource::Socket {
            template: template.clone(),
        },
        (None, Some((read_beats, write_beats))) => GpuSource::Simulated {
            read_beats,
            write_beats,
        },
        (None, None) => GpuSource::Disabled,
    }
}

/// Main daemon run loop.
fn run_daemon(config: RegulatorConfig, args: &Args, signal_handler: &SignalHandler) -> Result<()> {
    let platform = Arc::new(
        SimulatedPlatform::new(args.event_rate)
            .with_unavailable(args.exclude_core.clone())
            .with_gpu(gpu_source(args)),
    );

    let shared: Arc<dyn Platform> = platform.clone();
    let mut regulator = Regulator::new(config, shared)
        .context("Failed to create regulator")?;
    regulator.start().context("Failed to start regulator")?;
    info!(health = %health(&regulator.status()), "Regulator started, entering main loop");

    let started = Instant::now();
    let mut last_status = Instant::now();
    loop {
        let tick = args.status_interval.min(Duration::from_millis(200));
        if signal_handler.wait_for_shutdown(tick) {
            info!("Shutdown signal received, stopping regulator");
            break;
        }

        if signal_handler.take_status_request() {
            eprint!("{}", format_status(&regulator.status()));
        }

        if last_status.elapsed() >= args.status_interval {
            last_status = Instant::now();
            let status = regulator.status();
            for cluster in &status.clusters {
                info!(
                    cluster = cluster.id,
                    usage = cluster.usage_events,
                    budget = cluster.budget_events,
                    periods = cluster.regulation_period_count,
                    throttled = cluster.throttled,
                    "Periodic status"
                );
            }
        }

        if args.duration.is_some_and(|d| started.elapsed() >= d) {
            info!("Requested duration elapsed");
            signal_handler.request_shutdown();
            break;
        }
    }

    info!("Shutting down...");
    let report = regulator.stop().context("Failed to stop regulator")?;
    platform.join_profilers();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        );
    } else {
        print!("{}", format_report(&report));
    }
    info!(
        periods = report.period_index,
        signals = signal_handler.state().signal_count(),
        uptime_secs = report.uptime.as_secs(),
        "Daemon shutdown complete"
    );

    Ok(())
}
