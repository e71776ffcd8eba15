//! Human-readable status and shutdown reports.

use memreg_common::state::EngineState;
use memreg_engine::{RegulatorReport, RegulatorStatus};
use std::fmt::Write;
use std::time::Duration;

/// Coarse health of the regulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Every configured core and GPU channel is regulated.
    Healthy,
    /// Running, but some core or GPU channel dropped out.
    Degraded,
    /// Startup failed.
    Unhealthy,
    /// Not yet running.
    Starting,
    /// Stopping or stopped.
    ShuttingDown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Derive health from a status snapshot.
pub fn health(status: &RegulatorStatus) -> HealthStatus {
    match status.state {
        state if state.is_active() => {
            let lost_gpu = status.gpu.iter().any(|g| g.channel_closed);
            let offline = status.cores.iter().any(|c| c.throttle.offline);
            if status.excluded_cores.is_empty() && !lost_gpu && !offline {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            }
        }
        EngineState::Failed => HealthStatus::Unhealthy,
        EngineState::Stopping | EngineState::Stopped => HealthStatus::ShuttingDown,
        _ => HealthStatus::Starting,
    }
}

/// Configuration and state view, one block per cluster.
pub fn format_status(status: &RegulatorStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Cluster-level Memory Bandwidth Regulator ===");
    let _ = writeln!(
        out,
        " - State: {} ({}, {} transitions)",
        status.state,
        health(status),
        status.state_transitions
    );

    for cluster in &status.clusters {
        let _ = writeln!(out);
        let _ = writeln!(out, " - Cluster{} budget (MB/s): {}", cluster.id, cluster.budget_mb);
        let _ = writeln!(
            out,
            " - Cluster{} budget (events/period): {}",
            cluster.id, cluster.budget_events
        );
        match cluster.leader {
            Some(leader) => {
                let _ = writeln!(out, " - Cluster{} leader core: {leader}", cluster.id);
            }
            None => {
                let _ = writeln!(out, " - Cluster{} leader core: none", cluster.id);
            }
        }
        for core in status.cores.iter().filter(|c| c.cluster == cluster.id) {
            let armed = core
                .armed_at_ns
                .map_or_else(|| "-".to_string(), |ns| ns.to_string());
            let _ = writeln!(
                out,
                "    - Core{} timer start time (ns): {armed}{}",
                core.throttle.core,
                if core.throttle.throttled { " [throttled]" } else { "" }
            );
        }
        let _ = writeln!(
            out,
            " - Cluster{} usage (events): {}{}",
            cluster.id,
            cluster.usage_events,
            if cluster.throttled { " [throttled]" } else { "" }
        );
        match status.gpu.iter().find(|g| g.cluster == cluster.id) {
            Some(gpu) if gpu.profiler_enabled && !gpu.channel_closed => {
                let _ = writeln!(
                    out,
                    " - Cluster{} GPU profiling: Activated (GPU profiler at CPU {})",
                    cluster.id, gpu.sampling_core
                );
            }
            Some(_) => {
                let _ = writeln!(out, " - Cluster{} GPU profiling: Stopped", cluster.id);
            }
            None => {
                let _ = writeln!(out, " - Cluster{} GPU profiling: Deactivated", cluster.id);
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, " - Regulation period (us): {}", status.regulation_period_us);
    let _ = writeln!(out, " - Aggregation period (us): {}", status.aggregation_period_us);
    let _ = writeln!(out, " - Period index: {}", status.period_index);
    if !status.excluded_cores.is_empty() {
        let _ = writeln!(out, " - Excluded cores: {:?}", status.excluded_cores);
    }
    let _ = writeln!(
        out,
        " - Logging: {}",
        if status.logging_enabled { "enabled" } else { "disabled" }
    );
    let _ = writeln!(out, "===============");
    out
}

/// Final statistics printed at shutdown.
pub fn format_report(report: &RegulatorReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Regulator ran {} over {} periods",
        humantime::format_duration(Duration::from_millis(
            u64::try_from(report.uptime.as_millis()).unwrap_or(u64::MAX)
        )),
        report.period_index
    );

    for cluster in &report.clusters {
        let _ = writeln!(
            out,
            "Cluster{}: {} regulation periods, leader {:?}",
            cluster.id, cluster.regulation_period_count, cluster.leader
        );
    }
    for core in &report.cores {
        let max_us = core.ticks.max_ns.map_or(0, |ns| ns / 1000);
        let mean_us = core.ticks.mean_ns.map_or(0, |ns| ns / 1000);
        let p99_us = core.ticks.p99_ns.map_or(0, |ns| ns / 1000);
        let _ = writeln!(
            out,
            "  Core{}: {} ticks (mean {mean_us}us, p99 {p99_us}us, max {max_us}us), {} lagged, throttled {}x for {}",
            core.core,
            core.ticks.total_ticks,
            core.ticks.lagged_ticks,
            core.throttle.throttle_count,
            humantime::format_duration(Duration::from_micros(
                u64::try_from(core.throttle.throttled_total.as_micros()).unwrap_or(u64::MAX)
            )),
        );
    }
    for gpu in &report.gpu {
        let _ = writeln!(
            out,
            "GPU cluster{}: {} requests, {} samples, {} events",
            gpu.cluster, gpu.requests, gpu.samples, gpu.events
        );
    }
    if let (Some(written), Some(dropped)) = (report.records_written, report.records_dropped) {
        let _ = writeln!(out, "Records: {written} written, {dropped} dropped");
    }
    out
}
