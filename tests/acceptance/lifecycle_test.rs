//! Engine lifecycle acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - The engine starts, elects exactly one leader per cluster and stops cleanly
//! - The global period index advances once per aggregation period
//! - Every core ticks and leaves no throttle behind at stop
//! - Per-tick records land in per-core CSV files

use super::common::{single_cluster_config, wait_until, TestPlatform, AGGREGATION_PERIOD};
use memreg_common::config::{ClusterConfig, GpuProfilingConfig};
use memreg_common::state::EngineState;
use memreg_engine::Regulator;
use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_lifecycle_with_real_timers() {
    let platform = Arc::new(TestPlatform::new());
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1, 2, 3], false), platform).unwrap();

    let started = Instant::now();
    regulator.start().unwrap();
    assert_eq!(regulator.state(), EngineState::Running);

    let status = regulator.status();
    assert_eq!(status.clusters[0].leader, Some(0));
    assert_eq!(status.regulation_interval, 10);

    thread::sleep(Duration::from_millis(250));
    let report = regulator.stop().unwrap();
    let elapsed = started.elapsed();
    assert_eq!(regulator.state(), EngineState::Stopped);

    // At most one committed index per elapsed aggregation period.
    let max_index = u64::try_from(elapsed.as_millis() / AGGREGATION_PERIOD.as_millis()).unwrap() + 1;
    assert!(report.period_index >= 5, "index {}", report.period_index);
    assert!(report.period_index <= max_index, "index {} > {max_index}", report.period_index);

    assert_eq!(report.cores.len(), 4);
    for core in &report.cores {
        assert!(core.ticks.total_ticks > 0, "core {} never ticked", core.core);
        assert!(!core.throttle.throttled);
    }
    // The first regulation tick (index 1) already ran.
    assert!(report.clusters[0].regulation_period_count >= 1);
}

#[test]
fn test_one_leader_per_cluster() {
    let mut config = single_cluster_config(&[0, 1], false);
    config.clusters.push(ClusterConfig {
        id: 2,
        cores: vec![2, 3],
        budget_mb: 100_000,
        gpu: GpuProfilingConfig {
            enabled: false,
            sampling_core: 3,
        },
    });

    let mut regulator = Regulator::new(config, Arc::new(TestPlatform::new())).unwrap();
    regulator.start().unwrap();
    let status = regulator.status();
    assert_eq!(status.clusters[0].leader, Some(0));
    assert_eq!(status.clusters[1].leader, Some(2));
    assert!(status.cores.iter().all(|c| c.armed_at_ns.is_some()));
    regulator.stop().unwrap();
}

#[test]
fn test_restart_after_stop() {
    let platform = Arc::new(TestPlatform::new());
    let mut regulator = Regulator::new(single_cluster_config(&[0, 1], false), platform).unwrap();

    regulator.start().unwrap();
    regulator.stop().unwrap();
    regulator.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || regulator.status().period_index > 0));
    let report = regulator.stop().unwrap();
    assert!(report.period_index > 0);
}

#[test]
fn test_records_written_to_csv() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = single_cluster_config(&[0, 1], false);
    config.logging.enabled = true;
    config.logging.directory = dir.path().to_path_buf();

    let platform = Arc::new(TestPlatform::new());
    let mut regulator = Regulator::new(config, Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();
    thread::sleep(Duration::from_millis(100));
    platform.add_events(1, 7);
    thread::sleep(Duration::from_millis(100));
    let report = regulator.stop().unwrap();

    assert!(report.records_written.unwrap() > 0);
    assert_eq!(report.records_dropped, Some(0));

    let cpu0 = fs::read_to_string(dir.path().join("memreg_cpu0.csv")).unwrap();
    let first = cpu0.lines().next().unwrap();
    let fields: Vec<&str> = first.split(',').collect();
    assert_eq!(fields.len(), 4);
    assert!(fields[1].contains('.'));
    assert!(fields[3] == "0" || fields[3] == "1");

    let cpu1 = fs::read_to_string(dir.path().join("memreg_cpu1.csv")).unwrap();
    let total: u64 = cpu1
        .lines()
        .map(|line| line.split(',').nth(2).unwrap().parse::<u64>().unwrap())
        .sum();
    assert!(total <= 7);
}
