//! GPU bandwidth acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - The sampling core requests GPU samples from its aggregation ticks
//! - A sample of 10 read and 5 write beats folds 4 events into the cluster
//! - GPU traffic alone can push a cluster over budget
//! - A vanished profiler leaves CPU regulation running

use super::common::{single_cluster_config, wait_until, TestPlatform, REGULATION_PERIOD};
use memreg_engine::Regulator;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_gpu_sample_folds_into_cluster() {
    let platform = Arc::new(TestPlatform::new().with_gpu());
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1], true), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();
    let profiler = platform.take_profiler(1).unwrap();

    assert!(profiler.wait_requests(Duration::from_secs(2)) > 0, "no sample request");
    profiler.deliver(10, 5).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        regulator.status().gpu[0].samples == 1
    }));

    let gpu = regulator.status().gpu[0];
    assert_eq!(gpu.events, 4);
    assert_eq!(gpu.sampling_core, 1);

    let report = regulator.stop().unwrap();
    assert!(report.gpu[0].requests >= 1);
    assert!(profiler.is_terminated());
}

#[test]
fn test_gpu_traffic_alone_throttles() {
    let platform = Arc::new(TestPlatform::new().with_gpu());
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1], true), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();
    let profiler = platform.take_profiler(1).unwrap();

    let ctx = Arc::clone(regulator.context().unwrap());
    ctx.cluster(0).unwrap().set_budget_events(3);

    let throttled = wait_until(REGULATION_PERIOD * 3, || {
        if profiler.wait_requests(Duration::from_millis(5)) > 0 {
            let _ = profiler.deliver(1000, 1000);
        }
        ctx.board().is_throttled(0) && ctx.board().is_throttled(1)
    });
    assert!(throttled, "GPU overrun did not throttle the cluster");
    regulator.stop().unwrap();
}

#[test]
fn test_closed_profiler_keeps_cpu_regulation() {
    let platform = Arc::new(TestPlatform::new().with_gpu());
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1], true), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();

    drop(platform.take_profiler(1));
    assert!(wait_until(Duration::from_secs(2), || regulator.status().gpu[0].channel_closed));

    let before = regulator.status().period_index;
    assert!(wait_until(Duration::from_secs(2), || {
        regulator.status().period_index > before + 2
    }));
    regulator.stop().unwrap();
}

#[test]
fn test_disabled_profiler_gets_no_requests() {
    let platform = Arc::new(TestPlatform::new().with_gpu());
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1], true), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();
    let profiler = platform.take_profiler(1).unwrap();

    assert!(regulator.disable_gpu_profiler(1));
    // Drain requests that raced the disable.
    let _ = profiler.wait_requests(Duration::from_millis(50));
    assert_eq!(profiler.wait_requests(Duration::from_millis(100)), 0);
    regulator.stop().unwrap();
}
