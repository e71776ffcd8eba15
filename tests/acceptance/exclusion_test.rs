//! Core exclusion acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A core whose counter is unavailable is excluded and the engine still starts
//! - Cluster usage comes from the remaining cores only
//! - An excluded core is never throttled

use super::common::{single_cluster_config, wait_until, TestPlatform, REGULATION_PERIOD};
use memreg_engine::Regulator;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn test_unavailable_counter_excludes_core() {
    let platform = Arc::new(TestPlatform::new().with_unavailable(&[2]));
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1, 2, 3], false), Arc::clone(&platform) as _)
            .unwrap();
    regulator.start().unwrap();

    assert_eq!(regulator.excluded_cores(), &[2]);
    assert!(!platform.has_counter(2));
    let status = regulator.status();
    assert_eq!(status.clusters[0].members, vec![0, 1, 3]);
    assert_eq!(status.cores.len(), 3);

    let ctx = Arc::clone(regulator.context().unwrap());
    let cluster = ctx.cluster(0).unwrap();
    cluster.set_budget_events(50);
    assert!(wait_until(REGULATION_PERIOD * 3, || {
        platform.add_events(0, 20);
        thread::sleep(Duration::from_millis(2));
        ctx.board().is_throttled(0)
    }));
    assert!(ctx.board().is_throttled(1));
    assert!(ctx.board().is_throttled(3));
    assert!(!ctx.board().is_throttled(2));

    regulator.stop().unwrap();
}

#[test]
fn test_excluded_sampling_core_disables_gpu_only() {
    let platform = Arc::new(TestPlatform::new().with_gpu().with_unavailable(&[1]));
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1], true), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();

    let status = regulator.status();
    assert!(status.gpu.is_empty());
    assert_eq!(status.clusters[0].members, vec![0]);
    assert!(platform.take_profiler(1).is_none());
    regulator.stop().unwrap();
}
