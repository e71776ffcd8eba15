//! Budget enforcement acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Overrunning the cluster budget throttles every member core
//! - Throttling lifts at the next regulation boundary regardless of usage
//! - Usage resets at that boundary and the regulation period count advances

use super::common::{single_cluster_config, wait_until, TestPlatform, REGULATION_PERIOD};
use memreg_engine::Regulator;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CORES: [usize; 4] = [0, 1, 2, 3];

#[test]
fn test_overrun_throttles_all_members_until_regulation() {
    let platform = Arc::new(TestPlatform::new());
    let mut regulator =
        Regulator::new(single_cluster_config(&CORES, false), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();

    let ctx = Arc::clone(regulator.context().unwrap());
    let cluster = ctx.cluster(0).unwrap();
    assert!(wait_until(Duration::from_secs(2), || cluster.regulation_period_count() >= 1));
    cluster.set_budget_events(100);

    // Counters are frozen for a moment each tick; keep feeding until the overrun is seen.
    let all_throttled = wait_until(REGULATION_PERIOD * 3, || {
        for core in CORES {
            platform.add_events(core, 30);
        }
        thread::sleep(Duration::from_millis(2));
        CORES.iter().all(|&c| ctx.board().is_throttled(c))
    });
    assert!(all_throttled, "members not throttled after overrun");
    let period_at_throttle = cluster.regulation_period_count();

    // No more traffic: the next regulation tick lifts every throttle.
    let released = wait_until(REGULATION_PERIOD * 3, || {
        CORES.iter().all(|&c| !ctx.board().is_throttled(c))
    });
    assert!(released, "throttle not lifted at regulation boundary");
    assert!(cluster.regulation_period_count() > period_at_throttle);

    let report = regulator.stop().unwrap();
    for core in &report.cores {
        assert!(core.throttle.throttle_count >= 1, "core {} never throttled", core.core);
        assert!(!core.throttle.throttled);
    }
}

#[test]
fn test_traffic_within_budget_never_throttles() {
    let platform = Arc::new(TestPlatform::new());
    let mut regulator =
        Regulator::new(single_cluster_config(&CORES, false), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();

    for _ in 0..20 {
        for core in CORES {
            platform.add_events(core, 10);
        }
        thread::sleep(Duration::from_millis(10));
    }
    let report = regulator.stop().unwrap();
    assert!(report.cores.iter().all(|c| c.throttle.throttle_count == 0));
    assert!(!report.clusters[0].throttled);
}

#[test]
fn test_budget_update_applies_while_running() {
    let platform = Arc::new(TestPlatform::new());
    let mut regulator =
        Regulator::new(single_cluster_config(&[0, 1], false), Arc::clone(&platform) as _).unwrap();
    regulator.start().unwrap();

    // 1 MiB/s over 200 ms with 64-byte lines.
    regulator.set_budget_mb(1, 1).unwrap();
    let cluster_budget = regulator.status().clusters[0].budget_events;
    assert_eq!(cluster_budget, 3276);

    let throttled = wait_until(REGULATION_PERIOD * 3, || {
        platform.add_events(0, 1000);
        thread::sleep(Duration::from_millis(2));
        regulator.status().cores.iter().all(|c| c.throttle.throttled)
    });
    assert!(throttled);
    regulator.stop().unwrap();
}
