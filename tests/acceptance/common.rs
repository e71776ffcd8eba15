//! Common utilities for acceptance tests.
//!
//! Provides a platform whose counters are driven by the test and whose GPU
//! channels are in-process mailboxes, plus polling helpers for timing-based
//! assertions.

#![allow(dead_code)]

use memreg_common::config::{ClusterConfig, ClusterId, CoreId, GpuProfilingConfig, RegulatorConfig};
use memreg_common::error::{RegError, RegResult};
use memreg_engine::{
    mailbox, BandwidthCounter, GpuChannel, MailboxProfiler, ManualCounter, ManualCounterHandle,
    Platform,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Regulation period used by the acceptance scenarios.
pub const REGULATION_PERIOD: Duration = Duration::from_millis(200);

/// Aggregation period used by the acceptance scenarios.
pub const AGGREGATION_PERIOD: Duration = Duration::from_millis(20);

/// Platform with test-driven counters.
#[derive(Default)]
pub struct TestPlatform {
    unavailable: Vec<CoreId>,
    gpu: bool,
    feeds: Mutex<HashMap<CoreId, ManualCounterHandle>>,
    profilers: Mutex<HashMap<ClusterId, MailboxProfiler>>,
}

impl TestPlatform {
    /// Platform without GPU profilers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `cores` as having no counter.
    pub fn with_unavailable(mut self, cores: &[CoreId]) -> Self {
        self.unavailable = cores.to_vec();
        self
    }

    /// Hand out a mailbox GPU channel per cluster.
    pub fn with_gpu(mut self) -> Self {
        self.gpu = true;
        self
    }

    /// Add `events` to the counter of `core`.
    pub fn add_events(&self, core: CoreId, events: u64) {
        if let Some(feed) = self.feeds.lock().unwrap().get(&core) {
            feed.add(events);
        }
    }

    /// Whether `core` got a counter.
    pub fn has_counter(&self, core: CoreId) -> bool {
        self.feeds.lock().unwrap().contains_key(&core)
    }

    /// Take the profiler end of `cluster`'s GPU channel.
    pub fn take_profiler(&self, cluster: ClusterId) -> Option<MailboxProfiler> {
        self.profilers.lock().unwrap().remove(&cluster)
    }
}

impl Platform for TestPlatform {
    fn open_counter(&self, core: CoreId) -> RegResult<Box<dyn BandwidthCounter>> {
        if self.unavailable.contains(&core) {
            return Err(RegError::CounterUnavailable {
                core,
                reason: "not supported by test platform".into(),
            });
        }
        let (counter, feed) = ManualCounter::new();
        self.feeds.lock().unwrap().insert(core, feed);
        Ok(Box::new(counter))
    }

    fn open_gpu_channel(&self, cluster: ClusterId) -> RegResult<GpuChannel> {
        if !self.gpu {
            return Err(RegError::ChannelClosed);
        }
        let (profiler, channel) = mailbox();
        self.profilers.lock().unwrap().insert(cluster, profiler);
        Ok(channel)
    }
}

/// One cluster with id 1 over `cores`, GPU sampled on the last core.
pub fn single_cluster_config(cores: &[CoreId], gpu: bool) -> RegulatorConfig {
    RegulatorConfig {
        regulation_period: REGULATION_PERIOD,
        aggregation_period: AGGREGATION_PERIOD,
        start_delay: Duration::from_millis(10),
        clusters: vec![ClusterConfig {
            id: 1,
            cores: cores.to_vec(),
            budget_mb: 100_000,
            gpu: GpuProfilingConfig {
                enabled: gpu,
                sampling_core: cores[cores.len() - 1],
            },
        }],
        ..Default::default()
    }
}

/// Poll `condition` every millisecond until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
