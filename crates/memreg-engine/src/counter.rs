//! Bandwidth counter and platform collaborators.
//!
//! The engine never programs hardware itself. A [`Platform`] hands out one
//! [`BandwidthCounter`] per core (typically an LLC-miss or bus-access PMU
//! event) and, optionally, one GPU sample channel per cluster.

use crate::gpu_bridge::GpuChannel;
use memreg_common::config::{ClusterId, CoreId};
use memreg_common::error::{RegError, RegResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Monotonic count of bus events observed on one core.
pub trait BandwidthCounter: Send {
    /// Current cumulative event count.
    fn read_count(&self) -> u64;

    /// Reset the cumulative count to zero.
    fn reset(&mut self);

    /// Freeze counting so a subsequent read is consistent.
    fn stop(&mut self) {}

    /// Resume counting after [`stop`](Self::stop).
    fn start(&mut self) {}
}

/// Source of per-core counters and per-cluster GPU sample channels.
pub trait Platform: Send + Sync {
    /// Create the bandwidth counter for `core`.
    ///
    /// # Errors
    ///
    /// Return [`RegError::CounterUnavailable`] when the core cannot be
    /// counted; the engine then excludes that core. Any other error aborts
    /// startup.
    fn open_counter(&self, core: CoreId) -> RegResult<Box<dyn BandwidthCounter>>;

    /// Open the GPU profiler channel for `cluster`.
    ///
    /// # Errors
    ///
    /// [`RegError::ChannelClosed`] means no profiler is reachable; the
    /// cluster is then regulated on CPU traffic only.
    fn open_gpu_channel(&self, cluster: ClusterId) -> RegResult<GpuChannel> {
        let _ = cluster;
        Err(RegError::ChannelClosed)
    }
}

/// Counter whose value is driven by a [`ManualCounterHandle`].
///
/// Used by simulations and tests that need exact control over the events a
/// core reports.
#[derive(Debug)]
pub struct ManualCounter {
    shared: Arc<ManualShared>,
}

#[derive(Debug, Default)]
struct ManualShared {
    count: AtomicU64,
    frozen: AtomicBool,
    resets: AtomicU64,
}

/// Feeding side of a [`ManualCounter`].
#[derive(Debug, Clone)]
pub struct ManualCounterHandle {
    shared: Arc<ManualShared>,
}

impl ManualCounter {
    /// Create a counter starting at zero together with its handle.
    #[must_use]
    pub fn new() -> (Self, ManualCounterHandle) {
        let shared = Arc::new(ManualShared::default());
        (
            Self {
                shared: Arc::clone(&shared),
            },
            ManualCounterHandle { shared },
        )
    }
}

impl BandwidthCounter for ManualCounter {
    fn read_count(&self) -> u64 {
        self.shared.count.load(Ordering::Acquire)
    }

    fn reset(&mut self) {
        self.shared.count.store(0, Ordering::Release);
        self.shared.resets.fetch_add(1, Ordering::Relaxed);
    }

    fn stop(&mut self) {
        self.shared.frozen.store(true, Ordering::Release);
    }

    fn start(&mut self) {
        self.shared.frozen.store(false, Ordering::Release);
    }
}

impl ManualCounterHandle {
    /// Account `events` to the core. Dropped while the counter is frozen.
    pub fn add(&self, events: u64) {
        if !self.shared.frozen.load(Ordering::Acquire) {
            self.shared.count.fetch_add(events, Ordering::AcqRel);
        }
    }

    /// Current cumulative value.
    #[must_use]
    pub fn value(&self) -> u64 {
        self.shared.count.load(Ordering::Acquire)
    }

    /// Number of times the engine reset this counter.
    #[must_use]
    pub fn resets(&self) -> u64 {
        self.shared.resets.load(Ordering::Relaxed)
    }
}
