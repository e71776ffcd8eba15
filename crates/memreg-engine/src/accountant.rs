//! Per-core counter accounting.
//!
//! A [`CoreAccountant`] is owned by exactly one timer handler and never
//! shared, so it needs no synchronization.

use crate::counter::BandwidthCounter;
use memreg_common::config::CoreId;
use memreg_common::metrics::TickMetrics;

/// Handler durations retained per core.
pub const TICK_HISTORY: usize = 1024;

/// Counter baseline and period bookkeeping of one core.
pub struct CoreAccountant {
    id: CoreId,
    cluster: usize,
    counter: Box<dyn BandwidthCounter>,
    baseline: u64,
    local_period: u64,
    samples_gpu: bool,
    metrics: TickMetrics,
}

impl std::fmt::Debug for CoreAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreAccountant")
            .field("id", &self.id)
            .field("cluster", &self.cluster)
            .field("baseline", &self.baseline)
            .field("local_period", &self.local_period)
            .field("samples_gpu", &self.samples_gpu)
            .finish_non_exhaustive()
    }
}

impl CoreAccountant {
    /// Take ownership of `counter`, reset it and record the baseline.
    ///
    /// `cluster` is the index of the owning cluster in the engine's arena.
    #[must_use]
    pub fn new(
        id: CoreId,
        cluster: usize,
        mut counter: Box<dyn BandwidthCounter>,
        samples_gpu: bool,
    ) -> Self {
        counter.reset();
        let baseline = counter.read_count();
        Self {
            id,
            cluster,
            counter,
            baseline,
            local_period: 0,
            samples_gpu,
            metrics: TickMetrics::new(TICK_HISTORY),
        }
    }

    /// Core identifier.
    #[must_use]
    pub fn id(&self) -> CoreId {
        self.id
    }

    /// Arena index of the owning cluster.
    #[must_use]
    pub fn cluster(&self) -> usize {
        self.cluster
    }

    /// Whether this core's aggregation ticks request GPU samples.
    #[must_use]
    pub fn samples_gpu(&self) -> bool {
        self.samples_gpu
    }

    /// Last period index this core committed or adopted.
    #[must_use]
    pub fn local_period(&self) -> u64 {
        self.local_period
    }

    /// Adopt `index` as the current period, returning the step taken.
    pub fn adopt_period(&mut self, index: u64) -> u64 {
        let step = index.saturating_sub(self.local_period);
        self.local_period = index;
        self.metrics.record_step(step);
        step
    }

    /// Freeze the counter for a consistent read.
    pub fn freeze(&mut self) {
        self.counter.stop();
    }

    /// Resume counting.
    pub fn thaw(&mut self) {
        self.counter.start();
    }

    /// Events counted since the previous call, advancing the baseline.
    ///
    /// A counter that went backwards was reset underneath us; its whole
    /// current value is then the delta.
    pub fn take_delta(&mut self) -> u64 {
        let now = self.counter.read_count();
        let delta = now.checked_sub(self.baseline).unwrap_or(now);
        self.baseline = now;
        delta
    }

    /// Handler timing and lag metrics.
    #[must_use]
    pub fn metrics(&self) -> &TickMetrics {
        &self.metrics
    }

    /// Mutable metrics access for the owning handler.
    pub fn metrics_mut(&mut self) -> &mut TickMetrics {
        &mut self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::ManualCounter;

    #[test]
    fn test_baseline_after_reset() {
        let (counter, handle) = ManualCounter::new();
        handle.add(1000);
        let mut core = CoreAccountant::new(0, 0, Box::new(counter), false);
        assert_eq!(handle.resets(), 1);
        assert_eq!(core.take_delta(), 0);
    }

    #[test]
    fn test_deltas_are_incremental() {
        let (counter, handle) = ManualCounter::new();
        let mut core = CoreAccountant::new(1, 0, Box::new(counter), false);
        handle.add(30);
        assert_eq!(core.take_delta(), 30);
        handle.add(12);
        assert_eq!(core.take_delta(), 12);
        assert_eq!(core.take_delta(), 0);
    }

    #[test]
    fn test_counter_wrap_uses_current_value() {
        let (counter, handle) = ManualCounter::new();
        let mut core = CoreAccountant::new(1, 0, Box::new(counter), false);
        handle.add(100);
        core.take_delta();
        core.counter.reset();
        handle.add(7);
        assert_eq!(core.take_delta(), 7);
    }

    #[test]
    fn test_adopt_period_tracks_lag() {
        let (counter, _handle) = ManualCounter::new();
        let mut core = CoreAccountant::new(2, 0, Box::new(counter), true);
        assert_eq!(core.adopt_period(1), 1);
        assert_eq!(core.adopt_period(4), 3);
        assert_eq!(core.local_period(), 4);
        assert_eq!(core.metrics().lagged_ticks(), 1);
        assert!(core.samples_gpu());
    }
}
