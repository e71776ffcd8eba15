//! Per-core tick metrics.
//!
//! Provides a ring buffer-based histogram of timer handler execution times
//! plus a count of ticks that observed the period index jump by more than
//! one (the handler woke after a full period had already been committed by
//! other cores). No heap allocation after construction.

use std::time::Duration;

/// Tick handler metrics with ring buffer for latency tracking.
#[derive(Debug)]
pub struct TickMetrics {
    /// Ring buffer of handler durations in nanoseconds.
    samples: Box<[u64]>,
    /// Current write position in the ring buffer.
    write_pos: usize,
    /// Number of samples collected (saturates at buffer size).
    sample_count: usize,
    /// Total ticks handled.
    total_ticks: u64,
    /// Minimum observed handler time in nanoseconds.
    min_ns: u64,
    /// Maximum observed handler time in nanoseconds.
    max_ns: u64,
    /// Sum of all handler times for mean calculation.
    sum_ns: u64,
    /// Ticks whose committed index skipped at least one period.
    lagged_ticks: u64,
    /// Total period indices skipped across lagged ticks.
    skipped_periods: u64,
}

impl TickMetrics {
    /// Create a new metrics collector retaining `histogram_size` samples.
    #[must_use]
    pub fn new(histogram_size: usize) -> Self {
        let size = histogram_size.max(1);
        Self {
            samples: vec![0u64; size].into_boxed_slice(),
            write_pos: 0,
            sample_count: 0,
            total_ticks: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            sum_ns: 0,
            lagged_ticks: 0,
            skipped_periods: 0,
        }
    }

    /// Record one handler execution time.
    pub fn record(&mut self, duration: Duration) {
        let ns = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);

        self.samples[self.write_pos] = ns;
        self.write_pos = (self.write_pos + 1) % self.samples.len();
        self.sample_count = self.sample_count.saturating_add(1).min(self.samples.len());

        self.total_ticks += 1;
        self.min_ns = self.min_ns.min(ns);
        self.max_ns = self.max_ns.max(ns);
        self.sum_ns = self.sum_ns.wrapping_add(ns);
    }

    /// Record the index step observed by a handler.
    ///
    /// A step of 1 is the normal case; anything larger means this core
    /// missed `step - 1` periods.
    pub fn record_step(&mut self, step: u64) {
        if step > 1 {
            self.lagged_ticks += 1;
            self.skipped_periods += step - 1;
        }
    }

    /// Get total number of ticks handled.
    #[must_use]
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Get number of lagged ticks.
    #[must_use]
    pub fn lagged_ticks(&self) -> u64 {
        self.lagged_ticks
    }

    /// Get maximum observed handler time.
    #[must_use]
    pub fn max(&self) -> Option<Duration> {
        (self.total_ticks > 0).then(|| Duration::from_nanos(self.max_ns))
    }

    /// Get mean handler time.
    #[must_use]
    pub fn mean(&self) -> Option<Duration> {
        (self.total_ticks > 0).then(|| Duration::from_nanos(self.sum_ns / self.total_ticks))
    }

    /// Compute a percentile from the ring buffer.
    ///
    /// Returns `None` if no samples have been collected or if percentile is out of range.
    #[must_use]
    pub fn percentile(&self, percentile: f64) -> Option<Duration> {
        if self.sample_count == 0 || !(0.0..=100.0).contains(&percentile) {
            return None;
        }

        let mut sorted: Vec<u64> = self.samples[..self.sample_count].to_vec();
        sorted.sort_unstable();

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let idx = ((percentile / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        let idx = idx.min(sorted.len() - 1);

        Some(Duration::from_nanos(sorted[idx]))
    }

    /// Get a snapshot of current metrics.
    ///
    /// Sorts the retained samples, so take it off the tick path.
    #[must_use]
    pub fn snapshot(&self) -> TickSnapshot {
        let as_ns = |d: Duration| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        TickSnapshot {
            total_ticks: self.total_ticks,
            min_ns: (self.total_ticks > 0).then_some(self.min_ns),
            max_ns: self.max().map(as_ns),
            mean_ns: self.mean().map(as_ns),
            p50_ns: self.percentile(50.0).map(as_ns),
            p99_ns: self.percentile(99.0).map(as_ns),
            lagged_ticks: self.lagged_ticks,
            skipped_periods: self.skipped_periods,
        }
    }
}

/// Immutable snapshot of tick metrics for reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TickSnapshot {
    /// Total ticks handled.
    pub total_ticks: u64,
    /// Minimum handler time in nanoseconds.
    pub min_ns: Option<u64>,
    /// Maximum handler time in nanoseconds.
    pub max_ns: Option<u64>,
    /// Mean handler time in nanoseconds.
    pub mean_ns: Option<u64>,
    /// Median handler time over the retained samples, in nanoseconds.
    pub p50_ns: Option<u64>,
    /// 99th percentile handler time over the retained samples, in nanoseconds.
    pub p99_ns: Option<u64>,
    /// Ticks that skipped at least one period index.
    pub lagged_ticks: u64,
    /// Total skipped period indices.
    pub skipped_periods: u64,
}
