//! Lock-free global period clock.
//!
//! Every core's timer fires independently. On each expiry the handler tries
//! to move the shared period counter from the last value it observed to the
//! next one with a single compare-and-swap. Whether that succeeds or another
//! core got there first, the handler adopts whatever value is current, so the
//! counter is monotone and advances at most once per period no matter how
//! many cores race it.
//!
//! Deadlines are absolute (`start + index * period`); re-arming relative to
//! the current time would accumulate drift.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared aggregation period counter.
#[derive(Debug)]
pub struct GlobalClock {
    start: Instant,
    period: Duration,
    counter: AtomicU64,
}

impl GlobalClock {
    /// Create a clock whose period 0 begins at `start`.
    #[must_use]
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period,
            counter: AtomicU64::new(0),
        }
    }

    /// Start of period 0.
    #[must_use]
    pub fn start(&self) -> Instant {
        self.start
    }

    /// Aggregation period length.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Current committed period index.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Try to commit `observed + 1`, then return the index now in effect.
    ///
    /// `observed` is the index the calling core saw on its previous tick.
    /// The result is never smaller than `observed`.
    pub fn advance(&self, observed: u64) -> u64 {
        // Losing the race is fine: the winner committed the same step.
        let _ = self.counter.compare_exchange(
            observed,
            observed.wrapping_add(1),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.counter.load(Ordering::Acquire)
    }

    /// Absolute expiry time of period `index`.
    #[must_use]
    pub fn deadline(&self, index: u64) -> Instant {
        let offset_ns = self.period.as_nanos().saturating_mul(u128::from(index));
        let offset = Duration::from_nanos(u64::try_from(offset_ns).unwrap_or(u64::MAX));
        self.start + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_single_core_advance() {
        let clock = GlobalClock::new(Instant::now(), Duration::from_micros(100));
        assert_eq!(clock.advance(0), 1);
        assert_eq!(clock.advance(1), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn test_stale_observer_adopts_current() {
        let clock = GlobalClock::new(Instant::now(), Duration::from_micros(100));
        clock.advance(0);
        clock.advance(1);
        clock.advance(2);
        // A lagging core that last saw period 1 does not move the counter.
        assert_eq!(clock.advance(1), 3);
        assert_eq!(clock.current(), 3);
    }

    #[test]
    fn test_absolute_deadlines() {
        let start = Instant::now();
        let clock = GlobalClock::new(start, Duration::from_micros(100));
        assert_eq!(clock.deadline(0), start);
        assert_eq!(clock.deadline(53), start + Duration::from_micros(5300));
    }

    #[test]
    fn test_concurrent_race_advances_once_per_round() {
        const CORES: usize = 8;
        const ROUNDS: u64 = 200;

        let clock = Arc::new(GlobalClock::new(Instant::now(), Duration::from_micros(100)));
        let barrier = Arc::new(Barrier::new(CORES));

        let handles: Vec<_> = (0..CORES)
            .map(|_| {
                let clock = Arc::clone(&clock);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let mut local = 0u64;
                    let mut seen = Vec::with_capacity(ROUNDS as usize);
                    for _ in 0..ROUNDS {
                        barrier.wait();
                        let index = clock.advance(local);
                        assert!(index >= local, "index went backwards");
                        local = index;
                        seen.push(index);
                        barrier.wait();
                    }
                    seen
                })
            })
            .collect();

        for handle in handles {
            let seen = handle.join().unwrap();
            // Every round committed exactly one step.
            assert_eq!(seen, (1..=ROUNDS).collect::<Vec<_>>());
        }
        assert_eq!(clock.current(), ROUNDS);
    }
}
