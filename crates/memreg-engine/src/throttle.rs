//! Core throttling.
//!
//! Each regulated core has a [`ThrottleLine`] in the [`ThrottleBoard`] arena
//! and a resident [`ThrottleWorker`]. Setting the line's marker wakes the
//! worker, which then busy-polls until the marker is cleared. Sleeping would
//! hand the core back to ordinary work, so the worker never yields while
//! throttled; with real-time scheduling enabled it runs above every regular
//! task on its core.
//!
//! # Threading Model
//!
//! - **Timer handlers / GPU bridge**: call [`ThrottleBoard::broadcast`] and
//!   [`ThrottleBoard::release`]
//! - **Throttle worker**: parks on its own line, spins while throttled
//!
//! A core marked offline loses enforcement: its worker exits even if the
//! marker is still set.

use crate::realtime::{apply_placement, ThreadPlacement};
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::{Backoff, CachePadded};
use memreg_common::config::CoreId;
use memreg_common::error::{RegError, RegResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Throttle marker and statistics of one core.
#[derive(Debug)]
pub struct ThrottleLine {
    core: CoreId,
    throttled: AtomicBool,
    offline: AtomicBool,
    throttle_count: AtomicU64,
    throttled_since_ns: AtomicU64,
    throttled_total_ns: AtomicU64,
    unparker: Unparker,
}

impl ThrottleLine {
    fn new(core: CoreId, unparker: Unparker) -> Self {
        Self {
            core,
            throttled: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            throttle_count: AtomicU64::new(0),
            throttled_since_ns: AtomicU64::new(0),
            throttled_total_ns: AtomicU64::new(0),
            unparker,
        }
    }

    /// Core this line belongs to.
    #[must_use]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Throttle marker.
    #[inline]
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.throttled.load(Ordering::Acquire)
    }

    /// Offline flag.
    #[inline]
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::Acquire)
    }
}

/// Serializable per-core throttle statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ThrottleStats {
    /// Core identifier.
    pub core: CoreId,
    /// Marker state at snapshot time.
    pub throttled: bool,
    /// Unthrottled to throttled transitions.
    pub throttle_count: u64,
    /// Time spent throttled in completed throttle episodes.
    #[serde(with = "duration_ns")]
    pub throttled_total: Duration,
    /// Whether the core was marked offline.
    pub offline: bool,
}

/// Core-indexed arena of throttle lines.
#[derive(Debug)]
pub struct ThrottleBoard {
    lines: Vec<Option<CachePadded<ThrottleLine>>>,
    epoch: Instant,
    stopping: AtomicBool,
}

impl ThrottleBoard {
    /// Create lines for `cores`, returning the parker each worker will own.
    #[must_use]
    pub fn new(cores: &[CoreId]) -> (Self, Vec<(CoreId, Parker)>) {
        let len = cores.iter().max().map_or(0, |&c| c + 1);
        let mut lines: Vec<Option<CachePadded<ThrottleLine>>> = (0..len).map(|_| None).collect();
        let mut parkers = Vec::with_capacity(cores.len());

        for &core in cores {
            let parker = Parker::new();
            lines[core] = Some(CachePadded::new(ThrottleLine::new(core, parker.unparker().clone())));
            parkers.push((core, parker));
        }

        (
            Self {
                lines,
                epoch: Instant::now(),
                stopping: AtomicBool::new(false),
            },
            parkers,
        )
    }

    /// Line of `core`, if it is regulated.
    #[inline]
    #[must_use]
    pub fn line(&self, core: CoreId) -> Option<&ThrottleLine> {
        self.lines.get(core).and_then(|l| l.as_deref())
    }

    /// Regulated cores in ascending order.
    pub fn cores(&self) -> impl Iterator<Item = CoreId> + '_ {
        self.lines.iter().flatten().map(|l| l.core)
    }

    fn elapsed_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    /// Set `core`'s marker and wake its worker.
    ///
    /// Returns true on an unthrottled to throttled transition. Throttling an
    /// already throttled core changes nothing.
    pub fn throttle(&self, core: CoreId) -> bool {
        let Some(line) = self.line(core) else {
            return false;
        };
        if line.throttled.swap(true, Ordering::AcqRel) {
            return false;
        }
        line.throttled_since_ns.store(self.elapsed_ns(), Ordering::Release);
        line.throttle_count.fetch_add(1, Ordering::Relaxed);
        line.unparker.unpark();
        true
    }

    /// Clear `core`'s marker. Returns true if it was set.
    pub fn release(&self, core: CoreId) -> bool {
        let Some(line) = self.line(core) else {
            return false;
        };
        if !line.throttled.swap(false, Ordering::AcqRel) {
            return false;
        }
        let since = line.throttled_since_ns.load(Ordering::Acquire);
        line.throttled_total_ns
            .fetch_add(self.elapsed_ns().saturating_sub(since), Ordering::Relaxed);
        true
    }

    /// Returns true if `core`'s marker is set.
    #[inline]
    #[must_use]
    pub fn is_throttled(&self, core: CoreId) -> bool {
        self.line(core).is_some_and(ThrottleLine::is_throttled)
    }

    /// Throttle every core in `members`.
    ///
    /// Remote cores are signalled first and `origin` last, so the caller's
    /// own worker cannot preempt it before the other cores are marked.
    /// Returns the number of newly throttled cores.
    pub fn broadcast<I>(&self, members: I, origin: CoreId) -> usize
    where
        I: IntoIterator<Item = CoreId>,
    {
        let mut includes_origin = false;
        let mut newly = 0;
        for core in members {
            if core == origin {
                includes_origin = true;
            } else if self.throttle(core) {
                newly += 1;
            }
        }
        if includes_origin && self.throttle(origin) {
            newly += 1;
        }
        newly
    }

    /// Clear every marker.
    pub fn release_all(&self) {
        for core in self.cores().collect::<Vec<_>>() {
            self.release(core);
        }
    }

    /// Mark `core` offline; its worker exits without further enforcement.
    pub fn mark_offline(&self, core: CoreId) -> bool {
        let Some(line) = self.line(core) else {
            return false;
        };
        line.offline.store(true, Ordering::Release);
        line.unparker.unpark();
        true
    }

    /// Ask every worker to exit and wake them.
    pub fn stop_workers(&self) {
        self.stopping.store(true, Ordering::Release);
        for line in self.lines.iter().flatten() {
            line.unparker.unpark();
        }
    }

    /// Returns true once [`stop_workers`](Self::stop_workers) was called.
    #[inline]
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Statistics of `core`.
    #[must_use]
    pub fn stats(&self, core: CoreId) -> Option<ThrottleStats> {
        self.line(core).map(|line| ThrottleStats {
            core,
            throttled: line.is_throttled(),
            throttle_count: line.throttle_count.load(Ordering::Relaxed),
            throttled_total: Duration::from_nanos(line.throttled_total_ns.load(Ordering::Relaxed)),
            offline: line.is_offline(),
        })
    }
}

/// Resident worker that occupies its core while throttled.
#[derive(Debug)]
pub struct ThrottleWorker {
    core: CoreId,
    handle: Option<JoinHandle<()>>,
}

impl ThrottleWorker {
    /// Spawn the worker for `core`.
    ///
    /// # Errors
    ///
    /// Returns [`RegError::Resource`] if the thread cannot be spawned.
    pub fn spawn(
        board: Arc<ThrottleBoard>,
        core: CoreId,
        parker: Parker,
        placement: Option<ThreadPlacement>,
    ) -> RegResult<Self> {
        let handle = thread::Builder::new()
            .name(format!("memreg-throttle-{core}"))
            .spawn(move || {
                if let Some(placement) = placement {
                    if let Err(e) = apply_placement(&placement) {
                        warn!(core, error = %e, "Throttle worker placement failed");
                    }
                }
                run_worker(&board, core, &parker);
            })
            .map_err(|e| RegError::Resource(format!("failed to spawn throttle worker {core}: {e}")))?;

        Ok(Self {
            core,
            handle: Some(handle),
        })
    }

    /// Core this worker occupies.
    #[must_use]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Wait for the worker to exit. The board must already be stopping.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.join() {
                warn!(core = self.core, "Throttle worker panicked: {:?}", e);
            }
        }
    }
}

fn run_worker(board: &ThrottleBoard, core: CoreId, parker: &Parker) {
    let Some(line) = board.line(core) else {
        return;
    };
    debug!(core, "Throttle worker started");

    loop {
        if board.is_stopping() || line.is_offline() {
            break;
        }
        if !line.is_throttled() {
            parker.park();
            continue;
        }

        trace!(core, "Throttle engaged");
        let backoff = Backoff::new();
        while line.is_throttled() && !board.is_stopping() && !line.is_offline() {
            backoff.spin();
        }
        trace!(core, "Throttle lifted");
    }

    if line.is_offline() && line.is_throttled() {
        warn!(core, "Core went offline while throttled, enforcement dropped");
    }
    debug!(core, "Throttle worker exited");
}

mod duration_ns {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board(cores: &[CoreId]) -> ThrottleBoard {
        ThrottleBoard::new(cores).0
    }

    #[test]
    fn test_throttle_is_idempotent() {
        let b = board(&[0, 1]);
        assert!(b.throttle(0));
        assert!(!b.throttle(0));
        assert_eq!(b.stats(0).unwrap().throttle_count, 1);
        assert!(b.is_throttled(0));
        assert!(!b.is_throttled(1));
    }

    #[test]
    fn test_release_is_idempotent() {
        let b = board(&[0]);
        assert!(!b.release(0));
        b.throttle(0);
        assert!(b.release(0));
        assert!(!b.release(0));
        assert_eq!(b.stats(0).unwrap().throttle_count, 1);
    }

    #[test]
    fn test_broadcast_counts_new_throttles() {
        let b = board(&[4, 5, 6, 7]);
        b.throttle(6);
        assert_eq!(b.broadcast([4, 5, 6, 7], 5), 3);
        assert!(b.cores().all(|c| b.is_throttled(c)));
        assert_eq!(b.broadcast([4, 5, 6, 7], 5), 0);
    }

    #[test]
    fn test_unknown_core_is_ignored() {
        let b = board(&[2]);
        assert!(!b.throttle(0));
        assert!(!b.throttle(9));
        assert!(b.stats(0).is_none());
        assert_eq!(b.cores().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_worker_spins_until_released() {
        let (b, mut parkers) = ThrottleBoard::new(&[0]);
        let b = Arc::new(b);
        let (core, parker) = parkers.remove(0);
        let mut worker = ThrottleWorker::spawn(Arc::clone(&b), core, parker, None).unwrap();

        b.throttle(0);
        std::thread::sleep(Duration::from_millis(20));
        b.release(0);
        assert!(b.stats(0).unwrap().throttled_total >= Duration::from_millis(10));

        b.stop_workers();
        worker.join();
    }

    #[test]
    fn test_worker_exits_on_offline_while_throttled() {
        let (b, mut parkers) = ThrottleBoard::new(&[3]);
        let b = Arc::new(b);
        let (core, parker) = parkers.remove(0);
        let mut worker = ThrottleWorker::spawn(Arc::clone(&b), core, parker, None).unwrap();

        b.throttle(3);
        assert!(b.mark_offline(3));
        // Joins without the marker ever being cleared.
        worker.join();
        assert!(b.stats(3).unwrap().offline);
        assert!(b.is_throttled(3));
    }

    #[test]
    fn test_stop_wakes_parked_workers() {
        let (b, parkers) = ThrottleBoard::new(&[0, 1, 2]);
        let b = Arc::new(b);
        let mut workers: Vec<_> = parkers
            .into_iter()
            .map(|(core, parker)| ThrottleWorker::spawn(Arc::clone(&b), core, parker, None).unwrap())
            .collect();

        b.stop_workers();
        for w in &mut workers {
            w.join();
        }
        assert!(b.is_stopping());
    }
}
