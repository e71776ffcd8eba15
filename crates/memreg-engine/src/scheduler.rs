//! Per-core regulation state machine.
//!
//! Every timer expiry runs one tick on its core:
//! 1. Freeze the counter
//! 2. Commit or adopt the global period index
//! 3. Compute the next absolute deadline
//! 4. Resume the counter
//! 5. Dispatch on the phase of the period index
//!
//! The phase alternates between Aggregation (fold counter deltas into
//! cluster usage and throttle on overrun) and Regulation (lift throttling,
//! the leader resets usage). Regulation ticks happen when
//! `index % interval == 1 % interval`; the first committed index is 1, so
//! every core starts with a Regulation tick. Configuration validation
//! guarantees an interval of at least 2.

use crate::accountant::CoreAccountant;
use crate::clock::GlobalClock;
use crate::cluster::ClusterAccountant;
use crate::gpu_bridge::GpuBridgeHandle;
use crate::record::{RecordSink, TickRecord};
use crate::throttle::ThrottleBoard;
use crate::timer::TimerHandler;
use memreg_common::config::RegulatorConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, trace};

/// Behavior of a tick, derived from its period index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Sample usage deltas against the budget.
    Aggregation,
    /// Reset usage and lift throttling.
    Regulation,
}

impl Phase {
    /// Phase of period `index` given `interval` aggregation periods per regulation period.
    #[inline]
    #[must_use]
    pub fn of(index: u64, interval: u64) -> Self {
        let interval = interval.max(1);
        if index % interval == 1 % interval {
            Self::Regulation
        } else {
            Self::Aggregation
        }
    }
}

/// State shared by every handler and worker of a running engine.
pub struct RegulationContext {
    created: Instant,
    clock: GlobalClock,
    interval: u64,
    cache_line_size: u64,
    clusters: Vec<ClusterAccountant>,
    board: Arc<ThrottleBoard>,
    bridges: Vec<Option<Arc<GpuBridgeHandle>>>,
    sink: Option<Arc<dyn RecordSink>>,
    shutdown: AtomicBool,
}

impl std::fmt::Debug for RegulationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegulationContext")
            .field("clock", &self.clock)
            .field("interval", &self.interval)
            .field("clusters", &self.clusters)
            .field("shutdown", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl RegulationContext {
    /// Create a context whose period 0 expires at `start`.
    #[must_use]
    pub fn new(
        config: &RegulatorConfig,
        clusters: Vec<ClusterAccountant>,
        board: Arc<ThrottleBoard>,
        start: Instant,
    ) -> Self {
        let bridges = clusters.iter().map(|_| None).collect();
        Self {
            created: Instant::now(),
            clock: GlobalClock::new(start, config.aggregation_period),
            interval: config.regulation_interval(),
            cache_line_size: config.cache_line_size,
            clusters,
            board,
            bridges,
            sink: None,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Attach a record sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Attach the GPU bridge of cluster `cluster_index`.
    #[must_use]
    pub fn with_bridge(mut self, cluster_index: usize, handle: Arc<GpuBridgeHandle>) -> Self {
        if let Some(slot) = self.bridges.get_mut(cluster_index) {
            *slot = Some(handle);
        }
        self
    }

    /// Global period clock.
    #[must_use]
    pub fn clock(&self) -> &GlobalClock {
        &self.clock
    }

    /// When the context was created, before any timer was armed.
    #[must_use]
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Aggregation periods per regulation period.
    #[must_use]
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Bytes per bus event.
    #[must_use]
    pub fn cache_line_size(&self) -> u64 {
        self.cache_line_size
    }

    /// All clusters in arena order.
    #[must_use]
    pub fn clusters(&self) -> &[ClusterAccountant] {
        &self.clusters
    }

    /// Cluster at arena index `index`.
    #[inline]
    #[must_use]
    pub fn cluster(&self, index: usize) -> Option<&ClusterAccountant> {
        self.clusters.get(index)
    }

    /// Throttle arena.
    #[must_use]
    pub fn board(&self) -> &ThrottleBoard {
        &self.board
    }

    /// GPU bridge of cluster `index`, if one is attached.
    #[must_use]
    pub fn bridge(&self, index: usize) -> Option<&Arc<GpuBridgeHandle>> {
        self.bridges.get(index).and_then(Option::as_ref)
    }

    /// Record sink, if logging is enabled.
    #[must_use]
    pub fn sink(&self) -> Option<&dyn RecordSink> {
        self.sink.as_deref()
    }

    /// Set the shutdown flag. Handlers observing it return without effect.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Returns true once shutdown began.
    #[inline]
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Shutdown flag was set; nothing happened.
    Skipped,
    /// Regulation tick.
    Regulated {
        /// Committed period index.
        index: u64,
        /// Whether this core released its own throttle.
        released: bool,
        /// Whether this core, as leader, reset cluster usage.
        reset: bool,
    },
    /// Aggregation tick.
    Aggregated {
        /// Committed period index.
        index: u64,
        /// Events this core added.
        delta: u64,
        /// Cluster usage after the addition.
        usage: u64,
        /// Cores newly throttled by this tick.
        newly_throttled: usize,
    },
}

/// Timer handler driving one core.
#[derive(Debug)]
pub struct CoreHandler {
    core: CoreAccountant,
    ctx: Arc<RegulationContext>,
}

impl CoreHandler {
    /// Bind `core` to the shared context.
    #[must_use]
    pub fn new(core: CoreAccountant, ctx: Arc<RegulationContext>) -> Self {
        Self { core, ctx }
    }

    /// Per-core accounting, including tick metrics.
    #[must_use]
    pub fn accountant(&self) -> &CoreAccountant {
        &self.core
    }

    /// Run one tick without any timing.
    pub fn tick(&mut self) -> TickOutcome {
        if self.ctx.is_shutting_down() {
            return TickOutcome::Skipped;
        }

        self.core.freeze();
        let index = self.ctx.clock.advance(self.core.local_period());
        self.core.adopt_period(index);
        self.core.thaw();

        match Phase::of(index, self.ctx.interval) {
            Phase::Regulation => self.regulate(index),
            Phase::Aggregation => self.aggregate(index),
        }
    }

    fn regulate(&mut self, index: u64) -> TickOutcome {
        let id = self.core.id();
        let Some(cluster) = self.ctx.cluster(self.core.cluster()) else {
            return TickOutcome::Skipped;
        };

        let released = self.ctx.board.release(id);
        cluster.clear_throttled();
        let reset = cluster.reset_period(id);

        if reset {
            trace!(
                core = id,
                cluster = cluster.id(),
                period = cluster.regulation_period_count(),
                "Regulation period reset"
            );
        }
        TickOutcome::Regulated {
            index,
            released,
            reset,
        }
    }

    fn aggregate(&mut self, index: u64) -> TickOutcome {
        let id = self.core.id();
        let Some(cluster) = self.ctx.cluster(self.core.cluster()) else {
            return TickOutcome::Skipped;
        };

        let delta = self.core.take_delta();
        let usage = cluster.add_usage(delta);

        if self.core.samples_gpu() {
            if let Some(bridge) = self.ctx.bridge(self.core.cluster()) {
                bridge.request();
            }
        }

        if let Some(sink) = self.ctx.sink() {
            sink.record_tick(TickRecord {
                core: id,
                regulation_period: cluster.regulation_period_count(),
                wall_clock: SystemTime::now(),
                delta_events: delta,
                throttled: cluster.is_throttled(),
            });
        }

        let mut newly_throttled = 0;
        if !self.ctx.board.is_throttled(id) && cluster.over_budget() {
            if cluster.is_leader(id) {
                cluster.set_throttled();
            }
            newly_throttled = self.ctx.board.broadcast(cluster.members(), id);
            if newly_throttled > 0 {
                debug!(
                    core = id,
                    cluster = cluster.id(),
                    usage = cluster.usage(),
                    budget = cluster.budget_events(),
                    newly_throttled,
                    "Cluster over budget, throttling"
                );
            }
        }

        TickOutcome::Aggregated {
            index,
            delta,
            usage,
            newly_throttled,
        }
    }
}

impl TimerHandler for CoreHandler {
    fn armed(&mut self, at: Instant) {
        let id = self.core.id();
        let Some(cluster) = self.ctx.cluster(self.core.cluster()) else {
            return;
        };
        let armed_at_ns =
            u64::try_from(at.saturating_duration_since(self.ctx.created).as_nanos())
                .unwrap_or(0);
        if cluster.claim_leadership(id, armed_at_ns) {
            debug!(core = id, cluster = cluster.id(), "Elected cluster leader");
        }
    }

    fn fire(&mut self, _now: Instant) -> Option<Instant> {
        let started = Instant::now();
        if self.tick() == TickOutcome::Skipped {
            return None;
        }
        self.core.metrics_mut().record(started.elapsed());
        Some(self.ctx.clock.deadline(self.core.local_period()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{ManualCounter, ManualCounterHandle};
    use crate::record::MemoryRecordSink;
    use memreg_common::config::CoreId;
    use std::time::Duration;

    const INTERVAL_CONFIG_US: (u64, u64) = (1000, 100);

    struct Rig {
        ctx: Arc<RegulationContext>,
        handlers: Vec<CoreHandler>,
        feeds: Vec<ManualCounterHandle>,
    }

    fn rig(cores: &[CoreId], budget_events: u64, sink: Option<Arc<MemoryRecordSink>>) -> Rig {
        let config = RegulatorConfig {
            regulation_period: Duration::from_micros(INTERVAL_CONFIG_US.0),
            aggregation_period: Duration::from_micros(INTERVAL_CONFIG_US.1),
            ..Default::default()
        };
        let cluster = ClusterAccountant::new(1, cores, 1, config.regulation_period, 64);
        cluster.set_budget_events(budget_events);
        let (board, _parkers) = ThrottleBoard::new(cores);
        let mut ctx = RegulationContext::new(&config, vec![cluster], Arc::new(board), Instant::now());
        if let Some(sink) = sink {
            ctx = ctx.with_sink(sink);
        }
        let ctx = Arc::new(ctx);

        let mut handlers = Vec::new();
        let mut feeds = Vec::new();
        for &core in cores {
            let (counter, feed) = ManualCounter::new();
            let mut handler =
                CoreHandler::new(CoreAccountant::new(core, 0, Box::new(counter), false), Arc::clone(&ctx));
            handler.armed(Instant::now());
            handlers.push(handler);
            feeds.push(feed);
        }
        Rig { ctx, handlers, feeds }
    }

    impl Rig {
        fn round(&mut self) -> Vec<TickOutcome> {
            self.handlers.iter_mut().map(CoreHandler::tick).collect()
        }

        fn cluster(&self) -> &ClusterAccountant {
            self.ctx.cluster(0).unwrap()
        }
    }

    #[test]
    fn test_phase_selection() {
        assert_eq!(Phase::of(1, 10), Phase::Regulation);
        assert_eq!(Phase::of(11, 10), Phase::Regulation);
        assert_eq!(Phase::of(2, 10), Phase::Aggregation);
        assert_eq!(Phase::of(10, 10), Phase::Aggregation);
        assert_eq!(Phase::of(0, 10), Phase::Aggregation);
        assert_eq!(Phase::of(2, 2), Phase::Aggregation);
        assert_eq!(Phase::of(3, 2), Phase::Regulation);
    }

    #[test]
    fn test_first_tick_regulates() {
        let mut rig = rig(&[0, 1], 100, None);
        let outcomes = rig.round();
        assert!(matches!(outcomes[0], TickOutcome::Regulated { index: 1, reset: true, .. }));
        assert!(matches!(outcomes[1], TickOutcome::Regulated { index: 1, reset: false, .. }));
        assert_eq!(rig.cluster().regulation_period_count(), 1);
    }

    #[test]
    fn test_four_cores_exceed_budget_in_one_tick() {
        let mut rig = rig(&[0, 1, 2, 3], 100, None);
        rig.round();

        for feed in &rig.feeds {
            feed.add(30);
        }
        let outcomes = rig.round();

        assert_eq!(rig.cluster().usage(), 120);
        assert!(matches!(
            outcomes[3],
            TickOutcome::Aggregated { index: 2, usage: 120, newly_throttled: 4, .. }
        ));
        assert!((0..4).all(|c| rig.ctx.board().is_throttled(c)));
        // Only the leader (core 0) sets the cluster flag, and it ticked before the overrun.
        assert!(!rig.cluster().is_throttled());
    }

    #[test]
    fn test_leader_sets_cluster_flag() {
        let mut rig = rig(&[0, 1], 50, None);
        rig.round();
        rig.feeds[0].add(60);
        rig.round();
        assert!(rig.cluster().is_throttled());
        assert!(rig.ctx.board().is_throttled(0));
        assert!(rig.ctx.board().is_throttled(1));
    }

    #[test]
    fn test_throttled_core_skips_budget_check() {
        let mut rig = rig(&[0, 1], 50, None);
        rig.round();
        rig.feeds[1].add(60);
        rig.round();
        assert_eq!(rig.ctx.board().stats(0).unwrap().throttle_count, 1);

        rig.feeds[0].add(10);
        let outcomes = rig.round();
        assert!(matches!(
            outcomes[0],
            TickOutcome::Aggregated { delta: 10, newly_throttled: 0, .. }
        ));
        // Usage is still accounted while throttled.
        assert_eq!(rig.cluster().usage(), 70);
        assert_eq!(rig.ctx.board().stats(0).unwrap().throttle_count, 1);
    }

    #[test]
    fn test_regulation_unthrottles_regardless_of_usage() {
        let mut rig = rig(&[0, 1, 2, 3], 100, None);
        rig.round();
        for feed in &rig.feeds {
            feed.add(30);
        }
        rig.round();

        // Indices 3..=10 are aggregation ticks; every core stays throttled.
        for _ in 3..=10 {
            for feed in &rig.feeds {
                feed.add(1000);
            }
            rig.round();
            assert!((0..4).all(|c| rig.ctx.board().is_throttled(c)));
        }

        // Index 11 regulates: all throttles lift, the leader resets usage.
        let outcomes = rig.round();
        for outcome in &outcomes {
            assert!(matches!(outcome, TickOutcome::Regulated { index: 11, released: true, .. }));
        }
        assert!((0..4).all(|c| !rig.ctx.board().is_throttled(c)));
        assert_eq!(rig.cluster().usage(), 0);
        assert_eq!(rig.cluster().regulation_period_count(), 2);
        assert!(!rig.cluster().is_throttled());
    }

    #[test]
    fn test_only_leader_resets_usage() {
        let mut rig = rig(&[0, 1], 1_000_000, None);
        rig.round();
        rig.feeds[1].add(5);
        rig.round();

        // Drive only the non-leader through a regulation boundary.
        for _ in 0..20 {
            rig.handlers[1].tick();
        }
        assert_eq!(rig.cluster().usage(), 5);
        assert_eq!(rig.cluster().regulation_period_count(), 1);
    }

    #[test]
    fn test_lagging_core_adopts_current_index() {
        let mut rig = rig(&[0, 1], 1_000_000, None);
        rig.round();
        for _ in 0..3 {
            rig.handlers[0].tick();
        }
        let outcome = rig.handlers[1].tick();
        assert!(matches!(outcome, TickOutcome::Aggregated { index: 4, .. }));
        assert_eq!(rig.handlers[1].accountant().metrics().lagged_ticks(), 1);
    }

    #[test]
    fn test_shutdown_flag_skips_tick() {
        let mut rig = rig(&[0], 100, None);
        rig.ctx.begin_shutdown();
        assert_eq!(rig.handlers[0].tick(), TickOutcome::Skipped);
        assert_eq!(rig.ctx.clock().current(), 0);
        assert!(rig.handlers[0].fire(Instant::now()).is_none());
    }

    #[test]
    fn test_fire_returns_absolute_deadline() {
        let mut rig = rig(&[0], 100, None);
        let next = rig.handlers[0].fire(Instant::now()).unwrap();
        assert_eq!(next, rig.ctx.clock().deadline(1));
        assert_eq!(rig.handlers[0].accountant().metrics().total_ticks(), 1);
    }

    #[test]
    fn test_aggregation_emits_records() {
        let sink = Arc::new(MemoryRecordSink::new());
        let mut rig = rig(&[0, 1], 1_000_000, Some(Arc::clone(&sink)));
        rig.round();
        rig.feeds[0].add(42);
        rig.round();

        let ticks = sink.ticks();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].core, 0);
        assert_eq!(ticks[0].delta_events, 42);
        assert_eq!(ticks[0].regulation_period, 1);
        assert!(!ticks[0].throttled);
    }

    #[test]
    fn test_first_armed_core_leads() {
        let rig = rig(&[2, 3], 100, None);
        assert_eq!(rig.cluster().leader(), Some(2));
    }
}
