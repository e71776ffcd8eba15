//! Engine lifecycle.
//!
//! [`Regulator`] owns every resource of a running engine and tears them down
//! in dependency order. Startup acquires, in order:
//! 1. Process-wide real-time setup
//! 2. One bandwidth counter per configured core (unavailable cores are excluded)
//! 3. The throttle board and one throttle worker per regulated core
//! 4. GPU profiler channels (a missing profiler is not fatal)
//! 5. The record sink, if logging is enabled
//! 6. GPU bridge workers
//! 7. One pinned timer per regulated core
//!
//! A fatal failure in steps 2, 3, 4, 6 or 7 rolls back everything acquired
//! so far. GPU channels opened but not yet handed to a bridge are terminated.

use crate::accountant::CoreAccountant;
use crate::cluster::{ClusterAccountant, ClusterSnapshot};
use crate::counter::{BandwidthCounter, Platform};
use crate::gpu_bridge::{GpuBridge, GpuBridgeHandle, GpuBridgeStats, GpuSampleReceiver};
use crate::realtime::{self, ThreadPlacement};
use crate::record::{CsvRecordWriter, RecordSink};
use crate::scheduler::{CoreHandler, RegulationContext};
use crate::throttle::{ThrottleBoard, ThrottleStats, ThrottleWorker};
use crate::timer::PinnedTimer;
use memreg_common::config::{ClusterId, CoreId, RegulatorConfig};
use memreg_common::error::{RegError, RegResult};
use memreg_common::metrics::TickSnapshot;
use memreg_common::state::{EngineState, StateMachine};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Status of one regulated core.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    /// Owning cluster.
    pub cluster: ClusterId,
    /// Timer arm time in nanoseconds after engine start.
    pub armed_at_ns: Option<u64>,
    /// Throttle statistics.
    pub throttle: ThrottleStats,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct RegulatorStatus {
    /// Lifecycle state.
    pub state: EngineState,
    /// Lifecycle transitions since construction.
    pub state_transitions: u64,
    /// Regulation period in microseconds.
    pub regulation_period_us: u64,
    /// Aggregation period in microseconds.
    pub aggregation_period_us: u64,
    /// Aggregation periods per regulation period.
    pub regulation_interval: u64,
    /// Bytes per bus event.
    pub cache_line_size: u64,
    /// Whether per-tick records are written.
    pub logging_enabled: bool,
    /// Current global period index.
    pub period_index: u64,
    /// Cluster accounting.
    pub clusters: Vec<ClusterSnapshot>,
    /// Regulated cores.
    pub cores: Vec<CoreStatus>,
    /// GPU bridges.
    pub gpu: Vec<GpuBridgeStats>,
    /// Cores excluded at startup.
    pub excluded_cores: Vec<CoreId>,
}

/// Tick statistics of one core, collected at stop.
#[derive(Debug, Clone, Serialize)]
pub struct CoreReport {
    /// Core identifier.
    pub core: CoreId,
    /// Handler timing and lag.
    pub ticks: TickSnapshot,
    /// Throttle statistics.
    pub throttle: ThrottleStats,
}

/// Final statistics returned by [`Regulator::stop`].
#[derive(Debug, Clone, Serialize)]
pub struct RegulatorReport {
    /// Time between start and stop.
    #[serde(with = "duration_ms")]
    pub uptime: Duration,
    /// Last committed period index.
    pub period_index: u64,
    /// Per-core statistics.
    pub cores: Vec<CoreReport>,
    /// Cluster state at stop.
    pub clusters: Vec<ClusterSnapshot>,
    /// GPU bridges.
    pub gpu: Vec<GpuBridgeStats>,
    /// Records written by the CSV sink.
    pub records_written: Option<u64>,
    /// Records dropped by the CSV sink.
    pub records_dropped: Option<u64>,
}

struct Engine {
    started_at: Instant,
    ctx: Option<Arc<RegulationContext>>,
    board: Option<Arc<ThrottleBoard>>,
    workers: Vec<ThrottleWorker>,
    bridges: Vec<GpuBridge>,
    timers: Vec<PinnedTimer<CoreHandler>>,
    sink: Option<Arc<dyn RecordSink>>,
    csv: Option<Arc<CsvRecordWriter>>,
}

impl Engine {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            ctx: None,
            board: None,
            workers: Vec::new(),
            bridges: Vec::new(),
            timers: Vec::new(),
            sink: None,
            csv: None,
        }
    }

    /// Release everything in dependency order. Safe on a partial engine.
    fn teardown(&mut self) -> Vec<CoreReport> {
        if let Some(ctx) = &self.ctx {
            ctx.begin_shutdown();
        }

        let mut ticks = Vec::with_capacity(self.timers.len());
        for mut timer in self.timers.drain(..) {
            let core = timer.core();
            if let Some(handler) = timer.cancel() {
                ticks.push((core, handler.accountant().metrics().snapshot()));
            }
        }

        let mut reports = Vec::with_capacity(ticks.len());
        if let Some(board) = &self.board {
            board.release_all();
            board.stop_workers();
            for worker in &mut self.workers {
                worker.join();
            }
            for (core, ticks) in ticks {
                if let Some(throttle) = board.stats(core) {
                    reports.push(CoreReport {
                        core,
                        ticks,
                        throttle,
                    });
                }
            }
        }
        self.workers.clear();

        for bridge in &mut self.bridges {
            bridge.shutdown();
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.close() {
                warn!(error = %e, "Record sink close failed");
            }
        }
        reports
    }
}

/// The memory-bandwidth regulation engine.
pub struct Regulator {
    config: RegulatorConfig,
    platform: Arc<dyn Platform>,
    record_sink: Option<Arc<dyn RecordSink>>,
    state: StateMachine,
    engine: Option<Engine>,
    excluded: Vec<CoreId>,
}

impl std::fmt::Debug for Regulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Regulator")
            .field("state", &self.state.state())
            .field("excluded", &self.excluded)
            .finish_non_exhaustive()
    }
}

impl Regulator {
    /// Create a regulator for `config`.
    ///
    /// # Errors
    ///
    /// [`RegError::Config`] if the configuration is invalid.
    pub fn new(config: RegulatorConfig, platform: Arc<dyn Platform>) -> RegResult<Self> {
        config
            .validate()
            .map_err(|e| RegError::Config(e.to_string()))?;
        Ok(Self {
            config,
            platform,
            record_sink: None,
            state: StateMachine::new(),
            engine: None,
            excluded: Vec::new(),
        })
    }

    /// Send per-tick records to `sink` instead of the configured CSV files.
    #[must_use]
    pub fn with_record_sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.record_sink = Some(sink);
        self
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &RegulatorConfig {
        &self.config
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state.state()
    }

    /// Cores excluded at the last startup.
    #[must_use]
    pub fn excluded_cores(&self) -> &[CoreId] {
        &self.excluded
    }

    /// Shared regulation state while running.
    #[must_use]
    pub fn context(&self) -> Option<&Arc<RegulationContext>> {
        self.engine.as_ref().and_then(|e| e.ctx.as_ref())
    }

    /// Acquire every resource and arm the timers.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error; all resources acquired before it are
    /// released and the state becomes [`EngineState::Failed`].
    pub fn start(&mut self) -> RegResult<()> {
        self.state.transition(EngineState::Starting)?;
        info!(
            regulation_period = ?self.config.regulation_period,
            aggregation_period = ?self.config.aggregation_period,
            clusters = self.config.clusters.len(),
            "Starting regulator"
        );

        let mut engine = Engine::new();
        match self.launch(&mut engine) {
            Ok(()) => {
                self.engine = Some(engine);
                self.state.transition(EngineState::Running)?;
                info!(excluded = ?self.excluded, "Regulator running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Regulator startup failed, rolling back");
                engine.teardown();
                self.state.transition(EngineState::Failed)?;
                Err(e)
            }
        }
    }

    fn launch(&mut self, engine: &mut Engine) -> RegResult<()> {
        let config = &self.config;
        realtime::init_process(&config.realtime)?;

        // Counters; unavailable cores drop out of their cluster.
        self.excluded.clear();
        let mut counters: Vec<(CoreId, usize, Box<dyn BandwidthCounter>)> = Vec::new();
        let mut members: Vec<Vec<CoreId>> = Vec::with_capacity(config.clusters.len());
        for (index, cluster) in config.clusters.iter().enumerate() {
            let mut included = Vec::with_capacity(cluster.cores.len());
            for &core in &cluster.cores {
                match self.platform.open_counter(core) {
                    Ok(counter) => {
                        included.push(core);
                        counters.push((core, index, counter));
                    }
                    Err(e) if !e.is_fatal_at_startup() => {
                        warn!(core, cluster = cluster.id, error = %e, "Core excluded from regulation");
                        self.excluded.push(core);
                    }
                    Err(e) => return Err(e),
                }
            }
            if included.is_empty() {
                warn!(cluster = cluster.id, "No regulated core left in cluster");
            }
            members.push(included);
        }
        if counters.is_empty() {
            return Err(RegError::Resource("no core could be regulated".into()));
        }
        counters.sort_by_key(|(core, _, _)| *core);
        let cores: Vec<CoreId> = counters.iter().map(|(core, _, _)| *core).collect();

        // Throttle workers.
        let (board, parkers) = ThrottleBoard::new(&cores);
        let board = Arc::new(board);
        engine.board = Some(Arc::clone(&board));
        for (core, parker) in parkers {
            let placement = ThreadPlacement::for_config(
                &config.realtime,
                core,
                config.realtime.throttle_priority,
            );
            engine
                .workers
                .push(ThrottleWorker::spawn(Arc::clone(&board), core, parker, placement)?);
        }

        // GPU channels for clusters whose sampling core survived.
        let mut channels: Vec<(usize, Arc<GpuBridgeHandle>, Box<dyn GpuSampleReceiver>)> =
            Vec::new();
        for (index, cluster) in config.clusters.iter().enumerate() {
            if !cluster.gpu.enabled {
                continue;
            }
            let sampling_core = cluster.gpu.sampling_core;
            if !members[index].contains(&sampling_core) {
                warn!(
                    cluster = cluster.id,
                    core = sampling_core,
                    "GPU sampling core excluded, GPU accounting disabled"
                );
                continue;
            }
            match self.platform.open_gpu_channel(cluster.id) {
                Ok(channel) => {
                    let handle = Arc::new(GpuBridgeHandle::new(
                        cluster.id,
                        sampling_core,
                        channel.requester,
                    ));
                    channels.push((index, handle, channel.receiver));
                }
                Err(RegError::ChannelClosed) => {
                    info!(cluster = cluster.id, "No GPU profiler reachable, CPU-only regulation");
                }
                Err(e) if !e.is_fatal_at_startup() => {
                    warn!(cluster = cluster.id, error = %e, "GPU profiler channel failed, CPU-only regulation");
                }
                Err(e) => {
                    terminate_channels(channels);
                    return Err(e);
                }
            }
        }

        // Record sink.
        let sink: Option<Arc<dyn RecordSink>> = match &self.record_sink {
            Some(sink) => Some(Arc::clone(sink)),
            None if config.logging.enabled => {
                let gpu_clusters: Vec<ClusterId> =
                    channels.iter().map(|(_, handle, _)| handle.cluster()).collect();
                match CsvRecordWriter::create(&config.logging.directory, &cores, &gpu_clusters) {
                    Ok(writer) => {
                        let writer = Arc::new(writer);
                        engine.csv = Some(Arc::clone(&writer));
                        Some(writer as Arc<dyn RecordSink>)
                    }
                    Err(e) => {
                        warn!(error = %e, "Record files unavailable, continuing without records");
                        None
                    }
                }
            }
            None => None,
        };
        engine.sink = sink.clone();

        // Shared context; period 0 expires after the start delay.
        let clusters: Vec<ClusterAccountant> = config
            .clusters
            .iter()
            .zip(&members)
            .map(|(cluster, included)| {
                ClusterAccountant::new(
                    cluster.id,
                    included,
                    cluster.budget_mb,
                    config.regulation_period,
                    config.cache_line_size,
                )
            })
            .collect();
        let start = Instant::now() + config.start_delay;
        let mut ctx = RegulationContext::new(config, clusters, Arc::clone(&board), start);
        if let Some(sink) = sink {
            ctx = ctx.with_sink(sink);
        }
        for (index, handle, _) in &channels {
            ctx = ctx.with_bridge(*index, Arc::clone(handle));
        }
        let ctx = Arc::new(ctx);
        engine.ctx = Some(Arc::clone(&ctx));

        // Bridge workers.
        let mut pending = channels.into_iter();
        while let Some((index, handle, receiver)) = pending.next() {
            let placement = ThreadPlacement::for_config(
                &config.realtime,
                handle.sampling_core(),
                config.realtime.bridge_priority,
            );
            match GpuBridge::spawn(
                Arc::clone(&ctx),
                index,
                Arc::clone(&handle),
                receiver,
                placement,
            ) {
                Ok(bridge) => engine.bridges.push(bridge),
                Err(e) => {
                    handle.terminate();
                    terminate_channels(pending);
                    return Err(e);
                }
            }
        }

        // Timers, armed in ascending core order.
        let first_deadline = ctx.clock().deadline(0);
        for (core, cluster_index, counter) in counters {
            let samples_gpu = ctx
                .bridge(cluster_index)
                .is_some_and(|bridge| bridge.sampling_core() == core);
            let accountant = CoreAccountant::new(core, cluster_index, counter, samples_gpu);
            let handler = CoreHandler::new(accountant, Arc::clone(&ctx));
            let placement =
                ThreadPlacement::for_config(&config.realtime, core, config.realtime.timer_priority);
            engine
                .timers
                .push(PinnedTimer::arm(core, first_deadline, handler, placement)?);
        }

        for cluster in ctx.clusters() {
            debug!(
                cluster = cluster.id(),
                leader = ?cluster.leader(),
                budget = cluster.budget_events(),
                "Cluster armed"
            );
        }
        engine.started_at = Instant::now();
        Ok(())
    }

    /// Stop regulation and release every resource.
    ///
    /// Order: shutdown flag, timers (synchronously), throttle release,
    /// throttle workers, GPU bridges, record sink.
    ///
    /// # Errors
    ///
    /// [`RegError::InvalidStateTransition`] if the engine is not running.
    pub fn stop(&mut self) -> RegResult<RegulatorReport> {
        self.state.transition(EngineState::Stopping)?;
        info!("Stopping regulator");

        let mut report = RegulatorReport {
            uptime: Duration::ZERO,
            period_index: 0,
            cores: Vec::new(),
            clusters: Vec::new(),
            gpu: Vec::new(),
            records_written: None,
            records_dropped: None,
        };

        if let Some(mut engine) = self.engine.take() {
            report.uptime = engine.started_at.elapsed();
            report.cores = engine.teardown();
            if let Some(ctx) = &engine.ctx {
                report.period_index = ctx.clock().current();
                report.clusters = ctx.clusters().iter().map(ClusterAccountant::snapshot).collect();
            }
            report.gpu = engine.bridges.iter().map(|b| b.handle().stats()).collect();
            if let Some(csv) = &engine.csv {
                report.records_written = Some(csv.written());
                report.records_dropped = Some(csv.dropped());
            }
        }

        self.state.transition(EngineState::Stopped)?;
        info!(
            uptime = ?report.uptime,
            period_index = report.period_index,
            "Regulator stopped"
        );
        Ok(report)
    }

    /// Current engine status.
    #[must_use]
    pub fn status(&self) -> RegulatorStatus {
        let mut status = RegulatorStatus {
            state: self.state(),
            regulation_period_us: micros(self.config.regulation_period),
            aggregation_period_us: micros(self.config.aggregation_period),
            regulation_interval: self.config.regulation_interval(),
            cache_line_size: self.config.cache_line_size,
            state_transitions: self.state.transition_count(),
            logging_enabled: self.config.logging.enabled || self.record_sink.is_some(),
            period_index: 0,
            clusters: Vec::new(),
            cores: Vec::new(),
            gpu: Vec::new(),
            excluded_cores: self.excluded.clone(),
        };

        let Some(engine) = &self.engine else {
            return status;
        };
        // A failed record file leaves the engine running without a sink.
        status.logging_enabled = engine.sink.is_some();
        if let Some(ctx) = &engine.ctx {
            status.period_index = ctx.clock().current();
            status.clusters = ctx.clusters().iter().map(ClusterAccountant::snapshot).collect();
            for cluster in ctx.clusters() {
                for core in cluster.members() {
                    if let Some(throttle) = ctx.board().stats(core) {
                        status.cores.push(CoreStatus {
                            cluster: cluster.id(),
                            armed_at_ns: cluster.armed_at_ns(core),
                            throttle,
                        });
                    }
                }
            }
        }
        status.gpu = engine.bridges.iter().map(|b| b.handle().stats()).collect();
        status
    }

    /// Change the budget of `cluster` to `budget_mb` MB/s.
    ///
    /// Applies to the next budget comparison and to later restarts.
    ///
    /// # Errors
    ///
    /// [`RegError::Config`] for an unknown cluster or a zero budget.
    pub fn set_budget_mb(&mut self, cluster: ClusterId, budget_mb: u64) -> RegResult<()> {
        if budget_mb == 0 {
            return Err(RegError::Config("budget_mb must be positive".into()));
        }
        let Some(config) = self.config.clusters.iter_mut().find(|c| c.id == cluster) else {
            return Err(RegError::Config(format!("unknown cluster {cluster}")));
        };
        config.budget_mb = budget_mb;

        if let Some(accountant) = self
            .context()
            .and_then(|ctx| ctx.clusters().iter().find(|c| c.id() == cluster))
        {
            accountant.set_budget_mb(budget_mb);
            info!(
                cluster,
                budget_mb,
                budget = accountant.budget_events(),
                "Cluster budget updated"
            );
        }
        Ok(())
    }

    /// Stop requesting GPU samples for `cluster`. Returns false if it has no bridge.
    pub fn disable_gpu_profiler(&self, cluster: ClusterId) -> bool {
        let Some(engine) = &self.engine else {
            return false;
        };
        match engine.bridges.iter().find(|b| b.handle().cluster() == cluster) {
            Some(bridge) => {
                bridge.handle().disable_profiler();
                true
            }
            None => false,
        }
    }

    /// Signal that `core` went offline; its throttle worker exits.
    ///
    /// The core keeps ticking if its timer still fires; enforcement on it is
    /// no longer guaranteed.
    pub fn mark_core_offline(&self, core: CoreId) -> bool {
        let marked = self
            .context()
            .is_some_and(|ctx| ctx.board().mark_offline(core));
        if marked {
            warn!(core, "Core marked offline, throttling disabled for it");
        }
        marked
    }
}

impl Drop for Regulator {
    fn drop(&mut self) {
        if self.state().is_active() {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Regulator stop on drop failed");
            }
        }
    }
}

/// Release GPU channels that never got a bridge worker, so their profilers exit.
fn terminate_channels<R>(channels: impl IntoIterator<Item = (usize, Arc<GpuBridgeHandle>, R)>) {
    for (_, handle, _) in channels {
        handle.terminate();
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}
