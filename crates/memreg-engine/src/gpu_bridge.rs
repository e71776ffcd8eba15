//! GPU bandwidth bridge.
//!
//! An external profiler samples GPU bus-beat counters whenever the cluster's
//! sampling core asks for it, and answers with a fixed 8-byte record
//! `{i32 read_beats, i32 write_beats}` (little-endian). Samples arrive at
//! their own cadence, so they are ingested by a dedicated worker rather than
//! by the timer handler. The worker folds each sample into cluster usage and
//! re-checks the budget on its own.
//!
//! A missing or dead profiler only disables GPU accounting for that cluster;
//! CPU regulation is never blocked on it.

use crate::realtime::{apply_placement, ThreadPlacement};
use crate::record::GpuRecord;
use crate::scheduler::RegulationContext;
use memreg_common::config::{ClusterId, CoreId};
use memreg_common::error::{RegError, RegResult};
use memreg_common::units;
use serde::Serialize;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

/// Size of one profiler record on the wire.
pub const GPU_RECORD_SIZE: usize = 8;

const_assert_eq!(GPU_RECORD_SIZE, 2 * std::mem::size_of::<i32>());

/// One GPU bus-beat sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuBeatSample {
    /// Read beats since the previous sample.
    pub read_beats: u32,
    /// Write beats since the previous sample.
    pub write_beats: u32,
    /// When the sample was received.
    pub timestamp: SystemTime,
}

impl GpuBeatSample {
    /// Sample received now.
    #[must_use]
    pub fn new(read_beats: u32, write_beats: u32) -> Self {
        Self {
            read_beats,
            write_beats,
            timestamp: SystemTime::now(),
        }
    }

    /// Decode a wire record. Negative beat counts are clamped to zero.
    #[must_use]
    pub fn decode(record: [u8; GPU_RECORD_SIZE]) -> Self {
        let [r0, r1, r2, r3, w0, w1, w2, w3] = record;
        let read = i32::from_le_bytes([r0, r1, r2, r3]);
        let write = i32::from_le_bytes([w0, w1, w2, w3]);
        if read < 0 || write < 0 {
            warn!(read, write, "Negative GPU beat count clamped to zero");
        }
        Self::new(
            u32::try_from(read).unwrap_or(0),
            u32::try_from(write).unwrap_or(0),
        )
    }

    /// Encode beat counts as a wire record.
    #[must_use]
    pub fn encode(read_beats: i32, write_beats: i32) -> [u8; GPU_RECORD_SIZE] {
        let mut record = [0u8; GPU_RECORD_SIZE];
        record[..4].copy_from_slice(&read_beats.to_le_bytes());
        record[4..].copy_from_slice(&write_beats.to_le_bytes());
        record
    }

    /// Bytes moved across the bus.
    #[must_use]
    pub fn bytes(&self) -> u64 {
        units::beats_to_bytes(self.read_beats, self.write_beats)
    }

    /// Bus events, rounding up to whole cache lines.
    #[must_use]
    pub fn events(&self, cache_line_size: u64) -> u64 {
        units::bytes_to_events(self.bytes(), cache_line_size)
    }
}

/// Receiving half of a GPU profiler channel.
pub trait GpuSampleReceiver: Send {
    /// Block until a sample is ready.
    ///
    /// # Errors
    ///
    /// [`RegError::ChannelClosed`] when the profiler is gone,
    /// [`RegError::Shutdown`] after [`GpuSampleRequester::terminate`].
    fn recv(&mut self) -> RegResult<GpuBeatSample>;

    /// Return a ready sample without blocking.
    ///
    /// # Errors
    ///
    /// Same as [`recv`](Self::recv).
    fn try_recv(&mut self) -> RegResult<Option<GpuBeatSample>>;
}

/// Requesting half of a GPU profiler channel.
///
/// `request` is called from timer handlers and must not block.
pub trait GpuSampleRequester: Send + Sync {
    /// Ask the profiler for a sample.
    ///
    /// # Errors
    ///
    /// [`RegError::ChannelClosed`] when the profiler is gone.
    fn request(&self) -> RegResult<()>;

    /// Mark the channel terminated and wake a blocked receiver once.
    fn terminate(&self);
}

/// Both halves of an opened profiler channel.
pub struct GpuChannel {
    /// Used by the sampling core and for termination.
    pub requester: Arc<dyn GpuSampleRequester>,
    /// Moved into the bridge worker.
    pub receiver: Box<dyn GpuSampleReceiver>,
}

impl std::fmt::Debug for GpuChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuChannel").finish_non_exhaustive()
    }
}

/// Serializable bridge statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GpuBridgeStats {
    /// Cluster served by the bridge.
    pub cluster: ClusterId,
    /// Core whose ticks request samples.
    pub sampling_core: CoreId,
    /// Whether sample requests are still sent.
    pub profiler_enabled: bool,
    /// Whether the profiler channel was lost.
    pub channel_closed: bool,
    /// Requests sent.
    pub requests: u64,
    /// Samples ingested.
    pub samples: u64,
    /// Events folded into cluster usage.
    pub events: u64,
}

/// Shared control of one cluster's bridge.
pub struct GpuBridgeHandle {
    cluster: ClusterId,
    sampling_core: CoreId,
    requester: Arc<dyn GpuSampleRequester>,
    profiler_enabled: AtomicBool,
    closed: AtomicBool,
    requests: AtomicU64,
    samples: AtomicU64,
    events: AtomicU64,
}

impl std::fmt::Debug for GpuBridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBridgeHandle")
            .field("cluster", &self.cluster)
            .field("sampling_core", &self.sampling_core)
            .field("profiler_enabled", &self.is_profiler_enabled())
            .finish_non_exhaustive()
    }
}

impl GpuBridgeHandle {
    /// Create the handle for `cluster`, sampled from `sampling_core`.
    #[must_use]
    pub fn new(
        cluster: ClusterId,
        sampling_core: CoreId,
        requester: Arc<dyn GpuSampleRequester>,
    ) -> Self {
        Self {
            cluster,
            sampling_core,
            requester,
            profiler_enabled: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            events: AtomicU64::new(0),
        }
    }

    /// Cluster served.
    #[must_use]
    pub fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Core whose ticks request samples.
    #[must_use]
    pub fn sampling_core(&self) -> CoreId {
        self.sampling_core
    }

    /// Ask the profiler for a sample, unless it was disabled or lost.
    pub fn request(&self) {
        if !self.is_profiler_enabled() || self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.requester.request() {
            Ok(()) => {
                self.requests.fetch_add(1, Ordering::Relaxed);
            }
            Err(RegError::ChannelClosed) => self.mark_closed(),
            Err(e) => trace!(cluster = self.cluster, error = %e, "GPU sample request failed"),
        }
    }

    /// Stop sending sample requests. Samples already requested are still ingested.
    pub fn disable_profiler(&self) {
        if self.profiler_enabled.swap(false, Ordering::AcqRel) {
            info!(cluster = self.cluster, "GPU profiler disabled");
        }
    }

    /// Terminate the channel. A receiver blocked on it wakes with [`RegError::Shutdown`].
    pub fn terminate(&self) {
        self.requester.terminate();
    }

    /// Whether sample requests are sent.
    #[must_use]
    pub fn is_profiler_enabled(&self) -> bool {
        self.profiler_enabled.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!(
                cluster = self.cluster,
                "GPU profiler channel closed, continuing with CPU-only regulation"
            );
        }
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> GpuBridgeStats {
        GpuBridgeStats {
            cluster: self.cluster,
            sampling_core: self.sampling_core,
            profiler_enabled: self.is_profiler_enabled(),
            channel_closed: self.closed.load(Ordering::Acquire),
            requests: self.requests.load(Ordering::Relaxed),
            samples: self.samples.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}

/// Result of folding one sample into cluster accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Events derived from the sample.
    pub events: u64,
    /// Cluster usage after the fold.
    pub usage: u64,
    /// Cores newly throttled by the budget re-check.
    pub newly_throttled: usize,
}

/// Fold `sample` into the usage of cluster `cluster_index` and re-check its budget.
///
/// Unlike the aggregation tick this never sets the cluster throttled flag;
/// it only throttles the member cores.
///
/// Samples are not ordered against the regulation boundary. A sample landing
/// after a member's Regulation tick released it but before the leader's tick
/// reset usage is compared against the previous period's usage, and can
/// throttle the cluster for the whole new period. Cores re-synchronize on the
/// next Regulation tick.
pub fn ingest(
    ctx: &RegulationContext,
    cluster_index: usize,
    handle: &GpuBridgeHandle,
    sample: &GpuBeatSample,
) -> Option<IngestOutcome> {
    let cluster = ctx.cluster(cluster_index)?;
    let events = sample.events(ctx.cache_line_size());
    let usage = cluster.add_usage(events);

    handle.samples.fetch_add(1, Ordering::Relaxed);
    handle.events.fetch_add(events, Ordering::Relaxed);

    if let Some(sink) = ctx.sink() {
        sink.record_gpu(GpuRecord {
            cluster: cluster.id(),
            regulation_period: cluster.regulation_period_count(),
            wall_clock: sample.timestamp,
            events,
            read_beats: sample.read_beats,
            write_beats: sample.write_beats,
            throttled: cluster.is_throttled(),
        });
    }

    let newly_throttled = if cluster.over_budget() {
        ctx.board().broadcast(cluster.members(), handle.sampling_core)
    } else {
        0
    };

    trace!(
        cluster = cluster.id(),
        events,
        usage,
        newly_throttled,
        "GPU sample ingested"
    );

    Some(IngestOutcome {
        events,
        usage,
        newly_throttled,
    })
}

/// Worker thread ingesting one cluster's GPU samples.
#[derive(Debug)]
pub struct GpuBridge {
    handle: Arc<GpuBridgeHandle>,
    thread: Option<JoinHandle<()>>,
}

impl GpuBridge {
    /// Spawn the bridge worker for cluster `cluster_index`.
    ///
    /// # Errors
    ///
    /// Returns [`RegError::Resource`] if the thread cannot be spawned.
    pub fn spawn(
        ctx: Arc<RegulationContext>,
        cluster_index: usize,
        handle: Arc<GpuBridgeHandle>,
        receiver: Box<dyn GpuSampleReceiver>,
        placement: Option<ThreadPlacement>,
    ) -> RegResult<Self> {
        let cluster = handle.cluster;
        let thread_handle = Arc::clone(&handle);
        let thread = thread::Builder::new()
            .name(format!("memreg-gpu-cl{cluster}"))
            .spawn(move || {
                if let Some(placement) = placement {
                    if let Err(e) = apply_placement(&placement) {
                        warn!(cluster, error = %e, "GPU bridge placement failed");
                    }
                }
                run_bridge(&ctx, cluster_index, &thread_handle, receiver);
            })
            .map_err(|e| RegError::Resource(format!("failed to spawn GPU bridge {cluster}: {e}")))?;

        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Shared handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<GpuBridgeHandle> {
        &self.handle
    }

    /// Terminate the channel, wake the worker and wait for it.
    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.handle.terminate();
        if let Err(e) = thread.join() {
            warn!(cluster = self.handle.cluster, "GPU bridge panicked: {:?}", e);
        }
    }
}

impl Drop for GpuBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_bridge(
    ctx: &RegulationContext,
    cluster_index: usize,
    handle: &GpuBridgeHandle,
    mut receiver: Box<dyn GpuSampleReceiver>,
) {
    debug!(cluster = handle.cluster, "GPU bridge started");
    loop {
        if ctx.is_shutting_down() {
            break;
        }
        match receiver.recv() {
            Ok(sample) => {
                if ctx.is_shutting_down() {
                    break;
                }
                ingest(ctx, cluster_index, handle, &sample);
            }
            Err(RegError::Shutdown) => break,
            Err(RegError::ChannelClosed) => {
                handle.mark_closed();
                break;
            }
            Err(e) => {
                warn!(cluster = handle.cluster, error = %e, "GPU sample receive failed");
                handle.mark_closed();
                break;
            }
        }
    }
    debug!(cluster = handle.cluster, "GPU bridge exited");
}
