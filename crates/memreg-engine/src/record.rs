//! Per-tick bandwidth records.
//!
//! Records are produced on the regulation path and must never block it:
//! handing a record to a [`RecordSink`] is a short mutex-protected push, and
//! the provided [`CsvRecordWriter`] does all file I/O on a background thread.
//!
//! File formats (one line per record, no header):
//!
//! ```text
//! memreg_cpu{core}.csv        regulation_period,secs.nanos,delta_events,throttled
//! memreg_gpu_cl{cluster}.csv  regulation_period,secs.nanos,events,read_beats,write_beats,throttled
//! ```

use memreg_common::config::{ClusterId, CoreId};
use memreg_common::error::{RegError, RegResult};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Records queued beyond this are dropped.
const MAX_PENDING: usize = 64 * 1024;

/// One aggregation tick of one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickRecord {
    /// Reporting core.
    pub core: CoreId,
    /// Cluster regulation period count at the tick.
    pub regulation_period: u64,
    /// Wall clock time of the tick.
    pub wall_clock: SystemTime,
    /// Events counted since the core's previous aggregation tick.
    pub delta_events: u64,
    /// Cluster throttled flag at the tick.
    pub throttled: bool,
}

/// One ingested GPU sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuRecord {
    /// Cluster the sample was folded into.
    pub cluster: ClusterId,
    /// Cluster regulation period count at ingestion.
    pub regulation_period: u64,
    /// Wall clock time of ingestion.
    pub wall_clock: SystemTime,
    /// Bus events derived from the beats.
    pub events: u64,
    /// GPU read beats.
    pub read_beats: u32,
    /// GPU write beats.
    pub write_beats: u32,
    /// Cluster throttled flag at ingestion.
    pub throttled: bool,
}

/// Asynchronous consumer of bandwidth records.
pub trait RecordSink: Send + Sync {
    /// Accept a CPU tick record. Must not block.
    fn record_tick(&self, record: TickRecord);

    /// Accept a GPU sample record. Must not block.
    fn record_gpu(&self, record: GpuRecord);

    /// Flush everything accepted so far and release resources.
    ///
    /// # Errors
    ///
    /// Returns an error if pending records could not be persisted.
    fn close(&self) -> RegResult<()> {
        Ok(())
    }
}

fn wall_clock_parts(time: SystemTime) -> (u64, u32) {
    let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since_epoch.as_secs(), since_epoch.subsec_nanos())
}

/// Format a CPU record as one CSV line including the trailing newline.
#[must_use]
pub fn format_tick_line(record: &TickRecord) -> String {
    let (secs, nanos) = wall_clock_parts(record.wall_clock);
    format!(
        "{},{}.{:09},{},{}\n",
        record.regulation_period,
        secs,
        nanos,
        record.delta_events,
        u8::from(record.throttled)
    )
}

/// Format a GPU record as one CSV line including the trailing newline.
#[must_use]
pub fn format_gpu_line(record: &GpuRecord) -> String {
    let (secs, nanos) = wall_clock_parts(record.wall_clock);
    format!(
        "{},{}.{:09},{},{},{},{}\n",
        record.regulation_period,
        secs,
        nanos,
        record.events,
        record.read_beats,
        record.write_beats,
        u8::from(record.throttled)
    )
}

/// Path of the CPU record file of `core` inside `dir`.
#[must_use]
pub fn cpu_record_path(dir: &Path, core: CoreId) -> PathBuf {
    dir.join(format!("memreg_cpu{core}.csv"))
}

/// Path of the GPU record file of `cluster` inside `dir`.
#[must_use]
pub fn gpu_record_path(dir: &Path, cluster: ClusterId) -> PathBuf {
    dir.join(format!("memreg_gpu_cl{cluster}.csv"))
}

#[derive(Debug)]
enum Record {
    Tick(TickRecord),
    Gpu(GpuRecord),
}

#[derive(Debug, Default)]
struct Queue {
    records: Vec<Record>,
    closed: bool,
}

#[derive(Debug, Default)]
struct WriterShared {
    queue: Mutex<Queue>,
    available: Condvar,
    dropped: AtomicU64,
    written: AtomicU64,
}

impl WriterShared {
    fn push(&self, record: Record) {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if queue.closed {
            return;
        }
        if queue.records.len() >= MAX_PENDING {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        queue.records.push(record);
        drop(queue);
        self.available.notify_one();
    }
}

/// Appends records to per-core and per-cluster CSV files from a background thread.
#[derive(Debug)]
pub struct CsvRecordWriter {
    shared: Arc<WriterShared>,
    thread: Mutex<Option<JoinHandle<RegResult<()>>>>,
}

impl CsvRecordWriter {
    /// Create (truncating) one file per core and per GPU-profiled cluster in
    /// `dir` and start the writer thread.
    ///
    /// # Errors
    ///
    /// Returns [`RegError::Io`] if a file cannot be created and
    /// [`RegError::Resource`] if the writer thread cannot be spawned.
    pub fn create(dir: &Path, cores: &[CoreId], gpu_clusters: &[ClusterId]) -> RegResult<Self> {
        let open = |path: PathBuf| -> RegResult<BufWriter<File>> {
            File::create(&path)
                .map(BufWriter::new)
                .map_err(|e| RegError::Io(format!("failed to create {}: {e}", path.display())))
        };

        let mut cpu_files = HashMap::with_capacity(cores.len());
        for &core in cores {
            cpu_files.insert(core, open(cpu_record_path(dir, core))?);
        }
        let mut gpu_files = HashMap::with_capacity(gpu_clusters.len());
        for &cluster in gpu_clusters {
            gpu_files.insert(cluster, open(gpu_record_path(dir, cluster))?);
        }

        let shared = Arc::new(WriterShared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("memreg-records".into())
            .spawn(move || run_writer(&thread_shared, cpu_files, gpu_files))
            .map_err(|e| RegError::Resource(format!("failed to spawn record writer: {e}")))?;

        info!(dir = %dir.display(), cores = cores.len(), "Record logging started");

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Records dropped because the writer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Records written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.shared.written.load(Ordering::Relaxed)
    }
}

impl RecordSink for CsvRecordWriter {
    fn record_tick(&self, record: TickRecord) {
        self.shared.push(Record::Tick(record));
    }

    fn record_gpu(&self, record: GpuRecord) {
        self.shared.push(Record::Gpu(record));
    }

    fn close(&self) -> RegResult<()> {
        {
            let mut queue = self.shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.closed = true;
        }
        self.shared.available.notify_all();

        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| RegError::Io("record writer panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for CsvRecordWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Record writer close failed");
        }
    }
}

fn run_writer(
    shared: &WriterShared,
    mut cpu_files: HashMap<CoreId, BufWriter<File>>,
    mut gpu_files: HashMap<ClusterId, BufWriter<File>>,
) -> RegResult<()> {
    loop {
        let (batch, closed) = {
            let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            while queue.records.is_empty() && !queue.closed {
                queue = shared
                    .available
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            (std::mem::take(&mut queue.records), queue.closed)
        };

        for record in &batch {
            let (file, line) = match record {
                Record::Tick(r) => (cpu_files.get_mut(&r.core), format_tick_line(r)),
                Record::Gpu(r) => (gpu_files.get_mut(&r.cluster), format_gpu_line(r)),
            };
            let Some(file) = file else {
                debug!(?record, "No record file for source, dropping");
                continue;
            };
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!(error = %e, "Record write failed");
                continue;
            }
            shared.written.fetch_add(1, Ordering::Relaxed);
        }

        if closed {
            break;
        }
    }

    for file in cpu_files.values_mut().chain(gpu_files.values_mut()) {
        file.flush()
            .map_err(|e| RegError::Io(format!("failed to flush record file: {e}")))?;
    }
    debug!("Record writer stopped");
    Ok(())
}

/// Keeps records in memory, for tests and in-process consumers.
#[derive(Debug, Default)]
pub struct MemoryRecordSink {
    ticks: Mutex<Vec<TickRecord>>,
    gpu: Mutex<Vec<GpuRecord>>,
}

impl MemoryRecordSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all CPU records received.
    #[must_use]
    pub fn ticks(&self) -> Vec<TickRecord> {
        self.ticks.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Copy of all GPU records received.
    #[must_use]
    pub fn gpu(&self) -> Vec<GpuRecord> {
        self.gpu.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RecordSink for MemoryRecordSink {
    fn record_tick(&self, record: TickRecord) {
        self.ticks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn record_gpu(&self, record: GpuRecord) {
        self.gpu
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
