#![doc = "Per-cluster memory-bandwidth regulation engine."]

pub mod accountant;
pub mod clock;
pub mod cluster;
pub mod counter;
pub mod gpu_bridge;
pub mod mailbox;
pub mod realtime;
pub mod record;
pub mod regulator;
pub mod scheduler;
pub mod throttle;
pub mod timer;

pub use accountant::CoreAccountant;
pub use clock::GlobalClock;
pub use cluster::{ClusterAccountant, ClusterSnapshot};
pub use counter::{BandwidthCounter, ManualCounter, ManualCounterHandle, Platform};
pub use gpu_bridge::{
    GpuBeatSample, GpuBridge, GpuBridgeHandle, GpuBridgeStats, GpuChannel, GpuSampleReceiver,
    GpuSampleRequester, GPU_RECORD_SIZE,
};
pub use mailbox::{mailbox, MailboxProfiler};
pub use realtime::*;
pub use record::{CsvRecordWriter, GpuRecord, MemoryRecordSink, RecordSink, TickRecord};
pub use regulator::*;
pub use scheduler::*;
pub use throttle::{ThrottleBoard, ThrottleStats, ThrottleWorker};
pub use timer::{PinnedTimer, TimerHandler};
