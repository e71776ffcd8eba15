//! In-process GPU profiler channel.
//!
//! The profiler side ([`MailboxProfiler`]) learns about requests through a
//! lock-free counter plus an unpark, so requesting from a timer handler never
//! blocks. Delivered records land in a single-slot mailbox; an unconsumed
//! record is overwritten by the next one, matching a shared-memory handoff.

use crate::gpu_bridge::{
    GpuBeatSample, GpuChannel, GpuSampleReceiver, GpuSampleRequester, GPU_RECORD_SIZE,
};
use crossbeam_utils::sync::{Parker, Unparker};
use memreg_common::error::{RegError, RegResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct Slot {
    record: Option<[u8; GPU_RECORD_SIZE]>,
}

#[derive(Debug)]
struct Shared {
    slot: Mutex<Slot>,
    ready: Condvar,
    requests: AtomicU64,
    closed: AtomicBool,
    terminated: AtomicBool,
    profiler: Unparker,
}

impl Shared {
    fn wake_receiver(&self) {
        // Taking the lock orders the flag store before a waiter's check.
        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.ready.notify_all();
    }
}

/// Create a connected profiler end and engine channel.
#[must_use]
pub fn mailbox() -> (MailboxProfiler, GpuChannel) {
    let parker = Parker::new();
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::default()),
        ready: Condvar::new(),
        requests: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        terminated: AtomicBool::new(false),
        profiler: parker.unparker().clone(),
    });

    let channel = GpuChannel {
        requester: Arc::new(MailboxRequester {
            shared: Arc::clone(&shared),
        }),
        receiver: Box::new(MailboxReceiver {
            shared: Arc::clone(&shared),
        }),
    };
    (MailboxProfiler { shared, parker }, channel)
}

struct MailboxRequester {
    shared: Arc<Shared>,
}

impl GpuSampleRequester for MailboxRequester {
    fn request(&self) -> RegResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RegError::ChannelClosed);
        }
        self.shared.requests.fetch_add(1, Ordering::AcqRel);
        self.shared.profiler.unpark();
        Ok(())
    }

    fn terminate(&self) {
        self.shared.terminated.store(true, Ordering::Release);
        self.shared.wake_receiver();
        self.shared.profiler.unpark();
    }
}

struct MailboxReceiver {
    shared: Arc<Shared>,
}

impl MailboxReceiver {
    fn poll(&self, slot: &mut Slot) -> RegResult<Option<GpuBeatSample>> {
        if self.shared.terminated.load(Ordering::Acquire) {
            return Err(RegError::Shutdown);
        }
        if let Some(record) = slot.record.take() {
            return Ok(Some(GpuBeatSample::decode(record)));
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RegError::ChannelClosed);
        }
        Ok(None)
    }
}

impl GpuSampleReceiver for MailboxReceiver {
    fn recv(&mut self) -> RegResult<GpuBeatSample> {
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(sample) = self.poll(&mut slot)? {
                return Ok(sample);
            }
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn try_recv(&mut self) -> RegResult<Option<GpuBeatSample>> {
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        self.poll(&mut slot)
    }
}

/// Profiler end of a [`mailbox`] channel.
///
/// Dropping it closes the channel.
#[derive(Debug)]
pub struct MailboxProfiler {
    shared: Arc<Shared>,
    parker: Parker,
}

impl MailboxProfiler {
    /// Take all pending requests without waiting.
    pub fn take_requests(&self) -> u64 {
        self.shared.requests.swap(0, Ordering::AcqRel)
    }

    /// Wait up to `timeout` for requests and take them.
    ///
    /// Returns 0 on timeout or once the engine terminated the channel.
    pub fn wait_requests(&self, timeout: Duration) -> u64 {
        let pending = self.take_requests();
        if pending > 0 || self.is_terminated() {
            return pending;
        }
        self.parker.park_timeout(timeout);
        self.take_requests()
    }

    /// Publish a sample, replacing any unconsumed one.
    ///
    /// # Errors
    ///
    /// [`RegError::Shutdown`] once the engine terminated the channel.
    pub fn deliver(&self, read_beats: i32, write_beats: i32) -> RegResult<()> {
        if self.is_terminated() {
            return Err(RegError::Shutdown);
        }
        let mut slot = self.shared.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.record = Some(GpuBeatSample::encode(read_beats, write_beats));
        drop(slot);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Whether the engine terminated the channel.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// Close the channel; the engine sees [`RegError::ChannelClosed`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.wake_receiver();
    }
}

impl Drop for MailboxProfiler {
    fn drop(&mut self) {
        self.close();
    }
}
