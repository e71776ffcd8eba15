//! Absolute-deadline timer threads, one per regulated core.
//!
//! Each timer owns a dedicated thread pinned to its core. The thread sleeps
//! until the next absolute deadline and runs its handler, which returns the
//! following deadline. Deadlines are absolute, so handler runtime and wakeup
//! latency never accumulate as drift.

use crate::realtime::{apply_placement, ThreadPlacement};
use crossbeam_utils::sync::{Parker, Unparker};
use memreg_common::config::CoreId;
use memreg_common::error::{RegError, RegResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Callback driven by a [`PinnedTimer`].
pub trait TimerHandler: Send + 'static {
    /// Runs once on the timer thread before the first wait.
    fn armed(&mut self, _at: Instant) {}

    /// Handle an expiry. Returns the next absolute deadline, or `None` to stop.
    fn fire(&mut self, now: Instant) -> Option<Instant>;
}

/// A running timer thread.
#[derive(Debug)]
pub struct PinnedTimer<H: TimerHandler> {
    core: CoreId,
    cancelled: Arc<AtomicBool>,
    unparker: Unparker,
    handle: Option<JoinHandle<H>>,
}

impl<H: TimerHandler> PinnedTimer<H> {
    /// Start a timer thread for `core` whose first expiry is `first_deadline`.
    ///
    /// Returns once the thread is running and `handler.armed` has completed.
    ///
    /// # Errors
    ///
    /// [`RegError::Resource`] if the thread cannot be spawned or dies before
    /// it is armed.
    pub fn arm(
        core: CoreId,
        first_deadline: Instant,
        mut handler: H,
        placement: Option<ThreadPlacement>,
    ) -> RegResult<Self> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let (armed_tx, armed_rx) = mpsc::sync_channel::<()>(1);

        let flag = Arc::clone(&cancelled);
        let handle = thread::Builder::new()
            .name(format!("memreg-timer-{core}"))
            .spawn(move || {
                if let Some(placement) = placement {
                    if let Err(e) = apply_placement(&placement) {
                        warn!(core, error = %e, "Timer thread placement failed");
                    }
                }
                handler.armed(Instant::now());
                let _ = armed_tx.send(());
                drop(armed_tx);

                run(core, &parker, &flag, first_deadline, &mut handler);
                handler
            })
            .map_err(|e| RegError::Resource(format!("failed to spawn timer thread: {e}")))?;

        if armed_rx.recv().is_err() {
            let _ = handle.join();
            return Err(RegError::Resource(format!(
                "timer thread for core {core} exited before arming"
            )));
        }
        debug!(core, "Timer armed");

        Ok(Self {
            core,
            cancelled,
            unparker,
            handle: Some(handle),
        })
    }

    /// Core this timer runs on.
    #[must_use]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Whether the timer thread is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the timer and wait for an in-flight handler to return.
    ///
    /// Returns the handler, or `None` if it was already taken or panicked.
    pub fn cancel(&mut self) -> Option<H> {
        self.cancelled.store(true, Ordering::Release);
        self.unparker.unpark();
        let handle = self.handle.take()?;
        match handle.join() {
            Ok(handler) => Some(handler),
            Err(_) => {
                warn!(core = self.core, "Timer thread panicked");
                None
            }
        }
    }
}

impl<H: TimerHandler> Drop for PinnedTimer<H> {
    fn drop(&mut self) {
        let _ = self.cancel();
    }
}

fn run<H: TimerHandler>(
    core: CoreId,
    parker: &Parker,
    cancelled: &AtomicBool,
    first_deadline: Instant,
    handler: &mut H,
) {
    let mut deadline = first_deadline;
    loop {
        while Instant::now() < deadline {
            if cancelled.load(Ordering::Acquire) {
                trace!(core, "Timer cancelled while waiting");
                return;
            }
            parker.park_deadline(deadline);
        }
        if cancelled.load(Ordering::Acquire) {
            return;
        }

        match handler.fire(Instant::now()) {
            Some(next) => deadline = next,
            None => {
                debug!(core, "Timer handler requested stop");
                return;
            }
        }
    }
}
