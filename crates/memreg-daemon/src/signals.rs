//! Signal handling for the regulator daemon.
//!
//! SIGTERM and SIGINT request shutdown; SIGHUP requests a status dump.
//! The handlers only store to static atomics. The main loop folds them into
//! [`SignalState`] through [`SignalHandler::poll`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static STATUS_FLAG: AtomicBool = AtomicBool::new(false);

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM or SIGINT.
    Terminate,
    /// SIGHUP.
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM/SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Requests observed by the main loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    status_requested: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown was requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Acquire)
    }

    /// Whether a status dump was requested, clearing the request.
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.status_requested.swap(false, Ordering::AcqRel)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Release);
    }

    /// Request a status dump.
    pub fn request_status(&self) {
        self.status_requested.store(true, Ordering::Release);
    }

    fn record_signal(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        match kind {
            SignalKind::Terminate => self.request_shutdown(),
            SignalKind::Hangup => self.request_status(),
        }
    }

    /// Signals received so far.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Installed signal handlers plus the state they feed.
#[derive(Debug, Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Install handlers for SIGTERM, SIGINT and SIGHUP.
    ///
    /// # Errors
    ///
    /// Returns the errno if `sigaction` fails.
    pub fn install() -> nix::Result<Self> {
        #[cfg(unix)]
        install_handlers()?;
        Ok(Self::detached())
    }

    /// Handler state without any OS signal wiring.
    pub fn detached() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    /// Move pending signals into the shared state.
    pub fn poll(&self) {
        if SHUTDOWN_FLAG.swap(false, Ordering::AcqRel) {
            info!(signal = %SignalKind::Terminate, "Shutdown signal received");
            self.state.record_signal(SignalKind::Terminate);
        }
        if STATUS_FLAG.swap(false, Ordering::AcqRel) {
            debug!(signal = %SignalKind::Hangup, "Status signal received");
            self.state.record_signal(SignalKind::Hangup);
        }
    }

    /// Whether shutdown was requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.state.shutdown_requested()
    }

    /// Whether a status dump was requested, clearing the request.
    #[inline]
    pub fn take_status_request(&self) -> bool {
        self.state.take_status_request()
    }

    /// Request shutdown from the daemon itself.
    pub fn request_shutdown(&self) {
        self.state.request_shutdown();
    }

    /// Shared state.
    pub fn state(&self) -> &SignalState {
        &self.state
    }

    /// Sleep up to `timeout`, returning early once shutdown is requested.
    ///
    /// Returns true if shutdown was requested.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        const POLL: Duration = Duration::from_millis(50);
        let start = Instant::now();
        loop {
            self.poll();
            if self.shutdown_requested() {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }
            std::thread::sleep(POLL.min(timeout - elapsed));
        }
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn install_handlers() -> nix::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    extern "C" fn on_terminate(_: nix::libc::c_int) {
        SHUTDOWN_FLAG.store(true, Ordering::Release);
    }

    extern "C" fn on_hangup(_: nix::libc::c_int) {
        STATUS_FLAG.store(true, Ordering::Release);
    }

    let terminate = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let hangup = SigAction::new(
        SigHandler::Handler(on_hangup),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );

    // SAFETY: the handlers only touch atomics, which is async-signal-safe.
    unsafe {
        sigaction(Signal::SIGTERM, &terminate)?;
        sigaction(Signal::SIGINT, &terminate)?;
        sigaction(Signal::SIGHUP, &hangup)?;
    }
    debug!("Signal handlers installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_state_default() {
        let state = SignalState::new();
        assert!(!state.shutdown_requested());
        assert!(!state.take_status_request());
        assert_eq!(state.signal_count(), 0);
    }

    #[test]
    fn test_status_request_is_taken_once() {
        let state = SignalState::new();
        state.record_signal(SignalKind::Hangup);
        assert!(state.take_status_request());
        assert!(!state.take_status_request());
        assert!(!state.shutdown_requested());
        assert_eq!(state.signal_count(), 1);
    }

    #[test]
    fn test_manual_shutdown_ends_wait() {
        let handler = SignalHandler::detached();
        assert!(!handler.wait_for_shutdown(Duration::from_millis(10)));
        handler.request_shutdown();
        assert!(handler.wait_for_shutdown(Duration::from_secs(10)));
    }

    #[test]
    fn test_signal_kind_display() {
        assert_eq!(SignalKind::Hangup.to_string(), "SIGHUP");
    }
}
