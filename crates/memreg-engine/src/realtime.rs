//! Real-time scheduling, core pinning and memory locking.
//!
//! Timer threads, throttle workers and GPU bridge workers are placed on
//! their core with an explicit priority ordering:
//! - throttle workers run above all regular work on their core
//! - timer threads and bridge workers run above the throttle worker, so a
//!   throttled core still ticks and still ingests GPU samples
//!
//! Missing privileges (EPERM) degrade to a warning; the engine keeps running
//! with normal scheduling.

use memreg_common::config::{CoreId, RealtimeConfig, SchedPolicy};
use memreg_common::error::{RegError, RegResult};
use tracing::{debug, info, warn};

/// Where and at which priority a worker thread runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadPlacement {
    /// Core the thread is pinned to.
    pub core: CoreId,
    /// Scheduler policy.
    pub policy: SchedPolicy,
    /// Real-time priority (1-99).
    pub priority: u8,
}

impl ThreadPlacement {
    /// Placement for a thread on `core`, or `None` when real-time placement is disabled.
    #[must_use]
    pub fn for_config(config: &RealtimeConfig, core: CoreId, priority: u8) -> Option<Self> {
        config.enabled.then_some(Self {
            core,
            policy: config.policy,
            priority,
        })
    }
}

/// Outcome of applying a [`ThreadPlacement`].
#[derive(Debug, Clone, Default)]
pub struct RealtimeStatus {
    /// Applied scheduler policy.
    pub scheduler_policy: Option<SchedPolicy>,
    /// Applied scheduler priority.
    pub scheduler_priority: Option<u8>,
    /// Core the thread is pinned to.
    pub pinned_core: Option<CoreId>,
}

/// Pin the calling thread and set its scheduler.
///
/// # Errors
///
/// Returns an error for failures other than missing privileges or a
/// non-existent core, which are logged and reported as not applied.
pub fn apply_placement(placement: &ThreadPlacement) -> RegResult<RealtimeStatus> {
    let pinned_core = set_cpu_affinity(placement.core)?;
    let (scheduler_policy, scheduler_priority) = set_scheduler(placement.policy, placement.priority)?;

    let status = RealtimeStatus {
        scheduler_policy,
        scheduler_priority,
        pinned_core,
    };
    debug!(?status, "Thread placement applied");
    Ok(status)
}

/// Process-wide real-time setup performed once before any worker starts.
///
/// # Errors
///
/// Returns an error if memory locking fails for a reason other than EPERM.
pub fn init_process(config: &RealtimeConfig) -> RegResult<bool> {
    if !config.enabled {
        info!("Real-time scheduling disabled in configuration");
        return Ok(false);
    }

    let caps = check_rt_capabilities();
    if config.policy != SchedPolicy::Other && !caps.can_use_rt_scheduling() {
        warn!(
            rtprio_limit = ?caps.rtprio_limit,
            "Real-time scheduling likely unavailable. \
             Grant CAP_SYS_NICE or raise RLIMIT_RTPRIO."
        );
    }
    if !caps.preempt_rt {
        debug!("PREEMPT_RT kernel not detected");
    }

    if config.lock_memory {
        lock_memory()
    } else {
        Ok(false)
    }
}

/// Lock all current and future memory pages.
#[cfg(target_os = "linux")]
fn lock_memory() -> RegResult<bool> {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            Ok(true)
        }
        Err(nix::errno::Errno::EPERM) => {
            warn!("mlockall failed with EPERM - running without CAP_IPC_LOCK capability");
            Ok(false)
        }
        Err(e) => Err(RegError::Resource(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> RegResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Set real-time scheduler policy and priority of the calling thread.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> RegResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let clamped_priority = priority.clamp(1, 99);
    let param = libc::sched_param {
        sched_priority: i32::from(clamped_priority),
    };

    // SAFETY: pid 0 targets the calling thread; `param` outlives the call.
    let result = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };

    if result == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!(
                ?policy,
                priority = clamped_priority,
                "sched_setscheduler failed with EPERM - running without RT privileges"
            );
            return Ok((None, None));
        }
        return Err(RegError::Resource(format!("sched_setscheduler failed: {err}")));
    }

    Ok((Some(policy), Some(clamped_priority)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> RegResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

/// Pin the calling thread to `core`.
#[cfg(target_os = "linux")]
fn set_cpu_affinity(core: CoreId) -> RegResult<Option<CoreId>> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(core)
        .map_err(|e| RegError::Resource(format!("invalid CPU index {core}: {e}")))?;

    match sched_setaffinity(Pid::from_raw(0), &cpu_set) {
        Ok(()) => Ok(Some(core)),
        Err(nix::errno::Errno::EINVAL) => {
            warn!(core, "CPU does not exist or is offline, thread left unpinned");
            Ok(None)
        }
        Err(e) => Err(RegError::Resource(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(core: CoreId) -> RegResult<Option<CoreId>> {
    warn!(core, "CPU affinity not available on this platform");
    Ok(None)
}

/// Check if the current process has real-time capabilities.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    // SAFETY: geteuid has no preconditions.
    let mut caps = RtCapabilities {
        is_root: unsafe { libc::geteuid() } == 0,
        ..Default::default()
    };

    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `rlim` is a valid, writable rlimit.
    if unsafe { libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) } == 0 {
        caps.rtprio_limit = Some(rlim.rlim_cur);
    }
    // SAFETY: as above.
    if unsafe { libc::getrlimit(libc::RLIMIT_MEMLOCK, &mut rlim) } == 0 {
        caps.memlock_limit = Some(rlim.rlim_cur);
    }

    if let Ok(version) = std::fs::read_to_string("/proc/version") {
        caps.preempt_rt = version.contains("PREEMPT_RT") || version.contains("PREEMPT RT");
    }

    caps
}

/// Check if the current process has real-time capabilities.
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Information about real-time capabilities of the system.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Whether running as root.
    pub is_root: bool,
    /// RLIMIT_RTPRIO value (max RT priority allowed).
    pub rtprio_limit: Option<u64>,
    /// RLIMIT_MEMLOCK value (max lockable memory).
    pub memlock_limit: Option<u64>,
    /// Whether running on a PREEMPT_RT kernel.
    pub preempt_rt: bool,
}

impl RtCapabilities {
    /// Check if RT scheduling is likely to succeed.
    #[must_use]
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }
}
