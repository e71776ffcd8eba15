//! Simulated platform for running the regulator without hardware counters.
//!
//! Each core generates bus events at a fixed rate while its counter runs.
//! GPU samples come either from an in-process simulated profiler or from an
//! external profiler reached over a Unix socket.

use crate::gpu_socket;
use memreg_common::config::{ClusterId, CoreId};
use memreg_common::error::{RegError, RegResult};
use memreg_engine::{mailbox, BandwidthCounter, GpuChannel, MailboxProfiler, Platform};
use std::sync::{Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the simulated profiler waits for a request before re-checking termination.
const PROFILER_POLL: Duration = Duration::from_millis(100);

/// Where GPU samples come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpuSource {
    /// No profiler; every cluster is regulated on CPU traffic only.
    Disabled,
    /// In-process profiler answering every request with fixed beat counts.
    Simulated {
        /// Read beats per sample.
        read_beats: i32,
        /// Write beats per sample.
        write_beats: i32,
    },
    /// External profiler listening on a Unix socket. `{cluster}` in the
    /// template is replaced by the cluster id.
    Socket {
        /// Socket path template.
        template: String,
    },
}

/// Counter producing `rate` events per millisecond while running.
#[derive(Debug)]
pub struct SimulatedCounter {
    events_per_ms: u64,
    accumulated: u64,
    running_since: Option<Instant>,
}

impl SimulatedCounter {
    /// Running counter with `events_per_ms` events per millisecond.
    #[must_use]
    pub fn new(events_per_ms: u64) -> Self {
        Self {
            events_per_ms,
            accumulated: 0,
            running_since: Some(Instant::now()),
        }
    }

    fn events_since(&self, since: Instant) -> u64 {
        let micros = u64::try_from(since.elapsed().as_micros()).unwrap_or(u64::MAX);
        micros.saturating_mul(self.events_per_ms) / 1000
    }
}

impl BandwidthCounter for SimulatedCounter {
    fn read_count(&self) -> u64 {
        let running = self.running_since.map_or(0, |since| self.events_since(since));
        self.accumulated.saturating_add(running)
    }

    fn reset(&mut self) {
        self.accumulated = 0;
        if self.running_since.is_some() {
            self.running_since = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated = self.accumulated.saturating_add(self.events_since(since));
        }
    }

    fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }
}

/// Platform handing out [`SimulatedCounter`]s.
#[derive(Debug)]
pub struct SimulatedPlatform {
    events_per_ms: u64,
    unavailable: Vec<CoreId>,
    gpu: GpuSource,
    profilers: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedPlatform {
    /// Platform whose cores generate `events_per_ms` events per millisecond.
    #[must_use]
    pub fn new(events_per_ms: u64) -> Self {
        Self {
            events_per_ms,
            unavailable: Vec::new(),
            gpu: GpuSource::Disabled,
            profilers: Mutex::new(Vec::new()),
        }
    }

    /// Report these cores as having no usable counter.
    #[must_use]
    pub fn with_unavailable(mut self, cores: Vec<CoreId>) -> Self {
        self.unavailable = cores;
        self
    }

    /// Select the GPU sample source.
    #[must_use]
    pub fn with_gpu(mut self, gpu: GpuSource) -> Self {
        self.gpu = gpu;
        self
    }

    /// Wait for simulated profiler threads. Call after the regulator stopped.
    pub fn join_profilers(&self) {
        let handles: Vec<_> = self
            .profilers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("Simulated GPU profiler panicked");
            }
        }
    }

    fn spawn_profiler(&self, cluster: ClusterId, read_beats: i32, write_beats: i32) -> RegResult<GpuChannel> {
        let (profiler, channel) = mailbox();
        let handle = thread::Builder::new()
            .name(format!("sim-gpu-cl{cluster}"))
            .spawn(move || run_profiler(cluster, &profiler, read_beats, write_beats))
            .map_err(|e| RegError::Resource(format!("failed to spawn simulated profiler: {e}")))?;
        self.profilers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        info!(cluster, read_beats, write_beats, "Simulated GPU profiler started");
        Ok(channel)
    }
}

impl Platform for SimulatedPlatform {
    fn open_counter(&self, core: CoreId) -> RegResult<Box<dyn BandwidthCounter>> {
        if self.unavailable.contains(&core) {
            return Err(RegError::CounterUnavailable {
                core,
                reason: "disabled on the command line".into(),
            });
        }
        Ok(Box::new(SimulatedCounter::new(self.events_per_ms)))
    }

    fn open_gpu_channel(&self, cluster: ClusterId) -> RegResult<GpuChannel> {
        match &self.gpu {
            GpuSource::Disabled => Err(RegError::ChannelClosed),
            GpuSource::Simulated {
                read_beats,
                write_beats,
            } => self.spawn_profiler(cluster, *read_beats, *write_beats),
            GpuSource::Socket { template } => {
                gpu_socket::connect(&gpu_socket::socket_path(template, cluster))
            }
        }
    }
}

fn run_profiler(cluster: ClusterId, profiler: &MailboxProfiler, read_beats: i32, write_beats: i32) {
    while !profiler.is_terminated() {
        if profiler.wait_requests(PROFILER_POLL) == 0 {
            continue;
        }
        if profiler.deliver(read_beats, write_beats).is_err() {
            break;
        }
    }
    debug!(cluster, "Simulated GPU profiler exited");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_freezes_while_stopped() {
        let mut counter = SimulatedCounter::new(1_000);
        counter.stop();
        let frozen = counter.read_count();
        thread::sleep(Duration::from_millis(5));
        assert_eq!(counter.read_count(), frozen);

        counter.start();
        thread::sleep(Duration::from_millis(5));
        assert!(counter.read_count() > frozen);
    }

    #[test]
    fn test_counter_reset() {
        let mut counter = SimulatedCounter::new(1_000_000);
        thread::sleep(Duration::from_millis(2));
        counter.stop();
        assert!(counter.read_count() > 0);
        counter.reset();
        assert_eq!(counter.read_count(), 0);
    }

    #[test]
    fn test_unavailable_core() {
        let platform = SimulatedPlatform::new(10).with_unavailable(vec![2]);
        assert!(platform.open_counter(1).is_ok());
        assert!(matches!(
            platform.open_counter(2),
            Err(RegError::CounterUnavailable { core: 2, .. })
        ));
    }

    #[test]
    fn test_disabled_gpu_reports_closed() {
        let platform = SimulatedPlatform::new(10);
        assert!(matches!(
            platform.open_gpu_channel(1),
            Err(RegError::ChannelClosed)
        ));
    }

    #[test]
    fn test_simulated_profiler_answers_requests() {
        let platform = SimulatedPlatform::new(10).with_gpu(GpuSource::Simulated {
            read_beats: 10,
            write_beats: 5,
        });
        let mut channel = platform.open_gpu_channel(1).unwrap();
        channel.requester.request().unwrap();
        let sample = channel.receiver.recv().unwrap();
        assert_eq!((sample.read_beats, sample.write_beats), (10, 5));

        channel.requester.terminate();
        platform.join_profilers();
    }
}
