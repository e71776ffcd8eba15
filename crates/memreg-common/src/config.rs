//! Configuration structures for the bandwidth regulator.
//!
//! Supports TOML deserialization with defaults describing a typical
//! two-cluster deployment, and explicit validation before the engine starts.

use crate::error::RegError;
use crate::units;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Logical CPU index.
pub type CoreId = usize;

/// Cluster identifier as it appears in configuration and record file names.
pub type ClusterId = u32;

/// Upper bound for the regulation period.
pub const MAX_REGULATION_PERIOD: Duration = Duration::from_secs(1);

/// Top-level regulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegulatorConfig {
    /// Interval at which cluster usage resets and throttling lifts.
    #[serde(with = "humantime_serde")]
    pub regulation_period: Duration,

    /// Interval at which per-core usage deltas are sampled against the budget.
    #[serde(with = "humantime_serde")]
    pub aggregation_period: Duration,

    /// Delay between engine start and the first timer expiry.
    #[serde(with = "humantime_serde")]
    pub start_delay: Duration,

    /// Bytes transferred per counted bus event.
    pub cache_line_size: u64,

    /// Real-time configuration for the throttle and bridge workers.
    pub realtime: RealtimeConfig,

    /// Per-tick record logging.
    pub logging: LoggingConfig,

    /// Regulated clusters.
    pub clusters: Vec<ClusterConfig>,
}

impl Default for RegulatorConfig {
    fn default() -> Self {
        Self {
            regulation_period: Duration::from_micros(5300),
            aggregation_period: Duration::from_micros(100),
            start_delay: Duration::from_secs(1),
            cache_line_size: units::DEFAULT_CACHE_LINE_SIZE,
            realtime: RealtimeConfig::default(),
            logging: LoggingConfig::default(),
            clusters: vec![
                ClusterConfig {
                    id: 1,
                    cores: vec![0, 1, 2, 3],
                    budget_mb: 204_800,
                    gpu: GpuProfilingConfig {
                        enabled: true,
                        sampling_core: 3,
                    },
                },
                ClusterConfig {
                    id: 2,
                    cores: vec![4, 5, 6, 7],
                    budget_mb: 204_800,
                    gpu: GpuProfilingConfig {
                        enabled: true,
                        sampling_core: 7,
                    },
                },
            ],
        }
    }
}

/// Real-time scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Pin workers to their core and request real-time scheduling (requires privileges).
    pub enabled: bool,

    /// Scheduler policy: "fifo" or "rr" (round-robin).
    pub policy: SchedPolicy,

    /// Priority of the per-core throttle workers (1-99).
    pub throttle_priority: u8,

    /// Priority of the pinned timer threads. Must be above `throttle_priority`
    /// so the regulation tick can preempt a spinning throttle worker.
    pub timer_priority: u8,

    /// Priority of the GPU bridge workers. Must be above `throttle_priority`
    /// so samples are still ingested on a throttled core.
    pub bridge_priority: u8,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: SchedPolicy::Fifo,
            throttle_priority: 98,
            timer_priority: 99,
            bridge_priority: 99,
            lock_memory: false,
        }
    }
}

/// Scheduler policy for real-time threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO: First-in-first-out real-time.
    #[default]
    Fifo,
    /// SCHED_RR: Round-robin real-time.
    Rr,
    /// SCHED_OTHER: Normal time-sharing (non-RT).
    Other,
}

/// Per-tick record logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit per-tick CPU and per-sample GPU records.
    pub enabled: bool,

    /// Directory the CSV record files are created in.
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("/tmp"),
        }
    }
}

/// One regulated cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster identifier.
    pub id: ClusterId,

    /// Member cores.
    pub cores: Vec<CoreId>,

    /// Bandwidth budget in MB/s.
    pub budget_mb: u64,

    /// GPU bandwidth profiling.
    pub gpu: GpuProfilingConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: 0,
            cores: Vec::new(),
            budget_mb: 204_800,
            gpu: GpuProfilingConfig::default(),
        }
    }
}

/// GPU bandwidth profiling for one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GpuProfilingConfig {
    /// Fold GPU bus beats into this cluster's usage.
    pub enabled: bool,

    /// Core whose aggregation ticks request GPU samples and which hosts the bridge worker.
    pub sampling_core: CoreId,
}

impl RegulatorConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Check period bounds, cluster layout and priorities.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regulation_period.as_micros() == 0 || self.regulation_period > MAX_REGULATION_PERIOD {
            return Err(ConfigError::Invalid(format!(
                "regulation period must satisfy 0 < period <= 1s, got {}",
                humantime::format_duration(self.regulation_period)
            )));
        }
        if self.aggregation_period.as_micros() == 0 {
            return Err(ConfigError::Invalid(
                "aggregation period must be at least 1us".into(),
            ));
        }
        if self.aggregation_period >= self.regulation_period {
            return Err(ConfigError::Invalid(format!(
                "aggregation period {} must be shorter than regulation period {}",
                humantime::format_duration(self.aggregation_period),
                humantime::format_duration(self.regulation_period)
            )));
        }
        if self.cache_line_size == 0 || !self.cache_line_size.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "cache line size must be a power of two, got {}",
                self.cache_line_size
            )));
        }
        if self.clusters.is_empty() {
            return Err(ConfigError::Invalid("no clusters configured".into()));
        }

        let mut ids = HashSet::new();
        let mut seen_cores = HashSet::new();
        for cluster in &self.clusters {
            if !ids.insert(cluster.id) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate cluster id {}",
                    cluster.id
                )));
            }
            if cluster.cores.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "cluster {} has no cores",
                    cluster.id
                )));
            }
            if cluster.budget_mb == 0 {
                return Err(ConfigError::Invalid(format!(
                    "cluster {} has a zero budget",
                    cluster.id
                )));
            }
            for &core in &cluster.cores {
                if !seen_cores.insert(core) {
                    return Err(ConfigError::Invalid(format!(
                        "core {core} belongs to more than one cluster"
                    )));
                }
            }
            if cluster.gpu.enabled && !cluster.cores.contains(&cluster.gpu.sampling_core) {
                return Err(ConfigError::Invalid(format!(
                    "GPU sampling core {} is not a member of cluster {}",
                    cluster.gpu.sampling_core, cluster.id
                )));
            }
        }

        let rt = &self.realtime;
        for (name, prio) in [
            ("throttle_priority", rt.throttle_priority),
            ("timer_priority", rt.timer_priority),
            ("bridge_priority", rt.bridge_priority),
        ] {
            if !(1..=99).contains(&prio) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 1..=99, got {prio}"
                )));
            }
        }
        for (name, prio) in [
            ("timer_priority", rt.timer_priority),
            ("bridge_priority", rt.bridge_priority),
        ] {
            if prio <= rt.throttle_priority {
                return Err(ConfigError::Invalid(format!(
                    "{name} ({prio}) must be above throttle_priority ({})",
                    rt.throttle_priority
                )));
            }
        }

        Ok(())
    }

    /// Number of aggregation ticks per regulation period, rounded up.
    #[must_use]
    pub fn regulation_interval(&self) -> u64 {
        let agg = self.aggregation_period.as_nanos().max(1);
        u64::try_from(self.regulation_period.as_nanos().div_ceil(agg)).unwrap_or(u64::MAX)
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Semantically invalid configuration.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for RegError {
    fn from(err: ConfigError) -> Self {
        RegError::Config(err.to_string())
    }
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
