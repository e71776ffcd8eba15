//! Conversions between MB/s budgets, bytes and bus events.
//!
//! A bus event is one cache line moved across the shared memory bus. Budgets
//! are configured in MB/s and enforced as events per regulation period.

use std::time::Duration;

/// Default cache line size in bytes.
pub const DEFAULT_CACHE_LINE_SIZE: u64 = 64;

/// Size of one GPU bus beat in bytes.
pub const GPU_BEAT_BYTES: u64 = 16;

const BYTES_PER_MB: u128 = 1024 * 1024;
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Convert a MB/s budget into events per `regulation_period`, rounding down.
#[must_use]
pub fn mb_to_events(mb: u64, regulation_period: Duration, cache_line_size: u64) -> u64 {
    let divisor = u128::from(cache_line_size.max(1)) * NANOS_PER_SEC;
    let events = u128::from(mb) * BYTES_PER_MB * regulation_period.as_nanos() / divisor;
    u64::try_from(events).unwrap_or(u64::MAX)
}

/// Convert events per `regulation_period` back into MB/s, rounding up.
#[must_use]
pub fn events_to_mb(events: u64, regulation_period: Duration, cache_line_size: u64) -> u64 {
    let divisor = regulation_period.as_nanos().max(1) * BYTES_PER_MB;
    let mb = (u128::from(events) * u128::from(cache_line_size) * NANOS_PER_SEC).div_ceil(divisor);
    u64::try_from(mb).unwrap_or(u64::MAX)
}

/// Bytes moved by a GPU read/write beat pair.
#[must_use]
pub fn beats_to_bytes(read_beats: u32, write_beats: u32) -> u64 {
    (u64::from(read_beats) + u64::from(write_beats)) * GPU_BEAT_BYTES
}

/// Bus events covering `bytes`, rounding up to a whole cache line.
#[must_use]
pub fn bytes_to_events(bytes: u64, cache_line_size: u64) -> u64 {
    bytes.div_ceil(cache_line_size.max(1))
}
