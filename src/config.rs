//! Crate-wide tunables and size constants.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Size multipliers
// ---------------------------------------------------------------------------
pub const KB: u64 = 1 << 10;
pub const MB: u64 = 1 << 20;
pub const GB: u64 = 1 << 30;

/// Cluster size substituted when the filesystem refuses to report one.
pub const DEFAULT_CLUSTER_SIZE: u64 = 4096;

/// Smallest cluster size the pipelines accept. Anything below this is not a
/// plausible filesystem allocation unit.
pub const MIN_CLUSTER_SIZE: u64 = 512;

/// Alignment of IO buffers. Page-aligned buffers keep the kernel on its
/// direct-IO-friendly paths for both reads and writes.
pub const PAGE_ALIGN: usize = 4096;

/// Default bound on in-flight IO operations. Each pending READ/WRITE op pins
/// one cluster-sized buffer, so total buffer memory is
/// `max_pending * cluster_size`.
pub const DEFAULT_MAX_PENDING: usize = 64;

/// Upper bound on completion worker threads.
pub const MAX_WORKERS: usize = 8;

/// Interval between progress reports.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);
