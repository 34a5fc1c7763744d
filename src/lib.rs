//! Sparse-file utilities.
//!
//! Filesystems with sparse support let long runs of zero bytes go
//! unallocated: reads still return zeros, but no storage backs them. This
//! crate detects and exploits that in three ways sharing one engine:
//!
//! - [`make_sparse`] — scan an existing file and deallocate its zero
//!   clusters in place (`makesparse`).
//! - [`copy_sparse`] — copy a file into a new sparse destination, writing
//!   only the non-zero clusters (`copysparse`).
//! - [`pipe_sparse`] — stream bytes from a pipe into a new sparse file,
//!   writing only the non-zero records (`pipesparse`).
//!
//! The shared core is the concurrent zero-detection pipeline: a bounded
//! pool of page-aligned IO ops ([`io::op`]), a completion engine that keeps
//! up to `max_pending` of them in flight ([`io::engine`]), a concurrently
//! markable cluster bitmap ([`cluster_map`]), and the coalescer that turns
//! the bitmap into a minimal deallocate batch ([`ranges`]).

pub mod analyze;
pub mod cluster_map;
pub mod config;
pub mod copy;
pub mod display;
pub mod error;
pub mod io;
pub mod pipe;
pub mod platform;
pub mod probe;
pub mod progress;
pub mod ranges;
pub mod zero;

// ---------------------------------------------------------------------------
// Top-level re-exports: the three operations and the types their callers
// touch.
// ---------------------------------------------------------------------------

/// Analyze a file and deallocate its zero clusters.
pub use analyze::{make_sparse, MakeSparseOpts, MakeSparseReport};

/// Copy a file into a new sparse destination.
pub use copy::{copy_sparse, CopyReport, CopySparseOpts};

/// Stream bytes into a new sparse file.
pub use pipe::{pipe_sparse, PipeReport, PipeSparseOpts};

/// Crate-wide error and result types.
pub use error::{Result, SparseError};

/// Engine sizing knobs, embedded in each operation's options.
pub use io::EngineConfig;

/// The zero-cluster bitmap and its coalesced output.
pub use cluster_map::ClusterMap;
pub use ranges::{coalesce_zero_ranges, ZeroRange};

/// Buffer-level zero predicate.
pub use zero::is_zero_buf;
