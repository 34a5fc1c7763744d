//! Exclusive file opening and geometry capture.
//!
//! A pipeline run starts here: the file is opened with no sharing, its size
//! and timestamps are observed once, and the filesystem is asked for its
//! cluster size. Changes to the file after the open are outside the
//! contract.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::config::{DEFAULT_CLUSTER_SIZE, MIN_CLUSTER_SIZE};
use crate::displaylevel;
use crate::error::{Result, SparseError};
use crate::platform::{self, FileLock, FileStamps};

/// Immutable per-run description of the opened file.
#[derive(Debug, Clone, Copy)]
pub struct FileGeometry {
    /// Byte count, observed once at open.
    pub size: u64,
    /// Filesystem allocation unit, or 0 when discovery failed.
    pub cluster_size: u64,
    /// Timestamp triple for later restoration.
    pub stamps: FileStamps,
}

impl FileGeometry {
    /// Number of whole clusters at the given cluster size.
    pub fn whole_clusters(&self, cluster_size: u64) -> u64 {
        self.size / cluster_size
    }

    /// Length of the trailing runt, 0 when the size is cluster-aligned.
    pub fn runt_bytes(&self, cluster_size: u64) -> u64 {
        self.size % cluster_size
    }
}

/// Opens `path` for exclusive access and captures its geometry.
///
/// `write` selects read-write access (analyze target) versus read-only
/// (copy source); either way the file is locked against concurrent openers.
/// The returned [`FileLock`] holds the lock; callers keep it alive until
/// the run is over. Failures map to `NotFound`, `AccessDenied`,
/// `AlreadyInUse`, or `Io`. Cluster-size discovery is non-fatal: a zero in
/// the geometry tells the caller to substitute the default.
pub fn open_exclusive(path: &Path, write: bool) -> Result<(File, FileGeometry, FileLock)> {
    let mut options = OpenOptions::new();
    options.read(true).write(write);

    #[cfg(windows)]
    {
        use std::os::windows::fs::OpenOptionsExt;
        options.share_mode(0); // do not share
    }

    let file = options
        .open(path)
        .map_err(|e| SparseError::from_open(path, e))?;

    let lock = platform::lock_exclusive(&file, path)?;

    let meta = file.metadata().map_err(|e| SparseError::io_at(0, e))?;
    let stamps = platform::get_timestamps(&file).map_err(|e| SparseError::io_at(0, e))?;
    let cluster_size = platform::query_cluster_size(&file);

    Ok((
        file,
        FileGeometry {
            size: meta.len(),
            cluster_size,
            stamps,
        },
        lock,
    ))
}

/// Resolves the cluster size a pipeline will run at.
///
/// Zero (discovery failed) substitutes [`DEFAULT_CLUSTER_SIZE`] with a
/// notice; anything below [`MIN_CLUSTER_SIZE`] or not a power of two is
/// rejected.
pub fn resolve_cluster_size(reported: u64) -> Result<u64> {
    if reported == 0 {
        displaylevel!(
            2,
            "Unable to determine cluster size of file system. \
             Using default cluster size: {}\n",
            DEFAULT_CLUSTER_SIZE
        );
        return Ok(DEFAULT_CLUSTER_SIZE);
    }
    if reported < MIN_CLUSTER_SIZE || !reported.is_power_of_two() {
        return Err(SparseError::InvalidArgument(
            "filesystem cluster size is not a power of two >= 512",
        ));
    }
    Ok(reported)
}
