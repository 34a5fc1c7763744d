//! Sparse-aware copy: read a source file cluster by cluster and write only
//! the non-zero clusters into a freshly created sparse destination.
//!
//! The destination is sized to the source before any data moves, so every
//! cluster that never receives a write stays a hole. Each read's dependent
//! write is chained from the read's completion handler, reusing the read's
//! buffer and in-flight slot.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::cluster_map::ClusterMap;
use crate::displaylevel;
use crate::error::{Result, SparseError};
use crate::io::{EngineConfig, IoEngine};
use crate::platform;
use crate::probe::{open_exclusive, resolve_cluster_size};
use crate::progress::{format_elapsed, mib, ProgressTimer};
use crate::zero::is_zero_buf;

/// Options for [`copy_sparse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CopySparseOpts {
    /// Print the source's zero-cluster map to stdout after the copy.
    pub print_map: bool,
    pub engine: EngineConfig,
}

/// Outcome of one copy run.
#[derive(Debug)]
pub struct CopyReport {
    pub file_size: u64,
    pub cluster_size: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Copies `src` into a new sparse file at `dst`.
///
/// `dst` must not exist (`AlreadyExists` otherwise). The destination's
/// logical size always equals the source's; zero clusters become holes.
/// Timestamps are copied from the source.
pub fn copy_sparse(src: &Path, dst: &Path, opts: &CopySparseOpts) -> Result<CopyReport> {
    let started = Instant::now();

    // The lock guard stays alive until the run is over.
    let (source, geom, _src_lock) = open_exclusive(src, false)?;
    let cluster_size = resolve_cluster_size(geom.cluster_size)?;
    if geom.cluster_size != 0 {
        displaylevel!(3, "Cluster size: {}\n", cluster_size);
    }

    let map = if opts.print_map {
        Some(Arc::new(ClusterMap::allocate(cluster_size, geom.size)?))
    } else {
        None
    };

    let target = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| SparseError::from_open(dst, e))?;

    let engine = IoEngine::new(Some(source), target, cluster_size as usize, &opts.engine)?;

    // Sparse attribute first, fenced, then size the destination so unwritten
    // regions exist as holes.
    engine.submit_set_sparse(Box::new(|engine, op| engine.complete(op)));
    engine.drain();
    if let Some(err) = engine.take_error() {
        return Err(err);
    }
    platform::set_file_size(engine.target(), geom.size)?;

    // Read dispatch; zero clusters release their slot, data clusters chain a
    // write of the same bytes at the same offset.
    let mut timer = ProgressTimer::default();
    let mut offset = 0u64;
    while offset < geom.size && !engine.failed() {
        let len = cluster_size.min(geom.size - offset) as usize;
        let map = map.clone();
        engine.submit_read(
            offset,
            len,
            Box::new(move |engine, op| {
                if is_zero_buf(op.data()) {
                    if let Some(map) = &map {
                        map.mark_zero(op.offset());
                    }
                    engine.complete(op);
                } else {
                    engine.chain_write(op, Box::new(|engine, op| engine.complete(op)));
                }
            }),
        );
        offset += len as u64;
        copy_progress(&mut timer, &engine, geom.size);
    }
    engine.drain_with(|| copy_progress(&mut timer, &engine, geom.size));
    if let Some(err) = engine.take_error() {
        return Err(err);
    }

    // Timestamps come from the source, then the flush closes the payload.
    if platform::set_timestamps(engine.target(), &geom.stamps).is_err() {
        displaylevel!(1, "WARNING: Failed to copy file times to target file.\n");
    }
    if let Err(e) = platform::flush(engine.target()) {
        displaylevel!(1, "WARNING: Failed to flush target file: {}\n", e);
    }

    let bytes_read = engine.stats().bytes_read();
    let bytes_written = engine.stats().bytes_written();
    displaylevel!(
        2,
        "Sparse file copy complete.\n\
         {:16} bytes read ({:.2} MiB)\n\
         {:16} bytes written ({:.2} MiB)\n\
         Completed processing in: {}\n",
        bytes_read,
        mib(bytes_read),
        bytes_written,
        mib(bytes_written),
        format_elapsed(started.elapsed())
    );

    if let Some(map) = &map {
        let stdout = std::io::stdout();
        map.print(&mut stdout.lock())
            .map_err(|e| SparseError::io_at(0, e))?;
    }

    Ok(CopyReport {
        file_size: geom.size,
        cluster_size,
        bytes_read,
        bytes_written,
    })
}

fn copy_progress(timer: &mut ProgressTimer, engine: &IoEngine, file_size: u64) {
    if timer.due() {
        displaylevel!(
            2,
            "Read: {:8.2} MiB of {:8.2} MiB; Written: {:8.2} MiB\n",
            mib(engine.stats().bytes_read()),
            mib(file_size),
            mib(engine.stats().bytes_written())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::set_display_level;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn quiet_opts() -> CopySparseOpts {
        set_display_level(0);
        CopySparseOpts {
            print_map: false,
            engine: EngineConfig {
                max_pending: 4,
                workers: 2,
            },
        }
    }

    #[test]
    fn existing_destination_is_rejected() {
        let mut src = NamedTempFile::new().unwrap();
        src.write_all(&[1u8; 4096]).unwrap();
        let dst = NamedTempFile::new().unwrap();

        assert!(matches!(
            copy_sparse(src.path(), dst.path(), &quiet_opts()),
            Err(SparseError::AlreadyExists(_))
        ));
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            copy_sparse(
                &dir.path().join("absent"),
                &dir.path().join("out"),
                &quiet_opts()
            ),
            Err(SparseError::NotFound(_))
        ));
    }

    #[test]
    fn copy_preserves_contents_and_logical_size() {
        let dir = TempDir::new().unwrap();
        let src_path = dir.path().join("src.bin");
        let dst_path = dir.path().join("dst.bin");

        // Data cluster, zero cluster, data runt.
        let mut data = vec![0u8; 4096 * 2 + 700];
        data[..4096].fill(0xAB);
        data[8192..].fill(0xCD);
        std::fs::write(&src_path, &data).unwrap();

        let report = copy_sparse(&src_path, &dst_path, &quiet_opts()).unwrap();
        assert_eq!(report.file_size, data.len() as u64);
        assert_eq!(report.bytes_read, data.len() as u64);
        // Only non-zero records were written; recompute the expectation at
        // whatever cluster size the filesystem reported.
        let expected_written: u64 = data
            .chunks(report.cluster_size as usize)
            .filter(|chunk| chunk.iter().any(|&b| b != 0))
            .map(|chunk| chunk.len() as u64)
            .sum();
        assert_eq!(report.bytes_written, expected_written);
        assert_eq!(std::fs::read(&dst_path).unwrap(), data);
    }

    #[test]
    fn empty_source_yields_empty_destination() {
        let dir = TempDir::new().unwrap();
        let src_path = dir.path().join("src.bin");
        let dst_path = dir.path().join("dst.bin");
        std::fs::write(&src_path, b"").unwrap();

        let report = copy_sparse(&src_path, &dst_path, &quiet_opts()).unwrap();
        assert_eq!(report.file_size, 0);
        assert_eq!(report.bytes_written, 0);
        assert_eq!(std::fs::metadata(&dst_path).unwrap().len(), 0);
    }
}
