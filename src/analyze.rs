//! Analyze-and-punch pipeline: scan an existing file for zero clusters, mark
//! it sparse, and deallocate every zero run.
//!
//! Phase A reads the file cluster by cluster through the IO engine and marks
//! the bitmap from completion context. Phase B fences on the sparse
//! attribute, coalesces the bitmap into ranges, and dispatches the
//! deallocate batch. A final flush and optional timestamp restore close the
//! run.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::cluster_map::ClusterMap;
use crate::displaylevel;
use crate::error::{Result, SparseError};
use crate::io::{EngineConfig, IoEngine};
use crate::platform;
use crate::probe::{open_exclusive, resolve_cluster_size};
use crate::progress::{format_elapsed, mib, ProgressTimer};
use crate::ranges::{coalesce_zero_ranges, ZeroRange};
use crate::zero::is_zero_buf;

/// Options for [`make_sparse`].
#[derive(Debug, Clone, Copy)]
pub struct MakeSparseOpts {
    /// Restore access and modification timestamps after processing.
    pub preserve_times: bool,
    /// Print the cluster map to stdout after processing.
    pub print_map: bool,
    /// Suppress zero runs shorter than this many clusters.
    pub min_run_clusters: u64,
    pub engine: EngineConfig,
}

impl Default for MakeSparseOpts {
    fn default() -> Self {
        MakeSparseOpts {
            preserve_times: false,
            print_map: false,
            min_run_clusters: 1,
            engine: EngineConfig::default(),
        }
    }
}

/// Outcome of one analyze run.
#[derive(Debug)]
pub struct MakeSparseReport {
    pub file_size: u64,
    pub cluster_size: u64,
    pub bytes_read: u64,
    pub bytes_zeroed: u64,
    /// The deallocate ranges that were dispatched.
    pub zero_ranges: Vec<ZeroRange>,
}

/// Analyzes `path` and instructs the filesystem to deallocate its
/// cluster-aligned zero runs.
pub fn make_sparse(path: &Path, opts: &MakeSparseOpts) -> Result<MakeSparseReport> {
    let started = Instant::now();

    displaylevel!(2, "Opening file {}\n", path.display());
    // The lock guard stays alive until the run is over.
    let (file, geom, _lock) = open_exclusive(path, true)?;
    if geom.size == 0 {
        return Err(SparseError::InvalidArgument("file is empty"));
    }

    let cluster_size = resolve_cluster_size(geom.cluster_size)?;
    if geom.cluster_size != 0 {
        displaylevel!(2, "Cluster size: {}\n", cluster_size);
    }

    let map = Arc::new(ClusterMap::allocate(cluster_size, geom.size)?);
    let source = file.try_clone().map_err(|e| SparseError::io_at(0, e))?;
    let engine = IoEngine::new(Some(source), file, cluster_size as usize, &opts.engine)?;

    // -- Phase A: read every cluster, mark zero ones -------------------------
    displaylevel!(2, "Starting file analysis.\n");
    let zero_found = Arc::new(AtomicU64::new(0));
    let mut timer = ProgressTimer::default();
    let mut offset = 0u64;
    while offset < geom.size && !engine.failed() {
        let len = cluster_size.min(geom.size - offset) as usize;
        let map_cb = Arc::clone(&map);
        let zeros_cb = Arc::clone(&zero_found);
        engine.submit_read(
            offset,
            len,
            Box::new(move |engine, op| {
                // Covers whole clusters and the EOF runt alike: the
                // dispatcher issued the exact remaining length.
                if is_zero_buf(op.data()) {
                    map_cb.mark_zero(op.offset());
                    zeros_cb.fetch_add(op.data().len() as u64, Ordering::Relaxed);
                }
                engine.complete(op);
            }),
        );
        offset += len as u64;
        analyze_progress(&mut timer, &engine, &zero_found, geom.size);
    }
    engine.drain_with(|| analyze_progress(&mut timer, &engine, &zero_found, geom.size));
    if let Some(err) = engine.take_error() {
        return Err(err);
    }

    displaylevel!(
        2,
        "Completed file analysis. Starting to dispatch zero ranges to file system.\n"
    );

    // -- Phase B: sparse attribute (fenced), then the deallocate batch -------
    engine.submit_set_sparse(Box::new(|engine, op| engine.complete(op)));
    engine.drain();
    if let Some(err) = engine.take_error() {
        return Err(err);
    }

    let ranges = coalesce_zero_ranges(&map, cluster_size, geom.size, opts.min_run_clusters);
    engine
        .stats()
        .set_to_zero(ranges.iter().map(|r| r.len()).sum());

    for r in &ranges {
        if engine.failed() {
            break;
        }
        engine.submit_set_zero_range(r.start, r.end, Box::new(|engine, op| engine.complete(op)));
        punch_progress(&mut timer, &engine);
    }
    engine.drain_with(|| punch_progress(&mut timer, &engine));
    if let Some(err) = engine.take_error() {
        return Err(err);
    }

    displaylevel!(2, "Marking zero ranges complete.\n");

    // -- Epilogue: timestamps, flush, summary --------------------------------
    if opts.preserve_times && platform::set_timestamps(engine.target(), &geom.stamps).is_err() {
        displaylevel!(1, "WARNING: Failed to preserve file times on file.\n");
    }
    if let Err(e) = platform::flush(engine.target()) {
        displaylevel!(1, "WARNING: Failed to flush target file: {}\n", e);
    }

    displaylevel!(
        2,
        "Completed processing in: {}\n",
        format_elapsed(started.elapsed())
    );

    if opts.print_map {
        displaylevel!(2, "Printing sparse cluster map\n");
        let stdout = std::io::stdout();
        map.print(&mut stdout.lock())
            .map_err(|e| SparseError::io_at(0, e))?;
    }

    Ok(MakeSparseReport {
        file_size: geom.size,
        cluster_size,
        bytes_read: engine.stats().bytes_read(),
        bytes_zeroed: engine.stats().bytes_zeroed(),
        zero_ranges: ranges,
    })
}

fn analyze_progress(
    timer: &mut ProgressTimer,
    engine: &IoEngine,
    zero_found: &AtomicU64,
    file_size: u64,
) {
    if timer.due() {
        displaylevel!(
            2,
            "Analyzed: {:8.2} MiB of {:8.2} MiB. {:8.2} MiB of zero ranges found.\n",
            mib(engine.stats().bytes_read()),
            mib(file_size),
            mib(zero_found.load(Ordering::Relaxed))
        );
    }
}

fn punch_progress(timer: &mut ProgressTimer, engine: &IoEngine) {
    if timer.due() {
        displaylevel!(
            2,
            "Zeroed: {:8.2} MiB of {:8.2} MiB.\n",
            mib(engine.stats().bytes_zeroed()),
            mib(engine.stats().bytes_to_zero())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::set_display_level;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn quiet_opts() -> MakeSparseOpts {
        set_display_level(0);
        MakeSparseOpts {
            engine: EngineConfig {
                max_pending: 4,
                workers: 2,
            },
            ..MakeSparseOpts::default()
        }
    }

    #[test]
    fn empty_file_is_rejected() {
        let tmp = NamedTempFile::new().unwrap();
        assert!(matches!(
            make_sparse(tmp.path(), &quiet_opts()),
            Err(SparseError::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            make_sparse(&dir.path().join("absent"), &quiet_opts()),
            Err(SparseError::NotFound(_))
        ));
    }

    #[test]
    fn dense_file_reads_everything_and_punches_nothing() {
        let mut tmp = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..12288).map(|i| (i % 255 + 1) as u8).collect();
        tmp.write_all(&data).unwrap();

        let report = match make_sparse(tmp.path(), &quiet_opts()) {
            Ok(r) => r,
            Err(SparseError::UnsupportedFilesystem) => return,
            Err(e) => panic!("make_sparse failed: {e:?}"),
        };
        assert_eq!(report.bytes_read, 12288);
        assert!(report.zero_ranges.is_empty());
        assert_eq!(report.bytes_zeroed, 0);
        assert_eq!(std::fs::read(tmp.path()).unwrap(), data);
    }
}
