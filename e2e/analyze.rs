//! End-to-end analyze scenarios: library-level `make_sparse` runs over real
//! temp files, checking the bitmap-to-range behavior and that file contents
//! survive hole punching byte for byte.
//!
//! Cluster-size-dependent inputs are built relative to the filesystem's
//! reported allocation unit so the scenarios hold on any cluster size, not
//! just 4096. Punch support is probed by outcome: a filesystem that refuses
//! deallocation skips the affected assertions.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use sparsetools::analyze::{make_sparse, MakeSparseOpts};
use sparsetools::display::set_display_level;
use sparsetools::{EngineConfig, SparseError, ZeroRange};

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

/// Allocation unit of the filesystem backing `dir`, as the pipelines will
/// resolve it.
fn fs_cluster(dir: &TempDir) -> u64 {
    let probe = dir.path().join("__cluster_probe");
    fs::write(&probe, b"x").unwrap();
    let file = fs::File::open(&probe).unwrap();
    let reported = sparsetools::platform::query_cluster_size(&file);
    fs::remove_file(&probe).unwrap();
    if reported >= 512 && reported.is_power_of_two() {
        reported
    } else {
        4096
    }
}

#[cfg(unix)]
fn allocated_bytes(path: &Path) -> u64 {
    use std::os::unix::fs::MetadataExt;
    fs::metadata(path).unwrap().blocks() * 512
}

// ── Scenario: all zeros ───────────────────────────────────────────────────────

#[test]
fn all_zero_file_collapses_to_one_range() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let size = 256 * c;
    let path = dir.path().join("zeros.bin");
    fs::write(&path, vec![0u8; size as usize]).unwrap();

    let report = match make_sparse(&path, &quiet_opts()) {
        Ok(r) => r,
        Err(SparseError::UnsupportedFilesystem) => return,
        Err(e) => panic!("make_sparse failed: {e:?}"),
    };

    assert_eq!(report.bytes_read, size);
    assert_eq!(report.zero_ranges, vec![ZeroRange { start: 0, end: size }]);
    assert_eq!(report.bytes_zeroed, size);

    // Logical size and contents unchanged.
    assert_eq!(fs::metadata(&path).unwrap().len(), size);
    assert!(fs::read(&path).unwrap().iter().all(|&b| b == 0));

    #[cfg(has_sparse_files)]
    assert!(
        allocated_bytes(&path) < size,
        "deallocation should have released storage"
    );
}

// ── Scenario: dense data ──────────────────────────────────────────────────────

#[test]
fn dense_file_emits_no_ranges() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let size = 3 * c;
    let path = dir.path().join("dense.bin");
    let data: Vec<u8> = (0..size).map(|i| (i % 255 + 1) as u8).collect();
    fs::write(&path, &data).unwrap();

    let report = make_sparse(&path, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_read, size);
    assert!(report.zero_ranges.is_empty());
    assert_eq!(report.bytes_zeroed, 0);
    assert_eq!(fs::read(&path).unwrap(), data);
}

// ── Scenario: alternating clusters ────────────────────────────────────────────

#[test]
fn alternating_clusters_emit_one_range_each() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let path = dir.path().join("alternating.bin");

    // Even clusters zero, odd clusters non-zero, 8 clusters.
    let mut data = vec![0u8; (8 * c) as usize];
    for k in (1u64..8).step_by(2) {
        let start = (k * c) as usize;
        data[start..start + c as usize].fill(0x5A);
    }
    fs::write(&path, &data).unwrap();

    let report = match make_sparse(&path, &quiet_opts()) {
        Ok(r) => r,
        Err(SparseError::UnsupportedFilesystem) => return,
        Err(e) => panic!("make_sparse failed: {e:?}"),
    };

    let expected: Vec<ZeroRange> = (0u64..8)
        .step_by(2)
        .map(|k| ZeroRange {
            start: k * c,
            end: (k + 1) * c,
        })
        .collect();
    assert_eq!(report.zero_ranges, expected);
    assert_eq!(fs::read(&path).unwrap(), data);
}

// ── Scenario: solitary zero runt ──────────────────────────────────────────────

#[test]
fn solitary_zero_runt_is_left_alone() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let path = dir.path().join("runt.bin");

    // One data cluster plus a zero runt of just under half a cluster.
    let size = c + c / 2 - 144;
    let mut data = vec![0u8; size as usize];
    data[..c as usize].fill(0xEE);
    fs::write(&path, &data).unwrap();

    let report = make_sparse(&path, &quiet_opts()).unwrap();
    assert!(report.zero_ranges.is_empty());
    assert_eq!(fs::metadata(&path).unwrap().len(), size);
    assert_eq!(fs::read(&path).unwrap(), data);
}

// ── Scenario: zero runt attached to a zero run ────────────────────────────────

#[test]
fn zero_runt_extends_the_trailing_range() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let path = dir.path().join("runt_run.bin");

    let size = 2 * c + 808;
    fs::write(&path, vec![0u8; size as usize]).unwrap();

    let report = match make_sparse(&path, &quiet_opts()) {
        Ok(r) => r,
        Err(SparseError::UnsupportedFilesystem) => return,
        Err(e) => panic!("make_sparse failed: {e:?}"),
    };

    assert_eq!(report.zero_ranges, vec![ZeroRange { start: 0, end: size }]);
    assert_eq!(fs::metadata(&path).unwrap().len(), size);
}

// ── Timestamp preservation ────────────────────────────────────────────────────

#[test]
fn preserve_times_restores_modification_time() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let path = dir.path().join("stamped.bin");
    fs::write(&path, vec![0xAB; c as usize]).unwrap();

    // Age the file by an hour.
    let old = filetime::FileTime::from_unix_time(
        filetime::FileTime::now().unix_seconds() - 3600,
        0,
    );
    filetime::set_file_mtime(&path, old).unwrap();

    let opts = MakeSparseOpts {
        preserve_times: true,
        ..quiet_opts()
    };
    make_sparse(&path, &opts).unwrap();

    let mtime = filetime::FileTime::from_last_modification_time(&fs::metadata(&path).unwrap());
    assert_eq!(mtime.unix_seconds(), old.unix_seconds());
}

// ── Universal invariants ──────────────────────────────────────────────────────

#[test]
fn bytes_read_never_exceeds_file_size() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let path = dir.path().join("invariant.bin");
    let size = 5 * c + 123;
    fs::write(&path, vec![1u8; size as usize]).unwrap();

    let report = make_sparse(&path, &quiet_opts()).unwrap();
    assert!(report.bytes_read <= report.file_size);
    assert_eq!(report.bytes_read, size);
}

#[test]
fn marked_clusters_correspond_to_zero_regions() {
    // Mixed file: ranges report only regions that really were zero.
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let path = dir.path().join("mixed.bin");

    let mut data = vec![0u8; (6 * c) as usize];
    data[(2 * c) as usize..(3 * c) as usize].fill(9);
    data[(5 * c) as usize..(5 * c + 7) as usize].fill(1);
    fs::write(&path, &data).unwrap();

    let report = match make_sparse(&path, &quiet_opts()) {
        Ok(r) => r,
        Err(SparseError::UnsupportedFilesystem) => return,
        Err(e) => panic!("make_sparse failed: {e:?}"),
    };

    for r in &report.zero_ranges {
        assert!(data[r.start as usize..r.end as usize].iter().all(|&b| b == 0));
    }
    assert_eq!(
        report.zero_ranges,
        vec![
            ZeroRange { start: 0, end: 2 * c },
            ZeroRange { start: 3 * c, end: 5 * c },
        ]
    );
}
