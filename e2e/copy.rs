//! End-to-end copy scenarios: `copy_sparse` against real temp files. The
//! core contract is byte-for-byte identity of the output plus holes where
//! the input was zero; hole assertions rely only on never-written regions,
//! so they hold wherever sparse files exist at all.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use sparsetools::copy::{copy_sparse, CopySparseOpts};
use sparsetools::display::set_display_level;
use sparsetools::{EngineConfig, SparseError};

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

/// Deterministic non-zero pseudo-random bytes.
fn patterned(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) % 255 + 1) as u8
        })
        .collect()
}

// ── Identity ──────────────────────────────────────────────────────────────────

#[test]
fn copy_reproduces_the_input_exactly() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("dst.bin");

    // Data, hole, data, hole, data-runt.
    let mut data = vec![0u8; (7 * c + 1234) as usize];
    data[..c as usize].copy_from_slice(&patterned(c as usize, 1));
    data[(3 * c) as usize..(5 * c) as usize].copy_from_slice(&patterned(2 * c as usize, 2));
    let runt_at = (7 * c) as usize;
    data[runt_at..].copy_from_slice(&patterned(1234, 3));
    fs::write(&src, &data).unwrap();

    let report = copy_sparse(&src, &dst, &quiet_opts()).unwrap();

    assert_eq!(report.bytes_read, data.len() as u64);
    assert_eq!(fs::metadata(&dst).unwrap().len(), data.len() as u64);
    assert_eq!(fs::read(&dst).unwrap(), data);
    // Exactly the non-zero regions were written.
    assert_eq!(report.bytes_written, 3 * c + 1234);
}

// ── Scenario: all zeros ───────────────────────────────────────────────────────

#[test]
fn all_zero_input_allocates_nothing() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let src = dir.path().join("zeros_src.bin");
    let dst = dir.path().join("zeros_dst.bin");

    let size = 256 * c;
    fs::write(&src, vec![0u8; size as usize]).unwrap();

    let report = copy_sparse(&src, &dst, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_read, size);
    assert_eq!(report.bytes_written, 0);
    assert_eq!(fs::metadata(&dst).unwrap().len(), size);
    assert!(fs::read(&dst).unwrap().iter().all(|&b| b == 0));

    // Nothing was ever written, so nothing should be allocated.
    #[cfg(has_sparse_files)]
    assert_eq!(allocated_bytes(&dst), 0);
}

// ── Scenario: alternating clusters ────────────────────────────────────────────

#[test]
fn alternating_input_writes_exactly_the_data_clusters() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let src = dir.path().join("alt_src.bin");
    let dst = dir.path().join("alt_dst.bin");

    let mut data = vec![0u8; (8 * c) as usize];
    for k in (1u64..8).step_by(2) {
        let start = (k * c) as usize;
        data[start..start + c as usize].copy_from_slice(&patterned(c as usize, k));
    }
    fs::write(&src, &data).unwrap();

    let report = copy_sparse(&src, &dst, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_written, 4 * c);
    assert_eq!(fs::read(&dst).unwrap(), data);

    // The four zero clusters stay unallocated in the output.
    #[cfg(has_sparse_files)]
    assert!(allocated_bytes(&dst) <= 5 * c);
}

// ── Scenario: runt tail ───────────────────────────────────────────────────────

#[test]
fn data_cluster_with_zero_runt() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let src = dir.path().join("runt_src.bin");
    let dst = dir.path().join("runt_dst.bin");

    // First cluster data, the rest of the (short) file zero.
    let size = c + 1904;
    let mut data = vec![0u8; size as usize];
    data[..c as usize].copy_from_slice(&patterned(c as usize, 9));
    fs::write(&src, &data).unwrap();

    let report = copy_sparse(&src, &dst, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_written, c);
    assert_eq!(fs::metadata(&dst).unwrap().len(), size);
    assert_eq!(fs::read(&dst).unwrap(), data);
}

// ── Destination constraints ───────────────────────────────────────────────────

#[test]
fn pre_existing_destination_is_refused() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("dst.bin");
    fs::write(&src, &[1u8; 512]).unwrap();
    fs::write(&dst, b"already here").unwrap();

    assert!(matches!(
        copy_sparse(&src, &dst, &quiet_opts()),
        Err(SparseError::AlreadyExists(_))
    ));
    // The existing file is untouched.
    assert_eq!(fs::read(&dst).unwrap(), b"already here");
}

// ── Timestamps ────────────────────────────────────────────────────────────────

#[test]
fn destination_inherits_source_mtime() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.bin");
    let dst = dir.path().join("dst.bin");
    fs::write(&src, &[3u8; 4096]).unwrap();

    let old = filetime::FileTime::from_unix_time(
        filetime::FileTime::now().unix_seconds() - 7200,
        0,
    );
    filetime::set_file_mtime(&src, old).unwrap();

    copy_sparse(&src, &dst, &quiet_opts()).unwrap();

    let dst_mtime =
        filetime::FileTime::from_last_modification_time(&fs::metadata(&dst).unwrap());
    assert_eq!(dst_mtime.unix_seconds(), old.unix_seconds());
}

// ── Larger-than-pool streams ──────────────────────────────────────────────────

#[test]
fn copy_larger_than_the_in_flight_bound() {
    // 64 clusters through a 4-slot pool exercises pool recycling and the
    // read/write chaining under contention.
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let src = dir.path().join("large_src.bin");
    let dst = dir.path().join("large_dst.bin");

    let mut data = patterned((64 * c) as usize, 42);
    // Sprinkle zero clusters through the middle.
    for k in [5u64, 6, 7, 20, 33, 34, 60] {
        data[(k * c) as usize..((k + 1) * c) as usize].fill(0);
    }
    fs::write(&src, &data).unwrap();

    let report = copy_sparse(&src, &dst, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_written, (64 - 7) * c);
    assert_eq!(fs::read(&dst).unwrap(), data);
}
