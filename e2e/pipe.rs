//! End-to-end pipe scenarios: `pipe_sparse` fed from in-memory readers,
//! checking record-level hole skipping, the final set-size for zero tails,
//! and identity of the materialized stream.

use std::fs;
use std::io::Cursor;
use std::path::Path;

use tempfile::TempDir;

use sparsetools::display::set_display_level;
use sparsetools::pipe::{pipe_sparse, PipeSparseOpts};
use sparsetools::EngineConfig;

fn quiet_opts() -> PipeSparseOpts {
    set_display_level(0);
    PipeSparseOpts {
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

// ── Scenario: zero prefix, one data record ────────────────────────────────────

#[test]
fn zero_records_become_holes_before_the_data() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let out = dir.path().join("stream.bin");

    // Three zero records, then one record of data, then EOF.
    let mut data = vec![0u8; (4 * c) as usize];
    data[(3 * c) as usize..].fill(0x77);
    let mut input = Cursor::new(data.clone());

    let report = pipe_sparse(&mut input, &out, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_processed, 4 * c);
    assert_eq!(report.bytes_written, c);
    assert_eq!(fs::metadata(&out).unwrap().len(), 4 * c);
    assert_eq!(fs::read(&out).unwrap(), data);

    // The three skipped records were never written.
    #[cfg(has_sparse_files)]
    assert!(allocated_bytes(&out) <= 2 * c);
}

// ── Scenario: zero tail ───────────────────────────────────────────────────────

#[test]
fn zero_tail_is_materialized_by_set_size() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let out = dir.path().join("tail.bin");

    let mut data = vec![0x11u8; c as usize];
    data.extend_from_slice(&vec![0u8; (2 * c + 77) as usize]);
    let mut input = Cursor::new(data.clone());

    let report = pipe_sparse(&mut input, &out, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_processed, data.len() as u64);
    assert_eq!(report.bytes_written, c);
    // The zero tail never hit the disk, yet the logical size includes it.
    assert_eq!(fs::metadata(&out).unwrap().len(), data.len() as u64);
    assert_eq!(fs::read(&out).unwrap(), data);
}

// ── Scenario: all-zero stream ─────────────────────────────────────────────────

#[test]
fn all_zero_stream_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let out = dir.path().join("allzero.bin");

    let size = 32 * c + 5;
    let mut input = Cursor::new(vec![0u8; size as usize]);

    let report = pipe_sparse(&mut input, &out, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_processed, size);
    assert_eq!(report.bytes_written, 0);
    assert_eq!(fs::metadata(&out).unwrap().len(), size);

    #[cfg(has_sparse_files)]
    assert_eq!(allocated_bytes(&out), 0);
}

// ── Identity over a long mixed stream ─────────────────────────────────────────

#[test]
fn long_mixed_stream_round_trips() {
    let dir = TempDir::new().unwrap();
    let c = fs_cluster(&dir);
    let out = dir.path().join("mixed.bin");

    // 48 records with every third record zero, ending on a data runt.
    let mut data = Vec::with_capacity((48 * c + 300) as usize);
    for k in 0..48u64 {
        if k % 3 == 0 {
            data.extend(std::iter::repeat_n(0u8, c as usize));
        } else {
            data.extend((0..c).map(|i| ((k + i) % 254 + 1) as u8));
        }
    }
    data.extend(std::iter::repeat_n(0x42u8, 300));
    let mut input = Cursor::new(data.clone());

    let report = pipe_sparse(&mut input, &out, &quiet_opts()).unwrap();
    assert_eq!(report.bytes_processed, data.len() as u64);
    assert_eq!(fs::read(&out).unwrap(), data);
}
