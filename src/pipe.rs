//! Streaming sparse writer: read an unbounded byte stream record by record
//! and write only the non-zero records into a freshly created sparse file.
//!
//! The reader side is synchronous (a pipe delivers bytes in order); writes
//! go through the engine so up to `max_pending` of them are in flight while
//! the next record is being filled. Zero records never touch the file, but
//! the output offset still advances past them, and a final set-size makes a
//! zero tail part of the logical length.

use std::fs::OpenOptions;
use std::io::{self, Read};
use std::path::Path;
use std::time::Instant;

use crate::displaylevel;
use crate::error::{Result, SparseError};
use crate::io::{EngineConfig, IoEngine};
use crate::platform;
use crate::probe::resolve_cluster_size;
use crate::progress::{format_elapsed, mib, ProgressTimer};
use crate::zero::is_zero_buf;

/// Options for [`pipe_sparse`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeSparseOpts {
    pub engine: EngineConfig,
}

/// Outcome of one pipe run.
#[derive(Debug)]
pub struct PipeReport {
    /// Total bytes consumed from the stream; equals the output's logical
    /// size.
    pub bytes_processed: u64,
    pub bytes_written: u64,
    pub cluster_size: u64,
}

/// Reads `input` until EOF (or broken pipe) and writes a sparse file at
/// `path`. The path must not exist.
pub fn pipe_sparse(input: &mut dyn Read, path: &Path, opts: &PipeSparseOpts) -> Result<PipeReport> {
    let started = Instant::now();

    let target = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| SparseError::from_open(path, e))?;

    let cluster_size = resolve_cluster_size(platform::query_cluster_size(&target))?;
    let engine = IoEngine::new(None, target, cluster_size as usize, &opts.engine)?;

    // Sparse attribute before the first write.
    engine.submit_set_sparse(Box::new(|engine, op| engine.complete(op)));
    engine.drain();
    if let Some(err) = engine.take_error() {
        return Err(err);
    }

    let mut timer = ProgressTimer::default();
    let mut processed = 0u64;
    loop {
        if engine.failed() {
            break;
        }

        let mut slot = engine.acquire_slot();
        let n = match fill_record(input, &mut slot.buf[..cluster_size as usize]) {
            Ok(n) => n,
            Err(e) => {
                engine.release_slot(slot);
                engine.drain();
                return Err(SparseError::io_at(processed, e));
            }
        };
        if n == 0 {
            engine.release_slot(slot);
            break;
        }

        if is_zero_buf(&slot.buf[..n]) {
            // No write: the region becomes a hole, but the output offset
            // still moves past it.
            engine.release_slot(slot);
        } else {
            engine.submit_filled_write(
                slot,
                processed,
                n,
                Box::new(|engine, op| engine.complete(op)),
            );
        }
        processed += n as u64;

        // A short record only happens at end of stream.
        if (n as u64) < cluster_size {
            break;
        }
        pipe_progress(&mut timer, &engine, processed);
    }
    engine.drain_with(|| pipe_progress(&mut timer, &engine, processed));
    if let Some(err) = engine.take_error() {
        return Err(err);
    }

    // The logical size must equal the processed byte count even when the
    // tail was all zeros and never written.
    let current = engine
        .target()
        .metadata()
        .map_err(|e| SparseError::io_at(processed, e))?
        .len();
    if current != processed {
        platform::set_file_size(engine.target(), processed)?;
    }

    if let Err(e) = platform::flush(engine.target()) {
        displaylevel!(1, "WARNING: Failed to flush target file: {}\n", e);
    }

    let bytes_written = engine.stats().bytes_written();
    displaylevel!(
        2,
        "Sparse stream write complete.\n\
         {:16} bytes processed ({:.2} MiB)\n\
         {:16} bytes written ({:.2} MiB)\n\
         Completed processing in: {}\n",
        processed,
        mib(processed),
        bytes_written,
        mib(bytes_written),
        format_elapsed(started.elapsed())
    );

    Ok(PipeReport {
        bytes_processed: processed,
        bytes_written,
        cluster_size,
    })
}

/// Fills `buf` from `reader`, retrying interrupts. EOF and a broken pipe
/// both end the stream; the byte count so far is returned.
fn fill_record(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0usize;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => break,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

fn pipe_progress(timer: &mut ProgressTimer, engine: &IoEngine, processed: u64) {
    if timer.due() {
        displaylevel!(
            2,
            "Processed: {:8.2} MiB; Written: {:8.2} MiB\n",
            mib(processed),
            mib(engine.stats().bytes_written())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::set_display_level;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn quiet_opts() -> PipeSparseOpts {
        set_display_level(0);
        PipeSparseOpts {
            engine: EngineConfig {
                max_pending: 4,
                workers: 2,
            },
        }
    }

    #[test]
    fn existing_path_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        std::fs::write(&path, b"taken").unwrap();

        let mut input = Cursor::new(vec![1u8; 100]);
        assert!(matches!(
            pipe_sparse(&mut input, &path, &quiet_opts()),
            Err(SparseError::AlreadyExists(_))
        ));
    }

    #[test]
    fn empty_stream_yields_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");
        let mut input = Cursor::new(Vec::new());

        let report = pipe_sparse(&mut input, &path, &quiet_opts()).unwrap();
        assert_eq!(report.bytes_processed, 0);
        assert_eq!(report.bytes_written, 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn stream_contents_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");

        let mut data = vec![0u8; 10000];
        for (i, b) in data.iter_mut().enumerate().skip(5000).take(3000) {
            *b = (i % 250 + 1) as u8;
        }
        let mut input = Cursor::new(data.clone());

        let report = pipe_sparse(&mut input, &path, &quiet_opts()).unwrap();
        assert_eq!(report.bytes_processed, data.len() as u64);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }

    #[test]
    fn zero_tail_still_extends_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.bin");

        let mut data = vec![7u8; 4096];
        data.extend_from_slice(&[0u8; 6000]);
        let mut input = Cursor::new(data.clone());

        let report = pipe_sparse(&mut input, &path, &quiet_opts()).unwrap();
        assert_eq!(report.bytes_processed, 10096);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 10096);
        assert_eq!(std::fs::read(&path).unwrap(), data);
    }
}
