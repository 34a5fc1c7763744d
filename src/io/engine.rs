//! Bounded-concurrency IO engine.
//!
//! A cooperative completion model: submitters draw a slot from the op pool
//! (blocking when `max_pending` ops are in flight), ops execute on a small
//! worker pool, and each completion runs a short handler that may submit a
//! dependent op or return the slot. The dispatcher thread stays in control
//! of ordering: dependent writes are only ever submitted from their read's
//! completion handler, and phase barriers are explicit [`IoEngine::drain`]
//! calls.
//!
//! Errors in completion context are fatal to the run: the first one is
//! latched, further submissions are suppressed, outstanding ops drain, and
//! the driver picks the error up after the barrier.

use std::fs::File;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::config::{DEFAULT_MAX_PENDING, MAX_WORKERS};
use crate::displaylevel;
use crate::error::{Result, SparseError};
use crate::io::op::{IoOp, OpKind, OpPool, OpSlot};
use crate::platform;
use crate::progress::Stats;

/// Completion handler. Receives the engine (to chain a dependent op) and
/// the completed op, and must eventually hand the op back via
/// [`IoEngine::complete`] or [`IoEngine::chain_write`].
pub type OpCallback = Box<dyn FnOnce(&IoEngine, IoOp) + Send + 'static>;

/// Engine sizing knobs.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Bound on in-flight ops; also the slot-pool capacity.
    pub max_pending: usize,
    /// Completion worker threads.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_pending: DEFAULT_MAX_PENDING,
            workers: num_cpus::get().clamp(1, MAX_WORKERS),
        }
    }
}

struct EngineState {
    pending: usize,
}

struct Inner {
    /// Read side; absent for the pipe pipeline, which fills buffers itself.
    source: Option<File>,
    /// Write/ioctl side. For the analyze pipeline this is the same file as
    /// `source` (a duplicated handle).
    target: File,
    workers: rayon::ThreadPool,
    pool: OpPool,
    state: Mutex<EngineState>,
    idle: Condvar,
    failed: AtomicBool,
    first_error: Mutex<Option<SparseError>>,
    stats: Stats,
}

/// Cheap-to-clone handle to the engine; completion handlers receive one to
/// chain dependent ops.
#[derive(Clone)]
pub struct IoEngine {
    inner: Arc<Inner>,
}

impl IoEngine {
    /// Builds an engine over the given files with `buf_size`-byte pooled
    /// buffers (one cluster per op).
    pub fn new(
        source: Option<File>,
        target: File,
        buf_size: usize,
        config: &EngineConfig,
    ) -> Result<IoEngine> {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(1))
            .thread_name(|i| format!("sparse-io-{i}"))
            .build()
            .map_err(|e| SparseError::Io {
                offset: 0,
                source: io::Error::other(e),
            })?;

        Ok(IoEngine {
            inner: Arc::new(Inner {
                source,
                target,
                workers,
                pool: OpPool::new(config.max_pending.max(1), buf_size),
                state: Mutex::new(EngineState { pending: 0 }),
                idle: Condvar::new(),
                failed: AtomicBool::new(false),
                first_error: Mutex::new(None),
                stats: Stats::default(),
            }),
        })
    }

    /// The write/ioctl-side file.
    pub fn target(&self) -> &File {
        &self.inner.target
    }

    /// Run statistics, updated on the completion path.
    pub fn stats(&self) -> &Stats {
        &self.inner.stats
    }

    /// Whether a fatal error has been latched. Dispatchers stop issuing new
    /// work once this turns true.
    pub fn failed(&self) -> bool {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Takes the first recorded error, if any. Call after a drain.
    pub fn take_error(&self) -> Option<SparseError> {
        self.inner.first_error.lock().unwrap().take()
    }

    // -- submission ---------------------------------------------------------

    /// Submits a read of exactly `len` bytes at `offset`. Blocks while the
    /// pool is exhausted; returns once the op is queued.
    pub fn submit_read(&self, offset: u64, len: usize, cb: OpCallback) {
        let slot = self.inner.pool.acquire();
        self.begin_op();
        self.spawn(
            IoOp {
                kind: OpKind::Read { offset, len },
                slot,
            },
            cb,
        );
    }

    /// Submits the set-sparse control op. The driver must drain before
    /// issuing any zero-range op so the attribute is in place first.
    pub fn submit_set_sparse(&self, cb: OpCallback) {
        let slot = self.inner.pool.acquire();
        self.begin_op();
        self.spawn(
            IoOp {
                kind: OpKind::SetSparse,
                slot,
            },
            cb,
        );
    }

    /// Submits a deallocate request for `[start, end)`.
    pub fn submit_set_zero_range(&self, start: u64, end: u64, cb: OpCallback) {
        let slot = self.inner.pool.acquire();
        self.begin_op();
        self.spawn(
            IoOp {
                kind: OpKind::SetZeroRange { start, end },
                slot,
            },
            cb,
        );
    }

    /// Turns a completed read into the dependent write of the same bytes at
    /// the same offset, reusing the read's slot and in-flight accounting.
    /// Only valid from the read's completion handler.
    pub fn chain_write(&self, op: IoOp, cb: OpCallback) {
        let (offset, len) = match op.kind {
            OpKind::Read { offset, len } => (offset, len),
            _ => {
                self.record_error(SparseError::InvalidArgument(
                    "chained write requires a completed read",
                ));
                self.complete(op);
                return;
            }
        };
        self.spawn(
            IoOp {
                kind: OpKind::Write { offset, len },
                slot: op.slot,
            },
            cb,
        );
    }

    /// Takes a slot for caller-side filling (pipe pipeline). Blocks while
    /// the pool is exhausted.
    pub fn acquire_slot(&self) -> OpSlot {
        self.inner.pool.acquire()
    }

    /// Returns an unused slot taken with [`IoEngine::acquire_slot`].
    pub fn release_slot(&self, slot: OpSlot) {
        self.inner.pool.release(slot);
    }

    /// Submits a write of `len` bytes from a caller-filled slot at `offset`.
    pub fn submit_filled_write(&self, slot: OpSlot, offset: u64, len: usize, cb: OpCallback) {
        self.begin_op();
        self.spawn(
            IoOp {
                kind: OpKind::Write { offset, len },
                slot,
            },
            cb,
        );
    }

    // -- completion ---------------------------------------------------------

    /// Finishes an op: the slot returns to the pool and the in-flight count
    /// drops, waking the drain barrier at zero.
    pub fn complete(&self, op: IoOp) {
        self.inner.pool.release(op.slot);
        let mut state = self.inner.state.lock().unwrap();
        state.pending -= 1;
        if state.pending == 0 {
            self.inner.idle.notify_all();
        }
    }

    /// Blocks until every submitted op has completed.
    pub fn drain(&self) {
        self.drain_with(|| {});
    }

    /// Blocks until idle, invoking `tick` periodically so the caller can
    /// emit progress while waiting.
    pub fn drain_with(&self, mut tick: impl FnMut()) {
        loop {
            {
                let state = self.inner.state.lock().unwrap();
                if state.pending == 0 {
                    return;
                }
                let _unused = self
                    .inner
                    .idle
                    .wait_timeout(state, Duration::from_millis(200))
                    .unwrap();
            }
            tick();
        }
    }

    // -- internals ----------------------------------------------------------

    fn begin_op(&self) {
        self.inner.state.lock().unwrap().pending += 1;
    }

    fn spawn(&self, op: IoOp, cb: OpCallback) {
        let engine = self.clone();
        self.inner.workers.spawn(move || run_op(engine, op, cb));
    }

    fn record_error(&self, err: SparseError) {
        displaylevel!(1, "sparse io error: {}\n", err);
        let mut first = self.inner.first_error.lock().unwrap();
        if first.is_none() {
            *first = Some(err);
        }
        self.inner.failed.store(true, Ordering::Relaxed);
    }
}

/// Executes one op on a worker and routes its completion.
fn run_op(engine: IoEngine, mut op: IoOp, cb: OpCallback) {
    // After a fatal error the run is over; retire remaining ops unexecuted.
    if engine.failed() {
        engine.complete(op);
        return;
    }

    let inner = &engine.inner;
    let result: Result<()> = match op.kind {
        OpKind::Read { offset, len } => match inner.source.as_ref() {
            Some(src) => match platform::pread_full(src, &mut op.slot.buf[..len], offset) {
                // The dispatcher issues exact lengths (the EOF runt
                // included), so any residual short count is an error.
                Ok(n) if n == len => {
                    inner.stats.add_read(len as u64);
                    Ok(())
                }
                Ok(n) => Err(SparseError::ShortTransfer {
                    offset: offset + n as u64,
                }),
                Err(e) => Err(SparseError::io_at(offset, e)),
            },
            None => Err(SparseError::InvalidArgument(
                "read submitted to an engine without a source file",
            )),
        },
        OpKind::Write { offset, len } => {
            platform::pwrite_full(&inner.target, &op.slot.buf[..len], offset)
                .map(|()| inner.stats.add_written(len as u64))
                .map_err(|e| SparseError::io_at(offset, e))
        }
        OpKind::SetSparse => platform::set_sparse(&inner.target),
        OpKind::SetZeroRange { start, end } => platform::punch_hole(&inner.target, start, end)
            .map(|()| inner.stats.add_zeroed(end - start)),
    };

    match result {
        Ok(()) => cb(&engine, op),
        Err(err) => {
            engine.record_error(err);
            engine.complete(op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex as StdMutex;
    use tempfile::NamedTempFile;

    fn small_config() -> EngineConfig {
        EngineConfig {
            max_pending: 4,
            workers: 2,
        }
    }

    fn pattern_file(len: usize) -> (NamedTempFile, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        (tmp, data)
    }

    #[test]
    fn reads_complete_with_data_and_stats() {
        let (tmp, data) = pattern_file(4 * 4096);
        let source = tmp.reopen().unwrap();
        let target = tmp.reopen().unwrap();
        let engine = IoEngine::new(Some(source), target, 4096, &small_config()).unwrap();

        let seen = Arc::new(StdMutex::new(Vec::new()));
        for k in 0..4u64 {
            let seen = Arc::clone(&seen);
            let expected = data[(k as usize) * 4096..(k as usize + 1) * 4096].to_vec();
            engine.submit_read(
                k * 4096,
                4096,
                Box::new(move |engine, op| {
                    assert_eq!(op.data(), &expected[..]);
                    seen.lock().unwrap().push(op.offset());
                    engine.complete(op);
                }),
            );
        }
        engine.drain();

        assert!(engine.take_error().is_none());
        assert_eq!(engine.stats().bytes_read(), 4 * 4096);
        let mut offsets = seen.lock().unwrap().clone();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 4096, 8192, 12288]);
    }

    #[test]
    fn short_read_is_fatal() {
        let (tmp, _data) = pattern_file(6000);
        let source = tmp.reopen().unwrap();
        let target = tmp.reopen().unwrap();
        let engine = IoEngine::new(Some(source), target, 4096, &small_config()).unwrap();

        // 4096 bytes requested at 4096 with only 1904 available.
        engine.submit_read(
            4096,
            4096,
            Box::new(|engine, op| engine.complete(op)),
        );
        engine.drain();

        match engine.take_error() {
            Some(SparseError::ShortTransfer { offset }) => assert_eq!(offset, 6000),
            other => panic!("expected ShortTransfer, got {other:?}"),
        }
        assert!(engine.failed());
    }

    #[test]
    fn chained_writes_copy_bytes() {
        let (src_tmp, data) = pattern_file(3 * 4096);
        let dst_tmp = NamedTempFile::new().unwrap();
        let source = src_tmp.reopen().unwrap();
        let target = dst_tmp.reopen().unwrap();
        let engine = IoEngine::new(Some(source), target, 4096, &small_config()).unwrap();

        for k in 0..3u64 {
            engine.submit_read(
                k * 4096,
                4096,
                Box::new(|engine, op| {
                    engine.chain_write(op, Box::new(|engine, op| engine.complete(op)));
                }),
            );
        }
        engine.drain();

        assert!(engine.take_error().is_none());
        assert_eq!(engine.stats().bytes_written(), 3 * 4096);
        assert_eq!(std::fs::read(dst_tmp.path()).unwrap(), data);
    }

    #[test]
    fn filled_writes_land_at_their_offset() {
        let dst_tmp = NamedTempFile::new().unwrap();
        let target = dst_tmp.reopen().unwrap();
        let engine = IoEngine::new(None, target, 4096, &small_config()).unwrap();

        let mut slot = engine.acquire_slot();
        slot.buf[..4].copy_from_slice(b"data");
        engine.submit_filled_write(
            slot,
            8192,
            4,
            Box::new(|engine, op| engine.complete(op)),
        );
        engine.drain();

        assert!(engine.take_error().is_none());
        let contents = std::fs::read(dst_tmp.path()).unwrap();
        assert_eq!(contents.len(), 8196);
        assert_eq!(&contents[8192..], b"data");
    }

    #[test]
    fn submission_respects_the_in_flight_bound() {
        // More submissions than slots: the dispatcher must block and
        // recover as completions release slots, finishing all reads.
        let (tmp, _data) = pattern_file(32 * 4096);
        let source = tmp.reopen().unwrap();
        let target = tmp.reopen().unwrap();
        let config = EngineConfig {
            max_pending: 2,
            workers: 2,
        };
        let engine = IoEngine::new(Some(source), target, 4096, &config).unwrap();

        for k in 0..32u64 {
            engine.submit_read(
                k * 4096,
                4096,
                Box::new(|engine, op| engine.complete(op)),
            );
        }
        engine.drain();

        assert!(engine.take_error().is_none());
        assert_eq!(engine.stats().bytes_read(), 32 * 4096);
    }

    #[test]
    fn read_without_source_is_invalid() {
        let dst_tmp = NamedTempFile::new().unwrap();
        let target = dst_tmp.reopen().unwrap();
        let engine = IoEngine::new(None, target, 4096, &small_config()).unwrap();

        engine.submit_read(0, 4096, Box::new(|engine, op| engine.complete(op)));
        engine.drain();
        assert!(matches!(
            engine.take_error(),
            Some(SparseError::InvalidArgument(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn zero_range_deallocates_or_reports_unsupported() {
        let (tmp, _data) = pattern_file(4 * 4096);
        let target = tmp.reopen().unwrap();
        let engine = IoEngine::new(None, target, 4096, &small_config()).unwrap();

        engine.submit_set_sparse(Box::new(|engine, op| engine.complete(op)));
        engine.drain();
        assert!(engine.take_error().is_none());

        engine.submit_set_zero_range(0, 8192, Box::new(|engine, op| engine.complete(op)));
        engine.drain();

        match engine.take_error() {
            None => {
                assert_eq!(engine.stats().bytes_zeroed(), 8192);
                let contents = std::fs::read(tmp.path()).unwrap();
                assert!(contents[..8192].iter().all(|&b| b == 0));
            }
            Some(SparseError::UnsupportedFilesystem) => {}
            Some(other) => panic!("unexpected error: {other:?}"),
        }
    }
}
