//! IO op records and the fixed-capacity slot pool.
//!
//! Every in-flight operation owns one [`OpSlot`] drawn from the pool. The
//! pool is a bounded channel pre-filled with `capacity` slots, which makes
//! it double as the counting semaphore bounding in-flight IO: acquisition
//! blocks until a completion returns a slot, and because releases are
//! counted there is no lost-wakeup window. Release never blocks; the
//! channel capacity equals the number of slots in existence.

use aligned_vec::{AVec, ConstAlign};
use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::PAGE_ALIGN;

/// Page-aligned IO buffer.
pub type AlignedBuf = AVec<u8, ConstAlign<PAGE_ALIGN>>;

/// Allocates a zeroed page-aligned buffer of `size` bytes.
pub fn alloc_page_aligned(size: usize) -> AlignedBuf {
    AVec::from_iter(PAGE_ALIGN, std::iter::repeat_n(0u8, size))
}

/// One pooled slot: the aligned buffer an op reads into or writes from.
pub struct OpSlot {
    pub buf: AlignedBuf,
}

/// What an in-flight op is doing. Offsets and lengths are bound at submit
/// time; READ/WRITE use the slot buffer, the control ops ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read { offset: u64, len: usize },
    Write { offset: u64, len: usize },
    SetSparse,
    SetZeroRange { start: u64, end: u64 },
}

/// An in-flight operation record: a kind plus the slot it owns. The engine
/// owns the op from submit until its completion handler returns the slot.
pub struct IoOp {
    pub kind: OpKind,
    pub(crate) slot: OpSlot,
}

impl IoOp {
    /// The payload bytes of a READ or WRITE op.
    ///
    /// Empty for the control ops, which carry no buffer contents.
    pub fn data(&self) -> &[u8] {
        match self.kind {
            OpKind::Read { len, .. } | OpKind::Write { len, .. } => &self.slot.buf[..len],
            OpKind::SetSparse | OpKind::SetZeroRange { .. } => &[],
        }
    }

    /// Byte offset the op targets.
    pub fn offset(&self) -> u64 {
        match self.kind {
            OpKind::Read { offset, .. } | OpKind::Write { offset, .. } => offset,
            OpKind::SetSparse => 0,
            OpKind::SetZeroRange { start, .. } => start,
        }
    }
}

/// Fixed pool of pre-allocated slots, sized to the in-flight bound.
pub struct OpPool {
    tx: Sender<OpSlot>,
    rx: Receiver<OpSlot>,
}

impl OpPool {
    /// Builds a pool of `capacity` slots with `buf_size`-byte aligned
    /// buffers.
    pub fn new(capacity: usize, buf_size: usize) -> OpPool {
        let (tx, rx) = bounded(capacity);
        for _ in 0..capacity {
            tx.send(OpSlot {
                buf: alloc_page_aligned(buf_size),
            })
            .expect("slot channel sized to capacity");
        }
        OpPool { tx, rx }
    }

    /// Takes a slot, blocking until one is available.
    pub fn acquire(&self) -> OpSlot {
        self.rx.recv().expect("slot channel closed")
    }

    /// Returns a slot. Never blocks; capacity matches the slot count.
    pub fn release(&self, slot: OpSlot) {
        self.tx.send(slot).expect("slot channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn aligned_buffers_are_page_aligned_and_zeroed() {
        let buf = alloc_page_aligned(8192);
        assert_eq!(buf.as_ptr() as usize % PAGE_ALIGN, 0);
        assert_eq!(buf.len(), 8192);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn op_data_covers_kind_length() {
        let mut slot = OpSlot {
            buf: alloc_page_aligned(4096),
        };
        slot.buf[0] = 0xAB;
        let op = IoOp {
            kind: OpKind::Read {
                offset: 8192,
                len: 100,
            },
            slot,
        };
        assert_eq!(op.data().len(), 100);
        assert_eq!(op.data()[0], 0xAB);
        assert_eq!(op.offset(), 8192);
    }

    #[test]
    fn control_ops_carry_no_data() {
        let op = IoOp {
            kind: OpKind::SetZeroRange {
                start: 4096,
                end: 8192,
            },
            slot: OpSlot {
                buf: alloc_page_aligned(16),
            },
        };
        assert!(op.data().is_empty());
        assert_eq!(op.offset(), 4096);
    }

    #[test]
    fn pool_blocks_when_exhausted_and_wakes_on_release() {
        let pool = Arc::new(OpPool::new(2, 64));
        let a = pool.acquire();
        let _b = pool.acquire();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let slot = pool.acquire();
                pool.release(slot);
            })
        };

        // The waiter cannot finish until a slot is returned.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        pool.release(a);
        waiter.join().unwrap();
    }
}
