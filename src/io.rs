//! Buffered async IO: the op pool and the bounded-concurrency engine.

pub mod engine;
pub mod op;

pub use engine::{EngineConfig, IoEngine, OpCallback};
pub use op::{alloc_page_aligned, AlignedBuf, IoOp, OpKind, OpPool, OpSlot};
