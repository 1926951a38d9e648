//! Memory management for page buffers.
//!
//! - **Aligned allocation**: native page buffers aligned for positional I/O
//! - **Buffer allocator**: size-bucketed pool that recycles page buffers
//!   between evicted and newly loaded pages

mod aligned;
mod pool;

pub use aligned::AlignedBuffer;
pub use pool::{AllocatorStats, BufferAllocator};
