//! Reliable positional I/O channels.
//!
//! A storage reads and writes its pages through a [`ReliableChannel`]. The
//! channel owns retrying of transient failures; the page cache treats every
//! error it reports as final for that attempt.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        ReliableChannel Trait            │
//! │   (read_at, write_at, size, sync)       │
//! └─────────────────────────────────────────┘
//!              │                   │
//!              ▼                   ▼
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │   FileChannel       │  │   MemoryChannel     │
//! │   (pread/pwrite)    │  │   (Vec<u8>, faults) │
//! └─────────────────────┘  └─────────────────────┘
//! ```

mod channel;
mod memory;
mod std_file;

pub use channel::ReliableChannel;
pub use memory::MemoryChannel;
pub use std_file::FileChannel;
