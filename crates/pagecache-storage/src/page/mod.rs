//! Pages and their tables.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │   PagesTable (one per storage)               │
//! │   open addressing, index -> Arc<Page>        │
//! └──────────────────────────────────────────────┘
//!                      │
//!                      ▼
//! ┌──────────────────────────────────────────────┐
//! │   Page                                       │
//! │   state+usage (AtomicU32), tokens, content,  │
//! │   modified region                            │
//! └──────────────────────────────────────────────┘
//!            │                        │
//!            ▼                        ▼
//! ┌─────────────────────┐  ┌─────────────────────┐
//! │  PageReadGuard      │  │  PageWriteGuard     │
//! │  (acquire/release)  │  │  (marks dirty)      │
//! └─────────────────────┘  └─────────────────────┘
//! ```

use std::io;

pub(crate) mod buffer;
mod guard;
#[allow(clippy::module_inception)]
mod page;
mod state;
pub(crate) mod table;

pub use guard::{PageReadGuard, PageWriteGuard};
pub(crate) use page::Page;
pub(crate) use page::Acquire;
pub use state::PageState;

/// Callbacks a page makes into the storage that owns it.
///
/// The page stores only the id of its storage; whoever operates on the page
/// passes the storage in as a handle.
pub(crate) trait PageToStorageHandle {
    /// The page went from clean to dirty.
    fn page_became_dirty(&self);

    /// The page went from dirty to clean.
    fn page_became_clean(&self);

    /// Bytes `[start, start + len)` of the file were modified in memory.
    fn modified_region_updated(&self, start_offset_in_file: u64, len: usize);

    /// Writes flushed page bytes at `offset_in_file`.
    fn flush_bytes(&self, data: &[u8], offset_in_file: u64) -> io::Result<()>;
}
