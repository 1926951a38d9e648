//! The page cache and its housekeeper.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         PageCache                           │
//! │  registry: path -> PagesTable      budget: native + heap    │
//! │  commands: SegQueue<CloseStorage>  reclaim queue (per turn) │
//! └─────────────────────────────────────────────────────────────┘
//!        │ allocate_page_buffer()               ▲ turn
//!        ▼                                      │
//! ┌──────────────────────┐          ┌──────────────────────────┐
//! │   BufferAllocator    │          │   Housekeeper thread     │
//! │  (pooled, aligned)   │          │  scan -> collect ->      │
//! └──────────────────────┘          │  flush -> publish ->     │
//!                                   │  reclaim                 │
//!                                   └──────────────────────────┘
//! ```
//!
//! Client threads never wait for the housekeeper: an allocation first
//! reclaims a few pages from the published queue, and if that does not free
//! enough native memory the page gets a heap buffer instead. The housekeeper
//! evicts pages until the total drops back under the capacity.

mod collector;
mod command;
mod housekeeper;
mod quantile;
mod stats;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_queue::SegQueue;
use pagecache_common::config::PageCacheConfig;
use pagecache_common::memory::{AllocatorStats, BufferAllocator};
use pagecache_common::{PageCacheError, PageCacheResult};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::page::buffer::PageBuffer;
use crate::page::table::PagesTable;
use crate::storage::StorageShared;

use collector::{ReclaimCandidate, ReclaimCollector};
pub(crate) use command::CloseStorageCommand;
pub use command::CloseFuture;
pub use stats::PageCacheStats;
use stats::StatsCounters;

/// Spawns the housekeeper thread: receives the thread name and its body.
pub type ThreadFactory = Arc<
    dyn Fn(String, Box<dyn FnOnce() + Send + 'static>) -> io::Result<JoinHandle<()>>
        + Send
        + Sync,
>;

/// Lifecycle of a page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    /// Being constructed.
    NotStarted = 0,
    /// Ready; the housekeeper starts with the first registered storage.
    WaitingForFirstRegistration = 1,
    /// The housekeeper is running.
    Working = 2,
    /// Shut down; no new storages can register.
    Closed = 3,
}

impl CacheState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::NotStarted,
            1 => Self::WaitingForFirstRegistration,
            2 => Self::Working,
            3 => Self::Closed,
            other => panic!("unknown cache state {other}"),
        }
    }
}

/// Outcome of one attempt to reclaim every page of a table.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReclaimAllOutcome {
    /// Some pages are still alive, usually because they are in use.
    pub(crate) pages_remaining: bool,
    /// Some dirty pages could not be written back.
    pub(crate) flush_failed: bool,
}

pub(crate) struct CacheInner {
    config: PageCacheConfig,
    allocator: BufferAllocator,
    /// Bytes held in native (pooled) page buffers.
    native_bytes: AtomicU64,
    /// Bytes held in heap page buffers allocated over capacity.
    heap_bytes: AtomicU64,
    /// Pages table of every open storage, by absolute path.
    registry: Mutex<HashMap<PathBuf, Arc<PagesTable>>>,
    /// Candidates published by the last turn; replaced wholesale.
    reclaim_queue: RwLock<Arc<SegQueue<ReclaimCandidate>>>,
    commands: SegQueue<CloseStorageCommand>,
    state: AtomicU8,
    /// Also held (briefly) to unpark the thread.
    housekeeper: Mutex<Option<JoinHandle<()>>>,
    /// `None` for a manual cache, which runs no thread.
    thread_factory: Option<ThreadFactory>,
    /// Serializes housekeeping turns.
    collector: Mutex<ReclaimCollector>,
    stats: StatsCounters,
}

/// A bounded cache of file pages shared by many storages.
///
/// Cloning is cheap; all clones refer to the same cache.
///
/// # Example
///
/// ```rust
/// use pagecache_common::config::{PageCacheConfig, StorageConfig};
/// use pagecache_storage::{MemoryChannel, PageCache, PagedStorage};
///
/// let cache = PageCache::manual(PageCacheConfig::for_testing()).unwrap();
/// let channel = MemoryChannel::new("doc.bin");
/// let storage =
///     PagedStorage::with_channel(Box::new(channel), StorageConfig::new(4096), &cache).unwrap();
/// storage.put_int(0, 7).unwrap();
/// cache.run_maintenance_turn();
/// assert_eq!(storage.get_int(0).unwrap(), 7);
/// storage.close().unwrap();
/// ```
#[derive(Clone)]
pub struct PageCache {
    inner: Arc<CacheInner>,
}

impl PageCache {
    /// Creates a cache whose housekeeper runs on a dedicated thread, started
    /// when the first storage registers.
    pub fn new(config: PageCacheConfig) -> PageCacheResult<Self> {
        let factory: ThreadFactory = Arc::new(|name, body| {
            thread::Builder::new().name(name).spawn(body)
        });
        Self::build(config, Some(factory))
    }

    /// Creates a cache whose housekeeper thread is spawned by `factory`.
    pub fn with_thread_factory(
        config: PageCacheConfig,
        factory: ThreadFactory,
    ) -> PageCacheResult<Self> {
        Self::build(config, Some(factory))
    }

    /// Creates a cache without a housekeeper thread. Housekeeping happens
    /// only when [`run_maintenance_turn`](Self::run_maintenance_turn) is called.
    pub fn manual(config: PageCacheConfig) -> PageCacheResult<Self> {
        Self::build(config, None)
    }

    fn build(config: PageCacheConfig, thread_factory: Option<ThreadFactory>) -> PageCacheResult<Self> {
        config.validate()?;
        let collector = ReclaimCollector::new(config.min_reclaim_percent, config.max_reclaim_percent);
        let inner = CacheInner {
            allocator: BufferAllocator::new(config.allocator.clone()),
            config,
            native_bytes: AtomicU64::new(0),
            heap_bytes: AtomicU64::new(0),
            registry: Mutex::new(HashMap::new()),
            reclaim_queue: RwLock::new(Arc::new(SegQueue::new())),
            commands: SegQueue::new(),
            state: AtomicU8::new(CacheState::NotStarted as u8),
            housekeeper: Mutex::new(None),
            thread_factory,
            collector: Mutex::new(collector),
            stats: StatsCounters::default(),
        };
        inner.set_state(CacheState::WaitingForFirstRegistration);
        debug!(
            capacity = inner.config.capacity_bytes,
            manual = inner.thread_factory.is_none(),
            "page cache created"
        );
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PageCacheConfig {
        &self.inner.config
    }

    /// Returns the capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.inner.config.capacity_bytes
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> CacheState {
        self.inner.state()
    }

    /// Returns true for a cache without a housekeeper thread.
    pub fn is_manual(&self) -> bool {
        self.inner.thread_factory.is_none()
    }

    /// Bytes held by cached pages, native and heap.
    pub fn resident_bytes(&self) -> u64 {
        self.inner.resident_bytes()
    }

    /// Number of storages currently registered.
    pub fn registered_storages(&self) -> usize {
        self.inner.registry.lock().len()
    }

    /// Returns a snapshot of the cache statistics.
    pub fn stats(&self) -> PageCacheStats {
        self.inner.stats.snapshot(
            self.inner.native_bytes.load(Ordering::Relaxed),
            self.inner.heap_bytes.load(Ordering::Relaxed),
        )
    }

    /// Returns a snapshot of the buffer pool statistics.
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.inner.allocator.stats()
    }

    /// Runs one housekeeping turn on the calling thread.
    ///
    /// Intended for manual caches; on a threaded cache it runs alongside the
    /// housekeeper, serialized with its turns.
    pub fn run_maintenance_turn(&self) {
        let mut collector = self.inner.collector.lock();
        self.inner.maintenance_turn(&mut collector);
        self.inner.stats.record_turn();
    }

    /// Shuts the cache down.
    ///
    /// Stops the housekeeper, gives pending storage closes one last attempt
    /// and releases pooled buffers. Storages should be closed first; a close
    /// that can't complete here fails with [`PageCacheError::CloseFailed`].
    pub fn close(&self) -> PageCacheResult<()> {
        let previous = self.inner.state.swap(CacheState::Closed as u8, Ordering::AcqRel);
        if CacheState::from_u8(previous) == CacheState::Closed {
            return Ok(());
        }

        let handle = self.inner.housekeeper.lock().take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!("page cache housekeeper panicked");
            }
        }

        let _collector = self.inner.collector.lock();
        while let Some(command) = self.inner.commands.pop() {
            self.inner.finish_close_on_shutdown(command);
        }
        self.inner.allocator.clear();
        info!(stats = %self.stats(), "page cache closed");
        Ok(())
    }

    // =========================================================================
    // Storage-facing operations
    // =========================================================================

    /// Registers a storage and returns its pages table.
    pub(crate) fn register(&self, storage: Arc<StorageShared>) -> PageCacheResult<Arc<PagesTable>> {
        let inner = &self.inner;
        let mut registry = inner.registry.lock();
        if inner.state() == CacheState::Closed {
            return Err(PageCacheError::CacheClosed);
        }
        let key = absolute_path(storage.path());
        if registry.contains_key(&key) {
            return Err(PageCacheError::AlreadyRegistered { path: key });
        }

        let table = Arc::new(PagesTable::new(storage));
        registry.insert(key.clone(), Arc::clone(&table));

        if inner.state() == CacheState::WaitingForFirstRegistration {
            if let Err(e) = self.start_housekeeper() {
                registry.remove(&key);
                return Err(e.into());
            }
            inner.set_state(CacheState::Working);
        }
        debug!(storage = %key.display(), "storage registered");
        Ok(table)
    }

    fn start_housekeeper(&self) -> io::Result<()> {
        let Some(factory) = &self.inner.thread_factory else {
            return Ok(());
        };
        let weak = Arc::downgrade(&self.inner);
        let handle = factory(
            self.inner.config.housekeeper_thread_name.clone(),
            Box::new(move || housekeeper::run(weak)),
        )?;
        *self.inner.housekeeper.lock() = Some(handle);
        Ok(())
    }

    /// Allocates a buffer for a page about to be loaded.
    pub(crate) fn allocate_page_buffer(&self, size: usize) -> PageBuffer {
        self.inner.allocate_page_buffer(size)
    }

    /// Returns the buffer of a page that failed to load.
    pub(crate) fn free_page_buffer(&self, buffer: PageBuffer) {
        self.inner.free_buffer(buffer);
    }

    /// Flushes and frees a PRE_TOMBSTONE page.
    pub(crate) fn reclaim_page(&self, page: &crate::page::Page, table: &PagesTable) -> io::Result<()> {
        self.inner.reclaim_page(page, table)
    }

    /// Tries to evict every page of `table`.
    pub(crate) fn try_reclaim_all(&self, table: &PagesTable) -> ReclaimAllOutcome {
        self.inner.try_reclaim_all(table)
    }

    /// Queues the cleanup of a closed storage.
    pub(crate) fn enqueue_close(&self, table: Arc<PagesTable>) -> CloseFuture {
        if self.inner.state() == CacheState::Closed {
            // nobody is left to process the command
            let outcome = self.inner.try_reclaim_all(&table);
            let result = if outcome.pages_remaining {
                Err(PageCacheError::CacheClosed)
            } else {
                self.inner.unregister(&table);
                Ok(())
            };
            return CloseFuture::completed(table.storage().path(), result);
        }
        let (command, future) = CloseStorageCommand::new(table);
        self.inner.commands.push(command);
        self.inner.wake_housekeeper();
        future
    }

    pub(crate) fn record_load(&self) {
        self.inner.stats.record_load();
    }

    pub(crate) fn record_acquire(&self) {
        self.inner.stats.record_acquire();
    }
}

impl fmt::Debug for PageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageCache")
            .field("state", &self.state())
            .field("capacity", &self.capacity_bytes())
            .field("resident", &self.resident_bytes())
            .field("storages", &self.registered_storages())
            .finish()
    }
}

fn absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match std::env::current_dir() {
        Ok(dir) => dir.join(path),
        Err(_) => path.to_path_buf(),
    }
}

impl CacheInner {
    fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CacheState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn resident_bytes(&self) -> u64 {
        self.native_bytes.load(Ordering::Relaxed) + self.heap_bytes.load(Ordering::Relaxed)
    }

    fn over_capacity(&self) -> bool {
        self.resident_bytes() > self.config.capacity_bytes
    }

    fn wake_housekeeper(&self) {
        if let Some(handle) = self.housekeeper.lock().as_ref() {
            handle.thread().unpark();
        }
    }

    fn unregister(&self, table: &Arc<PagesTable>) {
        let key = absolute_path(table.storage().path());
        let mut registry = self.registry.lock();
        if registry
            .get(&key)
            .is_some_and(|registered| Arc::ptr_eq(registered, table))
        {
            registry.remove(&key);
        }
    }

    fn allocate_page_buffer(&self, size: usize) -> PageBuffer {
        if self.try_reclaim_enough_pages(size) {
            let buffer = self.allocator.allocate(size);
            self.native_bytes
                .fetch_add(buffer.len() as u64, Ordering::Relaxed);
            self.stats.record_allocation(true);
            PageBuffer::Native(buffer)
        } else {
            self.heap_bytes.fetch_add(size as u64, Ordering::Relaxed);
            self.stats.record_allocation(false);
            PageBuffer::heap(size)
        }
    }

    /// Gives the buffer back and updates the budget. Returns true for a
    /// native buffer.
    fn free_buffer(&self, buffer: PageBuffer) -> bool {
        let capacity = buffer.capacity() as u64;
        match buffer {
            PageBuffer::Native(buffer) => {
                self.native_bytes.fetch_sub(capacity, Ordering::Relaxed);
                self.allocator.release(buffer);
                true
            }
            PageBuffer::Heap(_) => {
                self.heap_bytes.fetch_sub(capacity, Ordering::Relaxed);
                false
            }
        }
    }
}
