//! A cached page.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use pagecache_common::constants::{MAX_PAGE_USAGE_COUNT, TOKENS_INITIALLY, TOKENS_PER_USE};
use pagecache_common::types::{PageIndex, StorageId};
use parking_lot::{Mutex, RwLock};

use super::buffer::PageBuffer;
use super::state::{PackedState, PageState};
use super::PageToStorageHandle;

const EMPTY_REGION: u64 = 0;

#[inline]
fn pack_region(min: usize, max: usize) -> u64 {
    ((max as u64) << 32) | min as u64
}

#[inline]
fn unpack_region(region: u64) -> (usize, usize) {
    ((region & 0xFFFF_FFFF) as usize, (region >> 32) as usize)
}

/// Outcome of an attempt to acquire a page for use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// The usage count was incremented; the caller must release the page.
    Acquired,
    /// Nobody has started loading the page yet.
    NotReady,
    /// Another thread is loading the page.
    Loading,
    /// The page is being evicted; `usage_count` users still hold it.
    AboutToUnmap { usage_count: u32 },
    /// The page is being flushed and freed.
    PreTombstone,
    /// The page is dead; look it up again.
    Tombstone,
}

/// A page of some storage, cached in memory.
///
/// Each page has:
/// - A lifecycle state and a usage count packed into one atomic word
/// - A content buffer, present only while the state allows it
/// - The modified byte range since the last flush
/// - Usefulness tokens consulted by the eviction policy
///
/// A page is owned by the pages table of its storage; it refers to the
/// storage only by id.
pub struct Page {
    index: PageIndex,
    page_size: usize,
    owner: StorageId,
    state: AtomicU32,
    content: RwLock<Option<PageBuffer>>,
    /// `[min, max)` of bytes modified since the last flush, packed as `max << 32 | min`.
    modified_region: AtomicU64,
    flush_lock: Mutex<()>,
    /// Serializes reclaim attempts of a PRE_TOMBSTONE page.
    reclaim_lock: Mutex<()>,
    tokens: AtomicI32,
}

impl Page {
    /// Creates a page in NOT_READY state.
    pub(crate) fn new(index: PageIndex, page_size: usize, owner: StorageId) -> Self {
        Self {
            index,
            page_size,
            owner,
            state: AtomicU32::new(PackedState::new(PageState::NotReady, 0).raw()),
            content: RwLock::new(None),
            modified_region: AtomicU64::new(EMPTY_REGION),
            flush_lock: Mutex::new(()),
            reclaim_lock: Mutex::new(()),
            tokens: AtomicI32::new(TOKENS_INITIALLY),
        }
    }

    /// Returns the page index.
    #[inline]
    pub fn index(&self) -> PageIndex {
        self.index
    }

    /// Returns the page size in bytes.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the id of the owning storage.
    #[inline]
    pub fn owner(&self) -> StorageId {
        self.owner
    }

    /// Returns the file offset of the first byte of the page.
    #[inline]
    pub fn offset_in_file(&self) -> u64 {
        self.index.offset_in_file(self.page_size)
    }

    /// Returns the current state.
    #[inline]
    pub fn state(&self) -> PageState {
        self.packed().state()
    }

    /// Returns the number of threads currently using the page.
    #[inline]
    pub fn usage_count(&self) -> u32 {
        self.packed().usage_count()
    }

    /// Returns true if the page holds modifications not yet written back.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.modified_region.load(Ordering::Acquire) != EMPTY_REGION
    }

    /// Returns true if the page is dead.
    #[inline]
    pub fn is_tombstone(&self) -> bool {
        self.state() == PageState::Tombstone
    }

    #[inline]
    fn packed(&self) -> PackedState {
        PackedState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn cas(&self, current: PackedState, new: PackedState) -> bool {
        self.state
            .compare_exchange_weak(current.raw(), new.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // =========================================================================
    // State transitions
    // =========================================================================

    /// Increments the usage count if the page is USABLE.
    pub(crate) fn try_acquire_for_use(&self) -> Acquire {
        loop {
            let current = self.packed();
            match current.state() {
                PageState::Usable => {
                    let usage_count = current.usage_count() + 1;
                    assert!(
                        usage_count <= MAX_PAGE_USAGE_COUNT,
                        "page {} has too many users ({usage_count}), a release is likely missing",
                        self.index
                    );
                    if self.cas(current, current.with_usage(usage_count)) {
                        return Acquire::Acquired;
                    }
                }
                PageState::NotReady => return Acquire::NotReady,
                PageState::Loading => return Acquire::Loading,
                PageState::AboutToUnmap => {
                    return Acquire::AboutToUnmap {
                        usage_count: current.usage_count(),
                    }
                }
                PageState::PreTombstone => return Acquire::PreTombstone,
                PageState::Tombstone => return Acquire::Tombstone,
            }
        }
    }

    /// Decrements the usage count and credits the page with usefulness.
    ///
    /// # Panics
    ///
    /// Panics if the page is not in use.
    pub(crate) fn release(&self) {
        loop {
            let current = self.packed();
            let state = current.state();
            assert!(
                matches!(state, PageState::Usable | PageState::AboutToUnmap),
                "page {} released in state {state}",
                self.index
            );
            let usage_count = current.usage_count();
            assert!(
                usage_count > 0,
                "page {} released with usage count 0, acquire/release are unpaired",
                self.index
            );
            if self.cas(current, current.with_usage(usage_count - 1)) {
                // usage_count <= 2^24, so the product fits an i32
                self.add_tokens(TOKENS_PER_USE * usage_count as i32);
                return;
            }
        }
    }

    /// Claims the right to load the page. Exactly one caller wins.
    pub(crate) fn try_start_loading(&self) -> bool {
        let not_ready = PackedState::new(PageState::NotReady, 0);
        self.state
            .compare_exchange(
                not_ready.raw(),
                PackedState::new(PageState::Loading, 0).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Installs the loaded content and publishes the page as USABLE.
    ///
    /// # Panics
    ///
    /// Panics if the page is not LOADING.
    pub(crate) fn finish_loading(&self, buffer: PageBuffer) {
        assert!(
            buffer.capacity() >= self.page_size,
            "buffer of {} bytes is too small for page {}",
            buffer.capacity(),
            self.index
        );
        {
            let mut content = self.content.write();
            assert!(content.is_none(), "page {} is loaded twice", self.index);
            *content = Some(buffer);
        }
        self.move_from_loading(PageState::Usable);
    }

    /// Marks a failed load. The page goes straight to TOMBSTONE and the next
    /// lookup creates a fresh page.
    pub(crate) fn abort_loading(&self) {
        self.move_from_loading(PageState::Tombstone);
    }

    fn move_from_loading(&self, target: PageState) {
        let loading = PackedState::new(PageState::Loading, 0);
        if let Err(actual) = self.state.compare_exchange(
            loading.raw(),
            PackedState::new(target, 0).raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "page {} must be LOADING to become {target}, but is {:?}",
                self.index,
                PackedState::from_raw(actual)
            );
        }
    }

    /// Moves the page as far towards PRE_TOMBSTONE as possible.
    ///
    /// USABLE pages become ABOUT_TO_UNMAP; ABOUT_TO_UNMAP pages with no users
    /// become PRE_TOMBSTONE. With `entomb_young`, a NOT_READY page goes to
    /// PRE_TOMBSTONE directly.
    ///
    /// Returns true only for the caller that performed the transition into
    /// PRE_TOMBSTONE; that caller owns the page cleanup.
    pub(crate) fn try_move_towards_pre_tombstone(&self, entomb_young: bool) -> bool {
        loop {
            let current = self.packed();
            match current.state() {
                PageState::NotReady => {
                    if !entomb_young {
                        return false;
                    }
                    if self.cas(current, PackedState::new(PageState::PreTombstone, 0)) {
                        return true;
                    }
                }
                PageState::Usable => {
                    self.cas(current, current.with_state(PageState::AboutToUnmap));
                }
                PageState::AboutToUnmap => {
                    if current.usage_count() > 0 {
                        return false;
                    }
                    if self.cas(current, PackedState::new(PageState::PreTombstone, 0)) {
                        return true;
                    }
                }
                PageState::Loading | PageState::PreTombstone | PageState::Tombstone => {
                    return false
                }
            }
        }
    }

    /// Serializes cleanup of a PRE_TOMBSTONE page between threads.
    pub(crate) fn try_lock_reclaim(&self) -> Option<parking_lot::MutexGuard<'_, ()>> {
        self.reclaim_lock.try_lock()
    }

    /// Takes the content buffer away from a PRE_TOMBSTONE page.
    ///
    /// # Panics
    ///
    /// Panics if the page is not PRE_TOMBSTONE or still dirty.
    pub(crate) fn detach_buffer(&self) -> Option<PageBuffer> {
        let state = self.state();
        assert_eq!(
            state,
            PageState::PreTombstone,
            "buffer of page {} detached in state {state}",
            self.index
        );
        assert!(!self.is_dirty(), "dirty page {} must be flushed before unmapping", self.index);
        self.content.write().take()
    }

    /// Final transition PRE_TOMBSTONE -> TOMBSTONE.
    ///
    /// # Panics
    ///
    /// Panics if the page is dirty, still holds content, or is not PRE_TOMBSTONE.
    pub(crate) fn entomb(&self) {
        assert!(!self.is_dirty(), "dirty page {} can't be entombed", self.index);
        assert!(
            self.content.read().is_none(),
            "page {} must release its buffer before being entombed",
            self.index
        );
        let pre_tombstone = PackedState::new(PageState::PreTombstone, 0);
        if let Err(actual) = self.state.compare_exchange(
            pre_tombstone.raw(),
            PackedState::new(PageState::Tombstone, 0).raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            panic!(
                "page {} must be PRE_TOMBSTONE to be entombed, but is {:?}",
                self.index,
                PackedState::from_raw(actual)
            );
        }
    }

    // =========================================================================
    // Usefulness
    // =========================================================================

    /// Returns the current usefulness tokens.
    pub(crate) fn tokens(&self) -> i32 {
        self.tokens.load(Ordering::Relaxed)
    }

    /// Adds tokens, saturating at `i32::MAX`. Returns the new value.
    pub(crate) fn add_tokens(&self, tokens: i32) -> i32 {
        debug_assert!(tokens >= 0, "tokens to add ({tokens}) must be >= 0");
        let update = |current: i32| Some(current.saturating_add(tokens));
        match self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, update)
        {
            Ok(previous) | Err(previous) => previous.saturating_add(tokens),
        }
    }

    /// Multiplies tokens by `numerator / denominator`. Returns the new value.
    pub(crate) fn decay_tokens(&self, numerator: i32, denominator: i32) -> i32 {
        debug_assert!(numerator >= 0 && denominator > 0);
        let decay = |current: i32| {
            (i64::from(current) * i64::from(numerator) / i64::from(denominator)) as i32
        };
        match self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |t| Some(decay(t)))
        {
            Ok(previous) | Err(previous) => decay(previous),
        }
    }

    // =========================================================================
    // Content access
    // =========================================================================

    fn content_of<'a>(&self, content: &'a Option<PageBuffer>) -> &'a [u8] {
        match content {
            Some(buffer) => &buffer.as_slice()[..self.page_size],
            None => panic!(
                "page {} has no content in state {}",
                self.index,
                self.state()
            ),
        }
    }

    /// Runs `f` over `len` bytes at `offset` of the content.
    ///
    /// The caller must hold the page acquired and have checked the range.
    pub(crate) fn read_content<R>(&self, offset: usize, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let content = self.content.read_recursive();
        f(&self.content_of(&content)[offset..offset + len])
    }

    /// Borrows the whole content for reading.
    ///
    /// Content reads are recursive: a thread holding this view may read the
    /// page again, or flush it, even while a writer is queued. Writes to the
    /// page wait until the view is dropped.
    pub(crate) fn content(&self) -> parking_lot::MappedRwLockReadGuard<'_, [u8]> {
        parking_lot::RwLockReadGuard::map(self.content.read_recursive(), |content| {
            self.content_of(content)
        })
    }

    /// Runs `f` over `len` mutable bytes at `offset` and records the range
    /// as modified.
    ///
    /// The caller must hold the page acquired and have checked the range.
    pub(crate) fn write_content<R>(
        &self,
        offset: usize,
        len: usize,
        handle: &dyn PageToStorageHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let mut content = self.content.write();
        let Some(buffer) = content.as_mut() else {
            panic!("page {} has no content in state {}", self.index, self.state())
        };
        let result = f(&mut buffer.as_mut_slice()[offset..offset + len]);
        if len > 0 {
            self.region_modified(offset, len, handle);
        }
        result
    }

    /// Must be called under the content write lock.
    fn region_modified(&self, offset: usize, len: usize, handle: &dyn PageToStorageHandle) {
        let end = offset + len;
        let old = self.modified_region.load(Ordering::Acquire);
        let new = if old == EMPTY_REGION {
            pack_region(offset, end)
        } else {
            let (min, max) = unpack_region(old);
            pack_region(min.min(offset), max.max(end))
        };
        self.modified_region.store(new, Ordering::Release);

        if old == EMPTY_REGION {
            handle.page_became_dirty();
        }
        handle.modified_region_updated(self.offset_in_file() + offset as u64, len);
    }

    /// Returns the modified range `[min, max)`, if any.
    pub(crate) fn modified_region(&self) -> Option<(usize, usize)> {
        match self.modified_region.load(Ordering::Acquire) {
            EMPTY_REGION => None,
            region => Some(unpack_region(region)),
        }
    }

    // =========================================================================
    // Flushing
    // =========================================================================

    /// Writes the modified range back through `handle`.
    ///
    /// Returns true if something was written.
    pub(crate) fn flush(&self, handle: &dyn PageToStorageHandle) -> io::Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let content = self.content.read_recursive();
        let _flushing = self.flush_lock.lock();
        self.flush_locked(&content, handle)
    }

    /// Like [`flush`](Self::flush), but gives up instead of waiting for a
    /// writer or a concurrent flush.
    pub(crate) fn try_flush(&self, handle: &dyn PageToStorageHandle) -> io::Result<bool> {
        if !self.is_dirty() {
            return Ok(false);
        }
        let Some(content) = self.content.try_read_recursive() else {
            return Ok(false);
        };
        let Some(_flushing) = self.flush_lock.try_lock() else {
            return Ok(false);
        };
        self.flush_locked(&content, handle)
    }

    /// Caller holds the content read lock (no writers) and the flush lock.
    fn flush_locked(
        &self,
        content: &Option<PageBuffer>,
        handle: &dyn PageToStorageHandle,
    ) -> io::Result<bool> {
        let Some((min, max)) = self.modified_region() else {
            return Ok(false);
        };
        let bytes = &self.content_of(content)[min..max];
        handle.flush_bytes(bytes, self.offset_in_file() + min as u64)?;

        self.modified_region.store(EMPTY_REGION, Ordering::Release);
        handle.page_became_clean();
        Ok(true)
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("owner", &self.owner)
            .field("state", &self.packed())
            .field("dirty", &self.is_dirty())
            .field("tokens", &self.tokens())
            .finish()
    }
}
