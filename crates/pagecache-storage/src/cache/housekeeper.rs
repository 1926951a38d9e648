//! Housekeeping: the background loop and everything a turn does.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;
use pagecache_common::constants::{HOUSEKEEPER_IDLE_PARK_MILLIS, TOKENS_PER_USE};
use pagecache_common::PageCacheError;
use rand::Rng;
use tracing::{debug, error, info, trace, warn};

use super::collector::{ReclaimCandidate, ReclaimCollector};
use super::command::CloseStorageCommand;
use super::{CacheInner, CacheState, ReclaimAllOutcome};
use crate::page::table::PagesTable;
use crate::page::{Page, PageState};

/// What the housekeeper does between steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Park(Duration),
    Yield,
}

/// Body of the housekeeper thread.
///
/// Holds the cache only weakly between steps, so dropping every
/// [`PageCache`](super::PageCache) handle stops the thread.
pub(super) fn run(cache: Weak<CacheInner>) {
    info!("page cache housekeeper started");
    loop {
        let Some(inner) = cache.upgrade() else {
            break;
        };
        if inner.state() == CacheState::Closed {
            break;
        }
        let pause = inner.housekeeping_step();
        drop(inner);

        match pause {
            Pause::Park(duration) => thread::park_timeout(duration),
            Pause::Yield => thread::yield_now(),
        }
    }
    info!("page cache housekeeper stopped");
}

/// Credits pages in use and decays idle ones. Returns the new usefulness.
fn adjust_usefulness(page: &Page) -> i32 {
    let usage_count = page.usage_count();
    if usage_count > 0 {
        page.add_tokens(usage_count as i32 * TOKENS_PER_USE)
    } else {
        page.decay_tokens(TOKENS_PER_USE - 1, TOKENS_PER_USE)
    }
}

impl CacheInner {
    /// One iteration of the housekeeper loop: maybe a turn, then adapt the
    /// candidate percentile to how fast the last queue was consumed.
    fn housekeeping_step(&self) -> Pause {
        let mut collector = self.collector.lock();
        let prepared = collector.total_prepared();
        let remaining = self.reclaim_queue.read().len();

        if remaining <= prepared / 2 || !self.commands.is_empty() || self.over_capacity() {
            self.maintenance_turn(&mut collector);
            self.stats.record_turn();
        } else {
            self.stats.record_skipped_turn();
        }

        if remaining > prepared / 2 {
            // the queue is barely touched: collect less, rest a little
            collector.decrease_percentage();
            Pause::Park(Duration::from_millis(self.config.housekeeper_park_millis))
        } else if remaining > 0 {
            Pause::Yield
        } else if prepared > 0 {
            // consumed everything: collect more next time
            collector.increase_percentage();
            Pause::Yield
        } else {
            Pause::Park(Duration::from_millis(HOUSEKEEPER_IDLE_PARK_MILLIS))
        }
    }

    /// One housekeeping turn. The caller holds the collector lock.
    pub(super) fn maintenance_turn(&self, collector: &mut ReclaimCollector) {
        let closed = self.process_close_commands();

        let tables: Vec<Arc<PagesTable>> = self.registry.lock().values().cloned().collect();
        collector.start_turn();
        for table in &tables {
            let mut alive = 0;
            for page in table.pages() {
                alive += 1;
                match page.state() {
                    PageState::AboutToUnmap if page.usage_count() == 0 => {
                        if page.try_move_towards_pre_tombstone(false) {
                            let _ = self.reclaim_page(&page, table);
                            continue;
                        }
                    }
                    PageState::PreTombstone => {
                        // cleanup stalled, usually on a failed flush
                        let _ = self.reclaim_page(&page, table);
                        continue;
                    }
                    _ => {}
                }
                let usefulness = adjust_usefulness(&page);
                collector.consider(&page, table, usefulness);
            }
            table.shrink_if_needed(alive);
        }
        collector.finish_turn();

        let (flushed, failed) =
            collector.ensure_enough_clean_pages(self.config.clean_candidates_fraction);
        for _ in 0..flushed {
            self.stats.record_eager_flush();
        }
        for _ in 0..failed {
            self.stats.record_flush_failure();
        }

        let queue = Arc::new(SegQueue::new());
        for candidate in collector.candidates() {
            queue.push(candidate.clone());
        }
        *self.reclaim_queue.write() = Arc::clone(&queue);

        let reclaimed = self.reclaim_over_capacity(&queue);
        trace!(
            storages = tables.len(),
            closed,
            candidates = collector.total_prepared(),
            percentile = collector.percentage(),
            threshold = collector.threshold(),
            flushed,
            reclaimed,
            resident = self.resident_bytes(),
            "housekeeping turn done"
        );
    }

    /// Pages allocated while the queue was empty may have pushed the cache
    /// over capacity; evict from the fresh queue until back under it.
    fn reclaim_over_capacity(&self, queue: &SegQueue<ReclaimCandidate>) -> usize {
        let mut reclaimed = 0;
        while reclaimed < self.config.max_pages_to_reclaim_per_turn && self.over_capacity() {
            let Some(candidate) = queue.pop() else {
                break;
            };
            let page = &candidate.page;
            if page.state() == PageState::Usable
                && page.usage_count() == 0
                && page.try_move_towards_pre_tombstone(false)
                && self.reclaim_page(page, &candidate.table).is_ok()
            {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Frees room for a `size`-byte native buffer by reclaiming a few queued
    /// candidates. Returns false if the room could not be made.
    pub(super) fn try_reclaim_enough_pages(&self, size: usize) -> bool {
        let capacity = self.config.capacity_bytes;
        let has_room = || self.native_bytes.load(Ordering::Relaxed) + size as u64 <= capacity;
        if has_room() {
            return true;
        }

        let queue = Arc::clone(&*self.reclaim_queue.read());
        let max_tries = self.config.max_pages_to_reclaim_at_once;
        let mut rng = rand::thread_rng();
        let mut dirty_skipped = 0;
        for _ in 0..max_tries {
            if has_room() {
                return true;
            }
            let Some(candidate) = queue.pop() else {
                return false;
            };
            let page = &candidate.page;
            if page.usage_count() > 0 {
                continue;
            }
            // Flushing stalls the allocating thread, so prefer clean pages.
            // The n-th dirty page is accepted with probability n / max_tries.
            if page.is_dirty() && dirty_skipped <= rng.gen_range(0..max_tries) {
                dirty_skipped += 1;
                queue.push(candidate);
                continue;
            }
            if page.try_move_towards_pre_tombstone(false) {
                let _ = self.reclaim_page(page, &candidate.table);
            }
        }
        has_room()
    }

    /// Flushes, frees and entombs a PRE_TOMBSTONE page.
    ///
    /// Whoever moved the page to PRE_TOMBSTONE calls this, and so may any
    /// thread that finds the page stuck there; only one of them does the
    /// work. On a flush failure the page stays PRE_TOMBSTONE and dirty, with
    /// its buffer, and the error is returned.
    pub(super) fn reclaim_page(&self, page: &Page, table: &PagesTable) -> io::Result<()> {
        assert_eq!(
            page.owner(),
            table.storage().id(),
            "page {} reclaimed through a foreign table",
            page.index()
        );
        let Some(_reclaiming) = page.try_lock_reclaim() else {
            return Ok(());
        };
        match page.state() {
            PageState::PreTombstone => {}
            PageState::Tombstone => return Ok(()),
            state => panic!("page {} reclaimed in state {state}", page.index()),
        }

        if page.is_dirty() {
            if let Err(e) = page.flush(&**table.storage()) {
                self.stats.record_flush_failure();
                warn!(
                    storage = %table.storage().path().display(),
                    page = %page.index(),
                    error = %e,
                    "can't flush page being evicted, keeping it dirty"
                );
                return Err(e);
            }
        }

        if let Some(buffer) = page.detach_buffer() {
            let native = self.free_buffer(buffer);
            self.stats.record_reclaim(native);
        }
        page.entomb();
        Ok(())
    }

    /// Tries to evict every page of `table`, including pages nobody started
    /// loading yet.
    pub(super) fn try_reclaim_all(&self, table: &PagesTable) -> ReclaimAllOutcome {
        let mut outcome = ReclaimAllOutcome::default();
        for page in table.pages() {
            let claimed = page.try_move_towards_pre_tombstone(true);
            if (claimed || page.state() == PageState::PreTombstone)
                && self.reclaim_page(&page, table).is_err()
            {
                outcome.flush_failed = true;
            }
            outcome.pages_remaining |= !page.is_tombstone();
        }
        outcome
    }

    /// Runs up to `close_commands_per_turn` storage closes. Returns how many
    /// storages were fully reclaimed.
    fn process_close_commands(&self) -> usize {
        let mut closed = 0;
        for _ in 0..self.config.close_commands_per_turn {
            let Some(mut command) = self.commands.pop() else {
                break;
            };
            let storage = Arc::clone(command.table.storage());
            if !storage.is_closed() {
                error!(
                    storage = %storage.path().display(),
                    "close requested for a storage that is still open"
                );
                command.completion.complete(Err(PageCacheError::CloseFailed {
                    path: storage.path().to_path_buf(),
                    reason: "storage is still open".to_string(),
                }));
                continue;
            }

            let outcome = self.try_reclaim_all(&command.table);
            if !outcome.pages_remaining {
                self.unregister(&command.table);
                self.stats.record_storage_closed();
                debug!(storage = %storage.path().display(), "closed storage reclaimed");
                command.completion.complete(Ok(()));
                closed += 1;
                continue;
            }

            if outcome.flush_failed {
                command.flush_failures += 1;
            }
            if command.flush_failures >= self.config.max_close_flush_failures {
                // The table stays registered with its dirty pages, so the
                // data is still written back once the channel recovers.
                error!(
                    storage = %storage.path().display(),
                    attempts = command.flush_failures,
                    "giving up closing storage, dirty pages can't be flushed"
                );
                command.completion.complete(Err(PageCacheError::CloseFailed {
                    path: storage.path().to_path_buf(),
                    reason: format!(
                        "dirty pages could not be flushed in {} attempts",
                        command.flush_failures
                    ),
                }));
            } else {
                self.commands.push(command);
            }
        }
        closed
    }

    /// Last attempt at a pending close while the cache shuts down.
    pub(super) fn finish_close_on_shutdown(&self, command: CloseStorageCommand) {
        let outcome = self.try_reclaim_all(&command.table);
        if outcome.pages_remaining {
            let path = command.table.storage().path().to_path_buf();
            error!(storage = %path.display(), "cache closed before storage pages were reclaimed");
            command.completion.complete(Err(PageCacheError::CloseFailed {
                path,
                reason: "cache closed while pages were still in use or dirty".to_string(),
            }));
        } else {
            self.unregister(&command.table);
            self.stats.record_storage_closed();
            command.completion.complete(Ok(()));
        }
    }
}
