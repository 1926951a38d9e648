//! Selection of pages to evict.

use std::sync::Arc;

use tracing::warn;

use super::quantile::FrugalQuantileEstimator;
use crate::page::table::PagesTable;
use crate::page::{Page, PageState};

/// A page chosen for eviction, with the table it lives in.
#[derive(Clone)]
pub(crate) struct ReclaimCandidate {
    pub(crate) page: Arc<Page>,
    pub(crate) table: Arc<PagesTable>,
    /// Usefulness tokens seen when the page was collected; the sort key.
    pub(crate) usefulness: i32,
}

impl std::fmt::Debug for ReclaimCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimCandidate")
            .field("page", &self.page.index())
            .field("storage", &self.table.storage().path())
            .field("usefulness", &self.usefulness)
            .finish()
    }
}

/// Collects eviction candidates during a housekeeper turn.
///
/// A page is a candidate when it is USABLE, unused, and its usefulness is at
/// or below a low percentile of the usefulness of all pages seen. The
/// percentile starts at `min_percent` and moves within
/// `[min_percent, max_percent]` with allocation pressure.
#[derive(Debug)]
pub(crate) struct ReclaimCollector {
    threshold: FrugalQuantileEstimator,
    min_percent: u32,
    max_percent: u32,
    clean: Vec<ReclaimCandidate>,
    dirty: Vec<ReclaimCandidate>,
}

impl ReclaimCollector {
    pub(crate) fn new(min_percent: u32, max_percent: u32) -> Self {
        Self::with_estimator(
            min_percent,
            max_percent,
            FrugalQuantileEstimator::new(min_percent, 0.5, 0.0),
        )
    }

    fn with_estimator(
        min_percent: u32,
        max_percent: u32,
        threshold: FrugalQuantileEstimator,
    ) -> Self {
        assert!(
            min_percent <= max_percent,
            "min reclaim percent {min_percent} must be <= max {max_percent}"
        );
        Self {
            threshold,
            min_percent,
            max_percent,
            clean: Vec::new(),
            dirty: Vec::new(),
        }
    }

    pub(crate) fn start_turn(&mut self) {
        self.clean = Vec::new();
        self.dirty = Vec::new();
    }

    /// Feeds a page's usefulness to the threshold estimate and keeps the
    /// page if it qualifies.
    pub(crate) fn consider(&mut self, page: &Arc<Page>, table: &Arc<PagesTable>, usefulness: i32) {
        let threshold = self.threshold.update(f64::from(usefulness));
        if page.state() == PageState::Usable
            && page.usage_count() == 0
            && f64::from(usefulness) <= threshold
        {
            let candidate = ReclaimCandidate {
                page: Arc::clone(page),
                table: Arc::clone(table),
                usefulness,
            };
            if page.is_dirty() {
                self.dirty.push(candidate);
            } else {
                self.clean.push(candidate);
            }
        }
    }

    /// Orders candidates least useful first.
    pub(crate) fn finish_turn(&mut self) {
        self.clean.sort_by_key(|candidate| candidate.usefulness);
        self.dirty.sort_by_key(|candidate| candidate.usefulness);
    }

    /// Flushes the least useful dirty candidates until clean ones make up at
    /// least `clean_fraction` of all candidates. Pages busy with a writer or
    /// another flush are skipped.
    ///
    /// Returns `(flushed, failed)`.
    pub(crate) fn ensure_enough_clean_pages(&self, clean_fraction: f64) -> (usize, usize) {
        let total = self.total_prepared();
        let dirty_target = ((1.0 - clean_fraction) * total as f64) as usize;
        let to_flush = self.dirty.len().saturating_sub(dirty_target);

        let mut flushed = 0;
        let mut failed = 0;
        for candidate in self.dirty.iter().take(to_flush) {
            if candidate.page.is_tombstone() {
                continue;
            }
            match candidate.page.try_flush(&**candidate.table.storage()) {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    warn!(
                        storage = %candidate.table.storage().path().display(),
                        page = %candidate.page.index(),
                        error = %e,
                        "can't flush page ahead of eviction"
                    );
                }
            }
        }
        (flushed, failed)
    }

    /// Candidates in eviction order: clean first, then dirty.
    pub(crate) fn candidates(&self) -> impl Iterator<Item = &ReclaimCandidate> {
        self.clean.iter().chain(self.dirty.iter())
    }

    pub(crate) fn total_prepared(&self) -> usize {
        self.clean.len() + self.dirty.len()
    }

    /// Current low-usefulness threshold.
    pub(crate) fn threshold(&self) -> f64 {
        self.threshold.estimate()
    }

    pub(crate) fn percentage(&self) -> u32 {
        self.threshold.percentile()
    }

    /// Collect fewer candidates: the previous batch was not consumed.
    pub(crate) fn decrease_percentage(&mut self) {
        let current = self.threshold.percentile();
        if current > self.min_percent {
            self.threshold.set_target_percentile(current - 1);
        }
    }

    /// Collect more candidates: the previous batch ran out.
    pub(crate) fn increase_percentage(&mut self) {
        let current = self.threshold.percentile();
        if current < self.max_percent {
            self.threshold.set_target_percentile(current + 1);
        }
    }
}
