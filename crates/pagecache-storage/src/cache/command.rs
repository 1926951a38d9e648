//! Commands sent to the housekeeper.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pagecache_common::{PageCacheError, PageCacheResult};
use parking_lot::{Condvar, Mutex};

use crate::page::table::PagesTable;

/// Asks the housekeeper to reclaim every page of a closed storage and drop
/// its table from the registry.
pub(crate) struct CloseStorageCommand {
    pub(crate) table: Arc<PagesTable>,
    pub(crate) completion: CloseCompletion,
    /// Turns on which flushing the storage's dirty pages failed.
    pub(crate) flush_failures: u32,
}

impl CloseStorageCommand {
    pub(crate) fn new(table: Arc<PagesTable>) -> (Self, CloseFuture) {
        let completion = CloseCompletion::new(table.storage().path());
        let future = CloseFuture {
            completion: completion.clone(),
        };
        let command = Self {
            table,
            completion,
            flush_failures: 0,
        };
        (command, future)
    }
}

impl fmt::Debug for CloseStorageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseStorageCommand")
            .field("storage", &self.table.storage().path())
            .field("flush_failures", &self.flush_failures)
            .finish()
    }
}

struct CompletionState {
    path: PathBuf,
    outcome: Mutex<Outcome>,
    done: Condvar,
}

enum Outcome {
    Pending,
    Ready(PageCacheResult<()>),
    /// The result went to an earlier waiter; later ones get a summary.
    Taken { failure: Option<String> },
}

impl Outcome {
    fn take(&mut self, path: &Path) -> Option<PageCacheResult<()>> {
        match std::mem::replace(self, Outcome::Pending) {
            Outcome::Pending => None,
            Outcome::Ready(result) => {
                *self = Outcome::Taken {
                    failure: result.as_ref().err().map(ToString::to_string),
                };
                Some(result)
            }
            Outcome::Taken { failure } => {
                let result = match &failure {
                    None => Ok(()),
                    Some(reason) => Err(PageCacheError::CloseFailed {
                        path: path.to_path_buf(),
                        reason: reason.clone(),
                    }),
                };
                *self = Outcome::Taken { failure };
                Some(result)
            }
        }
    }
}

/// Completing side of a [`CloseFuture`].
#[derive(Clone)]
pub(crate) struct CloseCompletion {
    state: Arc<CompletionState>,
}

impl CloseCompletion {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            state: Arc::new(CompletionState {
                path: path.into(),
                outcome: Mutex::new(Outcome::Pending),
                done: Condvar::new(),
            }),
        }
    }

    /// Publishes the result and wakes all waiters. Only the first result is kept.
    pub(crate) fn complete(&self, result: PageCacheResult<()>) {
        let mut outcome = self.state.outcome.lock();
        if matches!(*outcome, Outcome::Pending) {
            *outcome = Outcome::Ready(result);
        }
        self.state.done.notify_all();
    }
}

/// Completion of an asynchronous storage close.
///
/// Resolves once every page of the storage has been flushed and evicted, or
/// with an error if that could not be done. Clones wait for the same close;
/// the first to finish waiting gets the original error, later ones a
/// [`PageCacheError::CloseFailed`] carrying its message.
#[derive(Clone)]
pub struct CloseFuture {
    completion: CloseCompletion,
}

impl CloseFuture {
    /// Returns an already completed future.
    pub(crate) fn completed(path: impl Into<PathBuf>, result: PageCacheResult<()>) -> Self {
        let completion = CloseCompletion::new(path);
        completion.complete(result);
        Self { completion }
    }

    /// Returns true if the close has finished.
    pub fn is_done(&self) -> bool {
        !matches!(*self.completion.state.outcome.lock(), Outcome::Pending)
    }

    /// Blocks until the close finishes.
    pub fn wait(self) -> PageCacheResult<()> {
        let state = &self.completion.state;
        let mut outcome = state.outcome.lock();
        loop {
            if let Some(result) = outcome.take(&state.path) {
                return result;
            }
            state.done.wait(&mut outcome);
        }
    }

    /// Blocks until the close finishes or `timeout` elapses. On timeout the
    /// future is handed back.
    pub fn wait_timeout(self, timeout: Duration) -> Result<PageCacheResult<()>, Self> {
        {
            let state = &self.completion.state;
            let mut outcome = state.outcome.lock();
            if matches!(*outcome, Outcome::Pending) {
                let _ = state.done.wait_for(&mut outcome, timeout);
            }
            if let Some(result) = outcome.take(&state.path) {
                return Ok(result);
            }
        }
        Err(self)
    }
}

impl fmt::Debug for CloseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseFuture")
            .field("done", &self.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_completed_future() {
        let future = CloseFuture::completed("/tmp/done.bin", Ok(()));
        assert!(future.is_done());
        assert!(future.wait().is_ok());
    }

    #[test]
    fn test_wait_for_completion_from_another_thread() {
        let completion = CloseCompletion::new("/tmp/close.bin");
        let future = CloseFuture {
            completion: completion.clone(),
        };
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completion.complete(Err(PageCacheError::CacheClosed));
        });
        assert!(matches!(future.wait(), Err(PageCacheError::CacheClosed)));
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_hands_future_back() {
        let completion = CloseCompletion::new("/tmp/close.bin");
        let future = CloseFuture {
            completion: completion.clone(),
        };
        let future = match future.wait_timeout(Duration::from_millis(5)) {
            Err(future) => future,
            Ok(_) => panic!("close completed without a result"),
        };
        completion.complete(Ok(()));
        completion.complete(Err(PageCacheError::CacheClosed));
        assert!(matches!(future.wait_timeout(Duration::from_secs(1)), Ok(Ok(()))));
    }

    #[test]
    fn test_every_clone_sees_the_outcome() {
        let completion = CloseCompletion::new("/tmp/shared.bin");
        let first = CloseFuture {
            completion: completion.clone(),
        };
        let second = first.clone();
        let waiter = thread::spawn(move || second.wait());

        completion.complete(Err(PageCacheError::CacheClosed));
        let late = waiter.join().unwrap();
        let early = first.wait();
        // whichever waiter came first got the original error
        let (original, summary) = match (&early, &late) {
            (Err(PageCacheError::CacheClosed), _) => (early, late),
            _ => (late, early),
        };
        assert!(matches!(original, Err(PageCacheError::CacheClosed)));
        match summary {
            Err(PageCacheError::CloseFailed { path, reason }) => {
                assert_eq!(path, PathBuf::from("/tmp/shared.bin"));
                assert_eq!(reason, PageCacheError::CacheClosed.to_string());
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_successful_close_seen_by_late_waiters() {
        let future = CloseFuture::completed("/tmp/ok.bin", Ok(()));
        let late = future.clone();
        assert!(future.wait().is_ok());
        assert!(late.is_done());
        assert!(late.wait().is_ok());
    }
}
