//! Completion handles for outstanding one-sided RDMA operations.
//!
//! Grounded on the "completion waited on under a fabric-context read lock" design note
//! (§9): a [`CompletionHandle`] is a cheap, cloneable token; waiting on it takes the
//! owning [`CompletionContext`]'s read lock only for the duration of the poll, so one
//! slow transfer never blocks unrelated `register`/`deregister` calls that need the
//! context's write lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{FamError, FamResult};

/// Shared completion flag for a single in-flight transfer. A real provider's
/// completion-queue poll thread (or, in [`crate::fabric::testing`], the test harness
/// itself) flips this once the operation lands.
#[derive(Debug, Default)]
struct Slot {
    done: AtomicBool,
    failed: AtomicBool,
}

/// A waitable handle for one outstanding `read`/`write`. Clone freely; all clones
/// observe the same completion.
#[derive(Clone)]
pub struct CompletionHandle {
    slot: Arc<Slot>,
}

impl CompletionHandle {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Slot::default()),
        }
    }

    pub fn mark_complete(&self) {
        self.slot.done.store(true, Ordering::Release);
    }

    pub fn mark_failed(&self) {
        self.slot.failed.store(true, Ordering::Release);
        self.slot.done.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.slot.done.load(Ordering::Acquire)
    }
}

impl Default for CompletionHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns the set of handles a fabric context has issued, guarded by an `RwLock` so a
/// copy waiting on one transfer never blocks a concurrent `register`/`deregister` that
/// only needs shared access to the context.
#[derive(Default)]
pub struct CompletionContext {
    lock: RwLock<()>,
}

impl CompletionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling thread until `handle` completes, driving `poll` (typically
    /// [`crate::fabric::FabricProvider::poll_progress`]) in between checks when the
    /// provider requires manual progress. Returns an error if the transfer failed or
    /// `timeout` elapsed first.
    ///
    /// Does not itself take [`Self::shared`]/[`Self::exclusive`] — a caller waiting on
    /// several handles in a row (the copy engine) takes one [`Self::shared`] guard
    /// around the whole sequence instead of one per handle, so the lock is held for
    /// the duration the spec calls for without this method re-entering it.
    pub fn wait(
        &self,
        handle: &CompletionHandle,
        mut poll: impl FnMut(),
        timeout: Duration,
    ) -> FamResult<()> {
        let start = Instant::now();
        loop {
            if handle.slot.done.load(Ordering::Acquire) {
                return if handle.slot.failed.load(Ordering::Acquire) {
                    Err(FamError::resource("RDMA transfer failed"))
                } else {
                    Ok(())
                };
            }
            if start.elapsed() >= timeout {
                return Err(FamError::resource("RDMA transfer timed out"));
            }
            poll();
            std::thread::yield_now();
        }
    }

    /// Shared access held across a sequence of [`Self::wait`] calls (the copy engine's
    /// post-dispatch drain), so those waits are serialized against a concurrent
    /// [`Self::exclusive`] caller without blocking each other.
    pub fn shared(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    /// Exclusive access for operations (register/deregister) that must not race an
    /// in-flight wait.
    pub fn exclusive(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_returns_once_marked_complete() {
        let ctx = CompletionContext::new();
        let handle = CompletionHandle::new();
        handle.mark_complete();
        ctx.wait(&handle, || {}, Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn wait_reports_failure() {
        let ctx = CompletionContext::new();
        let handle = CompletionHandle::new();
        handle.mark_failed();
        assert!(ctx.wait(&handle, || {}, Duration::from_millis(50)).is_err());
    }

    #[test]
    fn wait_times_out_on_unfinished_handle() {
        let ctx = CompletionContext::new();
        let handle = CompletionHandle::new();
        assert!(ctx
            .wait(&handle, || {}, Duration::from_millis(5))
            .is_err());
    }
}
