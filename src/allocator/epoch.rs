//! Epoch-based deferred reclamation for `deallocate`.
//!
//! §9 "Manual epochs" asks for `free(offset)` calls to run inside a local epoch scope so
//! that the delayed-free worker only reclaims an offset once no concurrent reader can
//! still observe it. We get this for free from `crossbeam-epoch` (already pulled in by
//! the teacher's `crossbeam` dependency) instead of hand-rolling a hazard-pointer table:
//! a `pin()` per in-flight read/free pins the current epoch, and `collector.flush()` plus
//! repeated `pin().flush()` calls from the delayed-free worker advance the global epoch
//! and drop anything whose epoch no pinned guard can still observe.

use crossbeam::epoch::{self, Guard};

/// One per delayed-free shard. Wraps a private `crossbeam_epoch::Collector` so that
/// epoch advancement in one shard never waits on pins held by unrelated shards.
pub struct EpochDomain {
    collector: epoch::Collector,
}

impl EpochDomain {
    pub fn new() -> Self {
        Self {
            collector: epoch::Collector::new(),
        }
    }

    /// Pin the current thread to the domain's epoch for the duration of the guard. Callers
    /// performing a read of pool bytes, or a `deallocate` that must not race a concurrent
    /// reader, should hold a guard for the duration of the operation.
    pub fn pin(&self) -> Guard {
        self.collector.register().pin()
    }

    /// Defer running `f` until no pinned guard can observe the current epoch, then try to
    /// advance the epoch so deferred work becomes eligible to run. Called by the
    /// delayed-free worker sweep.
    pub fn defer_and_advance<F: FnOnce() + Send + 'static>(&self, f: F) {
        let guard = self.pin();
        unsafe {
            guard.defer_unchecked(f);
        }
        guard.flush();
    }
}

impl Default for EpochDomain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn deferred_free_runs_after_flush() {
        let domain = EpochDomain::new();
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        domain.defer_and_advance(move || {
            freed2.fetch_add(1, Ordering::SeqCst);
        });
        // Advancing the epoch a few more times gives the collector a chance to run the
        // deferred destructor; crossbeam does not guarantee it runs synchronously.
        for _ in 0..8 {
            domain.pin().flush();
        }
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}
