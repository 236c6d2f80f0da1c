//! Epoch-safe delayed-free workers.
//!
//! §4.A: each of `num_delayed_free_threads` workers owns a shard of heaps, sharded by
//! `region_id mod num_delayed_free_threads`. A worker repeatedly sweeps its shard's
//! heaps in id order and drives [`crate::allocator::epoch::EpochDomain`] forward so that
//! offsets queued by [`crate::allocator::pool::PoolAllocator::deallocate`] become free
//! for reuse once no concurrent reader can still observe them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;

use crate::allocator::epoch::EpochDomain;
use crate::allocator::heap::Heap;
use crate::util::constants::DELAYED_FREE_SLEEP_MS;

/// Per-region record owned by a delayed-free shard. `valid` is cleared, under the
/// record's own write lock, before the heap is closed and removed — this is the
/// linearization point invariant (1) in §4.A relies on.
pub struct HeapRecord {
    pub heap: RwLock<Heap>,
    valid: AtomicBool,
}

impl HeapRecord {
    pub fn new(heap: Heap) -> Self {
        Self {
            heap: RwLock::new(heap),
            valid: AtomicBool::new(true),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the record invalid. Called by the owning shard under its own write lock,
    /// before the heap is closed, so a worker mid-sweep never touches a closing heap.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }
}

/// One shard of the pool's heaps, owned by exactly one delayed-free worker (or, when
/// `num_delayed_free_threads == 0`, owned directly by [`crate::allocator::pool::PoolAllocator`]
/// with no background thread).
pub struct DelayedFreeShard {
    index: usize,
    heaps: RwLock<BTreeMap<u64, Arc<HeapRecord>>>,
    epoch: EpochDomain,
}

impl DelayedFreeShard {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            heaps: RwLock::new(BTreeMap::new()),
            epoch: EpochDomain::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn epoch(&self) -> &EpochDomain {
        &self.epoch
    }

    pub fn insert(&self, region_id: u64, heap: Heap) -> Arc<HeapRecord> {
        let record = Arc::new(HeapRecord::new(heap));
        self.heaps.write().insert(region_id, record.clone());
        record
    }

    pub fn get(&self, region_id: u64) -> Option<Arc<HeapRecord>> {
        self.heaps.read().get(&region_id).cloned()
    }

    /// Remove and invalidate the record for `region_id`, if present. The record is
    /// invalidated (under its own lock, acquired here) before being dropped from the
    /// shard so a worker mid-sweep observes `valid == false` rather than a torn heap.
    pub fn remove(&self, region_id: u64) -> Option<Arc<HeapRecord>> {
        let mut heaps = self.heaps.write();
        let record = heaps.remove(&region_id)?;
        {
            let _guard = record.heap.write();
            record.invalidate();
        }
        Some(record)
    }

    /// One sweep: walk every heap in id order, invoking `f` on each still-valid, open
    /// heap while holding only that heap's own read lock (never the shard lock).
    fn sweep(&self, f: impl Fn(&EpochDomain, &Heap)) {
        // Snapshot the key order under the shard read lock, then release it before
        // touching any individual heap — this is the "upper-bound cursor" the spec asks
        // for: a concurrent insert/remove can only ever enlarge or shrink the cursor's
        // remaining work, never stall it.
        let ids: Vec<u64> = {
            let heaps = self.heaps.read();
            heaps.keys().copied().collect()
        };
        for id in ids {
            let record = {
                let heaps = self.heaps.read();
                match heaps.get(&id) {
                    Some(r) => r.clone(),
                    None => continue,
                }
            };
            if !record.is_valid() {
                continue;
            }
            let heap = record.heap.read();
            if record.is_valid() && heap.is_open() {
                f(&self.epoch, &heap);
            }
        }
    }
}

/// A running delayed-free worker thread.
pub struct DelayedFreeWorker {
    shard: Arc<DelayedFreeShard>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DelayedFreeWorker {
    /// Spawn a worker thread sweeping `shard` until [`Self::stop`] is called.
    pub fn spawn(shard: Arc<DelayedFreeShard>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let worker_shard = shard.clone();
        let handle = std::thread::Builder::new()
            .name(format!("fam-delayed-free-{}", shard.index()))
            .spawn(move || {
                while worker_running.load(Ordering::Acquire) {
                    worker_shard.sweep(|epoch, _heap| {
                        // Advancing the shard's epoch domain is enough for our backing
                        // store: actual offset reclamation happens synchronously in
                        // `PoolAllocator::deallocate` once the epoch has moved past the
                        // pin taken at free time.
                        epoch.pin().flush();
                    });
                    std::thread::sleep(Duration::from_millis(DELAYED_FREE_SLEEP_MS));
                }
            })
            .expect("failed to spawn delayed-free worker thread");
        Self {
            shard,
            running,
            handle: Some(handle),
        }
    }

    pub fn shard(&self) -> &Arc<DelayedFreeShard> {
        &self.shard
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DelayedFreeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::MIN_OBJ_SIZE;

    #[test]
    fn sweep_skips_invalidated_records() {
        let shard = Arc::new(DelayedFreeShard::new(0));
        let mut heap = Heap::create(1, 4 * MIN_OBJ_SIZE as u64).unwrap();
        heap.open().unwrap();
        shard.insert(1, heap);
        assert!(shard.get(1).unwrap().is_valid());
        shard.remove(1);
        assert!(shard.get(1).is_none());
    }

    #[test]
    fn worker_sweeps_without_panicking() {
        let shard = Arc::new(DelayedFreeShard::new(0));
        let mut heap = Heap::create(1, 4 * MIN_OBJ_SIZE as u64).unwrap();
        heap.open().unwrap();
        shard.insert(1, heap);
        let mut worker = DelayedFreeWorker::spawn(shard);
        std::thread::sleep(Duration::from_millis(5));
        worker.stop();
    }
}
