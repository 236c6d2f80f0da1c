//! Region-id-keyed map of heaps: `create_region`/`destroy_region`/`resize_region`/
//! `allocate`/`deallocate`/`get_local_pointer`/`create_atl_root`, §4.A.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::allocator::delayed_free::{DelayedFreeShard, DelayedFreeWorker};
use crate::allocator::heap::Heap;
use crate::error::{FamError, FamResult};
use crate::util::address::Address;
use crate::util::constants::{ATOMIC_REGION_ID, MAX_ATOMIC_THREADS, MIN_OBJ_SIZE, MIN_REGION_SIZE};
use crate::util::conversions::raw_align_up;

/// Sentinel meaning "the ATL root has not been created yet".
const NO_ATL_ROOT: u64 = u64::MAX;

/// Owns every region's heap, sharded across the configured number of delayed-free
/// workers (or a single inline shard with no background thread if
/// `num_delayed_free_threads == 0`).
pub struct PoolAllocator {
    shards: Vec<Arc<DelayedFreeShard>>,
    workers: Vec<DelayedFreeWorker>,
    atl_root_offset: AtomicU64,
}

impl PoolAllocator {
    /// Build a pool allocator with `num_delayed_free_threads` background workers (zero
    /// is legal: frees happen synchronously on the caller's thread in that case).
    pub fn new(num_delayed_free_threads: usize) -> Self {
        let num_shards = num_delayed_free_threads.max(1);
        let shards: Vec<_> = (0..num_shards)
            .map(|i| Arc::new(DelayedFreeShard::new(i)))
            .collect();
        let workers = if num_delayed_free_threads == 0 {
            Vec::new()
        } else {
            shards.iter().cloned().map(DelayedFreeWorker::spawn).collect()
        };
        Self {
            shards,
            workers,
            atl_root_offset: AtomicU64::new(NO_ATL_ROOT),
        }
    }

    fn has_delayed_free_workers(&self) -> bool {
        !self.workers.is_empty()
    }

    fn shard_for(&self, region_id: u64) -> &Arc<DelayedFreeShard> {
        &self.shards[(region_id as usize) % self.shards.len()]
    }

    /// §4.A `create_region`: round `size` up to `MIN_REGION_SIZE`, create and open a
    /// heap, insert it into the owning shard. Rolls the heap back out on any failure
    /// after creation.
    pub fn create_region(&self, region_id: u64, size: u64) -> FamResult<()> {
        let shard = self.shard_for(region_id);
        if shard.get(region_id).is_some() {
            return Err(FamError::already_exists(format!(
                "region {region_id} already has a heap"
            )));
        }
        let rounded = raw_align_up(size as usize, MIN_REGION_SIZE) as u64;
        let mut heap = Heap::create(region_id, rounded)
            .map_err(|e| FamError::resource(format!("HEAP_NOT_CREATED: {}", e.message)))?;
        if let Err(e) = heap.open() {
            return Err(FamError::resource(format!("HEAP_NOT_OPENED: {}", e.message)));
        }
        shard.insert(region_id, heap);
        Ok(())
    }

    /// §4.A `destroy_region`: idempotent against a missing map entry; heap destruction
    /// (close + drop) is attempted regardless of whether the shard still had an entry.
    pub fn destroy_region(&self, region_id: u64) {
        let shard = self.shard_for(region_id);
        if let Some(record) = shard.remove(region_id) {
            record.heap.write().close();
        }
    }

    /// §4.A `resize_region`: opens the heap if needed, then grows it in place.
    pub fn resize_region(&self, region_id: u64, new_size: u64) -> FamResult<()> {
        let shard = self.shard_for(region_id);
        let record = shard
            .get(region_id)
            .ok_or_else(|| FamError::not_found(format!("no heap for region {region_id}")))?;
        let mut heap = record.heap.write();
        if !heap.is_open() {
            heap.open()
                .map_err(|e| FamError::resource(format!("HEAP_NOT_OPENED: {}", e.message)))?;
        }
        let rounded = raw_align_up(new_size as usize, MIN_REGION_SIZE) as u64;
        heap.resize(rounded)
    }

    /// §4.A `allocate`: round up to `MIN_OBJ_SIZE`, retry once after `merge()` on
    /// failure.
    pub fn allocate(&self, region_id: u64, size: u64) -> FamResult<u64> {
        let shard = self.shard_for(region_id);
        let record = shard
            .get(region_id)
            .ok_or_else(|| FamError::not_found(format!("no heap for region {region_id}")))?;
        let mut heap = record.heap.write();
        match heap.alloc_offset(size) {
            Ok(offset) => Ok(offset),
            Err(_) => {
                heap.merge();
                heap.alloc_offset(size)
            }
        }
    }

    /// §4.A `deallocate`: if the pool has delayed-free workers, the actual free is
    /// deferred via [`crate::allocator::epoch::EpochDomain::defer_and_advance`] so a
    /// concurrent reader pinned in an earlier epoch never observes the offset reused
    /// before the epoch has advanced past its pin; otherwise it is freed immediately on
    /// the caller's thread. The deferred path returns `Ok(())` once the free is queued,
    /// not once it has run; a failure surfacing later is logged rather than returned,
    /// since by then the original caller is long gone.
    pub fn deallocate(&self, region_id: u64, offset: u64) -> FamResult<()> {
        let shard = self.shard_for(region_id);
        let record = shard
            .get(region_id)
            .ok_or_else(|| FamError::not_found(format!("no heap for region {region_id}")))?;
        if self.has_delayed_free_workers() {
            shard.epoch().defer_and_advance(move || {
                if let Err(e) = record.heap.write().free(offset) {
                    crate::util::log::error!(
                        "deferred free of region {region_id} offset {offset} failed: {}",
                        e.message
                    );
                }
            });
            Ok(())
        } else {
            record.heap.write().free(offset)
        }
    }

    /// §4.A `get_local_pointer`.
    pub fn get_local_pointer(&self, region_id: u64, offset: u64) -> FamResult<Address> {
        let shard = self.shard_for(region_id);
        let record = shard
            .get(region_id)
            .ok_or_else(|| FamError::not_found(format!("no heap for region {region_id}")))?;
        record.heap.read().offset_to_local_ptr(offset)
    }

    pub fn is_region_open(&self, region_id: u64) -> bool {
        self.shard_for(region_id)
            .get(region_id)
            .map(|r| r.heap.read().is_open())
            .unwrap_or(false)
    }

    pub fn region_size(&self, region_id: u64) -> FamResult<u64> {
        let shard = self.shard_for(region_id);
        let record = shard
            .get(region_id)
            .ok_or_else(|| FamError::not_found(format!("no heap for region {region_id}")))?;
        Ok(record.heap.read().size_bytes())
    }

    /// §4.A `create_atl_root`: idempotent. Creates the reserved ATL pool on first boot,
    /// allocates a root array of `MAX_ATOMIC_THREADS * size_of::<u64>()` bytes, and
    /// remembers its offset for the lifetime of this allocator. A fresh boot (i.e. a
    /// fresh `PoolAllocator`) always recreates it — see the "no crash-recovery
    /// protocol" note in `DESIGN.md`.
    pub fn create_atl_root(&self) -> FamResult<u64> {
        if let Some(offset) = self.existing_atl_root() {
            return Ok(offset);
        }
        let region_id = ATOMIC_REGION_ID as u64;
        if self.shard_for(region_id).get(region_id).is_none() {
            self.create_region(region_id, MIN_REGION_SIZE as u64)?;
        }
        let root_bytes = (MAX_ATOMIC_THREADS * std::mem::size_of::<u64>()) as u64;
        let offset = self.allocate(region_id, root_bytes)?;
        match self.atl_root_offset.compare_exchange(
            NO_ATL_ROOT,
            offset,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(offset),
            // Lost the race to another caller; release our redundant allocation and
            // report the winner's offset, matching the idempotent contract.
            Err(winner) => {
                let _ = self.deallocate(region_id, offset);
                Ok(winner)
            }
        }
    }

    fn existing_atl_root(&self) -> Option<u64> {
        let v = self.atl_root_offset.load(Ordering::Acquire);
        if v == NO_ATL_ROOT {
            None
        } else {
            Some(v)
        }
    }
}

/// `MIN_OBJ_SIZE` re-exported for callers that only have a `PoolAllocator` in scope.
pub const MIN_OBJECT_SIZE: u64 = MIN_OBJ_SIZE as u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_allocate_deallocate_destroy() {
        let pool = PoolAllocator::new(0);
        pool.create_region(1, 1).unwrap();
        assert_eq!(pool.region_size(1).unwrap(), MIN_REGION_SIZE as u64);
        let off = pool.allocate(1, 1024).unwrap();
        assert_eq!(off % MIN_OBJECT_SIZE, 0);
        pool.deallocate(1, off).unwrap();
        pool.destroy_region(1);
        assert!(pool.allocate(1, 1).is_err());
    }

    #[test]
    fn create_region_rejects_duplicate() {
        let pool = PoolAllocator::new(0);
        pool.create_region(1, 1).unwrap();
        assert!(pool.create_region(1, 1).is_err());
    }

    #[test]
    fn destroy_region_is_idempotent() {
        let pool = PoolAllocator::new(0);
        pool.destroy_region(42);
        pool.create_region(42, 1).unwrap();
        pool.destroy_region(42);
        pool.destroy_region(42);
    }

    #[test]
    fn delayed_free_round_trip_under_workers() {
        let pool = PoolAllocator::new(2);
        pool.create_region(5, 1).unwrap();
        let mut offsets = Vec::new();
        for _ in 0..64 {
            offsets.push(pool.allocate(5, 128).unwrap());
        }
        for off in &offsets {
            pool.deallocate(5, *off).unwrap();
        }
        for _ in 0..64 {
            pool.allocate(5, 128).unwrap();
        }
    }

    /// §8 scenario 2: 64 items of 128 B freed in random order, then 64 freshly
    /// allocated, under two delayed-free workers. No two concurrently live items may
    /// ever share an offset.
    #[test]
    fn delayed_free_survives_random_free_order() {
        use rand::seq::SliceRandom;
        use rand::SeedableRng;

        let pool = PoolAllocator::new(2);
        pool.create_region(6, 1).unwrap();
        let mut offsets: Vec<u64> = (0..64).map(|_| pool.allocate(6, 128).unwrap()).collect();

        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0xFAE_FACE);
        offsets.shuffle(&mut rng);
        for off in &offsets {
            pool.deallocate(6, *off).unwrap();
        }

        let mut reallocated = std::collections::HashSet::new();
        for _ in 0..64 {
            let off = pool.allocate(6, 128).unwrap();
            assert!(reallocated.insert(off), "offset {off} handed out twice while live");
        }
    }

    #[test]
    fn create_atl_root_is_idempotent() {
        let pool = PoolAllocator::new(0);
        let a = pool.create_atl_root().unwrap();
        let b = pool.create_atl_root().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn get_local_pointer_round_trips() {
        let pool = PoolAllocator::new(0);
        pool.create_region(9, 1).unwrap();
        let off = pool.allocate(9, 8).unwrap();
        let ptr = pool.get_local_pointer(9, off).unwrap();
        unsafe {
            ptr.store::<u64>(42);
            assert_eq!(ptr.load::<u64>(), 42);
        }
    }
}
