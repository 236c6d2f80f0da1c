//! Atomic Transfer Library, §4.F.
//!
//! A fixed pool of single-consumer worker threads, each owning a ring buffer of
//! [`message::MessageSlot`]s allocated inside the reserved ATL pool
//! ([`crate::util::constants::ATOMIC_REGION_ID`]). Clients enqueue get/put/scatter/
//! gather requests; a worker drains its shard's queue and performs the requested RDMA
//! against the client's registered buffer. Running ATL is optional — configuring zero
//! workers disables it and every ATL RPC fails with `ATL_NOT_ENABLED`, matching the
//! failure semantics called out for a disabled ATL.

pub mod address_book;
pub mod message;
pub mod queue;
pub mod worker;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::allocator::pool::PoolAllocator;
use crate::atl::address_book::AddressBook;
use crate::atl::message::MessageHeader;
use crate::atl::queue::AtlQueue;
use crate::atl::worker::AtlWorker;
use crate::error::{FamError, FamResult};
use crate::fabric::FabricProvider;
use crate::util::constants::ATOMIC_REGION_ID;

/// Owns every shard's queue and worker thread. Shared by the whole server.
pub struct AtlSystem<F: FabricProvider> {
    queues: Vec<Arc<AtlQueue>>,
    workers: Vec<AtlWorker>,
}

impl<F: FabricProvider + 'static> AtlSystem<F> {
    /// Build an ATL system with `num_workers` shards of `queue_capacity` messages
    /// each. `num_workers == 0` is legal and disables ATL entirely.
    pub fn new(
        pool: Arc<PoolAllocator>,
        fabric: Arc<F>,
        num_workers: usize,
        queue_capacity: usize,
    ) -> FamResult<Self> {
        if num_workers == 0 {
            return Ok(Self {
                queues: Vec::new(),
                workers: Vec::new(),
            });
        }

        let region_id = ATOMIC_REGION_ID as u64;
        if !pool.is_region_open(region_id) {
            pool.create_atl_root()?;
        }

        let address_book = Arc::new(AddressBook::new(fabric.clone()));
        let mut queues = Vec::with_capacity(num_workers);
        let mut workers = Vec::with_capacity(num_workers);
        for shard_index in 0..num_workers {
            let queue = Arc::new(AtlQueue::create(&pool, region_id, queue_capacity)?);
            queues.push(queue.clone());
            workers.push(AtlWorker::spawn(
                shard_index,
                queue,
                pool.clone(),
                fabric.clone(),
                address_book.clone(),
            ));
        }
        Ok(Self { queues, workers })
    }

    pub fn is_enabled(&self) -> bool {
        !self.queues.is_empty()
    }

    pub fn num_shards(&self) -> usize {
        self.queues.len()
    }

    fn shard_for(&self, region_id: u64, offset: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        region_id.hash(&mut hasher);
        offset.hash(&mut hasher);
        (hasher.finish() as usize) % self.queues.len()
    }

    /// Enqueue a request against `(region_id, offset)`, selecting a shard
    /// deterministically from those two values so the same data item always lands on
    /// the same worker.
    pub fn enqueue(&self, region_id: u64, offset: u64, header: MessageHeader, payload: &[u8]) -> FamResult<()> {
        if !self.is_enabled() {
            return Err(FamError::unimplemented("ATL_NOT_ENABLED"));
        }
        let shard = self.shard_for(region_id, offset);
        self.queues[shard].push(header, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atl::message::MessageFlags;
    use crate::fabric::testing::LoopbackFabric;
    use crate::util::constants::MIN_REGION_SIZE;

    #[test]
    fn disabled_atl_rejects_enqueue() {
        let pool = Arc::new(PoolAllocator::new(0));
        let fabric = Arc::new(LoopbackFabric::new(false));
        let system = AtlSystem::new(pool, fabric, 0, 16).unwrap();
        assert!(!system.is_enabled());
        let header: MessageHeader = bytemuck::Zeroable::zeroed();
        assert!(system.enqueue(1, 0, header, &[]).is_err());
    }

    #[test]
    fn enqueue_same_item_always_lands_on_same_shard() {
        let pool = Arc::new(PoolAllocator::new(0));
        pool.create_region(5, MIN_REGION_SIZE as u64).unwrap();
        let fabric = Arc::new(LoopbackFabric::new(false));
        let system = AtlSystem::new(pool, fabric, 4, 8).unwrap();
        let a = system.shard_for(5, 128);
        let b = system.shard_for(5, 128);
        assert_eq!(a, b);
    }

    #[test]
    fn enqueue_and_drain_through_a_real_worker() {
        let pool = Arc::new(PoolAllocator::new(0));
        pool.create_region(7, MIN_REGION_SIZE as u64).unwrap();
        let target_offset = pool.allocate(7, 128).unwrap();
        let fabric = Arc::new(LoopbackFabric::new(false));
        let system = AtlSystem::new(pool.clone(), fabric, 1, 8).unwrap();

        let mut header: MessageHeader = bytemuck::Zeroable::zeroed();
        header.target_region_id = 7;
        header.target_offset = target_offset;
        header.op_size = 4;
        header.set_flags(MessageFlags::WRITE);
        system.enqueue(7, target_offset, header, &[9, 9, 9, 9]).unwrap();

        let ptr = pool.get_local_pointer(7, target_offset).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            let byte: u8 = unsafe { ptr.load::<u8>() };
            if byte == 9 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "worker never drained the message");
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
    }
}
