//! Per-shard ATL ring buffer, §4.F.
//!
//! The control block (`front`/`rear`/`capacity`/`size`) is kept as ordinary atomics in
//! this process rather than serialized into FAM: `atomic_queue.h`'s `qData` struct
//! keeps them alongside the message array so a crash-recovery protocol could someday
//! read them back, but the crash-recovery protocol is explicitly out of scope (§9) and
//! a fresh boot always reinitializes the queue — see `DESIGN.md`. The message slot
//! array itself lives inside the reserved ATL pool, addressed through
//! [`crate::allocator::pool::PoolAllocator`] like any other allocation, so a worker and
//! a concurrently pushing client thread are really reading and writing the same FAM
//! bytes a client-side RDMA peek could also observe.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::allocator::pool::PoolAllocator;
use crate::atl::message::{MessageFlags, MessageHeader, MessageSlot};
use crate::error::{FamError, FamResult};
use crate::util::address::Address;

/// One shard's fixed-capacity queue of [`MessageSlot`]s, backed by FAM bytes allocated
/// from `region_id` (always [`crate::util::constants::ATOMIC_REGION_ID`]).
pub struct AtlQueue {
    base: Address,
    capacity: usize,
    /// Monotonically increasing; `head % capacity` is the next slot the worker reads.
    head: AtomicUsize,
    /// Monotonically increasing; a producer claims `tail.fetch_add(1) % capacity`.
    tail: AtomicUsize,
    len: AtomicUsize,
}

impl AtlQueue {
    /// Allocate `capacity` message slots from `pool` inside `region_id` and return a
    /// queue backed by them.
    pub fn create(pool: &PoolAllocator, region_id: u64, capacity: usize) -> FamResult<Self> {
        let slot_bytes = std::mem::size_of::<MessageSlot>() as u64;
        let total = slot_bytes * capacity as u64;
        let offset = pool.allocate(region_id, total)?;
        let base = pool.get_local_pointer(region_id, offset)?;
        for i in 0..capacity {
            let slot_addr = base + i * std::mem::size_of::<MessageSlot>();
            unsafe {
                slot_addr.store(MessageSlot::empty());
            }
        }
        Ok(Self {
            base,
            capacity,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            len: AtomicUsize::new(0),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    fn slot_addr(&self, index: usize) -> Address {
        self.base + (index % self.capacity) * std::mem::size_of::<MessageSlot>()
    }

    /// Push a new message. Fails with `ATL_QUEUE_FULL` immediately rather than
    /// blocking, matching the spec's "push on full returns immediately" contract.
    /// `payload` is copied into the slot's inline region iff it fits; larger payloads
    /// are expected to already be staged in FAM by the caller and the header is
    /// expected to carry `BUFFER_ALLOCATED` already set.
    pub fn push(&self, mut header: MessageHeader, payload: &[u8]) -> FamResult<()> {
        loop {
            let current_len = self.len.load(Ordering::Acquire);
            if current_len >= self.capacity {
                return Err(FamError::resource("ATL_QUEUE_FULL"));
            }
            if self
                .len
                .compare_exchange(current_len, current_len + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let index = self.tail.fetch_add(1, Ordering::AcqRel);
        let slot_addr = self.slot_addr(index);

        if payload.len() <= crate::util::constants::MAX_DATA_IN_MSG {
            header.insert_flags(MessageFlags::CONTAIN_DATA);
        }
        header.insert_flags(MessageFlags::WRITE_IN_PROGRESS);

        let mut slot = MessageSlot::empty();
        slot.header = header;
        let n = payload.len().min(crate::util::constants::MAX_DATA_IN_MSG);
        slot.inline_payload[..n].copy_from_slice(&payload[..n]);
        unsafe {
            slot_addr.store(slot);
        }
        Ok(())
    }

    /// Non-destructive peek at the head message, if any.
    pub fn peek_head(&self) -> Option<MessageSlot> {
        if self.is_empty() {
            return None;
        }
        let index = self.head.load(Ordering::Acquire);
        let slot_addr = self.slot_addr(index);
        Some(unsafe { slot_addr.load::<MessageSlot>() })
    }

    /// Mark the head slot's header with `WRITE_COMPLETED` (visible to a client polling
    /// the slot over RDMA) and advance the queue past it, freeing the slot for reuse.
    pub fn complete_and_pop(&self) {
        let index = self.head.load(Ordering::Acquire);
        let slot_addr = self.slot_addr(index);
        unsafe {
            let mut slot = slot_addr.load::<MessageSlot>();
            slot.header.set_flags(
                (slot.header.flags() & !MessageFlags::WRITE_IN_PROGRESS) | MessageFlags::WRITE_COMPLETED,
            );
            slot_addr.store(slot);
        }
        self.head.fetch_add(1, Ordering::AcqRel);
        self.len.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::MIN_REGION_SIZE;

    fn header() -> MessageHeader {
        let mut h: MessageHeader = bytemuck::Zeroable::zeroed();
        h.set_flags(MessageFlags::WRITE);
        h
    }

    #[test]
    fn push_peek_complete_round_trip() {
        let pool = PoolAllocator::new(0);
        pool.create_region(0, MIN_REGION_SIZE as u64).unwrap();
        let queue = AtlQueue::create(&pool, 0, 4).unwrap();
        assert!(queue.is_empty());

        queue.push(header(), b"hello").unwrap();
        assert!(!queue.is_empty());

        let slot = queue.peek_head().unwrap();
        assert!(slot.header.flags().contains(MessageFlags::WRITE));
        assert_eq!(&slot.inline_payload[..5], b"hello");

        queue.complete_and_pop();
        assert!(queue.is_empty());
    }

    #[test]
    fn push_fails_when_full() {
        let pool = PoolAllocator::new(0);
        pool.create_region(0, MIN_REGION_SIZE as u64).unwrap();
        let queue = AtlQueue::create(&pool, 0, 2).unwrap();
        queue.push(header(), &[]).unwrap();
        queue.push(header(), &[]).unwrap();
        assert!(queue.push(header(), &[]).is_err());
        queue.complete_and_pop();
        queue.push(header(), &[]).unwrap();
    }
}
