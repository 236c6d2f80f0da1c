//! ATL worker loop, §4.F.
//!
//! One OS thread per shard, matching the design note that ATL provides async
//! semantics to clients via message passing rather than leaning on an async runtime on
//! the server. Grounded on the pseudocode given for the worker loop: peek the head
//! message non-destructively, dispatch on its flag, mark `WRITE_COMPLETED`, pop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::allocator::pool::PoolAllocator;
use crate::atl::address_book::AddressBook;
use crate::atl::message::{MessageFlags, MessageHeader, MessageSlot};
use crate::atl::queue::AtlQueue;
use crate::error::{FamError, FamResult};
use crate::fabric::{AccessMode, FabricKey, FabricProvider};
use crate::mmap_anno_test;
use crate::util::address::Address;
use crate::util::os::{OSMemory, OS};

/// Dispatches a single message against `pool`'s FAM bytes and the client's registered
/// buffer over `fabric`. Kept free of any queue/thread concerns so it can be unit
/// tested without spawning a worker.
pub fn dispatch<F: FabricProvider>(
    pool: &PoolAllocator,
    fabric: &F,
    address_book: &AddressBook<F>,
    slot: &mut MessageSlot,
) -> FamResult<()> {
    let header = &slot.header;
    let peer = address_book.resolve(header.client_address_bytes())?;
    let client_key = FabricKey(header.client_memory_key);
    let target = pool.get_local_pointer(header.target_region_id, header.target_offset)?;
    let flags = header.flags();

    if flags.contains(MessageFlags::READ) {
        fabric
            .write(&peer, client_key, header.client_buffer_offset, target, header.op_size as usize)
            .map(drop)
    } else if flags.contains(MessageFlags::WRITE) {
        dispatch_write(fabric, &peer, header, target, &slot.inline_payload)
    } else if flags.contains(MessageFlags::SCATTER_STRIDE) {
        dispatch_stride(fabric, &peer, header, target, true)
    } else if flags.contains(MessageFlags::GATHER_STRIDE) {
        dispatch_stride(fabric, &peer, header, target, false)
    } else if flags.contains(MessageFlags::SCATTER_INDEX) {
        dispatch_index(fabric, &peer, header, target, true)
    } else if flags.contains(MessageFlags::GATHER_INDEX) {
        dispatch_index(fabric, &peer, header, target, false)
    } else {
        Err(FamError::unimplemented("ATL message carries no recognized operation flag"))
    }
}

fn dispatch_write<F: FabricProvider>(
    fabric: &F,
    peer: &crate::fabric::FabricAddress,
    header: &MessageHeader,
    target: Address,
    inline_payload: &[u8],
) -> FamResult<()> {
    let size = header.op_size as usize;
    if header.flags().contains(MessageFlags::CONTAIN_DATA) {
        unsafe {
            std::ptr::copy_nonoverlapping(inline_payload.as_ptr(), target.to_mut_ptr::<u8>(), size);
        }
        Ok(())
    } else {
        let client_key = FabricKey(header.client_memory_key);
        let handle = fabric.read(peer, client_key, header.client_buffer_offset, target, size)?;
        let _ = handle;
        Ok(())
    }
}

fn dispatch_stride<F: FabricProvider>(
    fabric: &F,
    peer: &crate::fabric::FabricAddress,
    header: &MessageHeader,
    target: Address,
    is_scatter: bool,
) -> FamResult<()> {
    let client_key = FabricKey(header.client_memory_key);
    let element_size = header.op_element_size as usize;
    for i in 0..header.op_n_elements {
        let fam_offset = header.op_first_element + i * header.op_stride;
        let fam_addr = target + fam_offset as usize;
        let client_offset = header.client_buffer_offset + i * header.op_element_size;
        if is_scatter {
            fabric.read(peer, client_key, client_offset, fam_addr, element_size)?;
        } else {
            fabric.write(peer, client_key, client_offset, fam_addr, element_size)?;
        }
    }
    Ok(())
}

fn dispatch_index<F: FabricProvider>(
    fabric: &F,
    peer: &crate::fabric::FabricAddress,
    header: &MessageHeader,
    target: Address,
    is_scatter: bool,
) -> FamResult<()> {
    let client_key = FabricKey(header.client_memory_key);
    let n = header.op_n_elements as usize;
    let element_size = header.op_element_size as usize;

    let index_bytes = n * std::mem::size_of::<u64>();
    let scratch = OS::mmap_anywhere(index_bytes.max(1), mmap_anno_test!())?;
    fabric.read(peer, client_key, header.client_buffer_offset, scratch, index_bytes)?;

    let elements_base = header.client_buffer_offset + index_bytes as u64;
    for i in 0..n {
        let index: u64 = unsafe { (scratch + i * std::mem::size_of::<u64>()).load::<u64>() };
        let fam_addr = target + (index as usize * element_size);
        let client_offset = elements_base + (i * element_size) as u64;
        if is_scatter {
            fabric.read(peer, client_key, client_offset, fam_addr, element_size)?;
        } else {
            fabric.write(peer, client_key, client_offset, fam_addr, element_size)?;
        }
    }
    OS::munmap(scratch, index_bytes.max(1)).map_err(|e| FamError::resource(e.to_string()))
}

/// A running ATL worker thread owning exactly one shard's queue.
pub struct AtlWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AtlWorker {
    pub fn spawn<F: FabricProvider + 'static>(
        shard_index: usize,
        queue: Arc<AtlQueue>,
        pool: Arc<PoolAllocator>,
        fabric: Arc<F>,
        address_book: Arc<AddressBook<F>>,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let span = tracing::info_span!("atl_worker", shard = shard_index);
        let handle = std::thread::Builder::new()
            .name(format!("fam-atl-{shard_index}"))
            .spawn(move || {
                let _entered = span.enter();
                tracing::info!("atl worker starting");
                while worker_running.load(Ordering::Acquire) {
                    let Some(mut slot) = queue.peek_head() else {
                        std::thread::yield_now();
                        continue;
                    };
                    // A failed client RDMA fails only this request; the queue still
                    // drains so it never blocks.
                    let _ = dispatch(&pool, fabric.as_ref(), address_book.as_ref(), &mut slot);
                    queue.complete_and_pop();
                }
                tracing::info!("atl worker stopping");
            })
            .expect("failed to spawn ATL worker thread");
        Self {
            running,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AtlWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::testing::LoopbackFabric;
    use crate::util::constants::MIN_REGION_SIZE;

    fn make_pool_and_target() -> (PoolAllocator, u64, u64) {
        let pool = PoolAllocator::new(0);
        pool.create_region(1, MIN_REGION_SIZE as u64).unwrap();
        let offset = pool.allocate(1, 128).unwrap();
        (pool, 1, offset)
    }

    #[test]
    fn write_with_contain_data_copies_inline_payload() {
        let (pool, region_id, offset) = make_pool_and_target();
        let fabric = LoopbackFabric::new(false);
        let address_book = AddressBook::new(Arc::new(LoopbackFabric::new(false)));

        let mut slot = MessageSlot::empty();
        slot.header.target_region_id = region_id;
        slot.header.target_offset = offset;
        slot.header.op_size = 4;
        slot.header.set_flags(MessageFlags::WRITE | MessageFlags::CONTAIN_DATA);
        slot.inline_payload[..4].copy_from_slice(&[1, 2, 3, 4]);

        dispatch(&pool, &fabric, &address_book, &mut slot).unwrap();

        let ptr = pool.get_local_pointer(region_id, offset).unwrap();
        let mut buf = [0u8; 4];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.to_ptr::<u8>(), buf.as_mut_ptr(), 4);
        }
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn scatter_stride_reads_each_element_from_client() {
        let (pool, region_id, offset) = make_pool_and_target();
        let fabric = LoopbackFabric::new(false);
        let address_book = AddressBook::new(Arc::new(LoopbackFabric::new(false)));

        let client_buf = OS::mmap_anywhere(256, mmap_anno_test!()).unwrap();
        for i in 0..4u64 {
            unsafe {
                (client_buf + (i * 8) as usize).store::<u64>(100 + i);
            }
        }
        let client_key = fabric
            .register(client_buf, 256, 42, AccessMode::ReadOnly)
            .unwrap();

        let mut slot = MessageSlot::empty();
        slot.header.target_region_id = region_id;
        slot.header.target_offset = offset;
        slot.header.client_memory_key = client_key.0;
        slot.header.client_buffer_offset = 0;
        slot.header.op_first_element = 0;
        slot.header.op_stride = 8;
        slot.header.op_element_size = 8;
        slot.header.op_n_elements = 4;
        slot.header.set_flags(MessageFlags::SCATTER_STRIDE);

        dispatch(&pool, &fabric, &address_book, &mut slot).unwrap();

        let target = pool.get_local_pointer(region_id, offset).unwrap();
        for i in 0..4u64 {
            unsafe {
                assert_eq!((target + (i * 8) as usize).load::<u64>(), 100 + i);
            }
        }
    }

    #[test]
    fn gather_stride_writes_each_element_to_client() {
        let (pool, region_id, offset) = make_pool_and_target();
        let fabric = LoopbackFabric::new(false);
        let address_book = AddressBook::new(Arc::new(LoopbackFabric::new(false)));
        let target = pool.get_local_pointer(region_id, offset).unwrap();
        for i in 0..4u64 {
            unsafe { (target + (i * 8) as usize).store::<u64>(200 + i) };
        }

        let client_buf = OS::mmap_anywhere(256, mmap_anno_test!()).unwrap();
        let client_key = fabric
            .register(client_buf, 256, 43, AccessMode::ReadWrite)
            .unwrap();

        let mut slot = MessageSlot::empty();
        slot.header.target_region_id = region_id;
        slot.header.target_offset = offset;
        slot.header.client_memory_key = client_key.0;
        slot.header.client_buffer_offset = 0;
        slot.header.op_first_element = 0;
        slot.header.op_stride = 8;
        slot.header.op_element_size = 8;
        slot.header.op_n_elements = 4;
        slot.header.set_flags(MessageFlags::GATHER_STRIDE);

        dispatch(&pool, &fabric, &address_book, &mut slot).unwrap();

        for i in 0..4u64 {
            unsafe {
                assert_eq!((client_buf + (i * 8) as usize).load::<u64>(), 200 + i);
            }
        }
    }

    /// `SCATTER_INDEX`/`GATHER_INDEX` ship the index vector first, then the elements,
    /// back to back in the client buffer. Generated with `paste` so each direction gets
    /// its own named test instead of one test quietly covering both.
    macro_rules! index_round_trip {
        ($name:ident, $flag:expr, $is_scatter:expr) => {
            paste::paste! {
                #[test]
                fn [<$name _round_trips_four_elements>]() {
                    let (pool, region_id, offset) = make_pool_and_target();
                    let fabric = LoopbackFabric::new(false);
                    let address_book = AddressBook::new(Arc::new(LoopbackFabric::new(false)));
                    let target = pool.get_local_pointer(region_id, offset).unwrap();

                    const N: u64 = 4;
                    const ELEM: u64 = 8;
                    let index_bytes = (N * std::mem::size_of::<u64>() as u64) as usize;

                    let client_buf = OS::mmap_anywhere(4096, mmap_anno_test!()).unwrap();
                    let client_key = fabric.register(client_buf, 4096, 44, AccessMode::ReadWrite).unwrap();

                    // Indices select elements in reverse order, so a naive sequential
                    // copy would fail this test.
                    for i in 0..N {
                        unsafe { (client_buf + (i * 8) as usize).store::<u64>(N - 1 - i) };
                    }
                    if $is_scatter {
                        for i in 0..N {
                            unsafe {
                                (client_buf + index_bytes + (i * ELEM) as usize).store::<u64>(1000 + i)
                            };
                        }
                    } else {
                        for i in 0..N {
                            unsafe { (target + (i * ELEM) as usize).store::<u64>(2000 + i) };
                        }
                    }

                    let mut slot = MessageSlot::empty();
                    slot.header.target_region_id = region_id;
                    slot.header.target_offset = offset;
                    slot.header.client_memory_key = client_key.0;
                    slot.header.client_buffer_offset = 0;
                    slot.header.op_first_element = 0;
                    slot.header.op_stride = ELEM;
                    slot.header.op_element_size = ELEM;
                    slot.header.op_n_elements = N;
                    slot.header.set_flags($flag);

                    dispatch(&pool, &fabric, &address_book, &mut slot).unwrap();

                    if $is_scatter {
                        // Index i held value N-1-i, which carried source element
                        // 1000+i, so FAM element (N-1-i) should now hold 1000+i.
                        for i in 0..N {
                            unsafe {
                                assert_eq!((target + ((N - 1 - i) * ELEM) as usize).load::<u64>(), 1000 + i);
                            }
                        }
                    } else {
                        let elements_base = client_buf + index_bytes;
                        // Index i selects FAM element (N-1-i), which holds 2000+(N-1-i).
                        for i in 0..N {
                            unsafe {
                                assert_eq!(
                                    (elements_base + (i * ELEM) as usize).load::<u64>(),
                                    2000 + (N - 1 - i)
                                );
                            }
                        }
                    }
                }
            }
        };
    }

    index_round_trip!(scatter_index, MessageFlags::SCATTER_INDEX, true);
    index_round_trip!(gather_index, MessageFlags::GATHER_INDEX, false);
}
