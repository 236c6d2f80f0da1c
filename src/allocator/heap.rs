//! A single region's byte allocator.
//!
//! Offsets are allocated in units of [`MIN_OBJ_SIZE`] bytes on top of the unit-table
//! free-list algorithm in [`crate::util::freelist`]. The table itself is a plain
//! `Vec<i32>`; unlike the upstream allocator this crate has no use for an mmap-backed
//! table, since a heap's metadata is small and lives alongside the server process. The
//! bytes the offsets describe, however, are real: each open heap owns an anonymous
//! `mmap` mapping sized to the region, and `offset_to_local_ptr` hands out addresses
//! into it for `memcpy` and RDMA registration.

use crate::error::{FamError, FamResult};
use crate::util::address::Address;
use crate::util::constants::MIN_OBJ_SIZE;
use crate::util::freelist::FreeList;
use crate::util::os::{MmapAnnotation, OSMemory, OS};

/// `Vec<i32>`-backed free list table. Indexing follows
/// [`crate::util::freelist::FreeList::get_lo_entry`]'s convention: table index
/// `(unit + heads) << 1 [+ 1]`, so unit numbers in `-heads..=units` are all valid.
struct UnitTable {
    table: Vec<i32>,
    heads: i32,
    units: i32,
}

impl UnitTable {
    fn new(units: i32, heads: i32) -> Self {
        let len = (((units + heads) as usize) + 1) << 1;
        Self {
            table: vec![0; len],
            heads,
            units,
        }
    }
}

impl FreeList for UnitTable {
    fn head(&self) -> i32 {
        -1
    }

    fn heads(&self) -> i32 {
        self.heads
    }

    fn get_entry(&self, index: i32) -> i32 {
        self.table[index as usize]
    }

    fn set_entry(&mut self, index: i32, value: i32) {
        self.table[index as usize] = value;
    }
}

/// Whether a heap is open for allocation. A closed heap rejects `alloc_offset`/`free`,
/// and has no backing mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeapState {
    Open,
    Closed,
}

/// Owns one region's byte allocator and its backing bytes.
///
/// `alloc_offset`/`free` operate in bytes; internally they are rounded to
/// [`MIN_OBJ_SIZE`]-sized units before being handed to the free-list table.
pub struct Heap {
    region_id: u64,
    size_bytes: u64,
    free_list: UnitTable,
    state: HeapState,
    base: Option<Address>,
}

impl Heap {
    /// Create a heap covering `size_bytes`, which must already be a multiple of
    /// `MIN_OBJ_SIZE`. The heap starts closed; callers must `open()` it before use.
    pub fn create(region_id: u64, size_bytes: u64) -> FamResult<Self> {
        if size_bytes % MIN_OBJ_SIZE as u64 != 0 {
            return Err(FamError::resource(format!(
                "heap size {size_bytes} is not a multiple of MIN_OBJ_SIZE"
            )));
        }
        let units = (size_bytes / MIN_OBJ_SIZE as u64) as i32;
        let mut free_list = UnitTable::new(units, 1);
        free_list.initialize_heap(units, 1);
        Ok(Self {
            region_id,
            size_bytes,
            free_list,
            state: HeapState::Closed,
            base: None,
        })
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn is_open(&self) -> bool {
        self.state == HeapState::Open
    }

    /// Map the heap's backing bytes and mark it open. A no-op if already open, matching
    /// the "register-region-memory is idempotent" decision in `DESIGN.md`.
    pub fn open(&mut self) -> FamResult<()> {
        if self.is_open() {
            return Ok(());
        }
        let region_id = self.region_id;
        let base = Self::mmap_region(region_id, self.size_bytes)?;
        self.base = Some(base);
        self.state = HeapState::Open;
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(base) = self.base.take() {
            if let Err(e) = OS::munmap(base, self.size_bytes as usize) {
                crate::util::log::debug!("munmap failed for region {}: {e}", self.region_id);
            }
        }
        self.state = HeapState::Closed;
    }

    /// Translate an allocated offset to a local virtual address.
    pub fn offset_to_local_ptr(&self, offset: u64) -> FamResult<Address> {
        let base = self.base.ok_or_else(|| {
            FamError::resource(format!("heap for region {} is not open", self.region_id))
        })?;
        if offset >= self.size_bytes {
            return Err(FamError::out_of_range(format!(
                "offset {offset} out of range for region {} (size {})",
                self.region_id, self.size_bytes
            )));
        }
        Ok(base + offset as usize)
    }

    /// Allocate `size_bytes` and return the offset of the first byte, or
    /// `HEAP_ALLOCATE_FAILED` as a `Resource` error if the heap has no room.
    pub fn alloc_offset(&mut self, size_bytes: u64) -> FamResult<u64> {
        if !self.is_open() {
            return Err(FamError::resource(format!(
                "heap for region {} is not open",
                self.region_id
            )));
        }
        let units = bytes_to_units(size_bytes);
        let unit = self.free_list.alloc(units);
        if unit == crate::util::freelist::FAILURE {
            return Err(FamError::resource(format!(
                "HEAP_ALLOCATE_FAILED: no {units}-unit run free in region {}",
                self.region_id
            )));
        }
        Ok(unit as u64 * MIN_OBJ_SIZE as u64)
    }

    /// Free a previously allocated offset.
    pub fn free(&mut self, offset: u64) -> FamResult<()> {
        if !self.is_open() {
            return Err(FamError::resource(format!(
                "heap for region {} is not open",
                self.region_id
            )));
        }
        let unit = (offset / MIN_OBJ_SIZE as u64) as i32;
        self.free_list.free(unit, false);
        Ok(())
    }

    /// Attempt to recover fragmented free space. Since this free list coalesces
    /// adjacent runs eagerly on every `free`, there is no deferred coalescing work to
    /// perform; callers retry `alloc_offset` after `merge()` purely so a future
    /// allocator backed by lazier coalescing can slot in behind the same contract.
    pub fn merge(&mut self) {}

    /// Grow the heap in place. The free list is rebuilt with the new unit count and
    /// the backing mapping is replaced by a larger one with the old bytes copied over;
    /// callers must only resize a heap with no live allocations below the new
    /// high-water mark, since the free list itself has no notion of "already allocated
    /// below the old boundary" beyond what its sentinels already encode.
    pub fn resize(&mut self, new_size_bytes: u64) -> FamResult<()> {
        if new_size_bytes % MIN_OBJ_SIZE as u64 != 0 {
            return Err(FamError::resource(format!(
                "new heap size {new_size_bytes} is not a multiple of MIN_OBJ_SIZE"
            )));
        }
        if new_size_bytes < self.size_bytes {
            return Err(FamError::out_of_range(
                "heap shrink is not supported".to_string(),
            ));
        }
        let units = (new_size_bytes / MIN_OBJ_SIZE as u64) as i32;
        let mut free_list = UnitTable::new(units, 1);
        free_list.initialize_heap(units, 1);
        self.free_list = free_list;

        if let Some(old_base) = self.base {
            let new_base = Self::mmap_region(self.region_id, new_size_bytes)?;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    old_base.to_ptr::<u8>(),
                    new_base.to_mut_ptr::<u8>(),
                    self.size_bytes as usize,
                );
            }
            if let Err(e) = OS::munmap(old_base, self.size_bytes as usize) {
                crate::util::log::debug!("munmap failed for region {}: {e}", self.region_id);
            }
            self.base = Some(new_base);
        }
        self.size_bytes = new_size_bytes;
        Ok(())
    }

    fn mmap_region(region_id: u64, size_bytes: u64) -> FamResult<Address> {
        let id_str = region_id.to_string();
        OS::mmap_anywhere(
            size_bytes as usize,
            &MmapAnnotation::Heap { region_id: &id_str },
        )
        .map_err(|e| {
            OS::log_mmap_error(&e, Address::ZERO, size_bytes as usize);
            FamError::resource(format!("HEAP_NOT_OPENED: mmap failed for region {region_id}: {e}"))
        })
    }
}

fn bytes_to_units(size_bytes: u64) -> i32 {
    let rounded = crate::util::conversions::raw_align_up(size_bytes as usize, MIN_OBJ_SIZE);
    (rounded / MIN_OBJ_SIZE) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_heap(size_bytes: u64) -> Heap {
        let mut heap = Heap::create(7, size_bytes).unwrap();
        heap.open().unwrap();
        heap
    }

    #[test]
    fn alloc_and_free_round_trip() {
        let mut heap = open_heap(64 * MIN_OBJ_SIZE as u64);
        let off = heap.alloc_offset(MIN_OBJ_SIZE as u64).unwrap();
        assert_eq!(off % MIN_OBJ_SIZE as u64, 0);
        heap.free(off).unwrap();
        let off2 = heap.alloc_offset(MIN_OBJ_SIZE as u64).unwrap();
        assert_eq!(off, off2);
    }

    #[test]
    fn alloc_rounds_up_to_min_obj_size() {
        let mut heap = open_heap(64 * MIN_OBJ_SIZE as u64);
        let off = heap.alloc_offset(1).unwrap();
        let off2 = heap.alloc_offset(1).unwrap();
        assert_eq!(off2 - off, MIN_OBJ_SIZE as u64);
    }

    #[test]
    fn alloc_fails_when_full() {
        let mut heap = open_heap(4 * MIN_OBJ_SIZE as u64);
        for _ in 0..4 {
            heap.alloc_offset(MIN_OBJ_SIZE as u64).unwrap();
        }
        assert!(heap.alloc_offset(MIN_OBJ_SIZE as u64).is_err());
    }

    #[test]
    fn closed_heap_rejects_alloc() {
        let mut heap = Heap::create(1, 4 * MIN_OBJ_SIZE as u64).unwrap();
        assert!(heap.alloc_offset(MIN_OBJ_SIZE as u64).is_err());
    }

    #[test]
    fn free_coalesces_adjacent_units() {
        let mut heap = open_heap(4 * MIN_OBJ_SIZE as u64);
        let a = heap.alloc_offset(MIN_OBJ_SIZE as u64).unwrap();
        let b = heap.alloc_offset(MIN_OBJ_SIZE as u64).unwrap();
        heap.free(a).unwrap();
        heap.free(b).unwrap();
        // Both single units should have coalesced back with the rest of the free
        // run, so a 2-unit allocation now succeeds immediately.
        let big = heap.alloc_offset(2 * MIN_OBJ_SIZE as u64).unwrap();
        assert_eq!(big, a.min(b));
    }

    #[test]
    fn offset_to_local_ptr_round_trips_bytes() {
        let mut heap = open_heap(4 * MIN_OBJ_SIZE as u64);
        let off = heap.alloc_offset(MIN_OBJ_SIZE as u64).unwrap();
        let ptr = heap.offset_to_local_ptr(off).unwrap();
        unsafe {
            ptr.store::<u32>(0x1234);
            assert_eq!(ptr.load::<u32>(), 0x1234);
        }
    }

    #[test]
    fn resize_preserves_existing_bytes() {
        let mut heap = open_heap(4 * MIN_OBJ_SIZE as u64);
        let off = heap.alloc_offset(MIN_OBJ_SIZE as u64).unwrap();
        unsafe {
            heap.offset_to_local_ptr(off).unwrap().store::<u32>(0xBEEF);
        }
        heap.resize(8 * MIN_OBJ_SIZE as u64).unwrap();
        unsafe {
            assert_eq!(heap.offset_to_local_ptr(off).unwrap().load::<u32>(), 0xBEEF);
        }
    }
}
