//! Memory Registration Map, §4.B.
//!
//! Two-level lock structure so that registering or deregistering a data item in region
//! A never contends with the same operation in region B: an outer map from `region_id`
//! to a per-region map, each guarded by its own lock. Grounded on
//! `Fam_Memory_Registration_Libfabric::register_memory`/`deregister_memory`/
//! `deregister_region_memory` in
//! `examples/original_source/src/memory_service/fam_memory_registration_libfabric.cpp`:
//! that code takes a read lock on the outer map, double-checked-locks a new per-region
//! map into existence under a write lock if absent, then does the actual
//! register/deregister under the per-region map's own lock. The access-key packing
//! (region/item/mode bits) lives in [`crate::util::constants`] and is reused verbatim.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{FamError, FamResult};
use crate::fabric::{AccessMode, FabricKey, FabricProvider};
use crate::util::address::Address;
use crate::util::constants::{ITEM_MASK, ITEM_SHIFT, MIN_OBJ_SIZE, REGION_MASK, REGION_SHIFT};

/// Reserved access key for the cluster-wide fence memory, registered once at startup and
/// deregistered at shutdown, never through the per-region paths below.
pub const FENCE_KEY: u64 = 0;

/// Pack `(region_id, item_id, mode)` into a single access key, §3.
pub fn pack_access_key(region_id: u64, item_id: u64, mode: AccessMode) -> u64 {
    ((region_id & REGION_MASK) << REGION_SHIFT) | ((item_id & ITEM_MASK) << ITEM_SHIFT) | mode.bit()
}

/// `offset -> item_id`, the granularity at which registration (and the access-key
/// packing) operates.
pub fn item_id_for_offset(offset: u64) -> u64 {
    offset / MIN_OBJ_SIZE as u64
}

struct RegionMap {
    /// Keyed by the *requested* access key; a provider may hand back a different
    /// `FabricKey` which is what gets stored and later deregistered.
    entries: RwLock<HashMap<u64, FabricKey>>,
}

impl RegionMap {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

/// Owns every region's registered windows. One instance is shared by the whole server;
/// `fabric` is the collaborator actually doing the RDMA registration.
pub struct RegistrationMap<F: FabricProvider> {
    fabric: Arc<F>,
    regions: RwLock<HashMap<u64, Arc<RegionMap>>>,
}

impl<F: FabricProvider> RegistrationMap<F> {
    pub fn new(fabric: Arc<F>) -> Self {
        Self {
            fabric,
            regions: RwLock::new(HashMap::new()),
        }
    }

    /// Register fence memory once, at startup, outside the per-region map entirely —
    /// it has no region or item id of its own.
    pub fn register_fence_memory(&self, base: Address, len: usize) -> FamResult<FabricKey> {
        self.fabric
            .register(base, len, FENCE_KEY, AccessMode::ReadWrite)
    }

    pub fn deregister_fence_memory(&self, key: FabricKey) -> FamResult<()> {
        self.fabric.deregister(key)
    }

    fn region_map(&self, region_id: u64) -> Arc<RegionMap> {
        if let Some(existing) = self.regions.read().get(&region_id) {
            return existing.clone();
        }
        let mut regions = self.regions.write();
        regions
            .entry(region_id)
            .or_insert_with(|| Arc::new(RegionMap::new()))
            .clone()
    }

    /// Register a `(region_id, offset)` data item window for the given access mode,
    /// registering it with the fabric on first use and returning the cached fabric key
    /// on every subsequent call for the same `(item_id, mode)` pair.
    pub fn register_window(
        &self,
        region_id: u64,
        offset: u64,
        base: Address,
        size: u64,
        mode: AccessMode,
    ) -> FamResult<FabricKey> {
        let item_id = item_id_for_offset(offset);
        let requested_key = pack_access_key(region_id, item_id, mode);
        let region_map = self.region_map(region_id);

        if let Some(key) = region_map.entries.read().get(&requested_key) {
            return Ok(*key);
        }
        let mut entries = region_map.entries.write();
        if let Some(key) = entries.get(&requested_key) {
            return Ok(*key);
        }
        let key = self
            .fabric
            .register(base, size as usize, requested_key, mode)?;
        entries.insert(requested_key, key);
        Ok(key)
    }

    /// Deregister both the read-only and read-write windows that may exist for
    /// `(region_id, offset)`, matching `deregister_memory`'s "try both keys" behavior.
    pub fn deregister_item(&self, region_id: u64, offset: u64) -> FamResult<()> {
        let item_id = item_id_for_offset(offset);
        let Some(region_map) = self.regions.read().get(&region_id).cloned() else {
            return Ok(());
        };
        let mut entries = region_map.entries.write();
        for mode in [AccessMode::ReadOnly, AccessMode::ReadWrite] {
            let key = pack_access_key(region_id, item_id, mode);
            if let Some(fabric_key) = entries.remove(&key) {
                self.fabric.deregister(fabric_key)?;
            }
        }
        Ok(())
    }

    /// Deregister and drop every window registered for `region_id`, in preparation for
    /// `destroy_region`. Errors from individual deregistrations are collected and the
    /// first one is returned, but every window is attempted regardless.
    pub fn deregister_region(&self, region_id: u64) -> FamResult<()> {
        let Some(region_map) = self.regions.write().remove(&region_id) else {
            return Ok(());
        };
        let mut first_err = None;
        let entries = std::mem::take(&mut *region_map.entries.write());
        for (_key, fabric_key) in entries {
            if let Err(e) = self.fabric.deregister(fabric_key) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_registered(&self, region_id: u64, offset: u64, mode: AccessMode) -> bool {
        let item_id = item_id_for_offset(offset);
        let key = pack_access_key(region_id, item_id, mode);
        self.regions
            .read()
            .get(&region_id)
            .map(|r| r.entries.read().contains_key(&key))
            .unwrap_or(false)
    }
}

/// Surfaced to RPC handlers that need to reject an access before it reaches the fabric
/// layer (e.g. a write request against a read-only window).
pub fn check_permission(requested: AccessMode, granted: AccessMode) -> FamResult<()> {
    match (requested, granted) {
        (AccessMode::ReadOnly, _) => Ok(()),
        (AccessMode::ReadWrite, AccessMode::ReadWrite) => Ok(()),
        (AccessMode::ReadWrite, AccessMode::ReadOnly) => {
            Err(FamError::no_permission("write requested against a read-only window"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::testing::LoopbackFabric;
    use crate::mmap_anno_test;
    use crate::util::os::{OSMemory, OS};

    fn map() -> RegistrationMap<LoopbackFabric> {
        RegistrationMap::new(Arc::new(LoopbackFabric::new(false)))
    }

    #[test]
    fn register_window_is_cached_on_repeat_calls() {
        let map = map();
        let base = OS::mmap_anywhere(4096, mmap_anno_test!()).unwrap();
        let k1 = map
            .register_window(1, 0, base, 128, AccessMode::ReadWrite)
            .unwrap();
        let k2 = map
            .register_window(1, 0, base, 128, AccessMode::ReadWrite)
            .unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn deregister_item_removes_both_modes() {
        let map = map();
        let base = OS::mmap_anywhere(4096, mmap_anno_test!()).unwrap();
        map.register_window(1, 0, base, 128, AccessMode::ReadOnly)
            .unwrap();
        map.register_window(1, 0, base, 128, AccessMode::ReadWrite)
            .unwrap();
        map.deregister_item(1, 0).unwrap();
        assert!(!map.is_registered(1, 0, AccessMode::ReadOnly));
        assert!(!map.is_registered(1, 0, AccessMode::ReadWrite));
    }

    #[test]
    fn deregister_region_drops_every_window() {
        let map = map();
        let base = OS::mmap_anywhere(8192, mmap_anno_test!()).unwrap();
        map.register_window(2, 0, base, 128, AccessMode::ReadWrite)
            .unwrap();
        map.register_window(2, 128, base + 128usize, 128, AccessMode::ReadWrite)
            .unwrap();
        map.deregister_region(2).unwrap();
        assert!(!map.is_registered(2, 0, AccessMode::ReadWrite));
        assert!(!map.is_registered(2, 128, AccessMode::ReadWrite));
        // idempotent
        map.deregister_region(2).unwrap();
    }

    #[test]
    fn check_permission_rejects_write_against_read_only() {
        assert!(check_permission(AccessMode::ReadWrite, AccessMode::ReadOnly).is_err());
        assert!(check_permission(AccessMode::ReadWrite, AccessMode::ReadWrite).is_ok());
        assert!(check_permission(AccessMode::ReadOnly, AccessMode::ReadOnly).is_ok());
    }
}
