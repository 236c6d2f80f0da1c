//! Server Resource Manager, §4.C.
//!
//! Grounded on `Fam_Server_Resource`/`Fam_Server_Resource_Manager` as used from
//! `Fam_Memory_Service_Direct::{register_region_memory, open_region_with_registration,
//! close_region, destroy_region}` in
//! `examples/original_source/src/memory_service/fam_memory_service_direct.cpp`: a region
//! resource carries a packed `(status, refcount)` word, opened/closed with reference
//! counting at either `Region` or `DataItem` granularity. The manager itself never
//! touches the fabric; it tells its caller (`crate::server`) *whether* a
//! registration/deregistration actually needs to happen, so that registering/
//! deregistering with the fabric happens exactly once per resource lifetime
//! regardless of how many overlapping opens are in flight. The `acquire_CAS_lock`/
//! `release_CAS_lock` RPCs in §6 are served by `server::CasLockTable` instead, since
//! that lock must be held across two separate RPC calls rather than a single method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{FamError, FamResult};

/// Granularity at which a region's resource is tracked: a whole region opened/closed
/// as a unit, or individual data items within it tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionLevel {
    Region,
    DataItem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceStatus {
    Released,
    Registered,
}

/// Status packed into the high bit of the resource word, refcount in the low 63 bits —
/// mirrors `CONCAT_STATUS_REFCNT`/`GET_STATUS`/`GET_REFCNT` from the original.
const STATUS_BIT: u64 = 1 << 63;
const REFCNT_MASK: u64 = STATUS_BIT - 1;

fn pack(status: ResourceStatus, refcount: u64) -> u64 {
    let bit = match status {
        ResourceStatus::Released => 0,
        ResourceStatus::Registered => STATUS_BIT,
    };
    bit | (refcount & REFCNT_MASK)
}

fn unpack(word: u64) -> (ResourceStatus, u64) {
    let status = if word & STATUS_BIT != 0 {
        ResourceStatus::Registered
    } else {
        ResourceStatus::Released
    };
    (status, word & REFCNT_MASK)
}

/// Per-region resource record.
pub struct ResourceRecord {
    state: AtomicU64,
    permission_level: PermissionLevel,
    /// Set when `destroy_region` ran while data items were still open at `DataItem`
    /// granularity; the last closer is responsible for finishing the release.
    destroyed: AtomicBool,
    /// §4.C: offsets `deallocate` marked "deallocated pending close" at `DataItem`
    /// granularity, drained and actually freed once the resource's refcount reaches
    /// zero and the region is deregistered.
    pending_deallocations: Mutex<Vec<u64>>,
}

impl ResourceRecord {
    fn new(permission_level: PermissionLevel) -> Self {
        Self {
            state: AtomicU64::new(pack(ResourceStatus::Released, 0)),
            permission_level,
            destroyed: AtomicBool::new(false),
            pending_deallocations: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self) -> ResourceStatus {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub fn refcount(&self) -> u64 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    pub fn permission_level(&self) -> PermissionLevel {
        self.permission_level
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn defer_dealloc(&self, offset: u64) {
        self.pending_deallocations.lock().push(offset);
    }

    fn take_pending_deallocations(&self) -> Vec<u64> {
        std::mem::take(&mut *self.pending_deallocations.lock())
    }
}

/// Outcome of [`ServerResourceManager::open_resource`]: tells the caller whether it is
/// the one responsible for actually registering with the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOutcome {
    pub needs_registration: bool,
    pub refcount: u64,
}

/// Outcome of [`ServerResourceManager::close_resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseOutcome {
    pub needs_deregistration: bool,
    pub refcount: u64,
}

/// Owns every region's resource record.
pub struct ServerResourceManager {
    resources: RwLock<HashMap<u64, Arc<ResourceRecord>>>,
}

impl ServerResourceManager {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
        }
    }

    fn record_for(&self, region_id: u64, permission_level: PermissionLevel) -> Arc<ResourceRecord> {
        if let Some(existing) = self.resources.read().get(&region_id) {
            return existing.clone();
        }
        let mut resources = self.resources.write();
        resources
            .entry(region_id)
            .or_insert_with(|| Arc::new(ResourceRecord::new(permission_level)))
            .clone()
    }

    pub fn find_resource(&self, region_id: u64) -> Option<Arc<ResourceRecord>> {
        self.resources.read().get(&region_id).cloned()
    }

    /// Open the resource for `region_id`, creating its record on first use.
    /// `init_only` opens the record without bumping the refcount (used when a caller
    /// wants the record to exist and be marked registered without counting this call
    /// as a live reference — e.g. a bare `register_region_memory`).
    pub fn open_resource(
        &self,
        region_id: u64,
        permission_level: PermissionLevel,
        init_only: bool,
    ) -> OpenOutcome {
        let record = self.record_for(region_id, permission_level);
        loop {
            let current = record.state.load(Ordering::Acquire);
            let (status, refcount) = unpack(current);
            let new_refcount = if init_only { refcount } else { refcount + 1 };
            let needs_registration = status == ResourceStatus::Released;
            let new_word = pack(ResourceStatus::Registered, new_refcount);
            if record
                .state
                .compare_exchange(current, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return OpenOutcome {
                    needs_registration,
                    refcount: new_refcount,
                };
            }
        }
    }

    /// Close a previously opened resource, decrementing its refcount. Once the
    /// refcount reaches zero the record transitions back to `Released` and the caller
    /// is told to actually deregister.
    pub fn close_resource(&self, region_id: u64) -> FamResult<CloseOutcome> {
        let record = self
            .find_resource(region_id)
            .ok_or_else(|| FamError::not_found(format!("no resource for region {region_id}")))?;
        loop {
            let current = record.state.load(Ordering::Acquire);
            let (_status, refcount) = unpack(current);
            let new_refcount = refcount.saturating_sub(1);
            let new_status = if new_refcount == 0 {
                ResourceStatus::Released
            } else {
                ResourceStatus::Registered
            };
            let new_word = pack(new_status, new_refcount);
            if record
                .state
                .compare_exchange(current, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(CloseOutcome {
                    needs_deregistration: new_refcount == 0,
                    refcount: new_refcount,
                });
            }
        }
    }

    /// Register region memory directly, with no refcounting — the "resource
    /// relinquishment disabled" path, where a region's registration simply lives for
    /// as long as the region does.
    pub fn register_region_memory(&self, region_id: u64, permission_level: PermissionLevel) {
        let record = self.record_for(region_id, permission_level);
        record
            .state
            .store(pack(ResourceStatus::Registered, 0), Ordering::Release);
    }

    pub fn unregister_region_memory(&self, region_id: u64) {
        if let Some(record) = self.find_resource(region_id) {
            record
                .state
                .store(pack(ResourceStatus::Released, 0), Ordering::Release);
        }
    }

    /// `destroy_region` resource-side bookkeeping: if the region still has live
    /// references (at either granularity), mark it destroyed and let the last
    /// `close_resource` finish the release; otherwise release immediately. Returns
    /// whether the caller must deregister the region's fabric windows now.
    pub fn destroy_region(&self, region_id: u64) -> bool {
        // A region that was created but never opened/registered has nothing to
        // coordinate with: there is no outstanding refcount to wait on and no
        // registration to defer, so destruction proceeds immediately.
        let Some(record) = self.find_resource(region_id) else {
            return true;
        };
        if record.refcount() > 0 {
            record.destroyed.store(true, Ordering::Release);
            false
        } else {
            self.resources.write().remove(&region_id);
            record.state.store(pack(ResourceStatus::Released, 0), Ordering::Release);
            true
        }
    }

    /// §4.C `deallocate` at `DataItem` granularity: record `offset` as "deallocated
    /// pending close" on `region_id`'s resource instead of freeing it now. Returns
    /// `false` (nothing deferred) when the region has no open resource to defer
    /// against, e.g. a region never opened for registration — there the offset can be
    /// freed immediately since no concurrent registration depends on it.
    pub fn defer_deallocation(&self, region_id: u64, offset: u64) -> bool {
        match self.find_resource(region_id) {
            Some(record) if record.permission_level() == PermissionLevel::DataItem => {
                record.defer_dealloc(offset);
                true
            }
            _ => false,
        }
    }

    /// Drain the offsets deferred by [`Self::defer_deallocation`] for `region_id`, to
    /// be actually freed by the caller once it is safe (the close path, after
    /// deregistration).
    pub fn take_pending_deallocations(&self, region_id: u64) -> Vec<u64> {
        self.find_resource(region_id)
            .map(|r| r.take_pending_deallocations())
            .unwrap_or_default()
    }
}

impl Default for ServerResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_open_requires_registration_subsequent_do_not() {
        let mgr = ServerResourceManager::new();
        let first = mgr.open_resource(1, PermissionLevel::Region, false);
        assert!(first.needs_registration);
        assert_eq!(first.refcount, 1);
        let second = mgr.open_resource(1, PermissionLevel::Region, false);
        assert!(!second.needs_registration);
        assert_eq!(second.refcount, 2);
    }

    #[test]
    fn close_resource_deregisters_only_at_zero_refcount() {
        let mgr = ServerResourceManager::new();
        mgr.open_resource(1, PermissionLevel::Region, false);
        mgr.open_resource(1, PermissionLevel::Region, false);
        let first_close = mgr.close_resource(1).unwrap();
        assert!(!first_close.needs_deregistration);
        let second_close = mgr.close_resource(1).unwrap();
        assert!(second_close.needs_deregistration);
    }

    #[test]
    fn init_only_open_does_not_bump_refcount() {
        let mgr = ServerResourceManager::new();
        let outcome = mgr.open_resource(1, PermissionLevel::Region, true);
        assert!(outcome.needs_registration);
        assert_eq!(outcome.refcount, 0);
    }

    #[test]
    fn destroy_region_defers_when_dataitem_refs_outstanding() {
        let mgr = ServerResourceManager::new();
        mgr.open_resource(1, PermissionLevel::DataItem, false);
        assert!(!mgr.destroy_region(1));
        assert!(mgr.find_resource(1).unwrap().is_destroyed());
        let close = mgr.close_resource(1).unwrap();
        assert!(close.needs_deregistration);
    }

    #[test]
    fn destroy_region_proceeds_when_never_opened() {
        let mgr = ServerResourceManager::new();
        assert!(mgr.destroy_region(1));
    }

    #[test]
    fn destroy_region_releases_immediately_with_no_refs() {
        let mgr = ServerResourceManager::new();
        mgr.register_region_memory(1, PermissionLevel::Region);
        assert!(mgr.destroy_region(1));
        assert!(mgr.find_resource(1).is_none());
    }

    #[test]
    fn defer_deallocation_only_applies_at_dataitem_granularity() {
        let mgr = ServerResourceManager::new();
        mgr.open_resource(1, PermissionLevel::Region, false);
        assert!(!mgr.defer_deallocation(1, 64));
        assert!(mgr.take_pending_deallocations(1).is_empty());

        mgr.open_resource(2, PermissionLevel::DataItem, false);
        assert!(mgr.defer_deallocation(2, 128));
        assert!(mgr.defer_deallocation(2, 256));
        assert_eq!(mgr.take_pending_deallocations(2), vec![128, 256]);
        assert!(mgr.take_pending_deallocations(2).is_empty());
    }

    #[test]
    fn defer_deallocation_on_unopened_region_is_not_deferred() {
        let mgr = ServerResourceManager::new();
        assert!(!mgr.defer_deallocation(1, 64));
    }
}
