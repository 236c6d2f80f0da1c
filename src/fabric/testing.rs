//! An in-process loopback [`FabricProvider`] for tests.
//!
//! Real RDMA always crosses a network; this harness treats "remote" addresses as
//! ordinary process memory and serves `read`/`write` with a `memcpy`, so that
//! [`crate::copy`] and [`crate::atl`] can be exercised without a libfabric build. Not
//! wired into any non-test code path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{FamError, FamResult};
use crate::fabric::{AccessMode, CompletionHandle, FabricAddress, FabricKey, FabricProvider, ProgressMode};
use crate::util::address::Address;

struct Window {
    base: Address,
    len: usize,
}

/// Loopback provider: `register` remembers `(base, len)` under the requested key
/// verbatim (no key rewriting), and `read`/`write` copy directly between the caller's
/// local buffer and the registered window — standing in for what would otherwise be a
/// real RDMA transfer to a remote node.
pub struct LoopbackFabric {
    windows: Mutex<HashMap<u64, Window>>,
    next_addr_id: AtomicU64,
    manual_progress: bool,
}

impl LoopbackFabric {
    pub fn new(manual_progress: bool) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            next_addr_id: AtomicU64::new(1),
            manual_progress,
        }
    }

    fn window_for(&self, key: FabricKey) -> FamResult<(Address, usize)> {
        let windows = self.windows.lock().unwrap();
        windows
            .get(&key.0)
            .map(|w| (w.base, w.len))
            .ok_or_else(|| FamError::not_found(format!("no registered window for key {}", key.0)))
    }
}

impl FabricProvider for LoopbackFabric {
    fn progress_mode(&self) -> ProgressMode {
        if self.manual_progress {
            ProgressMode::Manual
        } else {
            ProgressMode::Auto
        }
    }

    fn requires_base_address(&self) -> bool {
        false
    }

    fn register(
        &self,
        base: Address,
        len: usize,
        requested_key: u64,
        _mode: AccessMode,
    ) -> FamResult<FabricKey> {
        self.windows
            .lock()
            .unwrap()
            .insert(requested_key, Window { base, len });
        Ok(FabricKey(requested_key))
    }

    fn deregister(&self, key: FabricKey) -> FamResult<()> {
        self.windows.lock().unwrap().remove(&key.0);
        Ok(())
    }

    fn read(
        &self,
        _peer: &FabricAddress,
        remote_key: FabricKey,
        remote_addr: u64,
        local: Address,
        len: usize,
    ) -> FamResult<CompletionHandle> {
        let (base, window_len) = self.window_for(remote_key)?;
        if remote_addr as usize + len > window_len {
            return Err(FamError::out_of_range("read exceeds registered window"));
        }
        let src = base + remote_addr as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(src.to_ptr::<u8>(), local.to_mut_ptr::<u8>(), len);
        }
        let handle = CompletionHandle::new();
        handle.mark_complete();
        Ok(handle)
    }

    fn write(
        &self,
        _peer: &FabricAddress,
        remote_key: FabricKey,
        remote_addr: u64,
        local: Address,
        len: usize,
    ) -> FamResult<CompletionHandle> {
        let (base, window_len) = self.window_for(remote_key)?;
        if remote_addr as usize + len > window_len {
            return Err(FamError::out_of_range("write exceeds registered window"));
        }
        let dst = base + remote_addr as usize;
        unsafe {
            std::ptr::copy_nonoverlapping(local.to_ptr::<u8>(), dst.to_mut_ptr::<u8>(), len);
        }
        let handle = CompletionHandle::new();
        handle.mark_complete();
        Ok(handle)
    }

    fn quiet(&self) -> FamResult<()> {
        Ok(())
    }

    fn poll_progress(&self) {}

    fn insert_address(&self, _addr: &FabricAddress) -> FamResult<()> {
        self.next_addr_id.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn local_address(&self) -> FamResult<FabricAddress> {
        Ok(FabricAddress(b"loopback".to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap_anno_test;
    use crate::util::os::{OSMemory, OS};

    #[test]
    fn read_and_write_round_trip_through_loopback() {
        let fabric = LoopbackFabric::new(false);
        let backing = OS::mmap_anywhere(4096, mmap_anno_test!()).unwrap();
        let key = fabric
            .register(backing, 4096, 77, AccessMode::ReadWrite)
            .unwrap();
        let local = OS::mmap_anywhere(4096, mmap_anno_test!()).unwrap();
        unsafe {
            local.store::<u64>(0xdead_beef);
        }
        let peer = FabricAddress(vec![1, 2, 3]);
        fabric.write(&peer, key, 0, local, 8).unwrap();
        let readback = OS::mmap_anywhere(4096, mmap_anno_test!()).unwrap();
        fabric.read(&peer, key, 0, readback, 8).unwrap();
        unsafe {
            assert_eq!(readback.load::<u64>(), 0xdead_beef);
        }
    }
}
