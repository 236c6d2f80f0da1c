//! RPC surface, §6.
//!
//! [`MemoryServerService`] names every control- and data-plane operation a client can
//! invoke against a memory server, independent of which of the two interchangeable RPC
//! frameworks actually carries the bytes. Grounded on the RPC list in
//! `examples/original_source/src/memory_service/fam_memory_service_direct.h` /
//! `fam_memory_service_direct.cpp`, where `Fam_Memory_Service_Direct` implements this
//! same surface directly and a thin `Fam_Memory_Service_Client`-side stub marshals it
//! over gRPC or Thallium. This crate owns the surface and its implementation
//! ([`crate::server::MemoryServer`]); wiring a concrete transport's generated stubs to
//! this trait is the transport crate's job, not this one's.

use crate::error::FamResult;
use crate::resource::ResourceStatus;

/// `signal_start`'s reply: what a client needs to start talking to this server.
#[derive(Debug, Clone)]
pub struct SignalStartInfo {
    pub fabric_addr_bytes: Vec<u8>,
    pub memory_type: crate::config::MemoryType,
    pub memserver_id: u32,
}

/// One `(region_id, offset)` extent of a (possibly cross-server striped) data item,
/// as carried by the `copy` RPC.
#[derive(Debug, Clone)]
pub struct CopyRequest {
    pub src_region_id: u64,
    pub src_offsets: Vec<u64>,
    pub src_used_memserver_count: usize,
    pub src_copy_start: u64,
    pub src_copy_end: u64,
    pub src_keys: Vec<u64>,
    pub src_base_addrs: Vec<u64>,
    pub src_memserver_ids: Vec<u64>,
    pub src_peer_addresses: Vec<Vec<u8>>,
    pub src_interleave_size: u64,
    pub dst_region_id: u64,
    pub dst_offset: u64,
    pub dst_used_memserver_count: usize,
    pub dst_interleave_size: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub region_id: u64,
    pub offset: u64,
    pub size: u64,
    pub file_start_pos: u64,
    pub backup_name: String,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub region_id: u64,
    pub offset: u64,
    pub backup_name: String,
    pub uid: u32,
    pub gid: u32,
}

pub use crate::backup::BackupInfo;

/// `open_region_with_registration`/`get_region_memory`'s reply: one fabric key and
/// base address per registered window.
#[derive(Debug, Clone)]
pub struct MemoryHandles {
    pub keys: Vec<u64>,
    pub bases: Vec<u64>,
}

/// `get_dataitem_memory`'s reply.
#[derive(Debug, Clone, Copy)]
pub struct ItemHandle {
    pub key: u64,
    pub base: u64,
}

/// An enqueued ATL get/put/scatter/gather request, carrying exactly the fields
/// `crate::atl::message::MessageHeader` needs plus any inline payload.
#[derive(Debug, Clone)]
pub struct AtomicRequest {
    pub region_id: u64,
    pub offset: u64,
    pub client_fabric_address: Vec<u8>,
    pub client_memory_key: u64,
    pub client_base_addr: u64,
    pub client_buffer_offset: u64,
    pub size: u64,
    pub first_element: u64,
    pub stride: u64,
    pub element_size: u64,
    pub n_elements: u64,
    pub inline_payload: Vec<u8>,
}

/// Every control- and data-plane RPC a memory server answers, framework-neutral.
/// Implemented by [`crate::server::MemoryServer`]; a transport adapter marshals bytes
/// off the wire into these arguments and this trait's `FamResult` back onto it as
/// `(errorcode, errormsg)` via [`crate::error::FamError::to_wire`].
pub trait MemoryServerService: Send + Sync {
    fn signal_start(&self) -> FamResult<SignalStartInfo>;
    fn signal_termination(&self) -> FamResult<()>;

    fn create_region(&self, region_id: u64, size: u64) -> FamResult<()>;
    fn destroy_region(&self, region_id: u64) -> FamResult<ResourceStatus>;
    fn resize_region(&self, region_id: u64, new_size: u64) -> FamResult<()>;

    fn allocate(&self, region_id: u64, size: u64) -> FamResult<u64>;
    fn deallocate(&self, region_id: u64, offset: u64) -> FamResult<()>;

    fn copy(&self, request: CopyRequest) -> FamResult<()>;

    fn backup(&self, request: BackupRequest) -> FamResult<()>;
    fn restore(&self, request: RestoreRequest) -> FamResult<BackupInfo>;
    fn get_backup_info(&self, backup_name: &str, uid: u32, gid: u32) -> FamResult<BackupInfo>;
    fn list_backup(&self, pattern: &str, uid: u32, gid: u32) -> FamResult<String>;
    fn delete_backup(&self, backup_name: &str) -> FamResult<()>;

    fn acquire_cas_lock(&self, offset: u64) -> FamResult<()>;
    fn release_cas_lock(&self, offset: u64) -> FamResult<()>;

    /// Only meaningful when the configured fabric provider requires a base address
    /// (`FabricProvider::requires_base_address`); callers against a provider that
    /// doesn't should not invoke this.
    fn get_local_pointer(&self, region_id: u64, offset: u64) -> FamResult<u64>;

    fn register_region_memory(&self, region_id: u64, read_write: bool) -> FamResult<()>;
    fn open_region_with_registration(&self, region_id: u64, read_write: bool) -> FamResult<MemoryHandles>;
    fn open_region_without_registration(&self, region_id: u64) -> FamResult<()>;
    fn close_region(&self, region_id: u64) -> FamResult<ResourceStatus>;
    fn get_region_memory(&self, region_id: u64, read_write: bool) -> FamResult<MemoryHandles>;
    fn get_dataitem_memory(&self, region_id: u64, offset: u64, size: u64, read_write: bool) -> FamResult<ItemHandle>;

    fn get_atomic(&self, request: AtomicRequest) -> FamResult<()>;
    fn put_atomic(&self, request: AtomicRequest) -> FamResult<()>;
    fn scatter_atomic(&self, request: AtomicRequest) -> FamResult<()>;
    fn gather_atomic(&self, request: AtomicRequest) -> FamResult<()>;

    fn update_memserver_addrlist(&self, packed_fabric_addrs: &[u8], memserver_count: u32) -> FamResult<()>;
    fn create_region_failure_cleanup(&self, region_id: u64) -> FamResult<()>;
}
