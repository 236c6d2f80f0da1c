//! The libfabric usage contract.
//!
//! §1 scopes the libfabric wrapper itself out of this crate (it is a thin, unsafe FFI
//! binding maintained elsewhere), but the *contract* the rest of the core relies on —
//! thread model, progress discipline, registration keys — is specified here as a trait
//! so that [`crate::registration`], [`crate::copy`], and [`crate::atl`] can be written
//! and tested against it without linking a real fabric provider.
//!
//! Grounded on the trait-seam pattern the teacher uses at its VM binding boundary
//! (`vm::VMBinding` in `mmtk-mmtk-core`): one trait describing everything the core
//! needs from the collaborator, generalized here to the fabric instead of a managed
//! runtime.

use crate::error::FamResult;
use crate::util::address::Address;

pub mod completion;
pub mod testing;

pub use completion::{CompletionContext, CompletionHandle};

/// Read-only or read-write access mode for a registered window. The low bit of a
/// packed access key (§3) is this mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn bit(self) -> u64 {
        match self {
            AccessMode::ReadOnly => 0,
            AccessMode::ReadWrite => 1,
        }
    }
}

/// Whether the fabric's control/data progress is automatic (the provider advances
/// completions on its own) or manual (something must call into the fabric regularly to
/// make progress) — see §4.G.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressMode {
    Auto,
    Manual,
}

/// A remote peer's fabric address, opaque to everything but the provider. ATL messages
/// carry a serialized form of this (§4.F `client_fabric_address`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FabricAddress(pub Vec<u8>);

/// A registered memory window's fabric-assigned key. Some providers rewrite the
/// bit-packed key requested at registration time (§3); callers must use whatever this
/// type holds as the wire key from then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricKey(pub u64);

/// The usage contract the core depends on from a libfabric-equivalent RDMA provider.
///
/// Implementors own the actual fabric domain/endpoint/completion-queue objects; this
/// crate only ever calls these methods and never touches libfabric directly.
pub trait FabricProvider: Send + Sync {
    /// Whether this provider reports `FI_PROGRESS_MANUAL` for control or data progress.
    /// §4.G spawns a progress-driving thread iff this is `Manual`.
    fn progress_mode(&self) -> ProgressMode;

    /// Whether this provider requires base addresses to be sent to the client in
    /// addition to the fabric key (the `isBaseRequire` flag from §9's known
    /// ambiguities, fixed once per provider at startup).
    fn requires_base_address(&self) -> bool;

    /// Register a memory window for RDMA access. `requested_key` is the access key this
    /// crate computed by bit-packing (§3); the provider may return a different key if
    /// it rewrites keys internally. The returned key is authoritative from then on.
    fn register(
        &self,
        base: Address,
        len: usize,
        requested_key: u64,
        mode: AccessMode,
    ) -> FamResult<FabricKey>;

    /// Deregister a previously registered window.
    fn deregister(&self, key: FabricKey) -> FamResult<()>;

    /// Issue a one-sided RDMA read of `len` bytes from `(remote_key, remote_addr)` on
    /// `peer` into `local`. Returns a handle the caller waits on via
    /// [`CompletionContext::wait`].
    fn read(
        &self,
        peer: &FabricAddress,
        remote_key: FabricKey,
        remote_addr: u64,
        local: Address,
        len: usize,
    ) -> FamResult<CompletionHandle>;

    /// Issue a one-sided RDMA write of `len` bytes from `local` to
    /// `(remote_key, remote_addr)` on `peer`.
    fn write(
        &self,
        peer: &FabricAddress,
        remote_key: FabricKey,
        remote_addr: u64,
        local: Address,
        len: usize,
    ) -> FamResult<CompletionHandle>;

    /// Drain every outstanding completion queued by this thread so far ("quiet").
    fn quiet(&self) -> FamResult<()>;

    /// Drive fabric progress once. Only meaningful (and only called) when
    /// [`Self::progress_mode`] is [`ProgressMode::Manual`]; §4.G calls this in a loop.
    fn poll_progress(&self);

    /// Insert `addr` into the provider's address vector, returning a stable handle used
    /// for subsequent `read`/`write` calls. ATL (§4.F) serializes insertion with
    /// `fiAddrLock`; the provider implementation need not be internally thread-safe for
    /// insertion, since the caller already serializes it (see
    /// `crate::atl::AddressVector`).
    fn insert_address(&self, addr: &FabricAddress) -> FamResult<()>;

    /// This server's own fabric address, serialized the same way a peer address is
    /// (`fi_getname`-equivalent). Handed back to clients by `signal_start` so they can
    /// reach this server's registered windows.
    fn local_address(&self) -> FamResult<FabricAddress>;
}
