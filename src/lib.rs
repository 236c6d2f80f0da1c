//! Core of a Fabric-Attached Memory (FAM) memory server.
//!
//! This crate implements the data-plane and control-plane logic that a FAM memory
//! server process links against: region/data-item allocation, an RDMA registration
//! map, reference-counted resource handles, a striped copy engine for data spread
//! across multiple memory servers, and the Atomic Transfer Library (ATL) that lets
//! clients perform read-modify-write operations without round-tripping through the
//! server for every step.
//!
//! Logically, this crate includes these parts:
//! * [Allocator](allocator/index.html): region creation and data-item allocation on
//!   top of a unit-table free list, plus the delayed-free worker that reclaims space
//!   only after all in-flight RDMA reads have drained.
//! * [Registration](registration/index.html): the in-memory map from packed access
//!   keys to local item addresses that the RDMA registration/deregistration RPCs
//!   populate and consult.
//! * [Resource](resource/index.html): reference-counted handles shared between the
//!   control plane (open/close) and the data plane (read/write).
//! * [Interleave](interleave/index.html): decomposition of a single logical data-item
//!   access into the per-server, per-stripe accesses needed when a data item is
//!   spread (interleaved) across multiple memory servers.
//! * [Copy](copy/index.html): the engine that performs a striped copy of a data item
//!   from one interleaving to another, used by resize and defragmentation.
//! * [Atl](atl/index.html): the Atomic Transfer Library, which lets a client queue an
//!   atomic operation (swap, compare-and-swap, fetch-and-op) on a remote memory
//!   server without a round trip per retry.
//! * [Progress](progress/index.html): the driver that advances queued ATL operations
//!   and background work independent of client requests.
//! * [Backup](backup/index.html): the on-disk byte layout used to persist and restore
//!   heap and registration state across a server restart.
//! * [Fabric](fabric/index.html): the [`FabricProvider`](fabric::FabricProvider) trait
//!   that abstracts over the RDMA fabric so the rest of the crate never talks to
//!   libfabric directly.
//! * [Rpc](rpc/index.html): the [`MemoryServerService`](rpc::MemoryServerService)
//!   trait describing the control- and data-plane RPC surface, with thin adapters for
//!   concrete RPC transports.
//! * [Server](server/index.html): the top-level [`MemoryServer`](server::MemoryServer)
//!   context that owns one instance of each of the above and implements
//!   [`MemoryServerService`](rpc::MemoryServerService).

#[macro_use]
pub mod util;

pub mod config;
pub mod error;

pub mod allocator;
pub mod atl;
pub mod backup;
pub mod copy;
pub mod fabric;
pub mod interleave;
pub mod progress;
pub mod registration;
pub mod resource;
pub mod rpc;
pub mod server;

pub mod build_info;

pub use crate::config::ServerConfig;
pub use crate::error::{FamError, FamResult};
pub use crate::server::MemoryServer;
