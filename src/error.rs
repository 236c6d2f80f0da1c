//! Error kinds surfaced across the public contracts of this crate.
//!
//! Internal components (allocator, registration map, resource manager, ...) raise a
//! [`FamError`] carrying one of a small set of [`ErrorKind`]s plus a message. RPC
//! handlers translate a `FamError` into `(errorcode, errormsg)` on the wire; they never
//! let a panic escape to the transport.

use thiserror::Error;

/// Classification of a [`FamError`]. Kept deliberately small: these are the kinds a
/// client can branch on, not a taxonomy of every internal failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The entity being created already exists (e.g. a region id already in use, or a
    /// map insertion raced with another insert of the same key).
    AlreadyExists,
    /// The entity being looked up does not exist.
    NotFound,
    /// The caller does not hold the permission required for this operation.
    NoPermission,
    /// An offset, size, or index falls outside the valid range for the entity.
    OutOfRange,
    /// A pointer or handle that was required to be non-null was null.
    NullPointer,
    /// The requested operation is recognized but not implemented by this server.
    Unimplemented,
    /// A resource-layer failure: allocator, registration, fence, or backup-path error.
    Resource,
    /// A transport-level failure in the RPC layer itself.
    FamRpc,
}

impl ErrorKind {
    /// Stable string used on the wire and in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::NoPermission => "NO_PERMISSION",
            ErrorKind::OutOfRange => "OUT_OF_RANGE",
            ErrorKind::NullPointer => "NULL_POINTER",
            ErrorKind::Unimplemented => "UNIMPLEMENTED",
            ErrorKind::Resource => "RESOURCE",
            ErrorKind::FamRpc => "FAM_RPC",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type returned by every fallible public operation in this crate.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct FamError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FamError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn no_permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoPermission, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfRange, message)
    }

    pub fn null_pointer(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NullPointer, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unimplemented, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn fam_rpc(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FamRpc, message)
    }

    /// `(errorcode, errormsg)` pair as sent back over the wire by an RPC handler.
    pub fn to_wire(&self) -> (&'static str, String) {
        (self.kind.as_str(), self.message.clone())
    }
}

pub type FamResult<T> = Result<T, FamError>;
