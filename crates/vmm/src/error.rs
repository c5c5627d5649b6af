use alloc::collections::TryReserveError;
use core::fmt;

/// Errors reported by the virtual memory subsystem.
///
/// Every operation that fails with one of these leaves the address space as it was before
/// the call; partially built structures are released before the error is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A frame, table or region allocation failed.
    OutOfMemory,
    /// The access is not permitted: no region covers the address, the translation is
    /// read-only, or there is no user address space to consult.
    ProtectionFault,
    /// The request violates the interface contract (unknown fault kind, missing address
    /// space, malformed region).
    InvalidRequest,
    /// The region overlaps an existing one and the address space rejects overlap.
    RegionOverlap,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::OutOfMemory => f.write_str("out of memory"),
            VmError::ProtectionFault => f.write_str("protection fault"),
            VmError::InvalidRequest => f.write_str("invalid request"),
            VmError::RegionOverlap => f.write_str("region overlaps an existing region"),
        }
    }
}

impl From<TryReserveError> for VmError {
    fn from(_: TryReserveError) -> Self {
        VmError::OutOfMemory
    }
}

/// Result type for virtual memory operations.
pub type VmResult<T> = Result<T, VmError>;
