//! Mem-access error type.

use core::fmt;
use mm::{AltP2mError, P2mError};

use crate::guest::GuestCopyError;

/// Errors returned by access queries and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccessError {
    /// Bad access code, view index, or frame range
    InvalidArgument,
    /// No backing frame for the GFN
    NotPresent,
    /// Stored access code is not one we know
    OutOfRange,
    /// Guest memory copy failed
    Fault,
    /// Resource in use, or domain not paused
    Busy,
    /// Domain cannot use mem-access
    NotSupported,
    /// Translation backend refused an update
    Backend(P2mError),
}

impl MemAccessError {
    /// Convert to errno-style error code.
    pub fn to_errno(&self) -> i32 {
        match self {
            MemAccessError::InvalidArgument => -22, // EINVAL
            MemAccessError::NotPresent => -3,       // ESRCH
            MemAccessError::OutOfRange => -34,      // ERANGE
            MemAccessError::Fault => -14,           // EFAULT
            MemAccessError::Busy => -16,            // EBUSY
            MemAccessError::NotSupported => -95,    // EOPNOTSUPP
            MemAccessError::Backend(e) => e.to_errno(),
        }
    }
}

impl fmt::Display for MemAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemAccessError::InvalidArgument => write!(f, "invalid argument"),
            MemAccessError::NotPresent => write!(f, "frame not present"),
            MemAccessError::OutOfRange => write!(f, "stored access out of range"),
            MemAccessError::Fault => write!(f, "guest copy failed"),
            MemAccessError::Busy => write!(f, "resource busy"),
            MemAccessError::NotSupported => write!(f, "mem-access not supported for domain"),
            MemAccessError::Backend(e) => write!(f, "p2m backend: {}", e),
        }
    }
}

impl From<P2mError> for MemAccessError {
    fn from(e: P2mError) -> Self {
        MemAccessError::Backend(e)
    }
}

impl From<AltP2mError> for MemAccessError {
    fn from(e: AltP2mError) -> Self {
        match e {
            AltP2mError::InvalidIndex => MemAccessError::InvalidArgument,
            AltP2mError::SlotBusy | AltP2mError::NotPaused => MemAccessError::Busy,
        }
    }
}

impl From<GuestCopyError> for MemAccessError {
    fn from(_: GuestCopyError) -> Self {
        MemAccessError::Fault
    }
}
