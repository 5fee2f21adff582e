//! Error taxonomy for private storage operations.

use thiserror::Error;

use crate::TPS_SIZE;
use crate::region::Protection;
use crate::runtime::Tid;

/// Result alias used throughout the crate.
pub type Result<T, E = TpsError> = std::result::Result<T, E>;

/// Failure returned by a lifecycle or access-gate operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TpsError {
    /// `init` was called on a domain that is already initialized.
    #[error("thread-private storage is already initialized")]
    AlreadyInitialized,
    /// The thread already owns a binding.
    #[error("thread {0} already has a private storage binding")]
    DuplicateBinding(Tid),
    /// The thread has no binding.
    #[error("thread {0} has no private storage binding")]
    NoBinding(Tid),
    /// `offset + length` does not fit in the region.
    #[error(
        "access of {length} bytes at offset {offset} exceeds the {}-byte region",
        TPS_SIZE
    )]
    OutOfBounds { offset: usize, length: usize },
    /// The caller's buffer is missing or shorter than `length`.
    #[error("buffer of {available} bytes cannot carry {length} bytes")]
    InvalidBuffer { length: usize, available: usize },
    /// A region could not be reserved (host failure or page budget exhausted).
    #[error("failed to reserve a private storage region (errno {errno})")]
    AllocationFailure { errno: i32 },
    /// Changing a region's protection failed.
    #[error("failed to set {protection} on a private storage region (errno {errno})")]
    ProtectionFailure { protection: Protection, errno: i32 },
    /// The protection-violation observer could not be installed.
    #[error("failed to install the protection-violation observer (errno {errno})")]
    ObserverUnavailable { errno: i32 },
}

impl TpsError {
    /// POSIX errno equivalent, used by the C boundary.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::AlreadyInitialized => libc::EBUSY,
            Self::DuplicateBinding(_) => libc::EEXIST,
            Self::NoBinding(_) => libc::ENOENT,
            Self::OutOfBounds { .. } => libc::ERANGE,
            Self::InvalidBuffer { .. } => libc::EFAULT,
            Self::AllocationFailure { errno }
            | Self::ProtectionFailure { errno, .. }
            | Self::ObserverUnavailable { errno } => errno,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_distinct_for_caller_errors() {
        let errs = [
            TpsError::AlreadyInitialized,
            TpsError::DuplicateBinding(Tid(1)),
            TpsError::NoBinding(Tid(1)),
            TpsError::OutOfBounds {
                offset: TPS_SIZE,
                length: 1,
            },
            TpsError::InvalidBuffer {
                length: 4,
                available: 0,
            },
        ];
        let mut codes: Vec<i32> = errs.iter().map(|e| e.errno()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn host_errno_passes_through() {
        let err = TpsError::ProtectionFailure {
            protection: Protection::Read,
            errno: libc::EACCES,
        };
        assert_eq!(err.errno(), libc::EACCES);
        assert_eq!(
            TpsError::AllocationFailure {
                errno: libc::ENOMEM
            }
            .errno(),
            libc::ENOMEM
        );
    }

    #[test]
    fn display_names_the_thread() {
        let msg = TpsError::NoBinding(Tid(42)).to_string();
        assert!(msg.contains("42"), "{msg}");
    }
}
