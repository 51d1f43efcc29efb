//! # Error Handling
//!
//! Unified error type for the submission engine.
//!
//! The taxonomy follows the engine's propagation policy:
//! - Transient errors (`Busy`, `WouldBlock`) are absorbed by the
//!   orchestrator's retry policy and only surface once retries are
//!   exhausted.
//! - Fatal submission errors propagate as typed results to the caller; the
//!   device is not torn down.
//! - Fence wait timeouts are NOT errors; they are a distinct `WaitStatus`
//!   outcome.
//! - Lifecycle invariant violations (double deferral, fence regression) are
//!   programming errors and panic rather than returning an `Err`.

use core::fmt;

/// BASALT result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Unified error type for the submission engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Transient (retryable by the orchestrator)
    // =========================================================================
    /// Kernel reported the device or resource as busy
    Busy,
    /// Kernel reported the request would block
    WouldBlock,

    // =========================================================================
    // Fatal submission errors
    // =========================================================================
    /// Residency set or exec list is malformed
    MalformedResidency,
    /// Kernel rejected the submission for a non-transient reason
    SubmissionRejected,
    /// Flush retries exhausted without kernel acceptance
    RetriesExhausted,

    // =========================================================================
    // Resource errors
    // =========================================================================
    /// Kernel could not satisfy the allocation
    OutOfMemory,
    /// Handle is unknown to the registry or already closed
    InvalidHandle,

    // =========================================================================
    // Initialization / dialect errors
    // =========================================================================
    /// Operation is not supported by the negotiated kernel ABI dialect.
    /// Always fatal at initialization time, never discovered mid-submission.
    DialectMismatch,
    /// Capability probe failed during device open
    ProbeFailed,

    // =========================================================================
    // Raw kernel errors
    // =========================================================================
    /// Kernel returned an errno that maps to no engine category
    Errno(i32),
}

impl Error {
    /// True for the transient class handled by the orchestrator retry policy
    #[inline]
    pub fn is_retryable(self) -> bool {
        matches!(self, Error::Busy | Error::WouldBlock)
    }

    /// Map a raw errno from the kernel device into a typed error
    pub fn from_errno(errno: i32) -> Self {
        // EWOULDBLOCK and EAGAIN share a value on Linux; both land in the
        // transient class together with EBUSY.
        match errno {
            libc::EBUSY => Error::Busy,
            libc::EAGAIN => Error::WouldBlock,
            libc::ENOMEM => Error::OutOfMemory,
            libc::ENOENT | libc::EBADF => Error::InvalidHandle,
            libc::EINVAL => Error::SubmissionRejected,
            other => Error::Errno(other),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "device busy"),
            Self::WouldBlock => write!(f, "request would block"),
            Self::MalformedResidency => write!(f, "malformed residency set"),
            Self::SubmissionRejected => write!(f, "kernel rejected submission"),
            Self::RetriesExhausted => write!(f, "flush retries exhausted"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::InvalidHandle => write!(f, "invalid buffer handle"),
            Self::DialectMismatch => {
                write!(f, "operation unsupported by negotiated kernel ABI dialect")
            }
            Self::ProbeFailed => write!(f, "kernel capability probe failed"),
            Self::Errno(e) => write!(f, "kernel errno {e}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_class() {
        assert!(Error::Busy.is_retryable());
        assert!(Error::WouldBlock.is_retryable());
        assert!(!Error::SubmissionRejected.is_retryable());
        assert!(!Error::OutOfMemory.is_retryable());
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::from_errno(libc::EBUSY), Error::Busy);
        assert_eq!(Error::from_errno(libc::EAGAIN), Error::WouldBlock);
        assert_eq!(Error::from_errno(libc::ENOMEM), Error::OutOfMemory);
        assert_eq!(Error::from_errno(libc::EPROTO), Error::Errno(libc::EPROTO));
    }
}
