//! # BASALT Kernel ABI Adapter
//!
//! Translation layer between engine-level operations and the ioctl dialect
//! understood by the running kernel driver.
//!
//! The kernel ABI has drifted across driver generations; this crate isolates
//! all of that drift:
//!
//! - [`req`] defines the fixed-size request structures, one per operation.
//! - [`device`] is the raw kernel seam: a [`device::KernelDevice`] trait with
//!   exactly one method per request, plus the fd-backed implementation.
//! - [`dialect`] probes the kernel's capability set once at device open.
//! - [`adapter`] dispatches engine-level operations against the fixed
//!   dialect choice.
//!
//! Nothing in this crate retries a failed request; retry policy belongs to
//! the submission orchestrator.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod adapter;
pub mod device;
pub mod dialect;
pub mod req;

// Re-exports for convenience
pub use adapter::{IoctlAdapter, VmBindParams};
pub use device::{DrmDevice, KernelDevice};
pub use dialect::{AbiDialect, DialectCaps};
pub use req::{ExecFlags, ExecObject, MemRegion, VmBindFlags};
