//! # BASALT Command
//!
//! The submission side of the engine:
//!
//! - [`fence`] — per-engine monotonic completion counters with kernel and
//!   polling wait strategies.
//! - [`submit`] — the submission orchestrator: residency registration,
//!   flush with retry policy, fence assignment, deferred-free registration.
//! - [`device`] — the device facade tying adapter, registry, fences,
//!   lifecycle storage and the close worker together.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod device;
pub mod fence;
pub mod submit;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports for convenience
pub use device::Device;
pub use fence::{FenceTracker, WaitStrategy};
pub use submit::{BatchBuffer, Submission, SubmissionEngine, SubmissionState};
