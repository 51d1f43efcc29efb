//! # BASALT Memory
//!
//! Buffer object tracking for GPU timeline safety:
//!
//! - [`bo`] — the per-device registry of kernel buffer handles and their
//!   reference counts.
//! - [`residency`] — per-submission residency sets and deterministic
//!   kernel-facing exec lists.
//! - [`storage`] — deferred free/reuse lists keyed by the fence value that
//!   must complete before an allocation may be reclaimed.
//! - [`reclaim`] — the close worker that releases kernel handles off the
//!   submission path.
//!
//! Memory is never freed or rebound while still referenced by outstanding
//! GPU work; the storage and registry together enforce that.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod bo;
pub mod reclaim;
pub mod residency;
pub mod storage;

// Re-exports for convenience
pub use bo::{BoRegistry, BufferObject, ResidencyState};
pub use reclaim::CloseWorker;
pub use residency::{BoAccess, ResidencySet};
pub use storage::{AllocationStorage, UsageKind};
