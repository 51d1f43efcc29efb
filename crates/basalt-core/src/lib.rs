//! # BASALT Core
//!
//! Foundational types, error handling and device configuration for the
//! BASALT command submission and residency engine.
//!
//! This crate has no kernel dependencies; everything that talks to the
//! kernel lives in `basalt-uapi` and above.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

// =============================================================================
// MODULE EXPORTS
// =============================================================================

pub mod config;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use config::{DeviceConfig, ReclaimMode, RetryPolicy, WaitMode};
pub use error::{Error, Result};
pub use types::{BoHandle, EngineClass, FenceValue, WaitStatus, ENGINE_COUNT};
