//! # Core Types
//!
//! Fundamental type definitions shared across the submission engine.

use core::fmt;

// =============================================================================
// FENCE VALUE
// =============================================================================

/// Per-engine completion counter value.
///
/// Fence values are strictly non-decreasing per engine. Submission N is
/// complete once the engine's observed fence value is >= N.
pub type FenceValue = u64;

/// Timeout value meaning "wait forever".
///
/// Infinite waits are expressed with the distinguished maximum value, never
/// a negative sentinel, so the meaning survives any signed/unsigned kernel
/// boundary.
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

// =============================================================================
// BUFFER OBJECT HANDLE
// =============================================================================

/// Opaque kernel handle to a GPU buffer object.
///
/// Handles are only meaningful to the kernel device that issued them; the
/// engine never interprets the value beyond equality and hashing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BoHandle(u32);

impl BoHandle {
    /// Wrap a raw kernel handle
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw kernel handle
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BO-{}", self.0)
    }
}

impl fmt::Display for BoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BO-{}", self.0)
    }
}

// =============================================================================
// ENGINE CLASS
// =============================================================================

/// Number of engine classes tracked per device
pub const ENGINE_COUNT: usize = 3;

/// GPU engine selector for submissions and fences.
///
/// Each engine carries its own monotonic fence counter and its own deferred
/// free lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EngineClass {
    /// 3D/render engine
    Render = 0,
    /// Compute engine
    Compute = 1,
    /// Copy (blitter/DMA) engine
    Copy = 2,
}

impl EngineClass {
    /// Stable per-device index, used to key fence counters and free lists
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// All engine classes, in index order
    pub const ALL: [EngineClass; ENGINE_COUNT] =
        [EngineClass::Render, EngineClass::Compute, EngineClass::Copy];
}

impl fmt::Display for EngineClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render => write!(f, "render"),
            Self::Compute => write!(f, "compute"),
            Self::Copy => write!(f, "copy"),
        }
    }
}

// =============================================================================
// WAIT STATUS
// =============================================================================

/// Outcome of a fence wait.
///
/// A timeout is a distinguishable non-error outcome: the caller decides
/// whether to retry, abandon the submission as hung, or escalate to a reset
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The engine reached the target fence value
    Signaled,
    /// The timeout elapsed before the target value was observed
    TimedOut,
    /// The kernel reported a failure while waiting
    Failed(crate::error::Error),
}

impl WaitStatus {
    /// True if the wait completed successfully
    #[inline]
    pub fn is_signaled(self) -> bool {
        matches!(self, WaitStatus::Signaled)
    }
}
