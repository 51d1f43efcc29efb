//! # Device Configuration
//!
//! Explicit, immutable configuration for a device's submission behavior.
//!
//! All knobs are fixed at device-open time. Nothing here is re-read or
//! re-negotiated mid-session; components receive the config (or the fields
//! they need) at construction.

// =============================================================================
// RETRY POLICY
// =============================================================================

/// Flush retry policy for transient kernel errors (busy / would-block).
///
/// Mirrors a capability negotiated with the kernel driver; fixed per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Keep retrying the flush until accepted, bounded by
    /// [`DeviceConfig::max_flush_retries`].
    AlwaysRetry,
    /// Convert the submission to non-blocking mode and retry exactly once,
    /// then fail.
    SingleRetryThenFail,
}

// =============================================================================
// WAIT MODE
// =============================================================================

/// Fence wait strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Pick the kernel fence wait when the capability probe reports support,
    /// otherwise fall back to polling.
    Auto,
    /// Force the kernel-offloaded fence wait
    KernelFence,
    /// Force the polling wait
    Polling,
}

// =============================================================================
// RECLAIM MODE
// =============================================================================

/// Operating mode for the handle reclamation worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimMode {
    /// A persistent background thread owns the close queue
    Active,
    /// Closes happen synchronously on the calling thread
    Inactive,
}

// =============================================================================
// DEVICE CONFIG
// =============================================================================

/// Immutable per-device configuration, supplied at device open.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Retry policy for transient flush errors
    pub retry_policy: RetryPolicy,
    /// Submit in non-blocking mode even when the kernel would accept a
    /// blocking submission
    pub force_non_blocking: bool,
    /// Fence wait strategy
    pub wait_mode: WaitMode,
    /// Reclamation worker mode
    pub reclaim_mode: ReclaimMode,
    /// Upper bound on flush attempts under [`RetryPolicy::AlwaysRetry`]
    pub max_flush_retries: u32,
}

impl DeviceConfig {
    /// Defaults for a primary device context
    pub fn primary() -> Self {
        Self {
            retry_policy: RetryPolicy::AlwaysRetry,
            force_non_blocking: false,
            wait_mode: WaitMode::Auto,
            reclaim_mode: ReclaimMode::Active,
            max_flush_retries: 1000,
        }
    }

    /// Defaults for a secondary/internal engine context.
    ///
    /// Internal contexts close handles synchronously; background concurrency
    /// is undesirable there.
    pub fn internal() -> Self {
        Self {
            reclaim_mode: ReclaimMode::Inactive,
            ..Self::primary()
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::primary()
    }
}
