//! # Fence Tracking
//!
//! Per-engine monotonic completion counters.
//!
//! Each engine carries two counters: the last fence value promised to a
//! submission, and the highest completion value observed from the kernel.
//! Promised values are allocated at flush time; observed values only ever
//! move forward. Submission N is complete once the observed value is >= N.
//!
//! Waits go through one of two strategies, fixed at device open: the
//! kernel-offloaded fence wait on the extended dialect, or a bounded
//! polling loop over the engine's fence register on the legacy one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use basalt_core::types::TIMEOUT_INFINITE;
use basalt_core::{EngineClass, FenceValue, WaitStatus, ENGINE_COUNT};
use basalt_uapi::IoctlAdapter;

/// Interval between fence register reads in the polling strategy
const POLL_INTERVAL: Duration = Duration::from_micros(50);

// =============================================================================
// WAIT STRATEGY
// =============================================================================

/// How fence completion is awaited; resolved once at device open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStrategy {
    /// Block in the kernel until the fence reaches the target
    KernelFence,
    /// Poll the engine's fence register from userspace
    Polling,
}

// =============================================================================
// FENCE TRACKER
// =============================================================================

/// Per-engine fence counters for one device.
pub struct FenceTracker {
    adapter: Arc<IoctlAdapter>,
    strategy: WaitStrategy,
    promised: [AtomicU64; ENGINE_COUNT],
    completed: [AtomicU64; ENGINE_COUNT],
}

impl FenceTracker {
    /// Create a tracker with all counters at zero
    pub fn new(adapter: Arc<IoctlAdapter>, strategy: WaitStrategy) -> Self {
        Self {
            adapter,
            strategy,
            promised: std::array::from_fn(|_| AtomicU64::new(0)),
            completed: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// The wait strategy fixed at construction
    #[inline]
    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    /// Highest completion value observed on `engine`
    #[inline]
    pub fn current(&self, engine: EngineClass) -> FenceValue {
        self.completed[engine.index()].load(Ordering::Acquire)
    }

    /// Last fence value promised to a submission on `engine`
    #[inline]
    pub fn last_promised(&self, engine: EngineClass) -> FenceValue {
        self.promised[engine.index()].load(Ordering::Acquire)
    }

    /// Allocate the fence value for the next accepted submission.
    ///
    /// Values are consecutive per engine, starting at 1.
    pub fn allocate_target(&self, engine: EngineClass) -> FenceValue {
        self.promised[engine.index()].fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a kernel-reported completion value.
    ///
    /// Completion values are strictly non-decreasing per engine; a caller
    /// reporting a regression has broken the ordering contract and panics.
    pub fn advance(&self, engine: EngineClass, value: FenceValue) {
        let prev = self.completed[engine.index()].fetch_max(value, Ordering::AcqRel);
        assert!(
            value >= prev,
            "fence regression on {engine}: {value} < {prev}"
        );
    }

    // Wait paths may race each other; an older observation losing the race
    // is fine, fetch_max keeps the counter monotonic either way.
    fn observe(&self, engine: EngineClass, value: FenceValue) {
        self.completed[engine.index()].fetch_max(value, Ordering::AcqRel);
    }

    /// Wait until `engine` reaches `target`.
    ///
    /// `timeout_ns == 0` checks once without blocking; [`TIMEOUT_INFINITE`]
    /// waits forever. A timeout is an outcome, not an error.
    pub fn wait(&self, engine: EngineClass, target: FenceValue, timeout_ns: u64) -> WaitStatus {
        if self.current(engine) >= target {
            return WaitStatus::Signaled;
        }
        match self.strategy {
            WaitStrategy::KernelFence => {
                let status = self.adapter.wait_fence(engine, target, timeout_ns);
                if status.is_signaled() {
                    self.observe(engine, target);
                }
                status
            }
            WaitStrategy::Polling => self.poll_wait(engine, target, timeout_ns),
        }
    }

    fn poll_wait(&self, engine: EngineClass, target: FenceValue, timeout_ns: u64) -> WaitStatus {
        let start = Instant::now();
        loop {
            match self.adapter.read_fence(engine) {
                Ok(value) => {
                    self.observe(engine, value);
                    if value >= target {
                        return WaitStatus::Signaled;
                    }
                }
                Err(e) => return WaitStatus::Failed(e),
            }
            if timeout_ns != TIMEOUT_INFINITE && start.elapsed().as_nanos() >= timeout_ns as u128 {
                return WaitStatus::TimedOut;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockKernel;
    use std::sync::atomic::Ordering as AtomicOrdering;

    const ENGINE: EngineClass = EngineClass::Render;

    fn tracker(mock: &Arc<MockKernel>, strategy: WaitStrategy) -> FenceTracker {
        let caps = mock.caps();
        let adapter = Arc::new(IoctlAdapter::with_caps(mock.clone(), caps));
        FenceTracker::new(adapter, strategy)
    }

    #[test]
    fn targets_are_consecutive_per_engine() {
        let mock = Arc::new(MockKernel::extended());
        let fences = tracker(&mock, WaitStrategy::KernelFence);

        assert_eq!(fences.allocate_target(ENGINE), 1);
        assert_eq!(fences.allocate_target(ENGINE), 2);
        // Other engines are unaffected
        assert_eq!(fences.allocate_target(EngineClass::Copy), 1);
        assert_eq!(fences.last_promised(ENGINE), 2);
    }

    #[test]
    fn advance_moves_the_observed_value() {
        let mock = Arc::new(MockKernel::extended());
        let fences = tracker(&mock, WaitStrategy::KernelFence);

        fences.advance(ENGINE, 3);
        assert_eq!(fences.current(ENGINE), 3);
        // Repeating the same value is legal
        fences.advance(ENGINE, 3);
        assert_eq!(fences.current(ENGINE), 3);
    }

    #[test]
    #[should_panic(expected = "fence regression")]
    fn advancing_backwards_panics() {
        let mock = Arc::new(MockKernel::extended());
        let fences = tracker(&mock, WaitStrategy::KernelFence);
        fences.advance(ENGINE, 5);
        fences.advance(ENGINE, 4);
    }

    #[test]
    fn already_observed_fence_skips_the_kernel() {
        let mock = Arc::new(MockKernel::legacy());
        let fences = tracker(&mock, WaitStrategy::Polling);
        fences.advance(ENGINE, 7);

        assert_eq!(fences.wait(ENGINE, 5, 0), WaitStatus::Signaled);
        assert_eq!(mock.fence_reads.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn polling_zero_timeout_checks_exactly_once() {
        let mock = Arc::new(MockKernel::legacy());
        mock.set_fence(ENGINE, 3);
        let fences = tracker(&mock, WaitStrategy::Polling);

        assert_eq!(fences.wait(ENGINE, 5, 0), WaitStatus::TimedOut);
        assert_eq!(mock.fence_reads.load(AtomicOrdering::SeqCst), 1);
        // The partial progress that was visible is still recorded
        assert_eq!(fences.current(ENGINE), 3);
    }

    #[test]
    fn polling_signals_once_the_register_reaches_the_target() {
        let mock = Arc::new(MockKernel::legacy());
        mock.set_fence(ENGINE, 5);
        let fences = tracker(&mock, WaitStrategy::Polling);

        assert_eq!(fences.wait(ENGINE, 5, 0), WaitStatus::Signaled);
        assert_eq!(fences.current(ENGINE), 5);
    }

    #[test]
    fn kernel_wait_records_completion() {
        let mock = Arc::new(MockKernel::extended());
        mock.set_fence(ENGINE, 2);
        let fences = tracker(&mock, WaitStrategy::KernelFence);

        assert_eq!(fences.wait(ENGINE, 2, TIMEOUT_INFINITE), WaitStatus::Signaled);
        assert_eq!(fences.current(ENGINE), 2);
    }

    #[test]
    fn kernel_wait_timeout_is_an_outcome() {
        let mock = Arc::new(MockKernel::extended());
        let fences = tracker(&mock, WaitStrategy::KernelFence);

        assert_eq!(fences.wait(ENGINE, 1, 0), WaitStatus::TimedOut);
        assert_eq!(fences.current(ENGINE), 0);
    }
}
