//! # Submission Orchestrator
//!
//! Drives a command buffer from assembly to kernel acceptance:
//!
//! 1. Residency is assembled against the registry (each referenced buffer
//!    retained once).
//! 2. The flush hands the exec list to the kernel, absorbing transient
//!    busy/would-block errors per the device's retry policy.
//! 3. On acceptance the submission is assigned the engine's next fence
//!    value, deferred frees are registered under that fence, and only then
//!    are the residency references released.
//!
//! The register-then-release ordering is the load-bearing part: a buffer
//! marked for freeing is always covered by either a registry reference or a
//! deferred entry, never neither.

use std::sync::{Arc, Mutex};

use basalt_core::{
    BoHandle, DeviceConfig, EngineClass, Error, FenceValue, Result, RetryPolicy,
};
use basalt_mem::bo::BoRegistry;
use basalt_mem::residency::{BoAccess, ResidencySet};
use basalt_mem::storage::{AllocationStorage, UsageKind};
use basalt_uapi::req::{ExecFlags, ExecObject, EXEC_OBJECT_READ};
use basalt_uapi::IoctlAdapter;

use crate::fence::FenceTracker;

// =============================================================================
// BATCH BUFFER
// =============================================================================

/// The command buffer of one submission.
///
/// The batch buffer must be registered like any other buffer; the
/// orchestrator appends it as the final exec list entry.
#[derive(Debug, Clone, Copy)]
pub struct BatchBuffer {
    /// Registered buffer holding the commands
    pub handle: BoHandle,
    /// Offset of the first command within the buffer
    pub start_offset: u64,
    /// Bytes of the buffer actually filled with commands
    pub used_size: u64,
}

// =============================================================================
// SUBMISSION
// =============================================================================

/// Lifecycle state of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// Residency is still being assembled
    Assembling,
    /// Handed to the kernel, acceptance pending
    Flushing,
    /// Accepted by the kernel, fence assigned
    Submitted,
    /// The engine's observed fence has reached this submission's value
    Completed,
}

/// One in-flight submission: a batch buffer plus the residency and
/// deferred-free bookkeeping attached to it.
///
/// Every retained reference is released exactly once: by the engine when
/// the submission is flushed, or on drop if it never was.
pub struct Submission {
    batch: BatchBuffer,
    registry: Arc<BoRegistry>,
    residency: ResidencySet,
    to_free: Vec<(BoHandle, UsageKind)>,
    fence: Option<FenceValue>,
    state: SubmissionState,
}

impl Submission {
    /// Start assembling a submission around `batch`.
    ///
    /// Retains the batch buffer; the reference is released with the rest of
    /// the residency once the submission resolves.
    pub fn new(registry: &Arc<BoRegistry>, batch: BatchBuffer) -> Result<Self> {
        registry.retain(batch.handle)?;
        Ok(Self {
            batch,
            registry: Arc::clone(registry),
            residency: ResidencySet::new(),
            to_free: Vec::new(),
            fence: None,
            state: SubmissionState::Assembling,
        })
    }

    /// Require `handle` resident for this submission with the given access.
    ///
    /// Duplicates collapse with their accesses unioned. Panics if called
    /// after the flush has begun; residency is immutable from that point.
    pub fn add_resident(&mut self, handle: BoHandle, access: BoAccess) -> Result<()> {
        assert_eq!(
            self.state,
            SubmissionState::Assembling,
            "residency changed after flush began"
        );
        self.residency.add(&self.registry, handle, access)
    }

    /// Mark `handle` for deferred freeing once this submission completes
    pub fn free_on_completion(&mut self, handle: BoHandle, usage: UsageKind) {
        self.to_free.push((handle, usage));
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> SubmissionState {
        self.state
    }

    /// The fence value assigned at kernel acceptance
    #[inline]
    pub fn fence(&self) -> Option<FenceValue> {
        self.fence
    }

    /// Distinct resident buffers, excluding the batch
    pub fn resident_count(&self) -> usize {
        self.residency.len()
    }

    /// Flip to `Completed` once the engine's observed fence covers this
    /// submission.
    pub fn update_state(&mut self, observed: FenceValue) {
        if self.state == SubmissionState::Submitted {
            if let Some(fence) = self.fence {
                if observed >= fence {
                    self.state = SubmissionState::Completed;
                }
            }
        }
    }

    fn release_references(&self) {
        let handles = self
            .residency
            .handles()
            .chain(std::iter::once(self.batch.handle));
        for handle in handles {
            if let Err(e) = self.registry.release(handle) {
                log::error!("release of {handle} failed: {e}");
            }
        }
    }
}

impl Drop for Submission {
    fn drop(&mut self) {
        // Once the flush begins the engine owns the release; only an
        // abandoned, never-flushed submission releases here.
        if self.state == SubmissionState::Assembling {
            self.release_references();
        }
    }
}

// =============================================================================
// SUBMISSION ENGINE
// =============================================================================

/// Submission front-end for one engine class.
pub struct SubmissionEngine {
    engine: EngineClass,
    adapter: Arc<IoctlAdapter>,
    registry: Arc<BoRegistry>,
    storage: Arc<AllocationStorage>,
    fences: Arc<FenceTracker>,
    config: DeviceConfig,
    // Serializes kernel acceptance with fence assignment; the kernel's
    // per-engine fence advances in acceptance order, so a submission
    // accepted first must also hold the lower fence value.
    flush_lock: Mutex<()>,
}

impl SubmissionEngine {
    /// Build the front-end for `engine`
    pub fn new(
        engine: EngineClass,
        adapter: Arc<IoctlAdapter>,
        registry: Arc<BoRegistry>,
        storage: Arc<AllocationStorage>,
        fences: Arc<FenceTracker>,
        config: DeviceConfig,
    ) -> Self {
        Self {
            engine,
            adapter,
            registry,
            storage,
            fences,
            config,
            flush_lock: Mutex::new(()),
        }
    }

    /// The engine this front-end submits to
    #[inline]
    pub fn engine(&self) -> EngineClass {
        self.engine
    }

    /// Flush a submission to the kernel.
    ///
    /// On acceptance the submission's fence value is returned; buffers
    /// marked with [`Submission::free_on_completion`] are deferred under it.
    /// On failure the submission is discarded and its references released;
    /// nothing is deferred. Panics if the submission was already flushed.
    pub fn submit(&self, submission: &mut Submission) -> Result<FenceValue> {
        assert_eq!(
            submission.state,
            SubmissionState::Assembling,
            "submission flushed twice"
        );
        submission.state = SubmissionState::Flushing;

        let result = self.flush(submission);
        match result {
            Ok(fence) => {
                submission.fence = Some(fence);
                submission.state = SubmissionState::Submitted;
                // Deferred entries are registered before any reference is
                // released; the buffer is never uncovered.
                for &(handle, usage) in &submission.to_free {
                    let size = self.registry.get(handle).map(|bo| bo.size).unwrap_or(0);
                    self.storage
                        .defer_free(handle, size, self.engine, fence, usage);
                }
                submission.release_references();
                log::debug!(
                    "{}: submitted {} ({} resident) as fence {fence}",
                    self.engine,
                    submission.batch.handle,
                    submission.resident_count(),
                );
                Ok(fence)
            }
            Err(e) => {
                submission.release_references();
                log::warn!("{}: submission failed: {e}", self.engine);
                Err(e)
            }
        }
    }

    fn flush(&self, submission: &Submission) -> Result<FenceValue> {
        let batch = &submission.batch;
        // The batch rides as the final exec entry; a user residency entry
        // for the same handle would duplicate it in the kernel list.
        if submission.residency.access(batch.handle).is_some() {
            return Err(Error::MalformedResidency);
        }
        let mut exec = submission.residency.build_exec_list();
        let batch_addr = self
            .registry
            .get(batch.handle)
            .map(|bo| bo.gpu_addr)
            .unwrap_or(0);
        exec.push(ExecObject {
            handle: batch.handle.raw(),
            flags: EXEC_OBJECT_READ,
            offset: batch_addr,
        });

        if log::log_enabled!(log::Level::Trace) {
            for obj in &exec {
                log::trace!(
                    "{}: exec BO-{} flags={:#x} offset={:#x}",
                    self.engine,
                    obj.handle,
                    obj.flags,
                    obj.offset
                );
            }
        }

        // Acceptance and fence assignment happen under one per-engine lock
        // so fence order matches kernel acceptance order.
        let _order = self.flush_lock.lock().expect("flush lock poisoned");
        self.flush_with_retry(&exec, batch)?;
        Ok(self.fences.allocate_target(self.engine))
    }

    fn flush_with_retry(&self, exec: &[ExecObject], batch: &BatchBuffer) -> Result<()> {
        let base_flags = if self.config.force_non_blocking {
            ExecFlags::NON_BLOCKING
        } else {
            ExecFlags::empty()
        };
        let submit = |flags: ExecFlags| {
            self.adapter
                .submit_exec(self.engine, exec, batch.start_offset, batch.used_size, flags)
        };

        match self.config.retry_policy {
            RetryPolicy::AlwaysRetry => {
                let mut attempt = 0u32;
                loop {
                    attempt += 1;
                    match submit(base_flags) {
                        Ok(()) => return Ok(()),
                        Err(e) if e.is_retryable() => {
                            if attempt > self.config.max_flush_retries {
                                log::warn!(
                                    "{}: flush still {e} after {attempt} attempts",
                                    self.engine
                                );
                                return Err(Error::RetriesExhausted);
                            }
                            std::thread::yield_now();
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            RetryPolicy::SingleRetryThenFail => match submit(base_flags) {
                Ok(()) => Ok(()),
                Err(e) if e.is_retryable() => {
                    log::debug!("{}: flush {e}, retrying non-blocking", self.engine);
                    match submit(base_flags | ExecFlags::NON_BLOCKING) {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_retryable() => Err(Error::RetriesExhausted),
                        Err(e) => Err(e),
                    }
                }
                Err(e) => Err(e),
            },
        }
    }

}
