//! # Device Facade
//!
//! Ties the engine together for one opened device: the dialect-fixed ioctl
//! adapter, the buffer registry, fence tracking, deferred-free storage, the
//! close worker, and one submission front-end per engine class.
//!
//! Everything behavioral is decided at open time from the [`DeviceConfig`]
//! and the kernel capability probe; nothing is renegotiated later.

use std::sync::Arc;

use basalt_core::{
    BoHandle, DeviceConfig, EngineClass, Error, FenceValue, Result, WaitMode, WaitStatus,
};
use basalt_mem::bo::{BoRegistry, ResidencyState};
use basalt_mem::reclaim::CloseWorker;
use basalt_mem::storage::{AllocationStorage, UsageKind};
use basalt_uapi::req::MemRegion;
use basalt_uapi::{AbiDialect, IoctlAdapter, KernelDevice, VmBindParams};

use crate::fence::{FenceTracker, WaitStrategy};
use crate::submit::{BatchBuffer, Submission, SubmissionEngine};

/// Preferred placement when the kernel honors regions: device-local, tile 0
const DEVICE_LOCAL: [MemRegion; 1] = [MemRegion {
    class: 1,
    instance: 0,
}];

// =============================================================================
// DEVICE
// =============================================================================

/// One opened GPU device.
pub struct Device {
    adapter: Arc<IoctlAdapter>,
    registry: Arc<BoRegistry>,
    storage: Arc<AllocationStorage>,
    fences: Arc<FenceTracker>,
    worker: CloseWorker,
    engines: [SubmissionEngine; basalt_core::ENGINE_COUNT],
    device_index: u32,
}

impl Device {
    /// Open a device: probe the kernel once, fix the dialect, and build the
    /// submission machinery per `config`.
    pub fn open(dev: Arc<dyn KernelDevice>, device_index: u32, config: DeviceConfig) -> Result<Self> {
        let adapter = Arc::new(IoctlAdapter::open(dev)?);
        Self::with_adapter(adapter, device_index, config)
    }

    /// Build a device on an already-probed adapter
    pub fn with_adapter(
        adapter: Arc<IoctlAdapter>,
        device_index: u32,
        config: DeviceConfig,
    ) -> Result<Self> {
        let strategy = match config.wait_mode {
            WaitMode::Auto => {
                if adapter.caps().supports_fence_wait {
                    WaitStrategy::KernelFence
                } else {
                    WaitStrategy::Polling
                }
            }
            WaitMode::KernelFence => {
                if !adapter.caps().supports_fence_wait {
                    return Err(Error::DialectMismatch);
                }
                WaitStrategy::KernelFence
            }
            WaitMode::Polling => WaitStrategy::Polling,
        };

        let registry = Arc::new(BoRegistry::new());
        let storage = Arc::new(AllocationStorage::new());
        let fences = Arc::new(FenceTracker::new(Arc::clone(&adapter), strategy));
        let worker = CloseWorker::new(Arc::clone(&adapter), config.reclaim_mode);
        let engines = EngineClass::ALL.map(|engine| {
            SubmissionEngine::new(
                engine,
                Arc::clone(&adapter),
                Arc::clone(&registry),
                Arc::clone(&storage),
                Arc::clone(&fences),
                config.clone(),
            )
        });

        log::info!(
            "device {device_index} open: dialect {:?}, wait {strategy:?}, reclaim {:?}",
            adapter.dialect(),
            config.reclaim_mode
        );

        Ok(Self {
            adapter,
            registry,
            storage,
            fences,
            worker,
            engines,
            device_index,
        })
    }

    /// The negotiated kernel ABI dialect
    #[inline]
    pub fn dialect(&self) -> AbiDialect {
        self.adapter.dialect()
    }

    /// The dialect-fixed adapter
    #[inline]
    pub fn adapter(&self) -> &Arc<IoctlAdapter> {
        &self.adapter
    }

    /// The buffer registry
    #[inline]
    pub fn registry(&self) -> &Arc<BoRegistry> {
        &self.registry
    }

    /// The deferred free/reuse storage
    #[inline]
    pub fn storage(&self) -> &Arc<AllocationStorage> {
        &self.storage
    }

    /// The fence tracker
    #[inline]
    pub fn fences(&self) -> &Arc<FenceTracker> {
        &self.fences
    }

    // =========================================================================
    // Buffers
    // =========================================================================

    /// Create a buffer, preferring the reuse pool over the kernel.
    ///
    /// Pooled buffers keep their registry record across reuse; only a pool
    /// miss costs a kernel round-trip.
    pub fn create_buffer(&self, size: u64) -> Result<BoHandle> {
        if let Some(handle) = self.storage.take_reusable(size) {
            return Ok(handle);
        }
        let regions: &[MemRegion] = if self.adapter.caps().supports_mem_regions {
            &DEVICE_LOCAL
        } else {
            &[]
        };
        let handle = self.adapter.create_buffer(size, regions)?;
        self.registry.register(handle, size, self.device_index);
        Ok(handle)
    }

    /// Free a buffer immediately.
    ///
    /// Fails with [`Error::Busy`] while submissions still reference it; use
    /// [`Submission::free_on_completion`] for buffers attached to in-flight
    /// work.
    pub fn free_buffer(&self, handle: BoHandle) -> Result<()> {
        self.registry.remove(handle)?;
        self.worker.push(handle);
        Ok(())
    }

    /// Bind a buffer into the GPU address space (extended dialect only)
    pub fn bind_buffer(&self, params: VmBindParams) -> Result<()> {
        self.adapter.bind_vm(params)?;
        self.registry.set_gpu_addr(params.handle, params.start)?;
        self.registry.set_state(params.handle, ResidencyState::Resident)
    }

    /// Unbind a buffer from the GPU address space (extended dialect only)
    pub fn unbind_buffer(&self, params: VmBindParams) -> Result<()> {
        self.adapter.unbind_vm(params)?;
        self.registry.set_gpu_addr(params.handle, 0)?;
        self.registry.set_state(params.handle, ResidencyState::Evictable)
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Start assembling a submission around `batch`
    pub fn begin_submission(&self, batch: BatchBuffer) -> Result<Submission> {
        Submission::new(&self.registry, batch)
    }

    /// Flush a submission on `engine`; returns its fence value
    pub fn submit(&self, engine: EngineClass, submission: &mut Submission) -> Result<FenceValue> {
        self.engines[engine.index()].submit(submission)
    }

    /// Wait until `engine` reaches `target`
    pub fn wait_fence(&self, engine: EngineClass, target: FenceValue, timeout_ns: u64) -> WaitStatus {
        self.fences.wait(engine, target, timeout_ns)
    }

    // =========================================================================
    // Reclamation
    // =========================================================================

    /// Defer freeing `handle` until `engine` reaches `fence`.
    ///
    /// For buffers already attached to a submission prefer
    /// [`Submission::free_on_completion`], which picks the fence for you.
    pub fn defer_free(
        &self,
        handle: BoHandle,
        engine: EngineClass,
        fence: FenceValue,
        usage: UsageKind,
    ) {
        let size = self.registry.get(handle).map(|bo| bo.size).unwrap_or(0);
        self.storage.defer_free(handle, size, engine, fence, usage);
    }

    /// Reclaim deferred allocations covered by `engine`'s observed fence.
    ///
    /// Temporaries are unregistered and handed to the close worker; reusable
    /// entries move into the pool consulted by [`Device::create_buffer`].
    /// Returns the number of handles handed to the worker.
    pub fn drain_reclaimable(&self, engine: EngineClass) -> usize {
        let observed = self.fences.current(engine);
        let mut closed = 0;
        for handle in self.storage.reclaim_completed(engine, observed) {
            match self.registry.remove(handle) {
                Ok(_) => {
                    self.worker.push(handle);
                    closed += 1;
                }
                Err(Error::Busy) => {
                    // Still referenced; keep the close pending instead of
                    // leaking the handle. The next drain retries it.
                    log::warn!("reclaim of {handle} still referenced, re-deferred");
                    let size = self.registry.get(handle).map(|bo| bo.size).unwrap_or(0);
                    self.storage
                        .defer_free(handle, size, engine, observed, UsageKind::Temporary);
                }
                // Unregistered elsewhere; its close was issued there
                Err(e) => log::warn!("reclaim of {handle} skipped: {e}"),
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockKernel;
    use basalt_core::types::TIMEOUT_INFINITE;
    use basalt_mem::residency::BoAccess;
    use basalt_core::ReclaimMode;
    use basalt_uapi::VmBindFlags;

    const ENGINE: EngineClass = EngineClass::Render;

    fn open(mock: &Arc<MockKernel>, config: DeviceConfig) -> Result<Device> {
        Device::open(mock.clone(), 0, config)
    }

    fn inactive() -> DeviceConfig {
        DeviceConfig {
            reclaim_mode: ReclaimMode::Inactive,
            ..DeviceConfig::primary()
        }
    }

    fn batch(handle: BoHandle) -> BatchBuffer {
        BatchBuffer {
            handle,
            start_offset: 0,
            used_size: 128,
        }
    }

    #[test]
    fn auto_wait_follows_the_probe() {
        let mock = Arc::new(MockKernel::extended());
        let dev = open(&mock, inactive()).unwrap();
        assert_eq!(dev.dialect(), AbiDialect::Extended);
        assert_eq!(dev.fences().strategy(), WaitStrategy::KernelFence);

        let mock = Arc::new(MockKernel::legacy());
        let dev = open(&mock, inactive()).unwrap();
        assert_eq!(dev.dialect(), AbiDialect::Legacy);
        assert_eq!(dev.fences().strategy(), WaitStrategy::Polling);
    }

    #[test]
    fn forced_kernel_wait_on_legacy_fails_at_open() {
        let mock = Arc::new(MockKernel::legacy());
        let config = DeviceConfig {
            wait_mode: WaitMode::KernelFence,
            ..inactive()
        };
        assert!(matches!(open(&mock, config), Err(Error::DialectMismatch)));
    }

    #[test]
    fn submit_wait_drain_lifecycle() {
        let mock = Arc::new(MockKernel::extended());
        let dev = open(&mock, inactive()).unwrap();

        let scratch = dev.create_buffer(4096).unwrap();
        let data = dev.create_buffer(4096).unwrap();
        let cmd = dev.create_buffer(4096).unwrap();

        let mut s = dev.begin_submission(batch(cmd)).unwrap();
        s.add_resident(scratch, BoAccess::WRITE).unwrap();
        s.add_resident(data, BoAccess::READ).unwrap();
        s.free_on_completion(scratch, UsageKind::Temporary);
        let fence = dev.submit(ENGINE, &mut s).unwrap();
        assert_eq!(fence, 1);

        // Nothing reclaimable until the fence signals
        assert_eq!(dev.drain_reclaimable(ENGINE), 0);

        mock.set_fence(ENGINE, fence);
        assert_eq!(
            dev.wait_fence(ENGINE, fence, TIMEOUT_INFINITE),
            WaitStatus::Signaled
        );

        // Inactive worker closes on this thread during the drain
        assert_eq!(dev.drain_reclaimable(ENGINE), 1);
        assert_eq!(*mock.closed.lock().unwrap(), vec![scratch.raw()]);
        assert!(dev.registry().get(scratch).is_none());
        assert!(dev.registry().get(data).is_some());
    }

    #[test]
    fn reusable_buffers_skip_the_kernel() {
        let mock = Arc::new(MockKernel::extended());
        let dev = open(&mock, inactive()).unwrap();

        let scratch = dev.create_buffer(8192).unwrap();
        let cmd = dev.create_buffer(4096).unwrap();
        assert_eq!(mock.created.lock().unwrap().len(), 2);

        let mut s = dev.begin_submission(batch(cmd)).unwrap();
        s.add_resident(scratch, BoAccess::WRITE).unwrap();
        s.free_on_completion(scratch, UsageKind::Reusable);
        let fence = dev.submit(ENGINE, &mut s).unwrap();

        mock.set_fence(ENGINE, fence);
        dev.wait_fence(ENGINE, fence, TIMEOUT_INFINITE);
        // Pooled, not closed
        assert_eq!(dev.drain_reclaimable(ENGINE), 0);
        assert!(mock.closed.lock().unwrap().is_empty());

        // Served from the pool with its registry record intact
        assert_eq!(dev.create_buffer(8192).unwrap(), scratch);
        assert_eq!(mock.created.lock().unwrap().len(), 2);
        assert_eq!(dev.registry().get(scratch).unwrap().size, 8192);
    }

    #[test]
    fn bind_records_the_gpu_address() {
        let mock = Arc::new(MockKernel::extended());
        let dev = open(&mock, inactive()).unwrap();
        let buf = dev.create_buffer(4096).unwrap();

        let params = VmBindParams {
            vm_id: 1,
            handle: buf,
            start: 0x10_0000,
            offset: 0,
            length: 4096,
            flags: VmBindFlags::IMMEDIATE | VmBindFlags::MAKE_RESIDENT,
        };
        dev.bind_buffer(params).unwrap();

        let bo = dev.registry().get(buf).unwrap();
        assert_eq!(bo.gpu_addr, 0x10_0000);
        assert_eq!(bo.state, ResidencyState::Resident);
        assert_eq!(*mock.bound.lock().unwrap(), vec![(buf.raw(), 0x10_0000)]);

        dev.unbind_buffer(params).unwrap();
        let bo = dev.registry().get(buf).unwrap();
        assert_eq!(bo.gpu_addr, 0);
        assert_eq!(bo.state, ResidencyState::Evictable);
    }

    #[test]
    fn bound_address_flows_into_the_exec_list() {
        let mock = Arc::new(MockKernel::extended());
        let dev = open(&mock, inactive()).unwrap();
        let buf = dev.create_buffer(4096).unwrap();
        let cmd = dev.create_buffer(4096).unwrap();

        dev.bind_buffer(VmBindParams {
            vm_id: 1,
            handle: buf,
            start: 0x20_0000,
            offset: 0,
            length: 4096,
            flags: VmBindFlags::IMMEDIATE,
        })
        .unwrap();

        let mut s = dev.begin_submission(batch(cmd)).unwrap();
        s.add_resident(buf, BoAccess::READ).unwrap();
        dev.submit(ENGINE, &mut s).unwrap();

        let calls = mock.exec_calls.lock().unwrap();
        assert_eq!(calls[0].objects[0].offset, 0x20_0000);
    }

    #[test]
    fn referenced_temporary_stays_pending_until_released() {
        let mock = Arc::new(MockKernel::extended());
        let dev = open(&mock, inactive()).unwrap();
        let scratch = dev.create_buffer(4096).unwrap();
        let cmd = dev.create_buffer(4096).unwrap();

        let mut s = dev.begin_submission(batch(cmd)).unwrap();
        s.add_resident(scratch, BoAccess::WRITE).unwrap();
        s.free_on_completion(scratch, UsageKind::Temporary);
        let fence = dev.submit(ENGINE, &mut s).unwrap();

        // A rival reference lands before the drain
        dev.registry().retain(scratch).unwrap();
        mock.set_fence(ENGINE, fence);
        dev.wait_fence(ENGINE, fence, TIMEOUT_INFINITE);

        // Not closed, not lost: the entry goes back on the deferred list
        assert_eq!(dev.drain_reclaimable(ENGINE), 0);
        assert!(mock.closed.lock().unwrap().is_empty());
        assert_eq!(dev.storage().pending_count(), 1);

        dev.registry().release(scratch).unwrap();
        assert_eq!(dev.drain_reclaimable(ENGINE), 1);
        assert_eq!(*mock.closed.lock().unwrap(), vec![scratch.raw()]);
    }

    #[test]
    fn free_refuses_referenced_buffers() {
        let mock = Arc::new(MockKernel::extended());
        let dev = open(&mock, inactive()).unwrap();
        let buf = dev.create_buffer(4096).unwrap();

        dev.registry().retain(buf).unwrap();
        assert_eq!(dev.free_buffer(buf).unwrap_err(), Error::Busy);

        dev.registry().release(buf).unwrap();
        dev.free_buffer(buf).unwrap();
        assert_eq!(*mock.closed.lock().unwrap(), vec![buf.raw()]);
    }

    #[test]
    fn vm_bind_on_legacy_is_a_dialect_mismatch() {
        let mock = Arc::new(MockKernel::legacy());
        let dev = open(&mock, inactive()).unwrap();
        let buf = dev.create_buffer(4096).unwrap();

        let params = VmBindParams {
            vm_id: 1,
            handle: buf,
            start: 0x1000,
            offset: 0,
            length: 4096,
            flags: VmBindFlags::IMMEDIATE,
        };
        assert_eq!(dev.bind_buffer(params).unwrap_err(), Error::DialectMismatch);
    }
}
