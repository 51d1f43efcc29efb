//! # Ioctl Adapter
//!
//! Dispatches engine-level operations against the dialect negotiated at
//! device open. Each operation maps to exactly one kernel request; the
//! adapter never retries. Requesting an operation the negotiated dialect
//! cannot express fails with [`Error::DialectMismatch`], which callers treat
//! as fatal at initialization time.

use std::sync::Arc;

use basalt_core::types::TIMEOUT_INFINITE;
use basalt_core::{BoHandle, EngineClass, Error, FenceValue, Result, WaitStatus};

use crate::device::KernelDevice;
use crate::dialect::{self, AbiDialect, DialectCaps};
use crate::req::{
    ExecBuffer, ExecFlags, ExecObject, FenceRead, GemClose, GemCreate, GemCreateExt, GemWait,
    GetParam, MemRegion, VmBind, VmBindFlags, WaitUserFence, MAX_MEM_REGIONS, UFENCE_WAIT_GTE,
    UFENCE_WIDTH_U64,
};

// =============================================================================
// VM BIND PARAMETERS
// =============================================================================

/// Engine-level VM bind parameters, translated into the dialect's request
/// structure by the adapter.
#[derive(Debug, Clone, Copy)]
pub struct VmBindParams {
    /// Address space identifier
    pub vm_id: u32,
    /// Buffer to bind
    pub handle: BoHandle,
    /// GPU virtual address of the range start
    pub start: u64,
    /// Offset into the buffer
    pub offset: u64,
    /// Length of the range in bytes
    pub length: u64,
    /// Bind flags
    pub flags: VmBindFlags,
}

impl VmBindParams {
    fn to_req(self) -> VmBind {
        VmBind {
            vm_id: self.vm_id,
            handle: self.handle.raw(),
            start: self.start,
            offset: self.offset,
            length: self.length,
            flags: self.flags.bits(),
        }
    }
}

// =============================================================================
// IOCTL ADAPTER
// =============================================================================

/// Kernel-ABI adapter with a fixed dialect choice.
pub struct IoctlAdapter {
    dev: Arc<dyn KernelDevice>,
    caps: DialectCaps,
}

impl IoctlAdapter {
    /// Probe the kernel once and fix the dialect for this device's lifetime
    pub fn open(dev: Arc<dyn KernelDevice>) -> Result<Self> {
        let caps = dialect::probe(&*dev)?;
        Ok(Self { dev, caps })
    }

    /// Build an adapter from an already-probed capability set
    pub fn with_caps(dev: Arc<dyn KernelDevice>, caps: DialectCaps) -> Self {
        Self { dev, caps }
    }

    /// The negotiated dialect
    #[inline]
    pub fn dialect(&self) -> AbiDialect {
        self.caps.dialect
    }

    /// The capability set fixed at open
    #[inline]
    pub fn caps(&self) -> &DialectCaps {
        &self.caps
    }

    // =========================================================================
    // Buffer lifetime
    // =========================================================================

    /// Create a buffer object.
    ///
    /// Placement `regions` require the extended dialect; passing them on a
    /// legacy device is a dialect mismatch, not a silent downgrade.
    pub fn create_buffer(&self, size: u64, regions: &[MemRegion]) -> Result<BoHandle> {
        if regions.len() > MAX_MEM_REGIONS {
            return Err(Error::MalformedResidency);
        }
        let handle = match self.caps.dialect {
            AbiDialect::Legacy => {
                if !regions.is_empty() {
                    return Err(Error::DialectMismatch);
                }
                let mut req = GemCreate {
                    size,
                    ..Default::default()
                };
                self.dev.gem_create(&mut req)?;
                req.handle
            }
            AbiDialect::Extended => {
                let mut req = GemCreateExt {
                    size,
                    region_count: regions.len() as u32,
                    ..Default::default()
                };
                req.regions[..regions.len()].copy_from_slice(regions);
                self.dev.gem_create_ext(&mut req)?;
                req.handle
            }
        };
        log::debug!("created BO-{} size={}", handle, size);
        Ok(BoHandle::new(handle))
    }

    /// Close a buffer object handle
    pub fn destroy_buffer(&self, handle: BoHandle) -> Result<()> {
        let req = GemClose {
            handle: handle.raw(),
            pad: 0,
        };
        self.dev.gem_close(&req)?;
        log::debug!("closed {}", handle);
        Ok(())
    }

    // =========================================================================
    // Virtual memory
    // =========================================================================

    /// Bind a buffer into the GPU address space (extended dialect only)
    pub fn bind_vm(&self, params: VmBindParams) -> Result<()> {
        if !self.caps.supports_vm_bind {
            return Err(Error::DialectMismatch);
        }
        self.dev.vm_bind(&params.to_req())
    }

    /// Unbind a GPU virtual address range (extended dialect only)
    pub fn unbind_vm(&self, params: VmBindParams) -> Result<()> {
        if !self.caps.supports_vm_bind {
            return Err(Error::DialectMismatch);
        }
        self.dev.vm_unbind(&params.to_req())
    }

    // =========================================================================
    // Submission
    // =========================================================================

    /// Submit a command buffer with its kernel-facing residency list.
    ///
    /// Blocks only for kernel acceptance of the request, never for GPU
    /// completion. Transient failures (`Busy`, `WouldBlock`) surface to the
    /// caller; the orchestrator owns the retry policy.
    pub fn submit_exec(
        &self,
        engine: EngineClass,
        exec_list: &[ExecObject],
        batch_start: u64,
        batch_len: u64,
        flags: ExecFlags,
    ) -> Result<()> {
        if exec_list.is_empty() {
            return Err(Error::MalformedResidency);
        }
        let req = ExecBuffer {
            objects_ptr: exec_list.as_ptr() as u64,
            object_count: exec_list.len() as u32,
            engine: engine.index() as u32,
            batch_start,
            batch_len,
            flags: flags.bits(),
        };
        self.dev.exec_buffer(&req)
    }

    // =========================================================================
    // Fences
    // =========================================================================

    /// Wait in the kernel until `engine`'s fence reaches `target`.
    ///
    /// `timeout_ns == 0` polls once; [`TIMEOUT_INFINITE`] waits forever.
    /// A timeout is an outcome, not an error.
    pub fn wait_fence(
        &self,
        engine: EngineClass,
        target: FenceValue,
        timeout_ns: u64,
    ) -> WaitStatus {
        let result = if self.caps.supports_fence_wait {
            let mut req = WaitUserFence {
                value: target,
                timeout_ns,
                op: UFENCE_WAIT_GTE,
                width: UFENCE_WIDTH_U64,
                engine: engine.index() as u32,
            };
            self.dev.wait_user_fence(&mut req)
        } else {
            let mut req = GemWait {
                engine: engine.index() as u32,
                pad: 0,
                target,
                timeout_ns,
            };
            self.dev.gem_wait(&mut req)
        };
        match result {
            Ok(()) => WaitStatus::Signaled,
            Err(Error::Errno(e)) if e == libc::ETIME => WaitStatus::TimedOut,
            Err(e) => WaitStatus::Failed(e),
        }
    }

    /// Read `engine`'s current fence value (polling wait strategy)
    pub fn read_fence(&self, engine: EngineClass) -> Result<FenceValue> {
        let mut req = FenceRead {
            engine: engine.index() as u32,
            ..Default::default()
        };
        self.dev.fence_read(&mut req)?;
        Ok(req.value)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Query a device parameter
    pub fn query_param(&self, selector: u32) -> Result<u64> {
        let mut req = GetParam {
            param: selector,
            ..Default::default()
        };
        self.dev.get_param(&mut req)?;
        Ok(req.value)
    }
}

// Infinite timeout is a plain maximum, usable as-is in request structures.
const _: () = assert!(TIMEOUT_INFINITE == u64::MAX);
