//! Shared scripted kernel device for command-side tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use basalt_core::{EngineClass, Error, Result, ENGINE_COUNT};
use basalt_uapi::dialect::{param, AbiDialect, DialectCaps};
use basalt_uapi::req::*;
use basalt_uapi::KernelDevice;

/// One recorded exec_buffer call, with the object array snapshotted the way
/// the kernel would read it.
pub(crate) struct ExecCall {
    pub engine: u32,
    pub flags: u64,
    pub batch_len: u64,
    pub objects: Vec<ExecObject>,
}

/// Scripted kernel device: hands out handles, records calls, and answers
/// fence waits from a settable per-engine fence array.
pub(crate) struct MockKernel {
    dialect: AbiDialect,
    next_handle: AtomicU32,
    pub created: Mutex<Vec<u64>>,
    pub closed: Mutex<Vec<u32>>,
    pub bound: Mutex<Vec<(u32, u64)>>,
    pub exec_calls: Mutex<Vec<ExecCall>>,
    exec_errors: Mutex<VecDeque<Error>>,
    fences: Mutex<[u64; ENGINE_COUNT]>,
    pub fence_reads: AtomicUsize,
}

impl MockKernel {
    pub fn new(dialect: AbiDialect) -> Self {
        Self {
            dialect,
            next_handle: AtomicU32::new(0),
            created: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
            exec_calls: Mutex::new(Vec::new()),
            exec_errors: Mutex::new(VecDeque::new()),
            fences: Mutex::new([0; ENGINE_COUNT]),
            fence_reads: AtomicUsize::new(0),
        }
    }

    pub fn extended() -> Self {
        Self::new(AbiDialect::Extended)
    }

    pub fn legacy() -> Self {
        Self::new(AbiDialect::Legacy)
    }

    pub fn caps(&self) -> DialectCaps {
        let extended = self.dialect == AbiDialect::Extended;
        DialectCaps {
            dialect: self.dialect,
            supports_vm_bind: extended,
            supports_fence_wait: extended,
            supports_mem_regions: extended,
        }
    }

    /// Queue an error for the next exec_buffer call; calls beyond the queue
    /// succeed.
    pub fn queue_exec_error(&self, e: Error) {
        self.exec_errors.lock().unwrap().push_back(e);
    }

    pub fn set_fence(&self, engine: EngineClass, value: u64) {
        self.fences.lock().unwrap()[engine.index()] = value;
    }

    pub fn exec_count(&self) -> usize {
        self.exec_calls.lock().unwrap().len()
    }

    fn wait_outcome(&self, engine: usize, target: u64) -> Result<()> {
        if self.fences.lock().unwrap()[engine] >= target {
            Ok(())
        } else {
            Err(Error::Errno(libc::ETIME))
        }
    }
}

impl KernelDevice for MockKernel {
    fn gem_create(&self, req: &mut GemCreate) -> Result<()> {
        self.created.lock().unwrap().push(req.size);
        req.handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(())
    }

    fn gem_create_ext(&self, req: &mut GemCreateExt) -> Result<()> {
        self.created.lock().unwrap().push(req.size);
        req.handle = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(())
    }

    fn gem_close(&self, req: &GemClose) -> Result<()> {
        self.closed.lock().unwrap().push(req.handle);
        Ok(())
    }

    fn vm_bind(&self, req: &VmBind) -> Result<()> {
        self.bound.lock().unwrap().push((req.handle, req.start));
        Ok(())
    }

    fn vm_unbind(&self, _: &VmBind) -> Result<()> {
        Ok(())
    }

    fn exec_buffer(&self, req: &ExecBuffer) -> Result<()> {
        let objects = unsafe {
            std::slice::from_raw_parts(req.objects_ptr as *const ExecObject, req.object_count as usize)
        }
        .to_vec();
        self.exec_calls.lock().unwrap().push(ExecCall {
            engine: req.engine,
            flags: req.flags,
            batch_len: req.batch_len,
            objects,
        });
        match self.exec_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn gem_wait(&self, req: &mut GemWait) -> Result<()> {
        self.wait_outcome(req.engine as usize, req.target)
    }

    fn wait_user_fence(&self, req: &mut WaitUserFence) -> Result<()> {
        self.wait_outcome(req.engine as usize, req.value)
    }

    fn get_param(&self, req: &mut GetParam) -> Result<()> {
        let extended = self.dialect == AbiDialect::Extended;
        match req.param {
            param::ABI_VERSION => {
                req.value = if extended { 2 } else { 1 };
                Ok(())
            }
            param::HAS_VM_BIND | param::HAS_FENCE_WAIT | param::HAS_MEM_REGIONS if extended => {
                req.value = 1;
                Ok(())
            }
            // Old kernels reject unknown selectors
            _ => Err(Error::SubmissionRejected),
        }
    }

    fn fence_read(&self, req: &mut FenceRead) -> Result<()> {
        self.fence_reads.fetch_add(1, Ordering::SeqCst);
        req.value = self.fences.lock().unwrap()[req.engine as usize];
        Ok(())
    }
}
