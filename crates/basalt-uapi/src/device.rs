//! # Kernel Device Seam
//!
//! The raw boundary to the kernel driver: one trait method per request
//! structure, each mapping to exactly one kernel call.
//!
//! Everything above this trait is kernel-free and testable against scripted
//! implementations; the fd-backed [`DrmDevice`] is the only code in the
//! engine that issues real ioctls.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;

use basalt_core::{Error, Result};

use crate::req::{
    ExecBuffer, FenceRead, GemClose, GemCreate, GemCreateExt, GemWait, GetParam, IoctlCode,
    VmBind, WaitUserFence,
};

// =============================================================================
// KERNEL DEVICE TRAIT
// =============================================================================

/// Raw kernel driver interface.
///
/// Each method issues exactly one kernel request; failures surface as typed
/// errors and are never retried here (except the EINTR restart inside the
/// fd-backed implementation, which is below the request level).
pub trait KernelDevice: Send + Sync {
    /// Create a buffer object (legacy request)
    fn gem_create(&self, req: &mut GemCreate) -> Result<()>;
    /// Create a buffer object with placement regions (extended request)
    fn gem_create_ext(&self, req: &mut GemCreateExt) -> Result<()>;
    /// Close a buffer object handle
    fn gem_close(&self, req: &GemClose) -> Result<()>;
    /// Bind a buffer into a GPU virtual address range
    fn vm_bind(&self, req: &VmBind) -> Result<()>;
    /// Unbind a GPU virtual address range
    fn vm_unbind(&self, req: &VmBind) -> Result<()>;
    /// Submit a command buffer with its residency list
    fn exec_buffer(&self, req: &ExecBuffer) -> Result<()>;
    /// Block until an engine fence reaches a value (legacy wait)
    fn gem_wait(&self, req: &mut GemWait) -> Result<()>;
    /// Kernel-offloaded fence wait (extended wait)
    fn wait_user_fence(&self, req: &mut WaitUserFence) -> Result<()>;
    /// Query a device parameter
    fn get_param(&self, req: &mut GetParam) -> Result<()>;
    /// Read an engine's current fence value
    fn fence_read(&self, req: &mut FenceRead) -> Result<()>;
}

// =============================================================================
// FD-BACKED DEVICE
// =============================================================================

/// Kernel device backed by an open DRM render node.
#[derive(Debug)]
pub struct DrmDevice {
    file: File,
}

impl DrmDevice {
    /// Open a render node, e.g. `/dev/dri/renderD128`
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    /// Issue one ioctl, restarting on EINTR.
    ///
    /// EINTR restart happens below the request level; EAGAIN is surfaced as
    /// `WouldBlock` so the orchestrator's retry policy stays in charge of
    /// the transient class.
    ///
    /// # Safety
    /// `arg` must point to the request structure matching `code`.
    unsafe fn ioctl<T>(&self, code: IoctlCode, arg: *mut T) -> Result<()> {
        loop {
            // SAFETY: caller guarantees arg matches the request code
            let ret = unsafe {
                libc::ioctl(
                    self.file.as_raw_fd(),
                    code.request() as libc::c_ulong,
                    arg,
                )
            };
            if ret == 0 {
                return Ok(());
            }
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR {
                continue;
            }
            log::trace!("ioctl({}) failed: errno={}", code.name(), errno);
            return Err(Error::from_errno(errno));
        }
    }
}

impl KernelDevice for DrmDevice {
    fn gem_create(&self, req: &mut GemCreate) -> Result<()> {
        // SAFETY: req matches IoctlCode::GemCreate
        unsafe { self.ioctl(IoctlCode::GemCreate, req) }
    }

    fn gem_create_ext(&self, req: &mut GemCreateExt) -> Result<()> {
        // SAFETY: req matches IoctlCode::GemCreateExt
        unsafe { self.ioctl(IoctlCode::GemCreateExt, req) }
    }

    fn gem_close(&self, req: &GemClose) -> Result<()> {
        let mut req = *req;
        // SAFETY: req matches IoctlCode::GemClose
        unsafe { self.ioctl(IoctlCode::GemClose, &mut req) }
    }

    fn vm_bind(&self, req: &VmBind) -> Result<()> {
        let mut req = *req;
        // SAFETY: req matches IoctlCode::VmBind
        unsafe { self.ioctl(IoctlCode::VmBind, &mut req) }
    }

    fn vm_unbind(&self, req: &VmBind) -> Result<()> {
        let mut req = *req;
        // SAFETY: req matches IoctlCode::VmUnbind
        unsafe { self.ioctl(IoctlCode::VmUnbind, &mut req) }
    }

    fn exec_buffer(&self, req: &ExecBuffer) -> Result<()> {
        let mut req = *req;
        // SAFETY: req matches IoctlCode::ExecBuffer
        unsafe { self.ioctl(IoctlCode::ExecBuffer, &mut req) }
    }

    fn gem_wait(&self, req: &mut GemWait) -> Result<()> {
        // SAFETY: req matches IoctlCode::GemWait
        unsafe { self.ioctl(IoctlCode::GemWait, req) }
    }

    fn wait_user_fence(&self, req: &mut WaitUserFence) -> Result<()> {
        // SAFETY: req matches IoctlCode::WaitUserFence
        unsafe { self.ioctl(IoctlCode::WaitUserFence, req) }
    }

    fn get_param(&self, req: &mut GetParam) -> Result<()> {
        // SAFETY: req matches IoctlCode::GetParam
        unsafe { self.ioctl(IoctlCode::GetParam, req) }
    }

    fn fence_read(&self, req: &mut FenceRead) -> Result<()> {
        // SAFETY: req matches IoctlCode::FenceRead
        unsafe { self.ioctl(IoctlCode::FenceRead, req) }
    }
}
