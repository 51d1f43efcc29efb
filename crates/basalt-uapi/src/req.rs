//! # Kernel Request Structures
//!
//! Fixed-size request structures, one per kernel operation, passed by
//! reference to the device. These are this engine's own versioned contract
//! with its kernel module; layouts are locked down with compile-time size
//! assertions so a refactor can never silently change the wire shape.

use static_assertions::const_assert_eq;

// =============================================================================
// IOCTL CODES
// =============================================================================

/// Ioctl request code, `_IOWR('B', nr, size)` style
const fn iowr(nr: u64, size: u64) -> u64 {
    const IOC_READ: u64 = 2;
    const IOC_WRITE: u64 = 1;
    ((IOC_READ | IOC_WRITE) << 30) | (size << 16) | ((b'B' as u64) << 8) | nr
}

/// Kernel operation selector.
///
/// One code per request structure. `name()` exists purely for log lines;
/// debugging a failed ioctl from a raw number is miserable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoctlCode {
    /// Create a buffer object (legacy dialect)
    GemCreate,
    /// Create a buffer object with placement regions (extended dialect)
    GemCreateExt,
    /// Close a buffer object handle
    GemClose,
    /// Bind a buffer into a GPU virtual address range (extended dialect)
    VmBind,
    /// Unbind a GPU virtual address range (extended dialect)
    VmUnbind,
    /// Submit a command buffer with its residency list
    ExecBuffer,
    /// Block until an engine fence reaches a value (legacy dialect)
    GemWait,
    /// Kernel-offloaded user fence wait (extended dialect)
    WaitUserFence,
    /// Query a device parameter
    GetParam,
    /// Read an engine's current fence value
    FenceRead,
}

impl IoctlCode {
    /// Raw request code for the fd-backed device
    pub const fn request(self) -> u64 {
        match self {
            Self::GemCreate => iowr(0x00, core::mem::size_of::<GemCreate>() as u64),
            Self::GemCreateExt => iowr(0x01, core::mem::size_of::<GemCreateExt>() as u64),
            Self::GemClose => iowr(0x02, core::mem::size_of::<GemClose>() as u64),
            Self::VmBind => iowr(0x03, core::mem::size_of::<VmBind>() as u64),
            Self::VmUnbind => iowr(0x04, core::mem::size_of::<VmBind>() as u64),
            Self::ExecBuffer => iowr(0x05, core::mem::size_of::<ExecBuffer>() as u64),
            Self::GemWait => iowr(0x06, core::mem::size_of::<GemWait>() as u64),
            Self::WaitUserFence => iowr(0x07, core::mem::size_of::<WaitUserFence>() as u64),
            Self::GetParam => iowr(0x08, core::mem::size_of::<GetParam>() as u64),
            Self::FenceRead => iowr(0x09, core::mem::size_of::<FenceRead>() as u64),
        }
    }

    /// Human-readable name for log lines
    pub const fn name(self) -> &'static str {
        match self {
            Self::GemCreate => "GEM_CREATE",
            Self::GemCreateExt => "GEM_CREATE_EXT",
            Self::GemClose => "GEM_CLOSE",
            Self::VmBind => "VM_BIND",
            Self::VmUnbind => "VM_UNBIND",
            Self::ExecBuffer => "EXEC_BUFFER",
            Self::GemWait => "GEM_WAIT",
            Self::WaitUserFence => "WAIT_USER_FENCE",
            Self::GetParam => "GET_PARAM",
            Self::FenceRead => "FENCE_READ",
        }
    }
}

// =============================================================================
// BUFFER CREATION
// =============================================================================

/// Legacy buffer creation request
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemCreate {
    /// Requested size in bytes (in)
    pub size: u64,
    /// Kernel handle (out)
    pub handle: u32,
    /// Creation flags (in)
    pub flags: u32,
}

/// Memory placement region (class + instance pair)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct MemRegion {
    /// Memory class (system vs. device-local)
    pub class: u16,
    /// Instance within the class (tile index)
    pub instance: u16,
}

/// Maximum placement regions in one creation request
pub const MAX_MEM_REGIONS: usize = 4;

/// Extended buffer creation request with placement regions
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemCreateExt {
    /// Requested size in bytes (in)
    pub size: u64,
    /// Kernel handle (out)
    pub handle: u32,
    /// Number of valid entries in `regions` (in)
    pub region_count: u32,
    /// Placement regions, in preference order (in)
    pub regions: [MemRegion; MAX_MEM_REGIONS],
}

/// Buffer close request
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemClose {
    /// Kernel handle to close (in)
    pub handle: u32,
    /// Padding, must be zero
    pub pad: u32,
}

// =============================================================================
// VIRTUAL MEMORY BINDING
// =============================================================================

bitflags::bitflags! {
    /// Flags for VM bind/unbind requests
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmBindFlags: u64 {
        /// Complete the bind before the ioctl returns
        const IMMEDIATE = 1 << 0;
        /// Make the binding resident for all future submissions
        const MAKE_RESIDENT = 1 << 1;
        /// Capture the range in error-state dumps
        const CAPTURE = 1 << 2;
    }
}

/// VM bind/unbind request (extended dialect only)
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct VmBind {
    /// Address space identifier (in)
    pub vm_id: u32,
    /// Buffer handle, zero for unbind (in)
    pub handle: u32,
    /// GPU virtual address of the range start (in)
    pub start: u64,
    /// Offset into the buffer (in)
    pub offset: u64,
    /// Length of the range in bytes (in)
    pub length: u64,
    /// [`VmBindFlags`] bits (in)
    pub flags: u64,
}

// =============================================================================
// SUBMISSION
// =============================================================================

/// Write access bit in [`ExecObject::flags`]
pub const EXEC_OBJECT_WRITE: u32 = 1 << 0;
/// Read access bit in [`ExecObject::flags`]
pub const EXEC_OBJECT_READ: u32 = 1 << 1;

/// One entry of the kernel-facing residency list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ExecObject {
    /// Buffer handle (in)
    pub handle: u32,
    /// Access bits for this submission (in)
    pub flags: u32,
    /// GPU virtual address the buffer is expected at (in)
    pub offset: u64,
}

bitflags::bitflags! {
    /// Submission-level flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecFlags: u64 {
        /// Fail with would-block instead of stalling in the kernel
        const NON_BLOCKING = 1 << 0;
    }
}

/// Command buffer submission request
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ExecBuffer {
    /// Pointer to an array of [`ExecObject`] (in)
    pub objects_ptr: u64,
    /// Number of exec objects (in)
    pub object_count: u32,
    /// Target engine index (in)
    pub engine: u32,
    /// Offset of the batch start within the last exec object (in)
    pub batch_start: u64,
    /// Used bytes of the command buffer (in)
    pub batch_len: u64,
    /// [`ExecFlags`] bits (in)
    pub flags: u64,
}

// =============================================================================
// WAITING
// =============================================================================

/// Legacy fence wait request
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GemWait {
    /// Target engine index (in)
    pub engine: u32,
    /// Padding, must be zero
    pub pad: u32,
    /// Fence value to wait for (in)
    pub target: u64,
    /// Timeout in nanoseconds; `u64::MAX` waits forever (in)
    pub timeout_ns: u64,
}

/// "Signal when fence >= value" comparison op for [`WaitUserFence`]
pub const UFENCE_WAIT_GTE: u16 = 0;

/// 64-bit comparison width for [`WaitUserFence`]
pub const UFENCE_WIDTH_U64: u16 = 3;

/// Extended kernel-offloaded fence wait request
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct WaitUserFence {
    /// Fence value to compare against (in)
    pub value: u64,
    /// Timeout in nanoseconds; `u64::MAX` waits forever (in)
    pub timeout_ns: u64,
    /// Comparison op, [`UFENCE_WAIT_GTE`] (in)
    pub op: u16,
    /// Comparison width, [`UFENCE_WIDTH_U64`] (in)
    pub width: u16,
    /// Target engine index (in)
    pub engine: u32,
}

// =============================================================================
// QUERIES
// =============================================================================

/// Device parameter query request
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct GetParam {
    /// Parameter selector (in)
    pub param: u32,
    /// Padding, must be zero
    pub pad: u32,
    /// Parameter value (out)
    pub value: u64,
}

/// Engine fence register read request
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct FenceRead {
    /// Target engine index (in)
    pub engine: u32,
    /// Padding, must be zero
    pub pad: u32,
    /// Current fence value (out)
    pub value: u64,
}

// =============================================================================
// LAYOUT ASSERTIONS
// =============================================================================

const_assert_eq!(core::mem::size_of::<GemCreate>(), 16);
const_assert_eq!(core::mem::size_of::<GemCreateExt>(), 32);
const_assert_eq!(core::mem::size_of::<GemClose>(), 8);
const_assert_eq!(core::mem::size_of::<VmBind>(), 40);
const_assert_eq!(core::mem::size_of::<ExecObject>(), 16);
const_assert_eq!(core::mem::size_of::<ExecBuffer>(), 40);
const_assert_eq!(core::mem::size_of::<GemWait>(), 24);
const_assert_eq!(core::mem::size_of::<WaitUserFence>(), 24);
const_assert_eq!(core::mem::size_of::<GetParam>(), 16);
const_assert_eq!(core::mem::size_of::<FenceRead>(), 16);
