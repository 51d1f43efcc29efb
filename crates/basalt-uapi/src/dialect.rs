//! # Dialect Negotiation
//!
//! The kernel ABI comes in dialects: the legacy interface (relocation-era
//! GEM, blocking waits only) and the extended interface (VM bind, placement
//! regions, kernel-offloaded fence waits).
//!
//! The dialect is probed exactly once, at device-open time, and the result
//! is fixed for the device's lifetime. Nothing downstream re-detects.

use basalt_core::Result;

use crate::device::KernelDevice;
use crate::req::GetParam;

// =============================================================================
// PARAMETERS
// =============================================================================

/// Device parameter selectors for the capability probe
pub mod param {
    /// Kernel ABI major version
    pub const ABI_VERSION: u32 = 0x01;
    /// Non-zero when the VM bind interface is available
    pub const HAS_VM_BIND: u32 = 0x02;
    /// Non-zero when the kernel-offloaded fence wait is available
    pub const HAS_FENCE_WAIT: u32 = 0x03;
    /// Non-zero when buffer placement regions are honored
    pub const HAS_MEM_REGIONS: u32 = 0x04;
}

// =============================================================================
// DIALECT
// =============================================================================

/// Negotiated kernel ABI dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiDialect {
    /// Relocation-era interface: `GemCreate`, blocking `GemWait`
    Legacy,
    /// VM-bind interface: `GemCreateExt`, `VmBind`, `WaitUserFence`
    Extended,
}

/// Capability set fixed at device open.
#[derive(Debug, Clone, Copy)]
pub struct DialectCaps {
    /// The negotiated dialect
    pub dialect: AbiDialect,
    /// Kernel supports VM bind/unbind
    pub supports_vm_bind: bool,
    /// Kernel supports the offloaded fence wait
    pub supports_fence_wait: bool,
    /// Kernel honors placement regions at creation
    pub supports_mem_regions: bool,
}

/// Probe the kernel's capability set.
///
/// Old kernels reject unknown parameter selectors; a rejected probe means
/// "not supported", not a hard failure.
pub fn probe(dev: &dyn KernelDevice) -> Result<DialectCaps> {
    let vm_bind = query_bool(dev, param::HAS_VM_BIND);
    let fence_wait = query_bool(dev, param::HAS_FENCE_WAIT);
    let mem_regions = query_bool(dev, param::HAS_MEM_REGIONS);

    let dialect = if vm_bind {
        AbiDialect::Extended
    } else {
        AbiDialect::Legacy
    };

    log::debug!(
        "negotiated kernel ABI dialect {:?} (vm_bind={}, fence_wait={}, mem_regions={})",
        dialect,
        vm_bind,
        fence_wait,
        mem_regions
    );

    Ok(DialectCaps {
        dialect,
        supports_vm_bind: vm_bind,
        supports_fence_wait: fence_wait,
        supports_mem_regions: mem_regions,
    })
}

fn query_bool(dev: &dyn KernelDevice, selector: u32) -> bool {
    let mut req = GetParam {
        param: selector,
        ..Default::default()
    };
    match dev.get_param(&mut req) {
        Ok(()) => req.value != 0,
        Err(_) => false,
    }
}
