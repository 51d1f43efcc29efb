//! # Buffer Object Registry
//!
//! The per-device registry of kernel buffer handles. The registry is the
//! single owner of [`BufferObject`] records and the only shared resource in
//! the engine that needs cross-thread locking; per-submission residency
//! sets stay private to their constructing thread.

use std::collections::HashMap;
use std::sync::Mutex;

use basalt_core::{BoHandle, Error, Result};

// =============================================================================
// RESIDENCY STATE
// =============================================================================

/// Kernel-side residency state of a buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidencyState {
    /// Bound and resident in GPU-addressable memory
    Resident,
    /// May be evicted by the kernel under pressure
    Evictable,
    /// Kernel handle has been closed
    Closed,
}

// =============================================================================
// BUFFER OBJECT
// =============================================================================

/// One kernel-resident memory allocation.
///
/// Destroyed only after its reference count reaches zero AND every fence
/// that could reference it has signaled; the refcount counts outstanding
/// submissions, not API-level users.
#[derive(Debug, Clone)]
pub struct BufferObject {
    /// Kernel handle
    pub handle: BoHandle,
    /// Size in bytes
    pub size: u64,
    /// GPU virtual address, zero while unbound
    pub gpu_addr: u64,
    /// Owning device index
    pub device_index: u32,
    /// Residency state
    pub state: ResidencyState,
    /// Outstanding submission references
    refcount: u32,
}

impl BufferObject {
    /// Outstanding submission references
    #[inline]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Shared, lock-protected registry of buffer objects for one device.
#[derive(Debug, Default)]
pub struct BoRegistry {
    inner: Mutex<HashMap<BoHandle, BufferObject>>,
}

impl BoRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created buffer
    pub fn register(&self, handle: BoHandle, size: u64, device_index: u32) {
        let bo = BufferObject {
            handle,
            size,
            gpu_addr: 0,
            device_index,
            state: ResidencyState::Evictable,
            refcount: 0,
        };
        let mut map = self.inner.lock().expect("bo registry poisoned");
        let prev = map.insert(handle, bo);
        debug_assert!(prev.is_none(), "handle {handle} registered twice");
        log::debug!("registered {handle} size={size}");
    }

    /// Increment the submission reference count
    pub fn retain(&self, handle: BoHandle) -> Result<()> {
        let mut map = self.inner.lock().expect("bo registry poisoned");
        let bo = map.get_mut(&handle).ok_or(Error::InvalidHandle)?;
        bo.refcount += 1;
        Ok(())
    }

    /// Decrement the submission reference count; returns the new count.
    ///
    /// Releasing a zero-count buffer is a refcounting bug elsewhere in the
    /// driver and fails loudly.
    pub fn release(&self, handle: BoHandle) -> Result<u32> {
        let mut map = self.inner.lock().expect("bo registry poisoned");
        let bo = map.get_mut(&handle).ok_or(Error::InvalidHandle)?;
        assert!(bo.refcount > 0, "released {handle} with zero refcount");
        bo.refcount -= 1;
        Ok(bo.refcount)
    }

    /// Current reference count, if registered
    pub fn refcount(&self, handle: BoHandle) -> Option<u32> {
        let map = self.inner.lock().expect("bo registry poisoned");
        map.get(&handle).map(|bo| bo.refcount)
    }

    /// Snapshot of one buffer's record
    pub fn get(&self, handle: BoHandle) -> Option<BufferObject> {
        let map = self.inner.lock().expect("bo registry poisoned");
        map.get(&handle).cloned()
    }

    /// Update residency state
    pub fn set_state(&self, handle: BoHandle, state: ResidencyState) -> Result<()> {
        let mut map = self.inner.lock().expect("bo registry poisoned");
        let bo = map.get_mut(&handle).ok_or(Error::InvalidHandle)?;
        bo.state = state;
        Ok(())
    }

    /// Record the GPU virtual address after a bind
    pub fn set_gpu_addr(&self, handle: BoHandle, gpu_addr: u64) -> Result<()> {
        let mut map = self.inner.lock().expect("bo registry poisoned");
        let bo = map.get_mut(&handle).ok_or(Error::InvalidHandle)?;
        bo.gpu_addr = gpu_addr;
        Ok(())
    }

    /// Remove a buffer record ahead of closing its kernel handle.
    ///
    /// Refuses while submissions still reference the buffer.
    pub fn remove(&self, handle: BoHandle) -> Result<BufferObject> {
        let mut map = self.inner.lock().expect("bo registry poisoned");
        match map.get(&handle) {
            Some(bo) if bo.refcount > 0 => Err(Error::Busy),
            Some(_) => Ok(map.remove(&handle).expect("checked above")),
            None => Err(Error::InvalidHandle),
        }
    }

    /// Number of registered buffers
    pub fn len(&self) -> usize {
        self.inner.lock().expect("bo registry poisoned").len()
    }

    /// True when no buffers are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_release_cycle() {
        let reg = BoRegistry::new();
        let h = BoHandle::new(1);
        reg.register(h, 4096, 0);
        assert_eq!(reg.refcount(h), Some(0));

        reg.retain(h).unwrap();
        reg.retain(h).unwrap();
        assert_eq!(reg.refcount(h), Some(2));

        assert_eq!(reg.release(h).unwrap(), 1);
        assert_eq!(reg.release(h).unwrap(), 0);
    }

    #[test]
    fn remove_refuses_referenced_buffers() {
        let reg = BoRegistry::new();
        let h = BoHandle::new(2);
        reg.register(h, 4096, 0);
        reg.retain(h).unwrap();

        assert_eq!(reg.remove(h).unwrap_err(), Error::Busy);
        reg.release(h).unwrap();
        assert_eq!(reg.remove(h).unwrap().size, 4096);
        assert!(reg.is_empty());
    }

    #[test]
    #[should_panic(expected = "zero refcount")]
    fn release_below_zero_panics() {
        let reg = BoRegistry::new();
        let h = BoHandle::new(3);
        reg.register(h, 64, 0);
        let _ = reg.release(h);
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let reg = BoRegistry::new();
        assert_eq!(
            reg.retain(BoHandle::new(99)).unwrap_err(),
            Error::InvalidHandle
        );
    }
}
