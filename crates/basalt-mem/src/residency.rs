//! # Residency Sets
//!
//! Per-submission residency tracking. A residency set is private to the
//! thread assembling its submission and is consumed when the submission is
//! flushed; it never outlives the submission that created it.
//!
//! The kernel-facing exec list is deterministic: stable first-insertion
//! order, duplicates collapsed with their access flags unioned. Repeated
//! identical submissions therefore produce byte-identical kernel requests,
//! which record/replay testing depends on.

use std::collections::HashMap;

use basalt_core::{BoHandle, Result};
use basalt_uapi::req::{ExecObject, EXEC_OBJECT_READ, EXEC_OBJECT_WRITE};

use crate::bo::BoRegistry;

// =============================================================================
// ACCESS FLAGS
// =============================================================================

bitflags::bitflags! {
    /// How a submission accesses a buffer
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BoAccess: u32 {
        /// Buffer is read by the GPU
        const READ = 1 << 0;
        /// Buffer is written by the GPU
        const WRITE = 1 << 1;
    }
}

impl BoAccess {
    fn to_exec_flags(self) -> u32 {
        let mut flags = 0;
        if self.contains(BoAccess::READ) {
            flags |= EXEC_OBJECT_READ;
        }
        if self.contains(BoAccess::WRITE) {
            flags |= EXEC_OBJECT_WRITE;
        }
        flags
    }
}

// =============================================================================
// RESIDENCY SET
// =============================================================================

/// One entry of a residency set: a buffer and the union of accesses
/// requested for it in this submission.
#[derive(Debug, Clone, Copy)]
struct ResidencyEntry {
    handle: BoHandle,
    access: BoAccess,
    gpu_addr: u64,
}

/// The set of buffers one submission requires resident.
///
/// Adding a buffer retains it in the registry; the orchestrator releases
/// the reference once the submission's fence has been recorded.
#[derive(Debug, Default)]
pub struct ResidencySet {
    entries: Vec<ResidencyEntry>,
    index: HashMap<BoHandle, usize>,
}

impl ResidencySet {
    /// Create an empty residency set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer with the given access, deduplicating repeats.
    ///
    /// A buffer referenced as both source and destination appears once in
    /// the exec list with combined flags. Each distinct buffer is retained
    /// exactly once regardless of how many times it is added.
    pub fn add(&mut self, registry: &BoRegistry, handle: BoHandle, access: BoAccess) -> Result<()> {
        if let Some(&slot) = self.index.get(&handle) {
            self.entries[slot].access |= access;
            return Ok(());
        }
        registry.retain(handle)?;
        let gpu_addr = registry.get(handle).map(|bo| bo.gpu_addr).unwrap_or(0);
        self.index.insert(handle, self.entries.len());
        self.entries.push(ResidencyEntry {
            handle,
            access,
            gpu_addr,
        });
        Ok(())
    }

    /// Number of distinct buffers in the set
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the set is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct handles in insertion order
    pub fn handles(&self) -> impl Iterator<Item = BoHandle> + '_ {
        self.entries.iter().map(|e| e.handle)
    }

    /// Access union recorded for a handle
    pub fn access(&self, handle: BoHandle) -> Option<BoAccess> {
        self.index.get(&handle).map(|&i| self.entries[i].access)
    }

    /// Build the ordered kernel-facing exec list.
    ///
    /// Ordering is the stable insertion order of first references; flags are
    /// the union of all accesses requested for each buffer.
    pub fn build_exec_list(&self) -> Vec<ExecObject> {
        self.entries
            .iter()
            .map(|e| ExecObject {
                handle: e.handle.raw(),
                flags: e.access.to_exec_flags(),
                offset: e.gpu_addr,
            })
            .collect()
    }
}
