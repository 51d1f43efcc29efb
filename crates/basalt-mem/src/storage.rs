//! # Allocation Lifecycle Storage
//!
//! Deferred free/reuse lists keyed by the fence value that must complete
//! before an allocation may be reclaimed.
//!
//! Entries are partitioned by usage kind: one-shot temporaries are handed
//! to the close worker once their fence signals, while reusable allocations
//! move into a pool that is consulted before the kernel is asked for a new
//! buffer.
//!
//! Lifecycle misuse (double deferral, reclaiming with an out-of-order
//! fence) indicates a broken invariant elsewhere in the driver and panics
//! rather than returning an error.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use basalt_core::{BoHandle, EngineClass, FenceValue, ENGINE_COUNT};

// =============================================================================
// USAGE KIND
// =============================================================================

/// How a deferred allocation is disposed of once its fence signals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// One-shot temporary: close the kernel handle
    Temporary,
    /// Reusable scratch: return to the allocation pool
    Reusable,
}

// =============================================================================
// DEFERRED ENTRY
// =============================================================================

/// One deferred free, eligible for reclamation once the tracked engine's
/// observed fence reaches `required_fence`.
#[derive(Debug, Clone, Copy)]
struct DeferredEntry {
    handle: BoHandle,
    size: u64,
    required_fence: FenceValue,
    usage: UsageKind,
}

/// A completed reusable allocation waiting in the pool
#[derive(Debug, Clone, Copy)]
struct PoolEntry {
    handle: BoHandle,
    size: u64,
}

#[derive(Debug, Default)]
struct EngineLists {
    deferred: VecDeque<DeferredEntry>,
    last_observed: FenceValue,
}

#[derive(Debug, Default)]
struct State {
    engines: Vec<EngineLists>,
    pool: Vec<PoolEntry>,
    // Every handle with a live deferred entry; an allocation appears in at
    // most one entry at a time.
    in_flight: HashSet<BoHandle>,
}

// =============================================================================
// ALLOCATION STORAGE
// =============================================================================

/// Deferred free/reuse storage for one device.
///
/// Deferred lists are single-writer per engine (the orchestrator owning
/// that engine's submissions) with the reclamation path as a separate
/// reader; one lock covers both.
#[derive(Debug)]
pub struct AllocationStorage {
    inner: Mutex<State>,
}

impl AllocationStorage {
    /// Create empty storage
    pub fn new() -> Self {
        let mut engines = Vec::with_capacity(ENGINE_COUNT);
        engines.resize_with(ENGINE_COUNT, EngineLists::default);
        Self {
            inner: Mutex::new(State {
                engines,
                pool: Vec::new(),
                in_flight: HashSet::new(),
            }),
        }
    }

    /// Defer an allocation until `engine` reaches `required_fence`.
    ///
    /// Panics on double deferral: re-deferring an allocation before its
    /// prior entry clears is a usage error.
    pub fn defer_free(
        &self,
        handle: BoHandle,
        size: u64,
        engine: EngineClass,
        required_fence: FenceValue,
        usage: UsageKind,
    ) {
        let mut state = self.inner.lock().expect("allocation storage poisoned");
        assert!(
            state.in_flight.insert(handle),
            "{handle} deferred twice before reclamation"
        );
        state.engines[engine.index()].deferred.push_back(DeferredEntry {
            handle,
            size,
            required_fence,
            usage,
        });
        log::trace!("deferred {handle} on {engine} until fence {required_fence}");
    }

    /// Collect allocations whose fence has completed.
    ///
    /// Temporaries are returned for closing; reusable entries move into the
    /// pool. Idempotent: a second call with the same observed fence returns
    /// an empty list. Observed fences must be non-decreasing per engine;
    /// regression panics.
    pub fn reclaim_completed(
        &self,
        engine: EngineClass,
        observed_fence: FenceValue,
    ) -> Vec<BoHandle> {
        let mut state = self.inner.lock().expect("allocation storage poisoned");
        let lists = &mut state.engines[engine.index()];
        assert!(
            observed_fence >= lists.last_observed,
            "fence regression on {engine}: {observed_fence} < {}",
            lists.last_observed
        );
        lists.last_observed = observed_fence;

        let mut reclaimable = Vec::new();
        let mut keep = VecDeque::with_capacity(lists.deferred.len());
        let mut pooled = Vec::new();
        while let Some(entry) = lists.deferred.pop_front() {
            if entry.required_fence <= observed_fence {
                match entry.usage {
                    UsageKind::Temporary => reclaimable.push(entry.handle),
                    UsageKind::Reusable => pooled.push(PoolEntry {
                        handle: entry.handle,
                        size: entry.size,
                    }),
                }
            } else {
                keep.push_back(entry);
            }
        }
        state.engines[engine.index()].deferred = keep;
        for entry in &pooled {
            state.in_flight.remove(&entry.handle);
        }
        for handle in &reclaimable {
            state.in_flight.remove(handle);
        }
        state.pool.extend(pooled);
        reclaimable
    }

    /// Serve a pending allocation request from the reuse pool.
    ///
    /// First fit on size; only completed reusable entries live in the pool,
    /// so anything returned is safe to hand out immediately.
    pub fn take_reusable(&self, min_size: u64) -> Option<BoHandle> {
        let mut state = self.inner.lock().expect("allocation storage poisoned");
        let slot = state.pool.iter().position(|e| e.size >= min_size)?;
        let entry = state.pool.swap_remove(slot);
        log::trace!("reused {} ({} bytes) from pool", entry.handle, entry.size);
        Some(entry.handle)
    }

    /// Number of entries still waiting on fences, across all engines
    pub fn pending_count(&self) -> usize {
        let state = self.inner.lock().expect("allocation storage poisoned");
        state.engines.iter().map(|e| e.deferred.len()).sum()
    }

    /// Number of reusable allocations currently pooled
    pub fn pool_count(&self) -> usize {
        self.inner
            .lock()
            .expect("allocation storage poisoned")
            .pool
            .len()
    }
}

impl Default for AllocationStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENGINE: EngineClass = EngineClass::Render;

    #[test]
    fn reclaim_respects_required_fence() {
        let storage = AllocationStorage::new();
        let h = BoHandle::new(1);
        storage.defer_free(h, 4096, ENGINE, 5, UsageKind::Temporary);

        // Safety: nothing reclaimable before the fence
        assert!(storage.reclaim_completed(ENGINE, 4).is_empty());
        // Liveness: reclaimable exactly once the fence is reached
        assert_eq!(storage.reclaim_completed(ENGINE, 5), vec![h]);
    }

    #[test]
    fn reclaim_is_idempotent() {
        let storage = AllocationStorage::new();
        storage.defer_free(BoHandle::new(1), 64, ENGINE, 3, UsageKind::Temporary);

        assert_eq!(storage.reclaim_completed(ENGINE, 3).len(), 1);
        assert!(storage.reclaim_completed(ENGINE, 3).is_empty());
    }

    #[test]
    fn reusable_entries_feed_the_pool() {
        let storage = AllocationStorage::new();
        let h = BoHandle::new(2);
        storage.defer_free(h, 8192, ENGINE, 1, UsageKind::Reusable);

        // Not served while the GPU may still use it
        assert!(storage.take_reusable(4096).is_none());

        assert!(storage.reclaim_completed(ENGINE, 1).is_empty());
        assert_eq!(storage.pool_count(), 1);

        // Too small for this request, matches the next
        assert!(storage.take_reusable(16384).is_none());
        assert_eq!(storage.take_reusable(4096), Some(h));
        assert_eq!(storage.pool_count(), 0);
    }

    #[test]
    fn reuse_then_redefer_is_allowed() {
        let storage = AllocationStorage::new();
        let h = BoHandle::new(3);
        storage.defer_free(h, 64, ENGINE, 1, UsageKind::Reusable);
        storage.reclaim_completed(ENGINE, 1);
        storage.take_reusable(64).unwrap();

        // Prior entry cleared; a second deferral is legal
        storage.defer_free(h, 64, ENGINE, 2, UsageKind::Temporary);
        assert_eq!(storage.reclaim_completed(ENGINE, 2), vec![h]);
    }

    #[test]
    #[should_panic(expected = "deferred twice")]
    fn double_deferral_panics() {
        let storage = AllocationStorage::new();
        let h = BoHandle::new(4);
        storage.defer_free(h, 64, ENGINE, 1, UsageKind::Temporary);
        storage.defer_free(h, 64, ENGINE, 2, UsageKind::Temporary);
    }

    #[test]
    #[should_panic(expected = "fence regression")]
    fn fence_regression_panics() {
        let storage = AllocationStorage::new();
        storage.reclaim_completed(ENGINE, 10);
        storage.reclaim_completed(ENGINE, 9);
    }

    #[test]
    fn engines_are_independent() {
        let storage = AllocationStorage::new();
        storage.defer_free(BoHandle::new(5), 64, EngineClass::Render, 5, UsageKind::Temporary);
        storage.defer_free(BoHandle::new(6), 64, EngineClass::Copy, 2, UsageKind::Temporary);

        assert_eq!(
            storage.reclaim_completed(EngineClass::Copy, 2),
            vec![BoHandle::new(6)]
        );
        assert!(storage.reclaim_completed(EngineClass::Render, 4).is_empty());
        assert_eq!(storage.pending_count(), 1);
    }
}
