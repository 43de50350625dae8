//! Heap statistics.

use super::ZebraBlockHeap;
use crate::slab::SlabState;
use crate::{MemoryNotifier, MetadataAllocator};

/// Cumulative operation counters.
#[cfg(feature = "tracking")]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpCounters {
    pub allocations: u64,
    pub frees: u64,
    pub quarantine_pushes: u64,
    pub quarantine_evictions: u64,
}

/// Slab occupancy at one point in time.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlabStats {
    pub slab_count: usize,
    pub free_slabs: usize,
    pub allocated_slabs: usize,
    pub quarantined_slabs: usize,
    #[cfg(feature = "tracking")]
    pub counters: OpCounters,
}

impl<N, M, const PAGE_SIZE: usize> ZebraBlockHeap<N, M, PAGE_SIZE>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    /// Snapshot of slab occupancy, taken under the heap lock.
    pub fn stats(&self) -> SlabStats {
        let slab_count = self.slab_count();
        self.with_state(|state| {
            let free_slabs = state.free_slabs.len();
            let quarantined_slabs = state.quarantine.len();
            SlabStats {
                slab_count,
                free_slabs,
                allocated_slabs: state.slabs.count_in(SlabState::Allocated),
                quarantined_slabs,
                #[cfg(feature = "tracking")]
                counters: state.counters,
            }
        })
    }
}
