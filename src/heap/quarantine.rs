//! Slab quarantine.
//!
//! Quarantined slabs stay out of the free queue, so a dangling pointer into
//! them keeps hitting memory nobody else owns. `pop` is an eviction
//! primitive: it only hands a slab back once the quarantine holds more than
//! its share of all slabs, so occupancy settles around the configured ratio
//! without eating into spare capacity.

#[cfg(feature = "log")]
use log::warn;

use super::{HeapState, ZebraBlockHeap};
use crate::block::CompactBlockInfo;
use crate::slab::SlabState;
use crate::{AllocError, AllocResult, BlockQuarantine, MemoryNotifier, MetadataAllocator};

impl<N, M, const PAGE_SIZE: usize> ZebraBlockHeap<N, M, PAGE_SIZE>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    pub fn quarantine_ratio(&self) -> f32 {
        self.with_state(|state| state.quarantine_ratio)
    }

    /// Set the share of slabs the quarantine may hold before `pop` evicts.
    ///
    /// `ratio` must lie in `[0, 1]`; anything else is rejected and the
    /// current ratio is kept.
    pub fn set_quarantine_ratio(&self, ratio: f32) -> AllocResult {
        if !(0.0..=1.0).contains(&ratio) {
            warn!("zebra heap: quarantine ratio {} is outside [0, 1]", ratio);
            return Err(AllocError::InvalidParam);
        }
        self.with_state(|state| state.quarantine_ratio = ratio);
        Ok(())
    }

    fn quarantine_within_budget(&self, state: &HeapState) -> bool {
        state.quarantine.is_empty()
            || state.quarantine.len() as f32 / self.region.slab_count() as f32
                <= state.quarantine_ratio
    }

    /// Move the oldest quarantined slab back to `Allocated`.
    fn evict_oldest(state: &mut HeapState) -> Option<CompactBlockInfo> {
        let index = state.quarantine.pop_front()?;
        let info = state.slabs.release_from_quarantine(index).ok();
        debug_assert!(info.is_some(), "slab {} queued but not quarantined", index);

        #[cfg(feature = "tracking")]
        {
            state.counters.quarantine_evictions += 1;
        }
        info
    }
}

impl<N, M, const PAGE_SIZE: usize> BlockQuarantine for ZebraBlockHeap<N, M, PAGE_SIZE>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    fn push(&self, info: &CompactBlockInfo) -> AllocResult {
        self.with_state(|state| {
            let index = self
                .region
                .slab_index(info.block)
                .ok_or(AllocError::NotAllocated)?;
            let entry = *state.slabs.get(index).ok_or(AllocError::NotAllocated)?;
            match entry.state {
                SlabState::Allocated => {}
                SlabState::Quarantined => return Err(AllocError::Quarantined),
                SlabState::Free => return Err(AllocError::NotAllocated),
            }
            if entry.info != *info {
                return Err(AllocError::InfoMismatch);
            }

            state.slabs.mark_quarantined(index)?;
            let queued = state.quarantine.push_back(index);
            debug_assert!(queued, "quarantine queue overflow");

            #[cfg(feature = "tracking")]
            {
                state.counters.quarantine_pushes += 1;
            }
            Ok(())
        })
    }

    fn pop(&self) -> Option<CompactBlockInfo> {
        self.with_state(|state| {
            if self.quarantine_within_budget(state) {
                return None;
            }
            Self::evict_oldest(state)
        })
    }

    fn empty(&self, infos: &mut Vec<CompactBlockInfo>) {
        self.with_state(|state| {
            // Only leave the quarantine; the caller frees the slabs.
            while let Some(info) = Self::evict_oldest(state) {
                infos.push(info);
            }
        })
    }

    fn count(&self) -> usize {
        self.with_state(|state| state.quarantine.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockHeap, NullMemoryNotifier, SystemMetadataAllocator, SystemReservation};

    type TestHeap = ZebraBlockHeap<NullMemoryNotifier>;

    static SYSTEM: SystemReservation = SystemReservation;

    fn heap(slabs: usize) -> TestHeap {
        TestHeap::with_reservation(
            slabs * TestHeap::SLAB_SIZE,
            NullMemoryNotifier,
            SystemMetadataAllocator,
            &SYSTEM,
        )
    }

    fn allocate_info(h: &TestHeap, bytes: usize) -> CompactBlockInfo {
        let ptr = h.allocate(bytes).unwrap().as_ptr() as usize;
        let index = h.slab_index(ptr).unwrap();
        h.slab_entry(index).unwrap().info
    }

    #[test]
    fn test_default_ratio() {
        let h = heap(4);
        assert_eq!(h.quarantine_ratio(), crate::DEFAULT_QUARANTINE_RATIO);
    }

    #[test]
    fn test_set_ratio() {
        let h = heap(4);
        h.set_quarantine_ratio(0.0).unwrap();
        h.set_quarantine_ratio(1.0).unwrap();
        assert_eq!(h.set_quarantine_ratio(1.5), Err(AllocError::InvalidParam));
        assert_eq!(h.set_quarantine_ratio(-0.1), Err(AllocError::InvalidParam));
        assert_eq!(h.set_quarantine_ratio(f32::NAN), Err(AllocError::InvalidParam));
        assert_eq!(h.quarantine_ratio(), 1.0);
    }

    #[test]
    fn test_push_requires_matching_info() {
        let h = heap(2);
        let info = allocate_info(&h, 64);

        let mut wrong = info;
        wrong.block_size = 65;
        assert_eq!(h.push(&wrong), Err(AllocError::InfoMismatch));
        assert_eq!(h.count(), 0);

        h.push(&info).unwrap();
        assert_eq!(h.count(), 1);
        assert_eq!(h.push(&info), Err(AllocError::Quarantined));
        assert_eq!(h.count(), 1);
    }

    #[test]
    fn test_push_rejects_unmanaged() {
        let h = heap(2);
        assert_eq!(
            h.push(&CompactBlockInfo::default()),
            Err(AllocError::NotAllocated)
        );

        // A slab that is free.
        let free_slab = CompactBlockInfo {
            block: h.slab_address(1).unwrap(),
            ..CompactBlockInfo::default()
        };
        assert_eq!(h.push(&free_slab), Err(AllocError::NotAllocated));
        assert_eq!(h.count(), 0);
    }

    #[test]
    fn test_zero_ratio_evicts_everything() {
        let h = heap(4);
        h.set_quarantine_ratio(0.0).unwrap();
        let a = allocate_info(&h, 8);
        let b = allocate_info(&h, 16);
        h.push(&a).unwrap();
        h.push(&b).unwrap();

        assert_eq!(h.pop(), Some(a));
        assert_eq!(h.pop(), Some(b));
        assert_eq!(h.pop(), None);
    }

    #[test]
    fn test_full_ratio_never_evicts() {
        let h = heap(2);
        h.set_quarantine_ratio(1.0).unwrap();
        let a = allocate_info(&h, 8);
        let b = allocate_info(&h, 8);
        h.push(&a).unwrap();
        h.push(&b).unwrap();
        assert_eq!(h.pop(), None);
        assert_eq!(h.count(), 2);
    }

    #[test]
    fn test_popped_slab_is_freeable() {
        let h = heap(1);
        h.set_quarantine_ratio(0.0).unwrap();
        let info = allocate_info(&h, 128);
        h.push(&info).unwrap();

        let popped = h.pop().unwrap();
        assert!(h.is_allocated(popped.block as *const u8));
        h.free(popped.block as *mut u8).unwrap();
        assert_eq!(h.free_slab_count(), 1);
    }
}
