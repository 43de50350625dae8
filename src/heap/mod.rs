//! The zebra block heap.
//!
//! Memory is one reserved region cut into two-page slabs. Each allocation
//! owns a whole slab and is pushed against the end of the slab's first
//! ("even") page, so the second ("odd") page trails it as a guard and the
//! unused head of the even page sits in front of it:
//!
//! ```text
//! | even page                 | odd page                  |
//! | ......unused......[alloc] | .......................... |
//! ```
//!
//! All state sits behind one re-entrant lock. `lock`/`unlock`/`try_lock`
//! expose it so an outer allocator can chain calls atomically.

mod block;
mod quarantine;
mod stats;

#[cfg(feature = "tracking")]
pub use stats::OpCounters;
pub use stats::SlabStats;

use core::cell::RefCell;
use core::ptr::NonNull;

use parking_lot::ReentrantMutex;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::block::{BlockInfo, CompactBlockInfo, RedzoneLayoutPlanner, BLOCK_HEADER_SIZE};
use crate::region::{default_reservation, HeapRegion};
use crate::slab::{IndexQueue, SlabEntry, SlabState, SlabTable};
use crate::{
    align_down, align_up, fatal, AllocError, AllocResult, BlockHeap, HeapFeatures, MemoryNotifier,
    MetadataAllocator, SystemMetadataAllocator, VmReservation, DEFAULT_QUARANTINE_RATIO,
    SHADOW_RATIO,
};

/// Everything the heap lock guards.
pub(crate) struct HeapState {
    slabs: SlabTable,
    free_slabs: IndexQueue,
    quarantine: IndexQueue,
    quarantine_ratio: f32,
    #[cfg(feature = "tracking")]
    counters: OpCounters,
}

/// Two-page slab heap with a ratio-bounded quarantine.
///
/// - `N` is told when the region becomes heap and when it goes back to the OS
/// - `M` hosts the slab table and both index queues
/// - `PAGE_SIZE` sets the slab geometry; a slab is two pages
pub struct ZebraBlockHeap<N, M = SystemMetadataAllocator, const PAGE_SIZE: usize = { crate::DEFAULT_PAGE_SIZE }>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    region: HeapRegion,
    state: ReentrantMutex<RefCell<HeapState>>,
    notifier: N,
    metadata: M,
}

impl<N, M, const PAGE_SIZE: usize> ZebraBlockHeap<N, M, PAGE_SIZE>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    /// Bytes in one slab.
    pub const SLAB_SIZE: usize = 2 * PAGE_SIZE;

    /// Largest request `allocate` accepts.
    pub const MAX_ALLOCATION_SIZE: usize = PAGE_SIZE;

    /// Largest body `allocate_block` can host next to a block header.
    pub const MAX_BLOCK_ALLOCATION_SIZE: usize = PAGE_SIZE - BLOCK_HEADER_SIZE;

    const GEOMETRY_CHECK: () = assert!(
        PAGE_SIZE.is_power_of_two()
            && PAGE_SIZE % SHADOW_RATIO == 0
            && PAGE_SIZE > BLOCK_HEADER_SIZE,
        "PAGE_SIZE must be a power of two, a multiple of SHADOW_RATIO and larger than a block header"
    );

    /// Create a heap of at least `heap_size` bytes, reserved with
    /// [`default_reservation`].
    ///
    /// # Panics
    /// If `heap_size` is zero, or the region or the bookkeeping cannot be
    /// allocated.
    pub fn new(heap_size: usize, notifier: N, metadata: M) -> Self {
        Self::with_reservation(heap_size, notifier, metadata, default_reservation())
    }

    /// Like [`ZebraBlockHeap::new`], reserving the region through
    /// `reservation`.
    pub fn with_reservation(
        heap_size: usize,
        notifier: N,
        metadata: M,
        reservation: &'static dyn VmReservation,
    ) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::GEOMETRY_CHECK;

        // Round up so the region never ends in a partial slab.
        let heap_size = match heap_size.checked_add(Self::SLAB_SIZE - 1) {
            Some(_) if heap_size != 0 => align_up(heap_size, Self::SLAB_SIZE),
            _ => fatal(format_args!("zebra heap: invalid heap size {:#x}", heap_size)),
        };
        let slab_count = heap_size / Self::SLAB_SIZE;

        if PAGE_SIZE < page_size::get() {
            warn!(
                "zebra heap: page size {:#x} is below the OS page {:#x}",
                PAGE_SIZE,
                page_size::get()
            );
        }

        let (Some(slabs), Some(mut free_slabs), Some(quarantine)) = (
            SlabTable::new_in(slab_count, &metadata),
            IndexQueue::new_in(slab_count, &metadata),
            IndexQueue::new_in(slab_count, &metadata),
        ) else {
            fatal(format_args!(
                "zebra heap: no metadata memory for {} slabs",
                slab_count
            ));
        };
        for index in 0..slab_count {
            free_slabs.push_back(index);
        }

        let region = HeapRegion::reserve(reservation, heap_size, Self::SLAB_SIZE, PAGE_SIZE);
        notifier.notify_future_heap_use(region.base(), region.size());

        Self {
            region,
            state: ReentrantMutex::new(RefCell::new(HeapState {
                slabs,
                free_slabs,
                quarantine,
                quarantine_ratio: DEFAULT_QUARANTINE_RATIO,
                #[cfg(feature = "tracking")]
                counters: OpCounters::default(),
            })),
            notifier,
            metadata,
        }
    }

    /// Size of the region, a multiple of [`Self::SLAB_SIZE`].
    pub fn heap_size(&self) -> usize {
        self.region.size()
    }

    pub fn heap_address(&self) -> usize {
        self.region.base()
    }

    pub fn slab_count(&self) -> usize {
        self.region.slab_count()
    }

    /// Base address of slab `index`.
    pub fn slab_address(&self, index: usize) -> Option<usize> {
        self.region.slab_address(index)
    }

    /// Index of the slab holding `addr`.
    pub fn slab_index(&self, addr: usize) -> Option<usize> {
        self.region.slab_index(addr)
    }

    /// Snapshot of the metadata of slab `index`.
    pub fn slab_entry(&self, index: usize) -> Option<SlabEntry> {
        self.with_state(|state| state.slabs.get(index).copied())
    }

    pub fn free_slab_count(&self) -> usize {
        self.with_state(|state| state.free_slabs.len())
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut HeapState) -> R) -> R {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        f(&mut state)
    }

    /// Take the oldest free slab and place `bytes` against the end of its
    /// even page. Returns the slab index and the allocation address.
    fn allocate_in(&self, state: &mut HeapState, bytes: usize) -> AllocResult<(usize, usize)> {
        debug_assert!(bytes != 0 && bytes <= PAGE_SIZE);

        let Some(index) = state.free_slabs.front() else {
            debug!("zebra heap: out of slabs");
            return Err(AllocError::NoMemory);
        };
        let slab = self
            .region
            .slab_address(index)
            .ok_or(AllocError::NoMemory)?;

        let block = align_down(slab + PAGE_SIZE - bytes, SHADOW_RATIO);
        state.slabs.mark_allocated(
            index,
            CompactBlockInfo {
                block,
                block_size: bytes,
                header_size: 0,
                trailer_size: 0,
                is_nested: false,
            },
        )?;
        state.free_slabs.pop_front();

        #[cfg(feature = "tracking")]
        {
            state.counters.allocations += 1;
        }
        Ok((index, block))
    }

    fn free_in(&self, state: &mut HeapState, addr: usize) -> AllocResult {
        let index = self.region.slab_index(addr).ok_or(AllocError::NotAllocated)?;
        let entry = *state.slabs.get(index).ok_or(AllocError::NotAllocated)?;

        match entry.state {
            SlabState::Free => {
                warn!("zebra heap: free of {:#x} in free slab {}", addr, index);
                return Err(AllocError::NotAllocated);
            }
            _ if entry.info.block != addr => {
                debug!(
                    "zebra heap: free of {:#x} does not match block {:#x}",
                    addr, entry.info.block
                );
                return Err(AllocError::NotAllocated);
            }
            SlabState::Quarantined => {
                warn!(
                    "zebra heap: free of quarantined block {:#x}, pop it first",
                    addr
                );
                return Err(AllocError::Quarantined);
            }
            SlabState::Allocated => {}
        }

        state.slabs.mark_free(index)?;
        let queued = state.free_slabs.push_back(index);
        debug_assert!(queued, "free slab queue overflow");

        #[cfg(feature = "tracking")]
        {
            state.counters.frees += 1;
        }
        Ok(())
    }

    /// The entry of the `Allocated` slab whose block starts exactly at `addr`.
    fn live_entry(&self, state: &HeapState, addr: usize) -> Option<SlabEntry> {
        let index = self.region.slab_index(addr)?;
        let entry = *state.slabs.get(index)?;
        (entry.state == SlabState::Allocated && entry.info.block == addr).then_some(entry)
    }
}

impl<N, M, const PAGE_SIZE: usize> BlockHeap for ZebraBlockHeap<N, M, PAGE_SIZE>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    fn features(&self) -> HeapFeatures {
        HeapFeatures::SUPPORTS_IS_ALLOCATED
            | HeapFeatures::REPORTS_RESERVATIONS
            | HeapFeatures::SUPPORTS_GET_ALLOCATION_SIZE
    }

    fn allocate(&self, bytes: usize) -> AllocResult<NonNull<u8>> {
        if bytes == 0 || bytes > PAGE_SIZE {
            debug!("zebra heap: cannot host an allocation of {} bytes", bytes);
            return Err(AllocError::InvalidParam);
        }
        let (_, block) = self.with_state(|state| self.allocate_in(state, bytes))?;
        NonNull::new(block as *mut u8).ok_or(AllocError::NoMemory)
    }

    fn free(&self, ptr: *mut u8) -> AllocResult {
        if ptr.is_null() {
            return Ok(());
        }
        self.with_state(|state| self.free_in(state, ptr as usize))
    }

    fn is_allocated(&self, ptr: *const u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        self.with_state(|state| self.live_entry(state, ptr as usize))
            .is_some()
    }

    fn allocation_size(&self, ptr: *const u8) -> Option<usize> {
        if ptr.is_null() {
            return None;
        }
        self.with_state(|state| self.live_entry(state, ptr as usize))
            .map(|entry| entry.info.block_size)
    }

    fn lock(&self) {
        core::mem::forget(self.state.lock());
    }

    fn unlock(&self) {
        if !self.state.is_owned_by_current_thread() {
            warn!("zebra heap: unlock from a thread that does not hold the lock");
            return;
        }
        // SAFETY: this thread holds the lock, and the level being released
        // was taken by `lock`/`try_lock`: guards taken inside heap methods
        // never outlive the call.
        unsafe { self.state.force_unlock() }
    }

    fn try_lock(&self) -> bool {
        match self.state.try_lock() {
            Some(guard) => {
                core::mem::forget(guard);
                true
            }
            None => false,
        }
    }

    fn allocate_block(
        &self,
        size: usize,
        min_left_redzone_size: usize,
        min_right_redzone_size: usize,
    ) -> AllocResult<BlockInfo> {
        self.allocate_block_with(
            &RedzoneLayoutPlanner,
            size,
            min_left_redzone_size,
            min_right_redzone_size,
        )
    }

    fn free_block(&self, block: &BlockInfo) -> AllocResult {
        self.free(block.block().as_ptr())
    }
}

impl<N, M, const PAGE_SIZE: usize> Drop for ZebraBlockHeap<N, M, PAGE_SIZE>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    fn drop(&mut self) {
        let state = self.state.get_mut().get_mut();
        // SAFETY: all three were created from `self.metadata`, and the heap
        // is gone after this.
        unsafe {
            state.slabs.free_in(&self.metadata);
            state.free_slabs.free_in(&self.metadata);
            state.quarantine.free_in(&self.metadata);
        }

        // Outstanding allocations die with the region; that is on the caller.
        // SAFETY: nothing in the heap touches the region after this.
        unsafe { self.region.release() };
        self.notifier
            .notify_returned_to_os(self.region.base(), self.region.size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockQuarantine, NullMemoryNotifier, SystemReservation};

    const PAGE: usize = 0x1000;
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

    #[test]
    fn test_rounds_up_to_slabs() {
        let h = TestHeap::with_reservation(
            3 * PAGE,
            NullMemoryNotifier,
            SystemMetadataAllocator,
            &SYSTEM,
        );
        assert_eq!(h.heap_size(), 4 * PAGE);
        assert_eq!(h.slab_count(), 2);
        assert_eq!(h.free_slab_count(), 2);
    }

    #[test]
    #[should_panic(expected = "invalid heap size")]
    fn test_zero_size_is_fatal() {
        heap(0);
    }

    #[test]
    fn test_placement() {
        let h = heap(2);
        let base = h.heap_address();

        let p = h.allocate(100).unwrap().as_ptr() as usize;
        // 4096 - 100 = 3996, rounded down to 3992.
        assert_eq!(p, base + 3992);
        assert_eq!(h.allocation_size(p as *const u8), Some(100));

        let q = h.allocate(PAGE).unwrap().as_ptr() as usize;
        assert_eq!(q, base + TestHeap::SLAB_SIZE);
    }

    #[test]
    fn test_free_slabs_reused_in_fifo_order() {
        let h = heap(3);
        let a = h.allocate(8).unwrap().as_ptr();
        let b = h.allocate(8).unwrap().as_ptr();
        h.free(b).unwrap();
        h.free(a).unwrap();

        // Slab 2 was never used and is first in line.
        let c = h.allocate(8).unwrap().as_ptr() as usize;
        assert_eq!(h.slab_index(c), Some(2));
        let d = h.allocate(8).unwrap().as_ptr() as usize;
        assert_eq!(h.slab_index(d), Some(1));
        let e = h.allocate(8).unwrap().as_ptr() as usize;
        assert_eq!(h.slab_index(e), Some(0));
    }

    #[test]
    fn test_free_reports_reason() {
        let h = heap(2);
        let p = h.allocate(16).unwrap().as_ptr();

        assert_eq!(
            h.free(unsafe { p.add(8) }),
            Err(AllocError::NotAllocated)
        );
        h.push(&h.slab_entry(0).unwrap().info).unwrap();
        assert_eq!(h.free(p), Err(AllocError::Quarantined));
        assert_eq!(h.slab_entry(0).unwrap().state, SlabState::Quarantined);

        let mut drained = Vec::new();
        h.empty(&mut drained);
        h.free(p).unwrap();
        assert_eq!(h.free(p), Err(AllocError::NotAllocated));
    }

    #[test]
    fn test_reentrant_lock() {
        let h = heap(2);
        h.lock();
        assert!(h.try_lock());
        let p = h.allocate(32).unwrap();
        assert!(h.is_allocated(p.as_ptr()));
        h.unlock();
        h.unlock();

        // Fully released: another thread can take it.
        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(h.try_lock());
                h.unlock();
            });
        });
    }

    #[test]
    fn test_try_lock_contended() {
        let h = heap(1);
        h.lock();
        std::thread::scope(|s| {
            s.spawn(|| assert!(!h.try_lock()));
        });
        h.unlock();
    }

    #[test]
    fn test_unlock_without_lock_is_ignored() {
        let h = heap(1);
        h.unlock();
        assert!(h.allocate(1).is_ok());
    }

    #[test]
    fn test_features() {
        let h = heap(1);
        let features = h.features();
        assert!(features.contains(HeapFeatures::SUPPORTS_IS_ALLOCATED));
        assert!(features.contains(HeapFeatures::REPORTS_RESERVATIONS));
        assert!(features.contains(HeapFeatures::SUPPORTS_GET_ALLOCATION_SIZE));
    }

    #[test]
    fn test_constants() {
        assert_eq!(TestHeap::SLAB_SIZE, 2 * PAGE);
        assert_eq!(TestHeap::MAX_ALLOCATION_SIZE, PAGE);
        assert_eq!(TestHeap::MAX_BLOCK_ALLOCATION_SIZE, PAGE - BLOCK_HEADER_SIZE);
        assert_eq!(ZebraBlockHeap::<NullMemoryNotifier, SystemMetadataAllocator, 0x4000>::SLAB_SIZE, 0x8000);
    }
}
