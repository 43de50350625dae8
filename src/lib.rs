//! Zebra Block Heap
//!
//! A page-granular heap used by memory error detectors to catch buffer
//! overflows, underflows and use-after-free on small allocations,
//! featuring:
//! - One large virtual region carved into two-page slabs
//! - Allocations pushed against the end of a slab's even page, so the odd
//!   page acts as a trailing guard
//! - Redzoned block placement negotiated with a layout planner
//! - A FIFO quarantine bounded by an occupancy ratio

use core::alloc::Layout;
use core::ptr::NonNull;
use std::sync::Arc;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;
#[cfg(feature = "log")]
use log::error;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Default page size for heaps that don't pick their own
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// Addressability granularity of the shadow memory. Every allocation start
/// is a multiple of this.
pub const SHADOW_RATIO: usize = 8;

/// Share of the slabs that may sit in quarantine before eviction kicks in.
pub const DEFAULT_QUARANTINE_RATIO: f32 = 0.25;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid `size`, redzone or ratio.
    InvalidParam,
    /// No free slab left.
    NoMemory,
    /// Pointer does not match a live allocation of this heap.
    NotAllocated,
    /// The slab is held by the quarantine and must be popped first.
    Quarantined,
    /// A block descriptor disagrees with the one recorded for its slab.
    InfoMismatch,
    /// The planned layout does not fit a single slab.
    UnsupportedLayout,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Receives notifications about the heap's virtual memory.
pub trait MemoryNotifier {
    /// The region `[address, address + size)` is about to be used as heap.
    fn notify_future_heap_use(&self, address: usize, size: usize);

    /// The region `[address, address + size)` went back to the OS.
    fn notify_returned_to_os(&self, address: usize, size: usize);
}

impl<T: MemoryNotifier + ?Sized> MemoryNotifier for &T {
    fn notify_future_heap_use(&self, address: usize, size: usize) {
        (**self).notify_future_heap_use(address, size)
    }

    fn notify_returned_to_os(&self, address: usize, size: usize) {
        (**self).notify_returned_to_os(address, size)
    }
}

impl<T: MemoryNotifier + ?Sized> MemoryNotifier for Arc<T> {
    fn notify_future_heap_use(&self, address: usize, size: usize) {
        (**self).notify_future_heap_use(address, size)
    }

    fn notify_returned_to_os(&self, address: usize, size: usize) {
        (**self).notify_returned_to_os(address, size)
    }
}

/// Notifier that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMemoryNotifier;

impl MemoryNotifier for NullMemoryNotifier {
    fn notify_future_heap_use(&self, _address: usize, _size: usize) {}

    fn notify_returned_to_os(&self, _address: usize, _size: usize) {}
}

/// General purpose allocator hosting the heap's own bookkeeping, so the heap
/// never allocates its metadata from itself.
pub trait MetadataAllocator {
    /// Allocate memory for `layout`. `layout.size()` is never zero.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Give back memory obtained from [`MetadataAllocator::allocate`].
    ///
    /// # Safety
    /// `ptr` must come from `allocate` on this allocator with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

impl<T: MetadataAllocator + ?Sized> MetadataAllocator for &T {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).deallocate(ptr, layout)
    }
}

impl<T: MetadataAllocator + ?Sized> MetadataAllocator for Arc<T> {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        (**self).allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        (**self).deallocate(ptr, layout)
    }
}

/// OS primitive reserving and committing contiguous virtual memory.
pub trait VmReservation: Sync {
    /// Reserve and commit `size` bytes aligned to `align` at an address of
    /// the implementation's choosing. The memory is readable and writable.
    fn reserve(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Release a whole reservation. Returns `false` if the OS refused.
    ///
    /// # Safety
    /// `base`, `size` and `align` must match a previous successful
    /// [`VmReservation::reserve`], and nothing may touch the region after.
    unsafe fn release(&self, base: NonNull<u8>, size: usize, align: usize) -> bool;
}

/// Capabilities a heap advertises to the detector driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeapFeatures(u32);

impl HeapFeatures {
    /// `is_allocated` gives exact answers.
    pub const SUPPORTS_IS_ALLOCATED: Self = Self(1 << 0);
    /// The heap reserves its memory and reports it through a notifier.
    pub const REPORTS_RESERVATIONS: Self = Self(1 << 1);
    /// `allocation_size` gives exact answers.
    pub const SUPPORTS_GET_ALLOCATION_SIZE: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for HeapFeatures {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// A heap handing out raw allocations and redzoned blocks.
///
/// Every method takes the heap lock internally. `lock`, `unlock` and
/// `try_lock` expose that same (re-entrant) lock so a caller can make a
/// sequence of calls atomic.
pub trait BlockHeap {
    /// Capabilities of this heap.
    fn features(&self) -> HeapFeatures;

    /// Allocate `bytes` of raw memory.
    fn allocate(&self, bytes: usize) -> AllocResult<NonNull<u8>>;

    /// Free an allocation. Freeing null succeeds and does nothing.
    fn free(&self, ptr: *mut u8) -> AllocResult;

    /// Whether `ptr` is exactly the start of a live allocation.
    fn is_allocated(&self, ptr: *const u8) -> bool;

    /// Size of the live allocation starting exactly at `ptr`, or `None`
    /// when it is unknown.
    fn allocation_size(&self, ptr: *const u8) -> Option<usize>;

    /// Acquire the heap lock. Re-entrant.
    fn lock(&self);

    /// Release one level of a lock taken with `lock` or `try_lock`.
    fn unlock(&self);

    /// Try to acquire the heap lock without blocking.
    fn try_lock(&self) -> bool;

    /// Allocate a redzoned block with a body of `size` bytes.
    fn allocate_block(
        &self,
        size: usize,
        min_left_redzone_size: usize,
        min_right_redzone_size: usize,
    ) -> AllocResult<block::BlockInfo>;

    /// Free a block obtained from [`BlockHeap::allocate_block`].
    fn free_block(&self, block: &block::BlockInfo) -> AllocResult;
}

/// A quarantine of freed blocks waiting to be recycled.
pub trait BlockQuarantine {
    /// Put a block in quarantine.
    fn push(&self, info: &block::CompactBlockInfo) -> AllocResult;

    /// Evict the oldest block if the quarantine is over budget.
    fn pop(&self) -> Option<block::CompactBlockInfo>;

    /// Evict everything, oldest first, appending to `infos`.
    fn empty(&self, infos: &mut Vec<block::CompactBlockInfo>);

    /// Number of quarantined blocks.
    fn count(&self) -> usize;
}

#[cold]
#[inline(never)]
pub(crate) fn fatal(msg: core::fmt::Arguments<'_>) -> ! {
    error!("{}", msg);
    panic!("{}", msg)
}

#[inline]
pub(crate) const fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

#[inline]
pub(crate) const fn align_up(pos: usize, align: usize) -> usize {
    (pos + align - 1) & !(align - 1)
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
pub(crate) const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod block;
pub use block::{BlockInfo, BlockLayout, BlockLayoutPlanner, CompactBlockInfo, RedzoneLayoutPlanner};

pub mod heap;
#[cfg(feature = "tracking")]
pub use heap::OpCounters;
pub use heap::{SlabStats, ZebraBlockHeap};

pub mod meta;
pub use meta::SystemMetadataAllocator;

pub mod region;
#[cfg(unix)]
pub use region::MmapReservation;
pub use region::{HeapRegion, SystemReservation};

pub mod slab;
pub use slab::{SlabEntry, SlabState};
