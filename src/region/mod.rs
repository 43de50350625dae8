//! The heap's reserved region and its slab geometry.
//!
//! Slabs are fixed-size and contiguous, so an address maps to its slab by a
//! single division; there is no search structure.

pub mod reservation;

#[cfg(unix)]
pub use reservation::MmapReservation;
pub use reservation::{default_reservation, SystemReservation};

use core::fmt;
use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::info;

use crate::{fatal, is_aligned, VmReservation};

/// A contiguous reservation split into equal slabs.
///
/// The region is released only through [`HeapRegion::release`]; dropping it
/// without releasing leaks the reservation.
pub struct HeapRegion {
    base: NonNull<u8>,
    size: usize,
    slab_size: usize,
    page_size: usize,
    reservation: &'static dyn VmReservation,
    released: bool,
}

// SAFETY: the region is plain memory owned by whoever holds the HeapRegion;
// the reservation backend is Sync.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Reserve `size` bytes, page-aligned, split into `slab_size` slabs.
    ///
    /// # Panics
    /// If the reservation fails or comes back misaligned; the heap cannot
    /// work without its region.
    pub fn reserve(
        reservation: &'static dyn VmReservation,
        size: usize,
        slab_size: usize,
        page_size: usize,
    ) -> Self {
        debug_assert!(page_size.is_power_of_two());
        debug_assert!(slab_size != 0 && size % slab_size == 0);

        let Some(base) = reservation.reserve(size, page_size) else {
            fatal(format_args!(
                "zebra heap: failed to reserve {:#x} bytes of virtual memory",
                size
            ));
        };
        if !is_aligned(base.as_ptr() as usize, page_size) {
            fatal(format_args!(
                "zebra heap: reservation at {:p} is not aligned to {:#x}",
                base.as_ptr(),
                page_size
            ));
        }

        info!(
            "zebra heap: reserved [{:#x}, {:#x}) as {} slabs",
            base.as_ptr() as usize,
            base.as_ptr() as usize + size,
            size / slab_size
        );

        Self {
            base,
            size,
            slab_size,
            page_size,
            reservation,
            released: false,
        }
    }

    /// Give the whole region back to the OS in one call.
    ///
    /// # Panics
    /// If the OS refuses.
    ///
    /// # Safety
    /// Nothing may touch memory inside the region afterwards.
    pub unsafe fn release(&mut self) {
        if self.released {
            return;
        }
        if !self.reservation.release(self.base, self.size, self.page_size) {
            fatal(format_args!(
                "zebra heap: failed to release region at {:p}",
                self.base.as_ptr()
            ));
        }
        self.released = true;
        info!(
            "zebra heap: released {:#x} bytes at {:#x}",
            self.size,
            self.base()
        );
    }

    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn slab_count(&self) -> usize {
        self.size / self.slab_size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr - self.base() < self.size
    }

    /// Index of the slab holding `addr`, or `None` outside the region.
    pub fn slab_index(&self, addr: usize) -> Option<usize> {
        if !self.contains(addr) {
            return None;
        }
        Some((addr - self.base()) / self.slab_size)
    }

    /// Base address of slab `index`, or `None` past the last slab.
    pub fn slab_address(&self, index: usize) -> Option<usize> {
        if index >= self.slab_count() {
            return None;
        }
        Some(self.base() + index * self.slab_size)
    }
}

impl fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapRegion")
            .field("base", &self.base.as_ptr())
            .field("size", &self.size)
            .field("slab_size", &self.slab_size)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 0x1000;
    const SLAB: usize = 2 * PAGE;

    static SYSTEM: SystemReservation = SystemReservation;

    #[test]
    fn test_geometry() {
        let mut region = HeapRegion::reserve(&SYSTEM, 8 * SLAB, SLAB, PAGE);
        let base = region.base();
        assert_eq!(base % PAGE, 0);
        assert_eq!(region.slab_count(), 8);

        assert_eq!(region.slab_address(0), Some(base));
        assert_eq!(region.slab_address(7), Some(base + 7 * SLAB));
        assert_eq!(region.slab_address(8), None);

        unsafe { region.release() };
    }

    #[test]
    fn test_slab_index() {
        let mut region = HeapRegion::reserve(&SYSTEM, 4 * SLAB, SLAB, PAGE);
        let base = region.base();

        assert_eq!(region.slab_index(base), Some(0));
        assert_eq!(region.slab_index(base + PAGE), Some(0));
        assert_eq!(region.slab_index(base + SLAB - 1), Some(0));
        assert_eq!(region.slab_index(base + SLAB), Some(1));
        assert_eq!(region.slab_index(base + 4 * SLAB - 1), Some(3));
        assert_eq!(region.slab_index(base + 4 * SLAB), None);
        assert_eq!(region.slab_index(base - 1), None);
        assert_eq!(region.slab_index(0), None);

        unsafe { region.release() };
    }

    #[test]
    fn test_release_twice_is_noop() {
        let mut region = HeapRegion::reserve(&SYSTEM, SLAB, SLAB, PAGE);
        unsafe {
            region.release();
            region.release();
        }
    }

    #[test]
    #[should_panic(expected = "failed to reserve")]
    fn test_reservation_failure_is_fatal() {
        struct Refuse;
        impl VmReservation for Refuse {
            fn reserve(&self, _size: usize, _align: usize) -> Option<NonNull<u8>> {
                None
            }
            unsafe fn release(&self, _base: NonNull<u8>, _size: usize, _align: usize) -> bool {
                true
            }
        }
        static REFUSE: Refuse = Refuse;

        HeapRegion::reserve(&REFUSE, SLAB, SLAB, PAGE);
    }

    #[test]
    #[should_panic(expected = "is not aligned")]
    fn test_misaligned_reservation_is_fatal() {
        struct Misaligned;
        impl VmReservation for Misaligned {
            fn reserve(&self, _size: usize, _align: usize) -> Option<NonNull<u8>> {
                // Never dereferenced: the region rejects it first.
                NonNull::new((PAGE + 8) as *mut u8)
            }
            unsafe fn release(&self, _base: NonNull<u8>, _size: usize, _align: usize) -> bool {
                true
            }
        }
        static MISALIGNED: Misaligned = Misaligned;

        HeapRegion::reserve(&MISALIGNED, SLAB, SLAB, PAGE);
    }

    #[test]
    #[should_panic(expected = "failed to release")]
    fn test_release_failure_is_fatal() {
        struct KeepForever;
        impl VmReservation for KeepForever {
            fn reserve(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
                SystemReservation.reserve(size, align)
            }
            unsafe fn release(&self, _base: NonNull<u8>, _size: usize, _align: usize) -> bool {
                false
            }
        }
        static KEEP_FOREVER: KeepForever = KeepForever;

        let mut region = HeapRegion::reserve(&KEEP_FOREVER, SLAB, SLAB, PAGE);
        unsafe { region.release() };
    }
}
