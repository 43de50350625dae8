//! Virtual memory reservation backends.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use std::alloc::System;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::VmReservation;

/// Reservation through anonymous private `mmap`.
///
/// Requests aligned beyond the OS page are over-reserved and the excess is
/// unmapped, so the region keeps exactly `size` bytes.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapReservation;

#[cfg(unix)]
impl MmapReservation {
    fn map(size: usize) -> Option<NonNull<u8>> {
        // SAFETY: anonymous mapping at an address chosen by the kernel.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            debug!("mmap of {:#x} bytes failed", size);
            return None;
        }
        NonNull::new(ptr as *mut u8)
    }

    fn unmap(addr: usize, size: usize) -> bool {
        // SAFETY: callers only pass whole pages of mappings they own.
        unsafe { libc::munmap(addr as *mut libc::c_void, size) == 0 }
    }
}

#[cfg(unix)]
impl VmReservation for MmapReservation {
    fn reserve(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 || !align.is_power_of_two() {
            return None;
        }

        let os_page = page_size::get();
        if align <= os_page {
            return Self::map(size);
        }

        // Both are powers of two, so `align` is a whole number of OS pages
        // and every trimmed piece below is page-granular.
        let span = size.checked_add(align - os_page)?;
        let raw = Self::map(span)?.as_ptr() as usize;
        let base = crate::align_up(raw, align);
        let head = base - raw;
        let tail = span - head - size;
        if head > 0 && !Self::unmap(raw, head) {
            warn!("munmap of {:#x} bytes at {:#x} failed, leaking them", head, raw);
        }
        if tail > 0 && !Self::unmap(base + size, tail) {
            warn!(
                "munmap of {:#x} bytes at {:#x} failed, leaking them",
                tail,
                base + size
            );
        }
        NonNull::new(base as *mut u8)
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize, _align: usize) -> bool {
        Self::unmap(base.as_ptr() as usize, size)
    }
}

/// Zero-filled reservation through the system allocator.
///
/// Portable, and handy in tests, but the memory is not guaranteed to be
/// backed by pages of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemReservation;

impl VmReservation for SystemReservation {
    fn reserve(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: layout has a non-zero size.
        NonNull::new(unsafe { System.alloc_zeroed(layout) })
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize, align: usize) -> bool {
        match Layout::from_size_align(size, align) {
            Ok(layout) => {
                System.dealloc(base.as_ptr(), layout);
                true
            }
            Err(_) => false,
        }
    }
}

/// The reservation used by [`crate::ZebraBlockHeap::new`].
pub fn default_reservation() -> &'static dyn VmReservation {
    #[cfg(unix)]
    {
        static MMAP: MmapReservation = MmapReservation;
        &MMAP
    }
    #[cfg(not(unix))]
    {
        static SYSTEM: SystemReservation = SystemReservation;
        &SYSTEM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_backend(backend: &dyn VmReservation, align: usize) {
        let size = 4 * align;
        let base = backend.reserve(size, align).unwrap();
        let addr = base.as_ptr() as usize;
        assert_eq!(addr % align, 0);

        let bytes = unsafe { core::slice::from_raw_parts_mut(base.as_ptr(), size) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[0] = 0xAA;
        bytes[size - 1] = 0xBB;

        assert!(unsafe { backend.release(base, size, align) });
    }

    #[test]
    fn test_system_reservation() {
        check_backend(&SystemReservation, 0x1000);
        check_backend(&SystemReservation, 0x4000);
    }

    #[cfg(unix)]
    #[test]
    fn test_mmap_reservation() {
        check_backend(&MmapReservation, page_size::get());
        check_backend(&MmapReservation, 4 * page_size::get());
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(SystemReservation.reserve(0, 0x1000).is_none());
        #[cfg(unix)]
        assert!(MmapReservation.reserve(0, 0x1000).is_none());
    }
}
