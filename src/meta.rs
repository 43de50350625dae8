//! Bookkeeping storage carved from a [`MetadataAllocator`].
//!
//! The slab table and both index queues are fixed-size arrays sized once at
//! construction. They live in memory handed out by the injected metadata
//! allocator and are given back to it explicitly when the heap goes away.

use core::alloc::{GlobalAlloc, Layout};
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use std::alloc::System;

use crate::MetadataAllocator;

/// Metadata allocator backed by the system allocator, bypassing whatever
/// global allocator the process installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMetadataAllocator;

impl MetadataAllocator for SystemMetadataAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: callers never ask for zero-sized layouts.
        NonNull::new(unsafe { System.alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        System.dealloc(ptr.as_ptr(), layout)
    }
}

/// A fixed-length array of `T` living in metadata-allocator memory.
///
/// There is no `Drop`: the owner must hand the buffer back with
/// [`MetaBuf::free_in`] on the allocator it came from.
pub struct MetaBuf<T> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: MetaBuf owns its elements exclusively, like a Box<[T]>.
unsafe impl<T: Send> Send for MetaBuf<T> {}
unsafe impl<T: Sync> Sync for MetaBuf<T> {}

impl<T: Copy> MetaBuf<T> {
    /// Allocate `len` elements, all set to `fill`.
    ///
    /// Returns `None` if the allocator is out of memory.
    pub fn new_in<M: MetadataAllocator + ?Sized>(len: usize, fill: T, meta: &M) -> Option<Self> {
        let layout = Layout::array::<T>(len).ok()?;
        if layout.size() == 0 {
            return Some(Self {
                ptr: NonNull::dangling(),
                len,
            });
        }

        let ptr = meta.allocate(layout)?.cast::<T>();
        for i in 0..len {
            // SAFETY: i < len and the allocation holds `len` elements.
            unsafe { ptr.as_ptr().add(i).write(fill) };
        }
        Some(Self { ptr, len })
    }
}

impl<T> MetaBuf<T> {
    /// Give the storage back. The buffer is empty afterwards.
    ///
    /// # Safety
    /// `meta` must be the allocator this buffer was created with.
    pub unsafe fn free_in<M: MetadataAllocator + ?Sized>(&mut self, meta: &M) {
        // The layout was valid at creation and `len` never grows.
        if let Ok(layout) = Layout::array::<T>(self.len) {
            if layout.size() != 0 {
                meta.deallocate(self.ptr.cast::<u8>(), layout);
            }
        }
        self.ptr = NonNull::dangling();
        self.len = 0;
    }
}

impl<T> Deref for MetaBuf<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: ptr holds `len` initialized elements (or is dangling with a
        // zero-sized layout).
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> DerefMut for MetaBuf<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: as in `deref`, and `&mut self` guarantees uniqueness.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}
