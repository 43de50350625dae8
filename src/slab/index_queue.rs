//! FIFO ring of slab indices.

use crate::meta::MetaBuf;
use crate::MetadataAllocator;

/// A bounded FIFO queue of slab indices, stored in metadata memory.
///
/// Each slab index sits in at most one queue at a time, so a capacity of
/// `slab_count` never overflows.
pub struct IndexQueue {
    slots: MetaBuf<usize>,
    head: usize,
    len: usize,
}

impl IndexQueue {
    /// An empty queue able to hold `capacity` indices.
    pub fn new_in<M: MetadataAllocator + ?Sized>(capacity: usize, meta: &M) -> Option<Self> {
        Some(Self {
            slots: MetaBuf::new_in(capacity, usize::MAX, meta)?,
            head: 0,
            len: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append at the tail. Returns `false` if the queue is full.
    pub fn push_back(&mut self, index: usize) -> bool {
        if self.len == self.capacity() {
            return false;
        }
        let tail = (self.head + self.len) % self.capacity();
        self.slots[tail] = index;
        self.len += 1;
        true
    }

    /// The oldest index, without removing it.
    pub fn front(&self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        Some(self.slots[self.head])
    }

    /// Remove and return the oldest index.
    pub fn pop_front(&mut self) -> Option<usize> {
        let index = self.front()?;
        self.slots[self.head] = usize::MAX;
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;
        Some(index)
    }

    /// Give the storage back.
    ///
    /// # Safety
    /// `meta` must be the allocator the queue was created with.
    pub unsafe fn free_in<M: MetadataAllocator + ?Sized>(&mut self, meta: &M) {
        self.slots.free_in(meta);
        self.head = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemMetadataAllocator;

    fn queue(capacity: usize) -> IndexQueue {
        IndexQueue::new_in(capacity, &SystemMetadataAllocator).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let mut q = queue(4);
        assert!(q.is_empty());
        assert_eq!(q.pop_front(), None);

        for i in [3, 1, 2] {
            assert!(q.push_back(i));
        }
        assert_eq!(q.len(), 3);
        assert_eq!(q.front(), Some(3));
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
        assert!(q.is_empty());

        unsafe { q.free_in(&SystemMetadataAllocator) };
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut q = queue(2);
        assert!(q.push_back(0));
        assert!(q.push_back(1));
        assert!(!q.push_back(2));
        assert_eq!(q.len(), 2);

        unsafe { q.free_in(&SystemMetadataAllocator) };
    }

    #[test]
    fn test_wraparound() {
        let mut q = queue(3);
        for round in 0..10 {
            assert!(q.push_back(round));
            assert!(q.push_back(round + 100));
            assert_eq!(q.len(), 2);
            assert_eq!(q.front(), Some(round));
            assert_eq!(q.pop_front(), Some(round));
            assert_eq!(q.pop_front(), Some(round + 100));
        }
        assert!(q.is_empty());

        unsafe { q.free_in(&SystemMetadataAllocator) };
    }
}
