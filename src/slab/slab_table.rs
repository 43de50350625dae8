//! Per-slab state table.
//!
//! Every slab is in exactly one [`SlabState`]. Transitions go through the
//! methods below, which check the current state before touching anything:
//!
//! ```text
//!   Free --allocate--> Allocated --push--> Quarantined
//!    ^                  |    ^                 |
//!    +------free--------+    +---pop/empty-----+
//! ```

#[cfg(feature = "log")]
use log::debug;

use crate::block::CompactBlockInfo;
use crate::meta::MetaBuf;
use crate::{AllocError, AllocResult, MetadataAllocator};

/// Lifecycle state of a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlabState {
    #[default]
    Free,
    Allocated,
    Quarantined,
}

/// Metadata kept for one slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlabEntry {
    pub state: SlabState,
    pub info: CompactBlockInfo,
}

/// Flat table of [`SlabEntry`], indexed by slab index.
pub struct SlabTable {
    entries: MetaBuf<SlabEntry>,
}

impl SlabTable {
    /// A table of `slab_count` free slabs.
    pub fn new_in<M: MetadataAllocator + ?Sized>(slab_count: usize, meta: &M) -> Option<Self> {
        Some(Self {
            entries: MetaBuf::new_in(slab_count, SlabEntry::default(), meta)?,
        })
    }

    pub fn get(&self, index: usize) -> Option<&SlabEntry> {
        self.entries.get(index)
    }

    fn entry_in(&mut self, index: usize, expected: SlabState) -> AllocResult<&mut SlabEntry> {
        let entry = self
            .entries
            .get_mut(index)
            .ok_or(AllocError::NotAllocated)?;
        if entry.state != expected {
            debug!(
                "slab {}: expected {:?}, found {:?}",
                index, expected, entry.state
            );
            return Err(match entry.state {
                SlabState::Quarantined => AllocError::Quarantined,
                _ => AllocError::NotAllocated,
            });
        }
        Ok(entry)
    }

    /// `Free` -> `Allocated`, recording `info`.
    pub fn mark_allocated(&mut self, index: usize, info: CompactBlockInfo) -> AllocResult {
        debug_assert!(info.block != 0);
        let entry = self.entry_in(index, SlabState::Free)?;
        debug_assert!(entry.info.is_zeroed());
        entry.state = SlabState::Allocated;
        entry.info = info;
        Ok(())
    }

    /// Overwrite the descriptor of an `Allocated` slab.
    pub fn update_info(&mut self, index: usize, info: CompactBlockInfo) -> AllocResult {
        let entry = self.entry_in(index, SlabState::Allocated)?;
        entry.info = info;
        Ok(())
    }

    /// `Allocated` -> `Free`, zeroing the descriptor.
    pub fn mark_free(&mut self, index: usize) -> AllocResult {
        let entry = self.entry_in(index, SlabState::Allocated)?;
        *entry = SlabEntry::default();
        Ok(())
    }

    /// `Allocated` -> `Quarantined`.
    pub fn mark_quarantined(&mut self, index: usize) -> AllocResult {
        let entry = self.entry_in(index, SlabState::Allocated)?;
        entry.state = SlabState::Quarantined;
        Ok(())
    }

    /// `Quarantined` -> `Allocated`, returning the descriptor.
    pub fn release_from_quarantine(&mut self, index: usize) -> AllocResult<CompactBlockInfo> {
        let entry = self.entry_in(index, SlabState::Quarantined)?;
        entry.state = SlabState::Allocated;
        Ok(entry.info)
    }

    /// Number of slabs currently in `state`.
    pub fn count_in(&self, state: SlabState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    /// Give the storage back.
    ///
    /// # Safety
    /// `meta` must be the allocator the table was created with.
    pub unsafe fn free_in<M: MetadataAllocator + ?Sized>(&mut self, meta: &M) {
        self.entries.free_in(meta);
    }
}
