//! Redzoned block placement.
//!
//! The layout planner knows nothing about slabs, so every plan is checked
//! here against the one geometry a slab can host: a block exactly one slab
//! long whose body ends within one shadow granule of the even/odd page
//! boundary. The right redzone then covers the whole odd page.

use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::debug;

use super::ZebraBlockHeap;
use crate::block::{BlockInfo, BlockLayout, BlockLayoutPlanner, CompactBlockInfo};
use crate::{is_aligned, AllocError, AllocResult, MemoryNotifier, MetadataAllocator, SHADOW_RATIO};

impl<N, M, const PAGE_SIZE: usize> ZebraBlockHeap<N, M, PAGE_SIZE>
where
    N: MemoryNotifier,
    M: MetadataAllocator,
{
    /// Allocate a block with a `size`-byte body, planned by `planner`.
    ///
    /// The planner is consulted outside the heap lock; the slab is only
    /// taken once the plan has been accepted.
    pub fn allocate_block_with<P: BlockLayoutPlanner + ?Sized>(
        &self,
        planner: &P,
        size: usize,
        min_left_redzone_size: usize,
        min_right_redzone_size: usize,
    ) -> AllocResult<BlockInfo> {
        // Redzones that do not fit a page would need a layout spanning
        // more than one slab.
        let left_fits = min_left_redzone_size
            .checked_add(size)
            .is_some_and(|n| n <= PAGE_SIZE);
        if !left_fits || min_right_redzone_size > PAGE_SIZE {
            debug!(
                "zebra heap: block of {} bytes with redzones {}/{} cannot fit a slab",
                size, min_left_redzone_size, min_right_redzone_size
            );
            return Err(AllocError::InvalidParam);
        }

        let layout = planner
            .plan_layout(
                PAGE_SIZE,
                SHADOW_RATIO,
                size,
                min_left_redzone_size,
                min_right_redzone_size.max(PAGE_SIZE),
            )
            .ok_or(AllocError::UnsupportedLayout)?;
        Self::check_slab_fit(&layout)?;

        let block = self.with_state(|state| {
            let (index, block) = self.allocate_in(state, PAGE_SIZE)?;
            state.slabs.update_info(
                index,
                CompactBlockInfo {
                    block,
                    block_size: layout.block_size,
                    header_size: layout.left_redzone_size(),
                    trailer_size: layout.right_redzone_size(),
                    is_nested: false,
                },
            )?;
            Ok(block)
        })?;

        debug_assert!(is_aligned(block, SHADOW_RATIO));
        let block = NonNull::new(block as *mut u8).ok_or(AllocError::NoMemory)?;
        Ok(BlockInfo::new(block, layout))
    }

    /// Accept only layouts that fill exactly one slab with the body pinned
    /// against the even/odd page boundary. The body may be padded past the
    /// requested size; only the redzone on the odd page side matters.
    pub fn check_slab_fit(layout: &BlockLayout) -> AllocResult {
        if layout.block_size != Self::SLAB_SIZE {
            debug!("zebra heap: rejecting {:?}: not one slab", layout);
            return Err(AllocError::UnsupportedLayout);
        }

        let right_redzone = layout.right_redzone_size();
        // Part of the body would lie in the odd page.
        if right_redzone < PAGE_SIZE {
            debug!("zebra heap: rejecting {:?}: body reaches the odd page", layout);
            return Err(AllocError::UnsupportedLayout);
        }
        // The body must end less than one granule before the odd page.
        if right_redzone - PAGE_SIZE >= SHADOW_RATIO {
            debug!("zebra heap: rejecting {:?}: body ends short of the odd page", layout);
            return Err(AllocError::UnsupportedLayout);
        }
        Ok(())
    }
}
