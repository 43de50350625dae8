//! Block layout planning.

#[cfg(feature = "log")]
use log::trace;

use crate::{align_up, is_aligned};

/// Size of the metadata header at the start of every block.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Size of the metadata trailer at the end of every block.
pub const BLOCK_TRAILER_SIZE: usize = 20;

/// Sizes of every part of a block, front to back.
///
/// `header_size + header_padding_size` is the left redzone and
/// `trailer_padding_size + trailer_size` the right redzone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockLayout {
    pub block_alignment: usize,
    pub block_size: usize,
    pub header_size: usize,
    pub header_padding_size: usize,
    pub body_size: usize,
    pub trailer_padding_size: usize,
    pub trailer_size: usize,
}

impl BlockLayout {
    /// Bytes in front of the body.
    pub fn left_redzone_size(&self) -> usize {
        self.header_size + self.header_padding_size
    }

    /// Bytes behind the body.
    pub fn right_redzone_size(&self) -> usize {
        self.trailer_padding_size + self.trailer_size
    }

    /// Whether the parts add up to `block_size`.
    pub fn is_consistent(&self) -> bool {
        self.left_redzone_size()
            .checked_add(self.body_size)
            .and_then(|n| n.checked_add(self.right_redzone_size()))
            == Some(self.block_size)
    }
}

/// Plans block layouts. Pure: no state is shared with the heap.
pub trait BlockLayoutPlanner {
    /// Plan a block holding a `size`-byte body.
    ///
    /// - `chunk_size`: the block size must be a multiple of this
    /// - `alignment`: the block and body alignment
    /// - `min_left_redzone_size` / `min_right_redzone_size`: lower bounds on
    ///   the redzones, header and trailer included
    ///
    /// Returns `None` if no layout satisfies the request.
    fn plan_layout(
        &self,
        chunk_size: usize,
        alignment: usize,
        size: usize,
        min_left_redzone_size: usize,
        min_right_redzone_size: usize,
    ) -> Option<BlockLayout>;
}

impl<F> BlockLayoutPlanner for F
where
    F: Fn(usize, usize, usize, usize, usize) -> Option<BlockLayout>,
{
    fn plan_layout(
        &self,
        chunk_size: usize,
        alignment: usize,
        size: usize,
        min_left_redzone_size: usize,
        min_right_redzone_size: usize,
    ) -> Option<BlockLayout> {
        self(
            chunk_size,
            alignment,
            size,
            min_left_redzone_size,
            min_right_redzone_size,
        )
    }
}

/// Default planner.
///
/// The body is pushed as far right as its alignment allows, so it ends close
/// to the right redzone; overflows are favoured over underflows when the
/// right redzone sits on an inaccessible page. The left redzone absorbs the
/// rest of the chunk-rounded block.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedzoneLayoutPlanner;

impl BlockLayoutPlanner for RedzoneLayoutPlanner {
    fn plan_layout(
        &self,
        chunk_size: usize,
        alignment: usize,
        size: usize,
        min_left_redzone_size: usize,
        min_right_redzone_size: usize,
    ) -> Option<BlockLayout> {
        if !chunk_size.is_power_of_two()
            || !alignment.is_power_of_two()
            || !is_aligned(chunk_size, alignment)
        {
            return None;
        }

        let left = min_left_redzone_size.max(BLOCK_HEADER_SIZE);
        let left = left.checked_add(alignment - 1).map(|_| align_up(left, alignment))?;
        let mut right = min_right_redzone_size.max(BLOCK_TRAILER_SIZE);

        let total = left.checked_add(size)?.checked_add(right)?;
        let total = total.checked_add(chunk_size - 1).map(|_| align_up(total, chunk_size))?;

        // Slide the body right until it touches the (padded) right redzone.
        let body_and_right = size + right;
        let body_padding = align_up(body_and_right, alignment) - body_and_right;
        right += body_padding;
        let left = total - right - size;

        let layout = BlockLayout {
            block_alignment: alignment,
            block_size: total,
            header_size: BLOCK_HEADER_SIZE,
            header_padding_size: left - BLOCK_HEADER_SIZE,
            body_size: size,
            trailer_padding_size: right - BLOCK_TRAILER_SIZE,
            trailer_size: BLOCK_TRAILER_SIZE,
        };
        trace!("planned block layout for {} bytes: {:?}", size, layout);
        debug_assert!(layout.is_consistent());
        debug_assert!(layout.left_redzone_size() >= min_left_redzone_size);
        debug_assert!(layout.right_redzone_size() >= min_right_redzone_size);
        Some(layout)
    }
}
