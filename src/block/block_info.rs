//! Block descriptors.

use core::ptr::NonNull;

use super::layout::BlockLayout;

/// The descriptor a slab records for its allocation.
///
/// All-zero (the `Default`) while the slab is free. Sizes are in bytes;
/// `header_size` and `trailer_size` cover the whole left and right redzones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompactBlockInfo {
    /// Start address of the block, `0` when none.
    pub block: usize,
    pub block_size: usize,
    pub header_size: usize,
    pub trailer_size: usize,
    pub is_nested: bool,
}

impl CompactBlockInfo {
    /// Whether this is the descriptor of a free slab.
    pub fn is_zeroed(&self) -> bool {
        *self == Self::default()
    }
}

/// A block placed in memory together with its full layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    block: NonNull<u8>,
    layout: BlockLayout,
}

impl BlockInfo {
    pub fn new(block: NonNull<u8>, layout: BlockLayout) -> Self {
        Self { block, layout }
    }

    /// Start of the block; also where the header lives.
    pub fn block(&self) -> NonNull<u8> {
        self.block
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    pub fn block_size(&self) -> usize {
        self.layout.block_size
    }

    pub fn header(&self) -> usize {
        self.block.as_ptr() as usize
    }

    /// First byte handed to the user.
    pub fn body(&self) -> usize {
        self.header() + self.layout.left_redzone_size()
    }

    pub fn body_size(&self) -> usize {
        self.layout.body_size
    }

    /// First byte past the body, where the right redzone begins.
    pub fn body_end(&self) -> usize {
        self.body() + self.layout.body_size
    }

    /// The descriptor a slab records for this block.
    pub fn compact(&self) -> CompactBlockInfo {
        CompactBlockInfo {
            block: self.header(),
            block_size: self.layout.block_size,
            header_size: self.layout.left_redzone_size(),
            trailer_size: self.layout.right_redzone_size(),
            is_nested: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> BlockLayout {
        BlockLayout {
            block_alignment: 8,
            block_size: 8192,
            header_size: 16,
            header_padding_size: 3976,
            body_size: 100,
            trailer_padding_size: 4080,
            trailer_size: 20,
        }
    }

    #[test]
    fn test_parts() {
        let mut backing = [0u64; 2];
        let block = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let info = BlockInfo::new(block, sample_layout());
        let base = block.as_ptr() as usize;

        assert_eq!(info.header(), base);
        assert_eq!(info.body(), base + 3992);
        assert_eq!(info.body_end(), base + 4092);
        assert_eq!(info.body_end() + 4100, base + 8192);
    }

    #[test]
    fn test_compact() {
        let mut backing = [0u64; 2];
        let block = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let compact = BlockInfo::new(block, sample_layout()).compact();

        assert_eq!(compact.block, block.as_ptr() as usize);
        assert_eq!(compact.block_size, 8192);
        assert_eq!(compact.header_size, 3992);
        assert_eq!(compact.trailer_size, 4100);
        assert!(!compact.is_nested);
        assert!(!compact.is_zeroed());
    }

    #[test]
    fn test_zeroed_descriptor() {
        let info = CompactBlockInfo::default();
        assert!(info.is_zeroed());
        assert_eq!(info.block, 0);
    }
}
