//! Block descriptors and layout planning.
//!
//! A block is a self-describing allocation: header, left padding, body,
//! right padding and trailer. The planner decides the sizes; the heap only
//! accepts the layouts that exactly fill one slab.

pub mod block_info;
pub mod layout;

// Re-export public types
pub use block_info::{BlockInfo, CompactBlockInfo};
pub use layout::{
    BlockLayout, BlockLayoutPlanner, RedzoneLayoutPlanner, BLOCK_HEADER_SIZE, BLOCK_TRAILER_SIZE,
};
