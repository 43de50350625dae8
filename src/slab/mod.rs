//! Slab bookkeeping.
//!
//! This module holds the per-slab state table and the FIFO index queues
//! (free slabs, quarantined slabs) layered over it.

pub mod index_queue;
pub mod slab_table;

// Re-export public types
pub use index_queue::IndexQueue;
pub use slab_table::{SlabEntry, SlabState, SlabTable};
