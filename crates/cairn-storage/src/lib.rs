//! Storage engine for CairnDB.
//!
//! This crate provides:
//! - Disk manager for page-level file I/O (the paged file behind the
//!   buffer pool)
//! - Heap files with a slotted record page format and a forward scanner
//! - Disk-resident B+-tree index over 32-bit integer keys, routing
//!   every page access through the buffer pool

mod btree;
mod disk;
mod engine;
mod heap;

pub use engine::open_engine;

pub use btree::{
    AttrType, BTreeIndex, IndexMeta, InternalNode, LeafNode, NodeGeometry, ScanOp,
    INTERNAL_CAPACITY, LEAF_CAPACITY,
};
pub use disk::{DiskManager, DiskManagerConfig};
pub use heap::{FileScan, HeapFile};
