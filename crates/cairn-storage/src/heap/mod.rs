//! Heap storage: slotted record pages and heap files.
//!
//! The heap is the relation store the index is built over. Records are
//! raw immutable byte strings addressed by [`RecordId`]; a one-shot
//! forward [`FileScan`] yields them in storage order and signals
//! exhaustion with `EndOfFile`.
//!
//! [`RecordId`]: cairn_common::RecordId

mod file;
pub(crate) mod page;

pub use file::{FileScan, HeapFile};
