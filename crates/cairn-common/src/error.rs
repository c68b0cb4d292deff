//! Error types for CairnDB.

use crate::page::PageNo;
use thiserror::Error;

/// Result type alias using CairnError.
pub type Result<T> = std::result::Result<T, CairnError>;

/// Errors that can occur in CairnDB operations.
///
/// Several variants are expected control-flow signals rather than
/// failures: `EndOfFile` terminates a relation scan and
/// `IndexScanCompleted` terminates an index range scan.
#[derive(Debug, Error)]
pub enum CairnError {
    // I/O plumbing
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("file not found: {name}")]
    FileNotFound { name: String },

    #[error("page {page_no} does not exist in file {file_id}")]
    InvalidPageNo { file_id: u32, page_no: PageNo },

    // Buffer pool
    #[error("buffer pool exceeded: all frames are pinned")]
    BufferExceeded,

    #[error("page {page_no} in file {file_id} is pinned")]
    PagePinned { file_id: u32, page_no: PageNo },

    #[error("page {page_no} in file {file_id} is not pinned")]
    PageNotPinned { file_id: u32, page_no: PageNo },

    #[error("bad buffer: frame {frame_no} is inconsistent with the page table")]
    BadBuffer { frame_no: u32 },

    // Heap file
    #[error("heap page is full")]
    PageFull,

    #[error("record of {size} bytes cannot fit in one page")]
    RecordTooLarge { size: usize },

    #[error("no record at {page_no}.{slot_no}")]
    RecordNotFound { page_no: PageNo, slot_no: u32 },

    #[error("end of file")]
    EndOfFile,

    // B+-tree index
    #[error("index metadata mismatch for {index_name}")]
    BadIndexInfo { index_name: String },

    #[error("bad scan opcodes")]
    BadOpcodes,

    #[error("bad scan range: low {low} exceeds high {high}")]
    BadScanrange { low: i32, high: i32 },

    #[error("scan is not initialized")]
    ScanNotInitialized,

    #[error("index scan completed")]
    IndexScanCompleted,

    #[error("no such key found: {key}")]
    NoSuchKeyFound { key: i32 },
}
