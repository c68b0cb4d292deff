//! Heap file manager and forward scanner.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::disk::DiskManager;
use crate::heap::page;
use cairn_buffer::BufferManager;
use cairn_common::{CairnError, PageId, PageNo, RecordId, Result, INVALID_PAGE_NO};

/// A heap file of immutable variable-length records.
///
/// All page I/O goes through the buffer pool. Inserts fill the current
/// tail page and allocate a new one when it runs out of space.
pub struct HeapFile {
    name: String,
    file_id: u32,
    buf: Arc<BufferManager>,
    disk: Arc<DiskManager>,
    /// Tail page with insert space, 0 before the first insert.
    current_page: Mutex<PageNo>,
}

impl HeapFile {
    /// Creates the heap file, or opens it if it already exists.
    pub fn create(name: &str, buf: Arc<BufferManager>, disk: Arc<DiskManager>) -> Result<Self> {
        let (file_id, _) = disk.open_or_create(name)?;
        Self::from_parts(name, file_id, buf, disk)
    }

    /// Opens an existing heap file; `FileNotFound` if it is missing.
    pub fn open(name: &str, buf: Arc<BufferManager>, disk: Arc<DiskManager>) -> Result<Self> {
        let file_id = disk.open(name)?;
        Self::from_parts(name, file_id, buf, disk)
    }

    fn from_parts(
        name: &str,
        file_id: u32,
        buf: Arc<BufferManager>,
        disk: Arc<DiskManager>,
    ) -> Result<Self> {
        let last_page = disk.num_pages(file_id)?;
        Ok(Self {
            name: name.to_string(),
            file_id,
            buf,
            disk,
            current_page: Mutex::new(last_page),
        })
    }

    /// Returns the file name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the file id this heap occupies in the buffer pool.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Appends a record and returns its location.
    pub fn insert_record(&self, record: &[u8]) -> Result<RecordId> {
        if record.len() > page::max_record_len() {
            return Err(CairnError::RecordTooLarge {
                size: record.len(),
            });
        }

        let mut current = self.current_page.lock();

        if *current != INVALID_PAGE_NO {
            let page_id = PageId::new(self.file_id, *current);
            let guard = self.buf.fetch_write(page_id)?;
            let mut data_guard = guard.data_mut();
            match page::insert_record(&mut data_guard[..], record) {
                Ok(slot_no) => return Ok(RecordId::new(*current, slot_no)),
                Err(CairnError::PageFull) => {}
                Err(e) => return Err(e),
            }
        }

        // Tail page missing or full: start a new one.
        let (page_no, frame) = self.buf.alloc_page(self.file_id)?;
        let inserted = page::insert_record(&mut frame.write_data()[..], record);
        self.buf.unpin_page(PageId::new(self.file_id, page_no), true)?;
        *current = page_no;

        Ok(RecordId::new(page_no, inserted?))
    }

    /// Reads the record at `rid`.
    pub fn record(&self, rid: RecordId) -> Result<Bytes> {
        let guard = self.buf.fetch_read(PageId::new(self.file_id, rid.page_no))?;
        let data = guard.data();
        match page::record_at(&data[..], rid.slot_no) {
            Some(bytes) => Ok(Bytes::copy_from_slice(bytes)),
            None => Err(CairnError::RecordNotFound {
                page_no: rid.page_no,
                slot_no: rid.slot_no,
            }),
        }
    }

    /// Starts a one-shot forward scan over all records.
    pub fn scan(&self) -> Result<FileScan<'_>> {
        let num_pages = self.disk.num_pages(self.file_id)?;
        Ok(FileScan {
            heap: self,
            num_pages,
            page_no: 1,
            next_slot: 0,
        })
    }

    /// Flushes this file's pages out of the buffer pool.
    pub fn flush(&self) -> Result<()> {
        self.buf.flush_file(self.file_id)
    }
}

/// One-shot forward scanner over a heap file.
///
/// Yields `(RecordId, record bytes)` in storage order and signals
/// exhaustion with `EndOfFile`. A page is pinned only for the duration
/// of each call.
pub struct FileScan<'a> {
    heap: &'a HeapFile,
    num_pages: PageNo,
    page_no: PageNo,
    next_slot: u32,
}

impl FileScan<'_> {
    /// Returns the next record, or `EndOfFile` when the scan is done.
    pub fn next_record(&mut self) -> Result<(RecordId, Bytes)> {
        while self.page_no <= self.num_pages {
            let page_id = PageId::new(self.heap.file_id, self.page_no);
            let guard = self.heap.buf.fetch_read(page_id)?;
            let data = guard.data();

            if self.next_slot < page::slot_count(&data[..]) as u32 {
                let rid = RecordId::new(self.page_no, self.next_slot);
                let bytes =
                    Bytes::copy_from_slice(page::record_at(&data[..], self.next_slot).unwrap());
                self.next_slot += 1;
                return Ok((rid, bytes));
            }

            drop(data);
            drop(guard);
            self.page_no += 1;
            self.next_slot = 0;
        }
        Err(CairnError::EndOfFile)
    }
}
