//! Buffer pool manager.

use std::sync::Arc;

use log::{debug, warn};

use crate::file::PagedFile;
use crate::frame::{Frame, FrameId};
use crate::page_table::PageTable;
use crate::replacer::{ClockReplacer, FrameProbe, Replacer};
use crate::stats::BufferStats;
use cairn_common::{CairnError, PageId, PageNo, Result, PAGE_SIZE};

/// Buffer pool manager.
///
/// Mediates between the paged file and a fixed array of in-memory
/// frames:
/// - page table mapping `(file, page_no)` to the resident frame
/// - clock replacement with pin counts and reference bits
/// - dirty tracking with write-back on eviction and flush
///
/// Pages handed out by [`read_page`](Self::read_page) and
/// [`alloc_page`](Self::alloc_page) stay pinned until the caller
/// unpins them; a pinned page is never evicted.
pub struct BufferManager {
    /// Fixed frame directory.
    frames: Vec<Frame>,
    /// Residency map, consistent with the frame directory.
    page_table: PageTable,
    /// Victim selection policy.
    replacer: ClockReplacer,
    /// The on-disk collaborator.
    disk: Arc<dyn PagedFile>,
    /// Access/read/write counters.
    stats: BufferStats,
}

impl BufferManager {
    /// Creates a buffer manager with `num_frames` frames.
    pub fn new(num_frames: usize, disk: Arc<dyn PagedFile>) -> Self {
        assert!(num_frames > 0, "buffer pool needs at least one frame");
        let frames = (0..num_frames)
            .map(|i| Frame::new(FrameId(i as u32)))
            .collect();

        Self {
            frames,
            page_table: PageTable::new(num_frames),
            replacer: ClockReplacer::new(num_frames),
            disk,
            stats: BufferStats::new(),
        }
    }

    /// Creates a buffer manager sized to 25% of available system RAM,
    /// with a floor of 1,000 frames.
    pub fn auto_sized(disk: Arc<dyn PagedFile>) -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        let target_bytes = (sys.available_memory() as usize) / 4;
        let num_frames = (target_bytes / PAGE_SIZE).max(1_000);

        Self::new(num_frames, disk)
    }

    /// Returns the number of frames in the pool.
    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the buffer statistics counters.
    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }

    /// Returns true if the page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.page_table.contains(page_id)
    }

    /// Returns the pin count of a resident page.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        self.page_table
            .get(page_id)
            .map(|fid| self.frame(fid).pin_count())
    }

    #[inline]
    fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id.0 as usize]
    }

    /// Reads a page, pinning it in a frame.
    ///
    /// On a hit the pin count is incremented and the reference bit set.
    /// On a miss a victim frame is acquired via the clock sweep and the
    /// page is loaded from disk (one disk read). Either way the caller
    /// owns one pin on the returned frame and must release it with
    /// [`unpin_page`](Self::unpin_page).
    pub fn read_page(&self, page_id: PageId) -> Result<&Frame> {
        self.stats.record_access();

        if !page_id.is_valid() {
            return Err(CairnError::InvalidPageNo {
                file_id: page_id.file_id,
                page_no: page_id.page_no,
            });
        }

        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = self.frame(frame_id);
            frame.pin();
            return Ok(frame);
        }

        let frame_id = self.allocate_frame()?;
        let frame = self.frame(frame_id);

        {
            let mut data = frame.write_data();
            self.disk.read_page(page_id, &mut data)?;
        }
        self.stats.record_disk_read();

        frame.set_up(page_id);
        self.page_table.insert(page_id, frame_id);

        Ok(frame)
    }

    /// Allocates a new page in the file and pins it in a frame.
    pub fn alloc_page(&self, file_id: u32) -> Result<(PageNo, &Frame)> {
        self.stats.record_access();

        let page_no = self.disk.allocate_page(file_id)?;
        let page_id = PageId::new(file_id, page_no);

        let frame_id = self.allocate_frame()?;
        let frame = self.frame(frame_id);

        // The file zero-initializes new pages; the frame must agree.
        frame.write_data().fill(0);
        frame.set_up(page_id);
        self.page_table.insert(page_id, frame_id);

        Ok((page_no, frame))
    }

    /// Releases one pin on a page, ORing `dirty` into its dirty bit.
    ///
    /// Unpinning a page that is not resident is a silent no-op.
    /// Unpinning a page whose pin count is already zero fails with
    /// `PageNotPinned`.
    pub fn unpin_page(&self, page_id: PageId, dirty: bool) -> Result<()> {
        let Some(frame_id) = self.page_table.get(page_id) else {
            return Ok(());
        };
        self.stats.record_access();

        let frame = self.frame(frame_id);
        if frame.pin_count() == 0 {
            return Err(CairnError::PageNotPinned {
                file_id: page_id.file_id,
                page_no: page_id.page_no,
            });
        }

        frame.unpin();
        if dirty {
            frame.set_dirty(true);
        }
        Ok(())
    }

    /// Removes a page from the pool and deletes it from the file.
    ///
    /// The page's frame is cleared without write-back. Disposing a
    /// pinned page fails with `PagePinned` and leaves it resident.
    pub fn dispose_page(&self, page_id: PageId) -> Result<()> {
        self.stats.record_access();

        if let Some(frame_id) = self.page_table.get(page_id) {
            let frame = self.frame(frame_id);
            if frame.is_pinned() {
                return Err(CairnError::PagePinned {
                    file_id: page_id.file_id,
                    page_no: page_id.page_no,
                });
            }
            self.page_table.remove(page_id);
            frame.reset();
        }

        self.disk.delete_page(page_id)
    }

    /// Writes back and evicts every resident page of a file.
    ///
    /// Fails with `PagePinned` if any page of the file is still pinned
    /// and with `BadBuffer` if a frame disagrees with the page table.
    pub fn flush_file(&self, file_id: u32) -> Result<()> {
        for (page_id, frame_id) in self.page_table.entries_for_file(file_id) {
            self.stats.record_access();
            let frame = self.frame(frame_id);

            if frame.page_id() != Some(page_id) {
                return Err(CairnError::BadBuffer {
                    frame_no: frame_id.0,
                });
            }
            if frame.is_pinned() {
                return Err(CairnError::PagePinned {
                    file_id,
                    page_no: page_id.page_no,
                });
            }

            if frame.is_dirty() {
                self.disk.write_page(page_id, &frame.read_data())?;
                frame.set_dirty(false);
                self.stats.record_disk_write();
            }

            self.page_table.remove(page_id);
            frame.reset();
        }
        debug!("flushed file {file_id}");
        Ok(())
    }

    /// Runs `f` over the data of a page the caller already holds a pin
    /// on, without taking another pin.
    ///
    /// Fails with `PageNotPinned` if the page is absent or unpinned,
    /// which keeps borrowed buffers from being read after their pin is
    /// gone.
    pub fn read_pinned<R>(&self, page_id: PageId, f: impl FnOnce(&[u8; PAGE_SIZE]) -> R) -> Result<R> {
        let frame_id = self
            .page_table
            .get(page_id)
            .ok_or(CairnError::PageNotPinned {
                file_id: page_id.file_id,
                page_no: page_id.page_no,
            })?;
        let frame = self.frame(frame_id);
        if !frame.is_pinned() {
            return Err(CairnError::PageNotPinned {
                file_id: page_id.file_id,
                page_no: page_id.page_no,
            });
        }
        Ok(f(&frame.read_data()))
    }

    /// Reads a page under an RAII guard that unpins it (clean) on drop.
    pub fn fetch_read(&self, page_id: PageId) -> Result<PageReadGuard<'_>> {
        let frame = self.read_page(page_id)?;
        Ok(PageReadGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Reads a page under an RAII guard that unpins it dirty on drop.
    pub fn fetch_write(&self, page_id: PageId) -> Result<PageWriteGuard<'_>> {
        let frame = self.read_page(page_id)?;
        Ok(PageWriteGuard {
            pool: self,
            page_id,
            frame,
        })
    }

    /// Acquires a victim frame via the clock sweep and evicts whatever
    /// page it holds.
    fn allocate_frame(&self) -> Result<FrameId> {
        let frame_id = self.replacer.pick_victim(&mut |fid| {
            let frame = &self.frames[fid.0 as usize];
            if !frame.is_valid() {
                FrameProbe::Empty
            } else if frame.ref_bit() {
                frame.set_ref_bit(false);
                FrameProbe::Referenced
            } else if frame.is_pinned() {
                FrameProbe::Pinned
            } else {
                FrameProbe::Evictable
            }
        })?;

        let frame = self.frame(frame_id);
        if let Some(evicted) = frame.page_id() {
            if frame.is_dirty() {
                self.disk.write_page(evicted, &frame.read_data())?;
                self.stats.record_disk_write();
            }
            debug!("evicting page {evicted} from {}", frame.frame_id());
            self.page_table.remove(evicted);
            frame.reset();
        }

        Ok(frame_id)
    }
}

impl Drop for BufferManager {
    /// Best-effort write-back of every valid dirty page whose file is
    /// still open. Pinned pages are written too; the process is
    /// tearing down and nothing is raised here.
    fn drop(&mut self) {
        for frame in &self.frames {
            let Some(page_id) = frame.page_id() else {
                continue;
            };
            if frame.is_dirty() && self.disk.is_open(page_id.file_id) {
                if let Err(e) = self.disk.write_page(page_id, &frame.read_data()) {
                    warn!("write-back of page {page_id} failed during shutdown: {e}");
                } else {
                    self.stats.record_disk_write();
                }
            }
        }
    }
}

/// RAII pin for reading a page; unpins clean on drop.
pub struct PageReadGuard<'a> {
    pool: &'a BufferManager,
    page_id: PageId,
    frame: &'a Frame,
}

impl PageReadGuard<'_> {
    /// Returns the page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns the page data.
    pub fn data(&self) -> parking_lot::RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.read_data()
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        let _ = self.pool.unpin_page(self.page_id, false);
    }
}

/// RAII pin for modifying a page; unpins dirty on drop.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferManager,
    page_id: PageId,
    frame: &'a Frame,
}

impl PageWriteGuard<'_> {
    /// Returns the page id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Returns mutable page data.
    pub fn data_mut(&self) -> parking_lot::RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.frame.write_data()
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        let _ = self.pool.unpin_page(self.page_id, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory paged file for exercising the pool without real I/O.
    #[derive(Default)]
    struct MemFile {
        pages: Mutex<HashMap<PageId, Box<[u8; PAGE_SIZE]>>>,
        next_page_no: Mutex<HashMap<u32, PageNo>>,
        closed: Mutex<Vec<u32>>,
    }

    impl MemFile {
        fn page(&self, page_id: PageId) -> Option<Box<[u8; PAGE_SIZE]>> {
            self.pages.lock().get(&page_id).cloned()
        }

        fn close(&self, file_id: u32) {
            self.closed.lock().push(file_id);
        }
    }

    impl PagedFile for MemFile {
        fn first_page_no(&self, _file_id: u32) -> Result<PageNo> {
            Ok(1)
        }

        fn allocate_page(&self, file_id: u32) -> Result<PageNo> {
            let mut next = self.next_page_no.lock();
            let page_no = next.entry(file_id).or_insert(0);
            *page_no += 1;
            self.pages
                .lock()
                .insert(PageId::new(file_id, *page_no), Box::new([0u8; PAGE_SIZE]));
            Ok(*page_no)
        }

        fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
            let pages = self.pages.lock();
            let data = pages.get(&page_id).ok_or(CairnError::InvalidPageNo {
                file_id: page_id.file_id,
                page_no: page_id.page_no,
            })?;
            buf.copy_from_slice(&**data);
            Ok(())
        }

        fn write_page(&self, page_id: PageId, data: &[u8; PAGE_SIZE]) -> Result<()> {
            self.pages.lock().insert(page_id, Box::new(*data));
            Ok(())
        }

        fn delete_page(&self, page_id: PageId) -> Result<()> {
            self.pages.lock().remove(&page_id);
            Ok(())
        }

        fn is_open(&self, file_id: u32) -> bool {
            !self.closed.lock().contains(&file_id)
        }
    }

    fn pool_with(num_frames: usize) -> (BufferManager, Arc<MemFile>) {
        let disk = Arc::new(MemFile::default());
        (BufferManager::new(num_frames, disk.clone()), disk)
    }

    /// Allocates a page, stamps its first byte, and unpins it.
    fn seed_page(pool: &BufferManager, file_id: u32, tag: u8) -> PageId {
        let (page_no, frame) = pool.alloc_page(file_id).unwrap();
        frame.write_data()[0] = tag;
        let page_id = PageId::new(file_id, page_no);
        pool.unpin_page(page_id, true).unwrap();
        page_id
    }

    #[test]
    fn test_alloc_page_pins_and_registers() {
        let (pool, _disk) = pool_with(4);

        let (page_no, frame) = pool.alloc_page(0).unwrap();
        assert_eq!(page_no, 1);
        assert!(frame.is_pinned());

        let page_id = PageId::new(0, page_no);
        assert!(pool.contains(page_id));
        assert_eq!(pool.pin_count(page_id), Some(1));
    }

    #[test]
    fn test_read_hit_pins_without_disk_read() {
        let (pool, _disk) = pool_with(4);
        let page_id = seed_page(&pool, 0, 0xAA);

        let reads_before = pool.stats().snapshot().disk_reads;
        let frame = pool.read_page(page_id).unwrap();
        assert_eq!(frame.read_data()[0], 0xAA);
        assert!(frame.ref_bit());
        assert_eq!(pool.stats().snapshot().disk_reads, reads_before);

        pool.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_read_miss_loads_from_disk() {
        let (pool, disk) = pool_with(2);
        let page_id = seed_page(&pool, 0, 0x5A);

        // Push the page out of the pool.
        pool.flush_file(0).unwrap();
        assert!(!pool.contains(page_id));
        assert_eq!(disk.page(page_id).unwrap()[0], 0x5A);

        let frame = pool.read_page(page_id).unwrap();
        assert_eq!(frame.read_data()[0], 0x5A);
        assert_eq!(pool.stats().snapshot().disk_reads, 1);
        pool.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_read_invalid_page_no() {
        let (pool, _disk) = pool_with(2);
        let result = pool.read_page(PageId::new(0, 0));
        assert!(matches!(result, Err(CairnError::InvalidPageNo { .. })));
    }

    #[test]
    fn test_unpin_absent_page_is_silent() {
        let (pool, _disk) = pool_with(2);
        assert!(pool.unpin_page(PageId::new(0, 99), true).is_ok());
    }

    #[test]
    fn test_unpin_twice_fails() {
        let (pool, _disk) = pool_with(2);
        let page_id = seed_page(&pool, 0, 1);

        // seed_page already released the only pin.
        let result = pool.unpin_page(page_id, false);
        assert!(matches!(result, Err(CairnError::PageNotPinned { .. })));
    }

    #[test]
    fn test_unpin_ors_dirty_flag() {
        let (pool, _disk) = pool_with(2);
        let (page_no, frame) = pool.alloc_page(0).unwrap();
        let page_id = PageId::new(0, page_no);
        frame.pin();

        pool.unpin_page(page_id, true).unwrap();
        pool.unpin_page(page_id, false).unwrap();

        // A later clean unpin must not clear the dirty bit.
        assert!(frame.is_dirty());
    }

    #[test]
    fn test_buffer_exceeded_and_recovery() {
        let (pool, _disk) = pool_with(3);

        let mut pinned = Vec::new();
        for _ in 0..3 {
            let (page_no, _) = pool.alloc_page(0).unwrap();
            pinned.push(PageId::new(0, page_no));
        }

        let result = pool.alloc_page(0);
        assert!(matches!(result, Err(CairnError::BufferExceeded)));

        // Unpinning one page makes the next allocation succeed.
        pool.unpin_page(pinned[1], false).unwrap();
        assert!(pool.alloc_page(0).is_ok());
    }

    #[test]
    fn test_clock_evicts_first_unreferenced_frame() {
        let (pool, _disk) = pool_with(2);

        let a = seed_page(&pool, 0, b'A');
        let b = seed_page(&pool, 0, b'B');

        // Loads leave the reference bit clear, so the hand (parked on
        // frame 1 after the two allocations) wraps to frame 0 and takes
        // A's frame.
        let c = seed_page(&pool, 0, b'C');
        assert!(!pool.contains(a));
        assert!(pool.contains(b));
        assert!(pool.contains(c));
    }

    #[test]
    fn test_reference_bit_grants_second_chance() {
        let (pool, _disk) = pool_with(2);

        let a = seed_page(&pool, 0, b'A');
        let b = seed_page(&pool, 0, b'B');

        // Re-touch A: hit path sets its reference bit.
        pool.read_page(a).unwrap();
        pool.unpin_page(a, false).unwrap();

        let c = seed_page(&pool, 0, b'C');
        assert!(pool.contains(a));
        assert!(!pool.contains(b));
        assert!(pool.contains(c));
    }

    #[test]
    fn test_dirty_page_written_back_on_eviction() {
        let (pool, disk) = pool_with(2);
        let a = seed_page(&pool, 0, 0xD1);

        // Fill the pool with other pages until A is evicted.
        seed_page(&pool, 0, 2);
        seed_page(&pool, 0, 3);
        assert!(!pool.contains(a));

        // The eviction produced exactly one write of A.
        assert_eq!(disk.page(a).unwrap()[0], 0xD1);

        // Re-reading A sees the written-back record.
        let frame = pool.read_page(a).unwrap();
        assert_eq!(frame.read_data()[0], 0xD1);
        pool.unpin_page(a, false).unwrap();
    }

    #[test]
    fn test_flush_writes_dirty_pages_and_clears_frames() {
        let (pool, disk) = pool_with(4);
        let a = seed_page(&pool, 0, 0x11);
        let b = seed_page(&pool, 0, 0x22);

        pool.flush_file(0).unwrap();

        assert!(!pool.contains(a));
        assert!(!pool.contains(b));
        assert_eq!(disk.page(a).unwrap()[0], 0x11);
        assert_eq!(disk.page(b).unwrap()[0], 0x22);
        assert_eq!(pool.stats().snapshot().disk_writes, 2);
    }

    #[test]
    fn test_flush_skips_other_files() {
        let (pool, _disk) = pool_with(4);
        let a = seed_page(&pool, 0, 1);
        let b = seed_page(&pool, 7, 2);

        pool.flush_file(0).unwrap();
        assert!(!pool.contains(a));
        assert!(pool.contains(b));
    }

    #[test]
    fn test_flush_while_pinned_fails_then_succeeds() {
        let (pool, _disk) = pool_with(4);
        let (page_no, _) = pool.alloc_page(0).unwrap();
        let page_id = PageId::new(0, page_no);

        let result = pool.flush_file(0);
        assert!(matches!(result, Err(CairnError::PagePinned { .. })));

        pool.unpin_page(page_id, false).unwrap();
        pool.flush_file(0).unwrap();
        assert!(!pool.contains(page_id));
    }

    #[test]
    fn test_flush_then_read_returns_last_written_bytes() {
        let (pool, _disk) = pool_with(2);
        let page_id = seed_page(&pool, 0, 0x77);

        pool.flush_file(0).unwrap();

        let frame = pool.read_page(page_id).unwrap();
        assert_eq!(frame.read_data()[0], 0x77);
        pool.unpin_page(page_id, false).unwrap();
    }

    #[test]
    fn test_dispose_unpinned_page() {
        let (pool, disk) = pool_with(4);
        let page_id = seed_page(&pool, 0, 9);

        pool.dispose_page(page_id).unwrap();
        assert!(!pool.contains(page_id));
        assert!(disk.page(page_id).is_none());
    }

    #[test]
    fn test_dispose_pinned_page_fails() {
        let (pool, disk) = pool_with(4);
        let (page_no, _) = pool.alloc_page(0).unwrap();
        let page_id = PageId::new(0, page_no);

        let result = pool.dispose_page(page_id);
        assert!(matches!(result, Err(CairnError::PagePinned { .. })));
        assert!(pool.contains(page_id));
        assert!(disk.page(page_id).is_some());
    }

    #[test]
    fn test_dispose_nonresident_page_deletes_on_disk() {
        let (pool, disk) = pool_with(2);
        let page_id = seed_page(&pool, 0, 1);
        pool.flush_file(0).unwrap();

        pool.dispose_page(page_id).unwrap();
        assert!(disk.page(page_id).is_none());
    }

    #[test]
    fn test_read_pinned_requires_a_pin() {
        let (pool, _disk) = pool_with(2);
        let (page_no, frame) = pool.alloc_page(0).unwrap();
        let page_id = PageId::new(0, page_no);
        frame.write_data()[3] = 0x33;

        let byte = pool.read_pinned(page_id, |data| data[3]).unwrap();
        assert_eq!(byte, 0x33);

        pool.unpin_page(page_id, true).unwrap();
        let result = pool.read_pinned(page_id, |data| data[3]);
        assert!(matches!(result, Err(CairnError::PageNotPinned { .. })));
    }

    #[test]
    fn test_guards_unpin_on_drop() {
        let (pool, _disk) = pool_with(2);
        let page_id = seed_page(&pool, 0, 0);

        {
            let guard = pool.fetch_write(page_id).unwrap();
            guard.data_mut()[1] = 0x44;
            assert_eq!(pool.pin_count(page_id), Some(1));
        }
        assert_eq!(pool.pin_count(page_id), Some(0));

        {
            let guard = pool.fetch_read(page_id).unwrap();
            assert_eq!(guard.data()[1], 0x44);
        }
        assert_eq!(pool.pin_count(page_id), Some(0));
    }

    #[test]
    fn test_drop_writes_back_dirty_pages_for_open_files() {
        let disk = Arc::new(MemFile::default());
        let page_id;
        {
            let pool = BufferManager::new(2, disk.clone());
            let (page_no, frame) = pool.alloc_page(0).unwrap();
            frame.write_data()[0] = 0xEE;
            page_id = PageId::new(0, page_no);
            pool.unpin_page(page_id, true).unwrap();
            // Pool dropped with the dirty page still resident.
        }
        assert_eq!(disk.page(page_id).unwrap()[0], 0xEE);
    }

    #[test]
    fn test_drop_skips_closed_files() {
        let disk = Arc::new(MemFile::default());
        let page_id;
        {
            let pool = BufferManager::new(2, disk.clone());
            let (page_no, frame) = pool.alloc_page(0).unwrap();
            frame.write_data()[0] = 0xEE;
            page_id = PageId::new(0, page_no);
            pool.unpin_page(page_id, true).unwrap();
            disk.close(0);
        }
        // The backing store still has the zeroed allocation image only.
        assert_eq!(disk.page(page_id).unwrap()[0], 0);
    }

    #[test]
    fn test_stats_count_reads_and_writes() {
        let (pool, _disk) = pool_with(2);
        let a = seed_page(&pool, 0, 1);
        pool.flush_file(0).unwrap();

        pool.read_page(a).unwrap();
        pool.unpin_page(a, false).unwrap();

        let snap = pool.stats().snapshot();
        assert_eq!(snap.disk_reads, 1);
        assert_eq!(snap.disk_writes, 1);
        assert!(snap.accesses >= 4);
    }
}
