//! Page table mapping resident pages to frames.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::frame::FrameId;
use cairn_common::PageId;

/// Residency map from `(file_id, page_no)` to the frame holding the page.
///
/// Kept consistent with the frame directory by the buffer manager: an
/// entry exists exactly while some frame holds the page. Lookup misses
/// are `None` and are recovered locally by the callers.
pub struct PageTable {
    map: Mutex<HashMap<PageId, FrameId>>,
}

impl PageTable {
    /// Creates an empty page table sized for the given frame count.
    pub fn new(capacity: usize) -> Self {
        Self {
            map: Mutex::new(HashMap::with_capacity(capacity)),
        }
    }

    /// Looks up the frame holding a page.
    pub fn get(&self, page_id: PageId) -> Option<FrameId> {
        self.map.lock().get(&page_id).copied()
    }

    /// Inserts a page-to-frame mapping, replacing any previous one.
    pub fn insert(&self, page_id: PageId, frame_id: FrameId) {
        self.map.lock().insert(page_id, frame_id);
    }

    /// Removes a mapping. Returns the frame it pointed to, if any.
    pub fn remove(&self, page_id: PageId) -> Option<FrameId> {
        self.map.lock().remove(&page_id)
    }

    /// Returns true if the page is resident.
    pub fn contains(&self, page_id: PageId) -> bool {
        self.map.lock().contains_key(&page_id)
    }

    /// Returns the number of resident pages.
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    /// Returns true if no pages are resident.
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Returns all entries belonging to one file, sorted by page number.
    ///
    /// Sorted so that flush visits pages in a deterministic order.
    pub fn entries_for_file(&self, file_id: u32) -> Vec<(PageId, FrameId)> {
        let map = self.map.lock();
        let mut entries: Vec<_> = map
            .iter()
            .filter(|(pid, _)| pid.file_id == file_id)
            .map(|(pid, fid)| (*pid, *fid))
            .collect();
        entries.sort_by_key(|(pid, _)| pid.page_no);
        entries
    }
}
