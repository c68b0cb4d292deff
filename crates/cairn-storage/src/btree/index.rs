//! B+-tree index over 32-bit integer keys.

use std::sync::Arc;

use log::{debug, info, warn};

use super::constants::NodeGeometry;
use super::node::{internal_probe, leaf, lower_bound, InternalNode, LeafNode};
use super::types::{AttrType, IndexMeta, ScanOp};
use crate::disk::DiskManager;
use crate::heap::HeapFile;
use cairn_buffer::{BufferManager, PagedFile};
use cairn_common::{CairnError, PageId, PageNo, RecordId, Result, INVALID_PAGE_NO};

/// State of an executing range scan.
///
/// The current leaf stays pinned for the lifetime of the scan.
struct ScanState {
    #[allow(dead_code)]
    low: i32,
    high: i32,
    #[allow(dead_code)]
    low_op: ScanOp,
    high_op: ScanOp,
    current_page_no: PageNo,
    next_entry: usize,
}

/// Disk-resident B+-tree index over a relation's integer attribute.
///
/// The index file is named `"{relation}.{attr_byte_offset}"`. Its
/// first page is the [`IndexMeta`] header; the tree starts as a single
/// empty leaf and the root stays a leaf until the first split, which
/// is exactly the period where `root_page_no` equals
/// `initial_root_page_no`.
///
/// Every node access is routed through the buffer pool, and every
/// operation returns with the same set of pages pinned as when it was
/// entered (a running scan holds one leaf pin by design).
///
/// Errors during a split unwind all pins but do not roll back pages
/// already written; a failed split can leave the on-disk tree
/// inconsistent. Under normal use split-time errors cannot occur.
pub struct BTreeIndex {
    index_name: String,
    buf: Arc<BufferManager>,
    disk: Arc<DiskManager>,
    file_id: u32,
    header_page_no: PageNo,
    root_page_no: PageNo,
    initial_root_page_no: PageNo,
    geometry: NodeGeometry,
    scan: Option<ScanState>,
    closed: bool,
}

impl BTreeIndex {
    /// Opens the index for `relation_name` keyed by the 4-byte integer
    /// at `attr_byte_offset`, building it from the relation's heap
    /// file if the index file does not exist yet.
    ///
    /// Fails with `BadIndexInfo` if an existing index file's metadata
    /// does not match the arguments, or if `attr_type` is not
    /// `Integer`.
    pub fn open(
        relation_name: &str,
        buf: Arc<BufferManager>,
        disk: Arc<DiskManager>,
        attr_byte_offset: u32,
        attr_type: AttrType,
    ) -> Result<Self> {
        Self::open_with_geometry(
            relation_name,
            buf,
            disk,
            attr_byte_offset,
            attr_type,
            NodeGeometry::default(),
        )
    }

    /// [`open`](Self::open) with explicit node arities. The geometry
    /// must match across reopens of the same index file.
    pub fn open_with_geometry(
        relation_name: &str,
        buf: Arc<BufferManager>,
        disk: Arc<DiskManager>,
        attr_byte_offset: u32,
        attr_type: AttrType,
        geometry: NodeGeometry,
    ) -> Result<Self> {
        let index_name = format!("{relation_name}.{attr_byte_offset}");

        if attr_type != AttrType::Integer {
            return Err(CairnError::BadIndexInfo { index_name });
        }

        if disk.exists(&index_name) {
            Self::open_existing(
                relation_name,
                index_name,
                buf,
                disk,
                attr_byte_offset,
                attr_type,
                geometry,
            )
        } else {
            Self::build(
                relation_name,
                index_name,
                buf,
                disk,
                attr_byte_offset,
                attr_type,
                geometry,
            )
        }
    }

    fn open_existing(
        relation_name: &str,
        index_name: String,
        buf: Arc<BufferManager>,
        disk: Arc<DiskManager>,
        attr_byte_offset: u32,
        attr_type: AttrType,
        geometry: NodeGeometry,
    ) -> Result<Self> {
        let file_id = disk.open(&index_name)?;
        let header_page_no = disk.first_page_no(file_id)?;
        let header_id = PageId::new(file_id, header_page_no);

        let frame = buf.read_page(header_id)?;
        let meta = IndexMeta::decode(&frame.read_data()[..]);
        buf.unpin_page(header_id, false)?;

        if meta.relation_name() != relation_name
            || meta.attr_byte_offset != attr_byte_offset
            || meta.attr_type != attr_type.as_u32()
        {
            return Err(CairnError::BadIndexInfo { index_name });
        }

        debug!("opened index {index_name} with root page {}", meta.root_page_no);
        Ok(Self {
            index_name,
            buf,
            disk,
            file_id,
            header_page_no,
            root_page_no: meta.root_page_no,
            initial_root_page_no: meta.initial_root_page_no,
            geometry,
            scan: None,
            closed: false,
        })
    }

    fn build(
        relation_name: &str,
        index_name: String,
        buf: Arc<BufferManager>,
        disk: Arc<DiskManager>,
        attr_byte_offset: u32,
        attr_type: AttrType,
        geometry: NodeGeometry,
    ) -> Result<Self> {
        let file_id = disk.create(&index_name)?;

        let (header_page_no, header_frame) = buf.alloc_page(file_id)?;
        let (root_page_no, root_frame) = buf.alloc_page(file_id)?;

        LeafNode::new().encode(&mut root_frame.write_data()[..], geometry.leaf_capacity);
        let meta = IndexMeta::new(
            relation_name,
            attr_byte_offset,
            attr_type,
            root_page_no,
            root_page_no,
        );
        meta.encode(&mut header_frame.write_data()[..]);

        buf.unpin_page(PageId::new(file_id, root_page_no), true)?;
        buf.unpin_page(PageId::new(file_id, header_page_no), true)?;

        let mut index = Self {
            index_name,
            buf: buf.clone(),
            disk: disk.clone(),
            file_id,
            header_page_no,
            root_page_no,
            initial_root_page_no: root_page_no,
            geometry,
            scan: None,
            closed: false,
        };

        // Populate from the relation's heap file.
        let heap = HeapFile::open(relation_name, buf, disk)?;
        let mut scan = heap.scan()?;
        let mut entries = 0u64;
        loop {
            match scan.next_record() {
                Ok((rid, record)) => {
                    let key = extract_key(&record, attr_byte_offset)?;
                    index.insert_entry(key, rid)?;
                    entries += 1;
                }
                Err(CairnError::EndOfFile) => break,
                Err(e) => return Err(e),
            }
        }

        info!("built index {} with {entries} entries", index.index_name);
        Ok(index)
    }

    /// Returns the index file name.
    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Returns the file id of the index file in the buffer pool.
    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    /// Returns the current root page.
    pub fn root_page_no(&self) -> PageNo {
        self.root_page_no
    }

    /// Returns true while the root is still the original leaf.
    pub fn is_root_leaf(&self) -> bool {
        self.root_page_no == self.initial_root_page_no
    }

    #[inline]
    fn page_id(&self, page_no: PageNo) -> PageId {
        PageId::new(self.file_id, page_no)
    }

    // -----------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------

    /// Inserts a `(key, rid)` entry, splitting nodes as needed.
    ///
    /// Duplicate keys are allowed.
    pub fn insert_entry(&mut self, key: i32, rid: RecordId) -> Result<()> {
        let root_is_leaf = self.is_root_leaf();
        let split = self.insert_into(self.root_page_no, root_is_leaf, key, rid)?;
        if let Some((split_key, new_page_no)) = split {
            self.grow_root(split_key, new_page_no)?;
        }
        Ok(())
    }

    /// Recursive descent. Returns the `(separator, new sibling)` pair
    /// the parent must install when this level split, or None.
    fn insert_into(
        &self,
        page_no: PageNo,
        is_leaf: bool,
        key: i32,
        rid: RecordId,
    ) -> Result<Option<(i32, PageNo)>> {
        if is_leaf {
            self.insert_into_leaf(page_no, key, rid)
        } else {
            self.insert_into_internal(page_no, key, rid)
        }
    }

    fn insert_into_leaf(
        &self,
        page_no: PageNo,
        key: i32,
        rid: RecordId,
    ) -> Result<Option<(i32, PageNo)>> {
        let cap = self.geometry.leaf_capacity;
        let page_id = self.page_id(page_no);
        let frame = self.buf.read_page(page_id)?;
        let mut node = LeafNode::decode(&frame.read_data()[..], cap);

        let i = lower_bound(&node.keys, key);

        if node.keys.len() < cap {
            node.keys.insert(i, key);
            node.rids.insert(i, rid);
            node.encode(&mut frame.write_data()[..], cap);
            self.buf.unpin_page(page_id, true)?;
            return Ok(None);
        }

        // Leaf is full: split, then insert into the half that owns
        // position i. An entry landing exactly on the midpoint becomes
        // the first key of the new right sibling.
        let (new_page_no, new_frame) = match self.buf.alloc_page(self.file_id) {
            Ok(v) => v,
            Err(e) => {
                let _ = self.buf.unpin_page(page_id, false);
                return Err(e);
            }
        };

        let mid = cap / 2;
        let left_len = mid + usize::from(i > mid);

        let mut right = LeafNode {
            keys: node.keys.split_off(left_len),
            rids: node.rids.split_off(left_len),
            right_sib: node.right_sib,
        };
        node.right_sib = new_page_no;

        if i < left_len {
            node.keys.insert(i, key);
            node.rids.insert(i, rid);
        } else {
            right.keys.insert(i - left_len, key);
            right.rids.insert(i - left_len, rid);
        }

        let split_key = right.keys[0];
        node.encode(&mut frame.write_data()[..], cap);
        right.encode(&mut new_frame.write_data()[..], cap);

        debug!("split leaf {page_no}, new sibling {new_page_no}, separator {split_key}");

        self.buf.unpin_page(page_id, true)?;
        self.buf.unpin_page(self.page_id(new_page_no), true)?;
        Ok(Some((split_key, new_page_no)))
    }

    fn insert_into_internal(
        &self,
        page_no: PageNo,
        key: i32,
        rid: RecordId,
    ) -> Result<Option<(i32, PageNo)>> {
        let cap = self.geometry.internal_capacity;
        let page_id = self.page_id(page_no);
        let frame = self.buf.read_page(page_id)?;
        let mut node = InternalNode::decode(&frame.read_data()[..], cap);

        let child_idx = lower_bound(&node.keys, key);
        let child = node.children[child_idx];
        let child_is_leaf = node.level == 1;

        // The node stays pinned while the child works, so the frame
        // cannot be recycled under the decoded copy.
        let child_split = match self.insert_into(child, child_is_leaf, key, rid) {
            Ok(split) => split,
            Err(e) => {
                let _ = self.buf.unpin_page(page_id, false);
                return Err(e);
            }
        };

        let Some((split_key, split_page_no)) = child_split else {
            self.buf.unpin_page(page_id, false)?;
            return Ok(None);
        };

        let j = lower_bound(&node.keys, split_key);

        if node.keys.len() < cap {
            node.keys.insert(j, split_key);
            node.children.insert(j + 1, split_page_no);
            node.encode(&mut frame.write_data()[..], cap);
            self.buf.unpin_page(page_id, true)?;
            return Ok(None);
        }

        // Full internal node: split. The right half is built in a
        // transient shape where children[i] is the subtree at or
        // above keys[i]; promoting its first key restores the normal
        // one-more-child-than-keys shape.
        let (new_page_no, new_frame) = match self.buf.alloc_page(self.file_id) {
            Ok(v) => v,
            Err(e) => {
                let _ = self.buf.unpin_page(page_id, false);
                return Err(e);
            }
        };

        let mid = cap / 2;
        let left_len = mid + usize::from(j > mid);

        let mut right_keys = node.keys.split_off(left_len);
        let mut right_children = node.children.split_off(left_len + 1);

        if j < left_len {
            node.keys.insert(j, split_key);
            node.children.insert(j + 1, split_page_no);
        } else {
            let idx = j - left_len;
            right_keys.insert(idx, split_key);
            right_children.insert(idx, split_page_no);
        }

        let promoted = right_keys.remove(0);
        let right = InternalNode {
            level: node.level,
            keys: right_keys,
            children: right_children,
        };

        node.encode(&mut frame.write_data()[..], cap);
        right.encode(&mut new_frame.write_data()[..], cap);

        debug!("split internal {page_no}, new sibling {new_page_no}, promoted {promoted}");

        self.buf.unpin_page(page_id, true)?;
        self.buf.unpin_page(self.page_id(new_page_no), true)?;
        Ok(Some((promoted, new_page_no)))
    }

    /// Installs a new root above the old one after a root split.
    fn grow_root(&mut self, split_key: i32, right: PageNo) -> Result<()> {
        let level = if self.is_root_leaf() { 1 } else { 0 };

        let (new_root_no, frame) = self.buf.alloc_page(self.file_id)?;
        let root = InternalNode {
            level,
            keys: vec![split_key],
            children: vec![self.root_page_no, right],
        };
        root.encode(&mut frame.write_data()[..], self.geometry.internal_capacity);
        self.buf.unpin_page(self.page_id(new_root_no), true)?;

        debug!(
            "root split: {} -> {new_root_no} (separator {split_key})",
            self.root_page_no
        );
        self.root_page_no = new_root_no;

        // Record the new root in the meta page.
        let header_id = self.page_id(self.header_page_no);
        let frame = self.buf.read_page(header_id)?;
        let mut meta = IndexMeta::decode(&frame.read_data()[..]);
        meta.root_page_no = new_root_no;
        meta.encode(&mut frame.write_data()[..]);
        self.buf.unpin_page(header_id, true)?;

        Ok(())
    }

    // -----------------------------------------------------------------
    // Lookup and range scan
    // -----------------------------------------------------------------

    /// Descends to the leaf that may contain `key`, following the
    /// first child whose separator strictly exceeds the key. Each
    /// internal node is unpinned as soon as its child is chosen.
    fn locate_leaf(&self, key: i32) -> Result<PageNo> {
        if self.is_root_leaf() {
            return Ok(self.root_page_no);
        }

        let mut page_no = self.root_page_no;
        loop {
            let page_id = self.page_id(page_no);
            let frame = self.buf.read_page(page_id)?;
            let (level, child) = internal_probe(
                &frame.read_data()[..],
                self.geometry.internal_capacity,
                key,
            );
            self.buf.unpin_page(page_id, false)?;

            if level == 1 {
                return Ok(child);
            }
            page_no = child;
        }
    }

    /// Returns the record id of the first entry equal to `key`, or
    /// `NoSuchKeyFound`.
    pub fn lookup(&self, key: i32) -> Result<RecordId> {
        let leaf_no = self.locate_leaf(key)?;
        let page_id = self.page_id(leaf_no);
        let frame = self.buf.read_page(page_id)?;
        let node = LeafNode::decode(&frame.read_data()[..], self.geometry.leaf_capacity);
        self.buf.unpin_page(page_id, false)?;

        let i = lower_bound(&node.keys, key);
        if i < node.keys.len() && node.keys[i] == key {
            Ok(node.rids[i])
        } else {
            Err(CairnError::NoSuchKeyFound { key })
        }
    }

    /// Positions a range scan on the first entry inside the bounds.
    ///
    /// `low_op` must be `Gt` or `Gte` and `high_op` must be `Lt` or
    /// `Lte`, else `BadOpcodes`; `low > high` is `BadScanrange`. The
    /// located leaf stays pinned until `end_scan`. A scan already in
    /// progress is ended first.
    pub fn start_scan(
        &mut self,
        low: i32,
        low_op: ScanOp,
        high: i32,
        high_op: ScanOp,
    ) -> Result<()> {
        if !matches!(low_op, ScanOp::Gt | ScanOp::Gte)
            || !matches!(high_op, ScanOp::Lt | ScanOp::Lte)
        {
            return Err(CairnError::BadOpcodes);
        }
        if low > high {
            return Err(CairnError::BadScanrange { low, high });
        }

        if self.scan.is_some() {
            self.end_scan()?;
        }

        let leaf_no = self.locate_leaf(low)?;
        let leaf_id = self.page_id(leaf_no);

        // Pin held for the duration of the scan.
        self.buf.read_page(leaf_id)?;

        let next_entry = self.buf.read_pinned(leaf_id, |data| {
            let n = leaf::key_num(data);
            (0..n)
                .find(|&i| {
                    let k = leaf::key_at(data, i);
                    match low_op {
                        ScanOp::Gt => low < k,
                        _ => low <= k,
                    }
                })
                .unwrap_or(n)
        })?;

        self.scan = Some(ScanState {
            low,
            high,
            low_op,
            high_op,
            current_page_no: leaf_no,
            next_entry,
        });
        Ok(())
    }

    /// Returns the next record id in the scan range.
    ///
    /// Signals the end of the range with `IndexScanCompleted`; the
    /// scan stays open (and its leaf pinned) until `end_scan`.
    pub fn scan_next(&mut self) -> Result<RecordId> {
        let cap = self.geometry.leaf_capacity;
        let file_id = self.file_id;

        let Some(scan) = self.scan.as_mut() else {
            return Err(CairnError::ScanNotInitialized);
        };

        let cur_id = PageId::new(file_id, scan.current_page_no);
        let (key_num, right_sib) =
            self.buf.read_pinned(cur_id, |data| (leaf::key_num(data), leaf::right_sib(data)))?;

        if scan.next_entry >= key_num {
            // Exhausted this leaf; move to the sibling chain.
            if right_sib == INVALID_PAGE_NO {
                return Err(CairnError::IndexScanCompleted);
            }
            self.buf.unpin_page(cur_id, false)?;
            let sib_id = PageId::new(file_id, right_sib);
            self.buf.read_page(sib_id)?;
            scan.current_page_no = right_sib;
            scan.next_entry = 0;
        }

        let cur_id = PageId::new(file_id, scan.current_page_no);
        let entry = scan.next_entry;
        let (key, rid) = self
            .buf
            .read_pinned(cur_id, |data| (leaf::key_at(data, entry), leaf::rid_at(data, cap, entry)))?;

        let past_high = match scan.high_op {
            ScanOp::Lt => key >= scan.high,
            _ => key > scan.high,
        };
        if past_high {
            return Err(CairnError::IndexScanCompleted);
        }

        scan.next_entry += 1;
        Ok(rid)
    }

    /// Ends the scan, unpinning its leaf.
    pub fn end_scan(&mut self) -> Result<()> {
        let Some(scan) = self.scan.take() else {
            return Err(CairnError::ScanNotInitialized);
        };
        self.buf
            .unpin_page(PageId::new(self.file_id, scan.current_page_no), false)
    }

    /// Returns true while a scan is executing.
    pub fn scan_executing(&self) -> bool {
        self.scan.is_some()
    }

    // -----------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------

    /// Ends any running scan, flushes the index file through the
    /// buffer pool, and closes the file handle. Does not unlink the
    /// index file.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.scan.is_some() {
            self.end_scan()?;
        }
        self.buf.flush_file(self.file_id)?;
        self.disk.close(self.file_id)?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for BTreeIndex {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!("closing index {} failed: {e}", self.index_name);
            }
        }
    }
}

/// Extracts the 4-byte little-endian key at `attr_byte_offset` from a
/// record.
fn extract_key(record: &[u8], attr_byte_offset: u32) -> Result<i32> {
    let offset = attr_byte_offset as usize;
    let bytes = record.get(offset..offset + 4).ok_or_else(|| {
        CairnError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "record of {} bytes has no key at offset {offset}",
                record.len()
            ),
        ))
    })?;
    Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
