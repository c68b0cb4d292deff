//! Index metadata and scan types.

use cairn_common::PageNo;

/// Data type of an indexed attribute.
///
/// Only `Integer` is indexable; the other variants exist so catalog
/// metadata round-trips and mismatches are detectable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum AttrType {
    Integer = 0,
    Double = 1,
    String = 2,
}

impl AttrType {
    /// Returns the on-disk enum value.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Comparison operator bounding one side of a range scan.
///
/// The low bound accepts `Gt`/`Gte`, the high bound `Lt`/`Lte`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

/// Persistent index header, stored in the first page of the index
/// file.
///
/// Layout (36 bytes, little-endian, no padding):
/// - relation_name: 20 bytes, NUL-padded
/// - attr_byte_offset: u32
/// - attr_type: u32
/// - root_page_no: u32
/// - initial_root_page_no: u32
///
/// `initial_root_page_no` never changes after the build; while it
/// equals `root_page_no` the root is still the original leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMeta {
    /// NUL-padded name of the indexed relation.
    pub relation_name: [u8; 20],
    /// Byte offset of the key inside each record.
    pub attr_byte_offset: u32,
    /// On-disk value of the attribute type enum.
    pub attr_type: u32,
    /// Current root page.
    pub root_page_no: PageNo,
    /// The leaf the tree was created with.
    pub initial_root_page_no: PageNo,
}

impl IndexMeta {
    /// Serialized size in bytes.
    pub const SIZE: usize = 36;

    /// Creates a meta header; the relation name is truncated to 20
    /// bytes and NUL-padded.
    pub fn new(
        relation_name: &str,
        attr_byte_offset: u32,
        attr_type: AttrType,
        root_page_no: PageNo,
        initial_root_page_no: PageNo,
    ) -> Self {
        let mut name = [0u8; 20];
        let bytes = relation_name.as_bytes();
        let len = bytes.len().min(20);
        name[..len].copy_from_slice(&bytes[..len]);
        Self {
            relation_name: name,
            attr_byte_offset,
            attr_type: attr_type.as_u32(),
            root_page_no,
            initial_root_page_no,
        }
    }

    /// Returns the relation name up to its NUL padding.
    pub fn relation_name(&self) -> &str {
        let end = self
            .relation_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(20);
        std::str::from_utf8(&self.relation_name[..end]).unwrap_or("")
    }

    /// Writes the header into a page buffer.
    pub fn encode(&self, data: &mut [u8]) {
        data[0..20].copy_from_slice(&self.relation_name);
        data[20..24].copy_from_slice(&self.attr_byte_offset.to_le_bytes());
        data[24..28].copy_from_slice(&self.attr_type.to_le_bytes());
        data[28..32].copy_from_slice(&self.root_page_no.to_le_bytes());
        data[32..36].copy_from_slice(&self.initial_root_page_no.to_le_bytes());
    }

    /// Reads the header from a page buffer.
    pub fn decode(data: &[u8]) -> Self {
        let mut relation_name = [0u8; 20];
        relation_name.copy_from_slice(&data[0..20]);
        Self {
            relation_name,
            attr_byte_offset: u32::from_le_bytes([data[20], data[21], data[22], data[23]]),
            attr_type: u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
            root_page_no: u32::from_le_bytes([data[28], data[29], data[30], data[31]]),
            initial_root_page_no: u32::from_le_bytes([data[32], data[33], data[34], data[35]]),
        }
    }
}
