//! Page header structures.
//!
//! Every header starts with `{length: i16, page_type: u8, size_range: u8}`;
//! type-specific fields begin at offset 4. Layouts:
//! ```text
//! Heading         version@4:i32 page_size@8:i32 fsm@12:i64 root@20:i64 method@28:i16
//! FreeSpaceMap    prev@4:i64 next@12:i64 base@20:i64
//! FixedSizeItems  empty_slots@4:i16 item_count@6:i16 first_empty@8:i16
//! MultipageItem   start@4:i64 prev@12:i64 next@20:i64
//! BPlusTreeNode   parent@4:i64 prev@12:i64 next@20:i64 leaf@28:u8
//! RadixTreeNode   free_space@4:i32 item_count@8:i16
//! ```

use crate::error::{Result, StorageError};
use crate::page::{read_i16, read_i32, read_i64, write_i16, write_i32, write_i64};
use crate::types::{AccessMethod, PageIndex, PageType, SizeRange};

/// Length of the common header prefix
pub const BASE_HEADER_LEN: usize = 4;
pub const HEADING_HEADER_LEN: usize = 30;
pub const FSM_HEADER_LEN: usize = 28;
pub const FIXED_SIZE_ITEMS_HEADER_LEN: usize = 10;
pub const MULTIPAGE_ITEM_HEADER_LEN: usize = 28;
pub const BPLUS_TREE_NODE_HEADER_LEN: usize = 29;
pub const RADIX_TREE_NODE_HEADER_LEN: usize = 10;

const OFF_LENGTH: usize = 0;
const OFF_PAGE_TYPE: usize = 2;
const OFF_SIZE_RANGE: usize = 3;

/// Storage heading, always page 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadingHeader {
    pub on_disk_version: i32,
    pub page_size: i32,
    pub fsm_page_index: PageIndex,
    pub access_method_page_index: PageIndex,
    pub access_method: AccessMethod,
}

/// Header of a free-space map chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmHeader {
    pub previous_page_index: PageIndex,
    pub next_page_index: PageIndex,
    /// First data page whose entry lives on this chunk
    pub base_page_index: PageIndex,
}

/// Header of a page holding slots of one size range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSizeItemsHeader {
    pub size_range: SizeRange,
    /// Deleted slots among the first `item_count`
    pub empty_slot_count: i16,
    /// Slots ever used (live or deleted)
    pub item_count: i16,
    /// Most recently deleted slot, head of the empty-slot chain (-1 if none)
    pub first_empty_slot: i16,
}

/// Header of one page in a multi-page item chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultipageItemHeader {
    pub start_page_index: PageIndex,
    pub previous_page_index: PageIndex,
    pub next_page_index: PageIndex,
}

/// Header of a B+Tree node page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub parent_page_index: PageIndex,
    pub previous_page_index: PageIndex,
    pub next_page_index: PageIndex,
    pub is_leaf: bool,
}

/// Header of a page holding variable-size items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadixTreeNodeHeader {
    pub free_space: i32,
    pub item_count: i16,
}

/// Any page header, tagged by the page type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageHeader {
    Heading(HeadingHeader),
    FreeSpaceMap(FsmHeader),
    FixedSizeItems(FixedSizeItemsHeader),
    MultipageItem(MultipageItemHeader),
    BPlusTreeNode(NodeHeader),
    RadixTreeNode(RadixTreeNodeHeader),
}

impl PageHeader {
    /// Page type of this header
    pub fn page_type(&self) -> PageType {
        match self {
            Self::Heading(_) => PageType::Heading,
            Self::FreeSpaceMap(_) => PageType::FreeSpaceMap,
            Self::FixedSizeItems(_) => PageType::FixedSizeItems,
            Self::MultipageItem(_) => PageType::MultipageItem,
            Self::BPlusTreeNode(_) => PageType::BPlusTreeNode,
            Self::RadixTreeNode(_) => PageType::RadixTreeNode,
        }
    }

    /// Size range stored in the header
    pub fn size_range(&self) -> SizeRange {
        match self {
            Self::FixedSizeItems(h) => h.size_range,
            Self::MultipageItem(_) => SizeRange::MultiPage,
            _ => SizeRange::NotApplicable,
        }
    }

    /// Header length in bytes
    pub fn length(&self) -> usize {
        header_len(self.page_type())
    }

    /// Read whichever header the page carries
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let page_type = read_page_type(bytes)?;
        let header = match page_type {
            PageType::Heading => Self::Heading(HeadingHeader::read(bytes)?),
            PageType::FreeSpaceMap => Self::FreeSpaceMap(FsmHeader::read(bytes)?),
            PageType::FixedSizeItems => Self::FixedSizeItems(FixedSizeItemsHeader::read(bytes)?),
            PageType::MultipageItem => Self::MultipageItem(MultipageItemHeader::read(bytes)?),
            PageType::BPlusTreeNode => Self::BPlusTreeNode(NodeHeader::read(bytes)?),
            PageType::RadixTreeNode => Self::RadixTreeNode(RadixTreeNodeHeader::read(bytes)?),
        };
        Ok(header)
    }

    /// Write this header to the start of the page
    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        match self {
            Self::Heading(h) => h.write(bytes),
            Self::FreeSpaceMap(h) => h.write(bytes),
            Self::FixedSizeItems(h) => h.write(bytes),
            Self::MultipageItem(h) => h.write(bytes),
            Self::BPlusTreeNode(h) => h.write(bytes),
            Self::RadixTreeNode(h) => h.write(bytes),
        }
    }
}

/// Header length for a page type
pub fn header_len(page_type: PageType) -> usize {
    match page_type {
        PageType::Heading => HEADING_HEADER_LEN,
        PageType::FreeSpaceMap => FSM_HEADER_LEN,
        PageType::FixedSizeItems => FIXED_SIZE_ITEMS_HEADER_LEN,
        PageType::MultipageItem => MULTIPAGE_ITEM_HEADER_LEN,
        PageType::BPlusTreeNode => BPLUS_TREE_NODE_HEADER_LEN,
        PageType::RadixTreeNode => RADIX_TREE_NODE_HEADER_LEN,
    }
}

/// Read the page type discriminant
pub fn read_page_type(bytes: &[u8]) -> Result<PageType> {
    if bytes.len() < BASE_HEADER_LEN {
        return Err(StorageError::page_format("page too short for a header"));
    }
    PageType::from_byte(bytes[OFF_PAGE_TYPE]).ok_or_else(|| {
        StorageError::page_format(format!("unknown page type {}", bytes[OFF_PAGE_TYPE]))
    })
}

/// Read the size range byte
pub fn read_size_range(bytes: &[u8]) -> Result<SizeRange> {
    if bytes.len() < BASE_HEADER_LEN {
        return Err(StorageError::page_format("page too short for a header"));
    }
    SizeRange::from_byte(bytes[OFF_SIZE_RANGE]).ok_or_else(|| {
        StorageError::page_format(format!("unknown size range {}", bytes[OFF_SIZE_RANGE]))
    })
}

/// Validate the common prefix against the expected type and return it
fn read_base(bytes: &[u8], expected: PageType) -> Result<SizeRange> {
    let page_type = read_page_type(bytes)?;
    if page_type != expected {
        return Err(StorageError::page_format(format!(
            "expected {:?} header, found {:?}",
            expected, page_type
        )));
    }
    let length = read_i16(bytes, OFF_LENGTH);
    let expected_len = header_len(expected);
    if length as usize != expected_len || bytes.len() < expected_len {
        return Err(StorageError::page_format(format!(
            "{:?} header length {} (expected {})",
            expected, length, expected_len
        )));
    }
    read_size_range(bytes)
}

fn write_base(bytes: &mut [u8], page_type: PageType, size_range: SizeRange) -> Result<()> {
    let len = header_len(page_type);
    if bytes.len() < len {
        return Err(StorageError::page_format(format!(
            "page of {} bytes cannot hold a {:?} header",
            bytes.len(),
            page_type
        )));
    }
    write_i16(bytes, OFF_LENGTH, len as i16);
    bytes[OFF_PAGE_TYPE] = page_type as u8;
    bytes[OFF_SIZE_RANGE] = size_range as u8;
    Ok(())
}

fn expect_range(found: SizeRange, expected: SizeRange, page_type: PageType) -> Result<()> {
    if found != expected {
        return Err(StorageError::page_format(format!(
            "{:?} page has size range {:?}, expected {:?}",
            page_type, found, expected
        )));
    }
    Ok(())
}

impl HeadingHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let range = read_base(bytes, PageType::Heading)?;
        expect_range(range, SizeRange::NotApplicable, PageType::Heading)?;
        let access_method = AccessMethod::from_i16(read_i16(bytes, 28)).ok_or_else(|| {
            StorageError::page_format(format!("unknown access method {}", read_i16(bytes, 28)))
        })?;
        Ok(Self {
            on_disk_version: read_i32(bytes, 4),
            page_size: read_i32(bytes, 8),
            fsm_page_index: PageIndex::new(read_i64(bytes, 12)),
            access_method_page_index: PageIndex::new(read_i64(bytes, 20)),
            access_method,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        write_base(bytes, PageType::Heading, SizeRange::NotApplicable)?;
        write_i32(bytes, 4, self.on_disk_version);
        write_i32(bytes, 8, self.page_size);
        write_i64(bytes, 12, self.fsm_page_index.value());
        write_i64(bytes, 20, self.access_method_page_index.value());
        write_i16(bytes, 28, self.access_method as i16);
        Ok(())
    }
}

impl FsmHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let range = read_base(bytes, PageType::FreeSpaceMap)?;
        expect_range(range, SizeRange::NotApplicable, PageType::FreeSpaceMap)?;
        Ok(Self {
            previous_page_index: PageIndex::new(read_i64(bytes, 4)),
            next_page_index: PageIndex::new(read_i64(bytes, 12)),
            base_page_index: PageIndex::new(read_i64(bytes, 20)),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        write_base(bytes, PageType::FreeSpaceMap, SizeRange::NotApplicable)?;
        write_i64(bytes, 4, self.previous_page_index.value());
        write_i64(bytes, 12, self.next_page_index.value());
        write_i64(bytes, 20, self.base_page_index.value());
        Ok(())
    }
}

impl FixedSizeItemsHeader {
    pub fn new(size_range: SizeRange) -> Self {
        Self {
            size_range,
            empty_slot_count: 0,
            item_count: 0,
            first_empty_slot: -1,
        }
    }

    pub fn read(bytes: &[u8]) -> Result<Self> {
        let size_range = read_base(bytes, PageType::FixedSizeItems)?;
        if size_range.ordinal().is_none() {
            return Err(StorageError::page_format(format!(
                "fixed-size items page with size range {:?}",
                size_range
            )));
        }
        Ok(Self {
            size_range,
            empty_slot_count: read_i16(bytes, 4),
            item_count: read_i16(bytes, 6),
            first_empty_slot: read_i16(bytes, 8),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        if self.size_range.ordinal().is_none() {
            return Err(StorageError::page_format(format!(
                "fixed-size items page with size range {:?}",
                self.size_range
            )));
        }
        write_base(bytes, PageType::FixedSizeItems, self.size_range)?;
        write_i16(bytes, 4, self.empty_slot_count);
        write_i16(bytes, 6, self.item_count);
        write_i16(bytes, 8, self.first_empty_slot);
        Ok(())
    }
}

impl MultipageItemHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let range = read_base(bytes, PageType::MultipageItem)?;
        expect_range(range, SizeRange::MultiPage, PageType::MultipageItem)?;
        Ok(Self {
            start_page_index: PageIndex::new(read_i64(bytes, 4)),
            previous_page_index: PageIndex::new(read_i64(bytes, 12)),
            next_page_index: PageIndex::new(read_i64(bytes, 20)),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        write_base(bytes, PageType::MultipageItem, SizeRange::MultiPage)?;
        write_i64(bytes, 4, self.start_page_index.value());
        write_i64(bytes, 12, self.previous_page_index.value());
        write_i64(bytes, 20, self.next_page_index.value());
        Ok(())
    }
}

impl NodeHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let range = read_base(bytes, PageType::BPlusTreeNode)?;
        expect_range(range, SizeRange::NotApplicable, PageType::BPlusTreeNode)?;
        Ok(Self {
            parent_page_index: PageIndex::new(read_i64(bytes, 4)),
            previous_page_index: PageIndex::new(read_i64(bytes, 12)),
            next_page_index: PageIndex::new(read_i64(bytes, 20)),
            is_leaf: bytes[28] != 0,
        })
    }

    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        write_base(bytes, PageType::BPlusTreeNode, SizeRange::NotApplicable)?;
        write_i64(bytes, 4, self.parent_page_index.value());
        write_i64(bytes, 12, self.previous_page_index.value());
        write_i64(bytes, 20, self.next_page_index.value());
        bytes[28] = u8::from(self.is_leaf);
        Ok(())
    }
}

impl RadixTreeNodeHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        let range = read_base(bytes, PageType::RadixTreeNode)?;
        expect_range(range, SizeRange::NotApplicable, PageType::RadixTreeNode)?;
        Ok(Self {
            free_space: read_i32(bytes, 4),
            item_count: read_i16(bytes, 8),
        })
    }

    pub fn write(&self, bytes: &mut [u8]) -> Result<()> {
        write_base(bytes, PageType::RadixTreeNode, SizeRange::NotApplicable)?;
        write_i32(bytes, 4, self.free_space);
        write_i16(bytes, 8, self.item_count);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(header: PageHeader) {
        let mut bytes = vec![0u8; 4096];
        header.write(&mut bytes).unwrap();
        assert_eq!(read_i16(&bytes, 0) as usize, header.length());
        assert_eq!(bytes[2], header.page_type() as u8);
        assert_eq!(bytes[3], header.size_range() as u8);
        assert_eq!(PageHeader::read(&bytes).unwrap(), header);
    }

    #[test]
    fn test_every_header_roundtrips() {
        roundtrip(PageHeader::Heading(HeadingHeader {
            on_disk_version: 1,
            page_size: 8192,
            fsm_page_index: PageIndex::new(1),
            access_method_page_index: PageIndex::new(77),
            access_method: AccessMethod::BPlusTree,
        }));
        roundtrip(PageHeader::FreeSpaceMap(FsmHeader {
            previous_page_index: PageIndex::new(1),
            next_page_index: PageIndex::NONE,
            base_page_index: PageIndex::new(8136),
        }));
        roundtrip(PageHeader::FixedSizeItems(FixedSizeItemsHeader {
            size_range: SizeRange::Range5,
            empty_slot_count: 3,
            item_count: 12,
            first_empty_slot: 7,
        }));
        roundtrip(PageHeader::MultipageItem(MultipageItemHeader {
            start_page_index: PageIndex::new(10),
            previous_page_index: PageIndex::new(11),
            next_page_index: PageIndex::new(13),
        }));
        roundtrip(PageHeader::BPlusTreeNode(NodeHeader {
            parent_page_index: PageIndex::new(2),
            previous_page_index: PageIndex::NONE,
            next_page_index: PageIndex::new(9),
            is_leaf: true,
        }));
        roundtrip(PageHeader::RadixTreeNode(RadixTreeNodeHeader {
            free_space: 60_000,
            item_count: 4,
        }));
    }

    #[test]
    fn test_heading_field_offsets() {
        let header = HeadingHeader {
            on_disk_version: 1,
            page_size: 4096,
            fsm_page_index: PageIndex::new(1),
            access_method_page_index: PageIndex::new(2),
            access_method: AccessMethod::BPlusTree,
        };
        let mut bytes = vec![0u8; 4096];
        header.write(&mut bytes).unwrap();
        assert_eq!(read_i32(&bytes, 4), 1);
        assert_eq!(read_i32(&bytes, 8), 4096);
        assert_eq!(read_i64(&bytes, 12), 1);
        assert_eq!(read_i64(&bytes, 20), 2);
        assert_eq!(read_i16(&bytes, 28), 1);
    }

    #[test]
    fn test_type_mismatch_is_format_error() {
        let mut bytes = vec![0u8; 4096];
        FixedSizeItemsHeader::new(SizeRange::Range1)
            .write(&mut bytes)
            .unwrap();
        assert!(matches!(
            NodeHeader::read(&bytes),
            Err(StorageError::PageFormat(_))
        ));
    }

    #[test]
    fn test_zero_page_is_rejected() {
        let bytes = vec![0u8; 4096];
        assert!(PageHeader::read(&bytes).is_err());
    }

    #[test]
    fn test_fixed_items_require_single_page_range() {
        let mut bytes = vec![0u8; 4096];
        let header = FixedSizeItemsHeader::new(SizeRange::MultiPage);
        assert!(header.write(&mut bytes).is_err());
    }

    #[test]
    fn test_size_range_mismatch() {
        let mut bytes = vec![0u8; 4096];
        MultipageItemHeader {
            start_page_index: PageIndex::new(1),
            previous_page_index: PageIndex::NONE,
            next_page_index: PageIndex::NONE,
        }
        .write(&mut bytes)
        .unwrap();
        bytes[3] = SizeRange::Range2 as u8;
        assert!(MultipageItemHeader::read(&bytes).is_err());
    }
}
