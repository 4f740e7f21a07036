//! Common types used throughout the storage engine.

mod page_id;
mod reference;

pub use page_id::PageIndex;
pub use reference::{DbItemReference, DB_ITEM_REFERENCE_SIZE};

use serde::{Deserialize, Serialize};

use crate::page::header::FIXED_SIZE_ITEMS_HEADER_LEN;

/// Default page size in bytes (4KB)
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest supported page size
pub const MIN_PAGE_SIZE: usize = 4096;

/// Largest supported page size
pub const MAX_PAGE_SIZE: usize = 65536;

/// Version of the on-disk format written to the heading page
pub const ON_DISK_VERSION: i32 = 1;

/// First page of the free-space map chain in a fresh storage
pub const FIRST_FSM_PAGE_INDEX: PageIndex = PageIndex(1);

/// First access-method page (the initial B+Tree root) in a fresh storage
pub const FIRST_ACCESS_METHOD_PAGE_INDEX: PageIndex = PageIndex(2);

/// Number of single-page size ranges
pub const SIZE_RANGE_COUNT: usize = 12;

/// A size range is eligible for single-page allocation only when at least
/// this many slots of its capacity fit on one page.
pub const MIN_SLOTS_PER_PAGE: usize = 2;

/// Length marker of a slot on a fixed-size-items page
pub const FIXED_SLOT_MARKER_SIZE: usize = 2;

/// Default maximum key length accepted by the B+Tree
pub const DEFAULT_MAX_KEY_SIZE: usize = 128;

/// Default fill factor below which B+Tree nodes are combined
pub const DEFAULT_FILL_FACTOR: f64 = 0.5;

/// Check that a page size is supported
pub fn is_valid_page_size(page_size: usize) -> bool {
    page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

/// Capacity class of an item or a fixed-size-items page.
///
/// `Range0..Range11` hold items of up to `10 * 2^n` bytes. An item's range is
/// fixed when it is created and decides which pages it may live on.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeRange {
    Range0 = 0,
    Range1 = 1,
    Range2 = 2,
    Range3 = 3,
    Range4 = 4,
    Range5 = 5,
    Range6 = 6,
    Range7 = 7,
    Range8 = 8,
    Range9 = 9,
    Range10 = 10,
    Range11 = 11,
    /// Item spans a chain of pages
    MultiPage = 12,
    /// Page does not hold sized items (heading, FSM, tree nodes)
    NotApplicable = 13,
}

impl SizeRange {
    /// All single-page ranges in ascending order
    pub const SINGLE_PAGE: [SizeRange; SIZE_RANGE_COUNT] = [
        Self::Range0,
        Self::Range1,
        Self::Range2,
        Self::Range3,
        Self::Range4,
        Self::Range5,
        Self::Range6,
        Self::Range7,
        Self::Range8,
        Self::Range9,
        Self::Range10,
        Self::Range11,
    ];

    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0..=11 => Some(Self::SINGLE_PAGE[b as usize]),
            12 => Some(Self::MultiPage),
            13 => Some(Self::NotApplicable),
            _ => None,
        }
    }

    /// Ordinal of a single-page range (`None` for `MultiPage`/`NotApplicable`)
    pub fn ordinal(self) -> Option<usize> {
        match self {
            Self::MultiPage | Self::NotApplicable => None,
            range => Some(range as usize),
        }
    }

    /// Slot capacity in bytes of a single-page range
    pub fn capacity(self) -> Option<usize> {
        self.ordinal().map(|n| 10usize << n)
    }

    /// Number of slots of this range that fit on a fixed-size-items page
    pub fn slots_per_page(self, page_size: usize) -> usize {
        match self.capacity() {
            Some(capacity) => {
                page_size.saturating_sub(FIXED_SIZE_ITEMS_HEADER_LEN)
                    / (capacity + FIXED_SLOT_MARKER_SIZE)
            }
            None => 0,
        }
    }

    /// Largest range that may live on a single page of `page_size` bytes
    pub fn max_single_page(page_size: usize) -> Option<SizeRange> {
        Self::SINGLE_PAGE
            .iter()
            .rev()
            .copied()
            .find(|range| range.slots_per_page(page_size) >= MIN_SLOTS_PER_PAGE)
    }

    /// The range an item of `length` bytes is created with
    pub fn for_length(length: usize, page_size: usize) -> SizeRange {
        let max = match Self::max_single_page(page_size) {
            Some(max) => max,
            None => return Self::MultiPage,
        };
        Self::SINGLE_PAGE
            .iter()
            .copied()
            .take_while(|range| *range <= max)
            .find(|range| range.capacity().map_or(false, |c| c >= length))
            .unwrap_or(Self::MultiPage)
    }
}

/// How an item is laid out in the storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationType {
    /// Item occupies one slot on a fixed-size-items page
    SinglePage,
    /// Item occupies a dedicated chain of pages
    MultiPage,
}

impl AllocationType {
    /// Pure function of payload length and page size
    pub fn of(length: usize, page_size: usize) -> Self {
        match SizeRange::for_length(length, page_size) {
            SizeRange::MultiPage => Self::MultiPage,
            _ => Self::SinglePage,
        }
    }
}

/// Free-space map entry for a data page.
///
/// `Free(range)` means the page still has room for an item of that range;
/// everything else (full pages, non-data pages) is `Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmValue {
    Free(SizeRange),
    Full,
}

impl FsmValue {
    /// Nibble encoding of `Full`
    pub const FULL_NIBBLE: u8 = 0x0F;

    /// Encode as a 4-bit value
    pub fn to_nibble(self) -> u8 {
        match self {
            Self::Free(range) => range.ordinal().map_or(Self::FULL_NIBBLE, |n| n as u8),
            Self::Full => Self::FULL_NIBBLE,
        }
    }

    /// Decode from a 4-bit value
    pub fn from_nibble(nibble: u8) -> Self {
        match nibble & 0x0F {
            n @ 0..=11 => Self::Free(SizeRange::SINGLE_PAGE[n as usize]),
            _ => Self::Full,
        }
    }
}

/// Page types (discriminant byte at offset 2 of every page)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Storage heading (page 0)
    Heading = 1,
    /// Free-space map chunk
    FreeSpaceMap = 2,
    /// Slots of one size range
    FixedSizeItems = 3,
    /// One page of a multi-page item chain
    MultipageItem = 4,
    /// B+Tree node
    BPlusTreeNode = 5,
    /// Radix tree node (variable-size items)
    RadixTreeNode = 6,
}

impl PageType {
    /// Convert from byte value
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Heading),
            2 => Some(Self::FreeSpaceMap),
            3 => Some(Self::FixedSizeItems),
            4 => Some(Self::MultipageItem),
            5 => Some(Self::BPlusTreeNode),
            6 => Some(Self::RadixTreeNode),
            _ => None,
        }
    }
}

/// Index structure stored in the access-method pages
#[repr(i16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMethod {
    BPlusTree = 1,
    RadixTree = 2,
}

impl AccessMethod {
    /// Convert from the on-disk value
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            1 => Some(Self::BPlusTree),
            2 => Some(Self::RadixTree),
            _ => None,
        }
    }
}

/// B+Tree configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BTreeConfig {
    /// Maximum key length in bytes; also sizes node entries
    pub max_key_size: usize,
    /// Nodes at or below this share of their capacity are combined
    pub fill_factor: f64,
}

impl Default for BTreeConfig {
    fn default() -> Self {
        Self {
            max_key_size: DEFAULT_MAX_KEY_SIZE,
            fill_factor: DEFAULT_FILL_FACTOR,
        }
    }
}

impl BTreeConfig {
    /// Create a new config with custom limits
    pub fn new(max_key_size: usize, fill_factor: f64) -> Self {
        Self {
            max_key_size: max_key_size.max(1),
            fill_factor: fill_factor.clamp(0.0, 0.5),
        }
    }
}
