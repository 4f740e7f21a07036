//! Item references.

use std::fmt;

use crate::types::PageIndex;

/// Encoded size of a [`DbItemReference`]: page index (8) + item index (2)
pub const DB_ITEM_REFERENCE_SIZE: usize = 10;

/// Handle to a stored byte blob: the page holding it and the slot on that page.
///
/// Multi-page items are addressed by their first page with item index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DbItemReference {
    /// Page holding the item (first page for multi-page items)
    pub page_index: PageIndex,
    /// Slot index on the page
    pub item_index: i16,
}

impl DbItemReference {
    /// Create a new reference
    pub const fn new(page_index: PageIndex, item_index: i16) -> Self {
        Self {
            page_index,
            item_index,
        }
    }

    /// Whether the reference points at no page
    pub fn is_null(&self) -> bool {
        self.page_index.is_none()
    }

    /// Write the reference into the first ten bytes of `bytes`
    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..8].copy_from_slice(&self.page_index.value().to_le_bytes());
        bytes[8..10].copy_from_slice(&self.item_index.to_le_bytes());
    }

    /// Read a reference from the first ten bytes of `bytes`
    pub fn read(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DB_ITEM_REFERENCE_SIZE {
            return None;
        }
        let page = i64::from_le_bytes(bytes[0..8].try_into().ok()?);
        let item = i16::from_le_bytes(bytes[8..10].try_into().ok()?);
        Some(Self::new(PageIndex::new(page), item))
    }
}

impl fmt::Display for DbItemReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.page_index, self.item_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_reference() {
        assert!(DbItemReference::new(PageIndex::NONE, 0).is_null());
        assert!(!DbItemReference::new(PageIndex::new(3), 1).is_null());
    }

    #[test]
    fn test_reference_encoding() {
        let reference = DbItemReference::new(PageIndex::new(123_456_789), 42);
        let mut bytes = [0u8; DB_ITEM_REFERENCE_SIZE];
        reference.write(&mut bytes);
        assert_eq!(DbItemReference::read(&bytes), Some(reference));
        assert_eq!(DbItemReference::read(&bytes[..4]), None);
    }
}
