//! B+Tree node and its page layout.
//!
//! ```text
//! Offset  Size  Description
//! 0       29    NodeHeader (parent, previous, next, leaf flag)
//! 29      2     Entry count (u16)
//! 31      ..    Entries: [key len u16][key][ref page i64][ref item i16]
//! ```
//!
//! Leaf entries reference values; non-leaf entries reference child nodes
//! (item index 0) under the largest key of that child's subtree.

use std::any::Any;
use std::cmp::Ordering;

use crate::error::{Result, StorageError};
use crate::page::header::{NodeHeader, BPLUS_TREE_NODE_HEADER_LEN};
use crate::page::PageBacking;
use crate::types::{DbItemReference, PageIndex, DB_ITEM_REFERENCE_SIZE};

const ENTRY_COUNT_SIZE: usize = 2;
const KEY_LENGTH_SIZE: usize = 2;

/// Entries that fit a node of `page_size` when keys are at most `max_key_size`
pub fn node_capacity(page_size: usize, max_key_size: usize) -> usize {
    (page_size - BPLUS_TREE_NODE_HEADER_LEN - ENTRY_COUNT_SIZE)
        / (KEY_LENGTH_SIZE + max_key_size + DB_ITEM_REFERENCE_SIZE)
}

/// Key plus the reference it maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub key: Vec<u8>,
    pub reference: DbItemReference,
}

impl NodeEntry {
    pub fn new(key: Vec<u8>, reference: DbItemReference) -> Self {
        Self { key, reference }
    }

    /// Entry of a non-leaf node pointing at `child`
    pub fn child(key: Vec<u8>, child: PageIndex) -> Self {
        Self::new(key, DbItemReference::new(child, 0))
    }

    /// Child node of a non-leaf entry
    pub fn child_index(&self) -> PageIndex {
        self.reference.page_index
    }
}

/// A B+Tree node; its index is the page it lives on
#[derive(Debug, Clone, PartialEq)]
pub struct BPlusTreeNode {
    pub index: PageIndex,
    pub is_leaf: bool,
    pub parent: PageIndex,
    pub previous: PageIndex,
    pub next: PageIndex,
    pub entries: Vec<NodeEntry>,
}

impl BPlusTreeNode {
    /// An empty, unlinked node
    pub fn new(index: PageIndex, is_leaf: bool) -> Self {
        Self {
            index,
            is_leaf,
            parent: PageIndex::NONE,
            previous: PageIndex::NONE,
            next: PageIndex::NONE,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Exact position of `key`, or the position it would be inserted at
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
    }

    /// Entry to descend through for `key`: the first one not below it, or
    /// the last entry when `key` is above them all
    pub fn child_position(&self, key: &[u8]) -> usize {
        match self.search(key) {
            Ok(position) => position,
            Err(position) => position.min(self.entries.len().saturating_sub(1)),
        }
    }

    /// Position of the entry pointing at `child`
    pub fn position_of_child(&self, child: PageIndex) -> Result<usize> {
        self.entries
            .iter()
            .position(|entry| entry.child_index() == child)
            .ok_or_else(|| {
                StorageError::internal(format!(
                    "node {} has no entry for child {}",
                    self.index, child
                ))
            })
    }

    /// Largest key on the node
    pub fn max_key(&self) -> Option<&[u8]> {
        self.entries.last().map(|entry| entry.key.as_slice())
    }

    pub fn min_key(&self) -> Option<&[u8]> {
        self.entries.first().map(|entry| entry.key.as_slice())
    }

    /// Decode a node stored on page `index`
    pub fn read(index: PageIndex, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BPLUS_TREE_NODE_HEADER_LEN + ENTRY_COUNT_SIZE {
            return Err(node_overrun(index));
        }
        let header = NodeHeader::read(bytes)?;
        let mut offset = BPLUS_TREE_NODE_HEADER_LEN;
        let count = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
        offset += ENTRY_COUNT_SIZE;

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            if offset + KEY_LENGTH_SIZE > bytes.len() {
                return Err(node_overrun(index));
            }
            let key_len = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as usize;
            offset += KEY_LENGTH_SIZE;
            if offset + key_len + DB_ITEM_REFERENCE_SIZE > bytes.len() {
                return Err(node_overrun(index));
            }
            let key = bytes[offset..offset + key_len].to_vec();
            offset += key_len;
            let reference =
                DbItemReference::read(&bytes[offset..]).ok_or_else(|| node_overrun(index))?;
            offset += DB_ITEM_REFERENCE_SIZE;
            entries.push(NodeEntry::new(key, reference));
        }

        Ok(Self {
            index,
            is_leaf: header.is_leaf,
            parent: header.parent_page_index,
            previous: header.previous_page_index,
            next: header.next_page_index,
            entries,
        })
    }

    /// Encode the node into a full page
    pub fn write(&self, page_size: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; page_size];
        NodeHeader {
            parent_page_index: self.parent,
            previous_page_index: self.previous,
            next_page_index: self.next,
            is_leaf: self.is_leaf,
        }
        .write(&mut bytes)?;

        let count = u16::try_from(self.entries.len()).map_err(|_| {
            StorageError::page_format(format!("node {} has too many entries", self.index))
        })?;
        let mut offset = BPLUS_TREE_NODE_HEADER_LEN;
        bytes[offset..offset + ENTRY_COUNT_SIZE].copy_from_slice(&count.to_le_bytes());
        offset += ENTRY_COUNT_SIZE;

        for entry in &self.entries {
            let needed = KEY_LENGTH_SIZE + entry.key.len() + DB_ITEM_REFERENCE_SIZE;
            if offset + needed > page_size {
                return Err(StorageError::page_format(format!(
                    "node {} does not fit a {} byte page",
                    self.index, page_size
                )));
            }
            bytes[offset..offset + KEY_LENGTH_SIZE]
                .copy_from_slice(&(entry.key.len() as u16).to_le_bytes());
            offset += KEY_LENGTH_SIZE;
            bytes[offset..offset + entry.key.len()].copy_from_slice(&entry.key);
            offset += entry.key.len();
            entry.reference.write(&mut bytes[offset..]);
            offset += DB_ITEM_REFERENCE_SIZE;
        }
        Ok(bytes)
    }

    /// Keys strictly ascending
    pub fn is_ordered(&self) -> bool {
        self.entries
            .windows(2)
            .all(|pair| pair[0].key.cmp(&pair[1].key) == Ordering::Less)
    }
}

impl PageBacking for BPlusTreeNode {
    fn serialize(&self, page_size: usize) -> Result<Vec<u8>> {
        self.write(page_size)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn node_overrun(index: PageIndex) -> StorageError {
    StorageError::page_format(format!("node {} entries run past the page", index))
}
