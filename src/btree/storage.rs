//! Storage seams of the B+Tree.
//!
//! The tree never touches pages directly: nodes go through a
//! [`NodeStorage`] and values through a [`ValueStorage`]. The page-backed
//! implementations keep nodes on `BPlusTreeNode` pages (root recorded in the
//! heading page) and values in the memory manager.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::btree::node::{node_capacity, BPlusTreeNode};
use crate::error::{Result, StorageError};
use crate::memory::MemoryManager;
use crate::page::header::HeadingHeader;
use crate::page::Page;
use crate::storage::PageStore;
use crate::types::{AccessMethod, DbItemReference, PageIndex};

/// Smallest node capacity the rebalancing algorithms work with
pub const MIN_NODE_CAPACITY: usize = 3;

/// Where tree nodes live
pub trait NodeStorage: Send + Sync {
    /// Current root node
    fn fetch_root(&self) -> Result<BPlusTreeNode>;

    fn fetch(&self, index: PageIndex) -> Result<BPlusTreeNode>;

    /// Allocate and persist an empty, unlinked node
    fn create(&self, is_leaf: bool) -> Result<BPlusTreeNode>;

    fn update(&self, node: &BPlusTreeNode) -> Result<()>;

    fn remove(&self, index: PageIndex) -> Result<()>;

    /// Record `index` as the new root
    fn set_root(&self, index: PageIndex) -> Result<()>;

    /// Keep the node out of write-back until unpinned
    fn pin_node(&self, index: PageIndex) -> Result<()>;

    fn unpin_node(&self, index: PageIndex) -> Result<()>;

    /// Maximum number of entries per node
    fn node_capacity(&self) -> usize;
}

/// Where values live
pub trait ValueStorage: Send + Sync {
    fn allocate(&self, value: &[u8]) -> Result<DbItemReference>;

    fn fetch(&self, reference: DbItemReference) -> Result<Vec<u8>>;

    /// Replace a value; the reference may change
    fn reallocate(&self, reference: DbItemReference, value: &[u8]) -> Result<DbItemReference>;

    fn free(&self, reference: DbItemReference) -> Result<()>;

    fn get_raw_length(&self, reference: DbItemReference) -> Result<usize>;

    /// Bytes `start..end` of a stored value
    fn get_raw_segment(&self, reference: DbItemReference, start: usize, end: usize)
        -> Result<Vec<u8>>;
}

impl ValueStorage for MemoryManager {
    fn allocate(&self, value: &[u8]) -> Result<DbItemReference> {
        MemoryManager::allocate(self, value)
    }

    fn fetch(&self, reference: DbItemReference) -> Result<Vec<u8>> {
        MemoryManager::fetch(self, reference)
    }

    fn reallocate(&self, reference: DbItemReference, value: &[u8]) -> Result<DbItemReference> {
        MemoryManager::reallocate(self, reference, value)
    }

    fn free(&self, reference: DbItemReference) -> Result<()> {
        MemoryManager::free(self, reference)
    }

    fn get_raw_length(&self, reference: DbItemReference) -> Result<usize> {
        self.get_length(reference)
    }

    fn get_raw_segment(
        &self,
        reference: DbItemReference,
        start: usize,
        end: usize,
    ) -> Result<Vec<u8>> {
        self.get_item_segment(reference, start, end)
    }
}

/// Nodes stored one per page of a [`PageStore`]
pub struct PageNodeStorage {
    store: Arc<dyn PageStore>,
    page_size: usize,
    capacity: usize,
    root: Mutex<PageIndex>,
}

impl PageNodeStorage {
    /// Attach to the tree whose root is recorded in the heading page
    pub fn open(store: Arc<dyn PageStore>, max_key_size: usize) -> Result<Self> {
        let mut heading = store.fetch_page(PageIndex::HEADING)?;
        let header = HeadingHeader::read(heading.content()?)?;
        if header.access_method != AccessMethod::BPlusTree {
            return Err(StorageError::storage_format(format!(
                "storage uses access method {:?}",
                header.access_method
            )));
        }
        let storage = Self::with_root(store, max_key_size, header.access_method_page_index)?;
        storage.fetch_root()?;
        Ok(storage)
    }

    /// Create an empty root leaf and record it in the heading page
    pub fn create_root(store: Arc<dyn PageStore>, max_key_size: usize) -> Result<Self> {
        let storage = Self::with_root(store, max_key_size, PageIndex::NONE)?;
        let root = NodeStorage::create(&storage, true)?;
        storage.set_root(root.index)?;
        debug!(root = %root.index, capacity = storage.capacity, "b+tree created");
        Ok(storage)
    }

    fn with_root(store: Arc<dyn PageStore>, max_key_size: usize, root: PageIndex) -> Result<Self> {
        let page_size = store.page_size();
        let capacity = node_capacity(page_size, max_key_size);
        if capacity < MIN_NODE_CAPACITY {
            return Err(StorageError::out_of_range(format!(
                "max key size {} leaves room for {} entries per node",
                max_key_size, capacity
            )));
        }
        Ok(Self {
            store,
            page_size,
            capacity,
            root: Mutex::new(root),
        })
    }

    /// Index of the root node
    pub fn root_index(&self) -> PageIndex {
        *self.root.lock()
    }
}

impl NodeStorage for PageNodeStorage {
    fn fetch_root(&self) -> Result<BPlusTreeNode> {
        let root = self.root_index();
        if root.is_none() {
            return Err(StorageError::internal("b+tree has no root"));
        }
        self.fetch(root)
    }

    fn fetch(&self, index: PageIndex) -> Result<BPlusTreeNode> {
        let mut page = self.store.fetch_page(index)?;
        if let Some(node) = page.backing::<BPlusTreeNode>() {
            return Ok(node.clone());
        }
        BPlusTreeNode::read(index, page.content()?)
    }

    fn create(&self, is_leaf: bool) -> Result<BPlusTreeNode> {
        let page = self.store.create_page()?;
        let node = BPlusTreeNode::new(page.index(), is_leaf);
        self.update(&node)?;
        Ok(node)
    }

    fn update(&self, node: &BPlusTreeNode) -> Result<()> {
        let page = Page::deferred(node.index, self.page_size, Arc::new(node.clone()));
        self.store.update_page(&page)
    }

    fn remove(&self, index: PageIndex) -> Result<()> {
        self.store.remove_page(index)
    }

    fn set_root(&self, index: PageIndex) -> Result<()> {
        let mut heading = self.store.fetch_page(PageIndex::HEADING)?;
        let mut header = HeadingHeader::read(heading.content()?)?;
        header.access_method_page_index = index;
        header.write(heading.content_mut()?)?;
        self.store.update_page(&heading)?;
        *self.root.lock() = index;
        Ok(())
    }

    fn pin_node(&self, index: PageIndex) -> Result<()> {
        self.store.pin_page(index)
    }

    fn unpin_node(&self, index: PageIndex) -> Result<()> {
        self.store.unpin_page(index)
    }

    fn node_capacity(&self) -> usize {
        self.capacity
    }
}
