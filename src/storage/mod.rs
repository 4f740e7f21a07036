//! Storage layer: file-backed page I/O.
//!
//! This module provides the [`PageStore`] abstraction every upper layer talks
//! to, the file-backed implementation with its page map, and the recovery
//! log that makes a batch of page writes atomic.

mod file_store;
mod page_map;
mod recovery;

pub use file_store::{
    FilePageStore, StoreOptions, DEFAULT_VACUUM_THRESHOLD, PAGE_MAP_FILE, RECOVERY_FILE,
    STORAGE_FILE,
};
pub use page_map::{Allocation, PageMap, Relocation};
pub use recovery::{LoggedPage, RecoveryLog, RecoveryRecord};

use crate::error::{Result, StorageError};
use crate::page::Page;
use crate::types::PageIndex;

/// Trait for page-level storage operations
///
/// Implemented by the file store and by the page cache wrapping it, so upper
/// layers do not know whether pages are cached.
pub trait PageStore: Send + Sync {
    /// Size of every page in bytes
    fn page_size(&self) -> usize;

    /// Allocate a zero-filled page, reusing a released index when possible
    fn create_page(&self) -> Result<Page>;

    /// Read a page
    fn fetch_page(&self, index: PageIndex) -> Result<Page>;

    /// Overwrite an existing page
    fn update_page(&self, page: &Page) -> Result<()>;

    /// Remove a page; its index becomes available for reuse
    fn remove_page(&self, index: PageIndex) -> Result<()>;

    /// Whether a page is allocated
    fn page_exists(&self, index: PageIndex) -> Result<bool>;

    /// Number of live pages
    fn page_count(&self) -> Result<usize>;

    /// Verify that a page buffer has the configured length
    fn check_page(&self, page: &Page) -> Result<()> {
        if page.page_size() != self.page_size() {
            return Err(StorageError::page_format(format!(
                "page {} has {} bytes, expected {}",
                page.index(),
                page.page_size(),
                self.page_size()
            )));
        }
        Ok(())
    }

    /// Keep a page from being written back or evicted until unpinned
    fn pin_page(&self, _index: PageIndex) -> Result<()> {
        Ok(())
    }

    /// Release a pin taken with [`PageStore::pin_page`]
    fn unpin_page(&self, _index: PageIndex) -> Result<()> {
        Ok(())
    }

    /// Start buffering writes in the recovery log
    fn enter_atomic_operation(&self) -> Result<()>;

    /// Apply the buffered writes all at once and leave atomic mode
    fn exit_atomic_operation(&self) -> Result<()>;

    /// Whether an atomic operation is in progress
    fn in_atomic_operation(&self) -> bool;

    /// Write everything buffered to disk
    fn flush(&self) -> Result<()>;
}
