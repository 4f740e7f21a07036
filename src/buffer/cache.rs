//! Caching page store.
//!
//! Wraps another [`PageStore`] and keeps recently used pages in memory.
//! Updates are held as dirty pages until either the dirty ceiling forces a
//! write-back or the page is evicted. Pinned pages are neither written back
//! nor evicted; when every resident page is pinned the cache grows past its
//! ceiling instead.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::buffer::lru::LruList;
use crate::error::{Result, StorageError};
use crate::page::Page;
use crate::storage::PageStore;
use crate::types::PageIndex;

/// Default number of resident pages
pub const DEFAULT_MAX_CACHED_PAGES: usize = 1024;

/// Default number of dirty pages before a forced write-back
pub const DEFAULT_MAX_DIRTY_PAGES: usize = 256;

/// Limits of the page cache
#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    /// Resident page ceiling
    pub max_cached_pages: usize,
    /// Dirty page ceiling
    pub max_dirty_pages: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_cached_pages: DEFAULT_MAX_CACHED_PAGES,
            max_dirty_pages: DEFAULT_MAX_DIRTY_PAGES,
        }
    }
}

/// A resident page
struct CachedPage {
    page: Page,
    dirty: bool,
    pin_count: u32,
}

struct CacheState {
    pages: HashMap<PageIndex, CachedPage>,
    lru: LruList<PageIndex>,
    dirty_count: usize,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn insert(&mut self, page: Page, dirty: bool) {
        let index = page.index();
        match self.pages.get_mut(&index) {
            Some(entry) => {
                if dirty && !entry.dirty {
                    self.dirty_count += 1;
                }
                entry.page = page;
                entry.dirty |= dirty;
            }
            None => {
                if dirty {
                    self.dirty_count += 1;
                }
                self.pages.insert(
                    index,
                    CachedPage {
                        page,
                        dirty,
                        pin_count: 0,
                    },
                );
            }
        }
        self.lru.touch(index);
    }

    fn forget(&mut self, index: PageIndex) -> Option<CachedPage> {
        self.lru.remove(index);
        let entry = self.pages.remove(&index)?;
        if entry.dirty {
            self.dirty_count -= 1;
        }
        Some(entry)
    }
}

/// Page cache over another page store
pub struct CachingPageStore {
    store: Arc<dyn PageStore>,
    options: CacheOptions,
    state: Mutex<CacheState>,
}

impl CachingPageStore {
    /// Create a cache in front of `store`
    pub fn new(store: Arc<dyn PageStore>, options: CacheOptions) -> Self {
        let options = CacheOptions {
            max_cached_pages: options.max_cached_pages.max(1),
            max_dirty_pages: options.max_dirty_pages.max(1),
        };
        Self {
            store,
            options,
            state: Mutex::new(CacheState {
                pages: HashMap::with_capacity(options.max_cached_pages),
                lru: LruList::with_capacity(options.max_cached_pages),
                dirty_count: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Share of fetches served from memory
    pub fn hit_rate(&self) -> f64 {
        let state = self.state.lock();
        let total = state.hits + state.misses;
        if total == 0 {
            0.0
        } else {
            state.hits as f64 / total as f64
        }
    }

    /// Number of resident pages
    pub fn cached_page_count(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Number of dirty resident pages
    pub fn dirty_page_count(&self) -> usize {
        self.state.lock().dirty_count
    }

    /// Write every dirty, unpinned page to the underlying store
    fn write_back(&self, state: &mut CacheState) -> Result<()> {
        let mut written = 0usize;
        for entry in state.pages.values_mut() {
            if entry.dirty && entry.pin_count == 0 {
                self.store.update_page(&entry.page)?;
                entry.dirty = false;
                state.dirty_count -= 1;
                written += 1;
            }
        }
        if written > 0 {
            debug!(written, remaining_dirty = state.dirty_count, "cache flushed");
        }
        Ok(())
    }

    /// Evict least recently used unpinned pages down to the ceiling
    fn evict(&self, state: &mut CacheState) -> Result<()> {
        while state.pages.len() > self.options.max_cached_pages {
            let pages = &state.pages;
            let victim = state
                .lru
                .oldest_where(|index| pages.get(index).map_or(true, |e| e.pin_count == 0));
            let Some(victim) = victim else {
                trace!(resident = state.pages.len(), "all resident pages pinned");
                break;
            };
            // a dirty victim stays resident until its write-back succeeds
            if let Some(entry) = state.pages.get(&victim) {
                if entry.dirty {
                    self.store.update_page(&entry.page)?;
                }
            }
            if let Some(entry) = state.forget(victim) {
                trace!(page = %victim, dirty = entry.dirty, "page evicted");
            }
        }
        Ok(())
    }
}

impl PageStore for CachingPageStore {
    fn page_size(&self) -> usize {
        self.store.page_size()
    }

    fn create_page(&self) -> Result<Page> {
        let mut state = self.state.lock();
        let page = self.store.create_page()?;
        state.insert(page.clone(), false);
        self.evict(&mut state)?;
        Ok(page)
    }

    fn fetch_page(&self, index: PageIndex) -> Result<Page> {
        let mut state = self.state.lock();
        if let Some(entry) = state.pages.get(&index) {
            let page = entry.page.clone();
            state.hits += 1;
            state.lru.touch(index);
            return Ok(page);
        }

        state.misses += 1;
        let page = self.store.fetch_page(index)?;
        state.insert(page.clone(), false);
        self.evict(&mut state)?;
        Ok(page)
    }

    fn update_page(&self, page: &Page) -> Result<()> {
        self.check_page(page)?;
        let mut state = self.state.lock();
        if !state.pages.contains_key(&page.index()) && !self.store.page_exists(page.index())? {
            return Err(StorageError::PageNotFound(page.index()));
        }

        state.insert(page.clone(), true);
        if state.dirty_count > self.options.max_dirty_pages {
            self.write_back(&mut state)?;
        }
        self.evict(&mut state)
    }

    fn remove_page(&self, index: PageIndex) -> Result<()> {
        // a removed page takes its pins with it
        let mut state = self.state.lock();
        state.forget(index);
        self.store.remove_page(index)
    }

    fn page_exists(&self, index: PageIndex) -> Result<bool> {
        let state = self.state.lock();
        if state.pages.contains_key(&index) {
            return Ok(true);
        }
        self.store.page_exists(index)
    }

    fn page_count(&self) -> Result<usize> {
        self.store.page_count()
    }

    fn pin_page(&self, index: PageIndex) -> Result<()> {
        let mut state = self.state.lock();
        if !state.pages.contains_key(&index) {
            let page = self.store.fetch_page(index)?;
            state.insert(page, false);
        }
        if let Some(entry) = state.pages.get_mut(&index) {
            entry.pin_count += 1;
        }
        Ok(())
    }

    fn unpin_page(&self, index: PageIndex) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.pages.get_mut(&index) {
            entry.pin_count = entry.pin_count.saturating_sub(1);
        }
        if state.dirty_count > self.options.max_dirty_pages {
            self.write_back(&mut state)?;
        }
        self.evict(&mut state)
    }

    fn enter_atomic_operation(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.write_back(&mut state)?;
        self.store.enter_atomic_operation()
    }

    fn exit_atomic_operation(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.write_back(&mut state)?;
        self.store.exit_atomic_operation()
    }

    fn in_atomic_operation(&self) -> bool {
        self.store.in_atomic_operation()
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.write_back(&mut state)?;
        self.store.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FilePageStore, StoreOptions};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};

    /// File store whose page writes can be switched to fail
    struct FailingStore {
        inner: FilePageStore,
        fail_updates: AtomicBool,
    }

    impl PageStore for FailingStore {
        fn page_size(&self) -> usize {
            self.inner.page_size()
        }

        fn create_page(&self) -> Result<Page> {
            self.inner.create_page()
        }

        fn fetch_page(&self, index: PageIndex) -> Result<Page> {
            self.inner.fetch_page(index)
        }

        fn update_page(&self, page: &Page) -> Result<()> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "write rejected",
                )));
            }
            self.inner.update_page(page)
        }

        fn remove_page(&self, index: PageIndex) -> Result<()> {
            self.inner.remove_page(index)
        }

        fn page_exists(&self, index: PageIndex) -> Result<bool> {
            self.inner.page_exists(index)
        }

        fn page_count(&self) -> Result<usize> {
            self.inner.page_count()
        }

        fn enter_atomic_operation(&self) -> Result<()> {
            self.inner.enter_atomic_operation()
        }

        fn exit_atomic_operation(&self) -> Result<()> {
            self.inner.exit_atomic_operation()
        }

        fn in_atomic_operation(&self) -> bool {
            self.inner.in_atomic_operation()
        }

        fn flush(&self) -> Result<()> {
            self.inner.flush()
        }
    }

    fn open(
        max_cached_pages: usize,
        max_dirty_pages: usize,
    ) -> Result<(TempDir, Arc<FilePageStore>, CachingPageStore)> {
        let dir = tempdir().unwrap();
        let file_store = Arc::new(FilePageStore::open(dir.path(), StoreOptions::default())?);
        let cache = CachingPageStore::new(
            file_store.clone(),
            CacheOptions {
                max_cached_pages,
                max_dirty_pages,
            },
        );
        Ok((dir, file_store, cache))
    }

    fn write(cache: &CachingPageStore, index: i64, byte: u8) -> Result<()> {
        let mut page = cache.fetch_page(PageIndex::new(index))?;
        page.content_mut()?.fill(byte);
        cache.update_page(&page)
    }

    #[test]
    fn test_updates_stay_in_memory() -> Result<()> {
        let (_dir, file_store, cache) = open(16, 16)?;
        let page = cache.create_page()?;
        write(&cache, page.index().value(), 5)?;

        assert_eq!(cache.fetch_page(page.index())?.content()?[0], 5);
        assert_eq!(file_store.fetch_page(page.index())?.content()?[0], 0);
        assert_eq!(cache.dirty_page_count(), 1);

        cache.flush()?;
        assert_eq!(file_store.fetch_page(page.index())?.content()?[0], 5);
        assert_eq!(cache.dirty_page_count(), 0);
        Ok(())
    }

    #[test]
    fn test_dirty_ceiling_forces_write_back() -> Result<()> {
        let (_dir, file_store, cache) = open(16, 2)?;
        for _ in 0..3 {
            cache.create_page()?;
        }
        write(&cache, 0, 1)?;
        write(&cache, 1, 2)?;
        assert_eq!(cache.dirty_page_count(), 2);

        write(&cache, 2, 3)?;
        assert_eq!(cache.dirty_page_count(), 0);
        assert_eq!(file_store.fetch_page(PageIndex::new(2))?.content()?[0], 3);
        Ok(())
    }

    #[test]
    fn test_lru_eviction_writes_back() -> Result<()> {
        let (_dir, file_store, cache) = open(2, 16)?;
        for _ in 0..3 {
            cache.create_page()?;
        }
        assert_eq!(cache.cached_page_count(), 2);

        write(&cache, 0, 7)?;
        // page 0 reloaded, the oldest remaining page was evicted
        assert_eq!(cache.cached_page_count(), 2);
        write(&cache, 1, 8)?;
        write(&cache, 2, 9)?;

        // page 0 was the least recently used and reached the file store
        assert_eq!(file_store.fetch_page(PageIndex::new(0))?.content()?[0], 7);
        assert_eq!(cache.fetch_page(PageIndex::new(0))?.content()?[0], 7);
        Ok(())
    }

    #[test]
    fn test_pinned_pages_are_kept() -> Result<()> {
        let (_dir, file_store, cache) = open(1, 1)?;
        cache.create_page()?;
        cache.pin_page(PageIndex::new(0))?;
        write(&cache, 0, 4)?;

        for _ in 0..3 {
            cache.create_page()?;
        }
        for i in 1..4 {
            write(&cache, i, 1)?;
        }
        cache.flush()?;

        // neither evicted nor written while pinned
        assert_eq!(file_store.fetch_page(PageIndex::new(0))?.content()?[0], 0);
        assert_eq!(cache.fetch_page(PageIndex::new(0))?.content()?[0], 4);

        cache.unpin_page(PageIndex::new(0))?;
        cache.flush()?;
        assert_eq!(file_store.fetch_page(PageIndex::new(0))?.content()?[0], 4);
        Ok(())
    }

    #[test]
    fn test_failed_eviction_keeps_dirty_page() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = Arc::new(FailingStore {
            inner: FilePageStore::open(dir.path(), StoreOptions::default())?,
            fail_updates: AtomicBool::new(false),
        });
        let cache = CachingPageStore::new(
            store.clone(),
            CacheOptions {
                max_cached_pages: 1,
                max_dirty_pages: 16,
            },
        );
        let first = cache.create_page()?;
        write(&cache, first.index().value(), 3)?;
        assert_eq!(cache.dirty_page_count(), 1);

        store.fail_updates.store(true, Ordering::SeqCst);
        assert!(cache.create_page().is_err());

        // the victim could not be written and is still resident and dirty
        assert_eq!(cache.dirty_page_count(), 1);
        assert_eq!(cache.fetch_page(first.index())?.content()?[0], 3);
        assert_eq!(store.inner.fetch_page(first.index())?.content()?[0], 0);

        store.fail_updates.store(false, Ordering::SeqCst);
        cache.flush()?;
        assert_eq!(cache.dirty_page_count(), 0);
        assert_eq!(store.inner.fetch_page(first.index())?.content()?[0], 3);
        Ok(())
    }

    #[test]
    fn test_hit_rate() -> Result<()> {
        let (_dir, _file_store, cache) = open(16, 16)?;
        let page = cache.create_page()?;
        cache.fetch_page(page.index())?;
        cache.fetch_page(page.index())?;
        assert_eq!(cache.hit_rate(), 1.0);
        Ok(())
    }

    #[test]
    fn test_atomic_window_through_cache() -> Result<()> {
        let (dir, file_store, cache) = open(16, 16)?;
        cache.create_page()?;
        cache.flush()?;

        cache.enter_atomic_operation()?;
        write(&cache, 0, 6)?;
        let created = cache.create_page()?;
        cache.exit_atomic_operation()?;
        drop(cache);
        drop(file_store);

        let store = FilePageStore::open(dir.path(), StoreOptions::default())?;
        assert_eq!(store.fetch_page(PageIndex::new(0))?.content()?[0], 6);
        assert!(store.page_exists(created.index())?);
        Ok(())
    }
}
