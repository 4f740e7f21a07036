//! File-backed page store.
//!
//! Pages live in the `storage` file at `slot * page_size`; the page map
//! translates stable logical indices to slots. While an atomic operation is
//! active, writes go to the recovery log and reach the storage file only when
//! the operation ends.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::error::{Result, StorageError};
use crate::page::Page;
use crate::storage::page_map::PageMap;
use crate::storage::recovery::{LoggedPage, RecoveryLog};
use crate::storage::PageStore;
use crate::types::{is_valid_page_size, PageIndex, DEFAULT_PAGE_SIZE};

/// Page content file name
pub const STORAGE_FILE: &str = "storage";

/// Page map file name
pub const PAGE_MAP_FILE: &str = "pagemap";

/// Recovery log file name
pub const RECOVERY_FILE: &str = "recovery";

/// Default number of free disk slots tolerated before vacuum runs
pub const DEFAULT_VACUUM_THRESHOLD: usize = 64;

/// Options of the file-backed store
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Page size in bytes
    pub page_size: usize,
    /// Vacuum runs once more than this many disk slots are free
    pub vacuum_threshold: usize,
    /// Whether to sync the storage file after every write
    pub sync_on_write: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            vacuum_threshold: DEFAULT_VACUUM_THRESHOLD,
            sync_on_write: false,
        }
    }
}

struct StoreInner {
    dir: PathBuf,
    file: File,
    map: PageMap,
    /// Active recovery log; `Some` while in an atomic operation
    recovery: Option<RecoveryLog>,
}

/// File-based page store implementation
pub struct FilePageStore {
    options: StoreOptions,
    inner: Mutex<StoreInner>,
}

impl FilePageStore {
    /// Open or create the store in `dir`, replaying a finished recovery log
    pub fn open(dir: &Path, options: StoreOptions) -> Result<Self> {
        if !is_valid_page_size(options.page_size) {
            return Err(StorageError::out_of_range(format!(
                "unsupported page size: {}",
                options.page_size
            )));
        }
        fs::create_dir_all(dir)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(STORAGE_FILE))?;
        let map = PageMap::open(&dir.join(PAGE_MAP_FILE))?;

        let mut inner = StoreInner {
            dir: dir.to_path_buf(),
            file,
            map,
            recovery: None,
        };

        if let Some(mut log) = RecoveryLog::open_existing(&dir.join(RECOVERY_FILE))? {
            if log.correctly_finished()? {
                info!(pages = log.len(), "replaying recovery log");
                inner.replay(&mut log, options.page_size)?;
                inner.file.sync_all()?;
                inner.map.flush(true)?;
            } else {
                warn!("discarding unfinished recovery log");
            }
            log.discard()?;
        }

        debug!(
            dir = %dir.display(),
            page_size = options.page_size,
            pages = inner.map.live_count(),
            "page store opened"
        );

        Ok(Self {
            options,
            inner: Mutex::new(inner),
        })
    }

    /// Number of disk slots the storage file spans
    pub fn disk_page_count(&self) -> usize {
        self.inner.lock().map.disk_count()
    }

    /// Number of free disk slots waiting for vacuum
    pub fn free_slot_count(&self) -> usize {
        self.inner.lock().map.free_slot_count()
    }

    /// Relocate live pages into free slots and shrink the storage file
    pub fn vacuum(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.recovery.is_some() {
            return Err(StorageError::invalid_operation(
                "vacuum is not allowed inside an atomic operation",
            ));
        }
        inner.vacuum(self.options.page_size)
    }
}

impl StoreInner {
    fn read_slot(&mut self, slot: i64, page_size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; page_size];
        self.file.seek(SeekFrom::Start(slot as u64 * page_size as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write_slot(&mut self, slot: i64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(slot as u64 * data.len() as u64))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Apply the last logged state of every page touched by the log
    fn replay(&mut self, log: &mut RecoveryLog, page_size: usize) -> Result<()> {
        for page in log.touched_pages() {
            match log.lookup(page)? {
                Some(LoggedPage::Updated(content)) => {
                    if content.len() != page_size {
                        return Err(StorageError::corruption(format!(
                            "logged content of page {} has {} bytes",
                            page,
                            content.len()
                        )));
                    }
                    let slot = self.map.ensure(page)?;
                    self.write_slot(slot, &content)?;
                }
                Some(LoggedPage::Deleted) => {
                    if self.map.exists(page) {
                        self.map.release(page)?;
                    }
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Fill free slots with the highest live pages, then cut the file.
    ///
    /// Page bytes are copied and synced before the map is persisted, and the
    /// file is truncated last; an interruption at any point leaves the
    /// persisted map pointing at intact copies.
    fn vacuum(&mut self, page_size: usize) -> Result<()> {
        let before = self.map.disk_count();
        let mut moved = 0usize;
        while let Some(relocation) = self.map.next_relocation() {
            let bytes = self.read_slot(relocation.from_slot, page_size)?;
            self.write_slot(relocation.to_slot, &bytes)?;
            self.map.apply_relocation(relocation);
            moved += 1;
        }
        self.file.sync_data()?;

        let disk_count = self.map.trim_free_tail();
        self.map.flush(true)?;
        self.file.set_len(disk_count as u64 * page_size as u64)?;
        self.file.sync_all()?;

        info!(moved, before, after = disk_count, "vacuum finished");
        Ok(())
    }
}

impl PageStore for FilePageStore {
    fn page_size(&self) -> usize {
        self.options.page_size
    }

    fn create_page(&self) -> Result<Page> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let allocation = inner.map.allocate();
        let zeros = vec![0u8; self.options.page_size];
        match inner.recovery.as_mut() {
            Some(log) => log.write_update_page_record(allocation.page, &zeros)?,
            None => {
                inner.write_slot(allocation.slot, &zeros)?;
                if self.options.sync_on_write {
                    inner.file.sync_data()?;
                }
                inner.map.flush(self.options.sync_on_write)?;
            }
        }

        trace!(
            page = %allocation.page,
            slot = allocation.slot,
            resurrected = allocation.resurrected,
            "page created"
        );
        Ok(Page::new(allocation.page, zeros))
    }

    fn fetch_page(&self, index: PageIndex) -> Result<Page> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(log) = inner.recovery.as_mut() {
            match log.lookup(index)? {
                Some(LoggedPage::Updated(content)) => return Ok(Page::new(index, content)),
                Some(LoggedPage::Deleted) => return Err(StorageError::PageNotFound(index)),
                None => {}
            }
        }

        let slot = inner
            .map
            .slot_of(index)
            .ok_or(StorageError::PageNotFound(index))?;
        let bytes = inner.read_slot(slot, self.options.page_size)?;
        Ok(Page::new(index, bytes))
    }

    fn update_page(&self, page: &Page) -> Result<()> {
        self.check_page(page)?;
        let bytes = page.to_bytes()?;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let slot = inner
            .map
            .slot_of(page.index())
            .ok_or(StorageError::PageNotFound(page.index()))?;

        match inner.recovery.as_mut() {
            Some(log) => log.write_update_page_record(page.index(), bytes)?,
            None => {
                inner.write_slot(slot, bytes)?;
                if self.options.sync_on_write {
                    inner.file.sync_data()?;
                }
            }
        }
        Ok(())
    }

    fn remove_page(&self, index: PageIndex) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !inner.map.exists(index) {
            return Err(StorageError::PageNotFound(index));
        }
        inner.map.release(index)?;

        match inner.recovery.as_mut() {
            Some(log) => log.write_delete_page_record(index)?,
            None => {
                inner.map.flush(self.options.sync_on_write)?;
                if inner.map.free_slot_count() > self.options.vacuum_threshold {
                    inner.vacuum(self.options.page_size)?;
                }
            }
        }
        trace!(page = %index, "page removed");
        Ok(())
    }

    fn page_exists(&self, index: PageIndex) -> Result<bool> {
        Ok(self.inner.lock().map.exists(index))
    }

    fn page_count(&self) -> Result<usize> {
        Ok(self.inner.lock().map.live_count())
    }

    fn enter_atomic_operation(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.recovery.is_some() {
            return Err(StorageError::invalid_operation(
                "atomic operation already in progress",
            ));
        }
        inner.map.flush(true)?;
        let path = inner.dir.join(RECOVERY_FILE);
        inner.recovery = Some(RecoveryLog::create(&path)?);
        debug!("atomic operation started");
        Ok(())
    }

    fn exit_atomic_operation(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut log = inner
            .recovery
            .take()
            .ok_or_else(|| StorageError::invalid_operation("no atomic operation in progress"))?;

        log.write_final_marker()?;
        log.sync()?;

        inner.replay(&mut log, self.options.page_size)?;
        inner.file.sync_all()?;
        inner.map.flush(true)?;
        let pages = log.len();
        log.discard()?;
        debug!(pages, "atomic operation applied");

        if inner.map.free_slot_count() > self.options.vacuum_threshold {
            inner.vacuum(self.options.page_size)?;
        }
        Ok(())
    }

    fn in_atomic_operation(&self) -> bool {
        self.inner.lock().recovery.is_some()
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.recovery.as_ref() {
            Some(log) => log.sync(),
            None => {
                inner.map.flush(true)?;
                inner.file.sync_all()?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn options() -> StoreOptions {
        StoreOptions::default()
    }

    fn filled(store: &FilePageStore, byte: u8) -> Result<Page> {
        let mut page = store.create_page()?;
        page.content_mut()?.fill(byte);
        store.update_page(&page)?;
        Ok(page)
    }

    #[test]
    fn test_create_fetch_update() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = FilePageStore::open(dir.path(), options())?;

        let mut page = store.create_page()?;
        assert_eq!(page.index(), PageIndex::new(0));
        assert!(page.content()?.iter().all(|&b| b == 0));

        page.content_mut()?[0..5].copy_from_slice(b"hello");
        store.update_page(&page)?;

        let mut read = store.fetch_page(page.index())?;
        assert_eq!(&read.content()?[0..5], b"hello");
        assert!(store.page_exists(page.index())?);
        assert!(!store.page_exists(PageIndex::new(1))?);
        assert!(matches!(
            store.fetch_page(PageIndex::new(1)),
            Err(StorageError::PageNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_reopen_store() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let store = FilePageStore::open(dir.path(), options())?;
            filled(&store, 1)?;
            filled(&store, 2)?;
            store.flush()?;
        }

        let store = FilePageStore::open(dir.path(), options())?;
        assert_eq!(store.page_count()?, 2);
        assert_eq!(store.fetch_page(PageIndex::new(1))?.content()?[10], 2);
        Ok(())
    }

    #[test]
    fn test_removed_index_is_resurrected() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = FilePageStore::open(dir.path(), options())?;
        for byte in 0..4 {
            filled(&store, byte)?;
        }

        store.remove_page(PageIndex::new(2))?;
        assert!(!store.page_exists(PageIndex::new(2))?);
        assert!(store.remove_page(PageIndex::new(2)).is_err());

        let mut page = store.create_page()?;
        assert_eq!(page.index(), PageIndex::new(2));
        assert!(page.content()?.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_wrong_page_length_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = FilePageStore::open(dir.path(), options())?;
        store.create_page()?;
        let short = Page::new(PageIndex::new(0), vec![0u8; 100]);
        assert!(matches!(
            store.update_page(&short),
            Err(StorageError::PageFormat(_))
        ));
        Ok(())
    }

    #[test]
    fn test_vacuum_shrinks_file() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = FilePageStore::open(
            dir.path(),
            StoreOptions {
                vacuum_threshold: 2,
                ..options()
            },
        )?;
        for byte in 0..10 {
            filled(&store, byte)?;
        }

        for i in 1..4 {
            store.remove_page(PageIndex::new(i))?;
        }
        // the third removal crossed the threshold
        assert_eq!(store.free_slot_count(), 0);
        assert_eq!(store.disk_page_count(), 7);

        let len = fs::metadata(dir.path().join(STORAGE_FILE))?.len();
        assert_eq!(len, 7 * 4096);
        for i in [0u8, 4, 5, 6, 7, 8, 9] {
            let mut page = store.fetch_page(PageIndex::new(i as i64))?;
            assert!(page.content()?.iter().all(|&b| b == i));
        }
        drop(store);

        let store = FilePageStore::open(dir.path(), options())?;
        assert_eq!(store.fetch_page(PageIndex::new(9))?.content()?[0], 9);
        Ok(())
    }

    #[test]
    fn test_atomic_operation_defers_writes() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = FilePageStore::open(dir.path(), options())?;
        filled(&store, 1)?;
        let storage_len = fs::metadata(dir.path().join(STORAGE_FILE))?.len();

        store.enter_atomic_operation()?;
        assert!(store.in_atomic_operation());
        assert!(store.enter_atomic_operation().is_err());

        let created = filled(&store, 7)?;
        let mut first = store.fetch_page(PageIndex::new(0))?;
        first.content_mut()?.fill(3);
        store.update_page(&first)?;

        // reads observe the logged writes, the storage file is untouched
        assert_eq!(store.fetch_page(created.index())?.content()?[0], 7);
        assert_eq!(store.fetch_page(PageIndex::new(0))?.content()?[0], 3);
        assert_eq!(fs::metadata(dir.path().join(STORAGE_FILE))?.len(), storage_len);
        assert!(dir.path().join(RECOVERY_FILE).exists());

        store.exit_atomic_operation()?;
        assert!(!store.in_atomic_operation());
        assert!(!dir.path().join(RECOVERY_FILE).exists());
        drop(store);

        let store = FilePageStore::open(dir.path(), options())?;
        assert_eq!(store.fetch_page(PageIndex::new(0))?.content()?[0], 3);
        assert_eq!(store.fetch_page(created.index())?.content()?[0], 7);
        Ok(())
    }

    #[test]
    fn test_atomic_remove_hides_page() -> Result<()> {
        let dir = tempdir().unwrap();
        let store = FilePageStore::open(dir.path(), options())?;
        filled(&store, 1)?;
        filled(&store, 2)?;

        store.enter_atomic_operation()?;
        store.remove_page(PageIndex::new(1))?;
        assert!(!store.page_exists(PageIndex::new(1))?);
        assert!(store.fetch_page(PageIndex::new(1)).is_err());
        store.exit_atomic_operation()?;
        drop(store);

        let store = FilePageStore::open(dir.path(), options())?;
        assert!(!store.page_exists(PageIndex::new(1))?);
        assert_eq!(store.page_count()?, 1);
        Ok(())
    }

    #[test]
    fn test_interrupted_atomic_operation_is_discarded() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let store = FilePageStore::open(dir.path(), options())?;
            filled(&store, 1)?;

            store.enter_atomic_operation()?;
            let mut page = store.fetch_page(PageIndex::new(0))?;
            page.content_mut()?.fill(9);
            store.update_page(&page)?;
            filled(&store, 5)?;
            // dropped without exiting: no final marker
        }
        assert!(dir.path().join(RECOVERY_FILE).exists());

        let store = FilePageStore::open(dir.path(), options())?;
        assert!(!dir.path().join(RECOVERY_FILE).exists());
        assert_eq!(store.page_count()?, 1);
        assert_eq!(store.fetch_page(PageIndex::new(0))?.content()?[0], 1);
        Ok(())
    }

    #[test]
    fn test_finished_log_is_replayed_on_open() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let store = FilePageStore::open(dir.path(), options())?;
            filled(&store, 1)?;
            filled(&store, 2)?;
            store.flush()?;
        }
        {
            // a session that wrote its final marker but never applied the log
            let mut log = RecoveryLog::create(&dir.path().join(RECOVERY_FILE))?;
            log.write_update_page_record(PageIndex::new(0), &vec![8u8; 4096])?;
            log.write_update_page_record(PageIndex::new(2), &vec![6u8; 4096])?;
            log.write_delete_page_record(PageIndex::new(1))?;
            log.write_final_marker()?;
            log.sync()?;
        }

        let store = FilePageStore::open(dir.path(), options())?;
        assert!(!dir.path().join(RECOVERY_FILE).exists());
        assert_eq!(store.fetch_page(PageIndex::new(0))?.content()?[0], 8);
        assert_eq!(store.fetch_page(PageIndex::new(2))?.content()?[0], 6);
        assert!(!store.page_exists(PageIndex::new(1))?);
        Ok(())
    }

    #[test]
    fn test_invalid_page_size() {
        let dir = tempdir().unwrap();
        let result = FilePageStore::open(
            dir.path(),
            StoreOptions {
                page_size: 1000,
                ..options()
            },
        );
        assert!(matches!(result, Err(StorageError::OutOfRange(_))));
    }
}
