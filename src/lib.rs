//! # Tank Storage
//!
//! An embedded, page-oriented key-value storage engine.
//!
//! ## Architecture
//!
//! The engine is a stack of layers, each talking to the one below through a
//! narrow interface:
//!
//! - **Page Layer** (`page`): header codecs and item layouts inside a page
//! - **Storage Layer** (`storage`): file-backed page store with a page map,
//!   vacuum and a recovery log for atomic operations
//! - **Page Cache** (`buffer`): LRU cache with dirty tracking and pinning
//! - **Free-Space Map** (`fsm`): one nibble of fullness per page
//! - **Memory Manager** (`memory`): byte blobs of any length on pages
//! - **B+Tree Layer** (`btree`): ordered index with cursor iteration
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tank_storage::{Config, Storage};
//!
//! let storage = Storage::open(Config::new("my_storage"))?;
//!
//! storage.set(b"hello", b"world")?;
//! assert_eq!(storage.get(b"hello")?, Some(b"world".to_vec()));
//!
//! for (key, value) in storage.range(Some(b"a"), Some(b"z"))? {
//!     println!("{:?} -> {:?}", key, value);
//! }
//!
//! storage.remove(b"hello")?;
//! storage.close()?;
//! ```

pub mod btree;
pub mod buffer;
pub mod error;
pub mod fsm;
pub mod memory;
pub mod page;
pub mod storage;
pub mod types;

pub use error::{Result, StorageError};
pub use types::{BTreeConfig, DbItemReference, PageIndex, DEFAULT_PAGE_SIZE};

// Re-export main public API
pub use btree::{BPlusTree, NodeStorage, PageNodeStorage, ValueStorage};
pub use buffer::{CacheOptions, CachingPageStore};
pub use fsm::FreeSpaceMap;
pub use memory::MemoryManager;
pub use storage::{FilePageStore, PageStore, StoreOptions};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::{DEFAULT_MAX_CACHED_PAGES, DEFAULT_MAX_DIRTY_PAGES};
use crate::page::header::HeadingHeader;
use crate::storage::DEFAULT_VACUUM_THRESHOLD;
use crate::types::{
    AccessMethod, FIRST_ACCESS_METHOD_PAGE_INDEX, FIRST_FSM_PAGE_INDEX, ON_DISK_VERSION,
};

/// Storage identity file name
pub const INFO_FILE: &str = "info";

/// Storage type recorded in the info file
pub const STORAGE_TYPE: &str = "BPlusTree";

/// Type name recorded for raw byte keys and values
pub const BYTES_TYPE: &str = "bytes";

/// Storage configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the storage files
    pub path: PathBuf,
    /// Page size in bytes, a power of two in 4096..=65536 (default: 4096)
    pub page_size: usize,
    /// Whether pages go through the in-memory cache (default: true)
    pub cache_enabled: bool,
    /// Resident page ceiling of the cache (default: 1024)
    pub max_cached_pages: usize,
    /// Dirty page ceiling of the cache (default: 256)
    pub max_dirty_pages: usize,
    /// Free disk slots tolerated before the file is compacted (default: 64)
    pub vacuum_threshold: usize,
    /// Whether to sync writes immediately (default: false for performance)
    pub sync_on_write: bool,
    /// B+Tree configuration
    pub btree_config: BTreeConfig,
    /// Name of the key type, checked against the info file on open
    pub key_type: String,
    /// Name of the value type, checked against the info file on open
    pub value_type: String,
}

impl Config {
    /// Create a new configuration with default settings
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_enabled: true,
            max_cached_pages: DEFAULT_MAX_CACHED_PAGES,
            max_dirty_pages: DEFAULT_MAX_DIRTY_PAGES,
            vacuum_threshold: DEFAULT_VACUUM_THRESHOLD,
            sync_on_write: false,
            btree_config: BTreeConfig::default(),
            key_type: BYTES_TYPE.to_string(),
            value_type: BYTES_TYPE.to_string(),
        }
    }

    /// Set page size
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Enable or bypass the page cache
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Set the resident page ceiling
    pub fn max_cached_pages(mut self, pages: usize) -> Self {
        self.max_cached_pages = pages;
        self
    }

    /// Set the dirty page ceiling
    pub fn max_dirty_pages(mut self, pages: usize) -> Self {
        self.max_dirty_pages = pages;
        self
    }

    /// Set the vacuum threshold
    pub fn vacuum_threshold(mut self, slots: usize) -> Self {
        self.vacuum_threshold = slots;
        self
    }

    /// Enable sync on write for durability
    pub fn sync_on_write(mut self, enabled: bool) -> Self {
        self.sync_on_write = enabled;
        self
    }

    /// Set B+Tree configuration
    pub fn btree_config(mut self, config: BTreeConfig) -> Self {
        self.btree_config = config;
        self
    }

    /// Name the key and value types recorded in the info file
    pub fn types(mut self, key_type: impl Into<String>, value_type: impl Into<String>) -> Self {
        self.key_type = key_type.into();
        self.value_type = value_type.into();
        self
    }

    fn store_options(&self) -> StoreOptions {
        StoreOptions {
            page_size: self.page_size,
            vacuum_threshold: self.vacuum_threshold,
            sync_on_write: self.sync_on_write,
        }
    }
}

/// Identity of a storage, kept as JSON in the `info` file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage_type: String,
    pub key_type: String,
    pub value_type: String,
    pub max_key_size: usize,
    pub page_size: usize,
}

impl StorageInfo {
    fn from_config(config: &Config) -> Self {
        Self {
            storage_type: STORAGE_TYPE.to_string(),
            key_type: config.key_type.clone(),
            value_type: config.value_type.clone(),
            max_key_size: config.btree_config.max_key_size,
            page_size: config.page_size,
        }
    }

    fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn check(&self, expected: &StorageInfo) -> Result<()> {
        if self != expected {
            return Err(StorageError::storage_format(format!(
                "storage holds {} {}/{} with max key {} and {} byte pages, \
                 opened as {} {}/{} with max key {} and {} byte pages",
                self.storage_type,
                self.key_type,
                self.value_type,
                self.max_key_size,
                self.page_size,
                expected.storage_type,
                expected.key_type,
                expected.value_type,
                expected.max_key_size,
                expected.page_size
            )));
        }
        Ok(())
    }
}

/// Main storage handle providing key-value storage backed by a B+Tree
///
/// This is the primary public interface for the storage engine. Lookups
/// take a shared lock on the tree, mutations an exclusive one.
pub struct Storage {
    tree: RwLock<BPlusTree>,
    store: Arc<dyn PageStore>,
    file_store: Arc<FilePageStore>,
    cache: Option<Arc<CachingPageStore>>,
    config: Config,
}

impl Storage {
    /// Open or create a storage in the configured directory
    pub fn open(config: Config) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let info_path = config.path.join(INFO_FILE);
        let expected = StorageInfo::from_config(&config);
        let existing = StorageInfo::load(&info_path)?;
        if let Some(info) = &existing {
            info.check(&expected)?;
        }

        let file_store = Arc::new(FilePageStore::open(&config.path, config.store_options())?);
        let cache = config.cache_enabled.then(|| {
            Arc::new(CachingPageStore::new(
                file_store.clone(),
                CacheOptions {
                    max_cached_pages: config.max_cached_pages,
                    max_dirty_pages: config.max_dirty_pages,
                },
            ))
        });
        let store: Arc<dyn PageStore> = match &cache {
            Some(cache) => cache.clone(),
            None => file_store.clone(),
        };

        let fresh = store.page_count()? == 0;
        let (fsm, nodes) = if fresh {
            if existing.is_none() {
                expected.save(&info_path)?;
            }
            Self::initialize(&store, &config)?
        } else {
            if existing.is_none() {
                return Err(StorageError::storage_format(format!(
                    "{} has pages but no {} file",
                    config.path.display(),
                    INFO_FILE
                )));
            }
            Self::attach(&store, &config)?
        };

        let memory = Arc::new(MemoryManager::new(store.clone(), Arc::new(fsm)));
        let tree = BPlusTree::new(Arc::new(nodes), memory, config.btree_config.clone())?;

        info!(
            path = %config.path.display(),
            page_size = config.page_size,
            created = fresh,
            cache = config.cache_enabled,
            "storage opened"
        );

        Ok(Self {
            tree: RwLock::new(tree),
            store,
            file_store,
            cache,
            config,
        })
    }

    /// Lay out heading, free-space map and root leaf in one atomic operation
    fn initialize(
        store: &Arc<dyn PageStore>,
        config: &Config,
    ) -> Result<(FreeSpaceMap, PageNodeStorage)> {
        store.enter_atomic_operation()?;

        let mut heading = store.create_page()?;
        if heading.index() != PageIndex::HEADING {
            return Err(StorageError::internal(format!(
                "heading created as page {}",
                heading.index()
            )));
        }
        HeadingHeader {
            on_disk_version: ON_DISK_VERSION,
            page_size: config.page_size as i32,
            fsm_page_index: FIRST_FSM_PAGE_INDEX,
            access_method_page_index: FIRST_ACCESS_METHOD_PAGE_INDEX,
            access_method: AccessMethod::BPlusTree,
        }
        .write(heading.content_mut()?)?;
        store.update_page(&heading)?;

        let fsm = FreeSpaceMap::create(store.clone())?;
        let nodes = PageNodeStorage::create_root(store.clone(), config.btree_config.max_key_size)?;
        if fsm.first_page() != FIRST_FSM_PAGE_INDEX
            || nodes.root_index() != FIRST_ACCESS_METHOD_PAGE_INDEX
        {
            return Err(StorageError::internal(format!(
                "initial layout placed the free-space map at {} and the root at {}",
                fsm.first_page(),
                nodes.root_index()
            )));
        }

        store.exit_atomic_operation()?;
        debug!(path = %config.path.display(), "storage initialized");
        Ok((fsm, nodes))
    }

    /// Validate the heading page and load the existing structures
    fn attach(
        store: &Arc<dyn PageStore>,
        config: &Config,
    ) -> Result<(FreeSpaceMap, PageNodeStorage)> {
        let mut heading = store.fetch_page(PageIndex::HEADING)?;
        let header = HeadingHeader::read(heading.content()?)?;
        if header.on_disk_version != ON_DISK_VERSION {
            return Err(StorageError::storage_format(format!(
                "on-disk version {} is not supported",
                header.on_disk_version
            )));
        }
        if header.page_size as usize != config.page_size {
            return Err(StorageError::storage_format(format!(
                "storage uses {} byte pages, opened with {}",
                header.page_size, config.page_size
            )));
        }
        let fsm = FreeSpaceMap::open(store.clone(), header.fsm_page_index)?;
        let nodes = PageNodeStorage::open(store.clone(), config.btree_config.max_key_size)?;
        Ok((fsm, nodes))
    }

    /// Get the storage configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get a value by key
    ///
    /// Returns `None` if the key does not exist.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.read().get(key)
    }

    /// Insert or update a key-value pair
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.write().set(key, value)
    }

    /// Delete a key-value pair
    ///
    /// Returns `true` if the key existed and was deleted.
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        self.tree.write().remove(key)
    }

    /// Check if a key exists
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.tree.read().exists(key)
    }

    /// Length of the value under `key`
    pub fn get_raw_length(&self, key: &[u8]) -> Result<Option<usize>> {
        self.tree.read().value_length(key)
    }

    /// Bytes `start..end` of the value under `key`
    pub fn get_raw_segment(&self, key: &[u8], start: usize, end: usize) -> Result<Option<Vec<u8>>> {
        self.tree.read().value_segment(key, start, end)
    }

    /// Smallest key
    pub fn min(&self) -> Result<Option<Vec<u8>>> {
        self.tree.read().min()
    }

    /// Largest key
    pub fn max(&self) -> Result<Option<Vec<u8>>> {
        self.tree.read().max()
    }

    /// Smallest key strictly greater than `key`
    pub fn next_to(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.read().next_to(key)
    }

    /// Largest key strictly less than `key`
    pub fn previous_to(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.read().previous_to(key)
    }

    /// Key-value pairs in a range
    ///
    /// Returns pairs with `start <= key < end`; `None` means unbounded on
    /// that side.
    pub fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.tree.read().scan(start, end)
    }

    /// Number of keys
    pub fn count(&self) -> Result<usize> {
        self.tree.read().count()
    }

    /// Validate the tree structure; returns the first problem found
    pub fn check_consistency(&self) -> Result<Option<String>> {
        self.tree.read().check_consistency()
    }

    /// Write dirty pages to disk
    pub fn flush(&self) -> Result<()> {
        let _tree = self.tree.write();
        self.store.flush()
    }

    /// Compact the storage file
    pub fn vacuum(&self) -> Result<()> {
        let _tree = self.tree.write();
        self.store.flush()?;
        self.file_store.vacuum()
    }

    /// Get statistics about the storage
    pub fn stats(&self) -> Result<StorageStats> {
        let tree = self.tree.read();
        Ok(StorageStats {
            page_count: self.store.page_count()?,
            disk_page_count: self.file_store.disk_page_count(),
            cached_pages: self.cache.as_ref().map_or(0, |cache| cache.cached_page_count()),
            cache_hit_rate: self.cache.as_ref().map(|cache| cache.hit_rate()),
            tree_height: tree.height()?,
            node_capacity: tree.node_capacity(),
        })
    }

    /// Flush and close the storage
    pub fn close(self) -> Result<()> {
        self.flush()?;
        info!(path = %self.config.path.display(), "storage closed");
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.store.flush() {
            warn!(path = %self.config.path.display(), error = %e, "flush on drop failed");
        }
    }
}

/// Storage statistics
#[derive(Debug, Clone)]
pub struct StorageStats {
    /// Live pages
    pub page_count: usize,
    /// Disk slots the storage file spans
    pub disk_page_count: usize,
    /// Pages resident in the cache
    pub cached_pages: usize,
    /// Cache hit rate, if the cache is enabled
    pub cache_hit_rate: Option<f64>,
    /// Height of the B+Tree
    pub tree_height: usize,
    /// Entries per B+Tree node
    pub node_capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_basic_operations() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::open(Config::new(dir.path()))?;

        // Test set and get
        storage.set(b"key1", b"value1")?;
        assert_eq!(storage.get(b"key1")?, Some(b"value1".to_vec()));

        // Test update
        storage.set(b"key1", b"value2")?;
        assert_eq!(storage.get(b"key1")?, Some(b"value2".to_vec()));

        // Test remove
        assert!(storage.remove(b"key1")?);
        assert_eq!(storage.get(b"key1")?, None);

        // Test non-existent key
        assert_eq!(storage.get(b"nonexistent")?, None);
        assert!(!storage.remove(b"nonexistent")?);

        Ok(())
    }

    #[test]
    fn test_removed_key_stays_removed_after_reopen() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let storage = Storage::open(Config::new(dir.path()))?;
            storage.set(b"1", b"1")?;
            storage.set(b"1", b"2")?;
            assert_eq!(storage.get(b"1")?, Some(b"2".to_vec()));
            storage.remove(b"1")?;
            storage.close()?;
        }
        let storage = Storage::open(Config::new(dir.path()))?;
        assert_eq!(storage.get(b"1")?, None);
        assert_eq!(storage.count()?, 0);
        Ok(())
    }

    #[test]
    fn test_fresh_layout() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::open(Config::new(dir.path()))?;
        let stats = storage.stats()?;
        assert_eq!(stats.page_count, 3);
        assert_eq!(stats.tree_height, 1);
        assert!(dir.path().join(INFO_FILE).exists());
        assert!(!dir.path().join(crate::storage::RECOVERY_FILE).exists());

        let info: StorageInfo =
            serde_json::from_str(&fs::read_to_string(dir.path().join(INFO_FILE))?)?;
        assert_eq!(info.storage_type, STORAGE_TYPE);
        assert_eq!(info.page_size, DEFAULT_PAGE_SIZE);
        Ok(())
    }

    #[test]
    fn test_interrupted_initialization_starts_over() -> Result<()> {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path());
        {
            // a first open that died inside its initialization window
            StorageInfo::from_config(&config).save(&dir.path().join(INFO_FILE))?;
            let store = FilePageStore::open(dir.path(), config.store_options())?;
            store.enter_atomic_operation()?;
            let mut heading = store.create_page()?;
            heading.content_mut()?.fill(0xAB);
            store.update_page(&heading)?;
            store.create_page()?;
        }
        assert!(dir.path().join(crate::storage::RECOVERY_FILE).exists());

        let storage = Storage::open(config.clone())?;
        assert!(!dir.path().join(crate::storage::RECOVERY_FILE).exists());
        let stats = storage.stats()?;
        assert_eq!(stats.page_count, 3);
        assert_eq!(stats.tree_height, 1);
        assert_eq!(storage.count()?, 0);
        assert_eq!(storage.check_consistency()?, None);

        storage.set(b"after", b"crash")?;
        storage.close()?;
        let storage = Storage::open(config)?;
        assert_eq!(storage.get(b"after")?, Some(b"crash".to_vec()));
        Ok(())
    }

    #[test]
    fn test_persistence_with_and_without_cache() -> Result<()> {
        for cache_enabled in [true, false] {
            let dir = tempdir().unwrap();
            let config = Config::new(dir.path()).cache_enabled(cache_enabled);
            {
                let storage = Storage::open(config.clone())?;
                for i in 0..500u32 {
                    storage.set(format!("key{:04}", i).as_bytes(), &i.to_le_bytes())?;
                }
                storage.close()?;
            }
            let storage = Storage::open(config)?;
            assert_eq!(storage.count()?, 500);
            assert_eq!(storage.get(b"key0123")?, Some(123u32.to_le_bytes().to_vec()));
            assert_eq!(storage.check_consistency()?, None);
        }
        Ok(())
    }

    #[test]
    fn test_mismatched_identity_is_rejected() -> Result<()> {
        let dir = tempdir().unwrap();
        Storage::open(Config::new(dir.path()))?.close()?;

        let other_types = Config::new(dir.path()).types("u64", "string");
        assert!(matches!(
            Storage::open(other_types),
            Err(StorageError::StorageFormat(_))
        ));
        let other_pages = Config::new(dir.path()).page_size(8192);
        assert!(matches!(
            Storage::open(other_pages),
            Err(StorageError::StorageFormat(_))
        ));
        Storage::open(Config::new(dir.path()))?.close()
    }

    #[test]
    fn test_key_too_large() -> Result<()> {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path()).btree_config(BTreeConfig::new(16, 0.5));
        let storage = Storage::open(config)?;
        let key = [b'k'; 17];
        assert!(matches!(
            storage.set(&key, b"v"),
            Err(StorageError::KeyTooLarge { size: 17, max: 16 })
        ));
        storage.set(&key[..16], b"v")?;
        Ok(())
    }

    #[test]
    fn test_large_values() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::open(Config::new(dir.path()))?;
        let big: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        storage.set(b"big", &big)?;
        assert_eq!(storage.get(b"big")?, Some(big.clone()));
        assert_eq!(storage.get_raw_length(b"big")?, Some(big.len()));
        assert_eq!(
            storage.get_raw_segment(b"big", 10_000, 10_010)?,
            Some(big[10_000..10_010].to_vec())
        );

        storage.set(b"big", b"small now")?;
        assert_eq!(storage.get(b"big")?, Some(b"small now".to_vec()));
        Ok(())
    }

    #[test]
    fn test_range_and_neighbours() -> Result<()> {
        let dir = tempdir().unwrap();
        let storage = Storage::open(Config::new(dir.path()))?;

        storage.set(b"apple", b"1")?;
        storage.set(b"banana", b"2")?;
        storage.set(b"cherry", b"3")?;
        storage.set(b"date", b"4")?;

        assert_eq!(storage.range(None, None)?.len(), 4);
        let range = storage.range(Some(b"banana"), Some(b"date"))?;
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].0, b"banana".to_vec());
        assert_eq!(range[1].0, b"cherry".to_vec());

        assert_eq!(storage.min()?, Some(b"apple".to_vec()));
        assert_eq!(storage.max()?, Some(b"date".to_vec()));
        assert_eq!(storage.next_to(b"banana")?, Some(b"cherry".to_vec()));
        assert_eq!(storage.previous_to(b"banana")?, Some(b"apple".to_vec()));
        assert!(storage.exists(b"cherry")?);
        Ok(())
    }

    #[test]
    fn test_random_workload_matches_model() -> Result<()> {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path())
            .max_cached_pages(32)
            .max_dirty_pages(8)
            .vacuum_threshold(4);
        let storage = Storage::open(config.clone())?;
        let mut rng = StdRng::seed_from_u64(42);
        let mut model = BTreeMap::new();

        for _ in 0..4000 {
            let key = format!("k{}", rng.gen_range(0..1500)).into_bytes();
            if rng.gen_bool(0.65) {
                let value = vec![rng.gen::<u8>(); rng.gen_range(0..600)];
                storage.set(&key, &value)?;
                model.insert(key, value);
            } else {
                assert_eq!(storage.remove(&key)?, model.remove(&key).is_some());
            }
        }
        assert_eq!(storage.check_consistency()?, None);
        storage.vacuum()?;
        storage.close()?;

        let storage = Storage::open(config)?;
        assert_eq!(storage.count()?, model.len());
        let all = storage.range(None, None)?;
        let expected: Vec<_> = model.into_iter().collect();
        assert_eq!(all, expected);
        Ok(())
    }
}
