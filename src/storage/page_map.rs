//! Page map: logical page index → disk slot.
//!
//! Logical indices are stable for a page's lifetime while the page itself may
//! move between disk slots (vacuum). The map is persisted to its own file:
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Logical page count (i64)
//! 8       8     On-disk page count (i64)
//! 16      8     Released page count (i64)
//! 24      16*n  Entries: [disk slot of logical i][logical owner of disk slot i]
//! ```
//!
//! `-1` marks a removed logical index or a free disk slot. Released logical
//! indices are reused before the map grows ("resurrection").

use std::collections::{BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{Result, StorageError};
use crate::page::{read_i64, write_i64};
use crate::types::PageIndex;

/// Size of the page map file header
pub const PAGE_MAP_HEADER_SIZE: usize = 24;

/// Size of one page map entry
pub const PAGE_MAP_ENTRY_SIZE: usize = 16;

const NONE: i64 = -1;

/// A page relocation produced by vacuum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub page: PageIndex,
    pub from_slot: i64,
    pub to_slot: i64,
}

/// Result of creating a page in the map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub page: PageIndex,
    pub slot: i64,
    /// Whether the logical index was released before
    pub resurrected: bool,
}

/// In-memory page map with incremental persistence
pub struct PageMap {
    file: File,
    /// Disk slot of each logical page
    slots: Vec<i64>,
    /// Logical owner of each disk slot
    owners: Vec<i64>,
    /// Released logical indices, most recent last
    released: Vec<PageIndex>,
    /// Unused disk slots below the on-disk page count
    free_slots: BTreeSet<i64>,
    /// Entries changed since the last flush
    dirty: HashSet<usize>,
    header_dirty: bool,
}

impl PageMap {
    /// Open the page map file, creating an empty map if it does not exist
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut map = Self {
            file,
            slots: Vec::new(),
            owners: Vec::new(),
            released: Vec::new(),
            free_slots: BTreeSet::new(),
            dirty: HashSet::new(),
            header_dirty: true,
        };

        if !bytes.is_empty() {
            map.load(&bytes)?;
        }
        Ok(map)
    }

    fn load(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < PAGE_MAP_HEADER_SIZE {
            return Err(StorageError::page_map("page map file is truncated"));
        }
        let page_count = read_i64(bytes, 0);
        let disk_count = read_i64(bytes, 8);
        let released_count = read_i64(bytes, 16);
        if page_count < 0 || disk_count < 0 || disk_count > page_count {
            return Err(StorageError::page_map(format!(
                "invalid page map counts: {} logical, {} on disk",
                page_count, disk_count
            )));
        }

        let expected = PAGE_MAP_HEADER_SIZE + page_count as usize * PAGE_MAP_ENTRY_SIZE;
        if bytes.len() < expected {
            return Err(StorageError::page_map(format!(
                "page map has {} bytes, expected {}",
                bytes.len(),
                expected
            )));
        }

        self.slots = Vec::with_capacity(page_count as usize);
        self.owners = Vec::with_capacity(disk_count as usize);
        for i in 0..page_count as usize {
            let offset = PAGE_MAP_HEADER_SIZE + i * PAGE_MAP_ENTRY_SIZE;
            self.slots.push(read_i64(bytes, offset));
            if (i as i64) < disk_count {
                self.owners.push(read_i64(bytes, offset + 8));
            }
        }

        for (logical, &slot) in self.slots.iter().enumerate() {
            if slot == NONE {
                self.released.push(PageIndex::new(logical as i64));
            } else if slot < 0
                || slot >= disk_count
                || self.owners[slot as usize] != logical as i64
            {
                return Err(StorageError::page_map(format!(
                    "logical page {} maps to inconsistent slot {}",
                    logical, slot
                )));
            }
        }
        for (slot, &owner) in self.owners.iter().enumerate() {
            if owner == NONE {
                self.free_slots.insert(slot as i64);
            }
        }

        if self.released.len() as i64 != released_count {
            return Err(StorageError::page_map(format!(
                "page map records {} released pages, found {}",
                released_count,
                self.released.len()
            )));
        }
        self.header_dirty = false;
        Ok(())
    }

    /// Number of logical indices ever handed out (live and released)
    pub fn page_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of disk slots in use or free below the file end
    pub fn disk_count(&self) -> usize {
        self.owners.len()
    }

    /// Number of live pages
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.released.len()
    }

    /// Number of free disk slots
    pub fn free_slot_count(&self) -> usize {
        self.free_slots.len()
    }

    /// Disk slot of a live page
    pub fn slot_of(&self, page: PageIndex) -> Option<i64> {
        let i = usize::try_from(page.value()).ok()?;
        self.slots.get(i).copied().filter(|&slot| slot != NONE)
    }

    /// Whether a logical page is live
    pub fn exists(&self, page: PageIndex) -> bool {
        self.slot_of(page).is_some()
    }

    fn take_slot(&mut self) -> i64 {
        match self.free_slots.pop_first() {
            Some(slot) => slot,
            None => {
                self.owners.push(NONE);
                self.header_dirty = true;
                self.owners.len() as i64 - 1
            }
        }
    }

    fn assign(&mut self, logical: usize, slot: i64) {
        self.slots[logical] = slot;
        self.owners[slot as usize] = logical as i64;
        self.dirty.insert(logical);
        self.dirty.insert(slot as usize);
    }

    /// Create a page: reuse the most recently released logical index if any,
    /// and the lowest free disk slot if any
    pub fn allocate(&mut self) -> Allocation {
        let (logical, resurrected) = match self.released.pop() {
            Some(page) => (page.value() as usize, true),
            None => {
                self.slots.push(NONE);
                (self.slots.len() - 1, false)
            }
        };
        let slot = self.take_slot();
        self.assign(logical, slot);
        self.header_dirty = true;

        Allocation {
            page: PageIndex::new(logical as i64),
            slot,
            resurrected,
        }
    }

    /// Make sure a specific logical page is live, allocating it if needed.
    /// Used when replaying a recovery log.
    pub fn ensure(&mut self, page: PageIndex) -> Result<i64> {
        if let Some(slot) = self.slot_of(page) {
            return Ok(slot);
        }
        let logical = usize::try_from(page.value())
            .map_err(|_| StorageError::page_map(format!("invalid page index {}", page)))?;

        while self.slots.len() <= logical {
            self.released.push(PageIndex::new(self.slots.len() as i64));
            self.slots.push(NONE);
            self.dirty.insert(self.slots.len() - 1);
        }
        self.released.retain(|&p| p != page);

        let slot = self.take_slot();
        self.assign(logical, slot);
        self.header_dirty = true;
        Ok(slot)
    }

    /// Remove a live page; returns the disk slot it occupied
    pub fn release(&mut self, page: PageIndex) -> Result<i64> {
        let slot = self
            .slot_of(page)
            .ok_or_else(|| StorageError::page_map(format!("page {} is not allocated", page)))?;
        let logical = page.value() as usize;

        self.slots[logical] = NONE;
        self.owners[slot as usize] = NONE;
        self.free_slots.insert(slot);
        self.released.push(page);
        self.dirty.insert(logical);
        self.dirty.insert(slot as usize);
        self.header_dirty = true;
        Ok(slot)
    }

    /// Next vacuum step: move the highest occupied slot into the lowest free one
    pub fn next_relocation(&self) -> Option<Relocation> {
        let to_slot = *self.free_slots.first()?;
        let from_slot = (0..self.owners.len())
            .rev()
            .find(|&slot| self.owners[slot] != NONE)? as i64;
        if from_slot <= to_slot {
            return None;
        }
        Some(Relocation {
            page: PageIndex::new(self.owners[from_slot as usize]),
            from_slot,
            to_slot,
        })
    }

    /// Record a relocation whose bytes have already been copied
    pub fn apply_relocation(&mut self, relocation: Relocation) {
        let logical = relocation.page.value() as usize;
        self.free_slots.remove(&relocation.to_slot);
        self.owners[relocation.from_slot as usize] = NONE;
        self.free_slots.insert(relocation.from_slot);
        self.assign(logical, relocation.to_slot);
        self.dirty.insert(relocation.from_slot as usize);
    }

    /// Drop free slots at the end of the file; returns the new on-disk count
    pub fn trim_free_tail(&mut self) -> usize {
        while let Some(&last) = self.owners.last() {
            if last != NONE {
                break;
            }
            let slot = self.owners.len() as i64 - 1;
            self.owners.pop();
            self.free_slots.remove(&slot);
            self.dirty.insert(slot as usize);
            self.header_dirty = true;
        }
        self.owners.len()
    }

    /// Whether there are unpersisted changes
    pub fn is_dirty(&self) -> bool {
        self.header_dirty || !self.dirty.is_empty()
    }

    /// Persist the header and every changed entry
    pub fn flush(&mut self, sync: bool) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let mut header = [0u8; PAGE_MAP_HEADER_SIZE];
        write_i64(&mut header, 0, self.slots.len() as i64);
        write_i64(&mut header, 8, self.owners.len() as i64);
        write_i64(&mut header, 16, self.released.len() as i64);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;

        let mut entries: Vec<usize> = self.dirty.drain().collect();
        entries.sort_unstable();
        for i in entries.into_iter().filter(|&i| i < self.slots.len()) {
            let mut entry = [0u8; PAGE_MAP_ENTRY_SIZE];
            write_i64(&mut entry, 0, self.slots[i]);
            write_i64(&mut entry, 8, self.owners.get(i).copied().unwrap_or(NONE));
            let offset = PAGE_MAP_HEADER_SIZE + i * PAGE_MAP_ENTRY_SIZE;
            self.file.seek(SeekFrom::Start(offset as u64))?;
            self.file.write_all(&entry)?;
        }

        if sync {
            self.file.sync_data()?;
        }
        self.header_dirty = false;
        debug!(
            pages = self.slots.len(),
            on_disk = self.owners.len(),
            released = self.released.len(),
            "page map flushed"
        );
        Ok(())
    }
}
