//! Free-space map.
//!
//! A chain of pages holding one 4-bit [`FsmValue`] per page of the store. FSM
//! page `n` of the chain covers page indices `n * E .. (n + 1) * E` where `E`
//! is the number of nibbles fitting after the FSM header. Two entries share a
//! byte, the even index in the low nibble. Fresh FSM pages are filled with
//! `0xFF`, so every page starts out `Full` until a data page is registered.
//!
//! Lookups are sped up by two per-instance caches: the last page seen with
//! room in each size range ("lucky" pages), and a memo of ranges for which a
//! full scan found nothing. The memo for a range is cleared by any `set` that
//! makes a page free in that range.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, StorageError};
use crate::page::header::{FsmHeader, FSM_HEADER_LEN};
use crate::page::Page;
use crate::storage::PageStore;
use crate::types::{FsmValue, PageIndex, SizeRange, SIZE_RANGE_COUNT};

/// Number of entries held by one FSM page
pub fn entries_per_page(page_size: usize) -> usize {
    (page_size - FSM_HEADER_LEN) * 2
}

struct FsmState {
    /// FSM pages in chain order
    chain: Vec<PageIndex>,
    lucky: [Option<PageIndex>; SIZE_RANGE_COUNT],
    exhausted: [bool; SIZE_RANGE_COUNT],
}

/// Free-space map over a page store
pub struct FreeSpaceMap {
    store: Arc<dyn PageStore>,
    entries_per_page: usize,
    state: Mutex<FsmState>,
}

impl FreeSpaceMap {
    /// Create the first FSM page of a new storage
    pub fn create(store: Arc<dyn PageStore>) -> Result<Self> {
        let page = store.create_page()?;
        let first = page.index();
        let page = init_fsm_page(page, PageIndex::NONE, 0)?;
        store.update_page(&page)?;
        debug!(page = %first, "free-space map created");
        Self::open(store, first)
    }

    /// Load the chain starting at `first_page`
    pub fn open(store: Arc<dyn PageStore>, first_page: PageIndex) -> Result<Self> {
        let entries_per_page = entries_per_page(store.page_size());
        let mut chain = Vec::new();
        let mut next = first_page;
        while next.is_some() {
            let mut page = store.fetch_page(next)?;
            let header = FsmHeader::read(page.content()?)?;
            let expected_base = (chain.len() * entries_per_page) as i64;
            if header.base_page_index.value() != expected_base {
                return Err(StorageError::page_format(format!(
                    "fsm page {} covers base {}, expected {}",
                    next, header.base_page_index, expected_base
                )));
            }
            chain.push(next);
            next = header.next_page_index;
        }

        Ok(Self {
            store,
            entries_per_page,
            state: Mutex::new(FsmState {
                chain,
                lucky: [None; SIZE_RANGE_COUNT],
                exhausted: [false; SIZE_RANGE_COUNT],
            }),
        })
    }

    /// First page of the chain
    pub fn first_page(&self) -> PageIndex {
        self.state.lock().chain.first().copied().unwrap_or(PageIndex::NONE)
    }

    /// Number of FSM pages in the chain
    pub fn chain_length(&self) -> usize {
        self.state.lock().chain.len()
    }

    /// Split a page index into (chain ordinal, entry within the FSM page)
    fn locate(&self, index: PageIndex) -> Result<(usize, usize)> {
        let value = usize::try_from(index.value())
            .map_err(|_| StorageError::out_of_range(format!("invalid page index {}", index)))?;
        Ok((value / self.entries_per_page, value % self.entries_per_page))
    }

    /// Extend the chain until it has an FSM page with this ordinal
    fn ensure_chain(&self, state: &mut FsmState, ordinal: usize) -> Result<PageIndex> {
        while state.chain.len() <= ordinal {
            let previous = *state
                .chain
                .last()
                .ok_or_else(|| StorageError::internal("free-space map chain is empty"))?;

            let base = (state.chain.len() * self.entries_per_page) as i64;
            let page = self.store.create_page()?;
            let new_index = page.index();
            let page = init_fsm_page(page, previous, base)?;
            self.store.update_page(&page)?;

            let mut last = self.store.fetch_page(previous)?;
            let mut header = FsmHeader::read(last.content()?)?;
            header.next_page_index = new_index;
            header.write(last.content_mut()?)?;
            self.store.update_page(&last)?;

            state.chain.push(new_index);
            debug!(page = %new_index, base, "free-space map extended");
        }
        Ok(state.chain[ordinal])
    }

    /// Value recorded for a page
    pub fn get(&self, index: PageIndex) -> Result<FsmValue> {
        let (ordinal, entry) = self.locate(index)?;
        let mut state = self.state.lock();
        let fsm_page = self.ensure_chain(&mut state, ordinal)?;
        let mut page = self.store.fetch_page(fsm_page)?;
        Ok(read_entry(page.content()?, entry))
    }

    /// Record a value for a page
    pub fn set(&self, index: PageIndex, value: FsmValue) -> Result<()> {
        let (ordinal, entry) = self.locate(index)?;
        let mut state = self.state.lock();
        let fsm_page = self.ensure_chain(&mut state, ordinal)?;

        let mut page = self.store.fetch_page(fsm_page)?;
        if read_entry(page.content()?, entry) != value {
            write_entry(page.content_mut()?, entry, value);
            self.store.update_page(&page)?;
        }

        for (range, lucky) in state.lucky.iter_mut().enumerate() {
            if *lucky == Some(index) && value != FsmValue::Free(SizeRange::SINGLE_PAGE[range]) {
                *lucky = None;
            }
        }
        if let FsmValue::Free(range) = value {
            if let Some(n) = range.ordinal() {
                state.exhausted[n] = false;
                state.lucky[n] = Some(index);
            }
        }
        trace!(page = %index, ?value, "fsm entry set");
        Ok(())
    }

    /// A page whose recorded value is `value`, if any
    pub fn get_free_page_index(&self, value: FsmValue) -> Result<Option<PageIndex>> {
        let n = match value {
            FsmValue::Free(range) => range.ordinal().ok_or_else(|| {
                StorageError::out_of_range(format!("no free-space class for {:?}", range))
            })?,
            FsmValue::Full => {
                return Err(StorageError::out_of_range(
                    "cannot search for full pages in the free-space map",
                ))
            }
        };

        let mut state = self.state.lock();
        if let Some(lucky) = state.lucky[n] {
            let (ordinal, entry) = self.locate(lucky)?;
            if let Some(&fsm_page) = state.chain.get(ordinal) {
                let mut page = self.store.fetch_page(fsm_page)?;
                if read_entry(page.content()?, entry) == value {
                    return Ok(Some(lucky));
                }
            }
            state.lucky[n] = None;
        }
        if state.exhausted[n] {
            return Ok(None);
        }

        let nibble = value.to_nibble();
        let chain = state.chain.clone();
        for (ordinal, &fsm_page) in chain.iter().enumerate() {
            let mut page = self.store.fetch_page(fsm_page)?;
            let bytes = page.content()?;
            let found = bytes[FSM_HEADER_LEN..]
                .iter()
                .enumerate()
                .find_map(|(i, &byte)| {
                    if byte & 0x0F == nibble {
                        Some(i * 2)
                    } else if byte >> 4 == nibble {
                        Some(i * 2 + 1)
                    } else {
                        None
                    }
                });
            if let Some(entry) = found {
                let index = PageIndex::new((ordinal * self.entries_per_page + entry) as i64);
                state.lucky[n] = Some(index);
                return Ok(Some(index));
            }
        }

        state.exhausted[n] = true;
        Ok(None)
    }
}

/// Fill a page as an empty FSM page: every entry `Full`
fn init_fsm_page(mut page: Page, previous: PageIndex, base: i64) -> Result<Page> {
    let bytes = page.content_mut()?;
    bytes.fill(0xFF);
    FsmHeader {
        previous_page_index: previous,
        next_page_index: PageIndex::NONE,
        base_page_index: PageIndex::new(base),
    }
    .write(bytes)?;
    Ok(page)
}

fn read_entry(bytes: &[u8], entry: usize) -> FsmValue {
    let byte = bytes[FSM_HEADER_LEN + entry / 2];
    let nibble = if entry % 2 == 0 { byte & 0x0F } else { byte >> 4 };
    FsmValue::from_nibble(nibble)
}

fn write_entry(bytes: &mut [u8], entry: usize, value: FsmValue) {
    let offset = FSM_HEADER_LEN + entry / 2;
    let nibble = value.to_nibble();
    bytes[offset] = if entry % 2 == 0 {
        (bytes[offset] & 0xF0) | nibble
    } else {
        (bytes[offset] & 0x0F) | (nibble << 4)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FilePageStore, StoreOptions};
    use tempfile::{tempdir, TempDir};

    fn setup() -> Result<(TempDir, Arc<dyn PageStore>, FreeSpaceMap)> {
        let dir = tempdir().unwrap();
        let store: Arc<dyn PageStore> =
            Arc::new(FilePageStore::open(dir.path(), StoreOptions::default())?);
        let fsm = FreeSpaceMap::create(store.clone())?;
        Ok((dir, store, fsm))
    }

    #[test]
    fn test_new_entries_are_full() -> Result<()> {
        let (_dir, _store, fsm) = setup()?;
        assert_eq!(fsm.get(PageIndex::new(0))?, FsmValue::Full);
        assert_eq!(fsm.get(PageIndex::new(5000))?, FsmValue::Full);
        Ok(())
    }

    #[test]
    fn test_set_get_across_chain() -> Result<()> {
        let (_dir, _store, fsm) = setup()?;
        let per_page = entries_per_page(4096) as i64;

        let probes = [
            0,
            1,
            2,
            per_page - 1,
            per_page,
            per_page + 1,
            3 * per_page + 17,
        ];
        for (i, &index) in probes.iter().enumerate() {
            let value = FsmValue::Free(SizeRange::SINGLE_PAGE[i % SIZE_RANGE_COUNT]);
            fsm.set(PageIndex::new(index), value)?;
        }
        for (i, &index) in probes.iter().enumerate() {
            let value = FsmValue::Free(SizeRange::SINGLE_PAGE[i % SIZE_RANGE_COUNT]);
            assert_eq!(fsm.get(PageIndex::new(index))?, value);
        }
        assert_eq!(fsm.chain_length(), 4);

        // neighbours sharing a byte are untouched
        fsm.set(PageIndex::new(1), FsmValue::Full)?;
        assert_eq!(fsm.get(PageIndex::new(0))?, FsmValue::Free(SizeRange::Range0));
        assert_eq!(fsm.get(PageIndex::new(2))?, FsmValue::Free(SizeRange::Range2));
        Ok(())
    }

    #[test]
    fn test_chain_survives_reopen() -> Result<()> {
        let (_dir, store, fsm) = setup()?;
        let far = PageIndex::new(entries_per_page(4096) as i64 * 2 + 3);
        fsm.set(far, FsmValue::Free(SizeRange::Range4))?;
        let first = fsm.first_page();
        drop(fsm);

        let fsm = FreeSpaceMap::open(store, first)?;
        assert_eq!(fsm.chain_length(), 3);
        assert_eq!(fsm.get(far)?, FsmValue::Free(SizeRange::Range4));
        Ok(())
    }

    #[test]
    fn test_get_free_page_index() -> Result<()> {
        let (_dir, _store, fsm) = setup()?;
        let wanted = FsmValue::Free(SizeRange::Range3);
        assert_eq!(fsm.get_free_page_index(wanted)?, None);

        fsm.set(PageIndex::new(40), wanted)?;
        fsm.set(PageIndex::new(12), wanted)?;
        // the most recently registered page is the lucky one
        assert_eq!(fsm.get_free_page_index(wanted)?, Some(PageIndex::new(12)));

        fsm.set(PageIndex::new(12), FsmValue::Full)?;
        assert_eq!(fsm.get_free_page_index(wanted)?, Some(PageIndex::new(40)));

        fsm.set(PageIndex::new(40), FsmValue::Free(SizeRange::Range2))?;
        assert_eq!(fsm.get_free_page_index(wanted)?, None);
        assert!(fsm.get_free_page_index(FsmValue::Full).is_err());
        Ok(())
    }

    #[test]
    fn test_exhausted_memo_cleared_by_set() -> Result<()> {
        let (_dir, _store, fsm) = setup()?;
        let wanted = FsmValue::Free(SizeRange::Range9);
        assert_eq!(fsm.get_free_page_index(wanted)?, None);

        let far = PageIndex::new(entries_per_page(4096) as i64 + 8);
        fsm.set(far, wanted)?;
        assert_eq!(fsm.get_free_page_index(wanted)?, Some(far));
        Ok(())
    }
}
