//! Memory manager: byte blobs on pages.
//!
//! Small items live in slots of fixed-size-items pages picked through the
//! free-space map; items too large for any single-page size range get a
//! dedicated chain of pages. Items are addressed by [`DbItemReference`].

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, StorageError};
use crate::fsm::FreeSpaceMap;
use crate::page::fixed::{
    add_fixed_size_item, delete_fixed_size_item, fixed_size_item_count, get_fixed_size_item,
    get_fixed_size_item_length, get_fixed_size_item_segment, has_free_space_for_fixed_size_item,
    init_fixed_size_items_page, rewrite_fixed_size_item,
};
use crate::page::header::{read_page_type, FixedSizeItemsHeader, MultipageItemHeader};
use crate::page::multipage::{
    chunk_bounds, page_count_for, read_multipage_chunk, read_multipage_header,
    read_multipage_total_length, write_multipage_block,
};
use crate::page::Page;
use crate::storage::PageStore;
use crate::types::{DbItemReference, FsmValue, PageIndex, PageType, SizeRange};

/// Allocator of variable-length items
pub struct MemoryManager {
    store: Arc<dyn PageStore>,
    fsm: Arc<FreeSpaceMap>,
    page_size: usize,
    /// Serializes multi-page mutations
    lock: Mutex<()>,
}

impl MemoryManager {
    pub fn new(store: Arc<dyn PageStore>, fsm: Arc<FreeSpaceMap>) -> Self {
        let page_size = store.page_size();
        Self {
            store,
            fsm,
            page_size,
            lock: Mutex::new(()),
        }
    }

    /// Store `bytes` and return a reference to them
    pub fn allocate(&self, bytes: &[u8]) -> Result<DbItemReference> {
        let _guard = self.lock.lock();
        self.allocate_locked(bytes)
    }

    fn allocate_locked(&self, bytes: &[u8]) -> Result<DbItemReference> {
        match SizeRange::for_length(bytes.len(), self.page_size) {
            SizeRange::MultiPage => self.allocate_multipage(bytes),
            range => self.allocate_single_page(bytes, range),
        }
    }

    fn allocate_single_page(&self, bytes: &[u8], range: SizeRange) -> Result<DbItemReference> {
        let mut page = match self.fsm.get_free_page_index(FsmValue::Free(range))? {
            Some(index) => {
                let mut page = self.store.fetch_page(index)?;
                let header = FixedSizeItemsHeader::read(page.content()?)?;
                if header.size_range != range || !has_free_space_for_fixed_size_item(page.content()?)? {
                    return Err(StorageError::internal(format!(
                        "free-space map lists page {} for {:?} but it has no room",
                        index, range
                    )));
                }
                page
            }
            None => {
                let mut page = self.store.create_page()?;
                init_fixed_size_items_page(page.content_mut()?, range)?;
                trace!(page = %page.index(), ?range, "fixed-size items page created");
                page
            }
        };

        let (slot, has_room) = add_fixed_size_item(page.content_mut()?, bytes)?;
        self.store.update_page(&page)?;
        let value = if has_room {
            FsmValue::Free(range)
        } else {
            FsmValue::Full
        };
        self.fsm.set(page.index(), value)?;

        Ok(DbItemReference::new(page.index(), slot))
    }

    fn allocate_multipage(&self, bytes: &[u8]) -> Result<DbItemReference> {
        let count = page_count_for(bytes.len(), self.page_size);
        let mut pages = Vec::with_capacity(count);
        for _ in 0..count {
            pages.push(self.store.create_page()?);
        }
        let indices: Vec<PageIndex> = pages.iter().map(Page::index).collect();
        self.write_chain(&mut pages, &indices, bytes)?;

        trace!(page = %indices[0], pages = count, length = bytes.len(), "multipage item allocated");
        Ok(DbItemReference::new(indices[0], 0))
    }

    /// Write `bytes` across `pages`, linking them in order
    fn write_chain(&self, pages: &mut [Page], indices: &[PageIndex], bytes: &[u8]) -> Result<()> {
        let start = indices[0];
        for (ordinal, page) in pages.iter_mut().enumerate() {
            let header = MultipageItemHeader {
                start_page_index: start,
                previous_page_index: if ordinal == 0 {
                    PageIndex::NONE
                } else {
                    indices[ordinal - 1]
                },
                next_page_index: indices.get(ordinal + 1).copied().unwrap_or(PageIndex::NONE),
            };
            let (from, to) = chunk_bounds(ordinal, bytes.len(), self.page_size);
            let total_length = (ordinal == 0).then_some(bytes.len() as u64);
            write_multipage_block(page.content_mut()?, &header, total_length, &bytes[from..to])?;
            self.store.update_page(page)?;
        }
        Ok(())
    }

    /// Pages of the chain starting at `start`, in order
    fn chain_pages(&self, start: PageIndex) -> Result<Vec<Page>> {
        let mut pages = Vec::new();
        let mut next = start;
        while next.is_some() {
            let mut page = self.store.fetch_page(next)?;
            let header = read_multipage_header(page.content()?)?;
            if header.start_page_index != start {
                return Err(StorageError::page_format(format!(
                    "page {} belongs to the chain of {}, not {}",
                    next, header.start_page_index, start
                )));
            }
            next = header.next_page_index;
            pages.push(page);
        }
        Ok(pages)
    }

    fn fetch_item_page(&self, reference: DbItemReference) -> Result<(Page, PageType)> {
        if reference.is_null() {
            return Err(StorageError::out_of_range("null item reference"));
        }
        let mut page = self.store.fetch_page(reference.page_index)?;
        let page_type = read_page_type(page.content()?)?;
        match page_type {
            PageType::FixedSizeItems => Ok((page, page_type)),
            PageType::MultipageItem if reference.item_index == 0 => Ok((page, page_type)),
            other => Err(StorageError::page_format(format!(
                "reference {} points to a {:?} page",
                reference, other
            ))),
        }
    }

    /// Read a whole item
    pub fn fetch(&self, reference: DbItemReference) -> Result<Vec<u8>> {
        let (mut page, page_type) = self.fetch_item_page(reference)?;
        match page_type {
            PageType::FixedSizeItems => get_fixed_size_item(page.content()?, reference.item_index),
            _ => {
                let length = read_multipage_total_length(page.content()?, reference.page_index)?;
                self.read_chain_segment(page, 0, length as usize)
            }
        }
    }

    /// Length of an item in bytes
    pub fn get_length(&self, reference: DbItemReference) -> Result<usize> {
        let (mut page, page_type) = self.fetch_item_page(reference)?;
        match page_type {
            PageType::FixedSizeItems => {
                get_fixed_size_item_length(page.content()?, reference.item_index)
            }
            _ => Ok(read_multipage_total_length(page.content()?, reference.page_index)? as usize),
        }
    }

    /// Read bytes `start..end` of an item
    pub fn get_item_segment(
        &self,
        reference: DbItemReference,
        start: usize,
        end: usize,
    ) -> Result<Vec<u8>> {
        if start > end {
            return Err(StorageError::out_of_range(format!(
                "inverted segment {}..{}",
                start, end
            )));
        }
        let (mut page, page_type) = self.fetch_item_page(reference)?;
        match page_type {
            PageType::FixedSizeItems => {
                get_fixed_size_item_segment(page.content()?, reference.item_index, start, end)
            }
            _ => {
                let length = read_multipage_total_length(page.content()?, reference.page_index)?;
                if end as u64 > length {
                    return Err(StorageError::out_of_range(format!(
                        "segment {}..{} of a {} byte item",
                        start, end, length
                    )));
                }
                self.read_chain_segment(page, start, end)
            }
        }
    }

    /// Read `start..end` of a chained item, stopping after the last page needed
    fn read_chain_segment(&self, first: Page, start: usize, end: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(end - start);
        let start_index = first.index();
        let mut page = first;
        let mut ordinal = 0;
        let length = read_multipage_total_length(page.content()?, start_index)? as usize;

        loop {
            let (from, to) = chunk_bounds(ordinal, length, self.page_size);
            let lo = start.max(from);
            let hi = end.min(to);
            if lo < hi {
                out.extend_from_slice(read_multipage_chunk(
                    page.content()?,
                    ordinal == 0,
                    lo - from,
                    hi - from,
                )?);
            }
            if to >= end {
                break;
            }

            let header = read_multipage_header(page.content()?)?;
            if header.next_page_index.is_none() {
                return Err(StorageError::page_format(format!(
                    "chain of page {} ends before byte {}",
                    start_index, end
                )));
            }
            page = self.store.fetch_page(header.next_page_index)?;
            ordinal += 1;
        }
        Ok(out)
    }

    /// Release an item
    pub fn free(&self, reference: DbItemReference) -> Result<()> {
        let _guard = self.lock.lock();
        self.free_locked(reference)
    }

    fn free_locked(&self, reference: DbItemReference) -> Result<()> {
        let (mut page, page_type) = self.fetch_item_page(reference)?;
        match page_type {
            PageType::FixedSizeItems => {
                let range = FixedSizeItemsHeader::read(page.content()?)?.size_range;
                delete_fixed_size_item(page.content_mut()?, reference.item_index)?;
                if fixed_size_item_count(page.content()?)? == 0 {
                    self.fsm.set(page.index(), FsmValue::Full)?;
                    self.store.remove_page(page.index())?;
                    trace!(page = %page.index(), "empty fixed-size items page removed");
                } else {
                    self.store.update_page(&page)?;
                    self.fsm.set(page.index(), FsmValue::Free(range))?;
                }
            }
            _ => {
                read_multipage_total_length(page.content()?, reference.page_index)?;
                for page in self.chain_pages(reference.page_index)? {
                    self.store.remove_page(page.index())?;
                }
            }
        }
        Ok(())
    }

    /// Replace an item's bytes.
    ///
    /// The item stays where it is when the new payload keeps its size range
    /// (or, for chained items, its page count); otherwise the new payload is
    /// allocated first and the old item freed after, so the returned
    /// reference differs.
    pub fn reallocate(&self, reference: DbItemReference, bytes: &[u8]) -> Result<DbItemReference> {
        let _guard = self.lock.lock();
        let (mut page, page_type) = self.fetch_item_page(reference)?;
        let new_range = SizeRange::for_length(bytes.len(), self.page_size);

        match page_type {
            PageType::FixedSizeItems => {
                let range = FixedSizeItemsHeader::read(page.content()?)?.size_range;
                if range == new_range {
                    rewrite_fixed_size_item(page.content_mut()?, reference.item_index, bytes)?;
                    self.store.update_page(&page)?;
                    return Ok(reference);
                }
            }
            _ => {
                let length = read_multipage_total_length(page.content()?, reference.page_index)?;
                let old_count = page_count_for(length as usize, self.page_size);
                if new_range == SizeRange::MultiPage
                    && page_count_for(bytes.len(), self.page_size) == old_count
                {
                    let mut pages = self.chain_pages(reference.page_index)?;
                    let indices: Vec<PageIndex> = pages.iter().map(Page::index).collect();
                    self.write_chain(&mut pages, &indices, bytes)?;
                    return Ok(reference);
                }
            }
        }

        let moved = self.allocate_locked(bytes)?;
        self.free_locked(reference)?;
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::multipage::first_page_capacity;
    use crate::storage::{FilePageStore, StoreOptions};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::{tempdir, TempDir};

    fn setup() -> Result<(TempDir, Arc<dyn PageStore>, MemoryManager)> {
        let dir = tempdir().unwrap();
        let store: Arc<dyn PageStore> =
            Arc::new(FilePageStore::open(dir.path(), StoreOptions::default())?);
        let fsm = Arc::new(FreeSpaceMap::create(store.clone())?);
        let memory = MemoryManager::new(store.clone(), fsm);
        Ok((dir, store, memory))
    }

    #[test]
    fn test_small_items_share_a_page() -> Result<()> {
        let (_dir, _store, memory) = setup()?;
        let a = memory.allocate(b"alpha")?;
        let b = memory.allocate(b"bravo")?;

        assert_eq!(a.page_index, b.page_index);
        assert_ne!(a.item_index, b.item_index);
        assert_eq!(memory.fetch(a)?, b"alpha");
        assert_eq!(memory.fetch(b)?, b"bravo");
        assert_eq!(memory.get_length(b)?, 5);
        Ok(())
    }

    #[test]
    fn test_ranges_use_separate_pages() -> Result<()> {
        let (_dir, _store, memory) = setup()?;
        let small = memory.allocate(&[1u8; 8])?;
        let medium = memory.allocate(&[2u8; 300])?;
        assert_ne!(small.page_index, medium.page_index);
        Ok(())
    }

    #[test]
    fn test_empty_page_is_removed() -> Result<()> {
        let (_dir, store, memory) = setup()?;
        let reference = memory.allocate(b"lonely")?;
        assert!(store.page_exists(reference.page_index)?);

        memory.free(reference)?;
        assert!(!store.page_exists(reference.page_index)?);
        assert!(memory.fetch(reference).is_err());

        // the next allocation does not pick the removed page from the map
        let next = memory.allocate(b"again")?;
        assert_eq!(memory.fetch(next)?, b"again");
        Ok(())
    }

    #[test]
    fn test_multipage_item() -> Result<()> {
        let (_dir, store, memory) = setup()?;
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let before = store.page_count()?;

        let reference = memory.allocate(&payload)?;
        assert_eq!(reference.item_index, 0);
        assert_eq!(store.page_count()? - before, 3);
        assert_eq!(memory.fetch(reference)?, payload);
        assert_eq!(memory.get_length(reference)?, payload.len());

        let boundary = first_page_capacity(4096);
        assert_eq!(
            memory.get_item_segment(reference, boundary - 5, boundary + 5)?,
            payload[boundary - 5..boundary + 5]
        );
        assert_eq!(
            memory.get_item_segment(reference, 9_990, 10_000)?,
            payload[9_990..]
        );
        assert!(memory.get_item_segment(reference, 0, 10_001).is_err());
        assert!(matches!(
            memory.get_item_segment(reference, 10, 5),
            Err(StorageError::OutOfRange(_))
        ));

        memory.free(reference)?;
        assert_eq!(store.page_count()?, before);
        Ok(())
    }

    #[test]
    fn test_reallocate() -> Result<()> {
        let (_dir, store, memory) = setup()?;
        let reference = memory.allocate(b"twelve bytes")?;

        // same size range: rewritten in place
        let same = memory.reallocate(reference, b"thirteen byte")?;
        assert_eq!(same, reference);
        assert_eq!(memory.fetch(same)?, b"thirteen byte");

        // larger range: moved
        let moved = memory.reallocate(same, &[7u8; 500])?;
        assert_ne!(moved.page_index, reference.page_index);
        assert_eq!(memory.fetch(moved)?, vec![7u8; 500]);
        assert_eq!(memory.get_length(moved)?, 500);
        // the old page held only this item and is gone
        assert!(!store.page_exists(reference.page_index)?);

        // chained item with the same page count keeps its pages
        let big = memory.allocate(&[1u8; 5000])?;
        let rewritten = memory.reallocate(big, &[2u8; 5100])?;
        assert_eq!(rewritten, big);
        assert_eq!(memory.fetch(rewritten)?, vec![2u8; 5100]);
        Ok(())
    }

    #[test]
    fn test_random_allocations_keep_content() -> Result<()> {
        let (_dir, _store, memory) = setup()?;
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut live = Vec::new();

        for _ in 0..300 {
            let length = if rng.gen_bool(0.1) {
                rng.gen_range(1_300..12_000)
            } else {
                rng.gen_range(0..1_280)
            };
            let payload: Vec<u8> = (0..length).map(|_| rng.gen()).collect();
            let reference = memory.allocate(&payload)?;
            live.push((reference, payload));
        }

        let mut freed = Vec::new();
        let mut i = 0;
        live.retain(|(reference, _)| {
            i += 1;
            if i % 2 == 0 {
                freed.push(*reference);
                false
            } else {
                true
            }
        });
        for reference in &freed {
            memory.free(*reference)?;
        }
        for reference in &freed {
            assert!(memory.fetch(*reference).is_err(), "freed {} still readable", reference);
        }
        for (reference, payload) in &live {
            assert_eq!(&memory.fetch(*reference)?, payload);
        }

        for _ in 0..100 {
            let length = rng.gen_range(0..3_000);
            let payload: Vec<u8> = (0..length).map(|_| rng.gen()).collect();
            let reference = memory.allocate(&payload)?;
            live.push((reference, payload));
        }
        for (reference, payload) in &live {
            assert_eq!(&memory.fetch(*reference)?, payload);
        }
        Ok(())
    }
}
