//! Multi-page item blocks.
//!
//! An item too large for any single-page size range is stored in a chain of
//! dedicated pages. Every page of the chain carries a `MultipageItem` header
//! linking it to its neighbours and to the chain's first page. The first page
//! additionally stores the total item length right after the header.

use crate::error::{Result, StorageError};
use crate::page::header::{MultipageItemHeader, MULTIPAGE_ITEM_HEADER_LEN};
use crate::page::array_at;
use crate::types::PageIndex;

/// Size of the total-length prefix on the first page of a chain
pub const MULTIPAGE_LENGTH_PREFIX: usize = 8;

/// Payload bytes held by the first page of a chain
pub fn first_page_capacity(page_size: usize) -> usize {
    page_size - MULTIPAGE_ITEM_HEADER_LEN - MULTIPAGE_LENGTH_PREFIX
}

/// Payload bytes held by every following page of a chain
pub fn next_page_capacity(page_size: usize) -> usize {
    page_size - MULTIPAGE_ITEM_HEADER_LEN
}

/// Number of pages needed for an item of `length` bytes
pub fn page_count_for(length: usize, page_size: usize) -> usize {
    let first = first_page_capacity(page_size);
    if length <= first {
        1
    } else {
        1 + (length - first).div_ceil(next_page_capacity(page_size))
    }
}

/// Byte range of the item held by chain page `ordinal` (0 = first page)
pub fn chunk_bounds(ordinal: usize, length: usize, page_size: usize) -> (usize, usize) {
    let first = first_page_capacity(page_size);
    let (start, capacity) = if ordinal == 0 {
        (0, first)
    } else {
        (first + (ordinal - 1) * next_page_capacity(page_size), next_page_capacity(page_size))
    };
    let start = start.min(length);
    (start, (start + capacity).min(length))
}

/// Offset of the payload on a chain page
fn payload_offset(is_first: bool) -> usize {
    if is_first {
        MULTIPAGE_ITEM_HEADER_LEN + MULTIPAGE_LENGTH_PREFIX
    } else {
        MULTIPAGE_ITEM_HEADER_LEN
    }
}

/// Write one page of a chain.
///
/// `total_length` must be given for the first page and only for it.
pub fn write_multipage_block(
    bytes: &mut [u8],
    header: &MultipageItemHeader,
    total_length: Option<u64>,
    chunk: &[u8],
) -> Result<()> {
    let is_first = total_length.is_some();
    let offset = payload_offset(is_first);
    if offset + chunk.len() > bytes.len() {
        return Err(StorageError::page_format(format!(
            "chunk of {} bytes does not fit a multipage block",
            chunk.len()
        )));
    }
    bytes.fill(0);
    header.write(bytes)?;
    if let Some(length) = total_length {
        bytes[MULTIPAGE_ITEM_HEADER_LEN..offset].copy_from_slice(&length.to_le_bytes());
    }
    bytes[offset..offset + chunk.len()].copy_from_slice(chunk);
    Ok(())
}

/// Header of a chain page
pub fn read_multipage_header(bytes: &[u8]) -> Result<MultipageItemHeader> {
    MultipageItemHeader::read(bytes)
}

/// Total item length stored on the first page of a chain
pub fn read_multipage_total_length(bytes: &[u8], page_index: PageIndex) -> Result<u64> {
    let header = MultipageItemHeader::read(bytes)?;
    if header.start_page_index != page_index {
        return Err(StorageError::page_format(format!(
            "page {} is not the first page of its chain (starts at {})",
            page_index, header.start_page_index
        )));
    }
    Ok(u64::from_le_bytes(array_at(bytes, MULTIPAGE_ITEM_HEADER_LEN)))
}

/// Payload region `from..to` (relative to the page's chunk) of a chain page
pub fn read_multipage_chunk(bytes: &[u8], is_first: bool, from: usize, to: usize) -> Result<&[u8]> {
    MultipageItemHeader::read(bytes)?;
    let offset = payload_offset(is_first);
    if from > to || offset + to > bytes.len() {
        return Err(StorageError::out_of_range(format!(
            "chunk range {}..{} of a multipage block",
            from, to
        )));
    }
    Ok(&bytes[offset + from..offset + to])
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;

    #[test]
    fn test_page_counts() {
        let first = first_page_capacity(PAGE_SIZE);
        let next = next_page_capacity(PAGE_SIZE);
        assert_eq!(first, 4096 - 28 - 8);
        assert_eq!(page_count_for(0, PAGE_SIZE), 1);
        assert_eq!(page_count_for(first, PAGE_SIZE), 1);
        assert_eq!(page_count_for(first + 1, PAGE_SIZE), 2);
        assert_eq!(page_count_for(first + next, PAGE_SIZE), 2);
        assert_eq!(page_count_for(first + next + 1, PAGE_SIZE), 3);
    }

    #[test]
    fn test_chunk_bounds_cover_item() {
        let length = 10_000;
        let pages = page_count_for(length, PAGE_SIZE);
        let mut covered = 0;
        for ordinal in 0..pages {
            let (start, end) = chunk_bounds(ordinal, length, PAGE_SIZE);
            assert_eq!(start, covered);
            covered = end;
        }
        assert_eq!(covered, length);
    }

    #[test]
    fn test_first_block_roundtrip() -> Result<()> {
        let mut page = vec![0u8; PAGE_SIZE];
        let header = MultipageItemHeader {
            start_page_index: PageIndex::new(5),
            previous_page_index: PageIndex::NONE,
            next_page_index: PageIndex::new(6),
        };
        write_multipage_block(&mut page, &header, Some(5000), b"payload")?;

        assert_eq!(read_multipage_header(&page)?, header);
        assert_eq!(read_multipage_total_length(&page, PageIndex::new(5))?, 5000);
        assert_eq!(read_multipage_chunk(&page, true, 0, 7)?, b"payload");
        assert!(read_multipage_total_length(&page, PageIndex::new(6)).is_err());
        Ok(())
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let mut page = vec![0u8; PAGE_SIZE];
        let header = MultipageItemHeader {
            start_page_index: PageIndex::new(1),
            previous_page_index: PageIndex::new(1),
            next_page_index: PageIndex::NONE,
        };
        let chunk = vec![0u8; next_page_capacity(PAGE_SIZE) + 1];
        assert!(write_multipage_block(&mut page, &header, None, &chunk).is_err());
    }
}
