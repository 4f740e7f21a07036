//! Fixed-size item pages.
//!
//! A fixed-size-items page stores items of one size range in equally sized
//! slots:
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                    Page Header                      │
//! ├────────────────────────────────────────────────────┤
//! │              Length Marker Array (i16)              │
//! │  [len0][len1][len2]...      →                      │
//! ├────────────────────────────────────────────────────┤
//! │                   Free Space                        │
//! ├────────────────────────────────────────────────────┤
//! │      ←  [slot2][slot1][slot0]                      │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Slot `i` occupies `capacity` bytes ending `i * capacity` bytes before the
//! end of the page. A marker of `-1` denotes a deleted slot, which the next
//! insertion reuses before a fresh slot is taken. Deleted slots form a chain:
//! the header names the most recently deleted one and each deleted body
//! starts with the index of the next (`-1` ends it).

use crate::error::{Result, StorageError};
use crate::page::header::{FixedSizeItemsHeader, FIXED_SIZE_ITEMS_HEADER_LEN};
use crate::page::{read_i16, write_i16};
use crate::types::{SizeRange, FIXED_SLOT_MARKER_SIZE};

/// Marker value of a deleted slot
pub const DELETED_MARKER: i16 = -1;

/// End of the empty-slot chain
const NO_SLOT: i16 = -1;

/// Initialize an empty fixed-size-items page of the given range
pub fn init_fixed_size_items_page(bytes: &mut [u8], size_range: SizeRange) -> Result<()> {
    if size_range.slots_per_page(bytes.len()) == 0 {
        return Err(StorageError::page_format(format!(
            "no {:?} slot fits on a {} byte page",
            size_range,
            bytes.len()
        )));
    }
    bytes.fill(0);
    FixedSizeItemsHeader::new(size_range).write(bytes)
}

fn marker_offset(index: usize) -> usize {
    FIXED_SIZE_ITEMS_HEADER_LEN + index * FIXED_SLOT_MARKER_SIZE
}

fn slot_offset(page_size: usize, capacity: usize, index: usize) -> usize {
    page_size - (index + 1) * capacity
}

fn capacity_of(header: &FixedSizeItemsHeader) -> Result<usize> {
    header
        .size_range
        .capacity()
        .ok_or_else(|| StorageError::page_format("fixed-size items page without capacity"))
}

/// Read and validate the marker of a live slot
fn live_length(bytes: &[u8], header: &FixedSizeItemsHeader, index: i16) -> Result<usize> {
    if index < 0 || index >= header.item_count {
        return Err(StorageError::page_format(format!(
            "slot {} out of bounds (count: {})",
            index, header.item_count
        )));
    }
    let marker = read_i16(bytes, marker_offset(index as usize));
    if marker < 0 {
        return Err(StorageError::page_format(format!("slot {} is deleted", index)));
    }
    Ok(marker as usize)
}

/// Whether one more item of the page's range fits
pub fn has_free_space_for_fixed_size_item(bytes: &[u8]) -> Result<bool> {
    let header = FixedSizeItemsHeader::read(bytes)?;
    Ok(has_room(bytes.len(), &header))
}

fn has_room(page_size: usize, header: &FixedSizeItemsHeader) -> bool {
    header.empty_slot_count > 0
        || (header.item_count as usize) < header.size_range.slots_per_page(page_size)
}

/// Add an item to the page.
///
/// Returns the slot index and whether another item still fits afterwards,
/// so callers can refresh the free-space map without re-reading the page.
pub fn add_fixed_size_item(bytes: &mut [u8], item: &[u8]) -> Result<(i16, bool)> {
    let mut header = FixedSizeItemsHeader::read(bytes)?;
    let capacity = capacity_of(&header)?;
    if item.len() > capacity {
        return Err(StorageError::page_format(format!(
            "item of {} bytes does not fit a {:?} slot",
            item.len(),
            header.size_range
        )));
    }
    if !has_room(bytes.len(), &header) {
        return Err(StorageError::page_format("no free slot on page"));
    }

    let index = if header.empty_slot_count > 0 {
        let reused = header.first_empty_slot;
        if reused < 0
            || reused >= header.item_count
            || read_i16(bytes, marker_offset(reused as usize)) != DELETED_MARKER
        {
            return Err(StorageError::page_format(format!(
                "empty-slot chain points at slot {}",
                reused
            )));
        }
        let reused = reused as usize;
        header.first_empty_slot = read_i16(bytes, slot_offset(bytes.len(), capacity, reused));
        header.empty_slot_count -= 1;
        reused
    } else {
        let fresh = header.item_count as usize;
        header.item_count += 1;
        fresh
    };

    let offset = slot_offset(bytes.len(), capacity, index);
    bytes[offset..offset + capacity].fill(0);
    bytes[offset..offset + item.len()].copy_from_slice(item);
    write_i16(bytes, marker_offset(index), item.len() as i16);
    header.write(bytes)?;

    Ok((index as i16, has_room(bytes.len(), &header)))
}

/// Read the item in a slot
pub fn get_fixed_size_item(bytes: &[u8], index: i16) -> Result<Vec<u8>> {
    let header = FixedSizeItemsHeader::read(bytes)?;
    let capacity = capacity_of(&header)?;
    let length = live_length(bytes, &header, index)?;
    let offset = slot_offset(bytes.len(), capacity, index as usize);
    Ok(bytes[offset..offset + length].to_vec())
}

/// Length of the item in a slot
pub fn get_fixed_size_item_length(bytes: &[u8], index: i16) -> Result<usize> {
    let header = FixedSizeItemsHeader::read(bytes)?;
    live_length(bytes, &header, index)
}

/// Read `start..end` of the item in a slot
pub fn get_fixed_size_item_segment(
    bytes: &[u8],
    index: i16,
    start: usize,
    end: usize,
) -> Result<Vec<u8>> {
    let header = FixedSizeItemsHeader::read(bytes)?;
    let capacity = capacity_of(&header)?;
    let length = live_length(bytes, &header, index)?;
    if start > end || end > length {
        return Err(StorageError::out_of_range(format!(
            "segment {}..{} of a {} byte item",
            start, end, length
        )));
    }
    let offset = slot_offset(bytes.len(), capacity, index as usize);
    Ok(bytes[offset + start..offset + end].to_vec())
}

/// Overwrite a live slot with an item of the same size range
pub fn rewrite_fixed_size_item(bytes: &mut [u8], index: i16, item: &[u8]) -> Result<()> {
    let header = FixedSizeItemsHeader::read(bytes)?;
    let capacity = capacity_of(&header)?;
    live_length(bytes, &header, index)?;
    if item.len() > capacity {
        return Err(StorageError::page_format(format!(
            "item of {} bytes does not fit a {:?} slot",
            item.len(),
            header.size_range
        )));
    }
    let offset = slot_offset(bytes.len(), capacity, index as usize);
    bytes[offset..offset + capacity].fill(0);
    bytes[offset..offset + item.len()].copy_from_slice(item);
    write_i16(bytes, marker_offset(index as usize), item.len() as i16);
    Ok(())
}

/// Delete the item in a slot; the slot becomes reusable
pub fn delete_fixed_size_item(bytes: &mut [u8], index: i16) -> Result<()> {
    let mut header = FixedSizeItemsHeader::read(bytes)?;
    let capacity = capacity_of(&header)?;
    live_length(bytes, &header, index)?;
    let offset = slot_offset(bytes.len(), capacity, index as usize);
    bytes[offset..offset + capacity].fill(0);
    write_i16(bytes, offset, header.first_empty_slot);
    write_i16(bytes, marker_offset(index as usize), DELETED_MARKER);
    header.first_empty_slot = index;
    header.empty_slot_count += 1;
    header.write(bytes)
}

/// Number of live items on the page
pub fn fixed_size_item_count(bytes: &[u8]) -> Result<usize> {
    let header = FixedSizeItemsHeader::read(bytes)?;
    Ok((header.item_count - header.empty_slot_count).max(0) as usize)
}
