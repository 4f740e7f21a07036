//! Variable-size item pages.
//!
//! Items of arbitrary length share one page:
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │  Page Header (free space counter, item count)       │
//! ├────────────────────────────────────────────────────┤
//! │  Length Marker Array (i32)  [len0][len1]...  →     │
//! ├────────────────────────────────────────────────────┤
//! │                   Free Space                        │
//! ├────────────────────────────────────────────────────┤
//! │                 ←  [item2][item1][item0]           │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! Bodies are packed against the end of the page in index order, so the
//! body of item `i` ends where the bodies of items `0..i` begin. Growing,
//! shrinking or deleting an item shifts the bodies after it. A deleted item
//! keeps its index with a marker of `-1` and zero body bytes; the next
//! insertion reuses the index.

use crate::error::{Result, StorageError};
use crate::page::header::{RadixTreeNodeHeader, RADIX_TREE_NODE_HEADER_LEN};
use crate::page::{read_i32, write_i32};

/// Length marker of one variable-size item
pub const VARIABLE_MARKER_SIZE: usize = 4;

/// Marker value of a deleted item
pub const DELETED_MARKER: i32 = -1;

/// Initialize an empty variable-size-items page
pub fn init_variable_size_items_page(bytes: &mut [u8]) -> Result<()> {
    bytes.fill(0);
    RadixTreeNodeHeader {
        free_space: (bytes.len() - RADIX_TREE_NODE_HEADER_LEN) as i32,
        item_count: 0,
    }
    .write(bytes)
}

fn marker_offset(index: usize) -> usize {
    RADIX_TREE_NODE_HEADER_LEN + index * VARIABLE_MARKER_SIZE
}

fn body_length(marker: i32) -> usize {
    marker.max(0) as usize
}

/// End offset (exclusive) of the body of item `index`
fn body_end(bytes: &[u8], index: usize) -> usize {
    let before: usize = (0..index)
        .map(|i| body_length(read_i32(bytes, marker_offset(i))))
        .sum();
    bytes.len() - before
}

/// Lowest offset used by any body
fn bodies_start(bytes: &[u8], item_count: usize) -> usize {
    body_end(bytes, item_count)
}

fn check_index(header: &RadixTreeNodeHeader, index: i16) -> Result<usize> {
    if index < 0 || index >= header.item_count {
        return Err(StorageError::page_format(format!(
            "item {} out of bounds (count: {})",
            index, header.item_count
        )));
    }
    Ok(index as usize)
}

fn live_marker(bytes: &[u8], index: usize) -> Result<usize> {
    let marker = read_i32(bytes, marker_offset(index));
    if marker < 0 {
        return Err(StorageError::page_format(format!("item {} is deleted", index)));
    }
    Ok(marker as usize)
}

/// Change the body length of item `index` in place, shifting later bodies.
/// The resized body keeps its end offset; its content is left for the caller.
fn resize_body(
    bytes: &mut [u8],
    header: &RadixTreeNodeHeader,
    index: usize,
    old_len: usize,
    new_len: usize,
) -> usize {
    let end = body_end(bytes, index);
    let low = bodies_start(bytes, header.item_count as usize);
    let tail = low..end - old_len;
    if new_len > old_len {
        let delta = new_len - old_len;
        bytes.copy_within(tail, low - delta);
    } else if old_len > new_len {
        let delta = old_len - new_len;
        bytes.copy_within(tail, low + delta);
        bytes[low..low + delta].fill(0);
    }
    end - new_len
}

/// Free bytes left on the page
pub fn variable_size_items_free_space(bytes: &[u8]) -> Result<usize> {
    let header = RadixTreeNodeHeader::read(bytes)?;
    Ok(header.free_space.max(0) as usize)
}

/// Whether an item of `length` bytes can be added
pub fn has_free_space_for_variable_size_item(bytes: &[u8], length: usize) -> Result<bool> {
    let header = RadixTreeNodeHeader::read(bytes)?;
    let needed = if has_deleted(bytes, &header) {
        length
    } else {
        length + VARIABLE_MARKER_SIZE
    };
    Ok(header.free_space.max(0) as usize >= needed)
}

fn has_deleted(bytes: &[u8], header: &RadixTreeNodeHeader) -> bool {
    first_deleted(bytes, header).is_some()
}

fn first_deleted(bytes: &[u8], header: &RadixTreeNodeHeader) -> Option<usize> {
    (0..header.item_count as usize).find(|&i| read_i32(bytes, marker_offset(i)) == DELETED_MARKER)
}

/// Add an item, reusing the index of a deleted item when there is one.
///
/// Returns the item index and the free space remaining afterwards.
pub fn add_variable_size_item(bytes: &mut [u8], item: &[u8]) -> Result<(i16, usize)> {
    let mut header = RadixTreeNodeHeader::read(bytes)?;
    let reuse = first_deleted(bytes, &header);
    let needed = match reuse {
        Some(_) => item.len(),
        None => item.len() + VARIABLE_MARKER_SIZE,
    };
    if (header.free_space.max(0) as usize) < needed {
        return Err(StorageError::page_format(format!(
            "item of {} bytes does not fit ({} bytes free)",
            item.len(),
            header.free_space
        )));
    }

    let index = match reuse {
        Some(index) => index,
        None => {
            let index = header.item_count as usize;
            write_i32(bytes, marker_offset(index), 0);
            header.item_count += 1;
            index
        }
    };

    let start = resize_body(bytes, &header, index, 0, item.len());
    bytes[start..start + item.len()].copy_from_slice(item);
    write_i32(bytes, marker_offset(index), item.len() as i32);
    header.free_space -= needed as i32;
    header.write(bytes)?;

    Ok((index as i16, header.free_space.max(0) as usize))
}

/// Read an item
pub fn get_variable_size_item(bytes: &[u8], index: i16) -> Result<Vec<u8>> {
    let header = RadixTreeNodeHeader::read(bytes)?;
    let index = check_index(&header, index)?;
    let length = live_marker(bytes, index)?;
    let end = body_end(bytes, index);
    Ok(bytes[end - length..end].to_vec())
}

/// Replace an item, growing or shrinking its body in place
pub fn set_variable_size_item(bytes: &mut [u8], index: i16, item: &[u8]) -> Result<()> {
    let mut header = RadixTreeNodeHeader::read(bytes)?;
    let index = check_index(&header, index)?;
    let old_len = live_marker(bytes, index)?;
    if item.len() > old_len && item.len() - old_len > header.free_space.max(0) as usize {
        return Err(StorageError::page_format(format!(
            "item of {} bytes does not fit ({} bytes free)",
            item.len(),
            header.free_space
        )));
    }

    let start = resize_body(bytes, &header, index, old_len, item.len());
    bytes[start..start + item.len()].copy_from_slice(item);
    write_i32(bytes, marker_offset(index), item.len() as i32);
    header.free_space += old_len as i32 - item.len() as i32;
    header.write(bytes)
}

/// Delete an item; its body space is returned to the page immediately
pub fn delete_variable_size_item(bytes: &mut [u8], index: i16) -> Result<()> {
    let mut header = RadixTreeNodeHeader::read(bytes)?;
    let index = check_index(&header, index)?;
    let old_len = live_marker(bytes, index)?;
    resize_body(bytes, &header, index, old_len, 0);
    write_i32(bytes, marker_offset(index), DELETED_MARKER);
    header.free_space += old_len as i32;

    // trailing deleted markers can go away entirely
    while header.item_count > 0
        && read_i32(bytes, marker_offset(header.item_count as usize - 1)) == DELETED_MARKER
    {
        header.item_count -= 1;
        write_i32(bytes, marker_offset(header.item_count as usize), 0);
        header.free_space += VARIABLE_MARKER_SIZE as i32;
    }
    header.write(bytes)
}

/// Number of live items on the page
pub fn variable_size_item_count(bytes: &[u8]) -> Result<usize> {
    let header = RadixTreeNodeHeader::read(bytes)?;
    Ok((0..header.item_count as usize)
        .filter(|&i| read_i32(bytes, marker_offset(i)) >= 0)
        .count())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 4096;

    fn new_page() -> Vec<u8> {
        let mut bytes = vec![0u8; PAGE_SIZE];
        init_variable_size_items_page(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_add_and_get() -> Result<()> {
        let mut page = new_page();
        let initial = variable_size_items_free_space(&page)?;

        let (a, _) = add_variable_size_item(&mut page, b"hello")?;
        let (b, free) = add_variable_size_item(&mut page, b"variable size world")?;

        assert_eq!((a, b), (0, 1));
        assert_eq!(free, initial - 5 - 19 - 2 * VARIABLE_MARKER_SIZE);
        assert_eq!(get_variable_size_item(&page, a)?, b"hello");
        assert_eq!(get_variable_size_item(&page, b)?, b"variable size world");
        Ok(())
    }

    #[test]
    fn test_delete_shifts_later_items() -> Result<()> {
        let mut page = new_page();
        add_variable_size_item(&mut page, b"first")?;
        add_variable_size_item(&mut page, b"second")?;
        add_variable_size_item(&mut page, b"third")?;
        let before = variable_size_items_free_space(&page)?;

        delete_variable_size_item(&mut page, 1)?;
        assert_eq!(variable_size_items_free_space(&page)?, before + 6);
        assert!(get_variable_size_item(&page, 1).is_err());
        assert_eq!(get_variable_size_item(&page, 0)?, b"first");
        assert_eq!(get_variable_size_item(&page, 2)?, b"third");
        assert_eq!(variable_size_item_count(&page)?, 2);

        let (index, _) = add_variable_size_item(&mut page, b"reused slot")?;
        assert_eq!(index, 1);
        assert_eq!(get_variable_size_item(&page, 1)?, b"reused slot");
        assert_eq!(get_variable_size_item(&page, 2)?, b"third");
        Ok(())
    }

    #[test]
    fn test_trailing_deletes_release_markers() -> Result<()> {
        let mut page = new_page();
        let initial = variable_size_items_free_space(&page)?;
        add_variable_size_item(&mut page, b"a")?;
        add_variable_size_item(&mut page, b"b")?;

        delete_variable_size_item(&mut page, 0)?;
        delete_variable_size_item(&mut page, 1)?;
        assert_eq!(variable_size_items_free_space(&page)?, initial);
        assert_eq!(variable_size_item_count(&page)?, 0);
        Ok(())
    }

    #[test]
    fn test_set_grows_and_shrinks() -> Result<()> {
        let mut page = new_page();
        add_variable_size_item(&mut page, b"one")?;
        add_variable_size_item(&mut page, b"two")?;
        add_variable_size_item(&mut page, b"three")?;

        set_variable_size_item(&mut page, 0, b"one, but longer")?;
        assert_eq!(get_variable_size_item(&page, 0)?, b"one, but longer");
        assert_eq!(get_variable_size_item(&page, 1)?, b"two");
        assert_eq!(get_variable_size_item(&page, 2)?, b"three");

        set_variable_size_item(&mut page, 1, b"2")?;
        assert_eq!(get_variable_size_item(&page, 0)?, b"one, but longer");
        assert_eq!(get_variable_size_item(&page, 1)?, b"2");
        assert_eq!(get_variable_size_item(&page, 2)?, b"three");
        Ok(())
    }

    #[test]
    fn test_page_runs_out_of_space() -> Result<()> {
        let mut page = new_page();
        let free = variable_size_items_free_space(&page)?;
        let big = vec![9u8; free - VARIABLE_MARKER_SIZE];

        assert!(has_free_space_for_variable_size_item(&page, big.len())?);
        let (_, remaining) = add_variable_size_item(&mut page, &big)?;
        assert_eq!(remaining, 0);
        assert!(!has_free_space_for_variable_size_item(&page, 0)?);
        assert!(matches!(
            add_variable_size_item(&mut page, b""),
            Err(StorageError::PageFormat(_))
        ));
        Ok(())
    }
}
