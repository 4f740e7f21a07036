//! Page layer: binary layouts of page headers and item slots.
//!
//! Every page starts with a common header prefix:
//! ```text
//! Offset  Size  Description
//! 0       2     Header length (i16)
//! 2       1     Page type
//! 3       1     Size range
//! 4       ..    Type-specific fields
//! ```
//!
//! The codecs in this module are pure functions over a page's byte buffer.
//! Item layouts:
//! - `fixed`: equally sized slots of one size range, markers after the header
//! - `variable`: variable-length items with a free-space counter
//! - `multipage`: one page of a chain holding a large item

pub mod fixed;
pub mod header;
pub mod multipage;
pub mod variable;

pub use header::{
    FixedSizeItemsHeader, FsmHeader, HeadingHeader, MultipageItemHeader, NodeHeader, PageHeader,
    RadixTreeNodeHeader,
};

use std::any::Any;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::{Result, StorageError};
use crate::types::PageIndex;

/// A structured object that a page's bytes are produced from on demand.
///
/// Layers that keep pages in memory (the page cache) can hold the object
/// instead of its bytes; `serialize` runs once, when the bytes are first
/// needed, and every clone of the page shares the result.
pub trait PageBacking: Send + Sync + 'static {
    /// Produce the full page content (`page_size` bytes)
    fn serialize(&self, page_size: usize) -> Result<Vec<u8>>;

    /// Access to the concrete type, for readers that can reuse the object
    fn as_any(&self) -> &dyn Any;
}

/// Content of a page: either bytes, or an object pending serialization
#[derive(Clone)]
pub enum PageContent {
    /// Serialized page bytes
    Materialized(Vec<u8>),
    /// Structured object, serialized at first byte access or flush
    Deferred {
        backing: Arc<dyn PageBacking>,
        bytes: Arc<OnceLock<Vec<u8>>>,
    },
}

/// A page: stable logical index plus fixed-length content
#[derive(Clone)]
pub struct Page {
    index: PageIndex,
    page_size: usize,
    content: PageContent,
}

impl Page {
    /// Create a page from raw bytes
    pub fn new(index: PageIndex, bytes: Vec<u8>) -> Self {
        Self {
            index,
            page_size: bytes.len(),
            content: PageContent::Materialized(bytes),
        }
    }

    /// Create a zero-filled page
    pub fn zeroed(index: PageIndex, page_size: usize) -> Self {
        Self::new(index, vec![0u8; page_size])
    }

    /// Create a page whose bytes will be produced by `backing`
    pub fn deferred(index: PageIndex, page_size: usize, backing: Arc<dyn PageBacking>) -> Self {
        Self {
            index,
            page_size,
            content: PageContent::Deferred {
                backing,
                bytes: Arc::new(OnceLock::new()),
            },
        }
    }

    /// Logical index of this page
    pub fn index(&self) -> PageIndex {
        self.index
    }

    /// Length of the page content in bytes
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Whether the bytes have already been produced
    pub fn is_materialized(&self) -> bool {
        matches!(self.content, PageContent::Materialized(_))
    }

    /// The backing object, if the page is still deferred and of type `T`
    pub fn backing<T: 'static>(&self) -> Option<&T> {
        match &self.content {
            PageContent::Deferred { backing, .. } => backing.as_any().downcast_ref::<T>(),
            PageContent::Materialized(_) => None,
        }
    }

    /// Serialized bytes of a deferred page, produced on the first call
    fn serialized<'a>(
        &self,
        backing: &dyn PageBacking,
        bytes: &'a OnceLock<Vec<u8>>,
    ) -> Result<&'a [u8]> {
        if let Some(bytes) = bytes.get() {
            return Ok(bytes);
        }
        let serialized = backing.serialize(self.page_size)?;
        if serialized.len() != self.page_size {
            return Err(StorageError::page_format(format!(
                "page {} serialized to {} bytes, expected {}",
                self.index,
                serialized.len(),
                self.page_size
            )));
        }
        Ok(bytes.get_or_init(|| serialized))
    }

    /// Turn a deferred page into plain bytes; a no-op for materialized pages
    pub fn materialize(&mut self) -> Result<()> {
        if let PageContent::Deferred { backing, bytes } = &self.content {
            let content = self.serialized(backing.as_ref(), bytes)?.to_vec();
            self.content = PageContent::Materialized(content);
        }
        Ok(())
    }

    /// Page bytes, materializing the content first if needed
    pub fn content(&mut self) -> Result<&[u8]> {
        self.materialize()?;
        match &self.content {
            PageContent::Materialized(bytes) => Ok(bytes),
            PageContent::Deferred { .. } => Err(StorageError::internal("page not materialized")),
        }
    }

    /// Mutable page bytes; drops the backing object
    pub fn content_mut(&mut self) -> Result<&mut [u8]> {
        self.materialize()?;
        match &mut self.content {
            PageContent::Materialized(bytes) => Ok(bytes),
            PageContent::Deferred { .. } => Err(StorageError::internal("page not materialized")),
        }
    }

    /// Page bytes without dropping the backing object
    pub fn to_bytes(&self) -> Result<&[u8]> {
        match &self.content {
            PageContent::Materialized(bytes) => Ok(bytes),
            PageContent::Deferred { backing, bytes } => self.serialized(backing.as_ref(), bytes),
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("index", &self.index)
            .field("page_size", &self.page_size)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

/// Copy `N` bytes starting at `offset` into an array
pub(crate) fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[offset..offset + N]);
    buf
}

pub(crate) fn read_i16(bytes: &[u8], offset: usize) -> i16 {
    i16::from_le_bytes(array_at(bytes, offset))
}

pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(array_at(bytes, offset))
}

pub(crate) fn read_i64(bytes: &[u8], offset: usize) -> i64 {
    i64::from_le_bytes(array_at(bytes, offset))
}

pub(crate) fn write_i16(bytes: &mut [u8], offset: usize, value: i16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_i32(bytes: &mut [u8], offset: usize, value: i32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_i64(bytes: &mut [u8], offset: usize, value: i64) {
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}
