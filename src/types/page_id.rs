//! Logical page index type.

use std::fmt;

/// Logical index of a page in the storage.
///
/// Logical indices are stable for the lifetime of a page: vacuum moves page
/// content between disk slots but never renumbers pages. `-1` is the
/// "no page" sentinel used by sibling, parent and chain links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageIndex(pub i64);

impl PageIndex {
    /// Sentinel value meaning "no page"
    pub const NONE: PageIndex = PageIndex(-1);

    /// The heading page (page 0)
    pub const HEADING: PageIndex = PageIndex(0);

    /// Create a new page index
    pub const fn new(index: i64) -> Self {
        Self(index)
    }

    /// Get the raw index value
    pub const fn value(self) -> i64 {
        self.0
    }

    /// Check if this index refers to a page
    pub const fn is_some(self) -> bool {
        self.0 >= 0
    }

    /// Check if this is the "no page" sentinel
    pub const fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl Default for PageIndex {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for PageIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<i64> for PageIndex {
    fn from(index: i64) -> Self {
        Self(index)
    }
}

impl From<PageIndex> for i64 {
    fn from(index: PageIndex) -> Self {
        index.0
    }
}
