//! Error types for the storage engine.

use thiserror::Error;
use crate::types::PageIndex;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error from the underlying file system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page does not exist (never allocated or already removed)
    #[error("Page {0} not found")]
    PageNotFound(PageIndex),

    /// Unexpected header, size range mismatch, item that does not fit,
    /// or access to a deleted item
    #[error("Page format error: {0}")]
    PageFormat(String),

    /// Page map is inconsistent with the request (bad index, double free)
    #[error("Page map error: {0}")]
    PageMap(String),

    /// Argument outside of its valid range
    #[error("Argument out of range: {0}")]
    OutOfRange(String),

    /// An internal invariant was violated
    #[error("Internal error: {0}")]
    Internal(String),

    /// Persisted storage does not match the requested configuration
    #[error("Storage format error: {0}")]
    StorageFormat(String),

    /// Key exceeds maximum allowed size
    #[error("Key too large: {size} bytes (max: {max})")]
    KeyTooLarge { size: usize, max: usize },

    /// Data corruption detected (e.g., checksum mismatch)
    #[error("Corruption detected: {0}")]
    Corruption(String),

    /// Invalid operation for the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Storage info file could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Create a page format error
    pub fn page_format(msg: impl Into<String>) -> Self {
        Self::PageFormat(msg.into())
    }

    /// Create a page map error
    pub fn page_map(msg: impl Into<String>) -> Self {
        Self::PageMap(msg.into())
    }

    /// Create an out-of-range error
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        Self::OutOfRange(msg.into())
    }

    /// Create an internal invariant error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a storage format error
    pub fn storage_format(msg: impl Into<String>) -> Self {
        Self::StorageFormat(msg.into())
    }

    /// Create a corruption error with a message
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}
