//! B+Tree layer: ordered index over keys with values in separate storage.

mod cursor;
mod node;
mod storage;
mod tree;

pub use cursor::Cursor;
pub use node::{node_capacity, BPlusTreeNode, NodeEntry};
pub use storage::{NodeStorage, PageNodeStorage, ValueStorage, MIN_NODE_CAPACITY};
pub use tree::BPlusTree;
