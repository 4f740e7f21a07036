//! B+Tree cursor for iteration.
//!
//! The cursor walks the leaf chain in key order. It holds a copy of the
//! current leaf and the position within it, and follows `next` links when
//! the leaf is exhausted. An optional exclusive upper bound stops it early.

use std::sync::Arc;

use crate::btree::node::BPlusTreeNode;
use crate::btree::storage::{NodeStorage, ValueStorage};
use crate::error::Result;

/// A cursor over key-value pairs in ascending key order
pub struct Cursor {
    nodes: Arc<dyn NodeStorage>,
    values: Arc<dyn ValueStorage>,
    /// Current leaf; `None` once the cursor is exhausted
    leaf: Option<BPlusTreeNode>,
    position: usize,
    end: Option<Vec<u8>>,
}

impl Cursor {
    pub(crate) fn new(
        nodes: Arc<dyn NodeStorage>,
        values: Arc<dyn ValueStorage>,
        leaf: BPlusTreeNode,
        position: usize,
        end: Option<Vec<u8>>,
    ) -> Self {
        Self {
            nodes,
            values,
            leaf: Some(leaf),
            position,
            end,
        }
    }

    /// Check if the cursor is positioned at a valid entry
    pub fn is_valid(&mut self) -> Result<bool> {
        Ok(self.current_key()?.is_some())
    }

    /// Key at the cursor, without advancing
    pub fn current_key(&mut self) -> Result<Option<&[u8]>> {
        self.settle()?;
        let Some(leaf) = &self.leaf else {
            return Ok(None);
        };
        Ok(leaf
            .entries
            .get(self.position)
            .map(|entry| entry.key.as_slice()))
    }

    /// Move past exhausted leaves and stop at the upper bound
    fn settle(&mut self) -> Result<()> {
        loop {
            let Some(leaf) = &self.leaf else {
                return Ok(());
            };
            match leaf.entries.get(self.position) {
                Some(entry) => {
                    if let Some(end) = &self.end {
                        if entry.key.as_slice() >= end.as_slice() {
                            self.leaf = None;
                        }
                    }
                    return Ok(());
                }
                None if leaf.next.is_some() => {
                    let next = self.nodes.fetch(leaf.next)?;
                    self.leaf = Some(next);
                    self.position = 0;
                }
                None => {
                    self.leaf = None;
                    return Ok(());
                }
            }
        }
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.settle()?;
        let Some(leaf) = &self.leaf else {
            return Ok(None);
        };
        let entry = &leaf.entries[self.position];
        let value = self.values.fetch(entry.reference)?;
        let key = entry.key.clone();
        self.position += 1;
        Ok(Some((key, value)))
    }
}

impl Iterator for Cursor {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(e) => {
                self.leaf = None;
                Some(Err(e))
            }
        }
    }
}
