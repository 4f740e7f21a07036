//! B+Tree implementation.
//!
//! Keys are arbitrary byte strings ordered lexicographically. Leaves hold
//! references to values kept by a [`ValueStorage`]; every non-leaf entry
//! carries the largest key of the subtree it points to. Nodes on one level
//! form a doubly linked list in key order.
//!
//! Rebalancing:
//! - An overflowing node first tries to rotate entries into a sibling with
//!   the same parent, and splits in half only when neither has room.
//! - A node at or below the fill factor is combined with a same-parent
//!   sibling when both fit one node. Empty nodes are unlinked and removed.
//! - A root left with a single child is replaced by that child.

use std::sync::Arc;

use tracing::trace;

use crate::btree::cursor::Cursor;
use crate::btree::node::{BPlusTreeNode, NodeEntry};
use crate::btree::storage::{NodeStorage, ValueStorage, MIN_NODE_CAPACITY};
use crate::error::{Result, StorageError};
use crate::types::{BTreeConfig, PageIndex};

/// B+Tree over pluggable node and value storages
pub struct BPlusTree {
    nodes: Arc<dyn NodeStorage>,
    values: Arc<dyn ValueStorage>,
    config: BTreeConfig,
    capacity: usize,
}

impl BPlusTree {
    /// Attach to the tree whose root `nodes` reports
    pub fn new(
        nodes: Arc<dyn NodeStorage>,
        values: Arc<dyn ValueStorage>,
        config: BTreeConfig,
    ) -> Result<Self> {
        let capacity = nodes.node_capacity();
        if capacity < MIN_NODE_CAPACITY {
            return Err(StorageError::out_of_range(format!(
                "node capacity {} is below {}",
                capacity, MIN_NODE_CAPACITY
            )));
        }
        Ok(Self {
            nodes,
            values,
            config,
            capacity,
        })
    }

    pub fn config(&self) -> &BTreeConfig {
        &self.config
    }

    /// Entries per node
    pub fn node_capacity(&self) -> usize {
        self.capacity
    }

    /// Get the value stored under `key`
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = self.find_leaf(key)?;
        match leaf.search(key) {
            Ok(position) => Ok(Some(self.values.fetch(leaf.entries[position].reference)?)),
            Err(_) => Ok(None),
        }
    }

    /// Length of the value stored under `key`, without reading it
    pub fn value_length(&self, key: &[u8]) -> Result<Option<usize>> {
        let leaf = self.find_leaf(key)?;
        match leaf.search(key) {
            Ok(position) => Ok(Some(
                self.values
                    .get_raw_length(leaf.entries[position].reference)?,
            )),
            Err(_) => Ok(None),
        }
    }

    /// Bytes `start..end` of the value stored under `key`
    pub fn value_segment(&self, key: &[u8], start: usize, end: usize) -> Result<Option<Vec<u8>>> {
        let leaf = self.find_leaf(key)?;
        match leaf.search(key) {
            Ok(position) => Ok(Some(self.values.get_raw_segment(
                leaf.entries[position].reference,
                start,
                end,
            )?)),
            Err(_) => Ok(None),
        }
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.find_leaf(key)?.search(key).is_ok())
    }

    /// Insert or replace the value under `key`
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if key.len() > self.config.max_key_size {
            return Err(StorageError::KeyTooLarge {
                size: key.len(),
                max: self.config.max_key_size,
            });
        }

        let mut leaf = self.find_leaf(key)?;
        match leaf.search(key) {
            Ok(position) => {
                let old = leaf.entries[position].reference;
                let reference = self.values.reallocate(old, value)?;
                if reference != old {
                    leaf.entries[position].reference = reference;
                    self.nodes.update(&leaf)?;
                }
                Ok(())
            }
            Err(position) => {
                let reference = self.values.allocate(value)?;
                leaf.entries
                    .insert(position, NodeEntry::new(key.to_vec(), reference));
                let index = leaf.index;
                self.with_pinned(index, || {
                    if position + 1 == leaf.len() {
                        self.align_maximal_values(&leaf)?;
                    }
                    if leaf.len() > self.capacity {
                        self.handle_overflow(leaf)
                    } else {
                        self.nodes.update(&leaf)
                    }
                })
            }
        }
    }

    /// Remove `key`; returns whether it was present
    pub fn remove(&mut self, key: &[u8]) -> Result<bool> {
        let mut leaf = self.find_leaf(key)?;
        let Ok(position) = leaf.search(key) else {
            return Ok(false);
        };

        let entry = leaf.entries.remove(position);
        self.values.free(entry.reference)?;
        let index = leaf.index;
        self.with_pinned(index, || {
            self.nodes.update(&leaf)?;
            if position == leaf.len() {
                self.align_maximal_values(&leaf)?;
            }
            self.handle_underflow(leaf)
        })?;
        Ok(true)
    }

    /// Smallest key
    pub fn min(&self) -> Result<Option<Vec<u8>>> {
        let leaf = self.edge_leaf(false)?;
        Ok(leaf.min_key().map(<[u8]>::to_vec))
    }

    /// Largest key
    pub fn max(&self) -> Result<Option<Vec<u8>>> {
        let leaf = self.edge_leaf(true)?;
        Ok(leaf.max_key().map(<[u8]>::to_vec))
    }

    /// Smallest key strictly greater than `key`
    pub fn next_to(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = self.find_leaf(key)?;
        let position = match leaf.search(key) {
            Ok(position) => position + 1,
            Err(position) => position,
        };
        if let Some(entry) = leaf.entries.get(position) {
            return Ok(Some(entry.key.clone()));
        }
        let mut next = leaf.next;
        while next.is_some() {
            let node = self.nodes.fetch(next)?;
            if let Some(key) = node.min_key() {
                return Ok(Some(key.to_vec()));
            }
            next = node.next;
        }
        Ok(None)
    }

    /// Largest key strictly less than `key`
    pub fn previous_to(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let leaf = self.find_leaf(key)?;
        let position = match leaf.search(key) {
            Ok(position) | Err(position) => position,
        };
        if position > 0 {
            return Ok(Some(leaf.entries[position - 1].key.clone()));
        }
        let mut previous = leaf.previous;
        while previous.is_some() {
            let node = self.nodes.fetch(previous)?;
            if let Some(key) = node.max_key() {
                return Ok(Some(key.to_vec()));
            }
            previous = node.previous;
        }
        Ok(None)
    }

    /// Number of keys, counted along the leaf chain
    pub fn count(&self) -> Result<usize> {
        let mut node = self.edge_leaf(false)?;
        let mut count = node.len();
        while node.next.is_some() {
            node = self.nodes.fetch(node.next)?;
            count += node.len();
        }
        Ok(count)
    }

    /// Number of levels, a lone root leaf being 1
    pub fn height(&self) -> Result<usize> {
        let mut node = self.nodes.fetch_root()?;
        let mut height = 1;
        while !node.is_leaf {
            node = self.first_child(&node)?;
            height += 1;
        }
        Ok(height)
    }

    /// Cursor at the first key not below `start` (or the smallest key)
    pub fn cursor(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<Cursor> {
        let (leaf, position) = match start {
            Some(start) => {
                let leaf = self.find_leaf(start)?;
                let position = match leaf.search(start) {
                    Ok(position) | Err(position) => position,
                };
                (leaf, position)
            }
            None => (self.edge_leaf(false)?, 0),
        };
        Ok(Cursor::new(
            self.nodes.clone(),
            self.values.clone(),
            leaf,
            position,
            end.map(<[u8]>::to_vec),
        ))
    }

    /// Key-value pairs with `start <= key < end`
    pub fn scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.cursor(start, end)?.collect()
    }

    /// Validate the whole structure.
    ///
    /// Returns a description of the first violation found, or `None`.
    pub fn check_consistency(&self) -> Result<Option<String>> {
        let root = self.nodes.fetch_root()?;
        if root.previous.is_some() || root.next.is_some() {
            return Ok(Some(format!("root {} has siblings", root.index)));
        }
        if !root.is_leaf && root.is_empty() {
            return Ok(Some(format!("non-leaf root {} is empty", root.index)));
        }
        let mut leaf_depth = None;
        self.check_node(root, PageIndex::NONE, None, 1, &mut leaf_depth)
    }

    fn check_node(
        &self,
        node: BPlusTreeNode,
        parent: PageIndex,
        expected_max: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<Option<String>> {
        if node.parent != parent {
            return Ok(Some(format!(
                "node {} names parent {}, expected {}",
                node.index, node.parent, parent
            )));
        }
        if !node.is_ordered() {
            return Ok(Some(format!("node {} keys are not ascending", node.index)));
        }
        if node.len() > self.capacity {
            return Ok(Some(format!(
                "node {} holds {} entries, capacity {}",
                node.index,
                node.len(),
                self.capacity
            )));
        }
        if parent.is_some() && node.is_empty() {
            return Ok(Some(format!("node {} is empty", node.index)));
        }
        if let Some(expected) = expected_max {
            if node.max_key() != Some(expected) {
                return Ok(Some(format!(
                    "node {} maximum differs from its parent entry",
                    node.index
                )));
            }
        }

        if node.previous.is_some() {
            let previous = self.nodes.fetch(node.previous)?;
            if previous.next != node.index {
                return Ok(Some(format!(
                    "node {} previous {} links forward to {}",
                    node.index, previous.index, previous.next
                )));
            }
            if previous.is_leaf != node.is_leaf {
                return Ok(Some(format!(
                    "node {} and its previous {} are on different levels",
                    node.index, previous.index
                )));
            }
            if let (Some(previous_max), Some(min)) = (previous.max_key(), node.min_key()) {
                if previous_max >= min {
                    return Ok(Some(format!(
                        "node {} smallest key does not exceed previous {}",
                        node.index, previous.index
                    )));
                }
            }
        }
        if node.next.is_some() {
            let next = self.nodes.fetch(node.next)?;
            if next.previous != node.index {
                return Ok(Some(format!(
                    "node {} next {} links back to {}",
                    node.index, next.index, next.previous
                )));
            }
        }

        if node.is_leaf {
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected != depth => {
                    return Ok(Some(format!(
                        "leaf {} at depth {}, expected {}",
                        node.index, depth, expected
                    )));
                }
                Some(_) => {}
            }
            return Ok(None);
        }

        for entry in &node.entries {
            let child = self.nodes.fetch(entry.child_index())?;
            let expected = Some(entry.key.as_slice());
            if let Some(problem) =
                self.check_node(child, node.index, expected, depth + 1, leaf_depth)?
            {
                return Ok(Some(problem));
            }
        }
        Ok(None)
    }

    /// Run `f` with node `index` pinned
    fn with_pinned<T>(&self, index: PageIndex, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.nodes.pin_node(index)?;
        let result = f();
        let unpinned = self.nodes.unpin_node(index);
        let value = result?;
        unpinned?;
        Ok(value)
    }

    /// Descend from the root to the leaf that holds or would hold `key`
    fn find_leaf(&self, key: &[u8]) -> Result<BPlusTreeNode> {
        let mut node = self.nodes.fetch_root()?;
        while !node.is_leaf {
            let child = node
                .entries
                .get(node.child_position(key))
                .ok_or_else(|| StorageError::internal(format!("node {} is empty", node.index)))?
                .child_index();
            node = self.nodes.fetch(child)?;
        }
        Ok(node)
    }

    /// Leftmost or rightmost leaf
    fn edge_leaf(&self, rightmost: bool) -> Result<BPlusTreeNode> {
        let mut node = self.nodes.fetch_root()?;
        while !node.is_leaf {
            let entry = if rightmost {
                node.entries.last()
            } else {
                node.entries.first()
            };
            let child = entry
                .ok_or_else(|| StorageError::internal(format!("node {} is empty", node.index)))?
                .child_index();
            node = self.nodes.fetch(child)?;
        }
        Ok(node)
    }

    fn first_child(&self, node: &BPlusTreeNode) -> Result<BPlusTreeNode> {
        let entry = node
            .entries
            .first()
            .ok_or_else(|| StorageError::internal(format!("node {} is empty", node.index)))?;
        self.nodes.fetch(entry.child_index())
    }

    /// Make the ancestors' keys for `node` equal its largest key again
    fn align_maximal_values(&self, node: &BPlusTreeNode) -> Result<()> {
        let Some(max) = node.max_key() else {
            return Ok(());
        };
        let mut child = node.index;
        let mut parent_index = node.parent;
        while parent_index.is_some() {
            let mut parent = self.nodes.fetch(parent_index)?;
            let position = parent.position_of_child(child)?;
            if parent.entries[position].key == max {
                break;
            }
            parent.entries[position].key = max.to_vec();
            self.nodes.update(&parent)?;
            if position + 1 != parent.len() {
                break;
            }
            child = parent.index;
            parent_index = parent.parent;
        }
        Ok(())
    }

    /// Point the children behind `entries` at `parent`
    fn reparent(&self, entries: &[NodeEntry], parent: PageIndex) -> Result<()> {
        for entry in entries {
            let mut child = self.nodes.fetch(entry.child_index())?;
            child.parent = parent;
            self.nodes.update(&child)?;
        }
        Ok(())
    }

    /// Bring an overfull, not yet persisted node back within capacity
    fn handle_overflow(&self, mut node: BPlusTreeNode) -> Result<()> {
        if self.rotate(&mut node)? {
            return Ok(());
        }
        self.split(node)
    }

    /// Move entries into a same-parent sibling with spare room
    fn rotate(&self, node: &mut BPlusTreeNode) -> Result<bool> {
        if node.is_root() {
            return Ok(false);
        }
        for (sibling_index, sibling_is_previous) in [(node.previous, true), (node.next, false)] {
            if sibling_index.is_none() {
                continue;
            }
            let mut sibling = self.nodes.fetch(sibling_index)?;
            if sibling.parent != node.parent || sibling.len() >= self.capacity {
                continue;
            }
            trace!(node = %node.index, sibling = %sibling.index, "rotating entries");
            if sibling_is_previous {
                self.redistribute(&mut sibling, node)?;
            } else {
                self.redistribute(node, &mut sibling)?;
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Even out two adjacent same-parent nodes and fix their parent entries
    fn redistribute(&self, left: &mut BPlusTreeNode, right: &mut BPlusTreeNode) -> Result<()> {
        let total = left.len() + right.len();
        let left_len = (total + 1) / 2;

        if left.len() > left_len {
            let mut moved = left.entries.split_off(left_len);
            if !right.is_leaf {
                self.reparent(&moved, right.index)?;
            }
            moved.append(&mut right.entries);
            right.entries = moved;
        } else {
            let moved: Vec<NodeEntry> = right.entries.drain(..left_len - left.len()).collect();
            if !left.is_leaf {
                self.reparent(&moved, left.index)?;
            }
            left.entries.extend(moved);
        }
        self.nodes.update(left)?;
        self.nodes.update(right)?;

        let mut parent = self.nodes.fetch(left.parent)?;
        for node in [&*left, &*right] {
            let position = parent.position_of_child(node.index)?;
            if let Some(max) = node.max_key() {
                parent.entries[position].key = max.to_vec();
            }
        }
        self.nodes.update(&parent)
    }

    /// Move the upper half of `node` into a new right sibling
    fn split(&self, mut node: BPlusTreeNode) -> Result<()> {
        let mut sibling = self.nodes.create(node.is_leaf)?;
        sibling.entries = node.entries.split_off(node.len() / 2);
        sibling.previous = node.index;
        sibling.next = node.next;
        if node.next.is_some() {
            let mut next = self.nodes.fetch(node.next)?;
            next.previous = sibling.index;
            self.nodes.update(&next)?;
        }
        node.next = sibling.index;
        if !node.is_leaf {
            self.reparent(&sibling.entries, sibling.index)?;
        }
        trace!(node = %node.index, sibling = %sibling.index, "split node");

        let (Some(node_max), Some(sibling_max)) = (
            node.max_key().map(<[u8]>::to_vec),
            sibling.max_key().map(<[u8]>::to_vec),
        ) else {
            return Err(StorageError::internal(format!(
                "split of node {} left an empty half",
                node.index
            )));
        };

        if node.is_root() {
            let mut root = self.nodes.create(false)?;
            root.entries = vec![
                NodeEntry::child(node_max, node.index),
                NodeEntry::child(sibling_max, sibling.index),
            ];
            node.parent = root.index;
            sibling.parent = root.index;
            self.nodes.update(&node)?;
            self.nodes.update(&sibling)?;
            self.nodes.update(&root)?;
            self.nodes.set_root(root.index)?;
            trace!(root = %root.index, "tree grew a level");
            return Ok(());
        }

        let mut parent = self.nodes.fetch(node.parent)?;
        sibling.parent = parent.index;
        let position = parent.position_of_child(node.index)?;
        parent.entries[position].key = node_max;
        parent
            .entries
            .insert(position + 1, NodeEntry::child(sibling_max, sibling.index));
        self.nodes.update(&node)?;
        self.nodes.update(&sibling)?;

        if parent.len() > self.capacity {
            self.handle_overflow(parent)
        } else {
            self.nodes.update(&parent)
        }
    }

    /// Restore fill after entries left a persisted node
    fn handle_underflow(&self, node: BPlusTreeNode) -> Result<()> {
        if node.is_root() {
            return self.shrink_root(node);
        }
        if node.is_empty() {
            return self.remove_node(node);
        }
        if node.len() as f64 > self.config.fill_factor * self.capacity as f64 {
            return Ok(());
        }

        if node.previous.is_some() {
            let previous = self.nodes.fetch(node.previous)?;
            if previous.parent == node.parent && previous.len() + node.len() <= self.capacity {
                return self.combine(previous, node);
            }
        }
        if node.next.is_some() {
            let next = self.nodes.fetch(node.next)?;
            if next.parent == node.parent && next.len() + node.len() <= self.capacity {
                return self.combine(node, next);
            }
        }
        Ok(())
    }

    /// Merge `right` into `left`, then remove `right`
    fn combine(&self, mut left: BPlusTreeNode, mut right: BPlusTreeNode) -> Result<()> {
        let moved = std::mem::take(&mut right.entries);
        if !left.is_leaf {
            self.reparent(&moved, left.index)?;
        }
        left.entries.extend(moved);
        left.next = right.next;
        if right.next.is_some() {
            let mut next = self.nodes.fetch(right.next)?;
            next.previous = left.index;
            self.nodes.update(&next)?;
        }

        let mut parent = self.nodes.fetch(left.parent)?;
        let right_position = parent.position_of_child(right.index)?;
        parent.entries.remove(right_position);
        let left_position = parent.position_of_child(left.index)?;
        if let Some(max) = left.max_key() {
            parent.entries[left_position].key = max.to_vec();
        }

        self.nodes.update(&left)?;
        self.nodes.remove(right.index)?;
        self.nodes.update(&parent)?;
        trace!(node = %left.index, removed = %right.index, "combined nodes");
        self.handle_underflow(parent)
    }

    /// Unlink an empty non-root node and drop its parent entry
    fn remove_node(&self, node: BPlusTreeNode) -> Result<()> {
        if node.previous.is_some() {
            let mut previous = self.nodes.fetch(node.previous)?;
            previous.next = node.next;
            self.nodes.update(&previous)?;
        }
        if node.next.is_some() {
            let mut next = self.nodes.fetch(node.next)?;
            next.previous = node.previous;
            self.nodes.update(&next)?;
        }

        let mut parent = self.nodes.fetch(node.parent)?;
        let position = parent.position_of_child(node.index)?;
        parent.entries.remove(position);
        self.nodes.remove(node.index)?;
        self.nodes.update(&parent)?;
        trace!(node = %node.index, "removed empty node");
        if position == parent.len() {
            self.align_maximal_values(&parent)?;
        }
        self.handle_underflow(parent)
    }

    /// Collapse a root that no longer needs its level
    fn shrink_root(&self, mut root: BPlusTreeNode) -> Result<()> {
        if root.is_leaf {
            return Ok(());
        }
        match root.len() {
            0 => {
                root.is_leaf = true;
                self.nodes.update(&root)
            }
            1 => {
                let mut child = self.first_child(&root)?;
                child.parent = PageIndex::NONE;
                self.nodes.update(&child)?;
                self.nodes.set_root(child.index)?;
                self.nodes.remove(root.index)?;
                trace!(root = %child.index, "tree lost a level");
                self.shrink_root(child)
            }
            _ => Ok(()),
        }
    }
}
