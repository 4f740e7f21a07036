//! Recency list for LRU eviction.

use std::collections::HashMap;
use std::hash::Hash;

/// Keys ordered by last access, backed by an index-linked list
pub struct LruList<K> {
    /// Maps a key to its node
    positions: HashMap<K, usize>,
    /// List nodes; removed nodes are recycled through `free_nodes`
    nodes: Vec<LruNode<K>>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used
    tail: Option<usize>,
    free_nodes: Vec<usize>,
}

#[derive(Clone, Copy)]
struct LruNode<K> {
    key: K,
    /// Towards the head (more recent)
    newer: Option<usize>,
    /// Towards the tail (less recent)
    older: Option<usize>,
}

impl<K: Copy + Eq + Hash> LruList<K> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: HashMap::with_capacity(capacity),
            nodes: Vec::with_capacity(capacity),
            head: None,
            tail: None,
            free_nodes: Vec::new(),
        }
    }

    /// Mark `key` as most recently used, inserting it if absent
    pub fn touch(&mut self, key: K) {
        match self.positions.get(&key) {
            Some(&pos) => {
                if self.head != Some(pos) {
                    self.unlink(pos);
                    self.push_front(pos);
                }
            }
            None => {
                let node = LruNode {
                    key,
                    newer: None,
                    older: None,
                };
                let pos = match self.free_nodes.pop() {
                    Some(pos) => {
                        self.nodes[pos] = node;
                        pos
                    }
                    None => {
                        self.nodes.push(node);
                        self.nodes.len() - 1
                    }
                };
                self.positions.insert(key, pos);
                self.push_front(pos);
            }
        }
    }

    /// Forget `key`
    pub fn remove(&mut self, key: K) {
        if let Some(pos) = self.positions.remove(&key) {
            self.unlink(pos);
            self.free_nodes.push(pos);
        }
    }

    /// Keys from least to most recently used
    pub fn iter_oldest(&self) -> impl Iterator<Item = K> + '_ {
        std::iter::successors(self.tail, move |&pos| self.nodes[pos].newer)
            .map(move |pos| self.nodes[pos].key)
    }

    /// Oldest key satisfying `pred`
    pub fn oldest_where(&self, mut pred: impl FnMut(&K) -> bool) -> Option<K> {
        self.iter_oldest().find(|key| pred(key))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn push_front(&mut self, pos: usize) {
        self.nodes[pos].newer = None;
        self.nodes[pos].older = self.head;
        if let Some(old_head) = self.head {
            self.nodes[old_head].newer = Some(pos);
        }
        self.head = Some(pos);
        if self.tail.is_none() {
            self.tail = Some(pos);
        }
    }

    fn unlink(&mut self, pos: usize) {
        let (newer, older) = (self.nodes[pos].newer, self.nodes[pos].older);
        match newer {
            Some(newer) => self.nodes[newer].older = older,
            None => self.head = older,
        }
        match older {
            Some(older) => self.nodes[older].newer = newer,
            None => self.tail = newer,
        }
    }
}
