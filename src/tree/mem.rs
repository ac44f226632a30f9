//! In-memory [`TreeStore`].
//!
//! Every node lives in a hash map; a separate resident set models the node
//! cache so repair paths can tell cached nodes from ones that must be read.
//! Fault injection covers unreadable nodes and commit races.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::smallvec;
use tracing::debug;

use super::pending::PendingUpdateLog;
use super::{
    ExtentPtr, Key, KeyFormat, KeyValue, NewNode, Node, NodeCell, NodeHandle, Ptrs, TreeStore,
};
use crate::types::{DeviceId, GcError, Gen, NodeId, Pos, Result, TreeId, POS_MAX, POS_MIN};

/// Tree storage held entirely in memory.
#[derive(Debug, Default)]
pub struct MemTreeStore {
    roots: RwLock<FxHashMap<TreeId, NodeHandle>>,
    nodes: RwLock<FxHashMap<NodeId, NodeHandle>>,
    resident: Mutex<FxHashSet<NodeId>>,
    unreadable: Mutex<FxHashSet<NodeId>>,
    injected_conflicts: AtomicU32,
    next_id: AtomicU64,
    writes: AtomicU64,
}

impl MemTreeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            ..Self::default()
        }
    }

    fn fresh_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn insert_node(&self, node: Node) -> NodeHandle {
        let handle = NodeCell::new(node);
        self.nodes.write().insert(handle.id(), handle.clone());
        self.resident.lock().insert(handle.id());
        handle
    }

    /// Installs `root` as the root of its tree.
    pub fn set_root(&self, root: &NodeHandle) {
        let tree = root.read().tree;
        self.roots.write().insert(tree, root.clone());
    }

    /// Node by id, resident or not.
    pub fn node(&self, id: NodeId) -> Option<NodeHandle> {
        self.nodes.read().get(&id).cloned()
    }

    /// Number of nodes allocated and not yet freed.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Makes reads of `id` fail.
    pub fn set_unreadable(&self, id: NodeId) {
        self.unreadable.lock().insert(id);
        self.resident.lock().remove(&id);
    }

    /// Drops every node from the resident set.
    pub fn evict_all(&self) {
        self.resident.lock().clear();
    }

    /// Makes the next `n` key commits fail with a transient conflict.
    pub fn inject_commit_conflicts(&self, n: u32) {
        self.injected_conflicts.store(n, Ordering::Release);
    }

    /// Nodes written so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Nodes of `tree` at `level`, in key order.
    pub fn nodes_at_level(&self, tree: TreeId, level: u8) -> Vec<NodeHandle> {
        let mut out = Vec::new();
        if let Some(root) = self.root(tree) {
            self.collect_level(&root, level, &mut out);
        }
        out
    }

    fn collect_level(&self, node: &NodeHandle, level: u8, out: &mut Vec<NodeHandle>) {
        let (node_level, children) = {
            let guard = node.read();
            let children: Vec<NodeId> = guard.keys.iter().filter_map(Key::child).collect();
            (guard.level, children)
        };
        if node_level == level {
            out.push(node.clone());
            return;
        }
        if node_level < level {
            return;
        }
        for child in children {
            if let Some(handle) = self.node(child) {
                self.collect_level(&handle, level, out);
            }
        }
    }

    /// Every live leaf key of `tree`, in order.
    pub fn leaf_keys(&self, tree: TreeId) -> Vec<Key> {
        self.nodes_at_level(tree, 0)
            .iter()
            .flat_map(|leaf| {
                leaf.read()
                    .keys
                    .iter()
                    .filter(|k| !k.is_deleted())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Describes every boundary violation in `tree`; empty when the sibling
    /// ranges partition their parents exactly.
    pub fn topology_errors(&self, tree: TreeId) -> Vec<String> {
        let mut errors = Vec::new();
        if let Some(root) = self.root(tree) {
            let (min, max) = {
                let guard = root.read();
                (guard.min_key, guard.max_key)
            };
            if min != POS_MIN || max != POS_MAX {
                errors.push(format!("root spans {min}..{max}"));
            }
            self.check_children(&root, &mut errors);
        }
        errors
    }

    fn check_children(&self, node: &NodeHandle, errors: &mut Vec<String>) {
        let snapshot = node.snapshot();
        if snapshot.level == 0 {
            return;
        }
        let mut expected = snapshot.min_key;
        for (i, ptr) in snapshot.keys.iter().enumerate() {
            let Some(child_min) = ptr.child_min() else {
                continue;
            };
            if child_min != expected {
                errors.push(format!(
                    "node {} level {} child {i}: min {child_min} expected {expected}",
                    snapshot.id, snapshot.level
                ));
            }
            if i + 1 == snapshot.keys.len() && ptr.pos != snapshot.max_key {
                errors.push(format!(
                    "node {} level {}: last child max {} expected {}",
                    snapshot.id, snapshot.level, ptr.pos, snapshot.max_key
                ));
            }
            if let Some(child) = ptr.child().and_then(|id| self.node(id)) {
                let (min, max) = {
                    let guard = child.read();
                    (guard.min_key, guard.max_key)
                };
                if min != child_min || max != ptr.pos {
                    errors.push(format!(
                        "node {} header {min}..{max} disagrees with pointer {child_min}..{}",
                        child.id(),
                        ptr.pos
                    ));
                }
                self.check_children(&child, errors);
            }
            expected = ptr.pos.successor();
        }
    }

    fn leaf_for(&self, tree: TreeId, pos: Pos) -> Option<NodeHandle> {
        let mut node = self.root(tree)?;
        loop {
            let next = {
                let guard = node.read();
                if guard.level == 0 {
                    None
                } else {
                    let child = guard
                        .keys
                        .iter()
                        .find(|k| k.pos >= pos && !k.is_deleted())
                        .or_else(|| guard.keys.last())
                        .and_then(Key::child)?;
                    Some(child)
                }
            };
            match next {
                None => return Some(node),
                Some(id) => node = self.node(id)?,
            }
        }
    }

    fn node_for(&self, tree: TreeId, level: u8, pos: Pos) -> Option<NodeHandle> {
        let mut node = self.root(tree)?;
        loop {
            let next = {
                let guard = node.read();
                if guard.level <= level {
                    None
                } else {
                    guard
                        .keys
                        .iter()
                        .find(|k| k.pos >= pos && !k.is_deleted())
                        .or_else(|| guard.keys.last())
                        .and_then(Key::child)
                }
            };
            match next {
                None => {
                    let matches = node.read().level == level;
                    return matches.then_some(node);
                }
                Some(id) => node = self.node(id)?,
            }
        }
    }

    /// Applies every staged update from `log` to the stored nodes, emptying it.
    ///
    /// Pointer keys flagged `range_updated` also rewrite the child's bounds.
    pub fn apply_pending(&self, log: &PendingUpdateLog) -> Result<usize> {
        let entries = log.drain();
        let applied = entries.len();
        for (tree, level, pos, value) in entries {
            let Some(node) = self.node_for(tree, level, pos) else {
                debug!(tree = %tree, level, pos = %pos, "mem_tree.apply_pending.no_node");
                continue;
            };
            node.modify(|n| {
                n.keys.retain(|k| k.pos != pos);
                if let Some(key) = value.clone() {
                    n.keys.push(key);
                    n.keys.sort_by_key(|k| k.pos);
                }
            });
            if let Some(key) = value {
                if let KeyValue::BtreePtr {
                    min_key,
                    child,
                    range_updated: true,
                    ..
                } = key.value
                {
                    if let Some(child) = self.node(child) {
                        child.modify(|c| {
                            c.min_key = min_key;
                            c.max_key = key.pos;
                            c.ptr = key.clone();
                        });
                    }
                }
            }
        }
        Ok(applied)
    }
}

impl TreeStore for MemTreeStore {
    fn root(&self, tree: TreeId) -> Option<NodeHandle> {
        self.roots.read().get(&tree).cloned()
    }

    fn get_child(&self, tree: TreeId, level: u8, ptr: &Key) -> Result<NodeHandle> {
        let id = ptr.child().ok_or(GcError::Invalid("not a tree pointer"))?;
        if self.unreadable.lock().contains(&id) {
            return Err(GcError::Unreadable { node: id });
        }
        let node = self.node(id).ok_or(GcError::Unreadable { node: id })?;
        let was_resident = !self.resident.lock().insert(id);
        let (node_tree, node_level) = {
            let guard = node.read();
            (guard.tree, guard.level)
        };
        if node_tree != tree || node_level != level {
            return Err(GcError::Unreadable { node: id });
        }
        if !was_resident {
            if let KeyValue::BtreePtr {
                min_key,
                range_updated: true,
                ..
            } = ptr.value
            {
                node.modify(|n| {
                    n.min_key = min_key;
                    n.max_key = ptr.pos;
                    n.ptr = ptr.clone();
                });
            }
        }
        Ok(node)
    }

    fn resident_node(&self, id: NodeId) -> Option<NodeHandle> {
        if !self.resident.lock().contains(&id) {
            return None;
        }
        self.node(id)
    }

    fn rehash_node(&self, node: &NodeHandle, ptr: Key) -> Result<()> {
        let min_key = ptr.child_min().ok_or(GcError::Invalid("not a tree pointer"))?;
        node.modify(|n| {
            n.min_key = min_key;
            n.max_key = ptr.pos;
            n.ptr = ptr;
        });
        Ok(())
    }

    fn alloc_node(&self, new: NewNode) -> Result<NodeHandle> {
        let id = self.fresh_id();
        let ptr = Key::btree_ptr(new.min_key, new.max_key, id, new.ptrs);
        Ok(self.insert_node(Node {
            id,
            tree: new.tree,
            level: new.level,
            min_key: new.min_key,
            max_key: new.max_key,
            keys: new.keys,
            format: new.format,
            ptr,
        }))
    }

    fn write_node(&self, node: &NodeHandle) -> Result<()> {
        if node.is_freed() {
            return Err(GcError::Invalid("write of freed node"));
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn index_update(
        &self,
        tree: TreeId,
        parent: &NodeHandle,
        deletes: &[Pos],
        inserts: Vec<Key>,
    ) -> Result<()> {
        if parent.is_freed() || parent.read().tree != tree {
            return Err(GcError::Invalid("index update on a foreign node"));
        }
        for key in &inserts {
            if let Some(child) = key.child().and_then(|id| self.node(id)) {
                child.modify(|c| c.ptr = key.clone());
            }
        }
        parent.modify(|p| {
            p.keys.retain(|k| !deletes.contains(&k.pos));
            for key in inserts {
                match p.keys.iter_mut().find(|k| k.pos == key.pos) {
                    Some(slot) => *slot = key,
                    None => p.keys.push(key),
                }
            }
            p.keys.sort_by_key(|k| k.pos);
        });
        Ok(())
    }

    fn free_node(&self, node: &NodeHandle) -> Result<()> {
        self.nodes.write().remove(&node.id());
        self.resident.lock().remove(&node.id());
        node.mark_freed();
        Ok(())
    }

    fn commit_key(&self, tree: TreeId, expected: &Key, new: Key) -> Result<()> {
        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(GcError::TransientConflict);
        }
        let leaf = self
            .leaf_for(tree, expected.pos)
            .ok_or(GcError::NotFound("leaf"))?;
        let idx = {
            let guard = leaf.read();
            guard
                .keys
                .iter()
                .position(|k| k == expected)
                .ok_or(GcError::TransientConflict)?
        };
        leaf.modify(|n| match n.keys.get_mut(idx) {
            Some(slot) if slot == expected => {
                *slot = new;
                Ok(())
            }
            _ => Err(GcError::TransientConflict),
        })
    }

    fn lookup_key(&self, tree: TreeId, pos: Pos) -> Option<Key> {
        let leaf = self.leaf_for(tree, pos)?;
        let guard = leaf.read();
        guard.keys.iter().find(|k| k.pos == pos).cloned()
    }
}

/// Node ids of a built tree, grouped by level.
#[derive(Debug, Clone)]
pub struct BuiltTree {
    /// Root node.
    pub root: NodeId,
    /// `levels[l]` lists the nodes at level `l` in key order.
    pub levels: Vec<Vec<NodeId>>,
    /// First bucket not used for node pointers.
    pub next_bucket: u64,
}

/// Builds a well-formed tree bottom up from explicit leaves.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    tree: TreeId,
    fanout: usize,
    dev: DeviceId,
    next_bucket: u64,
    gen: Gen,
    leaves: Vec<Vec<Key>>,
}

impl TreeBuilder {
    /// Builder for `tree` with fanout 4 and node buckets from bucket 1000 of device 0.
    pub fn new(tree: TreeId) -> Self {
        Self {
            tree,
            fanout: 4,
            dev: DeviceId(0),
            next_bucket: 1000,
            gen: 0,
            leaves: Vec::new(),
        }
    }

    /// Children per interior node.
    pub fn fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.max(2);
        self
    }

    /// Where node pointers are allocated from.
    pub fn node_buckets(mut self, dev: DeviceId, first: u64, gen: Gen) -> Self {
        self.dev = dev;
        self.next_bucket = first;
        self.gen = gen;
        self
    }

    /// Appends a leaf holding `keys`.
    pub fn leaf(mut self, keys: Vec<Key>) -> Self {
        self.leaves.push(keys);
        self
    }

    fn node_ptrs(&mut self) -> Ptrs {
        let ptr = ExtentPtr::dirty(self.dev, self.next_bucket, self.gen);
        self.next_bucket += 1;
        smallvec![ptr]
    }

    /// Builds the tree into `store` and installs its root.
    pub fn build(mut self, store: &MemTreeStore) -> Result<BuiltTree> {
        if self.leaves.is_empty() {
            self.leaves.push(Vec::new());
        }
        let leaves = std::mem::take(&mut self.leaves);
        let nr_leaves = leaves.len();
        let mut current: Vec<NodeHandle> = Vec::with_capacity(nr_leaves);
        let mut min_key = POS_MIN;
        for (i, keys) in leaves.into_iter().enumerate() {
            let max_key = if i + 1 == nr_leaves {
                POS_MAX
            } else {
                keys.last().map(|k| k.pos).ok_or(GcError::Invalid("empty inner leaf"))?
            };
            let node = self.make_node(store, 0, min_key, max_key, keys);
            min_key = max_key.successor();
            current.push(node);
        }

        let mut levels = vec![current.iter().map(|n| n.id()).collect::<Vec<_>>()];
        let mut level = 0u8;
        while current.len() > 1 {
            level += 1;
            let mut parents = Vec::new();
            for group in current.chunks(self.fanout) {
                let keys: Vec<Key> = group.iter().map(|child| child.read().ptr.clone()).collect();
                let min = group[0].read().min_key;
                let max = group[group.len() - 1].read().max_key;
                parents.push(self.make_node(store, level, min, max, keys));
            }
            levels.push(parents.iter().map(|n| n.id()).collect());
            current = parents;
        }
        let root = current.pop().ok_or(GcError::Invalid("tree without root"))?;
        store.set_root(&root);
        Ok(BuiltTree {
            root: root.id(),
            levels,
            next_bucket: self.next_bucket,
        })
    }

    fn make_node(
        &mut self,
        store: &MemTreeStore,
        level: u8,
        min_key: Pos,
        max_key: Pos,
        keys: Vec<Key>,
    ) -> NodeHandle {
        let id = store.fresh_id();
        let ptr = Key::btree_ptr(min_key, max_key, id, self.node_ptrs());
        let format = KeyFormat::for_keys(&keys, min_key, max_key);
        store.insert_node(Node {
            id,
            tree: self.tree,
            level,
            min_key,
            max_key,
            keys,
            format,
            ptr,
        })
    }
}
