//! Merging sparse sibling nodes.
//!
//! A walk keeps, per level, a window of the last few siblings it has seen
//! together with their sequence stamps. Whenever the window's live payload
//! would fit in fewer nodes at the occupancy target, the window is repacked
//! into new nodes that are swapped into the parent in one index update.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use smallvec::smallvec;
use tracing::{debug, info};

use crate::fs::{Filesystem, View};
use crate::gc::report::GcStats;
use crate::metrics::PassKind;
use crate::tree::walker::{TreeWalker, WalkStep, WalkedNode};
use crate::tree::{ExtentPtr, FormatState, Key, KeyFormat, NewNode, Node, NodeHandle};
use crate::types::{DeviceId, GcError, GcPos, Pos, Result, TreeId};

struct Slot {
    node: NodeHandle,
    seq: u64,
    parent: NodeHandle,
    parent_seq: u64,
}

impl Slot {
    fn new(node: NodeHandle, parent: NodeHandle) -> Self {
        Self {
            seq: node.seq(),
            parent_seq: parent.seq(),
            node,
            parent,
        }
    }
}

/// Replacement nodes and their bounds, before anything is made reachable.
struct Plan {
    level: u8,
    format: KeyFormat,
    groups: Vec<(Pos, Pos, Vec<Key>)>,
}

impl Filesystem {
    /// Walks every tree and merges runs of underfull sibling nodes.
    ///
    /// Returns [`GcError::Shutdown`] if shutdown begins mid-walk; merges
    /// already done stay in place.
    pub fn coalesce_all_trees(&self) -> Result<GcStats> {
        let started = Instant::now();
        let _gc = self.gc_lock.read();
        let mut stats = GcStats {
            kind: Some(PassKind::Coalesce),
            ..GcStats::default()
        };
        for tree in TreeId::ALL {
            self.coalesce_tree(tree, &mut stats)?;
        }
        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .pass_finished(PassKind::Coalesce, started.elapsed(), 0);
        info!(
            name = %self.name,
            nodes = stats.nodes_visited,
            merged_away = stats.nodes_merged_away,
            duration_ms = stats.duration_ms,
            "gc.coalesce.done"
        );
        *self.last_stats.lock() = Some(stats.clone());
        Ok(stats)
    }

    fn coalesce_tree(&self, tree: TreeId, stats: &mut GcStats) -> Result<()> {
        let mut walker = TreeWalker::new(self.trees.as_ref(), &self.pending, tree);
        let mut windows: Vec<VecDeque<Slot>> = Vec::new();
        while let Some(step) = walker.next_step()? {
            if self.stopping() {
                debug!(tree = %tree, "gc.coalesce.shutdown");
                return Err(GcError::Shutdown);
            }
            let WalkStep::Node(walked) = step else {
                continue;
            };
            stats.nodes_visited += 1;
            let Some(parent) = walked.parent.clone() else {
                continue;
            };
            let level = usize::from(walked.level);
            if windows.len() <= level {
                windows.resize_with(level + 1, VecDeque::new);
            }
            let window = &mut windows[level];

            if window
                .front()
                .is_some_and(|slot| !Arc::ptr_eq(&slot.parent, &parent))
            {
                window.clear();
            }
            // the parent changed under us: trust nothing we saw before
            if window
                .front()
                .is_some_and(|slot| slot.parent.seq() != slot.parent_seq)
            {
                debug!(tree = %tree, level, "gc.coalesce.window_discarded");
                window.clear();
            }
            window.retain(|slot| slot.node.relock(slot.seq).is_some());
            window.push_back(Slot {
                seq: walked.seq,
                parent_seq: parent.seq(),
                node: walked.node.clone(),
                parent,
            });
            if window.len() > self.opts.coalesce_window {
                window.pop_front();
            }
            if window.len() < 2 {
                continue;
            }

            let Some(merged) = self.coalesce_window(tree, window)? else {
                continue;
            };
            stats.nodes_merged_away += (window.len() - merged.len()) as u64;
            let parent = window[0].parent.clone();
            window.clear();
            let mut resume = walked.max_key;
            for node in merged {
                resume = node.read().max_key;
                window.push_back(Slot::new(node, parent.clone()));
            }
            walker.restart_after(resume, walked.level);
        }
        Ok(())
    }

    /// Merges the window if that saves a node; returns the replacements.
    fn coalesce_window(
        &self,
        tree: TreeId,
        window: &VecDeque<Slot>,
    ) -> Result<Option<Vec<NodeHandle>>> {
        let parent = &window[0].parent;
        let mut old = Vec::with_capacity(window.len());
        for slot in window {
            match slot.node.relock(slot.seq) {
                Some(guard) => old.push(guard.clone()),
                None => return Ok(None),
            }
        }
        if parent.relock(window[0].parent_seq).is_none() {
            return Ok(None);
        }
        let Some(plan) = self.plan_merge(tree, &old) else {
            return Ok(None);
        };

        let _update = self.begin_interior_update();
        let new = self.alloc_replacements(tree, &plan)?;
        let olds: Vec<NodeHandle> = window.iter().map(|slot| slot.node.clone()).collect();
        self.swap_nodes(tree, parent, &olds, &new)?;
        self.metrics.nodes_coalesced(olds.len(), new.len());
        debug!(
            tree = %tree,
            level = plan.level,
            old = olds.len(),
            new = new.len(),
            first = %old[0].min_key,
            last = %old[old.len() - 1].max_key,
            "gc.coalesce.merge"
        );
        Ok(Some(new))
    }

    fn plan_merge(&self, tree: TreeId, old: &[Node]) -> Option<Plan> {
        let (first, last) = (old.first()?, old.last()?);
        let mut state = FormatState::new();
        for node in old {
            state.add_node(node);
        }
        let format = state.done();

        let mut total = 0;
        for node in old {
            let packed = node.u64s_in(&format);
            if packed > self.opts.node_u64s {
                debug!(tree = %tree, node = %node.id, packed, "gc.coalesce.format_too_wide");
                return None;
            }
            total += packed;
        }
        let target = self.opts.occupancy_target_u64s();
        if total.div_ceil(old.len() - 1) > target {
            return None;
        }

        // filled from the right, so only the leftmost replacement runs short
        let mut groups: Vec<Vec<Key>> = vec![Vec::new()];
        let mut used = 0;
        for key in old.iter().rev().flat_map(|node| node.keys.iter().rev()) {
            if key.is_deleted() {
                continue;
            }
            let size = format.key_u64s(key);
            if used + size > target && groups.last().is_some_and(|g| !g.is_empty()) {
                groups.push(Vec::new());
                used = 0;
            }
            used += size;
            if let Some(group) = groups.last_mut() {
                group.push(key.clone());
            }
        }
        if groups.len() >= old.len() {
            return None;
        }
        groups.reverse();
        for group in &mut groups {
            group.reverse();
        }

        let nr = groups.len();
        let mut min = first.min_key;
        let mut bounded = Vec::with_capacity(nr);
        for (i, keys) in groups.into_iter().enumerate() {
            let max = match keys.last() {
                Some(key) if i + 1 < nr => key.pos,
                _ => last.max_key,
            };
            bounded.push((min, max, keys));
            min = max.successor();
        }
        Some(Plan {
            level: first.level,
            format,
            groups: bounded,
        })
    }

    /// Builds every replacement or none of them.
    fn alloc_replacements(&self, tree: TreeId, plan: &Plan) -> Result<Vec<NodeHandle>> {
        let mut out = Vec::with_capacity(plan.groups.len());
        for (min, max, keys) in &plan.groups {
            match self.alloc_tree_node(tree, plan.level, *min, *max, keys.clone(), plan.format) {
                Ok(node) => out.push(node),
                Err(err) => {
                    self.release_tree_nodes(&out)?;
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    /// Allocates and writes a node that is not yet reachable from any parent.
    fn alloc_tree_node(
        &self,
        tree: TreeId,
        level: u8,
        min_key: Pos,
        max_key: Pos,
        keys: Vec<Key>,
        format: KeyFormat,
    ) -> Result<NodeHandle> {
        let (dev, bucket) = self.allocator.alloc_node_bucket()?;
        let placed = self.buckets.live(dev, bucket).and_then(|current| {
            self.update_bucket(View::Live, dev, bucket, |b| b.mark.owned_by_allocator = false)?;
            self.trees.alloc_node(NewNode {
                tree,
                level,
                min_key,
                max_key,
                keys,
                format,
                ptrs: smallvec![ExtentPtr::dirty(dev, bucket, current.mark.gen)],
            })
        });
        let node = match placed {
            Ok(node) => node,
            Err(err) => {
                self.release_node_bucket(dev, bucket)?;
                return Err(err);
            }
        };
        if let Err(err) = self.trees.write_node(&node) {
            self.release_tree_nodes(std::slice::from_ref(&node))?;
            return Err(err);
        }
        Ok(node)
    }

    /// Frees nodes that never became reachable and hands their buckets back.
    fn release_tree_nodes(&self, nodes: &[NodeHandle]) -> Result<()> {
        for node in nodes {
            let ptr = node.read().ptr.clone();
            self.trees.free_node(node)?;
            for p in ptr.ptrs() {
                self.release_node_bucket(p.dev, p.bucket)?;
            }
            debug!(node = %node.id(), "gc.coalesce.released");
        }
        Ok(())
    }

    fn release_node_bucket(&self, dev: DeviceId, bucket: u64) -> Result<()> {
        self.update_bucket(View::Live, dev, bucket, |b| b.mark.owned_by_allocator = true)?;
        self.allocator.release_node_bucket(dev, bucket);
        Ok(())
    }

    /// Replaces `old` by `new` in `parent` with one index update, runs the
    /// pointer triggers and frees the old nodes.
    /// On a failed index update the new nodes are released instead.
    fn swap_nodes(
        &self,
        tree: TreeId,
        parent: &NodeHandle,
        old: &[NodeHandle],
        new: &[NodeHandle],
    ) -> Result<()> {
        let old_ptrs: Vec<Key> = old.iter().map(|node| node.read().ptr.clone()).collect();
        let new_ptrs: Vec<Key> = new.iter().map(|node| node.read().ptr.clone()).collect();
        let deletes: Vec<Pos> = old_ptrs
            .iter()
            .map(|ptr| ptr.pos)
            .filter(|pos| new_ptrs.iter().all(|ptr| ptr.pos != *pos))
            .collect();
        if let Err(err) = self
            .trees
            .index_update(tree, parent, &deletes, new_ptrs.clone())
        {
            self.release_tree_nodes(new)?;
            return Err(err);
        }

        let at = {
            let parent = parent.read();
            GcPos::node(tree, parent.max_key, parent.level)
        };
        for ptr in &old_ptrs {
            self.run_triggers(at, Some(ptr), None)?;
        }
        for ptr in &new_ptrs {
            self.run_triggers(at, None, Some(ptr))?;
        }
        for node in old {
            self.trees.free_node(node)?;
        }
        Ok(())
    }

    /// Rewrites a node copy-on-write, dropping stale cached pointers from
    /// leaf keys.
    pub(crate) fn rewrite_node(&self, tree: TreeId, walked: &WalkedNode) -> Result<()> {
        let parent = walked
            .parent
            .as_ref()
            .ok_or(GcError::Invalid("cannot rewrite a root node"))?;
        let snapshot = walked
            .node
            .relock(walked.seq)
            .map(|guard| guard.clone())
            .ok_or(GcError::TransientConflict)?;
        let mut keys: Vec<Key> = snapshot
            .keys
            .iter()
            .filter(|k| !k.is_deleted())
            .cloned()
            .collect();
        if snapshot.level == 0 {
            for key in &mut keys {
                key.normalize(|ptr| {
                    self.buckets.exists(ptr.dev, ptr.bucket)
                        && self.ptr_stale(ptr).map(|stale| stale > 0).unwrap_or(false)
                });
            }
        }
        let format = KeyFormat::for_keys(&keys, snapshot.min_key, snapshot.max_key);

        let _update = self.begin_interior_update();
        let new = self.alloc_tree_node(
            tree,
            snapshot.level,
            snapshot.min_key,
            snapshot.max_key,
            keys,
            format,
        )?;
        self.swap_nodes(tree, parent, &[walked.node.clone()], &[new])?;
        debug!(tree = %tree, node = %snapshot.id, level = snapshot.level, "gc.rewrite.node");
        Ok(())
    }
}
