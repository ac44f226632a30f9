//! Mark-and-reconcile garbage collection.
//!
//! A full pass rebuilds bucket, stripe and usage accounting from every
//! reference it can find, repairing what it can along the way, and then
//! reconciles the result into live state. The position the pass has reached
//! is published so concurrent writers know whether their updates must also
//! be applied to the state the pass is building.

mod coalesce;
mod gens;
mod mark;
mod metadata;
mod reconcile;
mod repair;
pub mod report;
mod scheduler;
mod topology;

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, error, info, warn};

pub use report::{GcStats, Issue, IssueKind, IssueLog, Severity};

use crate::fs::Filesystem;
use crate::metrics::PassKind;
use crate::tree::walker::{TreeWalker, WalkStep, WalkedNode};
use crate::types::{DeviceId, GcError, GcPhase, GcPos, Result, TreeId, POS_MAX, POS_MIN};

impl Filesystem {
    /// Runs a full mark-and-reconcile pass.
    ///
    /// `initial` passes additionally validate pointers, key versions and the
    /// replica registry, staging repairs in the pending-update log.
    pub fn run_full_gc(&self, initial: bool) -> Result<GcStats> {
        let order = self.buckets.device_ids();
        self.run_full_gc_ordered(initial, &order)
    }

    pub(crate) fn run_full_gc_ordered(&self, initial: bool, order: &[DeviceId]) -> Result<GcStats> {
        let started = Instant::now();
        let _gc = self.gc_lock.write();
        self.wait_interior_updates();

        let issues_before = self.issues.len();
        let mut stats = GcStats {
            kind: Some(PassKind::Full),
            initial,
            ..GcStats::default()
        };
        info!(name = %self.name, initial, "gc.full.start");
        let result = self.full_gc_locked(initial, order, &mut stats);
        self.gc_pos.reset(GcPos::phase(GcPhase::NotRunning));
        self.free_shadow();

        stats.repairs = (self.issues.len() - issues_before) as u64;
        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics
            .pass_finished(PassKind::Full, started.elapsed(), stats.corrections);
        match result {
            Ok(()) => {
                info!(
                    name = %self.name,
                    restarts = stats.restarts,
                    repairs = stats.repairs,
                    corrections = stats.corrections,
                    nodes = stats.nodes_visited,
                    duration_ms = stats.duration_ms,
                    "gc.full.done"
                );
                *self.last_stats.lock() = Some(stats.clone());
                Ok(stats)
            }
            Err(err) => {
                error!(name = %self.name, %err, restarts = stats.restarts, "gc.full.failed");
                Err(err)
            }
        }
    }

    fn full_gc_locked(&self, initial: bool, order: &[DeviceId], stats: &mut GcStats) -> Result<()> {
        loop {
            self.need_another_gc.store(false, Ordering::Release);
            self.gc_start()?;
            self.mark_all(initial, stats)?;
            self.gc_count.fetch_add(1, Ordering::AcqRel);

            if self.need_another_gc.load(Ordering::Acquire) {
                if stats.restarts >= self.opts.max_restarts {
                    return Err(GcError::RetryBoundExceeded {
                        restarts: stats.restarts,
                    });
                }
                stats.restarts += 1;
                self.metrics.restart();
                warn!(name = %self.name, restart = stats.restarts, "gc.full.restart");
                self.gc_pos.reset(GcPos::phase(GcPhase::NotRunning));
                self.free_shadow();
                continue;
            }

            let _mark = self.mark_lock.write();
            stats.corrections = self.gc_done(initial, order)?;
            return Ok(());
        }
    }

    fn gc_start(&self) -> Result<()> {
        self.buckets.alloc_shadow()?;
        let others = self
            .stripes
            .alloc_shadow()
            .and_then(|()| self.usage.alloc_shadow());
        if let Err(err) = others {
            self.free_shadow();
            return Err(err);
        }
        self.gc_pos.advance(GcPos::phase(GcPhase::Start));
        debug!(name = %self.name, "gc.full.shadow_allocated");
        Ok(())
    }

    fn free_shadow(&self) {
        self.buckets.free_shadow();
        self.stripes.free_shadow();
        self.usage.free_shadow();
    }

    fn mark_all(&self, initial: bool, stats: &mut GcStats) -> Result<()> {
        self.mark_superblocks()?;
        for tree in TreeId::in_gc_order() {
            self.gc_tree(tree, initial, stats)?;
        }
        self.gc_pos.advance(GcPos::phase(GcPhase::PendingDelete));
        self.mark_allocator_buckets()
    }

    fn gc_tree(&self, tree: TreeId, initial: bool, stats: &mut GcStats) -> Result<()> {
        let depth = if self.opts.expensive_checks || tree.leaf_needs_gc() {
            0
        } else {
            1
        };
        self.gc_pos.advance(GcPos::tree_start(tree));
        let Some(root) = self.trees.root(tree) else {
            self.gc_pos.advance(GcPos::tree_root(tree));
            return Ok(());
        };
        let (root_min, root_max, root_ptr) = {
            let node = root.read();
            (node.min_key, node.max_key, node.ptr.clone())
        };
        if initial && (root_min != POS_MIN || root_max != POS_MAX) {
            self.issues.fatal(
                IssueKind::RootBounds,
                format!("{tree} root spans {root_min}..{root_max}"),
            );
            return Err(GcError::StructuralConflict(format!(
                "{tree} root does not span the key space"
            )));
        }

        let mut walker = TreeWalker::new(self.trees.as_ref(), &self.pending, tree).depth(depth);
        while let Some(step) = walker.next_step()? {
            match step {
                WalkStep::Unreadable { level, ptr, error } => {
                    self.issues.repairable(
                        IssueKind::UnreadableNode,
                        format!("{tree} level {level}: {error}; dropping pointer at {}", ptr.pos),
                    );
                    self.pending.stage_delete(tree, level, ptr.pos)?;
                    self.need_another_gc.store(true, Ordering::Release);
                }
                WalkStep::Node(node) => {
                    stats.nodes_visited += 1;
                    let max_stale = self.gc_node(tree, &node, initial, stats)?;
                    let stale = max_stale > self.opts.rewrite_stale_threshold;
                    if !initial && !node.is_root() && stale {
                        match self.rewrite_node(tree, &node) {
                            Ok(()) => stats.nodes_rewritten += 1,
                            Err(err) => debug!(
                                tree = %tree,
                                node = %node.node.id(),
                                %err,
                                "gc.full.rewrite_skipped"
                            ),
                        }
                    }
                }
            }
        }

        self.gc_mark_key(tree, root.read().level + 1, &root_ptr, initial, true)?;
        self.gc_pos.advance(GcPos::tree_root(tree));
        Ok(())
    }

    /// Publishes the node's position and marks its keys; the node stays
    /// read-locked so no writer can slip an update between the two.
    fn gc_node(
        &self,
        tree: TreeId,
        node: &WalkedNode,
        initial: bool,
        stats: &mut GcStats,
    ) -> Result<u8> {
        let guard = node.node.read();
        self.gc_pos.advance(GcPos::node(tree, guard.max_key, guard.level));
        let keys = self.pending.overlay(
            tree,
            guard.level,
            guard.min_key,
            guard.max_key,
            &guard.keys,
        );
        if guard.level > 0 {
            self.check_topology(tree, guard.level, guard.min_key, guard.max_key, &keys)?;
        }
        let mut max_stale = 0;
        if guard.level > 0 || tree.leaf_needs_gc() {
            for key in &keys {
                let stale = self.gc_mark_key(tree, guard.level, key, initial, false)?;
                max_stale = max_stale.max(stale);
                stats.keys_marked += 1;
            }
        }
        Ok(max_stale)
    }
}
