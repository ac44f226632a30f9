//! Generation-only pass: keeps `oldest_gen` close enough to the live
//! generation that eight-bit generations cannot wrap onto live pointers.

use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::fs::Filesystem;
use crate::gc::report::GcStats;
use crate::metrics::PassKind;
use crate::tree::walker::{TreeWalker, WalkStep};
use crate::tree::Key;
use crate::types::{gen_after, GcError, Result, TreeId};

impl Filesystem {
    /// Recomputes each bucket's oldest referenced generation, rewriting keys
    /// whose cached pointers trail their bucket too far.
    ///
    /// Only holds the collector lock shared, so allocation and other
    /// lightweight passes proceed concurrently. Usage accounting is left alone.
    /// Generation passes run one at a time since they share `gc_gen`.
    pub fn run_generation_gc(&self) -> Result<GcStats> {
        let started = Instant::now();
        let _gens = self.gens_lock.lock();
        let _gc = self.gc_lock.read();
        let mut stats = GcStats {
            kind: Some(PassKind::Generation),
            ..GcStats::default()
        };

        for dev in self.buckets.device_ids() {
            self.buckets.with_live(dev, |array| {
                for bucket in array.buckets.iter_mut() {
                    bucket.gc_gen = bucket.mark.gen;
                }
            })?;
        }

        for tree in TreeId::ALL.into_iter().filter(|tree| tree.has_pointers()) {
            self.gens_tree(tree, &mut stats)?;
        }

        for dev in self.buckets.device_ids() {
            self.buckets.with_live(dev, |array| {
                for bucket in array.buckets.iter_mut() {
                    bucket.oldest_gen = bucket.gc_gen;
                }
            })?;
        }

        self.gc_count.fetch_add(1, Ordering::AcqRel);
        stats.duration_ms = started.elapsed().as_millis() as u64;
        self.metrics.keys_rewritten(stats.keys_rewritten);
        self.metrics
            .pass_finished(PassKind::Generation, started.elapsed(), 0);
        info!(
            name = %self.name,
            keys_rewritten = stats.keys_rewritten,
            nodes = stats.nodes_visited,
            duration_ms = stats.duration_ms,
            "gc.gens.done"
        );
        *self.last_stats.lock() = Some(stats.clone());
        Ok(stats)
    }

    fn gens_tree(&self, tree: TreeId, stats: &mut GcStats) -> Result<()> {
        let mut walker = TreeWalker::new(self.trees.as_ref(), &self.pending, tree);
        while let Some(step) = walker.next_step()? {
            if self.stopping() {
                debug!(tree = %tree, "gc.gens.shutdown");
                return Err(GcError::Shutdown);
            }
            let WalkStep::Node(node) = step else {
                continue;
            };
            stats.nodes_visited += 1;
            if node.level > 0 {
                continue;
            }
            for key in node.keys {
                let Some(current) = self.rewrite_stale_key(tree, key, stats)? else {
                    continue;
                };
                self.lower_gc_gens(&current)?;
                stats.keys_marked += 1;
            }
        }
        Ok(())
    }

    fn needs_gens_rewrite(&self, key: &Key) -> Result<bool> {
        for ptr in key.ptrs() {
            if self.buckets.exists(ptr.dev, ptr.bucket)
                && self.ptr_stale(ptr)? > self.opts.gens_stale_threshold
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Commits `key` with its stale cached pointers dropped when any pointer
    /// trails too far. Conflicting commits are retried against the key as it
    /// is now; returns the key as it ends up, or `None` if it disappeared.
    fn rewrite_stale_key(
        &self,
        tree: TreeId,
        key: Key,
        stats: &mut GcStats,
    ) -> Result<Option<Key>> {
        let mut current = key;
        let mut attempt = 0;
        while self.needs_gens_rewrite(&current)? {
            let mut fixed = current.clone();
            fixed.normalize(|ptr| {
                self.buckets.exists(ptr.dev, ptr.bucket)
                    && self.ptr_stale(ptr).map(|stale| stale > 0).unwrap_or(false)
            });
            if fixed == current {
                break;
            }
            match self.trees.commit_key(tree, &current, fixed.clone()) {
                Ok(()) => {
                    stats.keys_rewritten += 1;
                    return Ok(Some(fixed));
                }
                Err(GcError::TransientConflict) if attempt < self.opts.gens_max_commit_retries => {
                    attempt += 1;
                    debug!(tree = %tree, pos = %current.pos, attempt, "gc.gens.commit_retry");
                    match self.trees.lookup_key(tree, current.pos) {
                        Some(key) => current = key,
                        None => return Ok(None),
                    }
                }
                Err(GcError::TransientConflict) => {
                    warn!(tree = %tree, pos = %current.pos, attempt, "gc.gens.commit_gave_up");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(Some(current))
    }

    fn lower_gc_gens(&self, key: &Key) -> Result<()> {
        for ptr in key.ptrs() {
            if !self.buckets.exists(ptr.dev, ptr.bucket) {
                continue;
            }
            self.buckets.update_live(ptr.dev, ptr.bucket, |bucket| {
                if gen_after(bucket.gc_gen, ptr.gen) > 0 {
                    bucket.gc_gen = ptr.gen;
                }
            })?;
        }
        Ok(())
    }
}
