//! Pointer validation and repair during initial passes.

use std::sync::atomic::Ordering;

use tracing::debug;

use crate::fs::{Filesystem, View};
use crate::gc::report::IssueKind;
use crate::tree::{ExtentPtr, Key, KeyValue};
use crate::types::{gen_cmp, GcError, Result, TreeId};

impl Filesystem {
    /// Sets a bucket's generation to the pointer's in both views.
    ///
    /// With `clear`, the bucket's usage is dropped too: whatever was counted
    /// against the old generation no longer applies.
    fn adopt_ptr_gen(&self, ptr: &ExtentPtr, clear: bool) -> Result<()> {
        for view in [View::Live, View::Shadow] {
            self.update_bucket(view, ptr.dev, ptr.bucket, |bucket| {
                bucket.mark.gen = ptr.gen;
                bucket.gen_valid = true;
                if clear {
                    bucket.mark.data_type = Default::default();
                    bucket.mark.dirty_sectors = 0;
                    bucket.mark.cached_sectors = 0;
                }
            })?;
        }
        self.need_alloc_write.store(true, Ordering::Release);
        Ok(())
    }

    /// Whether a pointer must be dropped given the repaired shadow state.
    fn ptr_invalid(&self, ptr: &ExtentPtr) -> Result<bool> {
        if !self.buckets.exists(ptr.dev, ptr.bucket) {
            return Ok(true);
        }
        let bucket = self.buckets.shadow(ptr.dev, ptr.bucket)?;
        let invalid = if ptr.cached {
            !bucket.gen_valid || gen_cmp(ptr.gen, bucket.mark.gen) > 0
        } else {
            !bucket.gen_valid || ptr.gen != bucket.mark.gen
        };
        Ok(invalid)
    }

    /// Validates every pointer of `key` against shadow generations.
    ///
    /// Returns the key to mark: `key` itself when nothing was wrong, the
    /// repaired copy (also staged in the pending-update log) otherwise, or
    /// `None` when the repair deleted the key. Repairs to a root pointer are
    /// refused with [`GcError::StructuralConflict`].
    pub(crate) fn check_fix_ptrs(
        &self,
        tree: TreeId,
        level: u8,
        key: &Key,
        is_root: bool,
    ) -> Result<Option<Key>> {
        let mut do_update = false;
        for (idx, ptr) in key.ptrs().iter().enumerate() {
            let data_type = key.ptr_data_type(idx).name();
            if !self.buckets.exists(ptr.dev, ptr.bucket) {
                self.issues.repairable(
                    IssueKind::MissingBucket,
                    format!(
                        "{tree} key at {}: pointer to nonexistent bucket {}:{}",
                        key.pos, ptr.dev, ptr.bucket
                    ),
                );
                do_update = true;
                continue;
            }

            let bucket = self.buckets.shadow(ptr.dev, ptr.bucket)?;
            if !bucket.gen_valid {
                self.issues.repairable(
                    IssueKind::MissingGen,
                    format!(
                        "bucket {}:{} data type {data_type} ptr gen {} missing in alloc info",
                        ptr.dev, ptr.bucket, ptr.gen
                    ),
                );
                if ptr.cached {
                    self.adopt_ptr_gen(ptr, false)?;
                } else {
                    do_update = true;
                }
            }

            let bucket = self.buckets.shadow(ptr.dev, ptr.bucket)?;
            if bucket.gen_valid && gen_cmp(ptr.gen, bucket.mark.gen) > 0 {
                self.issues.repairable(
                    IssueKind::FutureGen,
                    format!(
                        "bucket {}:{} data type {data_type} ptr gen in the future: {} > {}",
                        ptr.dev, ptr.bucket, ptr.gen, bucket.mark.gen
                    ),
                );
                if ptr.cached {
                    self.adopt_ptr_gen(ptr, true)?;
                    self.need_another_gc.store(true, Ordering::Release);
                } else {
                    do_update = true;
                }
            }

            let bucket = self.buckets.shadow(ptr.dev, ptr.bucket)?;
            if !ptr.cached && bucket.gen_valid && gen_cmp(ptr.gen, bucket.mark.gen) < 0 {
                self.issues.repairable(
                    IssueKind::StaleDirtyPtr,
                    format!(
                        "bucket {}:{} data type {data_type} stale dirty ptr: {} < {}",
                        ptr.dev, ptr.bucket, ptr.gen, bucket.mark.gen
                    ),
                );
                do_update = true;
            }

            if let Some(stripe) = ptr.stripe {
                if !self.stripes.shadow_alive(stripe.idx) {
                    self.issues.repairable(
                        IssueKind::DeadStripe,
                        format!(
                            "{tree} key at {}: pointer to nonexistent stripe {}",
                            key.pos, stripe.idx
                        ),
                    );
                    do_update = true;
                }
            }
        }

        if !do_update {
            return Ok(Some(key.clone()));
        }
        if is_root {
            self.issues.fatal(
                IssueKind::RootRepair,
                format!("{tree} root pointer needs repair; cannot update tree roots"),
            );
            return Err(GcError::StructuralConflict(format!(
                "{tree} root pointer cannot be rewritten"
            )));
        }

        let mut fixed = key.clone();
        if let Some(ptrs) = fixed.ptrs_mut() {
            let mut kept = ptrs.clone();
            kept.clear();
            for ptr in ptrs.iter() {
                if self.ptr_invalid(ptr)? {
                    continue;
                }
                let mut ptr = *ptr;
                if ptr.stripe.is_some_and(|s| !self.stripes.shadow_alive(s.idx)) {
                    ptr.stripe = None;
                }
                kept.push(ptr);
            }
            *ptrs = kept;
        }

        let emptied = fixed.ptrs().is_empty()
            && matches!(
                fixed.value,
                KeyValue::Extent { .. } | KeyValue::BtreePtr { .. } | KeyValue::Stripe { .. }
            );
        if emptied {
            debug!(tree = %tree, level, pos = %key.pos, "gc.repair.delete_key");
            self.pending.stage_delete(tree, level, key.pos)?;
            return Ok(None);
        }
        debug!(
            tree = %tree,
            level,
            pos = %key.pos,
            ptrs_before = key.ptrs().len(),
            ptrs_after = fixed.ptrs().len(),
            "gc.repair.rewrite_key"
        );
        self.pending.stage_insert(tree, level, fixed.clone())?;
        Ok(Some(fixed))
    }
}
