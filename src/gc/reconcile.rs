//! Diffing recomputed shadow state into live state.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::atomic::Ordering;

use tracing::{debug, info};

use crate::bucket::stripe::Stripe;
use crate::bucket::usage::{DevUsage, REPLICAS_MAX};
use crate::fs::Filesystem;
use crate::gc::report::IssueKind;
use crate::types::{DataType, DeviceId, GcError, Result, StripeIdx};

struct Corrections<'a> {
    fs: &'a Filesystem,
    verify: bool,
    count: u64,
}

impl Corrections<'_> {
    /// Overwrites `dst` with `src` when they differ, reporting the difference.
    fn fix<T: PartialEq + Copy + Debug>(
        &mut self,
        kind: IssueKind,
        what: impl FnOnce() -> String,
        dst: &mut T,
        src: T,
    ) {
        if *dst == src {
            return;
        }
        if self.verify {
            self.fs.issues.repairable(
                kind,
                format!("{} has wrong value: got {:?}, should be {:?}", what(), dst, src),
            );
        }
        *dst = src;
        self.count += 1;
    }
}

impl Filesystem {
    /// Reconciles shadow state into live state and returns the number of
    /// corrected fields.
    ///
    /// Stripe shapes are verified before anything is written; a shape
    /// mismatch aborts with [`GcError::StripeShapeMismatch`] and leaves live
    /// state untouched. Devices are visited in `order`.
    pub(crate) fn gc_done(&self, initial: bool, order: &[DeviceId]) -> Result<u64> {
        let verify = !initial || self.opts.alloc_info_present;
        let mut fix = Corrections {
            fs: self,
            verify,
            count: 0,
        };

        let shape_error = self.stripes.with_both(|live, shadow| {
            let indices: BTreeSet<StripeIdx> = live.keys().chain(shadow.keys()).copied().collect();
            let dead = Stripe::default();
            for idx in indices {
                let dst = live.get(&idx).unwrap_or(&dead);
                let src = shadow.get(&idx).unwrap_or(&dead);
                if !dst.alive && !src.alive {
                    continue;
                }
                if !dst.same_shape(src) {
                    return Some((idx, dst.clone(), src.clone()));
                }
            }
            None
        })?;
        if let Some((idx, dst, src)) = shape_error {
            self.issues.fatal(
                IssueKind::StripeShape,
                format!(
                    "stripe {idx} shape differs: \
                     live alive={} sectors={} algorithm={} blocks={}/{}, \
                     recomputed alive={} sectors={} algorithm={} blocks={}/{}",
                    dst.alive,
                    dst.sectors,
                    dst.algorithm,
                    dst.nr_blocks,
                    dst.nr_redundant,
                    src.alive,
                    src.sectors,
                    src.algorithm,
                    src.nr_blocks,
                    src.nr_redundant
                ),
            );
            return Err(GcError::StripeShapeMismatch { idx });
        }

        self.stripes.with_both(|live, shadow| {
            for (idx, src) in shadow {
                let Some(dst) = live.get_mut(idx) else {
                    continue;
                };
                for (block, (d, s)) in dst
                    .block_sectors
                    .iter_mut()
                    .zip(src.block_sectors.iter())
                    .enumerate()
                {
                    fix.fix(
                        IssueKind::StripeMismatch,
                        || format!("stripe {idx} block {block} sectors"),
                        d,
                        *s,
                    );
                }
                let before = dst.blocks_nonempty;
                dst.recount_nonempty();
                let after = dst.blocks_nonempty;
                dst.blocks_nonempty = before;
                fix.fix(
                    IssueKind::StripeMismatch,
                    || format!("stripe {idx} blocks_nonempty"),
                    &mut dst.blocks_nonempty,
                    after,
                );
            }
        })?;

        for &dev in order {
            self.buckets.with_live_and_shadow(dev, |live, shadow| {
                let pairs = live.buckets.iter_mut().zip(shadow.buckets.iter());
                for (b, (dst, src)) in pairs.enumerate() {
                    let at = |field: &str| format!("dev {dev} bucket {b} {field}");
                    let (d, s) = (&mut dst.mark, &src.mark);
                    fix.fix(IssueKind::BucketMismatch, || at("gen"), &mut d.gen, s.gen);
                    fix.fix(
                        IssueKind::BucketMismatch,
                        || at("data_type"),
                        &mut d.data_type,
                        s.data_type,
                    );
                    fix.fix(
                        IssueKind::BucketMismatch,
                        || at("owned_by_allocator"),
                        &mut d.owned_by_allocator,
                        s.owned_by_allocator,
                    );
                    fix.fix(IssueKind::BucketMismatch, || at("stripe"), &mut d.stripe, s.stripe);
                    fix.fix(
                        IssueKind::BucketMismatch,
                        || at("dirty_sectors"),
                        &mut d.dirty_sectors,
                        s.dirty_sectors,
                    );
                    fix.fix(
                        IssueKind::BucketMismatch,
                        || at("cached_sectors"),
                        &mut d.cached_sectors,
                        s.cached_sectors,
                    );
                    dst.oldest_gen = src.oldest_gen;
                }
            })?;
        }

        let shadow = self.usage.fold_shadow()?;
        self.usage.with_live(|live| {
            for &dev in order {
                let src = shadow.devs.get(&dev).cloned().unwrap_or_default();
                let dst = live.dev_mut(dev);
                reconcile_dev(&mut fix, dev, dst, &src);
            }

            let (dst, src) = (&mut live.fs, &shadow.fs);
            let kind = IssueKind::FsUsageMismatch;
            fix.fix(kind, || "fs hidden".into(), &mut dst.hidden, src.hidden);
            fix.fix(kind, || "fs btree".into(), &mut dst.btree, src.btree);
            fix.fix(kind, || "fs data".into(), &mut dst.data, src.data);
            fix.fix(kind, || "fs cached".into(), &mut dst.cached, src.cached);
            fix.fix(kind, || "fs reserved".into(), &mut dst.reserved, src.reserved);
            fix.fix(kind, || "fs nr_inodes".into(), &mut dst.nr_inodes, src.nr_inodes);
            for i in 0..REPLICAS_MAX {
                fix.fix(
                    kind,
                    || format!("fs persistent_reserved[{i}]"),
                    &mut dst.persistent_reserved[i],
                    src.persistent_reserved[i],
                );
            }

            let entries: BTreeSet<_> = dst
                .replicas
                .keys()
                .chain(src.replicas.keys())
                .cloned()
                .collect();
            for entry in entries {
                let mut sectors = dst.replica_sectors(&entry);
                fix.fix(
                    kind,
                    || format!("fs replicas {entry}"),
                    &mut sectors,
                    src.replica_sectors(&entry),
                );
                if sectors == 0 {
                    dst.replicas.remove(&entry);
                } else {
                    dst.replicas.insert(entry, sectors);
                }
            }
        });

        if fix.count > 0 {
            self.need_alloc_write.store(true, Ordering::Release);
            info!(corrections = fix.count, verify, "gc.reconcile.corrected");
        } else {
            debug!("gc.reconcile.clean");
        }
        Ok(fix.count)
    }
}

fn reconcile_dev(fix: &mut Corrections<'_>, dev: DeviceId, dst: &mut DevUsage, src: &DevUsage) {
    let kind = IssueKind::DevUsageMismatch;
    fix.fix(kind, || format!("dev {dev} buckets_ec"), &mut dst.buckets_ec, src.buckets_ec);
    fix.fix(
        kind,
        || format!("dev {dev} buckets_unavailable"),
        &mut dst.buckets_unavailable,
        src.buckets_unavailable,
    );
    for data_type in DataType::ALL {
        let i = data_type.index();
        let name = data_type.name();
        fix.fix(
            kind,
            || format!("dev {dev} {name} buckets"),
            &mut dst.d[i].buckets,
            src.d[i].buckets,
        );
        fix.fix(
            kind,
            || format!("dev {dev} {name} sectors"),
            &mut dst.d[i].sectors,
            src.d[i].sectors,
        );
        fix.fix(
            kind,
            || format!("dev {dev} {name} fragmented"),
            &mut dst.d[i].fragmented,
            src.d[i].fragmented,
        );
    }
}
