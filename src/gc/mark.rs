//! Reference and usage effects of keys.

use smallvec::SmallVec;
use tracing::trace;

use crate::bucket::replicas::ReplicaEntry;
use crate::bucket::stripe::{adjust_sectors, Stripe};
use crate::bucket::usage::REPLICAS_MAX;
use crate::bucket::BucketMark;
use crate::fs::{Filesystem, View};
use crate::gc::report::IssueKind;
use crate::tree::{ExtentPtr, Key, KeyValue, StripeRef};
use crate::types::{gen_after, DataType, DeviceId, Result, StripeIdx, TreeId};

type Devs = SmallVec<[DeviceId; 4]>;

/// Moves `sectors` of `data_type` into or out of a bucket mark.
pub(crate) fn apply_sectors(mark: &mut BucketMark, data_type: DataType, sectors: u32, sign: i64) {
    let delta = i64::from(sectors) * sign;
    if data_type == DataType::Cached {
        mark.cached_sectors = adjust_sectors(mark.cached_sectors, delta);
    } else {
        mark.dirty_sectors = adjust_sectors(mark.dirty_sectors, delta);
        if mark.dirty_sectors > 0 {
            mark.data_type = data_type;
        }
    }
    if mark.dirty_sectors == 0 {
        mark.data_type = if mark.cached_sectors > 0 {
            DataType::Cached
        } else {
            DataType::None
        };
    }
}

/// Replica combinations a key claims, regardless of pointer staleness.
pub(crate) fn replica_entries(key: &Key) -> Vec<ReplicaEntry> {
    let mut out = Vec::new();
    match &key.value {
        KeyValue::Extent { ptrs } => {
            let dirty: Devs = ptrs.iter().filter(|p| !p.cached).map(|p| p.dev).collect();
            if !dirty.is_empty() {
                out.push(ReplicaEntry::new(DataType::User, dirty));
            }
            out.extend(
                ptrs.iter()
                    .filter(|p| p.cached)
                    .map(|p| ReplicaEntry::new(DataType::Cached, [p.dev])),
            );
        }
        KeyValue::BtreePtr { ptrs, .. } if !ptrs.is_empty() => {
            out.push(ReplicaEntry::new(DataType::Btree, ptrs.iter().map(|p| p.dev)));
        }
        KeyValue::Stripe { ptrs, .. } => {
            let parity: Devs = ptrs
                .iter()
                .enumerate()
                .filter(|(idx, _)| key.ptr_data_type(*idx) == DataType::Parity)
                .map(|(_, p)| p.dev)
                .collect();
            if !parity.is_empty() {
                out.push(ReplicaEntry::new(DataType::Parity, parity));
            }
        }
        _ => {}
    }
    out
}

impl Filesystem {
    /// Marks one key into shadow state and returns the largest staleness of
    /// its pointers against live generations.
    ///
    /// Initial passes also validate the key version, the replica registry and
    /// every pointer, staging repairs as needed.
    pub(crate) fn gc_mark_key(
        &self,
        tree: TreeId,
        level: u8,
        key: &Key,
        initial: bool,
        is_root: bool,
    ) -> Result<u8> {
        let _mark = self.mark_lock.read();
        let repaired;
        let mut key = key;
        if initial {
            let recorded = self.key_version();
            if key.version > recorded {
                self.issues.repairable(
                    IssueKind::KeyVersion,
                    format!(
                        "{tree} key at {}: version {} higher than recorded {recorded}",
                        key.pos, key.version
                    ),
                );
                self.bump_key_version(key.version);
            }
            self.check_replicas(tree, key);
            match self.check_fix_ptrs(tree, level, key, is_root)? {
                Some(fixed) => {
                    repaired = fixed;
                    key = &repaired;
                }
                None => return Ok(0),
            }
        }

        let mut max_stale = 0;
        for ptr in key.ptrs() {
            if !self.buckets.exists(ptr.dev, ptr.bucket) {
                continue;
            }
            let live_gen = self.buckets.live(ptr.dev, ptr.bucket)?.mark.gen;
            self.buckets.update_shadow(ptr.dev, ptr.bucket, |bucket| {
                if gen_after(bucket.oldest_gen, ptr.gen) > 0 {
                    bucket.oldest_gen = ptr.gen;
                }
            })?;
            max_stale = max_stale.max(gen_after(live_gen, ptr.gen));
        }
        self.account_key(View::Shadow, key, 1)?;
        trace!(tree = %tree, level, pos = %key.pos, max_stale, "gc.mark.key");
        Ok(max_stale)
    }

    fn check_replicas(&self, tree: TreeId, key: &Key) {
        for entry in replica_entries(key) {
            if self.replicas.contains(&entry) {
                continue;
            }
            if !self.opts.rebuild_replicas {
                self.issues.repairable(
                    IssueKind::ReplicasMissing,
                    format!("{tree} key at {}: replicas {entry} not registered", key.pos),
                );
            }
            self.replicas.register(entry);
        }
    }

    /// Adds (`sign` = 1) or removes (`sign` = -1) the accounting of `key` in `view`.
    ///
    /// Pointers whose generation does not match their bucket are skipped.
    pub(crate) fn account_key(&self, view: View, key: &Key, sign: i64) -> Result<()> {
        match &key.value {
            KeyValue::Extent { ptrs } => self.account_extent(view, key, ptrs, sign),
            KeyValue::BtreePtr { ptrs, .. } => {
                let sectors = self.opts.btree_node_sectors;
                let mut devs = Devs::new();
                for (idx, ptr) in ptrs.iter().enumerate() {
                    if self.account_ptr(view, ptr, key.ptr_data_type(idx), sectors, sign)? {
                        devs.push(ptr.dev);
                    }
                }
                if devs.is_empty() {
                    return Ok(());
                }
                let total = sign * i64::from(sectors) * devs.len() as i64;
                self.with_usage(view, |usage| {
                    usage.fs.btree += total;
                    usage
                        .fs
                        .add_replicas(ReplicaEntry::new(DataType::Btree, devs), total);
                })
            }
            KeyValue::Stripe {
                algorithm,
                nr_blocks,
                nr_redundant,
                sectors,
                ptrs,
            } => {
                let idx = StripeIdx(key.pos.offset);
                let shape = Stripe::new(*sectors, *algorithm, *nr_blocks, *nr_redundant);
                self.account_stripe(view, key, idx, shape, ptrs, sign)
            }
            KeyValue::Reservation { nr_replicas } => {
                let slot = usize::from((*nr_replicas).max(1) - 1).min(REPLICAS_MAX - 1);
                let sectors = sign * i64::from(key.size);
                self.with_usage(view, |usage| usage.fs.persistent_reserved[slot] += sectors)
            }
            KeyValue::Inode => self.with_usage(view, |usage| usage.fs.nr_inodes += sign),
            KeyValue::Deleted | KeyValue::Opaque { .. } => Ok(()),
        }
    }

    /// Moves sectors into one bucket; `false` when the pointer is stale or
    /// its bucket does not exist.
    fn account_ptr(
        &self,
        view: View,
        ptr: &ExtentPtr,
        data_type: DataType,
        sectors: u32,
        sign: i64,
    ) -> Result<bool> {
        if !self.buckets.exists(ptr.dev, ptr.bucket) {
            return Ok(false);
        }
        let mut counted = false;
        self.update_bucket(view, ptr.dev, ptr.bucket, |bucket| {
            if bucket.mark.gen != ptr.gen {
                return;
            }
            counted = true;
            apply_sectors(&mut bucket.mark, data_type, sectors, sign);
        })?;
        Ok(counted)
    }

    fn account_extent(&self, view: View, key: &Key, ptrs: &[ExtentPtr], sign: i64) -> Result<()> {
        let size = i64::from(key.size);
        let mut dirty_devs = Devs::new();
        let mut cached_devs = Devs::new();
        for (idx, ptr) in ptrs.iter().enumerate() {
            if !self.account_ptr(view, ptr, key.ptr_data_type(idx), key.size, sign)? {
                continue;
            }
            if ptr.cached {
                cached_devs.push(ptr.dev);
                continue;
            }
            dirty_devs.push(ptr.dev);
            if let Some(stripe) = ptr.stripe {
                self.account_stripe_block(view, stripe, sign * size);
            }
        }
        let dirty = sign * size * dirty_devs.len() as i64;
        self.with_usage(view, |usage| {
            usage.fs.data += dirty;
            usage.fs.cached += sign * size * cached_devs.len() as i64;
            if !dirty_devs.is_empty() {
                usage
                    .fs
                    .add_replicas(ReplicaEntry::new(DataType::User, dirty_devs), dirty);
            }
            for dev in cached_devs {
                usage
                    .fs
                    .add_replicas(ReplicaEntry::new(DataType::Cached, [dev]), sign * size);
            }
        })
    }

    /// References into stripes the pass has not seen are left to repair.
    fn account_stripe_block(&self, view: View, stripe: StripeRef, delta: i64) {
        let block = usize::from(stripe.block);
        let outcome = match view {
            View::Shadow => self
                .stripes
                .shadow_add_block_sectors(stripe.idx, stripe.block, delta),
            View::Live => self.stripes.update_live(stripe.idx, |s| {
                if let Some(slot) = s.block_sectors.get_mut(block) {
                    *slot = adjust_sectors(*slot, delta);
                }
            }),
        };
        if let Err(err) = outcome {
            trace!(idx = %stripe.idx, block, %err, "gc.mark.stripe_block_skipped");
        }
    }

    fn account_stripe(
        &self,
        view: View,
        key: &Key,
        idx: StripeIdx,
        shape: Stripe,
        ptrs: &[ExtentPtr],
        sign: i64,
    ) -> Result<()> {
        match (view, sign > 0) {
            (View::Shadow, true) => self.stripes.shadow_insert(idx, shape.clone())?,
            (View::Shadow, false) => {}
            (View::Live, true) => {
                if self.stripes.live(idx).is_none() {
                    self.stripes.insert_live(idx, shape.clone());
                }
            }
            (View::Live, false) => {
                let _ = self.stripes.update_live(idx, |s| s.alive = false);
            }
        }

        let mut parity = Devs::new();
        for (block, ptr) in ptrs.iter().enumerate() {
            if !self.buckets.exists(ptr.dev, ptr.bucket) {
                continue;
            }
            let data_type = key.ptr_data_type(block);
            let mut counted = false;
            self.update_bucket(view, ptr.dev, ptr.bucket, |bucket| {
                if bucket.mark.gen != ptr.gen {
                    return;
                }
                counted = true;
                bucket.mark.stripe = (sign > 0).then_some(idx);
                if data_type == DataType::Parity {
                    apply_sectors(&mut bucket.mark, DataType::Parity, shape.sectors, sign);
                }
            })?;
            if counted && data_type == DataType::Parity {
                parity.push(ptr.dev);
            }
        }
        if parity.is_empty() {
            return Ok(());
        }
        let total = sign * i64::from(shape.sectors) * parity.len() as i64;
        self.with_usage(view, |usage| {
            usage
                .fs
                .add_replicas(ReplicaEntry::new(DataType::Parity, parity), total)
        })
    }

    /// How many generations a pointer trails its bucket's live generation.
    pub(crate) fn ptr_stale(&self, ptr: &ExtentPtr) -> Result<u8> {
        let bucket = self.buckets.live(ptr.dev, ptr.bucket)?;
        Ok(gen_after(bucket.mark.gen, ptr.gen))
    }
}
