//! Device and filesystem usage counters.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use serde::Serialize;

use super::replicas::ReplicaEntry;
use super::BucketMark;
use crate::primitives::sharded::{Accumulate, Sharded};
use crate::types::{DataType, DeviceId, GcError, Result};

/// Most replicas a single key may request.
pub const REPLICAS_MAX: usize = 4;

/// Bucket, sector and fragmentation counts for one data type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TypeUsage {
    /// Buckets holding this type.
    pub buckets: i64,
    /// Sectors of this type.
    pub sectors: i64,
    /// Unused sectors inside buckets of this type.
    pub fragmented: i64,
}

/// Per-device usage counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DevUsage {
    /// Buckets that are part of an erasure-coded stripe.
    pub buckets_ec: i64,
    /// Buckets that cannot be handed out by the allocator.
    pub buckets_unavailable: i64,
    /// Counters indexed by [`DataType::index`].
    pub d: [TypeUsage; DataType::COUNT],
}

impl DevUsage {
    /// Applies the change of one bucket from `old` to `new`.
    pub fn apply_transition(&mut self, old: &BucketMark, new: &BucketMark, bucket_size: u32) {
        self.account(old, bucket_size, -1);
        self.account(new, bucket_size, 1);
    }

    fn account(&mut self, mark: &BucketMark, bucket_size: u32, sign: i64) {
        if mark.stripe.is_some() {
            self.buckets_ec += sign;
        }
        if !mark.is_available() {
            self.buckets_unavailable += sign;
        }
        if mark.data_type != DataType::None {
            let slot = &mut self.d[mark.data_type.index()];
            slot.buckets += sign;
            if mark.data_type != DataType::Cached {
                slot.sectors += sign * i64::from(mark.dirty_sectors);
            }
            slot.fragmented += sign * mark.fragmented(bucket_size);
        }
        self.d[DataType::Cached.index()].sectors += sign * i64::from(mark.cached_sectors);
    }
}

impl Accumulate for DevUsage {
    fn merge(&mut self, other: &Self) {
        self.buckets_ec += other.buckets_ec;
        self.buckets_unavailable += other.buckets_unavailable;
        for (dst, src) in self.d.iter_mut().zip(other.d.iter()) {
            dst.buckets += src.buckets;
            dst.sectors += src.sectors;
            dst.fragmented += src.fragmented;
        }
    }
}

/// Filesystem-wide usage counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsUsage {
    /// Superblock and journal sectors, hidden from user-visible totals.
    pub hidden: i64,
    /// Tree node sectors.
    pub btree: i64,
    /// Dirty user data sectors.
    pub data: i64,
    /// Cached user data sectors.
    pub cached: i64,
    /// Sectors reserved by in-flight writes.
    pub reserved: i64,
    /// Inodes.
    pub nr_inodes: i64,
    /// Persistent reservations indexed by `nr_replicas - 1`.
    pub persistent_reserved: [i64; REPLICAS_MAX],
    /// Sectors per replica combination.
    pub replicas: BTreeMap<ReplicaEntry, i64>,
}

impl FsUsage {
    /// Adds `sectors` to a replica combination.
    pub fn add_replicas(&mut self, entry: ReplicaEntry, sectors: i64) {
        *self.replicas.entry(entry).or_insert(0) += sectors;
    }

    /// Sectors recorded for a replica combination.
    pub fn replica_sectors(&self, entry: &ReplicaEntry) -> i64 {
        self.replicas.get(entry).copied().unwrap_or(0)
    }
}

impl Accumulate for FsUsage {
    fn merge(&mut self, other: &Self) {
        self.hidden += other.hidden;
        self.btree += other.btree;
        self.data += other.data;
        self.cached += other.cached;
        self.reserved += other.reserved;
        self.nr_inodes += other.nr_inodes;
        for (dst, src) in self
            .persistent_reserved
            .iter_mut()
            .zip(other.persistent_reserved.iter())
        {
            *dst += src;
        }
        for (entry, sectors) in &other.replicas {
            *self.replicas.entry(entry.clone()).or_insert(0) += sectors;
        }
    }
}

/// Filesystem and per-device usage together.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UsageSet {
    /// Filesystem-wide counters.
    pub fs: FsUsage,
    /// Per-device counters.
    pub devs: BTreeMap<DeviceId, DevUsage>,
}

impl UsageSet {
    /// Counters for `dev`, created on first use.
    pub fn dev_mut(&mut self, dev: DeviceId) -> &mut DevUsage {
        self.devs.entry(dev).or_default()
    }
}

impl Accumulate for UsageSet {
    fn merge(&mut self, other: &Self) {
        self.fs.merge(&other.fs);
        for (dev, usage) in &other.devs {
            self.devs.entry(*dev).or_default().merge(usage);
        }
    }
}

/// Authoritative usage plus the sharded shadow built by a pass.
#[derive(Debug, Default)]
pub struct UsageTable {
    live: RwLock<UsageSet>,
    shadow: RwLock<Option<Sharded<UsageSet>>>,
}

impl UsageTable {
    /// Creates zeroed live usage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of live usage.
    pub fn live(&self) -> UsageSet {
        self.live.read().clone()
    }

    /// Mutates live usage.
    pub fn with_live<R>(&self, f: impl FnOnce(&mut UsageSet) -> R) -> R {
        f(&mut self.live.write())
    }

    pub(crate) fn alloc_shadow(&self) -> Result<()> {
        let mut shadow = self.shadow.write();
        if shadow.is_some() {
            return Err(GcError::Invalid("shadow usage already allocated"));
        }
        *shadow = Some(Sharded::per_core());
        Ok(())
    }

    pub(crate) fn free_shadow(&self) {
        self.shadow.write().take();
    }

    /// Runs `f` against the calling worker's shadow shard.
    pub(crate) fn with_shadow<R>(&self, f: impl FnOnce(&mut UsageSet) -> R) -> Result<R> {
        let shadow = self.shadow.read();
        let sharded = shadow
            .as_ref()
            .ok_or(GcError::Invalid("shadow usage not allocated"))?;
        Ok(sharded.with(f))
    }

    /// Folds every shadow shard into one total.
    pub(crate) fn fold_shadow(&self) -> Result<UsageSet> {
        let shadow = self.shadow.read();
        let sharded = shadow
            .as_ref()
            .ok_or(GcError::Invalid("shadow usage not allocated"))?;
        Ok(sharded.fold())
    }
}
