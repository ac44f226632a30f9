//! Per-device bucket metadata kept in a live and a shadow view.
//!
//! The live view is authoritative and is mutated by allocation, by repair
//! and by reconciliation. The shadow view only exists while a full pass runs:
//! it is allocated at pass start, rebuilt from every reference the pass
//! walks, diffed into the live view and then freed.

pub mod replicas;
pub mod stripe;
pub mod usage;

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::types::{DataType, DeviceId, Gen, GcError, Result, StripeIdx};

/// Sector of the primary superblock.
pub const SB_SECTOR: u64 = 8;

/// Geometry and fixed metadata locations of one device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLayout {
    /// Device index.
    pub dev: DeviceId,
    /// Buckets on the device.
    pub nbuckets: u64,
    /// Sectors per bucket.
    pub bucket_size: u32,
    /// Sector offsets of superblock copies.
    pub sb_offsets: Vec<u64>,
    /// Sectors reserved for each superblock copy.
    pub sb_sectors: u64,
    /// Buckets holding the journal.
    pub journal_buckets: Vec<u64>,
}

impl DeviceLayout {
    /// A device with one superblock at [`SB_SECTOR`] and no journal.
    pub fn new(dev: DeviceId, nbuckets: u64, bucket_size: u32) -> Self {
        Self {
            dev,
            nbuckets,
            bucket_size,
            sb_offsets: vec![SB_SECTOR],
            sb_sectors: 8,
            journal_buckets: Vec::new(),
        }
    }

    /// Replaces the superblock copies.
    pub fn superblocks(mut self, offsets: Vec<u64>, sectors: u64) -> Self {
        self.sb_offsets = offsets;
        self.sb_sectors = sectors;
        self
    }

    /// Replaces the journal bucket list.
    pub fn journal(mut self, buckets: Vec<u64>) -> Self {
        self.journal_buckets = buckets;
        self
    }

    /// Bucket containing `sector`.
    pub fn sector_to_bucket(&self, sector: u64) -> u64 {
        sector / u64::from(self.bucket_size.max(1))
    }

    /// First sector of `bucket`.
    pub fn bucket_to_sector(&self, bucket: u64) -> u64 {
        bucket * u64::from(self.bucket_size)
    }

    /// Usable sectors on the device.
    pub fn capacity_sectors(&self) -> u64 {
        self.nbuckets * u64::from(self.bucket_size)
    }
}

/// Usage-relevant state of a bucket; the fields reconciliation compares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BucketMark {
    /// Reuse counter.
    pub gen: Gen,
    /// What the bucket holds.
    pub data_type: DataType,
    /// Sectors of dirty data.
    pub dirty_sectors: u32,
    /// Sectors of cached data.
    pub cached_sectors: u32,
    /// Held by the allocator's free lists or an open bucket.
    pub owned_by_allocator: bool,
    /// Stripe this bucket is a block of.
    pub stripe: Option<StripeIdx>,
}

impl BucketMark {
    /// Whether the allocator may hand this bucket out.
    pub fn is_available(&self) -> bool {
        !self.owned_by_allocator && self.dirty_sectors == 0 && self.stripe.is_none()
    }

    /// Dirty plus cached sectors.
    pub fn sectors_used(&self) -> u32 {
        self.dirty_sectors.saturating_add(self.cached_sectors)
    }

    /// Unused sectors in a bucket that holds something.
    pub fn fragmented(&self, bucket_size: u32) -> i64 {
        match self.sectors_used() {
            0 => 0,
            used => i64::from(bucket_size.saturating_sub(used)),
        }
    }
}

/// A bucket: its mark plus generation bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Bucket {
    /// Usage state.
    pub mark: BucketMark,
    /// Oldest generation any pointer into this bucket still carries.
    pub oldest_gen: Gen,
    /// Whether `mark.gen` was loaded from allocation info.
    pub gen_valid: bool,
    /// Scratch oldest generation used by the generation-only pass.
    pub gc_gen: Gen,
}

/// Bucket array of one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketArray {
    /// Sectors per bucket.
    pub bucket_size: u32,
    /// Buckets indexed by bucket number.
    pub buckets: Vec<Bucket>,
}

impl BucketArray {
    fn fresh(layout: &DeviceLayout) -> Self {
        let bucket = Bucket {
            gen_valid: true,
            ..Bucket::default()
        };
        Self {
            bucket_size: layout.bucket_size,
            buckets: vec![bucket; layout.nbuckets as usize],
        }
    }

    /// Shadow array seeded from `live`: generations are carried over, every
    /// usage field starts at zero.
    fn shadow_of(live: &BucketArray) -> Result<Self> {
        let mut buckets = Vec::new();
        buckets
            .try_reserve_exact(live.buckets.len())
            .map_err(|_| GcError::ResourceExhausted("shadow bucket array"))?;
        buckets.extend(live.buckets.iter().map(|src| Bucket {
            mark: BucketMark {
                gen: src.mark.gen,
                ..BucketMark::default()
            },
            oldest_gen: src.mark.gen,
            gen_valid: src.gen_valid,
            gc_gen: 0,
        }));
        Ok(Self {
            bucket_size: live.bucket_size,
            buckets,
        })
    }

    fn get_mut(&mut self, bucket: u64) -> Result<&mut Bucket> {
        self.buckets
            .get_mut(bucket as usize)
            .ok_or(GcError::NotFound("bucket"))
    }
}

#[derive(Debug)]
struct DeviceBuckets {
    layout: DeviceLayout,
    live: RwLock<BucketArray>,
    shadow: Mutex<Option<BucketArray>>,
}

/// Bucket arrays of every member device.
#[derive(Debug, Default)]
pub struct BucketStore {
    devices: BTreeMap<DeviceId, DeviceBuckets>,
}

impl BucketStore {
    /// Creates live arrays for `layouts`; every bucket starts empty at gen 0.
    pub fn new(layouts: impl IntoIterator<Item = DeviceLayout>) -> Self {
        let devices = layouts
            .into_iter()
            .map(|layout| {
                let live = RwLock::new(BucketArray::fresh(&layout));
                (
                    layout.dev,
                    DeviceBuckets {
                        layout,
                        live,
                        shadow: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self { devices }
    }

    fn device(&self, dev: DeviceId) -> Result<&DeviceBuckets> {
        self.devices.get(&dev).ok_or(GcError::NotFound("device"))
    }

    /// Layouts of every member device in id order.
    pub fn layouts(&self) -> impl Iterator<Item = &DeviceLayout> {
        self.devices.values().map(|d| &d.layout)
    }

    /// Layout of one device.
    pub fn layout(&self, dev: DeviceId) -> Result<&DeviceLayout> {
        Ok(&self.device(dev)?.layout)
    }

    /// Member device ids.
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.keys().copied().collect()
    }

    /// Sum of device capacities in sectors.
    pub fn capacity_sectors(&self) -> u64 {
        self.layouts().map(DeviceLayout::capacity_sectors).sum()
    }

    /// Whether `(dev, bucket)` names an existing bucket.
    pub fn exists(&self, dev: DeviceId, bucket: u64) -> bool {
        self.devices
            .get(&dev)
            .map(|d| bucket < d.layout.nbuckets)
            .unwrap_or(false)
    }

    /// Copy of a live bucket.
    pub fn live(&self, dev: DeviceId, bucket: u64) -> Result<Bucket> {
        let device = self.device(dev)?;
        let live = device.live.read();
        live.buckets
            .get(bucket as usize)
            .copied()
            .ok_or(GcError::NotFound("bucket"))
    }

    /// Mutates a live bucket and returns its mark before and after.
    pub fn update_live(
        &self,
        dev: DeviceId,
        bucket: u64,
        f: impl FnOnce(&mut Bucket),
    ) -> Result<(BucketMark, BucketMark)> {
        let device = self.device(dev)?;
        let mut live = device.live.write();
        let slot = live.get_mut(bucket)?;
        let old = slot.mark;
        f(slot);
        Ok((old, slot.mark))
    }

    /// Runs `f` over a device's whole live array.
    pub fn with_live<R>(&self, dev: DeviceId, f: impl FnOnce(&mut BucketArray) -> R) -> Result<R> {
        let device = self.device(dev)?;
        let mut live = device.live.write();
        Ok(f(&mut live))
    }

    /// Allocates shadow arrays for every device.
    ///
    /// Fails with [`GcError::ResourceExhausted`] if memory cannot be reserved;
    /// arrays allocated before the failure are released.
    pub(crate) fn alloc_shadow(&self) -> Result<()> {
        for device in self.devices.values() {
            let mut shadow = device.shadow.lock();
            if shadow.is_some() {
                drop(shadow);
                self.free_shadow();
                return Err(GcError::Invalid("shadow buckets already allocated"));
            }
            let built = BucketArray::shadow_of(&device.live.read());
            match built {
                Ok(array) => *shadow = Some(array),
                Err(err) => {
                    drop(shadow);
                    self.free_shadow();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub(crate) fn free_shadow(&self) {
        for device in self.devices.values() {
            device.shadow.lock().take();
        }
    }

    /// Whether shadow arrays currently exist.
    pub fn shadow_allocated(&self) -> bool {
        self.devices.values().any(|d| d.shadow.lock().is_some())
    }

    /// Copy of a shadow bucket.
    pub(crate) fn shadow(&self, dev: DeviceId, bucket: u64) -> Result<Bucket> {
        let device = self.device(dev)?;
        let shadow = device.shadow.lock();
        shadow
            .as_ref()
            .ok_or(GcError::Invalid("shadow buckets not allocated"))?
            .buckets
            .get(bucket as usize)
            .copied()
            .ok_or(GcError::NotFound("bucket"))
    }

    /// Mutates a shadow bucket and returns its mark before and after.
    pub(crate) fn update_shadow(
        &self,
        dev: DeviceId,
        bucket: u64,
        f: impl FnOnce(&mut Bucket),
    ) -> Result<(BucketMark, BucketMark)> {
        let device = self.device(dev)?;
        let mut shadow = device.shadow.lock();
        let array = shadow
            .as_mut()
            .ok_or(GcError::Invalid("shadow buckets not allocated"))?;
        let slot = array.get_mut(bucket)?;
        let old = slot.mark;
        f(slot);
        Ok((old, slot.mark))
    }

    /// Gives `f` a device's live array and its shadow together.
    pub(crate) fn with_live_and_shadow<R>(
        &self,
        dev: DeviceId,
        f: impl FnOnce(&mut BucketArray, &BucketArray) -> R,
    ) -> Result<R> {
        let device = self.device(dev)?;
        let shadow = device.shadow.lock();
        let shadow = shadow
            .as_ref()
            .ok_or(GcError::Invalid("shadow buckets not allocated"))?;
        let mut live = device.live.write();
        Ok(f(&mut live, shadow))
    }
}
