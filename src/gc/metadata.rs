//! Buckets referenced by no key: superblocks, journal, allocator state.

use tracing::debug;

use crate::bucket::stripe::adjust_sectors;
use crate::bucket::{DeviceLayout, SB_SECTOR};
use crate::fs::{Filesystem, View};
use crate::types::{DataType, GcError, GcPhase, GcPos, Result};

impl Filesystem {
    /// Marks superblock copies and journal buckets of every device as metadata.
    pub(crate) fn mark_superblocks(&self) -> Result<()> {
        self.gc_pos.advance(GcPos::phase(GcPhase::Superblock));
        let _mark = self.mark_lock.read();
        for layout in self.buckets.layouts() {
            for &offset in &layout.sb_offsets {
                if offset == SB_SECTOR {
                    self.mark_metadata_range(layout, 0, SB_SECTOR, DataType::Sb)?;
                }
                self.mark_metadata_range(layout, offset, offset + layout.sb_sectors, DataType::Sb)?;
            }
            for &bucket in &layout.journal_buckets {
                let start = layout.bucket_to_sector(bucket);
                let end = start + u64::from(layout.bucket_size);
                self.mark_metadata_range(layout, start, end, DataType::Journal)?;
            }
        }
        Ok(())
    }

    fn mark_metadata_range(
        &self,
        layout: &DeviceLayout,
        start: u64,
        end: u64,
        data_type: DataType,
    ) -> Result<()> {
        let mut sector = start;
        while sector < end {
            let bucket = layout.sector_to_bucket(sector);
            let bucket_end = layout.bucket_to_sector(bucket + 1).min(end);
            let sectors = bucket_end - sector;
            if !self.buckets.exists(layout.dev, bucket) {
                debug!(dev = %layout.dev, bucket, ?data_type, "gc.metadata.past_device_end");
                break;
            }
            self.update_bucket(View::Shadow, layout.dev, bucket, |b| {
                b.mark.data_type = data_type;
                b.mark.dirty_sectors = adjust_sectors(b.mark.dirty_sectors, sectors as i64);
            })?;
            self.with_usage(View::Shadow, |usage| usage.fs.hidden += sectors as i64)?;
            sector = bucket_end;
        }
        Ok(())
    }

    /// Marks buckets on the allocator's free lists and in open-bucket slots
    /// as owned by the allocator.
    pub(crate) fn mark_allocator_buckets(&self) -> Result<()> {
        self.gc_pos.advance(GcPos::alloc(None));
        let _mark = self.mark_lock.read();

        let mut failed: Option<GcError> = None;
        let mut free = 0usize;
        self.allocator.for_each_free_bucket(&mut |dev, bucket| {
            if failed.is_some() || !self.buckets.exists(dev, bucket) {
                return;
            }
            free += 1;
            if let Err(err) = self.update_bucket(View::Shadow, dev, bucket, |b| {
                b.mark.owned_by_allocator = true;
            }) {
                failed = Some(err);
            }
        });
        if let Some(err) = failed {
            return Err(err);
        }

        let mut open = 0usize;
        self.allocator.for_each_open_bucket(&mut |slot, ob| {
            self.gc_pos.advance(GcPos::alloc(Some(slot)));
            if failed.is_some() || !ob.valid || !self.buckets.exists(ob.dev, ob.bucket) {
                return;
            }
            open += 1;
            if let Err(err) = self.update_bucket(View::Shadow, ob.dev, ob.bucket, |b| {
                b.mark.owned_by_allocator = true;
            }) {
                failed = Some(err);
            }
        });
        if let Some(err) = failed {
            return Err(err);
        }
        debug!(free, open, "gc.metadata.allocator_marked");
        Ok(())
    }
}
