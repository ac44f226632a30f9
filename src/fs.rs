//! Filesystem context shared by every GC entry point.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::alloc::Allocator;
use crate::bucket::replicas::ReplicaRegistry;
use crate::bucket::stripe::StripeTable;
use crate::bucket::usage::{UsageSet, UsageTable};
use crate::bucket::{Bucket, BucketMark, BucketStore, DeviceLayout};
use crate::config::GcOptions;
use crate::gc::report::{GcStats, IssueLog};
use crate::metrics::{default_metrics, GcMetrics};
use crate::primitives::clock::IoClock;
use crate::primitives::seqlock::GcPosCell;
use crate::tree::pending::PendingUpdateLog;
use crate::tree::{Key, TreeStore};
use crate::types::{DeviceId, GcError, GcPos, Result};

/// Which copy of the accounting state an update targets.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum View {
    /// Authoritative state.
    Live,
    /// State being rebuilt by a running full pass.
    Shadow,
}

#[derive(Debug, Default)]
pub(crate) struct SchedulerState {
    pub(crate) stop: bool,
}

#[derive(Debug, Default)]
pub(crate) struct SchedulerSignal {
    pub(crate) state: Mutex<SchedulerState>,
    pub(crate) wakeup: Condvar,
}

/// Builder for a [`Filesystem`].
pub struct FsOptions {
    name: String,
    devices: Vec<DeviceLayout>,
    gc: GcOptions,
    trees: Arc<dyn TreeStore>,
    allocator: Arc<dyn Allocator>,
    metrics: Arc<dyn GcMetrics>,
}

impl FsOptions {
    /// Starts a builder over a tree subsystem and an allocator.
    pub fn new(trees: Arc<dyn TreeStore>, allocator: Arc<dyn Allocator>) -> Self {
        Self {
            name: "fs".to_owned(),
            devices: Vec::new(),
            gc: GcOptions::default(),
            trees,
            allocator,
            metrics: default_metrics(),
        }
    }

    /// Name used for the background thread and in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Adds a member device.
    pub fn device(mut self, layout: DeviceLayout) -> Self {
        self.devices.push(layout);
        self
    }

    /// Collector options.
    pub fn gc(mut self, gc: GcOptions) -> Self {
        self.gc = gc;
        self
    }

    /// Metrics sink.
    pub fn metrics(mut self, metrics: Arc<dyn GcMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builds the filesystem.
    pub fn build(self) -> Result<Arc<Filesystem>> {
        if self.devices.is_empty() {
            return Err(GcError::Invalid("filesystem without devices"));
        }
        let opts = self.gc.validate()?;
        let pending = PendingUpdateLog::new(opts.pending_capacity);
        let fs = Filesystem {
            name: self.name,
            buckets: BucketStore::new(self.devices),
            stripes: StripeTable::new(),
            usage: UsageTable::new(),
            replicas: ReplicaRegistry::new(),
            key_version: AtomicU64::new(0),
            trees: self.trees,
            pending,
            allocator: self.allocator,
            gc_lock: RwLock::new(()),
            mark_lock: RwLock::new(()),
            gens_lock: Mutex::new(()),
            gc_pos: GcPosCell::new(),
            need_another_gc: AtomicBool::new(false),
            need_alloc_write: AtomicBool::new(false),
            interior_updates: Mutex::new(0),
            interior_drained: Condvar::new(),
            issues: IssueLog::new(self.metrics.clone()),
            metrics: self.metrics,
            io_clock: IoClock::new(),
            kick: AtomicU64::new(0),
            scheduler: Arc::new(SchedulerSignal::default()),
            scheduler_handle: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            gc_count: AtomicU64::new(0),
            last_stats: Mutex::new(None),
            opts,
        };
        debug!(name = %fs.name, devices = fs.buckets.device_ids().len(), "fs.build");
        Ok(Arc::new(fs))
    }
}

/// Everything a pass reads or repairs.
pub struct Filesystem {
    pub(crate) name: String,
    pub(crate) opts: GcOptions,
    pub(crate) buckets: BucketStore,
    pub(crate) stripes: StripeTable,
    pub(crate) usage: UsageTable,
    pub(crate) replicas: ReplicaRegistry,
    pub(crate) key_version: AtomicU64,
    pub(crate) trees: Arc<dyn TreeStore>,
    pub(crate) pending: PendingUpdateLog,
    pub(crate) allocator: Arc<dyn Allocator>,
    /// Exclusive for full passes, shared for the lighter passes.
    pub(crate) gc_lock: RwLock<()>,
    /// Shared by markers, exclusive while shadow state is reconciled.
    pub(crate) mark_lock: RwLock<()>,
    /// Serializes generation-only passes.
    pub(crate) gens_lock: Mutex<()>,
    pub(crate) gc_pos: GcPosCell,
    pub(crate) need_another_gc: AtomicBool,
    pub(crate) need_alloc_write: AtomicBool,
    interior_updates: Mutex<usize>,
    interior_drained: Condvar,
    pub(crate) issues: IssueLog,
    pub(crate) metrics: Arc<dyn GcMetrics>,
    pub(crate) io_clock: IoClock,
    pub(crate) kick: AtomicU64,
    pub(crate) scheduler: Arc<SchedulerSignal>,
    pub(crate) scheduler_handle: Mutex<Option<JoinHandle<()>>>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) gc_count: AtomicU64,
    pub(crate) last_stats: Mutex<Option<GcStats>>,
}

/// In-flight interior-node update; full passes wait for these to drain.
#[must_use]
pub struct InteriorUpdate<'a> {
    fs: &'a Filesystem,
}

impl Drop for InteriorUpdate<'_> {
    fn drop(&mut self) {
        let mut count = self.fs.interior_updates.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.fs.interior_drained.notify_all();
        }
    }
}

impl Filesystem {
    /// Filesystem name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collector options.
    pub fn options(&self) -> &GcOptions {
        &self.opts
    }

    /// Bucket arrays.
    pub fn buckets(&self) -> &BucketStore {
        &self.buckets
    }

    /// Stripe tables.
    pub fn stripes(&self) -> &StripeTable {
        &self.stripes
    }

    /// Usage counters.
    pub fn usage(&self) -> &UsageTable {
        &self.usage
    }

    /// Known replica combinations.
    pub fn replicas(&self) -> &ReplicaRegistry {
        &self.replicas
    }

    /// Tree subsystem.
    pub fn trees(&self) -> &Arc<dyn TreeStore> {
        &self.trees
    }

    /// Repairs staged by passes and not yet applied by the tree subsystem.
    pub fn pending(&self) -> &PendingUpdateLog {
        &self.pending
    }

    /// Consistency issue log.
    pub fn issues(&self) -> &IssueLog {
        &self.issues
    }

    /// Highest key version handed out.
    pub fn key_version(&self) -> u64 {
        self.key_version.load(Ordering::Acquire)
    }

    /// Records that keys up to `version` exist.
    pub fn bump_key_version(&self, version: u64) {
        self.key_version.fetch_max(version, Ordering::AcqRel);
    }

    /// Current published GC position.
    pub fn gc_pos(&self) -> GcPos {
        self.gc_pos.load()
    }

    /// Whether the running pass has already walked past `pos`.
    pub fn gc_visited(&self, pos: GcPos) -> bool {
        self.gc_pos.visited(pos)
    }

    /// Whether allocation info must be persisted after repairs.
    pub fn need_alloc_write(&self) -> bool {
        self.need_alloc_write.load(Ordering::Acquire)
    }

    /// Passes completed so far.
    pub fn gc_count(&self) -> u64 {
        self.gc_count.load(Ordering::Acquire)
    }

    /// Statistics of the most recent pass.
    pub fn last_gc_stats(&self) -> Option<GcStats> {
        self.last_stats.lock().clone()
    }

    /// Asks the background loop for a pass.
    pub fn kick_gc(&self) {
        self.kick.fetch_add(1, Ordering::AcqRel);
        let _state = self.scheduler.state.lock();
        self.scheduler.wakeup.notify_all();
    }

    /// Accounts `sectors` written against the I/O clock.
    pub fn advance_io_clock(&self, sectors: u64) -> u64 {
        let now = self.io_clock.advance(sectors);
        let _state = self.scheduler.state.lock();
        self.scheduler.wakeup.notify_all();
        now
    }

    /// Current I/O clock reading.
    pub fn io_clock_now(&self) -> u64 {
        self.io_clock.now()
    }

    /// Registers an in-flight interior-node update.
    pub fn begin_interior_update(&self) -> InteriorUpdate<'_> {
        *self.interior_updates.lock() += 1;
        InteriorUpdate { fs: self }
    }

    pub(crate) fn wait_interior_updates(&self) {
        let mut count = self.interior_updates.lock();
        while *count > 0 {
            self.interior_drained.wait(&mut count);
        }
    }

    /// Makes long-running passes stop at their next check.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _state = self.scheduler.state.lock();
        self.scheduler.wakeup.notify_all();
    }

    pub(crate) fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn bucket(&self, view: View, dev: DeviceId, bucket: u64) -> Result<Bucket> {
        match view {
            View::Live => self.buckets.live(dev, bucket),
            View::Shadow => self.buckets.shadow(dev, bucket),
        }
    }

    /// Mutates one bucket in `view` and applies the device usage transition.
    pub(crate) fn update_bucket(
        &self,
        view: View,
        dev: DeviceId,
        bucket: u64,
        f: impl FnOnce(&mut Bucket),
    ) -> Result<(BucketMark, BucketMark)> {
        let bucket_size = self.buckets.layout(dev)?.bucket_size;
        let (old, new) = match view {
            View::Live => self.buckets.update_live(dev, bucket, f)?,
            View::Shadow => self.buckets.update_shadow(dev, bucket, f)?,
        };
        if old != new {
            self.with_usage(view, |usage| {
                usage.dev_mut(dev).apply_transition(&old, &new, bucket_size)
            })?;
        }
        Ok((old, new))
    }

    pub(crate) fn with_usage<R>(
        &self,
        view: View,
        f: impl FnOnce(&mut UsageSet) -> R,
    ) -> Result<R> {
        match view {
            View::Live => Ok(self.usage.with_live(f)),
            View::Shadow => self.usage.with_shadow(f),
        }
    }

    /// Applies the accounting of a key update made outside the collector.
    ///
    /// `at` is the position of the node holding the key. Live state is always
    /// updated; shadow state only when a running pass has already visited `at`,
    /// since the pass will account the key itself otherwise.
    pub fn run_triggers(&self, at: GcPos, old: Option<&Key>, new: Option<&Key>) -> Result<()> {
        let _mark = self.mark_lock.read();
        let mut views = vec![View::Live];
        if self.buckets.shadow_allocated() && self.gc_pos.visited(at) {
            views.push(View::Shadow);
        }
        for view in views {
            if let Some(old) = old {
                self.account_key(view, old, -1)?;
            }
            if let Some(new) = new {
                self.account_key(view, new, 1)?;
            }
        }
        Ok(())
    }
}

impl Drop for Filesystem {
    fn drop(&mut self) {
        self.stop_background_scheduler();
    }
}
