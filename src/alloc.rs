//! Allocator state the collector must account for.
//!
//! Buckets sitting on free lists or held open for writes are not referenced
//! by any key, so a full pass marks them from here.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::types::{DeviceId, GcError, Gen, Result};

/// Free-list reserve classes, in the order buckets are handed out for nodes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ReserveClass {
    /// Reserved for tree nodes.
    Btree,
    /// Reserved for copying data during moves.
    MovingGc,
    /// Unreserved.
    None,
}

impl ReserveClass {
    /// Number of classes.
    pub const COUNT: usize = 3;

    fn index(self) -> usize {
        match self {
            ReserveClass::Btree => 0,
            ReserveClass::MovingGc => 1,
            ReserveClass::None => 2,
        }
    }
}

/// A bucket being written to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpenBucket {
    /// Device.
    pub dev: DeviceId,
    /// Bucket number.
    pub bucket: u64,
    /// Generation the bucket was opened at.
    pub gen: Gen,
    /// Whether the slot is in use.
    pub valid: bool,
}

/// Allocator interface seen by the collector.
pub trait Allocator: Send + Sync {
    /// Calls `f` for every bucket on the incoming and reserve free lists.
    ///
    /// The free-list lock is held for the whole iteration.
    fn for_each_free_bucket(&self, f: &mut dyn FnMut(DeviceId, u64));

    /// Calls `f` for every open-bucket slot with its index.
    fn for_each_open_bucket(&self, f: &mut dyn FnMut(usize, &OpenBucket));

    /// Takes a bucket for a new tree node.
    fn alloc_node_bucket(&self) -> Result<(DeviceId, u64)>;

    /// Hands back a bucket from [`Allocator::alloc_node_bucket`] that never
    /// became reachable.
    fn release_node_bucket(&self, dev: DeviceId, bucket: u64);
}

#[derive(Debug, Default)]
struct AllocState {
    free_inc: VecDeque<(DeviceId, u64)>,
    free: [VecDeque<(DeviceId, u64)>; ReserveClass::COUNT],
    open: Vec<OpenBucket>,
}

/// In-memory allocator with explicit free lists.
#[derive(Debug, Default)]
pub struct MemAllocator {
    state: Mutex<AllocState>,
}

impl MemAllocator {
    /// Empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a bucket onto the incoming free list.
    pub fn push_free_inc(&self, dev: DeviceId, bucket: u64) {
        self.state.lock().free_inc.push_back((dev, bucket));
    }

    /// Pushes a bucket onto a reserve free list.
    pub fn push_free(&self, reserve: ReserveClass, dev: DeviceId, bucket: u64) {
        self.state.lock().free[reserve.index()].push_back((dev, bucket));
    }

    /// Opens a bucket and returns its slot.
    pub fn open_bucket(&self, dev: DeviceId, bucket: u64, gen: Gen) -> usize {
        let mut state = self.state.lock();
        let entry = OpenBucket {
            dev,
            bucket,
            gen,
            valid: true,
        };
        match state.open.iter().position(|ob| !ob.valid) {
            Some(slot) => {
                state.open[slot] = entry;
                slot
            }
            None => {
                state.open.push(entry);
                state.open.len() - 1
            }
        }
    }

    /// Closes an open-bucket slot.
    pub fn close_bucket(&self, slot: usize) {
        if let Some(ob) = self.state.lock().open.get_mut(slot) {
            ob.valid = false;
        }
    }

    /// Buckets on every free list.
    pub fn free_count(&self) -> usize {
        let state = self.state.lock();
        state.free_inc.len() + state.free.iter().map(VecDeque::len).sum::<usize>()
    }
}

impl Allocator for MemAllocator {
    fn for_each_free_bucket(&self, f: &mut dyn FnMut(DeviceId, u64)) {
        let state = self.state.lock();
        for (dev, bucket) in state.free_inc.iter().chain(state.free.iter().flatten()) {
            f(*dev, *bucket);
        }
    }

    fn for_each_open_bucket(&self, f: &mut dyn FnMut(usize, &OpenBucket)) {
        let state = self.state.lock();
        for (slot, ob) in state.open.iter().enumerate() {
            f(slot, ob);
        }
    }

    fn alloc_node_bucket(&self) -> Result<(DeviceId, u64)> {
        let mut state = self.state.lock();
        for reserve in [ReserveClass::Btree, ReserveClass::None] {
            if let Some(found) = state.free[reserve.index()].pop_front() {
                return Ok(found);
            }
        }
        Err(GcError::ResourceExhausted("tree node buckets"))
    }

    fn release_node_bucket(&self, dev: DeviceId, bucket: u64) {
        self.state.lock().free[ReserveClass::Btree.index()].push_front((dev, bucket));
    }
}
