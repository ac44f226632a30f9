use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Values that can be folded together shard by shard.
pub trait Accumulate: Default {
    /// Adds `other` into `self`.
    fn merge(&mut self, other: &Self);
}

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

fn thread_slot() -> usize {
    SLOT.with(|slot| match slot.get() {
        Some(idx) => idx,
        None => {
            let idx = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(idx));
            idx
        }
    })
}

/// Accumulator split into independent shards.
///
/// Each thread is pinned to one shard on first use, so concurrent markers
/// rarely contend. Totals exist only after [`Sharded::fold`].
#[derive(Debug)]
pub struct Sharded<T> {
    shards: Vec<Mutex<T>>,
}

impl<T: Accumulate> Sharded<T> {
    /// Creates `shard_count` empty shards (at least one).
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        let shards = (0..shard_count).map(|_| Mutex::new(T::default())).collect();
        Self { shards }
    }

    /// Creates one shard per available core.
    pub fn per_core() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cores.min(64))
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Runs `f` against the calling thread's shard.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let idx = thread_slot() % self.shards.len();
        let mut shard = self.shards[idx].lock();
        f(&mut shard)
    }

    /// Runs `f` against an explicit shard. Used to spread deterministic work.
    pub fn with_shard<R>(&self, idx: usize, f: impl FnOnce(&mut T) -> R) -> R {
        let mut shard = self.shards[idx % self.shards.len()].lock();
        f(&mut shard)
    }

    /// Folds every shard into a single total. Shards are left untouched.
    pub fn fold(&self) -> T {
        let mut total = T::default();
        for shard in &self.shards {
            total.merge(&shard.lock());
        }
        total
    }
}
