use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::types::{GcPhase, GcPos, Pos};

/// Published GC position.
///
/// The writer side is serialized by a mutex and brackets every publish with an
/// odd/even sequence bump. Readers load the sequence, the fields, and the
/// sequence again, and retry when it was odd or changed in between.
pub struct GcPosCell {
    seq: AtomicU64,
    phase: AtomicU64,
    inode: AtomicU64,
    offset: AtomicU64,
    level: AtomicU64,
    writer: Mutex<()>,
}

impl Default for GcPosCell {
    fn default() -> Self {
        Self::new()
    }
}

impl GcPosCell {
    /// Creates a cell holding [`GcPhase::NotRunning`].
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            phase: AtomicU64::new(u64::from(GcPhase::NotRunning.to_raw())),
            inode: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            level: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Loads a consistent position.
    pub fn load(&self) -> GcPos {
        loop {
            let seq1 = self.seq.load(Ordering::Acquire);
            if seq1 % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let phase = self.phase.load(Ordering::Acquire);
            let inode = self.inode.load(Ordering::Acquire);
            let offset = self.offset.load(Ordering::Acquire);
            let level = self.level.load(Ordering::Acquire);
            let seq2 = self.seq.load(Ordering::Acquire);
            if seq1 == seq2 {
                return GcPos {
                    phase: GcPhase::from_raw(phase as u8),
                    pos: Pos::new(inode, offset),
                    level: level as u8,
                };
            }
            std::hint::spin_loop();
        }
    }

    /// Publishes `new` if it is strictly after the current position.
    ///
    /// Returns `false`, leaving the cell untouched, when `new` would not advance.
    pub fn advance(&self, new: GcPos) -> bool {
        let _writer = self.writer.lock();
        if new <= self.load() {
            return false;
        }
        self.publish(new);
        true
    }

    /// Unconditionally publishes `new`. Used to reset between passes.
    pub fn reset(&self, new: GcPos) {
        let _writer = self.writer.lock();
        self.publish(new);
    }

    /// Whether GC has already walked past `pos`.
    ///
    /// Writers use this to decide whether an update must also be applied to
    /// shadow state; references may only move from unvisited to visited.
    pub fn visited(&self, pos: GcPos) -> bool {
        pos <= self.load()
    }

    /// Number of publishes so far.
    pub fn version(&self) -> u64 {
        self.seq.load(Ordering::Acquire) / 2
    }

    fn publish(&self, new: GcPos) {
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.phase
            .store(u64::from(new.phase.to_raw()), Ordering::Release);
        self.inode.store(new.pos.inode, Ordering::Release);
        self.offset.store(new.pos.offset, Ordering::Release);
        self.level.store(u64::from(new.level), Ordering::Release);
        self.seq.fetch_add(1, Ordering::Release);
    }
}
