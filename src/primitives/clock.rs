use std::sync::atomic::{AtomicU64, Ordering};

/// Clock that advances with sectors written.
///
/// Background work is paced against this clock so an idle filesystem does
/// not wake the collector.
#[derive(Debug, Default)]
pub struct IoClock {
    now: AtomicU64,
}

impl IoClock {
    /// Creates a clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current reading, in sectors.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    /// Advances the clock by `sectors` and returns the new reading.
    pub fn advance(&self, sectors: u64) -> u64 {
        self.now.fetch_add(sectors, Ordering::AcqRel) + sectors
    }

    /// Whether the clock has reached `deadline`.
    pub fn reached(&self, deadline: u64) -> bool {
        self.now() >= deadline
    }
}
