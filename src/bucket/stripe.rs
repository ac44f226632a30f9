//! Erasure-coded stripe records.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::types::{GcError, Result, StripeIdx};

/// Erasure-coded stripe record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Stripe {
    /// Whether the stripe exists.
    pub alive: bool,
    /// Sectors per block.
    pub sectors: u32,
    /// Redundancy algorithm id.
    pub algorithm: u8,
    /// Total blocks, data plus parity.
    pub nr_blocks: u8,
    /// Parity blocks, stored last.
    pub nr_redundant: u8,
    /// Sectors referenced in each block.
    pub block_sectors: Vec<u32>,
    /// Blocks with a non-zero sector count.
    pub blocks_nonempty: u32,
}

impl Stripe {
    /// A live stripe with empty per-block counts.
    pub fn new(sectors: u32, algorithm: u8, nr_blocks: u8, nr_redundant: u8) -> Self {
        Self {
            alive: true,
            sectors,
            algorithm,
            nr_blocks,
            nr_redundant,
            block_sectors: vec![0; usize::from(nr_blocks)],
            blocks_nonempty: 0,
        }
    }

    /// Whether the immutable shape fields agree.
    pub fn same_shape(&self, other: &Stripe) -> bool {
        self.alive == other.alive
            && self.sectors == other.sectors
            && self.algorithm == other.algorithm
            && self.nr_blocks == other.nr_blocks
            && self.nr_redundant == other.nr_redundant
    }

    /// Index of the first parity block.
    pub fn first_parity_block(&self) -> u8 {
        self.nr_blocks.saturating_sub(self.nr_redundant)
    }

    /// Recomputes `blocks_nonempty` from `block_sectors`.
    pub fn recount_nonempty(&mut self) {
        self.blocks_nonempty = self.block_sectors.iter().filter(|s| **s != 0).count() as u32;
    }
}

/// Applies a signed change to a sector count, clamping at the type's bounds.
pub(crate) fn adjust_sectors(sectors: u32, delta: i64) -> u32 {
    (i64::from(sectors) + delta).clamp(0, i64::from(u32::MAX)) as u32
}

/// Live and shadow stripe tables.
#[derive(Debug, Default)]
pub struct StripeTable {
    live: RwLock<BTreeMap<StripeIdx, Stripe>>,
    shadow: Mutex<Option<BTreeMap<StripeIdx, Stripe>>>,
}

impl StripeTable {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a live stripe, as the stripe lifecycle code would.
    pub fn insert_live(&self, idx: StripeIdx, stripe: Stripe) {
        self.live.write().insert(idx, stripe);
    }

    /// Copy of a live stripe.
    pub fn live(&self, idx: StripeIdx) -> Option<Stripe> {
        self.live.read().get(&idx).cloned()
    }

    /// Mutates a live stripe in place.
    pub fn update_live(&self, idx: StripeIdx, f: impl FnOnce(&mut Stripe)) -> Result<()> {
        let mut live = self.live.write();
        let stripe = live.get_mut(&idx).ok_or(GcError::NotFound("stripe"))?;
        f(stripe);
        Ok(())
    }

    /// Number of live stripes.
    pub fn live_len(&self) -> usize {
        self.live.read().len()
    }

    pub(crate) fn alloc_shadow(&self) -> Result<()> {
        let mut shadow = self.shadow.lock();
        if shadow.is_some() {
            return Err(GcError::Invalid("shadow stripes already allocated"));
        }
        *shadow = Some(BTreeMap::new());
        Ok(())
    }

    pub(crate) fn free_shadow(&self) {
        self.shadow.lock().take();
    }

    /// Records a stripe key seen during marking.
    ///
    /// Block counts already accumulated for `idx` survive when the block
    /// count is unchanged.
    pub(crate) fn shadow_insert(&self, idx: StripeIdx, mut stripe: Stripe) -> Result<()> {
        let mut shadow = self.shadow.lock();
        let table = shadow
            .as_mut()
            .ok_or(GcError::Invalid("shadow stripes not allocated"))?;
        if let Some(prev) = table.remove(&idx) {
            if prev.block_sectors.len() == stripe.block_sectors.len() {
                stripe.block_sectors = prev.block_sectors;
            }
        }
        table.insert(idx, stripe);
        Ok(())
    }

    /// Whether the pass has seen a live stripe at `idx`.
    pub(crate) fn shadow_alive(&self, idx: StripeIdx) -> bool {
        self.shadow
            .lock()
            .as_ref()
            .and_then(|table| table.get(&idx))
            .map(|stripe| stripe.alive)
            .unwrap_or(false)
    }

    /// Adjusts the sectors a data pointer references in one block of a stripe.
    pub(crate) fn shadow_add_block_sectors(
        &self,
        idx: StripeIdx,
        block: u8,
        delta: i64,
    ) -> Result<()> {
        let mut shadow = self.shadow.lock();
        let table = shadow
            .as_mut()
            .ok_or(GcError::Invalid("shadow stripes not allocated"))?;
        let stripe = table.get_mut(&idx).ok_or(GcError::NotFound("stripe"))?;
        let slot = stripe
            .block_sectors
            .get_mut(usize::from(block))
            .ok_or(GcError::Invalid("stripe block out of range"))?;
        *slot = adjust_sectors(*slot, delta);
        Ok(())
    }

    /// Gives `f` the live table and the shadow table together.
    pub(crate) fn with_both<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<StripeIdx, Stripe>, &BTreeMap<StripeIdx, Stripe>) -> R,
    ) -> Result<R> {
        let shadow = self.shadow.lock();
        let shadow = shadow
            .as_ref()
            .ok_or(GcError::Invalid("shadow stripes not allocated"))?;
        let mut live = self.live.write();
        Ok(f(&mut live, shadow))
    }
}
