//! Staged repairs that traversal sees before they are committed.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::Mutex;

use super::Key;
use crate::types::{GcError, Pos, Result, TreeId, POS_MAX};

type Slot = (TreeId, u8, Pos);

/// Staged key inserts and deletes that traversal must see before they are
/// durably committed.
///
/// Entries are keyed by `(tree, level, position)`; a later entry for the
/// same slot replaces the earlier one.
#[derive(Debug)]
pub struct PendingUpdateLog {
    entries: Mutex<BTreeMap<Slot, Option<Key>>>,
    capacity: usize,
}

impl PendingUpdateLog {
    /// Creates a log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    fn stage(&self, slot: Slot, value: Option<Key>) -> Result<()> {
        let mut entries = self.entries.lock();
        if !entries.contains_key(&slot) && entries.len() >= self.capacity {
            return Err(GcError::ResourceExhausted("pending update log"));
        }
        entries.insert(slot, value);
        Ok(())
    }

    /// Stages an insert or overwrite of `key` at `level`.
    pub fn stage_insert(&self, tree: TreeId, level: u8, key: Key) -> Result<()> {
        self.stage((tree, level, key.pos), Some(key))
    }

    /// Stages a delete of the key at `pos`.
    pub fn stage_delete(&self, tree: TreeId, level: u8, pos: Pos) -> Result<()> {
        self.stage((tree, level, pos), None)
    }

    /// Staged entry for a slot: `Some(None)` is a staged delete.
    pub fn get(&self, tree: TreeId, level: u8, pos: Pos) -> Option<Option<Key>> {
        self.entries.lock().get(&(tree, level, pos)).cloned()
    }

    /// Number of staged entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys of a node spanning `[min, max]` at `level`, with staged entries applied.
    pub fn overlay(&self, tree: TreeId, level: u8, min: Pos, max: Pos, keys: &[Key]) -> Vec<Key> {
        let entries = self.entries.lock();
        let range = (
            Bound::Included((tree, level, min)),
            Bound::Included((tree, level, max)),
        );
        let mut staged = entries.range(range).peekable();
        if staged.peek().is_none() {
            return keys.iter().filter(|k| !k.is_deleted()).cloned().collect();
        }
        let mut merged: BTreeMap<Pos, Key> = keys
            .iter()
            .filter(|k| !k.is_deleted())
            .map(|k| (k.pos, k.clone()))
            .collect();
        for ((_, _, pos), value) in staged {
            match value {
                Some(key) => {
                    merged.insert(*pos, key.clone());
                }
                None => {
                    merged.remove(pos);
                }
            }
        }
        merged.into_values().collect()
    }

    /// Removes and returns every staged entry in slot order.
    pub fn drain(&self) -> Vec<(TreeId, u8, Pos, Option<Key>)> {
        let entries = std::mem::take(&mut *self.entries.lock());
        entries
            .into_iter()
            .map(|((tree, level, pos), value)| (tree, level, pos, value))
            .collect()
    }

    /// Staged entries of one tree and level, in position order.
    pub fn entries_for(&self, tree: TreeId, level: u8) -> Vec<(Pos, Option<Key>)> {
        let entries = self.entries.lock();
        let range = (
            Bound::Included((tree, level, Pos::default())),
            Bound::Included((tree, level, POS_MAX)),
        );
        entries
            .range(range)
            .map(|((_, _, pos), value)| (*pos, value.clone()))
            .collect()
    }
}
