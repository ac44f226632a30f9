//! Replica combinations known to the filesystem.

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::types::{DataType, DeviceId};

/// One replica combination: which devices hold copies of a given kind of data.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicaEntry {
    /// Kind of data replicated.
    pub data_type: DataType,
    /// Copies required for the data to be readable.
    pub nr_required: u8,
    /// Devices holding a copy, sorted and deduplicated.
    pub devs: SmallVec<[DeviceId; 4]>,
}

impl ReplicaEntry {
    /// Builds a normalized entry from an arbitrary device list.
    pub fn new(data_type: DataType, devs: impl IntoIterator<Item = DeviceId>) -> Self {
        let mut devs: SmallVec<[DeviceId; 4]> = devs.into_iter().collect();
        devs.sort_unstable();
        devs.dedup();
        Self {
            data_type,
            nr_required: 1,
            devs,
        }
    }
}

impl fmt::Display for ReplicaEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{} [", self.data_type, self.nr_required, self.devs.len())?;
        for (i, dev) in self.devs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{dev}")?;
        }
        f.write_str("]")
    }
}

/// Set of replica combinations recorded in the superblock.
#[derive(Debug, Default)]
pub struct ReplicaRegistry {
    entries: RwLock<BTreeSet<ReplicaEntry>>,
}

impl ReplicaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `entry` is already recorded.
    pub fn contains(&self, entry: &ReplicaEntry) -> bool {
        self.entries.read().contains(entry)
    }

    /// Records `entry`. Returns `true` if it was missing.
    pub fn register(&self, entry: ReplicaEntry) -> bool {
        self.entries.write().insert(entry)
    }

    /// Snapshot of every recorded entry in order.
    pub fn entries(&self) -> Vec<ReplicaEntry> {
        self.entries.read().iter().cloned().collect()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
