//! Collector options, loadable from TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{GcError, Result};

/// Tunables for garbage collection, coalescing and the background loop.
///
/// Every field has a default, so a TOML document only needs the keys it overrides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcOptions {
    /// Restarts allowed after a generation conflict before a full pass gives up.
    pub max_restarts: u32,
    /// Generation-only pass rewrites keys whose pointers trail their bucket by more than this.
    pub gens_stale_threshold: u8,
    /// Retries of a single conflicting commit during the generation-only pass.
    pub gens_max_commit_retries: u32,
    /// Non-initial full passes rewrite nodes whose max pointer staleness exceeds this.
    pub rewrite_stale_threshold: u8,
    /// Width of the coalescing sliding window.
    pub coalesce_window: usize,
    /// Node capacity in u64 words.
    pub node_u64s: usize,
    /// Occupancy target numerator.
    pub occupancy_num: usize,
    /// Occupancy target denominator.
    pub occupancy_den: usize,
    /// Sectors accounted for each tree-node pointer.
    pub btree_node_sectors: u32,
    /// Whether the background loop wakes periodically on I/O volume.
    pub periodic: bool,
    /// The background loop wakes every `capacity / periodic_divisor` sectors written.
    pub periodic_divisor: u64,
    /// Granularity of the background loop's timed wait.
    pub poll_interval_ms: u64,
    /// Walk leaf level of every tree, not only trees whose leaves carry references.
    pub expensive_checks: bool,
    /// Register replica combinations without reporting them as missing.
    pub rebuild_replicas: bool,
    /// Allocation info existed on disk; initial passes report reconciliation mismatches.
    pub alloc_info_present: bool,
    /// Maximum staged entries held by the pending-update log.
    pub pending_capacity: usize,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            max_restarts: 2,
            gens_stale_threshold: 16,
            gens_max_commit_retries: 8,
            rewrite_stale_threshold: 16,
            coalesce_window: 4,
            node_u64s: 256,
            occupancy_num: 2,
            occupancy_den: 3,
            btree_node_sectors: 256,
            periodic: true,
            periodic_divisor: 16,
            poll_interval_ms: 100,
            expensive_checks: false,
            rebuild_replicas: false,
            alloc_info_present: true,
            pending_capacity: 65_536,
        }
    }
}

impl GcOptions {
    /// Parses options from a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let opts: GcOptions =
            toml::from_str(contents).map_err(|err| GcError::Config(err.to_string()))?;
        opts.validate()
    }

    /// Reads options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Serializes options back to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| GcError::Config(err.to_string()))
    }

    pub(crate) fn validate(self) -> Result<Self> {
        if self.coalesce_window < 2 {
            return Err(GcError::Config("coalesce_window must be at least 2".into()));
        }
        if self.occupancy_den == 0
            || self.occupancy_num == 0
            || self.occupancy_num > self.occupancy_den
        {
            return Err(GcError::Config(
                "occupancy target must be a fraction in (0, 1]".into(),
            ));
        }
        if self.periodic_divisor == 0 {
            return Err(GcError::Config("periodic_divisor must be non-zero".into()));
        }
        if self.node_u64s == 0 {
            return Err(GcError::Config("node_u64s must be non-zero".into()));
        }
        Ok(self)
    }

    /// Payload a coalesced node is packed to, in u64 words.
    pub fn occupancy_target_u64s(&self) -> usize {
        self.node_u64s * self.occupancy_num / self.occupancy_den
    }

    /// Timed-wait granularity of the background loop.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
