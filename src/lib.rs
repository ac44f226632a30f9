//! Garbage collection and compaction for a copy-on-write B-tree block filesystem.
//!
//! A full pass rebuilds bucket, stripe and usage accounting from every
//! reference in every tree and reconciles it into live state, repairing
//! broken references along the way. A lightweight generation-only pass keeps
//! bucket generations from wrapping, and a coalescer merges sparse sibling
//! nodes.

#![warn(missing_docs)]

pub mod alloc;
pub mod bucket;
pub mod config;
pub mod fs;
pub mod gc;
pub mod metrics;
pub mod primitives;
pub mod tree;
pub mod types;

pub use alloc::{Allocator, MemAllocator, OpenBucket, ReserveClass};
pub use bucket::{Bucket, BucketMark, DeviceLayout};
pub use config::GcOptions;
pub use fs::{Filesystem, FsOptions, InteriorUpdate, View};
pub use gc::{GcStats, Issue, IssueKind, IssueLog, Severity};
pub use metrics::{CounterGcMetrics, GcMetrics, NoopGcMetrics, PassKind};
pub use tree::mem::{MemTreeStore, TreeBuilder};
pub use tree::{ExtentPtr, Key, KeyValue, TreeStore};
pub use types::{DeviceId, GcError, GcPhase, GcPos, Pos, Result, StripeIdx, TreeId};
