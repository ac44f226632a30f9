#![forbid(unsafe_code)]

//! Identifiers, positions and generation arithmetic shared by every GC component.

mod error;

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use error::{GcError, Result};

/// Index of a member device.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Identity of a tree node as known to the tree subsystem.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct NodeId(pub u64);

/// Index of an erasure-coded stripe.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
pub struct StripeIdx(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for StripeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bucket generation. Eight bits wide and compared with wrapping arithmetic.
pub type Gen = u8;

/// Signed distance from `r` to `l` under wrapping generation arithmetic.
///
/// Positive when `l` is newer than `r`.
#[inline]
pub fn gen_cmp(l: Gen, r: Gen) -> i8 {
    l.wrapping_sub(r) as i8
}

/// How many generations `l` is ahead of `r`, or zero when it is not ahead.
#[inline]
pub fn gen_after(l: Gen, r: Gen) -> u8 {
    gen_cmp(l, r).max(0) as u8
}

/// Position in a tree's key space.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
pub struct Pos {
    /// High half of the position.
    pub inode: u64,
    /// Low half of the position.
    pub offset: u64,
}

/// Smallest representable position.
pub const POS_MIN: Pos = Pos::new(0, 0);
/// Largest representable position.
pub const POS_MAX: Pos = Pos::new(u64::MAX, u64::MAX);

impl Pos {
    /// Builds a position from its two halves.
    pub const fn new(inode: u64, offset: u64) -> Self {
        Self { inode, offset }
    }

    /// The position immediately after `self`. Saturates at [`POS_MAX`].
    pub fn successor(self) -> Pos {
        match self.offset.checked_add(1) {
            Some(offset) => Pos::new(self.inode, offset),
            None => match self.inode.checked_add(1) {
                Some(inode) => Pos::new(inode, 0),
                None => POS_MAX,
            },
        }
    }

    /// Moves the position back by `sectors` within the same inode.
    pub fn back(self, sectors: u64) -> Pos {
        Pos::new(self.inode, self.offset.saturating_sub(sectors))
    }
}

impl fmt::Debug for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == POS_MAX {
            return f.write_str("POS_MAX");
        }
        write!(f, "{}:{}", self.inode, self.offset)
    }
}

/// What a bucket's sectors hold.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Nothing accounted.
    #[default]
    None,
    /// Superblock copy.
    Sb,
    /// Journal bucket.
    Journal,
    /// Tree node.
    Btree,
    /// Dirty user data.
    User,
    /// Cached copy of user data.
    Cached,
    /// Erasure-coding parity.
    Parity,
}

impl DataType {
    /// Number of data types, used to size per-type counters.
    pub const COUNT: usize = 7;

    /// Every data type in declaration order.
    pub const ALL: [DataType; Self::COUNT] = [
        DataType::None,
        DataType::Sb,
        DataType::Journal,
        DataType::Btree,
        DataType::User,
        DataType::Cached,
        DataType::Parity,
    ];

    /// Dense index into per-type counter arrays.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Human readable name used in reports.
    pub fn name(self) -> &'static str {
        match self {
            DataType::None => "none",
            DataType::Sb => "sb",
            DataType::Journal => "journal",
            DataType::Btree => "btree",
            DataType::User => "user",
            DataType::Cached => "cached",
            DataType::Parity => "parity",
        }
    }

    /// Metadata owned by the filesystem itself, excluded from reclaim accounting.
    pub fn is_metadata(self) -> bool {
        matches!(self, DataType::Sb | DataType::Journal)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies one of the filesystem's trees.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeId {
    /// File extents.
    Extents,
    /// Inodes.
    Inodes,
    /// Directory entries.
    Dirents,
    /// Extended attributes.
    Xattrs,
    /// Persisted allocation information.
    Alloc,
    /// Quotas.
    Quotas,
    /// Erasure-coded stripes.
    Stripes,
    /// Shared (reflinked) extents.
    Reflink,
}

impl TreeId {
    /// Every tree in id order.
    pub const ALL: [TreeId; 8] = [
        TreeId::Extents,
        TreeId::Inodes,
        TreeId::Dirents,
        TreeId::Xattrs,
        TreeId::Alloc,
        TreeId::Quotas,
        TreeId::Stripes,
        TreeId::Reflink,
    ];

    /// Phase in which GC visits this tree.
    ///
    /// Trees whose entries reference allocations come before trees that record them.
    pub fn gc_phase(self) -> GcPhase {
        GcPhase::Tree(self)
    }

    /// Whether leaf keys of this tree carry references that GC must account.
    pub fn leaf_needs_gc(self) -> bool {
        matches!(
            self,
            TreeId::Extents | TreeId::Inodes | TreeId::Stripes | TreeId::Reflink
        )
    }

    /// Whether leaf keys hold bucket pointers subject to generation tracking.
    pub fn has_pointers(self) -> bool {
        matches!(self, TreeId::Extents | TreeId::Stripes | TreeId::Reflink)
    }

    /// Short name used in log events and reports.
    pub fn name(self) -> &'static str {
        match self {
            TreeId::Extents => "extents",
            TreeId::Inodes => "inodes",
            TreeId::Dirents => "dirents",
            TreeId::Xattrs => "xattrs",
            TreeId::Alloc => "alloc",
            TreeId::Quotas => "quotas",
            TreeId::Stripes => "stripes",
            TreeId::Reflink => "reflink",
        }
    }

    fn phase_rank(self) -> u8 {
        match self {
            TreeId::Stripes => 0,
            TreeId::Extents => 1,
            TreeId::Inodes => 2,
            TreeId::Dirents => 3,
            TreeId::Xattrs => 4,
            TreeId::Alloc => 5,
            TreeId::Quotas => 6,
            TreeId::Reflink => 7,
        }
    }

    /// Trees sorted into GC visiting order.
    pub fn in_gc_order() -> [TreeId; 8] {
        let mut ids = Self::ALL;
        ids.sort_by_key(|id| id.phase_rank());
        ids
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Coarse stage of a GC pass. Declaration order is visiting order.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum GcPhase {
    /// No pass in progress.
    NotRunning,
    /// Shadow state allocated.
    Start,
    /// Superblock and journal marking.
    Superblock,
    /// Walking one tree.
    Tree(TreeId),
    /// Nodes awaiting free after an index update.
    PendingDelete,
    /// Allocator free lists and open buckets.
    Alloc,
}

impl GcPhase {
    fn rank(self) -> u8 {
        match self {
            GcPhase::NotRunning => 0,
            GcPhase::Start => 1,
            GcPhase::Superblock => 2,
            GcPhase::Tree(id) => 3 + id.phase_rank(),
            GcPhase::PendingDelete => 11,
            GcPhase::Alloc => 12,
        }
    }

    pub(crate) fn to_raw(self) -> u8 {
        self.rank()
    }

    pub(crate) fn from_raw(raw: u8) -> GcPhase {
        match raw {
            0 => GcPhase::NotRunning,
            1 => GcPhase::Start,
            2 => GcPhase::Superblock,
            11 => GcPhase::PendingDelete,
            12 => GcPhase::Alloc,
            n => TreeId::ALL
                .into_iter()
                .find(|id| 3 + id.phase_rank() == n)
                .map(GcPhase::Tree)
                .unwrap_or(GcPhase::NotRunning),
        }
    }
}

impl Ord for GcPhase {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for GcPhase {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Deepest tree level GC ever reports; the root marker sits at this level.
pub const MAX_DEPTH: u8 = 4;

/// Where a GC pass currently is. Totally ordered across all phases and trees.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct GcPos {
    /// Coarse phase; for tree phases it also identifies the tree.
    pub phase: GcPhase,
    /// Key position inside the phase.
    pub pos: Pos,
    /// Tree level, lower levels first at equal positions.
    pub level: u8,
}

impl GcPos {
    /// Start of a phase.
    pub const fn phase(phase: GcPhase) -> Self {
        Self {
            phase,
            pos: POS_MIN,
            level: 0,
        }
    }

    /// Position before any node of `tree`.
    pub fn tree_start(tree: TreeId) -> Self {
        Self::phase(tree.gc_phase())
    }

    /// Position of a node whose upper bound is `max_key`.
    pub fn node(tree: TreeId, max_key: Pos, level: u8) -> Self {
        Self {
            phase: tree.gc_phase(),
            pos: max_key,
            level,
        }
    }

    /// Position of the root pointer; after every node of the tree.
    pub fn tree_root(tree: TreeId) -> Self {
        Self {
            phase: tree.gc_phase(),
            pos: POS_MAX,
            level: MAX_DEPTH,
        }
    }

    /// Position of allocator marking; `slot` is `None` for the free lists.
    pub fn alloc(slot: Option<usize>) -> Self {
        let offset = slot.map(|idx| idx as u64 + 1).unwrap_or(0);
        Self {
            phase: GcPhase::Alloc,
            pos: Pos::new(0, offset),
            level: 0,
        }
    }

    /// Tree this position lies in, if any.
    pub fn tree(&self) -> Option<TreeId> {
        match self.phase {
            GcPhase::Tree(id) => Some(id),
            _ => None,
        }
    }
}

impl Ord for GcPos {
    fn cmp(&self, other: &Self) -> Ordering {
        self.phase
            .cmp(&other.phase)
            .then(self.pos.cmp(&other.pos))
            .then(self.level.cmp(&other.level))
    }
}

impl PartialOrd for GcPos {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
