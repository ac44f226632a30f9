//! Keys, nodes and the tree subsystem interface the collector consumes.
//!
//! Node encoding and the commit engine live behind [`TreeStore`]; the
//! collector only needs ordered iteration, node fetch and replacement,
//! atomic parent-index updates and single-key commits.

pub mod format;
pub mod mem;
pub mod pending;
pub mod walker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use smallvec::SmallVec;

use crate::types::{DataType, DeviceId, Gen, NodeId, Pos, Result, StripeIdx, TreeId};

pub use format::{FormatState, KeyFormat};

/// Reference from a data pointer to one block of a stripe.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct StripeRef {
    /// Stripe index.
    pub idx: StripeIdx,
    /// Block within the stripe.
    pub block: u8,
}

/// Pointer to data in a bucket.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExtentPtr {
    /// Device holding the bucket.
    pub dev: DeviceId,
    /// Bucket number on the device.
    pub bucket: u64,
    /// Bucket generation when the pointer was written.
    pub gen: Gen,
    /// Cached copies may be dropped at any time; dirty ones may not.
    pub cached: bool,
    /// Stripe the pointed-to data belongs to.
    pub stripe: Option<StripeRef>,
}

impl ExtentPtr {
    /// Dirty pointer without a stripe.
    pub fn dirty(dev: DeviceId, bucket: u64, gen: Gen) -> Self {
        Self {
            dev,
            bucket,
            gen,
            cached: false,
            stripe: None,
        }
    }

    /// Cached pointer without a stripe.
    pub fn cached(dev: DeviceId, bucket: u64, gen: Gen) -> Self {
        Self {
            cached: true,
            ..Self::dirty(dev, bucket, gen)
        }
    }

    /// Attaches a stripe reference.
    pub fn in_stripe(mut self, idx: StripeIdx, block: u8) -> Self {
        self.stripe = Some(StripeRef { idx, block });
        self
    }
}

/// Pointer list of a key; two replicas fit inline.
pub type Ptrs = SmallVec<[ExtentPtr; 2]>;

/// Typed value of a key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyValue {
    /// Whiteout.
    Deleted,
    /// File data.
    Extent {
        /// Replicas of the data.
        ptrs: Ptrs,
    },
    /// Pointer to a child node; the key position is the child's upper bound.
    BtreePtr {
        /// Child's lower bound.
        min_key: Pos,
        /// Child node.
        child: NodeId,
        /// Where the child is stored.
        ptrs: Ptrs,
        /// Bounds were rewritten by repair and override the child's header.
        range_updated: bool,
    },
    /// Erasure-coded stripe; the key offset is the stripe index.
    Stripe {
        /// Redundancy algorithm.
        algorithm: u8,
        /// Total blocks.
        nr_blocks: u8,
        /// Parity blocks, stored last.
        nr_redundant: u8,
        /// Sectors per block.
        sectors: u32,
        /// One pointer per block.
        ptrs: Ptrs,
    },
    /// Space reservation without data.
    Reservation {
        /// Replicas reserved.
        nr_replicas: u8,
    },
    /// Inode record.
    Inode,
    /// Value the collector does not interpret.
    Opaque {
        /// Payload size in u64 words.
        u64s: u16,
    },
}

/// A key: a position, an extent size, a version and a value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    /// End position; extents cover `[pos - size, pos)`.
    pub pos: Pos,
    /// Sectors covered.
    pub size: u32,
    /// Version number, bounded by the filesystem's key version counter.
    pub version: u64,
    /// Value.
    pub value: KeyValue,
}

impl Key {
    /// Builds a key with version zero.
    pub fn new(pos: Pos, size: u32, value: KeyValue) -> Self {
        Self {
            pos,
            size,
            version: 0,
            value,
        }
    }

    /// Extent key.
    pub fn extent(pos: Pos, size: u32, ptrs: impl IntoIterator<Item = ExtentPtr>) -> Self {
        Self::new(
            pos,
            size,
            KeyValue::Extent {
                ptrs: ptrs.into_iter().collect(),
            },
        )
    }

    /// Tree pointer key for a child spanning `[min_key, max_key]`.
    pub fn btree_ptr(min_key: Pos, max_key: Pos, child: NodeId, ptrs: Ptrs) -> Self {
        Self::new(
            max_key,
            0,
            KeyValue::BtreePtr {
                min_key,
                child,
                ptrs,
                range_updated: false,
            },
        )
    }

    /// Whiteout at `pos`.
    pub fn deleted(pos: Pos) -> Self {
        Self::new(pos, 0, KeyValue::Deleted)
    }

    /// Sets the version.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Whether this is a whiteout.
    pub fn is_deleted(&self) -> bool {
        matches!(self.value, KeyValue::Deleted)
    }

    /// Start of the covered range.
    pub fn start(&self) -> Pos {
        self.pos.back(u64::from(self.size))
    }

    /// Bucket pointers carried by the key.
    pub fn ptrs(&self) -> &[ExtentPtr] {
        match &self.value {
            KeyValue::Extent { ptrs }
            | KeyValue::BtreePtr { ptrs, .. }
            | KeyValue::Stripe { ptrs, .. } => ptrs,
            _ => &[],
        }
    }

    /// Mutable pointer list, if the value carries one.
    pub fn ptrs_mut(&mut self) -> Option<&mut Ptrs> {
        match &mut self.value {
            KeyValue::Extent { ptrs }
            | KeyValue::BtreePtr { ptrs, .. }
            | KeyValue::Stripe { ptrs, .. } => Some(ptrs),
            _ => None,
        }
    }

    /// Child node of a tree pointer.
    pub fn child(&self) -> Option<NodeId> {
        match self.value {
            KeyValue::BtreePtr { child, .. } => Some(child),
            _ => None,
        }
    }

    /// Lower bound recorded in a tree pointer.
    pub fn child_min(&self) -> Option<Pos> {
        match self.value {
            KeyValue::BtreePtr { min_key, .. } => Some(min_key),
            _ => None,
        }
    }

    /// What the bucket behind the `idx`th pointer holds.
    pub fn ptr_data_type(&self, idx: usize) -> DataType {
        match &self.value {
            KeyValue::BtreePtr { .. } => DataType::Btree,
            KeyValue::Stripe {
                nr_blocks,
                nr_redundant,
                ..
            } if idx >= usize::from(nr_blocks.saturating_sub(*nr_redundant)) => DataType::Parity,
            KeyValue::Stripe { .. } => DataType::User,
            _ if self.ptrs().get(idx).map(|p| p.cached).unwrap_or(false) => DataType::Cached,
            _ => DataType::User,
        }
    }

    /// Value size in u64 words.
    pub fn value_u64s(&self) -> usize {
        let ptr_u64s: usize = self
            .ptrs()
            .iter()
            .map(|p| 1 + usize::from(p.stripe.is_some()))
            .sum();
        match &self.value {
            KeyValue::Deleted => 0,
            KeyValue::Extent { .. } => ptr_u64s,
            KeyValue::BtreePtr { .. } => 3 + ptr_u64s,
            KeyValue::Stripe { .. } => 2 + ptr_u64s,
            KeyValue::Reservation { .. } => 1,
            KeyValue::Inode => 4,
            KeyValue::Opaque { u64s } => usize::from(*u64s),
        }
    }

    /// Drops cached pointers whose bucket has moved on, as reported by `stale`.
    pub fn normalize(&mut self, mut stale: impl FnMut(&ExtentPtr) -> bool) {
        if let KeyValue::Extent { ptrs } = &mut self.value {
            ptrs.retain(|p| !(p.cached && stale(p)));
        }
    }
}

/// In-memory tree node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Node identity.
    pub id: NodeId,
    /// Tree the node belongs to.
    pub tree: TreeId,
    /// Zero for leaves.
    pub level: u8,
    /// Inclusive lower bound.
    pub min_key: Pos,
    /// Inclusive upper bound.
    pub max_key: Pos,
    /// Keys in position order.
    pub keys: Vec<Key>,
    /// Packing format of the keys.
    pub format: KeyFormat,
    /// Key pointing at this node.
    pub ptr: Key,
}

impl Node {
    /// Payload of live keys in this node's own format.
    pub fn live_u64s(&self) -> usize {
        self.u64s_in(&self.format)
    }

    /// Payload of live keys if repacked with `format`.
    pub fn u64s_in(&self, format: &KeyFormat) -> usize {
        self.keys
            .iter()
            .filter(|k| !k.is_deleted())
            .map(|k| format.key_u64s(k))
            .sum()
    }
}

/// Shared, lockable node.
///
/// Every write bumps a sequence stamp. Holders that drop the lock keep the
/// stamp and later [`NodeCell::relock`] only succeeds if nothing changed.
#[derive(Debug)]
pub struct NodeCell {
    id: NodeId,
    seq: AtomicU64,
    freed: AtomicBool,
    node: RwLock<Node>,
}

/// Reference-counted node handle.
pub type NodeHandle = Arc<NodeCell>;

impl NodeCell {
    /// Wraps a node.
    pub fn new(node: Node) -> NodeHandle {
        Arc::new(Self {
            id: node.id,
            seq: AtomicU64::new(0),
            freed: AtomicBool::new(false),
            node: RwLock::new(node),
        })
    }

    /// Node identity.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current sequence stamp.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Shared access.
    pub fn read(&self) -> RwLockReadGuard<'_, Node> {
        self.node.read()
    }

    /// Clone of the node.
    pub fn snapshot(&self) -> Node {
        self.node.read().clone()
    }

    /// Exclusive access; bumps the sequence stamp.
    pub fn modify<R>(&self, f: impl FnOnce(&mut Node) -> R) -> R {
        let mut node = self.node.write();
        let out = f(&mut node);
        self.seq.fetch_add(1, Ordering::AcqRel);
        out
    }

    /// Re-acquires shared access if the node is unchanged since `seq`.
    pub fn relock(&self, seq: u64) -> Option<RwLockReadGuard<'_, Node>> {
        let guard = self.node.read();
        if self.is_freed() || self.seq() != seq {
            return None;
        }
        Some(guard)
    }

    /// Whether the node was freed.
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_freed(&self) {
        let _node = self.node.write();
        self.freed.store(true, Ordering::Release);
        self.seq.fetch_add(1, Ordering::AcqRel);
    }
}

/// Parameters of a node about to be allocated.
#[derive(Clone, Debug)]
pub struct NewNode {
    /// Tree.
    pub tree: TreeId,
    /// Level.
    pub level: u8,
    /// Lower bound.
    pub min_key: Pos,
    /// Upper bound.
    pub max_key: Pos,
    /// Keys in position order.
    pub keys: Vec<Key>,
    /// Packing format.
    pub format: KeyFormat,
    /// Where the node will be written.
    pub ptrs: Ptrs,
}

/// Tree subsystem seen by the collector.
pub trait TreeStore: Send + Sync {
    /// Root of `tree`, if the tree exists.
    fn root(&self, tree: TreeId) -> Option<NodeHandle>;

    /// Reads the child behind `ptr`, a key of a node at `level + 1`.
    ///
    /// Fails with [`crate::GcError::Unreadable`] when the node cannot be read.
    /// Bounds from a pointer flagged `range_updated` override the child's own.
    fn get_child(&self, tree: TreeId, level: u8, ptr: &Key) -> Result<NodeHandle>;

    /// The node if it is already resident in memory, without reading it.
    fn resident_node(&self, id: NodeId) -> Option<NodeHandle>;

    /// Re-registers a resident node under a new pointer key.
    fn rehash_node(&self, node: &NodeHandle, ptr: Key) -> Result<()>;

    /// Allocates a node that is not yet reachable.
    fn alloc_node(&self, new: NewNode) -> Result<NodeHandle>;

    /// Writes a node out.
    fn write_node(&self, node: &NodeHandle) -> Result<()>;

    /// Atomically deletes `deletes` and inserts `inserts` in `parent`.
    fn index_update(
        &self,
        tree: TreeId,
        parent: &NodeHandle,
        deletes: &[Pos],
        inserts: Vec<Key>,
    ) -> Result<()>;

    /// Releases a node that is no longer reachable.
    fn free_node(&self, node: &NodeHandle) -> Result<()>;

    /// Replaces the leaf key `expected` by `new` as one transaction.
    ///
    /// Fails with [`crate::GcError::TransientConflict`] if the stored key no
    /// longer equals `expected`.
    fn commit_key(&self, tree: TreeId, expected: &Key, new: Key) -> Result<()>;

    /// Current leaf key at `pos`.
    fn lookup_key(&self, tree: TreeId, pos: Pos) -> Option<Key>;
}
