//! Restartable post-order walk over one tree.
//!
//! Children are yielded before their parent, so the `(max_key, level)` of
//! yielded nodes strictly increases. That is the order the GC position is
//! published in, and the order a walk can be resumed from after the tree
//! changed underneath it.

use super::pending::PendingUpdateLog;
use super::{Key, NodeHandle, TreeStore};
use crate::types::{GcError, Pos, Result, TreeId};

/// A node produced by the walk.
#[derive(Debug, Clone)]
pub struct WalkedNode {
    /// The node.
    pub node: NodeHandle,
    /// Sequence stamp when the node was yielded.
    pub seq: u64,
    /// Node level.
    pub level: u8,
    /// Lower bound.
    pub min_key: Pos,
    /// Upper bound.
    pub max_key: Pos,
    /// Keys with staged updates applied.
    pub keys: Vec<Key>,
    /// Parent node; `None` for the root.
    pub parent: Option<NodeHandle>,
}

impl WalkedNode {
    /// Whether this is the tree's root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// One step of the walk.
#[derive(Debug)]
pub enum WalkStep {
    /// A readable node.
    Node(WalkedNode),
    /// A child pointer whose node could not be read.
    Unreadable {
        /// Level of the node holding `ptr`.
        level: u8,
        /// Pointer to the unreadable child.
        ptr: Key,
        /// Read error.
        error: GcError,
    },
}

struct Frame {
    node: NodeHandle,
    level: u8,
    children: Vec<Key>,
    next: usize,
}

/// Lazy post-order iterator over the nodes of a tree.
pub struct TreeWalker<'a> {
    store: &'a dyn TreeStore,
    pending: &'a PendingUpdateLog,
    tree: TreeId,
    depth: u8,
    resume: Option<(Pos, u8)>,
    stack: Vec<Frame>,
    started: bool,
}

impl<'a> TreeWalker<'a> {
    /// Walks every level of `tree`.
    pub fn new(store: &'a dyn TreeStore, pending: &'a PendingUpdateLog, tree: TreeId) -> Self {
        Self {
            store,
            pending,
            tree,
            depth: 0,
            resume: None,
            stack: Vec::new(),
            started: false,
        }
    }

    /// Stops descending below `depth`.
    pub fn depth(mut self, depth: u8) -> Self {
        self.depth = depth;
        self
    }

    /// Tree being walked.
    pub fn tree(&self) -> TreeId {
        self.tree
    }

    /// Restarts the walk from the root, skipping every node at or before
    /// `(pos, level)` in walk order.
    pub fn restart_after(&mut self, pos: Pos, level: u8) {
        self.stack.clear();
        self.started = false;
        self.resume = Some((pos, level));
    }

    fn skipped(&self, max_key: Pos, level: u8) -> bool {
        self.resume
            .map(|resume| (max_key, level) <= resume)
            .unwrap_or(false)
    }

    fn frame(&self, node: NodeHandle) -> Frame {
        let (level, children) = {
            let guard = node.read();
            let children = if guard.level > self.depth {
                self.pending.overlay(
                    self.tree,
                    guard.level,
                    guard.min_key,
                    guard.max_key,
                    &guard.keys,
                )
            } else {
                Vec::new()
            };
            (guard.level, children)
        };
        Frame {
            node,
            level,
            children,
            next: 0,
        }
    }

    fn yield_node(&self, frame: Frame) -> WalkedNode {
        let guard = frame.node.read();
        let keys = self.pending.overlay(
            self.tree,
            guard.level,
            guard.min_key,
            guard.max_key,
            &guard.keys,
        );
        let walked = WalkedNode {
            node: frame.node.clone(),
            seq: frame.node.seq(),
            level: guard.level,
            min_key: guard.min_key,
            max_key: guard.max_key,
            keys,
            parent: self.stack.last().map(|parent| parent.node.clone()),
        };
        drop(guard);
        walked
    }

    /// Next node in post-order, or `None` when the walk is complete.
    pub fn next_step(&mut self) -> Result<Option<WalkStep>> {
        if !self.started {
            self.started = true;
            let Some(root) = self.store.root(self.tree) else {
                return Ok(None);
            };
            if root.read().level < self.depth {
                return Ok(None);
            }
            let frame = self.frame(root);
            self.stack.push(frame);
        }

        loop {
            let Some(top) = self.stack.last_mut() else {
                return Ok(None);
            };
            if top.level > self.depth && top.next < top.children.len() {
                let ptr = top.children[top.next].clone();
                top.next += 1;
                let child_level = top.level - 1;
                if self.skipped(ptr.pos, child_level) {
                    continue;
                }
                match self.store.get_child(self.tree, child_level, &ptr) {
                    Ok(child) => {
                        let frame = self.frame(child);
                        self.stack.push(frame);
                    }
                    Err(error @ GcError::Unreadable { .. }) => {
                        return Ok(Some(WalkStep::Unreadable {
                            level: child_level + 1,
                            ptr,
                            error,
                        }));
                    }
                    Err(err) => return Err(err),
                }
                continue;
            }

            let Some(frame) = self.stack.pop() else {
                return Ok(None);
            };
            let max_key = frame.node.read().max_key;
            if self.skipped(max_key, frame.level) {
                continue;
            }
            return Ok(Some(WalkStep::Node(self.yield_node(frame))));
        }
    }
}
