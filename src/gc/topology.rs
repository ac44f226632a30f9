//! Boundary continuity of interior nodes.

use tracing::debug;

use crate::fs::Filesystem;
use crate::gc::report::IssueKind;
use crate::tree::{Key, KeyValue};
use crate::types::{Pos, Result, TreeId};

impl Filesystem {
    /// Checks that the child pointers of an interior node at `level`
    /// spanning `[min, max]` partition it exactly, staging corrected pointers
    /// for every gap, overlap or wrong upper bound.
    ///
    /// Returns the number of pointers repaired.
    pub(crate) fn check_topology(
        &self,
        tree: TreeId,
        level: u8,
        min: Pos,
        max: Pos,
        keys: &[Key],
    ) -> Result<usize> {
        let mut repaired = 0;
        let mut prev: Option<&Key> = None;
        for (i, cur) in keys.iter().enumerate() {
            let expected_start = prev.map(|k| k.pos.successor()).unwrap_or(min);
            let is_last = i + 1 == keys.len();

            let update_min = match cur.child_min() {
                Some(child_min) if child_min != expected_start => {
                    let after = prev
                        .map(|k| format!("prev ends at {}", k.pos))
                        .unwrap_or_else(|| format!("start of node: {min}"));
                    self.issues.repairable(
                        IssueKind::Topology,
                        format!(
                            "node with incorrect min_key in {tree} level {level}: {after}, \
                             cur starts at {child_min}"
                        ),
                    );
                    true
                }
                _ => false,
            };
            let update_max = is_last && cur.pos != max;
            if update_max {
                self.issues.repairable(
                    IssueKind::Topology,
                    format!(
                        "node with incorrect max_key in {tree} level {level}: {} expected {max}",
                        cur.pos
                    ),
                );
            }
            prev = Some(cur);
            if !update_min && !update_max {
                continue;
            }

            if update_max {
                self.pending.stage_delete(tree, level, cur.pos)?;
            }
            let mut fixed = cur.clone();
            if update_max {
                fixed.pos = max;
            }
            if let KeyValue::BtreePtr {
                min_key,
                range_updated,
                ..
            } = &mut fixed.value
            {
                if update_min {
                    *min_key = expected_start;
                }
                *range_updated = true;
            }
            self.pending.stage_insert(tree, level, fixed.clone())?;

            if let Some(child) = fixed.child().and_then(|id| self.trees.resident_node(id)) {
                self.trees.rehash_node(&child, fixed.clone())?;
            }
            debug!(
                tree = %tree,
                level,
                old_pos = %cur.pos,
                new_pos = %fixed.pos,
                update_min,
                update_max,
                "gc.topology.repair"
            );
            repaired += 1;
        }
        Ok(repaired)
    }
}
