//! Applying document edits to a marker tree.
//!
//! An edit splits the tree in three groups:
//!
//! * markers ending before the edit are untouched;
//! * markers starting after the replaced region move by the length delta, which is recorded
//!   lazily on whole subtrees;
//! * everything else is detached, recomputed with the boundary rules in [`crate::delta`] and
//!   reinserted, merging with any node that now has the same key.

use tracing::{debug, trace, warn};

use crate::delta::{DocumentChange, updated_range};
use crate::error::MarkerError;
use crate::node::NodeId;
use crate::tree::{RemovalReason, TreeCore};

/// Counts reported by [`MarkerTree::document_changed`](crate::MarkerTree::document_changed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeSummary {
    /// Nodes whose range was recomputed.
    pub affected: usize,
    /// Recomputed nodes folded into an existing node with the same key.
    pub merged: usize,
    /// Markers invalidated by the edit.
    pub invalidated: usize,
    /// Nodes dropped because all their markers were released.
    pub collected: usize,
}

/// Edit window in tree coordinates.
struct Window {
    offset: i64,
    old_end: i64,
    delta: i64,
}

impl TreeCore {
    /// Reject edits reaching past the end of the document.
    pub(crate) fn check_change(&self, change: &DocumentChange) -> Result<(), MarkerError> {
        if !change.fits(self.document_len) {
            warn!(
                offset = change.offset,
                old_length = change.old_length,
                len = self.document_len,
                "rejected document change"
            );
            return Err(MarkerError::InvalidChange {
                offset: change.offset,
                old_length: change.old_length,
                document_len: self.document_len,
            });
        }
        Ok(())
    }

    pub(crate) fn apply_change(&mut self, change: &DocumentChange) -> Result<ChangeSummary, MarkerError> {
        self.check_change(change)?;
        let mut summary = ChangeSummary::default();
        if change.old_length == 0 && change.new_length == 0 {
            return Ok(summary);
        }
        self.mod_count += 1;

        let window = Window {
            offset: change.offset as i64,
            old_end: change.old_end() as i64,
            delta: change.length_delta(),
        };
        let mut affected = Vec::new();
        self.collect_affected(self.root, &window, &mut affected);
        for &id in affected.iter().rev() {
            self.detach_node(id);
        }

        for id in affected {
            for marker in self.nodes[id].take_dead_slots() {
                self.index.remove(&marker);
            }
            if self.nodes[id].markers.is_empty() {
                self.nodes.remove(id);
                summary.collected += 1;
                continue;
            }
            summary.affected += 1;

            let node = &self.nodes[id];
            let (old_start, old_end) = (node.start, node.end);
            let Some((start, end)) = updated_range(old_start, old_end, node.options, change) else {
                self.notify_node_removal(id, old_start, old_end, RemovalReason::Invalidated);
                let invalidated = self.free_node(id);
                trace!(node = id, invalidated, "markers invalidated by edit");
                summary.invalidated += invalidated;
                continue;
            };
            let node = &mut self.nodes[id];
            node.start = start;
            node.end = end;
            node.reset_links();

            let resident = self.find_or_insert(id);
            if resident != id {
                self.merge_into(id, resident);
                summary.merged += 1;
            }
        }

        self.document_len = self.document_len - change.old_length + change.new_length;
        debug!(
            offset = change.offset,
            old_length = change.old_length,
            new_length = change.new_length,
            affected = summary.affected,
            merged = summary.merged,
            invalidated = summary.invalidated,
            "document change applied"
        );
        Ok(summary)
    }

    /// Collect nodes the edit may reshape, shifting subtrees that lie wholly after it.
    ///
    /// Dead nodes met on the way are collected too, so they get dropped.
    fn collect_affected(&mut self, node: Option<NodeId>, window: &Window, out: &mut Vec<NodeId>) {
        let Some(id) = node else {
            return;
        };
        self.push_delta(id);
        let n = &self.nodes[id];
        let (left, right) = (n.left, n.right);
        let dead = !n.has_alive_marker();
        if window.offset > n.max_end {
            if dead {
                out.push(id);
            }
            return;
        }

        if window.old_end < n.start {
            // This node and its right subtree move; the left subtree keeps its offsets.
            self.nodes[id].delta += window.delta;
            if let Some(left) = left {
                self.nodes[left].delta -= window.delta;
            }
            self.push_delta(id);
            if dead {
                out.push(id);
            }
            self.collect_affected(left, window, out);
        } else {
            if dead || window.offset <= n.end {
                out.push(id);
            }
            self.collect_affected(left, window, out);
            self.collect_affected(right, window, out);
        }
        self.correct_max(id);
    }

    /// Move the markers of the detached node `from` into `into` and free `from`.
    fn merge_into(&mut self, from: NodeId, into: NodeId) {
        let node = self.nodes.remove(from);
        self.key_count += node.markers.len();
        for slot in &node.markers {
            self.index.insert(slot.id, into);
        }
        trace!(from, into, moved = node.markers.len(), "nodes merged");
        self.nodes[into].markers.extend(node.markers);
    }
}
