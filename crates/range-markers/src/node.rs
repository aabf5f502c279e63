//! Interval tree nodes.
//!
//! Offsets stored in a node are *local*: the true offset of a node is its stored value plus the
//! sum of `delta` over the node and all of its ancestors. `max_end` is kept in the same frame as
//! `start`/`end` (it excludes the node's own `delta`).

use std::cmp::Ordering;
use std::sync::Weak;

use smallvec::SmallVec;

use crate::marker::{MarkerId, MarkerOptions, MarkerShared, RangeMarker};

/// Slab key of a node.
pub(crate) type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Color {
    Red,
    Black,
}

/// Weak reference from a node to one of its markers.
pub(crate) struct MarkerSlot {
    pub(crate) id: MarkerId,
    pub(crate) handle: Weak<MarkerShared>,
}

impl MarkerSlot {
    pub(crate) fn new(marker: &RangeMarker) -> Self {
        Self {
            id: marker.id(),
            handle: marker.downgrade(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<RangeMarker> {
        self.handle.upgrade().map(RangeMarker::from_shared)
    }
}

pub(crate) struct IntervalNode {
    pub(crate) start: i64,
    pub(crate) end: i64,
    pub(crate) delta: i64,
    pub(crate) max_end: i64,
    pub(crate) options: MarkerOptions,
    /// Co-located markers, in registration order.
    pub(crate) markers: SmallVec<[MarkerSlot; 1]>,
    pub(crate) parent: Option<NodeId>,
    pub(crate) left: Option<NodeId>,
    pub(crate) right: Option<NodeId>,
    pub(crate) color: Color,
    /// `true` while linked into the tree.
    pub(crate) attached: bool,
}

impl IntervalNode {
    pub(crate) fn new(start: i64, end: i64, options: MarkerOptions, slot: MarkerSlot) -> Self {
        let mut markers = SmallVec::new();
        markers.push(slot);
        Self {
            start,
            end,
            delta: 0,
            max_end: end,
            options,
            markers,
            parent: None,
            left: None,
            right: None,
            color: Color::Red,
            attached: false,
        }
    }

    /// Reset links and lazy state before (re)insertion. `start`/`end` must already be absolute.
    pub(crate) fn reset_links(&mut self) {
        self.delta = 0;
        self.max_end = self.end;
        self.parent = None;
        self.left = None;
        self.right = None;
        self.color = Color::Red;
        self.attached = false;
    }

    pub(crate) fn has_alive_marker(&self) -> bool {
        self.markers.iter().any(MarkerSlot::is_alive)
    }

    /// First live marker, if any.
    pub(crate) fn any_alive_marker(&self) -> Option<RangeMarker> {
        self.markers.iter().find_map(MarkerSlot::upgrade)
    }

    /// Drop slots whose marker was released, returning their ids.
    pub(crate) fn take_dead_slots(&mut self) -> Vec<MarkerId> {
        let mut dead = Vec::new();
        self.markers.retain(|slot| {
            if slot.is_alive() {
                true
            } else {
                dead.push(slot.id);
                false
            }
        });
        dead
    }

    pub(crate) fn position_of(&self, id: MarkerId) -> Option<usize> {
        self.markers.iter().position(|slot| slot.id == id)
    }

    /// Sort key at the given cumulative ancestor delta.
    pub(crate) fn key(&self, delta_up_exclusive: i64) -> NodeKey {
        let shift = delta_up_exclusive + self.delta;
        NodeKey {
            start: self.start + shift,
            length: self.end - self.start,
            options: self.options,
        }
    }
}

/// Ordering key of a node: start ascending, greedy-left first, length ascending,
/// greedy-right first, then sticking-right and survive-deletion first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeKey {
    pub(crate) start: i64,
    pub(crate) length: i64,
    pub(crate) options: MarkerOptions,
}

impl Ord for NodeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| other.options.greedy_left.cmp(&self.options.greedy_left))
            .then_with(|| self.length.cmp(&other.length))
            .then_with(|| other.options.greedy_right.cmp(&self.options.greedy_right))
            .then_with(|| other.options.sticking_right.cmp(&self.options.sticking_right))
            .then_with(|| {
                other
                    .options
                    .survive_deletion
                    .cmp(&self.options.survive_deletion)
            })
    }
}

impl PartialOrd for NodeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(start: i64, end: i64, greedy_left: bool, greedy_right: bool) -> NodeKey {
        NodeKey {
            start,
            length: end - start,
            options: MarkerOptions::new(greedy_left, greedy_right),
        }
    }

    #[test]
    fn test_key_orders_by_start_first() {
        assert!(key(1, 100, true, true) < key(2, 3, false, false));
    }

    #[test]
    fn test_key_greedy_left_precedes() {
        assert!(key(5, 10, true, false) < key(5, 6, false, false));
    }

    #[test]
    fn test_key_shorter_precedes() {
        assert!(key(5, 6, false, false) < key(5, 10, false, false));
    }

    #[test]
    fn test_key_greedy_right_precedes() {
        assert!(key(5, 10, false, true) < key(5, 10, false, false));
        assert_eq!(
            key(5, 10, false, true).cmp(&key(5, 10, false, true)),
            Ordering::Equal
        );
    }

    #[test]
    fn test_key_policies_break_remaining_ties() {
        let plain = key(5, 5, false, false);
        let sticky = NodeKey {
            options: MarkerOptions::new(false, false).with_sticking_right(true),
            ..plain
        };
        let surviving = NodeKey {
            options: MarkerOptions::new(false, false).with_survive_deletion(true),
            ..plain
        };
        assert!(sticky < plain);
        assert!(surviving < plain);
        assert!(sticky < surviving);
    }

    #[test]
    fn test_dead_slots_are_taken() {
        let kept = RangeMarker::new();
        let dropped = RangeMarker::new();
        let dropped_id = dropped.id();
        let mut node = IntervalNode::new(0, 3, MarkerOptions::default(), MarkerSlot::new(&kept));
        node.markers.push(MarkerSlot::new(&dropped));
        drop(dropped);

        assert_eq!(node.take_dead_slots(), vec![dropped_id]);
        assert_eq!(node.markers.len(), 1);
        assert!(node.has_alive_marker());
        assert_eq!(node.any_alive_marker(), Some(kept));
    }
}
