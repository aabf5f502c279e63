//! Range marker tree.
//!
//! A red-black tree of [`IntervalNode`]s keyed by `(start, greedy-left, length, greedy-right)`,
//! augmented with the maximum end offset of every subtree. Offsets are shifted lazily: a node's
//! `delta` applies to the node and everything below it, and is only pushed down when a
//! structural change or an exact comparison needs the true offsets.
//!
//! The whole tree sits behind a single reader-writer lock. Edits and registrations take the
//! write lock; overlap queries, sweeps and marker offset reads take the read lock.

use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use slab::Slab;
use tracing::{debug, error, trace, warn};

use crate::adapter::ChangeSummary;
use crate::config::MarkerTreeConfig;
use crate::delta::DocumentChange;
use crate::error::MarkerError;
use crate::marker::{MarkerId, MarkerOptions, MarkerSpan, RangeMarker};
use crate::node::{Color, IntervalNode, MarkerSlot, NodeId, NodeKey};

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct TreeShared {
    id: u64,
    pub(crate) core: RwLock<TreeCore>,
    /// Markers released by their owners since the last purge.
    released: AtomicUsize,
}

impl TreeShared {
    pub(crate) fn note_released_marker(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }
}

/// Why a marker is about to leave its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// [`MarkerTree::remove_interval`] or [`RangeMarker::dispose`].
    Disposed,
    /// An edit destroyed the marker's range.
    Invalidated,
    /// [`MarkerTree::clear`].
    Cleared,
}

/// Notification delivered to [`MarkerTree::subscribe_before_removed`] callbacks.
#[derive(Debug)]
pub struct RemovalEvent<'a> {
    /// The marker, still valid.
    pub marker: &'a RangeMarker,
    /// Its range just before removal. For [`RemovalReason::Invalidated`] these are offsets
    /// from before the edit.
    pub range: Range<usize>,
    /// What removes it.
    pub reason: RemovalReason,
}

/// Removal callback type.
pub type RemovalCallback = Box<dyn FnMut(&RemovalEvent<'_>) + Send + Sync>;

/// Interval tree of [`RangeMarker`]s for one document.
///
/// Cloning yields another handle to the same tree.
#[derive(Clone)]
pub struct MarkerTree {
    shared: Arc<TreeShared>,
}

impl fmt::Debug for MarkerTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkerTree")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Default for MarkerTree {
    fn default() -> Self {
        Self::new(MarkerTreeConfig::default())
    }
}

impl MarkerTree {
    /// Create an empty tree for a document of `config.document_len` chars.
    pub fn new(config: MarkerTreeConfig) -> Self {
        Self {
            shared: Arc::new(TreeShared {
                id: NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed),
                core: RwLock::new(TreeCore::new(config)),
                released: AtomicUsize::new(0),
            }),
        }
    }

    /// Create an empty tree for a document of `document_len` chars with default settings.
    pub fn with_document_len(document_len: usize) -> Self {
        Self::new(MarkerTreeConfig::default().with_document_len(document_len))
    }

    pub(crate) fn from_shared(shared: Arc<TreeShared>) -> Self {
        Self { shared }
    }

    /// Returns `true` if both handles refer to the same tree.
    pub fn same_tree(&self, other: &MarkerTree) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, TreeCore>, MarkerError> {
        self.shared
            .core
            .read()
            .map_err(|_| MarkerError::LockPoisoned)
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, TreeCore>, MarkerError> {
        self.shared
            .core
            .write()
            .map_err(|_| MarkerError::LockPoisoned)
    }

    /// Purge released markers once more than the configured share of slots is dead.
    ///
    /// Only called once a write has passed validation, so rejected calls leave the tree as is.
    fn collect_released(&self, core: &mut TreeCore) {
        let released = self.shared.released.load(Ordering::Relaxed);
        if released > core.config.purge_threshold(core.key_count) {
            self.shared.released.store(0, Ordering::Relaxed);
            core.purge_dead_nodes();
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.shared.id
    }

    /// Check ownership of `marker` against this tree.
    ///
    /// Returns `Ok(true)` if it belongs here, `Ok(false)` if it was never registered.
    fn check_owner(&self, marker: &RangeMarker) -> Result<bool, MarkerError> {
        match marker.shared.owner.get() {
            None => Ok(false),
            Some(owner) if Weak::ptr_eq(owner, &Arc::downgrade(&self.shared)) => Ok(true),
            Some(_) => {
                error!(marker = %marker.id(), tree = self.shared.id, "marker belongs to another tree");
                Err(MarkerError::ForeignMarker {
                    marker: marker.id(),
                })
            }
        }
    }

    /// Register `marker` at `[start, end)`.
    ///
    /// The marker shares a node with any marker already registered under the same key.
    pub fn add_interval(
        &self,
        marker: &RangeMarker,
        start: usize,
        end: usize,
        greedy_left: bool,
        greedy_right: bool,
        layer: i32,
    ) -> Result<(), MarkerError> {
        self.add_interval_with(
            marker,
            start..end,
            MarkerOptions::new(greedy_left, greedy_right),
            layer,
        )
    }

    /// Register `marker` at `range` with full boundary options.
    pub fn add_interval_with(
        &self,
        marker: &RangeMarker,
        range: Range<usize>,
        options: MarkerOptions,
        layer: i32,
    ) -> Result<(), MarkerError> {
        if self.check_owner(marker)? {
            return Err(if marker.is_valid() {
                MarkerError::AlreadyAttached(marker.id())
            } else {
                MarkerError::StaleMarker(marker.id())
            });
        }
        let mut core = self.write()?;
        core.check_range(&range)?;

        let owner = marker
            .shared
            .owner
            .get_or_init(|| Arc::downgrade(&self.shared));
        if !Weak::ptr_eq(owner, &Arc::downgrade(&self.shared)) {
            error!(marker = %marker.id(), "marker registered with another tree concurrently");
            return Err(MarkerError::ForeignMarker {
                marker: marker.id(),
            });
        }

        self.collect_released(&mut core);
        marker.shared.layer.store(layer, Ordering::Relaxed);
        core.insert_marker(marker, range, options);
        core.finish_write()
    }

    /// Move a live marker to a new range and options.
    pub fn change_interval(
        &self,
        marker: &RangeMarker,
        range: Range<usize>,
        options: MarkerOptions,
    ) -> Result<(), MarkerError> {
        if !self.check_owner(marker)? || !marker.is_valid() {
            return Err(MarkerError::StaleMarker(marker.id()));
        }
        let mut core = self.write()?;
        core.check_range(&range)?;
        if !core.detach_marker(marker.id()) {
            return Err(MarkerError::StaleMarker(marker.id()));
        }
        self.collect_released(&mut core);
        core.insert_marker(marker, range, options);
        core.finish_write()
    }

    /// Remove `marker` from the tree. Returns `false` if it was not live.
    pub fn remove_interval(&self, marker: &RangeMarker) -> Result<bool, MarkerError> {
        if !self.check_owner(marker)? || !marker.is_valid() {
            return Ok(false);
        }
        let mut core = self.write()?;
        let range = match core.marker_range(marker.id()) {
            Ok(range) => range,
            Err(MarkerError::StaleMarker(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        core.notify_removal(marker, range, RemovalReason::Disposed);
        if !core.detach_marker(marker.id()) {
            return Ok(false);
        }
        marker.shared.attached.store(false, Ordering::Release);
        trace!(marker = %marker.id(), "marker removed");
        self.collect_released(&mut core);
        core.finish_write()?;
        Ok(true)
    }

    /// Register a callback run just before a live marker leaves the tree.
    ///
    /// Callbacks run in subscription order for disposal, for invalidation by an edit and for
    /// [`clear`](Self::clear). Markers released by dropping their last handle are not
    /// reported. The write lock is held while a callback runs, so it must not call back into
    /// this tree, including offset reads on the marker; use [`RemovalEvent::range`].
    pub fn subscribe_before_removed<F>(&self, callback: F) -> Result<(), MarkerError>
    where
        F: FnMut(&RemovalEvent<'_>) + Send + Sync + 'static,
    {
        self.write()?.removal_callbacks.push(Box::new(callback));
        Ok(())
    }

    /// Current range of a live marker.
    pub(crate) fn marker_range(&self, marker: &RangeMarker) -> Result<Range<usize>, MarkerError> {
        self.read()?.marker_range(marker.id())
    }

    pub(crate) fn marker_options(&self, marker: &RangeMarker) -> Result<MarkerOptions, MarkerError> {
        let core = self.read()?;
        let node = core
            .index
            .get(&marker.id())
            .ok_or(MarkerError::StaleMarker(marker.id()))?;
        Ok(core.nodes[*node].options)
    }

    /// Visit every live marker whose range intersects `[start, end]`, in tree order.
    ///
    /// Touching counts as intersecting, so empty markers at either end of the window and
    /// markers ending exactly at `start` are reported. Returns `false` if the visitor stopped
    /// the walk.
    ///
    /// The read lock is held while the visitor runs: report offsets from the span rather than
    /// calling back into the tree.
    pub fn process_overlapping_with<F>(
        &self,
        start: usize,
        end: usize,
        mut visitor: F,
    ) -> Result<bool, MarkerError>
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let core = self.read()?;
        Ok(core.process_overlapping(core.root, start as i64, end as i64, 0, &mut visitor))
    }

    /// Visit every live marker with `start <= offset < end`.
    pub fn process_containing<F>(&self, offset: usize, mut visitor: F) -> Result<bool, MarkerError>
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let core = self.read()?;
        Ok(core.process_containing(core.root, offset as i64, 0, &mut visitor))
    }

    /// Visit every live marker that sticks out of `[start, end]`, that is with a start before
    /// `start` or an end after `end`, in tree order.
    pub fn process_outside<F>(&self, start: usize, end: usize, mut visitor: F) -> Result<bool, MarkerError>
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let core = self.read()?;
        Ok(core.process_outside(core.root, start as i64, end as i64, 0, &mut visitor))
    }

    /// Visit every live marker in tree order.
    pub fn process_all<F>(&self, mut visitor: F) -> Result<bool, MarkerError>
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let core = self.read()?;
        Ok(core.process_overlapping(core.root, i64::MIN, i64::MAX, 0, &mut visitor))
    }

    /// All live markers intersecting `[start, end]`, in ascending start order.
    pub fn overlapping(&self, start: usize, end: usize) -> Result<Vec<MarkerSpan>, MarkerError> {
        let mut spans = Vec::new();
        self.process_overlapping_with(start, end, |span| {
            spans.push(span.clone());
            true
        })?;
        Ok(spans)
    }

    /// Iterator over markers intersecting `[start, end]` in ascending start order.
    ///
    /// The iterator holds the read lock until it is dropped.
    pub fn overlapping_iter(&self, start: usize, end: usize) -> Result<OverlapIter<'_>, MarkerError> {
        Ok(OverlapIter::new(self.read()?, start as i64, end as i64))
    }

    /// Push every pending delta down to the leaves, so stored offsets equal true offsets.
    pub fn normalize(&self) -> Result<(), MarkerError> {
        let mut core = self.write()?;
        self.collect_released(&mut core);
        core.normalize();
        core.finish_write()
    }

    /// Apply a document edit to every marker.
    ///
    /// Rejects edits that reach past [`document_len`](Self::document_len) without touching any
    /// marker. Markers whose range the edit destroys become invalid.
    pub fn document_changed(&self, change: DocumentChange) -> Result<ChangeSummary, MarkerError> {
        let mut core = self.write()?;
        core.check_change(&change)?;
        self.collect_released(&mut core);
        let summary = core.apply_change(&change)?;
        core.finish_write()?;
        Ok(summary)
    }

    /// Next live marker after `marker` in tree order.
    pub fn marker_after(&self, marker: &RangeMarker) -> Result<Option<RangeMarker>, MarkerError> {
        self.read()?.neighbour(marker.id(), true)
    }

    /// Previous live marker before `marker` in tree order.
    pub fn marker_before(&self, marker: &RangeMarker) -> Result<Option<RangeMarker>, MarkerError> {
        self.read()?.neighbour(marker.id(), false)
    }

    /// Number of registered marker slots, including released markers not yet purged.
    pub fn size(&self) -> Result<usize, MarkerError> {
        Ok(self.read()?.key_count)
    }

    /// Returns `true` if no markers are registered.
    pub fn is_empty(&self) -> Result<bool, MarkerError> {
        Ok(self.read()?.root.is_none())
    }

    /// Number of tree nodes.
    pub fn node_count(&self) -> Result<usize, MarkerError> {
        Ok(self.read()?.nodes.len())
    }

    /// Height of the tree.
    pub fn max_height(&self) -> Result<usize, MarkerError> {
        let core = self.read()?;
        Ok(core.height(core.root))
    }

    /// Document length the tree currently assumes.
    pub fn document_len(&self) -> Result<usize, MarkerError> {
        Ok(self.read()?.document_len)
    }

    /// Modification counter, bumped by every structural write.
    pub fn mod_count(&self) -> Result<u64, MarkerError> {
        Ok(self.read()?.mod_count)
    }

    /// Invalidate and drop every marker, telling removal subscribers first.
    pub fn clear(&self) -> Result<(), MarkerError> {
        let mut core = self.write()?;
        core.clear();
        self.shared.released.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Purge nodes whose markers were all released, regardless of the purge threshold.
    pub fn purge(&self) -> Result<usize, MarkerError> {
        let mut core = self.write()?;
        self.shared.released.store(0, Ordering::Relaxed);
        let purged = core.purge_dead_nodes();
        core.finish_write()?;
        Ok(purged)
    }

    /// Run the full consistency check.
    pub fn check_invariants(&self) -> Result<(), MarkerError> {
        self.read()?.check_invariants()
    }
}

pub(crate) struct TreeCore {
    pub(crate) nodes: Slab<IntervalNode>,
    pub(crate) root: Option<NodeId>,
    /// Live marker -> node holding it.
    pub(crate) index: HashMap<MarkerId, NodeId>,
    /// Marker slots in attached nodes, dead ones included.
    pub(crate) key_count: usize,
    pub(crate) document_len: usize,
    pub(crate) mod_count: u64,
    pub(crate) config: MarkerTreeConfig,
    removal_callbacks: Vec<RemovalCallback>,
}

impl Drop for TreeCore {
    fn drop(&mut self) {
        self.invalidate_all();
    }
}

impl TreeCore {
    fn new(config: MarkerTreeConfig) -> Self {
        Self {
            nodes: Slab::new(),
            root: None,
            index: HashMap::new(),
            key_count: 0,
            document_len: config.document_len,
            mod_count: 0,
            config,
            removal_callbacks: Vec::new(),
        }
    }

    fn check_range(&self, range: &Range<usize>) -> Result<(), MarkerError> {
        if range.start > range.end || range.end > self.document_len {
            warn!(start = range.start, end = range.end, len = self.document_len, "rejected marker range");
            return Err(MarkerError::InvalidRange {
                start: range.start,
                end: range.end,
                document_len: self.document_len,
            });
        }
        Ok(())
    }

    pub(crate) fn finish_write(&self) -> Result<(), MarkerError> {
        if !self.config.verify_invariants {
            return Ok(());
        }
        self.check_invariants().inspect_err(|err| {
            error!(%err, "marker tree corrupted");
            debug_assert!(false, "{err}");
        })
    }

    // ---- lazy deltas -------------------------------------------------------------------

    pub(crate) fn push_delta(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        let delta = node.delta;
        if delta == 0 {
            return;
        }
        node.start += delta;
        node.end += delta;
        node.max_end += delta;
        node.delta = 0;
        let (left, right) = (node.left, node.right);
        for child in [left, right].into_iter().flatten() {
            self.nodes[child].delta += delta;
        }
    }

    /// Clear every delta on the path from the root down to `id`, inclusive.
    pub(crate) fn push_delta_from_root(&mut self, id: NodeId) {
        let mut path = vec![id];
        let mut current = self.nodes[id].parent;
        while let Some(parent) = current {
            path.push(parent);
            current = self.nodes[parent].parent;
        }
        for node in path.into_iter().rev() {
            self.push_delta(node);
        }
    }

    /// Sum of deltas from `id` up to the root, including `id`'s own.
    pub(crate) fn delta_up_to_root(&self, id: NodeId) -> i64 {
        let mut delta = 0;
        let mut current = Some(id);
        while let Some(node) = current {
            delta += self.nodes[node].delta;
            current = self.nodes[node].parent;
        }
        delta
    }

    /// Subtree max end of `child`, in its parent's frame.
    fn max_end_of(&self, child: Option<NodeId>) -> Option<i64> {
        child.map(|id| {
            let node = &self.nodes[id];
            node.max_end + node.delta
        })
    }

    pub(crate) fn correct_max(&mut self, id: NodeId) {
        let (left, right) = (self.nodes[id].left, self.nodes[id].right);
        let mut max_end = self.nodes[id].end;
        for child_max in [self.max_end_of(left), self.max_end_of(right)].into_iter().flatten() {
            max_end = max_end.max(child_max);
        }
        self.nodes[id].max_end = max_end;
    }

    fn correct_max_up(&mut self, mut node: Option<NodeId>) {
        while let Some(id) = node {
            self.correct_max(id);
            node = self.nodes[id].parent;
        }
    }

    pub(crate) fn normalize(&mut self) {
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            self.push_delta(id);
            let node = &self.nodes[id];
            stack.extend(node.left);
            stack.extend(node.right);
        }
    }

    // ---- red-black structure -----------------------------------------------------------

    fn is_red(&self, node: Option<NodeId>) -> bool {
        node.is_some_and(|id| self.nodes[id].color == Color::Red)
    }

    fn set_color(&mut self, node: Option<NodeId>, color: Color) {
        if let Some(id) = node {
            self.nodes[id].color = color;
        }
    }

    fn replace_child(&mut self, parent: Option<NodeId>, old: NodeId, new: Option<NodeId>) {
        match parent {
            None => self.root = new,
            Some(p) if self.nodes[p].left == Some(old) => self.nodes[p].left = new,
            Some(p) => self.nodes[p].right = new,
        }
        if let Some(n) = new {
            self.nodes[n].parent = parent;
        }
    }

    fn rotate_left(&mut self, x: NodeId) {
        let Some(y) = self.nodes[x].right else {
            return;
        };
        self.push_delta(x);
        self.push_delta(y);

        let inner = self.nodes[y].left;
        self.nodes[x].right = inner;
        if let Some(b) = inner {
            self.nodes[b].parent = Some(x);
        }
        let parent = self.nodes[x].parent;
        self.replace_child(parent, x, Some(y));
        self.nodes[y].left = Some(x);
        self.nodes[x].parent = Some(y);

        self.correct_max(x);
        self.correct_max(y);
    }

    fn rotate_right(&mut self, x: NodeId) {
        let Some(y) = self.nodes[x].left else {
            return;
        };
        self.push_delta(x);
        self.push_delta(y);

        let inner = self.nodes[y].right;
        self.nodes[x].left = inner;
        if let Some(b) = inner {
            self.nodes[b].parent = Some(x);
        }
        let parent = self.nodes[x].parent;
        self.replace_child(parent, x, Some(y));
        self.nodes[y].right = Some(x);
        self.nodes[x].parent = Some(y);

        self.correct_max(x);
        self.correct_max(y);
    }

    /// Link a detached node (absolute offsets, no links) into the tree.
    ///
    /// Returns the resident node if one already has the same key; the new node is then left
    /// detached for the caller to merge and free.
    pub(crate) fn find_or_insert(&mut self, id: NodeId) -> NodeId {
        let key = self.nodes[id].key(0);
        let mut garbage = Vec::new();
        let Some(mut current) = self.root else {
            self.root = Some(id);
            return self.attach_new(id, garbage);
        };
        loop {
            self.push_delta(current);
            if !self.nodes[current].has_alive_marker() {
                garbage.push(current);
            }
            let resident = self.nodes[current].key(0);
            let next = match key.cmp(&resident) {
                std::cmp::Ordering::Equal => {
                    garbage.retain(|&g| g != current);
                    self.delete_nodes(garbage);
                    return current;
                }
                std::cmp::Ordering::Less => &mut self.nodes[current].left,
                std::cmp::Ordering::Greater => &mut self.nodes[current].right,
            };
            match *next {
                Some(child) => current = child,
                None => {
                    *next = Some(id);
                    break;
                }
            }
        }
        self.nodes[id].parent = Some(current);
        self.attach_new(id, garbage)
    }

    fn attach_new(&mut self, id: NodeId, garbage: Vec<NodeId>) -> NodeId {
        self.mod_count += 1;
        self.nodes[id].attached = true;
        self.key_count += self.nodes[id].markers.len();
        self.correct_max_up(Some(id));
        self.insert_fixup(id);
        trace!(node = id, "node inserted");
        self.delete_nodes(garbage);
        id
    }

    fn insert_fixup(&mut self, mut z: NodeId) {
        while let Some(parent) = self.nodes[z].parent.filter(|&p| self.is_red(Some(p))) {
            let Some(grand) = self.nodes[parent].parent else {
                break;
            };
            if self.nodes[grand].left == Some(parent) {
                let uncle = self.nodes[grand].right;
                if self.is_red(uncle) {
                    self.set_color(Some(parent), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(grand), Color::Red);
                    z = grand;
                } else {
                    let mut parent = parent;
                    if self.nodes[parent].right == Some(z) {
                        z = parent;
                        self.rotate_left(z);
                        parent = self.nodes[z].parent.unwrap_or(grand);
                    }
                    self.set_color(Some(parent), Color::Black);
                    self.set_color(Some(grand), Color::Red);
                    self.rotate_right(grand);
                }
            } else {
                let uncle = self.nodes[grand].left;
                if self.is_red(uncle) {
                    self.set_color(Some(parent), Color::Black);
                    self.set_color(uncle, Color::Black);
                    self.set_color(Some(grand), Color::Red);
                    z = grand;
                } else {
                    let mut parent = parent;
                    if self.nodes[parent].left == Some(z) {
                        z = parent;
                        self.rotate_right(z);
                        parent = self.nodes[z].parent.unwrap_or(grand);
                    }
                    self.set_color(Some(parent), Color::Black);
                    self.set_color(Some(grand), Color::Red);
                    self.rotate_left(grand);
                }
            }
        }
        self.set_color(self.root, Color::Black);
    }

    /// Unlink `z` from the tree, keeping its slab entry. Its stored offsets become absolute.
    pub(crate) fn detach_node(&mut self, z: NodeId) {
        self.mod_count += 1;
        self.push_delta_from_root(z);
        let (z_left, z_right, z_parent) = {
            let node = &self.nodes[z];
            (node.left, node.right, node.parent)
        };

        let mut removed_color = self.nodes[z].color;
        let x;
        let x_parent;
        match (z_left, z_right) {
            (None, _) => {
                x = z_right;
                x_parent = z_parent;
                self.replace_child(z_parent, z, z_right);
            }
            (_, None) => {
                x = z_left;
                x_parent = z_parent;
                self.replace_child(z_parent, z, z_left);
            }
            (Some(left), Some(right)) => {
                let y = self.minimum_pushing(right);
                removed_color = self.nodes[y].color;
                x = self.nodes[y].right;
                if self.nodes[y].parent == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.nodes[y].parent;
                    let y_parent = self.nodes[y].parent;
                    self.replace_child(y_parent, y, x);
                    self.nodes[y].right = Some(right);
                    self.nodes[right].parent = Some(y);
                }
                self.replace_child(z_parent, z, Some(y));
                self.nodes[y].left = Some(left);
                self.nodes[left].parent = Some(y);
                self.nodes[y].color = self.nodes[z].color;
            }
        }

        self.correct_max_up(x_parent);
        if removed_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.key_count -= self.nodes[z].markers.len();
        let node = &mut self.nodes[z];
        node.parent = None;
        node.left = None;
        node.right = None;
        node.attached = false;
        trace!(node = z, "node detached");
    }

    /// Leftmost node of the subtree at `id`, clearing deltas along the way.
    fn minimum_pushing(&mut self, mut id: NodeId) -> NodeId {
        self.push_delta(id);
        while let Some(left) = self.nodes[id].left {
            id = left;
            self.push_delta(id);
        }
        id
    }

    fn delete_fixup(&mut self, mut x: Option<NodeId>, mut x_parent: Option<NodeId>) {
        while x != self.root && !self.is_red(x) {
            let Some(parent) = x_parent else {
                break;
            };
            if self.nodes[parent].left == x {
                let Some(mut w) = self.nodes[parent].right else {
                    break;
                };
                if self.is_red(Some(w)) {
                    self.set_color(Some(w), Color::Black);
                    self.set_color(Some(parent), Color::Red);
                    self.rotate_left(parent);
                    let Some(sibling) = self.nodes[parent].right else {
                        break;
                    };
                    w = sibling;
                }
                let (w_left, w_right) = (self.nodes[w].left, self.nodes[w].right);
                if !self.is_red(w_left) && !self.is_red(w_right) {
                    self.set_color(Some(w), Color::Red);
                    x = Some(parent);
                    x_parent = self.nodes[parent].parent;
                } else {
                    if !self.is_red(w_right) {
                        self.set_color(w_left, Color::Black);
                        self.set_color(Some(w), Color::Red);
                        self.rotate_right(w);
                        let Some(sibling) = self.nodes[parent].right else {
                            break;
                        };
                        w = sibling;
                    }
                    self.nodes[w].color = self.nodes[parent].color;
                    self.set_color(Some(parent), Color::Black);
                    let w_right = self.nodes[w].right;
                    self.set_color(w_right, Color::Black);
                    self.rotate_left(parent);
                    x = self.root;
                    x_parent = None;
                }
            } else {
                let Some(mut w) = self.nodes[parent].left else {
                    break;
                };
                if self.is_red(Some(w)) {
                    self.set_color(Some(w), Color::Black);
                    self.set_color(Some(parent), Color::Red);
                    self.rotate_right(parent);
                    let Some(sibling) = self.nodes[parent].left else {
                        break;
                    };
                    w = sibling;
                }
                let (w_left, w_right) = (self.nodes[w].left, self.nodes[w].right);
                if !self.is_red(w_left) && !self.is_red(w_right) {
                    self.set_color(Some(w), Color::Red);
                    x = Some(parent);
                    x_parent = self.nodes[parent].parent;
                } else {
                    if !self.is_red(w_left) {
                        self.set_color(w_right, Color::Black);
                        self.set_color(Some(w), Color::Red);
                        self.rotate_left(w);
                        let Some(sibling) = self.nodes[parent].left else {
                            break;
                        };
                        w = sibling;
                    }
                    self.nodes[w].color = self.nodes[parent].color;
                    self.set_color(Some(parent), Color::Black);
                    let w_left = self.nodes[w].left;
                    self.set_color(w_left, Color::Black);
                    self.rotate_right(parent);
                    x = self.root;
                    x_parent = None;
                }
            }
        }
        self.set_color(x, Color::Black);
    }

    /// Detach and free nodes, forgetting their markers.
    fn delete_nodes(&mut self, garbage: Vec<NodeId>) {
        for id in garbage {
            if self.nodes.get(id).is_some_and(|node| node.attached) {
                self.detach_node(id);
                self.free_node(id);
            }
        }
    }

    /// Remove a detached node from the slab, invalidating whatever markers it still holds.
    pub(crate) fn free_node(&mut self, id: NodeId) -> usize {
        let node = self.nodes.remove(id);
        let mut invalidated = 0;
        for slot in &node.markers {
            if self.index.get(&slot.id) == Some(&id) {
                self.index.remove(&slot.id);
            }
            if let Some(marker) = slot.upgrade() {
                marker.shared.attached.store(false, Ordering::Release);
                invalidated += 1;
            }
        }
        invalidated
    }

    // ---- marker bookkeeping ------------------------------------------------------------

    fn insert_marker(&mut self, marker: &RangeMarker, range: Range<usize>, options: MarkerOptions) {
        let id = self.nodes.insert(IntervalNode::new(
            range.start as i64,
            range.end as i64,
            options,
            MarkerSlot::new(marker),
        ));
        let resident = self.find_or_insert(id);
        if resident != id {
            let node = self.nodes.remove(id);
            self.nodes[resident].markers.extend(node.markers);
            self.key_count += 1;
            trace!(marker = %marker.id(), node = resident, "marker merged into existing node");
        }
        self.index.insert(marker.id(), resident);
        marker.shared.attached.store(true, Ordering::Release);
    }

    /// Remove a marker's slot, dropping its node when it empties. Returns `false` if unknown.
    fn detach_marker(&mut self, marker: MarkerId) -> bool {
        let Some(id) = self.index.remove(&marker) else {
            return false;
        };
        let Some(pos) = self.nodes[id].position_of(marker) else {
            return false;
        };
        self.nodes[id].markers.remove(pos);
        self.key_count -= 1;
        if !self.nodes[id].has_alive_marker() {
            self.detach_node(id);
            self.free_node(id);
        }
        true
    }

    pub(crate) fn marker_range(&self, marker: MarkerId) -> Result<Range<usize>, MarkerError> {
        let id = *self
            .index
            .get(&marker)
            .ok_or(MarkerError::StaleMarker(marker))?;
        let node = &self.nodes[id];
        let delta = self.delta_up_to_root(id);
        let start = usize::try_from(node.start + delta);
        let end = usize::try_from(node.end + delta);
        match (start, end) {
            (Ok(start), Ok(end)) => Ok(start..end),
            _ => Err(MarkerError::InvariantBreach(format!(
                "marker {marker} resolved to negative offsets"
            ))),
        }
    }

    /// Drop every node whose markers were all released, and dead slots of the others.
    pub(crate) fn purge_dead_nodes(&mut self) -> usize {
        let mut garbage = Vec::new();
        let mut stack: Vec<NodeId> = self.root.into_iter().collect();
        while let Some(id) = stack.pop() {
            let dead = self.nodes[id].take_dead_slots();
            self.key_count -= dead.len();
            for marker in dead {
                self.index.remove(&marker);
            }
            if self.nodes[id].markers.is_empty() {
                garbage.push(id);
            }
            stack.extend(self.nodes[id].left);
            stack.extend(self.nodes[id].right);
        }
        let purged = garbage.len();
        self.delete_nodes(garbage);
        if purged > 0 {
            debug!(purged, "purged released markers");
        }
        purged
    }

    /// Run the removal callbacks for `marker`, which is still live at `range`.
    fn notify_removal(&mut self, marker: &RangeMarker, range: Range<usize>, reason: RemovalReason) {
        let event = RemovalEvent {
            marker,
            range,
            reason,
        };
        for callback in &mut self.removal_callbacks {
            callback(&event);
        }
    }

    /// Run the removal callbacks for every live marker of node `id`, located at `[start, end)`.
    pub(crate) fn notify_node_removal(&mut self, id: NodeId, start: i64, end: i64, reason: RemovalReason) {
        if self.removal_callbacks.is_empty() {
            return;
        }
        let (Ok(start), Ok(end)) = (usize::try_from(start), usize::try_from(end)) else {
            return;
        };
        let markers: Vec<RangeMarker> = self.nodes[id]
            .markers
            .iter()
            .filter_map(MarkerSlot::upgrade)
            .collect();
        for marker in &markers {
            self.notify_removal(marker, start..end, reason);
        }
    }

    /// Mark every live marker invalid without touching the structure.
    fn invalidate_all(&mut self) {
        for (_, node) in self.nodes.iter() {
            for marker in node.markers.iter().filter_map(MarkerSlot::upgrade) {
                marker.shared.attached.store(false, Ordering::Release);
            }
        }
    }

    fn clear(&mut self) {
        if !self.removal_callbacks.is_empty() {
            let mut spans = Vec::new();
            self.process_overlapping(self.root, i64::MIN, i64::MAX, 0, &mut |span: &MarkerSpan| {
                spans.push(span.clone());
                true
            });
            for span in &spans {
                self.notify_removal(&span.marker, span.range(), RemovalReason::Cleared);
            }
        }
        self.invalidate_all();
        self.nodes.clear();
        self.index.clear();
        self.root = None;
        self.key_count = 0;
        self.mod_count += 1;
        debug!("marker tree cleared");
    }

    // ---- queries -----------------------------------------------------------------------

    fn report<F>(&self, id: NodeId, start: i64, end: i64, visitor: &mut F) -> bool
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let (Ok(start), Ok(end)) = (usize::try_from(start), usize::try_from(end)) else {
            return true;
        };
        for marker in self.nodes[id].markers.iter().filter_map(MarkerSlot::upgrade) {
            let span = MarkerSpan {
                layer: marker.layer(),
                marker,
                start,
                end,
            };
            if !visitor(&span) {
                return false;
            }
        }
        true
    }

    fn process_overlapping<F>(
        &self,
        node: Option<NodeId>,
        start: i64,
        end: i64,
        delta_up_exclusive: i64,
        visitor: &mut F,
    ) -> bool
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let Some(id) = node else {
            return true;
        };
        let n = &self.nodes[id];
        let delta = delta_up_exclusive + n.delta;
        if start > n.max_end + delta {
            return true;
        }
        if !self.process_overlapping(n.left, start, end, delta, visitor) {
            return false;
        }
        let node_start = n.start + delta;
        let node_end = n.end + delta;
        if node_start.max(start) <= node_end.min(end) && !self.report(id, node_start, node_end, visitor) {
            return false;
        }
        if end < node_start {
            return true;
        }
        self.process_overlapping(n.right, start, end, delta, visitor)
    }

    fn process_containing<F>(
        &self,
        node: Option<NodeId>,
        offset: i64,
        delta_up_exclusive: i64,
        visitor: &mut F,
    ) -> bool
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let Some(id) = node else {
            return true;
        };
        let n = &self.nodes[id];
        let delta = delta_up_exclusive + n.delta;
        if offset >= n.max_end + delta {
            return true;
        }
        if !self.process_containing(n.left, offset, delta, visitor) {
            return false;
        }
        let node_start = n.start + delta;
        let node_end = n.end + delta;
        if node_start <= offset && offset < node_end && !self.report(id, node_start, node_end, visitor) {
            return false;
        }
        if offset < node_start {
            return true;
        }
        self.process_containing(n.right, offset, delta, visitor)
    }

    fn process_outside<F>(
        &self,
        node: Option<NodeId>,
        start: i64,
        end: i64,
        delta_up_exclusive: i64,
        visitor: &mut F,
    ) -> bool
    where
        F: FnMut(&MarkerSpan) -> bool,
    {
        let Some(id) = node else {
            return true;
        };
        let n = &self.nodes[id];
        let delta = delta_up_exclusive + n.delta;
        if !self.process_outside(n.left, start, end, delta, visitor) {
            return false;
        }
        let node_start = n.start + delta;
        let node_end = n.end + delta;
        if (node_start < start || node_end > end) && !self.report(id, node_start, node_end, visitor) {
            return false;
        }
        // The right subtree starts no earlier and ends by max_end: all of it lies inside.
        if node_start >= start && n.max_end + delta <= end {
            return true;
        }
        self.process_outside(n.right, start, end, delta, visitor)
    }

    fn next_node(&self, id: NodeId) -> Option<NodeId> {
        if let Some(mut right) = self.nodes[id].right {
            while let Some(left) = self.nodes[right].left {
                right = left;
            }
            return Some(right);
        }
        let mut child = id;
        let mut parent = self.nodes[id].parent;
        while let Some(p) = parent {
            if self.nodes[p].left == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.nodes[p].parent;
        }
        None
    }

    fn previous_node(&self, id: NodeId) -> Option<NodeId> {
        if let Some(mut left) = self.nodes[id].left {
            while let Some(right) = self.nodes[left].right {
                left = right;
            }
            return Some(left);
        }
        let mut child = id;
        let mut parent = self.nodes[id].parent;
        while let Some(p) = parent {
            if self.nodes[p].right == Some(child) {
                return Some(p);
            }
            child = p;
            parent = self.nodes[p].parent;
        }
        None
    }

    fn neighbour(&self, marker: MarkerId, forward: bool) -> Result<Option<RangeMarker>, MarkerError> {
        let id = *self
            .index
            .get(&marker)
            .ok_or(MarkerError::StaleMarker(marker))?;
        let slots = &self.nodes[id].markers;
        let pos = slots
            .iter()
            .position(|slot| slot.id == marker)
            .ok_or(MarkerError::StaleMarker(marker))?;
        let same_node = if forward {
            slots[pos + 1..].iter().find_map(MarkerSlot::upgrade)
        } else {
            slots[..pos].iter().rev().find_map(MarkerSlot::upgrade)
        };
        if same_node.is_some() {
            return Ok(same_node);
        }
        let mut current = id;
        loop {
            let next = if forward {
                self.next_node(current)
            } else {
                self.previous_node(current)
            };
            let Some(next) = next else {
                return Ok(None);
            };
            let found = if forward {
                self.nodes[next].any_alive_marker()
            } else {
                self.nodes[next].markers.iter().rev().find_map(MarkerSlot::upgrade)
            };
            if found.is_some() {
                return Ok(found);
            }
            current = next;
        }
    }

    fn height(&self, node: Option<NodeId>) -> usize {
        node.map_or(0, |id| {
            1 + self
                .height(self.nodes[id].left)
                .max(self.height(self.nodes[id].right))
        })
    }

    // ---- verification ------------------------------------------------------------------

    pub(crate) fn check_invariants(&self) -> Result<(), MarkerError> {
        let breach = |msg: String| Err(MarkerError::InvariantBreach(msg));
        if self.is_red(self.root) {
            return breach("root is red".into());
        }
        if let Some(root) = self.root
            && self.nodes[root].parent.is_some()
        {
            return breach("root has a parent".into());
        }

        let mut stats = CheckStats::default();
        self.check_subtree(self.root, 0, &mut stats)?;

        if stats.nodes != self.nodes.len() {
            return breach(format!(
                "{} nodes reachable, {} allocated",
                stats.nodes,
                self.nodes.len()
            ));
        }
        if stats.slots != self.key_count {
            return breach(format!(
                "{} marker slots reachable, key count {}",
                stats.slots, self.key_count
            ));
        }
        if stats.indexed != self.index.len() {
            return breach(format!(
                "{} indexed markers reachable, index holds {}",
                stats.indexed,
                self.index.len()
            ));
        }
        for pair in stats.keys.windows(2) {
            if pair[0] >= pair[1] {
                return breach(format!("keys out of order: {:?} then {:?}", pair[0], pair[1]));
            }
        }
        Ok(())
    }

    /// Returns `(black height, true max end)` of the subtree.
    fn check_subtree(
        &self,
        node: Option<NodeId>,
        delta_up_exclusive: i64,
        stats: &mut CheckStats,
    ) -> Result<(usize, i64), MarkerError> {
        let Some(id) = node else {
            return Ok((1, i64::MIN));
        };
        let n = &self.nodes[id];
        let breach = |msg: String| Err(MarkerError::InvariantBreach(format!("node {id}: {msg}")));
        if !n.attached {
            return breach("linked but not attached".into());
        }
        for child in [n.left, n.right].into_iter().flatten() {
            if self.nodes[child].parent != Some(id) {
                return breach(format!("child {child} has wrong parent"));
            }
        }
        if n.color == Color::Red && (self.is_red(n.left) || self.is_red(n.right)) {
            return breach("red node with red child".into());
        }
        if n.start > n.end {
            return breach(format!("inverted range {}..{}", n.start, n.end));
        }

        let delta = delta_up_exclusive + n.delta;
        let (left_black, left_max) = self.check_subtree(n.left, delta, stats)?;
        let key = n.key(delta_up_exclusive);
        if key.start < 0 {
            return breach(format!("negative start {}", key.start));
        }
        stats.keys.push(key);
        let (right_black, right_max) = self.check_subtree(n.right, delta, stats)?;

        if left_black != right_black {
            return breach(format!("black heights differ: {left_black} vs {right_black}"));
        }
        let true_max = left_max.max(right_max).max(n.end + delta);
        if n.max_end + delta != true_max {
            return breach(format!(
                "max end {} but subtree reaches {}",
                n.max_end + delta,
                true_max
            ));
        }

        stats.nodes += 1;
        stats.slots += n.markers.len();
        for slot in &n.markers {
            match self.index.get(&slot.id) {
                Some(&holder) if holder == id => stats.indexed += 1,
                Some(&holder) => {
                    return breach(format!("marker {} indexed at node {holder}", slot.id));
                }
                None if slot.is_alive() => {
                    return breach(format!("live marker {} missing from index", slot.id));
                }
                None => {}
            }
        }

        let black = usize::from(n.color == Color::Black);
        Ok((left_black + black, true_max))
    }
}

#[derive(Default)]
struct CheckStats {
    nodes: usize,
    slots: usize,
    indexed: usize,
    keys: Vec<NodeKey>,
}

/// Iterator over markers intersecting a window, produced by [`MarkerTree::overlapping_iter`].
///
/// Holds the tree's read lock; dropping the iterator releases it.
pub struct OverlapIter<'a> {
    core: RwLockReadGuard<'a, TreeCore>,
    start: i64,
    end: i64,
    /// Pending nodes with the cumulative delta of their ancestors.
    stack: Vec<(NodeId, i64)>,
    pending: std::collections::VecDeque<MarkerSpan>,
}

impl<'a> OverlapIter<'a> {
    fn new(core: RwLockReadGuard<'a, TreeCore>, start: i64, end: i64) -> Self {
        let root = core.root;
        let mut iter = Self {
            core,
            start,
            end,
            stack: Vec::new(),
            pending: std::collections::VecDeque::new(),
        };
        iter.descend(root, 0);
        iter
    }

    fn descend(&mut self, mut node: Option<NodeId>, mut delta_up_exclusive: i64) {
        while let Some(id) = node {
            let n = &self.core.nodes[id];
            if self.start > n.max_end + n.delta + delta_up_exclusive {
                break;
            }
            self.stack.push((id, delta_up_exclusive));
            delta_up_exclusive += n.delta;
            node = n.left;
        }
    }
}

impl Iterator for OverlapIter<'_> {
    type Item = MarkerSpan;

    fn next(&mut self) -> Option<MarkerSpan> {
        loop {
            if let Some(span) = self.pending.pop_front() {
                return Some(span);
            }
            let (id, delta_up_exclusive) = self.stack.pop()?;
            let n = &self.core.nodes[id];
            let delta = delta_up_exclusive + n.delta;
            let (start, end) = (n.start + delta, n.end + delta);
            let right = n.right;
            if start > self.end {
                // Every later node starts at or after this one.
                self.stack.clear();
                continue;
            }
            if start.max(self.start) <= end.min(self.end)
                && let (Ok(s), Ok(e)) = (usize::try_from(start), usize::try_from(end))
            {
                let spans = n.markers.iter().filter_map(MarkerSlot::upgrade).map(|marker| MarkerSpan {
                    layer: marker.layer(),
                    marker,
                    start: s,
                    end: e,
                });
                self.pending.extend(spans);
            }
            self.descend(right, delta);
        }
    }
}
