//! Range marker handles.
//!
//! A [`RangeMarker`] is the positional primitive handed to carets, selections, highlighters and
//! folding: a `[start, end)` char range that keeps up with document edits. The handle itself is
//! cheap to clone and does **not** own tree storage. The tree holds markers weakly, so dropping
//! the last clone of a marker releases it; the tree notices on its next write.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::error;

use crate::error::MarkerError;
use crate::tree::{MarkerTree, TreeShared};

static NEXT_MARKER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique marker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MarkerId(u64);

impl MarkerId {
    fn next() -> Self {
        Self(NEXT_MARKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MarkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Boundary behaviour of a marker.
///
/// All flags are part of the tree key: two markers only share a tree node when their ranges
/// and all four flags are identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MarkerOptions {
    /// Text inserted exactly at the start offset is absorbed into the range.
    pub greedy_left: bool,
    /// Text inserted exactly at the end offset is absorbed into the range.
    pub greedy_right: bool,
    /// A zero-length marker moves past text inserted exactly at its offset.
    pub sticking_right: bool,
    /// Deleting the whole range collapses the marker to the edit point instead of
    /// invalidating it.
    pub survive_deletion: bool,
}

impl MarkerOptions {
    /// Options with the given greediness and no other policies.
    pub const fn new(greedy_left: bool, greedy_right: bool) -> Self {
        Self {
            greedy_left,
            greedy_right,
            sticking_right: false,
            survive_deletion: false,
        }
    }

    /// Greedy on both sides.
    pub const fn greedy() -> Self {
        Self::new(true, true)
    }

    /// Set the sticking-right policy.
    pub const fn with_sticking_right(mut self, sticking_right: bool) -> Self {
        self.sticking_right = sticking_right;
        self
    }

    /// Set the survive-deletion policy.
    pub const fn with_survive_deletion(mut self, survive_deletion: bool) -> Self {
        self.survive_deletion = survive_deletion;
        self
    }
}

pub(crate) struct MarkerShared {
    pub(crate) id: MarkerId,
    /// Set once, on first registration. A marker never moves between trees.
    pub(crate) owner: OnceLock<Weak<TreeShared>>,
    /// Mirrors node validity; only written under the owner's write lock.
    pub(crate) attached: AtomicBool,
    pub(crate) layer: AtomicI32,
}

impl Drop for MarkerShared {
    fn drop(&mut self) {
        if !*self.attached.get_mut() {
            return;
        }
        if let Some(tree) = self.owner.get().and_then(Weak::upgrade) {
            tree.note_released_marker();
        }
    }
}

/// A `[start, end)` range anchored in a document.
///
/// Equality and hashing use marker identity, never offsets.
#[derive(Clone)]
pub struct RangeMarker {
    pub(crate) shared: Arc<MarkerShared>,
}

impl RangeMarker {
    /// Create a detached marker. Register it with [`MarkerTree::add_interval`].
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MarkerShared {
                id: MarkerId::next(),
                owner: OnceLock::new(),
                attached: AtomicBool::new(false),
                layer: AtomicI32::new(0),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<MarkerShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<MarkerShared> {
        Arc::downgrade(&self.shared)
    }

    /// Marker identity.
    pub fn id(&self) -> MarkerId {
        self.shared.id
    }

    /// Layer given when the marker was registered (0 before registration).
    pub fn layer(&self) -> i32 {
        self.shared.layer.load(Ordering::Relaxed)
    }

    /// `false` once the marker was invalidated by an edit, disposed, cleared, or its tree was
    /// dropped.
    pub fn is_valid(&self) -> bool {
        self.shared.attached.load(Ordering::Acquire)
    }

    /// The tree this marker was registered with, if it is still alive.
    pub fn tree(&self) -> Option<MarkerTree> {
        self.shared
            .owner
            .get()
            .and_then(Weak::upgrade)
            .map(MarkerTree::from_shared)
    }

    fn owner(&self) -> Result<MarkerTree, MarkerError> {
        self.tree().ok_or(MarkerError::StaleMarker(self.id()))
    }

    /// Current start offset.
    pub fn start_offset(&self) -> Result<usize, MarkerError> {
        self.range().map(|r| r.start)
    }

    /// Current end offset (exclusive).
    pub fn end_offset(&self) -> Result<usize, MarkerError> {
        self.range().map(|r| r.end)
    }

    /// Current range. Fails with [`MarkerError::StaleMarker`] once the marker is invalid.
    pub fn range(&self) -> Result<Range<usize>, MarkerError> {
        if !self.is_valid() {
            return Err(MarkerError::StaleMarker(self.id()));
        }
        self.owner()?.marker_range(self)
    }

    /// Boundary options of the node currently holding this marker.
    pub fn options(&self) -> Result<MarkerOptions, MarkerError> {
        if !self.is_valid() {
            return Err(MarkerError::StaleMarker(self.id()));
        }
        self.owner()?.marker_options(self)
    }

    /// Remove the marker from its tree. Returns `true` if it was live.
    ///
    /// Failures are logged and reported as `false`; use [`MarkerTree::remove_interval`] to
    /// get the error itself.
    pub fn dispose(&self) -> bool {
        let Some(tree) = self.tree() else {
            return false;
        };
        tree.remove_interval(self)
            .inspect_err(|err| error!(marker = %self.id(), %err, "failed to dispose marker"))
            .unwrap_or(false)
    }
}

impl Default for RangeMarker {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RangeMarker {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for RangeMarker {}

impl Hash for RangeMarker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for RangeMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeMarker")
            .field("id", &self.id())
            .field("valid", &self.is_valid())
            .field("layer", &self.layer())
            .finish()
    }
}

/// A marker reported by a query, together with its offsets at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerSpan {
    /// The marker.
    pub marker: RangeMarker,
    /// Start offset at query time.
    pub start: usize,
    /// End offset at query time (exclusive).
    pub end: usize,
    /// Marker layer.
    pub layer: i32,
}

impl MarkerSpan {
    /// Range as `start..end`.
    pub fn range(&self) -> Range<usize> {
        self.start..self.end
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    /// Returns `true` for a zero-length span.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_identity() {
        let a = RangeMarker::new();
        let b = RangeMarker::new();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_detached_marker_is_stale() {
        let marker = RangeMarker::new();
        assert!(!marker.is_valid());
        assert!(marker.tree().is_none());
        assert_eq!(
            marker.start_offset(),
            Err(MarkerError::StaleMarker(marker.id()))
        );
        assert!(!marker.dispose());
    }

    #[test]
    fn test_dispose_on_poisoned_tree() {
        let tree = MarkerTree::with_document_len(10);
        let marker = RangeMarker::new();
        tree.add_interval(&marker, 1, 3, false, false, 0).unwrap();

        let writer = tree.clone();
        let _ = std::thread::spawn(move || {
            let _guard = writer.write().unwrap();
            panic!("writer died holding the lock");
        })
        .join();

        assert!(!marker.dispose());
        assert_eq!(tree.remove_interval(&marker), Err(MarkerError::LockPoisoned));
        assert!(marker.is_valid());
    }

    #[test]
    fn test_options_builders() {
        let options = MarkerOptions::new(true, false)
            .with_sticking_right(true)
            .with_survive_deletion(true);
        assert!(options.greedy_left);
        assert!(!options.greedy_right);
        assert!(options.sticking_right);
        assert!(options.survive_deletion);
        assert_eq!(MarkerOptions::greedy(), MarkerOptions::new(true, true));
    }
}
