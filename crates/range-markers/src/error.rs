//! Error types shared by the marker tree, the change adapter and the document.

use thiserror::Error;

use crate::marker::MarkerId;

/// Errors produced by [`MarkerTree`](crate::MarkerTree), [`RangeMarker`](crate::RangeMarker)
/// and [`Document`](crate::Document).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarkerError {
    #[error("invalid range {start}..{end} (document length {document_len})")]
    /// A range was inverted or reached past the end of the document.
    InvalidRange {
        /// Requested start offset.
        start: usize,
        /// Requested end offset (exclusive).
        end: usize,
        /// Document length at the time of the call.
        document_len: usize,
    },

    #[error("invalid change at {offset} removing {old_length} chars (document length {document_len})")]
    /// An edit touched text outside the document. Nothing was applied.
    InvalidChange {
        /// Edit offset.
        offset: usize,
        /// Number of replaced characters.
        old_length: usize,
        /// Document length before the edit.
        document_len: usize,
    },

    #[error("marker {0} is no longer valid")]
    /// The marker was invalidated by an edit or disposed.
    StaleMarker(MarkerId),

    #[error("marker {marker} already belongs to another marker tree")]
    /// The marker is registered in a different tree instance.
    ForeignMarker {
        /// The offending marker.
        marker: MarkerId,
    },

    #[error("marker {0} is already attached to this tree")]
    /// The marker is already live in this tree; use `change_interval` to move it.
    AlreadyAttached(MarkerId),

    #[error("marker tree invariant violated: {0}")]
    /// An internal consistency check failed.
    InvariantBreach(String),

    #[error("marker tree lock poisoned by a panicking writer")]
    /// A writer panicked while holding the tree lock.
    LockPoisoned,
}
