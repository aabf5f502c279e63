#![warn(missing_docs)]
//! Range Markers - Text Ranges That Survive Edits
//!
//! # Overview
//!
//! `range-markers` tracks a large, changing set of `[start, end)` ranges anchored in a mutable
//! text buffer. Carets, selections, highlighters and folding regions all hold a
//! [`RangeMarker`]; when the text is edited, the [`MarkerTree`] moves every marker without
//! rescanning the ones the edit cannot reach.
//!
//! # Core Features
//!
//! - **Augmented Red-Black Tree**: ordered by start offset, each node caches the largest end
//!   offset below it, giving `O(log n + k)` overlap queries
//! - **Lazy Offset Shifts**: an edit shifts whole subtrees through a pending `delta`, pushed down
//!   only when exact offsets are needed
//! - **Node Sharing**: markers with identical range and boundary flags share one node
//! - **Weak Marker Handles**: the tree never keeps a marker alive; released markers are purged
//!   lazily
//! - **Sweep-Line Processing**: ordered open/close events across one or many trees
//!
//! # Architecture Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  Document (Rope text + notifications)       │  ← Collaborator
//! ├─────────────────────────────────────────────┤
//! │  Document Change Adapter                    │  ← Edit Handling
//! ├─────────────────────────────────────────────┤
//! │  Queries & Sweep-Line                       │  ← Read Path
//! ├─────────────────────────────────────────────┤
//! │  Interval Tree (red-black, lazy deltas)     │  ← Storage
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust
//! use range_markers::{DocumentChange, MarkerTree, RangeMarker};
//!
//! let tree = MarkerTree::with_document_len(13);
//! let word = RangeMarker::new();
//! tree.add_interval(&word, 7, 12, false, false, 0).unwrap();
//!
//! // "Hello, world!" -> "Hello, brave world!"
//! tree.document_changed(DocumentChange::insertion(7, 6)).unwrap();
//! assert_eq!(word.range().unwrap(), 13..18);
//!
//! let hits = tree.overlapping(0, 20).unwrap();
//! assert_eq!(hits.len(), 1);
//! ```
//!
//! # Module Description
//!
//! - [`tree`] - interval tree, queries and consistency checks
//! - [`marker`] - marker handles and boundary options
//! - [`delta`] - document changes and the marker update rules
//! - [`adapter`] - applying a document change to the tree
//! - [`sweep`] - sweep-line over sorted ranges
//! - [`document`] - rope-backed document owning a marker tree
//!
//! # Concurrency
//!
//! A tree is guarded by one reader-writer lock. Edits and registrations are exclusive; queries,
//! sweeps and offset reads share the lock. Query visitors run under the read lock and must not
//! write to the same tree.

pub mod adapter;
pub mod config;
pub mod delta;
pub mod document;
pub mod error;
pub mod marker;
mod node;
pub mod sweep;
pub mod tree;

pub use adapter::ChangeSummary;
pub use config::MarkerTreeConfig;
pub use delta::DocumentChange;
pub use document::{ChangePhase, Document, DocumentCallback, DocumentEvent};
pub use error::MarkerError;
pub use marker::{MarkerId, MarkerOptions, MarkerSpan, RangeMarker};
pub use sweep::{MergeByStart, Segment, SweepEvent, SweepEventKind, sweep, sweep_streams, sweep_trees};
pub use tree::{MarkerTree, OverlapIter, RemovalCallback, RemovalEvent, RemovalReason};
