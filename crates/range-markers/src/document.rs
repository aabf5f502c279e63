//! Text document that keeps its range markers up to date.
//!
//! [`Document`] stores text in a [`Rope`] and owns the [`MarkerTree`] for it. Every edit is
//! reported to subscribers twice: once before the text changes and once after the markers
//! have been updated.

use std::ops::Range;

use ropey::Rope;
use tracing::{trace, warn};

use crate::adapter::ChangeSummary;
use crate::config::MarkerTreeConfig;
use crate::delta::DocumentChange;
use crate::error::MarkerError;
use crate::marker::{MarkerOptions, RangeMarker};
use crate::tree::MarkerTree;

/// Phase of a [`DocumentEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangePhase {
    /// Text and markers still reflect the old document.
    BeforeChange,
    /// Text and markers reflect the new document.
    AfterChange,
}

/// Notification delivered to [`Document::subscribe`] callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentEvent {
    /// Before or after the edit.
    pub phase: ChangePhase,
    /// The edit.
    pub change: DocumentChange,
    /// Document length at the time of the event.
    pub document_len: usize,
    /// Modification stamp at the time of the event.
    pub modification_stamp: u64,
}

/// Document event callback type.
pub type DocumentCallback = Box<dyn FnMut(&DocumentEvent) + Send>;

/// A text buffer with a marker tree.
///
/// Offsets are char offsets.
///
/// # Example
///
/// ```rust
/// use range_markers::{Document, MarkerOptions};
///
/// let mut doc = Document::new("Hello, world!");
/// let word = doc.create_range_marker(7..12, MarkerOptions::default(), 0).unwrap();
///
/// doc.insert(0, ">> ").unwrap();
/// assert_eq!(word.range().unwrap(), 10..15);
/// assert_eq!(doc.slice(10..15).unwrap(), "world");
/// ```
pub struct Document {
    text: Rope,
    modification_stamp: u64,
    markers: MarkerTree,
    callbacks: Vec<DocumentCallback>,
}

impl Document {
    /// Create a document with default tree settings.
    pub fn new(text: &str) -> Self {
        Self::with_config(text, MarkerTreeConfig::default())
    }

    /// Create a document whose tree uses `config`. The configured document length is replaced
    /// by the length of `text`.
    pub fn with_config(text: &str, config: MarkerTreeConfig) -> Self {
        let text = Rope::from_str(text);
        let config = config.with_document_len(text.len_chars());
        Self {
            text,
            modification_stamp: 0,
            markers: MarkerTree::new(config),
            callbacks: Vec::new(),
        }
    }

    /// Full text.
    pub fn text(&self) -> String {
        self.text.to_string()
    }

    /// Text of `range`.
    pub fn slice(&self, range: Range<usize>) -> Result<String, MarkerError> {
        self.check_range(&range)?;
        Ok(self.text.slice(range).to_string())
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.text.len_chars()
    }

    /// Returns `true` for an empty document.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lines (an empty document has one).
    pub fn line_count(&self) -> usize {
        self.text.len_lines()
    }

    /// Counter bumped by every edit.
    pub fn modification_stamp(&self) -> u64 {
        self.modification_stamp
    }

    /// Marker tree of this document.
    pub fn markers(&self) -> &MarkerTree {
        &self.markers
    }

    /// Register a new marker at `range`.
    pub fn create_range_marker(
        &self,
        range: Range<usize>,
        options: MarkerOptions,
        layer: i32,
    ) -> Result<RangeMarker, MarkerError> {
        let marker = RangeMarker::new();
        self.markers.add_interval_with(&marker, range, options, layer)?;
        Ok(marker)
    }

    /// Subscribe to edit notifications.
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: FnMut(&DocumentEvent) + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
    }

    /// Insert `text` at `offset`.
    pub fn insert(&mut self, offset: usize, text: &str) -> Result<ChangeSummary, MarkerError> {
        self.replace(offset..offset, text)
    }

    /// Delete `range`.
    pub fn delete(&mut self, range: Range<usize>) -> Result<ChangeSummary, MarkerError> {
        self.replace(range, "")
    }

    /// Replace `range` with `text`.
    ///
    /// Nothing changes when the range is invalid. Otherwise the before-change notification is
    /// sent, the markers and text are updated, and the after-change notification follows.
    pub fn replace(&mut self, range: Range<usize>, text: &str) -> Result<ChangeSummary, MarkerError> {
        self.check_range(&range)?;
        let change = DocumentChange::new(range.start, range.end - range.start, text.chars().count());
        if change.old_length == 0 && change.new_length == 0 {
            return Ok(ChangeSummary::default());
        }

        self.notify(ChangePhase::BeforeChange, change);
        let summary = self.markers.document_changed(change)?;
        self.text.remove(range.clone());
        self.text.insert(range.start, text);
        self.modification_stamp += 1;
        trace!(
            offset = change.offset,
            old_length = change.old_length,
            new_length = change.new_length,
            stamp = self.modification_stamp,
            "document edited"
        );
        self.notify(ChangePhase::AfterChange, change);
        Ok(summary)
    }

    fn check_range(&self, range: &Range<usize>) -> Result<(), MarkerError> {
        if range.start > range.end || range.end > self.len() {
            warn!(start = range.start, end = range.end, len = self.len(), "rejected document range");
            return Err(MarkerError::InvalidRange {
                start: range.start,
                end: range.end,
                document_len: self.len(),
            });
        }
        Ok(())
    }

    fn notify(&mut self, phase: ChangePhase, change: DocumentChange) {
        let event = DocumentEvent {
            phase,
            change,
            document_len: self.len(),
            modification_stamp: self.modification_stamp,
        };
        for callback in &mut self.callbacks {
            callback(&event);
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("len", &self.len())
            .field("modification_stamp", &self.modification_stamp)
            .field("subscribers", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn test_edits_keep_text_and_markers_in_step() {
        let mut doc = Document::new("Hello, world!");
        let hello = doc
            .create_range_marker(0..5, MarkerOptions::default(), 0)
            .unwrap();
        doc.replace(0..5, "Howdy").unwrap();
        assert_eq!(doc.text(), "Howdy, world!");
        // Non-greedy markers die when their whole range is replaced.
        assert!(!hello.is_valid());

        let world = doc
            .create_range_marker(7..12, MarkerOptions::default(), 0)
            .unwrap();
        doc.delete(5..7).unwrap();
        assert_eq!(doc.text(), "Howdyworld!");
        assert_eq!(world.range(), Ok(5..10));
        assert_eq!(doc.slice(5..10).unwrap(), "world");
        assert_eq!(doc.markers().document_len(), Ok(doc.len()));
    }

    #[test]
    fn test_two_phase_notifications() {
        let mut doc = Document::new("abc");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        doc.subscribe(move |event| sink.lock().unwrap().push(*event));

        doc.insert(1, "xyz").unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, ChangePhase::BeforeChange);
        assert_eq!(events[0].document_len, 3);
        assert_eq!(events[0].modification_stamp, 0);
        assert_eq!(events[1].phase, ChangePhase::AfterChange);
        assert_eq!(events[1].document_len, 6);
        assert_eq!(events[1].modification_stamp, 1);
        assert_eq!(events[1].change, DocumentChange::insertion(1, 3));
    }

    #[test]
    fn test_invalid_edit_changes_nothing() {
        let mut doc = Document::new("abc");
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        doc.subscribe(move |_| *counter.lock().unwrap() += 1);

        assert_eq!(
            doc.delete(2..5),
            Err(MarkerError::InvalidRange {
                start: 2,
                end: 5,
                document_len: 3
            })
        );
        assert_eq!(doc.text(), "abc");
        assert_eq!(doc.modification_stamp(), 0);
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_offsets_are_chars() {
        let mut doc = Document::new("héllo wörld");
        let word = doc
            .create_range_marker(6..11, MarkerOptions::default(), 0)
            .unwrap();
        doc.insert(0, "¡").unwrap();
        assert_eq!(word.range(), Ok(7..12));
        assert_eq!(doc.slice(7..12).unwrap(), "wörld");
    }
}
