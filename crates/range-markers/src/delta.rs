//! Document change events and the range update rules applied to each marker.
//!
//! All offsets are character offsets (Unicode scalar values).

use std::ops::Range;

use crate::marker::MarkerOptions;

/// A single replacement: `old_length` chars at `offset` become `new_length` chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentChange {
    /// Start offset of the edit.
    pub offset: usize,
    /// Number of chars removed.
    pub old_length: usize,
    /// Number of chars inserted.
    pub new_length: usize,
}

impl DocumentChange {
    /// Create a replacement.
    pub fn new(offset: usize, old_length: usize, new_length: usize) -> Self {
        Self {
            offset,
            old_length,
            new_length,
        }
    }

    /// Pure insertion of `length` chars at `offset`.
    pub fn insertion(offset: usize, length: usize) -> Self {
        Self::new(offset, 0, length)
    }

    /// Pure deletion of `range`.
    pub fn deletion(range: Range<usize>) -> Self {
        Self::new(range.start, range.end.saturating_sub(range.start), 0)
    }

    /// Exclusive end of the replaced region in the pre-edit document.
    pub fn old_end(&self) -> usize {
        self.offset + self.old_length
    }

    /// Exclusive end of the inserted text in the post-edit document.
    pub fn new_end(&self) -> usize {
        self.offset + self.new_length
    }

    /// Net length change.
    pub fn length_delta(&self) -> i64 {
        self.new_length as i64 - self.old_length as i64
    }

    /// `true` when the edit fits inside a document of `document_len` chars.
    pub fn fits(&self, document_len: usize) -> bool {
        self.offset
            .checked_add(self.old_length)
            .is_some_and(|end| end <= document_len)
    }
}

/// New range of a marker at `[start, end)` after `change`, or `None` if the marker dies.
///
/// Inputs are absolute pre-edit offsets. An inverted result is clamped to the empty range at the
/// smaller offset.
pub(crate) fn updated_range(
    start: i64,
    end: i64,
    options: MarkerOptions,
    change: &DocumentChange,
) -> Option<(i64, i64)> {
    let (start, end) = if start == end {
        updated_point(start, options, change)?
    } else {
        updated_span(start, end, options, change)?
    };
    if start > end {
        Some((end, end))
    } else {
        Some((start, end))
    }
}

fn updated_span(
    start: i64,
    end: i64,
    options: MarkerOptions,
    change: &DocumentChange,
) -> Option<(i64, i64)> {
    let offset = change.offset as i64;
    let old_end = change.old_end() as i64;
    let new_length = change.new_length as i64;
    let delta = change.length_delta();

    if end < offset {
        return Some((start, end));
    }
    if end == offset && !options.greedy_right {
        return Some((start, end));
    }
    if start > old_end {
        return Some((start + delta, end + delta));
    }
    if start == old_end && !options.greedy_left {
        return Some((start + delta, end + delta));
    }

    // Whole range replaced.
    if change.old_length > 0 && offset <= start && end <= old_end {
        if options.survive_deletion {
            return Some((offset, offset));
        }
        if options.greedy_left && options.greedy_right {
            return Some((offset, offset + new_length));
        }
        return None;
    }

    // Edit inside the range: it grows or shrinks.
    if start <= offset && end >= old_end {
        return Some((start, end + delta));
    }
    // Prefix replaced.
    if start >= offset && start <= old_end && end > old_end {
        return Some((offset + new_length, end + delta));
    }
    // Suffix replaced.
    if end >= offset && end <= old_end && start < offset {
        return Some((start, offset));
    }
    None
}

/// New range of an empty marker at `point`.
///
/// Text inserted exactly at `point` leaves a plain marker where it is and pushes a
/// sticking-right marker past it. A marker greedy on either side grows to cover the inserted
/// text, so greedy-left alone is enough to expand an empty marker.
fn updated_point(
    point: i64,
    options: MarkerOptions,
    change: &DocumentChange,
) -> Option<(i64, i64)> {
    let offset = change.offset as i64;
    let old_end = change.old_end() as i64;
    let new_length = change.new_length as i64;

    if offset < point && point < old_end {
        return options.survive_deletion.then_some((offset, offset));
    }
    if point == offset && change.old_length == 0 {
        if options.sticking_right {
            return Some((point + new_length, point + new_length));
        }
        if options.greedy_left || options.greedy_right {
            return Some((point, point + new_length));
        }
        return Some((point, point));
    }
    if point > old_end || (point == old_end && change.old_length > 0) {
        let shifted = point + change.length_delta();
        return Some((shifted, shifted));
    }
    Some((point, point))
}
