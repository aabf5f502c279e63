use std::collections::BTreeSet;
use std::ops::Range;

use proptest::prelude::*;
use range_markers::{
    DocumentChange, MarkerId, MarkerOptions, MarkerTree, MarkerTreeConfig, RangeMarker,
    SweepEventKind, sweep,
};

const DOC_LEN: usize = 200;

/// Marker position kept by hand, next to the tree.
#[derive(Debug, Clone)]
struct Expected {
    range: Option<Range<usize>>,
    options: MarkerOptions,
}

impl Expected {
    fn apply(&mut self, change: &DocumentChange) {
        let Some(range) = self.range.clone() else {
            return;
        };
        self.range = if range.is_empty() {
            expected_point(range.start, self.options, change)
        } else {
            expected_span(range, self.options, change)
        }
        .map(|r| if r.start > r.end { r.end..r.end } else { r });
    }
}

fn expected_span(range: Range<usize>, options: MarkerOptions, change: &DocumentChange) -> Option<Range<usize>> {
    let (s, e) = (range.start as i64, range.end as i64);
    let offset = change.offset as i64;
    let old_end = change.old_end() as i64;
    let new_len = change.new_length as i64;
    let delta = new_len - change.old_length as i64;
    let shifted = || Some(((s + delta) as usize)..((e + delta) as usize));

    if e < offset || (e == offset && !options.greedy_right) {
        return Some(range);
    }
    if s > old_end || (s == old_end && !options.greedy_left) {
        return shifted();
    }
    if change.old_length > 0 && offset <= s && e <= old_end {
        return if options.survive_deletion {
            Some(change.offset..change.offset)
        } else if options.greedy_left && options.greedy_right {
            Some(change.offset..change.new_end())
        } else {
            None
        };
    }
    if s <= offset && e >= old_end {
        return Some(range.start..((e + delta) as usize));
    }
    if s >= offset && e > old_end {
        return Some(change.new_end()..((e + delta) as usize));
    }
    Some(range.start..change.offset)
}

fn expected_point(p: usize, options: MarkerOptions, change: &DocumentChange) -> Option<Range<usize>> {
    if change.offset < p && p < change.old_end() {
        return options
            .survive_deletion
            .then_some(change.offset..change.offset);
    }
    if p == change.offset && change.old_length == 0 {
        return Some(if options.sticking_right {
            p + change.new_length..p + change.new_length
        } else if options.greedy_left || options.greedy_right {
            p..p + change.new_length
        } else {
            p..p
        });
    }
    if p > change.old_end() || (p == change.old_end() && change.old_length > 0) {
        let q = p + change.new_length - change.old_length;
        return Some(q..q);
    }
    Some(p..p)
}

fn arbitrary_options() -> impl Strategy<Value = MarkerOptions> {
    (any::<bool>(), any::<bool>(), prop::bool::weighted(0.2), prop::bool::weighted(0.2)).prop_map(
        |(greedy_left, greedy_right, sticking_right, survive_deletion)| {
            MarkerOptions::new(greedy_left, greedy_right)
                .with_sticking_right(sticking_right)
                .with_survive_deletion(survive_deletion)
        },
    )
}

fn arbitrary_marker() -> impl Strategy<Value = (Range<usize>, MarkerOptions)> {
    (0..DOC_LEN, 0..12usize, arbitrary_options())
        .prop_map(|(start, len, options)| (start..(start + len).min(DOC_LEN), options))
}

#[derive(Debug, Clone)]
enum Op {
    /// Edit with offset and removed length taken modulo the current document.
    Edit { offset: usize, old: usize, new: usize },
    /// Drop the handle of a tracked marker.
    Release(usize),
    /// Register another marker.
    Add(Range<usize>, MarkerOptions),
}

fn arbitrary_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (any::<usize>(), 0..16usize, 0..16usize)
            .prop_map(|(offset, old, new)| Op::Edit { offset, old, new }),
        1 => any::<usize>().prop_map(Op::Release),
        2 => arbitrary_marker().prop_map(|(range, options)| Op::Add(range, options)),
    ]
}

fn edit(doc_len: usize, offset: usize, old: usize, new: usize) -> DocumentChange {
    let offset = offset % (doc_len + 1);
    DocumentChange::new(offset, old.min(doc_len - offset), new)
}

fn overlapping_ids(tree: &MarkerTree, window: Range<usize>) -> BTreeSet<MarkerId> {
    tree.overlapping(window.start, window.end)
        .unwrap()
        .into_iter()
        .map(|span| span.marker.id())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Every marker follows its boundary rules through a random edit script, and the tree's
    /// lazily shifted offsets match offsets tracked by hand.
    #[test]
    fn prop_edits_match_model(
        initial in prop::collection::vec(arbitrary_marker(), 1..60),
        ops in prop::collection::vec(arbitrary_op(), 1..40),
    ) {
        let tree = MarkerTree::new(
            MarkerTreeConfig::default()
                .with_document_len(DOC_LEN)
                .with_verify_invariants(true),
        );
        let mut doc_len = DOC_LEN;
        let mut tracked: Vec<(RangeMarker, Expected)> = Vec::new();
        let register = |tree: &MarkerTree, range: Range<usize>, options: MarkerOptions| {
            let marker = RangeMarker::new();
            tree.add_interval_with(&marker, range.clone(), options, 0).unwrap();
            (marker, Expected { range: Some(range), options })
        };
        for (range, options) in initial {
            tracked.push(register(&tree, range, options));
        }

        for op in ops {
            match op {
                Op::Edit { offset, old, new } => {
                    let change = edit(doc_len, offset, old, new);
                    tree.document_changed(change).unwrap();
                    doc_len = doc_len - change.old_length + change.new_length;
                    for (_, expected) in &mut tracked {
                        expected.apply(&change);
                    }
                }
                Op::Release(index) if !tracked.is_empty() => {
                    tracked.swap_remove(index % tracked.len());
                }
                Op::Release(_) => {}
                Op::Add(range, options) => {
                    let start = range.start.min(doc_len);
                    let end = range.end.min(doc_len);
                    tracked.push(register(&tree, start..end, options));
                }
            }

            for (marker, expected) in &tracked {
                match &expected.range {
                    Some(range) => prop_assert_eq!(marker.range(), Ok(range.clone())),
                    None => prop_assert!(!marker.is_valid()),
                }
            }
        }

        tree.normalize().unwrap();
        tree.check_invariants().unwrap();
        prop_assert_eq!(tree.document_len(), Ok(doc_len));
        for (marker, expected) in &tracked {
            prop_assert_eq!(marker.range().ok(), expected.range.clone());
        }
    }

    /// Overlap queries report exactly the markers a linear scan finds.
    #[test]
    fn prop_overlap_matches_linear_scan(
        markers in prop::collection::vec(arbitrary_marker(), 0..120),
        edits in prop::collection::vec((any::<usize>(), 0..16usize, 0..16usize), 0..10),
        windows in prop::collection::vec((0..DOC_LEN + 40, 0..40usize), 1..20),
    ) {
        let tree = MarkerTree::new(MarkerTreeConfig::default().with_document_len(DOC_LEN));
        let handles: Vec<_> = markers
            .iter()
            .map(|(range, options)| {
                let marker = RangeMarker::new();
                tree.add_interval_with(&marker, range.clone(), *options, 0).unwrap();
                marker
            })
            .collect();
        let mut doc_len = DOC_LEN;
        for (offset, old, new) in edits {
            let change = edit(doc_len, offset, old, new);
            tree.document_changed(change).unwrap();
            doc_len = doc_len - change.old_length + change.new_length;
        }

        for (start, len) in windows {
            let window = start..start + len;
            let naive: BTreeSet<_> = handles
                .iter()
                .filter_map(|m| m.range().ok().map(|r| (m.id(), r)))
                .filter(|(_, r)| r.start.max(window.start) <= r.end.min(window.end))
                .map(|(id, _)| id)
                .collect();
            prop_assert_eq!(overlapping_ids(&tree, window.clone()), naive.clone());
            let iterated: BTreeSet<_> = tree
                .overlapping_iter(window.start, window.end)
                .unwrap()
                .map(|span| span.marker.id())
                .collect();
            prop_assert_eq!(iterated, naive);
        }
    }

    /// Sweep events never go backwards and every range opens before it closes.
    #[test]
    fn prop_sweep_ordering(mut ranges in prop::collection::vec((0..100usize, 0..20usize), 0..80)) {
        ranges.sort();
        let ranges: Vec<Range<usize>> = ranges.into_iter().map(|(s, l)| s..s + l).collect();

        let mut last = 0;
        let mut opened = vec![false; ranges.len()];
        let mut closed = vec![false; ranges.len()];
        let mut ok = true;
        sweep(ranges.iter().enumerate().map(|(i, r)| Tagged(i, r.clone())), |event| {
            let Tagged(index, range) = event.item;
            ok &= event.offset >= last;
            last = event.offset;
            match event.kind {
                SweepEventKind::Open => {
                    ok &= event.offset == range.start && !opened[*index];
                    opened[*index] = true;
                }
                SweepEventKind::Close => {
                    ok &= event.offset == range.end && opened[*index] && !closed[*index];
                    closed[*index] = true;
                }
            }
            true
        });
        prop_assert!(ok);
        prop_assert!(opened.iter().all(|&o| o));
        prop_assert!(closed.iter().all(|&c| c));
    }
}

#[derive(Debug, Clone)]
struct Tagged(usize, Range<usize>);

impl range_markers::Segment for Tagged {
    fn start(&self) -> usize {
        self.1.start
    }

    fn end(&self) -> usize {
        self.1.end
    }
}
