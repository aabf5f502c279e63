//! Sweep-line example
//!
//! Merges markers from two trees (say, syntax highlighting and search hits) and prints the
//! set of ranges covering each position where it changes.

use range_markers::{MarkerTree, MarkerTreeConfig, RangeMarker, SweepEventKind, sweep_trees};

fn main() {
    let syntax = MarkerTree::new(MarkerTreeConfig::default().with_document_len(60));
    let search = MarkerTree::new(MarkerTreeConfig::default().with_document_len(60));

    let mut handles = Vec::new();
    for (tree, start, end, layer) in [
        (&syntax, 0, 12, 0),
        (&syntax, 20, 35, 0),
        (&search, 8, 10, 5),
        (&search, 30, 50, 5),
    ] {
        let marker = RangeMarker::new();
        tree.add_interval(&marker, start, end, false, false, layer)
            .unwrap();
        handles.push(marker);
    }

    sweep_trees(&[&syntax, &search], 0, 60, |event| {
        let verb = match event.kind {
            SweepEventKind::Open => "open ",
            SweepEventKind::Close => "close",
        };
        let covering: Vec<_> = event.open.iter().map(|span| span.range()).collect();
        println!(
            "{:>3}: {verb} {:?} (layer {}) -> covering {:?}",
            event.offset,
            event.item.range(),
            event.item.layer,
            covering
        );
        true
    })
    .unwrap();
}
