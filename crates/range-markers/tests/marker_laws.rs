use pretty_assertions::assert_eq;
use range_markers::{
    Document, DocumentChange, MarkerError, MarkerOptions, MarkerTree, MarkerTreeConfig,
    RangeMarker,
};

fn tree(len: usize) -> MarkerTree {
    MarkerTree::new(
        MarkerTreeConfig::default()
            .with_document_len(len)
            .with_verify_invariants(true),
    )
}

fn marker(tree: &MarkerTree, start: usize, end: usize, greedy_left: bool, greedy_right: bool) -> RangeMarker {
    let marker = RangeMarker::new();
    tree.add_interval(&marker, start, end, greedy_left, greedy_right, 0)
        .unwrap();
    marker
}

#[test]
fn test_hello_world_scenario() {
    let mut doc = Document::new("Hello, world!");
    let a = doc
        .create_range_marker(0..5, MarkerOptions::new(false, false), 0)
        .unwrap();

    doc.insert(5, "XX").unwrap();
    assert_eq!(doc.text(), "HelloXX, world!");
    assert_eq!(a.range(), Ok(0..5));

    doc.insert(0, "XX").unwrap();
    assert_eq!(doc.text(), "XXHelloXX, world!");
    assert_eq!(a.range(), Ok(2..7));
    assert_eq!(doc.slice(2..7).unwrap(), "Hello");
}

#[test]
fn test_greedy_left_absorbs_insertion_at_start() {
    // "Hello, world!" with B = [7, 12) over "world".
    let tree = tree(13);
    let b = marker(&tree, 7, 12, true, false);
    tree.document_changed(DocumentChange::insertion(7, 1)).unwrap();
    assert_eq!(b.range(), Ok(7..13));

    let plain = marker(&tree, 7, 13, false, false);
    tree.document_changed(DocumentChange::insertion(7, 1)).unwrap();
    assert_eq!(plain.range(), Ok(8..14));
    assert_eq!(b.range(), Ok(7..14));
}

#[test]
fn test_greedy_right_law() {
    let tree = tree(10);
    let plain = marker(&tree, 2, 5, false, false);
    let greedy = marker(&tree, 2, 5, false, true);
    tree.document_changed(DocumentChange::insertion(5, 4)).unwrap();
    assert_eq!(plain.end_offset(), Ok(5));
    assert_eq!(greedy.end_offset(), Ok(9));
}

#[test]
fn test_edit_touching_boundary_does_not_extend() {
    let tree = tree(20);
    let m = marker(&tree, 5, 10, false, false);
    tree.document_changed(DocumentChange::new(10, 2, 5)).unwrap();
    assert_eq!(m.range(), Ok(5..10));
    tree.document_changed(DocumentChange::new(2, 3, 1)).unwrap();
    assert_eq!(m.range(), Ok(3..8));
}

#[test]
fn test_whole_span_deletion_invalidates() {
    let tree = tree(20);
    let doomed = marker(&tree, 4, 9, false, false);
    let survivor = RangeMarker::new();
    tree.add_interval_with(
        &survivor,
        4..9,
        MarkerOptions::default().with_survive_deletion(true),
        0,
    )
    .unwrap();

    let summary = tree.document_changed(DocumentChange::deletion(4..9)).unwrap();
    assert_eq!(summary.invalidated, 1);
    assert!(!doomed.is_valid());
    assert_eq!(doomed.start_offset(), Err(MarkerError::StaleMarker(doomed.id())));
    assert_eq!(doomed.end_offset(), Err(MarkerError::StaleMarker(doomed.id())));
    assert_eq!(survivor.range(), Ok(4..4));

    // Later edits never bring an invalid marker back.
    tree.document_changed(DocumentChange::insertion(0, 3)).unwrap();
    assert_eq!(doomed.range(), Err(MarkerError::StaleMarker(doomed.id())));
    assert_eq!(survivor.range(), Ok(7..7));
}

#[test]
fn test_greedy_marker_covers_replacement() {
    let tree = tree(20);
    let m = marker(&tree, 4, 9, true, true);
    tree.document_changed(DocumentChange::new(4, 5, 2)).unwrap();
    assert_eq!(m.range(), Ok(4..6));
}

#[test]
fn test_merge_keeps_markers_independent() {
    let tree = tree(20);
    let first = marker(&tree, 2, 6, false, false);
    let second = marker(&tree, 3, 6, false, false);
    assert_eq!(tree.node_count(), Ok(2));

    // Deleting 2..3 turns both into [2, 5).
    let summary = tree.document_changed(DocumentChange::deletion(2..3)).unwrap();
    assert_eq!(summary.merged, 1);
    assert_eq!(tree.node_count(), Ok(1));
    assert_eq!(first.range(), Ok(2..5));
    assert_eq!(second.range(), Ok(2..5));
    assert_ne!(first, second);

    assert!(first.dispose());
    assert!(!first.is_valid());
    assert_eq!(second.range(), Ok(2..5));
    assert_eq!(tree.node_count(), Ok(1));
}

#[test]
fn test_zero_length_markers_at_insertion_point() {
    let tree = tree(10);
    let plain = marker(&tree, 4, 4, false, false);
    let sticky = RangeMarker::new();
    tree.add_interval_with(&sticky, 4..4, MarkerOptions::default().with_sticking_right(true), 0)
        .unwrap();
    let greedy = marker(&tree, 4, 4, false, true);

    tree.document_changed(DocumentChange::insertion(4, 3)).unwrap();
    assert_eq!(plain.range(), Ok(4..4));
    assert_eq!(sticky.range(), Ok(7..7));
    assert_eq!(greedy.range(), Ok(4..7));
}

#[test]
fn test_rejected_change_is_atomic() {
    let tree = tree(10);
    let m = marker(&tree, 2, 8, false, false);
    let stamp = tree.mod_count().unwrap();
    assert!(matches!(
        tree.document_changed(DocumentChange::deletion(5..11)),
        Err(MarkerError::InvalidChange { .. })
    ));
    assert_eq!(tree.mod_count(), Ok(stamp));
    assert_eq!(tree.document_len(), Ok(10));
    assert_eq!(m.range(), Ok(2..8));
}

#[test]
fn test_foreign_marker_is_rejected() {
    let left = tree(10);
    let right = tree(10);
    let m = marker(&left, 1, 2, false, false);
    assert_eq!(
        right.add_interval(&m, 1, 2, false, false, 0),
        Err(MarkerError::ForeignMarker { marker: m.id() })
    );
    assert_eq!(right.size(), Ok(0));
    assert!(m.tree().is_some_and(|owner| owner.same_tree(&left)));
}

#[test]
fn test_layer_is_reported() {
    let tree = tree(10);
    let m = RangeMarker::new();
    tree.add_interval(&m, 1, 4, false, false, 7).unwrap();
    assert_eq!(m.layer(), 7);
    let spans = tree.overlapping(0, 10).unwrap();
    assert_eq!(spans[0].layer, 7);
    assert_eq!(spans[0].marker, m);
}

#[test]
fn test_marker_outliving_tree_is_stale() {
    let m = {
        let tree = tree(10);
        marker(&tree, 1, 4, false, false)
    };
    assert!(m.tree().is_none());
    assert!(!m.is_valid());
    assert_eq!(m.range(), Err(MarkerError::StaleMarker(m.id())));
    assert!(!m.dispose());
}

#[test]
fn test_markers_live_until_last_tree_handle_drops() {
    let first = tree(10);
    let second = first.clone();
    let m = marker(&first, 2, 6, false, false);

    drop(first);
    assert!(m.is_valid());
    assert_eq!(m.range(), Ok(2..6));

    drop(second);
    assert!(!m.is_valid());
    assert_eq!(m.range(), Err(MarkerError::StaleMarker(m.id())));
}

#[test]
fn test_markers_die_with_their_document() {
    let m = {
        let doc = Document::new("Hello, world!");
        doc.create_range_marker(7..12, MarkerOptions::default(), 0)
            .unwrap()
    };
    assert!(!m.is_valid());
    assert_eq!(m.start_offset(), Err(MarkerError::StaleMarker(m.id())));
}
