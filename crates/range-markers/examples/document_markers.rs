//! Document markers example
//!
//! Creates a few markers over a document, edits it, and prints where the markers ended up.
//! Run with `RUST_LOG=range_markers=debug` to see the per-edit summaries.

use std::sync::{Arc, Mutex};

use range_markers::{ChangePhase, Document, MarkerOptions};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut doc = Document::new("fn main() {\n    println!(\"Hello, world!\");\n}\n");
    let call = doc
        .create_range_marker(16..24, MarkerOptions::default(), 0)
        .unwrap();
    let literal = doc
        .create_range_marker(25..40, MarkerOptions::greedy(), 1)
        .unwrap();
    let caret = doc
        .create_range_marker(40..40, MarkerOptions::default().with_sticking_right(true), 2)
        .unwrap();

    let edits = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&edits);
    doc.subscribe(move |event| {
        if event.phase == ChangePhase::AfterChange {
            *counter.lock().unwrap() += 1;
            println!(
                "  edit #{} at {}: -{} +{} (length now {})",
                event.modification_stamp,
                event.change.offset,
                event.change.old_length,
                event.change.new_length,
                event.document_len
            );
        }
    });

    println!("1. Initial markers:");
    print_markers(&doc);

    println!("\n2. Typing at the caret:");
    doc.insert(caret.start_offset().unwrap(), "?").unwrap();
    print_markers(&doc);

    println!("\n3. Renaming the macro:");
    doc.replace(16..23, "eprintln").unwrap();
    print_markers(&doc);

    println!("\n4. Deleting the call:");
    let range = call.range().unwrap();
    doc.delete(range).unwrap();
    println!("  call marker valid: {}", call.is_valid());
    println!("  literal marker: {:?}", literal.range());

    println!("\n{} edits applied", edits.lock().unwrap());
}

fn print_markers(doc: &Document) {
    doc.markers()
        .process_all(|span| {
            println!(
                "  layer {} {:?} = {:?}",
                span.layer,
                span.range(),
                doc.slice(span.range()).unwrap_or_default()
            );
            true
        })
        .unwrap();
}
