//! Sweep-line over ranges sorted by start offset.
//!
//! The sweep turns ascending ranges into a position-ordered stream of open and close events,
//! so a consumer can keep the set of ranges covering the scan position without re-sorting.
//! Several independently sorted streams, such as the markers of two trees, can be merged into
//! one sweep.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::ops::Range;

use crate::error::MarkerError;
use crate::marker::MarkerSpan;
use crate::tree::{MarkerTree, OverlapIter};

/// Anything with a `[start, end)` extent.
pub trait Segment {
    /// Start offset (inclusive).
    fn start(&self) -> usize;
    /// End offset (exclusive).
    fn end(&self) -> usize;
}

impl Segment for MarkerSpan {
    fn start(&self) -> usize {
        self.start
    }

    fn end(&self) -> usize {
        self.end
    }
}

impl Segment for Range<usize> {
    fn start(&self) -> usize {
        self.start
    }

    fn end(&self) -> usize {
        self.end
    }
}

impl<S: Segment + ?Sized> Segment for &S {
    fn start(&self) -> usize {
        (**self).start()
    }

    fn end(&self) -> usize {
        (**self).end()
    }
}

/// Kind of a [`SweepEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepEventKind {
    /// The item starts covering the scan position.
    Open,
    /// The item stops covering the scan position.
    Close,
}

/// One event of a sweep.
#[derive(Debug)]
pub struct SweepEvent<'a, T> {
    /// Scan position: the item's start for [`SweepEventKind::Open`], its end for
    /// [`SweepEventKind::Close`].
    pub offset: usize,
    /// The item opening or closing.
    pub item: &'a T,
    /// Whether `item` opens or closes.
    pub kind: SweepEventKind,
    /// Items open after this event, in the order they were opened.
    pub open: &'a [T],
}

/// Currently open items: a min-heap on end offset plus the opening order.
struct OpenSet<T> {
    by_end: BinaryHeap<Reverse<(usize, u64)>>,
    seqs: Vec<u64>,
    items: Vec<T>,
    next_seq: u64,
}

impl<T: Segment> OpenSet<T> {
    fn new() -> Self {
        Self {
            by_end: BinaryHeap::new(),
            seqs: Vec::new(),
            items: Vec::new(),
            next_seq: 0,
        }
    }

    /// Emit close events for items ending at or before `limit`. Returns `false` on abort.
    fn flush<F>(&mut self, limit: Option<usize>, processor: &mut F) -> bool
    where
        F: FnMut(SweepEvent<'_, T>) -> bool,
    {
        while let Some(&Reverse((end, seq))) = self.by_end.peek() {
            if limit.is_some_and(|limit| end > limit) {
                break;
            }
            self.by_end.pop();
            let Some(pos) = self.seqs.iter().position(|&s| s == seq) else {
                continue;
            };
            self.seqs.remove(pos);
            let item = self.items.remove(pos);
            let event = SweepEvent {
                offset: end,
                item: &item,
                kind: SweepEventKind::Close,
                open: &self.items,
            };
            if !processor(event) {
                return false;
            }
        }
        true
    }

    fn open<F>(&mut self, item: T, processor: &mut F) -> bool
    where
        F: FnMut(SweepEvent<'_, T>) -> bool,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (start, end) = (item.start(), item.end().max(item.start()));
        self.by_end.push(Reverse((end, seq)));
        self.seqs.push(seq);
        self.items.push(item);
        let Some(item) = self.items.last() else {
            return true;
        };
        processor(SweepEvent {
            offset: start,
            item,
            kind: SweepEventKind::Open,
            open: &self.items,
        })
    }
}

/// Sweep `items`, which must be sorted by ascending start offset.
///
/// For each item, first every open item ending at or before its start is closed, then the item
/// is opened. Items left open at the end are closed in end order. Events are therefore
/// non-decreasing in offset, and an item's open event always precedes its close event.
///
/// Returns `false` as soon as the processor does.
pub fn sweep<T, I, F>(items: I, mut processor: F) -> bool
where
    T: Segment,
    I: IntoIterator<Item = T>,
    F: FnMut(SweepEvent<'_, T>) -> bool,
{
    let mut open = OpenSet::new();
    let mut last_start = 0;
    for item in items {
        debug_assert!(item.start() >= last_start, "sweep input is not sorted by start");
        last_start = item.start();
        if !open.flush(Some(item.start()), &mut processor) || !open.open(item, &mut processor) {
            return false;
        }
    }
    open.flush(None, &mut processor)
}

/// Iterator merging several start-sorted streams into one, ties going to the lower stream index.
pub struct MergeByStart<I: Iterator> {
    streams: Vec<I>,
    heads: Vec<Option<I::Item>>,
    order: BinaryHeap<Reverse<(usize, usize)>>,
}

impl<I> MergeByStart<I>
where
    I: Iterator,
    I::Item: Segment,
{
    /// Merge `streams`, each sorted by ascending start.
    pub fn new<S>(streams: S) -> Self
    where
        S: IntoIterator,
        S::Item: IntoIterator<IntoIter = I>,
    {
        let mut streams: Vec<I> = streams.into_iter().map(IntoIterator::into_iter).collect();
        let mut heads = Vec::with_capacity(streams.len());
        let mut order = BinaryHeap::new();
        for (index, stream) in streams.iter_mut().enumerate() {
            let head = stream.next();
            if let Some(item) = &head {
                order.push(Reverse((item.start(), index)));
            }
            heads.push(head);
        }
        Self {
            streams,
            heads,
            order,
        }
    }
}

impl<I> Iterator for MergeByStart<I>
where
    I: Iterator,
    I::Item: Segment,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        let Reverse((_, index)) = self.order.pop()?;
        let item = self.heads[index].take();
        let next = self.streams[index].next();
        if let Some(head) = &next {
            self.order.push(Reverse((head.start(), index)));
        }
        self.heads[index] = next;
        item
    }
}

/// Sweep the k-way merge of several start-sorted streams.
pub fn sweep_streams<S, I, F>(streams: S, processor: F) -> bool
where
    S: IntoIterator,
    S::Item: IntoIterator<IntoIter = I>,
    I: Iterator,
    I::Item: Segment,
    F: FnMut(SweepEvent<'_, I::Item>) -> bool,
{
    sweep(MergeByStart::new(streams), processor)
}

/// Sweep the markers of several trees intersecting `[start, end]`.
///
/// Each tree is normalized first. The read locks of all trees are held for the whole sweep, so
/// the processor must not write to any of them. A tree passed twice is swept once. Markers
/// starting at the same offset are taken from the trees in the order given.
///
/// Locks are taken in tree creation order whatever the order of `trees`, so sweeps over the
/// same trees in different orders do not deadlock against queued writers.
pub fn sweep_trees<F>(trees: &[&MarkerTree], start: usize, end: usize, processor: F) -> Result<bool, MarkerError>
where
    F: FnMut(SweepEvent<'_, MarkerSpan>) -> bool,
{
    let mut distinct: Vec<&MarkerTree> = Vec::with_capacity(trees.len());
    for &tree in trees {
        if !distinct.iter().any(|seen| seen.same_tree(tree)) {
            distinct.push(tree);
        }
    }
    for tree in &distinct {
        tree.normalize()?;
    }
    let mut streams: Vec<Option<OverlapIter<'_>>> = distinct.iter().map(|_| None).collect();
    for index in lock_order(&distinct) {
        let tree: &MarkerTree = distinct[index];
        streams[index] = Some(tree.overlapping_iter(start, end)?);
    }
    Ok(sweep_streams(streams.into_iter().flatten(), processor))
}

/// Indices of `trees` sorted by tree creation order.
fn lock_order(trees: &[&MarkerTree]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..trees.len()).collect();
    order.sort_by_key(|&index| trees[index].id());
    order
}

impl MarkerTree {
    /// Sweep the markers intersecting `[start, end]` under the read lock.
    ///
    /// The tree is normalized first. Returns `Ok(false)` if the processor stopped the sweep.
    pub fn sweep<F>(&self, start: usize, end: usize, processor: F) -> Result<bool, MarkerError>
    where
        F: FnMut(SweepEvent<'_, MarkerSpan>) -> bool,
    {
        self.normalize()?;
        Ok(sweep(self.overlapping_iter(start, end)?, processor))
    }
}
