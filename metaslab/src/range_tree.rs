// vim: tw=80
//! Ordered sets of disjoint extents
//!
//! A `RangeTree` is indexed twice: by offset, for merging neighbors and for
//! first-fit searches, and by size, for best-fit searches.  Both indices are
//! balanced trees, so insertion, removal, and searches are all logarithmic
//! (first-fit searches are linear in the number of segments skipped).

use crate::{
    types::*,
    util::*
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
    ops::Bound,
};

/// Number of buckets in a `RangeTree`'s segment-size histogram
pub const HISTOGRAM_SIZE: usize = 64;

/// Segment-size histogram.  Bucket `i` counts the segments whose length has
/// `highbit == i`.
pub type Histogram = [u64; HISTOGRAM_SIZE];

#[derive(Clone, Eq, PartialEq)]
pub struct RangeTree {
    /// Maps the start of each segment to its length
    segs: BTreeMap<u64, u64>,
    /// (length, start) for every segment
    by_size: BTreeSet<(u64, u64)>,
    /// Sum of the length of every segment
    space: u64,
    histogram: Histogram,
}

impl RangeTree {
    /// Add an extent to the tree, coalescing it with its neighbors.
    ///
    /// # Panics
    ///
    /// If any part of `ext` is already present.
    pub fn add(&mut self, ext: Extent) {
        assert!(ext.length > 0, "Adding empty extent {ext}");
        let mut start = ext.offset;
        let mut end = ext.end();
        let before = self.segs.range(..=ext.offset).next_back()
            .map(|(&s, &l)| (s, l));
        let after = self.segs
            .range((Bound::Excluded(ext.offset), Bound::Unbounded))
            .next()
            .map(|(&s, &l)| (s, l));
        if let Some((s, l)) = before {
            assert!(s + l <= ext.offset,
                "Adding extent {ext} which overlaps [{s:#x}, {:#x})", s + l);
            if s + l == ext.offset {
                self.remove_seg(s, l);
                start = s;
            }
        }
        if let Some((s, l)) = after {
            assert!(ext.end() <= s,
                "Adding extent {ext} which overlaps [{s:#x}, {:#x})", s + l);
            if ext.end() == s {
                self.remove_seg(s, l);
                end = s + l;
            }
        }
        self.insert_seg(start, end - start);
        self.space += ext.length;
    }

    /// Remove every segment
    pub fn clear(&mut self) {
        *self = RangeTree::default();
    }

    /// Is `ext` entirely present in the tree?
    pub fn contains(&self, ext: Extent) -> bool {
        self.segs.range(..=ext.offset).next_back()
            .map(|(&s, &l)| s + l >= ext.end())
            .unwrap_or(false)
    }

    /// Find the smallest segment that can hold `size` bytes at `align`
    /// alignment.
    ///
    /// Returns the first `size` suitably aligned bytes of that segment.  Ties
    /// go to the lowest offset.
    pub fn find_best_fit(&self, size: u64, align: u64) -> Option<Extent> {
        self.by_size.range((size, 0)..)
            .find_map(|&(l, s)| {
                let a = p2_roundup(s, align);
                (a + size <= s + l).then(|| Extent::new(a, size))
            })
    }

    /// Find the lowest-offset segment that can hold at least `min` bytes at
    /// `align` alignment.
    ///
    /// Returns the aligned extent, extended up to `max` bytes if the segment
    /// allows.
    pub fn find_first_fit(&self, min: u64, max: u64, align: u64)
        -> Option<Extent>
    {
        self.find_first_fit_from(0, min, max, align)
    }

    /// Like [`find_first_fit`](Self::find_first_fit), but begin searching at
    /// `cursor` and wrap around to the start of the tree.
    pub fn find_first_fit_from(&self, cursor: u64, min: u64, max: u64,
                               align: u64) -> Option<Extent>
    {
        debug_assert!(min <= max);
        let fit = |s: u64, e: u64| {
            let a = p2_roundup(s, align);
            (a >= s && a + min <= e)
                .then(|| Extent::new(a, max.min(e - a)))
        };
        let containing = self.segs.range(..cursor).next_back()
            .filter(|(&s, &l)| s + l > cursor)
            .and_then(|(&s, &l)| fit(cursor, s + l));
        containing
            .or_else(|| {
                self.segs.range(cursor..)
                    .find_map(|(&s, &l)| fit(s, s + l))
            }).or_else(|| {
                self.segs.range(..cursor)
                    .find_map(|(&s, &l)| fit(s, s + l))
            })
    }

    /// The segment-size histogram
    pub fn histogram(&self) -> &Histogram {
        &self.histogram
    }

    fn insert_seg(&mut self, start: u64, length: u64) {
        self.segs.insert(start, length);
        self.by_size.insert((length, start));
        self.histogram[highbit(length) as usize] += 1;
    }

    /// Every portion of the tree that overlaps `ext`, in ascending order
    pub fn intersections(&self, ext: Extent) -> Vec<Extent> {
        self.iter_from(ext.offset)
            .take_while(|seg| seg.offset < ext.end())
            .map(|seg| {
                let start = seg.offset.max(ext.offset);
                let end = seg.end().min(ext.end());
                Extent::new(start, end - start)
            }).collect()
    }

    /// Does any part of `ext` lie in the tree?
    pub fn intersects(&self, ext: Extent) -> bool {
        self.segs.range(..ext.end()).next_back()
            .map(|(&s, &l)| s + l > ext.offset)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    /// Iterate over every segment in ascending order
    pub fn iter(&self) -> impl Iterator<Item=Extent> + '_ {
        self.segs.iter().map(|(&s, &l)| Extent::new(s, l))
    }

    /// Iterate in ascending order over the part of the tree at or beyond
    /// `offset`.
    ///
    /// A segment that straddles `offset` is clipped.  Restart an interrupted
    /// walk by passing the `end()` of the last extent seen.
    pub fn iter_from(&self, offset: u64) -> impl Iterator<Item=Extent> + '_ {
        let straddler = self.segs.range(..offset).next_back()
            .filter(|(&s, &l)| s + l > offset)
            .map(|(&s, &l)| Extent::new(offset, s + l - offset));
        straddler.into_iter()
            .chain(self.segs.range(offset..).map(|(&s, &l)| Extent::new(s, l)))
    }

    /// Number of segments in the tree
    pub fn len(&self) -> usize {
        self.segs.len()
    }

    /// Length of the largest segment, or 0 if empty
    pub fn max_segment(&self) -> u64 {
        self.by_size.iter().next_back().map(|&(l, _)| l).unwrap_or(0)
    }

    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an extent from the tree, splitting a segment if necessary.
    ///
    /// # Panics
    ///
    /// If `ext` is not entirely present.
    pub fn remove(&mut self, ext: Extent) {
        assert!(ext.length > 0, "Removing empty extent {ext}");
        let (s, l) = self.segs.range(..=ext.offset).next_back()
            .map(|(&s, &l)| (s, l))
            .filter(|&(s, l)| s + l >= ext.end())
            .unwrap_or_else(|| panic!(
                "Removing extent {ext} which is not entirely present"));
        self.remove_seg(s, l);
        if s < ext.offset {
            self.insert_seg(s, ext.offset - s);
        }
        if ext.end() < s + l {
            self.insert_seg(ext.end(), s + l - ext.end());
        }
        self.space -= ext.length;
    }

    fn remove_seg(&mut self, start: u64, length: u64) {
        self.segs.remove(&start);
        let r = self.by_size.remove(&(length, start));
        debug_assert!(r);
        self.histogram[highbit(length) as usize] -= 1;
    }

    /// Total bytes in the tree
    pub fn space(&self) -> u64 {
        self.space
    }

    /// Check the tree's internal consistency.
    ///
    /// # Panics
    ///
    /// If the size index, histogram, or space total disagree with the
    /// segments, or if any two segments overlap or abut.
    pub fn verify(&self) {
        let mut space = 0;
        let mut histogram = [0; HISTOGRAM_SIZE];
        let mut prev_end = None;
        for (&s, &l) in self.segs.iter() {
            assert!(l > 0);
            if let Some(pe) = prev_end {
                assert!(pe < s, "Segments abut or overlap at {s:#x}");
            }
            assert!(self.by_size.contains(&(l, s)));
            histogram[highbit(l) as usize] += 1;
            space += l;
            prev_end = Some(s + l);
        }
        assert_eq!(self.by_size.len(), self.segs.len());
        assert_eq!(space, self.space);
        assert_eq!(histogram, self.histogram);
    }
}

impl Default for RangeTree {
    fn default() -> Self {
        RangeTree {
            segs: BTreeMap::new(),
            by_size: BTreeSet::new(),
            space: 0,
            histogram: [0; HISTOGRAM_SIZE]
        }
    }
}

impl fmt::Debug for RangeTree {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set()
            .entries(self.iter().map(|e| e.offset..e.end()))
            .finish()
    }
}

impl FromIterator<Extent> for RangeTree {
    fn from_iter<I: IntoIterator<Item=Extent>>(iter: I) -> Self {
        let mut rt = RangeTree::new();
        for ext in iter {
            rt.add(ext);
        }
        rt
    }
}

/// Remove whatever part of `ext` is in `from`, and add the rest to `to`.
///
/// Keeps a pair of trees disjoint when they record opposite changes to the same
/// space, such as a metaslab's unflushed allocations and unflushed frees.
pub fn remove_xor_add(ext: Extent, from: &mut RangeTree, to: &mut RangeTree) {
    let overlaps = from.intersections(ext);
    let mut cursor = ext.offset;
    for o in overlaps.into_iter() {
        from.remove(o);
        if o.offset > cursor {
            to.add(Extent::new(cursor, o.offset - cursor));
        }
        cursor = o.end();
    }
    if cursor < ext.end() {
        to.add(Extent::new(cursor, ext.end() - cursor));
    }
}

// LCOV_EXCL_STOP
