//! Range Module
//!
//! Comparator-driven, totally ordered key ranges.
//!
//! ## Responsibilities
//! - Owned keys, including the two infinities
//! - Key intervals, closed at the caller, and their four-way comparison
//! - Cutting a range at another range's boundaries
//! - Append-only buffers of ranges for transaction ledgers
//!
//! ## Comparison
//! ```text
//!   this:          [----]
//!   LessThan:                 [----]     (this ends before other starts)
//!   GreaterThan: [--]                    (this starts after other ends)
//!   Equals:        [----]
//!   Overlaps:        [----]              (anything else)
//! ```

mod buffer;
mod comparator;

pub use buffer::RangeBuffer;
pub use comparator::{BytewiseComparator, Comparator, KeyComparator};

use std::cmp::Ordering;
use std::fmt;
use std::mem;
use std::ops::Bound;

use bytes::Bytes;

use crate::error::{LockError, Result};

/// An owned key, or one of the two infinities
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Key {
    NegativeInfinity,
    Value(Bytes),
    PositiveInfinity,
}

impl Key {
    /// Copy caller memory into an owned key
    pub fn copy_from_slice(bytes: &[u8]) -> Self {
        Key::Value(Bytes::copy_from_slice(bytes))
    }

    pub fn is_infinite(&self) -> bool {
        !matches!(self, Key::Value(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Key::Value(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Heap bytes owned by this key
    pub fn memory_size(&self) -> usize {
        match self {
            Key::Value(bytes) => bytes.len(),
            _ => 0,
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::copy_from_slice(s.as_bytes())
    }
}

impl From<&[u8]> for Key {
    fn from(bytes: &[u8]) -> Self {
        Key::copy_from_slice(bytes)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Value(Bytes::from(bytes))
    }
}

impl From<u64> for Key {
    /// Big-endian, so bytewise order matches numeric order
    fn from(n: u64) -> Self {
        Key::Value(Bytes::copy_from_slice(&n.to_be_bytes()))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::NegativeInfinity => f.write_str("-inf"),
            Key::PositiveInfinity => f.write_str("+inf"),
            Key::Value(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "{:?}", s),
                _ => {
                    f.write_str("0x")?;
                    for b in bytes.iter() {
                        write!(f, "{:02x}", b)?;
                    }
                    Ok(())
                }
            },
        }
    }
}

/// Result of comparing two ranges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeComparison {
    LessThan,
    Equals,
    Overlaps,
    GreaterThan,
}

impl RangeComparison {
    /// Equals counts as overlapping
    pub fn overlaps(self) -> bool {
        matches!(self, RangeComparison::Equals | RangeComparison::Overlaps)
    }
}

/// Where a range end sits relative to its key: just before it, on it, or
/// just after it
type Edge = i8;

const BEFORE: Edge = -1;
const ON: Edge = 0;
const AFTER: Edge = 1;

/// Interval of keys, closed unless split off a neighbour
///
/// Caller ranges are always closed `[left, right]`. Open ends only appear
/// when a stored range is cut at another range's boundary, so the pieces
/// stay disjoint without needing a successor key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    left: Key,
    right: Key,
    left_open: bool,
    right_open: bool,
}

impl KeyRange {
    /// Build a range, rejecting `left > right`
    pub fn new(cmp: &Comparator, left: Key, right: Key) -> Result<Self> {
        if cmp.compare(&left, &right) == Ordering::Greater {
            return Err(LockError::InvalidRange(format!(
                "left key {:?} sorts after right key {:?}",
                left, right
            )));
        }
        Ok(Self::closed(left, right))
    }

    /// Build a range from explicit bounds; `Unbounded` means an infinity
    pub fn from_bounds(cmp: &Comparator, start: Bound<Key>, end: Bound<Key>) -> Result<Self> {
        let (left, left_open) = match start {
            Bound::Included(k) => (k, false),
            Bound::Excluded(k) => (k, true),
            Bound::Unbounded => (Key::NegativeInfinity, false),
        };
        let (right, right_open) = match end {
            Bound::Included(k) => (k, false),
            Bound::Excluded(k) => (k, true),
            Bound::Unbounded => (Key::PositiveInfinity, false),
        };
        let range = Self {
            left,
            right,
            left_open,
            right_open,
        };
        if range.start_after_end(cmp) {
            return Err(LockError::InvalidRange(format!("{:?} is empty", range)));
        }
        Ok(range)
    }

    fn closed(left: Key, right: Key) -> Self {
        Self {
            left,
            right,
            left_open: false,
            right_open: false,
        }
    }

    /// Single-key range `[key, key]`
    pub fn point(key: Key) -> Self {
        Self::closed(key.clone(), key)
    }

    /// The whole keyspace
    pub fn infinite() -> Self {
        Self::closed(Key::NegativeInfinity, Key::PositiveInfinity)
    }

    pub fn left(&self) -> &Key {
        &self.left
    }

    pub fn right(&self) -> &Key {
        &self.right
    }

    pub fn start_bound(&self) -> Bound<&Key> {
        if self.left_open {
            Bound::Excluded(&self.left)
        } else {
            Bound::Included(&self.left)
        }
    }

    pub fn end_bound(&self) -> Bound<&Key> {
        if self.right_open {
            Bound::Excluded(&self.right)
        } else {
            Bound::Included(&self.right)
        }
    }

    fn start_edge(&self) -> Edge {
        if self.left_open {
            AFTER
        } else {
            ON
        }
    }

    fn end_edge(&self) -> Edge {
        if self.right_open {
            BEFORE
        } else {
            ON
        }
    }

    fn start_after_end(&self, cmp: &Comparator) -> bool {
        compare_ends(cmp, &self.left, self.start_edge(), &self.right, self.end_edge())
            == Ordering::Greater
    }

    /// Compare this range against another
    pub fn compare(&self, cmp: &Comparator, other: &KeyRange) -> RangeComparison {
        let end_vs_start = compare_ends(cmp, &self.right, self.end_edge(), &other.left, other.start_edge());
        let start_vs_end = compare_ends(cmp, &self.left, self.start_edge(), &other.right, other.end_edge());
        if end_vs_start == Ordering::Less {
            RangeComparison::LessThan
        } else if start_vs_end == Ordering::Greater {
            RangeComparison::GreaterThan
        } else if self.compare_starts(cmp, other) == Ordering::Equal
            && self.compare_ends(cmp, other) == Ordering::Equal
        {
            RangeComparison::Equals
        } else {
            RangeComparison::Overlaps
        }
    }

    fn compare_starts(&self, cmp: &Comparator, other: &KeyRange) -> Ordering {
        compare_ends(cmp, &self.left, self.start_edge(), &other.left, other.start_edge())
    }

    fn compare_ends(&self, cmp: &Comparator, other: &KeyRange) -> Ordering {
        compare_ends(cmp, &self.right, self.end_edge(), &other.right, other.end_edge())
    }

    pub fn overlaps(&self, cmp: &Comparator, other: &KeyRange) -> bool {
        self.compare(cmp, other).overlaps()
    }

    /// Whether every key of `other` lies inside this range
    pub fn contains(&self, cmp: &Comparator, other: &KeyRange) -> bool {
        self.compare_starts(cmp, other) != Ordering::Greater
            && self.compare_ends(cmp, other) != Ordering::Less
    }

    /// Grow this range to also cover `other`
    pub fn extend(&mut self, cmp: &Comparator, other: &KeyRange) {
        if self.compare_starts(cmp, other) == Ordering::Greater {
            self.left = other.left.clone();
            self.left_open = other.left_open;
        }
        if self.compare_ends(cmp, other) == Ordering::Less {
            self.right = other.right.clone();
            self.right_open = other.right_open;
        }
    }

    /// The keys of this range that sort before every key of `other`
    pub fn before(&self, cmp: &Comparator, other: &KeyRange) -> Option<KeyRange> {
        if self.compare_starts(cmp, other) != Ordering::Less {
            return None;
        }
        let mut head = self.clone();
        if compare_ends(cmp, &head.right, head.end_edge(), &other.left, other.start_edge())
            != Ordering::Less
        {
            head.right = other.left.clone();
            head.right_open = !other.left_open;
        }
        Some(head).filter(|r| !r.start_after_end(cmp))
    }

    /// The keys of this range that sort after every key of `other`
    pub fn after(&self, cmp: &Comparator, other: &KeyRange) -> Option<KeyRange> {
        if self.compare_ends(cmp, other) != Ordering::Greater {
            return None;
        }
        let mut tail = self.clone();
        if compare_ends(cmp, &tail.left, tail.start_edge(), &other.right, other.end_edge())
            != Ordering::Greater
        {
            tail.left = other.right.clone();
            tail.left_open = !other.right_open;
        }
        Some(tail).filter(|r| !r.start_after_end(cmp))
    }

    /// The keys both ranges cover
    pub fn intersect(&self, cmp: &Comparator, other: &KeyRange) -> Option<KeyRange> {
        let mut common = self.clone();
        if common.compare_starts(cmp, other) == Ordering::Less {
            common.left = other.left.clone();
            common.left_open = other.left_open;
        }
        if common.compare_ends(cmp, other) == Ordering::Greater {
            common.right = other.right.clone();
            common.right_open = other.right_open;
        }
        Some(common).filter(|r| !r.start_after_end(cmp))
    }

    /// `next` starts right where this range ends, with no key between them
    pub fn touches(&self, cmp: &Comparator, next: &KeyRange) -> bool {
        cmp.compare(&self.right, &next.left) == Ordering::Equal && self.right_open != next.left_open
    }

    /// Approximate bytes this range costs when stored
    pub fn memory_size(&self) -> usize {
        mem::size_of::<KeyRange>() + self.left.memory_size() + self.right.memory_size()
    }
}

/// Order two range ends, each a key plus the edge it sits on
fn compare_ends(cmp: &Comparator, a: &Key, a_edge: Edge, b: &Key, b_edge: Edge) -> Ordering {
    cmp.compare(a, b).then(a_edge.cmp(&b_edge))
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let open = if self.left_open { '(' } else { '[' };
        let close = if self.right_open { ')' } else { ']' };
        write!(f, "{}{:?}, {:?}{}", open, self.left, self.right, close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(l: u64, r: u64) -> KeyRange {
        KeyRange::new(&Comparator::bytewise(), Key::from(l), Key::from(r)).unwrap()
    }

    #[test]
    fn test_compare_four_ways() {
        let cmp = Comparator::bytewise();
        let r = range(5, 10);
        assert_eq!(range(1, 4).compare(&cmp, &r), RangeComparison::LessThan);
        assert_eq!(range(11, 12).compare(&cmp, &r), RangeComparison::GreaterThan);
        assert_eq!(range(5, 10).compare(&cmp, &r), RangeComparison::Equals);
        assert_eq!(range(10, 12).compare(&cmp, &r), RangeComparison::Overlaps);
        assert_eq!(range(6, 7).compare(&cmp, &r), RangeComparison::Overlaps);
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let result = KeyRange::new(&Comparator::bytewise(), Key::from(9u64), Key::from(2u64));
        assert!(matches!(result, Err(LockError::InvalidRange(_))));
    }

    #[test]
    fn test_extend_covers_both() {
        let cmp = Comparator::bytewise();
        let mut r = range(5, 10);
        r.extend(&cmp, &range(2, 6));
        r.extend(&cmp, &range(9, 14));
        assert_eq!(r, range(2, 14));
        assert!(KeyRange::infinite().contains(&cmp, &r));
    }

    #[test]
    fn test_cut_at_other_range() {
        let cmp = Comparator::bytewise();
        let held = range(2, 8);
        let cut = range(4, 6);

        let head = held.before(&cmp, &cut).unwrap();
        let tail = held.after(&cmp, &cut).unwrap();
        assert_eq!(head.end_bound(), Bound::Excluded(&Key::from(4u64)));
        assert_eq!(tail.start_bound(), Bound::Excluded(&Key::from(6u64)));
        assert_eq!(held.intersect(&cmp, &cut), Some(cut.clone()));

        // The three pieces cover the range with nothing in between
        assert!(head.touches(&cmp, &cut));
        assert!(cut.touches(&cmp, &tail));
        assert_eq!(head.compare(&cmp, &cut), RangeComparison::LessThan);
        assert_eq!(tail.compare(&cmp, &cut), RangeComparison::GreaterThan);
        assert!(head.contains(&cmp, &range(2, 3)));
        assert!(!head.overlaps(&cmp, &range(4, 4)));
    }

    #[test]
    fn test_cut_outside_range_is_empty() {
        let cmp = Comparator::bytewise();
        let held = range(4, 6);
        assert_eq!(held.before(&cmp, &range(4, 9)), None);
        assert_eq!(held.after(&cmp, &range(0, 6)), None);
        assert_eq!(held.intersect(&cmp, &range(7, 9)), None);
        assert_eq!(held.before(&cmp, &range(8, 9)), Some(held.clone()));
    }

    #[test]
    fn test_open_ends_do_not_overlap() {
        let cmp = Comparator::bytewise();
        let below = KeyRange::from_bounds(
            &cmp,
            Bound::Included(Key::from(1u64)),
            Bound::Excluded(Key::from(5u64)),
        )
        .unwrap();
        assert!(!below.overlaps(&cmp, &range(5, 9)));
        assert!(below.touches(&cmp, &range(5, 9)));
        assert_eq!(format!("{:?}", below), "[0x0000000000000001, 0x0000000000000005)");

        let empty = KeyRange::from_bounds(
            &cmp,
            Bound::Excluded(Key::from(5u64)),
            Bound::Included(Key::from(5u64)),
        );
        assert!(matches!(empty, Err(LockError::InvalidRange(_))));
    }
}
