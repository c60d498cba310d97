//! Inclusive sequence ranges.

use serde::{Deserialize, Serialize};

/// An inclusive range of diff sequence numbers, `begin..=end`.
///
/// Acknowledgments and retransmission requests name seqs as lists of these
/// ranges. A range with `begin > end` is never produced by this crate and is
/// treated as malformed when received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeqRange {
    /// First seq in the range.
    pub begin: u64,
    /// Last seq in the range.
    pub end: u64,
}

impl SeqRange {
    /// Creates a range covering `begin..=end`.
    #[must_use]
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Creates a range covering exactly one seq.
    #[must_use]
    pub fn single(seq: u64) -> Self {
        Self::new(seq, seq)
    }

    /// Returns true if `begin <= end`.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.begin <= self.end
    }

    /// Returns true if `seq` lies in the range.
    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.begin <= seq && seq <= self.end
    }

    /// Number of seqs covered; zero for an inverted range.
    ///
    /// `0..=u64::MAX` covers one more seq than a `u64` can count, so its
    /// length saturates at `u64::MAX`.
    #[must_use]
    pub fn len(&self) -> u64 {
        if self.is_valid() {
            (self.end - self.begin).saturating_add(1)
        } else {
            0
        }
    }

    /// Returns true if the range covers nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.is_valid()
    }

    /// Iterates the seqs in the range in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> {
        self.begin..=self.end
    }
}

/// Collapses a set of seqs into the shortest ascending list of ranges.
///
/// Input order and duplicates do not matter.
///
/// ```rust
/// use agentsync_protocol::{compress_seqs, SeqRange};
///
/// let ranges = compress_seqs([5, 1, 2, 3, 7, 2]);
/// assert_eq!(ranges, vec![SeqRange::new(1, 3), SeqRange::single(5), SeqRange::single(7)]);
/// ```
pub fn compress_seqs(seqs: impl IntoIterator<Item = u64>) -> Vec<SeqRange> {
    let mut sorted: Vec<u64> = seqs.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<SeqRange> = Vec::new();
    for seq in sorted {
        match ranges.last_mut() {
            Some(last) if last.end.checked_add(1) == Some(seq) => last.end = seq,
            _ => ranges.push(SeqRange::single(seq)),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn contains_is_inclusive() {
        let range = SeqRange::new(3, 5);
        assert!(!range.contains(2));
        assert!(range.contains(3));
        assert!(range.contains(5));
        assert!(!range.contains(6));
        assert_eq!(range.len(), 3);
    }

    #[test]
    fn inverted_range_is_empty() {
        let range = SeqRange::new(9, 4);
        assert!(!range.is_valid());
        assert!(range.is_empty());
        assert_eq!(range.len(), 0);
        assert_eq!(range.iter().count(), 0);
    }

    #[test]
    fn full_range_length_saturates() {
        assert_eq!(SeqRange::new(0, u64::MAX).len(), u64::MAX);
        assert_eq!(SeqRange::new(1, u64::MAX).len(), u64::MAX);
        assert_eq!(SeqRange::single(u64::MAX).len(), 1);
    }

    #[test]
    fn compress_empty() {
        assert!(compress_seqs(Vec::new()).is_empty());
    }

    #[test]
    fn compress_handles_u64_max() {
        let ranges = compress_seqs([u64::MAX - 1, u64::MAX]);
        assert_eq!(ranges, vec![SeqRange::new(u64::MAX - 1, u64::MAX)]);
    }

    proptest! {
        #[test]
        fn compressed_ranges_cover_exactly_the_input(seqs in proptest::collection::vec(0u64..200, 0..64)) {
            let expected: BTreeSet<u64> = seqs.iter().copied().collect();
            let ranges = compress_seqs(seqs);

            let covered: BTreeSet<u64> = ranges.iter().flat_map(|range| range.iter()).collect();
            prop_assert_eq!(&covered, &expected);

            // Ascending, disjoint and non-adjacent.
            for pair in ranges.windows(2) {
                prop_assert!(pair[0].end + 1 < pair[1].begin);
            }
        }
    }
}
