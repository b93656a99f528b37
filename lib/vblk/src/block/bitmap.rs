// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Run-length encoded allocation bitmap.

use std::collections::BTreeMap;

/// A sparse set of allocated units (sectors, typically), stored as disjoint
/// runs.
///
/// Runs are keyed by their start and never overlap nor touch: adjacent runs
/// are merged upon insertion.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RleBitmap {
    /// start -> end (exclusive)
    runs: BTreeMap<u64, u64>,
}

impl RleBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `count` units starting at `start` as allocated.
    pub fn set(&mut self, start: u64, count: u64) {
        if count == 0 {
            return;
        }
        let mut new_start = start;
        let mut new_end = start.saturating_add(count);

        // A run beginning at or before `start` may overlap or abut it
        if let Some((&s, &e)) = self.runs.range(..=start).next_back() {
            if e >= start {
                new_start = s;
                new_end = new_end.max(e);
                self.runs.remove(&s);
            }
        }
        // Absorb any runs beginning within (or abutting) the new one
        while let Some((&s, &e)) = self.runs.range(new_start..=new_end).next() {
            new_end = new_end.max(e);
            self.runs.remove(&s);
        }
        self.runs.insert(new_start, new_end);
    }

    /// Is unit `pos` allocated?
    pub fn is_set(&self, pos: u64) -> bool {
        self.run_at(pos, 1).0
    }

    /// Describe the run containing `pos`: whether it is allocated, and how many
    /// units (no more than `limit`) it spans from `pos` onward.
    pub fn run_at(&self, pos: u64, limit: u64) -> (bool, u64) {
        if let Some((_, &e)) = self.runs.range(..=pos).next_back() {
            if e > pos {
                return (true, u64::min(e - pos, limit));
            }
        }
        match self.runs.range(pos..).next() {
            Some((&s, _)) => (false, u64::min(s - pos, limit)),
            None => (false, limit),
        }
    }

    /// Total number of allocated units
    pub fn count(&self) -> u64 {
        self.runs.iter().map(|(s, e)| e - s).sum()
    }

    /// Allocated runs, as `(start, count)` pairs in ascending order
    pub fn runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.runs.iter().map(|(&s, &e)| (s, e - s))
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn set_merges_overlaps_and_adjacency() {
        let mut bm = RleBitmap::new();
        bm.set(10, 10);
        bm.set(0, 5);
        bm.set(5, 5); // adjacent
        bm.set(18, 7); // overlaps

        assert_eq!(bm.runs().collect::<Vec<_>>(), vec![(0, 25)]);
        assert_eq!(bm.count(), 25);
    }

    #[test]
    fn set_within_existing() {
        let mut bm = RleBitmap::new();
        bm.set(0, 100);
        bm.set(10, 5);
        assert_eq!(bm.runs().collect::<Vec<_>>(), vec![(0, 100)]);
    }

    #[test]
    fn runs_at_positions() {
        let mut bm = RleBitmap::new();
        bm.set(4, 4);
        bm.set(12, 2);

        assert_eq!(bm.run_at(0, 100), (false, 4));
        assert_eq!(bm.run_at(2, 1), (false, 1));
        assert_eq!(bm.run_at(4, 100), (true, 4));
        assert_eq!(bm.run_at(5, 2), (true, 2));
        assert_eq!(bm.run_at(8, 100), (false, 4));
        assert_eq!(bm.run_at(13, 100), (true, 1));
        assert_eq!(bm.run_at(14, 100), (false, 100));
        assert!(bm.is_set(7));
        assert!(!bm.is_set(8));
    }

    #[test]
    fn empty_bitmap() {
        let bm = RleBitmap::new();
        assert!(bm.is_empty());
        assert_eq!(bm.run_at(0, 16), (false, 16));
        assert_eq!(bm.count(), 0);
    }

    proptest! {
        #[test]
        fn matches_dense_model(
            ops in proptest::collection::vec((0u64..256, 0u64..32), 0..32),
        ) {
            let mut bm = RleBitmap::new();
            let mut dense = vec![false; 320];
            for (start, count) in ops {
                bm.set(start, count);
                for unit in start..start + count {
                    dense[unit as usize] = true;
                }
            }

            prop_assert_eq!(bm.count() as usize, dense.iter().filter(|b| **b).count());

            // Runs must be disjoint and never touch
            let runs: Vec<_> = bm.runs().collect();
            for pair in runs.windows(2) {
                prop_assert!(pair[0].0 + pair[0].1 < pair[1].0);
            }

            for pos in 0..dense.len() as u64 {
                let (alloc, len) = bm.run_at(pos, 8);
                prop_assert_eq!(alloc, dense[pos as usize]);
                prop_assert!(len >= 1 && len <= 8);
                for unit in pos..u64::min(pos + len, dense.len() as u64) {
                    prop_assert_eq!(dense[unit as usize], alloc);
                }
            }
        }
    }
}
