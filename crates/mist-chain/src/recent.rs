//! Ring of the most recent active headers.
//!
//! Sized to cover the difficulty windows plus a margin, so median and
//! retarget calculations almost never touch the DB.

use crate::chain_db::RowId;
use mist_consensus::Rules;
use mist_primitives::{BlockHeader, Height};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct RecentEntry {
    pub row: RowId,
    pub header: BlockHeader,
}

pub struct RecentStates {
    entries: VecDeque<RecentEntry>,
    capacity: usize,
}

impl RecentStates {
    pub fn new(rules: &Rules) -> Self {
        let da = &rules.da;
        let capacity =
            (da.window_work + da.window_median1).max(da.window_median0) as usize + 5;
        RecentStates {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// O(1) lookup by height.
    pub fn get(&self, h: Height) -> Option<&RecentEntry> {
        let last = self.entries.back()?;
        if h > last.header.height {
            return None;
        }
        let dh = (last.header.height - h) as usize;
        if dh >= self.entries.len() {
            return None;
        }
        let e = &self.entries[self.entries.len() - 1 - dh];
        debug_assert_eq!(e.header.height, h);
        Some(e)
    }

    /// Drop entries above `h`.
    pub fn rollback_to(&mut self, h: Height) {
        while let Some(last) = self.entries.back() {
            if last.header.height <= h {
                break;
            }
            self.entries.pop_back();
        }
    }

    /// Push the new tip, discarding any stale higher entries first.
    pub fn push(&mut self, row: RowId, header: BlockHeader) {
        if header.height > 0 {
            self.rollback_to(header.height - 1);
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(RecentEntry { row, header });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_primitives::{Difficulty, Hash32};
    use num_bigint::BigUint;

    fn header(h: Height) -> BlockHeader {
        BlockHeader {
            height: h,
            prev: Hash32::ZERO,
            chainwork: BigUint::from(h),
            timestamp: h * 60,
            difficulty: Difficulty::MIN,
            definition: Hash32::ZERO,
            kernels_root: Hash32::ZERO,
        }
    }

    #[test]
    fn push_and_get() {
        let rules = Rules::testing();
        let mut rs = RecentStates::new(&rules);
        for h in 1..=5 {
            rs.push(h, header(h));
        }
        assert_eq!(rs.get(3).unwrap().row, 3);
        assert_eq!(rs.get(5).unwrap().row, 5);
        assert!(rs.get(6).is_none());
    }

    #[test]
    fn capacity_evicts_oldest() {
        let rules = Rules::testing();
        let mut rs = RecentStates::new(&rules);
        let cap = rs.capacity as u64;
        for h in 1..=cap + 3 {
            rs.push(h, header(h));
        }
        assert_eq!(rs.len(), rs.capacity);
        assert!(rs.get(1).is_none());
        assert!(rs.get(cap + 3).is_some());
    }

    #[test]
    fn out_of_order_push_rolls_back() {
        let rules = Rules::testing();
        let mut rs = RecentStates::new(&rules);
        for h in 1..=6 {
            rs.push(h, header(h));
        }
        // a push at height 4 drops entries 4..6 first
        rs.push(40, header(4));
        assert_eq!(rs.get(4).unwrap().row, 40);
        assert!(rs.get(5).is_none());
        assert_eq!(rs.get(3).unwrap().row, 3);
    }

    #[test]
    fn rollback_to_height() {
        let rules = Rules::testing();
        let mut rs = RecentStates::new(&rules);
        for h in 1..=6 {
            rs.push(h, header(h));
        }
        rs.rollback_to(2);
        assert_eq!(rs.len(), 2);
        assert!(rs.get(3).is_none());
        assert!(rs.get(2).is_some());
    }
}
