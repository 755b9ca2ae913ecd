//! Congestion discovery: disconnected tip chains whose blocks are not yet
//! applied, grouped into contiguous row segments.

use crate::chain_db::{ChainDb, RowId, StateId, FLAG_REACHABLE};
use crate::error::ChainResult;
use mist_primitives::Height;
use num_bigint::BigUint;
use std::collections::VecDeque;

/// One tip chain of not-yet-reachable rows, top first.
#[derive(Debug, Clone)]
pub struct TipCongestion {
    /// Height of `rows[0]`.
    pub height: Height,
    /// Row ids from the tip downwards.
    pub rows: VecDeque<RowId>,
    /// The walk ended at a missing parent; headers must be fetched first.
    pub needs_hdrs: bool,
}

impl TipCongestion {
    pub fn is_contained(&self, sid: &StateId) -> bool {
        if sid.height > self.height {
            return false;
        }
        let dh = (self.height - sid.height) as usize;
        dh < self.rows.len() && self.rows[dh] == sid.row
    }

    /// Lowest row of the segment.
    pub fn bottom(&self) -> StateId {
        StateId {
            row: *self.rows.back().expect("segment never empty"),
            height: self.height - (self.rows.len() as u64 - 1),
        }
    }

    /// Topmost row of the segment.
    pub fn top(&self) -> StateId {
        StateId {
            row: self.rows[0],
            height: self.height,
        }
    }
}

/// Cache of tip segments surviving between enumeration runs, so a partially
/// known chain is not re-read from the DB.
#[derive(Debug, Default)]
pub struct CongestionCache {
    pub tips: Vec<TipCongestion>,
}

impl CongestionCache {
    pub fn clear(&mut self) {
        self.tips.clear();
    }

    /// Entry containing `sid`; multiple matches prefer the lowest tip.
    pub fn find(&self, sid: &StateId) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, t) in self.tips.iter().enumerate() {
            if !t.is_contained(sid) {
                continue;
            }
            match best {
                Some(b) if self.tips[b].height <= t.height => {}
                _ => best = Some(i),
            }
        }
        best
    }
}

/// Rebuild the congestion cache from the DB tips, splicing whatever the
/// previous run already discovered. Returns the index of the best
/// fully-headered target, if any.
pub(crate) fn enumerate(
    db: &ChainDb,
    cursor_chainwork: &BigUint,
    cache: &mut CongestionCache,
    genesis: Height,
) -> ChainResult<Option<usize>> {
    let mut old = CongestionCache {
        tips: std::mem::take(&mut cache.tips),
    };

    let mut max_target: Option<usize> = None;

    for tip in db.enum_tips()? {
        if db.get_flags(tip.row)? & FLAG_REACHABLE != 0 {
            continue;
        }
        let wrk = db.get_state(tip.row)?.header.chainwork;
        if wrk < *cursor_chainwork {
            // not interested in tips behind the current cursor
            continue;
        }

        let mut sid = tip;
        let mut current = TipCongestion {
            height: sid.height,
            rows: VecDeque::new(),
            needs_hdrs: false,
        };
        let mut check_cache = true;
        let mut needs_hdrs = false;

        loop {
            if check_cache {
                if let Some(j) = old.find(&sid) {
                    let mut p = old.tips.remove(j);
                    // trim the old entry's top down to sid
                    while p.height > sid.height {
                        p.height -= 1;
                        p.rows.pop_front();
                    }
                    // prepend whatever we walked before the splice
                    for r in current.rows.iter().rev() {
                        p.rows.push_front(*r);
                        p.height += 1;
                    }
                    current = p;

                    // drop rows that became reachable since the last run
                    while db.get_flags(*current.rows.back().expect("non-empty"))?
                        & FLAG_REACHABLE
                        != 0
                    {
                        current.rows.pop_back();
                    }
                    debug_assert!(!current.rows.is_empty());

                    sid = current.bottom();
                    check_cache = false;
                } else if let Some(j) = cache.find(&sid) {
                    // another tip in this run shares the segment; copy its tail
                    let p = &cache.tips[j];
                    let dh = (p.height - sid.height) as usize;
                    for i in dh..p.rows.len() {
                        current.rows.push_back(p.rows[i]);
                    }
                    sid = p.bottom();
                    check_cache = false;
                }
            }

            // append sid.row unless the splice already covered it
            if current.height >= sid.height + current.rows.len() as u64 {
                current.rows.push_back(sid.row);
            }

            if sid.height == genesis {
                break;
            }
            if !db.get_prev(&mut sid)? {
                needs_hdrs = true;
                break;
            }
            if db.get_flags(sid.row)? & FLAG_REACHABLE != 0 {
                break;
            }
        }

        current.needs_hdrs = needs_hdrs;
        debug_assert!(!current.rows.is_empty());
        cache.tips.push(current);

        let i = cache.tips.len() - 1;
        if !needs_hdrs {
            let better = match max_target {
                Some(m) => cache.tips[m].height < cache.tips[i].height,
                None => true,
            };
            if better {
                max_target = Some(i);
            }
        }
    }

    Ok(max_target)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(height: Height, rows: &[RowId]) -> TipCongestion {
        TipCongestion {
            height,
            rows: rows.iter().copied().collect(),
            needs_hdrs: false,
        }
    }

    #[test]
    fn containment() {
        let t = seg(10, &[7, 6, 5]);
        assert!(t.is_contained(&StateId { row: 7, height: 10 }));
        assert!(t.is_contained(&StateId { row: 5, height: 8 }));
        assert!(!t.is_contained(&StateId { row: 5, height: 9 }));
        assert!(!t.is_contained(&StateId { row: 4, height: 7 }));
        assert_eq!(t.bottom().height, 8);
        assert_eq!(t.top().row, 7);
    }

    #[test]
    fn find_prefers_lowest_tip() {
        let mut cache = CongestionCache::default();
        cache.tips.push(seg(10, &[7, 6, 5]));
        cache.tips.push(seg(9, &[9, 6, 5]));
        // row 5 at height 7... contained in neither (heights differ); row 6:
        let sid = StateId { row: 6, height: 9 };
        assert_eq!(cache.find(&sid), Some(0));
        let sid = StateId { row: 6, height: 8 };
        assert_eq!(cache.find(&sid), Some(1));
    }
}
