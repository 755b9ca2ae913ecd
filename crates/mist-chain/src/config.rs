//! Processor configuration: horizons and start parameters.

use mist_consensus::Rules;
use mist_primitives::Height;
use serde::{Deserialize, Serialize};

/// A pair of pruning horizons, `lo >= hi`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HorizonRange {
    pub lo: Height,
    pub hi: Height,
}

/// Pruning and sync horizons.
///
/// `sync` governs what the node keeps while bootstrapping, `local` what it
/// keeps for serving peers afterwards, `branching` how far below the cursor
/// inferior alternative tips survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Horizon {
    pub branching: Height,
    pub sync: HorizonRange,
    pub local: HorizonRange,
}

impl Horizon {
    /// Keep everything forever.
    pub fn infinite() -> Self {
        Horizon {
            branching: Height::MAX,
            sync: HorizonRange {
                lo: Height::MAX,
                hi: Height::MAX,
            },
            local: HorizonRange {
                lo: Height::MAX,
                hi: Height::MAX,
            },
        }
    }

    /// The standard fast-sync profile derived from the rollback bound.
    pub fn std_fast_sync(rules: &Rules) -> Self {
        let r = rules.max_rollback;
        Horizon {
            // inferior branches are pruned at this height difference
            branching: r / 4,
            sync: HorizonRange { lo: r * 3, hi: r },
            local: HorizonRange {
                // local.hi slightly above sync.lo, to feed other fast synchers
                lo: r * 180,
                hi: r * 2,
            },
        }
    }

    /// Clamp the horizons into a consistent shape.
    pub fn normalize(&mut self, rules: &Rules) {
        self.branching = self.branching.max(1);

        let r = rules.max_rollback;
        self.sync.hi = self.sync.hi.max(r.max(self.branching));
        self.sync.lo = self.sync.lo.max(self.sync.hi);

        // Some nodes in production have a bug: if sync.lo == sync.hi, the last
        // generated block they send may be incorrect. Keep sync.lo strictly
        // above sync.hi until those peers are off the network.
        if self.sync.lo == self.sync.hi && self.sync.hi < Height::MAX {
            self.sync.lo += 1;
        }

        self.local.hi = self.local.hi.max(self.sync.hi);
        self.local.lo = self.local.lo.max(self.local.hi.max(self.sync.lo));
    }
}

impl Default for Horizon {
    fn default() -> Self {
        Horizon::infinite()
    }
}

/// Startup switches.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartParams {
    /// Walk and decode all state rows before starting.
    #[serde(default)]
    pub check_integrity: bool,
    /// Compact the database after pruning.
    #[serde(default)]
    pub vacuum: bool,
    /// Discard the UTXO image and rebuild from the txo store.
    #[serde(default)]
    pub reset_image: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_keeps_sync_lo_above_hi() {
        let rules = Rules::testing();
        let mut hz = Horizon {
            branching: 0,
            sync: HorizonRange { lo: 5, hi: 5 },
            local: HorizonRange { lo: 0, hi: 0 },
        };
        hz.normalize(&rules);
        assert!(hz.branching >= 1);
        assert!(hz.sync.hi >= rules.max_rollback);
        assert!(hz.sync.lo > hz.sync.hi);
        assert!(hz.local.hi >= hz.sync.hi);
        assert!(hz.local.lo >= hz.sync.lo);
    }

    #[test]
    fn infinite_stays_infinite() {
        let rules = Rules::testing();
        let mut hz = Horizon::infinite();
        hz.normalize(&rules);
        assert_eq!(hz.sync.lo, Height::MAX);
        assert_eq!(hz.sync.hi, Height::MAX);
    }

    #[test]
    fn std_fast_sync_shape() {
        let rules = Rules::testing();
        let mut hz = Horizon::std_fast_sync(&rules);
        hz.normalize(&rules);
        assert!(hz.sync.lo > hz.sync.hi);
        assert!(hz.local.lo >= hz.local.hi);
    }
}
