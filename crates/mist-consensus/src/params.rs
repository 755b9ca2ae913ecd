//! Chain rules: fork schedule, difficulty-adjustment settings, shielded and
//! asset limits, emission.

use mist_primitives::{Difficulty, Hash32, Hasher, Height, SigmaCfg};

/// Genesis block height. Height 0 is the prehistoric anchor.
pub const HEIGHT_GENESIS: Height = 1;

/// Hard cap on a confidential asset's outstanding value.
pub const MAX_ASSET_VALUE: u64 = i64::MAX as u64;

/// An inclusive height range. `min > max` means empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeightRange {
    pub min: Height,
    pub max: Height,
}

impl HeightRange {
    pub fn new(min: Height, max: Height) -> Self {
        HeightRange { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min > self.max
    }

    pub fn contains(&self, h: Height) -> bool {
        h >= self.min && h <= self.max
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.max - self.min + 1
        }
    }
}

/// Difficulty-adjustment configuration.
#[derive(Debug, Clone)]
pub struct DaConfig {
    /// Target seconds between blocks.
    pub target_s: u32,
    /// Distance between the two median windows.
    pub window_work: u32,
    /// Median window for the timestamp rule.
    pub window_median0: u32,
    /// Median window for the difficulty anchors.
    pub window_median1: u32,
    /// Damping mix numerator (applies from Fork-1).
    pub damp_m: u32,
    /// Damping mix denominator.
    pub damp_n: u32,
    /// Difficulty of the first blocks.
    pub difficulty0: Difficulty,
    /// Maximum allowed clock-ahead for incoming headers, seconds.
    pub max_ahead_s: u64,
}

/// Shielded pool configuration.
#[derive(Debug, Clone)]
pub struct ShieldedConfig {
    pub enabled: bool,
    /// Per-block shielded input cap.
    pub max_ins: u32,
    /// Per-block shielded output cap.
    pub max_outs: u32,
    /// How far behind the pool head a max-window anonymity set may trail.
    pub max_window_backlog: u64,
    pub proof_min: SigmaCfg,
    pub proof_max: SigmaCfg,
}

/// Confidential assets configuration.
#[derive(Debug, Clone)]
pub struct AssetConfig {
    /// Hard cap on concurrently existing assets.
    pub max_count: u32,
    /// Blocks an asset must stay untouched before it can be destroyed.
    pub lock_period: Height,
    /// Surjection proof window.
    pub proof_cfg: SigmaCfg,
}

/// The complete rule set a node runs under.
#[derive(Debug, Clone)]
pub struct Rules {
    /// Maximum depth of a reorganization.
    pub max_rollback: Height,
    /// Upper bound on perishable + eternal body size, bytes.
    pub max_body_size: usize,
    /// Kernel visibility horizon for relative locks and dup checks (Fork-2+).
    pub max_kernel_validity_dh: Height,
    /// Extra maturity of coinbase outputs.
    pub maturity_coinbase: Height,
    /// Per-block emission.
    pub emission_value0: u64,
    /// Expected hash of the treasury blob; `None` for chains without one.
    pub treasury_checksum: Option<Hash32>,
    /// Heights of the protocol upgrades; `forks[0]` is always genesis - 1.
    pub forks: [Height; 3],
    pub da: DaConfig,
    pub shielded: ShieldedConfig,
    pub assets: AssetConfig,
}

impl Rules {
    /// Mainnet parameters.
    pub fn mainnet() -> Self {
        Rules {
            max_rollback: 1440,
            max_body_size: 1024 * 1024,
            max_kernel_validity_dh: 1440 * 30,
            maturity_coinbase: 240,
            emission_value0: 80_0000_0000,
            treasury_checksum: None,
            forks: [0, 30_000, 200_000],
            da: DaConfig {
                target_s: 60,
                window_work: 120,
                window_median0: 25,
                window_median1: 7,
                damp_m: 1,
                damp_n: 3,
                difficulty0: Difficulty::from_parts(22, 0),
                max_ahead_s: 2 * 3600,
            },
            shielded: ShieldedConfig {
                enabled: true,
                max_ins: 20,
                max_outs: 30,
                max_window_backlog: 65_536,
                proof_min: SigmaCfg { n: 1024 },
                proof_max: SigmaCfg { n: 65_536 },
            },
            assets: AssetConfig {
                max_count: 1024,
                lock_period: 1440,
                proof_cfg: SigmaCfg { n: 128 },
            },
        }
    }

    /// Small-window parameters for tests: everything scaled down so whole
    /// sync scenarios run over a few dozen blocks.
    pub fn testing() -> Self {
        Rules {
            max_rollback: 8,
            max_body_size: 1024 * 1024,
            max_kernel_validity_dh: 50,
            maturity_coinbase: 2,
            emission_value0: 100,
            treasury_checksum: None,
            forks: [0, 2, 4],
            da: DaConfig {
                target_s: 60,
                window_work: 6,
                window_median0: 4,
                window_median1: 3,
                damp_m: 1,
                damp_n: 3,
                difficulty0: Difficulty::from_parts(2, 0),
                max_ahead_s: 2 * 3600,
            },
            shielded: ShieldedConfig {
                enabled: true,
                max_ins: 4,
                max_outs: 4,
                max_window_backlog: 64,
                proof_min: SigmaCfg { n: 2 },
                proof_max: SigmaCfg { n: 8 },
            },
            assets: AssetConfig {
                max_count: 4,
                lock_period: 3,
                proof_cfg: SigmaCfg { n: 4 },
            },
        }
    }

    /// Height of fork `i` (0-based; fork 0 is genesis).
    pub fn fork_height(&self, i: usize) -> Height {
        self.forks[i]
    }

    /// Hash chain over the rule set; one entry per fork. The last entry is
    /// the configuration checksum persisted in the DB.
    pub fn fork_hashes(&self) -> Vec<Hash32> {
        let mut h = Hasher::with_tag("mist.rules");
        h.write_u64(self.max_rollback);
        h.write_u64(self.max_body_size as u64);
        h.write_u64(self.maturity_coinbase);
        h.write_u64(self.emission_value0);
        h.write_u64(u64::from(self.da.target_s));
        h.write_u64(u64::from(self.da.difficulty0.0));
        h.write_u64(u64::from(self.shielded.max_ins));
        h.write_u64(u64::from(self.shielded.max_outs));
        h.write_u64(u64::from(self.assets.max_count));
        let mut cur = h.finalize();

        let mut out = Vec::with_capacity(self.forks.len());
        out.push(cur);
        for &fh in &self.forks[1..] {
            let mut hh = Hasher::with_tag("mist.fork");
            hh.write_hash(&cur);
            hh.write_u64(fh);
            cur = hh.finalize();
            out.push(cur);
        }
        out
    }

    /// The checksum of the last scheduled fork.
    pub fn last_fork_hash(&self) -> Hash32 {
        *self.fork_hashes().last().expect("at least genesis fork")
    }

    /// Find which fork a stored checksum belongs to.
    pub fn find_fork(&self, hv: &Hash32) -> Option<usize> {
        self.fork_hashes().iter().position(|h| h == hv)
    }

    /// Emission for one block.
    pub fn subsidy(&self, _h: Height) -> u64 {
        self.emission_value0
    }

    /// Total emission over an inclusive height range.
    pub fn subsidy_range(&self, hr: &HeightRange) -> u128 {
        u128::from(self.emission_value0) * u128::from(hr.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_hashes_are_chained_and_distinct() {
        let rules = Rules::testing();
        let hashes = rules.fork_hashes();
        assert_eq!(hashes.len(), 3);
        assert_ne!(hashes[0], hashes[1]);
        assert_ne!(hashes[1], hashes[2]);
        assert_eq!(rules.last_fork_hash(), hashes[2]);
        assert_eq!(rules.find_fork(&hashes[1]), Some(1));
        assert_eq!(rules.find_fork(&Hash32::ZERO), None);
    }

    #[test]
    fn height_range_basics() {
        let hr = HeightRange::new(5, 8);
        assert!(!hr.is_empty());
        assert_eq!(hr.len(), 4);
        assert!(hr.contains(5) && hr.contains(8));
        assert!(!hr.contains(9));
        assert!(HeightRange::new(3, 2).is_empty());
    }

    #[test]
    fn subsidy_range_scales() {
        let rules = Rules::testing();
        assert_eq!(
            rules.subsidy_range(&HeightRange::new(1, 10)),
            u128::from(rules.emission_value0) * 10
        );
        assert_eq!(rules.subsidy_range(&HeightRange::new(5, 4)), 0);
    }
}
