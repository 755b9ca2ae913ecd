//! # mist-consensus
//!
//! Consensus rules for the Mist chain.
//!
//! This crate provides:
//! - The `Rules` parameter set (fork schedule, difficulty adjustment,
//!   shielded and asset limits, emission)
//! - Transaction summary validation and the Mimblewimble balance law
//!
//! Difficulty retargeting solves `new = work_delta * dt_target /
//! (height_delta * dt_source)` over two windowed medians; the medians
//! themselves are computed by the block processor, which owns the header
//! cache.

mod context;
mod error;
mod params;

pub use context::{TxContext, TxContextParams};
pub use error::{ConsensusError, ConsensusResult};
pub use params::{
    AssetConfig, DaConfig, HeightRange, Rules, ShieldedConfig, HEIGHT_GENESIS, MAX_ASSET_VALUE,
};
