//! # mist-chain
//!
//! The block processor of the Mist node.
//!
//! This crate provides:
//! - The chain database contract over the storage layer (state rows, txo
//!   store, kernel index, events, shielded uniqueness table, asset registry)
//! - The UTXO tree with its stamped on-disk image
//! - The MMR triple (states, shielded elements, assets) and kernel proofs
//! - The block interpretation engine with journalled rollback
//! - Congestion discovery, the fast-sync controller and reorg control
//! - Pruning: branch trimming, fossilization, txo compaction and stripping
//!
//! ## Architecture
//!
//! A single control thread owns all DB, UTXO-tree and MMR mutations.
//! Verification work (proof batches, sigma reductions, block summaries)
//! fans out over a worker pool and merges into accumulators inspected in
//! block order. See `Processor` for the entry points.

mod chain_db;
mod config;
mod congestion;
mod error;
mod host;
mod interpret;
mod mmr;
mod processor;
mod recent;
mod sync;
mod utxo;
mod verify;

pub use chain_db::{
    AssetRecord, ChainDb, ParamId, RowId, StateId, StateInput, StateRecord, FLAG_ACTIVE,
    FLAG_FUNCTIONAL, FLAG_REACHABLE,
};
pub use config::{Horizon, HorizonRange, StartParams};
pub use congestion::{CongestionCache, TipCongestion};
pub use error::{ChainError, ChainResult, DataStatus, TxStatus};
pub use host::{BlockId, NullHost, ProcessorHost};
pub use interpret::BlockInterpretCtx;
pub use mmr::{kernels_root, FlyMmr, MemMmrStore, MerkleProof, Mmr, MmrStore, ProofStep};
pub use processor::{encode_treasury, Cursor, Extra, Processor, SyncData};
pub use utxo::{UtxoKey, UtxoLeaf, UtxoTree};
pub use verify::{Executor, MultiAssetContext, MultiShieldedContext, MultiSigmaContext, SIGMA_CHUNK};
