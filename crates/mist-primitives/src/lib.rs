//! # mist-primitives
//!
//! Core primitives for the Mist chain:
//! - BLAKE2b-256 hashing and the `Hash32` digest type
//! - Canonical wire encoding (`Encoder`/`Decoder`)
//! - Packed difficulty and `BigUint` chainwork
//! - Ristretto Pedersen commitments and generators
//! - Block headers, transaction vectors and the kernel tagged union
//! - Proof contracts and the batch verification context

pub mod commitment;
pub mod difficulty;
pub mod encode;
pub mod hash;
pub mod header;
pub mod proofs;
pub mod transaction;

pub use commitment::{
    asset_generator, commit, commit_asset, generator_g, generator_h, scalar_from_hash, EcPoint,
    Scalar,
};
pub use difficulty::{chainwork_from_bytes, chainwork_to_bytes, Difficulty};
pub use encode::{DecodeError, Decoder, Deserialize, Encoder, Serialize};
pub use hash::{hash_children, hash_of, Hash32, Hasher};
pub use header::{BlockHeader, Height};
pub use proofs::{
    verify_asset_proof, verify_range_proof, verify_spend_proof, AssetProof, BatchContext,
    PublicProof, RangeProof, SigmaAccumulator, SigmaCfg, SpendProof,
};
pub use transaction::{
    walk_kernels, AssetId, Block, Input, Kernel, KernelData, Output, RelativeLock, ShieldedTxo,
    Transaction, TxoId, FLAG_COINBASE, FLAG_NAKED_MASK, TXO_NAKED_MAX, TXO_NAKED_MIN,
};

/// Peer identity as seen by the processor; opaque 32 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub const ZERO: PeerId = PeerId([0u8; 32]);

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}
