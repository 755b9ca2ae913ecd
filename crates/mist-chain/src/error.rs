//! Error types and status codes of the block processor.

use thiserror::Error;

/// Chain processing errors.
///
/// `Corruption` is fatal: it means a structural invariant of the persisted
/// state does not hold. It propagates out of the processor uncaught; the
/// pending UTXO image stamp is never written, so a restart rebuilds from
/// the last committed state.
#[derive(Error, Debug)]
pub enum ChainError {
    /// Storage error.
    #[error("Storage error: {0}")]
    Storage(#[from] mist_storage::StorageError),

    /// Wire decoding error on persisted data.
    #[error("Decode error: {0}")]
    Decode(#[from] mist_primitives::DecodeError),

    /// Consensus configuration error.
    #[error("Consensus error: {0}")]
    Consensus(#[from] mist_consensus::ConsensusError),

    /// UTXO image file error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural invariant violation in node data.
    #[error("Corruption: {0}")]
    Corruption(&'static str),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Shorthand constructor for corruption errors.
pub fn corrupt(what: &'static str) -> ChainError {
    ChainError::Corruption(what)
}

/// Outcome of an ingress call (`on_state`, `on_block`, `on_treasury`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStatus {
    /// Stored; may advance the chain.
    Accepted,
    /// Valid but not useful (duplicate, already present).
    Rejected,
    /// Fails validation; the sender may be penalized.
    Invalid,
    /// Below the lowest return height; silently not useful.
    Unreachable,
}

/// Outcome of loose-transaction context validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Ok,
    /// Kernel or height context is invalid.
    InvalidContext,
    /// An input UTXO (transparent or shielded) is missing or invalid.
    InvalidInput,
    /// Shielded per-block limits would be exceeded.
    LimitExceeded,
}
