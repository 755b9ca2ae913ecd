//! Error types for consensus rules.

use thiserror::Error;

/// Consensus errors.
#[derive(Error, Debug)]
pub enum ConsensusError {
    /// Stored configuration belongs to a different rule set.
    #[error("Incompatible chain configuration: {0}")]
    IncompatibleConfig(String),

    /// A fork that already passed on this chain is missing from the rules.
    #[error("Fork mismatch at height {0}")]
    ForkMismatch(u64),
}

/// Result type for consensus operations.
pub type ConsensusResult<T> = Result<T, ConsensusError>;
