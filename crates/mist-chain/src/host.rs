//! Host callbacks: everything the processor tells the outside world.

use crate::chain_db::StateId;
use mist_primitives::{Hash32, Height, PeerId, TxoId};

/// A header reference by height and hash, used in data requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockId {
    pub height: Height,
    pub hash: Hash32,
}

/// Egress surface of the processor. All methods default to no-ops so hosts
/// implement only what they route.
pub trait ProcessorHost {
    /// Ask peers for a header (`is_block == false`) or a block body, in the
    /// context of syncing toward `target`.
    fn request_data(&mut self, _id: &BlockId, _is_block: bool, _target: &StateId) {}

    /// A peer fed us data that failed deterministic validation.
    fn on_peer_insane(&mut self, _peer: &PeerId) {}

    /// The cursor moved to a new tip.
    fn on_new_state(&mut self) {}

    /// The active chain was rewound.
    fn on_rolled_back(&mut self) {}

    /// An event was appended to the log.
    fn on_event(&mut self, _height: Height, _body: &[u8]) {}

    /// Reserved for wallet integration: a dummy txo matured.
    fn on_dummy(&mut self, _txo_id: TxoId, _height: Height) {}

    /// Fast-sync finished (successfully or not) and normal processing resumed.
    fn on_fast_sync_over(&mut self) {}
}

/// Host that ignores everything; used by tools and tests.
#[derive(Debug, Default)]
pub struct NullHost;

impl ProcessorHost for NullHost {}
