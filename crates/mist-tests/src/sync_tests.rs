//! Fast-sync scenarios: target acquisition, sparse accumulation, the
//! aggregate close at TxoLo, and the failure recovery path.

use crate::generators::{BlockPlan, ChainGenerator};
use crate::harness::TestNode;
use mist_chain::{Horizon, HorizonRange};
use mist_consensus::Rules;
use mist_primitives::{PeerId, Scalar};
use std::sync::Arc;

fn rules() -> Arc<Rules> {
    Arc::new(Rules::testing())
}

/// Horizon profile that triggers fast-sync on a 40-block chain:
/// sync = {lo: 24, hi: 8} -> target 32, TxoLo 16.
fn sync_horizon(rules: &Rules) -> Horizon {
    let mut hz = Horizon {
        branching: 2,
        sync: HorizonRange { lo: 24, hi: 8 },
        local: HorizonRange {
            lo: 10_000,
            hi: 16,
        },
    };
    hz.normalize(rules);
    hz
}

/// A 40-block chain with no spends below TxoLo (sparse blocks may only
/// reference txos known at h0) and ordinary activity above it.
fn sync_chain(rules: &Arc<Rules>, seed: u64) -> ChainGenerator {
    let mut gen = ChainGenerator::new(Arc::clone(rules), seed);
    let mut plans = vec![BlockPlan::default(); 40];
    for p in plans.iter_mut().skip(19).step_by(3) {
        p.spend = 1; // spends from height 20 on
    }
    for p in &plans {
        gen.gen_block(p);
    }
    gen
}

#[test]
fn fast_sync_target_acquisition() {
    let rules = rules();
    let gen = sync_chain(&rules, 51);

    let mut node = TestNode::with_horizon(Arc::clone(&rules), sync_horizon(&rules));
    let peer = PeerId([4u8; 32]);
    for h in &gen.headers {
        node.feed_header(h, &peer);
    }

    node.proc.enum_congestions().unwrap();

    let sync = node.proc.sync_data().expect("fast-sync engaged").clone();
    assert_eq!(sync.h0, 0);
    assert_eq!(sync.txo_lo, 16);
    assert_eq!(sync.target.height, 32);

    // the enumerator asked for the earliest missing block
    let log = node.log.0.lock();
    assert!(log.requests.contains(&(1, true)), "block request from height 1");
}

#[test]
fn fast_sync_happy_path() {
    let rules = rules();
    let mut gen = sync_chain(&rules, 53);

    let mut node = TestNode::with_horizon(Arc::clone(&rules), sync_horizon(&rules));
    let peer = PeerId([4u8; 32]);
    for h in &gen.headers {
        node.feed_header(h, &peer);
    }
    node.proc.enum_congestions().unwrap();
    assert!(node.proc.is_fast_sync());

    for (h, b) in gen.headers.clone().iter().zip(gen.blocks.clone().iter()) {
        node.feed_block(h, b, &peer);
    }
    node.proc.try_go_up().unwrap();

    assert_eq!(node.proc.cursor().sid.height, 40);
    assert!(node.proc.sync_data().is_none(), "sync data cleared");
    assert_eq!(node.log.0.lock().fast_sync_over, 1);

    // horizons caught up at the target
    assert_eq!(node.proc.extra().fossil, 32);
    assert_eq!(node.proc.extra().txo_hi, 32);
    assert_eq!(node.proc.extra().txo_lo, 16);

    assert!(node.proc.test_definition().unwrap());
    let want = gen.ledger().live_digest().unwrap();
    assert_eq!(node.proc.live_digest().unwrap(), want);

    // nobody got blamed on the happy path
    assert!(node.log.0.lock().insane.is_empty());
}

#[test]
fn fast_sync_fails_on_tampered_sparse_offset() {
    let rules = rules();
    let gen = sync_chain(&rules, 57);

    let mut node = TestNode::with_horizon(Arc::clone(&rules), sync_horizon(&rules));
    let peer = PeerId([4u8; 32]);
    for h in &gen.headers {
        node.feed_header(h, &peer);
    }
    node.proc.enum_congestions().unwrap();
    assert!(node.proc.is_fast_sync());

    // flip the base offset of one sparse block (height 10)
    let mut blocks = gen.blocks.clone();
    blocks[9].offset += Scalar::ONE;

    for (h, b) in gen.headers.iter().zip(blocks.iter()) {
        node.feed_block(h, b, &peer);
    }
    node.proc.try_go_up().unwrap();

    // the aggregate close at TxoLo failed: rollback to h0, lower TxoLo
    assert_eq!(node.proc.cursor().sid.height, 0);
    let sync = node.proc.sync_data().expect("sync still pending").clone();
    assert_eq!(sync.txo_lo, 0, "TxoLo lowered for the retry");

    // the culprit cannot be attributed; no peer is banned
    assert!(node.log.0.lock().insane.is_empty());
}

#[test]
fn reopen_preserves_synced_state() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 59);
    gen.gen_blocks(12);

    let mut node = TestNode::new(Arc::clone(&rules));
    node.feed_chain(&gen.headers.clone(), &gen.blocks.clone(), &gen.peer.clone());
    assert_eq!(node.proc.cursor().sid.height, 12);
    let digest = node.proc.live_digest().unwrap();
    node.proc.commit_db().unwrap();

    let mut node = node.reopen(Arc::clone(&rules), Horizon::infinite());
    assert_eq!(node.proc.cursor().sid.height, 12);
    assert_eq!(node.proc.live_digest().unwrap(), digest);
    assert!(node.proc.test_definition().unwrap());
}
