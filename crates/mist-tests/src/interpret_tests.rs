//! Interpretation engine properties: forward/backward identity, the asset
//! lifecycle with journalled undo, loose-transaction context validation.

use crate::generators::{AssetPlan, BlockPlan, ChainGenerator};
use crate::harness::TestNode;
use mist_consensus::{HeightRange, Rules, MAX_ASSET_VALUE};
use mist_chain::TxStatus;
use mist_primitives::{
    commit, generator_g, Block, EcPoint, Input, Kernel, KernelData, PeerId, RangeProof, Scalar,
    ShieldedTxo,
};
use std::sync::Arc;

fn rules() -> Arc<Rules> {
    Arc::new(Rules::testing())
}

#[test]
fn forward_then_backward_is_identity() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 71);
    let mut plans = vec![BlockPlan::default(); 8];
    plans[4].shielded_outs = 1;
    plans[6].spend = 1;
    for p in &plans[..7] {
        gen.gen_block(p);
    }

    let mut node = TestNode::new(Arc::clone(&rules));
    node.feed_chain(
        &gen.headers.clone(),
        &gen.blocks.clone(),
        &gen.peer.clone(),
    );
    assert_eq!(node.proc.cursor().sid.height, 7);

    let digest = node.proc.live_digest().unwrap();
    let txos = node.proc.extra().txos;
    let leaves = node.proc.utxo_leaf_count();
    let shielded = node.proc.shielded_mmr_count();

    // apply one more block, then rewind it
    gen.gen_block(&plans[7]);
    node.feed_chain(
        &gen.headers[7..].to_vec(),
        &gen.blocks[7..].to_vec(),
        &gen.peer.clone(),
    );
    assert_eq!(node.proc.cursor().sid.height, 8);

    node.proc.rollback_to(7).unwrap();

    assert_eq!(node.proc.cursor().sid.height, 7);
    assert_eq!(node.proc.live_digest().unwrap(), digest);
    assert_eq!(node.proc.extra().txos, txos);
    assert_eq!(node.proc.utxo_leaf_count(), leaves);
    assert_eq!(node.proc.shielded_mmr_count(), shielded);
    assert!(node.proc.test_definition().unwrap());
    assert_eq!(node.log.0.lock().rolled_back, 1);
}

#[test]
fn asset_lifecycle_and_rollback_restores_registry() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 73);
    let mut plans = vec![BlockPlan::default(); 8];
    plans[0].asset = Some(AssetPlan::Create { owner_salt: 5 }); // h1, lock 1
    plans[2].asset = Some(AssetPlan::Emit {
        id: 1,
        owner_salt: 5,
        value: 100,
    }); // h3, lock flips to 3
    plans[5].asset = Some(AssetPlan::Emit {
        id: 1,
        owner_salt: 5,
        value: -100,
    }); // h6, back to zero, lock 6
    for p in &plans[..6] {
        gen.gen_block(p);
    }

    let mut node = TestNode::new(Arc::clone(&rules));
    node.feed_chain(
        &gen.headers.clone(),
        &gen.blocks.clone(),
        &gen.peer.clone(),
    );

    let asset = node.proc.get_asset(1).unwrap().expect("asset exists");
    assert_eq!(asset.value, 0);
    assert_eq!(asset.lock_height, 6);

    // value zero and lock period (3) elapsed at h9
    gen.gen_blocks(2); // h7, h8
    gen.gen_block(&BlockPlan {
        asset: Some(AssetPlan::Destroy {
            id: 1,
            owner_salt: 5,
        }),
        ..Default::default()
    }); // h9
    node.feed_chain(
        &gen.headers[6..].to_vec(),
        &gen.blocks[6..].to_vec(),
        &gen.peer.clone(),
    );
    assert_eq!(node.proc.cursor().sid.height, 9);
    assert!(node.proc.get_asset(1).unwrap().is_none(), "destroyed");

    // the journal restores the metadata and lock height on rewind
    node.proc.rollback_to(8).unwrap();
    let restored = node.proc.get_asset(1).unwrap().expect("asset restored");
    assert_eq!(restored.metadata, 5u64.to_le_bytes().to_vec());
    assert_eq!(restored.lock_height, 6);
    assert!(node.proc.test_definition().unwrap());
}

#[test]
fn asset_emit_overflow_rejected() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 79);
    let mut plans = vec![BlockPlan::default(); 2];
    plans[0].asset = Some(AssetPlan::Create { owner_salt: 9 }); // h1
    plans[1].asset = Some(AssetPlan::Emit {
        id: 1,
        owner_salt: 9,
        value: i64::MAX,
    }); // h2: at the cap
    for p in &plans {
        gen.gen_block(p);
    }

    let mut node = TestNode::new(Arc::clone(&rules));
    let peer = PeerId([8u8; 32]);
    node.feed_chain(&gen.headers.clone(), &gen.blocks.clone(), &peer);
    assert_eq!(
        node.proc.get_asset(1).unwrap().unwrap().value,
        MAX_ASSET_VALUE
    );
    let digest = node.proc.live_digest().unwrap();

    // +2 over the cap must be rejected, state unchanged
    let bad_peer = PeerId([99u8; 32]);
    let (hdr, blk) = gen.build_asset_emit(1, 9, 2);
    node.feed_header(&hdr, &bad_peer);
    node.feed_block(&hdr, &blk, &bad_peer);
    node.proc.try_go_up().unwrap();

    assert_eq!(node.proc.cursor().sid.height, 2);
    assert_eq!(
        node.proc.get_asset(1).unwrap().unwrap().value,
        MAX_ASSET_VALUE
    );
    assert_eq!(node.proc.live_digest().unwrap(), digest);
    assert!(node.proc.test_definition().unwrap());
    assert_eq!(node.log.0.lock().insane, vec![bad_peer]);
}

#[test]
fn events_truncate_on_rollback() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 89);
    gen.gen_blocks(3);

    let mut node = TestNode::new(Arc::clone(&rules));
    node.feed_chain(
        &gen.headers.clone(),
        &gen.blocks.clone(),
        &gen.peer.clone(),
    );

    node.proc.add_event(3, b"watch", b"spent").unwrap();
    assert_eq!(
        node.proc.find_events(b"watch").unwrap(),
        vec![(3, b"spent".to_vec())]
    );
    assert_eq!(node.log.0.lock().events, vec![(3, b"spent".to_vec())]);

    node.proc.rollback_to(2).unwrap();
    assert!(node.proc.find_events(b"watch").unwrap().is_empty());
}

#[test]
fn validate_tx_context_statuses() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 83);
    gen.gen_blocks(6);

    let mut node = TestNode::new(Arc::clone(&rules));
    node.feed_chain(
        &gen.headers.clone(),
        &gen.blocks.clone(),
        &gen.peer.clone(),
    );

    let hr = HeightRange::new(1, 1000);

    // a simple spend of an existing mature coin
    let coin = gen.coins.first().expect("mature coin").clone();
    let mut tx = Block::empty();
    tx.inputs.push(Input::new(coin.commitment));
    tx.kernels.push(Kernel::std(
        EcPoint::from_point(&(Scalar::from(3u64) * generator_g())),
        1,
    ));
    assert_eq!(
        node.proc.validate_tx_context(&tx, &hr, true).unwrap(),
        TxStatus::Ok
    );

    // unknown input commitment
    let mut tx_bad = tx.clone();
    tx_bad.inputs[0] = Input::new(EcPoint::from_point(&commit(1, &Scalar::from(12345u64))));
    assert_eq!(
        node.proc.validate_tx_context(&tx_bad, &hr, true).unwrap(),
        TxStatus::InvalidInput
    );

    // height window that excludes the next block
    let stale = HeightRange::new(1, 2);
    assert_eq!(
        node.proc.validate_tx_context(&tx, &stale, true).unwrap(),
        TxStatus::InvalidContext
    );

    // over the shielded output limit
    let mut tx_many = Block::empty();
    for i in 0..=rules.shielded.max_outs {
        let b = Scalar::from(1000 + u64::from(i));
        let comm = EcPoint::from_point(&commit(0, &b));
        tx_many.kernels.push(Kernel {
            excess: EcPoint::from_point(&(b * generator_g())),
            fee: 0,
            data: KernelData::ShieldedOutput {
                txo: ShieldedTxo {
                    serial_pub: EcPoint::from_point(&(Scalar::from(500 + u64::from(i)) * generator_g())),
                    commitment: comm,
                    range_proof: RangeProof::sign(&comm),
                    asset_proof: None,
                },
            },
            nested: Vec::new(),
        });
    }
    assert_eq!(
        node.proc.validate_tx_context(&tx_many, &hr, true).unwrap(),
        TxStatus::LimitExceeded
    );

    // duplicate kernel within one transaction (past Fork-2)
    let krn = Kernel::std(
        EcPoint::from_point(&(Scalar::from(77u64) * generator_g())),
        0,
    );
    let mut tx_dup = Block::empty();
    tx_dup.kernels.push(krn.clone());
    tx_dup.kernels.push(krn);
    assert_eq!(
        node.proc.validate_tx_context(&tx_dup, &hr, true).unwrap(),
        TxStatus::InvalidContext
    );
}
