//! Chain application scenarios: linear growth, reorgs, block serving,
//! shielded pool rules.

use crate::generators::{AssetPlan, BlockPlan, ChainGenerator};
use crate::harness::TestNode;
use mist_chain::{encode_treasury, DataStatus};
use mist_consensus::Rules;
use mist_primitives::{
    commit, generator_g, hash_of, Block, Deserialize, EcPoint, Kernel, Output, PeerId, RangeProof,
    Scalar, Serialize,
};
use std::sync::Arc;

fn rules() -> Arc<Rules> {
    Arc::new(Rules::testing())
}

fn mixed_plans() -> Vec<BlockPlan> {
    let mut plans = vec![BlockPlan::default(); 30];
    plans[4].shielded_outs = 1; // h5
    plans[5].shielded_outs = 1; // h6
    plans[6].shielded_spends = vec![0]; // h7
    plans[7].spend = 1; // h8
    plans[7].fee = 5;
    plans[10].spend = 2; // h11
    plans[12].asset = Some(AssetPlan::Create { owner_salt: 1 }); // h13
    plans[14].asset = Some(AssetPlan::Emit {
        id: 1,
        owner_salt: 1,
        value: 500,
    }); // h15
    plans
}

#[test]
fn linear_apply_advances_cursor_and_counters() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 11);
    for p in mixed_plans() {
        gen.gen_block(&p);
    }

    let mut node = TestNode::new(Arc::clone(&rules));
    let peer = PeerId([9u8; 32]);
    node.feed_chain(&gen.headers.clone(), &gen.blocks.clone(), &peer);

    assert_eq!(node.proc.cursor().sid.height, 30);
    assert!(node.log.0.lock().new_state >= 1);

    // ring covers the difficulty windows plus margin
    let ring = (rules.da.window_work + rules.da.window_median1).max(rules.da.window_median0)
        as usize
        + 5;
    assert_eq!(node.proc.recent_count(), ring.min(30));

    // txo accounting matches the per-state cursors
    let expect_txos = node.proc.get_txos_before(31).unwrap();
    assert_eq!(node.proc.extra().txos, expect_txos);

    // shielded pool: 2 outputs + 1 input in the element MMR
    assert_eq!(node.proc.shielded_mmr_count(), 3);
    assert_eq!(node.proc.extra().shielded_outputs, 2);

    // the unspent set matches the generator's wallet view
    let expected_unspent = gen.coins.len() as u64 + gen.asset_coins.len() as u64;
    assert_eq!(node.proc.utxo_id_count(), expected_unspent);

    // the node converged on the same state as the generator's own ledger
    let want = gen.ledger().live_digest().unwrap();
    assert_eq!(node.proc.live_digest().unwrap(), want);
    assert!(node.proc.test_definition().unwrap());
}

#[test]
fn kernel_proofs_verify_against_headers() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 13);
    for p in mixed_plans() {
        gen.gen_block(&p);
    }

    let mut node = TestNode::new(Arc::clone(&rules));
    node.feed_chain(&gen.headers.clone(), &gen.blocks.clone(), &gen.peer.clone());

    for h in [1usize, 7, 15, 30] {
        let krn = &gen.blocks[h - 1].kernels[0];
        let kid = krn.id();
        let (found_h, proof) = node
            .proc
            .get_kernel_proof(&kid)
            .unwrap()
            .expect("kernel indexed");
        assert_eq!(found_h, h as u64);
        assert_eq!(
            proof.apply(&kid),
            gen.headers[h - 1].kernels_root,
            "kernel proof verifies at height {h}"
        );
    }
}

#[test]
fn reorg_follows_heavier_branch() {
    let rules = rules();
    let plans = vec![BlockPlan::default(); 12];

    let mut a = ChainGenerator::new(Arc::clone(&rules), 42);
    for p in &plans {
        a.gen_block(p);
    }

    // sibling generator: identical prefix of 8, then a longer fork
    let mut b = ChainGenerator::new(Arc::clone(&rules), 42);
    for p in &plans[..8] {
        b.gen_block(p);
    }
    b.set_salt(1);
    b.gen_blocks(5); // heights 9..=13

    assert_eq!(a.headers[7].id(), b.headers[7].id(), "common prefix");
    assert_ne!(a.headers[8].id(), b.headers[8].id(), "fork diverges");

    let mut node = TestNode::new(Arc::clone(&rules));
    let peer = PeerId([1u8; 32]);
    node.feed_chain(&a.headers.clone(), &a.blocks.clone(), &peer);
    assert_eq!(node.proc.cursor().sid.height, 12);
    let digest_a = node.proc.live_digest().unwrap();

    // the heavier branch arrives
    node.feed_chain(&b.headers[8..].to_vec(), &b.blocks[8..].to_vec(), &peer);

    assert_eq!(node.proc.cursor().sid.height, 13);
    assert_eq!(node.proc.cursor().id_hash, b.headers[12].id());
    assert!(node.log.0.lock().rolled_back >= 1, "a rewind happened");

    let want = b.ledger().live_digest().unwrap();
    let got = node.proc.live_digest().unwrap();
    assert_eq!(got, want, "state matches a fresh apply of the new branch");
    assert_ne!(got, digest_a);
    assert!(node.proc.test_definition().unwrap());
}

#[test]
fn extract_block_round_trips() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 17);
    let mut plans = vec![BlockPlan::default(); 10];
    plans[6].spend = 1;
    for p in &plans {
        gen.gen_block(p);
    }

    let mut node = TestNode::new(Arc::clone(&rules));
    node.feed_chain(&gen.headers.clone(), &gen.blocks.clone(), &gen.peer.clone());

    for h in 1..=10u64 {
        let sid = mist_chain::StateId {
            row: node.proc.find_active_row(h).unwrap(),
            height: h,
        };

        let extracted = node
            .proc
            .extract_block_with_extra(&sid)
            .unwrap()
            .expect("active block extractable");
        let original = &gen.blocks[h as usize - 1];

        assert_eq!(extracted.offset, original.offset, "offset at {h}");
        assert_eq!(extracted.kernels, original.kernels, "kernels at {h}");
        assert_eq!(extracted.outputs, original.outputs, "outputs at {h}");
        assert_eq!(
            extracted
                .inputs
                .iter()
                .map(|i| i.commitment)
                .collect::<Vec<_>>(),
            original
                .inputs
                .iter()
                .map(|i| i.commitment)
                .collect::<Vec<_>>(),
            "inputs at {h}"
        );
        // maturities were reconstructed, not zero
        for inp in &extracted.inputs {
            assert!(inp.maturity > 0);
        }
    }
}

#[test]
fn treasury_bootstraps_the_txo_store() {
    // two proof-carrying outputs and one kernel; the offset is opaque here,
    // the checksum is what pins the content
    let mut group = Block::empty();
    for v in [1000u64, 2500] {
        let comm = EcPoint::from_point(&commit(v, &Scalar::from(v + 7)));
        let mut out = Output::new(comm);
        out.confidential = Some(RangeProof::sign(&comm));
        group.outputs.push(out);
    }
    group.kernels.push(Kernel::std(
        EcPoint::from_point(&(Scalar::from(11u64) * generator_g())),
        0,
    ));

    let blob = encode_treasury(&[group]);
    let mut rules = Rules::testing();
    rules.treasury_checksum = Some(hash_of(&blob));
    let rules = Arc::new(rules);

    let mut node = TestNode::new(Arc::clone(&rules));
    assert!(!node.proc.is_treasury_handled());

    assert_eq!(node.proc.on_treasury(b"junk").unwrap(), DataStatus::Invalid);
    assert_eq!(node.proc.on_treasury(&blob).unwrap(), DataStatus::Accepted);

    assert!(node.proc.is_treasury_handled());
    assert_eq!(node.proc.extra().txos_treasury, 3); // 2 outputs + gap slot
    assert_eq!(node.proc.utxo_id_count(), 2);
    assert_eq!(node.proc.get_txos_before(1).unwrap(), 3);

    // a second delivery is not useful
    assert_eq!(node.proc.on_treasury(&blob).unwrap(), DataStatus::Rejected);
}

#[test]
fn naked_rewrite_preserves_commitment() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 23);
    gen.gen_blocks(3);

    let node = TestNode::new(Arc::clone(&rules));

    for out in gen.blocks.iter().flat_map(|b| &b.outputs) {
        let bytes = out.to_bytes();
        let naked = node.proc.txo_to_naked(&bytes).unwrap();
        assert!(node.proc.txo_is_naked(&naked));
        let decoded = Output::from_bytes(&naked).unwrap();
        assert_eq!(decoded.commitment, out.commitment);
        assert_eq!(decoded.coinbase, out.coinbase);
        assert!(decoded.confidential.is_none());
    }
}

#[test]
fn duplicate_shielded_output_rejected_and_state_unchanged() {
    let rules = rules();
    let mut gen = ChainGenerator::new(Arc::clone(&rules), 29);
    let mut plans = vec![BlockPlan::default(); 5];
    plans[4].shielded_outs = 1; // h5 introduces the serial
    for p in &plans {
        gen.gen_block(p);
    }

    let mut node = TestNode::new(Arc::clone(&rules));
    let peer = PeerId([3u8; 32]);
    node.feed_chain(&gen.headers.clone(), &gen.blocks.clone(), &peer);
    assert_eq!(node.proc.cursor().sid.height, 5);

    let digest = node.proc.live_digest().unwrap();
    let mmr_count = node.proc.shielded_mmr_count();

    // a sixth block reusing the same serial pub key
    let bad_peer = PeerId([66u8; 32]);
    let (hdr, blk) = gen.build_shielded_duplicate(0);
    node.feed_header(&hdr, &bad_peer);
    node.feed_block(&hdr, &blk, &bad_peer);
    node.proc.try_go_up().unwrap();

    // the apply failed; the chain and the pool are untouched
    assert_eq!(node.proc.cursor().sid.height, 5);
    assert_eq!(node.proc.live_digest().unwrap(), digest);
    assert_eq!(node.proc.shielded_mmr_count(), mmr_count);
    assert!(node.proc.test_definition().unwrap());

    // the submitter is identifiable and blamed
    assert_eq!(node.log.0.lock().insane, vec![bad_peer]);
}
