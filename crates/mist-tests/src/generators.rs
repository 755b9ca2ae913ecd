//! Deterministic chain generator.
//!
//! Builds fully valid blocks (balanced commitments, signed proofs, correct
//! headers) from seeded scalars, tracking its own ledger on a private
//! processor so headers carry the right definition, difficulty and
//! chainwork. Same seed, salt and plans produce byte-identical chains,
//! which is what the fork tests rely on.

use mist_chain::{kernels_root, NullHost, Horizon, Processor, StartParams};
use mist_consensus::Rules;
use mist_primitives::{
    commit, generator_g, asset_generator, AssetProof, Block, BlockHeader, EcPoint, Hash32, Hasher,
    Height, Input, Kernel, KernelData, Output, PeerId, RangeProof, Scalar, ShieldedTxo, SpendProof,
};
use curve25519_dalek::RistrettoPoint;
use std::sync::Arc;
use tempfile::TempDir;

/// A transparent coin the generator can spend.
#[derive(Debug, Clone)]
pub struct TrackedCoin {
    pub value: u64,
    pub blinding: Scalar,
    pub commitment: EcPoint,
    /// Leaf maturity; spendable at heights strictly above it.
    pub maturity: Height,
}

/// A confidential-asset coin.
#[derive(Debug, Clone)]
pub struct TrackedAssetCoin {
    pub asset_id: u32,
    pub value: u64,
    pub blinding: Scalar,
    pub commitment: EcPoint,
    pub maturity: Height,
}

/// A shielded pool entry the generator owns.
#[derive(Debug, Clone)]
pub struct TrackedShielded {
    pub serial_pub: EcPoint,
    pub spend_pk: EcPoint,
    pub value: u64,
    pub spent: bool,
}

/// Asset operation for one block.
#[derive(Debug, Clone)]
pub enum AssetPlan {
    Create { owner_salt: u64 },
    Emit { id: u32, owner_salt: u64, value: i64 },
    Destroy { id: u32, owner_salt: u64 },
}

/// What goes into the next block besides the coinbase.
#[derive(Debug, Clone, Default)]
pub struct BlockPlan {
    /// Spend up to this many mature coins into fresh outputs.
    pub spend: usize,
    /// Move this many mature coins into the shielded pool.
    pub shielded_outs: usize,
    /// Spend these entries of the generator's shielded list.
    pub shielded_spends: Vec<usize>,
    pub asset: Option<AssetPlan>,
    /// Fee paid by the first spend and claimed by the coinbase.
    pub fee: u64,
}

pub struct ChainGenerator {
    pub rules: Arc<Rules>,
    proc: Processor,
    _tmp: TempDir,
    pub headers: Vec<BlockHeader>,
    pub blocks: Vec<Block>,
    pub coins: Vec<TrackedCoin>,
    pub asset_coins: Vec<TrackedAssetCoin>,
    pub shielded: Vec<TrackedShielded>,
    /// Pool entry points in pool order (commitment + serial).
    pub pool: Vec<RistrettoPoint>,
    pub peer: PeerId,
    seed: u64,
    salt: u64,
    counter: u64,
    base_ts: u64,
}

impl ChainGenerator {
    pub fn new(rules: Arc<Rules>, seed: u64) -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let proc = Processor::open(
            tmp.path(),
            Arc::clone(&rules),
            Horizon::infinite(),
            Box::new(NullHost),
            &StartParams::default(),
        )
        .expect("open generator ledger");

        ChainGenerator {
            rules,
            proc,
            _tmp: tmp,
            headers: Vec::new(),
            blocks: Vec::new(),
            coins: Vec::new(),
            asset_coins: Vec::new(),
            shielded: Vec::new(),
            pool: Vec::new(),
            peer: PeerId([7u8; 32]),
            seed,
            salt: 0,
            counter: 0,
            base_ts: 1_600_000_000,
        }
    }

    /// Change the scalar stream; blocks generated after this diverge from a
    /// sibling generator with the same seed.
    pub fn set_salt(&mut self, salt: u64) {
        self.salt = salt;
    }

    pub fn height(&self) -> Height {
        self.proc.cursor().sid.height
    }

    pub fn ledger(&mut self) -> &mut Processor {
        &mut self.proc
    }

    fn next_scalar(&mut self) -> Scalar {
        let mut h = Hasher::with_tag("mist.test.scalar");
        h.write_u64(self.seed);
        h.write_u64(self.salt);
        h.write_u64(self.counter);
        self.counter += 1;
        mist_primitives::scalar_from_hash(&h.finalize())
    }

    fn owner_key(&self, owner_salt: u64) -> (Scalar, EcPoint) {
        let mut h = Hasher::with_tag("mist.test.owner");
        h.write_u64(self.seed);
        h.write_u64(owner_salt);
        let sk = mist_primitives::scalar_from_hash(&h.finalize());
        (sk, EcPoint::from_point(&(sk * generator_g())))
    }

    fn take_mature_coin(&mut self, h: Height) -> Option<TrackedCoin> {
        let i = self.coins.iter().position(|c| c.maturity < h)?;
        Some(self.coins.remove(i))
    }

    fn signed_output(commitment: RistrettoPoint, coinbase: bool) -> Output {
        let pt = EcPoint::from_point(&commitment);
        let mut out = Output::new(pt);
        out.coinbase = coinbase;
        out.confidential = Some(RangeProof::sign(&pt));
        out
    }

    /// Build the next block body according to the plan. Updates the tracked
    /// wallet state; the block still has to be applied via `seal`.
    fn build(&mut self, plan: &BlockPlan) -> Block {
        let h = self.height() + 1;
        let subsidy = self.rules.subsidy(h);
        let coinbase_maturity = self.rules.maturity_coinbase;

        let mut block = Block::empty();
        let mut offset = Scalar::ZERO;
        let mut new_coins: Vec<TrackedCoin> = Vec::new();

        // coinbase claims the subsidy plus the planned fee
        {
            let b = self.next_scalar();
            let e = self.next_scalar();
            let value = subsidy + plan.fee;
            let comm = commit(value, &b);
            let out = Self::signed_output(comm, true);
            let maturity = out.min_maturity(h, coinbase_maturity);
            block.outputs.push(out);
            block
                .kernels
                .push(Kernel::std(EcPoint::from_point(&(e * generator_g())), 0));
            offset += b - e;
            new_coins.push(TrackedCoin {
                value,
                blinding: b,
                commitment: EcPoint::from_point(&comm),
                maturity,
            });
        }

        // transparent spends
        let mut fee_left = plan.fee;
        for _ in 0..plan.spend {
            let Some(coin) = self.take_mature_coin(h) else { break };
            block.inputs.push(Input::new(coin.commitment));

            let value = coin.value - fee_left;
            let b = self.next_scalar();
            let e = self.next_scalar();
            let comm = commit(value, &b);
            let out = Self::signed_output(comm, false);
            let maturity = out.min_maturity(h, coinbase_maturity);
            block.outputs.push(out);

            block
                .kernels
                .push(Kernel::std(EcPoint::from_point(&(e * generator_g())), fee_left));

            offset += b - coin.blinding - e;
            fee_left = 0;
            new_coins.push(TrackedCoin {
                value,
                blinding: b,
                commitment: EcPoint::from_point(&comm),
                maturity,
            });
        }

        // shielded outputs: transparent coins enter the pool
        for _ in 0..plan.shielded_outs {
            let Some(coin) = self.take_mature_coin(h) else { break };
            block.inputs.push(Input::new(coin.commitment));

            let serial_sk = self.next_scalar();
            let serial_pub = EcPoint::from_point(&(serial_sk * generator_g()));
            let spend_pk = EcPoint::from_point(&((serial_sk + Scalar::ONE) * generator_g()));
            let b = self.next_scalar();
            let e = self.next_scalar();
            let comm = commit(coin.value, &b);
            let comm_pt = EcPoint::from_point(&comm);

            let txo = ShieldedTxo {
                serial_pub,
                commitment: comm_pt,
                range_proof: RangeProof::sign(&comm_pt),
                asset_proof: None,
            };
            block.kernels.push(Kernel {
                excess: EcPoint::from_point(&(e * generator_g())),
                fee: 0,
                data: KernelData::ShieldedOutput { txo },
                nested: Vec::new(),
            });

            offset += b - coin.blinding - e;

            self.pool
                .push(comm + serial_pub.decompress().expect("serial point"));
            self.shielded.push(TrackedShielded {
                serial_pub,
                spend_pk,
                value: coin.value,
                spent: false,
            });
        }

        // shielded spends: pool entries come back out
        for &idx in &plan.shielded_spends {
            let (spend_pk, value) = {
                let sh = &self.shielded[idx];
                assert!(!sh.spent, "double spend in plan");
                (sh.spend_pk, sh.value)
            };
            self.shielded[idx].spent = true;

            let cfg = self.rules.shielded.proof_min;
            let n = cfg.get_n() as usize;
            let window_end = self.pool.len() as u64;
            assert!(window_end >= n as u64, "pool too small for the proof cfg");
            let window: Vec<RistrettoPoint> = self.pool[(window_end as usize - n)..].to_vec();

            let proof_seed = self.next_scalar();
            let spend_proof =
                SpendProof::create(spend_pk, window_end, cfg, &window, &proof_seed);

            let b_v = self.next_scalar();
            let b_o = self.next_scalar();
            let e = self.next_scalar();
            let value_commitment = EcPoint::from_point(&commit(value, &b_v));

            let comm = commit(value, &b_o);
            let out = Self::signed_output(comm, false);
            let maturity = out.min_maturity(h, coinbase_maturity);
            block.outputs.push(out);

            block.kernels.push(Kernel {
                excess: EcPoint::from_point(&(e * generator_g())),
                fee: 0,
                data: KernelData::ShieldedInput {
                    value_commitment,
                    spend_proof,
                },
                nested: Vec::new(),
            });

            offset += b_o - b_v - e;
            new_coins.push(TrackedCoin {
                value,
                blinding: b_o,
                commitment: EcPoint::from_point(&comm),
                maturity,
            });
        }

        // asset operations
        match &plan.asset {
            None => {}
            Some(AssetPlan::Create { owner_salt }) => {
                let (_, owner) = self.owner_key(*owner_salt);
                let e = self.next_scalar();
                block.kernels.push(Kernel {
                    excess: EcPoint::from_point(&(e * generator_g())),
                    fee: 0,
                    data: KernelData::AssetCreate {
                        owner,
                        metadata: owner_salt.to_le_bytes().to_vec(),
                    },
                    nested: Vec::new(),
                });
                offset -= e;
            }
            Some(AssetPlan::Emit {
                id,
                owner_salt,
                value,
            }) => {
                let (_, owner) = self.owner_key(*owner_salt);
                let e = self.next_scalar();
                block.kernels.push(Kernel {
                    excess: EcPoint::from_point(&(e * generator_g())),
                    fee: 0,
                    data: KernelData::AssetEmit {
                        asset_id: *id,
                        owner,
                        value: *value,
                    },
                    nested: Vec::new(),
                });

                if *value >= 0 {
                    // mint into a fresh asset output
                    let b = self.next_scalar();
                    let comm =
                        b * generator_g() + Scalar::from(*value as u64) * asset_generator(*id);
                    let pt = EcPoint::from_point(&comm);
                    let mut out = Output::new(pt);
                    out.confidential = Some(RangeProof::sign(&pt));
                    out.asset_proof = Some(AssetProof::create(
                        0,
                        self.rules.assets.proof_cfg,
                        &self.next_scalar(),
                    ));
                    let maturity = out.min_maturity(h, coinbase_maturity);
                    block.outputs.push(out);
                    offset += b - e;
                    self.asset_coins.push(TrackedAssetCoin {
                        asset_id: *id,
                        value: *value as u64,
                        blinding: b,
                        commitment: pt,
                        maturity,
                    });
                } else {
                    // burn a tracked asset coin
                    let i = self
                        .asset_coins
                        .iter()
                        .position(|c| {
                            c.asset_id == *id
                                && c.value == value.unsigned_abs()
                                && c.maturity < h
                        })
                        .expect("asset coin to burn");
                    let coin = self.asset_coins.remove(i);
                    block.inputs.push(Input::new(coin.commitment));
                    offset -= coin.blinding + e;
                }
            }
            Some(AssetPlan::Destroy { id, owner_salt }) => {
                let (_, owner) = self.owner_key(*owner_salt);
                let e = self.next_scalar();
                block.kernels.push(Kernel {
                    excess: EcPoint::from_point(&(e * generator_g())),
                    fee: 0,
                    data: KernelData::AssetDestroy {
                        asset_id: *id,
                        owner,
                    },
                    nested: Vec::new(),
                });
                offset -= e;
            }
        }

        block.offset = offset;
        self.coins.append(&mut new_coins);
        block
    }

    /// Header for a block body at the next height, with the definition
    /// computed through the shared interpretation path.
    pub fn make_header(&mut self, block: &Block) -> BlockHeader {
        let h = self.height() + 1;
        let definition = self
            .proc
            .preview_definition(block)
            .expect("preview")
            .expect("block applies");

        let cursor = self.proc.cursor();
        BlockHeader {
            height: h,
            prev: cursor.id_hash,
            chainwork: cursor.header.chainwork.clone() + cursor.difficulty_next.unpack(),
            timestamp: self.base_ts + h * u64::from(self.rules.da.target_s),
            difficulty: cursor.difficulty_next,
            definition,
            kernels_root: kernels_root(&block.kernels),
        }
    }

    /// Build, seal and apply the next block. Returns its 0-based index.
    pub fn gen_block(&mut self, plan: &BlockPlan) -> usize {
        let block = self.build(plan);
        let header = self.make_header(&block);

        let peer = self.peer;
        let st = self.proc.on_state(&header, &peer).expect("on_state");
        assert_eq!(st, mist_chain::DataStatus::Accepted);
        let st = self
            .proc
            .on_block(
                &header.id(),
                &block.perishable_bytes(),
                &block.eternal_bytes(),
                &peer,
            )
            .expect("on_block");
        assert_eq!(st, mist_chain::DataStatus::Accepted);
        self.proc.try_go_up().expect("try_go_up");
        assert_eq!(self.proc.cursor().sid.height, header.height, "block applied");

        self.headers.push(header);
        self.blocks.push(block);
        self.blocks.len() - 1
    }

    /// Convenience: `n` coinbase-only blocks.
    pub fn gen_blocks(&mut self, n: usize) {
        for _ in 0..n {
            self.gen_block(&BlockPlan::default());
        }
    }

    /// A header for an externally-crafted (possibly invalid) block body.
    /// The definition is a placeholder; such blocks are expected to fail
    /// interpretation before the definition is ever compared.
    pub fn make_header_unchecked(&mut self, block: &Block) -> BlockHeader {
        let h = self.height() + 1;
        let cursor = self.proc.cursor();
        BlockHeader {
            height: h,
            prev: cursor.id_hash,
            chainwork: cursor.header.chainwork.clone() + cursor.difficulty_next.unpack(),
            timestamp: self.base_ts + h * u64::from(self.rules.da.target_s),
            difficulty: cursor.difficulty_next,
            definition: Hash32::ZERO,
            kernels_root: kernels_root(&block.kernels),
        }
    }

    /// A balanced block whose shielded output reuses an existing serial key.
    pub fn build_shielded_duplicate(&mut self, dup_of: usize) -> (BlockHeader, Block) {
        let h = self.height() + 1;
        let subsidy = self.rules.subsidy(h);
        let serial_pub = self.shielded[dup_of].serial_pub;

        let mut block = Block::empty();
        let mut offset = Scalar::ZERO;

        let b_cb = self.next_scalar();
        let e_cb = self.next_scalar();
        block
            .outputs
            .push(Self::signed_output(commit(subsidy, &b_cb), true));
        block
            .kernels
            .push(Kernel::std(EcPoint::from_point(&(e_cb * generator_g())), 0));
        offset += b_cb - e_cb;

        // zero-value shielded txo keeps the block balanced
        let b_s = self.next_scalar();
        let e_s = self.next_scalar();
        let comm = EcPoint::from_point(&commit(0, &b_s));
        block.kernels.push(Kernel {
            excess: EcPoint::from_point(&(e_s * generator_g())),
            fee: 0,
            data: KernelData::ShieldedOutput {
                txo: ShieldedTxo {
                    serial_pub,
                    commitment: comm,
                    range_proof: RangeProof::sign(&comm),
                    asset_proof: None,
                },
            },
            nested: Vec::new(),
        });
        offset += b_s - e_s;

        block.offset = offset;
        let header = self.make_header_unchecked(&block);
        (header, block)
    }

    /// A balanced block emitting `value` on an existing asset; used to
    /// exercise the overflow rejection.
    pub fn build_asset_emit(
        &mut self,
        id: u32,
        owner_salt: u64,
        value: i64,
    ) -> (BlockHeader, Block) {
        let h = self.height() + 1;
        let subsidy = self.rules.subsidy(h);
        let (_, owner) = self.owner_key(owner_salt);

        let mut block = Block::empty();
        let mut offset = Scalar::ZERO;

        let b_cb = self.next_scalar();
        let e_cb = self.next_scalar();
        block
            .outputs
            .push(Self::signed_output(commit(subsidy, &b_cb), true));
        block
            .kernels
            .push(Kernel::std(EcPoint::from_point(&(e_cb * generator_g())), 0));
        offset += b_cb - e_cb;

        let e = self.next_scalar();
        block.kernels.push(Kernel {
            excess: EcPoint::from_point(&(e * generator_g())),
            fee: 0,
            data: KernelData::AssetEmit {
                asset_id: id,
                owner,
                value,
            },
            nested: Vec::new(),
        });

        let b = self.next_scalar();
        let comm = b * generator_g() + Scalar::from(value.unsigned_abs()) * asset_generator(id);
        let pt = EcPoint::from_point(&comm);
        let mut out = Output::new(pt);
        out.confidential = Some(RangeProof::sign(&pt));
        block.outputs.push(out);
        offset += b - e;

        block.offset = offset;
        let header = self.make_header_unchecked(&block);
        (header, block)
    }
}
