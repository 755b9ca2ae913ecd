//! Transaction summary validation.
//!
//! `TxContext` walks a transaction vector, verifies the element proofs into
//! the batch context and accumulates the commitment sigma. Several contexts
//! with distinct verifier indices can walk the same vector concurrently,
//! each taking every n-th element; `merge` folds them back together. The
//! balance law itself is checked by `is_valid_block`:
//!
//! `Σ C_out − Σ C_in − Σ excess − Σ emit·H_a − subsidy·H − offset·G = 0`

use crate::params::{HeightRange, Rules};
use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use mist_primitives::{
    asset_generator, generator_g, generator_h, verify_asset_proof, verify_range_proof, BatchContext,
    Block, Kernel, KernelData, Scalar, SigmaAccumulator,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// Knobs for one validation pass.
#[derive(Debug, Clone)]
pub struct TxContextParams {
    /// Tolerate proof-less coinbase outputs (fast-sync below target).
    pub allow_unsigned_outputs: bool,
    /// How many contexts stripe over the same vector.
    pub n_verifiers: u32,
}

impl Default for TxContextParams {
    fn default() -> Self {
        TxContextParams {
            allow_unsigned_outputs: false,
            n_verifiers: 1,
        }
    }
}

/// Accumulated summary of a (partial) transaction walk.
pub struct TxContext {
    pub params: TxContextParams,
    pub height: HeightRange,
    /// Stripe index of this context.
    pub verifier: u32,
    /// Commitment sum so far.
    pub sigma: RistrettoPoint,
    /// Fee sum so far.
    pub fee: u128,
}

impl TxContext {
    pub fn new(params: TxContextParams, height: HeightRange) -> Self {
        TxContext {
            params,
            height,
            verifier: 0,
            sigma: RistrettoPoint::identity(),
            fee: 0,
        }
    }

    /// Walk this context's stripe of the vector, verifying proofs into `bc`
    /// and summing commitments. Returns false on the first invalid element
    /// or when `abort` trips.
    pub fn validate_and_summarize(
        &mut self,
        block: &Block,
        bc: &mut BatchContext,
        assets: &dyn SigmaAccumulator,
        rules: &Rules,
        abort: Option<&AtomicBool>,
    ) -> bool {
        let total = self.params.n_verifiers.max(1);
        let stripe = self.verifier;
        let mut n = 0u32;
        let mut mine = move |n: &mut u32| {
            let take = *n % total == stripe;
            *n += 1;
            take
        };

        for inp in &block.inputs {
            if aborted(abort) {
                return false;
            }
            if !mine(&mut n) {
                continue;
            }
            let Some(c) = inp.commitment.decompress() else {
                return false;
            };
            self.sigma -= c;
        }

        for out in &block.outputs {
            if aborted(abort) {
                return false;
            }
            if !mine(&mut n) {
                continue;
            }
            let Some(c) = out.commitment.decompress() else {
                return false;
            };

            if !out.is_signed() {
                // locked coinbases may travel proof-less during fast-sync
                if !(self.params.allow_unsigned_outputs && out.coinbase) {
                    return false;
                }
            }
            if let Some(p) = &out.confidential {
                if !verify_range_proof(bc, &out.commitment, p) {
                    return false;
                }
            }
            if let Some(p) = &out.public_proof {
                let expected = p.blinding * generator_g() + Scalar::from(p.value) * generator_h();
                if c != expected {
                    return false;
                }
            }
            if let Some(p) = &out.asset_proof {
                if p.cfg != rules.assets.proof_cfg {
                    return false;
                }
                if !verify_asset_proof(bc, assets, p) {
                    return false;
                }
            }

            self.sigma += c;
        }

        for krn in &block.kernels {
            if aborted(abort) {
                return false;
            }
            if !mine(&mut n) {
                continue;
            }
            if !self.summarize_kernel(krn, bc, assets, rules) {
                return false;
            }
        }

        true
    }

    fn summarize_kernel(
        &mut self,
        krn: &Kernel,
        bc: &mut BatchContext,
        assets: &dyn SigmaAccumulator,
        rules: &Rules,
    ) -> bool {
        let Some(excess) = krn.excess.decompress() else {
            return false;
        };
        self.sigma -= excess;
        self.fee += u128::from(krn.fee);

        match &krn.data {
            KernelData::Std { .. } => {}
            KernelData::AssetCreate { .. } | KernelData::AssetDestroy { .. } => {}
            KernelData::AssetEmit {
                asset_id, value, ..
            } => {
                // 0x800...0 cannot be negated; ban it outright
                if *value == i64::MIN {
                    return false;
                }
                let gen = asset_generator(*asset_id);
                if *value >= 0 {
                    self.sigma -= Scalar::from(*value as u64) * gen;
                } else {
                    self.sigma += Scalar::from((-*value) as u64) * gen;
                }
            }
            KernelData::ShieldedOutput { txo } => {
                let Some(c) = txo.commitment.decompress() else {
                    return false;
                };
                if !verify_range_proof(bc, &txo.commitment, &txo.range_proof) {
                    return false;
                }
                if let Some(p) = &txo.asset_proof {
                    if p.cfg != rules.assets.proof_cfg {
                        return false;
                    }
                    if !verify_asset_proof(bc, assets, p) {
                        return false;
                    }
                }
                // the shielded value leaves the transparent set
                self.sigma += c;
            }
            KernelData::ShieldedInput {
                value_commitment, ..
            } => {
                // the spend proof itself goes through the shielded batch
                let Some(c) = value_commitment.decompress() else {
                    return false;
                };
                self.sigma -= c;
            }
        }

        for nested in &krn.nested {
            if !self.summarize_kernel(nested, bc, assets, rules) {
                return false;
            }
        }
        true
    }

    /// Fold a sibling context into this one.
    pub fn merge(&mut self, other: &TxContext) -> bool {
        if other.height != self.height {
            return false;
        }
        self.sigma += other.sigma;
        match self.fee.checked_add(other.fee) {
            Some(f) => self.fee = f,
            None => return false,
        }
        true
    }

    /// Check the balance law over this context's height range. Fees do not
    /// appear here: the hole a transaction's fee leaves in the commitment
    /// sum is physically filled by the coinbase output claiming it.
    pub fn is_valid_block(&self, offset: &Scalar, rules: &Rules) -> bool {
        let subsidy = rules.subsidy_range(&self.height);
        let total =
            self.sigma - Scalar::from(subsidy) * generator_h() - offset * generator_g();
        total == RistrettoPoint::identity()
    }
}

fn aborted(abort: Option<&AtomicBool>) -> bool {
    abort.map(|a| a.load(Ordering::Relaxed)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_primitives::{commit, EcPoint, Input, Output, RangeProof};

    struct NullAcc;
    impl SigmaAccumulator for NullAcc {
        fn add(&self, _id0: u64, _scalars: &[Scalar]) {}
    }

    fn signed_output(value: u64, blinding: u64, coinbase: bool) -> Output {
        let comm = EcPoint::from_point(&commit(value, &Scalar::from(blinding)));
        let mut out = Output::new(comm);
        out.coinbase = coinbase;
        out.confidential = Some(RangeProof::sign(&comm));
        out
    }

    /// A minimal valid block: coinbase output for the subsidy, one kernel.
    fn coinbase_block(rules: &Rules, h: u64) -> Block {
        let blinding = Scalar::from(1000 + h);
        let excess_sk = Scalar::from(77u64);
        let mut block = Block::empty();
        let comm = commit(rules.subsidy(h), &blinding);
        let mut out = Output::new(EcPoint::from_point(&comm));
        out.coinbase = true;
        out.confidential = Some(RangeProof::sign(&out.commitment));
        block.outputs.push(out);
        block
            .kernels
            .push(Kernel::std(EcPoint::from_point(&(excess_sk * generator_g())), 0));
        block.offset = blinding - excess_sk;
        block
    }

    #[test]
    fn coinbase_block_balances() {
        let rules = Rules::testing();
        let block = coinbase_block(&rules, 1);

        let mut ctx = TxContext::new(TxContextParams::default(), HeightRange::new(1, 1));
        let mut bc = BatchContext::new();
        assert!(ctx.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));
        assert!(ctx.is_valid_block(&block.offset, &rules));
        assert_eq!(*bc.sum(), RistrettoPoint::identity());
    }

    #[test]
    fn wrong_offset_fails_balance() {
        let rules = Rules::testing();
        let mut block = coinbase_block(&rules, 1);
        block.offset += Scalar::ONE;

        let mut ctx = TxContext::new(TxContextParams::default(), HeightRange::new(1, 1));
        let mut bc = BatchContext::new();
        assert!(ctx.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));
        assert!(!ctx.is_valid_block(&block.offset, &rules));
    }

    #[test]
    fn unsigned_output_rejected_unless_allowed() {
        let rules = Rules::testing();
        let mut out = signed_output(5, 9, true);
        out.confidential = None;
        let mut block = Block::empty();
        block.outputs.push(out);

        let mut ctx = TxContext::new(TxContextParams::default(), HeightRange::new(1, 1));
        let mut bc = BatchContext::new();
        assert!(!ctx.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));

        let params = TxContextParams {
            allow_unsigned_outputs: true,
            n_verifiers: 1,
        };
        let mut ctx = TxContext::new(params, HeightRange::new(1, 1));
        assert!(ctx.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));
    }

    #[test]
    fn striped_contexts_merge_to_same_sigma() {
        let rules = Rules::testing();
        let mut block = coinbase_block(&rules, 1);
        block.inputs.push(Input::new(EcPoint::from_point(&commit(3, &Scalar::from(4u64)))));
        block.outputs.push(signed_output(8, 15, false));

        // single-verifier reference
        let mut whole = TxContext::new(TxContextParams::default(), HeightRange::new(1, 1));
        let mut bc = BatchContext::new();
        assert!(whole.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));

        // two stripes merged
        let params = TxContextParams {
            allow_unsigned_outputs: false,
            n_verifiers: 2,
        };
        let mut a = TxContext::new(params.clone(), HeightRange::new(1, 1));
        a.verifier = 0;
        let mut b = TxContext::new(params, HeightRange::new(1, 1));
        b.verifier = 1;
        assert!(a.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));
        assert!(b.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));
        assert!(a.merge(&b));
        assert_eq!(a.sigma, whole.sigma);
        assert_eq!(a.fee, whole.fee);
    }

    #[test]
    fn emit_kernel_balances_asset_output() {
        let rules = Rules::testing();
        let owner = EcPoint::from_point(&(Scalar::from(5u64) * generator_g()));
        let blinding = Scalar::from(21u64);

        let mut block = Block::empty();
        let comm = blinding * generator_g() + Scalar::from(50u64) * asset_generator(1);
        let mut out = Output::new(EcPoint::from_point(&comm));
        out.confidential = Some(RangeProof::sign(&out.commitment));
        block.outputs.push(out);

        let excess_sk = Scalar::from(8u64);
        let mut krn = Kernel::std(EcPoint::from_point(&(excess_sk * generator_g())), 0);
        krn.data = KernelData::AssetEmit {
            asset_id: 1,
            owner,
            value: 50,
        };
        block.kernels.push(krn);
        block.offset = blinding - excess_sk;

        let mut ctx = TxContext::new(TxContextParams::default(), HeightRange::new(5, 5));
        // empty range -> no subsidy; emission must self-balance
        ctx.height = HeightRange::new(5, 4);
        let mut bc = BatchContext::new();
        assert!(ctx.validate_and_summarize(&block, &mut bc, &NullAcc, &rules, None));
        assert!(ctx.is_valid_block(&block.offset, &rules));
    }
}
