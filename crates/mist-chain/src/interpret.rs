//! The block interpretation engine.
//!
//! Applies a transaction vector to the chain state forward or backward.
//! Order is inputs → outputs → kernels forward and the exact reverse
//! backward; a failed forward pass unwinds precisely the prefix it applied
//! and leaves the state untouched. Whatever the forward pass needs to be
//! reversible goes into the rollback journal with tail-LIFO framing.

use crate::chain_db::AssetRecord;
use crate::error::{corrupt, ChainResult};
use crate::processor::Processor;
use mist_consensus::{HEIGHT_GENESIS, MAX_ASSET_VALUE};
use mist_primitives::{
    AssetId, AssetProof, Block, EcPoint, Encoder, Decoder, Hash32, Hasher, Height, Input, Kernel,
    KernelData, Output, SpendProof,
};
use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use std::collections::HashSet;

/// Uniqueness-table key prefixes for the two shielded element kinds.
const UNIQUE_SHIELDED_OUT: u8 = 0;
const UNIQUE_SHIELDED_IN: u8 = 1;

fn unique_key(kind: u8, pt: &EcPoint) -> [u8; 33] {
    let mut k = [0u8; 33];
    k[0] = kind;
    k[1..].copy_from_slice(&pt.0);
    k
}

/// Interpretation context: one per block (or loose-tx) application.
pub struct BlockInterpretCtx {
    pub height: Height,
    pub fwd: bool,
    /// Set during reorgs when a block is applied for the second time.
    pub already_validated: bool,
    pub save_kid: bool,
    pub update_mmrs: bool,
    pub store_shielded_output: bool,
    /// Read-only pass for loose transactions.
    pub validate_only: bool,
    pub limit_exceeded: bool,

    pub shielded_ins: u32,
    pub shielded_outs: u32,
    /// Live-asset counter, loaded lazily from the DB.
    pub assets_used: Option<u32>,
    /// Last asset id a proof window may reference.
    pub asset_hi: AssetId,

    /// Rollback journal; grows forward, shrinks backward.
    pub rollback: Vec<u8>,

    /// In-transaction duplicate detection, validate-only mode.
    pub dups: Option<HashSet<Vec<u8>>>,
    pub dup_kids: Option<HashSet<Hash32>>,
}

impl BlockInterpretCtx {
    pub fn new(height: Height, fwd: bool) -> Self {
        BlockInterpretCtx {
            height,
            fwd,
            already_validated: false,
            save_kid: true,
            update_mmrs: true,
            store_shielded_output: false,
            validate_only: false,
            limit_exceeded: false,
            shielded_ins: 0,
            shielded_outs: 0,
            assets_used: None,
            asset_hi: 0,
            rollback: Vec::new(),
            dups: None,
            dup_kids: None,
        }
    }

    /// Switch into validate-only mode with fresh dup sets.
    pub fn set_validate_only(&mut self) {
        self.validate_only = true;
        self.update_mmrs = false;
        self.save_kid = false;
        self.dups = Some(HashSet::new());
        self.dup_kids = Some(HashSet::new());
    }

    pub fn validate_asset_range(&self, proof: Option<&AssetProof>) -> bool {
        match proof {
            None => true,
            Some(p) => p.begin <= self.asset_hi,
        }
    }
}

/// Append one journal record: payload followed by its u32 length marker.
pub(crate) fn push_undo(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(payload);
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
}

/// Consume one journal record from the tail.
pub(crate) fn pop_undo(buf: &mut Vec<u8>) -> ChainResult<Vec<u8>> {
    if buf.len() < 4 {
        return Err(corrupt("rollback marker missing"));
    }
    let at = buf.len() - 4;
    let len = u32::from_le_bytes(buf[at..].try_into().unwrap()) as usize;
    buf.truncate(at);
    if buf.len() < len {
        return Err(corrupt("rollback record truncated"));
    }
    Ok(buf.split_off(buf.len() - len))
}

impl Processor {
    /// Context with the asset window bound filled in.
    pub fn make_bic(&self, height: Height, fwd: bool) -> BlockInterpretCtx {
        let mut bic = BlockInterpretCtx::new(height, fwd);
        bic.asset_hi = self.mmr_assets.leaf_count() as AssetId;
        bic
    }

    fn ensure_assets_used(&self, bic: &mut BlockInterpretCtx) -> ChainResult<u32> {
        if bic.assets_used.is_none() {
            let used = self
                .db
                .param_get_int_def(crate::chain_db::ParamId::AssetsCountUsed, 0)?;
            bic.assets_used = Some(used as u32);
        }
        Ok(bic.assets_used.expect("just set"))
    }

    /// Apply a block body: the transaction vector plus the cut-through txo
    /// counter adjustment.
    pub(crate) fn handle_validated_block(
        &mut self,
        block: &mut Block,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        // keep the per-block txo slot even for fully cut-through blocks
        if !bic.fwd {
            if self.extra.txos == 0 {
                return Err(corrupt("txo counter underflow"));
            }
            self.extra.txos -= 1;
        }

        if !self.handle_validated_tx(block, bic)? {
            return Ok(false);
        }

        if bic.fwd {
            self.extra.txos += 1;
        }
        Ok(true)
    }

    /// Apply or revert a transaction vector. A failed forward application
    /// reverts its own partial work and reports `Ok(false)`.
    pub(crate) fn handle_validated_tx(
        &mut self,
        tx: &mut Block,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        let mut applied = [0usize; 3];

        if bic.fwd {
            if self.handle_tx_fwd(tx, bic, &mut applied)? {
                return Ok(true);
            }
            // roll back the applied prefix
            bic.fwd = false;
            self.handle_tx_bwd(tx, bic, applied)?;
            bic.fwd = true;
            Ok(false)
        } else {
            let all = [tx.inputs.len(), tx.outputs.len(), tx.kernels.len()];
            self.handle_tx_bwd(tx, bic, all)?;
            Ok(true)
        }
    }

    fn handle_tx_fwd(
        &mut self,
        tx: &mut Block,
        bic: &mut BlockInterpretCtx,
        applied: &mut [usize; 3],
    ) -> ChainResult<bool> {
        while applied[0] < tx.inputs.len() {
            if !self.handle_input(&mut tx.inputs[applied[0]], bic)? {
                return Ok(false);
            }
            applied[0] += 1;
        }
        while applied[1] < tx.outputs.len() {
            if !self.handle_output(&tx.outputs[applied[1]], bic)? {
                return Ok(false);
            }
            applied[1] += 1;
        }
        while applied[2] < tx.kernels.len() {
            if !self.handle_kernel_element(&tx.kernels[applied[2]], bic)? {
                return Ok(false);
            }
            applied[2] += 1;
        }
        Ok(true)
    }

    /// Reverse application of the given prefix; failures here are corruption.
    fn handle_tx_bwd(
        &mut self,
        tx: &mut Block,
        bic: &mut BlockInterpretCtx,
        applied: [usize; 3],
    ) -> ChainResult<()> {
        debug_assert!(!bic.fwd);
        for i in (0..applied[2]).rev() {
            if !self.handle_kernel_element(&tx.kernels[i], bic)? {
                return Err(corrupt("kernel undo failed"));
            }
        }
        for i in (0..applied[1]).rev() {
            if !self.handle_output(&tx.outputs[i], bic)? {
                return Err(corrupt("output undo failed"));
            }
        }
        for i in (0..applied[0]).rev() {
            if !self.handle_input(&mut tx.inputs[i], bic)? {
                return Err(corrupt("input undo failed"));
            }
        }
        Ok(())
    }

    /// Spend (forward) or restore (backward) a UTXO leaf.
    pub(crate) fn handle_input(
        &mut self,
        inp: &mut Input,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        if bic.fwd {
            let Some(key) = self
                .utxos
                .find_spendable(&inp.commitment, bic.height.saturating_sub(1))
            else {
                return Ok(false);
            };
            debug_assert!(key.maturity < bic.height);
            let id = self.utxos.pop(&key)?;
            inp.maturity = key.maturity;
            inp.txo_id = id;
        } else {
            let key = crate::utxo::UtxoKey {
                commitment: inp.commitment,
                maturity: inp.maturity,
            };
            self.utxos.push(key, inp.txo_id);
        }
        Ok(true)
    }

    /// Create (forward) or remove (backward) a UTXO leaf entry.
    pub(crate) fn handle_output(
        &mut self,
        out: &Output,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        let key = crate::utxo::UtxoKey {
            commitment: out.commitment,
            maturity: out.min_maturity(bic.height, self.rules.maturity_coinbase),
        };

        if bic.fwd {
            if !bic.validate_asset_range(out.asset_proof.as_ref()) {
                return Ok(false);
            }
            if let Some(leaf) = self.utxos.get(&key) {
                // duplicate-count overflow guard
                if leaf.ids.len() >= u32::MAX as usize {
                    return Ok(false);
                }
            }
            self.utxos.push(key, self.extra.txos);
            self.extra.txos += 1;
        } else {
            if self.extra.txos == 0 {
                return Err(corrupt("txo counter underflow"));
            }
            self.extra.txos -= 1;
            self.utxos.pop(&key)?;
        }
        Ok(true)
    }

    /// Top-level kernel application: duplicate-id rules, kernel index
    /// bookkeeping, then the recursive kernel interpretation.
    pub(crate) fn handle_kernel_element(
        &mut self,
        krn: &Kernel,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        let kid = krn.id();

        if bic.fwd
            && bic.height >= self.rules.fork_height(2)
            && !bic.already_validated
        {
            if self.find_visible_kernel(&kid, bic)?.is_some() {
                return Ok(false); // duplicated
            }
            if bic.validate_only {
                let dup_kids = bic.dup_kids.as_mut().expect("validate-only dup set");
                if !dup_kids.insert(kid) {
                    return Ok(false); // duplicated within the same tx
                }
            }
        }

        // treasury kernels are not indexed
        let save_kid = bic.height >= HEIGHT_GENESIS && bic.save_kid;
        if save_kid && !bic.fwd {
            self.db.delete_kernel(&kid, bic.height)?;
        }

        if !self.handle_kernel(krn, bic)? {
            if !bic.fwd {
                return Err(corrupt("kernel undo rejected"));
            }
            return Ok(false);
        }

        if save_kid && bic.fwd {
            self.db.insert_kernel(&kid, bic.height)?;
        }
        Ok(true)
    }

    /// Recursive kernel interpretation: nested kernels inner-first forward,
    /// outer-first backward.
    fn handle_kernel(&mut self, krn: &Kernel, bic: &mut BlockInterpretCtx) -> ChainResult<bool> {
        let mut n = 0usize;
        let mut ok = true;

        if bic.fwd {
            while n < krn.nested.len() {
                if !self.handle_kernel(&krn.nested[n], bic)? {
                    ok = false;
                    break;
                }
                n += 1;
            }
        } else {
            n = krn.nested.len();
        }

        if ok {
            ok = match &krn.data {
                KernelData::Std { relative_lock } => {
                    self.handle_kernel_std(relative_lock.as_ref(), bic)?
                }
                KernelData::AssetCreate { owner, metadata } => {
                    self.handle_kernel_asset_create(owner, metadata, bic)?
                }
                KernelData::AssetDestroy { asset_id, owner } => {
                    self.handle_kernel_asset_destroy(*asset_id, owner, bic)?
                }
                KernelData::AssetEmit {
                    asset_id,
                    owner,
                    value,
                } => self.handle_kernel_asset_emit(*asset_id, owner, *value, bic)?,
                KernelData::ShieldedOutput { txo } => {
                    self.handle_kernel_shielded_output(txo, bic)?
                }
                KernelData::ShieldedInput {
                    spend_proof, ..
                } => self.handle_kernel_shielded_input(spend_proof, bic)?,
            };
        }

        if !ok {
            if !bic.fwd {
                return Err(corrupt("kernel undo rejected"));
            }
            bic.fwd = false;
        }

        if !bic.fwd && !bic.validate_only {
            // unwind nested kernels (all of them backward, the prefix on failure)
            while n > 0 {
                n -= 1;
                if !self.handle_kernel(&krn.nested[n], bic)? {
                    return Err(corrupt("nested kernel undo rejected"));
                }
            }
        }

        if !ok {
            bic.fwd = true;
        }
        Ok(ok)
    }

    fn handle_kernel_std(
        &mut self,
        relative_lock: Option<&mist_primitives::RelativeLock>,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        if bic.fwd && !bic.already_validated {
            if let Some(rl) = relative_lock {
                let Some(h0) = self.find_visible_kernel(&rl.kernel_id, bic)? else {
                    return Ok(false);
                };
                if h0.saturating_add(rl.lock_height) > bic.height {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn handle_kernel_asset_create(
        &mut self,
        owner: &EcPoint,
        metadata: &[u8],
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        if !bic.already_validated {
            let used = self.ensure_assets_used(bic)?;
            if bic.fwd {
                if self.db.asset_find_by_owner(owner)?.is_some() {
                    return Ok(false);
                }
                if used >= self.rules.assets.max_count {
                    return Ok(false);
                }
                bic.assets_used = Some(used + 1);
            } else {
                if used == 0 {
                    return Err(corrupt("assets-used underflow"));
                }
                bic.assets_used = Some(used - 1);
            }
        }

        if !bic.update_mmrs {
            return Ok(true);
        }
        debug_assert!(!bic.validate_only);

        if bic.fwd {
            let rec = self.internal_asset_add(*owner, metadata.to_vec(), bic.height)?;

            let mut enc = Encoder::new();
            enc.write_u32(rec.id);
            push_undo(&mut bic.rollback, &enc.into_bytes());
        } else {
            let payload = pop_undo(&mut bic.rollback)?;
            let mut dec = Decoder::new(&payload);
            let id = dec.read_u32()?;
            dec.finish()?;
            self.internal_asset_del(id)?;
        }
        Ok(true)
    }

    fn handle_kernel_asset_destroy(
        &mut self,
        asset_id: AssetId,
        owner: &EcPoint,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        if !bic.already_validated {
            self.ensure_assets_used(bic)?;
        }

        if bic.fwd {
            let Some(asset) = self.db.asset_get(asset_id)? else {
                return Ok(false);
            };

            if !bic.already_validated {
                if asset.owner != *owner {
                    return Ok(false);
                }
                if asset.value != 0 {
                    return Ok(false);
                }
                if asset.lock_height + self.rules.assets.lock_period > bic.height {
                    return Ok(false);
                }
                let used = bic.assets_used.expect("ensured above");
                if used == 0 {
                    return Err(corrupt("assets-used underflow"));
                }
                bic.assets_used = Some(used - 1);
            }

            if bic.update_mmrs {
                self.internal_asset_del(asset_id)?;

                let mut enc = Encoder::new();
                enc.write_bytes(&asset.metadata);
                enc.write_u64(asset.lock_height);
                push_undo(&mut bic.rollback, &enc.into_bytes());
            }
        } else {
            if bic.update_mmrs {
                let payload = pop_undo(&mut bic.rollback)?;
                let mut dec = Decoder::new(&payload);
                let metadata = dec.read_bytes()?;
                let lock_height = dec.read_u64()?;
                dec.finish()?;

                let rec = self.internal_asset_add(*owner, metadata, lock_height)?;
                if rec.id != asset_id {
                    return Err(corrupt("asset id not restored"));
                }
            }
            if !bic.already_validated {
                let used = self.ensure_assets_used(bic)?;
                if used >= self.rules.assets.max_count {
                    return Err(corrupt("assets-used overflow"));
                }
                bic.assets_used = Some(used + 1);
            }
        }
        Ok(true)
    }

    fn handle_kernel_asset_emit(
        &mut self,
        asset_id: AssetId,
        owner: &EcPoint,
        value: i64,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        if !bic.fwd && !bic.update_mmrs {
            return Ok(true);
        }

        let Some(mut asset) = self.db.asset_get(asset_id)? else {
            return Ok(false);
        };
        if asset.owner != *owner {
            return Ok(false);
        }

        // 0x800...0 can't be negated on its own; ban it
        if value == i64::MIN {
            return Ok(false);
        }
        let mut add = value >= 0;
        let magnitude = value.unsigned_abs();
        if !bic.fwd {
            add = !add;
        }

        let was_zero = asset.value == 0;
        let new_value = if add {
            match asset.value.checked_add(magnitude) {
                Some(v) if v <= MAX_ASSET_VALUE => v,
                _ => return Ok(false), // overflow
            }
        } else {
            if asset.value < magnitude {
                return Ok(false); // not enough to burn
            }
            asset.value - magnitude
        };

        if bic.update_mmrs {
            let is_zero = new_value == 0;
            let mut lock_height = asset.lock_height;
            if is_zero != was_zero {
                if bic.fwd {
                    let mut enc = Encoder::new();
                    enc.write_u64(asset.lock_height);
                    push_undo(&mut bic.rollback, &enc.into_bytes());
                    lock_height = bic.height;
                } else {
                    let payload = pop_undo(&mut bic.rollback)?;
                    let mut dec = Decoder::new(&payload);
                    lock_height = dec.read_u64()?;
                    dec.finish()?;
                }
            }

            self.db.asset_set_value(asset_id, new_value, lock_height)?;

            asset.value = new_value;
            asset.lock_height = lock_height;
            self.mmr_assets
                .replace(u64::from(asset_id) - 1, &asset.leaf_hash())?;
        }
        Ok(true)
    }

    fn handle_kernel_shielded_output(
        &mut self,
        txo: &mist_primitives::ShieldedTxo,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        let key = unique_key(UNIQUE_SHIELDED_OUT, &txo.serial_pub);

        if bic.fwd {
            if bic.shielded_outs >= self.rules.shielded.max_outs {
                bic.limit_exceeded = true;
                return Ok(false);
            }
            if !bic.validate_asset_range(txo.asset_proof.as_ref()) {
                return Ok(false);
            }

            if bic.validate_only {
                if !self.validate_unique_no_dup(bic, &key)? {
                    return Ok(false);
                }
            } else {
                let mut enc = Encoder::new();
                enc.write_u64(bic.height);
                enc.write_u64(self.mmr_shielded.leaf_count());
                enc.write_u64(self.extra.shielded_outputs);
                txo.commitment.write(&mut enc);

                if !self.db.unique_insert(&key, &enc.into_bytes())? {
                    return Ok(false);
                }

                if bic.store_shielded_output {
                    // pool entry: commitment + serial combined. A bad encoding
                    // is tolerated here; the proof batch rejects it anyway.
                    let pt = txo
                        .commitment
                        .decompress()
                        .unwrap_or_else(RistrettoPoint::identity)
                        + txo
                            .serial_pub
                            .decompress()
                            .unwrap_or_else(RistrettoPoint::identity);
                    self.db.shielded_write(
                        self.extra.shielded_outputs,
                        &EcPoint::from_point(&pt),
                    )?;
                }

                if bic.update_mmrs {
                    let mut h = Hasher::with_tag("mist.sho");
                    h.write(&txo.serial_pub.0);
                    h.write(&txo.commitment.0);
                    h.write_u64(self.extra.shielded_outputs);
                    h.write_u64(bic.height);
                    self.mmr_shielded.append(&h.finalize())?;
                }

                self.extra.shielded_outputs += 1;
            }

            bic.shielded_outs += 1;
        } else {
            debug_assert!(!bic.validate_only);

            self.db.unique_delete_strict(&key)?;

            if bic.update_mmrs {
                let n = self.mmr_shielded.leaf_count();
                if n == 0 {
                    return Err(corrupt("shielded mmr underflow"));
                }
                self.mmr_shielded.shrink_to(n - 1)?;
            }
            if bic.store_shielded_output {
                if self.extra.shielded_outputs == 0 {
                    return Err(corrupt("shielded output counter underflow"));
                }
                self.db
                    .shielded_del_from(self.extra.shielded_outputs - 1)?;
            }

            bic.shielded_outs = bic.shielded_outs.wrapping_sub(1);
            if self.extra.shielded_outputs == 0 {
                return Err(corrupt("shielded output counter underflow"));
            }
            self.extra.shielded_outputs -= 1;
        }

        if bic.store_shielded_output {
            self.db.param_set_int(
                crate::chain_db::ParamId::ShieldedOutputs,
                self.extra.shielded_outputs,
            )?;
        }
        Ok(true)
    }

    fn handle_kernel_shielded_input(
        &mut self,
        proof: &SpendProof,
        bic: &mut BlockInterpretCtx,
    ) -> ChainResult<bool> {
        let key = unique_key(UNIQUE_SHIELDED_IN, &proof.spend_pk);

        if bic.fwd {
            if !bic.already_validated {
                if bic.shielded_ins >= self.rules.shielded.max_ins {
                    bic.limit_exceeded = true;
                    return Ok(false);
                }
                if !self.is_shielded_in_pool(proof) {
                    return Ok(false); // references an invalid pool window
                }
            }

            if bic.validate_only {
                if !self.validate_unique_no_dup(bic, &key)? {
                    return Ok(false);
                }
            } else {
                let mut enc = Encoder::new();
                enc.write_u64(bic.height);
                enc.write_u64(self.mmr_shielded.leaf_count());

                if !self.db.unique_insert(&key, &enc.into_bytes())? {
                    return Ok(false);
                }

                if bic.update_mmrs {
                    let mut h = Hasher::with_tag("mist.shi");
                    h.write(&proof.spend_pk.0);
                    h.write_u64(bic.height);
                    self.mmr_shielded.append(&h.finalize())?;
                }
            }

            bic.shielded_ins += 1;
        } else {
            debug_assert!(!bic.validate_only);

            self.db.unique_delete_strict(&key)?;

            if bic.update_mmrs {
                let n = self.mmr_shielded.leaf_count();
                if n == 0 {
                    return Err(corrupt("shielded mmr underflow"));
                }
                self.mmr_shielded.shrink_to(n - 1)?;
            }

            bic.shielded_ins = bic.shielded_ins.wrapping_sub(1);
        }

        if bic.store_shielded_output {
            // only meaningful alongside MMR updates
            debug_assert!(bic.update_mmrs);
            let inputs = self.mmr_shielded.leaf_count() - self.extra.shielded_outputs;
            self.db
                .param_set_int(crate::chain_db::ParamId::ShieldedInputs, inputs)?;
        }
        Ok(true)
    }

    /// Whether a spend proof's anonymity window lies inside the current pool
    /// under the configured proof sizes.
    pub(crate) fn is_shielded_in_pool(&self, proof: &SpendProof) -> bool {
        let cfg = &self.rules.shielded;
        if !cfg.enabled {
            return false;
        }
        if proof.window_end > self.extra.shielded_outputs {
            return false;
        }
        if proof.cfg != cfg.proof_min {
            if proof.cfg != cfg.proof_max {
                return false; // cfg not allowed
            }
            if self.extra.shielded_outputs > proof.window_end + cfg.max_window_backlog {
                return false; // large anonymity set expired
            }
        }
        true
    }

    /// Height at which a kernel id is visible, honoring the post-Fork-2
    /// visibility horizon.
    pub(crate) fn find_visible_kernel(
        &self,
        id: &Hash32,
        bic: &BlockInterpretCtx,
    ) -> ChainResult<Option<Height>> {
        let Some(h) = self.db.find_kernel(id)? else {
            return Ok(None);
        };
        debug_assert!(h <= bic.height);
        if bic.height >= self.rules.fork_height(2)
            && bic.height - h > self.rules.max_kernel_validity_dh
        {
            return Ok(None);
        }
        Ok(Some(h))
    }

    /// Validate-only duplicate check against both the in-tx set and the DB.
    fn validate_unique_no_dup(
        &self,
        bic: &mut BlockInterpretCtx,
        key: &[u8],
    ) -> ChainResult<bool> {
        let dups = bic.dups.as_mut().expect("validate-only dup set");
        if dups.contains(key) {
            return Ok(false);
        }
        if self.db.unique_find(key)?.is_some() {
            return Ok(false);
        }
        dups.insert(key.to_vec());
        Ok(true)
    }

    pub(crate) fn internal_asset_add(
        &mut self,
        owner: EcPoint,
        metadata: Vec<u8>,
        lock_height: Height,
    ) -> ChainResult<AssetRecord> {
        let (rec, _count) = self.db.asset_add(owner, metadata, lock_height)?;
        debug_assert!(rec.id >= 1);
        if self.mmr_assets.leaf_count() < u64::from(rec.id) {
            self.mmr_assets.resize_to(u64::from(rec.id))?;
        }
        self.mmr_assets
            .replace(u64::from(rec.id) - 1, &rec.leaf_hash())?;
        Ok(rec)
    }

    pub(crate) fn internal_asset_del(&mut self, asset_id: AssetId) -> ChainResult<()> {
        let count = self.db.asset_del(asset_id)?;
        if u64::from(count) < self.mmr_assets.leaf_count() {
            self.mmr_assets.shrink_to(u64::from(count))?;
        } else {
            self.mmr_assets
                .replace(u64::from(asset_id) - 1, &Hash32::ZERO)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_is_tail_lifo() {
        let mut buf = Vec::new();
        push_undo(&mut buf, b"first");
        push_undo(&mut buf, b"second-longer");
        assert_eq!(pop_undo(&mut buf).unwrap(), b"second-longer");
        assert_eq!(pop_undo(&mut buf).unwrap(), b"first");
        assert!(buf.is_empty());
    }

    #[test]
    fn journal_misalignment_is_corruption() {
        let mut buf = vec![1, 2, 3];
        assert!(pop_undo(&mut buf).is_err());

        // marker longer than the remaining payload
        let mut buf = Vec::new();
        push_undo(&mut buf, b"x");
        buf.remove(0);
        assert!(pop_undo(&mut buf).is_err());
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut buf = Vec::new();
        push_undo(&mut buf, b"");
        assert_eq!(pop_undo(&mut buf).unwrap(), b"");
        assert!(buf.is_empty());
    }
}
