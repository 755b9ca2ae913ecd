//! Transaction vectors: inputs, outputs and the kernel tagged union.

use crate::commitment::{read_scalar, write_scalar, EcPoint, Scalar};
use crate::encode::{DecodeError, Decoder, Deserialize, Encoder, Serialize};
use crate::hash::{Hash32, Hasher};
use crate::header::Height;
use crate::proofs::{AssetProof, PublicProof, RangeProof, SpendProof};

/// Global transaction-output id: position in the append-only txo stream.
pub type TxoId = u64;

/// Confidential asset id, 1-based. 0 means the native coin.
pub type AssetId = u32;

/// A spent output reference. Only the commitment travels on the wire; the
/// maturity and txo id are recovered during block interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub commitment: EcPoint,
    /// Maturity of the consumed UTXO leaf (filled on apply).
    pub maturity: Height,
    /// Txo id of the consumed output (filled on apply).
    pub txo_id: TxoId,
}

impl Input {
    pub fn new(commitment: EcPoint) -> Self {
        Input {
            commitment,
            maturity: 0,
            txo_id: 0,
        }
    }
}

impl Serialize for Input {
    fn write(&self, w: &mut Encoder) {
        self.commitment.write(w);
    }
}

impl Deserialize for Input {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Input::new(EcPoint::read(r)?))
    }
}

/// Flag bits of the output's leading byte. The low two bits survive the
/// naked rewrite; the high bits mark the optional payloads.
pub const FLAG_COINBASE: u8 = 0x01;
pub const FLAG_NAKED_MASK: u8 = 0x03;
pub const FLAG_INCUBATION: u8 = 0x10;
pub const FLAG_CONFIDENTIAL: u8 = 0x20;
pub const FLAG_PUBLIC: u8 = 0x40;
pub const FLAG_ASSET: u8 = 0x80;

/// Minimum serialized size of a naked txo: flag byte + commitment.
pub const TXO_NAKED_MIN: usize = 33;
/// Maximum serialized size of a naked txo: adds the incubation period.
pub const TXO_NAKED_MAX: usize = TXO_NAKED_MIN + 8;

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub commitment: EcPoint,
    pub coinbase: bool,
    /// Extra maturity delay; 0 when absent.
    pub incubation: Height,
    pub confidential: Option<RangeProof>,
    pub public_proof: Option<PublicProof>,
    pub asset_proof: Option<AssetProof>,
}

impl Output {
    pub fn new(commitment: EcPoint) -> Self {
        Output {
            commitment,
            coinbase: false,
            incubation: 0,
            confidential: None,
            public_proof: None,
            asset_proof: None,
        }
    }

    /// Height below which this output cannot be spent when created at `h`.
    pub fn min_maturity(&self, h: Height, coinbase_maturity: Height) -> Height {
        let base = if self.coinbase { coinbase_maturity } else { 0 };
        h + base + self.incubation
    }

    /// Whether the output carries any validity proof. Unsigned outputs are
    /// only tolerated for locked coinbases during fast-sync.
    pub fn is_signed(&self) -> bool {
        self.confidential.is_some() || self.public_proof.is_some()
    }

    fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.coinbase {
            f |= FLAG_COINBASE;
        }
        if self.incubation != 0 {
            f |= FLAG_INCUBATION;
        }
        if self.confidential.is_some() {
            f |= FLAG_CONFIDENTIAL;
        }
        if self.public_proof.is_some() {
            f |= FLAG_PUBLIC;
        }
        if self.asset_proof.is_some() {
            f |= FLAG_ASSET;
        }
        f
    }

    /// Strip proofs, keeping commitment, coinbase flag and incubation.
    pub fn to_naked(&self) -> Output {
        Output {
            commitment: self.commitment,
            coinbase: self.coinbase,
            incubation: self.incubation,
            confidential: None,
            public_proof: None,
            asset_proof: None,
        }
    }
}

impl Serialize for Output {
    fn write(&self, w: &mut Encoder) {
        w.write_u8(self.flags());
        self.commitment.write(w);
        if self.incubation != 0 {
            w.write_u64(self.incubation);
        }
        if let Some(p) = &self.confidential {
            p.write(w);
        }
        if let Some(p) = &self.public_proof {
            p.write(w);
        }
        if let Some(p) = &self.asset_proof {
            p.write(w);
        }
    }
}

impl Deserialize for Output {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let flags = r.read_u8()?;
        let commitment = EcPoint::read(r)?;
        let incubation = if flags & FLAG_INCUBATION != 0 {
            let v = r.read_u64()?;
            if v == 0 {
                return Err(DecodeError::Malformed("zero incubation"));
            }
            v
        } else {
            0
        };
        let confidential = if flags & FLAG_CONFIDENTIAL != 0 {
            Some(RangeProof::read(r)?)
        } else {
            None
        };
        let public_proof = if flags & FLAG_PUBLIC != 0 {
            Some(PublicProof::read(r)?)
        } else {
            None
        };
        let asset_proof = if flags & FLAG_ASSET != 0 {
            Some(AssetProof::read(r)?)
        } else {
            None
        };
        Ok(Output {
            commitment,
            coinbase: flags & FLAG_COINBASE != 0,
            incubation,
            confidential,
            public_proof,
            asset_proof,
        })
    }
}

/// A shielded output descriptor carried inside its kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShieldedTxo {
    pub serial_pub: EcPoint,
    pub commitment: EcPoint,
    pub range_proof: RangeProof,
    pub asset_proof: Option<AssetProof>,
}

impl Serialize for ShieldedTxo {
    fn write(&self, w: &mut Encoder) {
        self.serial_pub.write(w);
        self.commitment.write(w);
        self.range_proof.write(w);
        w.write_bool(self.asset_proof.is_some());
        if let Some(p) = &self.asset_proof {
            p.write(w);
        }
    }
}

impl Deserialize for ShieldedTxo {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let serial_pub = EcPoint::read(r)?;
        let commitment = EcPoint::read(r)?;
        let range_proof = RangeProof::read(r)?;
        let asset_proof = if r.read_bool()? {
            Some(AssetProof::read(r)?)
        } else {
            None
        };
        Ok(ShieldedTxo {
            serial_pub,
            commitment,
            range_proof,
            asset_proof,
        })
    }
}

/// Relative height lock referencing another kernel by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeLock {
    pub kernel_id: Hash32,
    pub lock_height: Height,
}

/// Kernel subtype payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelData {
    Std {
        relative_lock: Option<RelativeLock>,
    },
    AssetCreate {
        owner: EcPoint,
        metadata: Vec<u8>,
    },
    AssetEmit {
        asset_id: AssetId,
        owner: EcPoint,
        /// Positive mints, negative burns.
        value: i64,
    },
    AssetDestroy {
        asset_id: AssetId,
        owner: EcPoint,
    },
    ShieldedOutput {
        txo: ShieldedTxo,
    },
    ShieldedInput {
        /// Re-randomized commitment of the spent shielded value.
        value_commitment: EcPoint,
        spend_proof: SpendProof,
    },
}

impl KernelData {
    fn tag(&self) -> u8 {
        match self {
            KernelData::Std { .. } => 0,
            KernelData::AssetCreate { .. } => 1,
            KernelData::AssetEmit { .. } => 2,
            KernelData::AssetDestroy { .. } => 3,
            KernelData::ShieldedOutput { .. } => 4,
            KernelData::ShieldedInput { .. } => 5,
        }
    }
}

/// A transaction kernel. Kernels are the signed part of a transaction and
/// the only part that survives cut-through; nested kernels are applied
/// inner-first forward and outer-first backward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    pub excess: EcPoint,
    pub fee: u64,
    pub data: KernelData,
    pub nested: Vec<Kernel>,
}

impl Kernel {
    pub fn std(excess: EcPoint, fee: u64) -> Self {
        Kernel {
            excess,
            fee,
            data: KernelData::Std {
                relative_lock: None,
            },
            nested: Vec::new(),
        }
    }

    /// Kernel id: hash over the canonical encoding (covers nested kernels).
    pub fn id(&self) -> Hash32 {
        let mut h = Hasher::with_tag("mist.krn");
        h.write(&self.to_bytes());
        h.finalize()
    }
}

impl Serialize for Kernel {
    fn write(&self, w: &mut Encoder) {
        self.excess.write(w);
        w.write_u64(self.fee);
        w.write_u8(self.data.tag());
        match &self.data {
            KernelData::Std { relative_lock } => {
                w.write_bool(relative_lock.is_some());
                if let Some(rl) = relative_lock {
                    w.write_hash(&rl.kernel_id);
                    w.write_u64(rl.lock_height);
                }
            }
            KernelData::AssetCreate { owner, metadata } => {
                owner.write(w);
                w.write_bytes(metadata);
            }
            KernelData::AssetEmit {
                asset_id,
                owner,
                value,
            } => {
                w.write_u32(*asset_id);
                owner.write(w);
                w.write_i64(*value);
            }
            KernelData::AssetDestroy { asset_id, owner } => {
                w.write_u32(*asset_id);
                owner.write(w);
            }
            KernelData::ShieldedOutput { txo } => {
                txo.write(w);
            }
            KernelData::ShieldedInput {
                value_commitment,
                spend_proof,
            } => {
                value_commitment.write(w);
                spend_proof.write(w);
            }
        }
        w.write_u32(self.nested.len() as u32);
        for k in &self.nested {
            k.write(w);
        }
    }
}

impl Deserialize for Kernel {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let excess = EcPoint::read(r)?;
        let fee = r.read_u64()?;
        let tag = r.read_u8()?;
        let data = match tag {
            0 => {
                let relative_lock = if r.read_bool()? {
                    Some(RelativeLock {
                        kernel_id: r.read_hash()?,
                        lock_height: r.read_u64()?,
                    })
                } else {
                    None
                };
                KernelData::Std { relative_lock }
            }
            1 => KernelData::AssetCreate {
                owner: EcPoint::read(r)?,
                metadata: r.read_bytes()?,
            },
            2 => KernelData::AssetEmit {
                asset_id: r.read_u32()?,
                owner: EcPoint::read(r)?,
                value: r.read_i64()?,
            },
            3 => KernelData::AssetDestroy {
                asset_id: r.read_u32()?,
                owner: EcPoint::read(r)?,
            },
            4 => KernelData::ShieldedOutput {
                txo: ShieldedTxo::read(r)?,
            },
            5 => KernelData::ShieldedInput {
                value_commitment: EcPoint::read(r)?,
                spend_proof: SpendProof::read(r)?,
            },
            _ => return Err(DecodeError::Malformed("kernel tag")),
        };
        let nested_count = r.read_u32()? as usize;
        if nested_count > 1 << 12 {
            return Err(DecodeError::Malformed("nested kernel count"));
        }
        let mut nested = Vec::with_capacity(nested_count);
        for _ in 0..nested_count {
            nested.push(Kernel::read(r)?);
        }
        Ok(Kernel {
            excess,
            fee,
            data,
            nested,
        })
    }
}

/// Depth-first kernel walk (kernel before its nested list). Returns false
/// as soon as the callback does.
pub fn walk_kernels(kernels: &[Kernel], f: &mut impl FnMut(&Kernel) -> bool) -> bool {
    for k in kernels {
        if !f(k) {
            return false;
        }
        if !walk_kernels(&k.nested, f) {
            return false;
        }
    }
    true
}

/// A full transaction: also the block body (a block is one aggregate
/// transaction after cut-through).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// The base offset scalar balancing the commitment sum.
    pub offset: Scalar,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels: Vec<Kernel>,
}

/// Loose transactions share the block body layout.
pub type Transaction = Block;

impl Block {
    pub fn empty() -> Self {
        Block {
            offset: Scalar::ZERO,
            inputs: Vec::new(),
            outputs: Vec::new(),
            kernels: Vec::new(),
        }
    }

    /// Perishable part: offset, inputs, outputs. Deleted once fossilized.
    pub fn write_perishable(&self, w: &mut Encoder) {
        write_scalar(w, &self.offset);
        w.write_u32(self.inputs.len() as u32);
        for i in &self.inputs {
            i.write(w);
        }
        w.write_u32(self.outputs.len() as u32);
        for o in &self.outputs {
            o.write(w);
        }
    }

    /// Eternal part: kernels. Kept for the whole chain lifetime.
    pub fn write_eternal(&self, w: &mut Encoder) {
        w.write_u32(self.kernels.len() as u32);
        for k in &self.kernels {
            k.write(w);
        }
    }

    pub fn perishable_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.write_perishable(&mut enc);
        enc.into_bytes()
    }

    pub fn eternal_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.write_eternal(&mut enc);
        enc.into_bytes()
    }

    pub fn read_perishable(r: &mut Decoder<'_>) -> Result<(Scalar, Vec<Input>, Vec<Output>), DecodeError> {
        let offset = read_scalar(r)?;
        let n_in = r.read_u32()? as usize;
        if n_in > 1 << 20 {
            return Err(DecodeError::Malformed("input count"));
        }
        let mut inputs = Vec::with_capacity(n_in);
        for _ in 0..n_in {
            inputs.push(Input::read(r)?);
        }
        let n_out = r.read_u32()? as usize;
        if n_out > 1 << 20 {
            return Err(DecodeError::Malformed("output count"));
        }
        let mut outputs = Vec::with_capacity(n_out);
        for _ in 0..n_out {
            outputs.push(Output::read(r)?);
        }
        Ok((offset, inputs, outputs))
    }

    pub fn read_eternal(r: &mut Decoder<'_>) -> Result<Vec<Kernel>, DecodeError> {
        let n = r.read_u32()? as usize;
        if n > 1 << 20 {
            return Err(DecodeError::Malformed("kernel count"));
        }
        let mut kernels = Vec::with_capacity(n);
        for _ in 0..n {
            kernels.push(Kernel::read(r)?);
        }
        Ok(kernels)
    }

    /// Assemble from the two stored blobs.
    pub fn from_parts(perishable: &[u8], eternal: &[u8]) -> Result<Self, DecodeError> {
        let mut dp = Decoder::new(perishable);
        let (offset, inputs, outputs) = Self::read_perishable(&mut dp)?;
        dp.finish()?;

        let mut de = Decoder::new(eternal);
        let kernels = Self::read_eternal(&mut de)?;
        de.finish()?;

        Ok(Block {
            offset,
            inputs,
            outputs,
            kernels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::{commit, EcPoint};
    use crate::proofs::RangeProof;

    fn sample_output(v: u64, coinbase: bool) -> Output {
        let comm = EcPoint::from_point(&commit(v, &Scalar::from(v + 1)));
        let mut out = Output::new(comm);
        out.coinbase = coinbase;
        out.confidential = Some(RangeProof::sign(&comm));
        out
    }

    #[test]
    fn output_round_trip() {
        let mut out = sample_output(5, true);
        out.incubation = 12;
        let decoded = Output::from_bytes(&out.to_bytes()).unwrap();
        assert_eq!(decoded, out);
    }

    #[test]
    fn naked_output_is_short() {
        let out = sample_output(5, false).to_naked();
        let bytes = out.to_bytes();
        assert_eq!(bytes.len(), TXO_NAKED_MIN);
        assert_eq!(bytes[0] & !FLAG_NAKED_MASK, 0);
    }

    #[test]
    fn naked_output_with_incubation_fits_bound() {
        let mut out = sample_output(5, true);
        out.incubation = 7;
        let bytes = out.to_naked().to_bytes();
        assert!(bytes.len() <= TXO_NAKED_MAX);
        assert_eq!(
            Output::from_bytes(&bytes).unwrap().incubation,
            7,
            "incubation survives the naked rewrite"
        );
    }

    #[test]
    fn min_maturity_accounts_for_coinbase_and_incubation() {
        let mut out = sample_output(5, true);
        out.incubation = 3;
        assert_eq!(out.min_maturity(100, 240), 100 + 240 + 3);

        let plain = sample_output(5, false);
        assert_eq!(plain.min_maturity(100, 240), 100);
    }

    #[test]
    fn kernel_id_covers_nested() {
        let mut k = Kernel::std(EcPoint::from_point(&commit(0, &Scalar::from(2u64))), 10);
        let id0 = k.id();
        k.nested
            .push(Kernel::std(EcPoint::from_point(&commit(0, &Scalar::from(3u64))), 0));
        assert_ne!(id0, k.id());
    }

    #[test]
    fn block_blob_round_trip() {
        let mut block = Block::empty();
        block.offset = Scalar::from(77u64);
        block.inputs.push(Input::new(EcPoint::from_point(&commit(1, &Scalar::from(5u64)))));
        block.outputs.push(sample_output(9, false));
        block
            .kernels
            .push(Kernel::std(EcPoint::from_point(&commit(0, &Scalar::from(4u64))), 1));

        let restored = Block::from_parts(&block.perishable_bytes(), &block.eternal_bytes()).unwrap();
        assert_eq!(restored, block);
    }
}
