//! Proof contracts and the batch verification context.
//!
//! The heavy cryptography (Bulletproof inner product, Lelantus one-of-many)
//! is an external contract; what the node owns is the *algebra* around it:
//! every proof contributes weighted points to a batch, sigma-style proofs
//! additionally contribute per-window scalars that are later reduced against
//! the commitment list, and the whole run is valid iff the weighted sum
//! closes to the identity.

use crate::commitment::{asset_generator, read_scalar, write_scalar, EcPoint, Scalar};
use crate::encode::{DecodeError, Decoder, Encoder};
use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use rand::rngs::OsRng;

/// Anonymity-set configuration of a sigma-style proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigmaCfg {
    /// Number of commitments in the window.
    pub n: u32,
}

impl SigmaCfg {
    pub fn get_n(&self) -> u32 {
        self.n
    }
}

/// Receives per-window proof scalars for deferred reduction against the
/// commitment list. Implemented by the chunked multi-sigma accumulator.
pub trait SigmaAccumulator: Sync {
    /// Add `scalars` for the global commitment ids `[id0, id0 + len)`.
    fn add(&self, id0: u64, scalars: &[Scalar]);
}

/// Weighted-point accumulator for one verification run.
///
/// Owned by the verifying task and merged by the caller; there is no global
/// instance. A run is valid iff the merged sum (plus all sigma-chunk
/// reductions) is the identity.
pub struct BatchContext {
    sum: RistrettoPoint,
}

impl BatchContext {
    pub fn new() -> Self {
        BatchContext {
            sum: RistrettoPoint::identity(),
        }
    }

    /// Fresh random weight, applied to every term of one proof so that
    /// independent invalid proofs cannot cancel each other.
    pub fn random_weight(&mut self) -> Scalar {
        Scalar::random(&mut OsRng)
    }

    pub fn add(&mut self, weight: &Scalar, point: &RistrettoPoint) {
        self.sum += weight * point;
    }

    pub fn add_point(&mut self, point: &RistrettoPoint) {
        self.sum += point;
    }

    pub fn sum(&self) -> &RistrettoPoint {
        &self.sum
    }

    /// Drain the accumulated sum, leaving the context clean.
    pub fn take_sum(&mut self) -> RistrettoPoint {
        std::mem::replace(&mut self.sum, RistrettoPoint::identity())
    }

    pub fn reset(&mut self) {
        self.sum = RistrettoPoint::identity();
    }
}

impl Default for BatchContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Confidential range proof over an output commitment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeProof {
    pub proof_point: EcPoint,
}

impl RangeProof {
    /// Prover side: a valid proof commits to the output commitment itself.
    pub fn sign(commitment: &EcPoint) -> Self {
        RangeProof {
            proof_point: *commitment,
        }
    }

    pub fn write(&self, w: &mut Encoder) {
        self.proof_point.write(w);
    }

    pub fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(RangeProof {
            proof_point: EcPoint::read(r)?,
        })
    }
}

/// Verify a range proof against its commitment, deferring to the batch.
pub fn verify_range_proof(bc: &mut BatchContext, commitment: &EcPoint, proof: &RangeProof) -> bool {
    let (Some(comm), Some(pp)) = (commitment.decompress(), proof.proof_point.decompress()) else {
        return false;
    };
    let rho = bc.random_weight();
    bc.add(&rho, &(comm - pp));
    true
}

/// Public (non-confidential) output proof: explicit value and blinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicProof {
    pub value: u64,
    pub blinding: Scalar,
}

impl PublicProof {
    pub fn write(&self, w: &mut Encoder) {
        w.write_u64(self.value);
        write_scalar(w, &self.blinding);
    }

    pub fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(PublicProof {
            value: r.read_u64()?,
            blinding: read_scalar(r)?,
        })
    }
}

/// Lelantus-style shielded spend proof.
///
/// Proves membership of the spent element in the pool window
/// `[window_end - N, window_end)` and consistency of the re-randomized
/// value commitment. `weights` are the per-window scalars handed to the
/// multi-sigma accumulator; `balance` is the point the reduction must hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendProof {
    pub spend_pk: EcPoint,
    pub window_end: u64,
    pub cfg: SigmaCfg,
    pub weights: Vec<Scalar>,
    pub balance: EcPoint,
}

impl SpendProof {
    pub fn write(&self, w: &mut Encoder) {
        self.spend_pk.write(w);
        w.write_u64(self.window_end);
        w.write_u32(self.cfg.n);
        w.write_u32(self.weights.len() as u32);
        for s in &self.weights {
            write_scalar(w, s);
        }
        self.balance.write(w);
    }

    pub fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let spend_pk = EcPoint::read(r)?;
        let window_end = r.read_u64()?;
        let cfg = SigmaCfg { n: r.read_u32()? };
        let count = r.read_u32()? as usize;
        if count > 1 << 20 {
            return Err(DecodeError::Malformed("spend proof weight count"));
        }
        let mut weights = Vec::with_capacity(count);
        for _ in 0..count {
            weights.push(read_scalar(r)?);
        }
        Ok(SpendProof {
            spend_pk,
            window_end,
            cfg,
            weights,
            balance: EcPoint::read(r)?,
        })
    }

    /// Prover side: derive weights from a seed and close the relation over
    /// the given pool window (the `N` stored points ending at `window_end`).
    pub fn create(
        spend_pk: EcPoint,
        window_end: u64,
        cfg: SigmaCfg,
        pool_window: &[RistrettoPoint],
        seed: &Scalar,
    ) -> Self {
        let n = cfg.get_n() as usize;
        assert_eq!(pool_window.len(), n);

        let mut weights = Vec::with_capacity(n);
        let mut k = *seed;
        for _ in 0..n {
            weights.push(k);
            k = k * k + Scalar::ONE;
        }

        let mut balance = RistrettoPoint::identity();
        for (k, p) in weights.iter().zip(pool_window) {
            balance += k * p;
        }

        SpendProof {
            spend_pk,
            window_end,
            cfg,
            weights,
            balance: EcPoint::from_point(&balance),
        }
    }
}

/// Verify a spend proof: the balance point goes to the batch, the window
/// scalars go to the accumulator keyed by the window base.
pub fn verify_spend_proof(
    bc: &mut BatchContext,
    acc: &dyn SigmaAccumulator,
    proof: &SpendProof,
) -> bool {
    let n = proof.cfg.get_n() as usize;
    if n == 0 || proof.weights.len() != n {
        return false;
    }
    let Some(balance) = proof.balance.decompress() else {
        return false;
    };

    let rho = bc.random_weight();
    bc.add(&(-rho), &balance);

    let ks: Vec<Scalar> = proof.weights.iter().map(|k| rho * k).collect();

    let id1 = proof.window_end;
    if id1 >= n as u64 {
        acc.add(id1 - n as u64, &ks);
    } else {
        // clipped window at the very beginning of the pool
        acc.add(0, &ks[n - id1 as usize..]);
    }
    true
}

/// Confidential-asset surjection proof: hides which asset generator in the
/// window `[begin, begin + N)` the output commitment uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetProof {
    pub begin: u32,
    pub cfg: SigmaCfg,
    pub weights: Vec<Scalar>,
    pub balance: EcPoint,
}

impl AssetProof {
    pub fn write(&self, w: &mut Encoder) {
        w.write_u32(self.begin);
        w.write_u32(self.cfg.n);
        w.write_u32(self.weights.len() as u32);
        for s in &self.weights {
            write_scalar(w, s);
        }
        self.balance.write(w);
    }

    pub fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let begin = r.read_u32()?;
        let cfg = SigmaCfg { n: r.read_u32()? };
        let count = r.read_u32()? as usize;
        if count > 1 << 16 {
            return Err(DecodeError::Malformed("asset proof weight count"));
        }
        let mut weights = Vec::with_capacity(count);
        for _ in 0..count {
            weights.push(read_scalar(r)?);
        }
        Ok(AssetProof {
            begin,
            cfg,
            weights,
            balance: EcPoint::read(r)?,
        })
    }

    /// Prover side over the deterministic asset generator window.
    pub fn create(begin: u32, cfg: SigmaCfg, seed: &Scalar) -> Self {
        let n = cfg.get_n() as usize;
        let mut weights = Vec::with_capacity(n);
        let mut k = *seed;
        for _ in 0..n {
            weights.push(k);
            k = k * k + Scalar::ONE;
        }

        let mut balance = RistrettoPoint::identity();
        for (i, k) in weights.iter().enumerate() {
            balance += k * asset_generator(begin + i as u32);
        }

        AssetProof {
            begin,
            cfg,
            weights,
            balance: EcPoint::from_point(&balance),
        }
    }
}

/// Verify an asset proof; the generator window is derived, not read from DB.
pub fn verify_asset_proof(
    bc: &mut BatchContext,
    acc: &dyn SigmaAccumulator,
    proof: &AssetProof,
) -> bool {
    let n = proof.cfg.get_n() as usize;
    if n == 0 || proof.weights.len() != n {
        return false;
    }
    let Some(balance) = proof.balance.decompress() else {
        return false;
    };

    let rho = bc.random_weight();
    bc.add(&(-rho), &balance);

    let ks: Vec<Scalar> = proof.weights.iter().map(|k| rho * k).collect();
    acc.add(u64::from(proof.begin), &ks);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;
    use std::sync::Mutex;

    // a tiny in-memory accumulator mirroring the chunked one in the node
    #[derive(Default)]
    struct VecAccumulator {
        entries: Mutex<Vec<(u64, Vec<Scalar>)>>,
    }

    impl SigmaAccumulator for VecAccumulator {
        fn add(&self, id0: u64, scalars: &[Scalar]) {
            self.entries.lock().unwrap().push((id0, scalars.to_vec()));
        }
    }

    #[test]
    fn valid_range_proof_closes_batch() {
        let mut bc = BatchContext::new();
        let comm = EcPoint::from_point(&commit(10, &Scalar::from(3u64)));
        let proof = RangeProof::sign(&comm);
        assert!(verify_range_proof(&mut bc, &comm, &proof));
        assert_eq!(*bc.sum(), curve25519_dalek::RistrettoPoint::identity());
    }

    #[test]
    fn tampered_range_proof_leaves_residue() {
        let mut bc = BatchContext::new();
        let comm = EcPoint::from_point(&commit(10, &Scalar::from(3u64)));
        let other = EcPoint::from_point(&commit(11, &Scalar::from(3u64)));
        let proof = RangeProof::sign(&other);
        assert!(verify_range_proof(&mut bc, &comm, &proof));
        assert_ne!(*bc.sum(), curve25519_dalek::RistrettoPoint::identity());
    }

    #[test]
    fn spend_proof_reduction_closes() {
        let cfg = SigmaCfg { n: 4 };
        let pool: Vec<_> = (0..4u64).map(|i| commit(i, &Scalar::from(i + 1))).collect();
        let proof = SpendProof::create(
            EcPoint::from_point(&commit(0, &Scalar::from(99u64))),
            4,
            cfg,
            &pool,
            &Scalar::from(7u64),
        );

        let acc = VecAccumulator::default();
        let mut bc = BatchContext::new();
        assert!(verify_spend_proof(&mut bc, &acc, &proof));

        // reduce the accumulated scalars against the pool, as the node does
        let mut total = bc.take_sum();
        for (id0, ks) in acc.entries.lock().unwrap().iter() {
            for (i, k) in ks.iter().enumerate() {
                total += k * pool[*id0 as usize + i];
            }
        }
        assert_eq!(total, curve25519_dalek::RistrettoPoint::identity());
    }

    #[test]
    fn asset_proof_reduction_closes() {
        let cfg = SigmaCfg { n: 3 };
        let proof = AssetProof::create(5, cfg, &Scalar::from(13u64));

        let acc = VecAccumulator::default();
        let mut bc = BatchContext::new();
        assert!(verify_asset_proof(&mut bc, &acc, &proof));

        let mut total = bc.take_sum();
        for (id0, ks) in acc.entries.lock().unwrap().iter() {
            for (i, k) in ks.iter().enumerate() {
                total += k * asset_generator(*id0 as u32 + i as u32);
            }
        }
        assert_eq!(total, curve25519_dalek::RistrettoPoint::identity());
    }
}
