//! Ristretto-based Pedersen commitments and the generator set.
//!
//! `G` blinds, `H` carries the native value, and every confidential asset
//! gets its own generator derived from its id. Stored and wire forms are
//! always compressed points; arithmetic happens on decompressed points.

use crate::encode::{DecodeError, Decoder, Encoder};
use crate::hash::{hash_wide, Hash32};
use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::CompressedRistretto;
use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
pub use curve25519_dalek::Scalar;

/// A compressed curve point as it appears on the wire and in the DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EcPoint(pub [u8; 32]);

impl EcPoint {
    pub const ZERO: EcPoint = EcPoint([0u8; 32]);

    pub fn from_point(p: &RistrettoPoint) -> Self {
        EcPoint(p.compress().to_bytes())
    }

    /// Decompress; `None` for invalid encodings.
    pub fn decompress(&self) -> Option<RistrettoPoint> {
        CompressedRistretto(self.0).decompress()
    }

    pub fn identity() -> Self {
        EcPoint::from_point(&RistrettoPoint::identity())
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    pub fn write(&self, w: &mut Encoder) {
        w.write_raw(&self.0);
    }

    pub fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let b = r.read_raw(32)?;
        let mut arr = [0u8; 32];
        arr.copy_from_slice(b);
        Ok(EcPoint(arr))
    }
}

impl PartialOrd for EcPoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EcPoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl std::fmt::Display for EcPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// The blinding generator.
pub fn generator_g() -> RistrettoPoint {
    RISTRETTO_BASEPOINT_POINT
}

/// The native value generator.
pub fn generator_h() -> RistrettoPoint {
    point_from_label(b"mist.generator.H")
}

/// Deterministic generator for a confidential asset id (1-based).
pub fn asset_generator(asset_id: u32) -> RistrettoPoint {
    let mut label = Vec::with_capacity(24);
    label.extend_from_slice(b"mist.generator.asset");
    label.extend_from_slice(&asset_id.to_le_bytes());
    point_from_label(&label)
}

fn point_from_label(label: &[u8]) -> RistrettoPoint {
    RistrettoPoint::from_uniform_bytes(&hash_wide(label))
}

/// `blinding * G + value * H`.
pub fn commit(value: u64, blinding: &Scalar) -> RistrettoPoint {
    blinding * generator_g() + Scalar::from(value) * generator_h()
}

/// `blinding * G + value * asset_generator(id)`.
pub fn commit_asset(value: u64, blinding: &Scalar, asset_id: u32) -> RistrettoPoint {
    blinding * generator_g() + Scalar::from(value) * asset_generator(asset_id)
}

/// Scalar wire helpers (canonical 32-byte little-endian form).
pub fn write_scalar(w: &mut Encoder, s: &Scalar) {
    w.write_raw(&s.to_bytes());
}

pub fn read_scalar(r: &mut Decoder<'_>) -> Result<Scalar, DecodeError> {
    let b = r.read_raw(32)?;
    let mut arr = [0u8; 32];
    arr.copy_from_slice(b);
    let opt: Option<Scalar> = Scalar::from_canonical_bytes(arr).into();
    opt.ok_or(DecodeError::Malformed("scalar"))
}

/// Derive a scalar from a hash, for deterministic blinding chains.
pub fn scalar_from_hash(hv: &Hash32) -> Scalar {
    let mut wide = [0u8; 64];
    wide[..32].copy_from_slice(&hv.0);
    wide[32..].copy_from_slice(&hash_wide(&hv.0)[..32]);
    Scalar::from_bytes_mod_order_wide(&wide)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_are_distinct() {
        assert_ne!(generator_g(), generator_h());
        assert_ne!(generator_h(), asset_generator(1));
        assert_ne!(asset_generator(1), asset_generator(2));
    }

    #[test]
    fn commitments_are_homomorphic() {
        let b1 = Scalar::from(11u64);
        let b2 = Scalar::from(17u64);
        let sum = commit(5, &b1) + commit(7, &b2);
        assert_eq!(sum, commit(12, &(b1 + b2)));
    }

    #[test]
    fn point_round_trips_through_compression() {
        let p = commit(42, &Scalar::from(9u64));
        let c = EcPoint::from_point(&p);
        assert_eq!(c.decompress().unwrap(), p);
    }
}
