//! Packed proof-of-work difficulty and cumulative chainwork.
//!
//! Difficulty is a floating-point-like u32: 8 bits of binary order, 24 bits
//! of mantissa with an implicit leading one. The unpacked value feeds the
//! `BigUint` chainwork accumulator; the packed form travels in headers.

use crate::encode::{DecodeError, Decoder, Encoder};
use num_bigint::BigUint;

const MANTISSA_BITS: u32 = 24;
const MANTISSA_ONE: u32 = 1 << MANTISSA_BITS;
const MANTISSA_MASK: u32 = MANTISSA_ONE - 1;
const MAX_ORDER: u32 = 231;

/// Packed difficulty: `(order << 24) | mantissa`, value `(2^24 + mantissa) << order`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Difficulty(pub u32);

impl Difficulty {
    /// The lowest representable difficulty.
    pub const MIN: Difficulty = Difficulty(0);

    pub fn from_parts(order: u32, mantissa: u32) -> Self {
        debug_assert!(order <= MAX_ORDER);
        Difficulty((order << MANTISSA_BITS) | (mantissa & MANTISSA_MASK))
    }

    pub fn order(&self) -> u32 {
        self.0 >> MANTISSA_BITS
    }

    pub fn mantissa(&self) -> u32 {
        self.0 & MANTISSA_MASK
    }

    /// Expand to the full-precision work value.
    pub fn unpack(&self) -> BigUint {
        BigUint::from(MANTISSA_ONE + self.mantissa()) << self.order()
    }

    /// Round a work value down to the nearest representable difficulty.
    pub fn pack(value: &BigUint) -> Self {
        let bits = value.bits();
        if bits <= u64::from(MANTISSA_BITS) {
            return Difficulty::MIN;
        }
        let mut order = (bits - 1 - u64::from(MANTISSA_BITS)) as u32;
        if order > MAX_ORDER {
            order = MAX_ORDER;
        }
        let shifted = value >> order;
        // after the shift the value fits in 25 bits unless the order was clamped
        let mantissa = if shifted.bits() > u64::from(MANTISSA_BITS) + 1 {
            MANTISSA_MASK
        } else {
            shifted
                .iter_u32_digits()
                .next()
                .unwrap_or(0)
                .wrapping_sub(MANTISSA_ONE)
                & MANTISSA_MASK
        };
        Difficulty::from_parts(order, mantissa)
    }

    /// Solve the retarget equation.
    ///
    /// The next difficulty is the observed work rate scaled to the target
    /// cadence: `work_delta * dt_target / (height_delta * dt_source)`.
    pub fn calculate(work_delta: &BigUint, height_delta: u32, dt_target_s: u32, dt_source_s: u32) -> Self {
        let dh = height_delta.max(1);
        let dt_src = dt_source_s.max(1);

        let num = work_delta * dt_target_s;
        let den = BigUint::from(dh) * BigUint::from(dt_src);
        let val = num / den;
        Difficulty::pack(&val)
    }

    pub fn write(&self, w: &mut Encoder) {
        w.write_u32(self.0);
    }

    pub fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Difficulty(r.read_u32()?))
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}-{:06x}", self.order(), self.mantissa())
    }
}

/// Serialize chainwork as fixed 32 bytes big-endian (DB key ordering relies on it).
pub fn chainwork_to_bytes(work: &BigUint) -> [u8; 32] {
    let raw = work.to_bytes_be();
    let mut out = [0u8; 32];
    let start = 32usize.saturating_sub(raw.len());
    let src = if raw.len() > 32 { &raw[raw.len() - 32..] } else { &raw[..] };
    out[start..].copy_from_slice(src);
    out
}

pub fn chainwork_from_bytes(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        for order in [0u32, 1, 7, 40] {
            for mantissa in [0u32, 1, 0x5a5a5a, MANTISSA_MASK] {
                let d = Difficulty::from_parts(order, mantissa);
                let packed = Difficulty::pack(&d.unpack());
                assert_eq!(packed, d, "order={order} mantissa={mantissa}");
            }
        }
    }

    #[test]
    fn pack_floors_small_values() {
        assert_eq!(Difficulty::pack(&BigUint::from(1u32)), Difficulty::MIN);
        assert_eq!(Difficulty::pack(&BigUint::from(0u32)), Difficulty::MIN);
    }

    #[test]
    fn calculate_scales_with_timing() {
        let d0 = Difficulty::from_parts(4, 0);
        let work = d0.unpack() * 10u32; // 10 blocks at d0

        // on-target timing keeps the difficulty
        let same = Difficulty::calculate(&work, 10, 600, 600);
        assert_eq!(same, d0);

        // blocks twice as fast -> difficulty doubles
        let double = Difficulty::calculate(&work, 10, 600, 300);
        assert_eq!(double.unpack(), d0.unpack() * 2u32);

        // blocks twice as slow -> difficulty halves
        let half = Difficulty::calculate(&work, 10, 600, 1200);
        assert_eq!(half.unpack(), d0.unpack() / 2u32);
    }

    #[test]
    fn chainwork_bytes_round_trip() {
        let w = BigUint::from(0x1234_5678_9abc_def0u64) << 100;
        let bytes = chainwork_to_bytes(&w);
        assert_eq!(chainwork_from_bytes(&bytes), w);
    }
}
