//! Block headers (system states).

use crate::difficulty::{chainwork_from_bytes, chainwork_to_bytes, Difficulty};
use crate::encode::{DecodeError, Decoder, Deserialize, Encoder, Serialize};
use crate::hash::{Hash32, Hasher};
use num_bigint::BigUint;

/// Block height. Genesis is height 1; height 0 is the prehistoric anchor.
pub type Height = u64;

/// A block header: the "state" a peer announces before sending the body.
///
/// `definition` commits to the live state after the block (history root
/// folded with the UTXO, shielded and asset MMR roots); `kernels_root` is
/// the Merkle root over the body's kernel ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub height: Height,
    pub prev: Hash32,
    pub chainwork: BigUint,
    pub timestamp: u64,
    pub difficulty: Difficulty,
    pub definition: Hash32,
    pub kernels_root: Hash32,
}

impl BlockHeader {
    /// Header id: hash of the canonical encoding.
    pub fn id(&self) -> Hash32 {
        let mut h = Hasher::with_tag("mist.hdr");
        h.write(&self.to_bytes());
        h.finalize()
    }

    /// Context-free schema sanity. PoW solution verification is delegated
    /// to the host; this only rejects structurally impossible headers.
    pub fn sanity_ok(&self) -> bool {
        if self.height == 0 {
            return false;
        }
        if self.timestamp == 0 {
            return false;
        }
        // chainwork must at least cover this block's own difficulty
        self.chainwork >= self.difficulty.unpack()
    }
}

impl Serialize for BlockHeader {
    fn write(&self, w: &mut Encoder) {
        w.write_u64(self.height);
        w.write_hash(&self.prev);
        w.write_raw(&chainwork_to_bytes(&self.chainwork));
        w.write_u64(self.timestamp);
        self.difficulty.write(w);
        w.write_hash(&self.definition);
        w.write_hash(&self.kernels_root);
    }
}

impl Deserialize for BlockHeader {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(BlockHeader {
            height: r.read_u64()?,
            prev: r.read_hash()?,
            chainwork: chainwork_from_bytes(r.read_raw(32)?),
            timestamp: r.read_u64()?,
            difficulty: Difficulty::read(r)?,
            definition: r.read_hash()?,
            kernels_root: r.read_hash()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> BlockHeader {
        BlockHeader {
            height: 10,
            prev: crate::hash::hash_of(b"prev"),
            chainwork: BigUint::from(1u32) << 30,
            timestamp: 1_700_000_000,
            difficulty: Difficulty::from_parts(3, 42),
            definition: crate::hash::hash_of(b"def"),
            kernels_root: crate::hash::hash_of(b"krn"),
        }
    }

    #[test]
    fn header_round_trip() {
        let hdr = sample_header();
        let decoded = BlockHeader::from_bytes(&hdr.to_bytes()).unwrap();
        assert_eq!(decoded, hdr);
        assert_eq!(decoded.id(), hdr.id());
    }

    #[test]
    fn id_depends_on_every_field() {
        let hdr = sample_header();
        let mut other = hdr.clone();
        other.timestamp += 1;
        assert_ne!(hdr.id(), other.id());
    }

    #[test]
    fn sanity_rejects_zero_height() {
        let mut hdr = sample_header();
        hdr.height = 0;
        assert!(!hdr.sanity_ok());
    }
}
