//! BLAKE2b-256 hashing and the 32-byte hash newtype used across the chain.

use blake2::digest::consts::{U32, U64};
use blake2::{Blake2b, Digest};

type Blake2b256 = Blake2b<U32>;
type Blake2b512 = Blake2b<U64>;

/// A 32-byte BLAKE2b-256 digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// The all-zero hash.
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    /// Build from a slice; returns `None` unless it is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 32 {
            return None;
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Some(Hash32(arr))
    }

    /// Whether this is the all-zero hash.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for Hash32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash32 {
    fn from(arr: [u8; 32]) -> Self {
        Hash32(arr)
    }
}

impl std::fmt::Display for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Incremental BLAKE2b-256 hasher.
pub struct Hasher(Blake2b256);

impl Hasher {
    pub fn new() -> Self {
        Hasher(Blake2b256::new())
    }

    /// Domain-separated hasher; the tag is hashed first with its length.
    pub fn with_tag(tag: &str) -> Self {
        let mut h = Self::new();
        h.write(&(tag.len() as u32).to_le_bytes());
        h.write(tag.as_bytes());
        h
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn write_hash(&mut self, hv: &Hash32) -> &mut Self {
        self.write(&hv.0)
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    pub fn finalize(self) -> Hash32 {
        let out = self.0.finalize();
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&out);
        Hash32(arr)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot hash of a byte slice.
pub fn hash_of(bytes: &[u8]) -> Hash32 {
    let mut h = Hasher::new();
    h.write(bytes);
    h.finalize()
}

/// Hash of two child hashes, used by every Merkle structure in the chain.
pub fn hash_children(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut h = Hasher::new();
    h.write(&left.0);
    h.write(&right.0);
    h.finalize()
}

/// 64-byte digest, used to derive curve points from labels.
pub fn hash_wide(bytes: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut arr = [0u8; 64];
    arr.copy_from_slice(&out);
    arr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let a = hash_of(b"mist");
        let b = hash_of(b"mist");
        assert_eq!(a, b);
        assert_ne!(a, hash_of(b"mist2"));
    }

    #[test]
    fn children_order_matters() {
        let a = hash_of(b"a");
        let b = hash_of(b"b");
        assert_ne!(hash_children(&a, &b), hash_children(&b, &a));
    }

    #[test]
    fn from_slice_rejects_bad_length() {
        assert!(Hash32::from_slice(&[0u8; 31]).is_none());
        assert!(Hash32::from_slice(&[0u8; 32]).is_some());
    }
}
