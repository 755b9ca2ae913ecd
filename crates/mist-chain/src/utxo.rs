//! The UTXO tree: an ordered map from `(commitment, maturity)` to the txo
//! ids living under that key, with counted duplicates, plus the on-disk
//! image with its hash-chained stamp.

use crate::error::{corrupt, ChainResult};
use mist_primitives::{EcPoint, Encoder, Hash32, Hasher, Height, TxoId};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Tree key. Ordering is commitment-major, so all maturities of one
/// commitment form a contiguous range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UtxoKey {
    pub commitment: EcPoint,
    pub maturity: Height,
}

/// Leaf payload: LIFO stack of txo ids sharing the key. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoLeaf {
    pub ids: Vec<TxoId>,
}

/// The in-memory UTXO set, rebuilt from the txo store when the image file
/// cannot be trusted.
pub struct UtxoTree {
    map: BTreeMap<UtxoKey, UtxoLeaf>,
    dirty: bool,
    cached_root: Option<Hash32>,
}

impl UtxoTree {
    pub fn new() -> Self {
        UtxoTree {
            map: BTreeMap::new(),
            dirty: false,
            cached_root: None,
        }
    }

    /// Number of distinct leaves.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Total txo ids across all leaves (equals the number of unspent outputs).
    pub fn total_ids(&self) -> u64 {
        self.map.values().map(|l| l.ids.len() as u64).sum()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Leaf with the minimum maturity in `[0, max_maturity]` for the
    /// commitment, i.e. the one an input consumes.
    pub fn find_spendable(&self, commitment: &EcPoint, max_maturity: Height) -> Option<UtxoKey> {
        let lo = UtxoKey {
            commitment: *commitment,
            maturity: 0,
        };
        let hi = UtxoKey {
            commitment: *commitment,
            maturity: max_maturity,
        };
        self.map.range(lo..=hi).next().map(|(k, _)| *k)
    }

    /// Total duplicate count within `[0, max_maturity]`; used by loose-tx
    /// input validation where several inputs may share a commitment.
    pub fn count_in_range(&self, commitment: &EcPoint, max_maturity: Height) -> u64 {
        let lo = UtxoKey {
            commitment: *commitment,
            maturity: 0,
        };
        let hi = UtxoKey {
            commitment: *commitment,
            maturity: max_maturity,
        };
        self.map.range(lo..=hi).map(|(_, l)| l.ids.len() as u64).sum()
    }

    /// Push a txo id under the key (insert on first).
    pub fn push(&mut self, key: UtxoKey, id: TxoId) {
        self.mark_dirty();
        self.map
            .entry(key)
            .or_insert_with(|| UtxoLeaf { ids: Vec::new() })
            .ids
            .push(id);
    }

    /// Pop the most recent txo id under the key; removes the leaf when the
    /// last duplicate goes.
    pub fn pop(&mut self, key: &UtxoKey) -> ChainResult<TxoId> {
        self.mark_dirty();
        let leaf = self.map.get_mut(key).ok_or(corrupt("utxo leaf missing"))?;
        let id = leaf.ids.pop().ok_or(corrupt("utxo leaf empty"))?;
        if leaf.ids.is_empty() {
            self.map.remove(key);
        }
        Ok(id)
    }

    pub fn get(&self, key: &UtxoKey) -> Option<&UtxoLeaf> {
        self.map.get(key)
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
        self.cached_root = None;
    }

    /// Commitment to the whole tree contents, fed into the definition hash.
    pub fn root(&mut self) -> Hash32 {
        if let Some(r) = self.cached_root {
            return r;
        }
        let mut h = Hasher::with_tag("mist.utxo");
        h.write_u64(self.map.len() as u64);
        for (key, leaf) in &self.map {
            h.write(&key.commitment.0);
            h.write_u64(key.maturity);
            h.write_u64(leaf.ids.len() as u64);
            for id in &leaf.ids {
                h.write_u64(*id);
            }
        }
        let root = h.finalize();
        self.cached_root = Some(root);
        root
    }
}

impl Default for UtxoTree {
    fn default() -> Self {
        Self::new()
    }
}

const IMAGE_MAGIC: &[u8; 8] = b"MISTUTXO";
const IMAGE_VERSION: u32 = 1;

/// Derive the image path from the database path: a trailing `.db` is
/// replaced, anything else gets the suffix appended.
pub fn image_path(db_path: &Path) -> PathBuf {
    let s = db_path.to_string_lossy();
    let base = s
        .strip_suffix(".db")
        .map(str::to_owned)
        .unwrap_or_else(|| s.into_owned());
    PathBuf::from(base + "-utxo-image.bin")
}

/// Write the tree image stamped with `stamp`.
pub fn save_image(path: &Path, stamp: &Hash32, tree: &UtxoTree) -> ChainResult<()> {
    let mut enc = Encoder::new();
    enc.write_raw(IMAGE_MAGIC);
    enc.write_u32(IMAGE_VERSION);
    enc.write_hash(stamp);
    enc.write_u64(tree.map.len() as u64);
    for (key, leaf) in &tree.map {
        key.commitment.write(&mut enc);
        enc.write_u64(key.maturity);
        enc.write_u64(leaf.ids.len() as u64);
        for id in &leaf.ids {
            enc.write_u64(*id);
        }
    }

    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&enc.into_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    debug!(?path, "UTXO image written");
    Ok(())
}

/// Load the image if present and stamped as expected; `None` on absence,
/// stamp mismatch, or any structural damage (the caller rebuilds).
pub fn load_image(path: &Path, expected_stamp: &Hash32) -> ChainResult<Option<UtxoTree>> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let parse = || -> Result<Option<UtxoTree>, mist_primitives::DecodeError> {
        let mut dec = mist_primitives::Decoder::new(&bytes);
        if dec.read_raw(8)? != IMAGE_MAGIC {
            return Ok(None);
        }
        if dec.read_u32()? != IMAGE_VERSION {
            return Ok(None);
        }
        let stamp = dec.read_hash()?;
        if stamp != *expected_stamp {
            return Ok(None);
        }
        let count = dec.read_u64()?;
        let mut tree = UtxoTree::new();
        for _ in 0..count {
            let commitment = EcPoint::read(&mut dec)?;
            let maturity = dec.read_u64()?;
            let n = dec.read_u64()? as usize;
            let mut ids = Vec::with_capacity(n);
            for _ in 0..n {
                ids.push(dec.read_u64()?);
            }
            if ids.is_empty() {
                return Err(mist_primitives::DecodeError::Malformed("empty utxo leaf"));
            }
            tree.map.insert(UtxoKey { commitment, maturity }, UtxoLeaf { ids });
        }
        dec.finish()?;
        Ok(Some(tree))
    };

    match parse() {
        Ok(t) => Ok(t),
        // damaged image is the same as no image
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(b: u8, maturity: Height) -> UtxoKey {
        UtxoKey {
            commitment: EcPoint([b; 32]),
            maturity,
        }
    }

    #[test]
    fn find_spendable_picks_min_maturity() {
        let mut tree = UtxoTree::new();
        tree.push(key(1, 10), 100);
        tree.push(key(1, 5), 101);
        tree.push(key(1, 20), 102);

        let found = tree.find_spendable(&EcPoint([1; 32]), 15).unwrap();
        assert_eq!(found.maturity, 5);
        assert!(tree.find_spendable(&EcPoint([1; 32]), 4).is_none());
        assert!(tree.find_spendable(&EcPoint([2; 32]), 100).is_none());
    }

    #[test]
    fn duplicates_are_lifo() {
        let mut tree = UtxoTree::new();
        let k = key(3, 7);
        tree.push(k, 1);
        tree.push(k, 2);
        tree.push(k, 3);
        assert_eq!(tree.total_ids(), 3);
        assert_eq!(tree.len(), 1);

        assert_eq!(tree.pop(&k).unwrap(), 3);
        assert_eq!(tree.pop(&k).unwrap(), 2);
        assert_eq!(tree.pop(&k).unwrap(), 1);
        assert!(tree.get(&k).is_none());
        assert!(tree.pop(&k).is_err());
    }

    #[test]
    fn root_changes_with_content() {
        let mut tree = UtxoTree::new();
        let r0 = tree.root();
        tree.push(key(1, 1), 5);
        let r1 = tree.root();
        assert_ne!(r0, r1);
        tree.pop(&key(1, 1)).unwrap();
        assert_eq!(tree.root(), r0);
    }

    #[test]
    fn image_round_trip_and_stamp_check() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("node.db");
        let img = image_path(&path);
        assert!(img.to_string_lossy().ends_with("node-utxo-image.bin"));

        let mut tree = UtxoTree::new();
        tree.push(key(1, 2), 10);
        tree.push(key(1, 2), 11);
        tree.push(key(9, 5), 12);
        let root = tree.root();

        let stamp = mist_primitives::hash_of(b"stamp");
        save_image(&img, &stamp, &tree).unwrap();

        let mut loaded = load_image(&img, &stamp).unwrap().expect("image accepted");
        assert_eq!(loaded.root(), root);
        assert_eq!(loaded.total_ids(), 3);

        let wrong = mist_primitives::hash_of(b"other");
        assert!(load_image(&img, &wrong).unwrap().is_none());
        assert!(load_image(&tmp.path().join("absent"), &stamp).unwrap().is_none());
    }
}
