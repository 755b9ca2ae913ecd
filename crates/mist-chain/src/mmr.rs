//! Merkle Mountain Ranges.
//!
//! Nodes are stored in postorder positions (0-based). The three chain
//! accumulators (states, shielded elements, assets) persist their nodes in
//! dedicated DB streams; per-block kernel roots use the in-memory store.
//! Assets additionally support leaf replacement and shrinking, since the
//! registry is mutable.

use crate::chain_db::ParamId;
use crate::error::{corrupt, ChainResult};
use mist_primitives::{hash_children, Hash32};
use mist_storage::{ColumnFamily as Cf, Storage};
use std::sync::Arc;

fn all_ones(v: u64) -> bool {
    v != 0 && v.count_ones() == 64 - v.leading_zeros()
}

fn most_significant_bit(v: u64) -> u64 {
    1u64 << (63 - v.leading_zeros())
}

/// Height of the node at 0-based postorder position `pos`.
fn node_height(pos: u64) -> u32 {
    let mut v = pos + 1;
    while !all_ones(v) {
        v -= most_significant_bit(v) - 1;
    }
    63 - v.leading_zeros()
}

/// Number of stored nodes for `n` leaves.
pub fn size_for_leaves(n: u64) -> u64 {
    if n == 0 {
        0
    } else {
        2 * n - u64::from(n.count_ones())
    }
}

/// Postorder position of leaf `i`.
fn leaf_pos(i: u64) -> u64 {
    2 * i - u64::from(i.count_ones())
}

/// Leaves contained in a well-formed MMR of `size` nodes.
pub fn leaves_for_size(size: u64) -> u64 {
    let mut leaves = 0u64;
    let mut rest = size;
    while rest > 0 {
        let mut h = 63 - (rest + 1).leading_zeros();
        while (1u64 << h) - 1 > rest {
            h -= 1;
        }
        let tree = (1u64 << h) - 1;
        leaves += (tree + 1) / 2;
        rest -= tree;
    }
    leaves
}

/// Peak positions left to right for a well-formed MMR of `size` nodes.
fn peaks(size: u64) -> Vec<u64> {
    let mut out = Vec::new();
    let mut left = 0u64;
    let mut rest = size;
    while rest > 0 {
        let mut h = 63 - (rest + 1).leading_zeros();
        while (1u64 << h) - 1 > rest {
            h -= 1;
        }
        let tree = (1u64 << h) - 1;
        out.push(left + tree - 1);
        left += tree;
        rest -= tree;
    }
    out
}

/// Node storage behind an MMR.
pub trait MmrStore {
    fn len(&self) -> u64;
    fn get(&self, pos: u64) -> ChainResult<Hash32>;
    fn append(&mut self, h: &Hash32) -> ChainResult<()>;
    fn put(&mut self, pos: u64, h: &Hash32) -> ChainResult<()>;
    fn truncate(&mut self, len: u64) -> ChainResult<()>;
}

/// In-memory node store.
#[derive(Default)]
pub struct MemMmrStore {
    nodes: Vec<Hash32>,
}

impl MmrStore for MemMmrStore {
    fn len(&self) -> u64 {
        self.nodes.len() as u64
    }

    fn get(&self, pos: u64) -> ChainResult<Hash32> {
        self.nodes
            .get(pos as usize)
            .copied()
            .ok_or(corrupt("mmr node missing"))
    }

    fn append(&mut self, h: &Hash32) -> ChainResult<()> {
        self.nodes.push(*h);
        Ok(())
    }

    fn put(&mut self, pos: u64, h: &Hash32) -> ChainResult<()> {
        let slot = self
            .nodes
            .get_mut(pos as usize)
            .ok_or(corrupt("mmr node missing"))?;
        *slot = *h;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> ChainResult<()> {
        self.nodes.truncate(len as usize);
        Ok(())
    }
}

/// DB-stream node store; node count is persisted as a parameter so reopening
/// is O(1).
pub struct DbMmrStore {
    storage: Arc<dyn Storage>,
    cf: Cf,
    count_param: ParamId,
    len: u64,
}

impl DbMmrStore {
    pub fn open(
        storage: Arc<dyn Storage>,
        cf: Cf,
        count_param: ParamId,
    ) -> ChainResult<Self> {
        let len = match storage.get(Cf::Params, count_param.key())? {
            Some(v) if v.len() == 8 => u64::from_le_bytes(v.try_into().unwrap()),
            Some(_) => return Err(corrupt("mmr count param shape")),
            None => 0,
        };
        Ok(DbMmrStore {
            storage,
            cf,
            count_param,
            len,
        })
    }

    fn persist_len(&self) -> ChainResult<()> {
        self.storage
            .put(Cf::Params, self.count_param.key(), &self.len.to_le_bytes())?;
        Ok(())
    }
}

impl MmrStore for DbMmrStore {
    fn len(&self) -> u64 {
        self.len
    }

    fn get(&self, pos: u64) -> ChainResult<Hash32> {
        let v = self
            .storage
            .get(self.cf, &pos.to_be_bytes())?
            .ok_or(corrupt("mmr node missing"))?;
        Hash32::from_slice(&v).ok_or(corrupt("mmr node shape"))
    }

    fn append(&mut self, h: &Hash32) -> ChainResult<()> {
        self.storage.put(self.cf, &self.len.to_be_bytes(), &h.0)?;
        self.len += 1;
        self.persist_len()
    }

    fn put(&mut self, pos: u64, h: &Hash32) -> ChainResult<()> {
        if pos >= self.len {
            return Err(corrupt("mmr put out of range"));
        }
        self.storage.put(self.cf, &pos.to_be_bytes(), &h.0)?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> ChainResult<()> {
        for pos in len..self.len {
            self.storage.delete(self.cf, &pos.to_be_bytes())?;
        }
        self.len = len;
        self.persist_len()
    }
}

/// One inclusion-proof step: the sibling hash and whether it sits left of
/// the running value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub hash: Hash32,
    pub on_left: bool,
}

/// Merkle inclusion proof, inner siblings first, peak bagging last.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MerkleProof {
    pub steps: Vec<ProofStep>,
}

impl MerkleProof {
    /// Fold the proof over a leaf hash, yielding the implied root.
    pub fn apply(&self, leaf: &Hash32) -> Hash32 {
        let mut cur = *leaf;
        for step in &self.steps {
            cur = if step.on_left {
                hash_children(&step.hash, &cur)
            } else {
                hash_children(&cur, &step.hash)
            };
        }
        cur
    }
}

/// MMR algorithms over a node store.
pub struct Mmr<S: MmrStore> {
    store: S,
}

impl<S: MmrStore> Mmr<S> {
    pub fn new(store: S) -> Self {
        Mmr { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn node_count(&self) -> u64 {
        self.store.len()
    }

    pub fn leaf_count(&self) -> u64 {
        leaves_for_size(self.store.len())
    }

    /// Append a leaf, writing its parents as mountains merge.
    pub fn append(&mut self, leaf: &Hash32) -> ChainResult<()> {
        self.store.append(leaf)?;
        let mut cur = *leaf;
        let mut height = 0u32;
        while node_height(self.store.len()) > height {
            let left_pos = self.store.len() - (2u64 << height);
            let left = self.store.get(left_pos)?;
            cur = hash_children(&left, &cur);
            self.store.append(&cur)?;
            height += 1;
        }
        Ok(())
    }

    /// Replace leaf `i` and recompute its mountain path.
    pub fn replace(&mut self, i: u64, leaf: &Hash32) -> ChainResult<()> {
        let mut pos = leaf_pos(i);
        let mut height = 0u32;
        let mut cur = *leaf;
        self.store.put(pos, &cur)?;
        loop {
            let (parent, sibling, sib_on_left) = if node_height(pos + 1) == height + 1 {
                (pos + 1, pos - ((2u64 << height) - 1), true)
            } else {
                (pos + (2u64 << height), pos + (2u64 << height) - 1, false)
            };
            if parent >= self.store.len() {
                break;
            }
            let sib = self.store.get(sibling)?;
            cur = if sib_on_left {
                hash_children(&sib, &cur)
            } else {
                hash_children(&cur, &sib)
            };
            self.store.put(parent, &cur)?;
            pos = parent;
            height += 1;
        }
        Ok(())
    }

    /// Extend with zero leaves up to `n` leaves (asset registry growth).
    pub fn resize_to(&mut self, n: u64) -> ChainResult<()> {
        while self.leaf_count() < n {
            self.append(&Hash32::ZERO)?;
        }
        Ok(())
    }

    /// Drop leaves beyond `n`.
    pub fn shrink_to(&mut self, n: u64) -> ChainResult<()> {
        let size = size_for_leaves(n);
        if size > self.store.len() {
            return Err(corrupt("mmr shrink beyond size"));
        }
        self.store.truncate(size)
    }

    /// Root: peaks bagged right to left.
    pub fn root(&self) -> ChainResult<Hash32> {
        let size = self.store.len();
        if size == 0 {
            return Ok(Hash32::ZERO);
        }
        let pk = peaks(size);
        let mut acc = self.store.get(*pk.last().expect("non-empty"))?;
        for pos in pk.iter().rev().skip(1) {
            let left = self.store.get(*pos)?;
            acc = hash_children(&left, &acc);
        }
        Ok(acc)
    }

    /// Predicted root after appending one more leaf, without mutating the
    /// store. Used for the cursor's `history_next`.
    pub fn predicted_root(&self, leaf: &Hash32) -> ChainResult<Hash32> {
        // simulate the append on a stack of (height, hash) pending peaks
        let size = self.store.len();
        let pk = peaks(size);
        let mut stack: Vec<(u32, Hash32)> = Vec::with_capacity(pk.len() + 1);
        for pos in &pk {
            stack.push((node_height(*pos), self.store.get(*pos)?));
        }
        let mut cur = (0u32, *leaf);
        while let Some(&(h, top)) = stack.last() {
            if h != cur.0 {
                break;
            }
            stack.pop();
            cur = (h + 1, hash_children(&top, &cur.1));
        }
        stack.push(cur);
        let mut acc = stack.last().expect("non-empty").1;
        for (_, hash) in stack.iter().rev().skip(1) {
            acc = hash_children(hash, &acc);
        }
        Ok(acc)
    }

    /// Inclusion proof for leaf `i`.
    pub fn proof(&self, i: u64) -> ChainResult<MerkleProof> {
        let size = self.store.len();
        if leaf_pos(i) >= size {
            return Err(corrupt("mmr proof out of range"));
        }

        let mut steps = Vec::new();
        let mut pos = leaf_pos(i);
        let mut height = 0u32;
        loop {
            let (parent, sibling, sib_on_left) = if node_height(pos + 1) == height + 1 {
                (pos + 1, pos - ((2u64 << height) - 1), true)
            } else {
                (pos + (2u64 << height), pos + (2u64 << height) - 1, false)
            };
            if parent >= size {
                break;
            }
            steps.push(ProofStep {
                hash: self.store.get(sibling)?,
                on_left: sib_on_left,
            });
            pos = parent;
            height += 1;
        }

        // peak bagging: fold the peaks right of ours, then prepend the left ones
        let pk = peaks(size);
        let own = pk
            .iter()
            .position(|p| *p == pos)
            .ok_or(corrupt("mmr proof peak"))?;
        if own + 1 < pk.len() {
            let mut acc = self.store.get(pk[pk.len() - 1])?;
            for p in pk[own + 1..pk.len() - 1].iter().rev() {
                let left = self.store.get(*p)?;
                acc = hash_children(&left, &acc);
            }
            steps.push(ProofStep {
                hash: acc,
                on_left: false,
            });
        }
        for p in pk[..own].iter().rev() {
            steps.push(ProofStep {
                hash: self.store.get(*p)?,
                on_left: true,
            });
        }

        Ok(MerkleProof { steps })
    }
}

/// Kernel commitment of a block: MMR root over the top-level kernel ids.
pub fn kernels_root(kernels: &[mist_primitives::Kernel]) -> Hash32 {
    FlyMmr::new(kernels.iter().map(|k| k.id()).collect()).root()
}

/// In-memory MMR over a block's kernel ids; computes the header's kernel
/// commitment and per-kernel proofs.
pub struct FlyMmr {
    mmr: Mmr<MemMmrStore>,
    leaves: Vec<Hash32>,
}

impl FlyMmr {
    pub fn new(leaves: Vec<Hash32>) -> Self {
        let mut mmr = Mmr::new(MemMmrStore::default());
        for leaf in &leaves {
            mmr.append(leaf).expect("in-memory append");
        }
        FlyMmr { mmr, leaves }
    }

    pub fn root(&self) -> Hash32 {
        self.mmr.root().expect("in-memory root")
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn find(&self, leaf: &Hash32) -> Option<u64> {
        self.leaves.iter().position(|l| l == leaf).map(|i| i as u64)
    }

    pub fn proof(&self, i: u64) -> ChainResult<MerkleProof> {
        self.mmr.proof(i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_primitives::hash_of;

    fn leaf(i: u64) -> Hash32 {
        hash_of(&i.to_le_bytes())
    }

    #[test]
    fn sizes_and_positions() {
        assert_eq!(size_for_leaves(0), 0);
        assert_eq!(size_for_leaves(1), 1);
        assert_eq!(size_for_leaves(2), 3);
        assert_eq!(size_for_leaves(3), 4);
        assert_eq!(size_for_leaves(4), 7);
        assert_eq!(size_for_leaves(5), 8);
        for n in 0..200u64 {
            assert_eq!(leaves_for_size(size_for_leaves(n)), n, "n={n}");
        }
    }

    #[test]
    fn append_matches_reference_tree() {
        // 4 leaves: root must equal the plain balanced tree
        let mut mmr = Mmr::new(MemMmrStore::default());
        for i in 0..4 {
            mmr.append(&leaf(i)).unwrap();
        }
        let l01 = hash_children(&leaf(0), &leaf(1));
        let l23 = hash_children(&leaf(2), &leaf(3));
        assert_eq!(mmr.root().unwrap(), hash_children(&l01, &l23));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in 1..=17u64 {
            let mut mmr = Mmr::new(MemMmrStore::default());
            for i in 0..n {
                mmr.append(&leaf(i)).unwrap();
            }
            let root = mmr.root().unwrap();
            for i in 0..n {
                let proof = mmr.proof(i).unwrap();
                assert_eq!(proof.apply(&leaf(i)), root, "n={n} i={i}");
            }
        }
    }

    #[test]
    fn predicted_root_matches_actual_append() {
        for n in 0..=16u64 {
            let mut mmr = Mmr::new(MemMmrStore::default());
            for i in 0..n {
                mmr.append(&leaf(i)).unwrap();
            }
            let predicted = mmr.predicted_root(&leaf(n)).unwrap();
            mmr.append(&leaf(n)).unwrap();
            assert_eq!(predicted, mmr.root().unwrap(), "n={n}");
        }
    }

    #[test]
    fn shrink_undoes_append() {
        let mut mmr = Mmr::new(MemMmrStore::default());
        for i in 0..5 {
            mmr.append(&leaf(i)).unwrap();
        }
        let root5 = mmr.root().unwrap();
        for i in 5..9 {
            mmr.append(&leaf(i)).unwrap();
        }
        mmr.shrink_to(5).unwrap();
        assert_eq!(mmr.root().unwrap(), root5);
        assert_eq!(mmr.leaf_count(), 5);
    }

    #[test]
    fn replace_recomputes_path() {
        let mut a = Mmr::new(MemMmrStore::default());
        let mut b = Mmr::new(MemMmrStore::default());
        for i in 0..7 {
            a.append(&leaf(i)).unwrap();
            b.append(&leaf(if i == 3 { 100 } else { i })).unwrap();
        }
        a.replace(3, &leaf(100)).unwrap();
        assert_eq!(a.root().unwrap(), b.root().unwrap());
    }

    #[test]
    fn fly_mmr_kernels() {
        let leaves: Vec<Hash32> = (0..5).map(leaf).collect();
        let fly = FlyMmr::new(leaves.clone());
        let root = fly.root();
        let i = fly.find(&leaves[2]).unwrap();
        assert_eq!(fly.proof(i).unwrap().apply(&leaves[2]), root);
    }
}
