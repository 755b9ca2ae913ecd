//! Typed chain database over the raw storage layer.
//!
//! State rows are keyed by an opaque row id; header hashes, heights, txos,
//! kernels, events, the shielded uniqueness table and the asset registry
//! each get their own column family. All multi-key updates go through
//! atomic write batches.

use crate::error::{corrupt, ChainResult};
use mist_primitives::{
    commitment::{read_scalar, write_scalar},
    BlockHeader, DecodeError, Decoder, Deserialize, EcPoint, Encoder, Hash32, Hasher, Height,
    PeerId, Scalar, Serialize, TxoId,
};
use mist_storage::{ColumnFamily as Cf, Storage, WriteBatch};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// Opaque state row id.
pub type RowId = u64;

/// A state row reference: row id plus its height.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateId {
    pub row: RowId,
    pub height: Height,
}

impl StateId {
    pub fn is_null(&self) -> bool {
        self.row == 0
    }

    pub fn set_null(&mut self) {
        self.row = 0;
        self.height = 0;
    }
}

/// Block body is stored and eligible for selection.
pub const FLAG_FUNCTIONAL: u8 = 0x01;
/// Connected to genesis through known headers.
pub const FLAG_REACHABLE: u8 = 0x02;
/// On the canonical chain at its height.
pub const FLAG_ACTIVE: u8 = 0x04;

/// A spent input recorded against the state that consumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateInput {
    pub txo_id: TxoId,
    pub commitment: EcPoint,
}

/// One state row.
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub header: BlockHeader,
    pub flags: u8,
    pub peer: PeerId,
    /// Global txo counter after this block; `None` until applied.
    pub txos: Option<TxoId>,
    /// Accumulated offset up to and including this block.
    pub offset_extra: Option<Scalar>,
    /// Rollback journal of the forward application.
    pub rollback: Vec<u8>,
    /// Inputs spent by this block.
    pub inputs: Vec<StateInput>,
}

impl StateRecord {
    fn new(header: BlockHeader, peer: PeerId) -> Self {
        StateRecord {
            header,
            flags: 0,
            peer,
            txos: None,
            offset_extra: None,
            rollback: Vec::new(),
            inputs: Vec::new(),
        }
    }
}

impl Serialize for StateRecord {
    fn write(&self, w: &mut Encoder) {
        self.header.write(w);
        w.write_u8(self.flags);
        w.write_raw(&self.peer.0);
        w.write_bool(self.txos.is_some());
        if let Some(t) = self.txos {
            w.write_u64(t);
        }
        w.write_bool(self.offset_extra.is_some());
        if let Some(s) = &self.offset_extra {
            write_scalar(w, s);
        }
        w.write_bytes(&self.rollback);
        w.write_u32(self.inputs.len() as u32);
        for inp in &self.inputs {
            w.write_u64(inp.txo_id);
            inp.commitment.write(w);
        }
    }
}

impl Deserialize for StateRecord {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::read(r)?;
        let flags = r.read_u8()?;
        let mut peer = PeerId::ZERO;
        peer.0.copy_from_slice(r.read_raw(32)?);
        let txos = if r.read_bool()? {
            Some(r.read_u64()?)
        } else {
            None
        };
        let offset_extra = if r.read_bool()? {
            Some(read_scalar(r)?)
        } else {
            None
        };
        let rollback = r.read_bytes()?;
        let n = r.read_u32()? as usize;
        if n > 1 << 22 {
            return Err(DecodeError::Malformed("state input count"));
        }
        let mut inputs = Vec::with_capacity(n);
        for _ in 0..n {
            inputs.push(StateInput {
                txo_id: r.read_u64()?,
                commitment: EcPoint::read(r)?,
            });
        }
        Ok(StateRecord {
            header,
            flags,
            peer,
            txos,
            offset_extra,
            rollback,
            inputs,
        })
    }
}

/// A confidential asset registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    /// 1-based asset id.
    pub id: u32,
    pub owner: EcPoint,
    pub metadata: Vec<u8>,
    pub value: u64,
    pub lock_height: Height,
}

impl AssetRecord {
    /// Leaf hash in the assets MMR.
    pub fn leaf_hash(&self) -> Hash32 {
        let mut h = Hasher::with_tag("mist.asset");
        h.write_u64(u64::from(self.id));
        h.write(&self.owner.0);
        h.write(&self.metadata);
        h.write_u64(self.value);
        h.write_u64(self.lock_height);
        h.finalize()
    }
}

impl Serialize for AssetRecord {
    fn write(&self, w: &mut Encoder) {
        w.write_u32(self.id);
        self.owner.write(w);
        w.write_bytes(&self.metadata);
        w.write_u64(self.value);
        w.write_u64(self.lock_height);
    }
}

impl Deserialize for AssetRecord {
    fn read(r: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(AssetRecord {
            id: r.read_u32()?,
            owner: EcPoint::read(r)?,
            metadata: r.read_bytes()?,
            value: r.read_u64()?,
            lock_height: r.read_u64()?,
        })
    }
}

/// Well-known persisted parameters. Key strings are part of the on-disk
/// contract; renaming one is a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamId {
    CfgChecksum,
    SyncData,
    FossilHeight,
    HeightTxoLo,
    HeightTxoHi,
    ShieldedOutputs,
    ShieldedInputs,
    AssetsCount,
    AssetsCountUsed,
    TreasuryTxos,
    TreasuryBlob,
    UtxoStamp,
    CursorRow,
    CursorHeight,
    NextRowId,
    EventSeq,
    StatesMmrNodes,
    ShieldedMmrNodes,
    AssetsMmrNodes,
}

impl ParamId {
    pub(crate) fn key(&self) -> &'static [u8] {
        match self {
            ParamId::CfgChecksum => b"CfgChecksum",
            ParamId::SyncData => b"SyncData",
            ParamId::FossilHeight => b"FossilHeight",
            ParamId::HeightTxoLo => b"HeightTxoLo",
            ParamId::HeightTxoHi => b"HeightTxoHi",
            ParamId::ShieldedOutputs => b"ShieldedOutputs",
            ParamId::ShieldedInputs => b"ShieldedInputs",
            ParamId::AssetsCount => b"AssetsCount",
            ParamId::AssetsCountUsed => b"AssetsCountUsed",
            ParamId::TreasuryTxos => b"Treasury",
            ParamId::TreasuryBlob => b"TreasuryBlob",
            ParamId::UtxoStamp => b"UtxoStamp",
            ParamId::CursorRow => b"CursorRow",
            ParamId::CursorHeight => b"CursorHeight",
            ParamId::NextRowId => b"NextRowId",
            ParamId::EventSeq => b"EventSeq",
            ParamId::StatesMmrNodes => b"StatesMmrNodes",
            ParamId::ShieldedMmrNodes => b"ShieldedMmrNodes",
            ParamId::AssetsMmrNodes => b"AssetsMmrNodes",
        }
    }
}

fn be8(v: u64) -> [u8; 8] {
    v.to_be_bytes()
}

fn height_row_key(h: Height, row: RowId) -> [u8; 16] {
    let mut k = [0u8; 16];
    k[..8].copy_from_slice(&be8(h));
    k[8..].copy_from_slice(&be8(row));
    k
}

/// The typed chain database.
pub struct ChainDb {
    storage: Arc<dyn Storage>,
    genesis: Height,
}

impl ChainDb {
    pub fn new(storage: Arc<dyn Storage>, genesis: Height) -> Self {
        ChainDb { storage, genesis }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // ==================== Parameters ====================

    pub fn param_get_int(&self, id: ParamId) -> ChainResult<Option<u64>> {
        match self.storage.get(Cf::Params, id.key())? {
            Some(v) if v.len() == 8 => Ok(Some(u64::from_le_bytes(v.try_into().unwrap()))),
            Some(_) => Err(corrupt("param int shape")),
            None => Ok(None),
        }
    }

    pub fn param_get_int_def(&self, id: ParamId, def: u64) -> ChainResult<u64> {
        Ok(self.param_get_int(id)?.unwrap_or(def))
    }

    pub fn param_set_int(&self, id: ParamId, v: u64) -> ChainResult<()> {
        self.storage.put(Cf::Params, id.key(), &v.to_le_bytes())?;
        Ok(())
    }

    pub fn param_get_blob(&self, id: ParamId) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.storage.get(Cf::Params, id.key())?)
    }

    pub fn param_set_blob(&self, id: ParamId, v: &[u8]) -> ChainResult<()> {
        self.storage.put(Cf::Params, id.key(), v)?;
        Ok(())
    }

    pub fn param_del(&self, id: ParamId) -> ChainResult<()> {
        self.storage.delete(Cf::Params, id.key())?;
        Ok(())
    }

    // ==================== State rows ====================

    fn next_row_id(&self) -> ChainResult<RowId> {
        let next = self.param_get_int_def(ParamId::NextRowId, 1)?;
        self.param_set_int(ParamId::NextRowId, next + 1)?;
        Ok(next)
    }

    pub fn get_state(&self, row: RowId) -> ChainResult<StateRecord> {
        let bytes = self
            .storage
            .get(Cf::States, &be8(row))?
            .ok_or(corrupt("state row missing"))?;
        Ok(StateRecord::from_bytes(&bytes)?)
    }

    pub fn put_state(&self, row: RowId, rec: &StateRecord) -> ChainResult<()> {
        self.storage.put(Cf::States, &be8(row), &rec.to_bytes())?;
        Ok(())
    }

    /// Find a state row by header hash.
    pub fn state_find(&self, id: &Hash32) -> ChainResult<Option<RowId>> {
        match self.storage.get(Cf::StateIds, &id.0)? {
            Some(v) if v.len() == 8 => Ok(Some(u64::from_be_bytes(v.try_into().unwrap()))),
            Some(_) => Err(corrupt("state id index shape")),
            None => Ok(None),
        }
    }

    /// Insert a header. Reachability is a property of functional states,
    /// so a fresh header is never reachable.
    pub fn insert_state(&self, header: &BlockHeader, peer: PeerId) -> ChainResult<RowId> {
        let id = header.id();
        debug_assert!(self.state_find(&id)?.is_none());

        let row = self.next_row_id()?;
        let rec = StateRecord::new(header.clone(), peer);

        let mut batch = WriteBatch::new();
        batch.put(Cf::States, be8(row).to_vec(), rec.to_bytes());
        batch.put(Cf::StateIds, id.0.to_vec(), be8(row).to_vec());
        batch.put(
            Cf::HeightIndex,
            height_row_key(header.height, row).to_vec(),
            Vec::new(),
        );
        self.storage.write_batch(batch)?;

        debug!(height = header.height, row, "state inserted");
        Ok(row)
    }

    /// Mark a state functional (block body stored). A functional state whose
    /// whole ancestry is functional becomes reachable, and reachability
    /// spreads to any waiting functional descendants.
    pub fn set_state_functional(&self, row: RowId) -> ChainResult<()> {
        let mut rec = self.get_state(row)?;
        rec.flags |= FLAG_FUNCTIONAL;

        let reachable = if rec.header.height == self.genesis {
            true
        } else {
            match self.state_find(&rec.header.prev)? {
                Some(prev) => self.get_state(prev)?.flags & FLAG_REACHABLE != 0,
                None => false,
            }
        };
        if reachable {
            rec.flags |= FLAG_REACHABLE;
        }
        let id = rec.header.id();
        let height = rec.header.height;
        self.put_state(row, &rec)?;

        if reachable {
            self.propagate_reachable(&id, height)?;
        }
        Ok(())
    }

    /// Clear the functional flag, revoking reachability from this state and
    /// all its descendants.
    pub fn set_state_not_functional(&self, row: RowId) -> ChainResult<()> {
        let mut rec = self.get_state(row)?;
        rec.flags &= !(FLAG_FUNCTIONAL | FLAG_REACHABLE);
        let id = rec.header.id();
        let height = rec.header.height;
        self.put_state(row, &rec)?;

        let mut frontier = vec![(id, height)];
        while let Some((hash, h)) = frontier.pop() {
            for child in self.enum_states_at(h + 1)? {
                let mut c = self.get_state(child)?;
                if c.header.prev == hash && c.flags & FLAG_REACHABLE != 0 {
                    c.flags &= !FLAG_REACHABLE;
                    self.put_state(child, &c)?;
                    frontier.push((c.header.id(), h + 1));
                }
            }
        }
        Ok(())
    }

    /// Spread reachability to functional descendants.
    fn propagate_reachable(&self, id: &Hash32, height: Height) -> ChainResult<()> {
        let mut frontier = vec![(*id, height)];
        while let Some((hash, h)) = frontier.pop() {
            for row in self.enum_states_at(h + 1)? {
                let mut rec = self.get_state(row)?;
                if rec.header.prev == hash
                    && rec.flags & FLAG_FUNCTIONAL != 0
                    && rec.flags & FLAG_REACHABLE == 0
                {
                    rec.flags |= FLAG_REACHABLE;
                    self.put_state(row, &rec)?;
                    frontier.push((rec.header.id(), h + 1));
                }
            }
        }
        Ok(())
    }

    /// Delete a header row and its indexes. The caller is responsible for
    /// blobs and for only deleting childless rows.
    pub fn delete_state(&self, row: RowId) -> ChainResult<()> {
        let rec = self.get_state(row)?;
        let mut batch = WriteBatch::new();
        batch.delete(Cf::States, be8(row).to_vec());
        batch.delete(Cf::StateIds, rec.header.id().0.to_vec());
        batch.delete(
            Cf::HeightIndex,
            height_row_key(rec.header.height, row).to_vec(),
        );
        batch.delete(Cf::Perishable, be8(row).to_vec());
        batch.delete(Cf::Eternal, be8(row).to_vec());
        self.storage.write_batch(batch)?;
        Ok(())
    }

    pub fn get_flags(&self, row: RowId) -> ChainResult<u8> {
        Ok(self.get_state(row)?.flags)
    }

    pub fn set_flags(&self, row: RowId, set: u8, clear: u8) -> ChainResult<()> {
        let mut rec = self.get_state(row)?;
        rec.flags = (rec.flags | set) & !clear;
        self.put_state(row, &rec)
    }

    pub fn get_prev_row(&self, row: RowId) -> ChainResult<Option<RowId>> {
        let rec = self.get_state(row)?;
        self.state_find(&rec.header.prev)
    }

    /// Step a state id to its parent; false when the parent is unknown.
    pub fn get_prev(&self, sid: &mut StateId) -> ChainResult<bool> {
        match self.get_prev_row(sid.row)? {
            Some(prev) => {
                sid.row = prev;
                sid.height -= 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn enum_states_at(&self, h: Height) -> ChainResult<Vec<RowId>> {
        let prefix = be8(h);
        let mut out = Vec::new();
        for (k, _) in self.storage.iter_from(Cf::HeightIndex, &prefix)? {
            if k.len() != 16 || k[..8] != prefix {
                break;
            }
            out.push(u64::from_be_bytes(k[8..].try_into().unwrap()));
        }
        Ok(out)
    }

    pub fn find_active_at(&self, h: Height) -> ChainResult<Option<RowId>> {
        for row in self.enum_states_at(h)? {
            if self.get_flags(row)? & FLAG_ACTIVE != 0 {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// All tip rows (states without known children), lowest height first.
    pub fn enum_tips(&self) -> ChainResult<Vec<StateId>> {
        let mut states: Vec<(RowId, Hash32, Hash32, Height)> = Vec::new();
        for (k, v) in self.storage.iter(Cf::States)? {
            if k.len() != 8 {
                return Err(corrupt("state row key shape"));
            }
            let rec = StateRecord::from_bytes(&v)?;
            states.push((
                u64::from_be_bytes(k.try_into().unwrap()),
                rec.header.id(),
                rec.header.prev,
                rec.header.height,
            ));
        }
        let prevs: HashSet<Hash32> = states.iter().map(|s| s.2).collect();
        let mut tips: Vec<StateId> = states
            .into_iter()
            .filter(|(_, id, _, _)| !prevs.contains(id))
            .map(|(row, _, _, height)| StateId { row, height })
            .collect();
        tips.sort_by_key(|s| s.height);
        Ok(tips)
    }

    /// Functional+reachable tips, best chainwork first. A row qualifies when
    /// no functional+reachable child extends it.
    pub fn enum_functional_tips(&self) -> ChainResult<Vec<StateId>> {
        let mut eligible: Vec<(StateId, Hash32, Hash32, num_bigint::BigUint)> = Vec::new();
        for (k, v) in self.storage.iter(Cf::States)? {
            if k.len() != 8 {
                return Err(corrupt("state row key shape"));
            }
            let rec = StateRecord::from_bytes(&v)?;
            if rec.flags & FLAG_FUNCTIONAL == 0 || rec.flags & FLAG_REACHABLE == 0 {
                continue;
            }
            let row = u64::from_be_bytes(k.try_into().unwrap());
            eligible.push((
                StateId {
                    row,
                    height: rec.header.height,
                },
                rec.header.id(),
                rec.header.prev,
                rec.header.chainwork.clone(),
            ));
        }
        let prevs: HashSet<Hash32> = eligible.iter().map(|e| e.2).collect();
        let mut tips: Vec<_> = eligible
            .into_iter()
            .filter(|(_, id, _, _)| !prevs.contains(id))
            .collect();
        tips.sort_by(|a, b| b.3.cmp(&a.3));
        Ok(tips.into_iter().map(|(sid, _, _, _)| sid).collect())
    }

    /// Whether any state extends this row.
    pub fn has_children(&self, row: RowId) -> ChainResult<bool> {
        let rec = self.get_state(row)?;
        let id = rec.header.id();
        for child in self.enum_states_at(rec.header.height + 1)? {
            if self.get_state(child)?.header.prev == id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ==================== Cursor ====================

    pub fn get_cursor(&self) -> ChainResult<StateId> {
        Ok(StateId {
            row: self.param_get_int_def(ParamId::CursorRow, 0)?,
            height: self.param_get_int_def(ParamId::CursorHeight, 0)?,
        })
    }

    /// Advance the cursor onto `sid`, marking it active.
    pub fn move_fwd(&self, sid: &StateId) -> ChainResult<()> {
        self.set_flags(sid.row, FLAG_ACTIVE, 0)?;
        self.param_set_int(ParamId::CursorRow, sid.row)?;
        self.param_set_int(ParamId::CursorHeight, sid.height)?;
        Ok(())
    }

    /// Step the cursor back to the parent of `sid`, deactivating `sid`.
    pub fn move_back(&self, sid: &mut StateId) -> ChainResult<()> {
        self.set_flags(sid.row, 0, FLAG_ACTIVE)?;
        if !self.get_prev(sid)? {
            sid.set_null();
        }
        self.param_set_int(ParamId::CursorRow, sid.row)?;
        self.param_set_int(ParamId::CursorHeight, sid.height)?;
        Ok(())
    }

    // ==================== Block blobs ====================

    pub fn set_state_block(
        &self,
        row: RowId,
        perishable: &[u8],
        eternal: &[u8],
        peer: PeerId,
    ) -> ChainResult<()> {
        let mut rec = self.get_state(row)?;
        rec.peer = peer;
        let mut batch = WriteBatch::new();
        batch.put(Cf::States, be8(row).to_vec(), rec.to_bytes());
        batch.put(Cf::Perishable, be8(row).to_vec(), perishable.to_vec());
        batch.put(Cf::Eternal, be8(row).to_vec(), eternal.to_vec());
        self.storage.write_batch(batch)?;
        Ok(())
    }

    pub fn get_state_block(
        &self,
        row: RowId,
    ) -> ChainResult<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let p = self.storage.get(Cf::Perishable, &be8(row))?;
        let e = self.storage.get(Cf::Eternal, &be8(row))?;
        Ok((p, e))
    }

    /// Free the perishable blob only (fast-sync space saving).
    pub fn del_state_block_pp(&self, row: RowId) -> ChainResult<()> {
        self.storage.delete(Cf::Perishable, &be8(row))?;
        Ok(())
    }

    /// Free the perishable blob and the rollback journal (fossilized active rows).
    pub fn del_state_block_ppr(&self, row: RowId) -> ChainResult<()> {
        self.del_state_block_pp(row)?;
        let mut rec = self.get_state(row)?;
        if !rec.rollback.is_empty() {
            rec.rollback = Vec::new();
            self.put_state(row, &rec)?;
        }
        Ok(())
    }

    /// Free everything stored for the block body.
    pub fn del_state_block_all(&self, row: RowId) -> ChainResult<()> {
        self.storage.delete(Cf::Perishable, &be8(row))?;
        self.storage.delete(Cf::Eternal, &be8(row))?;
        let mut rec = self.get_state(row)?;
        rec.rollback = Vec::new();
        rec.peer = PeerId::ZERO;
        self.put_state(row, &rec)?;
        Ok(())
    }

    pub fn get_peer(&self, row: RowId) -> ChainResult<Option<PeerId>> {
        let rec = self.get_state(row)?;
        Ok(if rec.peer.is_zero() {
            None
        } else {
            Some(rec.peer)
        })
    }

    /// Record the apply results: txo cursor, accumulated offset, journal.
    pub fn set_state_txos_extra(
        &self,
        row: RowId,
        txos: Option<TxoId>,
        offset: Option<&Scalar>,
        rollback: Option<&[u8]>,
    ) -> ChainResult<()> {
        let mut rec = self.get_state(row)?;
        rec.txos = txos;
        rec.offset_extra = offset.copied();
        rec.rollback = rollback.map(|b| b.to_vec()).unwrap_or_default();
        self.put_state(row, &rec)
    }

    pub fn get_state_txos(&self, row: RowId) -> ChainResult<Option<TxoId>> {
        Ok(self.get_state(row)?.txos)
    }

    pub fn get_state_extra(&self, row: RowId) -> ChainResult<Option<Scalar>> {
        Ok(self.get_state(row)?.offset_extra)
    }

    pub fn set_state_inputs(&self, row: RowId, inputs: &[StateInput]) -> ChainResult<()> {
        let mut rec = self.get_state(row)?;
        rec.inputs = inputs.to_vec();
        self.put_state(row, &rec)
    }

    pub fn get_state_inputs(&self, row: RowId) -> ChainResult<Vec<StateInput>> {
        Ok(self.get_state(row)?.inputs)
    }

    // ==================== Txo store ====================

    pub fn txo_add(&self, id: TxoId, value: &[u8]) -> ChainResult<()> {
        self.storage.put(Cf::Txos, &be8(id), value)?;
        Ok(())
    }

    pub fn txo_set_value(&self, id: TxoId, value: &[u8]) -> ChainResult<()> {
        self.storage.put(Cf::Txos, &be8(id), value)?;
        Ok(())
    }

    pub fn txo_get(&self, id: TxoId) -> ChainResult<(Vec<u8>, Option<Height>)> {
        let v = self
            .storage
            .get(Cf::Txos, &be8(id))?
            .ok_or(corrupt("txo missing"))?;
        Ok((v, self.txo_get_spent(id)?))
    }

    pub fn txo_get_spent(&self, id: TxoId) -> ChainResult<Option<Height>> {
        match self.storage.get(Cf::TxoSpend, &be8(id))? {
            Some(v) if v.len() == 8 => Ok(Some(u64::from_le_bytes(v.try_into().unwrap()))),
            Some(_) => Err(corrupt("txo spend shape")),
            None => Ok(None),
        }
    }

    pub fn txo_set_spent(&self, id: TxoId, h: Option<Height>) -> ChainResult<()> {
        match h {
            Some(h) => self.storage.put(Cf::TxoSpend, &be8(id), &h.to_le_bytes())?,
            None => self.storage.delete(Cf::TxoSpend, &be8(id))?,
        }
        Ok(())
    }

    pub fn txo_del(&self, id: TxoId) -> ChainResult<()> {
        self.storage.delete(Cf::Txos, &be8(id))?;
        self.storage.delete(Cf::TxoSpend, &be8(id))?;
        Ok(())
    }

    /// Delete all txos with id >= `id0`.
    pub fn txo_del_from(&self, id0: TxoId) -> ChainResult<()> {
        let ids: Vec<TxoId> = self
            .storage
            .iter_from(Cf::Txos, &be8(id0))?
            .map(|(k, _)| u64::from_be_bytes(k[..8].try_into().unwrap()))
            .collect();
        let mut batch = WriteBatch::new();
        for id in ids {
            batch.delete(Cf::Txos, be8(id).to_vec());
            batch.delete(Cf::TxoSpend, be8(id).to_vec());
        }
        self.storage.write_batch(batch)?;
        Ok(())
    }

    /// Walk txos with id >= `id0` in order. The walker returns false to stop;
    /// the overall result mirrors the walker's last verdict.
    pub fn walk_txos_from(
        &self,
        id0: TxoId,
        f: &mut dyn FnMut(TxoId, &[u8], Option<Height>) -> ChainResult<bool>,
    ) -> ChainResult<bool> {
        let entries: Vec<(TxoId, Vec<u8>)> = self
            .storage
            .iter_from(Cf::Txos, &be8(id0))?
            .map(|(k, v)| (u64::from_be_bytes(k[..8].try_into().unwrap()), v))
            .collect();
        for (id, value) in entries {
            let spent = self.txo_get_spent(id)?;
            if !f(id, &value, spent)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ==================== Kernel index ====================

    fn kernel_key(id: &Hash32, h: Height) -> [u8; 40] {
        let mut k = [0u8; 40];
        k[..32].copy_from_slice(&id.0);
        k[32..].copy_from_slice(&be8(h));
        k
    }

    pub fn insert_kernel(&self, id: &Hash32, h: Height) -> ChainResult<()> {
        self.storage
            .put(Cf::Kernels, &Self::kernel_key(id, h), &[])?;
        Ok(())
    }

    pub fn delete_kernel(&self, id: &Hash32, h: Height) -> ChainResult<()> {
        self.storage.delete(Cf::Kernels, &Self::kernel_key(id, h))?;
        Ok(())
    }

    /// Greatest height at which this kernel id is recorded.
    pub fn find_kernel(&self, id: &Hash32) -> ChainResult<Option<Height>> {
        let mut best = None;
        for (k, _) in self.storage.iter_from(Cf::Kernels, &id.0)? {
            if k.len() != 40 || k[..32] != id.0 {
                break;
            }
            best = Some(u64::from_be_bytes(k[32..].try_into().unwrap()));
        }
        Ok(best)
    }

    // ==================== Events ====================

    pub fn insert_event(&self, h: Height, body: &[u8], key: &[u8]) -> ChainResult<()> {
        let seq = self.param_get_int_def(ParamId::EventSeq, 0)?;
        self.param_set_int(ParamId::EventSeq, seq + 1)?;

        let mut ek = Vec::with_capacity(16);
        ek.extend_from_slice(&be8(h));
        ek.extend_from_slice(&be8(seq));

        let mut enc = Encoder::new();
        enc.write_bytes(key);
        enc.write_bytes(body);

        let mut batch = WriteBatch::new();
        batch.put(Cf::Events, ek.clone(), enc.into_bytes());
        if !key.is_empty() {
            let mut kk = Vec::with_capacity(key.len() + 16);
            kk.extend_from_slice(key);
            kk.extend_from_slice(&be8(h));
            kk.extend_from_slice(&be8(seq));
            batch.put(Cf::EventKeys, kk, ek);
        }
        self.storage.write_batch(batch)?;
        Ok(())
    }

    /// Events carrying `key`, most recent first.
    pub fn find_events(&self, key: &[u8]) -> ChainResult<Vec<(Height, Vec<u8>)>> {
        let mut out = Vec::new();
        for (k, ek) in self.storage.iter_from(Cf::EventKeys, key)? {
            if k.len() != key.len() + 16 || &k[..key.len()] != key {
                break;
            }
            if let Some(v) = self.storage.get(Cf::Events, &ek)? {
                let mut dec = Decoder::new(&v);
                let _key = dec.read_bytes()?;
                let body = dec.read_bytes()?;
                let h = u64::from_be_bytes(ek[..8].try_into().unwrap());
                out.push((h, body));
            }
        }
        out.reverse();
        Ok(out)
    }

    /// Truncate the event log at `h0` (inclusive).
    pub fn delete_events_from(&self, h0: Height) -> ChainResult<()> {
        let entries: Vec<(Vec<u8>, Vec<u8>)> = self
            .storage
            .iter_from(Cf::Events, &be8(h0))?
            .collect();
        let mut batch = WriteBatch::new();
        for (ek, v) in entries {
            let mut dec = Decoder::new(&v);
            let key = dec.read_bytes()?;
            if !key.is_empty() {
                let mut kk = Vec::with_capacity(key.len() + 16);
                kk.extend_from_slice(&key);
                kk.extend_from_slice(&ek);
                batch.delete(Cf::EventKeys, kk);
            }
            batch.delete(Cf::Events, ek);
        }
        self.storage.write_batch(batch)?;
        Ok(())
    }

    // ==================== Uniqueness table ====================

    /// Insert if absent; false on collision.
    pub fn unique_insert(&self, key: &[u8], value: &[u8]) -> ChainResult<bool> {
        if self.storage.contains(Cf::Unique, key)? {
            return Ok(false);
        }
        self.storage.put(Cf::Unique, key, value)?;
        Ok(true)
    }

    pub fn unique_find(&self, key: &[u8]) -> ChainResult<Option<Vec<u8>>> {
        Ok(self.storage.get(Cf::Unique, key)?)
    }

    /// Delete; the key must exist (undo of a recorded insert).
    pub fn unique_delete_strict(&self, key: &[u8]) -> ChainResult<()> {
        if !self.storage.contains(Cf::Unique, key)? {
            return Err(corrupt("unique key missing on undo"));
        }
        self.storage.delete(Cf::Unique, key)?;
        Ok(())
    }

    // ==================== Shielded pool stream ====================

    pub fn shielded_write(&self, idx: u64, pt: &EcPoint) -> ChainResult<()> {
        self.storage.put(Cf::ShieldedElems, &be8(idx), &pt.0)?;
        Ok(())
    }

    pub fn shielded_read(&self, idx: u64, count: usize) -> ChainResult<Vec<EcPoint>> {
        let mut out = Vec::with_capacity(count);
        for i in 0..count as u64 {
            let v = self
                .storage
                .get(Cf::ShieldedElems, &be8(idx + i))?
                .ok_or(corrupt("shielded element missing"))?;
            let mut arr = [0u8; 32];
            if v.len() != 32 {
                return Err(corrupt("shielded element shape"));
            }
            arr.copy_from_slice(&v);
            out.push(EcPoint(arr));
        }
        Ok(out)
    }

    pub fn shielded_del_from(&self, idx: u64) -> ChainResult<()> {
        let keys: Vec<Vec<u8>> = self
            .storage
            .iter_from(Cf::ShieldedElems, &be8(idx))?
            .map(|(k, _)| k)
            .collect();
        let mut batch = WriteBatch::new();
        for k in keys {
            batch.delete(Cf::ShieldedElems, k);
        }
        self.storage.write_batch(batch)?;
        Ok(())
    }

    // ==================== Assets ====================

    pub fn asset_get(&self, id: u32) -> ChainResult<Option<AssetRecord>> {
        match self.storage.get(Cf::Assets, &id.to_be_bytes())? {
            Some(v) => Ok(Some(AssetRecord::from_bytes(&v)?)),
            None => Ok(None),
        }
    }

    pub fn asset_find_by_owner(&self, owner: &EcPoint) -> ChainResult<Option<u32>> {
        match self.storage.get(Cf::AssetOwners, &owner.0)? {
            Some(v) if v.len() == 4 => Ok(Some(u32::from_be_bytes(v.try_into().unwrap()))),
            Some(_) => Err(corrupt("asset owner index shape")),
            None => Ok(None),
        }
    }

    /// Register an asset, reusing the smallest free 1-based id. Returns the
    /// record with its id assigned and the new registry count. The live-asset
    /// counter (`AssetsCountUsed`) is maintained here.
    pub fn asset_add(
        &self,
        owner: EcPoint,
        metadata: Vec<u8>,
        lock_height: Height,
    ) -> ChainResult<(AssetRecord, u32)> {
        let count = self.param_get_int_def(ParamId::AssetsCount, 0)? as u32;
        let mut id = count + 1;
        for cand in 1..=count {
            if self.asset_get(cand)?.is_none() {
                id = cand;
                break;
            }
        }
        let rec = AssetRecord {
            id,
            owner,
            metadata,
            value: 0,
            lock_height,
        };
        let new_count = count.max(id);
        let mut batch = WriteBatch::new();
        batch.put(Cf::Assets, id.to_be_bytes().to_vec(), rec.to_bytes());
        batch.put(Cf::AssetOwners, owner.0.to_vec(), id.to_be_bytes().to_vec());
        self.storage.write_batch(batch)?;
        self.param_set_int(ParamId::AssetsCount, u64::from(new_count))?;

        let used = self.param_get_int_def(ParamId::AssetsCountUsed, 0)?;
        self.param_set_int(ParamId::AssetsCountUsed, used + 1)?;
        Ok((rec, new_count))
    }

    /// Remove an asset; returns the shrunken registry count.
    pub fn asset_del(&self, id: u32) -> ChainResult<u32> {
        let rec = self.asset_get(id)?.ok_or(corrupt("asset missing on delete"))?;
        let mut batch = WriteBatch::new();
        batch.delete(Cf::Assets, id.to_be_bytes().to_vec());
        batch.delete(Cf::AssetOwners, rec.owner.0.to_vec());
        self.storage.write_batch(batch)?;

        let mut count = self.param_get_int_def(ParamId::AssetsCount, 0)? as u32;
        if id == count {
            while count > 0 && self.asset_get(count)?.is_none() {
                count -= 1;
            }
            self.param_set_int(ParamId::AssetsCount, u64::from(count))?;
        }

        let used = self.param_get_int_def(ParamId::AssetsCountUsed, 0)?;
        self.param_set_int(ParamId::AssetsCountUsed, used.saturating_sub(1))?;
        Ok(count)
    }

    pub fn asset_set_value(&self, id: u32, value: u64, lock_height: Height) -> ChainResult<()> {
        let mut rec = self.asset_get(id)?.ok_or(corrupt("asset missing on update"))?;
        rec.value = value;
        rec.lock_height = lock_height;
        self.storage
            .put(Cf::Assets, &id.to_be_bytes(), &rec.to_bytes())?;
        Ok(())
    }

    // ==================== Integrity ====================

    /// Decode every state row; returns the number checked.
    pub fn check_integrity(&self) -> ChainResult<usize> {
        let mut n = 0;
        let mut seen: HashMap<Hash32, RowId> = HashMap::new();
        for (k, v) in self.storage.iter(Cf::States)? {
            if k.len() != 8 {
                return Err(corrupt("state row key shape"));
            }
            let rec = StateRecord::from_bytes(&v)?;
            let row = u64::from_be_bytes(k.try_into().unwrap());
            if seen.insert(rec.header.id(), row).is_some() {
                return Err(corrupt("duplicate header id"));
            }
            n += 1;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_primitives::Difficulty;
    use mist_storage::Database;
    use num_bigint::BigUint;
    use tempfile::TempDir;

    fn test_db() -> (ChainDb, TempDir) {
        let tmp = TempDir::new().unwrap();
        let db = Database::open(tmp.path()).unwrap();
        (ChainDb::new(Arc::new(db), 1), tmp)
    }

    fn header(height: Height, prev: Hash32, salt: u64) -> BlockHeader {
        BlockHeader {
            height,
            prev,
            chainwork: BigUint::from(height) << 24,
            timestamp: 1000 + height * 60 + salt,
            difficulty: Difficulty::from_parts(0, 0),
            definition: Hash32::ZERO,
            kernels_root: Hash32::ZERO,
        }
    }

    #[test]
    fn insert_and_find_states() {
        let (db, _tmp) = test_db();
        let h1 = header(1, Hash32::ZERO, 0);
        let row = db.insert_state(&h1, PeerId::ZERO).unwrap();
        assert_eq!(db.state_find(&h1.id()).unwrap(), Some(row));
        assert_eq!(db.get_flags(row).unwrap(), 0);

        let rec = db.get_state(row).unwrap();
        assert_eq!(rec.header, h1);
    }

    #[test]
    fn reachability_follows_functional_chain() {
        let (db, _tmp) = test_db();
        let h1 = header(1, Hash32::ZERO, 0);
        let h2 = header(2, h1.id(), 0);
        let h3 = header(3, h2.id(), 0);

        let r1 = db.insert_state(&h1, PeerId::ZERO).unwrap();
        let r2 = db.insert_state(&h2, PeerId::ZERO).unwrap();
        let r3 = db.insert_state(&h3, PeerId::ZERO).unwrap();

        // bodies arrive out of order: the gap blocks reachability
        db.set_state_functional(r3).unwrap();
        db.set_state_functional(r1).unwrap();
        assert!(db.get_flags(r1).unwrap() & FLAG_REACHABLE != 0);
        assert_eq!(db.get_flags(r3).unwrap() & FLAG_REACHABLE, 0);

        // the missing middle body closes the gap up to the tip
        db.set_state_functional(r2).unwrap();
        assert!(db.get_flags(r2).unwrap() & FLAG_REACHABLE != 0);
        assert!(db.get_flags(r3).unwrap() & FLAG_REACHABLE != 0);

        // revoking a body revokes the descendants' reachability
        db.set_state_not_functional(r2).unwrap();
        assert_eq!(db.get_flags(r2).unwrap() & FLAG_REACHABLE, 0);
        assert_eq!(db.get_flags(r3).unwrap() & FLAG_REACHABLE, 0);
        assert!(db.get_flags(r1).unwrap() & FLAG_REACHABLE != 0);
    }

    #[test]
    fn tips_enumeration() {
        let (db, _tmp) = test_db();
        let h1 = header(1, Hash32::ZERO, 0);
        let h2 = header(2, h1.id(), 0);
        let h2b = header(2, h1.id(), 77);
        db.insert_state(&h1, PeerId::ZERO).unwrap();
        let r2 = db.insert_state(&h2, PeerId::ZERO).unwrap();
        let r2b = db.insert_state(&h2b, PeerId::ZERO).unwrap();

        let tips = db.enum_tips().unwrap();
        let rows: Vec<RowId> = tips.iter().map(|t| t.row).collect();
        assert_eq!(rows.len(), 2);
        assert!(rows.contains(&r2) && rows.contains(&r2b));
    }

    #[test]
    fn functional_tips_ordered_by_chainwork() {
        let (db, _tmp) = test_db();
        let h1 = header(1, Hash32::ZERO, 0);
        let mut h2 = header(2, h1.id(), 0);
        h2.chainwork = BigUint::from(100u32);
        let mut h2b = header(2, h1.id(), 1);
        h2b.chainwork = BigUint::from(200u32);

        let r1 = db.insert_state(&h1, PeerId::ZERO).unwrap();
        let r2 = db.insert_state(&h2, PeerId::ZERO).unwrap();
        let r2b = db.insert_state(&h2b, PeerId::ZERO).unwrap();
        db.set_state_functional(r1).unwrap();
        db.set_state_functional(r2).unwrap();
        db.set_state_functional(r2b).unwrap();

        let tips = db.enum_functional_tips().unwrap();
        assert_eq!(tips[0].row, r2b);
        assert_eq!(tips[1].row, r2);
    }

    #[test]
    fn kernel_index_multiset() {
        let (db, _tmp) = test_db();
        let id = mist_primitives::hash_of(b"krn");
        db.insert_kernel(&id, 5).unwrap();
        db.insert_kernel(&id, 9).unwrap();
        assert_eq!(db.find_kernel(&id).unwrap(), Some(9));
        db.delete_kernel(&id, 9).unwrap();
        assert_eq!(db.find_kernel(&id).unwrap(), Some(5));
        db.delete_kernel(&id, 5).unwrap();
        assert_eq!(db.find_kernel(&id).unwrap(), None);
    }

    #[test]
    fn unique_table_semantics() {
        let (db, _tmp) = test_db();
        assert!(db.unique_insert(b"serial", b"v1").unwrap());
        assert!(!db.unique_insert(b"serial", b"v2").unwrap());
        assert_eq!(db.unique_find(b"serial").unwrap(), Some(b"v1".to_vec()));
        db.unique_delete_strict(b"serial").unwrap();
        assert!(db.unique_delete_strict(b"serial").is_err());
    }

    #[test]
    fn events_insert_find_truncate() {
        let (db, _tmp) = test_db();
        db.insert_event(3, b"e1", b"key").unwrap();
        db.insert_event(5, b"e2", b"key").unwrap();
        db.insert_event(7, b"e3", b"").unwrap();

        let found = db.find_events(b"key").unwrap();
        assert_eq!(found, vec![(5, b"e2".to_vec()), (3, b"e1".to_vec())]);

        db.delete_events_from(5).unwrap();
        let found = db.find_events(b"key").unwrap();
        assert_eq!(found, vec![(3, b"e1".to_vec())]);
    }

    #[test]
    fn asset_registry_reuses_ids() {
        let (db, _tmp) = test_db();
        let o1 = EcPoint([1u8; 32]);
        let o2 = EcPoint([2u8; 32]);
        let (a1, c1) = db.asset_add(o1, vec![1], 10).unwrap();
        let (a2, c2) = db.asset_add(o2, vec![2], 11).unwrap();
        assert_eq!((a1.id, c1), (1, 1));
        assert_eq!((a2.id, c2), (2, 2));
        assert_eq!(a1.lock_height, 10);
        assert_eq!(db.asset_find_by_owner(&o1).unwrap(), Some(1));
        assert_eq!(db.param_get_int(ParamId::AssetsCountUsed).unwrap(), Some(2));

        assert_eq!(db.asset_del(1).unwrap(), 2);
        let (a3, c3) = db.asset_add(EcPoint([3u8; 32]), vec![3], 12).unwrap();
        assert_eq!((a3.id, c3), (1, 2));

        assert_eq!(db.asset_del(2).unwrap(), 1);
        assert_eq!(db.asset_del(1).unwrap(), 0);
        assert_eq!(db.param_get_int(ParamId::AssetsCountUsed).unwrap(), Some(0));
    }

    #[test]
    fn txo_store_round_trip() {
        let (db, _tmp) = test_db();
        db.txo_add(0, b"txo0").unwrap();
        db.txo_add(1, b"txo1").unwrap();
        db.txo_set_spent(0, Some(9)).unwrap();

        assert_eq!(db.txo_get(0).unwrap(), (b"txo0".to_vec(), Some(9)));
        assert_eq!(db.txo_get(1).unwrap(), (b"txo1".to_vec(), None));

        let mut seen = Vec::new();
        db.walk_txos_from(0, &mut |id, _v, spent| {
            seen.push((id, spent));
            Ok(true)
        })
        .unwrap();
        assert_eq!(seen, vec![(0, Some(9)), (1, None)]);

        db.txo_del_from(1).unwrap();
        assert!(db.txo_get(1).is_err());
    }
}
