//! The block processor: chain-state engine, reorg control, fast-sync
//! bootstrap, pruning, and the peer-facing ingress surface.

use crate::chain_db::{
    ChainDb, ParamId, RowId, StateId, StateInput, FLAG_ACTIVE, FLAG_FUNCTIONAL,
};
use crate::config::{Horizon, StartParams};
use crate::congestion::{self, CongestionCache};
use crate::error::{corrupt, ChainResult, DataStatus, TxStatus};
use crate::host::{BlockId, ProcessorHost};
use crate::interpret::BlockInterpretCtx;
use crate::mmr::{DbMmrStore, FlyMmr, MerkleProof, Mmr};
use crate::sync::MultiblockContext;
use crate::utxo::{self, UtxoTree};
use crate::verify::{Executor, MultiAssetContext, MultiShieldedContext};
use mist_consensus::{HeightRange, Rules, TxContext, TxContextParams, HEIGHT_GENESIS};
use mist_primitives::{
    commitment::write_scalar, hash_of, transaction, BatchContext, Block, BlockHeader, DecodeError,
    Decoder, Deserialize, Difficulty, EcPoint, Encoder, Hash32, Hasher, Height, Input, Output,
    PeerId, Serialize, Transaction, TxoId,
};
use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use mist_storage::{ColumnFamily as Cf, Database, Storage};
use num_bigint::{BigInt, BigUint};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// The active tip and everything derived from it.
#[derive(Debug, Clone)]
pub struct Cursor {
    pub sid: StateId,
    /// Full header of the tip; meaningless while `sid` is null.
    pub header: BlockHeader,
    pub id_hash: Hash32,
    /// States-MMR root over `[genesis, height)`.
    pub history: Hash32,
    /// States-MMR root after appending the tip itself.
    pub history_next: Hash32,
    pub difficulty_next: Difficulty,
}

impl Cursor {
    fn null() -> Self {
        Cursor {
            sid: StateId::default(),
            header: BlockHeader {
                height: 0,
                prev: Hash32::ZERO,
                chainwork: BigUint::default(),
                timestamp: 0,
                difficulty: Difficulty::MIN,
                definition: Hash32::ZERO,
                kernels_root: Hash32::ZERO,
            },
            id_hash: Hash32::ZERO,
            history: Hash32::ZERO,
            history_next: Hash32::ZERO,
            difficulty_next: Difficulty::MIN,
        }
    }
}

/// Persistent counters and pruning horizons of the active chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct Extra {
    pub fossil: Height,
    pub txo_lo: Height,
    pub txo_hi: Height,
    /// Total txos ever created on the active chain (including the gap slots).
    pub txos: TxoId,
    pub shielded_outputs: u64,
    pub txos_treasury: TxoId,
}

/// Fast-sync bookkeeping; present iff a fast-sync run is active.
#[derive(Debug, Clone, Copy)]
pub struct SyncData {
    /// Cursor height when the run started.
    pub h0: Height,
    /// Below this, blocks are applied sparse.
    pub txo_lo: Height,
    /// The committed sync target.
    pub target: StateId,
    /// Accumulated sparse sigma, persisted between flushes.
    pub sigma: EcPoint,
}

impl SyncData {
    fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u64(self.h0);
        enc.write_u64(self.txo_lo);
        enc.write_u64(self.target.row);
        enc.write_u64(self.target.height);
        self.sigma.write(&mut enc);
        enc.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut dec = Decoder::new(bytes);
        let out = SyncData {
            h0: dec.read_u64()?,
            txo_lo: dec.read_u64()?,
            target: StateId {
                row: dec.read_u64()?,
                height: dec.read_u64()?,
            },
            sigma: EcPoint::read(&mut dec)?,
        };
        dec.finish()?;
        Ok(out)
    }
}

/// Median source: timestamp, then (height, chainwork) for tie-breaking.
/// Signed so synthetic prehistoric points can go below zero.
type Thw = (i128, (i128, BigInt));

/// The block processor.
pub struct Processor {
    pub(crate) rules: Arc<Rules>,
    pub(crate) db: ChainDb,
    pub(crate) utxos: UtxoTree,
    pub(crate) mmr_states: Mmr<DbMmrStore>,
    pub(crate) mmr_shielded: Mmr<DbMmrStore>,
    pub(crate) mmr_assets: Mmr<DbMmrStore>,
    pub(crate) cursor: Cursor,
    pub(crate) extra: Extra,
    pub(crate) sync_data: Option<SyncData>,
    pub(crate) horizon: Horizon,
    pub(crate) recent: crate::recent::RecentStates,
    pub(crate) congestion: CongestionCache,
    pub(crate) executor: Executor,
    pub(crate) host: Box<dyn ProcessorHost>,
    image_path: PathBuf,
}

impl Processor {
    /// Open (or create) the chain state at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open<P: AsRef<Path>>(
        path: P,
        rules: Arc<Rules>,
        mut horizon: Horizon,
        host: Box<dyn ProcessorHost>,
        sp: &StartParams,
    ) -> ChainResult<Self> {
        let storage: Arc<dyn Storage> = Arc::new(Database::open(path.as_ref())?);
        let db = ChainDb::new(Arc::clone(&storage), HEIGHT_GENESIS);

        if sp.check_integrity {
            info!("DB integrity check...");
            let n = db.check_integrity()?;
            debug!(states = n, "integrity check passed");
        }

        let mut extra = Extra {
            fossil: db.param_get_int_def(ParamId::FossilHeight, HEIGHT_GENESIS - 1)?,
            txo_lo: db.param_get_int_def(ParamId::HeightTxoLo, HEIGHT_GENESIS - 1)?,
            txo_hi: db.param_get_int_def(ParamId::HeightTxoHi, HEIGHT_GENESIS - 1)?,
            txos: 0,
            shielded_outputs: db.param_get_int_def(ParamId::ShieldedOutputs, 0)?,
            txos_treasury: 0,
        };

        if rules.treasury_checksum.is_none() {
            extra.txos_treasury = 1; // artificial gap
        } else {
            extra.txos_treasury = db.param_get_int_def(ParamId::TreasuryTxos, 0)?;
        }

        // configuration checksum: detect incompatible or outdated data
        let cursor_sid = db.get_cursor()?;
        match db.param_get_blob(ParamId::CfgChecksum)? {
            None => {
                info!("Settings configuration");
                db.param_set_blob(ParamId::CfgChecksum, &rules.last_fork_hash().0)?;
            }
            Some(stored) => {
                let stored =
                    Hash32::from_slice(&stored).ok_or(corrupt("cfg checksum shape"))?;
                if stored != rules.last_fork_hash() {
                    match rules.find_fork(&stored) {
                        None => {
                            return Err(mist_consensus::ConsensusError::IncompatibleConfig(
                                stored.to_string(),
                            )
                            .into());
                        }
                        Some(i) => {
                            let next_fork = rules.fork_height(i + 1);
                            if cursor_sid.height >= next_fork {
                                return Err(mist_consensus::ConsensusError::ForkMismatch(
                                    next_fork,
                                )
                                .into());
                            }
                            info!("Settings configuration");
                            db.param_set_blob(ParamId::CfgChecksum, &rules.last_fork_hash().0)?;
                        }
                    }
                }
            }
        }

        let sync_data = match db.param_get_blob(ParamId::SyncData)? {
            Some(b) => Some(SyncData::from_bytes(&b).map_err(|_| corrupt("sync data shape"))?),
            None => None,
        };

        let mmr_states = Mmr::new(DbMmrStore::open(
            Arc::clone(&storage),
            Cf::StatesMmr,
            ParamId::StatesMmrNodes,
        )?);
        let mmr_shielded = Mmr::new(DbMmrStore::open(
            Arc::clone(&storage),
            Cf::ShieldedMmr,
            ParamId::ShieldedMmrNodes,
        )?);
        let mmr_assets = Mmr::new(DbMmrStore::open(
            Arc::clone(&storage),
            Cf::AssetsMmr,
            ParamId::AssetsMmrNodes,
        )?);

        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(4);

        let mut np = Processor {
            recent: crate::recent::RecentStates::new(&rules),
            rules,
            db,
            utxos: UtxoTree::new(),
            mmr_states,
            mmr_shielded,
            mmr_assets,
            cursor: Cursor::null(),
            extra,
            sync_data,
            horizon: Horizon::infinite(),
            congestion: CongestionCache::default(),
            executor: Executor::new(threads),
            host,
            image_path: utxo::image_path(path.as_ref()),
        };

        np.cursor.sid = cursor_sid;
        np.log_sync_data();

        np.init_cursor(false)?;
        np.initialize_utxos(sp.reset_image)?;
        np.extra.txos = np.get_txos_before(np.cursor.sid.height + 1)?;

        horizon.normalize(&np.rules);
        np.horizon = horizon;

        if np.prune_old()? > 0 && !sp.vacuum {
            info!("Old data was just removed from the DB. Some space can be freed by vacuum");
        }
        if sp.vacuum {
            info!("DB compacting...");
            np.db.storage().compact()?;
            info!("DB compacting completed");
        }

        np.try_go_up()?;
        Ok(np)
    }

    // ==================== Accessors ====================

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn extra(&self) -> &Extra {
        &self.extra
    }

    pub fn sync_data(&self) -> Option<&SyncData> {
        self.sync_data.as_ref()
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    pub fn utxo_leaf_count(&self) -> usize {
        self.utxos.len()
    }

    pub fn utxo_id_count(&self) -> u64 {
        self.utxos.total_ids()
    }

    pub fn shielded_mmr_count(&self) -> u64 {
        self.mmr_shielded.leaf_count()
    }

    pub fn is_fast_sync(&self) -> bool {
        self.sync_data.is_some()
    }

    /// Digest of the live state at the cursor; equal across nodes with the
    /// same active chain.
    pub fn live_digest(&mut self) -> ChainResult<Hash32> {
        let history = self.cursor.history;
        self.evaluate_definition(&history)
    }

    /// Read an asset registry entry.
    pub fn get_asset(&self, id: u32) -> ChainResult<Option<crate::chain_db::AssetRecord>> {
        self.db.asset_get(id)
    }

    pub fn is_treasury_handled(&self) -> bool {
        self.extra.txos_treasury > 0
    }

    fn cursor_chainwork(&self) -> BigUint {
        if self.cursor.sid.is_null() {
            BigUint::default()
        } else {
            self.cursor.header.chainwork.clone()
        }
    }

    fn log_sync_data(&self) {
        if let Some(s) = &self.sync_data {
            info!(target_height = s.target.height, txo_lo = s.txo_lo, "Fast-sync mode");
        }
    }

    pub(crate) fn save_sync_data(&self) -> ChainResult<()> {
        match &self.sync_data {
            Some(s) => self.db.param_set_blob(ParamId::SyncData, &s.to_bytes()),
            None => self.db.param_del(ParamId::SyncData),
        }
    }

    // ==================== Cursor & definition ====================

    /// Reload the cursor-derived fields. `moving_up` means the caller just
    /// advanced one block and the header is already in place.
    pub(crate) fn init_cursor(&mut self, moving_up: bool) -> ChainResult<()> {
        if self.cursor.sid.height >= HEIGHT_GENESIS {
            if moving_up {
                debug_assert_eq!(self.cursor.header.height, self.cursor.sid.height);
                self.cursor.history = self.cursor.history_next;
            } else {
                self.cursor.header = self.db.get_state(self.cursor.sid.row)?.header;
                self.cursor.history = self.mmr_states.root()?;
            }
            self.cursor.id_hash = self.cursor.header.id();
            self.cursor.history_next = self.mmr_states.predicted_root(&self.cursor.id_hash)?;
        } else {
            self.cursor = Cursor::null();
        }

        self.cursor.difficulty_next = self.get_next_difficulty()?;
        Ok(())
    }

    /// Definition commitment over the live state given a history root.
    pub(crate) fn evaluate_definition(&mut self, history: &Hash32) -> ChainResult<Hash32> {
        let utxo_root = self.utxos.root();
        let shielded_root = self.mmr_shielded.root()?;
        let assets_root = self.mmr_assets.root()?;

        let mut inner = Hasher::with_tag("mist.live");
        inner.write_hash(&shielded_root);
        inner.write_hash(&assets_root);
        let live_tail = inner.finalize();

        let mut live = Hasher::with_tag("mist.live");
        live.write_hash(&utxo_root);
        live.write_hash(&live_tail);
        let live = live.finalize();

        let mut def = Hasher::with_tag("mist.def");
        def.write_hash(history);
        def.write_hash(&live);
        Ok(def.finalize())
    }

    /// Whether the committed tip's definition matches the live state.
    pub fn test_definition(&mut self) -> ChainResult<bool> {
        let txo_lo = self.sync_data.as_ref().map(|s| s.txo_lo).unwrap_or(0);
        if self.cursor.sid.height < HEIGHT_GENESIS || self.cursor.sid.height < txo_lo {
            return Ok(true); // irrelevant
        }
        let history = self.cursor.history;
        let hv = self.evaluate_definition(&history)?;
        Ok(self.cursor.header.definition == hv)
    }

    /// Definition a proposed block body would commit to, without leaving a
    /// trace: apply forward, evaluate, revert. The seam the block builder
    /// uses.
    pub fn preview_definition(&mut self, body: &Block) -> ChainResult<Option<Hash32>> {
        let height = self.cursor.sid.height + 1;
        let mut blk = body.clone();
        let mut bic = self.make_bic(height, true);

        if !self.handle_validated_block(&mut blk, &mut bic)? {
            return Ok(None);
        }

        let history_next = self.cursor.history_next;
        let def = self.evaluate_definition(&history_next)?;

        bic.fwd = false;
        self.handle_validated_block(&mut blk, &mut bic)?;
        if !bic.rollback.is_empty() {
            return Err(corrupt("preview rollback not consumed"));
        }
        Ok(Some(def))
    }

    // ==================== UTXO image ====================

    fn initialize_utxos(&mut self, reset_image: bool) -> ChainResult<()> {
        let stamp = self
            .db
            .param_get_blob(ParamId::UtxoStamp)?
            .and_then(|b| Hash32::from_slice(&b));

        if !reset_image && self.cursor.sid.height >= HEIGHT_GENESIS {
            if let Some(stamp) = stamp {
                if let Some(tree) = utxo::load_image(&self.image_path, &stamp)? {
                    self.utxos = tree;
                    self.utxos.clear_dirty();
                    if self.test_definition()? {
                        info!("UTXO image found");
                        return Ok(());
                    }
                    warn!("Definition mismatch, discarding UTXO image");
                }
            }
        }

        info!("Rebuilding UTXO image...");
        self.utxos = UtxoTree::new();
        self.extra.txos = 0;

        let entries = self.enum_txos_in_range(
            &HeightRange::new(0, self.cursor.sid.height),
            true,
        )?;
        for (id, value, _spent, h_create) in entries {
            let naked = self.txo_to_naked(&value)?;
            let outp = Output::from_bytes(&naked)?;
            self.extra.txos = id;
            let mut bic = self.make_bic(h_create, true);
            if !self.handle_output(&outp, &mut bic)? {
                return Err(corrupt("utxo rebuild rejected an output"));
            }
        }

        if !self.test_definition()? {
            warn!("Definition mismatch");
            return Err(corrupt("definition mismatch after utxo rebuild"));
        }
        Ok(())
    }

    /// Persist the UTXO image under a fresh stamp (hash-chained from the
    /// previous one) and record the stamp in the DB.
    pub fn commit_db(&mut self) -> ChainResult<()> {
        if !self.utxos.is_dirty() {
            return Ok(());
        }
        let stamp = match self.db.param_get_blob(ParamId::UtxoStamp)? {
            Some(prev) => hash_of(&prev),
            None => Hash32(rand::random::<[u8; 32]>()),
        };
        self.db.param_set_blob(ParamId::UtxoStamp, &stamp.0)?;
        utxo::save_image(&self.image_path, &stamp, &self.utxos)?;
        self.utxos.clear_dirty();
        Ok(())
    }

    // ==================== Txo helpers ====================

    /// Number of txos existing strictly below height `h`.
    pub fn get_txos_before(&self, h: Height) -> ChainResult<TxoId> {
        if h < HEIGHT_GENESIS {
            return Ok(0);
        }
        if h == HEIGHT_GENESIS {
            return Ok(self.extra.txos_treasury);
        }
        let row = self.find_active_at_strict(h - 1)?;
        self.db
            .get_state_txos(row)?
            .ok_or(corrupt("state txos cursor missing"))
    }

    /// Row id of the active state at a height.
    pub fn find_active_row(&self, h: Height) -> ChainResult<RowId> {
        self.find_active_at_strict(h)
    }

    pub(crate) fn find_active_at_strict(&self, h: Height) -> ChainResult<RowId> {
        if let Some(e) = self.recent.get(h) {
            return Ok(e.row);
        }
        self.db
            .find_active_at(h)?
            .ok_or(corrupt("active state missing"))
    }

    /// Height a txo id was created at, plus the id bound of that height.
    pub fn find_height_by_txo_id(&self, id: TxoId) -> ChainResult<(Height, TxoId)> {
        if id < self.extra.txos_treasury {
            return Ok((0, self.extra.txos_treasury));
        }
        let mut lo = HEIGHT_GENESIS;
        let mut hi = self.cursor.sid.height;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.get_txos_before(mid + 1)? > id {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        let bound = self.get_txos_before(lo + 1)?;
        if id >= bound {
            return Err(corrupt("txo id beyond chain"));
        }
        Ok((lo, bound))
    }

    /// Reconstruct a spendable input (with maturity) from a stored txo.
    pub(crate) fn to_input_with_maturity(&self, id: TxoId) -> ChainResult<Input> {
        let (value, _spent) = self.db.txo_get(id)?;
        let naked = self.txo_to_naked(&value)?;
        let outp = Output::from_bytes(&naked)?;

        let (h_create, _) = self.find_height_by_txo_id(id)?;
        let mut inp = Input::new(outp.commitment);
        inp.txo_id = id;
        inp.maturity = outp.min_maturity(h_create, self.rules.maturity_coinbase);
        Ok(inp)
    }

    /// Strip a stored txo to its naked form.
    pub fn txo_to_naked(&self, value: &[u8]) -> ChainResult<Vec<u8>> {
        if value.len() < transaction::TXO_NAKED_MIN {
            return Err(corrupt("txo too short"));
        }
        if value[0] & transaction::FLAG_INCUBATION == 0 {
            // simple case: truncate and clear the proof flags
            let mut out = value[..transaction::TXO_NAKED_MIN].to_vec();
            out[0] &= transaction::FLAG_NAKED_MASK;
            return Ok(out);
        }
        // incubated txos must be re-serialized
        let outp = Output::from_bytes(value)?;
        let bytes = outp.to_naked().to_bytes();
        debug_assert!(bytes.len() <= transaction::TXO_NAKED_MAX);
        Ok(bytes)
    }

    /// Whether a stored txo has already been stripped of its proofs.
    pub fn txo_is_naked(&self, value: &[u8]) -> bool {
        match value.first() {
            None => false,
            Some(flags) => {
                flags
                    & (transaction::FLAG_CONFIDENTIAL
                        | transaction::FLAG_PUBLIC
                        | transaction::FLAG_ASSET)
                    == 0
            }
        }
    }

    /// Walk txos of a height range in id order. Returns
    /// `(id, value, spend height, create height)` tuples.
    pub(crate) fn enum_txos_in_range(
        &self,
        hr: &HeightRange,
        unspent_only: bool,
    ) -> ChainResult<Vec<(TxoId, Vec<u8>, Option<Height>, Height)>> {
        let mut out = Vec::new();
        if hr.is_empty() {
            return Ok(out);
        }
        debug_assert!(hr.max <= self.cursor.sid.height);

        let start = self.get_txos_before(hr.min.max(HEIGHT_GENESIS))?;
        let start = if hr.min < HEIGHT_GENESIS { 0 } else { start };
        let mut id1 = start;
        let mut h: i128 = i128::from(hr.min) - 1;

        let mut fail: Option<&'static str> = None;
        self.db.walk_txos_from(start, &mut |id, value, spent| {
            if id >= id1 {
                h += 1;
                if h > hr.max as i128 {
                    return Ok(false);
                }
                if h < HEIGHT_GENESIS as i128 {
                    id1 = self.extra.txos_treasury;
                }
                if id >= id1 {
                    match self.find_height_by_txo_id(id) {
                        Ok((hh, bound)) => {
                            h = i128::from(hh);
                            id1 = bound;
                        }
                        Err(_) => {
                            fail = Some("txo beyond active chain");
                            return Ok(false);
                        }
                    }
                }
            }
            if !unspent_only || spent.is_none() {
                out.push((id, value.to_vec(), spent, h.max(0) as Height));
            }
            Ok(true)
        })?;

        if let Some(what) = fail {
            return Err(corrupt(what));
        }
        Ok(out)
    }

    // ==================== Difficulty & medians ====================

    fn thw_at(&self, h: Height) -> ChainResult<Thw> {
        let header = match self.recent.get(h) {
            Some(e) => e.header.clone(),
            None => {
                let row = self.find_active_at_strict(h)?;
                self.db.get_state(row)?.header
            }
        };
        Ok((
            i128::from(header.timestamp),
            (
                i128::from(header.height),
                BigInt::from(header.chainwork.clone()),
            ),
        ))
    }

    fn get_moving_median_ex(&self, h_last: Height, window: u32) -> ChainResult<Thw> {
        debug_assert!(h_last >= HEIGHT_GENESIS);
        let mut v: Vec<Thw> = Vec::with_capacity(window as usize);

        let mut h = i128::from(h_last);
        while v.len() < window as usize {
            if h >= HEIGHT_GENESIS as i128 {
                v.push(self.thw_at(h as Height)?);
            } else {
                // synthetic prehistoric points: starting difficulty, perfect timing
                let prev = v[v.len() - 1].clone();
                v.push((
                    prev.0 - i128::from(self.rules.da.target_s),
                    (
                        prev.1 .0 - 1,
                        prev.1 .1 - BigInt::from(self.rules.da.difficulty0.unpack()),
                    ),
                ));
            }
            h -= 1;
        }

        // ties in timestamp resolve by height
        v.sort();
        Ok(v[(window >> 1) as usize].clone())
    }

    /// Timestamp median used by the header acceptance rule.
    pub fn get_moving_median(&self) -> ChainResult<u64> {
        if self.cursor.sid.is_null() {
            return Ok(0);
        }
        let thw =
            self.get_moving_median_ex(self.cursor.sid.height, self.rules.da.window_median0)?;
        Ok(thw.0.max(0) as u64)
    }

    /// Difficulty required from the next block.
    pub fn get_next_difficulty(&self) -> ChainResult<Difficulty> {
        let r = &self.rules;
        if self.cursor.sid.is_null() {
            return Ok(r.da.difficulty0);
        }

        let thw1 = self.get_moving_median_ex(self.cursor.sid.height, r.da.window_median1)?;

        let chain_len = self.cursor.sid.height - HEIGHT_GENESIS;
        let thw0 = if chain_len >= u64::from(r.da.window_work) {
            self.get_moving_median_ex(
                self.cursor.sid.height - u64::from(r.da.window_work),
                r.da.window_median1,
            )?
        } else {
            // pad the missing depth with the synthetic prehistoric cadence
            let mut thw = self.get_moving_median_ex(HEIGHT_GENESIS, r.da.window_median1)?;
            let delta = r.da.window_work - chain_len as u32;
            thw.0 -= i128::from(r.da.target_s) * i128::from(delta);
            thw.1 .0 -= i128::from(delta);
            thw.1 .1 -= BigInt::from(r.da.difficulty0.unpack()) * delta;
            thw
        };

        debug_assert!(r.da.window_work > r.da.window_median1);
        debug_assert!(thw1.1 .0 > thw0.1 .0);

        let dh = (thw1.1 .0 - thw0.1 .0) as u32;
        let dt_trg_s = r.da.target_s * dh;

        // actual dt, only making sure it's non-negative
        let mut dt_src_s = if thw1.0 > thw0.0 {
            (thw1.0 - thw0.0).min(i128::from(u32::MAX)) as u32
        } else {
            0
        };

        if self.cursor.sid.height >= r.fork_height(1) {
            // dampening: dt := dt_src * M/N + dt_trg * (N-M)/N, 64-bit safe
            let val = u64::from(dt_src_s) * u64::from(r.da.damp_m)
                + u64::from(dt_trg_s) * u64::from(r.da.damp_n - r.da.damp_m);
            let dt = (val / u64::from(r.da.damp_n)) as u32;

            // the result must sit between src and trg for valid damp params;
            // anything else means the arithmetic overflowed
            if (dt > dt_src_s) != (dt > dt_trg_s) {
                dt_src_s = dt;
            }
        }

        // emergency clamp
        dt_src_s = dt_src_s.min(dt_trg_s * 2).max(dt_trg_s / 2);

        let work_delta = (thw1.1 .1.clone() - thw0.1 .1.clone())
            .to_biguint()
            .unwrap_or_default();

        Ok(Difficulty::calculate(&work_delta, dh, dt_trg_s, dt_src_s))
    }

    // ==================== Block application ====================

    /// Apply one stored block at the cursor's child position. `Ok(false)`
    /// means the block is invalid in context; the engine has already undone
    /// any partial work.
    #[instrument(skip(self, s, mbc), fields(height = sid.height))]
    pub(crate) fn handle_block(
        &mut self,
        sid: &StateId,
        s: &BlockHeader,
        mbc: &mut MultiblockContext,
    ) -> ChainResult<bool> {
        let (bbp, bbe) = self.db.get_state_block(sid.row)?;
        let (Some(bbp), Some(bbe)) = (bbp, bbe) else {
            warn!(height = sid.height, "Block data missing");
            return Ok(false);
        };

        let block = match Block::from_parts(&bbp, &bbe) {
            Ok(b) => b,
            Err(e) => {
                warn!(height = sid.height, error = %e, "Block deserialization failed");
                return Ok(false);
            }
        };

        let first_time = self.db.get_state_txos(sid.row)?.is_none();
        if first_time {
            let size = bbp.len() + bbe.len();
            let pid = self.db.get_peer(sid.row)?.unwrap_or(PeerId::ZERO);
            mbc.on_block(self, pid, Arc::new(block.clone()), sid.height, size)?;

            let wrk = self.cursor_chainwork() + s.difficulty.unpack();
            if wrk != s.chainwork {
                warn!(height = sid.height, "Chainwork mismatch");
                return Ok(false);
            }
            if self.cursor.difficulty_next != s.difficulty {
                warn!(
                    height = sid.height,
                    expected = %self.cursor.difficulty_next,
                    actual = %s.difficulty,
                    "Difficulty mismatch"
                );
                return Ok(false);
            }
            if s.timestamp <= self.get_moving_median()? {
                warn!(height = sid.height, "Timestamp inconsistent wrt median");
                return Ok(false);
            }

            let fmmr = FlyMmr::new(block.kernels.iter().map(|k| k.id()).collect());
            if s.kernels_root != fmmr.root() {
                warn!(height = sid.height, "Kernel commitment mismatch");
                return Ok(false);
            }
        }

        let id0 = self.extra.txos;
        let mut block = block;
        let mut bic = self.make_bic(sid.height, true);
        bic.store_shielded_output = true;
        if !first_time {
            bic.already_validated = true;
        }

        let mut ok = self.handle_validated_block(&mut block, &mut bic)?;
        if !ok {
            debug_assert!(first_time);
            debug_assert_eq!(self.extra.txos, id0);
            warn!(height = sid.height, "invalid in its context");
        } else {
            debug_assert!(self.extra.txos > id0);
        }

        let txo_lo = self.sync_data.as_ref().map(|s| s.txo_lo).unwrap_or(0);
        if ok && first_time {
            if sid.height >= txo_lo {
                // validity of the state description
                let history_next = self.cursor.history_next;
                let hv = self.evaluate_definition(&history_next)?;
                if s.definition != hv {
                    warn!(height = sid.height, "Header definition mismatch");
                    ok = false;
                }
            }

            if sid.height <= txo_lo {
                // sparse blocks must not spend txos created after h0
                for inp in &block.inputs {
                    if inp.txo_id >= mbc.id0 {
                        warn!(height = sid.height, "Invalid input in sparse block");
                        ok = false;
                        break;
                    }
                }
            }

            if !ok {
                bic.fwd = false;
                if !self.handle_validated_block(&mut block, &mut bic)? {
                    return Err(corrupt("post-check undo failed"));
                }
            }
        }

        if ok {
            // accumulated offset: this block's plus the parent's running sum
            let mut offs = block.offset;
            if sid.height > HEIGHT_GENESIS {
                let prev_row = self
                    .db
                    .get_prev_row(sid.row)?
                    .ok_or(corrupt("prev state missing"))?;
                let prev = self
                    .db
                    .get_state_extra(prev_row)?
                    .ok_or(corrupt("prev offset missing"))?;
                offs += prev;
            }

            self.db.set_state_txos_extra(
                sid.row,
                Some(self.extra.txos),
                Some(&offs),
                Some(&bic.rollback),
            )?;

            let mut inputs = Vec::with_capacity(block.inputs.len());
            for inp in &block.inputs {
                self.db.txo_set_spent(inp.txo_id, Some(sid.height))?;
                inputs.push(StateInput {
                    txo_id: inp.txo_id,
                    commitment: inp.commitment,
                });
            }
            if !inputs.is_empty() {
                self.db.set_state_inputs(sid.row, &inputs)?;
            }

            let mut id = id0;
            for out in &block.outputs {
                self.db.txo_add(id, &out.to_bytes())?;
                id += 1;
            }

            self.recent.push(sid.row, s.clone());
        }

        Ok(ok)
    }

    // ==================== Reorg control ====================

    /// Keep moving to the best functional tip until no improvement remains.
    pub fn try_go_up(&mut self) -> ChainResult<()> {
        if !self.is_treasury_handled() {
            return Ok(());
        }

        let mut dirty = false;
        let row0 = self.cursor.sid.row;

        loop {
            let tips = self.db.enum_functional_tips()?;
            let Some(best) = tips.first().copied() else {
                debug_assert!(self.cursor.sid.is_null());
                break;
            };

            let wrk = self.db.get_state(best.row)?.header.chainwork;
            if wrk <= self.cursor_chainwork() {
                break; // already at maximum (though maybe at a different tip)
            }

            self.try_go_to(best)?;
            dirty = true;
        }

        if dirty {
            self.prune_old()?;
            if self.cursor.sid.row != row0 {
                self.host.on_new_state();
            }
        }
        Ok(())
    }

    /// Move the cursor to `sid_trg`: rewind to the common ancestor, then
    /// replay the branch forward under one multiblock context.
    #[instrument(skip(self), fields(height = sid_trg.height))]
    pub(crate) fn try_go_to(&mut self, mut sid_trg: StateId) -> ChainResult<()> {
        // the path from the target down to the first active ancestor
        let mut path = Vec::new();
        loop {
            path.push(sid_trg.row);
            if !self.db.get_prev(&mut sid_trg)? {
                sid_trg.set_null();
                break;
            }
            if self.db.get_flags(sid_trg.row)? & FLAG_ACTIVE != 0 {
                break;
            }
        }

        self.rollback_to(sid_trg.height)?;

        let mut mbc = MultiblockContext::new(self)?;
        let mut ctx_fail = false;
        let mut keep_blocks = false;

        let mut sid_fwd = self.cursor.sid;
        let mut ipos = path.len();

        while ipos > 0 {
            ipos -= 1;
            sid_fwd = StateId {
                row: path[ipos],
                height: self.cursor.sid.height + 1,
            };

            let s = self.db.get_state(sid_fwd.row)?.header;

            if !self.handle_block(&sid_fwd, &s, &mut mbc)? {
                ctx_fail = true;
                mbc.set_fail();

                let txo_lo = self.sync_data.as_ref().map(|s| s.txo_lo).unwrap_or(0);
                if self.cursor.sid.height + 1 == txo_lo {
                    mbc.on_fast_sync_failed_on_lo(self)?;
                }
                break;
            }

            // update the history MMR and cursor
            if self.cursor.sid.height >= HEIGHT_GENESIS {
                let id = self.cursor.id_hash;
                self.mmr_states.append(&id)?;
            }
            self.db.move_fwd(&sid_fwd)?;
            self.cursor.sid = sid_fwd;
            self.cursor.header = s;
            self.init_cursor(true)?;

            if self.is_fast_sync() {
                self.db.del_state_block_pp(sid_fwd.row)?; // save space
            }

            let target_h = self.sync_data.as_ref().map(|s| s.target.height);
            if Some(mbc.in_progress.max) == target_h {
                if !mbc.flush(self)? {
                    break;
                }
                self.on_fast_sync_over(&mut mbc, &mut ctx_fail)?;
                if mbc.failed() {
                    keep_blocks = true;
                }
            }

            if mbc.failed() {
                break;
            }
        }

        if mbc.flush(self)? {
            return Ok(()); // at position
        }

        if !ctx_fail {
            warn!("Context-free verification failed");
        }

        self.rollback_to(mbc.in_progress.min - 1)?;

        if keep_blocks {
            return Ok(());
        }

        if !mbc.pid_last.is_zero() {
            let pid = mbc.pid_last;
            self.host.on_peer_insane(&pid);

            // extend the deletion over consecutive blocks from the same peer
            while ipos > 0 {
                match self.db.get_peer(path[ipos - 1])? {
                    Some(p) if p == pid => {
                        ipos -= 1;
                        sid_fwd = StateId {
                            row: path[ipos],
                            height: sid_fwd.height + 1,
                        };
                    }
                    _ => break,
                }
            }
        }

        info!(
            from = self.cursor.sid.height + 1,
            to = sid_fwd.height,
            "Deleting blocks range"
        );
        self.delete_blocks_in_range(&sid_fwd, self.cursor.sid.height)?;
        Ok(())
    }

    /// End-of-run fast-sync checks: no unspendable (naked) txo may remain
    /// above `h0`; on success the horizons catch up and sync data clears.
    fn on_fast_sync_over(
        &mut self,
        mbc: &mut MultiblockContext,
        ctx_fail: &mut bool,
    ) -> ChainResult<()> {
        let sync = *self.sync_data.as_ref().expect("fast-sync active");
        debug_assert_eq!(mbc.in_progress.max, sync.target.height);

        mbc.pid_last = PeerId::ZERO; // don't blame the last peer if something goes wrong

        // ensure no reduced UTXOs are left
        let mut sid_fail: Option<StateId> = None;
        let mut naked_id = None;
        self.db.walk_txos_from(mbc.id0, &mut |id, value, spent| {
            if spent.is_some() {
                return Ok(true);
            }
            if self.txo_is_naked(value) {
                naked_id = Some(id);
                return Ok(false);
            }
            Ok(true)
        })?;
        if let Some(id) = naked_id {
            let (h, _) = self.find_height_by_txo_id(id)?;
            sid_fail = Some(StateId {
                row: self.find_active_at_strict(h)?,
                height: h,
            });
        }

        if let Some(sid_fail) = sid_fail {
            *ctx_fail = true;
            mbc.set_fail();
            warn!("Fast-sync failed");

            mbc.pid_last = self.db.get_peer(sid_fail.row)?.unwrap_or(PeerId::ZERO);

            if sync.txo_lo > sync.h0 {
                mbc.on_fast_sync_failed(self, true)?;
            } else {
                // try to preserve blocks: recover them from the txos
                while self.cursor.sid.height > sync.h0 {
                    let sid = self.cursor.sid;

                    let rebuilt = self.get_block(
                        &sid,
                        sync.h0,
                        sync.txo_lo,
                        sync.target.height,
                        true,
                    )?;
                    let (mut bbp, bbe) =
                        rebuilt.ok_or(corrupt("block reconstruction failed"))?;

                    if sid_fail.height == sid.height {
                        bbp.clear();
                        self.db.set_state_not_functional(sid.row)?;
                    }

                    self.rollback_to(sid.height - 1)?;

                    let peer = self.db.get_peer(sid.row)?.unwrap_or(PeerId::ZERO);
                    self.db.set_state_block(sid.row, &bbp, &bbe, peer)?;
                    self.db.set_state_txos_extra(sid.row, None, None, None)?;
                }

                mbc.on_fast_sync_failed(self, false)?;
            }
        } else {
            info!("Fast-sync succeeded");

            self.raise_fossil(self.cursor.sid.height)?;
            self.raise_txo_hi(self.cursor.sid.height)?;
            self.raise_txo_lo(sync.txo_lo)?;

            self.sync_data = None;
            self.save_sync_data()?;
            self.host.on_fast_sync_over();
        }
        Ok(())
    }

    pub(crate) fn delete_blocks_in_range(
        &mut self,
        sid_top: &StateId,
        h_stop: Height,
    ) -> ChainResult<()> {
        let mut sid = *sid_top;
        while !sid.is_null() && sid.height > h_stop {
            self.delete_block(sid.row)?;
            if !self.db.get_prev(&mut sid)? {
                sid.set_null();
            }
        }
        Ok(())
    }

    fn delete_block(&mut self, row: RowId) -> ChainResult<()> {
        self.db.del_state_block_all(row)?;
        self.db.set_state_not_functional(row)?;
        Ok(())
    }

    // ==================== Rollback ====================

    /// Rewind the active chain to height `h` in three passes: restore spent
    /// inputs, undo created outputs, replay kernels backward with their
    /// journals.
    #[instrument(skip(self))]
    pub fn rollback_to(&mut self, h: Height) -> ChainResult<()> {
        debug_assert!(h <= self.cursor.sid.height);
        if h == self.cursor.sid.height {
            return Ok(());
        }
        if h < self.extra.fossil {
            return Err(corrupt("rollback below fossil"));
        }

        let id0 = self.get_txos_before(h + 1)?;

        // pass 1: restore inputs spent by the rolled-back blocks
        let mut sid = self.cursor.sid;
        while !sid.is_null() && sid.height > h {
            let inputs = self.db.get_state_inputs(sid.row)?;
            let mut bic = self.make_bic(sid.height, false);

            for si in &inputs {
                if si.txo_id >= id0 {
                    continue; // created and spent within the range
                }
                let mut inp = self.to_input_with_maturity(si.txo_id)?;
                if !self.handle_input(&mut inp, &mut bic)? {
                    return Err(corrupt("input restore failed"));
                }
                self.db.txo_set_spent(si.txo_id, None)?;
            }
            self.db.set_state_inputs(sid.row, &[])?;

            if !self.db.get_prev(&mut sid)? {
                sid.set_null();
            }
        }

        // pass 2: undo outputs created in the range
        let entries = self.enum_txos_in_range(
            &HeightRange::new(h + 1, self.cursor.sid.height),
            true,
        )?;
        for (_id, value, _spent, h_create) in entries {
            let naked = self.txo_to_naked(&value)?;
            let outp = Output::from_bytes(&naked)?;
            let mut bic = self.make_bic(h_create, false);
            if !self.handle_output(&outp, &mut bic)? {
                return Err(corrupt("output undo failed"));
            }
        }

        self.db.txo_del_from(id0)?;
        self.db.delete_events_from(h + 1)?;

        // pass 3: kernels backward, consuming the rollback journals
        while self.cursor.sid.height > h {
            let row = self.cursor.sid.row;
            let (_, bbe) = self.db.get_state_block(row)?;
            let bbe = bbe.ok_or(corrupt("eternal part missing on rollback"))?;
            let mut dec = Decoder::new(&bbe);
            let kernels = Block::read_eternal(&mut dec)?;
            dec.finish()?;

            let mut bic = self.make_bic(self.cursor.sid.height, false);
            bic.store_shielded_output = true;
            bic.rollback = self.db.get_state(row)?.rollback;
            // suppress the per-block counters; they only hold forward
            bic.shielded_ins = u32::MAX;
            bic.shielded_outs = u32::MAX;

            for krn in kernels.iter().rev() {
                if !self.handle_kernel_element(krn, &mut bic)? {
                    return Err(corrupt("kernel rollback failed"));
                }
            }
            if !bic.rollback.is_empty() {
                return Err(corrupt("rollback journal not consumed"));
            }

            let mut sid = self.cursor.sid;
            self.db.move_back(&mut sid)?;
            self.cursor.sid = sid;
        }

        self.recent.rollback_to(h);
        self.mmr_states.shrink_to(h.saturating_sub(HEIGHT_GENESIS))?;

        self.extra.txos = id0;

        self.init_cursor(false)?;
        if !self.test_definition()? {
            return Err(corrupt("definition mismatch after rollback"));
        }

        self.host.on_rolled_back();
        Ok(())
    }

    // ==================== Pruning ====================

    fn is_bigger2(a: Height, b1: Height, b2: Height) -> bool {
        match b1.checked_add(b2) {
            Some(s) => a > s,
            None => false,
        }
    }

    /// Prune stale branches, raise the fossil and txo horizons. Inactive
    /// during fast-sync. Returns how many items were removed or rewritten.
    pub fn prune_old(&mut self) -> ChainResult<u64> {
        if self.is_fast_sync() {
            return Ok(0); // don't remove anything while in fast-sync mode
        }

        let mut pruned = 0u64;

        if self.cursor.sid.height > self.horizon.branching.saturating_add(HEIGHT_GENESIS - 1) {
            let h = self.cursor.sid.height - self.horizon.branching;
            loop {
                let tips = self.db.enum_tips()?;
                let Some(tip) = tips.first().copied() else { break };
                if tip.height >= h {
                    break;
                }

                // delete the branch bottom-up until it joins a survivor
                let mut row = Some(tip.row);
                while let Some(r) = row {
                    if self.db.get_flags(r)? & FLAG_ACTIVE != 0 {
                        break;
                    }
                    if self.db.has_children(r)? {
                        break;
                    }
                    let prev = self.db.get_prev_row(r)?;
                    self.db.delete_state(r)?;
                    pruned += 1;
                    row = prev;
                }
            }
        }

        if Self::is_bigger2(
            self.cursor.sid.height,
            self.extra.fossil,
            self.rules.max_rollback,
        ) {
            pruned += self.raise_fossil(self.cursor.sid.height - self.rules.max_rollback)?;
        }
        if Self::is_bigger2(
            self.cursor.sid.height,
            self.extra.txo_lo,
            self.horizon.local.lo,
        ) {
            pruned += self.raise_txo_lo(self.cursor.sid.height - self.horizon.local.lo)?;
        }
        if Self::is_bigger2(
            self.cursor.sid.height,
            self.extra.txo_hi,
            self.horizon.local.hi,
        ) {
            pruned += self.raise_txo_hi(self.cursor.sid.height - self.horizon.local.hi)?;
        }

        Ok(pruned)
    }

    /// Delete block data (keeping headers) below the target height.
    fn raise_fossil(&mut self, trg: Height) -> ChainResult<u64> {
        if trg <= self.extra.fossil {
            return Ok(0);
        }
        let mut n = 0u64;
        while self.extra.fossil < trg {
            self.extra.fossil += 1;
            for row in self.db.enum_states_at(self.extra.fossil)? {
                if self.db.get_flags(row)? & FLAG_ACTIVE != 0 {
                    self.db.del_state_block_ppr(row)?;
                } else {
                    self.delete_block(row)?;
                }
                n += 1;
            }
        }
        self.db
            .param_set_int(ParamId::FossilHeight, self.extra.fossil)?;
        Ok(n)
    }

    /// Delete fully-spent txos below the target and compact input lists.
    fn raise_txo_lo(&mut self, trg: Height) -> ChainResult<u64> {
        if trg <= self.extra.txo_lo {
            return Ok(0);
        }
        let mut n = 0u64;
        while self.extra.txo_lo < trg {
            self.extra.txo_lo += 1;
            let row = self.find_active_at_strict(self.extra.txo_lo)?;
            let inputs = self.db.get_state_inputs(row)?;
            if inputs.is_empty() {
                continue;
            }

            let mut kept = Vec::with_capacity(inputs.len());
            for inp in inputs {
                if inp.txo_id >= self.extra.txos_treasury {
                    self.db.txo_del(inp.txo_id)?;
                    n += 1;
                } else {
                    kept.push(inp);
                }
            }
            self.db.set_state_inputs(row, &kept)?;
        }
        self.extra.txo_lo = trg;
        self.db
            .param_set_int(ParamId::HeightTxoLo, self.extra.txo_lo)?;
        Ok(n)
    }

    /// Strip proofs off spent txos below the target (naked rewrite).
    fn raise_txo_hi(&mut self, trg: Height) -> ChainResult<u64> {
        if trg <= self.extra.txo_hi {
            return Ok(0);
        }
        let mut n = 0u64;
        while self.extra.txo_hi < trg {
            self.extra.txo_hi += 1;
            let row = self.find_active_at_strict(self.extra.txo_hi)?;
            for inp in self.db.get_state_inputs(row)? {
                let (value, _) = self.db.txo_get(inp.txo_id)?;
                if self.txo_is_naked(&value) {
                    continue;
                }
                let naked = self.txo_to_naked(&value)?;
                self.db.txo_set_value(inp.txo_id, &naked)?;
                n += 1;
            }
        }
        self.db
            .param_set_int(ParamId::HeightTxoHi, self.extra.txo_hi)?;
        Ok(n)
    }

    /// Height below which incoming data is not useful to us.
    pub fn get_lowest_return_height(&self) -> Height {
        let mut ret = self.extra.txo_hi;
        let h0 = match &self.sync_data {
            Some(s) => s.h0,
            None => self.cursor.sid.height,
        };
        if h0 > self.rules.max_rollback {
            ret = ret.max(h0 - self.rules.max_rollback);
        }
        ret
    }

    // ==================== Congestion & data requests ====================

    /// Discover congestions, (re)target fast-sync, and issue data requests.
    pub fn enum_congestions(&mut self) -> ChainResult<()> {
        if !self.is_treasury_handled() {
            let id = BlockId {
                height: 0,
                hash: Hash32::ZERO,
            };
            self.host.request_data(&id, true, &StateId::default());
            return Ok(());
        }

        let cursor_work = self.cursor_chainwork();
        let max_idx = congestion::enumerate(
            &self.db,
            &cursor_work,
            &mut self.congestion,
            HEIGHT_GENESIS,
        )?;

        // fast-sync status
        if let Some(i) = max_idx {
            let (max_height, rows_len) = {
                let t = &self.congestion.tips[i];
                (t.height, t.rows.len() as u64)
            };

            let hi = self.horizon.sync.hi;
            let first_time = !self.is_fast_sync()
                && Self::is_bigger2(
                    max_height,
                    self.cursor.sid.height,
                    hi.saturating_add(hi / 2),
                );

            let mut pending = self.sync_data;
            if first_time {
                // first time target acquisition
                let mut txo_lo = if max_height > self.horizon.sync.lo {
                    max_height - self.horizon.sync.lo
                } else {
                    0
                };
                txo_lo = txo_lo.max(self.extra.txo_lo);

                pending = Some(SyncData {
                    h0: max_height - rows_len,
                    txo_lo,
                    target: StateId::default(),
                    sigma: EcPoint::identity(),
                });
            }

            let trg_change = pending.is_some()
                && Self::is_bigger2(
                    max_height,
                    pending.as_ref().map(|s| s.target.height).unwrap_or(0),
                    hi,
                );

            if trg_change {
                let mut sync = pending.expect("checked above");
                let h_target_prev = if first_time {
                    max_height - rows_len
                } else {
                    sync.target.height
                };

                sync.target.height = max_height - hi;
                sync.target.row = {
                    let t = &self.congestion.tips[i];
                    t.rows[(t.height - sync.target.height) as usize]
                };

                if sync.txo_lo > 0 {
                    // ensure no old blocks, possibly generated with an
                    // incorrect TxoLo, survive in the committed range
                    let h_max_sane = self.cursor.sid.height + self.rules.max_rollback;
                    if h_target_prev < h_max_sane {
                        if sync.target.height <= h_max_sane {
                            let trg = sync.target;
                            self.sync_data = Some(sync);
                            self.delete_blocks_in_range(&trg, h_target_prev)?;
                        } else {
                            let t = &self.congestion.tips[i];
                            let sid = StateId {
                                height: h_max_sane,
                                row: t.rows[(t.height - h_max_sane) as usize],
                            };
                            self.sync_data = Some(sync);
                            self.delete_blocks_in_range(&sid, h_target_prev)?;
                        }
                    } else {
                        self.sync_data = Some(sync);
                    }
                } else {
                    self.sync_data = Some(sync);
                }

                self.save_sync_data()?;
            } else if first_time {
                self.sync_data = pending;
                self.save_sync_data()?;
            }

            if first_time {
                self.log_sync_data();
            }
        }

        // request missing data
        for idx in 0..self.congestion.tips.len() {
            let (needs_hdrs, top, bottom) = {
                let t = &self.congestion.tips[idx];
                (t.needs_hdrs, t.top(), t.bottom())
            };

            // current policy: ask only for blocks of the best proven chain
            if !(needs_hdrs || Some(idx) == max_idx) {
                continue;
            }

            if !needs_hdrs {
                if let Some(sync) = &self.sync_data {
                    if !self.congestion.tips[idx].is_contained(&sync.target) {
                        continue; // irrelevant branch during fast-sync
                    }
                }
                let hash = self.db.get_state(bottom.row)?.header.id();
                let id = BlockId {
                    height: bottom.height,
                    hash,
                };
                self.request_data_internal(&id, true, &top);
            } else {
                let s = self.db.get_state(bottom.row)?.header;
                let id = BlockId {
                    height: s.height - 1,
                    hash: s.prev,
                };
                self.request_data_internal(&id, false, &top);
            }
        }

        Ok(())
    }

    fn request_data_internal(&mut self, id: &BlockId, is_block: bool, target: &StateId) {
        if id.height >= self.get_lowest_return_height() {
            self.host.request_data(id, is_block, target);
        } else {
            warn!(height = id.height, "State unreachable");
        }
    }

    // ==================== Ingress ====================

    /// A header arrived from a peer.
    pub fn on_state(&mut self, s: &BlockHeader, peer: &PeerId) -> ChainResult<DataStatus> {
        if !s.sanity_ok() {
            warn!(height = s.height, "header invalid");
            return Ok(DataStatus::Invalid);
        }

        let now = timestamp_now();
        if s.timestamp > now && s.timestamp - now > self.rules.da.max_ahead_s {
            warn!(height = s.height, ahead = s.timestamp - now, "Timestamp ahead");
            return Ok(DataStatus::Invalid);
        }

        if s.height < self.get_lowest_return_height() {
            return Ok(DataStatus::Unreachable);
        }

        if self.db.state_find(&s.id())?.is_some() {
            return Ok(DataStatus::Rejected);
        }

        self.db.insert_state(s, *peer)?;
        info!(height = s.height, id = %s.id(), "Header accepted");
        Ok(DataStatus::Accepted)
    }

    /// A block body arrived from a peer.
    pub fn on_block(
        &mut self,
        id: &Hash32,
        perishable: &[u8],
        eternal: &[u8],
        peer: &PeerId,
    ) -> ChainResult<DataStatus> {
        let Some(row) = self.db.state_find(id)? else {
            warn!(id = %id, "Block unexpected");
            return Ok(DataStatus::Rejected);
        };
        let height = self.db.get_state(row)?.header.height;

        let size = perishable.len() + eternal.len();
        if size > self.rules.max_body_size {
            warn!(height, size, "Block too large");
            return Ok(DataStatus::Invalid);
        }

        if self.db.get_flags(row)? & FLAG_FUNCTIONAL != 0 {
            debug!(height, "Block already received");
            return Ok(DataStatus::Rejected);
        }

        if height < self.get_lowest_return_height() {
            return Ok(DataStatus::Unreachable);
        }

        self.db.set_state_block(row, perishable, eternal, *peer)?;
        self.db.set_state_functional(row)?;

        Ok(DataStatus::Accepted)
    }

    /// The treasury blob arrived.
    pub fn on_treasury(&mut self, blob: &[u8]) -> ChainResult<DataStatus> {
        let Some(expected) = self.rules.treasury_checksum else {
            return Ok(DataStatus::Invalid); // should be no treasury
        };
        if hash_of(blob) != expected {
            return Ok(DataStatus::Invalid);
        }
        if self.is_treasury_handled() {
            return Ok(DataStatus::Rejected);
        }

        if !self.handle_treasury(blob)? {
            return Ok(DataStatus::Invalid);
        }

        self.extra.txos += 1; // artificial gap
        self.extra.txos_treasury = self.extra.txos;
        self.db
            .param_set_int(ParamId::TreasuryTxos, self.extra.txos_treasury)?;
        self.db.param_set_blob(ParamId::TreasuryBlob, blob)?;

        info!("Treasury verified");

        self.host.on_new_state();
        self.try_go_up()?;

        Ok(DataStatus::Accepted)
    }

    fn handle_treasury(&mut self, blob: &[u8]) -> ChainResult<bool> {
        debug_assert!(!self.is_treasury_handled());

        let groups = match decode_treasury(blob) {
            Ok(g) => g,
            Err(_) => {
                warn!("Treasury corrupt");
                return Ok(false);
            }
        };

        // context-free proof validity of each group. The zero-sum law does
        // not apply: the treasury mints the initial supply, and its content
        // is pinned by the checksum.
        for g in &groups {
            if !self.validate_group_proofs(g)? {
                warn!("Treasury validation failed");
                return Ok(false);
            }
        }

        info!(groups = groups.len(), "Treasury check");

        let mut bic = self.make_bic(0, true);
        let mut groups = groups;
        for i in 0..groups.len() {
            if !self.handle_validated_tx(&mut groups[i], &mut bic)? {
                // undo the partially applied prefix
                bic.fwd = false;
                for g in groups[..i].iter_mut().rev() {
                    if !self.handle_validated_tx(g, &mut bic)? {
                        return Err(corrupt("treasury undo failed"));
                    }
                }
                warn!("Treasury invalid");
                return Ok(false);
            }
        }

        let mut id0: TxoId = 0;
        for g in &groups {
            for out in &g.outputs {
                self.db.txo_add(id0, &out.to_bytes())?;
                id0 += 1;
            }
        }

        Ok(true)
    }

    // ==================== Standalone validation ====================

    /// Proof-only verification of a transaction vector (no balance law);
    /// used for the treasury groups.
    fn validate_group_proofs(&self, block: &Block) -> ChainResult<bool> {
        let mac = MultiAssetContext::new();
        let params = TxContextParams {
            allow_unsigned_outputs: false,
            n_verifiers: 1,
        };
        let mut ctx = TxContext::new(params, HeightRange::new(1, 0));
        let mut bc = BatchContext::new();

        if !ctx.validate_and_summarize(block, &mut bc, &mac, &self.rules, None) {
            return Ok(false);
        }

        let mut total = bc.take_sum();
        mac.calculate(&mut total, &self.executor)?;
        Ok(total == RistrettoPoint::identity())
    }

    /// Full context-free verification of one transaction vector, including
    /// proof batches and the balance law; the shared seam for the block
    /// builder.
    pub fn validate_block_standalone(
        &self,
        block: &Block,
        hr: HeightRange,
        allow_unsigned: bool,
    ) -> ChainResult<bool> {
        let msc = MultiShieldedContext::new();
        let mac = MultiAssetContext::new();
        let params = TxContextParams {
            allow_unsigned_outputs: allow_unsigned,
            n_verifiers: 1,
        };
        let mut ctx = TxContext::new(params, hr);
        let mut bc = BatchContext::new();

        if !ctx.validate_and_summarize(block, &mut bc, &mac, &self.rules, None) {
            return Ok(false);
        }
        if !msc.is_valid(&block.kernels, &mut bc, 0, 1) {
            return Ok(false);
        }

        let mut total = bc.take_sum();
        {
            let db = &self.db;
            msc.calculate(&mut total, &self.executor, &mut |idx, count| {
                db.shielded_read(idx, count)
            })?;
        }
        mac.calculate(&mut total, &self.executor)?;
        if total != RistrettoPoint::identity() {
            return Ok(false);
        }

        Ok(ctx.is_valid_block(&block.offset, &self.rules))
    }

    /// Contextual validation of a loose transaction against the current tip.
    pub fn validate_tx_context(
        &mut self,
        tx: &Transaction,
        hr: &HeightRange,
        shielded_tested: bool,
    ) -> ChainResult<TxStatus> {
        let h = self.cursor.sid.height + 1;
        if !hr.contains(h) {
            return Ok(TxStatus::InvalidContext);
        }

        // ensure input UTXOs are present (duplicates grouped)
        let mut i = 0;
        while i < tx.inputs.len() {
            let comm = tx.inputs[i].commitment;
            let mut count = 1u64;
            while i + 1 < tx.inputs.len() && tx.inputs[i + 1].commitment == comm {
                i += 1;
                count += 1;
            }
            i += 1;
            if !self.validate_inputs(&comm, count) {
                return Ok(TxStatus::InvalidInput);
            }
        }

        // kernels in validate-only mode
        let mut bic = self.make_bic(h, true);
        bic.set_validate_only();

        for krn in &tx.kernels {
            if !self.handle_kernel_element(krn, &mut bic)? {
                return Ok(if bic.limit_exceeded {
                    TxStatus::LimitExceeded
                } else {
                    TxStatus::InvalidContext
                });
            }
        }

        // output assets must be in range
        for out in &tx.outputs {
            if !bic.validate_asset_range(out.asset_proof.as_ref()) {
                return Ok(TxStatus::InvalidContext);
            }
        }

        if !shielded_tested && bic.shielded_ins > 0 {
            debug_assert!(bic.shielded_ins <= self.rules.shielded.max_ins);

            let msc = MultiShieldedContext::new();
            let mut bc = BatchContext::new();
            if !msc.is_valid(&tx.kernels, &mut bc, 0, 1) {
                return Ok(TxStatus::InvalidInput);
            }
            let mut total = bc.take_sum();
            {
                let db = &self.db;
                msc.calculate(&mut total, &self.executor, &mut |idx, count| {
                    db.shielded_read(idx, count)
                })?;
            }
            if total != RistrettoPoint::identity() {
                return Ok(TxStatus::InvalidInput);
            }
        }

        Ok(TxStatus::Ok)
    }

    /// Whether `count` spendable duplicates of a commitment exist.
    pub fn validate_inputs(&self, commitment: &EcPoint, count: u64) -> bool {
        self.utxos.count_in_range(commitment, self.cursor.sid.height) >= count
    }

    // ==================== Block serving & reconstruction ====================

    /// Serve (or rebuild) a block for a peer with horizon bounds `h0` /
    /// `h_lo1` / `h_hi1`. Returns the perishable and eternal blobs.
    pub fn get_block(
        &self,
        sid: &StateId,
        h0: Height,
        h_lo1: Height,
        h_hi1: Height,
        active: bool,
    ) -> ChainResult<Option<(Vec<u8>, Vec<u8>)>> {
        if h_lo1 > h_hi1 || h0 >= sid.height {
            return Ok(None);
        }

        // a valid block can't spend its own outputs, so a request at the tip
        // means a full transfer
        let h_hi1 = h_hi1.max(sid.height);
        if self.extra.txo_hi > h_hi1 {
            return Ok(None);
        }
        let h_lo1 = h_lo1.max(sid.height - 1);
        if self.extra.txo_lo > h_lo1 {
            return Ok(None);
        }
        if h0 >= HEIGHT_GENESIS && self.extra.txo_lo > sid.height {
            return Ok(None); // no information for the requested low range
        }
        if self.is_fast_sync() && sid.height > self.cursor.sid.height {
            return Ok(None); // never return non-full blocks during sync
        }

        let (bbp, bbe) = self.db.get_state_block(sid.row)?;
        let bbe = bbe.ok_or(corrupt("eternal part missing"))?;

        let full = sid.height >= h_hi1 && sid.height > h_lo1;
        if full {
            if let Some(bbp) = bbp {
                if !bbp.is_empty() {
                    return Ok(Some((bbp, bbe)));
                }
            }
        }

        // re-create the perishable part from the txos
        if !active && self.db.get_flags(sid.row)? & FLAG_ACTIVE == 0 {
            return Ok(None); // only active states can be rebuilt
        }

        let id_inp_cut = self.get_txos_before(h0 + 1)?;
        let id1 = self
            .db
            .get_state_txos(sid.row)?
            .ok_or(corrupt("state txos cursor missing"))?;

        let mut offset = self
            .db
            .get_state_extra(sid.row)?
            .ok_or(corrupt("state offset missing"))?;
        let id0 = match self.db.get_prev_row(sid.row)? {
            Some(prev) => {
                let prev_off = self
                    .db
                    .get_state_extra(prev)?
                    .ok_or(corrupt("prev offset missing"))?;
                offset -= prev_off;
                self.db
                    .get_state_txos(prev)?
                    .ok_or(corrupt("prev txos cursor missing"))?
            }
            None => self.extra.txos_treasury,
        };

        let mut enc = Encoder::new();
        write_scalar(&mut enc, &offset);

        // inputs: transfer when spent above h_lo1 or created at/below h0
        let inputs = self.db.get_state_inputs(sid.row)?;
        let selected: Vec<&StateInput> = inputs
            .iter()
            .filter(|si| sid.height > h_lo1 || si.txo_id < id_inp_cut)
            .collect();
        enc.write_u32(selected.len() as u32);
        for si in &selected {
            si.commitment.write(&mut enc);
        }

        // outputs: full above h_hi1, naked above h_lo1, omitted below
        let mut outputs: Vec<Vec<u8>> = Vec::new();
        self.db.walk_txos_from(id0, &mut |id, value, spent| {
            if id >= id1 {
                return Ok(false);
            }
            let spent_h = spent.unwrap_or(Height::MAX);
            if spent_h <= h_lo1 {
                return Ok(true);
            }
            if spent_h <= h_hi1 {
                outputs.push(self.txo_to_naked(value)?);
            } else {
                outputs.push(value.to_vec());
            }
            Ok(true)
        })?;
        enc.write_u32(outputs.len() as u32);
        for o in &outputs {
            enc.write_raw(o);
        }

        Ok(Some((enc.into_bytes(), bbe)))
    }

    /// Reconstruct an active block body with input maturities restored.
    pub fn extract_block_with_extra(&self, sid: &StateId) -> ChainResult<Option<Block>> {
        if self.db.get_flags(sid.row)? & FLAG_ACTIVE == 0 {
            return Ok(None);
        }
        // below these horizons the stored txos no longer carry the originals
        if self.extra.txo_lo > sid.height || self.extra.txo_hi > sid.height {
            return Ok(None);
        }

        let (_, bbe) = self.db.get_state_block(sid.row)?;
        let bbe = bbe.ok_or(corrupt("eternal part missing"))?;
        let mut dec = Decoder::new(&bbe);
        let kernels = Block::read_eternal(&mut dec)?;
        dec.finish()?;

        let mut inputs = Vec::new();
        for si in self.db.get_state_inputs(sid.row)? {
            inputs.push(self.to_input_with_maturity(si.txo_id)?);
        }

        let id1 = self
            .db
            .get_state_txos(sid.row)?
            .ok_or(corrupt("state txos cursor missing"))?;
        let mut offset = self
            .db
            .get_state_extra(sid.row)?
            .ok_or(corrupt("state offset missing"))?;
        let id0 = match self.db.get_prev_row(sid.row)? {
            Some(prev) => {
                offset -= self
                    .db
                    .get_state_extra(prev)?
                    .ok_or(corrupt("prev offset missing"))?;
                self.db
                    .get_state_txos(prev)?
                    .ok_or(corrupt("prev txos cursor missing"))?
            }
            None => self.extra.txos_treasury,
        };

        let mut outputs = Vec::new();
        self.db.walk_txos_from(id0, &mut |id, value, _spent| {
            if id >= id1 {
                return Ok(false);
            }
            outputs.push(Output::from_bytes(value)?);
            Ok(true)
        })?;

        Ok(Some(Block {
            offset,
            inputs,
            outputs,
            kernels,
        }))
    }

    // ==================== Kernel proofs ====================

    /// Merkle proof of a kernel's inclusion in its block, plus the height.
    pub fn get_kernel_proof(
        &self,
        kernel_id: &Hash32,
    ) -> ChainResult<Option<(Height, MerkleProof)>> {
        let Some(h) = self.db.find_kernel(kernel_id)? else {
            return Ok(None);
        };
        let row = self.find_active_at_strict(h)?;
        let (_, bbe) = self.db.get_state_block(row)?;
        let bbe = bbe.ok_or(corrupt("eternal part missing"))?;
        let mut dec = Decoder::new(&bbe);
        let kernels = Block::read_eternal(&mut dec)?;
        dec.finish()?;

        let fmmr = FlyMmr::new(kernels.iter().map(|k| k.id()).collect());
        let Some(i) = fmmr.find(kernel_id) else {
            return Err(corrupt("kernel index desynced"));
        };
        Ok(Some((h, fmmr.proof(i)?)))
    }

    // ==================== Events ====================

    /// Append an event (wallet-layer seam); truncated on rollback.
    pub fn add_event(&mut self, h: Height, key: &[u8], body: &[u8]) -> ChainResult<()> {
        self.db.insert_event(h, body, key)?;
        self.host.on_event(h, body);
        Ok(())
    }

    pub fn find_events(&self, key: &[u8]) -> ChainResult<Vec<(Height, Vec<u8>)>> {
        self.db.find_events(key)
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        if let Err(e) = self.commit_db() {
            warn!(error = %e, "DB commit failed");
        }
    }
}

fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Treasury blob: a list of serialized transaction groups.
pub fn encode_treasury(groups: &[Block]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_u32(groups.len() as u32);
    for g in groups {
        enc.write_bytes(&g.perishable_bytes());
        enc.write_bytes(&g.eternal_bytes());
    }
    enc.into_bytes()
}

fn decode_treasury(blob: &[u8]) -> Result<Vec<Block>, DecodeError> {
    let mut dec = Decoder::new(blob);
    let n = dec.read_u32()? as usize;
    if n > 1 << 12 {
        return Err(DecodeError::Malformed("treasury group count"));
    }
    let mut groups = Vec::with_capacity(n);
    for _ in 0..n {
        let p = dec.read_bytes()?;
        let e = dec.read_bytes()?;
        groups.push(Block::from_parts(&p, &e)?);
    }
    dec.finish()?;
    Ok(groups)
}
