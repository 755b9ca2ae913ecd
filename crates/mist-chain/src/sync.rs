//! The multiblock verification context and the fast-sync accumulation
//! protocol.
//!
//! Blocks applied within one sync run share this context: per-block
//! verification fans out over the worker pool while application continues
//! on the control thread, sparse blocks accumulate their offset and sigma
//! instead of being balance-checked individually, and `flush` settles the
//! batch before the run is allowed to stand.

use crate::error::ChainResult;
use crate::processor::Processor;
use crate::verify::{MultiAssetContext, MultiShieldedContext};
use mist_consensus::{HeightRange, Rules, TxContext, TxContextParams};
use mist_primitives::{BatchContext, Block, EcPoint, PeerId, Scalar, TxoId};
use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Verification bytes allowed in flight before block intake stalls.
const SIZE_PENDING_MAX: usize = 10 * 1024 * 1024;

/// State shared with the worker tasks.
struct MbcShared {
    rules: Arc<Rules>,
    fail: AtomicBool,
    batch_dirty: AtomicBool,
    /// Merged batch-context sums from all finished tasks.
    batch_sum: Mutex<RistrettoPoint>,
    /// Deferred sparse totals: accumulated offset and sigma.
    sparse_acc: Mutex<(Scalar, RistrettoPoint)>,
    size_pending: Mutex<usize>,
    size_cv: Condvar,
}

/// Per-block shared verification state.
struct SharedBlock {
    body: Arc<Block>,
    sparse: bool,
    size: usize,
    n_verifiers: u32,
    merged: Mutex<(TxContext, bool /* still valid */)>,
    done: Mutex<u32>,
}

/// Context of one sync run (one `try_go_to`).
pub(crate) struct MultiblockContext {
    /// Txo-id cut: inputs of sparse blocks must reference txos below this.
    pub id0: TxoId,
    /// Heights whose verification is in flight (merged but not yet settled).
    pub in_progress: HeightRange,
    /// Submitter of the last block taken in; candidate for the blame.
    pub pid_last: PeerId,

    msc: Arc<MultiShieldedContext>,
    mac: Arc<MultiAssetContext>,
    shared: Arc<MbcShared>,
}

impl MultiblockContext {
    pub fn new(np: &Processor) -> ChainResult<Self> {
        let h0 = np.sync_data.as_ref().map(|s| s.h0).unwrap_or(0);
        let id0 = np.get_txos_before(h0 + 1)?;

        let sigma0 = match &np.sync_data {
            Some(s) => s
                .sigma
                .decompress()
                .unwrap_or_else(RistrettoPoint::identity),
            None => RistrettoPoint::identity(),
        };

        let max = np.cursor.sid.height;
        Ok(MultiblockContext {
            id0,
            in_progress: HeightRange::new(max + 1, max),
            pid_last: PeerId::ZERO,
            msc: Arc::new(MultiShieldedContext::new()),
            mac: Arc::new(MultiAssetContext::new()),
            shared: Arc::new(MbcShared {
                rules: Arc::clone(&np.rules),
                fail: AtomicBool::new(false),
                batch_dirty: AtomicBool::new(false),
                batch_sum: Mutex::new(RistrettoPoint::identity()),
                sparse_acc: Mutex::new((Scalar::ZERO, sigma0)),
                size_pending: Mutex::new(0),
                size_cv: Condvar::new(),
            }),
        })
    }

    pub fn failed(&self) -> bool {
        self.shared.fail.load(Ordering::Acquire)
    }

    pub fn set_fail(&self) {
        self.shared.fail.store(true, Ordering::Release);
    }

    /// Take a block into the run: flush on peer change or at the TxoLo
    /// boundary, respect the pending-size gate, fan the verification out.
    pub fn on_block(
        &mut self,
        np: &mut Processor,
        pid: PeerId,
        body: Arc<Block>,
        height: mist_primitives::Height,
        size: usize,
    ) -> ChainResult<()> {
        debug_assert_eq!(height, np.cursor.sid.height + 1);

        if self.failed() {
            return Ok(());
        }

        let txo_lo = np.sync_data.as_ref().map(|s| s.txo_lo).unwrap_or(0);
        let must_flush = !self.in_progress.is_empty()
            && (self.pid_last != pid || self.in_progress.max == txo_lo);
        if must_flush && !self.flush(np)? {
            return Ok(());
        }

        self.pid_last = pid;

        // backpressure: cap the bytes being verified concurrently
        {
            let mut pending = self.shared.size_pending.lock();
            while *pending > SIZE_PENDING_MAX {
                self.shared.size_cv.wait(&mut pending);
            }
            *pending += size;
        }

        // already-validated blocks of a reorg replay bypass this context, so
        // track the applied height directly rather than counting
        self.in_progress.max = height;

        let target = np.sync_data.as_ref().map(|s| s.target.height).unwrap_or(0);
        let full = height > target;
        let sparse = np
            .sync_data
            .as_ref()
            .map(|s| height <= s.txo_lo)
            .unwrap_or(false);

        let n_verifiers = np.executor.threads();
        let params = TxContextParams {
            allow_unsigned_outputs: !full,
            n_verifiers,
        };

        let merged = TxContext::new(params.clone(), HeightRange::new(height, height));
        let shared_block = Arc::new(SharedBlock {
            body,
            sparse,
            size,
            n_verifiers,
            merged: Mutex::new((merged, true)),
            done: Mutex::new(0),
        });

        self.push_tasks(np, shared_block, params);
        Ok(())
    }

    fn push_tasks(&self, np: &Processor, blk: Arc<SharedBlock>, params: TxContextParams) {
        self.shared.batch_dirty.store(true, Ordering::Release);

        for i in 0..blk.n_verifiers {
            let blk = Arc::clone(&blk);
            let shared = Arc::clone(&self.shared);
            let msc = Arc::clone(&self.msc);
            let mac = Arc::clone(&self.mac);
            let params = params.clone();

            np.executor.push(Box::new(move || {
                let hr = blk.merged.lock().0.height;
                let mut ctx = TxContext::new(params, hr);
                ctx.verifier = i;

                let mut bc = BatchContext::new();
                let mut valid = ctx.validate_and_summarize(
                    &blk.body,
                    &mut bc,
                    mac.as_ref(),
                    &shared.rules,
                    Some(&shared.fail),
                );
                if valid {
                    valid = msc.is_valid(&blk.body.kernels, &mut bc, i, blk.n_verifiers);
                }

                *shared.batch_sum.lock() += bc.take_sum();

                {
                    let mut merged = blk.merged.lock();
                    if !valid {
                        merged.1 = false;
                    } else if merged.1 {
                        // fold the stripe into the block totals
                        let ok = merged.0.merge(&ctx);
                        merged.1 = ok;
                    }
                }

                let mut done = blk.done.lock();
                *done += 1;
                if *done == blk.n_verifiers {
                    // last stripe settles the block
                    {
                        let mut pending = shared.size_pending.lock();
                        *pending = pending.saturating_sub(blk.size);
                        shared.size_cv.notify_all();
                    }

                    let merged = blk.merged.lock();
                    let mut ok = merged.1;
                    if ok && !blk.sparse {
                        ok = merged.0.is_valid_block(&blk.body.offset, &shared.rules);
                    }
                    if ok && blk.sparse {
                        let mut acc = shared.sparse_acc.lock();
                        acc.0 += blk.body.offset;
                        acc.1 += merged.0.sigma;
                    }
                    if !ok {
                        shared.fail.store(true, Ordering::Release);
                    }
                }
            }));
        }
    }

    /// Drain the pool and settle everything merged so far: batch identity,
    /// sigma-chunk reductions, and (in fast-sync) the sparse arithmetic.
    pub fn flush(&mut self, np: &mut Processor) -> ChainResult<bool> {
        self.flush_internal(np)?;
        Ok(!self.failed())
    }

    fn flush_internal(&mut self, np: &mut Processor) -> ChainResult<()> {
        if self.failed() || self.in_progress.is_empty() {
            return Ok(());
        }

        np.executor.flush();
        if self.failed() {
            return Ok(());
        }

        if self.shared.batch_dirty.swap(false, Ordering::AcqRel) {
            let mut total = {
                let mut sum = self.shared.batch_sum.lock();
                std::mem::replace(&mut *sum, RistrettoPoint::identity())
            };

            {
                let db = &np.db;
                let executor = &np.executor;
                self.msc
                    .calculate(&mut total, executor, &mut |idx, count| {
                        db.shielded_read(idx, count)
                    })?;
                self.mac.calculate(&mut total, executor)?;
            }

            if total != RistrettoPoint::identity() {
                self.set_fail();
                return Ok(());
            }
        }

        if np.is_fast_sync() {
            let (offset, mut sigma) = {
                let mut acc = self.shared.sparse_acc.lock();
                let out = (acc.0, acc.1);
                acc.0 = Scalar::ZERO;
                out
            };

            if offset != Scalar::ZERO {
                // fold the accumulated base offsets into the sigma
                sigma -= offset * mist_primitives::generator_g();
            }

            let sync = np.sync_data.as_ref().expect("fast-sync checked");
            if self.in_progress.max == sync.txo_lo {
                // the sparse range must close as one aggregate block
                let params = TxContextParams {
                    allow_unsigned_outputs: true,
                    n_verifiers: 1,
                };
                let mut ctx =
                    TxContext::new(params, HeightRange::new(sync.h0 + 1, sync.txo_lo));
                ctx.sigma = sigma;

                if !ctx.is_valid_block(&Scalar::ZERO, &np.rules) {
                    self.set_fail();
                    self.on_fast_sync_failed_on_lo(np)?;
                    return Ok(());
                }
                sigma = RistrettoPoint::identity();
            }

            self.shared.sparse_acc.lock().1 = sigma;
            if let Some(s) = np.sync_data.as_mut() {
                s.sigma = EcPoint::from_point(&sigma);
            }
            np.save_sync_data()?;
        } else {
            debug_assert_eq!(self.shared.sparse_acc.lock().0, Scalar::ZERO);
        }

        self.in_progress.min = self.in_progress.max + 1;
        Ok(())
    }

    /// Recovery after a failed fast-sync attempt: rewind to `h0`, lower
    /// TxoLo for the next try, and drop the blame.
    pub fn on_fast_sync_failed(
        &mut self,
        np: &mut Processor,
        delete_blocks: bool,
    ) -> ChainResult<()> {
        let (h0, target) = {
            let s = np.sync_data.as_ref().expect("fast-sync active");
            (s.h0, s.target)
        };

        // rapid rollback
        np.rollback_to(h0)?;
        self.in_progress.max = np.cursor.sid.height;
        self.in_progress.min = self.in_progress.max + 1;

        if delete_blocks {
            np.delete_blocks_in_range(&target, h0)?;
        }

        {
            let mut acc = self.shared.sparse_acc.lock();
            acc.0 = Scalar::ZERO;
            acc.1 = RistrettoPoint::identity();
        }
        *self.shared.batch_sum.lock() = RistrettoPoint::identity();
        self.shared.batch_dirty.store(false, Ordering::Release);
        self.msc.sigma.clear();
        self.mac.sigma.clear();

        {
            let s = np.sync_data.as_mut().expect("fast-sync active");
            s.sigma = EcPoint::identity();
            if s.txo_lo > s.h0 {
                info!("Retrying with lower TxoLo");
                s.txo_lo = s.h0;
            } else {
                warn!("TxoLo already low");
            }
        }
        np.save_sync_data()?;

        // don't blame the last peer for the failure
        self.pid_last = PeerId::ZERO;
        Ok(())
    }

    /// The aggregate close at TxoLo did not hold; the culprit is somewhere
    /// in the sparse range, so nobody specific gets the blame.
    pub fn on_fast_sync_failed_on_lo(&mut self, np: &mut Processor) -> ChainResult<()> {
        warn!("Fast-sync failed on first above-TxoLo block");
        self.pid_last = PeerId::ZERO;
        self.set_fail();
        self.on_fast_sync_failed(np, true)
    }
}
