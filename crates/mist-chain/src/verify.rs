//! Parallel verification: the worker pool and the chunked multi-sigma
//! accumulator.
//!
//! Workers only ever see immutable block data and thread-safe accumulators;
//! all DB and tree mutations stay on the control thread. Cancellation is
//! cooperative through a shared flag owned by the sync controller.

use crate::error::ChainResult;
use mist_primitives::{walk_kernels, BatchContext, EcPoint, Kernel, KernelData, Scalar, SigmaAccumulator};
use curve25519_dalek::traits::Identity;
use curve25519_dalek::RistrettoPoint;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Pending {
    count: Mutex<usize>,
    cv: Condvar,
}

/// Fixed worker pool executing verification tasks.
pub struct Executor {
    sender: Option<crossbeam_channel::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    pending: Arc<Pending>,
    n_threads: u32,
}

impl Executor {
    pub fn new(n_threads: u32) -> Self {
        let n_threads = n_threads.max(1);
        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();
        let pending = Arc::new(Pending {
            count: Mutex::new(0),
            cv: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(n_threads as usize);
        for i in 0..n_threads {
            let rx = receiver.clone();
            let pending = Arc::clone(&pending);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("verify-{i}"))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                            let mut count = pending.count.lock();
                            *count -= 1;
                            if *count == 0 {
                                pending.cv.notify_all();
                            }
                        }
                    })
                    .expect("spawn verifier thread"),
            );
        }

        debug!(n_threads, "verification pool started");
        Executor {
            sender: Some(sender),
            workers,
            pending,
            n_threads,
        }
    }

    /// Pool size, used as the verifier stripe count.
    pub fn threads(&self) -> u32 {
        self.n_threads
    }

    /// Queue a task.
    pub fn push(&self, task: Task) {
        *self.pending.count.lock() += 1;
        self.sender
            .as_ref()
            .expect("executor alive")
            .send(task)
            .expect("worker pool alive");
    }

    /// Block until every queued task finished.
    pub fn flush(&self) {
        let mut count = self.pending.count.lock();
        while *count != 0 {
            self.pending.cv.wait(&mut count);
        }
    }

    /// Run `f(i)` once per worker slot and wait for all of them.
    pub fn exec_all(&self, f: Arc<dyn Fn(u32) + Send + Sync>) {
        for i in 0..self.n_threads {
            let f = Arc::clone(&f);
            self.push(Box::new(move || f(i)));
        }
        self.flush();
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.sender.take();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

/// Sigma chunk width.
pub const SIGMA_CHUNK: u64 = 1024;

struct Chunk {
    scalars: Vec<Scalar>,
    min: u32,
    max: u32,
}

impl Chunk {
    fn new() -> Self {
        Chunk {
            scalars: vec![Scalar::ZERO; SIGMA_CHUNK as usize],
            min: 0,
            max: 0,
        }
    }
}

/// Chunked scalar accumulator keyed by the window base.
///
/// Proof scalars from many blocks sum into 1024-wide chunks; `calculate`
/// reduces each chunk against its commitment list with the worker pool and
/// drains the set.
pub struct MultiSigmaContext {
    chunks: Mutex<BTreeMap<u64, Chunk>>,
}

impl MultiSigmaContext {
    pub fn new() -> Self {
        MultiSigmaContext {
            chunks: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn clear(&self) {
        self.chunks.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.lock().is_empty()
    }

    /// Reduce and drain all chunks. `prepare` materializes the commitment
    /// list for `[base + min, base + max)` on the control thread; the
    /// reduction itself fans out over the pool.
    pub fn calculate(
        &self,
        res: &mut RistrettoPoint,
        executor: &Executor,
        prepare: &mut dyn FnMut(u64, u32, u32) -> ChainResult<Vec<RistrettoPoint>>,
    ) -> ChainResult<()> {
        loop {
            let (base, chunk) = {
                let mut chunks = self.chunks.lock();
                match chunks.keys().next().copied() {
                    Some(k) => {
                        let c = chunks.remove(&k).expect("key just seen");
                        (k, c)
                    }
                    None => break,
                }
            };
            debug_assert!(chunk.min < chunk.max);

            let list = Arc::new(prepare(base, chunk.min, chunk.max)?);
            let scalars = Arc::new(chunk.scalars);
            let total = chunk.max - chunk.min;
            let n = executor.threads();
            let partials = Arc::new(Mutex::new(RistrettoPoint::identity()));

            let min = chunk.min;
            let list_for = Arc::clone(&list);
            let scalars_for = Arc::clone(&scalars);
            let partials_for = Arc::clone(&partials);
            executor.exec_all(Arc::new(move |i: u32| {
                let begin = min + i * total / n;
                let end = min + (i + 1) * total / n;
                let mut acc = RistrettoPoint::identity();
                for j in begin..end {
                    let s = &scalars_for[j as usize];
                    acc += s * list_for[(j - min) as usize];
                }
                *partials_for.lock() += acc;
            }));

            *res += *partials.lock();
        }
        Ok(())
    }
}

impl Default for MultiSigmaContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SigmaAccumulator for MultiSigmaContext {
    fn add(&self, id0: u64, scalars: &[Scalar]) {
        let mut offset = (id0 % SIGMA_CHUNK) as u32;
        let mut base = id0 - u64::from(offset);
        let mut rest = scalars;

        let mut chunks = self.chunks.lock();
        while !rest.is_empty() {
            let portion = rest
                .len()
                .min((SIGMA_CHUNK - u64::from(offset)) as usize);

            let is_new = !chunks.contains_key(&base);
            let chunk = chunks.entry(base).or_insert_with(Chunk::new);
            let hi = offset + portion as u32;
            if is_new {
                chunk.min = offset;
                chunk.max = hi;
            } else {
                chunk.min = chunk.min.min(offset);
                chunk.max = chunk.max.max(hi);
            }

            for (i, s) in rest[..portion].iter().enumerate() {
                chunk.scalars[offset as usize + i] += s;
            }

            rest = &rest[portion..];
            base += SIGMA_CHUNK;
            offset = 0;
        }
    }
}

/// Shielded spend-proof batch: collects window scalars across blocks, later
/// reduced against the stored pool commitments.
pub struct MultiShieldedContext {
    pub sigma: MultiSigmaContext,
}

impl MultiShieldedContext {
    pub fn new() -> Self {
        MultiShieldedContext {
            sigma: MultiSigmaContext::new(),
        }
    }

    /// Verify this stripe's shielded-input spend proofs of a kernel vector.
    /// The stripe rotates per shielded input so concurrent verifiers share
    /// the work without coordination.
    pub fn is_valid(
        &self,
        kernels: &[Kernel],
        bc: &mut BatchContext,
        i_verifier: u32,
        n_total: u32,
    ) -> bool {
        let mut turn = i_verifier;
        walk_kernels(kernels, &mut |krn| {
            if let KernelData::ShieldedInput { spend_proof, .. } = &krn.data {
                let mine = turn == 0;
                turn = (turn + 1) % n_total.max(1);
                if mine && !mist_primitives::verify_spend_proof(bc, &self.sigma, spend_proof) {
                    return false;
                }
            }
            true
        })
    }

    /// Reduce against the shielded pool; `read_pool(idx, count)` loads the
    /// stored commitment points.
    pub fn calculate(
        &self,
        res: &mut RistrettoPoint,
        executor: &Executor,
        read_pool: &mut dyn FnMut(u64, usize) -> ChainResult<Vec<EcPoint>>,
    ) -> ChainResult<()> {
        self.sigma.calculate(res, executor, &mut |base, min, max| {
            let raw = read_pool(base + u64::from(min), (max - min) as usize)?;
            Ok(raw
                .into_iter()
                .map(|p| p.decompress().unwrap_or_else(RistrettoPoint::identity))
                .collect())
        })
    }
}

impl Default for MultiShieldedContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SigmaAccumulator for MultiShieldedContext {
    fn add(&self, id0: u64, scalars: &[Scalar]) {
        self.sigma.add(id0, scalars);
    }
}

/// Asset surjection-proof batch; the commitment list is derived, not stored.
pub struct MultiAssetContext {
    pub sigma: MultiSigmaContext,
}

impl MultiAssetContext {
    pub fn new() -> Self {
        MultiAssetContext {
            sigma: MultiSigmaContext::new(),
        }
    }

    pub fn calculate(&self, res: &mut RistrettoPoint, executor: &Executor) -> ChainResult<()> {
        self.sigma.calculate(res, executor, &mut |base, min, max| {
            Ok((min..max)
                .map(|i| mist_primitives::asset_generator((base + u64::from(i)) as u32))
                .collect())
        })
    }
}

impl Default for MultiAssetContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SigmaAccumulator for MultiAssetContext {
    fn add(&self, id0: u64, scalars: &[Scalar]) {
        self.sigma.add(id0, scalars);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mist_primitives::commit;

    #[test]
    fn executor_runs_and_flushes() {
        let ex = Executor::new(4);
        let counter = Arc::new(Mutex::new(0u32));
        for _ in 0..100 {
            let c = Arc::clone(&counter);
            ex.push(Box::new(move || {
                *c.lock() += 1;
            }));
        }
        ex.flush();
        assert_eq!(*counter.lock(), 100);
    }

    #[test]
    fn exec_all_covers_every_slot() {
        let ex = Executor::new(3);
        let hits = Arc::new(Mutex::new(vec![false; 3]));
        let h = Arc::clone(&hits);
        ex.exec_all(Arc::new(move |i| {
            h.lock()[i as usize] = true;
        }));
        assert!(hits.lock().iter().all(|&b| b));
    }

    #[test]
    fn sigma_add_splits_across_chunk_boundary() {
        let ctx = MultiSigmaContext::new();
        let scalars: Vec<Scalar> = (0..10u64).map(Scalar::from).collect();
        // write straddling the boundary at 1024
        ctx.add(SIGMA_CHUNK - 4, &scalars);

        let chunks = ctx.chunks.lock();
        assert_eq!(chunks.len(), 2);
        let c0 = &chunks[&0u64];
        assert_eq!((c0.min, c0.max), (1020, 1024));
        let c1 = &chunks[&SIGMA_CHUNK];
        assert_eq!((c1.min, c1.max), (0, 6));
        assert_eq!(c1.scalars[0], Scalar::from(4u64));
    }

    #[test]
    fn sigma_reduction_matches_serial_sum() {
        let ex = Executor::new(4);
        let ctx = MultiSigmaContext::new();

        let points: Vec<RistrettoPoint> =
            (0..50u64).map(|i| commit(i, &Scalar::from(i + 3))).collect();
        let scalars: Vec<Scalar> = (0..50u64).map(|i| Scalar::from(i * 7 + 1)).collect();
        ctx.add(10, &scalars);

        let mut expected = RistrettoPoint::identity();
        for (s, p) in scalars.iter().zip(&points) {
            expected += s * p;
        }

        let mut res = RistrettoPoint::identity();
        ctx.calculate(&mut res, &ex, &mut |base, min, max| {
            // ids are 10..60 -> positions in `points`
            Ok((min..max)
                .map(|i| points[(base + u64::from(i) - 10) as usize])
                .collect())
        })
        .unwrap();

        assert_eq!(res, expected);
        assert!(ctx.is_empty());
    }
}
