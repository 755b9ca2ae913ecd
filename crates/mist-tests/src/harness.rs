//! Test harness: temp-dir nodes and a recording host.

use mist_chain::{
    BlockId, DataStatus, Horizon, NullHost, Processor, ProcessorHost, StartParams, StateId,
};
use mist_consensus::Rules;
use mist_primitives::{Block, BlockHeader, Height, PeerId};
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;

/// Everything the processor told the host, for assertions.
#[derive(Debug, Default)]
pub struct HostEvents {
    pub requests: Vec<(Height, bool)>,
    pub insane: Vec<PeerId>,
    pub new_state: usize,
    pub rolled_back: usize,
    pub fast_sync_over: usize,
    pub events: Vec<(Height, Vec<u8>)>,
}

/// Shared handle to the recorded host events.
#[derive(Debug, Clone, Default)]
pub struct HostLog(pub Arc<Mutex<HostEvents>>);

struct RecordingHost(HostLog);

impl ProcessorHost for RecordingHost {
    fn request_data(&mut self, id: &BlockId, is_block: bool, _target: &StateId) {
        self.0 .0.lock().requests.push((id.height, is_block));
    }

    fn on_peer_insane(&mut self, peer: &PeerId) {
        self.0 .0.lock().insane.push(*peer);
    }

    fn on_new_state(&mut self) {
        self.0 .0.lock().new_state += 1;
    }

    fn on_rolled_back(&mut self) {
        self.0 .0.lock().rolled_back += 1;
    }

    fn on_event(&mut self, height: Height, body: &[u8]) {
        self.0 .0.lock().events.push((height, body.to_vec()));
    }

    fn on_fast_sync_over(&mut self) {
        self.0 .0.lock().fast_sync_over += 1;
    }
}

/// A processor over a throwaway database.
pub struct TestNode {
    pub proc: Processor,
    pub log: HostLog,
    _tmp: TempDir,
}

impl TestNode {
    pub fn new(rules: Arc<Rules>) -> Self {
        Self::with_horizon(rules, Horizon::infinite())
    }

    pub fn with_horizon(rules: Arc<Rules>, horizon: Horizon) -> Self {
        let tmp = TempDir::new().expect("temp dir");
        let log = HostLog::default();
        let proc = Processor::open(
            tmp.path(),
            rules,
            horizon,
            Box::new(RecordingHost(log.clone())),
            &StartParams::default(),
        )
        .expect("open processor");
        TestNode {
            proc,
            log,
            _tmp: tmp,
        }
    }

    /// Reopen the same database (drops and reconstructs the processor).
    pub fn reopen(self, rules: Arc<Rules>, horizon: Horizon) -> Self {
        let TestNode { proc, log, _tmp } = self;
        drop(proc);
        let proc = Processor::open(
            _tmp.path(),
            rules,
            horizon,
            Box::new(RecordingHost(log.clone())),
            &StartParams::default(),
        )
        .expect("reopen processor");
        TestNode { proc, log, _tmp }
    }

    /// Feed a header; panic on storage errors.
    pub fn feed_header(&mut self, header: &BlockHeader, peer: &PeerId) -> DataStatus {
        self.proc.on_state(header, peer).expect("on_state")
    }

    /// Feed a block body.
    pub fn feed_block(&mut self, header: &BlockHeader, block: &Block, peer: &PeerId) -> DataStatus {
        self.proc
            .on_block(
                &header.id(),
                &block.perishable_bytes(),
                &block.eternal_bytes(),
                peer,
            )
            .expect("on_block")
    }

    /// Feed headers and bodies for a range of generated blocks, then sync.
    pub fn feed_chain(
        &mut self,
        headers: &[BlockHeader],
        blocks: &[Block],
        peer: &PeerId,
    ) {
        for h in headers {
            self.feed_header(h, peer);
        }
        for (h, b) in headers.iter().zip(blocks) {
            self.feed_block(h, b, peer);
        }
        self.proc.try_go_up().expect("try_go_up");
    }
}

/// A node that ignores host callbacks; for tools that only need state.
pub fn silent_node(rules: Arc<Rules>) -> (Processor, TempDir) {
    let tmp = TempDir::new().expect("temp dir");
    let proc = Processor::open(
        tmp.path(),
        rules,
        Horizon::infinite(),
        Box::new(NullHost),
        &StartParams::default(),
    )
    .expect("open processor");
    (proc, tmp)
}
