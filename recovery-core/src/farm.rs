//! RecoveryFarm - the sender recovery scheduler.
//!
//! One run walks three phases over a single store transaction:
//!
//! 1. **Canonical headers**: materialize the `(block, hash)` index for the
//!    whole range from the canonical-hashes table.
//! 2. **Body streaming**: walk body stubs in key order, skip non-canonical
//!    siblings, validate each block's transactions against the fork schedule
//!    and turn them into recovery packages, dispatching full batches to the
//!    worker pool as they fill.
//! 3. **Harvest and load**: drain finished workers, group recovered senders
//!    by block into the collector, then stream the sorted records into the
//!    senders table append-only.
//!
//! The main thread is the only one touching the store; workers only ever see
//! their own package buffer.

use crate::chain_spec::{ChainSpec, ForkRules};
use crate::etl::{Collector, EtlEntry};
use crate::settings::NodeSettings;
use crate::stage::StageError;
use crate::store::{
    BLOCK_BODIES, BLOCK_BODIES_PROGRESS_KEY, BLOCK_HASHES_PROGRESS_KEY, BLOCK_TRANSACTIONS,
    CANONICAL_HASHES, SENDERS, SENDERS_PROGRESS_KEY, StoreError, StoredBlockBody, block_key,
    read_stage_progress, split_block_key, write_stage_progress,
};
use crate::worker::{FarmSignals, RecoveryPackage, RecoveryWorker, WorkerState};
use alloy_consensus::{SignableTransaction, Transaction, TxEnvelope};
use alloy_eips::eip2718::Decodable2718;
use alloy_primitives::{Address, B256, BlockNumber, U256, hex};
use alloy_rlp::Decodable;
use redb::{ReadableTable, WriteTransaction};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// secp256k1 group order `n`.
const SECP256K1N: U256 = U256::from_limbs([
    0xbfd25e8cd0364141,
    0xbaaedce6af48a03b,
    0xfffffffffffffffe,
    0xffffffffffffffff,
]);

/// `n / 2`, the EIP-2 upper bound for `s`.
const SECP256K1N_HALF: U256 = U256::from_limbs([
    0xdfe92f46681b20a0,
    0x5d576e7357a4501d,
    0xffffffffffffffff,
    0x7fffffffffffffff,
]);

/// How many cursor steps between shutdown-flag checks.
const STOP_CHECK_INTERVAL: u64 = 1024;
/// How long a dispatch attempt waits for a worker completion before retrying.
const DISPATCH_WAIT: Duration = Duration::from_secs(5);
/// Poll interval while draining in-flight workers.
const COMPLETION_POLL: Duration = Duration::from_millis(10);

/// One canonical block of the run's range: its hash, and (once the body has
/// been streamed) its transaction count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderEntry {
    pub txn_count: u64,
    pub block_hash: B256,
}

/// Shared progress counters read by the periodic reporter while a run is in
/// flight. `phase` is 0 outside a run and 1..=3 inside.
#[derive(Debug, Default)]
pub struct FarmProgress {
    phase: AtomicU8,
    headers: AtomicU64,
    blocks: AtomicU64,
    transactions: AtomicU64,
    workers_in_flight: AtomicU64,
}

impl FarmProgress {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: self.phase.load(Ordering::Relaxed),
            headers: self.headers.load(Ordering::Relaxed),
            blocks: self.blocks.load(Ordering::Relaxed),
            transactions: self.transactions.load(Ordering::Relaxed),
            workers_in_flight: self.workers_in_flight.load(Ordering::Relaxed),
        }
    }

    fn enter_phase(&self, phase: u8) {
        self.phase.store(phase, Ordering::Relaxed);
    }
}

/// Point-in-time view of [`FarmProgress`].
#[derive(Debug, Clone, Copy)]
pub struct ProgressSnapshot {
    pub phase: u8,
    pub headers: u64,
    pub blocks: u64,
    pub transactions: u64,
    pub workers_in_flight: u64,
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.phase {
            1 => write!(f, "phase 1/3 headers {}", self.headers),
            2 => write!(
                f,
                "phase 2/3 blocks {}/{} transactions {} workers {}",
                self.blocks, self.headers, self.transactions, self.workers_in_flight
            ),
            3 => write!(f, "phase 3/3 transactions {}", self.transactions),
            _ => write!(f, "idle"),
        }
    }
}

/// The scheduler. Owns the worker pool, the pending batch, the collector and
/// the header index for one stage run.
pub struct RecoveryFarm<'db> {
    txn: &'db WriteTransaction,
    chain_spec: ChainSpec,
    stopping: Arc<AtomicBool>,
    progress: Arc<FarmProgress>,
    collector: Collector,
    headers: Vec<HeaderEntry>,
    header_index_offset: BlockNumber,
    batch: Vec<RecoveryPackage>,
    batch_size: usize,
    workers: Vec<RecoveryWorker>,
    max_workers: usize,
    allow_zero_senders: bool,
    signals: Arc<FarmSignals>,
}

impl<'db> RecoveryFarm<'db> {
    pub fn new(
        txn: &'db WriteTransaction,
        settings: &NodeSettings,
        stopping: Arc<AtomicBool>,
        progress: Arc<FarmProgress>,
    ) -> Result<Self, StageError> {
        let batch_size = settings.worker_batch_size();
        Ok(Self {
            txn,
            chain_spec: settings.chain.clone(),
            stopping,
            progress,
            collector: Collector::new(&settings.etl_dir, settings.etl_buffer_size)?,
            headers: Vec::new(),
            header_index_offset: 0,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            workers: Vec::new(),
            max_workers: settings.max_workers.max(1),
            allow_zero_senders: settings.allow_zero_senders,
            signals: FarmSignals::new(),
        })
    }

    /// Run the full recovery over `[previous_progress + 1, target]` and
    /// advance this stage's progress key. The transaction is left
    /// uncommitted; the driver commits on success.
    pub fn recover(&mut self) -> Result<(), StageError> {
        let previous_progress = read_stage_progress(self.txn, SENDERS_PROGRESS_KEY)?;
        let hashes_progress = read_stage_progress(self.txn, BLOCK_HASHES_PROGRESS_KEY)?;
        let bodies_progress = read_stage_progress(self.txn, BLOCK_BODIES_PROGRESS_KEY)?;
        let target_progress = hashes_progress.min(bodies_progress);

        if previous_progress == target_progress {
            debug!("[Farm] nothing to process at block {target_progress}");
            return Ok(());
        }
        if previous_progress > target_progress {
            return Err(StageError::InvalidProgress {
                previous: previous_progress,
                target: target_progress,
            });
        }

        let from = previous_progress + 1;
        let to = target_progress;
        info!(
            "[Farm] recovering senders for blocks {from}..={to} ({} rules at start)",
            self.chain_spec.revision(from)
        );

        self.progress.enter_phase(1);
        self.fill_canonical_headers(from, to)?;
        self.header_index_offset = from;

        self.progress.enter_phase(2);
        let reached_block_num = self.stream_bodies(from, to)?;

        if self.is_stopping() {
            return Err(StageError::Aborted);
        }
        if !self.batch.is_empty() {
            self.add_collected(self.batch.len());
            self.dispatch_batch()?;
        }
        self.wait_workers_completion();

        self.progress.enter_phase(3);
        self.collect_workers_results()?;
        self.check_worker_faults()?;

        if !self.collector.is_empty() {
            debug!(
                "[Farm] loading {} bytes of recovered senders",
                self.collector.bytes_size()
            );
            self.load_collector()?;
        }

        write_stage_progress(self.txn, SENDERS_PROGRESS_KEY, reached_block_num)?;
        info!("[Farm] senders progress advanced to block {reached_block_num}");
        Ok(())
    }

    /// Stop every worker; with `wait` the calling thread joins them all.
    pub fn stop_all_workers(&mut self, wait: bool) {
        for worker in &mut self.workers {
            debug!("[Farm] stopping recoverer {}", worker.id());
            worker.stop(wait);
        }
    }

    /// Phase 1: walk the canonical-hashes table over `[from, to]`, asserting
    /// one entry per height in strict sequence.
    fn fill_canonical_headers(&mut self, from: BlockNumber, to: BlockNumber) -> Result<(), StageError> {
        let table = self.txn.open_table(CANONICAL_HASHES)?;
        self.headers.reserve((to - from + 1) as usize);

        let mut expected_block_num = from;
        let mut reached_block_num = 0;
        for entry in table.range(from..)? {
            let (key, value) = entry?;
            reached_block_num = key.value();
            if reached_block_num != expected_block_num {
                return Err(StageError::BadChainSequence(format!(
                    "canonical hash gap: expected block {expected_block_num}, got {reached_block_num}"
                )));
            }
            self.headers.push(HeaderEntry {
                txn_count: 0,
                block_hash: B256::from(value.value()),
            });
            if reached_block_num == to {
                break;
            }
            expected_block_num += 1;
            if expected_block_num % STOP_CHECK_INTERVAL == 0 && self.is_stopping() {
                return Err(StageError::Aborted);
            }
        }

        if reached_block_num != to {
            return Err(StageError::BadChainSequence(format!(
                "canonical hashes end at block {reached_block_num}, expected {to}"
            )));
        }
        self.progress
            .headers
            .store(self.headers.len() as u64, Ordering::Relaxed);
        debug!("[Farm] collected {} canonical headers", self.headers.len());
        Ok(())
    }

    /// Phase 2: walk body stubs from `from` upward, matching each height
    /// against its canonical hash, and feed every canonical block's
    /// transactions into the batch. Returns the last canonical height
    /// processed.
    fn stream_bodies(&mut self, from: BlockNumber, to: BlockNumber) -> Result<BlockNumber, StageError> {
        let bodies = self.txn.open_table(BLOCK_BODIES)?;
        let transactions = self.txn.open_table(BLOCK_TRANSACTIONS)?;

        let mut expected_block_num = from;
        let mut reached_block_num = 0;
        let mut header_index = 0usize;
        let mut steps = 0u64;

        for entry in bodies.range((from, [0u8; 32])..)? {
            let (key, value) = entry?;
            let (block_num, key_hash) = key.value();

            steps += 1;
            if steps % STOP_CHECK_INTERVAL == 0 && self.is_stopping() {
                return Err(StageError::Aborted);
            }

            if block_num < expected_block_num {
                // Leftover sibling row of an already-processed height
                continue;
            }
            if block_num > expected_block_num {
                return Err(StageError::BadChainSequence(format!(
                    "expected body for block {expected_block_num}, got {block_num}"
                )));
            }
            if key_hash != self.headers[header_index].block_hash.0 {
                // Non-canonical sibling at the expected height
                continue;
            }

            reached_block_num = block_num;
            let raw = value.value();
            let body = StoredBlockBody::decode(&mut raw.as_slice()).map_err(|err| {
                StoreError::Corrupt(format!("undecodable body for block {block_num}: {err}"))
            })?;
            if body.txn_count > 0 {
                self.headers[header_index].txn_count = body.txn_count;
                let txs = read_transactions(&transactions, block_num, &body)?;
                self.transform_and_fill_batch(block_num, &txs)?;
            }
            self.progress.blocks.fetch_add(1, Ordering::Relaxed);

            header_index += 1;
            if header_index == self.headers.len() {
                break;
            }
            expected_block_num += 1;
        }

        Ok(reached_block_num)
    }

    /// Validate one block's transactions against the fork schedule and push
    /// their recovery packages, dispatching if the batch overflows.
    fn transform_and_fill_batch(
        &mut self,
        block_num: BlockNumber,
        txs: &[TxEnvelope],
    ) -> Result<(), StageError> {
        if self.is_stopping() {
            return Err(StageError::Aborted);
        }

        let rules = self.chain_spec.rules_at(block_num);
        for (tx_index, envelope) in txs.iter().enumerate() {
            self.batch
                .push(prepare_package(&self.chain_spec, &rules, block_num, tx_index, envelope)?);
        }

        if self.batch.len() > self.batch_size {
            self.add_collected(self.batch.len());
            self.dispatch_batch()?;
        }

        if self.is_stopping() {
            return Err(StageError::Aborted);
        }
        Ok(())
    }

    /// Hand the pending batch to a free worker, harvesting finished results
    /// first so the pool drains as fast as it fills. Spawns workers up to
    /// the cap; waits on the completion signal when the pool is saturated.
    fn dispatch_batch(&mut self) -> Result<(), StageError> {
        let mut wait_rounds = 0u32;
        loop {
            if self.is_stopping() {
                return Err(StageError::Aborted);
            }
            self.collect_workers_results()?;
            self.check_worker_faults()?;

            if let Some(index) = self
                .workers
                .iter()
                .position(|worker| worker.state() == WorkerState::KickWaiting)
            {
                let worker = &self.workers[index];
                debug!(
                    "[Farm] dispatching {} packages to recoverer {}",
                    self.batch.len(),
                    worker.id()
                );
                worker.set_work(&mut self.batch, true);
                self.signals.dispatched();
                self.progress
                    .workers_in_flight
                    .store(self.signals.in_flight() as u64, Ordering::Relaxed);
                // The swap normally hands back a drained buffer, but the
                // worker may have completed between the harvest above and
                // the dispatch; results it handed over must not be lost
                let mut returned = std::mem::take(&mut self.batch);
                if !returned.is_empty() {
                    self.group_into_collector(&returned)?;
                    returned.clear();
                }
                self.batch = returned;
                return Ok(());
            }

            if self.workers.len() < self.max_workers {
                match RecoveryWorker::spawn(
                    self.workers.len(),
                    Arc::clone(&self.signals),
                    self.allow_zero_senders,
                ) {
                    Ok(worker) => {
                        debug!("[Farm] spawned recoverer {}", worker.id());
                        self.workers.push(worker);
                        continue;
                    }
                    Err(err) => {
                        if self.workers.is_empty() {
                            return Err(StageError::Unexpected(format!(
                                "unable to spawn any recovery worker: {err}"
                            )));
                        }
                        warn!(
                            "[Farm] worker spawn failed ({err}); capping pool at {}",
                            self.workers.len()
                        );
                        self.max_workers = self.workers.len();
                    }
                }
            }

            wait_rounds += 1;
            if wait_rounds % 5 == 0 {
                info!("[Farm] waiting for an available worker ...");
            }
            self.signals.wait_for_completion(DISPATCH_WAIT);
        }
    }

    /// Block until every dispatched batch has been signalled complete.
    fn wait_workers_completion(&self) {
        while self.signals.in_flight() > 0 {
            std::thread::sleep(COMPLETION_POLL);
        }
        self.progress.workers_in_flight.store(0, Ordering::Relaxed);
    }

    /// Drain every harvestable worker, grouping its recovered packages by
    /// block into one collector record per block.
    fn collect_workers_results(&mut self) -> Result<(), StageError> {
        let mut harvest = Vec::new();
        while let Some(worker_id) = self.signals.pop_harvestable() {
            debug!("[Farm] collecting results from recoverer {worker_id}");
            self.workers[worker_id].set_work(&mut harvest, false);
            self.group_into_collector(&harvest)?;
            harvest.clear();
        }
        self.progress
            .workers_in_flight
            .store(self.signals.in_flight() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Group a recovered batch by block number and emit one collector record
    /// per block.
    fn group_into_collector(&mut self, packages: &[RecoveryPackage]) -> Result<(), StageError> {
        let mut group_block: Option<BlockNumber> = None;
        let mut group_value: Vec<u8> = Vec::new();
        for package in packages {
            if group_block != Some(package.block_num) {
                if let Some(block_num) = group_block.take() {
                    self.collect_block(block_num, std::mem::take(&mut group_value))?;
                }
                group_block = Some(package.block_num);
            }
            group_value.extend_from_slice(package.sender.as_slice());
        }
        if let Some(block_num) = group_block {
            self.collect_block(block_num, group_value)?;
        }
        Ok(())
    }

    /// Phase 3 tail: stream the sorted collector records into the senders
    /// table in strictly ascending key order.
    fn load_collector(&mut self) -> Result<(), StageError> {
        let mut senders = self.txn.open_table(SENDERS)?;
        let mut previous_key: Option<Vec<u8>> = None;
        let mut loaded = 0u64;

        for record in self.collector.load()? {
            let record = record?;
            if previous_key.as_deref().is_some_and(|prev| prev >= record.key.as_slice()) {
                return Err(StageError::Unexpected(
                    "collector produced out-of-order keys".to_string(),
                ));
            }
            let (block_num, block_hash) = split_block_key(&record.key).ok_or_else(|| {
                StageError::Unexpected("collector produced a malformed block key".to_string())
            })?;
            senders.insert((block_num, block_hash.0), record.value)?;

            loaded += 1;
            if loaded % 65_536 == 0 {
                debug!("[Farm] load key {}", hex::encode(&record.key));
            }
            previous_key = Some(record.key);
        }
        debug!("[Farm] loaded {loaded} sender rows");
        Ok(())
    }

    fn collect_block(&mut self, block_num: BlockNumber, senders: Vec<u8>) -> Result<(), StageError> {
        let index = (block_num - self.header_index_offset) as usize;
        let header = self.headers.get(index).ok_or_else(|| {
            StageError::Unexpected(format!("recovered block {block_num} outside header index"))
        })?;
        if senders.len() as u64 != header.txn_count * 20 {
            return Err(StageError::Unexpected(format!(
                "block {block_num} recovered {} senders, body has {} transactions",
                senders.len() / 20,
                header.txn_count
            )));
        }
        self.collector.collect(EtlEntry {
            key: block_key(block_num, &header.block_hash).to_vec(),
            value: senders,
        })?;
        Ok(())
    }

    fn check_worker_faults(&self) -> Result<(), StageError> {
        if !self.signals.is_faulted() {
            return Ok(());
        }
        let reason = self
            .workers
            .iter()
            .find_map(|worker| worker.failure())
            .unwrap_or_else(|| "recovery worker died".to_string());
        Err(StageError::Unexpected(reason))
    }

    fn add_collected(&self, count: usize) {
        self.progress
            .transactions
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }
}

impl Drop for RecoveryFarm<'_> {
    fn drop(&mut self) {
        self.stop_all_workers(true);
    }
}

/// Read a body's transaction range `[base_txn_id, base_txn_id + txn_count)`
/// and decode each payload.
fn read_transactions(
    table: &impl ReadableTable<u64, Vec<u8>>,
    block_num: BlockNumber,
    body: &StoredBlockBody,
) -> Result<Vec<TxEnvelope>, StageError> {
    let mut txs = Vec::with_capacity(body.txn_count as usize);
    for txn_id in body.base_txn_id..body.base_txn_id + body.txn_count {
        let raw = table.get(txn_id)?.ok_or_else(|| {
            StageError::BadChainSequence(format!(
                "missing transaction {txn_id} of block {block_num}"
            ))
        })?;
        let envelope = TxEnvelope::decode_2718_exact(raw.value().as_slice()).map_err(|err| {
            StoreError::Corrupt(format!(
                "undecodable transaction {txn_id} of block {block_num}: {err}"
            ))
        })?;
        txs.push(envelope);
    }
    Ok(txs)
}

/// Validate one transaction under the block's fork rules and flatten it into
/// a recovery package.
fn prepare_package(
    chain_spec: &ChainSpec,
    rules: &ForkRules,
    block_num: BlockNumber,
    tx_index: usize,
    envelope: &TxEnvelope,
) -> Result<RecoveryPackage, StageError> {
    let invalid = |reason: &str| {
        StageError::InvalidTransaction(format!(
            "transaction #{tx_index} in block #{block_num}: {reason}"
        ))
    };

    let (signature, signing_hash) = match envelope {
        TxEnvelope::Legacy(signed) => (signed.signature(), signed.tx().signature_hash()),
        TxEnvelope::Eip2930(signed) => {
            if !rules.berlin {
                return Err(invalid("access-list transaction before Berlin"));
            }
            (signed.signature(), signed.tx().signature_hash())
        }
        TxEnvelope::Eip1559(signed) => {
            if !rules.london {
                return Err(invalid("dynamic-fee transaction before London"));
            }
            (signed.signature(), signed.tx().signature_hash())
        }
        TxEnvelope::Eip4844(signed) => {
            if !rules.cancun {
                return Err(invalid("blob transaction before Cancun"));
            }
            (signed.signature(), signed.tx().signature_hash())
        }
        TxEnvelope::Eip7702(signed) => {
            if !rules.prague {
                return Err(invalid("set-code transaction before Prague"));
            }
            (signed.signature(), signed.tx().signature_hash())
        }
    };

    let r = signature.r();
    let s = signature.s();
    if r.is_zero() || s.is_zero() || r >= SECP256K1N || s >= SECP256K1N {
        return Err(invalid("signature scalars outside the secp256k1 group"));
    }
    if rules.homestead && s > SECP256K1N_HALF {
        return Err(invalid("upper-half s after Homestead"));
    }

    if let Some(chain_id) = envelope.chain_id() {
        if !rules.spurious_dragon {
            return Err(invalid("replay-protected signature before Spurious Dragon"));
        }
        if chain_id != chain_spec.chain_id {
            return Err(invalid("chain id does not match the configured chain"));
        }
    }

    let mut scalars = [0u8; 64];
    scalars[..32].copy_from_slice(&r.to_be_bytes::<32>());
    scalars[32..].copy_from_slice(&s.to_be_bytes::<32>());
    Ok(RecoveryPackage {
        block_num,
        signing_hash,
        signature: scalars,
        odd_y_parity: signature.v(),
        sender: Address::ZERO,
    })
}
