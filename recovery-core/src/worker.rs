//! Recovery workers: long-lived threads turning signature packages into
//! sender addresses.
//!
//! Each worker owns a private package buffer exchanged with the farm by an
//! O(1) swap. Dispatch and result retrieval are the same operation
//! ([`RecoveryWorker::set_work`]) with and without a kick.

use alloy_primitives::{Address, B256, BlockNumber, Signature, U256};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Recovery inputs of one transaction. `sender` is meaningless on dispatch
/// and authoritative once the worker hands the buffer back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPackage {
    /// Height of the block carrying the transaction
    pub block_num: BlockNumber,
    /// Keccak-256 of the transaction's signing form
    pub signing_hash: B256,
    /// Big-endian `r ‖ s` signature scalars
    pub signature: [u8; 64],
    /// Recovery parity bit
    pub odd_y_parity: bool,
    /// Recovered sender, filled in by the worker
    pub sender: Address,
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Thread not yet running
    Idle,
    /// Ready for a kick; any finished results are in the buffer
    KickWaiting,
    /// Processing its buffer
    Working,
    /// Termination requested
    Stopping,
    /// Thread exited
    Stopped,
}

/// Completion mailbox shared between the farm and its workers.
///
/// `harvestable` queues the ids of workers whose results are ready;
/// `in_flight` counts dispatched batches not yet harvested. The condvar is
/// the farm's wake-up for both completions and worker deaths.
pub(crate) struct FarmSignals {
    queue: Mutex<SignalState>,
    completed_cv: Condvar,
}

#[derive(Default)]
struct SignalState {
    harvestable: VecDeque<usize>,
    in_flight: usize,
    faulted: bool,
}

impl FarmSignals {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(SignalState::default()),
            completed_cv: Condvar::new(),
        })
    }

    pub(crate) fn dispatched(&self) {
        self.queue.lock().unwrap().in_flight += 1;
    }

    pub(crate) fn pop_harvestable(&self) -> Option<usize> {
        self.queue.lock().unwrap().harvestable.pop_front()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.queue.lock().unwrap().in_flight
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.queue.lock().unwrap().faulted
    }

    /// Block until a completion signal arrives or the timeout elapses.
    pub(crate) fn wait_for_completion(&self, timeout: Duration) {
        let guard = self.queue.lock().unwrap();
        let _ = self.completed_cv.wait_timeout(guard, timeout).unwrap();
    }

    fn task_completed(&self, worker_id: usize) {
        let mut state = self.queue.lock().unwrap();
        state.harvestable.push_back(worker_id);
        state.in_flight = state.in_flight.saturating_sub(1);
        self.completed_cv.notify_all();
    }

    fn worker_stopped(&self, faulted: bool) {
        let mut state = self.queue.lock().unwrap();
        if faulted {
            state.faulted = true;
            // The batch died with the worker and will never be harvested
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.completed_cv.notify_all();
    }
}

struct WorkerShared {
    slot: Mutex<WorkerSlot>,
    task_cv: Condvar,
    signals: Arc<FarmSignals>,
    allow_zero_senders: bool,
}

struct WorkerSlot {
    state: WorkerState,
    batch: Vec<RecoveryPackage>,
    failure: Option<String>,
}

/// A long-lived recovery thread.
pub struct RecoveryWorker {
    id: usize,
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl RecoveryWorker {
    /// Spawn a worker and wait until its thread is ready for work.
    pub(crate) fn spawn(
        id: usize,
        signals: Arc<FarmSignals>,
        allow_zero_senders: bool,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(WorkerShared {
            slot: Mutex::new(WorkerSlot {
                state: WorkerState::Idle,
                batch: Vec::new(),
                failure: None,
            }),
            task_cv: Condvar::new(),
            signals,
            allow_zero_senders,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(format!("sender-recovery-{id}"))
            .spawn(move || run(id, &thread_shared))?;

        let mut slot = shared.slot.lock().unwrap();
        while matches!(slot.state, WorkerState::Idle) {
            slot = shared.task_cv.wait(slot).unwrap();
        }
        drop(slot);

        Ok(Self {
            id,
            shared,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.slot.lock().unwrap().state
    }

    /// Why the worker died, if it faulted.
    pub fn failure(&self) -> Option<String> {
        self.shared.slot.lock().unwrap().failure.clone()
    }

    /// Swap buffers with the worker. With `kick` the worker starts
    /// processing the new buffer; without, the call retrieves finished
    /// results while handing over an empty buffer.
    pub(crate) fn set_work(&self, batch: &mut Vec<RecoveryPackage>, kick: bool) {
        let mut slot = self.shared.slot.lock().unwrap();
        std::mem::swap(&mut slot.batch, batch);
        if kick {
            slot.state = WorkerState::Working;
            self.shared.task_cv.notify_all();
        }
    }

    /// Request termination; with `wait` the calling thread joins the worker.
    pub fn stop(&mut self, wait: bool) {
        {
            let mut slot = self.shared.slot.lock().unwrap();
            if !matches!(slot.state, WorkerState::Stopped) {
                slot.state = WorkerState::Stopping;
            }
        }
        self.shared.task_cv.notify_all();
        if wait {
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for RecoveryWorker {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn run(id: usize, shared: &WorkerShared) {
    {
        let mut slot = shared.slot.lock().unwrap();
        slot.state = WorkerState::KickWaiting;
        shared.task_cv.notify_all();
    }
    debug!("[Worker {id}] started");

    loop {
        let mut batch = {
            let mut slot = shared.slot.lock().unwrap();
            while !matches!(slot.state, WorkerState::Working | WorkerState::Stopping) {
                slot = shared.task_cv.wait(slot).unwrap();
            }
            if matches!(slot.state, WorkerState::Stopping) {
                slot.state = WorkerState::Stopped;
                drop(slot);
                debug!("[Worker {id}] stopped");
                shared.signals.worker_stopped(false);
                return;
            }
            std::mem::take(&mut slot.batch)
        };

        let mut fault: Option<String> = None;
        for package in batch.iter_mut() {
            match recover_sender(package) {
                Ok(sender) => package.sender = sender,
                Err(err) if shared.allow_zero_senders => {
                    warn!(
                        "[Worker {id}] unrecoverable signature in block {}: {err}; writing zero sender",
                        package.block_num
                    );
                    package.sender = Address::ZERO;
                }
                Err(err) => {
                    fault = Some(format!(
                        "unrecoverable signature in block {}: {err}",
                        package.block_num
                    ));
                    break;
                }
            }
        }

        let mut slot = shared.slot.lock().unwrap();
        slot.batch = batch;
        match fault {
            Some(message) => {
                warn!("[Worker {id}] faulted: {message}");
                slot.state = WorkerState::Stopped;
                slot.failure = Some(message);
                drop(slot);
                shared.signals.worker_stopped(true);
                return;
            }
            None => {
                let stopping = matches!(slot.state, WorkerState::Stopping);
                slot.state = if stopping {
                    WorkerState::Stopped
                } else {
                    WorkerState::KickWaiting
                };
                drop(slot);
                shared.signals.task_completed(id);
                if stopping {
                    debug!("[Worker {id}] stopped");
                    shared.signals.worker_stopped(false);
                    return;
                }
            }
        }
    }
}

/// Recover the sender address of one package: secp256k1 public-key recovery
/// from the prehash followed by Keccak address derivation.
fn recover_sender(package: &RecoveryPackage) -> Result<Address, alloy_primitives::SignatureError> {
    let r = U256::from_be_slice(&package.signature[..32]);
    let s = U256::from_be_slice(&package.signature[32..]);
    Signature::new(r, s, package.odd_y_parity).recover_address_from_prehash(&package.signing_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn signed_package(signer: &PrivateKeySigner, block_num: BlockNumber) -> RecoveryPackage {
        let signing_hash = B256::repeat_byte(0x42);
        let signature = signer.sign_hash_sync(&signing_hash).unwrap();
        let mut scalars = [0u8; 64];
        scalars[..32].copy_from_slice(&signature.r().to_be_bytes::<32>());
        scalars[32..].copy_from_slice(&signature.s().to_be_bytes::<32>());
        RecoveryPackage {
            block_num,
            signing_hash,
            signature: scalars,
            odd_y_parity: signature.v(),
            sender: Address::ZERO,
        }
    }

    fn broken_package(block_num: BlockNumber) -> RecoveryPackage {
        // A zero s scalar can never have produced a signature
        RecoveryPackage {
            block_num,
            signing_hash: B256::repeat_byte(0x42),
            signature: [0u8; 64],
            odd_y_parity: false,
            sender: Address::ZERO,
        }
    }

    fn wait_harvestable(signals: &FarmSignals) -> Option<usize> {
        for _ in 0..500 {
            if let Some(id) = signals.pop_harvestable() {
                return Some(id);
            }
            thread::sleep(Duration::from_millis(2));
        }
        None
    }

    #[test]
    fn worker_recovers_signed_packages() {
        let signer = PrivateKeySigner::random();
        let signals = FarmSignals::new();
        let mut worker = RecoveryWorker::spawn(0, Arc::clone(&signals), false).unwrap();
        assert_eq!(worker.state(), WorkerState::KickWaiting);

        let mut batch = vec![signed_package(&signer, 1), signed_package(&signer, 2)];
        worker.set_work(&mut batch, true);
        signals.dispatched();
        assert!(batch.is_empty());

        assert_eq!(wait_harvestable(&signals), Some(0));
        assert_eq!(signals.in_flight(), 0);
        worker.set_work(&mut batch, false);
        assert_eq!(batch.len(), 2);
        for package in &batch {
            assert_eq!(package.sender, signer.address());
        }

        worker.stop(true);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[test]
    fn unrecoverable_package_faults_worker() {
        let signals = FarmSignals::new();
        let mut worker = RecoveryWorker::spawn(3, Arc::clone(&signals), false).unwrap();

        let mut batch = vec![broken_package(7)];
        worker.set_work(&mut batch, true);
        signals.dispatched();

        for _ in 0..500 {
            if signals.is_faulted() {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert!(signals.is_faulted());
        assert_eq!(signals.in_flight(), 0);
        worker.stop(true);
        assert_eq!(worker.state(), WorkerState::Stopped);
        assert!(worker.failure().unwrap().contains("block 7"));
    }

    #[test]
    fn zero_sender_policy_continues_past_failures() {
        let signer = PrivateKeySigner::random();
        let signals = FarmSignals::new();
        let mut worker = RecoveryWorker::spawn(1, Arc::clone(&signals), true).unwrap();

        let mut batch = vec![broken_package(5), signed_package(&signer, 5)];
        worker.set_work(&mut batch, true);
        signals.dispatched();

        assert_eq!(wait_harvestable(&signals), Some(1));
        worker.set_work(&mut batch, false);
        assert_eq!(batch[0].sender, Address::ZERO);
        assert_eq!(batch[1].sender, signer.address());
        worker.stop(true);
    }
}
