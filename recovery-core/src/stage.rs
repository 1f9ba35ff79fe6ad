//! StageDriver - the orchestrator-facing surface of sender recovery.
//!
//! Each entry point opens one read-write store transaction, runs the
//! operation, and commits only on full success; any failure rolls the
//! transaction back, so a failed run leaves the store untouched. Domain
//! errors are translated into [`StageResult`] codes for the caller.

use crate::etl::EtlError;
use crate::farm::{FarmProgress, RecoveryFarm};
use crate::settings::NodeSettings;
use crate::store::{
    ChainStore, SENDERS, SENDERS_PROGRESS_KEY, StoreError, read_stage_progress,
    write_stage_progress,
};
use alloy_primitives::BlockNumber;
use redb::{ReadableTable, WriteTransaction};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{debug, error, info};

/// Outcome of one stage operation, mapped 1:1 onto process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    /// Operation completed and committed
    Success,
    /// Cooperative cancellation observed; nothing committed
    Aborted,
    /// Previous progress beyond the upstream target
    InvalidProgress,
    /// Missing block or header/body mismatch
    BadChainSequence,
    /// Fork-rule or signature-scalar violation
    InvalidTransaction,
    /// The store raised an I/O or corruption error
    DbError,
    /// Any other failure, including worker faults
    UnexpectedError,
}

impl StageResult {
    pub fn is_success(self) -> bool {
        matches!(self, StageResult::Success)
    }

    pub fn exit_code(self) -> i32 {
        match self {
            StageResult::Success => 0,
            StageResult::Aborted => 1,
            StageResult::InvalidProgress => 2,
            StageResult::BadChainSequence => 3,
            StageResult::InvalidTransaction => 4,
            StageResult::DbError => 5,
            StageResult::UnexpectedError => 6,
        }
    }
}

impl std::fmt::Display for StageResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StageResult::Success => "success",
            StageResult::Aborted => "aborted",
            StageResult::InvalidProgress => "invalid progress",
            StageResult::BadChainSequence => "bad chain sequence",
            StageResult::InvalidTransaction => "invalid transaction",
            StageResult::DbError => "database error",
            StageResult::UnexpectedError => "unexpected error",
        };
        f.write_str(name)
    }
}

/// Failures raised while a stage operation runs.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("aborted on shutdown signal")]
    Aborted,
    #[error("previous progress {previous} beyond target {target}")]
    InvalidProgress { previous: u64, target: u64 },
    #[error("bad chain sequence: {0}")]
    BadChainSequence(String),
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("collector failure: {0}")]
    Etl(#[from] EtlError),
    #[error("{0}")]
    Unexpected(String),
}

impl StageError {
    /// The result code this failure maps to.
    pub fn result(&self) -> StageResult {
        match self {
            StageError::Aborted => StageResult::Aborted,
            StageError::InvalidProgress { .. } => StageResult::InvalidProgress,
            StageError::BadChainSequence(_) => StageResult::BadChainSequence,
            StageError::InvalidTransaction(_) => StageResult::InvalidTransaction,
            StageError::Store(_) => StageResult::DbError,
            StageError::Etl(_) | StageError::Unexpected(_) => StageResult::UnexpectedError,
        }
    }
}

impl From<redb::TransactionError> for StageError {
    fn from(err: redb::TransactionError) -> Self {
        StageError::Store(err.into())
    }
}

impl From<redb::TableError> for StageError {
    fn from(err: redb::TableError) -> Self {
        StageError::Store(err.into())
    }
}

impl From<redb::StorageError> for StageError {
    fn from(err: redb::StorageError) -> Self {
        StageError::Store(err.into())
    }
}

impl From<redb::CommitError> for StageError {
    fn from(err: redb::CommitError) -> Self {
        StageError::Store(err.into())
    }
}

/// Top-level driver exposing `recover`, `unwind` and `prune` to the stage
/// orchestrator and the CLI.
pub struct StageDriver {
    store: Arc<ChainStore>,
    settings: NodeSettings,
    stopping: Arc<AtomicBool>,
    progress: Arc<FarmProgress>,
}

impl StageDriver {
    pub fn new(store: Arc<ChainStore>, settings: NodeSettings) -> Self {
        Self {
            store,
            settings,
            stopping: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(FarmProgress::default()),
        }
    }

    /// Flag observed at the farm's cancellation points; setting it makes the
    /// running operation return [`StageResult::Aborted`] without committing.
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stopping)
    }

    /// Live progress counters for a reporter task.
    pub fn progress(&self) -> Arc<FarmProgress> {
        Arc::clone(&self.progress)
    }

    /// Recover senders for every block the upstream stages have made
    /// available and advance this stage's progress.
    pub fn recover(&self) -> StageResult {
        self.execute("recover", |txn| {
            let mut farm = RecoveryFarm::new(
                txn,
                &self.settings,
                Arc::clone(&self.stopping),
                Arc::clone(&self.progress),
            )?;
            let outcome = farm.recover();
            farm.stop_all_workers(true);
            outcome
        })
    }

    /// Roll the senders table back to `unwind_to` and reset this stage's
    /// progress. A target at or beyond the current progress is a no-op.
    pub fn unwind(&self, unwind_to: BlockNumber) -> StageResult {
        self.execute("unwind", |txn| {
            let current = read_stage_progress(txn, SENDERS_PROGRESS_KEY)?;
            if unwind_to >= current {
                debug!("[SendersStage] unwind to {unwind_to} at progress {current} is a no-op");
                return Ok(());
            }

            let mut removed = 0u64;
            {
                let mut senders = txn.open_table(SENDERS)?;
                let keys: Vec<(u64, [u8; 32])> = senders
                    .range((unwind_to + 1, [0u8; 32])..)?
                    .map(|entry| entry.map(|(key, _)| key.value()))
                    .collect::<Result<_, _>>()?;
                for key in keys {
                    senders.remove(key)?;
                    removed += 1;
                }
            }

            write_stage_progress(txn, SENDERS_PROGRESS_KEY, unwind_to)?;
            info!("[SendersStage] unwound {removed} sender rows to block {unwind_to}");
            Ok(())
        })
    }

    /// Trim sender history below `prune_from`. Progress is not altered.
    pub fn prune(&self, prune_from: BlockNumber) -> StageResult {
        self.execute("prune", |txn| {
            let mut removed = 0u64;
            {
                let mut senders = txn.open_table(SENDERS)?;
                let keys: Vec<(u64, [u8; 32])> = senders
                    .range(..(prune_from, [0u8; 32]))?
                    .map(|entry| entry.map(|(key, _)| key.value()))
                    .collect::<Result<_, _>>()?;
                for key in keys {
                    senders.remove(key)?;
                    removed += 1;
                }
            }
            info!("[SendersStage] pruned {removed} sender rows below block {prune_from}");
            Ok(())
        })
    }

    /// Open the stage transaction, run `body`, and commit on success. On
    /// failure the transaction is dropped unfinished, rolling everything
    /// back.
    fn execute(
        &self,
        operation: &str,
        body: impl FnOnce(&WriteTransaction) -> Result<(), StageError>,
    ) -> StageResult {
        let txn = match self.store.begin_rw() {
            Ok(txn) => txn,
            Err(err) => {
                error!("[SendersStage] {operation}: {err}");
                return StageResult::DbError;
            }
        };

        match body(&txn) {
            Ok(()) => match txn.commit() {
                Ok(()) => StageResult::Success,
                Err(err) => {
                    error!("[SendersStage] {operation}: commit: {err}");
                    StageResult::DbError
                }
            },
            Err(err) => {
                error!("[SendersStage] {operation}: {err}");
                err.result()
            }
        }
    }
}
