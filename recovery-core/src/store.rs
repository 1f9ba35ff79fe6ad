//! ChainStore - the chain database consumed and produced by the recovery stage
//!
//! This module implements the redb-backed store the stage runs against. It
//! holds the upstream tables filled by earlier pipeline stages (canonical
//! hashes, block bodies, transactions), the senders table this stage produces,
//! and the per-stage progress watermarks.
//!
//! ## Database Schema
//!
//! - `CANONICAL_HASHES`: canonical chain index (BlockNumber → BlockHash)
//! - `BLOCK_BODIES`: body stubs keyed by (BlockNumber, BlockHash), value is
//!   the RLP of [`StoredBlockBody`]
//! - `BLOCK_TRANSACTIONS`: EIP-2718 transaction payloads keyed by a global
//!   transaction id; each body addresses `txn_count` consecutive ids starting
//!   at `base_txn_id`
//! - `SENDERS`: recovered sender addresses keyed by (BlockNumber, BlockHash),
//!   value is the concatenation of 20-byte addresses in transaction order
//! - `STAGE_PROGRESS`: stage name → highest block durably processed
//!
//! Block-keyed tables use `(u64, [u8; 32])` tuple keys. Tuple ordering equals
//! the lexicographic order of the big-endian `block_key` encoding, so range
//! scans walk blocks in ascending height and the senders table can be
//! populated append-only.

use alloy_primitives::{B256, BlockNumber};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use std::path::Path;
use thiserror::Error;

/// Canonical chain index maintained by the block-hashes stage.
///
/// **Schema:** BlockNumber (u64) → BlockHash ([u8; 32])
///
/// Exactly one entry exists per canonical height. Read-only for this stage.
pub const CANONICAL_HASHES: TableDefinition<u64, [u8; 32]> =
    TableDefinition::new("canonical_hashes");

/// Block body stubs maintained by the block-bodies stage.
///
/// **Schema:** (BlockNumber, BlockHash) → RLP of [`StoredBlockBody`]
///
/// A height may carry several rows (canonical block plus siblings received
/// during sync); only the row whose hash matches [`CANONICAL_HASHES`] is
/// canonical. Read-only for this stage.
pub const BLOCK_BODIES: TableDefinition<(u64, [u8; 32]), Vec<u8>> =
    TableDefinition::new("block_bodies");

/// Transaction payloads addressed by body stubs.
///
/// **Schema:** transaction id (u64) → EIP-2718 encoded transaction
///
/// Ids are allocated sequentially when bodies are persisted, so a body's
/// transactions occupy `base_txn_id .. base_txn_id + txn_count`.
pub const BLOCK_TRANSACTIONS: TableDefinition<u64, Vec<u8>> =
    TableDefinition::new("block_transactions");

/// Recovered sender addresses, the output of this stage.
///
/// **Schema:** (BlockNumber, BlockHash) → concatenated 20-byte addresses
///
/// One row per canonical block with at least one transaction; the value
/// length is always `20 * txn_count` and addresses follow the block's
/// transaction order. Rows are written in ascending key order.
pub const SENDERS: TableDefinition<(u64, [u8; 32]), Vec<u8>> = TableDefinition::new("senders");

/// Per-stage progress watermarks.
///
/// **Schema:** stage name (&str) → BlockNumber (u64)
///
/// A missing entry reads as progress 0. This stage writes only its own key
/// ([`SENDERS_PROGRESS_KEY`]).
pub const STAGE_PROGRESS: TableDefinition<&str, u64> = TableDefinition::new("stage_progress");

/// Progress key written by the sender recovery stage.
pub const SENDERS_PROGRESS_KEY: &str = "senders";
/// Progress key of the upstream canonical-hashes stage.
pub const BLOCK_HASHES_PROGRESS_KEY: &str = "block_hashes";
/// Progress key of the upstream block-bodies stage.
pub const BLOCK_BODIES_PROGRESS_KEY: &str = "block_bodies";
/// Progress key of the downstream execution stage.
pub const EXECUTION_PROGRESS_KEY: &str = "execution";

/// Errors raised by the store layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to open or create the database file
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    /// Failed to begin a transaction
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    /// Failed to open a table
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    /// Read or write against an open table failed
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    /// Commit failed
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    /// A stored record did not decode
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Body stub persisted per block: where the block's transactions live in
/// [`BLOCK_TRANSACTIONS`] and how many there are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StoredBlockBody {
    /// First transaction id of the block
    pub base_txn_id: u64,
    /// Number of transactions in the block
    pub txn_count: u64,
}

/// Chain database handle shared by the stage driver and the CLI.
pub struct ChainStore {
    database: Database,
}

impl ChainStore {
    /// Open (or create) the chain database at the given path and make sure
    /// all tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let database = Database::create(path)?;

        let init = database.begin_write()?;
        {
            let _ = init.open_table(CANONICAL_HASHES)?;
            let _ = init.open_table(BLOCK_BODIES)?;
            let _ = init.open_table(BLOCK_TRANSACTIONS)?;
            let _ = init.open_table(SENDERS)?;
            let _ = init.open_table(STAGE_PROGRESS)?;
        }
        init.commit()?;

        Ok(Self { database })
    }

    /// Begin a read-write transaction. The stage holds exactly one of these
    /// for a whole run and commits it only on success.
    pub fn begin_rw(&self) -> Result<WriteTransaction, StoreError> {
        Ok(self.database.begin_write()?)
    }

    /// Begin a read-only transaction.
    pub fn begin_ro(&self) -> Result<ReadTransaction, StoreError> {
        Ok(self.database.begin_read()?)
    }

    /// Read a stage's progress watermark; a missing entry reads as 0.
    pub fn stage_progress(&self, stage: &str) -> Result<BlockNumber, StoreError> {
        let txn = self.begin_ro()?;
        let table = txn.open_table(STAGE_PROGRESS)?;
        Ok(table.get(stage)?.map(|guard| guard.value()).unwrap_or(0))
    }
}

/// Read a stage's progress watermark inside an open write transaction.
pub fn read_stage_progress(
    txn: &WriteTransaction,
    stage: &str,
) -> Result<BlockNumber, StoreError> {
    let table = txn.open_table(STAGE_PROGRESS)?;
    Ok(table.get(stage)?.map(|guard| guard.value()).unwrap_or(0))
}

/// Advance a stage's progress watermark inside an open write transaction.
pub fn write_stage_progress(
    txn: &WriteTransaction,
    stage: &str,
    block_num: BlockNumber,
) -> Result<(), StoreError> {
    let mut table = txn.open_table(STAGE_PROGRESS)?;
    table.insert(stage, block_num)?;
    Ok(())
}

/// Encode a block-keyed table key as bytes: big-endian block number followed
/// by the block hash. Byte order of the encoding equals the tuple-key order
/// of the table.
pub fn block_key(block_num: BlockNumber, block_hash: &B256) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..8].copy_from_slice(&block_num.to_be_bytes());
    key[8..].copy_from_slice(block_hash.as_slice());
    key
}

/// Decode a 40-byte block key back into its components.
pub fn split_block_key(key: &[u8]) -> Option<(BlockNumber, B256)> {
    if key.len() != 40 {
        return None;
    }
    let block_num = u64::from_be_bytes(key[..8].try_into().ok()?);
    Some((block_num, B256::from_slice(&key[8..])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_rlp::Decodable;

    #[test]
    fn block_key_round_trip() {
        let hash = B256::repeat_byte(0x5a);
        let key = block_key(46_147, &hash);
        assert_eq!(split_block_key(&key), Some((46_147, hash)));
        assert_eq!(split_block_key(&key[..39]), None);
    }

    #[test]
    fn block_key_orders_like_tuple_keys() {
        let low = block_key(1, &B256::repeat_byte(0xff));
        let high = block_key(2, &B256::repeat_byte(0x00));
        assert!(low < high);

        let sibling_a = block_key(7, &B256::repeat_byte(0x01));
        let sibling_b = block_key(7, &B256::repeat_byte(0x02));
        assert!(sibling_a < sibling_b);
    }

    #[test]
    fn stored_body_rlp_round_trip() {
        let body = StoredBlockBody {
            base_txn_id: 981,
            txn_count: 3,
        };
        let encoded = alloy_rlp::encode(body);
        let decoded = StoredBlockBody::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn missing_progress_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChainStore::open(dir.path().join("chaindata.redb")).unwrap();
        assert_eq!(store.stage_progress(SENDERS_PROGRESS_KEY).unwrap(), 0);

        let txn = store.begin_rw().unwrap();
        assert_eq!(read_stage_progress(&txn, SENDERS_PROGRESS_KEY).unwrap(), 0);
        write_stage_progress(&txn, SENDERS_PROGRESS_KEY, 42).unwrap();
        txn.commit().unwrap();

        assert_eq!(store.stage_progress(SENDERS_PROGRESS_KEY).unwrap(), 42);
    }
}
