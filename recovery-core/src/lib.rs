//! Sender Recovery Core Library
//!
//! This library implements the sender recovery stage of a staged blockchain
//! synchronizer: for a contiguous range of canonical blocks it recovers the
//! sender address of every transaction by ECDSA public-key recovery and
//! writes the results into a dedicated senders index.
//!
//! ## Key Components
//!
//! - **ChainStore**: redb-backed chain database with the tables the stage
//!   consumes and produces (in `store`)
//! - **RecoveryFarm**: the scheduler driving header enumeration, body
//!   streaming, worker dispatch and the sorted load (in `farm`)
//! - **RecoveryWorker**: worker threads performing the actual public-key
//!   recovery (in `worker`)
//! - **Collector**: external-memory spill/sort/merge accumulator (in `etl`)
//! - **StageDriver**: `recover` / `unwind` / `prune` entry points with
//!   transaction lifecycle and result codes (in `stage`)
//!
//! ## Modules
//!
//! - [`chain_spec`]: fork schedule and per-block protocol rules
//! - [`etl`]: external-memory collector
//! - [`farm`]: the recovery scheduler
//! - [`settings`]: node-level configuration
//! - [`stage`]: driver, results and errors
//! - [`store`]: chain database schema and access helpers
//! - [`worker`]: recovery workers and their packages

pub mod chain_spec;
pub use chain_spec::*;
pub mod etl;
pub use etl::*;
pub mod farm;
pub use farm::*;
pub mod settings;
pub use settings::*;
pub mod stage;
pub use stage::*;
pub mod store;
pub use store::*;
pub mod worker;
pub use worker::*;
