//! Node-level settings consumed by the recovery stage.

use crate::chain_spec::ChainSpec;
use crate::worker::RecoveryPackage;
use std::path::PathBuf;

/// Total byte budget split across all worker batches.
pub const DEFAULT_BATCH_SIZE: usize = 512 * 1024 * 1024;
/// Collector memory budget before spilling to disk.
pub const DEFAULT_ETL_BUFFER_SIZE: usize = 256 * 1024 * 1024;

/// Configuration for one stage run.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Fork schedule of the chain being synced
    pub chain: ChainSpec,
    /// Directory for collector spill files
    pub etl_dir: PathBuf,
    /// Byte budget for in-flight recovery packages across all workers
    pub batch_size: usize,
    /// Upper bound on the worker pool; may shrink at runtime if a spawn fails
    pub max_workers: usize,
    /// Collector memory budget before spilling
    pub etl_buffer_size: usize,
    /// Write a zero address for an unrecoverable signature instead of
    /// failing the stage
    pub allow_zero_senders: bool,
}

impl NodeSettings {
    pub fn new(chain: ChainSpec, etl_dir: impl Into<PathBuf>) -> Self {
        Self {
            chain,
            etl_dir: etl_dir.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_workers: num_cpus::get(),
            etl_buffer_size: DEFAULT_ETL_BUFFER_SIZE,
            allow_zero_senders: false,
        }
    }

    /// Packages per worker batch: the byte budget split evenly over the
    /// hardware threads.
    pub fn worker_batch_size(&self) -> usize {
        (self.batch_size / num_cpus::get().max(1) / std::mem::size_of::<RecoveryPackage>()).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_batch_size_has_a_floor() {
        let mut settings = NodeSettings::new(ChainSpec::mainnet(), "/tmp/etl");
        settings.batch_size = 1;
        assert_eq!(settings.worker_batch_size(), 1);

        settings.batch_size = DEFAULT_BATCH_SIZE;
        assert!(settings.worker_batch_size() > 1);
    }
}
