use std::{
    path::PathBuf,
    sync::{Arc, atomic::Ordering},
    time::{Duration, Instant},
};

use alloy_genesis::Genesis;
use clap::{Parser, Subcommand};
use eyre::{Result, anyhow};
use recovery_core::{
    BLOCK_BODIES_PROGRESS_KEY, BLOCK_HASHES_PROGRESS_KEY, ChainSpec, ChainStore,
    DEFAULT_BATCH_SIZE, EXECUTION_PROGRESS_KEY, NodeSettings, SENDERS_PROGRESS_KEY, StageDriver,
    StageResult,
};
use tokio::{signal, task};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Database filename inside the data directory.
const CHAINDATA_DB_FILENAME: &str = "chaindata.redb";

/// Initialize logging with environment variable configuration
///
/// Supports the following environment variables:
/// - SENDERS_STAGE_LOG_FILE_DIRECTORY: Directory for log files (optional, file logging disabled if not set)
/// - SENDERS_STAGE_LOG_FILE: Log level for file output (debug/info/warn/error), default: debug
/// - SENDERS_STAGE_LOG_STDOUT: Log level for stdout (debug/info/warn/error), default: info
fn init_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let file_directory = std::env::var("SENDERS_STAGE_LOG_FILE_DIRECTORY").ok();
    let file_filter =
        std::env::var("SENDERS_STAGE_LOG_FILE").unwrap_or_else(|_| "debug".to_string());
    let stdout_filter =
        std::env::var("SENDERS_STAGE_LOG_STDOUT").unwrap_or_else(|_| "info".to_string());

    let stdout_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(
            EnvFilter::new("warn")
                .add_directive(format!("recovery_core={}", stdout_filter).parse()?)
                .add_directive(format!("senders_stage={}", stdout_filter).parse()?),
        )
        .boxed();

    let subscriber = tracing_subscriber::registry().with(stdout_layer);

    if let Some(log_dir) = &file_directory {
        let log_path = PathBuf::from(log_dir);
        std::fs::create_dir_all(&log_path)
            .map_err(|e| anyhow!("Failed to create log directory {log_dir}: {e}"))?;

        let file_layer = fmt::layer()
            .with_writer(RollingFileAppender::new(
                Rotation::DAILY,
                log_path,
                "senders-stage.log",
            ))
            .with_filter(
                EnvFilter::new("warn")
                    .add_directive(format!("recovery_core={}", file_filter).parse()?)
                    .add_directive(format!("senders_stage={}", file_filter).parse()?),
            )
            .boxed();

        subscriber.with(file_layer).init();
        info!("[Logging] Initialized: stdout={stdout_filter}, file={file_filter} ({log_dir})");
    } else {
        subscriber.init();
        info!("[Logging] Initialized: stdout={stdout_filter}, file logging disabled");
    }

    Ok(())
}

/// Command line arguments for the sender recovery stage.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct CommandLineArgs {
    /// Directory holding the chain database.
    #[clap(long, env = "SENDERS_STAGE_DATA_DIR")]
    data_dir: PathBuf,

    /// Named chain configuration (mainnet, sepolia). Ignored when a genesis
    /// file is given.
    #[clap(long, env = "SENDERS_STAGE_CHAIN", default_value = "mainnet")]
    chain: String,

    /// Path to a genesis JSON file to derive the fork schedule from.
    #[clap(long, env = "SENDERS_STAGE_GENESIS_FILE")]
    genesis_file: Option<PathBuf>,

    /// Byte budget for in-flight recovery packages across all workers.
    #[clap(long, env = "SENDERS_STAGE_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Directory for collector spill files. Defaults to `<data-dir>/etl`.
    #[clap(long, env = "SENDERS_STAGE_ETL_DIR")]
    etl_dir: Option<PathBuf>,

    /// Upper bound on the recovery worker pool. Defaults to the number of
    /// hardware threads.
    #[clap(long, env = "SENDERS_STAGE_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Write a zero address for an unrecoverable signature instead of
    /// failing the stage.
    #[clap(long, env = "SENDERS_STAGE_ALLOW_ZERO_SENDERS")]
    allow_zero_senders: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Recover senders for every block the upstream stages have prepared.
    Recover,
    /// Roll the senders table back to a block height.
    Unwind {
        /// Height to unwind to (inclusive lower bound of what survives).
        #[clap(long)]
        to: u64,
    },
    /// Delete sender history below a block height.
    Prune {
        /// Lowest height to keep.
        #[clap(long)]
        from: u64,
    },
}

/// Resolve the fork schedule from a genesis file or a named preset.
fn load_chain_spec(args: &CommandLineArgs) -> Result<ChainSpec> {
    match &args.genesis_file {
        Some(path) => {
            info!("[Main] Loading genesis from file: {}", path.display());
            let genesis: Genesis = serde_json::from_str(&std::fs::read_to_string(path)?)?;
            Ok(ChainSpec::from_genesis(&genesis))
        }
        None => ChainSpec::by_name(&args.chain)
            .ok_or_else(|| anyhow!("Unknown chain '{}'", args.chain)),
    }
}

fn main() -> Result<()> {
    init_logging()?;
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| anyhow!("Failed to build Tokio runtime: {e}"))?;
    let timeout = Duration::from_secs(1);
    let result = runtime.block_on(run());
    let shutdown_start = Instant::now();
    runtime.shutdown_timeout(timeout);
    if shutdown_start.elapsed() >= timeout {
        warn!("[Main] Tokio runtime shutdown reached the {timeout:?} timeout.");
    }
    std::process::exit(result?.exit_code());
}

async fn run() -> Result<StageResult> {
    let start = Instant::now();
    let args = CommandLineArgs::parse();

    info!("[Main] Data directory: {}", args.data_dir.display());

    let chain = load_chain_spec(&args)?;
    info!("[Main] Chain id {} loaded", chain.chain_id);

    std::fs::create_dir_all(&args.data_dir)
        .map_err(|e| anyhow!("Failed to create data directory: {e}"))?;
    let store = Arc::new(ChainStore::open(args.data_dir.join(CHAINDATA_DB_FILENAME))?);
    info!(
        "[Main] Stage progress: senders {}, block hashes {}, block bodies {}, execution {}",
        store.stage_progress(SENDERS_PROGRESS_KEY)?,
        store.stage_progress(BLOCK_HASHES_PROGRESS_KEY)?,
        store.stage_progress(BLOCK_BODIES_PROGRESS_KEY)?,
        store.stage_progress(EXECUTION_PROGRESS_KEY)?,
    );

    let mut settings = NodeSettings::new(chain, args.etl_dir.unwrap_or(args.data_dir.join("etl")));
    settings.batch_size = args.batch_size;
    settings.allow_zero_senders = args.allow_zero_senders;
    if let Some(max_workers) = args.max_workers {
        settings.max_workers = max_workers;
    }
    info!(
        "[Main] Worker pool cap {}, batch of {} packages per worker",
        settings.max_workers,
        settings.worker_batch_size()
    );

    let driver = StageDriver::new(Arc::clone(&store), settings);
    let stopping = driver.stop_signal();
    let progress = driver.progress();

    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {e}"))?;
    task::spawn(async move {
        tokio::select! {
            _ = signal::ctrl_c() => info!("[Main] SIGINT received, stopping stage."),
            _ = sigterm.recv() => info!("[Main] SIGTERM received, stopping stage."),
        }
        stopping.store(true, Ordering::Relaxed);
    });

    let reporter = task::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let snapshot = progress.snapshot();
            if snapshot.phase != 0 {
                info!("[SendersStage] {snapshot}");
            }
        }
    });

    let command = args.command;
    let result = task::spawn_blocking(move || match command {
        Command::Recover => driver.recover(),
        Command::Unwind { to } => driver.unwind(to),
        Command::Prune { from } => driver.prune(from),
    })
    .await
    .map_err(|e| anyhow!("Stage task panicked: {e}"))?;
    reporter.abort();

    let senders_progress = store.stage_progress(SENDERS_PROGRESS_KEY)?;
    if result.is_success() {
        info!(
            "[Main] Finished in {:?}; senders progress at block {senders_progress}",
            start.elapsed()
        );
    } else {
        warn!(
            "[Main] Finished with '{result}' in {:?}; senders progress at block {senders_progress}",
            start.elapsed()
        );
    }
    Ok(result)
}
