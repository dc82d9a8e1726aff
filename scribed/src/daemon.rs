//! The daemon driver: signal wiring, entry-point dispatch, run loop.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{error, info};

use scribe_state::{
    Block, BlockHash, ChainParser, ChainSource, Engine, Height, IndexStore, ScriptParser,
    SourceError, SyncError, Tx, Txid,
};

use crate::{config::Cli, config::ScribedConfig, error::ScribedError};

/// Exit code for a clean run.
pub const EXIT_CODE_OK: u8 = 0;
/// Exit code for configuration and startup faults.
pub const EXIT_CODE_CONFIG: u8 = 2;
/// Exit code for fatal runtime faults.
pub const EXIT_CODE_FATAL: u8 = 255;

/// Parses config, dispatches the requested operation and maps the outcome
/// to an exit code. The body of `main`.
pub async fn main_with_exit_code(cli: Cli) -> u8 {
    let config = match ScribedConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration: {e}");
            return EXIT_CODE_CONFIG;
        }
    };

    if cli.repair {
        return match IndexStore::repair(&config.engine.storage) {
            Ok(report) => {
                info!(
                    "repair finished: {} values scanned, {} removed",
                    report.scanned, report.removed
                );
                EXIT_CODE_OK
            }
            Err(e) => {
                error!("repair: {e}");
                EXIT_CODE_FATAL
            }
        };
    }

    if cli.sync {
        // The stock binary carries no protocol adapter; continuous sync
        // only works from a per-coin daemon embedding run_with_source.
        error!(
            "no chain adapter is linked into this binary; \
             embed scribed::daemon::run_with_source with a ChainSource implementation"
        );
        return EXIT_CODE_CONFIG;
    }

    match run_with_source(&cli, &config, OfflineSource, Arc::new(ScriptParser)).await {
        Ok(()) => EXIT_CODE_OK,
        Err(ScribedError::Config(e)) => {
            error!("configuration: {e}");
            EXIT_CODE_CONFIG
        }
        Err(e) => {
            error!("{e}");
            EXIT_CODE_FATAL
        }
    }
}

/// Opens the engine over the given chain adapter, wires OS signals into
/// its interrupt, and runs the operation selected on the command line:
/// a one-shot entry point, or the continuous sync loop with `--sync`.
pub async fn run_with_source<S: ChainSource>(
    cli: &Cli,
    config: &ScribedConfig,
    source: S,
    parser: Arc<dyn ChainParser>,
) -> Result<(), ScribedError> {
    let grace = Duration::from_secs(config.shutdown_grace_secs);
    let mut engine = Engine::open(config.engine.clone(), source, parser).await?;

    let interrupt_handle = engine.interrupt_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            interrupt_handle.raise();
        }
    });

    let result = dispatch(cli, &mut engine).await;
    let fatal = engine.shutdown(grace).await?;
    match result {
        // An interrupted pass is a clean, non-fatal exit with consistent
        // state.
        Err(ScribedError::Sync(SyncError::Interrupted)) => {
            info!("operation interrupted, stopping");
            Ok(())
        }
        Err(e) => Err(e),
        Ok(()) if fatal => Err(ScribedError::Sync(SyncError::Consistency(
            "a sync loop stopped on a fatal error".into(),
        ))),
        Ok(()) => Ok(()),
    }
}

async fn dispatch<S: ChainSource>(cli: &Cli, engine: &mut Engine<S>) -> Result<(), ScribedError> {
    if cli.fix_utxos {
        let report = engine.fix_utxos().await?;
        info!(
            "UTXO check finished: {} scanned, {} repaired, {} deleted, {} unrecoverable",
            report.scanned, report.repaired, report.deleted, report.unrecoverable
        );
        return Ok(());
    }

    if cli.compute_stats {
        let stats = engine.compute_column_stats().await?;
        for column in &stats {
            info!(
                "column {}: {} rows, {} key bytes, {} value bytes",
                column.name, column.rows, column.key_bytes, column.value_bytes
            );
        }
        info!(
            "database size on disk: {}, size as computed: {}",
            engine.store().size_on_disk(),
            engine.state().db_size_total()
        );
        return Ok(());
    }

    if cli.compute_fee_stats {
        let (from, until) = required_range(cli)?;
        let stats = engine.compute_fee_stats(from, until).await?;
        info!(
            "fee stats {from}..{until}: {} blocks, {} txs, total {} (min {}, max {})",
            stats.blocks, stats.txs, stats.total_fees, stats.min_fee, stats.max_fee
        );
        return Ok(());
    }

    if let Some(height) = cli.rollback {
        engine.rollback_to(Height(height)).await?;
        info!("rolled back to height {height}");
        return Ok(());
    }

    if cli.sync {
        engine.initial_sync().await?;
        engine.spawn_sync_loops();
        // Run until the process-wide interrupt is raised by a signal or a
        // fatal loop error.
        engine.interrupt().raised().await;
        return Ok(());
    }

    if cli.block_from.is_some() {
        let (from, until) = required_range(cli)?;
        engine.backfill(from, until).await?;
        info!("backfilled blocks {from}..{until}");
        return Ok(());
    }

    info!("no operation requested");
    Ok(())
}

fn required_range(cli: &Cli) -> Result<(Height, Height), ScribedError> {
    let from = cli.block_from.ok_or_else(|| {
        ScribedError::Config("--block-from is required for range operations".into())
    })?;
    let until = cli.block_until.unwrap_or(from);
    if until < from {
        return Err(ScribedError::Config(
            "--block-until must not be below --block-from".into(),
        ));
    }
    Ok((Height(from), Height(until)))
}

/// Chain source used when no adapter is linked in. Every call fails, so
/// only operations that never touch the chain can run.
#[derive(Clone)]
struct OfflineSource;

impl OfflineSource {
    fn unavailable() -> SourceError {
        SourceError::Rpc("no chain adapter configured".into())
    }
}

#[async_trait]
impl ChainSource for OfflineSource {
    async fn best_block_height(&self) -> Result<Height, SourceError> {
        Err(Self::unavailable())
    }

    async fn block_hash(&self, _height: Height) -> Result<Option<BlockHash>, SourceError> {
        Err(Self::unavailable())
    }

    async fn block_by_height(&self, _height: Height) -> Result<Block, SourceError> {
        Err(Self::unavailable())
    }

    async fn block_by_hash(&self, _hash: BlockHash) -> Result<Option<Block>, SourceError> {
        Err(Self::unavailable())
    }

    async fn transaction(&self, _txid: Txid) -> Result<Option<(Tx, Option<Height>)>, SourceError> {
        Err(Self::unavailable())
    }

    async fn mempool_txids(&self) -> Result<Vec<Txid>, SourceError> {
        Err(Self::unavailable())
    }
}
