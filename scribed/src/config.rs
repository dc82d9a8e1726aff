//! Scribed configuration and command line.

use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use scribe_state::EngineConfig;

use crate::error::ScribedError;

/// Command line of the daemon.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "scribed", version, about = "Scribe blockchain index daemon")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "scribed.toml")]
    pub config: PathBuf,

    /// Repair the database and exit.
    #[arg(long)]
    pub repair: bool,

    /// Check and fix the UTXO set and exit.
    #[arg(long)]
    pub fix_utxos: bool,

    /// Compute column statistics and exit.
    #[arg(long)]
    pub compute_stats: bool,

    /// Compute fee statistics for the configured block range and exit.
    #[arg(long)]
    pub compute_fee_stats: bool,

    /// Roll the index back to the given height and exit.
    #[arg(long)]
    pub rollback: Option<u32>,

    /// Height of the starting block for range operations.
    #[arg(long)]
    pub block_from: Option<u32>,

    /// Height of the final block for range operations.
    #[arg(long)]
    pub block_until: Option<u32>,

    /// Synchronize until the chain tip and keep the index synchronized.
    #[arg(long)]
    pub sync: bool,
}

/// Config information required for scribed.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ScribedConfig {
    /// Engine configuration: storage, service, sync tuning, index flags.
    pub engine: EngineConfig,
    /// Bound on the shutdown grace period, in seconds. In-flight passes
    /// must reach a checkpoint and stop within it.
    pub shutdown_grace_secs: u64,
}

impl Default for ScribedConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            shutdown_grace_secs: 10,
        }
    }
}

impl ScribedConfig {
    /// Loads the configuration: defaults, then the TOML file, then
    /// `SCRIBED_*` environment overrides (`__` separates nesting levels).
    pub fn load(path: &std::path::Path) -> Result<Self, ScribedError> {
        let config: ScribedConfig = Figment::from(Serialized::defaults(ScribedConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SCRIBED_").split("__"))
            .extract()?;
        config.check_config()?;
        Ok(config)
    }

    /// Performs checks on config data.
    pub fn check_config(&self) -> Result<(), ScribedError> {
        if self.engine.sync.workers == 0 {
            return Err(ScribedError::Config(
                "sync.workers must be at least 1".into(),
            ));
        }
        if self.engine.sync.chunk_size == 0 {
            return Err(ScribedError::Config(
                "sync.chunk_size must be at least 1".into(),
            ));
        }
        if self.engine.storage.database.path.as_os_str().is_empty() {
            return Err(ScribedError::Config(
                "storage.database.path must not be empty".into(),
            ));
        }
        if self.shutdown_grace_secs == 0 {
            return Err(ScribedError::Config(
                "shutdown_grace_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
