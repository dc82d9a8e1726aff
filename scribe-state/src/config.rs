//! Engine configuration.

use scribe_common::{ServiceConfig, StorageConfig, SyncConfig};

/// Configuration for the whole indexing engine.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize, Default)]
pub struct EngineConfig {
    /// Storage configuration (cache and database).
    pub storage: StorageConfig,
    /// Service-level configuration (timeouts, channel sizes).
    #[serde(default)]
    pub service: ServiceConfig,
    /// Synchronization tuning.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Also index input outpoints to their spending transactions, and
    /// contract sub-entries of addresses.
    #[serde(default)]
    pub extended_index: bool,
    /// Disable the in-memory transaction cache for low-memory deployments.
    #[serde(default)]
    pub disable_tx_cache: bool,
}
