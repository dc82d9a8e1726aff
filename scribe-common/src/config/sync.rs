//! Synchronization tuning shared between the sync worker and the resync coordinator.

/// Tuning knobs for block synchronization and the trigger loops.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct SyncConfig {
    /// Block chunk size for processing in bulk mode.
    pub chunk_size: u32,
    /// Number of workers fetching blocks in bulk mode.
    pub workers: u32,
    /// Resync the index at least this often, in milliseconds.
    ///
    /// Push notifications from the node shorten the effective interval.
    pub resync_index_period_ms: u64,
    /// Resync the mempool at least this often, in milliseconds.
    pub resync_mempool_period_ms: u64,
    /// Persist the internal state record this often, in milliseconds.
    pub store_state_period_ms: u64,
    /// Debounce window for bursts of resync triggers, in milliseconds.
    pub debounce_ms: u64,
    /// Maximum reorg depth the engine will roll back automatically.
    pub max_rollback_depth: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            workers: 8,
            resync_index_period_ms: 935_093,
            resync_mempool_period_ms: 60_017,
            store_state_period_ms: 59_699,
            debounce_ms: 1_009,
            max_rollback_depth: 100,
        }
    }
}
