//! The engine's persisted self-description of consistency and progress.
//!
//! Read once at startup, held in memory for the process lifetime, stored
//! periodically and at controlled shutdown. This record is the single
//! source of truth for "is it safe to serve and sync".

use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::{
    error::StorageError,
    store::{IndexStore, STATE_KEY},
    types::{BlockHash, ColumnStats, Height},
};

/// Database lifecycle state.
///
/// `Inconsistent` never transitions back to `Open` automatically; that
/// requires an explicit repair run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DbState {
    /// The store was shut down cleanly (or never opened).
    Closed,
    /// The store is owned by a running engine.
    Open,
    /// Corruption was detected; the engine refuses to sync or serve.
    Inconsistent,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StateRecord {
    db_state: DbState,
    utxo_checked: bool,
    sorted_address_history: bool,
    sync_mode: bool,
    initial_sync: bool,
    last_block_height: Option<Height>,
    last_block_hash: Option<BlockHash>,
    last_mempool_sync: Option<DateTime<Utc>>,
    mempool_tx_count: usize,
    column_stats: Vec<ColumnStats>,
    created: DateTime<Utc>,
}

impl StateRecord {
    fn fresh() -> Self {
        Self {
            db_state: DbState::Closed,
            utxo_checked: false,
            sorted_address_history: false,
            sync_mode: false,
            initial_sync: false,
            last_block_height: None,
            last_block_hash: None,
            last_mempool_sync: None,
            mempool_tx_count: 0,
            column_stats: Vec::new(),
            created: Utc::now(),
        }
    }
}

/// The in-memory handle to the persisted internal state record.
#[derive(Debug)]
pub struct InternalState {
    record: RwLock<StateRecord>,
}

impl InternalState {
    /// Reads the existing record, or synthesizes a fresh zero-value one on
    /// first run.
    pub fn load(store: &IndexStore) -> Result<Self, StorageError> {
        let record = match store.get_metadata_raw(STATE_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => StateRecord::fresh(),
        };
        Ok(Self {
            record: RwLock::new(record),
        })
    }

    /// Serializes and persists the record.
    ///
    /// A failure here is fatal to the calling operation: the engine cannot
    /// guarantee durability of sync progress otherwise.
    pub fn store(&self, store: &IndexStore) -> Result<(), StorageError> {
        let bytes = {
            let record = self.read();
            serde_json::to_vec(&*record)?
        };
        store.put_metadata_raw(STATE_KEY, &bytes)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StateRecord> {
        self.record.read().expect("internal state lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StateRecord> {
        self.record.write().expect("internal state lock poisoned")
    }

    /// Current lifecycle state.
    pub fn db_state(&self) -> DbState {
        self.read().db_state
    }

    /// Sets the lifecycle state.
    pub fn set_db_state(&self, db_state: DbState) {
        self.write().db_state = db_state;
    }

    /// Whether the UTXO consistency pass has completed since the last time
    /// it was invalidated.
    pub fn utxo_checked(&self) -> bool {
        self.read().utxo_checked
    }

    /// Marks the UTXO consistency pass complete (or pending).
    pub fn set_utxo_checked(&self, checked: bool) {
        self.write().utxo_checked = checked;
    }

    /// Whether the address history sort pass has completed.
    pub fn sorted_address_history(&self) -> bool {
        self.read().sorted_address_history
    }

    /// Marks the address history sort pass complete (or pending).
    pub fn set_sorted_address_history(&self, sorted: bool) {
        self.write().sorted_address_history = sorted;
    }

    /// Whether the engine keeps the index synchronized continuously.
    pub fn sync_mode(&self) -> bool {
        self.read().sync_mode
    }

    /// Sets continuous sync mode.
    pub fn set_sync_mode(&self, sync_mode: bool) {
        self.write().sync_mode = sync_mode;
    }

    /// Whether the initial bulk sync is still running.
    pub fn initial_sync(&self) -> bool {
        self.read().initial_sync
    }

    /// Sets the initial sync marker.
    pub fn set_initial_sync(&self, initial_sync: bool) {
        self.write().initial_sync = initial_sync;
    }

    /// The last confirmed block the index holds.
    pub fn last_block(&self) -> Option<(Height, BlockHash)> {
        let record = self.read();
        match (record.last_block_height, record.last_block_hash) {
            (Some(height), Some(hash)) => Some((height, hash)),
            _ => None,
        }
    }

    /// Records the current tip (or its absence).
    pub fn set_tip(&self, tip: Option<(Height, BlockHash)>) {
        let mut record = self.write();
        record.last_block_height = tip.map(|(h, _)| h);
        record.last_block_hash = tip.map(|(_, hash)| hash);
    }

    /// Records a completed mempool sync.
    pub fn finish_mempool_sync(&self, tx_count: usize) {
        let mut record = self.write();
        record.last_mempool_sync = Some(Utc::now());
        record.mempool_tx_count = tx_count;
    }

    /// The time and size of the last completed mempool sync.
    pub fn last_mempool_sync(&self) -> Option<(DateTime<Utc>, usize)> {
        let record = self.read();
        record
            .last_mempool_sync
            .map(|at| (at, record.mempool_tx_count))
    }

    /// Stores freshly computed column statistics.
    pub fn set_column_stats(&self, stats: Vec<ColumnStats>) {
        self.write().column_stats = stats;
    }

    /// The most recently computed column statistics.
    pub fn column_stats(&self) -> Vec<ColumnStats> {
        self.read().column_stats.clone()
    }

    /// Total indexed bytes according to the column statistics.
    pub fn db_size_total(&self) -> u64 {
        self.read()
            .column_stats
            .iter()
            .map(|c| c.key_bytes + c.value_bytes)
            .sum()
    }
}
