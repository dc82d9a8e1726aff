//! Error types for the Scribe engine.

use crate::source::SourceError;

/// Errors raised by the storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Error from the LMDB environment.
    #[error("database error: {0}")]
    Lmdb(#[from] lmdb::Error),

    /// Row (de)serialisation error.
    #[error("row encoding error: {0}")]
    Encoding(core2::io::Error),

    /// std::io::Error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal state record (de)serialisation error.
    #[error("state record error: {0}")]
    StateRecord(#[from] serde_json::Error),

    /// Another process holds the database directory.
    #[error("database is locked: {0}")]
    Locked(String),

    /// The on-disk schema does not match this build.
    #[error("schema mismatch: {0}")]
    Schema(String),

    /// The index contradicts itself; refuse to continue.
    #[error("consistency violation: {0}")]
    Consistency(String),

    /// A running pass was asked to stop; state is consistent.
    #[error("operation interrupted")]
    Interrupted,
}

impl From<core2::io::Error> for StorageError {
    fn from(value: core2::io::Error) -> Self {
        StorageError::Encoding(value)
    }
}

/// Errors raised by the transaction cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Error from the storage layer fallback.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Error from the chain source fallback.
    #[error("chain source error: {0}")]
    Source(#[from] SourceError),
}

/// Errors raised by the sync worker.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A running pass was asked to stop; partial progress is committed and
    /// the index is consistent. Callers treat this as a clean exit.
    #[error("operation interrupted")]
    Interrupted,

    /// Another pass of the same kind is in flight.
    #[error("sync already running")]
    AlreadyRunning,

    /// Fatal storage fault; the pass stops and the error is escalated.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Chain source fault that survived the retry policy.
    #[error("chain source error: {0}")]
    Source(#[from] SourceError),

    /// Transaction cache fault.
    #[error("cache error: {0}")]
    Cache(CacheError),

    /// Detected mismatch between the index and the chain that cannot be
    /// resolved by an automatic rollback.
    #[error("consistency violation: {0}")]
    Consistency(String),
}

impl SyncError {
    /// True for faults that must latch the internal state to `Inconsistent`.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            SyncError::Consistency(_) | SyncError::Storage(StorageError::Consistency(_))
        )
    }
}

impl From<StorageError> for SyncError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::Interrupted => SyncError::Interrupted,
            other => SyncError::Storage(other),
        }
    }
}

impl From<CacheError> for SyncError {
    fn from(value: CacheError) -> Self {
        match value {
            CacheError::Storage(StorageError::Interrupted) => SyncError::Interrupted,
            other => SyncError::Cache(other),
        }
    }
}

impl From<MempoolError> for SyncError {
    fn from(value: MempoolError) -> Self {
        match value {
            MempoolError::Interrupted => SyncError::Interrupted,
            MempoolError::AlreadyRunning => SyncError::AlreadyRunning,
            MempoolError::Source(e) => SyncError::Source(e),
            MempoolError::Cache(e) => SyncError::from(e),
        }
    }
}

/// Errors raised by the mempool.
#[derive(Debug, thiserror::Error)]
pub enum MempoolError {
    /// A running resync was asked to stop.
    #[error("operation interrupted")]
    Interrupted,

    /// Another mempool resync is in flight.
    #[error("mempool resync already running")]
    AlreadyRunning,

    /// Chain source fault that survived the retry policy.
    #[error("chain source error: {0}")]
    Source(#[from] SourceError),

    /// Transaction cache fault.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}
