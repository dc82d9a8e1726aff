//! Scribe's indexing and synchronization engine.
//!
//! Ingests blocks and transactions from a node through the [`ChainSource`]
//! capability interface, maintains a persistent queryable index (blocks,
//! transactions, addresses, the UTXO set) in an embedded key-value store,
//! and keeps that index synchronized with the chain tip and the node's
//! mempool.
//!
//! Consumers read from the index; per-coin protocol adapters live in their
//! own crates and plug in at the [`ChainSource`] / [`ChainParser`] seam.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub(crate) mod encoding;

pub use encoding::RowSerde;

pub(crate) mod entry;

pub use entry::StoredEntry;

pub(crate) mod types;

pub use types::{
    AddrHistory, AddrTxRef, AddressDescriptor, Block, BlockHash, BlockRow, ColumnStats,
    ContractRef, Height, Outpoint, Tx, TxInput, TxOutput, TxRow, Txid, UtxoRow,
};

pub(crate) mod error;

pub use error::{CacheError, MempoolError, StorageError, SyncError};

pub(crate) mod interrupt;

pub use interrupt::{interrupt_pair, Interrupt, InterruptHandle};

pub(crate) mod config;

pub use config::EngineConfig;

pub(crate) mod source;

pub use source::{ChainParser, ChainSource, ScriptParser, SourceError};

pub(crate) mod store;

pub use store::{IndexStore, RepairReport, UtxoFixReport};

pub(crate) mod state;

pub use state::{DbState, InternalState};

pub(crate) mod cache;

pub use cache::TxCache;

pub(crate) mod callbacks;

pub use callbacks::{CallbackRegistry, OnNewBlockFn, OnNewTxAddrFn, OnNewTxFn};

pub(crate) mod mempool;

pub use mempool::{Mempool, MempoolEntry};

pub(crate) mod sync;

pub use sync::{FeeStats, SyncWorker};

pub(crate) mod coordinator;

pub use coordinator::ResyncCoordinator;

pub(crate) mod engine;

pub use engine::Engine;

#[cfg(test)]
pub(crate) mod tests;
