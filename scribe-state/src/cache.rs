//! Read-through transaction cache.
//!
//! Lookup order: in-memory map, then the storage layer, then the chain
//! source. Chain-source fetches are written back into the map, and into
//! the storage layer when the transaction is confirmed.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tracing::debug;

use scribe_common::CacheConfig;

use crate::{
    error::CacheError,
    interrupt::Interrupt,
    source::{with_backoff, ChainSource},
    store::IndexStore,
    types::{Tx, TxRow, Txid},
};

/// Shared read-through cache in front of the store and the chain source.
pub struct TxCache<S> {
    map: Option<DashMap<Txid, Arc<Tx>>>,
    capacity: usize,
    store: Arc<IndexStore>,
    source: S,
    rpc_timeout: Duration,
}

impl<S: ChainSource> TxCache<S> {
    /// Creates the cache. With `enabled` false the map is skipped entirely
    /// and every lookup goes to the store or the source.
    pub fn new(
        store: Arc<IndexStore>,
        source: S,
        config: &CacheConfig,
        rpc_timeout: Duration,
        enabled: bool,
    ) -> Self {
        let map = enabled.then(|| {
            DashMap::with_capacity_and_shard_amount(
                config.capacity.min(1 << 20),
                config.shard_count(),
            )
        });
        Self {
            map,
            capacity: config.capacity,
            store,
            source,
            rpc_timeout,
        }
    }

    /// Whether the in-memory map is active.
    pub fn is_enabled(&self) -> bool {
        self.map.is_some()
    }

    /// Looks a transaction up, preferring the cache, then the store, then
    /// the chain source.
    pub async fn get_transaction(
        &self,
        txid: &Txid,
        interrupt: &Interrupt,
    ) -> Result<Option<Arc<Tx>>, CacheError> {
        if let Some(map) = &self.map {
            if let Some(tx) = map.get(txid) {
                return Ok(Some(tx.value().clone()));
            }
        }

        if let Some(row) = tokio::task::block_in_place(|| self.store.tx_row(txid))? {
            let tx = Arc::new(row.tx);
            self.insert(tx.clone());
            return Ok(Some(tx));
        }

        let txid = *txid;
        match with_backoff(interrupt, self.rpc_timeout, || self.source.transaction(txid)).await? {
            Some((tx, confirmed_at)) => {
                let tx = Arc::new(tx);
                self.insert(tx.clone());
                if let Some(height) = confirmed_at {
                    tokio::task::block_in_place(|| {
                        self.store.put_tx_row(&TxRow {
                            height,
                            tx: (*tx).clone(),
                        })
                    })?;
                }
                Ok(Some(tx))
            }
            None => Ok(None),
        }
    }

    /// Evicts a transaction, e.g. when a rollback orphans it.
    pub fn invalidate(&self, txid: &Txid) {
        if let Some(map) = &self.map {
            map.remove(txid);
        }
    }

    /// Number of cached transactions.
    pub fn len(&self) -> usize {
        self.map.as_ref().map(|m| m.len()).unwrap_or(0)
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, tx: Arc<Tx>) {
        if let Some(map) = &self.map {
            if map.len() >= self.capacity {
                debug!("transaction cache full, not caching {}", tx.txid);
                return;
            }
            map.insert(tx.txid, tx);
        }
    }
}
