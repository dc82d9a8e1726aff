//! The in-memory view of the node's mempool.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use crate::{
    cache::TxCache,
    callbacks::CallbackRegistry,
    error::{CacheError, MempoolError},
    interrupt::Interrupt,
    source::{with_backoff, ChainParser, ChainSource},
    store::IndexStore,
    types::{AddressDescriptor, Tx, Txid},
};

/// One unconfirmed transaction tracked by the mempool.
#[derive(Clone)]
pub struct MempoolEntry {
    /// The transaction.
    pub tx: Arc<Tx>,
    /// Address descriptors the transaction touches, inputs and outputs.
    pub addrs: Vec<AddressDescriptor>,
    /// When this engine first saw the transaction.
    pub first_seen: DateTime<Utc>,
}

/// Mirror of the node's mempool, reconciled by [`Mempool::resync`].
///
/// Unconfirmed data is held here, never in the confirmed column families,
/// so a mempool resync is safe to run concurrently with an index resync.
pub struct Mempool<S: ChainSource> {
    source: S,
    cache: Arc<TxCache<S>>,
    store: Arc<IndexStore>,
    parser: Arc<dyn ChainParser>,
    callbacks: Arc<CallbackRegistry>,
    entries: DashMap<Txid, MempoolEntry>,
    interrupt: Interrupt,
    rpc_timeout: Duration,
    guard: tokio::sync::Mutex<()>,
}

impl<S: ChainSource> Mempool<S> {
    /// Creates an empty mempool view.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: S,
        cache: Arc<TxCache<S>>,
        store: Arc<IndexStore>,
        parser: Arc<dyn ChainParser>,
        callbacks: Arc<CallbackRegistry>,
        interrupt: Interrupt,
        rpc_timeout: Duration,
    ) -> Self {
        Self {
            source,
            cache,
            store,
            parser,
            callbacks,
            entries: DashMap::new(),
            interrupt,
            rpc_timeout,
            guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Reconciles the local view against the node's current mempool.
    ///
    /// New-transaction callbacks fire for additions; departed transactions
    /// (confirmed or evicted) are dropped. Returns the transaction count.
    /// At most one resync runs at a time; a concurrent call observes
    /// [`MempoolError::AlreadyRunning`].
    pub async fn resync(&self) -> Result<usize, MempoolError> {
        let Ok(_guard) = self.guard.try_lock() else {
            return Err(MempoolError::AlreadyRunning);
        };
        if self.interrupt.is_raised() {
            return Err(MempoolError::Interrupted);
        }

        let txids = with_backoff(&self.interrupt, self.rpc_timeout, || {
            self.source.mempool_txids()
        })
        .await?;
        let target: HashSet<Txid> = txids.iter().copied().collect();

        self.entries.retain(|txid, _| target.contains(txid));

        let mut added = 0usize;
        for txid in txids {
            if self.interrupt.is_raised() {
                return Err(MempoolError::Interrupted);
            }
            if self.entries.contains_key(&txid) {
                continue;
            }
            // The transaction can leave the mempool between the id listing
            // and the fetch; that is not an error.
            let Some(tx) = self.cache.get_transaction(&txid, &self.interrupt).await? else {
                debug!("mempool tx {txid} vanished before it could be fetched");
                continue;
            };
            let addrs = self.addresses_of(&tx)?;
            let entry = MempoolEntry {
                tx: tx.clone(),
                addrs,
                first_seen: Utc::now(),
            };
            for addr in &entry.addrs {
                self.callbacks.fire_new_tx_addr(&tx, addr);
            }
            self.callbacks.fire_new_tx(&tx);
            self.entries.insert(txid, entry);
            added += 1;
        }
        if added > 0 {
            debug!("mempool resync added {added} transactions");
        }
        Ok(self.entries.len())
    }

    fn addresses_of(&self, tx: &Tx) -> Result<Vec<AddressDescriptor>, MempoolError> {
        let mut addrs = Vec::new();
        for output in &tx.outputs {
            if let Some(desc) = self.parser.address_descriptor(&output.script) {
                if !addrs.contains(&desc) {
                    addrs.push(desc);
                }
            }
        }
        for input in tx.inputs.iter().filter(|i| !i.is_coinbase()) {
            let desc = tokio::task::block_in_place(|| {
                self.store.addr_desc_for_outpoint(&input.prevout)
            })
            .map_err(CacheError::Storage)?;
            if let Some(desc) = desc {
                if !addrs.contains(&desc) {
                    addrs.push(desc);
                }
            }
        }
        Ok(addrs)
    }

    /// Number of tracked transactions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the view is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the mempool tracks `txid`.
    pub fn contains(&self, txid: &Txid) -> bool {
        self.entries.contains_key(txid)
    }

    /// Returns a tracked transaction entry.
    pub fn get(&self, txid: &Txid) -> Option<MempoolEntry> {
        self.entries.get(txid).map(|e| e.value().clone())
    }

    /// Unconfirmed transactions touching an address.
    pub fn transactions_for(&self, addr: &AddressDescriptor) -> Vec<Arc<Tx>> {
        self.entries
            .iter()
            .filter(|e| e.addrs.contains(addr))
            .map(|e| e.tx.clone())
            .collect()
    }
}
