//! Registries for external subscribers to index events.
//!
//! Callbacks are invoked synchronously by the sync worker and the mempool
//! after a successful commit, fanned out to every registered subscriber.

use std::sync::RwLock;

use crate::types::{AddressDescriptor, BlockHash, Height, Tx};

/// Invoked after a block is connected in steady-state sync.
pub type OnNewBlockFn = Box<dyn Fn(Height, &BlockHash) + Send + Sync>;

/// Invoked for every address touched by a newly seen transaction.
pub type OnNewTxAddrFn = Box<dyn Fn(&Tx, &AddressDescriptor) + Send + Sync>;

/// Invoked for every newly seen transaction.
pub type OnNewTxFn = Box<dyn Fn(&Tx) + Send + Sync>;

/// Callback registries exposed by the core.
#[derive(Default)]
pub struct CallbackRegistry {
    on_new_block: RwLock<Vec<OnNewBlockFn>>,
    on_new_tx_addr: RwLock<Vec<OnNewTxAddrFn>>,
    on_new_tx: RwLock<Vec<OnNewTxFn>>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new-block subscriber.
    pub fn register_on_new_block(&self, f: OnNewBlockFn) {
        self.on_new_block
            .write()
            .expect("callback lock poisoned")
            .push(f);
    }

    /// Registers a new-transaction-address subscriber.
    pub fn register_on_new_tx_addr(&self, f: OnNewTxAddrFn) {
        self.on_new_tx_addr
            .write()
            .expect("callback lock poisoned")
            .push(f);
    }

    /// Registers a new-transaction subscriber.
    pub fn register_on_new_tx(&self, f: OnNewTxFn) {
        self.on_new_tx
            .write()
            .expect("callback lock poisoned")
            .push(f);
    }

    pub(crate) fn fire_new_block(&self, height: Height, hash: &BlockHash) {
        for f in self
            .on_new_block
            .read()
            .expect("callback lock poisoned")
            .iter()
        {
            f(height, hash);
        }
    }

    pub(crate) fn fire_new_tx_addr(&self, tx: &Tx, addr: &AddressDescriptor) {
        for f in self
            .on_new_tx_addr
            .read()
            .expect("callback lock poisoned")
            .iter()
        {
            f(tx, addr);
        }
    }

    pub(crate) fn fire_new_tx(&self, tx: &Tx) {
        for f in self
            .on_new_tx
            .read()
            .expect("callback lock poisoned")
            .iter()
        {
            f(tx);
        }
    }
}
