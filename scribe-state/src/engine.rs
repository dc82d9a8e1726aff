//! The engine context: one dependency-injected owner of every handle.
//!
//! Replaces ambient globals: storage, internal state, chain source,
//! transaction cache, mempool, sync worker and coordinator are owned here
//! and passed explicitly to every component.

use std::{sync::Arc, time::Duration};

use tracing::{info, warn};

use crate::{
    cache::TxCache,
    callbacks::CallbackRegistry,
    config::EngineConfig,
    coordinator::ResyncCoordinator,
    error::SyncError,
    interrupt::{interrupt_pair, Interrupt, InterruptHandle},
    mempool::Mempool,
    source::{ChainParser, ChainSource},
    state::{DbState, InternalState},
    store::{IndexStore, UtxoFixReport},
    sync::{FeeStats, SyncWorker},
    types::{ColumnStats, Height},
};

/// The assembled indexing engine.
pub struct Engine<S: ChainSource> {
    config: EngineConfig,
    store: Arc<IndexStore>,
    state: Arc<InternalState>,
    cache: Arc<TxCache<S>>,
    mempool: Arc<Mempool<S>>,
    worker: Arc<SyncWorker<S>>,
    callbacks: Arc<CallbackRegistry>,
    interrupt: Interrupt,
    interrupt_handle: Arc<InterruptHandle>,
    coordinator: Option<ResyncCoordinator>,
}

impl<S: ChainSource> Engine<S> {
    /// Opens the store, loads the internal state, runs the startup repair
    /// passes gated by its flags, and constructs every component.
    ///
    /// The lifecycle state transitions to `Open` only after the repair
    /// passes succeed and the workers are constructed. An `Inconsistent`
    /// store is refused.
    pub async fn open(
        config: EngineConfig,
        source: S,
        parser: Arc<dyn ChainParser>,
    ) -> Result<Self, SyncError> {
        let (handle, interrupt) = interrupt_pair();
        let interrupt_handle = Arc::new(handle);

        let store = Arc::new(tokio::task::block_in_place(|| {
            IndexStore::open(&config.storage, Arc::clone(&parser), config.extended_index)
        })?);
        let state = Arc::new(tokio::task::block_in_place(|| InternalState::load(&store))?);

        match state.db_state() {
            DbState::Inconsistent => {
                return Err(SyncError::Consistency(
                    "database is in inconsistent state and cannot be used".into(),
                ));
            }
            DbState::Open => {
                warn!("database was left in open state, possibly a previous ungraceful shutdown");
            }
            DbState::Closed => {}
        }

        // Startup repair passes, gated by the internal state flags. The
        // flags flip only on completion, so an interrupted pass re-runs on
        // the next start.
        if !state.utxo_checked() {
            let report = tokio::task::block_in_place(|| store.fix_utxos(&interrupt))?;
            state.set_utxo_checked(true);
            tokio::task::block_in_place(|| state.store(&store))?;
            if !report.is_clean() {
                warn!(
                    "startup UTXO check repaired {} and deleted {} rows",
                    report.repaired, report.deleted
                );
            }
        }
        if !state.sorted_address_history() {
            let sorted = tokio::task::block_in_place(|| store.sort_address_history(&interrupt))?;
            state.set_sorted_address_history(true);
            tokio::task::block_in_place(|| state.store(&store))?;
            if sorted > 0 {
                warn!("startup sort pass rewrote {sorted} address rows");
            }
        }

        let callbacks = Arc::new(CallbackRegistry::new());
        let rpc_timeout = Duration::from_secs(config.service.timeout.into());
        let cache = Arc::new(TxCache::new(
            Arc::clone(&store),
            source.clone(),
            &config.storage.cache,
            rpc_timeout,
            !config.disable_tx_cache,
        ));
        let mempool = Arc::new(Mempool::new(
            source.clone(),
            Arc::clone(&cache),
            Arc::clone(&store),
            Arc::clone(&parser),
            Arc::clone(&callbacks),
            interrupt.clone(),
            rpc_timeout,
        ));
        let worker = Arc::new(SyncWorker::new(
            Arc::clone(&store),
            Arc::clone(&state),
            source,
            Arc::clone(&cache),
            parser,
            Arc::clone(&callbacks),
            config.sync.clone(),
            &config.service,
            interrupt.clone(),
        ));

        // All important workers are initialized; the store is now owned.
        state.set_db_state(DbState::Open);
        tokio::task::block_in_place(|| state.store(&store))?;

        Ok(Self {
            config,
            store,
            state,
            cache,
            mempool,
            worker,
            callbacks,
            interrupt,
            interrupt_handle,
            coordinator: None,
        })
    }

    /// Runs the initial bulk sync followed by the first mempool sync.
    pub async fn initial_sync(&self) -> Result<(), SyncError> {
        self.state.set_sync_mode(true);
        self.state.set_initial_sync(true);
        self.worker.resync_index(None, true).await?;
        let count = self.mempool.resync().await?;
        self.state.finish_mempool_sync(count);
        self.state.set_initial_sync(false);
        tokio::task::block_in_place(|| self.state.store(&self.store))?;
        info!("initial sync complete, mempool holds {count} transactions");
        Ok(())
    }

    /// Spawns the steady-state trigger loops.
    pub fn spawn_sync_loops(&mut self) {
        self.coordinator = Some(ResyncCoordinator::spawn(
            Arc::clone(&self.worker),
            Arc::clone(&self.mempool),
            Arc::clone(&self.state),
            Arc::clone(&self.store),
            self.config.sync.clone(),
            self.interrupt.clone(),
            Arc::clone(&self.interrupt_handle),
        ));
    }

    /// Raises the interrupt, stops the trigger loops, and persists a clean
    /// shutdown. Returns whether a loop had hit a fatal error.
    pub async fn shutdown(mut self, grace: Duration) -> Result<bool, SyncError> {
        self.interrupt_handle.raise();
        let mut fatal = false;
        if let Some(coordinator) = self.coordinator.take() {
            fatal = coordinator.shutdown(grace).await;
        }
        // A store that latched Inconsistent must stay that way.
        if self.state.db_state() == DbState::Open {
            self.state.set_db_state(DbState::Closed);
        }
        self.state.set_sync_mode(false);
        tokio::task::block_in_place(|| self.state.store(&self.store))?;
        self.store.close();
        info!("engine shut down");
        Ok(fatal)
    }

    // ***** operational entry points *****

    /// One-shot rollback to `height`.
    pub async fn rollback_to(&self, height: Height) -> Result<(), SyncError> {
        self.worker.perform_rollback(height).await
    }

    /// One-shot bounded range backfill.
    pub async fn backfill(&self, from: Height, until: Height) -> Result<(), SyncError> {
        self.worker.connect_blocks_parallel(from, until).await
    }

    /// One-shot forced UTXO check-and-repair.
    pub async fn fix_utxos(&self) -> Result<UtxoFixReport, SyncError> {
        let report = self.worker.fix_utxos().await?;
        self.state.set_utxo_checked(true);
        tokio::task::block_in_place(|| self.state.store(&self.store))?;
        Ok(report)
    }

    /// One-shot column statistics computation.
    pub async fn compute_column_stats(&self) -> Result<Vec<ColumnStats>, SyncError> {
        let stats =
            tokio::task::block_in_place(|| self.store.compute_column_stats(&self.interrupt))?;
        self.state.set_column_stats(stats.clone());
        tokio::task::block_in_place(|| self.state.store(&self.store))?;
        Ok(stats)
    }

    /// One-shot fee statistics computation.
    pub async fn compute_fee_stats(&self, from: Height, until: Height) -> Result<FeeStats, SyncError> {
        self.worker.compute_fee_stats(from, until).await
    }

    // ***** shared handles *****

    /// The storage layer.
    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    /// The internal state record.
    pub fn state(&self) -> &Arc<InternalState> {
        &self.state
    }

    /// The transaction cache.
    pub fn cache(&self) -> &Arc<TxCache<S>> {
        &self.cache
    }

    /// The mempool view.
    pub fn mempool(&self) -> &Arc<Mempool<S>> {
        &self.mempool
    }

    /// The sync worker.
    pub fn worker(&self) -> &Arc<SyncWorker<S>> {
        &self.worker
    }

    /// The callback registries.
    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.callbacks
    }

    /// The trigger coordinator, once the sync loops are spawned.
    pub fn coordinator(&self) -> Option<&ResyncCoordinator> {
        self.coordinator.as_ref()
    }

    /// An observer of the process-wide cancellation signal.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// The raising side of the cancellation signal, for wiring OS signals.
    pub fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        Arc::clone(&self.interrupt_handle)
    }
}
