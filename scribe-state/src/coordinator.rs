//! Serializes and debounces resync triggers.
//!
//! Three trigger channels (resync-index, resync-mempool, store-state) are
//! fed by fixed-period timers and by external push notifications. Bursts
//! arriving within the debounce window collapse into one pass, a pass in
//! flight absorbs further triggers, and shutdown waits for every loop to
//! acknowledge completion.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use scribe_common::SyncConfig;

use crate::{
    error::{MempoolError, SyncError},
    interrupt::{Interrupt, InterruptHandle},
    mempool::Mempool,
    source::ChainSource,
    state::{DbState, InternalState},
    store::IndexStore,
    sync::SyncWorker,
};

/// Owns the trigger channels and the three worker loops.
pub struct ResyncCoordinator {
    index_tx: mpsc::Sender<()>,
    mempool_tx: mpsc::Sender<()>,
    store_tx: mpsc::Sender<()>,
    handles: Vec<(&'static str, JoinHandle<()>)>,
    fatal: Arc<AtomicBool>,
}

impl ResyncCoordinator {
    /// Spawns the resync-index, resync-mempool and store-state loops.
    ///
    /// `escalate` is raised when a loop hits a fatal error, so the whole
    /// process shuts down rather than continuing against an untrusted
    /// index.
    pub fn spawn<S: ChainSource>(
        worker: Arc<SyncWorker<S>>,
        mempool: Arc<Mempool<S>>,
        state: Arc<InternalState>,
        store: Arc<IndexStore>,
        config: SyncConfig,
        interrupt: Interrupt,
        escalate: Arc<InterruptHandle>,
    ) -> Self {
        let fatal = Arc::new(AtomicBool::new(false));
        // Capacity 1: a pending trigger already guarantees a pass will
        // run, so further pushes are absorbed.
        let (index_tx, index_rx) = mpsc::channel(1);
        let (mempool_tx, mempool_rx) = mpsc::channel(1);
        let (store_tx, store_rx) = mpsc::channel(1);

        let index_handle = tokio::spawn(Self::index_loop(
            worker,
            Arc::clone(&state),
            Arc::clone(&store),
            config.clone(),
            index_rx,
            interrupt.clone(),
            Arc::clone(&escalate),
            Arc::clone(&fatal),
        ));
        let mempool_handle = tokio::spawn(Self::mempool_loop(
            mempool,
            Arc::clone(&state),
            config.clone(),
            mempool_rx,
            interrupt.clone(),
        ));
        let store_handle = tokio::spawn(Self::store_state_loop(
            state,
            store,
            config,
            store_rx,
            interrupt,
            escalate,
            Arc::clone(&fatal),
        ));

        Self {
            index_tx,
            mempool_tx,
            store_tx,
            handles: vec![
                ("resync-index", index_handle),
                ("resync-mempool", mempool_handle),
                ("store-state", store_handle),
            ],
            fatal,
        }
    }

    /// Requests an index resync, e.g. from a new-block push notification.
    /// Bursts collapse into a single pass.
    pub fn trigger_resync_index(&self) {
        let _ = self.index_tx.try_send(());
    }

    /// Requests a mempool resync, e.g. from a new-transaction push
    /// notification. Bursts collapse into a single pass.
    pub fn trigger_resync_mempool(&self) {
        let _ = self.mempool_tx.try_send(());
    }

    /// Requests an internal state store outside the regular period.
    pub fn trigger_store_state(&self) {
        let _ = self.store_tx.try_send(());
    }

    /// True once a loop stopped on a fatal error.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Closes the trigger channels and waits for every loop to finish its
    /// in-flight pass, up to `grace` each. Returns whether a loop had
    /// stopped on a fatal error.
    pub async fn shutdown(self, grace: Duration) -> bool {
        drop(self.index_tx);
        drop(self.mempool_tx);
        drop(self.store_tx);
        for (name, handle) in self.handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => debug!("{name} loop stopped"),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!("{name} loop panicked: {e}"),
                Err(_) => {
                    warn!("{name} loop did not stop within {grace:?}");
                }
            }
        }
        info!("resync coordinator stopped");
        self.fatal.load(Ordering::SeqCst)
    }

    /// Waits for a trigger or the next tick, then drains the burst.
    ///
    /// Returns false when the loop should stop.
    async fn wait_and_debounce(
        rx: &mut mpsc::Receiver<()>,
        ticker: &mut tokio::time::Interval,
        debounce: Duration,
        interrupt: &Interrupt,
    ) -> bool {
        tokio::select! {
            received = rx.recv() => {
                if received.is_none() {
                    return false;
                }
            }
            _ = ticker.tick() => {}
            _ = interrupt.raised() => return false,
        }
        // Collapse the burst: wait out the window, then drain.
        tokio::time::sleep(debounce).await;
        while rx.try_recv().is_ok() {}
        !interrupt.is_raised()
    }

    #[allow(clippy::too_many_arguments)]
    async fn index_loop<S: ChainSource>(
        worker: Arc<SyncWorker<S>>,
        state: Arc<InternalState>,
        store: Arc<IndexStore>,
        config: SyncConfig,
        mut rx: mpsc::Receiver<()>,
        interrupt: Interrupt,
        escalate: Arc<InterruptHandle>,
        fatal: Arc<AtomicBool>,
    ) {
        let mut ticker = interval(Duration::from_millis(config.resync_index_period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let debounce = Duration::from_millis(config.debounce_ms);
        loop {
            if !Self::wait_and_debounce(&mut rx, &mut ticker, debounce, &interrupt).await {
                break;
            }
            match worker.resync_index(None, false).await {
                Ok(()) => {}
                Err(SyncError::Interrupted) => break,
                Err(SyncError::AlreadyRunning) => {
                    debug!("index resync already in flight, trigger absorbed")
                }
                Err(e) => {
                    error!("index resync failed: {e}");
                    if e.is_consistency_violation() {
                        state.set_db_state(DbState::Inconsistent);
                        if let Err(se) =
                            tokio::task::block_in_place(|| state.store(&store))
                        {
                            error!("failed to persist inconsistent state: {se}");
                        }
                    }
                    fatal.store(true, Ordering::SeqCst);
                    escalate.raise();
                    break;
                }
            }
        }
        debug!("resync index loop exiting");
    }

    async fn mempool_loop<S: ChainSource>(
        mempool: Arc<Mempool<S>>,
        state: Arc<InternalState>,
        config: SyncConfig,
        mut rx: mpsc::Receiver<()>,
        interrupt: Interrupt,
    ) {
        let mut ticker = interval(Duration::from_millis(config.resync_mempool_period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let debounce = Duration::from_millis(config.debounce_ms);
        loop {
            if !Self::wait_and_debounce(&mut rx, &mut ticker, debounce, &interrupt).await {
                break;
            }
            match mempool.resync().await {
                Ok(count) => state.finish_mempool_sync(count),
                Err(MempoolError::Interrupted) => break,
                Err(MempoolError::AlreadyRunning) => {
                    debug!("mempool resync already in flight, trigger absorbed")
                }
                // The mempool view is reconstructible; transient faults are
                // retried on the next trigger.
                Err(e) => warn!("mempool resync failed: {e}"),
            }
        }
        debug!("resync mempool loop exiting");
    }

    async fn store_state_loop(
        state: Arc<InternalState>,
        store: Arc<IndexStore>,
        config: SyncConfig,
        mut rx: mpsc::Receiver<()>,
        interrupt: Interrupt,
        escalate: Arc<InterruptHandle>,
        fatal: Arc<AtomicBool>,
    ) {
        let mut ticker = interval(Duration::from_millis(config.store_state_period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                received = rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
                _ = interrupt.raised() => break,
            }
            if let Err(e) = tokio::task::block_in_place(|| state.store(&store)) {
                error!("periodic internal state store failed: {e}");
                fatal.store(true, Ordering::SeqCst);
                escalate.raise();
                break;
            }
        }
        debug!("store state loop exiting");
    }
}
