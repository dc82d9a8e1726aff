//! The synchronization state machine.
//!
//! The sync worker owns every index-mutating operation: initial bulk sync,
//! steady-state resync, parallel range connect, rollback and the repair
//! passes. Block *fetching* is parallel and unordered; every storage
//! *write* is serial and strictly height-ordered.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scribe_common::{ServiceConfig, SyncConfig};

use crate::{
    cache::TxCache,
    callbacks::CallbackRegistry,
    error::SyncError,
    interrupt::Interrupt,
    source::{with_backoff, ChainParser, ChainSource, SourceError},
    state::InternalState,
    store::{IndexStore, UtxoFixReport},
    types::{Block, BlockHash, Height},
};

/// Aggregate fee statistics over a height window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeStats {
    /// Blocks examined.
    pub blocks: u64,
    /// Non-coinbase transactions examined.
    pub txs: u64,
    /// Sum of fees in base units.
    pub total_fees: u64,
    /// Smallest fee seen.
    pub min_fee: u64,
    /// Largest fee seen.
    pub max_fee: u64,
}

/// Result of a connect pass.
enum ConnectOutcome {
    /// The requested range is fully connected.
    Done,
    /// A block at this height does not extend the local chain; the caller
    /// must roll back to a common ancestor before continuing.
    Fork(Height),
}

/// The single writer of the index.
pub struct SyncWorker<S: ChainSource> {
    store: Arc<IndexStore>,
    state: Arc<InternalState>,
    source: S,
    cache: Arc<TxCache<S>>,
    parser: Arc<dyn ChainParser>,
    callbacks: Arc<CallbackRegistry>,
    config: SyncConfig,
    rpc_timeout: Duration,
    fetch_channel_capacity: usize,
    interrupt: Interrupt,
    index_guard: tokio::sync::Mutex<()>,
}

impl<S: ChainSource> SyncWorker<S> {
    /// Creates a sync worker over shared engine handles.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<IndexStore>,
        state: Arc<InternalState>,
        source: S,
        cache: Arc<TxCache<S>>,
        parser: Arc<dyn ChainParser>,
        callbacks: Arc<CallbackRegistry>,
        config: SyncConfig,
        service: &ServiceConfig,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            store,
            state,
            source,
            cache,
            parser,
            callbacks,
            config,
            rpc_timeout: Duration::from_secs(service.timeout.into()),
            fetch_channel_capacity: (service.channel_size.max(1)) as usize,
            interrupt,
            index_guard: tokio::sync::Mutex::new(()),
        }
    }

    /// Catches the index up to the chain tip.
    ///
    /// `hint` is the hash pushed by a new-block notification; when it
    /// matches the local tip the call is a no-op. With `full_sync` the gap
    /// is connected with the parallel-fetch bulk path and no per-block
    /// callbacks fire; otherwise blocks connect sequentially and
    /// subscribers are notified per block.
    ///
    /// At most one index resync runs at a time; a concurrent call observes
    /// [`SyncError::AlreadyRunning`].
    pub async fn resync_index(
        &self,
        hint: Option<BlockHash>,
        full_sync: bool,
    ) -> Result<(), SyncError> {
        let Ok(_guard) = self.index_guard.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        self.resync_inner(hint, full_sync).await
    }

    async fn resync_inner(&self, hint: Option<BlockHash>, full_sync: bool) -> Result<(), SyncError> {
        loop {
            if self.interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }
            let local = tokio::task::block_in_place(|| self.store.tip())?;
            let remote_best = with_backoff(&self.interrupt, self.rpc_timeout, || {
                self.source.best_block_height()
            })
            .await?;

            let (tip_height, tip_hash) = match local {
                None => {
                    match self.connect_range(Height(0), remote_best).await? {
                        ConnectOutcome::Done => return Ok(()),
                        ConnectOutcome::Fork(height) => {
                            // The chain moved under the initial sync.
                            warn!("fork detected at height {height} during initial sync");
                            self.handle_fork().await?;
                            continue;
                        }
                    }
                }
                Some((height, row)) => (height, row.hash),
            };

            if hint == Some(tip_hash) {
                debug!("index already at notified block {tip_hash}");
                return Ok(());
            }

            let remote_hash = with_backoff(&self.interrupt, self.rpc_timeout, || {
                self.source.block_hash(tip_height)
            })
            .await?;
            match remote_hash {
                Some(hash) if hash == tip_hash => {
                    if remote_best.0 <= tip_height.0 {
                        debug!("index up to date at height {tip_height}");
                        return Ok(());
                    }
                    let from = Height(tip_height.0 + 1);
                    let outcome = if full_sync {
                        self.connect_range(from, remote_best).await?
                    } else {
                        self.connect_sequential(from, remote_best, tip_hash).await?
                    };
                    match outcome {
                        ConnectOutcome::Done => return Ok(()),
                        ConnectOutcome::Fork(height) => {
                            warn!("fork detected at height {height} while connecting");
                            self.handle_fork().await?;
                        }
                    }
                }
                _ => {
                    // The local tip is not on the node's best chain.
                    self.handle_fork().await?;
                }
            }
        }
    }

    /// Rolls the index back to the highest block shared with the node's
    /// best chain.
    async fn handle_fork(&self) -> Result<(), SyncError> {
        let Some((tip_height, _)) = tokio::task::block_in_place(|| self.store.tip())? else {
            return Err(SyncError::Consistency(
                "fork handling requested on an empty index".into(),
            ));
        };
        let ancestor = self.find_common_ancestor(tip_height).await?;
        warn!("chain reorganization: rolling back from {tip_height} to {ancestor}");
        self.rollback_inner(ancestor).await
    }

    async fn find_common_ancestor(&self, from: Height) -> Result<Height, SyncError> {
        for depth in 0..=self.config.max_rollback_depth {
            if self.interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }
            if depth > from.0 {
                break;
            }
            let height = Height(from.0 - depth);
            let local = tokio::task::block_in_place(|| self.store.block_row(height))?
                .ok_or_else(|| {
                    SyncError::Consistency(format!("missing local block at height {height}"))
                })?;
            let remote = with_backoff(&self.interrupt, self.rpc_timeout, || {
                self.source.block_hash(height)
            })
            .await?;
            if remote == Some(local.hash) {
                return Ok(height);
            }
        }
        Err(SyncError::Consistency(format!(
            "no common ancestor within {} blocks below {from}",
            self.config.max_rollback_depth
        )))
    }

    /// Rolls the index back so `to_height` becomes the tip.
    ///
    /// At most one index-mutating pass runs at a time; a concurrent call
    /// observes [`SyncError::AlreadyRunning`].
    pub async fn perform_rollback(&self, to_height: Height) -> Result<(), SyncError> {
        let Ok(_guard) = self.index_guard.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        info!("rolling back to height {to_height}");
        self.rollback_inner(to_height).await
    }

    async fn rollback_inner(&self, to_height: Height) -> Result<(), SyncError> {
        loop {
            if self.interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }
            let Some((tip_height, _)) = tokio::task::block_in_place(|| self.store.tip())? else {
                break;
            };
            if tip_height.0 <= to_height.0 {
                break;
            }
            let row = tokio::task::block_in_place(|| self.store.disconnect_block(tip_height))?;
            for txid in &row.txids {
                self.cache.invalidate(txid);
            }
            let tip = tokio::task::block_in_place(|| self.store.tip())?;
            self.state.set_tip(tip.map(|(height, row)| (height, row.hash)));
            info!("rolled back block {} at height {tip_height}", row.hash);
        }
        tokio::task::block_in_place(|| self.state.store(&self.store))?;
        Ok(())
    }

    /// Connects the bounded height range `[from, until]` with parallel
    /// fetch and serial, height-ordered commits.
    ///
    /// The range must extend the current tip. Mempool state is untouched.
    pub async fn connect_blocks_parallel(
        &self,
        from: Height,
        until: Height,
    ) -> Result<(), SyncError> {
        let Ok(_guard) = self.index_guard.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        match self.connect_range(from, until).await? {
            ConnectOutcome::Done => Ok(()),
            ConnectOutcome::Fork(height) => Err(SyncError::Consistency(format!(
                "block at height {height} does not extend the local chain; rollback required"
            ))),
        }
    }

    /// Parallel-fetch / serial-commit bulk connect.
    async fn connect_range(&self, from: Height, until: Height) -> Result<ConnectOutcome, SyncError> {
        if until.0 < from.0 {
            return Ok(ConnectOutcome::Done);
        }
        let last_hash = match tokio::task::block_in_place(|| self.store.tip())? {
            Some((tip_height, row)) => {
                if from.0 != tip_height.0 + 1 {
                    return Err(SyncError::Consistency(format!(
                        "range starting at {from} does not extend the tip at {tip_height}"
                    )));
                }
                Some(row.hash)
            }
            None => {
                if from.0 != 0 {
                    return Err(SyncError::Consistency(format!(
                        "range starting at {from} connected to an empty index"
                    )));
                }
                None
            }
        };

        let span = until.0 - from.0 + 1;
        let workers = (self.config.workers.max(1)).min(span) as usize;
        let chunk = self.config.chunk_size.max(1) as u64;
        info!(
            "connecting blocks {from}..{until} with {workers} fetch workers, chunk size {chunk}"
        );

        let mut receivers = Vec::with_capacity(workers);
        let mut fetchers = Vec::with_capacity(workers);
        for worker_index in 0..workers {
            let (tx, rx) =
                mpsc::channel::<(u32, Result<Block, SourceError>)>(self.fetch_channel_capacity);
            receivers.push(rx);
            let source = self.source.clone();
            let interrupt = self.interrupt.clone();
            let rpc_timeout = self.rpc_timeout;
            let stride = workers as u32;
            let mut height = from.0 + worker_index as u32;
            fetchers.push(tokio::spawn(async move {
                while height <= until.0 {
                    if interrupt.is_raised() {
                        break;
                    }
                    let result = with_backoff(&interrupt, rpc_timeout, || {
                        source.block_by_height(Height(height))
                    })
                    .await;
                    let failed = result.is_err();
                    tokio::select! {
                        sent = tx.send((height, result)) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = interrupt.raised() => break,
                    }
                    if failed {
                        break;
                    }
                    height += stride;
                }
            }));
        }

        let result = self
            .commit_in_order(&mut receivers, from, until, workers, chunk, last_hash)
            .await;

        drop(receivers);
        for fetcher in &fetchers {
            fetcher.abort();
        }
        let _ = join_all(fetchers).await;

        if result.is_ok() {
            let tip = tokio::task::block_in_place(|| self.store.tip())?;
            self.state.set_tip(tip.map(|(height, row)| (height, row.hash)));
            tokio::task::block_in_place(|| self.state.store(&self.store))?;
        }
        result
    }

    /// The serial region: commits fetched blocks in ascending height order.
    async fn commit_in_order(
        &self,
        receivers: &mut [mpsc::Receiver<(u32, Result<Block, SourceError>)>],
        from: Height,
        until: Height,
        workers: usize,
        chunk: u64,
        mut last_hash: Option<BlockHash>,
    ) -> Result<ConnectOutcome, SyncError> {
        let mut connected = 0u64;
        for height in from.0..=until.0 {
            if self.interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }
            let lane = ((height - from.0) as usize) % workers;
            let (fetched_height, fetched) = match receivers[lane].recv().await {
                Some(item) => item,
                None => {
                    return if self.interrupt.is_raised() {
                        Err(SyncError::Interrupted)
                    } else {
                        Err(SyncError::Source(SourceError::Rpc(
                            "block fetch worker exited unexpectedly".into(),
                        )))
                    };
                }
            };
            let block = fetched?;
            if fetched_height != height || block.height.0 != height {
                return Err(SyncError::Consistency(format!(
                    "fetch worker returned height {fetched_height}, expected {height}"
                )));
            }
            if let Some(last) = last_hash {
                if block.prev_hash != last {
                    return Ok(ConnectOutcome::Fork(Height(height)));
                }
            }
            tokio::task::block_in_place(|| self.store.connect_block(&block))?;
            last_hash = Some(block.hash);
            self.state.set_tip(Some((block.height, block.hash)));
            connected += 1;
            if connected % chunk == 0 {
                tokio::task::block_in_place(|| self.state.store(&self.store))?;
                info!(
                    "connected {connected} of {} blocks, height {height}",
                    until.0 - from.0 + 1
                );
            }
        }
        Ok(ConnectOutcome::Done)
    }

    /// Steady-state connect: sequential fetches, per-block callbacks.
    async fn connect_sequential(
        &self,
        from: Height,
        until: Height,
        mut last_hash: BlockHash,
    ) -> Result<ConnectOutcome, SyncError> {
        for height in from.0..=until.0 {
            if self.interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }
            let block = with_backoff(&self.interrupt, self.rpc_timeout, || {
                self.source.block_by_height(Height(height))
            })
            .await?;
            if block.prev_hash != last_hash {
                return Ok(ConnectOutcome::Fork(Height(height)));
            }
            tokio::task::block_in_place(|| self.store.connect_block(&block))?;
            last_hash = block.hash;
            self.state.set_tip(Some((block.height, block.hash)));
            info!("connected block {} at height {height}", block.hash);

            self.callbacks.fire_new_block(block.height, &block.hash);
            for tx in &block.txs {
                let mut seen = Vec::new();
                for output in &tx.outputs {
                    if let Some(desc) = self.parser.address_descriptor(&output.script) {
                        if !seen.contains(&desc) {
                            self.callbacks.fire_new_tx_addr(tx, &desc);
                            seen.push(desc);
                        }
                    }
                }
            }
        }
        tokio::task::block_in_place(|| self.state.store(&self.store))?;
        Ok(ConnectOutcome::Done)
    }

    // ***** repair & statistics passes *****

    /// Runs the UTXO consistency check-and-repair pass.
    pub async fn fix_utxos(&self) -> Result<UtxoFixReport, SyncError> {
        let Ok(_guard) = self.index_guard.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        let report = tokio::task::block_in_place(|| self.store.fix_utxos(&self.interrupt))?;
        Ok(report)
    }

    /// Runs the address history sort pass.
    pub async fn sort_address_history(&self) -> Result<u64, SyncError> {
        let Ok(_guard) = self.index_guard.try_lock() else {
            return Err(SyncError::AlreadyRunning);
        };
        let sorted =
            tokio::task::block_in_place(|| self.store.sort_address_history(&self.interrupt))?;
        Ok(sorted)
    }

    /// Computes per-block fee statistics over `[from, until]`.
    ///
    /// Read-only; individually unresolvable inputs are logged and skipped,
    /// never silently ignored in aggregate counts.
    pub async fn compute_fee_stats(
        &self,
        from: Height,
        until: Height,
    ) -> Result<FeeStats, SyncError> {
        let mut stats = FeeStats {
            min_fee: u64::MAX,
            ..Default::default()
        };
        for height in from.0..=until.0 {
            if self.interrupt.is_raised() {
                return Err(SyncError::Interrupted);
            }
            let height = Height(height);
            let Some(row) = tokio::task::block_in_place(|| self.store.block_row(height))? else {
                return Err(SyncError::Consistency(format!(
                    "height {height} is not in the index"
                )));
            };
            stats.blocks += 1;
            'txs: for txid in &row.txids {
                let Some(tx_row) = tokio::task::block_in_place(|| self.store.tx_row(txid))? else {
                    warn!("transaction {txid} of block {height} missing, skipping");
                    continue;
                };
                let tx = tx_row.tx;
                if tx.inputs.iter().all(|i| i.is_coinbase()) {
                    continue;
                }
                let mut input_value = 0u64;
                for input in tx.inputs.iter().filter(|i| !i.is_coinbase()) {
                    let prevout = input.prevout;
                    let value = match tokio::task::block_in_place(|| self.store.utxo(&prevout))? {
                        Some(utxo) => utxo.value,
                        None => {
                            match self
                                .cache
                                .get_transaction(&prevout.txid, &self.interrupt)
                                .await?
                            {
                                Some(prev_tx) => {
                                    match prev_tx.outputs.get(prevout.vout as usize) {
                                        Some(output) => output.value,
                                        None => {
                                            warn!("input {prevout} of {txid} out of range, skipping tx");
                                            continue 'txs;
                                        }
                                    }
                                }
                                None => {
                                    warn!("input {prevout} of {txid} unresolvable, skipping tx");
                                    continue 'txs;
                                }
                            }
                        }
                    };
                    input_value += value;
                }
                let fee = input_value.saturating_sub(tx.output_value());
                stats.txs += 1;
                stats.total_fees += fee;
                stats.min_fee = stats.min_fee.min(fee);
                stats.max_fee = stats.max_fee.max(fee);
            }
        }
        if stats.txs == 0 {
            stats.min_fee = 0;
        }
        info!(
            "fee stats for {from}..{until}: {} txs, total {} (min {}, max {})",
            stats.txs, stats.total_fees, stats.min_fee, stats.max_fee
        );
        Ok(stats)
    }
}
