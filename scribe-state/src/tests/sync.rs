//! Sync worker, engine and coordinator tests.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tempfile::TempDir;

use crate::{
    error::SyncError,
    source::test::{build_blocks, mock_txid, build_chain, MockChain},
    state::{DbState, InternalState},
    tests::{open_test_engine, open_test_store, COIN},
    types::{Height, Outpoint},
};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_bulk_sync_fills_a_contiguous_range() {
    crate::tests::init_tracing();
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(100, 0));
    let engine = open_test_engine(dir.path(), &chain).await;

    engine.initial_sync().await.unwrap();

    let store = engine.store();
    let (tip, row) = store.tip().unwrap().unwrap();
    assert_eq!(tip, Height(100));
    assert_eq!(row.hash, chain.blocks()[100].hash);
    for height in 0..=100u32 {
        assert!(
            store.block_row(Height(height)).unwrap().is_some(),
            "missing height {height}"
        );
    }
    assert!(store.block_row(Height(101)).unwrap().is_none());

    let state = engine.state();
    assert_eq!(state.db_state(), DbState::Open);
    assert!(state.utxo_checked());
    assert!(state.sorted_address_history());
    assert!(!state.initial_sync());
    assert_eq!(state.last_block().unwrap().0, Height(100));
    assert!(state.last_mempool_sync().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn steady_state_resync_connects_and_notifies() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(10, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .callbacks()
        .register_on_new_block(Box::new(move |height, _| {
            sink.lock().unwrap().push(height.0)
        }));

    let existing = chain.blocks();
    chain.extend(build_blocks(&existing, 11, 12, 0));
    engine.worker().resync_index(None, false).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![11, 12]);
    assert_eq!(engine.store().tip().unwrap().unwrap().0, Height(12));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_with_matching_hint_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(5, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();

    let fetched_before = chain.block_fetches();
    let tip_hash = engine.store().tip().unwrap().unwrap().1.hash;
    engine
        .worker()
        .resync_index(Some(tip_hash), false)
        .await
        .unwrap();
    assert_eq!(chain.block_fetches(), fetched_before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reorganization_rolls_back_and_reconnects_without_gaps() {
    crate::tests::init_tracing();
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(50, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();

    let old_blocks = chain.blocks();
    let fork = build_blocks(&old_blocks, 45, 52, 1);
    chain.reorg(Height(45), fork.clone());

    engine.worker().resync_index(None, false).await.unwrap();

    let store = engine.store();
    let (tip, row) = store.tip().unwrap().unwrap();
    assert_eq!(tip, Height(52));
    assert_eq!(row.hash, fork.last().unwrap().hash);
    assert_eq!(
        store.block_row(Height(45)).unwrap().unwrap().hash,
        fork[0].hash
    );
    for height in 0..=52u32 {
        assert!(store.block_row(Height(height)).unwrap().is_some());
    }

    // The orphaned branch is gone: its blocks, transactions and outputs.
    assert!(store.height_of(&old_blocks[48].hash).unwrap().is_none());
    assert!(store.tx_row(&mock_txid(0, 48, 0)).unwrap().is_none());
    assert!(store
        .utxo(&Outpoint {
            txid: mock_txid(0, 48, 0),
            vout: 0,
        })
        .unwrap()
        .is_none());
    // And the fork's replacements are in place.
    assert!(store.tx_row(&mock_txid(1, 48, 0)).unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupt_mid_bulk_sync_leaves_a_consistent_prefix() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(100, 0));
    chain.set_fetch_delay_ms(10);
    let engine = open_test_engine(dir.path(), &chain).await;
    let checked_before = engine.state().utxo_checked();

    let worker = Arc::clone(engine.worker());
    let task = tokio::spawn(async move { worker.resync_index(None, true).await });

    loop {
        if let Some((tip, _)) = engine.store().tip().unwrap() {
            if tip.0 >= 10 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    engine.interrupt_handle().raise();

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SyncError::Interrupted)));

    let (tip, _) = engine.store().tip().unwrap().unwrap();
    assert!(tip.0 < 100, "sync finished before the interrupt landed");
    for height in 0..=tip.0 {
        assert!(engine.store().block_row(Height(height)).unwrap().is_some());
    }
    assert!(engine.store().block_row(Height(tip.0 + 1)).unwrap().is_none());
    assert_eq!(engine.state().utxo_checked(), checked_before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn trigger_bursts_collapse_into_one_resync() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(3, 0));
    let mut engine = open_test_engine(dir.path(), &chain).await;
    engine.spawn_sync_loops();

    let baseline = chain.best_height_calls();
    let coordinator = engine.coordinator().unwrap();
    for _ in 0..5 {
        coordinator.trigger_resync_index();
    }
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(chain.best_height_calls(), baseline + 1);
    assert_eq!(engine.store().tip().unwrap().unwrap().0, Height(3));

    let fatal = engine.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!fatal);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_index_resyncs_are_excluded() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(30, 0));
    chain.set_fetch_delay_ms(5);
    let engine = open_test_engine(dir.path(), &chain).await;

    let first = Arc::clone(engine.worker());
    let task = tokio::spawn(async move { first.resync_index(None, true).await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = engine.worker().resync_index(None, false).await;
    assert!(matches!(second, Err(SyncError::AlreadyRunning)));
    assert!(task.await.unwrap().is_ok());
    assert_eq!(engine.store().tip().unwrap().unwrap().0, Height(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn backfill_and_rollback_entry_points() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(30, 0));
    let engine = open_test_engine(dir.path(), &chain).await;

    engine.backfill(Height(0), Height(30)).await.unwrap();
    assert_eq!(engine.store().tip().unwrap().unwrap().0, Height(30));

    engine.rollback_to(Height(10)).await.unwrap();
    assert_eq!(engine.store().tip().unwrap().unwrap().0, Height(10));
    assert_eq!(engine.state().last_block().unwrap().0, Height(10));

    // A range that does not extend the tip is refused.
    let err = engine.backfill(Height(20), Height(25)).await.unwrap_err();
    assert!(matches!(err, SyncError::Consistency(_)));

    engine.backfill(Height(11), Height(30)).await.unwrap();
    assert_eq!(engine.store().tip().unwrap().unwrap().0, Height(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_persists_a_closed_state() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(5, 0));
    let mut engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();
    engine.spawn_sync_loops();

    let fatal = engine.shutdown(Duration::from_secs(2)).await.unwrap();
    assert!(!fatal);

    let store = open_test_store(dir.path());
    let state = InternalState::load(&store).unwrap();
    assert_eq!(state.db_state(), DbState::Closed);
    assert!(!state.sync_mode());
    assert!(state.utxo_checked());
    assert_eq!(state.last_block().unwrap().0, Height(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fee_stats_aggregate_over_the_window() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(20, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();

    let stats = engine
        .compute_fee_stats(Height(1), Height(20))
        .await
        .unwrap();
    // Every block pays a 1-coin fee on its spend transaction; every fifth
    // block adds a fee-free in-block spend.
    assert_eq!(stats.blocks, 20);
    assert_eq!(stats.txs, 24);
    assert_eq!(stats.total_fees, 20 * COIN);
    assert_eq!(stats.min_fee, 0);
    assert_eq!(stats.max_fee, COIN);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn column_stats_are_persisted_into_the_internal_state() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(5, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();

    let stats = engine.compute_column_stats().await.unwrap();
    assert_eq!(stats.iter().find(|c| c.name == "heights").unwrap().rows, 6);
    assert!(engine.state().db_size_total() > 0);
}
