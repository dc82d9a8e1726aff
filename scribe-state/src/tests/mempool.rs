//! Mempool and transaction cache tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tempfile::TempDir;

use crate::{
    source::test::{build_blocks, build_chain, mock_script, mock_txid, MockChain},
    tests::{open_test_engine, test_config, COIN},
    types::{AddressDescriptor, Height, Outpoint, Tx, TxInput, TxOutput, Txid},
    Engine, ScriptParser,
};

/// An unconfirmed transaction spending the (never otherwise consumed)
/// first output of `spend_height`'s in-block spend transaction.
fn mempool_tx(tag: u8, spend_height: u32) -> Tx {
    Tx {
        txid: mock_txid(9, 1_000 + tag as u32, 0),
        inputs: vec![TxInput {
            prevout: Outpoint {
                txid: mock_txid(0, spend_height, 1),
                vout: 0,
            },
        }],
        outputs: vec![TxOutput {
            value: 29 * COIN,
            script: vec![0xAB, tag],
        }],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mempool_resync_adds_and_drops_transactions() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(10, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();

    let new_txs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&new_txs);
    engine
        .callbacks()
        .register_on_new_tx(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    let addr_events: Arc<std::sync::Mutex<Vec<AddressDescriptor>>> = Arc::default();
    let sink = Arc::clone(&addr_events);
    engine
        .callbacks()
        .register_on_new_tx_addr(Box::new(move |_, addr| {
            sink.lock().unwrap().push(addr.clone());
        }));

    let m1 = mempool_tx(1, 8);
    let m2 = mempool_tx(2, 9);
    chain.set_mempool(vec![m1.clone(), m2.clone()]);

    let count = engine.mempool().resync().await.unwrap();
    assert_eq!(count, 2);
    assert!(engine.mempool().contains(&m1.txid));
    assert!(engine.mempool().contains(&m2.txid));
    assert_eq!(new_txs.load(Ordering::SeqCst), 2);

    // Address events cover the paid output and the funding input.
    let events = addr_events.lock().unwrap().clone();
    assert!(events.contains(&AddressDescriptor(vec![0xAB, 1])));
    assert!(events.contains(&AddressDescriptor(mock_script(8 + 7))));

    let entry = engine.mempool().get(&m1.txid).unwrap();
    assert_eq!(entry.tx.txid, m1.txid);
    assert!(entry
        .addrs
        .contains(&AddressDescriptor(mock_script(8 + 7))));

    // m1 leaves the mempool (e.g. confirmed); a resync drops it and adds
    // nothing new.
    chain.set_mempool(vec![m2.clone()]);
    let count = engine.mempool().resync().await.unwrap();
    assert_eq!(count, 1);
    assert!(!engine.mempool().contains(&m1.txid));
    assert_eq!(new_txs.load(Ordering::SeqCst), 2);

    // Lookup by address sees the remaining unconfirmed transaction.
    let by_addr = engine
        .mempool()
        .transactions_for(&AddressDescriptor(vec![0xAB, 2]));
    assert_eq!(by_addr.len(), 1);
    assert_eq!(by_addr[0].txid, m2.txid);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mempool_resync_runs_concurrently_with_index_resync() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(10, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();

    chain.set_fetch_delay_ms(5);
    let existing = chain.blocks();
    chain.extend(build_blocks(&existing, 11, 20, 0));
    chain.set_mempool(vec![mempool_tx(1, 8), mempool_tx(2, 9)]);

    let worker = Arc::clone(engine.worker());
    let mempool = Arc::clone(engine.mempool());
    let (index_result, mempool_result) = tokio::join!(
        tokio::spawn(async move { worker.resync_index(None, false).await }),
        tokio::spawn(async move { mempool.resync().await }),
    );
    index_result.unwrap().unwrap();
    assert_eq!(mempool_result.unwrap().unwrap(), 2);

    assert_eq!(engine.store().tip().unwrap().unwrap().0, Height(20));
    assert_eq!(engine.mempool().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cache_reads_through_store_and_source() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(5, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();
    let interrupt = engine.interrupt();

    // Confirmed transaction: store fallback, then cached.
    let confirmed = mock_txid(0, 3, 1);
    let tx = engine
        .cache()
        .get_transaction(&confirmed, &interrupt)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.txid, confirmed);
    assert!(engine.cache().len() >= 1);

    // Unconfirmed transaction: source fallback, then cached.
    let m1 = mempool_tx(1, 4);
    chain.set_mempool(vec![m1.clone()]);
    let fetched = engine
        .cache()
        .get_transaction(&m1.txid, &interrupt)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fetched.txid, m1.txid);
    let cached_len = engine.cache().len();

    engine.cache().invalidate(&m1.txid);
    assert_eq!(engine.cache().len(), cached_len - 1);

    // Unknown transaction: a clean miss.
    let missing = engine
        .cache()
        .get_transaction(&Txid([0xEE; 32]), &interrupt)
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_cache_still_serves_lookups() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(5, 0));
    let mut config = test_config(dir.path());
    config.disable_tx_cache = true;
    let engine = Engine::open(config, chain.clone(), Arc::new(ScriptParser))
        .await
        .unwrap();
    engine.initial_sync().await.unwrap();

    assert!(!engine.cache().is_enabled());
    let confirmed = mock_txid(0, 3, 1);
    let tx = engine
        .cache()
        .get_transaction(&confirmed, &engine.interrupt())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.txid, confirmed);
    assert_eq!(engine.cache().len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_evicts_orphaned_transactions_from_the_cache() {
    let dir = TempDir::new().unwrap();
    let chain = MockChain::with_chain(build_chain(10, 0));
    let engine = open_test_engine(dir.path(), &chain).await;
    engine.initial_sync().await.unwrap();
    let interrupt = engine.interrupt();

    // Warm the cache with a transaction from the soon-orphaned range.
    let orphaned = mock_txid(0, 9, 1);
    engine
        .cache()
        .get_transaction(&orphaned, &interrupt)
        .await
        .unwrap()
        .unwrap();
    let warm = engine.cache().len();

    engine.rollback_to(Height(8)).await.unwrap();
    assert!(engine.cache().len() < warm);
    assert!(engine.store().tx_row(&orphaned).unwrap().is_none());

    // A fresh lookup no longer sees the orphaned transaction anywhere:
    // the store dropped it and the node reorged past it.
    chain.reorg(Height(9), Vec::new());
    let gone = engine
        .cache()
        .get_transaction(&orphaned, &interrupt)
        .await
        .unwrap();
    assert!(gone.is_none(), "orphaned transaction served after rollback");
}
