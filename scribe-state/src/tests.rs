//! Engine unit tests, driven by the scriptable mock chain source.

pub(crate) mod mempool;
pub(crate) mod sync;

use std::{path::Path, sync::Arc};

use scribe_common::{CacheConfig, DatabaseConfig, DatabaseSize, ServiceConfig, StorageConfig, SyncConfig};

use crate::{
    source::test::MockChain, store::IndexStore, Engine, EngineConfig, ScriptParser,
};

pub(crate) const COIN: u64 = 100_000_000;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .try_init();
}

/// Engine configuration sized for tests: small chunks, fast debounce,
/// periods long enough that only explicit triggers fire.
pub(crate) fn test_config(dir: &Path) -> EngineConfig {
    EngineConfig {
        storage: StorageConfig {
            cache: CacheConfig::default(),
            database: DatabaseConfig {
                path: dir.to_path_buf(),
                size: DatabaseSize::Gb(1),
                max_readers: 0,
            },
        },
        service: ServiceConfig::default(),
        sync: SyncConfig {
            chunk_size: 10,
            workers: 4,
            resync_index_period_ms: 3_600_000,
            resync_mempool_period_ms: 3_600_000,
            store_state_period_ms: 3_600_000,
            debounce_ms: 50,
            max_rollback_depth: 100,
        },
        extended_index: false,
        disable_tx_cache: false,
    }
}

pub(crate) fn open_test_store(dir: &Path) -> IndexStore {
    IndexStore::open(&test_config(dir).storage, Arc::new(ScriptParser), false)
        .expect("test store open")
}

pub(crate) async fn open_test_engine(dir: &Path, chain: &MockChain) -> Engine<MockChain> {
    Engine::open(test_config(dir), chain.clone(), Arc::new(ScriptParser))
        .await
        .expect("test engine open")
}
