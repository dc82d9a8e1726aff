//! The chain source: Scribe's connection to the backing node.
//!
//! The engine only ever talks to a node through [`ChainSource`] and
//! [`ChainParser`]; per-coin protocol adapters implement these traits in
//! their own crates.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use tracing::warn;

use crate::{
    interrupt::Interrupt,
    types::{AddressDescriptor, Block, BlockHash, Height, Tx, Txid},
};

/// An error originating from the chain source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Connection-level failure. Retried with backoff up to a bound.
    #[error("transport error: {0}")]
    Transport(String),

    /// The node rejected or failed the call.
    #[error("rpc error: {0}")]
    Rpc(String),

    /// The node returned data the engine cannot interpret.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The requested block is not known to the node.
    #[error("missing block: {0}")]
    MissingBlock(String),
}

impl SourceError {
    /// True for faults worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transport(_))
    }
}

/// Capability interface to the backing node.
///
/// Implementations must be cheap to clone; the sync worker hands clones to
/// its parallel fetch tasks.
#[async_trait]
pub trait ChainSource: Clone + Send + Sync + 'static {
    /// Returns the height of the node's best block.
    async fn best_block_height(&self) -> Result<Height, SourceError>;

    /// Returns the hash of the block at `height` on the node's best chain,
    /// or `None` when the chain is shorter.
    async fn block_hash(&self, height: Height) -> Result<Option<BlockHash>, SourceError>;

    /// Returns the block at `height` on the node's best chain.
    async fn block_by_height(&self, height: Height) -> Result<Block, SourceError>;

    /// Returns the block with the given hash, if the node knows it.
    async fn block_by_hash(&self, hash: BlockHash) -> Result<Option<Block>, SourceError>;

    /// Returns a transaction by id, confirmed or from the node's mempool.
    async fn transaction(&self, txid: Txid) -> Result<Option<(Tx, Option<Height>)>, SourceError>;

    /// Returns the ids of all transactions currently in the node's mempool.
    async fn mempool_txids(&self) -> Result<Vec<Txid>, SourceError>;
}

/// Coin-specific parsing rules the core calls through a capability
/// interface.
pub trait ChainParser: Send + Sync + 'static {
    /// Derives the canonical address descriptor for an output script.
    ///
    /// `None` marks the output as unindexable (e.g. data carriers).
    fn address_descriptor(&self, script: &[u8]) -> Option<AddressDescriptor>;

    /// Contract-style sub-entries touched by a transaction.
    ///
    /// Only consulted when extended indexing is enabled.
    fn contract_descriptors(&self, _tx: &Tx) -> Vec<AddressDescriptor> {
        Vec::new()
    }
}

/// Pass-through parser treating the raw output script as the descriptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptParser;

impl ChainParser for ScriptParser {
    fn address_descriptor(&self, script: &[u8]) -> Option<AddressDescriptor> {
        if script.is_empty() {
            None
        } else {
            Some(AddressDescriptor(script.to_vec()))
        }
    }
}

/// Upper bound on retries of a transient chain source fault.
pub(crate) const SOURCE_RETRY_LIMIT: u32 = 5;

/// Runs `op` with a per-call deadline, retrying transient faults with
/// exponential backoff.
///
/// A call blocking past `timeout` fails its unit of work like a lost
/// connection would, and the interrupt is checked between attempts so a
/// shutdown is not delayed by a sleeping retry loop.
pub(crate) async fn with_backoff<T, Fut, F>(
    interrupt: &Interrupt,
    timeout: Duration,
    mut op: F,
) -> Result<T, SourceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SourceError>>,
{
    let mut delay = Duration::from_millis(200);
    let mut attempt = 0u32;
    loop {
        let outcome = match tokio::time::timeout(timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Transport(format!(
                "call exceeded the {timeout:?} deadline"
            ))),
        };
        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < SOURCE_RETRY_LIMIT && !interrupt.is_raised() => {
                attempt += 1;
                warn!("chain source call failed (attempt {attempt}): {e}; retrying in {delay:?}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = interrupt.raised() => {}
                }
                delay = (delay * 2).min(Duration::from_secs(10));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::types::{Outpoint, TxInput, TxOutput};
    use blake2::{
        digest::{Update, VariableOutput},
        Blake2bVar,
    };
    use std::sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, RwLock,
    };

    const COIN: u64 = 100_000_000;

    fn hash32(parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = Blake2bVar::new(32).unwrap();
        for part in parts {
            hasher.update(part);
        }
        let mut out = [0u8; 32];
        hasher.finalize_variable(&mut out).unwrap();
        out
    }

    pub(crate) fn mock_txid(salt: u8, height: u32, index: u32) -> Txid {
        Txid(hash32(&[
            b"tx",
            &[salt],
            &height.to_le_bytes(),
            &index.to_le_bytes(),
        ]))
    }

    pub(crate) fn mock_block_hash(salt: u8, height: u32) -> BlockHash {
        BlockHash(hash32(&[b"block", &[salt], &height.to_le_bytes()]))
    }

    pub(crate) fn mock_script(n: u32) -> Vec<u8> {
        vec![0x76, 0xa9, (n % 16) as u8]
    }

    fn coinbase_input() -> TxInput {
        TxInput {
            prevout: Outpoint {
                txid: Txid([0; 32]),
                vout: u32::MAX,
            },
        }
    }

    /// Extends `existing` (heights `0..from`) with blocks `from..=until`
    /// generated under `salt`, returning only the new blocks.
    ///
    /// Each block carries a coinbase; blocks above 0 also spend the parent
    /// block's coinbase, and every fifth block spends one of those outputs
    /// again within the same block.
    pub(crate) fn build_blocks(existing: &[Block], from: u32, until: u32, salt: u8) -> Vec<Block> {
        assert!(existing.len() as u32 >= from, "existing chain too short");
        let mut chain: Vec<Block> = existing[..from as usize].to_vec();
        let mut out = Vec::new();
        for h in from..=until {
            let prev_hash = if h == 0 {
                BlockHash::default()
            } else {
                chain[h as usize - 1].hash
            };
            let coinbase = Tx {
                txid: mock_txid(salt, h, 0),
                inputs: vec![coinbase_input()],
                outputs: vec![TxOutput {
                    value: 50 * COIN,
                    script: mock_script(h),
                }],
            };
            let mut txs = vec![coinbase];
            if h >= 1 {
                let parent_coinbase = &chain[h as usize - 1].txs[0];
                let spend = Tx {
                    txid: mock_txid(salt, h, 1),
                    inputs: vec![TxInput {
                        prevout: Outpoint {
                            txid: parent_coinbase.txid,
                            vout: 0,
                        },
                    }],
                    outputs: vec![
                        TxOutput {
                            value: 30 * COIN,
                            script: mock_script(h + 7),
                        },
                        TxOutput {
                            value: 19 * COIN,
                            script: mock_script(h + 3),
                        },
                    ],
                };
                let spend_txid = spend.txid;
                txs.push(spend);
                if h % 5 == 0 {
                    txs.push(Tx {
                        txid: mock_txid(salt, h, 2),
                        inputs: vec![TxInput {
                            prevout: Outpoint {
                                txid: spend_txid,
                                vout: 1,
                            },
                        }],
                        outputs: vec![TxOutput {
                            value: 19 * COIN,
                            script: mock_script(h + 11),
                        }],
                    });
                }
            }
            let block = Block {
                height: Height(h),
                hash: mock_block_hash(salt, h),
                prev_hash,
                time: 1_600_000_000 + h as i64 * 600,
                size: 1_000 + h,
                txs,
            };
            chain.push(block.clone());
            out.push(block);
        }
        out
    }

    /// A full chain `0..=until` under one salt.
    pub(crate) fn build_chain(until: u32, salt: u8) -> Vec<Block> {
        build_blocks(&[], 0, until, salt)
    }

    #[derive(Default)]
    struct MockChainInner {
        blocks: RwLock<Vec<Block>>,
        mempool: RwLock<Vec<Tx>>,
        fail_transport: AtomicU32,
        block_fetches: AtomicUsize,
        best_height_calls: AtomicUsize,
        fetch_delay_ms: AtomicU32,
    }

    /// A scriptable in-memory chain source for tests.
    #[derive(Clone, Default)]
    pub(crate) struct MockChain {
        inner: Arc<MockChainInner>,
    }

    impl MockChain {
        pub(crate) fn with_chain(blocks: Vec<Block>) -> Self {
            let chain = Self::default();
            *chain.inner.blocks.write().unwrap() = blocks;
            chain
        }

        pub(crate) fn blocks(&self) -> Vec<Block> {
            self.inner.blocks.read().unwrap().clone()
        }

        pub(crate) fn extend(&self, blocks: Vec<Block>) {
            self.inner.blocks.write().unwrap().extend(blocks);
        }

        /// Replaces everything from `from` upward with `new_blocks`.
        pub(crate) fn reorg(&self, from: Height, new_blocks: Vec<Block>) {
            let mut blocks = self.inner.blocks.write().unwrap();
            blocks.truncate(from.0 as usize);
            blocks.extend(new_blocks);
        }

        pub(crate) fn set_mempool(&self, txs: Vec<Tx>) {
            *self.inner.mempool.write().unwrap() = txs;
        }

        /// Makes the next `n` block fetches fail with a transport error.
        pub(crate) fn fail_next_transport(&self, n: u32) {
            self.inner.fail_transport.store(n, Ordering::SeqCst);
        }

        pub(crate) fn block_fetches(&self) -> usize {
            self.inner.block_fetches.load(Ordering::SeqCst)
        }

        /// Number of best-height polls, i.e. resync passes started.
        pub(crate) fn best_height_calls(&self) -> usize {
            self.inner.best_height_calls.load(Ordering::SeqCst)
        }

        /// Slows block fetches down, to make interleaving observable.
        pub(crate) fn set_fetch_delay_ms(&self, delay: u32) {
            self.inner.fetch_delay_ms.store(delay, Ordering::SeqCst);
        }

        fn take_fault(&self) -> Option<SourceError> {
            let remaining = self.inner.fail_transport.load(Ordering::SeqCst);
            if remaining > 0 {
                self.inner.fail_transport.store(remaining - 1, Ordering::SeqCst);
                Some(SourceError::Transport("connection reset".into()))
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl ChainSource for MockChain {
        async fn best_block_height(&self) -> Result<Height, SourceError> {
            self.inner.best_height_calls.fetch_add(1, Ordering::SeqCst);
            let blocks = self.inner.blocks.read().unwrap();
            blocks
                .last()
                .map(|b| b.height)
                .ok_or_else(|| SourceError::Rpc("empty mock chain".into()))
        }

        async fn block_hash(&self, height: Height) -> Result<Option<BlockHash>, SourceError> {
            let blocks = self.inner.blocks.read().unwrap();
            Ok(blocks.get(height.0 as usize).map(|b| b.hash))
        }

        async fn block_by_height(&self, height: Height) -> Result<Block, SourceError> {
            if let Some(fault) = self.take_fault() {
                return Err(fault);
            }
            let delay = self.inner.fetch_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay.into())).await;
            }
            self.inner.block_fetches.fetch_add(1, Ordering::SeqCst);
            let block = {
                let blocks = self.inner.blocks.read().unwrap();
                blocks.get(height.0 as usize).cloned()
            };
            block.ok_or_else(|| SourceError::MissingBlock(format!("height {height}")))
        }

        async fn block_by_hash(&self, hash: BlockHash) -> Result<Option<Block>, SourceError> {
            let blocks = self.inner.blocks.read().unwrap();
            Ok(blocks.iter().find(|b| b.hash == hash).cloned())
        }

        async fn transaction(
            &self,
            txid: Txid,
        ) -> Result<Option<(Tx, Option<Height>)>, SourceError> {
            let blocks = self.inner.blocks.read().unwrap();
            for block in blocks.iter() {
                if let Some(tx) = block.txs.iter().find(|tx| tx.txid == txid) {
                    return Ok(Some((tx.clone(), Some(block.height))));
                }
            }
            let mempool = self.inner.mempool.read().unwrap();
            Ok(mempool
                .iter()
                .find(|tx| tx.txid == txid)
                .map(|tx| (tx.clone(), None)))
        }

        async fn mempool_txids(&self) -> Result<Vec<Txid>, SourceError> {
            let mempool = self.inner.mempool.read().unwrap();
            Ok(mempool.iter().map(|tx| tx.txid).collect())
        }
    }

    #[tokio::test]
    async fn backoff_retries_transient_faults() {
        let (_handle, interrupt) = crate::interrupt::interrupt_pair();
        let chain = MockChain::with_chain(build_chain(3, 0));
        chain.fail_next_transport(2);
        let block = with_backoff(&interrupt, Duration::from_secs(5), || {
            chain.block_by_height(Height(2))
        })
        .await
        .unwrap();
        assert_eq!(block.height, Height(2));
    }

    #[tokio::test]
    async fn backoff_gives_up_past_the_bound() {
        let (_handle, interrupt) = crate::interrupt::interrupt_pair();
        let chain = MockChain::with_chain(build_chain(3, 0));
        chain.fail_next_transport(SOURCE_RETRY_LIMIT + 3);
        let err = with_backoff(&interrupt, Duration::from_secs(5), || {
            chain.block_by_height(Height(2))
        })
        .await;
        assert!(matches!(err, Err(SourceError::Transport(_))));
    }
}
