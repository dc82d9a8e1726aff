//! The persistent index store.
//!
//! One LMDB environment, one named database per logical column family.
//! Every mutation belonging to a single block connect or disconnect is
//! applied in one write transaction, so a crash never leaves the index
//! mid-block.

use std::{
    collections::{HashMap, HashSet},
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use lmdb::{
    Cursor, Database, DatabaseFlags, Environment, EnvironmentFlags, RwTransaction,
    Transaction as _, WriteFlags,
};
use tracing::{debug, info, warn};

use scribe_common::StorageConfig;

use crate::{
    encoding::RowSerde,
    entry::{verify_raw, StoredEntry},
    error::StorageError,
    interrupt::Interrupt,
    source::ChainParser,
    types::{
        AddrHistory, AddrTxRef, AddressDescriptor, Block, BlockHash, BlockRow, ColumnStats,
        ContractRef, Height, Outpoint, TxRow, Txid, UtxoRow,
    },
};

/// Version of the on-disk schema this build reads and writes.
pub(crate) const SCHEMA_VERSION: u32 = 1;

/// Names of the column families. `metadata` carries the schema record and
/// the internal state and is exempt from the checksummed-entry framing for
/// the state key.
pub(crate) const COLUMN_NAMES: [&str; 7] = [
    "heights",
    "hashes",
    "transactions",
    "addresses",
    "utxos",
    "spenders",
    "metadata",
];

const SCHEMA_KEY: &[u8] = b"schema";
pub(crate) const STATE_KEY: &[u8] = b"internal_state";
const LOCK_FILE: &str = "scribe.lock";

/// Rows examined per batch during scan passes; also the interrupt
/// checkpoint granularity.
const SCAN_BATCH: usize = 4_096;

/// Outcome of a [`IndexStore::fix_utxos`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UtxoFixReport {
    /// Rows examined across both scan phases.
    pub scanned: u64,
    /// Rows rewritten or inserted to restore the invariant.
    pub repaired: u64,
    /// Rows deleted because no owning transaction exists.
    pub deleted: u64,
    /// Discrepancies that could not be reconciled from local data.
    pub unrecoverable: u64,
}

impl UtxoFixReport {
    /// True when the pass changed nothing.
    pub fn is_clean(&self) -> bool {
        self.repaired == 0 && self.deleted == 0 && self.unrecoverable == 0
    }
}

/// Outcome of an offline [`IndexStore::repair`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// Values examined.
    pub scanned: u64,
    /// Torn or corrupt values removed.
    pub removed: u64,
}

/// Exclusive directory lock, released on drop.
#[derive(Debug)]
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(dir: &Path) -> Result<Self, StorageError> {
        let path = dir.join(LOCK_FILE);
        if path.exists() {
            let holder = fs::read_to_string(&path).unwrap_or_default();
            let holder = holder.trim();
            if !holder.is_empty() && Path::new("/proc").join(holder).exists() {
                return Err(StorageError::Locked(format!(
                    "{} held by pid {holder}",
                    path.display()
                )));
            }
            warn!("removing stale lock file {} (pid {holder})", path.display());
            fs::remove_file(&path)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| StorageError::Locked(format!("{}: {e}", path.display())))?;
        write!(file, "{}", std::process::id())?;
        Ok(Self { path })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// The persistent, column-partitioned chain index.
pub struct IndexStore {
    env: Environment,
    heights: Database,
    hashes: Database,
    transactions: Database,
    addresses: Database,
    utxos: Database,
    spenders: Database,
    metadata: Database,
    parser: Arc<dyn ChainParser>,
    extended_index: bool,
    path: PathBuf,
    _lock: LockFile,
}

impl IndexStore {
    /// Opens (or creates) the index at the configured path.
    ///
    /// Refuses a second concurrent open of the same directory and a schema
    /// version this build does not understand.
    pub fn open(
        config: &StorageConfig,
        parser: Arc<dyn ChainParser>,
        extended_index: bool,
    ) -> Result<Self, StorageError> {
        let path = config.database.path.clone();
        if !path.exists() {
            fs::create_dir_all(&path)?;
        }
        let lock = LockFile::acquire(&path)?;
        let env = Self::open_env(config, &path)?;
        let mut dbs = Vec::with_capacity(COLUMN_NAMES.len());
        for name in COLUMN_NAMES {
            dbs.push(Self::open_or_create_db(&env, name)?);
        }
        let store = Self {
            heights: dbs[0],
            hashes: dbs[1],
            transactions: dbs[2],
            addresses: dbs[3],
            utxos: dbs[4],
            spenders: dbs[5],
            metadata: dbs[6],
            env,
            parser,
            extended_index,
            path,
            _lock: lock,
        };
        store.check_schema()?;
        info!("index store open at {}", store.path.display());
        Ok(store)
    }

    fn open_env(config: &StorageConfig, path: &Path) -> Result<Environment, StorageError> {
        let max_readers = if config.database.max_readers > 0 {
            config.database.max_readers
        } else {
            // cpu * 32, clamped; allows high async read concurrency while
            // keeping per-slot memory low.
            let cpu_cnt = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4);
            u32::try_from((cpu_cnt * 32).clamp(512, 4096)).expect("clamped to fit in u32")
        };
        Environment::new()
            .set_max_dbs(COLUMN_NAMES.len() as u32)
            .set_map_size(config.database.size.to_byte_count())
            .set_max_readers(max_readers)
            .set_flags(EnvironmentFlags::NO_TLS | EnvironmentFlags::NO_READAHEAD)
            .open(path)
            .map_err(StorageError::Lmdb)
    }

    /// Opens an LMDB database if present, else creates a new one.
    fn open_or_create_db(env: &Environment, name: &str) -> Result<Database, StorageError> {
        match env.open_db(Some(name)) {
            Ok(db) => Ok(db),
            Err(lmdb::Error::NotFound) => env
                .create_db(Some(name), DatabaseFlags::empty())
                .map_err(StorageError::Lmdb),
            Err(e) => Err(StorageError::Lmdb(e)),
        }
    }

    fn check_schema(&self) -> Result<(), StorageError> {
        let txn = self.env.begin_ro_txn()?;
        let existing = get_entry::<SchemaRow, _>(&txn, self.metadata, SCHEMA_KEY)?;
        drop(txn);
        match existing {
            Some(schema) if schema.version == SCHEMA_VERSION => Ok(()),
            Some(schema) => Err(StorageError::Schema(format!(
                "store has schema v{}, this build requires v{SCHEMA_VERSION}",
                schema.version
            ))),
            None => self.rw(|txn| {
                put_entry(
                    txn,
                    self.metadata,
                    SCHEMA_KEY,
                    SchemaRow {
                        version: SCHEMA_VERSION,
                        columns: COLUMN_NAMES.iter().map(|n| n.to_string()).collect(),
                    },
                )
            }),
        }
    }

    /// Flushes and closes the environment.
    pub fn close(&self) {
        if let Err(e) = self.env.sync(true) {
            warn!("final fsync failed: {e}");
        }
    }

    /// The directory the store lives in.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the input-spender index and contract sub-entries are kept.
    pub fn is_extended(&self) -> bool {
        self.extended_index
    }

    fn columns(&self) -> [(&'static str, Database); 7] {
        [
            ("heights", self.heights),
            ("hashes", self.hashes),
            ("transactions", self.transactions),
            ("addresses", self.addresses),
            ("utxos", self.utxos),
            ("spenders", self.spenders),
            ("metadata", self.metadata),
        ]
    }

    fn rw<T>(
        &self,
        f: impl FnOnce(&mut RwTransaction<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut txn = self.env.begin_rw_txn()?;
        let out = f(&mut txn)?;
        txn.commit()?;
        self.env.sync(true)?;
        Ok(out)
    }

    // ***** point reads *****

    /// The highest connected block, if any.
    pub fn tip(&self) -> Result<Option<(Height, BlockRow)>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        last_height_row(&txn, self.heights)
    }

    /// The block row at `height`.
    pub fn block_row(&self, height: Height) -> Result<Option<BlockRow>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        get_entry(&txn, self.heights, &height.to_key())
    }

    /// Block rows for `[from, until]` in ascending height order.
    ///
    /// Stops at the tip; the returned rows carry their heights so callers
    /// can see where a shorter-than-requested range ended.
    pub fn block_rows(
        &self,
        from: Height,
        until: Height,
    ) -> Result<Vec<(Height, BlockRow)>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.heights)?;
        let mut rows = Vec::new();
        for (key, value) in cursor.iter_from(from.to_key()) {
            let height = Height::from_key(key)?;
            if height > until {
                break;
            }
            rows.push((height, StoredEntry::<BlockRow>::from_bytes(value)?.into_inner()));
        }
        Ok(rows)
    }

    /// The height of the block with the given hash.
    pub fn height_of(&self, hash: &BlockHash) -> Result<Option<Height>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        get_entry(&txn, self.hashes, &hash.0)
    }

    /// The confirmed transaction row for `txid`.
    pub fn tx_row(&self, txid: &Txid) -> Result<Option<TxRow>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        get_entry(&txn, self.transactions, &txid.0)
    }

    /// Writes a single confirmed transaction row.
    ///
    /// Used by the transaction cache to persist chain-source fetches of
    /// confirmed transactions that predate the index.
    pub fn put_tx_row(&self, row: &TxRow) -> Result<(), StorageError> {
        let key = row.tx.txid.0;
        self.rw(|txn| put_entry(txn, self.transactions, &key, row.clone()))
    }

    /// The confirmed history of an address descriptor.
    pub fn address_history(
        &self,
        addr: &AddressDescriptor,
    ) -> Result<Option<AddrHistory>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        get_entry(&txn, self.addresses, &addr.0)
    }

    /// The UTXO-set row for an outpoint.
    pub fn utxo(&self, outpoint: &Outpoint) -> Result<Option<UtxoRow>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        get_entry(&txn, self.utxos, &outpoint.to_key())
    }

    /// The transaction that spent an outpoint, from the extended index.
    pub fn spender_of(&self, outpoint: &Outpoint) -> Result<Option<Txid>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        get_entry(&txn, self.spenders, &outpoint.to_key())
    }

    /// The address descriptor owning an outpoint, if indexed.
    pub fn addr_desc_for_outpoint(
        &self,
        outpoint: &Outpoint,
    ) -> Result<Option<AddressDescriptor>, StorageError> {
        Ok(self
            .utxo(outpoint)?
            .and_then(|row| self.parser.address_descriptor(&row.script)))
    }

    /// Raw metadata read; the internal state record lives here as JSON.
    pub(crate) fn get_metadata_raw(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.metadata, &key) {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Raw metadata write.
    pub(crate) fn put_metadata_raw(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.rw(|txn| {
            txn.put(self.metadata, &key, &value, WriteFlags::empty())?;
            Ok(())
        })
    }

    // ***** block connect / disconnect *****

    /// Connects `block` as the new tip in one atomic batch.
    ///
    /// The block **must** extend the current tip (height + 1, matching
    /// parent hash); the first connected block must be height 0.
    pub fn connect_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut txn = self.env.begin_rw_txn()?;

        match last_height_row(&txn, self.heights)? {
            Some((tip_height, tip_row)) => {
                if block.height.0 != tip_height.0 + 1 {
                    return Err(StorageError::Consistency(format!(
                        "cannot connect block at height {}; current tip is {tip_height}",
                        block.height
                    )));
                }
                if block.prev_hash != tip_row.hash {
                    return Err(StorageError::Consistency(format!(
                        "block {} at height {} does not extend local tip {}",
                        block.hash, block.height, tip_row.hash
                    )));
                }
            }
            None => {
                if block.height.0 != 0 {
                    return Err(StorageError::Consistency(format!(
                        "first connected block must be height 0, got {}",
                        block.height
                    )));
                }
            }
        }

        // Build the whole mutation set before the first write.
        let mut new_utxos: HashMap<Outpoint, UtxoRow> = HashMap::new();
        let mut marked_spent: HashMap<Outpoint, UtxoRow> = HashMap::new();
        let mut spenders: Vec<(Outpoint, Txid)> = Vec::new();
        let mut addr_refs: HashMap<AddressDescriptor, Vec<AddrTxRef>> = HashMap::new();
        let mut contract_bumps: HashMap<AddressDescriptor, Vec<AddressDescriptor>> = HashMap::new();

        for (tx_index, tx) in block.txs.iter().enumerate() {
            let txref = AddrTxRef {
                height: block.height,
                tx_index: tx_index as u32,
                txid: tx.txid,
            };
            for (vout, output) in tx.outputs.iter().enumerate() {
                let outpoint = Outpoint {
                    txid: tx.txid,
                    vout: vout as u32,
                };
                new_utxos.insert(
                    outpoint,
                    UtxoRow {
                        value: output.value,
                        script: output.script.clone(),
                        height: block.height,
                        spent: false,
                    },
                );
                if let Some(desc) = self.parser.address_descriptor(&output.script) {
                    push_ref(&mut addr_refs, desc, txref);
                }
            }
            for input in tx.inputs.iter().filter(|i| !i.is_coinbase()) {
                let outpoint = input.prevout;
                let spent_script = if let Some(row) = new_utxos.get_mut(&outpoint) {
                    // Output created and consumed within this block.
                    if row.spent {
                        return Err(StorageError::Consistency(format!(
                            "output {outpoint} spent twice in block {}",
                            block.height
                        )));
                    }
                    row.spent = true;
                    row.script.clone()
                } else {
                    if marked_spent.contains_key(&outpoint) {
                        return Err(StorageError::Consistency(format!(
                            "output {outpoint} spent twice in block {}",
                            block.height
                        )));
                    }
                    let mut row = get_entry::<UtxoRow, _>(&txn, self.utxos, &outpoint.to_key())?
                        .ok_or_else(|| {
                            StorageError::Consistency(format!(
                                "input {outpoint} of tx {} spends an unknown output",
                                tx.txid
                            ))
                        })?;
                    if row.spent {
                        return Err(StorageError::Consistency(format!(
                            "output {outpoint} already spent by an earlier block"
                        )));
                    }
                    row.spent = true;
                    let script = row.script.clone();
                    marked_spent.insert(outpoint, row);
                    script
                };
                if let Some(desc) = self.parser.address_descriptor(&spent_script) {
                    push_ref(&mut addr_refs, desc, txref);
                }
                if self.extended_index {
                    spenders.push((outpoint, tx.txid));
                }
            }
            if self.extended_index {
                let contracts = self.parser.contract_descriptors(tx);
                if !contracts.is_empty() {
                    for output in &tx.outputs {
                        if let Some(desc) = self.parser.address_descriptor(&output.script) {
                            contract_bumps
                                .entry(desc)
                                .or_default()
                                .extend(contracts.iter().cloned());
                        }
                    }
                }
            }
        }

        // Apply: address rows first (read-modify-write), then the rest.
        for (desc, refs) in addr_refs {
            let mut history =
                get_entry::<AddrHistory, _>(&txn, self.addresses, &desc.0)?.unwrap_or_default();
            for r in refs {
                history.refs.push(r);
            }
            if let Some(contracts) = contract_bumps.remove(&desc) {
                for contract in contracts {
                    bump_contract(&mut history, &contract, 1);
                }
            }
            put_entry(&mut txn, self.addresses, &desc.0, history)?;
        }
        for tx in &block.txs {
            put_entry(
                &mut txn,
                self.transactions,
                &tx.txid.0,
                TxRow {
                    height: block.height,
                    tx: tx.clone(),
                },
            )?;
        }
        for (outpoint, row) in new_utxos {
            put_entry(&mut txn, self.utxos, &outpoint.to_key(), row)?;
        }
        for (outpoint, row) in marked_spent {
            put_entry(&mut txn, self.utxos, &outpoint.to_key(), row)?;
        }
        for (outpoint, spender) in spenders {
            put_entry(&mut txn, self.spenders, &outpoint.to_key(), spender)?;
        }
        put_entry(
            &mut txn,
            self.heights,
            &block.height.to_key(),
            BlockRow {
                hash: block.hash,
                prev_hash: block.prev_hash,
                time: block.time,
                size: block.size,
                txids: block.txs.iter().map(|tx| tx.txid).collect(),
            },
        )?;
        put_entry(&mut txn, self.hashes, &block.hash.0, block.height)?;

        txn.commit()?;
        self.env.sync(true)?;
        debug!("connected block {} at height {}", block.hash, block.height);
        Ok(())
    }

    /// Disconnects the tip block, reversing every effect of its connect in
    /// one atomic batch. Returns the removed block row.
    pub fn disconnect_block(&self, height: Height) -> Result<BlockRow, StorageError> {
        let mut txn = self.env.begin_rw_txn()?;

        let (tip_height, tip_row) = last_height_row(&txn, self.heights)?.ok_or_else(|| {
            StorageError::Consistency("cannot disconnect a block from an empty index".into())
        })?;
        if height != tip_height {
            return Err(StorageError::Consistency(format!(
                "can only disconnect the tip block at {tip_height}, got {height}"
            )));
        }

        let deleted: HashSet<Txid> = tip_row.txids.iter().copied().collect();
        let mut txs = Vec::with_capacity(tip_row.txids.len());
        for txid in &tip_row.txids {
            let row = get_entry::<TxRow, _>(&txn, self.transactions, &txid.0)?.ok_or_else(|| {
                StorageError::Consistency(format!(
                    "missing transaction {txid} while disconnecting block {height}"
                ))
            })?;
            txs.push(row.tx);
        }

        let mut restored: HashMap<Outpoint, UtxoRow> = HashMap::new();
        let mut utxo_deletes: Vec<Outpoint> = Vec::new();
        let mut spender_deletes: Vec<Outpoint> = Vec::new();
        let mut addr_descs: HashSet<AddressDescriptor> = HashSet::new();
        let mut contract_bumps: HashMap<AddressDescriptor, Vec<AddressDescriptor>> = HashMap::new();

        for tx in &txs {
            for (vout, output) in tx.outputs.iter().enumerate() {
                utxo_deletes.push(Outpoint {
                    txid: tx.txid,
                    vout: vout as u32,
                });
                if let Some(desc) = self.parser.address_descriptor(&output.script) {
                    addr_descs.insert(desc);
                }
            }
            for input in tx.inputs.iter().filter(|i| !i.is_coinbase()) {
                let outpoint = input.prevout;
                if self.extended_index {
                    spender_deletes.push(outpoint);
                }
                if deleted.contains(&outpoint.txid) {
                    // Created and consumed in this block; removed with its tx.
                    continue;
                }
                let mut row = get_entry::<UtxoRow, _>(&txn, self.utxos, &outpoint.to_key())?
                    .ok_or_else(|| {
                        StorageError::Consistency(format!(
                            "missing spent output {outpoint} while disconnecting block {height}"
                        ))
                    })?;
                row.spent = false;
                if let Some(desc) = self.parser.address_descriptor(&row.script) {
                    addr_descs.insert(desc);
                }
                restored.insert(outpoint, row);
            }
            if self.extended_index {
                let contracts = self.parser.contract_descriptors(tx);
                if !contracts.is_empty() {
                    for output in &tx.outputs {
                        if let Some(desc) = self.parser.address_descriptor(&output.script) {
                            contract_bumps
                                .entry(desc)
                                .or_default()
                                .extend(contracts.iter().cloned());
                        }
                    }
                }
            }
        }

        for desc in &addr_descs {
            if let Some(mut history) = get_entry::<AddrHistory, _>(&txn, self.addresses, &desc.0)? {
                history.refs.retain(|r| r.height != height);
                if let Some(contracts) = contract_bumps.remove(desc) {
                    for contract in contracts {
                        bump_contract(&mut history, &contract, -1);
                    }
                }
                if history.is_empty() {
                    txn.del(self.addresses, &desc.0, None)?;
                } else {
                    put_entry(&mut txn, self.addresses, &desc.0, history)?;
                }
            }
        }
        for outpoint in utxo_deletes {
            match txn.del(self.utxos, &outpoint.to_key(), None) {
                Ok(()) => {}
                Err(lmdb::Error::NotFound) => {
                    return Err(StorageError::Consistency(format!(
                        "missing output {outpoint} while disconnecting block {height}"
                    )))
                }
                Err(e) => return Err(e.into()),
            }
        }
        for (outpoint, row) in restored {
            put_entry(&mut txn, self.utxos, &outpoint.to_key(), row)?;
        }
        for outpoint in spender_deletes {
            match txn.del(self.spenders, &outpoint.to_key(), None) {
                // Tolerated: the extended index may have been enabled after
                // this outpoint was spent.
                Ok(()) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }
        for txid in &tip_row.txids {
            txn.del(self.transactions, &txid.0, None)?;
        }
        txn.del(self.heights, &height.to_key(), None)?;
        txn.del(self.hashes, &tip_row.hash.0, None)?;

        txn.commit()?;
        self.env.sync(true)?;
        debug!("disconnected block {} at height {height}", tip_row.hash);
        Ok(tip_row)
    }

    // ***** repair & maintenance passes *****

    /// Reconciles the UTXO set against the confirmed transactions.
    ///
    /// Phase one validates every UTXO row against its owning transaction;
    /// phase two audits every confirmed input's spent-mark and restores
    /// missing outputs. Interruptible at batch boundaries; a second run
    /// with no intervening writes changes nothing.
    pub fn fix_utxos(&self, interrupt: &Interrupt) -> Result<UtxoFixReport, StorageError> {
        info!("checking UTXO set consistency");
        let mut report = UtxoFixReport::default();

        // Phase one: every UTXO row must match its owning transaction.
        self.scan_batched(self.utxos, interrupt, |txn, key, value, fixes| {
            report.scanned += 1;
            let Some(outpoint) = outpoint_from_key(key) else {
                fixes.push(Fix::DelUtxo(key.to_vec()));
                report.deleted += 1;
                return Ok(());
            };
            let row = match StoredEntry::<UtxoRow>::from_bytes(value) {
                Ok(entry) => entry.into_inner(),
                Err(_) => {
                    warn!("dropping undecodable UTXO row {outpoint}");
                    fixes.push(Fix::DelUtxo(key.to_vec()));
                    report.deleted += 1;
                    return Ok(());
                }
            };
            match get_entry::<TxRow, _>(txn, self.transactions, &outpoint.txid.0)? {
                None => {
                    warn!("UTXO {outpoint} has no owning transaction, deleting");
                    fixes.push(Fix::DelUtxo(key.to_vec()));
                    report.deleted += 1;
                }
                Some(tx_row) => match tx_row.tx.outputs.get(outpoint.vout as usize) {
                    None => {
                        warn!("UTXO {outpoint} is out of range, deleting");
                        fixes.push(Fix::DelUtxo(key.to_vec()));
                        report.deleted += 1;
                    }
                    Some(output) => {
                        if row.value != output.value
                            || row.script != output.script
                            || row.height != tx_row.height
                        {
                            warn!("UTXO {outpoint} disagrees with its transaction, rewriting");
                            fixes.push(Fix::PutUtxo(
                                key.to_vec(),
                                UtxoRow {
                                    value: output.value,
                                    script: output.script.clone(),
                                    height: tx_row.height,
                                    spent: row.spent,
                                },
                            ));
                            report.repaired += 1;
                        }
                    }
                },
            }
            Ok(())
        })?;

        // Phase two: audit spent-marks and restore missing outputs.
        self.scan_batched(self.transactions, interrupt, |txn, _key, value, fixes| {
            report.scanned += 1;
            let Ok(entry) = StoredEntry::<TxRow>::from_bytes(value) else {
                // Undecodable transaction rows are the repair tool's
                // business, not this pass's.
                report.unrecoverable += 1;
                return Ok(());
            };
            let tx_row = entry.into_inner();
            for (vout, output) in tx_row.tx.outputs.iter().enumerate() {
                let outpoint = Outpoint {
                    txid: tx_row.tx.txid,
                    vout: vout as u32,
                };
                let key = outpoint.to_key().to_vec();
                if get_entry::<UtxoRow, _>(txn, self.utxos, &key)?.is_none()
                    && !fixes.iter().any(|f| f.utxo_key() == Some(&key[..]))
                {
                    warn!("output {outpoint} missing from the UTXO set, restoring");
                    fixes.push(Fix::PutUtxo(
                        key,
                        UtxoRow {
                            value: output.value,
                            script: output.script.clone(),
                            height: tx_row.height,
                            spent: false,
                        },
                    ));
                    report.repaired += 1;
                }
            }
            for input in tx_row.tx.inputs.iter().filter(|i| !i.is_coinbase()) {
                let outpoint = input.prevout;
                match get_entry::<UtxoRow, _>(txn, self.utxos, &outpoint.to_key())? {
                    Some(row) if row.spent => {}
                    Some(mut row) => {
                        warn!("spent output {outpoint} marked unspent, fixing");
                        row.spent = true;
                        fixes.push(Fix::PutUtxo(outpoint.to_key().to_vec(), row));
                        report.repaired += 1;
                    }
                    None => {
                        // A fix queued earlier in this batch may already
                        // restore the row; flip its mark instead of
                        // queueing a conflicting insert.
                        let key = outpoint.to_key();
                        if let Some(Fix::PutUtxo(_, row)) = fixes
                            .iter_mut()
                            .find(|f| f.utxo_key() == Some(&key[..]))
                        {
                            if !row.spent {
                                row.spent = true;
                                report.repaired += 1;
                            }
                            continue;
                        }
                        match get_entry::<TxRow, _>(txn, self.transactions, &outpoint.txid.0)? {
                            Some(prev) => match prev.tx.outputs.get(outpoint.vout as usize) {
                                Some(prev_out) => {
                                    warn!("spent output {outpoint} missing, reconstructing");
                                    fixes.push(Fix::PutUtxo(
                                        outpoint.to_key().to_vec(),
                                        UtxoRow {
                                            value: prev_out.value,
                                            script: prev_out.script.clone(),
                                            height: prev.height,
                                            spent: true,
                                        },
                                    ));
                                    report.repaired += 1;
                                }
                                None => report.unrecoverable += 1,
                            },
                            None => {
                                warn!(
                                    "input {outpoint} of tx {} references no known transaction",
                                    tx_row.tx.txid
                                );
                                report.unrecoverable += 1;
                            }
                        }
                    }
                }
            }
            Ok(())
        })?;

        if report.is_clean() {
            info!("UTXO set consistent ({} rows scanned)", report.scanned);
        } else {
            warn!(
                "UTXO check finished: {} repaired, {} deleted, {} unrecoverable",
                report.repaired, report.deleted, report.unrecoverable
            );
        }
        Ok(report)
    }

    /// Rewrites any address row whose history is out of canonical
    /// `(height, tx index)` order. Returns the number of rows rewritten.
    pub fn sort_address_history(&self, interrupt: &Interrupt) -> Result<u64, StorageError> {
        info!("sorting address history rows");
        let mut sorted = 0u64;
        self.scan_batched(self.addresses, interrupt, |_txn, key, value, fixes| {
            let Ok(entry) = StoredEntry::<AddrHistory>::from_bytes(value) else {
                warn!("skipping undecodable address row {}", hex::encode(key));
                return Ok(());
            };
            let mut history = entry.into_inner();
            if !history.is_sorted() {
                history.refs.sort_by_key(|r| r.sort_key());
                fixes.push(Fix::PutAddr(key.to_vec(), history));
                sorted += 1;
            }
            Ok(())
        })?;
        info!("address history sort pass finished, {sorted} rows rewritten");
        Ok(sorted)
    }

    /// Computes per-column row counts and byte totals. Read-only.
    pub fn compute_column_stats(
        &self,
        interrupt: &Interrupt,
    ) -> Result<Vec<ColumnStats>, StorageError> {
        let mut stats = Vec::with_capacity(COLUMN_NAMES.len());
        for (name, db) in self.columns() {
            let mut column = ColumnStats {
                name: name.to_string(),
                ..Default::default()
            };
            let txn = self.env.begin_ro_txn()?;
            let mut cursor = txn.open_ro_cursor(db)?;
            for (key, value) in cursor.iter_start() {
                column.rows += 1;
                column.key_bytes += key.len() as u64;
                column.value_bytes += value.len() as u64;
                if column.rows % SCAN_BATCH as u64 == 0 && interrupt.is_raised() {
                    return Err(StorageError::Interrupted);
                }
            }
            stats.push(column);
        }
        Ok(stats)
    }

    /// Total size of the data file on disk.
    pub fn size_on_disk(&self) -> u64 {
        fs::metadata(self.path.join("data.mdb"))
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Offline repair: removes torn or corrupt values from every column.
    ///
    /// Operates on the raw store path without the rest of the process
    /// running; a subsequent open then scans clean.
    pub fn repair(config: &StorageConfig) -> Result<RepairReport, StorageError> {
        let path = config.database.path.clone();
        let _lock = LockFile::acquire(&path)?;
        let env = Self::open_env(config, &path)?;
        let mut report = RepairReport::default();
        info!("repairing index store at {}", path.display());

        for name in COLUMN_NAMES {
            let db = Self::open_or_create_db(&env, name)?;
            let mut bad_keys: Vec<Vec<u8>> = Vec::new();
            {
                let txn = env.begin_ro_txn()?;
                let mut cursor = txn.open_ro_cursor(db)?;
                for (key, value) in cursor.iter_start() {
                    report.scanned += 1;
                    let ok = if name == "metadata" && key == STATE_KEY {
                        serde_json::from_slice::<serde_json::Value>(value).is_ok()
                    } else {
                        verify_raw(key, value)
                    };
                    if !ok {
                        warn!(
                            "removing corrupt value in column {name}, key {}",
                            hex::encode(key)
                        );
                        bad_keys.push(key.to_vec());
                    }
                }
            }
            if !bad_keys.is_empty() {
                report.removed += bad_keys.len() as u64;
                let mut txn = env.begin_rw_txn()?;
                for key in bad_keys {
                    txn.del(db, &key, None)?;
                }
                txn.commit()?;
            }
        }
        env.sync(true)?;
        info!(
            "repair finished: {} values scanned, {} removed",
            report.scanned, report.removed
        );
        Ok(report)
    }

    /// Scans `db` in bounded batches, applying collected fixes in a write
    /// transaction between batches and checking the interrupt at each
    /// batch boundary.
    fn scan_batched(
        &self,
        db: Database,
        interrupt: &Interrupt,
        mut visit: impl FnMut(
            &lmdb::RoTransaction<'_>,
            &[u8],
            &[u8],
            &mut Vec<Fix>,
        ) -> Result<(), StorageError>,
    ) -> Result<(), StorageError> {
        let mut resume: Option<Vec<u8>> = None;
        loop {
            if interrupt.is_raised() {
                return Err(StorageError::Interrupted);
            }
            let mut fixes: Vec<Fix> = Vec::new();
            let mut last: Option<Vec<u8>> = None;
            let mut count = 0usize;
            {
                let txn = self.env.begin_ro_txn()?;
                let mut cursor = txn.open_ro_cursor(db)?;
                let iter = match &resume {
                    Some(key) => cursor.iter_from(key),
                    None => cursor.iter_start(),
                };
                for (key, value) in iter {
                    if resume.as_deref() == Some(key) {
                        continue;
                    }
                    visit(&txn, key, value, &mut fixes)?;
                    last = Some(key.to_vec());
                    count += 1;
                    if count >= SCAN_BATCH {
                        break;
                    }
                }
            }
            if !fixes.is_empty() {
                self.rw(|txn| {
                    for fix in &fixes {
                        match fix {
                            Fix::PutUtxo(key, row) => {
                                put_entry(txn, self.utxos, key, row.clone())?
                            }
                            Fix::PutAddr(key, history) => {
                                put_entry(txn, self.addresses, key, history.clone())?
                            }
                            Fix::DelUtxo(key) => match txn.del(self.utxos, key, None) {
                                Ok(()) | Err(lmdb::Error::NotFound) => {}
                                Err(e) => return Err(e.into()),
                            },
                        }
                    }
                    Ok(())
                })?;
            }
            match last {
                Some(key) if count >= SCAN_BATCH => resume = Some(key),
                _ => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
impl IndexStore {
    /// Snapshot of every data column, for byte-level comparisons.
    ///
    /// The `metadata` column is excluded: statistics and state bookkeeping
    /// are allowed to differ across otherwise equivalent stores.
    pub(crate) fn dump(
        &self,
    ) -> Result<std::collections::BTreeMap<(String, Vec<u8>), Vec<u8>>, StorageError> {
        let mut out = std::collections::BTreeMap::new();
        for (name, db) in self.columns() {
            if name == "metadata" {
                continue;
            }
            let txn = self.env.begin_ro_txn()?;
            let mut cursor = txn.open_ro_cursor(db)?;
            for (key, value) in cursor.iter_start() {
                out.insert((name.to_string(), key.to_vec()), value.to_vec());
            }
        }
        Ok(out)
    }

    /// Writes raw bytes into a column, bypassing the entry framing.
    pub(crate) fn raw_put(
        &self,
        column: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<(), StorageError> {
        let (_, db) = self
            .columns()
            .into_iter()
            .find(|(name, _)| *name == column)
            .expect("unknown column");
        self.rw(|txn| {
            txn.put(db, &key, &value, WriteFlags::empty())?;
            Ok(())
        })
    }

    /// Deletes a key from a column.
    pub(crate) fn raw_delete(&self, column: &str, key: &[u8]) -> Result<(), StorageError> {
        let (_, db) = self
            .columns()
            .into_iter()
            .find(|(name, _)| *name == column)
            .expect("unknown column");
        self.rw(|txn| {
            txn.del(db, &key, None)?;
            Ok(())
        })
    }

    /// Reads the raw bytes of one value.
    pub(crate) fn raw_get(&self, column: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let (_, db) = self
            .columns()
            .into_iter()
            .find(|(name, _)| *name == column)
            .expect("unknown column");
        let txn = self.env.begin_ro_txn()?;
        match txn.get(db, &key) {
            Ok(bytes) => Ok(Some(bytes.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// A deferred mutation collected during a scan pass.
enum Fix {
    PutUtxo(Vec<u8>, UtxoRow),
    PutAddr(Vec<u8>, AddrHistory),
    DelUtxo(Vec<u8>),
}

impl Fix {
    fn utxo_key(&self) -> Option<&[u8]> {
        match self {
            Fix::PutUtxo(key, _) | Fix::DelUtxo(key) => Some(key),
            Fix::PutAddr(..) => None,
        }
    }
}

/// Schema descriptor kept under the `schema` metadata key.
pub(crate) struct SchemaRow {
    pub(crate) version: u32,
    pub(crate) columns: Vec<String>,
}

impl RowSerde for SchemaRow {
    const VERSION: u8 = crate::encoding::version::V1;

    fn encode_body<W: core2::io::Write>(&self, w: &mut W) -> core2::io::Result<()> {
        crate::encoding::write_u32_le(&mut *w, self.version)?;
        crate::encoding::write_vec(w, &self.columns, |w, name| {
            crate::encoding::write_bytes(w, name.as_bytes())
        })
    }

    fn decode_latest<R: core2::io::Read>(r: &mut R) -> core2::io::Result<Self> {
        let version = crate::encoding::read_u32_le(&mut *r)?;
        let columns = crate::encoding::read_vec(r, |r| {
            let bytes = crate::encoding::read_bytes(r)?;
            String::from_utf8(bytes).map_err(|_| {
                core2::io::Error::new(core2::io::ErrorKind::InvalidData, "bad column name")
            })
        })?;
        Ok(SchemaRow { version, columns })
    }
}

fn push_ref(
    addr_refs: &mut HashMap<AddressDescriptor, Vec<AddrTxRef>>,
    desc: AddressDescriptor,
    txref: AddrTxRef,
) {
    let refs = addr_refs.entry(desc).or_default();
    if !refs.iter().any(|r| r.txid == txref.txid) {
        refs.push(txref);
    }
}

fn bump_contract(history: &mut AddrHistory, contract: &AddressDescriptor, delta: i32) {
    if let Some(entry) = history
        .contracts
        .iter_mut()
        .find(|c| &c.contract == contract)
    {
        if delta > 0 {
            entry.transfers += 1;
        } else {
            entry.transfers = entry.transfers.saturating_sub(1);
        }
    } else if delta > 0 {
        history.contracts.push(ContractRef {
            contract: contract.clone(),
            transfers: 1,
        });
    }
    history.contracts.retain(|c| c.transfers > 0);
}

fn outpoint_from_key(key: &[u8]) -> Option<Outpoint> {
    if key.len() != 36 {
        return None;
    }
    let txid = Txid(key[..32].try_into().ok()?);
    let vout = u32::from_be_bytes(key[32..].try_into().ok()?);
    Some(Outpoint { txid, vout })
}

fn get_entry<T: RowSerde, Txn: lmdb::Transaction>(
    txn: &Txn,
    db: Database,
    key: &[u8],
) -> Result<Option<T>, StorageError> {
    match txn.get(db, &key) {
        Ok(bytes) => Ok(Some(StoredEntry::<T>::from_bytes(bytes)?.into_inner())),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn put_entry<T: RowSerde>(
    txn: &mut RwTransaction<'_>,
    db: Database,
    key: &[u8],
    item: T,
) -> Result<(), StorageError> {
    let bytes = StoredEntry::new(key, item)?.to_bytes()?;
    txn.put(db, &key, &bytes, WriteFlags::empty())?;
    Ok(())
}

fn last_height_row<Txn: lmdb::Transaction>(
    txn: &Txn,
    heights: Database,
) -> Result<Option<(Height, BlockRow)>, StorageError> {
    let cursor = txn.open_ro_cursor(heights)?;
    match cursor.get(None, None, lmdb_sys::MDB_LAST) {
        Ok((key, value)) => {
            let key = key.ok_or_else(|| {
                StorageError::Consistency("height row returned without a key".into())
            })?;
            let height = Height::from_key(key)?;
            let row = StoredEntry::<BlockRow>::from_bytes(value)?.into_inner();
            Ok(Some((height, row)))
        }
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
