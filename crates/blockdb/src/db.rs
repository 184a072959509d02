//! The database multiplexer.
//!
//! `BlockDb` owns the environments behind the five logical sub-databases
//! and exposes typed put/get for every stored entity. Reads go straight
//! to the store; mutations are appended to a `WriteBatch` and become
//! visible atomically per environment when the batch is committed. The
//! headers environment commits last, so the top-block pointer in its
//! DBInfo record is the point of linearization for readers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use cairn_log::{log_info, log_warn};
use cairn_primitives::block::Block;
use cairn_primitives::encoding::DecodeError;
use cairn_primitives::script::{is_multisig, multisig_participants, ScrAddr};
use cairn_primitives::transaction::{Transaction, TxOut};
use cairn_primitives::{Hash256, ZERO_HASH};
use cairn_storage::memory::MemoryStore;
use cairn_storage::{Column, KeyValueStore, Store, StoreError, WriteBatch};

use crate::config::{Backend, DbConfig, DbMode};
use crate::dbinfo::{StoredDbInfo, NO_TOP_HEIGHT};
use crate::header::{StoredHeadHgtList, StoredHeader};
use crate::hints::StoredTxHints;
use crate::history::{StoredScriptHistory, StoredSubHistory, TxioEntry, TxioKind};
use crate::iter::DbIter;
use crate::schema;
use crate::schema::{DbPrefix, DUP_VALID, MAX_HEIGHT};
use crate::tx::{Spentness, StoredTx, StoredTxOut};
use crate::undo::StoredUndoData;

#[derive(Debug)]
pub enum DbError {
    Store(StoreError),
    Decode(DecodeError),
    /// Schema or magic mismatch, truncated value, invalid prefix.
    Corrupt(&'static str),
    /// A structural invariant would be violated by the operation.
    Invariant(&'static str),
    Config(&'static str),
    NotOpen,
    Io(std::io::Error),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::Store(err) => write!(f, "{err}"),
            DbError::Decode(err) => write!(f, "corrupt record: {err}"),
            DbError::Corrupt(message) => write!(f, "corrupt database: {message}"),
            DbError::Invariant(message) => write!(f, "invariant violation: {message}"),
            DbError::Config(message) => write!(f, "bad configuration: {message}"),
            DbError::NotOpen => write!(f, "databases are not open"),
            DbError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<StoreError> for DbError {
    fn from(err: StoreError) -> Self {
        DbError::Store(err)
    }
}

impl From<DecodeError> for DbError {
    fn from(err: DecodeError) -> Self {
        DbError::Decode(err)
    }
}

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        DbError::Io(err)
    }
}

/// Commit order: data environments first, headers last. A reader that
/// observes the new top in the headers DBInfo therefore observes every
/// supporting record.
const COMMIT_ORDER: [Column; 5] = [
    Column::Txhints,
    Column::History,
    Column::Spentness,
    Column::Blkdata,
    Column::Headers,
];

pub struct BlockDb {
    config: DbConfig,
    envs: [Option<Arc<Store>>; 5],
    valid_dup_by_height: RwLock<HashMap<u32, u8>>,
    registered_scripts: RwLock<BTreeMap<ScrAddr, u32>>,
}

impl BlockDb {
    // ------------------------------------------------------------------
    // Open / close / destroy
    // ------------------------------------------------------------------

    /// Open the four-environment layout used by every non-supernode mode:
    /// `basedir/{blocks,headers,history,txhints}`, with undo data sharing
    /// the blocks environment.
    pub fn open_databases(config: DbConfig) -> Result<Self, DbError> {
        if config.db_mode == DbMode::Super {
            return Err(DbError::Config(
                "supernode mode requires open_databases_supernode",
            ));
        }
        Self::open_with_layout(config)
    }

    /// Open the folded layout: `basedir/{blocks,headers}`, everything
    /// non-header sharing the blocks environment under its key prefixes.
    pub fn open_databases_supernode(config: DbConfig) -> Result<Self, DbError> {
        if config.db_mode != DbMode::Super {
            return Err(DbError::Config(
                "open_databases_supernode requires supernode mode",
            ));
        }
        Self::open_with_layout(config)
    }

    fn layout(mode: DbMode) -> Vec<(&'static str, Vec<Column>)> {
        if mode == DbMode::Super {
            vec![
                ("headers", vec![Column::Headers]),
                ("blocks", vec![Column::Blkdata]),
            ]
        } else {
            vec![
                ("headers", vec![Column::Headers]),
                ("blocks", vec![Column::Blkdata, Column::Spentness]),
                ("history", vec![Column::History]),
                ("txhints", vec![Column::Txhints]),
            ]
        }
    }

    fn open_with_layout(config: DbConfig) -> Result<Self, DbError> {
        if !config.is_network_selected() {
            return Err(DbError::Config("no network selected"));
        }
        fs::create_dir_all(&config.base_dir)?;

        let mut envs: [Option<Arc<Store>>; 5] = Default::default();
        for (dir, columns) in Self::layout(config.db_mode) {
            let path = config.base_dir.join(dir);
            let store = match config.backend {
                Backend::Memory => Store::Memory(MemoryStore::new()),
                #[cfg(feature = "fjall")]
                Backend::Fjall => Store::Fjall(cairn_storage::fjall::FjallStore::open(
                    &path, &columns,
                )?),
                #[cfg(not(feature = "fjall"))]
                Backend::Fjall => {
                    return Err(DbError::Config("built without the fjall backend"))
                }
            };
            let store = Arc::new(store);
            for column in columns {
                envs[column.index()] = Some(Arc::clone(&store));
            }
        }

        let db = Self {
            config,
            envs,
            valid_dup_by_height: RwLock::new(HashMap::new()),
            registered_scripts: RwLock::new(BTreeMap::new()),
        };

        for column in db.hosted_columns() {
            db.check_or_init_db_info(column)?;
        }
        log_info!(
            "opened block databases at {} ({:?} mode)",
            db.config.base_dir.display(),
            db.config.db_mode
        );
        Ok(db)
    }

    fn hosted_columns(&self) -> Vec<Column> {
        if self.config.db_mode == DbMode::Super {
            vec![Column::Headers, Column::Blkdata]
        } else {
            Column::ALL.to_vec()
        }
    }

    fn check_or_init_db_info(&self, db: Column) -> Result<(), DbError> {
        match self.get_stored_db_info(db)? {
            None => {
                let info = StoredDbInfo::fresh(&self.config)
                    .ok_or(DbError::Config("no network selected"))?;
                self.put_stored_db_info(db, &info)
            }
            Some(info) => {
                let magic = self.config.magic_bytes.expect("validated at open");
                if info.magic != magic {
                    return Err(DbError::Corrupt("network magic mismatch"));
                }
                if info.db_mode != self.config.db_mode {
                    return Err(DbError::Corrupt("deployment mode mismatch"));
                }
                Ok(())
            }
        }
    }

    pub fn databases_are_open(&self) -> bool {
        self.envs.iter().any(Option::is_some)
    }

    /// Idempotent: closing an already-closed set of databases is a no-op.
    pub fn close_databases(&mut self) {
        self.envs = Default::default();
        self.valid_dup_by_height.write().expect("dup lock").clear();
    }

    /// Delete every record in the headers environment and re-seed its
    /// DBInfo, so the header chain can be rebuilt from scratch.
    pub fn nuke_headers_db(&self) -> Result<(), DbError> {
        let keys: Vec<Vec<u8>> = self
            .scan(Column::Headers, &[])?
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let mut batch = WriteBatch::new();
        for key in keys {
            self.delete_value(&mut batch, Column::Headers, &key);
        }
        self.commit_batch(batch)?;
        self.clear_dup_cache();
        let info =
            StoredDbInfo::fresh(&self.config).ok_or(DbError::Config("no network selected"))?;
        self.put_stored_db_info(Column::Headers, &info)
    }

    /// Tear everything down and reopen fresh.
    pub fn destroy_and_reset_databases(&mut self) -> Result<(), DbError> {
        let config = self.config.clone();
        self.close_databases();
        for (dir, _) in Self::layout(config.db_mode) {
            let path: PathBuf = config.base_dir.join(dir);
            match fs::remove_dir_all(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(DbError::Io(err)),
            }
        }
        log_warn!("destroyed block databases at {}", config.base_dir.display());
        *self = Self::open_with_layout(config)?;
        Ok(())
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn db_mode(&self) -> DbMode {
        self.config.db_mode
    }

    // ------------------------------------------------------------------
    // Routing and raw access
    // ------------------------------------------------------------------

    /// Supernode folding: everything non-header resolves to `Blkdata`.
    pub fn db_select(&self, db: Column) -> Column {
        if db == Column::Headers {
            Column::Headers
        } else if self.config.db_mode == DbMode::Super {
            Column::Blkdata
        } else {
            db
        }
    }

    fn env(&self, db: Column) -> Result<(&Arc<Store>, Column), DbError> {
        let routed = self.db_select(db);
        self.envs[routed.index()]
            .as_ref()
            .map(|store| (store, routed))
            .ok_or(DbError::NotOpen)
    }

    pub fn get_iterator(&self, db: Column) -> Result<DbIter, DbError> {
        let (store, routed) = self.env(db)?;
        Ok(DbIter::new(Arc::clone(store), routed))
    }

    fn get_value(&self, db: Column, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        let (store, routed) = self.env(db)?;
        Ok(store.get(routed, key)?)
    }

    /// Point lookup that observes the pending batch before the store, so
    /// a multi-block write transaction reads its own writes.
    fn get_value_through(
        &self,
        batch: Option<&WriteBatch>,
        db: Column,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, DbError> {
        if let Some(batch) = batch {
            let routed = self.db_select(db);
            if let Some(pending) = batch.pending_get(routed, key) {
                return Ok(pending.map(<[u8]>::to_vec));
            }
        }
        self.get_value(db, key)
    }

    fn put_value(&self, batch: &mut WriteBatch, db: Column, key: &[u8], value: Vec<u8>) {
        batch.put(self.db_select(db), key, value);
    }

    fn delete_value(&self, batch: &mut WriteBatch, db: Column, key: &[u8]) {
        batch.delete(self.db_select(db), key);
    }

    fn scan(&self, db: Column, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let (store, routed) = self.env(db)?;
        Ok(store.scan_prefix(routed, prefix)?)
    }

    /// Commit the batch, one environment at a time in `COMMIT_ORDER`.
    /// Consuming the batch is what makes a partial commit unrepresentable.
    pub fn commit_batch(&self, batch: WriteBatch) -> Result<(), DbError> {
        let mut per_column: [WriteBatch; 5] = Default::default();
        for op in batch.into_ops() {
            match op {
                cairn_storage::WriteOp::Put { column, key, value } => {
                    per_column[column.index()].put(column, key.as_slice(), value.as_slice());
                }
                cairn_storage::WriteOp::Delete { column, key } => {
                    per_column[column.index()].delete(column, key.as_slice());
                }
            }
        }
        for column in COMMIT_ORDER {
            let pending = &per_column[column.index()];
            if pending.is_empty() {
                continue;
            }
            let (store, routed) = self.env(column)?;
            debug_assert_eq!(routed, column, "batch ops must be pre-routed");
            store.write_batch(pending)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // DBInfo
    // ------------------------------------------------------------------

    pub fn put_stored_db_info(&self, db: Column, info: &StoredDbInfo) -> Result<(), DbError> {
        let (store, routed) = self.env(db)?;
        Ok(store.put(routed, &schema::db_info_key(), &info.serialize())?)
    }

    pub fn get_stored_db_info(&self, db: Column) -> Result<Option<StoredDbInfo>, DbError> {
        match self.get_value(db, &schema::db_info_key())? {
            Some(bytes) => Ok(Some(StoredDbInfo::parse(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_top_block_height(&self, db: Column) -> Result<u32, DbError> {
        Ok(self
            .get_stored_db_info(db)?
            .map(|info| info.top_block_height)
            .unwrap_or(NO_TOP_HEIGHT))
    }

    pub fn get_top_block_hash(&self, db: Column) -> Result<Hash256, DbError> {
        Ok(self
            .get_stored_db_info(db)?
            .map(|info| info.top_block_hash)
            .unwrap_or(ZERO_HASH))
    }

    /// Refresh the top pointer in every hosted sub-database. Always the
    /// last logical step of a block-ingest batch; the headers copy lands
    /// last by commit order.
    pub fn update_top_block(&self, batch: &mut WriteBatch, height: u32, hash: Hash256) {
        let Some(mut info) = StoredDbInfo::fresh(&self.config) else {
            return;
        };
        info.top_block_height = height;
        info.top_block_hash = hash;
        let serialized = info.serialize();
        for column in self.hosted_columns() {
            self.put_value(batch, column, &schema::db_info_key(), serialized.clone());
        }
    }

    // ------------------------------------------------------------------
    // Duplicate-height resolution
    // ------------------------------------------------------------------

    pub fn get_valid_dup_id_for_height(&self, height: u32) -> Result<Option<u8>, DbError> {
        self.valid_dup_through(None, height)
    }

    fn valid_dup_through(
        &self,
        batch: Option<&WriteBatch>,
        height: u32,
    ) -> Result<Option<u8>, DbError> {
        if let Some(dup) = self
            .valid_dup_by_height
            .read()
            .expect("dup lock")
            .get(&height)
        {
            return Ok(Some(*dup));
        }
        let Some(list) = self.head_hgt_list_through(batch, height)? else {
            return Ok(None);
        };
        if let Some(dup) = list.valid_dup {
            self.valid_dup_by_height
                .write()
                .expect("dup lock")
                .insert(height, dup);
        }
        Ok(list.valid_dup)
    }

    /// Mark `dup` valid at `height`. With `overwrite` false the call is a
    /// no-op when some dup is already valid there.
    pub fn set_valid_dup_id_for_height(
        &self,
        batch: &mut WriteBatch,
        height: u32,
        dup: u8,
        overwrite: bool,
    ) -> Result<(), DbError> {
        let mut list = self
            .head_hgt_list_through(Some(&*batch), height)?
            .ok_or(DbError::Invariant("no headers stored at height"))?;
        if list.valid_dup == Some(dup) {
            return Ok(());
        }
        if list.valid_dup.is_some() && !overwrite {
            return Ok(());
        }
        if !list.entries.iter().any(|entry| entry.dup_id == dup) {
            return Err(DbError::Invariant("dup id not present at height"));
        }
        list.valid_dup = Some(dup);
        self.put_stored_head_hgt_list(batch, &list);
        self.valid_dup_by_height
            .write()
            .expect("dup lock")
            .insert(height, dup);
        Ok(())
    }

    pub fn get_dup_for_block_hash(&self, hash: &Hash256) -> Result<Option<u8>, DbError> {
        Ok(self.get_bare_header_by_hash(hash)?.map(|sbh| sbh.dup_id))
    }

    /// Warm the dup cache from the HEADHGT mirror.
    pub fn load_valid_dup_cache(&self) -> Result<(), DbError> {
        let entries = self.scan(Column::Headers, &[DbPrefix::HeadHgt.byte()])?;
        let mut cache = self.valid_dup_by_height.write().expect("dup lock");
        cache.clear();
        for (key, value) in entries {
            let Some(height) = schema::parse_head_hgt_key(&key) else {
                return Err(DbError::Corrupt("malformed HEADHGT key"));
            };
            let list = StoredHeadHgtList::parse(height, &value)?;
            if let Some(dup) = list.valid_dup {
                cache.insert(height, dup);
            }
        }
        Ok(())
    }

    /// Drop the cache; it reloads lazily from the authoritative mirror.
    /// Called after an abandoned batch may have left it ahead of disk.
    pub fn clear_dup_cache(&self) {
        self.valid_dup_by_height.write().expect("dup lock").clear();
    }

    fn head_hgt_list_through(
        &self,
        batch: Option<&WriteBatch>,
        height: u32,
    ) -> Result<Option<StoredHeadHgtList>, DbError> {
        match self.get_value_through(batch, Column::Headers, &schema::head_hgt_key(height))? {
            Some(bytes) => Ok(Some(StoredHeadHgtList::parse(height, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_stored_head_hgt_list(
        &self,
        height: u32,
    ) -> Result<Option<StoredHeadHgtList>, DbError> {
        self.head_hgt_list_through(None, height)
    }

    pub fn put_stored_head_hgt_list(&self, batch: &mut WriteBatch, list: &StoredHeadHgtList) {
        self.put_value(
            batch,
            Column::Headers,
            &schema::head_hgt_key(list.height),
            list.serialize(),
        );
    }

    // ------------------------------------------------------------------
    // Headers
    // ------------------------------------------------------------------

    /// Write the bare header record, assigning a dup id: 0 on a fresh
    /// height, the existing slot when the hash is already known, the next
    /// unused slot on a collision. With `update_dup`, the dup is marked
    /// valid unless some other dup already is.
    pub fn put_bare_header(
        &self,
        batch: &mut WriteBatch,
        sbh: &mut StoredHeader,
        update_dup: bool,
    ) -> Result<u8, DbError> {
        if sbh.height > MAX_HEIGHT {
            return Err(DbError::Invariant("height exceeds key space"));
        }
        let mut list = self
            .head_hgt_list_through(Some(&*batch), sbh.height)?
            .unwrap_or_else(|| StoredHeadHgtList::new(sbh.height));
        let dup = match list.dup_for_hash(&sbh.hash) {
            Some(existing) => existing,
            None => {
                let next = list.next_dup();
                if next == DUP_VALID {
                    return Err(DbError::Invariant("dup id space exhausted at height"));
                }
                list.entries.push(crate::header::HeadHgtEntry {
                    dup_id: next,
                    hash: sbh.hash,
                });
                next
            }
        };
        sbh.set_dup_id(dup);
        if update_dup && list.valid_dup.is_none() {
            list.valid_dup = Some(dup);
            self.valid_dup_by_height
                .write()
                .expect("dup lock")
                .insert(sbh.height, dup);
        }
        self.put_stored_head_hgt_list(batch, &list);
        self.put_value(
            batch,
            Column::Headers,
            &schema::head_hash_key(&sbh.hash),
            sbh.serialize(),
        );
        Ok(dup)
    }

    pub fn get_bare_header(&self, height: u32, dup: u8) -> Result<Option<StoredHeader>, DbError> {
        let dup = match self.resolve_dup(height, dup)? {
            Some(dup) => dup,
            None => return Ok(None),
        };
        let Some(list) = self.get_stored_head_hgt_list(height)? else {
            return Ok(None);
        };
        let Some(hash) = list.hash_for_dup(dup) else {
            return Ok(None);
        };
        self.get_bare_header_by_hash(&hash)
    }

    pub fn get_bare_header_by_hash(
        &self,
        hash: &Hash256,
    ) -> Result<Option<StoredHeader>, DbError> {
        match self.get_value(Column::Headers, &schema::head_hash_key(hash))? {
            Some(bytes) => {
                let sbh = StoredHeader::parse(&bytes)?;
                if sbh.hash != *hash {
                    return Err(DbError::Corrupt("header hash mismatch"));
                }
                Ok(Some(sbh))
            }
            None => Ok(None),
        }
    }

    fn resolve_dup(&self, height: u32, dup: u8) -> Result<Option<u8>, DbError> {
        if dup == DUP_VALID {
            self.get_valid_dup_id_for_height(height)
        } else {
            Ok(Some(dup))
        }
    }

    /// Write the header and, with `with_blk_data`, the full block payload:
    /// the block record, a fragmented record per transaction, a record per
    /// output, and the tx-hash hints. Returns the assigned dup id.
    pub fn put_stored_header(
        &self,
        batch: &mut WriteBatch,
        sbh: &mut StoredHeader,
        with_blk_data: bool,
        update_dup: bool,
    ) -> Result<u8, DbError> {
        let dup = self.put_bare_header(batch, sbh, update_dup)?;
        if !with_blk_data {
            return Ok(dup);
        }
        self.put_value(
            batch,
            Column::Blkdata,
            &schema::blk_data_key(sbh.height, dup),
            sbh.serialize(),
        );
        for stx in sbh.txs.values() {
            self.put_stored_tx(batch, stx, true)?;
            self.add_tx_hint(batch, &stx.hash, stx.db_key())?;
        }
        Ok(dup)
    }

    /// Load a header by coordinates. `DUP_VALID` (0xff) selects whichever
    /// dup is valid at the height. With `with_tx`, child transactions and
    /// outputs are materialized from a `TXDATA` prefix scan.
    pub fn get_stored_header(
        &self,
        height: u32,
        dup: u8,
        with_tx: bool,
    ) -> Result<Option<StoredHeader>, DbError> {
        let dup = match self.resolve_dup(height, dup)? {
            Some(dup) => dup,
            None => return Ok(None),
        };
        if !with_tx {
            return self.get_bare_header(height, dup);
        }
        let Some(bytes) = self.get_value(Column::Blkdata, &schema::blk_data_key(height, dup))?
        else {
            return Ok(None);
        };
        let mut sbh = StoredHeader::parse(&bytes)?;
        let prefix = schema::blk_data_key(height, dup);
        for (key, value) in self.scan(Column::Blkdata, &prefix)? {
            match key.len() {
                5 => {}
                7 => {
                    let (_, _, tx_index) =
                        schema::parse_tx_key(&key[1..]).ok_or(DbError::Corrupt("bad tx key"))?;
                    let stx = StoredTx::parse(height, dup, tx_index, &value)?;
                    sbh.txs.insert(tx_index, stx);
                }
                9 => {
                    let (_, _, tx_index, txout_index) = schema::parse_txout_key(&key[1..])
                        .ok_or(DbError::Corrupt("bad txout key"))?;
                    let stxo = StoredTxOut::parse(height, dup, tx_index, txout_index, &value)?;
                    if let Some(stx) = sbh.txs.get_mut(&tx_index) {
                        stx.outputs.insert(txout_index, stxo);
                    }
                }
                _ => return Err(DbError::Corrupt("unexpected TXDATA key length")),
            }
        }
        Ok(Some(sbh))
    }

    pub fn get_stored_header_by_hash(
        &self,
        hash: &Hash256,
        with_tx: bool,
    ) -> Result<Option<StoredHeader>, DbError> {
        let Some(bare) = self.get_bare_header_by_hash(hash)? else {
            return Ok(None);
        };
        if !with_tx {
            return Ok(Some(bare));
        }
        self.get_stored_header(bare.height, bare.dup_id, true)
    }

    /// Stream every bare header to the callback.
    pub fn read_all_headers(
        &self,
        callback: &mut dyn FnMut(&StoredHeader),
    ) -> Result<(), DbError> {
        for (_, value) in self.scan(Column::Headers, &[DbPrefix::HeadHash.byte()])? {
            let sbh = StoredHeader::parse(&value)?;
            callback(&sbh);
        }
        Ok(())
    }

    pub fn mark_block_header_valid(
        &self,
        batch: &mut WriteBatch,
        height: u32,
        dup: u8,
    ) -> Result<(), DbError> {
        self.set_valid_dup_id_for_height(batch, height, dup, true)
    }

    // ------------------------------------------------------------------
    // Transactions and outputs
    // ------------------------------------------------------------------

    /// Write the tx record. With `with_txout`, outputs go to their own
    /// `DbKey8` entries and the record is stored fragmented.
    pub fn put_stored_tx(
        &self,
        batch: &mut WriteBatch,
        stx: &StoredTx,
        with_txout: bool,
    ) -> Result<(), DbError> {
        let mut record = stx.clone();
        record.fragmented = with_txout;
        self.put_value(
            batch,
            Column::Blkdata,
            &schema::tx_data_key(stx.height, stx.dup_id, stx.tx_index),
            record.serialize(),
        );
        if with_txout {
            for stxo in stx.outputs.values() {
                self.put_stored_tx_out(batch, stxo);
            }
        }
        Ok(())
    }

    fn tx_record_through(
        &self,
        batch: Option<&WriteBatch>,
        height: u32,
        dup: u8,
        tx_index: u16,
    ) -> Result<Option<StoredTx>, DbError> {
        match self.get_value_through(
            batch,
            Column::Blkdata,
            &schema::tx_data_key(height, dup, tx_index),
        )? {
            Some(bytes) => Ok(Some(StoredTx::parse(height, dup, tx_index, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_stored_tx(
        &self,
        height: u32,
        dup: u8,
        tx_index: u16,
        with_txout: bool,
    ) -> Result<Option<StoredTx>, DbError> {
        let dup = match self.resolve_dup(height, dup)? {
            Some(dup) => dup,
            None => return Ok(None),
        };
        let Some(mut stx) = self.tx_record_through(None, height, dup, tx_index)? else {
            return Ok(None);
        };
        if with_txout && stx.fragmented {
            for txout_index in 0..stx.num_txout {
                if let Some(stxo) =
                    self.get_stored_tx_out(height, dup, tx_index, txout_index)?
                {
                    stx.outputs.insert(txout_index, stxo);
                }
            }
        }
        Ok(Some(stx))
    }

    pub fn get_stored_tx_by_db_key(
        &self,
        db_key: &[u8; 6],
        with_txout: bool,
    ) -> Result<Option<StoredTx>, DbError> {
        let (height, dup, tx_index) =
            schema::parse_tx_key(db_key).ok_or(DbError::Corrupt("bad tx db key"))?;
        self.get_stored_tx(height, dup, tx_index, with_txout)
    }

    /// Resolve a transaction by hash through the hint index: read the
    /// 4-byte prefix bucket, walk the candidates preferred-first, and
    /// compare the full stored hash. Only slots on the valid branch count.
    pub fn get_stored_tx_by_hash(&self, tx_hash: &Hash256) -> Result<Option<StoredTx>, DbError> {
        let Some(db_key) = self.db_key_for_tx_hash_through(None, tx_hash)? else {
            return Ok(None);
        };
        self.get_stored_tx_by_db_key(&db_key, true)
    }

    fn db_key_for_tx_hash_through(
        &self,
        batch: Option<&WriteBatch>,
        tx_hash: &Hash256,
    ) -> Result<Option<[u8; 6]>, DbError> {
        let Some(hints) = self.hints_through(batch, &schema::hash_prefix(tx_hash))? else {
            return Ok(None);
        };
        for candidate in hints.keys_preferred_first() {
            let (height, dup, tx_index) =
                schema::parse_tx_key(&candidate).ok_or(DbError::Corrupt("bad hint key"))?;
            if self.valid_dup_through(batch, height)? != Some(dup) {
                continue;
            }
            let Some(stx) = self.tx_record_through(batch, height, dup, tx_index)? else {
                continue;
            };
            if stx.hash == *tx_hash {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    pub fn get_tx_hash_for_db_key(&self, db_key: &[u8; 6]) -> Result<Option<Hash256>, DbError> {
        let (height, dup, tx_index) =
            schema::parse_tx_key(db_key).ok_or(DbError::Corrupt("bad tx db key"))?;
        Ok(self
            .tx_record_through(None, height, dup, tx_index)?
            .map(|stx| stx.hash))
    }

    /// Header hash for a block slot, or tx hash when an index is given.
    pub fn get_hash_for_db_key(
        &self,
        height: u32,
        dup: u8,
        tx_index: Option<u16>,
    ) -> Result<Option<Hash256>, DbError> {
        match tx_index {
            None => Ok(self.get_bare_header(height, dup)?.map(|sbh| sbh.hash)),
            Some(tx_index) => {
                let dup = match self.resolve_dup(height, dup)? {
                    Some(dup) => dup,
                    None => return Ok(None),
                };
                self.get_tx_hash_for_db_key(&schema::tx_key(height, dup, tx_index))
            }
        }
    }

    pub fn get_full_tx_copy(&self, db_key: &[u8; 6]) -> Result<Option<Transaction>, DbError> {
        Ok(self
            .get_stored_tx_by_db_key(db_key, true)?
            .and_then(|stx| stx.to_transaction()))
    }

    pub fn get_tx_out_copy(
        &self,
        db_key: &[u8; 6],
        txout_index: u16,
    ) -> Result<Option<TxOut>, DbError> {
        let (height, dup, tx_index) =
            schema::parse_tx_key(db_key).ok_or(DbError::Corrupt("bad tx db key"))?;
        Ok(self
            .get_stored_tx_out(height, dup, tx_index, txout_index)?
            .map(|stxo| stxo.to_txout()))
    }

    pub fn get_stxo_count_for_tx(&self, db_key: &[u8; 6]) -> Result<Option<u16>, DbError> {
        let (height, dup, tx_index) =
            schema::parse_tx_key(db_key).ok_or(DbError::Corrupt("bad tx db key"))?;
        Ok(self
            .tx_record_through(None, height, dup, tx_index)?
            .map(|stx| stx.num_txout))
    }

    pub fn put_stored_tx_out(&self, batch: &mut WriteBatch, stxo: &StoredTxOut) {
        self.put_value(
            batch,
            Column::Blkdata,
            &schema::txout_data_key(stxo.height, stxo.dup_id, stxo.tx_index, stxo.txout_index),
            stxo.serialize(),
        );
    }

    fn txout_through(
        &self,
        batch: Option<&WriteBatch>,
        height: u32,
        dup: u8,
        tx_index: u16,
        txout_index: u16,
    ) -> Result<Option<StoredTxOut>, DbError> {
        match self.get_value_through(
            batch,
            Column::Blkdata,
            &schema::txout_data_key(height, dup, tx_index, txout_index),
        )? {
            Some(bytes) => Ok(Some(StoredTxOut::parse(
                height,
                dup,
                tx_index,
                txout_index,
                &bytes,
            )?)),
            None => Ok(None),
        }
    }

    pub fn get_stored_tx_out(
        &self,
        height: u32,
        dup: u8,
        tx_index: u16,
        txout_index: u16,
    ) -> Result<Option<StoredTxOut>, DbError> {
        self.txout_through(None, height, dup, tx_index, txout_index)
    }

    pub fn get_stored_tx_out_by_key(
        &self,
        db_key: &[u8; 8],
    ) -> Result<Option<StoredTxOut>, DbError> {
        let (height, dup, tx_index, txout_index) =
            schema::parse_txout_key(db_key).ok_or(DbError::Corrupt("bad txout db key"))?;
        self.get_stored_tx_out(height, dup, tx_index, txout_index)
    }

    // ------------------------------------------------------------------
    // Tx hints
    // ------------------------------------------------------------------

    pub fn put_stored_tx_hints(&self, batch: &mut WriteBatch, hints: &StoredTxHints) {
        self.put_value(
            batch,
            Column::Txhints,
            &schema::tx_hints_key(&hints.hash_prefix),
            hints.serialize(),
        );
    }

    fn hints_through(
        &self,
        batch: Option<&WriteBatch>,
        hash_prefix: &[u8; 4],
    ) -> Result<Option<StoredTxHints>, DbError> {
        match self.get_value_through(batch, Column::Txhints, &schema::tx_hints_key(hash_prefix))?
        {
            Some(bytes) => Ok(Some(StoredTxHints::parse(*hash_prefix, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_stored_tx_hints(
        &self,
        hash_prefix: &[u8; 4],
    ) -> Result<Option<StoredTxHints>, DbError> {
        self.hints_through(None, hash_prefix)
    }

    fn add_tx_hint(
        &self,
        batch: &mut WriteBatch,
        tx_hash: &Hash256,
        db_key: [u8; 6],
    ) -> Result<(), DbError> {
        let prefix = schema::hash_prefix(tx_hash);
        let mut hints = self
            .hints_through(Some(&*batch), &prefix)?
            .unwrap_or_else(|| StoredTxHints::new(prefix));
        if !hints.contains(&db_key) {
            hints.push(db_key);
            self.put_stored_tx_hints(batch, &hints);
        }
        Ok(())
    }

    fn remove_tx_hint(
        &self,
        batch: &mut WriteBatch,
        tx_hash: &Hash256,
        db_key: &[u8; 6],
    ) -> Result<(), DbError> {
        let prefix = schema::hash_prefix(tx_hash);
        let Some(mut hints) = self.hints_through(Some(&*batch), &prefix)? else {
            return Ok(());
        };
        hints.remove(db_key);
        if hints.db_keys.is_empty() {
            self.delete_value(batch, Column::Txhints, &schema::tx_hints_key(&prefix));
        } else {
            self.put_stored_tx_hints(batch, &hints);
        }
        Ok(())
    }

    /// Move the preferred pointer of the bucket to `prefer_key`, appending
    /// the key when it is not yet listed. `hash_or_prefix` accepts either
    /// a full tx hash or the bare 4-byte bucket prefix.
    pub fn update_preferred_tx_hint(
        &self,
        batch: &mut WriteBatch,
        hash_or_prefix: &[u8],
        prefer_key: [u8; 6],
    ) -> Result<(), DbError> {
        if hash_or_prefix.len() < 4 {
            return Err(DbError::Corrupt("hint prefix too short"));
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&hash_or_prefix[0..4]);
        let mut hints = self
            .hints_through(Some(&*batch), &prefix)?
            .unwrap_or_else(|| StoredTxHints::new(prefix));
        hints.set_preferred(prefer_key);
        self.put_stored_tx_hints(batch, &hints);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Script history
    // ------------------------------------------------------------------

    pub fn put_stored_script_history_summary(
        &self,
        batch: &mut WriteBatch,
        ssh: &StoredScriptHistory,
    ) {
        self.put_value(
            batch,
            Column::History,
            &schema::script_key(&ssh.scr_addr),
            ssh.serialize_summary(),
        );
    }

    pub fn put_stored_sub_history(&self, batch: &mut WriteBatch, sub: &StoredSubHistory) {
        self.put_value(
            batch,
            Column::History,
            &schema::sub_ssh_key(&sub.scr_addr, &sub.fragment),
            sub.serialize(),
        );
    }

    /// Write the summary and every shard currently attached to `ssh`.
    pub fn put_stored_script_history(&self, batch: &mut WriteBatch, ssh: &StoredScriptHistory) {
        self.put_stored_script_history_summary(batch, ssh);
        for sub in ssh.sub_histories.values() {
            self.put_stored_sub_history(batch, sub);
        }
    }

    fn ssh_summary_through(
        &self,
        batch: Option<&WriteBatch>,
        scr_addr: &ScrAddr,
    ) -> Result<Option<StoredScriptHistory>, DbError> {
        match self.get_value_through(batch, Column::History, &schema::script_key(scr_addr))? {
            Some(bytes) => Ok(Some(StoredScriptHistory::parse_summary(
                scr_addr.clone(),
                &bytes,
            )?)),
            None => Ok(None),
        }
    }

    pub fn get_stored_script_history_summary(
        &self,
        scr_addr: &ScrAddr,
    ) -> Result<Option<StoredScriptHistory>, DbError> {
        self.ssh_summary_through(None, scr_addr)
    }

    fn sub_history_through(
        &self,
        batch: Option<&WriteBatch>,
        scr_addr: &ScrAddr,
        fragment: &[u8; 4],
    ) -> Result<Option<StoredSubHistory>, DbError> {
        match self.get_value_through(
            batch,
            Column::History,
            &schema::sub_ssh_key(scr_addr, fragment),
        )? {
            Some(bytes) => Ok(Some(StoredSubHistory::parse(
                scr_addr.clone(),
                *fragment,
                &bytes,
            )?)),
            None => Ok(None),
        }
    }

    pub fn get_stored_sub_history_at(
        &self,
        scr_addr: &ScrAddr,
        fragment: &[u8; 4],
    ) -> Result<Option<StoredSubHistory>, DbError> {
        self.sub_history_through(None, scr_addr, fragment)
    }

    /// Load the summary plus every shard whose height falls inside
    /// `[start_block, end_block]`, both bounds inclusive.
    pub fn get_stored_script_history(
        &self,
        scr_addr: &ScrAddr,
        start_block: u32,
        end_block: u32,
    ) -> Result<Option<StoredScriptHistory>, DbError> {
        let Some(mut ssh) = self.ssh_summary_through(None, scr_addr)? else {
            return Ok(None);
        };
        let prefix = schema::sub_ssh_prefix(scr_addr);
        for (key, value) in self.scan(Column::History, &prefix)? {
            let Some(fragment) = key.get(prefix.len()..) else {
                continue;
            };
            let fragment: [u8; 4] = fragment
                .try_into()
                .map_err(|_| DbError::Corrupt("bad SUBSSH key"))?;
            let height = schema::hgtx_height(&fragment);
            if height < start_block || height > end_block {
                continue;
            }
            let sub = StoredSubHistory::parse(scr_addr.clone(), fragment, &value)?;
            ssh.sub_histories.insert(fragment, sub);
        }
        Ok(Some(ssh))
    }

    /// Convenience lookup keyed by the raw output script.
    pub fn get_stored_script_history_by_raw_script(
        &self,
        raw_script: &[u8],
        start_block: u32,
        end_block: u32,
    ) -> Result<Option<StoredScriptHistory>, DbError> {
        let scr_addr = ScrAddr::from_script(raw_script);
        self.get_stored_script_history(&scr_addr, start_block, end_block)
    }

    /// Pull one shard into the in-memory history. With
    /// `force_read_and_merge`, the on-disk shard is merged even when the
    /// fragment is already present (used after partial updates).
    pub fn fetch_stored_sub_history(
        &self,
        ssh: &mut StoredScriptHistory,
        fragment: [u8; 4],
        create_if_dne: bool,
        force_read_and_merge: bool,
    ) -> Result<bool, DbError> {
        let present = ssh.sub_histories.contains_key(&fragment);
        if present && !force_read_and_merge {
            return Ok(true);
        }
        match self.sub_history_through(None, &ssh.scr_addr, &fragment)? {
            Some(on_disk) => {
                match ssh.sub_histories.get_mut(&fragment) {
                    Some(existing) => existing.merge(&on_disk),
                    None => {
                        ssh.sub_histories.insert(fragment, on_disk);
                    }
                }
                Ok(true)
            }
            None if present => Ok(true),
            None if create_if_dne => {
                let height = schema::hgtx_height(&fragment);
                let dup = schema::hgtx_dup(&fragment);
                ssh.sub_histories.insert(
                    fragment,
                    StoredSubHistory::new(ssh.scr_addr.clone(), height, dup),
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Height → txio-count map for a script, bounded by `end_block`.
    pub fn get_ssh_summary(
        &self,
        scr_addr: &ScrAddr,
        end_block: u32,
    ) -> Result<BTreeMap<u32, u32>, DbError> {
        let mut out = BTreeMap::new();
        let prefix = schema::sub_ssh_prefix(scr_addr);
        for (key, value) in self.scan(Column::History, &prefix)? {
            let Some(fragment) = key.get(prefix.len()..) else {
                continue;
            };
            let fragment: [u8; 4] = fragment
                .try_into()
                .map_err(|_| DbError::Corrupt("bad SUBSSH key"))?;
            let height = schema::hgtx_height(&fragment);
            if height > end_block {
                continue;
            }
            let sub = StoredSubHistory::parse(scr_addr.clone(), fragment, &value)?;
            *out.entry(height).or_insert(0) += sub.txios.len() as u32;
        }
        Ok(out)
    }

    /// Spendable balance. Without multisig this is the maintained summary
    /// total; with multisig the UTXO set is walked.
    pub fn get_balance_for_scr_addr(
        &self,
        scr_addr: &ScrAddr,
        with_multisig: bool,
    ) -> Result<i64, DbError> {
        if !with_multisig {
            return Ok(self
                .get_stored_script_history_summary(scr_addr)?
                .map(|ssh| ssh.total_unspent)
                .unwrap_or(0));
        }
        let Some(ssh) = self.get_stored_script_history(scr_addr, 0, MAX_HEIGHT)? else {
            return Ok(0);
        };
        let utxos = self.get_full_utxo_map_for_ssh(&ssh, true)?;
        Ok(utxos.values().map(|stxo| stxo.value).sum())
    }

    /// Materialize the still-unspent outputs referenced by the loaded
    /// shards of `ssh`.
    pub fn get_full_utxo_map_for_ssh(
        &self,
        ssh: &StoredScriptHistory,
        with_multisig: bool,
    ) -> Result<BTreeMap<[u8; 8], StoredTxOut>, DbError> {
        let mut out = BTreeMap::new();
        for sub in ssh.sub_histories.values() {
            for entry in sub.txios.values() {
                let wanted = entry.kind.credits_balance()
                    || (with_multisig && entry.kind == TxioKind::Multisig);
                if !wanted {
                    continue;
                }
                let Some(stxo) = self.get_stored_tx_out_by_key(&entry.key)? else {
                    continue;
                };
                if matches!(stxo.spentness, Spentness::SpentBy(_)) {
                    continue;
                }
                out.insert(entry.key, stxo);
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Registered scripts
    // ------------------------------------------------------------------

    /// Track a script for history building. `scanned_up_to` of `None`
    /// means the script is brand new and needs no rescan; pass 0 when its
    /// age is unknown.
    pub fn add_registered_script(&self, raw_script: &[u8], scanned_up_to: Option<u32>) {
        let scr_addr = ScrAddr::from_script(raw_script);
        self.registered_scripts
            .write()
            .expect("script lock")
            .entry(scr_addr)
            .or_insert(scanned_up_to.unwrap_or(u32::MAX));
    }

    pub fn registered_scr_addrs(&self) -> Vec<(ScrAddr, u32)> {
        self.registered_scripts
            .read()
            .expect("script lock")
            .iter()
            .map(|(scr, scanned)| (scr.clone(), *scanned))
            .collect()
    }

    pub fn set_script_scanned_up_to(&self, scr_addr: &ScrAddr, height: u32) {
        if let Some(entry) = self
            .registered_scripts
            .write()
            .expect("script lock")
            .get_mut(scr_addr)
        {
            *entry = height;
        }
    }

    fn tracks_script(&self, tracked: &BTreeSet<ScrAddr>, scr_addr: &ScrAddr) -> bool {
        self.config.db_mode == DbMode::Super || tracked.contains(scr_addr)
    }

    // ------------------------------------------------------------------
    // Undo data
    // ------------------------------------------------------------------

    /// No-op in supernode mode, which retains every output and can
    /// reconstruct undo on demand. Returns whether the record was stored.
    pub fn put_stored_undo_data(
        &self,
        batch: &mut WriteBatch,
        sud: &StoredUndoData,
    ) -> Result<bool, DbError> {
        if self.config.db_mode == DbMode::Super {
            return Ok(false);
        }
        self.put_value(
            batch,
            Column::Spentness,
            &schema::undo_key(sud.height, sud.dup_id),
            sud.serialize(),
        );
        Ok(true)
    }

    pub fn get_stored_undo_data(
        &self,
        height: u32,
        dup: u8,
    ) -> Result<Option<StoredUndoData>, DbError> {
        let dup = match self.resolve_dup(height, dup)? {
            Some(dup) => dup,
            None => return Ok(None),
        };
        match self.get_value(Column::Spentness, &schema::undo_key(height, dup))? {
            Some(bytes) => Ok(Some(StoredUndoData::parse(height, dup, &bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_stored_undo_data_by_hash(
        &self,
        block_hash: &Hash256,
    ) -> Result<Option<StoredUndoData>, DbError> {
        let Some(sbh) = self.get_bare_header_by_hash(block_hash)? else {
            return Ok(None);
        };
        self.get_stored_undo_data(sbh.height, sbh.dup_id)
    }

    /// Walk every input of every non-coinbase transaction, resolving the
    /// consumed outputs to their stored pre-spend state, and record the
    /// keys of the outputs the block creates.
    pub fn compute_undo_data_from_stored_block(
        &self,
        sbh: &StoredHeader,
    ) -> Result<StoredUndoData, DbError> {
        self.compute_undo_through(None, sbh)
    }

    /// Reconstruct undo data for an already-stored block. Works after the
    /// block was applied because spent outputs keep their full record.
    pub fn compute_undo_data_for_block(
        &self,
        height: u32,
        dup: u8,
    ) -> Result<StoredUndoData, DbError> {
        let sbh = self
            .get_stored_header(height, dup, true)?
            .ok_or(DbError::Corrupt("block not stored"))?;
        self.compute_undo_through(None, &sbh)
    }

    fn compute_undo_through(
        &self,
        batch: Option<&WriteBatch>,
        sbh: &StoredHeader,
    ) -> Result<StoredUndoData, DbError> {
        let mut sud = StoredUndoData::new(sbh.height, sbh.dup_id, sbh.hash);
        for stx in sbh.txs.values() {
            if !stx.is_coinbase() {
                for input in &stx.inputs {
                    let mut stxo = self.resolve_prevout(batch, &input.prevout)?;
                    // Record the pre-spend state regardless of how the
                    // output currently stands.
                    stxo.spentness = Spentness::Unspent;
                    sud.stxos_removed.push(stxo);
                }
            }
            for stxo in stx.outputs.values() {
                sud.outputs_added.push(stxo.db_key());
            }
        }
        Ok(sud)
    }

    fn resolve_prevout(
        &self,
        batch: Option<&WriteBatch>,
        prevout: &cairn_primitives::outpoint::OutPoint,
    ) -> Result<StoredTxOut, DbError> {
        let db_key = self
            .db_key_for_tx_hash_through(batch, &prevout.hash)?
            .ok_or(DbError::Corrupt("prevout transaction not found"))?;
        let (height, dup, tx_index) =
            schema::parse_tx_key(&db_key).ok_or(DbError::Corrupt("bad hint key"))?;
        let txout_index =
            u16::try_from(prevout.index).map_err(|_| DbError::Corrupt("prevout index range"))?;
        self.txout_through(batch, height, dup, tx_index, txout_index)?
            .ok_or(DbError::Corrupt("prevout output not found"))
    }

    // ------------------------------------------------------------------
    // Zero-confirmation records
    // ------------------------------------------------------------------

    /// Synthetic coordinates carried by in-memory zc records; the real
    /// location is the caller-supplied sequence number.
    fn zc_coords(sequence: u32) -> (u32, u8, u16) {
        (MAX_HEIGHT, DUP_VALID, sequence as u16)
    }

    /// Store an unconfirmed transaction under the zc partition. Swept on
    /// shutdown or superseded when the tx confirms.
    pub fn put_stored_zc(
        &self,
        batch: &mut WriteBatch,
        tx: &Transaction,
        sequence: u32,
    ) -> Result<(), DbError> {
        let (height, dup, tx_index) = Self::zc_coords(sequence);
        let mut stx = StoredTx::from_transaction(tx, height, dup, tx_index);
        stx.fragmented = true;
        self.put_value(
            batch,
            Column::Blkdata,
            &schema::zc_tx_key(sequence),
            stx.serialize(),
        );
        for (txout_index, stxo) in &stx.outputs {
            self.put_stored_zc_tx_out(batch, sequence, *txout_index, stxo);
        }
        Ok(())
    }

    pub fn put_stored_zc_tx_out(
        &self,
        batch: &mut WriteBatch,
        sequence: u32,
        txout_index: u16,
        stxo: &StoredTxOut,
    ) {
        self.put_value(
            batch,
            Column::Blkdata,
            &schema::zc_txout_key(sequence, txout_index),
            stxo.serialize(),
        );
    }

    pub fn get_stored_zc_tx(&self, sequence: u32) -> Result<Option<StoredTx>, DbError> {
        let (height, dup, tx_index) = Self::zc_coords(sequence);
        let Some(bytes) = self.get_value(Column::Blkdata, &schema::zc_tx_key(sequence))? else {
            return Ok(None);
        };
        let mut stx = StoredTx::parse(height, dup, tx_index, &bytes)?;
        for txout_index in 0..stx.num_txout {
            if let Some(bytes) =
                self.get_value(Column::Blkdata, &schema::zc_txout_key(sequence, txout_index))?
            {
                let stxo = StoredTxOut::parse(height, dup, tx_index, txout_index, &bytes)?;
                stx.outputs.insert(txout_index, stxo);
            }
        }
        Ok(Some(stx))
    }

    /// Drop every zero-confirmation record.
    pub fn clear_zero_conf(&self, batch: &mut WriteBatch) -> Result<(), DbError> {
        for (key, _) in self.scan(Column::Blkdata, &[DbPrefix::ZcData.byte()])? {
            self.delete_value(batch, Column::Blkdata, &key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Block apply / unapply
    // ------------------------------------------------------------------

    /// Ingest one block: header, block payload, spentness of consumed
    /// prevouts, undo data, script histories, and finally the top
    /// pointer. Everything lands in the caller's batch, so the whole
    /// ingest commits atomically per environment.
    pub fn apply_block(
        &self,
        batch: &mut WriteBatch,
        block: &Block,
        height: u32,
    ) -> Result<u8, DbError> {
        let mut sbh = StoredHeader::from_block(block, height);
        sbh.block_applied = true;
        let dup = self.put_stored_header(batch, &mut sbh, true, false)?;
        self.set_valid_dup_id_for_height(batch, height, dup, true)?;

        let tracked: BTreeSet<ScrAddr> = self
            .registered_scripts
            .read()
            .expect("script lock")
            .keys()
            .cloned()
            .collect();

        let mut sud = StoredUndoData::new(height, dup, sbh.hash);
        let mut shards: BTreeMap<ScrAddr, StoredSubHistory> = BTreeMap::new();
        let mut deltas: BTreeMap<ScrAddr, (i64, u64)> = BTreeMap::new();

        let mut record = |scr: ScrAddr, entry: TxioEntry, unspent_delta: i64| {
            let shard = shards
                .entry(scr.clone())
                .or_insert_with(|| StoredSubHistory::new(scr.clone(), height, dup));
            shard.insert(entry);
            let delta = deltas.entry(scr).or_insert((0, 0));
            delta.0 += unspent_delta;
            delta.1 += 1;
        };

        for (tx_index, stx) in &sbh.txs {
            let mut spent_scrs: BTreeSet<ScrAddr> = BTreeSet::new();
            if !stx.is_coinbase() {
                for (input_index, input) in stx.inputs.iter().enumerate() {
                    let stxo = self.resolve_prevout(Some(&*batch), &input.prevout)?;
                    if matches!(stxo.spentness, Spentness::SpentBy(_)) {
                        return Err(DbError::Invariant("output spent twice"));
                    }
                    let mut pre_spend = stxo.clone();
                    pre_spend.spentness = Spentness::Unspent;
                    sud.stxos_removed.push(pre_spend);

                    let scr = ScrAddr::from_script(&stxo.script_pubkey);
                    spent_scrs.insert(scr.clone());
                    if self.tracks_script(&tracked, &scr) {
                        record(
                            scr,
                            TxioEntry {
                                key: stxo.db_key(),
                                kind: TxioKind::Spent,
                                value: stxo.value,
                            },
                            -stxo.value,
                        );
                    }

                    let mut spent = stxo;
                    spent.spentness = Spentness::SpentBy(schema::txout_key(
                        height,
                        dup,
                        *tx_index,
                        input_index as u16,
                    ));
                    self.put_stored_tx_out(batch, &spent);
                }
            }
            for stxo in stx.outputs.values() {
                sud.outputs_added.push(stxo.db_key());
                let scr = ScrAddr::from_script(&stxo.script_pubkey);
                if self.tracks_script(&tracked, &scr) {
                    let kind = if spent_scrs.contains(&scr) {
                        TxioKind::FromSelf
                    } else {
                        TxioKind::Received
                    };
                    record(
                        scr,
                        TxioEntry {
                            key: stxo.db_key(),
                            kind,
                            value: stxo.value,
                        },
                        stxo.value,
                    );
                }
                if is_multisig(&stxo.script_pubkey) {
                    for participant in multisig_participants(&stxo.script_pubkey) {
                        if self.tracks_script(&tracked, &participant) {
                            record(
                                participant,
                                TxioEntry {
                                    key: stxo.db_key(),
                                    kind: TxioKind::Multisig,
                                    value: stxo.value,
                                },
                                0,
                            );
                        }
                    }
                }
            }
        }

        self.put_stored_undo_data(batch, &sud)?;

        for (scr, shard) in shards {
            let (unspent_delta, count_delta) = deltas.get(&scr).copied().unwrap_or((0, 0));
            let mut ssh = self
                .ssh_summary_through(Some(&*batch), &scr)?
                .unwrap_or_else(|| StoredScriptHistory::new(scr.clone()));
            if ssh.total_txio_count > 0 {
                ssh.use_multiple_entries = true;
            }
            ssh.total_txio_count += count_delta;
            ssh.total_unspent += unspent_delta;
            self.put_stored_sub_history(batch, &shard);
            self.put_stored_script_history_summary(batch, &ssh);
        }

        self.update_top_block(batch, height, sbh.hash);
        Ok(dup)
    }

    /// Reverse one block from its undo record: restore consumed outputs,
    /// delete created records, unwind hints and histories, and point the
    /// top at the parent. The header itself survives (its dup slot must
    /// stay stable); only its applied flag is cleared.
    pub fn unapply_block(
        &self,
        batch: &mut WriteBatch,
        sud: &StoredUndoData,
    ) -> Result<(), DbError> {
        let height = sud.height;
        let dup = sud.dup_id;

        let tracked: BTreeSet<ScrAddr> = self
            .registered_scripts
            .read()
            .expect("script lock")
            .keys()
            .cloned()
            .collect();

        // The block's own records, as committed.
        let prefix = schema::blk_data_key(height, dup);
        let entries = self.scan(Column::Blkdata, &prefix)?;

        let mut block_header: Option<StoredHeader> = None;
        let mut tx_hashes: Vec<(Hash256, [u8; 6])> = Vec::new();
        let mut affected: BTreeSet<ScrAddr> = BTreeSet::new();
        for (key, value) in &entries {
            match key.len() {
                5 => block_header = Some(StoredHeader::parse(value)?),
                7 => {
                    let (_, _, tx_index) =
                        schema::parse_tx_key(&key[1..]).ok_or(DbError::Corrupt("bad tx key"))?;
                    let stx = StoredTx::parse(height, dup, tx_index, value)?;
                    tx_hashes.push((stx.hash, stx.db_key()));
                }
                9 => {
                    let (_, _, tx_index, txout_index) = schema::parse_txout_key(&key[1..])
                        .ok_or(DbError::Corrupt("bad txout key"))?;
                    let stxo = StoredTxOut::parse(height, dup, tx_index, txout_index, value)?;
                    let scr = ScrAddr::from_script(&stxo.script_pubkey);
                    if self.tracks_script(&tracked, &scr) {
                        affected.insert(scr);
                    }
                    for participant in multisig_participants(&stxo.script_pubkey) {
                        if self.tracks_script(&tracked, &participant) {
                            affected.insert(participant);
                        }
                    }
                }
                _ => return Err(DbError::Corrupt("unexpected TXDATA key length")),
            }
        }
        let block_header =
            block_header.ok_or(DbError::Corrupt("unapply of a block without payload"))?;
        if block_header.hash != sud.block_hash {
            return Err(DbError::Invariant("undo data does not match stored block"));
        }

        // Restore consumed outputs to their pre-spend state, then drop
        // every record the block created (restores of in-block outputs
        // are superseded by the deletes that follow).
        for stxo in &sud.stxos_removed {
            self.put_stored_tx_out(batch, stxo);
            let scr = ScrAddr::from_script(&stxo.script_pubkey);
            if self.tracks_script(&tracked, &scr) {
                affected.insert(scr);
            }
        }
        for (key, _) in &entries {
            self.delete_value(batch, Column::Blkdata, key);
        }

        for (tx_hash, db_key) in &tx_hashes {
            self.remove_tx_hint(batch, tx_hash, db_key)?;
        }

        // One shard per script dies with the block; summaries reverse the
        // same deltas the apply added.
        let fragment = schema::hgtx(height, dup);
        for scr in affected {
            let Some(shard) = self.sub_history_through(Some(&*batch), &scr, &fragment)? else {
                continue;
            };
            let mut unspent_delta = 0i64;
            let mut count_delta = 0u64;
            for entry in shard.txios.values() {
                match entry.kind {
                    TxioKind::Received | TxioKind::FromSelf => unspent_delta -= entry.value,
                    TxioKind::Spent => unspent_delta += entry.value,
                    TxioKind::Multisig => {}
                }
                count_delta += 1;
            }
            self.delete_value(batch, Column::History, &schema::sub_ssh_key(&scr, &fragment));

            let Some(mut ssh) = self.ssh_summary_through(Some(&*batch), &scr)? else {
                continue;
            };
            ssh.total_unspent += unspent_delta;
            ssh.total_txio_count = ssh.total_txio_count.saturating_sub(count_delta);
            if ssh.total_txio_count == 0 && ssh.scanned_up_to == 0 {
                self.delete_value(batch, Column::History, &schema::script_key(&scr));
                continue;
            }
            ssh.use_multiple_entries = self.count_live_shards(batch, &scr)? > 1;
            self.put_stored_script_history_summary(batch, &ssh);
        }

        // Undo data for the block is spent.
        if self.config.db_mode != DbMode::Super {
            self.delete_value(batch, Column::Spentness, &schema::undo_key(height, dup));
        }

        // Clear the applied flag on the bare header.
        if let Some(mut bare) = self.get_bare_header_by_hash(&sud.block_hash)? {
            bare.block_applied = false;
            self.put_value(
                batch,
                Column::Headers,
                &schema::head_hash_key(&bare.hash),
                bare.serialize(),
            );
        }

        // Top moves to the parent.
        let header = block_header.header()?;
        if height == 0 {
            let Some(info) = StoredDbInfo::fresh(&self.config) else {
                return Err(DbError::Config("no network selected"));
            };
            let serialized = info.serialize();
            for column in self.hosted_columns() {
                self.put_value(batch, column, &schema::db_info_key(), serialized.clone());
            }
        } else {
            self.update_top_block(batch, height - 1, header.prev_block);
        }
        Ok(())
    }

    fn count_live_shards(&self, batch: &WriteBatch, scr_addr: &ScrAddr) -> Result<usize, DbError> {
        let prefix = schema::sub_ssh_prefix(scr_addr);
        let routed = self.db_select(Column::History);
        let mut count = 0usize;
        for (key, _) in self.scan(Column::History, &prefix)? {
            if matches!(batch.pending_get(routed, &key), Some(None)) {
                continue;
            }
            count += 1;
        }
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Script rescan
    // ------------------------------------------------------------------

    /// Rebuild one script's history from the block data, up to and
    /// including `end_block`. Only records on the valid branch count.
    pub fn rescan_script_history(
        &self,
        batch: &mut WriteBatch,
        scr_addr: &ScrAddr,
        end_block: u32,
    ) -> Result<(), DbError> {
        for (key, _) in self.scan(Column::History, &schema::sub_ssh_prefix(scr_addr))? {
            self.delete_value(batch, Column::History, &key);
        }

        let mut ssh = StoredScriptHistory::new(scr_addr.clone());
        let mut shards: BTreeMap<[u8; 4], StoredSubHistory> = BTreeMap::new();

        let mut iter = self.get_iterator(Column::Blkdata)?;
        let mut more = iter.seek_to_prefix(DbPrefix::TxData, &[])?;
        while more {
            let key = iter.key().expect("valid iterator").to_vec();
            if key.len() == 9 {
                let (height, dup, tx_index, txout_index) = schema::parse_txout_key(&key[1..])
                    .ok_or(DbError::Corrupt("bad txout key"))?;
                if height <= end_block
                    && self.get_valid_dup_id_for_height(height)? == Some(dup)
                {
                    let value = iter.value().expect("valid iterator");
                    let stxo = StoredTxOut::parse(height, dup, tx_index, txout_index, value)?;
                    self.rescan_visit_txout(
                        scr_addr, &stxo, end_block, &mut ssh, &mut shards,
                    )?;
                }
            }
            more = iter.advance_prefix(DbPrefix::TxData)?;
        }

        ssh.scanned_up_to = end_block;
        ssh.use_multiple_entries = shards.len() > 1;
        for shard in shards.values() {
            self.put_stored_sub_history(batch, shard);
        }
        self.put_stored_script_history_summary(batch, &ssh);
        Ok(())
    }

    fn rescan_visit_txout(
        &self,
        scr_addr: &ScrAddr,
        stxo: &StoredTxOut,
        end_block: u32,
        ssh: &mut StoredScriptHistory,
        shards: &mut BTreeMap<[u8; 4], StoredSubHistory>,
    ) -> Result<(), DbError> {
        let out_scr = ScrAddr::from_script(&stxo.script_pubkey);
        let is_mine = out_scr == *scr_addr;
        let is_participant = !is_mine
            && multisig_participants(&stxo.script_pubkey)
                .iter()
                .any(|participant| participant == scr_addr);
        if !is_mine && !is_participant {
            return Ok(());
        }

        let fragment = schema::hgtx(stxo.height, stxo.dup_id);
        let shard = shards.entry(fragment).or_insert_with(|| {
            StoredSubHistory::new(scr_addr.clone(), stxo.height, stxo.dup_id)
        });
        let kind = if is_participant {
            TxioKind::Multisig
        } else if self.rescan_is_from_self(scr_addr, stxo)? {
            TxioKind::FromSelf
        } else {
            TxioKind::Received
        };
        shard.insert(TxioEntry {
            key: stxo.db_key(),
            kind,
            value: stxo.value,
        });
        ssh.total_txio_count += 1;
        if is_mine {
            ssh.total_unspent += stxo.value;
        }

        if let Spentness::SpentBy(spender) = stxo.spentness {
            let (spend_height, spend_dup, _, _) =
                schema::parse_txout_key(&spender).ok_or(DbError::Corrupt("bad spender key"))?;
            let on_valid_branch =
                self.get_valid_dup_id_for_height(spend_height)? == Some(spend_dup);
            if is_mine && on_valid_branch && spend_height <= end_block {
                let spend_fragment = schema::hgtx(spend_height, spend_dup);
                let spend_shard = shards.entry(spend_fragment).or_insert_with(|| {
                    StoredSubHistory::new(scr_addr.clone(), spend_height, spend_dup)
                });
                spend_shard.insert(TxioEntry {
                    key: stxo.db_key(),
                    kind: TxioKind::Spent,
                    value: stxo.value,
                });
                ssh.total_txio_count += 1;
                ssh.total_unspent -= stxo.value;
            }
        }
        Ok(())
    }

    /// Whether the transaction that created `stxo` also spends from the
    /// same script.
    fn rescan_is_from_self(
        &self,
        scr_addr: &ScrAddr,
        stxo: &StoredTxOut,
    ) -> Result<bool, DbError> {
        let Some(stx) =
            self.tx_record_through(None, stxo.height, stxo.dup_id, stxo.tx_index)?
        else {
            return Ok(false);
        };
        if stx.is_coinbase() {
            return Ok(false);
        }
        for input in &stx.inputs {
            let Some(db_key) = self.db_key_for_tx_hash_through(None, &input.prevout.hash)?
            else {
                continue;
            };
            let (height, dup, tx_index) =
                schema::parse_tx_key(&db_key).ok_or(DbError::Corrupt("bad hint key"))?;
            let Ok(txout_index) = u16::try_from(input.prevout.index) else {
                continue;
            };
            let Some(prev) = self.txout_through(None, height, dup, tx_index, txout_index)?
            else {
                continue;
            };
            if ScrAddr::from_script(&prev.script_pubkey) == *scr_addr {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
