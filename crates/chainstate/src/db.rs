//! Persistent side of the index.
//!
//! Column layout:
//!
//! ```text
//! Utxo      b'h' ..., b'u' ... (see utxo.rs), b'U' ++ height BE -> undo, b"state"
//! Header    height BE u32  -> 80-byte header
//! TxCount   height BE u32  -> cumulative tx count u64 LE
//! TxHash    tx_num BE u64  -> 32-byte tx hash
//! RawBlock  height BE u32  -> raw block (reorg window only)
//! History   hashX ++ flush id BE u32 -> tx nums (see history.rs)
//! ```
//!
//! Headers, tx counts and tx hashes ("fs" data) are append-only and are
//! written on every flush, as is the address history. UTXO rows, undo
//! records and the db cursor are only written when UTXOs are flushed, so
//! after a crash the index resumes from the height stored in `state`,
//! overwrites fs rows above it and drops history rows of later flushes.

use std::collections::HashSet;
use std::fmt;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use novoindex_consensus::{hash256_to_hex, CoinParams, Hash256};
use novoindex_log::{log_debug, log_info, log_warn};
use novoindex_primitives::block::{header_hash, RawHeader};
use novoindex_primitives::encoding::{DecodeError, Decoder, Encoder};
use novoindex_primitives::script::{HashX, HASHX_LEN};
use novoindex_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flush::FlushData;
use crate::history::{history_key, history_key_flush_id, row_prefix_below, row_tx_nums};
use crate::undo::{undo_key, undo_key_height, UNDO_TABLE_PREFIX};
use crate::utxo::{
    amount_table_key, amount_table_prefix, hashx_table_key, hashx_table_prefix, unpack_tx_num,
    TxNum, AMOUNT_KEY_LEN, HASHX_KEY_LEN, TX_NUM_LEN,
};

pub const DB_VERSION: u32 = 8;

const STATE_KEY: &[u8] = b"state";

#[derive(Debug)]
pub enum DbError {
    Store(StoreError),
    Decode(DecodeError),
    GenesisMismatch { stored: Hash256, expected: Hash256 },
    UnsupportedVersion(u32),
    NotFlushed(&'static str),
    Inconsistent(&'static str),
    MissingHeaders { start: i32, count: usize, found: usize },
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Store(err) => write!(f, "{err}"),
            DbError::Decode(err) => write!(f, "corrupt db state: {err}"),
            DbError::GenesisMismatch { stored, expected } => write!(
                f,
                "db genesis {} does not match coin genesis {}",
                hash256_to_hex(stored),
                hash256_to_hex(expected)
            ),
            DbError::UnsupportedVersion(version) => {
                write!(f, "unsupported db version {version} (expected {DB_VERSION})")
            }
            DbError::NotFlushed(what) => write!(f, "pending state not flushed: {what}"),
            DbError::Inconsistent(message) => write!(f, "{message}"),
            DbError::MissingHeaders {
                start,
                count,
                found,
            } => write!(
                f,
                "only got {found} headers starting at {start}, not {count}"
            ),
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

/// The `state` record: the flushed chain cursor plus bookkeeping.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DbState {
    pub db_version: u32,
    pub genesis: Hash256,
    pub height: i32,
    pub tx_count: u64,
    pub tip: Hash256,
    /// Flushes so far; also the id of the newest history rows.
    pub flush_count: u32,
    /// `flush_count` as of the last flush that wrote UTXOs.
    pub utxo_flush_count: u32,
    pub wall_time_ms: u64,
    pub first_sync: bool,
}

impl DbState {
    pub fn fresh(genesis: Hash256) -> Self {
        Self {
            db_version: DB_VERSION,
            genesis,
            height: -1,
            tx_count: 0,
            tip: [0u8; 32],
            flush_count: 0,
            utxo_flush_count: 0,
            wall_time_ms: 0,
            first_sync: true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(97);
        encoder.write_u32_le(self.db_version);
        encoder.write_hash_le(&self.genesis);
        encoder.write_i32_le(self.height);
        encoder.write_u64_le(self.tx_count);
        encoder.write_hash_le(&self.tip);
        encoder.write_u32_le(self.flush_count);
        encoder.write_u32_le(self.utxo_flush_count);
        encoder.write_u64_le(self.wall_time_ms);
        encoder.write_u8(u8::from(self.first_sync));
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let state = Self {
            db_version: decoder.read_u32_le()?,
            genesis: decoder.read_hash_le()?,
            height: decoder.read_i32_le()?,
            tx_count: decoder.read_u64_le()?,
            tip: decoder.read_hash_le()?,
            flush_count: decoder.read_u32_le()?,
            utxo_flush_count: decoder.read_u32_le()?,
            wall_time_ms: decoder.read_u64_le()?,
            first_sync: decoder.read_u8()? != 0,
        };
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(state)
    }
}

/// A confirmed transaction in an address history.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HistoryEntry {
    pub tx_num: u64,
    pub tx_hash: Hash256,
    pub height: i32,
}

/// A flushed UTXO as seen by the serving side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoRecord {
    pub tx_num: u64,
    pub tx_pos: u32,
    pub tx_hash: Hash256,
    pub height: i32,
    pub value: u64,
}

pub struct IndexDb<S> {
    store: S,
    params: CoinParams,
    state: DbState,
    fs_height: i32,
    fs_tx_count: u64,
    /// `tx_counts[h]` is the cumulative transaction count at the end of
    /// height `h`, including blocks that are not flushed yet.
    tx_counts: Vec<u64>,
    for_sync: bool,
    opened: bool,
    last_flush_ms: u64,
    last_flush_tx_count: u64,
}

impl<S: KeyValueStore> IndexDb<S> {
    pub fn new(store: S, params: CoinParams) -> Self {
        let state = DbState::fresh(params.genesis_hash);
        Self {
            store,
            params,
            state,
            fs_height: -1,
            fs_tx_count: 0,
            tx_counts: Vec::new(),
            for_sync: true,
            opened: false,
            last_flush_ms: now_ms(),
            last_flush_tx_count: 0,
        }
    }

    pub fn open_for_sync(&mut self) -> Result<(), DbError> {
        self.open(true)
    }

    /// Reload state after the initial sync; pending state must be flushed.
    pub fn open_for_serving(&mut self) -> Result<(), DbError> {
        if self.opened {
            log_info!("reopening db for serving");
        }
        self.open(false)
    }

    fn open(&mut self, for_sync: bool) -> Result<(), DbError> {
        self.for_sync = for_sync;
        self.read_utxo_state()?;
        self.clear_excess_history()?;
        self.clear_excess_undo_info()?;
        self.read_tx_counts()?;
        self.opened = true;
        Ok(())
    }

    fn read_utxo_state(&mut self) -> Result<(), DbError> {
        match self.store.get(Column::Utxo, STATE_KEY)? {
            None => {
                log_info!("created new database for {}", self.params.name);
                self.state = DbState::fresh(self.params.genesis_hash);
            }
            Some(bytes) => {
                let state = DbState::decode(&bytes)?;
                if state.db_version != DB_VERSION {
                    return Err(DbError::UnsupportedVersion(state.db_version));
                }
                if state.genesis != self.params.genesis_hash {
                    return Err(DbError::GenesisMismatch {
                        stored: state.genesis,
                        expected: self.params.genesis_hash,
                    });
                }
                self.state = state;
            }
        }

        self.fs_height = self.state.height;
        self.fs_tx_count = self.state.tx_count;
        self.last_flush_tx_count = self.fs_tx_count;
        self.last_flush_ms = now_ms();

        log_info!("db version: {}", self.state.db_version);
        log_info!("coin: {} {}", self.params.name, self.params.network.as_str());
        log_info!("reorg limit is {} blocks", self.params.reorg_limit);
        log_info!(
            "height: {} tip: {} tx count: {}",
            self.state.height,
            hash256_to_hex(&self.state.tip),
            self.state.tx_count
        );
        if self.state.first_sync {
            log_info!(
                "sync time so far: {}",
                formatted_time(self.state.wall_time_ms / 1000)
            );
        }
        Ok(())
    }

    /// Drop history rows of flushes after the last UTXO flush. Their blocks
    /// are above the db height and will be indexed again.
    fn clear_excess_history(&mut self) -> Result<(), DbError> {
        let utxo_flush_count = self.state.utxo_flush_count;
        if self.state.flush_count <= utxo_flush_count {
            return Ok(());
        }
        log_info!(
            "history was flushed past the UTXOs ({} > {}), clearing",
            self.state.flush_count,
            utxo_flush_count
        );

        let mut batch = WriteBatch::new();
        let mut visitor = |key: &[u8], _value: &[u8]| -> Result<(), StoreError> {
            match history_key_flush_id(key) {
                Some(flush_id) if flush_id > utxo_flush_count => {
                    batch.delete(Column::History, key);
                    Ok(())
                }
                Some(_) => Ok(()),
                None => Err(StoreError::Backend("malformed history row key".to_string())),
            }
        };
        self.store
            .for_each_prefix(Column::History, &[], &mut visitor)?;
        let deleted = batch.len();

        self.state.flush_count = utxo_flush_count;
        self.flush_state(&mut batch);
        self.store.write_batch(&batch)?;
        log_info!("deleted {} excess history rows", deleted);
        Ok(())
    }

    fn read_tx_counts(&mut self) -> Result<(), DbError> {
        let db_height = self.state.height;
        let mut tx_counts = Vec::with_capacity((db_height + 1).max(0) as usize);
        let mut visitor = |key: &[u8], value: &[u8]| -> Result<(), StoreError> {
            let (Ok(key), Ok(value)) = (<[u8; 4]>::try_from(key), <[u8; 8]>::try_from(value))
            else {
                return Err(StoreError::Backend("malformed tx count row".to_string()));
            };
            let height = u32::from_be_bytes(key) as i64;
            if height <= i64::from(db_height) && height == tx_counts.len() as i64 {
                tx_counts.push(u64::from_le_bytes(value));
            }
            Ok(())
        };
        self.store
            .for_each_prefix(Column::TxCount, &[], &mut visitor)?;

        if tx_counts.len() as i64 != i64::from(db_height) + 1 {
            return Err(DbError::Inconsistent("tx counts do not cover db height"));
        }
        if tx_counts.last().copied().unwrap_or(0) != self.state.tx_count {
            return Err(DbError::Inconsistent("tx counts disagree with db tx count"));
        }
        self.tx_counts = tx_counts;
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn params(&self) -> &CoinParams {
        &self.params
    }

    pub fn db_height(&self) -> i32 {
        self.state.height
    }

    pub fn db_tx_count(&self) -> u64 {
        self.state.tx_count
    }

    pub fn db_tip(&self) -> Hash256 {
        self.state.tip
    }

    pub fn first_sync(&self) -> bool {
        self.state.first_sync
    }

    pub fn fs_height(&self) -> i32 {
        self.fs_height
    }

    pub fn fs_tx_count(&self) -> u64 {
        self.fs_tx_count
    }

    pub fn tx_counts(&self) -> &[u64] {
        &self.tx_counts
    }

    pub fn push_tx_count(&mut self, tx_count: u64) {
        self.tx_counts.push(tx_count);
    }

    pub fn pop_tx_count(&mut self) -> Option<u64> {
        self.tx_counts.pop()
    }

    /// Persist the first-sync flag without touching the rest of the cursor.
    pub fn set_first_sync(&mut self, first_sync: bool) -> Result<(), DbError> {
        self.state.first_sync = first_sync;
        let mut batch = WriteBatch::new();
        self.flush_state(&mut batch);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    pub fn assert_flushed(&self, data: &FlushData) -> Result<(), DbError> {
        let cursor = &data.cursor;
        if cursor.tx_count != self.fs_tx_count || cursor.tx_count != self.state.tx_count {
            return Err(DbError::NotFlushed("tx count"));
        }
        if cursor.height != self.fs_height || cursor.height != self.state.height {
            return Err(DbError::NotFlushed("height"));
        }
        if cursor.tip != self.state.tip {
            return Err(DbError::NotFlushed("tip"));
        }
        if !data.is_flushed() {
            return Err(DbError::NotFlushed("pending blocks or utxos"));
        }
        Ok(())
    }

    /// Flush pending state. Filesystem data and history are always written;
    /// UTXOs, undo records and the db cursor only if `flush_utxos`.
    pub fn flush_dbs(
        &mut self,
        data: &mut FlushData,
        flush_utxos: bool,
        estimate_txs_remaining: impl FnOnce() -> f64,
    ) -> Result<(), DbError> {
        if data.cursor.height == self.state.height {
            return self.assert_flushed(data);
        }

        let start = Instant::now();
        let prior_flush_ms = self.last_flush_ms;
        let tx_delta = data.cursor.tx_count as i64 - self.last_flush_tx_count as i64;

        let mut batch = WriteBatch::new();
        self.flush_fs(&mut batch, data)?;
        self.flush_history(&mut batch, data);
        if flush_utxos {
            self.flush_utxo_db(&mut batch, data);
        }
        self.flush_state(&mut batch);
        self.store.write_batch(&batch)?;

        log_info!(
            "flush #{} took {:.1}s. height {} txs: {} ({:+})",
            self.state.flush_count,
            start.elapsed().as_secs_f64(),
            data.cursor.height,
            data.cursor.tx_count,
            tx_delta
        );

        if self.for_sync {
            let flush_interval = (self.last_flush_ms.saturating_sub(prior_flush_ms)).max(1) as f64 / 1000.0;
            let wall_secs = (self.state.wall_time_ms.max(1)) as f64 / 1000.0;
            let tx_per_sec_gen = (data.cursor.tx_count as f64 / wall_secs) as u64;
            let tx_per_sec_last = 1 + (tx_delta.max(0) as f64 / flush_interval) as u64;
            let eta = estimate_txs_remaining() / tx_per_sec_last as f64;
            log_info!(
                "tx/sec since genesis: {}, since last flush: {}",
                tx_per_sec_gen,
                tx_per_sec_last
            );
            log_info!(
                "sync time: {}  ETA: {}",
                formatted_time(self.state.wall_time_ms / 1000),
                formatted_time(eta.max(0.0) as u64)
            );
        }
        Ok(())
    }

    fn flush_fs(&mut self, batch: &mut WriteBatch, data: &mut FlushData) -> Result<(), DbError> {
        let prior_tx_count = if self.fs_height >= 0 {
            self.tx_counts
                .get(self.fs_height as usize)
                .copied()
                .ok_or(DbError::Inconsistent("tx counts shorter than fs height"))?
        } else {
            0
        };
        if data.block_tx_hashes.len() != data.headers.len() {
            return Err(DbError::Inconsistent("header and tx hash batches differ"));
        }
        if i64::from(data.cursor.height) != i64::from(self.fs_height) + data.headers.len() as i64 {
            return Err(DbError::Inconsistent("pending headers do not reach height"));
        }
        if data.cursor.tx_count != self.tx_counts.last().copied().unwrap_or(0) {
            return Err(DbError::Inconsistent("tx count disagrees with tx counts"));
        }
        if self.tx_counts.len() as i64 != i64::from(data.cursor.height) + 1 {
            return Err(DbError::Inconsistent("tx counts do not match height"));
        }
        let hash_bytes: usize = data.block_tx_hashes.iter().map(Vec::len).sum();
        if hash_bytes % 32 != 0 || (hash_bytes / 32) as u64 != data.cursor.tx_count - prior_tx_count {
            return Err(DbError::Inconsistent("pending tx hashes do not match tx count"));
        }

        let height_start = self.fs_height + 1;
        for (offset, header) in data.headers.drain(..).enumerate() {
            batch.put(Column::Header, height_key(height_start + offset as i32), header);
        }
        for height in height_start..=data.cursor.height {
            let count = self.tx_counts[height as usize];
            batch.put(Column::TxCount, height_key(height), count.to_le_bytes());
        }
        let mut tx_num = prior_tx_count;
        for blob in data.block_tx_hashes.drain(..) {
            for hash in blob.chunks_exact(32) {
                batch.put(Column::TxHash, tx_num.to_be_bytes(), hash);
                tx_num += 1;
            }
        }

        self.fs_height = data.cursor.height;
        self.fs_tx_count = data.cursor.tx_count;
        Ok(())
    }

    fn flush_history(&mut self, batch: &mut WriteBatch, data: &mut FlushData) {
        self.state.flush_count += 1;
        let flush_id = self.state.flush_count;
        let addresses = data.history.len();
        let entries = data.history.tx_num_count();
        for (hashx, row) in data.history.drain() {
            batch.put(Column::History, history_key(&hashx, flush_id), row);
        }
        log_debug!(
            "flushed history of {} addresses ({} entries) as flush {}",
            addresses,
            entries,
            flush_id
        );
    }

    fn flush_utxo_db(&mut self, batch: &mut WriteBatch, data: &mut FlushData) {
        let add_count = data.adds.len();
        let spend_count = data.deletes.len() / 2;

        data.deletes.sort_unstable();
        for key in data.deletes.drain(..) {
            batch.delete(Column::Utxo, key);
        }

        for (key, value) in data.adds.drain() {
            let hashx = value.hashx();
            let tx_num = value.tx_num_bytes();
            let index = key.index_bytes();
            batch.put(
                Column::Utxo,
                hashx_table_key(&key.tx_hash(), index, &tx_num),
                hashx,
            );
            batch.put(
                Column::Utxo,
                amount_table_key(&hashx, index, &tx_num),
                value.amount().to_le_bytes(),
            );
        }

        for (undo, height) in data.undo_infos.drain(..) {
            batch.put(Column::Utxo, undo_key(height), undo);
        }

        if self.for_sync {
            log_info!(
                "flushed {} blocks with {} txs, {} UTXO adds, {} spends, committing...",
                data.cursor.height - self.state.height,
                data.cursor.tx_count as i64 - self.state.tx_count as i64,
                add_count,
                spend_count
            );
        }

        self.state.utxo_flush_count = self.state.flush_count;
        self.state.height = data.cursor.height;
        self.state.tx_count = data.cursor.tx_count;
        self.state.tip = data.cursor.tip;
    }

    fn flush_state(&mut self, batch: &mut WriteBatch) {
        let now = now_ms();
        self.state.wall_time_ms += now.saturating_sub(self.last_flush_ms);
        self.last_flush_ms = now;
        self.last_flush_tx_count = self.fs_tx_count;
        batch.put(Column::Utxo, STATE_KEY, self.state.encode());
    }

    /// Flush after backing up one block. All UTXO changes are written and
    /// the history of every `touched` address loses its entries at or above
    /// the new tx count.
    pub fn flush_backup(
        &mut self,
        data: &mut FlushData,
        touched: &HashSet<HashX>,
    ) -> Result<(), DbError> {
        if !data.headers.is_empty() || !data.block_tx_hashes.is_empty() {
            return Err(DbError::NotFlushed("headers pending during backup"));
        }
        if !data.history.is_empty() {
            return Err(DbError::NotFlushed("history pending during backup"));
        }
        if data.cursor.height >= self.state.height {
            return Err(DbError::Inconsistent("backup flush does not lower height"));
        }

        let start = Instant::now();
        let tx_delta = data.cursor.tx_count as i64 - self.last_flush_tx_count as i64;

        self.fs_height = data.cursor.height;
        self.fs_tx_count = data.cursor.tx_count;

        let mut batch = WriteBatch::new();
        self.state.flush_count += 1;
        let removed = self.backup_history(&mut batch, touched, data.cursor.tx_count)?;
        self.flush_utxo_db(&mut batch, data);
        self.flush_state(&mut batch);
        self.store.write_batch(&batch)?;

        log_info!(
            "backup flush #{} took {:.1}s. height {} txs: {} ({:+}) history entries removed {}",
            self.state.flush_count,
            start.elapsed().as_secs_f64(),
            data.cursor.height,
            data.cursor.tx_count,
            tx_delta,
            removed
        );
        Ok(())
    }

    /// Queue the cuts that leave only tx numbers below `tx_count` in the
    /// history rows of `touched`. Returns the number of entries removed.
    fn backup_history(
        &self,
        batch: &mut WriteBatch,
        touched: &HashSet<HashX>,
        tx_count: u64,
    ) -> Result<usize, DbError> {
        let mut removed = 0;
        for hashx in touched {
            let rows = self.store.scan_prefix(Column::History, hashx)?;
            for (key, row) in rows.iter().rev() {
                let keep = row_prefix_below(row, tx_count);
                if keep == row.len() {
                    break;
                }
                removed += (row.len() - keep) / TX_NUM_LEN;
                if keep > 0 {
                    batch.put(Column::History, key.as_slice(), &row[..keep]);
                    break;
                }
                batch.delete(Column::History, key.as_slice());
            }
        }
        Ok(removed)
    }

    /// Headers from `start` up to `count`, stopping at the db height.
    pub fn read_headers(&self, start: i32, count: usize) -> Result<Vec<RawHeader>, DbError> {
        if start < 0 {
            return Err(DbError::MissingHeaders {
                start,
                count,
                found: 0,
            });
        }
        let available = (i64::from(self.state.height) + 1 - i64::from(start)).max(0) as usize;
        let disk_count = count.min(available);
        let mut headers = Vec::with_capacity(disk_count);
        for height in start..start + disk_count as i32 {
            let Some(bytes) = self.store.get(Column::Header, &height_key(height))? else {
                break;
            };
            let header: RawHeader = bytes
                .as_slice()
                .try_into()
                .map_err(|_| DbError::Inconsistent("stored header has wrong length"))?;
            headers.push(header);
        }
        Ok(headers)
    }

    pub fn fs_block_hashes(&self, start: i32, count: usize) -> Result<Vec<Hash256>, DbError> {
        let headers = self.read_headers(start, count)?;
        if headers.len() != count {
            return Err(DbError::MissingHeaders {
                start,
                count,
                found: headers.len(),
            });
        }
        Ok(headers.iter().map(header_hash).collect())
    }

    /// Hash and height of transaction `tx_num`, or `None` if its block is
    /// above the db height.
    pub fn fs_tx_hash(&self, tx_num: u64) -> Result<Option<(Hash256, i32)>, DbError> {
        let tx_height = self.tx_counts.partition_point(|&count| count <= tx_num) as i32;
        if tx_height > self.state.height {
            return Ok(None);
        }
        let Some(bytes) = self.store.get(Column::TxHash, &tx_num.to_be_bytes())? else {
            return Err(DbError::Inconsistent("tx hash missing below db height"));
        };
        let hash: Hash256 = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DbError::Inconsistent("stored tx hash has wrong length"))?;
        Ok(Some((hash, tx_height)))
    }

    /// Transaction hashes of the block at `height`, in block order.
    pub fn fs_tx_hashes_at_height(&self, height: i32) -> Result<Vec<Hash256>, DbError> {
        if height < 0 || height > self.state.height {
            return Err(DbError::MissingHeaders {
                start: height,
                count: 1,
                found: 0,
            });
        }
        let first = if height > 0 {
            self.tx_counts[height as usize - 1]
        } else {
            0
        };
        let last = self.tx_counts[height as usize];
        let mut hashes = Vec::with_capacity((last - first) as usize);
        for tx_num in first..last {
            let bytes = self
                .store
                .get(Column::TxHash, &tx_num.to_be_bytes())?
                .ok_or(DbError::Inconsistent("tx hash missing below db height"))?;
            let hash: Hash256 = bytes
                .as_slice()
                .try_into()
                .map_err(|_| DbError::Inconsistent("stored tx hash has wrong length"))?;
            hashes.push(hash);
        }
        Ok(hashes)
    }

    /// Lowest height whose undo information is kept when the tip is at
    /// `max_height`.
    pub fn min_undo_height(&self, max_height: i32) -> i32 {
        self.params.min_undo_height(max_height)
    }

    pub fn read_undo_info(&self, height: i32) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.store.get(Column::Utxo, &undo_key(height))?)
    }

    pub fn read_raw_block(&self, height: i32) -> Result<Option<Vec<u8>>, DbError> {
        if height < 0 {
            return Ok(None);
        }
        Ok(self.store.get(Column::RawBlock, &height_key(height))?)
    }

    /// Store a raw block and drop the one that just left the reorg window.
    pub fn write_raw_block(&self, raw: &[u8], height: i32) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        batch.put(Column::RawBlock, height_key(height), raw);
        let stale = self.min_undo_height(height) - 1;
        if stale >= 0 {
            batch.delete(Column::RawBlock, height_key(stale));
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Remove undo records and raw blocks below the reorg window of the db
    /// height.
    pub fn clear_excess_undo_info(&self) -> Result<(), DbError> {
        let min_height = self.min_undo_height(self.state.height);
        let mut batch = WriteBatch::new();

        let mut undo_count = 0usize;
        let mut visit_undo = |key: &[u8], _value: &[u8]| -> Result<(), StoreError> {
            if let Some(height) = undo_key_height(key) {
                if height < min_height {
                    batch.delete(Column::Utxo, key);
                    undo_count += 1;
                }
            }
            Ok(())
        };
        self.store
            .for_each_prefix(Column::Utxo, &[UNDO_TABLE_PREFIX], &mut visit_undo)?;

        let mut block_count = 0usize;
        let mut visit_block = |key: &[u8], _value: &[u8]| -> Result<(), StoreError> {
            if let Ok(raw) = <[u8; 4]>::try_from(key) {
                if (u32::from_be_bytes(raw) as i64) < i64::from(min_height) {
                    batch.delete(Column::RawBlock, key);
                    block_count += 1;
                }
            }
            Ok(())
        };
        self.store
            .for_each_prefix(Column::RawBlock, &[], &mut visit_block)?;

        if !batch.is_empty() {
            self.store.write_batch(&batch)?;
        }
        if undo_count > 0 {
            log_info!("deleted {} stale undo entries", undo_count);
        }
        if block_count > 0 {
            log_info!("deleted {} stale raw blocks", block_count);
        }
        Ok(())
    }

    /// Transactions touching `hashx`, oldest first, at most `limit` of them.
    /// Entries above the db height are left out.
    pub fn limited_history(
        &self,
        hashx: &HashX,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, DbError> {
        let limit = limit.unwrap_or(usize::MAX);
        let mut history = Vec::new();
        for (_key, row) in self.store.scan_prefix(Column::History, hashx)? {
            for tx_num in row_tx_nums(&row) {
                if history.len() >= limit {
                    return Ok(history);
                }
                let Some((tx_hash, height)) = self.fs_tx_hash(tx_num)? else {
                    log_debug!("limited_history: tx {} above db height", tx_num);
                    return Ok(history);
                };
                history.push(HistoryEntry {
                    tx_num,
                    tx_hash,
                    height,
                });
            }
        }
        Ok(history)
    }

    /// All flushed UTXOs paying to `hashx`.
    pub fn all_utxos(&self, hashx: &HashX) -> Result<Vec<UtxoRecord>, DbError> {
        let rows = self
            .store
            .scan_prefix(Column::Utxo, &amount_table_prefix(hashx))?;
        let mut utxos = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if key.len() != AMOUNT_KEY_LEN {
                return Err(DbError::Inconsistent("malformed amount row key"));
            }
            let amount: [u8; 8] = value
                .as_slice()
                .try_into()
                .map_err(|_| DbError::Inconsistent("malformed amount row value"))?;
            let pos_start = 1 + HASHX_LEN;
            let mut tx_pos = [0u8; 4];
            tx_pos.copy_from_slice(&key[pos_start..pos_start + 4]);
            let mut tx_num: TxNum = [0u8; TX_NUM_LEN];
            tx_num.copy_from_slice(&key[pos_start + 4..]);
            let tx_num = unpack_tx_num(&tx_num);
            let Some((tx_hash, height)) = self.fs_tx_hash(tx_num)? else {
                log_warn!("all_utxos: tx {} not on disk", tx_num);
                continue;
            };
            utxos.push(UtxoRecord {
                tx_num,
                tx_pos: u32::from_le_bytes(tx_pos),
                tx_hash,
                height,
                value: u64::from_le_bytes(amount),
            });
        }
        Ok(utxos)
    }

    /// `(hashX, value)` of a flushed, unspent output.
    pub fn lookup_utxo(&self, tx_hash: &Hash256, index: u32) -> Result<Option<(HashX, u64)>, DbError> {
        let prefix = hashx_table_prefix(tx_hash, index);
        for (key, hashx) in self.store.scan_prefix(Column::Utxo, &prefix)? {
            let (Some(tx_num), Ok(hashx)) = (hashx_row_tx_num(&key), HashX::try_from(hashx.as_slice()))
            else {
                return Err(DbError::Inconsistent("malformed hashX row"));
            };
            match self.fs_tx_hash(unpack_tx_num(&tx_num))? {
                Some((hash, _)) if hash == *tx_hash => {}
                _ => continue,
            }
            let key = amount_table_key(&hashx, index.to_le_bytes(), &tx_num);
            if let Some(value) = self.store.get(Column::Utxo, &key)? {
                let amount: [u8; 8] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| DbError::Inconsistent("malformed amount row value"))?;
                return Ok(Some((hashx, u64::from_le_bytes(amount))));
            }
        }
        log_debug!("no flushed utxo for {}:{}", hash256_to_hex(tx_hash), index);
        Ok(None)
    }
}

/// Transaction number stored at the tail of an `h` row key.
pub fn hashx_row_tx_num(key: &[u8]) -> Option<TxNum> {
    if key.len() != HASHX_KEY_LEN {
        return None;
    }
    let mut tx_num = [0u8; TX_NUM_LEN];
    tx_num.copy_from_slice(&key[HASHX_KEY_LEN - TX_NUM_LEN..]);
    Some(tx_num)
}

fn height_key(height: i32) -> [u8; 4] {
    (height as u32).to_be_bytes()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// `1d 02h 03m 04s`, dropping leading zero units.
pub fn formatted_time(secs: u64) -> String {
    let parts = [
        (secs / 86_400, 'd'),
        ((secs % 86_400) / 3600, 'h'),
        ((secs % 3600) / 60, 'm'),
        (secs % 60, 's'),
    ];
    let mut out = Vec::new();
    for (value, unit) in parts {
        if out.is_empty() && value == 0 && unit != 's' {
            continue;
        }
        if out.is_empty() {
            out.push(format!("{value}{unit}"));
        } else {
            out.push(format!("{value:02}{unit}"));
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_roundtrip_and_length() {
        let state = DbState {
            db_version: DB_VERSION,
            genesis: [1u8; 32],
            height: 812,
            tx_count: 9_000,
            tip: [2u8; 32],
            flush_count: 6,
            utxo_flush_count: 4,
            wall_time_ms: 12_345,
            first_sync: false,
        };
        let bytes = state.encode();
        assert_eq!(bytes.len(), 4 + 32 + 4 + 8 + 32 + 4 + 4 + 8 + 1);
        assert_eq!(DbState::decode(&bytes), Ok(state));
        assert_eq!(
            DbState::decode(&bytes[..bytes.len() - 1]),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn formatted_time_drops_leading_units() {
        assert_eq!(formatted_time(0), "0s");
        assert_eq!(formatted_time(59), "59s");
        assert_eq!(formatted_time(61), "1m 01s");
        assert_eq!(formatted_time(90_061), "1d 01h 01m 01s");
    }

    #[test]
    fn hashx_row_tail_is_tx_num() {
        let key = hashx_table_key(&[9u8; 32], 1u32.to_le_bytes(), &[1, 2, 3, 4, 5]);
        assert_eq!(hashx_row_tx_num(&key), Some([1, 2, 3, 4, 5]));
        assert_eq!(hashx_row_tx_num(&key[1..]), None);
    }
}
