//! Applying and reverting blocks against the UTXO set.

use std::collections::HashSet;
use std::fmt;

use novoindex_consensus::{hash256_to_hex, Hash256};
use novoindex_log::{log_debug, log_info};
use novoindex_primitives::block::Block;
use novoindex_primitives::script::{hashx_from_script, is_unspendable, HashX};
use novoindex_primitives::transaction::{Transaction, TxOut};
use novoindex_storage::{Column, KeyValueStore, StoreError};

use crate::db::{hashx_row_tx_num, DbError, IndexDb};
use crate::flush::{ChainCursor, FlushData};
use crate::undo::{UndoReader, UndoRecord};
use crate::utxo::{
    amount_table_key, hashx_table_prefix, pack_tx_num, unpack_tx_num, UtxoKey, UtxoValue,
};

#[derive(Debug)]
pub enum ChainStateError {
    Db(DbError),
    Store(StoreError),
    MissingUtxo { tx_hash: Hash256, index: u32 },
    MissingUndo { height: i32 },
    UndoMismatch { height: i32, remaining: usize },
    TipMismatch { block: Hash256, tip: Hash256, height: i32 },
    BackupBelowGenesis,
    CorruptIndex(&'static str),
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Db(err) => write!(f, "{err}"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::MissingUtxo { tx_hash, index } => write!(
                f,
                "UTXO {} / {} not found in \"h\" table",
                hash256_to_hex(tx_hash),
                index
            ),
            ChainStateError::MissingUndo { height } => {
                write!(f, "no undo information found for height {height}")
            }
            ChainStateError::UndoMismatch { height, remaining } => write!(
                f,
                "undo information for height {height} has {remaining} unused bytes"
            ),
            ChainStateError::TipMismatch { block, tip, height } => write!(
                f,
                "block {} does not connect to tip {} at height {}",
                hash256_to_hex(block),
                hash256_to_hex(tip),
                height
            ),
            ChainStateError::BackupBelowGenesis => write!(f, "cannot back up the genesis block"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<DbError> for ChainStateError {
    fn from(err: DbError) -> Self {
        ChainStateError::Db(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

/// Outputs that get a UTXO entry: spendable at `height` and not negative.
pub fn is_indexed_output(txout: &TxOut, height: i32, genesis_activation: i32) -> bool {
    txout.value >= 0 && !is_unspendable(&txout.script_pubkey, height, genesis_activation)
}

/// The in-memory chain on top of the flushed database.
pub struct ChainState<S> {
    db: IndexDb<S>,
    pending: FlushData,
    touched: HashSet<HashX>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(db: IndexDb<S>) -> Self {
        let cursor = ChainCursor {
            height: db.db_height(),
            tx_count: db.db_tx_count(),
            tip: db.db_tip(),
        };
        Self {
            db,
            pending: FlushData::new(cursor),
            touched: HashSet::new(),
        }
    }

    /// Open the database for syncing and reset the in-memory chain to it.
    pub fn open_for_sync(&mut self) -> Result<(), ChainStateError> {
        self.db.open_for_sync()?;
        self.pending = FlushData::new(ChainCursor {
            height: self.db.db_height(),
            tx_count: self.db.db_tx_count(),
            tip: self.db.db_tip(),
        });
        self.touched.clear();
        Ok(())
    }

    pub fn open_for_serving(&mut self) -> Result<(), ChainStateError> {
        self.db.assert_flushed(&self.pending)?;
        self.db.open_for_serving()?;
        Ok(())
    }

    pub fn db(&self) -> &IndexDb<S> {
        &self.db
    }

    pub fn height(&self) -> i32 {
        self.pending.cursor.height
    }

    pub fn tip(&self) -> Hash256 {
        self.pending.cursor.tip
    }

    pub fn tx_count(&self) -> u64 {
        self.pending.cursor.tx_count
    }

    pub fn pending(&self) -> &FlushData {
        &self.pending
    }

    pub fn take_touched(&mut self) -> HashSet<HashX> {
        std::mem::take(&mut self.touched)
    }

    pub fn first_sync(&self) -> bool {
        self.db.first_sync()
    }

    pub fn set_first_sync_done(&mut self) -> Result<(), ChainStateError> {
        if self.db.first_sync() {
            self.db.set_first_sync(false)?;
        }
        Ok(())
    }

    /// Apply the block following the tip.
    ///
    /// Undo information is kept when the block is inside the reorg window
    /// of `daemon_height`, and the raw block is stored for later backups.
    pub fn connect_block(&mut self, block: &Block, daemon_height: i32) -> Result<(), ChainStateError> {
        let prev_hash = block.prev_hash();
        if prev_hash != self.pending.cursor.tip {
            return Err(ChainStateError::TipMismatch {
                block: block.hash(),
                tip: self.pending.cursor.tip,
                height: self.pending.cursor.height,
            });
        }

        let height = self.pending.cursor.height + 1;
        let undo = self.advance_txs(&block.transactions, height)?;

        if height >= self.db.min_undo_height(daemon_height) {
            self.pending.undo_infos.push((undo, height));
            self.db.write_raw_block(&block.raw, height)?;
        }

        self.pending.headers.push(block.header);
        self.pending.cursor.height = height;
        self.pending.cursor.tip = block.hash();
        Ok(())
    }

    /// Spend inputs and add outputs of `txs` at `height`; returns the undo
    /// record of the spent values. Every spendable output and every spent
    /// input is added to the address history of its transaction.
    pub fn advance_txs(
        &mut self,
        txs: &[(Transaction, Hash256)],
        height: i32,
    ) -> Result<Vec<u8>, ChainStateError> {
        let activation = self.db.params().genesis_activation;
        let mut undo = UndoRecord::new();
        let mut tx_hashes = Vec::with_capacity(txs.len() * 32);
        let mut tx_num = self.pending.cursor.tx_count;

        for (tx, tx_hash) in txs {
            for txin in &tx.vin {
                if txin.is_generation() {
                    continue;
                }
                let value = self.spend_utxo(&txin.prevout.hash, txin.prevout.index)?;
                self.touched.insert(value.hashx());
                self.pending.history.add(value.hashx(), tx_num);
                undo.push(&value);
            }

            let packed = pack_tx_num(tx_num);
            for (index, txout) in tx.vout.iter().enumerate() {
                if is_unspendable(&txout.script_pubkey, height, activation) {
                    continue;
                }
                let hashx = hashx_from_script(&txout.script_pubkey);
                self.touched.insert(hashx);
                self.pending.history.add(hashx, tx_num);
                if !is_indexed_output(txout, height, activation) {
                    continue;
                }
                self.pending.adds.insert(
                    UtxoKey::new(tx_hash, index as u32),
                    UtxoValue::new(&hashx, &packed, txout.value as u64),
                );
            }

            tx_hashes.extend_from_slice(tx_hash);
            tx_num += 1;
        }

        self.pending.block_tx_hashes.push(tx_hashes);
        self.pending.cursor.tx_count = tx_num;
        self.db.push_tx_count(tx_num);
        Ok(undo.into_bytes())
    }

    /// Revert the tip block. Everything must be flushed beforehand.
    pub fn disconnect_block(&mut self, block: &Block) -> Result<(), ChainStateError> {
        self.db.assert_flushed(&self.pending)?;
        let cursor = self.pending.cursor;
        let hash = block.hash();
        if hash != cursor.tip {
            return Err(ChainStateError::TipMismatch {
                block: hash,
                tip: cursor.tip,
                height: cursor.height,
            });
        }
        if cursor.height <= 0 {
            return Err(ChainStateError::BackupBelowGenesis);
        }

        let undo = self
            .db
            .read_undo_info(cursor.height)?
            .ok_or(ChainStateError::MissingUndo {
                height: cursor.height,
            })?;
        self.backup_txs(&block.transactions, &undo, cursor.height)?;

        self.db.pop_tx_count();
        let tx_count = self.db.tx_counts().last().copied().unwrap_or(0);
        if cursor.tx_count - block.transactions.len() as u64 != tx_count {
            return Err(ChainStateError::CorruptIndex(
                "tx count after backup disagrees with tx counts",
            ));
        }
        self.pending.cursor = ChainCursor {
            height: cursor.height - 1,
            tx_count,
            tip: block.prev_hash(),
        };
        log_debug!("backed up to height {}", self.pending.cursor.height);
        Ok(())
    }

    /// Undo `txs` in reverse: spend their outputs, restore their inputs.
    pub fn backup_txs(
        &mut self,
        txs: &[(Transaction, Hash256)],
        undo: &[u8],
        height: i32,
    ) -> Result<(), ChainStateError> {
        let activation = self.db.params().genesis_activation;
        let mut reader = UndoReader::new(undo);

        for (tx, tx_hash) in txs.iter().rev() {
            for (index, txout) in tx.vout.iter().enumerate() {
                if is_indexed_output(txout, height, activation) {
                    let value = self.spend_utxo(tx_hash, index as u32)?;
                    self.touched.insert(value.hashx());
                } else if !is_unspendable(&txout.script_pubkey, height, activation) {
                    // Negative outputs are only in the history.
                    self.touched.insert(hashx_from_script(&txout.script_pubkey));
                }
            }

            for txin in tx.vin.iter().rev() {
                if txin.is_generation() {
                    continue;
                }
                let value = reader.pop().ok_or(ChainStateError::UndoMismatch {
                    height,
                    remaining: reader.remaining(),
                })?;
                self.touched.insert(value.hashx());
                self.pending
                    .adds
                    .insert(UtxoKey::new(&txin.prevout.hash, txin.prevout.index), value);
            }
        }

        if reader.remaining() != 0 {
            return Err(ChainStateError::UndoMismatch {
                height,
                remaining: reader.remaining(),
            });
        }
        Ok(())
    }

    /// Remove an output from the UTXO set and return its value.
    ///
    /// Unflushed outputs come from the cache. Flushed ones are found through
    /// the `h` table; rows sharing the four-byte hash prefix are told apart
    /// by the full hash of their transaction number. Both rows of the match
    /// are queued for deletion.
    pub fn spend_utxo(&mut self, tx_hash: &Hash256, index: u32) -> Result<UtxoValue, ChainStateError> {
        if let Some(value) = self.pending.adds.remove(&UtxoKey::new(tx_hash, index)) {
            return Ok(value);
        }

        let prefix = hashx_table_prefix(tx_hash, index);
        let candidates = self.db.store().scan_prefix(Column::Utxo, &prefix)?;
        let ambiguous = candidates.len() > 1;
        for (hashx_key, hashx) in candidates {
            let tx_num = hashx_row_tx_num(&hashx_key)
                .ok_or(ChainStateError::CorruptIndex("malformed hashX row key"))?;
            let hashx = HashX::try_from(hashx.as_slice())
                .map_err(|_| ChainStateError::CorruptIndex("malformed hashX row value"))?;

            if ambiguous {
                match self.db.fs_tx_hash(unpack_tx_num(&tx_num))? {
                    Some((hash, _)) if hash == *tx_hash => {}
                    Some(_) => continue,
                    None => {
                        return Err(ChainStateError::CorruptIndex(
                            "hashX row refers to an unflushed transaction",
                        ))
                    }
                }
            }

            let amount_key = amount_table_key(&hashx, index.to_le_bytes(), &tx_num);
            let Some(amount) = self.db.store().get(Column::Utxo, &amount_key)? else {
                continue;
            };
            let amount: [u8; 8] = amount
                .as_slice()
                .try_into()
                .map_err(|_| ChainStateError::CorruptIndex("malformed amount row value"))?;

            self.pending.deletes.push(hashx_key);
            self.pending.deletes.push(amount_key.to_vec());
            return Ok(UtxoValue::new(&hashx, &tx_num, u64::from_le_bytes(amount)));
        }

        Err(ChainStateError::MissingUtxo {
            tx_hash: *tx_hash,
            index,
        })
    }

    /// Flush pending state; UTXOs and the db cursor only if `flush_utxos`.
    pub fn flush(&mut self, flush_utxos: bool, daemon_height: i32) -> Result<(), ChainStateError> {
        let params = self.db.params().clone();
        let cursor = self.pending.cursor;
        self.db.flush_dbs(&mut self.pending, flush_utxos, || {
            params.estimate_txs_remaining(cursor.height, cursor.tx_count, daemon_height)
        })?;
        Ok(())
    }

    /// Flush after a backup. History rows of touched addresses are cut back
    /// to the new tx count.
    pub fn flush_backup(&mut self) -> Result<(), ChainStateError> {
        self.db.flush_backup(&mut self.pending, &self.touched)?;
        Ok(())
    }

    /// `None` if nothing needs flushing, otherwise whether UTXOs should be
    /// flushed too.
    pub fn check_cache_size(&self, cache_bytes: usize) -> Option<bool> {
        let utxo_bytes = self.pending.utxo_bytes();
        let history_bytes = self.pending.history_bytes();
        let total = utxo_bytes + history_bytes;
        log_debug!(
            "cache: {} utxo bytes, {} history bytes, limit {}",
            utxo_bytes,
            history_bytes,
            cache_bytes
        );
        if total >= cache_bytes || history_bytes >= cache_bytes / 5 {
            log_info!(
                "cache usage {}MB of {}MB, flushing",
                total / 1_000_000,
                cache_bytes / 1_000_000
            );
            return Some(utxo_bytes >= cache_bytes * 4 / 5);
        }
        None
    }
}
