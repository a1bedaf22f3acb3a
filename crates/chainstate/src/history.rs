//! Per-address transaction history.
//!
//! Flushed rows live in the `History` column:
//!
//! ```text
//! hashX (11) ++ flush id u32 BE  ->  tx_num (5 bytes LE) ...
//! ```
//!
//! Each flush writes at most one row per hashX. Tx numbers inside a row are
//! ascending, and a row with a higher flush id only holds higher numbers, so
//! a prefix scan over a hashX yields its history in chain order.

use std::collections::hash_map::{self, HashMap};

use novoindex_primitives::script::{HashX, HASHX_LEN};

use crate::utxo::{pack_tx_num, unpack_tx_num, TxNum, TX_NUM_LEN};

pub const HISTORY_KEY_LEN: usize = HASHX_LEN + 4;

pub fn history_key(hashx: &HashX, flush_id: u32) -> [u8; HISTORY_KEY_LEN] {
    let mut key = [0u8; HISTORY_KEY_LEN];
    key[..HASHX_LEN].copy_from_slice(hashx);
    key[HASHX_LEN..].copy_from_slice(&flush_id.to_be_bytes());
    key
}

pub fn history_key_flush_id(key: &[u8]) -> Option<u32> {
    let raw: [u8; 4] = key.get(HASHX_LEN..)?.try_into().ok()?;
    Some(u32::from_be_bytes(raw))
}

/// Tx numbers packed in a history row.
pub fn row_tx_nums(row: &[u8]) -> impl Iterator<Item = u64> + '_ {
    row.chunks_exact(TX_NUM_LEN).map(|chunk| {
        let mut packed: TxNum = [0u8; TX_NUM_LEN];
        packed.copy_from_slice(chunk);
        unpack_tx_num(&packed)
    })
}

/// Length of the prefix of `row` holding tx numbers below `tx_count`.
pub fn row_prefix_below(row: &[u8], tx_count: u64) -> usize {
    row_tx_nums(row).take_while(|&tx_num| tx_num < tx_count).count() * TX_NUM_LEN
}

/// History appended since the last flush, keyed by hashX.
#[derive(Clone, Debug, Default)]
pub struct HistoryCache {
    entries: HashMap<HashX, Vec<u8>>,
    tx_nums: usize,
}

impl HistoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that transaction `tx_num` touched `hashx`. Transactions must
    /// be added in ascending order; repeats of the last one are ignored.
    pub fn add(&mut self, hashx: HashX, tx_num: u64) {
        let packed = pack_tx_num(tx_num);
        let row = self.entries.entry(hashx).or_default();
        if row.ends_with(&packed) {
            return;
        }
        row.extend_from_slice(&packed);
        self.tx_nums += 1;
    }

    /// Number of distinct addresses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total `(hashX, tx)` pairs held.
    pub fn tx_num_count(&self) -> usize {
        self.tx_nums
    }

    pub fn byte_size(&self) -> usize {
        self.entries.len() * HASHX_LEN + self.tx_nums * TX_NUM_LEN
    }

    pub fn drain(&mut self) -> hash_map::Drain<'_, HashX, Vec<u8>> {
        self.tx_nums = 0;
        self.entries.drain()
    }
}
