//! In-memory UTXO cache and the on-disk row layout of the UTXO tables.
//!
//! Cache entries are fixed width:
//!
//! ```text
//! key:   tx_hash (32) ++ output index LE (4)              = 36 bytes
//! value: hashX (11) ++ tx_num LE (5) ++ amount LE (8)      = 24 bytes
//! ```
//!
//! Flushed UTXOs live in two tables of the `Utxo` column:
//!
//! ```text
//! b'h' ++ tx_hash[..4] ++ idx LE ++ tx_num  ->  hashX
//! b'u' ++ hashX ++ idx LE ++ tx_num          ->  amount LE
//! ```
//!
//! Only four bytes of the transaction hash are kept in the `h` table, so a
//! lookup scans every row sharing the prefix and resolves collisions
//! through the transaction number.

use std::collections::hash_map::{self, HashMap};

use novoindex_consensus::Hash256;
use novoindex_primitives::script::{HashX, HASHX_LEN};

pub const UTXO_KEY_LEN: usize = 36;
pub const UTXO_VALUE_LEN: usize = HASHX_LEN + TX_NUM_LEN + 8;
pub const TX_NUM_LEN: usize = 5;

pub const HASHX_TABLE_PREFIX: u8 = b'h';
pub const AMOUNT_TABLE_PREFIX: u8 = b'u';

pub const HASHX_KEY_LEN: usize = 1 + 4 + 4 + TX_NUM_LEN;
pub const AMOUNT_KEY_LEN: usize = 1 + HASHX_LEN + 4 + TX_NUM_LEN;

/// Compact transaction number: the low five bytes of the running counter.
pub type TxNum = [u8; TX_NUM_LEN];

pub fn pack_tx_num(tx_num: u64) -> TxNum {
    let bytes = tx_num.to_le_bytes();
    let mut out = [0u8; TX_NUM_LEN];
    out.copy_from_slice(&bytes[..TX_NUM_LEN]);
    out
}

pub fn unpack_tx_num(packed: &TxNum) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..TX_NUM_LEN].copy_from_slice(packed);
    u64::from_le_bytes(bytes)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UtxoKey([u8; UTXO_KEY_LEN]);

impl UtxoKey {
    pub fn new(tx_hash: &Hash256, index: u32) -> Self {
        let mut bytes = [0u8; UTXO_KEY_LEN];
        bytes[..32].copy_from_slice(tx_hash);
        bytes[32..].copy_from_slice(&index.to_le_bytes());
        Self(bytes)
    }

    pub fn tx_hash(&self) -> Hash256 {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[..32]);
        out
    }

    pub fn index_bytes(&self) -> [u8; 4] {
        let mut out = [0u8; 4];
        out.copy_from_slice(&self.0[32..]);
        out
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct UtxoValue([u8; UTXO_VALUE_LEN]);

impl UtxoValue {
    pub fn new(hashx: &HashX, tx_num: &TxNum, amount: u64) -> Self {
        let mut bytes = [0u8; UTXO_VALUE_LEN];
        bytes[..HASHX_LEN].copy_from_slice(hashx);
        bytes[HASHX_LEN..HASHX_LEN + TX_NUM_LEN].copy_from_slice(tx_num);
        bytes[HASHX_LEN + TX_NUM_LEN..].copy_from_slice(&amount.to_le_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; UTXO_VALUE_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn hashx(&self) -> HashX {
        let mut out = [0u8; HASHX_LEN];
        out.copy_from_slice(&self.0[..HASHX_LEN]);
        out
    }

    pub fn tx_num_bytes(&self) -> TxNum {
        let mut out = [0u8; TX_NUM_LEN];
        out.copy_from_slice(&self.0[HASHX_LEN..HASHX_LEN + TX_NUM_LEN]);
        out
    }

    pub fn tx_num(&self) -> u64 {
        unpack_tx_num(&self.tx_num_bytes())
    }

    pub fn amount(&self) -> u64 {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.0[HASHX_LEN + TX_NUM_LEN..]);
        u64::from_le_bytes(out)
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }
}

/// Unflushed UTXOs keyed by outpoint.
#[derive(Clone, Debug, Default)]
pub struct UtxoCache {
    entries: HashMap<UtxoKey, UtxoValue>,
}

impl UtxoCache {
    /// Raw key plus value bytes held per entry.
    pub const ENTRY_BYTES: usize = UTXO_KEY_LEN + UTXO_VALUE_LEN;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: UtxoKey, value: UtxoValue) -> Option<UtxoValue> {
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &UtxoKey) -> Option<UtxoValue> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &UtxoKey) -> Option<&UtxoValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.entries.len() * Self::ENTRY_BYTES
    }

    pub fn iter(&self) -> hash_map::Iter<'_, UtxoKey, UtxoValue> {
        self.entries.iter()
    }

    pub fn drain(&mut self) -> hash_map::Drain<'_, UtxoKey, UtxoValue> {
        self.entries.drain()
    }
}

pub fn hashx_table_prefix(tx_hash: &Hash256, index: u32) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = HASHX_TABLE_PREFIX;
    key[1..5].copy_from_slice(&tx_hash[..4]);
    key[5..9].copy_from_slice(&index.to_le_bytes());
    key
}

pub fn hashx_table_key(tx_hash: &Hash256, index: [u8; 4], tx_num: &TxNum) -> [u8; HASHX_KEY_LEN] {
    let mut key = [0u8; HASHX_KEY_LEN];
    key[0] = HASHX_TABLE_PREFIX;
    key[1..5].copy_from_slice(&tx_hash[..4]);
    key[5..9].copy_from_slice(&index);
    key[9..].copy_from_slice(tx_num);
    key
}

pub fn amount_table_key(hashx: &HashX, index: [u8; 4], tx_num: &TxNum) -> [u8; AMOUNT_KEY_LEN] {
    let mut key = [0u8; AMOUNT_KEY_LEN];
    key[0] = AMOUNT_TABLE_PREFIX;
    key[1..1 + HASHX_LEN].copy_from_slice(hashx);
    key[1 + HASHX_LEN..5 + HASHX_LEN].copy_from_slice(&index);
    key[5 + HASHX_LEN..].copy_from_slice(tx_num);
    key
}

pub fn amount_table_prefix(hashx: &HashX) -> [u8; 1 + HASHX_LEN] {
    let mut key = [0u8; 1 + HASHX_LEN];
    key[0] = AMOUNT_TABLE_PREFIX;
    key[1..].copy_from_slice(hashx);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tx_num_keeps_low_five_bytes() {
        assert_eq!(pack_tx_num(0x01_0203_0405), [0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(pack_tx_num(0xff_00_0000_0001), [0x01, 0, 0, 0, 0]);
        assert_eq!(unpack_tx_num(&pack_tx_num(123_456_789)), 123_456_789);
    }

    #[test]
    fn value_layout() {
        let hashx = [7u8; HASHX_LEN];
        let value = UtxoValue::new(&hashx, &pack_tx_num(9), 50_000);
        let bytes = value.as_bytes();
        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..11], &hashx);
        assert_eq!(&bytes[11..16], &[9, 0, 0, 0, 0]);
        assert_eq!(&bytes[16..], &50_000u64.to_le_bytes());
        assert_eq!(value.hashx(), hashx);
        assert_eq!(value.tx_num(), 9);
        assert_eq!(value.amount(), 50_000);
        assert_eq!(UtxoValue::from_slice(bytes), Some(value));
        assert_eq!(UtxoValue::from_slice(&bytes[1..]), None);
    }

    #[test]
    fn table_keys() {
        let tx_hash: Hash256 = std::array::from_fn(|i| i as u8);
        let key = UtxoKey::new(&tx_hash, 3);
        let tx_num = pack_tx_num(0x0102);
        let h = hashx_table_key(&tx_hash, key.index_bytes(), &tx_num);
        assert_eq!(h[0], b'h');
        assert_eq!(&h[1..5], &[0, 1, 2, 3]);
        assert_eq!(&h[5..9], &3u32.to_le_bytes());
        assert_eq!(&h[9..], &[0x02, 0x01, 0, 0, 0]);
        assert!(h.starts_with(&hashx_table_prefix(&tx_hash, 3)));

        let hashx = [0xaa; HASHX_LEN];
        let u = amount_table_key(&hashx, key.index_bytes(), &tx_num);
        assert_eq!(u.len(), 21);
        assert_eq!(u[0], b'u');
        assert!(u.starts_with(&amount_table_prefix(&hashx)));
        assert_eq!(&u[12..16], &3u32.to_le_bytes());
    }
}
