//! Per-block undo records.
//!
//! A record is the concatenation of the cache values spent by a block's
//! non-generation inputs, in spend order. Backing up walks the block in
//! reverse, so records are consumed from the tail.

use crate::utxo::{UtxoValue, UTXO_VALUE_LEN};

pub const UNDO_TABLE_PREFIX: u8 = b'U';

pub fn undo_key(height: i32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = UNDO_TABLE_PREFIX;
    key[1..].copy_from_slice(&(height as u32).to_be_bytes());
    key
}

pub fn undo_key_height(key: &[u8]) -> Option<i32> {
    if key.len() != 5 || key[0] != UNDO_TABLE_PREFIX {
        return None;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&key[1..]);
    Some(u32::from_be_bytes(raw) as i32)
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UndoRecord {
    bytes: Vec<u8>,
}

impl UndoRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: &UtxoValue) {
        self.bytes.extend_from_slice(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.bytes.len() / UTXO_VALUE_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Tail-first cursor over a stored undo record.
pub struct UndoReader<'a> {
    bytes: &'a [u8],
    end: usize,
}

impl<'a> UndoReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            end: bytes.len(),
        }
    }

    /// Next value from the end, or `None` once fewer than one full entry
    /// remains.
    pub fn pop(&mut self) -> Option<UtxoValue> {
        let start = self.end.checked_sub(UTXO_VALUE_LEN)?;
        let value = UtxoValue::from_slice(&self.bytes[start..self.end])?;
        self.end = start;
        Some(value)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.end
    }
}
