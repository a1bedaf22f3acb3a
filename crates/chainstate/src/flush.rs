//! Pending state handed to the database on flush.

use novoindex_consensus::Hash256;
use novoindex_primitives::block::{RawHeader, HEADER_SIZE};

use crate::history::HistoryCache;
use crate::utxo::UtxoCache;

/// Height, transaction count and tip of the in-memory chain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainCursor {
    pub height: i32,
    pub tx_count: u64,
    pub tip: Hash256,
}

impl ChainCursor {
    pub fn empty() -> Self {
        Self {
            height: -1,
            tx_count: 0,
            tip: [0u8; 32],
        }
    }
}

impl Default for ChainCursor {
    fn default() -> Self {
        Self::empty()
    }
}

/// Everything advanced since the last flush.
///
/// `headers` and `block_tx_hashes` have one entry per block above the
/// last filesystem flush; `undo_infos` only covers blocks inside the
/// reorg window. `history` is written on every flush, like the headers.
#[derive(Debug, Default)]
pub struct FlushData {
    pub cursor: ChainCursor,
    pub headers: Vec<RawHeader>,
    pub block_tx_hashes: Vec<Vec<u8>>,
    pub undo_infos: Vec<(Vec<u8>, i32)>,
    pub adds: UtxoCache,
    pub deletes: Vec<Vec<u8>>,
    pub history: HistoryCache,
}

impl FlushData {
    pub fn new(cursor: ChainCursor) -> Self {
        Self {
            cursor,
            ..Self::default()
        }
    }

    pub fn is_flushed(&self) -> bool {
        self.headers.is_empty()
            && self.block_tx_hashes.is_empty()
            && self.undo_infos.is_empty()
            && self.adds.is_empty()
            && self.deletes.is_empty()
            && self.history.is_empty()
    }

    /// Bytes held by unflushed UTXO adds and queued deletes.
    pub fn utxo_bytes(&self) -> usize {
        self.adds.byte_size() + self.deletes.iter().map(Vec::len).sum::<usize>()
    }

    /// Bytes held by unflushed address history, headers, transaction hashes
    /// and undo records.
    pub fn history_bytes(&self) -> usize {
        self.history.byte_size()
            + self.headers.len() * HEADER_SIZE
            + self.block_tx_hashes.iter().map(Vec::len).sum::<usize>()
            + self
                .undo_infos
                .iter()
                .map(|(undo, _)| undo.len())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utxo::{pack_tx_num, UtxoKey, UtxoValue};

    #[test]
    fn byte_accounting_is_exact() {
        let mut data = FlushData::new(ChainCursor::empty());
        assert!(data.is_flushed());
        assert_eq!(data.utxo_bytes() + data.history_bytes(), 0);

        data.adds.insert(
            UtxoKey::new(&[1u8; 32], 0),
            UtxoValue::new(&[2u8; 11], &pack_tx_num(0), 1),
        );
        data.deletes.push(vec![0u8; 14]);
        data.deletes.push(vec![0u8; 21]);
        data.headers.push([0u8; 80]);
        data.block_tx_hashes.push(vec![0u8; 64]);
        data.undo_infos.push((vec![0u8; 48], 3));
        data.history.add([2u8; 11], 0);
        data.history.add([3u8; 11], 0);
        data.history.add([2u8; 11], 1);

        assert!(!data.is_flushed());
        assert_eq!(data.utxo_bytes(), 60 + 35);
        assert_eq!(data.history_bytes(), 2 * 11 + 3 * 5 + 80 + 64 + 48);
    }
}
