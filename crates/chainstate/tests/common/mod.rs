#![allow(dead_code)]

use std::sync::Arc;

use novoindex_chainstate::{ChainState, IndexDb};
use novoindex_consensus::{coin_params, CoinParams, Hash256, Network};
use novoindex_primitives::block::{serialize_block, Block, RawHeader};
use novoindex_primitives::outpoint::OutPoint;
use novoindex_primitives::script::hashx_from_script;
use novoindex_primitives::transaction::{Transaction, TxIn, TxOut};
use novoindex_storage::memory::MemoryStore;
use novoindex_storage::{Column, KeyValueStore};

pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn coinbase_tx(height: u32, script: Vec<u8>, value: i64) -> Transaction {
    Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: height.to_le_bytes().to_vec(),
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey: script,
        }],
        lock_time: 0,
    }
}

pub fn spend_tx(prevouts: &[(Hash256, u32)], outputs: Vec<(i64, Vec<u8>)>) -> Transaction {
    Transaction {
        version: 1,
        vin: prevouts
            .iter()
            .map(|(hash, index)| TxIn {
                prevout: OutPoint::new(*hash, *index),
                script_sig: vec![0x51],
                sequence: u32::MAX,
            })
            .collect(),
        vout: outputs
            .into_iter()
            .map(|(value, script_pubkey)| TxOut {
                value,
                script_pubkey,
            })
            .collect(),
        lock_time: 0,
    }
}

pub fn make_block(prev: Hash256, nonce: u32, txs: &[Transaction]) -> Block {
    let mut header: RawHeader = [0u8; 80];
    header[..4].copy_from_slice(&1u32.to_le_bytes());
    header[4..36].copy_from_slice(&prev);
    header[76..].copy_from_slice(&nonce.to_le_bytes());
    Block::from_raw(serialize_block(&header, txs)).expect("block decodes")
}

pub fn txid(block: &Block, index: usize) -> Hash256 {
    block.transactions[index].1
}

pub fn params_for(genesis: &Block, reorg_limit: i32) -> CoinParams {
    let mut params = coin_params(Network::Regtest);
    params.genesis_hash = genesis.hash();
    params.reorg_limit = reorg_limit;
    params
}

pub fn open_state(store: Arc<MemoryStore>, params: CoinParams) -> ChainState<Arc<MemoryStore>> {
    let mut state = ChainState::new(IndexDb::new(store, params));
    state.open_for_sync().expect("open for sync");
    state
}

/// Chain of `len` blocks, each with one coinbase paying to a distinct script.
pub fn simple_chain(len: u32, nonce_base: u32) -> Vec<Block> {
    let mut blocks = Vec::with_capacity(len as usize);
    let mut prev = [0u8; 32];
    for height in 0..len {
        let block = make_block(
            prev,
            nonce_base + height,
            &[coinbase_tx(height, p2pkh_script(height as u8), 50)],
        );
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

/// `h` and `u` rows of the UTXO column.
pub fn utxo_rows<S: KeyValueStore>(store: &S) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut rows = store.scan_prefix(Column::Utxo, b"h").expect("scan h");
    rows.extend(store.scan_prefix(Column::Utxo, b"u").expect("scan u"));
    rows.sort();
    rows
}

/// Every row of the history column.
pub fn history_rows<S: KeyValueStore>(store: &S) -> Vec<(Vec<u8>, Vec<u8>)> {
    store.scan_prefix(Column::History, &[]).expect("scan history")
}

/// Tx numbers in the flushed history of the address paying to `tag`.
pub fn history_tx_nums<S: KeyValueStore>(state: &ChainState<S>, tag: u8) -> Vec<u64> {
    let hashx = hashx_from_script(&p2pkh_script(tag));
    state
        .db()
        .limited_history(&hashx, None)
        .expect("history")
        .iter()
        .map(|entry| entry.tx_num)
        .collect()
}
