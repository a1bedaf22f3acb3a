#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use novoindex::{Daemon, DaemonError, IndexConfig, Notifications};
use novoindex_chainstate::{ChainState, IndexDb};
use novoindex_consensus::{coin_params, CoinParams, Hash256, Network};
use novoindex_primitives::block::{serialize_block, Block, RawHeader};
use novoindex_primitives::outpoint::OutPoint;
use novoindex_primitives::script::HashX;
use novoindex_primitives::transaction::{Transaction, TxIn, TxOut};
use novoindex_storage::memory::MemoryStore;

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

pub fn make_block(prev: Hash256, nonce: u32, txs: &[Transaction]) -> Block {
    let mut header: RawHeader = [0u8; 80];
    header[..4].copy_from_slice(&1u32.to_le_bytes());
    header[4..36].copy_from_slice(&prev);
    header[76..].copy_from_slice(&nonce.to_le_bytes());
    Block::from_raw(serialize_block(&header, txs)).expect("block decodes")
}

/// Extend `base[..=fork_height - 1]` with `len` new blocks starting at
/// `fork_height`. Coinbases pay to `tag_base + height`.
pub fn extend_chain(base: &[Block], fork_height: usize, len: u32, tag_base: u8) -> Vec<Block> {
    let mut blocks = base[..fork_height].to_vec();
    let mut prev = blocks.last().map(Block::hash).unwrap_or([0u8; 32]);
    for offset in 0..len {
        let height = fork_height as u32 + offset;
        let block = make_block(
            prev,
            u32::from(tag_base) * 1000 + height,
            &[coinbase_tx(
                height,
                p2pkh_script(tag_base.wrapping_add(height as u8)),
                50,
            )],
        );
        prev = block.hash();
        blocks.push(block);
    }
    blocks
}

/// Chain of `len` blocks, each with one coinbase paying to `p2pkh_script(height)`.
pub fn simple_chain(len: u32) -> Vec<Block> {
    extend_chain(&[], 0, len, 0)
}

pub fn params_for(genesis: &Block, reorg_limit: i32) -> CoinParams {
    let mut params = coin_params(Network::Regtest);
    params.genesis_hash = genesis.hash();
    params.reorg_limit = reorg_limit;
    params
}

pub fn test_config() -> IndexConfig {
    IndexConfig {
        network: Network::Regtest,
        polling_delay_ms: 10,
        cache_check_secs: 0,
        ..IndexConfig::default()
    }
}

pub fn open_state(store: Arc<MemoryStore>, params: CoinParams) -> ChainState<Arc<MemoryStore>> {
    let mut state = ChainState::new(IndexDb::new(store, params));
    state.open_for_sync().expect("open for sync");
    state
}

/// In-memory daemon serving a replaceable chain.
pub struct MockDaemon {
    chain: Mutex<Vec<Block>>,
    cached_height: AtomicI32,
    failing: AtomicBool,
    reported_height: Mutex<Option<i32>>,
    hash_fault_below: Mutex<Option<i32>>,
}

impl MockDaemon {
    pub fn new(chain: Vec<Block>) -> Self {
        Self {
            chain: Mutex::new(chain),
            cached_height: AtomicI32::new(-1),
            failing: AtomicBool::new(false),
            reported_height: Mutex::new(None),
            hash_fault_below: Mutex::new(None),
        }
    }

    /// Report `height` as the daemon height whatever the served chain is.
    pub fn report_height(&self, height: i32) {
        *self.reported_height.lock().expect("height lock") = Some(height);
    }

    /// Fail the next block hash request starting below `height`.
    pub fn fail_next_hashes_below(&self, height: i32) {
        *self.hash_fault_below.lock().expect("fault lock") = Some(height);
    }

    /// Whether the armed block hash failure has been returned.
    pub fn hash_fault_used(&self) -> bool {
        self.hash_fault_below.lock().expect("fault lock").is_none()
    }

    pub fn set_chain(&self, chain: Vec<Block>) {
        *self.chain.lock().expect("chain lock") = chain;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), DaemonError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DaemonError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Daemon for MockDaemon {
    async fn height(&self) -> Result<i32, DaemonError> {
        self.check()?;
        let served = self.chain.lock().expect("chain lock").len() as i32 - 1;
        let height = self.reported_height.lock().expect("height lock").unwrap_or(served);
        self.cached_height.store(height, Ordering::SeqCst);
        Ok(height)
    }

    fn cached_height(&self) -> i32 {
        self.cached_height.load(Ordering::SeqCst)
    }

    async fn block_hashes(&self, first: i32, count: usize) -> Result<Vec<Hash256>, DaemonError> {
        self.check()?;
        {
            let mut fault = self.hash_fault_below.lock().expect("fault lock");
            if fault.is_some_and(|limit| first < limit) {
                *fault = None;
                return Err(DaemonError::Unavailable("connection reset".to_string()));
            }
        }
        let chain = self.chain.lock().expect("chain lock");
        Ok(chain
            .iter()
            .skip(first.max(0) as usize)
            .take(count)
            .map(Block::hash)
            .collect())
    }

    async fn raw_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Vec<u8>>, DaemonError> {
        self.check()?;
        let chain = self.chain.lock().expect("chain lock");
        hashes
            .iter()
            .map(|hash| {
                chain
                    .iter()
                    .find(|block| block.hash() == *hash)
                    .map(|block| block.raw.clone())
                    .ok_or_else(|| DaemonError::Rpc {
                        code: -5,
                        message: "Block not found".to_string(),
                    })
            })
            .collect()
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(i32, HashSet<HashX>)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(i32, HashSet<HashX>)> {
        self.events.lock().expect("events lock").clone()
    }
}

#[async_trait]
impl Notifications for RecordingNotifier {
    async fn on_block(&self, touched: &HashSet<HashX>, height: i32) {
        self.events
            .lock()
            .expect("events lock")
            .push((height, touched.clone()));
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
