//! Fetches raw blocks ahead of the processor within a memory budget.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use novoindex_consensus::{hash256_to_hex, CoinParams};
use novoindex_log::{log_debug, log_info};
use novoindex_primitives::block::{verify_genesis_block, BlockDecodeError};
use tokio::sync::{Mutex, Notify};

use crate::daemon::{Daemon, DaemonError};

#[derive(Debug)]
pub enum PrefetchError {
    Daemon(DaemonError),
    Genesis(BlockDecodeError),
    CountMismatch { requested: usize, received: usize },
}

impl fmt::Display for PrefetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrefetchError::Daemon(err) => write!(f, "{err}"),
            PrefetchError::Genesis(err) => write!(f, "{err}"),
            PrefetchError::CountMismatch {
                requested,
                received,
            } => write!(f, "requested {requested} blocks, daemon returned {received}"),
        }
    }
}

impl std::error::Error for PrefetchError {}

impl From<DaemonError> for PrefetchError {
    fn from(err: DaemonError) -> Self {
        PrefetchError::Daemon(err)
    }
}

struct FetchCursor {
    fetched_height: i32,
    ave_size: usize,
}

#[derive(Default)]
struct BlockBuffer {
    blocks: Vec<Vec<u8>>,
    size: usize,
}

pub struct Prefetcher<D> {
    daemon: Arc<D>,
    params: CoinParams,
    blocks_signal: Arc<Notify>,
    refill: Notify,
    // Serialises fetch rounds with resets.
    cursor: Mutex<FetchCursor>,
    buffer: StdMutex<BlockBuffer>,
    caught_up: AtomicBool,
    cache_budget: usize,
    polling_delay: Duration,
}

impl<D: Daemon> Prefetcher<D> {
    pub fn new(
        daemon: Arc<D>,
        params: CoinParams,
        blocks_signal: Arc<Notify>,
        cache_budget: usize,
        polling_delay: Duration,
    ) -> Self {
        let cache_budget = cache_budget.max(1);
        Self {
            daemon,
            params,
            blocks_signal,
            refill: Notify::new(),
            cursor: Mutex::new(FetchCursor {
                fetched_height: -1,
                // The first round fetches ten blocks.
                ave_size: (cache_budget / 10).max(1),
            }),
            buffer: StdMutex::new(BlockBuffer::default()),
            caught_up: AtomicBool::new(false),
            cache_budget,
            polling_delay,
        }
    }

    /// Poll the daemon for blocks forever. Stops when the task is aborted.
    pub async fn main_loop(&self, height: i32) {
        self.reset_height(height).await;
        loop {
            self.refill.notified().await;
            match self.prefetch_blocks().await {
                Ok(true) => {}
                Ok(false) => {
                    self.refill.notify_one();
                    tokio::time::sleep(self.polling_delay).await;
                }
                Err(err) => {
                    log_info!("ignoring daemon error: {}", err);
                    self.refill.notify_one();
                    tokio::time::sleep(self.polling_delay).await;
                }
            }
        }
    }

    /// Drop buffered blocks and fetch again from `height + 1`.
    pub async fn reset_height(&self, height: i32) {
        {
            let mut cursor = self.cursor.lock().await;
            let mut buffer = self.buffer();
            buffer.blocks.clear();
            buffer.size = 0;
            cursor.fetched_height = height;
        }
        self.refill.notify_one();

        match self.daemon.height().await {
            Ok(daemon_height) => {
                let behind = daemon_height - height;
                if behind > 0 {
                    log_info!(
                        "catching up to daemon height {} ({} blocks behind)",
                        daemon_height,
                        behind
                    );
                } else {
                    log_info!("caught up to daemon height {}", daemon_height);
                }
            }
            Err(err) => log_info!("ignoring daemon error: {}", err),
        }
    }

    /// Hand over everything buffered so far.
    pub fn take_blocks(&self) -> Vec<Vec<u8>> {
        let blocks = {
            let mut buffer = self.buffer();
            buffer.size = 0;
            std::mem::take(&mut buffer.blocks)
        };
        self.refill.notify_one();
        blocks
    }

    pub fn caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// Bytes of raw blocks currently buffered.
    pub fn cache_size(&self) -> usize {
        self.buffer().size
    }

    pub async fn fetched_height(&self) -> i32 {
        self.cursor.lock().await.fetched_height
    }

    /// Fetch rounds until the buffer is full or the daemon has nothing new.
    /// Returns `true` when the buffer filled up.
    pub async fn prefetch_blocks(&self) -> Result<bool, PrefetchError> {
        let daemon_height = self.daemon.height().await?;
        let mut cursor = self.cursor.lock().await;

        loop {
            let buffered = self.cache_size();
            if buffered >= self.cache_budget {
                return Ok(true);
            }

            let first = cursor.fetched_height + 1;
            let room = ((self.cache_budget - buffered) / cursor.ave_size).max(1);
            let wanted = (daemon_height - cursor.fetched_height).min(room.min(i32::MAX as usize) as i32);
            let count = self.params.max_fetch_blocks(first).min(wanted.max(0) as usize);
            if count == 0 {
                self.caught_up.store(true, Ordering::Release);
                return Ok(false);
            }

            let hashes = self.daemon.block_hashes(first, count).await?;
            if self.caught_up() {
                if let Some(last) = hashes.last() {
                    log_info!(
                        "new block height {} hash {}",
                        first + count as i32 - 1,
                        hash256_to_hex(last)
                    );
                }
            }
            let blocks = self.daemon.raw_blocks(&hashes).await?;
            if blocks.len() != count {
                return Err(PrefetchError::CountMismatch {
                    requested: count,
                    received: blocks.len(),
                });
            }

            if first == 0 {
                verify_genesis_block(&blocks[0], &self.params).map_err(PrefetchError::Genesis)?;
                log_info!(
                    "verified genesis block with hash {}",
                    hash256_to_hex(&self.params.genesis_hash)
                );
            }

            let size: usize = blocks.iter().map(Vec::len).sum();
            cursor.ave_size = if count >= 10 {
                size / count
            } else {
                (size + (10 - count) * cursor.ave_size) / 10
            }
            .max(1);

            {
                let mut buffer = self.buffer();
                buffer.blocks.extend(blocks);
                buffer.size += size;
            }
            cursor.fetched_height += count as i32;
            log_debug!(
                "prefetched {} blocks to height {} ({} bytes)",
                count,
                cursor.fetched_height,
                size
            );
            self.blocks_signal.notify_one();
        }
    }

    fn buffer(&self) -> MutexGuard<'_, BlockBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
