//! Drives the chain state from prefetched blocks and handles reorgs.
//!
//! All work that touches the chain state runs under one async mutex. The
//! locked part is spawned as its own task, so a caller that gets dropped
//! (for example on shutdown) never abandons a half-applied batch; the final
//! flush simply waits for the lock.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use novoindex_chainstate::{
    ChainState, ChainStateError, DbError, HistoryEntry, IndexDb, UtxoRecord,
};
use novoindex_consensus::{hash256_to_hex, CoinParams, Hash256};
use novoindex_log::{log_info, log_warn};
use novoindex_primitives::block::{Block, BlockDecodeError, RawHeader};
use novoindex_primitives::script::HashX;
use novoindex_storage::KeyValueStore;
use tokio::sync::{watch, Mutex, Notify, OwnedMutexGuard};

use crate::config::IndexConfig;
use crate::daemon::{retry_daemon, Daemon, DaemonError};
use crate::notifications::Notifications;
use crate::prefetcher::Prefetcher;

#[derive(Debug)]
pub enum SyncError {
    Chain(ChainStateError),
    Db(DbError),
    Block(BlockDecodeError),
    Task(String),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Chain(err) => write!(f, "{err}"),
            SyncError::Db(err) => write!(f, "{err}"),
            SyncError::Block(err) => write!(f, "{err}"),
            SyncError::Task(message) => write!(f, "block processor task failed: {message}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ChainStateError> for SyncError {
    fn from(err: ChainStateError) -> Self {
        SyncError::Chain(err)
    }
}

impl From<DbError> for SyncError {
    fn from(err: DbError) -> Self {
        SyncError::Db(err)
    }
}

impl From<BlockDecodeError> for SyncError {
    fn from(err: BlockDecodeError) -> Self {
        SyncError::Block(err)
    }
}

/// Negative counts ask for a natural reorg.
const NATURAL_REORG: i32 = -1;

struct Shared<S, D, N> {
    state: Arc<Mutex<ChainState<S>>>,
    daemon: Arc<D>,
    notifications: Arc<N>,
    prefetcher: Arc<Prefetcher<D>>,
    blocks_signal: Arc<Notify>,
    backed_up: Arc<Notify>,
    caught_up: watch::Sender<bool>,
    reorg_count: StdMutex<Option<i32>>,
    next_cache_check: StdMutex<Instant>,
    cache_bytes: usize,
    cache_check_interval: Duration,
    polling_delay: Duration,
}

pub struct BlockProcessor<S, D, N> {
    shared: Arc<Shared<S, D, N>>,
}

impl<S, D, N> BlockProcessor<S, D, N>
where
    S: KeyValueStore + 'static,
    D: Daemon,
    N: Notifications,
{
    pub fn new(
        config: &IndexConfig,
        params: CoinParams,
        store: S,
        daemon: Arc<D>,
        notifications: Arc<N>,
    ) -> Self {
        let blocks_signal = Arc::new(Notify::new());
        let prefetcher = Arc::new(Prefetcher::new(
            Arc::clone(&daemon),
            params.clone(),
            Arc::clone(&blocks_signal),
            config.prefetch_cache_bytes(),
            config.polling_delay(),
        ));
        let (caught_up, _) = watch::channel(false);
        let state = ChainState::new(IndexDb::new(store, params));
        Self {
            shared: Arc::new(Shared {
                state: Arc::new(Mutex::new(state)),
                daemon,
                notifications,
                prefetcher,
                blocks_signal,
                backed_up: Arc::new(Notify::new()),
                caught_up,
                reorg_count: StdMutex::new(None),
                next_cache_check: StdMutex::new(Instant::now()),
                cache_bytes: config.cache_bytes(),
                cache_check_interval: config.cache_check_interval(),
                polling_delay: config.polling_delay(),
            }),
        }
    }

    /// Flips to `true` once, the first time the index reaches the daemon
    /// height.
    pub fn caught_up(&self) -> watch::Receiver<bool> {
        self.shared.caught_up.subscribe()
    }

    /// Woken with `notify_waiters` after every completed backup.
    pub fn backed_up(&self) -> Arc<Notify> {
        Arc::clone(&self.shared.backed_up)
    }

    pub fn prefetcher(&self) -> &Prefetcher<D> {
        &self.shared.prefetcher
    }

    /// Open the index, then fetch and apply blocks until `shutdown`
    /// resolves or a fatal error occurs. Shutdown flushes everything before
    /// returning `Ok(())`; fatal errors return without flushing.
    pub async fn fetch_and_process_blocks<F>(&self, shutdown: F) -> Result<(), SyncError>
    where
        F: Future<Output = ()>,
    {
        let height = self
            .run_with_lock(|_, mut state| async move {
                state.open_for_sync()?;
                Ok::<_, SyncError>(state.height())
            })
            .await?;

        let prefetcher = Arc::clone(&self.shared.prefetcher);
        let prefetch_task = tokio::spawn(async move { prefetcher.main_loop(height).await });

        let result = tokio::select! {
            result = self.process_blocks() => result,
            _ = shutdown => Ok(()),
        };
        prefetch_task.abort();
        result?;

        log_info!("flushing to DB for a clean shutdown...");
        self.run_with_lock(|shared, mut state| async move {
            let daemon_height = shared.daemon.cached_height();
            shared.flush(&mut state, true, daemon_height)
        })
        .await?;
        log_info!("flushed cleanly");
        Ok(())
    }

    /// Queue a backup of the top `count` blocks. Refused until caught up,
    /// and when the range would reach the genesis block or leave the undo
    /// window.
    pub async fn force_chain_reorg(&self, count: i32) -> bool {
        if !*self.shared.caught_up.borrow() || count < 1 {
            return false;
        }
        let state = self.shared.state.lock().await;
        let height = state.height();
        let start = height - count + 1;
        if start < 1 || start < state.db().min_undo_height(height) {
            log_warn!("refusing to back up {} blocks from height {}", count, height);
            return false;
        }
        self.shared.schedule_reorg(count);
        true
    }

    pub async fn height(&self) -> i32 {
        self.shared.state.lock().await.height()
    }

    pub async fn tip(&self) -> Hash256 {
        self.shared.state.lock().await.tip()
    }

    pub async fn tx_count(&self) -> u64 {
        self.shared.state.lock().await.tx_count()
    }

    pub async fn all_utxos(&self, hashx: HashX) -> Result<Vec<UtxoRecord>, SyncError> {
        let state = self.shared.state.lock().await;
        Ok(state.db().all_utxos(&hashx)?)
    }

    /// Confirmed history of `hashx`, oldest first. `None` means no limit.
    pub async fn limited_history(
        &self,
        hashx: HashX,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, SyncError> {
        let state = self.shared.state.lock().await;
        Ok(state.db().limited_history(&hashx, limit)?)
    }

    pub async fn lookup_utxo(
        &self,
        tx_hash: Hash256,
        index: u32,
    ) -> Result<Option<(HashX, u64)>, SyncError> {
        let state = self.shared.state.lock().await;
        Ok(state.db().lookup_utxo(&tx_hash, index)?)
    }

    pub async fn read_headers(&self, start: i32, count: usize) -> Result<Vec<RawHeader>, SyncError> {
        let state = self.shared.state.lock().await;
        Ok(state.db().read_headers(start, count)?)
    }

    async fn process_blocks(&self) -> Result<(), SyncError> {
        let daemon_height = match self.shared.daemon.height().await {
            Ok(height) => height,
            Err(err) => {
                log_warn!("daemon height unavailable: {}", err);
                self.shared.daemon.cached_height()
            }
        };
        self.run_with_lock(move |shared, mut state| async move {
            if state.height() == daemon_height {
                shared.on_caught_up(&mut state)?;
            }
            Ok::<_, SyncError>(())
        })
        .await?;

        loop {
            self.shared.blocks_signal.notified().await;
            self.run_with_lock(|shared, mut state| async move {
                shared.process_event(&mut state).await
            })
            .await?;
        }
    }

    async fn run_with_lock<T, F, Fut>(&self, work: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Shared<S, D, N>>, OwnedMutexGuard<ChainState<S>>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let guard = Arc::clone(&shared.state).lock_owned().await;
            work(shared, guard).await
        });
        task.await
            .map_err(|err| SyncError::Task(err.to_string()))?
    }
}

impl<S, D, N> Shared<S, D, N>
where
    S: KeyValueStore + 'static,
    D: Daemon,
    N: Notifications,
{
    fn schedule_reorg(&self, count: i32) {
        *self.reorg_count.lock().unwrap_or_else(PoisonError::into_inner) = Some(count);
        self.blocks_signal.notify_one();
    }

    fn take_reorg(&self) -> Option<i32> {
        self.reorg_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn process_event(&self, state: &mut ChainState<S>) -> Result<(), SyncError> {
        match self.take_reorg() {
            Some(count) => self.reorg_chain(state, count).await,
            None => {
                let blocks = self.prefetcher.take_blocks();
                self.advance_blocks(state, blocks).await
            }
        }
    }

    fn flush(
        &self,
        state: &mut ChainState<S>,
        flush_utxos: bool,
        daemon_height: i32,
    ) -> Result<(), SyncError> {
        state.flush(flush_utxos, daemon_height)?;
        *self
            .next_cache_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now() + self.cache_check_interval;
        Ok(())
    }

    fn cache_check_due(&self, now: Instant) -> bool {
        now > *self
            .next_cache_check
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn advance_blocks(
        &self,
        state: &mut ChainState<S>,
        raw_blocks: Vec<Vec<u8>>,
    ) -> Result<(), SyncError> {
        let start = Instant::now();
        let daemon_height = self.daemon.cached_height();
        let count = raw_blocks.len();
        let bytes: usize = raw_blocks.iter().map(Vec::len).sum();

        for raw in raw_blocks {
            let block = Block::from_raw(raw)?;
            if block.prev_hash() != state.tip() {
                self.schedule_reorg(NATURAL_REORG);
                return Ok(());
            }
            state.connect_block(&block, daemon_height)?;
            tokio::task::yield_now().await;
        }
        let end = Instant::now();

        if !state.first_sync() && count > 0 {
            log_info!(
                "processed {} block{} size {:.2} MB in {:.1}s",
                count,
                if count == 1 { "" } else { "s" },
                bytes as f64 / 1_000_000.0,
                (end - start).as_secs_f64()
            );
        }

        if state.height() == self.daemon.cached_height() {
            self.flush(state, true, daemon_height)?;
            self.on_caught_up(state)?;
        } else if self.cache_check_due(end) {
            let pending = state.pending();
            log_info!(
                "our height: {} daemon: {} UTXOs {}MB hist {}MB",
                state.height(),
                self.daemon.cached_height(),
                pending.utxo_bytes() / 1_000_000,
                pending.history_bytes() / 1_000_000
            );
            if let Some(flush_utxos) = state.check_cache_size(self.cache_bytes) {
                self.flush(state, flush_utxos, daemon_height)?;
            }
        }

        let touched = state.take_touched();
        let caught_up = *self.caught_up.borrow();
        if caught_up {
            self.notifications.on_block(&touched, state.height()).await;
        }
        Ok(())
    }

    async fn reorg_chain(&self, state: &mut ChainState<S>, count: i32) -> Result<(), SyncError> {
        if count < 0 {
            log_info!("chain reorg detected");
        } else {
            log_info!("faking a reorg of {} blocks", count);
        }
        let daemon_height = self.daemon.cached_height();
        self.flush(state, true, daemon_height)?;

        let (start, count) = self.calc_reorg_range(state, count).await?;
        let last = start + count as i32 - 1;
        log_info!(
            "chain was reorganised replacing {} block{} at heights {}-{}",
            count,
            if count == 1 { "" } else { "s" },
            start,
            last
        );
        let hashes = state.db().fs_block_hashes(start, count)?;

        let mut height = last;
        for hash in hashes.iter().rev() {
            let raw = self.get_raw_block(state, hash, height).await?;
            let block = Block::from_raw(raw)?;
            state.disconnect_block(&block)?;
            state.flush_backup()?;
            height -= 1;
            tokio::task::yield_now().await;
        }
        log_info!("backed up to height {}", state.height());

        self.prefetcher.reset_height(state.height()).await;
        self.backed_up.notify_waiters();
        Ok(())
    }

    /// `(start, count)` of the blocks to back up.
    async fn calc_reorg_range(
        &self,
        state: &ChainState<S>,
        count: i32,
    ) -> Result<(i32, usize), SyncError> {
        let height = state.height();
        let start = if count < 0 {
            natural_reorg_start(state.db(), self.daemon.as_ref(), height, self.polling_delay)
                .await?
        } else {
            height - count + 1
        };
        Ok((start, (height - start + 1).max(0) as usize))
    }

    async fn get_raw_block(
        &self,
        state: &ChainState<S>,
        hash: &Hash256,
        height: i32,
    ) -> Result<Vec<u8>, SyncError> {
        if let Some(raw) = state.db().read_raw_block(height)? {
            log_info!("read block {} at height {} from disk", hash256_to_hex(hash), height);
            return Ok(raw);
        }
        let raw = retry_daemon("raw block request", self.polling_delay, move || async move {
            self.daemon
                .raw_blocks(std::slice::from_ref(hash))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DaemonError::BadResponse("no block returned".to_string()))
        })
        .await;
        log_info!(
            "obtained block {} at height {} from daemon",
            hash256_to_hex(hash),
            height
        );
        Ok(raw)
    }

    fn on_caught_up(&self, state: &mut ChainState<S>) -> Result<(), SyncError> {
        if *self.caught_up.borrow() {
            return Ok(());
        }
        self.caught_up.send_replace(true);
        log_info!("caught up to height {}", state.height());

        let first_sync = state.first_sync();
        state.set_first_sync_done()?;
        if first_sync {
            log_info!(
                "novoindex {} synced to height {}",
                env!("CARGO_PKG_VERSION"),
                state.height()
            );
        }
        state.open_for_serving()?;
        Ok(())
    }
}

/// First height where the stored chain and the daemon disagree.
///
/// Searches backwards from `height - 1` with a window that doubles each step
/// until a window contains a matching prefix or height 0 is reached. Daemon
/// faults are retried every `retry_delay`.
pub async fn natural_reorg_start<S, D>(
    db: &IndexDb<S>,
    daemon: &D,
    height: i32,
    retry_delay: Duration,
) -> Result<i32, SyncError>
where
    S: KeyValueStore,
    D: Daemon + ?Sized,
{
    let mut start = height - 1;
    let mut count: i32 = 1;
    while start >= 0 {
        let ours = db.fs_block_hashes(start, count as usize)?;
        let theirs = retry_daemon("block hash request", retry_delay, move || {
            daemon.block_hashes(start, count as usize)
        })
        .await;
        let matching = ours
            .iter()
            .zip(theirs.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if matching > 0 {
            start += matching as i32;
            break;
        }
        if start == 0 {
            break;
        }
        count = (count * 2).min(start);
        start -= count;
    }
    Ok(start.max(0))
}
