mod common;

use std::sync::Arc;
use std::time::Duration;

use novoindex::{BlockProcessor, IndexConfig, SyncError};
use novoindex_chainstate::ChainStateError;
use novoindex_consensus::CoinParams;
use novoindex_primitives::block::Block;
use novoindex_primitives::outpoint::OutPoint;
use novoindex_primitives::script::hashx_from_script;
use novoindex_primitives::transaction::{Transaction, TxIn, TxOut};
use novoindex_storage::memory::MemoryStore;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use common::*;

type Processor = BlockProcessor<Arc<MemoryStore>, MockDaemon, RecordingNotifier>;

struct Harness {
    store: Arc<MemoryStore>,
    daemon: Arc<MockDaemon>,
    notifier: Arc<RecordingNotifier>,
    processor: Arc<Processor>,
}

impl Harness {
    fn new(chain: &[Block]) -> Self {
        Self::with_settings(chain, params_for(&chain[0], 10), &test_config())
    }

    fn with_settings(chain: &[Block], params: CoinParams, config: &IndexConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let daemon = Arc::new(MockDaemon::new(chain.to_vec()));
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = Arc::new(BlockProcessor::new(
            config,
            params,
            Arc::clone(&store),
            Arc::clone(&daemon),
            Arc::clone(&notifier),
        ));
        Self {
            store,
            daemon,
            notifier,
            processor,
        }
    }

    fn start(&self) -> (oneshot::Sender<()>, JoinHandle<Result<(), SyncError>>) {
        let (stop, stopped) = oneshot::channel::<()>();
        let processor = Arc::clone(&self.processor);
        let task = tokio::spawn(async move {
            processor
                .fetch_and_process_blocks(async move {
                    let _ = stopped.await;
                })
                .await
        });
        (stop, task)
    }

    async fn wait_caught_up(&self) {
        let mut caught_up = self.processor.caught_up();
        timeout(Duration::from_secs(5), caught_up.wait_for(|done| *done))
            .await
            .expect("caught up in time")
            .expect("processor alive");
    }

    async fn wait_backed_up(&self, trigger: impl std::future::Future<Output = ()>) {
        let backed_up = self.processor.backed_up();
        let notified = backed_up.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        trigger.await;
        timeout(Duration::from_secs(5), notified)
            .await
            .expect("backed up in time");
    }

    async fn wait_for_tip(&self, height: i32, tip: [u8; 32]) {
        let processor = Arc::clone(&self.processor);
        wait_until("tip", move || {
            let processor = Arc::clone(&processor);
            async move { processor.height().await == height && processor.tip().await == tip }
        })
        .await;
    }
}

async fn stop(stop: oneshot::Sender<()>, task: JoinHandle<Result<(), SyncError>>) {
    stop.send(()).expect("processor listening");
    timeout(Duration::from_secs(5), task)
        .await
        .expect("stopped in time")
        .expect("task joined")
        .expect("clean shutdown");
}

#[tokio::test]
async fn syncs_notifies_new_blocks_and_flushes_on_shutdown() {
    let chain = simple_chain(6);
    let harness = Harness::new(&chain[..4]);
    assert!(!harness.processor.force_chain_reorg(1).await);

    let (stop_tx, task) = harness.start();
    harness.wait_caught_up().await;
    assert_eq!(harness.processor.height().await, 3);
    assert_eq!(harness.processor.tip().await, chain[3].hash());
    assert_eq!(harness.processor.tx_count().await, 4);

    let notifier = Arc::clone(&harness.notifier);
    wait_until("catch-up notification", move || {
        let notifier = Arc::clone(&notifier);
        async move { notifier.events().iter().any(|(height, _)| *height == 3) }
    })
    .await;

    harness.daemon.set_chain(chain.clone());
    harness.wait_for_tip(5, chain[5].hash()).await;
    let notifier = Arc::clone(&harness.notifier);
    wait_until("new block notification", move || {
        let notifier = Arc::clone(&notifier);
        async move { notifier.events().iter().any(|(height, _)| *height == 5) }
    })
    .await;

    let touched_after_catch_up: Vec<_> = harness
        .notifier
        .events()
        .into_iter()
        .filter(|(height, _)| *height > 3)
        .flat_map(|(_, touched)| touched)
        .collect();
    for tag in [4u8, 5] {
        assert!(touched_after_catch_up.contains(&hashx_from_script(&p2pkh_script(tag))));
    }
    assert!(!touched_after_catch_up.contains(&hashx_from_script(&p2pkh_script(2))));

    let utxos = harness
        .processor
        .all_utxos(hashx_from_script(&p2pkh_script(5)))
        .await
        .expect("utxos");
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].height, 5);
    assert_eq!(utxos[0].value, 50);
    let headers = harness.processor.read_headers(4, 10).await.expect("headers");
    assert_eq!(headers, vec![chain[4].header, chain[5].header]);
    let history = harness
        .processor
        .limited_history(hashx_from_script(&p2pkh_script(5)), None)
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].tx_hash, chain[5].transactions[0].1);
    assert_eq!(history[0].height, 5);

    stop(stop_tx, task).await;

    let reopened = open_state(Arc::clone(&harness.store), params_for(&chain[0], 10));
    assert_eq!(reopened.height(), 5);
    assert_eq!(reopened.tip(), chain[5].hash());
    assert!(!reopened.first_sync());
}

#[tokio::test]
async fn forced_reorg_backs_up_and_refetches() {
    let chain = simple_chain(6);
    let harness = Harness::new(&chain);
    let (stop_tx, task) = harness.start();
    harness.wait_caught_up().await;
    assert_eq!(harness.processor.height().await, 5);

    harness
        .wait_backed_up(async { assert!(harness.processor.force_chain_reorg(2).await) })
        .await;

    harness.wait_for_tip(5, chain[5].hash()).await;
    assert_eq!(harness.processor.tx_count().await, 6);
    let utxos = harness
        .processor
        .all_utxos(hashx_from_script(&p2pkh_script(4)))
        .await
        .expect("utxos");
    assert_eq!(utxos.len(), 1);

    stop(stop_tx, task).await;
}

#[tokio::test]
async fn follows_the_daemon_onto_a_fork() {
    let chain = simple_chain(5);
    let fork = extend_chain(&chain, 3, 4, 100);
    let harness = Harness::new(&chain);
    let (stop_tx, task) = harness.start();
    harness.wait_caught_up().await;

    harness
        .wait_backed_up(async { harness.daemon.set_chain(fork.clone()) })
        .await;
    harness.wait_for_tip(6, fork[6].hash()).await;
    assert_eq!(harness.processor.tx_count().await, 7);

    let orphaned = chain[4].transactions[0].1;
    assert_eq!(
        harness.processor.lookup_utxo(orphaned, 0).await.expect("lookup"),
        None
    );
    let replacement = fork[6].transactions[0].1;
    assert_eq!(
        harness
            .processor
            .lookup_utxo(replacement, 0)
            .await
            .expect("lookup"),
        Some((hashx_from_script(&p2pkh_script(106)), 50))
    );
    let orphaned_history = harness
        .processor
        .limited_history(hashx_from_script(&p2pkh_script(4)), None)
        .await
        .expect("history");
    assert!(orphaned_history.is_empty());
    let replacement_history = harness
        .processor
        .limited_history(hashx_from_script(&p2pkh_script(106)), Some(5))
        .await
        .expect("history");
    assert_eq!(replacement_history.len(), 1);
    assert_eq!(replacement_history[0].height, 6);

    stop(stop_tx, task).await;
}

#[tokio::test]
async fn daemon_fault_during_a_reorg_is_retried() {
    novoindex_log::init(test_config().log_config());
    novoindex_log::enable_capture(4096);
    let chain = simple_chain(5);
    let fork = extend_chain(&chain, 3, 4, 100);
    let harness = Harness::new(&chain);
    let (stop_tx, task) = harness.start();
    harness.wait_caught_up().await;

    // Block requests from height 5 go through, the fork point search fails once.
    harness.daemon.fail_next_hashes_below(5);
    harness
        .wait_backed_up(async { harness.daemon.set_chain(fork.clone()) })
        .await;
    harness.wait_for_tip(6, fork[6].hash()).await;

    assert!(harness.daemon.hash_fault_used());
    assert!(!task.is_finished());
    assert!(novoindex_log::capture_snapshot(4096).iter().any(|line| {
        line.level == novoindex_log::Level::Info
            && line.msg.starts_with("block hash request failed, retrying")
    }));
    assert_eq!(harness.processor.tx_count().await, 7);
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn forced_reorg_outside_the_undo_window_is_refused() {
    let chain = simple_chain(8);
    let harness = Harness::with_settings(&chain, params_for(&chain[0], 3), &test_config());
    let (stop_tx, task) = harness.start();
    harness.wait_caught_up().await;
    assert_eq!(harness.processor.height().await, 7);

    assert!(!harness.processor.force_chain_reorg(0).await);
    assert!(!harness.processor.force_chain_reorg(-2).await);
    assert!(!harness.processor.force_chain_reorg(4).await);
    assert!(!harness.processor.force_chain_reorg(9).await);
    assert_eq!(harness.processor.height().await, 7);

    harness
        .wait_backed_up(async { assert!(harness.processor.force_chain_reorg(3).await) })
        .await;
    harness.wait_for_tip(7, chain[7].hash()).await;
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn forced_reorg_cannot_reach_genesis() {
    let chain = simple_chain(6);
    let harness = Harness::new(&chain);
    let (stop_tx, task) = harness.start();
    harness.wait_caught_up().await;

    assert!(!harness.processor.force_chain_reorg(6).await);
    assert!(!harness.processor.force_chain_reorg(7).await);
    assert_eq!(harness.processor.height().await, 5);
    assert_eq!(harness.processor.tip().await, chain[5].hash());
    stop(stop_tx, task).await;
}

#[tokio::test]
async fn unflushed_blocks_survive_shutdown() {
    let chain = simple_chain(10);
    let mut params = params_for(&chain[0], 10);
    params.max_fetch_small = 2;
    let config = IndexConfig {
        cache_check_secs: 3600,
        ..test_config()
    };
    let harness = Harness::with_settings(&chain[..6], params.clone(), &config);
    // The daemon claims blocks it cannot serve, so sync never catches up.
    harness.daemon.report_height(9);
    let (stop_tx, task) = harness.start();
    let processor = Arc::clone(&harness.processor);
    wait_until("six blocks applied", move || {
        let processor = Arc::clone(&processor);
        async move { processor.height().await == 5 }
    })
    .await;
    assert!(!*harness.processor.caught_up().borrow());
    assert!(harness.notifier.events().is_empty());

    stop(stop_tx, task).await;

    let reopened = open_state(Arc::clone(&harness.store), params);
    assert_eq!(reopened.db().db_height(), 5);
    assert_eq!(reopened.height(), 5);
    assert_eq!(reopened.tip(), chain[5].hash());
    assert!(reopened.first_sync());
    let utxos = reopened
        .db()
        .all_utxos(&hashx_from_script(&p2pkh_script(5)))
        .expect("utxos");
    assert_eq!(utxos.len(), 1);
    let history = reopened
        .db()
        .limited_history(&hashx_from_script(&p2pkh_script(3)), None)
        .expect("history");
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn spending_a_missing_output_stops_processing() {
    let mut chain = simple_chain(2);
    let bad_spend = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::new([0x77u8; 32], 3),
            script_sig: vec![0x51],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 10,
            script_pubkey: p2pkh_script(9),
        }],
        lock_time: 0,
    };
    chain.push(make_block(
        chain[1].hash(),
        2,
        &[coinbase_tx(2, p2pkh_script(2), 50), bad_spend],
    ));

    let harness = Harness::new(&chain);
    let (_stop_tx, task) = harness.start();
    let result = timeout(Duration::from_secs(5), task)
        .await
        .expect("failed in time")
        .expect("task joined");
    assert!(matches!(
        result,
        Err(SyncError::Chain(ChainStateError::MissingUtxo { index: 3, .. }))
    ));
}
