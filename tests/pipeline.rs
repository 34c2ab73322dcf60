use alloy_primitives::Address;
use bridge_indexer::config::IndexerConfig;
use bridge_indexer::coordinator::{SyncCoordinator, SyncOutcome};
use bridge_indexer::cursor::WatchTarget;
use bridge_indexer::events::BridgeEventKind;
use bridge_indexer::mock::{MockChainReader, MockQueue, malformed_log, message_sent_log};
use bridge_indexer::processor::EventProcessor;
use bridge_indexer::repository::{Database, DecodeFailureRepository};
use bridge_indexer::store::{EventStore, SqliteEventStore};
use bridge_indexer::watcher::WatcherState;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BRIDGE: Address = Address::repeat_byte(0x42);

fn target() -> WatchTarget {
    WatchTarget {
        src_chain_id: 167000,
        contract_address: BRIDGE,
        event: BridgeEventKind::MessageSent,
    }
}

fn config(vars: &[(&str, &str)]) -> IndexerConfig {
    let mut all: HashMap<String, String> = HashMap::from([
        ("SRC_RPC_URLS".to_string(), "http://localhost:8545".to_string()),
        ("SRC_BRIDGE_ADDRESS".to_string(), format!("{:?}", BRIDGE)),
    ]);
    for (k, v) in vars {
        all.insert(k.to_string(), v.to_string());
    }
    let mut config = IndexerConfig::from_lookup(|name| all.get(name).cloned()).unwrap();
    config.poll_interval = Duration::from_millis(20);
    config.subscription_backoff = Duration::from_millis(2);
    config.retry_max_delay = Duration::from_millis(10);
    config.validate().unwrap();
    config
}

struct Pipeline {
    coordinator: SyncCoordinator,
    store: SqliteEventStore,
    queue: Arc<MockQueue>,
}

fn pipeline(config: &IndexerConfig, reader: Arc<MockChainReader>, db: Database) -> Pipeline {
    let store = SqliteEventStore::new(db);
    let queue = Arc::new(MockQueue::new());
    let processor = Arc::new(EventProcessor::new(
        target(),
        None,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        queue.clone(),
    ));
    Pipeline {
        coordinator: SyncCoordinator::new(config, reader, processor),
        store,
        queue,
    }
}

async fn wait_for_cursor(store: &SqliteEventStore, block: u64) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while store.get_cursor(&target()).await.unwrap() != Some(block) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("cursor did not reach the expected block");
}

#[tokio::test]
async fn operator_target_backfills_and_terminates() {
    let reader = Arc::new(MockChainReader::new(167000, 1_000));
    for block in [100, 149, 150, 151, 400] {
        reader.add_log(message_sent_log(BRIDGE, block, 0, block));
    }
    let config = config(&[
        ("SYNC_MODE", "resync"),
        ("GENESIS_BLOCK", "100"),
        ("TARGET_BLOCK_NUMBER", "150"),
        ("WATCH_MODE", "subscription"),
        ("SRC_WS_URL", "ws://localhost:8546"),
    ]);
    let p = pipeline(&config, reader.clone(), Database::in_memory().unwrap());

    let outcome = p.coordinator.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(outcome, SyncOutcome::ReachedTarget(150));
    assert_eq!(p.store.get_cursor(&target()).await.unwrap(), Some(150));
    assert_eq!(p.queue.published().len(), 3);
    assert_eq!(reader.subscribe_attempts(), 0);
    assert!(reader.calls().iter().all(|&(from, to)| from >= 100 && to <= 150));
    assert_eq!(*p.coordinator.watcher_state().borrow(), WatcherState::Idle);
}

#[tokio::test]
async fn crawl_covers_every_block_once_with_parallel_workers() {
    let reader = Arc::new(MockChainReader::new(167000, 1_000));
    for block in (100..=200).step_by(7) {
        reader.add_log(message_sent_log(BRIDGE, block, 1, block));
    }
    let config = config(&[
        ("GENESIS_BLOCK", "100"),
        ("TARGET_BLOCK_NUMBER", "200"),
        ("BLOCK_BATCH_SIZE", "20"),
        ("NUM_GOROUTINES", "4"),
    ]);
    let p = pipeline(&config, reader.clone(), Database::in_memory().unwrap());

    p.coordinator.run(&CancellationToken::new()).await.unwrap();

    let mut covered: Vec<u64> = reader
        .calls()
        .into_iter()
        .flat_map(|(from, to)| from..=to)
        .collect();
    covered.sort_unstable();
    assert_eq!(covered, (100..=200).collect::<Vec<_>>());
    assert_eq!(p.queue.published().len(), (100..=200).step_by(7).count());
}

#[tokio::test]
async fn restart_is_idempotent() {
    let db = Database::in_memory().unwrap();
    let reader = Arc::new(MockChainReader::new(167000, 1_000));
    for block in [10, 20, 30] {
        reader.add_log(message_sent_log(BRIDGE, block, 0, block));
    }

    let first = config(&[("GENESIS_BLOCK", "0"), ("TARGET_BLOCK_NUMBER", "40")]);
    let p = pipeline(&first, reader.clone(), db.clone());
    p.coordinator.run(&CancellationToken::new()).await.unwrap();
    assert_eq!(p.queue.published().len(), 3);

    // Operator rewinds to the start; everything is rediscovered and ignored
    let again = config(&[
        ("SYNC_MODE", "resync"),
        ("GENESIS_BLOCK", "0"),
        ("TARGET_BLOCK_NUMBER", "40"),
    ]);
    let p = pipeline(&again, reader, db);
    p.coordinator.run(&CancellationToken::new()).await.unwrap();
    assert!(p.queue.published().is_empty());
    assert_eq!(p.store.get_cursor(&target()).await.unwrap(), Some(40));
}

#[tokio::test]
async fn malformed_log_is_isolated() {
    let db = Database::in_memory().unwrap();
    let reader = Arc::new(MockChainReader::new(167000, 1_000));
    for i in 0..9 {
        reader.add_log(message_sent_log(BRIDGE, 50 + i, 0, i));
    }
    reader.add_log(malformed_log(BRIDGE, 53, 5));
    let config = config(&[
        ("GENESIS_BLOCK", "50"),
        ("TARGET_BLOCK_NUMBER", "59"),
        ("BLOCK_BATCH_SIZE", "10"),
    ]);
    let p = pipeline(&config, reader, db.clone());

    p.coordinator.run(&CancellationToken::new()).await.unwrap();

    assert_eq!(p.queue.published().len(), 9);
    assert_eq!(p.store.get_cursor(&target()).await.unwrap(), Some(59));
    let failures = db
        .with_conn(|conn| DecodeFailureRepository::new(conn).count())
        .unwrap();
    assert_eq!(failures, 1);
}

#[tokio::test]
async fn dead_subscription_falls_back_to_polling_and_keeps_committing() {
    let reader = Arc::new(MockChainReader::new(167000, 100));
    reader.add_log(message_sent_log(BRIDGE, 97, 0, 1));
    let config = config(&[
        ("GENESIS_BLOCK", "50"),
        ("WATCH_MODE", "subscription"),
        ("SRC_WS_URL", "ws://localhost:8546"),
        ("MAX_SUBSCRIPTION_FAILURES", "4"),
    ]);
    let p = pipeline(&config, reader.clone(), Database::in_memory().unwrap());
    let mut state = p.coordinator.watcher_state();

    let cancel = CancellationToken::new();
    let drive = async {
        tokio::time::timeout(
            Duration::from_secs(10),
            state.wait_for(|s| *s == WatcherState::Polling),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reader.subscribe_attempts(), 4);

        reader.set_head(110);
        wait_for_cursor(&p.store, 105).await;
        cancel.cancel();
    };
    let (outcome, ()) = tokio::join!(p.coordinator.run(&cancel), drive);

    assert_eq!(outcome.unwrap(), SyncOutcome::Stopped);
    assert_eq!(p.queue.published().len(), 1);
}
