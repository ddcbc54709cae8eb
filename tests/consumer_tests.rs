//! Consumer behaviour against the mock cluster: fetch sizing, isolation
//! levels, pausing and transactional offsets.
//!
//! ```bash
//! cargo test --test consumer_tests
//! ```

use std::time::Duration;

use tokio::time::timeout;

use gregor::mock::MockCluster;
use gregor::prelude::*;
use gregor::producer::{TxnOffset, TxnState};
use gregor::retry::Backoff;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> Config {
    let mut config = Config::default();
    config.producer.retry.backoff = Backoff::Constant(Duration::from_millis(10));
    config.metadata.retry_backoff = Backoff::Constant(Duration::from_millis(10));
    config.consumer.retry_backoff = Backoff::Constant(Duration::from_millis(10));
    config.consumer.max_wait_time = Duration::from_millis(50);
    config
}

fn transactional_config(id: &str) -> Config {
    let mut config = fast_config();
    config.enable_idempotence();
    config.producer.transaction.id = Some(id.to_string());
    config.producer.transaction.retry_backoff = Backoff::Constant(Duration::from_millis(10));
    config
}

async fn produce(cluster: &MockCluster, topic: &str, values: &[&str]) {
    let producer = SyncProducer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    for value in values {
        producer
            .send_message(ProducerMessage::new(topic).with_value(value.to_string()))
            .await
            .unwrap();
    }
    producer.close().await.unwrap();
}

async fn next_value(partition: &mut PartitionConsumer) -> (i64, String) {
    let message = timeout(WAIT, partition.recv()).await.unwrap().unwrap();
    let value = String::from_utf8_lossy(message.value.as_deref().unwrap_or_default()).into_owned();
    (message.offset, value)
}

// ============================================================================
// Fetch sizing
// ============================================================================

#[tokio::test]
async fn test_fetch_size_grows_for_large_message() {
    let cluster = MockCluster::builder().topic("large", 1).start().await.unwrap();
    let big = "y".repeat(5000);
    produce(&cluster, "large", &["small", &big, "tail"]).await;

    let mut config = fast_config();
    config.consumer.fetch.min = 1;
    config.consumer.fetch.default = 128;
    let consumer = Consumer::new(&cluster.bootstrap(), config).await.unwrap();
    let mut partition = consumer
        .consume_partition("large", 0, StartOffset::Oldest)
        .await
        .unwrap();

    assert_eq!(next_value(&mut partition).await, (0, "small".to_string()));
    assert_eq!(next_value(&mut partition).await, (1, big));
    assert_eq!(next_value(&mut partition).await, (2, "tail".to_string()));
    partition.close().await.unwrap();
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_fetch_size_below_batch_header_grows() {
    let cluster = MockCluster::builder().topic("tiny", 1).start().await.unwrap();
    produce(&cluster, "tiny", &["hello"]).await;

    let mut config = fast_config();
    config.consumer.fetch.min = 1;
    config.consumer.fetch.default = 8;
    let consumer = Consumer::new(&cluster.bootstrap(), config).await.unwrap();
    let mut partition = consumer
        .consume_partition("tiny", 0, StartOffset::Oldest)
        .await
        .unwrap();

    assert_eq!(next_value(&mut partition).await, (0, "hello".to_string()));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_fetch_ceiling_reports_too_large() {
    let cluster = MockCluster::builder().topic("capped", 1).start().await.unwrap();
    let big = "z".repeat(4096);
    produce(&cluster, "capped", &[&big]).await;

    let mut config = fast_config();
    config.consumer.fetch.min = 1;
    config.consumer.fetch.default = 256;
    config.consumer.fetch.max = 1024;
    config.consumer.return_errors = true;
    let consumer = Consumer::new(&cluster.bootstrap(), config).await.unwrap();
    let mut partition = consumer
        .consume_partition("capped", 0, StartOffset::Oldest)
        .await
        .unwrap();
    let mut errors = partition.take_errors().unwrap();

    let error = timeout(WAIT, errors.recv()).await.unwrap().unwrap();
    assert_eq!(error.topic, "capped");
    assert!(
        matches!(error.error, Error::MessageTooLarge(needed) if needed > 1024),
        "unexpected error {:?}",
        error.error
    );
    consumer.close().await.unwrap();
}

// ============================================================================
// Starting positions
// ============================================================================

#[tokio::test]
async fn test_newest_skips_existing_messages() {
    let cluster = MockCluster::builder().topic("live", 1).start().await.unwrap();
    produce(&cluster, "live", &["old-1", "old-2"]).await;

    let consumer = Consumer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let mut partition = consumer
        .consume_partition("live", 0, StartOffset::Newest)
        .await
        .unwrap();
    produce(&cluster, "live", &["new"]).await;

    assert_eq!(next_value(&mut partition).await, (2, "new".to_string()));
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_claim_rejected() {
    let cluster = MockCluster::builder().topic("single", 1).start().await.unwrap();
    let consumer = Consumer::new(&cluster.bootstrap(), fast_config()).await.unwrap();

    let _partition = consumer
        .consume_partition("single", 0, StartOffset::Oldest)
        .await
        .unwrap();
    let err = consumer
        .consume_partition("single", 0, StartOffset::Oldest)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        Error::AlreadyConsuming {
            topic: "single".to_string(),
            partition: 0
        }
    );
    consumer.close().await.unwrap();
}

// ============================================================================
// Pausing
// ============================================================================

#[tokio::test]
async fn test_paused_partition_delivers_after_resume() {
    let cluster = MockCluster::builder().topic("paced", 1).start().await.unwrap();
    let consumer = Consumer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let mut partition = consumer
        .consume_partition("paced", 0, StartOffset::Oldest)
        .await
        .unwrap();

    partition.pause();
    assert!(partition.is_paused());
    produce(&cluster, "paced", &["held"]).await;
    assert!(
        timeout(Duration::from_millis(300), partition.recv()).await.is_err(),
        "paused partition delivered a message"
    );

    partition.resume();
    assert_eq!(next_value(&mut partition).await, (0, "held".to_string()));
    consumer.close().await.unwrap();
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_read_committed_hides_aborted_records() {
    let cluster = MockCluster::builder().topic("ledger", 1).start().await.unwrap();
    let producer = SyncProducer::new(&cluster.bootstrap(), transactional_config("ledger-tx"))
        .await
        .unwrap();
    assert!(producer.is_transactional());

    producer.begin_txn().await.unwrap();
    producer
        .send_message(ProducerMessage::new("ledger").with_value("discarded"))
        .await
        .unwrap();
    producer.abort_txn().await.unwrap();

    producer.begin_txn().await.unwrap();
    producer
        .send_message(ProducerMessage::new("ledger").with_value("kept"))
        .await
        .unwrap();
    producer.commit_txn().await.unwrap();
    assert_eq!(producer.txn_state().await, TxnState::Ready);
    producer.close().await.unwrap();

    let mut committed = fast_config();
    committed.consumer.isolation_level = IsolationLevel::ReadCommitted;
    let consumer = Consumer::new(&cluster.bootstrap(), committed).await.unwrap();
    let mut partition = consumer
        .consume_partition("ledger", 0, StartOffset::Oldest)
        .await
        .unwrap();
    let (_, value) = next_value(&mut partition).await;
    assert_eq!(value, "kept");
    consumer.close().await.unwrap();

    // Read-uncommitted sees both data records; control markers are never
    // delivered.
    let consumer = Consumer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let mut partition = consumer
        .consume_partition("ledger", 0, StartOffset::Oldest)
        .await
        .unwrap();
    assert_eq!(next_value(&mut partition).await.1, "discarded");
    assert_eq!(next_value(&mut partition).await.1, "kept");
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_transactional_offsets_commit_with_txn() {
    let cluster = MockCluster::builder()
        .topic("in", 1)
        .topic("out", 1)
        .start()
        .await
        .unwrap();
    let producer = SyncProducer::new(&cluster.bootstrap(), transactional_config("pipe"))
        .await
        .unwrap();

    producer.begin_txn().await.unwrap();
    producer
        .send_message(ProducerMessage::new("out").with_value("derived"))
        .await
        .unwrap();
    producer
        .add_offsets_to_txn(
            "pipeline",
            &[TxnOffset {
                topic: "in".to_string(),
                partition: 0,
                offset: 42,
                metadata: None,
            }],
        )
        .await
        .unwrap();
    assert_eq!(cluster.committed_offset("pipeline", "in", 0).unwrap(), None);

    producer.commit_txn().await.unwrap();
    assert_eq!(
        cluster
            .committed_offset("pipeline", "in", 0)
            .unwrap()
            .map(|(offset, _)| offset),
        Some(42)
    );
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_produce_outside_txn_rejected() {
    let cluster = MockCluster::builder().topic("strict", 1).start().await.unwrap();
    let producer = SyncProducer::new(&cluster.bootstrap(), transactional_config("strict-tx"))
        .await
        .unwrap();

    let err = producer
        .send_message(ProducerMessage::new("strict").with_value("loose"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transaction(_)), "unexpected error {err:?}");
    producer.close().await.unwrap();
    assert_eq!(cluster.high_water_mark("strict", 0).unwrap(), 0);
}
