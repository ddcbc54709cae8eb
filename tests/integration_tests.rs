//! End-to-end tests against the in-process mock cluster.
//!
//! Each test starts its own [`MockCluster`] on local ports and drives the
//! public client API through it: producing, consuming, leader changes,
//! lost acknowledgements, group rebalances and committed offsets.
//!
//! **Note:** These tests bind TCP listeners on 127.0.0.1.
//!
//! To run these tests:
//! ```bash
//! cargo test --test integration_tests
//! ```

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;

use gregor::config::FlushConfig;
use gregor::mock::MockCluster;
use gregor::prelude::*;
use gregor::retry::Backoff;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> Config {
    let mut config = Config::default();
    config.producer.retry.backoff = Backoff::Constant(Duration::from_millis(10));
    config.metadata.retry_backoff = Backoff::Constant(Duration::from_millis(10));
    config.consumer.retry_backoff = Backoff::Constant(Duration::from_millis(10));
    config.consumer.max_wait_time = Duration::from_millis(50);
    config.consumer.offsets.initial = StartOffset::Oldest;
    config
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn values(records: &[(i64, Option<bytes::Bytes>)]) -> Vec<String> {
    records
        .iter()
        .map(|(_, v)| String::from_utf8_lossy(v.as_deref().unwrap_or_default()).into_owned())
        .collect()
}

// ============================================================================
// Round trip
// ============================================================================

#[tokio::test]
async fn test_single_partition_round_trip() {
    let cluster = MockCluster::builder().topic("test.1", 1).start().await.unwrap();
    let mut config = fast_config();
    config.producer.required_acks = RequiredAcks::Leader;
    config.producer.flush.messages = 10;
    config.producer.return_successes = true;

    let mut producer = AsyncProducer::new(&cluster.bootstrap(), config).await.unwrap();
    let mut successes = producer.take_successes().unwrap();
    for i in 1..=10 {
        producer
            .send(ProducerMessage::new("test.1").with_value(format!("testing {i}")))
            .await
            .unwrap();
    }
    let mut offsets = Vec::new();
    for _ in 0..10 {
        let acked = timeout(WAIT, successes.recv()).await.unwrap().unwrap();
        assert_eq!(acked.partition, Some(0));
        offsets.push(acked.offset.unwrap());
    }
    assert_eq!(offsets, (0..10).collect::<Vec<i64>>());
    producer.close().await.unwrap();

    let consumer = Consumer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let mut partition = consumer
        .consume_partition("test.1", 0, StartOffset::At(0))
        .await
        .unwrap();
    for i in 1..=10 {
        let message = timeout(WAIT, partition.recv()).await.unwrap().unwrap();
        assert_eq!(message.offset, i64::from(i) - 1);
        assert_eq!(message.value.as_deref(), Some(format!("testing {i}").as_bytes()));
    }
    partition.close().await.unwrap();
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_keyed_messages_follow_fnv_hash() {
    let cluster = MockCluster::builder().topic("keyed", 6).start().await.unwrap();
    let producer = SyncProducer::new(&cluster.bootstrap(), fast_config()).await.unwrap();

    for key in ["alpha", "beta", "gamma", "alpha"] {
        let (partition, _) = producer
            .send_message(ProducerMessage::new("keyed").with_key(key).with_value("v"))
            .await
            .unwrap();
        let expected = (gregor::producer::partitioner::fnv1a32(key.as_bytes()) & 0x7fff_ffff) % 6;
        assert_eq!(partition, expected as i32, "key {key}");
    }
    producer.close().await.unwrap();
}

#[tokio::test]
async fn test_start_offset_beyond_newest_rejected() {
    let cluster = MockCluster::builder().topic("short", 1).start().await.unwrap();
    let consumer = Consumer::new(&cluster.bootstrap(), fast_config()).await.unwrap();

    let err = consumer
        .consume_partition("short", 0, StartOffset::At(5))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Kafka(KafkaCode::OffsetOutOfRange));

    // The failed claim must not keep the partition reserved.
    let partition = consumer
        .consume_partition("short", 0, StartOffset::Oldest)
        .await
        .unwrap();
    partition.close().await.unwrap();
}

// ============================================================================
// Leader failover
// ============================================================================

#[tokio::test]
async fn test_leader_failover_retries_on_new_leader() {
    let cluster = MockCluster::builder()
        .brokers(2)
        .topic("my_topic", 1)
        .start()
        .await
        .unwrap();
    assert_eq!(cluster.leader("my_topic", 0).unwrap(), 1);

    let producer = SyncProducer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let (_, first) = producer
        .send_message(ProducerMessage::new("my_topic").with_value("before"))
        .await
        .unwrap();
    assert_eq!(first, 0);

    cluster.move_leader("my_topic", 0, 2).unwrap();

    let messages = (1..=10)
        .map(|i| ProducerMessage::new("my_topic").with_value(format!("after {i}")))
        .collect();
    let acked = producer.send_messages(messages).await.unwrap();
    let offsets: Vec<i64> = acked.iter().filter_map(|m| m.offset).collect();
    assert_eq!(offsets, (1..=10).collect::<Vec<i64>>());
    producer.close().await.unwrap();

    let stored = cluster.records("my_topic", 0).unwrap();
    assert_eq!(stored.len(), 11);
    assert_eq!(values(&stored[..1]), vec!["before"]);
    assert_eq!(values(&stored[10..]), vec!["after 10"]);
}

#[tokio::test]
async fn test_retriable_produce_error_is_retried() {
    let cluster = MockCluster::builder().topic("flaky", 1).start().await.unwrap();
    cluster
        .fail_next_produce("flaky", 0, KafkaCode::NotEnoughReplicas)
        .unwrap();

    let producer = SyncProducer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let (_, offset) = producer
        .send_message(ProducerMessage::new("flaky").with_value("eventually"))
        .await
        .unwrap();
    assert_eq!(offset, 0);
    producer.close().await.unwrap();
    assert_eq!(cluster.high_water_mark("flaky", 0).unwrap(), 1);
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test]
async fn test_lost_ack_is_not_duplicated() {
    let cluster = MockCluster::builder().topic("once", 1).start().await.unwrap();
    let mut config = fast_config();
    config.enable_idempotence();
    config.producer.retry.max = 5;

    let producer = SyncProducer::new(&cluster.bootstrap(), config).await.unwrap();
    cluster.drop_next_produce_response().unwrap();

    let messages = (0..10)
        .map(|i| ProducerMessage::new("once").with_value(format!("m{i}")))
        .collect();
    let acked = producer.send_messages(messages).await.unwrap();
    assert_eq!(acked.len(), 10);

    let (_, next) = producer
        .send_message(ProducerMessage::new("once").with_value("after"))
        .await
        .unwrap();
    assert_eq!(next, 10);
    producer.close().await.unwrap();

    let stored = values(&cluster.records("once", 0).unwrap());
    let mut expected: Vec<String> = (0..10).map(|i| format!("m{i}")).collect();
    expected.push("after".to_string());
    assert_eq!(stored, expected);
}

// ============================================================================
// Message size
// ============================================================================

#[tokio::test]
async fn test_oversized_message_fails_alone() {
    let cluster = MockCluster::builder()
        .topic("sized", 1)
        .max_message_bytes(1024)
        .start()
        .await
        .unwrap();
    let mut config = fast_config();
    config.producer.flush = FlushConfig {
        messages: 3,
        frequency: Some(Duration::from_millis(50)),
        ..Default::default()
    };

    let producer = SyncProducer::new(&cluster.bootstrap(), config).await.unwrap();
    let messages = vec![
        ProducerMessage::new("sized").with_value("small-1"),
        ProducerMessage::new("sized").with_value(vec![b'x'; 4096]),
        ProducerMessage::new("sized").with_value("small-2"),
    ];
    let errors = producer.send_messages(messages).await.unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors.0[0].error, Error::Kafka(KafkaCode::MessageSizeTooLarge));
    assert_eq!(errors.0[0].message.value.as_ref().map(|v| v.len()), Some(4096));
    producer.close().await.unwrap();

    let mut stored = values(&cluster.records("sized", 0).unwrap());
    stored.sort();
    assert_eq!(stored, vec!["small-1", "small-2"]);
}

#[tokio::test]
async fn test_client_side_size_limit() {
    let cluster = MockCluster::builder().topic("local", 1).start().await.unwrap();
    let mut config = fast_config();
    config.producer.max_message_bytes = 512;

    let producer = SyncProducer::new(&cluster.bootstrap(), config).await.unwrap();
    let err = producer
        .send_message(ProducerMessage::new("local").with_value(vec![0u8; 2048]))
        .await
        .unwrap_err();
    assert_eq!(err, Error::Kafka(KafkaCode::MessageSizeTooLarge));
    producer.close().await.unwrap();
    assert_eq!(cluster.high_water_mark("local", 0).unwrap(), 0);
}

// ============================================================================
// Consumer groups
// ============================================================================

/// What the group handlers saw, in the order they saw it.
#[derive(Debug, Clone, PartialEq)]
enum Event {
    Setup { member: &'static str, generation: i32 },
    CleanupDone { member: &'static str, generation: i32 },
    Delivered { partition: i32, offset: i64 },
}

type EventLog = Arc<StdMutex<Vec<Event>>>;

/// Publishes the partitions of each new session and logs every callback.
struct Recorder {
    name: &'static str,
    assigned: watch::Sender<Vec<i32>>,
    consumed: Arc<AtomicUsize>,
    log: EventLog,
}

impl Recorder {
    fn record(&self, event: Event) {
        self.log.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ConsumerGroupHandler for Recorder {
    async fn setup(&self, session: &ConsumerGroupSession) -> Result<()> {
        self.record(Event::Setup {
            member: self.name,
            generation: session.generation_id(),
        });
        let partitions = session.claims().get("t").cloned().unwrap_or_default();
        self.assigned.send_replace(partitions);
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &ConsumerGroupSession,
        claim: &mut ConsumerGroupClaim,
    ) -> Result<()> {
        while let Some(message) = claim.recv().await {
            session.mark_message(&message, "");
            self.record(Event::Delivered {
                partition: message.partition,
                offset: message.offset,
            });
            self.consumed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn cleanup(&self, session: &ConsumerGroupSession) -> Result<()> {
        // Long enough for an overlapping setup elsewhere to show in the log.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.record(Event::CleanupDone {
            member: self.name,
            generation: session.generation_id(),
        });
        Ok(())
    }
}

struct Member {
    group: Arc<ConsumerGroup>,
    assigned: watch::Receiver<Vec<i32>>,
    consumed: Arc<AtomicUsize>,
}

fn group_config() -> Config {
    let mut config = fast_config();
    config.consumer.group.heartbeat_interval = Duration::from_millis(100);
    config.consumer.group.session_timeout = Duration::from_secs(3);
    config.consumer.group.rebalance.timeout = Duration::from_secs(3);
    config.consumer.group.rebalance.retry_backoff = Backoff::Constant(Duration::from_millis(20));
    config
}

/// Join group "g" and consume topic "t" until the group is closed.
async fn start_member(cluster: &MockCluster, name: &'static str, config: Config, log: &EventLog) -> Member {
    let group = Arc::new(
        ConsumerGroup::new(&cluster.bootstrap(), "g", config)
            .await
            .unwrap(),
    );
    let (tx, assigned) = watch::channel(Vec::new());
    let consumed = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(Recorder {
        name,
        assigned: tx,
        consumed: consumed.clone(),
        log: log.clone(),
    });
    let member = group.clone();
    tokio::spawn(async move {
        loop {
            match member.consume(&["t"], handler.clone()).await {
                Err(Error::ClosedConsumerGroup) => break,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
                Ok(()) => {}
            }
        }
    });
    Member {
        group,
        assigned,
        consumed,
    }
}

async fn produce_spread(producer: &SyncProducer, range: std::ops::Range<i32>) {
    for i in range {
        producer
            .send_message(
                ProducerMessage::new("t")
                    .with_partition(i % 4)
                    .with_value(format!("m{i}")),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_group_rebalance_splits_partitions() {
    let cluster = MockCluster::builder().topic("t", 4).start().await.unwrap();
    let producer = SyncProducer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    produce_spread(&producer, 0..20).await;
    let log = EventLog::default();

    let first = start_member(&cluster, "first", group_config(), &log).await;
    wait_until("first member to own every partition", || {
        first.assigned.borrow().len() == 4
    })
    .await;
    wait_until("the first batch to be consumed", || {
        first.consumed.load(Ordering::SeqCst) == 20
    })
    .await;
    assert_eq!(cluster.group_members("g").unwrap().len(), 1);
    let first_generation = cluster.group_generation("g").unwrap();

    // Keep producing while the group rebalances.
    let feeder = tokio::spawn(async move {
        for i in 20..40 {
            produce_spread(&producer, i..i + 1).await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        producer.close().await.unwrap();
    });
    let second = start_member(&cluster, "second", group_config(), &log).await;
    wait_until("partitions to be split", || {
        first.assigned.borrow().len() == 2 && second.assigned.borrow().len() == 2
    })
    .await;
    feeder.await.unwrap();
    wait_until("every message to be consumed", || {
        first.consumed.load(Ordering::SeqCst) + second.consumed.load(Ordering::SeqCst) >= 40
    })
    .await;

    let owned: BTreeSet<i32> = first
        .assigned
        .borrow()
        .iter()
        .chain(second.assigned.borrow().iter())
        .copied()
        .collect();
    assert_eq!(owned, BTreeSet::from([0, 1, 2, 3]));
    assert_eq!(cluster.group_members("g").unwrap().len(), 2);
    assert!(cluster.group_generation("g").unwrap() > first_generation);
    assert_eq!(cluster.group_state("g").unwrap(), Some("Stable"));

    first.group.close().await.unwrap();
    second.group.close().await.unwrap();
    assert_eq!(*first.group.watch_state().borrow(), GroupState::Closed);

    let events = log.lock().unwrap().clone();

    // The old generation is fully cleaned up before any member sets up the new one.
    let cleaned = events
        .iter()
        .position(|e| {
            *e == Event::CleanupDone {
                member: "first",
                generation: first_generation,
            }
        })
        .expect("first member cleaned up its first session");
    let next_setup = events
        .iter()
        .position(|e| matches!(e, Event::Setup { generation, .. } if *generation > first_generation))
        .expect("a later generation was set up");
    assert!(cleaned < next_setup, "sessions overlapped: {events:?}");

    // Across the hand-over every partition is delivered in order, once.
    let mut last: HashMap<i32, i64> = HashMap::new();
    let mut delivered = 0;
    for event in &events {
        if let Event::Delivered { partition, offset } = event {
            delivered += 1;
            if let Some(previous) = last.insert(*partition, *offset) {
                assert!(
                    *offset > previous,
                    "partition {partition} went from offset {previous} to {offset}"
                );
            }
        }
    }
    assert_eq!(delivered, 40);
    assert_eq!(last, HashMap::from([(0, 9), (1, 9), (2, 9), (3, 9)]));
}

#[tokio::test]
async fn test_group_commits_consumed_offsets() {
    let cluster = MockCluster::builder().topic("t", 1).start().await.unwrap();
    let producer = SyncProducer::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    for i in 0..3 {
        producer
            .send_message(ProducerMessage::new("t").with_value(format!("m{i}")))
            .await
            .unwrap();
    }
    producer.close().await.unwrap();

    let member = start_member(&cluster, "only", group_config(), &EventLog::default()).await;
    wait_until("every message to be consumed", || {
        member.consumed.load(Ordering::SeqCst) == 3
    })
    .await;
    member.group.close().await.unwrap();

    let committed = cluster.committed_offset("g", "t", 0).unwrap();
    assert_eq!(committed.map(|(offset, _)| offset), Some(3));
}

#[tokio::test]
async fn test_silent_coordinator_evicts_member_at_session_timeout() {
    let cluster = MockCluster::builder().brokers(2).topic("t", 1).start().await.unwrap();
    // Broker 1 coordinates; fetching from broker 2 keeps working while it is silent.
    cluster.move_leader("t", 0, 2).unwrap();

    let mut config = group_config();
    config.consumer.group.session_timeout = Duration::from_millis(500);
    config.consumer.group.heartbeat_interval = Duration::from_millis(100);
    config.net.read_timeout = Duration::from_secs(4);
    let log = EventLog::default();
    let member = start_member(&cluster, "quiet", config, &log).await;
    wait_until("the member to join", || member.assigned.borrow().len() == 1).await;

    cluster.stall_heartbeats(true).unwrap();
    let stalled = tokio::time::Instant::now();
    wait_until("the session to end", || {
        log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, Event::CleanupDone { .. }))
    })
    .await;
    let elapsed = stalled.elapsed();
    assert!(
        elapsed < Duration::from_millis(1500),
        "member kept its session for {elapsed:?} after heartbeats stopped"
    );
}

#[tokio::test]
async fn test_join_retries_are_bounded() {
    let cluster = MockCluster::builder().topic("t", 1).start().await.unwrap();
    for _ in 0..4 {
        cluster.fail_next_join(KafkaCode::UnknownMemberId).unwrap();
    }
    let mut config = group_config();
    config.consumer.group.rebalance.retry_max = 2;
    let group = ConsumerGroup::new(&cluster.bootstrap(), "g", config).await.unwrap();
    let (assigned, _) = watch::channel(Vec::new());
    let handler = Arc::new(Recorder {
        name: "rejected",
        assigned,
        consumed: Arc::new(AtomicUsize::new(0)),
        log: EventLog::default(),
    });

    let err = timeout(WAIT, group.consume(&["t"], handler))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err, Error::Kafka(KafkaCode::UnknownMemberId));
    // One attempt plus two retries.
    assert_eq!(cluster.pending_join_failures().unwrap(), 1);
    assert_eq!(*group.watch_state().borrow(), GroupState::Disconnected);
    group.close().await.unwrap();
}

#[tokio::test]
async fn test_join_retries_back_off() {
    let cluster = MockCluster::builder().topic("t", 1).start().await.unwrap();
    cluster.fail_next_join(KafkaCode::RebalanceInProgress).unwrap();
    cluster.fail_next_join(KafkaCode::RebalanceInProgress).unwrap();
    let mut config = group_config();
    config.consumer.group.rebalance.retry_max = 2;
    config.consumer.group.rebalance.retry_backoff = Backoff::Constant(Duration::from_millis(100));

    let started = tokio::time::Instant::now();
    let member = start_member(&cluster, "patient", config, &EventLog::default()).await;
    wait_until("the member to join", || member.assigned.borrow().len() == 1).await;
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(cluster.pending_join_failures().unwrap(), 0);
    member.group.close().await.unwrap();
}

// ============================================================================
// Offset management
// ============================================================================

#[tokio::test]
async fn test_offset_commit_survives_restart() {
    let cluster = MockCluster::builder().topic("t", 1).start().await.unwrap();

    {
        let client = Client::new(&cluster.bootstrap(), fast_config()).await.unwrap();
        let offsets = OffsetManager::new(client.clone(), "grp").unwrap();
        let partition = offsets.manage_partition("t", 0).await.unwrap();
        partition.mark_offset(100, "checkpoint");
        partition.close().await.unwrap();
        offsets.close().await.unwrap();
        client.close().await.unwrap();
    }

    assert_eq!(
        cluster.committed_offset("grp", "t", 0).unwrap(),
        Some((100, Some("checkpoint".to_string())))
    );

    let client = Client::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let offsets = OffsetManager::new(client.clone(), "grp").unwrap();
    let partition = offsets.manage_partition("t", 0).await.unwrap();
    assert_eq!(partition.next_offset(), (100, "checkpoint".to_string()));
    partition.close().await.unwrap();
    offsets.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_auto_commit_persists_marks_without_close() {
    let cluster = MockCluster::builder().topic("t", 1).start().await.unwrap();
    let auto_commit = || {
        let mut config = fast_config();
        config.consumer.offsets.auto_commit_enable = true;
        config.consumer.offsets.auto_commit_interval = Duration::from_millis(50);
        config
    };

    {
        let client = Client::new(&cluster.bootstrap(), auto_commit()).await.unwrap();
        let offsets = OffsetManager::new(client.clone(), "ticker").unwrap();
        let partition = offsets.manage_partition("t", 0).await.unwrap();
        partition.mark_offset(42, "ticked");
        wait_until("the auto-commit loop to commit", || {
            cluster.committed_offset("ticker", "t", 0).unwrap().is_some()
        })
        .await;
        // Everything is dropped here without being closed.
    }

    assert_eq!(
        cluster.committed_offset("ticker", "t", 0).unwrap(),
        Some((42, Some("ticked".to_string())))
    );
    let client = Client::new(&cluster.bootstrap(), auto_commit()).await.unwrap();
    let offsets = OffsetManager::new(client.clone(), "ticker").unwrap();
    let partition = offsets.manage_partition("t", 0).await.unwrap();
    assert_eq!(partition.next_offset(), (42, "ticked".to_string()));
    partition.close().await.unwrap();
    offsets.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_partition_manager_releases_partition() {
    let cluster = MockCluster::builder().topic("t", 1).start().await.unwrap();
    let client = Client::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let offsets = OffsetManager::new(client.clone(), "grp").unwrap();

    let first = offsets.manage_partition("t", 0).await.unwrap();
    let err = offsets.manage_partition("t", 0).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "unexpected error {err:?}");

    drop(first);
    let again = offsets.manage_partition("t", 0).await.unwrap();
    again.close().await.unwrap();
    offsets.close().await.unwrap();
    client.close().await.unwrap();
}

#[tokio::test]
async fn test_uncommitted_partition_uses_initial_offset() {
    let cluster = MockCluster::builder().topic("fresh", 1).start().await.unwrap();
    let client = Client::new(&cluster.bootstrap(), fast_config()).await.unwrap();
    let offsets = OffsetManager::new(client.clone(), "newcomers").unwrap();

    let partition = offsets.manage_partition("fresh", 0).await.unwrap();
    let (offset, metadata) = partition.next_offset();
    assert_eq!(offset, gregor::constants::OFFSET_OLDEST);
    assert_eq!(metadata, "");
    partition.close().await.unwrap();
    offsets.close().await.unwrap();
    client.close().await.unwrap();
}
