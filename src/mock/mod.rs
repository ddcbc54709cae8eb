//! An in-process Kafka cluster for tests.
//!
//! [`MockCluster`] starts one [`MockBroker`] per node on a local port. The
//! brokers decode real requests with the crate's codec and answer from a
//! shared in-memory model: partition logs, consumer groups, committed
//! offsets, producer ids and transactions. Faults can be injected to drive
//! the client's retry paths.
//!
//! ```rust,no_run
//! use gregor::mock::MockCluster;
//!
//! # async fn example() -> gregor::Result<()> {
//! let cluster = MockCluster::builder().brokers(2).topic("events", 4).start().await?;
//! let client = gregor::client::Client::new(&cluster.bootstrap(), Default::default()).await?;
//! # Ok(())
//! # }
//! ```

mod group;
mod server;
mod state;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub use server::MockBroker;

use crate::constants::DEFAULT_MAX_MESSAGE_BYTES;
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::records::{RecordSet, decode_record_set};
use server::Shared;
use state::ClusterState;

/// Interval of the coordinator's session and rebalance checks.
const GROUP_TICK: Duration = Duration::from_millis(20);

// ============================================================================
// Builder
// ============================================================================

#[derive(Debug, Clone)]
pub struct MockClusterBuilder {
    brokers: usize,
    topics: Vec<(String, i32)>,
    max_message_bytes: usize,
    sasl: Option<(String, String)>,
}

impl Default for MockClusterBuilder {
    fn default() -> Self {
        Self {
            brokers: 1,
            topics: Vec::new(),
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            sasl: None,
        }
    }
}

impl MockClusterBuilder {
    /// Number of brokers, ids starting at 1.
    pub fn brokers(mut self, count: usize) -> Self {
        self.brokers = count.max(1);
        self
    }

    /// Create `topic` with leaders spread round-robin over the brokers.
    pub fn topic(mut self, topic: &str, partitions: i32) -> Self {
        self.topics.push((topic.to_string(), partitions));
        self
    }

    /// Largest record batch the brokers accept.
    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Require SASL/PLAIN with these credentials on every connection.
    pub fn sasl_plain(mut self, user: &str, password: &str) -> Self {
        self.sasl = Some((user.to_string(), password.to_string()));
        self
    }

    pub async fn start(self) -> Result<MockCluster> {
        let mut listeners = Vec::with_capacity(self.brokers);
        let mut addrs = BTreeMap::new();
        for id in 1..=self.brokers as i32 {
            let (listener, addr) = MockBroker::bind().await?;
            let port = listener.local_addr()?.port();
            addrs.insert(id, ("127.0.0.1".to_string(), i32::from(port)));
            listeners.push((id, listener, addr));
        }

        let mut state = ClusterState::new(addrs, self.max_message_bytes);
        for (topic, partitions) in &self.topics {
            state.create_topic(topic, *partitions);
        }
        let shared = Arc::new(Shared {
            state: StdMutex::new(state),
            appended: Notify::new(),
            sasl: self.sasl,
        });

        let brokers = listeners
            .into_iter()
            .map(|(id, listener, addr)| MockBroker::start(id, listener, addr, shared.clone()))
            .collect::<Vec<_>>();
        let cancel = CancellationToken::new();
        tokio::spawn(tick_groups(shared.clone(), cancel.clone()));

        tracing::info!(
            brokers = brokers.len(),
            topics = self.topics.len(),
            "Mock cluster started"
        );
        Ok(MockCluster {
            brokers,
            shared,
            cancel,
        })
    }
}

async fn tick_groups(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(GROUP_TICK);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let Ok(mut state) = shared.lock() else {
                    return;
                };
                let now = Instant::now();
                for group in state.groups.values_mut() {
                    group.tick(now);
                }
            }
        }
    }
}

// ============================================================================
// Cluster handle
// ============================================================================

/// A running mock cluster. Dropping it shuts every broker down.
pub struct MockCluster {
    brokers: Vec<MockBroker>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster")
            .field("brokers", &self.bootstrap())
            .finish_non_exhaustive()
    }
}

impl MockCluster {
    pub fn builder() -> MockClusterBuilder {
        MockClusterBuilder::default()
    }

    /// Addresses of every broker, usable as bootstrap servers.
    pub fn bootstrap(&self) -> Vec<String> {
        self.brokers.iter().map(|b| b.addr().to_string()).collect()
    }

    pub fn brokers(&self) -> &[MockBroker] {
        &self.brokers
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) -> Result<()> {
        self.shared.lock()?.create_topic(topic, partitions);
        Ok(())
    }

    /// Current leader of a partition.
    pub fn leader(&self, topic: &str, partition: i32) -> Result<i32> {
        let state = self.shared.lock()?;
        let log = state
            .partition(topic, partition)
            .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?;
        Ok(log.leader())
    }

    /// Make `broker` the leader of a partition. Requests for the partition
    /// reaching the old leader fail with `NotLeaderForPartition`.
    pub fn move_leader(&self, topic: &str, partition: i32, broker: i32) -> Result<()> {
        let mut state = self.shared.lock()?;
        if !state.brokers.contains_key(&broker) {
            return Err(Error::Config(format!("no mock broker {broker}")));
        }
        if !state.set_leader(topic, partition, broker) {
            return Err(Error::Kafka(KafkaCode::UnknownTopicOrPartition));
        }
        tracing::info!(topic, partition, leader = broker, "Mock leader moved");
        Ok(())
    }

    /// Reject the next produce to a partition with `code`. Calls queue up.
    pub fn fail_next_produce(&self, topic: &str, partition: i32, code: KafkaCode) -> Result<()> {
        self.shared
            .lock()?
            .faults
            .produce_errors
            .entry((topic.to_string(), partition))
            .or_insert_with(VecDeque::new)
            .push_back(code);
        Ok(())
    }

    /// Write the next produce request but close the connection instead of
    /// answering it, as if the ack were lost.
    pub fn drop_next_produce_response(&self) -> Result<()> {
        self.shared.lock()?.faults.drop_produce_responses += 1;
        Ok(())
    }

    /// Answer the next JoinGroup with `code`. Calls queue up.
    pub fn fail_next_join(&self, code: KafkaCode) -> Result<()> {
        self.shared.lock()?.faults.join_errors.push_back(code);
        Ok(())
    }

    /// Queued join failures that have not fired yet.
    pub fn pending_join_failures(&self) -> Result<usize> {
        Ok(self.shared.lock()?.faults.join_errors.len())
    }

    /// Stop answering heartbeats. The connection carrying the first unanswered
    /// heartbeat stays open but silent.
    pub fn stall_heartbeats(&self, stalled: bool) -> Result<()> {
        self.shared.lock()?.faults.stall_heartbeats = stalled;
        Ok(())
    }

    pub fn set_max_message_bytes(&self, bytes: usize) -> Result<()> {
        self.shared.lock()?.max_message_bytes = bytes;
        Ok(())
    }

    /// Next offset to be written to a partition.
    pub fn high_water_mark(&self, topic: &str, partition: i32) -> Result<i64> {
        let state = self.shared.lock()?;
        state
            .partition(topic, partition)
            .map(|log| log.high_water_mark())
            .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))
    }

    /// Values stored in a partition as `(offset, value)`, control records
    /// excluded.
    pub fn records(&self, topic: &str, partition: i32) -> Result<Vec<(i64, Option<Bytes>)>> {
        let raw: Vec<Bytes> = {
            let state = self.shared.lock()?;
            let log = state
                .partition(topic, partition)
                .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?;
            log.entries().cloned().collect()
        };
        let mut out = Vec::new();
        for entry in raw {
            for set in decode_record_set(&entry)?.sets {
                match set {
                    RecordSet::Batch(batch) if batch.is_control => {}
                    RecordSet::Batch(batch) => out.extend(
                        batch
                            .records
                            .into_iter()
                            .map(|r| (batch.base_offset + i64::from(r.offset_delta), r.value)),
                    ),
                    RecordSet::Legacy(blocks) => {
                        out.extend(blocks.into_iter().map(|b| (b.offset, b.message.value)))
                    }
                }
            }
        }
        Ok(out)
    }

    /// Committed offset and metadata of a group partition.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Result<Option<(i64, Option<String>)>> {
        Ok(self
            .shared
            .lock()?
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .cloned())
    }

    /// Member ids of a group's current generation.
    pub fn group_members(&self, group: &str) -> Result<Vec<String>> {
        Ok(self
            .shared
            .lock()?
            .groups
            .get(group)
            .map(|g| g.member_ids())
            .unwrap_or_default())
    }

    /// Coordinator phase of a group, `None` for groups never joined.
    pub fn group_state(&self, group: &str) -> Result<Option<&'static str>> {
        Ok(self.shared.lock()?.groups.get(group).map(|g| g.phase().as_str()))
    }

    /// Generation of a group, 0 before its first rebalance.
    pub fn group_generation(&self, group: &str) -> Result<i32> {
        Ok(self
            .shared
            .lock()?
            .groups
            .get(group)
            .map(|g| g.generation_id())
            .unwrap_or_default())
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        for broker in &self.brokers {
            broker.shutdown();
        }
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}
