//! Partition consumers and committed offsets.
//!
//! [`Consumer`] hands out one [`PartitionConsumer`] per partition. Each runs
//! its own fetch loop against the partition leader and delivers messages in
//! offset order on a bounded channel, so a slow reader slows its fetches
//! down rather than buffering without limit.
//!
//! ```rust,no_run
//! use gregor::consumer::Consumer;
//! use gregor::types::StartOffset;
//!
//! # async fn example() -> gregor::Result<()> {
//! let consumer = Consumer::new(&["localhost:9092"], Default::default()).await?;
//! let mut partition = consumer.consume_partition("events", 0, StartOffset::Oldest).await?;
//! while let Some(message) = partition.recv().await {
//!     println!("{}: {:?}", message.offset, message.value);
//! }
//! # Ok(())
//! # }
//! ```

mod decode;
mod offset_manager;
mod partition;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bytes::Bytes;

pub use offset_manager::{OffsetManager, PartitionOffsetManager};
pub use partition::PartitionConsumer;

use crate::client::Client;
use crate::config::Config;
use crate::constants::{OFFSET_NEWEST, OFFSET_OLDEST};
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::records::RecordHeader;
use crate::types::{StartOffset, TopicPartition};
use partition::PartitionState;

// ============================================================================
// Messages and errors
// ============================================================================

/// A record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
    pub offset: i64,
    /// Milliseconds since the epoch, or -1 for messages without one.
    pub timestamp: i64,
}

/// A failure while consuming one partition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to consume {topic}/{partition}: {error}")]
pub struct ConsumerError {
    pub topic: String,
    pub partition: i32,
    pub error: Error,
}

/// Errors collected when a consumer is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{} consumer errors", .0.len())]
pub struct ConsumerErrors(pub Vec<ConsumerError>);

impl ConsumerErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl IntoIterator for ConsumerErrors {
    type Item = ConsumerError;
    type IntoIter = std::vec::IntoIter<ConsumerError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Partitions currently consumed, shared between a [`Consumer`] and its
/// partition consumers.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    partitions: StdMutex<HashMap<TopicPartition, Arc<PartitionState>>>,
}

impl Registry {
    fn claim(&self, tp: &TopicPartition) -> Result<Arc<PartitionState>> {
        let mut partitions = self
            .partitions
            .lock()
            .map_err(|_| Error::InvariantViolation("consumer registry poisoned".to_string()))?;
        if partitions.contains_key(tp) {
            return Err(Error::AlreadyConsuming {
                topic: tp.topic.clone(),
                partition: tp.partition,
            });
        }
        let state = Arc::new(PartitionState::new());
        partitions.insert(tp.clone(), state.clone());
        Ok(state)
    }

    pub(crate) fn release(&self, tp: &TopicPartition) {
        if let Ok(mut partitions) = self.partitions.lock() {
            partitions.remove(tp);
        }
    }

    fn each(&self, mut f: impl FnMut(&TopicPartition, &PartitionState)) {
        if let Ok(partitions) = self.partitions.lock() {
            for (tp, state) in partitions.iter() {
                f(tp, state);
            }
        }
    }

    fn get(&self, tp: &TopicPartition) -> Option<Arc<PartitionState>> {
        self.partitions.lock().ok()?.get(tp).cloned()
    }
}

// ============================================================================
// Consumer
// ============================================================================

pub struct Consumer {
    client: Client,
    owns_client: bool,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    /// Connect to `addrs` with a client owned by the consumer.
    pub async fn new<S: AsRef<str>>(addrs: &[S], config: Config) -> Result<Self> {
        let client = Client::new(addrs, config).await?;
        let mut consumer = Self::from_client(client)?;
        consumer.owns_client = true;
        Ok(consumer)
    }

    /// Consume through an existing client. Closing the consumer leaves the
    /// client open.
    pub fn from_client(client: Client) -> Result<Self> {
        if client.closed() {
            return Err(Error::ClosedClient);
        }
        Ok(Self {
            client,
            owns_client: false,
            registry: Arc::new(Registry::default()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn topics(&self) -> Result<Vec<String>> {
        self.client.topics()
    }

    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.client.partitions(topic).await
    }

    /// Start consuming `topic`/`partition` from `start`. A literal offset
    /// must lie between the oldest and newest offsets of the partition.
    pub async fn consume_partition(
        &self,
        topic: &str,
        partition: i32,
        start: StartOffset,
    ) -> Result<PartitionConsumer> {
        let tp = TopicPartition::new(topic, partition);
        let state = self.registry.claim(&tp)?;
        match self.resolve_offset(topic, partition, start).await {
            Ok(offset) => {
                tracing::info!(topic, partition, offset, "Consuming partition");
                Ok(PartitionConsumer::start(
                    self.client.clone(),
                    tp,
                    offset,
                    state,
                    self.registry.clone(),
                ))
            }
            Err(e) => {
                self.registry.release(&tp);
                Err(e)
            }
        }
    }

    async fn resolve_offset(&self, topic: &str, partition: i32, start: StartOffset) -> Result<i64> {
        match start {
            StartOffset::Oldest => self.client.get_offset(topic, partition, OFFSET_OLDEST).await,
            StartOffset::Newest => self.client.get_offset(topic, partition, OFFSET_NEWEST).await,
            StartOffset::At(offset) => {
                let oldest = self.client.get_offset(topic, partition, OFFSET_OLDEST).await?;
                let newest = self.client.get_offset(topic, partition, OFFSET_NEWEST).await?;
                if offset < oldest || offset > newest {
                    return Err(Error::Kafka(KafkaCode::OffsetOutOfRange));
                }
                Ok(offset)
            }
        }
    }

    /// Last high-water mark of every consumed partition.
    pub fn high_water_marks(&self) -> HashMap<String, HashMap<i32, i64>> {
        let mut marks: HashMap<String, HashMap<i32, i64>> = HashMap::new();
        self.registry.each(|tp, state| {
            marks
                .entry(tp.topic.clone())
                .or_default()
                .insert(tp.partition, state.high_water_mark());
        });
        marks
    }

    /// Stop fetching `topic`/`partition`. A no-op for partitions not being
    /// consumed.
    pub fn pause(&self, topic: &str, partition: i32) {
        if let Some(state) = self.registry.get(&TopicPartition::new(topic, partition)) {
            state.set_paused(true);
        }
    }

    pub fn resume(&self, topic: &str, partition: i32) {
        if let Some(state) = self.registry.get(&TopicPartition::new(topic, partition)) {
            state.set_paused(false);
        }
    }

    pub fn pause_all(&self) {
        self.registry.each(|_, state| state.set_paused(true));
    }

    pub fn resume_all(&self) {
        self.registry.each(|_, state| state.set_paused(false));
    }

    /// Close the client when this consumer created it. Partition consumers
    /// should be closed first.
    pub async fn close(self) -> Result<()> {
        if self.owns_client {
            self.client.close().await?;
        }
        Ok(())
    }
}
