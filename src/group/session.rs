use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::consumer::{ConsumerMessage, OffsetManager, PartitionConsumer, PartitionOffsetManager};
use crate::error::Result;
use crate::types::TopicPartition;

/// Callbacks driven by [`ConsumerGroup::consume`](super::ConsumerGroup::consume).
///
/// `setup` runs once the member holds its assignment and before any claim
/// starts. `consume_claim` runs on its own task for every claimed partition
/// and should return once [`ConsumerGroupClaim::recv`] yields `None`.
/// `cleanup` runs after every claim has returned, and the next session does
/// not begin until it has.
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    async fn setup(&self, _session: &ConsumerGroupSession) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _session: &ConsumerGroupSession) -> Result<()> {
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &ConsumerGroupSession,
        claim: &mut ConsumerGroupClaim,
    ) -> Result<()>;
}

// ============================================================================
// Session
// ============================================================================

/// One generation of group membership.
pub struct ConsumerGroupSession {
    member_id: String,
    generation_id: i32,
    claims: BTreeMap<String, Vec<i32>>,
    offsets: StdMutex<HashMap<TopicPartition, PartitionOffsetManager>>,
    manager: Arc<OffsetManager>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConsumerGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroupSession")
            .field("member_id", &self.member_id)
            .field("generation_id", &self.generation_id)
            .field("claims", &self.claims)
            .finish_non_exhaustive()
    }
}

impl ConsumerGroupSession {
    pub(crate) fn new(
        member_id: String,
        generation_id: i32,
        claims: BTreeMap<String, Vec<i32>>,
        offsets: HashMap<TopicPartition, PartitionOffsetManager>,
        manager: Arc<OffsetManager>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            member_id,
            generation_id,
            claims,
            offsets: StdMutex::new(offsets),
            manager,
            cancel,
        }
    }

    /// Partitions assigned to this member, by topic.
    pub fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
        &self.claims
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    /// Record that everything below `offset` in `topic`/`partition` is
    /// processed. Ignored for partitions outside this session's claims.
    pub fn mark_offset(&self, topic: &str, partition: i32, offset: i64, metadata: &str) {
        if let Ok(offsets) = self.offsets.lock()
            && let Some(pom) = offsets.get(&TopicPartition::new(topic, partition))
        {
            pom.mark_offset(offset, metadata);
        }
    }

    /// Mark `message` as processed.
    pub fn mark_message(&self, message: &ConsumerMessage, metadata: &str) {
        self.mark_offset(&message.topic, message.partition, message.offset + 1, metadata);
    }

    /// Move a partition's offset back.
    pub fn reset_offset(&self, topic: &str, partition: i32, offset: i64, metadata: &str) {
        if let Ok(offsets) = self.offsets.lock()
            && let Some(pom) = offsets.get(&TopicPartition::new(topic, partition))
        {
            pom.reset_offset(offset, metadata);
        }
    }

    /// Write marked offsets now instead of waiting for the commit interval.
    pub async fn commit(&self) -> Result<()> {
        self.manager.commit().await
    }

    /// Resolves when the session ends, on rebalance or close.
    pub async fn done(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn end(&self) {
        self.cancel.cancel();
    }

    /// Where a claim on `topic`/`partition` starts.
    pub(crate) fn next_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        let offsets = self.offsets.lock().ok()?;
        offsets
            .get(&TopicPartition::new(topic, partition))
            .map(|pom| pom.next_offset().0)
    }

    pub(crate) fn take_offsets(&self) -> Vec<PartitionOffsetManager> {
        match self.offsets.lock() {
            Ok(mut offsets) => offsets.drain().map(|(_, pom)| pom).collect(),
            Err(_) => Vec::new(),
        }
    }
}

// ============================================================================
// Claim
// ============================================================================

/// One partition claimed for the duration of a session.
pub struct ConsumerGroupClaim {
    initial_offset: i64,
    consumer: PartitionConsumer,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConsumerGroupClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerGroupClaim")
            .field("topic", &self.consumer.topic())
            .field("partition", &self.consumer.partition())
            .field("initial_offset", &self.initial_offset)
            .finish()
    }
}

impl ConsumerGroupClaim {
    pub(crate) fn new(initial_offset: i64, consumer: PartitionConsumer, cancel: CancellationToken) -> Self {
        Self {
            initial_offset,
            consumer,
            cancel,
        }
    }

    pub fn topic(&self) -> &str {
        self.consumer.topic()
    }

    pub fn partition(&self) -> i32 {
        self.consumer.partition()
    }

    /// Offset the claim started from.
    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    pub fn high_water_mark(&self) -> i64 {
        self.consumer.high_water_mark()
    }

    /// Next message, or `None` once the session has ended.
    pub async fn recv(&mut self) -> Option<ConsumerMessage> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            message = self.consumer.recv() => message,
        }
    }

    pub(crate) fn into_consumer(self) -> PartitionConsumer {
        self.consumer
    }
}
