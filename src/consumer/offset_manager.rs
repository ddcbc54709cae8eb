//! Committed offsets for a consumer group.
//!
//! An [`OffsetManager`] owns one [`PartitionOffsetManager`] per managed
//! partition. Marks are kept in memory and written in a single OffsetCommit
//! request per tick of the auto-commit loop, or on [`OffsetManager::commit`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use backon::Retryable;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::Config;
use crate::constants::{DEFAULT_RETENTION_TIME, NO_COMMITTED_OFFSET};
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::offsets::{OffsetCommitPartition, OffsetCommitRequest, OffsetFetchRequest};
use crate::retry::RetryPolicy;
use crate::types::{StartOffset, TopicPartition};

/// Membership the commits are made under. Simple (group-less) consumers
/// commit with generation -1 and an empty member id.
#[derive(Debug, Clone)]
struct Membership {
    generation_id: i32,
    member_id: String,
    instance_id: Option<String>,
}

impl Default for Membership {
    fn default() -> Self {
        Self {
            generation_id: -1,
            member_id: String::new(),
            instance_id: None,
        }
    }
}

#[derive(Debug, Clone)]
struct OffsetEntry {
    offset: i64,
    metadata: String,
    dirty: bool,
}

struct Inner {
    client: Client,
    config: Arc<Config>,
    group: String,
    membership: StdMutex<Membership>,
    partitions: StdMutex<HashMap<TopicPartition, Arc<StdMutex<OffsetEntry>>>>,
    commit_lock: Mutex<()>,
}

pub struct OffsetManager {
    inner: Arc<Inner>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OffsetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffsetManager")
            .field("group", &self.inner.group)
            .finish_non_exhaustive()
    }
}

impl OffsetManager {
    /// Manage offsets of `group` through `client`. Starts the auto-commit
    /// loop when `consumer.offsets.auto_commit_enable` is set.
    pub fn new(client: Client, group: impl Into<String>) -> Result<Self> {
        if client.closed() {
            return Err(Error::ClosedClient);
        }
        let config = client.config().clone();
        let inner = Arc::new(Inner {
            client,
            config: config.clone(),
            group: group.into(),
            membership: StdMutex::new(Membership::default()),
            partitions: StdMutex::new(HashMap::new()),
            commit_lock: Mutex::new(()),
        });
        let cancel = CancellationToken::new();

        let task = config.consumer.offsets.auto_commit_enable.then(|| {
            let inner = inner.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { inner.auto_commit(cancel).await })
        });

        Ok(Self {
            inner,
            cancel,
            task: StdMutex::new(task),
        })
    }

    pub fn group(&self) -> &str {
        &self.inner.group
    }

    /// Commit under a group generation instead of as a simple consumer.
    pub fn set_generation(&self, generation_id: i32, member_id: &str, instance_id: Option<&str>) {
        if let Ok(mut membership) = self.inner.membership.lock() {
            *membership = Membership {
                generation_id,
                member_id: member_id.to_string(),
                instance_id: instance_id.map(str::to_string),
            };
        }
    }

    /// Start tracking `topic`/`partition`, loading its committed offset.
    pub async fn manage_partition(&self, topic: &str, partition: i32) -> Result<PartitionOffsetManager> {
        let tp = TopicPartition::new(topic, partition);
        if self.inner.entry(&tp).is_some() {
            return Err(Error::Config(format!(
                "{topic}/{partition} is already managed for group {}",
                self.inner.group
            )));
        }

        let (offset, metadata) = self.inner.fetch_committed(&tp).await?;
        let entry = Arc::new(StdMutex::new(OffsetEntry {
            offset,
            metadata,
            dirty: false,
        }));
        let mut partitions = self.inner.partitions.lock().map_err(poisoned)?;
        if partitions.contains_key(&tp) {
            return Err(Error::Config(format!("{topic}/{partition} is already managed")));
        }
        partitions.insert(tp.clone(), entry.clone());
        tracing::debug!(group = %self.inner.group, topic, partition, offset, "Managing partition offset");

        Ok(PartitionOffsetManager {
            tp,
            entry,
            inner: self.inner.clone(),
        })
    }

    /// Write every marked offset now.
    pub async fn commit(&self) -> Result<()> {
        self.inner.commit().await
    }

    /// Stop the auto-commit loop and write what is still marked.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task {
            let _ = task.await;
        }
        let result = self.inner.commit().await;
        if let Ok(mut partitions) = self.inner.partitions.lock() {
            partitions.clear();
        }
        result
    }
}

impl Drop for OffsetManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    fn entry(&self, tp: &TopicPartition) -> Option<Arc<StdMutex<OffsetEntry>>> {
        self.partitions.lock().ok()?.get(tp).cloned()
    }

    async fn auto_commit(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.consumer.offsets.auto_commit_interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.commit().await {
                        tracing::debug!(group = %self.group, error = %e, "Offset commit failed, retrying next tick");
                    }
                }
            }
        }
    }

    /// The committed offset of `tp`, or the configured initial offset when
    /// the group has none.
    async fn fetch_committed(&self, tp: &TopicPartition) -> Result<(i64, String)> {
        let retry = &self.config.metadata;
        let policy = RetryPolicy::new(retry.retry_backoff.clone(), self.config.consumer.offsets.retry_max);
        let (offset, metadata) = (|| async { self.fetch_once(tp).await })
            .retry(policy)
            .when(|e: &Error| e.is_retriable())
            .notify(|e, delay| {
                tracing::debug!(group = %self.group, error = %e, delay_ms = delay.as_millis() as u64, "Offset fetch failed, retrying");
            })
            .await?;

        if offset == NO_COMMITTED_OFFSET {
            let initial = match self.config.consumer.offsets.initial {
                StartOffset::At(offset) => offset,
                other => other.timestamp().unwrap_or(NO_COMMITTED_OFFSET),
            };
            return Ok((initial, String::new()));
        }
        Ok((offset, metadata))
    }

    async fn fetch_once(&self, tp: &TopicPartition) -> Result<(i64, String)> {
        let broker = self.client.coordinator(&self.group).await?;
        let mut request = OffsetFetchRequest::new(self.group.clone());
        request.add_partition(&tp.topic, tp.partition);

        let response = match broker.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_connection_error() {
                    let _ = broker.close().await;
                    let _ = self.client.refresh_coordinator(&self.group).await;
                }
                return Err(e);
            }
        };
        self.check_coordinator(response.error_code).await?;

        let block = response
            .partition(&tp.topic, tp.partition)
            .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?;
        self.check_coordinator(block.error_code).await?;
        Ok((
            block.committed_offset,
            block.metadata.clone().unwrap_or_default(),
        ))
    }

    async fn check_coordinator(&self, code: KafkaCode) -> Result<()> {
        if code.invalidates_coordinator() {
            let _ = self.client.refresh_coordinator(&self.group).await;
        }
        code.ok()
    }

    async fn commit(&self) -> Result<()> {
        let _guard = self.commit_lock.lock().await;

        let pending: Vec<(TopicPartition, Arc<StdMutex<OffsetEntry>>, i64, String)> = {
            let partitions = self.partitions.lock().map_err(poisoned)?;
            partitions
                .iter()
                .filter_map(|(tp, entry)| {
                    let e = entry.lock().ok()?;
                    e.dirty
                        .then(|| (tp.clone(), entry.clone(), e.offset, e.metadata.clone()))
                })
                .collect()
        };
        if pending.is_empty() {
            return Ok(());
        }

        let membership = self
            .membership
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();
        let retention_time_ms = self
            .config
            .consumer
            .offsets
            .retention
            .map_or(DEFAULT_RETENTION_TIME, |r| r.as_millis() as i64);
        let mut request = OffsetCommitRequest {
            group_id: self.group.clone(),
            generation_id: membership.generation_id,
            member_id: membership.member_id,
            group_instance_id: membership.instance_id,
            retention_time_ms,
            ..Default::default()
        };
        for (tp, _, offset, metadata) in &pending {
            request.add_partition(
                &tp.topic,
                OffsetCommitPartition::new(tp.partition, *offset, Some(metadata.clone())),
            );
        }

        let broker = self.client.coordinator(&self.group).await?;
        let response = match broker.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_connection_error() {
                    let _ = broker.close().await;
                }
                let _ = self.client.refresh_coordinator(&self.group).await;
                return Err(e);
            }
        };

        let mut first_error = None;
        for (tp, entry, offset, metadata) in pending {
            let code = response
                .error_for(&tp.topic, tp.partition)
                .unwrap_or(KafkaCode::UnknownTopicOrPartition);
            if code.is_ok() {
                if let Ok(mut e) = entry.lock()
                    && e.offset == offset
                    && e.metadata == metadata
                {
                    e.dirty = false;
                }
                continue;
            }
            tracing::debug!(group = %self.group, topic = %tp.topic, partition = tp.partition, error = ?code, "Offset commit rejected");
            if code.invalidates_coordinator() {
                let _ = self.client.refresh_coordinator(&self.group).await;
            }
            first_error.get_or_insert(Error::Kafka(code));
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::InvariantViolation("offset manager lock poisoned".to_string())
}

// ============================================================================
// PartitionOffsetManager
// ============================================================================

/// Offset bookkeeping for one partition.
pub struct PartitionOffsetManager {
    tp: TopicPartition,
    entry: Arc<StdMutex<OffsetEntry>>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PartitionOffsetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionOffsetManager")
            .field("group", &self.inner.group)
            .field("topic", &self.tp.topic)
            .field("partition", &self.tp.partition)
            .finish_non_exhaustive()
    }
}

impl PartitionOffsetManager {
    pub fn topic(&self) -> &str {
        &self.tp.topic
    }

    pub fn partition(&self) -> i32 {
        self.tp.partition
    }

    /// Where consumption should resume and the metadata stored with it.
    /// Without a committed offset this is the configured initial offset,
    /// which may be the [`OFFSET_NEWEST`](crate::constants::OFFSET_NEWEST) or
    /// [`OFFSET_OLDEST`](crate::constants::OFFSET_OLDEST) sentinel.
    pub fn next_offset(&self) -> (i64, String) {
        match self.entry.lock() {
            Ok(e) => (e.offset, e.metadata.clone()),
            Err(_) => (NO_COMMITTED_OFFSET, String::new()),
        }
    }

    /// Record that every message below `offset` has been processed. Marks
    /// never move the offset backwards.
    pub fn mark_offset(&self, offset: i64, metadata: &str) {
        if let Ok(mut e) = self.entry.lock()
            && offset > e.offset
        {
            e.offset = offset;
            e.metadata = metadata.to_string();
            e.dirty = true;
        }
    }

    /// Move the offset back to `offset`. Offsets ahead of the current one
    /// are ignored; use [`mark_offset`](Self::mark_offset) for those.
    pub fn reset_offset(&self, offset: i64, metadata: &str) {
        if let Ok(mut e) = self.entry.lock()
            && offset <= e.offset
        {
            e.offset = offset;
            e.metadata = metadata.to_string();
            e.dirty = true;
        }
    }

    /// Commit this partition's pending mark and stop managing it.
    pub async fn close(self) -> Result<()> {
        self.inner.commit().await
    }
}

/// Dropping stops managing the partition. A mark not yet committed by the
/// auto-commit loop is lost; call [`PartitionOffsetManager::close`] to
/// commit it first.
impl Drop for PartitionOffsetManager {
    fn drop(&mut self) {
        if let Ok(mut partitions) = self.inner.partitions.lock()
            && partitions
                .get(&self.tp)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.entry))
        {
            partitions.remove(&self.tp);
        }
    }
}
