//! Cluster client: metadata cache, broker registry and coordinator lookup.
//!
//! [`Client`] is cheap to clone; producers, consumers and groups built from
//! one client share its brokers and metadata.
//!
//! Metadata lives in an immutable [`MetadataSnapshot`] that refreshes replace
//! wholesale, so a caller holding a snapshot always sees one consistent view.
//! A refresh runs on startup, when a lookup misses, when a caller reports a
//! stale-leader error through [`Client::refresh_metadata`], and periodically
//! when `metadata.refresh_frequency` is set.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use backon::Retryable;
use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::config::Config;
use crate::constants::NO_LEADER;
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::groups::{
    DescribeGroupsRequest, DescribedGroup, FindCoordinatorRequest, ListGroupsRequest,
};
use crate::protocol::list_offsets::ListOffsetsRequest;
use crate::protocol::metadata::{MetadataRequest, MetadataResponse};
use crate::retry::RetryPolicy;
use crate::types::CoordinatorType;

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerInfo {
    pub id: i32,
    pub addr: String,
    pub rack: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub id: i32,
    pub error: KafkaCode,
    /// Leader broker id, or [`NO_LEADER`].
    pub leader: i32,
    pub leader_epoch: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
    pub offline_replicas: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicMetadata {
    pub error: KafkaCode,
    pub is_internal: bool,
    /// Sorted by partition id.
    pub partitions: Vec<PartitionMetadata>,
}

/// One consistent view of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataSnapshot {
    /// Increments on every refresh.
    pub generation: u64,
    pub cluster_id: Option<String>,
    pub controller_id: i32,
    pub brokers: BTreeMap<i32, BrokerInfo>,
    pub topics: BTreeMap<String, TopicMetadata>,
}

impl MetadataSnapshot {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionMetadata> {
        let topic = self.topics.get(topic)?;
        topic
            .partitions
            .binary_search_by_key(&partition, |p| p.id)
            .ok()
            .map(|i| &topic.partitions[i])
    }

    /// Every partition id of `topic`, ascending.
    pub fn partitions(&self, topic: &str) -> Option<Vec<i32>> {
        self.topics
            .get(topic)
            .map(|t| t.partitions.iter().map(|p| p.id).collect())
    }

    /// Partitions of `topic` that currently have a leader.
    pub fn writable_partitions(&self, topic: &str) -> Option<Vec<i32>> {
        self.topics.get(topic).map(|t| {
            t.partitions
                .iter()
                .filter(|p| p.leader != NO_LEADER && p.error != KafkaCode::LeaderNotAvailable)
                .map(|p| p.id)
                .collect()
        })
    }

    /// Leader id of a partition. Errors describe why there is none.
    pub fn leader_id(&self, topic: &str, partition: i32) -> Result<Option<i32>> {
        let Some(meta) = self.partition(topic, partition) else {
            return Ok(None);
        };
        if meta.error == KafkaCode::LeaderNotAvailable || meta.leader == NO_LEADER {
            return Err(Error::Kafka(KafkaCode::LeaderNotAvailable));
        }
        Ok(Some(meta.leader))
    }

    fn apply(&self, response: &MetadataResponse, full: bool) -> MetadataSnapshot {
        let brokers = response
            .brokers
            .iter()
            .map(|b| {
                (
                    b.node_id,
                    BrokerInfo {
                        id: b.node_id,
                        addr: b.addr(),
                        rack: b.rack.clone(),
                    },
                )
            })
            .collect();

        let mut topics = if full { BTreeMap::new() } else { self.topics.clone() };
        for topic in &response.topics {
            match topic.error_code {
                KafkaCode::None | KafkaCode::LeaderNotAvailable => {
                    let mut partitions: Vec<PartitionMetadata> = topic
                        .partitions
                        .iter()
                        .map(|p| PartitionMetadata {
                            id: p.partition_index,
                            error: p.error_code,
                            leader: p.leader_id,
                            leader_epoch: p.leader_epoch,
                            replicas: p.replica_nodes.clone(),
                            isr: p.isr_nodes.clone(),
                            offline_replicas: p.offline_replicas.clone(),
                        })
                        .collect();
                    partitions.sort_by_key(|p| p.id);
                    topics.insert(
                        topic.name.clone(),
                        TopicMetadata {
                            error: topic.error_code,
                            is_internal: topic.is_internal,
                            partitions,
                        },
                    );
                }
                code => {
                    tracing::debug!(topic = %topic.name, error = ?code, "Topic missing from metadata");
                    topics.remove(&topic.name);
                }
            }
        }

        MetadataSnapshot {
            generation: self.generation + 1,
            cluster_id: response.cluster_id.clone(),
            controller_id: response.controller_id,
            brokers,
            topics,
        }
    }
}

// ============================================================================
// Client
// ============================================================================

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.config.client_id)
            .field("closed", &self.closed())
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    config: Arc<Config>,
    seeds: Vec<Arc<Broker>>,
    brokers: DashMap<i32, Arc<Broker>>,
    snapshot: RwLock<Arc<MetadataSnapshot>>,
    coordinators: DashMap<(CoordinatorType, String), i32>,
    refresh_lock: Mutex<()>,
    cancel: CancellationToken,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Validate `config`, connect through `addrs` and load metadata.
    pub async fn new<S: AsRef<str>>(addrs: &[S], config: Config) -> Result<Client> {
        config.check()?;
        if addrs.is_empty() {
            return Err(Error::Config("at least one seed broker is required".to_string()));
        }
        let config = Arc::new(config);
        let mut seeds: Vec<Arc<Broker>> = addrs
            .iter()
            .map(|addr| Arc::new(Broker::new(-1, addr.as_ref(), None, config.clone())))
            .collect();
        seeds.shuffle(&mut rand::thread_rng());

        let client = Client {
            inner: Arc::new(ClientInner {
                config: config.clone(),
                seeds,
                brokers: DashMap::new(),
                snapshot: RwLock::new(Arc::new(MetadataSnapshot::default())),
                coordinators: DashMap::new(),
                refresh_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
                refresher: Mutex::new(None),
            }),
        };

        if config.metadata.full {
            client.refresh_metadata(&[]).await?;
        } else {
            // Only learn the brokers.
            let response = client
                .fetch_metadata(&MetadataRequest::for_topics(Vec::<String>::new()))
                .await?;
            client.apply_metadata(&response, true);
        }

        if let Some(frequency) = config.metadata.refresh_frequency {
            let handle = tokio::spawn(background_refresh(
                Arc::downgrade(&client.inner),
                frequency,
                client.inner.cancel.clone(),
            ));
            *client.inner.refresher.lock().await = Some(handle);
        }

        tracing::info!(
            client_id = %config.client_id,
            brokers = client.inner.brokers.len(),
            "Client connected"
        );
        Ok(client)
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.inner.config
    }

    pub fn closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed() { Err(Error::ClosedClient) } else { Ok(()) }
    }

    /// Stop the refresher and close every broker connection.
    pub async fn close(&self) -> Result<()> {
        self.ensure_open()?;
        self.inner.cancel.cancel();
        if let Some(handle) = self.inner.refresher.lock().await.take() {
            let _ = handle.await;
        }
        let brokers: Vec<Arc<Broker>> = self
            .inner
            .brokers
            .iter()
            .map(|e| e.value().clone())
            .chain(self.inner.seeds.iter().cloned())
            .collect();
        self.inner.brokers.clear();
        self.inner.coordinators.clear();
        for broker in brokers {
            let _ = broker.close().await;
        }
        tracing::info!(client_id = %self.inner.config.client_id, "Client closed");
        Ok(())
    }

    /// The current metadata snapshot.
    pub fn snapshot(&self) -> Arc<MetadataSnapshot> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registered brokers, by id.
    pub fn brokers(&self) -> Vec<Arc<Broker>> {
        let mut brokers: Vec<Arc<Broker>> =
            self.inner.brokers.iter().map(|e| e.value().clone()).collect();
        brokers.sort_by_key(|b| b.id());
        brokers
    }

    pub fn broker(&self, id: i32) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        self.inner
            .brokers
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(Error::Kafka(KafkaCode::BrokerNotAvailable))
    }

    pub fn controller(&self) -> Result<Arc<Broker>> {
        self.broker(self.snapshot().controller_id)
    }

    /// A random registered broker, falling back to a seed.
    pub fn any_broker(&self) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        let brokers = self.brokers();
        brokers
            .choose(&mut rand::thread_rng())
            .cloned()
            .or_else(|| self.inner.seeds.first().cloned())
            .ok_or(Error::OutOfBrokers)
    }

    pub fn topics(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.snapshot().topics.keys().cloned().collect())
    }

    pub async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.lookup(topic, |s| s.partitions(topic)).await
    }

    pub async fn writable_partitions(&self, topic: &str) -> Result<Vec<i32>> {
        self.lookup(topic, |s| s.writable_partitions(topic)).await
    }

    pub async fn replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>> {
        self.lookup(topic, |s| s.partition(topic, partition).map(|p| p.replicas.clone()))
            .await
    }

    pub async fn in_sync_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>> {
        self.lookup(topic, |s| s.partition(topic, partition).map(|p| p.isr.clone()))
            .await
    }

    pub async fn offline_replicas(&self, topic: &str, partition: i32) -> Result<Vec<i32>> {
        self.lookup(topic, |s| {
            s.partition(topic, partition).map(|p| p.offline_replicas.clone())
        })
        .await
    }

    /// Read from the snapshot, refreshing `topic` once on a miss.
    async fn lookup<T>(&self, topic: &str, read: impl Fn(&MetadataSnapshot) -> Option<T>) -> Result<T> {
        self.ensure_open()?;
        if let Some(value) = read(&self.snapshot()) {
            return Ok(value);
        }
        self.refresh_metadata(&[topic]).await?;
        read(&self.snapshot()).ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))
    }

    /// The broker leading `topic`/`partition`.
    pub async fn leader(&self, topic: &str, partition: i32) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        let id = match self.snapshot().leader_id(topic, partition)? {
            Some(id) => id,
            None => {
                self.refresh_metadata(&[topic]).await?;
                self.snapshot()
                    .leader_id(topic, partition)?
                    .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?
            }
        };
        self.broker(id)
            .map_err(|_| Error::Kafka(KafkaCode::LeaderNotAvailable))
    }

    /// Refresh metadata for `topics`; an empty slice refreshes every topic
    /// when `metadata.full` is set and the topics already known otherwise.
    pub async fn refresh_metadata(&self, topics: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.inner.refresh_lock.lock().await;

        let (request, full) = if topics.is_empty() {
            if self.inner.config.metadata.full {
                (MetadataRequest::all_topics(), true)
            } else {
                let known = self.snapshot().topics.keys().cloned().collect::<Vec<_>>();
                (MetadataRequest::for_topics(known), false)
            }
        } else {
            (MetadataRequest::for_topics(topics.iter().copied()), false)
        };
        let request = MetadataRequest {
            allow_auto_topic_creation: self.inner.config.metadata.allow_auto_topic_creation,
            ..request
        };

        let response = self.fetch_metadata(&request).await?;
        self.apply_metadata(&response, full);
        Ok(())
    }

    /// Send `request` to brokers until one answers, retrying with back-off.
    async fn fetch_metadata(&self, request: &MetadataRequest) -> Result<MetadataResponse> {
        let metadata = &self.inner.config.metadata;
        let policy = RetryPolicy::new(metadata.retry_backoff.clone(), metadata.retry_max);
        (|| async { self.try_brokers(request).await })
            .retry(policy)
            .when(|e: &Error| *e == Error::OutOfBrokers)
            .notify(|_, delay| {
                tracing::warn!(
                    delay_ms = delay.as_millis() as u64,
                    "No broker answered metadata request, retrying"
                );
            })
            .await
    }

    async fn try_brokers(&self, request: &MetadataRequest) -> Result<MetadataResponse> {
        self.ensure_open()?;
        let mut candidates = self.brokers();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.extend(self.inner.seeds.iter().cloned());

        for broker in candidates {
            match broker.send(request).await {
                Ok(response) => {
                    tracing::debug!(
                        broker = %broker.addr(),
                        topics = response.topics.len(),
                        brokers = response.brokers.len(),
                        "Fetched metadata"
                    );
                    return Ok(response);
                }
                Err(e) if e.is_connection_error() || e.is_retriable() => {
                    tracing::warn!(broker = %broker.addr(), error = %e, "Metadata request failed");
                    let _ = broker.close().await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::OutOfBrokers)
    }

    fn apply_metadata(&self, response: &MetadataResponse, full: bool) {
        let mut guard = self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let next = guard.apply(response, full);
        self.sync_registry(&next);
        *guard = Arc::new(next);
    }

    /// Make the broker registry match the snapshot.
    fn sync_registry(&self, snapshot: &MetadataSnapshot) {
        let config = &self.inner.config;
        for info in snapshot.brokers.values() {
            let stale = self
                .inner
                .brokers
                .get(&info.id)
                .map(|b| b.addr() != info.addr);
            match stale {
                Some(false) => {}
                Some(true) | None => {
                    let broker = Arc::new(Broker::new(info.id, &info.addr, info.rack.clone(), config.clone()));
                    if let Some(old) = self.inner.brokers.insert(info.id, broker) {
                        tracing::info!(id = info.id, addr = %info.addr, "Broker address changed");
                        tokio::spawn(async move {
                            let _ = old.close().await;
                        });
                    } else {
                        tracing::debug!(id = info.id, addr = %info.addr, "Registered broker");
                    }
                }
            }
        }
        let gone: Vec<i32> = self
            .inner
            .brokers
            .iter()
            .map(|e| *e.key())
            .filter(|id| !snapshot.brokers.contains_key(id))
            .collect();
        for id in gone {
            if let Some((_, old)) = self.inner.brokers.remove(&id) {
                tracing::info!(id, addr = %old.addr(), "Deregistered broker");
                tokio::spawn(async move {
                    let _ = old.close().await;
                });
            }
        }
    }

    /// Current offset at `time`: a timestamp in milliseconds, or
    /// [`OFFSET_NEWEST`](crate::constants::OFFSET_NEWEST) /
    /// [`OFFSET_OLDEST`](crate::constants::OFFSET_OLDEST).
    pub async fn get_offset(&self, topic: &str, partition: i32, time: i64) -> Result<i64> {
        let broker = self.leader(topic, partition).await?;
        let mut request = ListOffsetsRequest::default();
        request.add_partition(topic, partition, time);
        let response = match broker.send(&request).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_connection_error() {
                    let _ = broker.close().await;
                }
                return Err(e);
            }
        };
        let block = response
            .partition(topic, partition)
            .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))?;
        if block.error_code.invalidates_metadata() {
            let _ = self.refresh_metadata(&[topic]).await;
        }
        block.error_code.ok()?;
        block
            .resolved_offset()
            .ok_or_else(|| Error::Decoding("offset response carried no offset".to_string()))
    }

    // ========================================================================
    // Coordinators
    // ========================================================================

    /// The broker coordinating `group`, from cache when possible.
    pub async fn coordinator(&self, group: &str) -> Result<Arc<Broker>> {
        self.cached_coordinator(CoordinatorType::Group, group).await
    }

    /// The broker coordinating transactions for `transactional_id`.
    pub async fn transaction_coordinator(&self, transactional_id: &str) -> Result<Arc<Broker>> {
        self.cached_coordinator(CoordinatorType::Transaction, transactional_id)
            .await
    }

    pub async fn refresh_coordinator(&self, group: &str) -> Result<()> {
        self.find_coordinator(CoordinatorType::Group, group)
            .await
            .map(|_| ())
    }

    pub async fn refresh_transaction_coordinator(&self, transactional_id: &str) -> Result<()> {
        self.find_coordinator(CoordinatorType::Transaction, transactional_id)
            .await
            .map(|_| ())
    }

    async fn cached_coordinator(&self, kind: CoordinatorType, key: &str) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        let cached = self
            .inner
            .coordinators
            .get(&(kind, key.to_string()))
            .map(|id| *id);
        if let Some(id) = cached
            && let Ok(broker) = self.broker(id)
        {
            return Ok(broker);
        }
        self.find_coordinator(kind, key).await
    }

    async fn find_coordinator(&self, kind: CoordinatorType, key: &str) -> Result<Arc<Broker>> {
        self.ensure_open()?;
        self.inner.coordinators.remove(&(kind, key.to_string()));
        let request = FindCoordinatorRequest {
            key: key.to_string(),
            key_type: kind.as_i8(),
        };
        let metadata = &self.inner.config.metadata;
        let policy = RetryPolicy::new(metadata.retry_backoff.clone(), metadata.retry_max);

        let response = (|| async {
            let broker = self.any_broker()?;
            let response = match broker.send(&request).await {
                Ok(response) => response,
                Err(e) => {
                    if e.is_connection_error() {
                        let _ = broker.close().await;
                    }
                    return Err(e);
                }
            };
            response.error_code.ok()?;
            Ok(response)
        })
        .retry(policy)
        .when(|e: &Error| e.is_retriable())
        .notify(|e, delay| {
            tracing::warn!(
                key,
                error = %e,
                delay_ms = delay.as_millis() as u64,
                "Coordinator lookup failed, retrying"
            );
        })
        .await?;

        let broker = match self.inner.brokers.get(&response.node_id) {
            Some(existing) if existing.addr() == response.addr() => existing.value().clone(),
            _ => {
                let broker = Arc::new(Broker::new(
                    response.node_id,
                    response.addr(),
                    None,
                    self.inner.config.clone(),
                ));
                self.inner.brokers.insert(response.node_id, broker.clone());
                broker
            }
        };
        self.inner
            .coordinators
            .insert((kind, key.to_string()), response.node_id);
        tracing::debug!(
            key,
            kind = ?kind,
            coordinator = response.node_id,
            addr = %broker.addr(),
            "Found coordinator"
        );
        Ok(broker)
    }

    // ========================================================================
    // Group introspection
    // ========================================================================

    /// Describe `groups`, asking each group's coordinator.
    pub async fn describe_groups(&self, groups: &[&str]) -> Result<Vec<DescribedGroup>> {
        let mut by_coordinator: BTreeMap<i32, (Arc<Broker>, Vec<String>)> = BTreeMap::new();
        for group in groups {
            let broker = self.coordinator(group).await?;
            by_coordinator
                .entry(broker.id())
                .or_insert_with(|| (broker.clone(), Vec::new()))
                .1
                .push(group.to_string());
        }
        let mut described = Vec::with_capacity(groups.len());
        for (broker, groups) in by_coordinator.into_values() {
            let response = broker.send(&DescribeGroupsRequest { groups }).await?;
            described.extend(response.groups);
        }
        Ok(described)
    }

    /// Every group known to any broker, mapped to its protocol type.
    pub async fn list_groups(&self) -> Result<BTreeMap<String, String>> {
        self.ensure_open()?;
        let mut groups = BTreeMap::new();
        for broker in self.brokers() {
            let response = broker.send(&ListGroupsRequest).await?;
            response.error_code.ok()?;
            groups.extend(response.groups);
        }
        Ok(groups)
    }
}

async fn background_refresh(client: Weak<ClientInner>, frequency: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(frequency);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(inner) = client.upgrade() else {
            break;
        };
        let client = Client { inner };
        if let Err(e) = client.refresh_metadata(&[]).await {
            tracing::warn!(error = %e, "Background metadata refresh failed");
        }
    }
    tracing::debug!("Metadata refresher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::metadata::{MetadataBroker, MetadataPartition, MetadataTopic};

    fn response(leader: i32) -> MetadataResponse {
        MetadataResponse {
            brokers: vec![
                MetadataBroker {
                    node_id: 1,
                    host: "b1".to_string(),
                    port: 9092,
                    rack: None,
                },
                MetadataBroker {
                    node_id: 2,
                    host: "b2".to_string(),
                    port: 9092,
                    rack: Some("r2".to_string()),
                },
            ],
            controller_id: 1,
            topics: vec![MetadataTopic {
                name: "t".to_string(),
                partitions: vec![
                    MetadataPartition {
                        partition_index: 1,
                        leader_id: NO_LEADER,
                        ..Default::default()
                    },
                    MetadataPartition {
                        partition_index: 0,
                        leader_id: leader,
                        replica_nodes: vec![1, 2],
                        isr_nodes: vec![leader],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_snapshot_sorts_partitions_and_resolves_leader() {
        let snapshot = MetadataSnapshot::default().apply(&response(2), true);
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.partitions("t"), Some(vec![0, 1]));
        assert_eq!(snapshot.writable_partitions("t"), Some(vec![0]));
        assert_eq!(snapshot.leader_id("t", 0), Ok(Some(2)));
        assert_eq!(
            snapshot.leader_id("t", 1),
            Err(Error::Kafka(KafkaCode::LeaderNotAvailable))
        );
        assert_eq!(snapshot.leader_id("t", 9), Ok(None));
        assert_eq!(snapshot.brokers[&2].addr, "b2:9092");
        assert_eq!(snapshot.brokers[&2].rack.as_deref(), Some("r2"));
    }

    #[test]
    fn test_snapshot_is_replaced_not_mutated() {
        let first = Arc::new(MetadataSnapshot::default().apply(&response(1), true));
        let held = first.clone();
        let second = first.apply(&response(2), true);
        assert_eq!(held.leader_id("t", 0), Ok(Some(1)));
        assert_eq!(second.leader_id("t", 0), Ok(Some(2)));
        assert_eq!(second.generation, 2);
    }

    #[test]
    fn test_partial_refresh_merges_and_drops_unknown() {
        let base = MetadataSnapshot::default().apply(&response(1), true);
        let mut update = response(1);
        update.topics = vec![
            MetadataTopic {
                name: "other".to_string(),
                partitions: vec![MetadataPartition {
                    partition_index: 0,
                    leader_id: 1,
                    ..Default::default()
                }],
                ..Default::default()
            },
            MetadataTopic {
                name: "t".to_string(),
                error_code: KafkaCode::UnknownTopicOrPartition,
                ..Default::default()
            },
        ];
        let merged = base.apply(&update, false);
        assert!(merged.topics.contains_key("other"));
        assert!(!merged.topics.contains_key("t"));
    }

    #[tokio::test]
    async fn test_new_requires_seed_brokers() {
        let result = Client::new::<&str>(&[], Config::default()).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_seeds_report_out_of_brokers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let mut config = Config::default();
        config.metadata.retry_max = 1;
        config.metadata.retry_backoff = crate::retry::Backoff::Constant(Duration::from_millis(1));
        let result = Client::new(&[addr], config).await;
        assert_eq!(result.unwrap_err(), Error::OutOfBrokers);
    }
}
