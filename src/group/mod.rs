//! Consumer groups.
//!
//! A [`ConsumerGroup`] joins a group through its coordinator, agrees on a
//! partition assignment with the other members and hands each claimed
//! partition to a [`ConsumerGroupHandler`]. One call to
//! [`ConsumerGroup::consume`] covers one generation: it returns after a
//! rebalance or close, and the caller loops to rejoin.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use gregor::group::{ConsumerGroup, ConsumerGroupClaim, ConsumerGroupHandler, ConsumerGroupSession};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ConsumerGroupHandler for Printer {
//!     async fn consume_claim(
//!         &self,
//!         session: &ConsumerGroupSession,
//!         claim: &mut ConsumerGroupClaim,
//!     ) -> gregor::Result<()> {
//!         while let Some(message) = claim.recv().await {
//!             println!("{}/{}@{}", message.topic, message.partition, message.offset);
//!             session.mark_message(&message, "");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> gregor::Result<()> {
//! let group = ConsumerGroup::new(&["localhost:9092"], "printers", Default::default()).await?;
//! let handler = Arc::new(Printer);
//! loop {
//!     match group.consume(&["events"], handler.clone()).await {
//!         Err(gregor::Error::ClosedConsumerGroup) => break,
//!         Err(e) => eprintln!("session failed: {e}"),
//!         Ok(()) => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod assignor;
mod session;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use backon::Retryable;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use assignor::{BalancePlan, BalanceStrategy};
pub use session::{ConsumerGroupClaim, ConsumerGroupHandler, ConsumerGroupSession};

use crate::client::Client;
use crate::config::Config;
use crate::constants::{CONSUMER_PROTOCOL_TYPE, OFFSET_NEWEST, OFFSET_OLDEST};
use crate::consumer::{Consumer, OffsetManager, PartitionConsumer};
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::consumer::{ConsumerGroupMemberAssignment, ConsumerGroupMemberMetadata};
use crate::protocol::groups::{
    HeartbeatRequest, JoinGroupProtocol, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    SyncGroupAssignment, SyncGroupRequest,
};
use crate::retry::RetryPolicy;
use crate::types::{StartOffset, TopicPartition};

// ============================================================================
// GroupState
// ============================================================================

/// Where a member is in the membership protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupState {
    Disconnected,
    FindingCoordinator,
    Joining,
    AwaitingSync,
    Stable,
    Rebalancing,
    Leaving,
    Closed,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupState::Disconnected => "disconnected",
            GroupState::FindingCoordinator => "finding-coordinator",
            GroupState::Joining => "joining",
            GroupState::AwaitingSync => "awaiting-sync",
            GroupState::Stable => "stable",
            GroupState::Rebalancing => "rebalancing",
            GroupState::Leaving => "leaving",
            GroupState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Codes after which joining again cannot help.
fn is_fatal_for_group(code: KafkaCode) -> bool {
    code.is_auth_error()
        || matches!(
            code,
            KafkaCode::InvalidSessionTimeout
                | KafkaCode::InconsistentGroupProtocol
                | KafkaCode::InvalidGroupId
                | KafkaCode::GroupMaxSizeReached
                | KafkaCode::FencedInstanceId
        )
}

/// The outcome of a completed JoinGroup/SyncGroup round.
#[derive(Debug)]
struct Joined {
    generation_id: i32,
    member_id: String,
    assignment: BTreeMap<String, Vec<i32>>,
}

// ============================================================================
// ConsumerGroup
// ============================================================================

struct GroupInner {
    client: Client,
    config: Arc<Config>,
    group_id: String,
    owns_client: bool,
    consumer: Consumer,
    offsets: Arc<OffsetManager>,
    member_id: StdMutex<String>,
    owned: StdMutex<BTreeMap<String, Vec<i32>>>,
    paused: StdMutex<HashSet<TopicPartition>>,
    state: watch::Sender<GroupState>,
    errors: Option<mpsc::Sender<Error>>,
    closed: CancellationToken,
    session_lock: Mutex<()>,
}

pub struct ConsumerGroup {
    inner: Arc<GroupInner>,
    errors: StdMutex<Option<mpsc::Receiver<Error>>>,
}

impl fmt::Debug for ConsumerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerGroup")
            .field("group_id", &self.inner.group_id)
            .field("member_id", &self.member_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConsumerGroup {
    /// Join `group_id` with a client owned by the group.
    pub async fn new<S: AsRef<str>>(addrs: &[S], group_id: &str, config: Config) -> Result<Self> {
        let client = Client::new(addrs, config).await?;
        Self::build(client, group_id, true)
    }

    /// Join through an existing client. Closing the group leaves the client
    /// open.
    pub fn from_client(client: Client, group_id: &str) -> Result<Self> {
        Self::build(client, group_id, false)
    }

    fn build(client: Client, group_id: &str, owns_client: bool) -> Result<Self> {
        if client.closed() {
            return Err(Error::ClosedClient);
        }
        if group_id.is_empty() {
            return Err(Error::Config("consumer group id must not be empty".to_string()));
        }
        let config = client.config().clone();
        let consumer = Consumer::from_client(client.clone())?;
        let offsets = Arc::new(OffsetManager::new(client.clone(), group_id)?);
        let (errors_tx, errors_rx) = if config.consumer.return_errors {
            let (tx, rx) = mpsc::channel(config.channel_buffer_size.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        Ok(Self {
            inner: Arc::new(GroupInner {
                client,
                config,
                group_id: group_id.to_string(),
                owns_client,
                consumer,
                offsets,
                member_id: StdMutex::new(String::new()),
                owned: StdMutex::new(BTreeMap::new()),
                paused: StdMutex::new(HashSet::new()),
                state: watch::Sender::new(GroupState::Disconnected),
                errors: errors_tx,
                closed: CancellationToken::new(),
                session_lock: Mutex::new(()),
            }),
            errors: StdMutex::new(errors_rx),
        })
    }

    pub fn group_id(&self) -> &str {
        &self.inner.group_id
    }

    /// Member id granted by the coordinator, empty before the first join.
    pub fn member_id(&self) -> String {
        self.inner.member_id()
    }

    pub fn state(&self) -> GroupState {
        *self.inner.state.borrow()
    }

    /// Follow state transitions.
    pub fn watch_state(&self) -> watch::Receiver<GroupState> {
        self.inner.state.subscribe()
    }

    /// The errors channel. Available once, and only with
    /// `consumer.return_errors`.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<Error>> {
        self.errors.lock().ok()?.take()
    }

    /// Join the group, consume the assigned partitions of `topics` until the
    /// next rebalance or close, and clean up.
    pub async fn consume(&self, topics: &[&str], handler: Arc<dyn ConsumerGroupHandler>) -> Result<()> {
        if topics.is_empty() {
            return Err(Error::Config("no topics to consume".to_string()));
        }
        if self.inner.closed.is_cancelled() {
            return Err(Error::ClosedConsumerGroup);
        }
        let _session = self.inner.session_lock.lock().await;
        if self.inner.closed.is_cancelled() {
            return Err(Error::ClosedConsumerGroup);
        }

        self.inner.client.refresh_metadata(topics).await?;
        let mut topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        topics.sort();
        topics.dedup();

        let joined = tokio::select! {
            _ = self.inner.closed.cancelled() => return Err(Error::ClosedConsumerGroup),
            joined = self.inner.join(&topics) => joined,
        };
        let joined = match joined {
            Ok(joined) => joined,
            Err(e) => {
                self.inner.set_state(GroupState::Disconnected);
                return Err(e);
            }
        };
        self.inner.clone().run_session(joined, handler).await
    }

    /// Pause fetching a partition, now and in later sessions.
    pub fn pause(&self, topic: &str, partition: i32) {
        if let Ok(mut paused) = self.inner.paused.lock() {
            paused.insert(TopicPartition::new(topic, partition));
        }
        self.inner.consumer.pause(topic, partition);
    }

    pub fn resume(&self, topic: &str, partition: i32) {
        if let Ok(mut paused) = self.inner.paused.lock() {
            paused.remove(&TopicPartition::new(topic, partition));
        }
        self.inner.consumer.resume(topic, partition);
    }

    pub fn pause_all(&self) {
        let owned = self.inner.owned.lock().map(|o| o.clone()).unwrap_or_default();
        if let Ok(mut paused) = self.inner.paused.lock() {
            for (topic, partitions) in owned {
                for partition in partitions {
                    paused.insert(TopicPartition::new(topic.clone(), partition));
                }
            }
        }
        self.inner.consumer.pause_all();
    }

    pub fn resume_all(&self) {
        if let Ok(mut paused) = self.inner.paused.lock() {
            paused.clear();
        }
        self.inner.consumer.resume_all();
    }

    /// End the current session, leave the group and commit marked offsets.
    /// Static members do not send LeaveGroup, so the coordinator keeps their
    /// assignment until the session timeout.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.is_cancelled() {
            return Err(Error::ClosedConsumerGroup);
        }
        self.inner.closed.cancel();
        let _session = self.inner.session_lock.lock().await;

        self.inner.set_state(GroupState::Leaving);
        let mut first_error = None;
        if self.inner.config.consumer.group.instance_id.is_none()
            && let Err(e) = self.inner.leave().await
        {
            tracing::debug!(group = %self.inner.group_id, error = %e, "LeaveGroup failed");
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.inner.offsets.close().await {
            first_error.get_or_insert(e);
        }
        if self.inner.owns_client
            && let Err(e) = self.inner.client.close().await
        {
            first_error.get_or_insert(e);
        }
        self.inner.set_state(GroupState::Closed);
        tracing::info!(group = %self.inner.group_id, "Consumer group closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl GroupInner {
    fn member_id(&self) -> String {
        self.member_id.lock().map(|m| m.clone()).unwrap_or_default()
    }

    fn set_member_id(&self, member_id: &str) {
        if let Ok(mut current) = self.member_id.lock() {
            *current = member_id.to_string();
        }
    }

    fn set_state(&self, state: GroupState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(group = %self.group_id, from = %previous, to = %state, "Group state changed");
        }
    }

    fn report(&self, error: Error) {
        match &self.errors {
            Some(errors) => {
                if errors.try_send(error).is_err() {
                    tracing::debug!(group = %self.group_id, "Group errors channel full, dropping error");
                }
            }
            None => tracing::warn!(group = %self.group_id, error = %error, "Consumer group error"),
        }
    }

    // ========================================================================
    // Joining
    // ========================================================================

    /// Find the coordinator, join and sync, retrying retriable failures up
    /// to `rebalance.retry_max` times with the rebalance back-off.
    async fn join(&self, topics: &[String]) -> Result<Joined> {
        let rebalance = &self.config.consumer.group.rebalance;
        let policy = RetryPolicy::new(rebalance.retry_backoff.clone(), rebalance.retry_max);
        (|| async { self.join_once(topics).await })
            .retry(policy)
            .when(|r: &Retry| matches!(r, Retry::After(_)))
            .notify(|r, delay| {
                tracing::debug!(group = %self.group_id, error = %r.error(), delay_ms = delay.as_millis() as u64, "Joining group failed, retrying");
            })
            .await
            .map_err(Retry::into_error)
    }

    async fn join_once(&self, topics: &[String]) -> std::result::Result<Joined, Retry> {
        let group = &self.config.consumer.group;

        self.set_state(GroupState::FindingCoordinator);
        let coordinator = self.client.coordinator(&self.group_id).await.map_err(Retry::from_error)?;

        self.set_state(GroupState::Joining);
        let mut metadata = ConsumerGroupMemberMetadata::new(topics.to_vec(), group.member_user_data.clone());
        metadata.version = 1;
        metadata.owned_partitions = self.owned.lock().map(|o| o.clone()).unwrap_or_default();
        let protocols = vec![JoinGroupProtocol {
            name: group.rebalance.strategy.name().to_string(),
            metadata: metadata.encode().map_err(Retry::Fatal)?,
        }];

        // A broker that hands out member ids answers the first join with
        // MemberIdRequired; the second join with that id is part of the same
        // attempt.
        let mut id_assigned = false;
        let response = loop {
            let request = JoinGroupRequest {
                group_id: self.group_id.clone(),
                session_timeout_ms: group.session_timeout.as_millis() as i32,
                rebalance_timeout_ms: group.rebalance.timeout.as_millis() as i32,
                member_id: self.member_id(),
                group_instance_id: group.instance_id.clone(),
                protocol_type: CONSUMER_PROTOCOL_TYPE.to_string(),
                protocols: protocols.clone(),
            };
            let response = match coordinator.send_with_wait(&request, group.rebalance.timeout).await {
                Ok(response) => response,
                Err(e) => {
                    if e.is_connection_error() {
                        let _ = coordinator.close().await;
                    }
                    let _ = self.client.refresh_coordinator(&self.group_id).await;
                    return Err(Retry::from_error(e));
                }
            };
            match response.error_code {
                KafkaCode::None => break response,
                KafkaCode::MemberIdRequired if !id_assigned => {
                    id_assigned = true;
                    self.set_member_id(&response.member_id);
                }
                KafkaCode::UnknownMemberId => {
                    self.set_member_id("");
                    return Err(Retry::After(Error::Kafka(KafkaCode::UnknownMemberId)));
                }
                code => return Err(self.classify(code).await),
            }
        };
        self.set_member_id(&response.member_id);
        tracing::info!(
            group = %self.group_id,
            member = %response.member_id,
            generation = response.generation_id,
            leader = response.is_leader(),
            "Joined group"
        );

        let assignments = if response.is_leader() {
            self.assign(&response).await.map_err(Retry::from_error)?
        } else {
            Vec::new()
        };

        self.set_state(GroupState::AwaitingSync);
        let request = SyncGroupRequest {
            group_id: self.group_id.clone(),
            generation_id: response.generation_id,
            member_id: response.member_id.clone(),
            group_instance_id: group.instance_id.clone(),
            assignments,
        };
        let sync = match coordinator.send_with_wait(&request, group.rebalance.timeout).await {
            Ok(sync) => sync,
            Err(e) => {
                if e.is_connection_error() {
                    let _ = coordinator.close().await;
                }
                return Err(Retry::from_error(e));
            }
        };
        match sync.error_code {
            KafkaCode::None => {}
            code @ (KafkaCode::RebalanceInProgress | KafkaCode::IllegalGeneration) => {
                return Err(Retry::After(Error::Kafka(code)));
            }
            KafkaCode::UnknownMemberId => {
                self.set_member_id("");
                return Err(Retry::After(Error::Kafka(KafkaCode::UnknownMemberId)));
            }
            code => return Err(self.classify(code).await),
        }

        let assignment = if sync.assignment.is_empty() {
            BTreeMap::new()
        } else {
            ConsumerGroupMemberAssignment::decode(&sync.assignment)
                .map_err(Retry::Fatal)?
                .topics
        };
        Ok(Joined {
            generation_id: response.generation_id,
            member_id: response.member_id,
            assignment,
        })
    }

    async fn classify(&self, code: KafkaCode) -> Retry {
        if is_fatal_for_group(code) {
            return Retry::Fatal(Error::Kafka(code));
        }
        if code.invalidates_coordinator() || code == KafkaCode::CoordinatorLoadInProgress {
            let _ = self.client.refresh_coordinator(&self.group_id).await;
        }
        if code.is_retriable() {
            Retry::After(Error::Kafka(code))
        } else {
            Retry::Fatal(Error::Kafka(code))
        }
    }

    /// Run the configured strategy over the roster the leader received.
    async fn assign(&self, response: &JoinGroupResponse) -> Result<Vec<SyncGroupAssignment>> {
        let strategy = &self.config.consumer.group.rebalance.strategy;
        if response.protocol_name != strategy.name() {
            return Err(Error::Kafka(KafkaCode::InconsistentGroupProtocol));
        }

        let mut members = BTreeMap::new();
        for member in &response.members {
            members.insert(
                member.member_id.clone(),
                ConsumerGroupMemberMetadata::decode(&member.metadata)?,
            );
        }
        let subscribed: BTreeSet<String> = members
            .values()
            .flat_map(|m| m.topics.iter().cloned())
            .collect();
        let names: Vec<&str> = subscribed.iter().map(String::as_str).collect();
        self.client.refresh_metadata(&names).await?;

        let mut topics = BTreeMap::new();
        for topic in &subscribed {
            match self.client.partitions(topic).await {
                Ok(partitions) => {
                    topics.insert(topic.clone(), partitions);
                }
                Err(e) => {
                    tracing::warn!(group = %self.group_id, topic = %topic, error = %e, "Subscribed topic has no metadata, not assigning it");
                }
            }
        }

        let plan = strategy.plan(&members, &topics)?;
        assignor::validate_plan(&plan, &members, &topics)?;
        tracing::debug!(group = %self.group_id, strategy = strategy.name(), members = members.len(), "Computed group assignment");

        let mut assignments = Vec::with_capacity(members.len());
        for member_id in members.keys() {
            let topics = plan.get(member_id).cloned().unwrap_or_default();
            assignments.push(SyncGroupAssignment {
                member_id: member_id.clone(),
                assignment: ConsumerGroupMemberAssignment::new(topics).encode()?,
            });
        }
        Ok(assignments)
    }

    async fn leave(&self) -> Result<()> {
        let member_id = self.member_id();
        if member_id.is_empty() {
            return Ok(());
        }
        let coordinator = self.client.coordinator(&self.group_id).await?;
        let response = coordinator
            .send(&LeaveGroupRequest {
                group_id: self.group_id.clone(),
                member_id,
            })
            .await?;
        self.set_member_id("");
        match response.error_code {
            KafkaCode::None | KafkaCode::UnknownMemberId => Ok(()),
            code => Err(Error::Kafka(code)),
        }
    }

    // ========================================================================
    // Session
    // ========================================================================

    async fn run_session(self: Arc<Self>, joined: Joined, handler: Arc<dyn ConsumerGroupHandler>) -> Result<()> {
        let group = &self.config.consumer.group;
        self.offsets
            .set_generation(joined.generation_id, &joined.member_id, group.instance_id.as_deref());

        let mut offsets = HashMap::new();
        for (topic, partitions) in &joined.assignment {
            for &partition in partitions {
                match self.offsets.manage_partition(topic, partition).await {
                    Ok(pom) => {
                        offsets.insert(TopicPartition::new(topic.clone(), partition), pom);
                    }
                    Err(e) => {
                        for (_, pom) in offsets {
                            let _ = pom.close().await;
                        }
                        self.set_state(GroupState::Rebalancing);
                        return Err(e);
                    }
                }
            }
        }
        if let Ok(mut owned) = self.owned.lock() {
            *owned = joined.assignment.clone();
        }

        let cancel = self.closed.child_token();
        let session = Arc::new(ConsumerGroupSession::new(
            joined.member_id.clone(),
            joined.generation_id,
            joined.assignment.clone(),
            offsets,
            self.offsets.clone(),
            cancel.clone(),
        ));
        self.set_state(GroupState::Stable);

        if let Err(e) = handler.setup(&session).await {
            session.end();
            self.release(&session).await;
            self.set_state(GroupState::Rebalancing);
            return Err(e);
        }

        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(
            joined.generation_id,
            joined.member_id.clone(),
            cancel.clone(),
        ));

        let mut claims = JoinSet::new();
        for (topic, partitions) in &joined.assignment {
            for &partition in partitions {
                let (initial, consumer) = match self.start_claim(&session, topic, partition).await {
                    Ok(started) => started,
                    Err(e) => {
                        self.report(e);
                        continue;
                    }
                };
                let claim = ConsumerGroupClaim::new(initial, consumer, cancel.clone());
                let handler = handler.clone();
                let session = session.clone();
                let inner = self.clone();
                claims.spawn(async move {
                    let mut claim = claim;
                    if let Err(e) = handler.consume_claim(&session, &mut claim).await {
                        inner.report(e);
                    }
                    if let Err(errors) = claim.into_consumer().close().await {
                        for error in errors {
                            inner.report(error.error);
                        }
                    }
                });
            }
        }

        // The session ends when every claim has returned, on rebalance, or on close.
        if claims.is_empty() {
            cancel.cancelled().await;
        } else {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = claims.join_next() => {
                        if next.is_none() {
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }
        while claims.join_next().await.is_some() {}
        let _ = heartbeat.await;

        if !self.closed.is_cancelled() {
            self.set_state(GroupState::Rebalancing);
        }
        let cleanup = handler.cleanup(&session).await;
        self.release(&session).await;
        tracing::info!(group = %self.group_id, generation = joined.generation_id, "Group session ended");
        cleanup
    }

    /// Commit and release the session's offsets.
    async fn release(&self, session: &ConsumerGroupSession) {
        if let Err(e) = self.offsets.commit().await {
            self.report(e);
        }
        for pom in session.take_offsets() {
            if let Err(e) = pom.close().await {
                tracing::debug!(group = %self.group_id, error = %e, "Releasing partition offsets failed");
            }
        }
    }

    async fn start_claim(
        &self,
        session: &ConsumerGroupSession,
        topic: &str,
        partition: i32,
    ) -> Result<(i64, PartitionConsumer)> {
        let next = session
            .next_offset(topic, partition)
            .unwrap_or(OFFSET_NEWEST);
        let start = match next {
            OFFSET_NEWEST => StartOffset::Newest,
            OFFSET_OLDEST => StartOffset::Oldest,
            offset => StartOffset::At(offset),
        };
        let mut consumer = match self.consumer.consume_partition(topic, partition, start).await {
            Err(Error::Kafka(KafkaCode::OffsetOutOfRange)) => {
                let initial = self.config.consumer.offsets.initial;
                tracing::warn!(group = %self.group_id, topic, partition, offset = next, "Committed offset out of range, starting from the initial offset");
                self.consumer.consume_partition(topic, partition, initial).await?
            }
            other => other?,
        };
        let paused = self
            .paused
            .lock()
            .map(|p| p.contains(&TopicPartition::new(topic, partition)))
            .unwrap_or(false);
        if paused {
            consumer.pause();
        }
        if let Some(mut errors) = consumer.take_errors() {
            let sink = self.errors.clone();
            let group_id = self.group_id.clone();
            tokio::spawn(async move {
                while let Some(error) = errors.recv().await {
                    match &sink {
                        Some(sink) => {
                            let _ = sink.send(error.error).await;
                        }
                        None => tracing::warn!(group = %group_id, error = %error, "Partition consumer error"),
                    }
                }
            });
        }
        Ok((next, consumer))
    }

    // ========================================================================
    // Heartbeats
    // ========================================================================

    /// Heartbeat until the session is cancelled, the coordinator ends the
    /// generation, or no heartbeat has succeeded for a whole session timeout.
    /// The session deadline bounds every send, so a coordinator that stops
    /// answering cannot keep the member alive past it.
    async fn heartbeat_loop(self: Arc<Self>, generation_id: i32, member_id: String, cancel: CancellationToken) {
        let group = &self.config.consumer.group;
        let mut ticker = tokio::time::interval(group.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_ok = Instant::now();

        loop {
            let deadline = last_ok + group.session_timeout;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
                _ = ticker.tick() => {}
            }
            let request = HeartbeatRequest {
                group_id: self.group_id.clone(),
                generation_id,
                member_id: member_id.clone(),
                group_instance_id: group.instance_id.clone(),
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => Err(Error::RequestTimeout),
                sent = self.send_heartbeat(&request) => sent,
            };

            match result {
                Ok(()) => last_ok = Instant::now(),
                Err(Error::Kafka(KafkaCode::RebalanceInProgress)) => {
                    tracing::info!(group = %self.group_id, generation = generation_id, "Group is rebalancing");
                    cancel.cancel();
                    return;
                }
                Err(Error::Kafka(code @ (KafkaCode::UnknownMemberId | KafkaCode::IllegalGeneration | KafkaCode::FencedInstanceId))) => {
                    tracing::info!(group = %self.group_id, error = ?code, "Group session is no longer valid");
                    if code == KafkaCode::UnknownMemberId {
                        self.set_member_id("");
                    }
                    if code == KafkaCode::FencedInstanceId {
                        self.report(Error::Kafka(code));
                    }
                    cancel.cancel();
                    return;
                }
                Err(e) => {
                    if let Some(code) = e.kafka_code()
                        && code.invalidates_coordinator()
                    {
                        let _ = self.client.refresh_coordinator(&self.group_id).await;
                    }
                    if Instant::now() >= deadline {
                        tracing::warn!(group = %self.group_id, error = %e, timeout_ms = group.session_timeout.as_millis() as u64, "No successful heartbeat within the session timeout, assuming eviction");
                        if group.instance_id.is_none() {
                            self.set_member_id("");
                        }
                        self.report(e);
                        cancel.cancel();
                        return;
                    }
                    tracing::debug!(group = %self.group_id, error = %e, "Heartbeat failed");
                }
            }
        }
    }

    async fn send_heartbeat(&self, request: &HeartbeatRequest) -> Result<()> {
        let coordinator = self.client.coordinator(&self.group_id).await?;
        let sent = coordinator.send(request).await;
        if let Err(e) = &sent
            && e.is_connection_error()
        {
            let _ = coordinator.close().await;
        }
        sent.and_then(|r| r.error_code.ok())
    }
}

/// How [`GroupInner::join_once`] failed.
#[derive(Debug)]
enum Retry {
    /// Join again after the rebalance back-off.
    After(Error),
    Fatal(Error),
}

impl Retry {
    fn from_error(e: Error) -> Self {
        if e.is_retriable() {
            Retry::After(e)
        } else {
            Retry::Fatal(e)
        }
    }

    fn error(&self) -> &Error {
        match self {
            Retry::After(e) | Retry::Fatal(e) => e,
        }
    }

    fn into_error(self) -> Error {
        match self {
            Retry::After(e) | Retry::Fatal(e) => e,
        }
    }
}

impl Drop for ConsumerGroup {
    fn drop(&mut self) {
        self.inner.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_state_display() {
        assert_eq!(GroupState::FindingCoordinator.to_string(), "finding-coordinator");
        assert_eq!(GroupState::AwaitingSync.to_string(), "awaiting-sync");
    }

    #[test]
    fn test_fatal_group_codes() {
        assert!(is_fatal_for_group(KafkaCode::InvalidSessionTimeout));
        assert!(is_fatal_for_group(KafkaCode::InconsistentGroupProtocol));
        assert!(is_fatal_for_group(KafkaCode::GroupAuthorizationFailed));
        assert!(!is_fatal_for_group(KafkaCode::NotCoordinator));
        assert!(!is_fatal_for_group(KafkaCode::RebalanceInProgress));
    }

    #[test]
    fn test_retry_from_error() {
        assert!(matches!(
            Retry::from_error(Error::Kafka(KafkaCode::CoordinatorNotAvailable)),
            Retry::After(_)
        ));
        assert!(matches!(Retry::from_error(Error::Config("x".into())), Retry::Fatal(_)));
    }
}
