//! In-memory cluster model behind the mock brokers.
//!
//! Everything here is synchronous and runs under one lock. Handlers that have
//! to wait (parked group joins, long-polling fetches) take what they need
//! from the model and wait outside it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};

use crate::constants::RECORD_BATCH_LOG_OVERHEAD;
use crate::error::{KafkaCode, Result};
use crate::protocol::fetch::{AbortedTransaction, FetchPartitionResponse, FetchRequest, FetchResponse};
use crate::protocol::groups::{
    DescribeGroupsRequest, DescribeGroupsResponse, DescribedGroup, FindCoordinatorRequest,
    FindCoordinatorResponse, ListGroupsResponse,
};
use crate::protocol::list_offsets::{ListOffsetsPartitionResponse, ListOffsetsRequest, ListOffsetsResponse};
use crate::protocol::metadata::{
    MetadataBroker, MetadataPartition, MetadataRequest, MetadataResponse, MetadataTopic,
};
use crate::protocol::offsets::{
    OffsetCommitRequest, OffsetCommitResponse, OffsetFetchPartitionResponse, OffsetFetchRequest,
    OffsetFetchResponse,
};
use crate::protocol::produce::{ProducePartitionResponse, ProduceRequest, ProduceResponse};
use crate::protocol::records::{
    Compression, ControlRecordType, CrcValidationResult, Record, RecordBatch, decode_message_entry,
    encode_message_set, parse_producer_info, patch_base_offset, peek_magic, validate_batch_crc,
};
use crate::protocol::txn::{
    AddOffsetsToTxnRequest, AddPartitionsToTxnRequest, AddPartitionsToTxnResponse, EndTxnRequest,
    InitProducerIdRequest, InitProducerIdResponse, TxnErrorResponse, TxnOffsetCommitRequest,
    TxnOffsetCommitResponse,
};

use super::group::Group;

/// Batches remembered per producer for duplicate detection.
const PRODUCER_BATCH_CACHE: usize = 5;

const FIRST_PRODUCER_ID: i64 = 1000;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// ============================================================================
// Partition logs
// ============================================================================

#[derive(Debug, Clone)]
struct LogEntry {
    base_offset: i64,
    last_offset: i64,
    max_timestamp: i64,
    bytes: Bytes,
}

#[derive(Debug, Default)]
struct ProducerSequences {
    epoch: i16,
    /// (first sequence, last sequence, base offset), oldest first.
    batches: VecDeque<(i32, i32, i64)>,
}

#[derive(Debug)]
pub(crate) struct PartitionLog {
    leader: i32,
    entries: Vec<LogEntry>,
    next_offset: i64,
    producers: HashMap<i64, ProducerSequences>,
    /// First offset of every open transaction, by producer id.
    open_txns: HashMap<i64, i64>,
    aborted: Vec<AbortedTransaction>,
}

impl PartitionLog {
    fn new(leader: i32) -> Self {
        Self {
            leader,
            entries: Vec::new(),
            next_offset: 0,
            producers: HashMap::new(),
            open_txns: HashMap::new(),
            aborted: Vec::new(),
        }
    }

    pub(crate) fn leader(&self) -> i32 {
        self.leader
    }

    pub(crate) fn high_water_mark(&self) -> i64 {
        self.next_offset
    }

    fn last_stable_offset(&self) -> i64 {
        self.open_txns
            .values()
            .copied()
            .min()
            .unwrap_or(self.next_offset)
    }

    /// Raw bytes of every stored entry, in offset order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = &Bytes> {
        self.entries.iter().map(|e| &e.bytes)
    }

    fn push(&mut self, mut entry: BytesMut, count: i64, max_timestamp: i64) -> i64 {
        let base_offset = self.next_offset;
        patch_base_offset(&mut entry, base_offset);
        self.entries.push(LogEntry {
            base_offset,
            last_offset: base_offset + count - 1,
            max_timestamp,
            bytes: entry.freeze(),
        });
        self.next_offset += count;
        base_offset
    }

    /// Append one produced entry, enforcing idempotent sequencing.
    fn append(&mut self, entry: &Bytes) -> std::result::Result<i64, (KafkaCode, i64)> {
        match peek_magic(entry) {
            Some(2) => {}
            Some(0) | Some(1) => return self.append_legacy(entry),
            _ => return Err((KafkaCode::CorruptMessage, -1)),
        }
        if let CrcValidationResult::Invalid { .. } | CrcValidationResult::TooSmall = validate_batch_crc(entry) {
            return Err((KafkaCode::CorruptMessage, -1));
        }
        let info = parse_producer_info(entry).ok_or((KafkaCode::CorruptMessage, -1))?;
        let batch = RecordBatch::decode(entry).map_err(|_| (KafkaCode::CorruptMessage, -1))?;
        let count = i64::from(info.record_count.max(1));

        if info.is_idempotent() {
            let producer = self.producers.entry(info.producer_id).or_default();
            if info.producer_epoch < producer.epoch {
                return Err((KafkaCode::InvalidProducerEpoch, -1));
            }
            if info.producer_epoch > producer.epoch {
                producer.epoch = info.producer_epoch;
                producer.batches.clear();
            }
            let last_sequence = info.last_sequence().unwrap_or(info.first_sequence);
            if let Some((_, _, base)) = producer
                .batches
                .iter()
                .find(|(first, last, _)| *first == info.first_sequence && *last == last_sequence)
            {
                return Err((KafkaCode::DuplicateSequenceNumber, *base));
            }
            let expected = producer
                .batches
                .back()
                .map(|(_, last, _)| last.wrapping_add(1))
                .unwrap_or(0);
            if info.first_sequence != expected {
                return Err((KafkaCode::OutOfOrderSequenceNumber, -1));
            }
        }

        let base_offset = self.push(BytesMut::from(entry.as_ref()), count, batch.max_timestamp);
        if info.is_idempotent() {
            let producer = self.producers.entry(info.producer_id).or_default();
            let last_sequence = info.last_sequence().unwrap_or(info.first_sequence);
            producer.batches.push_back((info.first_sequence, last_sequence, base_offset));
            while producer.batches.len() > PRODUCER_BATCH_CACHE {
                producer.batches.pop_front();
            }
        }
        if batch.is_transactional {
            self.open_txns.entry(info.producer_id).or_insert(base_offset);
        }
        Ok(base_offset)
    }

    fn append_legacy(&mut self, entry: &Bytes) -> std::result::Result<i64, (KafkaCode, i64)> {
        let mut blocks = decode_message_entry(entry).map_err(|_| (KafkaCode::CorruptMessage, -1))?;
        let base_offset = self.next_offset;
        for (i, block) in blocks.iter_mut().enumerate() {
            block.offset = base_offset + i as i64;
        }
        let max_timestamp = blocks
            .iter()
            .filter_map(|b| b.message.timestamp)
            .max()
            .unwrap_or(-1);
        let count = blocks.len() as i64;
        let bytes = encode_message_set(&blocks, Compression::None, None)
            .map_err(|_| (KafkaCode::CorruptMessage, -1))?;
        self.entries.push(LogEntry {
            base_offset,
            last_offset: base_offset + count - 1,
            max_timestamp,
            bytes,
        });
        self.next_offset += count;
        Ok(base_offset)
    }

    fn write_marker(&mut self, producer_id: i64, producer_epoch: i16, commit: bool) -> Result<()> {
        let now = now_ms();
        let kind = if commit {
            ControlRecordType::Commit
        } else {
            ControlRecordType::Abort
        };
        let batch = RecordBatch {
            is_transactional: true,
            is_control: true,
            first_timestamp: now,
            max_timestamp: now,
            producer_id,
            producer_epoch,
            first_sequence: -1,
            records: vec![Record {
                key: Some(kind.key()),
                // version 0, coordinator epoch 0
                value: Some(Bytes::from_static(&[0, 0, 0, 0, 0, 0])),
                ..Default::default()
            }],
            ..Default::default()
        }
        .encode(None)?;
        let first_offset = self.open_txns.remove(&producer_id);
        self.push(BytesMut::from(batch.as_ref()), 1, now);
        if !commit && let Some(first_offset) = first_offset {
            self.aborted.push(AbortedTransaction {
                producer_id,
                first_offset,
            });
        }
        Ok(())
    }

    fn offset_for_time(&self, timestamp: i64) -> i64 {
        match timestamp {
            -1 => self.next_offset,
            -2 => 0,
            ts => self
                .entries
                .iter()
                .find(|e| e.max_timestamp >= ts)
                .map(|e| e.base_offset)
                .unwrap_or(self.next_offset),
        }
    }

    /// Entries holding `offset` and later, cut at `max_bytes`.
    fn read(&self, offset: i64, upper: i64, max_bytes: usize) -> Bytes {
        let mut out = BytesMut::new();
        for entry in self
            .entries
            .iter()
            .filter(|e| e.last_offset >= offset && e.base_offset < upper)
        {
            if out.len() >= max_bytes {
                break;
            }
            out.extend_from_slice(&entry.bytes);
        }
        out.truncate(max_bytes);
        out.freeze()
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug)]
struct TxnEntry {
    producer_id: i64,
    epoch: i16,
    partitions: BTreeSet<(String, i32)>,
    /// (group, topic, partition) → (offset, metadata)
    pending_offsets: BTreeMap<(String, String, i32), (i64, Option<String>)>,
}

// ============================================================================
// Cluster
// ============================================================================

/// Fault injection knobs, consumed as they fire.
#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub(crate) produce_errors: HashMap<(String, i32), VecDeque<KafkaCode>>,
    pub(crate) drop_produce_responses: usize,
    pub(crate) join_errors: VecDeque<KafkaCode>,
    /// Heartbeats are read but never answered, and the connection they
    /// arrived on goes silent.
    pub(crate) stall_heartbeats: bool,
}

pub(crate) struct ClusterState {
    pub(crate) brokers: BTreeMap<i32, (String, i32)>,
    pub(crate) topics: BTreeMap<String, Vec<PartitionLog>>,
    pub(crate) groups: BTreeMap<String, Group>,
    /// (group, topic, partition) → (offset, metadata)
    pub(crate) committed: BTreeMap<(String, String, i32), (i64, Option<String>)>,
    pub(crate) max_message_bytes: usize,
    pub(crate) faults: Faults,
    txns: HashMap<String, TxnEntry>,
    next_producer_id: i64,
}

impl ClusterState {
    pub(crate) fn new(brokers: BTreeMap<i32, (String, i32)>, max_message_bytes: usize) -> Self {
        Self {
            brokers,
            topics: BTreeMap::new(),
            groups: BTreeMap::new(),
            committed: BTreeMap::new(),
            max_message_bytes,
            faults: Faults::default(),
            txns: HashMap::new(),
            next_producer_id: FIRST_PRODUCER_ID,
        }
    }

    /// Create `topic`, spreading leadership round-robin over the brokers.
    pub(crate) fn create_topic(&mut self, topic: &str, partitions: i32) {
        let ids: Vec<i32> = self.brokers.keys().copied().collect();
        let logs = (0..partitions.max(0) as usize)
            .map(|p| PartitionLog::new(ids.get(p % ids.len().max(1)).copied().unwrap_or(-1)))
            .collect();
        self.topics.insert(topic.to_string(), logs);
    }

    pub(crate) fn partition(&self, topic: &str, partition: i32) -> Option<&PartitionLog> {
        self.topics.get(topic)?.get(usize::try_from(partition).ok()?)
    }

    fn partition_mut(&mut self, topic: &str, partition: i32) -> Option<&mut PartitionLog> {
        self.topics.get_mut(topic)?.get_mut(usize::try_from(partition).ok()?)
    }

    pub(crate) fn set_leader(&mut self, topic: &str, partition: i32, broker: i32) -> bool {
        match self.partition_mut(topic, partition) {
            Some(log) => {
                log.leader = broker;
                true
            }
            None => false,
        }
    }

    /// The broker coordinating every group and transactional id.
    pub(crate) fn coordinator(&self) -> i32 {
        self.brokers.keys().next().copied().unwrap_or(-1)
    }

    /// Check a partition request against leadership on `broker`.
    fn leader_check(&self, broker: i32, topic: &str, partition: i32) -> KafkaCode {
        match self.partition(topic, partition) {
            None => KafkaCode::UnknownTopicOrPartition,
            Some(log) if log.leader != broker => KafkaCode::NotLeaderForPartition,
            Some(_) => KafkaCode::None,
        }
    }

    // ========================================================================
    // Metadata
    // ========================================================================

    pub(crate) fn metadata(&self, request: &MetadataRequest, version: i16) -> MetadataResponse {
        let replicas: Vec<i32> = self.brokers.keys().copied().collect();
        let names: Vec<String> = match &request.topics {
            None => self.topics.keys().cloned().collect(),
            Some(t) if t.is_empty() && version == 0 => self.topics.keys().cloned().collect(),
            Some(t) => t.clone(),
        };
        let topics = names
            .into_iter()
            .map(|name| match self.topics.get(&name) {
                None => MetadataTopic {
                    error_code: KafkaCode::UnknownTopicOrPartition,
                    name,
                    ..Default::default()
                },
                Some(logs) => MetadataTopic {
                    error_code: KafkaCode::None,
                    name,
                    is_internal: false,
                    partitions: logs
                        .iter()
                        .enumerate()
                        .map(|(i, log)| MetadataPartition {
                            partition_index: i as i32,
                            leader_id: log.leader,
                            leader_epoch: 0,
                            replica_nodes: replicas.clone(),
                            isr_nodes: replicas.clone(),
                            ..Default::default()
                        })
                        .collect(),
                },
            })
            .collect();
        MetadataResponse {
            brokers: self
                .brokers
                .iter()
                .map(|(id, (host, port))| MetadataBroker {
                    node_id: *id,
                    host: host.clone(),
                    port: *port,
                    rack: None,
                })
                .collect(),
            cluster_id: Some("gregor-mock".to_string()),
            controller_id: self.coordinator(),
            topics,
            ..Default::default()
        }
    }

    pub(crate) fn find_coordinator(&self, _request: &FindCoordinatorRequest) -> FindCoordinatorResponse {
        let id = self.coordinator();
        match self.brokers.get(&id) {
            Some((host, port)) => FindCoordinatorResponse {
                node_id: id,
                host: host.clone(),
                port: *port,
                ..Default::default()
            },
            None => FindCoordinatorResponse {
                error_code: KafkaCode::CoordinatorNotAvailable,
                node_id: -1,
                ..Default::default()
            },
        }
    }

    // ========================================================================
    // Produce, fetch, list offsets
    // ========================================================================

    /// Apply a produce request. The flag asks the connection to drop the
    /// response after the write.
    pub(crate) fn produce(&mut self, broker: i32, request: &ProduceRequest) -> (ProduceResponse, bool) {
        let mut response = ProduceResponse::default();
        for topic in &request.topics {
            for data in &topic.partitions {
                let outcome = self.produce_partition(broker, &topic.name, data.index, data.records.as_ref());
                let (error_code, base_offset) = match outcome {
                    Ok(base) => (KafkaCode::None, base),
                    Err((code, base)) => (code, base),
                };
                if error_code != KafkaCode::None {
                    tracing::debug!(topic = %topic.name, partition = data.index, error = ?error_code, "Mock rejected produce");
                }
                response.add_partition(
                    &topic.name,
                    ProducePartitionResponse {
                        index: data.index,
                        error_code,
                        base_offset,
                        log_start_offset: 0,
                        ..Default::default()
                    },
                );
            }
        }
        let drop_response = self.faults.drop_produce_responses > 0;
        if drop_response {
            self.faults.drop_produce_responses -= 1;
        }
        (response, drop_response)
    }

    fn produce_partition(
        &mut self,
        broker: i32,
        topic: &str,
        partition: i32,
        records: Option<&Bytes>,
    ) -> std::result::Result<i64, (KafkaCode, i64)> {
        let code = self.leader_check(broker, topic, partition);
        if code != KafkaCode::None {
            return Err((code, -1));
        }
        if let Some(code) = self
            .faults
            .produce_errors
            .get_mut(&(topic.to_string(), partition))
            .and_then(VecDeque::pop_front)
        {
            return Err((code, -1));
        }

        let mut rest = records.cloned().unwrap_or_default();
        let mut entries = Vec::new();
        while rest.len() >= RECORD_BATCH_LOG_OVERHEAD {
            let length = i32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]);
            let end = RECORD_BATCH_LOG_OVERHEAD + length.max(0) as usize;
            if length < 0 || end > rest.len() {
                return Err((KafkaCode::CorruptMessage, -1));
            }
            if end > self.max_message_bytes {
                return Err((KafkaCode::MessageSizeTooLarge, -1));
            }
            entries.push(rest.slice(..end));
            rest = rest.slice(end..);
        }
        if !rest.is_empty() || entries.is_empty() {
            return Err((KafkaCode::CorruptMessage, -1));
        }

        let Some(log) = self.partition_mut(topic, partition) else {
            return Err((KafkaCode::UnknownTopicOrPartition, -1));
        };
        let mut first = None;
        for entry in &entries {
            let base = log.append(entry)?;
            first.get_or_insert(base);
        }
        Ok(first.unwrap_or(-1))
    }

    /// Answer a fetch from what is stored now. Returns the response and the
    /// number of record bytes it carries.
    pub(crate) fn fetch(&self, broker: i32, request: &FetchRequest) -> (FetchResponse, usize) {
        let read_committed = request.isolation_level == 1;
        let mut response = FetchResponse::default();
        let mut budget = usize::try_from(request.max_bytes).unwrap_or(usize::MAX);
        let mut total = 0;

        for topic in &request.topics {
            for p in &topic.partitions {
                let mut block = FetchPartitionResponse {
                    partition: p.partition,
                    ..Default::default()
                };
                let code = self.leader_check(broker, &topic.topic, p.partition);
                match self.partition(&topic.topic, p.partition) {
                    Some(log) if code == KafkaCode::None => {
                        let lso = log.last_stable_offset();
                        block.high_watermark = log.high_water_mark();
                        block.last_stable_offset = lso;
                        block.log_start_offset = 0;
                        if p.fetch_offset < 0 || p.fetch_offset > log.high_water_mark() {
                            block.error_code = KafkaCode::OffsetOutOfRange;
                        } else {
                            let upper = if read_committed { lso } else { log.high_water_mark() };
                            let limit = usize::try_from(p.partition_max_bytes).unwrap_or(0).min(budget);
                            let records = log.read(p.fetch_offset, upper, limit);
                            budget = budget.saturating_sub(records.len());
                            total += records.len();
                            block.records = Some(records);
                            if read_committed {
                                block.aborted_transactions = Some(
                                    log.aborted
                                        .iter()
                                        .filter(|a| a.first_offset < upper)
                                        .copied()
                                        .collect(),
                                );
                            }
                        }
                    }
                    _ => block.error_code = code,
                }
                response.add_partition(&topic.topic, block);
            }
        }
        (response, total)
    }

    pub(crate) fn list_offsets(&self, broker: i32, request: &ListOffsetsRequest) -> ListOffsetsResponse {
        let mut response = ListOffsetsResponse::default();
        for topic in &request.topics {
            for p in &topic.partitions {
                let code = self.leader_check(broker, &topic.name, p.partition_index);
                let mut block = ListOffsetsPartitionResponse {
                    partition_index: p.partition_index,
                    error_code: code,
                    ..Default::default()
                };
                if code == KafkaCode::None
                    && let Some(log) = self.partition(&topic.name, p.partition_index)
                {
                    let offset = log.offset_for_time(p.timestamp);
                    block.offset = offset;
                    block.old_style_offsets = vec![offset];
                }
                response.add_partition(&topic.name, block);
            }
        }
        response
    }

    // ========================================================================
    // Committed offsets
    // ========================================================================

    pub(crate) fn offset_commit(&mut self, request: &OffsetCommitRequest) -> OffsetCommitResponse {
        let code = match self.groups.get(&request.group_id) {
            _ if request.generation_id < 0 => KafkaCode::None,
            Some(group) => group.check_member(&request.member_id, request.generation_id),
            None => KafkaCode::IllegalGeneration,
        };

        let mut response = OffsetCommitResponse::default();
        for topic in &request.topics {
            for p in &topic.partitions {
                let partition_code = if code != KafkaCode::None {
                    code
                } else if self.partition(&topic.name, p.partition_index).is_none() {
                    KafkaCode::UnknownTopicOrPartition
                } else {
                    self.committed.insert(
                        (request.group_id.clone(), topic.name.clone(), p.partition_index),
                        (p.committed_offset, p.committed_metadata.clone()),
                    );
                    KafkaCode::None
                };
                response.add_partition(&topic.name, p.partition_index, partition_code);
            }
        }
        response
    }

    pub(crate) fn offset_fetch(&self, request: &OffsetFetchRequest) -> OffsetFetchResponse {
        let mut response = OffsetFetchResponse::default();
        let wanted: Vec<(String, i32)> = match &request.topics {
            Some(topics) => topics
                .iter()
                .flat_map(|t| t.partition_indexes.iter().map(|p| (t.name.clone(), *p)))
                .collect(),
            None => self
                .committed
                .keys()
                .filter(|(g, _, _)| *g == request.group_id)
                .map(|(_, t, p)| (t.clone(), *p))
                .collect(),
        };
        for (topic, partition) in wanted {
            let key = (request.group_id.clone(), topic.clone(), partition);
            let (committed_offset, metadata) = self
                .committed
                .get(&key)
                .cloned()
                .unwrap_or((-1, Some(String::new())));
            response.add_partition(
                &topic,
                OffsetFetchPartitionResponse {
                    partition_index: partition,
                    committed_offset,
                    committed_leader_epoch: -1,
                    metadata,
                    error_code: KafkaCode::None,
                },
            );
        }
        response
    }

    // ========================================================================
    // Group introspection
    // ========================================================================

    pub(crate) fn describe_groups(&self, request: &DescribeGroupsRequest) -> DescribeGroupsResponse {
        DescribeGroupsResponse {
            groups: request
                .groups
                .iter()
                .map(|id| match self.groups.get(id) {
                    Some(group) => group.describe(),
                    None => DescribedGroup {
                        group_id: id.clone(),
                        group_state: "Dead".to_string(),
                        ..Default::default()
                    },
                })
                .collect(),
            ..Default::default()
        }
    }

    pub(crate) fn list_groups(&self) -> ListGroupsResponse {
        ListGroupsResponse {
            groups: self
                .groups
                .iter()
                .map(|(id, g)| (id.clone(), g.protocol_type().unwrap_or("consumer").to_string()))
                .collect(),
            ..Default::default()
        }
    }

    // ========================================================================
    // Producer ids and transactions
    // ========================================================================

    pub(crate) fn init_producer_id(&mut self, request: &InitProducerIdRequest) -> Result<InitProducerIdResponse> {
        let Some(txn_id) = request.transactional_id.as_deref() else {
            let producer_id = self.next_producer_id;
            self.next_producer_id += 1;
            return Ok(InitProducerIdResponse {
                producer_id,
                producer_epoch: 0,
                ..Default::default()
            });
        };

        if let Some(entry) = self.txns.remove(txn_id) {
            // A new session fences the old one and rolls back its work.
            self.finish_txn(&entry, false)?;
            let epoch = entry.epoch.wrapping_add(1);
            self.txns.insert(
                txn_id.to_string(),
                TxnEntry {
                    producer_id: entry.producer_id,
                    epoch,
                    partitions: BTreeSet::new(),
                    pending_offsets: BTreeMap::new(),
                },
            );
            return Ok(InitProducerIdResponse {
                producer_id: entry.producer_id,
                producer_epoch: epoch,
                ..Default::default()
            });
        }

        let producer_id = self.next_producer_id;
        self.next_producer_id += 1;
        self.txns.insert(
            txn_id.to_string(),
            TxnEntry {
                producer_id,
                epoch: 0,
                partitions: BTreeSet::new(),
                pending_offsets: BTreeMap::new(),
            },
        );
        Ok(InitProducerIdResponse {
            producer_id,
            producer_epoch: 0,
            ..Default::default()
        })
    }

    fn txn_mut(&mut self, txn_id: &str, producer_id: i64, epoch: i16) -> std::result::Result<&mut TxnEntry, KafkaCode> {
        let entry = self
            .txns
            .get_mut(txn_id)
            .ok_or(KafkaCode::InvalidProducerIdMapping)?;
        if entry.producer_id != producer_id {
            return Err(KafkaCode::InvalidProducerIdMapping);
        }
        if entry.epoch != epoch {
            return Err(KafkaCode::InvalidProducerEpoch);
        }
        Ok(entry)
    }

    pub(crate) fn add_partitions_to_txn(&mut self, request: &AddPartitionsToTxnRequest) -> AddPartitionsToTxnResponse {
        let mut response = AddPartitionsToTxnResponse::default();
        let unknown: Vec<(String, i32)> = request
            .topics
            .iter()
            .flat_map(|(t, ps)| ps.iter().map(move |p| (t.clone(), *p)))
            .filter(|(t, p)| self.partition(t, *p).is_none())
            .collect();
        let result = self.txn_mut(&request.transactional_id, request.producer_id, request.producer_epoch);
        for (topic, partitions) in &request.topics {
            for partition in partitions {
                let code = match &result {
                    Err(code) => *code,
                    Ok(_) if unknown.contains(&(topic.clone(), *partition)) => KafkaCode::UnknownTopicOrPartition,
                    Ok(_) => KafkaCode::None,
                };
                response.add_partition(topic, *partition, code);
            }
        }
        if unknown.is_empty()
            && let Ok(entry) = result
        {
            for (topic, partitions) in &request.topics {
                for partition in partitions {
                    entry.partitions.insert((topic.clone(), *partition));
                }
            }
        }
        response
    }

    pub(crate) fn add_offsets_to_txn(&mut self, request: &AddOffsetsToTxnRequest) -> TxnErrorResponse {
        let error_code = match self.txn_mut(&request.transactional_id, request.producer_id, request.producer_epoch) {
            Ok(_) => KafkaCode::None,
            Err(code) => code,
        };
        TxnErrorResponse {
            error_code,
            ..Default::default()
        }
    }

    pub(crate) fn txn_offset_commit(&mut self, request: &TxnOffsetCommitRequest) -> TxnOffsetCommitResponse {
        let mut response = TxnOffsetCommitResponse::default();
        let result = self.txn_mut(&request.transactional_id, request.producer_id, request.producer_epoch);
        let code = match result {
            Ok(entry) => {
                for topic in &request.topics {
                    for p in &topic.partitions {
                        entry.pending_offsets.insert(
                            (request.group_id.clone(), topic.name.clone(), p.partition_index),
                            (p.committed_offset, p.committed_metadata.clone()),
                        );
                    }
                }
                KafkaCode::None
            }
            Err(code) => code,
        };
        for topic in &request.topics {
            for p in &topic.partitions {
                response.add_partition(&topic.name, p.partition_index, code);
            }
        }
        response
    }

    pub(crate) fn end_txn(&mut self, request: &EndTxnRequest) -> Result<TxnErrorResponse> {
        let error_code = match self.txn_mut(&request.transactional_id, request.producer_id, request.producer_epoch) {
            Err(code) => code,
            Ok(entry) => {
                let done = TxnEntry {
                    producer_id: entry.producer_id,
                    epoch: entry.epoch,
                    partitions: std::mem::take(&mut entry.partitions),
                    pending_offsets: std::mem::take(&mut entry.pending_offsets),
                };
                self.finish_txn(&done, request.committed)?;
                tracing::debug!(
                    transactional_id = %request.transactional_id,
                    committed = request.committed,
                    partitions = done.partitions.len(),
                    "Mock transaction finished"
                );
                KafkaCode::None
            }
        };
        Ok(TxnErrorResponse {
            error_code,
            ..Default::default()
        })
    }

    fn finish_txn(&mut self, entry: &TxnEntry, commit: bool) -> Result<()> {
        for (topic, partition) in &entry.partitions {
            if let Some(log) = self.partition_mut(topic, *partition) {
                log.write_marker(entry.producer_id, entry.epoch, commit)?;
            }
        }
        if commit {
            for (key, value) in &entry.pending_offsets {
                self.committed.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::records::decode_record_set;

    fn cluster() -> ClusterState {
        let mut brokers = BTreeMap::new();
        brokers.insert(1, ("127.0.0.1".to_string(), 9092));
        brokers.insert(2, ("127.0.0.1".to_string(), 9093));
        let mut state = ClusterState::new(brokers, 1_000_000);
        state.create_topic("t", 2);
        state
    }

    fn idempotent_batch(first_sequence: i32, values: &[&str]) -> Bytes {
        RecordBatch {
            producer_id: 7,
            producer_epoch: 0,
            first_sequence,
            last_offset_delta: values.len() as i32 - 1,
            records: values
                .iter()
                .enumerate()
                .map(|(i, v)| Record {
                    offset_delta: i as i32,
                    value: Some(Bytes::copy_from_slice(v.as_bytes())),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
        .encode(None)
        .unwrap()
    }

    #[test]
    fn test_leadership_round_robin() {
        let state = cluster();
        assert_eq!(state.partition("t", 0).unwrap().leader, 1);
        assert_eq!(state.partition("t", 1).unwrap().leader, 2);
        assert_eq!(state.leader_check(2, "t", 0), KafkaCode::NotLeaderForPartition);
        assert_eq!(state.leader_check(1, "missing", 0), KafkaCode::UnknownTopicOrPartition);
    }

    #[test]
    fn test_append_assigns_offsets() {
        let mut state = cluster();
        let log = state.partition_mut("t", 0).unwrap();
        assert_eq!(log.append(&idempotent_batch(0, &["a", "b"])), Ok(0));
        assert_eq!(log.append(&idempotent_batch(2, &["c"])), Ok(2));
        assert_eq!(log.high_water_mark(), 3);

        let stored = log.read(1, 3, usize::MAX);
        let decoded = decode_record_set(&stored).unwrap();
        assert_eq!(decoded.sets.len(), 2);
        assert_eq!(decoded.sets[1].next_offset(), Some(3));
    }

    #[test]
    fn test_duplicate_sequence_reports_original_offset() {
        let mut state = cluster();
        let log = state.partition_mut("t", 0).unwrap();
        let batch = idempotent_batch(0, &["a", "b"]);
        assert_eq!(log.append(&batch), Ok(0));
        assert_eq!(log.append(&batch), Err((KafkaCode::DuplicateSequenceNumber, 0)));
        assert_eq!(
            log.append(&idempotent_batch(5, &["x"])),
            Err((KafkaCode::OutOfOrderSequenceNumber, -1))
        );
        assert_eq!(log.high_water_mark(), 2);
    }

    #[test]
    fn test_read_truncates_at_max_bytes() {
        let mut state = cluster();
        let log = state.partition_mut("t", 0).unwrap();
        log.append(&idempotent_batch(0, &["a"])).unwrap();
        assert_eq!(log.read(0, 1, 10).len(), 10);
    }

    #[test]
    fn test_aborted_marker_recorded() {
        let mut state = cluster();
        let log = state.partition_mut("t", 0).unwrap();
        log.open_txns.insert(7, 0);
        log.append(&idempotent_batch(0, &["a"])).unwrap();
        assert_eq!(log.last_stable_offset(), 0);

        log.write_marker(7, 0, false).unwrap();
        assert_eq!(log.last_stable_offset(), 2);
        assert_eq!(
            log.aborted,
            vec![AbortedTransaction {
                producer_id: 7,
                first_offset: 0
            }]
        );
    }
}
