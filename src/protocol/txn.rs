//! Idempotent and transactional producer APIs: InitProducerId,
//! AddPartitionsToTxn, AddOffsetsToTxn, EndTxn and TxnOffsetCommit.

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::offsets::{PartitionErrors, add_partition_error, encode_partition_errors, error_for, parse_partition_errors};
use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::constants::{NO_PRODUCER_EPOCH, NO_PRODUCER_ID};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bool, parse_kafka_code, parse_nullable_string, parse_string};
use crate::types::ProducerIdentity;

type NomError = nom::error::Error<NomBytes>;

const RELEASES: &[KafkaVersion] = &[KafkaVersion::V0_11_0_0, KafkaVersion::V2_0_0_0];

const TXN_OFFSET_COMMIT_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_1_0_0,
];

/// Response made of a throttle time and an error code.
/// Shared by AddOffsetsToTxn and EndTxn.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxnErrorResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
}

impl Encodable for TxnErrorResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.throttle_time_ms.encode(buffer)?;
        self.error_code.encode(buffer)
    }
}

impl Decodable for TxnErrorResponse {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = be_i32(input)?;
        let (input, error_code) = parse_kafka_code(input)?;
        Ok((
            input,
            TxnErrorResponse {
                throttle_time_ms,
                error_code,
            },
        ))
    }
}

impl Response for TxnErrorResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// InitProducerId
// ============================================================================

/// Obtain a producer id and epoch. Idempotent producers send a null
/// transactional id to any broker; transactional producers send it to
/// their transaction coordinator.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InitProducerIdRequest {
    pub transactional_id: Option<String>,
    pub transaction_timeout_ms: i32,
}

impl Encodable for InitProducerIdRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.transactional_id.as_deref().encode(buffer)?;
        self.transaction_timeout_ms.encode(buffer)
    }
}

impl Decodable for InitProducerIdRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, transactional_id) = parse_nullable_string(input)?;
        let (input, transaction_timeout_ms) = be_i32(input)?;
        Ok((
            input,
            InitProducerIdRequest {
                transactional_id,
                transaction_timeout_ms,
            },
        ))
    }
}

impl Request for InitProducerIdRequest {
    type Response = InitProducerIdResponse;
    const KEY: ApiKey = ApiKey::InitProducerId;
    const MAX_VERSION: i16 = 1;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InitProducerIdResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub producer_id: i64,
    pub producer_epoch: i16,
}

impl Default for InitProducerIdResponse {
    fn default() -> Self {
        Self {
            throttle_time_ms: 0,
            error_code: KafkaCode::None,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
        }
    }
}

impl InitProducerIdResponse {
    pub fn identity(&self) -> ProducerIdentity {
        ProducerIdentity {
            producer_id: self.producer_id,
            epoch: self.producer_epoch,
        }
    }
}

impl Encodable for InitProducerIdResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.throttle_time_ms.encode(buffer)?;
        self.error_code.encode(buffer)?;
        self.producer_id.encode(buffer)?;
        self.producer_epoch.encode(buffer)
    }
}

impl Decodable for InitProducerIdResponse {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = be_i32(input)?;
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, producer_id) = be_i64(input)?;
        let (input, producer_epoch) = be_i16(input)?;
        Ok((
            input,
            InitProducerIdResponse {
                throttle_time_ms,
                error_code,
                producer_id,
                producer_epoch,
            },
        ))
    }
}

impl Response for InitProducerIdResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// AddPartitionsToTxn
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddPartitionsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    /// (topic, partitions)
    pub topics: Vec<(String, Vec<i32>)>,
}

impl AddPartitionsToTxnRequest {
    pub fn add_partition(&mut self, topic: &str, partition: i32) {
        match self.topics.iter_mut().find(|(t, _)| t == topic) {
            Some((_, partitions)) => partitions.push(partition),
            None => self.topics.push((topic.to_string(), vec![partition])),
        }
    }
}

impl Encodable for AddPartitionsToTxnRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.transactional_id.encode(buffer)?;
        self.producer_id.encode(buffer)?;
        self.producer_epoch.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, (topic, partitions)| {
            topic.encode(buffer)?;
            partitions.encode(buffer)
        })
    }
}

fn parse_txn_topic(input: NomBytes) -> IResult<NomBytes, (String, Vec<i32>)> {
    let (input, topic) = parse_string(input)?;
    let (input, partitions) = parse_array(be_i32::<NomBytes, NomError>)(input)?;
    Ok((input, (topic, partitions)))
}

impl Decodable for AddPartitionsToTxnRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, transactional_id) = parse_string(input)?;
        let (input, producer_id) = be_i64(input)?;
        let (input, producer_epoch) = be_i16(input)?;
        let (input, topics) = parse_array(parse_txn_topic)(input)?;
        Ok((
            input,
            AddPartitionsToTxnRequest {
                transactional_id,
                producer_id,
                producer_epoch,
                topics,
            },
        ))
    }
}

impl Request for AddPartitionsToTxnRequest {
    type Response = AddPartitionsToTxnResponse;
    const KEY: ApiKey = ApiKey::AddPartitionsToTxn;
    const MAX_VERSION: i16 = 1;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddPartitionsToTxnResponse {
    pub throttle_time_ms: i32,
    pub results: Vec<PartitionErrors>,
}

impl AddPartitionsToTxnResponse {
    pub fn add_partition(&mut self, topic: &str, partition: i32, code: KafkaCode) {
        add_partition_error(&mut self.results, topic, partition, code);
    }

    pub fn error_for(&self, topic: &str, partition: i32) -> Option<KafkaCode> {
        error_for(&self.results, topic, partition)
    }

    /// Every partition error, in response order.
    pub fn errors(&self) -> impl Iterator<Item = (&str, i32, KafkaCode)> {
        self.results.iter().flat_map(|t| {
            t.partitions
                .iter()
                .map(move |(p, code)| (t.name.as_str(), *p, *code))
        })
    }
}

impl Encodable for AddPartitionsToTxnResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.throttle_time_ms.encode(buffer)?;
        encode_partition_errors(buffer, &self.results)
    }
}

impl Decodable for AddPartitionsToTxnResponse {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = be_i32(input)?;
        let (input, results) = parse_partition_errors(input)?;
        Ok((
            input,
            AddPartitionsToTxnResponse {
                throttle_time_ms,
                results,
            },
        ))
    }
}

impl Response for AddPartitionsToTxnResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// AddOffsetsToTxn
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AddOffsetsToTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub group_id: String,
}

impl Encodable for AddOffsetsToTxnRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.transactional_id.encode(buffer)?;
        self.producer_id.encode(buffer)?;
        self.producer_epoch.encode(buffer)?;
        self.group_id.encode(buffer)
    }
}

impl Decodable for AddOffsetsToTxnRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, transactional_id) = parse_string(input)?;
        let (input, producer_id) = be_i64(input)?;
        let (input, producer_epoch) = be_i16(input)?;
        let (input, group_id) = parse_string(input)?;
        Ok((
            input,
            AddOffsetsToTxnRequest {
                transactional_id,
                producer_id,
                producer_epoch,
                group_id,
            },
        ))
    }
}

impl Request for AddOffsetsToTxnRequest {
    type Response = TxnErrorResponse;
    const KEY: ApiKey = ApiKey::AddOffsetsToTxn;
    const MAX_VERSION: i16 = 1;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

// ============================================================================
// EndTxn
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EndTxnRequest {
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    /// `true` commits, `false` aborts.
    pub committed: bool,
}

impl Encodable for EndTxnRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.transactional_id.encode(buffer)?;
        self.producer_id.encode(buffer)?;
        self.producer_epoch.encode(buffer)?;
        self.committed.encode(buffer)
    }
}

impl Decodable for EndTxnRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, transactional_id) = parse_string(input)?;
        let (input, producer_id) = be_i64(input)?;
        let (input, producer_epoch) = be_i16(input)?;
        let (input, committed) = parse_bool(input)?;
        Ok((
            input,
            EndTxnRequest {
                transactional_id,
                producer_id,
                producer_epoch,
                committed,
            },
        ))
    }
}

impl Request for EndTxnRequest {
    type Response = TxnErrorResponse;
    const KEY: ApiKey = ApiKey::EndTxn;
    const MAX_VERSION: i16 = 1;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

// ============================================================================
// TxnOffsetCommit
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxnOffsetCommitRequest {
    pub transactional_id: String,
    pub group_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub topics: Vec<TxnOffsetCommitTopic>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxnOffsetCommitTopic {
    pub name: String,
    pub partitions: Vec<TxnOffsetCommitPartition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxnOffsetCommitPartition {
    pub partition_index: i32,
    pub committed_offset: i64,
    /// Version 2 and later.
    pub committed_leader_epoch: i32,
    pub committed_metadata: Option<String>,
}

impl TxnOffsetCommitRequest {
    pub fn add_offset(&mut self, topic: &str, partition: i32, offset: i64, metadata: Option<String>) {
        let entry = TxnOffsetCommitPartition {
            partition_index: partition,
            committed_offset: offset,
            committed_leader_epoch: -1,
            committed_metadata: metadata,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(entry),
            None => self.topics.push(TxnOffsetCommitTopic {
                name: topic.to_string(),
                partitions: vec![entry],
            }),
        }
    }
}

impl Encodable for TxnOffsetCommitRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.transactional_id.encode(buffer)?;
        self.group_id.encode(buffer)?;
        self.producer_id.encode(buffer)?;
        self.producer_epoch.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                p.committed_offset.encode(buffer)?;
                if version >= 2 {
                    p.committed_leader_epoch.encode(buffer)?;
                }
                p.committed_metadata.as_deref().encode(buffer)
            })
        })
    }
}

impl Decodable for TxnOffsetCommitRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, transactional_id) = parse_string(input)?;
        let (input, group_id) = parse_string(input)?;
        let (input, producer_id) = be_i64(input)?;
        let (input, producer_epoch) = be_i16(input)?;
        let partition = move |input: NomBytes| -> IResult<NomBytes, TxnOffsetCommitPartition> {
            let (input, partition_index) = be_i32(input)?;
            let (input, committed_offset) = be_i64(input)?;
            let (input, committed_leader_epoch) = if version >= 2 { be_i32(input)? } else { (input, -1) };
            let (input, committed_metadata) = parse_nullable_string(input)?;
            Ok((
                input,
                TxnOffsetCommitPartition {
                    partition_index,
                    committed_offset,
                    committed_leader_epoch,
                    committed_metadata,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, TxnOffsetCommitTopic> {
            let (input, name) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, TxnOffsetCommitTopic { name, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;
        Ok((
            input,
            TxnOffsetCommitRequest {
                transactional_id,
                group_id,
                producer_id,
                producer_epoch,
                topics,
            },
        ))
    }
}

impl Request for TxnOffsetCommitRequest {
    type Response = TxnOffsetCommitResponse;
    const KEY: ApiKey = ApiKey::TxnOffsetCommit;
    const MAX_VERSION: i16 = 2;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(TXN_OFFSET_COMMIT_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TxnOffsetCommitResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<PartitionErrors>,
}

impl TxnOffsetCommitResponse {
    pub fn add_partition(&mut self, topic: &str, partition: i32, code: KafkaCode) {
        add_partition_error(&mut self.topics, topic, partition, code);
    }

    pub fn error_for(&self, topic: &str, partition: i32) -> Option<KafkaCode> {
        error_for(&self.topics, topic, partition)
    }
}

impl Encodable for TxnOffsetCommitResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.throttle_time_ms.encode(buffer)?;
        encode_partition_errors(buffer, &self.topics)
    }
}

impl Decodable for TxnOffsetCommitResponse {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = be_i32(input)?;
        let (input, topics) = parse_partition_errors(input)?;
        Ok((
            input,
            TxnOffsetCommitResponse {
                throttle_time_ms,
                topics,
            },
        ))
    }
}

impl Response for TxnOffsetCommitResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    #[test]
    fn test_init_producer_id() {
        let idempotent = InitProducerIdRequest {
            transactional_id: None,
            transaction_timeout_ms: 60_000,
        };
        let bytes = crate::protocol::encode_body(&idempotent, 0).unwrap();
        assert_eq!(bytes.as_ref(), &[0xFF, 0xFF, 0x00, 0x00, 0xEA, 0x60]);
        assert_round_trip(&idempotent, 1);

        let response = InitProducerIdResponse {
            producer_id: 1000,
            producer_epoch: 0,
            ..Default::default()
        };
        assert_round_trip(&response, 0);
        assert!(response.identity().is_valid());
        assert!(!InitProducerIdResponse::default().identity().is_valid());
    }

    #[test]
    fn test_add_partitions() {
        let mut request = AddPartitionsToTxnRequest {
            transactional_id: "txn".to_string(),
            producer_id: 7,
            producer_epoch: 1,
            topics: Vec::new(),
        };
        request.add_partition("t", 0);
        request.add_partition("t", 1);
        request.add_partition("u", 0);
        assert_eq!(request.topics.len(), 2);
        assert_round_trip(&request, 0);

        let mut response = AddPartitionsToTxnResponse::default();
        response.add_partition("t", 0, KafkaCode::None);
        response.add_partition("t", 1, KafkaCode::ConcurrentTransactions);
        assert_round_trip(&response, 1);
        let failed: Vec<_> = response.errors().filter(|(_, _, c)| !c.is_ok()).collect();
        assert_eq!(failed, vec![("t", 1, KafkaCode::ConcurrentTransactions)]);
    }

    #[test]
    fn test_add_offsets_and_end_txn() {
        let add = AddOffsetsToTxnRequest {
            transactional_id: "txn".to_string(),
            producer_id: 7,
            producer_epoch: 1,
            group_id: "g".to_string(),
        };
        assert_round_trip(&add, 0);

        let end = EndTxnRequest {
            transactional_id: "txn".to_string(),
            producer_id: 7,
            producer_epoch: 1,
            committed: true,
        };
        assert_round_trip(&end, 1);
        let bytes = crate::protocol::encode_body(&end, 0).unwrap();
        assert_eq!(bytes.last(), Some(&1));

        let response = TxnErrorResponse {
            throttle_time_ms: 2,
            error_code: KafkaCode::ProducerFenced,
        };
        assert_round_trip(&response, 0);
    }

    #[test]
    fn test_txn_offset_commit() {
        let mut request = TxnOffsetCommitRequest {
            transactional_id: "txn".to_string(),
            group_id: "g".to_string(),
            producer_id: 7,
            producer_epoch: 1,
            topics: Vec::new(),
        };
        request.add_offset("t", 0, 42, None);
        request.add_offset("t", 1, 43, Some("m".to_string()));
        assert_round_trip(&request, 0);
        request.topics[0].partitions[0].committed_leader_epoch = 4;
        assert_round_trip(&request, 2);

        let mut response = TxnOffsetCommitResponse::default();
        response.add_partition("t", 0, KafkaCode::None);
        assert_round_trip(&response, 2);
        assert_eq!(response.error_for("t", 0), Some(KafkaCode::None));
    }
}
