//! OffsetCommit (key 8, versions 0-7) and OffsetFetch (key 9, versions 0-5).

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::constants::{DEFAULT_RETENTION_TIME, NO_COMMITTED_OFFSET};
use crate::encode::{ToByte, encode_as_array, encode_nullable_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{
    parse_array, parse_kafka_code, parse_nullable_array, parse_nullable_string, parse_string,
};

type NomError = nom::error::Error<NomBytes>;

const COMMIT_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_1_0_0,
    KafkaVersion::V2_1_0_0,
    KafkaVersion::V2_3_0_0,
];

const FETCH_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_10_2_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_1_0_0,
];

// ============================================================================
// OffsetCommit
// ============================================================================

/// OffsetCommit request.
///
/// - v1 adds generation and member id, and a per-partition commit timestamp
/// - v2 through v4 carry a group-wide retention time
/// - v6 adds the committed leader epoch
/// - v7 adds `group_instance_id`
#[derive(Debug, Clone, PartialEq)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub retention_time_ms: i64,
    pub topics: Vec<OffsetCommitTopic>,
}

impl Default for OffsetCommitRequest {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            generation_id: -1,
            member_id: String::new(),
            group_instance_id: None,
            retention_time_ms: DEFAULT_RETENTION_TIME,
            topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OffsetCommitTopic {
    pub name: String,
    pub partitions: Vec<OffsetCommitPartition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetCommitPartition {
    pub partition_index: i32,
    pub committed_offset: i64,
    pub committed_leader_epoch: i32,
    /// Version 1 only.
    pub commit_timestamp: i64,
    pub committed_metadata: Option<String>,
}

impl OffsetCommitPartition {
    pub fn new(partition_index: i32, committed_offset: i64, metadata: Option<String>) -> Self {
        Self {
            partition_index,
            committed_offset,
            committed_leader_epoch: -1,
            commit_timestamp: -1,
            committed_metadata: metadata,
        }
    }
}

impl OffsetCommitRequest {
    pub fn add_partition(&mut self, topic: &str, partition: OffsetCommitPartition) {
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(partition),
            None => self.topics.push(OffsetCommitTopic {
                name: topic.to_string(),
                partitions: vec![partition],
            }),
        }
    }
}

impl Encodable for OffsetCommitRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.group_id.encode(buffer)?;
        if version >= 1 {
            self.generation_id.encode(buffer)?;
            self.member_id.encode(buffer)?;
        }
        if version >= 7 {
            self.group_instance_id.as_deref().encode(buffer)?;
        }
        if (2..=4).contains(&version) {
            self.retention_time_ms.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                p.committed_offset.encode(buffer)?;
                if version >= 6 {
                    p.committed_leader_epoch.encode(buffer)?;
                }
                if version == 1 {
                    p.commit_timestamp.encode(buffer)?;
                }
                p.committed_metadata.as_deref().encode(buffer)
            })
        })
    }
}

impl Decodable for OffsetCommitRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, group_id) = parse_string(input)?;
        let (input, generation_id, member_id) = if version >= 1 {
            let (input, generation) = be_i32(input)?;
            let (input, member) = parse_string(input)?;
            (input, generation, member)
        } else {
            (input, -1, String::new())
        };
        let (input, group_instance_id) = if version >= 7 {
            parse_nullable_string(input)?
        } else {
            (input, None)
        };
        let (input, retention_time_ms) = if (2..=4).contains(&version) {
            be_i64(input)?
        } else {
            (input, DEFAULT_RETENTION_TIME)
        };
        let partition = move |input: NomBytes| -> IResult<NomBytes, OffsetCommitPartition> {
            let (input, partition_index) = be_i32(input)?;
            let (input, committed_offset) = be_i64(input)?;
            let (input, committed_leader_epoch) = if version >= 6 { be_i32(input)? } else { (input, -1) };
            let (input, commit_timestamp) = if version == 1 { be_i64(input)? } else { (input, -1) };
            let (input, committed_metadata) = parse_nullable_string(input)?;
            Ok((
                input,
                OffsetCommitPartition {
                    partition_index,
                    committed_offset,
                    committed_leader_epoch,
                    commit_timestamp,
                    committed_metadata,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, OffsetCommitTopic> {
            let (input, name) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, OffsetCommitTopic { name, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;
        Ok((
            input,
            OffsetCommitRequest {
                group_id,
                generation_id,
                member_id,
                group_instance_id,
                retention_time_ms,
                topics,
            },
        ))
    }
}

impl Request for OffsetCommitRequest {
    type Response = OffsetCommitResponse;
    const KEY: ApiKey = ApiKey::OffsetCommit;
    const MAX_VERSION: i16 = 7;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(COMMIT_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OffsetCommitResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<PartitionErrors>,
}

/// A topic with one error code per partition, shared by several responses.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionErrors {
    pub name: String,
    pub partitions: Vec<(i32, KafkaCode)>,
}

impl OffsetCommitResponse {
    pub fn add_partition(&mut self, topic: &str, partition: i32, code: KafkaCode) {
        add_partition_error(&mut self.topics, topic, partition, code);
    }

    pub fn error_for(&self, topic: &str, partition: i32) -> Option<KafkaCode> {
        error_for(&self.topics, topic, partition)
    }
}

pub(crate) fn add_partition_error(
    topics: &mut Vec<PartitionErrors>,
    topic: &str,
    partition: i32,
    code: KafkaCode,
) {
    match topics.iter_mut().find(|t| t.name == topic) {
        Some(t) => t.partitions.push((partition, code)),
        None => topics.push(PartitionErrors {
            name: topic.to_string(),
            partitions: vec![(partition, code)],
        }),
    }
}

pub(crate) fn error_for(topics: &[PartitionErrors], topic: &str, partition: i32) -> Option<KafkaCode> {
    topics
        .iter()
        .find(|t| t.name == topic)?
        .partitions
        .iter()
        .find(|(p, _)| *p == partition)
        .map(|(_, code)| *code)
}

pub(crate) fn encode_partition_errors<W: BufMut>(
    buffer: &mut W,
    topics: &[PartitionErrors],
) -> Result<()> {
    encode_as_array(buffer, topics, |buffer, topic| {
        topic.name.encode(buffer)?;
        encode_as_array(buffer, &topic.partitions, |buffer, (partition, code)| {
            partition.encode(buffer)?;
            code.encode(buffer)
        })
    })
}

pub(crate) fn parse_partition_errors(input: NomBytes) -> IResult<NomBytes, Vec<PartitionErrors>> {
    fn partition(input: NomBytes) -> IResult<NomBytes, (i32, KafkaCode)> {
        let (input, index) = be_i32(input)?;
        let (input, code) = parse_kafka_code(input)?;
        Ok((input, (index, code)))
    }
    fn topic(input: NomBytes) -> IResult<NomBytes, PartitionErrors> {
        let (input, name) = parse_string(input)?;
        let (input, partitions) = parse_array(partition)(input)?;
        Ok((input, PartitionErrors { name, partitions }))
    }
    parse_array(topic)(input)
}

impl Encodable for OffsetCommitResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 3 {
            self.throttle_time_ms.encode(buffer)?;
        }
        encode_partition_errors(buffer, &self.topics)
    }
}

impl Decodable for OffsetCommitResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = if version >= 3 { be_i32(input)? } else { (input, 0) };
        let (input, topics) = parse_partition_errors(input)?;
        Ok((
            input,
            OffsetCommitResponse {
                throttle_time_ms,
                topics,
            },
        ))
    }
}

impl Response for OffsetCommitResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// OffsetFetch
// ============================================================================

/// OffsetFetch request. From v2 a null topic list fetches every partition
/// the group has committed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub topics: Option<Vec<OffsetFetchTopic>>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OffsetFetchTopic {
    pub name: String,
    pub partition_indexes: Vec<i32>,
}

impl OffsetFetchRequest {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics: Some(Vec::new()),
        }
    }

    pub fn add_partition(&mut self, topic: &str, partition: i32) {
        let topics = self.topics.get_or_insert_with(Vec::new);
        match topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partition_indexes.push(partition),
            None => topics.push(OffsetFetchTopic {
                name: topic.to_string(),
                partition_indexes: vec![partition],
            }),
        }
    }
}

impl Encodable for OffsetFetchRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.group_id.encode(buffer)?;
        let topics = match (&self.topics, version) {
            (None, v) if v < 2 => Some(&[][..]),
            (topics, _) => topics.as_deref(),
        };
        encode_nullable_array(buffer, topics, |buffer, t| {
            t.name.encode(buffer)?;
            t.partition_indexes.encode(buffer)
        })
    }
}

impl Decodable for OffsetFetchRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        fn topic(input: NomBytes) -> IResult<NomBytes, OffsetFetchTopic> {
            let (input, name) = parse_string(input)?;
            let (input, partition_indexes) = parse_array(be_i32::<NomBytes, NomError>)(input)?;
            Ok((
                input,
                OffsetFetchTopic {
                    name,
                    partition_indexes,
                },
            ))
        }
        let (input, group_id) = parse_string(input)?;
        let (input, topics) = parse_nullable_array(topic)(input)?;
        Ok((input, OffsetFetchRequest { group_id, topics }))
    }
}

impl Request for OffsetFetchRequest {
    type Response = OffsetFetchResponse;
    const KEY: ApiKey = ApiKey::OffsetFetch;
    const MAX_VERSION: i16 = 5;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(FETCH_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OffsetFetchResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<OffsetFetchTopicResponse>,
    /// Group level error, v2 and later.
    pub error_code: KafkaCode,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct OffsetFetchTopicResponse {
    pub name: String,
    pub partitions: Vec<OffsetFetchPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetFetchPartitionResponse {
    pub partition_index: i32,
    pub committed_offset: i64,
    pub committed_leader_epoch: i32,
    pub metadata: Option<String>,
    pub error_code: KafkaCode,
}

impl Default for OffsetFetchPartitionResponse {
    fn default() -> Self {
        Self {
            partition_index: 0,
            committed_offset: NO_COMMITTED_OFFSET,
            committed_leader_epoch: -1,
            metadata: None,
            error_code: KafkaCode::None,
        }
    }
}

impl OffsetFetchResponse {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&OffsetFetchPartitionResponse> {
        self.topics
            .iter()
            .find(|t| t.name == topic)?
            .partitions
            .iter()
            .find(|p| p.partition_index == partition)
    }

    pub fn add_partition(&mut self, topic: &str, response: OffsetFetchPartitionResponse) {
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(response),
            None => self.topics.push(OffsetFetchTopicResponse {
                name: topic.to_string(),
                partitions: vec![response],
            }),
        }
    }
}

impl Encodable for OffsetFetchResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 3 {
            self.throttle_time_ms.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                p.committed_offset.encode(buffer)?;
                if version >= 5 {
                    p.committed_leader_epoch.encode(buffer)?;
                }
                p.metadata.as_deref().encode(buffer)?;
                p.error_code.encode(buffer)
            })
        })?;
        if version >= 2 {
            self.error_code.encode(buffer)?;
        }
        Ok(())
    }
}

impl Decodable for OffsetFetchResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = if version >= 3 { be_i32(input)? } else { (input, 0) };
        let partition = move |input: NomBytes| -> IResult<NomBytes, OffsetFetchPartitionResponse> {
            let (input, partition_index) = be_i32(input)?;
            let (input, committed_offset) = be_i64(input)?;
            let (input, committed_leader_epoch) = if version >= 5 { be_i32(input)? } else { (input, -1) };
            let (input, metadata) = parse_nullable_string(input)?;
            let (input, error_code) = parse_kafka_code(input)?;
            Ok((
                input,
                OffsetFetchPartitionResponse {
                    partition_index,
                    committed_offset,
                    committed_leader_epoch,
                    metadata,
                    error_code,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, OffsetFetchTopicResponse> {
            let (input, name) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, OffsetFetchTopicResponse { name, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;
        let (input, error_code) = if version >= 2 {
            parse_kafka_code(input)?
        } else {
            (input, KafkaCode::None)
        };
        Ok((
            input,
            OffsetFetchResponse {
                throttle_time_ms,
                topics,
                error_code,
            },
        ))
    }
}

impl Response for OffsetFetchResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    fn commit() -> OffsetCommitRequest {
        let mut request = OffsetCommitRequest {
            group_id: "g".to_string(),
            generation_id: 3,
            member_id: "m-1".to_string(),
            ..Default::default()
        };
        request.add_partition(
            "t",
            OffsetCommitPartition::new(0, 100, Some("checkpoint".to_string())),
        );
        request.add_partition("t", OffsetCommitPartition::new(1, 5, None));
        request
    }

    #[test]
    fn test_commit_round_trip_every_version() {
        let mut v0 = commit();
        v0.generation_id = -1;
        v0.member_id = String::new();
        assert_round_trip(&v0, 0);

        let mut v1 = commit();
        v1.topics[0].partitions[0].commit_timestamp = 1_600_000_000_000;
        assert_round_trip(&v1, 1);

        let mut retained = commit();
        retained.retention_time_ms = 86_400_000;
        for version in 2..=4 {
            assert_round_trip(&retained, version);
        }
        assert_round_trip(&commit(), 5);

        let mut latest = commit();
        latest.group_instance_id = Some("instance".to_string());
        latest.topics[0].partitions[0].committed_leader_epoch = 2;
        assert_round_trip(&latest, 7);
    }

    #[test]
    fn test_commit_retention_only_in_v2_to_v4() {
        let mut request = commit();
        request.retention_time_ms = 1000;
        let v4 = crate::protocol::encode_body(&request, 4).unwrap();
        let v5 = crate::protocol::encode_body(&request, 5).unwrap();
        assert_eq!(v4.len(), v5.len() + 8);
    }

    #[test]
    fn test_commit_response_round_trip() {
        let mut response = OffsetCommitResponse::default();
        response.add_partition("t", 0, KafkaCode::None);
        response.add_partition("t", 1, KafkaCode::OffsetMetadataTooLarge);
        assert_round_trip(&response, 2);
        response.throttle_time_ms = 4;
        assert_round_trip(&response, 7);
        assert_eq!(
            response.error_for("t", 1),
            Some(KafkaCode::OffsetMetadataTooLarge)
        );
        assert_eq!(response.error_for("t", 9), None);
    }

    #[test]
    fn test_fetch_request_round_trip() {
        let mut request = OffsetFetchRequest::new("g");
        request.add_partition("t", 0);
        request.add_partition("t", 1);
        for version in 0..=5 {
            assert_round_trip(&request, version);
        }
        let all = OffsetFetchRequest {
            group_id: "g".to_string(),
            topics: None,
        };
        assert_round_trip(&all, 2);
    }

    #[test]
    fn test_fetch_response_round_trip() {
        let mut response = OffsetFetchResponse::default();
        response.add_partition(
            "t",
            OffsetFetchPartitionResponse {
                partition_index: 0,
                committed_offset: 100,
                metadata: Some("checkpoint".to_string()),
                ..Default::default()
            },
        );
        response.add_partition("t", OffsetFetchPartitionResponse {
            partition_index: 1,
            ..Default::default()
        });
        assert_round_trip(&response, 1);
        response.error_code = KafkaCode::NotCoordinator;
        assert_round_trip(&response, 2);
        response.throttle_time_ms = 1;
        response.topics[0].partitions[0].committed_leader_epoch = 5;
        assert_round_trip(&response, 5);

        let p = response.partition("t", 1).unwrap();
        assert_eq!(p.committed_offset, NO_COMMITTED_OFFSET);
    }
}
