//! ListOffsets API (key 2), versions 0-5.
//!
//! Resolves a timestamp (or the `-1` newest / `-2` oldest sentinels) to an
//! offset. Version 0 returns a list of offsets; later versions return a
//! single offset and its timestamp.

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i8, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_kafka_code, parse_string};

const RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_10_1_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_1_0_0,
    KafkaVersion::V2_2_0_0,
];

#[derive(Debug, Clone, PartialEq)]
pub struct ListOffsetsRequest {
    pub replica_id: i32,
    pub isolation_level: i8,
    pub topics: Vec<ListOffsetsTopic>,
}

impl Default for ListOffsetsRequest {
    fn default() -> Self {
        Self {
            replica_id: -1,
            isolation_level: 0,
            topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListOffsetsTopic {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListOffsetsPartition {
    pub partition_index: i32,
    pub current_leader_epoch: i32,
    pub timestamp: i64,
    /// Only sent at version 0.
    pub max_num_offsets: i32,
}

impl ListOffsetsRequest {
    pub fn add_partition(&mut self, topic: &str, partition: i32, timestamp: i64) {
        let entry = ListOffsetsPartition {
            partition_index: partition,
            current_leader_epoch: -1,
            timestamp,
            max_num_offsets: 1,
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(entry),
            None => self.topics.push(ListOffsetsTopic {
                name: topic.to_string(),
                partitions: vec![entry],
            }),
        }
    }
}

impl Encodable for ListOffsetsRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.replica_id.encode(buffer)?;
        if version >= 2 {
            self.isolation_level.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                if version >= 4 {
                    p.current_leader_epoch.encode(buffer)?;
                }
                p.timestamp.encode(buffer)?;
                if version == 0 {
                    p.max_num_offsets.encode(buffer)?;
                }
                Ok(())
            })
        })
    }
}

impl Decodable for ListOffsetsRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, replica_id) = be_i32(input)?;
        let (input, isolation_level) = if version >= 2 { be_i8(input)? } else { (input, 0) };
        let partition = move |input: NomBytes| -> IResult<NomBytes, ListOffsetsPartition> {
            let (input, partition_index) = be_i32(input)?;
            let (input, current_leader_epoch) = if version >= 4 { be_i32(input)? } else { (input, -1) };
            let (input, timestamp) = be_i64(input)?;
            let (input, max_num_offsets) = if version == 0 { be_i32(input)? } else { (input, 1) };
            Ok((
                input,
                ListOffsetsPartition {
                    partition_index,
                    current_leader_epoch,
                    timestamp,
                    max_num_offsets,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, ListOffsetsTopic> {
            let (input, name) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, ListOffsetsTopic { name, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;
        Ok((
            input,
            ListOffsetsRequest {
                replica_id,
                isolation_level,
                topics,
            },
        ))
    }
}

impl Request for ListOffsetsRequest {
    type Response = ListOffsetsResponse;
    const KEY: ApiKey = ApiKey::ListOffsets;
    const MAX_VERSION: i16 = 5;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListOffsetsResponse {
    pub throttle_time_ms: i32,
    pub topics: Vec<ListOffsetsTopicResponse>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListOffsetsTopicResponse {
    pub name: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListOffsetsPartitionResponse {
    pub partition_index: i32,
    pub error_code: KafkaCode,
    /// Version 0 only.
    pub old_style_offsets: Vec<i64>,
    pub timestamp: i64,
    pub offset: i64,
    pub leader_epoch: i32,
}

impl Default for ListOffsetsPartitionResponse {
    fn default() -> Self {
        Self {
            partition_index: 0,
            error_code: KafkaCode::None,
            old_style_offsets: Vec::new(),
            timestamp: -1,
            offset: -1,
            leader_epoch: -1,
        }
    }
}

impl ListOffsetsPartitionResponse {
    /// The resolved offset regardless of response version.
    pub fn resolved_offset(&self) -> Option<i64> {
        if self.offset >= 0 {
            Some(self.offset)
        } else {
            self.old_style_offsets.first().copied()
        }
    }
}

impl ListOffsetsResponse {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&ListOffsetsPartitionResponse> {
        self.topics
            .iter()
            .find(|t| t.name == topic)?
            .partitions
            .iter()
            .find(|p| p.partition_index == partition)
    }

    pub fn add_partition(&mut self, topic: &str, response: ListOffsetsPartitionResponse) {
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(response),
            None => self.topics.push(ListOffsetsTopicResponse {
                name: topic.to_string(),
                partitions: vec![response],
            }),
        }
    }
}

impl Encodable for ListOffsetsResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 2 {
            self.throttle_time_ms.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition_index.encode(buffer)?;
                p.error_code.encode(buffer)?;
                if version == 0 {
                    p.old_style_offsets.encode(buffer)?;
                } else {
                    p.timestamp.encode(buffer)?;
                    p.offset.encode(buffer)?;
                }
                if version >= 4 {
                    p.leader_epoch.encode(buffer)?;
                }
                Ok(())
            })
        })
    }
}

impl Decodable for ListOffsetsResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = if version >= 2 { be_i32(input)? } else { (input, 0) };
        let partition = move |input: NomBytes| -> IResult<NomBytes, ListOffsetsPartitionResponse> {
            let (input, partition_index) = be_i32(input)?;
            let (input, error_code) = parse_kafka_code(input)?;
            let (input, old_style_offsets, timestamp, offset) = if version == 0 {
                let (input, offsets) =
                    parse_array(be_i64::<NomBytes, nom::error::Error<NomBytes>>)(input)?;
                (input, offsets, -1, -1)
            } else {
                let (input, timestamp) = be_i64(input)?;
                let (input, offset) = be_i64(input)?;
                (input, Vec::new(), timestamp, offset)
            };
            let (input, leader_epoch) = if version >= 4 { be_i32(input)? } else { (input, -1) };
            Ok((
                input,
                ListOffsetsPartitionResponse {
                    partition_index,
                    error_code,
                    old_style_offsets,
                    timestamp,
                    offset,
                    leader_epoch,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, ListOffsetsTopicResponse> {
            let (input, name) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, ListOffsetsTopicResponse { name, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;
        Ok((
            input,
            ListOffsetsResponse {
                throttle_time_ms,
                topics,
            },
        ))
    }
}

impl Response for ListOffsetsResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    #[test]
    fn test_request_round_trip() {
        let mut request = ListOffsetsRequest::default();
        request.add_partition("t", 0, -2);
        request.add_partition("t", 1, -1);
        for version in 0..=5 {
            assert_round_trip(&request, version);
        }
    }

    #[test]
    fn test_v0_response_uses_offset_list() {
        let mut response = ListOffsetsResponse::default();
        response.add_partition(
            "t",
            ListOffsetsPartitionResponse {
                old_style_offsets: vec![42],
                ..Default::default()
            },
        );
        assert_round_trip(&response, 0);
        assert_eq!(response.partition("t", 0).unwrap().resolved_offset(), Some(42));
    }

    #[test]
    fn test_v1_response_uses_single_offset() {
        let mut response = ListOffsetsResponse {
            throttle_time_ms: 0,
            ..Default::default()
        };
        response.add_partition(
            "t",
            ListOffsetsPartitionResponse {
                timestamp: 1000,
                offset: 17,
                ..Default::default()
            },
        );
        assert_round_trip(&response, 1);
        response.throttle_time_ms = 3;
        response.topics[0].partitions[0].leader_epoch = 2;
        assert_round_trip(&response, 5);
        assert_eq!(response.partition("t", 0).unwrap().resolved_offset(), Some(17));
    }

    #[test]
    fn test_v0_request_carries_max_offsets() {
        let mut request = ListOffsetsRequest::default();
        request.add_partition("t", 0, -1);
        let bytes = crate::protocol::encode_body(&request, 0).unwrap();
        assert_eq!(&bytes[bytes.len() - 4..], &1i32.to_be_bytes());
    }
}
