//! Produce API (key 0), versions 0-7.
//!
//! - v3 adds `transactional_id` and requires RecordBatch (magic 2) payloads
//! - v1 adds `throttle_time_ms` to the response
//! - v2 adds `log_append_time` to each partition response
//! - v5 adds `log_start_offset` to each partition response
//!
//! Record payloads are carried as opaque bytes; the producer encodes them
//! with [`crate::protocol::records`] before building the request.

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{
    ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for,
};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_kafka_code, parse_nullable_bytes, parse_nullable_string, parse_string};

const RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_10_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V1_0_0_0,
    KafkaVersion::V1_0_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_1_0_0,
];

/// Magic byte the producer must use for a given Produce version.
pub fn record_magic_for_version(version: i16) -> i8 {
    match version {
        0 | 1 => 0,
        2 => 1,
        _ => 2,
    }
}

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProduceRequest {
    pub transactional_id: Option<String>,
    pub acks: i16,
    pub timeout_ms: i32,
    pub topics: Vec<ProduceTopicData>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProduceTopicData {
    pub name: String,
    pub partitions: Vec<ProducePartitionData>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProducePartitionData {
    pub index: i32,
    pub records: Option<Bytes>,
}

impl ProduceRequest {
    /// Add a partition payload, grouping by topic in insertion order.
    pub fn add_records(&mut self, topic: &str, partition: i32, records: Bytes) {
        let data = ProducePartitionData {
            index: partition,
            records: Some(records),
        };
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(data),
            None => self.topics.push(ProduceTopicData {
                name: topic.to_string(),
                partitions: vec![data],
            }),
        }
    }

    pub fn partition_count(&self) -> usize {
        self.topics.iter().map(|t| t.partitions.len()).sum()
    }
}

impl Encodable for ProduceRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 3 {
            self.transactional_id.as_deref().encode(buffer)?;
        }
        self.acks.encode(buffer)?;
        self.timeout_ms.encode(buffer)?;
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.index.encode(buffer)?;
                p.records.encode(buffer)
            })
        })
    }
}

impl Decodable for ProduceRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, transactional_id) = if version >= 3 {
            parse_nullable_string(input)?
        } else {
            (input, None)
        };
        let (input, acks) = be_i16(input)?;
        let (input, timeout_ms) = be_i32(input)?;
        let (input, topics) = parse_array(parse_produce_topic)(input)?;
        Ok((
            input,
            ProduceRequest {
                transactional_id,
                acks,
                timeout_ms,
                topics,
            },
        ))
    }
}

fn parse_produce_topic(input: NomBytes) -> IResult<NomBytes, ProduceTopicData> {
    let (input, name) = parse_string(input)?;
    let (input, partitions) = parse_array(parse_produce_partition)(input)?;
    Ok((input, ProduceTopicData { name, partitions }))
}

fn parse_produce_partition(input: NomBytes) -> IResult<NomBytes, ProducePartitionData> {
    let (input, index) = be_i32(input)?;
    let (input, records) = parse_nullable_bytes(input)?;
    Ok((input, ProducePartitionData { index, records }))
}

impl Request for ProduceRequest {
    type Response = ProduceResponse;
    const KEY: ApiKey = ApiKey::Produce;
    const MAX_VERSION: i16 = 7;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }

    /// With `acks = 0` the broker sends nothing back.
    fn expects_response(&self) -> bool {
        self.acks != 0
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: i32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProduceTopicResponse {
    pub name: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducePartitionResponse {
    pub index: i32,
    pub error_code: KafkaCode,
    pub base_offset: i64,
    pub log_append_time_ms: i64,
    pub log_start_offset: i64,
}

impl Default for ProducePartitionResponse {
    fn default() -> Self {
        Self {
            index: 0,
            error_code: KafkaCode::None,
            base_offset: -1,
            log_append_time_ms: -1,
            log_start_offset: -1,
        }
    }
}

impl ProduceResponse {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&ProducePartitionResponse> {
        self.topics
            .iter()
            .find(|t| t.name == topic)?
            .partitions
            .iter()
            .find(|p| p.index == partition)
    }

    pub fn add_partition(&mut self, topic: &str, response: ProducePartitionResponse) {
        match self.topics.iter_mut().find(|t| t.name == topic) {
            Some(t) => t.partitions.push(response),
            None => self.topics.push(ProduceTopicResponse {
                name: topic.to_string(),
                partitions: vec![response],
            }),
        }
    }
}

impl Encodable for ProduceResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.name.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.index.encode(buffer)?;
                p.error_code.encode(buffer)?;
                p.base_offset.encode(buffer)?;
                if version >= 2 {
                    p.log_append_time_ms.encode(buffer)?;
                }
                if version >= 5 {
                    p.log_start_offset.encode(buffer)?;
                }
                Ok(())
            })
        })?;
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        Ok(())
    }
}

impl Decodable for ProduceResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let partition = move |input: NomBytes| -> IResult<NomBytes, ProducePartitionResponse> {
            let (input, index) = be_i32(input)?;
            let (input, error_code) = parse_kafka_code(input)?;
            let (input, base_offset) = be_i64(input)?;
            let (input, log_append_time_ms) = if version >= 2 { be_i64(input)? } else { (input, -1) };
            let (input, log_start_offset) = if version >= 5 { be_i64(input)? } else { (input, -1) };
            Ok((
                input,
                ProducePartitionResponse {
                    index,
                    error_code,
                    base_offset,
                    log_append_time_ms,
                    log_start_offset,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, ProduceTopicResponse> {
            let (input, name) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, ProduceTopicResponse { name, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;
        let (input, throttle_time_ms) = if version >= 1 { be_i32(input)? } else { (input, 0) };
        Ok((
            input,
            ProduceResponse {
                topics,
                throttle_time_ms,
            },
        ))
    }
}

impl Response for ProduceResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    fn request() -> ProduceRequest {
        let mut request = ProduceRequest {
            transactional_id: Some("txn".to_string()),
            acks: -1,
            timeout_ms: 1500,
            topics: vec![],
        };
        request.add_records("t", 0, Bytes::from_static(b"batch-0"));
        request.add_records("t", 1, Bytes::from_static(b"batch-1"));
        request.add_records("u", 0, Bytes::from_static(b"batch-2"));
        request
    }

    #[test]
    fn test_request_groups_by_topic() {
        let request = request();
        assert_eq!(request.topics.len(), 2);
        assert_eq!(request.partition_count(), 3);
    }

    #[test]
    fn test_request_round_trip() {
        for version in 3..=7 {
            assert_round_trip(&request(), version);
        }
        let mut legacy = request();
        legacy.transactional_id = None;
        for version in 0..=2 {
            assert_round_trip(&legacy, version);
        }
    }

    #[test]
    fn test_request_v0_bytes() {
        let mut request = ProduceRequest {
            acks: 1,
            timeout_ms: 100,
            ..Default::default()
        };
        request.add_records("t", 2, Bytes::from_static(&[0xAB]));
        let bytes = crate::protocol::encode_body(&request, 0).unwrap();
        let expected: Vec<u8> = vec![
            0x00, 0x01, // acks
            0x00, 0x00, 0x00, 0x64, // timeout
            0x00, 0x00, 0x00, 0x01, // topics
            0x00, 0x01, b't', //
            0x00, 0x00, 0x00, 0x01, // partitions
            0x00, 0x00, 0x00, 0x02, // index
            0x00, 0x00, 0x00, 0x01, 0xAB, // records
        ];
        assert_eq!(bytes.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_response_round_trip() {
        let mut response = ProduceResponse {
            throttle_time_ms: 12,
            ..Default::default()
        };
        response.add_partition(
            "t",
            ProducePartitionResponse {
                index: 0,
                error_code: KafkaCode::NotLeaderForPartition,
                base_offset: 42,
                log_append_time_ms: 7,
                log_start_offset: 3,
            },
        );
        assert_round_trip(&response, 7);

        let mut v0 = response.clone();
        v0.throttle_time_ms = 0;
        v0.topics[0].partitions[0].log_append_time_ms = -1;
        v0.topics[0].partitions[0].log_start_offset = -1;
        assert_round_trip(&v0, 0);
        assert_eq!(
            v0.partition("t", 0).unwrap().error_code,
            KafkaCode::NotLeaderForPartition
        );
    }

    #[test]
    fn test_acks_zero_expects_no_response() {
        let request = ProduceRequest {
            acks: 0,
            ..Default::default()
        };
        assert!(!request.expects_response());
        assert_eq!(ProduceRequest::required_version(3), KafkaVersion::V0_11_0_0);
        assert_eq!(record_magic_for_version(2), 1);
    }
}
