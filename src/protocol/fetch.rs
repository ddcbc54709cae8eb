//! Fetch API (key 1), versions 0-11.
//!
//! - v1 adds `throttle_time_ms` to the response
//! - v3 adds a request-wide `max_bytes`
//! - v4 adds `isolation_level`, `last_stable_offset` and aborted transactions
//! - v5 adds `log_start_offset`
//! - v7 adds incremental fetch sessions (sent as a sessionless full fetch here)
//! - v9 adds `current_leader_epoch`
//! - v11 adds `rack_id` and `preferred_read_replica`

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    number::complete::{be_i8, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::encode::{ToByte, encode_as_array, encode_nullable_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{
    parse_array, parse_kafka_code, parse_nullable_array, parse_nullable_bytes, parse_string,
};

const RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_10_0_0,
    KafkaVersion::V0_10_1_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V1_0_0_0,
    KafkaVersion::V1_1_0_0,
    KafkaVersion::V1_1_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_1_0_0,
    KafkaVersion::V2_1_0_0,
    KafkaVersion::V2_3_0_0,
];

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub replica_id: i32,
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub max_bytes: i32,
    pub isolation_level: i8,
    pub session_id: i32,
    pub session_epoch: i32,
    pub topics: Vec<FetchTopic>,
    pub forgotten_topics: Vec<ForgottenTopic>,
    pub rack_id: String,
}

impl Default for FetchRequest {
    fn default() -> Self {
        Self {
            replica_id: -1,
            max_wait_ms: 0,
            min_bytes: 1,
            max_bytes: i32::MAX,
            isolation_level: 0,
            session_id: 0,
            session_epoch: -1,
            topics: Vec::new(),
            forgotten_topics: Vec::new(),
            rack_id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchTopic {
    pub topic: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPartition {
    pub partition: i32,
    pub current_leader_epoch: i32,
    pub fetch_offset: i64,
    pub log_start_offset: i64,
    pub partition_max_bytes: i32,
}

impl FetchPartition {
    pub fn new(partition: i32, fetch_offset: i64, partition_max_bytes: i32) -> Self {
        Self {
            partition,
            current_leader_epoch: -1,
            fetch_offset,
            log_start_offset: -1,
            partition_max_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ForgottenTopic {
    pub topic: String,
    pub partitions: Vec<i32>,
}

impl FetchRequest {
    pub fn add_partition(&mut self, topic: &str, partition: FetchPartition) {
        match self.topics.iter_mut().find(|t| t.topic == topic) {
            Some(t) => t.partitions.push(partition),
            None => self.topics.push(FetchTopic {
                topic: topic.to_string(),
                partitions: vec![partition],
            }),
        }
    }
}

impl Encodable for FetchRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.replica_id.encode(buffer)?;
        self.max_wait_ms.encode(buffer)?;
        self.min_bytes.encode(buffer)?;
        if version >= 3 {
            self.max_bytes.encode(buffer)?;
        }
        if version >= 4 {
            self.isolation_level.encode(buffer)?;
        }
        if version >= 7 {
            self.session_id.encode(buffer)?;
            self.session_epoch.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.topic.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition.encode(buffer)?;
                if version >= 9 {
                    p.current_leader_epoch.encode(buffer)?;
                }
                p.fetch_offset.encode(buffer)?;
                if version >= 5 {
                    p.log_start_offset.encode(buffer)?;
                }
                p.partition_max_bytes.encode(buffer)
            })
        })?;
        if version >= 7 {
            encode_as_array(buffer, &self.forgotten_topics, |buffer, f| {
                f.topic.encode(buffer)?;
                f.partitions.encode(buffer)
            })?;
        }
        if version >= 11 {
            self.rack_id.encode(buffer)?;
        }
        Ok(())
    }
}

impl Decodable for FetchRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let defaults = FetchRequest::default();
        let (input, replica_id) = be_i32(input)?;
        let (input, max_wait_ms) = be_i32(input)?;
        let (input, min_bytes) = be_i32(input)?;
        let (input, max_bytes) = if version >= 3 { be_i32(input)? } else { (input, defaults.max_bytes) };
        let (input, isolation_level) = if version >= 4 { be_i8(input)? } else { (input, 0) };
        let (input, session_id, session_epoch) = if version >= 7 {
            let (input, id) = be_i32(input)?;
            let (input, epoch) = be_i32(input)?;
            (input, id, epoch)
        } else {
            (input, defaults.session_id, defaults.session_epoch)
        };

        let partition = move |input: NomBytes| -> IResult<NomBytes, FetchPartition> {
            let (input, partition) = be_i32(input)?;
            let (input, current_leader_epoch) = if version >= 9 { be_i32(input)? } else { (input, -1) };
            let (input, fetch_offset) = be_i64(input)?;
            let (input, log_start_offset) = if version >= 5 { be_i64(input)? } else { (input, -1) };
            let (input, partition_max_bytes) = be_i32(input)?;
            Ok((
                input,
                FetchPartition {
                    partition,
                    current_leader_epoch,
                    fetch_offset,
                    log_start_offset,
                    partition_max_bytes,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, FetchTopic> {
            let (input, topic) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, FetchTopic { topic, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;
        let (input, forgotten_topics) = if version >= 7 {
            parse_array(parse_forgotten_topic)(input)?
        } else {
            (input, Vec::new())
        };
        let (input, rack_id) = if version >= 11 { parse_string(input)? } else { (input, String::new()) };

        Ok((
            input,
            FetchRequest {
                replica_id,
                max_wait_ms,
                min_bytes,
                max_bytes,
                isolation_level,
                session_id,
                session_epoch,
                topics,
                forgotten_topics,
                rack_id,
            },
        ))
    }
}

fn parse_forgotten_topic(input: NomBytes) -> IResult<NomBytes, ForgottenTopic> {
    let (input, topic) = parse_string(input)?;
    let (input, partitions) = parse_array(be_i32::<NomBytes, nom::error::Error<NomBytes>>)(input)?;
    Ok((input, ForgottenTopic { topic, partitions }))
}

impl Request for FetchRequest {
    type Response = FetchResponse;
    const KEY: ApiKey = ApiKey::Fetch;
    const MAX_VERSION: i16 = 11;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub session_id: i32,
    pub topics: Vec<FetchableTopicResponse>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchableTopicResponse {
    pub topic: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedTransaction {
    pub producer_id: i64,
    pub first_offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchPartitionResponse {
    pub partition: i32,
    pub error_code: KafkaCode,
    pub high_watermark: i64,
    pub last_stable_offset: i64,
    pub log_start_offset: i64,
    /// `None` when the broker sent a null array.
    pub aborted_transactions: Option<Vec<AbortedTransaction>>,
    pub preferred_read_replica: i32,
    pub records: Option<Bytes>,
}

impl Default for FetchPartitionResponse {
    fn default() -> Self {
        Self {
            partition: 0,
            error_code: KafkaCode::None,
            high_watermark: -1,
            last_stable_offset: -1,
            log_start_offset: -1,
            aborted_transactions: None,
            preferred_read_replica: -1,
            records: None,
        }
    }
}

impl FetchResponse {
    pub fn partition(&self, topic: &str, partition: i32) -> Option<&FetchPartitionResponse> {
        self.topics
            .iter()
            .find(|t| t.topic == topic)?
            .partitions
            .iter()
            .find(|p| p.partition == partition)
    }

    pub fn add_partition(&mut self, topic: &str, response: FetchPartitionResponse) {
        match self.topics.iter_mut().find(|t| t.topic == topic) {
            Some(t) => t.partitions.push(response),
            None => self.topics.push(FetchableTopicResponse {
                topic: topic.to_string(),
                partitions: vec![response],
            }),
        }
    }
}

impl Encodable for FetchResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        if version >= 7 {
            self.error_code.encode(buffer)?;
            self.session_id.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, topic| {
            topic.topic.encode(buffer)?;
            encode_as_array(buffer, &topic.partitions, |buffer, p| {
                p.partition.encode(buffer)?;
                p.error_code.encode(buffer)?;
                p.high_watermark.encode(buffer)?;
                if version >= 4 {
                    p.last_stable_offset.encode(buffer)?;
                }
                if version >= 5 {
                    p.log_start_offset.encode(buffer)?;
                }
                if version >= 4 {
                    encode_nullable_array(
                        buffer,
                        p.aborted_transactions.as_deref(),
                        |buffer, txn| {
                            txn.producer_id.encode(buffer)?;
                            txn.first_offset.encode(buffer)
                        },
                    )?;
                }
                if version >= 11 {
                    p.preferred_read_replica.encode(buffer)?;
                }
                p.records.encode(buffer)
            })
        })
    }
}

impl Decodable for FetchResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = if version >= 1 { be_i32(input)? } else { (input, 0) };
        let (input, error_code, session_id) = if version >= 7 {
            let (input, code) = parse_kafka_code(input)?;
            let (input, id) = be_i32(input)?;
            (input, code, id)
        } else {
            (input, KafkaCode::None, 0)
        };

        let partition = move |input: NomBytes| -> IResult<NomBytes, FetchPartitionResponse> {
            let (input, partition) = be_i32(input)?;
            let (input, error_code) = parse_kafka_code(input)?;
            let (input, high_watermark) = be_i64(input)?;
            let (input, last_stable_offset) = if version >= 4 { be_i64(input)? } else { (input, -1) };
            let (input, log_start_offset) = if version >= 5 { be_i64(input)? } else { (input, -1) };
            let (input, aborted_transactions) = if version >= 4 {
                parse_nullable_array(parse_aborted_transaction)(input)?
            } else {
                (input, None)
            };
            let (input, preferred_read_replica) = if version >= 11 { be_i32(input)? } else { (input, -1) };
            let (input, records) = parse_nullable_bytes(input)?;
            Ok((
                input,
                FetchPartitionResponse {
                    partition,
                    error_code,
                    high_watermark,
                    last_stable_offset,
                    log_start_offset,
                    aborted_transactions,
                    preferred_read_replica,
                    records,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, FetchableTopicResponse> {
            let (input, topic) = parse_string(input)?;
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((input, FetchableTopicResponse { topic, partitions }))
        };
        let (input, topics) = parse_array(topic)(input)?;

        Ok((
            input,
            FetchResponse {
                throttle_time_ms,
                error_code,
                session_id,
                topics,
            },
        ))
    }
}

fn parse_aborted_transaction(input: NomBytes) -> IResult<NomBytes, AbortedTransaction> {
    let (input, producer_id) = be_i64(input)?;
    let (input, first_offset) = be_i64(input)?;
    Ok((
        input,
        AbortedTransaction {
            producer_id,
            first_offset,
        },
    ))
}

impl Response for FetchResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    fn request() -> FetchRequest {
        let mut request = FetchRequest {
            max_wait_ms: 500,
            min_bytes: 1,
            max_bytes: 52_428_800,
            isolation_level: 1,
            rack_id: "rack-a".to_string(),
            ..Default::default()
        };
        request.add_partition("events", FetchPartition::new(0, 100, 1 << 20));
        request.add_partition("events", FetchPartition::new(3, 7, 1 << 20));
        request
    }

    #[test]
    fn test_request_round_trip_latest() {
        let mut request = request();
        request.topics[0].partitions[0].current_leader_epoch = 4;
        request.topics[0].partitions[0].log_start_offset = 0;
        request.forgotten_topics = vec![ForgottenTopic {
            topic: "old".to_string(),
            partitions: vec![1, 2],
        }];
        assert_round_trip(&request, 11);
    }

    #[test]
    fn test_request_round_trip_v0() {
        let mut request = request();
        request.max_bytes = i32::MAX;
        request.isolation_level = 0;
        request.rack_id = String::new();
        assert_round_trip(&request, 0);
    }

    #[test]
    fn test_response_round_trip() {
        let mut response = FetchResponse {
            throttle_time_ms: 5,
            ..Default::default()
        };
        response.add_partition(
            "events",
            FetchPartitionResponse {
                partition: 0,
                high_watermark: 120,
                last_stable_offset: 110,
                log_start_offset: 0,
                aborted_transactions: Some(vec![AbortedTransaction {
                    producer_id: 9,
                    first_offset: 101,
                }]),
                records: Some(Bytes::from_static(b"opaque")),
                ..Default::default()
            },
        );
        for version in 5..=10 {
            assert_round_trip(&response, version);
        }
        response.topics[0].partitions[0].preferred_read_replica = 2;
        assert_round_trip(&response, 11);
    }

    #[test]
    fn test_null_aborted_transactions_preserved() {
        let mut response = FetchResponse::default();
        response.add_partition(
            "t",
            FetchPartitionResponse {
                high_watermark: 1,
                last_stable_offset: 1,
                records: Some(Bytes::new()),
                ..Default::default()
            },
        );
        assert_round_trip(&response, 4);
        let decoded: FetchResponse =
            crate::protocol::decode_body(crate::protocol::encode_body(&response, 4).unwrap(), 4)
                .unwrap();
        assert_eq!(decoded.partition("t", 0).unwrap().aborted_transactions, None);
    }

    #[test]
    fn test_error_code_decoded() {
        let mut response = FetchResponse::default();
        response.add_partition(
            "t",
            FetchPartitionResponse {
                error_code: KafkaCode::OffsetOutOfRange,
                ..Default::default()
            },
        );
        let bytes = crate::protocol::encode_body(&response, 0).unwrap();
        let decoded: FetchResponse = crate::protocol::decode_body(bytes, 0).unwrap();
        assert_eq!(
            decoded.partition("t", 0).unwrap().error_code,
            KafkaCode::OffsetOutOfRange
        );
    }
}
