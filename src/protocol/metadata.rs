//! Metadata API (key 3), versions 0-7.
//!
//! - v1 adds rack, controller id and `is_internal`; a null topic list means
//!   "all topics" (v0 uses an empty list for that)
//! - v2 adds `cluster_id`
//! - v3 adds `throttle_time_ms`
//! - v4 adds `allow_auto_topic_creation`
//! - v5 adds offline replicas
//! - v7 adds the partition leader epoch

use bytes::BufMut;
use nom::{IResult, number::complete::be_i32};
use nombytes::NomBytes;

use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::constants::NO_LEADER;
use crate::encode::{ToByte, encode_as_array, encode_nullable_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{
    parse_array, parse_bool, parse_kafka_code, parse_nullable_array, parse_nullable_string,
    parse_string,
};

const RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_8_2_0,
    KafkaVersion::V0_10_0_0,
    KafkaVersion::V0_10_1_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V1_0_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_1_0_0,
];

type NomError = nom::error::Error<NomBytes>;

// ============================================================================
// Request
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataRequest {
    /// `None` requests every topic.
    pub topics: Option<Vec<String>>,
    pub allow_auto_topic_creation: bool,
}

impl MetadataRequest {
    pub fn all_topics() -> Self {
        Self {
            topics: None,
            allow_auto_topic_creation: false,
        }
    }

    pub fn for_topics<I, S>(topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: Some(topics.into_iter().map(Into::into).collect()),
            allow_auto_topic_creation: false,
        }
    }
}

impl Encodable for MetadataRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        match (&self.topics, version) {
            (None, 0) => encode_as_array::<String, _, _>(buffer, &[], |b, t| t.encode(b))?,
            (topics, _) => encode_nullable_array(buffer, topics.as_deref(), |b, t| t.encode(b))?,
        }
        if version >= 4 {
            self.allow_auto_topic_creation.encode(buffer)?;
        }
        Ok(())
    }
}

impl Decodable for MetadataRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, topics) = parse_nullable_array(parse_string)(input)?;
        let topics = match topics {
            Some(t) if t.is_empty() && version == 0 => None,
            other => other,
        };
        let (input, allow_auto_topic_creation) = if version >= 4 {
            parse_bool(input)?
        } else {
            (input, false)
        };
        Ok((
            input,
            MetadataRequest {
                topics,
                allow_auto_topic_creation,
            },
        ))
    }
}

impl Request for MetadataRequest {
    type Response = MetadataResponse;
    const KEY: ApiKey = ApiKey::Metadata;
    const MAX_VERSION: i16 = 7;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

// ============================================================================
// Response
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataResponse {
    pub throttle_time_ms: i32,
    pub brokers: Vec<MetadataBroker>,
    pub cluster_id: Option<String>,
    pub controller_id: i32,
    pub topics: Vec<MetadataTopic>,
}

impl Default for MetadataResponse {
    fn default() -> Self {
        Self {
            throttle_time_ms: 0,
            brokers: Vec::new(),
            cluster_id: None,
            controller_id: NO_LEADER,
            topics: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MetadataBroker {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
    pub rack: Option<String>,
}

impl MetadataBroker {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataTopic {
    pub error_code: KafkaCode,
    pub name: String,
    pub is_internal: bool,
    pub partitions: Vec<MetadataPartition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPartition {
    pub error_code: KafkaCode,
    pub partition_index: i32,
    pub leader_id: i32,
    pub leader_epoch: i32,
    pub replica_nodes: Vec<i32>,
    pub isr_nodes: Vec<i32>,
    pub offline_replicas: Vec<i32>,
}

impl Default for MetadataPartition {
    fn default() -> Self {
        Self {
            error_code: KafkaCode::None,
            partition_index: 0,
            leader_id: NO_LEADER,
            leader_epoch: -1,
            replica_nodes: Vec::new(),
            isr_nodes: Vec::new(),
            offline_replicas: Vec::new(),
        }
    }
}

impl Encodable for MetadataResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 3 {
            self.throttle_time_ms.encode(buffer)?;
        }
        encode_as_array(buffer, &self.brokers, |buffer, b| {
            b.node_id.encode(buffer)?;
            b.host.encode(buffer)?;
            b.port.encode(buffer)?;
            if version >= 1 {
                b.rack.as_deref().encode(buffer)?;
            }
            Ok(())
        })?;
        if version >= 2 {
            self.cluster_id.as_deref().encode(buffer)?;
        }
        if version >= 1 {
            self.controller_id.encode(buffer)?;
        }
        encode_as_array(buffer, &self.topics, |buffer, t| {
            t.error_code.encode(buffer)?;
            t.name.encode(buffer)?;
            if version >= 1 {
                t.is_internal.encode(buffer)?;
            }
            encode_as_array(buffer, &t.partitions, |buffer, p| {
                p.error_code.encode(buffer)?;
                p.partition_index.encode(buffer)?;
                p.leader_id.encode(buffer)?;
                if version >= 7 {
                    p.leader_epoch.encode(buffer)?;
                }
                p.replica_nodes.encode(buffer)?;
                p.isr_nodes.encode(buffer)?;
                if version >= 5 {
                    p.offline_replicas.encode(buffer)?;
                }
                Ok(())
            })
        })
    }
}

impl Decodable for MetadataResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = if version >= 3 { be_i32(input)? } else { (input, 0) };
        let broker = move |input: NomBytes| -> IResult<NomBytes, MetadataBroker> {
            let (input, node_id) = be_i32(input)?;
            let (input, host) = parse_string(input)?;
            let (input, port) = be_i32(input)?;
            let (input, rack) = if version >= 1 { parse_nullable_string(input)? } else { (input, None) };
            Ok((
                input,
                MetadataBroker {
                    node_id,
                    host,
                    port,
                    rack,
                },
            ))
        };
        let (input, brokers) = parse_array(broker)(input)?;
        let (input, cluster_id) = if version >= 2 { parse_nullable_string(input)? } else { (input, None) };
        let (input, controller_id) = if version >= 1 { be_i32(input)? } else { (input, NO_LEADER) };

        let partition = move |input: NomBytes| -> IResult<NomBytes, MetadataPartition> {
            let mut int_array = parse_array(be_i32::<NomBytes, NomError>);
            let (input, error_code) = parse_kafka_code(input)?;
            let (input, partition_index) = be_i32(input)?;
            let (input, leader_id) = be_i32(input)?;
            let (input, leader_epoch) = if version >= 7 { be_i32(input)? } else { (input, -1) };
            let (input, replica_nodes) = int_array(input)?;
            let (input, isr_nodes) = int_array(input)?;
            let (input, offline_replicas) = if version >= 5 { int_array(input)? } else { (input, Vec::new()) };
            Ok((
                input,
                MetadataPartition {
                    error_code,
                    partition_index,
                    leader_id,
                    leader_epoch,
                    replica_nodes,
                    isr_nodes,
                    offline_replicas,
                },
            ))
        };
        let topic = move |input: NomBytes| -> IResult<NomBytes, MetadataTopic> {
            let (input, error_code) = parse_kafka_code(input)?;
            let (input, name) = parse_string(input)?;
            let (input, is_internal) = if version >= 1 { parse_bool(input)? } else { (input, false) };
            let (input, partitions) = parse_array(partition)(input)?;
            Ok((
                input,
                MetadataTopic {
                    error_code,
                    name,
                    is_internal,
                    partitions,
                },
            ))
        };
        let (input, topics) = parse_array(topic)(input)?;

        Ok((
            input,
            MetadataResponse {
                throttle_time_ms,
                brokers,
                cluster_id,
                controller_id,
                topics,
            },
        ))
    }
}

impl Response for MetadataResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    fn response() -> MetadataResponse {
        MetadataResponse {
            throttle_time_ms: 0,
            brokers: vec![
                MetadataBroker {
                    node_id: 1,
                    host: "b1".to_string(),
                    port: 9092,
                    rack: Some("r1".to_string()),
                },
                MetadataBroker {
                    node_id: 2,
                    host: "b2".to_string(),
                    port: 9093,
                    rack: None,
                },
            ],
            cluster_id: Some("cluster".to_string()),
            controller_id: 1,
            topics: vec![MetadataTopic {
                error_code: KafkaCode::None,
                name: "t".to_string(),
                is_internal: false,
                partitions: vec![MetadataPartition {
                    partition_index: 0,
                    leader_id: 1,
                    leader_epoch: 3,
                    replica_nodes: vec![1, 2],
                    isr_nodes: vec![1],
                    offline_replicas: vec![2],
                    ..Default::default()
                }],
            }],
        }
    }

    #[test]
    fn test_request_topic_list_semantics() {
        assert_round_trip(&MetadataRequest::all_topics(), 0);
        assert_round_trip(&MetadataRequest::all_topics(), 1);
        assert_round_trip(&MetadataRequest::for_topics(["a", "b"]), 0);

        let bytes = crate::protocol::encode_body(&MetadataRequest::all_topics(), 0).unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 0]);
        let bytes = crate::protocol::encode_body(&MetadataRequest::all_topics(), 1).unwrap();
        assert_eq!(bytes.as_ref(), &[0xFF, 0xFF, 0xFF, 0xFF]);

        let mut auto = MetadataRequest::for_topics(["a"]);
        auto.allow_auto_topic_creation = true;
        assert_round_trip(&auto, 4);
    }

    #[test]
    fn test_response_round_trip_latest() {
        let mut response = response();
        response.throttle_time_ms = 9;
        assert_round_trip(&response, 7);
    }

    #[test]
    fn test_response_round_trip_v0() {
        let mut response = response();
        response.brokers[0].rack = None;
        response.cluster_id = None;
        response.controller_id = NO_LEADER;
        let partition = &mut response.topics[0].partitions[0];
        partition.leader_epoch = -1;
        partition.offline_replicas.clear();
        assert_round_trip(&response, 0);
    }

    #[test]
    fn test_unknown_error_code_decodes_as_unknown() {
        let mut response = response();
        response.topics[0].error_code = KafkaCode::Unknown;
        let bytes = crate::protocol::encode_body(&response, 7).unwrap();
        let decoded: MetadataResponse = crate::protocol::decode_body(bytes, 7).unwrap();
        assert_eq!(decoded.topics[0].error_code, KafkaCode::Unknown);
    }
}
