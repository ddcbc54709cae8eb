//! Group membership APIs: FindCoordinator, JoinGroup, Heartbeat, LeaveGroup,
//! SyncGroup, DescribeGroups and ListGroups.
//!
//! Member metadata and assignments are opaque bytes at this layer; the
//! consumer protocol encoding lives in [`super::consumer`].

use bytes::{BufMut, Bytes};
use nom::{
    IResult,
    number::complete::{be_i8, be_i32},
};
use nombytes::NomBytes;

use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bytes, parse_kafka_code, parse_nullable_string, parse_string};

fn throttle(input: NomBytes, present: bool) -> IResult<NomBytes, i32> {
    if present { be_i32(input) } else { Ok((input, 0)) }
}

fn optional_string(input: NomBytes, present: bool) -> IResult<NomBytes, Option<String>> {
    if present {
        parse_nullable_string(input)
    } else {
        Ok((input, None))
    }
}

// ============================================================================
// FindCoordinator
// ============================================================================

const FIND_COORDINATOR_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
];

/// Locate the group (`key_type = 0`) or transaction (`key_type = 1`)
/// coordinator for `key`. Version 0 only knows groups.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindCoordinatorRequest {
    pub key: String,
    pub key_type: i8,
}

impl Encodable for FindCoordinatorRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.key.encode(buffer)?;
        if version >= 1 {
            self.key_type.encode(buffer)?;
        }
        Ok(())
    }
}

impl Decodable for FindCoordinatorRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, key) = parse_string(input)?;
        let (input, key_type) = if version >= 1 { be_i8(input)? } else { (input, 0) };
        Ok((input, FindCoordinatorRequest { key, key_type }))
    }
}

impl Request for FindCoordinatorRequest {
    type Response = FindCoordinatorResponse;
    const KEY: ApiKey = ApiKey::FindCoordinator;
    const MAX_VERSION: i16 = 2;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(FIND_COORDINATOR_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindCoordinatorResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub error_message: Option<String>,
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

impl FindCoordinatorResponse {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Encodable for FindCoordinatorResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        self.error_code.encode(buffer)?;
        if version >= 1 {
            self.error_message.as_deref().encode(buffer)?;
        }
        self.node_id.encode(buffer)?;
        self.host.encode(buffer)?;
        self.port.encode(buffer)
    }
}

impl Decodable for FindCoordinatorResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = throttle(input, version >= 1)?;
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, error_message) = optional_string(input, version >= 1)?;
        let (input, node_id) = be_i32(input)?;
        let (input, host) = parse_string(input)?;
        let (input, port) = be_i32(input)?;
        Ok((
            input,
            FindCoordinatorResponse {
                throttle_time_ms,
                error_code,
                error_message,
                node_id,
                host,
                port,
            },
        ))
    }
}

impl Response for FindCoordinatorResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// JoinGroup
// ============================================================================

const JOIN_GROUP_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_10_1_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_2_0_0,
    KafkaVersion::V2_3_0_0,
];

/// JoinGroup request.
///
/// - v1 adds `rebalance_timeout_ms` (v0 brokers reuse the session timeout)
/// - v5 adds `group_instance_id` for static membership
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub protocol_type: String,
    pub protocols: Vec<JoinGroupProtocol>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinGroupProtocol {
    pub name: String,
    pub metadata: Bytes,
}

impl Encodable for JoinGroupRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.session_timeout_ms.encode(buffer)?;
        if version >= 1 {
            self.rebalance_timeout_ms.encode(buffer)?;
        }
        self.member_id.encode(buffer)?;
        if version >= 5 {
            self.group_instance_id.as_deref().encode(buffer)?;
        }
        self.protocol_type.encode(buffer)?;
        encode_as_array(buffer, &self.protocols, |buffer, p| {
            p.name.encode(buffer)?;
            p.metadata.encode(buffer)
        })
    }
}

fn parse_join_group_protocol(input: NomBytes) -> IResult<NomBytes, JoinGroupProtocol> {
    let (input, name) = parse_string(input)?;
    let (input, metadata) = parse_bytes(input)?;
    Ok((input, JoinGroupProtocol { name, metadata }))
}

impl Decodable for JoinGroupRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, group_id) = parse_string(input)?;
        let (input, session_timeout_ms) = be_i32(input)?;
        let (input, rebalance_timeout_ms) = if version >= 1 {
            be_i32(input)?
        } else {
            (input, session_timeout_ms)
        };
        let (input, member_id) = parse_string(input)?;
        let (input, group_instance_id) = optional_string(input, version >= 5)?;
        let (input, protocol_type) = parse_string(input)?;
        let (input, protocols) = parse_array(parse_join_group_protocol)(input)?;
        Ok((
            input,
            JoinGroupRequest {
                group_id,
                session_timeout_ms,
                rebalance_timeout_ms,
                member_id,
                group_instance_id,
                protocol_type,
                protocols,
            },
        ))
    }
}

impl Request for JoinGroupRequest {
    type Response = JoinGroupResponse;
    const KEY: ApiKey = ApiKey::JoinGroup;
    const MAX_VERSION: i16 = 5;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(JOIN_GROUP_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub generation_id: i32,
    pub protocol_name: String,
    pub leader: String,
    pub member_id: String,
    /// Populated only in the leader's response.
    pub members: Vec<JoinGroupMember>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinGroupMember {
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub metadata: Bytes,
}

impl JoinGroupResponse {
    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.leader == self.member_id
    }
}

impl Encodable for JoinGroupResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 2 {
            self.throttle_time_ms.encode(buffer)?;
        }
        self.error_code.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.protocol_name.encode(buffer)?;
        self.leader.encode(buffer)?;
        self.member_id.encode(buffer)?;
        encode_as_array(buffer, &self.members, |buffer, m| {
            m.member_id.encode(buffer)?;
            if version >= 5 {
                m.group_instance_id.as_deref().encode(buffer)?;
            }
            m.metadata.encode(buffer)
        })
    }
}

impl Decodable for JoinGroupResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = throttle(input, version >= 2)?;
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, generation_id) = be_i32(input)?;
        let (input, protocol_name) = parse_string(input)?;
        let (input, leader) = parse_string(input)?;
        let (input, member_id) = parse_string(input)?;
        let member = move |input: NomBytes| -> IResult<NomBytes, JoinGroupMember> {
            let (input, member_id) = parse_string(input)?;
            let (input, group_instance_id) = optional_string(input, version >= 5)?;
            let (input, metadata) = parse_bytes(input)?;
            Ok((
                input,
                JoinGroupMember {
                    member_id,
                    group_instance_id,
                    metadata,
                },
            ))
        };
        let (input, members) = parse_array(member)(input)?;
        Ok((
            input,
            JoinGroupResponse {
                throttle_time_ms,
                error_code,
                generation_id,
                protocol_name,
                leader,
                member_id,
                members,
            },
        ))
    }
}

impl Response for JoinGroupResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

const HEARTBEAT_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_3_0_0,
];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
}

impl Encodable for HeartbeatRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)?;
        if version >= 3 {
            self.group_instance_id.as_deref().encode(buffer)?;
        }
        Ok(())
    }
}

impl Decodable for HeartbeatRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, group_id) = parse_string(input)?;
        let (input, generation_id) = be_i32(input)?;
        let (input, member_id) = parse_string(input)?;
        let (input, group_instance_id) = optional_string(input, version >= 3)?;
        Ok((
            input,
            HeartbeatRequest {
                group_id,
                generation_id,
                member_id,
                group_instance_id,
            },
        ))
    }
}

impl Request for HeartbeatRequest {
    type Response = ErrorOnlyResponse;
    const KEY: ApiKey = ApiKey::Heartbeat;
    const MAX_VERSION: i16 = 3;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(HEARTBEAT_RELEASES, version)
    }
}

/// Response made of an optional throttle (v1 and later) and an error code.
/// Shared by Heartbeat and LeaveGroup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ErrorOnlyResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
}

impl ErrorOnlyResponse {
    pub fn new(error_code: KafkaCode) -> Self {
        Self {
            throttle_time_ms: 0,
            error_code,
        }
    }
}

impl Encodable for ErrorOnlyResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        self.error_code.encode(buffer)
    }
}

impl Decodable for ErrorOnlyResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = throttle(input, version >= 1)?;
        let (input, error_code) = parse_kafka_code(input)?;
        Ok((
            input,
            ErrorOnlyResponse {
                throttle_time_ms,
                error_code,
            },
        ))
    }
}

impl Response for ErrorOnlyResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// LeaveGroup
// ============================================================================

const LEAVE_GROUP_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

impl Encodable for LeaveGroupRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.member_id.encode(buffer)
    }
}

impl Decodable for LeaveGroupRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, group_id) = parse_string(input)?;
        let (input, member_id) = parse_string(input)?;
        Ok((input, LeaveGroupRequest { group_id, member_id }))
    }
}

impl Request for LeaveGroupRequest {
    type Response = ErrorOnlyResponse;
    const KEY: ApiKey = ApiKey::LeaveGroup;
    const MAX_VERSION: i16 = 2;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(LEAVE_GROUP_RELEASES, version)
    }
}

// ============================================================================
// SyncGroup
// ============================================================================

const SYNC_GROUP_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
    KafkaVersion::V2_3_0_0,
];

/// SyncGroup request. Only the leader sends assignments; followers send an
/// empty list and receive their share in the response.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub group_instance_id: Option<String>,
    pub assignments: Vec<SyncGroupAssignment>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncGroupAssignment {
    pub member_id: String,
    pub assignment: Bytes,
}

impl Encodable for SyncGroupRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.group_id.encode(buffer)?;
        self.generation_id.encode(buffer)?;
        self.member_id.encode(buffer)?;
        if version >= 3 {
            self.group_instance_id.as_deref().encode(buffer)?;
        }
        encode_as_array(buffer, &self.assignments, |buffer, a| {
            a.member_id.encode(buffer)?;
            a.assignment.encode(buffer)
        })
    }
}

fn parse_sync_assignment(input: NomBytes) -> IResult<NomBytes, SyncGroupAssignment> {
    let (input, member_id) = parse_string(input)?;
    let (input, assignment) = parse_bytes(input)?;
    Ok((input, SyncGroupAssignment { member_id, assignment }))
}

impl Decodable for SyncGroupRequest {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, group_id) = parse_string(input)?;
        let (input, generation_id) = be_i32(input)?;
        let (input, member_id) = parse_string(input)?;
        let (input, group_instance_id) = optional_string(input, version >= 3)?;
        let (input, assignments) = parse_array(parse_sync_assignment)(input)?;
        Ok((
            input,
            SyncGroupRequest {
                group_id,
                generation_id,
                member_id,
                group_instance_id,
                assignments,
            },
        ))
    }
}

impl Request for SyncGroupRequest {
    type Response = SyncGroupResponse;
    const KEY: ApiKey = ApiKey::SyncGroup;
    const MAX_VERSION: i16 = 3;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(SYNC_GROUP_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncGroupResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    pub assignment: Bytes,
}

impl Encodable for SyncGroupResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        self.error_code.encode(buffer)?;
        self.assignment.encode(buffer)
    }
}

impl Decodable for SyncGroupResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = throttle(input, version >= 1)?;
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, assignment) = parse_bytes(input)?;
        Ok((
            input,
            SyncGroupResponse {
                throttle_time_ms,
                error_code,
                assignment,
            },
        ))
    }
}

impl Response for SyncGroupResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// DescribeGroups
// ============================================================================

const DESCRIBE_GROUPS_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescribeGroupsRequest {
    pub groups: Vec<String>,
}

impl Encodable for DescribeGroupsRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        encode_as_array(buffer, &self.groups, |buffer, g| g.encode(buffer))
    }
}

impl Decodable for DescribeGroupsRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, groups) = parse_array(parse_string)(input)?;
        Ok((input, DescribeGroupsRequest { groups }))
    }
}

impl Request for DescribeGroupsRequest {
    type Response = DescribeGroupsResponse;
    const KEY: ApiKey = ApiKey::DescribeGroups;
    const MAX_VERSION: i16 = 2;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(DESCRIBE_GROUPS_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescribeGroupsResponse {
    pub throttle_time_ms: i32,
    pub groups: Vec<DescribedGroup>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescribedGroup {
    pub error_code: KafkaCode,
    pub group_id: String,
    pub group_state: String,
    pub protocol_type: String,
    pub protocol_data: String,
    pub members: Vec<DescribedGroupMember>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DescribedGroupMember {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub member_metadata: Bytes,
    pub member_assignment: Bytes,
}

impl Encodable for DescribeGroupsResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        encode_as_array(buffer, &self.groups, |buffer, g| {
            g.error_code.encode(buffer)?;
            g.group_id.encode(buffer)?;
            g.group_state.encode(buffer)?;
            g.protocol_type.encode(buffer)?;
            g.protocol_data.encode(buffer)?;
            encode_as_array(buffer, &g.members, |buffer, m| {
                m.member_id.encode(buffer)?;
                m.client_id.encode(buffer)?;
                m.client_host.encode(buffer)?;
                m.member_metadata.encode(buffer)?;
                m.member_assignment.encode(buffer)
            })
        })
    }
}

fn parse_described_member(input: NomBytes) -> IResult<NomBytes, DescribedGroupMember> {
    let (input, member_id) = parse_string(input)?;
    let (input, client_id) = parse_string(input)?;
    let (input, client_host) = parse_string(input)?;
    let (input, member_metadata) = parse_bytes(input)?;
    let (input, member_assignment) = parse_bytes(input)?;
    Ok((
        input,
        DescribedGroupMember {
            member_id,
            client_id,
            client_host,
            member_metadata,
            member_assignment,
        },
    ))
}

fn parse_described_group(input: NomBytes) -> IResult<NomBytes, DescribedGroup> {
    let (input, error_code) = parse_kafka_code(input)?;
    let (input, group_id) = parse_string(input)?;
    let (input, group_state) = parse_string(input)?;
    let (input, protocol_type) = parse_string(input)?;
    let (input, protocol_data) = parse_string(input)?;
    let (input, members) = parse_array(parse_described_member)(input)?;
    Ok((
        input,
        DescribedGroup {
            error_code,
            group_id,
            group_state,
            protocol_type,
            protocol_data,
            members,
        },
    ))
}

impl Decodable for DescribeGroupsResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = throttle(input, version >= 1)?;
        let (input, groups) = parse_array(parse_described_group)(input)?;
        Ok((
            input,
            DescribeGroupsResponse {
                throttle_time_ms,
                groups,
            },
        ))
    }
}

impl Response for DescribeGroupsResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

// ============================================================================
// ListGroups
// ============================================================================

const LIST_GROUPS_RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_9_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListGroupsRequest;

impl Encodable for ListGroupsRequest {
    fn encode<W: BufMut>(&self, _buffer: &mut W, _version: i16) -> Result<()> {
        Ok(())
    }
}

impl Decodable for ListGroupsRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        Ok((input, ListGroupsRequest))
    }
}

impl Request for ListGroupsRequest {
    type Response = ListGroupsResponse;
    const KEY: ApiKey = ApiKey::ListGroups;
    const MAX_VERSION: i16 = 2;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(LIST_GROUPS_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ListGroupsResponse {
    pub throttle_time_ms: i32,
    pub error_code: KafkaCode,
    /// (group id, protocol type)
    pub groups: Vec<(String, String)>,
}

impl Encodable for ListGroupsResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        self.error_code.encode(buffer)?;
        encode_as_array(buffer, &self.groups, |buffer, (group_id, protocol_type)| {
            group_id.encode(buffer)?;
            protocol_type.encode(buffer)
        })
    }
}

fn parse_listed_group(input: NomBytes) -> IResult<NomBytes, (String, String)> {
    let (input, group_id) = parse_string(input)?;
    let (input, protocol_type) = parse_string(input)?;
    Ok((input, (group_id, protocol_type)))
}

impl Decodable for ListGroupsResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, throttle_time_ms) = throttle(input, version >= 1)?;
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, groups) = parse_array(parse_listed_group)(input)?;
        Ok((
            input,
            ListGroupsResponse {
                throttle_time_ms,
                error_code,
                groups,
            },
        ))
    }
}

impl Response for ListGroupsResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    #[test]
    fn test_find_coordinator() {
        let request = FindCoordinatorRequest {
            key: "g".to_string(),
            key_type: 0,
        };
        assert_round_trip(&request, 0);
        let txn = FindCoordinatorRequest {
            key: "txn".to_string(),
            key_type: 1,
        };
        assert_round_trip(&txn, 2);

        let response = FindCoordinatorResponse {
            node_id: 2,
            host: "localhost".to_string(),
            port: 9093,
            ..Default::default()
        };
        assert_round_trip(&response, 0);
        let mut v1 = response.clone();
        v1.throttle_time_ms = 5;
        v1.error_message = Some("ok".to_string());
        assert_round_trip(&v1, 2);
        assert_eq!(response.addr(), "localhost:9093");
    }

    #[test]
    fn test_join_group_v0_rebalance_timeout_defaults_to_session() {
        let request = JoinGroupRequest {
            group_id: "g".to_string(),
            session_timeout_ms: 10_000,
            rebalance_timeout_ms: 60_000,
            member_id: String::new(),
            group_instance_id: None,
            protocol_type: "consumer".to_string(),
            protocols: vec![JoinGroupProtocol {
                name: "range".to_string(),
                metadata: Bytes::from_static(b"meta"),
            }],
        };
        let bytes = crate::protocol::encode_body(&request, 0).unwrap();
        let decoded: JoinGroupRequest = crate::protocol::decode_body(bytes, 0).unwrap();
        assert_eq!(decoded.rebalance_timeout_ms, 10_000);

        let mut static_member = request.clone();
        static_member.group_instance_id = Some("host-1".to_string());
        assert_round_trip(&static_member, 5);
        assert_round_trip(&request, 1);
    }

    #[test]
    fn test_join_group_response() {
        let response = JoinGroupResponse {
            throttle_time_ms: 0,
            error_code: KafkaCode::None,
            generation_id: 4,
            protocol_name: "range".to_string(),
            leader: "m-1".to_string(),
            member_id: "m-1".to_string(),
            members: vec![
                JoinGroupMember {
                    member_id: "m-1".to_string(),
                    group_instance_id: None,
                    metadata: Bytes::from_static(b"a"),
                },
                JoinGroupMember {
                    member_id: "m-2".to_string(),
                    group_instance_id: None,
                    metadata: Bytes::from_static(b"b"),
                },
            ],
        };
        assert!(response.is_leader());
        assert_round_trip(&response, 0);
        let mut v5 = response.clone();
        v5.throttle_time_ms = 10;
        v5.members[1].group_instance_id = Some("static".to_string());
        assert_round_trip(&v5, 5);
    }

    #[test]
    fn test_heartbeat_and_leave() {
        let heartbeat = HeartbeatRequest {
            group_id: "g".to_string(),
            generation_id: 1,
            member_id: "m".to_string(),
            group_instance_id: Some("i".to_string()),
        };
        assert_round_trip(&heartbeat, 3);

        let leave = LeaveGroupRequest {
            group_id: "g".to_string(),
            member_id: "m".to_string(),
        };
        assert_round_trip(&leave, 2);

        let response = ErrorOnlyResponse::new(KafkaCode::RebalanceInProgress);
        assert_round_trip(&response, 0);
        let bytes = crate::protocol::encode_body(&response, 1).unwrap();
        assert_eq!(bytes.as_ref(), &[0, 0, 0, 0, 0, 27]);
    }

    #[test]
    fn test_sync_group() {
        let request = SyncGroupRequest {
            group_id: "g".to_string(),
            generation_id: 2,
            member_id: "m-1".to_string(),
            group_instance_id: None,
            assignments: vec![SyncGroupAssignment {
                member_id: "m-1".to_string(),
                assignment: Bytes::from_static(b"assign"),
            }],
        };
        assert_round_trip(&request, 0);
        assert_round_trip(&request, 3);

        let response = SyncGroupResponse {
            throttle_time_ms: 1,
            error_code: KafkaCode::None,
            assignment: Bytes::from_static(b"assign"),
        };
        assert_round_trip(&response, 3);
    }

    #[test]
    fn test_describe_and_list_groups() {
        let request = DescribeGroupsRequest {
            groups: vec!["a".to_string(), "b".to_string()],
        };
        assert_round_trip(&request, 0);

        let response = DescribeGroupsResponse {
            throttle_time_ms: 3,
            groups: vec![DescribedGroup {
                error_code: KafkaCode::None,
                group_id: "a".to_string(),
                group_state: "Stable".to_string(),
                protocol_type: "consumer".to_string(),
                protocol_data: "range".to_string(),
                members: vec![DescribedGroupMember {
                    member_id: "m".to_string(),
                    client_id: "c".to_string(),
                    client_host: "/127.0.0.1".to_string(),
                    member_metadata: Bytes::from_static(b"md"),
                    member_assignment: Bytes::from_static(b"as"),
                }],
            }],
        };
        assert_round_trip(&response, 1);

        assert_round_trip(&ListGroupsRequest, 2);
        let listed = ListGroupsResponse {
            throttle_time_ms: 0,
            error_code: KafkaCode::None,
            groups: vec![("a".to_string(), "consumer".to_string())],
        };
        assert_round_trip(&listed, 0);
        assert_round_trip(&listed, 2);
    }
}
