//! Kafka protocol codec layer.
//!
//! Every API the client speaks has a request and a response type implementing
//! [`Encodable`] and [`Decodable`] with an explicit version argument. Requests
//! additionally implement [`Request`], which ties the pair together and
//! declares the API key, the supported version range and the broker release
//! each version first appeared in.
//!
//! Both directions are implemented for every message: the client encodes
//! requests and decodes responses, while [`crate::mock::MockBroker`] does the
//! reverse with the same code.
//!
//! # Framing
//!
//! ```text
//! request:  int32 length | int16 api_key | int16 api_version | int32 correlation_id
//!           | nullable_string client_id | body
//! response: int32 length | int32 correlation_id | body
//! ```
//!
//! # Supported APIs
//!
//! | API | Key | Versions |
//! |-----|-----|----------|
//! | Produce | 0 | 0-7 |
//! | Fetch | 1 | 0-11 |
//! | ListOffsets | 2 | 0-5 |
//! | Metadata | 3 | 0-7 |
//! | OffsetCommit | 8 | 0-7 |
//! | OffsetFetch | 9 | 0-5 |
//! | FindCoordinator | 10 | 0-2 |
//! | JoinGroup | 11 | 0-5 |
//! | Heartbeat | 12 | 0-3 |
//! | LeaveGroup | 13 | 0-2 |
//! | SyncGroup | 14 | 0-3 |
//! | DescribeGroups | 15 | 0-2 |
//! | ListGroups | 16 | 0-2 |
//! | SaslHandshake | 17 | 0-1 |
//! | ApiVersions | 18 | 0-2 |
//! | InitProducerId | 22 | 0-1 |
//! | AddPartitionsToTxn | 24 | 0-1 |
//! | AddOffsetsToTxn | 25 | 0-1 |
//! | EndTxn | 26 | 0-1 |
//! | TxnOffsetCommit | 28 | 0-2 |
//! | SaslAuthenticate | 36 | 0-1 |

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::encode::ToByte;
use crate::error::{Error, Result};
use crate::parser::parse_nullable_string;

pub mod api_versions;
pub mod consumer;
pub mod fetch;
pub mod groups;
pub mod list_offsets;
pub mod metadata;
pub mod offsets;
pub mod produce;
pub mod records;
pub mod sasl;
pub mod txn;
pub mod versions;

pub use versions::KafkaVersion;

/// Kafka API keys understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiKey {
    Produce,
    Fetch,
    ListOffsets,
    Metadata,
    OffsetCommit,
    OffsetFetch,
    FindCoordinator,
    JoinGroup,
    Heartbeat,
    LeaveGroup,
    SyncGroup,
    DescribeGroups,
    ListGroups,
    SaslHandshake,
    ApiVersions,
    InitProducerId,
    AddPartitionsToTxn,
    AddOffsetsToTxn,
    EndTxn,
    TxnOffsetCommit,
    SaslAuthenticate,
    Unknown(i16),
}

impl From<i16> for ApiKey {
    fn from(value: i16) -> Self {
        match value {
            0 => ApiKey::Produce,
            1 => ApiKey::Fetch,
            2 => ApiKey::ListOffsets,
            3 => ApiKey::Metadata,
            8 => ApiKey::OffsetCommit,
            9 => ApiKey::OffsetFetch,
            10 => ApiKey::FindCoordinator,
            11 => ApiKey::JoinGroup,
            12 => ApiKey::Heartbeat,
            13 => ApiKey::LeaveGroup,
            14 => ApiKey::SyncGroup,
            15 => ApiKey::DescribeGroups,
            16 => ApiKey::ListGroups,
            17 => ApiKey::SaslHandshake,
            18 => ApiKey::ApiVersions,
            22 => ApiKey::InitProducerId,
            24 => ApiKey::AddPartitionsToTxn,
            25 => ApiKey::AddOffsetsToTxn,
            26 => ApiKey::EndTxn,
            28 => ApiKey::TxnOffsetCommit,
            36 => ApiKey::SaslAuthenticate,
            n => ApiKey::Unknown(n),
        }
    }
}

impl From<ApiKey> for i16 {
    fn from(key: ApiKey) -> Self {
        match key {
            ApiKey::Produce => 0,
            ApiKey::Fetch => 1,
            ApiKey::ListOffsets => 2,
            ApiKey::Metadata => 3,
            ApiKey::OffsetCommit => 8,
            ApiKey::OffsetFetch => 9,
            ApiKey::FindCoordinator => 10,
            ApiKey::JoinGroup => 11,
            ApiKey::Heartbeat => 12,
            ApiKey::LeaveGroup => 13,
            ApiKey::SyncGroup => 14,
            ApiKey::DescribeGroups => 15,
            ApiKey::ListGroups => 16,
            ApiKey::SaslHandshake => 17,
            ApiKey::ApiVersions => 18,
            ApiKey::InitProducerId => 22,
            ApiKey::AddPartitionsToTxn => 24,
            ApiKey::AddOffsetsToTxn => 25,
            ApiKey::EndTxn => 26,
            ApiKey::TxnOffsetCommit => 28,
            ApiKey::SaslAuthenticate => 36,
            ApiKey::Unknown(n) => n,
        }
    }
}

impl ApiKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKey::Produce => "Produce",
            ApiKey::Fetch => "Fetch",
            ApiKey::ListOffsets => "ListOffsets",
            ApiKey::Metadata => "Metadata",
            ApiKey::OffsetCommit => "OffsetCommit",
            ApiKey::OffsetFetch => "OffsetFetch",
            ApiKey::FindCoordinator => "FindCoordinator",
            ApiKey::JoinGroup => "JoinGroup",
            ApiKey::Heartbeat => "Heartbeat",
            ApiKey::LeaveGroup => "LeaveGroup",
            ApiKey::SyncGroup => "SyncGroup",
            ApiKey::DescribeGroups => "DescribeGroups",
            ApiKey::ListGroups => "ListGroups",
            ApiKey::SaslHandshake => "SaslHandshake",
            ApiKey::ApiVersions => "ApiVersions",
            ApiKey::InitProducerId => "InitProducerId",
            ApiKey::AddPartitionsToTxn => "AddPartitionsToTxn",
            ApiKey::AddOffsetsToTxn => "AddOffsetsToTxn",
            ApiKey::EndTxn => "EndTxn",
            ApiKey::TxnOffsetCommit => "TxnOffsetCommit",
            ApiKey::SaslAuthenticate => "SaslAuthenticate",
            ApiKey::Unknown(_) => "Unknown",
        }
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialize a protocol body at a given version.
pub trait Encodable {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()>;
}

/// Parse a protocol body at a given version.
pub trait Decodable: Sized {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self>;
}

/// A response body.
pub trait Response: Encodable + Decodable + fmt::Debug + Send + 'static {
    /// Broker-side throttling applied to this response, in milliseconds.
    fn throttle_time_ms(&self) -> i32 {
        0
    }
}

/// A request body paired with its response type.
pub trait Request: Encodable + Decodable + fmt::Debug + Send + Sync + 'static {
    type Response: Response;

    const KEY: ApiKey;
    const MIN_VERSION: i16 = 0;
    const MAX_VERSION: i16;

    /// The first broker release that understands `version` of this API.
    fn required_version(version: i16) -> KafkaVersion;

    /// Whether the broker answers this request at all.
    fn expects_response(&self) -> bool {
        true
    }
}

/// Header of every request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub api_key: ApiKey,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: Option<String>,
}

impl RequestHeader {
    pub fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        i16::from(self.api_key).encode(buffer)?;
        self.api_version.encode(buffer)?;
        self.correlation_id.encode(buffer)?;
        self.client_id.as_deref().encode(buffer)
    }

    pub fn decode(input: NomBytes) -> IResult<NomBytes, Self> {
        let (input, api_key) = be_i16(input)?;
        let (input, api_version) = be_i16(input)?;
        let (input, correlation_id) = be_i32(input)?;
        let (input, client_id) = parse_nullable_string(input)?;
        Ok((
            input,
            RequestHeader {
                api_key: ApiKey::from(api_key),
                api_version,
                correlation_id,
                client_id,
            },
        ))
    }
}

/// Encode a full request frame, including the length prefix.
pub fn encode_request<R: Request>(
    request: &R,
    version: i16,
    correlation_id: i32,
    client_id: Option<&str>,
) -> Result<Bytes> {
    let header = RequestHeader {
        api_key: R::KEY,
        api_version: version,
        correlation_id,
        client_id: client_id.map(str::to_string),
    };
    let mut buffer = BytesMut::with_capacity(64);
    buffer.put_i32(0);
    header.encode(&mut buffer)?;
    request.encode(&mut buffer, version)?;
    patch_length_prefix(buffer)
}

/// Encode a full response frame, including the length prefix.
pub fn encode_response<T: Encodable>(
    response: &T,
    version: i16,
    correlation_id: i32,
) -> Result<Bytes> {
    let mut buffer = BytesMut::with_capacity(64);
    buffer.put_i32(0);
    buffer.put_i32(correlation_id);
    response.encode(&mut buffer, version)?;
    patch_length_prefix(buffer)
}

fn patch_length_prefix(mut buffer: BytesMut) -> Result<Bytes> {
    let length = i32::try_from(buffer.len() - 4)
        .map_err(|_| Error::Encoding("frame exceeds int32 length".to_string()))?;
    buffer[..4].copy_from_slice(&length.to_be_bytes());
    Ok(buffer.freeze())
}

/// Encode a body without framing.
pub fn encode_body<T: Encodable>(value: &T, version: i16) -> Result<Bytes> {
    let mut buffer = BytesMut::new();
    value.encode(&mut buffer, version)?;
    Ok(buffer.freeze())
}

/// Decode a body, ignoring any trailing bytes a newer peer may append.
pub fn decode_body<T: Decodable>(bytes: Bytes, version: i16) -> Result<T> {
    let (_, value) = T::decode(NomBytes::new(bytes), version)?;
    Ok(value)
}

/// Split a response frame payload (after the length prefix) into its
/// correlation id and body.
pub fn split_response(frame: Bytes) -> Result<(i32, Bytes)> {
    if frame.len() < 4 {
        return Err(Error::MissingData(format!(
            "response frame of {} bytes has no correlation id",
            frame.len()
        )));
    }
    let correlation_id = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
    Ok((correlation_id, frame.slice(4..)))
}

/// Map a version to the release table of an API.
///
/// `table[v]` is the release that introduced version `v`; versions past the
/// end of the table reuse its last entry.
pub(crate) fn release_for(table: &[KafkaVersion], version: i16) -> KafkaVersion {
    let index = (version.max(0) as usize).min(table.len().saturating_sub(1));
    table.get(index).copied().unwrap_or(KafkaVersion::V0_8_2_0)
}

macro_rules! body_registry {
    ($($variant:ident => $request:ty),+ $(,)?) => {
        /// Every request body, tagged by API.
        #[derive(Debug, Clone, PartialEq)]
        pub enum RequestBody {
            $($variant($request),)+
        }

        /// Every response body, tagged by API.
        #[derive(Debug, Clone, PartialEq)]
        pub enum ResponseBody {
            $($variant(<$request as Request>::Response),)+
        }

        impl RequestBody {
            /// Decode the body of a request with the given key and version.
            pub fn decode(api_key: ApiKey, version: i16, body: Bytes) -> Result<Self> {
                match api_key {
                    $(ApiKey::$variant => {
                        if !(<$request>::MIN_VERSION..=<$request>::MAX_VERSION).contains(&version) {
                            return Err(Error::UnsupportedVersion {
                                api: api_key.as_str(),
                                broker_min: <$request>::MIN_VERSION,
                                broker_max: <$request>::MAX_VERSION,
                            });
                        }
                        Ok(RequestBody::$variant(decode_body(body, version)?))
                    })+
                    ApiKey::Unknown(key) => {
                        Err(Error::Decoding(format!("unknown api key {key}")))
                    }
                }
            }

            pub fn api_key(&self) -> ApiKey {
                match self {
                    $(RequestBody::$variant(_) => ApiKey::$variant,)+
                }
            }
        }

        impl ResponseBody {
            pub fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
                match self {
                    $(ResponseBody::$variant(body) => body.encode(buffer, version),)+
                }
            }
        }

        impl Encodable for ResponseBody {
            fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
                ResponseBody::encode(self, buffer, version)
            }
        }
    };
}

body_registry! {
    Produce => produce::ProduceRequest,
    Fetch => fetch::FetchRequest,
    ListOffsets => list_offsets::ListOffsetsRequest,
    Metadata => metadata::MetadataRequest,
    OffsetCommit => offsets::OffsetCommitRequest,
    OffsetFetch => offsets::OffsetFetchRequest,
    FindCoordinator => groups::FindCoordinatorRequest,
    JoinGroup => groups::JoinGroupRequest,
    Heartbeat => groups::HeartbeatRequest,
    LeaveGroup => groups::LeaveGroupRequest,
    SyncGroup => groups::SyncGroupRequest,
    DescribeGroups => groups::DescribeGroupsRequest,
    ListGroups => groups::ListGroupsRequest,
    SaslHandshake => sasl::SaslHandshakeRequest,
    ApiVersions => api_versions::ApiVersionsRequest,
    InitProducerId => txn::InitProducerIdRequest,
    AddPartitionsToTxn => txn::AddPartitionsToTxnRequest,
    AddOffsetsToTxn => txn::AddOffsetsToTxnRequest,
    EndTxn => txn::EndTxnRequest,
    TxnOffsetCommit => txn::TxnOffsetCommitRequest,
    SaslAuthenticate => sasl::SaslAuthenticateRequest,
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::api_versions::ApiVersionsRequest;
    use crate::protocol::groups::HeartbeatRequest;

    #[test]
    fn test_api_key_round_trip() {
        for key in [0i16, 1, 2, 3, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 22, 24, 25, 26, 28, 36] {
            assert_eq!(i16::from(ApiKey::from(key)), key);
            assert_ne!(ApiKey::from(key).as_str(), "Unknown");
        }
        assert_eq!(ApiKey::from(99), ApiKey::Unknown(99));
    }

    #[test]
    fn test_request_frame_layout() {
        let request = HeartbeatRequest {
            group_id: "g".to_string(),
            generation_id: 3,
            member_id: "m".to_string(),
            group_instance_id: None,
        };
        let frame = encode_request(&request, 0, 7, Some("cli")).unwrap();

        let expected: Vec<u8> = vec![
            0x00, 0x00, 0x00, 0x16, // length = 22
            0x00, 0x0C, // api key 12
            0x00, 0x00, // version 0
            0x00, 0x00, 0x00, 0x07, // correlation id
            0x00, 0x03, b'c', b'l', b'i', // client id
            0x00, 0x01, b'g', // group id
            0x00, 0x00, 0x00, 0x03, // generation
            0x00, 0x01, b'm', // member id
        ];
        assert_eq!(frame.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_request_header_decode() {
        let frame = encode_request(&ApiVersionsRequest::default(), 2, 42, None).unwrap();
        let (rest, header) = RequestHeader::decode(NomBytes::new(frame.slice(4..))).unwrap();
        assert_eq!(header.api_key, ApiKey::ApiVersions);
        assert_eq!(header.api_version, 2);
        assert_eq!(header.correlation_id, 42);
        assert_eq!(header.client_id, None);
        assert!(rest.into_bytes().is_empty());
    }

    #[test]
    fn test_response_frame_split() {
        let frame = encode_response(&api_versions::ApiVersionsResponse::default(), 0, 9).unwrap();
        let (correlation_id, body) = split_response(frame.slice(4..)).unwrap();
        assert_eq!(correlation_id, 9);
        let decoded: api_versions::ApiVersionsResponse = decode_body(body, 0).unwrap();
        assert_eq!(decoded, api_versions::ApiVersionsResponse::default());
    }

    #[test]
    fn test_split_response_too_short() {
        assert!(matches!(
            split_response(Bytes::from_static(&[0, 1])),
            Err(Error::MissingData(_))
        ));
    }

    #[test]
    fn test_request_body_registry_rejects_unknown_version() {
        let err = RequestBody::decode(ApiKey::Heartbeat, 9, Bytes::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_truncated_body_fails_cleanly() {
        let request = HeartbeatRequest {
            group_id: "group".to_string(),
            generation_id: 1,
            member_id: "member".to_string(),
            group_instance_id: None,
        };
        let bytes = encode_body(&request, 0).unwrap();
        for cut in 0..bytes.len() {
            let result: Result<HeartbeatRequest> = decode_body(bytes.slice(..cut), 0);
            assert!(matches!(result, Err(Error::Decoding(_))), "cut at {cut}");
        }
    }
}
