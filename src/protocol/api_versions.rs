//! ApiVersions API (key 18), versions 0-2.
//!
//! Sent first on every new connection. The response bounds the version the
//! broker connection negotiates for each later request.

use bytes::BufMut;
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_kafka_code};

const RELEASES: &[KafkaVersion] = &[
    KafkaVersion::V0_10_0_0,
    KafkaVersion::V0_11_0_0,
    KafkaVersion::V2_0_0_0,
];

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApiVersionsRequest;

impl Encodable for ApiVersionsRequest {
    fn encode<W: BufMut>(&self, _buffer: &mut W, _version: i16) -> Result<()> {
        Ok(())
    }
}

impl Decodable for ApiVersionsRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        Ok((input, ApiVersionsRequest))
    }
}

impl Request for ApiVersionsRequest {
    type Response = ApiVersionsResponse;
    const KEY: ApiKey = ApiKey::ApiVersions;
    const MAX_VERSION: i16 = 2;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(RELEASES, version)
    }
}

/// One advertised `(api_key, min, max)` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersionRange {
    pub api_key: ApiKey,
    pub min_version: i16,
    pub max_version: i16,
}

impl ToByte for ApiVersionRange {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        i16::from(self.api_key).encode(buffer)?;
        self.min_version.encode(buffer)?;
        self.max_version.encode(buffer)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApiVersionsResponse {
    pub error_code: KafkaCode,
    pub api_keys: Vec<ApiVersionRange>,
    pub throttle_time_ms: i32,
}

impl Encodable for ApiVersionsResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.error_code.encode(buffer)?;
        encode_as_array(buffer, &self.api_keys, |buffer, range| range.encode(buffer))?;
        if version >= 1 {
            self.throttle_time_ms.encode(buffer)?;
        }
        Ok(())
    }
}

fn parse_api_version_range(input: NomBytes) -> IResult<NomBytes, ApiVersionRange> {
    let (input, api_key) = be_i16(input)?;
    let (input, min_version) = be_i16(input)?;
    let (input, max_version) = be_i16(input)?;
    Ok((
        input,
        ApiVersionRange {
            api_key: ApiKey::from(api_key),
            min_version,
            max_version,
        },
    ))
}

impl Decodable for ApiVersionsResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, api_keys) = parse_array(parse_api_version_range)(input)?;
        let (input, throttle_time_ms) = if version >= 1 { be_i32(input)? } else { (input, 0) };
        Ok((
            input,
            ApiVersionsResponse {
                error_code,
                api_keys,
                throttle_time_ms,
            },
        ))
    }
}

impl Response for ApiVersionsResponse {
    fn throttle_time_ms(&self) -> i32 {
        self.throttle_time_ms
    }
}
