//! SaslHandshake (key 17, versions 0-1) and SaslAuthenticate (key 36,
//! versions 0-1).
//!
//! With SaslHandshake v0 the SASL tokens that follow travel as raw
//! length-prefixed frames; with v1 they are wrapped in SaslAuthenticate.

use bytes::{BufMut, Bytes};
use nom::{IResult, number::complete::be_i64};
use nombytes::NomBytes;

use super::{ApiKey, Decodable, Encodable, KafkaVersion, Request, Response, release_for};
use crate::encode::{ToByte, encode_as_array};
use crate::error::{KafkaCode, Result};
use crate::parser::{parse_array, parse_bytes, parse_kafka_code, parse_nullable_string, parse_string};

const HANDSHAKE_RELEASES: &[KafkaVersion] = &[KafkaVersion::V0_10_0_0, KafkaVersion::V1_0_0_0];

const AUTHENTICATE_RELEASES: &[KafkaVersion] = &[KafkaVersion::V1_0_0_0, KafkaVersion::V2_2_0_0];

// ============================================================================
// SaslHandshake
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslHandshakeRequest {
    pub mechanism: String,
}

impl Encodable for SaslHandshakeRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.mechanism.encode(buffer)
    }
}

impl Decodable for SaslHandshakeRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, mechanism) = parse_string(input)?;
        Ok((input, SaslHandshakeRequest { mechanism }))
    }
}

impl Request for SaslHandshakeRequest {
    type Response = SaslHandshakeResponse;
    const KEY: ApiKey = ApiKey::SaslHandshake;
    const MAX_VERSION: i16 = 1;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(HANDSHAKE_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslHandshakeResponse {
    pub error_code: KafkaCode,
    /// Mechanisms the broker has enabled.
    pub mechanisms: Vec<String>,
}

impl Encodable for SaslHandshakeResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.error_code.encode(buffer)?;
        encode_as_array(buffer, &self.mechanisms, |buffer, m| m.encode(buffer))
    }
}

impl Decodable for SaslHandshakeResponse {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, mechanisms) = parse_array(parse_string)(input)?;
        Ok((
            input,
            SaslHandshakeResponse {
                error_code,
                mechanisms,
            },
        ))
    }
}

impl Response for SaslHandshakeResponse {}

// ============================================================================
// SaslAuthenticate
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslAuthenticateRequest {
    pub auth_bytes: Bytes,
}

impl Encodable for SaslAuthenticateRequest {
    fn encode<W: BufMut>(&self, buffer: &mut W, _version: i16) -> Result<()> {
        self.auth_bytes.encode(buffer)
    }
}

impl Decodable for SaslAuthenticateRequest {
    fn decode(input: NomBytes, _version: i16) -> IResult<NomBytes, Self> {
        let (input, auth_bytes) = parse_bytes(input)?;
        Ok((input, SaslAuthenticateRequest { auth_bytes }))
    }
}

impl Request for SaslAuthenticateRequest {
    type Response = SaslAuthenticateResponse;
    const KEY: ApiKey = ApiKey::SaslAuthenticate;
    const MAX_VERSION: i16 = 1;

    fn required_version(version: i16) -> KafkaVersion {
        release_for(AUTHENTICATE_RELEASES, version)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaslAuthenticateResponse {
    pub error_code: KafkaCode,
    pub error_message: Option<String>,
    pub auth_bytes: Bytes,
    /// Version 1 and later; zero means the session does not expire.
    pub session_lifetime_ms: i64,
}

impl Encodable for SaslAuthenticateResponse {
    fn encode<W: BufMut>(&self, buffer: &mut W, version: i16) -> Result<()> {
        self.error_code.encode(buffer)?;
        self.error_message.as_deref().encode(buffer)?;
        self.auth_bytes.encode(buffer)?;
        if version >= 1 {
            self.session_lifetime_ms.encode(buffer)?;
        }
        Ok(())
    }
}

impl Decodable for SaslAuthenticateResponse {
    fn decode(input: NomBytes, version: i16) -> IResult<NomBytes, Self> {
        let (input, error_code) = parse_kafka_code(input)?;
        let (input, error_message) = parse_nullable_string(input)?;
        let (input, auth_bytes) = parse_bytes(input)?;
        let (input, session_lifetime_ms) = if version >= 1 { be_i64(input)? } else { (input, 0) };
        Ok((
            input,
            SaslAuthenticateResponse {
                error_code,
                error_message,
                auth_bytes,
                session_lifetime_ms,
            },
        ))
    }
}

impl Response for SaslAuthenticateResponse {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_util::assert_round_trip;

    #[test]
    fn test_handshake() {
        let request = SaslHandshakeRequest {
            mechanism: "PLAIN".to_string(),
        };
        let bytes = crate::protocol::encode_body(&request, 1).unwrap();
        assert_eq!(bytes.as_ref(), b"\x00\x05PLAIN");
        assert_round_trip(&request, 0);

        let response = SaslHandshakeResponse {
            error_code: KafkaCode::UnsupportedSaslMechanism,
            mechanisms: vec!["SCRAM-SHA-256".to_string(), "PLAIN".to_string()],
        };
        assert_round_trip(&response, 1);
    }

    #[test]
    fn test_authenticate() {
        let request = SaslAuthenticateRequest {
            auth_bytes: Bytes::from_static(b"\0user\0pass"),
        };
        assert_round_trip(&request, 1);

        let response = SaslAuthenticateResponse {
            error_code: KafkaCode::SaslAuthenticationFailed,
            error_message: Some("bad credentials".to_string()),
            auth_bytes: Bytes::new(),
            session_lifetime_ms: 0,
        };
        assert_round_trip(&response, 0);
        let mut v1 = response.clone();
        v1.session_lifetime_ms = 3_600_000;
        assert_round_trip(&v1, 1);
    }
}
