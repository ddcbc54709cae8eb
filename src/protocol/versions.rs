//! Broker release selector and API version negotiation.
//!
//! # Negotiation
//!
//! For every request the connection picks the highest version `v` such that
//!
//! 1. `v` lies inside the range this library implements for the API,
//! 2. `v` lies inside the range the broker advertised in ApiVersions
//!    (when negotiation ran),
//! 3. the broker release that introduced `v` is not newer than the
//!    configured [`KafkaVersion`] cap.
//!
//! When no version satisfies all three the request fails with
//! [`Error::UnsupportedVersion`] before anything is written.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use super::ApiKey;
use super::api_versions::ApiVersionRange;
use crate::error::{Error, Result};

/// A broker release, used to cap the protocol versions the client will use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KafkaVersion([u16; 4]);

impl KafkaVersion {
    pub const V0_8_2_0: Self = Self([0, 8, 2, 0]);
    pub const V0_9_0_0: Self = Self([0, 9, 0, 0]);
    pub const V0_10_0_0: Self = Self([0, 10, 0, 0]);
    pub const V0_10_1_0: Self = Self([0, 10, 1, 0]);
    pub const V0_10_2_0: Self = Self([0, 10, 2, 0]);
    pub const V0_11_0_0: Self = Self([0, 11, 0, 0]);
    pub const V1_0_0_0: Self = Self([1, 0, 0, 0]);
    pub const V1_1_0_0: Self = Self([1, 1, 0, 0]);
    pub const V2_0_0_0: Self = Self([2, 0, 0, 0]);
    pub const V2_1_0_0: Self = Self([2, 1, 0, 0]);
    pub const V2_2_0_0: Self = Self([2, 2, 0, 0]);
    pub const V2_3_0_0: Self = Self([2, 3, 0, 0]);
    pub const V2_4_0_0: Self = Self([2, 4, 0, 0]);
    pub const V2_5_0_0: Self = Self([2, 5, 0, 0]);
    pub const V2_6_0_0: Self = Self([2, 6, 0, 0]);
    pub const V2_7_0_0: Self = Self([2, 7, 0, 0]);
    pub const V2_8_0_0: Self = Self([2, 8, 0, 0]);

    pub const MIN: Self = Self::V0_8_2_0;
    pub const MAX: Self = Self::V2_8_0_0;

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self([major, minor, patch, 0])
    }

    pub fn is_at_least(self, other: KafkaVersion) -> bool {
        self >= other
    }
}

impl Default for KafkaVersion {
    fn default() -> Self {
        KafkaVersion::V2_1_0_0
    }
}

impl fmt::Display for KafkaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        if a == 0 {
            write!(f, "{a}.{b}.{c}.{d}")
        } else {
            write!(f, "{a}.{b}.{c}")
        }
    }
}

impl FromStr for KafkaVersion {
    type Err = Error;

    /// Parses `"2.1.0"`, `"2.1"` or the four part `"0.10.2.0"` form.
    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(Error::Config(format!("invalid kafka version {s:?}")));
        }
        let mut out = [0u16; 4];
        for (slot, part) in out.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| Error::Config(format!("invalid kafka version {s:?}")))?;
        }
        let version = KafkaVersion(out);
        if version < KafkaVersion::MIN {
            return Err(Error::Config(format!(
                "kafka version {s:?} is older than {}",
                KafkaVersion::MIN
            )));
        }
        Ok(version)
    }
}

/// Version range of one API as implemented by this library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedVersion {
    pub api_key: ApiKey,
    pub min_version: i16,
    pub max_version: i16,
}

impl SupportedVersion {
    pub const fn new(api_key: ApiKey, min_version: i16, max_version: i16) -> Self {
        Self {
            api_key,
            min_version,
            max_version,
        }
    }

    pub const fn supports(&self, version: i16) -> bool {
        version >= self.min_version && version <= self.max_version
    }

    pub const fn to_range(&self) -> ApiVersionRange {
        ApiVersionRange {
            api_key: self.api_key,
            min_version: self.min_version,
            max_version: self.max_version,
        }
    }
}

/// Every API this library implements, with its version range.
pub const SUPPORTED_VERSIONS: &[SupportedVersion] = &[
    SupportedVersion::new(ApiKey::Produce, 0, 7),
    SupportedVersion::new(ApiKey::Fetch, 0, 11),
    SupportedVersion::new(ApiKey::ListOffsets, 0, 5),
    SupportedVersion::new(ApiKey::Metadata, 0, 7),
    SupportedVersion::new(ApiKey::OffsetCommit, 0, 7),
    SupportedVersion::new(ApiKey::OffsetFetch, 0, 5),
    SupportedVersion::new(ApiKey::FindCoordinator, 0, 2),
    SupportedVersion::new(ApiKey::JoinGroup, 0, 5),
    SupportedVersion::new(ApiKey::Heartbeat, 0, 3),
    SupportedVersion::new(ApiKey::LeaveGroup, 0, 2),
    SupportedVersion::new(ApiKey::SyncGroup, 0, 3),
    SupportedVersion::new(ApiKey::DescribeGroups, 0, 2),
    SupportedVersion::new(ApiKey::ListGroups, 0, 2),
    SupportedVersion::new(ApiKey::SaslHandshake, 0, 1),
    SupportedVersion::new(ApiKey::ApiVersions, 0, 2),
    SupportedVersion::new(ApiKey::InitProducerId, 0, 1),
    SupportedVersion::new(ApiKey::AddPartitionsToTxn, 0, 1),
    SupportedVersion::new(ApiKey::AddOffsetsToTxn, 0, 1),
    SupportedVersion::new(ApiKey::EndTxn, 0, 1),
    SupportedVersion::new(ApiKey::TxnOffsetCommit, 0, 2),
    SupportedVersion::new(ApiKey::SaslAuthenticate, 0, 1),
];

/// The library's version table, as advertised by the mock broker.
pub fn default_api_versions() -> Vec<ApiVersionRange> {
    SUPPORTED_VERSIONS.iter().map(|v| v.to_range()).collect()
}

pub fn find_version(api_key: ApiKey) -> Option<&'static SupportedVersion> {
    SUPPORTED_VERSIONS.iter().find(|v| v.api_key == api_key)
}

/// Version ranges a broker advertised through ApiVersions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerVersions {
    ranges: HashMap<i16, (i16, i16)>,
}

impl BrokerVersions {
    pub fn new(ranges: &[ApiVersionRange]) -> Self {
        Self {
            ranges: ranges
                .iter()
                .map(|r| (i16::from(r.api_key), (r.min_version, r.max_version)))
                .collect(),
        }
    }

    pub fn range(&self, api_key: ApiKey) -> Option<(i16, i16)> {
        self.ranges.get(&i16::from(api_key)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Pick the version to send.
///
/// `required` maps a version to the release that introduced it.
pub fn negotiate(
    api_key: ApiKey,
    library: (i16, i16),
    broker: Option<(i16, i16)>,
    cap: KafkaVersion,
    required: impl Fn(i16) -> KafkaVersion,
) -> Result<i16> {
    let (mut low, mut high) = library;
    if let Some((broker_min, broker_max)) = broker {
        low = low.max(broker_min);
        high = high.min(broker_max);
    }
    (low..=high)
        .rev()
        .find(|v| required(*v) <= cap)
        .ok_or(Error::UnsupportedVersion {
            api: api_key.as_str(),
            broker_min: broker.map_or(library.0, |b| b.0),
            broker_max: broker.map_or(library.1, |b| b.1),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn produce_release(version: i16) -> KafkaVersion {
        super::super::release_for(
            &[
                KafkaVersion::V0_8_2_0,
                KafkaVersion::V0_9_0_0,
                KafkaVersion::V0_10_0_0,
                KafkaVersion::V0_11_0_0,
                KafkaVersion::V1_0_0_0,
                KafkaVersion::V1_0_0_0,
                KafkaVersion::V2_0_0_0,
                KafkaVersion::V2_1_0_0,
            ],
            version,
        )
    }

    #[test]
    fn test_parse_kafka_version() {
        assert_eq!("2.1.0".parse::<KafkaVersion>().unwrap(), KafkaVersion::V2_1_0_0);
        assert_eq!("2.1".parse::<KafkaVersion>().unwrap(), KafkaVersion::V2_1_0_0);
        assert_eq!(
            "0.10.2.0".parse::<KafkaVersion>().unwrap(),
            KafkaVersion::V0_10_2_0
        );
        assert!("two".parse::<KafkaVersion>().is_err());
        assert!("0.7.0".parse::<KafkaVersion>().is_err());
    }

    #[test]
    fn test_version_ordering_and_display() {
        assert!(KafkaVersion::V0_10_2_0 < KafkaVersion::V0_11_0_0);
        assert!(KafkaVersion::V2_1_0_0.is_at_least(KafkaVersion::V1_0_0_0));
        assert_eq!(KafkaVersion::V2_1_0_0.to_string(), "2.1.0");
        assert_eq!(KafkaVersion::V0_10_1_0.to_string(), "0.10.1.0");
    }

    #[test]
    fn test_negotiate_uses_highest_common_version() {
        let v = negotiate(
            ApiKey::Produce,
            (0, 7),
            Some((0, 9)),
            KafkaVersion::V2_8_0_0,
            produce_release,
        )
        .unwrap();
        assert_eq!(v, 7);
    }

    #[test]
    fn test_negotiate_respects_version_cap() {
        let v = negotiate(
            ApiKey::Produce,
            (0, 7),
            None,
            KafkaVersion::V0_11_0_0,
            produce_release,
        )
        .unwrap();
        assert_eq!(v, 3);
    }

    #[test]
    fn test_negotiate_respects_broker_range() {
        let v = negotiate(
            ApiKey::Produce,
            (0, 7),
            Some((0, 2)),
            KafkaVersion::V2_8_0_0,
            produce_release,
        )
        .unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn test_negotiate_no_overlap() {
        let err = negotiate(
            ApiKey::Produce,
            (0, 7),
            Some((8, 9)),
            KafkaVersion::V2_8_0_0,
            produce_release,
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::UnsupportedVersion {
                api: "Produce",
                broker_min: 8,
                broker_max: 9
            }
        );
    }

    #[test]
    fn test_supported_versions_cover_every_api() {
        assert_eq!(SUPPORTED_VERSIONS.len(), 21);
        assert!(find_version(ApiKey::Fetch).unwrap().supports(11));
        assert!(!find_version(ApiKey::Fetch).unwrap().supports(12));
        assert!(find_version(ApiKey::Unknown(99)).is_none());
    }
}
