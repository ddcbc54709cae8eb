//! Consumer embedded protocol.
//!
//! JoinGroup carries each member's subscription as opaque metadata and
//! SyncGroup carries each member's assignment as opaque bytes. For
//! `protocol_type = "consumer"` those bytes use the layouts below.
//!
//! ```text
//! metadata:   int16 version | [string topic] | nullable_bytes user_data
//!             (v1+) | [string topic | [int32 partition]] owned_partitions
//! assignment: int16 version | [string topic | [int32 partition]] | nullable_bytes user_data
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i16, be_i32},
};
use nombytes::NomBytes;

use crate::encode::{ToByte, encode_as_array};
use crate::error::Result;
use crate::parser::{parse_array, parse_nullable_bytes, parse_string};

type NomError = nom::error::Error<NomBytes>;

fn encode_topic_partitions<W: BufMut>(
    buffer: &mut W,
    topics: &BTreeMap<String, Vec<i32>>,
) -> Result<()> {
    let entries: Vec<(&String, &Vec<i32>)> = topics.iter().collect();
    encode_as_array(buffer, &entries, |buffer, (topic, partitions)| {
        topic.encode(buffer)?;
        partitions.encode(buffer)
    })
}

fn parse_topic_partitions(input: NomBytes) -> IResult<NomBytes, BTreeMap<String, Vec<i32>>> {
    fn entry(input: NomBytes) -> IResult<NomBytes, (String, Vec<i32>)> {
        let (input, topic) = parse_string(input)?;
        let (input, partitions) = parse_array(be_i32::<NomBytes, NomError>)(input)?;
        Ok((input, (topic, partitions)))
    }
    let (input, entries) = parse_array(entry)(input)?;
    Ok((input, entries.into_iter().collect()))
}

/// Subscription a member announces in JoinGroup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsumerGroupMemberMetadata {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Option<Bytes>,
    /// Version 1 only.
    pub owned_partitions: BTreeMap<String, Vec<i32>>,
}

impl ConsumerGroupMemberMetadata {
    pub fn new(topics: Vec<String>, user_data: Option<Bytes>) -> Self {
        Self {
            version: 0,
            topics,
            user_data,
            owned_partitions: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        self.version.encode(&mut buffer)?;
        encode_as_array(&mut buffer, &self.topics, |buffer, t| t.encode(buffer))?;
        self.user_data.encode(&mut buffer)?;
        if self.version >= 1 {
            encode_topic_partitions(&mut buffer, &self.owned_partitions)?;
        }
        Ok(buffer.freeze())
    }

    pub fn decode(bytes: &Bytes) -> Result<Self> {
        let input = NomBytes::new(bytes.clone());
        let (input, version) = be_i16::<NomBytes, NomError>(input)?;
        let (input, topics) = parse_array(parse_string)(input)?;
        let (input, user_data) = parse_nullable_bytes(input)?;
        // Older writers may omit the owned partitions even at version 1.
        let owned_partitions = if version >= 1 && !input.clone().into_bytes().is_empty() {
            parse_topic_partitions(input)?.1
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            version,
            topics,
            user_data,
            owned_partitions,
        })
    }
}

/// Partitions the leader hands to one member through SyncGroup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConsumerGroupMemberAssignment {
    pub version: i16,
    pub topics: BTreeMap<String, Vec<i32>>,
    pub user_data: Option<Bytes>,
}

impl ConsumerGroupMemberAssignment {
    pub fn new(topics: BTreeMap<String, Vec<i32>>) -> Self {
        Self {
            version: 0,
            topics,
            user_data: None,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        self.version.encode(&mut buffer)?;
        encode_topic_partitions(&mut buffer, &self.topics)?;
        self.user_data.encode(&mut buffer)?;
        Ok(buffer.freeze())
    }

    /// An empty payload is a member that received nothing.
    pub fn decode(bytes: &Bytes) -> Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        let input = NomBytes::new(bytes.clone());
        let (input, version) = be_i16::<NomBytes, NomError>(input)?;
        let (input, topics) = parse_topic_partitions(input)?;
        let user_data = if input.clone().into_bytes().is_empty() {
            None
        } else {
            parse_nullable_bytes(input)?.1
        };
        Ok(Self {
            version,
            topics,
            user_data,
        })
    }

    pub fn partition_count(&self) -> usize {
        self.topics.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_bytes() {
        let metadata = ConsumerGroupMemberMetadata::new(vec!["t".to_string()], None);
        let bytes = metadata.encode().unwrap();
        let expected: Vec<u8> = vec![
            0x00, 0x00, // version
            0x00, 0x00, 0x00, 0x01, 0x00, 0x01, b't', // topics
            0xFF, 0xFF, 0xFF, 0xFF, // null user data
        ];
        assert_eq!(bytes.as_ref(), expected.as_slice());
        assert_eq!(ConsumerGroupMemberMetadata::decode(&bytes).unwrap(), metadata);
    }

    #[test]
    fn test_metadata_v1_owned_partitions() {
        let mut metadata = ConsumerGroupMemberMetadata::new(
            vec!["a".to_string(), "b".to_string()],
            Some(Bytes::from_static(b"ud")),
        );
        metadata.version = 1;
        metadata.owned_partitions.insert("a".to_string(), vec![0, 2]);
        let bytes = metadata.encode().unwrap();
        assert_eq!(ConsumerGroupMemberMetadata::decode(&bytes).unwrap(), metadata);
    }

    #[test]
    fn test_assignment_round_trip() {
        let mut topics = BTreeMap::new();
        topics.insert("a".to_string(), vec![0, 1]);
        topics.insert("b".to_string(), vec![3]);
        let assignment = ConsumerGroupMemberAssignment::new(topics);
        let bytes = assignment.encode().unwrap();
        let decoded = ConsumerGroupMemberAssignment::decode(&bytes).unwrap();
        assert_eq!(decoded, assignment);
        assert_eq!(decoded.partition_count(), 3);
    }

    #[test]
    fn test_empty_assignment() {
        let decoded = ConsumerGroupMemberAssignment::decode(&Bytes::new()).unwrap();
        assert!(decoded.topics.is_empty());
    }

    #[test]
    fn test_truncated_assignment_fails() {
        let bytes = Bytes::from_static(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00]);
        assert!(ConsumerGroupMemberAssignment::decode(&bytes).is_err());
    }
}
