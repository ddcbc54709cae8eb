//! Small value types shared by the producer, consumer and group modules.
//!
//! These give names to the integer and string conventions of the protocol so
//! that a partition is never confused with a broker id, and sentinel offsets
//! are spelled out as variants instead of magic numbers.

use std::fmt;
use std::str::FromStr;

use crate::constants::{NO_PRODUCER_EPOCH, NO_PRODUCER_ID, OFFSET_NEWEST, OFFSET_OLDEST};
use crate::error::Error;

/// A (topic, partition) pair.
///
/// Ordering is by topic name and then partition, which is the order the
/// assignors and the produce request builder rely on for determinism.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl From<(&str, i32)> for TopicPartition {
    fn from((topic, partition): (&str, i32)) -> Self {
        TopicPartition::new(topic, partition)
    }
}

impl From<(String, i32)> for TopicPartition {
    fn from((topic, partition): (String, i32)) -> Self {
        TopicPartition { topic, partition }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Producer id and epoch handed out by InitProducerId.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerIdentity {
    pub producer_id: i64,
    pub epoch: i16,
}

impl ProducerIdentity {
    pub const NONE: Self = ProducerIdentity {
        producer_id: NO_PRODUCER_ID,
        epoch: NO_PRODUCER_EPOCH,
    };

    pub fn is_valid(&self) -> bool {
        self.producer_id >= 0
    }
}

impl Default for ProducerIdentity {
    fn default() -> Self {
        Self::NONE
    }
}

/// Acknowledgement level carried in every produce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequiredAcks {
    /// Fire and forget; the broker sends no response.
    None,
    /// The leader has written the records to its log.
    #[default]
    Leader,
    /// All in-sync replicas have the records.
    All,
}

impl RequiredAcks {
    pub fn as_i16(self) -> i16 {
        match self {
            RequiredAcks::None => 0,
            RequiredAcks::Leader => 1,
            RequiredAcks::All => -1,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            0 => RequiredAcks::None,
            1 => RequiredAcks::Leader,
            _ => RequiredAcks::All,
        }
    }
}

impl FromStr for RequiredAcks {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "0" => Ok(RequiredAcks::None),
            "leader" | "1" => Ok(RequiredAcks::Leader),
            "all" | "-1" => Ok(RequiredAcks::All),
            other => Err(Error::Config(format!("unknown required acks {other:?}"))),
        }
    }
}

/// Transaction visibility for fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    ReadUncommitted,
    ReadCommitted,
}

impl IsolationLevel {
    pub fn as_i8(self) -> i8 {
        match self {
            IsolationLevel::ReadUncommitted => 0,
            IsolationLevel::ReadCommitted => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        if value == 1 {
            IsolationLevel::ReadCommitted
        } else {
            IsolationLevel::ReadUncommitted
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "read-uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read-committed" => Ok(IsolationLevel::ReadCommitted),
            other => Err(Error::Config(format!("unknown isolation level {other:?}"))),
        }
    }
}

/// Where a partition consumer starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOffset {
    /// The log start offset, resolved with timestamp `-2`.
    Oldest,
    /// The log end offset, resolved with timestamp `-1`.
    #[default]
    Newest,
    /// A literal offset.
    At(i64),
}

impl StartOffset {
    /// The ListOffsets timestamp for the sentinel variants.
    pub fn timestamp(self) -> Option<i64> {
        match self {
            StartOffset::Oldest => Some(OFFSET_OLDEST),
            StartOffset::Newest => Some(OFFSET_NEWEST),
            StartOffset::At(_) => None,
        }
    }
}

impl FromStr for StartOffset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oldest" | "earliest" => Ok(StartOffset::Oldest),
            "newest" | "latest" => Ok(StartOffset::Newest),
            other => other
                .parse::<i64>()
                .map(StartOffset::At)
                .map_err(|_| Error::Config(format!("unknown initial offset {other:?}"))),
        }
    }
}

/// Which kind of coordinator a FindCoordinator request looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorType {
    Group,
    Transaction,
}

impl CoordinatorType {
    pub fn as_i8(self) -> i8 {
        match self {
            CoordinatorType::Group => 0,
            CoordinatorType::Transaction => 1,
        }
    }

    pub fn from_i8(value: i8) -> Self {
        if value == 1 {
            CoordinatorType::Transaction
        } else {
            CoordinatorType::Group
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_ordering() {
        let mut tps = vec![
            TopicPartition::new("b", 0),
            TopicPartition::new("a", 2),
            TopicPartition::new("a", 1),
        ];
        tps.sort();
        assert_eq!(
            tps,
            vec![
                TopicPartition::new("a", 1),
                TopicPartition::new("a", 2),
                TopicPartition::new("b", 0),
            ]
        );
        assert_eq!(tps[0].to_string(), "a/1");
    }

    #[test]
    fn test_required_acks_wire_values() {
        assert_eq!(RequiredAcks::None.as_i16(), 0);
        assert_eq!(RequiredAcks::Leader.as_i16(), 1);
        assert_eq!(RequiredAcks::All.as_i16(), -1);
        assert_eq!(RequiredAcks::from_i16(-1), RequiredAcks::All);
        assert_eq!("all".parse::<RequiredAcks>().unwrap(), RequiredAcks::All);
        assert!("some".parse::<RequiredAcks>().is_err());
    }

    #[test]
    fn test_isolation_level_parse() {
        assert_eq!(
            "read_committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert_eq!(IsolationLevel::ReadCommitted.as_i8(), 1);
    }

    #[test]
    fn test_start_offset() {
        assert_eq!(StartOffset::Oldest.timestamp(), Some(-2));
        assert_eq!(StartOffset::Newest.timestamp(), Some(-1));
        assert_eq!(StartOffset::At(5).timestamp(), None);
        assert_eq!("42".parse::<StartOffset>().unwrap(), StartOffset::At(42));
        assert_eq!("oldest".parse::<StartOffset>().unwrap(), StartOffset::Oldest);
    }

    #[test]
    fn test_producer_identity_default_is_invalid() {
        assert!(!ProducerIdentity::default().is_valid());
    }
}
