//! Crate & protocol level errors.
//!
//! # Error Hierarchy
//!
//! - [`Error`]: every failure the client reports, from socket errors up to
//!   fatal producer conditions
//! - [`KafkaCode`]: wire protocol error codes carried in broker responses
//!
//! Broker codes reach callers wrapped as [`Error::Kafka`]. The classification
//! helpers on both types drive the retry decisions made by the producer,
//! consumer and group coordinator.

use nombytes::NomBytes;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Client errors.
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    /// An error in the network.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// A field violates the wire contract and cannot be encoded.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The bytes do not form a valid message for the expected version.
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// A record batch or legacy message failed its checksum.
    #[error("CRC mismatch: stored {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Missing data or connection closed mid-frame.
    #[error("Missing data: {0}")]
    MissingData(String),

    /// The broker answered with a non-zero error code.
    #[error("Kafka error: {0:?}")]
    Kafka(KafkaCode),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The producer, consumer or group was closed before the operation ran.
    #[error("Client is shutting down")]
    ShuttingDown,

    /// The client has been closed.
    #[error("Client has been closed")]
    ClosedClient,

    /// The broker connection was closed while the request was pending.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The broker connection has not been opened.
    #[error("Broker not connected")]
    NotConnected,

    /// Every known broker failed to answer a metadata request.
    #[error("No available brokers")]
    OutOfBrokers,

    /// A request or read exceeded its deadline.
    #[error("Request timed out")]
    RequestTimeout,

    /// No protocol version is usable by both sides.
    #[error("Unsupported version for {api}: broker [{broker_min}, {broker_max}]")]
    UnsupportedVersion {
        api: &'static str,
        broker_min: i16,
        broker_max: i16,
    },

    /// A single fetched message exceeds the largest allowed fetch size.
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(i32),

    /// SASL negotiation failed on the client side.
    #[error("SASL authentication failed: {0}")]
    SaslAuthentication(String),

    /// The idempotent or transactional producer can no longer continue.
    #[error("Fatal producer error: {0}")]
    ProducerFatal(String),

    /// A transactional operation was called in the wrong state.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// An internal ordering or sequencing guarantee was broken.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// A partition is already being consumed by this consumer.
    #[error("Partition {topic}/{partition} is already being consumed")]
    AlreadyConsuming { topic: String, partition: i32 },

    /// The consumer group was closed.
    #[error("Consumer group closed")]
    ClosedConsumerGroup,
}

impl Error {
    /// Whether the failed operation may succeed if retried after a refresh.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Kafka(code) => code.is_retriable(),
            Error::IoError(_)
            | Error::ConnectionClosed
            | Error::NotConnected
            | Error::MissingData(_)
            | Error::RequestTimeout
            | Error::OutOfBrokers => true,
            _ => false,
        }
    }

    /// Whether the error invalidates the connection it arrived on.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Error::IoError(_)
                | Error::ConnectionClosed
                | Error::NotConnected
                | Error::MissingData(_)
                | Error::RequestTimeout
        )
    }

    /// The broker code behind this error, if any.
    pub fn kafka_code(&self) -> Option<KafkaCode> {
        match self {
            Error::Kafka(code) => Some(*code),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl From<KafkaCode> for Error {
    fn from(code: KafkaCode) -> Self {
        Error::Kafka(code)
    }
}

impl From<nom::Err<nom::error::Error<NomBytes>>> for Error {
    fn from(e: nom::Err<nom::error::Error<NomBytes>>) -> Self {
        match e {
            nom::Err::Incomplete(_) => Error::Decoding("insufficient data".to_string()),
            nom::Err::Error(inner) | nom::Err::Failure(inner) => Error::Decoding(format!(
                "{:?} with {} bytes remaining",
                inner.code,
                inner.input.into_bytes().len()
            )),
        }
    }
}

/// Various errors reported by a remote Kafka server.
/// See also [Kafka Errors](http://kafka.apache.org/protocol.html)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive, Default)]
pub enum KafkaCode {
    /// An unexpected server error
    Unknown = -1,
    #[default]
    None = 0,
    /// The requested offset is outside the range of offsets
    /// maintained by the server for the given topic/partition
    OffsetOutOfRange = 1,
    /// This indicates that a message contents does not match its CRC
    CorruptMessage = 2,
    /// This request is for a topic or partition that does not exist
    /// on this broker.
    UnknownTopicOrPartition = 3,
    /// The message has a negative size
    InvalidMessageSize = 4,
    /// There is currently no leader for this partition and hence it is
    /// unavailable for writes.
    LeaderNotAvailable = 5,
    /// The client sent a request to a replica that is not the leader.
    /// Its metadata is out of date.
    NotLeaderForPartition = 6,
    /// The request exceeded the user-specified time limit.
    RequestTimedOut = 7,
    BrokerNotAvailable = 8,
    ReplicaNotAvailable = 9,
    /// The message exceeds the broker's configured maximum size.
    MessageSizeTooLarge = 10,
    StaleControllerEpoch = 11,
    /// Offset metadata string larger than the broker allows.
    OffsetMetadataTooLarge = 12,
    /// The server disconnected before a response was received.
    NetworkException = 13,
    /// The coordinator is still loading group metadata.
    CoordinatorLoadInProgress = 14,
    /// The offsets topic has not been created or the coordinator is not active.
    CoordinatorNotAvailable = 15,
    /// This broker is not the coordinator for the group.
    NotCoordinator = 16,
    InvalidTopic = 17,
    RecordListTooLarge = 18,
    /// Fewer in-sync replicas than required with acks = all.
    NotEnoughReplicas = 19,
    NotEnoughReplicasAfterAppend = 20,
    InvalidRequiredAcks = 21,
    /// The generation id is not the current generation.
    IllegalGeneration = 22,
    InconsistentGroupProtocol = 23,
    InvalidGroupId = 24,
    /// The member id is not in the current generation.
    UnknownMemberId = 25,
    /// The session timeout is outside the broker's allowed range.
    InvalidSessionTimeout = 26,
    /// The coordinator has begun rebalancing the group.
    RebalanceInProgress = 27,
    InvalidCommitOffsetSize = 28,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
    ClusterAuthorizationFailed = 31,
    InvalidTimestamp = 32,
    UnsupportedSaslMechanism = 33,
    IllegalSaslState = 34,
    UnsupportedVersion = 35,
    TopicAlreadyExists = 36,
    InvalidPartitions = 37,
    InvalidReplicationFactor = 38,
    InvalidReplicaAssignment = 39,
    InvalidConfig = 40,
    NotController = 41,
    InvalidRequest = 42,
    UnsupportedForMessageFormat = 43,
    PolicyViolation = 44,
    /// The broker received an out of order sequence number.
    OutOfOrderSequenceNumber = 45,
    /// The broker already has this batch; it was deduplicated.
    DuplicateSequenceNumber = 46,
    InvalidProducerEpoch = 47,
    InvalidTxnState = 48,
    InvalidProducerIdMapping = 49,
    InvalidTransactionTimeout = 50,
    ConcurrentTransactions = 51,
    TransactionCoordinatorFenced = 52,
    TransactionalIdAuthorizationFailed = 53,
    SecurityDisabled = 54,
    OperationNotAttempted = 55,
    KafkaStorageError = 56,
    LogDirNotFound = 57,
    SaslAuthenticationFailed = 58,
    UnknownProducerId = 59,
    ReassignmentInProgress = 60,
    FencedLeaderEpoch = 74,
    UnknownLeaderEpoch = 75,
    UnsupportedCompressionType = 76,
    StaleBrokerEpoch = 77,
    OffsetNotAvailable = 78,
    MemberIdRequired = 79,
    PreferredLeaderNotAvailable = 80,
    GroupMaxSizeReached = 81,
    FencedInstanceId = 82,
    ProducerFenced = 90,
}

impl KafkaCode {
    /// Decode a wire code, mapping codes this client does not know to `Unknown`.
    pub fn from_code(code: i16) -> KafkaCode {
        KafkaCode::from_i16(code).unwrap_or(KafkaCode::Unknown)
    }

    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn is_ok(self) -> bool {
        self == KafkaCode::None
    }

    /// Codes after which the same request may succeed once metadata or the
    /// coordinator has been refreshed.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            KafkaCode::CorruptMessage
                | KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::RequestTimedOut
                | KafkaCode::NetworkException
                | KafkaCode::CoordinatorLoadInProgress
                | KafkaCode::CoordinatorNotAvailable
                | KafkaCode::NotCoordinator
                | KafkaCode::NotEnoughReplicas
                | KafkaCode::NotEnoughReplicasAfterAppend
                | KafkaCode::RebalanceInProgress
                | KafkaCode::ConcurrentTransactions
                | KafkaCode::KafkaStorageError
                | KafkaCode::FencedLeaderEpoch
                | KafkaCode::UnknownLeaderEpoch
                | KafkaCode::OffsetNotAvailable
                | KafkaCode::PreferredLeaderNotAvailable
        )
    }

    /// Codes after which partition leadership must be looked up again.
    pub fn invalidates_metadata(self) -> bool {
        matches!(
            self,
            KafkaCode::UnknownTopicOrPartition
                | KafkaCode::LeaderNotAvailable
                | KafkaCode::NotLeaderForPartition
                | KafkaCode::ReplicaNotAvailable
                | KafkaCode::FencedLeaderEpoch
                | KafkaCode::UnknownLeaderEpoch
                | KafkaCode::KafkaStorageError
        )
    }

    /// Codes after which the group or transaction coordinator must be found again.
    pub fn invalidates_coordinator(self) -> bool {
        matches!(
            self,
            KafkaCode::CoordinatorNotAvailable | KafkaCode::NotCoordinator
        )
    }

    /// Codes that leave an idempotent or transactional producer unusable.
    pub fn is_fatal_for_producer(self) -> bool {
        matches!(
            self,
            KafkaCode::OutOfOrderSequenceNumber
                | KafkaCode::InvalidProducerEpoch
                | KafkaCode::InvalidTxnState
                | KafkaCode::ProducerFenced
                | KafkaCode::InvalidProducerIdMapping
                | KafkaCode::TransactionalIdAuthorizationFailed
                | KafkaCode::ClusterAuthorizationFailed
                | KafkaCode::UnknownProducerId
        )
    }

    /// Authentication and authorization failures.
    pub fn is_auth_error(self) -> bool {
        matches!(
            self,
            KafkaCode::SaslAuthenticationFailed
                | KafkaCode::TopicAuthorizationFailed
                | KafkaCode::GroupAuthorizationFailed
                | KafkaCode::ClusterAuthorizationFailed
                | KafkaCode::TransactionalIdAuthorizationFailed
        )
    }

    /// Turn a response code into a `Result`.
    pub fn ok(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(Error::Kafka(self))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_io_error() {
        let err = Error::from(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(err, Error::IoError(io::ErrorKind::ConnectionRefused));
        assert!(err.is_retriable());
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let err = Error::MissingData("test".to_string());
        let display = format!("{}", err);
        assert!(display.contains("Missing data"));
        assert!(display.contains("test"));
    }

    #[test]
    fn test_kafka_code_from_code() {
        assert_eq!(KafkaCode::from_code(-1), KafkaCode::Unknown);
        assert_eq!(KafkaCode::from_code(0), KafkaCode::None);
        assert_eq!(KafkaCode::from_code(6), KafkaCode::NotLeaderForPartition);
        assert_eq!(KafkaCode::from_code(46), KafkaCode::DuplicateSequenceNumber);
        assert_eq!(KafkaCode::from_code(90), KafkaCode::ProducerFenced);
        assert_eq!(KafkaCode::from_code(999), KafkaCode::Unknown);
    }

    #[test]
    fn test_retriable_classification() {
        for code in [
            KafkaCode::NotLeaderForPartition,
            KafkaCode::LeaderNotAvailable,
            KafkaCode::NotEnoughReplicas,
            KafkaCode::NotEnoughReplicasAfterAppend,
            KafkaCode::RequestTimedOut,
            KafkaCode::CoordinatorLoadInProgress,
            KafkaCode::NotCoordinator,
            KafkaCode::RebalanceInProgress,
        ] {
            assert!(code.is_retriable(), "{code:?}");
        }
        for code in [
            KafkaCode::NotController,
            KafkaCode::MessageSizeTooLarge,
            KafkaCode::SaslAuthenticationFailed,
            KafkaCode::OutOfOrderSequenceNumber,
        ] {
            assert!(!code.is_retriable(), "{code:?}");
        }
    }

    #[test]
    fn test_producer_fatal_codes() {
        assert!(KafkaCode::OutOfOrderSequenceNumber.is_fatal_for_producer());
        assert!(KafkaCode::ProducerFenced.is_fatal_for_producer());
        assert!(!KafkaCode::DuplicateSequenceNumber.is_fatal_for_producer());
    }

    #[test]
    fn test_code_ok() {
        assert!(KafkaCode::None.ok().is_ok());
        assert_eq!(
            KafkaCode::NotCoordinator.ok(),
            Err(Error::Kafka(KafkaCode::NotCoordinator))
        );
    }

    #[test]
    fn test_nom_error_maps_to_decoding() {
        let input = NomBytes::from(&b"ab"[..]);
        let err: Error =
            nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Eof)).into();
        assert!(matches!(err, Error::Decoding(_)));
    }
}
