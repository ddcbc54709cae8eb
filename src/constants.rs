//! Centralized protocol and client constants.
//!
//! Wire-format offsets live next to the limits the codec enforces so that the
//! record batch encoder, the decoder and the mock broker agree on one source.
//!
//! # Categories
//!
//! - **Protocol Constants**: Kafka wire protocol sizes and limits
//! - **Record Constants**: RecordBatch v2 and legacy message layout
//! - **Client Defaults**: default values used by [`crate::config::Config`]

use std::time::Duration;

// =============================================================================
// Protocol Constants (Kafka Wire Protocol)
// =============================================================================

/// Minimum size of a Kafka record batch header.
///
/// This is the fixed overhead for each record batch, consisting of:
/// - baseOffset (8 bytes)
/// - batchLength (4 bytes)
/// - partitionLeaderEpoch (4 bytes)
/// - magic (1 byte)
/// - crc (4 bytes)
/// - attributes (2 bytes)
/// - lastOffsetDelta (4 bytes)
/// - baseTimestamp (8 bytes)
/// - maxTimestamp (8 bytes)
/// - producerId (8 bytes)
/// - producerEpoch (2 bytes)
/// - baseSequence (4 bytes)
/// - recordCount (4 bytes)
///
/// Total: 61 bytes
pub const RECORD_BATCH_HEADER_SIZE: usize = 61;

/// Bytes preceding the batch length field's coverage (baseOffset + batchLength).
pub const RECORD_BATCH_LOG_OVERHEAD: usize = 12;

/// Offset of the magic byte, shared by every record format.
pub const MAGIC_OFFSET: usize = 16;

/// Offset of the CRC field (4 bytes, u32 big-endian).
pub const BATCH_CRC_OFFSET: usize = 17;

/// Start of the CRC-covered region (attributes field).
/// CRC is computed over bytes [21..end] of the batch.
pub const BATCH_CRC_DATA_START: usize = 21;

/// Offset of the last_offset_delta field (4 bytes, i32 big-endian).
pub const BATCH_LAST_OFFSET_DELTA_OFFSET: usize = 23;

/// Offset of the producer_id field (8 bytes, i64 big-endian).
pub const BATCH_PRODUCER_ID_OFFSET: usize = 43;

/// Offset of the producer_epoch field (2 bytes, i16 big-endian).
pub const BATCH_PRODUCER_EPOCH_OFFSET: usize = 51;

/// Offset of the first_sequence field (4 bytes, i32 big-endian).
pub const BATCH_FIRST_SEQUENCE_OFFSET: usize = 53;

/// Legacy message overhead before key: offset(8) + size(4) + crc(4) + magic(1) + attributes(1).
pub const LEGACY_MESSAGE_OVERHEAD_V0: usize = 26;

/// Legacy v1 adds an 8 byte timestamp.
pub const LEGACY_MESSAGE_OVERHEAD_V1: usize = 34;

/// Maximum allowed array size in Kafka protocol parsing.
///
/// This prevents memory exhaustion from malformed messages that claim
/// to have billions of elements.
pub const MAX_PROTOCOL_ARRAY_SIZE: i32 = 1_000_000;

/// Largest string an `int16` length prefix can describe.
pub const MAX_STRING_LENGTH: usize = i16::MAX as usize;

/// Largest response frame the connection reader accepts (100 MB).
pub const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// Attribute bit marking a RecordBatch as transactional.
pub const ATTR_TRANSACTIONAL: i16 = 0x10;

/// Attribute bit marking a RecordBatch as a control batch.
pub const ATTR_CONTROL: i16 = 0x20;

/// Attribute bit requesting log-append time instead of create time.
pub const ATTR_LOG_APPEND_TIME: i16 = 0x08;

/// Low bits of the attributes field holding the compression codec.
pub const ATTR_COMPRESSION_MASK: i16 = 0x07;

/// Sentinel for "no producer id" in record batches and InitProducerId.
pub const NO_PRODUCER_ID: i64 = -1;

/// Sentinel for "no producer epoch".
pub const NO_PRODUCER_EPOCH: i16 = -1;

/// Sentinel for "no sequence" in non-idempotent batches.
pub const NO_SEQUENCE: i32 = -1;

/// Sentinel for "no partition leader".
pub const NO_LEADER: i32 = -1;

/// ListOffsets timestamp resolving to the log end offset.
pub const OFFSET_NEWEST: i64 = -1;

/// ListOffsets timestamp resolving to the log start offset.
pub const OFFSET_OLDEST: i64 = -2;

/// Offset returned by OffsetFetch when the group has no commit.
pub const NO_COMMITTED_OFFSET: i64 = -1;

/// Retention time telling the broker to use its configured default.
pub const DEFAULT_RETENTION_TIME: i64 = -1;

// =============================================================================
// Client Defaults
// =============================================================================

/// Default client id sent in every request header.
pub const DEFAULT_CLIENT_ID: &str = "gregor";

/// Default bounded channel capacity for producer ingress and consumer delivery.
pub const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 256;

/// Default `net.max-open-requests`.
pub const DEFAULT_MAX_OPEN_REQUESTS: usize = 5;

/// Default dial, read and write timeout.
pub const DEFAULT_NET_TIMEOUT: Duration = Duration::from_secs(30);

/// Default metadata refresh attempts before surfacing "no available brokers".
pub const DEFAULT_METADATA_RETRY_MAX: u32 = 3;

/// Default pause between metadata refresh attempts.
pub const DEFAULT_METADATA_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Default background metadata refresh interval.
pub const DEFAULT_METADATA_REFRESH_FREQUENCY: Duration = Duration::from_secs(600);

/// Default maximum encoded size of one produced message (1 MB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1_000_000;

/// Default produce acks timeout.
pub const DEFAULT_PRODUCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default producer retry count.
pub const DEFAULT_PRODUCER_RETRY_MAX: u32 = 3;

/// Default pause between producer retries.
pub const DEFAULT_PRODUCER_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default `consumer.fetch.min` in bytes.
pub const DEFAULT_FETCH_MIN: i32 = 1;

/// Default `consumer.fetch.default` in bytes (1 MB).
pub const DEFAULT_FETCH_DEFAULT: i32 = 1024 * 1024;

/// Library-wide ceiling for fetch size doubling when `consumer.fetch.max` is 0.
pub const FETCH_SIZE_CEILING: i32 = 100 * 1024 * 1024;

/// Default `consumer.max-wait-time`.
pub const DEFAULT_MAX_WAIT_TIME: Duration = Duration::from_millis(500);

/// Default `consumer.max-processing-time`.
pub const DEFAULT_MAX_PROCESSING_TIME: Duration = Duration::from_millis(100);

/// Default pause after a failed fetch before retrying.
pub const DEFAULT_CONSUMER_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Default offset commit interval.
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Default group session timeout.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default group heartbeat interval.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Default group rebalance timeout.
pub const DEFAULT_REBALANCE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default rejoin attempts before the group surfaces the error.
pub const DEFAULT_REBALANCE_RETRY_MAX: u32 = 4;

/// Default pause between rejoin attempts.
pub const DEFAULT_REBALANCE_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Protocol type announced by consumer group members.
pub const CONSUMER_PROTOCOL_TYPE: &str = "consumer";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_offsets_are_consistent() {
        assert_eq!(MAGIC_OFFSET + 1, BATCH_CRC_OFFSET);
        assert_eq!(BATCH_CRC_OFFSET + 4, BATCH_CRC_DATA_START);
        assert_eq!(BATCH_FIRST_SEQUENCE_OFFSET + 8, RECORD_BATCH_HEADER_SIZE);
    }

    #[test]
    fn test_heartbeat_default_below_session_timeout() {
        assert!(DEFAULT_HEARTBEAT_INTERVAL < DEFAULT_SESSION_TIMEOUT);
    }
}
