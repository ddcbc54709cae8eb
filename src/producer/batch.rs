//! Per-partition accumulation and record encoding.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::config::{FlushConfig, ProducerConfig};
use crate::constants::RECORD_BATCH_HEADER_SIZE;
use crate::error::Result;
use crate::metrics::{self, MetricsRegistry};
use crate::producer::ProducerMessage;
use crate::protocol::KafkaVersion;
use crate::protocol::records::{
    Message, MessageBlock, Record, RecordBatch, encode_message_set,
};
use crate::types::ProducerIdentity;

/// Per-record framing overhead assumed when sizing a pending batch.
const RECORD_OVERHEAD: usize = 21;

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Record format the producer writes for a configured broker version. The
/// configured version rather than a negotiated one decides, so a batch stays
/// byte-identical when it is retried against a different leader.
pub(crate) fn magic_for(version: KafkaVersion) -> i8 {
    if version.is_at_least(KafkaVersion::V0_11_0_0) {
        2
    } else if version.is_at_least(KafkaVersion::V0_10_0_0) {
        1
    } else {
        0
    }
}

/// Sequence numbers wrap to zero after `i32::MAX`.
pub(crate) fn advance_sequence(sequence: i32, count: usize) -> i32 {
    ((sequence as i64 + count as i64) % (i32::MAX as i64 + 1)) as i32
}

/// Messages waiting to be sent for one partition.
#[derive(Debug, Default)]
pub(crate) struct PendingBatch {
    messages: Vec<ProducerMessage>,
    bytes: usize,
}

impl PendingBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Whether adding `message` would push the batch past `max_bytes`.
    pub fn would_overflow(&self, message: &ProducerMessage, max_bytes: usize) -> bool {
        !self.is_empty()
            && RECORD_BATCH_HEADER_SIZE + self.bytes + message.byte_size() + RECORD_OVERHEAD
                > max_bytes
    }

    pub fn push(&mut self, message: ProducerMessage) {
        self.bytes += message.byte_size() + RECORD_OVERHEAD;
        self.messages.push(message);
    }

    /// Whether a flush trigger has fired. With no trigger configured every
    /// message is sent as soon as it arrives.
    pub fn is_ready(&self, flush: &FlushConfig) -> bool {
        if self.is_empty() {
            return false;
        }
        let unconfigured = flush.messages == 0 && flush.bytes == 0 && flush.frequency.is_none();
        unconfigured
            || (flush.messages > 0 && self.len() >= flush.messages)
            || (flush.bytes > 0 && self.bytes >= flush.bytes)
            || (flush.max_messages > 0 && self.len() >= flush.max_messages)
    }

    pub fn take(&mut self) -> Vec<ProducerMessage> {
        self.bytes = 0;
        std::mem::take(&mut self.messages)
    }
}

/// A batch on the wire, reused unchanged across retries.
#[derive(Debug, Clone)]
pub(crate) struct EncodedBatch {
    pub records: Bytes,
    pub count: usize,
    pub first_sequence: i32,
}

pub(crate) struct BatchEncoder<'a> {
    pub config: &'a ProducerConfig,
    pub magic: i8,
    pub identity: ProducerIdentity,
    pub transactional: bool,
    pub metrics: &'a dyn MetricsRegistry,
}

impl BatchEncoder<'_> {
    /// Encode `messages`, stamping missing timestamps with the current time.
    pub fn encode(
        &self,
        topic: &str,
        messages: &mut [ProducerMessage],
        first_sequence: i32,
    ) -> Result<EncodedBatch> {
        let now = now_ms();
        for message in messages.iter_mut() {
            message.timestamp.get_or_insert(now);
        }

        let (records, uncompressed) = if self.magic >= 2 {
            self.encode_record_batch(messages, first_sequence)?
        } else {
            self.encode_legacy(messages)?
        };

        let ratio = metrics::compression_ratio(uncompressed, records.len());
        for name in [metrics::BATCH_SIZE.to_string(), metrics::for_topic(metrics::BATCH_SIZE, topic)] {
            self.metrics.update_histogram(&name, records.len() as i64);
        }
        for name in [
            metrics::COMPRESSION_RATIO.to_string(),
            metrics::for_topic(metrics::COMPRESSION_RATIO, topic),
        ] {
            self.metrics.update_histogram(&name, ratio);
        }

        Ok(EncodedBatch {
            records,
            count: messages.len(),
            first_sequence,
        })
    }

    fn encode_record_batch(
        &self,
        messages: &[ProducerMessage],
        first_sequence: i32,
    ) -> Result<(Bytes, usize)> {
        let timestamps = messages.iter().filter_map(|m| m.timestamp);
        let first_timestamp = timestamps.clone().min().unwrap_or_default();
        let max_timestamp = timestamps.max().unwrap_or_default();

        let records = messages
            .iter()
            .enumerate()
            .map(|(i, m)| Record {
                attributes: 0,
                timestamp_delta: m.timestamp.unwrap_or(first_timestamp) - first_timestamp,
                offset_delta: i as i32,
                key: m.key.clone(),
                value: m.value.clone(),
                headers: m.headers.clone(),
            })
            .collect::<Vec<_>>();

        let idempotent = self.identity.is_valid();
        let batch = RecordBatch {
            compression: self.config.compression,
            is_transactional: self.transactional,
            last_offset_delta: records.len() as i32 - 1,
            first_timestamp,
            max_timestamp,
            producer_id: self.identity.producer_id,
            producer_epoch: self.identity.epoch,
            first_sequence: if idempotent { first_sequence } else { -1 },
            records,
            ..Default::default()
        };
        let uncompressed = batch.encoded_size();
        Ok((batch.encode(self.config.compression_level)?, uncompressed))
    }

    fn encode_legacy(&self, messages: &[ProducerMessage]) -> Result<(Bytes, usize)> {
        if messages.iter().any(|m| !m.headers.is_empty()) {
            tracing::debug!(magic = self.magic, "Dropping record headers unsupported by message format");
        }
        let blocks = messages
            .iter()
            .enumerate()
            .map(|(i, m)| MessageBlock {
                offset: i as i64,
                message: Message {
                    magic: self.magic,
                    compression: Default::default(),
                    log_append_time: false,
                    timestamp: (self.magic >= 1).then(|| m.timestamp.unwrap_or_default()),
                    key: m.key.clone(),
                    value: m.value.clone(),
                },
            })
            .collect::<Vec<_>>();
        let uncompressed = encode_message_set(&blocks, Default::default(), None)?.len();
        let records = encode_message_set(&blocks, self.config.compression, self.config.compression_level)?;
        Ok((records, uncompressed))
    }
}
