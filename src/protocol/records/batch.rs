//! RecordBatch (magic 2) encoding and decoding.
//!
//! # RecordBatch Header Layout
//!
//! ```text
//! Offset  Size  Field
//! 0       8     base_offset
//! 8       4     batch_length
//! 12      4     partition_leader_epoch
//! 16      1     magic (2)
//! 17      4     crc (CRC-32C over bytes 21..end)
//! 21      2     attributes
//! 23      4     last_offset_delta
//! 27      8     first_timestamp
//! 35      8     max_timestamp
//! 43      8     producer_id
//! 51      2     producer_epoch
//! 53      4     first_sequence
//! 57      4     records_count
//! 61      ...   records (compressed as a unit when attributes say so)
//! ```
//!
//! Each record is varint framed:
//!
//! ```text
//! length: varint | attributes: int8 | timestamp_delta: varlong
//! | offset_delta: varint | key: varint bytes | value: varint bytes
//! | headers: varint count of (key: varint string, value: varint bytes)
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i8, be_i16, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::compression::{Compression, compress, decompress};
use crate::constants::{
    ATTR_CONTROL, ATTR_LOG_APPEND_TIME, ATTR_TRANSACTIONAL, BATCH_CRC_DATA_START,
    BATCH_CRC_OFFSET, BATCH_FIRST_SEQUENCE_OFFSET, BATCH_LAST_OFFSET_DELTA_OFFSET,
    BATCH_PRODUCER_EPOCH_OFFSET, BATCH_PRODUCER_ID_OFFSET, NO_PRODUCER_EPOCH, NO_PRODUCER_ID,
    NO_SEQUENCE, RECORD_BATCH_HEADER_SIZE, RECORD_BATCH_LOG_OVERHEAD,
};
use crate::encode::{encode_varint, encode_varint_bytes, encode_varlong, varint_size, varlong_size};
use crate::error::{Error, Result};
use crate::parser::{parse_varint, parse_varint_array, parse_varint_bytes, parse_varlong};

pub const RECORD_BATCH_MAGIC: i8 = 2;

/// A record header. Keys are strings on the wire but kept as bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl RecordHeader {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    fn encoded_size(&self) -> usize {
        varint_bytes_size(Some(&self.key)) + varint_bytes_size(self.value.as_ref())
    }
}

/// One record inside a batch, with offset and timestamp relative to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub attributes: i8,
    pub timestamp_delta: i64,
    pub offset_delta: i32,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
}

fn varint_bytes_size(value: Option<&Bytes>) -> usize {
    match value {
        Some(v) => varint_size(v.len() as i32) + v.len(),
        None => varint_size(-1),
    }
}

impl Record {
    fn body_size(&self) -> usize {
        1 + varlong_size(self.timestamp_delta)
            + varint_size(self.offset_delta)
            + varint_bytes_size(self.key.as_ref())
            + varint_bytes_size(self.value.as_ref())
            + varint_size(self.headers.len() as i32)
            + self.headers.iter().map(RecordHeader::encoded_size).sum::<usize>()
    }

    /// Bytes this record occupies on the wire, including its length prefix.
    pub fn encoded_size(&self) -> usize {
        let body = self.body_size();
        varint_size(body as i32) + body
    }

    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        encode_varint(buffer, self.body_size() as i32);
        buffer.put_i8(self.attributes);
        encode_varlong(buffer, self.timestamp_delta);
        encode_varint(buffer, self.offset_delta);
        encode_varint_bytes(buffer, self.key.as_deref())?;
        encode_varint_bytes(buffer, self.value.as_deref())?;
        encode_varint(buffer, self.headers.len() as i32);
        for header in &self.headers {
            encode_varint_bytes(buffer, Some(&header.key))?;
            encode_varint_bytes(buffer, header.value.as_deref())?;
        }
        Ok(())
    }

    fn decode(input: NomBytes) -> IResult<NomBytes, Record> {
        let (input, _length) = parse_varint(input)?;
        let (input, attributes) = be_i8(input)?;
        let (input, timestamp_delta) = parse_varlong(input)?;
        let (input, offset_delta) = parse_varint(input)?;
        let (input, key) = parse_varint_bytes(input)?;
        let (input, value) = parse_varint_bytes(input)?;
        let (input, headers) = parse_varint_array(parse_header)(input)?;
        Ok((
            input,
            Record {
                attributes,
                timestamp_delta,
                offset_delta,
                key,
                value,
                headers,
            },
        ))
    }
}

fn parse_header(input: NomBytes) -> IResult<NomBytes, RecordHeader> {
    let (input, key) = parse_varint_bytes(input)?;
    let (input, value) = parse_varint_bytes(input)?;
    Ok((
        input,
        RecordHeader {
            key: key.unwrap_or_default(),
            value,
        },
    ))
}

/// A decoded or to-be-encoded v2 batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBatch {
    pub base_offset: i64,
    pub partition_leader_epoch: i32,
    pub compression: Compression,
    pub is_transactional: bool,
    pub is_control: bool,
    pub log_append_time: bool,
    pub last_offset_delta: i32,
    pub first_timestamp: i64,
    pub max_timestamp: i64,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub first_sequence: i32,
    pub records: Vec<Record>,
}

impl Default for RecordBatch {
    fn default() -> Self {
        Self {
            base_offset: 0,
            partition_leader_epoch: -1,
            compression: Compression::None,
            is_transactional: false,
            is_control: false,
            log_append_time: false,
            last_offset_delta: -1,
            first_timestamp: 0,
            max_timestamp: 0,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            first_sequence: NO_SEQUENCE,
            records: Vec::new(),
        }
    }
}

impl RecordBatch {
    pub fn attributes(&self) -> i16 {
        let mut attributes = self.compression.attribute();
        if self.log_append_time {
            attributes |= ATTR_LOG_APPEND_TIME;
        }
        if self.is_transactional {
            attributes |= ATTR_TRANSACTIONAL;
        }
        if self.is_control {
            attributes |= ATTR_CONTROL;
        }
        attributes
    }

    /// Absolute offset of the last record in the batch.
    pub fn last_offset(&self) -> i64 {
        self.base_offset + self.last_offset_delta as i64
    }

    /// Offset following this batch, even when compaction removed records.
    pub fn next_offset(&self) -> i64 {
        self.last_offset() + 1
    }

    /// Uncompressed size estimate used for flush accounting.
    pub fn encoded_size(&self) -> usize {
        RECORD_BATCH_HEADER_SIZE + self.records.iter().map(Record::encoded_size).sum::<usize>()
    }

    /// Serialize the batch with its CRC filled in.
    ///
    /// An idempotent batch must carry consecutive offset deltas so that the
    /// broker can derive the sequence of every record from `first_sequence`.
    pub fn encode(&self, compression_level: Option<i32>) -> Result<Bytes> {
        if self.records.is_empty() && !self.is_control {
            return Err(Error::Encoding("record batch has no records".to_string()));
        }
        if self.producer_id >= 0 && self.first_sequence >= 0 {
            let count = self.records.len() as i32;
            let consistent = self
                .records
                .iter()
                .enumerate()
                .all(|(i, r)| r.offset_delta == i as i32)
                && self.last_offset_delta == count - 1;
            if !consistent {
                return Err(Error::InvariantViolation(format!(
                    "batch with first sequence {} does not cover {count} consecutive records",
                    self.first_sequence
                )));
            }
        }

        let mut records = BytesMut::with_capacity(self.encoded_size());
        for record in &self.records {
            record.encode(&mut records)?;
        }
        let records = if self.compression == Compression::None {
            records.freeze()
        } else {
            compress(self.compression, compression_level, &records)?
        };

        let total = RECORD_BATCH_HEADER_SIZE + records.len();
        let mut buffer = BytesMut::with_capacity(total);
        buffer.put_i64(self.base_offset);
        buffer.put_i32((total - RECORD_BATCH_LOG_OVERHEAD) as i32);
        buffer.put_i32(self.partition_leader_epoch);
        buffer.put_i8(RECORD_BATCH_MAGIC);
        buffer.put_u32(0);
        buffer.put_i16(self.attributes());
        buffer.put_i32(self.last_offset_delta);
        buffer.put_i64(self.first_timestamp);
        buffer.put_i64(self.max_timestamp);
        buffer.put_i64(self.producer_id);
        buffer.put_i16(self.producer_epoch);
        buffer.put_i32(self.first_sequence);
        buffer.put_i32(self.records.len() as i32);
        buffer.put_slice(&records);

        let crc = crc32c::crc32c(&buffer[BATCH_CRC_DATA_START..]);
        buffer[BATCH_CRC_OFFSET..BATCH_CRC_OFFSET + 4].copy_from_slice(&crc.to_be_bytes());
        Ok(buffer.freeze())
    }

    /// Decode one complete batch. `frame` must hold exactly the bytes of the
    /// batch, starting at `base_offset`.
    pub fn decode(frame: &Bytes) -> Result<RecordBatch> {
        if let CrcValidationResult::Invalid { expected, actual } = validate_batch_crc(frame) {
            return Err(Error::CrcMismatch { expected, actual });
        }
        if frame.len() < RECORD_BATCH_HEADER_SIZE {
            return Err(Error::Decoding(format!(
                "record batch of {} bytes is shorter than its header",
                frame.len()
            )));
        }

        let (_, header) = parse_header_fields(NomBytes::new(frame.slice(..RECORD_BATCH_HEADER_SIZE)))?;
        if header.magic != RECORD_BATCH_MAGIC {
            return Err(Error::Decoding(format!(
                "expected record batch magic 2, found {}",
                header.magic
            )));
        }
        if header.records_count < 0 {
            return Err(Error::Decoding(format!(
                "negative record count {}",
                header.records_count
            )));
        }

        let compression = Compression::from_attributes(header.attributes)?;
        let body = frame.slice(RECORD_BATCH_HEADER_SIZE..);
        let body = if compression == Compression::None {
            body
        } else {
            decompress(compression, &body)?
        };
        if header.records_count as usize > body.len() {
            return Err(Error::Decoding(format!(
                "record count {} exceeds {} body bytes",
                header.records_count,
                body.len()
            )));
        }

        let mut input = NomBytes::new(body);
        let mut records = Vec::with_capacity(header.records_count as usize);
        for _ in 0..header.records_count {
            let (rest, record) = Record::decode(input)?;
            records.push(record);
            input = rest;
        }

        Ok(RecordBatch {
            base_offset: header.base_offset,
            partition_leader_epoch: header.partition_leader_epoch,
            compression,
            is_transactional: header.attributes & ATTR_TRANSACTIONAL != 0,
            is_control: header.attributes & ATTR_CONTROL != 0,
            log_append_time: header.attributes & ATTR_LOG_APPEND_TIME != 0,
            last_offset_delta: header.last_offset_delta,
            first_timestamp: header.first_timestamp,
            max_timestamp: header.max_timestamp,
            producer_id: header.producer_id,
            producer_epoch: header.producer_epoch,
            first_sequence: header.first_sequence,
            records,
        })
    }
}

struct HeaderFields {
    base_offset: i64,
    partition_leader_epoch: i32,
    magic: i8,
    attributes: i16,
    last_offset_delta: i32,
    first_timestamp: i64,
    max_timestamp: i64,
    producer_id: i64,
    producer_epoch: i16,
    first_sequence: i32,
    records_count: i32,
}

fn parse_header_fields(input: NomBytes) -> IResult<NomBytes, HeaderFields> {
    let (input, base_offset) = be_i64(input)?;
    let (input, _batch_length) = be_i32(input)?;
    let (input, partition_leader_epoch) = be_i32(input)?;
    let (input, magic) = be_i8(input)?;
    let (input, _crc) = be_i32(input)?;
    let (input, attributes) = be_i16(input)?;
    let (input, last_offset_delta) = be_i32(input)?;
    let (input, first_timestamp) = be_i64(input)?;
    let (input, max_timestamp) = be_i64(input)?;
    let (input, producer_id) = be_i64(input)?;
    let (input, producer_epoch) = be_i16(input)?;
    let (input, first_sequence) = be_i32(input)?;
    let (input, records_count) = be_i32(input)?;
    Ok((
        input,
        HeaderFields {
            base_offset,
            partition_leader_epoch,
            magic,
            attributes,
            last_offset_delta,
            first_timestamp,
            max_timestamp,
            producer_id,
            producer_epoch,
            first_sequence,
            records_count,
        },
    ))
}

/// Result of CRC validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcValidationResult {
    Valid,
    Invalid { expected: u32, actual: u32 },
    /// Batch is too small to contain the CRC.
    TooSmall,
}

/// Validate the CRC-32C of a raw batch without decoding it.
pub fn validate_batch_crc(batch: &[u8]) -> CrcValidationResult {
    if batch.len() < BATCH_CRC_DATA_START {
        return CrcValidationResult::TooSmall;
    }
    let stored = u32::from_be_bytes([
        batch[BATCH_CRC_OFFSET],
        batch[BATCH_CRC_OFFSET + 1],
        batch[BATCH_CRC_OFFSET + 2],
        batch[BATCH_CRC_OFFSET + 3],
    ]);
    let computed = crc32c::crc32c(&batch[BATCH_CRC_DATA_START..]);
    if stored == computed {
        CrcValidationResult::Valid
    } else {
        CrcValidationResult::Invalid {
            expected: stored,
            actual: computed,
        }
    }
}

/// Rewrite the base offset of a raw batch. The CRC does not cover the base
/// offset, so the checksum stays valid.
pub fn patch_base_offset(batch: &mut [u8], base_offset: i64) {
    if batch.len() >= 8 {
        batch[..8].copy_from_slice(&base_offset.to_be_bytes());
    }
}

/// Idempotence fields read straight from a raw batch header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerBatchInfo {
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub first_sequence: i32,
    pub record_count: i32,
}

impl ProducerBatchInfo {
    pub fn is_idempotent(&self) -> bool {
        self.producer_id >= 0
    }

    pub fn last_sequence(&self) -> Option<i32> {
        if self.first_sequence < 0 || self.record_count <= 0 {
            return None;
        }
        self.first_sequence.checked_add(self.record_count - 1)
    }
}

pub fn parse_producer_info(batch: &[u8]) -> Option<ProducerBatchInfo> {
    if batch.len() < RECORD_BATCH_HEADER_SIZE {
        return None;
    }
    let i32_at = |at: usize| -> Option<i32> {
        Some(i32::from_be_bytes(batch[at..at + 4].try_into().ok()?))
    };
    let producer_id = i64::from_be_bytes(
        batch[BATCH_PRODUCER_ID_OFFSET..BATCH_PRODUCER_ID_OFFSET + 8]
            .try_into()
            .ok()?,
    );
    let producer_epoch = i16::from_be_bytes(
        batch[BATCH_PRODUCER_EPOCH_OFFSET..BATCH_PRODUCER_EPOCH_OFFSET + 2]
            .try_into()
            .ok()?,
    );
    Some(ProducerBatchInfo {
        producer_id,
        producer_epoch,
        first_sequence: i32_at(BATCH_FIRST_SEQUENCE_OFFSET)?,
        record_count: i32_at(BATCH_LAST_OFFSET_DELTA_OFFSET)? + 1,
    })
}

/// Control record types carried by transaction markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRecordType {
    Abort,
    Commit,
    Unknown(i16),
}

impl ControlRecordType {
    /// Read the marker type from a control record key (`int16 version | int16 type`).
    pub fn from_key(key: Option<&Bytes>) -> Self {
        match key {
            Some(k) if k.len() >= 4 => match i16::from_be_bytes([k[2], k[3]]) {
                0 => ControlRecordType::Abort,
                1 => ControlRecordType::Commit,
                other => ControlRecordType::Unknown(other),
            },
            _ => ControlRecordType::Unknown(-1),
        }
    }

    pub fn key(self) -> Bytes {
        let kind: i16 = match self {
            ControlRecordType::Abort => 0,
            ControlRecordType::Commit => 1,
            ControlRecordType::Unknown(n) => n,
        };
        let mut key = BytesMut::with_capacity(4);
        key.put_i16(0);
        key.put_i16(kind);
        key.freeze()
    }
}
