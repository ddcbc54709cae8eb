//! Record containers carried by Produce requests and Fetch responses.
//!
//! A record set on the wire is a concatenation of entries that all start
//! with `int64 offset | int32 length`; the magic byte at position 16 tells a
//! v2 [`RecordBatch`] apart from a legacy [`Message`](message::Message).
//! Both formats may appear in the same fetch response while a topic is being
//! upgraded.

use bytes::Bytes;

use crate::constants::{MAGIC_OFFSET, RECORD_BATCH_LOG_OVERHEAD};
use crate::error::{Error, Result};

pub mod batch;
pub mod compression;
pub mod message;

pub use batch::{
    ControlRecordType, CrcValidationResult, ProducerBatchInfo, Record, RecordBatch, RecordHeader,
    parse_producer_info, patch_base_offset, validate_batch_crc,
};
pub use compression::Compression;
pub use message::{Message, MessageBlock, decode_message_entry, encode_message_set};

/// One decoded entry of a record set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordSet {
    Batch(RecordBatch),
    /// The messages of one legacy entry, compressed wrappers expanded.
    Legacy(Vec<MessageBlock>),
}

impl RecordSet {
    /// Offset the next fetch should start from after this entry.
    pub fn next_offset(&self) -> Option<i64> {
        match self {
            RecordSet::Batch(batch) => Some(batch.next_offset()),
            RecordSet::Legacy(blocks) => blocks.last().map(|b| b.offset + 1),
        }
    }
}

/// What followed the last complete entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Trailing {
    /// Every byte belonged to a complete entry.
    #[default]
    None,
    /// The response ended inside an entry that followed complete ones. The
    /// broker cuts responses at the fetch size, so the rest is fetched next
    /// time.
    Partial,
    /// The first entry, or even its header, is larger than the bytes
    /// returned. Nothing can be consumed until the fetch size grows to at
    /// least `needed` bytes.
    Overflow { needed: usize },
}

/// A decoded record set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedRecords {
    pub sets: Vec<RecordSet>,
    pub trailing: Trailing,
}

impl DecodedRecords {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// Magic byte of the first entry, if enough bytes are present.
pub fn peek_magic(bytes: &[u8]) -> Option<i8> {
    bytes.get(MAGIC_OFFSET).map(|b| *b as i8)
}

/// Decode every complete entry in `bytes`. Checksums are verified; a
/// mismatch fails the whole set.
pub fn decode_record_set(bytes: &Bytes) -> Result<DecodedRecords> {
    let mut decoded = DecodedRecords::default();
    let mut rest = bytes.clone();

    while !rest.is_empty() {
        if rest.len() < RECORD_BATCH_LOG_OVERHEAD {
            decoded.trailing = if decoded.sets.is_empty() {
                Trailing::Overflow {
                    needed: RECORD_BATCH_LOG_OVERHEAD,
                }
            } else {
                Trailing::Partial
            };
            break;
        }
        let length = i32::from_be_bytes([rest[8], rest[9], rest[10], rest[11]]);
        if length < 0 {
            return Err(Error::Decoding(format!("negative record set entry length {length}")));
        }
        let end = RECORD_BATCH_LOG_OVERHEAD + length as usize;
        if end > rest.len() {
            decoded.trailing = if decoded.sets.is_empty() {
                Trailing::Overflow { needed: end }
            } else {
                Trailing::Partial
            };
            break;
        }

        let entry = rest.slice(..end);
        let set = match peek_magic(&entry) {
            Some(2) => RecordSet::Batch(RecordBatch::decode(&entry)?),
            Some(0) | Some(1) => RecordSet::Legacy(decode_message_entry(&entry)?),
            Some(other) => {
                return Err(Error::Decoding(format!("unknown record magic {other}")));
            }
            None => {
                return Err(Error::Decoding("record set entry without magic byte".to_string()));
            }
        };
        decoded.sets.push(set);
        rest = rest.slice(end..);
    }

    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn batch(base_offset: i64, values: &[&str]) -> Bytes {
        RecordBatch {
            base_offset,
            last_offset_delta: values.len() as i32 - 1,
            records: values
                .iter()
                .enumerate()
                .map(|(i, v)| Record {
                    offset_delta: i as i32,
                    value: Some(Bytes::copy_from_slice(v.as_bytes())),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
        .encode(None)
        .unwrap()
    }

    #[test]
    fn test_decode_multiple_batches() {
        let mut set = BytesMut::new();
        set.extend_from_slice(&batch(0, &["a", "b"]));
        set.extend_from_slice(&batch(2, &["c"]));
        let decoded = decode_record_set(&set.freeze()).unwrap();
        assert_eq!(decoded.sets.len(), 2);
        assert_eq!(decoded.trailing, Trailing::None);
        assert_eq!(decoded.sets[1].next_offset(), Some(3));
    }

    #[test]
    fn test_partial_trailing_batch() {
        let mut set = BytesMut::new();
        set.extend_from_slice(&batch(0, &["a"]));
        let second = batch(1, &["b"]);
        set.extend_from_slice(&second[..second.len() - 3]);
        let decoded = decode_record_set(&set.freeze()).unwrap();
        assert_eq!(decoded.sets.len(), 1);
        assert_eq!(decoded.trailing, Trailing::Partial);
    }

    #[test]
    fn test_overflowing_first_batch() {
        let whole = batch(0, &["a large value"]);
        let decoded = decode_record_set(&whole.slice(..30)).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(decoded.trailing, Trailing::Overflow { needed: whole.len() });
    }

    #[test]
    fn test_truncated_first_header_overflows() {
        let decoded = decode_record_set(&Bytes::from_static(&[0, 0, 0, 0, 0])).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(
            decoded.trailing,
            Trailing::Overflow {
                needed: RECORD_BATCH_LOG_OVERHEAD
            }
        );
    }

    #[test]
    fn test_truncated_header_after_batch_is_partial() {
        let mut set = BytesMut::new();
        set.extend_from_slice(&batch(0, &["a"]));
        set.extend_from_slice(&[0, 0, 0]);
        let decoded = decode_record_set(&set.freeze()).unwrap();
        assert_eq!(decoded.sets.len(), 1);
        assert_eq!(decoded.trailing, Trailing::Partial);
    }

    #[test]
    fn test_mixed_legacy_and_batch() {
        let legacy = encode_message_set(
            &[MessageBlock {
                offset: 0,
                message: Message {
                    magic: 1,
                    timestamp: Some(1),
                    value: Some(Bytes::from_static(b"old")),
                    ..Default::default()
                },
            }],
            Compression::None,
            None,
        )
        .unwrap();
        let mut set = BytesMut::new();
        set.extend_from_slice(&legacy);
        set.extend_from_slice(&batch(1, &["new"]));
        let decoded = decode_record_set(&set.freeze()).unwrap();
        assert!(matches!(decoded.sets[0], RecordSet::Legacy(_)));
        assert!(matches!(decoded.sets[1], RecordSet::Batch(_)));
    }

    #[test]
    fn test_corrupt_batch_fails() {
        let mut bytes = batch(0, &["a"]).to_vec();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        assert!(matches!(
            decode_record_set(&Bytes::from(bytes)),
            Err(Error::CrcMismatch { .. })
        ));
    }
}
