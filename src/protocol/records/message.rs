//! Legacy message sets (magic 0 and 1).
//!
//! ```text
//! message set entry: offset: int64 | message_size: int32 | message
//! message:           crc: uint32 | magic: int8 | attributes: int8
//!                    | timestamp: int64 (magic 1 only) | key: bytes | value: bytes
//! ```
//!
//! The CRC is a plain CRC-32 over everything after the CRC field. A compressed
//! message carries a complete inner message set, compressed, as its value. For
//! magic 1 wrappers the inner offsets are relative and the wrapper offset is
//! the absolute offset of the last inner message.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    IResult,
    number::complete::{be_i8, be_i32, be_i64},
};
use nombytes::NomBytes;

use super::compression::{Compression, compress, decompress};
use crate::constants::{ATTR_LOG_APPEND_TIME, RECORD_BATCH_LOG_OVERHEAD};
use crate::encode::ToByte;
use crate::error::{Error, Result};
use crate::parser::parse_nullable_bytes;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub magic: i8,
    pub compression: Compression,
    pub log_append_time: bool,
    /// Present only for magic 1.
    pub timestamp: Option<i64>,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
}

/// One entry of a message set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlock {
    pub offset: i64,
    pub message: Message,
}

impl Message {
    fn attributes(&self) -> i8 {
        let mut attributes = self.compression.attribute() as i8;
        if self.log_append_time {
            attributes |= ATTR_LOG_APPEND_TIME as i8;
        }
        attributes
    }

    fn encode_body<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        buffer.put_i8(self.magic);
        buffer.put_i8(self.attributes());
        if self.magic >= 1 {
            buffer.put_i64(self.timestamp.unwrap_or(-1));
        }
        self.key.encode(buffer)?;
        self.value.encode(buffer)
    }

    /// Serialize the message with its CRC, without the offset/size prefix.
    pub fn encode(&self) -> Result<Bytes> {
        let mut body = BytesMut::new();
        self.encode_body(&mut body)?;
        let mut out = BytesMut::with_capacity(body.len() + 4);
        out.put_u32(crc32fast::hash(&body));
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode and verify one message.
    pub fn decode(bytes: &Bytes) -> Result<Message> {
        if bytes.len() < 4 {
            return Err(Error::Decoding("legacy message shorter than its crc".to_string()));
        }
        let stored = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let computed = crc32fast::hash(&bytes[4..]);
        if stored != computed {
            return Err(Error::CrcMismatch {
                expected: stored,
                actual: computed,
            });
        }
        let (_, message) = parse_message_body(NomBytes::new(bytes.slice(4..)))?;
        if message.magic > 1 {
            return Err(Error::Decoding(format!(
                "unsupported legacy message magic {}",
                message.magic
            )));
        }
        Ok(message)
    }
}

fn parse_message_body(input: NomBytes) -> IResult<NomBytes, Message> {
    let (input, magic) = be_i8(input)?;
    let (input, attributes) = be_i8(input)?;
    let (input, timestamp) = if magic >= 1 {
        let (input, ts) = be_i64(input)?;
        (input, Some(ts))
    } else {
        (input, None)
    };
    let (input, key) = parse_nullable_bytes(input)?;
    let (input, value) = parse_nullable_bytes(input)?;
    let compression = Compression::from_attributes(attributes as i16).map_err(|_| {
        nom::Err::Failure(nom::error::Error::new(
            input.clone(),
            nom::error::ErrorKind::Verify,
        ))
    })?;
    Ok((
        input,
        Message {
            magic,
            compression,
            log_append_time: (attributes as i16) & ATTR_LOG_APPEND_TIME != 0,
            timestamp,
            key,
            value,
        },
    ))
}

/// Encode a message set. With a codec other than `None` the blocks are
/// wrapped into one compressed message.
pub fn encode_message_set(
    blocks: &[MessageBlock],
    compression: Compression,
    level: Option<i32>,
) -> Result<Bytes> {
    let plain = encode_blocks(blocks)?;
    if compression == Compression::None || blocks.is_empty() {
        return Ok(plain);
    }

    let magic = blocks[0].message.magic;
    let last = &blocks[blocks.len() - 1];
    let wrapper = MessageBlock {
        offset: last.offset,
        message: Message {
            magic,
            compression,
            log_append_time: false,
            timestamp: if magic >= 1 {
                blocks.iter().filter_map(|b| b.message.timestamp).max()
            } else {
                None
            },
            key: None,
            value: Some(compress(compression, level, &plain)?),
        },
    };
    encode_blocks(std::slice::from_ref(&wrapper))
}

fn encode_blocks(blocks: &[MessageBlock]) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for block in blocks {
        let message = block.message.encode()?;
        out.put_i64(block.offset);
        out.put_i32(message.len() as i32);
        out.put_slice(&message);
    }
    Ok(out.freeze())
}

/// Decode one `offset | size | message` entry, expanding compressed wrappers
/// into their inner messages with absolute offsets.
pub fn decode_message_entry(entry: &Bytes) -> Result<Vec<MessageBlock>> {
    let (rest, (offset, size)) = parse_entry_prefix(NomBytes::new(entry.clone()))?;
    let rest = rest.into_bytes();
    if size < 0 || size as usize > rest.len() {
        return Err(Error::Decoding(format!(
            "legacy message size {size} exceeds {} bytes",
            rest.len()
        )));
    }
    let message = Message::decode(&rest.slice(..size as usize))?;

    if message.compression == Compression::None {
        return Ok(vec![MessageBlock { offset, message }]);
    }

    let inner = decompress(message.compression, message.value.as_deref().unwrap_or_default())?;
    let mut blocks = Vec::new();
    let mut input = inner;
    while input.len() >= RECORD_BATCH_LOG_OVERHEAD {
        let size = i32::from_be_bytes([input[8], input[9], input[10], input[11]]);
        let end = RECORD_BATCH_LOG_OVERHEAD + size.max(0) as usize;
        if end > input.len() {
            return Err(Error::Decoding(
                "compressed message set ends inside a message".to_string(),
            ));
        }
        blocks.extend(decode_message_entry(&input.slice(..end))?);
        input = input.slice(end..);
    }

    if message.magic >= 1 {
        if let Some(last) = blocks.last().map(|b| b.offset) {
            let base = offset - last;
            for block in &mut blocks {
                block.offset += base;
            }
        }
    }
    if message.log_append_time {
        for block in &mut blocks {
            block.message.timestamp = message.timestamp;
            block.message.log_append_time = true;
        }
    }
    Ok(blocks)
}

fn parse_entry_prefix(input: NomBytes) -> IResult<NomBytes, (i64, i32)> {
    let (input, offset) = be_i64(input)?;
    let (input, size) = be_i32(input)?;
    Ok((input, (offset, size)))
}
