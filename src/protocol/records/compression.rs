//! Compression codecs for record batches and legacy message sets.
//!
//! | Codec | Attribute | Crate |
//! |-------|-----------|-------|
//! | none | 0 | |
//! | gzip | 1 | `flate2` |
//! | snappy | 2 | `snap` (raw block, xerial framing accepted on decode) |
//! | lz4 | 3 | `lz4_flex` frame format |
//! | zstd | 4 | `zstd` |

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use bytes::Bytes;
use flate2::{read::MultiGzDecoder, write::GzEncoder};

use crate::constants::ATTR_COMPRESSION_MASK;
use crate::error::{Error, Result};

/// Header written by the xerial snappy-java framing.
const XERIAL_MAGIC: [u8; 8] = [0x82, b'S', b'N', b'A', b'P', b'P', b'Y', 0];
const XERIAL_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl Compression {
    /// Codec named by the low bits of a batch or message attributes field.
    pub fn from_attributes(attributes: i16) -> Result<Self> {
        match attributes & ATTR_COMPRESSION_MASK {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            2 => Ok(Compression::Snappy),
            3 => Ok(Compression::Lz4),
            4 => Ok(Compression::Zstd),
            other => Err(Error::Decoding(format!("unknown compression codec {other}"))),
        }
    }

    pub fn attribute(self) -> i16 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
            Compression::Snappy => 2,
            Compression::Lz4 => 3,
            Compression::Zstd => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Snappy => "snappy",
            Compression::Lz4 => "lz4",
            Compression::Zstd => "zstd",
        }
    }

    /// Whether `level` is meaningful for this codec.
    pub fn validate_level(self, level: i32) -> Result<()> {
        let ok = match self {
            Compression::Gzip => (0..=9).contains(&level),
            Compression::Zstd => (1..=22).contains(&level),
            Compression::None | Compression::Snappy | Compression::Lz4 => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "compression level {level} is out of range for {self}"
            )))
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gzip" => Ok(Compression::Gzip),
            "snappy" => Ok(Compression::Snappy),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(Error::Config(format!("unknown compression codec {other:?}"))),
        }
    }
}

/// Compress `data`. `level` of `None` uses the codec default; codecs without
/// levels ignore it.
pub fn compress(codec: Compression, level: Option<i32>, data: &[u8]) -> Result<Bytes> {
    match codec {
        Compression::None => Ok(Bytes::copy_from_slice(data)),
        Compression::Gzip => {
            let level = level.map_or(flate2::Compression::default(), |l| {
                flate2::Compression::new(l.clamp(0, 9) as u32)
            });
            let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
            encoder.write_all(data)?;
            Ok(Bytes::from(encoder.finish()?))
        }
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map(Bytes::from)
            .map_err(|e| Error::Encoding(format!("snappy: {e}"))),
        Compression::Lz4 => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
            encoder.write_all(data)?;
            encoder
                .finish()
                .map(Bytes::from)
                .map_err(|e| Error::Encoding(format!("lz4: {e}")))
        }
        Compression::Zstd => {
            let level = level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL);
            zstd::bulk::compress(data, level)
                .map(Bytes::from)
                .map_err(|e| Error::Encoding(format!("zstd: {e}")))
        }
    }
}

pub fn decompress(codec: Compression, data: &[u8]) -> Result<Bytes> {
    match codec {
        Compression::None => Ok(Bytes::copy_from_slice(data)),
        Compression::Gzip => {
            let mut out = Vec::with_capacity(data.len() * 2);
            MultiGzDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::Decoding(format!("gzip: {e}")))?;
            Ok(Bytes::from(out))
        }
        Compression::Snappy => decompress_snappy(data),
        Compression::Lz4 => {
            let mut out = Vec::with_capacity(data.len() * 2);
            lz4_flex::frame::FrameDecoder::new(data)
                .read_to_end(&mut out)
                .map_err(|e| Error::Decoding(format!("lz4: {e}")))?;
            Ok(Bytes::from(out))
        }
        Compression::Zstd => zstd::stream::decode_all(data)
            .map(Bytes::from)
            .map_err(|e| Error::Decoding(format!("zstd: {e}"))),
    }
}

fn decompress_snappy(data: &[u8]) -> Result<Bytes> {
    if data.len() < XERIAL_HEADER_LEN || data[..8] != XERIAL_MAGIC {
        return snap::raw::Decoder::new()
            .decompress_vec(data)
            .map(Bytes::from)
            .map_err(|e| Error::Decoding(format!("snappy: {e}")));
    }

    // xerial: 16 byte header, then (int32 length, raw snappy block) chunks.
    let mut out = Vec::new();
    let mut rest = &data[XERIAL_HEADER_LEN..];
    let mut decoder = snap::raw::Decoder::new();
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::Decoding("truncated xerial snappy chunk".to_string()));
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        rest = &rest[4..];
        if rest.len() < len {
            return Err(Error::Decoding("truncated xerial snappy chunk".to_string()));
        }
        let chunk = decoder
            .decompress_vec(&rest[..len])
            .map_err(|e| Error::Decoding(format!("snappy: {e}")))?;
        out.extend_from_slice(&chunk);
        rest = &rest[len..];
    }
    Ok(Bytes::from(out))
}
