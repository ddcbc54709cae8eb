//! Serialize data into the bytecode protocol.
use bytes::{BufMut, Bytes};

use crate::constants::MAX_STRING_LENGTH;
use crate::error::{Error, KafkaCode, Result};

pub trait ToByte {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()>;
}

impl<'a, T: ToByte + 'a + ?Sized> ToByte for &'a T {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        (*self).encode(buffer)
    }
}

impl ToByte for bool {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self as i8);
        Ok(())
    }
}

impl ToByte for i8 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i8(*self);
        Ok(())
    }
}

impl ToByte for i16 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(*self);
        Ok(())
    }
}

impl ToByte for i32 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(*self);
        Ok(())
    }
}

impl ToByte for i64 {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i64(*self);
        Ok(())
    }
}

impl ToByte for KafkaCode {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i16(self.code());
        Ok(())
    }
}

impl ToByte for str {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        if self.len() > MAX_STRING_LENGTH {
            return Err(Error::Encoding(format!(
                "string of {} bytes exceeds int16 length prefix",
                self.len()
            )));
        }
        buffer.put_i16(self.len() as i16);
        buffer.put(self.as_bytes());
        Ok(())
    }
}

impl ToByte for String {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        self.as_str().encode(buffer)
    }
}

impl<V: ToByte> ToByte for [V] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        encode_as_array(buffer, self, |buffer, x| x.encode(buffer))
    }
}

impl ToByte for [u8] {
    fn encode<T: BufMut>(&self, buffer: &mut T) -> Result<()> {
        buffer.put_i32(checked_len(self.len())?);
        buffer.put(self);
        Ok(())
    }
}

impl ToByte for Bytes {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        buffer.put_i32(checked_len(self.len())?);
        buffer.put_slice(self);
        Ok(())
    }
}

impl ToByte for Option<Bytes> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match self {
            Some(xs) => xs.encode(buffer),
            None => (-1i32).encode(buffer),
        }
    }
}

impl ToByte for Option<&str> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        match *self {
            Some(xs) => xs.encode(buffer),
            None => (-1i16).encode(buffer), // NULLABLE_STRING uses i16 length prefix
        }
    }
}

impl ToByte for Option<String> {
    fn encode<W: BufMut>(&self, buffer: &mut W) -> Result<()> {
        self.as_deref().encode(buffer)
    }
}

fn checked_len(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::Encoding(format!("length {len} exceeds int32 prefix")))
}

/// Renders the length of `xs` to `buffer` as the start of a
/// protocol array and then for each element of `xs` invokes `f`
/// assuming that function will render the element to the buffer.
pub fn encode_as_array<T, F, W>(buffer: &mut W, xs: &[T], mut f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    buffer.put_i32(checked_len(xs.len())?);
    for x in xs {
        f(buffer, x)?;
    }
    Ok(())
}

/// Like [`encode_as_array`] but writes `-1` for `None`.
pub fn encode_nullable_array<T, F, W>(buffer: &mut W, xs: Option<&[T]>, f: F) -> Result<()>
where
    F: FnMut(&mut W, &T) -> Result<()>,
    W: BufMut,
{
    match xs {
        Some(xs) => encode_as_array(buffer, xs, f),
        None => {
            buffer.put_i32(-1);
            Ok(())
        }
    }
}

/// Encode an unsigned varint (variable-length integer) to the buffer.
pub fn encode_unsigned_varint<W: BufMut>(buffer: &mut W, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buffer.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Encode a zigzag varint as used inside RecordBatch v2 records.
pub fn encode_varint<W: BufMut>(buffer: &mut W, value: i32) {
    encode_unsigned_varint(buffer, ((value << 1) ^ (value >> 31)) as u32 as u64);
}

/// Encode a zigzag varlong.
pub fn encode_varlong<W: BufMut>(buffer: &mut W, value: i64) {
    encode_unsigned_varint(buffer, ((value << 1) ^ (value >> 63)) as u64);
}

/// Number of bytes [`encode_varint`] writes for `value`.
pub fn varint_size(value: i32) -> usize {
    varlong_size(value as i64)
}

/// Number of bytes [`encode_varlong`] writes for `value`.
pub fn varlong_size(value: i64) -> usize {
    let mut v = ((value << 1) ^ (value >> 63)) as u64;
    let mut size = 1;
    while v >= 0x80 {
        v >>= 7;
        size += 1;
    }
    size
}

/// Varint-length-prefixed bytes where `-1` marks null (record keys, values, headers).
pub fn encode_varint_bytes<W: BufMut>(buffer: &mut W, value: Option<&[u8]>) -> Result<()> {
    match value {
        Some(v) => {
            encode_varint(buffer, checked_len(v.len())?);
            buffer.put_slice(v);
        }
        None => encode_varint(buffer, -1),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_bool_true() {
        let mut buf = Vec::new();
        true.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![1]);
    }

    #[test]
    fn test_encode_i16() {
        let mut buf = Vec::new();
        (0x1234i16).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x12, 0x34]); // big-endian
    }

    #[test]
    fn test_encode_i64() {
        let mut buf = Vec::new();
        (0x123456789ABCDEF0i64).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0]);
    }

    #[test]
    fn test_encode_string() {
        let mut buf = Vec::new();
        "hello".to_string().encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_string_too_long() {
        let mut buf = Vec::new();
        let long = "x".repeat(MAX_STRING_LENGTH + 1);
        let err = long.encode(&mut buf).unwrap_err();
        assert!(matches!(err, Error::Encoding(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_encode_string_at_limit() {
        let mut buf = Vec::new();
        let s = "x".repeat(MAX_STRING_LENGTH);
        s.encode(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x7F, 0xFF]);
    }

    #[test]
    fn test_encode_unicode_string_counts_bytes() {
        let mut buf = Vec::new();
        "héllo".encode(&mut buf).unwrap();
        assert_eq!(&buf[..2], &[0x00, 0x06]);
    }

    #[test]
    fn test_encode_bytes() {
        let mut buf = Vec::new();
        Bytes::from(vec![1, 2, 3]).encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x03, 1, 2, 3]);
    }

    #[test]
    fn test_encode_empty_vs_null_bytes() {
        let mut empty = Vec::new();
        Some(Bytes::new()).encode(&mut empty).unwrap();
        assert_eq!(empty, vec![0, 0, 0, 0]);

        let mut null = Vec::new();
        Option::<Bytes>::None.encode(&mut null).unwrap();
        assert_eq!(null, vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_as_array() {
        let mut buf = Vec::new();
        let items = vec![10i16, 20i16];
        encode_as_array(&mut buf, &items, |b, x| x.encode(b)).unwrap();
        let expected = vec![
            0x00, 0x00, 0x00, 0x02, // length = 2
            0x00, 0x0A, // 10
            0x00, 0x14, // 20
        ];
        assert_eq!(buf, expected);
    }

    #[test]
    fn test_encode_nullable_array_none() {
        let mut buf = Vec::new();
        encode_nullable_array::<i32, _, _>(&mut buf, None, |b, x| x.encode(b)).unwrap();
        assert_eq!(buf, vec![0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_option_str_none() {
        let mut buf = Vec::new();
        let opt: Option<&str> = None;
        opt.encode(&mut buf).unwrap();
        assert_eq!(buf, vec![0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_varint_zigzag() {
        let cases: &[(i32, &[u8])] = &[
            (0, &[0x00]),
            (-1, &[0x01]),
            (1, &[0x02]),
            (-64, &[0x7F]),
            (64, &[0x80, 0x01]),
            (300, &[0xD8, 0x04]),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            encode_varint(&mut buf, *value);
            assert_eq!(&buf, expected, "value {value}");
            assert_eq!(varint_size(*value), expected.len());
        }
    }

    #[test]
    fn test_encode_varlong_extremes() {
        let mut buf = Vec::new();
        encode_varlong(&mut buf, i64::MIN);
        assert_eq!(buf.len(), 10);
        assert_eq!(varlong_size(i64::MIN), 10);
    }

    #[test]
    fn test_encode_varint_bytes_null() {
        let mut buf = Vec::new();
        encode_varint_bytes(&mut buf, None).unwrap();
        assert_eq!(buf, vec![0x01]);
    }
}
