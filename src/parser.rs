//! Deserialize data from the bytecode protocol.
use bytes::Bytes;
use nom::{
    IResult, InputLength,
    bytes::complete::take,
    error::{ErrorKind, ParseError},
    number::complete::{be_i8, be_i16, be_i32, be_u8},
};
use nombytes::NomBytes;

use crate::constants::MAX_PROTOCOL_ARRAY_SIZE;
use crate::error::KafkaCode;

type NomError = nom::Err<nom::error::Error<NomBytes>>;

fn failure(input: NomBytes, kind: ErrorKind) -> NomError {
    nom::Err::Failure(nom::error::Error::new(input, kind))
}

/// Convert bytes to a validated UTF-8 string.
/// Returns an error if the bytes are not valid UTF-8.
pub fn bytes_to_string(bytes: &Bytes) -> Result<String, NomError> {
    std::str::from_utf8(bytes)
        .map(|s| s.to_string())
        .map_err(|_| failure(NomBytes::from(bytes.as_ref()), ErrorKind::Verify))
}

pub fn parse_bool(s: NomBytes) -> IResult<NomBytes, bool> {
    let (s, b) = be_i8(s)?;
    Ok((s, b != 0))
}

/// `int16` length prefixed UTF-8 string. A null marker is rejected.
pub fn parse_string(s: NomBytes) -> IResult<NomBytes, String> {
    let (s, value) = parse_nullable_string(s)?;
    match value {
        Some(v) => Ok((s, v)),
        None => Err(failure(s, ErrorKind::Verify)),
    }
}

pub fn parse_nullable_string(s: NomBytes) -> IResult<NomBytes, Option<String>> {
    let (s, length) = be_i16(s)?;

    // Null string
    if length == -1 {
        return Ok((s, None));
    }

    if length < 0 {
        return Err(failure(s, ErrorKind::TooLarge));
    }

    let (s, string) = take(length as u16)(s)?;
    let string = bytes_to_string(&string.into_bytes())?;
    Ok((s, Some(string)))
}

/// `int32` length prefixed bytes. A null marker is rejected.
pub fn parse_bytes(s: NomBytes) -> IResult<NomBytes, Bytes> {
    let (s, value) = parse_nullable_bytes(s)?;
    match value {
        Some(v) => Ok((s, v)),
        None => Err(failure(s, ErrorKind::Verify)),
    }
}

pub fn parse_nullable_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = be_i32(s)?;
    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(failure(s, ErrorKind::TooLarge));
    }
    let (s, bytes) = take(length as usize)(s)?;
    Ok((s, Some(bytes.into_bytes())))
}

/// Parse an `int32` counted array. A null array decodes as empty.
pub fn parse_array<O, E, F>(f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: ParseError<NomBytes>,
{
    let mut nullable = parse_nullable_array(f);
    move |input: NomBytes| {
        let (i, items) = nullable(input)?;
        Ok((i, items.unwrap_or_default()))
    }
}

/// Parse an `int32` counted array where `-1` decodes as `None`.
pub fn parse_nullable_array<O, E, F>(
    f: F,
) -> impl FnMut(NomBytes) -> IResult<NomBytes, Option<Vec<O>>, E>
where
    F: nom::Parser<NomBytes, O, E> + Copy,
    E: ParseError<NomBytes>,
{
    move |input: NomBytes| {
        let (mut i, length) = be_i32(input)?;

        // Null array
        if length == -1 {
            return Ok((i, None));
        }

        // Validate array size bounds
        if !(0..=MAX_PROTOCOL_ARRAY_SIZE).contains(&length) {
            return Err(nom::Err::Failure(E::from_error_kind(i, ErrorKind::TooLarge)));
        }

        // Every element occupies at least one byte.
        if length as usize > i.input_len() {
            return Err(nom::Err::Error(E::from_error_kind(i, ErrorKind::Eof)));
        }

        let mut parser = f;
        let mut items = Vec::with_capacity(length as usize);
        for _ in 0..length {
            let (rest, item) = parser.parse(i)?;
            items.push(item);
            i = rest;
        }
        Ok((i, Some(items)))
    }
}

/// `int16` error code. Codes this client does not know decode as `Unknown`.
pub fn parse_kafka_code(s: NomBytes) -> IResult<NomBytes, KafkaCode> {
    let (s, code) = be_i16(s)?;
    Ok((s, KafkaCode::from_code(code)))
}

/// Parse an unsigned varint of up to 64 bits.
pub fn parse_unsigned_varint(s: NomBytes) -> IResult<NomBytes, u64> {
    let mut result: u64 = 0;
    let mut shift = 0;
    let mut remaining = s;

    loop {
        let (s, b) = be_u8(remaining)?;
        remaining = s;

        result |= ((b & 0x7F) as u64) << shift;

        if (b & 0x80) == 0 {
            break;
        }

        shift += 7;
        if shift > 63 {
            // Overflow protection
            return Err(failure(remaining, ErrorKind::TooLarge));
        }
    }

    Ok((remaining, result))
}

/// Parse a zigzag encoded varint.
pub fn parse_varint(s: NomBytes) -> IResult<NomBytes, i32> {
    let (rest, raw) = parse_unsigned_varint(s.clone())?;
    if raw > u32::MAX as u64 {
        return Err(failure(s, ErrorKind::TooLarge));
    }
    let raw = raw as u32;
    Ok((rest, ((raw >> 1) as i32) ^ -((raw & 1) as i32)))
}

/// Parse a zigzag encoded varlong.
pub fn parse_varlong(s: NomBytes) -> IResult<NomBytes, i64> {
    let (rest, raw) = parse_unsigned_varint(s)?;
    Ok((rest, ((raw >> 1) as i64) ^ -((raw & 1) as i64)))
}

/// Varint length prefixed bytes where `-1` is null.
pub fn parse_varint_bytes(s: NomBytes) -> IResult<NomBytes, Option<Bytes>> {
    let (s, length) = parse_varint(s)?;
    if length == -1 {
        return Ok((s, None));
    }
    if length < 0 {
        return Err(failure(s, ErrorKind::TooLarge));
    }
    let (s, bytes) = take(length as usize)(s)?;
    Ok((s, Some(bytes.into_bytes())))
}

/// Varint counted sequence used for record headers.
pub fn parse_varint_array<O, F>(mut f: F) -> impl FnMut(NomBytes) -> IResult<NomBytes, Vec<O>>
where
    F: FnMut(NomBytes) -> IResult<NomBytes, O>,
{
    move |input: NomBytes| {
        let (mut i, length) = parse_varint(input)?;
        if length < 0 {
            return Ok((i, Vec::new()));
        }
        if length as usize > i.input_len() {
            return Err(nom::Err::Error(nom::error::Error::new(i, ErrorKind::Eof)));
        }
        let mut items = Vec::with_capacity(length as usize);
        for _ in 0..length {
            let (rest, item) = f(i)?;
            items.push(item);
            i = rest;
        }
        Ok((i, items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nom::number::complete::be_i32;

    fn input(data: Vec<u8>) -> NomBytes {
        NomBytes::new(Bytes::from(data))
    }

    #[test]
    fn test_bytes_to_string_invalid_utf8() {
        let bytes = Bytes::from(vec![0xff, 0xfe]);
        assert!(bytes_to_string(&bytes).is_err());
    }

    #[test]
    fn test_parse_string() {
        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_be_bytes());
        data.extend_from_slice(b"hello");
        data.extend_from_slice(b"extra");

        let (remaining, parsed) = parse_string(input(data)).unwrap();

        assert_eq!(parsed, "hello");
        assert_eq!(remaining.into_bytes(), Bytes::from("extra"));
    }

    #[test]
    fn test_parse_string_unicode() {
        let text = "ключ";
        let mut data = (text.len() as i16).to_be_bytes().to_vec();
        data.extend_from_slice(text.as_bytes());
        let (_, parsed) = parse_string(input(data)).unwrap();
        assert_eq!(parsed, text);
    }

    #[test]
    fn test_parse_string_length_exceeds_remaining() {
        let mut data = 10i16.to_be_bytes().to_vec();
        data.extend_from_slice(b"abc");
        assert!(parse_string(input(data)).is_err());
    }

    #[test]
    fn test_parse_nullable_string_null() {
        let (_, parsed) = parse_nullable_string(input((-1i16).to_be_bytes().to_vec())).unwrap();
        assert_eq!(parsed, None);
    }

    #[test]
    fn test_parse_nullable_string_invalid_length() {
        assert!(parse_nullable_string(input((-2i16).to_be_bytes().to_vec())).is_err());
    }

    #[test]
    fn test_parse_nullable_bytes_empty_vs_null() {
        let (_, empty) = parse_nullable_bytes(input(0i32.to_be_bytes().to_vec())).unwrap();
        assert_eq!(empty, Some(Bytes::new()));
        let (_, null) = parse_nullable_bytes(input((-1i32).to_be_bytes().to_vec())).unwrap();
        assert_eq!(null, None);
    }

    #[test]
    fn test_parse_array_null() {
        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let (_, parsed): (_, Vec<i32>) = parser(input((-1i32).to_be_bytes().to_vec())).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_parse_nullable_array_distinguishes_null() {
        let mut parser = parse_nullable_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let (_, null) = parser(input((-1i32).to_be_bytes().to_vec())).unwrap();
        assert_eq!(null, None);
        let (_, empty) = parser(input(0i32.to_be_bytes().to_vec())).unwrap();
        assert_eq!(empty, Some(vec![]));
    }

    #[test]
    fn test_parse_array_with_elements() {
        let mut data = Vec::new();
        data.extend_from_slice(&3i32.to_be_bytes());
        data.extend_from_slice(&10i32.to_be_bytes());
        data.extend_from_slice(&20i32.to_be_bytes());
        data.extend_from_slice(&30i32.to_be_bytes());

        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let (_, parsed): (_, Vec<i32>) = parser(input(data)).unwrap();

        assert_eq!(parsed, vec![10, 20, 30]);
    }

    #[test]
    fn test_parse_array_max_int32_rejected() {
        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let result: IResult<_, Vec<i32>, _> = parser(input(i32::MAX.to_be_bytes().to_vec()));
        assert!(matches!(result, Err(nom::Err::Failure(_))));
    }

    #[test]
    fn test_parse_array_count_exceeds_remaining() {
        let mut data = 1000i32.to_be_bytes().to_vec();
        data.extend_from_slice(&[0, 0, 0, 1]);
        let mut parser = parse_array(be_i32::<_, nom::error::Error<NomBytes>>);
        let result: IResult<_, Vec<i32>, _> = parser(input(data));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_unsigned_varint_300() {
        let (_, value) = parse_unsigned_varint(input(vec![0xAC, 0x02])).unwrap();
        assert_eq!(value, 300);
    }

    #[test]
    fn test_parse_varint_zigzag() {
        let (_, v) = parse_varint(input(vec![0x01])).unwrap();
        assert_eq!(v, -1);
        let (_, v) = parse_varint(input(vec![0xD8, 0x04])).unwrap();
        assert_eq!(v, 300);
    }

    #[test]
    fn test_parse_varint_truncated() {
        assert!(parse_varint(input(vec![0x80])).is_err());
    }

    #[test]
    fn test_parse_varlong_matches_encoder() {
        for value in [0i64, -1, 1, i64::MAX, i64::MIN, 1_700_000_000_000] {
            let mut buf = Vec::new();
            crate::encode::encode_varlong(&mut buf, value);
            let (rest, parsed) = parse_varlong(input(buf)).unwrap();
            assert_eq!(parsed, value);
            assert!(rest.into_bytes().is_empty());
        }
    }

    #[test]
    fn test_parse_varint_bytes_null_and_empty() {
        let (_, null) = parse_varint_bytes(input(vec![0x01])).unwrap();
        assert_eq!(null, None);
        let (_, empty) = parse_varint_bytes(input(vec![0x00])).unwrap();
        assert_eq!(empty, Some(Bytes::new()));
    }
}
