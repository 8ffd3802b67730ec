//! Little-endian scalar and string read/write helpers used by every wire structure in this
//! crate family, mirroring `opcua_types::encoding`'s `read_u32`/`write_u32`/`UAString` family.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{EncodingResult, Error};
use crate::status_code::StatusCode;

/// Options that affect decoding, in particular size limits used to reject
/// obviously-hostile input before it is fully read.
#[derive(Debug, Clone)]
pub struct DecodingOptions {
    /// Maximum permitted length of a decoded UTF-8 string.
    pub max_string_length: usize,
    /// Maximum permitted length of a decoded byte string.
    pub max_byte_string_length: usize,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        Self {
            max_string_length: 65536,
            max_byte_string_length: 65536,
        }
    }
}

/// Write an unsigned byte.
pub fn write_u8<W: Write + ?Sized>(stream: &mut W, value: u8) -> EncodingResult<()> {
    stream.write_u8(value).map_err(Error::encoding)
}

/// Write `count` repetitions of `value`.
pub fn write_bytes<W: Write + ?Sized>(
    stream: &mut W,
    value: u8,
    count: usize,
) -> EncodingResult<usize> {
    for _ in 0..count {
        stream.write_u8(value).map_err(Error::encoding)?;
    }
    Ok(count)
}

/// Write a little-endian `u32`.
pub fn write_u32<W: Write + ?Sized>(stream: &mut W, value: u32) -> EncodingResult<()> {
    stream.write_u32::<LittleEndian>(value).map_err(Error::encoding)
}

/// Write a little-endian signed 32-bit length prefix.
pub fn write_i32<W: Write + ?Sized>(stream: &mut W, value: i32) -> EncodingResult<()> {
    stream.write_i32::<LittleEndian>(value).map_err(Error::encoding)
}

/// Read an unsigned byte.
pub fn read_u8<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u8> {
    stream.read_u8().map_err(Error::decoding)
}

/// Read a little-endian `u32`.
pub fn read_u32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u32> {
    stream.read_u32::<LittleEndian>().map_err(Error::decoding)
}

/// Read a little-endian signed 32-bit length prefix.
pub fn read_i32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<i32> {
    stream.read_i32::<LittleEndian>().map_err(Error::decoding)
}

/// Encode a length-prefixed UTF-8 string, or a `-1` length prefix for `None`.
pub fn write_string<W: Write + ?Sized>(stream: &mut W, value: Option<&str>) -> EncodingResult<()> {
    match value {
        Some(s) => {
            write_i32(stream, s.len() as i32)?;
            stream.write_all(s.as_bytes()).map_err(Error::encoding)
        }
        None => write_i32(stream, -1),
    }
}

/// Decode a length-prefixed UTF-8 string. A `-1` length prefix decodes to `None`.
pub fn read_string<R: Read + ?Sized>(
    stream: &mut R,
    decoding_options: &DecodingOptions,
) -> EncodingResult<Option<String>> {
    let len = read_i32(stream)?;
    if len == -1 {
        Ok(None)
    } else if len < -1 {
        Err(Error::decoding(format!("string length is negative: {len}")))
    } else if len as usize > decoding_options.max_string_length {
        Err(Error::new(
            StatusCode::BadEncodingLimitsExceeded,
            format!(
                "string length {len} exceeds the decoding limit {}",
                decoding_options.max_string_length
            ),
        ))
    } else {
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).map_err(Error::decoding)?;
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| Error::decoding(e.to_string()))
    }
}

/// Encode a length-prefixed byte string, or a `-1` length prefix for `None`.
pub fn write_byte_string<W: Write + ?Sized>(
    stream: &mut W,
    value: Option<&[u8]>,
) -> EncodingResult<()> {
    match value {
        Some(b) => {
            write_i32(stream, b.len() as i32)?;
            stream.write_all(b).map_err(Error::encoding)
        }
        None => write_i32(stream, -1),
    }
}

/// Decode a length-prefixed byte string. A `-1` length prefix decodes to `None`.
pub fn read_byte_string<R: Read + ?Sized>(
    stream: &mut R,
    decoding_options: &DecodingOptions,
) -> EncodingResult<Option<Vec<u8>>> {
    let len = read_i32(stream)?;
    if len == -1 {
        Ok(None)
    } else if len < -1 {
        Err(Error::decoding(format!(
            "byte string length is negative: {len}"
        )))
    } else if len as usize > decoding_options.max_byte_string_length {
        Err(Error::new(
            StatusCode::BadEncodingLimitsExceeded,
            format!(
                "byte string length {len} exceeds the decoding limit {}",
                decoding_options.max_byte_string_length
            ),
        ))
    } else {
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).map_err(Error::decoding)?;
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, Some("opc.tcp://localhost:4840")).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = read_string(&mut cursor, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded.as_deref(), Some("opc.tcp://localhost:4840"));
    }

    #[test]
    fn null_string_round_trip() {
        let mut buf = Vec::new();
        write_string(&mut buf, None).unwrap();
        assert_eq!(buf, (-1i32).to_le_bytes());
        let mut cursor = Cursor::new(buf);
        let decoded = read_string(&mut cursor, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, None);
    }

    #[test]
    fn negative_length_below_null_is_rejected() {
        let mut cursor = Cursor::new((-2i32).to_le_bytes().to_vec());
        assert!(read_string(&mut cursor, &DecodingOptions::default()).is_err());
    }

    #[test]
    fn oversized_length_is_rejected_before_allocating() {
        let opts = DecodingOptions {
            max_string_length: 4,
            ..Default::default()
        };
        let mut cursor = Cursor::new(100i32.to_le_bytes().to_vec());
        let err = read_string(&mut cursor, &opts).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadEncodingLimitsExceeded);
    }
}
