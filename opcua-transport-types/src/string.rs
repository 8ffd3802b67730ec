//! Simplified `UAString`/`ByteString` wrappers used at the transport boundary.
//!
//! The data-model layer owns the full built-in type hierarchy; this crate only needs the
//! nullable length-prefixed string/bytes encoding used by HELLO, the security header and
//! diagnostic text, grounded on `async_opcua_types::string::UAString`.

use std::io::{Read, Write};

use crate::error::EncodingResult;
use crate::wire::{read_byte_string, read_string, write_byte_string, write_string, DecodingOptions};

/// A nullable UTF-8 string, encoded on the wire as an `i32` length prefix (`-1` for null)
/// followed by that many bytes of UTF-8.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UAString {
    value: Option<String>,
}

impl UAString {
    /// The null string.
    pub fn null() -> Self {
        Self { value: None }
    }

    /// `true` if this is the null string, matching the wire's `-1` length prefix.
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Borrow the contained string, or `""` if null.
    pub fn as_str(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        write_string(stream, self.value.as_deref())
    }

    pub fn decode<R: Read + ?Sized>(
        stream: &mut R,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(Self {
            value: read_string(stream, decoding_options)?,
        })
    }
}

impl From<&str> for UAString {
    fn from(value: &str) -> Self {
        Self {
            value: Some(value.to_string()),
        }
    }
}

impl From<String> for UAString {
    fn from(value: String) -> Self {
        Self { value: Some(value) }
    }
}

impl From<Option<String>> for UAString {
    fn from(value: Option<String>) -> Self {
        Self { value }
    }
}

/// A nullable byte string, encoded the same way as [`UAString`] but without the UTF-8
/// constraint. Used for certificates, thumbprints and nonces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteString {
    value: Option<Vec<u8>>,
}

impl ByteString {
    pub fn null() -> Self {
        Self { value: None }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.value.as_deref().unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.value.as_ref().map_or(0, |v| v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        write_byte_string(stream, self.value.as_deref())
    }

    pub fn decode<R: Read + ?Sized>(
        stream: &mut R,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        Ok(Self {
            value: read_byte_string(stream, decoding_options)?,
        })
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(value: Vec<u8>) -> Self {
        Self { value: Some(value) }
    }
}

impl From<&[u8]> for ByteString {
    fn from(value: &[u8]) -> Self {
        Self {
            value: Some(value.to_vec()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ua_string_round_trip() {
        let s = UAString::from("opc.tcp://127.0.0.1:4840/");
        let mut buf = Vec::new();
        s.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = UAString::decode(&mut cursor, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn null_byte_string_is_distinct_from_empty() {
        let null = ByteString::null();
        let empty = ByteString::from(Vec::new());
        assert!(null.is_null());
        assert!(!empty.is_null());
        assert!(empty.is_empty());
    }
}
