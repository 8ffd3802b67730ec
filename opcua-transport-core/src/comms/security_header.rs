//! Security headers carried in MSG/OPN/CLO chunks, grounded on
//! `async_opcua_core::comms::security_header`.

use std::io::{Read, Write};

use opcua_transport_crypto::SecurityPolicy;
use opcua_transport_types::{
    read_u32, write_u32, ByteString, DecodingOptions, EncodingResult, Error, StatusCode, UAString,
};

/// Receiver certificate thumbprints are always SHA-1, 20 bytes.
const THUMBPRINT_SIZE: usize = 20;
/// Certificates over this size are refused before the rest of the chunk is read.
const MAX_CERTIFICATE_LENGTH: usize = 0x1000 * 8;

#[derive(Debug, Clone, PartialEq)]
pub enum SecurityHeader {
    Asymmetric(AsymmetricSecurityHeader),
    Symmetric(SymmetricSecurityHeader),
}

impl SecurityHeader {
    pub fn byte_len(&self) -> usize {
        match self {
            SecurityHeader::Asymmetric(h) => h.byte_len(),
            SecurityHeader::Symmetric(h) => h.byte_len(),
        }
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        match self {
            SecurityHeader::Asymmetric(h) => h.encode(stream),
            SecurityHeader::Symmetric(h) => h.encode(stream),
        }
    }

    pub fn decode_from_stream<R: Read + ?Sized>(
        stream: &mut R,
        is_open_secure_channel: bool,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        if is_open_secure_channel {
            let header = AsymmetricSecurityHeader::decode(stream, decoding_options)?;
            if !header.security_policy_uri.is_null()
                && SecurityPolicy::from_uri(header.security_policy_uri.as_str()).is_none()
            {
                return Err(Error::new(
                    StatusCode::BadSecurityPolicyRejected,
                    format!(
                        "security policy of chunk is unknown: {}",
                        header.security_policy_uri.as_str()
                    ),
                ));
            }
            Ok(SecurityHeader::Asymmetric(header))
        } else {
            Ok(SecurityHeader::Symmetric(SymmetricSecurityHeader::decode(
                stream,
            )?))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymmetricSecurityHeader {
    pub token_id: u32,
}

impl SymmetricSecurityHeader {
    pub fn byte_len(&self) -> usize {
        4
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        write_u32(stream, self.token_id)
    }

    pub fn decode<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<Self> {
        Ok(Self {
            token_id: read_u32(stream)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AsymmetricSecurityHeader {
    pub security_policy_uri: UAString,
    pub sender_certificate: ByteString,
    pub receiver_certificate_thumbprint: ByteString,
}

impl AsymmetricSecurityHeader {
    /// A header for the `None` security policy, carrying no certificate material.
    pub fn none() -> Self {
        Self {
            security_policy_uri: UAString::from(SecurityPolicy::None.to_uri()),
            sender_certificate: ByteString::null(),
            receiver_certificate_thumbprint: ByteString::null(),
        }
    }

    pub fn new(
        security_policy: SecurityPolicy,
        sender_certificate: &[u8],
        receiver_certificate_thumbprint: ByteString,
    ) -> Self {
        Self {
            security_policy_uri: UAString::from(security_policy.to_uri()),
            sender_certificate: ByteString::from(sender_certificate),
            receiver_certificate_thumbprint,
        }
    }

    pub fn byte_len(&self) -> usize {
        4 + self.security_policy_uri.as_str().len()
            + 4
            + self.sender_certificate.len()
            + 4
            + self.receiver_certificate_thumbprint.len()
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        self.security_policy_uri.encode(stream)?;
        self.sender_certificate.encode(stream)?;
        self.receiver_certificate_thumbprint.encode(stream)
    }

    pub fn decode<R: Read + ?Sized>(
        stream: &mut R,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let security_policy_uri = UAString::decode(stream, decoding_options)?;
        let sender_certificate = ByteString::decode(stream, decoding_options)?;
        let receiver_certificate_thumbprint = ByteString::decode(stream, decoding_options)?;

        if sender_certificate.len() >= MAX_CERTIFICATE_LENGTH {
            return Err(Error::new(
                StatusCode::BadEncodingLimitsExceeded,
                format!(
                    "sender certificate has length {}, exceeding the limit {}",
                    sender_certificate.len(),
                    MAX_CERTIFICATE_LENGTH
                ),
            ));
        }
        if !receiver_certificate_thumbprint.is_empty()
            && receiver_certificate_thumbprint.len() != THUMBPRINT_SIZE
        {
            return Err(Error::decoding(format!(
                "receiver certificate thumbprint is not {} bytes long, got {}",
                THUMBPRINT_SIZE,
                receiver_certificate_thumbprint.len()
            )));
        }

        Ok(Self {
            security_policy_uri,
            sender_certificate,
            receiver_certificate_thumbprint,
        })
    }
}

/// The sequence number / request id pair carried in every MSG/OPN/CLO chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn byte_len(&self) -> usize {
        8
    }

    pub fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        write_u32(stream, self.sequence_number)?;
        write_u32(stream, self.request_id)
    }

    pub fn decode<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<Self> {
        let sequence_number = read_u32(stream)?;
        let request_id = read_u32(stream)?;
        Ok(Self {
            sequence_number,
            request_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn symmetric_header_round_trips() {
        let header = SymmetricSecurityHeader { token_id: 42 };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(SymmetricSecurityHeader::decode(&mut cursor).unwrap(), header);
    }

    #[test]
    fn oversized_thumbprint_is_rejected() {
        let mut buf = Vec::new();
        UAString::from(SecurityPolicy::None.to_uri())
            .encode(&mut buf)
            .unwrap();
        ByteString::null().encode(&mut buf).unwrap();
        ByteString::from(vec![0u8; 19]).encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(AsymmetricSecurityHeader::decode(&mut cursor, &DecodingOptions::default()).is_err());
    }

    #[test]
    fn sequence_header_round_trips() {
        let header = SequenceHeader {
            sequence_number: 99,
            request_id: 5,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(SequenceHeader::decode(&mut cursor).unwrap(), header);
    }
}
