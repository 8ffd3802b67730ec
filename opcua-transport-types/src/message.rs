//! The opaque application message contract.
//!
//! Components above the secure channel (request dispatch, session handling) are out of
//! scope for this crate family; what the transport layer needs is just enough of a
//! `Message` abstraction to carry a request/response body through a chunk without knowing
//! its concrete service type, grounded on the role `opcua_types::NodeId`-tagged service
//! bodies play in `async_opcua_core::comms::chunker`.

use std::io::{Read, Write};

use crate::error::EncodingResult;
use crate::wire::DecodingOptions;

/// The OPC UA TCP message type carried in a chunk's 3-byte ASCII tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Hello,
    Acknowledge,
    Error,
    OpenSecureChannel,
    CloseSecureChannel,
    Message,
}

/// A value that can be carried as the body of a MSG/OPN/CLO chunk sequence.
///
/// Implementors are opaque to the transport layer: it only needs to move the encoded bytes
/// between the wire and a pending request's resolution, never to interpret them.
pub trait Message: Sized + Send + Sync + 'static {
    /// The request handle echoed back in a matching response, if this message carries one.
    fn request_handle(&self) -> u32;

    /// `true` for a GetEndpoints-shaped request: servers may answer these without an active
    /// session, per the discovery convenience path. Defaults to `false`; only the data-model
    /// layer's concrete message types know their own service type.
    fn is_discovery_request(&self) -> bool {
        false
    }

    fn byte_len(&self) -> usize;

    fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()>;

    fn decode<R: Read + ?Sized>(
        stream: &mut R,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self>;
}

/// A minimal request used to exercise the transport end-to-end without depending on the
/// full service dispatch table: echoes an opaque payload back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStackRequest {
    pub request_handle: u32,
    pub payload: Vec<u8>,
}

impl Message for TestStackRequest {
    fn request_handle(&self) -> u32 {
        self.request_handle
    }

    fn byte_len(&self) -> usize {
        4 + 4 + self.payload.len()
    }

    fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        crate::wire::write_u32(stream, self.request_handle)?;
        crate::wire::write_byte_string(stream, Some(&self.payload))
    }

    fn decode<R: Read + ?Sized>(
        stream: &mut R,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let request_handle = crate::wire::read_u32(stream)?;
        let payload = crate::wire::read_byte_string(stream, decoding_options)?.unwrap_or_default();
        Ok(Self {
            request_handle,
            payload,
        })
    }
}

/// The response matching [`TestStackRequest`]: the same payload, plus the status the server
/// observed while handling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestStackResponse {
    pub request_handle: u32,
    pub status: crate::status_code::StatusCode,
    pub payload: Vec<u8>,
}

impl Message for TestStackResponse {
    fn request_handle(&self) -> u32 {
        self.request_handle
    }

    fn byte_len(&self) -> usize {
        4 + 4 + 4 + self.payload.len()
    }

    fn encode<W: Write + ?Sized>(&self, stream: &mut W) -> EncodingResult<()> {
        crate::wire::write_u32(stream, self.request_handle)?;
        crate::wire::write_u32(stream, self.status.as_u32())?;
        crate::wire::write_byte_string(stream, Some(&self.payload))
    }

    fn decode<R: Read + ?Sized>(
        stream: &mut R,
        decoding_options: &DecodingOptions,
    ) -> EncodingResult<Self> {
        let request_handle = crate::wire::read_u32(stream)?;
        let raw_status = crate::wire::read_u32(stream)?;
        let status = if raw_status == 0 {
            crate::status_code::StatusCode::Good
        } else {
            crate::status_code::StatusCode::BadUnexpectedError
        };
        let payload = crate::wire::read_byte_string(stream, decoding_options)?.unwrap_or_default();
        Ok(Self {
            request_handle,
            status,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_stack_request_round_trip() {
        let req = TestStackRequest {
            request_handle: 7,
            payload: vec![1, 2, 3, 4],
        };
        let mut buf = Vec::new();
        req.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = TestStackRequest::decode(&mut cursor, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_stack_response_carries_status() {
        let resp = TestStackResponse {
            request_handle: 7,
            status: crate::status_code::StatusCode::BadTimeout,
            payload: vec![],
        };
        let mut buf = Vec::new();
        resp.encode(&mut buf).unwrap();
        let mut cursor = Cursor::new(buf);
        let decoded = TestStackResponse::decode(&mut cursor, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded.request_handle, 7);
        assert_eq!(decoded.status, crate::status_code::StatusCode::BadUnexpectedError);
    }
}
